use std::{f64::consts::PI, fmt, fs, path::Path, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::{KpConvError, Result};

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident => $error:ident { $($variant:ident => $text:literal),* $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "&'static str")]
        pub enum $name {
            $($variant),*
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),*
                }
            }
        }

        impl FromStr for $name {
            type Err = KpConvError;

            fn from_str(s: &str) -> Result<Self> {
                match s {
                    $($text => Ok(Self::$variant),)*
                    _ => Err(KpConvError::$error(s.to_owned())),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = KpConvError;

            fn try_from(s: String) -> Result<Self> {
                s.parse()
            }
        }

        impl From<$name> for &'static str {
            fn from(value: $name) -> Self {
                value.as_str()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_enum! {
    /// Distance-to-weight mapping between a neighbor and a kernel point.
    Influence => UnknownInfluence {
        Constant => "constant",
        Linear => "linear",
        Gaussian => "gaussian",
    }
}

string_enum! {
    /// How kernel point weights are combined for a single neighbor.
    Aggregation => UnknownAggregation {
        Sum => "sum",
        Closest => "closest",
    }
}

string_enum! {
    FixedKernelPoints => UnknownFixedKernelPoints {
        None => "none",
        Center => "center",
        Verticals => "verticals",
    }
}

string_enum! {
    RotationAugment => UnknownRotation {
        Vertical => "vertical",
        None => "none",
    }
}

string_enum! {
    /// Regularization applied to deformed kernel points.
    OffsetLoss => UnknownOffsetLoss {
        None => "none",
        Permissive => "permissive",
        Fitting => "fitting",
    }
}

pub const FEATURE_DIMS: [usize; 6] = [1, 2, 3, 4, 5, 7];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KpConvConfig {
    pub architecture: Vec<String>,
    pub num_kernel_points: usize,
    pub in_points_dim: usize,
    #[serde(rename = "KP_extent", alias = "kp_extent")]
    pub kp_extent: f64,
    pub conv_radius: f64,
    pub fixed_kernel_points: FixedKernelPoints,
    #[serde(rename = "KP_influence", alias = "kp_influence")]
    pub kp_influence: Influence,
    pub aggregation_mode: Aggregation,
    pub modulated: bool,
    pub use_batch_norm: bool,
    pub batch_norm_momentum: f64,
    pub first_subsampling_dl: f64,
    pub density_parameter: f64,
    pub num_layers: usize,
    pub in_features_dim: usize,
    pub first_features_dim: usize,
    pub num_classes: usize,
    pub ignored_label_inds: Vec<usize>,
    pub augment_rotation: RotationAugment,
    pub augment_scale_min: f64,
    pub augment_scale_max: f64,
    pub augment_scale_anisotropic: bool,
    pub augment_symmetries: [bool; 3],
    pub augment_noise: f64,
    pub augment_color: f64,
    pub epoch_steps: usize,
    pub batch_num: usize,
    pub in_radius: f64,
    pub batch_limit: usize,
    pub use_potentials: bool,
    pub offsets_loss: OffsetLoss,
    pub offsets_decay: f64,
    pub seed: u64,
    pub augment_seed: u64,
}

impl Default for KpConvConfig {
    fn default() -> Self {
        let architecture = [
            "simple",
            "resnetb",
            "resnetb_strided",
            "resnetb",
            "resnetb",
            "resnetb_strided",
            "resnetb",
            "resnetb",
            "resnetb_strided",
            "resnetb",
            "resnetb",
            "resnetb_strided",
            "resnetb",
            "nearest_upsample",
            "unary",
            "nearest_upsample",
            "unary",
            "nearest_upsample",
            "unary",
            "nearest_upsample",
            "unary",
        ];
        KpConvConfig {
            architecture: architecture.into_iter().map(String::from).collect(),
            num_kernel_points: 15,
            in_points_dim: 3,
            kp_extent: 1.2,
            conv_radius: 2.5,
            fixed_kernel_points: FixedKernelPoints::Center,
            kp_influence: Influence::Linear,
            aggregation_mode: Aggregation::Sum,
            modulated: false,
            use_batch_norm: true,
            batch_norm_momentum: 0.99,
            first_subsampling_dl: 0.06,
            density_parameter: 5.0,
            num_layers: 5,
            in_features_dim: 1,
            first_features_dim: 128,
            num_classes: 13,
            ignored_label_inds: Vec::new(),
            augment_rotation: RotationAugment::Vertical,
            augment_scale_min: 0.9,
            augment_scale_max: 1.1,
            augment_scale_anisotropic: true,
            augment_symmetries: [true, false, false],
            augment_noise: 0.001,
            augment_color: 0.8,
            epoch_steps: 500,
            batch_num: 6,
            in_radius: 1.5,
            batch_limit: 5000,
            use_potentials: false,
            offsets_loss: OffsetLoss::Fitting,
            offsets_decay: 0.01,
            seed: 42,
            augment_seed: 7,
        }
    }
}

impl KpConvConfig {
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if !FEATURE_DIMS.contains(&self.in_features_dim) {
            return Err(KpConvError::UnsupportedFeatureDim(self.in_features_dim));
        }
        if self.num_kernel_points == 0 || self.in_points_dim == 0 {
            return Err(KpConvError::InvalidConfig(
                "num_kernel_points and in_points_dim must be positive".into(),
            ));
        }
        let positive = [
            ("KP_extent", self.kp_extent),
            ("conv_radius", self.conv_radius),
            ("first_subsampling_dl", self.first_subsampling_dl),
            ("density_parameter", self.density_parameter),
            ("in_radius", self.in_radius),
        ];
        if let Some((name, value)) = positive.iter().find(|(_, value)| !(*value > 0.)) {
            return Err(KpConvError::InvalidConfig(format!(
                "{name} must be positive, got {value}"
            )));
        }
        if self.augment_scale_min > self.augment_scale_max {
            return Err(KpConvError::InvalidConfig(format!(
                "augment_scale_min {} is larger than augment_scale_max {}",
                self.augment_scale_min, self.augment_scale_max
            )));
        }
        if self.first_features_dim == 0 || self.batch_limit == 0 {
            return Err(KpConvError::InvalidConfig(
                "first_features_dim and batch_limit must be positive".into(),
            ));
        }
        if self.num_output_classes() == 0 {
            return Err(KpConvError::InvalidConfig(
                "no class left once ignored labels are removed".into(),
            ));
        }
        self.check_equivariant_widths()?;
        let layers = self.encoder_layers();
        if layers != self.num_layers {
            return Err(KpConvError::LayerCount {
                expected: self.num_layers,
                actual: layers,
            });
        }
        Ok(())
    }

    /// Number of resolutions the encoder part of `architecture` walks through.
    pub fn encoder_layers(&self) -> usize {
        1 + { self.architecture.iter() }
            .take_while(|block| !block.contains("upsample") && !block.contains("global"))
            .filter(|block| block.contains("pool") || block.contains("strided"))
            .count()
    }

    /// Equivariant convolutions split their width in three.
    pub fn check_equivariant_widths(&self) -> Result<()> {
        let mut out_dim = self.first_features_dim;
        for block in &self.architecture {
            if block.contains("upsample") {
                break;
            }
            if block.contains("equivariant") && out_dim % 3 != 0 {
                return Err(KpConvError::EquivariantWidth(out_dim));
            }
            if block.contains("pool") || block.contains("strided") {
                out_dim *= 2;
            }
        }
        Ok(())
    }

    /// Convolution radius of the first layer.
    #[inline]
    pub fn first_radius(&self) -> f64 {
        self.first_subsampling_dl * self.conv_radius
    }

    /// High-probability bound on the number of neighbors in a convolution
    /// ball, from the density parameter.
    pub fn neighborhood_limit(&self) -> usize {
        (4. / 3. * PI * (self.density_parameter + 1.).powi(3)).ceil() as usize
    }

    pub fn neighborhood_limits(&self) -> Vec<usize> {
        vec![self.neighborhood_limit(); self.num_layers]
    }

    /// Number of logits per point.
    pub fn num_output_classes(&self) -> usize {
        let ignored = { self.ignored_label_inds.iter() }
            .filter(|&&label| label < self.num_classes)
            .count();
        self.num_classes - ignored
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = KpConvConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.encoder_layers(), 5);
        assert_eq!(config.neighborhood_limit(), 905);
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("gaussian".parse::<Influence>().unwrap(), Influence::Gaussian);
        assert_eq!("closest".parse::<Aggregation>().unwrap(), Aggregation::Closest);
        assert!(matches!(
            "cubic".parse::<Influence>(),
            Err(KpConvError::UnknownInfluence(name)) if name == "cubic"
        ));
        assert!(matches!(
            "max".parse::<Aggregation>(),
            Err(KpConvError::UnknownAggregation(_))
        ));
        assert!(matches!(
            "horizontal".parse::<RotationAugment>(),
            Err(KpConvError::UnknownRotation(_))
        ));
    }

    #[test]
    fn test_from_json() {
        let config = KpConvConfig::from_json_str(
            r#"{
                "architecture": ["simple", "resnetb", "resnetb_strided", "resnetb", "nearest_upsample", "unary"],
                "num_layers": 2,
                "KP_extent": 1.0,
                "KP_influence": "gaussian",
                "aggregation_mode": "closest",
                "in_features_dim": 4
            }"#,
        )
        .unwrap();
        assert_eq!(config.kp_influence, Influence::Gaussian);
        assert_eq!(config.aggregation_mode, Aggregation::Closest);
        assert_eq!(config.kp_extent, 1.0);
        assert_eq!(config.num_kernel_points, 15);

        let err = KpConvConfig::from_json_str(r#"{"KP_influence": "cubic"}"#).unwrap_err();
        assert!(matches!(err, KpConvError::Json(_)));
        assert!(err.to_string().contains("cubic"));

        let err = KpConvConfig::from_json_str(r#"{"in_features_dim": 6}"#).unwrap_err();
        assert!(matches!(err, KpConvError::UnsupportedFeatureDim(6)));

        let err = KpConvConfig::from_json_str(r#"{"num_layers": 3}"#).unwrap_err();
        assert!(matches!(
            err,
            KpConvError::LayerCount {
                expected: 3,
                actual: 5
            }
        ));
    }

    #[test]
    fn test_equivariant_width() {
        let mut config = KpConvConfig {
            architecture: vec!["simple_equivariant".into(), "resnetb".into()],
            num_layers: 1,
            first_features_dim: 64,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(KpConvError::EquivariantWidth(64))
        ));
        config.first_features_dim = 96;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_path_round_trip() {
        let config = KpConvConfig {
            modulated: true,
            ignored_label_inds: vec![0],
            ..Default::default()
        };
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(config.to_json_string().unwrap().as_bytes())
            .unwrap();

        let loaded = KpConvConfig::from_path(file.path()).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.num_output_classes(), 12);
    }
}
