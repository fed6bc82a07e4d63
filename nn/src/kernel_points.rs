use std::f64::consts::PI;

use kpconv_common::{config::FixedKernelPoints, KpConvError, Result};
use nalgebra::{DMatrix, Matrix2, Matrix3, RealField, Rotation3, Unit, Vector3};
use rand::Rng;

const MEAN_RADIUS: f64 = 0.66;
const MAX_ITERATIONS: usize = 10000;
const GRADIENT_THRESHOLD: f64 = 1e-5;
const CLIP: f64 = 0.05;

/// Number of leading points whose position is pinned by `fixed`.
fn pinned(fixed: FixedKernelPoints) -> usize {
    match fixed {
        FixedKernelPoints::None => 0,
        FixedKernelPoints::Center | FixedKernelPoints::Verticals => 1,
    }
}

fn random_in_ball<R: Rng>(dimension: usize, rng: &mut R) -> Vec<f64> {
    loop {
        let point = { (0..dimension) }
            .map(|_| rng.gen::<f64>() * 2. - 1.)
            .collect::<Vec<_>>();
        if point.iter().map(|x| x * x).sum::<f64>() < 1. {
            return point;
        }
    }
}

/// Spreads `num_kpoints` points over the unit ball by minimizing a repulsive
/// potential between points plus an attractive one towards the center.
fn optimize<R: Rng>(
    num_kpoints: usize,
    dimension: usize,
    fixed: FixedKernelPoints,
    rng: &mut R,
) -> Vec<Vec<f64>> {
    let mut points = { (0..num_kpoints) }
        .map(|_| random_in_ball(dimension, rng))
        .collect::<Vec<_>>();

    match fixed {
        FixedKernelPoints::None => {}
        FixedKernelPoints::Center => points[0].fill(0.),
        FixedKernelPoints::Verticals => {
            points[..3].iter_mut().for_each(|p| p.fill(0.));
            points[1][2] = 2. / 3.;
            points[2][2] = -2. / 3.;
        }
    }

    let mut moving_factor = 1e-2;
    let mut last_norms: Option<Vec<f64>> = None;
    let mut grads = vec![vec![0.; dimension]; num_kpoints];

    for _ in 0..MAX_ITERATIONS {
        for (i, grad) in grads.iter_mut().enumerate() {
            // Attraction towards the center.
            grad.iter_mut()
                .zip(&points[i])
                .for_each(|(g, &x)| *g = 10. * x);
            let others = { points.iter().enumerate() }
                .filter(|&(j, _)| j != i)
                .map(|(_, other)| other);
            // Repulsion from every other point.
            for other in others {
                let diff = { other.iter().zip(&points[i]) }
                    .map(|(a, b)| a - b)
                    .collect::<Vec<_>>();
                let d2 = diff.iter().map(|x| x * x).sum::<f64>();
                let scale = 1. / (d2 * d2.sqrt() + 1e-6);
                grad.iter_mut().zip(&diff).for_each(|(g, d)| *g += d * scale);
            }
        }

        match fixed {
            FixedKernelPoints::None => {}
            FixedKernelPoints::Center => grads[0].fill(0.),
            // The vertical points may only slide along the last axis.
            FixedKernelPoints::Verticals => grads[..3]
                .iter_mut()
                .for_each(|g| g[..dimension - 1].fill(0.)),
        }

        let norms = { grads.iter() }
            .map(|g| g.iter().map(|x| x * x).sum::<f64>().sqrt())
            .collect::<Vec<_>>();

        let converged = last_norms.as_ref().map_or(false, |last| {
            let skip = if fixed == FixedKernelPoints::Verticals { 3 } else { 0 };
            { norms[skip..].iter().zip(&last[skip..]) }
                .map(|(a, b)| (a - b).abs())
                .fold(0., f64::max)
                < GRADIENT_THRESHOLD
        });
        if converged {
            break;
        }

        for (i, (point, grad)) in points.iter_mut().zip(&grads).enumerate() {
            if fixed == FixedKernelPoints::Verticals && i == 0 {
                continue;
            }
            let step = (moving_factor * norms[i]).min(CLIP);
            let scale = step / (norms[i] + 1e-6);
            point.iter_mut().zip(grad).for_each(|(x, g)| *x -= scale * g);
        }

        moving_factor *= 0.9995;
        last_norms = Some(norms);
    }

    points
}

fn random_rotation<R: Rng>(
    dimension: usize,
    fixed: FixedKernelPoints,
    rng: &mut R,
) -> Option<DMatrix<f64>> {
    match dimension {
        2 => {
            let theta = rng.gen::<f64>() * 2. * PI;
            let (s, c) = theta.sin_cos();
            let r = Matrix2::new(c, -s, s, c);
            Some(DMatrix::from_iterator(2, 2, r.iter().copied()))
        }
        3 if fixed == FixedKernelPoints::Verticals => {
            let theta = rng.gen::<f64>() * 2. * PI;
            let (s, c) = theta.sin_cos();
            let r = Matrix3::new(c, -s, 0., s, c, 0., 0., 0., 1.);
            Some(DMatrix::from_iterator(3, 3, r.iter().copied()))
        }
        3 => {
            let theta = rng.gen::<f64>() * 2. * PI;
            let phi = (rng.gen::<f64>() - 0.5) * PI;
            let axis = Vector3::new(phi.cos() * theta.cos(), phi.cos() * theta.sin(), phi.sin());
            let alpha = rng.gen::<f64>() * 2. * PI;
            let r = Rotation3::from_axis_angle(&Unit::new_normalize(axis), alpha);
            Some(DMatrix::from_iterator(3, 3, r.matrix().iter().copied()))
        }
        _ => None,
    }
}

/// Generates a `[num_kpoints, dimension]` kernel inside the ball of `radius`.
///
/// The arrangement is deterministic for a given `rng` state.
pub fn generate<T: RealField + Copy, R: Rng>(
    radius: T,
    num_kpoints: usize,
    dimension: usize,
    fixed: FixedKernelPoints,
    rng: &mut R,
) -> Result<DMatrix<T>> {
    let invalid = |reason| KpConvError::InvalidKernel {
        num_kpoints,
        dimension,
        reason,
    };
    if num_kpoints == 0 {
        return Err(invalid("no kernel point requested"));
    }
    if dimension == 0 {
        return Err(invalid("zero dimension"));
    }
    if fixed == FixedKernelPoints::Verticals && (dimension != 3 || num_kpoints < 3) {
        return Err(invalid("vertical kernel points need 3 dimensions and 3 points"));
    }

    let points = optimize(num_kpoints, dimension, fixed, rng);
    let mut kernel = DMatrix::from_fn(num_kpoints, dimension, |r, c| points[r][c]);

    let skip = pinned(fixed).min(num_kpoints - 1);
    let free = kernel.rows(skip, num_kpoints - skip);
    let mean_radius = free.row_iter().map(|row| row.norm()).sum::<f64>() / free.nrows() as f64;
    if mean_radius > 0. {
        kernel *= MEAN_RADIUS / mean_radius;
    }

    if let Some(rotation) = random_rotation(dimension, fixed, rng) {
        kernel = kernel * rotation;
    }

    Ok(kernel.map(|x| nalgebra::convert::<f64, T>(x) * radius))
}
