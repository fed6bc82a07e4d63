mod batch;

pub use kpconv_kdtree::*;

pub use self::batch::*;
