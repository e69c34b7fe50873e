//! Repository traits for registry operations.

pub mod calibrated;
pub mod diffimages;
pub mod exposures;
pub mod jobs;
pub mod refimages;
pub mod tiles;

pub use calibrated::{CalImageRepo, NewCalImage};
pub use diffimages::{DiffImageRepo, NewDiffImage};
pub use exposures::{ExposureRepo, NewExposure};
pub use jobs::{JobRepo, NewJob};
pub use refimages::{NewRefImage, RefImageRepo};
pub use tiles::load_sky_tiles;
