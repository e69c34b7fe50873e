//! Core domain types and shared logic for the Nocturn pipeline control plane.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Sky coordinates and footprint geometry
//! - Hierarchical spatial tags (nested equal-area pixelization)
//! - The sky tessellation index (tile lookup and bounds)
//! - Job lifecycle states and process exit codes
//! - Product-file checksums
//! - Configuration types

pub mod checksum;
pub mod config;
pub mod coord;
pub mod error;
pub mod exitcode;
pub mod job;
pub mod tags;
pub mod tessellation;

pub use checksum::{md5_file, verify_file_checksum};
pub use coord::{Footprint, SkyCoord};
pub use error::{Error, Result};
pub use job::{JobOutcome, JobStatus};
pub use tags::{COARSE_TAG_LEVEL, FINE_TAG_LEVEL, disc_cover, nested_tag};
pub use tessellation::{SkyTile, TessellationIndex, TileId};

/// Default initial cone-search radius for overlap selection, in degrees.
///
/// Intentionally larger than one sky tile so that corner-only overlaps are
/// not missed by the cone stage.
pub const DEFAULT_CONE_SEARCH_RADIUS_DEG: f64 = 0.18;

/// Exit code a pipeline job reports when the overlap selector could not
/// assemble enough inputs. Soft failure: excluded from failure alerting.
pub const EXIT_NOT_ENOUGH_INPUT: i32 = 33;
