//! Documented process exit codes.
//!
//! The conventions are shared with the black-box pipeline executables, so
//! the control plane can classify a job's declared exit code without
//! interpreting its products:
//!
//! - 0  normal
//! - 7  user interrupt
//! - 33 soft failure: not enough overlap inputs
//! - 64 configuration or precondition error
//! - 65 missing input file
//! - 66 checksum mismatch
//! - 67 registry query failure
//! - 68 checksum-computation I/O error
//!
//! Any other value >= 64 is a fatal precondition failure.

pub const NORMAL: i32 = 0;
pub const INTERRUPTED: i32 = 7;
pub const NOT_ENOUGH_INPUT: i32 = 33;
pub const CONFIG_ERROR: i32 = 64;
pub const MISSING_INPUT: i32 = 65;
pub const CHECKSUM_MISMATCH: i32 = 66;
pub const REGISTRY_FAILURE: i32 = 67;
pub const CHECKSUM_IO: i32 = 68;

/// Exit code for a core-domain error, for one-shot operations that must
/// surface the failure class to the calling shell.
pub fn for_core_error(err: &crate::error::Error) -> i32 {
    use crate::error::Error;
    match err {
        Error::MissingInputFile(_) => MISSING_INPUT,
        Error::ChecksumMismatch { .. } => CHECKSUM_MISMATCH,
        Error::ChecksumIo { .. } => CHECKSUM_IO,
        Error::Config(_) => CONFIG_ERROR,
        _ => CONFIG_ERROR,
    }
}
