// This module defines error types for the wavesel instruction selector using the
// thiserror crate for idiomatic Rust error handling. SelectError is the single fatal
// error taxonomy of the crate: UnsupportedLowering is raised when a value width /
// register file / target capability combination reaches a leaf emission point with no
// defined lowering rule, and BrokenInvariant when an internal structural invariant of
// the control-flow reconstruction is violated. Both abort the compile of the current
// shader function; there is no retry or partial-result path. The module also provides
// SelectResult<T> as a convenience alias for Result<T, SelectError>.

//! Error types for the instruction selector.
//!
//! Using thiserror for more idiomatic error handling.

use thiserror::Error;

use super::reg::RegFile;

/// Fatal errors raised during instruction selection.
///
/// Every variant aborts the compile of the current shader function. These
/// are compiler-internal diagnostics: the structured input is always
/// produced by the front end, so a `SelectError` indicates a missing
/// lowering rule or a selector bug, never bad user input.
#[derive(Error, Debug)]
pub enum SelectError {
    #[error("no lowering for {what}: {bits}-bit {file:?} value ({components} components)")]
    UnsupportedLowering {
        what: &'static str,
        file: RegFile,
        bits: u32,
        components: u32,
    },

    #[error("control flow invariant violated: {reason}")]
    BrokenInvariant { reason: String },
}

impl SelectError {
    /// Shorthand for structural invariant violations.
    pub fn invariant(reason: impl Into<String>) -> Self {
        SelectError::BrokenInvariant {
            reason: reason.into(),
        }
    }
}

/// Result type alias for selection operations.
pub type SelectResult<T> = Result<T, SelectError>;
