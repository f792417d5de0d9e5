//! Error taxonomy.
//!
//! The core has no runtime failure modes: every violation is a broken
//! precondition, reported through [`PrecondViolation`] — a panic in debug
//! builds, clamped or ignored in release. `Result`s appear only at the
//! serialisation boundary.

use thiserror::Error;

/// Catch-all error for the serialisation boundary.
#[derive(Debug, Error)]
pub enum Error {
    /// An error that originates in this crate.
    #[error("{0}")]
    General(String),
    /// Stream read/write failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Error that does not originate from this crate.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Shorthand result for the serialisation boundary.
pub type Result<T> = std::result::Result<T, Error>;

/// The kind of precondition that was violated.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PrecondKind {
    /// A position was outside the grid bounds.
    OutOfBounds,
    /// A zero-layer delta exceeded one grid unit in magnitude.
    DeltaTooLarge,
    /// A point was tracked in a layer that disagrees with `round(iso)`.
    DegenerateLayer,
    /// The raycast Newton iteration failed to converge within its cap.
    RayIter,
}

/// A violated precondition: position, kind and free-form context.
///
/// Debug builds panic with this as the message; release builds clamp
/// (deltas) or proceed (ray iteration cap).
#[derive(Clone, Debug, Error)]
#[error("{kind:?} at {pos:?}: {ctx}")]
pub struct PrecondViolation {
    /// What went wrong.
    pub kind: PrecondKind,
    /// The offending position, as loose coordinates.
    pub pos: Vec<f32>,
    /// Human-readable context.
    pub ctx: String,
}

impl PrecondViolation {
    /// Builds a violation record from integer coordinates.
    #[must_use]
    pub fn at<const D: usize>(
        kind: PrecondKind,
        pos: crate::vector::VecD<i32, D>,
        ctx: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            pos: pos.0.iter().map(|&c| c as f32).collect(),
            ctx: ctx.into(),
        }
    }

    /// Builds a violation record from real-valued coordinates.
    #[must_use]
    pub fn at_f32<const D: usize>(
        kind: PrecondKind,
        pos: crate::vector::VecD<f32, D>,
        ctx: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            pos: pos.0.to_vec(),
            ctx: ctx.into(),
        }
    }
}
