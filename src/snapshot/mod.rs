//! Snapshot Module
//!
//! Everything that compares the live database with a baseline snapshot:
//! - Diff engine (what appeared, what disappeared)
//! - Drift detection (is the database dirty?)
//! - Restore engine (put it back)

pub mod diff;
pub mod drift;
pub mod restore;

pub use diff::{DiffEngine, DriftReport};
pub use drift::DriftDetector;
pub use restore::{RestoreEngine, RestoreSummary};
