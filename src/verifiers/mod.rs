//! Checks applied to a single verification record, in the order the
//! orchestrator runs them.

pub mod certificate;
pub mod checkpoint;
pub mod sct;
pub mod timestamp;
pub mod tlog;
