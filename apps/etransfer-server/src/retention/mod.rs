//! Retention and expiry
//!
//! Policies decide when a completed file is deleted; the sweep applies them
//! together with the always-on expiry of abandoned uploads.

mod guard;
mod policy;
mod sweep;

pub use guard::{DeleteGuard, ReadGuard, ReadGuards};
pub use policy::{resolve, RetentionKind, RetentionPolicy, RetentionRequest};
pub use sweep::{Disposition, RetentionSweeper, SweepReport};
