//! Engine module: one-sided verbs over a window
//!
//! - **RmaEngine**: put/get plus the lock-serialized accumulating verbs
//! - **RmaRequest**: always-complete handle of the request-based variants
//! - **EngineStats**: per-engine counters

mod request;
mod stats;
mod verbs;

pub use request::RmaRequest;
pub use stats::EngineStats;
pub use verbs::{RmaEngine, Target};
