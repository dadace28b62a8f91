//! Window module: the per-rank registration table and address translation
//!
//! Window creation and memory registration happen elsewhere; this module
//! only holds what they publish and turns displacements into addresses.

mod registration;
mod translate;

pub use registration::{EndpointAddr, NodeState, RankEntry, RemoteKey, Window, CACHELINE};
pub use translate::AddressTranslator;
