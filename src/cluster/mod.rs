//! Cluster membership policy
//!
//! Failure detection and join admission, the two decisions the discovery
//! engine delegates behind traits.

pub mod failure_detection;
pub mod join;

pub use failure_detection::*;
pub use join::*;
