//! Ring discovery protocol
//!
//! [`DiscoveryEngine`] is the pure state machine; the async
//! [`RingNode`](crate::node::RingNode) feeds it and executes its actions.

pub mod engine;
pub mod events;

pub use engine::DiscoveryEngine;
pub use events::{Action, DiscoveryEvent};
