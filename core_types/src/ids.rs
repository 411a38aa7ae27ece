//! Unique identifiers for system entities

use serde::{Deserialize, Serialize};
use std::fmt;

/// Routing target of a message
///
/// A channel multiplexes many logical endpoints; the routing id selects one
/// of them. It occupies the upper 32 bits of a message id, so it is exactly
/// 32 bits wide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RoutingId(u32);

impl RoutingId {
    /// Routing id addressing the channel itself rather than an endpoint
    pub const CONTROL: RoutingId = RoutingId(u32::MAX);

    /// Creates a routing id from its raw value
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Checks if this id addresses the channel itself
    pub const fn is_control(self) -> bool {
        self.0 == u32::MAX
    }
}

impl From<u32> for RoutingId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for RoutingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_control() {
            write!(f, "Route(control)")
        } else {
            write!(f, "Route({})", self.0)
        }
    }
}
