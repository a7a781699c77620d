//! Channel lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle of a channel.
///
/// ```text
/// Active <-> Paused
///   |          |
///   +-> Draining <-+
///   |      |
///   +------+--> Offline   (reachable from any state, never left)
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    /// Routable and running work
    #[default]
    Active,
    /// Holds its queue; starts nothing new
    Paused,
    /// Not routable; queued work finishes in place
    Draining,
    /// Hard stop; not routable and starts nothing new
    Offline,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Active => "active",
            ChannelState::Paused => "paused",
            ChannelState::Draining => "draining",
            ChannelState::Offline => "offline",
        }
    }

    /// Whether routing strategies may pick this channel
    pub fn is_routable(&self) -> bool {
        matches!(self, ChannelState::Active)
    }

    /// Whether an explicit enqueue is accepted
    pub fn accepts_enqueue(&self) -> bool {
        matches!(self, ChannelState::Active | ChannelState::Paused)
    }

    /// Whether moving to `to` is allowed. Staying put always is.
    pub fn can_transition_to(&self, to: ChannelState) -> bool {
        use ChannelState::*;
        if *self == to {
            return true;
        }
        matches!(
            (self, to),
            (_, Offline) | (Active, Paused) | (Paused, Active) | (Active, Draining) | (Paused, Draining)
        )
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
