// =============================================================================
// Shared enums and small value types used across the orchestrator
// =============================================================================

use serde::{Deserialize, Serialize};

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    /// The upstream wire value for opening a position in this direction.
    pub fn upstream_side(self) -> &'static str {
        match self {
            Side::Long => "BUY",
            Side::Short => "SELL",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Order type requested at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderType {
    Market,
    Limit,
}

/// Lifecycle state of an `Order`. Transitions: Pending -> Open -> Closed,
/// or Pending -> Cancelled. No reverse transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Open,
    Closed,
    Cancelled,
}

/// Action requested by an inbound trading signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    OpenLong,
    OpenShort,
    Close,
    CloseAll,
}

impl SignalAction {
    pub fn side(self) -> Option<Side> {
        match self {
            SignalAction::OpenLong => Some(Side::Long),
            SignalAction::OpenShort => Some(Side::Short),
            SignalAction::Close | SignalAction::CloseAll => None,
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, SignalAction::OpenLong | SignalAction::OpenShort)
    }

    pub fn is_close(self) -> bool {
        matches!(self, SignalAction::Close | SignalAction::CloseAll)
    }
}

/// The EventBus's fixed channel lexicon. Every subscriber's membership is
/// also mirrored into `All`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Dashboard,
    Trading,
    Positions,
    Sessions,
    All,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Dashboard,
        Channel::Trading,
        Channel::Positions,
        Channel::Sessions,
        Channel::All,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Dashboard => "dashboard",
            Channel::Trading => "trading",
            Channel::Positions => "positions",
            Channel::Sessions => "sessions",
            Channel::All => "all",
        }
    }

    pub fn parse(s: &str) -> Option<Channel> {
        Channel::ALL.into_iter().find(|c| c.as_str() == s)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_parse_round_trips_every_variant() {
        for c in Channel::ALL {
            assert_eq!(Channel::parse(c.as_str()), Some(c));
        }
    }

    #[test]
    fn channel_parse_rejects_unknown_names() {
        assert_eq!(Channel::parse("nonexistent"), None);
    }

    #[test]
    fn open_actions_map_to_a_side() {
        assert_eq!(SignalAction::OpenLong.side(), Some(Side::Long));
        assert_eq!(SignalAction::OpenShort.side(), Some(Side::Short));
        assert!(SignalAction::OpenLong.is_open());
        assert!(!SignalAction::OpenLong.is_close());
    }

    #[test]
    fn close_actions_have_no_side() {
        assert_eq!(SignalAction::Close.side(), None);
        assert_eq!(SignalAction::CloseAll.side(), None);
        assert!(SignalAction::CloseAll.is_close());
        assert!(!SignalAction::CloseAll.is_open());
    }
}
