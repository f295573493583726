// =============================================================================
// Shared types used across the envelope trading engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Canonical instrument key: the 6-character ticker with any leading
/// alphabetic prefix stripped (the brokerage prefixes holdings with "A").
pub fn canonical_code(raw: &str) -> String {
    raw.trim()
        .trim_start_matches(|c: char| c.is_ascii_alphabetic())
        .to_string()
}

/// Direction of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// Limit or market pricing for an outbound order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceKind {
    Limit,
    Market,
}

/// Which brokerage server the session is connected to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Real,
    Paper,
}

impl std::fmt::Display for ServerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Real => write!(f, "real"),
            Self::Paper => write!(f, "paper"),
        }
    }
}

/// Named rung of the pre-placed sell ladder.
///
/// The serialized labels are the Korean strings the state file has always
/// used, so existing JSON documents keep loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetName {
    #[serde(rename = "익절1")]
    Profit1,
    #[serde(rename = "익절2")]
    Profit2,
    #[serde(rename = "익절3")]
    Profit3,
    #[serde(rename = "MA")]
    MovingAverage,
    #[serde(rename = "스탑로스")]
    StopLoss,
}

impl TargetName {
    /// The three profit rungs in ladder order.
    pub const PROFIT_RUNGS: [TargetName; 3] = [Self::Profit1, Self::Profit2, Self::Profit3];

    /// Stable label as persisted in the state file.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Profit1 => "익절1",
            Self::Profit2 => "익절2",
            Self::Profit3 => "익절3",
            Self::MovingAverage => "MA",
            Self::StopLoss => "스탑로스",
        }
    }

    /// Parse a persisted label back into a rung name.
    pub fn from_label(label: &str) -> Option<Self> {
        match label {
            "익절1" => Some(Self::Profit1),
            "익절2" => Some(Self::Profit2),
            "익절3" => Some(Self::Profit3),
            "MA" => Some(Self::MovingAverage),
            "스탑로스" => Some(Self::StopLoss),
            _ => None,
        }
    }
}

impl std::fmt::Display for TargetName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_code_strips_prefix() {
        assert_eq!(canonical_code("A005930"), "005930");
        assert_eq!(canonical_code("005930"), "005930");
        assert_eq!(canonical_code(" A005930 "), "005930");
    }

    #[test]
    fn target_labels_roundtrip() {
        for t in [
            TargetName::Profit1,
            TargetName::Profit2,
            TargetName::Profit3,
            TargetName::MovingAverage,
            TargetName::StopLoss,
        ] {
            assert_eq!(TargetName::from_label(t.label()), Some(t));
        }
        assert_eq!(TargetName::from_label("20일선"), None);
    }

    #[test]
    fn target_serializes_as_korean_label() {
        let json = serde_json::to_string(&TargetName::Profit1).unwrap();
        assert_eq!(json, "\"익절1\"");
        let parsed: TargetName = serde_json::from_str("\"스탑로스\"").unwrap();
        assert_eq!(parsed, TargetName::StopLoss);
    }

    #[test]
    fn side_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&OrderSide::Buy).unwrap(), "\"buy\"");
        assert_eq!(
            serde_json::from_str::<OrderSide>("\"sell\"").unwrap(),
            OrderSide::Sell
        );
    }
}
