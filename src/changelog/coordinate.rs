//! Resume coordinates.

use serde::{Deserialize, Serialize};

/// A consumption position callers persist to resume a partition later.
///
/// Coordinates are opaque to callers: they name the physical topic the
/// partition was consuming when the coordinate was taken, which may be a
/// version topic or a change-capture topic. Seeking to a coordinate
/// re-delivers the record at `offset`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChangeCoordinate {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl ChangeCoordinate {
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
        }
    }
}

impl std::fmt::Display for ChangeCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}@{}", self.topic, self.partition, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serde_round_trip() {
        let coordinate = ChangeCoordinate::new("orders_v3_cc", 2, 1041);
        let json = serde_json::to_string(&coordinate).unwrap();
        let restored: ChangeCoordinate = serde_json::from_str(&json).unwrap();
        assert_eq!(coordinate, restored);
    }

    #[test]
    fn test_display() {
        let coordinate = ChangeCoordinate::new("orders_v3", 0, 7);
        assert_eq!(coordinate.to_string(), "orders_v3-0@7");
    }

    #[test]
    fn test_ordering_is_total() {
        let a = ChangeCoordinate::new("orders_v3", 0, 7);
        let b = ChangeCoordinate::new("orders_v3", 0, 8);
        let c = ChangeCoordinate::new("orders_v3", 1, 0);
        assert!(a < b);
        assert!(b < c);
    }
}
