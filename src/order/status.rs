use serde::{Deserialize, Serialize};

/// Order lifecycle as seen by students, parents and kitchen staff.
///
/// ```text
/// PENDING ──► CONFIRMED ──► PREPARING ──► READY ──► OUT_FOR_DELIVERY ──► DELIVERED
///    │            │             │           │  └────────────────────────────▲
///    └────────────┴─────────────┴───────────┴──────────┴──► CANCELLED
/// ```
///
/// `Delivered` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    Ready,
    OutForDelivery,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [Self; 7] = [
        Self::Pending,
        Self::Confirmed,
        Self::Preparing,
        Self::Ready,
        Self::OutForDelivery,
        Self::Delivered,
        Self::Cancelled,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Preparing => "PREPARING",
            Self::Ready => "READY",
            Self::OutForDelivery => "OUT_FOR_DELIVERY",
            Self::Delivered => "DELIVERED",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub const fn allowed_transitions(self) -> &'static [Self] {
        match self {
            Self::Pending => &[Self::Confirmed, Self::Cancelled],
            Self::Confirmed => &[Self::Preparing, Self::Cancelled],
            Self::Preparing => &[Self::Ready, Self::Cancelled],
            Self::Ready => &[Self::OutForDelivery, Self::Delivered, Self::Cancelled],
            Self::OutForDelivery => &[Self::Delivered, Self::Cancelled],
            Self::Delivered | Self::Cancelled => &[],
        }
    }

    pub fn can_transition_to(self, next: Self) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }

    /// Kitchen work has not started yet, so the order can still be withdrawn
    /// by the customer.
    pub const fn is_cancellable(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed | Self::Preparing)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseOrderStatusError {
    #[error(
        "Invalid order status: '{0}'. Expected one of: PENDING, CONFIRMED, PREPARING, READY, OUT_FOR_DELIVERY, DELIVERED, CANCELLED"
    )]
    InvalidStatus(String),
}

impl std::str::FromStr for OrderStatus {
    type Err = ParseOrderStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "CONFIRMED" => Ok(Self::Confirmed),
            "PREPARING" => Ok(Self::Preparing),
            "READY" => Ok(Self::Ready),
            "OUT_FOR_DELIVERY" => Ok(Self::OutForDelivery),
            "DELIVERED" => Ok(Self::Delivered),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(ParseOrderStatusError::InvalidStatus(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn any_status() -> impl Strategy<Value = OrderStatus> {
        proptest::sample::select(OrderStatus::ALL.to_vec())
    }

    #[test]
    fn test_transition_table() {
        use OrderStatus::{
            Cancelled, Confirmed, Delivered, OutForDelivery, Pending, Preparing, Ready,
        };

        assert_eq!(Pending.allowed_transitions(), &[Confirmed, Cancelled]);
        assert_eq!(Confirmed.allowed_transitions(), &[Preparing, Cancelled]);
        assert_eq!(Preparing.allowed_transitions(), &[Ready, Cancelled]);
        assert_eq!(
            Ready.allowed_transitions(),
            &[OutForDelivery, Delivered, Cancelled]
        );
        assert_eq!(OutForDelivery.allowed_transitions(), &[Delivered, Cancelled]);
        assert!(Delivered.allowed_transitions().is_empty());
        assert!(Cancelled.allowed_transitions().is_empty());
    }

    #[test]
    fn test_cannot_skip_kitchen_steps() {
        assert!(!OrderStatus::Pending.can_transition_to(OrderStatus::Preparing));
        assert!(!OrderStatus::Confirmed.can_transition_to(OrderStatus::Ready));
        assert!(!OrderStatus::Preparing.can_transition_to(OrderStatus::Delivered));
    }

    #[test]
    fn test_no_self_transitions() {
        for status in OrderStatus::ALL {
            assert!(!status.can_transition_to(status), "{status} -> {status}");
        }
    }

    #[test]
    fn test_cancellable_states() {
        let cancellable: Vec<_> = OrderStatus::ALL
            .into_iter()
            .filter(|s| s.is_cancellable())
            .collect();
        assert_eq!(
            cancellable,
            vec![
                OrderStatus::Pending,
                OrderStatus::Confirmed,
                OrderStatus::Preparing
            ]
        );
    }

    #[test]
    fn test_parse_round_trip_and_serde() {
        for status in OrderStatus::ALL {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
    }

    #[test]
    fn test_parse_invalid_status() {
        let err = "SHIPPED".parse::<OrderStatus>().unwrap_err();
        assert!(err.to_string().contains("'SHIPPED'"));
    }

    proptest! {
        #[test]
        fn prop_terminal_states_reject_everything(target in any_status()) {
            prop_assert!(!OrderStatus::Delivered.can_transition_to(target));
            prop_assert!(!OrderStatus::Cancelled.can_transition_to(target));
        }

        #[test]
        fn prop_walks_only_follow_the_table(steps in proptest::collection::vec(any_status(), 0..20)) {
            let mut current = OrderStatus::Pending;
            for next in steps {
                if current.can_transition_to(next) {
                    prop_assert!(current.allowed_transitions().contains(&next));
                    current = next;
                } else {
                    prop_assert!(!current.allowed_transitions().contains(&next));
                }
            }
            if current.is_terminal() {
                prop_assert!(current.allowed_transitions().is_empty());
            }
        }
    }
}
