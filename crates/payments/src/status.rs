use serde::{Deserialize, Serialize};

/// Payment lifecycle as reported by the gateway.
///
/// - `Created`: gateway order exists, no payment attempt yet
/// - `Authorized`: payment authorized by the issuer, not yet captured
/// - `Captured`: funds captured, settlement will follow
/// - `Refunded`: captured funds returned
/// - `Failed`: attempt declined or errored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayStatus {
    Created,
    Authorized,
    Captured,
    Refunded,
    Failed,
}

impl GatewayStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Authorized => "authorized",
            Self::Captured => "captured",
            Self::Refunded => "refunded",
            Self::Failed => "failed",
        }
    }

    pub const fn is_captured(self) -> bool {
        matches!(self, Self::Captured)
    }

    pub const fn is_failed(self) -> bool {
        matches!(self, Self::Failed)
    }
}

impl std::fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseGatewayStatusError {
    #[error(
        "Invalid gateway status: '{0}'. Expected one of: created, authorized, captured, refunded, failed"
    )]
    InvalidStatus(String),
}

impl std::str::FromStr for GatewayStatus {
    type Err = ParseGatewayStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            // orders report "attempted"/"paid", payments report the rest
            "created" | "attempted" => Ok(Self::Created),
            "authorized" => Ok(Self::Authorized),
            "captured" | "paid" => Ok(Self::Captured),
            "refunded" => Ok(Self::Refunded),
            "failed" => Ok(Self::Failed),
            _ => Err(ParseGatewayStatusError::InvalidStatus(s.to_string())),
        }
    }
}
