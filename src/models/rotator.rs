use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MagpieError, Result};

use super::proxy::Protocol;
use super::statistic::ReputationLabel;

pub const ROTATOR_NAME_MAX_LENGTH: usize = 120;

/// Transport a rotator speaks on one of its sides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    Tcp,
    Quic,
    Http3,
}

impl TransportProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "tcp",
            TransportProtocol::Quic => "quic",
            TransportProtocol::Http3 => "http3",
        }
    }

    /// Parse, defaulting anything unknown (or empty) to TCP
    pub fn normalize(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "quic" => TransportProtocol::Quic,
            "http3" => TransportProtocol::Http3,
            _ => TransportProtocol::Tcp,
        }
    }

    pub fn is_quic_based(&self) -> bool {
        matches!(self, TransportProtocol::Quic | TransportProtocol::Http3)
    }
}

impl std::fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction of the rotator uptime filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UptimeFilterKind {
    Min,
    Max,
}

impl UptimeFilterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UptimeFilterKind::Min => "min",
            UptimeFilterKind::Max => "max",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "min" => Some(UptimeFilterKind::Min),
            "max" => Some(UptimeFilterKind::Max),
            _ => None,
        }
    }
}

/// Uptime filter, percentage quantized to 0.1
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UptimeFilter {
    pub kind: UptimeFilterKind,
    pub percentage: f64,
}

impl UptimeFilter {
    /// Validate the raw request fields. Both absent disables the filter;
    /// one without the other is an error.
    pub fn validate(kind: Option<&str>, percentage: Option<f64>) -> Result<Option<Self>> {
        let kind = kind.map(str::trim).filter(|s| !s.is_empty());

        match (kind, percentage) {
            (None, None) => Ok(None),
            (None, Some(_)) => Err(MagpieError::Validation(
                "uptime filter type is required when uptime percentage is set".into(),
            )),
            (Some(_), None) => Err(MagpieError::Validation(
                "uptime percentage is required when uptime filter type is set".into(),
            )),
            (Some(raw_kind), Some(value)) => {
                let kind = UptimeFilterKind::from_str(raw_kind).ok_or_else(|| {
                    MagpieError::Validation("uptime filter type must be either min or max".into())
                })?;

                if !value.is_finite() || !(0.0..=100.0).contains(&value) {
                    return Err(MagpieError::Validation(
                        "uptime percentage must be between 0 and 100".into(),
                    ));
                }

                Ok(Some(UptimeFilter {
                    kind,
                    percentage: round1(value),
                }))
            }
        }
    }
}

/// Quantize a percentage to one decimal place. Thresholds and computed
/// uptimes must pass through the same quantization.
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

impl UptimeFilter {
    /// Whether a quantized uptime passes this filter
    pub fn matches(&self, uptime: f64) -> bool {
        match self.kind {
            UptimeFilterKind::Min => uptime >= self.percentage,
            UptimeFilterKind::Max => uptime <= self.percentage,
        }
    }
}

/// A per-tenant rotating proxy listener
#[derive(Debug, Clone)]
pub struct RotatingProxy {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    pub instance_id: String,
    pub instance_name: String,
    pub instance_region: String,
    /// Upstream protocol proxied through
    pub protocol: Protocol,
    /// Protocol spoken to the client
    pub listen_protocol: Protocol,
    pub transport: TransportProtocol,
    pub listen_transport: TransportProtocol,
    pub uptime_filter: Option<UptimeFilter>,
    pub listen_port: u16,
    pub auth_required: bool,
    pub auth_username: String,
    pub auth_password: String,
    pub reputation_labels: Vec<ReputationLabel>,
    pub last_proxy_id: Option<i64>,
    pub last_rotation_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl RotatingProxy {
    /// SOCKS listeners speak a raw TCP state machine and cannot ride QUIC
    pub fn listen_config_valid(&self) -> bool {
        !(self.listen_protocol.is_socks() && self.listen_transport.is_quic_based())
    }
}

/// Rotator creation payload from the control plane
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRotatorRequest {
    pub user_id: i64,
    pub name: String,
    pub protocol: String,
    #[serde(default)]
    pub listen_protocol: Option<String>,
    #[serde(default)]
    pub transport_protocol: Option<String>,
    #[serde(default)]
    pub listen_transport_protocol: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(default)]
    pub uptime_filter_type: Option<String>,
    #[serde(default)]
    pub uptime_percentage: Option<f64>,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub auth_username: Option<String>,
    #[serde(default)]
    pub auth_password: Option<String>,
    #[serde(default)]
    pub reputation_labels: Vec<String>,
}

/// Rotator summary returned to the control plane
#[derive(Debug, Clone, Serialize)]
pub struct RotatorInfo {
    pub id: i64,
    pub name: String,
    pub instance_id: String,
    pub instance_name: String,
    pub instance_region: String,
    pub protocol: Protocol,
    pub listen_protocol: Protocol,
    pub transport_protocol: TransportProtocol,
    pub listen_transport_protocol: TransportProtocol,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_filter_type: Option<UptimeFilterKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_percentage: Option<f64>,
    pub alive_proxy_count: usize,
    pub listen_port: u16,
    pub auth_required: bool,
    pub auth_username: String,
    pub reputation_labels: Vec<ReputationLabel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_rotation_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Next upstream for one inbound connection, handed to the bridges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotatorNext {
    pub proxy_id: i64,
    pub ip: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub has_auth: bool,
    pub protocol: Protocol,
}

impl RotatorNext {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Pick the element after `last_proxy_id` in a canonically ordered eligible
/// set, wrapping around; the first element when the cursor is absent.
pub fn select_next_proxy_id(eligible_ids: &[i64], last_proxy_id: Option<i64>) -> Option<i64> {
    let first = *eligible_ids.first()?;

    let last = match last_proxy_id {
        Some(last) => last,
        None => return Some(first),
    };

    match eligible_ids.iter().position(|&id| id == last) {
        Some(idx) => Some(eligible_ids[(idx + 1) % eligible_ids.len()]),
        None => Some(first),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_normalize() {
        assert_eq!(TransportProtocol::normalize("tcp"), TransportProtocol::Tcp);
        assert_eq!(TransportProtocol::normalize(" QUIC "), TransportProtocol::Quic);
        assert_eq!(TransportProtocol::normalize("http3"), TransportProtocol::Http3);
        assert_eq!(TransportProtocol::normalize(""), TransportProtocol::Tcp);
        assert_eq!(TransportProtocol::normalize("wat"), TransportProtocol::Tcp);

        assert!(TransportProtocol::Quic.is_quic_based());
        assert!(TransportProtocol::Http3.is_quic_based());
        assert!(!TransportProtocol::Tcp.is_quic_based());
    }

    #[test]
    fn test_round1_quantization() {
        assert_eq!(round1(79.96), 80.0);
        assert_eq!(round1(79.94), 79.9);
        assert_eq!(round1(100.0), 100.0);
        assert_eq!(round1(0.05), 0.1);
        assert_eq!(round1(0.04), 0.0);
    }

    #[test]
    fn test_uptime_filter_validation() {
        assert_eq!(UptimeFilter::validate(None, None).unwrap(), None);
        assert_eq!(UptimeFilter::validate(Some(""), None).unwrap(), None);

        assert!(UptimeFilter::validate(Some("min"), None).is_err());
        assert!(UptimeFilter::validate(None, Some(50.0)).is_err());
        assert!(UptimeFilter::validate(Some("between"), Some(50.0)).is_err());
        assert!(UptimeFilter::validate(Some("min"), Some(-1.0)).is_err());
        assert!(UptimeFilter::validate(Some("max"), Some(100.1)).is_err());
        assert!(UptimeFilter::validate(Some("max"), Some(f64::NAN)).is_err());

        let filter = UptimeFilter::validate(Some("Min"), Some(79.96)).unwrap().unwrap();
        assert_eq!(filter.kind, UptimeFilterKind::Min);
        assert_eq!(filter.percentage, 80.0);
    }

    #[test]
    fn test_select_next_proxy_id() {
        let ids = [1, 3, 7, 9];

        // No cursor: first element
        assert_eq!(select_next_proxy_id(&ids, None), Some(1));

        // Cursor present: successor
        assert_eq!(select_next_proxy_id(&ids, Some(1)), Some(3));
        assert_eq!(select_next_proxy_id(&ids, Some(7)), Some(9));

        // Wrap-around
        assert_eq!(select_next_proxy_id(&ids, Some(9)), Some(1));

        // Cursor vanished from the set: restart
        assert_eq!(select_next_proxy_id(&ids, Some(5)), Some(1));

        // Empty set
        assert_eq!(select_next_proxy_id(&[], Some(1)), None);

        // Single element cycles onto itself
        assert_eq!(select_next_proxy_id(&[42], Some(42)), Some(42));
    }

    #[test]
    fn test_listen_config_valid() {
        let mut rotator = RotatingProxy {
            id: 1,
            user_id: 1,
            name: "r".to_string(),
            instance_id: "i".to_string(),
            instance_name: "i".to_string(),
            instance_region: "Unknown".to_string(),
            protocol: Protocol::Http,
            listen_protocol: Protocol::Socks5,
            transport: TransportProtocol::Tcp,
            listen_transport: TransportProtocol::Tcp,
            uptime_filter: None,
            listen_port: 20000,
            auth_required: false,
            auth_username: String::new(),
            auth_password: String::new(),
            reputation_labels: Vec::new(),
            last_proxy_id: None,
            last_rotation_at: None,
            created_at: Utc::now(),
        };

        assert!(rotator.listen_config_valid());

        rotator.listen_transport = TransportProtocol::Quic;
        assert!(!rotator.listen_config_valid());

        rotator.listen_protocol = Protocol::Http;
        assert!(rotator.listen_config_valid());
    }
}
