use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::proxy::{EstimatedType, Protocol};

/// Anonymity classification of an alive proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnonymityLevel {
    Elite,
    Anonymous,
    Transparent,
}

impl AnonymityLevel {
    pub fn id(&self) -> i32 {
        match self {
            AnonymityLevel::Elite => 1,
            AnonymityLevel::Anonymous => 2,
            AnonymityLevel::Transparent => 3,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(AnonymityLevel::Elite),
            2 => Some(AnonymityLevel::Anonymous),
            3 => Some(AnonymityLevel::Transparent),
            _ => None,
        }
    }
}

/// One check result. Append-only; never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyStatistic {
    /// Database id; zero until inserted
    pub id: i64,
    pub proxy_id: i64,
    pub protocol: Protocol,
    pub judge_id: i64,
    pub alive: bool,
    pub response_time_ms: i32,
    /// 0-based attempt that succeeded, or the retry budget on total failure
    pub attempt: i16,
    pub level: Option<AnonymityLevel>,
    pub country: String,
    pub estimated_type: EstimatedType,
    pub created_at: DateTime<Utc>,
}

/// Materialized most-recent check per `(proxy, protocol)`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyLatestStatistic {
    pub proxy_id: i64,
    pub protocol: Protocol,
    pub alive: bool,
    pub statistic_id: i64,
    pub checked_at: DateTime<Utc>,
}

impl ProxyLatestStatistic {
    /// `(checked_at, statistic_id)` lexicographic comparison used by the
    /// materialization upsert
    pub fn is_newer_than(&self, other: &ProxyLatestStatistic) -> bool {
        if self.checked_at > other.checked_at {
            return true;
        }
        if self.checked_at < other.checked_at {
            return false;
        }
        self.statistic_id > other.statistic_id
    }
}

/// Materialized per-proxy rollup across protocols
#[derive(Debug, Clone)]
pub struct ProxyOverallStatus {
    pub proxy_id: i64,
    pub overall_alive: bool,
    pub last_checked_at: DateTime<Utc>,
}

/// Reputation label computed offline; the core treats it as read-only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReputationLabel {
    Good,
    Neutral,
    Poor,
}

impl ReputationLabel {
    pub const ALL: [ReputationLabel; 3] = [
        ReputationLabel::Good,
        ReputationLabel::Neutral,
        ReputationLabel::Poor,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReputationLabel::Good => "good",
            ReputationLabel::Neutral => "neutral",
            ReputationLabel::Poor => "poor",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "good" => Some(ReputationLabel::Good),
            "neutral" => Some(ReputationLabel::Neutral),
            "poor" => Some(ReputationLabel::Poor),
            _ => None,
        }
    }
}

impl std::fmt::Display for ReputationLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Reputation kind for the rotator filter
pub const REPUTATION_KIND_OVERALL: &str = "overall";

/// Uptime over a check history: `round1(100 * alive / total)`, `None` when
/// there is no history. The same quantization applies to filter thresholds.
pub fn uptime_percentage(alive_count: u64, total_count: u64) -> Option<f64> {
    if total_count == 0 {
        return None;
    }
    Some(super::rotator::round1(
        100.0 * alive_count as f64 / total_count as f64,
    ))
}

/// Sanitize a raw label list: lowercase, drop unknowns, dedup, canonical
/// order. Empty or full sets disable the reputation filter.
pub fn sanitize_reputation_labels(raw: &[String]) -> Vec<ReputationLabel> {
    let mut seen = [false; 3];
    for value in raw {
        if let Some(label) = ReputationLabel::from_str(value) {
            seen[ReputationLabel::ALL.iter().position(|l| *l == label).unwrap()] = true;
        }
    }

    ReputationLabel::ALL
        .into_iter()
        .zip(seen)
        .filter_map(|(label, present)| present.then_some(label))
        .collect()
}

/// Whether a label set actually narrows the eligible proxies
pub fn reputation_filter_applies(labels: &[ReputationLabel]) -> bool {
    !labels.is_empty() && labels.len() < ReputationLabel::ALL.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn latest(statistic_id: i64, secs: i64) -> ProxyLatestStatistic {
        ProxyLatestStatistic {
            proxy_id: 1,
            protocol: Protocol::Http,
            alive: true,
            statistic_id,
            checked_at: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[test]
    fn test_anonymity_level_ids() {
        assert_eq!(AnonymityLevel::Elite.id(), 1);
        assert_eq!(AnonymityLevel::Anonymous.id(), 2);
        assert_eq!(AnonymityLevel::Transparent.id(), 3);
        assert_eq!(AnonymityLevel::from_id(2), Some(AnonymityLevel::Anonymous));
        assert_eq!(AnonymityLevel::from_id(0), None);
    }

    #[test]
    fn test_latest_ordering_is_lexicographic() {
        // Newer timestamp wins regardless of statistic id
        assert!(latest(1, 200).is_newer_than(&latest(99, 100)));
        assert!(!latest(99, 100).is_newer_than(&latest(1, 200)));

        // Equal timestamps break ties by statistic id
        assert!(latest(5, 100).is_newer_than(&latest(4, 100)));
        assert!(!latest(4, 100).is_newer_than(&latest(5, 100)));
        assert!(!latest(4, 100).is_newer_than(&latest(4, 100)));
    }

    #[test]
    fn test_sanitize_reputation_labels() {
        let raw = vec![
            "Poor".to_string(),
            "good".to_string(),
            "bogus".to_string(),
            "GOOD".to_string(),
        ];
        assert_eq!(
            sanitize_reputation_labels(&raw),
            vec![ReputationLabel::Good, ReputationLabel::Poor]
        );

        assert!(sanitize_reputation_labels(&["nope".to_string()]).is_empty());
    }

    #[test]
    fn test_reputation_filter_applies() {
        assert!(!reputation_filter_applies(&[]));
        assert!(reputation_filter_applies(&[ReputationLabel::Good]));
        assert!(reputation_filter_applies(&[
            ReputationLabel::Good,
            ReputationLabel::Neutral
        ]));
        assert!(!reputation_filter_applies(&ReputationLabel::ALL));
    }
}
