//! Rotation discipline scenarios
//!
//! Exercises the selection contract against in-memory cursors: concurrent
//! fairness, uptime filtering and reputation filtering.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use magpie::models::{
    reputation_filter_applies, round1, sanitize_reputation_labels, select_next_proxy_id,
    uptime_percentage, ReputationLabel, UptimeFilter, UptimeFilterKind,
};

/// One serialized rotation step, the way the row lock serializes callers
async fn rotate(cursor: &Mutex<Option<i64>>, eligible: &[i64]) -> i64 {
    let mut last = cursor.lock().await;
    let selected = select_next_proxy_id(eligible, *last).expect("eligible set is non-empty");
    *last = Some(selected);
    selected
}

// S4: 50 alive proxies, 4 concurrent callers x 200 iterations. Every proxy
// is selected at least once and the spread stays within 2.
#[tokio::test]
async fn test_concurrent_rotation_fairness() {
    let eligible: Vec<i64> = (1..=50).collect();
    let cursor = Arc::new(Mutex::new(None));
    let counts = Arc::new(Mutex::new(HashMap::<i64, u32>::new()));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let eligible = eligible.clone();
        let cursor = cursor.clone();
        let counts = counts.clone();
        tasks.push(tokio::spawn(async move {
            for _ in 0..200 {
                let selected = rotate(&cursor, &eligible).await;
                *counts.lock().await.entry(selected).or_insert(0) += 1;
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    let counts = counts.lock().await;
    assert_eq!(counts.len(), 50, "every proxy must be selected at least once");

    let max = counts.values().max().copied().unwrap();
    let min = counts.values().min().copied().unwrap();
    assert!(
        max - min <= 2,
        "rotation spread too wide: max={max} min={min}"
    );

    // The cursor persisted the last selection.
    assert!(cursor.lock().await.is_some());
}

// Consecutive rotations walk the eligible set in canonical order.
#[tokio::test]
async fn test_rotation_is_cyclic_and_deterministic() {
    let eligible = vec![3, 9, 27];
    let cursor = Mutex::new(None);

    let mut seen = Vec::new();
    for _ in 0..7 {
        seen.push(rotate(&cursor, &eligible).await);
    }

    assert_eq!(seen, vec![3, 9, 27, 3, 9, 27, 3]);
}

// S5: uptime histories [T,T,T,F,T], [F,F,F,T,T], [T,T,T,T,T] quantize to
// 80, 40 and 100; a min=80 filter cycles {1, 3}, a max=50 filter pins 2.
#[tokio::test]
async fn test_uptime_filter_scenarios() {
    let histories: [(i64, &[bool]); 3] = [
        (1, &[true, true, true, false, true]),
        (2, &[false, false, false, true, true]),
        (3, &[true, true, true, true, true]),
    ];

    let uptimes: HashMap<i64, f64> = histories
        .iter()
        .map(|(id, history)| {
            let alive = history.iter().filter(|&&a| a).count() as u64;
            (*id, uptime_percentage(alive, history.len() as u64).unwrap())
        })
        .collect();

    assert_eq!(uptimes[&1], 80.0);
    assert_eq!(uptimes[&2], 40.0);
    assert_eq!(uptimes[&3], 100.0);

    let eligible_for = |filter: &UptimeFilter| -> Vec<i64> {
        let mut ids: Vec<i64> = uptimes
            .iter()
            .filter(|(_, &uptime)| filter.matches(uptime))
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids
    };

    let min_80 = UptimeFilter {
        kind: UptimeFilterKind::Min,
        percentage: round1(80.0),
    };
    let eligible = eligible_for(&min_80);
    assert_eq!(eligible, vec![1, 3]);

    let cursor = Mutex::new(None);
    assert_eq!(rotate(&cursor, &eligible).await, 1);
    assert_eq!(rotate(&cursor, &eligible).await, 3);
    assert_eq!(rotate(&cursor, &eligible).await, 1);

    let max_50 = UptimeFilter {
        kind: UptimeFilterKind::Max,
        percentage: round1(50.0),
    };
    let eligible = eligible_for(&max_50);
    assert_eq!(eligible, vec![2]);

    let cursor = Mutex::new(None);
    assert_eq!(rotate(&cursor, &eligible).await, 2);
    assert_eq!(rotate(&cursor, &eligible).await, 2);
}

// S6: labels=[good, neutral] cycles the good and neutral proxies; the poor
// one is never selected. Empty and full label sets disable the filter.
#[tokio::test]
async fn test_reputation_filter_scenarios() {
    let proxies = [
        (1_i64, ReputationLabel::Good),
        (2, ReputationLabel::Neutral),
        (3, ReputationLabel::Poor),
    ];

    let labels =
        sanitize_reputation_labels(&["good".to_string(), "neutral".to_string()]);
    assert!(reputation_filter_applies(&labels));

    let eligible: Vec<i64> = proxies
        .iter()
        .filter(|(_, label)| labels.contains(label))
        .map(|(id, _)| *id)
        .collect();
    assert_eq!(eligible, vec![1, 2]);

    let cursor = Mutex::new(None);
    let mut seen = Vec::new();
    for _ in 0..6 {
        seen.push(rotate(&cursor, &eligible).await);
    }
    assert_eq!(seen, vec![1, 2, 1, 2, 1, 2]);
    assert!(!seen.contains(&3));

    // Empty or full sets leave the eligible set unfiltered.
    assert!(!reputation_filter_applies(&sanitize_reputation_labels(&[])));
    assert!(!reputation_filter_applies(&sanitize_reputation_labels(&[
        "good".to_string(),
        "neutral".to_string(),
        "poor".to_string(),
    ])));
}

// Thresholds and computed uptimes share the 0.1 quantization.
#[test]
fn test_uptime_quantization_is_shared() {
    // 2/3 alive: 66.666... rounds to 66.7 on both sides of the comparison.
    let uptime = uptime_percentage(2, 3).unwrap();
    assert_eq!(uptime, 66.7);

    let filter = UptimeFilter {
        kind: UptimeFilterKind::Min,
        percentage: round1(66.66),
    };
    assert!(filter.matches(uptime));

    let stricter = UptimeFilter {
        kind: UptimeFilterKind::Min,
        percentage: round1(66.75),
    };
    assert!(!stricter.matches(uptime));
}
