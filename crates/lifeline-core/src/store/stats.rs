use serde::{Deserialize, Serialize};

use super::DateRange;
use crate::emergency::{Emergency, EmergencyStatus, EmergencyType, Priority};

/// Count of records of one type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeCount {
    /// The type.
    #[serde(rename = "type")]
    pub kind: EmergencyType,
    /// Number of records.
    pub count: u64,
}

/// Count of records of one priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityCount {
    /// The priority.
    pub priority: Priority,
    /// Number of records.
    pub count: u64,
}

/// Aggregate view over stored emergencies.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyStatistics {
    /// Records considered.
    pub total: u64,
    /// Records with status `resolved`.
    pub resolved: u64,
    /// Records with status `active`.
    pub active: u64,
    /// Mean `first_helper_accepted_at - sos_triggered_at` in milliseconds
    /// over records with an acceptance; `None` when there are none.
    pub avg_response_time_ms: Option<f64>,
    /// Non-zero counts per type, in declaration order.
    pub by_type: Vec<TypeCount>,
    /// Non-zero counts per priority, most urgent first.
    pub by_priority: Vec<PriorityCount>,
}

/// Folds `records` created within `range` into statistics.
#[allow(clippy::cast_precision_loss)]
pub fn aggregate<'a>(
    records: impl IntoIterator<Item = &'a Emergency>,
    range: Option<&DateRange>,
) -> EmergencyStatistics {
    let mut stats = EmergencyStatistics::default();
    let mut type_counts = [0u64; EmergencyType::ALL.len()];
    let mut priority_counts = [0u64; Priority::ALL.len()];
    let mut response_sum_ms: i64 = 0;
    let mut responded: u64 = 0;

    for e in records {
        if range.is_some_and(|r| !r.contains(e.created_at())) {
            continue;
        }
        stats.total += 1;
        match e.status() {
            EmergencyStatus::Resolved => stats.resolved += 1,
            EmergencyStatus::Active => stats.active += 1,
            EmergencyStatus::Cancelled | EmergencyStatus::Timeout => {},
        }
        if let Some(i) = EmergencyType::ALL.iter().position(|k| *k == e.kind()) {
            type_counts[i] += 1;
        }
        if let Some(i) = Priority::ALL.iter().position(|p| *p == e.priority()) {
            priority_counts[i] += 1;
        }
        let metrics = e.response_metrics();
        if let Some(accepted) = metrics.first_helper_accepted_at {
            response_sum_ms += (accepted - metrics.sos_triggered_at).num_milliseconds();
            responded += 1;
        }
    }

    stats.avg_response_time_ms = (responded > 0).then(|| response_sum_ms as f64 / responded as f64);
    stats.by_type = EmergencyType::ALL
        .iter()
        .zip(type_counts)
        .filter(|(_, count)| *count > 0)
        .map(|(kind, count)| TypeCount { kind: *kind, count })
        .collect();
    stats.by_priority = Priority::ALL
        .iter()
        .zip(priority_counts)
        .filter(|(_, count)| *count > 0)
        .map(|(priority, count)| PriorityCount {
            priority: *priority,
            count,
        })
        .collect();
    stats
}
