//! Per-field last-writer-wins merge of device reading states.
//!
//! Each of `LastModified`, `StatusInfo`, `Statistics` and `CurrentBookmark`
//! is decided on its own timestamp. Incoming wins only when its timestamp
//! parses and is strictly later than the stored one (or the stored one is
//! missing or unparseable). Equal seconds keep what is stored.

use chrono::{DateTime, Utc};

use crate::kobo::timestamp::{self, format, is_strictly_after, latest, normalize, parse_opt};
use crate::model::{ReadingState, Timestamped};

/// True when `incoming` should replace `existing`.
pub fn supersedes(incoming: Option<&str>, existing: Option<&str>) -> bool {
    is_strictly_after(parse_opt(incoming), parse_opt(existing))
}

pub fn sub_supersedes<T: Timestamped>(incoming: Option<&T>, existing: Option<&T>) -> bool {
    supersedes(
        incoming.and_then(Timestamped::last_modified),
        existing.and_then(Timestamped::last_modified),
    )
}

fn pick<T: Timestamped + Clone>(existing: Option<&T>, incoming: Option<&T>) -> Option<T> {
    if sub_supersedes(incoming, existing) {
        incoming.cloned()
    } else {
        existing.cloned()
    }
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Stamp every missing timestamp with the shared request timestamp and
/// normalize the ones that are present.
pub fn prepare_incoming(mut state: ReadingState, request_ts: &str) -> ReadingState {
    fn fill(slot: &mut Option<String>, request_ts: &str) {
        let value = match non_blank(slot.as_deref()) {
            Some(ts) => normalize(ts),
            None => request_ts.to_string(),
        };
        *slot = Some(value);
    }

    fn fill_sub<T: Timestamped>(sub: Option<&mut T>, request_ts: &str) {
        if let Some(sub) = sub {
            let value = match non_blank(sub.last_modified()) {
                Some(ts) => normalize(ts),
                None => request_ts.to_string(),
            };
            sub.set_last_modified(value);
        }
    }

    fill(&mut state.last_modified, request_ts);
    fill(&mut state.priority_timestamp, request_ts);
    fill_sub(state.status_info.as_mut(), request_ts);
    fill_sub(state.statistics.as_mut(), request_ts);
    fill_sub(state.current_bookmark.as_mut(), request_ts);
    state.created = non_blank(state.created.as_deref()).map(normalize);
    state
}

/// Max of the four sub-timestamps. Without any parseable one, the prior
/// priority timestamp, then `LastModified`, then `fallback`.
///
/// Used for both first insert and merge.
pub fn priority_timestamp(state: &ReadingState, fallback: Option<&str>) -> Option<String> {
    latest(state.sub_timestamps())
        .map(format)
        .or_else(|| non_blank(state.priority_timestamp.as_deref()).map(normalize))
        .or_else(|| non_blank(state.last_modified.as_deref()).map(normalize))
        .or_else(|| fallback.map(str::to_string))
}

/// Row for an entitlement seen for the first time.
pub fn initial(mut incoming: ReadingState, request_ts: &str) -> ReadingState {
    if non_blank(incoming.created.as_deref()).is_none() {
        incoming.created = Some(request_ts.to_string());
    }
    incoming.priority_timestamp = priority_timestamp(&incoming, Some(request_ts));
    incoming
}

pub fn merge(existing: &ReadingState, incoming: &ReadingState) -> ReadingState {
    let last_modified = if supersedes(incoming.last_modified.as_deref(), existing.last_modified.as_deref()) {
        incoming.last_modified.clone()
    } else {
        existing.last_modified.clone()
    };

    let created = non_blank(existing.created.as_deref())
        .or(non_blank(incoming.created.as_deref()))
        .map(str::to_string);

    let mut merged = ReadingState {
        entitlement_id: existing.entitlement_id.clone(),
        created,
        last_modified,
        priority_timestamp: existing.priority_timestamp.clone(),
        status_info: pick(existing.status_info.as_ref(), incoming.status_info.as_ref()),
        statistics: pick(existing.statistics.as_ref(), incoming.statistics.as_ref()),
        current_bookmark: pick(existing.current_bookmark.as_ref(), incoming.current_bookmark.as_ref()),
    };
    merged.priority_timestamp = priority_timestamp(&merged, None);
    merged
}

/// Re-normalize every timestamp of a state about to leave the server.
/// Covers rows persisted before normalization existed.
pub fn normalize_state(mut state: ReadingState) -> ReadingState {
    fn renormalize(slot: &mut Option<String>) {
        if let Some(value) = slot.as_deref() {
            *slot = Some(timestamp::normalize(value));
        }
    }

    renormalize(&mut state.created);
    renormalize(&mut state.last_modified);
    renormalize(&mut state.priority_timestamp);
    if let Some(status) = state.status_info.as_mut() {
        renormalize(&mut status.last_modified);
    }
    if let Some(statistics) = state.statistics.as_mut() {
        renormalize(&mut statistics.last_modified);
    }
    if let Some(bookmark) = state.current_bookmark.as_mut() {
        renormalize(&mut bookmark.last_modified);
    }
    state.priority_timestamp = priority_timestamp(&state, None);
    state
}

/// Ordering key among competing rows for one entitlement: priority
/// timestamp, then `LastModified`. Callers break remaining ties by row id.
pub fn recency_key(state: &ReadingState) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
    (
        parse_opt(state.priority_timestamp.as_deref()),
        parse_opt(state.last_modified.as_deref()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Bookmark, Statistics, StatusInfo};

    const T0: &str = "2024-04-01T08:00:00.0000000Z";
    const T1: &str = "2024-04-01T09:00:00.0000000Z";
    const T2: &str = "2024-04-01T10:00:00.0000000Z";
    const T3: &str = "2024-04-01T11:00:00.0000000Z";

    fn bookmark(percent: f64, ts: &str) -> Bookmark {
        Bookmark {
            last_modified: Some(ts.to_string()),
            progress_percent: Some(percent),
            ..Default::default()
        }
    }

    fn status(ts: &str) -> StatusInfo {
        StatusInfo {
            last_modified: Some(ts.to_string()),
            ..Default::default()
        }
    }

    fn statistics(ts: &str) -> Statistics {
        Statistics {
            last_modified: Some(ts.to_string()),
            ..Default::default()
        }
    }

    fn state(last_modified: &str) -> ReadingState {
        ReadingState {
            entitlement_id: "7".to_string(),
            created: Some(T0.to_string()),
            last_modified: Some(last_modified.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_newer_field_wins_older_never_does() {
        let mut older = state(T1);
        older.current_bookmark = Some(bookmark(10.0, T1));
        let mut newer = state(T2);
        newer.current_bookmark = Some(bookmark(20.0, T2));

        let merged = merge(&older, &newer);
        assert_eq!(merged.current_bookmark, Some(bookmark(20.0, T2)));
        assert_eq!(merged.last_modified.as_deref(), Some(T2));

        let merged = merge(&newer, &older);
        assert_eq!(merged.current_bookmark, Some(bookmark(20.0, T2)));
        assert_eq!(merged.last_modified.as_deref(), Some(T2));
    }

    #[test]
    fn test_tie_keeps_existing() {
        let mut existing = state(T1);
        existing.current_bookmark = Some(bookmark(10.0, T1));
        let mut incoming = state(T1);
        incoming.current_bookmark = Some(bookmark(90.0, "2024-04-01 09:00:00"));

        let merged = merge(&existing, &incoming);
        assert_eq!(merged.current_bookmark, Some(bookmark(10.0, T1)));
    }

    #[test]
    fn test_fields_are_decided_independently() {
        let mut existing = state(T1);
        existing.status_info = Some(status(T3));
        existing.current_bookmark = Some(bookmark(10.0, T1));

        let mut incoming = state(T2);
        incoming.status_info = Some(status(T2));
        incoming.statistics = Some(statistics(T2));
        incoming.current_bookmark = Some(bookmark(30.0, T2));

        let merged = merge(&existing, &incoming);
        assert_eq!(merged.status_info, Some(status(T3)));
        assert_eq!(merged.statistics, Some(statistics(T2)));
        assert_eq!(merged.current_bookmark, Some(bookmark(30.0, T2)));
        assert_eq!(merged.priority_timestamp.as_deref(), Some(T3));
    }

    #[test]
    fn test_unparseable_existing_loses_unparseable_incoming_never_wins() {
        let mut existing = state(T1);
        existing.current_bookmark = Some(bookmark(10.0, "garbage"));
        let mut incoming = state(T0);
        incoming.current_bookmark = Some(bookmark(40.0, T0));

        let merged = merge(&existing, &incoming);
        assert_eq!(merged.current_bookmark, Some(bookmark(40.0, T0)));

        let mut incoming = state(T2);
        incoming.current_bookmark = Some(bookmark(50.0, "also garbage"));
        let merged = merge(&merged, &incoming);
        assert_eq!(merged.current_bookmark, Some(bookmark(40.0, T0)));
    }

    #[test]
    fn test_absent_incoming_field_keeps_existing() {
        let mut existing = state(T1);
        existing.current_bookmark = Some(bookmark(10.0, T1));
        let incoming = state(T2);

        let merged = merge(&existing, &incoming);
        assert_eq!(merged.current_bookmark, Some(bookmark(10.0, T1)));
    }

    #[test]
    fn test_created_is_set_once() {
        let existing = state(T1);
        let mut incoming = state(T2);
        incoming.created = Some(T3.to_string());
        assert_eq!(merge(&existing, &incoming).created.as_deref(), Some(T0));

        let mut existing = state(T1);
        existing.created = Some("  ".to_string());
        assert_eq!(merge(&existing, &incoming).created.as_deref(), Some(T3));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut x = state(T1);
        x.status_info = Some(status(T2));
        x.current_bookmark = Some(bookmark(55.5, T1));
        let x = initial(x, T3);

        assert_eq!(merge(&x, &x), x);
    }

    #[test]
    fn test_replay_order_does_not_matter() {
        let base = initial(state(T0), T0);

        let mut a = state(T1);
        a.current_bookmark = Some(bookmark(10.0, T1));
        let mut b = state(T3);
        b.status_info = Some(status(T3));
        b.current_bookmark = Some(bookmark(30.0, T2));
        let mut c = state(T2);
        c.statistics = Some(statistics(T2));
        c.current_bookmark = Some(bookmark(20.0, T3));

        let orders = [[&a, &b, &c], [&a, &c, &b], [&b, &a, &c], [&b, &c, &a], [&c, &a, &b], [&c, &b, &a]];
        let results: Vec<ReadingState> = orders
            .iter()
            .map(|order| order.iter().fold(base.clone(), |acc, update| merge(&acc, update)))
            .collect();

        for result in &results {
            assert_eq!(result, &results[0]);
        }
        assert_eq!(results[0].current_bookmark, Some(bookmark(20.0, T3)));
        assert_eq!(results[0].priority_timestamp.as_deref(), Some(T3));
    }

    #[test]
    fn test_priority_is_max_of_sub_timestamps() {
        let mut s = state(T0);
        s.statistics = Some(statistics(T2));
        s.current_bookmark = Some(bookmark(1.0, T1));
        assert_eq!(priority_timestamp(&s, None).as_deref(), Some(T2));
    }

    #[test]
    fn test_priority_fallbacks() {
        let mut s = ReadingState::new("7");
        assert_eq!(priority_timestamp(&s, Some(T3)).as_deref(), Some(T3));
        assert_eq!(priority_timestamp(&s, None), None);

        s.last_modified = Some("junk".to_string());
        s.priority_timestamp = Some("2024-04-01 10:00:00".to_string());
        assert_eq!(priority_timestamp(&s, Some(T3)).as_deref(), Some(T2));

        s.priority_timestamp = None;
        assert_eq!(priority_timestamp(&s, Some(T3)).as_deref(), Some("junk"));
    }

    #[test]
    fn test_prepare_incoming_fills_with_one_timestamp() {
        let mut incoming = ReadingState::new("7");
        incoming.status_info = Some(StatusInfo::default());
        incoming.current_bookmark = Some(Bookmark {
            last_modified: Some("2024-04-01 08:00:00.250".to_string()),
            progress_percent: Some(3.0),
            ..Default::default()
        });

        let prepared = prepare_incoming(incoming, T2);
        assert_eq!(prepared.last_modified.as_deref(), Some(T2));
        assert_eq!(prepared.priority_timestamp.as_deref(), Some(T2));
        assert_eq!(prepared.status_info.unwrap().last_modified.as_deref(), Some(T2));
        assert_eq!(prepared.current_bookmark.unwrap().last_modified.as_deref(), Some(T0));
        assert_eq!(prepared.statistics, None);
        assert_eq!(prepared.created, None);
    }

    #[test]
    fn test_initial_defaults_created() {
        let prepared = prepare_incoming(ReadingState::new("7"), T1);
        let row = initial(prepared, T1);
        assert_eq!(row.created.as_deref(), Some(T1));
        assert_eq!(row.priority_timestamp.as_deref(), Some(T1));
    }

    #[test]
    fn test_normalize_state_repairs_legacy_rows() {
        let mut legacy = ReadingState::new("7");
        legacy.last_modified = Some("2024-04-01 09:00:00".to_string());
        legacy.priority_timestamp = Some("2024-04-01 08:00:00".to_string());
        legacy.current_bookmark = Some(bookmark(5.0, "2024-04-01T10:00:00.123+00:00"));

        let normalized = normalize_state(legacy);
        assert_eq!(normalized.last_modified.as_deref(), Some(T1));
        assert_eq!(normalized.current_bookmark.unwrap().last_modified.as_deref(), Some(T2));
        assert_eq!(normalized.priority_timestamp.as_deref(), Some(T2));
    }
}
