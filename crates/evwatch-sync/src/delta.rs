//! Per-query change detection between two snapshots.

use std::collections::HashMap;

use evwatch_core::{Item, ItemSource};

/// What a saved query gained between the before and after snapshots.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Delta {
    pub new_items: Vec<Item>,
    pub updated_items: Vec<Item>,
}

impl Delta {
    pub fn is_empty(&self) -> bool {
        self.new_items.is_empty() && self.updated_items.is_empty()
    }
}

type KeyIndex<'a> = HashMap<(ItemSource, &'a str), Vec<&'a Item>>;

fn index_by_key(items: &[Item]) -> KeyIndex<'_> {
    let mut index: KeyIndex<'_> = HashMap::new();
    for item in items {
        index
            .entry((item.source, item.source_id.as_str()))
            .or_default()
            .push(item);
    }
    index
}

fn same_events<'a>(index: &KeyIndex<'a>, item: &Item) -> Vec<&'a Item> {
    index
        .get(&(item.source, item.source_id.as_str()))
        .into_iter()
        .flatten()
        .copied()
        .filter(|candidate| candidate.is_same_event(item))
        .collect()
}

/// Computes the delta of `after` relative to `before`.
///
/// On a query's first notification, an unchanged result set is reported in full as new
/// items so recipients get an initial listing. Both lists are ordered by event start.
pub fn compute_delta(before: &[Item], after: &[Item], first_notification: bool) -> Delta {
    let before_index = index_by_key(before);
    let after_index = index_by_key(after);

    let unchanged_set = before.len() == after.len()
        && before.iter().all(|b| !same_events(&after_index, b).is_empty());

    let mut delta = if first_notification && unchanged_set {
        Delta {
            new_items: after.to_vec(),
            updated_items: Vec::new(),
        }
    } else {
        let mut delta = Delta::default();
        for item in after {
            let same = same_events(&before_index, item);
            if same.is_empty() {
                delta.new_items.push(item.clone());
            } else if same.iter().any(|b| !b.is_fully_equal(item)) {
                delta.updated_items.push(item.clone());
            }
        }
        delta
    };

    delta.new_items.sort_by_key(|i| i.event_start);
    delta.updated_items.sort_by_key(|i| i.event_start);
    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn item(id: &str, day: u32) -> Item {
        let start = Utc.with_ymd_and_hms(2026, 12, day, 17, 0, 0).single().unwrap();
        Item {
            source: ItemSource::Tekna,
            source_id: id.to_string(),
            retrieved_at: start - Duration::days(30),
            event_start: start,
            event_end: start + Duration::hours(3),
            enrollment_deadline: None,
            title: Some(format!("Talk {id}")),
            description: None,
            organizer: None,
            location: None,
            url: None,
            price: Some("100".to_string()),
            tags: None,
            raw_data: None,
        }
    }

    #[test]
    fn unchanged_snapshots_give_empty_delta_after_first_send() {
        let snap = vec![item("1", 5), item("2", 6)];
        assert!(compute_delta(&snap, &snap, false).is_empty());
    }

    #[test]
    fn first_send_with_unchanged_snapshot_reports_everything_as_new() {
        let snap = vec![item("2", 9), item("1", 5)];
        let delta = compute_delta(&snap, &snap, true);
        let ids: Vec<_> = delta.new_items.iter().map(|i| i.source_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert!(delta.updated_items.is_empty());
    }

    #[test]
    fn first_send_with_changes_uses_regular_delta() {
        let before = vec![item("1", 5)];
        let after = vec![item("1", 5), item("2", 6)];
        let delta = compute_delta(&before, &after, true);
        assert_eq!(delta.new_items.len(), 1);
        assert_eq!(delta.new_items[0].source_id, "2");
    }

    #[test]
    fn tracked_field_change_is_an_update() {
        let before = vec![item("1", 5)];
        let mut changed = item("1", 5);
        changed.price = Some("150".to_string());
        let delta = compute_delta(&before, &[changed], false);
        assert!(delta.new_items.is_empty());
        assert_eq!(delta.updated_items.len(), 1);
        assert_eq!(delta.updated_items[0].price.as_deref(), Some("150"));
    }

    #[test]
    fn rescheduled_event_counts_as_new() {
        let before = vec![item("1", 5)];
        let mut moved = item("1", 5);
        moved.event_start += Duration::days(2);
        moved.event_end += Duration::days(2);
        let delta = compute_delta(&before, &[moved], false);
        assert_eq!(delta.new_items.len(), 1);
        assert!(delta.updated_items.is_empty());
    }

    #[test]
    fn removed_items_are_not_reported() {
        let before = vec![item("1", 5), item("2", 6)];
        let after = vec![item("1", 5)];
        assert!(compute_delta(&before, &after, false).is_empty());
    }

    #[test]
    fn lists_are_sorted_by_start() {
        let before = vec![item("9", 1)];
        let after = vec![item("3", 20), item("1", 2), item("2", 11)];
        let delta = compute_delta(&before, &after, false);
        let starts: Vec<_> = delta.new_items.iter().map(|i| i.event_start).collect();
        let mut sorted = starts.clone();
        sorted.sort();
        assert_eq!(starts, sorted);
    }

    #[test]
    fn empty_first_snapshot_sends_nothing() {
        assert!(compute_delta(&[], &[], true).is_empty());
    }
}
