//! Merges a fetched batch into the stored item set.

use std::collections::HashMap;

use evwatch_core::{tags_equal, Item, ItemKey, ItemSource};

/// Result of reconciling one pooled batch against the store.
#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    /// Items to insert, one per previously unseen key.
    pub inserted: Vec<Item>,
    /// Stored items with their content fields overwritten by the fetched values.
    pub updated: Vec<Item>,
}

impl ReconcileOutcome {
    pub fn new_count(&self, source: ItemSource) -> usize {
        self.inserted.iter().filter(|i| i.source == source).count()
    }

    pub fn updated_count(&self, source: ItemSource) -> usize {
        self.updated.iter().filter(|i| i.source == source).count()
    }

    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty()
    }
}

/// Copies changed content fields from `fetched` onto `stored`.
///
/// Returns whether anything changed; `retrieved_at` and `raw_data` follow only on change.
fn apply_content_changes(stored: &mut Item, fetched: &Item) -> bool {
    let mut changed = false;

    macro_rules! sync_field {
        ($field:ident) => {
            if stored.$field != fetched.$field {
                stored.$field = fetched.$field.clone();
                changed = true;
            }
        };
    }

    sync_field!(price);
    sync_field!(description);
    sync_field!(location);
    sync_field!(enrollment_deadline);
    sync_field!(url);

    if !tags_equal(stored.tags.as_deref(), fetched.tags.as_deref()) {
        stored.tags = fetched.tags.clone();
        changed = true;
    }

    if changed {
        stored.retrieved_at = fetched.retrieved_at;
        stored.raw_data = fetched.raw_data.clone();
    }
    changed
}

/// Reconciles `fetched` against `existing` (the stored items for every source in the batch).
///
/// Keys are `(source, source_id)`. A key seen twice in one batch is applied in order,
/// so the last occurrence wins and the item is still counted once.
pub fn reconcile(fetched: Vec<Item>, existing: Vec<Item>) -> ReconcileOutcome {
    let mut stored: HashMap<ItemKey, Item> =
        existing.into_iter().map(|item| (item.key(), item)).collect();

    let mut outcome = ReconcileOutcome::default();
    let mut inserted_at: HashMap<ItemKey, usize> = HashMap::new();
    let mut updated_at: HashMap<ItemKey, usize> = HashMap::new();

    for item in fetched {
        let key = item.key();

        if let Some(&idx) = inserted_at.get(&key) {
            outcome.inserted[idx] = item;
            continue;
        }

        match stored.get_mut(&key) {
            None => {
                inserted_at.insert(key, outcome.inserted.len());
                outcome.inserted.push(item);
            }
            Some(current) => {
                if !apply_content_changes(current, &item) {
                    continue;
                }
                match updated_at.get(&key) {
                    Some(&idx) => outcome.updated[idx] = current.clone(),
                    None => {
                        updated_at.insert(key, outcome.updated.len());
                        outcome.updated.push(current.clone());
                    }
                }
            }
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn item(source: ItemSource, id: &str, price: &str) -> Item {
        let start = Utc.with_ymd_and_hms(2026, 11, 2, 18, 0, 0).single().unwrap();
        Item {
            source,
            source_id: id.to_string(),
            retrieved_at: start - Duration::days(10),
            event_start: start,
            event_end: start + Duration::hours(2),
            enrollment_deadline: Some(start - Duration::days(1)),
            title: Some(format!("Event {id}")),
            description: Some("desc".to_string()),
            organizer: Some("Org".to_string()),
            location: Some("Oslo".to_string()),
            url: Some(format!("https://example.org/{id}")),
            price: Some(price.to_string()),
            tags: Some(vec!["a".to_string(), "b".to_string()]),
            raw_data: None,
        }
    }

    #[test]
    fn unseen_keys_are_inserted() {
        let outcome = reconcile(
            vec![item(ItemSource::Tekna, "1", "100"), item(ItemSource::DntActivities, "1", "0")],
            vec![],
        );
        assert_eq!(outcome.inserted.len(), 2);
        assert_eq!(outcome.new_count(ItemSource::Tekna), 1);
        assert_eq!(outcome.new_count(ItemSource::DntActivities), 1);
        assert!(outcome.updated.is_empty());
    }

    #[test]
    fn identical_batch_changes_nothing() {
        let stored = vec![item(ItemSource::Tekna, "1", "100")];
        let mut refetched = item(ItemSource::Tekna, "1", "100");
        refetched.retrieved_at = Utc::now();
        let outcome = reconcile(vec![refetched], stored);
        assert!(outcome.is_empty());
    }

    #[test]
    fn reordered_tags_are_an_update() {
        let stored = vec![item(ItemSource::Tekna, "1", "100")];
        let mut refetched = item(ItemSource::Tekna, "1", "100");
        refetched.tags = Some(vec!["b".to_string(), "a".to_string()]);
        let outcome = reconcile(vec![refetched], stored);
        assert!(outcome.inserted.is_empty());
        assert_eq!(outcome.updated.len(), 1);
        assert_eq!(
            outcome.updated[0].tags,
            Some(vec!["b".to_string(), "a".to_string()])
        );
    }

    #[test]
    fn price_change_updates_content_and_retrieval_fields() {
        let stored = vec![item(ItemSource::Tekna, "1", "100")];
        let mut refetched = item(ItemSource::Tekna, "1", "150");
        refetched.retrieved_at = Utc::now();
        refetched.raw_data = Some("{\"id\":\"1\"}".to_string());
        refetched.title = Some("Renamed upstream".to_string());

        let outcome = reconcile(vec![refetched.clone()], stored);
        assert!(outcome.inserted.is_empty());
        assert_eq!(outcome.updated_count(ItemSource::Tekna), 1);

        let updated = &outcome.updated[0];
        assert_eq!(updated.price.as_deref(), Some("150"));
        assert_eq!(updated.retrieved_at, refetched.retrieved_at);
        assert_eq!(updated.raw_data, refetched.raw_data);
        // identity fields stay as stored
        assert_eq!(updated.title.as_deref(), Some("Event 1"));
    }

    #[test]
    fn same_id_in_other_source_is_a_new_item() {
        let stored = vec![item(ItemSource::Tekna, "1", "100")];
        let outcome = reconcile(vec![item(ItemSource::DntActivities, "1", "100")], stored);
        assert_eq!(outcome.inserted.len(), 1);
        assert!(outcome.updated.is_empty());
    }

    #[test]
    fn duplicate_key_in_batch_counts_once_and_last_wins() {
        let outcome = reconcile(
            vec![item(ItemSource::Tekna, "7", "100"), item(ItemSource::Tekna, "7", "120")],
            vec![],
        );
        assert_eq!(outcome.inserted.len(), 1);
        assert_eq!(outcome.inserted[0].price.as_deref(), Some("120"));

        let outcome = reconcile(
            vec![item(ItemSource::Tekna, "7", "130"), item(ItemSource::Tekna, "7", "140")],
            vec![item(ItemSource::Tekna, "7", "100")],
        );
        assert_eq!(outcome.updated.len(), 1);
        assert_eq!(outcome.updated[0].price.as_deref(), Some("140"));
    }

    #[test]
    fn clearing_tags_is_a_change_but_empty_and_missing_are_not() {
        let stored = vec![item(ItemSource::Tekna, "1", "100")];
        let mut cleared = item(ItemSource::Tekna, "1", "100");
        cleared.tags = None;
        assert_eq!(reconcile(vec![cleared], stored).updated.len(), 1);

        let mut none_stored = item(ItemSource::Tekna, "1", "100");
        none_stored.tags = None;
        let mut empty = item(ItemSource::Tekna, "1", "100");
        empty.tags = Some(vec![]);
        assert!(reconcile(vec![empty], vec![none_stored]).is_empty());
    }
}
