use std::collections::HashMap;

use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::event::{Extras, InteractionEvent, InteractionKind};

/// Merged extras for one aggregated metric.
///
/// A single contributor or a conflict-free union serializes as a plain
/// map. Any genuine conflict switches the whole field to an explicit
/// `{"all": [...]}` list preserving every contributor unmodified, never
/// a partial merge.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MergedExtras {
    Map(Extras),
    All { all: Vec<Extras> },
}

/// One row of output per entity key within one flush cycle.
///
/// Counts are deltas: rebuilt from scratch every flush, never carried
/// over between cycles.
#[derive(Debug, Clone, Serialize)]
pub struct AggregatedMetric {
    pub entity_key: String,
    pub identifier: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub view_count: u32,
    pub click_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extras: Option<MergedExtras>,
    /// Asset identifiers bound to the experience at registration time.
    /// Empty for asset metrics.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attributed_assets: Vec<String>,
}

/// Result of aggregating one drained batch.
#[derive(Debug)]
pub struct AggregationResult {
    /// Metrics in first-seen entity key order.
    pub metrics: Vec<AggregatedMetric>,
    /// Interaction kind of the first countable event in input order;
    /// Click when the batch holds no countable events.
    pub triggering_kind: InteractionKind,
}

/// Side table mapping experience IDs to the assets bound to them at
/// definition time. Shared between the ingest path (writes) and the
/// aggregator (reads).
#[derive(Debug, Default)]
pub struct AssetBindings {
    bindings: DashMap<String, Vec<String>>,
}

impl AssetBindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the assets attributed to an experience, replacing any
    /// previous registration.
    pub fn register(&self, experience_id: impl Into<String>, assets: Vec<String>) {
        self.bindings.insert(experience_id.into(), assets);
    }

    /// Returns the assets bound to an experience, if registered.
    pub fn lookup(&self, experience_id: &str) -> Vec<String> {
        self.bindings
            .get(experience_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Drops all registrations (identity reset).
    pub fn clear(&self) {
        self.bindings.clear();
    }
}

/// Groups events by entity key and computes per-key delta metrics.
///
/// Groups with an empty key are malformed and silently skipped.
pub fn aggregate(events: &[InteractionEvent], bindings: &AssetBindings) -> AggregationResult {
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<&InteractionEvent>> = HashMap::new();

    let mut triggering_kind = InteractionKind::Click;
    let mut saw_countable = false;

    for event in events {
        if event.kind != InteractionKind::Definition && !saw_countable {
            triggering_kind = event.kind;
            saw_countable = true;
        }

        let key = event.entity_key();
        if key.is_empty() {
            debug!("skipping event with empty entity key");
            continue;
        }

        match groups.get_mut(&key) {
            Some(group) => group.push(event),
            None => {
                order.push(key.clone());
                groups.insert(key, vec![event]);
            }
        }
    }

    let metrics = order
        .iter()
        .map(|key| {
            let group = &groups[key];
            build_metric(key, group, bindings)
        })
        .collect();

    AggregationResult {
        metrics,
        triggering_kind,
    }
}

fn build_metric(
    entity_key: &str,
    group: &[&InteractionEvent],
    bindings: &AssetBindings,
) -> AggregatedMetric {
    let first = group[0];

    let view_count = group
        .iter()
        .filter(|e| e.kind == InteractionKind::View)
        .count() as u32;
    let click_count = group
        .iter()
        .filter(|e| e.kind == InteractionKind::Click)
        .count() as u32;

    let attributed_assets = match first.category {
        crate::event::EventCategory::Experience => bindings.lookup(&first.identifier),
        crate::event::EventCategory::Asset => Vec::new(),
    };

    AggregatedMetric {
        entity_key: entity_key.to_string(),
        identifier: first.identifier.clone(),
        location: first.location.clone(),
        view_count,
        click_count,
        extras: merge_extras(group),
        attributed_assets,
    }
}

/// Conflict-aware extras merge in input event order.
///
/// A conflict is the same key holding two or more distinct stringified
/// values across contributors. Equal values merge last-writer-wins, so
/// the union is deterministic: merge order equals input event order.
fn merge_extras(group: &[&InteractionEvent]) -> Option<MergedExtras> {
    let contributors: Vec<&Extras> = group.iter().filter_map(|e| e.extras.as_ref()).collect();

    match contributors.len() {
        0 => None,
        1 => Some(MergedExtras::Map(contributors[0].clone())),
        _ => {
            let mut merged = Extras::new();
            for extras in &contributors {
                for (key, value) in extras.iter() {
                    if let Some(existing) = merged.get(key) {
                        if existing.to_wire_string() != value.to_wire_string() {
                            // Genuine conflict: preserve every contributor.
                            return Some(MergedExtras::All {
                                all: contributors.iter().map(|e| (*e).clone()).collect(),
                            });
                        }
                    }
                    merged.insert(key.clone(), value.clone());
                }
            }
            Some(MergedExtras::Map(merged))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventCategory, ExtraValue, InteractionKind};

    fn event(
        kind: InteractionKind,
        identifier: &str,
        location: Option<&str>,
        extras: Option<Extras>,
    ) -> InteractionEvent {
        InteractionEvent::new(
            EventCategory::Asset,
            kind,
            identifier,
            location.map(str::to_string),
            extras,
        )
        .expect("valid event")
    }

    fn extras(pairs: &[(&str, &str)]) -> Extras {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ExtraValue::String(v.to_string())))
            .collect()
    }

    #[test]
    fn test_grouping_by_identifier_and_location() {
        let events = vec![
            event(InteractionKind::View, "a.jpg", Some("home"), None),
            event(InteractionKind::View, "a.jpg", Some("home"), None),
            event(InteractionKind::Click, "a.jpg", Some("footer"), None),
            event(InteractionKind::View, "b.jpg", None, None),
        ];

        let result = aggregate(&events, &AssetBindings::new());

        assert_eq!(result.metrics.len(), 3);
        assert_eq!(result.metrics[0].entity_key, "a.jpg?location=home");
        assert_eq!(result.metrics[0].view_count, 2);
        assert_eq!(result.metrics[0].click_count, 0);
        assert_eq!(result.metrics[1].entity_key, "a.jpg?location=footer");
        assert_eq!(result.metrics[1].click_count, 1);
        assert_eq!(result.metrics[2].entity_key, "b.jpg");
    }

    #[test]
    fn test_triggering_kind_is_first_countable_event() {
        let events = vec![
            event(InteractionKind::View, "a.jpg", None, None),
            event(InteractionKind::Click, "a.jpg", None, None),
        ];
        let result = aggregate(&events, &AssetBindings::new());
        assert_eq!(result.triggering_kind, InteractionKind::View);

        let empty: Vec<InteractionEvent> = Vec::new();
        let result = aggregate(&empty, &AssetBindings::new());
        assert_eq!(result.triggering_kind, InteractionKind::Click);
    }

    #[test]
    fn test_single_contributor_extras_unmodified() {
        let events = vec![
            event(
                InteractionKind::View,
                "a.jpg",
                None,
                Some(extras(&[("campaign", "spring")])),
            ),
            event(InteractionKind::View, "a.jpg", None, None),
        ];

        let result = aggregate(&events, &AssetBindings::new());
        assert_eq!(
            result.metrics[0].extras,
            Some(MergedExtras::Map(extras(&[("campaign", "spring")])))
        );
    }

    #[test]
    fn test_conflict_free_merge_is_shallow_union() {
        let events = vec![
            event(
                InteractionKind::View,
                "a.jpg",
                None,
                Some(extras(&[("campaign", "spring"), ("page", "1")])),
            ),
            event(
                InteractionKind::Click,
                "a.jpg",
                None,
                Some(extras(&[("campaign", "spring"), ("variant", "b")])),
            ),
        ];

        let result = aggregate(&events, &AssetBindings::new());
        assert_eq!(
            result.metrics[0].extras,
            Some(MergedExtras::Map(extras(&[
                ("campaign", "spring"),
                ("page", "1"),
                ("variant", "b"),
            ])))
        );
    }

    #[test]
    fn test_conflicting_extras_switch_to_all_list() {
        let first = extras(&[("campaign", "spring")]);
        let second = extras(&[("campaign", "summer")]);
        let events = vec![
            event(InteractionKind::View, "a.jpg", None, Some(first.clone())),
            event(InteractionKind::View, "a.jpg", None, Some(second.clone())),
        ];

        let result = aggregate(&events, &AssetBindings::new());
        assert_eq!(
            result.metrics[0].extras,
            Some(MergedExtras::All {
                all: vec![first, second]
            })
        );
    }

    #[test]
    fn test_equal_values_under_different_numeric_forms_do_not_conflict() {
        let mut a = Extras::new();
        a.insert("count".to_string(), ExtraValue::Number(2.0));
        let mut b = Extras::new();
        b.insert("count".to_string(), ExtraValue::String("2".to_string()));

        let events = vec![
            event(InteractionKind::View, "a.jpg", None, Some(a)),
            event(InteractionKind::View, "a.jpg", None, Some(b)),
        ];

        let result = aggregate(&events, &AssetBindings::new());
        assert!(matches!(
            result.metrics[0].extras,
            Some(MergedExtras::Map(_))
        ));
    }

    #[test]
    fn test_experience_metrics_carry_attributed_assets() {
        let bindings = AssetBindings::new();
        bindings.register("exp-1", vec!["a.jpg".to_string(), "b.jpg".to_string()]);

        let events = vec![InteractionEvent::new(
            EventCategory::Experience,
            InteractionKind::View,
            "exp-1",
            None,
            None,
        )
        .expect("valid event")];

        let result = aggregate(&events, &bindings);
        assert_eq!(result.metrics[0].attributed_assets, vec!["a.jpg", "b.jpg"]);
    }

    #[test]
    fn test_all_serializes_with_all_key() {
        let merged = MergedExtras::All {
            all: vec![extras(&[("k", "v1")]), extras(&[("k", "v2")])],
        };
        let json = serde_json::to_string(&merged).expect("serialize");
        assert_eq!(json, r#"{"all":[{"k":"v1"},{"k":"v2"}]}"#);
    }
}
