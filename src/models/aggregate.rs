use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{CostItem, Measurement, Photo, ProjectHeader, SafetyAction, derived_child_id};

pub const CURRENT_SCHEMA_VERSION: &str = "1.1.1";

/// Version assumed for records written before the tag existed.
const LEGACY_SCHEMA_VERSION: &str = "1.0.0";

/// A project header together with its four child collections.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectAggregate {
    pub header: ProjectHeader,
    pub measurements: Vec<Measurement>,
    pub photos: Vec<Photo>,
    pub safety_actions: Vec<SafetyAction>,
    pub cost_items: Vec<CostItem>,
    pub schema_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl ProjectAggregate {
    pub fn new(header: ProjectHeader) -> Self {
        Self {
            header,
            measurements: Vec::new(),
            photos: Vec::new(),
            safety_actions: Vec::new(),
            cost_items: Vec::new(),
            schema_version: CURRENT_SCHEMA_VERSION.to_string(),
            last_synced_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.header.id
    }

    /// Re-establish the derived fields before the aggregate is written:
    /// cost totals, child ids, the header timestamp and the schema tag.
    pub fn normalize(&mut self, now: DateTime<Utc>) {
        for item in &mut self.cost_items {
            item.recompute_total();
        }
        self.assign_missing_child_ids();
        self.header.touch(now);
        self.schema_version = CURRENT_SCHEMA_VERSION.to_string();
    }

    /// Give every child without an id one derived from the project id and the
    /// row's content. Identical rows are told apart by their position among
    /// each other.
    pub fn assign_missing_child_ids(&mut self) {
        let project_id = self.header.id.clone();
        assign_ids(&project_id, Collection::Measurements, &mut self.measurements, |m| &mut m.id);
        assign_ids(&project_id, Collection::Photos, &mut self.photos, |p| &mut p.id);
        assign_ids(&project_id, Collection::SafetyActions, &mut self.safety_actions, |s| &mut s.id);
        assign_ids(&project_id, Collection::CostItems, &mut self.cost_items, |c| &mut c.id);
    }

    /// Flatten the child collections in writer order.
    pub fn children(&self) -> Vec<ChildRecord> {
        let mut children = Vec::with_capacity(
            self.measurements.len()
                + self.photos.len()
                + self.safety_actions.len()
                + self.cost_items.len(),
        );
        children.extend(self.measurements.iter().cloned().map(ChildRecord::Measurement));
        children.extend(self.photos.iter().cloned().map(ChildRecord::Photo));
        children.extend(self.safety_actions.iter().cloned().map(ChildRecord::SafetyAction));
        children.extend(self.cost_items.iter().cloned().map(ChildRecord::CostItem));
        children
    }
}

fn assign_ids<T, F>(project_id: &str, collection: Collection, rows: &mut [T], id_of: F)
where
    T: Serialize,
    F: Fn(&mut T) -> &mut String,
{
    let mut seen: HashMap<String, usize> = HashMap::new();
    for row in rows.iter_mut() {
        if !id_of(row).is_empty() {
            continue;
        }
        let content = serde_json::to_string(&*row).unwrap_or_default();
        let occurrence = seen.entry(content.clone()).or_default();
        let seed = format!("{content}#{occurrence}");
        *occurrence += 1;
        *id_of(row) = derived_child_id(project_id, collection, &seed);
    }
}

impl<'de> Deserialize<'de> for ProjectAggregate {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        StoredAggregate::deserialize(deserializer).map(migrate)
    }
}

/// The shape of an aggregate as it may appear on disk or on the wire, from any
/// schema version. Everything beyond the header is optional.
#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
pub struct StoredAggregate {
    pub header: ProjectHeader,
    #[serde(default)]
    pub measurements: Option<Vec<Measurement>>,
    #[serde(default)]
    pub photos: Option<Vec<Photo>>,
    #[serde(default)]
    pub safety_actions: Option<Vec<SafetyAction>>,
    #[serde(default)]
    pub cost_items: Option<Vec<CostItem>>,
    #[serde(default)]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Lift a stored record of any version to the current schema.
pub fn migrate(stored: StoredAggregate) -> ProjectAggregate {
    let version = stored
        .schema_version
        .unwrap_or_else(|| LEGACY_SCHEMA_VERSION.to_string());

    if version != CURRENT_SCHEMA_VERSION {
        debug!(
            project_id = %stored.header.id,
            from = %version,
            to = CURRENT_SCHEMA_VERSION,
            "migrating stored aggregate"
        );
    }

    let mut cost_items = stored.cost_items.unwrap_or_default();
    // Totals were not stored before 1.1.0 and are never trusted afterwards.
    for item in &mut cost_items {
        item.recompute_total();
    }

    ProjectAggregate {
        header: stored.header,
        measurements: stored.measurements.unwrap_or_default(),
        photos: stored.photos.unwrap_or_default(),
        safety_actions: stored.safety_actions.unwrap_or_default(),
        cost_items,
        schema_version: CURRENT_SCHEMA_VERSION.to_string(),
        last_synced_at: stored.last_synced_at,
    }
}

/// The four child collections of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Collection {
    Measurements,
    Photos,
    SafetyActions,
    CostItems,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Measurements,
        Collection::Photos,
        Collection::SafetyActions,
        Collection::CostItems,
    ];

    /// Path segment used by the per-collection HTTP endpoints.
    pub fn path_segment(&self) -> &'static str {
        match self {
            Collection::Measurements => "measurements",
            Collection::Photos => "photos",
            Collection::SafetyActions => "safety-actions",
            Collection::CostItems => "cost-items",
        }
    }

    pub fn from_path_segment(segment: &str) -> Option<Collection> {
        Collection::ALL
            .into_iter()
            .find(|c| c.path_segment() == segment)
    }

    pub fn table(&self) -> &'static str {
        match self {
            Collection::Measurements => "measurements",
            Collection::Photos => "photos",
            Collection::SafetyActions => "safety_actions",
            Collection::CostItems => "cost_items",
        }
    }
}

/// A single row of one of the child collections.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ChildRecord {
    Measurement(Measurement),
    Photo(Photo),
    SafetyAction(SafetyAction),
    CostItem(CostItem),
}

impl ChildRecord {
    /// Decode a single row of `collection` from its JSON form.
    pub fn from_value(
        collection: Collection,
        value: serde_json::Value,
    ) -> Result<ChildRecord, serde_json::Error> {
        Ok(match collection {
            Collection::Measurements => ChildRecord::Measurement(serde_json::from_value(value)?),
            Collection::Photos => ChildRecord::Photo(serde_json::from_value(value)?),
            Collection::SafetyActions => ChildRecord::SafetyAction(serde_json::from_value(value)?),
            Collection::CostItems => ChildRecord::CostItem(serde_json::from_value(value)?),
        })
    }

    pub fn collection(&self) -> Collection {
        match self {
            ChildRecord::Measurement(_) => Collection::Measurements,
            ChildRecord::Photo(_) => Collection::Photos,
            ChildRecord::SafetyAction(_) => Collection::SafetyActions,
            ChildRecord::CostItem(_) => Collection::CostItems,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            ChildRecord::Measurement(m) => &m.id,
            ChildRecord::Photo(p) => &p.id,
            ChildRecord::SafetyAction(s) => &s.id,
            ChildRecord::CostItem(c) => &c.id,
        }
    }

    pub fn set_id(&mut self, id: String) {
        match self {
            ChildRecord::Measurement(m) => m.id = id,
            ChildRecord::Photo(p) => p.id = id,
            ChildRecord::SafetyAction(s) => s.id = id,
            ChildRecord::CostItem(c) => c.id = id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_record_is_migrated() {
        let json = r#"{
            "header": {
                "id": "1700000000000",
                "name": "Site A",
                "createdAt": "2024-01-01T00:00:00Z",
                "updatedAt": "2024-01-01T00:00:00Z"
            },
            "photos": [
                { "id": "p1", "uri": "file:///p1.jpg", "timestamp": "2024-01-01T00:00:00Z" }
            ],
            "costItems": [
                { "id": "c1", "position": "Rebar", "quantity": 4, "unitPrice": 12.5,
                  "timestamp": "2024-01-01T00:00:00Z" }
            ]
        }"#;

        let aggregate: ProjectAggregate = serde_json::from_str(json).unwrap();

        assert_eq!(aggregate.schema_version, CURRENT_SCHEMA_VERSION);
        assert!(aggregate.measurements.is_empty());
        assert!(aggregate.safety_actions.is_empty());
        assert_eq!(aggregate.photos[0].category, super::super::PhotoCategory::Other);
        assert_eq!(aggregate.cost_items[0].total, 50.0);
    }

    #[test]
    fn normalize_recomputes_totals_and_touches_header() {
        let mut aggregate = ProjectAggregate::new(ProjectHeader::new("Site A"));
        aggregate.cost_items.push(CostItem {
            id: "c1".into(),
            position: "Formwork".into(),
            quantity: 3.0,
            unit: "m2".into(),
            unit_price: 20.0,
            total: 999.0,
            note: None,
            timestamp: Utc::now(),
        });
        aggregate.schema_version = "0.9".into();
        let later = aggregate.header.updated_at + chrono::Duration::seconds(5);

        aggregate.normalize(later);

        assert_eq!(aggregate.cost_items[0].total, 60.0);
        assert_eq!(aggregate.header.updated_at, later);
        assert_eq!(aggregate.schema_version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn missing_child_ids_are_stable_across_saves() {
        let mut header = ProjectHeader::new("Site A");
        header.id = "P1".into();
        let mut aggregate = ProjectAggregate::new(header);
        let measurement = Measurement {
            id: String::new(),
            kind: "length".into(),
            value: "4".into(),
            unit: Some("m".into()),
            timestamp: Utc::now(),
            note: None,
        };
        aggregate.measurements.push(measurement.clone());
        aggregate.measurements.push(measurement.clone());
        aggregate.measurements.push(Measurement {
            id: "m-keep".into(),
            ..measurement
        });

        let mut first = aggregate.clone();
        first.normalize(Utc::now());
        let mut second = aggregate.clone();
        second.normalize(Utc::now());

        let ids: Vec<_> = first.measurements.iter().map(|m| m.id.clone()).collect();
        assert!(!ids[0].is_empty());
        assert_ne!(ids[0], ids[1]);
        assert_eq!(ids[2], "m-keep");
        let again: Vec<_> = second.measurements.iter().map(|m| m.id.clone()).collect();
        assert_eq!(ids, again);

        let mut elsewhere = aggregate;
        elsewhere.header.id = "P2".into();
        elsewhere.normalize(Utc::now());
        assert_ne!(elsewhere.measurements[0].id, ids[0]);
    }

    #[test]
    fn path_segments_map_back() {
        for collection in Collection::ALL {
            assert_eq!(
                Collection::from_path_segment(collection.path_segment()),
                Some(collection)
            );
        }
        assert_eq!(Collection::from_path_segment("safety_actions"), None);
    }

    #[test]
    fn child_decodes_by_collection() {
        let value = serde_json::json!({
            "action": "Barrier tape",
            "status": "done",
            "date": "2024-05-02"
        });

        let child = ChildRecord::from_value(Collection::SafetyActions, value).unwrap();

        assert_eq!(child.collection(), Collection::SafetyActions);
        assert_eq!(child.id(), "");
    }

    #[test]
    fn children_keep_collection_order() {
        let mut aggregate = ProjectAggregate::new(ProjectHeader::new("Site A"));
        aggregate.photos.push(Photo {
            id: "p1".into(),
            uri: "file:///p1.jpg".into(),
            caption: None,
            category: super::super::PhotoCategory::Damage,
            timestamp: Utc::now(),
        });
        aggregate.measurements.push(Measurement {
            id: "m1".into(),
            kind: "depth".into(),
            value: "1,25".into(),
            unit: Some("m".into()),
            timestamp: Utc::now(),
            note: None,
        });

        let collections: Vec<_> = aggregate.children().iter().map(|c| c.collection()).collect();
        assert_eq!(collections, vec![Collection::Measurements, Collection::Photos]);
    }
}
