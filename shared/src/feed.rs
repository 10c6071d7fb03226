//! GeoJSON view of pending reports for the map.

use geojson::feature::Id;
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, Value};
use serde_json::json;

use crate::model::{HazardType, ReportDraft, UnixTimeMs};

/// Narrows the map to one hazard type and/or recent reports. The default
/// keeps everything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedFilter {
    pub hazard_type: Option<HazardType>,
    /// Inclusive lower bound on `created_at`.
    pub created_after: Option<UnixTimeMs>,
}

impl FeedFilter {
    /// Reports created in the `window_ms` before `now`.
    pub fn recent(now: UnixTimeMs, window_ms: u64) -> Self {
        Self {
            hazard_type: None,
            created_after: Some(now.saturating_sub(window_ms)),
        }
    }

    #[must_use]
    pub fn with_hazard_type(mut self, hazard_type: HazardType) -> Self {
        self.hazard_type = Some(hazard_type);
        self
    }

    pub fn matches(&self, draft: &ReportDraft) -> bool {
        self.hazard_type.map_or(true, |h| draft.hazard_type == h)
            && self.created_after.map_or(true, |t| draft.created_at >= t)
    }
}

/// One Point feature per located draft. Drafts without a location are left
/// out; they still appear in the pending list.
pub fn pending_feature_collection<'a>(
    drafts: impl IntoIterator<Item = &'a ReportDraft>,
) -> FeatureCollection {
    filtered_feature_collection(drafts, &FeedFilter::default())
}

pub fn filtered_feature_collection<'a>(
    drafts: impl IntoIterator<Item = &'a ReportDraft>,
    filter: &FeedFilter,
) -> FeatureCollection {
    let features = drafts
        .into_iter()
        .filter(|draft| filter.matches(draft))
        .filter_map(feature)
        .collect();
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

fn feature(draft: &ReportDraft) -> Option<Feature> {
    let tag = draft.location?;
    let coordinate = tag.coordinate;

    let mut properties = JsonObject::new();
    properties.insert("id".into(), json!(draft.id.as_str()));
    properties.insert("hazard_type".into(), json!(draft.hazard_type.wire_name()));
    properties.insert("hazard_label".into(), json!(draft.hazard_type.label()));
    properties.insert("status".into(), json!(draft.status.name()));
    properties.insert("created_at".into(), json!(draft.created_at.0));
    properties.insert("media_count".into(), json!(draft.media.len()));
    properties.insert("location_source".into(), json!(tag.source.name()));

    Some(Feature {
        bbox: None,
        geometry: Some(Geometry::new(Value::Point(vec![coordinate.lon(), coordinate.lat()]))),
        id: Some(Id::String(draft.id.to_string())),
        properties: Some(properties),
        foreign_members: None,
    })
}
