// Wire models for the ITS Factory journeys API (Tampere region) and the
// derived map features built from them.
//
// Journeys API endpoints:
// - Vehicle activity: https://data.itsfactory.fi/journeys/api/1/vehicle-activity
// - Stop points:      https://data.itsfactory.fi/journeys/api/1/stop-points/<code>

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, JsonValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ============================================================================
// Upstream Data Structures
// ============================================================================

/// Envelope shared by every journeys API response.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default = "Vec::new")]
    pub body: Vec<T>,
}

impl<T> ApiEnvelope<T> {
    /// A missing status is tolerated; an explicit non-success status is not.
    pub fn is_success(&self) -> bool {
        self.status.as_deref().is_none_or(|status| status == "success")
    }
}

/// A value the feed sends either as a JSON number or as a numeric string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeedScalar {
    Number(f64),
    Text(String),
}

impl FeedScalar {
    /// Numeric value, `NaN` when the text form does not parse.
    pub fn as_f64(&self) -> f64 {
        match self {
            FeedScalar::Number(value) => *value,
            FeedScalar::Text(text) => text.trim().parse::<f64>().unwrap_or(f64::NAN),
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            FeedScalar::Number(value) if value.fract() == 0.0 => format!("{}", *value as i64),
            FeedScalar::Number(value) => value.to_string(),
            FeedScalar::Text(text) => text.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VehicleLocation {
    #[serde(default)]
    pub longitude: Option<FeedScalar>,
    #[serde(default)]
    pub latitude: Option<FeedScalar>,
}

impl VehicleLocation {
    /// `[longitude, latitude]` when both parse to finite numbers.
    pub fn coordinates(&self) -> Option<[f64; 2]> {
        let longitude = self.longitude.as_ref()?.as_f64();
        let latitude = self.latitude.as_ref()?.as_f64();
        (longitude.is_finite() && latitude.is_finite()).then_some([longitude, latitude])
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnwardCall {
    #[serde(default)]
    pub stop_point_ref: String,
    #[serde(default)]
    pub order: Option<FeedScalar>,
    #[serde(default)]
    pub expected_arrival_time: Option<String>,
    #[serde(default)]
    pub expected_departure_time: Option<String>,
}

impl OnwardCall {
    /// Stop code taken from the last path segment of the stop point reference.
    pub fn stop_id(&self) -> Option<&str> {
        self.stop_point_ref
            .rsplit('/')
            .next()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoredVehicleJourney {
    #[serde(default)]
    pub vehicle_ref: String,
    #[serde(default)]
    pub line_ref: String,
    #[serde(default)]
    pub operator_ref: String,
    #[serde(default)]
    pub direction_ref: Option<FeedScalar>,
    #[serde(default)]
    pub destination_short_name: Option<String>,
    #[serde(default)]
    pub delay: Option<String>,
    #[serde(default)]
    pub bearing: Option<FeedScalar>,
    #[serde(default)]
    pub vehicle_location: Option<VehicleLocation>,
    #[serde(default)]
    pub onward_calls: Option<Vec<OnwardCall>>,
    #[serde(default)]
    pub framed_vehicle_journey_ref: Option<JsonValue>,
    #[serde(default)]
    pub journey_pattern_ref: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleActivity {
    #[serde(default)]
    pub monitored_vehicle_journey: MonitoredVehicleJourney,
}

impl VehicleActivity {
    pub fn journey(&self) -> &MonitoredVehicleJourney {
        &self.monitored_vehicle_journey
    }

    pub fn vehicle_ref(&self) -> &str {
        &self.monitored_vehicle_journey.vehicle_ref
    }

    /// Decodes a snapshot body record by record. Records that do not decode
    /// are dropped so one bad entry cannot void the whole snapshot.
    pub fn parse_snapshot(records: Vec<JsonValue>) -> Vec<VehicleActivity> {
        let total = records.len();
        let activities: Vec<VehicleActivity> = records
            .into_iter()
            .filter_map(|record| match serde_json::from_value(record) {
                Ok(activity) => Some(activity),
                Err(e) => {
                    debug!("Dropping undecodable vehicle record: {}", e);
                    None
                }
            })
            .collect();

        if activities.len() < total {
            debug!("Decoded {} of {} vehicle records", activities.len(), total);
        }
        activities
    }

    /// Finds the record for `vehicle_id` in a snapshot.
    pub fn find<'a>(snapshot: &'a [VehicleActivity], vehicle_id: &str) -> Option<&'a VehicleActivity> {
        snapshot.iter().find(|activity| activity.vehicle_ref() == vehicle_id)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopPoint {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

impl StopPoint {
    /// Parses the `"lat,lon"` location into `[longitude, latitude]`.
    pub fn coordinates(&self) -> Option<[f64; 2]> {
        let (latitude, longitude) = self.location.as_deref()?.split_once(',')?;
        let latitude = latitude.trim().parse::<f64>().ok()?;
        let longitude = longitude.trim().parse::<f64>().ok()?;
        (latitude.is_finite() && longitude.is_finite()).then_some([longitude, latitude])
    }
}

// ============================================================================
// Derived Map Data
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleKind {
    Tram,
    Bus,
}

impl VehicleKind {
    pub fn for_line(line_ref: &str) -> Self {
        match line_ref {
            "1" | "3" => VehicleKind::Tram,
            _ => VehicleKind::Bus,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayLevel {
    Early,
    OnTime,
    Late,
    VeryLate,
}

/// One positioned vehicle, rebuilt from scratch every poll cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VehicleFeature {
    pub id: String,
    pub coordinates: [f64; 2],
    pub line_ref: String,
    pub operator_ref: String,
    pub destination_name: String,
    pub delay_minutes: f64,
    pub bearing: i32,
}

impl VehicleFeature {
    pub fn kind(&self) -> VehicleKind {
        VehicleKind::for_line(&self.line_ref)
    }

    /// Delay rounded half-up to whole minutes.
    pub fn rounded_delay(&self) -> i64 {
        (self.delay_minutes + 0.5).floor() as i64
    }

    pub fn delay_label(&self) -> String {
        match self.rounded_delay() {
            0 => "0".to_string(),
            minutes if minutes > 0 => format!("+{}", minutes),
            minutes => minutes.to_string(),
        }
    }

    pub fn delay_level(&self) -> DelayLevel {
        match self.rounded_delay() {
            minutes if minutes < 0 => DelayLevel::Early,
            minutes if minutes > 8 => DelayLevel::VeryLate,
            minutes if minutes > 3 => DelayLevel::Late,
            _ => DelayLevel::OnTime,
        }
    }

    /// Fleet number: the part after the operator prefix in `vehicleRef`.
    pub fn vehicle_number(&self) -> &str {
        self.id
            .split('_')
            .nth(1)
            .filter(|number| !number.is_empty())
            .unwrap_or("XXX")
    }

    pub fn popup_content(&self) -> PopupContent {
        PopupContent {
            title: format!("{} {}", self.line_ref, self.destination_name),
            line_ref: self.line_ref.clone(),
            operator_ref: self.operator_ref.clone(),
            vehicle_number: self.vehicle_number().to_string(),
            kind: self.kind(),
            delay_label: self.delay_label(),
            delay_level: self.delay_level(),
        }
    }

    pub fn to_geojson(&self) -> Feature {
        let mut properties = JsonObject::new();
        properties.insert("id".to_string(), JsonValue::from(self.id.clone()));
        properties.insert("vehicleRef".to_string(), JsonValue::from(self.id.clone()));
        properties.insert("lineRef".to_string(), JsonValue::from(self.line_ref.clone()));
        properties.insert("operatorRef".to_string(), JsonValue::from(self.operator_ref.clone()));
        properties.insert(
            "destinationName".to_string(),
            JsonValue::from(self.destination_name.clone()),
        );
        properties.insert("delay".to_string(), JsonValue::from(self.delay_minutes));
        properties.insert("bearing".to_string(), JsonValue::from(self.bearing));
        properties.insert(
            "kind".to_string(),
            serde_json::to_value(self.kind()).unwrap_or(JsonValue::Null),
        );

        point_feature(self.coordinates, Some(self.id.clone()), properties)
    }

    pub fn collection(features: &[VehicleFeature]) -> FeatureCollection {
        FeatureCollection {
            bbox: None,
            features: features.iter().map(VehicleFeature::to_geojson).collect(),
            foreign_members: None,
        }
    }
}

/// Popup payload for the followed vehicle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PopupContent {
    pub title: String,
    pub line_ref: String,
    pub operator_ref: String,
    pub vehicle_number: String,
    pub kind: VehicleKind,
    pub delay_label: String,
    pub delay_level: DelayLevel,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Popup {
    pub vehicle_id: String,
    pub coordinates: [f64; 2],
    pub content: PopupContent,
}

/// An upcoming stop of the followed vehicle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OnwardStop {
    pub stop_id: String,
    pub name: String,
    pub expected_arrival_label: String,
    pub coordinates: [f64; 2],
}

impl OnwardStop {
    pub const NOW_LABEL: &'static str = "Nyt";

    /// `"Nyt"` without an expected time, otherwise local `HH:MM`. A value
    /// that is not RFC 3339 is shown as received.
    pub fn arrival_label(expected: Option<&str>, timezone: Tz) -> String {
        match expected.map(str::trim).filter(|value| !value.is_empty()) {
            None => Self::NOW_LABEL.to_string(),
            Some(value) => match DateTime::parse_from_rfc3339(value) {
                Ok(time) => time
                    .with_timezone(&Utc)
                    .with_timezone(&timezone)
                    .format("%H:%M")
                    .to_string(),
                Err(_) => value.to_string(),
            },
        }
    }

    pub fn list_label(&self) -> String {
        format!("~ {}", self.expected_arrival_label)
    }

    pub fn to_geojson(&self) -> Feature {
        let mut properties = JsonObject::new();
        properties.insert("stopId".to_string(), JsonValue::from(self.stop_id.clone()));
        properties.insert("title".to_string(), JsonValue::from(self.name.clone()));
        properties.insert(
            "description".to_string(),
            JsonValue::from(self.expected_arrival_label.clone()),
        );

        point_feature(self.coordinates, None, properties)
    }

    pub fn collection(stops: &[OnwardStop]) -> FeatureCollection {
        FeatureCollection {
            bbox: None,
            features: stops.iter().map(OnwardStop::to_geojson).collect(),
            foreign_members: None,
        }
    }
}

fn point_feature(coordinates: [f64; 2], id: Option<String>, properties: JsonObject) -> Feature {
    Feature {
        bbox: None,
        geometry: Some(Geometry::new(geojson::Value::Point(coordinates.to_vec()))),
        id: id.map(geojson::feature::Id::String),
        properties: Some(properties),
        foreign_members: None,
    }
}
