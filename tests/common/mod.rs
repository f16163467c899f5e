#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use geojson::FeatureCollection;
use nysse_live_map::api::{parse_feature_collection, TransitApi};
use nysse_live_map::error::{LiveMapError, Result};
use nysse_live_map::models::{Popup, StopPoint, VehicleActivity};
use nysse_live_map::sink::{LayerSpec, MapState, MapStateSink};
use serde_json::{json, Value};

/// In-memory journeys API. `None` feed means the feed is offline.
#[derive(Default)]
pub struct FakeApi {
    feed: Mutex<Option<Vec<Value>>>,
    feed_delays: Mutex<VecDeque<Duration>>,
    stop_points: Mutex<HashMap<String, StopPoint>>,
    failing_stops: Mutex<HashSet<String>>,
    shapes: Mutex<Option<FeatureCollection>>,
    feed_calls: AtomicUsize,
    stop_calls: Mutex<HashMap<String, usize>>,
}

impl FakeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_feed(&self, records: Vec<Value>) {
        *self.feed.lock().unwrap() = Some(records);
    }

    pub fn take_feed_offline(&self) {
        *self.feed.lock().unwrap() = None;
    }

    /// The next feed request answers after `delay`.
    pub fn delay_next_feed(&self, delay: Duration) {
        self.feed_delays.lock().unwrap().push_back(delay);
    }

    pub fn add_stop(&self, code: &str, name: &str, location: &str) {
        self.stop_points.lock().unwrap().insert(
            code.to_string(),
            StopPoint {
                name: name.to_string(),
                short_name: Some(code.to_string()),
                location: Some(location.to_string()),
            },
        );
    }

    pub fn fail_stop(&self, code: &str) {
        self.failing_stops.lock().unwrap().insert(code.to_string());
    }

    pub fn set_shapes(&self, geojson: &str) {
        *self.shapes.lock().unwrap() = Some(parse_feature_collection(geojson).unwrap());
    }

    pub fn feed_calls(&self) -> usize {
        self.feed_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self, code: &str) -> usize {
        self.stop_calls.lock().unwrap().get(code).copied().unwrap_or(0)
    }
}

impl TransitApi for FakeApi {
    async fn vehicle_activity(&self) -> Result<Vec<VehicleActivity>> {
        self.feed_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.feed_delays.lock().unwrap().pop_front();
        let records = self.feed.lock().unwrap().clone();

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        match records {
            Some(records) => Ok(VehicleActivity::parse_snapshot(records)),
            None => Err(LiveMapError::NetworkError("feed offline".to_string())),
        }
    }

    async fn stop_point(&self, code: &str) -> Result<Option<StopPoint>> {
        *self.stop_calls.lock().unwrap().entry(code.to_string()).or_default() += 1;

        if self.failing_stops.lock().unwrap().contains(code) {
            return Err(LiveMapError::StatusError(format!("stop {} unavailable", code)));
        }
        Ok(self.stop_points.lock().unwrap().get(code).cloned())
    }

    async fn route_shapes(&self) -> Result<FeatureCollection> {
        self.shapes
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| LiveMapError::FileError("no route shapes".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCommand {
    SetSource(String),
    AddLayer(String),
    RemoveLayer(String),
    RemoveSource(String),
    MoveLayerBelow(String, String),
    SetPopup(String),
    RemovePopup,
}

/// `MapState` that also journals every command it receives.
#[derive(Default)]
pub struct RecordingSink {
    pub state: MapState,
    journal: Mutex<Vec<SinkCommand>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> Vec<SinkCommand> {
        self.journal.lock().unwrap().clone()
    }

    pub fn count(&self, command: &SinkCommand) -> usize {
        self.journal.lock().unwrap().iter().filter(|c| *c == command).count()
    }

    pub fn layer_ids(&self) -> Vec<String> {
        self.state.layers().into_iter().map(|layer| layer.id).collect()
    }

    fn record(&self, command: SinkCommand) {
        self.journal.lock().unwrap().push(command);
    }
}

impl MapStateSink for RecordingSink {
    fn set_source(&self, name: &str, collection: FeatureCollection) {
        self.record(SinkCommand::SetSource(name.to_string()));
        self.state.set_source(name, collection);
    }

    fn add_layer(&self, layer: LayerSpec) {
        self.record(SinkCommand::AddLayer(layer.id.clone()));
        self.state.add_layer(layer);
    }

    fn remove_layer(&self, id: &str) {
        self.record(SinkCommand::RemoveLayer(id.to_string()));
        self.state.remove_layer(id);
    }

    fn remove_source(&self, name: &str) {
        self.record(SinkCommand::RemoveSource(name.to_string()));
        self.state.remove_source(name);
    }

    fn move_layer_below(&self, id: &str, reference: &str) {
        self.record(SinkCommand::MoveLayerBelow(id.to_string(), reference.to_string()));
        self.state.move_layer_below(id, reference);
    }

    fn set_popup(&self, popup: Popup) {
        self.record(SinkCommand::SetPopup(popup.vehicle_id.clone()));
        self.state.set_popup(popup);
    }

    fn remove_popup(&self) {
        self.record(SinkCommand::RemovePopup);
        self.state.remove_popup();
    }
}

/// A vehicle-activity record in the journeys API shape.
pub fn vehicle(id: &str, line: &str, longitude: f64, latitude: f64) -> Value {
    json!({
        "monitoredVehicleJourney": {
            "vehicleRef": id,
            "lineRef": line,
            "operatorRef": "TKL",
            "directionRef": "1",
            "destinationShortName": "0001",
            "delay": "PT0S",
            "bearing": 90,
            "vehicleLocation": {
                "longitude": longitude.to_string(),
                "latitude": latitude.to_string()
            }
        }
    })
}

/// Adds onward calls for the given stop codes, one minute apart.
pub fn with_onward_calls(mut record: Value, stops: &[&str]) -> Value {
    let calls: Vec<Value> = stops
        .iter()
        .enumerate()
        .map(|(index, code)| {
            json!({
                "stopPointRef": format!("https://data.itsfactory.fi/journeys/api/1/stop-points/{}", code),
                "order": (index + 1).to_string(),
                "expectedArrivalTime": format!("2024-05-02T09:{:02}:00.000+03:00", 10 + index),
            })
        })
        .collect();
    record["monitoredVehicleJourney"]["onwardCalls"] = Value::Array(calls);
    record
}

pub const ROUTE_SHAPES: &str = r#"{
    "type": "FeatureCollection",
    "features": [
        {
            "type": "Feature",
            "geometry": { "type": "LineString", "coordinates": [[23.70, 61.49], [23.80, 61.50]] },
            "properties": { "route_id": "3", "direction_id": "1" }
        },
        {
            "type": "Feature",
            "geometry": { "type": "LineString", "coordinates": [[23.80, 61.50], [23.70, 61.49]] },
            "properties": { "route_id": "3", "direction_id": "2" }
        }
    ]
}"#;
