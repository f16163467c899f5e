//! Live route overlay for one followed vehicle.
//!
//! A session goes `Idle → Loading → Active ⇄ Updating`, and ends in `Closed`
//! when its data is missing or the vehicle leaves the feed, or back in `Idle`
//! after an explicit [`RouteOverlayController::close`]. Every asynchronous
//! step re-checks the session generation before touching the sink, so work
//! belonging to a closed or replaced session is dropped silently.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono_tz::Tz;
use futures_util::future::join_all;
use geojson::{Feature, FeatureCollection, JsonValue};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::TransitApi;
use crate::models::{FeedScalar, OnwardCall, OnwardStop, VehicleActivity};
use crate::names::{NameCache, ResolveName};
use crate::sink::{
    LayerKind, LayerSpec, MapStateSink, ROUTE_SHAPE_LAYER, ROUTE_SHAPE_SOURCE, ROUTE_STOPS_LAYER,
    ROUTE_STOPS_SOURCE, VEHICLES_LAYER,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlayState {
    Idle,
    Loading,
    Active,
    Updating,
    Closed,
}

/// User-visible, non-fatal reasons an overlay ended or degraded.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "notice", rename_all = "snake_case")]
pub enum OverlayNotice {
    FeedUnavailable { reason: String },
    VehicleNotFound { vehicle_id: String },
    NoRouteData { vehicle_id: String },
    ShapeNotFound {
        route_id: Option<String>,
        direction_id: Option<String>,
    },
    ShapeUnavailable { reason: String },
    VehicleGone { vehicle_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum OverlayOutcome {
    Active {
        vehicle_id: String,
        stops: usize,
        route_shape: bool,
    },
    Closed { notice: OverlayNotice },
    /// Another `start` or a `close` took over while this one was loading,
    /// or the vehicle stopped being wanted.
    Superseded,
}

/// Result of one overlay update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshOutcome {
    Updated,
    /// Another update of the same session is still running.
    Busy,
    /// The session was closed, replaced, or its vehicle left the feed.
    Ended,
}

#[derive(Debug, Clone)]
pub struct RouteOverlaySession {
    pub vehicle_id: String,
    pub route_id: Option<String>,
    pub direction_id: Option<String>,
    pub onward_stops: Vec<OnwardStop>,
    pub route_shape: Option<FeatureCollection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverlayStopEntry {
    pub stop_id: String,
    pub name: String,
    pub arrival: String,
    pub label: String,
    pub coordinates: [f64; 2],
}

#[derive(Debug, Clone, Serialize)]
pub struct OverlayStatus {
    pub state: OverlayState,
    pub vehicle_id: Option<String>,
    pub route_id: Option<String>,
    pub direction_id: Option<String>,
    pub stops: Vec<OverlayStopEntry>,
    pub has_route_shape: bool,
    pub notice: Option<OverlayNotice>,
}

struct OverlaySlot {
    generation: u64,
    state: OverlayState,
    target: Option<String>,
    session: Option<RouteOverlaySession>,
    timer: Option<JoinHandle<()>>,
    stops_committed: bool,
    shape_committed: bool,
    notice: Option<OverlayNotice>,
}

struct OverlayShared<A, S> {
    api: Arc<A>,
    sink: Arc<S>,
    names: NameCache<A>,
    interval: Duration,
    timezone: Tz,
    slot: Mutex<OverlaySlot>,
}

pub struct RouteOverlayController<A, S> {
    shared: Arc<OverlayShared<A, S>>,
}

impl<A, S> Clone for RouteOverlayController<A, S> {
    fn clone(&self) -> Self {
        RouteOverlayController { shared: Arc::clone(&self.shared) }
    }
}

impl<A: TransitApi, S: MapStateSink> RouteOverlayController<A, S> {
    pub fn new(
        api: Arc<A>,
        sink: Arc<S>,
        names: NameCache<A>,
        interval: Duration,
        timezone: Tz,
    ) -> Self {
        RouteOverlayController {
            shared: Arc::new(OverlayShared {
                api,
                sink,
                names,
                interval,
                timezone,
                slot: Mutex::new(OverlaySlot {
                    generation: 0,
                    state: OverlayState::Idle,
                    target: None,
                    session: None,
                    timer: None,
                    stops_committed: false,
                    shape_committed: false,
                    notice: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> OverlayState {
        self.shared.slot().state
    }

    pub fn is_active(&self) -> bool {
        matches!(self.state(), OverlayState::Active | OverlayState::Updating)
    }

    /// The vehicle being loaded or followed.
    pub fn vehicle_id(&self) -> Option<String> {
        let slot = self.shared.slot();
        match slot.state {
            OverlayState::Loading | OverlayState::Active | OverlayState::Updating => {
                slot.target.clone()
            }
            OverlayState::Idle | OverlayState::Closed => None,
        }
    }

    pub fn session(&self) -> Option<RouteOverlaySession> {
        self.shared.slot().session.clone()
    }

    pub fn status(&self) -> OverlayStatus {
        let slot = self.shared.slot();
        let session = slot.session.as_ref();

        OverlayStatus {
            state: slot.state,
            vehicle_id: session.map(|s| s.vehicle_id.clone()).or_else(|| slot.target.clone()),
            route_id: session.and_then(|s| s.route_id.clone()),
            direction_id: session.and_then(|s| s.direction_id.clone()),
            stops: session
                .map(|s| {
                    s.onward_stops
                        .iter()
                        .map(|stop| OverlayStopEntry {
                            stop_id: stop.stop_id.clone(),
                            name: stop.name.clone(),
                            arrival: stop.expected_arrival_label.clone(),
                            label: stop.list_label(),
                            coordinates: stop.coordinates,
                        })
                        .collect()
                })
                .unwrap_or_default(),
            has_route_shape: session.is_some_and(|s| s.route_shape.is_some()),
            notice: slot.notice.clone(),
        }
    }

    /// Tears down the current session and opens a new one for `vehicle_id`.
    pub async fn start(&self, vehicle_id: &str) -> OverlayOutcome {
        self.start_if(vehicle_id, || true).await
    }

    /// Like [`start`](Self::start), but `wanted` is checked under the session
    /// lock before the session begins and before each commit. Once it returns
    /// `false` the load is abandoned, the overlay goes back to `Idle` and
    /// nothing of it stays on the map.
    pub async fn start_if<F>(&self, vehicle_id: &str, wanted: F) -> OverlayOutcome
    where
        F: Fn() -> bool,
    {
        let generation = {
            let mut slot = self.shared.slot();
            if !wanted() {
                debug!("Route overlay for {} no longer wanted, not starting", vehicle_id);
                return OverlayOutcome::Superseded;
            }
            slot.generation += 1;
            self.shared.teardown(&mut slot, OverlayState::Loading);
            slot.target = Some(vehicle_id.to_string());
            slot.notice = None;
            slot.generation
        };
        info!("🗺️  Loading route overlay for vehicle {}", vehicle_id);

        let snapshot = match self.shared.api.vehicle_activity().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                return self.shared.fail(
                    generation,
                    OverlayNotice::FeedUnavailable { reason: e.to_string() },
                );
            }
        };

        let Some(activity) = VehicleActivity::find(&snapshot, vehicle_id) else {
            return self.shared.fail(
                generation,
                OverlayNotice::VehicleNotFound { vehicle_id: vehicle_id.to_string() },
            );
        };

        let journey = activity.journey();
        let calls = match journey.onward_calls.as_deref() {
            Some(calls) if !calls.is_empty() => calls,
            _ => {
                return self.shared.fail(
                    generation,
                    OverlayNotice::NoRouteData { vehicle_id: vehicle_id.to_string() },
                );
            }
        };

        let route_id = Some(journey.line_ref.clone()).filter(|line| !line.is_empty());
        let direction_id = journey.direction_ref.as_ref().map(FeedScalar::to_text);
        let stops = self.shared.onward_stops(calls).await;
        let stop_count = stops.len();

        {
            let mut slot = self.shared.slot();
            if slot.generation != generation {
                return OverlayOutcome::Superseded;
            }
            if !wanted() {
                return self.shared.abandon(&mut slot, vehicle_id);
            }

            self.shared.commit_stops(&mut slot, &stops);
            slot.session = Some(RouteOverlaySession {
                vehicle_id: vehicle_id.to_string(),
                route_id: route_id.clone(),
                direction_id: direction_id.clone(),
                onward_stops: stops,
                route_shape: None,
            });
        }

        let shape = self
            .shared
            .matching_shape(route_id.as_deref(), direction_id.as_deref())
            .await;

        let mut slot = self.shared.slot();
        if slot.generation != generation {
            return OverlayOutcome::Superseded;
        }
        if !wanted() {
            return self.shared.abandon(&mut slot, vehicle_id);
        }

        let route_shape = match shape {
            Ok(collection) => {
                self.shared.commit_shape(&mut slot, collection);
                true
            }
            Err(notice) => {
                warn!("⚠️  Route overlay for {} has no route line: {:?}", vehicle_id, notice);
                slot.notice = Some(notice);
                false
            }
        };

        slot.state = OverlayState::Active;
        slot.timer = Some(OverlayShared::spawn_timer(&self.shared, generation));
        info!(
            "✓ Route overlay active for {} ({} onward stops)",
            vehicle_id, stop_count
        );

        OverlayOutcome::Active {
            vehicle_id: vehicle_id.to_string(),
            stops: stop_count,
            route_shape,
        }
    }

    /// Runs one overlay update right away.
    pub async fn refresh(&self) -> RefreshOutcome {
        let generation = self.shared.slot().generation;
        self.shared.refresh(generation).await
    }

    /// Cancels the timer and removes every overlay layer and source.
    /// Safe to call in any state, any number of times.
    pub fn close(&self) {
        let mut slot = self.shared.slot();
        let previous = slot.state;
        slot.generation += 1;
        self.shared.teardown(&mut slot, OverlayState::Idle);
        slot.target = None;

        if previous != OverlayState::Idle {
            info!("Route overlay closed");
        }
    }
}

impl<A: TransitApi, S: MapStateSink> OverlayShared<A, S> {
    fn slot(&self) -> MutexGuard<'_, OverlaySlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn teardown(&self, slot: &mut OverlaySlot, next: OverlayState) {
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
        if slot.shape_committed {
            self.sink.remove_layer(ROUTE_SHAPE_LAYER);
            self.sink.remove_source(ROUTE_SHAPE_SOURCE);
            slot.shape_committed = false;
        }
        if slot.stops_committed {
            self.sink.remove_layer(ROUTE_STOPS_LAYER);
            self.sink.remove_source(ROUTE_STOPS_SOURCE);
            slot.stops_committed = false;
        }
        slot.session = None;
        slot.state = next;
    }

    fn fail(&self, generation: u64, notice: OverlayNotice) -> OverlayOutcome {
        let mut slot = self.slot();
        if slot.generation != generation {
            return OverlayOutcome::Superseded;
        }

        warn!("⚠️  Route overlay closed: {:?}", notice);
        self.teardown(&mut slot, OverlayState::Closed);
        slot.notice = Some(notice.clone());
        OverlayOutcome::Closed { notice }
    }

    fn abandon(&self, slot: &mut OverlaySlot, vehicle_id: &str) -> OverlayOutcome {
        info!("Route overlay for {} abandoned, vehicle no longer selected", vehicle_id);
        slot.generation += 1;
        self.teardown(slot, OverlayState::Idle);
        slot.target = None;
        OverlayOutcome::Superseded
    }

    fn commit_stops(&self, slot: &mut OverlaySlot, stops: &[OnwardStop]) {
        self.sink.set_source(ROUTE_STOPS_SOURCE, OnwardStop::collection(stops));
        if !slot.stops_committed {
            self.sink.add_layer(LayerSpec::new(
                ROUTE_STOPS_LAYER,
                ROUTE_STOPS_SOURCE,
                LayerKind::Symbol,
            ));
            slot.stops_committed = true;
        }
    }

    /// Route line goes beneath the stop overlay and the vehicles.
    fn commit_shape(&self, slot: &mut OverlaySlot, collection: FeatureCollection) {
        self.sink.set_source(ROUTE_SHAPE_SOURCE, collection.clone());
        self.sink
            .add_layer(LayerSpec::new(ROUTE_SHAPE_LAYER, ROUTE_SHAPE_SOURCE, LayerKind::Line));
        self.sink.move_layer_below(ROUTE_SHAPE_LAYER, ROUTE_STOPS_LAYER);
        self.sink.move_layer_below(ROUTE_SHAPE_LAYER, VEHICLES_LAYER);
        slot.shape_committed = true;

        if let Some(session) = slot.session.as_mut() {
            session.route_shape = Some(collection);
        }
    }

    async fn onward_stops(&self, calls: &[OnwardCall]) -> Vec<OnwardStop> {
        let lookups: Vec<_> = calls.iter().map(|call| self.onward_stop(call)).collect();
        join_all(lookups).await.into_iter().flatten().collect()
    }

    /// Resolves one call; a failed lookup drops only this stop.
    async fn onward_stop(&self, call: &OnwardCall) -> Option<OnwardStop> {
        let Some(stop_id) = call.stop_id() else {
            warn!("Invalid stopPointRef '{}'", call.stop_point_ref);
            return None;
        };

        let coordinates = match self.api.stop_point(stop_id).await {
            Ok(Some(stop)) => stop.coordinates(),
            Ok(None) => None,
            Err(e) => {
                debug!("Stop point {} lookup failed: {}", stop_id, e);
                return None;
            }
        };
        let Some(coordinates) = coordinates else {
            debug!("Stop point {} has no usable location", stop_id);
            return None;
        };

        let name = self.names.resolve(stop_id).await;
        Some(OnwardStop {
            stop_id: stop_id.to_string(),
            name,
            expected_arrival_label: OnwardStop::arrival_label(
                call.expected_arrival_time.as_deref(),
                self.timezone,
            ),
            coordinates,
        })
    }

    async fn matching_shape(
        &self,
        route_id: Option<&str>,
        direction_id: Option<&str>,
    ) -> Result<FeatureCollection, OverlayNotice> {
        let not_found = || OverlayNotice::ShapeNotFound {
            route_id: route_id.map(String::from),
            direction_id: direction_id.map(String::from),
        };
        let (Some(route), Some(direction)) = (route_id, direction_id) else {
            return Err(not_found());
        };

        let dataset = self
            .api
            .route_shapes()
            .await
            .map_err(|e| OverlayNotice::ShapeUnavailable { reason: e.to_string() })?;

        let features = matching_route_shapes(dataset, route, direction);
        if features.is_empty() {
            return Err(not_found());
        }

        debug!("{} route shape features for {}/{}", features.len(), route, direction);
        Ok(FeatureCollection {
            bbox: None,
            features,
            foreign_members: None,
        })
    }

    async fn refresh(&self, generation: u64) -> RefreshOutcome {
        let vehicle_id = {
            let mut slot = self.slot();
            if slot.generation != generation {
                return RefreshOutcome::Ended;
            }
            match slot.state {
                OverlayState::Active => {}
                OverlayState::Updating => return RefreshOutcome::Busy,
                _ => return RefreshOutcome::Ended,
            }
            let Some(vehicle_id) = slot.session.as_ref().map(|s| s.vehicle_id.clone()) else {
                return RefreshOutcome::Ended;
            };
            slot.state = OverlayState::Updating;
            vehicle_id
        };
        debug!("Route overlay update for {}", vehicle_id);

        let snapshot = match self.api.vehicle_activity().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("⚠️  Route overlay update failed, keeping last stops: {}", e);
                return self.resume(generation);
            }
        };

        let Some(activity) = VehicleActivity::find(&snapshot, &vehicle_id) else {
            let mut slot = self.slot();
            if slot.generation != generation {
                return RefreshOutcome::Ended;
            }
            info!("Vehicle {} left the feed, closing route overlay", vehicle_id);
            self.teardown(&mut slot, OverlayState::Closed);
            slot.notice = Some(OverlayNotice::VehicleGone { vehicle_id });
            return RefreshOutcome::Ended;
        };

        let calls = match activity.journey().onward_calls.as_deref() {
            Some(calls) if !calls.is_empty() => calls,
            _ => {
                debug!("No onward calls for {} this round, keeping last stops", vehicle_id);
                return self.resume(generation);
            }
        };

        let stops = self.onward_stops(calls).await;

        let mut slot = self.slot();
        if slot.generation != generation {
            return RefreshOutcome::Ended;
        }
        self.commit_stops(&mut slot, &stops);
        if let Some(session) = slot.session.as_mut() {
            session.onward_stops = stops;
        }
        slot.state = OverlayState::Active;
        RefreshOutcome::Updated
    }

    fn resume(&self, generation: u64) -> RefreshOutcome {
        let mut slot = self.slot();
        if slot.generation != generation {
            return RefreshOutcome::Ended;
        }
        slot.state = OverlayState::Active;
        RefreshOutcome::Updated
    }

    fn spawn_timer(shared: &Arc<Self>, generation: u64) -> JoinHandle<()> {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let period = shared.interval;
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                match shared.refresh(generation).await {
                    RefreshOutcome::Ended => break,
                    RefreshOutcome::Busy => debug!("Route overlay update still running, skipping tick"),
                    RefreshOutcome::Updated => {}
                }
            }
        })
    }
}

/// Shape features whose `route_id`/`direction_id` properties equal the given
/// values. Numeric property values compare by their text form.
pub fn matching_route_shapes(
    dataset: FeatureCollection,
    route_id: &str,
    direction_id: &str,
) -> Vec<Feature> {
    dataset
        .features
        .into_iter()
        .filter(|feature| {
            property_text(feature.property("route_id")).as_deref() == Some(route_id)
                && property_text(feature.property("direction_id")).as_deref() == Some(direction_id)
        })
        .collect()
}

fn property_text(value: Option<&JsonValue>) -> Option<String> {
    match value? {
        JsonValue::String(text) => Some(text.clone()),
        JsonValue::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
