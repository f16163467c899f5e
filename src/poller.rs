use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::TransitApi;
use crate::config::FilterSet;
use crate::error::Result;
use crate::models::VehicleFeature;
use crate::names::NameCache;
use crate::selection::{Selection, SelectionChange, SelectionTracker};
use crate::sink::{LayerKind, LayerSpec, MapStateSink, VEHICLES_LAYER, VEHICLES_SOURCE};
use crate::transform::FeatureTransformer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PollPhase {
    Idle,
    Fetching,
    Committing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Committed {
        sequence: u64,
        vehicles: usize,
        selection: SelectionChange,
    },
    /// A newer cycle committed first; this result was thrown away.
    Stale { sequence: u64, last_committed: u64 },
    /// The poller was stopped while the cycle was in flight.
    Stopped { sequence: u64 },
}

/// Cycles currently between fetch start and commit end, by step.
#[derive(Debug, Default)]
struct InFlight {
    fetching: usize,
    committing: usize,
}

/// Counts one cycle in [`InFlight`] until dropped, so early returns and
/// cancelled cycles are released as well.
struct CycleGuard<'a> {
    in_flight: &'a Mutex<InFlight>,
    committing: bool,
}

impl<'a> CycleGuard<'a> {
    fn begin(in_flight: &'a Mutex<InFlight>) -> Self {
        in_flight.lock().unwrap_or_else(PoisonError::into_inner).fetching += 1;
        CycleGuard { in_flight, committing: false }
    }

    fn committing(&mut self) {
        if self.committing {
            return;
        }
        let mut counts = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        counts.fetching -= 1;
        counts.committing += 1;
        self.committing = true;
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        let mut counts = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if self.committing {
            counts.committing -= 1;
        } else {
            counts.fetching -= 1;
        }
    }
}

struct CommitState {
    last_sequence: u64,
    features: Arc<Vec<VehicleFeature>>,
    layer_added: bool,
    selection: SelectionTracker,
}

/// Fetch → transform → commit on a fixed period.
pub struct FeedPoller<A, S> {
    api: Arc<A>,
    sink: Arc<S>,
    names: NameCache<A>,
    interval: Duration,
    filters: RwLock<FilterSet>,
    next_sequence: AtomicU64,
    stopped: AtomicBool,
    in_flight: Mutex<InFlight>,
    commit: Mutex<CommitState>,
}

impl<A: TransitApi, S: MapStateSink> FeedPoller<A, S> {
    pub fn new(
        api: Arc<A>,
        sink: Arc<S>,
        names: NameCache<A>,
        interval: Duration,
        filters: FilterSet,
    ) -> Self {
        FeedPoller {
            api,
            sink,
            names,
            interval,
            filters: RwLock::new(filters),
            next_sequence: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            in_flight: Mutex::new(InFlight::default()),
            commit: Mutex::new(CommitState {
                last_sequence: 0,
                features: Arc::new(Vec::new()),
                layer_added: false,
                selection: SelectionTracker::new(),
            }),
        }
    }

    fn commit_state(&self) -> MutexGuard<'_, CommitState> {
        self.commit.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Furthest step any in-flight cycle has reached. With overlapping
    /// cycles, `Idle` means none is running.
    pub fn phase(&self) -> PollPhase {
        let counts = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if counts.committing > 0 {
            PollPhase::Committing
        } else if counts.fetching > 0 {
            PollPhase::Fetching
        } else {
            PollPhase::Idle
        }
    }

    pub fn filters(&self) -> FilterSet {
        self.filters.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Takes effect from the next cycle on.
    pub fn set_filters(&self, filters: FilterSet) {
        info!("🔎 Filters updated: lines={} operators={}", filters.lines, filters.operators);
        *self.filters.write().unwrap_or_else(PoisonError::into_inner) = filters;
    }

    /// Latest committed collection.
    pub fn features(&self) -> Arc<Vec<VehicleFeature>> {
        Arc::clone(&self.commit_state().features)
    }

    pub fn last_committed_sequence(&self) -> u64 {
        self.commit_state().last_sequence
    }

    pub fn selection(&self) -> Option<Selection> {
        self.commit_state().selection.current().cloned()
    }

    pub fn select(&self, vehicle_id: &str) -> Option<Selection> {
        let mut state = self.commit_state();
        let features = Arc::clone(&state.features);
        state.selection.select(vehicle_id, &features, &*self.sink)
    }

    pub fn clear_selection(&self) -> Option<Selection> {
        self.commit_state().selection.clear(&*self.sink)
    }

    /// Prevents any further commit, including cycles already in flight.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Runs one complete cycle. An `Err` is a transient feed failure: nothing
    /// was committed and the previous collection stays on the map.
    pub async fn poll_once(&self) -> Result<CycleOutcome> {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst) + 1;

        let mut guard = CycleGuard::begin(&self.in_flight);
        let activities = self.api.vehicle_activity().await?;

        let filters = self.filters();
        let transforms: Vec<_> = activities
            .iter()
            .map(|activity| FeatureTransformer::transform(activity, &filters, &self.names))
            .collect();
        let features: Vec<VehicleFeature> = join_all(transforms).await.into_iter().flatten().collect();
        let features = FeatureTransformer::dedupe(features);
        debug!(
            "Cycle #{}: {} of {} records became features",
            sequence,
            features.len(),
            activities.len()
        );

        guard.committing();
        Ok(self.commit(sequence, features))
    }

    fn commit(&self, sequence: u64, features: Vec<VehicleFeature>) -> CycleOutcome {
        let mut state = self.commit_state();

        if self.is_stopped() {
            return CycleOutcome::Stopped { sequence };
        }
        if sequence < state.last_sequence {
            debug!(
                "Discarding cycle #{}, #{} already committed",
                sequence, state.last_sequence
            );
            return CycleOutcome::Stale {
                sequence,
                last_committed: state.last_sequence,
            };
        }

        self.sink.set_source(VEHICLES_SOURCE, VehicleFeature::collection(&features));
        if !state.layer_added {
            self.sink
                .add_layer(LayerSpec::new(VEHICLES_LAYER, VEHICLES_SOURCE, LayerKind::Symbol));
            state.layer_added = true;
        }

        let vehicles = features.len();
        let features = Arc::new(features);
        state.last_sequence = sequence;
        state.features = Arc::clone(&features);
        let selection = state.selection.reconcile(&features, &*self.sink);

        CycleOutcome::Committed {
            sequence,
            vehicles,
            selection,
        }
    }

    /// Polls until the task is aborted or the poller is stopped. The first
    /// cycle runs immediately.
    pub async fn run(self: Arc<Self>) {
        self.run_with(|_| {}).await
    }

    /// [`run`](Self::run), handing every cycle outcome to `on_cycle`.
    pub async fn run_with<F>(self: Arc<Self>, mut on_cycle: F)
    where
        F: FnMut(&CycleOutcome) + Send + 'static,
    {
        info!("🚌 Polling vehicle feed every {}ms", self.interval.as_millis());
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;
            if self.is_stopped() {
                break;
            }

            match self.poll_once().await {
                Ok(outcome) => {
                    match &outcome {
                        CycleOutcome::Committed { vehicles, .. } => {
                            debug!("✓ Committed {} vehicles", vehicles);
                        }
                        other => debug!("Cycle not committed: {:?}", other),
                    }
                    on_cycle(&outcome);
                }
                Err(e) => warn!("⚠️  Vehicle feed cycle failed, keeping last state: {}", e),
            }
        }

        info!("Vehicle feed polling stopped");
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Arc::clone(self).run())
    }

    pub fn spawn_with<F>(self: &Arc<Self>, on_cycle: F) -> JoinHandle<()>
    where
        F: FnMut(&CycleOutcome) + Send + 'static,
    {
        tokio::spawn(Arc::clone(self).run_with(on_cycle))
    }
}
