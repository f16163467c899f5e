use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::api::TransitApi;
use crate::config::{FilterSet, LiveMapConfig};
use crate::error::Result;
use crate::models::VehicleFeature;
use crate::names::{NameCache, NameResolver};
use crate::overlay::{OverlayOutcome, OverlayStatus, RouteOverlayController};
use crate::poller::{CycleOutcome, FeedPoller};
use crate::selection::{Selection, SelectionChange};
use crate::sink::MapStateSink;

/// Outcome of following a vehicle.
#[derive(Debug, Clone, PartialEq)]
pub enum FollowOutcome {
    NotFound,
    Following {
        selection: Selection,
        overlay: OverlayOutcome,
    },
}

/// Owns the feed poller and the route overlay, and keeps them consistent:
/// the overlay only ever follows the selected vehicle. Selecting another
/// vehicle, clearing the selection or the selected vehicle leaving the feed
/// closes it, and a follow whose vehicle is no longer selected by the time
/// it commits is abandoned.
pub struct LiveMap<A, S> {
    poller: Arc<FeedPoller<A, S>>,
    overlay: RouteOverlayController<A, S>,
    names: NameCache<A>,
}

impl<A: TransitApi, S: MapStateSink> LiveMap<A, S> {
    pub fn new(api: Arc<A>, sink: Arc<S>, config: &LiveMapConfig) -> Self {
        let names = NameCache::new(NameResolver::new(Arc::clone(&api)));

        let poller = Arc::new(FeedPoller::new(
            Arc::clone(&api),
            Arc::clone(&sink),
            names.clone(),
            config.feed_interval,
            config.filters.clone(),
        ));
        let overlay = RouteOverlayController::new(
            api,
            sink,
            names.clone(),
            config.overlay_interval,
            config.timezone,
        );

        LiveMap { poller, overlay, names }
    }

    pub fn poller(&self) -> &Arc<FeedPoller<A, S>> {
        &self.poller
    }

    pub fn overlay(&self) -> &RouteOverlayController<A, S> {
        &self.overlay
    }

    pub fn names(&self) -> &NameCache<A> {
        &self.names
    }

    pub fn vehicles(&self) -> Arc<Vec<VehicleFeature>> {
        self.poller.features()
    }

    pub fn filters(&self) -> FilterSet {
        self.poller.filters()
    }

    pub fn set_filters(&self, filters: FilterSet) {
        self.poller.set_filters(filters);
    }

    pub fn selection(&self) -> Option<Selection> {
        self.poller.selection()
    }

    pub fn route_status(&self) -> OverlayStatus {
        self.overlay.status()
    }

    /// Manual refresh.
    pub async fn refresh(&self) -> Result<CycleOutcome> {
        let outcome = self.poller.poll_once().await?;
        Self::close_dismissed(&self.overlay, &outcome);
        Ok(outcome)
    }

    /// Closes the overlay when a commit dismissed the vehicle it follows.
    fn close_dismissed(overlay: &RouteOverlayController<A, S>, outcome: &CycleOutcome) {
        if let CycleOutcome::Committed {
            selection: SelectionChange::Dismissed { vehicle_id },
            ..
        } = outcome
        {
            if overlay.vehicle_id().as_deref() == Some(vehicle_id.as_str()) {
                info!("Selected vehicle {} left the feed, closing its route", vehicle_id);
                overlay.close();
            }
        }
    }

    /// Opens the popup for a vehicle. A route overlay that follows a
    /// different vehicle is closed.
    pub fn select(&self, vehicle_id: &str) -> Option<Selection> {
        let selection = self.poller.select(vehicle_id)?;
        if self
            .overlay
            .vehicle_id()
            .is_some_and(|followed| followed != selection.vehicle_id)
        {
            self.overlay.close();
        }
        Some(selection)
    }

    pub async fn follow(&self, vehicle_id: &str) -> FollowOutcome {
        let Some(selection) = self.select(vehicle_id) else {
            return FollowOutcome::NotFound;
        };
        let overlay = self
            .overlay
            .start_if(vehicle_id, || {
                self.poller
                    .selection()
                    .is_some_and(|selected| selected.vehicle_id == vehicle_id)
            })
            .await;
        FollowOutcome::Following { selection, overlay }
    }

    pub fn clear_selection(&self) -> Option<Selection> {
        self.overlay.close();
        self.poller.clear_selection()
    }

    pub fn close_route(&self) {
        self.overlay.close();
    }

    pub fn spawn_polling(&self) -> JoinHandle<()> {
        let overlay = self.overlay.clone();
        self.poller
            .spawn_with(move |outcome| Self::close_dismissed(&overlay, outcome))
    }

    pub fn shutdown(&self) {
        info!("Shutting down live map");
        self.poller.stop();
        self.overlay.close();
    }
}
