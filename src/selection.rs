use serde::Serialize;
use tracing::{debug, info};

use crate::models::{Popup, VehicleFeature};
use crate::sink::MapStateSink;

/// The vehicle whose popup is open.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Selection {
    pub vehicle_id: String,
    pub anchor_coordinates: [f64; 2],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum SelectionChange {
    /// Nothing is selected.
    Idle,
    /// The popup follows the vehicle to its new position.
    Moved { vehicle_id: String, coordinates: [f64; 2] },
    /// The vehicle left the feed; the popup was removed.
    Dismissed { vehicle_id: String },
}

/// Keeps the popup anchored to the same vehicle across commits.
#[derive(Debug, Default)]
pub struct SelectionTracker {
    current: Option<Selection>,
}

impl SelectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&Selection> {
        self.current.as_ref()
    }

    /// Opens the popup for `vehicle_id` if it is part of `features`.
    /// An unknown id leaves the current selection untouched.
    pub fn select<S: MapStateSink>(
        &mut self,
        vehicle_id: &str,
        features: &[VehicleFeature],
        sink: &S,
    ) -> Option<Selection> {
        let feature = features.iter().find(|feature| feature.id == vehicle_id)?;

        let selection = Selection {
            vehicle_id: feature.id.clone(),
            anchor_coordinates: feature.coordinates,
        };
        sink.set_popup(Self::popup_for(feature));
        self.current = Some(selection.clone());
        info!("📌 Selected vehicle {}", vehicle_id);
        Some(selection)
    }

    pub fn clear<S: MapStateSink>(&mut self, sink: &S) -> Option<Selection> {
        let previous = self.current.take()?;
        sink.remove_popup();
        debug!("Selection of {} cleared", previous.vehicle_id);
        Some(previous)
    }

    /// Runs once per committed collection, after the commit.
    pub fn reconcile<S: MapStateSink>(
        &mut self,
        features: &[VehicleFeature],
        sink: &S,
    ) -> SelectionChange {
        let Some(selection) = self.current.as_mut() else {
            return SelectionChange::Idle;
        };

        match features.iter().find(|feature| feature.id == selection.vehicle_id) {
            Some(feature) => {
                selection.anchor_coordinates = feature.coordinates;
                sink.set_popup(Self::popup_for(feature));
                SelectionChange::Moved {
                    vehicle_id: feature.id.clone(),
                    coordinates: feature.coordinates,
                }
            }
            None => {
                let vehicle_id = selection.vehicle_id.clone();
                self.current = None;
                sink.remove_popup();
                info!("Vehicle {} left the feed, popup dismissed", vehicle_id);
                SelectionChange::Dismissed { vehicle_id }
            }
        }
    }

    fn popup_for(feature: &VehicleFeature) -> Popup {
        Popup {
            vehicle_id: feature.id.clone(),
            coordinates: feature.coordinates,
            content: feature.popup_content(),
        }
    }
}
