//! The rendering surface as seen by the reconciliation logic.
//!
//! The core only ever issues commands through [`MapStateSink`]. [`MapState`]
//! keeps the resulting surface in memory for the HTTP layer to serve.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use geojson::FeatureCollection;
use serde::Serialize;

use crate::models::Popup;

pub const VEHICLES_SOURCE: &str = "vehicles";
pub const VEHICLES_LAYER: &str = "vehicles-layer";
pub const ROUTE_STOPS_SOURCE: &str = "route-stops-live";
pub const ROUTE_STOPS_LAYER: &str = "route-stops-live-layer";
pub const ROUTE_SHAPE_SOURCE: &str = "route-shape";
pub const ROUTE_SHAPE_LAYER: &str = "route-shape-layer";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerKind {
    Symbol,
    Line,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerSpec {
    pub id: String,
    pub source: String,
    pub kind: LayerKind,
}

impl LayerSpec {
    pub fn new(id: &str, source: &str, kind: LayerKind) -> Self {
        LayerSpec {
            id: id.to_string(),
            source: source.to_string(),
            kind,
        }
    }
}

/// Fire-and-forget commands understood by the rendering surface. Calls must
/// be cheap: they are issued from inside the poll loops.
pub trait MapStateSink: Send + Sync + 'static {
    /// Creates or atomically replaces a named source.
    fn set_source(&self, name: &str, collection: FeatureCollection);
    /// Puts a layer on top of the stack, or replaces it in place if present.
    fn add_layer(&self, layer: LayerSpec);
    fn remove_layer(&self, id: &str);
    fn remove_source(&self, name: &str);
    /// Moves `id` directly beneath `reference`. No-op if either is missing.
    fn move_layer_below(&self, id: &str, reference: &str);
    /// Opens the popup or moves it if already open.
    fn set_popup(&self, popup: Popup);
    fn remove_popup(&self);
}

#[derive(Debug, Default)]
struct Surface {
    sources: BTreeMap<String, FeatureCollection>,
    // index 0 is the bottom of the stack
    layers: Vec<LayerSpec>,
    popup: Option<Popup>,
}

#[derive(Debug, Default)]
pub struct MapState {
    surface: Mutex<Surface>,
}

impl MapState {
    pub fn new() -> Self {
        Self::default()
    }

    fn surface(&self) -> MutexGuard<'_, Surface> {
        self.surface.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn source(&self, name: &str) -> Option<FeatureCollection> {
        self.surface().sources.get(name).cloned()
    }

    pub fn source_names(&self) -> Vec<String> {
        self.surface().sources.keys().cloned().collect()
    }

    pub fn layers(&self) -> Vec<LayerSpec> {
        self.surface().layers.clone()
    }

    pub fn popup(&self) -> Option<Popup> {
        self.surface().popup.clone()
    }
}

impl MapStateSink for MapState {
    fn set_source(&self, name: &str, collection: FeatureCollection) {
        self.surface().sources.insert(name.to_string(), collection);
    }

    fn add_layer(&self, layer: LayerSpec) {
        let mut surface = self.surface();
        match surface.layers.iter().position(|existing| existing.id == layer.id) {
            Some(index) => surface.layers[index] = layer,
            None => surface.layers.push(layer),
        }
    }

    fn remove_layer(&self, id: &str) {
        self.surface().layers.retain(|layer| layer.id != id);
    }

    fn remove_source(&self, name: &str) {
        self.surface().sources.remove(name);
    }

    fn move_layer_below(&self, id: &str, reference: &str) {
        let mut surface = self.surface();
        let Some(from) = surface.layers.iter().position(|layer| layer.id == id) else {
            return;
        };
        if !surface.layers.iter().any(|layer| layer.id == reference) || id == reference {
            return;
        }

        let layer = surface.layers.remove(from);
        if let Some(to) = surface.layers.iter().position(|layer| layer.id == reference) {
            surface.layers.insert(to, layer);
        }
    }

    fn set_popup(&self, popup: Popup) {
        self.surface().popup = Some(popup);
    }

    fn remove_popup(&self) {
        self.surface().popup = None;
    }
}
