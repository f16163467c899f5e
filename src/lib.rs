//! Keeps an in-memory map state in sync with the Tampere region live
//! vehicle feed: vehicle positions, the selected vehicle's popup, and the
//! live route overlay of a followed vehicle.

pub mod api;
pub mod config;
pub mod duration;
pub mod error;
pub mod live_map;
pub mod logger;
pub mod models;
pub mod names;
pub mod overlay;
pub mod poller;
pub mod selection;
pub mod server;
pub mod sink;
pub mod transform;

pub use api::{HttpTransitApi, TransitApi};
pub use config::{CliArgs, FilterSet, LiveMapConfig, Selector};
pub use duration::DurationParser;
pub use error::{LiveMapError, Result};
pub use live_map::{FollowOutcome, LiveMap};
pub use names::{NameCache, NameResolver, ResolveName};
pub use overlay::{OverlayNotice, OverlayOutcome, OverlayState, RefreshOutcome, RouteOverlayController};
pub use poller::{CycleOutcome, FeedPoller};
pub use selection::{Selection, SelectionChange, SelectionTracker};
pub use sink::{MapState, MapStateSink};
pub use transform::FeatureTransformer;
