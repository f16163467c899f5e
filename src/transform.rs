use std::collections::HashMap;

use tracing::debug;

use crate::config::FilterSet;
use crate::duration::DurationParser;
use crate::models::{VehicleActivity, VehicleFeature};
use crate::names::ResolveName;

pub struct FeatureTransformer;

impl FeatureTransformer {
    /// Builds the map feature for one feed record, or `None` when the record
    /// is filtered out or has no usable position. Rejected records never
    /// trigger a name lookup.
    pub async fn transform<R: ResolveName>(
        activity: &VehicleActivity,
        filters: &FilterSet,
        names: &R,
    ) -> Option<VehicleFeature> {
        let journey = activity.journey();

        if journey.vehicle_ref.is_empty() {
            debug!("Skipping vehicle record without vehicleRef");
            return None;
        }

        if !filters.admits(&journey.line_ref, &journey.operator_ref) {
            return None;
        }

        let coordinates = match journey.vehicle_location.as_ref().and_then(|l| l.coordinates()) {
            Some(coordinates) => coordinates,
            None => {
                debug!("Skipping vehicle {}: invalid coordinates", journey.vehicle_ref);
                return None;
            }
        };

        let delay_minutes = journey
            .delay
            .as_deref()
            .map(DurationParser::parse_minutes)
            .unwrap_or(0.0);

        let bearing = journey
            .bearing
            .as_ref()
            .map(|bearing| bearing.as_f64())
            .filter(|bearing| bearing.is_finite())
            .map(|bearing| bearing.trunc() as i32)
            .unwrap_or(0);

        let destination_name = match journey.destination_short_name.as_deref() {
            Some(code) if !code.trim().is_empty() => names.resolve(code).await,
            _ => String::new(),
        };

        Some(VehicleFeature {
            id: journey.vehicle_ref.clone(),
            coordinates,
            line_ref: journey.line_ref.clone(),
            operator_ref: journey.operator_ref.clone(),
            destination_name,
            delay_minutes,
            bearing,
        })
    }

    /// Collapses duplicate ids: the last record in input order wins and keeps
    /// its own position.
    pub fn dedupe(features: Vec<VehicleFeature>) -> Vec<VehicleFeature> {
        let last_index: HashMap<String, usize> = features
            .iter()
            .enumerate()
            .map(|(index, feature)| (feature.id.clone(), index))
            .collect();

        if last_index.len() == features.len() {
            return features;
        }

        debug!(
            "Dropping {} duplicate vehicle ids",
            features.len() - last_index.len()
        );
        features
            .into_iter()
            .enumerate()
            .filter(|(index, feature)| last_index.get(&feature.id) == Some(index))
            .map(|(_, feature)| feature)
            .collect()
    }
}
