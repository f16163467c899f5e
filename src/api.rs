use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use geojson::{FeatureCollection, GeoJson};
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::config::LiveMapConfig;
use crate::error::{LiveMapError, Result};
use crate::models::{ApiEnvelope, StopPoint, VehicleActivity};

/// Upstream reads needed by the poller and the route overlay.
pub trait TransitApi: Send + Sync + 'static {
    /// Current vehicle-activity snapshot.
    fn vehicle_activity(&self) -> impl Future<Output = Result<Vec<VehicleActivity>>> + Send;

    /// First stop point record for `code`, `None` when the body is empty.
    fn stop_point(&self, code: &str) -> impl Future<Output = Result<Option<StopPoint>>> + Send;

    /// Static route-shape dataset.
    fn route_shapes(&self) -> impl Future<Output = Result<FeatureCollection>> + Send;
}

pub struct HttpTransitApi {
    client: Client,
    feed_url: String,
    stop_points_url: String,
    route_shapes: String,
}

impl HttpTransitApi {
    pub fn new(config: &LiveMapConfig) -> Result<Self> {
        let client = Self::create_http_client(config.request_timeout)?;
        Ok(HttpTransitApi {
            client,
            feed_url: config.feed_url.clone(),
            stop_points_url: config.stop_points_url.trim_end_matches('/').to_string(),
            route_shapes: config.route_shapes.clone(),
        })
    }

    fn create_http_client(timeout: Duration) -> Result<Client> {
        Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LiveMapError::NetworkError(format!("Failed to create HTTP client: {}", e)))
    }

    async fn get_envelope<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
        what: &str,
    ) -> Result<ApiEnvelope<T>> {
        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| LiveMapError::NetworkError(format!("Failed to fetch {}: {}", what, e)))?;

        if !response.status().is_success() {
            return Err(LiveMapError::StatusError(format!(
                "{} request returned {}",
                what,
                response.status()
            )));
        }

        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| LiveMapError::ParseError(format!("Invalid {} response: {}", what, e)))?;

        if !envelope.is_success() {
            return Err(LiveMapError::StatusError(format!(
                "{} response status '{}'",
                what,
                envelope.status.as_deref().unwrap_or_default()
            )));
        }

        Ok(envelope)
    }

    fn is_remote(location: &str) -> bool {
        location.starts_with("http://") || location.starts_with("https://")
    }
}

impl TransitApi for HttpTransitApi {
    async fn vehicle_activity(&self) -> Result<Vec<VehicleActivity>> {
        // Cache buster, the feed is served through caching proxies.
        let timestamp = Utc::now().timestamp_millis().to_string();
        let envelope: ApiEnvelope<serde_json::Value> = self
            .get_envelope(&self.feed_url, &[("timestamp", timestamp)], "vehicle activity")
            .await?;

        Ok(VehicleActivity::parse_snapshot(envelope.body))
    }

    async fn stop_point(&self, code: &str) -> Result<Option<StopPoint>> {
        let url = format!("{}/{}", self.stop_points_url, code);
        let envelope: ApiEnvelope<StopPoint> = self.get_envelope(&url, &[], "stop point").await?;
        Ok(envelope.body.into_iter().next())
    }

    async fn route_shapes(&self) -> Result<FeatureCollection> {
        let text = if Self::is_remote(&self.route_shapes) {
            let response = self
                .client
                .get(&self.route_shapes)
                .send()
                .await
                .map_err(|e| LiveMapError::NetworkError(format!("Failed to fetch route shapes: {}", e)))?;

            if !response.status().is_success() {
                return Err(LiveMapError::StatusError(format!(
                    "route shapes request returned {}",
                    response.status()
                )));
            }

            response
                .text()
                .await
                .map_err(|e| LiveMapError::NetworkError(format!("Failed to read route shapes: {}", e)))?
        } else {
            tokio::fs::read_to_string(&self.route_shapes)
                .await
                .map_err(|e| {
                    LiveMapError::FileError(format!("Failed to read {}: {}", self.route_shapes, e))
                })?
        };

        debug!("Route shape dataset loaded ({} KB)", text.len() / 1024);
        parse_feature_collection(&text)
    }
}

pub fn parse_feature_collection(text: &str) -> Result<FeatureCollection> {
    let geojson = text
        .parse::<GeoJson>()
        .map_err(|e| LiveMapError::ParseError(format!("Invalid route shape GeoJSON: {}", e)))?;

    FeatureCollection::try_from(geojson)
        .map_err(|e| LiveMapError::ParseError(format!("Route shapes are not a FeatureCollection: {}", e)))
}
