use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{LiveMapError, Result};

pub const DEFAULT_FEED_URL: &str = "https://data.itsfactory.fi/journeys/api/1/vehicle-activity";
pub const DEFAULT_STOP_POINTS_URL: &str = "https://data.itsfactory.fi/journeys/api/1/stop-points";
pub const DEFAULT_ROUTE_SHAPES: &str = "data/route_shapes.geojson";

// ============================================================================
// Filters
// ============================================================================

/// Restriction on one feed attribute. An empty `Only` set restricts nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "SelectorRepr", into = "SelectorRepr")]
pub enum Selector {
    #[default]
    All,
    Only(BTreeSet<String>),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SelectorRepr {
    Keyword(String),
    Codes(Vec<String>),
}

impl Selector {
    pub fn only<I, S>(codes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Selector::Only(codes.into_iter().map(Into::into).collect())
    }

    pub fn admits(&self, code: &str) -> bool {
        match self {
            Selector::All => true,
            Selector::Only(codes) => codes.is_empty() || codes.contains(code),
        }
    }
}

impl TryFrom<SelectorRepr> for Selector {
    type Error = String;

    fn try_from(repr: SelectorRepr) -> std::result::Result<Self, Self::Error> {
        match repr {
            SelectorRepr::Keyword(keyword) => keyword.parse(),
            SelectorRepr::Codes(codes) => Ok(Selector::only(codes)),
        }
    }
}

impl From<Selector> for SelectorRepr {
    fn from(selector: Selector) -> Self {
        match selector {
            Selector::All => SelectorRepr::Keyword("all".to_string()),
            Selector::Only(codes) => SelectorRepr::Codes(codes.into_iter().collect()),
        }
    }
}

impl FromStr for Selector {
    type Err = String;

    /// Accepts `all` or a comma-separated list of codes.
    fn from_str(input: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.eq_ignore_ascii_case("all") {
            return Ok(Selector::All);
        }
        Ok(Selector::only(
            trimmed
                .split(',')
                .map(str::trim)
                .filter(|code| !code.is_empty())
                .map(String::from),
        ))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selector::All => write!(f, "all"),
            Selector::Only(codes) => {
                let joined: Vec<&str> = codes.iter().map(String::as_str).collect();
                write!(f, "{}", joined.join(","))
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSet {
    #[serde(default)]
    pub lines: Selector,
    #[serde(default)]
    pub operators: Selector,
}

impl FilterSet {
    pub fn admits(&self, line_ref: &str, operator_ref: &str) -> bool {
        self.lines.admits(line_ref) && self.operators.admits(operator_ref)
    }
}

// ============================================================================
// Service Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct LiveMapConfig {
    pub feed_url: String,
    pub stop_points_url: String,
    /// HTTP(S) URL or local path of the route-shape GeoJSON.
    pub route_shapes: String,
    pub feed_interval: Duration,
    pub overlay_interval: Duration,
    pub request_timeout: Duration,
    pub filters: FilterSet,
    pub timezone: Tz,
    pub host: String,
    pub port: u16,
}

impl Default for LiveMapConfig {
    fn default() -> Self {
        LiveMapConfig {
            feed_url: DEFAULT_FEED_URL.to_string(),
            stop_points_url: DEFAULT_STOP_POINTS_URL.to_string(),
            route_shapes: DEFAULT_ROUTE_SHAPES.to_string(),
            feed_interval: Duration::from_millis(5_000),
            overlay_interval: Duration::from_millis(10_000),
            request_timeout: Duration::from_secs(15),
            filters: FilterSet::default(),
            timezone: chrono_tz::Europe::Helsinki,
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "nysse-live-map")]
#[command(about = "Live vehicle map state service for the Tampere journeys API")]
pub struct CliArgs {
    /// Vehicle-activity feed endpoint
    #[arg(long, default_value = DEFAULT_FEED_URL)]
    pub feed_url: String,

    /// Stop-point lookup endpoint (the stop code is appended as a path segment)
    #[arg(long, default_value = DEFAULT_STOP_POINTS_URL)]
    pub stop_points_url: String,

    /// Route-shape GeoJSON, either a URL or a local file
    #[arg(long, default_value = DEFAULT_ROUTE_SHAPES)]
    pub route_shapes: String,

    /// Vehicle feed poll interval in milliseconds
    #[arg(long, default_value_t = 5_000)]
    pub feed_interval_ms: u64,

    /// Route overlay poll interval in milliseconds
    #[arg(long, default_value_t = 10_000)]
    pub overlay_interval_ms: u64,

    /// Upstream request timeout in seconds
    #[arg(long, default_value_t = 15)]
    pub request_timeout_secs: u64,

    /// Lines to show: "all" or a comma-separated list
    #[arg(long, default_value = "all")]
    pub lines: Selector,

    /// Operators to show: "all" or a comma-separated list
    #[arg(long, default_value = "all")]
    pub operators: Selector,

    /// Time zone used for arrival labels
    #[arg(long, default_value = "Europe/Helsinki")]
    pub timezone: String,

    /// Address to bind the HTTP server to
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to run the HTTP server on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,
}

impl CliArgs {
    pub fn into_config(self) -> Result<LiveMapConfig> {
        if self.feed_interval_ms == 0 || self.overlay_interval_ms == 0 {
            return Err(LiveMapError::ConfigError(
                "Poll intervals must be greater than zero".to_string(),
            ));
        }

        let timezone = self
            .timezone
            .parse::<Tz>()
            .map_err(|e| LiveMapError::ConfigError(format!("Unknown time zone '{}': {}", self.timezone, e)))?;

        Ok(LiveMapConfig {
            feed_url: self.feed_url,
            stop_points_url: self.stop_points_url.trim_end_matches('/').to_string(),
            route_shapes: self.route_shapes,
            feed_interval: Duration::from_millis(self.feed_interval_ms),
            overlay_interval: Duration::from_millis(self.overlay_interval_ms),
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            filters: FilterSet {
                lines: self.lines,
                operators: self.operators,
            },
            timezone,
            host: self.host,
            port: self.port,
        })
    }
}
