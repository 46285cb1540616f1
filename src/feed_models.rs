// Feed models and data fetching for the Adelaide Metro GTFS-Realtime proxy
// Adelaide Metro open data: https://gtfs.adelaidemetro.com.au/
//
// Upstream endpoints:
// - GTFS-RT Vehicle Positions: https://gtfs.adelaidemetro.com.au/v1/realtime/vehicle_positions
// - Optional route metadata (ROUTES_JSON_URL): a JSON object keyed by route_id,
//   a GTFS routes.txt, or a GTFS zip containing routes.txt. Example shape:
//   { "AO1": { "short_name": "O-Bahn O1", "long_name": "City to Tea Tree", "color": "#ff6600" } }

use bytes::Bytes;
use chrono::Utc;
use gtfs_rt::FeedMessage;
use prost::Message;
use reqwest::blocking;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Cursor;
use std::io::Read;
use std::sync::Mutex;
use zip::ZipArchive;

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleRecord {
    pub id: String,
    pub route: Option<String>,
    pub route_short_name: Option<String>,
    pub route_long_name: Option<String>,
    pub route_color: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub bearing: Option<f64>,
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RouteMeta {
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub color: Option<String>,
}

pub type RoutesMeta = HashMap<String, RouteMeta>;

// One row of a GTFS routes.txt, resolved by header name
#[derive(Debug, Deserialize)]
struct RouteRow {
    route_id: String,
    #[serde(default)]
    route_short_name: Option<String>,
    #[serde(default)]
    route_long_name: Option<String>,
    #[serde(default)]
    route_color: Option<String>,
}

/// The most recent successfully decoded feed. Published whole into the cache
/// slot and never mutated afterwards; a refresh swaps in a new value.
#[derive(Debug, Clone)]
pub struct FeedSnapshot {
    pub vehicles: Vec<VehicleRecord>,
    pub fingerprint: String,
    pub etag: String,
    pub updated_ms: i64,
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
pub enum FeedError {
    NetworkError(String),
    UpstreamStatus(u16),
    ParseError(String),
}

impl std::fmt::Display for FeedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FeedError::NetworkError(e) => write!(f, "Network error: {}", e),
            FeedError::UpstreamStatus(status) => write!(f, "Upstream feed error {}", status),
            FeedError::ParseError(e) => write!(f, "Parse error: {}", e),
        }
    }
}

impl std::error::Error for FeedError {}

pub type Result<T> = std::result::Result<T, FeedError>;

// ============================================================================
// Freshness Cache
// ============================================================================

/// What one refresh attempt produced, as seen by the request that ran it.
#[derive(Debug)]
pub enum CacheOutcome {
    /// The fetch succeeded. `unchanged` is true when the raw bytes hashed to
    /// the same fingerprint as the held snapshot.
    Fresh {
        snapshot: FeedSnapshot,
        unchanged: bool,
    },
    /// The fetch failed but a snapshot younger than the stale window remains.
    Stale { snapshot: FeedSnapshot },
    /// The fetch failed and no usable snapshot exists.
    Failed { error: FeedError },
}

/// Single-slot cache for the vehicle positions feed.
///
/// The fetch itself runs outside the lock; only the compare-and-publish in
/// `apply_refresh` runs under it, so concurrent readers never observe a
/// half-updated snapshot.
#[derive(Default)]
pub struct FeedCache {
    slot: Mutex<Option<FeedSnapshot>>,
}

impl FeedCache {
    pub fn new() -> Self {
        FeedCache {
            slot: Mutex::new(None),
        }
    }

    /// Fold one fetch attempt into the cache and report what to serve.
    ///
    /// Unchanged content still counts as a successful refresh: the held
    /// records are kept (identical bytes decode identically) but the
    /// snapshot's retrieval time is renewed, so a later upstream failure
    /// measures staleness from this refresh, not the last content change.
    pub fn apply_refresh(
        &self,
        fetched: Result<(Bytes, Vec<VehicleRecord>)>,
        now_ms: i64,
    ) -> CacheOutcome {
        let mut slot = match self.slot.lock() {
            Ok(slot) => slot,
            Err(e) => {
                return CacheOutcome::Failed {
                    error: FeedError::NetworkError(format!("Failed to lock cache: {}", e)),
                };
            }
        };

        match fetched {
            Ok((raw, vehicles)) => {
                let fingerprint = FeedModels::fingerprint(&raw);
                let unchanged = slot
                    .as_ref()
                    .map(|prev| prev.fingerprint == fingerprint)
                    .unwrap_or(false);

                let vehicles = if unchanged {
                    slot.as_ref()
                        .map(|prev| prev.vehicles.clone())
                        .unwrap_or(vehicles)
                } else {
                    vehicles
                };

                let snapshot = FeedSnapshot {
                    vehicles,
                    etag: FeedModels::entity_tag(&fingerprint),
                    fingerprint,
                    updated_ms: now_ms,
                };
                *slot = Some(snapshot.clone());

                CacheOutcome::Fresh {
                    snapshot,
                    unchanged,
                }
            }
            Err(error) => match slot.as_ref() {
                Some(prev) if now_ms - prev.updated_ms < FeedModels::STALE_WINDOW_MS => {
                    CacheOutcome::Stale {
                        snapshot: prev.clone(),
                    }
                }
                _ => CacheOutcome::Failed { error },
            },
        }
    }
}

// ============================================================================
// Response Negotiation
// ============================================================================

/// The four response shapes of the vehicle positions endpoint.
#[derive(Debug)]
pub enum Negotiated {
    NotModified,
    Fresh { snapshot: FeedSnapshot },
    Stale { snapshot: FeedSnapshot },
    Error { error: FeedError },
}

// ============================================================================
// Main Implementation
// ============================================================================

pub struct FeedModels;

impl FeedModels {
    pub const DEFAULT_VEHICLE_POSITIONS_URL: &'static str =
        "https://gtfs.adelaidemetro.com.au/v1/realtime/vehicle_positions";
    pub const USER_AGENT: &'static str = "adelaide-buses-live/1.1";
    pub const REQUEST_TIMEOUT_SECS: u64 = 10;
    /// How long a held snapshot may still be served after a failed refresh.
    pub const STALE_WINDOW_MS: i64 = 2 * 60 * 1000;
    pub const ROUTES_REFRESH_INTERVAL_SECS: u64 = 15 * 60;

    fn create_http_client() -> Result<blocking::Client> {
        blocking::Client::builder()
            .user_agent(Self::USER_AGENT)
            .timeout(std::time::Duration::from_secs(Self::REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| FeedError::NetworkError(format!("Failed to create HTTP client: {}", e)))
    }

    /// One non-cached GET of the upstream feed. No retries here; the caller
    /// decides what a failure means.
    pub fn fetch_feed(url: &str) -> Result<Bytes> {
        let client = Self::create_http_client()?;

        let response = client.get(url).send().map_err(|e| {
            FeedError::NetworkError(format!("Failed to fetch vehicle positions: {}", e))
        })?;

        if !response.status().is_success() {
            return Err(FeedError::UpstreamStatus(response.status().as_u16()));
        }

        response.bytes().map_err(|e| {
            FeedError::NetworkError(format!("Failed to read vehicles response: {}", e))
        })
    }

    /// Decode the raw protobuf into normalized records. Entities without a
    /// usable position are dropped; route metadata is joined by exact
    /// route_id match and missing keys simply leave the enrichment empty.
    pub fn decode_vehicles(body: &[u8], routes: &RoutesMeta) -> Result<Vec<VehicleRecord>> {
        let feed = FeedMessage::decode(body)
            .map_err(|e| FeedError::ParseError(format!("Failed to decode vehicles feed: {}", e)))?;

        let vehicles = feed
            .entity
            .into_iter()
            .filter_map(|entity| {
                let vehicle = entity.vehicle?;
                let position = vehicle.position.as_ref()?;

                let lat = position.latitude as f64;
                let lon = position.longitude as f64;
                if !lat.is_finite() || !lon.is_finite() {
                    return None;
                }

                let id = Self::vehicle_display_id(vehicle.vehicle.as_ref(), &entity.id)?;

                let route = vehicle
                    .trip
                    .as_ref()
                    .and_then(|t| t.route_id.clone())
                    .filter(|r| !r.is_empty());

                let (short_name, long_name, color) =
                    match route.as_ref().and_then(|r| routes.get(r)) {
                        Some(meta) => (
                            meta.short_name.clone(),
                            meta.long_name.clone(),
                            meta.color.clone(),
                        ),
                        None => (None, None, None),
                    };

                Some(VehicleRecord {
                    id,
                    route,
                    route_short_name: short_name,
                    route_long_name: long_name,
                    route_color: color,
                    lat,
                    lon,
                    bearing: position.bearing.map(|b| b as f64),
                    timestamp: vehicle.timestamp.map(|ts| ts as i64 * 1000),
                })
            })
            .collect();

        Ok(vehicles)
    }

    pub fn fetch_and_decode(url: &str, routes: &RoutesMeta) -> Result<(Bytes, Vec<VehicleRecord>)> {
        let raw = Self::fetch_feed(url)?;
        let vehicles = Self::decode_vehicles(&raw, routes)?;
        Ok((raw, vehicles))
    }

    // First non-empty of [vehicle label, vehicle id, entity id]
    fn vehicle_display_id(
        descriptor: Option<&gtfs_rt::VehicleDescriptor>,
        entity_id: &str,
    ) -> Option<String> {
        descriptor
            .and_then(|d| d.label.clone())
            .filter(|label| !label.is_empty())
            .or_else(|| {
                descriptor
                    .and_then(|d| d.id.clone())
                    .filter(|id| !id.is_empty())
            })
            .or_else(|| Some(entity_id.to_string()))
            .filter(|id| !id.is_empty())
    }

    /// Content hash of the raw upstream bytes. Same bytes always hash alike.
    pub fn fingerprint(raw: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(raw);
        hex::encode(hasher.finalize())
    }

    /// Client-facing entity tag, derived from the same bytes as the
    /// internal fingerprint.
    pub fn entity_tag(fingerprint: &str) -> String {
        format!("\"{}\"", fingerprint)
    }

    pub fn current_timestamp_ms() -> i64 {
        Utc::now().timestamp_millis()
    }

    /// Map a refresh outcome plus the client's `If-None-Match` value to a
    /// response shape. A 304 is only possible when the upstream content was
    /// unchanged and the client already holds the current entity tag; the
    /// stale path always resends the full body.
    pub fn negotiate(outcome: CacheOutcome, if_none_match: Option<&str>) -> Negotiated {
        match outcome {
            CacheOutcome::Fresh {
                snapshot,
                unchanged,
            } => {
                if unchanged && if_none_match == Some(snapshot.etag.as_str()) {
                    Negotiated::NotModified
                } else {
                    Negotiated::Fresh { snapshot }
                }
            }
            CacheOutcome::Stale { snapshot } => Negotiated::Stale { snapshot },
            CacheOutcome::Failed { error } => Negotiated::Error { error },
        }
    }

    // ============================================================================
    // Route Metadata Loading
    // ============================================================================

    pub fn load_routes_meta(url: &str) -> Result<RoutesMeta> {
        let client = Self::create_http_client()?;

        let response = client.get(url).send().map_err(|e| {
            FeedError::NetworkError(format!("Failed to fetch routes metadata: {}", e))
        })?;

        if !response.status().is_success() {
            return Err(FeedError::UpstreamStatus(response.status().as_u16()));
        }

        let body = response
            .bytes()
            .map_err(|e| FeedError::NetworkError(format!("Failed to read routes response: {}", e)))?;

        Self::parse_routes_meta(url, &body)
    }

    /// The metadata source may be a JSON object keyed by route_id, a bare
    /// GTFS routes.txt, or a GTFS zip containing one; picked by URL suffix.
    pub fn parse_routes_meta(source: &str, body: &[u8]) -> Result<RoutesMeta> {
        let path = source.split('?').next().unwrap_or(source);

        if path.ends_with(".zip") {
            Self::parse_routes_zip(body)
        } else if path.ends_with(".txt") || path.ends_with(".csv") {
            Ok(Self::parse_routes_txt(body))
        } else {
            serde_json::from_slice(body)
                .map_err(|e| FeedError::ParseError(format!("Failed to parse routes JSON: {}", e)))
        }
    }

    fn parse_routes_txt(contents: &[u8]) -> RoutesMeta {
        let mut routes = RoutesMeta::new();
        let mut rdr = csv::Reader::from_reader(contents);

        for result in rdr.deserialize::<RouteRow>() {
            if let Ok(row) = result {
                if row.route_id.is_empty() {
                    continue;
                }
                routes.insert(
                    row.route_id,
                    RouteMeta {
                        short_name: row.route_short_name.filter(|s| !s.is_empty()),
                        long_name: row.route_long_name.filter(|s| !s.is_empty()),
                        // GTFS colors are bare RRGGBB; normalize to the
                        // "#"-prefixed form the JSON source uses
                        color: row
                            .route_color
                            .filter(|c| c.len() == 6)
                            .map(|c| format!("#{}", c)),
                    },
                );
            }
        }

        routes
    }

    fn parse_routes_zip(bytes: &[u8]) -> Result<RoutesMeta> {
        let cursor = Cursor::new(bytes);
        let mut archive = ZipArchive::new(cursor)
            .map_err(|e| FeedError::ParseError(format!("Failed to open GTFS zip: {}", e)))?;

        let mut routes_file = archive
            .by_name("routes.txt")
            .map_err(|e| FeedError::ParseError(format!("routes.txt not found: {}", e)))?;

        let mut contents = String::new();
        routes_file
            .read_to_string(&mut contents)
            .map_err(|e| FeedError::ParseError(format!("Failed to read routes.txt: {}", e)))?;

        Ok(Self::parse_routes_txt(contents.as_bytes()))
    }
}

// ============================================================================
// Tests
// ============================================================================
