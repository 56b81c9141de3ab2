//! Vehicle-record lookup collaborator.
//!
//! The gateway never owns vehicle records; it asks a [`VehicleDirectory`].
//! Two implementations ship:
//!
//! - [`InMemoryVehicleDirectory`] – seeded from configuration, for local runs.
//! - [`HttpVehicleDirectory`] – calls an external record service over HTTP.
//!
//! Every lookup made on behalf of a request is wrapped in [`with_deadline`],
//! which bounds it by the request deadline and by process shutdown.

use std::future::Future;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use fleetcast_types::{LookupError, Vehicle, VehiclePage};
use reqwest::Url;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default bound on a single lookup.
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Page size used by the record store when the caller asks for none.
pub const RECORD_STORE_PAGE_SIZE: u32 = 10;

#[async_trait]
pub trait VehicleDirectory: Send + Sync {
    /// Look a vehicle up by its stable identifier (VIN or record id).
    async fn get_vehicle(&self, id: &str) -> Result<Vehicle, LookupError>;

    /// One page of vehicles, newest first.  `page` is 1-based; zero values
    /// fall back to page 1 and [`RECORD_STORE_PAGE_SIZE`].
    async fn list_vehicles(&self, page: u32, page_size: u32) -> Result<VehiclePage, LookupError>;
}

/// Run `lookup`, giving up after `deadline` or when `cancel` fires.
pub async fn with_deadline<T, F>(
    deadline: Duration,
    cancel: &CancellationToken,
    lookup: F,
) -> Result<T, LookupError>
where
    F: Future<Output = Result<T, LookupError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LookupError::Cancelled),
        result = tokio::time::timeout(deadline, lookup) => {
            result.unwrap_or(Err(LookupError::DeadlineExceeded(deadline)))
        }
    }
}

fn normalize_page(page: u32, page_size: u32) -> (u32, u32) {
    let page = if page < 1 { 1 } else { page };
    let page_size = if page_size < 1 { RECORD_STORE_PAGE_SIZE } else { page_size };
    (page, page_size)
}

// ---------------------------------------------------------------------------
// In-memory directory
// ---------------------------------------------------------------------------

/// Directory held in process memory, in insertion order.
#[derive(Default)]
pub struct InMemoryVehicleDirectory {
    vehicles: RwLock<Vec<Vehicle>>,
}

impl InMemoryVehicleDirectory {
    pub fn new(vehicles: impl IntoIterator<Item = Vehicle>) -> Self {
        Self {
            vehicles: RwLock::new(vehicles.into_iter().collect()),
        }
    }

    /// Add or replace (by VIN) a vehicle record.
    pub fn upsert(&self, vehicle: Vehicle) {
        let mut vehicles = self.vehicles.write().unwrap_or_else(|p| p.into_inner());
        match vehicles.iter_mut().find(|v| v.vin == vehicle.vin) {
            Some(existing) => *existing = vehicle,
            None => vehicles.push(vehicle),
        }
    }

    pub fn len(&self) -> usize {
        self.vehicles.read().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VehicleDirectory for InMemoryVehicleDirectory {
    async fn get_vehicle(&self, id: &str) -> Result<Vehicle, LookupError> {
        if id.trim().is_empty() {
            return Err(LookupError::InvalidArgument("vehicle_id is required".into()));
        }
        let vehicles = self.vehicles.read().unwrap_or_else(|p| p.into_inner());
        vehicles
            .iter()
            .find(|v| v.vin == id || v.id == id)
            .cloned()
            .ok_or_else(|| LookupError::NotFound(id.to_string()))
    }

    async fn list_vehicles(&self, page: u32, page_size: u32) -> Result<VehiclePage, LookupError> {
        let (page, page_size) = normalize_page(page, page_size);
        let vehicles = self.vehicles.read().unwrap_or_else(|p| p.into_inner());
        let offset = (page as usize - 1).saturating_mul(page_size as usize);
        let items = vehicles
            .iter()
            .rev()
            .skip(offset)
            .take(page_size as usize)
            .cloned()
            .collect();
        Ok(VehiclePage {
            items,
            total: vehicles.len() as u64,
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP directory
// ---------------------------------------------------------------------------

/// Envelope returned by the record service.
#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

/// Directory backed by an external record service exposing
/// `GET {base}/api/v1/vehicles/{id}` and
/// `GET {base}/api/v1/vehicles?page=&pageSize=`, both answering with a
/// `{"code":200,"data":...}` envelope.
#[derive(Clone)]
pub struct HttpVehicleDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVehicleDirectory {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// `{base}/api/v1/vehicles[/{id}]`, with `id` escaped as one path segment.
    fn endpoint(&self, id: Option<&str>) -> Result<Url, LookupError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| LookupError::Upstream(format!("invalid record service url {:?}: {e}", self.base_url)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|()| LookupError::Upstream(format!("record service url {:?} cannot take a path", self.base_url)))?;
            segments.pop_if_empty().extend(["api", "v1", "vehicles"]);
            if let Some(id) = id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    async fn fetch<T: DeserializeOwned>(&self, url: Url, not_found: &str) -> Result<T, LookupError> {
        debug!(url = %url, "querying vehicle record service");
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| LookupError::Upstream(e.to_string()))?;

        match response.status() {
            reqwest::StatusCode::NOT_FOUND => Err(LookupError::NotFound(not_found.to_string())),
            reqwest::StatusCode::BAD_REQUEST => Err(LookupError::InvalidArgument(
                response.text().await.unwrap_or_default(),
            )),
            status if !status.is_success() => Err(LookupError::Upstream(format!("record service answered {status}"))),
            _ => response
                .json::<Envelope<T>>()
                .await
                .map(|envelope| envelope.data)
                .map_err(|e| LookupError::Upstream(e.to_string())),
        }
    }
}

#[async_trait]
impl VehicleDirectory for HttpVehicleDirectory {
    async fn get_vehicle(&self, id: &str) -> Result<Vehicle, LookupError> {
        if id.trim().is_empty() {
            return Err(LookupError::InvalidArgument("vehicle_id is required".into()));
        }
        self.fetch(self.endpoint(Some(id))?, id).await
    }

    async fn list_vehicles(&self, page: u32, page_size: u32) -> Result<VehiclePage, LookupError> {
        let (page, page_size) = normalize_page(page, page_size);
        let mut url = self.endpoint(None)?;
        url.query_pairs_mut()
            .append_pair("page", &page.to_string())
            .append_pair("pageSize", &page_size.to_string());
        let mut listing: VehiclePage = self.fetch(url, "").await?;
        listing.items.truncate(page_size as usize);
        Ok(listing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, Query};
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};
    use fleetcast_types::VehicleStatus;
    use std::collections::HashMap;

    fn vehicle(n: u32) -> Vehicle {
        Vehicle {
            id: n.to_string(),
            vin: format!("VIN-{n}"),
            license_plate: format!("沪A{n:05}"),
            status: VehicleStatus::Online,
        }
    }

    #[tokio::test]
    async fn get_by_vin_or_id() {
        let dir = InMemoryVehicleDirectory::new([vehicle(1), vehicle(2)]);
        assert_eq!(dir.get_vehicle("VIN-2").await.unwrap().id, "2");
        assert_eq!(dir.get_vehicle("1").await.unwrap().vin, "VIN-1");
        assert_eq!(
            dir.get_vehicle("VIN-9").await,
            Err(LookupError::NotFound("VIN-9".into()))
        );
        assert!(matches!(dir.get_vehicle("").await, Err(LookupError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn listing_is_newest_first_and_paginated() {
        let dir = InMemoryVehicleDirectory::new((1..=25).map(vehicle));
        let first = dir.list_vehicles(1, 10).await.unwrap();
        assert_eq!(first.total, 25);
        assert_eq!(first.items.len(), 10);
        assert_eq!(first.items[0].vin, "VIN-25");

        let last = dir.list_vehicles(3, 10).await.unwrap();
        assert_eq!(last.items.len(), 5);
        assert_eq!(last.items[4].vin, "VIN-1");

        let beyond = dir.list_vehicles(9, 10).await.unwrap();
        assert!(beyond.items.is_empty());
        assert_eq!(beyond.total, 25);
    }

    #[tokio::test]
    async fn zero_page_arguments_fall_back_to_record_store_defaults() {
        let dir = InMemoryVehicleDirectory::new((1..=25).map(vehicle));
        let page = dir.list_vehicles(0, 0).await.unwrap();
        assert_eq!(page.items.len(), RECORD_STORE_PAGE_SIZE as usize);
        assert_eq!(page.items[0].vin, "VIN-25");
    }

    #[tokio::test]
    async fn upsert_replaces_by_vin() {
        let dir = InMemoryVehicleDirectory::default();
        dir.upsert(vehicle(1));
        let mut changed = vehicle(1);
        changed.status = VehicleStatus::Offline;
        dir.upsert(changed);
        assert_eq!(dir.len(), 1);
        assert_eq!(dir.get_vehicle("VIN-1").await.unwrap().status, VehicleStatus::Offline);
    }

    #[tokio::test]
    async fn deadline_is_enforced() {
        let cancel = CancellationToken::new();
        let result: Result<(), _> = with_deadline(Duration::from_millis(20), &cancel, async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert_eq!(result, Err(LookupError::DeadlineExceeded(Duration::from_millis(20))));
    }

    #[tokio::test]
    async fn cancellation_aborts_lookup() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<(), _> =
            with_deadline(DEFAULT_LOOKUP_TIMEOUT, &cancel, std::future::pending()).await;
        assert_eq!(result, Err(LookupError::Cancelled));
    }

    #[tokio::test]
    async fn fast_lookup_passes_through() {
        let cancel = CancellationToken::new();
        let result = with_deadline(DEFAULT_LOOKUP_TIMEOUT, &cancel, async { Ok(7) }).await;
        assert_eq!(result, Ok(7));
    }

    /// Stand-in for the external record service.
    async fn record_service() -> Result<String, Box<dyn std::error::Error>> {
        async fn one(Path(id): Path<String>) -> axum::response::Response {
            if id == "VIN-1" {
                Json(serde_json::json!({"code":200,"message":"success","data":vehicle(1)})).into_response()
            } else if id == "odd/id?x=1#frag" {
                Json(serde_json::json!({"code":200,"message":"success","data":vehicle(2)})).into_response()
            } else {
                (StatusCode::NOT_FOUND, Json(serde_json::json!({"error":"vehicle not found"}))).into_response()
            }
        }
        async fn list(Query(q): Query<HashMap<String, String>>) -> Json<serde_json::Value> {
            let size: usize = q.get("pageSize").and_then(|s| s.parse().ok()).unwrap_or(10);
            let items: Vec<Vehicle> = (1..=3).map(vehicle).take(size).collect();
            Json(serde_json::json!({"code":200,"data":{"items":items,"total":3}}))
        }

        let app = Router::new()
            .route("/api/v1/vehicles/{id}", get(one))
            .route("/api/v1/vehicles", get(list));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(async move { axum::serve(listener, app).await });
        Ok(format!("http://{addr}/"))
    }

    #[tokio::test]
    async fn http_directory_talks_to_record_service() -> Result<(), Box<dyn std::error::Error>> {
        let dir = HttpVehicleDirectory::new(record_service().await?);

        let found = dir.get_vehicle("VIN-1").await?;
        assert_eq!(found, vehicle(1));
        assert_eq!(
            dir.get_vehicle("VIN-404").await,
            Err(LookupError::NotFound("VIN-404".into()))
        );

        let page = dir.list_vehicles(1, 2).await?;
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn http_directory_escapes_reserved_characters_in_ids() -> Result<(), Box<dyn std::error::Error>> {
        let dir = HttpVehicleDirectory::new(record_service().await?);

        // Reaches the single-vehicle route with the id intact, not a sub-path,
        // query or fragment.
        assert_eq!(dir.get_vehicle("odd/id?x=1#frag").await?, vehicle(2));
        assert_eq!(
            dir.get_vehicle("VIN-1/../x").await,
            Err(LookupError::NotFound("VIN-1/../x".into()))
        );

        let url = dir.endpoint(Some("a/b?c#d"))?;
        assert!(url.as_str().ends_with("/api/v1/vehicles/a%2Fb%3Fc%23d"), "{url}");
        Ok(())
    }

    #[test]
    fn invalid_base_url_is_an_upstream_error() {
        let dir = HttpVehicleDirectory::new("not a url");
        assert!(matches!(dir.endpoint(None), Err(LookupError::Upstream(_))));
    }

    #[tokio::test]
    async fn http_directory_reports_unreachable_service() {
        let dir = HttpVehicleDirectory::new("http://127.0.0.1:1");
        assert!(matches!(dir.get_vehicle("VIN-1").await, Err(LookupError::Upstream(_))));
    }
}
