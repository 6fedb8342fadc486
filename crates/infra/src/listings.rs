use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use haggle_domain::DomainResult;
use haggle_domain::error::DomainError;
use haggle_domain::listing::{ListingStatus, ListingSummary};
use haggle_domain::ports::listings::ListingDirectory;
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::RwLock;
use tokio::time::sleep;

use crate::config::AppConfig;

/// Listing lookup backed by a map, used for local runs and tests.
#[derive(Clone, Default)]
pub struct InMemoryListingDirectory {
    listings: Arc<RwLock<HashMap<String, ListingSummary>>>,
}

impl InMemoryListingDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_listings(listings: impl IntoIterator<Item = ListingSummary>) -> Self {
        let listings = listings
            .into_iter()
            .map(|listing| (listing.listing_id.clone(), listing))
            .collect();
        Self {
            listings: Arc::new(RwLock::new(listings)),
        }
    }

    /// Reads a JSON array of listings.
    pub fn from_seed_file(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let listings: Vec<ListingSummary> = serde_json::from_str(&raw)?;
        Ok(Self::with_listings(listings))
    }

    pub async fn upsert(&self, listing: ListingSummary) {
        self.listings
            .write()
            .await
            .insert(listing.listing_id.clone(), listing);
    }
}

impl ListingDirectory for InMemoryListingDirectory {
    fn get_listing(
        &self,
        listing_id: &str,
    ) -> haggle_domain::ports::BoxFuture<'_, DomainResult<Option<ListingSummary>>> {
        let listing_id = listing_id.to_string();
        let listings = self.listings.clone();
        Box::pin(async move { Ok(listings.read().await.get(&listing_id).cloned()) })
    }
}

/// Reads listings from the marketplace API: `GET {base}/listings/{id}`.
#[derive(Clone, Debug)]
pub struct HttpListingDirectory {
    http: reqwest::Client,
    base_url: String,
    retry_max_attempts: u32,
    retry_backoff_base: Duration,
    retry_backoff_max: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListingEnvelope {
    Wrapped { data: ListingData },
    Bare(ListingWire),
}

#[derive(Debug, Deserialize)]
struct ListingData {
    listing: ListingWire,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OwnerRef {
    Id(String),
    Populated {
        #[serde(alias = "_id")]
        id: String,
    },
}

#[derive(Debug, Deserialize)]
struct ListingWire {
    #[serde(alias = "_id", alias = "id")]
    listing_id: String,
    #[serde(alias = "seller", alias = "seller_id")]
    owner_id: OwnerRef,
    status: ListingStatus,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    price: Option<f64>,
}

impl From<ListingEnvelope> for ListingSummary {
    fn from(envelope: ListingEnvelope) -> Self {
        let wire = match envelope {
            ListingEnvelope::Wrapped { data } => data.listing,
            ListingEnvelope::Bare(wire) => wire,
        };
        let owner_id = match wire.owner_id {
            OwnerRef::Id(id) | OwnerRef::Populated { id } => id,
        };
        ListingSummary {
            listing_id: wire.listing_id,
            owner_id,
            status: wire.status,
            title: wire.title,
            price: wire.price,
        }
    }
}

impl HttpListingDirectory {
    pub fn from_config(config: &AppConfig) -> Self {
        let timeout = Duration::from_millis(config.listing_timeout_ms.max(1));
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: config.listing_base_url.trim_end_matches('/').to_string(),
            retry_max_attempts: config.listing_retry_max_attempts.max(1),
            retry_backoff_base: Duration::from_millis(config.listing_retry_backoff_base_ms),
            retry_backoff_max: Duration::from_millis(config.listing_retry_backoff_max_ms),
        }
    }

    async fn fetch(&self, listing_id: &str) -> DomainResult<Option<ListingSummary>> {
        let attempts = self.retry_max_attempts;
        let url = listing_url(&self.base_url, listing_id)?;

        for attempt in 0..attempts {
            let retries_left = attempt + 1 < attempts;
            let response = match self
                .http
                .get(url.clone())
                .header("accept", "application/json")
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) if retries_left => {
                    tracing::debug!(attempt, error = %err, "listing lookup transport failure, retrying");
                    sleep(self.backoff(attempt)).await;
                    continue;
                }
                Err(err) => {
                    metrics::counter!("haggle_listing_lookup_failures_total").increment(1);
                    return Err(DomainError::Dependency(format!(
                        "listing service unreachable: {err}"
                    )));
                }
            };

            let status = response.status();
            if status.is_success() {
                let envelope = response.json::<ListingEnvelope>().await.map_err(|err| {
                    DomainError::Dependency(format!("invalid listing payload: {err}"))
                })?;
                let listing = ListingSummary::from(envelope);
                if listing.listing_id != listing_id {
                    metrics::counter!("haggle_listing_lookup_failures_total").increment(1);
                    return Err(DomainError::Dependency(format!(
                        "listing service answered for {} instead of {listing_id}",
                        listing.listing_id
                    )));
                }
                return Ok(Some(listing));
            }
            if status == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            if (status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS)
                && retries_left
            {
                tracing::debug!(attempt, status = status.as_u16(), "listing lookup retrying");
                sleep(self.backoff(attempt)).await;
                continue;
            }

            metrics::counter!("haggle_listing_lookup_failures_total").increment(1);
            let message = response.text().await.unwrap_or_default();
            return Err(DomainError::Dependency(format!(
                "listing service status {}: {}",
                status.as_u16(),
                message
            )));
        }

        Err(DomainError::Dependency(
            "listing service retries exhausted".into(),
        ))
    }

    fn backoff(&self, attempt: u32) -> Duration {
        backoff_for_attempt(self.retry_backoff_base, self.retry_backoff_max, attempt)
    }
}

impl ListingDirectory for HttpListingDirectory {
    fn get_listing(
        &self,
        listing_id: &str,
    ) -> haggle_domain::ports::BoxFuture<'_, DomainResult<Option<ListingSummary>>> {
        let listing_id = listing_id.to_string();
        Box::pin(async move { self.fetch(&listing_id).await })
    }
}

/// Picks the listing backend named by `listing_backend`.
pub fn build_listing_directory(config: &AppConfig) -> anyhow::Result<Arc<dyn ListingDirectory>> {
    if config.uses_http_listings() {
        tracing::info!(base_url = %config.listing_base_url, "using http listing directory");
        return Ok(Arc::new(HttpListingDirectory::from_config(config)));
    }

    let directory = match config
        .listing_seed_path
        .as_deref()
        .map(str::trim)
        .filter(|path| !path.is_empty())
    {
        Some(path) => {
            let directory = InMemoryListingDirectory::from_seed_file(path)?;
            tracing::info!(path, "seeded in-memory listing directory");
            directory
        }
        None => InMemoryListingDirectory::new(),
    };
    Ok(Arc::new(directory))
}

/// `{base}/listings/{id}` with the id as a single escaped path segment.
fn listing_url(base_url: &str, listing_id: &str) -> DomainResult<reqwest::Url> {
    let mut url = reqwest::Url::parse(base_url)
        .map_err(|err| DomainError::Dependency(format!("invalid listing base url: {err}")))?;
    url.path_segments_mut()
        .map_err(|_| DomainError::Dependency("listing base url cannot carry a path".into()))?
        .pop_if_empty()
        .push("listings")
        .push(listing_id);
    Ok(url)
}

fn backoff_for_attempt(base: Duration, max: Duration, attempt: u32) -> Duration {
    if base.is_zero() {
        return Duration::from_millis(1);
    }
    let multiplier = 1u64 << attempt.min(8);
    let delay_ms = (base.as_millis() as u64).saturating_mul(multiplier).max(1);
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        Duration::from_millis(delay_ms)
    } else {
        Duration::from_millis(delay_ms.min(max_ms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use axum::Router;
    use axum::extract::{Path, State};
    use axum::http::StatusCode as AxumStatus;
    use axum::response::{IntoResponse, Response};
    use axum::routing::get;
    use serde_json::json;

    fn http_config(base_url: String) -> AppConfig {
        AppConfig {
            app_env: "test".into(),
            port: 0,
            log_level: "warn".into(),
            jwt_secret: "test-secret".into(),
            auth_dev_bypass_enabled: false,
            listing_backend: "http".into(),
            listing_base_url: base_url,
            listing_timeout_ms: 1_000,
            listing_retry_max_attempts: 3,
            listing_retry_backoff_base_ms: 1,
            listing_retry_backoff_max_ms: 5,
            listing_seed_path: None,
        }
    }

    async fn listing_handler(
        State(failures_left): State<Arc<AtomicU32>>,
        Path(listing_id): Path<String>,
    ) -> Response {
        match listing_id.as_str() {
            "flaky" => {
                if failures_left
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return AxumStatus::SERVICE_UNAVAILABLE.into_response();
                }
                axum::Json(json!({
                    "status": "success",
                    "data": { "listing": {
                        "_id": "flaky",
                        "seller": { "_id": "seller-1", "name": "Sam" },
                        "status": "active",
                        "title": "Pixel 8",
                        "price": 420.0
                    }}
                }))
                .into_response()
            }
            "bare" => axum::Json(json!({
                "listing_id": "bare",
                "owner_id": "seller-2",
                "status": "sold"
            }))
            .into_response(),
            "broken" => AxumStatus::INTERNAL_SERVER_ERROR.into_response(),
            _ => AxumStatus::NOT_FOUND.into_response(),
        }
    }

    async fn spawn_stub(failures: u32) -> String {
        let app = Router::new()
            .route("/listings/:listing_id", get(listing_handler))
            .with_state(Arc::new(AtomicU32::new(failures)));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        format!("http://{addr}/")
    }

    #[tokio::test]
    async fn http_directory_retries_transient_failures() {
        let base = spawn_stub(2).await;
        let directory = HttpListingDirectory::from_config(&http_config(base));
        let listing = directory
            .get_listing("flaky")
            .await
            .expect("lookup")
            .expect("listing");
        assert_eq!(listing.owner_id, "seller-1");
        assert_eq!(listing.status, ListingStatus::Active);
        assert_eq!(listing.title.as_deref(), Some("Pixel 8"));
    }

    #[tokio::test]
    async fn http_directory_maps_not_found_and_failures() {
        let base = spawn_stub(0).await;
        let directory = HttpListingDirectory::from_config(&http_config(base));

        assert!(directory.get_listing("missing").await.expect("lookup").is_none());
        let bare = directory
            .get_listing("bare")
            .await
            .expect("lookup")
            .expect("listing");
        assert_eq!(bare.status, ListingStatus::Sold);

        let err = directory.get_listing("broken").await.unwrap_err();
        assert!(matches!(err, DomainError::Dependency(_)));
    }

    #[tokio::test]
    async fn in_memory_directory_upserts() {
        let directory = InMemoryListingDirectory::new();
        assert!(directory.get_listing("l-1").await.expect("lookup").is_none());
        directory
            .upsert(ListingSummary::active("l-1", "seller"))
            .await;
        let listing = directory
            .get_listing("l-1")
            .await
            .expect("lookup")
            .expect("listing");
        assert_eq!(listing.owner_id, "seller");
    }

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_millis(250);
        assert_eq!(backoff_for_attempt(base, max, 0), Duration::from_millis(100));
        assert_eq!(backoff_for_attempt(base, max, 1), Duration::from_millis(200));
        assert_eq!(backoff_for_attempt(base, max, 5), Duration::from_millis(250));
    }

    #[test]
    fn listing_url_escapes_the_id_segment() {
        let url = listing_url("http://host/api/", "1").expect("url");
        assert_eq!(url.as_str(), "http://host/api/listings/1");

        let url = listing_url("http://host", "a?x=1#frag").expect("url");
        assert_eq!(url.path(), "/listings/a%3Fx=1%23frag");
        assert!(url.query().is_none());
        assert!(url.fragment().is_none());

        let url = listing_url("http://host/api", "x/../y").expect("url");
        assert_eq!(url.path(), "/api/listings/x%2F..%2Fy");

        assert!(listing_url("not a url", "1").is_err());
    }

    async fn echo_listing(Path(listing_id): Path<String>) -> Response {
        let answered_id = if listing_id == "alias" {
            "phone-9".to_string()
        } else {
            listing_id
        };
        axum::Json(json!({
            "listing_id": answered_id,
            "owner_id": "seller-9",
            "status": "active"
        }))
        .into_response()
    }

    #[tokio::test]
    async fn http_directory_sends_ids_verbatim_and_checks_the_answer() {
        let app = Router::new().route("/listings/:listing_id", get(echo_listing));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        let directory = HttpListingDirectory::from_config(&http_config(format!("http://{addr}")));

        for listing_id in ["phone-9?x=1", "other/../phone-9", "phone 9#top"] {
            let listing = directory
                .get_listing(listing_id)
                .await
                .expect("lookup")
                .expect("listing");
            assert_eq!(listing.listing_id, listing_id);
        }

        let err = directory.get_listing("alias").await.unwrap_err();
        assert!(matches!(err, DomainError::Dependency(_)));
    }
}
