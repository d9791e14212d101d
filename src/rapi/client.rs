//! HTTP implementation of [`ArchiveClient`] for the EODMS REST API

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use super::{
    ArchiveClient, DownloadStream, ItemStatus, OrderResponse, OrderedItem, RemoteState,
    SearchQuery,
};
use crate::config::RapiConfig;
use crate::error::{Error, Result};
use crate::types::{ImageRecord, ItemId, OrderId, Priority, RecordKey};

/// EODMS REST API client
///
/// Timeouts are applied by the caller per operation; the underlying HTTP client
/// only bounds connection setup.
#[derive(Clone)]
pub struct RapiClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
    page_size: usize,
}

impl std::fmt::Debug for RapiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RapiClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("page_size", &self.page_size)
            .finish_non_exhaustive()
    }
}

impl RapiClient {
    /// Build a client from the RAPI settings
    ///
    /// # Errors
    /// Returns a configuration error when credentials are missing or the HTTP
    /// client cannot be created.
    pub fn new(config: &RapiConfig) -> Result<Self> {
        let username = config
            .username
            .clone()
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::config("rapi.username", "an EODMS username is required"))?;
        let password = config
            .password
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Error::config("rapi.password", "an EODMS password is required"))?;

        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(30))
            .user_agent(concat!("eodms-dl/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username,
            password,
            page_size: config.page_size.max(1),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let response = self
            .http
            .get(self.endpoint(path))
            .basic_auth(&self.username, Some(&self.password))
            .query(query)
            .send()
            .await?;
        let response = check_status(response).await?;
        Ok(response.json().await?)
    }

    async fn order_items(&self, query: &[(&str, String)]) -> Result<Vec<ItemStatus>> {
        let body: OrderListBody = self.get_json("order", query).await?;
        Ok(body.items.into_iter().filter_map(WireOrderItem::into_status).collect())
    }
}

/// Turn an error status into the matching [`Error`]
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response
        .text()
        .await
        .ok()
        .filter(|body| !body.trim().is_empty())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());

    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(Error::Authentication(message));
    }
    Err(Error::Remote {
        status: status.as_u16(),
        message,
    })
}

/// Build the RAPI query expression for a search
fn build_query(query: &SearchQuery) -> Option<String> {
    let mut clauses: Vec<String> = query
        .filters
        .iter()
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();

    if let Some(range) = &query.date_range {
        let (start, end) = range.to_rapi();
        clauses.push(format!("CATALOG_IMAGE.START_DATETIME>='{start}'"));
        clauses.push(format!("CATALOG_IMAGE.START_DATETIME<='{end}'"));
    }
    if let Some(wkt) = query.geometry.as_deref().filter(|g| !g.trim().is_empty()) {
        clauses.push(format!("CATALOG_IMAGE.THE_GEOM_4326 INTERSECTS {}", wkt.trim()));
    }

    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" AND "))
    }
}

/// Parse RAPI timestamps, which come with or without an offset
fn parse_submitted(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(value) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchBody {
    #[serde(default)]
    results: Vec<WireSearchResult>,
    #[serde(default)]
    more_results: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireSearchResult {
    record_id: serde_json::Value,
    #[serde(default)]
    collection_id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    geometry: Option<serde_json::Value>,
    #[serde(default)]
    metadata: Vec<(String, serde_json::Value)>,
}

impl WireSearchResult {
    fn into_record(self, collection: &str) -> Option<ImageRecord> {
        let record_id = json_to_string(&self.record_id)?;
        let key = RecordKey::new(
            self.collection_id.unwrap_or_else(|| collection.to_string()),
            record_id,
        );
        let mut record = ImageRecord::new(key);
        record.title = self.title;
        record.geometry = self.geometry.map(|g| g.to_string());
        record.metadata = self
            .metadata
            .into_iter()
            .filter_map(|(name, value)| json_to_string(&value).map(|v| (name, v)))
            .collect::<BTreeMap<_, _>>();
        Some(record)
    }
}

fn json_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderRequest<'a> {
    destinations: Vec<serde_json::Value>,
    items: Vec<OrderRequestItem<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderRequestItem<'a> {
    collection_id: &'a str,
    record_id: &'a str,
    parameters: OrderParameters,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OrderParameters {
    priority: &'static str,
}

#[derive(Debug, Deserialize)]
struct OrderListBody {
    #[serde(default)]
    items: Vec<WireOrderItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireOrderItem {
    #[serde(default)]
    record_id: Option<serde_json::Value>,
    #[serde(default)]
    collection_id: Option<String>,
    #[serde(default)]
    item_id: Option<i64>,
    #[serde(default)]
    order_id: Option<i64>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    status_message: Option<String>,
    #[serde(default)]
    date_submitted: Option<String>,
    #[serde(default)]
    size: Option<u64>,
    #[serde(default)]
    destinations: Vec<WireDestination>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireDestination {
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

impl WireOrderItem {
    fn record_id(&self) -> Option<String> {
        self.record_id.as_ref().and_then(json_to_string)
    }

    fn into_status(self) -> Option<ItemStatus> {
        let record_id = self.record_id()?;
        let (Some(order_id), Some(item_id)) = (self.order_id, self.item_id) else {
            return None;
        };
        let destination = self
            .destinations
            .iter()
            .find(|d| {
                d.url.is_some()
                    && d.kind.as_deref().is_none_or(|k| !k.eq_ignore_ascii_case("ftp"))
            })
            .or_else(|| self.destinations.iter().find(|d| d.url.is_some()));

        Some(ItemStatus {
            order_id: OrderId(order_id),
            item_id: ItemId(item_id),
            record_id,
            collection: self.collection_id,
            state: RemoteState::from_remote(self.status.as_deref().unwrap_or_default()),
            reason: self
                .status_message
                .filter(|m| !m.trim().is_empty())
                .or(self.status.clone()),
            download_url: destination.and_then(|d| d.url.clone()),
            size: self.size.or_else(|| destination.and_then(|d| d.size)),
            submitted_at: self.date_submitted.as_deref().and_then(parse_submitted),
        })
    }
}

#[async_trait::async_trait]
impl ArchiveClient for RapiClient {
    async fn authenticate(&self) -> Result<()> {
        let _: serde_json::Value = self
            .get_json("collections", &[("format", "json".to_string())])
            .await?;
        tracing::debug!(base_url = %self.base_url, "Authenticated with the RAPI");
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ImageRecord>> {
        let expression = build_query(query);
        let mut records: Vec<ImageRecord> = Vec::new();
        let mut seen = HashSet::new();

        while records.len() < query.max_results {
            let page = self.page_size.min(query.max_results - records.len());
            let mut params = vec![
                ("collection", query.collection.clone()),
                ("maxResults", page.to_string()),
                ("firstResult", (records.len() + 1).to_string()),
                ("format", "json".to_string()),
            ];
            if let Some(expression) = &expression {
                params.push(("query", expression.clone()));
            }

            let body: SearchBody = self.get_json("search", &params).await?;
            let returned = body.results.len();
            for result in body.results {
                if let Some(record) = result.into_record(&query.collection)
                    && seen.insert(record.key.clone())
                {
                    records.push(record);
                }
            }

            tracing::debug!(
                collection = %query.collection,
                page_results = returned,
                total = records.len(),
                "Search page received"
            );

            if !body.more_results || returned == 0 {
                break;
            }
        }

        records.truncate(query.max_results);
        Ok(records)
    }

    async fn order(&self, keys: &[RecordKey], priority: Priority) -> Result<OrderResponse> {
        let request = OrderRequest {
            destinations: Vec::new(),
            items: keys
                .iter()
                .map(|key| OrderRequestItem {
                    collection_id: &key.collection,
                    record_id: &key.record_id,
                    parameters: OrderParameters {
                        priority: priority.as_str(),
                    },
                })
                .collect(),
        };

        let response = self
            .http
            .post(self.endpoint("order"))
            .basic_auth(&self.username, Some(&self.password))
            .json(&request)
            .send()
            .await?;
        let body: OrderListBody = check_status(response).await?.json().await?;

        let order_id = body
            .items
            .iter()
            .find_map(|item| item.order_id)
            .map(OrderId)
            .ok_or_else(|| Error::Other("order response carried no order id".to_string()))?;

        let items = body
            .items
            .into_iter()
            .filter_map(|item| {
                let record_id = item.record_id()?;
                let state = RemoteState::from_remote(item.status.as_deref().unwrap_or_default());
                let accepted = item.item_id.is_some() && state.is_live();
                Some(OrderedItem {
                    record_id,
                    collection: item.collection_id,
                    item_id: item.item_id.map(ItemId),
                    accepted,
                    reason: if accepted {
                        None
                    } else {
                        Some(
                            item.status_message
                                .or(item.status)
                                .unwrap_or_else(|| "rejected by the remote service".to_string()),
                        )
                    },
                })
            })
            .collect();

        Ok(OrderResponse { order_id, items })
    }

    async fn status(&self, order_ids: &[OrderId]) -> Result<Vec<ItemStatus>> {
        let mut items = Vec::new();
        for order_id in order_ids {
            let found = self
                .order_items(&[
                    ("orderId", order_id.to_string()),
                    ("format", "json".to_string()),
                ])
                .await?;
            items.extend(found.into_iter().filter(|item| item.order_id == *order_id));
        }
        Ok(items)
    }

    async fn existing_orders(
        &self,
        keys: &[RecordKey],
        max_orders: usize,
    ) -> Result<Vec<ItemStatus>> {
        let items = self
            .order_items(&[
                ("maxOrders", max_orders.to_string()),
                ("format", "json".to_string()),
            ])
            .await?;
        Ok(items
            .into_iter()
            .filter(|item| keys.is_empty() || keys.iter().any(|key| item.matches(key)))
            .collect())
    }

    async fn download(&self, url: &str, offset: u64) -> Result<DownloadStream> {
        let mut request = self
            .http
            .get(url)
            .basic_auth(&self.username, Some(&self.password));
        if offset > 0 {
            request = request.header(reqwest::header::RANGE, format!("bytes={offset}-"));
        }

        let response = check_status(request.send().await?).await?;
        let resumed = offset > 0 && response.status() == reqwest::StatusCode::PARTIAL_CONTENT;
        let expected_size = response
            .content_length()
            .map(|len| if resumed { len + offset } else { len });

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(Error::from))
            .boxed();

        Ok(DownloadStream {
            expected_size,
            resumed,
            body,
        })
    }
}
