//! Scripted archive and fixtures for pipeline tests.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::clock::RecordingSleeper;
use crate::config::{Config, RetryConfig};
use crate::error::{Error, Result};
use crate::rapi::{
    ArchiveClient, DownloadStream, ItemStatus, OrderResponse, OrderedItem, RemoteState,
    SearchQuery,
};
use crate::types::{ImageRecord, ItemId, OrderId, Priority, RecordKey};

use super::Pipeline;

const FILE_HOST: &str = "https://files.example.com/";

/// How a record's order item evolves over status calls
#[derive(Clone, Debug)]
pub(crate) enum StatusPlan {
    /// Available on the nth status call that covers the item
    AvailableAfter(u32),
    /// Failed with a reason on the nth status call
    FailAfter(u32, String),
    /// Never leaves processing
    Pending,
}

/// How the file transfer of a record misbehaves
#[derive(Clone, Debug)]
pub(crate) enum TransferPlan {
    /// The first transfer ends after half the file
    ShortFirst,
    /// The first transfer sends half the file, then stops sending
    StallFirst,
    /// The first transfer cancels the token after half the file
    CancelMidway(CancellationToken),
    /// Every byte arrives on its own after a delay
    Slow(Duration),
}

#[derive(Default)]
struct MockState {
    auth_error: bool,
    search_results: HashMap<String, Vec<ImageRecord>>,
    failing_searches: HashSet<String>,
    failing_order_records: HashSet<String>,
    rejected: HashSet<String>,
    plans: HashMap<String, StatusPlan>,
    status_error: bool,
    existing: Vec<ItemStatus>,
    failing_downloads: HashSet<String>,
    transfer_plans: HashMap<String, TransferPlan>,
    r#unsized: HashSet<String>,
    cancel_on_status_call: Option<(usize, CancellationToken)>,

    next_order: i64,
    next_item: i64,
    placed: HashMap<OrderId, Vec<(RecordKey, ItemId)>>,
    views: HashMap<String, u32>,

    order_calls: Vec<Vec<RecordKey>>,
    status_calls: Vec<Vec<OrderId>>,
    download_calls: Vec<(String, u64)>,
}

/// In-memory archive driven by a per-record script
#[derive(Default)]
pub(crate) struct MockArchive {
    state: Mutex<MockState>,
}

impl MockArchive {
    pub(crate) fn new() -> Arc<Self> {
        let mock = Self::default();
        {
            let mut state = mock.state.lock().unwrap();
            state.next_order = 100;
            state.next_item = 1000;
        }
        Arc::new(mock)
    }

    fn with<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    pub(crate) fn fail_auth(&self) {
        self.with(|s| s.auth_error = true);
    }

    pub(crate) fn add_search_results(&self, collection: &str, ids: &[&str]) {
        self.with(|s| {
            s.search_results
                .entry(collection.to_string())
                .or_default()
                .extend(records(collection, ids));
        });
    }

    pub(crate) fn fail_search(&self, collection: &str) {
        self.with(|s| s.failing_searches.insert(collection.to_string()));
    }

    /// Any order containing this record id answers 503
    pub(crate) fn fail_orders_containing(&self, record_id: &str) {
        self.with(|s| s.failing_order_records.insert(record_id.to_string()));
    }

    pub(crate) fn reject(&self, record_id: &str) {
        self.with(|s| s.rejected.insert(record_id.to_string()));
    }

    pub(crate) fn plan(&self, record_id: &str, plan: StatusPlan) {
        self.with(|s| s.plans.insert(record_id.to_string(), plan));
    }

    pub(crate) fn fail_status_calls(&self) {
        self.with(|s| s.status_error = true);
    }

    pub(crate) fn add_existing(&self, item: ItemStatus) {
        self.with(|s| s.existing.push(item));
    }

    pub(crate) fn fail_download(&self, record_id: &str) {
        self.with(|s| s.failing_downloads.insert(file_url(record_id)));
    }

    pub(crate) fn transfer_plan(&self, record_id: &str, plan: TransferPlan) {
        self.with(|s| s.transfer_plans.insert(file_url(record_id), plan));
    }

    /// Status responses for this record carry no file size
    pub(crate) fn r#unsized(&self, record_id: &str) {
        self.with(|s| s.r#unsized.insert(record_id.to_string()));
    }

    /// Cancel `token` while answering the nth status call (1-based)
    pub(crate) fn cancel_on_status_call(&self, n: usize, token: CancellationToken) {
        self.with(|s| s.cancel_on_status_call = Some((n, token)));
    }

    pub(crate) fn order_calls(&self) -> Vec<Vec<RecordKey>> {
        self.with(|s| s.order_calls.clone())
    }

    pub(crate) fn status_calls(&self) -> Vec<Vec<OrderId>> {
        self.with(|s| s.status_calls.clone())
    }

    pub(crate) fn download_calls(&self) -> Vec<String> {
        self.with(|s| s.download_calls.iter().map(|(url, _)| url.clone()).collect())
    }

    /// Requested byte offset of every download call
    pub(crate) fn download_offsets(&self) -> Vec<u64> {
        self.with(|s| s.download_calls.iter().map(|(_, offset)| *offset).collect())
    }
}

/// Download URL the mock reports for a record
pub(crate) fn file_url(record_id: &str) -> String {
    format!("{FILE_HOST}{record_id}.zip")
}

/// File content the mock serves for a record
pub(crate) fn file_content(record_id: &str) -> String {
    format!("image-{record_id}")
}

pub(crate) fn records(collection: &str, ids: &[&str]) -> Vec<ImageRecord> {
    ids.iter()
        .map(|id| {
            ImageRecord::new(RecordKey::new(collection, *id)).with_title(format!("Image {id}"))
        })
        .collect()
}

pub(crate) fn existing_item(
    collection: &str,
    record_id: &str,
    order_id: i64,
    state: RemoteState,
    submitted_at: Option<&str>,
) -> ItemStatus {
    ItemStatus {
        order_id: OrderId(order_id),
        item_id: ItemId(order_id * 10),
        record_id: record_id.to_string(),
        collection: Some(collection.to_string()),
        state,
        reason: None,
        download_url: (state == RemoteState::Available).then(|| file_url(record_id)),
        size: None,
        submitted_at: submitted_at.map(|ts| {
            chrono::DateTime::parse_from_rfc3339(ts)
                .unwrap()
                .with_timezone(&chrono::Utc)
        }),
    }
}

/// Configuration writing into `dir`, with fast retries and a 10s → 30s poll backoff
pub(crate) fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.rapi.username = Some("user".into());
    config.rapi.password = Some("secret".into());
    config.paths.downloads = dir.join("downloads");
    config.paths.results = dir.join("results");
    config.poll.interval = Duration::from_secs(10);
    config.poll.max_interval = Duration::from_secs(30);
    config.poll.idle_backoff = 2.0;
    config.poll.max_attempts = 5;
    config.retry = RetryConfig {
        max_attempts: 1,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(1),
        backoff_multiplier: 1.0,
        jitter: false,
    };
    config
}

pub(crate) fn test_pipeline(
    config: Config,
    mock: &Arc<MockArchive>,
) -> (Pipeline, Arc<RecordingSleeper>) {
    let sleeper = Arc::new(RecordingSleeper::new());
    let pipeline = Pipeline::new(config, mock.clone()).with_sleeper(sleeper.clone());
    (pipeline, sleeper)
}

fn busy() -> Error {
    Error::Remote {
        status: 503,
        message: "service busy".to_string(),
    }
}

#[async_trait::async_trait]
impl ArchiveClient for MockArchive {
    async fn authenticate(&self) -> Result<()> {
        if self.with(|s| s.auth_error) {
            return Err(Error::Authentication("invalid credentials".to_string()));
        }
        Ok(())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<ImageRecord>> {
        self.with(|s| {
            if s.failing_searches.contains(&query.collection) {
                return Err(busy());
            }
            let mut found = s
                .search_results
                .get(&query.collection)
                .cloned()
                .unwrap_or_default();
            found.truncate(query.max_results);
            Ok(found)
        })
    }

    async fn order(&self, keys: &[RecordKey], _priority: Priority) -> Result<OrderResponse> {
        self.with(|s| {
            s.order_calls.push(keys.to_vec());
            if keys
                .iter()
                .any(|k| s.failing_order_records.contains(&k.record_id))
            {
                return Err(busy());
            }

            let order_id = OrderId(s.next_order);
            s.next_order += 1;
            let mut items = Vec::with_capacity(keys.len());
            let mut placed = Vec::new();
            for key in keys {
                if s.rejected.contains(&key.record_id) {
                    items.push(OrderedItem {
                        record_id: key.record_id.clone(),
                        collection: Some(key.collection.clone()),
                        item_id: None,
                        accepted: false,
                        reason: Some("image not orderable".to_string()),
                    });
                    continue;
                }
                let item_id = ItemId(s.next_item);
                s.next_item += 1;
                placed.push((key.clone(), item_id));
                items.push(OrderedItem {
                    record_id: key.record_id.clone(),
                    collection: Some(key.collection.clone()),
                    item_id: Some(item_id),
                    accepted: true,
                    reason: None,
                });
            }
            s.placed.insert(order_id, placed);
            Ok(OrderResponse { order_id, items })
        })
    }

    async fn status(&self, order_ids: &[OrderId]) -> Result<Vec<ItemStatus>> {
        self.with(|s| {
            s.status_calls.push(order_ids.to_vec());
            if let Some((n, token)) = &s.cancel_on_status_call
                && s.status_calls.len() == *n
            {
                token.cancel();
            }
            if s.status_error {
                return Err(busy());
            }

            let mut statuses = Vec::new();
            for order_id in order_ids {
                let placed = s.placed.get(order_id).cloned().unwrap_or_default();
                for (key, item_id) in placed {
                    let views = s.views.entry(key.record_id.clone()).or_insert(0);
                    *views += 1;
                    let views = *views;
                    let plan = s
                        .plans
                        .get(&key.record_id)
                        .cloned()
                        .unwrap_or(StatusPlan::AvailableAfter(1));
                    let (state, reason) = match plan {
                        StatusPlan::AvailableAfter(n) if views >= n => {
                            (RemoteState::Available, None)
                        }
                        StatusPlan::FailAfter(n, reason) if views >= n => {
                            (RemoteState::Failed, Some(reason))
                        }
                        _ => (RemoteState::Pending, None),
                    };
                    statuses.push(ItemStatus {
                        order_id: *order_id,
                        item_id,
                        record_id: key.record_id.clone(),
                        collection: Some(key.collection.clone()),
                        state,
                        reason,
                        download_url: (state == RemoteState::Available)
                            .then(|| file_url(&key.record_id)),
                        size: (state == RemoteState::Available
                            && !s.r#unsized.contains(&key.record_id))
                            .then(|| file_content(&key.record_id).len() as u64),
                        submitted_at: None,
                    });
                }
            }
            Ok(statuses)
        })
    }

    async fn existing_orders(
        &self,
        keys: &[RecordKey],
        _max_orders: usize,
    ) -> Result<Vec<ItemStatus>> {
        self.with(|s| {
            Ok(s.existing
                .iter()
                .filter(|item| keys.is_empty() || keys.iter().any(|k| item.matches(k)))
                .cloned()
                .collect())
        })
    }

    async fn download(&self, url: &str, offset: u64) -> Result<DownloadStream> {
        let (failing, plan) = self.with(|s| {
            s.download_calls.push((url.to_string(), offset));
            let plan = match s.transfer_plans.get(url) {
                Some(TransferPlan::Slow(delay)) => Some(TransferPlan::Slow(*delay)),
                Some(_) => s.transfer_plans.remove(url),
                None => None,
            };
            (s.failing_downloads.contains(url), plan)
        });
        if failing {
            return Err(Error::Remote {
                status: 404,
                message: "file not found".to_string(),
            });
        }

        let record_id = url
            .strip_prefix(FILE_HOST)
            .and_then(|rest| rest.strip_suffix(".zip"))
            .unwrap_or(url);
        let content = Bytes::from(file_content(record_id));
        let total = content.len() as u64;
        if offset >= total {
            return Err(Error::Remote {
                status: 416,
                message: "range not satisfiable".to_string(),
            });
        }

        let rest = content.slice(offset as usize..);
        let half = rest.slice(..rest.len() / 2);
        let tail = rest.slice(rest.len() / 2..);
        let body = match plan {
            None => futures::stream::iter(vec![Ok(rest)]).boxed(),
            Some(TransferPlan::ShortFirst) => futures::stream::iter(vec![Ok(half)]).boxed(),
            Some(TransferPlan::StallFirst) => futures::stream::iter(vec![Ok(half)])
                .chain(futures::stream::pending())
                .boxed(),
            Some(TransferPlan::CancelMidway(token)) => futures::stream::iter(vec![half, tail])
                .enumerate()
                .map(move |(index, chunk)| {
                    if index == 1 {
                        token.cancel();
                    }
                    Ok(chunk)
                })
                .boxed(),
            Some(TransferPlan::Slow(delay)) => {
                let bytes: Vec<Bytes> = (0..rest.len()).map(|i| rest.slice(i..i + 1)).collect();
                futures::stream::iter(bytes)
                    .then(move |byte| async move {
                        tokio::time::sleep(delay).await;
                        Ok(byte)
                    })
                    .boxed()
            }
        };

        Ok(DownloadStream {
            expected_size: Some(total),
            resumed: offset > 0,
            body,
        })
    }
}
