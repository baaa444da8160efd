//! Authenticated catalog API client + bounded concurrent fetching.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "flow-fetch";

pub const DEFAULT_V3_BASE_URL: &str = "https://openapi.data.uwaterloo.ca/v3";
pub const DEFAULT_V2_BASE_URL: &str = "https://api.uwaterloo.ca/v2";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("fetch cancelled")]
    Cancelled,
    #[error("fetch task failed: {0}")]
    Task(String),
}

impl FetchError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::Status { status: 404, .. })
    }
}

/// Run-wide cancellation signal shared by the client and the fetcher.
#[derive(Debug, Clone)]
pub struct Cancellation {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl Default for Cancellation {
    fn default() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }
}

impl Cancellation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Cancels once `deadline` elapses, unless cancelled earlier.
    pub fn cancel_after(&self, deadline: Duration) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = this.cancelled() => {}
                _ = tokio::time::sleep(deadline) => this.cancel(),
            }
        });
    }

    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[derive(Debug)]
pub struct ApiClientConfig {
    pub v3_base_url: String,
    pub v2_base_url: String,
    pub v3_key: SecretString,
    pub v2_key: SecretString,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for ApiClientConfig {
    fn default() -> Self {
        Self {
            v3_base_url: DEFAULT_V3_BASE_URL.to_string(),
            v2_base_url: DEFAULT_V2_BASE_URL.to_string(),
            v3_key: SecretString::new(String::new().into()),
            v2_key: SecretString::new(String::new().into()),
            timeout: Duration::from_secs(10),
            user_agent: Some(format!("flow-importer/{}", env!("CARGO_PKG_VERSION"))),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DataEnvelope<T> {
    data: T,
}

/// GET-only client for the two catalog API generations.
///
/// v3 responses are bare JSON authenticated by an `X-Api-Key` header; v2 responses wrap
/// their payload in `{"data": ...}` and take the key as a query parameter.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    config: Arc<ApiClientConfig>,
    cancel: Cancellation,
}

impl ApiClient {
    pub fn new(config: ApiClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let http = builder.build().context("building reqwest client")?;
        Ok(Self {
            http,
            config: Arc::new(config),
            cancel: Cancellation::new(),
        })
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancellation(&self) -> &Cancellation {
        &self.cancel
    }

    pub async fn get_v3<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, FetchError> {
        let url = join_url(&self.config.v3_base_url, endpoint);
        let request = self
            .http
            .get(&url)
            .header("X-Api-Key", self.config.v3_key.expose_secret());
        let body = self.send(&url, request).await?;
        decode(&url, &body)
    }

    pub async fn get_v2<T: DeserializeOwned>(&self, endpoint: &str) -> Result<T, FetchError> {
        let url = format!("{}.json", join_url(&self.config.v2_base_url, endpoint));
        let request = self.http.get(&url).query(&[
            ("dump", "true"),
            ("key", self.config.v2_key.expose_secret()),
        ]);
        let body = self.send(&url, request).await?;
        let envelope: DataEnvelope<T> = decode(&url, &body)?;
        Ok(envelope.data)
    }

    // `url` excludes the query string so v2 keys never reach errors or logs.
    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<Vec<u8>, FetchError> {
        let transport = |source: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            source: source.without_url(),
        };

        let exchange = async {
            let resp = request.send().await.map_err(transport)?;
            let status = resp.status();
            if status.is_client_error() || status.is_server_error() {
                return Err(FetchError::Status {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }
            let body = resp.bytes().await.map_err(transport)?;
            Ok(body.to_vec())
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(FetchError::Cancelled),
            result = exchange.instrument(info_span!("api_get", url)) => result,
        }
    }
}

fn join_url(base: &str, endpoint: &str) -> String {
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

fn decode<T: DeserializeOwned>(url: &str, body: &[u8]) -> Result<T, FetchError> {
    serde_json::from_slice(body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })
}

#[derive(Debug)]
pub struct BatchReport<K, T> {
    pub items: Vec<(K, T)>,
    pub failures: Vec<(K, FetchError)>,
}

impl<K, T> Default for BatchReport<K, T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<K, T> BatchReport<K, T> {
    pub fn completions(&self) -> usize {
        self.items.len() + self.failures.len()
    }

    /// All results, or the first failure observed; later results are discarded.
    pub fn into_strict(self) -> Result<Vec<(K, T)>, FetchError> {
        match self.failures.into_iter().next() {
            Some((_, err)) => Err(err),
            None => Ok(self.items),
        }
    }
}

/// Fans per-key fetches out under a fixed ceiling of in-flight requests.
///
/// Every key produces exactly one completion, success or failure. Slots are owned
/// permits, so they return to the pool when a fetch finishes, fails, panics or is
/// cancelled.
#[derive(Debug, Clone)]
pub struct BoundedFetcher {
    slots: Arc<Semaphore>,
    capacity: usize,
    cancel: Cancellation,
}

impl BoundedFetcher {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            cancel: Cancellation::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: Cancellation) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    pub async fn fetch_all<K, T, F, Fut>(
        &self,
        keys: impl IntoIterator<Item = K>,
        fetch: F,
    ) -> BatchReport<K, T>
    where
        K: Clone + Send + 'static,
        T: Send + 'static,
        F: Fn(K) -> Fut,
        Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let mut report = BatchReport::default();
        let mut tasks = JoinSet::new();

        for key in keys {
            let permit = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => None,
                permit = self.slots.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                report.failures.push((key, FetchError::Cancelled));
                continue;
            };

            let work = tokio::spawn(fetch(key.clone()));
            let cancel = self.cancel.clone();
            tasks.spawn(async move {
                let abort = work.abort_handle();
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        abort.abort();
                        Err(FetchError::Cancelled)
                    }
                    joined = work => match joined {
                        Ok(result) => result,
                        Err(err) => Err(FetchError::Task(err.to_string())),
                    },
                };
                drop(permit);
                (key, outcome)
            });
        }

        while let Some(done) = tasks.join_next().await {
            record(&mut report, done);
        }
        report
    }
}

fn record<K, T>(
    report: &mut BatchReport<K, T>,
    done: Result<(K, Result<T, FetchError>), tokio::task::JoinError>,
) {
    match done {
        Ok((key, Ok(item))) => report.items.push((key, item)),
        Ok((key, Err(err))) => report.failures.push((key, err)),
        // The supervising task only awaits and forwards; it cannot fail on its own.
        Err(err) => warn!(error = %err, "fetch supervisor task failed"),
    }
}
