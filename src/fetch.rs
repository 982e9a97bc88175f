use crate::Task;
use reqwest::{header::HeaderMap, Method, StatusCode};
use tokio::{
    sync::Mutex,
    time::{Duration, Instant},
};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    InvalidUrl,
    Network,
    Timeout,
    HttpStatus(u16),
    Body,
}

impl FailureKind {
    /// Whether another attempt at the same task may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            FailureKind::Network | FailureKind::Timeout => true,
            FailureKind::HttpStatus(code) => *code == 429 || *code >= 500,
            FailureKind::InvalidUrl | FailureKind::Body => false,
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct FetchError {
    pub kind: FailureKind,
    pub message: String,
}

impl FetchError {
    pub fn new<S: Into<String>>(kind: FailureKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Raw response handed to the extractor.
#[derive(Debug, Clone)]
pub struct Page {
    pub url: String,
    pub final_url: String,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
    pub elapsed: Duration,
}

impl Page {
    /// A successful `text/html` page, mostly useful for tests and custom fetchers.
    pub fn html<S: Into<String>>(url: &str, body: S) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            reqwest::header::HeaderValue::from_static("text/html; charset=utf-8"),
        );
        Self {
            url: url.to_string(),
            final_url: url.to_string(),
            status: StatusCode::OK.as_u16(),
            headers,
            body: body.into(),
            elapsed: Duration::ZERO,
        }
    }
}

#[async_trait::async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, task: &Task) -> Result<Page, FetchError>;
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<String>,
    pub user_agent: String,
    pub timeout: Duration,
    /// Minimum gap between the start of two requests made by one fetcher.
    pub request_delay: Duration,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            user_agent: concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")).to_string(),
            timeout: Duration::from_secs(30),
            request_delay: Duration::from_millis(200),
        }
    }
}

/// Spaces out request starts; concurrent requests are still allowed to overlap.
#[derive(Debug, Default)]
struct Throttle {
    last_request: Mutex<Option<Instant>>,
}

impl Throttle {
    async fn wait(&self, delay: Duration) {
        if delay.is_zero() {
            return;
        }
        let mut last_request = self.last_request.lock().await;
        let now = Instant::now();
        let start = match last_request.take() {
            Some(last) if now.duration_since(last) < delay => {
                let start = last + delay;
                tokio::time::sleep_until(start).await;
                start
            }
            _ => now,
        };
        last_request.replace(start);
    }
}

/// Default fetcher used by every pipeline that does not provide its own.
#[derive(Debug)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
    settings: FetchSettings,
    throttle: Throttle,
}

impl ReqwestFetcher {
    pub fn new(settings: FetchSettings) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(settings.user_agent.as_str())
            .timeout(settings.timeout)
            .build()
            .map_err(map_reqwest_error)?;
        Ok(Self {
            client,
            settings,
            throttle: Throttle::default(),
        })
    }
}

#[async_trait::async_trait]
impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, task: &Task) -> Result<Page, FetchError> {
        let url = reqwest::Url::parse(task.url())
            .map_err(|err| FetchError::new(FailureKind::InvalidUrl, err.to_string()))?;

        self.throttle.wait(self.settings.request_delay).await;

        debug!("Visit {}", url);
        let started = Instant::now();
        let mut request = self
            .client
            .request(self.settings.method.clone(), url)
            .headers(self.settings.headers.clone());
        if let Some(body) = &self.settings.body {
            request = request.body(body.clone());
        }
        let response = request.send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::new(
                FailureKind::HttpStatus(status.as_u16()),
                status.to_string(),
            ));
        }

        let final_url = response.url().to_string();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(map_reqwest_error)?;

        Ok(Page {
            url: task.url().to_string(),
            final_url,
            status: status.as_u16(),
            headers,
            body,
            elapsed: started.elapsed(),
        })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        return FetchError::new(FailureKind::Timeout, err.to_string());
    }
    if err.is_decode() || err.is_body() {
        return FetchError::new(FailureKind::Body, err.to_string());
    }
    if err.is_builder() {
        return FetchError::new(FailureKind::InvalidUrl, err.to_string());
    }
    FetchError::new(FailureKind::Network, err.to_string())
}
