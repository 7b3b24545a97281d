use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use shared::{
    domain::Direction,
    error::{ApiError, ErrorCode},
    protocol::{AdjustRequest, CountResponse, ServerEvent},
};
use storage::CounterStore;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::warn;
use url::Url;

use crate::error::ClientError;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Where a client sends its mutation intents.
///
/// Implementations delegate the arithmetic to the store and hand back the
/// value it produced; none of them compute a new count locally.
#[async_trait]
pub trait CounterRemote: Send + Sync {
    async fn fetch(&self) -> Result<u64, ClientError>;
    async fn adjust(&self, direction: Direction, amount: u64) -> Result<u64, ClientError>;
    async fn reset(&self) -> Result<u64, ClientError>;
}

/// Talks to the counter server over HTTP.
pub struct HttpCounterRemote {
    http: Client,
    base: Url,
}

impl HttpCounterRemote {
    pub fn new(server_url: &str) -> Result<Self, ClientError> {
        Self::with_timeout(server_url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(server_url: &str, timeout: Duration) -> Result<Self, ClientError> {
        let base = parse_base_url(server_url)?;
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http, base })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base
            .join(path)
            .map_err(|err| invalid_url(self.base.as_str(), err.to_string()))
    }

    fn events_url(&self) -> Result<Url, ClientError> {
        let mut url = self.endpoint("ws")?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|()| invalid_url(self.base.as_str(), "cannot derive websocket url"))?;
        Ok(url)
    }

    /// Opens the push channel. Events arrive until the server closes the
    /// socket or the subscription is dropped.
    pub async fn subscribe(&self) -> Result<EventSubscription, ClientError> {
        let url = self.events_url()?;
        let (ws_stream, _) = connect_async(url.as_str()).await.map_err(|err| {
            ClientError::Events(format!("failed to connect websocket {url}: {err}"))
        })?;
        let (_, mut reader) = ws_stream.split();
        let (tx, rx) = mpsc::channel(64);

        let task = tokio::spawn(async move {
            while let Some(msg) = reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerEvent>(&text) {
                        Ok(event) => {
                            if tx.send(Ok(event)).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(%err, "ignoring invalid server event"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = tx
                            .send(Err(ClientError::Events(format!(
                                "websocket receive failed: {err}"
                            ))))
                            .await;
                        break;
                    }
                }
            }
        });

        Ok(EventSubscription { events: rx, task })
    }
}

#[async_trait]
impl CounterRemote for HttpCounterRemote {
    async fn fetch(&self) -> Result<u64, ClientError> {
        let response = self.http.get(self.endpoint("api/count")?).send().await?;
        read_count(response).await
    }

    async fn adjust(&self, direction: Direction, amount: u64) -> Result<u64, ClientError> {
        let path = match direction {
            Direction::Increase => "api/count/increment",
            Direction::Decrease => "api/count/decrement",
        };
        let response = self
            .http
            .post(self.endpoint(path)?)
            .json(&AdjustRequest::by(amount))
            .send()
            .await?;
        read_count(response).await
    }

    async fn reset(&self) -> Result<u64, ClientError> {
        let response = self
            .http
            .post(self.endpoint("api/count/reset")?)
            .send()
            .await?;
        read_count(response).await
    }
}

/// Drives a store in the same process, bypassing HTTP.
#[derive(Clone)]
pub struct LocalCounterRemote {
    store: Arc<dyn CounterStore>,
}

impl LocalCounterRemote {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CounterRemote for LocalCounterRemote {
    async fn fetch(&self) -> Result<u64, ClientError> {
        Ok(self.store.get().await?)
    }

    async fn adjust(&self, direction: Direction, amount: u64) -> Result<u64, ClientError> {
        let count = match direction {
            Direction::Increase => self.store.increment(amount).await?,
            Direction::Decrease => self.store.decrement(amount).await?,
        };
        Ok(count)
    }

    async fn reset(&self) -> Result<u64, ClientError> {
        Ok(self.store.reset().await?)
    }
}

pub struct EventSubscription {
    events: mpsc::Receiver<Result<ServerEvent, ClientError>>,
    task: JoinHandle<()>,
}

impl EventSubscription {
    /// `None` once the server closed the stream.
    pub async fn next(&mut self) -> Option<Result<ServerEvent, ClientError>> {
        self.events.recv().await
    }
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_count(response: Response) -> Result<u64, ClientError> {
    let status = response.status();
    if status.is_success() {
        let body: CountResponse = response.json().await?;
        return Ok(body.count);
    }

    let err = match response.json::<ApiError>().await {
        Ok(err) => err,
        Err(_) => ApiError::new(ErrorCode::Unknown, format!("server answered {status}")),
    };
    Err(ClientError::Api(err))
}

fn parse_base_url(server_url: &str) -> Result<Url, ClientError> {
    let mut base =
        Url::parse(server_url.trim()).map_err(|err| invalid_url(server_url, err.to_string()))?;
    if !matches!(base.scheme(), "http" | "https") {
        return Err(invalid_url(
            server_url,
            "server_url must start with http:// or https://",
        ));
    }
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    Ok(base)
}

fn invalid_url(url: &str, reason: impl Into<String>) -> ClientError {
    ClientError::InvalidServerUrl {
        url: url.to_string(),
        reason: reason.into(),
    }
}
