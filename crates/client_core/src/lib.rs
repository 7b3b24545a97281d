use std::str::FromStr;

use shared::{
    domain::{Capacity, CapacityClassification, Direction},
    protocol::ServerEvent,
};
use tokio::sync::broadcast;
use tracing::{info, warn};

pub mod error;
pub mod remote;

pub use error::ClientError;
pub use remote::{
    CounterRemote, EventSubscription, HttpCounterRemote, LocalCounterRemote,
    DEFAULT_REQUEST_TIMEOUT,
};

/// Two-step guard in front of `reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResetConfirmation {
    #[default]
    Idle,
    PendingConfirm,
}

#[derive(Debug, Clone, Default)]
pub struct ClientState {
    /// Last value the store reported; `None` before the first answer.
    pub count: Option<u64>,
    pub reset: ResetConfirmation,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    CountUpdated {
        count: u64,
        classification: CapacityClassification,
    },
    Notice(String),
    Error(String),
}

/// What a display should render for the cached count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CountView {
    pub count: u64,
    pub capacity: u64,
    pub classification: CapacityClassification,
    pub meter_fraction: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    Adjust(Direction, u64),
    Refresh,
    RequestReset,
    ConfirmReset,
    CancelReset,
}

impl FromStr for Intent {
    type Err = String;

    /// Accepts `+N`, `-N`, `refresh`, `reset`, `confirm` and `cancel`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        let amount = |digits: &str| {
            let digits = digits.trim();
            if digits.is_empty() {
                return Ok(1);
            }
            digits
                .parse::<u64>()
                .map_err(|_| format!("'{digits}' is not a whole number"))
        };

        if let Some(rest) = raw.strip_prefix('+') {
            return Ok(Intent::Adjust(Direction::Increase, amount(rest)?));
        }
        if let Some(rest) = raw.strip_prefix('-') {
            return Ok(Intent::Adjust(Direction::Decrease, amount(rest)?));
        }
        match raw.to_ascii_lowercase().as_str() {
            "refresh" | "r" => Ok(Intent::Refresh),
            "reset" | "clear" => Ok(Intent::RequestReset),
            "confirm" | "yes" | "y" => Ok(Intent::ConfirmReset),
            "cancel" | "no" | "n" => Ok(Intent::CancelReset),
            other => Err(format!("unknown command '{other}'")),
        }
    }
}

/// One display session over a shared counter.
///
/// Every mutation is delegated to the remote and the returned value becomes
/// the cached display value. A failed call leaves the cache untouched.
pub struct CounterClient<R: CounterRemote> {
    remote: R,
    capacity: Capacity,
    pub state: ClientState,
    events: broadcast::Sender<ClientEvent>,
}

impl<R: CounterRemote> CounterClient<R> {
    pub fn new(remote: R, capacity: Capacity) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            remote,
            capacity,
            state: ClientState::default(),
            events,
        }
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn count(&self) -> u64 {
        self.state.count.unwrap_or(0)
    }

    pub fn classify(&self, count: u64) -> CapacityClassification {
        self.capacity.classify(count)
    }

    pub fn view(&self) -> CountView {
        let count = self.count();
        CountView {
            count,
            capacity: self.capacity.max(),
            classification: self.capacity.classify(count),
            meter_fraction: self.capacity.meter_fraction(count),
        }
    }

    pub fn reset_pending(&self) -> bool {
        self.state.reset == ResetConfirmation::PendingConfirm
    }

    pub async fn dispatch(&mut self, intent: Intent) -> Result<(), ClientError> {
        match intent {
            Intent::Adjust(direction, amount) => self.adjust(direction, amount).await.map(|_| ()),
            Intent::Refresh => self.refresh().await.map(|_| ()),
            Intent::RequestReset => {
                self.request_reset();
                Ok(())
            }
            Intent::ConfirmReset => self.confirm_reset().await.map(|_| ()),
            Intent::CancelReset => {
                self.cancel_reset();
                Ok(())
            }
        }
    }

    /// Re-reads the store and overwrites the cached value.
    pub async fn refresh(&mut self) -> Result<u64, ClientError> {
        match self.remote.fetch().await {
            Ok(count) => {
                self.adopt(count);
                self.notify("Success! Count updated.".to_string());
                Ok(count)
            }
            Err(err) => Err(self.fail("Failed to fetch count from server", err)),
        }
    }

    pub async fn increase(&mut self, amount: u64) -> Result<u64, ClientError> {
        self.adjust(Direction::Increase, amount).await
    }

    pub async fn decrease(&mut self, amount: u64) -> Result<u64, ClientError> {
        self.adjust(Direction::Decrease, amount).await
    }

    pub async fn adjust(&mut self, direction: Direction, amount: u64) -> Result<u64, ClientError> {
        match self.remote.adjust(direction, amount).await {
            Ok(count) => {
                self.adopt(count);
                self.notify(format!(
                    "{} number of people by {amount}, with {count} people currently inside.",
                    direction.past_tense()
                ));
                Ok(count)
            }
            Err(err) => Err(self.fail("Failed to update count", err)),
        }
    }

    /// `Idle -> PendingConfirm`. The store is not touched.
    pub fn request_reset(&mut self) {
        self.state.reset = ResetConfirmation::PendingConfirm;
    }

    /// `PendingConfirm -> Idle` without touching the store. Returns whether a
    /// reset was pending.
    pub fn cancel_reset(&mut self) -> bool {
        let was_pending = self.reset_pending();
        self.state.reset = ResetConfirmation::Idle;
        was_pending
    }

    /// `PendingConfirm -> Idle`, resetting the store on the way. The pending
    /// request is consumed even when the store call fails.
    pub async fn confirm_reset(&mut self) -> Result<u64, ClientError> {
        if !self.cancel_reset() {
            return Err(ClientError::NoPendingReset);
        }

        match self.remote.reset().await {
            Ok(count) => {
                self.adopt(count);
                self.notify("Count reset to 0.".to_string());
                Ok(count)
            }
            Err(err) => Err(self.fail("Failed to reset count", err)),
        }
    }

    /// Adopts a pushed count as the cached value.
    pub fn apply_server_event(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::CountChanged { count, .. } => self.adopt(*count),
        }
    }

    fn adopt(&mut self, count: u64) {
        self.state.count = Some(count);
        let _ = self.events.send(ClientEvent::CountUpdated {
            count,
            classification: self.capacity.classify(count),
        });
    }

    fn notify(&self, message: String) {
        info!(count = self.count(), "{message}");
        let _ = self.events.send(ClientEvent::Notice(message));
    }

    fn fail(&self, context: &str, err: ClientError) -> ClientError {
        warn!(code = ?err.code(), %err, "{context}");
        let _ = self
            .events
            .send(ClientEvent::Error(format!("ERROR: {context}: {err}")));
        err
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
