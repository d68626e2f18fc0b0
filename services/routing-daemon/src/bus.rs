//! Message bus seam between the daemon loop and the broker.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use lbr_stomp::{ConnectOptions, Connection, HostAddr, StompError};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// A message as delivered by the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Broker-assigned id. Messages without one cannot be acknowledged.
    pub message_id: Option<String>,
    pub subscription: Option<String>,
    pub destination: Option<String>,
    pub body: Bytes,
}

/// Message bus error.
#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Stomp(#[from] StompError),

    #[error("message has no message-id")]
    MissingMessageId,

    #[error("message bus is closed")]
    Closed,
}

#[async_trait]
pub trait MessageBus: Send {
    /// Wait up to `wait` for the next message.
    async fn receive(&mut self, wait: Duration) -> Result<Option<InboundMessage>, BusError>;

    async fn ack(&mut self, message: &InboundMessage) -> Result<(), BusError>;

    async fn nack(&mut self, message: &InboundMessage) -> Result<(), BusError>;

    /// Best-effort shutdown.
    async fn close(&mut self);
}

/// Broker connection settings.
#[derive(Clone)]
pub struct BrokerSettings {
    pub hosts: Vec<HostAddr>,
    pub user: String,
    pub password: String,
    pub destination: String,
}

impl fmt::Debug for BrokerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSettings")
            .field("hosts", &self.hosts)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("destination", &self.destination)
            .finish()
    }
}

/// Stable per-process client identifier: `<hostname>-<pid>`.
pub fn client_id() -> String {
    let host = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{}-{}", host, std::process::id())
}

/// STOMP-backed bus with one subscription.
pub struct StompBus {
    connection: Connection,
    subscription: String,
}

impl StompBus {
    pub async fn connect(settings: &BrokerSettings) -> Result<Self, BusError> {
        let options = ConnectOptions::new(settings.hosts.clone(), client_id())
            .credentials(settings.user.clone(), settings.password.clone());
        let mut connection = Connection::connect(options).await?;
        let subscription = connection.subscribe(&settings.destination).await?;

        info!(
            host = ?connection.current_host().map(ToString::to_string),
            version = ?connection.version(),
            destination = %settings.destination,
            "Subscribed"
        );

        Ok(Self {
            connection,
            subscription,
        })
    }

    fn ids<'a>(&'a self, message: &'a InboundMessage) -> Result<(&'a str, &'a str), BusError> {
        let id = message
            .message_id
            .as_deref()
            .ok_or(BusError::MissingMessageId)?;
        let subscription = message
            .subscription
            .as_deref()
            .unwrap_or(self.subscription.as_str());
        Ok((id, subscription))
    }
}

#[async_trait]
impl MessageBus for StompBus {
    async fn receive(&mut self, wait: Duration) -> Result<Option<InboundMessage>, BusError> {
        let Some(frame) = self.connection.receive(wait).await? else {
            return Ok(None);
        };

        Ok(Some(InboundMessage {
            message_id: frame.message_id().map(str::to_string),
            subscription: frame.subscription().map(str::to_string),
            destination: frame.get("destination").map(str::to_string),
            body: frame.body,
        }))
    }

    async fn ack(&mut self, message: &InboundMessage) -> Result<(), BusError> {
        let (id, subscription) = self.ids(message)?;
        let (id, subscription) = (id.to_string(), subscription.to_string());
        self.connection.ack(&id, &subscription).await?;
        Ok(())
    }

    async fn nack(&mut self, message: &InboundMessage) -> Result<(), BusError> {
        let (id, subscription) = self.ids(message)?;
        let (id, subscription) = (id.to_string(), subscription.to_string());
        self.connection.nack(&id, &subscription).await?;
        Ok(())
    }

    async fn close(&mut self) {
        self.connection.disconnect().await;
    }
}

#[derive(Debug, Default)]
struct Outcomes {
    acked: Vec<String>,
    nacked: Vec<String>,
}

/// In-process bus for tests and dry runs.
pub struct MemoryBus {
    rx: mpsc::UnboundedReceiver<InboundMessage>,
    outcomes: Arc<Mutex<Outcomes>>,
    closed: bool,
}

/// Publishing side of a [`MemoryBus`], also used to inspect dispositions.
#[derive(Clone)]
pub struct MemoryBusHandle {
    tx: mpsc::UnboundedSender<InboundMessage>,
    outcomes: Arc<Mutex<Outcomes>>,
}

impl MemoryBus {
    pub fn new() -> (MemoryBus, MemoryBusHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let outcomes = Arc::new(Mutex::new(Outcomes::default()));
        (
            MemoryBus {
                rx,
                outcomes: outcomes.clone(),
                closed: false,
            },
            MemoryBusHandle { tx, outcomes },
        )
    }

    fn outcomes(&self) -> MutexGuard<'_, Outcomes> {
        self.outcomes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn receive(&mut self, wait: Duration) -> Result<Option<InboundMessage>, BusError> {
        if self.closed {
            return Err(BusError::Closed);
        }

        match tokio::time::timeout(wait, self.rx.recv()).await {
            Ok(Some(message)) => Ok(Some(message)),
            // Every handle is gone; behave like an idle topic.
            Ok(None) => {
                tokio::time::sleep(wait).await;
                Ok(None)
            }
            Err(_) => Ok(None),
        }
    }

    async fn ack(&mut self, message: &InboundMessage) -> Result<(), BusError> {
        let id = message.message_id.clone().ok_or(BusError::MissingMessageId)?;
        self.outcomes().acked.push(id);
        Ok(())
    }

    async fn nack(&mut self, message: &InboundMessage) -> Result<(), BusError> {
        let id = message.message_id.clone().ok_or(BusError::MissingMessageId)?;
        self.outcomes().nacked.push(id);
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
        self.rx.close();
    }
}

impl MemoryBusHandle {
    /// Publish a message, optionally without a message id.
    pub fn publish(&self, message_id: Option<&str>, body: impl Into<Bytes>) {
        let message = InboundMessage {
            message_id: message_id.map(str::to_string),
            subscription: Some("memory".to_string()),
            destination: Some("/topic/routinginfo".to_string()),
            body: body.into(),
        };
        if self.tx.send(message).is_err() {
            warn!("Memory bus closed; message discarded");
        }
    }

    fn outcomes(&self) -> MutexGuard<'_, Outcomes> {
        self.outcomes.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ids acknowledged so far, in order.
    pub fn acked(&self) -> Vec<String> {
        self.outcomes().acked.clone()
    }

    /// Ids negatively acknowledged so far, in order.
    pub fn nacked(&self) -> Vec<String> {
        self.outcomes().nacked.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_settings_debug_redacts_password() {
        let settings = BrokerSettings {
            hosts: vec![HostAddr::new("mq1", 61613)],
            user: "routinginfo".to_string(),
            password: "routinginfopasswd".to_string(),
            destination: "/topic/routinginfo".to_string(),
        };
        let debug = format!("{settings:?}");
        assert!(!debug.contains("routinginfopasswd"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_client_id_ends_with_pid() {
        assert!(client_id().ends_with(&format!("-{}", std::process::id())));
    }

    #[tokio::test]
    async fn test_memory_bus_records_dispositions() {
        let (mut bus, handle) = MemoryBus::new();
        handle.publish(Some("m-1"), "a");
        handle.publish(Some("m-2"), "b");

        let first = bus.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        let second = bus.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        bus.ack(&first).await.unwrap();
        bus.nack(&second).await.unwrap();

        assert_eq!(handle.acked(), vec!["m-1"]);
        assert_eq!(handle.nacked(), vec!["m-2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_bus_times_out() {
        let (mut bus, _handle) = MemoryBus::new();
        assert!(bus.receive(Duration::from_secs(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_message_without_id_cannot_be_acked() {
        let (mut bus, handle) = MemoryBus::new();
        handle.publish(None, "a");

        let message = bus.receive(Duration::from_secs(1)).await.unwrap().unwrap();
        assert!(matches!(
            bus.ack(&message).await,
            Err(BusError::MissingMessageId)
        ));
    }
}
