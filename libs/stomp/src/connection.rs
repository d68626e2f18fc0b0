//! Broker connection with host failover and transparent reconnect.
//!
//! The connection negotiates STOMP 1.1 (required for NACK), subscribes with
//! `ack:client-individual`, and remembers its subscriptions so they can be
//! replayed on a new socket after the old one is lost. Unacknowledged
//! messages from the lost socket are redelivered by the broker.

use std::fmt;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::error::StompError;
use crate::frame::{parse_frame, Command, Frame};

/// Default timeout for TCP connect plus the CONNECT/CONNECTED exchange.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound on the delay between reconnect attempts.
pub const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_millis(100);

/// A broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAddr {
    pub host: String,
    pub port: u16,
}

impl HostAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for HostAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Connection parameters.
#[derive(Clone)]
pub struct ConnectOptions {
    /// Brokers in failover order.
    pub hosts: Vec<HostAddr>,
    pub login: String,
    pub passcode: String,
    /// Stable per-process client identifier.
    pub client_id: String,
    /// Value of the CONNECT `host` header (virtual host, not the socket host).
    pub virtual_host: String,
    pub connect_timeout: Duration,
    pub max_reconnect_delay: Duration,
}

impl ConnectOptions {
    pub fn new(hosts: Vec<HostAddr>, client_id: impl Into<String>) -> Self {
        Self {
            hosts,
            login: String::new(),
            passcode: String::new(),
            client_id: client_id.into(),
            virtual_host: "localhost".to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
        }
    }

    pub fn credentials(mut self, login: impl Into<String>, passcode: impl Into<String>) -> Self {
        self.login = login.into();
        self.passcode = passcode.into();
        self
    }

    fn connect_frame(&self) -> Frame {
        // Different brokers read the client id from different header names.
        Frame::new(Command::Connect)
            .header("accept-version", "1.1")
            .header("host", self.virtual_host.clone())
            .header("login", self.login.clone())
            .header("passcode", self.passcode.clone())
            .header("heart-beat", "0,0")
            .header("client-id", self.client_id.clone())
            .header("client_id", self.client_id.clone())
            .header("clientID", self.client_id.clone())
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("hosts", &self.hosts)
            .field("login", &self.login)
            .field("passcode", &"<redacted>")
            .field("client_id", &self.client_id)
            .field("virtual_host", &self.virtual_host)
            .field("connect_timeout", &self.connect_timeout)
            .field("max_reconnect_delay", &self.max_reconnect_delay)
            .finish()
    }
}

/// An active subscription, replayed after reconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub destination: String,
}

/// One open socket plus its read buffer.
#[derive(Debug)]
struct Session {
    stream: TcpStream,
    buf: BytesMut,
    host: HostAddr,
    version: String,
}

impl Session {
    async fn open(host: &HostAddr, options: &ConnectOptions) -> Result<Self, StompError> {
        let deadline = Instant::now() + options.connect_timeout;

        let stream = timeout_at(deadline, TcpStream::connect((host.host.as_str(), host.port)))
            .await
            .map_err(|_| StompError::Timeout("TCP connect"))??;
        stream.set_nodelay(true)?;

        let mut session = Self {
            stream,
            buf: BytesMut::with_capacity(8 * 1024),
            host: host.clone(),
            version: String::new(),
        };

        session.send(&options.connect_frame()).await?;

        let frame = session
            .read_frame(deadline)
            .await?
            .ok_or(StompError::Timeout("CONNECTED frame"))?;

        match frame.command {
            Command::Connected => {}
            Command::Error => return Err(StompError::Broker(frame.error_text())),
            other => return Err(StompError::UnexpectedFrame(other.to_string())),
        }

        // A broker that omits `version` speaks 1.0.
        let version = frame.get("version").unwrap_or("1.0").to_string();
        if !supports_nack(&version) {
            return Err(StompError::UnsupportedVersion(version));
        }

        session.version = version;
        Ok(session)
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), StompError> {
        self.stream.write_all(&frame.to_bytes()).await?;
        Ok(())
    }

    /// Read the next frame, or `None` once `deadline` passes.
    ///
    /// Cancel-safe: bytes already read stay in the session buffer.
    async fn read_frame(&mut self, deadline: Instant) -> Result<Option<Frame>, StompError> {
        loop {
            if let Some(frame) = parse_frame(&mut self.buf)? {
                return Ok(Some(frame));
            }

            match timeout_at(deadline, self.stream.read_buf(&mut self.buf)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => return Err(StompError::Closed),
                Ok(Ok(_)) => continue,
                Ok(Err(e)) => return Err(e.into()),
            }
        }
    }
}

fn supports_nack(version: &str) -> bool {
    version
        .split(',')
        .filter_map(|v| {
            let (major, minor) = v.trim().split_once('.')?;
            Some((major.parse::<u32>().ok()?, minor.parse::<u32>().ok()?))
        })
        .any(|v| v >= (1, 1))
}

/// A reliable STOMP consumer connection.
#[derive(Debug)]
pub struct Connection {
    options: ConnectOptions,
    session: Option<Session>,
    subscriptions: Vec<Subscription>,
    reconnect_delay: Duration,
}

impl Connection {
    /// Connect to the first reachable broker.
    ///
    /// Each host is tried once; if all fail the error is returned rather than
    /// retried, since a daemon that cannot reach any broker at startup is
    /// misconfigured.
    pub async fn connect(options: ConnectOptions) -> Result<Self, StompError> {
        let session = open_any(&options).await?;
        info!(
            host = %session.host,
            version = %session.version,
            client_id = %options.client_id,
            "Connected to broker"
        );

        Ok(Self {
            options,
            session: Some(session),
            subscriptions: Vec::new(),
            reconnect_delay: INITIAL_RECONNECT_DELAY,
        })
    }

    /// Returns true while a socket is open.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// The negotiated protocol version, if connected.
    pub fn version(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.version.as_str())
    }

    /// The broker currently connected to.
    pub fn current_host(&self) -> Option<&HostAddr> {
        self.session.as_ref().map(|s| &s.host)
    }

    /// Subscribe to a destination with per-message client acknowledgment.
    ///
    /// Returns the subscription id to use with [`Connection::ack`] and
    /// [`Connection::nack`].
    pub async fn subscribe(&mut self, destination: &str) -> Result<String, StompError> {
        let subscription = Subscription {
            id: uuid::Uuid::new_v4().to_string(),
            destination: destination.to_string(),
        };

        self.send(&subscribe_frame(&subscription)).await?;
        info!(
            destination = %subscription.destination,
            subscription = %subscription.id,
            "Subscribed"
        );

        let id = subscription.id.clone();
        self.subscriptions.push(subscription);
        Ok(id)
    }

    /// Wait up to `wait` for the next MESSAGE frame.
    ///
    /// Returns `Ok(None)` on timeout. If the socket was lost earlier, a
    /// reconnect (with subscription replay) is attempted first; a failed
    /// attempt sleeps for the current backoff, bounded by `wait`, and
    /// returns the error.
    ///
    /// Cancel-safe with respect to frame data.
    pub async fn receive(&mut self, wait: Duration) -> Result<Option<Frame>, StompError> {
        let deadline = Instant::now() + wait;

        if self.session.is_none() {
            match timeout_at(deadline, self.reconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let delay = self.reconnect_delay;
                    self.reconnect_delay = (delay * 2).min(self.options.max_reconnect_delay);
                    warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "Reconnect failed");
                    let _ = timeout_at(deadline, sleep(delay)).await;
                    return Err(e);
                }
                Err(_) => return Ok(None),
            }
        }

        loop {
            let Some(session) = self.session.as_mut() else {
                return Err(StompError::NotConnected);
            };

            let frame = match session.read_frame(deadline).await {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(None),
                Err(e) => {
                    warn!(host = %session.host, error = %e, "Broker connection lost");
                    self.session = None;
                    return Err(e);
                }
            };

            match frame.command {
                Command::Message => return Ok(Some(frame)),
                Command::Error => {
                    let text = frame.error_text();
                    warn!(error = %text, "Broker sent ERROR frame; dropping connection");
                    self.session = None;
                    return Err(StompError::Broker(text));
                }
                other => {
                    debug!(command = %other, "Ignoring frame");
                }
            }
        }
    }

    /// Acknowledge a message.
    pub async fn ack(&mut self, message_id: &str, subscription: &str) -> Result<(), StompError> {
        let frame = Frame::new(Command::Ack)
            .header("message-id", message_id)
            .header("subscription", subscription);
        self.send(&frame).await
    }

    /// Negatively acknowledge a message so the broker redelivers it.
    pub async fn nack(&mut self, message_id: &str, subscription: &str) -> Result<(), StompError> {
        let frame = Frame::new(Command::Nack)
            .header("message-id", message_id)
            .header("subscription", subscription);
        self.send(&frame).await
    }

    /// Send DISCONNECT and close the socket. Best effort.
    pub async fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            let frame = Frame::new(Command::Disconnect);
            match timeout(Duration::from_secs(1), session.send(&frame)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(error = %e, "DISCONNECT not sent"),
                Err(_) => debug!("DISCONNECT timed out"),
            }
            let _ = session.stream.shutdown().await;
            info!(host = %session.host, "Disconnected from broker");
        }
    }

    async fn send(&mut self, frame: &Frame) -> Result<(), StompError> {
        let Some(session) = self.session.as_mut() else {
            return Err(StompError::NotConnected);
        };

        if let Err(e) = session.send(frame).await {
            warn!(host = %session.host, error = %e, command = %frame.command, "Send failed");
            self.session = None;
            return Err(e);
        }
        Ok(())
    }

    async fn reconnect(&mut self) -> Result<(), StompError> {
        let mut session = open_any(&self.options).await?;

        for subscription in &self.subscriptions {
            session.send(&subscribe_frame(subscription)).await?;
        }

        info!(
            host = %session.host,
            subscriptions = self.subscriptions.len(),
            "Reconnected to broker"
        );
        self.session = Some(session);
        self.reconnect_delay = INITIAL_RECONNECT_DELAY;
        Ok(())
    }
}

fn subscribe_frame(subscription: &Subscription) -> Frame {
    Frame::new(Command::Subscribe)
        .header("destination", subscription.destination.clone())
        .header("id", subscription.id.clone())
        .header("ack", "client-individual")
}

async fn open_any(options: &ConnectOptions) -> Result<Session, StompError> {
    if options.hosts.is_empty() {
        return Err(StompError::NoHosts);
    }

    let mut failures = Vec::with_capacity(options.hosts.len());
    for host in &options.hosts {
        match Session::open(host, options).await {
            Ok(session) => return Ok(session),
            // Version mismatch is a broker property, not a transient failure.
            Err(e @ StompError::UnsupportedVersion(_)) => return Err(e),
            Err(e) => {
                debug!(host = %host, error = %e, "Broker connect attempt failed");
                failures.push(format!("{host}: {e}"));
            }
        }
    }

    Err(StompError::Unreachable(failures.join("; ")))
}
