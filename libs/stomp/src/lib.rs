//! Minimal STOMP 1.1 consumer.
//!
//! Enough of the protocol to consume a pub/sub topic reliably:
//!
//! - CONNECT/CONNECTED handshake with version negotiation (1.1 or later,
//!   because NACK does not exist in 1.0)
//! - SUBSCRIBE with `ack:client-individual`
//! - MESSAGE delivery, ACK and NACK
//! - Failover across a list of brokers and transparent reconnect with
//!   subscription replay
//!
//! Heart-beating is disabled (`heart-beat:0,0`); a dead socket is detected on
//! the next read or write.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use lbr_stomp::{ConnectOptions, Connection, HostAddr};
//!
//! # async fn run() -> Result<(), lbr_stomp::StompError> {
//! let options = ConnectOptions::new(vec![HostAddr::new("127.0.0.1", 61613)], "host-1234")
//!     .credentials("routinginfo", "routinginfopasswd");
//! let mut conn = Connection::connect(options).await?;
//! let sub = conn.subscribe("/topic/routinginfo").await?;
//!
//! if let Some(frame) = conn.receive(Duration::from_secs(5)).await? {
//!     if let Some(id) = frame.message_id() {
//!         conn.ack(id, &sub).await?;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

mod connection;
mod error;
pub mod frame;

pub use connection::{
    ConnectOptions, Connection, HostAddr, Subscription, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_MAX_RECONNECT_DELAY,
};
pub use error::StompError;
pub use frame::{Command, Frame};
