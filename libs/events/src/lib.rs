//! # lbr-events
//!
//! Routing lifecycle events published by the platform broker and consumed by
//! the routing daemon.
//!
//! ## Design Principles
//!
//! - Every event names one application (`app_name`, `namespace`)
//! - Unknown actions decode successfully as [`RoutingEvent::Unrecognized`] so
//!   newer producers never break older consumers
//! - Key material never appears in `Debug` output or log summaries
//!
//! ## Wire Format
//!
//! Message bodies are YAML mappings with an `action` discriminator. The
//! platform broker emits Ruby-flavoured YAML where keys and enum values are
//! symbols:
//!
//! ```text
//! ---
//! :action: :add_public_endpoint
//! :app_name: blog
//! :namespace: ns1
//! :public_address: 10.0.0.1
//! :public_port: 8080
//! :types:
//! - load_balancer
//! ```
//!
//! Plain YAML and JSON bodies are accepted as well.

mod decode;
mod error;
mod types;

pub use decode::decode;
pub use error::EventError;
pub use types::*;
