//! Event type definitions.
//!
//! Each action has a payload struct with the action-specific fields. All
//! payloads identify the application by `app_name` and `namespace`.

use std::fmt;

use serde::{Deserialize, Deserializer};

// =============================================================================
// Action Names
// =============================================================================

/// All action names as they appear on the wire.
pub mod actions {
    pub const CREATE_APPLICATION: &str = "create_application";
    pub const DELETE_APPLICATION: &str = "delete_application";
    pub const ADD_PUBLIC_ENDPOINT: &str = "add_public_endpoint";
    pub const REMOVE_PUBLIC_ENDPOINT: &str = "remove_public_endpoint";
    pub const ADD_ALIAS: &str = "add_alias";
    pub const REMOVE_ALIAS: &str = "remove_alias";
    pub const ADD_SSL: &str = "add_ssl";
    pub const REMOVE_SSL: &str = "remove_ssl";
}

// =============================================================================
// Key Material
// =============================================================================

/// A PEM private key carried by `add_ssl`.
///
/// `Debug` is redacted; use [`PrivateKey::expose`] at the point of use.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct PrivateKey(String);

impl PrivateKey {
    pub fn new(pem: impl Into<String>) -> Self {
        Self(pem.into())
    }

    /// Returns the key material.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey(<redacted>)")
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Payload for `create_application` and `delete_application`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApplicationPayload {
    pub app_name: String,
    pub namespace: String,
}

/// Payload for `add_public_endpoint`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointAddedPayload {
    pub app_name: String,
    pub namespace: String,
    pub public_address: String,
    #[serde(deserialize_with = "deserialize_port")]
    pub public_port: u16,
    /// Endpoint types advertised by the cartridge (e.g. `load_balancer`).
    #[serde(default)]
    pub types: Vec<String>,
}

/// Payload for `remove_public_endpoint`. Carries no type information.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EndpointRemovedPayload {
    pub app_name: String,
    pub namespace: String,
    pub public_address: String,
    #[serde(deserialize_with = "deserialize_port")]
    pub public_port: u16,
}

/// Payload for `add_alias`, `remove_alias` and `remove_ssl`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AliasPayload {
    pub app_name: String,
    pub namespace: String,
    pub alias: String,
}

/// Payload for `add_ssl`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SslAddedPayload {
    pub app_name: String,
    pub namespace: String,
    pub alias: String,
    /// PEM certificate chain.
    pub ssl: String,
    pub private_key: PrivateKey,
}

// =============================================================================
// Events
// =============================================================================

/// A decoded routing event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingEvent {
    CreateApplication(ApplicationPayload),
    DeleteApplication(ApplicationPayload),
    AddPublicEndpoint(EndpointAddedPayload),
    RemovePublicEndpoint(EndpointRemovedPayload),
    AddAlias(AliasPayload),
    RemoveAlias(AliasPayload),
    AddSsl(SslAddedPayload),
    RemoveSsl(AliasPayload),
    /// An action this version does not know about.
    Unrecognized { action: String },
}

impl RoutingEvent {
    /// The wire action name.
    pub fn action(&self) -> &str {
        match self {
            RoutingEvent::CreateApplication(_) => actions::CREATE_APPLICATION,
            RoutingEvent::DeleteApplication(_) => actions::DELETE_APPLICATION,
            RoutingEvent::AddPublicEndpoint(_) => actions::ADD_PUBLIC_ENDPOINT,
            RoutingEvent::RemovePublicEndpoint(_) => actions::REMOVE_PUBLIC_ENDPOINT,
            RoutingEvent::AddAlias(_) => actions::ADD_ALIAS,
            RoutingEvent::RemoveAlias(_) => actions::REMOVE_ALIAS,
            RoutingEvent::AddSsl(_) => actions::ADD_SSL,
            RoutingEvent::RemoveSsl(_) => actions::REMOVE_SSL,
            RoutingEvent::Unrecognized { action } => action,
        }
    }

    /// The `(app_name, namespace)` this event is about, if known.
    pub fn application(&self) -> Option<(&str, &str)> {
        match self {
            RoutingEvent::CreateApplication(p) | RoutingEvent::DeleteApplication(p) => {
                Some((&p.app_name, &p.namespace))
            }
            RoutingEvent::AddPublicEndpoint(p) => Some((&p.app_name, &p.namespace)),
            RoutingEvent::RemovePublicEndpoint(p) => Some((&p.app_name, &p.namespace)),
            RoutingEvent::AddAlias(p)
            | RoutingEvent::RemoveAlias(p)
            | RoutingEvent::RemoveSsl(p) => Some((&p.app_name, &p.namespace)),
            RoutingEvent::AddSsl(p) => Some((&p.app_name, &p.namespace)),
            RoutingEvent::Unrecognized { .. } => None,
        }
    }

    /// One-line summary for logs. Never includes certificate or key material.
    pub fn summary(&self) -> String {
        let Some((app, ns)) = self.application() else {
            return self.action().to_string();
        };

        let detail = match self {
            RoutingEvent::AddPublicEndpoint(p) => format!(
                " endpoint={}:{} types={}",
                p.public_address,
                p.public_port,
                p.types.join(",")
            ),
            RoutingEvent::RemovePublicEndpoint(p) => {
                format!(" endpoint={}:{}", p.public_address, p.public_port)
            }
            RoutingEvent::AddAlias(p)
            | RoutingEvent::RemoveAlias(p)
            | RoutingEvent::RemoveSsl(p) => format!(" alias={}", p.alias),
            RoutingEvent::AddSsl(p) => format!(" alias={}", p.alias),
            _ => String::new(),
        };

        format!("{} app={} namespace={}{}", self.action(), app, ns, detail)
    }
}

// =============================================================================
// Field Helpers
// =============================================================================

/// Ports arrive as integers from newer producers and as strings from older ones.
fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PortRepr {
        Number(u64),
        Text(String),
    }

    let raw = match PortRepr::deserialize(deserializer)? {
        PortRepr::Number(n) => n,
        PortRepr::Text(s) => s
            .trim()
            .parse::<u64>()
            .map_err(|_| serde::de::Error::custom(format!("invalid port {s:?}")))?,
    };

    u16::try_from(raw)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| serde::de::Error::custom(format!("port {raw} out of range")))
}

// =============================================================================
// Tests
// =============================================================================
