//! Event body decoding.

use serde::de::DeserializeOwned;
use serde_yaml::{Mapping, Value};

use crate::error::EventError;
use crate::types::{actions, RoutingEvent};

/// Decode a message body into a [`RoutingEvent`].
///
/// Ruby symbol keys and values (`:action: :create_application`) are
/// normalized to plain strings before typing.
pub fn decode(body: &[u8]) -> Result<RoutingEvent, EventError> {
    let value: Value =
        serde_yaml::from_slice(body).map_err(|e| EventError::Syntax(e.to_string()))?;

    let value = normalize(value);

    let action = match &value {
        Value::Mapping(map) => map
            .get("action")
            .and_then(Value::as_str)
            .ok_or(EventError::MissingAction)?
            .to_string(),
        _ => return Err(EventError::NotAMapping),
    };

    let event = match action.as_str() {
        actions::CREATE_APPLICATION => RoutingEvent::CreateApplication(payload(&action, value)?),
        actions::DELETE_APPLICATION => RoutingEvent::DeleteApplication(payload(&action, value)?),
        actions::ADD_PUBLIC_ENDPOINT => RoutingEvent::AddPublicEndpoint(payload(&action, value)?),
        actions::REMOVE_PUBLIC_ENDPOINT => {
            RoutingEvent::RemovePublicEndpoint(payload(&action, value)?)
        }
        actions::ADD_ALIAS => RoutingEvent::AddAlias(payload(&action, value)?),
        actions::REMOVE_ALIAS => RoutingEvent::RemoveAlias(payload(&action, value)?),
        actions::ADD_SSL => RoutingEvent::AddSsl(payload(&action, value)?),
        actions::REMOVE_SSL => RoutingEvent::RemoveSsl(payload(&action, value)?),
        _ => RoutingEvent::Unrecognized { action },
    };

    Ok(event)
}

fn payload<T: DeserializeOwned>(action: &str, value: Value) -> Result<T, EventError> {
    serde_yaml::from_value(value).map_err(|e| EventError::InvalidPayload {
        action: action.to_string(),
        reason: e.to_string(),
    })
}

/// Strip Ruby symbol markers and YAML tags.
fn normalize(value: Value) -> Value {
    match value {
        Value::Mapping(map) => {
            let mut out = Mapping::with_capacity(map.len());
            for (k, v) in map {
                let key = match k {
                    Value::String(s) => {
                        Value::String(s.strip_prefix(':').map(str::to_string).unwrap_or(s))
                    }
                    other => normalize(other),
                };
                out.insert(key, normalize(v));
            }
            Value::Mapping(out)
        }
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(normalize).collect()),
        Value::String(s) => Value::String(symbol_name(&s).map(str::to_string).unwrap_or(s)),
        Value::Tagged(tagged) => normalize(tagged.value),
        other => other,
    }
}

/// `:create_application` -> `create_application`; anything else -> None.
fn symbol_name(s: &str) -> Option<&str> {
    let name = s.strip_prefix(':')?;
    let mut chars = name.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Some(name)
    } else {
        None
    }
}
