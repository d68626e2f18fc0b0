//! Daemon configuration.
//!
//! A flat `KEY=value` file (read as INI without sections), overlaid by
//! `ROUTING_`-prefixed environment variables. Keys are case-insensitive.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Environment, File, FileFormat};
use lbr_reconcile::DEFAULT_RECONCILE_INTERVAL;
use lbr_stomp::HostAddr;
use reqwest::Url;
use thiserror::Error;

use crate::bus::BrokerSettings;
use crate::controller::Strategy;
use crate::model::{NginxSettings, ReloadMethod, RestAuth, RestSettings};
use crate::naming::NamingTemplates;
use crate::router::{MonitorSettings, RouterSettings};

/// Default configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/openshift/routing-daemon.conf";

/// Prefix of environment overrides, e.g. `ROUTING_ACTIVEMQ_HOST`.
pub const ENV_PREFIX: &str = "ROUTING";

const DEFAULT_BROKER_PORT: u16 = 61613;

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid {key} {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

fn invalid(key: &'static str, value: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub target: LogTarget,
    /// A `tracing` level name.
    pub level: String,
}

/// Backend technology.
#[derive(Debug, Clone)]
pub enum ModelSelection {
    Dummy,
    Nginx(NginxSettings),
    Rest(RestSettings),
}

impl ModelSelection {
    pub fn name(&self) -> &'static str {
        match self {
            ModelSelection::Dummy => "dummy",
            ModelSelection::Nginx(_) => "nginx",
            ModelSelection::Rest(_) => "rest",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackendSelection {
    pub model: ModelSelection,
    pub strategy: Strategy,
}

/// Fully validated daemon configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerSettings,
    pub router: RouterSettings,
    pub update_interval: Duration,
    pub log: LogSettings,
    pub backend: BackendSelection,
}

impl Config {
    /// Load the file at `path`, then apply environment overrides.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw: HashMap<String, String> = config::Config::builder()
            .add_source(File::from(path).format(FileFormat::Ini))
            .add_source(Environment::with_prefix(ENV_PREFIX).prefix_separator("_"))
            .build()?
            .try_deserialize()?;

        Self::from_map(raw)
    }

    /// Build from raw key/value pairs.
    pub fn from_map(raw: HashMap<String, String>) -> Result<Self, ConfigError> {
        let values = Values::new(raw);

        let broker = BrokerSettings {
            hosts: parse_hosts(&values)?,
            user: values.get_or("ACTIVEMQ_USER", "routinginfo"),
            password: values.get_or("ACTIVEMQ_PASSWORD", "routinginfopasswd"),
            destination: values
                .get("ACTIVEMQ_DESTINATION")
                .or_else(|| values.get("ACTIVEMQ_TOPIC"))
                .unwrap_or_else(|| "/topic/routinginfo".to_string()),
        };

        let endpoint_types: BTreeSet<String> = values
            .get_or("ENDPOINT_TYPES", "load_balancer")
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .collect();

        let router = RouterSettings {
            endpoint_types,
            cloud_domain: values.get_or("CLOUD_DOMAIN", "example.com"),
            naming: NamingTemplates {
                pool: values.get_or("POOL_NAME", "pool_ose_%a_%n_80"),
                route: values.get_or("ROUTE_NAME", "route_ose_%a_%n"),
                monitor_name: values.get("MONITOR_NAME"),
                monitor_path: values.get("MONITOR_PATH"),
            },
            monitor: MonitorSettings {
                up_code: values.get_or("MONITOR_UP_CODE", "1"),
                kind: values.get_or("MONITOR_TYPE", "http-ecv"),
                interval: values.positive("MONITOR_INTERVAL", 10)?,
                timeout: values.positive("MONITOR_TIMEOUT", 5)?,
            },
        };

        let update_interval = values.seconds("UPDATE_INTERVAL", DEFAULT_RECONCILE_INTERVAL)?;

        let target = match values.get("LOGFILE").as_deref() {
            Some("-") | Some("stdout") => LogTarget::Stdout,
            Some(path) => LogTarget::File(PathBuf::from(path)),
            None => LogTarget::File(PathBuf::from("/var/log/openshift/routing-daemon.log")),
        };
        let log = LogSettings {
            target,
            level: parse_level(&values.get_or("LOGLEVEL", "debug"))?,
        };

        let backend = parse_backend(&values)?;

        Ok(Self {
            broker,
            router,
            update_interval,
            log,
            backend,
        })
    }
}

/// Normalized raw values: uppercase keys, unquoted values, empty means unset.
struct Values(HashMap<String, String>);

impl Values {
    fn new(raw: HashMap<String, String>) -> Self {
        Values(
            raw.into_iter()
                .map(|(k, v)| (k.to_ascii_uppercase(), unquote(v.trim()).to_string()))
                .filter(|(_, v)| !v.is_empty())
                .collect(),
        )
    }

    fn get(&self, key: &str) -> Option<String> {
        self.0.get(key).cloned()
    }

    fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn number<T: std::str::FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError>
    where
        T::Err: std::fmt::Display,
    {
        match self.0.get(key) {
            Some(v) => v.parse().map_err(|e: T::Err| invalid(key, v, e.to_string())),
            None => Ok(default),
        }
    }

    fn positive(&self, key: &'static str, default: u32) -> Result<u32, ConfigError> {
        let n = self.number(key, default)?;
        if n == 0 {
            return Err(invalid(key, "0", "must be at least 1"));
        }
        Ok(n)
    }

    fn seconds(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        match self.0.get(key) {
            Some(_) => Ok(Duration::from_secs(self.positive(key, 1)?.into())),
            None => Ok(default),
        }
    }
}

fn unquote(s: &str) -> &str {
    for quote in ['"', '\''] {
        if let Some(inner) = s.strip_prefix(quote).and_then(|s| s.strip_suffix(quote)) {
            return inner;
        }
    }
    s
}

fn parse_hosts(values: &Values) -> Result<Vec<HostAddr>, ConfigError> {
    let default_port = values.number("ACTIVEMQ_PORT", DEFAULT_BROKER_PORT)?;
    let list = values.get_or("ACTIVEMQ_HOST", "activemq.example.com");

    let mut hosts = Vec::new();
    for entry in list.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        hosts.push(parse_host(entry, default_port)?);
    }

    if hosts.is_empty() {
        return Err(ConfigError::Missing("ACTIVEMQ_HOST"));
    }
    Ok(hosts)
}

/// `host`, `host:port`, `[v6]`, `[v6]:port`, or a bare IPv6 address.
fn parse_host(entry: &str, default_port: u16) -> Result<HostAddr, ConfigError> {
    let port = |port: &str| {
        port.parse::<u16>()
            .map_err(|_| invalid("ACTIVEMQ_HOST", entry, "port is not a number"))
    };

    if let Some(rest) = entry.strip_prefix('[') {
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| invalid("ACTIVEMQ_HOST", entry, "missing ']'"))?;
        return match tail {
            "" => Ok(HostAddr::new(host, default_port)),
            _ => match tail.strip_prefix(':') {
                Some(p) => Ok(HostAddr::new(host, port(p)?)),
                None => Err(invalid("ACTIVEMQ_HOST", entry, "expected ':' after ']'")),
            },
        };
    }

    match entry.split_once(':') {
        Some((host, p)) if !p.contains(':') => Ok(HostAddr::new(host, port(p)?)),
        _ => Ok(HostAddr::new(entry, default_port)),
    }
}

fn parse_level(level: &str) -> Result<String, ConfigError> {
    match level.to_ascii_lowercase().as_str() {
        l @ ("trace" | "debug" | "info" | "warn" | "error") => Ok(l.to_string()),
        "fatal" => Ok("error".to_string()),
        _ => Err(invalid(
            "LOGLEVEL",
            level,
            "expected trace, debug, info, warn, error or fatal",
        )),
    }
}

fn parse_backend(values: &Values) -> Result<BackendSelection, ConfigError> {
    let selector = values
        .get("LOAD_BALANCER")
        .ok_or(ConfigError::Missing("LOAD_BALANCER"))?
        .to_ascii_lowercase();

    let (model, strategy) = match selector.as_str() {
        "lbaas" => ("rest", Strategy::Async),
        other => match other.split_once('_') {
            Some((model, strategy)) => {
                let strategy = Strategy::parse(strategy).ok_or_else(|| {
                    invalid("LOAD_BALANCER", other, "unknown strategy")
                })?;
                (model, strategy)
            }
            None => (other, Strategy::Simple),
        },
    };

    let model = match model {
        "dummy" => ModelSelection::Dummy,
        "nginx" => ModelSelection::Nginx(nginx_settings(values)?),
        "rest" => ModelSelection::Rest(rest_settings(values)?),
        _ => {
            return Err(invalid(
                "LOAD_BALANCER",
                &selector,
                "expected <dummy|nginx|rest>[_<simple|batched|async>] or lbaas",
            ))
        }
    };

    Ok(BackendSelection { model, strategy })
}

fn nginx_settings(values: &Values) -> Result<NginxSettings, ConfigError> {
    let reload = match values.get("NGINX_RELOAD_COMMAND") {
        Some(command) => ReloadMethod::Command(
            command.split_whitespace().map(str::to_string).collect(),
        ),
        None => ReloadMethod::Signal {
            pidfile: PathBuf::from(values.get_or("NGINX_PIDFILE", "/var/run/nginx.pid")),
        },
    };

    Ok(NginxSettings {
        confdir: PathBuf::from(values.get_or("NGINX_CONFDIR", "/etc/nginx/conf.d/openshift")),
        reload,
        http_port: values.number("NGINX_HTTP_PORT", 80)?,
        ssl_port: values.number("NGINX_SSL_PORT", 443)?,
    })
}

fn rest_settings(values: &Values) -> Result<RestSettings, ConfigError> {
    let raw_url = values.get("LBAAS_URL").ok_or(ConfigError::Missing("LBAAS_URL"))?;
    let base_url = Url::parse(&raw_url).map_err(|e| invalid("LBAAS_URL", &raw_url, e.to_string()))?;

    let auth = match (
        values.get("LBAAS_TOKEN"),
        values.get("LBAAS_USERNAME"),
        values.get("LBAAS_PASSWORD"),
    ) {
        (Some(token), _, _) => RestAuth::Bearer(token),
        (None, Some(username), password) => RestAuth::Basic {
            username,
            password: password.unwrap_or_default(),
        },
        (None, None, _) => RestAuth::None,
    };

    Ok(RestSettings {
        base_url,
        auth,
        timeout: Duration::from_secs(values.positive("LBAAS_TIMEOUT", 30)?.into()),
    })
}
