//! nginx backend.
//!
//! Desired state lives in `<confdir>/routing-state.json`; every committed
//! change re-renders `<confdir>/openshift-routes.conf` and reloads nginx.
//! Certificates and keys are written to `<confdir>/certs/`.
//!
//! All files are written atomically (temp file + rename) so nginx never reads
//! a half-written include. Open-source nginx has no active health checks, so
//! monitors are kept in state and rendered as comments only.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::{self, Write as _};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use lbr_events::PrivateKey;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{BackendModel, Change, Member, ModelError, MonitorSpec, Pool, Pools};

/// State file format version.
const STATE_VERSION: u32 = 1;

const STATE_FILE: &str = "routing-state.json";
const CONF_FILE: &str = "openshift-routes.conf";
const CERTS_DIR: &str = "certs";

/// How nginx is told to pick up a new config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadMethod {
    /// Run a command (argv, no shell).
    Command(Vec<String>),
    /// Send SIGHUP to the pid in this file. A missing pidfile means nginx is
    /// not running and the reload is skipped.
    Signal { pidfile: PathBuf },
}

/// nginx adapter settings.
#[derive(Debug, Clone)]
pub struct NginxSettings {
    pub confdir: PathBuf,
    pub reload: ReloadMethod,
    pub http_port: u16,
    pub ssl_port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RouteEntry {
    pool: String,
    path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NginxState {
    version: u32,
    #[serde(default)]
    pools: Pools,
    #[serde(default)]
    routes: BTreeMap<String, RouteEntry>,
    #[serde(default)]
    monitors: BTreeMap<String, MonitorSpec>,
}

impl Default for NginxState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            pools: Pools::new(),
            routes: BTreeMap::new(),
            monitors: BTreeMap::new(),
        }
    }
}

/// Certificate file work staged while a commit mutates its state copy. Keyed
/// by alias; the last change to an alias wins.
enum CertOp {
    Write { cert: String, key: PrivateKey },
    Remove,
}

type CertOps = BTreeMap<String, CertOp>;

/// nginx-backed load balancer.
pub struct NginxModel {
    settings: NginxSettings,
    state: Mutex<NginxState>,
    reload_pending: AtomicBool,
}

impl NginxModel {
    /// Load existing state (if any) and write the rendered config.
    pub fn open(settings: NginxSettings) -> Result<Self, ModelError> {
        let certs = settings.confdir.join(CERTS_DIR);
        fs::create_dir_all(&certs).map_err(|source| ModelError::Io {
            path: certs.clone(),
            source,
        })?;

        let state = load_state(&settings.confdir.join(STATE_FILE))?;
        info!(
            confdir = %settings.confdir.display(),
            pool_count = state.pools.len(),
            route_count = state.routes.len(),
            "Loaded nginx routing state"
        );

        write_files(&settings, &state)?;

        Ok(Self {
            settings,
            state: Mutex::new(state),
            reload_pending: AtomicBool::new(false),
        })
    }

    fn certs_dir(&self) -> PathBuf {
        self.settings.confdir.join(CERTS_DIR)
    }

    /// Apply changes to a copy of the state; persist, render and reload once
    /// if anything changed. Certificate files are only touched after the
    /// whole batch applied and the state and config files were written.
    async fn commit(&self, changes: &[Change]) -> Result<(), ModelError> {
        let mut state = self.state.lock().await;

        let mut next = state.clone();
        let mut certs = CertOps::new();
        let mut changed = false;
        for change in changes {
            changed |= Self::mutate(&mut next, change, &mut certs)?;
        }

        // A failed reload is retried on the next commit, even an empty one,
        // so a redelivered event gets nginx in sync.
        let reload_pending = self.reload_pending.load(Ordering::SeqCst);
        if !changed && !reload_pending {
            debug!(changes = changes.len(), "nginx state already up to date");
            return Ok(());
        }

        if changed {
            write_files(&self.settings, &next)?;
            *state = next;
            if let Err(e) = self.sync_cert_files(&certs) {
                self.reload_pending.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }

        let result = self.reload().await;
        self.reload_pending.store(result.is_err(), Ordering::SeqCst);
        result
    }

    /// Writes staged certificates before removing stale ones.
    fn sync_cert_files(&self, certs: &CertOps) -> Result<(), ModelError> {
        for (alias, op) in certs {
            if let CertOp::Write { cert, key } = op {
                self.write_cert_files(alias, cert, key)?;
            }
        }
        for (alias, op) in certs {
            if let CertOp::Remove = op {
                self.remove_cert_files(alias)?;
            }
        }
        Ok(())
    }

    /// Returns true if the state changed.
    fn mutate(
        state: &mut NginxState,
        change: &Change,
        certs: &mut CertOps,
    ) -> Result<bool, ModelError> {
        let changed = match change {
            Change::CreateMonitor(monitor) => {
                if state.monitors.get(&monitor.name) == Some(monitor) {
                    false
                } else {
                    state.monitors.insert(monitor.name.clone(), monitor.clone());
                    true
                }
            }
            Change::DeleteMonitor { name, .. } => state.monitors.remove(name).is_some(),
            Change::CreatePool { name, monitor } => match state.pools.get_mut(name) {
                Some(pool) if pool.monitor == *monitor => false,
                Some(pool) => {
                    pool.monitor = monitor.clone();
                    true
                }
                None => {
                    validate_name("pool", name)?;
                    state
                        .pools
                        .insert(name.clone(), Pool::new(name.clone(), monitor.clone()));
                    true
                }
            },
            Change::DeletePool { name } => match state.pools.remove(name) {
                Some(pool) => {
                    for alias in pool.tls_aliases {
                        certs.insert(alias, CertOp::Remove);
                    }
                    true
                }
                None => false,
            },
            Change::CreateRoute { pool, route, path } => {
                existing_pool(state, pool)?;
                let entry = RouteEntry {
                    pool: pool.clone(),
                    path: path.clone(),
                };
                if state.routes.get(route) == Some(&entry) {
                    false
                } else {
                    state.routes.insert(route.clone(), entry);
                    true
                }
            }
            Change::DeleteRoute { route, .. } => state.routes.remove(route).is_some(),
            Change::AddMember { pool, member } => {
                existing_pool(state, pool)?.members.insert(member.clone())
            }
            Change::DeleteMember { pool, member } => state
                .pools
                .get_mut(pool)
                .is_some_and(|p| p.members.remove(member)),
            Change::AddAlias { pool, alias } => {
                validate_name("alias", alias)?;
                existing_pool(state, pool)?.aliases.insert(alias.clone())
            }
            Change::DeleteAlias { pool, alias } => {
                let Some(p) = state.pools.get_mut(pool) else {
                    return Ok(false);
                };
                let had_tls = p.tls_aliases.remove(alias);
                if had_tls {
                    certs.insert(alias.clone(), CertOp::Remove);
                }
                p.aliases.remove(alias) || had_tls
            }
            Change::AddSsl {
                pool,
                alias,
                cert,
                key,
            } => {
                validate_name("alias", alias)?;
                existing_pool(state, pool)?.tls_aliases.insert(alias.clone());
                certs.insert(
                    alias.clone(),
                    CertOp::Write {
                        cert: cert.clone(),
                        key: key.clone(),
                    },
                );
                // Certificate contents may have changed even if the binding existed.
                true
            }
            Change::RemoveSsl { pool, alias } => {
                let removed = state
                    .pools
                    .get_mut(pool)
                    .is_some_and(|p| p.tls_aliases.remove(alias));
                if removed {
                    certs.insert(alias.clone(), CertOp::Remove);
                }
                removed
            }
        };

        Ok(changed)
    }

    fn cert_paths(&self, alias: &str) -> (PathBuf, PathBuf) {
        let dir = self.certs_dir();
        (
            dir.join(format!("{alias}.crt")),
            dir.join(format!("{alias}.key")),
        )
    }

    fn write_cert_files(
        &self,
        alias: &str,
        cert: &str,
        key: &PrivateKey,
    ) -> Result<(), ModelError> {
        let (cert_path, key_path) = self.cert_paths(alias);
        write_atomic(&cert_path, cert.as_bytes(), 0o644)?;
        write_atomic(&key_path, key.expose().as_bytes(), 0o600)?;
        debug!(alias = %alias, "Wrote TLS certificate and key");
        Ok(())
    }

    fn remove_cert_files(&self, alias: &str) -> Result<(), ModelError> {
        let (cert_path, key_path) = self.cert_paths(alias);
        for path in [cert_path, key_path] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(ModelError::Io { path, source }),
            }
        }
        Ok(())
    }

    async fn reload(&self) -> Result<(), ModelError> {
        match &self.settings.reload {
            ReloadMethod::Command(argv) => {
                let Some((program, args)) = argv.split_first() else {
                    return Err(ModelError::Reload("empty reload command".to_string()));
                };

                let status = tokio::process::Command::new(program)
                    .args(args)
                    .status()
                    .await
                    .map_err(|e| ModelError::Reload(format!("{program}: {e}")))?;

                if !status.success() {
                    return Err(ModelError::Reload(format!("{program} exited with {status}")));
                }
                debug!(command = %program, "nginx reloaded");
                Ok(())
            }
            ReloadMethod::Signal { pidfile } => {
                let contents = match fs::read_to_string(pidfile) {
                    Ok(contents) => contents,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        warn!(
                            pidfile = %pidfile.display(),
                            "nginx pidfile not found; skipping reload"
                        );
                        return Ok(());
                    }
                    Err(source) => {
                        return Err(ModelError::Io {
                            path: pidfile.clone(),
                            source,
                        })
                    }
                };

                let pid: i32 = contents.trim().parse().map_err(|_| {
                    ModelError::Reload(format!(
                        "invalid pid {:?} in {}",
                        contents.trim(),
                        pidfile.display()
                    ))
                })?;

                kill(Pid::from_raw(pid), Signal::SIGHUP)
                    .map_err(|e| ModelError::Reload(format!("SIGHUP to {pid}: {e}")))?;
                debug!(pid, "Sent SIGHUP to nginx");
                Ok(())
            }
        }
    }
}

fn write_files(settings: &NginxSettings, state: &NginxState) -> Result<(), ModelError> {
    let state_path = settings.confdir.join(STATE_FILE);
    let json = serde_json::to_vec_pretty(state).map_err(|e| ModelError::State {
        path: state_path.clone(),
        reason: e.to_string(),
    })?;
    write_atomic(&state_path, &json, 0o600)?;

    let conf_path = settings.confdir.join(CONF_FILE);
    let conf = render(state, settings, &settings.confdir.join(CERTS_DIR));
    write_atomic(&conf_path, conf.as_bytes(), 0o644)?;

    debug!(
        path = %conf_path.display(),
        pool_count = state.pools.len(),
        "Rendered nginx config"
    );
    Ok(())
}

fn existing_pool<'a>(state: &'a mut NginxState, pool: &str) -> Result<&'a mut Pool, ModelError> {
    state
        .pools
        .get_mut(pool)
        .ok_or_else(|| ModelError::NoSuchPool(pool.to_string()))
}

/// Names end up in file names and config tokens.
fn validate_name(kind: &'static str, name: &str) -> Result<(), ModelError> {
    let valid = !name.is_empty()
        && name.len() <= 253
        && !name.starts_with('.')
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '*'));

    if valid {
        Ok(())
    } else {
        Err(ModelError::InvalidName {
            kind,
            name: name.to_string(),
        })
    }
}

fn load_state(path: &Path) -> Result<NginxState, ModelError> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No state file, starting empty");
            return Ok(NginxState::default());
        }
        Err(source) => {
            return Err(ModelError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let state: NginxState = serde_json::from_slice(&contents).map_err(|e| ModelError::State {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if state.version != STATE_VERSION {
        return Err(ModelError::State {
            path: path.to_path_buf(),
            reason: format!("unsupported version {}", state.version),
        });
    }

    Ok(state)
}

fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), ModelError> {
    let mut tmp: OsString = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source| ModelError::Io { path, source }
    };

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(mode)
        .open(&tmp)
        .map_err(io_err(&tmp))?;
    file.write_all(contents).map_err(io_err(&tmp))?;
    file.sync_all().map_err(io_err(&tmp))?;
    drop(file);

    fs::rename(&tmp, path).map_err(io_err(path))
}

fn render(state: &NginxState, settings: &NginxSettings, certs: &Path) -> String {
    let mut out = String::from("# Generated by routing-daemon; manual edits are overwritten.\n");

    for pool in state.pools.values() {
        if pool.members.is_empty() {
            continue;
        }
        let _ = writeln!(out, "\nupstream {} {{", pool.name);
        if let Some(monitor) = pool.monitor.as_ref().and_then(|m| state.monitors.get(m)) {
            let _ = writeln!(
                out,
                "    # monitor {}: {} {} expect {} every {}s timeout {}s",
                monitor.name,
                monitor.kind,
                monitor.path,
                monitor.up_code,
                monitor.interval,
                monitor.timeout
            );
        }
        for Member { host, port } in &pool.members {
            let _ = writeln!(out, "    server {host}:{port};");
        }
        out.push_str("}\n");
    }

    for pool in state.pools.values() {
        let routes: Vec<&RouteEntry> = state
            .routes
            .values()
            .filter(|r| r.pool == pool.name)
            .collect();

        for alias in &pool.aliases {
            let _ = writeln!(out, "\nserver {{");
            let _ = writeln!(out, "    listen {};", settings.http_port);
            if pool.tls_aliases.contains(alias) {
                let _ = writeln!(out, "    listen {} ssl;", settings.ssl_port);
                let _ = writeln!(
                    out,
                    "    ssl_certificate {};",
                    certs.join(format!("{alias}.crt")).display()
                );
                let _ = writeln!(
                    out,
                    "    ssl_certificate_key {};",
                    certs.join(format!("{alias}.key")).display()
                );
            }
            let _ = writeln!(out, "    server_name {alias};");
            for route in &routes {
                let _ = writeln!(out, "\n    location {} {{", route.path);
                if pool.members.is_empty() {
                    out.push_str("        return 502;\n");
                } else {
                    let _ = writeln!(out, "        proxy_pass http://{};", pool.name);
                }
                out.push_str("    }\n");
            }
            out.push_str("}\n");
        }
    }

    out
}

#[async_trait]
impl BackendModel for NginxModel {
    fn name(&self) -> &'static str {
        "nginx"
    }

    async fn get_pools(&self) -> Result<Pools, ModelError> {
        Ok(self.state.lock().await.pools.clone())
    }

    async fn create_monitor(&self, monitor: &MonitorSpec) -> Result<(), ModelError> {
        self.commit(&[Change::CreateMonitor(monitor.clone())]).await
    }

    async fn delete_monitor(&self, name: &str, pool: &str) -> Result<(), ModelError> {
        self.commit(&[Change::DeleteMonitor {
            name: name.to_string(),
            pool: pool.to_string(),
        }])
        .await
    }

    async fn create_pool(&self, name: &str, monitor: Option<&str>) -> Result<(), ModelError> {
        self.commit(&[Change::CreatePool {
            name: name.to_string(),
            monitor: monitor.map(str::to_string),
        }])
        .await
    }

    async fn delete_pool(&self, name: &str) -> Result<(), ModelError> {
        self.commit(&[Change::DeletePool {
            name: name.to_string(),
        }])
        .await
    }

    async fn create_route(&self, pool: &str, route: &str, path: &str) -> Result<(), ModelError> {
        self.commit(&[Change::CreateRoute {
            pool: pool.to_string(),
            route: route.to_string(),
            path: path.to_string(),
        }])
        .await
    }

    async fn delete_route(&self, pool: &str, route: &str) -> Result<(), ModelError> {
        self.commit(&[Change::DeleteRoute {
            pool: pool.to_string(),
            route: route.to_string(),
        }])
        .await
    }

    async fn add_pool_member(&self, pool: &str, member: &Member) -> Result<(), ModelError> {
        self.commit(&[Change::AddMember {
            pool: pool.to_string(),
            member: member.clone(),
        }])
        .await
    }

    async fn delete_pool_member(&self, pool: &str, member: &Member) -> Result<(), ModelError> {
        self.commit(&[Change::DeleteMember {
            pool: pool.to_string(),
            member: member.clone(),
        }])
        .await
    }

    async fn add_pool_alias(&self, pool: &str, alias: &str) -> Result<(), ModelError> {
        self.commit(&[Change::AddAlias {
            pool: pool.to_string(),
            alias: alias.to_string(),
        }])
        .await
    }

    async fn delete_pool_alias(&self, pool: &str, alias: &str) -> Result<(), ModelError> {
        self.commit(&[Change::DeleteAlias {
            pool: pool.to_string(),
            alias: alias.to_string(),
        }])
        .await
    }

    async fn add_ssl(
        &self,
        pool: &str,
        alias: &str,
        cert: &str,
        key: &PrivateKey,
    ) -> Result<(), ModelError> {
        self.commit(&[Change::AddSsl {
            pool: pool.to_string(),
            alias: alias.to_string(),
            cert: cert.to_string(),
            key: key.clone(),
        }])
        .await
    }

    async fn remove_ssl(&self, pool: &str, alias: &str) -> Result<(), ModelError> {
        self.commit(&[Change::RemoveSsl {
            pool: pool.to_string(),
            alias: alias.to_string(),
        }])
        .await
    }

    async fn apply_batch(&self, changes: &[Change]) -> Result<(), ModelError> {
        self.commit(changes).await
    }
}
