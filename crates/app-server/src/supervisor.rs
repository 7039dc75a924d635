//! Connection pool: one [`AppServerClient`] per workspace root.
//!
//! The supervisor enforces the pool policies: a cap on concurrently-open
//! clients (overflow evicts the least-recently-used idle client), an idle
//! TTL sweep, and lazy creation. The client registry is explicit and
//! iterable so tests and diagnostics can walk it deterministically.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use car_domain::config::{AppServerConfig, SupervisorConfig};
use car_domain::error::{Error, Result};

use crate::client::AppServerClient;

/// Builds the environment for a spawned agent, given the workspace root.
/// The launcher treats the result as opaque; callers overlay things like a
/// workspace-scoped home directory here.
pub type EnvBuilder = dyn Fn(&Path) -> HashMap<String, String> + Send + Sync;

struct SupervisorInner {
    command: Vec<String>,
    client_config: AppServerConfig,
    config: SupervisorConfig,
    env_builder: Option<Box<EnvBuilder>>,
    clients: Mutex<HashMap<PathBuf, AppServerClient>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct WorkspaceSupervisor {
    inner: Arc<SupervisorInner>,
}

impl WorkspaceSupervisor {
    pub fn new(
        command: Vec<String>,
        client_config: AppServerConfig,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                command,
                client_config,
                config,
                env_builder: None,
                clients: Mutex::new(HashMap::new()),
                sweeper: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn with_env_builder(
        command: Vec<String>,
        client_config: AppServerConfig,
        config: SupervisorConfig,
        env_builder: Box<EnvBuilder>,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                command,
                client_config,
                config,
                env_builder: Some(env_builder),
                clients: Mutex::new(HashMap::new()),
                sweeper: Mutex::new(None),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The client for a workspace root, created lazily and started. The
    /// caller shares the client with every other user of that workspace.
    pub async fn get_client(&self, workspace_root: &Path) -> Result<AppServerClient> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(Error::Disconnected("supervisor closed".into()));
        }
        let (client, evicted) = {
            let mut clients = self.inner.clients.lock();
            if let Some(existing) = clients.get(workspace_root) {
                if !existing.is_closed() {
                    existing.touch();
                    (existing.clone(), None)
                } else {
                    let fresh = self.build_client(workspace_root);
                    clients.insert(workspace_root.to_path_buf(), fresh.clone());
                    (fresh, None)
                }
            } else {
                let evicted = if clients.len() >= self.inner.config.max_clients {
                    evict_lru(&mut clients)
                } else {
                    None
                };
                let fresh = self.build_client(workspace_root);
                clients.insert(workspace_root.to_path_buf(), fresh.clone());
                (fresh, evicted)
            }
        };
        if let Some((path, old)) = evicted {
            tracing::info!(workspace = %path.display(), "app_server.pool.evicted");
            old.close().await;
        }
        client.touch();
        client.start().await?;
        Ok(client)
    }

    fn build_client(&self, workspace_root: &Path) -> AppServerClient {
        let env = self
            .inner
            .env_builder
            .as_ref()
            .map(|builder| builder(workspace_root))
            .unwrap_or_default();
        AppServerClient::new(
            self.inner.command.clone(),
            Some(workspace_root.to_path_buf()),
            env,
            self.inner.client_config.clone(),
        )
    }

    /// Close clients idle beyond the TTL. Returns how many were closed.
    pub async fn sweep_idle(&self) -> usize {
        let ttl = self.inner.config.idle_ttl;
        let expired: Vec<(PathBuf, AppServerClient)> = {
            let mut clients = self.inner.clients.lock();
            let paths: Vec<PathBuf> = clients
                .iter()
                .filter(|(_, client)| client.idle_for() > ttl || client.is_closed())
                .map(|(path, _)| path.clone())
                .collect();
            paths
                .into_iter()
                .filter_map(|path| clients.remove(&path).map(|client| (path, client)))
                .collect()
        };
        let count = expired.len();
        for (path, client) in expired {
            tracing::info!(workspace = %path.display(), "app_server.pool.idle_closed");
            client.close().await;
        }
        count
    }

    /// Spawn the periodic idle sweep. Idempotent.
    pub fn start_sweeper(&self) {
        let mut sweeper = self.inner.sweeper.lock();
        if sweeper
            .as_ref()
            .map(|task| !task.is_finished())
            .unwrap_or(false)
        {
            return;
        }
        let supervisor = self.clone();
        let interval = self.inner.config.sweep_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if supervisor.inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                supervisor.sweep_idle().await;
            }
        }));
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.lock().len()
    }

    /// Snapshot of the registry for diagnostics and tests.
    pub fn clients(&self) -> Vec<(PathBuf, AppServerClient)> {
        self.inner
            .clients
            .lock()
            .iter()
            .map(|(path, client)| (path.clone(), client.clone()))
            .collect()
    }

    pub async fn close_all(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        if let Some(task) = self.inner.sweeper.lock().take() {
            task.abort();
        }
        let clients: Vec<AppServerClient> = {
            let mut clients = self.inner.clients.lock();
            clients.drain().map(|(_, client)| client).collect()
        };
        for client in clients {
            client.close().await;
        }
    }
}

/// Pick the least-recently-used entry for eviction.
fn evict_lru(
    clients: &mut HashMap<PathBuf, AppServerClient>,
) -> Option<(PathBuf, AppServerClient)> {
    let path = clients
        .iter()
        .max_by_key(|(_, client)| client.idle_for())
        .map(|(path, _)| path.clone())?;
    clients.remove(&path).map(|client| (path, client))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn supervisor(max_clients: usize) -> WorkspaceSupervisor {
        let client_config = AppServerConfig {
            auto_restart: false,
            ..Default::default()
        };
        let config = SupervisorConfig {
            max_clients,
            idle_ttl: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(20),
        };
        // `cat` blocks on stdin and echoes nothing parseable, which is
        // enough for pool-shape tests that never initialize.
        WorkspaceSupervisor::new(vec!["cat".into()], client_config, config)
    }

    fn make_client(supervisor: &WorkspaceSupervisor, dir: &Path) -> AppServerClient {
        // Insert without spawning: pool bookkeeping only.
        let client = supervisor.build_client(dir);
        supervisor
            .inner
            .clients
            .lock()
            .insert(dir.to_path_buf(), client.clone());
        client
    }

    #[tokio::test]
    async fn one_client_per_workspace() {
        let supervisor = supervisor(4);
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        make_client(&supervisor, a.path());
        make_client(&supervisor, b.path());
        assert_eq!(supervisor.client_count(), 2);
        // Same path maps to the same entry.
        make_client(&supervisor, a.path());
        assert_eq!(supervisor.client_count(), 2);
    }

    #[tokio::test]
    async fn overflow_evicts_least_recently_used() {
        let supervisor = supervisor(2);
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let client_a = make_client(&supervisor, a.path());
        let _client_b = make_client(&supervisor, b.path());
        // Make b the stale one.
        client_a.touch();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let evicted = {
            let mut clients = supervisor.inner.clients.lock();
            evict_lru(&mut clients)
        };
        let (path, _client) = evicted.unwrap();
        assert_eq!(path, b.path());
        assert_eq!(supervisor.client_count(), 1);
    }

    #[tokio::test]
    async fn idle_sweep_closes_expired_clients() {
        let supervisor = supervisor(4);
        let a = tempfile::tempdir().unwrap();
        let client = make_client(&supervisor, a.path());
        tokio::time::sleep(Duration::from_millis(80)).await;
        let closed = supervisor.sweep_idle().await;
        assert_eq!(closed, 1);
        assert_eq!(supervisor.client_count(), 0);
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn fresh_clients_survive_sweep() {
        let supervisor = supervisor(4);
        let a = tempfile::tempdir().unwrap();
        let client = make_client(&supervisor, a.path());
        client.touch();
        let closed = supervisor.sweep_idle().await;
        assert_eq!(closed, 0);
        assert_eq!(supervisor.client_count(), 1);
    }

    #[tokio::test]
    async fn close_all_rejects_future_gets() {
        let supervisor = supervisor(4);
        let a = tempfile::tempdir().unwrap();
        make_client(&supervisor, a.path());
        supervisor.close_all().await;
        assert_eq!(supervisor.client_count(), 0);
        let err = match supervisor.get_client(a.path()).await {
            Ok(_) => panic!("expected error"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::Disconnected(_)));
    }
}
