//! The top-level router: owns the upstream set and picks a healthy `Service`
//! for each inbound request.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use ferry_config::ProxyConfig;
use ferry_http::responses::send_503;
use tracing::{info, instrument, warn};

use crate::error::{Error, Result};
use crate::host::Host;
use crate::service::{ProxyRequest, Service, ServiceObserver, ServiceState};
use crate::state_file;

/// Recomputes and persists `LoadBalancer::active` whenever a `Service`
/// transitions state.
struct StateChangeSink {
    inner: std::sync::Weak<RwLock<LbState>>,
}

impl ServiceObserver for StateChangeSink {
    fn state_changed(&self, _host: &Host, _state: ServiceState) {
        if let Some(state) = self.inner.upgrade() {
            let mut guard = state.write().unwrap();
            guard.recompute_active();
        }
    }
}

struct LbState {
    services: HashMap<Host, Arc<Service>>,
    active: Vec<Host>,
}

impl LbState {
    fn recompute_active(&mut self) {
        let mut active: Vec<Host> = self
            .services
            .iter()
            .filter(|(_, svc)| svc.state() == ServiceState::Healthy)
            .map(|(host, _)| host.clone())
            .collect();
        active.sort();
        self.active = active;
    }
}

/// Owns every upstream `Service` and round-robins requests across the
/// currently healthy subset.
pub struct LoadBalancer {
    state: Arc<RwLock<LbState>>,
    rr_index: AtomicUsize,
    config: ProxyConfig,
    state_file_path: PathBuf,
}

impl LoadBalancer {
    pub fn new(config: ProxyConfig) -> Arc<Self> {
        let state_file_path = PathBuf::from(&config.state_file);
        Arc::new(Self {
            state: Arc::new(RwLock::new(LbState {
                services: HashMap::new(),
                active: Vec::new(),
            })),
            rr_index: AtomicUsize::new(0),
            config,
            state_file_path,
        })
    }

    /// Restores the upstream set from the state file via `add`, starting
    /// health checks for every restored host without waiting for them to
    /// become healthy.
    #[instrument(skip(self))]
    pub async fn restore_from_state_file(self: &Arc<Self>) -> Result<()> {
        let hosts = state_file::load(&self.state_file_path)?;
        if hosts.is_empty() {
            return Ok(());
        }
        info!(target: "ferry::load_balancer", count = hosts.len(), "restoring upstreams from state file");
        self.add(&hosts, false).await
    }

    /// Adds `hosts` to the upstream set: hosts already present are skipped
    /// rather than aborting the whole call. Returns `ServiceAlreadyExists`
    /// only when every requested host was already present. If
    /// `wait_for_healthy` is set, blocks until every newly added host
    /// becomes healthy or `add_timeout_secs` elapses, returning an error
    /// naming the first host that didn't make it.
    #[instrument(skip(self, hosts))]
    pub async fn add(self: &Arc<Self>, hosts: &[Host], wait_for_healthy: bool) -> Result<()> {
        let to_insert: Vec<Host> = {
            let guard = self.state.read().unwrap();
            hosts
                .iter()
                .filter(|host| !guard.services.contains_key(*host))
                .cloned()
                .collect()
        };

        if to_insert.is_empty() && !hosts.is_empty() {
            return Err(Error::ServiceAlreadyExists);
        }

        let mut added = Vec::with_capacity(to_insert.len());
        for host in to_insert {
            added.push(self.insert_service(host));
        }

        if wait_for_healthy {
            let wait = Duration::from_secs(self.config.add_timeout_secs.max(1));
            for svc in &added {
                if !svc.wait_until_healthy(wait).await {
                    return Err(Error::ServiceFailedToBecomeHealthy(svc.host().to_string()));
                }
            }
        }

        Ok(())
    }

    /// Removes `hosts`, draining each one with the configured drain timeout
    /// before it's forgotten. Validates that every host is present before
    /// removing any of them, so a single unknown host can't leave an
    /// already-removed sibling's `HealthCheck` orphaned and `active` stale.
    #[instrument(skip(self, hosts))]
    pub async fn remove(self: &Arc<Self>, hosts: &[Host]) -> Result<()> {
        let removed: Vec<Arc<Service>> = {
            let mut guard = self.state.write().unwrap();
            for host in hosts {
                if !guard.services.contains_key(host) {
                    return Err(Error::ServiceNotFound);
                }
            }

            let removed: Vec<Arc<Service>> = hosts
                .iter()
                .map(|host| {
                    guard
                        .services
                        .remove(host)
                        .expect("presence already checked above")
                })
                .collect();
            guard.recompute_active();
            self.persist_locked(&guard)?;
            removed
        };

        let drain_timeout = Duration::from_secs(self.config.drain_timeout_secs.max(1));
        for svc in removed {
            svc.drain(drain_timeout).await;
        }

        Ok(())
    }

    /// Atomically replaces the full upstream set: adds `hosts` (waiting for
    /// them to become healthy) before draining and removing whatever was
    /// previously registered.
    #[instrument(skip(self, hosts))]
    pub async fn deploy(self: &Arc<Self>, hosts: &[Host]) -> Result<()> {
        let previous: Vec<Host> = {
            let guard = self.state.read().unwrap();
            guard.services.keys().cloned().collect()
        };

        let mut added = Vec::with_capacity(hosts.len());
        for host in hosts {
            if self.state.read().unwrap().services.contains_key(host) {
                continue;
            }
            added.push(self.insert_service(host.clone()));
        }

        let wait = Duration::from_secs(self.config.add_timeout_secs.max(1));
        for svc in &added {
            if !svc.wait_until_healthy(wait).await {
                warn!(
                    target: "ferry::load_balancer",
                    host = %svc.host(),
                    "deploy target failed to become healthy; rolling back this host"
                );
                self.remove_one(svc.host()).await;
                return Err(Error::ServiceFailedToBecomeHealthy(svc.host().to_string()));
            }
        }

        let stale: Vec<Host> = previous
            .into_iter()
            .filter(|h| !hosts.contains(h))
            .collect();
        if !stale.is_empty() {
            self.remove(&stale).await?;
        }

        Ok(())
    }

    /// Drains every registered service against a single shared deadline, for
    /// use at process shutdown. Unlike `remove`, this leaves the upstream set
    /// (and state file) untouched, since the process is exiting anyway.
    #[instrument(skip(self))]
    pub async fn drain_all(&self, deadline: Duration) {
        let services: Vec<Arc<Service>> = {
            let guard = self.state.read().unwrap();
            guard.services.values().cloned().collect()
        };

        let mut set = tokio::task::JoinSet::new();
        for svc in services {
            set.spawn(async move { svc.drain(deadline).await });
        }
        while set.join_next().await.is_some() {}
    }

    /// Snapshot of every registered host and its current lifecycle state.
    pub fn get_services(&self) -> Vec<(Host, ServiceState)> {
        let guard = self.state.read().unwrap();
        guard
            .services
            .iter()
            .map(|(host, svc)| (host.clone(), svc.state()))
            .collect()
    }

    /// Serves one proxied request by picking the next healthy upstream in
    /// round-robin order. Responds 503 directly if no upstream is healthy.
    ///
    /// Returns `true` iff the connection is safe to keep alive; see
    /// `Service::serve_http`.
    pub async fn serve_http<C>(&self, req: ProxyRequest<'_>, client_stream: &mut C) -> anyhow::Result<bool>
    where
        C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let svc = match self.pick_service() {
            Some(svc) => svc,
            None => {
                send_503(client_stream).await?;
                return Ok(false);
            }
        };
        svc.serve_http(req, client_stream).await
    }

    fn pick_service(&self) -> Option<Arc<Service>> {
        let guard = self.state.read().unwrap();
        if guard.active.is_empty() {
            return None;
        }
        let idx = self.rr_index.fetch_add(1, Ordering::Relaxed) % guard.active.len();
        let host = &guard.active[idx];
        guard.services.get(host).cloned()
    }

    fn insert_service(self: &Arc<Self>, host: Host) -> Arc<Service> {
        let observer = Arc::new(StateChangeSink {
            inner: Arc::downgrade(&self.state),
        });
        let svc = Service::new(host.clone(), self.config.health.clone(), observer);

        {
            let mut guard = self.state.write().unwrap();
            guard.services.insert(host, svc.clone());
            guard.recompute_active();
            self.persist_locked(&guard).ok();
        }

        svc.begin_health_checks();
        svc
    }

    async fn remove_one(self: &Arc<Self>, host: &Host) {
        let svc = {
            let mut guard = self.state.write().unwrap();
            let svc = guard.services.remove(host);
            guard.recompute_active();
            self.persist_locked(&guard).ok();
            svc
        };
        if let Some(svc) = svc {
            let drain_timeout = Duration::from_secs(self.config.drain_timeout_secs.max(1));
            svc.drain(drain_timeout).await;
        }
    }

    /// Persists the current host set while `state`'s write lock is already
    /// held, so the on-disk file never observes an interleaving of two
    /// concurrent mutations racing each other through an unlocked write.
    fn persist_locked(&self, state: &LbState) -> Result<()> {
        let mut hosts: Vec<Host> = state.services.keys().cloned().collect();
        hosts.sort();
        state_file::persist(&self.state_file_path, &hosts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ProxyConfig {
        let mut cfg = ProxyConfig::default();
        cfg.state_file = std::env::temp_dir()
            .join(format!("ferry-lb-test-{}-{}.json", std::process::id(), line!()))
            .to_string_lossy()
            .to_string();
        cfg
    }

    #[tokio::test]
    async fn add_then_remove_round_trips_service_set() {
        let lb = LoadBalancer::new(test_config());
        let host = Host::parse("127.0.0.1:1").unwrap();
        lb.add(&[host.clone()], false).await.unwrap();
        assert_eq!(lb.get_services().len(), 1);

        lb.remove(&[host]).await.unwrap();
        assert_eq!(lb.get_services().len(), 0);
    }

    #[tokio::test]
    async fn add_duplicate_host_fails() {
        let lb = LoadBalancer::new(test_config());
        let host = Host::parse("127.0.0.1:1").unwrap();
        lb.add(&[host.clone()], false).await.unwrap();
        let err = lb.add(&[host], false).await.unwrap_err();
        assert!(matches!(err, Error::ServiceAlreadyExists));
    }

    #[tokio::test]
    async fn remove_unknown_host_fails() {
        let lb = LoadBalancer::new(test_config());
        let host = Host::parse("127.0.0.1:1").unwrap();
        let err = lb.remove(&[host]).await.unwrap_err();
        assert!(matches!(err, Error::ServiceNotFound));
    }

    #[tokio::test]
    async fn add_with_one_existing_host_inserts_only_the_new_one() {
        let lb = LoadBalancer::new(test_config());
        let existing = Host::parse("127.0.0.1:1").unwrap();
        let fresh = Host::parse("127.0.0.1:2").unwrap();
        lb.add(&[existing.clone()], false).await.unwrap();

        lb.add(&[existing, fresh.clone()], false).await.unwrap();

        let hosts: Vec<Host> = lb.get_services().into_iter().map(|(h, _)| h).collect();
        assert_eq!(hosts.len(), 2);
        assert!(hosts.contains(&fresh));
    }

    #[tokio::test]
    async fn remove_with_one_unknown_host_leaves_the_known_one_in_place() {
        let lb = LoadBalancer::new(test_config());
        let known = Host::parse("127.0.0.1:1").unwrap();
        let unknown = Host::parse("127.0.0.1:2").unwrap();
        lb.add(&[known.clone()], false).await.unwrap();

        let err = lb.remove(&[known.clone(), unknown]).await.unwrap_err();
        assert!(matches!(err, Error::ServiceNotFound));
        assert_eq!(lb.get_services().len(), 1);
    }

    #[tokio::test]
    async fn add_with_wait_times_out_on_unreachable_host() {
        let mut config = test_config();
        config.add_timeout_secs = 0;
        let lb = LoadBalancer::new(config);
        let host = Host::parse("127.0.0.1:1").unwrap();
        let err = lb.add(&[host], true).await.unwrap_err();
        assert!(matches!(err, Error::ServiceFailedToBecomeHealthy(_)));
    }

    #[tokio::test]
    async fn pick_service_returns_none_with_no_healthy_upstreams() {
        let lb = LoadBalancer::new(test_config());
        let host = Host::parse("127.0.0.1:1").unwrap();
        lb.add(&[host], false).await.unwrap();
        assert!(lb.pick_service().is_none());
    }
}
