use serde::Deserialize;

// =======================================================
// HEALTH CHECK CONFIG + DEFAULTS
// =======================================================
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Path probed on the upstream, e.g. "/up".
    pub path: String,
    pub interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            path: "/up".into(),
            interval_secs: 3,
            timeout_secs: 5,
        }
    }
}

impl HealthCheckConfig {
    pub(crate) fn apply_defaults_from(&mut self, defaults: &HealthCheckConfig) {
        if self.path.is_empty() {
            self.path = defaults.path.clone();
        }
        if self.interval_secs == 0 {
            self.interval_secs = defaults.interval_secs;
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = defaults.timeout_secs;
        }
    }
}

// =======================================================
// PROXY CONFIG + DEFAULTS
// =======================================================
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// How long Add()/Deploy() wait for a new upstream to become healthy.
    pub add_timeout_secs: u64,
    /// Deadline for draining a single removed service.
    pub drain_timeout_secs: u64,
    /// Shared deadline used when draining everything at process shutdown.
    pub shutdown_drain_secs: u64,
    pub health: HealthCheckConfig,
    /// Path to the JSON file used to persist the upstream set across restarts.
    pub state_file: String,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            add_timeout_secs: 30,
            drain_timeout_secs: 30,
            shutdown_drain_secs: 10,
            health: HealthCheckConfig::default(),
            state_file: "ferryd-state/services.json".into(),
        }
    }
}

impl ProxyConfig {
    pub(crate) fn apply_defaults_from(&mut self, defaults: &ProxyConfig) {
        if self.add_timeout_secs == 0 {
            self.add_timeout_secs = defaults.add_timeout_secs;
        }
        if self.drain_timeout_secs == 0 {
            self.drain_timeout_secs = defaults.drain_timeout_secs;
        }
        if self.shutdown_drain_secs == 0 {
            self.shutdown_drain_secs = defaults.shutdown_drain_secs;
        }
        if self.state_file.is_empty() {
            self.state_file = defaults.state_file.clone();
        }
        self.health.apply_defaults_from(&defaults.health);
    }
}
