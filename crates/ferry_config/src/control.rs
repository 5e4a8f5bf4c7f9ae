use serde::Deserialize;

// =======================================================
// CONTROL SOCKET CONFIG + DEFAULTS
// =======================================================
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Filesystem path of the Unix domain socket the control plane listens on.
    pub socket_path: String,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: "/tmp/ferryd.sock".into(),
        }
    }
}

impl ControlConfig {
    pub(crate) fn apply_defaults_from(&mut self, defaults: &ControlConfig) {
        if self.socket_path.is_empty() {
            self.socket_path = defaults.socket_path.clone();
        }
    }
}
