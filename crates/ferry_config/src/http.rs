use serde::Deserialize;

// =======================================================
// HTTP CONFIG + DEFAULTS
// =======================================================
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Address the front-facing HTTP listener binds to.
    pub listen_addr: String,

    // Timeouts (seconds)
    pub client_read_timeout_secs: u64,
    pub client_write_timeout_secs: u64,
    pub idle_timeout_secs: u64,

    // Limits (bytes)
    pub max_request_headers_bytes: u64,
    pub max_request_body_bytes: u64,
    pub max_upstream_response_headers_bytes: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            client_read_timeout_secs: 5,
            client_write_timeout_secs: 5,
            idle_timeout_secs: 60,
            max_request_headers_bytes: 64 * 1024,
            max_request_body_bytes: 0,
            max_upstream_response_headers_bytes: 64 * 1024,
        }
    }
}

impl HttpConfig {
    pub(crate) fn apply_defaults_from(&mut self, defaults: &HttpConfig) {
        if self.listen_addr.is_empty() {
            self.listen_addr = defaults.listen_addr.clone();
        }
        if self.client_read_timeout_secs == 0 {
            self.client_read_timeout_secs = defaults.client_read_timeout_secs;
        }
        if self.client_write_timeout_secs == 0 {
            self.client_write_timeout_secs = defaults.client_write_timeout_secs;
        }
        if self.idle_timeout_secs == 0 {
            self.idle_timeout_secs = defaults.idle_timeout_secs;
        }
        if self.max_request_headers_bytes == 0 {
            self.max_request_headers_bytes = defaults.max_request_headers_bytes;
        }
        if self.max_upstream_response_headers_bytes == 0 {
            self.max_upstream_response_headers_bytes =
                defaults.max_upstream_response_headers_bytes;
        }
    }
}
