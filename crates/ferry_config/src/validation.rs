use std::path::Path;

use crate::FerryConfig;

/// Validation output for a loaded ferryd configuration.
#[derive(Debug, Default)]
pub struct ConfigReport {
    warnings: Vec<String>,
    errors: Vec<String>,
}

impl ConfigReport {
    /// Returns true when no errors were found.
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns true when at least one error was found.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Returns the collected warning messages.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// Returns the collected error messages.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Render warnings and errors into a readable, multi-line string.
    pub fn format(&self) -> String {
        let mut out = String::new();
        if !self.errors.is_empty() {
            out.push_str("Errors:\n");
            for err in &self.errors {
                out.push_str("  - ");
                out.push_str(err);
                out.push('\n');
            }
        }
        if !self.warnings.is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str("Warnings:\n");
            for warn in &self.warnings {
                out.push_str("  - ");
                out.push_str(warn);
                out.push('\n');
            }
        }
        out
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }
}

/// Validate a ferryd configuration and return a report of issues.
pub fn validate(cfg: &FerryConfig) -> ConfigReport {
    let mut report = ConfigReport::default();

    validate_http(cfg, &mut report);
    validate_proxy(cfg, &mut report);
    validate_control(cfg, &mut report);

    report
}

fn validate_http(cfg: &FerryConfig, report: &mut ConfigReport) {
    if cfg.http.listen_addr.trim().is_empty() {
        report.error("http.listen_addr must not be empty");
    } else if cfg.http.listen_addr.parse::<std::net::SocketAddr>().is_err() {
        report.error(format!(
            "http.listen_addr '{}' is not a valid socket address",
            cfg.http.listen_addr
        ));
    }
}

fn validate_proxy(cfg: &FerryConfig, report: &mut ConfigReport) {
    if cfg.proxy.state_file.trim().is_empty() {
        report.error("proxy.state_file must not be empty");
    } else if let Some(parent) = Path::new(&cfg.proxy.state_file).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            report.warn(format!(
                "proxy.state_file parent directory '{}' does not exist; it will be created at runtime",
                parent.display()
            ));
        }
    }

    if cfg.proxy.health.path.trim().is_empty() || !cfg.proxy.health.path.starts_with('/') {
        report.error(format!(
            "proxy.health.path '{}' must be a non-empty path starting with '/'",
            cfg.proxy.health.path
        ));
    }

    if cfg.proxy.health.timeout_secs > cfg.proxy.health.interval_secs {
        report.warn(
            "proxy.health.timeout_secs is greater than proxy.health.interval_secs; probes may overlap",
        );
    }
}

fn validate_control(cfg: &FerryConfig, report: &mut ConfigReport) {
    if cfg.control.socket_path.trim().is_empty() {
        report.error("control.socket_path must not be empty");
    }
}

#[cfg(test)]
mod tests {
    use super::validate;
    use crate::FerryConfig;

    #[test]
    fn default_config_has_no_errors() {
        let cfg = FerryConfig::default();
        let report = validate(&cfg);
        assert!(report.is_ok(), "{}", report.format());
    }

    #[test]
    fn empty_listen_addr_is_an_error() {
        let mut cfg = FerryConfig::default();
        cfg.http.listen_addr = String::new();
        let report = validate(&cfg);
        assert!(report.has_errors());
    }

    #[test]
    fn invalid_health_path_is_an_error() {
        let mut cfg = FerryConfig::default();
        cfg.proxy.health.path = "up".into();
        let report = validate(&cfg);
        assert!(report.has_errors());
    }
}
