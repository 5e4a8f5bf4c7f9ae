use std::path::Path;

use config::{Config, File, FileFormat};
use serde::Deserialize;

use crate::{ControlConfig, GlobalConfig, HttpConfig, ProxyConfig};

/// Root configuration for a ferryd process.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FerryConfig {
    pub global: GlobalConfig,
    pub http: HttpConfig,
    pub proxy: ProxyConfig,
    pub control: ControlConfig,
}

impl Default for FerryConfig {
    fn default() -> Self {
        Self {
            global: GlobalConfig::default(),
            http: HttpConfig::default(),
            proxy: ProxyConfig::default(),
            control: ControlConfig::default(),
        }
    }
}

impl FerryConfig {
    /// Load configuration from a TOML file, layered under `FERRY_`-prefixed
    /// environment variables. A missing file is not an error; defaults apply.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let mut builder = Config::builder();

        if path.exists() {
            builder = builder.add_source(File::new(&path.to_string_lossy(), FileFormat::Toml));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("FERRY")
                .separator("__")
                .try_parsing(true),
        );

        let raw = builder.build()?;
        let mut cfg: FerryConfig = raw.try_deserialize().unwrap_or_default();
        cfg.apply_defaults();
        Ok(cfg)
    }

    fn apply_defaults(&mut self) {
        let defaults = FerryConfig::default();
        self.global.apply_defaults_from(&defaults.global);
        self.http.apply_defaults_from(&defaults.http);
        self.proxy.apply_defaults_from(&defaults.proxy);
        self.control.apply_defaults_from(&defaults.control);
    }
}
