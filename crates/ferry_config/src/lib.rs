mod control;
mod ferry;
mod global;
mod http;
mod proxy;
mod validation;

pub use control::ControlConfig;
pub use ferry::FerryConfig;
pub use global::GlobalConfig;
pub use http::HttpConfig;
pub use proxy::{HealthCheckConfig, ProxyConfig};
pub use validation::{validate, ConfigReport};
