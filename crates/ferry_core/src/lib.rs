mod error;
mod headers;
mod health;
mod host;
mod load_balancer;
mod response;
mod service;
mod state_file;

pub use error::{Error, Result};
pub use health::HealthObserver;
pub use host::Host;
pub use load_balancer::LoadBalancer;
pub use service::{ProxyRequest, Service, ServiceObserver, ServiceState};
