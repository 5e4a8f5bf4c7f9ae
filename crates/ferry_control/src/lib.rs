mod handler;
mod protocol;
mod socket;

pub use handler::dispatch;
pub use protocol::{ControlRequest, ControlResponse, ControlResult, ServiceStatus};
pub use socket::{accept_loop, bind_listener};
