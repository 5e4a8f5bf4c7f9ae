use std::sync::Arc;

use ferry_core::{Error, Host, LoadBalancer};

use crate::protocol::{ControlRequest, ControlResponse, ControlResult, ServiceStatus};

fn parse_hosts(raw: &[String]) -> Result<Vec<Host>, ControlResponse> {
    raw.iter()
        .map(|h| Host::parse(h).map_err(|e| ControlResponse::err(e.to_string())))
        .collect()
}

fn error_response(err: Error) -> ControlResponse {
    ControlResponse::err(err.to_string())
}

/// Executes one control request against the shared `LoadBalancer`.
pub async fn dispatch(lb: &Arc<LoadBalancer>, request: ControlRequest) -> ControlResponse {
    match request {
        ControlRequest::List => {
            let services = lb
                .get_services()
                .into_iter()
                .map(|(host, state)| ServiceStatus {
                    host: host.to_string(),
                    state: state.as_str().to_string(),
                })
                .collect();
            ControlResponse::ok_with(ControlResult::Services(services))
        }
        ControlRequest::Add {
            hosts,
            wait_for_healthy,
        } => {
            let hosts = match parse_hosts(&hosts) {
                Ok(h) => h,
                Err(resp) => return resp,
            };
            match lb.add(&hosts, wait_for_healthy).await {
                Ok(()) => ControlResponse::ok_empty(),
                Err(err) => error_response(err),
            }
        }
        ControlRequest::Remove { hosts } => {
            let hosts = match parse_hosts(&hosts) {
                Ok(h) => h,
                Err(resp) => return resp,
            };
            match lb.remove(&hosts).await {
                Ok(()) => ControlResponse::ok_empty(),
                Err(err) => error_response(err),
            }
        }
        ControlRequest::Deploy { hosts } => {
            let hosts = match parse_hosts(&hosts) {
                Ok(h) => h,
                Err(resp) => return resp,
            };
            match lb.deploy(&hosts).await {
                Ok(()) => ControlResponse::ok_empty(),
                Err(err) => error_response(err),
            }
        }
    }
}
