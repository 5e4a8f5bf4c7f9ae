//! Wire format for the control socket: one JSON object per line in each
//! direction.

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    List,
    Add {
        hosts: Vec<String>,
        #[serde(default)]
        wait_for_healthy: bool,
    },
    Remove {
        hosts: Vec<String>,
    },
    Deploy {
        hosts: Vec<String>,
    },
}

#[derive(Debug, Serialize)]
pub struct ServiceStatus {
    pub host: String,
    pub state: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ControlResult {
    Services(Vec<ServiceStatus>),
    None,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ControlResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn ok_empty() -> Self {
        Self {
            ok: true,
            result: None,
            error: None,
        }
    }

    pub fn ok_with(result: ControlResult) -> Self {
        Self {
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(message.into()),
        }
    }
}
