//! aria2 JSON-RPC 2.0 messages.
//!
//! Outgoing requests carry a structured [`RequestId`] so that responses can be
//! correlated without comparing method names. Incoming frames are parsed once,
//! at the boundary, into a closed set of [`DaemonEvent`] variants.

use std::{collections::HashMap, fmt, path::Path, str::FromStr};

use serde::Serialize;
use serde_json::{json, Value};

const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestId {
    /// Batch submission (`system.multicall`) of the given batch number.
    Submit(u64),
    /// Resubmission of a failed job, identified by its local id.
    Retry(u64),
    /// Status query for a failed job, identified by its daemon gid.
    Status(String),
    Stat,
    Configure,
    Probe,
    Shutdown,
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Submit(batch) => write!(f, "submit:{batch}"),
            RequestId::Retry(local_id) => write!(f, "retry:{local_id}"),
            RequestId::Status(gid) => write!(f, "status:{gid}"),
            RequestId::Stat => f.write_str("stat"),
            RequestId::Configure => f.write_str("configure"),
            RequestId::Probe => f.write_str("probe"),
            RequestId::Shutdown => f.write_str("shutdown"),
        }
    }
}

impl FromStr for RequestId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.split_once(':') {
            Some(("submit", batch)) => RequestId::Submit(batch.parse().map_err(|_| ())?),
            Some(("retry", local_id)) => RequestId::Retry(local_id.parse().map_err(|_| ())?),
            Some(("status", gid)) => RequestId::Status(gid.to_string()),
            None if s == "stat" => RequestId::Stat,
            None if s == "configure" => RequestId::Configure,
            None if s == "probe" => RequestId::Probe,
            None if s == "shutdown" => RequestId::Shutdown,
            _ => return Err(()),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    jsonrpc: &'static str,
    id: String,
    method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MulticallElement {
    method_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

fn add_uri_params(uri: &str, out: &str, dir: &Path) -> Value {
    json!([[uri], { "out": out, "dir": dir.to_string_lossy() }])
}

impl MulticallElement {
    pub fn add_uri(uri: &str, out: &str, dir: &Path) -> Self {
        Self {
            method_name: "aria2.addUri".to_string(),
            params: Some(add_uri_params(uri, out, dir)),
        }
    }
}

impl RpcRequest {
    pub fn new(id: RequestId, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id: id.to_string(),
            method: method.to_string(),
            params,
        }
    }

    pub fn multicall(batch: u64, calls: Vec<MulticallElement>) -> Self {
        Self::new(
            RequestId::Submit(batch),
            "system.multicall",
            Some(json!([calls])),
        )
    }

    pub fn add_uri(local_id: u64, uri: &str, out: &str, dir: &Path) -> Self {
        Self::new(
            RequestId::Retry(local_id),
            "aria2.addUri",
            Some(add_uri_params(uri, out, dir)),
        )
    }

    pub fn tell_status(gid: &str) -> Self {
        Self::new(
            RequestId::Status(gid.to_string()),
            "aria2.tellStatus",
            Some(json!([gid, ["gid", "dir", "files"]])),
        )
    }

    pub fn global_stat() -> Self {
        Self::new(RequestId::Stat, "aria2.getGlobalStat", None)
    }

    pub fn change_global_option(options: &HashMap<String, String>) -> Self {
        Self::new(
            RequestId::Configure,
            "aria2.changeGlobalOption",
            Some(json!([options])),
        )
    }

    pub fn global_option() -> Self {
        Self::new(RequestId::Probe, "aria2.getGlobalOption", None)
    }

    pub fn shutdown() -> Self {
        Self::new(RequestId::Shutdown, "aria2.shutdown", None)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn to_json(&self) -> String {
        // serializing plain strings and json values cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Everything the daemon may send us.
#[derive(Debug, Clone, PartialEq)]
pub enum DaemonEvent {
    /// Reply to a batch submission, one entry per submitted URL in order.
    Ack {
        batch: u64,
        gids: Vec<Result<String, String>>,
    },
    /// Reply to the resubmission of a failed job.
    Resubmitted { local_id: u64, gid: String },
    /// Reply to a status query.
    Status {
        gid: String,
        uri: Option<String>,
        path: Option<String>,
        dir: Option<String>,
    },
    Complete { gid: String },
    Error { gid: String },
    /// Global download speed in bytes per second.
    StatUpdate { download_speed: u64 },
    ShutdownAck,
    /// The daemon answered one of our requests with a JSON-RPC error.
    RequestFailed {
        id: Option<RequestId>,
        code: i64,
        message: String,
    },
    Unknown(Value),
    /// A message of a known kind missing a required field.
    Malformed { reason: String },
}

fn malformed<S: Into<String>>(reason: S) -> DaemonEvent {
    DaemonEvent::Malformed {
        reason: reason.into(),
    }
}

fn notification_gid(value: &Value) -> Option<String> {
    value
        .get("params")?
        .as_array()?
        .last()?
        .get("gid")?
        .as_str()
        .map(str::to_string)
}

/// aria2 wraps every multicall result in a single-element array.
fn multicall_gid(value: &Value) -> Result<String, String> {
    match value {
        Value::String(gid) => Ok(gid.clone()),
        Value::Array(inner) => match inner.first() {
            Some(Value::String(gid)) => Ok(gid.clone()),
            _ => Err(format!("unexpected element {value}")),
        },
        Value::Object(fault) => Err(fault
            .get("message")
            .or_else(|| fault.get("faultString"))
            .and_then(Value::as_str)
            .unwrap_or("rejected by daemon")
            .to_string()),
        _ => Err(format!("unexpected element {value}")),
    }
}

fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => s.parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

impl DaemonEvent {
    pub fn parse(text: &str) -> Self {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => return malformed(format!("invalid json: {e}")),
        };

        if let Some(method) = value.get("method").and_then(Value::as_str) {
            let is_complete = method.ends_with(".onDownloadComplete");
            if !is_complete && !method.ends_with(".onDownloadError") {
                return DaemonEvent::Unknown(value);
            }
            return match notification_gid(&value) {
                Some(gid) if is_complete => DaemonEvent::Complete { gid },
                Some(gid) => DaemonEvent::Error { gid },
                None => malformed(format!("{method} without gid")),
            };
        }

        let id = value
            .get("id")
            .and_then(Value::as_str)
            .and_then(|id| id.parse::<RequestId>().ok());

        if let Some(error) = value.get("error") {
            return DaemonEvent::RequestFailed {
                id,
                code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
            };
        }

        let Some(id) = id else {
            return DaemonEvent::Unknown(value);
        };
        let Some(result) = value.get("result") else {
            return malformed(format!("response to {id} without result"));
        };

        match id {
            RequestId::Submit(batch) => match result.as_array() {
                Some(items) => DaemonEvent::Ack {
                    batch,
                    gids: items.iter().map(multicall_gid).collect(),
                },
                None => malformed("batch submission result is not an array"),
            },
            RequestId::Retry(local_id) => match result.as_str() {
                Some(gid) => DaemonEvent::Resubmitted {
                    local_id,
                    gid: gid.to_string(),
                },
                None => malformed("resubmission result is not a gid"),
            },
            RequestId::Status(gid) => {
                let file = result.get("files").and_then(|f| f.get(0));
                DaemonEvent::Status {
                    gid,
                    uri: file
                        .and_then(|f| f.get("uris"))
                        .and_then(|u| u.get(0))
                        .and_then(|u| u.get("uri"))
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    path: file
                        .and_then(|f| f.get("path"))
                        .and_then(Value::as_str)
                        .filter(|p| !p.is_empty())
                        .map(str::to_string),
                    dir: result
                        .get("dir")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }
            }
            RequestId::Stat => match result.get("downloadSpeed").and_then(as_u64) {
                Some(download_speed) => DaemonEvent::StatUpdate { download_speed },
                None => malformed("global stat without downloadSpeed"),
            },
            RequestId::Shutdown if result.as_str() == Some("OK") => DaemonEvent::ShutdownAck,
            _ => DaemonEvent::Unknown(value),
        }
    }
}
