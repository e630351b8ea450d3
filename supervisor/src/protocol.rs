//! JSON-RPC messages exchanged with the worker, and the typed method markers
//! consumers use to address it.

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC "method not found".
pub const METHOD_NOT_FOUND: i64 = -32601;

/// Error code the worker answers with while it is mid-transition. A request
/// that receives it should simply be sent again.
pub const DEFAULT_BUSY_ERROR_CODE: i64 = -32097;

/// A request the worker answers.
///
/// Implemented on uninhabited marker types, the way `lsp-types` does it:
///
/// ```
/// use tether_supervisor::protocol::RequestType;
///
/// enum ProjectGraph {}
///
/// impl RequestType for ProjectGraph {
///     const METHOD: &'static str = "workspace/projectGraph";
///     type Params = ();
///     type Result = serde_json::Value;
/// }
/// ```
pub trait RequestType {
    const METHOD: &'static str;
    type Params: Serialize;
    type Result: DeserializeOwned;
}

/// A fire-and-forget message, in either direction.
pub trait NotificationType {
    const METHOD: &'static str;
    type Params: Serialize + DeserializeOwned;
}

/// Ask the worker to stop the background daemon it talks to.
pub enum StopDaemon {}

impl RequestType for StopDaemon {
    const METHOD: &'static str = "daemon/stop";
    type Params = ();
    type Result = Value;
}

/// Tell the worker its workspace root moved. Params: the new path.
pub enum ChangeWorkspace {}

impl NotificationType for ChangeWorkspace {
    const METHOD: &'static str = "workspace/change";
    type Params = String;
}

/// Sent to the worker to request a refresh; the worker sends the same method
/// back once the refresh is complete.
pub enum WorkspaceRefresh {}

impl NotificationType for WorkspaceRefresh {
    const METHOD: &'static str = "workspace/refresh";
    type Params = Value;
}

/// Sent by the worker when it begins a refresh on its own.
pub enum WorkspaceRefreshStarted {}

impl NotificationType for WorkspaceRefreshStarted {
    const METHOD: &'static str = "workspace/refreshStarted";
    type Params = Value;
}

/// Serialize typed params, mapping `null` to "omit the field".
pub(crate) fn to_params<P: Serialize>(params: &P) -> serde_json::Result<Option<Value>> {
    match serde_json::to_value(params)? {
        Value::Null => Ok(None),
        other => Ok(Some(other)),
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Request<'a> {
    pub fn new(id: u64, method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl<'a> Notification<'a> {
    pub fn new(method: &'a str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ResponseError {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// A frame read from the worker, classified by shape.
#[derive(Debug)]
pub(crate) enum IncomingFrame {
    Response {
        id: u64,
        outcome: Result<Value, ResponseError>,
    },
    ServerRequest {
        id: Value,
        method: String,
    },
    Notification {
        method: String,
        params: Option<Value>,
    },
}

pub(crate) fn parse_incoming(mut frame: Value) -> Option<IncomingFrame> {
    let object = frame.as_object_mut()?;
    let method = object
        .get("method")
        .and_then(Value::as_str)
        .map(String::from);
    let id = object.remove("id");

    match (id, method) {
        (Some(id), None) => {
            let id = id.as_u64()?;
            let outcome = match object.remove("error") {
                Some(error) => Err(serde_json::from_value(error).unwrap_or_else(|e| {
                    ResponseError {
                        code: 0,
                        message: format!("unparseable error object: {e}"),
                        data: None,
                    }
                })),
                None => Ok(object.remove("result").unwrap_or(Value::Null)),
            };
            Some(IncomingFrame::Response { id, outcome })
        }
        (Some(id), Some(method)) => Some(IncomingFrame::ServerRequest { id, method }),
        (None, Some(method)) => Some(IncomingFrame::Notification {
            method,
            params: object.remove("params"),
        }),
        (None, None) => None,
    }
}

pub(crate) fn method_not_found(id: Value, method: &str) -> Value {
    serde_json::json!({
        "jsonrpc": JSONRPC_VERSION,
        "id": id,
        "error": {
            "code": METHOD_NOT_FOUND,
            "message": format!("Method not found: {method}")
        }
    })
}

pub(crate) fn initialize_params(workspace_path: &Path) -> Value {
    let root_uri = url::Url::from_directory_path(workspace_path)
        .ok()
        .map(String::from);
    serde_json::json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": {},
        "initializationOptions": {
            "workspacePath": workspace_path.to_string_lossy()
        }
    })
}

/// The worker may report its own pid in the initialize result, which is the
/// one to kill when it runs under a wrapper.
pub(crate) fn reported_pid(initialize_result: &Value) -> Option<u32> {
    initialize_result
        .get("pid")
        .and_then(Value::as_u64)
        .and_then(|pid| u32::try_from(pid).ok())
}
