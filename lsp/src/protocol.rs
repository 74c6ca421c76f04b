//! JSON-RPC message shapes exchanged with the language server.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub(crate) const METHOD_NOT_FOUND: i64 = -32601;

#[derive(Debug, thiserror::Error)]
#[error("cannot express {} as a file URI", path.display())]
pub(crate) struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// Error reply to a request the server sent us.
pub(crate) fn method_not_found(id: &serde_json::Value, method: &str) -> serde_json::Value {
    serde_json::json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {
            "code": METHOD_NOT_FOUND,
            "message": format!("Method not found: {method}"),
        }
    })
}

/// A decoded frame, classified by shape.
#[derive(Debug)]
pub(crate) enum Incoming {
    Response {
        id: u64,
        body: serde_json::Value,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

impl Incoming {
    pub fn classify(frame: &serde_json::Value) -> Option<Self> {
        let id = frame.get("id");
        let method = frame
            .get("method")
            .and_then(serde_json::Value::as_str)
            .map(String::from);
        let is_reply = frame.get("result").is_some() || frame.get("error").is_some();

        match (id, method, is_reply) {
            (Some(id), None, true) => Some(Self::Response {
                id: id.as_u64()?,
                body: frame.clone(),
            }),
            (Some(id), Some(method), _) => Some(Self::ServerRequest {
                id: id.clone(),
                method,
            }),
            (None, Some(method), _) => Some(Self::Notification {
                method,
                params: frame.get("params").cloned(),
            }),
            _ => None,
        }
    }
}

/// `window/logMessage` and `window/showMessage` payload.
#[derive(Debug, Deserialize)]
pub(crate) struct MessageParams {
    #[serde(rename = "type")]
    pub kind: u8,
    pub message: String,
}

impl MessageParams {
    pub fn level_label(&self) -> &'static str {
        match self.kind {
            1 => "error",
            2 => "warning",
            3 => "info",
            _ => "log",
        }
    }
}

/// Error message carried by a response, if it is an error response.
pub(crate) fn response_error(body: &serde_json::Value) -> Option<String> {
    let error = body.get("error")?;
    Some(
        error
            .get("message")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown error")
            .to_string(),
    )
}

pub(crate) fn initialize_params(root_uri: Option<&str>) -> serde_json::Value {
    let folders = root_uri.map(|uri| {
        serde_json::json!([{
            "uri": uri,
            "name": "workspace",
        }])
    });
    serde_json::json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": "gx",
            "version": env!("CARGO_PKG_VERSION"),
        },
        "rootUri": root_uri,
        "capabilities": {
            "window": {
                "showMessage": {}
            }
        },
        "workspaceFolders": folders,
    })
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}
