//! Gateway WebSocket protocol types (connect, queue control, page driver reports).

use serde::{Deserialize, Serialize};
use serde_json::json;

/// Wire request: `{ "type": "req", "id", "method", "params" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsRequest {
    #[serde(rename = "type")]
    pub typ: String,
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Wire response: `{ "type": "res", "id", "ok", "payload" or "error" }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsResponse {
    #[serde(rename = "type")]
    pub typ: String,
    pub id: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Client connect params (subset needed for handshake).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub min_protocol: Option<u32>,
    pub max_protocol: Option<u32>,
    #[serde(default)]
    pub client: ConnectClient,
    /// "controller" or "driver"; informational.
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub auth: ConnectAuth,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectClient {
    pub id: Option<String>,
    pub version: Option<String>,
    pub platform: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectAuth {
    pub token: Option<String>,
}

/// Server hello-ok payload after successful connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloOk {
    #[serde(rename = "type")]
    pub typ: String,
    pub protocol: u32,
    /// Connection id; page drivers attached by this socket are registered under it.
    pub conn_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<HelloPolicy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPolicy {
    pub retry_delay_ms: Option<u64>,
}

/// Params naming only a conversation (clear, pause, resume, get, status, subscribe, attach).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextParams {
    pub context_key: String,
}

/// Params for `queue.enqueue`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueParams {
    pub context_key: String,
    pub text: String,
}

/// Params targeting one item (`queue.remove`, `driver.submitted`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemParams {
    pub context_key: String,
    pub id: String,
}

/// Params for `queue.edit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditParams {
    pub context_key: String,
    pub id: String,
    pub text: String,
}

/// Params for `driver.pageState`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageStateParams {
    pub context_key: String,
    pub busy: bool,
}

/// Params for `driver.error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverErrorParams {
    pub context_key: String,
    /// Item the failure belongs to; without it the in-flight item is assumed.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub message: String,
}

impl WsResponse {
    pub fn ok(id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            typ: "res".to_string(),
            id: id.into(),
            ok: true,
            payload: Some(payload),
            error: None,
        }
    }

    pub fn err(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            typ: "res".to_string(),
            id: id.into(),
            ok: false,
            payload: None,
            error: Some(error.into()),
        }
    }

    pub fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Event frame: `{ "type": "event", "event", "payload" }`.
pub fn event_frame(event: &str, payload: serde_json::Value) -> String {
    serde_json::to_string(&json!({
        "type": "event",
        "event": event,
        "payload": payload,
    }))
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_params_default_to_null() {
        let req: WsRequest =
            serde_json::from_str(r#"{"type":"req","id":"7","method":"health"}"#).unwrap();
        assert_eq!(req.method, "health");
        assert!(req.params.is_null());
    }

    #[test]
    fn error_response_omits_payload() {
        let text = WsResponse::err("3", "not_found").to_text();
        let v: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["ok"], false);
        assert_eq!(v["error"], "not_found");
        assert!(v.get("payload").is_none());
    }

    #[test]
    fn item_params_use_camel_case() {
        let p: ItemParams =
            serde_json::from_value(json!({"contextKey": "tab", "id": "x"})).unwrap();
        assert_eq!(p.context_key, "tab");
    }
}
