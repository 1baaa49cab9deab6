use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{AsRefStr, Display, EnumString};

/// JSON‑RPC 2.0 types for the channel wire protocol.
///
/// One object per line over a TCP stream. Usage:
/// ```ignore
/// use serde_json::json;
/// use fbp_channel::jsonrpc::{Id, Method, Request};
///
/// let req = Request::call(Id::Number(1), Method::Read, Some(json!({"token": "r0"})));
/// let line = serde_json::to_string(&req).unwrap();
/// ```
pub const JSONRPC_VERSION: &str = "2.0";

/// `id` MAY be a string, number or null.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Id {
    Number(i64),
    String(String),
    Null,
}

/// Calls understood by a channel process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "camelCase")]
pub enum Method {
    /// Check that a token names an endpoint of the expected kind.
    Attach,
    Read,
    Write,
    Close,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Omitted for notifications.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Id>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Error {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Exactly one of `result` or `error` is present.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
    pub id: Id,
}

/// Lets a reader decode a line without inspecting it first.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Response(Response),
}

impl Request {
    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.into(),
            params,
            id: None,
        }
    }

    pub fn call(id: Id, method: Method, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            method: method.to_string(),
            params,
            id: Some(id),
        }
    }
}

impl Response {
    pub fn success(id: Id, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn fail(id: Id, error: Error) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_owned(),
            result: None,
            error: Some(error),
            id,
        }
    }

    /// Splits the response into the outcome of the call.
    pub fn into_result(self) -> Result<Value, Error> {
        match (self.result, self.error) {
            (_, Some(err)) => Err(err),
            (Some(v), None) => Ok(v),
            (None, None) => Ok(Value::Null),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrip_request() {
        let req = Request::call(Id::Number(1), Method::Attach, Some(json!({"token": "w0"})));
        let s = serde_json::to_string(&req).unwrap();
        let de: Request = serde_json::from_str(&s).unwrap();
        assert_eq!(de.method, "attach");
        assert_eq!(de.id, Some(Id::Number(1)));
    }

    #[test]
    fn roundtrip_response() {
        let resp = Response::success(Id::String("abc".into()), json!({"ok": true}));
        let s = serde_json::to_string(&resp).unwrap();
        let de: Response = serde_json::from_str(&s).unwrap();
        assert_eq!(de.into_result().unwrap()["ok"], json!(true));
    }

    #[test]
    fn untagged_message_tells_requests_from_responses() {
        let line = r#"{"jsonrpc":"2.0","id":7,"error":{"code":-32001,"message":"handle closed"}}"#;
        match serde_json::from_str::<Message>(line).unwrap() {
            Message::Response(resp) => assert_eq!(resp.into_result().unwrap_err().code, -32001),
            Message::Request(_) => panic!("decoded a response as a request"),
        }
    }

    #[test]
    fn method_parse() {
        let m: Method = "close".parse().unwrap();
        assert_eq!(m, Method::Close);
        assert_eq!(m.as_ref(), "close");
        assert!("shutdown".parse::<Method>().is_err());
    }
}
