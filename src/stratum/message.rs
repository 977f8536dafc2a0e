use {
    super::*,
    serde::{de, Deserializer, Serializer},
};

/// An unsolicited frame pushed by the pool, already peeled out of the
/// JSON-RPC envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request {
        id: u64,
        method: String,
        params: Value,
    },
    Response {
        id: u64,
        result: Option<Value>,
        error: Option<RpcError>,
    },
    Notification {
        method: String,
        params: Value,
    },
}

impl Serialize for Message {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        #[derive(Serialize)]
        struct WireRequest<'a> {
            jsonrpc: &'static str,
            id: u64,
            method: &'a str,
            params: &'a Value,
        }

        #[derive(Serialize)]
        struct WireResponse<'a> {
            jsonrpc: &'static str,
            id: u64,
            result: &'a Option<Value>,
            error: &'a Option<RpcError>,
        }

        #[derive(Serialize)]
        struct WireNotification<'a> {
            jsonrpc: &'static str,
            method: &'a str,
            params: &'a Value,
        }

        match self {
            Self::Request { id, method, params } => WireRequest {
                jsonrpc: "2.0",
                id: *id,
                method,
                params,
            }
            .serialize(serializer),
            Self::Response { id, result, error } => WireResponse {
                jsonrpc: "2.0",
                id: *id,
                result,
                error,
            }
            .serialize(serializer),
            Self::Notification { method, params } => WireNotification {
                jsonrpc: "2.0",
                method,
                params,
            }
            .serialize(serializer),
        }
    }
}

/// Strict frame classifier. A response must carry `jsonrpc: "2.0"`, an id,
/// and a `result` or `error` member. A notification carries `method` and
/// `params` with no id (pools commonly send `id: null`, which counts as
/// absent). Frames matching neither shape are rejected.
impl<'de> Deserialize<'de> for Message {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;

        let has_method = value.get("method").is_some();

        let id_absent = match value.get("id") {
            None | Some(Value::Null) => true,
            Some(_) => false,
        };

        if has_method && id_absent {
            let method = value
                .get("method")
                .and_then(Value::as_str)
                .ok_or_else(|| de::Error::custom("notification method must be a string"))?
                .to_string();

            let params = value
                .get("params")
                .cloned()
                .ok_or_else(|| de::Error::missing_field("params"))?;

            return Ok(Self::Notification { method, params });
        }

        let id = value
            .get("id")
            .and_then(Value::as_u64)
            .ok_or_else(|| de::Error::custom(format!("bad frame, unusable id: {value}")))?;

        if has_method {
            let method = value
                .get("method")
                .and_then(Value::as_str)
                .ok_or_else(|| de::Error::custom("request method must be a string"))?
                .to_string();

            let params = value.get("params").cloned().unwrap_or(Value::Null);

            return Ok(Self::Request { id, method, params });
        }

        if value.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
            return Err(de::Error::custom(format!("bad response: {value}")));
        }

        if value.get("result").is_none() && value.get("error").is_none() {
            return Err(de::Error::custom(format!(
                "response carries neither result nor error: {value}"
            )));
        }

        let result = value.get("result").filter(|v| !v.is_null()).cloned();

        let error = match value.get("error").filter(|v| !v.is_null()) {
            Some(raw) => Some(
                serde_json::from_value::<RpcError>(raw.clone()).map_err(de::Error::custom)?,
            ),
            None => None,
        };

        Ok(Self::Response { id, result, error })
    }
}
