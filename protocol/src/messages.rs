use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

/// Reserved no-op command used to confirm a transport is answering.
pub const PROBE_COMMAND: &str = "ping";

/// Id carried by the liveness probe and by the direct-import startup record.
/// User commands are numbered from 1.
pub const PROBE_ID: u64 = 0;

pub type Params = Map<String, Value>;

/// A single outgoing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: u64,
    pub command: String,
    #[serde(default)]
    pub params: Params,
}

impl Command {
    pub fn new(id: u64, command: impl Into<String>, params: Params) -> Self {
        Self {
            id,
            command: command.into(),
            params,
        }
    }

    /// The reserved liveness probe.
    pub fn probe() -> Self {
        Self::new(PROBE_ID, PROBE_COMMAND, Params::new())
    }

    pub fn is_probe(&self) -> bool {
        self.id == PROBE_ID && self.command == PROBE_COMMAND
    }
}

/// Reply to a [`Command`], matched by `id`.
///
/// `result` is present iff `success`, `error` is present iff not. A JSON
/// `null` result on a successful reply is a present value, not an absent one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawResponse")]
pub struct Response {
    pub id: u64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: u64, error: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Split into the engine's result or the engine's error message.
    pub fn into_result(self) -> Result<Value, String> {
        if self.success {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_default())
        }
    }
}

#[derive(Deserialize)]
struct RawResponse {
    id: u64,
    success: bool,
    #[serde(default, deserialize_with = "present_value")]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

fn present_value<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<RawResponse> for Response {
    type Error = String;

    fn try_from(raw: RawResponse) -> Result<Self, Self::Error> {
        match (raw.success, &raw.result, &raw.error) {
            (true, Some(_), None) | (false, None, Some(_)) => Ok(Self {
                id: raw.id,
                success: raw.success,
                result: raw.result,
                error: raw.error,
            }),
            (true, None, _) => Err(format!("response {} has success=true but no result", raw.id)),
            (true, Some(_), Some(_)) => {
                Err(format!("response {} has success=true and an error", raw.id))
            }
            (false, _, None) => Err(format!("response {} has success=false but no error", raw.id)),
            (false, Some(_), Some(_)) => {
                Err(format!("response {} has success=false and a result", raw.id))
            }
        }
    }
}
