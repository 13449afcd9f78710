//! Value marshaling between controller values and the host's tagged unions.
//!
//! The set of supported kinds is closed: null, string, bool, int, float,
//! ordered sequence and remote object handle. Anything else is an encoding
//! error rather than a silent coercion.

use serde_json::{Map, Value as Json, json};

use crate::error::BridgeError;

/// Controller-side reference to a host object. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteObjectHandle {
    cls: String,
    uid: String,
}

impl RemoteObjectHandle {
    pub fn new(cls: impl Into<String>, uid: impl Into<String>) -> Self {
        Self {
            cls: cls.into(),
            uid: uid.into(),
        }
    }

    pub fn class_name(&self) -> &str {
        &self.cls
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }
}

impl std::fmt::Display for RemoteObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{} {}>", self.cls, self.uid)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    String(String),
    Bool(bool),
    Int(i64),
    Float(f64),
    Array(Vec<Value>),
    Object(RemoteObjectHandle),
}

impl Value {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::String(_) => "string",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Array(_) => "array",
            Self::Object(_) => "remote object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Floats, and ints widened to float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Self::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&RemoteObjectHandle> {
        match self {
            Self::Object(handle) => Some(handle),
            _ => None,
        }
    }

    pub fn into_object(self) -> Option<RemoteObjectHandle> {
        match self {
            Self::Object(handle) => Some(handle),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Self::Array(items)
    }
}

impl From<RemoteObjectHandle> for Value {
    fn from(handle: RemoteObjectHandle) -> Self {
        Self::Object(handle)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Value::Null)
    }
}

/// Plain JSON into a controller value. JSON objects have no counterpart.
impl TryFrom<Json> for Value {
    type Error = BridgeError;

    fn try_from(json: Json) -> Result<Self, Self::Error> {
        match json {
            Json::Null => Ok(Self::Null),
            Json::Bool(b) => Ok(Self::Bool(b)),
            Json::String(s) => Ok(Self::String(s)),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Ok(Self::Int(i)),
                None => n
                    .as_f64()
                    .map(Self::Float)
                    .ok_or_else(|| BridgeError::encoding(format!("unsupported number {n}"))),
            },
            Json::Array(items) => items
                .into_iter()
                .map(Value::try_from)
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Array),
            Json::Object(_) => Err(BridgeError::encoding(
                "unsupported type 'object': only null, string, bool, int, float, arrays and remote objects can be sent",
            )),
        }
    }
}

/// Encode a value into its tagged wire form.
pub fn encode(value: &Value) -> Result<Json, BridgeError> {
    let wire = match value {
        Value::Null => json!({"type": "null"}),
        Value::String(s) => json!({"type": "String", "value": s}),
        Value::Bool(b) => json!({"type": "Boolean", "value": b}),
        Value::Int(i) => json!({"type": "int", "value": i}),
        Value::Float(f) => {
            if !f.is_finite() {
                return Err(BridgeError::encoding(format!(
                    "unsupported float {f}: non-finite numbers have no wire form"
                )));
            }
            json!({"type": "Number", "value": f})
        }
        Value::Array(items) => {
            let encoded = items.iter().map(encode).collect::<Result<Vec<_>, _>>()?;
            json!({"type": "Array", "value": encoded})
        }
        Value::Object(handle) => json!({
            "cls": handle.class_name(),
            "obj_uid": handle.uid(),
            "type": "RemoteObject",
        }),
    };
    Ok(wire)
}

/// Encode an argument list as a single tagged Array.
pub fn encode_args(args: &[Value]) -> Result<Json, BridgeError> {
    let encoded = args.iter().map(encode).collect::<Result<Vec<_>, _>>()?;
    Ok(json!({"type": "Array", "value": encoded}))
}

fn field<'a>(map: &'a Map<String, Json>, name: &str, kind: &str) -> Result<&'a Json, BridgeError> {
    map.get(name)
        .ok_or_else(|| BridgeError::decoding(format!("{kind} value is missing '{name}'")))
}

fn string_field(map: &Map<String, Json>, name: &str, kind: &str) -> Result<String, BridgeError> {
    field(map, name, kind)?
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| BridgeError::decoding(format!("{kind} '{name}' is not a string")))
}

/// Decode a tagged wire value. A host `error` becomes [`BridgeError::Remote`].
pub fn decode(wire: &Json) -> Result<Value, BridgeError> {
    let map = match wire {
        Json::Null => return Ok(Value::Null),
        Json::Object(map) => map,
        other => {
            return Err(BridgeError::decoding(format!(
                "expected a tagged value, got {other}"
            )));
        }
    };

    let kind = map
        .get("type")
        .and_then(Json::as_str)
        .ok_or_else(|| BridgeError::decoding(format!("value has no type tag: {wire}")))?;

    match kind {
        "null" | "undefined" => Ok(Value::Null),
        "String" => string_field(map, "value", kind).map(Value::String),
        "Boolean" => field(map, "value", kind)?
            .as_bool()
            .map(Value::Bool)
            .ok_or_else(|| BridgeError::decoding("Boolean value is not a bool")),
        "int" | "uint" => {
            let raw = field(map, "value", kind)?;
            raw.as_i64()
                .or_else(|| {
                    raw.as_f64()
                        .filter(|f| f.fract() == 0.0 && f.abs() < i64::MAX as f64)
                        .map(|f| f as i64)
                })
                .map(Value::Int)
                .ok_or_else(|| BridgeError::decoding(format!("{kind} value {raw} is not an integer")))
        }
        "Number" => field(map, "value", kind)?
            .as_f64()
            .map(Value::Float)
            .ok_or_else(|| BridgeError::decoding("Number value is not numeric")),
        "Array" => field(map, "value", kind)?
            .as_array()
            .ok_or_else(|| BridgeError::decoding("Array value is not a list"))?
            .iter()
            .map(decode)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        "RemoteObject" => Ok(Value::Object(RemoteObjectHandle::new(
            string_field(map, "cls", kind)?,
            string_field(map, "obj_uid", kind)?,
        ))),
        "error" => Err(BridgeError::Remote {
            stack: map
                .get("stack")
                .map(|s| s.as_str().map(str::to_string).unwrap_or_else(|| s.to_string()))
                .unwrap_or_else(|| "<no stack trace>".to_string()),
        }),
        other => Err(BridgeError::decoding(format!(
            "unknown value type '{other}'"
        ))),
    }
}

/// Decode a JSON response payload.
pub fn decode_str(payload: &str) -> Result<Value, BridgeError> {
    let wire: Json = serde_json::from_str(payload)
        .map_err(|e| BridgeError::decoding(format!("invalid JSON response: {e}")))?;
    decode(&wire)
}
