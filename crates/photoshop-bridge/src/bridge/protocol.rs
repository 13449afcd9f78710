//! Envelope and operation types exchanged with the host.
//!
//! - **RequestEnvelope**: `<request><uid/><data/></request>`, data is JSON
//! - **HostEnvelope**: `<response><type/>...</response>`, one of four kinds
//! - **Operation**: the JSON document carried in a request's `data`

use serde::{Deserialize, Serialize};

use super::xml::{Element, XmlError, escape};

/// Unique identifier correlating a request with its response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s.trim())?;
        Ok(Self(uuid))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outbound request: correlation id plus a JSON-encoded operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEnvelope {
    pub uid: RequestId,
    pub data: String,
}

impl RequestEnvelope {
    pub fn new(uid: RequestId, data: String) -> Self {
        Self { uid, data }
    }

    pub fn to_xml(&self) -> String {
        format!(
            "<request><uid>{}</uid><data>{}</data></request>",
            self.uid,
            escape(&self.data)
        )
    }

    pub fn from_xml(xml: &str) -> Result<Self, EnvelopeError> {
        let doc = Element::parse(xml)?;
        if doc.name() != "request" {
            return Err(EnvelopeError::UnexpectedRoot(doc.name().to_string()));
        }
        let uid = doc
            .child_text("uid")
            .ok_or(EnvelopeError::MissingField("uid"))?;
        let uid = RequestId::parse(uid).map_err(|_| EnvelopeError::InvalidUid(uid.to_string()))?;
        let data = doc
            .child("data")
            .ok_or(EnvelopeError::MissingField("data"))?
            .raw_text()
            .to_string();
        Ok(Self { uid, data })
    }
}

/// Inbound envelope sent by the host in a Response message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEnvelope {
    /// Answer to a pending request.
    RequestResponse { uid: String, data: String },
    /// Host invoked a registered callback (e.g. a panel button).
    Callback { uid: String },
    /// Host-side menu selection.
    MenuClick { id: String },
    /// Informational application event.
    AppEvent { event: String },
}

impl HostEnvelope {
    pub fn parse(xml: &str) -> Result<Self, EnvelopeError> {
        let doc = Element::parse(xml)?;
        let kind = doc
            .child_text("type")
            .ok_or(EnvelopeError::MissingField("type"))?;

        let field = |name: &'static str| -> Result<String, EnvelopeError> {
            doc.child_text(name)
                .map(str::to_string)
                .ok_or(EnvelopeError::MissingField(name))
        };

        match kind {
            "requestResponse" => Ok(Self::RequestResponse {
                uid: field("uid")?,
                // Payload may carry significant whitespace, keep it as sent.
                data: doc
                    .child("data")
                    .map(|d| d.raw_text().to_string())
                    .unwrap_or_default(),
            }),
            "callback" => Ok(Self::Callback { uid: field("uid")? }),
            "menu_click" => Ok(Self::MenuClick { id: field("id")? }),
            "app_event" => Ok(Self::AppEvent {
                event: field("event")?,
            }),
            other => Err(EnvelopeError::UnknownType(other.to_string())),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::RequestResponse { .. } => "requestResponse",
            Self::Callback { .. } => "callback",
            Self::MenuClick { .. } => "menu_click",
            Self::AppEvent { .. } => "app_event",
        }
    }

    /// Serialize as the host would (used by fake hosts in tests).
    pub fn to_xml(&self) -> String {
        let body = match self {
            Self::RequestResponse { uid, data } => {
                format!("<uid>{}</uid><data>{}</data>", escape(uid), escape(data))
            }
            Self::Callback { uid } => format!("<uid>{}</uid>", escape(uid)),
            Self::MenuClick { id } => format!("<id>{}</id>", escape(id)),
            Self::AppEvent { event } => format!("<event>{}</event>", escape(event)),
        };
        format!("<response><type>{}</type>{}</response>", self.kind(), body)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error(transparent)]
    Xml(#[from] XmlError),
    #[error("envelope is missing <{0}>")]
    MissingField(&'static str),
    #[error("unknown envelope type '{0}'")]
    UnknownType(String),
    #[error("unexpected root element <{0}>")]
    UnexpectedRoot(String),
    #[error("invalid request uid '{0}'")]
    InvalidUid(String),
}

/// Operation carried in a request's `data` field.
///
/// Object references and argument lists are already-marshaled tagged values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    ClearPanel,
    SetMessage {
        message: String,
    },
    /// Returns the callback uid the host assigned to the button.
    AddButton {
        label: String,
    },
    Static {
        cls: String,
        prop: String,
    },
    /// Returns the class descriptor as raw XML.
    ClassDef {
        cls: String,
    },
    /// Returns `{"obj_uid": ...}`.
    ObjCreate {
        cls: String,
        args: serde_json::Value,
    },
    GetProp {
        obj: serde_json::Value,
        prop: String,
    },
    SetProp {
        obj: serde_json::Value,
        prop: String,
        value: serde_json::Value,
    },
    CallMethod {
        obj: serde_json::Value,
        method: String,
        args: serde_json::Value,
    },
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClearPanel => "clearpanel",
            Self::SetMessage { .. } => "setmessage",
            Self::AddButton { .. } => "addbutton",
            Self::Static { .. } => "static",
            Self::ClassDef { .. } => "classdef",
            Self::ObjCreate { .. } => "objcreate",
            Self::GetProp { .. } => "getprop",
            Self::SetProp { .. } => "setprop",
            Self::CallMethod { .. } => "callmethod",
        }
    }
}
