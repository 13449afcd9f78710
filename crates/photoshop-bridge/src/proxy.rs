//! Remote object proxies.
//!
//! A class descriptor is fetched from the host once per class name (one
//! `classdef` round trip) and cached for the life of the [`ObjectModel`].
//! Every proxy of that class shares the cached capability table, which is
//! consulted before any getprop/setprop/callmethod request is issued:
//! access-mode violations and unknown names fail locally.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value as Json;
use tokio::sync::OnceCell;

use crate::bridge::protocol::Operation;
use crate::bridge::xml::Element;
use crate::correlator::Correlator;
use crate::error::BridgeError;
use crate::marshal::{self, RemoteObjectHandle, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Access {
    /// Missing or unrecognized modes are treated as read-write.
    fn parse(raw: Option<&str>) -> Self {
        match raw {
            Some("readonly") => Self::ReadOnly,
            Some("writeonly") => Self::WriteOnly,
            _ => Self::ReadWrite,
        }
    }
}

/// What a name on a remote class resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Member {
    Accessor { readable: bool, writable: bool },
    Method,
}

impl From<Access> for Member {
    fn from(access: Access) -> Self {
        Member::Accessor {
            readable: access != Access::WriteOnly,
            writable: access != Access::ReadOnly,
        }
    }
}

/// Capability table for one remote class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassDescriptor {
    class_name: String,
    members: HashMap<String, Member>,
}

impl ClassDescriptor {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            members: HashMap::new(),
        }
    }

    pub fn with_accessor(mut self, name: impl Into<String>, access: Access) -> Self {
        self.members.insert(name.into(), access.into());
        self
    }

    pub fn with_method(mut self, name: impl Into<String>) -> Self {
        self.members.insert(name.into(), Member::Method);
        self
    }

    /// Build from the host's descriptor XML:
    /// `<type><factory><accessor name=".." access=".."/><method name=".."/></factory></type>`.
    pub fn parse(class_name: &str, xml: &str) -> Result<Self, BridgeError> {
        let doc = Element::parse(xml).map_err(|e| {
            BridgeError::decoding(format!("invalid class description for {class_name}: {e}"))
        })?;

        let mut descriptor = Self::new(class_name);
        let Some(factory) = doc.child("factory") else {
            // A class with no instance members.
            return Ok(descriptor);
        };

        for node in factory.children() {
            let Some(name) = node.attr("name") else {
                continue;
            };
            match node.name() {
                "accessor" => {
                    let access = Access::parse(node.attr("access"));
                    descriptor.members.insert(name.to_string(), access.into());
                }
                "method" => {
                    descriptor.members.insert(name.to_string(), Member::Method);
                }
                _ => {}
            }
        }
        Ok(descriptor)
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn member(&self, name: &str) -> Option<Member> {
        self.members.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// How a proxy comes into being.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectInit {
    /// Wrap an object the host already has.
    Existing(String),
    /// Ask the host to construct a new one.
    Construct(Vec<Value>),
}

impl ObjectInit {
    /// Exactly one of an existing uid or constructor arguments.
    pub fn from_parts(uid: Option<String>, args: Vec<Value>) -> Result<Self, BridgeError> {
        match uid {
            Some(_) if !args.is_empty() => Err(BridgeError::usage(
                "cannot specify both an existing uid and constructor arguments",
            )),
            Some(uid) => Ok(Self::Existing(uid)),
            None => Ok(Self::Construct(args)),
        }
    }
}

/// Descriptor cache plus the correlator used to talk about objects.
pub struct ObjectModel {
    correlator: Arc<Correlator>,
    descriptors: DashMap<String, Arc<OnceCell<Arc<ClassDescriptor>>>>,
}

impl ObjectModel {
    pub fn new(correlator: Arc<Correlator>) -> Self {
        Self {
            correlator,
            descriptors: DashMap::new(),
        }
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    /// Descriptor for `cls`, fetched on first use. Concurrent first uses share
    /// one fetch; a failed fetch leaves the class unknown so it can be retried.
    pub async fn describe(&self, cls: &str) -> Result<Arc<ClassDescriptor>, BridgeError> {
        let cell = Arc::clone(self.descriptors.entry(cls.to_string()).or_default().value());
        cell.get_or_try_init(|| async {
            tracing::debug!(cls, "Fetching class descriptor");
            let xml = self
                .correlator
                .call(&Operation::ClassDef {
                    cls: cls.to_string(),
                })
                .await?;
            ClassDescriptor::parse(cls, &xml).map(Arc::new)
        })
        .await
        .cloned()
    }

    /// Already-cached descriptor, if any.
    pub fn cached(&self, cls: &str) -> Option<Arc<ClassDescriptor>> {
        self.descriptors
            .get(cls)
            .and_then(|cell| cell.get().cloned())
    }

    pub async fn instantiate(
        self: &Arc<Self>,
        cls: &str,
        init: ObjectInit,
    ) -> Result<RemoteObject, BridgeError> {
        let descriptor = self.describe(cls).await?;
        let uid = match init {
            ObjectInit::Existing(uid) => uid,
            ObjectInit::Construct(args) => {
                tracing::debug!(cls, args = args.len(), "Constructing remote object");
                let payload = self
                    .correlator
                    .call(&Operation::ObjCreate {
                        cls: cls.to_string(),
                        args: marshal::encode_args(&args)?,
                    })
                    .await?;
                created_uid(&payload)?
            }
        };
        Ok(RemoteObject {
            model: Arc::clone(self),
            handle: RemoteObjectHandle::new(cls, uid),
            descriptor,
        })
    }

    pub async fn construct(
        self: &Arc<Self>,
        cls: &str,
        args: Vec<Value>,
    ) -> Result<RemoteObject, BridgeError> {
        self.instantiate(cls, ObjectInit::Construct(args)).await
    }

    /// Proxy for a handle the host handed back. No construction round trip.
    pub async fn attach(
        self: &Arc<Self>,
        handle: RemoteObjectHandle,
    ) -> Result<RemoteObject, BridgeError> {
        let descriptor = self.describe(handle.class_name()).await?;
        Ok(RemoteObject {
            model: Arc::clone(self),
            handle,
            descriptor,
        })
    }

    /// Read a static property of a host class.
    pub async fn static_property(&self, cls: &str, prop: &str) -> Result<Value, BridgeError> {
        tracing::debug!(cls, prop, "Reading static property");
        self.correlator
            .call_value(&Operation::Static {
                cls: cls.to_string(),
                prop: prop.to_string(),
            })
            .await
    }
}

/// `objcreate` answers `{"obj_uid": ...}`, or a tagged error.
fn created_uid(payload: &str) -> Result<String, BridgeError> {
    let json: Json = serde_json::from_str(payload)
        .map_err(|e| BridgeError::decoding(format!("invalid objcreate response: {e}")))?;
    if json.get("type").and_then(Json::as_str) == Some("error") {
        marshal::decode(&json)?;
    }
    json.get("obj_uid")
        .and_then(Json::as_str)
        .map(str::to_string)
        .ok_or_else(|| BridgeError::decoding(format!("objcreate response has no obj_uid: {payload}")))
}

/// Controller-side proxy for a host object.
#[derive(Clone)]
pub struct RemoteObject {
    model: Arc<ObjectModel>,
    handle: RemoteObjectHandle,
    descriptor: Arc<ClassDescriptor>,
}

impl std::fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteObject")
            .field("cls", &self.handle.class_name())
            .field("uid", &self.handle.uid())
            .finish()
    }
}

impl std::fmt::Display for RemoteObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.handle, f)
    }
}

impl RemoteObject {
    pub fn handle(&self) -> &RemoteObjectHandle {
        &self.handle
    }

    pub fn class_name(&self) -> &str {
        self.handle.class_name()
    }

    pub fn uid(&self) -> &str {
        self.handle.uid()
    }

    pub fn descriptor(&self) -> &ClassDescriptor {
        &self.descriptor
    }

    fn wire_ref(&self) -> Result<Json, BridgeError> {
        marshal::encode(&Value::Object(self.handle.clone()))
    }

    fn unknown(&self, name: &str) -> BridgeError {
        BridgeError::attribute(format!("{} has no attribute '{name}'", self.class_name()))
    }

    /// Read a property.
    pub async fn get(&self, name: &str) -> Result<Value, BridgeError> {
        match self.descriptor.member(name) {
            Some(Member::Accessor { readable: true, .. }) => {
                let value = self
                    .model
                    .correlator
                    .call_value(&Operation::GetProp {
                        obj: self.wire_ref()?,
                        prop: name.to_string(),
                    })
                    .await?;
                tracing::debug!(object = %self.handle, prop = name, "getprop");
                Ok(value)
            }
            Some(Member::Accessor { readable: false, .. }) => Err(BridgeError::attribute(format!(
                "property '{name}' of {} is write-only",
                self.class_name()
            ))),
            Some(Member::Method) => Err(BridgeError::attribute(format!(
                "'{name}' is a method of {}, not a property",
                self.class_name()
            ))),
            None => Err(self.unknown(name)),
        }
    }

    /// Read a property that holds another host object and wrap it.
    pub async fn get_object(&self, name: &str) -> Result<RemoteObject, BridgeError> {
        match self.get(name).await? {
            Value::Object(handle) => self.model.attach(handle).await,
            other => Err(BridgeError::decoding(format!(
                "property '{name}' of {} is a {}, not an object",
                self.class_name(),
                other.kind()
            ))),
        }
    }

    /// Write a property.
    pub async fn set(&self, name: &str, value: impl Into<Value>) -> Result<(), BridgeError> {
        match self.descriptor.member(name) {
            Some(Member::Accessor { writable: true, .. }) => {
                let value = marshal::encode(&value.into())?;
                let payload = self
                    .model
                    .correlator
                    .call(&Operation::SetProp {
                        obj: self.wire_ref()?,
                        prop: name.to_string(),
                        value,
                    })
                    .await?;
                check_ack(&payload)
            }
            Some(Member::Accessor { writable: false, .. }) => Err(BridgeError::attribute(format!(
                "property '{name}' of {} is read-only",
                self.class_name()
            ))),
            Some(Member::Method) => Err(BridgeError::attribute(format!(
                "cannot assign to method '{name}' of {}",
                self.class_name()
            ))),
            None => Err(self.unknown(name)),
        }
    }

    /// Bound method. Calling it is one round trip per invocation.
    pub fn method(&self, name: &str) -> Result<RemoteMethod, BridgeError> {
        match self.descriptor.member(name) {
            Some(Member::Method) => Ok(RemoteMethod {
                model: Arc::clone(&self.model),
                target: self.handle.clone(),
                name: name.to_string(),
            }),
            Some(Member::Accessor { .. }) => Err(BridgeError::attribute(format!(
                "'{name}' is a property of {}, not a method",
                self.class_name()
            ))),
            None => Err(self.unknown(name)),
        }
    }

    pub async fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        self.method(name)?.call(args).await
    }

    /// Call a method that returns another host object and wrap the result.
    pub async fn call_object(&self, name: &str, args: Vec<Value>) -> Result<RemoteObject, BridgeError> {
        self.method(name)?.call_object(args).await
    }
}

pub struct RemoteMethod {
    model: Arc<ObjectModel>,
    target: RemoteObjectHandle,
    name: String,
}

impl RemoteMethod {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value, BridgeError> {
        let result = self
            .model
            .correlator
            .call_value(&Operation::CallMethod {
                obj: marshal::encode(&Value::Object(self.target.clone()))?,
                method: self.name.clone(),
                args: marshal::encode_args(&args)?,
            })
            .await?;
        tracing::debug!(object = %self.target, method = %self.name, "callmethod");
        Ok(result)
    }

    pub async fn call_object(&self, args: Vec<Value>) -> Result<RemoteObject, BridgeError> {
        match self.call(args).await? {
            Value::Object(handle) => self.model.attach(handle).await,
            other => Err(BridgeError::decoding(format!(
                "method '{}' of {} returned a {}, not an object",
                self.name,
                self.target.class_name(),
                other.kind()
            ))),
        }
    }
}

/// Acknowledgement payloads may be empty; otherwise they must decode, which
/// surfaces host errors.
pub(crate) fn check_ack(payload: &str) -> Result<(), BridgeError> {
    if payload.trim().is_empty() {
        return Ok(());
    }
    marshal::decode_str(payload).map(|_| ())
}
