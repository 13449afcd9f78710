//! Request correlator.
//!
//! A call registers a pending entry under a fresh [`RequestId`], sends the
//! request on its own connection and waits for the listener to deliver the
//! matching `requestResponse`. Waiting happens in bounded slices; between
//! slices the event pump runs so the UI side keeps processing callbacks.
//!
//! The pending entry is removed exactly once on every exit path (response,
//! timeout, send failure, or the call future being dropped). A response that
//! arrives after its entry is gone is logged and dropped.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Notify;

use crate::bridge::codec::Message;
use crate::bridge::protocol::{Operation, RequestEnvelope, RequestId};
use crate::bridge::transport::HostLink;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::marshal::{self, Value};
use crate::pump::EventPump;

#[derive(Default)]
struct PendingRequest {
    response: Mutex<Option<String>>,
    notify: Notify,
}

impl PendingRequest {
    /// Store the response and wake the waiter. Returns false on a duplicate.
    fn fulfil(&self, data: String) -> bool {
        {
            let mut slot = self.response.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return false;
            }
            *slot = Some(data);
        }
        // notify_one keeps a permit if the waiter is between slices.
        self.notify.notify_one();
        true
    }

    fn take(&self) -> Option<String> {
        self.response
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Removes the pending entry when the call ends, however it ends.
struct Registration<'a> {
    pending: &'a DashMap<RequestId, Arc<PendingRequest>>,
    uid: RequestId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.uid);
    }
}

pub struct Correlator {
    link: Arc<dyn HostLink>,
    pending: DashMap<RequestId, Arc<PendingRequest>>,
    request_timeout: Duration,
    wait_slice: Duration,
    pump: RwLock<Option<Arc<dyn EventPump>>>,
}

impl Correlator {
    pub fn new(link: Arc<dyn HostLink>, config: &BridgeConfig) -> Self {
        Self {
            link,
            pending: DashMap::new(),
            request_timeout: config.request_timeout,
            wait_slice: config.wait_slice,
            pump: RwLock::new(None),
        }
    }

    /// Run `pump` between wait slices.
    pub fn with_pump(self, pump: Arc<dyn EventPump>) -> Self {
        self.set_pump(Some(pump));
        self
    }

    /// Replace the pump. `None` means callers drain the queue themselves,
    /// which is what the blocking facade does from its own thread.
    pub fn set_pump(&self, pump: Option<Arc<dyn EventPump>>) {
        *self.pump.write().unwrap_or_else(PoisonError::into_inner) = pump;
    }

    fn current_pump(&self) -> Option<Arc<dyn EventPump>> {
        self.pump
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Number of requests currently waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Send `operation` and wait for its raw response payload.
    pub async fn call(&self, operation: &Operation) -> Result<String, BridgeError> {
        let data = serde_json::to_string(operation)
            .map_err(|e| BridgeError::encoding(format!("cannot serialize operation: {e}")))?;

        let uid = RequestId::new();
        let entry = Arc::new(PendingRequest::default());
        match self.pending.entry(uid) {
            Entry::Occupied(_) => {
                return Err(BridgeError::Protocol(format!(
                    "request id {uid} is already pending"
                )));
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Arc::clone(&entry));
            }
        }
        let _registration = Registration {
            pending: &self.pending,
            uid,
        };

        let started = Instant::now();
        tracing::debug!(%uid, operation = operation.kind(), "Sending request");
        let envelope = RequestEnvelope::new(uid, data);
        self.link.send(Message::Request(envelope.to_xml())).await?;

        loop {
            if let Some(response) = entry.take() {
                tracing::debug!(
                    %uid,
                    operation = operation.kind(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Received response"
                );
                return Ok(response);
            }

            let elapsed = started.elapsed();
            if elapsed >= self.request_timeout {
                tracing::error!(%uid, operation = %envelope.data, "No response before timeout");
                return Err(BridgeError::Timeout {
                    uid,
                    operation: envelope.data,
                    elapsed,
                });
            }

            let slice = self.wait_slice.min(self.request_timeout - elapsed);
            let _ = tokio::time::timeout(slice, entry.notify.notified()).await;

            if let Some(pump) = self.current_pump() {
                pump.pump();
            }
        }
    }

    /// Send `operation` and decode its response as a tagged value.
    pub async fn call_value(&self, operation: &Operation) -> Result<Value, BridgeError> {
        let payload = self.call(operation).await?;
        marshal::decode_str(&payload)
    }

    /// Hand a response to its waiting caller.
    ///
    /// Returns false (and logs) when nobody is waiting for `uid`, which
    /// happens when the call already timed out.
    pub fn deliver(&self, uid: &str, data: String) -> bool {
        let entry = RequestId::parse(uid)
            .ok()
            .and_then(|id| self.pending.get(&id).map(|e| Arc::clone(e.value())));

        let Some(entry) = entry else {
            tracing::warn!(uid, "Response for unknown or expired request, dropping");
            return false;
        };

        if !entry.fulfil(data) {
            tracing::warn!(uid, "Duplicate response for request, dropping");
            return false;
        }
        true
    }
}
