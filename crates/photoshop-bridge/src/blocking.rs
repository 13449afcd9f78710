//! Synchronous facade for callers that are not async, typically a UI thread.
//!
//! Each call is spawned onto the runtime and the calling thread waits for the
//! result in `wait_slice` steps. Between steps it drains the main-thread
//! queue itself, so button callbacks run on the caller's thread and may call
//! back into the bridge. The correlator does not pump while a blocking bridge
//! exists.
//!
//! Calling these methods from inside an async context is a usage error.

use std::future::Future;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use tokio::runtime::Handle;

use crate::client::Bridge;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::marshal::{RemoteObjectHandle, Value};
use crate::proxy::RemoteObject;
use crate::pump::MainThreadQueue;

/// Runs a request on the runtime and waits for it on the calling thread.
#[derive(Clone)]
struct Waiter {
    runtime: Handle,
    queue: Arc<MainThreadQueue>,
    slice: Duration,
}

impl Waiter {
    fn wait<T, F>(&self, request: F) -> Result<T, BridgeError>
    where
        F: Future<Output = Result<T, BridgeError>> + Send + 'static,
        T: Send + 'static,
    {
        if Handle::try_current().is_ok() {
            return Err(BridgeError::usage(
                "blocking bridge called from inside an async context; use Bridge instead",
            ));
        }

        let (tx, rx) = mpsc::sync_channel(1);
        self.runtime.spawn(async move {
            let _ = tx.send(request.await);
        });

        let slice = self.slice.max(Duration::from_millis(1));
        loop {
            match rx.recv_timeout(slice) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {
                    let ran = self.queue.run_pending();
                    if ran > 0 {
                        tracing::trace!(jobs = ran, "Ran main-thread jobs while waiting");
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(BridgeError::Protocol(
                        "request task ended without a result".to_string(),
                    ));
                }
            }
        }
    }
}

#[derive(Clone)]
pub struct BlockingBridge {
    bridge: Bridge,
    waiter: Waiter,
}

impl BlockingBridge {
    /// Wrap `bridge`. From here on queued callbacks only run on threads
    /// that call into this facade (or drain the queue explicitly).
    pub fn new(bridge: Bridge, runtime: Handle) -> Self {
        bridge.correlator().set_pump(None);
        let waiter = Waiter {
            runtime,
            queue: Arc::clone(bridge.main_queue()),
            slice: bridge.config().wait_slice,
        };
        Self { bridge, waiter }
    }

    /// Start a bridge on `runtime` and wait for registration to finish.
    pub fn start(remote_port: u16, config: BridgeConfig, runtime: Handle) -> Result<Self, BridgeError> {
        if Handle::try_current().is_ok() {
            return Err(BridgeError::usage(
                "blocking bridge started from inside an async context; use Bridge::start",
            ));
        }
        let bridge = runtime.block_on(Bridge::start(remote_port, config))?;
        Ok(Self::new(bridge, runtime))
    }

    pub fn inner(&self) -> &Bridge {
        &self.bridge
    }

    fn wrap(&self, object: RemoteObject) -> BlockingObject {
        BlockingObject {
            object,
            waiter: self.waiter.clone(),
        }
    }

    pub fn clear_panel(&self) -> Result<(), BridgeError> {
        let bridge = self.bridge.clone();
        self.waiter.wait(async move { bridge.clear_panel().await })
    }

    pub fn set_message(&self, text: &str) -> Result<(), BridgeError> {
        let bridge = self.bridge.clone();
        let text = text.to_string();
        self.waiter.wait(async move { bridge.set_message(&text).await })
    }

    pub fn add_button<F>(&self, label: &str, callback: F) -> Result<String, BridgeError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let bridge = self.bridge.clone();
        let label = label.to_string();
        self.waiter
            .wait(async move { bridge.add_button(&label, callback).await })
    }

    pub fn construct(&self, cls: &str, args: Vec<Value>) -> Result<BlockingObject, BridgeError> {
        let bridge = self.bridge.clone();
        let cls = cls.to_string();
        let object = self
            .waiter
            .wait(async move { bridge.construct(&cls, args).await })?;
        Ok(self.wrap(object))
    }

    pub fn attach(&self, handle: RemoteObjectHandle) -> Result<BlockingObject, BridgeError> {
        let bridge = self.bridge.clone();
        let object = self.waiter.wait(async move { bridge.attach(handle).await })?;
        Ok(self.wrap(object))
    }

    pub fn static_property(&self, cls: &str, name: &str) -> Result<Value, BridgeError> {
        let bridge = self.bridge.clone();
        let (cls, name) = (cls.to_string(), name.to_string());
        self.waiter
            .wait(async move { bridge.static_property(&cls, &name).await })
    }

    pub fn application(&self) -> Result<BlockingObject, BridgeError> {
        let bridge = self.bridge.clone();
        let object = self.waiter.wait(async move { bridge.application().await })?;
        Ok(self.wrap(object))
    }

    pub fn request_foreground(&self) -> Result<(), BridgeError> {
        let bridge = self.bridge.clone();
        self.waiter
            .wait(async move { bridge.request_foreground().await })
    }

    pub fn send_quit(&self) -> Result<(), BridgeError> {
        let bridge = self.bridge.clone();
        self.waiter.wait(async move { bridge.send_quit().await })
    }

    /// Run queued callbacks on this thread.
    pub fn run_pending(&self) -> usize {
        self.bridge.main_queue().run_pending()
    }

    pub fn shutdown(&self) {
        self.bridge.shutdown();
    }
}

/// [`RemoteObject`] with blocking accessors.
#[derive(Clone)]
pub struct BlockingObject {
    object: RemoteObject,
    waiter: Waiter,
}

impl std::fmt::Debug for BlockingObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.object, f)
    }
}

impl BlockingObject {
    pub fn remote(&self) -> &RemoteObject {
        &self.object
    }

    fn wrap(&self, object: RemoteObject) -> BlockingObject {
        BlockingObject {
            object,
            waiter: self.waiter.clone(),
        }
    }

    pub fn get(&self, name: &str) -> Result<Value, BridgeError> {
        let (object, name) = (self.object.clone(), name.to_string());
        self.waiter.wait(async move { object.get(&name).await })
    }

    pub fn get_object(&self, name: &str) -> Result<BlockingObject, BridgeError> {
        let (object, name) = (self.object.clone(), name.to_string());
        let object = self
            .waiter
            .wait(async move { object.get_object(&name).await })?;
        Ok(self.wrap(object))
    }

    pub fn set(&self, name: &str, value: impl Into<Value>) -> Result<(), BridgeError> {
        let (object, name, value) = (self.object.clone(), name.to_string(), value.into());
        self.waiter.wait(async move { object.set(&name, value).await })
    }

    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Value, BridgeError> {
        let (object, name) = (self.object.clone(), name.to_string());
        self.waiter.wait(async move { object.call(&name, args).await })
    }

    pub fn call_object(&self, name: &str, args: Vec<Value>) -> Result<BlockingObject, BridgeError> {
        let (object, name) = (self.object.clone(), name.to_string());
        let object = self
            .waiter
            .wait(async move { object.call_object(&name, args).await })?;
        Ok(self.wrap(object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{HostEnvelope, Operation};
    use crate::correlator::tests::{ChannelLink, request_of};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const APP_XML: &str = r#"<type><factory>
        <accessor name="version" access="readonly"/>
        <method name="beep"/>
    </factory></type>"#;

    fn respond(op: &Operation) -> String {
        match op {
            Operation::Static { .. } => {
                r#"{"cls":"Application","obj_uid":"app-1","type":"RemoteObject"}"#.to_string()
            }
            Operation::ClassDef { .. } => APP_XML.to_string(),
            Operation::GetProp { .. } => r#"{"type":"String","value":"25.0"}"#.to_string(),
            Operation::AddButton { .. } => r#"{"type":"String","value":"btn-1"}"#.to_string(),
            _ => r#"{"type":"undefined"}"#.to_string(),
        }
    }

    #[test]
    fn blocking_calls_from_a_plain_thread() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let (link, mut sent) = ChannelLink::new();
        let bridge = Bridge::new(
            link,
            BridgeConfig {
                request_timeout: Duration::from_secs(5),
                wait_slice: Duration::from_millis(10),
                ..BridgeConfig::default()
            },
        );
        let correlator = Arc::clone(bridge.correlator());
        runtime.spawn(async move {
            while let Some(message) = sent.recv().await {
                let (envelope, op) = request_of(message);
                correlator.deliver(&envelope.uid.to_string(), respond(&op));
            }
        });

        let blocking = BlockingBridge::new(bridge, runtime.handle().clone());
        let app = blocking.application().unwrap();
        assert_eq!(app.get("version").unwrap(), Value::from("25.0"));
        assert_eq!(app.call("beep", vec![]).unwrap(), Value::Null);
        assert!(matches!(app.set("version", "1"), Err(BridgeError::Attribute(_))));

        let count = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&count);
        let uid = blocking
            .add_button("Go", move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        blocking
            .inner()
            .router()
            .route_envelope(HostEnvelope::Callback { uid })
            .unwrap();
        assert_eq!(blocking.run_pending(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callback_can_call_bridge_while_waiting() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();

        let (link, mut sent) = ChannelLink::new();
        let bridge = Bridge::new(
            link,
            BridgeConfig {
                request_timeout: Duration::from_secs(5),
                wait_slice: Duration::from_millis(10),
                ..BridgeConfig::default()
            },
        );
        let correlator = Arc::clone(bridge.correlator());
        let router = bridge.router();
        runtime.spawn(async move {
            while let Some(message) = sent.recv().await {
                let (envelope, op) = request_of(message);
                let uid = envelope.uid.to_string();
                match &op {
                    // Click the button while this request is still waiting.
                    Operation::SetMessage { message } if message == "slow" => {
                        router
                            .route_envelope(HostEnvelope::Callback {
                                uid: "btn-1".to_string(),
                            })
                            .unwrap();
                        let correlator = Arc::clone(&correlator);
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            correlator.deliver(&uid, String::new());
                        });
                    }
                    _ => {
                        correlator.deliver(&uid, respond(&op));
                    }
                }
            }
        });

        let blocking = BlockingBridge::new(bridge, runtime.handle().clone());
        let outcome = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&outcome);
        let nested = blocking.clone();
        let uid = blocking
            .add_button("Go", move || {
                let result = nested.set_message("from callback");
                *seen.lock().unwrap() = Some(result.is_ok());
            })
            .unwrap();
        assert_eq!(uid, "btn-1");

        blocking.set_message("slow").unwrap();
        assert_eq!(*outcome.lock().unwrap(), Some(true));
    }

    #[test]
    fn blocking_call_inside_runtime_is_usage_error() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap();
        let (link, _sent) = ChannelLink::new();
        let blocking = BlockingBridge::new(
            Bridge::new(link, BridgeConfig::default()),
            runtime.handle().clone(),
        );

        let result = runtime.block_on(async { blocking.set_message("x") });
        assert!(matches!(result, Err(BridgeError::Usage(_))));
    }
}
