//! The controller-side bridge. Registries and background tasks belong to a
//! single [`Bridge`] instance and are handed to handlers from there.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::Message;
use crate::bridge::protocol::Operation;
use crate::bridge::transport::{HostEndpoint, HostLink, trace_frame};
use crate::config::BridgeConfig;
use crate::correlator::Correlator;
use crate::dispatch::{Callback, CallbackRegistry, InboundRouter, MenuRegistry, SHOW_LOG_MENU_ID};
use crate::error::BridgeError;
use crate::heartbeat::{HeartbeatMonitor, ProcessExit, Terminator};
use crate::listener::BoundListener;
use crate::marshal::{RemoteObjectHandle, Value};
use crate::proxy::{ObjectInit, ObjectModel, RemoteObject, check_ack};
use crate::pump::{EventPump, MainThreadQueue};

/// Host class exposing the application object.
pub const PHOTOSHOP_CLASS: &str = "com.adobe.csawlib.photoshop.Photoshop";

struct BridgeInner {
    config: BridgeConfig,
    link: Arc<dyn HostLink>,
    correlator: Arc<Correlator>,
    objects: Arc<ObjectModel>,
    callbacks: Arc<CallbackRegistry>,
    menus: Arc<MenuRegistry>,
    queue: Arc<MainThreadQueue>,
    router: Arc<InboundRouter>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_port: Mutex<Option<u16>>,
}

/// Cheap to clone; all clones share one bridge.
#[derive(Clone)]
pub struct Bridge {
    inner: Arc<BridgeInner>,
}

impl Bridge {
    /// Bridge over an arbitrary link, with no listener or heartbeat. Inbound
    /// traffic has to be fed through [`Bridge::router`].
    pub fn new(link: Arc<dyn HostLink>, config: BridgeConfig) -> Self {
        let queue = Arc::new(MainThreadQueue::new());
        let correlator = Arc::new(
            Correlator::new(Arc::clone(&link), &config)
                .with_pump(Arc::clone(&queue) as Arc<dyn EventPump>),
        );
        let callbacks = Arc::new(CallbackRegistry::new());
        let menus = Arc::new(MenuRegistry::new());
        menus.register(
            SHOW_LOG_MENU_ID,
            Arc::new(|| tracing::info!("Log console requested from host menu")),
        );
        let shutdown = CancellationToken::new();
        let router = Arc::new(
            InboundRouter::new(
                Arc::clone(&correlator),
                Arc::clone(&callbacks),
                Arc::clone(&menus),
                queue.sender(),
                shutdown.clone(),
            )
            .with_network_debug(config.network_debug)
            .with_read_timeout(config.read_timeout),
        );

        Self {
            inner: Arc::new(BridgeInner {
                objects: Arc::new(ObjectModel::new(Arc::clone(&correlator))),
                config,
                link,
                correlator,
                callbacks,
                menus,
                queue,
                router,
                shutdown,
                tasks: Mutex::new(Vec::new()),
                local_port: Mutex::new(None),
            }),
        }
    }

    /// Connect to a host listening on `remote_port` on localhost.
    pub async fn start(remote_port: u16, config: BridgeConfig) -> Result<Self, BridgeError> {
        Self::start_with_terminator(remote_port, config, Arc::new(ProcessExit)).await
    }

    /// Startup sequence: bind, report the port to the host, accept inbound
    /// connections, then begin heartbeats. Heartbeats only start once the
    /// host has acknowledged the port, so a host that never comes up is a
    /// startup error rather than a heartbeat exit.
    pub async fn start_with_terminator(
        remote_port: u16,
        config: BridgeConfig,
        terminator: Arc<dyn Terminator>,
    ) -> Result<Self, BridgeError> {
        let endpoint =
            HostEndpoint::localhost(remote_port).with_network_debug(config.network_debug);
        let bridge = Self::new(Arc::new(endpoint.clone()), config.clone());

        let registered = BoundListener::bind().await?.register(&endpoint).await?;
        let port = registered.port();
        let listener = registered.listen(bridge.router(), bridge.shutdown_token());
        let heartbeat = HeartbeatMonitor::new(endpoint, &config)
            .with_terminator(terminator)
            .spawn(bridge.shutdown_token());

        *bridge.inner.local_port.lock().unwrap_or_else(PoisonError::into_inner) = Some(port);
        bridge
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([listener, heartbeat]);

        tracing::info!(local_port = port, remote_port, "Bridge started");
        Ok(bridge)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.inner.config
    }

    /// Port the inbound listener is bound to, once started.
    pub fn local_port(&self) -> Option<u16> {
        *self.inner.local_port.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.inner.correlator
    }

    pub fn objects(&self) -> &Arc<ObjectModel> {
        &self.inner.objects
    }

    pub fn router(&self) -> Arc<InboundRouter> {
        Arc::clone(&self.inner.router)
    }

    pub fn main_queue(&self) -> &Arc<MainThreadQueue> {
        &self.inner.queue
    }

    pub fn callbacks(&self) -> &Arc<CallbackRegistry> {
        &self.inner.callbacks
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    // Panel

    /// Remove every button from the panel. Registered callbacks are dropped
    /// once the host confirms.
    pub async fn clear_panel(&self) -> Result<(), BridgeError> {
        let payload = self.inner.correlator.call(&Operation::ClearPanel).await?;
        check_ack(&payload)?;
        self.inner.callbacks.clear();
        Ok(())
    }

    pub async fn set_message(&self, text: &str) -> Result<(), BridgeError> {
        let payload = self
            .inner
            .correlator
            .call(&Operation::SetMessage {
                message: text.to_string(),
            })
            .await?;
        check_ack(&payload)
    }

    /// Add a button and bind `callback` to the uid the host assigns it.
    pub async fn add_button<F>(&self, label: &str, callback: F) -> Result<String, BridgeError>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let value = self
            .inner
            .correlator
            .call_value(&Operation::AddButton {
                label: label.to_string(),
            })
            .await?;
        let uid = match value {
            Value::String(uid) => uid,
            other => {
                return Err(BridgeError::decoding(format!(
                    "addbutton returned a {} instead of a callback uid",
                    other.kind()
                )));
            }
        };
        tracing::debug!(%uid, label, "Registered button callback");
        self.inner.callbacks.register(uid.clone(), Arc::new(callback));
        Ok(uid)
    }

    // Objects

    pub async fn construct(&self, cls: &str, args: Vec<Value>) -> Result<RemoteObject, BridgeError> {
        self.inner.objects.construct(cls, args).await
    }

    /// Proxy for `cls`, either wrapping `uid` or constructing from `args`.
    pub async fn instantiate(
        &self,
        cls: &str,
        uid: Option<String>,
        args: Vec<Value>,
    ) -> Result<RemoteObject, BridgeError> {
        let init = ObjectInit::from_parts(uid, args)?;
        self.inner.objects.instantiate(cls, init).await
    }

    pub async fn attach(&self, handle: RemoteObjectHandle) -> Result<RemoteObject, BridgeError> {
        self.inner.objects.attach(handle).await
    }

    pub async fn static_property(&self, cls: &str, name: &str) -> Result<Value, BridgeError> {
        self.inner.objects.static_property(cls, name).await
    }

    /// Static property that holds a host object, wrapped as a proxy.
    pub async fn static_object(&self, cls: &str, name: &str) -> Result<RemoteObject, BridgeError> {
        match self.static_property(cls, name).await? {
            Value::Object(handle) => self.attach(handle).await,
            other => Err(BridgeError::decoding(format!(
                "static {cls}.{name} is a {}, not an object",
                other.kind()
            ))),
        }
    }

    /// The host application object.
    pub async fn application(&self) -> Result<RemoteObject, BridgeError> {
        self.static_object(PHOTOSHOP_CLASS, "app").await
    }

    // Menus and control messages

    pub fn on_menu<F>(&self, id: &str, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.menus.register(id, Arc::new(handler) as Callback);
    }

    /// Replace the built-in "show log" menu action.
    pub fn on_show_log<F>(&self, handler: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_menu(SHOW_LOG_MENU_ID, handler);
    }

    /// Ask the host to bring the controller's window to the front.
    pub async fn request_foreground(&self) -> Result<(), BridgeError> {
        self.send_control(Message::ActivatePython).await
    }

    /// Tell the host the controller is going away.
    pub async fn send_quit(&self) -> Result<(), BridgeError> {
        self.send_control(Message::Quit).await
    }

    async fn send_control(&self, message: Message) -> Result<(), BridgeError> {
        trace_frame(self.inner.config.network_debug, "out", &message);
        self.inner.link.send(message).await
    }

    /// Stop the listener and heartbeat. In-flight calls run to their own
    /// completion or timeout.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Wait for background tasks after [`Bridge::shutdown`] (or an inbound
    /// Quit).
    pub async fn join(&self) {
        self.inner.shutdown.cancelled().await;
        let tasks: Vec<_> = self
            .inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::HostEnvelope;
    use crate::correlator::tests::{ChannelLink, request_of};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn config() -> BridgeConfig {
        BridgeConfig {
            request_timeout: Duration::from_secs(5),
            wait_slice: Duration::from_millis(10),
            ..BridgeConfig::default()
        }
    }

    /// Answers requests through the bridge's own router, the way the listener
    /// would; control messages are forwarded to the test.
    fn bridge_with_host<F>(respond: F) -> (Bridge, mpsc::UnboundedReceiver<Message>)
    where
        F: Fn(&Operation) -> String + Send + 'static,
    {
        let (link, mut sent) = ChannelLink::new();
        let bridge = Bridge::new(link, config());
        let router = bridge.router();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(message) = sent.recv().await {
                if !matches!(message, Message::Request(_)) {
                    let _ = control_tx.send(message);
                    continue;
                }
                let (envelope, op) = request_of(message);
                let reply = HostEnvelope::RequestResponse {
                    uid: envelope.uid.to_string(),
                    data: respond(&op),
                };
                router.route(Message::Response(reply.to_xml())).unwrap();
            }
        });
        (bridge, control_rx)
    }

    fn panel_host(op: &Operation) -> String {
        match op {
            Operation::AddButton { label } => {
                format!(r#"{{"type":"String","value":"btn-{}"}}"#, label.to_lowercase())
            }
            _ => String::new(),
        }
    }

    #[tokio::test]
    async fn add_button_binds_callback_to_host_uid() {
        let (bridge, _control) = bridge_with_host(panel_host);
        let count = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&count);

        let uid = bridge
            .add_button("Save", move || {
                hits.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        assert_eq!(uid, "btn-save");

        bridge
            .router()
            .route_envelope(HostEnvelope::Callback { uid })
            .unwrap();
        assert_eq!(bridge.main_queue().run_pending(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_panel_drops_callbacks() {
        let (bridge, _control) = bridge_with_host(panel_host);
        bridge.add_button("A", || {}).await.unwrap();
        bridge.add_button("B", || {}).await.unwrap();
        assert_eq!(bridge.callbacks().len(), 2);

        bridge.clear_panel().await.unwrap();
        assert!(bridge.callbacks().is_empty());
        bridge.set_message("done").await.unwrap();
    }

    #[tokio::test]
    async fn failed_clear_keeps_callbacks() {
        let (bridge, _control) = bridge_with_host(|op| match op {
            Operation::ClearPanel => r#"{"type":"error","stack":"panel closed"}"#.to_string(),
            other => panel_host(other),
        });
        bridge.add_button("A", || {}).await.unwrap();

        assert!(matches!(
            bridge.clear_panel().await,
            Err(BridgeError::Remote { .. })
        ));
        assert_eq!(bridge.callbacks().len(), 1);
    }

    #[tokio::test]
    async fn add_button_rejects_non_string_uid() {
        let (bridge, _control) = bridge_with_host(|_| r#"{"type":"int","value":3}"#.to_string());
        assert!(matches!(
            bridge.add_button("X", || {}).await,
            Err(BridgeError::Decoding(_))
        ));
        assert!(bridge.callbacks().is_empty());
    }

    #[tokio::test]
    async fn uid_with_args_is_rejected_before_any_request() {
        let (bridge, _control) = bridge_with_host(panel_host);
        assert!(matches!(
            bridge
                .instantiate("Document", Some("doc-1".into()), vec![Value::Int(1)])
                .await,
            Err(BridgeError::Usage(_))
        ));
        assert_eq!(bridge.correlator().pending_count(), 0);
    }

    #[tokio::test]
    async fn control_messages_go_straight_to_the_host() {
        let (bridge, mut control) = bridge_with_host(panel_host);
        bridge.request_foreground().await.unwrap();
        bridge.send_quit().await.unwrap();
        assert_eq!(control.recv().await.unwrap(), Message::ActivatePython);
        assert_eq!(control.recv().await.unwrap(), Message::Quit);
    }

    #[tokio::test]
    async fn show_log_handler_can_be_replaced() {
        let (bridge, _control) = bridge_with_host(panel_host);
        let count = Arc::new(AtomicUsize::new(0));
        let hits = Arc::clone(&count);
        bridge.on_show_log(move || {
            hits.fetch_add(1, Ordering::SeqCst);
        });

        bridge
            .router()
            .route_envelope(HostEnvelope::MenuClick {
                id: SHOW_LOG_MENU_ID.to_string(),
            })
            .unwrap();
        bridge.main_queue().run_pending();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn inbound_quit_cancels_shutdown() {
        let (bridge, _control) = bridge_with_host(panel_host);
        bridge.router().route(Message::Quit).unwrap();
        tokio::time::timeout(Duration::from_secs(1), bridge.join())
            .await
            .unwrap();
        assert!(bridge.shutdown_token().is_cancelled());
    }
}
