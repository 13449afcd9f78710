//! Routing of inbound messages.
//!
//! Each accepted connection carries one message. Responses to pending
//! requests go to the correlator; button callbacks and menu clicks are
//! posted to the main-thread queue; app events are only logged.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::Message;
use crate::bridge::protocol::HostEnvelope;
use crate::correlator::Correlator;
use crate::error::BridgeError;
use crate::pump::MainThreadSender;

/// Callable registered for a panel button or menu item.
pub type Callback = Arc<dyn Fn() + Send + Sync + 'static>;

/// Menu id the host sends when the user asks for the log console.
pub const SHOW_LOG_MENU_ID: &str = "show_log";

/// Host-issued callback uid -> local callable.
///
/// Cleared wholesale when the panel is cleared; never invalidated per id.
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: DashMap<String, Callback>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, uid: impl Into<String>, callback: Callback) {
        self.callbacks.insert(uid.into(), callback);
    }

    pub fn get(&self, uid: &str) -> Option<Callback> {
        self.callbacks.get(uid).map(|c| Arc::clone(c.value()))
    }

    pub fn clear(&self) {
        self.callbacks.clear();
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

/// Menu id -> handler.
#[derive(Default)]
pub struct MenuRegistry {
    handlers: DashMap<String, Callback>,
}

impl MenuRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: impl Into<String>, handler: Callback) {
        self.handlers.insert(id.into(), handler);
    }

    pub fn get(&self, id: &str) -> Option<Callback> {
        self.handlers.get(id).map(|h| Arc::clone(h.value()))
    }
}

/// Shared state every connection handler needs.
pub struct InboundRouter {
    correlator: Arc<Correlator>,
    callbacks: Arc<CallbackRegistry>,
    menus: Arc<MenuRegistry>,
    main_thread: MainThreadSender,
    shutdown: CancellationToken,
    network_debug: bool,
    read_timeout: Duration,
}

impl InboundRouter {
    pub fn new(
        correlator: Arc<Correlator>,
        callbacks: Arc<CallbackRegistry>,
        menus: Arc<MenuRegistry>,
        main_thread: MainThreadSender,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            correlator,
            callbacks,
            menus,
            main_thread,
            shutdown,
            network_debug: false,
            read_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_network_debug(mut self, enabled: bool) -> Self {
        self.network_debug = enabled;
        self
    }

    pub fn network_debug(&self) -> bool {
        self.network_debug
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Longest time a connection may take to deliver its message.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Dispatch one inbound message. Ping is answered by the connection
    /// handler, which owns the socket.
    pub fn route(&self, message: Message) -> Result<(), BridgeError> {
        match message {
            Message::Response(xml) => self.route_envelope(HostEnvelope::parse(&xml)?),
            Message::Quit => {
                tracing::info!("Host requested quit, shutting down bridge");
                self.shutdown.cancel();
                Ok(())
            }
            other => Err(BridgeError::Protocol(format!(
                "unexpected inbound {:?} message",
                other.message_type()
            ))),
        }
    }

    pub fn route_envelope(&self, envelope: HostEnvelope) -> Result<(), BridgeError> {
        match envelope {
            HostEnvelope::RequestResponse { uid, data } => {
                self.correlator.deliver(&uid, data);
            }
            HostEnvelope::Callback { uid } => {
                tracing::debug!(%uid, "Callback");
                match self.callbacks.get(&uid) {
                    Some(callback) => self.post(callback),
                    None => tracing::warn!(%uid, "No callback registered for uid"),
                }
            }
            HostEnvelope::MenuClick { id } => {
                tracing::debug!(%id, "Menu click");
                match self.menus.get(&id) {
                    Some(handler) => self.post(handler),
                    None => tracing::warn!(%id, "No handler for menu item"),
                }
            }
            HostEnvelope::AppEvent { event } => {
                tracing::debug!(%event, "App event");
            }
        }
        Ok(())
    }

    fn post(&self, callback: Callback) {
        if !self.main_thread.post(Box::new(move || callback())) {
            tracing::warn!("Main-thread queue is gone, dropping callback");
        }
    }
}
