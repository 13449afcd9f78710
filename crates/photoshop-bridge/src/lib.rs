//! photoshop-bridge: controller side of the Photoshop host RPC bridge.

mod config;
mod correlator;
mod dispatch;
mod error;
mod heartbeat;
mod listener;
mod proxy;
mod pump;

pub mod blocking;
pub mod bridge;
pub mod client;
pub mod marshal;

pub use blocking::{BlockingBridge, BlockingObject};
pub use client::{Bridge, PHOTOSHOP_CLASS};
pub use config::BridgeConfig;
pub use correlator::Correlator;
pub use dispatch::{Callback, CallbackRegistry, InboundRouter, MenuRegistry, SHOW_LOG_MENU_ID};
pub use error::{BridgeError, Result};
pub use heartbeat::{HeartbeatMonitor, HeartbeatOutcome, ProcessExit, Terminator};
pub use listener::{BoundListener, RegisteredListener, handle_connection};
pub use marshal::{RemoteObjectHandle, Value};
pub use proxy::{Access, ClassDescriptor, Member, ObjectInit, ObjectModel, RemoteMethod, RemoteObject};
pub use pump::{EventPump, MainThreadQueue, MainThreadSender};

pub const BRIDGE_VERSION: &str = env!("CARGO_PKG_VERSION");
