//! Host/guest bridge for sandboxed MCP App resources.
//!
//! One [`ResourceSession`] per displayed resource:
//! - delivery URL resolution through the local proxy
//! - the `ui/initialize` handshake and host context broadcasts
//! - passthrough of guest requests to the tool backend
//! - buffered tool lifecycle notifications and best-effort teardown

pub mod broadcaster;
pub mod channel;
pub mod config;
pub mod envelope;
pub mod error;
pub mod pending;
pub mod proxy;
pub mod relay;
pub mod session;
pub mod types;
pub mod wire_log;

pub use broadcaster::{FrameSizeRequest, HostContextBroadcaster, SizeRequestCallback};
pub use channel::{GuestChannel, LineTransport};
pub use config::{BridgeConfig, ConfigError};
pub use envelope::{
    EnvelopeError, MessageEnvelope, RpcError, RpcNotification, RpcRequest, RpcResponse,
};
pub use error::{BridgeError, Result};
pub use pending::PendingRequests;
pub use proxy::{
    ConnectionInfo, ConnectionInfoProvider, ProxyRequest, ProxyResolver, StaticConnectionInfo,
};
pub use relay::{ToolLifecycleEvent, ToolLifecycleRelay, ToolLifecycleState};
pub use session::{
    HostActions, PassthroughDispatcher, ResourceSession, SessionEvent, SessionHandle,
    SessionOptions, SessionState,
};
pub use types::*;
