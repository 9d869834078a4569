//! Per-resource session state machine.
//!
//! A [`ResourceSession`] owns everything one embedded app talks through: the
//! guest channel, the outbound pending-request table, the passthrough calls in
//! flight and the `initialized` flag. It is driven either directly (every
//! method is synchronous) or through [`ResourceSession::spawn`], which moves it
//! onto a task that processes [`SessionEvent`]s strictly in arrival order.

use std::collections::HashSet;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use url::Url;

use crate::broadcaster::{HostContextBroadcaster, SizeRequestCallback};
use crate::channel::GuestChannel;
use crate::config::BridgeConfig;
use crate::envelope::{
    MessageEnvelope, Params, RpcError, RpcNotification, RpcRequest, RpcResponse, params_from,
    params_into,
};
use crate::error::{BridgeError, Result};
use crate::pending::PendingRequests;
use crate::proxy::{ConnectionInfoProvider, ProxyResolver};
use crate::relay::{ToolLifecycleEvent, ToolLifecycleRelay, ToolLifecycleState};
use crate::types::{
    AppResource, HostCapabilities, HostContext, HostInfo, InitializeResult, MessageParams,
    OpenLinkParams, RequestId, ResourceTeardownParams, SandboxResourceReadyParams,
    SizeChangedParams, Theme, ToolResultParams, methods,
};

/// Guest requests forwarded verbatim to the backend router.
pub const PASSTHROUGH_METHODS: &[&str] = &[
    "tools/call",
    "resources/list",
    "resources/templates/list",
    "resources/read",
    "prompts/list",
    "notifications/message",
    "ping",
];

/// Guest requests serviced by the host itself when [`HostActions`] is installed.
pub const HOST_ACTION_METHODS: &[&str] = &[methods::OPEN_LINK, methods::MESSAGE];

pub const SUPPORTED_GUEST_NOTIFICATION_METHODS: &[&str] = &[
    methods::SANDBOX_READY,
    methods::INITIALIZED,
    methods::SIZE_CHANGED,
];

pub const SUPPORTED_HOST_NOTIFICATION_METHODS: &[&str] = &[
    methods::SANDBOX_RESOURCE_READY,
    methods::HOST_CONTEXT_CHANGED,
    methods::TOOL_INPUT,
    methods::TOOL_INPUT_PARTIAL,
    methods::TOOL_RESULT,
    methods::TOOL_CANCELLED,
];

pub const SUPPORTED_HOST_REQUEST_METHODS: &[&str] = &[methods::RESOURCE_TEARDOWN];

/// Router into the live tool/session backend.
#[async_trait]
pub trait PassthroughDispatcher: Send + Sync {
    async fn dispatch(&self, method: &str, params: Option<Value>) -> anyhow::Result<Value>;
}

/// Host-side handlers behind the advertised `links` and `messages` capabilities.
#[async_trait]
pub trait HostActions: Send + Sync {
    async fn open_link(&self, params: OpenLinkParams) -> anyhow::Result<()>;

    async fn send_message(&self, params: MessageParams) -> anyhow::Result<()>;
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Created,
    AwaitingGuestReady,
    AwaitingGuestInit,
    Initialized,
    TornDown,
}

impl SessionState {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::AwaitingGuestReady => "awaiting_guest_ready",
            Self::AwaitingGuestInit => "awaiting_guest_init",
            Self::Initialized => "initialized",
            Self::TornDown => "torn_down",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionOptions {
    pub host_info: HostInfo,
    pub protocol_version: String,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&BridgeConfig::default())
    }
}

impl From<&BridgeConfig> for SessionOptions {
    fn from(config: &BridgeConfig) -> Self {
        Self {
            host_info: config.host_info(),
            protocol_version: config.protocol_version.clone(),
        }
    }
}

/// A finished passthrough call: the guest request id and the backend outcome.
pub type Completion = (RequestId, anyhow::Result<Value>);

pub struct ResourceSession {
    resource: AppResource,
    proxy_url: Option<Url>,
    state: SessionState,
    initialized: bool,
    channel: Option<GuestChannel>,
    pending: PendingRequests,
    in_flight: JoinSet<Completion>,
    live_guest_ids: HashSet<RequestId>,
    broadcaster: HostContextBroadcaster,
    relay: ToolLifecycleRelay,
    dispatcher: Arc<dyn PassthroughDispatcher>,
    host_actions: Option<Arc<dyn HostActions>>,
    options: SessionOptions,
}

impl ResourceSession {
    pub fn new(
        resource: AppResource,
        host_context: HostContext,
        dispatcher: Arc<dyn PassthroughDispatcher>,
        options: SessionOptions,
    ) -> Self {
        Self {
            resource,
            proxy_url: None,
            state: SessionState::Created,
            initialized: false,
            channel: None,
            pending: PendingRequests::new(),
            in_flight: JoinSet::new(),
            live_guest_ids: HashSet::new(),
            broadcaster: HostContextBroadcaster::new(host_context),
            relay: ToolLifecycleRelay::new(),
            dispatcher,
            host_actions: None,
            options,
        }
    }

    /// Resolves the delivery URL first; `None` means the resource must not be
    /// rendered.
    pub async fn prepare<P: ConnectionInfoProvider>(
        resolver: &ProxyResolver<P>,
        resource: AppResource,
        host_context: HostContext,
        dispatcher: Arc<dyn PassthroughDispatcher>,
        options: SessionOptions,
    ) -> Option<Self> {
        let proxy_url = resolver.resolve(resource.csp.as_ref()).await?;
        Some(Self::new(resource, host_context, dispatcher, options).with_proxy_url(proxy_url))
    }

    pub fn with_proxy_url(mut self, proxy_url: Url) -> Self {
        self.proxy_url = Some(proxy_url);
        self
    }

    pub fn with_host_actions(mut self, host_actions: Arc<dyn HostActions>) -> Self {
        self.host_actions = Some(host_actions);
        self
    }

    pub fn with_size_request_callback(mut self, callback: SizeRequestCallback) -> Self {
        self.broadcaster.set_size_request_callback(callback);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn resource(&self) -> &AppResource {
        &self.resource
    }

    pub fn proxy_url(&self) -> Option<&Url> {
        self.proxy_url.as_ref()
    }

    pub fn host_context(&self) -> &HostContext {
        self.broadcaster.context()
    }

    pub fn tool_state(&self) -> &ToolLifecycleState {
        self.relay.state()
    }

    pub fn pending_outbound(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight(&self) -> usize {
        self.live_guest_ids.len()
    }

    /// Wires the guest channel and starts observing host signals.
    pub fn attach(&mut self, channel: GuestChannel) -> Result<()> {
        if self.state != SessionState::Created {
            return Err(BridgeError::InvalidState {
                operation: "attach",
                state: self.state.label(),
            });
        }
        tracing::info!(uri = %self.resource.uri, channel = channel.label(), "Guest session attached");
        self.channel = Some(channel);
        self.broadcaster.start();
        self.state = SessionState::AwaitingGuestReady;
        Ok(())
    }

    /// Tears the session down. Safe to call any number of times; only the
    /// first call after initialization signals the guest.
    pub fn detach(&mut self, reason: Option<String>) {
        if self.state == SessionState::TornDown {
            return;
        }
        let _ = self.release(reason);
        self.state = SessionState::TornDown;
        tracing::info!(uri = %self.resource.uri, "Guest session torn down");
    }

    /// Swaps in a different resource. The current guest document is torn down
    /// as if detached, `initialized` resets, and the session restarts from
    /// `Created` on the same channel. Retained tool lifecycle values replay
    /// once the new document initializes. Returns `false` when the identity is
    /// unchanged or the session is already torn down.
    pub fn replace_resource(&mut self, resource: AppResource, proxy_url: Option<Url>) -> bool {
        if self.state == SessionState::TornDown || self.resource.same_identity(&resource) {
            return false;
        }
        let channel = self.release(Some("resource replaced".to_string()));
        tracing::info!(from = %self.resource.uri, to = %resource.uri, "Guest resource replaced");
        self.resource = resource;
        self.proxy_url = proxy_url;
        self.broadcaster.reset();
        self.relay.rearm();
        self.state = SessionState::Created;
        if let Some(channel) = channel
            && let Err(err) = self.attach(channel)
        {
            tracing::warn!(error = %err, "Failed to reattach guest channel");
        }
        true
    }

    pub fn handle_raw(&mut self, raw: &str) {
        if let Some(channel) = &self.channel {
            channel.log_inbound(raw);
        }
        match MessageEnvelope::decode(raw) {
            Ok(envelope) => self.handle_envelope(envelope),
            Err(err) => {
                tracing::debug!(error = %err, uri = %self.resource.uri, "Dropping malformed guest message");
            }
        }
    }

    pub fn handle_envelope(&mut self, envelope: MessageEnvelope) {
        if self.channel.is_none()
            || matches!(self.state, SessionState::Created | SessionState::TornDown)
        {
            tracing::debug!(state = self.state.label(), "Dropping guest message on detached session");
            return;
        }
        match envelope {
            MessageEnvelope::Request(request) => self.handle_request(request),
            MessageEnvelope::Notification(notification) => self.handle_notification(notification),
            MessageEnvelope::Response(response) => {
                let id = response.id.clone();
                if !self.pending.resolve(response) {
                    tracing::debug!(%id, "Guest response without pending request");
                }
            }
        }
    }

    pub fn theme_changed(&mut self, theme: Theme) {
        let outcome = self.broadcaster.theme_changed(theme, self.initialized);
        self.post_produced(outcome);
    }

    pub fn frame_resized(&mut self, width: f64, height: f64) {
        let outcome = self.broadcaster.frame_resized(width, height, self.initialized);
        self.post_produced(outcome);
    }

    pub fn host_viewport_changed(&mut self, max_width: f64, max_height: f64) {
        self.broadcaster.host_viewport_changed(max_width, max_height);
    }

    pub fn tool_event(&mut self, event: ToolLifecycleEvent) {
        let outcome = self.relay.record(event, self.initialized);
        self.post_produced(outcome);
    }

    /// Writes the response for a finished passthrough call. Completions for
    /// ids that are no longer live (the session was torn down) are dropped.
    pub fn complete(&mut self, id: RequestId, outcome: anyhow::Result<Value>) {
        if !self.live_guest_ids.remove(&id) {
            tracing::debug!(%id, "Dropping completion for request that is no longer live");
            return;
        }
        self.respond(id, outcome);
    }

    /// Waits for the next passthrough call to finish. `None` when nothing is in flight.
    pub async fn next_completion(&mut self) -> Option<Completion> {
        loop {
            match self.in_flight.join_next().await? {
                Ok(completion) => return Some(completion),
                Err(err) if err.is_cancelled() => {}
                Err(err) => {
                    tracing::warn!(error = %err, "Passthrough task failed");
                }
            }
        }
    }

    /// Moves the session onto its own task. Events sent through the returned
    /// handle are applied in order; the task ends (tearing the session down)
    /// on `detach` or once every handle is dropped, and yields the final
    /// session state.
    pub fn spawn(mut self, channel: GuestChannel) -> Result<(SessionHandle, JoinHandle<Self>)> {
        self.attach(channel)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(rx));
        Ok((SessionHandle { tx }, task))
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) -> Self {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(SessionEvent::Detach { reason }) => {
                        self.detach(reason);
                        break;
                    }
                    Some(event) => self.apply(event),
                    None => {
                        self.detach(None);
                        break;
                    }
                },
                Some((id, outcome)) = self.next_completion(), if !self.in_flight.is_empty() => {
                    self.complete(id, outcome);
                }
            }
        }
        self
    }

    fn apply(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Inbound(raw) => self.handle_raw(&raw),
            SessionEvent::FrameResized { width, height } => self.frame_resized(width, height),
            SessionEvent::HostViewportChanged {
                max_width,
                max_height,
            } => self.host_viewport_changed(max_width, max_height),
            SessionEvent::ThemeChanged(theme) => self.theme_changed(theme),
            SessionEvent::Tool(event) => self.tool_event(event),
            SessionEvent::ResourceChanged {
                resource,
                proxy_url,
            } => {
                self.replace_resource(resource, proxy_url);
            }
            SessionEvent::Detach { reason } => self.detach(reason),
        }
    }

    fn handle_notification(&mut self, notification: RpcNotification) {
        match notification.method.as_str() {
            methods::SANDBOX_READY => {
                if !matches!(
                    self.state,
                    SessionState::AwaitingGuestReady | SessionState::AwaitingGuestInit
                ) {
                    tracing::debug!(state = self.state.label(), "Ignoring late sandbox-ready");
                    return;
                }
                self.send_resource_ready();
                self.state = SessionState::AwaitingGuestInit;
            }
            methods::INITIALIZED => {
                if self.initialized {
                    return;
                }
                self.initialized = true;
                self.state = SessionState::Initialized;
                tracing::debug!(uri = %self.resource.uri, "Guest initialized");
                match self.relay.flush() {
                    Ok(notifications) => {
                        for notification in &notifications {
                            self.post(notification);
                        }
                    }
                    Err(err) => tracing::warn!(error = %err, "Failed to encode buffered tool state"),
                }
                let caught_up = self.broadcaster.catch_up();
                self.post_produced(caught_up);
            }
            methods::SIZE_CHANGED => {
                match params_into::<SizeChangedParams>(notification.params.as_ref()) {
                    Ok(params) => self.broadcaster.guest_size_changed(&params),
                    Err(err) => tracing::debug!(error = %err, "Dropping malformed size-changed"),
                }
            }
            other => tracing::debug!(method = other, "Dropping unrecognized guest notification"),
        }
    }

    fn handle_request(&mut self, request: RpcRequest) {
        let RpcRequest { id, method, params } = request;

        if method == methods::INITIALIZE {
            if self.initialized {
                tracing::debug!(%id, "Ignoring ui/initialize after initialization");
                return;
            }
            let result = self.initialize_result();
            let outcome = serde_json::to_value(result).map_err(anyhow::Error::from);
            self.respond(id, outcome);
            return;
        }

        if !self.initialized {
            tracing::debug!(%id, method = %method, "Dropping guest request before initialization");
            return;
        }
        if self.live_guest_ids.contains(&id) {
            tracing::warn!(%id, method = %method, "Dropping guest request reusing a live id");
            return;
        }

        let call: BoxFuture<'static, anyhow::Result<Value>> =
            if PASSTHROUGH_METHODS.contains(&method.as_str()) {
                let dispatcher = self.dispatcher.clone();
                let params = params.map(Value::Object);
                Box::pin(async move { dispatcher.dispatch(&method, params).await })
            } else if let Some(actions) = self.host_actions.clone()
                && HOST_ACTION_METHODS.contains(&method.as_str())
            {
                match host_action_call(actions, &method, params.as_ref()) {
                    Ok(call) => call,
                    Err(err) => {
                        self.respond(id, Err(err.into()));
                        return;
                    }
                }
            } else {
                tracing::debug!(%id, method = %method, "Dropping unrecognized guest request");
                return;
            };

        self.live_guest_ids.insert(id.clone());
        self.in_flight.spawn(async move {
            let outcome = AssertUnwindSafe(call)
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("internal error")));
            (id, outcome)
        });
    }

    fn initialize_result(&mut self) -> InitializeResult {
        InitializeResult {
            protocol_version: self.options.protocol_version.clone(),
            host_capabilities: HostCapabilities {
                links: true,
                messages: true,
            },
            host_info: self.options.host_info.clone(),
            host_context: self.broadcaster.initialize_snapshot(),
        }
    }

    fn send_resource_ready(&mut self) {
        let params = SandboxResourceReadyParams {
            html: self.resource.html.clone(),
            csp: self.resource.csp.clone().unwrap_or_default(),
        };
        let envelope = params_from(&params)
            .map(|params| MessageEnvelope::notification(methods::SANDBOX_RESOURCE_READY, params));
        self.post_produced(envelope.map(Some));
    }

    fn send_teardown(&mut self, reason: Option<String>) {
        let params = match params_from(&ResourceTeardownParams { reason }) {
            Ok(params) => params,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to encode teardown params");
                return;
            }
        };
        // The reply is never awaited; the entry is drained with the rest of the table.
        let (id, _reply) = self.pending.register();
        self.post(&MessageEnvelope::request(
            id,
            methods::RESOURCE_TEARDOWN,
            params,
        ));
    }

    /// Shared teardown path for detach and resource replacement. Hands back
    /// the channel so replacement can reattach it.
    fn release(&mut self, reason: Option<String>) -> Option<GuestChannel> {
        if self.initialized {
            self.send_teardown(reason);
        }
        self.broadcaster.stop();
        drop(std::mem::take(&mut self.in_flight));
        self.live_guest_ids.clear();
        let drained = self.pending.drain();
        if drained > 0 {
            tracing::debug!(drained, "Dropped pending guest requests");
        }
        self.initialized = false;
        self.channel.take()
    }

    fn respond(&self, id: RequestId, outcome: anyhow::Result<Value>) {
        let response = match outcome {
            Ok(result) => RpcResponse::success(id, result),
            Err(err) => RpcResponse::failure(id, RpcError::internal(err.to_string())),
        };
        self.post(&MessageEnvelope::Response(response));
    }

    fn post_produced(
        &self,
        produced: std::result::Result<Option<MessageEnvelope>, serde_json::Error>,
    ) {
        match produced {
            Ok(Some(envelope)) => self.post(&envelope),
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "Failed to encode guest notification"),
        }
    }

    fn post(&self, envelope: &MessageEnvelope) {
        let Some(channel) = &self.channel else {
            return;
        };
        if let Err(err) = channel.post(envelope) {
            tracing::warn!(error = %err, uri = %self.resource.uri, method = ?envelope.method(), "Failed to post to guest");
        }
    }
}

fn host_action_call(
    actions: Arc<dyn HostActions>,
    method: &str,
    params: Option<&Params>,
) -> std::result::Result<BoxFuture<'static, anyhow::Result<Value>>, serde_json::Error> {
    if method == methods::OPEN_LINK {
        let params: OpenLinkParams = params_into(params)?;
        Ok(Box::pin(async move {
            actions.open_link(params).await?;
            Ok(Value::Object(serde_json::Map::new()))
        }))
    } else {
        let params: MessageParams = params_into(params)?;
        Ok(Box::pin(async move {
            actions.send_message(params).await?;
            Ok(Value::Object(serde_json::Map::new()))
        }))
    }
}

/// Inputs to a running session, applied in the order they are sent.
#[derive(Debug)]
pub enum SessionEvent {
    /// Raw payload received from the guest.
    Inbound(String),
    FrameResized {
        width: f64,
        height: f64,
    },
    HostViewportChanged {
        max_width: f64,
        max_height: f64,
    },
    ThemeChanged(Theme),
    Tool(ToolLifecycleEvent),
    ResourceChanged {
        resource: AppResource,
        proxy_url: Option<Url>,
    },
    Detach {
        reason: Option<String>,
    },
}

/// Cloneable sender into a spawned session.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionHandle {
    pub fn send(&self, event: SessionEvent) -> Result<()> {
        self.tx.send(event).map_err(|_| BridgeError::SessionClosed)
    }

    pub fn deliver(&self, raw: impl Into<String>) -> Result<()> {
        self.send(SessionEvent::Inbound(raw.into()))
    }

    pub fn frame_resized(&self, width: f64, height: f64) -> Result<()> {
        self.send(SessionEvent::FrameResized { width, height })
    }

    pub fn host_viewport_changed(&self, max_width: f64, max_height: f64) -> Result<()> {
        self.send(SessionEvent::HostViewportChanged {
            max_width,
            max_height,
        })
    }

    pub fn theme_changed(&self, theme: Theme) -> Result<()> {
        self.send(SessionEvent::ThemeChanged(theme))
    }

    pub fn tool_input(&self, arguments: Value) -> Result<()> {
        self.send(SessionEvent::Tool(ToolLifecycleEvent::Input(arguments)))
    }

    pub fn tool_input_partial(&self, arguments: Value) -> Result<()> {
        self.send(SessionEvent::Tool(ToolLifecycleEvent::PartialInput(
            arguments,
        )))
    }

    pub fn tool_result(&self, result: ToolResultParams) -> Result<()> {
        self.send(SessionEvent::Tool(ToolLifecycleEvent::Result(result)))
    }

    pub fn tool_cancelled(&self, reason: Option<String>) -> Result<()> {
        self.send(SessionEvent::Tool(ToolLifecycleEvent::Cancelled { reason }))
    }

    pub fn replace_resource(&self, resource: AppResource, proxy_url: Option<Url>) -> Result<()> {
        self.send(SessionEvent::ResourceChanged {
            resource,
            proxy_url,
        })
    }

    pub fn detach(&self, reason: Option<String>) -> Result<()> {
        self.send(SessionEvent::Detach { reason })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
