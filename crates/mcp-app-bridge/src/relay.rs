//! Tool lifecycle relay.
//!
//! Tool input, partial input, result and cancellation arrive from the
//! surrounding application whenever the active tool call progresses. Nothing
//! reaches the guest before it has completed the handshake; values recorded
//! earlier are held here and flushed once, right after initialization.

use serde_json::Value;

use crate::envelope::{MessageEnvelope, params_from};
use crate::types::{ToolCancelledParams, ToolInputParams, ToolResultParams, methods};

#[derive(Debug, Clone, PartialEq)]
pub enum ToolLifecycleEvent {
    Input(Value),
    PartialInput(Value),
    Result(ToolResultParams),
    Cancelled { reason: Option<String> },
}

impl ToolLifecycleEvent {
    pub const fn method(&self) -> &'static str {
        match self {
            Self::Input(_) => methods::TOOL_INPUT,
            Self::PartialInput(_) => methods::TOOL_INPUT_PARTIAL,
            Self::Result(_) => methods::TOOL_RESULT,
            Self::Cancelled { .. } => methods::TOOL_CANCELLED,
        }
    }

    fn to_notification(&self) -> Result<MessageEnvelope, serde_json::Error> {
        let params = match self {
            Self::Input(arguments) | Self::PartialInput(arguments) => params_from(&ToolInputParams {
                arguments: arguments.clone(),
            })?,
            Self::Result(result) => params_from(result)?,
            Self::Cancelled { reason } => params_from(&ToolCancelledParams {
                reason: reason.clone(),
            })?,
        };
        Ok(MessageEnvelope::notification(self.method(), params))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Slot<T> {
    value: Option<T>,
    delivered: bool,
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self {
            value: None,
            delivered: false,
        }
    }
}

impl<T> Slot<T> {
    fn store(&mut self, value: T) {
        self.value = Some(value);
        self.delivered = false;
    }

    fn pending(&self) -> Option<&T> {
        if self.delivered {
            None
        } else {
            self.value.as_ref()
        }
    }

    fn rearm(&mut self) {
        self.delivered = false;
    }
}

/// Last-known tool lifecycle values for one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolLifecycleState {
    input: Slot<Value>,
    partial_input: Slot<Value>,
    result: Slot<ToolResultParams>,
    cancelled: Slot<Option<String>>,
}

impl ToolLifecycleState {
    pub fn input(&self) -> Option<&Value> {
        self.input.value.as_ref()
    }

    pub fn partial_input(&self) -> Option<&Value> {
        self.partial_input.value.as_ref()
    }

    pub fn result(&self) -> Option<&ToolResultParams> {
        self.result.value.as_ref()
    }

    pub fn cancellation(&self) -> Option<Option<&str>> {
        self.cancelled.value.as_ref().map(Option::as_deref)
    }

    pub fn has_pending(&self) -> bool {
        self.input.pending().is_some()
            || self.partial_input.pending().is_some()
            || self.result.pending().is_some()
            || self.cancelled.pending().is_some()
    }
}

#[derive(Debug, Default)]
pub struct ToolLifecycleRelay {
    state: ToolLifecycleState,
}

impl ToolLifecycleRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ToolLifecycleState {
        &self.state
    }

    /// Stores the event and, when the guest is initialized, returns the
    /// notification to forward immediately.
    pub fn record(
        &mut self,
        event: ToolLifecycleEvent,
        initialized: bool,
    ) -> Result<Option<MessageEnvelope>, serde_json::Error> {
        let notification = if initialized {
            Some(event.to_notification()?)
        } else {
            None
        };

        match event {
            ToolLifecycleEvent::Input(arguments) => {
                self.state.input.store(arguments);
                // A complete input supersedes whatever partial input streamed before it.
                self.state.partial_input = Slot::default();
            }
            ToolLifecycleEvent::PartialInput(arguments) => self.state.partial_input.store(arguments),
            ToolLifecycleEvent::Result(result) => self.state.result.store(result),
            ToolLifecycleEvent::Cancelled { reason } => self.state.cancelled.store(reason),
        }

        if notification.is_some() {
            self.mark_all_delivered();
        }
        Ok(notification)
    }

    /// Drains everything recorded while the guest was not yet initialized:
    /// input (or the latest partial input when no complete input exists),
    /// then result, then cancellation.
    pub fn flush(&mut self) -> Result<Vec<MessageEnvelope>, serde_json::Error> {
        let mut events = Vec::new();
        if let Some(arguments) = self.state.input.pending() {
            events.push(ToolLifecycleEvent::Input(arguments.clone()));
        } else if let Some(arguments) = self.state.partial_input.pending() {
            events.push(ToolLifecycleEvent::PartialInput(arguments.clone()));
        }
        if let Some(result) = self.state.result.pending() {
            events.push(ToolLifecycleEvent::Result(result.clone()));
        }
        if let Some(reason) = self.state.cancelled.pending() {
            events.push(ToolLifecycleEvent::Cancelled {
                reason: reason.clone(),
            });
        }

        let notifications = events
            .iter()
            .map(ToolLifecycleEvent::to_notification)
            .collect::<Result<Vec<_>, _>>()?;
        self.mark_all_delivered();
        Ok(notifications)
    }

    /// Marks retained values undelivered so the next initialization replays them.
    pub fn rearm(&mut self) {
        self.state.input.rearm();
        self.state.partial_input.rearm();
        self.state.result.rearm();
        self.state.cancelled.rearm();
    }

    fn mark_all_delivered(&mut self) {
        self.state.input.delivered = true;
        self.state.partial_input.delivered = true;
        self.state.result.delivered = true;
        self.state.cancelled.delivered = true;
    }
}
