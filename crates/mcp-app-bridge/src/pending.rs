//! Outbound request correlation table.

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::envelope::{ResponseOutcome, RpcError, RpcResponse};
use crate::types::RequestId;

pub type PendingReply = oneshot::Receiver<Result<Value, RpcError>>;
type PendingSender = oneshot::Sender<Result<Value, RpcError>>;

/// Requests this host has sent to the guest and not yet seen answered.
///
/// Ids come from a monotonically increasing counter, so an id is never handed
/// out twice within a session. Entries leave the table exactly once, either
/// when the matching response arrives or when the table is drained.
#[derive(Debug)]
pub struct PendingRequests {
    next_id: i64,
    entries: HashMap<RequestId, PendingSender>,
}

impl Default for PendingRequests {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingRequests {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
        }
    }

    pub fn register(&mut self) -> (RequestId, PendingReply) {
        let id = RequestId::Integer(self.next_id);
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.entries.insert(id.clone(), tx);
        (id, rx)
    }

    /// Resolves the entry for `response.id`. Returns `false` when no entry is live.
    pub fn resolve(&mut self, response: RpcResponse) -> bool {
        let Some(sender) = self.entries.remove(&response.id) else {
            return false;
        };
        let outcome = match response.outcome {
            ResponseOutcome::Result(value) => Ok(value),
            ResponseOutcome::Error(error) => Err(error),
        };
        let _ = sender.send(outcome);
        true
    }

    /// Drops every live entry; waiting receivers observe cancellation.
    pub fn drain(&mut self) -> usize {
        let count = self.entries.len();
        self.entries.clear();
        count
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ids_are_unique_while_live() {
        let mut pending = PendingRequests::new();
        let (first, _rx1) = pending.register();
        let (second, _rx2) = pending.register();
        assert_ne!(first, second);
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn response_resolves_entry_exactly_once() -> anyhow::Result<()> {
        let mut pending = PendingRequests::new();
        let (id, rx) = pending.register();

        assert!(pending.resolve(RpcResponse::success(id.clone(), json!({"ok": true}))));
        assert!(!pending.resolve(RpcResponse::success(id.clone(), json!({"ok": false}))));
        assert!(!pending.contains(&id));

        let value = rx.await?.map_err(|error| anyhow::anyhow!(error.message))?;
        assert_eq!(value, json!({"ok": true}));
        Ok(())
    }

    #[tokio::test]
    async fn error_response_reaches_waiter() -> anyhow::Result<()> {
        let mut pending = PendingRequests::new();
        let (id, rx) = pending.register();
        assert!(pending.resolve(RpcResponse::failure(id, RpcError::internal("boom"))));

        let outcome = rx.await?;
        assert_eq!(outcome.err().map(|error| error.message), Some("boom".into()));
        Ok(())
    }

    #[tokio::test]
    async fn drain_cancels_waiters() {
        let mut pending = PendingRequests::new();
        let (_id, rx) = pending.register();
        assert_eq!(pending.drain(), 1);
        assert!(pending.is_empty());
        assert!(rx.await.is_err());
    }
}
