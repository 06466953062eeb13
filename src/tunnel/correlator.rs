//! RPC correlator: outstanding `requestId`s and their waiting callers.
//!
//! Owned exclusively by one channel actor, so it needs no locking. Each
//! pending entry is resolved exactly once: by its response, by
//! [`Correlator::expire`], by [`Correlator::cancel`], or by
//! [`Correlator::reject_all`] when the channel closes. Whichever comes first
//! removes the entry, so anything arriving later finds nothing to resolve.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::frame::{RpcResponse, RpcStatus};
use crate::error::RelayError;

pub type RpcResult = Result<Value, RelayError>;

struct PendingRequest {
    kind: &'static str,
    created_at: Instant,
    timeout: Duration,
    deadline: Instant,
    reply: oneshot::Sender<RpcResult>,
}

#[derive(Default)]
pub struct Correlator {
    pending: HashMap<String, PendingRequest>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new outstanding request.
    ///
    /// A duplicate `request_id` is rejected immediately and leaves the
    /// existing entry untouched.
    pub fn register(
        &mut self,
        request_id: String,
        kind: &'static str,
        timeout: Duration,
        reply: oneshot::Sender<RpcResult>,
    ) -> bool {
        if self.pending.contains_key(&request_id) {
            let _ = reply.send(Err(RelayError::Protocol(format!(
                "duplicate request id {request_id}"
            ))));
            return false;
        }
        let now = Instant::now();
        self.pending.insert(
            request_id,
            PendingRequest {
                kind,
                created_at: now,
                timeout,
                deadline: now + timeout,
                reply,
            },
        );
        true
    }

    /// Deliver a response envelope. Returns `false` for unknown, late or
    /// duplicate responses, which are dropped.
    pub fn resolve(&mut self, response: RpcResponse) -> bool {
        let Some(entry) = self.pending.remove(&response.request_id) else {
            warn!(
                request_id = %response.request_id,
                "Response arrived for timed-out or unknown request (dropped)"
            );
            return false;
        };
        debug!(
            request_id = %response.request_id,
            kind = entry.kind,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "RPC resolved"
        );
        let result = match response.status {
            RpcStatus::Success => Ok(response.data.unwrap_or(Value::Null)),
            RpcStatus::Error => Err(RelayError::from_remote(
                response.code.as_deref(),
                response.error.as_deref(),
            )),
        };
        // The caller may have given up already; that still counts as resolved.
        let _ = entry.reply.send(result);
        true
    }

    /// Drop an entry whose caller stopped waiting.
    pub fn cancel(&mut self, request_id: &str) -> bool {
        self.pending.remove(request_id).is_some()
    }

    /// Push an entry's deadline out by its full timeout from `now`.
    ///
    /// Streaming responses call this on every chunk, so the timeout bounds
    /// the gap between chunks instead of the whole transfer.
    pub fn touch(&mut self, request_id: &str, now: Instant) -> bool {
        match self.pending.get_mut(request_id) {
            Some(entry) => {
                entry.deadline = now + entry.timeout;
                true
            }
            None => false,
        }
    }

    /// Reject every entry whose deadline has passed. Returns how many expired.
    pub fn expire(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(entry) = self.pending.remove(id) {
                warn!(request_id = %id, kind = entry.kind, "RPC timed out");
                let _ = entry.reply.send(Err(RelayError::Timeout(entry.timeout)));
            }
        }
        expired.len()
    }

    /// Reject everything, used when the owning channel closes.
    pub fn reject_all(&mut self, reason: &str) -> usize {
        let count = self.pending.len();
        for (_, entry) in self.pending.drain() {
            let _ = entry
                .reply
                .send(Err(RelayError::ChannelLoss(reason.to_string())));
        }
        count
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.pending.contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn register(c: &mut Correlator, id: &str, timeout: Duration) -> oneshot::Receiver<RpcResult> {
        let (tx, rx) = oneshot::channel();
        assert!(c.register(id.to_string(), "EXEC_COMMAND", timeout, tx));
        rx
    }

    #[tokio::test]
    async fn test_exactly_one_resolution() {
        let mut c = Correlator::new();
        let rx = register(&mut c, "r1", Duration::from_secs(5));

        assert!(c.resolve(RpcResponse::success("r1", json!({"n": 1}))));
        assert!(!c.resolve(RpcResponse::success("r1", json!({"n": 2}))));
        assert!(!c.resolve(RpcResponse::error("r1", "X", "late")));

        assert_eq!(rx.await.unwrap().unwrap(), json!({"n": 1}));
        assert!(c.is_empty());
    }

    #[tokio::test]
    async fn test_error_envelope_maps_code() {
        let mut c = Correlator::new();
        let rx = register(&mut c, "r1", Duration::from_secs(5));
        c.resolve(RpcResponse::error("r1", "JAIL_VIOLATION", "../../etc"));
        assert!(matches!(
            rx.await.unwrap(),
            Err(RelayError::JailViolation(_))
        ));
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let mut c = Correlator::new();
        let first = register(&mut c, "r1", Duration::from_secs(5));
        let (tx, second) = oneshot::channel();
        assert!(!c.register("r1".into(), "FILE_ACTION", Duration::from_secs(5), tx));
        assert!(matches!(second.await.unwrap(), Err(RelayError::Protocol(_))));

        c.resolve(RpcResponse::success("r1", json!(null)));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_expire_only_past_deadline() {
        let mut c = Correlator::new();
        let short = register(&mut c, "short", Duration::from_millis(0));
        let _long = register(&mut c, "long", Duration::from_secs(60));

        assert_eq!(c.expire(Instant::now()), 1);
        assert_eq!(c.len(), 1);
        assert!(matches!(short.await.unwrap(), Err(RelayError::Timeout(_))));
        // Late response for the expired id is dropped.
        assert!(!c.resolve(RpcResponse::success("short", json!(null))));
    }

    #[tokio::test]
    async fn test_touch_extends_deadline() {
        let mut c = Correlator::new();
        let rx = register(&mut c, "dl", Duration::from_secs(1));
        let start = Instant::now();

        assert!(c.touch("dl", start + Duration::from_millis(800)));
        // Past the original deadline, inside the refreshed one.
        assert_eq!(c.expire(start + Duration::from_millis(1500)), 0);
        assert!(c.contains("dl"));

        assert_eq!(c.expire(start + Duration::from_millis(1900)), 1);
        assert!(matches!(rx.await.unwrap(), Err(RelayError::Timeout(d)) if d == Duration::from_secs(1)));
        assert!(!c.touch("dl", Instant::now()));
    }

    #[tokio::test]
    async fn test_reject_all_on_channel_loss() {
        let mut c = Correlator::new();
        let rxs: Vec<_> = (0..3)
            .map(|i| register(&mut c, &format!("r{i}"), Duration::from_secs(60)))
            .collect();
        assert_eq!(c.reject_all("closed"), 3);
        for rx in rxs {
            assert!(matches!(rx.await.unwrap(), Err(RelayError::ChannelLoss(_))));
        }
        assert_eq!(c.reject_all("again"), 0);
    }

    #[test]
    fn test_cancel() {
        let mut c = Correlator::new();
        let _rx = register(&mut c, "r1", Duration::from_secs(5));
        assert!(c.cancel("r1"));
        assert!(!c.cancel("r1"));
        assert!(!c.resolve(RpcResponse::success("r1", Value::Null)));
    }
}
