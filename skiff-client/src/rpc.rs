//! Request correlation for the filesystem channel
//!
//! Every RPC carries a client-assigned `req_id`; responses echo it back.
//! The [`Correlator`] owns the pending map: it hands out ids, parks a
//! oneshot per in-flight call, and routes each response to its waiter.
//! Responses arriving after their waiter gave up are dropped without
//! effect, so a slow server cannot resolve the wrong call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::oneshot;

use skiff_protocol::{encode_request, FsEvent, FsOp, FsRequest};
use skiff_utils::{Result, SkiffError};

use crate::transport::{Frame, FrameSender};

/// How long a call waits for its response before failing
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(20);

type Pending = HashMap<u64, oneshot::Sender<FsEvent>>;

/// Shared pending-request table for one filesystem connection
#[derive(Clone)]
pub struct Correlator {
    next_id: Arc<AtomicU64>,
    pending: Arc<Mutex<Pending>>,
    timeout: Duration,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_RPC_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            next_id: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        // A panicked holder leaves the map intact; keep going
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Send one request and wait for its response.
    ///
    /// The frame goes through the transport's outgoing queue, so a call
    /// issued before the socket opens waits for the open rather than
    /// failing. Times out after the configured window; a response that
    /// lands after that is discarded.
    pub async fn call(&self, sender: &FrameSender, op: FsOp) -> Result<FsEvent> {
        let req_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.lock().insert(req_id, tx);

        let request = FsRequest { req_id, op };
        tracing::debug!(req_id, action = request.op.action(), "sending request");

        let frame = match encode_request(&request) {
            Ok(text) => Frame::Text(text),
            Err(e) => {
                self.lock().remove(&req_id);
                return Err(SkiffError::internal(format!("failed to encode request: {e}")));
            }
        };
        if let Err(e) = sender.send(frame).await {
            self.lock().remove(&req_id);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(event)) => Ok(event),
            // Sender dropped: the connection closed with this call in flight
            Ok(Err(_)) => Err(SkiffError::Disconnected),
            Err(_) => {
                self.lock().remove(&req_id);
                Err(SkiffError::Timeout {
                    seconds: self.timeout.as_secs(),
                })
            }
        }
    }

    /// Route a response to its waiting call. Returns false for events
    /// that carry no known `req_id` (late responses, broadcasts).
    pub fn resolve(&self, event: FsEvent) -> bool {
        let req_id = match &event {
            FsEvent::Ok { req_id, .. } | FsEvent::Error { req_id, .. } => *req_id,
            _ => return false,
        };

        match self.lock().remove(&req_id) {
            Some(tx) => {
                // Waiter may have timed out between lookup and send
                let _ = tx.send(event);
                true
            }
            None => {
                tracing::debug!(req_id, "response for unknown request, dropping");
                false
            }
        }
    }

    /// Fail every in-flight call. Called once per connection loss, in
    /// the same event turn as the close.
    pub fn fail_all(&self) {
        let n = {
            let mut pending = self.lock();
            let n = pending.len();
            pending.clear();
            n
        };
        if n > 0 {
            tracing::debug!(count = n, "failed pending requests on disconnect");
        }
    }

    /// Number of calls currently awaiting a response
    pub fn pending(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::transport::Outgoing;

    fn sender_pair() -> (FrameSender, mpsc::Receiver<Outgoing>) {
        FrameSender::test_pair()
    }

    fn ok_event(req_id: u64) -> FsEvent {
        FsEvent::Ok {
            req_id,
            data: json!({"content": "hi"}),
            rev: Some(3),
        }
    }

    #[tokio::test]
    async fn test_call_resolves_with_matching_response() {
        let correlator = Correlator::new();
        let (sender, mut outgoing) = sender_pair();

        let resolver = correlator.clone();
        let handle = tokio::spawn(async move {
            let frame = outgoing.recv().await.unwrap().frame;
            let Frame::Text(text) = frame else {
                panic!("expected text frame");
            };
            let request: FsRequest = serde_json::from_str(&text).unwrap();
            assert!(resolver.resolve(ok_event(request.req_id)));
        });

        let event = correlator
            .call(&sender, FsOp::ReadFile { path: "/a.txt".into() })
            .await
            .unwrap();
        assert!(matches!(event, FsEvent::Ok { rev: Some(3), .. }));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_calls_get_distinct_ids() {
        let correlator = Correlator::new();
        let (sender, mut outgoing) = sender_pair();

        let a = {
            let correlator = correlator.clone();
            let sender = sender.clone();
            tokio::spawn(async move {
                correlator
                    .call(&sender, FsOp::ListDir { path: "/".into() })
                    .await
            })
        };
        let b = {
            let correlator = correlator.clone();
            let sender = sender.clone();
            tokio::spawn(async move {
                correlator
                    .call(&sender, FsOp::ListDir { path: "/x".into() })
                    .await
            })
        };

        let mut ids = Vec::new();
        for _ in 0..2 {
            let Frame::Text(text) = outgoing.recv().await.unwrap().frame else {
                panic!("expected text frame");
            };
            let request: FsRequest = serde_json::from_str(&text).unwrap();
            ids.push(request.req_id);
        }
        assert_ne!(ids[0], ids[1]);

        // Resolve out of order
        assert!(correlator.resolve(ok_event(ids[1])));
        assert!(correlator.resolve(ok_event(ids[0])));
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_late_response_is_noop() {
        let correlator = Correlator::new();
        assert!(!correlator.resolve(ok_event(999)));
    }

    #[tokio::test]
    async fn test_broadcast_is_not_resolved() {
        let correlator = Correlator::new();
        assert!(!correlator.resolve(FsEvent::FileChanged {
            path: "/a.txt".into(),
            rev: 7,
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let correlator = Correlator::with_timeout(Duration::from_secs(20));
        let (sender, mut outgoing) = sender_pair();

        let handle = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .call(&sender, FsOp::ListDir { path: "/".into() })
                    .await
            })
        };

        // Consume the frame but never respond
        let _ = outgoing.recv().await.unwrap();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SkiffError::Timeout { seconds: 20 })));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn test_fail_all_disconnects_pending() {
        let correlator = Correlator::new();
        let (sender, mut outgoing) = sender_pair();

        let handle = {
            let correlator = correlator.clone();
            tokio::spawn(async move {
                correlator
                    .call(&sender, FsOp::ReadFile { path: "/a".into() })
                    .await
            })
        };

        let _ = outgoing.recv().await.unwrap();
        assert_eq!(correlator.pending(), 1);

        correlator.fail_all();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(SkiffError::Disconnected)));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn test_call_fails_when_transport_gone() {
        let correlator = Correlator::new();
        let (sender, outgoing) = sender_pair();
        drop(outgoing);

        let result = correlator
            .call(&sender, FsOp::ListDir { path: "/".into() })
            .await;
        assert!(matches!(result, Err(SkiffError::ConnectionClosed)));
        assert_eq!(correlator.pending(), 0);
    }
}
