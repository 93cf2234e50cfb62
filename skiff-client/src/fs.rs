//! Filesystem sync service
//!
//! One [`FsClient`] per workspace filesystem channel. RPC operations go
//! through the [`Correlator`]; unsolicited broadcasts update the
//! per-path [`RevisionTable`] and fan out to subscribers. Writes carry
//! the last revision this client observed so the server can reject
//! stale updates instead of silently clobbering newer content.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use skiff_protocol::{decode_event, DirEntry, FileBody, FsEvent, FsOp, CONFLICT_ERROR};
use skiff_utils::{Result, SkiffError};

use crate::rpc::Correlator;
use crate::transport::{Frame, FrameSender, Transport, TransportConfig, TransportEvent};

const CHANGE_QUEUE: usize = 256;

/// Per-path revision tracking
///
/// Revisions start at 0 for unseen paths and only move forward. The two
/// legitimate writers are the successful-response handler and the
/// broadcast handler; a regressing revision is logged and ignored.
#[derive(Debug, Default)]
pub struct RevisionTable {
    revs: HashMap<String, u64>,
}

impl RevisionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last revision observed for a path (0 if never seen)
    pub fn revision(&self, path: &str) -> u64 {
        self.revs.get(path).copied().unwrap_or(0)
    }

    /// Record a newly observed revision. Returns false (and logs) when
    /// the revision would move backwards.
    pub fn observe(&mut self, path: &str, rev: u64) -> bool {
        let current = self.revision(path);
        if rev < current {
            tracing::warn!(path, current, rev, "revision regression, ignoring");
            return false;
        }
        self.revs.insert(path.to_string(), rev);
        true
    }

    /// Forget a deleted path
    pub fn remove(&mut self, path: &str) {
        self.revs.remove(path);
    }

    /// Carry a path's tracking across a move
    pub fn rename(&mut self, src: &str, dst: &str, rev: u64) {
        self.revs.remove(src);
        self.observe(dst, rev);
    }
}

/// A broadcast another client's action produced, or a resync marker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsChange {
    FileChanged { path: String, rev: u64 },
    PathCreated { path: String, rev: u64 },
    PathDeleted { path: String },
    PathMoved { path: String, dst: String, rev: u64 },
    /// The channel (re)connected; any number of broadcasts may have
    /// been missed, so cached state should be refreshed
    Resync,
}

/// A file read result: content plus the revision it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub content: String,
    pub rev: u64,
}

/// Client for one workspace's filesystem channel
pub struct FsClient {
    transport: Transport,
    /// RPC frames are dropped on connection loss; `fail_all` rejects
    /// their calls, so replaying them would re-execute failed operations
    rpc_sender: FrameSender,
    correlator: Correlator,
    revisions: Arc<Mutex<RevisionTable>>,
    changes: broadcast::Sender<FsChange>,
    dispatch: Option<tokio::task::JoinHandle<()>>,
}

impl FsClient {
    /// Connect to the filesystem channel and start dispatching inbound
    /// events. Operations issued before the socket opens queue and run
    /// after the open.
    pub fn connect(url: impl Into<String>, config: TransportConfig) -> Self {
        let (transport, events) = Transport::connect(url, config);
        let rpc_sender = transport.sender().no_replay();
        let correlator = Correlator::new();
        let revisions = Arc::new(Mutex::new(RevisionTable::new()));
        let (changes, _) = broadcast::channel(CHANGE_QUEUE);

        let dispatch = tokio::spawn(dispatch_loop(
            events,
            correlator.clone(),
            revisions.clone(),
            changes.clone(),
        ));

        Self {
            transport,
            rpc_sender,
            correlator,
            revisions,
            changes,
            dispatch: Some(dispatch),
        }
    }

    /// Subscribe to broadcasts about paths other clients touched
    pub fn subscribe(&self) -> broadcast::Receiver<FsChange> {
        self.changes.subscribe()
    }

    /// Last revision observed for a path
    pub fn revision(&self, path: &str) -> u64 {
        lock(&self.revisions).revision(path)
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let (data, _rev) = self.call(FsOp::ListDir { path: path.into() }).await?;
        serde_json::from_value(data)
            .map_err(|e| SkiffError::malformed(format!("bad directory listing: {e}")))
    }

    pub async fn read_file(&self, path: &str) -> Result<FileContent> {
        let (data, rev) = self.call(FsOp::ReadFile { path: path.into() }).await?;
        let body: FileBody = serde_json::from_value(data)
            .map_err(|e| SkiffError::malformed(format!("bad file body: {e}")))?;
        let rev = rev.unwrap_or(0);
        lock(&self.revisions).observe(path, rev);
        Ok(FileContent {
            content: body.content,
            rev,
        })
    }

    /// Write a file, guarded by the last revision this client observed.
    ///
    /// On a stale-revision rejection the file is re-fetched so the
    /// revision table converges, then [`SkiffError::Conflict`] is
    /// returned for the caller to surface. Returns the new revision on
    /// success.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<u64> {
        let prev_rev = self.revision(path);
        let op = FsOp::WriteFile {
            path: path.into(),
            prev_rev,
            content: content.into(),
        };

        match self.call(op).await {
            Ok((_data, rev)) => {
                let rev = rev.unwrap_or(prev_rev + 1);
                lock(&self.revisions).observe(path, rev);
                Ok(rev)
            }
            Err(SkiffError::Conflict { .. }) => {
                tracing::info!(path, prev_rev, "write rejected as stale, re-fetching");
                // Resynchronize the table so the next write can succeed
                if let Err(e) = self.read_file(path).await {
                    tracing::warn!(path, error = %e, "re-fetch after conflict failed");
                }
                Err(SkiffError::Conflict { path: path.into() })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn create_dir(&self, path: &str) -> Result<()> {
        let (_data, rev) = self.call(FsOp::CreateDir { path: path.into() }).await?;
        if let Some(rev) = rev {
            lock(&self.revisions).observe(path, rev);
        }
        Ok(())
    }

    pub async fn delete_path(&self, path: &str) -> Result<()> {
        self.call(FsOp::DeletePath { path: path.into() }).await?;
        lock(&self.revisions).remove(path);
        Ok(())
    }

    pub async fn move_path(&self, src: &str, dst: &str) -> Result<()> {
        let (_data, rev) = self
            .call(FsOp::MovePath {
                src: src.into(),
                dst: dst.into(),
            })
            .await?;
        lock(&self.revisions).rename(src, dst, rev.unwrap_or(0));
        Ok(())
    }

    /// Tear down the channel without reconnecting
    pub fn close(&mut self) {
        if let Some(task) = self.dispatch.take() {
            task.abort();
        }
        self.transport.close();
    }

    /// One correlated call, with the error envelope mapped onto
    /// [`SkiffError`].
    async fn call(&self, op: FsOp) -> Result<(Value, Option<u64>)> {
        let path = op.primary_path().to_string();
        match self.correlator.call(&self.rpc_sender, op).await? {
            FsEvent::Ok { data, rev, .. } => Ok((data, rev)),
            FsEvent::Error { error, .. } if error == CONFLICT_ERROR => {
                Err(SkiffError::Conflict { path })
            }
            FsEvent::Error { error, .. } => Err(SkiffError::remote(error)),
            other => Err(SkiffError::malformed(format!(
                "unexpected response event: {other:?}"
            ))),
        }
    }
}

impl Drop for FsClient {
    fn drop(&mut self) {
        if let Some(task) = self.dispatch.take() {
            task.abort();
        }
    }
}

fn lock(revisions: &Mutex<RevisionTable>) -> MutexGuard<'_, RevisionTable> {
    revisions.lock().unwrap_or_else(|e| e.into_inner())
}

/// Inbound event loop for one filesystem connection. Responses go to
/// the correlator, broadcasts to the table and subscribers. Malformed
/// frames are logged and dropped without killing the connection.
async fn dispatch_loop(
    mut events: mpsc::Receiver<TransportEvent>,
    correlator: Correlator,
    revisions: Arc<Mutex<RevisionTable>>,
    changes: broadcast::Sender<FsChange>,
) {
    let mut opened_before = false;
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Frame(Frame::Text(text)) => {
                let event = match decode_event(&text) {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed filesystem frame, dropping");
                        continue;
                    }
                };
                handle_event(event, &correlator, &revisions, &changes);
            }
            TransportEvent::Frame(Frame::Binary(_)) => {
                tracing::warn!("unexpected binary frame on filesystem channel");
            }
            TransportEvent::Open => {
                if opened_before {
                    // Broadcasts may have been missed while disconnected
                    tracing::info!("filesystem channel reopened");
                    let _ = changes.send(FsChange::Resync);
                } else {
                    tracing::debug!("filesystem channel open");
                    opened_before = true;
                }
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                tracing::info!(attempt, ?delay, "filesystem channel reconnecting");
            }
            TransportEvent::Closed { clean } => {
                // Reject in-flight calls now rather than at the timeout
                correlator.fail_all();
                if clean {
                    return;
                }
            }
        }
    }
    correlator.fail_all();
}

fn handle_event(
    event: FsEvent,
    correlator: &Correlator,
    revisions: &Mutex<RevisionTable>,
    changes: &broadcast::Sender<FsChange>,
) {
    let change = match event {
        FsEvent::Ok { .. } | FsEvent::Error { .. } => {
            correlator.resolve(event);
            return;
        }
        FsEvent::FileChanged { path, rev } => {
            lock(revisions).observe(&path, rev);
            FsChange::FileChanged { path, rev }
        }
        FsEvent::PathCreated { path, rev } => {
            lock(revisions).observe(&path, rev);
            FsChange::PathCreated { path, rev }
        }
        FsEvent::PathDeleted { path } => {
            lock(revisions).remove(&path);
            FsChange::PathDeleted { path }
        }
        FsEvent::PathMoved { path, dst, rev } => {
            lock(revisions).rename(&path, &dst, rev);
            FsChange::PathMoved { path, dst, rev }
        }
        FsEvent::Connected => FsChange::Resync,
    };
    // No subscribers is fine
    let _ = changes.send(change);
}
