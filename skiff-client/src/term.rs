//! Terminal session multiplexer
//!
//! Manages N interactive shell sessions against one remote container,
//! over either a single shared connection (sub-channels addressed by
//! session id control lines) or one dedicated connection per session
//! (session id in the connection URL). Keystrokes are forwarded
//! byte-for-byte to the focused session; inbound output is delivered
//! verbatim except that lone `\r` in text frames is normalized to
//! `\r\n` for terminal emulators that expect full CRLF line endings.
//!
//! Session state is client-authoritative: on transport reopen every
//! previously-open session is re-opened and its geometry re-sent, so a
//! server restart converges back to the client's view.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::mpsc;
use url::Url;
use uuid::Uuid;

use skiff_protocol::{TermControl, TermGeometry, TermNotice};
use skiff_utils::{Result, SkiffError};

use crate::transport::{
    Frame, FrameSender, Transport, TransportConfig, TransportEvent, TransportState,
};

/// Default delay before the post-open resize is repeated
pub const DEFAULT_RESIZE_RESEND_DELAY: Duration = Duration::from_millis(1200);

/// How terminal sessions map onto physical connections
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelPolicy {
    /// One connection for all sessions, multiplexed by control lines
    Shared,
    /// One connection per session, addressed by a `session` query
    /// parameter
    Dedicated,
}

/// Terminal multiplexer tuning
#[derive(Debug, Clone)]
pub struct TermConfig {
    pub policy: ChannelPolicy,
    /// The initial resize after a session opens is sent again after
    /// this delay, so a remote PTY that was still starting converges
    pub resize_resend_delay: Duration,
    pub transport: TransportConfig,
}

impl Default for TermConfig {
    fn default() -> Self {
        Self {
            policy: ChannelPolicy::Shared,
            resize_resend_delay: DEFAULT_RESIZE_RESEND_DELAY,
            transport: TransportConfig::default(),
        }
    }
}

/// Session lifecycle. A session is `Pending` from `open_session` until
/// its channel is open; its control frames queue in the transport and
/// flush at that point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Open,
    Closed,
}

/// Snapshot of one tracked session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub sid: String,
    pub state: SessionState,
    pub geometry: TermGeometry,
}

/// Everything the multiplexer reports to its host
#[derive(Debug, Clone, PartialEq)]
pub enum TermEvent {
    /// Shell output for a session, ready to feed a terminal emulator
    Output { sid: String, bytes: Vec<u8> },
    SessionOpened { sid: String },
    SessionClosed { sid: String },
    /// Focus moved to a session, or cleared when the last one closed
    FocusChanged { sid: Option<String> },
    /// Out-of-band lifecycle notice from the server
    Notice(TermNotice),
    /// The underlying connection (re)opened
    Connected,
    /// The underlying connection dropped; a reconnect follows if
    /// enabled
    Disconnected,
}

struct SessionEntry {
    state: SessionState,
    geometry: TermGeometry,
    /// Dedicated-policy transport; `None` under the shared policy
    transport: Option<Transport>,
}

struct Inner {
    sessions: HashMap<String, SessionEntry>,
    focused: Option<String>,
}

/// Multiplexer for one container's terminal sessions
pub struct TerminalMux {
    base_url: String,
    config: TermConfig,
    inner: Arc<Mutex<Inner>>,
    events: mpsc::UnboundedSender<TermEvent>,
    /// Shared-policy connection; `None` under the dedicated policy
    shared: Option<Transport>,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl TerminalMux {
    /// Create the multiplexer. Under the shared policy this opens the
    /// single terminal connection immediately; under the dedicated
    /// policy connections open per session.
    pub fn new(
        base_url: impl Into<String>,
        config: TermConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TermEvent>) {
        let base_url = base_url.into();
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Mutex::new(Inner {
            sessions: HashMap::new(),
            focused: None,
        }));

        let (shared, reader) = match config.policy {
            ChannelPolicy::Shared => {
                let (transport, transport_events) =
                    Transport::connect(base_url.clone(), config.transport.clone());
                let reader = tokio::spawn(shared_reader(
                    transport_events,
                    transport.sender(),
                    inner.clone(),
                    events.clone(),
                    config.resize_resend_delay,
                ));
                (Some(transport), Some(reader))
            }
            ChannelPolicy::Dedicated => (None, None),
        };

        (
            Self {
                base_url,
                config,
                inner,
                events,
                shared,
                reader,
            },
            events_rx,
        )
    }

    /// Open a session. A generated UUID names the session when the
    /// caller does not supply an id. Re-opening a tracked session is a
    /// no-op returning the same id (though `make_active` still moves
    /// focus).
    pub fn open_session(&self, sid: Option<String>, make_active: bool) -> Result<String> {
        let sid = sid.unwrap_or_else(|| Uuid::new_v4().to_string());

        {
            let inner = lock(&self.inner);
            if let Some(entry) = inner.sessions.get(&sid) {
                if entry.state != SessionState::Closed {
                    drop(inner);
                    if make_active {
                        self.focus(&sid)?;
                    }
                    return Ok(sid);
                }
            }
        }

        {
            let mut inner = lock(&self.inner);

            // Pending until the channel reader sees the open; a fresh
            // dedicated connection is never open yet
            let (transport, sender, state) = match self.config.policy {
                ChannelPolicy::Shared => {
                    let state = match self.shared.as_ref().map(Transport::state) {
                        Some(TransportState::Open) => SessionState::Open,
                        _ => SessionState::Pending,
                    };
                    (None, self.shared_sender()?, state)
                }
                ChannelPolicy::Dedicated => {
                    let url = session_url(&self.base_url, &sid)?;
                    let (transport, transport_events) =
                        Transport::connect(url, self.config.transport.clone());
                    let sender = transport.sender();
                    tokio::spawn(dedicated_reader(
                        transport_events,
                        sender.clone(),
                        sid.clone(),
                        self.inner.clone(),
                        self.events.clone(),
                        self.config.resize_resend_delay,
                    ));
                    (Some(transport), sender, SessionState::Pending)
                }
            };

            let geometry = TermGeometry::default();
            inner.sessions.insert(
                sid.clone(),
                SessionEntry {
                    state,
                    geometry,
                    transport,
                },
            );

            if self.config.policy == ChannelPolicy::Shared {
                send_open_sequence(&sender, &sid, geometry);
                schedule_resize_resend(
                    sender,
                    sid.clone(),
                    self.inner.clone(),
                    self.config.resize_resend_delay,
                );
            }

            if make_active || inner.focused.is_none() {
                inner.focused = Some(sid.clone());
                if self.config.policy == ChannelPolicy::Shared {
                    self.send_control(&TermControl::Focus { sid: sid.clone() })?;
                }
                emit(&self.events, TermEvent::FocusChanged { sid: Some(sid.clone()) });
            }
        }

        emit(&self.events, TermEvent::SessionOpened { sid: sid.clone() });
        Ok(sid)
    }

    /// Close a session. Focus falls to another live session when the
    /// focused one closes, or clears when none remain.
    pub fn close_session(&self, sid: &str) -> Result<()> {
        // None: focus untouched; Some(next): the new focus, possibly
        // cleared
        let focus_update = {
            let mut inner = lock(&self.inner);
            let mut entry = inner
                .sessions
                .remove(sid)
                .ok_or_else(|| SkiffError::SessionNotFound(sid.into()))?;

            match self.config.policy {
                ChannelPolicy::Shared => {
                    self.send_control(&TermControl::Close { sid: sid.into() })?;
                }
                ChannelPolicy::Dedicated => {
                    if let Some(transport) = entry.transport.as_mut() {
                        transport.close();
                    }
                }
            }

            if inner.focused.as_deref() == Some(sid) {
                inner.focused = inner
                    .sessions
                    .iter()
                    .find(|(_, e)| e.state != SessionState::Closed)
                    .map(|(sid, _)| sid.clone());
                Some(inner.focused.clone())
            } else {
                None
            }
        };

        emit(&self.events, TermEvent::SessionClosed { sid: sid.into() });
        if let Some(next) = focus_update {
            if let Some(sid) = &next {
                if self.config.policy == ChannelPolicy::Shared {
                    self.send_control(&TermControl::Focus { sid: sid.clone() })?;
                }
            }
            emit(&self.events, TermEvent::FocusChanged { sid: next });
        }
        Ok(())
    }

    /// Route subsequent input to this session
    pub fn focus(&self, sid: &str) -> Result<()> {
        {
            let mut inner = lock(&self.inner);
            let entry = inner
                .sessions
                .get(sid)
                .ok_or_else(|| SkiffError::SessionNotFound(sid.into()))?;
            if entry.state == SessionState::Closed {
                return Err(SkiffError::SessionNotFound(sid.into()));
            }
            inner.focused = Some(sid.to_string());
        }
        if self.config.policy == ChannelPolicy::Shared {
            self.send_control(&TermControl::Focus { sid: sid.into() })?;
        }
        emit(
            &self.events,
            TermEvent::FocusChanged {
                sid: Some(sid.into()),
            },
        );
        Ok(())
    }

    /// Forward raw input byte-for-byte to the focused session. Valid
    /// UTF-8 goes as a text frame, anything else as binary. No newline
    /// or other bytes are injected.
    pub fn send_input(&self, bytes: &[u8]) -> Result<()> {
        let sender = {
            let inner = lock(&self.inner);
            let sid = inner.focused.clone().ok_or(SkiffError::NoFocusedSession)?;
            self.sender_for(&inner, &sid)?
        };

        let frame = match std::str::from_utf8(bytes) {
            Ok(text) => Frame::Text(text.to_string()),
            Err(_) => Frame::Binary(bytes.to_vec()),
        };
        sender.send_nowait(frame);
        Ok(())
    }

    /// Propagate new PTY geometry for a session
    pub fn resize(&self, sid: &str, geometry: TermGeometry) -> Result<()> {
        let sender = {
            let mut inner = lock(&self.inner);
            let entry = inner
                .sessions
                .get_mut(sid)
                .ok_or_else(|| SkiffError::SessionNotFound(sid.into()))?;
            entry.geometry = geometry;
            self.sender_for(&inner, sid)?
        };
        sender.send_nowait(Frame::Text(
            TermControl::Resize {
                sid: sid.into(),
                geometry,
            }
            .encode(),
        ));
        Ok(())
    }

    /// Snapshot of tracked sessions
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let inner = lock(&self.inner);
        let mut list: Vec<SessionInfo> = inner
            .sessions
            .iter()
            .map(|(sid, entry)| SessionInfo {
                sid: sid.clone(),
                state: entry.state,
                geometry: entry.geometry,
            })
            .collect();
        list.sort_by(|a, b| a.sid.cmp(&b.sid));
        list
    }

    /// Currently focused session id
    pub fn focused(&self) -> Option<String> {
        lock(&self.inner).focused.clone()
    }

    /// Tear down every connection without reconnecting
    pub fn close(&mut self) {
        if let Some(task) = self.reader.take() {
            task.abort();
        }
        if let Some(transport) = self.shared.as_mut() {
            transport.close();
        }
        let mut inner = lock(&self.inner);
        for entry in inner.sessions.values_mut() {
            if let Some(transport) = entry.transport.as_mut() {
                transport.close();
            }
            entry.state = SessionState::Closed;
        }
    }

    fn shared_sender(&self) -> Result<FrameSender> {
        self.shared
            .as_ref()
            .map(Transport::sender)
            .ok_or(SkiffError::ConnectionClosed)
    }

    fn sender_for(&self, inner: &Inner, sid: &str) -> Result<FrameSender> {
        match self.config.policy {
            ChannelPolicy::Shared => self.shared_sender(),
            ChannelPolicy::Dedicated => inner
                .sessions
                .get(sid)
                .and_then(|e| e.transport.as_ref())
                .map(Transport::sender)
                .ok_or_else(|| SkiffError::SessionNotFound(sid.into())),
        }
    }

    fn send_control(&self, control: &TermControl) -> Result<()> {
        self.shared_sender()?
            .send_nowait(Frame::Text(control.encode()));
        Ok(())
    }
}

impl Drop for TerminalMux {
    fn drop(&mut self) {
        if let Some(task) = self.reader.take() {
            task.abort();
        }
    }
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(|e| e.into_inner())
}

fn emit(events: &mpsc::UnboundedSender<TermEvent>, event: TermEvent) {
    let _ = events.send(event);
}

/// Normalize lone `\r` to `\r\n`. Existing `\r\n` pairs pass through
/// untouched.
pub fn normalize_crlf(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        out.push(c);
        if c == '\r' && chars.peek() != Some(&'\n') {
            out.push('\n');
        }
    }
    out
}

/// Connection URL for a dedicated session channel
fn session_url(base: &str, sid: &str) -> Result<String> {
    let mut url = Url::parse(base)
        .map_err(|e| SkiffError::connection(format!("bad terminal url {base}: {e}")))?;
    url.query_pairs_mut().append_pair("session", sid);
    Ok(url.into())
}

fn send_open_sequence(sender: &FrameSender, sid: &str, geometry: TermGeometry) {
    sender.send_nowait(Frame::Text(TermControl::Open { sid: sid.into() }.encode()));
    sender.send_nowait(Frame::Text(
        TermControl::Resize {
            sid: sid.into(),
            geometry,
        }
        .encode(),
    ));
}

/// Repeat the post-open resize once the remote PTY has had time to
/// start, using the geometry current at that point.
fn schedule_resize_resend(
    sender: FrameSender,
    sid: String,
    inner: Arc<Mutex<Inner>>,
    delay: Duration,
) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let geometry = {
            let inner = lock(&inner);
            match inner.sessions.get(&sid) {
                Some(entry) if entry.state != SessionState::Closed => entry.geometry,
                _ => return,
            }
        };
        sender.send_nowait(Frame::Text(TermControl::Resize { sid, geometry }.encode()));
    });
}

/// Deliver one inbound frame as host events. Text frames may be
/// out-of-band notices; everything else is output for `sid`.
fn deliver_frame(frame: Frame, sid: String, events: &mpsc::UnboundedSender<TermEvent>) {
    match frame {
        Frame::Text(text) => {
            if let Some(notice) = TermNotice::parse(&text) {
                emit(events, TermEvent::Notice(notice));
            } else {
                emit(
                    events,
                    TermEvent::Output {
                        sid,
                        bytes: normalize_crlf(&text).into_bytes(),
                    },
                );
            }
        }
        Frame::Binary(bytes) => {
            emit(events, TermEvent::Output { sid, bytes });
        }
    }
}

/// Event loop for the shared terminal connection. Inbound output is
/// attributed to the focused session; on reopen previously-open
/// sessions are re-announced and pending ones become open.
async fn shared_reader(
    mut transport_events: mpsc::Receiver<TransportEvent>,
    sender: FrameSender,
    inner: Arc<Mutex<Inner>>,
    events: mpsc::UnboundedSender<TermEvent>,
    resize_resend_delay: Duration,
) {
    while let Some(event) = transport_events.recv().await {
        match event {
            TransportEvent::Open => {
                // Sessions that were already open lived through a
                // reconnect and need re-announcing; pending ones have
                // their control frames queued and just flushed
                let (reopen, focused) = {
                    let mut inner = lock(&inner);
                    let mut reopen: Vec<(String, TermGeometry)> = Vec::new();
                    for (sid, entry) in inner.sessions.iter_mut() {
                        match entry.state {
                            SessionState::Open => reopen.push((sid.clone(), entry.geometry)),
                            SessionState::Pending => entry.state = SessionState::Open,
                            SessionState::Closed => {}
                        }
                    }
                    (reopen, inner.focused.clone())
                };
                let reannounced = !reopen.is_empty();
                for (sid, geometry) in reopen {
                    tracing::info!(sid = %sid, "re-opening session after reconnect");
                    send_open_sequence(&sender, &sid, geometry);
                    schedule_resize_resend(
                        sender.clone(),
                        sid,
                        inner.clone(),
                        resize_resend_delay,
                    );
                }
                if reannounced {
                    if let Some(sid) = focused {
                        sender.send_nowait(Frame::Text(TermControl::Focus { sid }.encode()));
                    }
                }
                emit(&events, TermEvent::Connected);
            }
            TransportEvent::Frame(frame) => {
                let Some(sid) = lock(&inner).focused.clone() else {
                    tracing::debug!("terminal output with no focused session, dropping");
                    continue;
                };
                deliver_frame(frame, sid, &events);
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                tracing::info!(attempt, ?delay, "terminal channel reconnecting");
            }
            TransportEvent::Closed { clean } => {
                emit(&events, TermEvent::Disconnected);
                if clean {
                    return;
                }
            }
        }
    }
}

/// Event loop for one dedicated session connection
async fn dedicated_reader(
    mut transport_events: mpsc::Receiver<TransportEvent>,
    sender: FrameSender,
    sid: String,
    inner: Arc<Mutex<Inner>>,
    events: mpsc::UnboundedSender<TermEvent>,
    resize_resend_delay: Duration,
) {
    while let Some(event) = transport_events.recv().await {
        match event {
            TransportEvent::Open => {
                let geometry = {
                    let mut inner = lock(&inner);
                    match inner.sessions.get_mut(&sid) {
                        Some(entry) => {
                            entry.state = SessionState::Open;
                            entry.geometry
                        }
                        None => return,
                    }
                };
                sender.send_nowait(Frame::Text(
                    TermControl::Resize {
                        sid: sid.clone(),
                        geometry,
                    }
                    .encode(),
                ));
                schedule_resize_resend(
                    sender.clone(),
                    sid.clone(),
                    inner.clone(),
                    resize_resend_delay,
                );
                emit(&events, TermEvent::Connected);
            }
            TransportEvent::Frame(frame) => {
                deliver_frame(frame, sid.clone(), &events);
            }
            TransportEvent::Reconnecting { attempt, delay } => {
                tracing::info!(sid = %sid, attempt, ?delay, "session channel reconnecting");
            }
            TransportEvent::Closed { clean } => {
                emit(&events, TermEvent::Disconnected);
                if clean {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::{SinkExt, StreamExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio_tungstenite::tungstenite::protocol::Message;
    use tokio_tungstenite::{accept_async, WebSocketStream};

    #[test]
    fn test_normalize_lone_cr() {
        assert_eq!(normalize_crlf("a\rb"), "a\r\nb");
        assert_eq!(normalize_crlf("line\r"), "line\r\n");
    }

    #[test]
    fn test_normalize_preserves_crlf() {
        assert_eq!(normalize_crlf("a\r\nb"), "a\r\nb");
        assert_eq!(normalize_crlf("\r\n\r\n"), "\r\n\r\n");
    }

    #[test]
    fn test_normalize_mixed() {
        assert_eq!(normalize_crlf("a\rb\r\nc\r"), "a\r\nb\r\nc\r\n");
        assert_eq!(normalize_crlf("no endings"), "no endings");
        assert_eq!(normalize_crlf(""), "");
    }

    #[test]
    fn test_session_url_appends_query() {
        let url = session_url("ws://host:9000/term", "abc-123").unwrap();
        assert_eq!(url, "ws://host:9000/term?session=abc-123");
    }

    #[test]
    fn test_session_url_rejects_garbage() {
        assert!(session_url("not a url", "sid").is_err());
    }

    fn test_config(policy: ChannelPolicy) -> TermConfig {
        TermConfig {
            policy,
            resize_resend_delay: Duration::from_millis(30),
            transport: TransportConfig {
                base_delay: Duration::from_millis(10),
                max_backoff: Duration::from_millis(40),
                reconnect: true,
            },
        }
    }

    async fn bind() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    async fn accept(listener: &TcpListener) -> WebSocketStream<TcpStream> {
        let (stream, _) = listener.accept().await.unwrap();
        accept_async(stream).await.unwrap()
    }

    async fn recv_text(ws: &mut WebSocketStream<TcpStream>) -> String {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => text,
            other => panic!("expected text frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shared_open_sends_control_and_double_resize() {
        let (listener, url) = bind().await;
        let (mux, _events) = TerminalMux::new(url, test_config(ChannelPolicy::Shared));
        let mut ws = accept(&listener).await;

        let sid = mux.open_session(Some("s1".into()), true).unwrap();
        assert_eq!(sid, "s1");

        assert_eq!(recv_text(&mut ws).await, "\u{1}open:s1");
        assert_eq!(recv_text(&mut ws).await, "\u{1}resize:80:24:s1");
        assert_eq!(recv_text(&mut ws).await, "\u{1}focus:s1");
        // The delayed repeat of the initial resize
        assert_eq!(recv_text(&mut ws).await, "\u{1}resize:80:24:s1");
    }

    #[tokio::test]
    async fn test_open_generates_uuid_when_unnamed() {
        let (_listener, url) = bind().await;
        let (mux, _events) = TerminalMux::new(url, test_config(ChannelPolicy::Shared));

        let sid = mux.open_session(None, true).unwrap();
        assert!(Uuid::parse_str(&sid).is_ok());
    }

    #[tokio::test]
    async fn test_reopen_is_idempotent() {
        let (_listener, url) = bind().await;
        let (mux, _events) = TerminalMux::new(url, test_config(ChannelPolicy::Shared));

        let sid = mux.open_session(Some("s1".into()), true).unwrap();
        assert_eq!(mux.open_session(Some("s1".into()), true).unwrap(), sid);
        assert_eq!(mux.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_focus_follows_close() {
        let (_listener, url) = bind().await;
        let (mux, mut events) = TerminalMux::new(url, test_config(ChannelPolicy::Shared));

        mux.open_session(Some("a".into()), true).unwrap();
        mux.open_session(Some("b".into()), false).unwrap();
        assert_eq!(mux.focused().as_deref(), Some("a"));

        mux.close_session("a").unwrap();
        assert_eq!(mux.focused().as_deref(), Some("b"));

        mux.close_session("b").unwrap();
        assert_eq!(mux.focused(), None);

        // Hosts see every focus move, including the final clear
        let mut focuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let TermEvent::FocusChanged { sid } = event {
                focuses.push(sid);
            }
        }
        assert_eq!(
            focuses,
            vec![Some("a".to_string()), Some("b".to_string()), None]
        );
    }

    #[tokio::test]
    async fn test_session_pending_until_channel_opens() {
        let (listener, url) = bind().await;
        let (mux, mut events) = TerminalMux::new(url, test_config(ChannelPolicy::Shared));

        // No server accept yet, so the channel cannot be open
        mux.open_session(Some("s1".into()), true).unwrap();
        assert_eq!(mux.sessions()[0].state, SessionState::Pending);

        let _ws = accept(&listener).await;
        loop {
            match events.recv().await.unwrap() {
                TermEvent::Connected => break,
                _ => continue,
            }
        }
        assert_eq!(mux.sessions()[0].state, SessionState::Open);
    }

    #[tokio::test]
    async fn test_focus_unknown_session_fails() {
        let (_listener, url) = bind().await;
        let (mux, _events) = TerminalMux::new(url, test_config(ChannelPolicy::Shared));

        assert!(matches!(
            mux.focus("nope"),
            Err(SkiffError::SessionNotFound(_))
        ));
        assert!(matches!(
            mux.close_session("nope"),
            Err(SkiffError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_input_requires_focused_session() {
        let (_listener, url) = bind().await;
        let (mux, _events) = TerminalMux::new(url, test_config(ChannelPolicy::Shared));

        assert!(matches!(
            mux.send_input(b"ls\r"),
            Err(SkiffError::NoFocusedSession)
        ));
    }

    #[tokio::test]
    async fn test_input_forwarded_verbatim() {
        let (listener, url) = bind().await;
        let (mux, _events) = TerminalMux::new(url, test_config(ChannelPolicy::Shared));
        let mut ws = accept(&listener).await;

        mux.open_session(Some("s1".into()), true).unwrap();

        // Control lines (open/resize/focus, plus the delayed resize
        // repeat) may interleave; input is the first non-control frame
        mux.send_input(b"ls -la\r").unwrap();
        loop {
            let text = recv_text(&mut ws).await;
            if text.starts_with('\u{1}') {
                continue;
            }
            assert_eq!(text, "ls -la\r");
            break;
        }

        // Non-UTF-8 goes as a binary frame, untouched
        mux.send_input(&[0x1b, 0xff, 0x00]).unwrap();
        loop {
            match ws.next().await {
                Some(Ok(Message::Binary(bytes))) => {
                    assert_eq!(bytes, vec![0x1b, 0xff, 0x00]);
                    break;
                }
                Some(Ok(Message::Text(text))) if text.starts_with('\u{1}') => continue,
                other => panic!("expected binary frame, got {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_output_attributed_to_focused_session() {
        let (listener, url) = bind().await;
        let (mux, mut events) = TerminalMux::new(url, test_config(ChannelPolicy::Shared));
        let mut ws = accept(&listener).await;

        mux.open_session(Some("s1".into()), true).unwrap();

        // Wait until the host sees the connection and session
        loop {
            match events.recv().await.unwrap() {
                TermEvent::FocusChanged { .. } => break,
                _ => continue,
            }
        }

        ws.send(Message::Text("hello\rworld".into())).await.unwrap();
        loop {
            match events.recv().await.unwrap() {
                TermEvent::Output { sid, bytes } => {
                    assert_eq!(sid, "s1");
                    assert_eq!(bytes, b"hello\r\nworld".to_vec());
                    break;
                }
                _ => continue,
            }
        }

        // Binary output is verbatim
        ws.send(Message::Binary(vec![0xde, 0xad])).await.unwrap();
        loop {
            match events.recv().await.unwrap() {
                TermEvent::Output { bytes, .. } => {
                    assert_eq!(bytes, vec![0xde, 0xad]);
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_notice_parsed_not_rendered() {
        let (listener, url) = bind().await;
        let (mux, mut events) = TerminalMux::new(url, test_config(ChannelPolicy::Shared));
        let mut ws = accept(&listener).await;

        mux.open_session(Some("s1".into()), true).unwrap();

        ws.send(Message::Text(
            r#"{"type":"error","message":"shell exited","sid":"s1"}"#.into(),
        ))
        .await
        .unwrap();

        loop {
            match events.recv().await.unwrap() {
                TermEvent::Notice(notice) => {
                    assert_eq!(notice.message(), "shell exited");
                    assert_eq!(notice.sid(), Some("s1"));
                    break;
                }
                TermEvent::Output { .. } => panic!("notice rendered as output"),
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_sessions_reannounced_after_reconnect() {
        let (listener, url) = bind().await;
        let (mux, _events) = TerminalMux::new(url, test_config(ChannelPolicy::Shared));

        {
            let mut ws = accept(&listener).await;
            mux.open_session(Some("s1".into()), true).unwrap();
            for _ in 0..3 {
                recv_text(&mut ws).await;
            }
            // Unclean drop forces a reconnect
        }

        let mut ws = accept(&listener).await;
        assert_eq!(recv_text(&mut ws).await, "\u{1}open:s1");
        assert_eq!(recv_text(&mut ws).await, "\u{1}resize:80:24:s1");
        assert_eq!(recv_text(&mut ws).await, "\u{1}focus:s1");
        assert_eq!(mux.sessions()[0].state, SessionState::Open);
    }

    #[tokio::test]
    async fn test_dedicated_session_connects_with_query() {
        let (listener, url) = bind().await;
        let (mux, _events) = TerminalMux::new(url, test_config(ChannelPolicy::Dedicated));

        mux.open_session(Some("s1".into()), true).unwrap();

        let (stream, _) = listener.accept().await.unwrap();
        let mut path = None;
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &tokio_tungstenite::tungstenite::handshake::server::Request, resp| {
                path = Some(req.uri().to_string());
                Ok(resp)
            },
        )
        .await
        .unwrap();
        assert_eq!(path.as_deref(), Some("/?session=s1"));

        // Geometry announced once the dedicated channel opens
        let mut ws = ws;
        assert_eq!(recv_text(&mut ws).await, "\u{1}resize:80:24:s1");
    }

    #[tokio::test]
    async fn test_resize_updates_geometry_and_sends_control() {
        let (listener, url) = bind().await;
        let (mux, _events) = TerminalMux::new(url, test_config(ChannelPolicy::Shared));
        let mut ws = accept(&listener).await;

        mux.open_session(Some("s1".into()), true).unwrap();
        mux.resize("s1", TermGeometry { cols: 132, rows: 43 }).unwrap();

        // Only control lines precede the new geometry; the delayed
        // resize repeat may land anywhere among them
        loop {
            let text = recv_text(&mut ws).await;
            assert!(text.starts_with('\u{1}'), "unexpected frame {text:?}");
            if text == "\u{1}resize:132:43:s1" {
                break;
            }
        }

        let sessions = mux.sessions();
        assert_eq!(sessions[0].geometry, TermGeometry { cols: 132, rows: 43 });
    }
}
