//! WebSocket connection supervision
//!
//! One supervisor task per [`Transport`] owns the physical socket:
//! connect, pump frames both ways, and on unclean close retry with
//! exponential backoff. Frames submitted while the socket is not open
//! wait in the bounded outgoing queue and are transmitted after the next
//! successful open; nothing is dropped silently.

use std::collections::VecDeque;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use skiff_utils::{Result, SkiffError};

use super::backoff::Backoff;

/// Recommended default backoff base delay
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
/// Recommended default backoff ceiling
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_millis(8000);

const OUTGOING_QUEUE: usize = 256;
const EVENT_QUEUE: usize = 256;

/// One wire frame, transmitted as-is
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    fn into_message(self) -> Message {
        match self {
            Self::Text(text) => Message::Text(text),
            Self::Binary(data) => Message::Binary(data),
        }
    }
}

/// A queued frame plus its loss policy
#[derive(Debug)]
pub(crate) struct Outgoing {
    pub(crate) frame: Frame,
    /// Whether the frame survives a connection loss and is resent on
    /// the next open, rather than being dropped with the connection
    pub(crate) replay: bool,
}

/// Observable transport side effects, delivered in order on one channel
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The socket (re)opened; queued frames have started draining
    Open,
    /// An inbound frame
    Frame(Frame),
    /// A retry is scheduled; lets the host surface a "disconnected,
    /// retrying" indicator once `attempt` grows past a few
    Reconnecting { attempt: u32, delay: Duration },
    /// The socket closed. `clean` means locally initiated; otherwise a
    /// reconnect follows if enabled
    Closed { clean: bool },
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Connecting,
    Open,
    Closed,
}

/// Transport tuning
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub base_delay: Duration,
    pub max_backoff: Duration,
    /// Retry on unclean close
    pub reconnect: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            max_backoff: DEFAULT_MAX_BACKOFF,
            reconnect: true,
        }
    }
}

/// Clonable frame sender backed by the transport's outgoing queue
///
/// By default queued frames survive a connection loss and are resent on
/// the next open. [`FrameSender::no_replay`] turns that off for senders
/// whose callers fail their pending work on `Closed` instead.
#[derive(Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Outgoing>,
    replay: bool,
}

impl FrameSender {
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(Outgoing {
                frame,
                replay: self.replay,
            })
            .await
            .map_err(|_| SkiffError::ConnectionClosed)
    }

    /// Send without waiting for queue space (fire and forget)
    pub fn send_nowait(&self, frame: Frame) {
        let _ = self.tx.try_send(Outgoing {
            frame,
            replay: self.replay,
        });
    }

    /// Frames from this sender are dropped on connection loss instead
    /// of being resent after reconnect.
    pub fn no_replay(mut self) -> Self {
        self.replay = false;
        self
    }
}

#[cfg(test)]
impl FrameSender {
    /// Detached sender for unit tests that inspect outgoing frames
    /// without a live socket.
    pub(crate) fn test_pair() -> (Self, mpsc::Receiver<Outgoing>) {
        let (tx, rx) = mpsc::channel(OUTGOING_QUEUE);
        (Self { tx, replay: true }, rx)
    }
}

/// One physical duplex connection to a logical endpoint
pub struct Transport {
    url: String,
    tx: mpsc::Sender<Outgoing>,
    state: watch::Receiver<TransportState>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl Transport {
    /// Spawn the supervisor task for `url` and return the transport
    /// handle plus its event stream. Does not wait for the socket to
    /// open; `send` queues until it does.
    pub fn connect(
        url: impl Into<String>,
        config: TransportConfig,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let url = url.into();
        let (tx, outgoing_rx) = mpsc::channel(OUTGOING_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);
        let (state_tx, state_rx) = watch::channel(TransportState::Connecting);

        let task = tokio::spawn(supervise(
            url.clone(),
            config,
            outgoing_rx,
            events_tx,
            state_tx,
        ));

        (
            Self {
                url,
                tx,
                state: state_rx,
                task: Some(task),
            },
            events_rx,
        )
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Current lifecycle state
    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    /// Get a frame sender that can be cloned
    pub fn sender(&self) -> FrameSender {
        FrameSender {
            tx: self.tx.clone(),
            replay: true,
        }
    }

    /// Queue a frame for transmission; waits in the outgoing queue if
    /// the socket is not yet open.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.sender().send(frame).await
    }

    /// Tear down immediately, without reconnecting.
    ///
    /// Dropping the transport and every cloned [`FrameSender`] instead
    /// closes the socket cleanly once the queue drains.
    pub fn close(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Owns the socket for the lifetime of the transport: connect, pump,
/// back off, retry.
async fn supervise(
    url: String,
    config: TransportConfig,
    mut outgoing: mpsc::Receiver<Outgoing>,
    events: mpsc::Sender<TransportEvent>,
    state: watch::Sender<TransportState>,
) {
    let mut backoff = Backoff::new(config.base_delay, config.max_backoff);
    let mut replay: VecDeque<Frame> = VecDeque::new();

    loop {
        let _ = state.send(TransportState::Connecting);

        match connect_async(url.as_str()).await {
            Ok((socket, _response)) => {
                backoff.reset();
                let _ = state.send(TransportState::Open);
                tracing::debug!(url = %url, "transport open");
                if events.send(TransportEvent::Open).await.is_err() {
                    return;
                }

                let clean = pump(socket, &mut outgoing, &mut replay, &events).await;
                if !clean {
                    purge_queue(&mut outgoing, &mut replay);
                }

                let _ = state.send(TransportState::Closed);
                if events.send(TransportEvent::Closed { clean }).await.is_err() {
                    return;
                }
                if clean || !config.reconnect {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "connect failed");
                let _ = state.send(TransportState::Closed);
                if !config.reconnect {
                    let _ = events.send(TransportEvent::Closed { clean: false }).await;
                    return;
                }
            }
        }

        let delay = backoff.next_delay();
        if events
            .send(TransportEvent::Reconnecting {
                attempt: backoff.attempt(),
                delay,
            })
            .await
            .is_err()
        {
            return;
        }
        tokio::time::sleep(delay).await;
    }
}

/// Pump one open socket until it closes. Returns whether the close was
/// locally initiated (clean).
///
/// Frames left in `replay` by a previous connection go out first; a
/// frame whose send fails goes back into `replay` (if its policy allows)
/// so it is not lost across the reconnect.
async fn pump(
    mut socket: WebSocketStream<MaybeTlsStream<TcpStream>>,
    outgoing: &mut mpsc::Receiver<Outgoing>,
    replay: &mut VecDeque<Frame>,
    events: &mpsc::Sender<TransportEvent>,
) -> bool {
    while let Some(frame) = replay.pop_front() {
        if let Err(e) = socket.send(frame.clone().into_message()).await {
            tracing::warn!(error = %e, "failed to resend frame");
            replay.push_front(frame);
            return false;
        }
    }

    loop {
        tokio::select! {
            out = outgoing.recv() => match out {
                Some(out) => {
                    if let Err(e) = socket.send(out.frame.clone().into_message()).await {
                        tracing::warn!(error = %e, "failed to send frame");
                        if out.replay {
                            replay.push_back(out.frame);
                        }
                        return false;
                    }
                }
                None => {
                    // Every sender dropped: local shutdown
                    let _ = socket.close(None).await;
                    return true;
                }
            },

            msg = socket.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if events.send(TransportEvent::Frame(Frame::Text(text))).await.is_err() {
                        return true;
                    }
                }
                Some(Ok(Message::Binary(data))) => {
                    if events.send(TransportEvent::Frame(Frame::Binary(data))).await.is_err() {
                        return true;
                    }
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) => {
                    tracing::info!("server closed connection");
                    return false;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "failed to receive frame");
                    return false;
                }
                None => {
                    return false;
                }
            },
        }
    }
}

/// Move frames still queued at an unclean close into the replay buffer.
/// Frames from no-replay senders are dropped here; anything queued
/// after this point waits for the next open as usual.
fn purge_queue(outgoing: &mut mpsc::Receiver<Outgoing>, replay: &mut VecDeque<Frame>) {
    while let Ok(out) = outgoing.try_recv() {
        if out.replay {
            replay.push_back(out.frame);
        } else {
            tracing::debug!("dropping queued frame on disconnect");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn test_config() -> TransportConfig {
        TransportConfig {
            base_delay: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            reconnect: true,
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

    #[tokio::test]
    async fn test_open_event_and_echo() {
        let (listener, url) = bind().await;
        let (transport, mut events) = Transport::connect(url, test_config());

        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            // Echo one frame back
            if let Some(Ok(msg)) = ws.next().await {
                ws.send(msg).await.unwrap();
            }
            ws
        });

        assert_eq!(events.recv().await, Some(TransportEvent::Open));

        transport.send(Frame::Text("hello".into())).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Frame(Frame::Text("hello".into())))
        );

        let _ws = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_binary_frames_pass_verbatim() {
        let (listener, url) = bind().await;
        let (transport, mut events) = Transport::connect(url, test_config());

        let payload = vec![0x00, 0x1b, 0xff, 0x03];
        let expected = payload.clone();

        let server = tokio::spawn(async move {
            let mut ws = accept(&listener).await;
            if let Some(Ok(msg)) = ws.next().await {
                ws.send(msg).await.unwrap();
            }
            ws
        });

        assert_eq!(events.recv().await, Some(TransportEvent::Open));
        transport.send(Frame::Binary(payload)).await.unwrap();
        assert_eq!(
            events.recv().await,
            Some(TransportEvent::Frame(Frame::Binary(expected)))
        );

        let _ws = server.await.unwrap();
    }

    #[tokio::test]
    async fn test_send_before_open_queues() {
        let (listener, url) = bind().await;
        let (transport, mut events) = Transport::connect(url, test_config());

        // Queue immediately; the socket may not have opened yet
        transport.send(Frame::Text("early".into())).await.unwrap();

        let mut ws = accept(&listener).await;
        assert_eq!(events.recv().await, Some(TransportEvent::Open));

        match ws.next().await {
            Some(Ok(Message::Text(text))) => assert_eq!(text, "early"),
            other => panic!("expected queued frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unclean_close_then_reconnect() {
        let (listener, url) = bind().await;
        let (_transport, mut events) = Transport::connect(url, test_config());

        // First connection: accept and drop straight away
        {
            let ws = accept(&listener).await;
            drop(ws);
        }

        assert_eq!(events.recv().await, Some(TransportEvent::Open));
        assert_eq!(events.recv().await, Some(TransportEvent::Closed { clean: false }));
        match events.recv().await {
            Some(TransportEvent::Reconnecting { attempt: 1, .. }) => {}
            other => panic!("expected reconnect notice, got {:?}", other),
        }

        // Second connection succeeds
        let _ws = accept(&listener).await;
        assert_eq!(events.recv().await, Some(TransportEvent::Open));
    }

    #[tokio::test]
    async fn test_no_reconnect_when_disabled() {
        let (listener, url) = bind().await;
        let config = TransportConfig {
            reconnect: false,
            ..test_config()
        };
        let (_transport, mut events) = Transport::connect(url, config);

        {
            let ws = accept(&listener).await;
            drop(ws);
        }

        assert_eq!(events.recv().await, Some(TransportEvent::Open));
        assert_eq!(events.recv().await, Some(TransportEvent::Closed { clean: false }));
        // Supervisor exits; the event stream ends
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_drop_closes_cleanly() {
        let (listener, url) = bind().await;
        let (transport, mut events) = Transport::connect(url, test_config());

        let mut ws = accept(&listener).await;
        assert_eq!(events.recv().await, Some(TransportEvent::Open));

        drop(transport);

        // Server observes a close frame rather than a broken pipe
        match ws.next().await {
            Some(Ok(Message::Close(_))) | None => {}
            other => panic!("expected close, got {:?}", other),
        }
        assert_eq!(events.recv().await, Some(TransportEvent::Closed { clean: true }));
        assert_eq!(events.recv().await, None);
    }

    #[tokio::test]
    async fn test_state_tracks_lifecycle() {
        let (listener, url) = bind().await;
        let (transport, mut events) = Transport::connect(url, test_config());

        let _ws = accept(&listener).await;
        assert_eq!(events.recv().await, Some(TransportEvent::Open));
        assert_eq!(transport.state(), TransportState::Open);
    }

    #[tokio::test]
    async fn test_purge_keeps_only_replay_frames() {
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(Outgoing { frame: Frame::Text("keystrokes".into()), replay: true })
            .await
            .unwrap();
        tx.send(Outgoing { frame: Frame::Text("rpc".into()), replay: false })
            .await
            .unwrap();
        tx.send(Outgoing { frame: Frame::Binary(vec![3]), replay: true })
            .await
            .unwrap();

        let mut replay = VecDeque::new();
        purge_queue(&mut rx, &mut replay);

        assert_eq!(
            replay,
            VecDeque::from(vec![Frame::Text("keystrokes".into()), Frame::Binary(vec![3])])
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_frame_queued_while_disconnected_flushes_on_reconnect() {
        let (listener, url) = bind().await;
        let (transport, mut events) = Transport::connect(url, test_config());

        {
            let ws = accept(&listener).await;
            drop(ws);
        }
        assert_eq!(events.recv().await, Some(TransportEvent::Open));
        assert_eq!(events.recv().await, Some(TransportEvent::Closed { clean: false }));

        transport.send(Frame::Text("typed offline".into())).await.unwrap();

        let mut ws = accept(&listener).await;
        match ws.next().await {
            Some(Ok(Message::Text(text))) => assert_eq!(text, "typed offline"),
            other => panic!("expected queued frame, got {:?}", other),
        }
    }
}
