use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;

use chassis_protocol::ExitReport;
use chassis_protocol::wire::Frame;
use futures::SinkExt;
use futures::StreamExt;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::ChannelError;
use crate::FrameCodec;

/// Both directions of a connected socket, framed.
#[derive(Debug)]
pub(crate) struct Transport {
    pub(crate) reader: FramedRead<OwnedReadHalf, FrameCodec>,
    pub(crate) writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
}

impl Transport {
    pub(crate) fn new(stream: UnixStream, max_frame_bytes: usize) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FramedRead::new(read_half, FrameCodec::new(max_frame_bytes)),
            writer: FramedWrite::new(write_half, FrameCodec::new(max_frame_bytes)),
        }
    }
}

#[derive(Debug)]
enum Outgoing {
    Frame(Frame),
    /// Acknowledged once every frame queued before it has been written.
    Flush(oneshot::Sender<()>),
    Close,
}

#[derive(Debug, Default)]
struct PeerState {
    shutdown_reason: Option<String>,
    exit: Option<ExitReport>,
}

fn lock(peer: &Mutex<PeerState>) -> MutexGuard<'_, PeerState> {
    peer.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct ChannelTasks {
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

/// An established, handshaken connection to the peer process.
///
/// Frames are written by one task and read by another, so each direction is
/// delivered in order. Run loops only ever see a [`ChannelHandle`]; closing
/// consumes the channel, so it happens once.
#[derive(Debug)]
pub struct IpcChannel {
    label: String,
    outgoing: mpsc::Sender<Outgoing>,
    incoming: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    peer: Arc<Mutex<PeerState>>,
    shutdown: CancellationToken,
    peer_closed: CancellationToken,
    tasks: Option<ChannelTasks>,
}

impl IpcChannel {
    pub(crate) fn start(transport: Transport, send_buffer: usize, label: String) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(send_buffer);
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Mutex::new(PeerState::default()));
        let shutdown = CancellationToken::new();
        let peer_closed = CancellationToken::new();

        let writer = tokio::spawn(write_loop(transport.writer, outgoing_rx, label.clone()));
        let reader = tokio::spawn(read_loop(
            transport.reader,
            incoming_tx,
            Arc::clone(&peer),
            shutdown.clone(),
            peer_closed.clone(),
            label.clone(),
        ));

        Self {
            label,
            outgoing: outgoing_tx,
            incoming: Arc::new(tokio::sync::Mutex::new(incoming_rx)),
            peer,
            shutdown,
            peer_closed,
            tasks: Some(ChannelTasks { reader, writer }),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn handle(&self) -> ChannelHandle {
        ChannelHandle {
            outgoing: self.outgoing.clone(),
            incoming: Arc::clone(&self.incoming),
        }
    }

    /// Cancelled when the peer sends `shutdown`.
    pub fn shutdown_requested(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn shutdown_reason(&self) -> Option<String> {
        lock(&self.peer).shutdown_reason.clone()
    }

    /// Cancelled when the peer's side of the socket reaches EOF or fails.
    pub fn peer_closed(&self) -> CancellationToken {
        self.peer_closed.clone()
    }

    /// The `exit` report the peer sent, if any.
    pub fn peer_exit(&self) -> Option<ExitReport> {
        lock(&self.peer).exit.clone()
    }

    pub async fn request_shutdown(&self, reason: Option<String>) -> Result<(), ChannelError> {
        self.enqueue(Frame::Shutdown { reason }).await
    }

    pub async fn send_exit_report(&self, report: &ExitReport) -> Result<(), ChannelError> {
        self.enqueue(Frame::Exit(report.clone())).await
    }

    async fn enqueue(&self, frame: Frame) -> Result<(), ChannelError> {
        self.outgoing
            .send(Outgoing::Frame(frame))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Resolves once every frame queued so far has been written to the socket.
    pub async fn flush(&self) -> Result<(), ChannelError> {
        let (done_tx, done_rx) = oneshot::channel();
        self.outgoing
            .send(Outgoing::Flush(done_tx))
            .await
            .map_err(|_| ChannelError::Closed)?;
        done_rx.await.map_err(|_| ChannelError::Closed)
    }

    /// Gives in-flight frames up to `grace` to reach the socket. Returns
    /// whether everything was written in time.
    pub async fn drain(&self, grace: Duration) -> bool {
        match tokio::time::timeout(grace, self.flush()).await {
            Ok(Ok(())) => true,
            Ok(Err(err)) => {
                tracing::debug!("{}: drain stopped early: {err}", self.label);
                false
            }
            Err(_) => {
                tracing::warn!("{}: frames still queued after {grace:?}", self.label);
                false
            }
        }
    }

    /// Writes everything already queued, shuts down the write side and stops
    /// reading. Anything not written within `timeout` is dropped.
    pub async fn close(mut self, timeout: Duration) {
        let Some(ChannelTasks { reader, mut writer }) = self.tasks.take() else {
            return;
        };
        let outgoing = self.outgoing.clone();
        let closed = tokio::time::timeout(timeout, async {
            let _ = outgoing.send(Outgoing::Close).await;
            let _ = (&mut writer).await;
        })
        .await;
        if closed.is_err() {
            tracing::warn!("{}: close timed out after {timeout:?}", self.label);
            writer.abort();
        }
        reader.abort();
        tracing::debug!("{}: channel closed", self.label);
    }
}

impl Drop for IpcChannel {
    fn drop(&mut self) {
        if let Some(tasks) = self.tasks.take() {
            tasks.reader.abort();
            tasks.writer.abort();
        }
    }
}

/// What a run loop gets: it can exchange payloads but cannot close the
/// channel or redo the handshake.
#[derive(Debug, Clone)]
pub struct ChannelHandle {
    outgoing: mpsc::Sender<Outgoing>,
    incoming: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
}

impl ChannelHandle {
    /// Queues a payload without waiting. Fails with
    /// [`ChannelError::Backpressure`] when the send buffer is full.
    pub fn send(&self, data: impl Into<Vec<u8>>) -> Result<(), ChannelError> {
        self.outgoing
            .try_send(Outgoing::Frame(Frame::Payload { data: data.into() }))
            .map_err(|err| match err {
                mpsc::error::TrySendError::Full(_) => ChannelError::Backpressure,
                mpsc::error::TrySendError::Closed(_) => ChannelError::Closed,
            })
    }

    /// Next payload from the peer, or `None` once the peer is gone.
    pub async fn recv(&self) -> Option<Vec<u8>> {
        self.incoming.lock().await.recv().await
    }
}

async fn write_loop(
    mut writer: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut outgoing: mpsc::Receiver<Outgoing>,
    label: String,
) {
    while let Some(item) = outgoing.recv().await {
        match item {
            Outgoing::Frame(frame) => {
                let kind = frame.kind();
                if let Err(err) = writer.send(frame).await {
                    tracing::warn!("{label}: failed to write {kind} frame: {err}");
                    break;
                }
            }
            Outgoing::Flush(done) => {
                let _ = done.send(());
            }
            Outgoing::Close => break,
        }
    }
    if let Err(err) = writer.close().await {
        tracing::debug!("{label}: error shutting down write side: {err}");
    }
}

async fn read_loop(
    mut reader: FramedRead<OwnedReadHalf, FrameCodec>,
    incoming: mpsc::UnboundedSender<Vec<u8>>,
    peer: Arc<Mutex<PeerState>>,
    shutdown: CancellationToken,
    peer_closed: CancellationToken,
    label: String,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Frame::Payload { data }) => {
                // Nobody is listening any more; keep reading for control frames.
                let _ = incoming.send(data);
            }
            Ok(Frame::Shutdown { reason }) => {
                tracing::debug!("{label}: peer requested shutdown ({reason:?})");
                lock(&peer).shutdown_reason = reason;
                shutdown.cancel();
            }
            Ok(Frame::Exit(report)) => {
                tracing::debug!("{label}: peer exit report {report:?}");
                lock(&peer).exit = Some(report);
            }
            Ok(frame) => {
                tracing::warn!("{label}: ignoring unexpected {} frame", frame.kind());
            }
            Err(err) => {
                tracing::warn!("{label}: read failed: {err}");
                break;
            }
        }
    }
    peer_closed.cancel();
}
