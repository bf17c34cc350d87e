//! Boundary to the datapath.
//!
//! A [`Backend`] moves raw frames; it knows nothing about their contents.
//! Two backends live here: [`UnixDatagramBackend`] for a datapath on the
//! same host, and [`MemoryBackend`] whose other end ([`MemoryDatapath`]) is
//! driven in-process by tests and simulations.
//!
//! Every queue on this boundary is bounded and every producer uses
//! `try_send`: a report or pattern that does not fit is dropped and logged,
//! never waited on.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::net::UnixDatagram;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::pattern::Pattern;
use crate::wire::{DecodeError, EncodeError, Message, MAX_FRAME_LEN};

// Large enough for several frames packed into one datagram.
const RECV_BUF_LEN: usize = 16 * MAX_FRAME_LEN;

#[derive(Debug, Error)]
pub enum DatapathError {
    #[error("datapath I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("could not encode frame: {0}")]
    Encode(#[from] EncodeError),
    #[error("queue full, message dropped")]
    QueueFull,
    #[error("datapath channel closed")]
    Closed,
    #[error("backend is already listening")]
    AlreadyListening,
    #[error("short write: {written} of {len} bytes")]
    ShortWrite { written: usize, len: usize },
}

impl<T> From<TrySendError<T>> for DatapathError {
    fn from(e: TrySendError<T>) -> Self {
        match e {
            TrySendError::Full(_) => DatapathError::QueueFull,
            TrySendError::Closed(_) => DatapathError::Closed,
        }
    }
}

/// Raw frame transport to and from a datapath.
pub trait Backend: Send + 'static {
    /// Send one encoded frame without blocking.
    fn send(&self, frame: &[u8]) -> Result<(), DatapathError>;

    /// Start receiving. Frames (or several frames packed back to back)
    /// arrive on the returned channel, which holds at most `depth` buffers.
    fn listen(&mut self, depth: usize) -> Result<mpsc::Receiver<Vec<u8>>, DatapathError>;

    /// Stop receiving and release any OS resources.
    fn close(&mut self) -> Result<(), DatapathError>;
}

/// Outbound handle given to one flow's algorithm.
#[derive(Debug, Clone)]
pub struct PatternSender {
    flow_id: u32,
    tx: mpsc::Sender<Message>,
}

impl PatternSender {
    pub fn new(flow_id: u32, tx: mpsc::Sender<Message>) -> Self {
        Self { flow_id, tx }
    }

    pub fn flow_id(&self) -> u32 {
        self.flow_id
    }

    /// Queue a pattern for this flow. Drops it if the queue is full.
    pub fn send(&self, pattern: Pattern) -> Result<(), DatapathError> {
        self.tx.try_send(Message::Pattern {
            flow_id: self.flow_id,
            pattern,
        })?;
        Ok(())
    }
}

/// Datagram socket pair on the local filesystem: frames are received on
/// `listen_path` and sent to `send_path`.
pub struct UnixDatagramBackend {
    socket: Arc<UnixDatagram>,
    listen_path: PathBuf,
    send_path: PathBuf,
    reader: Option<JoinHandle<()>>,
}

impl UnixDatagramBackend {
    /// Bind `listen_path`, replacing a stale socket file left by an earlier
    /// run. Must be called from within a tokio runtime.
    pub fn bind(
        listen_path: impl Into<PathBuf>,
        send_path: impl Into<PathBuf>,
    ) -> Result<Self, DatapathError> {
        let listen_path = listen_path.into();
        let send_path = send_path.into();

        remove_socket_file(&listen_path)?;
        let socket = UnixDatagram::bind(&listen_path)?;
        info!(
            "Datagram backend listening on {:?}, sending to {:?}",
            listen_path, send_path
        );

        Ok(Self {
            socket: Arc::new(socket),
            listen_path,
            send_path,
            reader: None,
        })
    }

    pub fn listen_path(&self) -> &Path {
        &self.listen_path
    }
}

impl Backend for UnixDatagramBackend {
    fn send(&self, frame: &[u8]) -> Result<(), DatapathError> {
        let written = self.socket.try_send_to(frame, &self.send_path)?;
        if written != frame.len() {
            return Err(DatapathError::ShortWrite {
                written,
                len: frame.len(),
            });
        }
        Ok(())
    }

    fn listen(&mut self, depth: usize) -> Result<mpsc::Receiver<Vec<u8>>, DatapathError> {
        if self.reader.is_some() {
            return Err(DatapathError::AlreadyListening);
        }

        let (tx, rx) = mpsc::channel(depth);
        let socket = Arc::clone(&self.socket);
        self.reader = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; RECV_BUF_LEN];
            loop {
                let n = match socket.recv(&mut buf).await {
                    Ok(n) => n,
                    Err(e) => {
                        error!("Datagram receive failed: {}", e);
                        break;
                    }
                };

                match tx.try_send(buf[..n].to_vec()) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        warn!("Inbound queue full, dropping {} byte datagram", n);
                    }
                    Err(TrySendError::Closed(_)) => break,
                }
            }
            debug!("Datagram reader stopped");
        }));

        Ok(rx)
    }

    fn close(&mut self) -> Result<(), DatapathError> {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        remove_socket_file(&self.listen_path)?;
        Ok(())
    }
}

impl Drop for UnixDatagramBackend {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

fn remove_socket_file(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// In-process backend. The datapath side is the paired [`MemoryDatapath`].
pub struct MemoryBackend {
    inbound: Option<mpsc::Receiver<Vec<u8>>>,
    outbound: mpsc::Sender<Vec<u8>>,
    closed: bool,
}

/// Datapath end of a [`MemoryBackend`].
pub struct MemoryDatapath {
    inbound: mpsc::Sender<Vec<u8>>,
    outbound: mpsc::Receiver<Vec<u8>>,
}

/// Create a connected backend/datapath pair whose queues hold `depth`
/// frames in each direction.
pub fn memory_pair(depth: usize) -> (MemoryBackend, MemoryDatapath) {
    let (in_tx, in_rx) = mpsc::channel(depth);
    let (out_tx, out_rx) = mpsc::channel(depth);
    (
        MemoryBackend {
            inbound: Some(in_rx),
            outbound: out_tx,
            closed: false,
        },
        MemoryDatapath {
            inbound: in_tx,
            outbound: out_rx,
        },
    )
}

impl Backend for MemoryBackend {
    fn send(&self, frame: &[u8]) -> Result<(), DatapathError> {
        if self.closed {
            return Err(DatapathError::Closed);
        }
        self.outbound.try_send(frame.to_vec())?;
        Ok(())
    }

    // The pair already owns its inbound queue; `depth` was fixed by
    // `memory_pair`.
    fn listen(&mut self, _depth: usize) -> Result<mpsc::Receiver<Vec<u8>>, DatapathError> {
        self.inbound.take().ok_or(DatapathError::AlreadyListening)
    }

    fn close(&mut self) -> Result<(), DatapathError> {
        self.closed = true;
        self.inbound = None;
        Ok(())
    }
}

impl MemoryDatapath {
    /// Encode `msg` and deliver it to the control plane.
    pub async fn send(&self, msg: &Message) -> Result<(), DatapathError> {
        self.send_raw(msg.encode()?).await
    }

    /// Deliver raw bytes, which need not be a well-formed frame.
    pub async fn send_raw(&self, frame: Vec<u8>) -> Result<(), DatapathError> {
        self.inbound
            .send(frame)
            .await
            .map_err(|_| DatapathError::Closed)
    }

    /// Next frame sent by the control plane, decoded. `None` once the
    /// backend is gone.
    pub async fn recv(&mut self) -> Option<Result<Message, DecodeError>> {
        let frame = self.outbound.recv().await?;
        Some(Message::decode(&frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DropEvent;

    #[tokio::test]
    async fn pattern_sender_tags_flow_id() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = PatternSender::new(42, tx);
        let pattern = Pattern::builder().set_window(1000).compile().unwrap();
        sender.send(pattern.clone()).unwrap();

        assert_eq!(
            rx.recv().await,
            Some(Message::Pattern {
                flow_id: 42,
                pattern
            })
        );
    }

    #[tokio::test]
    async fn pattern_sender_drops_when_full() {
        let (tx, _rx) = mpsc::channel(1);
        let sender = PatternSender::new(1, tx);
        let pattern = Pattern::builder().set_window(1000).compile().unwrap();
        sender.send(pattern.clone()).unwrap();
        assert!(matches!(
            sender.send(pattern),
            Err(DatapathError::QueueFull)
        ));
    }

    #[tokio::test]
    async fn pattern_sender_reports_closed_queue() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let sender = PatternSender::new(1, tx);
        let pattern = Pattern::builder().set_window(1000).compile().unwrap();
        assert!(matches!(sender.send(pattern), Err(DatapathError::Closed)));
    }

    #[tokio::test]
    async fn memory_pair_moves_frames_both_ways() {
        let (mut backend, mut datapath) = memory_pair(4);
        let mut inbound = backend.listen(4).unwrap();
        assert!(matches!(
            backend.listen(4),
            Err(DatapathError::AlreadyListening)
        ));

        let drop_msg = Message::Drop {
            flow_id: 3,
            event: DropEvent::DupAck,
        };
        datapath.send(&drop_msg).await.unwrap();
        let frame = inbound.recv().await.unwrap();
        assert_eq!(Message::decode(&frame).unwrap(), drop_msg);

        let pattern = Message::Pattern {
            flow_id: 3,
            pattern: Pattern::builder().set_window(5000).compile().unwrap(),
        };
        backend.send(&pattern.encode().unwrap()).unwrap();
        assert_eq!(datapath.recv().await.unwrap().unwrap(), pattern);

        backend.close().unwrap();
        assert!(matches!(backend.send(&[0]), Err(DatapathError::Closed)));
    }

    #[tokio::test]
    async fn unix_datagram_backend_exchanges_frames() {
        let dir = tempfile::tempdir().unwrap();
        let ccp_path = dir.path().join("ccp-in");
        let dp_path = dir.path().join("ccp-out");

        let datapath = UnixDatagram::bind(&dp_path).unwrap();
        let mut backend = UnixDatagramBackend::bind(&ccp_path, &dp_path).unwrap();
        let mut inbound = backend.listen(8).unwrap();

        let create = Message::Create {
            flow_id: 9,
            start_seq: 0,
            alg: "cubic".to_string(),
        };
        datapath
            .send_to(&create.encode().unwrap(), &ccp_path)
            .await
            .unwrap();
        let frame = inbound.recv().await.unwrap();
        assert_eq!(Message::decode(&frame).unwrap(), create);

        let pattern = Message::Pattern {
            flow_id: 9,
            pattern: Pattern::builder().set_window(14_600).compile().unwrap(),
        };
        backend.send(&pattern.encode().unwrap()).unwrap();
        let mut buf = [0u8; MAX_FRAME_LEN];
        let n = datapath.recv(&mut buf).await.unwrap();
        assert_eq!(Message::decode(&buf[..n]).unwrap(), pattern);

        backend.close().unwrap();
        assert!(!ccp_path.exists());
    }
}
