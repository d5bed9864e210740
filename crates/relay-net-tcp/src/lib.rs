//! The reference `Poller`: a non-blocking socket multiplexer backed by
//! Tokio's TCP stack.
//!
//! Sessions are owned here, not by the service loop: a listener task
//! accepts connections and, per accepted stream, a reader task and a
//! writer task run independently, each reporting back to the owning
//! service through the same MPSC envelope queue cross-service messages
//! travel over (see `relay_core::queue`). The loop that drains that
//! queue never touches Tokio's reactor directly — it only reacts to
//! [`PollerEvent`]s handed to it, which is what keeps a service's own
//! scheduling single-threaded and cooperative even though the bytes
//! underneath are moved by a multi-threaded runtime.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use relay_core::error::CoreError;
use relay_core::ids::SessionId;
use relay_core::poller::{Poller, PollerEvent, POLLER_EVENT_TAG};
use relay_core::queue::{Envelope, QueueSender};
use relay_core::session::CloseReason;

const READ_BUF_SIZE: usize = 64 * 1024;
/// Writer channel capacity; once it's full, `send` reports `WouldBlock`
/// instead of growing memory without bound — the Tokio-task analogue of
/// the contract's per-session send high-water mark.
const WRITER_CHANNEL_CAPACITY: usize = 256;

#[derive(Clone, Copy, Debug)]
pub struct ListenerHandle {
    pub id: u32,
    pub local_addr: SocketAddr,
}

/// A Tokio-backed `Poller`. Cheap to clone; every clone shares the same
/// session/writer table and event sink.
#[derive(Clone)]
pub struct TcpPoller {
    events: QueueSender,
    writers: Arc<DashMap<SessionId, mpsc::Sender<Bytes>>>,
    next_listener_id: Arc<AtomicU32>,
}

impl TcpPoller {
    pub fn new(events: QueueSender) -> Self {
        Self {
            events,
            writers: Arc::new(DashMap::new()),
            next_listener_id: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Spawns a listener task that accepts connections forever, pushing
    /// one [`PollerEvent::Accepted`] per accepted stream. Returns once
    /// the listener is bound so the caller can observe its real local
    /// address (useful when binding to port 0 in tests).
    pub async fn listen(&self, addr: SocketAddr) -> Result<ListenerHandle, CoreError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|err| CoreError::internal(format!("bind {addr} failed: {err}")).with_cause(err))?;
        let local_addr = listener
            .local_addr()
            .map_err(|err| CoreError::internal(err.to_string()).with_cause(err))?;
        let listener_id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);

        let events = self.events.clone();
        let writers = self.writers.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        let session_id = SessionId::next();
                        spawn_connection_tasks(stream, session_id, events.clone(), writers.clone());
                        let _ = events.push(Envelope::new(
                            POLLER_EVENT_TAG,
                            PollerEvent::Accepted {
                                listener_id,
                                session_id,
                                peer_addr,
                            },
                        ));
                    }
                    Err(err) => {
                        tracing::warn!(%err, listener_id, "accept failed, listener task exiting");
                        break;
                    }
                }
            }
        });

        Ok(ListenerHandle { id: listener_id, local_addr })
    }

    /// Allocates a session id up front and connects in the background,
    /// reporting [`PollerEvent::Connected`] or [`PollerEvent::ConnectFailed`].
    pub fn connect(&self, addr: SocketAddr) -> SessionId {
        let session_id = SessionId::next();
        let events = self.events.clone();
        let writers = self.writers.clone();
        tokio::spawn(async move {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    spawn_connection_tasks(stream, session_id, events.clone(), writers);
                    let _ = events.push(Envelope::new(
                        POLLER_EVENT_TAG,
                        PollerEvent::Connected { session_id, peer_addr: addr },
                    ));
                }
                Err(err) => {
                    tracing::warn!(%err, %session_id, "connect failed");
                    let _ = events.push(Envelope::new(
                        POLLER_EVENT_TAG,
                        PollerEvent::ConnectFailed { session_id },
                    ));
                }
            }
        });
        session_id
    }

    /// Queues `bytes` for send on `session_id`. Returns `WouldBlock` once
    /// the writer's backlog is full and `NotFound` if the session is
    /// unknown or already closed.
    pub fn send(&self, session_id: SessionId, bytes: Bytes) -> Result<(), CoreError> {
        let writer = self
            .writers
            .get(&session_id)
            .ok_or_else(|| CoreError::not_found(format!("session {session_id} not found")))?;
        writer.try_send(bytes).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => CoreError::would_block(),
            mpsc::error::TrySendError::Closed(_) => {
                CoreError::closed(format!("session {session_id} already closed"))
            }
        })
    }

    /// Drops this session's writer handle, which ends its writer task
    /// and, once the outstanding backlog drains, shuts the socket down.
    pub fn close(&self, session_id: SessionId) {
        self.writers.remove(&session_id);
    }

    pub fn is_open(&self, session_id: SessionId) -> bool {
        self.writers.contains_key(&session_id)
    }
}

impl Poller for TcpPoller {
    fn send(&self, session_id: SessionId, bytes: Bytes) -> Result<(), CoreError> {
        TcpPoller::send(self, session_id, bytes)
    }

    fn close(&self, session_id: SessionId) {
        TcpPoller::close(self, session_id)
    }

    fn is_open(&self, session_id: SessionId) -> bool {
        TcpPoller::is_open(self, session_id)
    }
}

fn spawn_connection_tasks(
    stream: TcpStream,
    session_id: SessionId,
    events: QueueSender,
    writers: Arc<DashMap<SessionId, mpsc::Sender<Bytes>>>,
) {
    let (read_half, write_half) = stream.into_split();
    let (writer_tx, writer_rx) = mpsc::channel(WRITER_CHANNEL_CAPACITY);
    writers.insert(session_id, writer_tx);

    tokio::spawn(reader_loop(read_half, session_id, events.clone()));
    tokio::spawn(writer_loop(write_half, writer_rx, session_id, events, writers));
}

async fn reader_loop(mut read_half: OwnedReadHalf, session_id: SessionId, events: QueueSender) {
    loop {
        let mut buf = BytesMut::with_capacity(READ_BUF_SIZE);
        match read_half.read_buf(&mut buf).await {
            Ok(0) => {
                let _ = events.push(Envelope::new(
                    POLLER_EVENT_TAG,
                    PollerEvent::Closed { session_id, reason: CloseReason::PeerClosed },
                ));
                break;
            }
            Ok(_n) => {
                let _ = events.push(Envelope::new(
                    POLLER_EVENT_TAG,
                    PollerEvent::Readable { session_id, bytes: buf.freeze() },
                ));
            }
            Err(err) => {
                tracing::warn!(%err, %session_id, "read failed");
                let _ = events.push(Envelope::new(
                    POLLER_EVENT_TAG,
                    PollerEvent::Closed { session_id, reason: CloseReason::IoError },
                ));
                break;
            }
        }
    }
}

async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Bytes>,
    session_id: SessionId,
    events: QueueSender,
    writers: Arc<DashMap<SessionId, mpsc::Sender<Bytes>>>,
) {
    let reason = loop {
        match rx.recv().await {
            Some(bytes) => {
                if let Err(err) = write_half.write_all(&bytes).await {
                    tracing::warn!(%err, %session_id, "write failed");
                    break CloseReason::IoError;
                }
            }
            None => break CloseReason::LocalClose,
        }
    };
    let _ = write_half.shutdown().await;
    writers.remove(&session_id);
    let _ = events.push(Envelope::new(
        POLLER_EVENT_TAG,
        PollerEvent::Closed { session_id, reason },
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::queue::MessageQueue;
    use std::time::Duration;

    async fn next_event(mq: &MessageQueue) -> PollerEvent {
        for _ in 0..200 {
            let mut out = Vec::new();
            if mq.drain_up_to(1, &mut out) == 1 {
                return out.pop().unwrap().downcast::<PollerEvent>().unwrap();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for a poller event");
    }

    #[tokio::test]
    async fn accept_connect_echo_round_trip() {
        let (tx, mq) = MessageQueue::new();
        let poller = TcpPoller::new(tx);

        let listener = poller.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let client_id = poller.connect(listener.local_addr);

        let accepted = next_event(&mq).await;
        let server_session_id = match accepted {
            PollerEvent::Accepted { session_id, .. } => session_id,
            other => panic!("expected Accepted, got {other:?}"),
        };

        let connected = next_event(&mq).await;
        assert!(matches!(connected, PollerEvent::Connected { session_id, .. } if session_id == client_id));

        poller.send(server_session_id, Bytes::from_static(b"hello")).unwrap();
        let readable = next_event(&mq).await;
        match readable {
            PollerEvent::Readable { session_id, bytes } => {
                assert_eq!(session_id, client_id);
                assert_eq!(&bytes[..], b"hello");
            }
            other => panic!("expected Readable, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_ends_the_session() {
        let (tx, mq) = MessageQueue::new();
        let poller = TcpPoller::new(tx);
        let listener = poller.listen("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let client_id = poller.connect(listener.local_addr);
        let _ = next_event(&mq).await; // Accepted
        let _ = next_event(&mq).await; // Connected

        assert!(poller.is_open(client_id));
        poller.close(client_id);
        assert!(!poller.is_open(client_id));

        let closed = next_event(&mq).await;
        assert!(matches!(
            closed,
            PollerEvent::Closed { reason: CloseReason::LocalClose, .. }
        ));
    }

    #[tokio::test]
    async fn send_on_unknown_session_is_not_found() {
        let (tx, _mq) = MessageQueue::new();
        let poller = TcpPoller::new(tx);
        let bogus = relay_core::ids::SessionId::from_raw(999_999);
        let err = poller.send(bogus, Bytes::from_static(b"x")).unwrap_err();
        assert_eq!(err.kind(), relay_core::error::ErrorKind::NotFound);
    }
}
