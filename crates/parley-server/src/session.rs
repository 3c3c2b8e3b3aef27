//! One live client connection.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use parley_core::envelope::Envelope;
use parley_core::ids::{ConnectionId, UserId};

use crate::errors::ChatError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Open,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// A connection as seen by the rest of the server.
///
/// The transport itself lives in the pump tasks; they talk to this struct
/// only through the bounded outbound queue and the state flag.
pub struct Session {
    id: ConnectionId,
    user: RwLock<Option<UserId>>,
    state: AtomicU8,
    /// `None` once closed. Dropping the sender is what ends the outbound pump.
    outbound: Mutex<Option<mpsc::Sender<Arc<String>>>>,
    capacity: usize,
    transport: CancellationToken,
    connected_at: Instant,
    dropped: AtomicU64,
}

impl Session {
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let session = Arc::new(Self {
            id: ConnectionId::new(),
            user: RwLock::new(None),
            state: AtomicU8::new(SessionState::Connecting as u8),
            outbound: Mutex::new(Some(tx)),
            capacity,
            transport: CancellationToken::new(),
            connected_at: Instant::now(),
            dropped: AtomicU64::new(0),
        });
        (session, rx)
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    pub fn user(&self) -> Option<UserId> {
        self.user.read().clone()
    }

    pub(crate) fn set_user(&self, user: UserId) {
        *self.user.write() = Some(user);
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// CONNECTING -> OPEN. False if the session already moved on.
    pub fn open(&self) -> bool {
        self.transition(SessionState::Connecting, SessionState::Open)
    }

    /// Move to CLOSING from CONNECTING or OPEN. False if already closing.
    pub fn begin_close(&self) -> bool {
        self.transition(SessionState::Open, SessionState::Closing)
            || self.transition(SessionState::Connecting, SessionState::Closing)
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the outbound queue and signal the transport to stop.
    ///
    /// Safe to call from any number of tasks; only the first call does the
    /// release and returns true.
    pub fn close(&self) -> bool {
        let previous = self.state.swap(SessionState::Closed as u8, Ordering::AcqRel);
        if previous == SessionState::Closed as u8 {
            return false;
        }
        drop(self.outbound.lock().take());
        self.transport.cancel();
        debug!(connection_id = %self.id, "session closed");
        true
    }

    /// Resolves once [`close`](Self::close) has run.
    pub async fn closed(&self) {
        self.transport.cancelled().await
    }

    /// Queue a frame without waiting. Fails immediately when the session is
    /// closing or its queue is full.
    pub fn send_message(&self, frame: Arc<String>) -> Result<(), ChatError> {
        if self.state() >= SessionState::Closing {
            return Err(self.closed_error());
        }
        let outbound = self.outbound.lock();
        let Some(tx) = outbound.as_ref() else {
            return Err(self.closed_error());
        };
        match tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(frame)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    connection_id = %self.id,
                    frame_len = frame.len(),
                    "outbound queue full"
                );
                Err(ChatError::Backpressure {
                    connection_id: self.id.clone(),
                })
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(self.closed_error()),
        }
    }

    pub fn send_envelope(&self, envelope: &Envelope) -> Result<(), ChatError> {
        self.send_message(Arc::new(envelope.encode()?))
    }

    fn closed_error(&self) -> ChatError {
        ChatError::Closed {
            connection_id: self.id.clone(),
        }
    }

    /// Frames currently waiting in the outbound queue.
    pub fn queued_len(&self) -> usize {
        self.outbound
            .lock()
            .as_ref()
            .map_or(0, |tx| self.capacity - tx.capacity())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn drop_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn age(&self) -> Duration {
        self.connected_at.elapsed()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("user", &self.user())
            .field("state", &self.state())
            .finish()
    }
}
