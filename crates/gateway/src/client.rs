//! Client handles: one per connected websocket
//!
//! A handle owns the sending half of a bounded outbound queue. The transport
//! drains the queue onto the socket; the gateway only ever enqueues, so a slow
//! socket never stalls a broadcast.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, Notify};

use crate::message::ServerNotice;

pub type ClientId = u64;

/// Default outbound queue depth per client
pub const DEFAULT_CLIENT_BUFFER: usize = 256;

static NEXT_CLIENT_ID: AtomicU64 = AtomicU64::new(1);

/// Pre-serialized text frame, shared by every recipient of a broadcast
pub type Frame = Arc<str>;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("outbound queue full")]
    Full,
    #[error("client closed")]
    Closed,
}

pub struct ClientHandle {
    id: ClientId,
    tx: mpsc::Sender<Frame>,
    closed: AtomicBool,
    close_signal: Notify,
}

impl ClientHandle {
    /// Create a handle plus the receiving end the transport writer drains.
    pub fn new(buffer: usize) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let handle = Arc::new(Self {
            id: NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed),
            tx,
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
        });
        (handle, rx)
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Enqueue a frame without waiting.
    pub fn try_deliver(&self, frame: Frame) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Best-effort control message; dropped if the queue is full.
    pub fn notify(&self, notice: &ServerNotice) -> bool {
        self.try_deliver(Arc::from(notice.to_json())).is_ok()
    }

    /// Mark the handle closed and wake the transport writer.
    ///
    /// Returns true only for the call that actually closed it.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close_signal.notify_one();
        true
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves once `close` has been called.
    pub async fn closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_signal.notified().await;
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
