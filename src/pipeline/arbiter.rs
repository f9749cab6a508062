//! Bounded handoff of decoder input slots.
//!
//! The decoder announces free input slots from its own callback thread
//! through a [`SlotNotifier`]; the feed loop claims them from the
//! [`BufferArbiter`]. The two sides only share the bounded queue.

use log::{debug, warn};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::types::BufferSlot;
use crate::error::SessionError;

/// Returned when a slot is announced after the arbiter was closed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum NotifyError {
    #[error("Buffer arbiter closed")]
    Closed,
    #[error("Buffer arbiter queue full")]
    Full,
}

/// Producer side, handed to the decoder capability.
#[derive(Clone)]
pub struct SlotNotifier {
    tx: mpsc::Sender<BufferSlot>,
    queued: Arc<Mutex<HashSet<BufferSlot>>>,
}

impl SlotNotifier {
    /// Announce `slot` as free, waiting while the queue is full.
    ///
    /// Must be called from a thread outside the async runtime (the decoder's
    /// callback thread). Returns `Ok(false)` when the slot is already queued.
    pub fn notify_free(&self, slot: BufferSlot) -> Result<bool, NotifyError> {
        if !self.mark_queued(slot) {
            return Ok(false);
        }
        match self.tx.blocking_send(slot) {
            Ok(()) => Ok(true),
            Err(_) => {
                self.queued().remove(&slot);
                Err(NotifyError::Closed)
            }
        }
    }

    /// Non-blocking variant, usable from any context.
    pub fn try_notify_free(&self, slot: BufferSlot) -> Result<bool, NotifyError> {
        if !self.mark_queued(slot) {
            return Ok(false);
        }
        match self.tx.try_send(slot) {
            Ok(()) => Ok(true),
            Err(err) => {
                self.queued().remove(&slot);
                match err {
                    TrySendError::Full(_) => Err(NotifyError::Full),
                    TrySendError::Closed(_) => Err(NotifyError::Closed),
                }
            }
        }
    }

    fn mark_queued(&self, slot: BufferSlot) -> bool {
        let inserted = self.queued().insert(slot);
        if !inserted {
            warn!("BufferArbiter: {} announced twice, ignoring duplicate", slot);
        }
        inserted
    }

    fn queued(&self) -> MutexGuard<'_, HashSet<BufferSlot>> {
        self.queued.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Consumer side, owned by the feed loop.
pub struct BufferArbiter {
    rx: mpsc::Receiver<BufferSlot>,
    notifier: SlotNotifier,
    cancel: CancellationToken,
}

impl BufferArbiter {
    /// Create an arbiter holding at most `capacity` free slots. A pending
    /// claim is interrupted when `cancel` fires.
    pub fn new(capacity: usize, cancel: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            rx,
            notifier: SlotNotifier {
                tx,
                queued: Arc::new(Mutex::new(HashSet::new())),
            },
            cancel,
        }
    }

    pub fn notifier(&self) -> SlotNotifier {
        self.notifier.clone()
    }

    /// Number of free slots waiting to be claimed.
    pub fn available(&self) -> usize {
        self.rx.len()
    }

    /// Wait for a free slot.
    pub async fn claim(&mut self) -> Result<BufferSlot, SessionError> {
        let slot = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SessionError::Cancelled),
            slot = self.rx.recv() => slot,
        };

        match slot {
            Some(slot) => {
                self.notifier.queued().remove(&slot);
                Ok(slot)
            }
            None => Err(SessionError::Cancelled),
        }
    }

    /// Stop accepting announcements and drop every queued slot.
    ///
    /// Notifiers blocked on a full queue are released with `NotifyError::Closed`.
    pub fn close(&mut self) -> usize {
        self.rx.close();
        let mut abandoned = 0;
        while self.rx.try_recv().is_ok() {
            abandoned += 1;
        }
        self.notifier.queued().clear();
        if abandoned > 0 {
            debug!("BufferArbiter: abandoned {} free slots", abandoned);
        }
        abandoned
    }
}
