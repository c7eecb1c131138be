//! Handle for one connected, authenticated session.

use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Notify, mpsc};

/// Capacity of each participant's outbound queue. A full queue means the
/// client has stopped draining; lines are dropped rather than blocking
/// the broadcaster.
pub const OUTBOUND_QUEUE: usize = 256;

/// One active chat session.
///
/// Owned by the [`Registry`](crate::registry::Registry) while registered.
/// The display name is only written while the registry lock is held; the
/// identity fingerprint never changes after the handshake. Delivery goes
/// through a bounded queue drained by the connection's writer task.
#[derive(Debug)]
pub struct Participant {
    name: Mutex<String>,
    fingerprint: String,
    outbound: mpsc::Sender<String>,
    unhealthy: AtomicBool,
    closed: Notify,
}

impl Participant {
    pub fn new(
        name: impl Into<String>,
        fingerprint: impl Into<String>,
        outbound: mpsc::Sender<String>,
    ) -> Self {
        Self {
            name: Mutex::new(name.into()),
            fingerprint: fingerprint.into(),
            outbound,
            unhealthy: AtomicBool::new(false),
            closed: Notify::new(),
        }
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    /// Callers must hold the registry lock; the registry is the sole
    /// authority for name changes.
    pub(crate) fn set_name(&self, name: String) {
        *self.name.lock() = name;
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Enqueue a line for delivery. Never blocks: if the queue is full or
    /// closed the line is dropped and the connection is flagged unhealthy
    /// so its read loop disconnects it.
    pub fn send(&self, line: impl Into<String>) {
        if self.outbound.try_send(line.into()).is_err() {
            tracing::warn!(name = %self.name(), "Outbound queue full or closed, dropping line");
            self.unhealthy.store(true, Ordering::Relaxed);
        }
    }

    pub fn is_unhealthy(&self) -> bool {
        self.unhealthy.load(Ordering::Relaxed)
    }

    /// Ask the connection handler to close the underlying transport.
    pub fn close(&self) {
        self.closed.notify_one();
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        self.closed.notified().await;
    }
}
