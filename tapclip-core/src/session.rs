//! Send session: owns the single sender slot, the liveness counter and the watchdog.
//!
//! At most one send is active per process. Starting a second while one is running is
//! a no-op. The watchdog thread wakes once per tick; when the round-trip counter has
//! not moved for `watchdog_ticks` consecutive ticks it fails the send. It never
//! touches protocol state, only the counter and the outcome.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use uuid::Uuid;

use crate::collab::{SendCallbacks, Transport};
use crate::config::Config;
use crate::error::TransferError;
use crate::sender::{ConnectionEnd, RoundTripObserver, Sender};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How a send ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    TimedOut,
    Cancelled,
    Failed(String),
}

impl Outcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, Outcome::Completed)
    }
}

/// The process-wide "one send at a time" slot.
#[derive(Debug, Default)]
pub struct SenderSlot {
    active: Mutex<Option<SessionId>>,
}

impl SenderSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<SessionId> {
        let mut active = self.active.lock();
        if active.is_some() {
            return None;
        }
        let id = SessionId::new();
        *active = Some(id);
        Some(id)
    }

    /// Free the slot if `id` still holds it.
    pub fn release(&self, id: SessionId) -> bool {
        let mut active = self.active.lock();
        if *active == Some(id) {
            *active = None;
            true
        } else {
            false
        }
    }

    pub fn current(&self) -> Option<SessionId> {
        *self.active.lock()
    }

    pub fn is_busy(&self) -> bool {
        self.current().is_some()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("a send is already in progress")]
    Busy,
    #[error("failed to spawn watchdog: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Watchdog timing.
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    pub ticks: u32,
    pub tick: Duration,
}

impl Watchdog {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ticks: config.watchdog_ticks,
            tick: config.tick(),
        }
    }
}

struct Shared {
    id: SessionId,
    slot: Arc<SenderSlot>,
    callbacks: Arc<dyn SendCallbacks>,
    round_trips: AtomicU64,
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
}

impl Shared {
    /// Record the outcome once. Later calls are ignored.
    fn finish(&self, outcome: Outcome) -> bool {
        {
            let mut slot = self.outcome.lock();
            if slot.is_some() {
                return false;
            }
            *slot = Some(outcome.clone());
        }
        self.done.notify_all();
        self.slot.release(self.id);
        match &outcome {
            Outcome::Completed => tracing::info!(session = %self.id, "send finished"),
            other => tracing::warn!(session = %self.id, outcome = ?other, "send failed"),
        }
        self.callbacks.on_send_complete(outcome.succeeded());
        true
    }

    fn is_finished(&self) -> bool {
        self.outcome.lock().is_some()
    }

    /// Sleep up to `timeout` or until the session ends. True once finished.
    fn wait_finished(&self, timeout: Duration) -> bool {
        let mut outcome = self.outcome.lock();
        if outcome.is_none() {
            self.done.wait_for(&mut outcome, timeout);
        }
        outcome.is_some()
    }
}

impl RoundTripObserver for Shared {
    fn round_trip(&self, bytes_acked: u32, total: u32) {
        self.round_trips.fetch_add(1, Ordering::AcqRel);
        self.callbacks.on_progress(bytes_acked, total);
    }

    fn cancelled(&self) -> bool {
        self.is_finished()
    }
}

fn watch(shared: Arc<Shared>, watchdog: Watchdog) {
    let mut seen = shared.round_trips.load(Ordering::Acquire);
    let mut idle = 0u32;
    while !shared.wait_finished(watchdog.tick) {
        let now = shared.round_trips.load(Ordering::Acquire);
        if now != seen {
            seen = now;
            idle = 0;
            continue;
        }
        idle += 1;
        if idle >= watchdog.ticks {
            let err = TransferError::TransportTimeout { ticks: idle };
            tracing::warn!(session = %shared.id, error = %err, "watchdog expired");
            shared.finish(Outcome::TimedOut);
            break;
        }
        shared.callbacks.on_progress(idle, watchdog.ticks);
    }
    tracing::trace!(session = %shared.id, "watchdog exiting");
}

/// One active send.
pub struct SendSession {
    shared: Arc<Shared>,
    sender: Mutex<Sender>,
}

impl SendSession {
    /// Claim the slot and arm `sender`. Returns [`StartError::Busy`] without touching
    /// the running send if one is active.
    pub fn start(
        slot: &Arc<SenderSlot>,
        mut sender: Sender,
        callbacks: Arc<dyn SendCallbacks>,
        watchdog: Watchdog,
    ) -> Result<Arc<Self>, StartError> {
        let Some(id) = slot.try_acquire() else {
            tracing::debug!("send requested while another is active; ignoring");
            return Err(StartError::Busy);
        };
        sender.arm();
        let shared = Arc::new(Shared {
            id,
            slot: slot.clone(),
            callbacks,
            round_trips: AtomicU64::new(0),
            outcome: Mutex::new(None),
            done: Condvar::new(),
        });
        let for_watchdog = shared.clone();
        if let Err(e) = thread::Builder::new()
            .name("tapclip-watchdog".into())
            .spawn(move || watch(for_watchdog, watchdog))
        {
            slot.release(id);
            return Err(e.into());
        }
        tracing::info!(
            session = %id,
            kind = ?sender.source().kind(),
            bytes = sender.source().total_size(),
            "send armed"
        );
        shared.callbacks.on_send_enabled();
        Ok(Arc::new(Self {
            shared,
            sender: Mutex::new(sender),
        }))
    }

    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.shared.outcome.lock().clone()
    }

    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    /// Block until the session ends or `timeout` passes.
    pub fn wait(&self, timeout: Duration) -> Option<Outcome> {
        self.shared.wait_finished(timeout);
        self.outcome()
    }

    /// Serve one physical connection. Returns the outcome if the send is now over.
    pub fn on_connection<T: Transport + ?Sized>(&self, transport: &mut T) -> Option<Outcome> {
        if self.is_finished() {
            return self.outcome();
        }
        let result = {
            let mut sender = self.sender.lock();
            sender.run_connection(transport, &*self.shared)
        };
        match result {
            Ok(ConnectionEnd::Completed) => {
                self.shared.finish(Outcome::Completed);
            }
            Ok(ConnectionEnd::Disconnected) => {
                tracing::debug!(session = %self.id(), "connection ended; waiting for the next");
            }
            Ok(ConnectionEnd::Aborted(e)) => {
                tracing::debug!(session = %self.id(), error = %e, "connection abandoned");
            }
            Err(TransferError::Cancelled) => {}
            Err(e) => {
                self.shared.finish(Outcome::Failed(e.to_string()));
            }
        }
        self.outcome()
    }

    pub fn cancel(&self) {
        self.shared.finish(Outcome::Cancelled);
    }
}
