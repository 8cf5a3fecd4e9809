//! Deadline scheduling.
//!
//! The engine never blocks; it schedules typed deadline events through a
//! [`TimerService`] and reacts when the host feeds them back into
//! [`crate::manager::MeshManager::handle_timer`]. [`TokioTimers`] is the
//! production implementation (one sleeping task per deadline, fired events
//! drain through an mpsc channel the host owns); [`ManualTimers`] gives
//! tests full control of time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::access::MessageHandle;
use crate::lower::SarKey;

/// A scheduled deadline, usable for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub u64);

/// The typed deadline events of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    /// Inbound reassembly should acknowledge received segments.
    InboundAck(SarKey),
    /// Inbound reassembly gave up waiting for missing segments.
    InboundIncomplete(SarKey),
    /// An outbound segmented message saw no (complete) block-ack in time.
    OutboundRetransmit(MessageHandle),
    /// An acknowledged message saw no response in time.
    ResponseTimeout(MessageHandle),
    /// The provisioning session saw no peer PDU in time.
    ProvisioningTimeout,
}

/// Schedules deadline callbacks for the engine.
pub trait TimerService: Send + Sync {
    /// Schedules `event` to fire after `after`.
    fn schedule(&self, after: Duration, event: TimerEvent) -> TimerHandle;

    /// Cancels a scheduled event. Cancelling an already-fired or unknown
    /// handle is a no-op.
    fn cancel(&self, handle: TimerHandle);
}

/// Tokio-backed timer service.
///
/// Each deadline is a sleeping task; fired events land in the receiver
/// returned by [`TokioTimers::new`], which the host drains into
/// `MeshManager::handle_timer` on its serial queue. Requires a running
/// tokio runtime.
pub struct TokioTimers {
    next_id: AtomicU64,
    tx: mpsc::UnboundedSender<TimerEvent>,
    tasks: Mutex<HashMap<u64, tokio::task::JoinHandle<()>>>,
}

impl TokioTimers {
    /// Creates the service and the event stream it fires into.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TimerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                next_id: AtomicU64::new(1),
                tx,
                tasks: Mutex::new(HashMap::new()),
            }),
            rx,
        )
    }
}

impl TimerService for TokioTimers {
    fn schedule(&self, after: Duration, event: TimerEvent) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tx = self.tx.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(event);
        });

        let mut tasks = self.tasks.lock();
        tasks.retain(|_, task| !task.is_finished());
        tasks.insert(id, task);
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        if let Some(task) = self.tasks.lock().remove(&handle.0) {
            task.abort();
        }
    }
}

/// A pending entry in [`ManualTimers`].
#[derive(Debug, Clone)]
pub struct ScheduledTimer {
    /// Handle returned to the scheduler.
    pub handle: TimerHandle,
    /// Requested delay.
    pub after: Duration,
    /// The event to fire.
    pub event: TimerEvent,
}

/// Deterministic timer service for tests: nothing fires until the test
/// pops it.
#[derive(Default)]
pub struct ManualTimers {
    inner: Mutex<ManualInner>,
}

#[derive(Default)]
struct ManualInner {
    next_id: u64,
    scheduled: Vec<ScheduledTimer>,
}

impl ManualTimers {
    /// Creates an empty service.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of pending deadlines, in scheduling order.
    pub fn pending(&self) -> Vec<ScheduledTimer> {
        self.inner.lock().scheduled.clone()
    }

    /// Removes and returns the pending event with the shortest delay.
    pub fn pop_earliest(&self) -> Option<TimerEvent> {
        let mut inner = self.inner.lock();
        let index = inner
            .scheduled
            .iter()
            .enumerate()
            .min_by_key(|(_, timer)| timer.after)?
            .0;
        Some(inner.scheduled.remove(index).event)
    }

    /// Removes and returns the first pending event matching `predicate`.
    pub fn pop_matching(&self, predicate: impl Fn(&TimerEvent) -> bool) -> Option<TimerEvent> {
        let mut inner = self.inner.lock();
        let index = inner
            .scheduled
            .iter()
            .position(|timer| predicate(&timer.event))?;
        Some(inner.scheduled.remove(index).event)
    }
}

impl TimerService for ManualTimers {
    fn schedule(&self, after: Duration, event: TimerEvent) -> TimerHandle {
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let handle = TimerHandle(inner.next_id);
        inner.scheduled.push(ScheduledTimer {
            handle,
            after,
            event,
        });
        handle
    }

    fn cancel(&self, handle: TimerHandle) {
        self.inner
            .lock()
            .scheduled
            .retain(|timer| timer.handle != handle);
    }
}
