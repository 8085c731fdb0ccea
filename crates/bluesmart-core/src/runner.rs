//! Serialized action execution.
//!
//! Each device owns one [`ActionRunner`]. Submitted intents run as whole
//! queues, one queue at a time, in submission order; within a queue a
//! failed action cancels the remainder unless its handler votes to
//! continue. The worker task is spawned on first use and parks itself when
//! an idle timeout is configured, disconnecting a still-linked device on
//! the way out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::action::ActionResult;
use crate::device::Device;
use crate::intent::Intent;

struct Job {
    device: Arc<Device>,
    intent: Intent,
}

#[derive(Default)]
struct WorkerLink {
    tx: Option<mpsc::UnboundedSender<Job>>,
}

/// Per-device queue executor.
pub(crate) struct ActionRunner {
    idle_timeout: Option<Duration>,
    link: Arc<Mutex<WorkerLink>>,
    pending: Arc<AtomicUsize>,
}

impl ActionRunner {
    pub(crate) fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            idle_timeout,
            link: Arc::new(Mutex::new(WorkerLink::default())),
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queues submitted but not yet fully executed.
    pub(crate) fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Hand a queue to the worker, reviving it if it parked.
    ///
    /// The link mutex is shared with the worker's park path, so a submit
    /// either lands on the live worker or observes it fully parked; a queue
    /// can never be stranded or run by two workers.
    pub(crate) fn submit(&self, device: Arc<Device>, intent: Intent) {
        if intent.is_empty() {
            return;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        let mut link = self.link.lock().unwrap();
        let job = Job { device, intent };
        if let Some(tx) = &link.tx {
            if tx.send(job).is_ok() {
                return;
            }
            // The worker is gone without parking cleanly (runtime shutdown);
            // the queue is dropped with it.
            link.tx = None;
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(job).is_ok() {
            tokio::spawn(worker(
                rx,
                self.idle_timeout,
                Arc::clone(&self.link),
                Arc::clone(&self.pending),
            ));
            link.tx = Some(tx);
        }
    }
}

async fn worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    idle_timeout: Option<Duration>,
    link: Arc<Mutex<WorkerLink>>,
    pending: Arc<AtomicUsize>,
) {
    // Held weakly so a parked worker does not keep its device alive.
    let mut last_device: Weak<Device> = Weak::new();
    loop {
        let job = match idle_timeout {
            Some(idle) => match tokio::time::timeout(idle, rx.recv()).await {
                Ok(Some(job)) => job,
                Ok(None) => break,
                Err(_) => {
                    // Park under the link mutex: either a racing submit
                    // already landed its job (run it), or the link is
                    // cleared and future submits spawn a fresh worker.
                    let racing = {
                        let mut link = link.lock().unwrap();
                        match rx.try_recv() {
                            Ok(job) => Some(job),
                            Err(_) => {
                                link.tx = None;
                                None
                            }
                        }
                    };
                    match racing {
                        Some(job) => job,
                        None => {
                            if let Some(device) = last_device.upgrade() {
                                if device.is_linked() {
                                    debug!(address = %device.address(), "idle timeout, disconnecting");
                                    if let Err(err) = device.disconnect().await {
                                        warn!(
                                            address = %device.address(),
                                            error = %err,
                                            "idle disconnect failed"
                                        );
                                    }
                                }
                            }
                            break;
                        }
                    }
                }
            },
            None => match rx.recv().await {
                Some(job) => job,
                None => break,
            },
        };
        last_device = Arc::downgrade(&job.device);
        run_queue(job).await;
        pending.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Run one queue to completion or abort.
///
/// Every action gets a verdict: executed actions report their real result,
/// and actions skipped by an abort report [`ActionResult::Cancelled`] so
/// their handlers still observe the outcome.
async fn run_queue(job: Job) {
    let actions = job.intent.into_actions();
    let total = actions.len();
    let mut iter = actions.into_iter();
    while let Some(action) = iter.next() {
        let result = action.execute(&job.device).await;
        let proceed = action.report(result);
        debug!(
            address = %job.device.address(),
            action = action.name(),
            ?result,
            proceed,
            "action finished"
        );
        if !proceed {
            let skipped = iter.len();
            if skipped > 0 {
                debug!(
                    address = %job.device.address(),
                    skipped,
                    total,
                    "queue aborted"
                );
            }
            for cancelled in iter {
                cancelled.report(ActionResult::Cancelled);
            }
            break;
        }
    }
}
