//! Per-slot worker threads.
//!
//! Each pod slot gets a dedicated OS thread that pulls jobs off a channel
//! and drives the slot's decode loop, so blocking engine calls never stall
//! whatever thread accepted the request. Cancellation bypasses the command
//! channel entirely: the slot's cancel flag is flipped directly, landing
//! even while the worker is deep inside a job.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::warn;

use crate::decode::{JobOutcome, JobRequest};
use crate::engine::ModelBackend;
use crate::error::Result;
use crate::pods::PodManager;

/// An owned job description, queueable across threads.
#[derive(Debug, Clone)]
pub struct WorkerJob {
    pub job_id: String,
    pub session_id: Option<String>,
    pub prompt: String,
}

enum WorkerCommand {
    Run(WorkerJob),
    Shutdown,
}

/// Events emitted by a slot worker.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// A job ran to completion (including cooperative cancellation).
    Finished { job_id: String, outcome: JobOutcome },

    /// A job failed; the slot remains usable.
    Failed { job_id: String, error: String },

    /// The worker thread has exited.
    Stopped,
}

/// Handle to one slot's worker thread.
pub struct SlotWorker<B: ModelBackend> {
    slot: usize,
    manager: Arc<PodManager<B>>,
    // Taken (and thereby closed) on shutdown so the worker's recv loop
    // terminates even when the shutdown nudge cannot be queued.
    cmd_tx: Option<Sender<WorkerCommand>>,
    event_rx: Receiver<WorkerEvent>,
    thread: Option<thread::JoinHandle<()>>,
}

impl<B: ModelBackend + 'static> SlotWorker<B> {
    /// Spawn a worker thread bound to one slot of the manager.
    pub fn spawn(manager: Arc<PodManager<B>>, slot: usize) -> Self {
        let (cmd_tx, cmd_rx) = bounded::<WorkerCommand>(16);
        let (event_tx, event_rx) = bounded::<WorkerEvent>(64);

        let loop_manager = Arc::clone(&manager);
        let thread = thread::Builder::new()
            .name(format!("pod-slot-{slot}"))
            .spawn(move || {
                worker_loop(loop_manager, slot, cmd_rx, event_tx);
            })
            .expect("failed to spawn slot worker thread");

        SlotWorker {
            slot,
            manager,
            cmd_tx: Some(cmd_tx),
            event_rx,
            thread: Some(thread),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Queue a job on this slot.
    pub fn submit(&self, job: WorkerJob) -> Result<()> {
        self.cmd_tx
            .as_ref()
            .expect("command channel open until shutdown")
            .send(WorkerCommand::Run(job))
            .map_err(|_| crate::error::PodError::SlotNotReady(self.slot))
    }

    /// Cancel whatever job the slot is running. Takes effect at the job's
    /// next iteration boundary; queued jobs are unaffected.
    pub fn cancel(&self) {
        if let Err(err) = self.manager.cancel(self.slot) {
            warn!(slot = self.slot, %err, "cancel request failed");
        }
    }

    /// Shut down the worker after any queued jobs finish.
    pub fn shutdown(mut self) {
        if let Some(cmd_tx) = self.cmd_tx.take() {
            let _ = cmd_tx.send(WorkerCommand::Shutdown);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    pub fn try_recv(&self) -> Option<WorkerEvent> {
        self.event_rx.try_recv().ok()
    }

    pub fn recv(&self) -> Option<WorkerEvent> {
        self.event_rx.recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<WorkerEvent> {
        self.event_rx.recv_timeout(timeout).ok()
    }
}

impl<B: ModelBackend> Drop for SlotWorker<B> {
    fn drop(&mut self) {
        // Never block here: nudge if the queue has room, then close the
        // channel by dropping the sender. The join waits for queued work.
        if let Some(cmd_tx) = self.cmd_tx.take() {
            let _ = cmd_tx.try_send(WorkerCommand::Shutdown);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn worker_loop<B: ModelBackend>(
    manager: Arc<PodManager<B>>,
    slot: usize,
    cmd_rx: Receiver<WorkerCommand>,
    event_tx: Sender<WorkerEvent>,
) {
    loop {
        match cmd_rx.recv() {
            Ok(WorkerCommand::Run(job)) => {
                let request = JobRequest {
                    job_id: &job.job_id,
                    session_id: job.session_id.as_deref(),
                    prompt: &job.prompt,
                };
                let event = match manager.dispatch_job(slot, &request) {
                    Ok(outcome) => WorkerEvent::Finished {
                        job_id: job.job_id,
                        outcome,
                    },
                    Err(err) => WorkerEvent::Failed {
                        job_id: job.job_id,
                        error: err.to_string(),
                    },
                };
                let _ = event_tx.send(event);
            }

            Ok(WorkerCommand::Shutdown) => {
                let _ = event_tx.send(WorkerEvent::Stopped);
                break;
            }

            Err(_) => break,
        }
    }
}
