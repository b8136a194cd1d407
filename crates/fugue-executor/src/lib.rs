//! # fugue-executor
//!
//! Worker-pool execution service for a Fugue scheduler.
//!
//! A coordinator thread pulls ready transactions from the scheduler,
//! materializes each execution context from its predecessor chain, and
//! hands the work to a pool of worker threads over an explicit job
//! channel. Workers apply payloads through a [`TransactionExecutor`] and
//! send outcomes back over a result channel; the coordinator records them
//! with `set_status`. The service exits when the schedule completes or is
//! abandoned.

#![warn(missing_docs)]
#![warn(clippy::all)]

use fugue_scheduler::{Scheduler, SchedulerError, TxnDispatch, TxnStatus};
use fugue_state::{ContextId, ContextManager, StateError};
use fugue_types::{Transaction, TxnId};
use parking_lot::Mutex;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Execution service errors
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The scheduler rejected an interaction
    #[error("scheduler failure: {0}")]
    Scheduler(#[from] SchedulerError),

    /// The state/context collaborator failed
    #[error("state context failure: {0}")]
    State(#[from] StateError),

    /// A worker thread died without draining its channel
    #[error("worker pool disconnected")]
    Disconnected,
}

/// Result type for execution service operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// Applies transaction payloads against execution contexts.
///
/// Implementations interpret the opaque payload, reading and writing
/// state through the [`ContextManager`] restricted to the transaction's
/// declared inputs and outputs. The returned flag is the transaction's
/// validity; `Err` is reserved for infrastructure failures and also
/// invalidates the transaction.
pub trait TransactionExecutor: Send + Sync {
    /// Execute `txn` against `context_id`; return whether it was valid
    fn execute(
        &self,
        txn: &Transaction,
        context_id: &ContextId,
        manager: &dyn ContextManager,
    ) -> ExecutorResult<bool>;
}

struct Job {
    dispatch: TxnDispatch,
    context_id: ContextId,
}

struct Report {
    txn_id: TxnId,
    status: TxnStatus,
}

/// Fixed-size worker pool that drains one scheduler to completion.
pub struct ExecutionService {
    workers: usize,
    poll_interval: Duration,
}

impl ExecutionService {
    /// Create a service with `workers` worker threads
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "worker count must be nonzero");
        Self {
            workers,
            poll_interval: Duration::from_millis(10),
        }
    }

    /// Override the result-channel polling interval
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Drive `scheduler` until it completes or is abandoned.
    ///
    /// The caller finalizes the scheduler (before or during the run);
    /// this method returns once every accepted transaction has a
    /// recorded outcome.
    pub fn run(
        &self,
        scheduler: Arc<dyn Scheduler>,
        manager: Arc<dyn ContextManager>,
        executor: Arc<dyn TransactionExecutor>,
    ) -> ExecutorResult<()> {
        let (job_tx, job_rx) = channel::<Job>();
        let (report_tx, report_rx) = channel::<Report>();
        let job_rx = Arc::new(Mutex::new(job_rx));

        let mut handles = Vec::with_capacity(self.workers);
        for worker_index in 0..self.workers {
            let job_rx = Arc::clone(&job_rx);
            let report_tx = report_tx.clone();
            let manager = Arc::clone(&manager);
            let executor = Arc::clone(&executor);
            handles.push(thread::spawn(move || {
                worker_loop(worker_index, &job_rx, &report_tx, &*manager, &*executor);
            }));
        }
        drop(report_tx);

        let outcome = self.coordinate(&scheduler, &manager, &job_tx, &report_rx);

        drop(job_tx);
        for handle in handles {
            let _ = handle.join();
        }
        outcome
    }

    fn coordinate(
        &self,
        scheduler: &Arc<dyn Scheduler>,
        manager: &Arc<dyn ContextManager>,
        job_tx: &Sender<Job>,
        report_rx: &Receiver<Report>,
    ) -> ExecutorResult<()> {
        loop {
            if scheduler.complete(false) {
                return Ok(());
            }
            if scheduler.is_abandoned() {
                tracing::debug!("scheduler abandoned, stopping execution service");
                return Ok(());
            }

            // Feed every currently-ready transaction to the pool.
            while let Some(dispatch) = scheduler.next_transaction() {
                let context_id = manager.create_context(
                    &dispatch.base_root,
                    &dispatch.base_contexts,
                    dispatch.txn.inputs(),
                    dispatch.txn.outputs(),
                )?;
                if job_tx
                    .send(Job {
                        dispatch,
                        context_id,
                    })
                    .is_err()
                {
                    return Err(ExecutorError::Disconnected);
                }
            }

            match report_rx.recv_timeout(self.poll_interval) {
                Ok(report) => {
                    self.record(scheduler, manager, report)?;
                    // Drain whatever else finished in the meantime.
                    while let Ok(report) = report_rx.try_recv() {
                        self.record(scheduler, manager, report)?;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ExecutorError::Disconnected);
                }
            }
        }
    }

    fn record(
        &self,
        scheduler: &Arc<dyn Scheduler>,
        manager: &Arc<dyn ContextManager>,
        report: Report,
    ) -> ExecutorResult<()> {
        match scheduler.set_status(&report.txn_id, report.status.clone()) {
            Ok(()) => Ok(()),
            Err(SchedulerError::Abandoned) => {
                // The block was discarded while the result was in flight.
                if let TxnStatus::Valid(ctx) = report.status {
                    manager.release_contexts(&[ctx]);
                }
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn worker_loop(
    worker_index: usize,
    job_rx: &Mutex<Receiver<Job>>,
    report_tx: &Sender<Report>,
    manager: &dyn ContextManager,
    executor: &dyn TransactionExecutor,
) {
    loop {
        let job = match job_rx.lock().recv() {
            Ok(job) => job,
            Err(_) => return,
        };
        let txn_id = job.dispatch.id().clone();

        let status = match executor.execute(&job.dispatch.txn, &job.context_id, manager) {
            Ok(true) => TxnStatus::Valid(job.context_id),
            Ok(false) => {
                manager.release_contexts(&[job.context_id]);
                TxnStatus::Invalid
            }
            Err(err) => {
                tracing::warn!(
                    worker = worker_index,
                    txn = %txn_id,
                    "execution failed: {err}"
                );
                manager.release_contexts(&[job.context_id]);
                TxnStatus::Invalid
            }
        };

        if report_tx.send(Report { txn_id, status }).is_err() {
            return;
        }
    }
}
