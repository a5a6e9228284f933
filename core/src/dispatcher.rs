//! Post-commit dispatcher.
//!
//! RULE: Jobs are enqueued only after their unit of work committed,
//! while the store is still held, so queue order is commit order.
//! One worker drains the queue, so stats updates apply in that order.
//!
//! RULE: Nothing that happens here can fail a settlement. Stats
//! failures are retried and then repaired by a rebuild; notification
//! failures are retried and then dropped with an error log. Jobs still
//! queued behind such a rebuild are skipped for the rows it covered.

use crate::{
    config::EngineConfig,
    engine::SettlementResult,
    error::{EngineError, EngineResult},
    event::EngineEvent,
    ledger::LedgerEntry,
    notification::{Notification, NotificationEmitter},
    request::Request,
    retry::RetryPolicy,
    rng::JitterRng,
    stats::StatsAggregator,
    types::AccountId,
};
use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Condvar, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

/// A committed outcome waiting for its side effects.
#[derive(Debug, Clone)]
pub enum PostCommit {
    Created(Request),
    Settled(SettlementResult),
    PaidOut(LedgerEntry),
}

#[derive(Debug, Clone)]
pub struct Job {
    pub work:  PostCommit,
    pub event: EngineEvent,
    /// event_log position written by the committing unit of work.
    pub seq:   i64,
}

impl Job {
    fn accounts(&self) -> Vec<AccountId> {
        self.event.account_ids()
    }
}

#[derive(Default)]
struct Backlog {
    pending: Mutex<usize>,
    drained: Condvar,
}

impl Backlog {
    fn add(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending += 1;
        }
    }

    fn done(&self) {
        if let Ok(mut pending) = self.pending.lock() {
            *pending = pending.saturating_sub(1);
            if *pending == 0 {
                self.drained.notify_all();
            }
        }
    }
}

pub struct Dispatcher {
    sender:  Mutex<Option<Sender<Job>>>,
    worker:  Mutex<Option<JoinHandle<()>>>,
    backlog: Arc<Backlog>,
}

impl Dispatcher {
    pub fn spawn(
        stats:   Arc<StatsAggregator>,
        emitter: Arc<dyn NotificationEmitter>,
        config:  &EngineConfig,
    ) -> EngineResult<Self> {
        let (tx, rx) = mpsc::channel();
        let backlog = Arc::new(Backlog::default());
        let worker = Worker {
            stats,
            emitter,
            stats_policy:  RetryPolicy::from(&config.stats_retry),
            notify_policy: RetryPolicy::from(&config.notify_retry),
            rng:           JitterRng::new(config.jitter_seed, 0),
            backlog:       backlog.clone(),
        };
        let handle = thread::Builder::new()
            .name("songbid-dispatch".into())
            .spawn(move || worker.run(rx))
            .map_err(|e| EngineError::Other(anyhow::anyhow!("cannot spawn dispatcher: {e}")))?;

        Ok(Self {
            sender:  Mutex::new(Some(tx)),
            worker:  Mutex::new(Some(handle)),
            backlog,
        })
    }

    pub fn enqueue(&self, job: Job) {
        self.backlog.add();
        let sent = self
            .sender
            .lock()
            .ok()
            .and_then(|guard| guard.as_ref().map(|tx| tx.send(job).is_ok()))
            .unwrap_or(false);
        if !sent {
            log::error!("dispatcher is shut down; post-commit job dropped");
            self.backlog.done();
        }
    }

    /// Jobs enqueued but not yet fully processed.
    pub fn depth(&self) -> usize {
        self.backlog.pending.lock().map(|p| *p).unwrap_or(0)
    }

    /// Block until every enqueued job has been processed.
    pub fn flush(&self) {
        let drained = self
            .backlog
            .pending
            .lock()
            .and_then(|pending| self.backlog.drained.wait_while(pending, |p| *p > 0).map(drop));
        if drained.is_err() {
            log::error!("dispatcher backlog lock poisoned; flush gave up");
        }
    }

    /// As `flush`, giving up after `timeout`. True if drained.
    pub fn flush_timeout(&self, timeout: Duration) -> bool {
        match self.backlog.pending.lock() {
            Ok(pending) => self
                .backlog
                .drained
                .wait_timeout_while(pending, timeout, |p| *p > 0)
                .map(|(_, result)| !result.timed_out())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Stop accepting jobs, drain what is queued, join the worker.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let handle = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log::error!("dispatcher worker panicked");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker {
    stats:         Arc<StatsAggregator>,
    emitter:       Arc<dyn NotificationEmitter>,
    stats_policy:  RetryPolicy,
    notify_policy: RetryPolicy,
    rng:           JitterRng,
    backlog:       Arc<Backlog>,
}

impl Worker {
    fn run(mut self, rx: Receiver<Job>) {
        for job in rx {
            self.update_stats(&job);
            self.notify(&job);
            self.backlog.done();
        }
        log::debug!("dispatcher worker stopped");
    }

    fn update_stats(&mut self, job: &Job) {
        let stats = &self.stats;
        let outcome = self.stats_policy.run("stats update", &mut self.rng, |_| match &job.work {
            PostCommit::Created(request) => stats.on_created(request, job.seq),
            PostCommit::Settled(result) => stats.on_settlement(result, job.seq),
            PostCommit::PaidOut(entry) => stats.on_payout(entry, job.seq),
        });
        if let Err(err) = outcome {
            log::error!(
                "stats update for {} failed after retries: {err}; rebuilding",
                job.event.type_name()
            );
            for account in job.accounts() {
                if let Err(err) = stats.rebuild(&account) {
                    log::error!("stats rebuild for {account} failed: {err}");
                }
            }
        }
    }

    fn notify(&mut self, job: &Job) {
        let notification = Notification::from(&job.event);
        let emitter = &self.emitter;
        let outcome = self.notify_policy.run("notify", &mut self.rng, |_| {
            panic::catch_unwind(AssertUnwindSafe(|| emitter.emit(&notification)))
                .unwrap_or_else(|_| Err(anyhow::anyhow!("emitter panicked")))
        });
        if let Err(err) = outcome {
            log::error!(
                "dropping {} notification for {:?}: {err}",
                notification.event_type,
                notification.request_id
            );
        }
    }
}
