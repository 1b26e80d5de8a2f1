//! Fixed set of worker threads running verifications.
//!
//! Jobs are taken from a shared channel in submission order. The number of workers bounds how
//! many compilers and submitted programs run at once, whatever the number of sessions.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use anyhow::{anyhow, Context};
use tracing::{debug, error};

use crate::task_catalog::Task;

use super::{Judge, Verdict};

/// Continuation receiving the verdict, called on the worker thread.
pub type OnVerdict = Box<dyn FnOnce(anyhow::Result<Verdict>) + Send>;

pub struct VerificationJob {
    pub source: String,
    pub task: Arc<Task>,
    pub on_done: OnVerdict,
}

pub struct VerificationPool {
    sender: Option<mpsc::Sender<VerificationJob>>,
    workers: Vec<JoinHandle<()>>,
}

impl VerificationPool {
    /// Spawns `workers` threads (at least one) sharing `judge`.
    pub fn new(judge: Arc<dyn Judge>, workers: usize) -> anyhow::Result<VerificationPool> {
        let (sender, receiver) = mpsc::channel::<VerificationJob>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|i| {
                let judge = judge.clone();
                let receiver = receiver.clone();
                std::thread::Builder::new()
                    .name(format!("verifier-{i}"))
                    .spawn(move || work(judge.as_ref(), &receiver))
                    .context("could not spawn verification worker")
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(VerificationPool {
            sender: Some(sender),
            workers,
        })
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    pub fn submit(&self, job: VerificationJob) -> anyhow::Result<()> {
        self.sender
            .as_ref()
            .ok_or_else(|| anyhow!("verification pool is shut down"))?
            .send(job)
            .map_err(|_| anyhow!("verification workers are gone"))
    }

    /// Lets the workers finish the queued jobs, then joins them.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("verification worker panicked");
            }
        }
    }
}

impl Drop for VerificationPool {
    fn drop(&mut self) {
        // joining here could deadlock when the last owner is a job continuation
        self.sender.take();
    }
}

fn work(judge: &dyn Judge, receiver: &Mutex<mpsc::Receiver<VerificationJob>>) {
    loop {
        let job = {
            let receiver = receiver.lock().unwrap_or_else(PoisonError::into_inner);
            receiver.recv()
        };
        let Ok(job) = job else {
            debug!("verification worker exiting");
            return;
        };

        let VerificationJob {
            source,
            task,
            on_done,
        } = job;
        let verdict = catch_unwind(AssertUnwindSafe(|| judge.judge(&source, &task)))
            .unwrap_or_else(|_| Err(anyhow!("verifier panicked")));
        if catch_unwind(AssertUnwindSafe(move || on_done(verdict))).is_err() {
            error!("verification continuation panicked");
        }
    }
}
