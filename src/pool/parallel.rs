// SPDX-License-Identifier: CC0-1.0

//! The thread-backed signing pool.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io;
use std::marker::PhantomData;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use zeroize::Zeroizing;

use crate::crypto::backend::{EcBackend, LibsecpBackend};
use crate::pool::worker::{worker_main, WorkerRequest, WorkerResponse};
use crate::pool::{BatchSigningResult, KeyGuard, SigningPool, SigningTask, TaskOutcome};

/// Configuration of a [`WorkerPool`].
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Longest a worker may hold a key copy for one batch. A worker still
    /// busy past this deadline is abandoned and replaced, and its tasks are
    /// reported as timed out.
    pub max_key_hold_time: Duration,
    /// Longest to wait for all workers to report ready.
    pub startup_timeout: Duration,
    /// Keep workers alive between batches. When `false` the pool shuts its
    /// workers down after every batch and respawns them on the next one.
    pub preserve_workers: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            worker_count: 4,
            max_key_hold_time: Duration::from_secs(30),
            startup_timeout: Duration::from_secs(10),
            preserve_workers: false,
        }
    }
}

struct Worker {
    id: usize,
    sender: Sender<WorkerRequest>,
    // Dropped without joining when the worker is replaced after a timeout.
    #[allow(dead_code)]
    handle: JoinHandle<()>,
}

/// A pool of worker threads signing batches in parallel.
///
/// Tasks are distributed round-robin. The caller's key buffer is zeroed
/// before [`SigningPool::sign_batch`] returns on every path; each worker
/// zeroes its own copy after its sub-batch.
pub struct WorkerPool<B: EcBackend + Default + Send + 'static = LibsecpBackend> {
    config: PoolConfig,
    workers: Vec<Worker>,
    responses: Receiver<WorkerResponse>,
    response_sender: Sender<WorkerResponse>,
    next_worker_id: usize,
    next_batch_id: u64,
    initialized: bool,
    _backend: PhantomData<fn() -> B>,
}

impl WorkerPool<LibsecpBackend> {
    /// Constructs a pool with the default configuration. Workers are spawned
    /// lazily on the first batch (or an explicit [`WorkerPool::initialize`]).
    pub fn new() -> Self { Self::with_config(PoolConfig::default()) }
}

impl Default for WorkerPool<LibsecpBackend> {
    fn default() -> Self { Self::new() }
}

impl<B: EcBackend + Default + Send + 'static> WorkerPool<B> {
    /// Constructs a pool with the given configuration.
    pub fn with_config(config: PoolConfig) -> Self {
        let (response_sender, responses) = mpsc::channel();
        WorkerPool {
            config,
            workers: Vec::new(),
            responses,
            response_sender,
            next_worker_id: 0,
            next_batch_id: 0,
            initialized: false,
            _backend: PhantomData,
        }
    }

    /// Spawns the configured number of workers and waits for each to report
    /// ready. Calling this on an initialized pool is a no-op.
    pub fn initialize(&mut self) -> Result<(), PoolError> {
        if self.initialized && !self.workers.is_empty() {
            return Ok(());
        }
        let worker_count = self.config.worker_count.max(1);
        while self.workers.len() < worker_count {
            let worker = self.spawn_worker()?;
            self.workers.push(worker);
        }

        if let Err(e) = self.await_ready() {
            // A failed initialize leaves no threads behind.
            self.shutdown();
            return Err(e);
        }
        log::debug!("worker pool initialized with {} workers", self.workers.len());
        self.initialized = true;
        Ok(())
    }

    /// Waits for every spawned worker to report ready.
    fn await_ready(&mut self) -> Result<(), PoolError> {
        let expected: BTreeSet<usize> = self.workers.iter().map(|worker| worker.id).collect();
        let mut ready = BTreeSet::new();
        let deadline = Instant::now() + self.config.startup_timeout;
        while !expected.is_subset(&ready) {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(PoolError::StartupTimeout)?;
            match self.responses.recv_timeout(remaining) {
                Ok(WorkerResponse::Ready { worker_id }) => {
                    ready.insert(worker_id);
                }
                // Stale messages from replaced or shut-down workers.
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => return Err(PoolError::StartupTimeout),
                Err(RecvTimeoutError::Disconnected) => return Err(PoolError::ShutDown),
            }
        }
        Ok(())
    }

    /// Tells every worker to shut down and joins them. Idempotent.
    pub fn shutdown(&mut self) {
        for worker in &self.workers {
            let _ = worker.sender.send(WorkerRequest::Shutdown);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.handle.join();
        }
        // Joined workers have queued their acks; drain them so the next
        // batch starts from an empty response channel.
        while let Ok(response) = self.responses.try_recv() {
            if let WorkerResponse::ShutdownAck { worker_id } = response {
                log::debug!("worker {} acknowledged shutdown", worker_id);
            }
        }
        self.initialized = false;
    }

    fn spawn_worker(&mut self) -> Result<Worker, PoolError> {
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        let (sender, requests) = mpsc::channel();
        let responses = self.response_sender.clone();
        let handle = thread::Builder::new()
            .name(format!("signer-{}", id))
            .spawn(move || worker_main::<B>(id, requests, responses))
            .map_err(|e| PoolError::Spawn(e.kind()))?;
        Ok(Worker { id, sender, handle })
    }

    /// Replaces a worker whose batch overran the key hold deadline. The old
    /// thread is detached; it exits once it notices its request channel is
    /// gone, zeroing its key copy on the way out.
    fn replace_worker(&mut self, worker_id: usize) {
        let slot = match self.workers.iter().position(|worker| worker.id == worker_id) {
            Some(slot) => slot,
            None => return,
        };
        log::warn!("replacing worker {} after a batch timeout", worker_id);
        match self.spawn_worker() {
            Ok(replacement) => {
                let stuck = std::mem::replace(&mut self.workers[slot], replacement);
                drop(stuck);
            }
            Err(e) => {
                log::warn!("failed to spawn a replacement worker: {}", e);
                self.workers.remove(slot);
                if self.workers.is_empty() {
                    self.initialized = false;
                }
            }
        }
    }

    /// Drains still-pending sub-batches into timeout errors, replacing the
    /// workers that hold them.
    fn fail_pending(
        &mut self,
        pending: &mut BTreeMap<usize, Vec<SigningTask>>,
        outcomes: &mut Vec<TaskOutcome>,
    ) {
        let stuck: Vec<usize> = pending.keys().copied().collect();
        for worker_id in stuck {
            let tasks = pending.remove(&worker_id).unwrap_or_default();
            log::warn!(
                "worker {} exceeded the key hold time with {} tasks outstanding",
                worker_id,
                tasks.len()
            );
            for task in tasks {
                outcomes.push(TaskOutcome {
                    task_id: task.task_id,
                    input_index: task.input_index,
                    result: Err(format!(
                        "signing timeout: worker {} held the key past the configured limit",
                        worker_id
                    )),
                });
            }
            self.replace_worker(worker_id);
        }
    }

    fn sign_batch_inner(
        &mut self,
        tasks: &[SigningTask],
        guard: &KeyGuard<'_>,
    ) -> Result<Vec<TaskOutcome>, PoolError> {
        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;

        let worker_count = self.workers.len();
        let mut assignments: Vec<Vec<SigningTask>> = vec![Vec::new(); worker_count];
        for (i, task) in tasks.iter().enumerate() {
            assignments[i % worker_count].push(task.clone());
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        let mut pending: BTreeMap<usize, Vec<SigningTask>> = BTreeMap::new();
        for (slot, sub) in assignments.into_iter().enumerate() {
            if sub.is_empty() {
                continue;
            }
            let worker_id = self.workers[slot].id;
            // Each participating worker gets its own self-zeroing key copy.
            let key = Zeroizing::new(*guard.bytes());
            let request = WorkerRequest::SignBatch { batch_id, tasks: sub.clone(), key };
            if self.workers[slot].sender.send(request).is_ok() {
                pending.insert(worker_id, sub);
            } else {
                for task in sub {
                    outcomes.push(TaskOutcome {
                        task_id: task.task_id,
                        input_index: task.input_index,
                        result: Err(format!("worker {} is gone", worker_id)),
                    });
                }
            }
        }

        let deadline = Instant::now() + self.config.max_key_hold_time;
        while !pending.is_empty() {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) => remaining,
                None => {
                    self.fail_pending(&mut pending, &mut outcomes);
                    break;
                }
            };
            match self.responses.recv_timeout(remaining) {
                Ok(WorkerResponse::BatchResult { worker_id, batch_id: id, outcomes: sub })
                    if id == batch_id =>
                {
                    pending.remove(&worker_id);
                    outcomes.extend(sub);
                }
                // Stale batch results, readiness of replacement workers and
                // shutdown acks are all ignorable here.
                Ok(_) => {}
                Err(RecvTimeoutError::Timeout) => {
                    self.fail_pending(&mut pending, &mut outcomes);
                    break;
                }
                Err(RecvTimeoutError::Disconnected) => return Err(PoolError::ShutDown),
            }
        }
        Ok(outcomes)
    }
}

impl<B: EcBackend + Default + Send + 'static> SigningPool for WorkerPool<B> {
    fn sign_batch(
        &mut self,
        tasks: &[SigningTask],
        key: &mut [u8; 32],
    ) -> Result<BatchSigningResult, PoolError> {
        let start = Instant::now();
        let guard = KeyGuard::new(key);
        self.initialize()?;

        let outcomes = if tasks.is_empty() {
            Vec::new()
        } else {
            self.sign_batch_inner(tasks, &guard)?
        };
        drop(guard);

        if !self.config.preserve_workers {
            self.shutdown();
        }
        Ok(BatchSigningResult::from_outcomes(outcomes, start.elapsed()))
    }
}

impl<B: EcBackend + Default + Send + 'static> Drop for WorkerPool<B> {
    fn drop(&mut self) { self.shutdown(); }
}

/// An error in the pool machinery itself. Per-task failures are reported
/// through [`BatchSigningResult`] instead.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum PoolError {
    /// Workers did not all report ready within the startup timeout.
    StartupTimeout,
    /// Spawning a worker thread failed.
    Spawn(io::ErrorKind),
    /// The pool's channels are gone.
    ShutDown,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use PoolError::*;

        match *self {
            StartupTimeout => f.write_str("timed out waiting for workers to report ready"),
            Spawn(kind) => write!(f, "failed to spawn a worker thread: {}", kind),
            ShutDown => f.write_str("the pool has shut down"),
        }
    }
}

impl std::error::Error for PoolError {}
