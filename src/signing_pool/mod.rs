//! A pool of signing workers that sign batches of precomputed hashes with one key.
//!
//! Each worker is a thread with its own key slot. Key bytes cross the thread
//! boundary only as an owned [`KeyMaterial`] copy inside a request, and every
//! worker wipes its slot once a batch is done. A worker that overruns a
//! watchdog is retired for good and replaced by a fresh one.

pub mod backend;
pub mod keys;
pub mod message;
mod worker;

pub use backend::{default_backends, BackendFactory, EccBackend, Secp256k1Backend, SECP256K1_BACKEND};
pub use keys::KeyMaterial;
pub use message::{
    SignRequest, SignatureType, SigningTask, TaskError, TaskResult, WorkerRequest, WorkerResponse,
};

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::error::{Error, Result, WorkerFault};

use worker::{WorkerHandle, WorkerHooks};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    Initializing,
    Idle,
    Busy,
    ShuttingDown,
    Terminated,
}

impl WorkerState {
    pub fn can_transition_to(self, next: WorkerState) -> bool {
        use WorkerState::*;
        matches!(
            (self, next),
            (Initializing, Idle)
                | (Initializing, Terminated)
                | (Idle, Busy)
                | (Busy, Idle)
                | (Busy, Terminated)
                | (Idle, ShuttingDown)
                | (Initializing, ShuttingDown)
                | (ShuttingDown, Terminated)
        )
    }
}

fn default_num_workers() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub num_workers: usize,
    /// Longest a worker may go without reporting progress on a batch.
    pub task_timeout_ms: u64,
    /// Longest a worker may hold a key for one batch.
    pub max_key_hold_time_ms: u64,
    /// Keep workers between batches instead of starting fresh ones each time.
    pub preserve_workers: bool,
    pub backend: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            task_timeout_ms: 5_000,
            max_key_hold_time_ms: 30_000,
            preserve_workers: true,
            backend: SECP256K1_BACKEND.to_string(),
        }
    }
}

impl PoolConfig {
    fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    fn max_key_hold(&self) -> Duration {
        Duration::from_millis(self.max_key_hold_time_ms)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParallelSigningResult {
    pub results: Vec<TaskResult>,
    pub errors: Vec<TaskError>,
    /// Inputs rejected before dispatch, such as for a disallowed sighash type.
    pub skipped: Vec<(usize, Error)>,
    task_count: usize,
}

impl ParallelSigningResult {
    /// True only when every task produced a signature and no input was skipped.
    pub fn success(&self) -> bool {
        self.errors.is_empty() && self.skipped.is_empty() && self.results.len() == self.task_count
    }

    /// Errors for one input.
    pub fn errors_for_input(&self, input_index: usize) -> impl Iterator<Item = &TaskError> {
        self.errors
            .iter()
            .filter(move |e| e.input_index == Some(input_index))
    }
}

/// A sub-batch a worker is currently signing.
struct InFlight {
    batch_id: u64,
    tasks: Vec<SigningTask>,
    dispatched_at: Instant,
    last_progress: Instant,
}

impl InFlight {
    /// When the first of the two watchdogs fires for `worker_id`, and the fault it reports.
    fn expiry(&self, config: &PoolConfig, worker_id: usize) -> (Instant, WorkerFault) {
        let task_deadline = self.last_progress + config.task_timeout();
        let hold_deadline = self.dispatched_at + config.max_key_hold();
        if hold_deadline <= task_deadline {
            let fault = WorkerFault::KeyHoldExceeded {
                worker_id,
                max_hold_ms: config.max_key_hold_time_ms,
            };
            (hold_deadline, fault)
        } else {
            let fault = WorkerFault::TaskTimeout {
                worker_id,
                timeout_ms: config.task_timeout_ms,
            };
            (task_deadline, fault)
        }
    }
}

/// Outcomes of one `sign_batch` call, keyed by task id.
#[derive(Default)]
struct Outcomes {
    results: HashMap<u64, TaskResult>,
    errors: HashMap<u64, TaskError>,
    unattributed: Vec<TaskError>,
}

impl Outcomes {
    fn record_result(&mut self, result: TaskResult) {
        self.errors.remove(&result.task_id);
        self.results.insert(result.task_id, result);
    }

    fn record_error(&mut self, error: TaskError) {
        match error.task_id {
            Some(task_id) if !self.results.contains_key(&task_id) => {
                self.errors.insert(task_id, error);
            }
            Some(_) => {}
            None => self.unattributed.push(error),
        }
    }

    fn is_done(&self, task_id: u64) -> bool {
        self.results.contains_key(&task_id) || self.errors.contains_key(&task_id)
    }

    fn into_result(self, tasks: &[SigningTask]) -> ParallelSigningResult {
        let mut results: Vec<_> = self.results.into_values().collect();
        results.sort_by_key(|r| r.task_id);
        let mut errors: Vec<_> = self.errors.into_values().collect();
        errors.sort_by_key(|e| e.task_id);
        errors.extend(self.unattributed);
        ParallelSigningResult {
            results,
            errors,
            skipped: Vec::new(),
            task_count: tasks.len(),
        }
    }
}

pub struct SigningPool {
    config: PoolConfig,
    factory: BackendFactory,
    workers: Vec<WorkerHandle>,
    responses: Receiver<(usize, WorkerResponse)>,
    response_sender: Sender<(usize, WorkerResponse)>,
    next_worker_id: usize,
    next_batch_id: u64,
    shut_down: bool,
    hooks: WorkerHooks,
}

impl std::fmt::Debug for SigningPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningPool")
            .field("config", &self.config)
            .field("workers", &self.workers.len())
            .field("shut_down", &self.shut_down)
            .finish_non_exhaustive()
    }
}

impl SigningPool {
    pub fn acquire(config: PoolConfig) -> Result<Self> {
        Self::acquire_with_backends(config, default_backends())
    }

    /// Start the pool and wait until every worker has loaded its backend.
    pub fn acquire_with_backends(config: PoolConfig, factory: BackendFactory) -> Result<Self> {
        Self::start(config, factory, WorkerHooks::default())
    }

    fn start(config: PoolConfig, factory: BackendFactory, hooks: WorkerHooks) -> Result<Self> {
        let (response_sender, responses) = mpsc::channel();
        let mut pool = Self {
            config,
            factory,
            workers: Vec::new(),
            responses,
            response_sender,
            next_worker_id: 0,
            next_batch_id: 0,
            shut_down: false,
            hooks,
        };
        pool.start_workers()?;
        log::debug!("signing pool started with {} workers", pool.workers.len());
        Ok(pool)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.workers.iter().map(|w| w.state).collect()
    }

    fn spawn_worker(&mut self) -> Result<usize> {
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        let handle = WorkerHandle::spawn(
            id,
            self.factory.clone(),
            &self.config.backend,
            self.config.max_key_hold(),
            self.response_sender.clone(),
            self.hooks.clone(),
        )?;
        self.workers.push(handle);
        Ok(id)
    }

    fn worker_mut(&mut self, id: usize) -> Option<&mut WorkerHandle> {
        self.workers.iter_mut().find(|w| w.id == id)
    }

    fn start_workers(&mut self) -> Result<()> {
        let count = self.config.num_workers.max(1);
        let mut pending = HashSet::new();
        for _ in 0..count {
            pending.insert(self.spawn_worker()?);
        }

        let deadline = Instant::now() + self.config.task_timeout();
        while !pending.is_empty() {
            let wait = deadline.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(wait) {
                Ok((id, WorkerResponse::Ready)) if pending.remove(&id) => {
                    if let Some(worker) = self.worker_mut(id) {
                        worker.transition(WorkerState::Idle)?;
                    }
                }
                Ok((id, WorkerResponse::Error(error))) if pending.contains(&id) => {
                    self.terminate_all();
                    return Err(error.fault.into());
                }
                Ok(_) => {}
                Err(_) => {
                    self.terminate_all();
                    return Err(WorkerFault::TaskTimeout {
                        worker_id: pending.iter().copied().min().unwrap_or_default(),
                        timeout_ms: self.config.task_timeout_ms,
                    }
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Retire a worker that overran a watchdog or lost its channel, and start
    /// a replacement. The replacement joins once its `Ready` arrives.
    fn replace_worker(&mut self, id: usize) -> Result<()> {
        if let Some(index) = self.workers.iter().position(|w| w.id == id) {
            let mut worker = self.workers.remove(index);
            if worker.state == WorkerState::Busy {
                worker.transition(WorkerState::Terminated)?;
            }
            worker.retire();
        }
        let replacement = self.spawn_worker()?;
        log::warn!("signing worker {} retired, replaced by worker {}", id, replacement);
        Ok(())
    }

    /// Sign every task with `private_key`.
    ///
    /// Tasks are split round-robin into one sub-batch per worker. Failures are
    /// reported per task in [`ParallelSigningResult::errors`] and never stop
    /// sibling tasks.
    pub fn sign_batch(&mut self, tasks: Vec<SigningTask>, private_key: &[u8; 32]) -> Result<ParallelSigningResult> {
        if self.shut_down {
            return Err(Error::PoolShutdown);
        }
        if tasks.is_empty() {
            return Ok(ParallelSigningResult::default());
        }
        if self.workers.is_empty() {
            self.start_workers()?;
        }

        let chunk_count = self.workers.len().min(tasks.len());
        let mut queue: VecDeque<(u64, Vec<SigningTask>)> = VecDeque::new();
        let mut chunks: Vec<Vec<SigningTask>> = vec![Vec::new(); chunk_count];
        for (i, task) in tasks.iter().enumerate() {
            chunks[i % chunk_count].push(task.clone());
        }
        for chunk in chunks {
            queue.push_back((self.next_batch_id, chunk));
            self.next_batch_id += 1;
        }

        let mut outcomes = Outcomes::default();
        let mut in_flight: HashMap<usize, InFlight> = HashMap::new();
        let mut idle_since = Instant::now();

        loop {
            self.dispatch(&mut queue, &mut in_flight, private_key)?;
            if queue.is_empty() && in_flight.is_empty() {
                break;
            }

            let now = Instant::now();
            let deadline = in_flight
                .iter()
                .map(|(id, f)| f.expiry(&self.config, *id).0)
                .min()
                .unwrap_or(idle_since + self.config.task_timeout());

            match self.responses.recv_timeout(deadline.saturating_duration_since(now)) {
                Ok((id, response)) => {
                    self.handle_response(id, response, &mut in_flight, &mut outcomes)?;
                    idle_since = Instant::now();
                }
                Err(RecvTimeoutError::Timeout) => {
                    if in_flight.is_empty() {
                        let fault = WorkerFault::Backend("no signing worker became ready".to_string());
                        for (_, chunk) in queue.drain(..) {
                            for task in &chunk {
                                outcomes.record_error(TaskError::for_task(task, fault.clone()));
                            }
                        }
                        break;
                    }
                    self.expire(&mut in_flight, &mut outcomes)?;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(WorkerFault::Backend("response channel closed".to_string()).into());
                }
            }
        }

        let result = outcomes.into_result(&tasks);
        log::debug!(
            "signed batch of {} task(s): {} result(s), {} error(s)",
            tasks.len(),
            result.results.len(),
            result.errors.len()
        );
        if !self.config.preserve_workers {
            self.stop_workers();
        }
        Ok(result)
    }

    fn dispatch(
        &mut self,
        queue: &mut VecDeque<(u64, Vec<SigningTask>)>,
        in_flight: &mut HashMap<usize, InFlight>,
        private_key: &[u8; 32],
    ) -> Result<()> {
        while let Some(index) = self
            .workers
            .iter()
            .position(|w| w.state == WorkerState::Idle && !in_flight.contains_key(&w.id))
        {
            let Some((batch_id, tasks)) = queue.pop_front() else {
                break;
            };
            let worker = &mut self.workers[index];
            let id = worker.id;
            worker.transition(WorkerState::Busy)?;
            let sent = worker.send(WorkerRequest::SignBatch {
                batch_id,
                tasks: tasks.clone(),
                private_key: KeyMaterial::copy_from(private_key),
            });
            match sent {
                Ok(()) => {
                    let now = Instant::now();
                    log::trace!("batch {} ({} tasks) dispatched to worker {}", batch_id, tasks.len(), id);
                    in_flight.insert(
                        id,
                        InFlight {
                            batch_id,
                            tasks,
                            dispatched_at: now,
                            last_progress: now,
                        },
                    );
                }
                Err(fault) => {
                    log::warn!("dispatch to worker {} failed: {}", id, fault);
                    queue.push_front((batch_id, tasks));
                    self.replace_worker(id)?;
                }
            }
        }
        Ok(())
    }

    fn handle_response(
        &mut self,
        id: usize,
        response: WorkerResponse,
        in_flight: &mut HashMap<usize, InFlight>,
        outcomes: &mut Outcomes,
    ) -> Result<()> {
        if let WorkerResponse::Ready = response {
            if let Some(worker) = self.worker_mut(id) {
                if worker.state == WorkerState::Initializing {
                    worker.transition(WorkerState::Idle)?;
                }
            }
            return Ok(());
        }

        // anything else from a retired worker, or left over from another batch, is dropped
        let Some(flight) = in_flight.get_mut(&id) else {
            log::trace!("ignoring response from worker {} with no batch in flight", id);
            return Ok(());
        };

        match response {
            WorkerResponse::Result(result) => {
                flight.last_progress = Instant::now();
                outcomes.record_result(result);
            }
            WorkerResponse::Error(error) => {
                flight.last_progress = Instant::now();
                outcomes.record_error(error);
            }
            WorkerResponse::BatchResult {
                batch_id,
                results,
                errors,
            } if batch_id == flight.batch_id => {
                results.into_iter().for_each(|r| outcomes.record_result(r));
                errors.into_iter().for_each(|e| outcomes.record_error(e));
                in_flight.remove(&id);
                if let Some(worker) = self.worker_mut(id) {
                    worker.transition(WorkerState::Idle)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Retire every in-flight worker whose watchdog has expired. Its
    /// unfinished tasks become errors carrying their input index.
    fn expire(&mut self, in_flight: &mut HashMap<usize, InFlight>, outcomes: &mut Outcomes) -> Result<()> {
        let now = Instant::now();
        let expired: Vec<(usize, WorkerFault)> = in_flight
            .iter()
            .filter_map(|(id, flight)| {
                let (deadline, fault) = flight.expiry(&self.config, *id);
                (deadline <= now).then_some((*id, fault))
            })
            .collect();

        for (id, fault) in expired {
            if let Some(flight) = in_flight.remove(&id) {
                log::warn!("worker {}: {}", id, fault);
                let unfinished: Vec<&SigningTask> =
                    flight.tasks.iter().filter(|t| !outcomes.is_done(t.task_id)).collect();
                for task in unfinished {
                    outcomes.record_error(TaskError::for_task(task, fault.clone()));
                }
            }
            self.replace_worker(id)?;
        }
        Ok(())
    }

    /// Ask every worker to exit and wait for the acknowledgements.
    fn stop_workers(&mut self) {
        let mut pending = HashSet::new();
        for worker in &mut self.workers {
            if worker.transition(WorkerState::ShuttingDown).is_ok() && worker.send(WorkerRequest::Shutdown).is_ok() {
                pending.insert(worker.id);
            } else {
                worker.retire();
            }
        }

        let deadline = Instant::now() + self.config.task_timeout();
        while !pending.is_empty() {
            let wait = deadline.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(wait) {
                Ok((id, WorkerResponse::ShutdownAck)) => {
                    pending.remove(&id);
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }

        for worker in &mut self.workers {
            if pending.contains(&worker.id) {
                log::warn!("signing worker {} did not acknowledge shutdown", worker.id);
                worker.retire();
            } else if worker.state == WorkerState::ShuttingDown {
                worker.join();
                worker.state = WorkerState::Terminated;
            }
        }
        self.workers.clear();
    }

    fn terminate_all(&mut self) {
        for worker in &mut self.workers {
            worker.retire();
        }
        self.workers.clear();
    }

    /// Stop every worker. Later calls to `sign_batch` fail with `PoolShutdown`.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.stop_workers();
        self.shut_down = true;
        log::debug!("signing pool shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }
}

impl Drop for SigningPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
