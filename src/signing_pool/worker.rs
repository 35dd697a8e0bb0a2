//! A signing worker: a dedicated thread that owns one key slot.

use std::panic::{self, AssertUnwindSafe};
#[cfg(test)]
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use zeroize::{Zeroize, Zeroizing};

use crate::error::{Error, WorkerFault};

use super::backend::{BackendFactory, EccBackend};
use super::message::{SignRequest, SigningTask, TaskError, TaskResult, WorkerRequest, WorkerResponse};
use super::WorkerState;

/// Sees a worker's key slot right after every wipe.
#[cfg(test)]
pub(crate) type SlotObserver = Arc<dyn Fn(usize, &[u8; 32]) + Send + Sync>;

/// Test instrumentation carried into each worker thread. Empty otherwise.
#[derive(Clone, Default)]
pub(crate) struct WorkerHooks {
    #[cfg(test)]
    pub(crate) slot_observer: Option<SlotObserver>,
}

impl WorkerHooks {
    fn slot_wiped(&self, _worker_id: usize, _slot: &[u8; 32]) {
        #[cfg(test)]
        {
            if let Some(observer) = &self.slot_observer {
                observer(_worker_id, _slot);
            }
        }
    }
}

/// Request handling, independent of the thread it runs on.
pub(crate) struct WorkerCore {
    id: usize,
    factory: BackendFactory,
    backend: Option<Box<dyn EccBackend>>,
    key_slot: Box<Zeroizing<[u8; 32]>>,
    max_key_hold: Duration,
    hooks: WorkerHooks,
}

impl WorkerCore {
    pub(crate) fn new(id: usize, factory: BackendFactory, max_key_hold: Duration, hooks: WorkerHooks) -> Self {
        Self {
            id,
            factory,
            backend: None,
            key_slot: Box::new(Zeroizing::new([0u8; 32])),
            max_key_hold,
            hooks,
        }
    }

    fn wipe_key_slot(&mut self) {
        self.key_slot.zeroize();
        self.hooks.slot_wiped(self.id, &self.key_slot);
    }

    #[cfg(test)]
    pub(crate) fn key_slot(&self) -> &[u8; 32] {
        &self.key_slot
    }

    fn sign_one(&self, task: &SigningTask) -> Result<TaskResult, TaskError> {
        let backend = self.backend.as_ref().ok_or_else(|| {
            TaskError::for_task(task, WorkerFault::Backend("worker is not initialized".to_string()))
        })?;
        let key: &[u8; 32] = &self.key_slot;
        match panic::catch_unwind(AssertUnwindSafe(|| backend.sign(task, key))) {
            Ok(Ok(signature)) => Ok(TaskResult::new(task, signature)),
            Ok(Err(message)) => Err(TaskError::for_task(task, WorkerFault::Backend(message))),
            Err(_) => Err(TaskError::for_task(
                task,
                WorkerFault::Crashed {
                    worker_id: self.id,
                    message: "backend panicked".to_string(),
                },
            )),
        }
    }

    /// Sign `tasks` with `key`, streaming each outcome through `emit`. The key
    /// slot is wiped before this returns.
    fn sign_tasks(
        &mut self,
        tasks: &[SigningTask],
        key: &[u8; 32],
        emit: &mut dyn FnMut(WorkerResponse),
    ) -> (Vec<TaskResult>, Vec<TaskError>) {
        self.key_slot.copy_from_slice(key);
        let loaded_at = Instant::now();

        let mut results = Vec::with_capacity(tasks.len());
        let mut errors = Vec::new();
        for task in tasks {
            let outcome = if loaded_at.elapsed() >= self.max_key_hold {
                Err(TaskError::for_task(
                    task,
                    WorkerFault::KeyHoldExceeded {
                        worker_id: self.id,
                        max_hold_ms: self.max_key_hold.as_millis() as u64,
                    },
                ))
            } else {
                self.sign_one(task)
            };
            match outcome {
                Ok(result) => {
                    emit(WorkerResponse::Result(result.clone()));
                    results.push(result);
                }
                Err(error) => {
                    emit(WorkerResponse::Error(error.clone()));
                    errors.push(error);
                }
            }
        }

        self.wipe_key_slot();
        (results, errors)
    }

    /// Handle one request. Returns false once the worker should exit.
    pub(crate) fn handle(&mut self, request: WorkerRequest, emit: &mut dyn FnMut(WorkerResponse)) -> bool {
        match request {
            WorkerRequest::Init { ecc_lib_id } => match (self.factory)(&ecc_lib_id) {
                Some(backend) => {
                    self.backend = Some(backend);
                    emit(WorkerResponse::Ready);
                }
                None => emit(WorkerResponse::Error(TaskError {
                    task_id: None,
                    input_index: None,
                    fault: WorkerFault::Backend(format!("unknown ecc backend {:?}", ecc_lib_id)),
                })),
            },
            WorkerRequest::Sign(SignRequest { task, private_key }) => {
                let (mut results, mut errors) =
                    self.sign_tasks(std::slice::from_ref(&task), private_key.as_bytes(), &mut |_| {});
                drop(private_key);
                match (results.pop(), errors.pop()) {
                    (Some(result), _) => emit(WorkerResponse::Result(result)),
                    (None, Some(error)) => emit(WorkerResponse::Error(error)),
                    (None, None) => {}
                }
            }
            WorkerRequest::SignBatch {
                batch_id,
                tasks,
                private_key,
            } => {
                let (results, errors) = self.sign_tasks(&tasks, private_key.as_bytes(), emit);
                drop(private_key);
                emit(WorkerResponse::BatchResult {
                    batch_id,
                    results,
                    errors,
                });
            }
            WorkerRequest::Shutdown => {
                self.wipe_key_slot();
                emit(WorkerResponse::ShutdownAck);
                return false;
            }
        }
        true
    }
}

impl Drop for WorkerCore {
    fn drop(&mut self) {
        self.key_slot.zeroize();
    }
}

/// The pool's side of a worker thread.
pub(crate) struct WorkerHandle {
    pub(crate) id: usize,
    pub(crate) state: WorkerState,
    sender: Option<Sender<WorkerRequest>>,
    thread: Option<JoinHandle<()>>,
}

fn run(core: &mut WorkerCore, requests: Receiver<WorkerRequest>, responses: Sender<(usize, WorkerResponse)>) {
    let id = core.id;
    while let Ok(request) = requests.recv() {
        let keep_running = core.handle(request, &mut |response| {
            // the pool may already have retired this worker
            let _ = responses.send((id, response));
        });
        if !keep_running {
            break;
        }
    }
    log::trace!("signing worker {} exiting", id);
}

impl WorkerHandle {
    /// Start a worker thread and send it `Init`. The worker stays
    /// `Initializing` until its `Ready` arrives on `responses`.
    pub(crate) fn spawn(
        id: usize,
        factory: BackendFactory,
        backend: &str,
        max_key_hold: Duration,
        responses: Sender<(usize, WorkerResponse)>,
        hooks: WorkerHooks,
    ) -> Result<Self, Error> {
        let (sender, requests) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name(format!("signing-worker-{}", id))
            .spawn(move || {
                let mut core = WorkerCore::new(id, factory, max_key_hold, hooks);
                run(&mut core, requests, responses);
            })
            .map_err(|e| WorkerFault::Crashed {
                worker_id: id,
                message: e.to_string(),
            })?;

        let mut handle = Self {
            id,
            state: WorkerState::Initializing,
            sender: Some(sender),
            thread: Some(thread),
        };
        handle.send(WorkerRequest::Init {
            ecc_lib_id: backend.to_string(),
        })?;
        Ok(handle)
    }

    pub(crate) fn transition(&mut self, to: WorkerState) -> Result<(), WorkerFault> {
        if !self.state.can_transition_to(to) {
            return Err(WorkerFault::InvalidTransition { from: self.state, to });
        }
        log::trace!("worker {}: {:?} -> {:?}", self.id, self.state, to);
        self.state = to;
        Ok(())
    }

    pub(crate) fn send(&mut self, request: WorkerRequest) -> Result<(), WorkerFault> {
        let sender = self.sender.as_ref().ok_or(WorkerFault::Crashed {
            worker_id: self.id,
            message: "worker channel closed".to_string(),
        })?;
        sender.send(request).map_err(|_| WorkerFault::Crashed {
            worker_id: self.id,
            message: "worker thread exited".to_string(),
        })
    }

    /// Cut the worker off without waiting for it. A thread stuck in a backend
    /// call is left detached and exits once the call returns.
    pub(crate) fn retire(&mut self) {
        self.sender = None;
        self.thread = None;
        self.state = WorkerState::Terminated;
    }

    pub(crate) fn join(&mut self) {
        self.sender = None;
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("signing worker {} panicked during shutdown", self.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
    use crate::signing_pool::backend::default_backends;
    use crate::signing_pool::keys::KeyMaterial;
    use crate::signing_pool::message::SignatureType;
    use std::sync::Arc;

    fn task(task_id: u64, input_index: usize) -> SigningTask {
        let secp = Secp256k1::new();
        let secret = SecretKey::from_slice(&[1u8; 32]).unwrap();
        SigningTask {
            task_id,
            hash: [task_id as u8; 32],
            public_key: PublicKey::from_secret_key(&secp, &secret).serialize().to_vec(),
            signature_type: SignatureType::Ecdsa,
            low_r: true,
            input_index,
            sighash_type: 1,
            leaf_hash: None,
        }
    }

    fn initialized_core(factory: BackendFactory) -> WorkerCore {
        let mut core = WorkerCore::new(0, factory, Duration::from_secs(30), WorkerHooks::default());
        let mut responses = Vec::new();
        assert!(core.handle(
            WorkerRequest::Init {
                ecc_lib_id: "secp256k1".to_string()
            },
            &mut |r| responses.push(r)
        ));
        assert_eq!(responses, vec![WorkerResponse::Ready]);
        core
    }

    #[test]
    fn test_key_slot_zeroed_after_batch() {
        let mut core = initialized_core(default_backends());
        let mut responses = Vec::new();
        core.handle(
            WorkerRequest::SignBatch {
                batch_id: 1,
                tasks: vec![task(0, 0), task(1, 1)],
                private_key: KeyMaterial::copy_from(&[1u8; 32]),
            },
            &mut |r| responses.push(r),
        );
        assert_eq!(core.key_slot(), &[0u8; 32]);

        // two streamed results, then the batch
        assert_eq!(responses.len(), 3);
        match responses.pop().unwrap() {
            WorkerResponse::BatchResult {
                batch_id,
                results,
                errors,
            } => {
                assert_eq!(batch_id, 1);
                assert_eq!(results.len(), 2);
                assert!(errors.is_empty());
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_key_slot_zeroed_after_error() {
        let mut core = initialized_core(default_backends());
        let mut responses = Vec::new();
        let mut bad = task(0, 4);
        bad.public_key = vec![2u8; 33];
        core.handle(
            WorkerRequest::Sign(SignRequest {
                task: bad,
                private_key: KeyMaterial::copy_from(&[1u8; 32]),
            }),
            &mut |r| responses.push(r),
        );
        assert_eq!(core.key_slot(), &[0u8; 32]);
        match &responses[..] {
            [WorkerResponse::Error(error)] => assert_eq!(error.input_index, Some(4)),
            other => panic!("unexpected responses {:?}", other),
        }
    }

    struct PanickingBackend;

    impl EccBackend for PanickingBackend {
        fn sign(&self, task: &SigningTask, _: &[u8; 32]) -> Result<Vec<u8>, String> {
            if task.task_id == 1 {
                panic!("backend failure");
            }
            Ok(vec![0u8; 64])
        }
    }

    #[test]
    fn test_panic_does_not_abort_siblings() {
        let factory: BackendFactory = Arc::new(|_| Some(Box::new(PanickingBackend) as Box<dyn EccBackend>));
        let mut core = initialized_core(factory);
        let mut batch = None;
        core.handle(
            WorkerRequest::SignBatch {
                batch_id: 7,
                tasks: vec![task(0, 0), task(1, 1), task(2, 2)],
                private_key: KeyMaterial::copy_from(&[1u8; 32]),
            },
            &mut |r| {
                if let WorkerResponse::BatchResult { results, errors, .. } = r {
                    batch = Some((results, errors));
                }
            },
        );
        let (results, errors) = batch.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].input_index, Some(1));
        assert!(matches!(errors[0].fault, WorkerFault::Crashed { worker_id: 0, .. }));
        assert_eq!(core.key_slot(), &[0u8; 32]);
    }

    #[test]
    fn test_key_hold_limit() {
        let mut core = WorkerCore::new(3, default_backends(), Duration::ZERO, WorkerHooks::default());
        core.handle(
            WorkerRequest::Init {
                ecc_lib_id: "secp256k1".to_string(),
            },
            &mut |_| {},
        );
        let mut errors = Vec::new();
        core.handle(
            WorkerRequest::SignBatch {
                batch_id: 0,
                tasks: vec![task(0, 0)],
                private_key: KeyMaterial::copy_from(&[1u8; 32]),
            },
            &mut |r| {
                if let WorkerResponse::Error(e) = r {
                    errors.push(e);
                }
            },
        );
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0].fault, WorkerFault::KeyHoldExceeded { worker_id: 3, .. }));
        assert_eq!(core.key_slot(), &[0u8; 32]);
    }

    #[test]
    fn test_unknown_backend_and_shutdown() {
        let mut core = WorkerCore::new(0, default_backends(), Duration::from_secs(1), WorkerHooks::default());
        let mut responses = Vec::new();
        core.handle(
            WorkerRequest::Init {
                ecc_lib_id: "missing".to_string(),
            },
            &mut |r| responses.push(r),
        );
        assert!(matches!(&responses[0], WorkerResponse::Error(e) if e.task_id.is_none()));
        assert!(!core.handle(WorkerRequest::Shutdown, &mut |r| responses.push(r)));
        assert_eq!(responses[1], WorkerResponse::ShutdownAck);
    }
}
