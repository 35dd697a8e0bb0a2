//! Messages exchanged between the pool and its workers.

use crate::bitcoin::taproot::TapLeafHash;
use crate::error::WorkerFault;

use super::keys::KeyMaterial;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureType {
    Ecdsa,
    Schnorr,
}

/// One hash to sign. `input_index`, `sighash_type` and `leaf_hash` are carried
/// through unchanged so results can be written back to the document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigningTask {
    pub task_id: u64,
    pub hash: [u8; 32],
    /// Compressed key for ECDSA, x-only key for Schnorr.
    pub public_key: Vec<u8>,
    pub signature_type: SignatureType,
    /// Grind for a low R value (71-byte DER signatures).
    pub low_r: bool,
    pub input_index: usize,
    pub sighash_type: u32,
    pub leaf_hash: Option<TapLeafHash>,
}

#[derive(Debug)]
pub struct SignRequest {
    pub task: SigningTask,
    pub private_key: KeyMaterial,
}

#[derive(Debug)]
pub enum WorkerRequest {
    Init { ecc_lib_id: String },
    Sign(SignRequest),
    SignBatch {
        batch_id: u64,
        tasks: Vec<SigningTask>,
        private_key: KeyMaterial,
    },
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub task_id: u64,
    pub input_index: usize,
    /// 64-byte compact ECDSA or BIP340 signature, without sighash byte.
    pub signature: Vec<u8>,
    pub signature_type: SignatureType,
    pub sighash_type: u32,
    pub leaf_hash: Option<TapLeafHash>,
    pub public_key: Vec<u8>,
}

impl TaskResult {
    pub(crate) fn new(task: &SigningTask, signature: Vec<u8>) -> Self {
        Self {
            task_id: task.task_id,
            input_index: task.input_index,
            signature,
            signature_type: task.signature_type,
            sighash_type: task.sighash_type,
            leaf_hash: task.leaf_hash,
            public_key: task.public_key.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskError {
    pub task_id: Option<u64>,
    pub input_index: Option<usize>,
    pub fault: WorkerFault,
}

impl TaskError {
    pub(crate) fn for_task(task: &SigningTask, fault: WorkerFault) -> Self {
        Self {
            task_id: Some(task.task_id),
            input_index: Some(task.input_index),
            fault,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerResponse {
    Ready,
    Result(TaskResult),
    Error(TaskError),
    BatchResult {
        batch_id: u64,
        results: Vec<TaskResult>,
        errors: Vec<TaskError>,
    },
    ShutdownAck,
}
