use crate::bitcoin::{OutPoint, Txid};
use crate::signing_pool::WorkerState;

/// Coarse classification of [`Error`] values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed data: bad scripts, undecodable documents, missing or inconsistent utxo data.
    Structural,
    /// The operation is not allowed in the document's current lifecycle stage.
    State,
    /// The data is well formed but fails a signature, fee or policy check.
    Validation,
    /// A signing worker timed out, crashed or misbehaved.
    WorkerFault,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("invalid script: {0}")]
    InvalidScript(String),
    #[error("failed to deserialize PSBT: {0}")]
    Deserialize(String),
    #[error("invalid encoding: {0}")]
    Encoding(String),
    #[error("input {input_index}: {message}")]
    ScriptMismatch { input_index: usize, message: String },
    #[error("input {input_index}: non_witness_utxo txid {actual} does not match outpoint txid {expected}")]
    NonWitnessUtxoMismatch {
        input_index: usize,
        expected: Txid,
        actual: Txid,
    },
    #[error("input {input_index}: no witness_utxo or non_witness_utxo")]
    MissingUtxoInfo { input_index: usize },
    #[error("input {input_index}: non-segwit input requires non_witness_utxo")]
    MissingNonWitnessUtxo { input_index: usize },
    #[error("input index {index} out of range ({len} inputs)")]
    InputOutOfRange { index: usize, len: usize },
    #[error("output index {index} out of range ({len} outputs)")]
    OutputOutOfRange { index: usize, len: usize },
    #[error("cannot combine PSBTs with different unsigned transactions")]
    UnsignedTxMismatch,
    #[error("sighash computation failed: {0}")]
    Sighash(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("cannot {operation}: existing signatures commit to it")]
    SignaturesExist { operation: &'static str },
    #[error("input {input_index} is already finalized")]
    AlreadyFinalized { input_index: usize },
    #[error("input {input_index} is finalized and can no longer be modified")]
    InputFinalized { input_index: usize },
    #[error("input {input_index} is not finalized")]
    NotFinalized { input_index: usize },
    #[error("signing pool is shut down")]
    PoolShutdown,

    #[error("input {input_index}: no signature")]
    NoSignature { input_index: usize },
    #[error("input {input_index}: {found} of {required} required signatures")]
    InsufficientSignatures {
        input_index: usize,
        required: usize,
        found: usize,
    },
    #[error("input {input_index}: invalid signature: {message}")]
    InvalidSignature { input_index: usize, message: String },
    #[error("input {input_index}: sighash type {actual:#x} does not match input sighash type {expected:#x}")]
    SighashTypeMismatch {
        input_index: usize,
        expected: u32,
        actual: u32,
    },
    #[error("input {input_index}: sighash type {sighash_type:#x} is not allowed")]
    SighashTypeNotAllowed { input_index: usize, sighash_type: u32 },
    #[error("input {input_index}: signing key does not belong to this input")]
    KeyNotInInput { input_index: usize },
    #[error("outputs ({outputs} sat) exceed inputs ({inputs} sat)")]
    NegativeFee { inputs: u64, outputs: u64 },
    #[error("fee rate {fee_rate} sat/vB exceeds maximum of {max_fee_rate} sat/vB")]
    FeeTooHigh { fee_rate: u64, max_fee_rate: u64 },
    #[error("duplicate input {0}")]
    DuplicateInput(OutPoint),
    #[error("input {input_index}: no unique tapleaf to finalize ({candidates} candidates)")]
    NoMatchingLeaf { input_index: usize, candidates: usize },
    #[error("input {input_index}: unsupported script type {script_type}")]
    UnsupportedScript {
        input_index: usize,
        script_type: String,
    },
    #[error("amount overflow")]
    ValueOverflow,
    #[error("no inputs were signed")]
    NoInputsSigned,

    #[error(transparent)]
    WorkerFault(#[from] WorkerFault),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        use Error::*;
        match self {
            InvalidScript(_)
            | Deserialize(_)
            | Encoding(_)
            | ScriptMismatch { .. }
            | NonWitnessUtxoMismatch { .. }
            | MissingUtxoInfo { .. }
            | MissingNonWitnessUtxo { .. }
            | InputOutOfRange { .. }
            | OutputOutOfRange { .. }
            | UnsignedTxMismatch
            | Sighash(_)
            | InvalidAddress(_)
            | InvalidKey(_) => ErrorKind::Structural,
            SignaturesExist { .. }
            | AlreadyFinalized { .. }
            | InputFinalized { .. }
            | NotFinalized { .. }
            | PoolShutdown => ErrorKind::State,
            NoSignature { .. }
            | InsufficientSignatures { .. }
            | InvalidSignature { .. }
            | SighashTypeMismatch { .. }
            | SighashTypeNotAllowed { .. }
            | KeyNotInInput { .. }
            | NegativeFee { .. }
            | FeeTooHigh { .. }
            | DuplicateInput(_)
            | NoMatchingLeaf { .. }
            | UnsupportedScript { .. }
            | ValueOverflow
            | NoInputsSigned => ErrorKind::Validation,
            WorkerFault(_) => ErrorKind::WorkerFault,
        }
    }
}

/// Failures of a signing worker. Reported per task, never for a whole batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerFault {
    #[error("worker {worker_id}: task exceeded {timeout_ms}ms")]
    TaskTimeout { worker_id: usize, timeout_ms: u64 },
    #[error("worker {worker_id}: key held longer than {max_hold_ms}ms")]
    KeyHoldExceeded { worker_id: usize, max_hold_ms: u64 },
    #[error("worker {worker_id} crashed: {message}")]
    Crashed { worker_id: usize, message: String },
    #[error("signing backend error: {0}")]
    Backend(String),
    #[error("invalid worker transition {from:?} -> {to:?}")]
    InvalidTransition { from: WorkerState, to: WorkerState },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
