mod error;
pub mod payments;
pub mod psbt;
pub mod signing_pool;
#[cfg(test)]
mod test_utils;

// re-export bitcoin from the miniscript crate so callers build against the same version
pub use ::miniscript::bitcoin;

pub use error::{Error, ErrorKind, Result, WorkerFault};
pub use psbt::{Psbt, PsbtOpts};
pub use signing_pool::{ParallelSigningResult, PoolConfig, SigningPool};
