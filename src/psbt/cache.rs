//! Memoized values derived from a PSBT.
//!
//! Every entry records the generation it was computed at. The owning document
//! bumps the generation on every mutation, so a stale entry is recomputed on
//! the next read instead of being invalidated field by field.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use crate::bitcoin::blockdata::script::Instruction;
use crate::bitcoin::psbt::{Input, Psbt as BitcoinPsbt};
use crate::bitcoin::{Amount, OutPoint, ScriptBuf, Transaction, TxOut};
use crate::error::{Error, Result};
use crate::payments::{classify, script_contains_pubkey, InputType, ScriptType};

/// The script an input spends, resolved through its p2sh and p2wsh wrappers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrevoutScript {
    pub script_pubkey: ScriptBuf,
    pub value: Amount,
    /// Script that signatures are checked against: witness script, redeem script
    /// or the output script itself.
    pub meaningful_script: ScriptBuf,
    pub redeem_script: Option<ScriptBuf>,
    pub witness_script: Option<ScriptBuf>,
    pub input_type: InputType,
    pub is_segwit: bool,
}

impl PrevoutScript {
    pub fn is_p2sh(&self) -> bool {
        self.input_type.p2sh
    }

    pub fn is_p2wsh(&self) -> bool {
        self.input_type.p2wsh
    }

    pub fn is_taproot(&self) -> bool {
        self.input_type.script_type == ScriptType::P2tr
    }
}

#[derive(Debug, Clone)]
pub struct InputCacheEntry {
    pub prevout: TxOut,
    pub script: Option<PrevoutScript>,
}

struct Memo<T> {
    slot: RefCell<Option<(u64, T)>>,
}

impl<T: Clone> Memo<T> {
    fn new() -> Self {
        Self {
            slot: RefCell::new(None),
        }
    }

    fn get_or_try_insert(&self, generation: u64, compute: impl FnOnce() -> Result<T>) -> Result<T> {
        if let Some((stored, value)) = &*self.slot.borrow() {
            if *stored == generation {
                return Ok(value.clone());
            }
        }
        let value = compute()?;
        *self.slot.borrow_mut() = Some((generation, value.clone()));
        Ok(value)
    }
}

pub struct TransactionCache {
    generation: u64,
    outpoints: Memo<HashSet<OutPoint>>,
    prevouts: RefCell<HashMap<usize, (u64, TxOut)>>,
    scripts: RefCell<HashMap<usize, (u64, PrevoutScript)>>,
    is_mine: RefCell<HashMap<(usize, Vec<u8>), (u64, bool)>>,
    fee: Memo<u64>,
    extracted: Memo<Transaction>,
}

impl Default for TransactionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TransactionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionCache")
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Clone for TransactionCache {
    /// Clones start empty. Nothing computed for one document is shared with another.
    fn clone(&self) -> Self {
        let mut cache = Self::new();
        cache.generation = self.generation;
        cache
    }
}

pub(crate) fn is_finalized(input: &Input) -> bool {
    input.final_script_sig.is_some() || input.final_script_witness.is_some()
}

fn last_push(script: &ScriptBuf) -> Option<ScriptBuf> {
    script
        .instructions()
        .filter_map(|i| match i {
            Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes().to_vec()),
            _ => None,
        })
        .last()
        .map(ScriptBuf::from)
}

fn script_mismatch(input_index: usize, message: &str) -> Error {
    Error::ScriptMismatch {
        input_index,
        message: message.to_string(),
    }
}

impl TransactionCache {
    pub fn new() -> Self {
        Self {
            generation: 0,
            outpoints: Memo::new(),
            prevouts: RefCell::new(HashMap::new()),
            scripts: RefCell::new(HashMap::new()),
            is_mine: RefCell::new(HashMap::new()),
            fee: Memo::new(),
            extracted: Memo::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Mark every memoized value stale. Per-input maps are emptied so they
    /// never grow past the current document.
    pub fn invalidate(&mut self) {
        self.generation = self.generation.wrapping_add(1);
        self.prevouts.get_mut().clear();
        self.scripts.get_mut().clear();
        self.is_mine.get_mut().clear();
    }

    pub fn check_duplicate_input(&self, psbt: &BitcoinPsbt, outpoint: &OutPoint) -> Result<()> {
        let outpoints = self.outpoints.get_or_try_insert(self.generation, || {
            Ok(psbt
                .unsigned_tx
                .input
                .iter()
                .map(|txin| txin.previous_output)
                .collect())
        })?;
        if outpoints.contains(outpoint) {
            return Err(Error::DuplicateInput(*outpoint));
        }
        Ok(())
    }

    /// The output spent by `input_index`.
    ///
    /// `witness_utxo` wins when both utxo fields are present, but a present
    /// `non_witness_utxo` must always describe the outpoint's transaction.
    pub fn prevout(&self, psbt: &BitcoinPsbt, input_index: usize) -> Result<TxOut> {
        if let Some((generation, txout)) = self.prevouts.borrow().get(&input_index) {
            if *generation == self.generation {
                return Ok(txout.clone());
            }
        }

        let input = psbt.inputs.get(input_index).ok_or(Error::InputOutOfRange {
            index: input_index,
            len: psbt.inputs.len(),
        })?;
        let outpoint = psbt.unsigned_tx.input[input_index].previous_output;

        let from_non_witness = match &input.non_witness_utxo {
            Some(tx) => {
                let txid = tx.compute_txid();
                if txid != outpoint.txid {
                    return Err(Error::NonWitnessUtxoMismatch {
                        input_index,
                        expected: outpoint.txid,
                        actual: txid,
                    });
                }
                let txout = tx
                    .output
                    .get(outpoint.vout as usize)
                    .cloned()
                    .ok_or(Error::MissingUtxoInfo { input_index })?;
                Some(txout)
            }
            None => None,
        };

        let txout = input
            .witness_utxo
            .clone()
            .or(from_non_witness)
            .ok_or(Error::MissingUtxoInfo { input_index })?;

        self.prevouts
            .borrow_mut()
            .insert(input_index, (self.generation, txout.clone()));
        Ok(txout)
    }

    pub fn prevouts(&self, psbt: &BitcoinPsbt) -> Result<Vec<TxOut>> {
        (0..psbt.inputs.len())
            .map(|index| self.prevout(psbt, index))
            .collect()
    }

    /// Resolve the script spent by `input_index`, checking that the redeem and
    /// witness scripts hash to the output they claim to satisfy.
    ///
    /// Finalized inputs no longer carry their scripts, so they are recovered
    /// from the last push of the final script sig and the last witness element.
    pub fn get_script_from_utxo(&self, psbt: &BitcoinPsbt, input_index: usize) -> Result<PrevoutScript> {
        if let Some((generation, script)) = self.scripts.borrow().get(&input_index) {
            if *generation == self.generation {
                return Ok(script.clone());
            }
        }

        let prevout = self.prevout(psbt, input_index)?;
        let input = &psbt.inputs[input_index];
        let script_pubkey = prevout.script_pubkey.clone();

        let mut inner = script_pubkey.clone();
        let mut redeem_script = None;
        if script_pubkey.is_p2sh() {
            let redeem = input
                .redeem_script
                .clone()
                .or_else(|| input.final_script_sig.as_ref().and_then(last_push))
                .ok_or_else(|| script_mismatch(input_index, "p2sh input is missing redeem_script"))?;
            if redeem.to_p2sh() != script_pubkey {
                return Err(script_mismatch(
                    input_index,
                    "redeem_script does not match p2sh output script",
                ));
            }
            inner = redeem.clone();
            redeem_script = Some(redeem);
        }

        let mut witness_script = None;
        if inner.is_p2wsh() {
            let witness = input
                .witness_script
                .clone()
                .or_else(|| {
                    input
                        .final_script_witness
                        .as_ref()
                        .and_then(|w| w.last())
                        .map(|bytes| ScriptBuf::from(bytes.to_vec()))
                })
                .ok_or_else(|| script_mismatch(input_index, "p2wsh input is missing witness_script"))?;
            if witness.to_p2wsh() != inner {
                return Err(script_mismatch(
                    input_index,
                    "witness_script does not match p2wsh program",
                ));
            }
            witness_script = Some(witness);
        }

        let is_segwit = inner.is_witness_program();
        let meaningful_script = witness_script.clone().unwrap_or_else(|| inner.clone());
        let resolved = PrevoutScript {
            input_type: InputType {
                p2sh: redeem_script.is_some(),
                p2wsh: witness_script.is_some(),
                script_type: classify(&meaningful_script),
            },
            script_pubkey,
            value: prevout.value,
            meaningful_script,
            redeem_script,
            witness_script,
            is_segwit,
        };

        self.scripts
            .borrow_mut()
            .insert(input_index, (self.generation, resolved.clone()));
        Ok(resolved)
    }

    pub fn input_entry(&self, psbt: &BitcoinPsbt, input_index: usize) -> Result<InputCacheEntry> {
        Ok(InputCacheEntry {
            prevout: self.prevout(psbt, input_index)?,
            script: self.get_script_from_utxo(psbt, input_index).ok(),
        })
    }

    /// Whether `pubkey` appears in the script spent by `input_index`, or in any
    /// of its taproot keys and leaves.
    pub fn input_has_pubkey(&self, psbt: &BitcoinPsbt, input_index: usize, pubkey: &[u8]) -> Result<bool> {
        let key = (input_index, pubkey.to_vec());
        if let Some((generation, found)) = self.is_mine.borrow().get(&key) {
            if *generation == self.generation {
                return Ok(*found);
            }
        }

        let script = self.get_script_from_utxo(psbt, input_index)?;
        let input = &psbt.inputs[input_index];
        let x_only = match pubkey.len() {
            33 => &pubkey[1..],
            _ => pubkey,
        };
        let found = script_contains_pubkey(&script.meaningful_script, pubkey)
            || input
                .tap_internal_key
                .is_some_and(|k| k.serialize().as_slice() == x_only)
            || input
                .tap_scripts
                .values()
                .any(|(leaf, _)| script_contains_pubkey(leaf, pubkey));

        self.is_mine
            .borrow_mut()
            .insert(key, (self.generation, found));
        Ok(found)
    }

    /// Sum of input values minus sum of output values, in satoshis.
    pub fn compute_fee(&self, psbt: &BitcoinPsbt) -> Result<u64> {
        self.fee.get_or_try_insert(self.generation, || {
            let inputs = self
                .prevouts(psbt)?
                .iter()
                .try_fold(0u64, |acc, txout| acc.checked_add(txout.value.to_sat()))
                .ok_or(Error::ValueOverflow)?;
            let outputs = psbt
                .unsigned_tx
                .output
                .iter()
                .try_fold(0u64, |acc, txout| acc.checked_add(txout.value.to_sat()))
                .ok_or(Error::ValueOverflow)?;
            inputs
                .checked_sub(outputs)
                .ok_or(Error::NegativeFee { inputs, outputs })
        })
    }

    /// The network transaction assembled from the finalized inputs.
    pub fn extracted_tx(&self, psbt: &BitcoinPsbt) -> Result<Transaction> {
        self.extracted.get_or_try_insert(self.generation, || {
            let mut tx = psbt.unsigned_tx.clone();
            for (input_index, (txin, input)) in tx.input.iter_mut().zip(&psbt.inputs).enumerate() {
                if !is_finalized(input) {
                    return Err(Error::NotFinalized { input_index });
                }
                txin.script_sig = input.final_script_sig.clone().unwrap_or_default();
                txin.witness = input.final_script_witness.clone().unwrap_or_default();
            }
            Ok(tx)
        })
    }

    /// Fee divided by the virtual size of the finalized transaction, rounded down.
    pub fn compute_fee_rate(&self, psbt: &BitcoinPsbt) -> Result<u64> {
        let tx = self.extracted_tx(psbt)?;
        let fee = self.compute_fee(psbt)?;
        Ok(fee / tx.vsize() as u64)
    }

    pub fn check_fees(&self, psbt: &BitcoinPsbt, max_fee_rate: u64) -> Result<()> {
        let fee_rate = self.compute_fee_rate(psbt)?;
        if fee_rate > max_fee_rate {
            log::warn!(
                "fee rate {} sat/vB exceeds maximum {} sat/vB",
                fee_rate,
                max_fee_rate
            );
            return Err(Error::FeeTooHigh {
                fee_rate,
                max_fee_rate,
            });
        }
        log::debug!("fee rate {} sat/vB within maximum {}", fee_rate, max_fee_rate);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::absolute::LockTime;
    use crate::bitcoin::hashes::Hash;
    use crate::bitcoin::transaction::Version;
    use crate::bitcoin::{Sequence, TxIn, Txid, Witness};
    use crate::test_utils::{funding_tx, pubkey, PsbtBuilder};
    use crate::payments::encode_multisig;

    fn psbt_with(inputs: &[u64], outputs: &[u64]) -> BitcoinPsbt {
        let mut builder = PsbtBuilder::new();
        for value in inputs {
            builder = builder.p2wpkh_input(1, *value);
        }
        for value in outputs {
            builder = builder.output(*value);
        }
        builder.build()
    }

    #[test]
    fn test_fee() {
        let psbt = psbt_with(&[50_000, 30_000], &[70_000]);
        let cache = TransactionCache::new();
        assert_eq!(cache.compute_fee(&psbt).unwrap(), 10_000);
    }

    #[test]
    fn test_negative_fee() {
        let psbt = psbt_with(&[10_000], &[20_000]);
        let cache = TransactionCache::new();
        assert!(matches!(
            cache.compute_fee(&psbt),
            Err(Error::NegativeFee {
                inputs: 10_000,
                outputs: 20_000
            })
        ));
    }

    #[test]
    fn test_missing_utxo_info() {
        let mut psbt = psbt_with(&[10_000], &[5_000]);
        psbt.inputs[0].witness_utxo = None;
        let cache = TransactionCache::new();
        assert!(matches!(
            cache.compute_fee(&psbt),
            Err(Error::MissingUtxoInfo { input_index: 0 })
        ));
    }

    #[test]
    fn test_non_witness_utxo_txid_checked() {
        let mut psbt = psbt_with(&[10_000], &[5_000]);
        let other = funding_tx(ScriptBuf::new(), 1, 10_000);
        psbt.inputs[0].non_witness_utxo = Some(other);
        let cache = TransactionCache::new();
        assert!(matches!(
            cache.prevout(&psbt, 0),
            Err(Error::NonWitnessUtxoMismatch { input_index: 0, .. })
        ));
    }

    #[test]
    fn test_generation_invalidates() {
        let mut psbt = psbt_with(&[50_000], &[40_000]);
        let mut cache = TransactionCache::new();
        assert_eq!(cache.compute_fee(&psbt).unwrap(), 10_000);

        psbt.unsigned_tx.output[0].value = Amount::from_sat(45_000);
        // stale until the generation moves
        assert_eq!(cache.compute_fee(&psbt).unwrap(), 10_000);
        cache.invalidate();
        assert_eq!(cache.compute_fee(&psbt).unwrap(), 5_000);
    }

    #[test]
    fn test_invalidate_empties_per_input_maps() {
        let psbt = psbt_with(&[50_000, 20_000], &[60_000]);
        let mut cache = TransactionCache::new();
        for _ in 0..3 {
            for index in 0..2 {
                cache.get_script_from_utxo(&psbt, index).unwrap();
                cache.input_has_pubkey(&psbt, index, &pubkey(1).to_bytes()).unwrap();
            }
            assert_eq!(cache.scripts.borrow().len(), 2);
            assert_eq!(cache.is_mine.borrow().len(), 2);
            cache.invalidate();
            assert!(cache.prevouts.borrow().is_empty());
            assert!(cache.scripts.borrow().is_empty());
            assert!(cache.is_mine.borrow().is_empty());
        }
    }

    #[test]
    fn test_duplicate_input() {
        let psbt = psbt_with(&[50_000], &[40_000]);
        let cache = TransactionCache::new();
        let existing = psbt.unsigned_tx.input[0].previous_output;
        assert!(matches!(
            cache.check_duplicate_input(&psbt, &existing),
            Err(Error::DuplicateInput(_))
        ));
        let fresh = OutPoint::new(Txid::all_zeros(), 7);
        assert!(cache.check_duplicate_input(&psbt, &fresh).is_ok());
    }

    #[test]
    fn test_fee_rate_requires_finalized() {
        let mut psbt = psbt_with(&[50_000], &[40_000]);
        let cache = TransactionCache::new();
        assert!(matches!(
            cache.compute_fee_rate(&psbt),
            Err(Error::NotFinalized { input_index: 0 })
        ));

        psbt.inputs[0].final_script_witness = Some(Witness::from_slice(&[vec![0u8; 72], vec![2u8; 33]]));
        let mut cache = cache;
        cache.invalidate();
        let vsize = cache.extracted_tx(&psbt).unwrap().vsize() as u64;
        assert_eq!(cache.compute_fee_rate(&psbt).unwrap(), 10_000 / vsize);
    }

    #[test]
    fn test_script_resolution_checks_hashes() {
        let multisig = encode_multisig(2, &[pubkey(1), pubkey(2), pubkey(3)]).unwrap();
        let wrapped = multisig.to_p2wsh();
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::all_zeros(), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![],
        };
        let mut psbt = BitcoinPsbt::from_unsigned_tx(tx).unwrap();
        psbt.inputs[0].witness_utxo = Some(TxOut {
            value: Amount::from_sat(1_000),
            script_pubkey: wrapped.to_p2sh(),
        });
        psbt.inputs[0].redeem_script = Some(wrapped.clone());
        psbt.inputs[0].witness_script = Some(multisig.clone());

        let cache = TransactionCache::new();
        let resolved = cache.get_script_from_utxo(&psbt, 0).unwrap();
        assert_eq!(resolved.input_type.to_string(), "p2sh-p2wsh-multisig");
        assert_eq!(resolved.meaningful_script, multisig);
        assert!(resolved.is_segwit);

        let mut cache = cache;
        psbt.inputs[0].witness_script = Some(encode_multisig(1, &[pubkey(4)]).unwrap());
        cache.invalidate();
        assert!(matches!(
            cache.get_script_from_utxo(&psbt, 0),
            Err(Error::ScriptMismatch { input_index: 0, .. })
        ));
    }
}
