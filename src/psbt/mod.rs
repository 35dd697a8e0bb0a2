//! PSBT document: the creator, updater, combiner and extractor roles.
//!
//! Signing lives in [`sign`], finalization in [`finalize`]. Every method that
//! mutates the document bumps the [`TransactionCache`] generation before it
//! returns.

pub mod cache;
pub mod finalize;
pub mod propkv;
pub mod sighash;
pub mod sign;

pub use cache::{InputCacheEntry, PrevoutScript, TransactionCache};
pub use finalize::{FinalScripts, FinalizeOptions};
pub use sighash::{
    validate_signature, Secp256k1Verifier, SigHash, SignatureEngine, SignatureVerifier, TaprootHash,
    NUMS_INTERNAL_KEY,
};
pub use sign::{HdSigner, KeyPairSigner, Signer};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use base64::Engine;
use serde::Deserialize;

use crate::bitcoin::absolute::LockTime;
use crate::bitcoin::blockdata::script::Instruction;
use crate::bitcoin::bip32::KeySource;
use crate::bitcoin::psbt::{Input, Output, Psbt as BitcoinPsbt, PsbtSighashType};
use crate::bitcoin::secp256k1;
use crate::bitcoin::taproot::{ControlBlock, LeafVersion, TapLeafHash, TapNodeHash};
use crate::bitcoin::transaction::Version;
use crate::bitcoin::{
    ecdsa, Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut,
    Witness, XOnlyPublicKey,
};
use crate::error::{Error, Result};
use crate::payments::{script_contains_pubkey, InputType};

use cache::is_finalized;

/// Fee rate in sat/vB above which extraction is refused.
pub const DEFAULT_MAXIMUM_FEE_RATE: u64 = 5000;

/// Options for a [`Psbt`] document.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PsbtOpts {
    /// Network used to decode output addresses.
    #[serde(skip, default = "default_network")]
    pub network: Network,
    pub maximum_fee_rate: u64,
    /// Sign non-segwit inputs that only carry a `witness_utxo`. The amount is
    /// then not committed to by the signature.
    pub unsafe_sign_nonsegwit: bool,
}

fn default_network() -> Network {
    Network::Bitcoin
}

impl Default for PsbtOpts {
    fn default() -> Self {
        Self {
            network: default_network(),
            maximum_fee_rate: DEFAULT_MAXIMUM_FEE_RATE,
            unsafe_sign_nonsegwit: false,
        }
    }
}

/// Fields an updater can set on an input. Set fields overwrite, maps extend.
#[derive(Debug, Clone, Default)]
pub struct InputUpdate {
    pub witness_utxo: Option<TxOut>,
    pub non_witness_utxo: Option<Transaction>,
    pub redeem_script: Option<ScriptBuf>,
    pub witness_script: Option<ScriptBuf>,
    pub sighash_type: Option<PsbtSighashType>,
    pub bip32_derivation: BTreeMap<secp256k1::PublicKey, KeySource>,
    pub tap_internal_key: Option<XOnlyPublicKey>,
    pub tap_merkle_root: Option<TapNodeHash>,
    pub tap_scripts: BTreeMap<ControlBlock, (ScriptBuf, LeafVersion)>,
    pub tap_key_origins: BTreeMap<XOnlyPublicKey, (Vec<TapLeafHash>, KeySource)>,
}

#[derive(Debug, Clone)]
pub struct InputSpec {
    pub previous_output: OutPoint,
    /// Defaults to `0xffffffff`.
    pub sequence: Option<Sequence>,
    pub update: InputUpdate,
}

impl InputSpec {
    pub fn new(previous_output: OutPoint) -> Self {
        Self {
            previous_output,
            sequence: None,
            update: InputUpdate::default(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OutputUpdate {
    pub redeem_script: Option<ScriptBuf>,
    pub witness_script: Option<ScriptBuf>,
    pub bip32_derivation: BTreeMap<secp256k1::PublicKey, KeySource>,
    pub tap_internal_key: Option<XOnlyPublicKey>,
    pub tap_key_origins: BTreeMap<XOnlyPublicKey, (Vec<TapLeafHash>, KeySource)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputDestination {
    Script(ScriptBuf),
    Address(String),
}

#[derive(Debug, Clone)]
pub struct OutputSpec {
    pub destination: OutputDestination,
    pub value: Amount,
    pub update: OutputUpdate,
}

impl OutputSpec {
    pub fn script(script_pubkey: ScriptBuf, value: Amount) -> Self {
        Self {
            destination: OutputDestination::Script(script_pubkey),
            value,
            update: OutputUpdate::default(),
        }
    }

    pub fn address(address: &str, value: Amount) -> Self {
        Self {
            destination: OutputDestination::Address(address.to_string()),
            value,
            update: OutputUpdate::default(),
        }
    }
}

/// Structural changes that existing signatures may or may not permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mutation {
    AddInput,
    AddOutput,
    SetInputSequence,
    SetVersion,
    SetLocktime,
}

impl Mutation {
    fn as_str(self) -> &'static str {
        match self {
            Mutation::AddInput => "add input",
            Mutation::AddOutput => "add output",
            Mutation::SetInputSequence => "set input sequence",
            Mutation::SetVersion => "set version",
            Mutation::SetLocktime => "set locktime",
        }
    }

    /// Whether a signature with `sighash_type` leaves this mutation uncommitted.
    fn permitted_by(self, sighash_type: u32) -> bool {
        const NONE: u32 = 0x02;
        const SINGLE: u32 = 0x03;
        const ANYONECANPAY: u32 = 0x80;

        let base = sighash_type & 0x1f;
        match self {
            Mutation::AddInput => sighash_type & ANYONECANPAY != 0,
            Mutation::AddOutput | Mutation::SetInputSequence => base == NONE || base == SINGLE,
            Mutation::SetVersion | Mutation::SetLocktime => false,
        }
    }
}

/// Sighash types of every signature on `input`, including those already
/// moved into the final fields.
fn signature_sighash_types(input: &Input, is_taproot: bool) -> Vec<u32> {
    let mut types: Vec<u32> = input
        .partial_sigs
        .values()
        .map(|sig| sig.sighash_type.to_u32())
        .collect();
    types.extend(input.tap_key_sig.iter().map(|sig| sig.sighash_type as u32));
    types.extend(input.tap_script_sigs.values().map(|sig| sig.sighash_type as u32));

    if is_taproot {
        // key path: [sig], script path: [sigs..., script, control_block]
        if let Some(witness) = &input.final_script_witness {
            let elements: Vec<&[u8]> = witness.iter().collect();
            let sigs = match elements.len() {
                0 | 1 => &elements[..],
                n => &elements[..n - 2],
            };
            for sig in sigs {
                match sig.len() {
                    64 => types.push(0x00),
                    65 => types.push(sig[64] as u32),
                    _ => {}
                }
            }
        }
        return types;
    }

    let script_sig_pushes = input.final_script_sig.iter().flat_map(|script| {
        script.instructions().filter_map(|i| match i {
            Ok(Instruction::PushBytes(bytes)) => Some(bytes.as_bytes().to_vec()),
            _ => None,
        })
    });
    let witness_elements = input
        .final_script_witness
        .iter()
        .flat_map(|witness| witness.iter().map(|e| e.to_vec()));
    for element in script_sig_pushes.chain(witness_elements) {
        if let Ok(sig) = ecdsa::Signature::from_slice(&element) {
            types.push(sig.sighash_type.to_u32());
        }
    }
    types
}

/// A BIP174 document plus the options and cache that go with it.
#[derive(Debug, Clone)]
pub struct Psbt {
    inner: BitcoinPsbt,
    opts: PsbtOpts,
    cache: TransactionCache,
}

impl PartialEq for Psbt {
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}

impl Psbt {
    /// Empty document: version 2, locktime 0, no inputs or outputs.
    pub fn new(opts: PsbtOpts) -> Self {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![],
        };
        Self {
            inner: BitcoinPsbt::from_unsigned_tx(tx).expect("empty transaction should be valid"),
            opts,
            cache: TransactionCache::new(),
        }
    }

    /// Wrap an existing document, rejecting duplicate outpoints.
    pub fn from_inner(inner: BitcoinPsbt, opts: PsbtOpts) -> Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for txin in &inner.unsigned_tx.input {
            if !seen.insert(txin.previous_output) {
                return Err(Error::DuplicateInput(txin.previous_output));
            }
        }
        Ok(Self {
            inner,
            opts,
            cache: TransactionCache::new(),
        })
    }

    pub fn from_bytes(bytes: &[u8], opts: PsbtOpts) -> Result<Self> {
        let inner = BitcoinPsbt::deserialize(bytes).map_err(|e| Error::Deserialize(e.to_string()))?;
        Self::from_inner(inner, opts)
    }

    pub fn from_base64(data: &str, opts: PsbtOpts) -> Result<Self> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|e| Error::Encoding(e.to_string()))?;
        Self::from_bytes(&bytes, opts)
    }

    pub fn from_hex(data: &str, opts: PsbtOpts) -> Result<Self> {
        let bytes = hex::decode(data.trim()).map_err(|e| Error::Encoding(e.to_string()))?;
        Self::from_bytes(&bytes, opts)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.serialize()
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(self.to_bytes())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.to_bytes())
    }

    pub fn inner(&self) -> &BitcoinPsbt {
        &self.inner
    }

    pub fn into_inner(self) -> BitcoinPsbt {
        self.inner
    }

    pub fn opts(&self) -> &PsbtOpts {
        &self.opts
    }

    pub fn cache(&self) -> &TransactionCache {
        &self.cache
    }

    pub fn unsigned_tx(&self) -> &Transaction {
        &self.inner.unsigned_tx
    }

    pub fn input_count(&self) -> usize {
        self.inner.inputs.len()
    }

    pub fn output_count(&self) -> usize {
        self.inner.outputs.len()
    }

    pub fn input(&self, index: usize) -> Result<&Input> {
        self.inner.inputs.get(index).ok_or(Error::InputOutOfRange {
            index,
            len: self.inner.inputs.len(),
        })
    }

    pub fn output(&self, index: usize) -> Result<&Output> {
        self.inner.outputs.get(index).ok_or(Error::OutputOutOfRange {
            index,
            len: self.inner.outputs.len(),
        })
    }

    pub fn is_input_finalized(&self, index: usize) -> Result<bool> {
        Ok(is_finalized(self.input(index)?))
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.inputs.iter().all(is_finalized)
    }

    pub fn signature_engine(&self) -> SignatureEngine<'_> {
        SignatureEngine::new(&self.inner, &self.cache, self.opts.unsafe_sign_nonsegwit)
    }

    fn is_taproot_input(&self, index: usize) -> bool {
        let input = &self.inner.inputs[index];
        input.tap_internal_key.is_some()
            || input.tap_key_sig.is_some()
            || !input.tap_scripts.is_empty()
            || self
                .cache
                .prevout(&self.inner, index)
                .is_ok_and(|txout| txout.script_pubkey.is_p2tr())
    }

    pub fn has_signatures(&self) -> bool {
        (0..self.inner.inputs.len())
            .any(|i| !signature_sighash_types(&self.inner.inputs[i], self.is_taproot_input(i)).is_empty())
    }

    pub(crate) fn check_signatures_permit(&self, mutation: Mutation) -> Result<()> {
        for (index, input) in self.inner.inputs.iter().enumerate() {
            let types = signature_sighash_types(input, self.is_taproot_input(index));
            if types.iter().any(|ty| !mutation.permitted_by(*ty)) {
                return Err(Error::SignaturesExist {
                    operation: mutation.as_str(),
                });
            }
        }
        Ok(())
    }

    fn input_mut(&mut self, index: usize) -> Result<&mut Input> {
        let len = self.inner.inputs.len();
        let input = self
            .inner
            .inputs
            .get_mut(index)
            .ok_or(Error::InputOutOfRange { index, len })?;
        if is_finalized(input) {
            return Err(Error::InputFinalized { input_index: index });
        }
        Ok(input)
    }

    fn apply_input_update(input: &mut Input, update: InputUpdate) {
        if let Some(utxo) = update.witness_utxo {
            input.witness_utxo = Some(utxo);
        }
        if let Some(tx) = update.non_witness_utxo {
            input.non_witness_utxo = Some(tx);
        }
        if let Some(script) = update.redeem_script {
            input.redeem_script = Some(script);
        }
        if let Some(script) = update.witness_script {
            input.witness_script = Some(script);
        }
        if let Some(ty) = update.sighash_type {
            input.sighash_type = Some(ty);
        }
        if let Some(key) = update.tap_internal_key {
            input.tap_internal_key = Some(key);
        }
        if let Some(root) = update.tap_merkle_root {
            input.tap_merkle_root = Some(root);
        }
        input.bip32_derivation.extend(update.bip32_derivation);
        input.tap_scripts.extend(update.tap_scripts);
        input.tap_key_origins.extend(update.tap_key_origins);
    }

    fn check_non_witness_utxo(index: usize, outpoint: &OutPoint, update: &InputUpdate) -> Result<()> {
        if let Some(tx) = &update.non_witness_utxo {
            let txid = tx.compute_txid();
            if txid != outpoint.txid {
                return Err(Error::NonWitnessUtxoMismatch {
                    input_index: index,
                    expected: outpoint.txid,
                    actual: txid,
                });
            }
        }
        Ok(())
    }

    pub fn add_input(&mut self, spec: InputSpec) -> Result<usize> {
        self.check_signatures_permit(Mutation::AddInput)?;
        self.cache
            .check_duplicate_input(&self.inner, &spec.previous_output)?;
        let index = self.inner.inputs.len();
        Self::check_non_witness_utxo(index, &spec.previous_output, &spec.update)?;

        self.inner.unsigned_tx.input.push(TxIn {
            previous_output: spec.previous_output,
            script_sig: ScriptBuf::new(),
            sequence: spec.sequence.unwrap_or(Sequence::MAX),
            witness: Witness::new(),
        });
        let mut input = Input::default();
        Self::apply_input_update(&mut input, spec.update);
        self.inner.inputs.push(input);
        self.cache.invalidate();

        log::debug!("added input {} spending {}", index, spec.previous_output);
        Ok(index)
    }

    pub fn add_inputs(&mut self, specs: impl IntoIterator<Item = InputSpec>) -> Result<()> {
        for spec in specs {
            self.add_input(spec)?;
        }
        Ok(())
    }

    fn resolve_destination(&self, destination: OutputDestination) -> Result<ScriptBuf> {
        match destination {
            OutputDestination::Script(script) => Ok(script),
            OutputDestination::Address(address) => {
                let address = Address::from_str(&address)
                    .map_err(|e| Error::InvalidAddress(e.to_string()))?
                    .require_network(self.opts.network)
                    .map_err(|e| Error::InvalidAddress(e.to_string()))?;
                Ok(address.script_pubkey())
            }
        }
    }

    pub fn add_output(&mut self, spec: OutputSpec) -> Result<usize> {
        self.check_signatures_permit(Mutation::AddOutput)?;
        let script_pubkey = self.resolve_destination(spec.destination)?;
        let index = self.inner.outputs.len();

        self.inner.unsigned_tx.output.push(TxOut {
            value: spec.value,
            script_pubkey,
        });
        let mut output = Output::default();
        Self::apply_output_update(&mut output, spec.update);
        self.inner.outputs.push(output);
        self.cache.invalidate();

        log::debug!("added output {} of {}", index, spec.value);
        Ok(index)
    }

    pub fn add_outputs(&mut self, specs: impl IntoIterator<Item = OutputSpec>) -> Result<()> {
        for spec in specs {
            self.add_output(spec)?;
        }
        Ok(())
    }

    fn apply_output_update(output: &mut Output, update: OutputUpdate) {
        if let Some(script) = update.redeem_script {
            output.redeem_script = Some(script);
        }
        if let Some(script) = update.witness_script {
            output.witness_script = Some(script);
        }
        if let Some(key) = update.tap_internal_key {
            output.tap_internal_key = Some(key);
        }
        output.bip32_derivation.extend(update.bip32_derivation);
        output.tap_key_origins.extend(update.tap_key_origins);
    }

    pub fn update_input(&mut self, index: usize, update: InputUpdate) -> Result<()> {
        let outpoint = self
            .inner
            .unsigned_tx
            .input
            .get(index)
            .map(|txin| txin.previous_output)
            .ok_or(Error::InputOutOfRange {
                index,
                len: self.inner.inputs.len(),
            })?;
        Self::check_non_witness_utxo(index, &outpoint, &update)?;
        Self::apply_input_update(self.input_mut(index)?, update);
        self.cache.invalidate();
        Ok(())
    }

    pub fn update_output(&mut self, index: usize, update: OutputUpdate) -> Result<()> {
        let len = self.inner.outputs.len();
        let output = self
            .inner
            .outputs
            .get_mut(index)
            .ok_or(Error::OutputOutOfRange { index, len })?;
        Self::apply_output_update(output, update);
        self.cache.invalidate();
        Ok(())
    }

    /// Mark a taproot input as spendable only through a tapleaf.
    pub fn set_script_path_only(&mut self, index: usize, enabled: bool) -> Result<()> {
        propkv::set_script_path_only(&mut self.input_mut(index)?.proprietary, enabled);
        self.cache.invalidate();
        Ok(())
    }

    pub fn set_version(&mut self, version: i32) -> Result<()> {
        self.check_signatures_permit(Mutation::SetVersion)?;
        self.inner.unsigned_tx.version = Version(version);
        self.cache.invalidate();
        Ok(())
    }

    pub fn set_locktime(&mut self, locktime: u32) -> Result<()> {
        self.check_signatures_permit(Mutation::SetLocktime)?;
        self.inner.unsigned_tx.lock_time = LockTime::from_consensus(locktime);
        self.cache.invalidate();
        Ok(())
    }

    pub fn set_input_sequence(&mut self, index: usize, sequence: u32) -> Result<()> {
        self.check_signatures_permit(Mutation::SetInputSequence)?;
        self.input_mut(index)?;
        self.inner.unsigned_tx.input[index].sequence = Sequence(sequence);
        self.cache.invalidate();
        Ok(())
    }

    /// Merge documents that describe the same unsigned transaction.
    ///
    /// Nothing is merged unless every document matches. An input finalized on
    /// either side comes out holding only its final fields.
    pub fn combine<'a>(&mut self, others: impl IntoIterator<Item = &'a Psbt>) -> Result<()> {
        let others: Vec<&Psbt> = others.into_iter().collect();
        if others
            .iter()
            .any(|other| other.inner.unsigned_tx != self.inner.unsigned_tx)
        {
            return Err(Error::UnsignedTxMismatch);
        }

        let mut merged = self.inner.clone();
        for other in others {
            merged
                .combine(other.inner.clone())
                .map_err(|_| Error::UnsignedTxMismatch)?;
        }
        for input in &mut merged.inputs {
            if is_finalized(input) {
                finalize::restore_final_only(input);
            }
        }
        self.inner = merged;
        self.cache.invalidate();
        log::debug!("combined PSBT has {} inputs", self.inner.inputs.len());
        Ok(())
    }

    pub fn fee(&self) -> Result<Amount> {
        self.cache.compute_fee(&self.inner).map(Amount::from_sat)
    }

    /// Fee in sat/vB of the finalized transaction, rounded down.
    pub fn fee_rate(&self) -> Result<u64> {
        self.cache.compute_fee_rate(&self.inner)
    }

    /// The network transaction. Every input must be finalized.
    ///
    /// Fails with `FeeTooHigh` when the fee rate exceeds `maximum_fee_rate`,
    /// unless `disable_fee_check` is set.
    pub fn extract_transaction(&self, disable_fee_check: bool) -> Result<Transaction> {
        let tx = self.cache.extracted_tx(&self.inner)?;
        if !disable_fee_check {
            self.cache.check_fees(&self.inner, self.opts.maximum_fee_rate)?;
        }
        log::debug!("extracted transaction {}", tx.compute_txid());
        Ok(tx)
    }

    pub fn get_input_type(&self, index: usize) -> Result<InputType> {
        self.input(index)?;
        Ok(self.cache.get_script_from_utxo(&self.inner, index)?.input_type)
    }

    pub fn input_has_pubkey(&self, index: usize, pubkey: &[u8]) -> Result<bool> {
        self.input(index)?;
        self.cache.input_has_pubkey(&self.inner, index, pubkey)
    }

    /// Whether a key derived from `hd` along one of the input's derivation
    /// paths is one of the input's keys.
    pub fn input_has_hd_key<H: HdSigner + ?Sized>(&self, index: usize, hd: &H) -> Result<bool> {
        let input = self.input(index)?;
        let fingerprint = hd.fingerprint();
        for (pubkey, (fp, path)) in &input.bip32_derivation {
            if *fp == fingerprint && hd.derive_signer(path)?.public_key().inner == *pubkey {
                return Ok(true);
            }
        }
        for (pubkey, (_, (fp, path))) in &input.tap_key_origins {
            if *fp == fingerprint && hd.derive_signer(path)?.x_only_public_key() == *pubkey {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn output_has_pubkey(&self, index: usize, pubkey: &[u8]) -> Result<bool> {
        let output = self.output(index)?;
        let script_pubkey = &self.inner.unsigned_tx.output[index].script_pubkey;
        let x_only = match pubkey.len() {
            33 => &pubkey[1..],
            _ => pubkey,
        };
        let script = output
            .witness_script
            .as_ref()
            .or(output.redeem_script.as_ref())
            .unwrap_or(script_pubkey);
        Ok(script_contains_pubkey(script, pubkey)
            || output
                .tap_internal_key
                .is_some_and(|key| key.serialize().as_slice() == x_only))
    }

    pub fn output_has_hd_key<H: HdSigner + ?Sized>(&self, index: usize, hd: &H) -> Result<bool> {
        let output = self.output(index)?;
        let fingerprint = hd.fingerprint();
        for (pubkey, (fp, path)) in &output.bip32_derivation {
            if *fp == fingerprint && hd.derive_signer(path)?.public_key().inner == *pubkey {
                return Ok(true);
            }
        }
        for (pubkey, (_, (fp, path))) in &output.tap_key_origins {
            if *fp == fingerprint && hd.derive_signer(path)?.x_only_public_key() == *pubkey {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

impl fmt::Display for Psbt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

impl FromStr for Psbt {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_base64(s, PsbtOpts::default())
    }
}
