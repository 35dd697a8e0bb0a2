//! Deterministic keys and PSBT fixtures for unit tests.

use crate::bitcoin::absolute::LockTime;
use crate::bitcoin::hashes::Hash;
use crate::bitcoin::psbt::{Input, Psbt as BitcoinPsbt};
use crate::bitcoin::secp256k1::{Secp256k1, SecretKey};
use crate::bitcoin::taproot::{ControlBlock, LeafVersion, TaprootBuilder, TaprootSpendInfo};
use crate::bitcoin::transaction::Version;
use crate::bitcoin::{
    Amount, OutPoint, PublicKey, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness,
};
use crate::psbt::KeyPairSigner;

pub fn secret_key(seed: u8) -> SecretKey {
    SecretKey::from_slice(&[seed; 32]).unwrap()
}

pub fn pubkey(seed: u8) -> PublicKey {
    PublicKey::new(secret_key(seed).public_key(&Secp256k1::new()))
}

pub fn signer(seed: u8) -> KeyPairSigner {
    KeyPairSigner::new(secret_key(seed))
}

pub fn p2wpkh_script(seed: u8) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&pubkey(seed).wpubkey_hash().unwrap())
}

/// A transaction paying `value` to `script` at vout 0. Distinct seeds give
/// distinct txids.
pub fn funding_tx(script: ScriptBuf, seed: u8, value: u64) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::from_byte_array([seed; 32]), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: script,
        }],
    }
}

/// Two `<key> OP_CHECKSIG` leaves under one internal key.
pub struct TaprootLeaves {
    internal_seed: u8,
    scripts: Vec<ScriptBuf>,
    spend_info: TaprootSpendInfo,
}

fn checksig_leaf(seed: u8) -> ScriptBuf {
    crate::bitcoin::blockdata::script::Builder::new()
        .push_x_only_key(&signer(seed).x_only_public_key())
        .push_opcode(crate::bitcoin::opcodes::all::OP_CHECKSIG)
        .into_script()
}

impl TaprootLeaves {
    pub fn two_single_key_leaves(internal_seed: u8, a: u8, b: u8) -> Self {
        let secp = Secp256k1::new();
        let scripts = vec![checksig_leaf(a), checksig_leaf(b)];
        let spend_info = TaprootBuilder::new()
            .add_leaf(1, scripts[0].clone())
            .and_then(|builder| builder.add_leaf(1, scripts[1].clone()))
            .unwrap()
            .finalize(&secp, signer(internal_seed).x_only_public_key())
            .unwrap_or_else(|_| panic!("tree with two depth-1 leaves is complete"));
        Self {
            internal_seed,
            scripts,
            spend_info,
        }
    }

    pub fn leaf(&self, index: usize) -> (ScriptBuf, ControlBlock) {
        let script = self.scripts[index].clone();
        let control_block = self
            .spend_info
            .control_block(&(script.clone(), LeafVersion::TapScript))
            .unwrap();
        (script, control_block)
    }

    /// Signer for the key path of the output.
    pub fn tweaked_internal_signer(&self) -> KeyPairSigner {
        signer(self.internal_seed).tap_tweak(self.spend_info.merkle_root())
    }
}

/// Builds a [`BitcoinPsbt`] input by input. Each input spends its own funding
/// transaction, so outpoints never collide.
pub struct PsbtBuilder {
    inputs: Vec<(OutPoint, Input)>,
    outputs: Vec<TxOut>,
    next_funding: u8,
}

impl Default for PsbtBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PsbtBuilder {
    pub fn new() -> Self {
        Self {
            inputs: vec![],
            outputs: vec![],
            next_funding: 100,
        }
    }

    fn funding(&mut self, script_pubkey: ScriptBuf, value: u64) -> Transaction {
        let tx = funding_tx(script_pubkey, self.next_funding, value);
        self.next_funding = self.next_funding.wrapping_add(1);
        tx
    }

    fn push(mut self, tx: &Transaction, input: Input) -> Self {
        self.inputs.push((OutPoint::new(tx.compute_txid(), 0), input));
        self
    }

    fn witness_input(mut self, script_pubkey: ScriptBuf, value: u64, configure: impl FnOnce(&mut Input)) -> Self {
        let tx = self.funding(script_pubkey, value);
        let mut input = Input {
            witness_utxo: Some(tx.output[0].clone()),
            ..Default::default()
        };
        configure(&mut input);
        self.push(&tx, input)
    }

    pub fn p2wpkh_input(self, seed: u8, value: u64) -> Self {
        self.witness_input(p2wpkh_script(seed), value, |_| {})
    }

    pub fn p2pkh_input(mut self, seed: u8, value: u64) -> Self {
        let tx = self.funding(ScriptBuf::new_p2pkh(&pubkey(seed).pubkey_hash()), value);
        let input = Input {
            non_witness_utxo: Some(tx.clone()),
            ..Default::default()
        };
        self.push(&tx, input)
    }

    pub fn p2pk_input(mut self, seed: u8, value: u64) -> Self {
        let tx = self.funding(ScriptBuf::new_p2pk(&pubkey(seed)), value);
        let input = Input {
            non_witness_utxo: Some(tx.clone()),
            ..Default::default()
        };
        self.push(&tx, input)
    }

    pub fn p2sh_input(mut self, redeem_script: ScriptBuf, value: u64) -> Self {
        let tx = self.funding(redeem_script.to_p2sh(), value);
        let input = Input {
            non_witness_utxo: Some(tx.clone()),
            redeem_script: Some(redeem_script),
            ..Default::default()
        };
        self.push(&tx, input)
    }

    pub fn p2wsh_input(self, witness_script: ScriptBuf, value: u64) -> Self {
        self.witness_input(witness_script.to_p2wsh(), value, |input| {
            input.witness_script = Some(witness_script);
        })
    }

    pub fn p2sh_p2wsh_input(self, witness_script: ScriptBuf, value: u64) -> Self {
        let redeem_script = witness_script.to_p2wsh();
        self.witness_input(redeem_script.to_p2sh(), value, |input| {
            input.redeem_script = Some(redeem_script);
            input.witness_script = Some(witness_script);
        })
    }

    pub fn p2tr_key_input(self, seed: u8, value: u64) -> Self {
        let internal = signer(seed).x_only_public_key();
        let script_pubkey = ScriptBuf::new_p2tr(&Secp256k1::new(), internal, None);
        self.witness_input(script_pubkey, value, |input| {
            input.tap_internal_key = Some(internal);
        })
    }

    pub fn p2tr_script_input(self, leaves: &TaprootLeaves, value: u64) -> Self {
        let script_pubkey = ScriptBuf::new_p2tr_tweaked(leaves.spend_info.output_key());
        self.witness_input(script_pubkey, value, |input| {
            input.tap_internal_key = Some(leaves.spend_info.internal_key());
            input.tap_merkle_root = leaves.spend_info.merkle_root();
            for index in 0..leaves.scripts.len() {
                let (script, control_block) = leaves.leaf(index);
                input
                    .tap_scripts
                    .insert(control_block, (script, LeafVersion::TapScript));
            }
        })
    }

    pub fn output(mut self, value: u64) -> Self {
        self.outputs.push(TxOut {
            value: Amount::from_sat(value),
            script_pubkey: p2wpkh_script(200),
        });
        self
    }

    pub fn build(self) -> BitcoinPsbt {
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: self
                .inputs
                .iter()
                .map(|(previous_output, _)| TxIn {
                    previous_output: *previous_output,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::MAX,
                    witness: Witness::new(),
                })
                .collect(),
            output: self.outputs,
        };
        let mut psbt = BitcoinPsbt::from_unsigned_tx(tx).unwrap();
        psbt.inputs = self.inputs.into_iter().map(|(_, input)| input).collect();
        psbt
    }
}
