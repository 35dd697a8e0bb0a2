//! The finalizer role: turn collected signatures into the final script sig and
//! witness of each input.

use crate::bitcoin::blockdata::opcodes::all::{
    OP_CHECKSIG, OP_CHECKSIGADD, OP_CHECKSIGVERIFY, OP_PUSHBYTES_0,
};
use crate::bitcoin::blockdata::script::{Builder, Instruction};
use crate::bitcoin::psbt::Input;
use crate::bitcoin::script::PushBytesBuf;
use crate::bitcoin::taproot::{ControlBlock, TapLeafHash};
use crate::bitcoin::{PublicKey, ScriptBuf, Witness, XOnlyPublicKey};
use crate::error::{Error, Result};
use crate::payments::{decode_multisig, ScriptType};

use super::cache::{is_finalized, PrevoutScript};
use super::sighash::is_script_path_only;
use super::Psbt;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalizeOptions {
    /// Finalize multisig inputs below threshold, leaving `OP_0` in the
    /// missing slots. The result is not a valid spend.
    pub allow_incomplete: bool,
    /// Tapleaf to finalize a taproot script-path spend with.
    pub leaf_hash: Option<TapLeafHash>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalScripts {
    pub script_sig: Option<ScriptBuf>,
    pub witness: Option<Witness>,
}

fn push_script(items: &[Vec<u8>]) -> Result<ScriptBuf> {
    let mut builder = Builder::new();
    for item in items {
        builder = if item.is_empty() {
            builder.push_opcode(OP_PUSHBYTES_0)
        } else {
            let push = PushBytesBuf::try_from(item.clone())
                .map_err(|e| Error::InvalidScript(format!("push exceeds limit: {}", e)))?;
            builder.push_slice(push)
        };
    }
    Ok(builder.into_script())
}

/// Keep only the utxo, proprietary and unknown fields, then set the final ones.
fn clear_for_final(input: &mut Input, scripts: FinalScripts) {
    *input = Input {
        non_witness_utxo: input.non_witness_utxo.take(),
        witness_utxo: input.witness_utxo.take(),
        proprietary: std::mem::take(&mut input.proprietary),
        unknown: std::mem::take(&mut input.unknown),
        final_script_sig: scripts.script_sig,
        final_script_witness: scripts.witness,
        ..Default::default()
    };
}

/// Drop anything a finalized input picked up besides its final fields.
pub(super) fn restore_final_only(input: &mut Input) {
    let scripts = FinalScripts {
        script_sig: input.final_script_sig.take(),
        witness: input.final_script_witness.take(),
    };
    clear_for_final(input, scripts);
}

/// Single-key spends: `<sig> <pubkey>`, or `<sig>` for p2pk.
fn single_key_stack(input_index: usize, input: &Input, script: &PrevoutScript) -> Result<Vec<Vec<u8>>> {
    let (pubkey, sig) = input
        .partial_sigs
        .iter()
        .find(|(pubkey, _)| match script.input_type.script_type {
            ScriptType::P2pk => crate::payments::script_contains_pubkey(
                &script.meaningful_script,
                &pubkey.to_bytes(),
            ),
            _ => ScriptBuf::new_p2pkh(&pubkey.pubkey_hash()) == script.meaningful_script
                || pubkey
                    .wpubkey_hash()
                    .is_ok_and(|hash| ScriptBuf::new_p2wpkh(&hash) == script.meaningful_script),
        })
        .ok_or(Error::NoSignature { input_index })?;

    Ok(match script.input_type.script_type {
        ScriptType::P2pk => vec![sig.to_vec()],
        _ => vec![sig.to_vec(), pubkey.to_bytes()],
    })
}

/// `OP_0 <m sigs in pubkey order>`. Below threshold, the sigs present are
/// followed by empty pushes up to `m`, provided `allow_incomplete` is set.
fn multisig_stack(
    input_index: usize,
    input: &Input,
    script: &PrevoutScript,
    allow_incomplete: bool,
) -> Result<Vec<Vec<u8>>> {
    let multisig = decode_multisig(&script.meaningful_script)?;
    let sigs: Vec<Vec<u8>> = multisig
        .pubkeys
        .iter()
        .filter_map(|pubkey: &PublicKey| input.partial_sigs.get(pubkey).map(|sig| sig.to_vec()))
        .collect();
    let found = sigs.len();

    let mut stack = vec![vec![]];
    if found >= multisig.m {
        stack.extend(sigs.into_iter().take(multisig.m));
    } else if allow_incomplete {
        stack.extend(sigs);
        stack.resize(multisig.m + 1, vec![]);
    } else {
        return Err(Error::InsufficientSignatures {
            input_index,
            required: multisig.m,
            found,
        });
    }
    Ok(stack)
}

/// Final scripts for a non-taproot input.
fn build_final_scripts(
    input_index: usize,
    input: &Input,
    script: &PrevoutScript,
    allow_incomplete: bool,
) -> Result<FinalScripts> {
    let stack = match script.input_type.script_type {
        ScriptType::P2pkh | ScriptType::P2wpkh | ScriptType::P2pk => {
            single_key_stack(input_index, input, script)?
        }
        ScriptType::Multisig => multisig_stack(input_index, input, script, allow_incomplete)?,
        other => {
            return Err(Error::UnsupportedScript {
                input_index,
                script_type: other.to_string(),
            })
        }
    };

    let redeem_push = match &script.redeem_script {
        Some(redeem) => vec![redeem.to_bytes()],
        None => vec![],
    };

    if let Some(witness_script) = &script.witness_script {
        let mut elements = stack;
        elements.push(witness_script.to_bytes());
        return Ok(FinalScripts {
            script_sig: script.is_p2sh().then(|| push_script(&redeem_push)).transpose()?,
            witness: Some(Witness::from_slice(&elements)),
        });
    }

    if script.is_segwit {
        return Ok(FinalScripts {
            script_sig: script.is_p2sh().then(|| push_script(&redeem_push)).transpose()?,
            witness: Some(Witness::from_slice(&stack)),
        });
    }

    let mut items = stack;
    items.extend(redeem_push);
    Ok(FinalScripts {
        script_sig: Some(push_script(&items)?),
        witness: None,
    })
}

/// X-only keys checked by a signature opcode in a tapleaf, in script order.
/// Other 32-byte pushes (hashlock digests and the like) are not keys.
fn leaf_keys(script: &ScriptBuf) -> Vec<XOnlyPublicKey> {
    let instructions: Vec<_> = script.instructions().filter_map(|i| i.ok()).collect();
    instructions
        .windows(2)
        .filter_map(|pair| match pair {
            [Instruction::PushBytes(bytes), Instruction::Op(op)]
                if bytes.len() == 32
                    && matches!(*op, OP_CHECKSIG | OP_CHECKSIGADD | OP_CHECKSIGVERIFY) =>
            {
                XOnlyPublicKey::from_slice(bytes.as_bytes()).ok()
            }
            _ => None,
        })
        .collect()
}

fn uses_checksigadd(script: &ScriptBuf) -> bool {
    script
        .instructions()
        .any(|i| matches!(i, Ok(Instruction::Op(op)) if op == OP_CHECKSIGADD))
}

/// `[sig_k ... sig_1, script, control_block]`: the first key in the script
/// consumes the top of the stack, so signatures go in reverse key order.
fn taproot_script_path_witness(
    input_index: usize,
    input: &Input,
    control_block: &ControlBlock,
    leaf_script: &ScriptBuf,
    leaf: TapLeafHash,
) -> Result<Witness> {
    let keys = leaf_keys(leaf_script);
    let allow_missing = uses_checksigadd(leaf_script);

    let mut sigs = Vec::with_capacity(keys.len());
    for key in &keys {
        match input.tap_script_sigs.get(&(*key, leaf)) {
            Some(sig) => sigs.push(sig.to_vec()),
            None if allow_missing => sigs.push(vec![]),
            None => {
                return Err(Error::InsufficientSignatures {
                    input_index,
                    required: keys.len(),
                    found: keys
                        .iter()
                        .filter(|k| input.tap_script_sigs.contains_key(&(**k, leaf)))
                        .count(),
                })
            }
        }
    }

    let mut witness = Witness::new();
    for sig in sigs.iter().rev() {
        witness.push(sig);
    }
    witness.push(leaf_script.as_bytes());
    witness.push(control_block.serialize());
    Ok(witness)
}

fn build_taproot_final_scripts(
    input_index: usize,
    input: &Input,
    leaf_hash: Option<TapLeafHash>,
) -> Result<FinalScripts> {
    if input.tap_key_sig.is_none() && input.tap_script_sigs.is_empty() {
        return Err(Error::NoSignature { input_index });
    }

    if let Some(sig) = &input.tap_key_sig {
        if leaf_hash.is_none() && !is_script_path_only(input) {
            let mut witness = Witness::new();
            witness.push(sig.to_vec());
            return Ok(FinalScripts {
                script_sig: None,
                witness: Some(witness),
            });
        }
    }

    let candidates: Vec<_> = input
        .tap_scripts
        .iter()
        .map(|(control_block, (script, version))| {
            (control_block, script, TapLeafHash::from_script(script, *version))
        })
        .filter(|(_, _, leaf)| leaf_hash.map_or(true, |wanted| wanted == *leaf))
        .filter(|(_, _, leaf)| input.tap_script_sigs.keys().any(|(_, l)| l == leaf))
        .collect();

    match candidates.as_slice() {
        [(control_block, script, leaf)] => Ok(FinalScripts {
            script_sig: None,
            witness: Some(taproot_script_path_witness(
                input_index,
                input,
                control_block,
                script,
                *leaf,
            )?),
        }),
        _ => Err(Error::NoMatchingLeaf {
            input_index,
            candidates: candidates.len(),
        }),
    }
}

impl Psbt {
    fn check_finalizable(&self, input_index: usize) -> Result<()> {
        if is_finalized(self.input(input_index)?) {
            return Err(Error::AlreadyFinalized { input_index });
        }
        Ok(())
    }

    fn apply_final_scripts(&mut self, input_index: usize, scripts: FinalScripts) -> FinalScripts {
        clear_for_final(&mut self.inner.inputs[input_index], scripts.clone());
        self.cache.invalidate();
        log::debug!("finalized input {}", input_index);
        scripts
    }

    pub fn finalize_input(&mut self, input_index: usize) -> Result<FinalScripts> {
        self.finalize_input_with_options(input_index, &FinalizeOptions::default())
    }

    /// Finalize one input. A finalized input is never modified again, and
    /// finalizing it a second time fails with `AlreadyFinalized`.
    pub fn finalize_input_with_options(
        &mut self,
        input_index: usize,
        options: &FinalizeOptions,
    ) -> Result<FinalScripts> {
        self.check_finalizable(input_index)?;
        let script = self.cache.get_script_from_utxo(&self.inner, input_index)?;
        let input = &self.inner.inputs[input_index];

        let scripts = if script.is_taproot() {
            build_taproot_final_scripts(input_index, input, options.leaf_hash)?
        } else {
            build_final_scripts(input_index, input, &script, options.allow_incomplete)?
        };
        Ok(self.apply_final_scripts(input_index, scripts))
    }

    pub fn finalize_taproot_input(
        &mut self,
        input_index: usize,
        leaf_hash: Option<TapLeafHash>,
    ) -> Result<FinalScripts> {
        self.finalize_input_with_options(
            input_index,
            &FinalizeOptions {
                allow_incomplete: false,
                leaf_hash,
            },
        )
    }

    /// Finalize with caller-built scripts, for script templates this crate
    /// does not know how to satisfy.
    pub fn finalize_input_with<F>(&mut self, input_index: usize, build: F) -> Result<FinalScripts>
    where
        F: FnOnce(usize, &Input, &PrevoutScript) -> Result<FinalScripts>,
    {
        self.check_finalizable(input_index)?;
        let script = self.cache.get_script_from_utxo(&self.inner, input_index)?;
        let scripts = build(input_index, &self.inner.inputs[input_index], &script)?;
        Ok(self.apply_final_scripts(input_index, scripts))
    }

    /// Finalize every input that is not finalized yet. Every input is
    /// attempted; the failures are returned together.
    pub fn finalize_all_inputs(&mut self) -> std::result::Result<(), Vec<(usize, Error)>> {
        let mut errors = Vec::new();
        for input_index in 0..self.input_count() {
            if is_finalized(&self.inner.inputs[input_index]) {
                continue;
            }
            if let Err(e) = self.finalize_input(input_index) {
                errors.push((input_index, e));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
