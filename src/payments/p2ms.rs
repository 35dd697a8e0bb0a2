//! Bare multisig (P2MS) scripts:
//! `OP_m <pubkey_1> ... <pubkey_n> OP_n OP_CHECKMULTISIG` and the matching
//! `OP_0 <sig_1> ... <sig_m>` unlocking script.

use crate::bitcoin::blockdata::opcodes::all::{OP_CHECKMULTISIG, OP_PUSHBYTES_0, OP_PUSHNUM_1, OP_PUSHNUM_16};
use crate::bitcoin::blockdata::opcodes::Opcode;
use crate::bitcoin::blockdata::script::{Builder, Instruction};
use crate::bitcoin::script::PushBytesBuf;
use crate::bitcoin::{ecdsa, PublicKey, Script, ScriptBuf};
use crate::error::{Error, Result};

pub const MAX_PUBKEYS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Multisig {
    pub m: usize,
    pub n: usize,
    pub pubkeys: Vec<PublicKey>,
}

fn check_bounds(m: usize, n: usize) -> Result<()> {
    if m == 0 {
        return Err(Error::InvalidScript("multisig threshold must be at least 1".into()));
    }
    if n > MAX_PUBKEYS {
        return Err(Error::InvalidScript(format!(
            "multisig supports at most {} pubkeys, got {}",
            MAX_PUBKEYS, n
        )));
    }
    if m > n {
        return Err(Error::InvalidScript(format!(
            "multisig threshold {} exceeds pubkey count {}",
            m, n
        )));
    }
    Ok(())
}

/// Value of `OP_1..OP_16`, `None` for any other opcode.
fn small_int(op: Opcode) -> Option<usize> {
    let byte = op.to_u8();
    if (OP_PUSHNUM_1.to_u8()..=OP_PUSHNUM_16.to_u8()).contains(&byte) {
        Some((byte - OP_PUSHNUM_1.to_u8() + 1) as usize)
    } else {
        None
    }
}

fn small_int_at(instructions: &[Instruction], index: usize, what: &str) -> Result<usize> {
    match instructions.get(index) {
        Some(Instruction::Op(op)) => small_int(*op),
        _ => None,
    }
    .ok_or_else(|| Error::InvalidScript(format!("multisig {} must be OP_1..OP_16", what)))
}

fn collect_instructions(script: &Script) -> Result<Vec<Instruction<'_>>> {
    script
        .instructions()
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::InvalidScript(e.to_string()))
}

/// Build `OP_m <pubkeys...> OP_n OP_CHECKMULTISIG`.
pub fn encode_multisig(m: usize, pubkeys: &[PublicKey]) -> Result<ScriptBuf> {
    let n = pubkeys.len();
    check_bounds(m, n)?;
    let mut builder = Builder::new().push_int(m as i64);
    for pubkey in pubkeys {
        builder = builder.push_key(pubkey);
    }
    Ok(builder
        .push_int(n as i64)
        .push_opcode(OP_CHECKMULTISIG)
        .into_script())
}

/// Parse a multisig script.
///
/// Fails if the script is not exactly `OP_m <n pubkeys> OP_n OP_CHECKMULTISIG`
/// with `1 <= m <= n <= 16` and every pubkey a valid curve point.
pub fn decode_multisig(script: &Script) -> Result<Multisig> {
    let instructions = collect_instructions(script)?;
    let len = instructions.len();
    if len < 4 {
        return Err(Error::InvalidScript("script too short for multisig".into()));
    }
    if instructions[len - 1] != Instruction::Op(OP_CHECKMULTISIG) {
        return Err(Error::InvalidScript(
            "multisig must end with OP_CHECKMULTISIG".into(),
        ));
    }

    let m = small_int_at(&instructions, 0, "threshold")?;
    let n = small_int_at(&instructions, len - 2, "pubkey count")?;
    check_bounds(m, n)?;

    let key_chunks = &instructions[1..len - 2];
    if key_chunks.len() != n {
        return Err(Error::InvalidScript(format!(
            "multisig declares {} pubkeys but contains {}",
            n,
            key_chunks.len()
        )));
    }

    let pubkeys = key_chunks
        .iter()
        .map(|chunk| match chunk {
            Instruction::PushBytes(bytes) => PublicKey::from_slice(bytes.as_bytes())
                .map_err(|e| Error::InvalidScript(format!("invalid multisig pubkey: {}", e))),
            Instruction::Op(op) => Err(Error::InvalidScript(format!(
                "unexpected opcode {} in multisig pubkeys",
                op
            ))),
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(Multisig { m, n, pubkeys })
}

/// Build `OP_0 <sig_1> ... <sig_k>`. `None` entries become `OP_0` placeholders.
pub fn encode_multisig_input(signatures: &[Option<ecdsa::Signature>]) -> Result<ScriptBuf> {
    let mut builder = Builder::new().push_opcode(OP_PUSHBYTES_0);
    for signature in signatures {
        builder = match signature {
            Some(signature) => {
                let push = PushBytesBuf::try_from(signature.to_vec()).map_err(|e| {
                    Error::InvalidScript(format!("signature exceeds push limit: {}", e))
                })?;
                builder.push_slice(push)
            }
            None => builder.push_opcode(OP_PUSHBYTES_0),
        };
    }
    Ok(builder.into_script())
}

/// Parse a multisig unlocking script.
///
/// Each signature must be strict DER followed by a standard sighash byte.
/// With `allow_incomplete`, `OP_0` placeholders are accepted and returned as `None`.
pub fn decode_multisig_input(
    script_sig: &Script,
    allow_incomplete: bool,
) -> Result<Vec<Option<ecdsa::Signature>>> {
    let instructions = collect_instructions(script_sig)?;
    match instructions.first() {
        Some(Instruction::PushBytes(bytes)) if bytes.is_empty() => {}
        _ => {
            return Err(Error::InvalidScript(
                "multisig input must start with OP_0".into(),
            ))
        }
    }
    if instructions.len() < 2 {
        return Err(Error::InvalidScript("multisig input has no signatures".into()));
    }

    instructions[1..]
        .iter()
        .map(|chunk| match chunk {
            Instruction::PushBytes(bytes) if bytes.is_empty() => {
                if allow_incomplete {
                    Ok(None)
                } else {
                    Err(Error::InvalidScript(
                        "placeholder signature in complete multisig input".into(),
                    ))
                }
            }
            Instruction::PushBytes(bytes) => ecdsa::Signature::from_slice(bytes.as_bytes())
                .map(Some)
                .map_err(|e| Error::InvalidScript(format!("invalid multisig signature: {}", e))),
            Instruction::Op(op) => Err(Error::InvalidScript(format!(
                "unexpected opcode {} in multisig input",
                op
            ))),
        })
        .collect()
}
