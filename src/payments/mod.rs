//! Output script classification and the script-level payment codecs.

pub mod p2ms;

pub use p2ms::{
    decode_multisig, decode_multisig_input, encode_multisig, encode_multisig_input, Multisig,
};

use std::fmt;

use crate::bitcoin::blockdata::script::Instruction;
use crate::bitcoin::hashes::{hash160, Hash};
use crate::bitcoin::Script;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptType {
    P2pkh,
    P2sh,
    P2wpkh,
    P2wsh,
    P2tr,
    P2pk,
    Multisig,
    Nonstandard,
}

impl ScriptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType::P2pkh => "p2pkh",
            ScriptType::P2sh => "p2sh",
            ScriptType::P2wpkh => "p2wpkh",
            ScriptType::P2wsh => "p2wsh",
            ScriptType::P2tr => "p2tr",
            ScriptType::P2pk => "p2pk",
            ScriptType::Multisig => "multisig",
            ScriptType::Nonstandard => "nonstandard",
        }
    }

    pub fn is_segwit(&self) -> bool {
        matches!(self, ScriptType::P2wpkh | ScriptType::P2wsh | ScriptType::P2tr)
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a script by matching its instruction pattern. The script is never executed.
pub fn classify(script: &Script) -> ScriptType {
    if script.is_p2pkh() {
        ScriptType::P2pkh
    } else if script.is_p2sh() {
        ScriptType::P2sh
    } else if script.is_p2wpkh() {
        ScriptType::P2wpkh
    } else if script.is_p2wsh() {
        ScriptType::P2wsh
    } else if script.is_p2tr() {
        ScriptType::P2tr
    } else if script.is_p2pk() {
        ScriptType::P2pk
    } else if decode_multisig(script).is_ok() {
        ScriptType::Multisig
    } else {
        ScriptType::Nonstandard
    }
}

/// The resolved spend type of an input, including the wrapping layers.
///
/// `p2sh-p2wsh-multisig` is `{ p2sh: true, p2wsh: true, script_type: Multisig }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputType {
    pub p2sh: bool,
    pub p2wsh: bool,
    pub script_type: ScriptType,
}

impl fmt::Display for InputType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.p2sh {
            f.write_str("p2sh-")?;
        }
        if self.p2wsh {
            f.write_str("p2wsh-")?;
        }
        f.write_str(self.script_type.as_str())
    }
}

/// True when `script` pushes `pubkey`, its x-only form or its hash160.
///
/// `pubkey` may be a 33/65 byte serialized key or a 32 byte x-only key.
pub fn script_contains_pubkey(script: &Script, pubkey: &[u8]) -> bool {
    let key_hash = hash160::Hash::hash(pubkey);
    let x_only = (pubkey.len() == 33).then(|| &pubkey[1..]);

    script.instructions().flatten().any(|instruction| match instruction {
        Instruction::PushBytes(push) => {
            let bytes = push.as_bytes();
            !bytes.is_empty()
                && (bytes == pubkey
                    || bytes == key_hash.as_byte_array().as_slice()
                    || x_only == Some(bytes)
                    || (pubkey.len() == 32 && bytes.len() == 33 && &bytes[1..] == pubkey))
        }
        Instruction::Op(_) => false,
    })
}
