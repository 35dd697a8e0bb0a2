//! Proprietary key-values this crate reads and writes on PSBT inputs.

use std::collections::BTreeMap;

pub use crate::bitcoin::psbt::raw::ProprietaryKey;

/// Proprietary key identifier
pub const PREFIX: &[u8] = b"UTXOPSBT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProprietaryKeySubtype {
    /// Input may only be spent through a tapleaf, the key path is disabled.
    ScriptPathOnly = 0x00,
}

impl ProprietaryKeySubtype {
    pub fn from(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(ProprietaryKeySubtype::ScriptPathOnly),
            _ => None,
        }
    }

    pub fn key(self) -> ProprietaryKey {
        ProprietaryKey {
            prefix: PREFIX.to_vec(),
            subtype: self as u8,
            key: vec![],
        }
    }
}

pub fn is_own_key(key: &ProprietaryKey) -> bool {
    key.prefix.as_slice() == PREFIX
}

/// Iterate the values stored under `subtype`, ignoring foreign prefixes.
pub fn find_kv<'a>(
    subtype: ProprietaryKeySubtype,
    map: &'a BTreeMap<ProprietaryKey, Vec<u8>>,
) -> impl Iterator<Item = (&'a [u8], &'a [u8])> + 'a {
    map.iter()
        .filter(move |(k, _)| is_own_key(k) && k.subtype == subtype as u8)
        .map(|(k, v)| (k.key.as_slice(), v.as_slice()))
}

pub fn is_script_path_only(map: &BTreeMap<ProprietaryKey, Vec<u8>>) -> bool {
    find_kv(ProprietaryKeySubtype::ScriptPathOnly, map).any(|(_, value)| value == [1u8].as_slice())
}

pub fn set_script_path_only(map: &mut BTreeMap<ProprietaryKey, Vec<u8>>, enabled: bool) {
    let key = ProprietaryKeySubtype::ScriptPathOnly.key();
    if enabled {
        map.insert(key, vec![1]);
    } else {
        map.remove(&key);
    }
}
