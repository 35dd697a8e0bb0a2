//! Signature hashes for legacy, segwit v0 and taproot spends, and checking
//! stored signatures against them.

use crate::bitcoin::hashes::Hash;
use crate::bitcoin::psbt::{Input, Psbt as BitcoinPsbt, PsbtSighashType};
use crate::bitcoin::secp256k1::{self, Secp256k1, Verification};
use crate::bitcoin::sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType};
use crate::bitcoin::taproot::TapLeafHash;
use crate::bitcoin::{ecdsa, taproot, PublicKey, ScriptBuf, XOnlyPublicKey};
use crate::error::{Error, Result};
use crate::payments::{script_contains_pubkey, ScriptType};

use super::cache::{is_finalized, PrevoutScript, TransactionCache};
use super::propkv;

/// BIP341 "nothing up my sleeve" point. An internal key equal to it has no
/// known private key, so the key path is unspendable.
pub const NUMS_INTERNAL_KEY: [u8; 32] = [
    0x50, 0x92, 0x9b, 0x74, 0xc1, 0xa0, 0x49, 0x54, 0xb7, 0x8b, 0x4b, 0x60, 0x35, 0xe9, 0x7a, 0x5e,
    0x07, 0x8a, 0x5a, 0x0f, 0x28, 0xec, 0x96, 0xd5, 0x47, 0xbf, 0xee, 0x9a, 0xce, 0x80, 0x3a, 0xc0,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SigHash {
    pub hash: [u8; 32],
    /// The script the signature has to satisfy.
    pub script: ScriptBuf,
    pub sighash_type: EcdsaSighashType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaprootHash {
    pub hash: [u8; 32],
    pub pubkey: XOnlyPublicKey,
    /// `None` for the key path.
    pub leaf_hash: Option<TapLeafHash>,
    pub sighash_type: TapSighashType,
}

/// Curve verification, injected so the engine itself never does curve math.
pub trait SignatureVerifier {
    fn verify_ecdsa(&self, pubkey: &PublicKey, hash: &[u8; 32], signature: &secp256k1::ecdsa::Signature) -> bool;

    fn verify_schnorr(
        &self,
        pubkey: &XOnlyPublicKey,
        hash: &[u8; 32],
        signature: &secp256k1::schnorr::Signature,
    ) -> bool;
}

pub struct Secp256k1Verifier<C: Verification = secp256k1::VerifyOnly> {
    secp: Secp256k1<C>,
}

impl Secp256k1Verifier {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::verification_only(),
        }
    }
}

impl Default for Secp256k1Verifier {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Verification> SignatureVerifier for Secp256k1Verifier<C> {
    fn verify_ecdsa(&self, pubkey: &PublicKey, hash: &[u8; 32], signature: &secp256k1::ecdsa::Signature) -> bool {
        let msg = secp256k1::Message::from_digest(*hash);
        self.secp.verify_ecdsa(&msg, signature, &pubkey.inner).is_ok()
    }

    fn verify_schnorr(
        &self,
        pubkey: &XOnlyPublicKey,
        hash: &[u8; 32],
        signature: &secp256k1::schnorr::Signature,
    ) -> bool {
        let msg = secp256k1::Message::from_digest(*hash);
        self.secp.verify_schnorr(signature, &msg, pubkey).is_ok()
    }
}

/// Check a raw signature against `hash`.
///
/// A 32 byte `pubkey` selects Schnorr (64 or 65 byte signature), anything else
/// ECDSA (DER, with or without the trailing sighash byte). Unparseable input is
/// an invalid signature, not an error.
pub fn validate_signature<V: SignatureVerifier + ?Sized>(
    verifier: &V,
    pubkey: &[u8],
    hash: &[u8; 32],
    signature: &[u8],
) -> bool {
    if pubkey.len() == 32 {
        let (Ok(key), Ok(sig)) = (
            XOnlyPublicKey::from_slice(pubkey),
            taproot::Signature::from_slice(signature),
        ) else {
            return false;
        };
        return verifier.verify_schnorr(&key, hash, &sig.signature);
    }

    let Ok(key) = PublicKey::from_slice(pubkey) else {
        return false;
    };
    let sig = match ecdsa::Signature::from_slice(signature) {
        Ok(sig) => sig.signature,
        Err(_) => match secp256k1::ecdsa::Signature::from_der(signature) {
            Ok(sig) => sig,
            Err(_) => return false,
        },
    };
    verifier.verify_ecdsa(&key, hash, &sig)
}

fn x_only_bytes(pubkey: &[u8]) -> &[u8] {
    match pubkey.len() {
        33 => &pubkey[1..],
        _ => pubkey,
    }
}

/// True when the key path of a taproot input must not be used.
pub fn is_script_path_only(input: &Input) -> bool {
    propkv::is_script_path_only(&input.proprietary)
        || input
            .tap_internal_key
            .is_some_and(|key| key.serialize() == NUMS_INTERNAL_KEY)
}

/// Resolve the sighash type for a signature: the input's own type, if it has
/// one, binds the caller.
fn resolve_sighash_type(
    input_index: usize,
    input_type: Option<PsbtSighashType>,
    requested: Option<PsbtSighashType>,
    default: PsbtSighashType,
) -> Result<PsbtSighashType> {
    match (input_type, requested) {
        (Some(expected), Some(actual)) if expected.to_u32() != actual.to_u32() => {
            Err(Error::SighashTypeMismatch {
                input_index,
                expected: expected.to_u32(),
                actual: actual.to_u32(),
            })
        }
        (Some(ty), _) | (None, Some(ty)) => Ok(ty),
        (None, None) => Ok(default),
    }
}

/// Computes signature hashes for one document. Borrowed for the duration of
/// a single signing or validation step.
pub struct SignatureEngine<'a> {
    psbt: &'a BitcoinPsbt,
    cache: &'a TransactionCache,
    unsafe_sign_nonsegwit: bool,
}

impl<'a> SignatureEngine<'a> {
    pub fn new(psbt: &'a BitcoinPsbt, cache: &'a TransactionCache, unsafe_sign_nonsegwit: bool) -> Self {
        Self {
            psbt,
            cache,
            unsafe_sign_nonsegwit,
        }
    }

    fn input(&self, input_index: usize) -> Result<&'a Input> {
        let input = self.psbt.inputs.get(input_index).ok_or(Error::InputOutOfRange {
            index: input_index,
            len: self.psbt.inputs.len(),
        })?;
        if is_finalized(input) {
            return Err(Error::InputFinalized { input_index });
        }
        Ok(input)
    }

    pub fn ecdsa_sighash_type(&self, input_index: usize, requested: Option<EcdsaSighashType>) -> Result<EcdsaSighashType> {
        let input = self.input(input_index)?;
        let ty = resolve_sighash_type(
            input_index,
            input.sighash_type,
            requested.map(PsbtSighashType::from),
            EcdsaSighashType::All.into(),
        )?;
        ty.ecdsa_hash_ty().map_err(|e| Error::Sighash(e.to_string()))
    }

    pub fn taproot_sighash_type(&self, input_index: usize, requested: Option<TapSighashType>) -> Result<TapSighashType> {
        let input = self.input(input_index)?;
        let ty = resolve_sighash_type(
            input_index,
            input.sighash_type,
            requested.map(PsbtSighashType::from),
            TapSighashType::Default.into(),
        )?;
        ty.taproot_hash_ty().map_err(|e| Error::Sighash(e.to_string()))
    }

    /// Hash an ECDSA signature on `input_index` must commit to.
    ///
    /// Fails with `SighashTypeMismatch` when the input fixes a different type
    /// than `sighash_type`.
    pub fn get_hash_for_sig(&self, input_index: usize, sighash_type: Option<EcdsaSighashType>) -> Result<SigHash> {
        let ty = self.ecdsa_sighash_type(input_index, sighash_type)?;
        self.ecdsa_sighash(input_index, ty)
    }

    fn ecdsa_sighash(&self, input_index: usize, sighash_type: EcdsaSighashType) -> Result<SigHash> {
        let input = &self.psbt.inputs[input_index];
        let script = self.cache.get_script_from_utxo(self.psbt, input_index)?;
        let mut sighash_cache = SighashCache::new(&self.psbt.unsigned_tx);
        let sighash_err = |e: &dyn std::fmt::Display| Error::Sighash(e.to_string());

        let hash = if script.is_taproot() {
            return Err(Error::UnsupportedScript {
                input_index,
                script_type: "p2tr input requires taproot signature hashes".into(),
            });
        } else if !script.is_segwit {
            if input.non_witness_utxo.is_none() {
                if !self.unsafe_sign_nonsegwit {
                    return Err(Error::MissingNonWitnessUtxo { input_index });
                }
                log::warn!(
                    "input {}: signing non-segwit input without non_witness_utxo",
                    input_index
                );
            }
            sighash_cache
                .legacy_signature_hash(input_index, &script.meaningful_script, sighash_type.to_u32())
                .map_err(|e| sighash_err(&e))?
                .to_byte_array()
        } else if script.input_type.script_type == ScriptType::P2wpkh {
            sighash_cache
                .p2wpkh_signature_hash(input_index, &script.meaningful_script, script.value, sighash_type)
                .map_err(|e| sighash_err(&e))?
                .to_byte_array()
        } else {
            sighash_cache
                .p2wsh_signature_hash(input_index, &script.meaningful_script, script.value, sighash_type)
                .map_err(|e| sighash_err(&e))?
                .to_byte_array()
        };

        Ok(SigHash {
            hash,
            script: script.meaningful_script,
            sighash_type,
        })
    }

    /// Hashes a Schnorr signature by `pubkey` can produce on `input_index`.
    ///
    /// The key path is included when `pubkey` is the output key and the input
    /// is not script-path-only. Every leaf containing `pubkey` is included,
    /// narrowed to `leaf_hash` when one is given.
    pub fn get_taproot_hashes_for_sig(
        &self,
        input_index: usize,
        pubkey: &[u8],
        leaf_hash: Option<TapLeafHash>,
        sighash_type: Option<TapSighashType>,
    ) -> Result<Vec<TaprootHash>> {
        let input = self.input(input_index)?;
        let ty = self.taproot_sighash_type(input_index, sighash_type)?;
        let script = self.cache.get_script_from_utxo(self.psbt, input_index)?;
        if !script.is_taproot() {
            return Err(Error::UnsupportedScript {
                input_index,
                script_type: script.input_type.to_string(),
            });
        }
        let prevouts = self.cache.prevouts(self.psbt)?;
        let x_only = XOnlyPublicKey::from_slice(x_only_bytes(pubkey))
            .map_err(|_| Error::KeyNotInInput { input_index })?;

        self.taproot_hashes(input_index, input, &script, &prevouts, x_only, leaf_hash, ty)
    }

    #[allow(clippy::too_many_arguments)]
    fn taproot_hashes(
        &self,
        input_index: usize,
        input: &Input,
        script: &PrevoutScript,
        prevouts: &[crate::bitcoin::TxOut],
        x_only: XOnlyPublicKey,
        leaf_hash: Option<TapLeafHash>,
        ty: TapSighashType,
    ) -> Result<Vec<TaprootHash>> {
        let mut sighash_cache = SighashCache::new(&self.psbt.unsigned_tx);
        let prevouts = Prevouts::All(prevouts);
        let mut hashes = Vec::new();

        let output_key = &script.script_pubkey.as_bytes()[2..34];
        if leaf_hash.is_none() && output_key == x_only.serialize() && !is_script_path_only(input) {
            let hash = sighash_cache
                .taproot_key_spend_signature_hash(input_index, &prevouts, ty)
                .map_err(|e| Error::Sighash(e.to_string()))?;
            hashes.push(TaprootHash {
                hash: hash.to_byte_array(),
                pubkey: x_only,
                leaf_hash: None,
                sighash_type: ty,
            });
        }

        for (leaf_script, version) in input.tap_scripts.values() {
            let leaf = TapLeafHash::from_script(leaf_script, *version);
            if leaf_hash.is_some_and(|wanted| wanted != leaf) {
                continue;
            }
            if !script_contains_pubkey(leaf_script, &x_only.serialize()) {
                continue;
            }
            let hash = sighash_cache
                .taproot_script_spend_signature_hash(input_index, &prevouts, leaf, ty)
                .map_err(|e| Error::Sighash(e.to_string()))?;
            hashes.push(TaprootHash {
                hash: hash.to_byte_array(),
                pubkey: x_only,
                leaf_hash: Some(leaf),
                sighash_type: ty,
            });
        }

        if hashes.is_empty() {
            return Err(Error::KeyNotInInput { input_index });
        }
        Ok(hashes)
    }

    /// Check every stored signature on `input_index`, or only those by `pubkey`.
    ///
    /// Each signature is checked against a hash recomputed with its own sighash type.
    pub fn validate_signatures_of_input<V: SignatureVerifier + ?Sized>(
        &self,
        input_index: usize,
        verifier: &V,
        pubkey: Option<&[u8]>,
    ) -> Result<bool> {
        let input = self.input(input_index)?;
        let script = self.cache.get_script_from_utxo(self.psbt, input_index)?;
        let mut checked = 0usize;
        let mut valid = true;

        if script.is_taproot() {
            let prevouts = self.cache.prevouts(self.psbt)?;
            let prevouts = Prevouts::All(&prevouts);
            let mut sighash_cache = SighashCache::new(&self.psbt.unsigned_tx);
            let wanted = pubkey.map(x_only_bytes);

            if let Some(sig) = &input.tap_key_sig {
                let output_key = &script.script_pubkey.as_bytes()[2..34];
                if wanted.map_or(true, |w| w == output_key) {
                    let hash = sighash_cache
                        .taproot_key_spend_signature_hash(input_index, &prevouts, sig.sighash_type)
                        .map_err(|e| Error::Sighash(e.to_string()))?;
                    checked += 1;
                    valid &= validate_signature(verifier, output_key, &hash.to_byte_array(), &sig.to_vec());
                }
            }
            for ((key, leaf), sig) in &input.tap_script_sigs {
                let key_bytes = key.serialize();
                if wanted.is_some_and(|w| w != key_bytes.as_slice()) {
                    continue;
                }
                let hash = sighash_cache
                    .taproot_script_spend_signature_hash(input_index, &prevouts, *leaf, sig.sighash_type)
                    .map_err(|e| Error::Sighash(e.to_string()))?;
                checked += 1;
                valid &= validate_signature(verifier, &key_bytes, &hash.to_byte_array(), &sig.to_vec());
            }
        } else {
            for (key, sig) in &input.partial_sigs {
                let key_bytes = key.to_bytes();
                if pubkey.is_some_and(|p| p != key_bytes.as_slice()) {
                    continue;
                }
                let sighash = self.ecdsa_sighash(input_index, sig.sighash_type)?;
                checked += 1;
                valid &= validate_signature(verifier, &key_bytes, &sighash.hash, &sig.to_vec());
            }
        }

        if checked == 0 {
            return Err(Error::NoSignature { input_index });
        }
        Ok(valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitcoin::psbt::PsbtSighashType;
    use crate::bitcoin::secp256k1::SecretKey;
    use crate::test_utils::{pubkey, secret_key, PsbtBuilder};

    fn sign(hash: &[u8; 32], seed: u8) -> secp256k1::ecdsa::Signature {
        let secp = Secp256k1::new();
        secp.sign_ecdsa(&secp256k1::Message::from_digest(*hash), &secret_key(seed))
    }

    #[test]
    fn test_validate_signature_with_injected_verifier() {
        struct Reject;
        impl SignatureVerifier for Reject {
            fn verify_ecdsa(&self, _: &PublicKey, _: &[u8; 32], _: &secp256k1::ecdsa::Signature) -> bool {
                false
            }
            fn verify_schnorr(&self, _: &XOnlyPublicKey, _: &[u8; 32], _: &secp256k1::schnorr::Signature) -> bool {
                false
            }
        }

        let hash = [7u8; 32];
        let sig = sign(&hash, 1).serialize_der();
        let key = pubkey(1).to_bytes();
        assert!(validate_signature(&Secp256k1Verifier::new(), &key, &hash, &sig));
        assert!(!validate_signature(&Reject, &key, &hash, &sig));
        assert!(!validate_signature(&Secp256k1Verifier::new(), &pubkey(2).to_bytes(), &hash, &sig));
        assert!(!validate_signature(&Secp256k1Verifier::new(), &key, &hash, &[0u8; 10]));
    }

    #[test]
    fn test_schnorr_validation() {
        let secp = Secp256k1::new();
        let keypair = secp256k1::Keypair::from_secret_key(&secp, &SecretKey::from_slice(&[3u8; 32]).unwrap());
        let hash = [9u8; 32];
        let sig = secp.sign_schnorr_no_aux_rand(&secp256k1::Message::from_digest(hash), &keypair);
        let (x_only, _) = keypair.x_only_public_key();
        assert!(validate_signature(
            &Secp256k1Verifier::new(),
            &x_only.serialize(),
            &hash,
            &sig.serialize()
        ));
    }

    #[test]
    fn test_hash_for_sig_sighash_mismatch() {
        let mut psbt = PsbtBuilder::new().p2wpkh_input(1, 10_000).output(5_000).build();
        psbt.inputs[0].sighash_type = Some(PsbtSighashType::from(EcdsaSighashType::None));
        let cache = TransactionCache::new();
        let engine = SignatureEngine::new(&psbt, &cache, false);

        assert!(matches!(
            engine.get_hash_for_sig(0, Some(EcdsaSighashType::All)),
            Err(Error::SighashTypeMismatch {
                input_index: 0,
                expected: 0x02,
                actual: 0x01
            })
        ));
        let hash = engine.get_hash_for_sig(0, None).unwrap();
        assert_eq!(hash.sighash_type, EcdsaSighashType::None);
    }

    #[test]
    fn test_hash_for_sig_p2wpkh_is_bip143() {
        let psbt = PsbtBuilder::new().p2wpkh_input(1, 10_000).output(5_000).build();
        let cache = TransactionCache::new();
        let engine = SignatureEngine::new(&psbt, &cache, false);
        let hash = engine.get_hash_for_sig(0, None).unwrap();

        let expected = SighashCache::new(&psbt.unsigned_tx)
            .p2wpkh_signature_hash(
                0,
                &psbt.inputs[0].witness_utxo.as_ref().unwrap().script_pubkey,
                crate::bitcoin::Amount::from_sat(10_000),
                EcdsaSighashType::All,
            )
            .unwrap();
        assert_eq!(hash.hash, expected.to_byte_array());
    }

    #[test]
    fn test_legacy_requires_non_witness_utxo() {
        let mut psbt = PsbtBuilder::new().p2pkh_input(1, 10_000).output(5_000).build();
        let full_tx = psbt.inputs[0].non_witness_utxo.take().unwrap();
        psbt.inputs[0].witness_utxo = Some(full_tx.output[0].clone());
        let cache = TransactionCache::new();

        let engine = SignatureEngine::new(&psbt, &cache, false);
        assert!(matches!(
            engine.get_hash_for_sig(0, None),
            Err(Error::MissingNonWitnessUtxo { input_index: 0 })
        ));
        let engine = SignatureEngine::new(&psbt, &cache, true);
        assert!(engine.get_hash_for_sig(0, None).is_ok());
    }

    #[test]
    fn test_validate_signatures_of_input() {
        let mut psbt = PsbtBuilder::new().p2wpkh_input(1, 10_000).output(5_000).build();
        let cache = TransactionCache::new();
        let hash = SignatureEngine::new(&psbt, &cache, false)
            .get_hash_for_sig(0, None)
            .unwrap();

        let engine = SignatureEngine::new(&psbt, &cache, false);
        assert!(matches!(
            engine.validate_signatures_of_input(0, &Secp256k1Verifier::new(), None),
            Err(Error::NoSignature { input_index: 0 })
        ));

        psbt.inputs[0].partial_sigs.insert(
            pubkey(1),
            ecdsa::Signature {
                signature: sign(&hash.hash, 1),
                sighash_type: EcdsaSighashType::All,
            },
        );
        let engine = SignatureEngine::new(&psbt, &cache, false);
        assert!(engine
            .validate_signatures_of_input(0, &Secp256k1Verifier::new(), None)
            .unwrap());

        // signature by the right key over the wrong message
        psbt.inputs[0].partial_sigs.insert(
            pubkey(1),
            ecdsa::Signature {
                signature: sign(&[1u8; 32], 1),
                sighash_type: EcdsaSighashType::All,
            },
        );
        let engine = SignatureEngine::new(&psbt, &cache, false);
        assert!(!engine
            .validate_signatures_of_input(0, &Secp256k1Verifier::new(), None)
            .unwrap());
    }
}
