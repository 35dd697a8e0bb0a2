//! The signer role. Keys are supplied by the caller through [`Signer`] and
//! [`HdSigner`]; the document only computes hashes and stores signatures.

use zeroize::Zeroizing;

use crate::bitcoin::bip32::{DerivationPath, Fingerprint, Xpriv};
use crate::bitcoin::key::TapTweak;
use crate::bitcoin::psbt::PsbtSighashType;
use crate::bitcoin::secp256k1::{self, All, Keypair, Message, Secp256k1, SecretKey};
use crate::bitcoin::sighash::{EcdsaSighashType, TapSighashType};
use crate::bitcoin::taproot::{TapLeafHash, TapNodeHash};
use crate::bitcoin::{ecdsa, taproot, PublicKey, XOnlyPublicKey};
use crate::error::{Error, Result};
use crate::payments::script_contains_pubkey;
use crate::signing_pool::{ParallelSigningResult, SignatureType, SigningPool, SigningTask};

use super::cache::is_finalized;
use super::sighash::SignatureVerifier;
use super::Psbt;

pub trait Signer {
    fn public_key(&self) -> PublicKey;

    fn sign_ecdsa(&self, hash: &[u8; 32]) -> Result<secp256k1::ecdsa::Signature>;

    fn sign_schnorr(&self, hash: &[u8; 32]) -> Result<secp256k1::schnorr::Signature>;
}

/// A BIP32 key that can produce signers for the derivation paths found in a PSBT.
pub trait HdSigner {
    fn fingerprint(&self) -> Fingerprint;

    fn derive_signer(&self, path: &DerivationPath) -> Result<KeyPairSigner>;
}

/// Signs with a single secp256k1 key pair.
#[derive(Clone)]
pub struct KeyPairSigner {
    keypair: Keypair,
    secp: Secp256k1<All>,
}

impl std::fmt::Debug for KeyPairSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPairSigner")
            .field("public_key", &self.keypair.public_key())
            .finish_non_exhaustive()
    }
}

impl KeyPairSigner {
    pub fn new(secret_key: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        Self { keypair, secp }
    }

    pub fn from_slice(secret: &[u8]) -> Result<Self> {
        let secret_key = SecretKey::from_slice(secret).map_err(|e| Error::InvalidKey(e.to_string()))?;
        Ok(Self::new(secret_key))
    }

    /// Signer for the BIP341 output key of `self`'s key used as the internal key.
    pub fn tap_tweak(&self, merkle_root: Option<TapNodeHash>) -> Self {
        let keypair = self.keypair.tap_tweak(&self.secp, merkle_root).to_inner();
        Self {
            keypair,
            secp: self.secp.clone(),
        }
    }

    pub fn x_only_public_key(&self) -> XOnlyPublicKey {
        self.keypair.x_only_public_key().0
    }

    /// Private key bytes for handing to a signing pool. Wiped when dropped.
    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.keypair.secret_bytes())
    }
}

impl Signer for KeyPairSigner {
    fn public_key(&self) -> PublicKey {
        PublicKey::new(self.keypair.public_key())
    }

    fn sign_ecdsa(&self, hash: &[u8; 32]) -> Result<secp256k1::ecdsa::Signature> {
        let msg = Message::from_digest(*hash);
        Ok(self.secp.sign_ecdsa(&msg, &self.keypair.secret_key()))
    }

    fn sign_schnorr(&self, hash: &[u8; 32]) -> Result<secp256k1::schnorr::Signature> {
        let msg = Message::from_digest(*hash);
        Ok(self.secp.sign_schnorr_no_aux_rand(&msg, &self.keypair))
    }
}

impl HdSigner for Xpriv {
    fn fingerprint(&self) -> Fingerprint {
        Xpriv::fingerprint(self, &Secp256k1::new())
    }

    fn derive_signer(&self, path: &DerivationPath) -> Result<KeyPairSigner> {
        let derived = self
            .derive_priv(&Secp256k1::new(), path)
            .map_err(|e| Error::InvalidKey(format!("key derivation failed: {}", e)))?;
        Ok(KeyPairSigner::new(derived.private_key))
    }
}

fn check_allowed(input_index: usize, sighash_type: u32, allowed: &[u32]) -> Result<()> {
    if !allowed.contains(&sighash_type) {
        return Err(Error::SighashTypeNotAllowed {
            input_index,
            sighash_type,
        });
    }
    Ok(())
}

fn allowed_or(allowed: Option<&[PsbtSighashType]>, default: PsbtSighashType) -> Vec<u32> {
    match allowed {
        Some(types) => types.iter().map(|t| t.to_u32()).collect(),
        None => vec![default.to_u32()],
    }
}

impl Psbt {
    fn check_signable(&self, input_index: usize) -> Result<()> {
        if is_finalized(self.input(input_index)?) {
            return Err(Error::InputFinalized { input_index });
        }
        Ok(())
    }

    /// Sign one input with an ECDSA key, or dispatch to
    /// [`Psbt::sign_taproot_input`] when the input is taproot.
    ///
    /// `sighash_types` defaults to `[ALL]` for ECDSA and `[DEFAULT]` for taproot.
    pub fn sign_input<S: Signer + ?Sized>(
        &mut self,
        input_index: usize,
        signer: &S,
        sighash_types: Option<&[PsbtSighashType]>,
    ) -> Result<()> {
        self.check_signable(input_index)?;
        if self.is_taproot_input(input_index) {
            return self.sign_taproot_input(input_index, signer, None, sighash_types);
        }

        let allowed = allowed_or(sighash_types, EcdsaSighashType::All.into());
        let engine = self.signature_engine();
        let sighash = engine.get_hash_for_sig(input_index, None)?;
        check_allowed(input_index, sighash.sighash_type.to_u32(), &allowed)?;

        let pubkey = signer.public_key();
        if !script_contains_pubkey(&sighash.script, &pubkey.to_bytes()) {
            return Err(Error::KeyNotInInput { input_index });
        }

        let signature = signer.sign_ecdsa(&sighash.hash)?;
        self.inner.inputs[input_index].partial_sigs.insert(
            pubkey,
            ecdsa::Signature {
                signature,
                sighash_type: sighash.sighash_type,
            },
        );
        self.cache.invalidate();
        log::debug!("input {}: added ECDSA signature for {}", input_index, pubkey);
        Ok(())
    }

    /// Sign a taproot input through the key path and every leaf containing the
    /// signer's key, or only the leaf `leaf_hash` when given.
    pub fn sign_taproot_input<S: Signer + ?Sized>(
        &mut self,
        input_index: usize,
        signer: &S,
        leaf_hash: Option<TapLeafHash>,
        sighash_types: Option<&[PsbtSighashType]>,
    ) -> Result<()> {
        self.check_signable(input_index)?;
        let allowed = allowed_or(sighash_types, TapSighashType::Default.into());
        let pubkey = signer.public_key();
        let hashes = self.signature_engine().get_taproot_hashes_for_sig(
            input_index,
            &pubkey.to_bytes(),
            leaf_hash,
            None,
        )?;

        let mut signed = Vec::with_capacity(hashes.len());
        for hash in &hashes {
            check_allowed(input_index, hash.sighash_type as u32, &allowed)?;
            let signature = taproot::Signature {
                signature: signer.sign_schnorr(&hash.hash)?,
                sighash_type: hash.sighash_type,
            };
            signed.push((hash.pubkey, hash.leaf_hash, signature));
        }

        let input = &mut self.inner.inputs[input_index];
        for (x_only, leaf, signature) in signed {
            match leaf {
                Some(leaf) => {
                    input.tap_script_sigs.insert((x_only, leaf), signature);
                }
                None => input.tap_key_sig = Some(signature),
            }
        }
        self.cache.invalidate();
        log::debug!(
            "input {}: added {} Schnorr signature(s) for {}",
            input_index,
            hashes.len(),
            pubkey
        );
        Ok(())
    }

    /// Sign every input the signer has a key in. Fails only when nothing was signed.
    pub fn sign_all_inputs<S: Signer + ?Sized>(
        &mut self,
        signer: &S,
        sighash_types: Option<&[PsbtSighashType]>,
    ) -> Result<Vec<usize>> {
        let mut signed = Vec::new();
        for input_index in 0..self.input_count() {
            match self.sign_input(input_index, signer, sighash_types) {
                Ok(()) => signed.push(input_index),
                Err(e) => log::trace!("input {} not signed: {}", input_index, e),
            }
        }
        if signed.is_empty() {
            return Err(Error::NoInputsSigned);
        }
        Ok(signed)
    }

    /// Sign with every key `hd` derives along the input's derivation paths.
    ///
    /// A derived taproot internal key signs the key path after tweaking with
    /// the input's merkle root.
    pub fn sign_input_hd<H: HdSigner + ?Sized>(
        &mut self,
        input_index: usize,
        hd: &H,
        sighash_types: Option<&[PsbtSighashType]>,
    ) -> Result<()> {
        self.check_signable(input_index)?;
        let input = self.input(input_index)?;
        let fingerprint = hd.fingerprint();

        let mut ecdsa_signers = Vec::new();
        for (pubkey, (fp, path)) in &input.bip32_derivation {
            if *fp != fingerprint {
                continue;
            }
            let signer = hd.derive_signer(path)?;
            if signer.public_key().inner != *pubkey {
                return Err(Error::KeyNotInInput { input_index });
            }
            ecdsa_signers.push(signer);
        }

        let mut taproot_signers = Vec::new();
        for (x_only, (leaves, (fp, path))) in &input.tap_key_origins {
            if *fp != fingerprint {
                continue;
            }
            let signer = hd.derive_signer(path)?;
            if signer.x_only_public_key() != *x_only {
                return Err(Error::KeyNotInInput { input_index });
            }
            if input.tap_internal_key == Some(*x_only) {
                taproot_signers.push(signer.tap_tweak(input.tap_merkle_root));
            }
            if !leaves.is_empty() {
                taproot_signers.push(signer);
            }
        }

        let mut signed_any = false;
        let mut last_error = None;
        for signer in &ecdsa_signers {
            match self.sign_input(input_index, signer, sighash_types) {
                Ok(()) => signed_any = true,
                Err(e) => last_error = Some(e),
            }
        }
        for signer in &taproot_signers {
            match self.sign_taproot_input(input_index, signer, None, sighash_types) {
                Ok(()) => signed_any = true,
                Err(e) => last_error = Some(e),
            }
        }
        match (signed_any, last_error) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => Err(Error::KeyNotInInput { input_index }),
        }
    }

    pub fn sign_all_inputs_hd<H: HdSigner + ?Sized>(
        &mut self,
        hd: &H,
        sighash_types: Option<&[PsbtSighashType]>,
    ) -> Result<Vec<usize>> {
        let mut signed = Vec::new();
        for input_index in 0..self.input_count() {
            match self.sign_input_hd(input_index, hd, sighash_types) {
                Ok(()) => signed.push(input_index),
                Err(e) => log::trace!("input {} not signed: {}", input_index, e),
            }
        }
        if signed.is_empty() {
            return Err(Error::NoInputsSigned);
        }
        Ok(signed)
    }

    /// Hash every signable input for `signer` and sign the batch on `pool`.
    ///
    /// Signatures the pool produced are written back even when some tasks
    /// failed. An input whose sighash type is not allowed is left out of the
    /// batch and reported in [`ParallelSigningResult::skipped`]. Check
    /// [`ParallelSigningResult::success`].
    pub fn sign_all_inputs_parallel(
        &mut self,
        pool: &mut SigningPool,
        signer: &KeyPairSigner,
        sighash_types: Option<&[PsbtSighashType]>,
    ) -> Result<ParallelSigningResult> {
        let pubkey = signer.public_key();
        let mut tasks = Vec::new();
        let mut skipped = Vec::new();
        let engine = self.signature_engine();

        for input_index in 0..self.input_count() {
            if is_finalized(&self.inner.inputs[input_index]) {
                continue;
            }
            if self.is_taproot_input(input_index) {
                let allowed = allowed_or(sighash_types, TapSighashType::Default.into());
                let Ok(hashes) =
                    engine.get_taproot_hashes_for_sig(input_index, &pubkey.to_bytes(), None, None)
                else {
                    continue;
                };
                if let Some(Err(e)) = hashes
                    .iter()
                    .map(|hash| check_allowed(input_index, hash.sighash_type as u32, &allowed))
                    .find(Result::is_err)
                {
                    log::debug!("input {} skipped: {}", input_index, e);
                    skipped.push((input_index, e));
                    continue;
                }
                for hash in hashes {
                    tasks.push(SigningTask {
                        task_id: tasks.len() as u64,
                        hash: hash.hash,
                        public_key: hash.pubkey.serialize().to_vec(),
                        signature_type: SignatureType::Schnorr,
                        low_r: false,
                        input_index,
                        sighash_type: hash.sighash_type as u32,
                        leaf_hash: hash.leaf_hash,
                    });
                }
            } else {
                let allowed = allowed_or(sighash_types, EcdsaSighashType::All.into());
                let Ok(sighash) = engine.get_hash_for_sig(input_index, None) else {
                    continue;
                };
                if !script_contains_pubkey(&sighash.script, &pubkey.to_bytes()) {
                    continue;
                }
                if let Err(e) = check_allowed(input_index, sighash.sighash_type.to_u32(), &allowed) {
                    log::debug!("input {} skipped: {}", input_index, e);
                    skipped.push((input_index, e));
                    continue;
                }
                tasks.push(SigningTask {
                    task_id: tasks.len() as u64,
                    hash: sighash.hash,
                    public_key: pubkey.to_bytes(),
                    signature_type: SignatureType::Ecdsa,
                    low_r: true,
                    input_index,
                    sighash_type: sighash.sighash_type.to_u32(),
                    leaf_hash: None,
                });
            }
        }

        if tasks.is_empty() {
            return Err(Error::NoInputsSigned);
        }

        let secret = signer.secret_bytes();
        let mut result = pool.sign_batch(tasks, &secret)?;
        result.skipped = skipped;

        for task_result in &result.results {
            let input_index = task_result.input_index;
            let sig_err = |e: &dyn std::fmt::Display| Error::InvalidSignature {
                input_index,
                message: e.to_string(),
            };
            let input = &mut self.inner.inputs[input_index];
            match task_result.signature_type {
                SignatureType::Ecdsa => {
                    let signature = secp256k1::ecdsa::Signature::from_compact(&task_result.signature)
                        .map_err(|e| sig_err(&e))?;
                    let sighash_type = EcdsaSighashType::from_standard(task_result.sighash_type)
                        .map_err(|e| sig_err(&e))?;
                    input.partial_sigs.insert(
                        pubkey,
                        ecdsa::Signature {
                            signature,
                            sighash_type,
                        },
                    );
                }
                SignatureType::Schnorr => {
                    let signature = taproot::Signature {
                        signature: secp256k1::schnorr::Signature::from_slice(&task_result.signature)
                            .map_err(|e| sig_err(&e))?,
                        sighash_type: TapSighashType::from_consensus_u8(task_result.sighash_type as u8)
                            .map_err(|e| sig_err(&e))?,
                    };
                    let x_only = signer.x_only_public_key();
                    match task_result.leaf_hash {
                        Some(leaf) => {
                            input.tap_script_sigs.insert((x_only, leaf), signature);
                        }
                        None => input.tap_key_sig = Some(signature),
                    }
                }
            }
        }
        self.cache.invalidate();
        log::debug!(
            "parallel signing wrote {} signature(s), {} error(s)",
            result.results.len(),
            result.errors.len()
        );
        Ok(result)
    }

    /// Check the signatures on one input, or only those by `pubkey`.
    pub fn validate_signatures_of_input<V: SignatureVerifier + ?Sized>(
        &self,
        input_index: usize,
        verifier: &V,
        pubkey: Option<&[u8]>,
    ) -> Result<bool> {
        self.signature_engine()
            .validate_signatures_of_input(input_index, verifier, pubkey)
    }

    pub fn validate_signatures_of_all_inputs<V: SignatureVerifier + ?Sized>(&self, verifier: &V) -> Result<bool> {
        for input_index in 0..self.input_count() {
            if !self.validate_signatures_of_input(input_index, verifier, None)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
