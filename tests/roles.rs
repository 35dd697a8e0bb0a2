//! The BIP174 roles end to end: create, update, sign (directly and through the
//! signing pool), combine, finalize, extract.

use utxo_psbt::bitcoin::hashes::Hash;
use utxo_psbt::bitcoin::key::TweakedPublicKey;
use utxo_psbt::bitcoin::secp256k1::{Secp256k1, SecretKey};
use utxo_psbt::bitcoin::{Amount, OutPoint, PublicKey, ScriptBuf, TxOut, Txid, Witness};
use utxo_psbt::payments::encode_multisig;
use utxo_psbt::psbt::{FinalScripts, InputSpec, KeyPairSigner, OutputSpec, Secp256k1Verifier};
use utxo_psbt::{Error, ErrorKind, PoolConfig, Psbt, PsbtOpts, SigningPool};

fn secret(seed: u8) -> SecretKey {
    SecretKey::from_slice(&[seed; 32]).unwrap()
}

fn pubkey(seed: u8) -> PublicKey {
    PublicKey::new(secret(seed).public_key(&Secp256k1::new()))
}

fn signer(seed: u8) -> KeyPairSigner {
    KeyPairSigner::new(secret(seed))
}

fn p2wpkh(seed: u8) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&pubkey(seed).wpubkey_hash().unwrap())
}

fn outpoint(n: u8) -> OutPoint {
    OutPoint::new(Txid::from_byte_array([n; 32]), 0)
}

fn witness_input(n: u8, script_pubkey: ScriptBuf, value: u64) -> InputSpec {
    let mut spec = InputSpec::new(outpoint(n));
    spec.update.witness_utxo = Some(TxOut {
        value: Amount::from_sat(value),
        script_pubkey,
    });
    spec
}

#[test]
fn multisig_and_single_key_flow() {
    let multisig = encode_multisig(2, &[pubkey(2), pubkey(3), pubkey(4)]).unwrap();

    // creator and updater
    let mut psbt = Psbt::new(PsbtOpts::default());
    psbt.add_input(witness_input(1, p2wpkh(1), 40_000)).unwrap();
    let mut multisig_input = witness_input(2, multisig.to_p2wsh(), 60_000);
    multisig_input.update.witness_script = Some(multisig.clone());
    psbt.add_input(multisig_input).unwrap();
    psbt.add_output(OutputSpec::script(p2wpkh(9), Amount::from_sat(99_000)))
        .unwrap();
    assert_eq!(psbt.fee().unwrap(), Amount::from_sat(1_000));

    // two signers working on copies of the serialized document
    let encoded = psbt.to_base64();
    let mut first = Psbt::from_base64(&encoded, PsbtOpts::default()).unwrap();
    let mut second = Psbt::from_base64(&encoded, PsbtOpts::default()).unwrap();
    assert_eq!(first.sign_all_inputs(&signer(1), None).unwrap(), vec![0]);
    first.sign_input(1, &signer(4), None).unwrap();
    second.sign_input(1, &signer(2), None).unwrap();

    // combiner
    first.combine([&second]).unwrap();
    assert_eq!(first.input(1).unwrap().partial_sigs.len(), 2);
    assert!(first
        .validate_signatures_of_all_inputs(&Secp256k1Verifier::new())
        .unwrap());

    // finalizer and extractor
    first.finalize_all_inputs().unwrap();
    assert!(first.is_finalized());
    let tx = first.extract_transaction(false).unwrap();
    assert_eq!(tx.input[0].witness.len(), 2);
    assert_eq!(tx.input[1].witness.len(), 4);
    assert_eq!(tx.input[1].witness.last().unwrap(), multisig.as_bytes());

    let sig2 = second.input(1).unwrap().partial_sigs[&pubkey(2)].to_vec();
    assert_eq!(tx.input[1].witness.nth(1).unwrap(), sig2.as_slice());
}

#[test]
fn structural_edits_refused_after_finalize() {
    let mut psbt = Psbt::new(PsbtOpts::default());
    psbt.add_input(witness_input(1, p2wpkh(1), 10_000)).unwrap();
    psbt.add_output(OutputSpec::script(p2wpkh(9), Amount::from_sat(9_000)))
        .unwrap();
    psbt.sign_input(0, &signer(1), None).unwrap();
    psbt.finalize_input(0).unwrap();

    let err = psbt.finalize_input(0).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);
    let err = psbt.set_locktime(500_000).unwrap_err();
    assert!(matches!(err, Error::SignaturesExist { .. }));

    let restored = Psbt::from_bytes(&psbt.to_bytes(), PsbtOpts::default()).unwrap();
    assert_eq!(restored.to_bytes(), psbt.to_bytes());
    assert!(restored.is_input_finalized(0).unwrap());
}

/// A one-input document finalized with a fixed-size witness, so its vsize
/// does not depend on signature encoding.
fn fixed_size_document(input_value: u64, opts: PsbtOpts) -> Psbt {
    let mut psbt = Psbt::new(opts);
    psbt.add_input(witness_input(1, p2wpkh(1), input_value)).unwrap();
    psbt.add_output(OutputSpec::script(p2wpkh(9), Amount::from_sat(10_000)))
        .unwrap();
    psbt.finalize_input_with(0, |_, _, _| {
        Ok(FinalScripts {
            script_sig: None,
            witness: Some(Witness::from_slice(&[vec![0x30; 72], pubkey(1).to_bytes()])),
        })
    })
    .unwrap();
    psbt
}

#[test]
fn fee_rate_limit_on_extract() {
    let vsize = fixed_size_document(20_000, PsbtOpts::default())
        .extract_transaction(true)
        .unwrap()
        .vsize() as u64;

    let value = 10_000 + 6_000 * vsize;
    let psbt = fixed_size_document(value, PsbtOpts::default());
    assert_eq!(psbt.fee_rate().unwrap(), 6_000);
    match psbt.extract_transaction(false) {
        Err(Error::FeeTooHigh {
            fee_rate,
            max_fee_rate,
        }) => {
            assert_eq!(fee_rate, 6_000);
            assert_eq!(max_fee_rate, 5_000);
        }
        other => panic!("expected FeeTooHigh, got {:?}", other),
    }
    assert!(psbt.extract_transaction(true).is_ok());

    let relaxed = PsbtOpts {
        maximum_fee_rate: 10_000,
        ..Default::default()
    };
    assert!(fixed_size_document(value, relaxed)
        .extract_transaction(false)
        .is_ok());
}

#[test]
fn parallel_signing_flow() {
    let key = signer(5);
    let taproot_key = TweakedPublicKey::dangerous_assume_tweaked(key.x_only_public_key());

    let mut psbt = Psbt::new(PsbtOpts::default());
    for n in 1..=3 {
        psbt.add_input(witness_input(n, p2wpkh(5), 10_000)).unwrap();
    }
    psbt.add_input(witness_input(4, ScriptBuf::new_p2tr_tweaked(taproot_key), 10_000))
        .unwrap();
    psbt.add_input(witness_input(5, p2wpkh(6), 10_000)).unwrap();
    psbt.add_output(OutputSpec::script(p2wpkh(9), Amount::from_sat(45_000)))
        .unwrap();

    let mut pool = SigningPool::acquire(PoolConfig {
        num_workers: 2,
        ..Default::default()
    })
    .unwrap();
    let result = psbt.sign_all_inputs_parallel(&mut pool, &key, None).unwrap();
    assert!(result.success());
    // the last input belongs to another key and is not part of the batch
    assert_eq!(result.results.len(), 4);

    for index in 0..3 {
        assert!(psbt.input(index).unwrap().partial_sigs.contains_key(&pubkey(5)));
    }
    assert!(psbt.input(3).unwrap().tap_key_sig.is_some());
    assert!(psbt.input(4).unwrap().partial_sigs.is_empty());
    for index in 0..4 {
        assert!(psbt
            .validate_signatures_of_input(index, &Secp256k1Verifier::new(), None)
            .unwrap());
    }

    psbt.sign_input(4, &signer(6), None).unwrap();
    psbt.finalize_all_inputs().unwrap();
    let tx = psbt.extract_transaction(false).unwrap();
    assert_eq!(tx.input[3].witness.len(), 1);

    // nothing left to sign once every input is final
    assert!(matches!(
        psbt.sign_all_inputs_parallel(&mut pool, &key, None),
        Err(Error::NoInputsSigned)
    ));
    pool.shutdown();
    assert!(pool.is_shut_down());
}
