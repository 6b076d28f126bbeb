// SPDX-License-Identifier: CC0-1.0

//! End-to-end signing flow: collect tasks from a PSBT, sign them through a
//! pool, apply the signatures, finalize and extract the transaction.

use psbt_signer::psbt::{
    apply_signatures, collect_tasks, finalize, key_path_task, SignOptions,
};
use psbt_signer::taproot::tweak_seckey;
use psbt_signer::{
    taproot, EcBackend, LibsecpBackend, OutPoint, Psbt, PsbtCache, Script, ScriptBuf,
    SequentialSigner, SigningPool, Transaction, TxIn, TxOut, Witness, WorkerPool,
};
use secp256k1::XOnlyPublicKey;

const ECDSA_SK: [u8; 32] = [0x42; 32];
const TAPROOT_SK: [u8; 32] = [0x55; 32];

fn p2wpkh_spk(backend: &LibsecpBackend, seckey: &[u8; 32]) -> ScriptBuf {
    let public_key = backend.pubkey_from_seckey(seckey).unwrap();
    let hash = Script::from_bytes(&public_key).script_hash();
    let mut spk = ScriptBuf::new();
    spk.push_opcode(0x00);
    spk.push_slice(hash.as_ref());
    spk
}

fn p2tr_spk(backend: &LibsecpBackend, seckey: &[u8; 32]) -> (ScriptBuf, XOnlyPublicKey, [u8; 32]) {
    let internal_bytes = backend.x_only_from_seckey(seckey).unwrap().x_only;
    let internal = XOnlyPublicKey::from_slice(&internal_bytes).unwrap();
    let tweaked = taproot::tweak_key(backend, &internal_bytes, None).unwrap();
    let mut spk = ScriptBuf::new();
    spk.push_opcode(0x51);
    spk.push_slice(&tweaked.x_only);
    (spk, internal, tweaked.x_only)
}

/// A two-input PSBT: input 0 spends a P2WPKH output, input 1 a taproot
/// key-path output with no script tree.
fn two_input_psbt(backend: &LibsecpBackend) -> (Psbt, XOnlyPublicKey, [u8; 32]) {
    let tx = Transaction {
        version: 2,
        lock_time: 0,
        input: vec![
            TxIn {
                previous_output: OutPoint::default(),
                script_sig: ScriptBuf::new(),
                sequence: 0xFFFFFFFF,
                witness: Witness::new(),
            },
            TxIn {
                previous_output: OutPoint { vout: 1, ..OutPoint::null() },
                script_sig: ScriptBuf::new(),
                sequence: 0xFFFFFFFF,
                witness: Witness::new(),
            },
        ],
        output: vec![TxOut {
            value: 100_000,
            script_pubkey: ScriptBuf::from_hex("001416e1ae70ff0fa102905d4af297f6912bda6cce19")
                .unwrap(),
        }],
    };
    let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
    psbt.inputs[0].witness_utxo =
        Some(TxOut { value: 50_000, script_pubkey: p2wpkh_spk(backend, &ECDSA_SK) });
    let (spk, internal, output_key) = p2tr_spk(backend, &TAPROOT_SK);
    psbt.inputs[1].witness_utxo = Some(TxOut { value: 60_000, script_pubkey: spk });
    psbt.inputs[1].tap_internal_key = Some(internal);
    (psbt, internal, output_key)
}

#[test]
fn sign_finalize_extract() {
    let backend = LibsecpBackend::new();
    let (mut psbt, internal, output_key) = two_input_psbt(&backend);
    let mut cache = PsbtCache::new(&psbt);
    let options = SignOptions::default();

    // The ECDSA leg, signed sequentially with the raw key.
    let public_key = backend.pubkey_from_seckey(&ECDSA_SK).unwrap();
    let ecdsa_tasks =
        collect_tasks(&psbt, &mut cache, &backend, &public_key, &options).unwrap();
    assert_eq!(ecdsa_tasks.len(), 1);
    assert_eq!(ecdsa_tasks[0].input_index, 0);

    let mut signer = SequentialSigner::new();
    let mut key = ECDSA_SK;
    let result = signer.sign_batch(&ecdsa_tasks, &mut key).unwrap();
    assert!(result.success);
    assert_eq!(key, [0; 32]);
    assert_eq!(apply_signatures(&mut psbt, &ecdsa_tasks, &result), 1);

    // The taproot key-path leg needs the tweaked key, signed as its own
    // batch through the worker pool.
    let tap_task =
        key_path_task(&psbt, &mut cache, 1, &backend, &internal, &options).unwrap();
    assert_eq!(tap_task.public_key, output_key.to_vec());

    let mut pool = WorkerPool::new();
    let mut tweaked_key = tweak_seckey(&backend, &TAPROOT_SK, None).unwrap();
    let tap_tasks = vec![tap_task];
    let result = pool.sign_batch(&tap_tasks, &mut tweaked_key).unwrap();
    assert!(result.success);
    assert_eq!(tweaked_key, [0; 32]);

    // The pool's schnorr signature verifies against the tweaked output key.
    let sig: [u8; 64] = result.signatures[&1].as_slice().try_into().unwrap();
    assert!(backend.verify_schnorr(&sig, &tap_tasks[0].sighash, &output_key));
    assert_eq!(apply_signatures(&mut psbt, &tap_tasks, &result), 1);
    assert!(psbt.inputs[1].tap_key_sig.is_some());

    // Finalize, check fees, extract.
    finalize(&mut psbt, &mut cache).unwrap();
    let fee = cache.fee(&psbt).unwrap();
    assert_eq!(fee, 10_000);
    let fee_rate = cache.fee_rate(&psbt).unwrap();
    assert!(fee_rate > 0);
    cache.check_fees(&psbt, fee_rate + 1).unwrap();
    assert!(cache.check_fees(&psbt, fee_rate).is_err());

    let tx = psbt.extract_tx().unwrap();
    assert_eq!(tx.input[0].witness.len(), 2); // signature, pubkey
    assert_eq!(tx.input[1].witness.len(), 1); // 64-byte key-path signature
    assert_eq!(tx.input[1].witness[0].len(), 64);
    assert!(tx.input[0].script_sig.is_empty());
    assert!(tx.input[1].script_sig.is_empty());
}

#[test]
fn pool_and_sequential_agree_on_the_contract() {
    let backend = LibsecpBackend::new();
    let (psbt, _, _) = two_input_psbt(&backend);
    let mut cache = PsbtCache::new(&psbt);
    let public_key = backend.pubkey_from_seckey(&ECDSA_SK).unwrap();
    let tasks =
        collect_tasks(&psbt, &mut cache, &backend, &public_key, &SignOptions::default()).unwrap();

    let mut sequential = SequentialSigner::new();
    let mut pool = WorkerPool::new();
    let mut key_a = ECDSA_SK;
    let mut key_b = ECDSA_SK;
    let a = sequential.sign_batch(&tasks, &mut key_a).unwrap();
    let b = pool.sign_batch(&tasks, &mut key_b).unwrap();

    assert!(a.success && b.success);
    assert_eq!(
        a.signatures.keys().collect::<Vec<_>>(),
        b.signatures.keys().collect::<Vec<_>>()
    );
    // Low-R grinding is deterministic, so the signatures match bit for bit.
    assert_eq!(a.signatures, b.signatures);
    assert_eq!(key_a, [0; 32]);
    assert_eq!(key_b, [0; 32]);
}
