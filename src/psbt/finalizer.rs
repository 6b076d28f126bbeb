// SPDX-License-Identifier: CC0-1.0

//! Assembling final scriptSigs and witnesses.
//!
//! Once enough partial signatures exist, each input's solution is laid out
//! according to its script class, wrapped in the P2SH/P2WSH layers the
//! prevout demands, and written into `final_script_sig`/
//! `final_script_witness`. All intermediate signing fields are cleared
//! afterwards.

use std::fmt;

use crate::crypto::ecdsa;
use crate::psbt::signer::{resolve_script, ResolvedScript, SignError};
use crate::psbt::{Input, Psbt, PsbtCache};
use crate::script::{Script, ScriptBuf, ScriptClass, OP_0};
use crate::taproot::TapLeafHash;
use crate::witness::Witness;

/// Checks whether an input has the signatures its script demands.
///
/// Pubkey, pubkeyhash and witness-pubkeyhash scripts need exactly one;
/// multisig needs exactly `m` signatures whose keys appear in the script
/// (matched by key, not position). Nonstandard scripts are optimistically
/// considered finalizable; [`finalize_input`] reports the precise failure.
pub fn can_finalize(input: &Input, script: &Script, class: ScriptClass) -> bool {
    match class {
        ScriptClass::P2pk | ScriptClass::P2pkh | ScriptClass::P2wpkh =>
            input.partial_sigs.len() == 1,
        ScriptClass::Multisig => match script.multisig_pubkeys() {
            Some((m, pubkeys)) => {
                let matching = pubkeys
                    .iter()
                    .filter(|pubkey| input.partial_sigs.contains_key(**pubkey))
                    .count();
                matching == m
            }
            None => false,
        },
        ScriptClass::NonStandard => true,
        _ => false,
    }
}

/// Finalizes every input of the PSBT.
pub fn finalize(psbt: &mut Psbt, cache: &mut PsbtCache) -> Result<(), FinalizeError> {
    for input_index in 0..psbt.inputs.len() {
        finalize_input(psbt, cache, input_index)?;
    }
    Ok(())
}

/// Finalizes the input at `input_index`, writing its final scriptSig and/or
/// witness and clearing the intermediate signing fields.
pub fn finalize_input(
    psbt: &mut Psbt,
    cache: &mut PsbtCache,
    input_index: usize,
) -> Result<(), FinalizeError> {
    let (script_pubkey, _) = cache.script_and_amount(psbt, input_index).map_err(SignError::Psbt)?;
    if script_pubkey.as_script().is_p2tr() {
        return finalize_taproot_input(psbt, input_index, None);
    }

    let input = &psbt.inputs[input_index];
    let resolved = resolve_script(input, script_pubkey.as_script())?;
    let signatures = matching_signatures(input, &resolved, input_index)?;
    let (final_script_sig, final_script_witness) = prepare_final_scripts(&resolved, &signatures)
        .ok_or(FinalizeError::CannotFinalize { index: input_index, class: resolved.class })?;

    let input = &mut psbt.inputs[input_index];
    input.final_script_sig = final_script_sig;
    input.final_script_witness = final_script_witness;
    clear_finalized_fields(input);
    Ok(())
}

/// Finalizes a taproot input.
///
/// A key-path signature wins when present. For script paths the satisfied
/// leaf is either `target_leaf` or, when `None`, the leaf with the shortest
/// control block that has at least one signature. Same-leaf signatures are
/// ordered by descending position of their key in the script, and the
/// witness is `signatures ‖ script ‖ control block`.
pub fn finalize_taproot_input(
    psbt: &mut Psbt,
    input_index: usize,
    target_leaf: Option<TapLeafHash>,
) -> Result<(), FinalizeError> {
    let length = psbt.inputs.len();
    let input = psbt
        .inputs
        .get_mut(input_index)
        .ok_or(FinalizeError::IndexOutOfBounds { index: input_index, length })?;

    let witness = if let Some(ref signature) = input.tap_key_sig {
        Witness::from_slice(&[signature.to_vec()])
    } else {
        let mut candidates: Vec<usize> = (0..input.tap_scripts.len())
            .filter(|&leaf_index| {
                let leaf_hash = input.tap_scripts[leaf_index].1.leaf_hash();
                input.tap_script_sigs.keys().any(|(_, hash)| *hash == leaf_hash)
            })
            .collect();
        if let Some(target) = target_leaf {
            candidates.retain(|&leaf_index| {
                input.tap_scripts[leaf_index].1.leaf_hash() == target
            });
        }
        let chosen = candidates
            .into_iter()
            .min_by_key(|&leaf_index| input.tap_scripts[leaf_index].0.size())
            .ok_or(FinalizeError::NoTaprootSolution { index: input_index })?;

        let (control_block, leaf) = &input.tap_scripts[chosen];
        let leaf_hash = leaf.leaf_hash();
        let mut signatures: Vec<(usize, Vec<u8>)> = input
            .tap_script_sigs
            .iter()
            .filter(|((_, hash), _)| *hash == leaf_hash)
            .filter_map(|((pubkey, _), signature)| {
                leaf.script
                    .find_subslice(&pubkey.serialize())
                    .map(|position| (position, signature.to_vec()))
            })
            .collect();
        signatures.sort_by(|a, b| b.0.cmp(&a.0));

        let mut elements: Vec<Vec<u8>> =
            signatures.into_iter().map(|(_, signature)| signature).collect();
        elements.push(leaf.script.as_bytes().to_vec());
        elements.push(control_block.serialize());
        Witness::from_slice(&elements)
    };

    input.final_script_witness = Some(witness);
    input.final_script_sig = None;
    clear_finalized_fields(input);
    Ok(())
}

/// Collects the signatures satisfying `resolved.script`, in script pubkey
/// order.
fn matching_signatures(
    input: &Input,
    resolved: &ResolvedScript,
    input_index: usize,
) -> Result<Vec<(Vec<u8>, ecdsa::Signature)>, FinalizeError> {
    match resolved.class {
        ScriptClass::P2pk | ScriptClass::P2pkh | ScriptClass::P2wpkh => {
            let got = input.partial_sigs.len();
            if got == 0 {
                return Err(FinalizeError::NotEnoughSignatures {
                    index: input_index,
                    got,
                    required: 1,
                });
            }
            if got > 1 {
                return Err(FinalizeError::TooManySignatures {
                    index: input_index,
                    got,
                    required: 1,
                });
            }
            let (pubkey, signature) =
                input.partial_sigs.iter().next().expect("checked len above");
            Ok(vec![(pubkey.clone(), signature.clone())])
        }
        ScriptClass::Multisig => {
            let (m, pubkeys) = resolved
                .script
                .as_script()
                .multisig_pubkeys()
                .expect("class Multisig implies the template parses");
            let matching: Vec<(Vec<u8>, ecdsa::Signature)> = pubkeys
                .iter()
                .filter_map(|pubkey| {
                    input
                        .partial_sigs
                        .get(*pubkey)
                        .map(|signature| (pubkey.to_vec(), signature.clone()))
                })
                .collect();
            if matching.len() > m {
                return Err(FinalizeError::TooManySignatures {
                    index: input_index,
                    got: matching.len(),
                    required: m,
                });
            }
            if matching.len() < m {
                return Err(FinalizeError::NotEnoughSignatures {
                    index: input_index,
                    got: matching.len(),
                    required: m,
                });
            }
            Ok(matching)
        }
        class => Err(FinalizeError::CannotFinalize { index: input_index, class }),
    }
}

/// Lays out the final scripts for a resolved non-taproot input.
///
/// Segwit spends always populate the witness; the scriptSig carries only the
/// P2SH redeem push when one applies. Returns `None` for classes with no
/// known solution layout.
fn prepare_final_scripts(
    resolved: &ResolvedScript,
    signatures: &[(Vec<u8>, ecdsa::Signature)],
) -> Option<(Option<ScriptBuf>, Option<Witness>)> {
    // The stack elements satisfying the meaningful script itself.
    let elements: Vec<Vec<u8>> = match resolved.class {
        ScriptClass::P2pk => vec![signatures[0].1.to_vec()],
        ScriptClass::P2pkh | ScriptClass::P2wpkh =>
            vec![signatures[0].1.to_vec(), signatures[0].0.clone()],
        ScriptClass::Multisig => {
            // CHECKMULTISIG pops one element more than it verifies.
            let mut elements = vec![Vec::new()];
            elements.extend(signatures.iter().map(|(_, signature)| signature.to_vec()));
            elements
        }
        _ => return None,
    };

    if resolved.witness_script {
        // P2WSH: solution plus the witness script on the stack; scriptSig is
        // the redeem push iff a P2SH layer wraps the program.
        let mut witness = Witness::from_slice(&elements);
        witness.push(resolved.script.as_bytes());
        let script_sig = if resolved.p2sh {
            let mut redeem = ScriptBuf::new();
            redeem.push_opcode(OP_0);
            redeem.push_slice(resolved.script.as_script().wscript_hash().as_ref());
            let mut script_sig = ScriptBuf::new();
            script_sig.push_slice(redeem.as_bytes());
            Some(script_sig)
        } else {
            None
        };
        Some((script_sig, Some(witness)))
    } else if resolved.class == ScriptClass::P2wpkh {
        let witness = Witness::from_slice(&elements);
        let script_sig = if resolved.p2sh {
            // Nested P2WPKH: scriptSig is a single push of the program.
            let mut script_sig = ScriptBuf::new();
            script_sig.push_slice(resolved.script.as_bytes());
            Some(script_sig)
        } else {
            None
        };
        Some((script_sig, Some(witness)))
    } else {
        // Legacy: everything lives in the scriptSig.
        let mut script_sig = ScriptBuf::new();
        for element in &elements {
            if element.is_empty() {
                script_sig.push_opcode(OP_0);
            } else {
                script_sig.push_slice(element);
            }
        }
        if resolved.p2sh {
            script_sig.push_slice(resolved.script.as_bytes());
        }
        Some((Some(script_sig), None))
    }
}

/// Removes the fields a finalized input no longer needs, per BIP174.
fn clear_finalized_fields(input: &mut Input) {
    input.partial_sigs.clear();
    input.sighash_type = None;
    input.redeem_script = None;
    input.witness_script = None;
    input.tap_key_sig = None;
    input.tap_script_sigs.clear();
    input.tap_scripts.clear();
    input.tap_internal_key = None;
    input.tap_merkle_root = None;
}

/// Errors encountered while finalizing an input.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum FinalizeError {
    /// Input index out of bounds.
    IndexOutOfBounds {
        /// Requested index.
        index: usize,
        /// Number of inputs.
        length: usize,
    },
    /// Fewer matching signatures than the script requires.
    NotEnoughSignatures {
        /// Input index.
        index: usize,
        /// Matching signatures present.
        got: usize,
        /// Signatures the script requires.
        required: usize,
    },
    /// More matching signatures than the script requires; surplus is an
    /// error, not a truncation.
    TooManySignatures {
        /// Input index.
        index: usize,
        /// Matching signatures present.
        got: usize,
        /// Signatures the script requires.
        required: usize,
    },
    /// No known solution layout for the script class.
    CannotFinalize {
        /// Input index.
        index: usize,
        /// The script class without a layout.
        class: ScriptClass,
    },
    /// Taproot input with neither a key-path signature nor a satisfied leaf.
    NoTaprootSolution {
        /// Input index.
        index: usize,
    },
    /// Script resolution failed.
    Script(SignError),
}

impl fmt::Display for FinalizeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use FinalizeError::*;

        match *self {
            IndexOutOfBounds { index, length } =>
                write!(f, "input index {} out of bounds of PSBT inputs length {}", index, length),
            NotEnoughSignatures { index, got, required } => write!(
                f,
                "input {} has {} matching signatures but its script requires {}",
                index, got, required
            ),
            TooManySignatures { index, got, required } => write!(
                f,
                "input {} has {} matching signatures, more than the {} its script requires",
                index, got, required
            ),
            CannotFinalize { index, class } =>
                write!(f, "can not finalize input {}, no solution for class {}", index, class),
            NoTaprootSolution { index } => write!(
                f,
                "taproot input {} has no key-path signature and no satisfiable leaf",
                index
            ),
            Script(ref e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for FinalizeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            FinalizeError::Script(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<SignError> for FinalizeError {
    fn from(e: SignError) -> Self { FinalizeError::Script(e) }
}

#[cfg(test)]
mod tests {
    use secp256k1::{Parity, XOnlyPublicKey};

    use super::*;
    use crate::crypto::backend::{EcBackend, LibsecpBackend};
    use crate::crypto::taproot as taproot_sig;
    use crate::script::OP_CHECKSIG;
    use crate::sighash::{EcdsaSighashType, TapSighashType};
    use crate::taproot::{self, ControlBlock, HashTree, TapLeaf, TapTree};
    use crate::transaction::{OutPoint, Transaction, TxIn, TxOut};

    fn dummy_der_sig(seed: u8) -> ecdsa::Signature {
        ecdsa::Signature::sighash_all(vec![0x30, 0x06, 0x02, 0x01, seed, 0x02, 0x01, 0x01])
    }

    fn pubkey(seed: u8) -> Vec<u8> {
        let backend = LibsecpBackend::new();
        backend.pubkey_from_seckey(&[seed; 32]).unwrap().to_vec()
    }

    fn multisig_script(m: u8, pubkeys: &[Vec<u8>]) -> ScriptBuf {
        let mut script = ScriptBuf::new();
        script.push_opcode(0x50 + m);
        for pubkey in pubkeys {
            script.push_slice(pubkey);
        }
        script.push_opcode(0x50 + pubkeys.len() as u8);
        script.push_opcode(0xae);
        script
    }

    fn psbt_with_witness_utxo(script_pubkey: ScriptBuf) -> Psbt {
        let tx = Transaction {
            version: 2,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint::default(),
                script_sig: ScriptBuf::new(),
                sequence: 0xFFFFFFFF,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: 40_000, script_pubkey: ScriptBuf::new() }],
        };
        let mut psbt = Psbt::from_unsigned_tx(tx).unwrap();
        psbt.inputs[0].witness_utxo = Some(TxOut { value: 50_000, script_pubkey });
        psbt
    }

    #[test]
    fn p2wpkh_finalizes_with_one_signature() {
        let pk = pubkey(1);
        let mut spk = ScriptBuf::new();
        spk.push_opcode(OP_0);
        spk.push_slice(Script::from_bytes(&pk).script_hash().as_ref());
        let mut psbt = psbt_with_witness_utxo(spk);
        psbt.inputs[0].partial_sigs.insert(pk.clone(), dummy_der_sig(1));

        let mut cache = PsbtCache::new(&psbt);
        finalize_input(&mut psbt, &mut cache, 0).unwrap();

        let witness = psbt.inputs[0].final_script_witness.as_ref().unwrap();
        assert_eq!(witness.len(), 2);
        assert_eq!(&witness[1], pk.as_slice());
        assert!(psbt.inputs[0].final_script_sig.is_none());
        assert!(psbt.inputs[0].partial_sigs.is_empty());
    }

    #[test]
    fn multisig_p2wsh_needs_exactly_m() {
        let pks = [pubkey(1), pubkey(2), pubkey(3)];
        let witness_script = multisig_script(2, &pks);
        let mut spk = ScriptBuf::new();
        spk.push_opcode(OP_0);
        spk.push_slice(witness_script.as_script().wscript_hash().as_ref());

        let mut psbt = psbt_with_witness_utxo(spk);
        psbt.inputs[0].witness_script = Some(witness_script.clone());

        // One signature: not enough.
        psbt.inputs[0].partial_sigs.insert(pks[0].clone(), dummy_der_sig(1));
        let mut cache = PsbtCache::new(&psbt);
        assert_eq!(
            finalize_input(&mut psbt, &mut cache, 0).unwrap_err(),
            FinalizeError::NotEnoughSignatures { index: 0, got: 1, required: 2 }
        );

        // Three signatures: a surplus is an error, not a truncation.
        psbt.inputs[0].partial_sigs.insert(pks[1].clone(), dummy_der_sig(2));
        psbt.inputs[0].partial_sigs.insert(pks[2].clone(), dummy_der_sig(3));
        assert_eq!(
            finalize_input(&mut psbt, &mut cache, 0).unwrap_err(),
            FinalizeError::TooManySignatures { index: 0, got: 3, required: 2 }
        );

        // Exactly two: finalized with the dummy element first and the
        // witness script last.
        psbt.inputs[0].partial_sigs.remove(&pks[2]);
        finalize_input(&mut psbt, &mut cache, 0).unwrap();
        let witness = psbt.inputs[0].final_script_witness.as_ref().unwrap();
        assert_eq!(witness.len(), 4);
        assert!(witness[0].is_empty());
        assert_eq!(&witness[3], witness_script.as_bytes());
    }

    #[test]
    fn signatures_keyed_not_positional() {
        // Signatures supplied for keys 2 and 3 of a 2-of-3: they must come
        // out in script order even though the map iterates by key bytes.
        let pks = [pubkey(1), pubkey(2), pubkey(3)];
        let witness_script = multisig_script(2, &pks);
        let mut spk = ScriptBuf::new();
        spk.push_opcode(OP_0);
        spk.push_slice(witness_script.as_script().wscript_hash().as_ref());

        let mut psbt = psbt_with_witness_utxo(spk);
        psbt.inputs[0].witness_script = Some(witness_script);
        psbt.inputs[0].partial_sigs.insert(pks[2].clone(), dummy_der_sig(3));
        psbt.inputs[0].partial_sigs.insert(pks[1].clone(), dummy_der_sig(2));

        let mut cache = PsbtCache::new(&psbt);
        finalize_input(&mut psbt, &mut cache, 0).unwrap();
        let witness = psbt.inputs[0].final_script_witness.as_ref().unwrap();
        assert_eq!(&witness[1], dummy_der_sig(2).to_vec().as_slice());
        assert_eq!(&witness[2], dummy_der_sig(3).to_vec().as_slice());
    }

    #[test]
    fn taproot_key_path_witness_is_single_signature() {
        let backend = LibsecpBackend::new();
        let internal = XOnlyPublicKey::from_slice(
            &backend.x_only_from_seckey(&[0x42; 32]).unwrap().x_only,
        )
        .unwrap();
        let tweaked = taproot::tweak_key(&backend, &internal.serialize(), None).unwrap();
        let mut spk = ScriptBuf::new();
        spk.push_opcode(0x51);
        spk.push_slice(&tweaked.x_only);

        let mut psbt = psbt_with_witness_utxo(spk);
        psbt.inputs[0].tap_internal_key = Some(internal);
        psbt.inputs[0].tap_key_sig = Some(taproot_sig::Signature {
            signature: [7u8; 64],
            sighash_type: TapSighashType::Default,
        });

        let mut cache = PsbtCache::new(&psbt);
        finalize_input(&mut psbt, &mut cache, 0).unwrap();
        let witness = psbt.inputs[0].final_script_witness.as_ref().unwrap();
        assert_eq!(witness.len(), 1);
        assert_eq!(witness[0].len(), 64);
        assert!(psbt.inputs[0].tap_internal_key.is_none());
    }

    #[test]
    fn taproot_script_path_orders_and_appends_control_block() {
        let backend = LibsecpBackend::new();
        let internal = XOnlyPublicKey::from_slice(
            &backend.x_only_from_seckey(&[0x42; 32]).unwrap().x_only,
        )
        .unwrap();
        let key_a =
            XOnlyPublicKey::from_slice(&backend.x_only_from_seckey(&[0x01; 32]).unwrap().x_only)
                .unwrap();
        let key_b =
            XOnlyPublicKey::from_slice(&backend.x_only_from_seckey(&[0x02; 32]).unwrap().x_only)
                .unwrap();

        // A 2-key script: <A> CHECKSIG... <B> CHECKSIG-ish layout is enough
        // for position ordering, script semantics are not checked here.
        let mut script = ScriptBuf::new();
        script.push_slice(&key_a.serialize());
        script.push_opcode(OP_CHECKSIG);
        script.push_slice(&key_b.serialize());
        script.push_opcode(OP_CHECKSIG);

        let leaf = TapLeaf::new(script);
        let tree = TapTree::Leaf(leaf.clone());
        let hash_tree = HashTree::from_tree(&tree).unwrap();
        let tweaked = taproot::tweak_key(
            &backend,
            &internal.serialize(),
            Some(hash_tree.hash()),
        )
        .unwrap();
        let parity = Parity::from_u8(tweaked.parity).unwrap();
        let control_block =
            ControlBlock::for_leaf(internal, parity, &leaf, &hash_tree).unwrap();

        let mut spk = ScriptBuf::new();
        spk.push_opcode(0x51);
        spk.push_slice(&tweaked.x_only);
        let mut psbt = psbt_with_witness_utxo(spk);

        let leaf_hash = leaf.leaf_hash();
        let sig = |seed: u8| taproot_sig::Signature {
            signature: [seed; 64],
            sighash_type: TapSighashType::Default,
        };
        psbt.inputs[0].tap_scripts = vec![(control_block.clone(), leaf.clone())];
        psbt.inputs[0].tap_script_sigs.insert((key_a, leaf_hash), sig(0xAA));
        psbt.inputs[0].tap_script_sigs.insert((key_b, leaf_hash), sig(0xBB));

        let mut cache = PsbtCache::new(&psbt);
        finalize_input(&mut psbt, &mut cache, 0).unwrap();
        let witness = psbt.inputs[0].final_script_witness.as_ref().unwrap();
        assert_eq!(witness.len(), 4);
        // Descending key position: B's signature (later in script) first.
        assert_eq!(witness[0][0], 0xBB);
        assert_eq!(witness[1][0], 0xAA);
        assert_eq!(&witness[2], leaf.script.as_bytes());
        assert_eq!(&witness[3], control_block.serialize().as_slice());
    }

    #[test]
    fn p2pkh_finalizes_into_script_sig_only() {
        let pk = pubkey(1);
        let mut spk = ScriptBuf::new();
        spk.push_opcode(0x76);
        spk.push_opcode(0xa9);
        spk.push_slice(Script::from_bytes(&pk).script_hash().as_ref());
        spk.push_opcode(0x88);
        spk.push_opcode(0xac);

        let mut psbt = psbt_with_witness_utxo(spk);
        psbt.inputs[0].partial_sigs.insert(pk.clone(), dummy_der_sig(1));
        let mut cache = PsbtCache::new(&psbt);
        finalize_input(&mut psbt, &mut cache, 0).unwrap();

        assert!(psbt.inputs[0].final_script_witness.is_none());
        let script_sig = psbt.inputs[0].final_script_sig.as_ref().unwrap();
        // <sig> <pubkey> as two pushes.
        let sig_push = dummy_der_sig(1).to_vec();
        assert_eq!(script_sig.as_bytes()[0] as usize, sig_push.len());
        assert!(script_sig.as_script().find_subslice(&pk).is_some());

        let ecdsa_ty = EcdsaSighashType::All;
        assert_eq!(sig_push.last().copied().unwrap(), ecdsa_ty as u8);
    }

    #[test]
    fn nonstandard_is_optimistic_until_layout() {
        let script = ScriptBuf::from_bytes(vec![0x51, 0x51]);
        let input = Input::default();
        assert!(can_finalize(&input, script.as_script(), ScriptClass::NonStandard));

        let mut psbt = psbt_with_witness_utxo(script);
        let mut cache = PsbtCache::new(&psbt);
        assert!(matches!(
            finalize_input(&mut psbt, &mut cache, 0).unwrap_err(),
            FinalizeError::CannotFinalize { index: 0, class: ScriptClass::NonStandard }
        ));
    }
}
