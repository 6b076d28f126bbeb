// SPDX-License-Identifier: CC0-1.0

//! Computing the message each PSBT input must sign.
//!
//! The prevout's script class decides the hash algorithm: BIP143 for witness
//! v0 spends, the legacy algorithm for everything pre-segwit, BIP341 for
//! taproot. Collected hashes become [`SigningTask`]s for the pool; the pool's
//! results flow back into the PSBT through [`apply_signatures`].

use std::fmt;

use hashes::Hash;
use secp256k1::XOnlyPublicKey;

use crate::crypto::backend::EcBackend;
use crate::crypto::{ecdsa, taproot as taproot_sig};
use crate::pool::{BatchSigningResult, SignatureKind, SigningTask};
use crate::psbt::{Error, Input, Psbt, PsbtCache, PsbtSighashType};
use crate::script::{Script, ScriptBuf, ScriptClass};
use crate::sighash::{
    self, EcdsaSighashType, InvalidSighashTypeError, NonStandardSighashTypeError, Prevouts,
    TapSighashType,
};
use crate::taproot::{self, TapLeafHash};

/// Options controlling the signing flow.
#[derive(Clone, Debug)]
pub struct SignOptions {
    /// When set, any input whose sighash type is not in this list is rejected
    /// before a single hash is computed.
    pub allowed_sighash_types: Option<Vec<PsbtSighashType>>,
    /// Sign legacy inputs from the witness utxo alone, without the full
    /// previous transaction. Unsafe: the value being spent is unverifiable.
    pub allow_legacy_without_prev_tx: bool,
    /// Grind ECDSA nonces for low-R signatures (one byte smaller, the network
    /// standard since Bitcoin Core 0.17).
    pub grind_low_r: bool,
}

impl Default for SignOptions {
    fn default() -> Self {
        SignOptions {
            allowed_sighash_types: None,
            allow_legacy_without_prev_tx: false,
            grind_low_r: true,
        }
    }
}

/// One BIP341 hash an input wants signed.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TaprootSignRequest {
    /// The signing hash.
    pub sighash: [u8; 32],
    /// The leaf being satisfied, `None` for the key path.
    pub leaf_hash: Option<TapLeafHash>,
    /// The sighash type committed to.
    pub sighash_type: TapSighashType,
}

/// The script that actually encumbers an input, unwrapped from its P2SH and
/// P2WSH layers.
#[derive(Clone, Debug)]
pub(crate) struct ResolvedScript {
    /// The meaningful script.
    pub script: ScriptBuf,
    /// Class of the meaningful script.
    pub class: ScriptClass,
    /// Whether the input spends through the witness.
    pub segwit: bool,
    /// Whether a P2SH layer wraps the spend.
    pub p2sh: bool,
    /// Whether the meaningful script is a witness script (P2WSH inner).
    pub witness_script: bool,
}

/// Unwraps `script_pubkey` to the script an input really has to satisfy,
/// checking each wrapper layer's hash commitment along the way.
pub(crate) fn resolve_script(
    input: &Input,
    script_pubkey: &Script,
) -> Result<ResolvedScript, SignError> {
    match script_pubkey.classify() {
        ScriptClass::P2sh => {
            let redeem = input.redeem_script.as_ref().ok_or(SignError::MissingRedeemScript)?;
            let payload = &script_pubkey.as_bytes()[2..22];
            if redeem.as_script().script_hash().as_byte_array() != payload {
                return Err(SignError::InvalidRedeemScript);
            }
            if redeem.as_script().is_p2wsh() {
                let witness_script =
                    input.witness_script.as_ref().ok_or(SignError::MissingWitnessScript)?;
                let program = redeem.as_script().witness_program().expect("is_p2wsh checked");
                if witness_script.as_script().wscript_hash().as_byte_array() != program {
                    return Err(SignError::InvalidWitnessScript);
                }
                Ok(ResolvedScript {
                    script: witness_script.clone(),
                    class: witness_script.as_script().classify(),
                    segwit: true,
                    p2sh: true,
                    witness_script: true,
                })
            } else if redeem.as_script().is_p2wpkh() {
                Ok(ResolvedScript {
                    script: redeem.clone(),
                    class: ScriptClass::P2wpkh,
                    segwit: true,
                    p2sh: true,
                    witness_script: false,
                })
            } else {
                Ok(ResolvedScript {
                    script: redeem.clone(),
                    class: redeem.as_script().classify(),
                    segwit: false,
                    p2sh: true,
                    witness_script: false,
                })
            }
        }
        ScriptClass::P2wsh => {
            let witness_script =
                input.witness_script.as_ref().ok_or(SignError::MissingWitnessScript)?;
            let program = script_pubkey.witness_program().expect("is_p2wsh checked");
            if witness_script.as_script().wscript_hash().as_byte_array() != program {
                return Err(SignError::InvalidWitnessScript);
            }
            Ok(ResolvedScript {
                script: witness_script.clone(),
                class: witness_script.as_script().classify(),
                segwit: true,
                p2sh: false,
                witness_script: true,
            })
        }
        class @ (ScriptClass::P2wpkh | ScriptClass::P2tr) => Ok(ResolvedScript {
            script: script_pubkey.to_owned(),
            class,
            segwit: true,
            p2sh: false,
            witness_script: false,
        }),
        class => Ok(ResolvedScript {
            script: script_pubkey.to_owned(),
            class,
            segwit: false,
            p2sh: false,
            witness_script: false,
        }),
    }
}

fn check_sighash_allowed(
    sighash_type: PsbtSighashType,
    options: &SignOptions,
) -> Result<(), SignError> {
    if let Some(ref allowed) = options.allowed_sighash_types {
        if !allowed.contains(&sighash_type) {
            return Err(SignError::DisallowedSighashType(sighash_type));
        }
    }
    Ok(())
}

fn checked_input<'p>(psbt: &'p Psbt, input_index: usize) -> Result<&'p Input, SignError> {
    psbt.inputs.get(input_index).ok_or(SignError::IndexOutOfBounds {
        index: input_index,
        length: psbt.inputs.len(),
    })
}

/// Computes the ECDSA signing hash for the input at `input_index`.
///
/// Returns the hash and the sighash type it commits to.
pub fn ecdsa_signing_hash(
    psbt: &Psbt,
    cache: &mut PsbtCache,
    input_index: usize,
    options: &SignOptions,
) -> Result<([u8; 32], EcdsaSighashType), SignError> {
    let input = checked_input(psbt, input_index)?;
    let sighash_type = input.sighash_type.unwrap_or_else(|| EcdsaSighashType::All.into());
    check_sighash_allowed(sighash_type, options)?;
    let hash_ty = sighash_type.ecdsa_hash_ty().map_err(SignError::NonStandardSighashType)?;

    let (script_pubkey, value) = cache.script_and_amount(psbt, input_index)?;
    let resolved = resolve_script(input, script_pubkey.as_script())?;

    if resolved.class == ScriptClass::P2tr {
        return Err(SignError::WrongSigningAlgorithm);
    }

    let hash = if resolved.segwit {
        // BIP143 script code: the equivalent P2PKH script for P2WPKH, the
        // witness script itself for P2WSH spends.
        let script_code = if resolved.class == ScriptClass::P2wpkh {
            resolved
                .script
                .as_script()
                .p2wpkh_script_code()
                .expect("resolved class is P2wpkh")
        } else {
            resolved.script.clone()
        };
        cache
            .sighash_cache(psbt)
            .segwit_signature_hash(input_index, &script_code, value, hash_ty)?
            .to_byte_array()
    } else {
        // Legacy sighash: the value being spent is not committed to, so
        // trusting the witness utxo alone leaves the fee unverifiable.
        if input.non_witness_utxo.is_none() {
            if options.allow_legacy_without_prev_tx {
                log::warn!(
                    "signing legacy input {} without the full previous transaction; \
                     the spent value cannot be verified",
                    input_index
                );
            } else {
                return Err(SignError::MissingNonWitnessUtxo);
            }
        }
        cache
            .sighash_cache(psbt)
            .legacy_signature_hash(input_index, &resolved.script, hash_ty.to_u32())?
            .to_byte_array()
    };
    Ok((hash, hash_ty))
}

/// Computes every BIP341 hash the holder of `signer_key` can sign for the
/// input at `input_index`: one per known tapleaf whose script references the
/// key, plus the key-path hash when the key is the input's internal key.
///
/// For the key path the tweaked internal key is checked against the prevout's
/// witness program first; a mismatch is a hard consistency error.
pub fn taproot_signing_hashes<B: EcBackend>(
    psbt: &Psbt,
    cache: &mut PsbtCache,
    input_index: usize,
    backend: &B,
    signer_key: &XOnlyPublicKey,
    options: &SignOptions,
) -> Result<Vec<TaprootSignRequest>, SignError> {
    let input = checked_input(psbt, input_index)?;
    let sighash_type = input.sighash_type.unwrap_or_else(|| TapSighashType::Default.into());
    check_sighash_allowed(sighash_type, options)?;
    let hash_ty = sighash_type.taproot_hash_ty().map_err(SignError::InvalidSighashType)?;

    let prevouts_vec = cache.all_spend_utxos(psbt)?;
    let prevouts = Prevouts::All(&prevouts_vec);
    let signer_bytes = signer_key.serialize();

    let mut requests = Vec::new();
    for (_, leaf) in &input.tap_scripts {
        if leaf.script.find_subslice(&signer_bytes).is_none() {
            continue;
        }
        let leaf_hash = leaf.leaf_hash();
        let hash = cache
            .sighash_cache(psbt)
            .taproot_script_spend_signature_hash(input_index, &prevouts, leaf_hash, hash_ty)?;
        requests.push(TaprootSignRequest {
            sighash: hash.to_byte_array(),
            leaf_hash: Some(leaf_hash),
            sighash_type: hash_ty,
        });
    }

    if input.tap_internal_key.as_ref() == Some(signer_key) {
        let program: [u8; 32] = prevouts_vec[input_index]
            .script_pubkey
            .as_script()
            .witness_program()
            .and_then(|program| program.try_into().ok())
            .ok_or(SignError::OutputKeyMismatch)?;
        let tweaked = taproot::tweak_key(backend, &signer_bytes, input.tap_merkle_root)
            .ok_or(SignError::OutputKeyMismatch)?;
        if tweaked.x_only != program {
            return Err(SignError::OutputKeyMismatch);
        }
        let hash = cache
            .sighash_cache(psbt)
            .taproot_key_spend_signature_hash(input_index, &prevouts, hash_ty)?;
        requests.push(TaprootSignRequest {
            sighash: hash.to_byte_array(),
            leaf_hash: None,
            sighash_type: hash_ty,
        });
    }

    Ok(requests)
}

/// Collects the signing tasks the holder of `public_key` can perform with the
/// corresponding *untweaked* private key: ECDSA tasks for every non-taproot
/// input whose script references the key, and schnorr script-path tasks for
/// every matching tapleaf.
///
/// Taproot key-path spends need the tweaked private key and therefore a
/// separate batch; see [`key_path_task`].
pub fn collect_tasks<B: EcBackend>(
    psbt: &Psbt,
    cache: &mut PsbtCache,
    backend: &B,
    public_key: &[u8; 33],
    options: &SignOptions,
) -> Result<Vec<SigningTask>, SignError> {
    let x_only = XOnlyPublicKey::from_slice(&public_key[1..33])
        .map_err(|_| SignError::InvalidPublicKey)?;

    let mut tasks = Vec::new();
    let mut task_id = 0u64;
    for input_index in 0..psbt.inputs.len() {
        let (script_pubkey, _) = cache.script_and_amount(psbt, input_index)?;
        let input = &psbt.inputs[input_index];

        if script_pubkey.as_script().is_p2tr() {
            let requests = taproot_signing_hashes(
                psbt,
                cache,
                input_index,
                backend,
                &x_only,
                options,
            )?;
            for request in requests.into_iter().filter(|request| request.leaf_hash.is_some()) {
                tasks.push(SigningTask {
                    task_id,
                    input_index,
                    sighash: request.sighash,
                    public_key: x_only.serialize().to_vec(),
                    kind: SignatureKind::Schnorr,
                    sighash_type: request.sighash_type.into(),
                    leaf_hash: request.leaf_hash,
                });
                task_id += 1;
            }
            continue;
        }

        let resolved = resolve_script(input, script_pubkey.as_script())?;
        if !script_references_key(resolved.script.as_script(), resolved.class, public_key) {
            continue;
        }
        let (sighash, hash_ty) = ecdsa_signing_hash(psbt, cache, input_index, options)?;
        tasks.push(SigningTask {
            task_id,
            input_index,
            sighash,
            public_key: public_key.to_vec(),
            kind: SignatureKind::Ecdsa { low_r: options.grind_low_r },
            sighash_type: hash_ty.into(),
            leaf_hash: None,
        });
        task_id += 1;
    }
    Ok(tasks)
}

/// Builds the key-path signing task for a taproot input.
///
/// The returned task's public key is the tweaked output key; sign the batch
/// carrying it with the matching tweaked private key (see
/// [`crate::taproot::tweak_seckey`]).
pub fn key_path_task<B: EcBackend>(
    psbt: &Psbt,
    cache: &mut PsbtCache,
    input_index: usize,
    backend: &B,
    internal_key: &XOnlyPublicKey,
    options: &SignOptions,
) -> Result<SigningTask, SignError> {
    let request = taproot_signing_hashes(psbt, cache, input_index, backend, internal_key, options)?
        .into_iter()
        .find(|request| request.leaf_hash.is_none())
        .ok_or(SignError::KeyNotFound)?;
    let merkle_root = psbt.inputs[input_index].tap_merkle_root;
    let tweaked = taproot::tweak_key(backend, &internal_key.serialize(), merkle_root)
        .ok_or(SignError::OutputKeyMismatch)?;
    Ok(SigningTask {
        task_id: 0,
        input_index,
        sighash: request.sighash,
        public_key: tweaked.x_only.to_vec(),
        kind: SignatureKind::Schnorr,
        sighash_type: request.sighash_type.into(),
        leaf_hash: None,
    })
}

/// Whether a resolved script can be satisfied by the holder of `public_key`.
fn script_references_key(script: &Script, class: ScriptClass, public_key: &[u8; 33]) -> bool {
    match class {
        ScriptClass::P2pk | ScriptClass::Multisig | ScriptClass::NonStandard =>
            script.find_subslice(public_key).is_some(),
        ScriptClass::P2pkh | ScriptClass::P2wpkh => {
            let hash = crate::script::Script::from_bytes(public_key).script_hash();
            script.find_subslice(hash.as_ref()).is_some()
        }
        _ => false,
    }
}

/// Writes the signatures of a completed batch back into the PSBT.
///
/// `tasks` must be the batch's task list; outcomes are matched to tasks by
/// task id. Returns the number of signatures applied.
pub fn apply_signatures(
    psbt: &mut Psbt,
    tasks: &[SigningTask],
    result: &BatchSigningResult,
) -> usize {
    let mut applied = 0;
    for outcome in &result.outcomes {
        let signature = match outcome.result {
            Ok(ref signature) => signature,
            Err(_) => continue,
        };
        let task = match tasks.iter().find(|task| task.task_id == outcome.task_id) {
            Some(task) => task,
            None => continue,
        };
        let input = match psbt.inputs.get_mut(task.input_index) {
            Some(input) => input,
            None => continue,
        };
        match task.kind {
            SignatureKind::Ecdsa { .. } => {
                if let Ok(hash_ty) = task.sighash_type.ecdsa_hash_ty() {
                    input.partial_sigs.insert(
                        task.public_key.clone(),
                        ecdsa::Signature::new(signature.clone(), hash_ty),
                    );
                    applied += 1;
                }
            }
            SignatureKind::Schnorr => {
                let bytes: [u8; 64] = match signature.as_slice().try_into() {
                    Ok(bytes) => bytes,
                    Err(_) => continue,
                };
                let hash_ty = match task.sighash_type.taproot_hash_ty() {
                    Ok(hash_ty) => hash_ty,
                    Err(_) => continue,
                };
                let signature = taproot_sig::Signature { signature: bytes, sighash_type: hash_ty };
                match task.leaf_hash {
                    Some(leaf_hash) => {
                        let key = match XOnlyPublicKey::from_slice(&task.public_key) {
                            Ok(key) => key,
                            Err(_) => continue,
                        };
                        input.tap_script_sigs.insert((key, leaf_hash), signature);
                    }
                    None => input.tap_key_sig = Some(signature),
                }
                applied += 1;
            }
        }
    }
    applied
}

/// Errors encountered while computing signing hashes.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SignError {
    /// Input index out of bounds.
    IndexOutOfBounds {
        /// Requested index.
        index: usize,
        /// Number of inputs.
        length: usize,
    },
    /// The input's sighash type is not in the caller's allow-list.
    DisallowedSighashType(PsbtSighashType),
    /// The sighash type is not valid for ECDSA signing.
    NonStandardSighashType(NonStandardSighashTypeError),
    /// The sighash type is not valid for taproot signing.
    InvalidSighashType(InvalidSighashTypeError),
    /// P2SH input without a redeem script.
    MissingRedeemScript,
    /// The redeem script does not hash to the script pubkey's payload.
    InvalidRedeemScript,
    /// P2WSH input without a witness script.
    MissingWitnessScript,
    /// The witness script does not hash to the witness program.
    InvalidWitnessScript,
    /// Legacy input without the full previous transaction.
    MissingNonWitnessUtxo,
    /// Attempted ECDSA signing of a taproot input.
    WrongSigningAlgorithm,
    /// The tweaked internal key does not match the prevout's output key.
    OutputKeyMismatch,
    /// The supplied public key is not a valid curve point.
    InvalidPublicKey,
    /// The key cannot sign this input.
    KeyNotFound,
    /// Sighash computation failed.
    Sighash(sighash::Error),
    /// PSBT container error.
    Psbt(Error),
}

impl fmt::Display for SignError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use SignError::*;

        match *self {
            IndexOutOfBounds { index, length } =>
                write!(f, "input index {} out of bounds of PSBT inputs length {}", index, length),
            DisallowedSighashType(ty) => write!(f, "sighash type {} is not allowed", ty),
            NonStandardSighashType(ref e) => write!(f, "ECDSA signing: {}", e),
            InvalidSighashType(ref e) => write!(f, "taproot signing: {}", e),
            MissingRedeemScript => f.write_str("P2SH input is missing its redeem script"),
            InvalidRedeemScript =>
                f.write_str("redeem script does not match the script pubkey's hash"),
            MissingWitnessScript => f.write_str("P2WSH input is missing its witness script"),
            InvalidWitnessScript =>
                f.write_str("witness script does not match the witness program"),
            MissingNonWitnessUtxo => f.write_str(
                "legacy input is missing the full previous transaction; \
                 set allow_legacy_without_prev_tx to override",
            ),
            WrongSigningAlgorithm =>
                f.write_str("taproot inputs take schnorr signatures, not ECDSA"),
            OutputKeyMismatch =>
                f.write_str("tweaked internal key does not match the prevout's output key"),
            InvalidPublicKey => f.write_str("public key is not a valid curve point"),
            KeyNotFound => f.write_str("the key cannot sign this input"),
            Sighash(ref e) => write!(f, "sighash computation: {}", e),
            Psbt(ref e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SignError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use SignError::*;

        match *self {
            NonStandardSighashType(ref e) => Some(e),
            InvalidSighashType(ref e) => Some(e),
            Sighash(ref e) => Some(e),
            Psbt(ref e) => Some(e),
            _ => None,
        }
    }
}

impl From<sighash::Error> for SignError {
    fn from(e: sighash::Error) -> Self { SignError::Sighash(e) }
}

impl From<Error> for SignError {
    fn from(e: Error) -> Self { SignError::Psbt(e) }
}
