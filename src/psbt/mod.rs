// SPDX-License-Identifier: CC0-1.0

//! Partially Signed Bitcoin Transactions.
//!
//! The in-memory BIP174/BIP371 field subset the signing pipeline consumes,
//! together with the per-PSBT cache, the signer (sighash selection per script
//! class) and the finalizer (witness/scriptSig assembly).

use std::collections::BTreeMap;
use std::fmt;

use secp256k1::XOnlyPublicKey;

use crate::crypto::{ecdsa, taproot as taproot_sig};
use crate::script::ScriptBuf;
use crate::sighash::{
    EcdsaSighashType, InvalidSighashTypeError, NonStandardSighashTypeError, TapSighashType,
};
use crate::taproot::{ControlBlock, TapLeaf, TapLeafHash, TapNodeHash};
use crate::transaction::{Transaction, TxOut};
use crate::witness::Witness;

mod cache;
mod finalizer;
mod signer;

pub use self::cache::{Invalidate, PsbtCache};
pub use self::finalizer::{
    can_finalize, finalize, finalize_input, finalize_taproot_input, FinalizeError,
};
pub use self::signer::{
    apply_signatures, collect_tasks, ecdsa_signing_hash, key_path_task, taproot_signing_hashes,
    SignError, SignOptions, TaprootSignRequest,
};

/// A Partially Signed Transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Psbt {
    /// The unsigned transaction, scriptSigs and witnesses for each input must
    /// be empty.
    pub unsigned_tx: Transaction,
    /// The corresponding key-value map for each input in the unsigned
    /// transaction.
    pub inputs: Vec<Input>,
    /// The corresponding key-value map for each output in the unsigned
    /// transaction.
    pub outputs: Vec<Output>,
}

/// A key-value map for an input of the corresponding index in the unsigned
/// transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Input {
    /// The non-witness transaction this input spends from. Should only be
    /// `Some` for inputs which spend non-segwit outputs or if it is unknown
    /// whether an input spends a segwit output.
    pub non_witness_utxo: Option<Transaction>,
    /// The transaction output this input spends from. Should only be `Some`
    /// for inputs which spend segwit outputs, including P2SH embedded ones.
    pub witness_utxo: Option<TxOut>,
    /// A map from serialized public keys needed to sign this input to their
    /// corresponding partial signatures.
    pub partial_sigs: BTreeMap<Vec<u8>, ecdsa::Signature>,
    /// The sighash type to be used for this input. Signatures for this input
    /// must use the sighash type.
    pub sighash_type: Option<PsbtSighashType>,
    /// The redeem script for this input.
    pub redeem_script: Option<ScriptBuf>,
    /// The witness script for this input.
    pub witness_script: Option<ScriptBuf>,
    /// The finalized, fully-constructed scriptSig with signatures and any
    /// other scripts necessary for this input to pass validation.
    pub final_script_sig: Option<ScriptBuf>,
    /// The finalized, fully-constructed scriptWitness with signatures and any
    /// other scripts necessary for this input to pass validation.
    pub final_script_witness: Option<Witness>,
    /// Serialized taproot signature with sighash type for key spend.
    pub tap_key_sig: Option<taproot_sig::Signature>,
    /// Map of (x-only pubkey, leaf hash) to signature.
    pub tap_script_sigs: BTreeMap<(XOnlyPublicKey, TapLeafHash), taproot_sig::Signature>,
    /// The tapscript leaves this input may be spent through, each with the
    /// control block proving its tree membership.
    pub tap_scripts: Vec<(ControlBlock, TapLeaf)>,
    /// Taproot internal key.
    pub tap_internal_key: Option<XOnlyPublicKey>,
    /// Taproot merkle root hash.
    pub tap_merkle_root: Option<TapNodeHash>,
}

/// A key-value map for an output of the corresponding index in the unsigned
/// transaction.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Output {
    /// The redeem script for this output.
    pub redeem_script: Option<ScriptBuf>,
    /// The witness script for this output.
    pub witness_script: Option<ScriptBuf>,
    /// The internal pubkey.
    pub tap_internal_key: Option<XOnlyPublicKey>,
}

impl Psbt {
    /// Constructs a PSBT from an unsigned transaction.
    ///
    /// # Errors
    ///
    /// If transactions is not unsigned.
    pub fn from_unsigned_tx(tx: Transaction) -> Result<Self, Error> {
        let psbt = Psbt {
            inputs: vec![Default::default(); tx.input.len()],
            outputs: vec![Default::default(); tx.output.len()],
            unsigned_tx: tx,
        };
        psbt.unsigned_tx_checks()?;
        Ok(psbt)
    }

    /// Checks that unsigned transaction does not have scriptSig's or witness
    /// data.
    pub fn unsigned_tx_checks(&self) -> Result<(), Error> {
        for txin in &self.unsigned_tx.input {
            if !txin.script_sig.is_empty() {
                return Err(Error::UnsignedTxHasScriptSigs);
            }
            if !txin.witness.is_empty() {
                return Err(Error::UnsignedTxHasScriptWitnesses);
            }
        }
        Ok(())
    }

    /// Returns the spending utxo for this PSBT's input at `input_index`.
    ///
    /// The witness utxo is preferred; otherwise the referenced output of the
    /// non-witness parent transaction is located, after checking that the
    /// parent's txid matches this input's outpoint.
    pub fn spend_utxo(&self, input_index: usize) -> Result<&TxOut, Error> {
        let input = self.checked_input(input_index)?;
        if let Some(ref witness_utxo) = input.witness_utxo {
            return Ok(witness_utxo);
        }
        let non_witness_utxo = match input.non_witness_utxo {
            Some(ref tx) => tx,
            None => return Err(Error::MissingUtxo { index: input_index }),
        };
        let outpoint = self.unsigned_tx.input[input_index].previous_output;
        if non_witness_utxo.compute_txid() != outpoint.txid {
            return Err(Error::NonWitnessUtxoTxidMismatch { index: input_index });
        }
        non_witness_utxo
            .output
            .get(outpoint.vout as usize)
            .ok_or(Error::PrevoutOutOfBounds { index: input_index, vout: outpoint.vout })
    }

    /// Gets the input at `input_index` after checking that it is a valid
    /// index for both the map and the unsigned transaction.
    fn checked_input(&self, input_index: usize) -> Result<&Input, Error> {
        if input_index >= self.unsigned_tx.input.len() {
            return Err(Error::IndexOutOfBounds {
                index: input_index,
                length: self.unsigned_tx.input.len(),
            });
        }
        self.inputs
            .get(input_index)
            .ok_or(Error::IndexOutOfBounds { index: input_index, length: self.inputs.len() })
    }

    /// Extracts the network transaction from the PSBT.
    ///
    /// Every input must carry its final scriptSig or witness; this is the
    /// transaction fee computation runs over.
    pub fn extract_tx(&self) -> Result<Transaction, Error> {
        let mut tx = self.unsigned_tx.clone();
        for (index, (txin, input)) in tx.input.iter_mut().zip(&self.inputs).enumerate() {
            if input.final_script_sig.is_none() && input.final_script_witness.is_none() {
                return Err(Error::InputNotFinalized { index });
            }
            if let Some(ref script_sig) = input.final_script_sig {
                txin.script_sig = script_sig.clone();
            }
            if let Some(ref witness) = input.final_script_witness {
                txin.witness = witness.clone();
            }
        }
        Ok(tx)
    }
}

/// A Signature hash type for the corresponding input.
///
/// As of taproot upgrade, the signature hash type can be either
/// [`EcdsaSighashType`] or [`TapSighashType`] but it is not possible to know
/// directly which signature hash type the user is dealing with. Therefore, the
/// user has to convert to/from [`PsbtSighashType`] from/to the desired
/// signature hash type they need.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PsbtSighashType {
    pub(crate) inner: u32,
}

impl PsbtSighashType {
    /// Constructs a [`PsbtSighashType`] from a raw `u32`.
    ///
    /// Allows construction of a non-standard or non-valid sighash flag.
    pub fn from_u32(n: u32) -> PsbtSighashType { PsbtSighashType { inner: n } }

    /// Converts [`PsbtSighashType`] to a raw `u32` sighash flag.
    ///
    /// No guarantees are made as to the standardness or validity of the
    /// returned value.
    pub fn to_u32(self) -> u32 { self.inner }

    /// Returns the [`EcdsaSighashType`] if the [`PsbtSighashType`] can be
    /// converted to one.
    pub fn ecdsa_hash_ty(self) -> Result<EcdsaSighashType, NonStandardSighashTypeError> {
        EcdsaSighashType::from_standard(self.inner)
    }

    /// Returns the [`TapSighashType`] if the [`PsbtSighashType`] can be
    /// converted to one.
    pub fn taproot_hash_ty(self) -> Result<TapSighashType, InvalidSighashTypeError> {
        if self.inner > 0xffu32 {
            Err(InvalidSighashTypeError(self.inner))
        } else {
            TapSighashType::from_consensus_u8(self.inner as u8)
        }
    }
}

impl fmt::Display for PsbtSighashType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.taproot_hash_ty() {
            Err(_) => write!(f, "{:#x}", self.inner),
            Ok(taproot_hash_ty) => fmt::Display::fmt(&taproot_hash_ty, f),
        }
    }
}

impl From<EcdsaSighashType> for PsbtSighashType {
    fn from(ecdsa_hash_ty: EcdsaSighashType) -> Self {
        PsbtSighashType { inner: ecdsa_hash_ty as u32 }
    }
}

impl From<TapSighashType> for PsbtSighashType {
    fn from(taproot_hash_ty: TapSighashType) -> Self {
        PsbtSighashType { inner: taproot_hash_ty as u32 }
    }
}

/// Ways that a Partially Signed Transaction might fail.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Signals that the unsigned transaction has a script sig set.
    UnsignedTxHasScriptSigs,
    /// Signals that the unsigned transaction has a witness set.
    UnsignedTxHasScriptWitnesses,
    /// Requested index is out of bounds.
    IndexOutOfBounds {
        /// Requested index.
        index: usize,
        /// Length of the PSBT input/output vector.
        length: usize,
    },
    /// Input has neither a witness utxo nor a non-witness utxo.
    MissingUtxo {
        /// Input index.
        index: usize,
    },
    /// The txid of the supplied non-witness utxo does not match this input's
    /// outpoint.
    NonWitnessUtxoTxidMismatch {
        /// Input index.
        index: usize,
    },
    /// The outpoint's vout points past the outputs of the non-witness utxo.
    PrevoutOutOfBounds {
        /// Input index.
        index: usize,
        /// The referenced output index.
        vout: u32,
    },
    /// Fee computation needs the input finalized first.
    InputNotFinalized {
        /// Input index.
        index: usize,
    },
    /// The summed output amounts exceed the summed input amounts.
    NegativeFee,
    /// Integer overflow in fee calculation.
    FeeOverflow,
    /// The computed fee rate is at or above the caller's maximum.
    ExcessiveFeeRate {
        /// Computed fee rate in satoshis per virtual byte.
        fee_rate: u64,
        /// The caller-supplied maximum.
        maximum: u64,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;

        match *self {
            UnsignedTxHasScriptSigs => f.write_str("the unsigned transaction has script sigs"),
            UnsignedTxHasScriptWitnesses =>
                f.write_str("the unsigned transaction has script witnesses"),
            IndexOutOfBounds { index, length } =>
                write!(f, "index {} is out of bounds of the PSBT inputs length {}", index, length),
            MissingUtxo { index } =>
                write!(f, "input {} has neither a witness utxo nor a non-witness utxo", index),
            NonWitnessUtxoTxidMismatch { index } => write!(
                f,
                "non-witness utxo txid of input {} does not match the input's outpoint",
                index
            ),
            PrevoutOutOfBounds { index, vout } => write!(
                f,
                "input {} references output {} past the end of its non-witness utxo",
                index, vout
            ),
            InputNotFinalized { index } => write!(
                f,
                "input {} has no final script sig or witness, finalize it first",
                index
            ),
            NegativeFee => f.write_str("PSBT has a negative fee which is not allowed"),
            FeeOverflow => f.write_str("integer overflow in fee calculation"),
            ExcessiveFeeRate { fee_rate, maximum } => write!(
                f,
                "fee rate of {} sat/vbyte is at or above the maximum of {} sat/vbyte",
                fee_rate, maximum
            ),
        }
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::ScriptBuf;
    use crate::transaction::{OutPoint, TxIn};

    fn unsigned_tx() -> Transaction {
        Transaction {
            version: 2,
            lock_time: 0,
            input: vec![TxIn {
                previous_output: OutPoint::default(),
                script_sig: ScriptBuf::new(),
                sequence: 0xFFFFFFFF,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: 50_000, script_pubkey: ScriptBuf::new() }],
        }
    }

    #[test]
    fn from_unsigned_tx_rejects_signed_inputs() {
        let mut tx = unsigned_tx();
        tx.input[0].script_sig = ScriptBuf::from_bytes(vec![0x51]);
        assert_eq!(Psbt::from_unsigned_tx(tx).unwrap_err(), Error::UnsignedTxHasScriptSigs);

        let mut tx = unsigned_tx();
        tx.input[0].witness.push(vec![1]);
        assert_eq!(Psbt::from_unsigned_tx(tx).unwrap_err(), Error::UnsignedTxHasScriptWitnesses);
    }

    #[test]
    fn spend_utxo_prefers_witness_utxo() {
        let mut psbt = Psbt::from_unsigned_tx(unsigned_tx()).unwrap();
        assert_eq!(psbt.spend_utxo(0).unwrap_err(), Error::MissingUtxo { index: 0 });

        let utxo = TxOut { value: 123, script_pubkey: ScriptBuf::new() };
        psbt.inputs[0].witness_utxo = Some(utxo.clone());
        assert_eq!(psbt.spend_utxo(0).unwrap(), &utxo);
    }

    #[test]
    fn spend_utxo_checks_non_witness_txid() {
        let mut psbt = Psbt::from_unsigned_tx(unsigned_tx()).unwrap();
        // A parent whose txid cannot match the null outpoint.
        psbt.inputs[0].non_witness_utxo = Some(unsigned_tx());
        assert_eq!(
            psbt.spend_utxo(0).unwrap_err(),
            Error::NonWitnessUtxoTxidMismatch { index: 0 }
        );
    }

    #[test]
    fn extract_tx_requires_finalized_inputs() {
        let mut psbt = Psbt::from_unsigned_tx(unsigned_tx()).unwrap();
        assert_eq!(psbt.extract_tx().unwrap_err(), Error::InputNotFinalized { index: 0 });

        psbt.inputs[0].final_script_witness = Some(Witness::from_slice(&[vec![1u8; 64]]));
        let tx = psbt.extract_tx().unwrap();
        assert_eq!(tx.input[0].witness.len(), 1);
    }

    #[test]
    fn sighash_type_conversions() {
        let ty = PsbtSighashType::from(TapSighashType::Default);
        assert_eq!(ty.to_u32(), 0);
        assert_eq!(ty.taproot_hash_ty().unwrap(), TapSighashType::Default);
        assert!(ty.ecdsa_hash_ty().is_err());

        let ty = PsbtSighashType::from(EcdsaSighashType::AllPlusAnyoneCanPay);
        assert_eq!(ty.ecdsa_hash_ty().unwrap(), EcdsaSighashType::AllPlusAnyoneCanPay);
        assert_eq!(ty.taproot_hash_ty().unwrap(), TapSighashType::AllPlusAnyoneCanPay);

        assert!(PsbtSighashType::from_u32(0x100).taproot_hash_ty().is_err());
    }
}
