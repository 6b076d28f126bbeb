// SPDX-License-Identifier: CC0-1.0

//! Generalized, efficient, signature hash implementation.
//!
//! Implementation of the algorithms to compute the message to be signed for
//! the legacy, segwit v0 (BIP143) and taproot (BIP341) signature algorithms.
//! Computation relies on a transaction-wide cache of reused hashes: the
//! midstates over all prevouts, sequences, amounts, script pubkeys and
//! outputs are computed once and shared by every input of the transaction.

use std::borrow::Borrow;
use std::fmt;
use std::io::{self, Write};

use hashes::{hash_newtype, sha256, sha256d, sha256t_hash_newtype, Hash};

use crate::consensus::{consensus_encode_with_size, write_compact_size, Encodable};
use crate::script::Script;
use crate::taproot::{LeafVersion, TapLeafHash, TAPROOT_ANNEX_PREFIX};
use crate::transaction::{Transaction, TxOut};

/// Used for the sighash-single bug: the "hash" consensus actually signs when
/// `SIGHASH_SINGLE` points past the last output.
pub(crate) const UINT256_ONE: [u8; 32] = [
    1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

hash_newtype! {
    /// Hash of a transaction according to the legacy signature algorithm.
    #[hash_newtype(forward)]
    pub struct LegacySighash(sha256d::Hash);

    /// Hash of a transaction according to the segwit version 0 signature algorithm.
    #[hash_newtype(forward)]
    pub struct SegwitV0Sighash(sha256d::Hash);
}

sha256t_hash_newtype! {
    /// The tag for a taproot signature hash.
    pub struct TapSighashTag = hash_str("TapSighash");

    /// Taproot-tagged hash with tag "TapSighash".
    ///
    /// This hash type is used for computing taproot signature hash.
    #[hash_newtype(forward)]
    pub struct TapSighash(_);
}

/// Efficiently calculates signature hash message for legacy, segwit and
/// taproot inputs.
#[derive(Debug)]
pub struct SighashCache<T: Borrow<Transaction>> {
    /// Access to transaction required for transaction introspection.
    tx: T,

    /// Common cache for taproot and segwit inputs, `None` for legacy inputs.
    common_cache: Option<CommonCache>,

    /// Cache for segwit v0 inputs (the result of another round of sha256 on
    /// `common_cache`).
    segwit_cache: Option<SegwitCache>,

    /// Cache for taproot v1 inputs.
    taproot_cache: Option<TaprootCache>,
}

/// Common values cached between segwit and taproot inputs.
#[derive(Debug)]
struct CommonCache {
    prevouts: sha256::Hash,
    sequences: sha256::Hash,
    /// In theory `outputs` could be an `Option` since `SIGHASH_NONE` and
    /// `SIGHASH_SINGLE` do not need it, but since `SIGHASH_ALL` is by far the
    /// most used variant we don't bother.
    outputs: sha256::Hash,
}

/// Values cached for segwit inputs: equivalent to [`CommonCache`] plus
/// another round of `sha256`.
#[derive(Debug)]
struct SegwitCache {
    prevouts: sha256d::Hash,
    sequences: sha256d::Hash,
    outputs: sha256d::Hash,
}

/// Values cached for taproot inputs.
#[derive(Debug)]
struct TaprootCache {
    amounts: sha256::Hash,
    script_pubkeys: sha256::Hash,
}

/// Contains outputs of previous transactions. In the case
/// [`TapSighashType`] variant is `SIGHASH_ANYONECANPAY`, [`Prevouts::One`]
/// may be used.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Prevouts<'u, T>
where
    T: 'u + Borrow<TxOut>,
{
    /// `One` variant allows providing the single prevout needed. It's useful,
    /// for example, when modifier `SIGHASH_ANYONECANPAY` is provided, only
    /// prevout of the current input is needed. The first `usize` argument is
    /// the input index this prevout is referring to.
    One(usize, T),
    /// When `SIGHASH_ANYONECANPAY` is not provided, or when the caller will
    /// give all prevouts so the same variable can be used for multiple
    /// inputs.
    All(&'u [T]),
}

impl<'u, T> Prevouts<'u, T>
where
    T: Borrow<TxOut>,
{
    fn check_all(&self, tx: &Transaction) -> Result<(), Error> {
        if let Prevouts::All(prevouts) = self {
            if prevouts.len() != tx.input.len() {
                return Err(Error::PrevoutsSize);
            }
        }
        Ok(())
    }

    fn get_all(&self) -> Result<&[T], Error> {
        match self {
            Prevouts::All(prevouts) => Ok(prevouts),
            _ => Err(Error::PrevoutKind),
        }
    }

    fn get(&self, input_index: usize) -> Result<&TxOut, Error> {
        match self {
            Prevouts::One(index, prevout) =>
                if input_index == *index {
                    Ok(prevout.borrow())
                } else {
                    Err(Error::PrevoutIndex)
                },
            Prevouts::All(prevouts) =>
                prevouts.get(input_index).map(|x| x.borrow()).ok_or(Error::PrevoutIndex),
        }
    }
}

/// Information related to the script path spending.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScriptPath<'s> {
    script: &'s Script,
    leaf_version: LeafVersion,
}

impl<'s> ScriptPath<'s> {
    /// Constructs a new `ScriptPath` structure.
    pub fn new(script: &'s Script, leaf_version: LeafVersion) -> Self {
        ScriptPath { script, leaf_version }
    }

    /// Constructs a new `ScriptPath` structure using default leaf version
    /// value.
    pub fn with_defaults(script: &'s Script) -> Self {
        Self::new(script, LeafVersion::TapScript)
    }

    /// Computes the leaf hash for this `ScriptPath`.
    pub fn leaf_hash(&self) -> TapLeafHash {
        TapLeafHash::from_script(self.script, self.leaf_version)
    }
}

impl<'s> From<ScriptPath<'s>> for TapLeafHash {
    fn from(script_path: ScriptPath<'s>) -> TapLeafHash { script_path.leaf_hash() }
}

/// Hashtype of an input's signature, encoded in the last byte of the
/// signature. Fixed values so they can be cast as integer types for encoding.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum TapSighashType {
    /// 0x0: Used when not explicitly specified, defaulting to
    /// [`TapSighashType::All`].
    Default = 0x00,
    /// 0x1: Sign all outputs.
    All = 0x01,
    /// 0x2: Sign no outputs --- anyone can choose the destination.
    None = 0x02,
    /// 0x3: Sign the output whose index matches this input's index.
    Single = 0x03,
    /// 0x81: Sign all outputs but only this input.
    AllPlusAnyoneCanPay = 0x81,
    /// 0x82: Sign no outputs and only this input.
    NonePlusAnyoneCanPay = 0x82,
    /// 0x83: Sign one output and only this input.
    SinglePlusAnyoneCanPay = 0x83,
}

impl TapSighashType {
    /// Breaks the sighash flag into the "real" sighash flag and the
    /// `SIGHASH_ANYONECANPAY` boolean.
    pub fn split_anyonecanpay_flag(self) -> (TapSighashType, bool) {
        use TapSighashType::*;

        match self {
            Default => (Default, false),
            All => (All, false),
            None => (None, false),
            Single => (Single, false),
            AllPlusAnyoneCanPay => (All, true),
            NonePlusAnyoneCanPay => (None, true),
            SinglePlusAnyoneCanPay => (Single, true),
        }
    }

    /// Constructs a [`TapSighashType`] from a raw `u8`.
    pub fn from_consensus_u8(sighash_type: u8) -> Result<Self, InvalidSighashTypeError> {
        use TapSighashType::*;

        Ok(match sighash_type {
            0x00 => Default,
            0x01 => All,
            0x02 => None,
            0x03 => Single,
            0x81 => AllPlusAnyoneCanPay,
            0x82 => NonePlusAnyoneCanPay,
            0x83 => SinglePlusAnyoneCanPay,
            x => return Err(InvalidSighashTypeError(x.into())),
        })
    }
}

impl fmt::Display for TapSighashType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use TapSighashType::*;

        let s = match self {
            Default => "SIGHASH_DEFAULT",
            All => "SIGHASH_ALL",
            None => "SIGHASH_NONE",
            Single => "SIGHASH_SINGLE",
            AllPlusAnyoneCanPay => "SIGHASH_ALL|SIGHASH_ANYONECANPAY",
            NonePlusAnyoneCanPay => "SIGHASH_NONE|SIGHASH_ANYONECANPAY",
            SinglePlusAnyoneCanPay => "SIGHASH_SINGLE|SIGHASH_ANYONECANPAY",
        };
        f.write_str(s)
    }
}

/// Hashtype of an input's signature, encoded in the last byte of the
/// signature.
///
/// Fixed values so they can be cast as integer types for encoding (see also
/// [`TapSighashType`]).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum EcdsaSighashType {
    /// 0x1: Sign all outputs.
    All = 0x01,
    /// 0x2: Sign no outputs --- anyone can choose the destination.
    None = 0x02,
    /// 0x3: Sign the output whose index matches this input's index.
    Single = 0x03,
    /// 0x81: Sign all outputs but only this input.
    AllPlusAnyoneCanPay = 0x81,
    /// 0x82: Sign no outputs and only this input.
    NonePlusAnyoneCanPay = 0x82,
    /// 0x83: Sign one output and only this input.
    SinglePlusAnyoneCanPay = 0x83,
}

impl EcdsaSighashType {
    /// Splits the sighash flag into the "real" sighash flag and the
    /// `SIGHASH_ANYONECANPAY` boolean.
    pub fn split_anyonecanpay_flag(self) -> (EcdsaSighashType, bool) {
        use EcdsaSighashType::*;

        match self {
            All => (All, false),
            None => (None, false),
            Single => (Single, false),
            AllPlusAnyoneCanPay => (All, true),
            NonePlusAnyoneCanPay => (None, true),
            SinglePlusAnyoneCanPay => (Single, true),
        }
    }

    /// Creates a [`EcdsaSighashType`] from a raw `u32`.
    ///
    /// **Note**: this replicates consensus behaviour, for current standardness
    /// rules correctness you probably want [`Self::from_standard`]. This might
    /// cause unexpected behavior because it does not roundtrip. That is,
    /// `EcdsaSighashType::from_consensus(n) as u32 != n` for non-standard
    /// values of `n`.
    pub fn from_consensus(n: u32) -> EcdsaSighashType {
        use EcdsaSighashType::*;

        // In Bitcoin Core, the SignatureHash function will mask the (int32)
        // value with 0x1f to (apparently) deactivate ACP when checking for
        // SINGLE and NONE bits, and does so unconditionally for the ACP bit.
        let mask = 0x1f | 0x80;
        match n & mask {
            // "real" sighashes
            0x01 => All,
            0x02 => None,
            0x03 => Single,
            0x81 => AllPlusAnyoneCanPay,
            0x82 => NonePlusAnyoneCanPay,
            0x83 => SinglePlusAnyoneCanPay,
            // catchalls
            x if x & 0x80 == 0x80 => AllPlusAnyoneCanPay,
            _ => All,
        }
    }

    /// Creates a [`EcdsaSighashType`] from a raw `u32`.
    ///
    /// # Errors
    ///
    /// If `n` is a non-standard sighash value.
    pub fn from_standard(n: u32) -> Result<EcdsaSighashType, NonStandardSighashTypeError> {
        use EcdsaSighashType::*;

        match n {
            0x01 => Ok(All),
            0x02 => Ok(None),
            0x03 => Ok(Single),
            0x81 => Ok(AllPlusAnyoneCanPay),
            0x82 => Ok(NonePlusAnyoneCanPay),
            0x83 => Ok(SinglePlusAnyoneCanPay),
            non_standard => Err(NonStandardSighashTypeError(non_standard)),
        }
    }

    /// Converts [`EcdsaSighashType`] to a `u32` sighash flag.
    ///
    /// The returned value is guaranteed to be a valid according to
    /// standardness rules.
    pub fn to_u32(self) -> u32 { self as u32 }
}

impl fmt::Display for EcdsaSighashType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use EcdsaSighashType::*;

        let s = match self {
            All => "SIGHASH_ALL",
            None => "SIGHASH_NONE",
            Single => "SIGHASH_SINGLE",
            AllPlusAnyoneCanPay => "SIGHASH_ALL|SIGHASH_ANYONECANPAY",
            NonePlusAnyoneCanPay => "SIGHASH_NONE|SIGHASH_ANYONECANPAY",
            SinglePlusAnyoneCanPay => "SIGHASH_SINGLE|SIGHASH_ANYONECANPAY",
        };
        f.write_str(s)
    }
}

/// Integer is not a consensus valid sighash type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct InvalidSighashTypeError(pub u32);

impl fmt::Display for InvalidSighashTypeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "invalid sighash type {}", self.0)
    }
}

impl std::error::Error for InvalidSighashTypeError {}

/// This type is consensus valid but an input including it would prevent the
/// transaction from being relayed on today's Bitcoin network.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct NonStandardSighashTypeError(pub u32);

impl fmt::Display for NonStandardSighashTypeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "non-standard sighash type {}", self.0)
    }
}

impl std::error::Error for NonStandardSighashTypeError {}

/// The annex: the auxiliary data committed to by a taproot spend, always
/// starting with [`TAPROOT_ANNEX_PREFIX`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Annex<'a>(&'a [u8]);

impl<'a> Annex<'a> {
    /// Constructs a new `Annex` struct checking the first byte is `0x50`.
    pub fn new(annex_bytes: &'a [u8]) -> Result<Self, AnnexError> {
        use AnnexError::*;

        match annex_bytes.first() {
            Some(&TAPROOT_ANNEX_PREFIX) => Ok(Annex(annex_bytes)),
            Some(other) => Err(IncorrectPrefix(*other)),
            None => Err(Empty),
        }
    }

    /// Returns the Annex bytes data (including the first byte `0x50`).
    pub fn as_bytes(&self) -> &[u8] { self.0 }
}

impl<'a> Encodable for Annex<'a> {
    fn consensus_encode<W: Write + ?Sized>(&self, w: &mut W) -> Result<usize, io::Error> {
        consensus_encode_with_size(self.0, w)
    }
}

/// Error constructing an [`Annex`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum AnnexError {
    /// The annex is empty.
    Empty,
    /// Incorrect prefix byte in the annex.
    IncorrectPrefix(u8),
}

impl fmt::Display for AnnexError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use AnnexError::*;

        match *self {
            Empty => write!(f, "the annex is empty"),
            IncorrectPrefix(byte) =>
                write!(f, "incorrect prefix byte in the annex {:#02x}, expecting 0x50", byte),
        }
    }
}

impl std::error::Error for AnnexError {}

impl<T: Borrow<Transaction>> SighashCache<T> {
    /// Constructs a new `SighashCache` from an unsigned transaction.
    ///
    /// The sighash components are computed in a lazy manner when required by
    /// the sighash calculation.
    pub fn new(tx: T) -> Self {
        SighashCache { tx, common_cache: None, taproot_cache: None, segwit_cache: None }
    }

    /// Returns the reference to the cached transaction.
    pub fn transaction(&self) -> &Transaction { self.tx.borrow() }

    /// Destroys the cache and recovers the stored transaction.
    pub fn into_transaction(self) -> T { self.tx }

    /// Encodes the BIP341 signing data for any flag type into a given object
    /// implementing the [`io::Write`] trait.
    pub fn taproot_encode_signing_data_to<W: Write + ?Sized, P: Borrow<TxOut>>(
        &mut self,
        writer: &mut W,
        input_index: usize,
        prevouts: &Prevouts<P>,
        annex: Option<Annex>,
        leaf_hash_code_separator: Option<(TapLeafHash, u32)>,
        sighash_type: TapSighashType,
    ) -> Result<(), Error> {
        prevouts.check_all(self.tx.borrow())?;

        let (sighash, anyone_can_pay) = sighash_type.split_anyonecanpay_flag();

        // epoch
        0u8.consensus_encode(writer)?;

        // * Control:
        // hash_type (1).
        (sighash_type as u8).consensus_encode(writer)?;

        // * Transaction Data:
        // nVersion (4): the nVersion of the transaction.
        self.tx.borrow().version.consensus_encode(writer)?;

        // nLockTime (4): the nLockTime of the transaction.
        self.tx.borrow().lock_time.consensus_encode(writer)?;

        // If the hash_type & 0x80 does not equal SIGHASH_ANYONECANPAY:
        //     sha_prevouts (32): the SHA256 of the serialization of all input outpoints.
        //     sha_amounts (32): the SHA256 of the serialization of all spent output amounts.
        //     sha_scriptpubkeys (32): the SHA256 of all spent outputs' scriptPubKeys.
        //     sha_sequences (32): the SHA256 of the serialization of all input nSequence.
        if !anyone_can_pay {
            self.common_cache().prevouts.consensus_encode(writer)?;
            self.taproot_cache(prevouts.get_all()?).amounts.consensus_encode(writer)?;
            self.taproot_cache(prevouts.get_all()?).script_pubkeys.consensus_encode(writer)?;
            self.common_cache().sequences.consensus_encode(writer)?;
        }

        // If hash_type & 3 does not equal SIGHASH_NONE or SIGHASH_SINGLE:
        //     sha_outputs (32): the SHA256 of the serialization of all outputs in CTxOut format.
        if sighash != TapSighashType::None && sighash != TapSighashType::Single {
            self.common_cache().outputs.consensus_encode(writer)?;
        }

        // * Data about this input:
        // spend_type (1): equal to (ext_flag * 2) + annex_present.
        let mut spend_type = 0u8;
        if annex.is_some() {
            spend_type |= 1;
        }
        if leaf_hash_code_separator.is_some() {
            spend_type |= 2;
        }
        spend_type.consensus_encode(writer)?;

        // If hash_type & 0x80 equals SIGHASH_ANYONECANPAY:
        //      outpoint (36): the COutPoint of this input.
        //      amount (8): value of the previous output spent by this input.
        //      scriptPubKey (35): scriptPubKey of the previous output spent by this input.
        //      nSequence (4): nSequence of this input.
        if anyone_can_pay {
            let txin = self.tx.borrow().input.get(input_index).ok_or(
                Error::IndexOutOfInputsBounds {
                    index: input_index,
                    inputs_size: self.tx.borrow().input.len(),
                },
            )?;
            let previous_output = prevouts.get(input_index)?;
            txin.previous_output.consensus_encode(writer)?;
            previous_output.value.consensus_encode(writer)?;
            previous_output.script_pubkey.consensus_encode(writer)?;
            txin.sequence.consensus_encode(writer)?;
        } else {
            (input_index as u32).consensus_encode(writer)?;
        }

        // If an annex is present (the lowest bit of spend_type is set):
        //      sha_annex (32): the SHA256 of (compact_size(size of annex) || annex).
        if let Some(annex) = annex {
            let mut enc = sha256::Hash::engine();
            annex.consensus_encode(&mut enc)?;
            let hash = sha256::Hash::from_engine(enc);
            hash.consensus_encode(writer)?;
        }

        // * Data about this output:
        // If hash_type & 3 equals SIGHASH_SINGLE:
        //      sha_single_output (32): the SHA256 of the corresponding output in CTxOut format.
        if sighash == TapSighashType::Single {
            let mut enc = sha256::Hash::engine();
            self.tx
                .borrow()
                .output
                .get(input_index)
                .ok_or(Error::SingleWithoutCorrespondingOutput {
                    index: input_index,
                    outputs_size: self.tx.borrow().output.len(),
                })?
                .consensus_encode(&mut enc)?;
            let hash = sha256::Hash::from_engine(enc);
            hash.consensus_encode(writer)?;
        }

        //     if (scriptpath):
        //         ss += TaggedHash("TapLeaf", bytes([leaf_ver]) + ser_string(script))
        //         ss += bytes([0])
        //         ss += struct.pack("<i", codeseparator_pos)
        if let Some((hash, code_separator_pos)) = leaf_hash_code_separator {
            hash.to_byte_array().consensus_encode(writer)?;
            0u8.consensus_encode(writer)?; // KEY_VERSION_0
            code_separator_pos.consensus_encode(writer)?;
        }

        Ok(())
    }

    /// Computes the BIP341 sighash for any flag type.
    pub fn taproot_signature_hash<P: Borrow<TxOut>>(
        &mut self,
        input_index: usize,
        prevouts: &Prevouts<P>,
        annex: Option<Annex>,
        leaf_hash_code_separator: Option<(TapLeafHash, u32)>,
        sighash_type: TapSighashType,
    ) -> Result<TapSighash, Error> {
        let mut enc = TapSighash::engine();
        self.taproot_encode_signing_data_to(
            &mut enc,
            input_index,
            prevouts,
            annex,
            leaf_hash_code_separator,
            sighash_type,
        )?;
        Ok(TapSighash::from_engine(enc))
    }

    /// Computes the BIP341 sighash for a key spend.
    pub fn taproot_key_spend_signature_hash<P: Borrow<TxOut>>(
        &mut self,
        input_index: usize,
        prevouts: &Prevouts<P>,
        sighash_type: TapSighashType,
    ) -> Result<TapSighash, Error> {
        self.taproot_signature_hash(input_index, prevouts, None, None, sighash_type)
    }

    /// Computes the BIP341 sighash for a script spend.
    ///
    /// Assumes the default `OP_CODESEPARATOR` position of `0xFFFFFFFF`.
    pub fn taproot_script_spend_signature_hash<S: Into<TapLeafHash>, P: Borrow<TxOut>>(
        &mut self,
        input_index: usize,
        prevouts: &Prevouts<P>,
        leaf_hash: S,
        sighash_type: TapSighashType,
    ) -> Result<TapSighash, Error> {
        self.taproot_signature_hash(
            input_index,
            prevouts,
            None,
            Some((leaf_hash.into(), 0xFFFFFFFF)),
            sighash_type,
        )
    }

    /// Encodes the BIP143 signing data for any flag type into a given object
    /// implementing the [`io::Write`] trait.
    ///
    /// `script_code` is dependent on the type of the spend transaction: for
    /// P2WPKH the `script_code` is the equivalent P2PKH script, for P2WSH it
    /// is the witness script.
    pub fn segwit_encode_signing_data_to<W: Write + ?Sized>(
        &mut self,
        writer: &mut W,
        input_index: usize,
        script_code: &Script,
        value: u64,
        sighash_type: EcdsaSighashType,
    ) -> Result<(), Error> {
        let zero_hash = sha256d::Hash::all_zeros();

        let (sighash, anyone_can_pay) = sighash_type.split_anyonecanpay_flag();

        self.tx.borrow().version.consensus_encode(writer)?;

        if !anyone_can_pay {
            self.segwit_cache().prevouts.consensus_encode(writer)?;
        } else {
            zero_hash.consensus_encode(writer)?;
        }

        if !anyone_can_pay
            && sighash != EcdsaSighashType::Single
            && sighash != EcdsaSighashType::None
        {
            self.segwit_cache().sequences.consensus_encode(writer)?;
        } else {
            zero_hash.consensus_encode(writer)?;
        }

        {
            let txin = self.tx.borrow().input.get(input_index).ok_or(
                Error::IndexOutOfInputsBounds {
                    index: input_index,
                    inputs_size: self.tx.borrow().input.len(),
                },
            )?;
            txin.previous_output.consensus_encode(writer)?;
            script_code.consensus_encode(writer)?;
            value.consensus_encode(writer)?;
            txin.sequence.consensus_encode(writer)?;
        }

        if sighash != EcdsaSighashType::Single && sighash != EcdsaSighashType::None {
            self.segwit_cache().outputs.consensus_encode(writer)?;
        } else if sighash == EcdsaSighashType::Single
            && input_index < self.tx.borrow().output.len()
        {
            let mut single_enc = LegacySighash::engine();
            self.tx.borrow().output[input_index].consensus_encode(&mut single_enc)?;
            let hash = LegacySighash::from_engine(single_enc);
            writer.write_all(hash.as_ref())?;
        } else {
            writer.write_all(zero_hash.as_ref())?;
        }

        self.tx.borrow().lock_time.consensus_encode(writer)?;
        sighash_type.to_u32().consensus_encode(writer)?;
        Ok(())
    }

    /// Computes the BIP143 sighash for any flag type.
    pub fn segwit_signature_hash(
        &mut self,
        input_index: usize,
        script_code: &Script,
        value: u64,
        sighash_type: EcdsaSighashType,
    ) -> Result<SegwitV0Sighash, Error> {
        let mut enc = SegwitV0Sighash::engine();
        self.segwit_encode_signing_data_to(
            &mut enc,
            input_index,
            script_code,
            value,
            sighash_type,
        )?;
        Ok(SegwitV0Sighash::from_engine(enc))
    }

    /// Encodes the legacy signing data from which a signature hash for a
    /// given input index with a given sighash flag can be computed.
    ///
    /// To actually produce a scriptSig, this hash needs to be run through an
    /// ECDSA signer, the [`EcdsaSighashType`] appended to the resulting sig,
    /// and a script written around this, but this is the general (and hard)
    /// part.
    ///
    /// The `sighash_type` supports an arbitrary `u32` value, instead of just
    /// [`EcdsaSighashType`], because internally 4 bytes are being hashed, even
    /// though only the lowest byte is appended to signature in a transaction.
    fn legacy_encode_signing_data_to<W: Write + ?Sized>(
        &self,
        writer: &mut W,
        input_index: usize,
        script_pubkey: &Script,
        sighash_type: u32,
    ) -> Result<(), Error> {
        let tx = self.tx.borrow();
        if input_index >= tx.input.len() {
            return Err(Error::IndexOutOfInputsBounds {
                index: input_index,
                inputs_size: tx.input.len(),
            });
        }

        let (sighash, anyone_can_pay) =
            EcdsaSighashType::from_consensus(sighash_type).split_anyonecanpay_flag();

        tx.version.consensus_encode(writer)?;

        // Add all necessary inputs...
        if anyone_can_pay {
            write_compact_size(writer, 1)?;
            let txin = &tx.input[input_index];
            txin.previous_output.consensus_encode(writer)?;
            script_pubkey.consensus_encode(writer)?;
            txin.sequence.consensus_encode(writer)?;
        } else {
            write_compact_size(writer, tx.input.len() as u64)?;
            for (n, txin) in tx.input.iter().enumerate() {
                txin.previous_output.consensus_encode(writer)?;
                if n == input_index {
                    script_pubkey.consensus_encode(writer)?;
                } else {
                    write_compact_size(writer, 0)?;
                }
                if n != input_index
                    && (sighash == EcdsaSighashType::Single || sighash == EcdsaSighashType::None)
                {
                    0u32.consensus_encode(writer)?;
                } else {
                    txin.sequence.consensus_encode(writer)?;
                }
            }
        }

        // ...then all the outputs.
        match sighash {
            EcdsaSighashType::All => {
                write_compact_size(writer, tx.output.len() as u64)?;
                for txout in &tx.output {
                    txout.consensus_encode(writer)?;
                }
            }
            EcdsaSighashType::Single => {
                // sign all outputs up to and including this one, but erase
                // all of them except for this one
                let count = input_index.min(tx.output.len() - 1);
                write_compact_size(writer, (count + 1) as u64)?;
                for _ in 0..count {
                    TxOut::default().consensus_encode(writer)?;
                }
                tx.output[count].consensus_encode(writer)?;
            }
            EcdsaSighashType::None => {
                write_compact_size(writer, 0)?;
            }
            _ => unreachable!("split_anyonecanpay_flag never returns ACP variants"),
        }

        tx.lock_time.consensus_encode(writer)?;
        Ok(())
    }

    /// Computes a legacy signature hash for a given input index with a given
    /// sighash flag.
    ///
    /// This returns the "one array" when `SIGHASH_SINGLE` refers to an input
    /// index with no corresponding output (the sighash-single bug): consensus
    /// treats that hash as the message to sign rather than failing.
    pub fn legacy_signature_hash(
        &self,
        input_index: usize,
        script_pubkey: &Script,
        sighash_type: u32,
    ) -> Result<LegacySighash, Error> {
        let tx = self.tx.borrow();
        if input_index >= tx.input.len() {
            return Err(Error::IndexOutOfInputsBounds {
                index: input_index,
                inputs_size: tx.input.len(),
            });
        }
        if self.is_invalid_use_of_sighash_single(sighash_type, input_index) {
            return Ok(LegacySighash::from_byte_array(UINT256_ONE));
        }

        let mut enc = LegacySighash::engine();
        self.legacy_encode_signing_data_to(&mut enc, input_index, script_pubkey, sighash_type)?;
        sighash_type.consensus_encode(&mut enc)?;
        Ok(LegacySighash::from_engine(enc))
    }

    fn is_invalid_use_of_sighash_single(&self, sighash_type: u32, input_index: usize) -> bool {
        let (sighash, _) =
            EcdsaSighashType::from_consensus(sighash_type).split_anyonecanpay_flag();
        sighash == EcdsaSighashType::Single && input_index >= self.tx.borrow().output.len()
    }

    fn common_cache(&mut self) -> &CommonCache {
        Self::common_cache_minimal_borrow(&mut self.common_cache, self.tx.borrow())
    }

    fn common_cache_minimal_borrow<'a>(
        common_cache: &'a mut Option<CommonCache>,
        tx: &Transaction,
    ) -> &'a CommonCache {
        common_cache.get_or_insert_with(|| {
            let mut enc_prevouts = sha256::Hash::engine();
            let mut enc_sequences = sha256::Hash::engine();
            for txin in &tx.input {
                txin.previous_output
                    .consensus_encode(&mut enc_prevouts)
                    .expect("hash engines do not error");
                txin.sequence
                    .consensus_encode(&mut enc_sequences)
                    .expect("hash engines do not error");
            }
            CommonCache {
                prevouts: sha256::Hash::from_engine(enc_prevouts),
                sequences: sha256::Hash::from_engine(enc_sequences),
                outputs: {
                    let mut enc = sha256::Hash::engine();
                    for txout in &tx.output {
                        txout.consensus_encode(&mut enc).expect("hash engines do not error");
                    }
                    sha256::Hash::from_engine(enc)
                },
            }
        })
    }

    fn segwit_cache(&mut self) -> &SegwitCache {
        let SighashCache { ref tx, ref mut common_cache, ref mut segwit_cache, .. } = *self;
        segwit_cache.get_or_insert_with(|| {
            let common_cache = Self::common_cache_minimal_borrow(common_cache, tx.borrow());
            SegwitCache {
                prevouts: common_cache.prevouts.hash_again(),
                sequences: common_cache.sequences.hash_again(),
                outputs: common_cache.outputs.hash_again(),
            }
        })
    }

    fn taproot_cache<P: Borrow<TxOut>>(&mut self, prevouts: &[P]) -> &TaprootCache {
        self.taproot_cache.get_or_insert_with(|| {
            let mut enc_amounts = sha256::Hash::engine();
            let mut enc_script_pubkeys = sha256::Hash::engine();
            for prevout in prevouts {
                let prevout = prevout.borrow();
                prevout.value.consensus_encode(&mut enc_amounts).expect("hash engines do not error");
                prevout
                    .script_pubkey
                    .consensus_encode(&mut enc_script_pubkeys)
                    .expect("hash engines do not error");
            }
            TaprootCache {
                amounts: sha256::Hash::from_engine(enc_amounts),
                script_pubkeys: sha256::Hash::from_engine(enc_script_pubkeys),
            }
        })
    }
}

/// Possible errors in computing the signature message.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Could happen only by using `*_encode_signing_*` methods with custom
    /// writers, engines like the ones used by the `*_signature_hash` methods
    /// do not error.
    Io(io::ErrorKind),

    /// Requested index is greater or equal than the number of inputs in the
    /// transaction.
    IndexOutOfInputsBounds {
        /// Requested index.
        index: usize,
        /// Number of transaction inputs.
        inputs_size: usize,
    },

    /// Using `SIGHASH_SINGLE` requires an output at the same index as the
    /// input.
    SingleWithoutCorrespondingOutput {
        /// Requested index.
        index: usize,
        /// Number of transaction outputs.
        outputs_size: usize,
    },

    /// The number of supplied prevouts differs from the number of inputs in
    /// the transaction.
    PrevoutsSize,

    /// Requested a prevout index which is greater than the number of prevouts
    /// provided or a [`Prevouts::One`] with different index.
    PrevoutIndex,

    /// A single prevout has been provided but all prevouts are needed without
    /// `ANYONECANPAY`.
    PrevoutKind,

    /// Invalid sighash type.
    InvalidSighashType(u32),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;

        match *self {
            Io(error_kind) => write!(f, "writer errored: {:?}", error_kind),
            IndexOutOfInputsBounds { index, inputs_size } => write!(
                f,
                "requested index ({}) is greater or equal than the number of transaction inputs ({})",
                index, inputs_size
            ),
            SingleWithoutCorrespondingOutput { index, outputs_size } => write!(
                f,
                "SIGHASH_SINGLE for input ({}) haven't a corresponding output (#outputs:{})",
                index, outputs_size
            ),
            PrevoutsSize => write!(f, "number of supplied prevouts differs from the number of inputs in transaction"),
            PrevoutIndex => write!(f, "the index requested is greater than available prevouts or different from the provided [Provided::Anyone] index"),
            PrevoutKind => write!(f, "a single prevout has been provided but all prevouts are needed without `ANYONECANPAY`"),
            InvalidSighashType(hash_ty) => write!(f, "invalid taproot sighash type : {} ", hash_ty),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use Error::*;

        match *self {
            Io(_)
            | IndexOutOfInputsBounds { .. }
            | SingleWithoutCorrespondingOutput { .. }
            | PrevoutsSize
            | PrevoutIndex
            | PrevoutKind
            | InvalidSighashType(_) => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self { Error::Io(e.kind()) }
}
