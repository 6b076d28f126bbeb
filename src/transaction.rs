// SPDX-License-Identifier: CC0-1.0

//! Bitcoin transactions.
//!
//! The slice of the transaction data model that signature hashing and fee
//! computation need: the structures, legacy consensus encoding (the form the
//! sighash algorithms and the txid commit to), and weight arithmetic for the
//! segwit form.

use std::fmt;
use std::io::{self, Write};

use hashes::{sha256d, Hash};

use crate::consensus::{write_compact_size, ByteCounter, Encodable};
use crate::script::ScriptBuf;
use crate::witness::Witness;

hashes::hash_newtype! {
    /// A bitcoin transaction id: the double-SHA256 of the legacy-serialized
    /// transaction, displayed in reverse byte order.
    pub struct Txid(sha256d::Hash);
}

/// A reference to an output of a previous transaction.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OutPoint {
    /// The referenced transaction's id.
    pub txid: Txid,
    /// The index of the referenced output in its transaction's output list.
    pub vout: u32,
}

impl OutPoint {
    /// Constructs a new outpoint.
    pub fn new(txid: Txid, vout: u32) -> OutPoint { OutPoint { txid, vout } }

    /// The "null" outpoint coinbase transactions carry: all-zero txid and
    /// maximum output index.
    pub fn null() -> OutPoint {
        OutPoint { txid: Txid::from_byte_array([0; 32]), vout: u32::MAX }
    }
}

impl Default for OutPoint {
    fn default() -> OutPoint { OutPoint::null() }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

impl Encodable for OutPoint {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = self.txid.to_byte_array().consensus_encode(writer)?;
        len += self.vout.consensus_encode(writer)?;
        Ok(len)
    }
}

/// A transaction input.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TxIn {
    /// The output being spent.
    pub previous_output: OutPoint,
    /// The script satisfying the spent output's conditions (pre-segwit).
    pub script_sig: ScriptBuf,
    /// The input's sequence number.
    pub sequence: u32,
    /// The witness stack satisfying the spent output's conditions (segwit).
    ///
    /// Not part of the legacy encoding.
    pub witness: Witness,
}

impl Encodable for TxIn {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = self.previous_output.consensus_encode(writer)?;
        len += self.script_sig.consensus_encode(writer)?;
        len += self.sequence.consensus_encode(writer)?;
        Ok(len)
    }
}

/// A transaction output.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TxOut {
    /// The output's value in satoshis.
    pub value: u64,
    /// The script encumbering the output.
    pub script_pubkey: ScriptBuf,
}

impl Default for TxOut {
    /// The "null" txout used as a placeholder where consensus demands one,
    /// e.g. for the `SIGHASH_SINGLE` output padding.
    fn default() -> TxOut {
        TxOut { value: u64::MAX, script_pubkey: ScriptBuf::new() }
    }
}

impl Encodable for TxOut {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = self.value.consensus_encode(writer)?;
        len += self.script_pubkey.consensus_encode(writer)?;
        Ok(len)
    }
}

/// A bitcoin transaction.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Transaction {
    /// The protocol version.
    pub version: i32,
    /// Block height or timestamp before which the transaction is invalid.
    pub lock_time: u32,
    /// The inputs.
    pub input: Vec<TxIn>,
    /// The outputs.
    pub output: Vec<TxOut>,
}

impl Transaction {
    /// Computes the transaction id.
    ///
    /// Commits to the legacy encoding, witness data excluded.
    pub fn compute_txid(&self) -> Txid {
        let mut enc = sha256d::Hash::engine();
        self.consensus_encode(&mut enc).expect("hash engines do not error");
        Txid::from_byte_array(sha256d::Hash::from_engine(enc).to_byte_array())
    }

    /// Size of the legacy (witness-stripped) encoding in bytes.
    pub fn base_size(&self) -> usize {
        let mut counter = ByteCounter::new();
        self.consensus_encode(&mut counter).expect("counting writers do not error");
        counter.count()
    }

    /// Size of the full encoding, including witnesses when any input has one.
    pub fn total_size(&self) -> usize {
        let base = self.base_size();
        if self.input.iter().all(|txin| txin.witness.is_empty()) {
            return base;
        }
        // Marker and flag bytes plus one witness stack per input.
        base + 2 + self.input.iter().map(|txin| txin.witness.serialized_size()).sum::<usize>()
    }

    /// Transaction weight as defined by BIP 141.
    pub fn weight(&self) -> usize { self.base_size() * 3 + self.total_size() }

    /// Virtual size: weight divided by four, rounded up.
    pub fn vsize(&self) -> usize { (self.weight() + 3) / 4 }
}

impl Encodable for Transaction {
    /// Encodes in the legacy format, witness data excluded.
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        let mut len = self.version.consensus_encode(writer)?;
        len += write_compact_size(writer, self.input.len() as u64)?;
        for txin in &self.input {
            len += txin.consensus_encode(writer)?;
        }
        len += write_compact_size(writer, self.output.len() as u64)?;
        for txout in &self.output {
            len += txout.consensus_encode(writer)?;
        }
        len += self.lock_time.consensus_encode(writer)?;
        Ok(len)
    }
}
