// SPDX-License-Identifier: CC0-1.0

//! Bitcoin scripts.
//!
//! Carries the borrowed/owned script pair plus the template predicates the
//! signer and finalizer classify spent outputs with. Script execution is out
//! of scope; everything here is byte-pattern matching over the standard
//! templates.

use std::borrow::Borrow;
use std::fmt;
use std::io::{self, Write};
use std::ops::Deref;

use hashes::{hash160, sha256, Hash};
use hex::{DisplayHex, FromHex, HexToBytesError};

use crate::consensus::{consensus_encode_with_size, Encodable};

/// Push an empty array onto the stack.
pub const OP_0: u8 = 0x00;
/// Read the next byte as N and push the next N bytes.
pub const OP_PUSHDATA1: u8 = 0x4c;
/// Read the next 2 bytes (LE) as N and push the next N bytes.
pub const OP_PUSHDATA2: u8 = 0x4d;
/// Read the next 4 bytes (LE) as N and push the next N bytes.
pub const OP_PUSHDATA4: u8 = 0x4e;
/// Push the number 1 onto the stack.
pub const OP_PUSHNUM_1: u8 = 0x51;
/// Push the number 16 onto the stack.
pub const OP_PUSHNUM_16: u8 = 0x60;
/// Fail the script immediately, marking the output as provably unspendable.
pub const OP_RETURN: u8 = 0x6a;
/// Duplicate the top stack item.
pub const OP_DUP: u8 = 0x76;
/// Pop two items and push 1 if they are equal, 0 otherwise.
pub const OP_EQUAL: u8 = 0x87;
/// [`OP_EQUAL`] then `OP_VERIFY`.
pub const OP_EQUALVERIFY: u8 = 0x88;
/// Pop the top item and push its RIPEMD160(SHA256) hash.
pub const OP_HASH160: u8 = 0xa9;
/// Pop a pubkey and signature and verify the signature.
pub const OP_CHECKSIG: u8 = 0xac;
/// Pop N pubkeys, M signatures and a dummy, verify M-of-N.
pub const OP_CHECKMULTISIG: u8 = 0xae;

/// The standard output template a script matches, if any.
///
/// Classification drives both sighash selection while signing and solution
/// layout while finalizing.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ScriptClass {
    /// `<pubkey> OP_CHECKSIG`.
    P2pk,
    /// `OP_DUP OP_HASH160 <20> OP_EQUALVERIFY OP_CHECKSIG`.
    P2pkh,
    /// Bare `OP_m <pubkeys> OP_n OP_CHECKMULTISIG`.
    Multisig,
    /// `OP_HASH160 <20> OP_EQUAL`.
    P2sh,
    /// Witness v0 keyhash program.
    P2wpkh,
    /// Witness v0 scripthash program.
    P2wsh,
    /// Witness v1 taproot program.
    P2tr,
    /// Provably unspendable data carrier.
    OpReturn,
    /// Anything else.
    NonStandard,
}

impl fmt::Display for ScriptClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match *self {
            ScriptClass::P2pk => "pubkey",
            ScriptClass::P2pkh => "pubkeyhash",
            ScriptClass::Multisig => "multisig",
            ScriptClass::P2sh => "scripthash",
            ScriptClass::P2wpkh => "witnesspubkeyhash",
            ScriptClass::P2wsh => "witnessscripthash",
            ScriptClass::P2tr => "taproot",
            ScriptClass::OpReturn => "nulldata",
            ScriptClass::NonStandard => "nonstandard",
        };
        f.write_str(s)
    }
}

/// A borrowed script slice.
#[derive(PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Script([u8]);

impl Script {
    /// Treats a byte slice as a script.
    #[inline]
    pub fn from_bytes(bytes: &[u8]) -> &Script {
        // SAFETY: `Script` is a transparent wrapper around `[u8]`.
        unsafe { &*(bytes as *const [u8] as *const Script) }
    }

    /// Returns the script bytes.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] { &self.0 }

    /// Returns the length of the script in bytes.
    #[inline]
    pub fn len(&self) -> usize { self.0.len() }

    /// Returns whether the script is empty.
    #[inline]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Creates an owned copy.
    #[inline]
    pub fn to_owned(&self) -> ScriptBuf { ScriptBuf(self.0.to_vec()) }

    /// Computes the hash160 of the script, as committed to by P2SH outputs.
    pub fn script_hash(&self) -> hash160::Hash { hash160::Hash::hash(&self.0) }

    /// Computes the SHA256 of the script, as committed to by P2WSH outputs.
    pub fn wscript_hash(&self) -> sha256::Hash { sha256::Hash::hash(&self.0) }

    /// Checks whether the script matches the pay-to-pubkey template.
    pub fn is_p2pk(&self) -> bool {
        match self.0.len() {
            67 => self.0[0] == 65 && self.0[66] == OP_CHECKSIG,
            35 => self.0[0] == 33 && self.0[34] == OP_CHECKSIG,
            _ => false,
        }
    }

    /// Checks whether the script matches the pay-to-pubkey-hash template.
    pub fn is_p2pkh(&self) -> bool {
        self.0.len() == 25
            && self.0[0] == OP_DUP
            && self.0[1] == OP_HASH160
            && self.0[2] == 20
            && self.0[23] == OP_EQUALVERIFY
            && self.0[24] == OP_CHECKSIG
    }

    /// Checks whether the script matches the pay-to-script-hash template.
    pub fn is_p2sh(&self) -> bool {
        self.0.len() == 23 && self.0[0] == OP_HASH160 && self.0[1] == 20 && self.0[22] == OP_EQUAL
    }

    /// Checks whether the script is a witness v0 keyhash program.
    pub fn is_p2wpkh(&self) -> bool {
        self.0.len() == 22 && self.0[0] == OP_0 && self.0[1] == 20
    }

    /// Checks whether the script is a witness v0 scripthash program.
    pub fn is_p2wsh(&self) -> bool {
        self.0.len() == 34 && self.0[0] == OP_0 && self.0[1] == 32
    }

    /// Checks whether the script is a witness v1 taproot program.
    pub fn is_p2tr(&self) -> bool {
        self.0.len() == 34 && self.0[0] == OP_PUSHNUM_1 && self.0[1] == 32
    }

    /// Checks whether the script is an `OP_RETURN` data carrier.
    pub fn is_op_return(&self) -> bool { !self.0.is_empty() && self.0[0] == OP_RETURN }

    /// Checks whether the script matches the bare multisig template.
    pub fn is_multisig(&self) -> bool { self.multisig_pubkeys().is_some() }

    /// Parses a bare `OP_m <pubkeys> OP_n OP_CHECKMULTISIG` script.
    ///
    /// Returns the threshold `m` and the pubkeys in script order, or `None`
    /// when the script does not match the template.
    pub fn multisig_pubkeys(&self) -> Option<(usize, Vec<&[u8]>)> {
        let b = &self.0;
        if b.len() < 37 || *b.last()? != OP_CHECKMULTISIG {
            return None;
        }
        let m_op = b[0];
        let n_op = b[b.len() - 2];
        if !(OP_PUSHNUM_1..=OP_PUSHNUM_16).contains(&m_op)
            || !(OP_PUSHNUM_1..=OP_PUSHNUM_16).contains(&n_op)
        {
            return None;
        }
        let m = (m_op - OP_PUSHNUM_1 + 1) as usize;
        let n = (n_op - OP_PUSHNUM_1 + 1) as usize;

        let mut keys = Vec::with_capacity(n);
        let mut i = 1;
        while i < b.len() - 2 {
            let push = b[i] as usize;
            if push != 33 && push != 65 {
                return None;
            }
            let end = i + 1 + push;
            if end > b.len() - 2 {
                return None;
            }
            keys.push(&b[i + 1..end]);
            i = end;
        }
        if keys.len() != n || m > n {
            return None;
        }
        Some((m, keys))
    }

    /// Returns the witness program bytes of a v0/v1 program script.
    pub fn witness_program(&self) -> Option<&[u8]> {
        if self.is_p2wpkh() || self.is_p2wsh() || self.is_p2tr() {
            Some(&self.0[2..])
        } else {
            None
        }
    }

    /// The BIP143 script code of a P2WPKH program: the equivalent P2PKH
    /// script over the same key hash.
    pub fn p2wpkh_script_code(&self) -> Option<ScriptBuf> {
        if !self.is_p2wpkh() {
            return None;
        }
        let mut code = Vec::with_capacity(25);
        code.extend_from_slice(&[OP_DUP, OP_HASH160, 20]);
        code.extend_from_slice(&self.0[2..22]);
        code.extend_from_slice(&[OP_EQUALVERIFY, OP_CHECKSIG]);
        Some(ScriptBuf(code))
    }

    /// Classifies the script against the standard templates.
    pub fn classify(&self) -> ScriptClass {
        if self.is_p2wpkh() {
            ScriptClass::P2wpkh
        } else if self.is_p2wsh() {
            ScriptClass::P2wsh
        } else if self.is_p2tr() {
            ScriptClass::P2tr
        } else if self.is_p2pkh() {
            ScriptClass::P2pkh
        } else if self.is_p2sh() {
            ScriptClass::P2sh
        } else if self.is_p2pk() {
            ScriptClass::P2pk
        } else if self.is_multisig() {
            ScriptClass::Multisig
        } else if self.is_op_return() {
            ScriptClass::OpReturn
        } else {
            ScriptClass::NonStandard
        }
    }

    /// Byte offset of the first occurrence of `needle` pushed in the script.
    ///
    /// Template-level search, sufficient for ordering tapscript signatures by
    /// the position of their pubkey.
    pub fn find_subslice(&self, needle: &[u8]) -> Option<usize> {
        if needle.is_empty() || needle.len() > self.0.len() {
            return None;
        }
        self.0.windows(needle.len()).position(|w| w == needle)
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Script({})", self.0.to_lower_hex_string())
    }
}

impl fmt::LowerHex for Script {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0.as_hex(), f)
    }
}

impl Encodable for Script {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        consensus_encode_with_size(&self.0, writer)
    }
}

impl ToOwned for Script {
    type Owned = ScriptBuf;
    fn to_owned(&self) -> ScriptBuf { self.to_owned() }
}

impl AsRef<Script> for Script {
    fn as_ref(&self) -> &Script { self }
}

/// An owned script.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScriptBuf(Vec<u8>);

impl ScriptBuf {
    /// Constructs an empty script.
    pub fn new() -> Self { ScriptBuf(Vec::new()) }

    /// Constructs a script from raw bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Self { ScriptBuf(bytes) }

    /// Parses a script from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, HexToBytesError> {
        Ok(ScriptBuf(Vec::from_hex(s)?))
    }

    /// Borrows the script.
    #[inline]
    pub fn as_script(&self) -> &Script { Script::from_bytes(&self.0) }

    /// Consumes the script, returning its bytes.
    pub fn into_bytes(self) -> Vec<u8> { self.0 }

    /// Appends a single opcode.
    pub fn push_opcode(&mut self, opcode: u8) { self.0.push(opcode); }

    /// Appends a minimal data push of `data`.
    pub fn push_slice(&mut self, data: &[u8]) {
        match data.len() {
            n if n < OP_PUSHDATA1 as usize => self.0.push(n as u8),
            n if n <= 0xFF => {
                self.0.push(OP_PUSHDATA1);
                self.0.push(n as u8);
            }
            n if n <= 0xFFFF => {
                self.0.push(OP_PUSHDATA2);
                self.0.extend_from_slice(&(n as u16).to_le_bytes());
            }
            n => {
                self.0.push(OP_PUSHDATA4);
                self.0.extend_from_slice(&(n as u32).to_le_bytes());
            }
        }
        self.0.extend_from_slice(data);
    }
}

impl Deref for ScriptBuf {
    type Target = Script;
    #[inline]
    fn deref(&self) -> &Script { self.as_script() }
}

impl Borrow<Script> for ScriptBuf {
    fn borrow(&self) -> &Script { self.as_script() }
}

impl AsRef<Script> for ScriptBuf {
    fn as_ref(&self) -> &Script { self.as_script() }
}

impl From<Vec<u8>> for ScriptBuf {
    fn from(bytes: Vec<u8>) -> Self { ScriptBuf(bytes) }
}

impl From<&Script> for ScriptBuf {
    fn from(script: &Script) -> Self { script.to_owned() }
}

impl fmt::Debug for ScriptBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { fmt::Debug::fmt(self.as_script(), f) }
}

impl fmt::LowerHex for ScriptBuf {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::LowerHex::fmt(self.as_script(), f)
    }
}

impl Encodable for ScriptBuf {
    fn consensus_encode<W: Write + ?Sized>(&self, writer: &mut W) -> Result<usize, io::Error> {
        self.as_script().consensus_encode(writer)
    }
}
