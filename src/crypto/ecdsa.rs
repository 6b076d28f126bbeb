// SPDX-License-Identifier: CC0-1.0

//! ECDSA bitcoin signatures: a DER-encoded signature paired with the sighash
//! type byte that consensus appends to it.

use std::error;
use std::fmt;

use hex::DisplayHex;

use crate::sighash::{EcdsaSighashType, NonStandardSighashTypeError};

/// An ECDSA signature with its sighash type.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature {
    /// The DER-encoded signature.
    pub signature: Vec<u8>,
    /// The type of sighash this signature covers.
    pub sighash_type: EcdsaSighashType,
}

impl Signature {
    /// Constructs a signature with the given sighash type.
    pub fn new(signature: Vec<u8>, sighash_type: EcdsaSighashType) -> Self {
        Signature { signature, sighash_type }
    }

    /// Constructs a signature covering `SIGHASH_ALL`.
    pub fn sighash_all(signature: Vec<u8>) -> Self {
        Signature { signature, sighash_type: EcdsaSighashType::All }
    }

    /// Serializes to the form pushed in script sigs and witnesses: the DER
    /// bytes followed by the sighash type byte.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = self.signature.clone();
        out.push(self.sighash_type as u8);
        out
    }

    /// Parses a signature from its pushed form, splitting off the trailing
    /// sighash type byte.
    pub fn from_slice(bytes: &[u8]) -> Result<Signature, Error> {
        let (hash_ty, der) = bytes.split_last().ok_or(Error::EmptySignature)?;
        let sighash_type = EcdsaSighashType::from_standard(u32::from(*hash_ty))
            .map_err(Error::SighashType)?;
        Ok(Signature { signature: der.to_vec(), sighash_type })
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.to_vec().as_hex(), f)
    }
}

/// An ECDSA signature-related error.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Non-standard sighash type byte.
    SighashType(NonStandardSighashTypeError),
    /// Signature was empty.
    EmptySignature,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Error::*;

        match *self {
            SighashType(ref e) => write!(f, "invalid sighash type: {}", e),
            EmptySignature => write!(f, "empty ECDSA signature"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        use Error::*;

        match *self {
            SighashType(ref e) => Some(e),
            EmptySignature => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pushed_form_round_trip() {
        let sig = Signature::new(vec![0x30, 0x06, 0x02, 0x01, 0x01, 0x02, 0x01, 0x01],
            EcdsaSighashType::SinglePlusAnyoneCanPay);
        let pushed = sig.to_vec();
        assert_eq!(*pushed.last().unwrap(), 0x83);
        assert_eq!(Signature::from_slice(&pushed).unwrap(), sig);
    }

    #[test]
    fn nonstandard_type_byte_rejected() {
        assert!(matches!(Signature::from_slice(&[0x30, 0x00, 0x04]), Err(Error::SighashType(_))));
    }
}
