// SPDX-License-Identifier: CC0-1.0

//! BIP340 bitcoin signatures: a 64-byte schnorr signature paired with a
//! taproot sighash type, omitted on the wire when it is the default.

use std::error;
use std::fmt;

use crate::sighash::{InvalidSighashTypeError, TapSighashType};

/// A BIP340 signature with its taproot sighash type.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Signature {
    /// The 64-byte schnorr signature.
    pub signature: [u8; 64],
    /// The type of sighash this signature covers.
    pub sighash_type: TapSighashType,
}

impl Signature {
    /// Serializes to the witness element form: 64 bytes, with the sighash
    /// type byte appended unless it is [`TapSighashType::Default`].
    pub fn to_vec(&self) -> Vec<u8> {
        match self.sighash_type {
            TapSighashType::Default => self.signature.to_vec(),
            ty => {
                let mut out = Vec::with_capacity(65);
                out.extend_from_slice(&self.signature);
                out.push(ty as u8);
                out
            }
        }
    }

    /// Parses a signature from its witness element form.
    pub fn from_slice(bytes: &[u8]) -> Result<Signature, SigFromSliceError> {
        match bytes.len() {
            64 => {
                let mut signature = [0u8; 64];
                signature.copy_from_slice(bytes);
                Ok(Signature { signature, sighash_type: TapSighashType::Default })
            }
            65 => {
                let sighash_type = TapSighashType::from_consensus_u8(bytes[64])
                    .map_err(SigFromSliceError::SighashType)?;
                if sighash_type == TapSighashType::Default {
                    // Default must be implied by omission, not spelled out.
                    return Err(SigFromSliceError::SighashType(InvalidSighashTypeError(0)));
                }
                let mut signature = [0u8; 64];
                signature.copy_from_slice(&bytes[..64]);
                Ok(Signature { signature, sighash_type })
            }
            n => Err(SigFromSliceError::InvalidSignatureSize(n)),
        }
    }
}

/// An error constructing a taproot signature from a byte slice.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum SigFromSliceError {
    /// Invalid sighash type byte.
    SighashType(InvalidSighashTypeError),
    /// Invalid signature size.
    InvalidSignatureSize(usize),
}

impl fmt::Display for SigFromSliceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use SigFromSliceError::*;

        match *self {
            SighashType(ref e) => write!(f, "sighash type error: {}", e),
            InvalidSignatureSize(sz) => write!(f, "invalid taproot signature size: {}", sz),
        }
    }
}

impl error::Error for SigFromSliceError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        use SigFromSliceError::*;

        match *self {
            SighashType(ref e) => Some(e),
            InvalidSignatureSize(_) => None,
        }
    }
}
