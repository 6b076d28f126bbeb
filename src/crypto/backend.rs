// SPDX-License-Identifier: CC0-1.0

//! The elliptic curve backend seam.
//!
//! Everything that touches curve arithmetic — tweaking, signing, verifying —
//! goes through [`EcBackend`] so the signing pool can be parameterized over
//! the implementation at compile time. Keys and signatures cross the seam as
//! plain byte arrays; the wrapper types of the embedding library never do.

use std::error;
use std::fmt;

use secp256k1::{ecdsa, schnorr, All, Keypair, Message, PublicKey, Scalar, Secp256k1, SecretKey};

/// An x-only public key together with the parity of its full point.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TweakedKey {
    /// The 32-byte x-only key.
    pub x_only: [u8; 32],
    /// Parity of the point: 0 even, 1 odd.
    pub parity: u8,
}

/// Elliptic curve operations required for signing.
///
/// Implementations must be cheap to construct via [`Default`] since the pool
/// builds one per worker thread.
pub trait EcBackend {
    /// Adds `tweak * G` to the point behind `key`.
    ///
    /// Returns `None` when the tweak is out of range or the result is the
    /// point at infinity.
    fn x_only_add_tweak(&self, key: &[u8; 32], tweak: &[u8; 32]) -> Option<TweakedKey>;

    /// Verifies that `output` with `parity` is `internal + tweak * G`.
    fn x_only_tweak_check(
        &self,
        internal: &[u8; 32],
        output: &[u8; 32],
        parity: u8,
        tweak: &[u8; 32],
    ) -> bool;

    /// Derives the x-only public key of `seckey`.
    fn x_only_from_seckey(&self, seckey: &[u8; 32]) -> Result<TweakedKey, BackendError>;

    /// Derives the compressed public key of `seckey`.
    fn pubkey_from_seckey(&self, seckey: &[u8; 32]) -> Result<[u8; 33], BackendError>;

    /// Tweaks `seckey` so that its x-only public key becomes
    /// `x_only(seckey) + tweak * G`, negating first when the point is odd.
    fn tweak_seckey(&self, seckey: &[u8; 32], tweak: &[u8; 32]) -> Result<[u8; 32], BackendError>;

    /// Produces a 64-byte BIP340 signature over `msg`.
    fn sign_schnorr(&self, msg: &[u8; 32], seckey: &[u8; 32]) -> Result<[u8; 64], BackendError>;

    /// Verifies a BIP340 signature.
    fn verify_schnorr(&self, sig: &[u8; 64], msg: &[u8; 32], pubkey: &[u8; 32]) -> bool;

    /// Produces a DER-encoded ECDSA signature over `msg`, optionally grinding
    /// for a low-R nonce.
    fn sign_ecdsa(
        &self,
        msg: &[u8; 32],
        seckey: &[u8; 32],
        low_r: bool,
    ) -> Result<Vec<u8>, BackendError>;

    /// Verifies a DER-encoded ECDSA signature against a serialized pubkey.
    fn verify_ecdsa(&self, sig: &[u8], msg: &[u8; 32], pubkey: &[u8]) -> bool;
}

/// The default backend, wrapping a [`secp256k1`] context.
pub struct LibsecpBackend {
    secp: Secp256k1<All>,
}

impl LibsecpBackend {
    /// Constructs a backend with a fresh all-capabilities context.
    pub fn new() -> Self { LibsecpBackend { secp: Secp256k1::new() } }

    /// Borrows the underlying context.
    pub fn secp(&self) -> &Secp256k1<All> { &self.secp }
}

impl Default for LibsecpBackend {
    fn default() -> Self { Self::new() }
}

impl fmt::Debug for LibsecpBackend {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("LibsecpBackend")
    }
}

impl EcBackend for LibsecpBackend {
    fn x_only_add_tweak(&self, key: &[u8; 32], tweak: &[u8; 32]) -> Option<TweakedKey> {
        let key = secp256k1::XOnlyPublicKey::from_slice(key).ok()?;
        let scalar = Scalar::from_be_bytes(*tweak).ok()?;
        let (tweaked, parity) = key.add_tweak(&self.secp, &scalar).ok()?;
        Some(TweakedKey { x_only: tweaked.serialize(), parity: parity.to_u8() })
    }

    fn x_only_tweak_check(
        &self,
        internal: &[u8; 32],
        output: &[u8; 32],
        parity: u8,
        tweak: &[u8; 32],
    ) -> bool {
        let internal = match secp256k1::XOnlyPublicKey::from_slice(internal) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let output = match secp256k1::XOnlyPublicKey::from_slice(output) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let parity = match secp256k1::Parity::from_u8(parity) {
            Ok(parity) => parity,
            Err(_) => return false,
        };
        let scalar = match Scalar::from_be_bytes(*tweak) {
            Ok(scalar) => scalar,
            Err(_) => return false,
        };
        internal.tweak_add_check(&self.secp, &output, parity, scalar)
    }

    fn x_only_from_seckey(&self, seckey: &[u8; 32]) -> Result<TweakedKey, BackendError> {
        let mut keypair = Keypair::from_seckey_slice(&self.secp, seckey)?;
        let (key, parity) = keypair.x_only_public_key();
        keypair.non_secure_erase();
        Ok(TweakedKey { x_only: key.serialize(), parity: parity.to_u8() })
    }

    fn pubkey_from_seckey(&self, seckey: &[u8; 32]) -> Result<[u8; 33], BackendError> {
        let mut sk = SecretKey::from_slice(seckey)?;
        let pk = PublicKey::from_secret_key(&self.secp, &sk);
        sk.non_secure_erase();
        Ok(pk.serialize())
    }

    fn tweak_seckey(&self, seckey: &[u8; 32], tweak: &[u8; 32]) -> Result<[u8; 32], BackendError> {
        let scalar =
            Scalar::from_be_bytes(*tweak).map_err(|_| secp256k1::Error::InvalidTweak)?;
        let mut keypair = Keypair::from_seckey_slice(&self.secp, seckey)?;
        let result = keypair.add_xonly_tweak(&self.secp, &scalar);
        keypair.non_secure_erase();
        let mut tweaked = result?;
        let bytes = tweaked.secret_bytes();
        tweaked.non_secure_erase();
        Ok(bytes)
    }

    fn sign_schnorr(&self, msg: &[u8; 32], seckey: &[u8; 32]) -> Result<[u8; 64], BackendError> {
        let mut keypair = Keypair::from_seckey_slice(&self.secp, seckey)?;
        let sig = self.secp.sign_schnorr_no_aux_rand(&Message::from_digest(*msg), &keypair);
        keypair.non_secure_erase();
        Ok(sig.serialize())
    }

    fn verify_schnorr(&self, sig: &[u8; 64], msg: &[u8; 32], pubkey: &[u8; 32]) -> bool {
        let key = match secp256k1::XOnlyPublicKey::from_slice(pubkey) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let sig = match schnorr::Signature::from_slice(sig) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        self.secp.verify_schnorr(&sig, &Message::from_digest(*msg), &key).is_ok()
    }

    fn sign_ecdsa(
        &self,
        msg: &[u8; 32],
        seckey: &[u8; 32],
        low_r: bool,
    ) -> Result<Vec<u8>, BackendError> {
        let mut sk = SecretKey::from_slice(seckey)?;
        let msg = Message::from_digest(*msg);
        let sig = if low_r {
            self.secp.sign_ecdsa_low_r(&msg, &sk)
        } else {
            self.secp.sign_ecdsa(&msg, &sk)
        };
        sk.non_secure_erase();
        Ok(sig.serialize_der().to_vec())
    }

    fn verify_ecdsa(&self, sig: &[u8], msg: &[u8; 32], pubkey: &[u8]) -> bool {
        let key = match PublicKey::from_slice(pubkey) {
            Ok(key) => key,
            Err(_) => return false,
        };
        let sig = match ecdsa::Signature::from_der(sig) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        self.secp.verify_ecdsa(&Message::from_digest(*msg), &sig, &key).is_ok()
    }
}

/// An error reported by the elliptic curve backend.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct BackendError(secp256k1::Error);

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ec backend: {}", self.0)
    }
}

impl error::Error for BackendError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> { Some(&self.0) }
}

impl From<secp256k1::Error> for BackendError {
    fn from(e: secp256k1::Error) -> Self { BackendError(e) }
}
