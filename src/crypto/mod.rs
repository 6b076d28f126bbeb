// SPDX-License-Identifier: CC0-1.0

//! Cryptography.
//!
//! Elliptic curve operations behind the [`backend::EcBackend`] seam, plus the
//! signature wrappers that pair raw signatures with their sighash type.

pub mod backend;
pub mod ecdsa;
pub mod taproot;
