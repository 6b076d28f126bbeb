// SPDX-License-Identifier: CC0-1.0

//! # PSBT signing substrate
//!
//! Building blocks for signing Bitcoin transactions carried in partially
//! signed transactions (BIP 174/371):
//!
//! * [`taproot`] — tagged hashes, script tree hashing, merkle path lookup and
//!   the control block codecs (BIP 341).
//! * [`sighash`] — legacy, segwit v0 (BIP 143) and taproot (BIP 341)
//!   signature hash computation with cached midstates.
//! * [`psbt`] — the input/output map subset needed for signing, prevout and
//!   fee caching, sighash selection per script class, and finalization.
//! * [`pool`] — a worker pool that signs batches of sighashes on OS threads
//!   with a bounded key-hold time, plus an in-process sequential fallback.
//!
//! Elliptic curve operations go through the [`crypto::backend::EcBackend`]
//! trait; the default implementation wraps [`secp256k1`].

// Coding conventions.
#![warn(missing_docs)]
#![deny(non_upper_case_globals)]
#![deny(non_camel_case_types)]
#![deny(non_snake_case)]
#![deny(unused_mut)]

pub mod consensus;
pub mod crypto;
pub mod pool;
pub mod psbt;
pub mod script;
pub mod sighash;
pub mod taproot;
pub mod transaction;
pub mod witness;

#[doc(inline)]
pub use crate::{
    crypto::backend::{EcBackend, LibsecpBackend},
    pool::{
        BatchSigningResult, PoolConfig, SequentialSigner, SignatureKind, SigningPool, SigningTask,
        WorkerPool,
    },
    psbt::{Input, Output, Psbt, PsbtCache, PsbtSighashType},
    script::{Script, ScriptBuf, ScriptClass},
    sighash::{EcdsaSighashType, Prevouts, SighashCache, TapSighashType},
    taproot::{
        ControlBlock, HashTree, MerkleControlBlock, TapLeaf, TapLeafHash, TapNodeHash, TapTree,
    },
    transaction::{OutPoint, Transaction, TxIn, TxOut, Txid},
    witness::Witness,
};
