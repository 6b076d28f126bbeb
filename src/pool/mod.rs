// SPDX-License-Identifier: CC0-1.0

//! Batch signing pools.
//!
//! A batch of [`SigningTask`]s plus one private key goes in, a map of
//! signatures keyed by input index comes out. [`WorkerPool`] fans the batch
//! out over OS threads exchanging owned messages; [`SequentialSigner`] runs
//! the identical contract in-process for environments without threads. Both
//! zero the caller's key buffer on every exit path and isolate per-task
//! failures: one bad task never poisons its siblings.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use zeroize::Zeroize;

use crate::psbt::PsbtSighashType;
use crate::taproot::TapLeafHash;

mod parallel;
mod sequential;
mod worker;

pub use self::parallel::{PoolConfig, PoolError, WorkerPool};
pub use self::sequential::SequentialSigner;

/// Which signature algorithm a task needs.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SignatureKind {
    /// DER-encoded ECDSA over secp256k1.
    Ecdsa {
        /// Grind the nonce until the signature's R value is low, shaving one
        /// byte off the DER encoding.
        low_r: bool,
    },
    /// 64-byte BIP340 schnorr.
    Schnorr,
}

/// One unit of signing work. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningTask {
    /// Batch-unique task id.
    pub task_id: u64,
    /// The PSBT input this signature is for.
    pub input_index: usize,
    /// The 32-byte message to sign.
    pub sighash: [u8; 32],
    /// The expected public key: 33-byte compressed for ECDSA, 32-byte x-only
    /// for schnorr. Workers refuse to sign when the supplied private key does
    /// not derive to this.
    pub public_key: Vec<u8>,
    /// Signature algorithm.
    pub kind: SignatureKind,
    /// The sighash type the signature will be labeled with.
    pub sighash_type: PsbtSighashType,
    /// For taproot script-path tasks, the leaf being satisfied.
    pub leaf_hash: Option<TapLeafHash>,
}

/// The result of signing a single task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskOutcome {
    /// The task this outcome belongs to.
    pub task_id: u64,
    /// The task's input index.
    pub input_index: usize,
    /// The signature bytes, or a human-readable error.
    pub result: Result<Vec<u8>, String>,
}

/// The merged result of one `sign_batch` call.
///
/// Every submitted input index appears in exactly one of `signatures` and
/// `errors`; `success` holds if and only if `errors` is empty, so partial
/// success is representable and preserved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchSigningResult {
    /// Whether every task signed successfully.
    pub success: bool,
    /// Signature bytes keyed by input index.
    pub signatures: BTreeMap<usize, Vec<u8>>,
    /// Error messages keyed by input index.
    pub errors: BTreeMap<usize, String>,
    /// Per-task outcomes, for callers submitting several tasks against the
    /// same input (one per taproot leaf).
    pub outcomes: Vec<TaskOutcome>,
    /// Wall-clock time the batch took.
    pub duration: Duration,
}

impl BatchSigningResult {
    pub(crate) fn from_outcomes(mut outcomes: Vec<TaskOutcome>, duration: Duration) -> Self {
        outcomes.sort_by_key(|outcome| outcome.task_id);
        let mut signatures = BTreeMap::new();
        let mut errors = BTreeMap::new();
        for outcome in &outcomes {
            match outcome.result {
                Ok(ref sig) => {
                    // An earlier error for the same input wins: the index
                    // must not appear in both maps.
                    if !errors.contains_key(&outcome.input_index) {
                        signatures.insert(outcome.input_index, sig.clone());
                    }
                }
                Err(ref message) => {
                    signatures.remove(&outcome.input_index);
                    errors.insert(outcome.input_index, message.clone());
                }
            }
        }
        BatchSigningResult { success: errors.is_empty(), signatures, errors, outcomes, duration }
    }
}

/// The common batch signing contract of [`WorkerPool`] and
/// [`SequentialSigner`].
pub trait SigningPool {
    /// Signs every task in `tasks` with `key`.
    ///
    /// The key buffer is zeroed before this returns, on success and on
    /// failure alike.
    fn sign_batch(
        &mut self,
        tasks: &[SigningTask],
        key: &mut [u8; 32],
    ) -> Result<BatchSigningResult, PoolError>;
}

/// Zeroes the borrowed key buffer on drop, covering every exit path of
/// `sign_batch` including panics.
pub(crate) struct KeyGuard<'a> {
    key: &'a mut [u8; 32],
}

impl<'a> KeyGuard<'a> {
    pub(crate) fn new(key: &'a mut [u8; 32]) -> Self { KeyGuard { key } }

    pub(crate) fn bytes(&self) -> &[u8; 32] { self.key }
}

impl fmt::Debug for KeyGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { f.write_str("KeyGuard") }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) { self.key.zeroize(); }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(task_id: u64, input_index: usize, result: Result<Vec<u8>, String>) -> TaskOutcome {
        TaskOutcome { task_id, input_index, result }
    }

    #[test]
    fn success_iff_errors_empty() {
        let result = BatchSigningResult::from_outcomes(
            vec![outcome(0, 0, Ok(vec![1])), outcome(1, 1, Ok(vec![2]))],
            Duration::ZERO,
        );
        assert!(result.success);
        assert_eq!(result.signatures.len(), 2);

        let result = BatchSigningResult::from_outcomes(
            vec![outcome(0, 0, Ok(vec![1])), outcome(1, 1, Err("boom".into()))],
            Duration::ZERO,
        );
        assert!(!result.success);
        assert_eq!(result.signatures.len(), 1);
        assert_eq!(result.errors.len(), 1);
    }

    #[test]
    fn input_index_never_in_both_maps() {
        // Two tasks against the same input, one failing.
        let result = BatchSigningResult::from_outcomes(
            vec![outcome(0, 3, Ok(vec![1])), outcome(1, 3, Err("boom".into()))],
            Duration::ZERO,
        );
        assert!(result.errors.contains_key(&3));
        assert!(!result.signatures.contains_key(&3));

        let result = BatchSigningResult::from_outcomes(
            vec![outcome(0, 3, Err("boom".into())), outcome(1, 3, Ok(vec![1]))],
            Duration::ZERO,
        );
        assert!(result.errors.contains_key(&3));
        assert!(!result.signatures.contains_key(&3));
    }

    #[test]
    fn key_guard_zeroes_on_drop() {
        let mut key = [0xAA; 32];
        {
            let guard = KeyGuard::new(&mut key);
            assert_eq!(guard.bytes(), &[0xAA; 32]);
        }
        assert_eq!(key, [0; 32]);
    }
}
