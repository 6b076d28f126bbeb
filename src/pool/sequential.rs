// SPDX-License-Identifier: CC0-1.0

//! In-process batch signing.

use std::time::Instant;

use crate::crypto::backend::{EcBackend, LibsecpBackend};
use crate::pool::worker::sign_task;
use crate::pool::{BatchSigningResult, KeyGuard, PoolError, SigningPool, SigningTask, TaskOutcome};

/// Signs batches on the calling thread, one task at a time.
///
/// Same contract as [`crate::pool::WorkerPool`]: the caller's key buffer is
/// zeroed before `sign_batch` returns and a failing task never poisons its
/// siblings. For environments where spawning threads is unwanted.
pub struct SequentialSigner<B: EcBackend = LibsecpBackend> {
    backend: B,
}

impl SequentialSigner<LibsecpBackend> {
    /// Constructs a signer over the default backend.
    pub fn new() -> Self { SequentialSigner { backend: LibsecpBackend::new() } }
}

impl Default for SequentialSigner<LibsecpBackend> {
    fn default() -> Self { Self::new() }
}

impl<B: EcBackend> SequentialSigner<B> {
    /// Constructs a signer over a caller-supplied backend.
    pub fn with_backend(backend: B) -> Self { SequentialSigner { backend } }
}

impl<B: EcBackend> SigningPool for SequentialSigner<B> {
    fn sign_batch(
        &mut self,
        tasks: &[SigningTask],
        key: &mut [u8; 32],
    ) -> Result<BatchSigningResult, PoolError> {
        let start = Instant::now();
        let guard = KeyGuard::new(key);
        let outcomes = tasks
            .iter()
            .map(|task| TaskOutcome {
                task_id: task.task_id,
                input_index: task.input_index,
                result: sign_task(&self.backend, task, guard.bytes()),
            })
            .collect();
        drop(guard);
        Ok(BatchSigningResult::from_outcomes(outcomes, start.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::SignatureKind;
    use crate::sighash::EcdsaSighashType;

    const SK: [u8; 32] = [0x42; 32];

    fn tasks_for(backend: &LibsecpBackend, count: usize) -> Vec<SigningTask> {
        let public_key = backend.pubkey_from_seckey(&SK).unwrap().to_vec();
        (0..count)
            .map(|i| SigningTask {
                task_id: i as u64,
                input_index: i,
                sighash: [i as u8 + 1; 32],
                public_key: public_key.clone(),
                kind: SignatureKind::Ecdsa { low_r: true },
                sighash_type: EcdsaSighashType::All.into(),
                leaf_hash: None,
            })
            .collect()
    }

    #[test]
    fn signs_in_task_order_and_zeroes_the_key() {
        let backend = LibsecpBackend::new();
        let tasks = tasks_for(&backend, 5);
        let mut signer = SequentialSigner::new();
        let mut key = SK;

        let result = signer.sign_batch(&tasks, &mut key).unwrap();
        assert!(result.success);
        assert_eq!(result.outcomes.len(), 5);
        for (i, outcome) in result.outcomes.iter().enumerate() {
            assert_eq!(outcome.task_id, i as u64);
        }
        for task in &tasks {
            let sig = &result.signatures[&task.input_index];
            assert!(backend.verify_ecdsa(sig, &task.sighash, &task.public_key));
        }
        assert_eq!(key, [0; 32]);
    }

    #[test]
    fn per_task_errors_are_isolated() {
        let backend = LibsecpBackend::new();
        let mut tasks = tasks_for(&backend, 3);
        tasks[1].public_key = backend.pubkey_from_seckey(&[0x43; 32]).unwrap().to_vec();
        let mut signer = SequentialSigner::new();
        let mut key = SK;

        let result = signer.sign_batch(&tasks, &mut key).unwrap();
        assert!(!result.success);
        assert_eq!(result.signatures.len(), 2);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors.contains_key(&1));
        assert_eq!(key, [0; 32]);
    }

    #[test]
    fn key_zeroed_even_when_every_task_fails() {
        let backend = LibsecpBackend::new();
        let tasks = tasks_for(&backend, 2);
        let mut signer = SequentialSigner::new();
        // A key that derives to a different public key than the tasks name.
        let mut key = [0x43; 32];

        let result = signer.sign_batch(&tasks, &mut key).unwrap();
        assert!(!result.success);
        assert!(result.signatures.is_empty());
        assert_eq!(result.errors.len(), 2);
        assert_eq!(key, [0; 32]);
    }
}
