// SPDX-License-Identifier: CC0-1.0

//! Worker-side signing.
//!
//! A worker receives whole sub-batches as owned messages, holds its key copy
//! only for the duration of one sub-batch and zeroes it before the results
//! leave the thread.

use std::sync::mpsc::{Receiver, Sender};

use zeroize::Zeroizing;

use crate::crypto::backend::EcBackend;
use crate::pool::{SignatureKind, SigningTask, TaskOutcome};

/// Messages a worker accepts.
pub(crate) enum WorkerRequest {
    /// Sign a sub-batch of tasks with the enclosed key copy.
    SignBatch {
        batch_id: u64,
        tasks: Vec<SigningTask>,
        key: Zeroizing<[u8; 32]>,
    },
    /// Finish the current work and exit.
    Shutdown,
}

/// Messages a worker emits on the shared response channel.
pub(crate) enum WorkerResponse {
    /// The worker's backend is built and it accepts batches.
    Ready { worker_id: usize },
    /// The outcomes of one sub-batch.
    BatchResult {
        worker_id: usize,
        batch_id: u64,
        outcomes: Vec<TaskOutcome>,
    },
    /// Acknowledges a [`WorkerRequest::Shutdown`].
    ShutdownAck { worker_id: usize },
}

/// The body of a worker thread.
///
/// Exits when told to shut down or when either channel end disconnects.
pub(crate) fn worker_main<B: EcBackend + Default>(
    worker_id: usize,
    requests: Receiver<WorkerRequest>,
    responses: Sender<WorkerResponse>,
) {
    let backend = B::default();
    if responses.send(WorkerResponse::Ready { worker_id }).is_err() {
        return;
    }
    loop {
        match requests.recv() {
            Ok(WorkerRequest::SignBatch { batch_id, tasks, key }) => {
                let outcomes = tasks
                    .iter()
                    .map(|task| TaskOutcome {
                        task_id: task.task_id,
                        input_index: task.input_index,
                        result: sign_task(&backend, task, &key),
                    })
                    .collect();
                // The key copy is zeroed here, before any result leaves the
                // thread.
                drop(key);
                let sent = responses.send(WorkerResponse::BatchResult {
                    worker_id,
                    batch_id,
                    outcomes,
                });
                if sent.is_err() {
                    return;
                }
            }
            Ok(WorkerRequest::Shutdown) => {
                let _ = responses.send(WorkerResponse::ShutdownAck { worker_id });
                return;
            }
            Err(_) => return,
        }
    }
}

/// Signs one task, first checking that `seckey` derives to the task's
/// expected public key.
pub(crate) fn sign_task<B: EcBackend>(
    backend: &B,
    task: &SigningTask,
    seckey: &[u8; 32],
) -> Result<Vec<u8>, String> {
    match task.kind {
        SignatureKind::Ecdsa { low_r } => {
            let derived = backend.pubkey_from_seckey(seckey).map_err(|e| e.to_string())?;
            if derived[..] != task.public_key[..] {
                return Err(format!(
                    "key does not derive to the expected public key for input {}",
                    task.input_index
                ));
            }
            backend.sign_ecdsa(&task.sighash, seckey, low_r).map_err(|e| e.to_string())
        }
        SignatureKind::Schnorr => {
            let derived = backend.x_only_from_seckey(seckey).map_err(|e| e.to_string())?;
            if derived.x_only[..] != task.public_key[..] {
                return Err(format!(
                    "key does not derive to the expected public key for input {}",
                    task.input_index
                ));
            }
            backend
                .sign_schnorr(&task.sighash, seckey)
                .map(|sig| sig.to_vec())
                .map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::backend::LibsecpBackend;
    use crate::psbt::PsbtSighashType;
    use crate::sighash::EcdsaSighashType;

    const SK: [u8; 32] = [0x42; 32];

    fn ecdsa_task(backend: &LibsecpBackend) -> SigningTask {
        SigningTask {
            task_id: 0,
            input_index: 0,
            sighash: [0x11; 32],
            public_key: backend.pubkey_from_seckey(&SK).unwrap().to_vec(),
            kind: SignatureKind::Ecdsa { low_r: true },
            sighash_type: EcdsaSighashType::All.into(),
            leaf_hash: None,
        }
    }

    #[test]
    fn sign_task_verifies_against_the_expected_key() {
        let backend = LibsecpBackend::new();
        let task = ecdsa_task(&backend);
        let sig = sign_task(&backend, &task, &SK).unwrap();
        assert!(backend.verify_ecdsa(&sig, &task.sighash, &task.public_key));
    }

    #[test]
    fn sign_task_rejects_a_mismatched_key() {
        let backend = LibsecpBackend::new();
        let task = ecdsa_task(&backend);
        let err = sign_task(&backend, &task, &[0x43; 32]).unwrap_err();
        assert!(err.contains("does not derive"));
    }

    #[test]
    fn schnorr_task_signs_with_the_x_only_key() {
        let backend = LibsecpBackend::new();
        let x_only = backend.x_only_from_seckey(&SK).unwrap().x_only;
        let task = SigningTask {
            task_id: 1,
            input_index: 2,
            sighash: [0x22; 32],
            public_key: x_only.to_vec(),
            kind: SignatureKind::Schnorr,
            sighash_type: PsbtSighashType::from_u32(0),
            leaf_hash: None,
        };
        let sig = sign_task(&backend, &task, &SK).unwrap();
        let sig: [u8; 64] = sig.as_slice().try_into().unwrap();
        assert!(backend.verify_schnorr(&sig, &task.sighash, &x_only));
    }
}
