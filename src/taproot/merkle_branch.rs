// SPDX-License-Identifier: CC0-1.0

//! Contains the merkle path from a tapscript leaf up to the root of the
//! script tree, bounded by the BIP341 depth limit.

use hashes::Hash;

use super::{
    TapNodeHash, TaprootError, TAPROOT_CONTROL_MAX_NODE_COUNT, TAPROOT_CONTROL_NODE_SIZE,
};

/// The merkle proof for inclusion of a tree in a taptree hash.
///
/// Sibling hashes ordered from the leaf outward: element 0 is the leaf's
/// direct sibling, the last element hangs directly off the root.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaprootMerkleBranch(Vec<TapNodeHash>);

impl TaprootMerkleBranch {
    /// Returns a reference to the slice of hashes.
    #[inline]
    pub fn as_slice(&self) -> &[TapNodeHash] { &self.0 }

    /// Returns the number of nodes in the branch.
    #[inline]
    pub fn len(&self) -> usize { self.0.len() }

    /// Checks if the branch is empty (the leaf is the root).
    #[inline]
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Decodes a branch from its control-block encoding: a concatenation of
    /// 32-byte node hashes.
    pub fn decode(sl: &[u8]) -> Result<Self, TaprootError> {
        if sl.len() % TAPROOT_CONTROL_NODE_SIZE != 0 {
            Err(TaprootError::InvalidMerkleBranchSize(sl.len()))
        } else if sl.len() > TAPROOT_CONTROL_NODE_SIZE * TAPROOT_CONTROL_MAX_NODE_COUNT {
            Err(TaprootError::InvalidMerkleTreeDepth(sl.len() / TAPROOT_CONTROL_NODE_SIZE))
        } else {
            let inner = sl
                .chunks_exact(TAPROOT_CONTROL_NODE_SIZE)
                .map(|chunk| {
                    TapNodeHash::from_slice(chunk)
                        .expect("chunks_exact always returns the correct size")
                })
                .collect();
            Ok(TaprootMerkleBranch(inner))
        }
    }

    /// Serializes to the control-block encoding.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.0.len() * TAPROOT_CONTROL_NODE_SIZE);
        for hash in &self.0 {
            out.extend_from_slice(hash.as_ref());
        }
        out
    }

    /// Appends a sibling hash, failing if the branch is already at the
    /// maximum depth.
    pub fn push(&mut self, hash: TapNodeHash) -> Result<(), TaprootError> {
        if self.0.len() >= TAPROOT_CONTROL_MAX_NODE_COUNT {
            Err(TaprootError::InvalidMerkleTreeDepth(self.0.len()))
        } else {
            self.0.push(hash);
            Ok(())
        }
    }

    /// Iterates the sibling hashes leaf to root.
    pub fn iter(&self) -> core::slice::Iter<'_, TapNodeHash> { self.0.iter() }
}

impl TryFrom<Vec<TapNodeHash>> for TaprootMerkleBranch {
    type Error = TaprootError;

    fn try_from(v: Vec<TapNodeHash>) -> Result<Self, Self::Error> {
        if v.len() > TAPROOT_CONTROL_MAX_NODE_COUNT {
            Err(TaprootError::InvalidMerkleTreeDepth(v.len()))
        } else {
            Ok(TaprootMerkleBranch(v))
        }
    }
}

impl<'a> IntoIterator for &'a TaprootMerkleBranch {
    type Item = &'a TapNodeHash;
    type IntoIter = core::slice::Iter<'a, TapNodeHash>;

    fn into_iter(self) -> Self::IntoIter { self.0.iter() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_partial_nodes() {
        assert!(matches!(
            TaprootMerkleBranch::decode(&[0u8; 33]),
            Err(TaprootError::InvalidMerkleBranchSize(33))
        ));
    }

    #[test]
    fn decode_rejects_excessive_depth() {
        let bytes = vec![0u8; 32 * 129];
        assert!(matches!(
            TaprootMerkleBranch::decode(&bytes),
            Err(TaprootError::InvalidMerkleTreeDepth(129))
        ));
    }

    #[test]
    fn serialize_round_trips() {
        let bytes: Vec<u8> = (0u8..64).collect();
        let branch = TaprootMerkleBranch::decode(&bytes).unwrap();
        assert_eq!(branch.len(), 2);
        assert_eq!(branch.serialize(), bytes);
    }

    #[test]
    fn push_enforces_depth_limit() {
        let mut branch = TaprootMerkleBranch::default();
        let node = TapNodeHash::from_byte_array([1u8; 32]);
        for _ in 0..TAPROOT_CONTROL_MAX_NODE_COUNT {
            branch.push(node).unwrap();
        }
        assert!(branch.push(node).is_err());
    }
}
