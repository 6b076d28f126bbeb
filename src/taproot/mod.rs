// SPDX-License-Identifier: CC0-1.0

//! Taproot.
//!
//! The BIP341 script commitment machinery: tagged hashes, hashing of the
//! script tree, merkle path lookup for a target leaf, the control block
//! codecs and output key tweaking.

use std::fmt;

use hashes::{sha256t_hash_newtype, Hash, HashEngine};
use secp256k1::{Parity, XOnlyPublicKey};

use crate::consensus::Encodable;
use crate::crypto::backend::{BackendError, EcBackend, TweakedKey};
use crate::script::{Script, ScriptBuf};

pub mod merkle_branch;

pub use self::merkle_branch::TaprootMerkleBranch;

// Taproot test vectors from BIP-0341 state the hashes without any reversing
sha256t_hash_newtype! {
    /// The tag for a tapleaf hash.
    pub struct TapLeafTag = hash_str("TapLeaf");

    /// Taproot-tagged hash with tag "TapLeaf".
    ///
    /// This is used for computing tapscript script spend hash.
    #[hash_newtype(forward)]
    pub struct TapLeafHash(_);

    /// The tag for a taptree node hash.
    pub struct TapBranchTag = hash_str("TapBranch");

    /// Tagged hash used in taproot trees.
    #[hash_newtype(forward)]
    pub struct TapNodeHash(_);

    /// The tag for a taproot tweak hash.
    pub struct TapTweakTag = hash_str("TapTweak");

    /// Taproot-tagged hash with tag "TapTweak".
    ///
    /// This hash is used for tweaking the internal key into the output key.
    #[hash_newtype(forward)]
    pub struct TapTweakHash(_);
}

/// The maximum allowed depth of a taproot merkle tree.
pub const TAPROOT_CONTROL_MAX_NODE_COUNT: usize = 128;
/// The size of a merkle node hash in a control block.
pub const TAPROOT_CONTROL_NODE_SIZE: usize = 32;
/// The control block base size: initial byte plus the internal key.
pub const TAPROOT_CONTROL_BASE_SIZE: usize = 33;
/// The maximum size of a key-bearing control block.
pub const TAPROOT_CONTROL_MAX_SIZE: usize =
    TAPROOT_CONTROL_BASE_SIZE + TAPROOT_CONTROL_NODE_SIZE * TAPROOT_CONTROL_MAX_NODE_COUNT;
/// The mask extracting the leaf version bits of a control block's first byte.
pub const TAPROOT_LEAF_MASK: u8 = 0xfe;
/// The tapscript leaf version.
pub const TAPROOT_LEAF_TAPSCRIPT: u8 = 0xc0;
/// The annex marker byte.
pub const TAPROOT_ANNEX_PREFIX: u8 = 0x50;

impl TapTweakHash {
    /// Computes the BIP341 tweak committing to the internal key and the
    /// optional script tree merkle root.
    pub fn from_key_and_tweak(internal_key: &[u8; 32], merkle_root: Option<TapNodeHash>) -> Self {
        let mut eng = TapTweakHash::engine();
        eng.input(internal_key);
        if let Some(root) = merkle_root {
            eng.input(root.as_ref());
        }
        TapTweakHash::from_engine(eng)
    }
}

impl TapLeafHash {
    /// Computes the leaf hash from its script and leaf version.
    pub fn from_script(script: &Script, ver: LeafVersion) -> Self {
        let mut eng = TapLeafHash::engine();
        ver.to_consensus()
            .consensus_encode(&mut eng)
            .expect("hash engines do not error");
        script.consensus_encode(&mut eng).expect("hash engines do not error");
        TapLeafHash::from_engine(eng)
    }
}

impl From<TapLeafHash> for TapNodeHash {
    fn from(leaf: TapLeafHash) -> TapNodeHash { TapNodeHash::from_byte_array(leaf.to_byte_array()) }
}

impl TapNodeHash {
    /// Computes the branch hash of two child nodes, sorting them ascending by
    /// raw byte comparison first.
    pub fn from_node_hashes(a: TapNodeHash, b: TapNodeHash) -> TapNodeHash {
        let mut eng = TapNodeHash::engine();
        if a < b {
            eng.input(a.as_ref());
            eng.input(b.as_ref());
        } else {
            eng.input(b.as_ref());
            eng.input(a.as_ref());
        }
        TapNodeHash::from_engine(eng)
    }

    /// Computes the node hash of a leaf directly from its script.
    pub fn from_script(script: &Script, ver: LeafVersion) -> TapNodeHash {
        TapNodeHash::from(TapLeafHash::from_script(script, ver))
    }
}

/// A tapscript leaf: a script together with its leaf version.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TapLeaf {
    /// The leaf script.
    pub script: ScriptBuf,
    /// The leaf version, `0xc0` for tapscript.
    pub version: LeafVersion,
}

impl TapLeaf {
    /// Constructs a tapscript (version `0xc0`) leaf.
    pub fn new(script: ScriptBuf) -> Self { TapLeaf { script, version: LeafVersion::TapScript } }

    /// Constructs a leaf with an explicit version.
    pub fn with_version(script: ScriptBuf, version: LeafVersion) -> Self {
        TapLeaf { script, version }
    }

    /// The leaf's tagged hash.
    pub fn leaf_hash(&self) -> TapLeafHash { TapLeafHash::from_script(&self.script, self.version) }
}

/// A caller-authored binary script tree.
///
/// Branch ordering does not affect any hash: children are sorted by hash
/// value before being combined.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TapTree {
    /// A terminal script leaf.
    Leaf(TapLeaf),
    /// An inner node with exactly two children.
    Branch(Box<TapTree>, Box<TapTree>),
}

impl TapTree {
    /// Constructs a tapscript leaf node.
    pub fn leaf(script: ScriptBuf) -> Self { TapTree::Leaf(TapLeaf::new(script)) }

    /// Constructs a branch over two subtrees.
    pub fn branch(left: TapTree, right: TapTree) -> Self {
        TapTree::Branch(Box::new(left), Box::new(right))
    }
}

/// A script tree annotated with the computed node hash at every node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum HashTree {
    /// A leaf carrying its leaf hash (a leaf's node hash equals its leaf
    /// hash).
    Leaf(TapNodeHash),
    /// An inner node carrying its branch hash.
    Branch {
        /// Hash of the two sorted child hashes.
        hash: TapNodeHash,
        /// Left child as authored; ordering is irrelevant for hashes.
        left: Box<HashTree>,
        /// Right child as authored.
        right: Box<HashTree>,
    },
}

impl HashTree {
    /// Hashes a [`TapTree`], enforcing the BIP341 depth limit.
    pub fn from_tree(tree: &TapTree) -> Result<HashTree, TaprootError> {
        Self::from_tree_at_depth(tree, 0)
    }

    fn from_tree_at_depth(tree: &TapTree, depth: usize) -> Result<HashTree, TaprootError> {
        if depth > TAPROOT_CONTROL_MAX_NODE_COUNT {
            return Err(TaprootError::InvalidMerkleTreeDepth(depth));
        }
        match tree {
            TapTree::Leaf(leaf) => Ok(HashTree::Leaf(TapNodeHash::from(leaf.leaf_hash()))),
            TapTree::Branch(left, right) => {
                let left = Self::from_tree_at_depth(left, depth + 1)?;
                let right = Self::from_tree_at_depth(right, depth + 1)?;
                let hash = TapNodeHash::from_node_hashes(left.hash(), right.hash());
                Ok(HashTree::Branch { hash, left: Box::new(left), right: Box::new(right) })
            }
        }
    }

    /// The hash at this node: the merkle root when called on the tree root.
    pub fn hash(&self) -> TapNodeHash {
        match *self {
            HashTree::Leaf(hash) => hash,
            HashTree::Branch { hash, .. } => hash,
        }
    }

    /// Finds the merkle path proving inclusion of `target`.
    ///
    /// Sibling hashes are collected leaf to root as the search unwinds.
    /// Returns `None` when no leaf in the tree hashes to `target`.
    pub fn script_path(&self, target: TapLeafHash) -> Option<TaprootMerkleBranch> {
        let mut path = Vec::new();
        if self.search(TapNodeHash::from(target), &mut path) {
            // Depth was bounded at construction so the conversion holds.
            TaprootMerkleBranch::try_from(path).ok()
        } else {
            None
        }
    }

    fn search(&self, target: TapNodeHash, path: &mut Vec<TapNodeHash>) -> bool {
        match self {
            HashTree::Leaf(hash) => *hash == target,
            HashTree::Branch { left, right, .. } => {
                if left.search(target, path) {
                    path.push(right.hash());
                    true
                } else if right.search(target, path) {
                    path.push(left.hash());
                    true
                } else {
                    false
                }
            }
        }
    }
}

/// The leaf version of a tapleaf.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LeafVersion {
    /// BIP-342 tapscript.
    TapScript,
    /// Future leaf version.
    Future(FutureLeafVersion),
}

impl LeafVersion {
    /// Constructs a [`LeafVersion`] from its consensus byte representation.
    ///
    /// # Errors
    ///
    /// - If the last bit of the `version` is odd.
    /// - If `version` is 0x50 ([`TAPROOT_ANNEX_PREFIX`]).
    pub fn from_consensus(version: u8) -> Result<Self, TaprootError> {
        match version {
            TAPROOT_LEAF_TAPSCRIPT => Ok(LeafVersion::TapScript),
            TAPROOT_ANNEX_PREFIX => Err(TaprootError::InvalidTaprootLeafVersion(version)),
            odd if odd & 0x01 == 1 => Err(TaprootError::InvalidTaprootLeafVersion(version)),
            even => Ok(LeafVersion::Future(FutureLeafVersion(even))),
        }
    }

    /// Returns the consensus byte representation.
    pub fn to_consensus(self) -> u8 {
        match self {
            LeafVersion::TapScript => TAPROOT_LEAF_TAPSCRIPT,
            LeafVersion::Future(version) => version.0,
        }
    }
}

impl fmt::Display for LeafVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:#04x}", self.to_consensus())
    }
}

/// Inner type representing future (non-tapscript) leaf versions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FutureLeafVersion(u8);

impl fmt::Display for FutureLeafVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result { write!(f, "{:#04x}", self.0) }
}

/// The key-bearing control block revealed in a taproot script spend
/// (`1 + 32 + 32m` bytes).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ControlBlock {
    /// The tapleaf version.
    pub leaf_version: LeafVersion,
    /// The parity of the output key.
    pub output_key_parity: Parity,
    /// The internal key.
    pub internal_key: XOnlyPublicKey,
    /// The merkle proof of the script's inclusion.
    pub merkle_branch: TaprootMerkleBranch,
}

impl ControlBlock {
    /// Decodes a control block from its witness element encoding.
    ///
    /// Any length that is not `33 + 32m` with `m <= 128` is rejected before
    /// the contents are looked at.
    pub fn decode(sl: &[u8]) -> Result<ControlBlock, TaprootError> {
        if sl.len() < TAPROOT_CONTROL_BASE_SIZE
            || (sl.len() - TAPROOT_CONTROL_BASE_SIZE) % TAPROOT_CONTROL_NODE_SIZE != 0
        {
            return Err(TaprootError::InvalidControlBlockSize(sl.len()));
        }
        let output_key_parity = if sl[0] & 1 == 0 { Parity::Even } else { Parity::Odd };
        let leaf_version = LeafVersion::from_consensus(sl[0] & TAPROOT_LEAF_MASK)?;
        let internal_key = XOnlyPublicKey::from_slice(&sl[1..TAPROOT_CONTROL_BASE_SIZE])
            .map_err(TaprootError::InvalidInternalKey)?;
        let merkle_branch = TaprootMerkleBranch::decode(&sl[TAPROOT_CONTROL_BASE_SIZE..])?;
        Ok(ControlBlock { leaf_version, output_key_parity, internal_key, merkle_branch })
    }

    /// Constructs the control block proving `leaf` is committed to by `tree`.
    ///
    /// Returns `None` when the leaf is not in the tree.
    pub fn for_leaf(
        internal_key: XOnlyPublicKey,
        output_key_parity: Parity,
        leaf: &TapLeaf,
        tree: &HashTree,
    ) -> Option<ControlBlock> {
        let merkle_branch = tree.script_path(leaf.leaf_hash())?;
        Some(ControlBlock {
            leaf_version: leaf.version,
            output_key_parity,
            internal_key,
            merkle_branch,
        })
    }

    /// The serialized size of the control block.
    pub fn size(&self) -> usize {
        TAPROOT_CONTROL_BASE_SIZE + TAPROOT_CONTROL_NODE_SIZE * self.merkle_branch.len()
    }

    /// Serializes to the witness element encoding.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        let first_byte: u8 = self.output_key_parity.to_u8() | self.leaf_version.to_consensus();
        buf.push(first_byte);
        buf.extend_from_slice(&self.internal_key.serialize());
        buf.extend_from_slice(&self.merkle_branch.serialize());
        buf
    }

    /// Folds the merkle branch upward from `leaf_hash`, returning the merkle
    /// root the control block commits to.
    pub fn root_hash(&self, leaf_hash: TapLeafHash) -> TapNodeHash {
        fold_path(leaf_hash, &self.merkle_branch)
    }

    /// Verifies that the control block commits `script` to `output_key`.
    pub fn verify_commitment<B: EcBackend>(
        &self,
        backend: &B,
        output_key: &XOnlyPublicKey,
        script: &Script,
    ) -> bool {
        let leaf_hash = TapLeafHash::from_script(script, self.leaf_version);
        let root = self.root_hash(leaf_hash);
        let internal = self.internal_key.serialize();
        let tweak = TapTweakHash::from_key_and_tweak(&internal, Some(root));
        backend.x_only_tweak_check(
            &internal,
            &output_key.serialize(),
            self.output_key_parity.to_u8(),
            &tweak.to_byte_array(),
        )
    }
}

/// The key-less control block variant (`1 + 32m` bytes) used where the
/// spent output commits to a bare merkle root rather than a tweaked key.
///
/// The parity bit of the first byte carries no key parity and is fixed to 1
/// on encoding.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MerkleControlBlock {
    /// The tapleaf version.
    pub leaf_version: LeafVersion,
    /// The merkle proof of the script's inclusion.
    pub merkle_branch: TaprootMerkleBranch,
}

impl MerkleControlBlock {
    /// Decodes a key-less control block.
    ///
    /// Any length that is not `1 + 32m` with `m <= 128` is rejected. Note a
    /// 33-byte string parses as a key-bearing [`ControlBlock`] and not as
    /// this variant; the caller chooses the codec, there is no guessing.
    pub fn decode(sl: &[u8]) -> Result<MerkleControlBlock, TaprootError> {
        if sl.is_empty() || (sl.len() - 1) % TAPROOT_CONTROL_NODE_SIZE != 0 {
            return Err(TaprootError::InvalidControlBlockSize(sl.len()));
        }
        let leaf_version = LeafVersion::from_consensus(sl[0] & TAPROOT_LEAF_MASK)?;
        let merkle_branch = TaprootMerkleBranch::decode(&sl[1..])?;
        Ok(MerkleControlBlock { leaf_version, merkle_branch })
    }

    /// The serialized size of the control block.
    pub fn size(&self) -> usize { 1 + TAPROOT_CONTROL_NODE_SIZE * self.merkle_branch.len() }

    /// Serializes to the witness element encoding, parity bit fixed to 1.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size());
        buf.push(self.leaf_version.to_consensus() | 1);
        buf.extend_from_slice(&self.merkle_branch.serialize());
        buf
    }

    /// Folds the merkle branch upward from `leaf_hash`.
    pub fn root_hash(&self, leaf_hash: TapLeafHash) -> TapNodeHash {
        fold_path(leaf_hash, &self.merkle_branch)
    }

    /// Checks the branch against an expected merkle root.
    pub fn matches_root(&self, leaf_hash: TapLeafHash, root: TapNodeHash) -> bool {
        self.root_hash(leaf_hash) == root
    }
}

fn fold_path(leaf_hash: TapLeafHash, branch: &TaprootMerkleBranch) -> TapNodeHash {
    let mut curr = TapNodeHash::from(leaf_hash);
    for node in branch {
        curr = TapNodeHash::from_node_hashes(curr, *node);
    }
    curr
}

/// Tweaks an x-only public key with the taproot commitment of `merkle_root`
/// (or the key alone when there is no script tree).
///
/// Returns `None` when `pubkey` is not a valid 32-byte x-only key or the
/// backend reports a failed tweak.
pub fn tweak_key<B: EcBackend>(
    backend: &B,
    pubkey: &[u8],
    merkle_root: Option<TapNodeHash>,
) -> Option<TweakedKey> {
    let internal: &[u8; 32] = pubkey.try_into().ok()?;
    let tweak = TapTweakHash::from_key_and_tweak(internal, merkle_root);
    backend.x_only_add_tweak(internal, &tweak.to_byte_array())
}

/// Tweaks a secret key for a taproot key-path spend: the result signs for the
/// output key committed to by `merkle_root`.
pub fn tweak_seckey<B: EcBackend>(
    backend: &B,
    seckey: &[u8; 32],
    merkle_root: Option<TapNodeHash>,
) -> Result<[u8; 32], BackendError> {
    let internal = backend.x_only_from_seckey(seckey)?;
    let tweak = TapTweakHash::from_key_and_tweak(&internal.x_only, merkle_root);
    backend.tweak_seckey(seckey, &tweak.to_byte_array())
}

/// An error constructing or validating taproot structures.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum TaprootError {
    /// Merkle branch length is not a multiple of 32.
    InvalidMerkleBranchSize(usize),
    /// Merkle tree depth exceeds the limit of 128.
    InvalidMerkleTreeDepth(usize),
    /// The last bit of the leaf version is set, or it collides with the annex
    /// prefix.
    InvalidTaprootLeafVersion(u8),
    /// Control block size does not match any valid `33 + 32m`.
    InvalidControlBlockSize(usize),
    /// The internal key is not a valid x-only public key.
    InvalidInternalKey(secp256k1::Error),
}

impl fmt::Display for TaprootError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use TaprootError::*;

        match *self {
            InvalidMerkleBranchSize(sz) =>
                write!(f, "merkle branch size({}) must be a multiple of {}", sz, TAPROOT_CONTROL_NODE_SIZE),
            InvalidMerkleTreeDepth(d) =>
                write!(f, "merkle tree depth({}) must not exceed {}", d, TAPROOT_CONTROL_MAX_NODE_COUNT),
            InvalidTaprootLeafVersion(v) => write!(f, "leaf version({:#04x}) is invalid", v),
            InvalidControlBlockSize(sz) =>
                write!(f, "control block size({}) must be in the form 33 + 32*m where m <= {}", sz, TAPROOT_CONTROL_MAX_NODE_COUNT),
            InvalidInternalKey(ref e) => write!(f, "invalid internal x-only key: {}", e),
        }
    }
}

impl std::error::Error for TaprootError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        use TaprootError::*;

        match *self {
            InvalidInternalKey(ref e) => Some(e),
            InvalidMerkleBranchSize(_)
            | InvalidMerkleTreeDepth(_)
            | InvalidTaprootLeafVersion(_)
            | InvalidControlBlockSize(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use hashes::sha256t::Tag;
    use hex::{DisplayHex, FromHex};

    use super::*;
    use crate::crypto::backend::LibsecpBackend;

    fn tag_engine(tag_name: &str) -> hashes::sha256::HashEngine {
        let mut engine = hashes::sha256::Hash::engine();
        let tag_hash = hashes::sha256::Hash::hash(tag_name.as_bytes());
        engine.input(tag_hash.as_ref());
        engine.input(tag_hash.as_ref());
        engine
    }

    #[test]
    fn test_midstates() {
        // Test that engines are pre-tagged correctly against hand-built tag engines.
        fn empty_hash(tag_name: &str) -> [u8; 32] {
            hashes::sha256::Hash::from_engine(tag_engine(tag_name)).to_byte_array()
        }
        assert_eq!(empty_hash("TapLeaf"), TapLeafHash::hash(&[]).to_byte_array());
        assert_eq!(empty_hash("TapBranch"), TapNodeHash::hash(&[]).to_byte_array());
        assert_eq!(empty_hash("TapTweak"), TapTweakHash::hash(&[]).to_byte_array());
    }

    #[test]
    fn test_vectors_core() {
        //! Test vectors taken from Core

        // uninitialized writers
        //   CHashWriter writer = HasherTapLeaf;
        //   writer.GetSHA256().GetHex()
        assert_eq!(
            TapLeafHash::from_engine(TapLeafTag::engine()).to_string(),
            "5212c288a377d1f8164962a5a13429f9ba6a7b84e59776a52c6637df2106facb"
        );
        assert_eq!(
            TapNodeHash::from_engine(TapBranchTag::engine()).to_string(),
            "53c373ec4d6f3c53c1f5fb2ff506dcefe1a0ed74874f93fa93c8214cbe9ffddf"
        );
        assert_eq!(
            TapTweakHash::from_engine(TapTweakTag::engine()).to_string(),
            "8aa4229474ab0100b2d6f0687f031d1fc9d8eef92a042ad97d279bff456b15e4"
        );

        // 0-byte
        //   CHashWriter writer = HasherTapLeaf;
        //   writer << std::vector<unsigned char>{};
        //   writer.GetSHA256().GetHex()
        // Note that Core writes the 0 length prefix when an empty vector is written.
        assert_eq!(
            TapLeafHash::hash(&[0]).to_string(),
            "ed1382037800c9dd938dd8854f1a8863bcdeb6705069b4b56a66ec22519d5829"
        );
        assert_eq!(
            TapNodeHash::hash(&[0]).to_string(),
            "92534b1960c7e6245af7d5fda2588db04aa6d646abc2b588dab2b69e5645eb1d"
        );
        assert_eq!(
            TapTweakHash::hash(&[0]).to_string(),
            "cd8737b5e6047fc3f16f03e8b9959e3440e1bdf6dd02f7bb899c352ad490ea1e"
        );
    }

    fn verify_tap_commitments(
        backend: &LibsecpBackend,
        out_spk_hex: &str,
        script_hex: &str,
        control_block_hex: &str,
    ) {
        let out_pk = XOnlyPublicKey::from_str(&out_spk_hex[4..]).unwrap();
        let script = ScriptBuf::from_hex(script_hex).unwrap();
        let control_block =
            ControlBlock::decode(&Vec::<u8>::from_hex(control_block_hex).unwrap()).unwrap();
        assert_eq!(control_block_hex, control_block.serialize().to_lower_hex_string());
        assert!(control_block.verify_commitment(backend, &out_pk, &script));
    }

    #[test]
    fn control_block_verify() {
        let backend = LibsecpBackend::new();
        // test vectors obtained from printing values in feature_taproot.py from Bitcoin Core
        verify_tap_commitments(&backend, "51205dc8e62b15e0ebdf44751676be35ba32eed2e84608b290d4061bbff136cd7ba9", "6a", "c1a9d6f66cd4b25004f526bfa873e56942f98e8e492bd79ed6532b966104817c2bda584e7d32612381cf88edc1c02e28a296e807c16ad22f591ee113946e48a71e0641e660d1e5392fb79d64838c2b84faf04b7f5f283c9d8bf83e39e177b64372a0cd22eeab7e093873e851e247714eff762d8a30be699ba4456cfe6491b282e193a071350ae099005a5950d74f73ba13077a57bc478007fb0e4d1099ce9cf3d4");
        verify_tap_commitments(
            &backend,
            "5120567666e7df90e0450bb608e17c01ed3fbcfa5355a5f8273e34e583bfaa70ce09",
            "203455139bf238a3067bd72ed77e0ab8db590330f55ed58dba7366b53bf4734279ac",
            "c1a0eb12e60a52614986c623cbb6621dcdba3a47e3be6b37e032b7a11c7b98f400",
        );
        verify_tap_commitments(&backend, "5120228b94a4806254a38d6efa8a134c28ebc89546209559dfe40b2b0493bafacc5b", "6a50", "c0a0eb12e60a52614986c623cbb6621dcdba3a47e3be6b37e032b7a11c7b98f4009c9aed3dfd11ab0e78bf87ef3bf296269dc4b0f7712140386d6980992bab4b45");
        verify_tap_commitments(
            &backend,
            "5120b0a79103c31fe51eea61d2873bad8a25a310da319d7e7a85f825fa7a00ea3f85",
            "203455139bf238a3067bd72ed77e0ab8db590330f55ed58dba7366b53bf4734279ad51",
            "c1a0eb12e60a52614986c623cbb6621dcdba3a47e3be6b37e032b7a11c7b98f400",
        );
        verify_tap_commitments(&backend, "5120ee9aecb28f5f35ce1f8b5ec80275ac0f81bca4a21b29b4632fb4bcbef8823e6a", "2021a5981b13be29c9d4ea179ea44a8b773ea8c02d68f6f6eefd98de20d4bd055fac", "c13359c284c196b6e80f0cf1d93b6a397cf7ee722f0427b705bd954b88ada8838bd2622fd0e104fc50aa763b43c6a792d7d117029983abd687223b4344a9402c618bba7f5fc3fa8a57491f6842acde88c1e675ca35caea3b1a69ee2c2d9b10f615");
    }

    #[test]
    fn control_block_rejects_bad_lengths() {
        // One byte short of base size: invalid in either codec.
        assert!(matches!(
            ControlBlock::decode(&[0xc0; 32]),
            Err(TaprootError::InvalidControlBlockSize(32))
        ));
        assert!(matches!(
            MerkleControlBlock::decode(&[0xc1; 32]),
            Err(TaprootError::InvalidControlBlockSize(32))
        ));
        // 34 = 33 + 1 is not 33 + 32m.
        assert!(ControlBlock::decode(&[0xc0; 34]).is_err());
        assert!(MerkleControlBlock::decode(&[]).is_err());
        // Too deep for either codec.
        assert!(ControlBlock::decode(&vec![0xc0; 33 + 32 * 129]).is_err());
        assert!(MerkleControlBlock::decode(&vec![0xc1; 1 + 32 * 129]).is_err());
    }

    #[test]
    fn branch_hash_is_sort_invariant() {
        let a = TapNodeHash::from_script(
            ScriptBuf::from_hex("51").unwrap().as_script(),
            LeafVersion::TapScript,
        );
        let b = TapNodeHash::from_script(
            ScriptBuf::from_hex("52").unwrap().as_script(),
            LeafVersion::TapScript,
        );
        assert_eq!(TapNodeHash::from_node_hashes(a, b), TapNodeHash::from_node_hashes(b, a));
    }

    #[test]
    fn swapped_tree_has_same_root() {
        let left = TapTree::leaf(ScriptBuf::from_hex("51").unwrap());
        let right = TapTree::leaf(ScriptBuf::from_hex("52").unwrap());
        let forward = HashTree::from_tree(&TapTree::branch(left.clone(), right.clone())).unwrap();
        let reversed = HashTree::from_tree(&TapTree::branch(right, left)).unwrap();
        assert_eq!(forward.hash(), reversed.hash());
    }

    #[test]
    fn script_path_round_trips_through_control_block() {
        let backend = LibsecpBackend::new();
        let internal_key = XOnlyPublicKey::from_str(
            "93c7378d96518a75448821c4f7c8f4bae7ce60f804d03d1f0628dd5dd0f5de51",
        )
        .unwrap();

        let leaves: Vec<TapLeaf> = ["51", "52", "53"]
            .iter()
            .map(|h| TapLeaf::new(ScriptBuf::from_hex(h).unwrap()))
            .collect();
        let tree = TapTree::branch(
            TapTree::Leaf(leaves[0].clone()),
            TapTree::branch(TapTree::Leaf(leaves[1].clone()), TapTree::Leaf(leaves[2].clone())),
        );
        let hash_tree = HashTree::from_tree(&tree).unwrap();
        let root = hash_tree.hash();

        let output = tweak_key(&backend, &internal_key.serialize(), Some(root)).unwrap();
        let output_key = XOnlyPublicKey::from_slice(&output.x_only).unwrap();
        let parity = if output.parity == 0 { Parity::Even } else { Parity::Odd };

        for (i, leaf) in leaves.iter().enumerate() {
            let cb = ControlBlock::for_leaf(internal_key, parity, leaf, &hash_tree).unwrap();
            let expected_depth = if i == 0 { 1 } else { 2 };
            assert_eq!(cb.merkle_branch.len(), expected_depth);
            assert_eq!(cb.root_hash(leaf.leaf_hash()), root);
            // Full round trip through the wire encoding.
            let decoded = ControlBlock::decode(&cb.serialize()).unwrap();
            assert_eq!(decoded, cb);
            assert!(decoded.verify_commitment(&backend, &output_key, &leaf.script));
        }

        // A leaf that is not in the tree has no path.
        let missing = TapLeaf::new(ScriptBuf::from_hex("54").unwrap());
        assert!(hash_tree.script_path(missing.leaf_hash()).is_none());
    }

    #[test]
    fn merkle_control_block_round_trip() {
        let leaves: Vec<TapLeaf> =
            ["51", "52"].iter().map(|h| TapLeaf::new(ScriptBuf::from_hex(h).unwrap())).collect();
        let tree = TapTree::branch(
            TapTree::Leaf(leaves[0].clone()),
            TapTree::Leaf(leaves[1].clone()),
        );
        let hash_tree = HashTree::from_tree(&tree).unwrap();
        let root = hash_tree.hash();

        let cb = MerkleControlBlock {
            leaf_version: LeafVersion::TapScript,
            merkle_branch: hash_tree.script_path(leaves[0].leaf_hash()).unwrap(),
        };
        let encoded = cb.serialize();
        assert_eq!(encoded.len(), 33);
        // Parity bit of the first byte is fixed to 1.
        assert_eq!(encoded[0], TAPROOT_LEAF_TAPSCRIPT | 1);
        let decoded = MerkleControlBlock::decode(&encoded).unwrap();
        assert_eq!(decoded, cb);
        assert!(decoded.matches_root(leaves[0].leaf_hash(), root));
        assert!(!decoded.matches_root(leaves[1].leaf_hash(), root));
    }

    #[test]
    fn depth_limit_enforced_on_tree_hashing() {
        let mut tree = TapTree::leaf(ScriptBuf::from_hex("51").unwrap());
        for _ in 0..129 {
            tree = TapTree::branch(tree, TapTree::leaf(ScriptBuf::from_hex("52").unwrap()));
        }
        assert!(matches!(
            HashTree::from_tree(&tree),
            Err(TaprootError::InvalidMerkleTreeDepth(_))
        ));
    }

    #[test]
    fn tweak_without_script_root() {
        let backend = LibsecpBackend::new();
        let seckey = [0x10; 32];
        let internal = backend.x_only_from_seckey(&seckey).unwrap();
        let tweaked_pub = tweak_key(&backend, &internal.x_only, None).unwrap();
        let tweaked_sec = tweak_seckey(&backend, &seckey, None).unwrap();
        assert_eq!(backend.x_only_from_seckey(&tweaked_sec).unwrap().x_only, tweaked_pub.x_only);
        // Wrong-length keys are rejected up front.
        assert!(tweak_key(&backend, &[0u8; 33], None).is_none());
    }
}
