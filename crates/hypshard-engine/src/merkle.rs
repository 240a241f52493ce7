//! Merkle aggregation over shard results.
//!
//! Each completed shard contributes one leaf; the root is a compact
//! commitment to the whole result set that third parties can audit
//! through inclusion proofs without re-executing anything.
//!
//! Hashing scheme:
//! - leaf hash  = `sha256(cas_id | output_digest | attempt)`
//! - branch     = `sha256(left | right)`
//! - empty tree = `sha256("empty")`, distinguishing "no work" from
//!   hashing zero bytes
//!
//! with `|` as the literal separator. Pairing is left-to-right with an
//! odd trailing node duplicated. Leaves are sorted by cas_id before
//! pairing, so the root is a function of the result set rather than of
//! insertion order.

use rand::SeedableRng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

fn sha256_hex(data: &str) -> String {
    format!("{:x}", Sha256::digest(data.as_bytes()))
}

/// Root hash of a tree with no leaves.
#[must_use]
pub fn empty_root() -> String {
    sha256_hex("empty")
}

/// Computes the leaf hash for a shard result.
#[must_use]
pub fn leaf_hash(cas_id: &str, output_digest: &str, attempt: u32) -> String {
    sha256_hex(&format!("{cas_id}|{output_digest}|{attempt}"))
}

fn branch_hash(left: &str, right: &str) -> String {
    sha256_hex(&format!("{left}|{right}"))
}

/// One node of a built Merkle tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleNode {
    /// `leaf_{cas_id}` for leaves, `branch_{level}_{index}` for branches.
    pub node_id: String,
    /// Left child node id, if a branch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub left: Option<String>,
    /// Right child node id, if a branch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub right: Option<String>,
    /// The node's hash.
    pub hash_value: String,
    /// Whether this node is a leaf.
    pub is_leaf: bool,
}

/// Which side of the concatenation a proof step's sibling sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    /// Sibling hash is concatenated on the left.
    Left,
    /// Sibling hash is concatenated on the right.
    Right,
}

/// One level of an inclusion proof.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofStep {
    /// Where the sibling sits relative to the running hash.
    pub side: Side,
    /// The sibling hash.
    pub hash: String,
}

/// Self-contained inclusion proof, verifiable without the tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MerkleProof {
    /// The shard the proof covers.
    pub leaf_cas_id: String,
    /// The leaf's hash.
    pub leaf_hash: String,
    /// Sibling hashes from leaf to root.
    pub path: Vec<ProofStep>,
    /// The root the path replays to.
    pub root_hash: String,
}

/// Replays a proof's hash chain and checks it reaches the claimed root.
///
/// Static: usable by a third party holding only the proof.
#[must_use]
pub fn verify_proof(proof: &MerkleProof) -> bool {
    let mut current = proof.leaf_hash.clone();
    for step in &proof.path {
        current = match step.side {
            Side::Right => branch_hash(&current, &step.hash),
            Side::Left => branch_hash(&step.hash, &current),
        };
    }
    current == proof.root_hash
}

#[derive(Debug, Clone)]
struct Leaf {
    cas_id: String,
    hash: String,
}

/// Merkle tree over one plan's completed shard results.
///
/// Leaves accumulate as shards finish; a re-added cas_id replaces the
/// previous leaf, so only the latest successful attempt counts.
#[derive(Debug, Clone, Default)]
pub struct MerkleTree {
    leaves: Vec<Leaf>,
}

impl MerkleTree {
    /// Creates an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of leaves.
    #[must_use]
    pub fn leaf_count(&self) -> usize {
        self.leaves.len()
    }

    /// Adds (or replaces) the leaf for a shard result.
    pub fn add_leaf(&mut self, cas_id: &str, output_digest: &str, attempt: u32) {
        let hash = leaf_hash(cas_id, output_digest, attempt);
        if let Some(existing) = self.leaves.iter_mut().find(|l| l.cas_id == cas_id) {
            existing.hash = hash;
        } else {
            self.leaves.push(Leaf {
                cas_id: cas_id.to_string(),
                hash,
            });
        }
    }

    /// Leaves sorted by cas_id; this ordering is what makes the root
    /// insertion-order independent.
    fn sorted_leaves(&self) -> Vec<Leaf> {
        let mut leaves = self.leaves.clone();
        leaves.sort_by(|a, b| a.cas_id.cmp(&b.cas_id));
        leaves
    }

    /// Builds hash levels bottom-up. Level 0 holds sorted leaf hashes;
    /// the last level holds exactly the root.
    fn build_levels(leaves: &[Leaf]) -> Vec<Vec<String>> {
        let mut levels: Vec<Vec<String>> =
            vec![leaves.iter().map(|l| l.hash.clone()).collect()];

        while levels
            .last()
            .map(Vec::len)
            .is_some_and(|len| len > 1)
        {
            let current = match levels.last() {
                Some(level) => level,
                None => break,
            };
            let mut next = Vec::with_capacity(current.len().div_ceil(2));
            for pair in current.chunks(2) {
                let left = &pair[0];
                // Odd trailing node is paired with itself.
                let right = pair.get(1).unwrap_or(left);
                next.push(branch_hash(left, right));
            }
            levels.push(next);
        }
        levels
    }

    /// Computes the root over the current leaf set.
    ///
    /// Empty tree yields the `sha256("empty")` sentinel; a single leaf's
    /// hash is its own root.
    #[must_use]
    pub fn compute_root(&self) -> String {
        let leaves = self.sorted_leaves();
        if leaves.is_empty() {
            return empty_root();
        }
        let levels = Self::build_levels(&leaves);
        levels
            .last()
            .and_then(|top| top.first())
            .cloned()
            .unwrap_or_else(empty_root)
    }

    /// Materializes every node of the current tree for inspection.
    ///
    /// Leaves are `leaf_{cas_id}`; branches are `branch_{level}_{index}`
    /// with level 0 just above the leaves.
    #[must_use]
    pub fn nodes(&self) -> Vec<MerkleNode> {
        let leaves = self.sorted_leaves();
        if leaves.is_empty() {
            return Vec::new();
        }

        let levels = Self::build_levels(&leaves);
        let mut nodes = Vec::new();
        let mut prev_ids: Vec<String> = Vec::with_capacity(leaves.len());

        for leaf in &leaves {
            let node_id = format!("leaf_{}", leaf.cas_id);
            nodes.push(MerkleNode {
                node_id: node_id.clone(),
                left: None,
                right: None,
                hash_value: leaf.hash.clone(),
                is_leaf: true,
            });
            prev_ids.push(node_id);
        }

        for (level, hashes) in levels.iter().enumerate().skip(1) {
            let mut level_ids = Vec::with_capacity(hashes.len());
            for (index, hash) in hashes.iter().enumerate() {
                let left_child = prev_ids.get(index * 2).cloned();
                let right_child = prev_ids
                    .get(index * 2 + 1)
                    .or_else(|| prev_ids.get(index * 2))
                    .cloned();
                let node_id = format!("branch_{}_{index}", level - 1);
                nodes.push(MerkleNode {
                    node_id: node_id.clone(),
                    left: left_child,
                    right: right_child,
                    hash_value: hash.clone(),
                    is_leaf: false,
                });
                level_ids.push(node_id);
            }
            prev_ids = level_ids;
        }

        nodes
    }

    /// Generates an inclusion proof for a shard, or `None` if the cas_id
    /// has no leaf.
    #[must_use]
    pub fn generate_proof(&self, cas_id: &str) -> Option<MerkleProof> {
        let leaves = self.sorted_leaves();
        let mut index = leaves.iter().position(|l| l.cas_id == cas_id)?;
        let levels = Self::build_levels(&leaves);

        let mut path = Vec::new();
        for level in &levels[..levels.len().saturating_sub(1)] {
            let (sibling_index, side) = if index % 2 == 0 {
                (index + 1, Side::Right)
            } else {
                (index - 1, Side::Left)
            };
            // Duplicated trailing node: the sibling is the node itself.
            let sibling = level.get(sibling_index).or_else(|| level.get(index))?;
            path.push(ProofStep {
                side,
                hash: sibling.clone(),
            });
            index /= 2;
        }

        Some(MerkleProof {
            leaf_cas_id: cas_id.to_string(),
            leaf_hash: leaves.iter().find(|l| l.cas_id == cas_id)?.hash.clone(),
            path,
            root_hash: self.compute_root(),
        })
    }

    /// Uniformly samples `min(n, leaf_count)` proofs without replacement,
    /// for probabilistic auditing at scale.
    #[must_use]
    pub fn sample_proofs(&self, n: usize) -> Vec<MerkleProof> {
        self.sample_proofs_with_rng(n, &mut StdRng::from_entropy())
    }

    /// Seeded variant of [`sample_proofs`](Self::sample_proofs).
    #[must_use]
    pub fn sample_proofs_seeded(&self, n: usize, seed: u64) -> Vec<MerkleProof> {
        self.sample_proofs_with_rng(n, &mut StdRng::seed_from_u64(seed))
    }

    fn sample_proofs_with_rng<R: rand::Rng + ?Sized>(
        &self,
        n: usize,
        rng: &mut R,
    ) -> Vec<MerkleProof> {
        let leaves = self.sorted_leaves();
        let amount = n.min(leaves.len());
        rand::seq::index::sample(rng, leaves.len(), amount)
            .into_iter()
            .filter_map(|i| self.generate_proof(&leaves[i].cas_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree_of(n: usize) -> MerkleTree {
        let mut tree = MerkleTree::new();
        for i in 0..n {
            tree.add_leaf(&format!("cas{i:04}"), &format!("digest{i}"), 1);
        }
        tree
    }

    #[test]
    fn empty_tree_uses_sentinel() {
        let tree = MerkleTree::new();
        assert_eq!(tree.compute_root(), sha256_hex("empty"));
        assert_ne!(tree.compute_root(), sha256_hex(""));
    }

    #[test]
    fn single_leaf_root_is_leaf_hash() {
        let mut tree = MerkleTree::new();
        tree.add_leaf("abc123", "digest", 1);
        assert_eq!(tree.compute_root(), leaf_hash("abc123", "digest", 1));
    }

    #[test]
    fn root_is_64_hex_chars() {
        let tree = tree_of(5);
        let root = tree.compute_root();
        assert_eq!(root.len(), 64);
        assert!(root.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn odd_leaf_duplicates_trailing_node() {
        let tree = tree_of(3);
        let h: Vec<String> = (0..3)
            .map(|i| leaf_hash(&format!("cas{i:04}"), &format!("digest{i}"), 1))
            .collect();
        let left = branch_hash(&h[0], &h[1]);
        let right = branch_hash(&h[2], &h[2]);
        assert_eq!(tree.compute_root(), branch_hash(&left, &right));
    }

    #[test]
    fn root_is_insertion_order_independent() {
        let mut forward = MerkleTree::new();
        let mut reverse = MerkleTree::new();
        for i in 0..7 {
            forward.add_leaf(&format!("cas{i}"), "d", 1);
        }
        for i in (0..7).rev() {
            reverse.add_leaf(&format!("cas{i}"), "d", 1);
        }
        assert_eq!(forward.compute_root(), reverse.compute_root());
    }

    #[test]
    fn readding_a_leaf_replaces_it() {
        let mut tree = MerkleTree::new();
        tree.add_leaf("cas1", "old", 1);
        let old_root = tree.compute_root();
        tree.add_leaf("cas1", "new", 3);
        assert_eq!(tree.leaf_count(), 1);
        assert_ne!(tree.compute_root(), old_root);
        assert_eq!(tree.compute_root(), leaf_hash("cas1", "new", 3));
    }

    #[test]
    fn proofs_verify_for_every_leaf() {
        for n in [1usize, 2, 3, 4, 5, 8, 13] {
            let tree = tree_of(n);
            for i in 0..n {
                let cas_id = format!("cas{i:04}");
                let proof = tree.generate_proof(&cas_id).unwrap();
                assert!(verify_proof(&proof), "proof failed for {cas_id} of {n}");
            }
        }
    }

    #[test]
    fn absent_cas_id_yields_no_proof() {
        let tree = tree_of(4);
        assert!(tree.generate_proof("missing").is_none());
    }

    #[test]
    fn tampered_proof_fails_verification() {
        let tree = tree_of(4);
        let mut proof = tree.generate_proof("cas0001").unwrap();
        proof.leaf_hash = sha256_hex("tampered");
        assert!(!verify_proof(&proof));

        let mut proof = tree.generate_proof("cas0001").unwrap();
        if let Some(step) = proof.path.first_mut() {
            step.hash = sha256_hex("tampered");
        }
        assert!(!verify_proof(&proof));
    }

    #[test]
    fn node_ids_follow_naming_scheme() {
        let tree = tree_of(3);
        let nodes = tree.nodes();

        let leaves: Vec<&MerkleNode> = nodes.iter().filter(|n| n.is_leaf).collect();
        assert_eq!(leaves.len(), 3);
        assert!(leaves.iter().all(|n| n.node_id.starts_with("leaf_cas")));

        // Branch levels are numbered from 0 just above the leaves.
        let branches: Vec<&MerkleNode> = nodes.iter().filter(|n| !n.is_leaf).collect();
        assert!(branches.iter().any(|n| n.node_id == "branch_0_0"));
        assert!(branches.iter().any(|n| n.node_id == "branch_0_1"));

        let root = branches
            .iter()
            .find(|n| n.node_id == "branch_1_0")
            .unwrap();
        assert_eq!(root.hash_value, tree.compute_root());
    }

    #[test]
    fn sampling_is_without_replacement_and_clamped() {
        let tree = tree_of(5);

        let proofs = tree.sample_proofs_seeded(3, 42);
        assert_eq!(proofs.len(), 3);
        let mut ids: Vec<&str> = proofs.iter().map(|p| p.leaf_cas_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), 3);
        assert!(proofs.iter().all(verify_proof));

        // Asking for more than exists returns every leaf once.
        let all = tree.sample_proofs_seeded(100, 42);
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn seeded_sampling_is_reproducible() {
        let tree = tree_of(10);
        let a: Vec<String> = tree
            .sample_proofs_seeded(4, 7)
            .into_iter()
            .map(|p| p.leaf_cas_id)
            .collect();
        let b: Vec<String> = tree
            .sample_proofs_seeded(4, 7)
            .into_iter()
            .map(|p| p.leaf_cas_id)
            .collect();
        assert_eq!(a, b);
    }
}
