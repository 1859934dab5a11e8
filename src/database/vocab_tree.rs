//! Hierarchical k-means vocabulary tree over binary descriptors.
//!
//! Built once from the union of every target's descriptors, giving
//! `branching_factor ^ depth` leaves ("visual words"). Quantizing a
//! descriptor walks to its nearest leaf by Hamming distance; the database
//! turns per-target descriptor sets into histograms over these leaves.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::types::{Descriptor, DESCRIPTOR_BYTES};

const KMEANS_ITERATIONS: usize = 10;

/// A flat array of leaf centroids, in left-to-right order. Depth and
/// branching factor are kept only for introspection; quantization only
/// needs the leaf list.
#[derive(Debug, Clone)]
pub struct VocabTree {
    branching_factor: usize,
    depth: usize,
    leaves: Vec<Descriptor>,
}

impl VocabTree {
    /// Build deterministically from `descriptors` given a fixed seed.
    pub fn build(descriptors: &[Descriptor], branching_factor: usize, depth: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let leaves = recursive_kmeans(descriptors, branching_factor.max(1), depth, &mut rng);
        Self { branching_factor: branching_factor.max(1), depth, leaves }
    }

    pub fn num_leaves(&self) -> usize {
        self.leaves.len()
    }

    pub fn branching_factor(&self) -> usize {
        self.branching_factor
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Index of the leaf nearest `d` in Hamming space.
    pub fn quantize(&self, d: &Descriptor) -> usize {
        self.leaves
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.hamming(d))
            .map(|(i, _)| i)
            .unwrap_or(0)
    }
}

fn recursive_kmeans(descriptors: &[Descriptor], b: usize, depth: usize, rng: &mut StdRng) -> Vec<Descriptor> {
    if depth == 0 {
        if descriptors.is_empty() {
            return vec![Descriptor::zero()];
        }
        let refs: Vec<&Descriptor> = descriptors.iter().collect();
        return vec![majority_vote(&refs)];
    }

    let centroids = kmeans_centroids(descriptors, b, rng);
    let k = centroids.len();
    let mut clusters: Vec<Vec<Descriptor>> = vec![Vec::new(); k.max(1)];
    for d in descriptors {
        if k == 0 {
            break;
        }
        let ci = centroids
            .iter()
            .enumerate()
            .min_by_key(|(_, c)| c.hamming(d))
            .map(|(i, _)| i)
            .unwrap_or(0);
        clusters[ci].push(*d);
    }

    let mut leaves = Vec::with_capacity(b.saturating_pow(depth as u32));
    for c in 0..b {
        if c < clusters.len() {
            leaves.extend(recursive_kmeans(&clusters[c], b, depth - 1, rng));
        } else {
            leaves.extend(recursive_kmeans(&[], b, depth - 1, rng));
        }
    }
    leaves
}

/// Lloyd's algorithm over Hamming distance, with empty clusters replaced by
/// the descriptor farthest from the emptied centroid (the tie-break named
/// in the target database's k-means rule).
fn kmeans_centroids(descriptors: &[Descriptor], k: usize, rng: &mut StdRng) -> Vec<Descriptor> {
    if descriptors.is_empty() {
        return Vec::new();
    }
    let k = k.min(descriptors.len()).max(1);

    let mut order: Vec<usize> = (0..descriptors.len()).collect();
    for i in (1..order.len()).rev() {
        let j = rng.gen_range(0..=i);
        order.swap(i, j);
    }
    let mut centroids: Vec<Descriptor> = order[..k].iter().map(|&i| descriptors[i]).collect();

    for _ in 0..KMEANS_ITERATIONS {
        let mut assign = vec![0usize; descriptors.len()];
        for (i, d) in descriptors.iter().enumerate() {
            assign[i] = centroids
                .iter()
                .enumerate()
                .min_by_key(|(_, c)| c.hamming(d))
                .map(|(ci, _)| ci)
                .unwrap();
        }

        let mut new_centroids = Vec::with_capacity(k);
        for (c, centroid) in centroids.iter().enumerate() {
            let members: Vec<&Descriptor> = descriptors
                .iter()
                .zip(assign.iter())
                .filter(|(_, &a)| a == c)
                .map(|(d, _)| d)
                .collect();
            if members.is_empty() {
                let farthest = descriptors
                    .iter()
                    .max_by_key(|d| centroid.hamming(d))
                    .expect("descriptors non-empty");
                new_centroids.push(*farthest);
            } else {
                new_centroids.push(majority_vote(&members));
            }
        }

        if new_centroids == centroids {
            break;
        }
        centroids = new_centroids;
    }

    centroids
}

/// Per-bit majority vote across a cluster's members: the standard centroid
/// update for binary descriptors.
fn majority_vote(members: &[&Descriptor]) -> Descriptor {
    let mut out = [0u8; DESCRIPTOR_BYTES];
    let n = members.len();
    for byte_idx in 0..DESCRIPTOR_BYTES {
        for bit in 0..8u8 {
            let mask = 1u8 << bit;
            let count = members.iter().filter(|d| d.0[byte_idx] & mask != 0).count();
            if count * 2 >= n {
                out[byte_idx] |= mask;
            }
        }
    }
    Descriptor(out)
}
