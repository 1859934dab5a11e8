//! Target database: owns reference targets and the vocabulary tree built
//! over them. Write-rare, read-frequent — a single `RwLock` guards all
//! state, giving mutators exclusive access and queries shared access, per
//! the concurrency model.

pub mod vocab_tree;

use std::collections::HashMap;
use std::sync::RwLock;

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::types::{BowHistogram, Corners, Descriptor, Keypoint, Target};
use vocab_tree::VocabTree;

/// Arguments for [`TargetDatabase::add`]. The external interface table in
/// the spec lists only descriptors and reference corners for `add_target`,
/// but the data model requires a reference keypoint per descriptor (their
/// positions are what homography estimation matches against) — this struct
/// carries both, since the data model section is authoritative over the
/// external-interface summary table.
pub struct NewTarget {
    pub id: String,
    pub keypoints: Vec<Keypoint>,
    pub descriptors: Vec<Descriptor>,
    pub ref_width: u32,
    pub ref_height: u32,
    pub ref_corners: Corners,
    pub metadata: Vec<u8>,
}

struct VocabState {
    tree: VocabTree,
    idf: Vec<f32>,
}

struct DbState {
    targets: HashMap<String, Target>,
    order: Vec<String>,
    vocab: Option<VocabState>,
}

pub struct TargetDatabase {
    state: RwLock<DbState>,
}

impl Default for TargetDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetDatabase {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(DbState {
                targets: HashMap::new(),
                order: Vec::new(),
                vocab: None,
            }),
        }
    }

    /// Insert a new target. Fails with `DuplicateId` if the id is already
    /// present, `InvalidDescriptors` if the descriptor set is empty or
    /// exceeds `max_features_per_target`.
    pub fn add(&self, new_target: NewTarget, max_features_per_target: usize) -> Result<()> {
        if new_target.descriptors.is_empty() {
            return Err(Error::InvalidDescriptors(format!(
                "target {} has no descriptors",
                new_target.id
            )));
        }
        if new_target.descriptors.len() > max_features_per_target {
            return Err(Error::InvalidDescriptors(format!(
                "target {} has {} descriptors, exceeds max_features_per_target {}",
                new_target.id,
                new_target.descriptors.len(),
                max_features_per_target
            )));
        }
        if new_target.keypoints.len() != new_target.descriptors.len() {
            return Err(Error::InvalidDescriptors(format!(
                "target {} has {} keypoints but {} descriptors",
                new_target.id,
                new_target.keypoints.len(),
                new_target.descriptors.len()
            )));
        }

        let mut state = self.state.write().expect("target database lock poisoned");
        if state.targets.contains_key(&new_target.id) {
            return Err(Error::DuplicateId(new_target.id));
        }

        let id = new_target.id.clone();
        let target = Target {
            id: id.clone(),
            ref_width: new_target.ref_width,
            ref_height: new_target.ref_height,
            ref_corners: new_target.ref_corners,
            keypoints: new_target.keypoints,
            descriptors: new_target.descriptors,
            histogram: None,
            metadata: new_target.metadata,
        };
        state.order.push(id.clone());
        state.targets.insert(id, target);
        state.vocab = None;
        log::info!("target '{}' added, database now has {} targets", new_target.id, state.targets.len());
        Ok(())
    }

    /// Idempotent: removing an absent id is not an error.
    pub fn remove(&self, id: &str) {
        let mut state = self.state.write().expect("target database lock poisoned");
        if state.targets.remove(id).is_some() {
            state.order.retain(|x| x != id);
            state.vocab = None;
            log::info!("target '{id}' removed, database now has {} targets", state.targets.len());
        }
    }

    pub fn clear(&self) {
        let mut state = self.state.write().expect("target database lock poisoned");
        state.targets.clear();
        state.order.clear();
        state.vocab = None;
        log::info!("target database cleared");
    }

    pub fn len(&self) -> usize {
        self.state.read().expect("target database lock poisoned").targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        self.state.read().expect("target database lock poisoned").targets.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<Target> {
        self.state.read().expect("target database lock poisoned").targets.get(id).cloned()
    }

    /// (Re)build the vocabulary tree from the union of every target's
    /// descriptors, using hierarchical k-means with a fixed seed, and
    /// recompute every target's tf-idf histogram.
    pub fn build_vocabulary(&self, cfg: &EngineConfig) -> Result<()> {
        let mut state = self.state.write().expect("target database lock poisoned");
        if state.targets.is_empty() {
            state.vocab = None;
            return Ok(());
        }

        let all_descriptors: Vec<Descriptor> = state
            .targets
            .values()
            .flat_map(|t| t.descriptors.iter().copied())
            .collect();
        let tree = VocabTree::build(
            &all_descriptors,
            cfg.vocab_branching_factor,
            cfg.vocab_depth,
            cfg.vocab_kmeans_seed,
        );
        let num_leaves = tree.num_leaves();
        let n_targets = state.targets.len();
        let ids = state.order.clone();

        let mut tf_per_target: HashMap<String, Vec<f32>> = HashMap::with_capacity(ids.len());
        let mut doc_freq = vec![0u32; num_leaves];
        for id in &ids {
            let target = &state.targets[id];
            let mut tf = vec![0.0f32; num_leaves];
            for d in &target.descriptors {
                tf[tree.quantize(d)] += 1.0;
            }
            let total = target.descriptors.len() as f32;
            if total > 0.0 {
                for v in tf.iter_mut() {
                    *v /= total;
                }
            }
            for (leaf, &count) in tf.iter().enumerate() {
                if count > 0.0 {
                    doc_freq[leaf] += 1;
                }
            }
            tf_per_target.insert(id.clone(), tf);
        }

        let idf: Vec<f32> = doc_freq
            .iter()
            .map(|&df| ((n_targets as f32) / (1.0 + df as f32)).ln().max(0.0))
            .collect();

        for id in &ids {
            let tf = &tf_per_target[id];
            let hist: BowHistogram = tf.iter().zip(idf.iter()).map(|(t, i)| t * i).collect();
            if let Some(t) = state.targets.get_mut(id) {
                t.histogram = Some(hist);
            }
        }

        log::info!(
            "vocabulary tree built: {} leaves over {} targets, {} descriptors",
            num_leaves,
            n_targets,
            all_descriptors.len()
        );
        state.vocab = Some(VocabState { tree, idf });
        Ok(())
    }

    /// Top-K target ids by tf-idf cosine similarity to `frame_descriptors`.
    /// Bypasses the tree entirely (returning every id) when the database
    /// holds at most `bypass_max_targets` targets.
    pub fn query_candidates(
        &self,
        frame_descriptors: &[Descriptor],
        k: usize,
        bypass_max_targets: usize,
    ) -> Result<Vec<String>> {
        let state = self.state.read().expect("target database lock poisoned");
        if state.targets.is_empty() {
            return Ok(Vec::new());
        }
        if state.targets.len() <= bypass_max_targets {
            return Ok(state.order.clone());
        }
        let Some(vocab) = &state.vocab else {
            return Err(Error::VocabularyNotBuilt);
        };

        let num_leaves = vocab.tree.num_leaves();
        let mut tf = vec![0.0f32; num_leaves];
        for d in frame_descriptors {
            tf[vocab.tree.quantize(d)] += 1.0;
        }
        let total = frame_descriptors.len() as f32;
        if total > 0.0 {
            for v in tf.iter_mut() {
                *v /= total;
            }
        }
        let query_hist: Vec<f32> = tf.iter().zip(vocab.idf.iter()).map(|(t, i)| t * i).collect();

        let mut scored: Vec<(String, f32)> = state
            .order
            .iter()
            .filter_map(|id| {
                let target = state.targets.get(id)?;
                let hist = target.histogram.as_ref()?;
                Some((id.clone(), cosine_similarity(&query_hist, hist)))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored.into_iter().map(|(id, _)| id).collect())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na > 1e-9 && nb > 1e-9 {
        dot / (na * nb)
    } else {
        0.0
    }
}
