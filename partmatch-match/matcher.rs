//! Approximate nearest-neighbour matching of SIFT descriptors.
//!
//! A randomized kd-forest indexes the stored descriptors of one catalog
//! item. Each tree splits on one of the highest-variance dimensions, picked
//! per tree, at the mean of that dimension. Queries descend every tree and
//! then continue best-bin-first from a shared priority queue until the
//! check budget is spent.

use partmatch_core::Descriptor;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Candidate split dimensions per node, taken from the top of the
/// variance ranking
const RAND_DIM: usize = 5;
/// Points sampled when estimating per-dimension mean and variance
const SAMPLE_MEAN: usize = 100;

/// How nearest neighbours are searched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStrategy {
    /// Randomized kd-forest with best-bin-first traversal
    #[default]
    KdForest,
    /// Brute force over every stored descriptor
    Exact,
}

/// Matcher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub strategy: SearchStrategy,
    /// Number of randomized trees
    pub trees: usize,
    /// Stored descriptors compared per query before the search stops
    pub checks: usize,
    /// Maximum points per leaf
    pub leaf_size: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            strategy: SearchStrategy::KdForest,
            trees: 5,
            checks: 50,
            leaf_size: 8,
        }
    }
}

impl MatcherConfig {
    pub fn exact() -> Self {
        Self { strategy: SearchStrategy::Exact, ..Self::default() }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.strategy == SearchStrategy::KdForest {
            if self.trees == 0 {
                return Err("trees must be at least 1".to_string());
            }
            if self.checks == 0 {
                return Err("checks must be at least 1".to_string());
            }
            if self.leaf_size == 0 {
                return Err("leaf_size must be at least 1".to_string());
            }
        }
        Ok(())
    }
}

/// A query descriptor paired with the stored descriptor it matched
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub query_idx: usize,
    pub stored_idx: usize,
    /// Euclidean distance between the two descriptors
    pub distance: f32,
}

/// A stored descriptor found by a nearest-neighbour search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub index: usize,
    pub distance: f32,
}

enum KdNode {
    Leaf(Vec<usize>),
    Split {
        dimension: usize,
        value: f32,
        left: Box<KdNode>,
        right: Box<KdNode>,
    },
}

/// Unexplored branch, ordered so the closest one pops first
struct Branch<'a> {
    node: &'a KdNode,
    distance: f32,
}

impl Ord for Branch<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.distance.total_cmp(&self.distance)
    }
}

impl PartialOrd for Branch<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Branch<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.distance == other.distance
    }
}

impl Eq for Branch<'_> {}

/// The `k` closest points seen so far, sorted by squared distance
struct KnnBuffer {
    k: usize,
    items: Vec<(usize, f32)>,
}

impl KnnBuffer {
    fn new(k: usize) -> Self {
        Self { k, items: Vec::with_capacity(k + 1) }
    }

    fn is_full(&self) -> bool {
        self.items.len() >= self.k
    }

    fn worst(&self) -> f32 {
        self.items.last().map_or(f32::INFINITY, |&(_, d)| d)
    }

    fn insert(&mut self, index: usize, dist_sq: f32) {
        if self.is_full() && dist_sq >= self.worst() {
            return;
        }
        let pos = self.items.partition_point(|&(_, d)| d <= dist_sq);
        self.items.insert(pos, (index, dist_sq));
        self.items.truncate(self.k);
    }

    fn into_neighbors(self) -> Vec<Neighbor> {
        self.items
            .into_iter()
            .map(|(index, dist_sq)| Neighbor { index, distance: dist_sq.sqrt() })
            .collect()
    }
}

/// Search index over the descriptors of one stored feature set
pub struct DescriptorIndex {
    points: Vec<Descriptor>,
    trees: Vec<KdNode>,
    checks: usize,
}

impl DescriptorIndex {
    /// Build the index. With `SearchStrategy::Exact` no trees are built and
    /// every search is a linear scan.
    pub fn build(descriptors: &[Descriptor], cfg: &MatcherConfig) -> Self {
        let points = descriptors.to_vec();
        let trees = match cfg.strategy {
            SearchStrategy::Exact => Vec::new(),
            SearchStrategy::KdForest if points.is_empty() => Vec::new(),
            SearchStrategy::KdForest => {
                let indices: Vec<usize> = (0..points.len()).collect();
                (0..cfg.trees)
                    .map(|tree_id| {
                        let mut rng = SplitRng::new(tree_id as u64);
                        build_node(&points, indices.clone(), cfg.leaf_size.max(1), &mut rng)
                    })
                    .collect()
            }
        };

        Self { points, trees, checks: cfg.checks.max(1) }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Up to `k` nearest stored descriptors, closest first
    pub fn search_knn(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        if k == 0 || self.points.is_empty() {
            return Vec::new();
        }
        if self.trees.is_empty() {
            return self.search_exact(query, k);
        }

        let mut best = KnnBuffer::new(k);
        let mut heap = BinaryHeap::new();
        let mut visited = vec![false; self.points.len()];
        let mut checked = 0usize;

        for tree in &self.trees {
            self.descend(tree, query, &mut heap, &mut best, &mut visited, &mut checked);
        }

        while let Some(branch) = heap.pop() {
            if checked >= self.checks && best.is_full() {
                break;
            }
            if best.is_full() && branch.distance >= best.worst() {
                continue;
            }
            self.descend(branch.node, query, &mut heap, &mut best, &mut visited, &mut checked);
        }

        best.into_neighbors()
    }

    fn search_exact(&self, query: &[f32], k: usize) -> Vec<Neighbor> {
        let mut best = KnnBuffer::new(k);
        for (index, point) in self.points.iter().enumerate() {
            best.insert(index, squared_distance(query, point));
        }
        best.into_neighbors()
    }

    /// Follow the near side of every split down to a leaf, queueing the far
    /// sides keyed by their distance to the splitting plane
    fn descend<'a>(
        &'a self,
        mut node: &'a KdNode,
        query: &[f32],
        heap: &mut BinaryHeap<Branch<'a>>,
        best: &mut KnnBuffer,
        visited: &mut [bool],
        checked: &mut usize,
    ) {
        loop {
            match node {
                KdNode::Leaf(indices) => {
                    for &idx in indices {
                        if visited[idx] {
                            continue;
                        }
                        visited[idx] = true;
                        *checked += 1;
                        best.insert(idx, squared_distance(query, &self.points[idx]));
                    }
                    return;
                }
                KdNode::Split { dimension, value, left, right } => {
                    let diff = query.get(*dimension).copied().unwrap_or(0.0) - *value;
                    let (near, far): (&KdNode, &KdNode) = if diff < 0.0 {
                        (&**left, &**right)
                    } else {
                        (&**right, &**left)
                    };
                    heap.push(Branch { node: far, distance: diff * diff });
                    node = near;
                }
            }
        }
    }

    /// Match every query descriptor and keep those passing the ratio test
    /// `d1 < ratio_threshold * d2`
    pub fn match_query(&self, query: &[Descriptor], ratio_threshold: f32) -> Vec<Correspondence> {
        if query.is_empty() || self.points.len() < 2 {
            return Vec::new();
        }

        query
            .par_iter()
            .enumerate()
            .filter_map(|(query_idx, desc)| {
                let knn = self.search_knn(desc, 2);
                match knn.as_slice() {
                    [first, second] if first.distance < ratio_threshold * second.distance => Some(Correspondence {
                        query_idx,
                        stored_idx: first.index,
                        distance: first.distance,
                    }),
                    _ => None,
                }
            })
            .collect()
    }
}

/// Match `query` against `stored` with a freshly built index
pub fn match_descriptors(
    query: &[Descriptor],
    stored: &[Descriptor],
    cfg: &MatcherConfig,
    ratio_threshold: f32,
) -> Vec<Correspondence> {
    if query.is_empty() || stored.is_empty() {
        return Vec::new();
    }
    DescriptorIndex::build(stored, cfg).match_query(query, ratio_threshold)
}

fn build_node(points: &[Descriptor], indices: Vec<usize>, leaf_size: usize, rng: &mut SplitRng) -> KdNode {
    if indices.len() <= leaf_size || points[indices[0]].is_empty() {
        return KdNode::Leaf(indices);
    }

    let (dimension, value) = choose_split(points, &indices, rng);
    let (left, right): (Vec<usize>, Vec<usize>) = indices.iter().partition(|&&i| points[i][dimension] < value);

    // All sampled values equal on the chosen dimension
    if left.is_empty() || right.is_empty() {
        return KdNode::Leaf(indices);
    }

    KdNode::Split {
        dimension,
        value,
        left: Box::new(build_node(points, left, leaf_size, rng)),
        right: Box::new(build_node(points, right, leaf_size, rng)),
    }
}

/// Pick one of the `RAND_DIM` highest-variance dimensions and split at its
/// mean
fn choose_split(points: &[Descriptor], indices: &[usize], rng: &mut SplitRng) -> (usize, f32) {
    let dims = points[indices[0]].len();
    let sample = &indices[..indices.len().min(SAMPLE_MEAN)];
    let n = sample.len() as f32;

    let mut mean = vec![0.0f32; dims];
    for &i in sample {
        for (m, v) in mean.iter_mut().zip(&points[i]) {
            *m += v;
        }
    }
    mean.iter_mut().for_each(|m| *m /= n);

    let mut var = vec![0.0f32; dims];
    for &i in sample {
        for ((acc, v), m) in var.iter_mut().zip(&points[i]).zip(&mean) {
            *acc += (v - m) * (v - m);
        }
    }

    let mut ranked: Vec<usize> = (0..dims).collect();
    ranked.sort_by(|&a, &b| var[b].total_cmp(&var[a]).then(a.cmp(&b)));
    let top = ranked.len().min(RAND_DIM);
    let dimension = ranked[rng.below(top)];

    (dimension, mean[dimension])
}

fn squared_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Seeded xorshift so each tree is randomized but reproducible
struct SplitRng(u64);

impl SplitRng {
    fn new(seed: u64) -> Self {
        Self(seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1)
    }

    fn below(&mut self, n: usize) -> usize {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        (self.0 % n as u64) as usize
    }
}
