//! Recursive partition of the point set into bounded leaves.
//!
//! The tree is an arena: nodes live in one `Vec` and refer to each other by
//! index. Every internal node's children partition its point set exactly.

use std::collections::HashMap;

use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};

use crate::{
    Error, Result,
    geometry::{BoundingBox, TourGeometry},
    node::Point,
    oracle::{
        knn::{KnnGraph, SpatialIndex},
        laplacian::SparseLaplacian,
        spectral::{self, Spectrum},
    },
};

pub(crate) const DEFAULT_MIN_LEAF: usize = 50;
pub(crate) const DEFAULT_BOUNDARY_POINTS: usize = 20;
pub(crate) const DEFAULT_SPLIT_KNN: usize = 15;
/// Nodes larger than this are always split spatially.
const SPECTRAL_NODE_LIMIT: usize = 15_000;
const BRANCHING_PROBE_MIN_N: usize = 300;
const DEFAULT_QUAD_N: usize = 5_000;
const DEGENERATE_SHARE: f64 = 0.8;
const KMEANS_ITERS: usize = 30;
const SPLIT_EIGENVECTORS: usize = 5;
const MIN_SPECTRAL_N: usize = 5;
const ZERO_EIGENVALUE: f64 = 1e-12;

#[derive(Clone, Debug, Default)]
pub struct DecompositionNode {
    /// Global point ids owned by this node.
    pub points: Vec<usize>,
    pub children: Vec<usize>,
    pub parent: Option<usize>,
    pub level: usize,
    /// Points of a leaf closest to its neighbouring leaves, sorted.
    pub boundary: Vec<usize>,
    /// Solved cyclic order over `points`, empty until the leaf is optimised.
    pub tour: Vec<usize>,
    pub tour_length: f64,
}

impl DecompositionNode {
    fn new(points: Vec<usize>, parent: Option<usize>, level: usize) -> Self {
        Self {
            points,
            parent,
            level,
            tour_length: f64::INFINITY,
            ..Self::default()
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TreeStats {
    pub max_depth: usize,
    pub n_leaves: usize,
    pub leaf_sizes: Vec<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct DecompositionTree {
    nodes: Vec<DecompositionNode>,
}

impl DecompositionTree {
    fn push(&mut self, node: DecompositionNode) -> usize {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: usize) -> &DecompositionNode {
        &self.nodes[id]
    }

    pub(crate) fn node_mut(&mut self, id: usize) -> &mut DecompositionNode {
        &mut self.nodes[id]
    }

    /// Leaf ids in depth-first order, children visited in insertion order.
    pub fn leaf_ids(&self) -> Vec<usize> {
        let mut out = Vec::new();
        if self.nodes.is_empty() {
            return out;
        }
        let mut stack = vec![0usize];
        while let Some(id) = stack.pop() {
            let node = &self.nodes[id];
            if node.is_leaf() {
                out.push(id);
            } else {
                stack.extend(node.children.iter().rev());
            }
        }
        out
    }

    /// Position of each point's leaf in [`Self::leaf_ids`]; `usize::MAX` for
    /// points no leaf owns.
    pub(crate) fn leaf_labels(&self, n: usize) -> Vec<usize> {
        let mut labels = vec![usize::MAX; n];
        for (li, id) in self.leaf_ids().into_iter().enumerate() {
            for &p in &self.nodes[id].points {
                if p < n {
                    labels[p] = li;
                }
            }
        }
        labels
    }

    pub fn stats(&self) -> TreeStats {
        let leaves = self.leaf_ids();
        TreeStats {
            max_depth: leaves
                .iter()
                .map(|&id| self.nodes[id].level)
                .max()
                .unwrap_or(0),
            n_leaves: leaves.len(),
            leaf_sizes: leaves.iter().map(|&id| self.nodes[id].len()).collect(),
        }
    }

    /// True when the children of every internal node are pairwise disjoint
    /// and together cover the node's own points.
    pub fn is_exact_partition(&self) -> bool {
        self.nodes.iter().all(|node| {
            if node.is_leaf() {
                return true;
            }
            let mut own: Vec<usize> = node.points.clone();
            let mut union: Vec<usize> = node
                .children
                .iter()
                .flat_map(|&c| self.nodes[c].points.iter().copied())
                .collect();
            own.sort_unstable();
            union.sort_unstable();
            own == union
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct DecomposeSettings {
    pub(crate) max_leaf: usize,
    pub(crate) min_leaf: usize,
    pub(crate) spectral: bool,
    pub(crate) knn_k: usize,
    pub(crate) gap_threshold: f64,
    pub(crate) n_boundary: usize,
    pub(crate) seed: u64,
}

impl DecomposeSettings {
    /// `min_leaf` shrinks with small caps so forced tiny leaves still split.
    pub(crate) fn new(max_leaf: usize, spectral: bool) -> Self {
        let max_leaf = max_leaf.max(2);
        Self {
            max_leaf,
            min_leaf: DEFAULT_MIN_LEAF.min(max_leaf / 4).max(1),
            spectral,
            knn_k: DEFAULT_SPLIT_KNN,
            gap_threshold: 1.5,
            n_boundary: DEFAULT_BOUNDARY_POINTS,
            seed: 42,
        }
    }

    pub(crate) const fn with_knn_k(mut self, knn_k: usize) -> Self {
        self.knn_k = knn_k;
        self
    }

    pub(crate) const fn with_gap_threshold(mut self, gap_threshold: f64) -> Self {
        self.gap_threshold = gap_threshold;
        self
    }

    pub(crate) const fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

pub(crate) struct HierarchicalDecomposer<'a> {
    points: &'a [Point],
    settings: DecomposeSettings,
    rng: StdRng,
}

impl<'a> HierarchicalDecomposer<'a> {
    pub(crate) fn new(points: &'a [Point], settings: DecomposeSettings) -> Self {
        Self {
            points,
            settings,
            rng: StdRng::seed_from_u64(settings.seed),
        }
    }

    #[tsp_ultra_derive::timer("decompose")]
    pub(crate) fn decompose(mut self, knn: &KnnGraph) -> DecompositionTree {
        let n = self.points.len();
        let mut tree = DecompositionTree::default();
        let root = tree.push(DecompositionNode::new((0..n).collect(), None, 0));

        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if tree.nodes[id].len() <= self.settings.max_leaf {
                continue;
            }
            let members = tree.nodes[id].points.clone();
            let level = tree.nodes[id].level + 1;
            for part in self.split(&members) {
                let child = tree.push(DecompositionNode::new(part, Some(id), level));
                tree.nodes[id].children.push(child);
                stack.push(child);
            }
        }

        find_boundaries(&mut tree, self.points, knn, self.settings.n_boundary);
        let stats = tree.stats();
        log::info!(
            "decompose: done n={n} spectral={} leaves={} depth={} max_leaf={}",
            self.settings.spectral,
            stats.n_leaves,
            stats.max_depth,
            stats.leaf_sizes.iter().max().copied().unwrap_or(0)
        );
        tree
    }

    fn split(&mut self, members: &[usize]) -> Vec<Vec<usize>> {
        let m = members.len();
        let mut parts = if self.settings.spectral && m <= SPECTRAL_NODE_LIMIT {
            match self.spectral_split(members) {
                Ok(parts) if !is_degenerate(&parts, m) => parts,
                Ok(parts) => {
                    log::debug!(
                        "decompose: degenerate spectral split m={m} largest={}",
                        parts.iter().map(Vec::len).max().unwrap_or(0)
                    );
                    self.spatial_split(members, 2)
                }
                Err(err) => {
                    log::debug!("decompose: spectral split failed m={m} err={err}");
                    self.spatial_split(members, 2)
                }
            }
        } else {
            let ways = if m > 4 * self.settings.max_leaf { 4 } else { 2 };
            self.spatial_split(members, ways)
        };
        if is_degenerate(&parts, m) {
            log::warn!("decompose: falling back to random split m={m}");
            parts = self.random_split(members);
        }
        self.absorb_fragments(parts)
    }

    fn spectral_split(&mut self, members: &[usize]) -> Result<Vec<Vec<usize>>> {
        let m = members.len();
        if m < MIN_SPECTRAL_N {
            return Err(Error::spectral(format!("node too small m={m}")));
        }
        let local: Vec<Point> = members.iter().map(|&i| self.points[i]).collect();
        let knn = KnnGraph::build(&local, self.settings.knn_k);
        let laplacian = SparseLaplacian::from_knn(&knn);
        let spectrum = spectral::smallest_eigenpairs(
            &laplacian,
            SPLIT_EIGENVECTORS.min(m - 1),
            self.rng.random(),
        )?;
        let Some(fiedler) = spectrum.vectors.get(1) else {
            return Err(Error::spectral("missing Fiedler vector"));
        };

        let ways = self.branching(m, &spectrum);
        if ways == 2 || spectrum.vectors.len() < ways {
            return Ok(median_split(members, fiedler));
        }
        let features: Vec<Vec<f64>> = (0..m)
            .map(|row| spectrum.vectors[1..ways].iter().map(|v| v[row]).collect())
            .collect();
        let labels = kmeans(&features, ways, &mut self.rng);
        let mut parts = vec![Vec::new(); ways];
        for (row, label) in labels.into_iter().enumerate() {
            parts[label].push(members[row]);
        }
        parts.retain(|p| !p.is_empty());
        Ok(parts)
    }

    /// Bisect when the third eigenvalue sits well above the Fiedler value,
    /// quadrisect otherwise.
    fn branching(&self, m: usize, spectrum: &Spectrum) -> usize {
        if m > BRANCHING_PROBE_MIN_N
            && let (Some(&fiedler), Some(&third)) = (spectrum.values.get(1), spectrum.values.get(2))
        {
            if fiedler < ZERO_EIGENVALUE {
                return 2;
            }
            return if third / fiedler > self.settings.gap_threshold { 2 } else { 4 };
        }
        if m > DEFAULT_QUAD_N { 4 } else { 2 }
    }

    fn spatial_split(&self, members: &[usize], ways: usize) -> Vec<Vec<usize>> {
        let halves = spatial_bisect(self.points, members);
        if ways < 4 {
            return halves;
        }
        halves
            .into_iter()
            .flat_map(|half| {
                if half.len() >= 2 {
                    spatial_bisect(self.points, &half)
                } else {
                    vec![half]
                }
            })
            .collect()
    }

    fn random_split(&mut self, members: &[usize]) -> Vec<Vec<usize>> {
        let mut shuffled = members.to_vec();
        shuffled.shuffle(&mut self.rng);
        let right = shuffled.split_off(shuffled.len() / 2);
        vec![shuffled, right]
    }

    /// Parts below `min_leaf` are dissolved into the sibling with the nearest
    /// centroid, unless that would leave fewer than two parts.
    fn absorb_fragments(&self, parts: Vec<Vec<usize>>) -> Vec<Vec<usize>> {
        let min_leaf = self.settings.min_leaf;
        let (mut keep, small): (Vec<Vec<usize>>, Vec<Vec<usize>>) = parts
            .into_iter()
            .filter(|p| !p.is_empty())
            .partition(|p| p.len() >= min_leaf);
        if small.is_empty() {
            return keep;
        }
        if keep.len() < 2 {
            keep.extend(small);
            return keep;
        }

        let centroids: Vec<Point> = keep
            .iter()
            .map(|p| TourGeometry::centroid_of_indices(self.points, p))
            .collect();
        for city in small.into_iter().flatten() {
            let p = self.points[city];
            let best = centroids
                .iter()
                .enumerate()
                .min_by(|a, b| p.dist_sq(*a.1).total_cmp(&p.dist_sq(*b.1)))
                .map_or(0, |(i, _)| i);
            keep[best].push(city);
        }
        keep
    }
}

fn is_degenerate(parts: &[Vec<usize>], m: usize) -> bool {
    let non_empty = parts.iter().filter(|p| !p.is_empty()).count();
    let largest = parts.iter().map(Vec::len).max().unwrap_or(0);
    non_empty < 2 || largest as f64 > DEGENERATE_SHARE * m as f64
}

/// Median cut along the longest side of the subset's bounding box.
fn spatial_bisect(points: &[Point], members: &[usize]) -> Vec<Vec<usize>> {
    let bbox = BoundingBox::of_indices(points, members);
    let axis = bbox.longest_axis();
    let key = |i: usize| points[i].as_array()[axis];
    let mut sorted = members.to_vec();
    sorted.sort_unstable_by(|&a, &b| key(a).total_cmp(&key(b)).then(a.cmp(&b)));
    let right = sorted.split_off(sorted.len() / 2);
    vec![sorted, right]
}

fn median_split(members: &[usize], fiedler: &[f64]) -> Vec<Vec<usize>> {
    let mut rows: Vec<usize> = (0..members.len()).collect();
    rows.sort_unstable_by(|&a, &b| fiedler[a].total_cmp(&fiedler[b]).then(a.cmp(&b)));
    let half = rows.len() / 2;
    vec![
        rows[..half].iter().map(|&r| members[r]).collect(),
        rows[half..].iter().map(|&r| members[r]).collect(),
    ]
}

fn sq_dist(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum()
}

/// Lloyd's k-means with k-means++ seeding. Returns one label per row.
fn kmeans<R: Rng + ?Sized>(features: &[Vec<f64>], k: usize, rng: &mut R) -> Vec<usize> {
    let n = features.len();
    if n == 0 || k == 0 {
        return vec![0; n];
    }
    let k = k.min(n);
    let mut centres: Vec<Vec<f64>> = Vec::with_capacity(k);
    centres.push(features[rng.random_range(0..n)].clone());
    let mut nearest: Vec<f64> = features.iter().map(|f| sq_dist(f, &centres[0])).collect();
    while centres.len() < k {
        let total: f64 = nearest.iter().sum();
        let pick = if total > 0.0 {
            let mut target = rng.random::<f64>() * total;
            nearest
                .iter()
                .position(|&d| {
                    target -= d;
                    target <= 0.0
                })
                .unwrap_or(n - 1)
        } else {
            rng.random_range(0..n)
        };
        centres.push(features[pick].clone());
        let last = centres.len() - 1;
        for (row, f) in features.iter().enumerate() {
            nearest[row] = nearest[row].min(sq_dist(f, &centres[last]));
        }
    }

    let mut labels = vec![usize::MAX; n];
    for _ in 0..KMEANS_ITERS {
        let mut changed = false;
        for (row, f) in features.iter().enumerate() {
            let best = centres
                .iter()
                .enumerate()
                .min_by(|a, b| sq_dist(f, a.1).total_cmp(&sq_dist(f, b.1)))
                .map_or(0, |(c, _)| c);
            if labels[row] != best {
                labels[row] = best;
                changed = true;
            }
        }
        if !changed {
            break;
        }
        let dim = centres[0].len();
        let mut sums = vec![vec![0.0; dim]; k];
        let mut counts = vec![0usize; k];
        for (row, f) in features.iter().enumerate() {
            counts[labels[row]] += 1;
            for (s, v) in sums[labels[row]].iter_mut().zip(f) {
                *s += v;
            }
        }
        for c in 0..k {
            if counts[c] > 0 {
                centres[c] = sums[c].iter().map(|s| s / counts[c] as f64).collect();
            }
        }
    }
    labels
}

/// Marks, for every leaf, the points nearest to each neighbouring leaf.
/// Neighbouring leaves are those joined by a candidate edge; a leaf with no
/// such edge falls back to the leaf with the nearest centroid.
pub(crate) fn find_boundaries(
    tree: &mut DecompositionTree,
    points: &[Point],
    knn: &KnnGraph,
    n_boundary: usize,
) {
    let leaves = tree.leaf_ids();
    if leaves.len() < 2 || n_boundary == 0 {
        return;
    }
    let labels = tree.leaf_labels(points.len());

    let mut facing: HashMap<(usize, usize), Vec<(f64, usize)>> = HashMap::new();
    for p in 0..points.len().min(knn.len()) {
        let own = labels[p];
        for (&q, &d) in knn.neighbors(p).iter().zip(knn.distances(p)) {
            let other = labels[q];
            if other != own && own != usize::MAX && other != usize::MAX {
                facing.entry((own, other)).or_default().push((d, p));
            }
        }
    }

    let mut boundary: Vec<Vec<usize>> = vec![Vec::new(); leaves.len()];
    for ((own, _), mut hits) in facing {
        hits.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        hits.dedup_by_key(|h| h.1);
        boundary[own].extend(hits.into_iter().take(n_boundary).map(|(_, p)| p));
    }

    let centroids: Vec<Point> = leaves
        .iter()
        .map(|&id| TourGeometry::centroid_of_indices(points, &tree.node(id).points))
        .collect();
    for li in 0..leaves.len() {
        if boundary[li].is_empty() {
            boundary[li] = nearest_to_closest_leaf(points, tree, &leaves, &centroids, li, n_boundary);
        }
    }

    for (li, mut pts) in boundary.into_iter().enumerate() {
        pts.sort_unstable();
        pts.dedup();
        tree.node_mut(leaves[li]).boundary = pts;
    }
}

fn nearest_to_closest_leaf(
    points: &[Point],
    tree: &DecompositionTree,
    leaves: &[usize],
    centroids: &[Point],
    li: usize,
    n_boundary: usize,
) -> Vec<usize> {
    let Some(other) = (0..leaves.len())
        .filter(|&lj| lj != li)
        .min_by(|&a, &b| {
            centroids[li]
                .dist_sq(centroids[a])
                .total_cmp(&centroids[li].dist_sq(centroids[b]))
        })
    else {
        return Vec::new();
    };
    let other_points: Vec<Point> = tree
        .node(leaves[other])
        .points
        .iter()
        .map(|&p| points[p])
        .collect();
    if other_points.is_empty() {
        return Vec::new();
    }
    let index = SpatialIndex::new(&other_points);
    let mut hits: Vec<(f64, usize)> = tree
        .node(leaves[li])
        .points
        .iter()
        .filter_map(|&p| index.nearest_city(points[p]).map(|(_, d_sq)| (d_sq, p)))
        .collect();
    hits.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    hits.into_iter().take(n_boundary).map(|(_, p)| p).collect()
}
