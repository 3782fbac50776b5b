//! Alpha-nearness over the k-NN candidate graph.
//!
//! A Held-Karp style subgradient loop adjusts node penalties `pi` so the
//! minimum spanning forest of the candidate graph (with weights
//! `d + pi[u] + pi[v]`) approaches degree two everywhere. The alpha value of a
//! candidate edge `(i, j)` is its penalised length minus the heaviest edge on
//! the forest path between `i` and `j`.

use std::collections::VecDeque;

use crate::{
    io::options::AlphaMode,
    node::Point,
    oracle::knn::{KnnGraph, NO_NEIGHBOR},
};

/// Extra MST neighbours appended per row in augment mode.
pub(crate) const AUGMENT_EXTRA: usize = 5;
const STEP_FLOOR: f64 = 0.001;
const STEP_CAP: f64 = 1.0;
const TARGET_FACTOR: f64 = 1.05;
const CONVERGED_GRAD_SQ: f64 = 1e-12;
const NO_PARENT: usize = usize::MAX;

/// Minimum spanning forest with BFS parent links. A root is its own parent.
struct SpanningForest {
    parent: Vec<usize>,
    parent_weight: Vec<f64>,
    depth: Vec<usize>,
    component: Vec<usize>,
    degree: Vec<usize>,
    cost: f64,
}

struct DisjointSet {
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl DisjointSet {
    fn new(n: usize) -> Self {
        Self {
            parent: (0..n).collect(),
            rank: vec![0; n],
        }
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    fn union(&mut self, a: usize, b: usize) -> bool {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra == rb {
            return false;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
        true
    }
}

fn candidate_edges(knn: &KnnGraph) -> Vec<(usize, usize, f64)> {
    let mut edges = Vec::with_capacity(knn.len() * knn.width());
    for i in 0..knn.len() {
        for (&j, &d) in knn.neighbors(i).iter().zip(knn.distances(i)) {
            edges.push((i, j, d));
        }
    }
    edges
}

fn spanning_forest(n: usize, edges: &[(usize, usize, f64)], pi: &[f64]) -> SpanningForest {
    let mut weighted: Vec<(f64, usize, usize)> = edges
        .iter()
        .map(|&(u, v, d)| (d + pi[u] + pi[v], u, v))
        .collect();
    weighted.sort_unstable_by(|a, b| a.0.total_cmp(&b.0));

    let mut sets = DisjointSet::new(n);
    let mut adjacency: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
    let mut degree = vec![0usize; n];
    let mut cost = 0.0;
    for (w, u, v) in weighted {
        if sets.union(u, v) {
            adjacency[u].push((v, w));
            adjacency[v].push((u, w));
            degree[u] += 1;
            degree[v] += 1;
            cost += w;
        }
    }

    let mut parent = vec![NO_PARENT; n];
    let mut parent_weight = vec![0.0; n];
    let mut depth = vec![0usize; n];
    let mut component = vec![NO_PARENT; n];
    let mut queue = VecDeque::new();
    for root in 0..n {
        if parent[root] != NO_PARENT {
            continue;
        }
        parent[root] = root;
        component[root] = root;
        queue.push_back(root);
        while let Some(u) = queue.pop_front() {
            for &(v, w) in &adjacency[u] {
                if parent[v] == NO_PARENT {
                    parent[v] = u;
                    parent_weight[v] = w;
                    depth[v] = depth[u] + 1;
                    component[v] = root;
                    queue.push_back(v);
                }
            }
        }
    }

    SpanningForest {
        parent,
        parent_weight,
        depth,
        component,
        degree,
        cost,
    }
}

impl SpanningForest {
    /// Heaviest edge on the forest path between `a` and `b`; `None` across
    /// components.
    fn bottleneck(&self, mut a: usize, mut b: usize) -> Option<f64> {
        if self.component[a] != self.component[b] {
            return None;
        }
        let mut heaviest = 0.0_f64;
        while self.depth[a] > self.depth[b] {
            heaviest = heaviest.max(self.parent_weight[a]);
            a = self.parent[a];
        }
        while self.depth[b] > self.depth[a] {
            heaviest = heaviest.max(self.parent_weight[b]);
            b = self.parent[b];
        }
        while a != b {
            heaviest = heaviest.max(self.parent_weight[a]).max(self.parent_weight[b]);
            a = self.parent[a];
            b = self.parent[b];
        }
        Some(heaviest)
    }

    fn children(&self) -> Vec<Vec<usize>> {
        let mut children = vec![Vec::new(); self.parent.len()];
        for (v, &p) in self.parent.iter().enumerate() {
            if p != v {
                children[p].push(v);
            }
        }
        children
    }
}

/// Alpha values aligned with the live slots of every k-NN row, plus the
/// forest they were derived from.
pub(crate) struct AlphaNearness {
    alpha: Vec<Vec<f64>>,
    forest: SpanningForest,
    pub(crate) lower_bound: f64,
}

impl AlphaNearness {
    pub(crate) fn compute(knn: &KnnGraph, iterations: usize) -> Self {
        let n = knn.len();
        let edges = candidate_edges(knn);
        let mut pi = vec![0.0; n];
        let mut best_lb = f64::NEG_INFINITY;

        for iter in 0..iterations {
            let forest = spanning_forest(n, &edges, &pi);
            let lb = forest.cost - 2.0 * pi.iter().sum::<f64>();
            best_lb = best_lb.max(lb);

            let grad: Vec<f64> = forest.degree.iter().map(|&d| d as f64 - 2.0).collect();
            let grad_sq: f64 = grad.iter().map(|g| g * g).sum();
            if grad_sq < CONVERGED_GRAD_SQ {
                log::trace!("oracle.alpha: subgradient converged iter={iter}");
                break;
            }
            let target = TARGET_FACTOR * best_lb;
            let step = ((target - lb).max(STEP_FLOOR) / grad_sq).min(STEP_CAP);
            for (p, g) in pi.iter_mut().zip(&grad) {
                *p += step * g;
            }
        }

        let forest = spanning_forest(n, &edges, &pi);
        let lower_bound = if best_lb.is_finite() {
            best_lb
        } else {
            forest.cost - 2.0 * pi.iter().sum::<f64>()
        };
        let alpha = (0..n)
            .map(|i| {
                knn.neighbors(i)
                    .iter()
                    .zip(knn.distances(i))
                    .map(|(&j, &d)| {
                        let d_pi = d + pi[i] + pi[j];
                        forest
                            .bottleneck(i, j)
                            .map_or(f64::INFINITY, |b| (d_pi - b).max(0.0))
                    })
                    .collect()
            })
            .collect();

        Self {
            alpha,
            forest,
            lower_bound,
        }
    }

    pub(crate) fn row(&self, i: usize) -> &[f64] {
        &self.alpha[i]
    }

    /// Fraction of rows whose best candidate is (numerically) a forest edge.
    pub(crate) fn zero_alpha_ratio(&self) -> f64 {
        if self.alpha.is_empty() {
            return 0.0;
        }
        let zero = self
            .alpha
            .iter()
            .filter(|row| row.iter().copied().fold(f64::INFINITY, f64::min) < 1e-9)
            .count();
        zero as f64 / self.alpha.len() as f64
    }
}

/// Stable re-sort of every row by ascending alpha.
pub(crate) fn rerank(knn: &mut KnnGraph, alpha: &AlphaNearness) {
    for i in 0..knn.len() {
        let row_alpha = alpha.row(i);
        let (ids, dists) = knn.row_mut(i);
        let live = row_alpha.len();
        let mut order: Vec<usize> = (0..live).collect();
        order.sort_by(|&a, &b| row_alpha[a].total_cmp(&row_alpha[b]));
        let new_ids: Vec<usize> = order.iter().map(|&s| ids[s]).collect();
        let new_dists: Vec<f64> = order.iter().map(|&s| dists[s]).collect();
        ids[..live].copy_from_slice(&new_ids);
        dists[..live].copy_from_slice(&new_dists);
    }
}

/// Widens rows by [`AUGMENT_EXTRA`] and fills the new slots with forest
/// neighbours (parent first, then children) not already present.
pub(crate) fn augment(points: &[Point], knn: &mut KnnGraph, alpha: &AlphaNearness) {
    let base = knn.width();
    knn.widen(base + AUGMENT_EXTRA);
    let children = alpha.forest.children();
    let mut added = 0usize;

    for i in 0..knn.len() {
        let parent = alpha.forest.parent[i];
        let mut extra: Vec<usize> = Vec::with_capacity(AUGMENT_EXTRA);
        if parent != i {
            extra.push(parent);
        }
        extra.extend(children[i].iter().copied());

        let (ids, dists) = knn.row_mut(i);
        let mut free = ids
            .iter()
            .position(|&j| j == NO_NEIGHBOR)
            .unwrap_or(ids.len());
        for j in extra {
            if free >= ids.len() {
                break;
            }
            if j == i || ids[..free].contains(&j) {
                continue;
            }
            ids[free] = j;
            dists[free] = points[i].dist(points[j]);
            free += 1;
            added += 1;
        }
    }
    log::debug!(
        "oracle.alpha: augmented width={} added={added}",
        knn.width()
    );
}

/// Applies `mode` in place; returns the zero-alpha ratio (0 when off).
pub(crate) fn apply_alpha(
    points: &[Point],
    knn: &mut KnnGraph,
    mode: AlphaMode,
    iterations: usize,
) -> f64 {
    if mode == AlphaMode::Off || knn.len() < 3 {
        return 0.0;
    }
    let alpha = AlphaNearness::compute(knn, iterations);
    log::debug!(
        "oracle.alpha: mode={mode} iters={iterations} lower_bound={:.3}",
        alpha.lower_bound
    );
    let ratio = alpha.zero_alpha_ratio();
    match mode {
        AlphaMode::Rerank => rerank(knn, &alpha),
        AlphaMode::Augment => augment(points, knn, &alpha),
        AlphaMode::Off => {}
    }
    ratio
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(n: usize) -> Vec<Point> {
        (0..n).map(|i| Point::new(i as f64, 0.0)).collect()
    }

    #[test]
    fn bottleneck_on_a_path_is_the_longest_edge_between() {
        let points = vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(4.0, 0.0),
            Point::new(5.0, 0.0),
        ];
        let knn = KnnGraph::build(&points, 3);
        let edges = candidate_edges(&knn);
        let forest = spanning_forest(points.len(), &edges, &[0.0; 4]);

        assert!((forest.bottleneck(0, 3).expect("same tree") - 3.0).abs() < 1e-12);
        assert!((forest.bottleneck(0, 1).expect("same tree") - 1.0).abs() < 1e-12);
        assert!((forest.cost - 5.0).abs() < 1e-12);
    }

    #[test]
    fn forest_edges_have_zero_alpha() {
        let points = line(10);
        let knn = KnnGraph::build(&points, 3);
        let alpha = AlphaNearness::compute(&knn, 0);
        for i in 0..points.len() {
            let first = knn.neighbors(i)[0];
            assert_eq!((first as isize - i as isize).abs(), 1);
            assert!(alpha.row(i)[0] < 1e-9);
        }
        assert!((alpha.zero_alpha_ratio() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn disconnected_components_get_infinite_alpha() {
        let mut points = line(4);
        points.extend((0..4).map(|i| Point::new(100.0 + i as f64, 0.0)));
        let knn = KnnGraph::build(&points, 2);
        let edges = candidate_edges(&knn);
        let forest = spanning_forest(points.len(), &edges, &[0.0; 8]);
        assert!(forest.bottleneck(0, 7).is_none());
    }

    #[test]
    fn rerank_keeps_the_same_neighbour_set() {
        let points = line(12);
        let mut knn = KnnGraph::build(&points, 4);
        let before: Vec<Vec<usize>> = (0..12)
            .map(|i| {
                let mut row = knn.neighbors(i).to_vec();
                row.sort_unstable();
                row
            })
            .collect();
        apply_alpha(&points, &mut knn, AlphaMode::Rerank, 10);

        assert!(knn.is_well_formed());
        for (i, row) in before.iter().enumerate() {
            let mut after = knn.neighbors(i).to_vec();
            after.sort_unstable();
            assert_eq!(&after, row);
        }
    }

    #[test]
    fn augment_widens_rows_and_stays_well_formed() {
        let points = line(9);
        let mut knn = KnnGraph::build(&points, 2);
        apply_alpha(&points, &mut knn, AlphaMode::Augment, 5);

        assert_eq!(knn.width(), 2 + AUGMENT_EXTRA);
        assert!(knn.is_well_formed());
        assert!(knn.neighbors(4).len() >= 2);
    }

    #[test]
    fn off_mode_leaves_graph_untouched() {
        let points = line(6);
        let mut knn = KnnGraph::build(&points, 2);
        let ratio = apply_alpha(&points, &mut knn, AlphaMode::Off, 50);
        assert_eq!(ratio, 0.0);
        assert_eq!(knn.width(), 2);
    }
}
