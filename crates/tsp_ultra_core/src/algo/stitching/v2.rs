//! Candidate-edge stitching.
//!
//! 1. Cross pairs: for every nearby leaf pair, boundary cities of each side are
//!    matched to their nearest city on the other side; the closest few pairs
//!    per direction are kept.
//! 2. Meta tour: a small tour over leaves on the best-pair distance matrix.
//! 3. Entry/exit: a greedy forward pass picks one cross pair per transition,
//!    scoring each by its own length plus the exact cost of the Hamiltonian
//!    path it forces through the leaf being left.

use std::collections::{HashMap, HashSet};

use crate::{
    algo::{
        kernel::IMPROVEMENT_EPSILON,
        stitching::{LeafTour, StitchTuning},
    },
    geometry::TourGeometry,
    node::Point,
    oracle::knn::SpatialIndex,
};

/// Leaf pairs whose cross pairs are evaluated up front, per leaf.
const NEAR_LEAVES: usize = 8;
const META_STARTS: usize = 8;
const META_BRUTE_FORCE_MAX: usize = 3;
const META_TWO_OPT_SWEEPS: usize = 100;

/// `(distance, city in the first leaf, city in the second leaf)`.
type CrossPair = (f64, usize, usize);

struct LeafIndex {
    index: SpatialIndex,
}

impl LeafIndex {
    fn new(points: &[Point], leaf: &LeafTour) -> Self {
        let local: Vec<Point> = leaf.tour.iter().map(|&c| points[c]).collect();
        Self {
            index: SpatialIndex::new(&local),
        }
    }

    fn nearest(&self, leaf: &LeafTour, p: Point) -> Option<(f64, usize)> {
        let (local, d_sq) = self.index.nearest_city(p)?;
        Some((d_sq.sqrt(), leaf.tour[local]))
    }
}

struct CrossPairs<'a> {
    points: &'a [Point],
    leaves: &'a [LeafTour],
    indexes: Vec<LeafIndex>,
    per_direction: usize,
    cache: HashMap<(usize, usize), Vec<CrossPair>>,
}

impl<'a> CrossPairs<'a> {
    fn new(points: &'a [Point], leaves: &'a [LeafTour], per_direction: usize) -> Self {
        Self {
            points,
            leaves,
            indexes: leaves.iter().map(|l| LeafIndex::new(points, l)).collect(),
            per_direction: per_direction.max(1),
            cache: HashMap::new(),
        }
    }

    /// Best pairs from leaf `i` to leaf `j`, shortest first. Cached per
    /// unordered pair and flipped on demand.
    fn get(&mut self, i: usize, j: usize) -> Vec<CrossPair> {
        let key = (i.min(j), i.max(j));
        if !self.cache.contains_key(&key) {
            let pairs = self.compute(key.0, key.1);
            self.cache.insert(key, pairs);
        }
        let pairs = self.cache.get(&key).cloned().unwrap_or_default();
        if i <= j {
            pairs
        } else {
            pairs.into_iter().map(|(d, a, b)| (d, b, a)).collect()
        }
    }

    fn compute(&self, i: usize, j: usize) -> Vec<CrossPair> {
        let k = self.per_direction;
        let mut forward: Vec<CrossPair> = self.leaves[i]
            .boundary
            .iter()
            .filter_map(|&a| {
                let (d, b) = self.indexes[j].nearest(&self.leaves[j], self.points[a])?;
                Some((d, a, b))
            })
            .collect();
        let mut backward: Vec<CrossPair> = self.leaves[j]
            .boundary
            .iter()
            .filter_map(|&b| {
                let (d, a) = self.indexes[i].nearest(&self.leaves[i], self.points[b])?;
                Some((d, a, b))
            })
            .collect();
        for side in [&mut forward, &mut backward] {
            side.sort_unstable_by(|x, y| x.0.total_cmp(&y.0));
            side.truncate(k);
        }

        let mut seen = HashSet::new();
        let mut pairs: Vec<CrossPair> = forward
            .into_iter()
            .chain(backward)
            .filter(|&(_, a, b)| seen.insert((a, b)))
            .collect();
        pairs.sort_unstable_by(|x, y| x.0.total_cmp(&y.0).then((x.1, x.2).cmp(&(y.1, y.2))));
        pairs.truncate(k);
        pairs
    }
}

pub(super) fn join(points: &[Point], leaves: &[LeafTour], tuning: StitchTuning) -> Vec<usize> {
    let l = leaves.len();
    match leaves {
        [] => return Vec::new(),
        [only] => return only.tour.clone(),
        _ => {}
    }

    let mut cross = CrossPairs::new(points, leaves, tuning.cross_pairs);
    let matrix = leaf_distances(leaves, &mut cross);
    let order = meta_tour(&matrix, l);
    log::debug!("stitcher.v2: meta tour leaves={l} len={:.3}", cycle_cost(&matrix, l, &order));

    let mut pos = vec![0usize; points.len()];
    for leaf in leaves {
        for (p, &c) in leaf.tour.iter().enumerate() {
            pos[c] = p;
        }
    }
    let planner = PathCost {
        points,
        pos: &pos,
    };

    // The closing transition is fixed first so the first leaf has an entry.
    let last = order[l - 1];
    let first = order[0];
    let closing = cross
        .get(last, first)
        .first()
        .copied()
        .unwrap_or_else(|| fallback_pair(points, &leaves[last], &leaves[first]));

    let mut ends: Vec<(usize, usize)> = Vec::with_capacity(l);
    let mut entry = closing.2;
    for k in 0..l - 1 {
        let here = order[k];
        let next = order[k + 1];
        let leaf = &leaves[here];
        let mut candidates = cross.get(here, next);
        if candidates.is_empty() {
            candidates.push(fallback_pair(points, leaf, &leaves[next]));
        }
        // Prefer exits different from the entry; a leaf cannot start and end
        // on the same city unless it has one.
        let pick = candidates
            .iter()
            .filter(|&&(_, a, _)| a != entry || leaf.tour.len() == 1)
            .map(|&(d, a, b)| (d + planner.cost(leaf, entry, a), a, b))
            .min_by(|x, y| x.0.total_cmp(&y.0))
            .or_else(|| {
                candidates
                    .first()
                    .map(|&(d, a, b)| (d + planner.cost(leaf, entry, a), a, b))
            });
        let Some((_, exit, next_entry)) = pick else {
            break;
        };
        ends.push((entry, exit));
        entry = next_entry;
    }
    ends.push((entry, closing.1));

    let mut tour = Vec::with_capacity(points.len());
    for (&li, &(entry, exit)) in order.iter().zip(&ends) {
        tour.extend(planner.path(&leaves[li], entry, exit));
    }
    tour
}

/// Best cross-pair distance between near leaves, centroid distance between
/// the rest.
fn leaf_distances(leaves: &[LeafTour], cross: &mut CrossPairs<'_>) -> Vec<f64> {
    let l = leaves.len();
    let mut matrix = vec![0.0; l * l];
    for i in 0..l {
        for j in i + 1..l {
            let d = leaves[i].centroid.dist(leaves[j].centroid);
            matrix[i * l + j] = d;
            matrix[j * l + i] = d;
        }
    }
    for i in 0..l {
        let mut near: Vec<usize> = (0..l).filter(|&j| j != i).collect();
        near.sort_unstable_by(|&a, &b| matrix[i * l + a].total_cmp(&matrix[i * l + b]));
        for &j in near.iter().take(NEAR_LEAVES) {
            if let Some(&(d, _, _)) = cross.get(i, j).first() {
                matrix[i * l + j] = d;
                matrix[j * l + i] = d;
            }
        }
    }
    matrix
}

fn fallback_pair(points: &[Point], from: &LeafTour, to: &LeafTour) -> CrossPair {
    let a = nearest_city(points, &from.tour, to.centroid);
    let b = nearest_city(points, &to.tour, points[a]);
    (points[a].dist(points[b]), a, b)
}

fn nearest_city(points: &[Point], cities: &[usize], target: Point) -> usize {
    cities
        .iter()
        .copied()
        .min_by(|&a, &b| points[a].dist_sq(target).total_cmp(&points[b].dist_sq(target)))
        .unwrap_or(0)
}

fn cycle_cost(matrix: &[f64], l: usize, order: &[usize]) -> f64 {
    (0..order.len())
        .map(|k| matrix[order[k] * l + order[(k + 1) % order.len()]])
        .sum()
}

/// Nearest-neighbour tours from several starts followed by 2-opt, on a dense
/// matrix. Three or fewer leaves have a single cycle.
pub(super) fn meta_tour(matrix: &[f64], l: usize) -> Vec<usize> {
    if l <= META_BRUTE_FORCE_MAX {
        return (0..l).collect();
    }
    let starts: Vec<usize> = (0..META_STARTS.min(l)).map(|s| s * l / META_STARTS.min(l)).collect();
    let mut best: Option<(f64, Vec<usize>)> = None;
    for start in starts {
        let mut order = nearest_neighbor_order(matrix, l, start);
        two_opt_matrix(matrix, l, &mut order);
        let cost = cycle_cost(matrix, l, &order);
        if best.as_ref().is_none_or(|(b, _)| cost < *b) {
            best = Some((cost, order));
        }
    }
    best.map_or_else(|| (0..l).collect(), |(_, order)| order)
}

fn nearest_neighbor_order(matrix: &[f64], l: usize, start: usize) -> Vec<usize> {
    let mut visited = vec![false; l];
    let mut order = Vec::with_capacity(l);
    let mut current = start;
    loop {
        visited[current] = true;
        order.push(current);
        let Some(next) = (0..l)
            .filter(|&j| !visited[j])
            .min_by(|&a, &b| matrix[current * l + a].total_cmp(&matrix[current * l + b]))
        else {
            return order;
        };
        current = next;
    }
}

fn two_opt_matrix(matrix: &[f64], l: usize, order: &mut [usize]) {
    let m = order.len();
    let d = |a: usize, b: usize| matrix[a * l + b];
    for _ in 0..META_TWO_OPT_SWEEPS {
        let mut improved = false;
        for i in 0..m - 1 {
            for j in i + 2..m {
                if i == 0 && j == m - 1 {
                    continue;
                }
                let (a, b) = (order[i], order[i + 1]);
                let (c, e) = (order[j], order[(j + 1) % m]);
                if d(a, c) + d(b, e) < d(a, b) + d(c, e) - IMPROVEMENT_EPSILON {
                    order[i + 1..=j].reverse();
                    improved = true;
                }
            }
        }
        if !improved {
            break;
        }
    }
}

/// Hamiltonian paths through a solved leaf between given end cities.
struct PathCost<'a> {
    points: &'a [Point],
    /// Position of every city inside its own leaf tour.
    pos: &'a [usize],
}

/// How a leaf cycle is cut into a path starting at relative position 0.
#[derive(Clone, Copy, Debug, PartialEq)]
enum Cut {
    /// `c0, c[m-1] .. c[p+1], c1 .. c[p]`
    Forward,
    /// `c0 .. c[p-1], c[m-1] .. c[p]`
    Backward,
    /// Entry equals exit: drop the longer edge at `c0`.
    Open { reversed: bool },
}

impl PathCost<'_> {
    fn d(&self, a: usize, b: usize) -> f64 {
        self.points[a].dist(self.points[b])
    }

    fn plan(&self, leaf: &LeafTour, entry: usize, exit: usize) -> (f64, Cut, usize) {
        let c = &leaf.tour;
        let m = c.len();
        let base = self.pos[entry];
        let at = |i: usize| c[(base + i) % m];
        let cycle = TourGeometry::tour_length(self.points, c);
        if m < 2 {
            return (0.0, Cut::Forward, 0);
        }
        let p = (self.pos[exit] + m - base) % m;
        if p == 0 {
            let next = self.d(at(0), at(1));
            let prev = self.d(at(0), at(m - 1));
            return if next >= prev {
                (cycle - next, Cut::Open { reversed: true }, p)
            } else {
                (cycle - prev, Cut::Open { reversed: false }, p)
            };
        }
        let forward =
            cycle - self.d(at(0), at(1)) - self.d(at(p), at((p + 1) % m)) + self.d(at((p + 1) % m), at(1));
        let backward =
            cycle - self.d(at(0), at(m - 1)) - self.d(at(p - 1), at(p)) + self.d(at(p - 1), at(m - 1));
        if forward <= backward {
            (forward, Cut::Forward, p)
        } else {
            (backward, Cut::Backward, p)
        }
    }

    fn cost(&self, leaf: &LeafTour, entry: usize, exit: usize) -> f64 {
        self.plan(leaf, entry, exit).0
    }

    fn path(&self, leaf: &LeafTour, entry: usize, exit: usize) -> Vec<usize> {
        let c = &leaf.tour;
        let m = c.len();
        if m < 2 {
            return c.clone();
        }
        let base = self.pos[entry];
        let at = |i: usize| c[(base + i) % m];
        let (_, cut, p) = self.plan(leaf, entry, exit);
        let mut out = Vec::with_capacity(m);
        out.push(at(0));
        match cut {
            Cut::Forward => {
                out.extend((p + 1..m).rev().map(at));
                out.extend((1..=p).map(at));
            }
            Cut::Backward => {
                out.extend((1..p).map(at));
                out.extend((p..m).rev().map(at));
            }
            Cut::Open { reversed: true } => out.extend((1..m).rev().map(at)),
            Cut::Open { reversed: false } => out.extend((1..m).map(at)),
        }
        out
    }
}
