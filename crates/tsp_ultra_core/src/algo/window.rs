//! Local re-optimisation of short runs of a tour.
//!
//! A window is a cyclic run of tour positions. It is cut out together with
//! its two outer anchors, optimised as a small closed tour, reopened at the
//! cheapest edge and written back only if the anchored path got shorter.

use crate::{
    algo::kernel::IMPROVEMENT_EPSILON,
    geometry::TourGeometry,
    node::Point,
    oracle::knn::KnnGraph,
    tour::is_permutation,
};

/// Windows up to this size get a brute-force candidate graph.
const DENSE_KNN_MAX: usize = 64;
const MIN_WINDOW: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Window {
    pub(crate) start: usize,
    pub(crate) len: usize,
}

impl Window {
    pub(crate) fn positions(self, n: usize) -> impl Iterator<Item = usize> {
        (0..self.len.min(n)).map(move |k| (self.start + k) % n.max(1))
    }
}

/// Where a window's candidate graph comes from.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Candidates<'a> {
    /// Restrict a global graph to the window's cities.
    Remap(&'a KnnGraph),
    /// Build a fresh k-NN graph over the window.
    Build(usize),
}

/// Merges `[c - half_width, c + half_width]` around every centre position,
/// including across the wrap, then cuts anything longer than `max_len` into
/// consecutive pieces.
pub(crate) fn merge_windows(
    centres: &[usize],
    half_width: usize,
    n: usize,
    max_len: usize,
) -> Vec<Window> {
    if n == 0 || centres.is_empty() {
        return Vec::new();
    }
    let max_len = max_len.max(MIN_WINDOW);
    let span = 2 * half_width + 1;
    let mut merged: Vec<(usize, usize)> = if span >= n {
        vec![(0, n)]
    } else {
        let mut runs: Vec<(usize, usize)> = centres
            .iter()
            .map(|&c| ((c % n + n - half_width) % n, span))
            .collect();
        runs.sort_unstable();
        runs.dedup();

        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(runs.len());
        for (s, len) in runs {
            match merged.last_mut() {
                Some((ps, plen)) if s <= *ps + *plen => {
                    *plen = (*plen).max(s + len - *ps);
                }
                _ => merged.push((s, len)),
            }
        }
        while merged.len() > 1 {
            let (first_s, first_len) = merged[0];
            let (last_s, last_len) = merged[merged.len() - 1];
            if last_s + last_len < first_s + n {
                break;
            }
            let end = (last_s + last_len).max(first_s + first_len + n);
            merged.pop();
            merged[0] = (last_s, end - last_s);
        }
        merged
            .into_iter()
            .map(|(s, len)| if len >= n { (0, n) } else { (s, len) })
            .collect()
    };
    if merged.iter().any(|&(_, len)| len >= n) {
        merged = vec![(0, n)];
    }

    let mut out = Vec::new();
    for (start, len) in merged {
        let mut offset = 0;
        while offset < len {
            let piece = max_len.min(len - offset);
            out.push(Window {
                start: (start + offset) % n,
                len: piece,
            });
            offset += piece;
        }
    }
    out
}

/// Cuts `window` out of `tour`, runs `optimize` on it as a closed local tour
/// over `0..len`, and splices the result back when it shortens the path
/// between the fixed anchors on either side. A window covering the whole
/// tour is compared as a cycle. Returns the gain, `0.0` when nothing was
/// written.
pub(crate) fn refine_window<F>(
    points: &[Point],
    tour: &mut [usize],
    window: Window,
    candidates: Candidates<'_>,
    optimize: F,
) -> f64
where
    F: FnOnce(&[Point], &mut Vec<usize>, &KnnGraph),
{
    let n = tour.len();
    let m = window.len.min(n);
    if m < MIN_WINDOW {
        return 0.0;
    }
    let cities: Vec<usize> = window.positions(n).map(|p| tour[p]).collect();
    let local: Vec<Point> = cities.iter().map(|&c| points[c]).collect();
    let knn = match candidates {
        Candidates::Remap(graph) => graph.remap(&cities),
        Candidates::Build(k) if m <= DENSE_KNN_MAX => KnnGraph::from_dense(&local, k),
        Candidates::Build(k) => KnnGraph::build(&local, k),
    };

    let mut local_tour: Vec<usize> = (0..m).collect();
    optimize(&local, &mut local_tour, &knn);
    if !is_permutation(&local_tour, m) {
        log::warn!("window: optimiser returned an invalid order len={m}, discarded");
        return 0.0;
    }

    if m == n {
        let before = TourGeometry::path_length(&local, &(0..m).collect::<Vec<_>>())
            + local[m - 1].dist(local[0]);
        let after = TourGeometry::tour_length(&local, &local_tour);
        if after < before - IMPROVEMENT_EPSILON {
            for (p, &l) in window.positions(n).zip(&local_tour) {
                tour[p] = cities[l];
            }
            return before - after;
        }
        return 0.0;
    }

    let left = points[tour[(window.start + n - 1) % n]];
    let right = points[tour[(window.start + m) % n]];
    let current = left.dist(local[0])
        + TourGeometry::path_length(&local, &(0..m).collect::<Vec<_>>())
        + local[m - 1].dist(right);

    let cycle = TourGeometry::tour_length(&local, &local_tour);
    let mut best = (f64::INFINITY, 0usize, false);
    for i in 0..m {
        let a = local_tour[i];
        let b = local_tour[(i + 1) % m];
        let open = cycle - local[a].dist(local[b]);
        let forward = open + left.dist(local[b]) + local[a].dist(right);
        let mirrored = open + left.dist(local[a]) + local[b].dist(right);
        if forward < best.0 {
            best = (forward, i, false);
        }
        if mirrored < best.0 {
            best = (mirrored, i, true);
        }
    }

    let (cost, cut, mirrored) = best;
    if cost >= current - IMPROVEMENT_EPSILON {
        return 0.0;
    }
    let path: Vec<usize> = (0..m)
        .map(|k| {
            if mirrored {
                local_tour[(cut + m - k) % m]
            } else {
                local_tour[(cut + 1 + k) % m]
            }
        })
        .collect();
    for (p, &l) in window.positions(n).zip(&path) {
        tour[p] = cities[l];
    }
    current - cost
}
