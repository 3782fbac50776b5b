//! Joins solved leaf tours into one global tour.
//!
//! `v1` concatenates leaves in greedy centroid order; `v2` plans leaf order and
//! entry/exit cities from candidate cross edges. Both end with the same
//! validation, repair and seam polishing.

mod metrics;
mod v1;
mod v2;

use std::time::Instant;

pub use metrics::StitchMetrics;
pub(crate) use metrics::seam_positions;

use crate::{
    Error, Result,
    algo::{
        decompose::DecompositionTree,
        kernel::{
            construct::nearest_neighbor_tour, or_opt::or_opt, three_opt::three_opt, two_opt::two_opt,
        },
        window::{Candidates, merge_windows, refine_window},
    },
    budget::Deadline,
    geometry::TourGeometry,
    node::Point,
    options::StitchMode,
    oracle::DistanceOracle,
    tour::{is_permutation, repair_permutation},
};

#[derive(Clone, Copy, Debug)]
pub(crate) struct StitchTuning {
    /// Cross-leaf candidate pairs kept per direction.
    pub(crate) cross_pairs: usize,
    pub(crate) v1_window: usize,
    pub(crate) v1_passes: usize,
    pub(crate) v2_window: usize,
    pub(crate) v2_passes: usize,
    /// Windows longer than this skip 3-opt.
    pub(crate) three_opt_max: usize,
    pub(crate) max_window: usize,
    pub(crate) rebuild_two_opt_iters: usize,
    pub(crate) rebuild_two_opt_no_improve: usize,
}

impl Default for StitchTuning {
    fn default() -> Self {
        Self {
            cross_pairs: 5,
            v1_window: 150,
            v1_passes: 1,
            v2_window: 300,
            v2_passes: 3,
            three_opt_max: 500,
            max_window: 1_200,
            rebuild_two_opt_iters: 20,
            rebuild_two_opt_no_improve: 5,
        }
    }
}

#[derive(Clone, Debug)]
pub(crate) struct StitchOutcome {
    pub(crate) tour: Vec<usize>,
    /// Length straight after joining, before seam polishing.
    pub(crate) raw_length: f64,
    pub(crate) length: f64,
    pub(crate) metrics: StitchMetrics,
    /// Leaf of every city, as used for seam detection.
    pub(crate) labels: Vec<usize>,
}

/// A solved leaf ready for joining.
#[derive(Clone, Debug)]
pub(crate) struct LeafTour {
    pub(crate) tour: Vec<usize>,
    pub(crate) centroid: Point,
    /// Cities facing other leaves; the whole leaf when none were marked.
    pub(crate) boundary: Vec<usize>,
}

pub(crate) fn leaf_tours(tree: &DecompositionTree, points: &[Point]) -> Vec<LeafTour> {
    tree.leaf_ids()
        .into_iter()
        .map(|id| {
            let node = tree.node(id);
            let tour = if node.tour.len() == node.len() {
                node.tour.clone()
            } else {
                node.points.clone()
            };
            let boundary = if node.boundary.is_empty() {
                node.points.clone()
            } else {
                node.boundary.clone()
            };
            LeafTour {
                centroid: TourGeometry::centroid_of_indices(points, &node.points),
                tour,
                boundary,
            }
        })
        .filter(|leaf| !leaf.tour.is_empty())
        .collect()
}

/// Stitches the solved leaves of `tree`, then polishes the seams.
#[tsp_ultra_derive::timer("stitcher")]
pub(crate) fn stitch(
    oracle: &DistanceOracle<'_>,
    tree: &DecompositionTree,
    mode: StitchMode,
    tuning: StitchTuning,
    deadline: &Deadline,
) -> Result<StitchOutcome> {
    let started = Instant::now();
    let points = oracle.points();
    let n = points.len();
    let leaves = leaf_tours(tree, points);
    log::info!("stitcher: start mode={mode} leaves={} n={n}", leaves.len());

    let mut tour = match mode {
        StitchMode::V1 => v1::join(points, &leaves),
        StitchMode::V2 => v2::join(points, &leaves, tuning),
    };
    let tour_ok = ensure_valid(oracle, &mut tour, tuning, deadline)?;
    let raw_length = TourGeometry::tour_length(points, &tour);

    let labels = tree.leaf_labels(n);
    let (window, passes) = match mode {
        StitchMode::V1 => (tuning.v1_window, tuning.v1_passes),
        StitchMode::V2 => (tuning.v2_window, tuning.v2_passes),
    };
    let gain = polish_seams(oracle, &mut tour, &labels, window, passes, tuning, deadline);

    let length = TourGeometry::tour_length(points, &tour);
    let metrics = StitchMetrics::compute(points, &tour, &labels);
    log::info!(
        "stitcher: complete mode={mode} raw_len={raw_length:.3} len={length:.3} seam_gain={gain:.3} repaired={} {metrics} secs={:.3}",
        !tour_ok,
        started.elapsed().as_secs_f64()
    );
    Ok(StitchOutcome {
        tour,
        raw_length,
        length,
        metrics,
        labels,
    })
}

/// Returns `Ok(true)` when the joined tour was already a permutation. Invalid
/// tours are repaired by cheapest insertion, then rebuilt from scratch.
fn ensure_valid(
    oracle: &DistanceOracle<'_>,
    tour: &mut Vec<usize>,
    tuning: StitchTuning,
    deadline: &Deadline,
) -> Result<bool> {
    let points = oracle.points();
    let n = points.len();
    if is_permutation(tour, n) {
        return Ok(true);
    }
    let inserted = repair_permutation(points, tour);
    log::warn!("stitcher: invalid joined tour, repaired inserted={inserted}");
    if is_permutation(tour, n) {
        return Ok(false);
    }

    log::warn!("stitcher: repair failed, rebuilding n={n}");
    *tour = rebuild(points, oracle, tuning, deadline);
    if is_permutation(tour, n) {
        Ok(false)
    } else {
        Err(Error::invalid_tour(format!(
            "stitched tour unrecoverable len={} n={n}",
            tour.len()
        )))
    }
}

fn rebuild(
    points: &[Point],
    oracle: &DistanceOracle<'_>,
    tuning: StitchTuning,
    deadline: &Deadline,
) -> Vec<usize> {
    let mut tour = nearest_neighbor_tour(points, oracle.knn(), 0);
    two_opt(
        points,
        &mut tour,
        oracle.knn(),
        tuning.rebuild_two_opt_iters,
        tuning.rebuild_two_opt_no_improve,
        deadline,
    );
    tour
}

/// Windowed local search centred on every seam. Seams are re-detected at the
/// start of each pass; stops early after a pass without gain.
#[tsp_ultra_derive::timer("stitcher.seams")]
pub(crate) fn polish_seams(
    oracle: &DistanceOracle<'_>,
    tour: &mut [usize],
    labels: &[usize],
    half_width: usize,
    passes: usize,
    tuning: StitchTuning,
    deadline: &Deadline,
) -> f64 {
    let points = oracle.points();
    let n = tour.len();
    let mut total = 0.0;
    for pass in 0..passes {
        let seams = seam_positions(tour, labels);
        if seams.is_empty() || deadline.expired() {
            break;
        }
        let windows = merge_windows(&seams, half_width, n, tuning.max_window);
        let mut pass_gain = 0.0;
        for window in &windows {
            if deadline.expired() {
                break;
            }
            pass_gain += refine_window(
                points,
                tour,
                *window,
                Candidates::Remap(oracle.knn()),
                |local, order, knn| seam_local_search(local, order, knn, tuning, deadline),
            );
        }
        total += pass_gain;
        log::debug!(
            "stitcher.seams: pass={} seams={} windows={} gain={pass_gain:.3}",
            pass + 1,
            seams.len(),
            windows.len()
        );
        if pass_gain <= 0.0 {
            break;
        }
    }
    total
}

fn seam_local_search(
    points: &[Point],
    order: &mut Vec<usize>,
    knn: &crate::oracle::knn::KnnGraph,
    tuning: StitchTuning,
    deadline: &Deadline,
) {
    two_opt(points, order, knn, 20, 5, deadline);
    or_opt(points, order, knn, 3, deadline);
    if order.len() <= tuning.three_opt_max {
        three_opt(points, order, knn, 2, deadline);
    }
    two_opt(points, order, knn, 10, 3, deadline);
}
