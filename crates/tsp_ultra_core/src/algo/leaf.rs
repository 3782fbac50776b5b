//! Independent optimisation of every leaf of a decomposition tree.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    time::Instant,
};

use rand::{SeedableRng, rngs::StdRng};
use rayon::prelude::*;

use crate::{
    algo::{
        decompose::DecompositionTree,
        kernel::{
            construct::{best_nearest_neighbor, spread_starts},
            ils::{IlsSettings, iterated_local_search},
            lin_kernighan::LkVariant,
            or_opt::or_opt,
            three_opt::three_opt,
            two_opt::two_opt,
        },
    },
    budget::Deadline,
    geometry::TourGeometry,
    node::Point,
    oracle::{DistanceOracle, knn::KnnGraph},
    tour::is_permutation,
};

/// Leaves this small keep their input order.
const TRIVIAL_LEAF: usize = 5;
/// Leaves up to this size take candidates from the dense distance block.
const DENSE_LEAF: usize = 64;
const LEAF_TWO_OPT_ITERS: usize = 50;
const LEAF_TWO_OPT_NO_IMPROVE: usize = 5;
const LEAF_OR_OPT_SWEEPS: usize = 5;
const LEAF_THREE_OPT_SWEEPS: usize = 3;
const LEAF_ILS_SHARE: f64 = 0.5;
const LEAF_SEED_STRIDE: u64 = 0x9E37_79B9_7F4A_7C15;

#[derive(Clone, Copy, Debug)]
pub(crate) struct LeafSettings {
    pub(crate) workers: usize,
    pub(crate) knn_k: usize,
    pub(crate) variant: LkVariant,
    pub(crate) seed: u64,
}

#[derive(Clone, Debug, Default)]
pub struct LeafReport {
    /// Tour length per leaf, in depth-first leaf order.
    pub lengths: Vec<f64>,
    /// Leaves re-solved on the calling thread after a worker failure.
    pub fallbacks: usize,
    pub secs: f64,
}

struct LeafJob {
    id: usize,
    members: Vec<usize>,
    seed: u64,
}

/// Solves every leaf of `tree` in place, filling `tour` and `tour_length`.
#[tsp_ultra_derive::timer("leaf")]
pub(crate) fn optimize_leaves(
    oracle: &DistanceOracle<'_>,
    tree: &mut DecompositionTree,
    settings: LeafSettings,
    deadline: &Deadline,
) -> LeafReport {
    run_leaf_pool(oracle, tree, settings, deadline, solve_leaf)
}

/// Fans `pooled` out over the worker pool. A leaf whose pooled solve panics
/// is solved again with [`solve_leaf`] on the calling thread.
fn run_leaf_pool<F>(
    oracle: &DistanceOracle<'_>,
    tree: &mut DecompositionTree,
    settings: LeafSettings,
    deadline: &Deadline,
    pooled: F,
) -> LeafReport
where
    F: Fn(&DistanceOracle<'_>, &[usize], LeafSettings, &Deadline, u64) -> Vec<usize> + Sync,
{
    let started = Instant::now();
    let jobs: Vec<LeafJob> = tree
        .leaf_ids()
        .into_iter()
        .enumerate()
        .map(|(i, id)| LeafJob {
            id,
            members: tree.node(id).points.clone(),
            seed: settings.seed ^ (i as u64 + 1).wrapping_mul(LEAF_SEED_STRIDE),
        })
        .collect();
    let workers = settings.workers.max(1);
    let rounds = (jobs.len() / workers).max(1);
    let per_leaf = deadline.remaining() / rounds as f64;
    log::info!(
        "leaf: start leaves={} workers={workers} per_leaf_s={per_leaf:.3}",
        jobs.len()
    );

    let solve = |job: &LeafJob| {
        catch_unwind(AssertUnwindSafe(|| {
            pooled(oracle, &job.members, settings, &deadline.sub(per_leaf), job.seed)
        }))
        .ok()
    };
    let results: Vec<Option<Vec<usize>>> = match rayon::ThreadPoolBuilder::new()
        .num_threads(workers)
        .thread_name(|i| format!("leaf-{i}"))
        .build()
    {
        Ok(pool) => pool.install(|| jobs.par_iter().map(solve).collect()),
        Err(err) => {
            log::warn!("leaf: worker pool unavailable err={err}, solving sequentially");
            jobs.iter().map(solve).collect()
        }
    };

    let mut report = LeafReport::default();
    for (job, result) in jobs.iter().zip(results) {
        let tour = match result {
            Some(tour) => tour,
            None => {
                log::warn!("leaf: worker failed id={} n={}, re-solving inline", job.id, job.members.len());
                report.fallbacks += 1;
                catch_unwind(AssertUnwindSafe(|| {
                    solve_leaf(oracle, &job.members, settings, &deadline.sub(per_leaf), job.seed)
                }))
                .unwrap_or_else(|_| job.members.clone())
            }
        };
        let length = TourGeometry::tour_length(oracle.points(), &tour);
        log::debug!("leaf: done id={} n={} len={length:.3}", job.id, tour.len());
        let node = tree.node_mut(job.id);
        node.tour = tour;
        node.tour_length = length;
        report.lengths.push(length);
    }
    report.secs = started.elapsed().as_secs_f64();
    log::info!(
        "leaf: complete leaves={} total_len={:.3} fallbacks={} secs={:.3}",
        report.lengths.len(),
        report.lengths.iter().sum::<f64>(),
        report.fallbacks,
        report.secs
    );
    report
}

/// Tour over `members` (global ids), returned as global ids.
pub(crate) fn solve_leaf(
    oracle: &DistanceOracle<'_>,
    members: &[usize],
    settings: LeafSettings,
    deadline: &Deadline,
    seed: u64,
) -> Vec<usize> {
    let n = members.len();
    if n <= TRIVIAL_LEAF {
        return members.to_vec();
    }
    let local: Vec<Point> = members.iter().map(|&i| oracle.points()[i]).collect();
    let knn = if n <= DENSE_LEAF {
        dense_knn(&oracle.sub_matrix(members), n, settings.knn_k)
    } else {
        KnnGraph::build(&local, settings.knn_k)
    };

    let budget = deadline.remaining();
    let mut tour = best_nearest_neighbor(&local, &knn, &spread_starts(n));
    two_opt(&local, &mut tour, &knn, LEAF_TWO_OPT_ITERS, LEAF_TWO_OPT_NO_IMPROVE, deadline);
    or_opt(&local, &mut tour, &knn, LEAF_OR_OPT_SWEEPS, deadline);
    three_opt(&local, &mut tour, &knn, LEAF_THREE_OPT_SWEEPS, deadline);

    let mut rng = StdRng::seed_from_u64(seed);
    iterated_local_search(
        &local,
        &mut tour,
        &knn,
        IlsSettings::new(settings.variant),
        &deadline.sub(budget * LEAF_ILS_SHARE),
        &mut rng,
    );

    if !is_permutation(&tour, n) {
        log::warn!("leaf: invalid local tour n={n}, keeping input order");
        return members.to_vec();
    }
    tour.into_iter().map(|l| members[l]).collect()
}

/// Candidate rows from a row-major `n`×`n` distance block.
fn dense_knn(matrix: &[f64], n: usize, k: usize) -> KnnGraph {
    let k = k.min(n.saturating_sub(1));
    let rows = (0..n)
        .map(|i| {
            let mut row: Vec<(usize, f64)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| (j, matrix[i * n + j]))
                .collect();
            row.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            row.truncate(k);
            row
        })
        .collect();
    KnnGraph::from_rows(k, rows)
}
