//! End-to-end solve: oracle, routing, decomposition, leaves, stitching,
//! V-cycle and polish, keeping a running best that only ever shortens.

use std::time::Instant;

use rand::{SeedableRng, rngs::StdRng};
use tsp_ultra_derive::KvDisplay;

use crate::{
    Error, Result,
    algo::{
        decompose::{DecomposeSettings, HierarchicalDecomposer},
        kernel::{
            IMPROVEMENT_EPSILON,
            construct::nearest_neighbor_tour,
            lin_kernighan::{LkSchedule, lin_kernighan},
            or_opt::or_opt,
            three_opt::three_opt,
            two_opt::two_opt,
        },
        leaf::{LeafSettings, optimize_leaves},
        polish::{PolishSettings, polish},
        stitching::{StitchTuning, stitch},
        vcycle::{VCyclePlan, refine},
    },
    budget::{Deadline, worker_count},
    node::Point,
    options::{DEFAULT_MAX_LEAF_SIZE, SolverOptions},
    oracle::DistanceOracle,
    router::{RoutingThresholds, SolverConfig, StrategyRouter, fingerprint::InstanceFingerprint},
    tour::validate_permutation,
};

/// Below this many points every order is optimal.
const TRIVIAL_N: usize = 4;
const LARGE_N: usize = 20_000;
const LARGE_LEAF_FRACTION: f64 = 0.35;
const ADAPTIVE_LEAF_TARGET: usize = 1_500;
const MIN_TARGET_LEAVES: usize = 24;
const MAX_TARGET_LEAVES: usize = 100;
const MIN_ADAPTIVE_LEAF: usize = 2_000;
const MAX_LEAF_CAP: usize = 3_000;
const CLUSTERED_LEAF_SCALE: f64 = 0.85;
const DECOMPOSE_KNN_CAP: usize = 15;
const POLISH_KNN: usize = 30;
const MIN_REBUILD_SECS: f64 = 3.0;
const DIRECT_TWO_OPT_ITERS: usize = 30;
const DIRECT_TWO_OPT_NO_IMPROVE: usize = 3;
const DIRECT_LK_ITERS: usize = 30;
const DIRECT_LK_NO_IMPROVE: usize = 3;

/// Per-phase timings and quality figures of one solve.
#[derive(Clone, Debug, Default, KvDisplay)]
pub struct PhaseDiagnostics {
    #[kv(fmt = "fixed")]
    pub oracle_secs: f64,
    #[kv(fmt = "fixed")]
    pub oracle_memory_mb: f64,
    pub oracle_k: usize,
    pub fingerprint: String,
    pub decomposed: bool,
    pub tree_depth: usize,
    pub tree_leaves: usize,
    pub leaf_size_min: usize,
    pub leaf_size_max: usize,
    #[kv(fmt = "len", name = "leaf_tours")]
    pub leaf_lengths: Vec<f64>,
    #[kv(fmt = "fixed")]
    pub leaf_secs: f64,
    pub leaf_fallbacks: usize,
    #[kv(fmt = "fixed")]
    pub stitch_length: f64,
    #[kv(fmt = "fixed")]
    pub stitch_ratio: f64,
    pub stitch_count: usize,
    #[kv(fmt = "fixed")]
    pub stitch_stress: f64,
    #[kv(fmt = "fixed")]
    pub vcycle_before: f64,
    #[kv(fmt = "fixed")]
    pub vcycle_after: f64,
    #[kv(fmt = "fixed")]
    pub vcycle_gain: f64,
    #[kv(fmt = "fixed")]
    pub polish_before: f64,
    #[kv(fmt = "fixed")]
    pub polish_after: f64,
    #[kv(fmt = "fixed")]
    pub polish_gain: f64,
    pub polish_k: usize,
}

#[derive(Clone, Debug)]
pub struct SolveReport {
    /// Visiting order, a permutation of `0..n`.
    pub tour: Vec<usize>,
    pub length: f64,
    pub strategy: String,
    pub diagnostics: PhaseDiagnostics,
    pub total_secs: f64,
}

struct RunningBest {
    tour: Vec<usize>,
    length: f64,
}

impl RunningBest {
    /// Takes `tour` only when it is strictly shorter.
    fn offer(&mut self, phase: &str, tour: Vec<usize>, length: f64) {
        if length < self.length - IMPROVEMENT_EPSILON {
            log::debug!("solve: best improved phase={phase} len={length:.3}");
            self.tour = tour;
            self.length = length;
        }
    }
}

/// Wall-clock split between the construction phases and the polisher.
#[derive(Clone, Copy, Debug)]
struct PhaseBudget {
    total: Deadline,
    /// Leaves `polish_fraction` of the remaining budget to the polisher.
    construct: Deadline,
}

impl PhaseBudget {
    fn split(total: Deadline, polish_fraction: f64) -> Self {
        Self {
            total,
            construct: total.fraction(1.0 - polish_fraction.clamp(0.0, 1.0)),
        }
    }

    /// `fraction` of the overall remaining time, cut at the construction end.
    fn share(&self, fraction: f64) -> Deadline {
        self.construct
            .sub(self.total.remaining() * fraction.clamp(0.0, 1.0))
    }
}

/// Solves the instance within `options.time_budget` seconds.
///
/// Returns an error for empty input, non-finite coordinates or invalid
/// options; any accepted input yields a valid permutation, even with a zero
/// budget.
#[tsp_ultra_derive::timer("solve")]
pub fn solve(points: &[Point], options: &SolverOptions) -> Result<SolveReport> {
    let started = Instant::now();
    options.validate()?;
    validate_points(points)?;
    let n = points.len();
    let deadline = Deadline::after_secs(options.time_budget);
    log::info!(
        "solve: start n={n} budget_s={:.1} k={} leaf_cap={}",
        options.time_budget,
        options.knn_k,
        options.max_leaf_size
    );

    if n < TRIVIAL_N {
        let tour: Vec<usize> = (0..n).collect();
        let length = crate::geometry::TourGeometry::tour_length(points, &tour);
        return Ok(SolveReport {
            tour,
            length,
            strategy: "trivial".to_owned(),
            diagnostics: PhaseDiagnostics::default(),
            total_secs: started.elapsed().as_secs_f64(),
        });
    }

    let mut diag = PhaseDiagnostics::default();
    let mut oracle = DistanceOracle::new(points, options.knn_k);
    oracle.apply_alpha(options.alpha, options.alpha_iters);
    diag.oracle_secs = oracle.build_secs();
    diag.oracle_memory_mb = oracle.memory_estimate_mb();
    diag.oracle_k = oracle.k();

    let fp = InstanceFingerprint::compute(&oracle, options.fingerprint, options.seed);
    let config = StrategyRouter::route(&fp, options);
    diag.fingerprint = fp.summary(&config.thresholds);
    log::info!("router: {}", config.explain(&fp));

    let budget = PhaseBudget::split(deadline, config.polish_fraction);
    let mut rng = StdRng::seed_from_u64(options.seed);
    let mut best = if config.decompose {
        decomposed_tour(&oracle, &config, &fp, options, &budget, &mut rng, &mut diag)?
    } else {
        direct_tour(&oracle, &config, &budget.construct)
    };
    diag.decomposed = config.decompose;

    if options.rebuild_knn && deadline.remaining() > MIN_REBUILD_SECS {
        let k = POLISH_KNN.min(n - 1);
        if k > oracle.k() {
            oracle.rebuild_knn(k, config.alpha);
        }
    }

    let mut polished = best.tour.clone();
    let report = polish(
        &oracle,
        &mut polished,
        PolishSettings::new(config.lk_variant),
        &deadline,
        &mut rng,
    );
    diag.polish_before = report.before;
    diag.polish_after = report.after;
    diag.polish_gain = report.gain;
    diag.polish_k = report.knn_k;
    best.offer("polish", polished, report.after);

    validate_permutation(&best.tour, n)?;
    let total_secs = started.elapsed().as_secs_f64();
    log::info!(
        "solve: complete n={n} len={:.3} strategy={} secs={total_secs:.3}",
        best.length,
        config.strategy
    );
    Ok(SolveReport {
        tour: best.tour,
        length: best.length,
        strategy: config.strategy,
        diagnostics: diag,
        total_secs,
    })
}

fn validate_points(points: &[Point]) -> Result<()> {
    if points.is_empty() {
        return Err(Error::invalid_input("no points"));
    }
    if let Some(i) = points.iter().position(|p| !p.is_valid()) {
        return Err(Error::invalid_input(format!(
            "point {i} has a non-finite coordinate"
        )));
    }
    Ok(())
}

/// Leaf cap after the size-driven adjustments; the user's cap wins unless it
/// is the default.
fn adaptive_leaf_size(
    n: usize,
    requested: usize,
    routed: usize,
    cv_nn_dist: f64,
    th: &RoutingThresholds,
) -> usize {
    let mut leaf = routed;
    if requested == DEFAULT_MAX_LEAF_SIZE && n > LARGE_N {
        let target = (n / ADAPTIVE_LEAF_TARGET).clamp(MIN_TARGET_LEAVES, MAX_TARGET_LEAVES);
        leaf = (n / target).max(MIN_ADAPTIVE_LEAF);
        if cv_nn_dist > th.cv_clustered {
            leaf = (leaf as f64 * CLUSTERED_LEAF_SCALE) as usize;
        }
    }
    leaf.min(MAX_LEAF_CAP).min((n / 3).max(1)).max(2)
}

fn decomposed_tour(
    oracle: &DistanceOracle<'_>,
    config: &SolverConfig,
    fp: &InstanceFingerprint,
    options: &SolverOptions,
    budget: &PhaseBudget,
    rng: &mut StdRng,
    diag: &mut PhaseDiagnostics,
) -> Result<RunningBest> {
    let points = oracle.points();
    let n = points.len();
    let max_leaf = adaptive_leaf_size(
        n,
        options.max_leaf_size,
        config.max_leaf_size,
        fp.cv_nn_dist,
        &config.thresholds,
    );
    let settings = DecomposeSettings::new(max_leaf, config.spectral)
        .with_knn_k(options.knn_k.min(DECOMPOSE_KNN_CAP))
        .with_gap_threshold(config.thresholds.gap_threshold)
        .with_seed(options.seed);
    let mut tree = HierarchicalDecomposer::new(points, settings).decompose(oracle.knn());
    let stats = tree.stats();
    diag.tree_depth = stats.max_depth;
    diag.tree_leaves = stats.n_leaves;
    diag.leaf_size_min = stats.leaf_sizes.iter().copied().min().unwrap_or(0);
    diag.leaf_size_max = stats.leaf_sizes.iter().copied().max().unwrap_or(0);

    let leaf_fraction = if n > LARGE_N {
        LARGE_LEAF_FRACTION
    } else {
        config.leaf_fraction
    };
    let leaf_settings = LeafSettings {
        workers: worker_count(options.workers),
        knn_k: options.knn_k,
        variant: config.lk_variant,
        seed: options.seed,
    };
    let leaves = optimize_leaves(oracle, &mut tree, leaf_settings, &budget.share(leaf_fraction));
    diag.leaf_lengths = leaves.lengths;
    diag.leaf_secs = leaves.secs;
    diag.leaf_fallbacks = leaves.fallbacks;

    let deadline = &budget.construct;
    let stitched = stitch(oracle, &tree, config.stitch, StitchTuning::default(), deadline)?;
    diag.stitch_length = stitched.length;
    diag.stitch_ratio = stitched.metrics.stitch_ratio;
    diag.stitch_count = stitched.metrics.stitch_count;
    diag.stitch_stress = stitched.metrics.max_stitch_stress;
    let mut best = RunningBest {
        length: stitched.length,
        tour: stitched.tour,
    };

    let plan = VCyclePlan::adaptive(
        n,
        config.vcycle_fraction,
        deadline.remaining(),
        &stitched.metrics,
        &config.thresholds,
    );
    let labels = (stats.n_leaves > 1).then_some(stitched.labels.as_slice());
    let mut refined = best.tour.clone();
    let report = refine(
        oracle,
        &mut refined,
        labels,
        plan,
        config.lk_variant,
        &deadline.fraction(plan.fraction),
        rng,
    );
    diag.vcycle_before = report.before;
    diag.vcycle_after = report.after;
    diag.vcycle_gain = report.gain;
    best.offer("vcycle", refined, report.after);
    Ok(best)
}

/// Construction plus local search on the whole instance.
fn direct_tour(oracle: &DistanceOracle<'_>, config: &SolverConfig, deadline: &Deadline) -> RunningBest {
    let points = oracle.points();
    let knn = oracle.knn();
    let mut tour = nearest_neighbor_tour(points, knn, 0);
    two_opt(
        points,
        &mut tour,
        knn,
        DIRECT_TWO_OPT_ITERS,
        DIRECT_TWO_OPT_NO_IMPROVE,
        deadline,
    );
    three_opt(points, &mut tour, knn, 1, deadline);
    or_opt(points, &mut tour, knn, 1, deadline);
    let schedule = LkSchedule::new(config.lk_variant, DIRECT_LK_ITERS, DIRECT_LK_NO_IMPROVE);
    lin_kernighan(points, &mut tour, knn, schedule, deadline);
    let length = oracle.tour_length(&tour);
    log::info!("solve: direct tour len={length:.3} variant={}", config.lk_variant.label());
    RunningBest { tour, length }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        algo::kernel::test_support::{assert_valid, random_points},
        options::DecomposeMode,
    };

    fn options(budget: f64) -> SolverOptions {
        SolverOptions {
            time_budget: budget,
            workers: 2,
            ..SolverOptions::default()
        }
    }

    #[test]
    fn unit_square_is_solved_exactly() {
        let points = vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(1.0, 0.0),
            Point::new(0.0, 1.0),
        ];
        let report = solve(&points, &options(1.0)).expect("solve");
        assert_valid(&report.tour, 4);
        assert!((report.length - 4.0).abs() < 1e-9);
        assert!(!report.diagnostics.decomposed);
    }

    #[test]
    fn forced_decomposition_with_tiny_leaves() {
        let points = random_points(50, 121);
        let opts = SolverOptions {
            max_leaf_size: 10,
            decompose: DecomposeMode::Spatial,
            ..options(2.0)
        };
        let report = solve(&points, &opts).expect("solve");
        assert_valid(&report.tour, 50);
        assert!(report.diagnostics.decomposed);
        assert!(report.diagnostics.tree_leaves >= 5);
        assert!(report.diagnostics.leaf_size_max <= 10);
        assert_eq!(report.strategy, "forced-spatial");
        assert!(report.length <= report.diagnostics.stitch_length + 1e-9);
        let recomputed = crate::geometry::TourGeometry::tour_length(&points, &report.tour);
        assert!((recomputed - report.length).abs() < 1e-6);
    }

    #[test]
    fn small_auto_instance_skips_decomposition() {
        let points = random_points(400, 122);
        let report = solve(&points, &options(1.5)).expect("solve");
        assert_valid(&report.tour, 400);
        assert_eq!(report.strategy, "no-decompose-small");
        assert!(report.length <= report.diagnostics.polish_before + 1e-9);
    }

    #[test]
    fn zero_budget_still_returns_a_permutation() {
        let points = random_points(300, 123);
        let opts = SolverOptions {
            decompose: DecomposeMode::Spatial,
            max_leaf_size: 60,
            ..options(0.0)
        };
        let report = solve(&points, &opts).expect("solve");
        assert_valid(&report.tour, 300);
    }

    #[test]
    fn invalid_inputs_are_rejected() {
        assert!(solve(&[], &options(1.0)).is_err());
        let points = vec![Point::new(0.0, 0.0), Point::new(f64::NAN, 1.0)];
        let err = solve(&points, &options(1.0)).expect_err("nan");
        assert!(err.to_string().contains("point 1"));
        let bad = SolverOptions {
            knn_k: 0,
            ..options(1.0)
        };
        assert!(solve(&random_points(10, 1), &bad).is_err());
    }

    #[test]
    fn tiny_inputs_are_returned_in_order() {
        let points = vec![Point::new(0.0, 0.0), Point::new(3.0, 4.0)];
        let report = solve(&points, &options(1.0)).expect("solve");
        assert_eq!(report.tour, vec![0, 1]);
        assert!((report.length - 10.0).abs() < 1e-12);
    }

    #[test]
    fn adaptive_leaf_size_follows_scale() {
        let th = RoutingThresholds::default();
        assert_eq!(adaptive_leaf_size(100_000, DEFAULT_MAX_LEAF_SIZE, 1_500, 0.5, &th), 2_000);
        assert_eq!(adaptive_leaf_size(200_000, DEFAULT_MAX_LEAF_SIZE, 1_500, 0.5, &th), 2_000);
        assert_eq!(adaptive_leaf_size(300_000, DEFAULT_MAX_LEAF_SIZE, 1_500, 0.5, &th), 3_000);
        assert_eq!(adaptive_leaf_size(300_000, DEFAULT_MAX_LEAF_SIZE, 1_500, 0.9, &th), 2_550);
        assert_eq!(adaptive_leaf_size(100_000, 800, 800, 0.5, &th), 800);
        assert_eq!(adaptive_leaf_size(50, 10, 10, 0.5, &th), 10);
        assert_eq!(adaptive_leaf_size(5_000, DEFAULT_MAX_LEAF_SIZE, 1_500, 0.5, &th), 1_500);
    }

    #[test]
    fn clustered_leaf_scaling_uses_the_configured_cutoff() {
        let opts = SolverOptions {
            cv_clustered: 0.95,
            ..SolverOptions::default()
        };
        let relaxed = RoutingThresholds::from_options(&opts);
        assert_eq!(adaptive_leaf_size(300_000, DEFAULT_MAX_LEAF_SIZE, 1_500, 0.9, &relaxed), 3_000);
        let strict = RoutingThresholds {
            cv_clustered: 0.3,
            ..RoutingThresholds::default()
        };
        assert_eq!(adaptive_leaf_size(300_000, DEFAULT_MAX_LEAF_SIZE, 1_500, 0.5, &strict), 2_550);
    }

    #[test]
    fn running_best_only_takes_strictly_shorter_tours() {
        let mut best = RunningBest {
            tour: vec![0, 1, 2, 3],
            length: 10.0,
        };
        best.offer("longer", vec![3, 2, 1, 0], 12.0);
        assert_eq!(best.tour, vec![0, 1, 2, 3]);
        best.offer("equal", vec![1, 2, 3, 0], 10.0);
        assert_eq!(best.tour, vec![0, 1, 2, 3]);
        assert_eq!(best.length, 10.0);
        best.offer("shorter", vec![0, 2, 1, 3], 9.5);
        assert_eq!(best.tour, vec![0, 2, 1, 3]);
        assert_eq!(best.length, 9.5);
    }

    #[test]
    fn phase_budget_reserves_the_polish_share() {
        let budget = PhaseBudget::split(Deadline::after_secs(10.0), 0.35);
        assert!(budget.construct.remaining() <= 6.5 + 1e-3);
        assert!(budget.construct.remaining() > 6.0);
        let leaves = budget.share(0.5);
        assert!(leaves.remaining() <= 5.0 + 1e-3);
        assert!(leaves.remaining() > 4.5);
        // Capped at the construction end.
        assert!(budget.share(0.9).remaining() <= budget.construct.remaining() + 1e-6);
        assert!(budget.total.remaining() > 9.0);
    }

    #[test]
    fn stacked_duplicate_points_are_solved() {
        let stacked = vec![Point::new(2.0, 2.0); 40];
        let report = solve(&stacked, &options(1.0)).expect("solve");
        assert_valid(&report.tour, 40);
        assert_eq!(report.length, 0.0);

        let two_sites: Vec<Point> = (0..200).map(|i| Point::new((i % 2) as f64, 0.0)).collect();
        let report = solve(&two_sites, &options(1.0)).expect("solve");
        assert_valid(&report.tour, 200);
        assert!((report.length - 2.0).abs() < 1e-9, "len={}", report.length);

        let opts = SolverOptions {
            decompose: DecomposeMode::Spatial,
            max_leaf_size: 30,
            ..options(1.0)
        };
        let report = solve(&two_sites, &opts).expect("solve");
        assert_valid(&report.tour, 200);
        assert!(report.length.is_finite());
    }
}
