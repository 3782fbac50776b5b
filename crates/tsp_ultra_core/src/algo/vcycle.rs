//! Seam-focused refinement of a stitched tour.
//!
//! Each cycle collects the seams (edges between leaves) and the longest
//! remaining edges, grows windows around them and re-optimises every window
//! with the anchored splice from [`crate::algo::window`]. Without leaf
//! information the tour is swept with overlapping uniform windows instead.

use std::time::Instant;

use rand::Rng;

use crate::{
    algo::{
        kernel::{
            ils::{IlsSettings, iterated_local_search},
            lin_kernighan::LkVariant,
            or_opt::or_opt,
            three_opt::three_opt,
            two_opt::two_opt,
        },
        stitching::{StitchMetrics, seam_positions},
        window::{Candidates, Window, merge_windows, refine_window},
    },
    budget::Deadline,
    geometry::TourGeometry,
    node::Point,
    oracle::{DistanceOracle, knn::KnnGraph},
    router::RoutingThresholds,
};

const LARGE_N: usize = 20_000;
const LARGE_FRACTION: f64 = 0.75;
const MAX_FRACTION: f64 = 0.85;
const MIN_FRACTION: f64 = 0.30;
const MIN_SEGMENT: usize = 1_000;
const MAX_SEGMENT: usize = 4_000;
const WIDE_SEGMENT_CAP: usize = 6_000;
const NARROW_SEGMENT_FLOOR: usize = 800;
const MAX_CYCLES: usize = 3;
const CYCLE_COST_N: f64 = 3_000.0;
/// Windows shorter than this are not worth a local solve.
const MIN_WINDOW: usize = 20;
const UNIFORM_KNN: usize = 15;
const WINDOW_KICKS: usize = 8;
const WINDOW_REPAIR_ITERS: usize = 30;

/// Sizes and counts for one refinement run, adapted to stitch quality.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct VCyclePlan {
    /// Share of the remaining budget given to this phase.
    pub(crate) fraction: f64,
    pub(crate) segment: usize,
    pub(crate) overlap: usize,
    pub(crate) cycles: usize,
    pub(crate) half_width: usize,
    pub(crate) stress_edges: usize,
}

impl VCyclePlan {
    pub(crate) fn adaptive(
        n: usize,
        base_fraction: f64,
        remaining_secs: f64,
        metrics: &StitchMetrics,
        th: &RoutingThresholds,
    ) -> Self {
        let base_fraction = if n > LARGE_N { LARGE_FRACTION } else { base_fraction };
        let base_segment = (n / 10).clamp(MIN_SEGMENT, MAX_SEGMENT);
        let sr = metrics.stitch_ratio;
        let (fraction, segment) = if sr > th.stitch_ratio_high {
            (
                (base_fraction * 1.3).min(MAX_FRACTION),
                ((base_segment as f64 * 1.5) as usize).min(WIDE_SEGMENT_CAP),
            )
        } else if sr < th.stitch_ratio_low {
            (
                (base_fraction * 0.6).max(MIN_FRACTION),
                ((base_segment as f64 * 0.7) as usize).max(NARROW_SEGMENT_FLOOR),
            )
        } else {
            (base_fraction, base_segment)
        };

        let budget = remaining_secs * fraction;
        let cycles = ((budget / (n as f64 / CYCLE_COST_N).max(1.0)) as usize).clamp(1, MAX_CYCLES);

        let base_half = segment / 2;
        let widened = if metrics.max_stitch_stress > th.stress_high {
            Some(1.8)
        } else if metrics.max_stitch_stress > th.stress_mid {
            Some(1.3)
        } else {
            None
        };
        let half_width = match widened {
            Some(factor) => ((base_half as f64 * factor) as usize).min(n / 4),
            None => base_half,
        }
        .max(1);

        Self {
            fraction,
            segment,
            overlap: segment / 5,
            cycles,
            half_width,
            stress_edges: (n / 50).clamp(4, 20),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct VCycleReport {
    pub before: f64,
    pub after: f64,
    pub gain: f64,
    pub cycles: usize,
    pub windows: usize,
    pub secs: f64,
}

/// Refines `tour` in place. `labels` maps every city to its leaf; `None`
/// selects the uniform sweep.
#[tsp_ultra_derive::timer("vcycle")]
pub(crate) fn refine<R: Rng + ?Sized>(
    oracle: &DistanceOracle<'_>,
    tour: &mut [usize],
    labels: Option<&[usize]>,
    plan: VCyclePlan,
    variant: LkVariant,
    deadline: &Deadline,
    rng: &mut R,
) -> VCycleReport {
    let started = Instant::now();
    let points = oracle.points();
    let n = tour.len();
    let mut report = VCycleReport {
        before: TourGeometry::tour_length(points, tour),
        ..VCycleReport::default()
    };
    log::info!(
        "vcycle: start n={n} cycles={} segment={} half_width={} mode={}",
        plan.cycles,
        plan.segment,
        plan.half_width,
        if labels.is_some() { "seams" } else { "uniform" }
    );

    for cycle in 0..plan.cycles {
        if deadline.expired() || n < MIN_WINDOW {
            break;
        }
        let windows = match labels {
            Some(labels) => focus_windows(points, tour, labels, plan),
            None => uniform_windows(n, plan, cycle),
        };
        if windows.is_empty() {
            break;
        }
        let mut cycle_gain = 0.0;
        for (w, window) in windows.iter().enumerate() {
            if deadline.expired() {
                break;
            }
            if window.len < MIN_WINDOW {
                continue;
            }
            let gain = match labels {
                Some(_) => refine_window(
                    points,
                    tour,
                    *window,
                    Candidates::Remap(oracle.knn()),
                    |local, order, knn| focused_search(local, order, knn, variant, deadline, &mut *rng),
                ),
                None => refine_window(
                    points,
                    tour,
                    *window,
                    Candidates::Build(UNIFORM_KNN),
                    |local, order, knn| uniform_search(local, order, knn, deadline),
                ),
            };
            log::trace!("vcycle: window={w} start={} len={} gain={gain:.3}", window.start, window.len);
            cycle_gain += gain;
            report.windows += 1;
        }
        report.cycles += 1;
        log::debug!(
            "vcycle: cycle={} windows={} gain={cycle_gain:.3}",
            cycle + 1,
            windows.len()
        );
    }

    report.after = TourGeometry::tour_length(points, tour);
    report.gain = report.before - report.after;
    report.secs = started.elapsed().as_secs_f64();
    log::info!(
        "vcycle: complete before={:.3} after={:.3} gain={:.3} cycles={} windows={} secs={:.3}",
        report.before,
        report.after,
        report.gain,
        report.cycles,
        report.windows,
        report.secs
    );
    report
}

/// Windows around every seam plus the longest edges away from seams.
fn focus_windows(points: &[Point], tour: &[usize], labels: &[usize], plan: VCyclePlan) -> Vec<Window> {
    let n = tour.len();
    let seams = seam_positions(tour, labels);
    let mut is_seam = vec![false; n];
    for &s in &seams {
        is_seam[s] = true;
    }
    let mut edges: Vec<(f64, usize)> = (0..n)
        .map(|i| (points[tour[i]].dist(points[tour[(i + 1) % n]]), i))
        .collect();
    edges.sort_unstable_by(|a, b| b.0.total_cmp(&a.0));
    let stress = edges
        .into_iter()
        .take(plan.stress_edges)
        .map(|(_, i)| i)
        .filter(|&i| !is_seam[i]);

    let centres: Vec<usize> = seams.iter().copied().chain(stress).collect();
    merge_windows(&centres, plan.half_width, n, 2 * plan.segment)
}

/// Overlapping windows of `segment` cities, shifted a third of a segment
/// per cycle.
fn uniform_windows(n: usize, plan: VCyclePlan, cycle: usize) -> Vec<Window> {
    let segment = plan.segment.max(MIN_WINDOW);
    let step = segment.saturating_sub(plan.overlap).max(1);
    let offset = (cycle * segment / 3) % n.max(1);
    if segment >= n {
        return vec![Window { start: 0, len: n }];
    }
    let mut windows = Vec::new();
    let mut pos = offset;
    while pos < n + offset {
        let len = segment.min(n + offset - pos);
        windows.push(Window { start: pos % n, len });
        pos += step;
    }
    windows
}

fn focused_search<R: Rng + ?Sized>(
    points: &[Point],
    order: &mut Vec<usize>,
    knn: &KnnGraph,
    variant: LkVariant,
    deadline: &Deadline,
    rng: &mut R,
) {
    two_opt(points, order, knn, 30, 5, deadline);
    for _ in 0..3 {
        let gain = or_opt(points, order, knn, 1, deadline) + three_opt(points, order, knn, 1, deadline);
        if gain <= 0.0 {
            break;
        }
    }
    let settings = IlsSettings::new(variant)
        .with_max_kicks(WINDOW_KICKS)
        .with_repair_iters(WINDOW_REPAIR_ITERS);
    iterated_local_search(points, order, knn, settings, deadline, rng);
}

fn uniform_search(points: &[Point], order: &mut Vec<usize>, knn: &KnnGraph, deadline: &Deadline) {
    two_opt(points, order, knn, 15, 3, deadline);
    three_opt(points, order, knn, 1, deadline);
    or_opt(points, order, knn, 1, deadline);
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::{
        algo::kernel::test_support::{assert_valid, random_points, shuffled_tour},
        options::SolverOptions,
    };

    fn thresholds() -> RoutingThresholds {
        RoutingThresholds::from_options(&SolverOptions::default())
    }

    fn metrics(stitch_ratio: f64, max_stitch_stress: f64) -> StitchMetrics {
        StitchMetrics::new(stitch_ratio, 10, 1.0, max_stitch_stress)
    }

    #[test]
    fn plan_widens_for_poor_stitches() {
        let th = thresholds();
        let wide = VCyclePlan::adaptive(50_000, 0.65, 100.0, &metrics(0.2, 1.0), &th);
        assert!((wide.fraction - MAX_FRACTION).abs() < 1e-12);
        assert_eq!(wide.segment, 6_000);
        assert_eq!(wide.overlap, 1_200);
        assert_eq!(wide.half_width, 3_000);
        assert_eq!(wide.stress_edges, 20);

        let narrow = VCyclePlan::adaptive(50_000, 0.65, 100.0, &metrics(0.01, 1.0), &th);
        assert!((narrow.fraction - 0.45).abs() < 1e-12);
        assert_eq!(narrow.segment, 2_800);

        let mid = VCyclePlan::adaptive(5_000, 0.65, 100.0, &metrics(0.1, 2.5), &th);
        assert!((mid.fraction - 0.65).abs() < 1e-12);
        assert_eq!(mid.segment, 1_000);
        assert_eq!(mid.half_width, 650);
        assert_eq!(mid.cycles, 3);

        let stressed = VCyclePlan::adaptive(5_000, 0.65, 100.0, &metrics(0.1, 9.0), &th);
        assert_eq!(stressed.half_width, 900);
        let tiny = VCyclePlan::adaptive(40, 0.65, 0.0, &metrics(0.1, 9.0), &th);
        assert_eq!(tiny.half_width, 10);
        assert_eq!(tiny.cycles, 1);
        assert_eq!(tiny.stress_edges, 4);
    }

    #[test]
    fn uniform_windows_cover_the_tour() {
        let plan = VCyclePlan {
            fraction: 0.5,
            segment: 100,
            overlap: 20,
            cycles: 1,
            half_width: 50,
            stress_edges: 4,
        };
        let windows = uniform_windows(350, plan, 1);
        let mut covered = vec![false; 350];
        for w in &windows {
            for p in w.positions(350) {
                covered[p] = true;
            }
        }
        assert!(covered.iter().all(|&c| c));
        assert_eq!(windows[0].start, 33);
        assert_eq!(uniform_windows(60, plan, 0), vec![Window { start: 0, len: 60 }]);
    }

    #[test]
    fn seam_refinement_keeps_a_valid_shorter_tour() {
        let points = random_points(600, 61);
        let oracle = DistanceOracle::new(&points, 8);
        let labels: Vec<usize> = points
            .iter()
            .map(|p| usize::from(p.x > 50.0) + 2 * usize::from(p.y > 50.0))
            .collect();
        // Quadrant-by-quadrant sweep gives a tour with long seams.
        let mut tour: Vec<usize> = (0..600).collect();
        tour.sort_by_key(|&c| (labels[c], (points[c].x * 10.0) as i64));
        let plan = VCyclePlan {
            fraction: 0.5,
            segment: 100,
            overlap: 20,
            cycles: 2,
            half_width: 40,
            stress_edges: 12,
        };
        let mut rng = StdRng::seed_from_u64(62);
        let report = refine(
            &oracle,
            &mut tour,
            Some(&labels),
            plan,
            LkVariant::DontLook,
            &Deadline::after_secs(5.0),
            &mut rng,
        );
        assert_valid(&tour, 600);
        assert!(report.after < report.before);
        assert!((oracle.tour_length(&tour) - report.after).abs() < 1e-6);
        assert!(report.windows > 0);
    }

    #[test]
    fn uniform_sweep_improves_a_random_tour() {
        let points = random_points(300, 63);
        let oracle = DistanceOracle::new(&points, 8);
        let mut tour = shuffled_tour(300, 64);
        let plan = VCyclePlan {
            fraction: 0.5,
            segment: 80,
            overlap: 16,
            cycles: 2,
            half_width: 40,
            stress_edges: 6,
        };
        let mut rng = StdRng::seed_from_u64(65);
        let report = refine(
            &oracle,
            &mut tour,
            None,
            plan,
            LkVariant::DontLook,
            &Deadline::after_secs(5.0),
            &mut rng,
        );
        assert_valid(&tour, 300);
        assert!(report.gain > 0.0);
        assert_eq!(report.cycles, 2);
    }

    #[test]
    fn expired_deadline_leaves_tour_alone() {
        let points = random_points(100, 66);
        let oracle = DistanceOracle::new(&points, 8);
        let original = shuffled_tour(100, 67);
        let mut tour = original.clone();
        let plan = VCyclePlan::adaptive(100, 0.65, 1.0, &metrics(0.1, 1.0), &thresholds());
        let report = refine(
            &oracle,
            &mut tour,
            None,
            plan,
            LkVariant::DontLook,
            &Deadline::expired_now(),
            &mut StdRng::seed_from_u64(0),
        );
        assert_eq!(tour, original);
        assert_eq!(report.cycles, 0);
    }
}
