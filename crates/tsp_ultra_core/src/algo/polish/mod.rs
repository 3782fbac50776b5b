//! Final intensification of the whole tour: a short deterministic sweep,
//! iterated local search, and on large instances an EAX population seeded
//! with the best tours the search produced.

pub(crate) mod eax;

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
        polish::eax::{EaxSettings, evolve},
    },
    budget::Deadline,
    oracle::DistanceOracle,
};

const MIN_POLISH_SECS: f64 = 1.0;
const DEEP_SWEEP_SECS: f64 = 5.0;
const MIN_EAX_SECS: f64 = 3.0;
/// Time held back from EAX for the hand-off.
const EAX_RESERVE_SECS: f64 = 0.5;
const MIN_EAX_POOL: usize = 3;
const ILS_REPAIR_ITERS: usize = 30;

#[derive(Clone, Copy, Debug)]
pub(crate) struct PolishSettings {
    pub(crate) variant: LkVariant,
    /// EAX runs only above this many cities.
    pub(crate) eax_min_n: usize,
    /// Share of the time given to ILS when EAX follows.
    pub(crate) ils_fraction: f64,
    /// Tours kept for the EAX population.
    pub(crate) pool: usize,
}

impl PolishSettings {
    pub(crate) const fn new(variant: LkVariant) -> Self {
        Self {
            variant,
            eax_min_n: 5_000,
            ils_fraction: 0.60,
            pool: 15,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PolishReport {
    pub before: f64,
    pub after: f64,
    pub gain: f64,
    /// Candidate list width the polish ran with.
    pub knn_k: usize,
    pub ils_kicks: usize,
    pub eax_generations: usize,
    pub eax_improved: bool,
    pub secs: f64,
}

/// Polishes `tour` in place until `deadline`. The result is never longer
/// than the input.
#[tsp_ultra_derive::timer("polish")]
pub(crate) fn polish<R: Rng + ?Sized>(
    oracle: &DistanceOracle<'_>,
    tour: &mut Vec<usize>,
    settings: PolishSettings,
    deadline: &Deadline,
    rng: &mut R,
) -> PolishReport {
    let started = Instant::now();
    let points = oracle.points();
    let knn = oracle.knn();
    let n = tour.len();
    let mut report = PolishReport {
        before: oracle.tour_length(tour),
        knn_k: oracle.k(),
        ..PolishReport::default()
    };
    report.after = report.before;

    let budget = deadline.remaining();
    if budget < MIN_POLISH_SECS {
        log::info!("polish: skipped remaining_secs={budget:.3}");
        return report;
    }
    log::info!("polish: start n={n} k={} budget_secs={budget:.2}", report.knn_k);

    let sweeps = ((budget / 5.0) as usize).clamp(3, 20);
    two_opt(points, tour, knn, sweeps, 3, deadline);
    if deadline.remaining() > DEEP_SWEEP_SECS {
        for _ in 0..3 {
            if deadline.expired() {
                break;
            }
            let gain = or_opt(points, tour, knn, 1, deadline) + three_opt(points, tour, knn, 1, deadline);
            if gain <= 0.0 {
                break;
            }
        }
    }
    let mut best = oracle.tour_length(tour);
    log::debug!("polish: sweep len={best:.3}");

    let use_eax = n > settings.eax_min_n;
    let ils_deadline = if use_eax {
        deadline.fraction(settings.ils_fraction)
    } else {
        *deadline
    };
    let ils = IlsSettings::new(settings.variant)
        .with_repair_iters(ILS_REPAIR_ITERS)
        .with_keep_elites(if use_eax { settings.pool } else { 0 });
    let ils_report = iterated_local_search(points, tour, knn, ils, &ils_deadline, rng);
    report.ils_kicks = ils_report.kicks;
    best = oracle.tour_length(tour);
    log::debug!(
        "polish: ils len={best:.3} kicks={} pool={}",
        ils_report.kicks,
        ils_report.elites.len()
    );

    if use_eax {
        let remaining = deadline.remaining();
        let mut pool = ils_report.elites;
        pool.push((best, tour.clone()));
        pool.sort_by(|a, b| a.0.total_cmp(&b.0));
        pool.truncate(settings.pool);
        if remaining > MIN_EAX_SECS && pool.len() >= MIN_EAX_POOL {
            let eax = EaxSettings::new(settings.variant);
            let initial = pool.into_iter().map(|(_, t)| t).collect();
            let eax_deadline = deadline.sub(remaining - EAX_RESERVE_SECS);
            if let Some(outcome) = evolve(points, knn, initial, eax, &eax_deadline, rng) {
                report.eax_generations = outcome.generations;
                if outcome.length < best {
                    best = outcome.length;
                    *tour = outcome.tour;
                    report.eax_improved = true;
                }
            }
        } else {
            log::debug!("polish: eax skipped remaining_secs={remaining:.2} pool={}", pool.len());
        }
    }

    report.after = best;
    report.gain = report.before - report.after;
    report.secs = started.elapsed().as_secs_f64();
    log::info!(
        "polish: complete before={:.3} after={:.3} gain={:.3} kicks={} eax_generations={} secs={:.3}",
        report.before,
        report.after,
        report.gain,
        report.ils_kicks,
        report.eax_generations,
        report.secs
    );
    report
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::*;
    use crate::algo::kernel::test_support::{assert_valid, random_points, shuffled_tour};

    #[test]
    fn short_budget_skips_polish() {
        let points = random_points(50, 111);
        let oracle = DistanceOracle::new(&points, 6);
        let original = shuffled_tour(50, 112);
        let mut tour = original.clone();
        let report = polish(
            &oracle,
            &mut tour,
            PolishSettings::new(LkVariant::DontLook),
            &Deadline::after_secs(0.5),
            &mut StdRng::seed_from_u64(0),
        );
        assert_eq!(tour, original);
        assert_eq!(report.gain, 0.0);
        assert_eq!(report.knn_k, 6);
    }

    #[test]
    fn ils_polish_improves_and_reports_consistently() {
        let points = random_points(200, 113);
        let oracle = DistanceOracle::new(&points, 8);
        let mut tour = shuffled_tour(200, 114);
        let report = polish(
            &oracle,
            &mut tour,
            PolishSettings::new(LkVariant::DontLook),
            &Deadline::after_secs(1.5),
            &mut StdRng::seed_from_u64(115),
        );
        assert_valid(&tour, 200);
        assert!(report.gain > 0.0);
        assert!((oracle.tour_length(&tour) - report.after).abs() < 1e-6);
        assert!(report.ils_kicks > 0);
        assert_eq!(report.eax_generations, 0);
    }

    #[test]
    fn eax_phase_runs_when_enabled() {
        let points = random_points(300, 116);
        let oracle = DistanceOracle::new(&points, 8);
        let mut tour = shuffled_tour(300, 117);
        let mut settings = PolishSettings::new(LkVariant::DontLook);
        settings.eax_min_n = 100;
        let report = polish(
            &oracle,
            &mut tour,
            settings,
            &Deadline::after_secs(10.0),
            &mut StdRng::seed_from_u64(118),
        );
        assert_valid(&tour, 300);
        assert!(report.after < report.before);
        assert!(report.eax_generations > 0);
        assert!((oracle.tour_length(&tour) - report.after).abs() < 1e-6);
    }
}
