use rand::Rng;

use crate::{
    algo::kernel::{
        ArrayTour, DontLookBits, IMPROVEMENT_EPSILON,
        lin_kernighan::{LkSchedule, LkVariant, lin_kernighan_array},
        perturb::double_bridge,
    },
    budget::Deadline,
    geometry::TourGeometry,
    node::Point,
    oracle::knn::KnnGraph,
};

const MIN_ILS_SIZE: usize = 8;
/// Elite pool may overflow by this much before it is sorted and trimmed.
const ELITE_SLACK: usize = 5;

#[derive(Clone, Copy, Debug)]
pub(crate) struct IlsSettings {
    pub(crate) variant: LkVariant,
    /// Repair sweeps after each kick.
    pub(crate) repair_iters: usize,
    pub(crate) max_kicks: usize,
    /// How many repaired tours to hand back for recombination.
    pub(crate) keep_elites: usize,
}

impl IlsSettings {
    pub(crate) const fn new(variant: LkVariant) -> Self {
        Self {
            variant,
            repair_iters: 50,
            max_kicks: usize::MAX,
            keep_elites: 0,
        }
    }

    pub(crate) const fn with_max_kicks(mut self, max_kicks: usize) -> Self {
        self.max_kicks = max_kicks;
        self
    }

    pub(crate) const fn with_keep_elites(mut self, keep_elites: usize) -> Self {
        self.keep_elites = keep_elites;
        self
    }

    pub(crate) const fn with_repair_iters(mut self, repair_iters: usize) -> Self {
        self.repair_iters = repair_iters;
        self
    }
}

#[derive(Clone, Debug, Default)]
pub(crate) struct IlsReport {
    pub(crate) kicks: usize,
    pub(crate) accepted: usize,
    pub(crate) gain: f64,
    /// Shortest repaired tours seen, shortest first.
    pub(crate) elites: Vec<(f64, Vec<usize>)>,
}

/// Iterated local search: double-bridge kick of the best tour, repair with
/// don't-look bits cleared only around the kick, keep the result if strictly
/// shorter. The tracked best never gets longer.
pub(crate) fn iterated_local_search<R: Rng + ?Sized>(
    points: &[Point],
    tour: &mut Vec<usize>,
    knn: &KnnGraph,
    settings: IlsSettings,
    deadline: &Deadline,
    rng: &mut R,
) -> IlsReport {
    let mut report = IlsReport::default();
    let n = tour.len();
    if n < MIN_ILS_SIZE || deadline.expired() {
        return report;
    }

    let schedule = LkSchedule::new(settings.variant, settings.repair_iters, 1);
    let start_len = TourGeometry::tour_length(points, tour);
    let mut best = ArrayTour::new(std::mem::take(tour));
    let mut dlb = DontLookBits::new(points.len());
    lin_kernighan_array(points, &mut best, knn, &mut dlb, schedule, deadline);
    let mut best_len = TourGeometry::tour_length(points, best.order());
    let mut candidate = best.clone();

    while report.kicks < settings.max_kicks && !deadline.expired() {
        report.kicks += 1;
        candidate.clone_from(&best);
        let touched = double_bridge(candidate.order_mut(), rng);
        candidate.refresh(0, n);
        dlb.set_all();
        for city in touched {
            dlb.clear(city);
        }
        lin_kernighan_array(points, &mut candidate, knn, &mut dlb, schedule, deadline);

        let len = TourGeometry::tour_length(points, candidate.order());
        if settings.keep_elites > 0 {
            report.elites.push((len, candidate.order().to_vec()));
            if report.elites.len() > settings.keep_elites + ELITE_SLACK {
                trim_elites(&mut report.elites, settings.keep_elites);
            }
        }
        if len < best_len - IMPROVEMENT_EPSILON {
            std::mem::swap(&mut best, &mut candidate);
            best_len = len;
            report.accepted += 1;
        }
    }
    trim_elites(&mut report.elites, settings.keep_elites);

    report.gain = start_len - best_len;
    *tour = best.into_order();
    log::debug!(
        "ils: done n={n} kicks={} accepted={} gain={:.3}",
        report.kicks,
        report.accepted,
        report.gain
    );
    report
}

fn trim_elites(elites: &mut Vec<(f64, Vec<usize>)>, keep: usize) {
    elites.sort_by(|a, b| a.0.total_cmp(&b.0));
    elites.truncate(keep);
}
