use crate::{
    algo::kernel::{
        ArrayTour, DEADLINE_CHECK_INTERVAL, DontLookBits, IMPROVEMENT_EPSILON,
        MIN_TOUR_SIZE_FOR_2OPT, d, two_opt::two_opt_dlb_array,
    },
    budget::Deadline,
    node::Point,
    oracle::knn::KnnGraph,
};

/// Candidates of `t2` examined at every level of a sequential chain.
const SEQUENTIAL_CANDIDATES: usize = 7;
pub(crate) const DEFAULT_LK_DEPTH: usize = 3;

/// Which exchange the repair step uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LkVariant {
    /// Single 2-opt exchanges gated by don't-look bits.
    DontLook,
    /// Chained exchanges up to `depth` levels, committed at the best prefix.
    Sequential { depth: usize },
}

impl LkVariant {
    pub(crate) fn label(self) -> &'static str {
        match self {
            Self::DontLook => "dlb",
            Self::Sequential { .. } => "sequential",
        }
    }
}

/// Sweep limits for one repair call.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LkSchedule {
    pub(crate) variant: LkVariant,
    pub(crate) max_iters: usize,
    pub(crate) max_no_improve: usize,
}

impl LkSchedule {
    pub(crate) const fn new(variant: LkVariant, max_iters: usize, max_no_improve: usize) -> Self {
        Self {
            variant,
            max_iters,
            max_no_improve,
        }
    }
}

/// One level of a chain: the 2-opt `swap_edges(t1, t2, t4, t3)` that was applied.
#[derive(Clone, Copy, Debug)]
struct Level {
    t2: usize,
    t3: usize,
    t4: usize,
}

/// Grows a chain from the tour edge `(t1, t2)`. Each level removes `(t1, t2)`,
/// adds `(t2, t3)`, removes `(t3, t4)` and closes with `(t4, t1)`; the partial
/// gain must stay positive. The prefix with the best closing gain is kept and
/// deeper levels are undone. Returns the committed gain.
fn chain_from(
    points: &[Point],
    tour: &mut ArrayTour,
    knn: &KnnGraph,
    t1: usize,
    mut t2: usize,
    max_depth: usize,
    touched: &mut Vec<usize>,
) -> Option<f64> {
    let mut levels: Vec<Level> = Vec::with_capacity(max_depth);
    let mut open_gain = d(points, t1, t2);
    let mut best_gain = 0.0;
    let mut best_depth = 0;

    for _ in 0..max_depth {
        let forward = tour.next(t1) == t2;
        let mut pick: Option<(usize, usize, f64)> = None;
        for &t3 in knn.first(t2, SEQUENTIAL_CANDIDATES) {
            if t3 == t1 || t3 == t2 {
                continue;
            }
            let g1 = open_gain - d(points, t2, t3);
            if g1 <= IMPROVEMENT_EPSILON {
                continue;
            }
            let t4 = if forward { tour.prev(t3) } else { tour.next(t3) };
            if t4 == t1 || t4 == t2 {
                continue;
            }
            let g2 = g1 + d(points, t3, t4);
            if pick.is_none_or(|(_, _, best)| g2 > best) {
                pick = Some((t3, t4, g2));
            }
        }
        let Some((t3, t4, g2)) = pick else {
            break;
        };

        tour.swap_edges(t1, t2, t4, t3);
        levels.push(Level { t2, t3, t4 });
        let closing = g2 - d(points, t4, t1);
        if closing > best_gain {
            best_gain = closing;
            best_depth = levels.len();
        }
        open_gain = g2;
        t2 = t4;
    }

    while levels.len() > best_depth {
        let Some(Level { t2, t3, t4 }) = levels.pop() else {
            break;
        };
        tour.swap_edges(t1, t4, t2, t3);
    }
    if best_depth == 0 || best_gain <= IMPROVEMENT_EPSILON {
        return None;
    }
    touched.push(t1);
    for level in &levels {
        touched.extend([level.t2, level.t3, level.t4]);
    }
    Some(best_gain)
}

fn sequential_sweep(
    points: &[Point],
    tour: &mut ArrayTour,
    knn: &KnnGraph,
    dlb: &mut DontLookBits,
    depth: usize,
    deadline: &Deadline,
) -> f64 {
    let n = tour.len();
    let mut total = 0.0;
    let mut touched = Vec::with_capacity(1 + 3 * depth);
    let mut steps = 0usize;
    for p in 0..n {
        let t1 = tour.at(p);
        if dlb.is_set(t1) {
            continue;
        }
        steps += 1;
        if steps % DEADLINE_CHECK_INTERVAL == 0 && deadline.expired() {
            break;
        }
        touched.clear();
        let gain = [tour.next(t1), tour.prev(t1)]
            .into_iter()
            .find_map(|t2| chain_from(points, tour, knn, t1, t2, depth, &mut touched));
        match gain {
            Some(g) => {
                total += g;
                for &c in &touched {
                    dlb.clear(c);
                }
            }
            None => dlb.set(t1),
        }
    }
    total
}

/// Repeated repair sweeps with caller-owned don't-look bits. Stops after
/// `max_no_improve` sweeps without gain. Returns the total gain.
pub(crate) fn lin_kernighan_array(
    points: &[Point],
    tour: &mut ArrayTour,
    knn: &KnnGraph,
    dlb: &mut DontLookBits,
    schedule: LkSchedule,
    deadline: &Deadline,
) -> f64 {
    if tour.len() < MIN_TOUR_SIZE_FOR_2OPT || deadline.expired() {
        return 0.0;
    }
    let mut total = 0.0;
    let mut stale = 0;
    for _ in 0..schedule.max_iters {
        if deadline.expired() {
            break;
        }
        let gain = match schedule.variant {
            LkVariant::DontLook => two_opt_dlb_array(points, tour, knn, dlb, 1, deadline),
            LkVariant::Sequential { depth } => {
                sequential_sweep(points, tour, knn, dlb, depth.max(1), deadline)
            }
        };
        total += gain;
        if gain > 0.0 {
            stale = 0;
        } else {
            stale += 1;
            if stale >= schedule.max_no_improve.max(1) {
                break;
            }
        }
    }
    total
}

/// [`lin_kernighan_array`] from a clean set of don't-look bits.
pub(crate) fn lin_kernighan(
    points: &[Point],
    tour: &mut Vec<usize>,
    knn: &KnnGraph,
    schedule: LkSchedule,
    deadline: &Deadline,
) -> f64 {
    if tour.len() < MIN_TOUR_SIZE_FOR_2OPT || deadline.expired() {
        return 0.0;
    }
    let mut array = ArrayTour::new(std::mem::take(tour));
    let mut dlb = DontLookBits::new(points.len());
    let gain = lin_kernighan_array(points, &mut array, knn, &mut dlb, schedule, deadline);
    *tour = array.into_order();
    gain
}
