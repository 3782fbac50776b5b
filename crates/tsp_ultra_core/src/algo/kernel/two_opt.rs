use crate::{
    algo::kernel::{
        ArrayTour, DEADLINE_CHECK_INTERVAL, DontLookBits, IMPROVEMENT_EPSILON,
        MIN_TOUR_SIZE_FOR_2OPT, d,
    },
    budget::Deadline,
    node::Point,
    oracle::knn::KnnGraph,
};

/// An applied 2-opt move: its gain, the four touched cities and the flipped run.
struct Move {
    gain: f64,
    cities: [usize; 4],
    flipped: (usize, usize),
}

/// First-improvement 2-opt move rooted at `a`, searching both tour directions
/// over `a`'s candidates.
fn improve_from(points: &[Point], tour: &mut ArrayTour, knn: &KnnGraph, a: usize) -> Option<Move> {
    for forward in [true, false] {
        let b = if forward { tour.next(a) } else { tour.prev(a) };
        let d_ab = d(points, a, b);
        for &c in knn.neighbors(a) {
            let d_ac = d(points, a, c);
            if d_ac >= d_ab - IMPROVEMENT_EPSILON {
                continue;
            }
            let e = if forward { tour.next(c) } else { tour.prev(c) };
            if c == b || e == a {
                continue;
            }
            let gain = d_ab + d(points, c, e) - d_ac - d(points, b, e);
            if gain > IMPROVEMENT_EPSILON {
                let flipped = tour.swap_edges(a, b, c, e);
                return Some(Move {
                    gain,
                    cities: [a, b, c, e],
                    flipped,
                });
            }
        }
    }
    None
}

/// Neighbour-list 2-opt. Runs up to `max_iters` sweeps and stops after
/// `max_no_improve` consecutive sweeps without gain. Returns the total gain.
pub(crate) fn two_opt(
    points: &[Point],
    tour: &mut Vec<usize>,
    knn: &KnnGraph,
    max_iters: usize,
    max_no_improve: usize,
    deadline: &Deadline,
) -> f64 {
    let n = tour.len();
    if n < MIN_TOUR_SIZE_FOR_2OPT || deadline.expired() {
        return 0.0;
    }
    let mut array = ArrayTour::new(std::mem::take(tour));
    let mut total = 0.0;
    let mut stale = 0;
    let mut steps = 0usize;

    'sweeps: for _ in 0..max_iters {
        let mut sweep_gain = 0.0;
        for p in 0..n {
            steps += 1;
            if steps % DEADLINE_CHECK_INTERVAL == 0 && deadline.expired() {
                total += sweep_gain;
                break 'sweeps;
            }
            let a = array.at(p);
            if let Some(step) = improve_from(points, &mut array, knn, a) {
                sweep_gain += step.gain;
            }
        }
        total += sweep_gain;
        if sweep_gain > 0.0 {
            stale = 0;
        } else {
            stale += 1;
            if stale >= max_no_improve.max(1) {
                break;
            }
        }
    }

    *tour = array.into_order();
    total
}

/// 2-opt driven by don't-look bits. Cities with a set bit are skipped; a
/// successful move clears the bits of the flipped run and the four endpoints.
/// Operates on an [`ArrayTour`] so callers can chain it with other moves.
pub(crate) fn two_opt_dlb_array(
    points: &[Point],
    tour: &mut ArrayTour,
    knn: &KnnGraph,
    dlb: &mut DontLookBits,
    max_sweeps: usize,
    deadline: &Deadline,
) -> f64 {
    let n = tour.len();
    if n < MIN_TOUR_SIZE_FOR_2OPT || deadline.expired() {
        return 0.0;
    }
    let mut total = 0.0;
    let mut steps = 0usize;

    'sweeps: for _ in 0..max_sweeps {
        let mut improved = false;
        for p in 0..n {
            let a = tour.at(p);
            if dlb.is_set(a) {
                continue;
            }
            steps += 1;
            if steps % DEADLINE_CHECK_INTERVAL == 0 && deadline.expired() {
                break 'sweeps;
            }
            match improve_from(points, tour, knn, a) {
                Some(step) => {
                    total += step.gain;
                    improved = true;
                    let (start, len) = step.flipped;
                    for offset in 0..len {
                        dlb.clear(tour.at(start + offset));
                    }
                    for city in step.cities {
                        dlb.clear(city);
                    }
                }
                None => dlb.set(a),
            }
        }
        if !improved {
            break;
        }
    }
    total
}

/// [`two_opt_dlb_array`] over a plain order vector.
pub(crate) fn two_opt_dlb(
    points: &[Point],
    tour: &mut Vec<usize>,
    knn: &KnnGraph,
    dlb: &mut DontLookBits,
    max_sweeps: usize,
    deadline: &Deadline,
) -> f64 {
    if tour.len() < MIN_TOUR_SIZE_FOR_2OPT || deadline.expired() {
        return 0.0;
    }
    let mut array = ArrayTour::new(std::mem::take(tour));
    let gain = two_opt_dlb_array(points, &mut array, knn, dlb, max_sweeps, deadline);
    *tour = array.into_order();
    gain
}
