use crate::{
    algo::kernel::{DEADLINE_CHECK_INTERVAL, IMPROVEMENT_EPSILON, d},
    budget::Deadline,
    node::Point,
    oracle::knn::KnnGraph,
};

const MAX_SEGMENT: usize = 3;

#[derive(Clone, Copy, Debug)]
struct Relocation {
    gain: f64,
    /// Tour edge `(target, target + 1)` the segment is moved into.
    target: usize,
    reversed: bool,
}

/// Or-opt: moves segments of one to three cities between a better pair of
/// neighbours drawn from the candidate lists of the segment's ends. Tries
/// both orientations of the moved segment. Returns the total gain.
pub(crate) fn or_opt(
    points: &[Point],
    tour: &mut [usize],
    knn: &KnnGraph,
    max_sweeps: usize,
    deadline: &Deadline,
) -> f64 {
    let n = tour.len();
    if n < MAX_SEGMENT + 2 || deadline.expired() {
        return 0.0;
    }
    let mut pos = vec![0usize; points.len()];
    for (p, &c) in tour.iter().enumerate() {
        pos[c] = p;
    }
    let mut total = 0.0;
    let mut steps = 0usize;

    'sweeps: for _ in 0..max_sweeps {
        let mut improved = false;
        for seg in 1..=MAX_SEGMENT {
            if n < seg + 3 {
                break;
            }
            for i in 0..=n - seg {
                steps += 1;
                if steps % DEADLINE_CHECK_INTERVAL == 0 && deadline.expired() {
                    break 'sweeps;
                }
                if let Some(mv) = best_relocation(points, tour, &pos, knn, i, seg) {
                    relocate(tour, &mut pos, i, seg, mv);
                    total += mv.gain;
                    improved = true;
                }
            }
        }
        if !improved {
            break;
        }
    }
    total
}

fn best_relocation(
    points: &[Point],
    tour: &[usize],
    pos: &[usize],
    knn: &KnnGraph,
    i: usize,
    seg: usize,
) -> Option<Relocation> {
    let n = tour.len();
    let first = tour[i];
    let last = tour[i + seg - 1];
    let before = tour[(i + n - 1) % n];
    let after = tour[(i + seg) % n];
    let removal_gain = d(points, before, first) + d(points, last, after) - d(points, before, after);
    if removal_gain <= IMPROVEMENT_EPSILON {
        return None;
    }

    let excluded = |p: usize| p == (i + n - 1) % n || (i..i + seg).contains(&p);
    let mut best: Option<Relocation> = None;
    for &anchor in knn.neighbors(first).iter().chain(knn.neighbors(last)) {
        let pa = pos[anchor];
        for target in [pa, (pa + n - 1) % n] {
            if excluded(target) {
                continue;
            }
            let x = tour[target];
            let y = tour[(target + 1) % n];
            let d_xy = d(points, x, y);
            let forward = d(points, x, first) + d(points, last, y) - d_xy;
            let backward = d(points, x, last) + d(points, first, y) - d_xy;
            let (cost, reversed) = if backward < forward {
                (backward, true)
            } else {
                (forward, false)
            };
            let gain = removal_gain - cost;
            if gain > best.map_or(IMPROVEMENT_EPSILON, |b| b.gain) {
                best = Some(Relocation {
                    gain,
                    target,
                    reversed,
                });
            }
        }
    }
    best
}

/// Moves `tour[i..i + seg]` between `tour[target]` and its successor.
fn relocate(tour: &mut [usize], pos: &mut [usize], i: usize, seg: usize, mv: Relocation) {
    let (lo, hi, seg_start) = if mv.target >= i + seg {
        tour[i..=mv.target].rotate_left(seg);
        (i, mv.target + 1, mv.target + 1 - seg)
    } else {
        tour[mv.target + 1..i + seg].rotate_right(seg);
        (mv.target + 1, i + seg, mv.target + 1)
    };
    if mv.reversed {
        tour[seg_start..seg_start + seg].reverse();
    }
    for p in lo..hi {
        pos[tour[p]] = p;
    }
}
