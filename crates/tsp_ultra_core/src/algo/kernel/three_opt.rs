use crate::{
    algo::kernel::{DEADLINE_CHECK_INTERVAL, IMPROVEMENT_EPSILON, d},
    budget::Deadline,
    node::Point,
    oracle::knn::KnnGraph,
};

/// Candidates per city considered when choosing the second and third cut.
const THREE_OPT_CANDIDATES: usize = 8;

/// Reconnection of the three segments `prefix | S1 | S2 | suffix` where
/// `S1 = B..C` and `S2 = E..F` sit between cut edges `(A,B)`, `(C,E)`, `(F,G)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Reconnect {
    /// A-C, B-E, F-G: reverse S1.
    ReverseFirst,
    /// A-B, C-F, E-G: reverse S2.
    ReverseSecond,
    /// A-C, B-F, E-G: reverse both in place.
    ReverseBoth,
    /// A-E, F-B, C-G: swap S1 and S2.
    Swap,
    /// A-E, F-C, B-G: swap, S1 reversed.
    SwapReverseFirst,
    /// A-F, E-B, C-G: swap, S2 reversed.
    SwapReverseSecond,
    /// A-F, E-C, B-G: reverse the whole S1 S2 block.
    SwapReverseBoth,
}

impl Reconnect {
    const ALL: [Self; 7] = [
        Self::ReverseFirst,
        Self::ReverseSecond,
        Self::ReverseBoth,
        Self::Swap,
        Self::SwapReverseFirst,
        Self::SwapReverseSecond,
        Self::SwapReverseBoth,
    ];

    /// Length of the three edges this variant adds.
    fn added(self, points: &[Point], [a, b, c, e, f, g]: [usize; 6]) -> f64 {
        let pairs = match self {
            Self::ReverseFirst => [(a, c), (b, e), (f, g)],
            Self::ReverseSecond => [(a, b), (c, f), (e, g)],
            Self::ReverseBoth => [(a, c), (b, f), (e, g)],
            Self::Swap => [(a, e), (f, b), (c, g)],
            Self::SwapReverseFirst => [(a, e), (f, c), (b, g)],
            Self::SwapReverseSecond => [(a, f), (e, b), (c, g)],
            Self::SwapReverseBoth => [(a, f), (e, c), (b, g)],
        };
        pairs.iter().map(|&(u, v)| d(points, u, v)).sum()
    }
}

#[derive(Clone, Copy, Debug)]
struct Candidate {
    gain: f64,
    i: usize,
    j: usize,
    k: usize,
    variant: Reconnect,
}

/// Full 3-opt over candidate triples. For each position `i` the best of the
/// seven reconnections over every `(j, k)` drawn from the candidate lists is
/// applied if it gains. Repeats until a sweep finds nothing or `max_sweeps`
/// is reached. Returns the total gain.
pub(crate) fn three_opt(
    points: &[Point],
    tour: &mut [usize],
    knn: &KnnGraph,
    max_sweeps: usize,
    deadline: &Deadline,
) -> f64 {
    let n = tour.len();
    if n < 6 || deadline.expired() {
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
        for i in 0..n - 2 {
            steps += 1;
            if steps % DEADLINE_CHECK_INTERVAL == 0 && deadline.expired() {
                break 'sweeps;
            }
            if let Some(best) = best_move_at(points, tour, &pos, knn, i) {
                apply(tour, &mut pos, best);
                total += best.gain;
                improved = true;
            }
        }
        if !improved {
            break;
        }
    }
    total
}

fn best_move_at(
    points: &[Point],
    tour: &[usize],
    pos: &[usize],
    knn: &KnnGraph,
    i: usize,
) -> Option<Candidate> {
    let n = tour.len();
    let a = tour[i];
    let b = tour[i + 1];
    let d_ab = d(points, a, b);
    let mut best: Option<Candidate> = None;

    for &c in knn.first(a, THREE_OPT_CANDIDATES) {
        let j = pos[c];
        if j <= i || j >= n - 1 {
            continue;
        }
        let e = tour[j + 1];
        let d_ce = d(points, c, e);
        for &via in knn.first(c, THREE_OPT_CANDIDATES) {
            let k = pos[via];
            if k <= j || (k == n - 1 && i == 0) {
                continue;
            }
            let f = tour[k];
            let g = tour[(k + 1) % n];
            let removed = d_ab + d_ce + d(points, f, g);
            let cities = [a, b, c, e, f, g];
            for variant in Reconnect::ALL {
                let gain = removed - variant.added(points, cities);
                let floor = best.map_or(0.0, |m| m.gain);
                if gain > floor + IMPROVEMENT_EPSILON {
                    best = Some(Candidate {
                        gain,
                        i,
                        j,
                        k,
                        variant,
                    });
                }
            }
        }
    }
    best
}

fn apply(tour: &mut [usize], pos: &mut [usize], mv: Candidate) {
    let Candidate { i, j, k, variant, .. } = mv;
    let first = i + 1..=j;
    let second = j + 1..=k;
    match variant {
        Reconnect::ReverseFirst => tour[first].reverse(),
        Reconnect::ReverseSecond => tour[second].reverse(),
        Reconnect::ReverseBoth => {
            tour[first].reverse();
            tour[second].reverse();
        }
        Reconnect::SwapReverseBoth => tour[i + 1..=k].reverse(),
        Reconnect::Swap | Reconnect::SwapReverseFirst | Reconnect::SwapReverseSecond => {
            let mut s1 = tour[first].to_vec();
            let mut s2 = tour[second].to_vec();
            if variant == Reconnect::SwapReverseFirst {
                s1.reverse();
            }
            if variant == Reconnect::SwapReverseSecond {
                s2.reverse();
            }
            let block = &mut tour[i + 1..=k];
            block[..s2.len()].copy_from_slice(&s2);
            block[s2.len()..].copy_from_slice(&s1);
        }
    }
    for p in i + 1..=k {
        pos[tour[p]] = p;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        algo::kernel::{
            test_support::{assert_valid, random_points, shuffled_tour},
            two_opt::two_opt,
        },
        geometry::TourGeometry,
    };

    fn cities(tour: &[usize], i: usize, j: usize, k: usize) -> [usize; 6] {
        let n = tour.len();
        [tour[i], tour[i + 1], tour[j], tour[j + 1], tour[k], tour[(k + 1) % n]]
    }

    #[test]
    fn every_variant_matches_its_predicted_gain() {
        let points = random_points(12, 5);
        let base: Vec<usize> = (0..12).collect();
        let (i, j, k) = (1, 4, 8);
        for variant in Reconnect::ALL {
            let mut tour = base.clone();
            let mut pos: Vec<usize> = (0..12).collect();
            let six = cities(&tour, i, j, k);
            let removed = d(&points, six[0], six[1]) + d(&points, six[2], six[3]) + d(&points, six[4], six[5]);
            let predicted = removed - variant.added(&points, six);
            let before = TourGeometry::tour_length(&points, &tour);

            apply(&mut tour, &mut pos, Candidate { gain: predicted, i, j, k, variant });

            assert_valid(&tour, 12);
            for (p, &c) in tour.iter().enumerate() {
                assert_eq!(pos[c], p, "{variant:?}");
            }
            let after = TourGeometry::tour_length(&points, &tour);
            assert!((before - after - predicted).abs() < 1e-9, "{variant:?}");
        }
    }

    #[test]
    fn three_opt_never_lengthens_and_reports_gain() {
        let points = random_points(180, 21);
        let knn = KnnGraph::build(&points, 10);
        let mut tour = shuffled_tour(points.len(), 22);
        let before = TourGeometry::tour_length(&points, &tour);
        let gain = three_opt(&points, &mut tour, &knn, 20, &Deadline::after_secs(10.0));
        assert_valid(&tour, points.len());
        let after = TourGeometry::tour_length(&points, &tour);
        assert!(gain > 0.0);
        assert!((before - after - gain).abs() < 1e-6);
    }

    #[test]
    fn three_opt_can_improve_a_two_opt_optimum() {
        let points = random_points(250, 31);
        let knn = KnnGraph::build(&points, 10);
        let mut tour = shuffled_tour(points.len(), 32);
        let deadline = Deadline::after_secs(10.0);
        two_opt(&points, &mut tour, &knn, 200, 2, &deadline);
        let local_opt = TourGeometry::tour_length(&points, &tour);
        three_opt(&points, &mut tour, &knn, 20, &deadline);
        assert_valid(&tour, points.len());
        assert!(TourGeometry::tour_length(&points, &tour) <= local_opt + 1e-9);
    }

    #[test]
    fn expired_deadline_leaves_tour_untouched() {
        let points = random_points(40, 2);
        let knn = KnnGraph::build(&points, 6);
        let original = shuffled_tour(points.len(), 3);
        let mut tour = original.clone();
        assert_eq!(three_opt(&points, &mut tour, &knn, 5, &Deadline::expired_now()), 0.0);
        assert_eq!(tour, original);
    }
}
