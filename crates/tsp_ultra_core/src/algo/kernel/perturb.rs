use rand::{Rng, seq::index};

const MIN_BRIDGE_SIZE: usize = 8;

/// Double-bridge kick: with cut points `1 <= a < b < c <= n - 1` the tour
/// `A B C D` becomes `A C B D`. Tours shorter than eight cities get a random
/// swap of two positions instead. Returns the cities whose tour edges changed.
pub(crate) fn double_bridge<R: Rng + ?Sized>(tour: &mut [usize], rng: &mut R) -> Vec<usize> {
    let n = tour.len();
    if n < 2 {
        return Vec::new();
    }
    if n < MIN_BRIDGE_SIZE {
        let i = rng.random_range(0..n);
        let j = rng.random_range(0..n);
        tour.swap(i, j);
        let mut touched = Vec::with_capacity(6);
        for p in [i, j] {
            touched.extend([tour[(p + n - 1) % n], tour[p], tour[(p + 1) % n]]);
        }
        return touched;
    }

    let mut cuts = index::sample(rng, n - 1, 3).into_vec();
    cuts.sort_unstable();
    let (a, b, c) = (cuts[0] + 1, cuts[1] + 1, cuts[2] + 1);

    let touched = vec![
        tour[0],
        tour[a - 1],
        tour[a],
        tour[b - 1],
        tour[b],
        tour[c - 1],
        tour[c % n],
        tour[n - 1],
    ];
    // A C B D: rotating the B C block left by |B| puts C first.
    tour[a..c].rotate_left(b - a);
    touched
}

/// Random segment reversal used to diversify a stagnating population member.
pub(crate) fn random_segment_reversal<R: Rng + ?Sized>(tour: &mut [usize], rng: &mut R) {
    let n = tour.len();
    if n < 4 {
        return;
    }
    let i = rng.random_range(0..n - 2);
    let j = rng.random_range(i + 2..n);
    tour[i..=j].reverse();
}
