//! Local-search primitives shared by the leaf, stitch, V-cycle and polish
//! phases.
//!
//! Every kernel works on a full permutation of `0..points.len()` together with
//! a candidate graph over the same index space. A kernel either improves the
//! tour in place or leaves it untouched; an expired deadline makes it a no-op.

pub(crate) mod construct;
pub(crate) mod ils;
pub(crate) mod lin_kernighan;
pub(crate) mod or_opt;
pub(crate) mod perturb;
pub(crate) mod three_opt;
pub(crate) mod two_opt;

use crate::node::Point;

pub(crate) const IMPROVEMENT_EPSILON: f64 = 1e-10;
pub(crate) const MIN_TOUR_SIZE_FOR_2OPT: usize = 4;
/// Re-read the clock only every this many inner steps.
pub(crate) const DEADLINE_CHECK_INTERVAL: usize = 256;

#[inline]
pub(crate) fn d(points: &[Point], a: usize, b: usize) -> f64 {
    points[a].dist(points[b])
}

/// Tour array with its inverse, so neighbours and positions are O(1).
#[derive(Clone, Debug)]
pub(crate) struct ArrayTour {
    order: Vec<usize>,
    pos: Vec<usize>,
}

impl ArrayTour {
    pub(crate) fn new(order: Vec<usize>) -> Self {
        let mut pos = vec![0; order.len()];
        for (p, &c) in order.iter().enumerate() {
            pos[c] = p;
        }
        Self { order, pos }
    }

    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }

    pub(crate) fn order(&self) -> &[usize] {
        &self.order
    }

    pub(crate) fn into_order(self) -> Vec<usize> {
        self.order
    }

    #[inline]
    pub(crate) fn pos(&self, city: usize) -> usize {
        self.pos[city]
    }

    #[inline]
    pub(crate) fn at(&self, p: usize) -> usize {
        self.order[p % self.order.len()]
    }

    #[inline]
    pub(crate) fn next(&self, city: usize) -> usize {
        let n = self.order.len();
        self.order[(self.pos[city] + 1) % n]
    }

    #[inline]
    pub(crate) fn prev(&self, city: usize) -> usize {
        let n = self.order.len();
        self.order[(self.pos[city] + n - 1) % n]
    }

    /// Reverses the cyclic run of positions `from..=to` walking forward. The
    /// shorter of the run and its complement is flipped; both give the same
    /// cycle. Returns the first position and length of the flipped run.
    pub(crate) fn reverse(&mut self, from: usize, to: usize) -> (usize, usize) {
        let n = self.order.len();
        if n < 2 {
            return (from, 0);
        }
        let inner = (to + n - from) % n + 1;
        let (start, len) = if 2 * inner <= n {
            (from, inner)
        } else {
            ((to + 1) % n, n - inner)
        };
        let mut i = start;
        let mut j = (start + len + n - 1) % n;
        for _ in 0..len / 2 {
            let (ci, cj) = (self.order[i], self.order[j]);
            self.order[i] = cj;
            self.order[j] = ci;
            self.pos[cj] = i;
            self.pos[ci] = j;
            i = (i + 1) % n;
            j = (j + n - 1) % n;
        }
        (start, len)
    }

    /// Replaces tour edges `(a, b)` and `(c, d)` with `(a, c)` and `(b, d)`.
    /// Requires `b` and `d` to follow `a` and `c` in the same direction.
    pub(crate) fn swap_edges(&mut self, a: usize, b: usize, c: usize, d: usize) -> (usize, usize) {
        if self.next(a) == b {
            self.reverse(self.pos[b], self.pos[c])
        } else {
            self.reverse(self.pos[a], self.pos[d])
        }
    }

    /// Re-derives positions for the linear range `start..end` after a bulk
    /// rewrite of `order`.
    pub(crate) fn refresh(&mut self, start: usize, end: usize) {
        for p in start..end.min(self.order.len()) {
            self.pos[self.order[p]] = p;
        }
    }

    pub(crate) fn order_mut(&mut self) -> &mut [usize] {
        &mut self.order
    }
}

/// Don't-look bits, one per city, owned by the caller across kernel calls.
#[derive(Clone, Debug)]
pub(crate) struct DontLookBits {
    bits: Vec<bool>,
}

impl DontLookBits {
    pub(crate) fn new(n: usize) -> Self {
        Self {
            bits: vec![false; n],
        }
    }

    #[inline]
    pub(crate) fn is_set(&self, city: usize) -> bool {
        self.bits[city]
    }

    #[inline]
    pub(crate) fn set(&mut self, city: usize) {
        self.bits[city] = true;
    }

    #[inline]
    pub(crate) fn clear(&mut self, city: usize) {
        self.bits[city] = false;
    }

    pub(crate) fn clear_all(&mut self) {
        self.bits.fill(false);
    }

    pub(crate) fn set_all(&mut self) {
        self.bits.fill(true);
    }

    pub(crate) fn len(&self) -> usize {
        self.bits.len()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use rand::{Rng, SeedableRng, rngs::StdRng};

    use crate::{node::Point, tour::is_permutation};

    pub(crate) fn random_points(n: usize, seed: u64) -> Vec<Point> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| Point::new(rng.random::<f64>() * 100.0, rng.random::<f64>() * 100.0))
            .collect()
    }

    pub(crate) fn shuffled_tour(n: usize, seed: u64) -> Vec<usize> {
        use rand::seq::SliceRandom;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut tour: Vec<usize> = (0..n).collect();
        tour.shuffle(&mut rng);
        tour
    }

    pub(crate) fn assert_valid(tour: &[usize], n: usize) {
        assert!(is_permutation(tour, n), "not a permutation: {tour:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::TourGeometry;

    #[test]
    fn reverse_updates_positions_and_picks_short_side() {
        let mut tour = ArrayTour::new(vec![0, 1, 2, 3, 4, 5, 6, 7]);
        tour.reverse(1, 3);
        assert_eq!(tour.order(), &[0, 3, 2, 1, 4, 5, 6, 7]);
        for (p, &c) in tour.order().iter().enumerate() {
            assert_eq!(tour.pos(c), p);
        }

        // Long run: the complement is flipped instead, same cycle.
        let mut tour = ArrayTour::new(vec![0, 1, 2, 3, 4, 5, 6, 7]);
        tour.reverse(1, 6);
        assert!(tour.next(0) == 6 || tour.prev(0) == 6);
        assert!(tour.next(1) == 7 || tour.prev(1) == 7);
    }

    #[test]
    fn reverse_wraps_across_the_end() {
        let mut tour = ArrayTour::new(vec![0, 1, 2, 3, 4, 5]);
        tour.reverse(5, 0);
        assert_eq!(tour.at(5), 0);
        assert_eq!(tour.at(0), 5);
    }

    #[test]
    fn swap_edges_matches_two_opt_in_both_orientations() {
        let points: Vec<Point> = (0..6)
            .map(|i| Point::new((i as f64).cos(), (i as f64).sin()))
            .collect();
        let mut tour = ArrayTour::new(vec![0, 1, 2, 3, 4, 5]);
        tour.swap_edges(0, 1, 3, 4);
        assert!(tour.next(0) == 3 || tour.prev(0) == 3);
        assert!(tour.next(1) == 4 || tour.prev(1) == 4);

        // Undo from the new orientation.
        let (a, b) = (0, 3);
        let c = 1;
        let d = 4;
        if tour.next(a) == b {
            tour.swap_edges(a, b, c, d);
        } else {
            tour.swap_edges(b, a, d, c);
        }
        let restored = TourGeometry::tour_length(&points, tour.order());
        let original = TourGeometry::tour_length(&points, &[0, 1, 2, 3, 4, 5]);
        assert!((restored - original).abs() < 1e-12);
    }

    #[test]
    fn dont_look_bits_toggle() {
        let mut dlb = DontLookBits::new(4);
        dlb.set(2);
        assert!(dlb.is_set(2));
        dlb.clear(2);
        assert!(!dlb.is_set(2));
        dlb.set_all();
        assert!(dlb.is_set(0));
        dlb.clear_all();
        assert!(!dlb.is_set(3));
        assert_eq!(dlb.len(), 4);
    }
}
