use std::collections::{HashMap, hash_map::Entry};

use kiddo::{KdTree, SquaredEuclidean};
use rayon::prelude::*;

use crate::node::Point;

/// Marks an unused slot in a neighbour row.
pub const NO_NEIGHBOR: usize = usize::MAX;

/// Fixed-width candidate lists. Row `i` holds up to `width` neighbour ids of
/// point `i` ordered by increasing distance (or alpha after re-ranking);
/// unused slots hold [`NO_NEIGHBOR`].
#[derive(Clone, Debug)]
pub struct KnnGraph {
    n: usize,
    width: usize,
    ids: Vec<usize>,
    dists: Vec<f64>,
}

/// k-d tree over distinct coordinates. A kiddo bucket holds a bounded number
/// of items at one position, so coincident cities share a single slot.
pub(crate) struct SpatialIndex {
    tree: KdTree<f64, 2>,
    slots: Vec<Vec<usize>>,
}

impl SpatialIndex {
    pub(crate) fn new(points: &[Point]) -> Self {
        let mut tree: KdTree<f64, 2> = KdTree::with_capacity(points.len().max(1));
        let mut slot_of: HashMap<(u64, u64), usize> = HashMap::with_capacity(points.len());
        let mut slots: Vec<Vec<usize>> = Vec::new();
        for (idx, p) in points.iter().enumerate() {
            // `+ 0.0` folds -0.0 into 0.0.
            let key = ((p.x + 0.0).to_bits(), (p.y + 0.0).to_bits());
            match slot_of.entry(key) {
                Entry::Occupied(e) => slots[*e.get()].push(idx),
                Entry::Vacant(e) => {
                    let slot = slots.len();
                    e.insert(slot);
                    slots.push(vec![idx]);
                    tree.add(&p.as_array(), slot as u64);
                }
            }
        }
        Self { tree, slots }
    }

    /// Number of distinct coordinates.
    pub(crate) fn distinct(&self) -> usize {
        self.slots.len()
    }

    /// Up to `count` cities closest to `p` as `(city, squared distance)`,
    /// nearest first. Cities at one coordinate come out together.
    pub(crate) fn nearest_cities(&self, p: Point, count: usize) -> Vec<(usize, f64)> {
        let mut out = Vec::with_capacity(count);
        if count == 0 || self.slots.is_empty() {
            return out;
        }
        let hits = self
            .tree
            .nearest_n::<SquaredEuclidean>(&p.as_array(), count.min(self.slots.len()));
        for hit in hits {
            for &city in &self.slots[hit.item as usize] {
                if out.len() == count {
                    return out;
                }
                out.push((city, hit.distance));
            }
        }
        out
    }

    /// The city closest to `p` and its squared distance.
    pub(crate) fn nearest_city(&self, p: Point) -> Option<(usize, f64)> {
        if self.slots.is_empty() {
            return None;
        }
        let hit = self.tree.nearest_one::<SquaredEuclidean>(&p.as_array());
        let city = *self.slots.get(hit.item as usize)?.first()?;
        Some((city, hit.distance))
    }
}

impl KnnGraph {
    /// Queries `index` (built over `points`) for the `k` nearest other points
    /// of every point. `k` is clamped to `n - 1`.
    pub(crate) fn from_index(points: &[Point], index: &SpatialIndex, k: usize) -> Self {
        let n = points.len();
        let k = k.min(n.saturating_sub(1));
        if k == 0 {
            return Self::empty(n);
        }

        let mut ids = vec![NO_NEIGHBOR; n * k];
        let mut dists = vec![f64::INFINITY; n * k];
        ids.par_chunks_mut(k)
            .zip(dists.par_chunks_mut(k))
            .enumerate()
            .for_each(|(i, (row_ids, row_dists))| {
                let hits = index.nearest_cities(points[i], k + 1);
                let others = hits.into_iter().filter(|&(j, _)| j != i).take(k);
                for (slot, (j, d_sq)) in others.enumerate() {
                    row_ids[slot] = j;
                    row_dists[slot] = d_sq.sqrt();
                }
            });

        Self {
            n,
            width: k,
            ids,
            dists,
        }
    }

    pub fn build(points: &[Point], k: usize) -> Self {
        let index = SpatialIndex::new(points);
        Self::from_index(points, &index, k)
    }

    /// Brute-force variant for very small point sets.
    pub(crate) fn from_dense(points: &[Point], k: usize) -> Self {
        let n = points.len();
        let k = k.min(n.saturating_sub(1));
        if k == 0 {
            return Self::empty(n);
        }
        let mut rows = Vec::with_capacity(n);
        for i in 0..n {
            let mut row: Vec<(usize, f64)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| (j, points[i].dist(points[j])))
                .collect();
            row.sort_unstable_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
            row.truncate(k);
            rows.push(row);
        }
        Self::from_rows(k, rows)
    }

    pub(crate) fn from_rows(width: usize, rows: Vec<Vec<(usize, f64)>>) -> Self {
        let n = rows.len();
        let mut ids = vec![NO_NEIGHBOR; n * width];
        let mut dists = vec![f64::INFINITY; n * width];
        for (i, row) in rows.into_iter().enumerate() {
            for (slot, (j, d)) in row.into_iter().filter(|&(j, _)| j != i).take(width).enumerate() {
                ids[i * width + slot] = j;
                dists[i * width + slot] = d;
            }
        }
        Self {
            n,
            width,
            ids,
            dists,
        }
    }

    fn empty(n: usize) -> Self {
        Self {
            n,
            width: 0,
            ids: Vec::new(),
            dists: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Live neighbour ids of `i`, sentinel slots excluded.
    #[inline]
    pub fn neighbors(&self, i: usize) -> &[usize] {
        if self.width == 0 {
            return &[];
        }
        let row = &self.ids[i * self.width..(i + 1) * self.width];
        let end = row
            .iter()
            .position(|&j| j == NO_NEIGHBOR)
            .unwrap_or(self.width);
        &row[..end]
    }

    /// The first `limit` live neighbours of `i`.
    #[inline]
    pub fn first(&self, i: usize, limit: usize) -> &[usize] {
        let row = self.neighbors(i);
        &row[..row.len().min(limit)]
    }

    #[inline]
    pub fn distances(&self, i: usize) -> &[f64] {
        if self.width == 0 {
            return &[];
        }
        let live = self.neighbors(i).len();
        &self.dists[i * self.width..i * self.width + live]
    }

    /// Distance from `i` to its nearest neighbour, `None` for isolated rows.
    pub fn nearest_distance(&self, i: usize) -> Option<f64> {
        self.distances(i).first().copied()
    }

    pub(crate) fn row_mut(&mut self, i: usize) -> (&mut [usize], &mut [f64]) {
        let range = i * self.width..(i + 1) * self.width;
        (&mut self.ids[range.clone()], &mut self.dists[range])
    }

    /// Grows every row to `width` slots, filling the new ones with sentinels.
    pub(crate) fn widen(&mut self, width: usize) {
        if width <= self.width {
            return;
        }
        let n = self.len();
        let mut ids = vec![NO_NEIGHBOR; n * width];
        let mut dists = vec![f64::INFINITY; n * width];
        for i in 0..n {
            let old = i * self.width..(i + 1) * self.width;
            ids[i * width..i * width + self.width].copy_from_slice(&self.ids[old.clone()]);
            dists[i * width..i * width + self.width].copy_from_slice(&self.dists[old]);
        }
        self.width = width;
        self.ids = ids;
        self.dists = dists;
    }

    /// Restricts the graph to `members` (global ids), renumbering into the
    /// local index space `0..members.len()`. Neighbours outside the subset are
    /// dropped.
    pub(crate) fn remap(&self, members: &[usize]) -> Self {
        let local: HashMap<usize, usize> = members
            .iter()
            .enumerate()
            .map(|(li, &gi)| (gi, li))
            .collect();
        let rows = members
            .iter()
            .map(|&gi| {
                if gi >= self.len() {
                    return Vec::new();
                }
                self.neighbors(gi)
                    .iter()
                    .zip(self.distances(gi))
                    .filter_map(|(gj, &d)| local.get(gj).map(|&lj| (lj, d)))
                    .collect()
            })
            .collect();
        Self::from_rows(self.width, rows)
    }

    /// Number of occupied slots over the whole graph.
    pub fn edge_count(&self) -> usize {
        self.ids.iter().filter(|&&j| j != NO_NEIGHBOR).count()
    }

    /// True when every slot is a sentinel or a valid id different from its row.
    pub fn is_well_formed(&self) -> bool {
        let n = self.len();
        (0..n).all(|i| {
            let row = &self.ids[i * self.width..(i + 1) * self.width];
            let live = row.iter().take_while(|&&j| j != NO_NEIGHBOR).count();
            row[..live].iter().all(|&j| j < n && j != i)
                && row[live..].iter().all(|&j| j == NO_NEIGHBOR)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(side: usize) -> Vec<Point> {
        let mut points = Vec::with_capacity(side * side);
        for y in 0..side {
            for x in 0..side {
                points.push(Point::new(x as f64, y as f64));
            }
        }
        points
    }

    #[test]
    fn build_excludes_self_and_orders_by_distance() {
        let points = grid(6);
        let knn = KnnGraph::build(&points, 5);

        assert_eq!(knn.len(), points.len());
        assert!(knn.is_well_formed());
        for i in 0..points.len() {
            let d = knn.distances(i);
            assert_eq!(d.len(), 5);
            assert!(d.windows(2).all(|w| w[0] <= w[1] + 1e-12));
            assert!((d[0] - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn k_is_clamped_to_n_minus_one() {
        let points = grid(2);
        let knn = KnnGraph::build(&points, 10);
        assert_eq!(knn.width(), 3);
        assert!(knn.is_well_formed());
        assert_eq!(knn.neighbors(0).len(), 3);
    }

    #[test]
    fn dense_build_matches_tree_build() {
        let points = grid(4);
        let tree = KnnGraph::build(&points, 4);
        let dense = KnnGraph::from_dense(&points, 4);
        for i in 0..points.len() {
            let a = tree.distances(i);
            let b = dense.distances(i);
            assert_eq!(a.len(), b.len());
            for (x, y) in a.iter().zip(b) {
                assert!((x - y).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn remap_keeps_only_members_in_local_ids() {
        let points = grid(5);
        let knn = KnnGraph::build(&points, 6);
        let members = vec![0, 1, 2, 5, 6, 7];
        let local = knn.remap(&members);

        assert_eq!(local.len(), members.len());
        assert!(local.is_well_formed());
        assert!(local.neighbors(0).contains(&1));
        assert!(local.neighbors(0).contains(&3));
    }

    #[test]
    fn widen_keeps_rows_and_adds_sentinels() {
        let points = grid(3);
        let mut knn = KnnGraph::build(&points, 2);
        let before: Vec<Vec<usize>> = (0..9).map(|i| knn.neighbors(i).to_vec()).collect();
        knn.widen(4);

        assert_eq!(knn.width(), 4);
        assert!(knn.is_well_formed());
        for (i, row) in before.iter().enumerate() {
            assert_eq!(knn.neighbors(i), row.as_slice());
        }
    }

    #[test]
    fn coincident_points_share_one_slot() {
        let mut points = vec![Point::new(0.0, 0.0); 40];
        points.extend(vec![Point::new(1.0, 0.0); 40]);
        points.push(Point::new(-0.0, 0.0));
        let index = SpatialIndex::new(&points);
        assert_eq!(index.distinct(), 2);

        let hits = index.nearest_cities(Point::new(0.9, 0.0), 45);
        assert_eq!(hits.len(), 45);
        assert!(hits[..40].iter().all(|&(c, _)| (40..80).contains(&c)));
        assert!(hits[40..].iter().all(|&(c, d)| c < 40 || (c == 80 && d > 0.0)));
        let (city, d_sq) = index.nearest_city(Point::new(0.1, 0.0)).expect("non-empty");
        assert_eq!(city, 0);
        assert!((d_sq - 0.01).abs() < 1e-12);
    }

    #[test]
    fn duplicates_are_zero_distance_neighbours() {
        let points: Vec<Point> = (0..200).map(|i| Point::new((i % 2) as f64, 0.0)).collect();
        let knn = KnnGraph::build(&points, 8);
        assert!(knn.is_well_formed());
        for i in 0..points.len() {
            assert_eq!(knn.neighbors(i).len(), 8);
            assert!(knn.neighbors(i).iter().all(|&j| j % 2 == i % 2));
            assert!(knn.distances(i).iter().all(|&d| d == 0.0));
        }
        assert!(SpatialIndex::new(&[]).nearest_city(Point::new(0.0, 0.0)).is_none());
    }

    #[test]
    fn single_point_has_no_neighbours() {
        let knn = KnnGraph::build(&[Point::new(1.0, 1.0)], 8);
        assert_eq!(knn.width(), 0);
        assert!(knn.neighbors(0).is_empty());
    }
}
