pub(crate) mod alpha;
pub(crate) mod knn;
pub(crate) mod laplacian;
pub(crate) mod spectral;

use std::time::Instant;

use crate::{
    Result,
    geometry::TourGeometry,
    io::options::AlphaMode,
    node::Point,
    oracle::{
        knn::{KnnGraph, SpatialIndex},
        laplacian::SparseLaplacian,
        spectral::Spectrum,
    },
};

/// Subgradient iterations used when alpha is re-applied after a rebuild.
pub(crate) const REBUILD_ALPHA_ITERS: usize = 30;
const BYTES_PER_MB: f64 = 1_048_576.0;
const BASE_OVERHEAD_MB: f64 = 20.0;

/// Coordinate-backed distance queries and candidate structures for one solve.
///
/// Distances are always recomputed from coordinates; no pairwise table is kept.
pub struct DistanceOracle<'a> {
    points: &'a [Point],
    index: SpatialIndex,
    knn: KnnGraph,
    k: usize,
    build_secs: f64,
    alpha_ratio: f64,
}

impl<'a> DistanceOracle<'a> {
    pub fn new(points: &'a [Point], k: usize) -> Self {
        let started = Instant::now();
        let index = SpatialIndex::new(points);
        let knn = KnnGraph::from_index(points, &index, k);
        let k = knn.width();
        let build_secs = started.elapsed().as_secs_f64();
        log::info!(
            "oracle: built n={} distinct={} k={k} secs={build_secs:.3} mem_mb={:.1}",
            points.len(),
            index.distinct(),
            memory_estimate_mb(points.len(), k)
        );
        Self {
            points,
            index,
            knn,
            k,
            build_secs,
            alpha_ratio: 0.0,
        }
    }

    pub fn points(&self) -> &'a [Point] {
        self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn knn(&self) -> &KnnGraph {
        &self.knn
    }

    pub fn k(&self) -> usize {
        self.k
    }

    pub fn build_secs(&self) -> f64 {
        self.build_secs
    }

    pub fn alpha_ratio(&self) -> f64 {
        self.alpha_ratio
    }

    pub fn memory_estimate_mb(&self) -> f64 {
        memory_estimate_mb(self.points.len(), self.knn.width())
    }

    #[inline]
    pub fn dist(&self, a: usize, b: usize) -> f64 {
        self.points[a].dist(self.points[b])
    }

    pub fn tour_length(&self, tour: &[usize]) -> f64 {
        TourGeometry::tour_length(self.points, tour)
    }

    /// Row-major `ids.len()`² distance block for a small subset.
    pub fn sub_matrix(&self, ids: &[usize]) -> Vec<f64> {
        let m = ids.len();
        let mut out = vec![0.0; m * m];
        for (a, &ia) in ids.iter().enumerate() {
            for (b, &ib) in ids.iter().enumerate().skip(a + 1) {
                let d = self.dist(ia, ib);
                out[a * m + b] = d;
                out[b * m + a] = d;
            }
        }
        out
    }

    pub(crate) fn laplacian(&self) -> SparseLaplacian {
        SparseLaplacian::from_knn(&self.knn)
    }

    pub(crate) fn spectrum(&self, count: usize, seed: u64) -> Result<Spectrum> {
        spectral::smallest_eigenpairs(&self.laplacian(), count, seed)
    }

    /// Rewrites candidate rows according to `mode`.
    pub fn apply_alpha(&mut self, mode: AlphaMode, iterations: usize) {
        let started = Instant::now();
        self.alpha_ratio = alpha::apply_alpha(self.points, &mut self.knn, mode, iterations);
        if mode != AlphaMode::Off {
            log::info!(
                "oracle.alpha: applied mode={mode} width={} zero_ratio={:.3} secs={:.3}",
                self.knn.width(),
                self.alpha_ratio,
                started.elapsed().as_secs_f64()
            );
        }
    }

    /// Re-queries the spatial index with a new `k`, then re-applies `mode`.
    pub fn rebuild_knn(&mut self, k: usize, mode: AlphaMode) {
        let started = Instant::now();
        self.knn = KnnGraph::from_index(self.points, &self.index, k);
        self.k = self.knn.width();
        log::info!(
            "oracle: rebuilt knn k={} secs={:.3}",
            self.k,
            started.elapsed().as_secs_f64()
        );
        self.apply_alpha(mode, REBUILD_ALPHA_ITERS);
    }
}

/// Coordinates, k-NN ids and distances plus a fixed overhead, in MiB.
pub fn memory_estimate_mb(n: usize, k: usize) -> f64 {
    let bytes = (n * 2 * 8 + n * k * 12 + n * 8) as f64;
    bytes / BYTES_PER_MB + BASE_OVERHEAD_MB
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square() -> Vec<Point> {
        vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(0.0, 1.0),
        ]
    }

    #[test]
    fn oracle_clamps_k_and_measures_tours() {
        let points = square();
        let oracle = DistanceOracle::new(&points, 10);
        assert_eq!(oracle.k(), 3);
        assert!((oracle.tour_length(&[0, 1, 2, 3]) - 4.0).abs() < 1e-12);
        assert!((oracle.dist(0, 2) - 2f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn sub_matrix_is_symmetric_with_zero_diagonal() {
        let points = square();
        let oracle = DistanceOracle::new(&points, 2);
        let m = oracle.sub_matrix(&[0, 2, 3]);
        assert_eq!(m.len(), 9);
        assert_eq!(m[0], 0.0);
        assert!((m[1] - 2f64.sqrt()).abs() < 1e-12);
        assert_eq!(m[1], m[3]);
        assert!((m[2 * 3 + 1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn memory_estimate_matches_formula() {
        let mb = memory_estimate_mb(1_048_576, 10);
        assert!((mb - (16.0 + 120.0 + 8.0 + 20.0)).abs() < 1e-9);
    }

    #[test]
    fn stacked_points_build_without_overflowing_a_bucket() {
        let points = vec![Point::new(3.0, 4.0); 100];
        let mut oracle = DistanceOracle::new(&points, 10);
        assert_eq!(oracle.k(), 10);
        assert!(oracle.knn().is_well_formed());
        oracle.rebuild_knn(16, AlphaMode::Off);
        assert_eq!(oracle.knn().neighbors(0).len(), 16);
        assert_eq!(oracle.tour_length(&(0..100).collect::<Vec<_>>()), 0.0);
    }

    #[test]
    fn rebuild_changes_width() {
        let points: Vec<Point> = (0..40).map(|i| Point::new(i as f64, (i % 7) as f64)).collect();
        let mut oracle = DistanceOracle::new(&points, 5);
        oracle.rebuild_knn(12, AlphaMode::Off);
        assert_eq!(oracle.k(), 12);
        assert!(oracle.knn().is_well_formed());
    }
}
