use tsp_ultra_derive::{KvDisplay, New};

use crate::{geometry::TourGeometry, node::Point};

/// How much of a tour is spent crossing between leaves.
#[derive(Clone, Copy, Debug, Default, PartialEq, KvDisplay, New)]
#[kv(inline)]
pub struct StitchMetrics {
    /// Seam length over total length.
    #[kv(fmt = "fixed")]
    pub stitch_ratio: f64,
    pub stitch_count: usize,
    #[kv(fmt = "fixed")]
    pub median_edge: f64,
    /// Longest seam over the median edge, 1.0 without seams.
    #[kv(fmt = "fixed", name = "max_stress")]
    pub max_stitch_stress: f64,
}

impl StitchMetrics {
    /// `labels[city]` names the leaf owning each city.
    pub(crate) fn compute(points: &[Point], tour: &[usize], labels: &[usize]) -> Self {
        let n = tour.len();
        if n < 2 {
            return Self::new(0.0, 0, 0.0, 1.0);
        }
        let edges: Vec<f64> = (0..n)
            .map(|i| points[tour[i]].dist(points[tour[(i + 1) % n]]))
            .collect();
        let total: f64 = edges.iter().sum();
        let median_edge = TourGeometry::median(&edges);

        let seams = seam_positions(tour, labels);
        let seam_len: f64 = seams.iter().map(|&i| edges[i]).sum();
        let longest_seam = seams.iter().map(|&i| edges[i]).fold(0.0, f64::max);
        let max_stitch_stress = if seams.is_empty() {
            1.0
        } else {
            longest_seam / median_edge.max(f64::EPSILON)
        };
        Self::new(
            if total > 0.0 { seam_len / total } else { 0.0 },
            seams.len(),
            median_edge,
            max_stitch_stress,
        )
    }
}

/// Positions `i` whose tour edge `(i, i + 1)` joins two different leaves.
pub(crate) fn seam_positions(tour: &[usize], labels: &[usize]) -> Vec<usize> {
    let n = tour.len();
    if n < 2 {
        return Vec::new();
    }
    (0..n)
        .filter(|&i| labels[tour[i]] != labels[tour[(i + 1) % n]])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_square_leaves_have_two_seams() {
        let points = vec![
            Point::new(0.0, 0.0),
            Point::new(0.0, 1.0),
            Point::new(4.0, 1.0),
            Point::new(4.0, 0.0),
        ];
        let labels = vec![0, 0, 1, 1];
        let tour = vec![0, 1, 2, 3];
        assert_eq!(seam_positions(&tour, &labels), vec![1, 3]);

        let m = StitchMetrics::compute(&points, &tour, &labels);
        assert_eq!(m.stitch_count, 2);
        assert!((m.stitch_ratio - 0.8).abs() < 1e-12);
        assert!((m.median_edge - 2.5).abs() < 1e-12);
        assert!((m.max_stitch_stress - 4.0 / 2.5).abs() < 1e-12);
    }

    #[test]
    fn single_leaf_has_unit_stress() {
        let points = vec![Point::new(0.0, 0.0), Point::new(1.0, 0.0), Point::new(0.0, 1.0)];
        let m = StitchMetrics::compute(&points, &[0, 1, 2], &[3, 3, 3]);
        assert_eq!(m.stitch_count, 0);
        assert_eq!(m.stitch_ratio, 0.0);
        assert_eq!(m.max_stitch_stress, 1.0);
        assert_eq!(
            m.to_string(),
            "stitch_ratio=0.000 stitch_count=0 median_edge=1.000 max_stress=1.000"
        );
    }
}
