use crate::node::Point;

pub(crate) struct TourGeometry;

/// Axis-aligned bounds of a point subset.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct BoundingBox {
    pub(crate) min: Point,
    pub(crate) max: Point,
}

impl BoundingBox {
    pub(crate) fn of_indices(points: &[Point], idxs: &[usize]) -> Self {
        let mut min = Point::new(f64::INFINITY, f64::INFINITY);
        let mut max = Point::new(f64::NEG_INFINITY, f64::NEG_INFINITY);
        for &i in idxs {
            let p = points[i];
            min.x = min.x.min(p.x);
            min.y = min.y.min(p.y);
            max.x = max.x.max(p.x);
            max.y = max.y.max(p.y);
        }
        if idxs.is_empty() {
            return Self {
                min: Point::default(),
                max: Point::default(),
            };
        }
        Self { min, max }
    }

    pub(crate) fn of_points(points: &[Point]) -> Self {
        let all: Vec<usize> = (0..points.len()).collect();
        Self::of_indices(points, &all)
    }

    pub(crate) fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    pub(crate) fn height(&self) -> f64 {
        self.max.y - self.min.y
    }

    /// 0 when the box is wider than tall, 1 otherwise.
    pub(crate) fn longest_axis(&self) -> usize {
        if self.width() >= self.height() { 0 } else { 1 }
    }

    pub(crate) fn aspect_ratio(&self) -> f64 {
        let (w, h) = (self.width(), self.height());
        w.max(h) / (w.min(h) + 1e-12)
    }
}

impl TourGeometry {
    pub(crate) fn tour_length(points: &[Point], tour: &[usize]) -> f64 {
        let n = tour.len();
        if n < 2 {
            return 0.0;
        }
        let mut sum = 0.0;
        for i in 0..n {
            let a = points[tour[i]];
            let b = points[tour[(i + 1) % n]];
            sum += a.dist(b);
        }
        sum
    }

    pub(crate) fn path_length(points: &[Point], path: &[usize]) -> f64 {
        path.windows(2)
            .map(|w| points[w[0]].dist(points[w[1]]))
            .sum()
    }

    pub(crate) fn centroid_of_indices(points: &[Point], idxs: &[usize]) -> Point {
        let mut sx = 0.0;
        let mut sy = 0.0;
        for &i in idxs {
            sx += points[i].x;
            sy += points[i].y;
        }
        let n = idxs.len().max(1) as f64;
        Point::new(sx / n, sy / n)
    }

    pub(crate) fn rotate_cycle(tour: &[usize], start_node: usize) -> Vec<usize> {
        let Some(pos) = tour.iter().position(|&x| x == start_node) else {
            return tour.to_vec();
        };
        let mut out = Vec::with_capacity(tour.len());
        out.extend_from_slice(&tour[pos..]);
        out.extend_from_slice(&tour[..pos]);
        out
    }

    /// Median of a slice of finite values; 0 for an empty slice.
    pub(crate) fn median(values: &[f64]) -> f64 {
        if values.is_empty() {
            return 0.0;
        }
        let mut sorted = values.to_vec();
        sorted.sort_unstable_by(f64::total_cmp);
        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            0.5 * (sorted[mid - 1] + sorted[mid])
        } else {
            sorted[mid]
        }
    }

    /// Population mean and standard deviation.
    pub(crate) fn mean_std(values: &[f64]) -> (f64, f64) {
        if values.is_empty() {
            return (0.0, 0.0);
        }
        let n = values.len() as f64;
        let mean = values.iter().sum::<f64>() / n;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n;
        (mean, var.sqrt())
    }
}

#[cfg(test)]
mod tests {
    use super::{BoundingBox, TourGeometry};
    use crate::node::Point;

    fn unit_square() -> Vec<Point> {
        vec![
            Point::new(0.0, 0.0),
            Point::new(0.0, 1.0),
            Point::new(1.0, 1.0),
            Point::new(1.0, 0.0),
        ]
    }

    #[test]
    fn tour_length_closes_cycle() {
        let length = TourGeometry::tour_length(&unit_square(), &[0, 1, 2, 3]);
        assert!((length - 4.0).abs() < 1e-12);
    }

    #[test]
    fn path_length_does_not_close_cycle() {
        let length = TourGeometry::path_length(&unit_square(), &[0, 1, 2, 3]);
        assert!((length - 3.0).abs() < 1e-12);
    }

    #[test]
    fn centroid_of_indices_averages_coordinates() {
        let points = vec![
            Point::new(2.0, 1.0),
            Point::new(4.0, 3.0),
            Point::new(6.0, 5.0),
        ];
        let centroid = TourGeometry::centroid_of_indices(&points, &[0, 2]);
        assert!((centroid.x - 4.0).abs() < 1e-12);
        assert!((centroid.y - 3.0).abs() < 1e-12);
    }

    #[test]
    fn rotate_cycle_starts_at_requested_node() {
        let rotated = TourGeometry::rotate_cycle(&[10, 20, 30, 40], 30);
        assert_eq!(rotated, vec![30, 40, 10, 20]);
    }

    #[test]
    fn rotate_cycle_returns_original_if_node_missing() {
        let original = vec![1, 2, 3];
        assert_eq!(TourGeometry::rotate_cycle(&original, 99), original);
    }

    #[test]
    fn median_handles_even_and_odd_lengths() {
        assert_eq!(TourGeometry::median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(TourGeometry::median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(TourGeometry::median(&[]), 0.0);
    }

    #[test]
    fn bounding_box_reports_longest_axis_and_aspect() {
        let points = vec![
            Point::new(0.0, 0.0),
            Point::new(4.0, 1.0),
            Point::new(2.0, 0.5),
        ];
        let bbox = BoundingBox::of_points(&points);
        assert_eq!(bbox.longest_axis(), 0);
        assert!((bbox.aspect_ratio() - 4.0).abs() < 1e-9);
    }
}
