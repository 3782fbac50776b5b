use std::fmt;

/// Planar point. Coordinates are taken as-is; the metric is Euclidean.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    #[inline]
    pub fn dist(self, rhs: Self) -> f64 {
        let dx = self.x - rhs.x;
        let dy = self.y - rhs.y;
        (dx * dx + dy * dy).sqrt()
    }

    #[inline]
    pub fn dist_sq(self, rhs: Self) -> f64 {
        let dx = self.x - rhs.x;
        let dy = self.y - rhs.y;
        dx * dx + dy * dy
    }

    #[inline]
    pub(crate) fn as_array(self) -> [f64; 2] {
        [self.x, self.y]
    }

    pub(crate) fn is_valid(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut b1 = ryu::Buffer::new();
        let mut b2 = ryu::Buffer::new();
        write!(f, "{},{}", b1.format(self.x), b2.format(self.y))
    }
}

#[cfg(test)]
mod tests {
    use super::Point;

    #[test]
    fn dist_is_symmetric_and_zero_for_same_point() {
        let a = Point::new(0.0, 0.0);
        let b = Point::new(3.0, 4.0);

        assert!((a.dist(b) - 5.0).abs() < 1e-12);
        assert!((b.dist(a) - 5.0).abs() < 1e-12);
        assert!(a.dist(a).abs() < 1e-12);
        assert!((a.dist_sq(b) - 25.0).abs() < 1e-12);
    }

    #[test]
    fn non_finite_coordinates_are_rejected() {
        assert!(Point::new(1.0, -2.0).is_valid());
        assert!(!Point::new(f64::NAN, 0.0).is_valid());
        assert!(!Point::new(0.0, f64::INFINITY).is_valid());
    }

    #[test]
    fn display_formats_as_x_comma_y() {
        assert_eq!(Point::new(1.5, -2.25).to_string(), "1.5,-2.25");
    }
}
