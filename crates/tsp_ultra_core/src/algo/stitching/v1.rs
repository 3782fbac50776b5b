use crate::{algo::stitching::LeafTour, geometry::TourGeometry, node::Point};

/// Visits leaves in greedy nearest-centroid order. Each leaf's tour is rotated
/// so the city closest to the next leaf's centroid comes last.
pub(super) fn join(points: &[Point], leaves: &[LeafTour]) -> Vec<usize> {
    match leaves {
        [] => return Vec::new(),
        [only] => return only.tour.clone(),
        _ => {}
    }
    let order = centroid_order(leaves);
    let mut tour = Vec::with_capacity(leaves.iter().map(|l| l.tour.len()).sum());
    for (k, &li) in order.iter().enumerate() {
        let leaf = &leaves[li];
        let target = leaves[order[(k + 1) % order.len()]].centroid;
        let Some(exit) = leaf
            .tour
            .iter()
            .copied()
            .min_by(|&a, &b| points[a].dist_sq(target).total_cmp(&points[b].dist_sq(target)))
        else {
            continue;
        };
        let rotated = TourGeometry::rotate_cycle(&leaf.tour, exit);
        tour.extend_from_slice(&rotated[1..]);
        tour.push(exit);
    }
    tour
}

/// Greedy nearest-neighbour walk over leaf centroids starting at leaf 0.
pub(super) fn centroid_order(leaves: &[LeafTour]) -> Vec<usize> {
    let l = leaves.len();
    let mut visited = vec![false; l];
    let mut order = Vec::with_capacity(l);
    let mut current = 0;
    while order.len() < l {
        visited[current] = true;
        order.push(current);
        let here = leaves[current].centroid;
        let next = (0..l).filter(|&j| !visited[j]).min_by(|&a, &b| {
            here.dist_sq(leaves[a].centroid)
                .total_cmp(&here.dist_sq(leaves[b].centroid))
        });
        match next {
            Some(j) => current = j,
            None => break,
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algo::kernel::test_support::assert_valid;

    fn leaf(points: &[Point], tour: Vec<usize>) -> LeafTour {
        LeafTour {
            centroid: TourGeometry::centroid_of_indices(points, &tour),
            boundary: tour.clone(),
            tour,
        }
    }

    #[test]
    fn centroid_order_walks_a_row_of_leaves() {
        let points: Vec<Point> = (0..8).map(|i| Point::new(i as f64 * 10.0, 0.0)).collect();
        let leaves: Vec<LeafTour> = [0, 3, 1, 2]
            .iter()
            .map(|&c| leaf(&points, vec![2 * c, 2 * c + 1]))
            .collect();
        assert_eq!(centroid_order(&leaves), vec![0, 2, 3, 1]);
    }

    #[test]
    fn each_leaf_exits_towards_the_next() {
        let points = vec![
            Point::new(0.0, 0.0),
            Point::new(1.0, 0.0),
            Point::new(1.0, 1.0),
            Point::new(0.0, 1.0),
            Point::new(10.0, 0.0),
            Point::new(11.0, 0.0),
            Point::new(11.0, 1.0),
            Point::new(10.0, 1.0),
        ];
        let leaves = vec![leaf(&points, vec![0, 1, 2, 3]), leaf(&points, vec![4, 5, 6, 7])];
        let tour = join(&points, &leaves);
        assert_valid(&tour, 8);
        let exit_a = tour[3];
        assert!(exit_a == 1 || exit_a == 2);
        assert_eq!(tour, vec![2, 3, 0, 1, 5, 6, 7, 4]);

        // Plain concatenation pays two diagonal seams; rotation leaves one.
        let naive: Vec<usize> = (0..8).collect();
        let stitched = TourGeometry::tour_length(&points, &tour);
        assert!(stitched < TourGeometry::tour_length(&points, &naive) - 1.0);
        assert!((stitched - (16.0 + 82f64.sqrt())).abs() < 1e-9, "len={stitched}");
    }
}
