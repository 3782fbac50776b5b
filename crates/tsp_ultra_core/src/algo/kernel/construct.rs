use crate::{geometry::TourGeometry, node::Point, oracle::knn::KnnGraph};

/// How many recently visited cities lend their candidate lists before the
/// construction falls back to a linear scan.
const RECENT_FALLBACK_WINDOW: usize = 100;

/// Greedy nearest-neighbour tour from `start`, guided by the candidate graph.
pub(crate) fn nearest_neighbor_tour(points: &[Point], knn: &KnnGraph, start: usize) -> Vec<usize> {
    let n = points.len();
    if n == 0 {
        return Vec::new();
    }
    let start = start.min(n - 1);
    let mut visited = vec![false; n];
    let mut tour = Vec::with_capacity(n);
    tour.push(start);
    visited[start] = true;
    let mut current = start;

    while tour.len() < n {
        let next = nearest_unvisited_candidate(points, knn, current, &visited)
            .or_else(|| {
                tour.iter()
                    .rev()
                    .take(RECENT_FALLBACK_WINDOW)
                    .skip(1)
                    .find_map(|&recent| nearest_unvisited_candidate(points, knn, recent, &visited))
            })
            .or_else(|| nearest_unvisited_scan(points, current, &visited));

        let Some(next) = next else {
            break;
        };
        visited[next] = true;
        tour.push(next);
        current = next;
    }
    tour
}

fn nearest_unvisited_candidate(
    points: &[Point],
    knn: &KnnGraph,
    from: usize,
    visited: &[bool],
) -> Option<usize> {
    let anchor = points[from];
    knn.neighbors(from)
        .iter()
        .copied()
        .filter(|&j| !visited[j])
        .min_by(|&a, &b| anchor.dist_sq(points[a]).total_cmp(&anchor.dist_sq(points[b])))
}

fn nearest_unvisited_scan(points: &[Point], from: usize, visited: &[bool]) -> Option<usize> {
    let anchor = points[from];
    (0..points.len())
        .filter(|&j| !visited[j])
        .min_by(|&a, &b| anchor.dist_sq(points[a]).total_cmp(&anchor.dist_sq(points[b])))
}

/// Builds a nearest-neighbour tour from each start and keeps the shortest.
pub(crate) fn best_nearest_neighbor(points: &[Point], knn: &KnnGraph, starts: &[usize]) -> Vec<usize> {
    let mut best: Option<(f64, Vec<usize>)> = None;
    for &start in starts {
        let tour = nearest_neighbor_tour(points, knn, start);
        let len = TourGeometry::tour_length(points, &tour);
        if best.as_ref().is_none_or(|(b, _)| len < *b) {
            best = Some((len, tour));
        }
    }
    best.map(|(_, tour)| tour)
        .unwrap_or_else(|| nearest_neighbor_tour(points, knn, 0))
}

/// Start cities spread over the index range: 0, n/3 and 2n/3.
pub(crate) fn spread_starts(n: usize) -> Vec<usize> {
    let mut starts = vec![0, n / 3, 2 * n / 3];
    starts.retain(|&s| s < n.max(1));
    starts.dedup();
    starts
}
