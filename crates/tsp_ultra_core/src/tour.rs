use crate::{Error, Result, node::Point};

/// True when `tour` holds every id in `0..n` exactly once.
pub fn is_permutation(tour: &[usize], n: usize) -> bool {
    if tour.len() != n {
        return false;
    }
    let mut seen = vec![false; n];
    for &id in tour {
        if id >= n || seen[id] {
            return false;
        }
        seen[id] = true;
    }
    true
}

pub(crate) fn validate_permutation(tour: &[usize], n: usize) -> Result<()> {
    let mut seen = vec![false; n];
    for &id in tour {
        if id >= n {
            return Err(Error::invalid_tour(format!("id {id} out of range n={n}")));
        }
        if seen[id] {
            return Err(Error::invalid_tour(format!("duplicate id {id}")));
        }
        seen[id] = true;
    }
    if let Some(missing) = seen.iter().position(|s| !s) {
        return Err(Error::invalid_tour(format!(
            "missing id {missing} (len={} n={n})",
            tour.len()
        )));
    }
    Ok(())
}

/// Drops duplicate and out-of-range ids (first occurrence wins), then inserts
/// every missing id at its cheapest position. Returns the number of ids that
/// had to be inserted.
pub(crate) fn repair_permutation(points: &[Point], tour: &mut Vec<usize>) -> usize {
    let n = points.len();
    let mut seen = vec![false; n];
    tour.retain(|&id| {
        if id >= n || seen[id] {
            return false;
        }
        seen[id] = true;
        true
    });

    let missing: Vec<usize> = (0..n).filter(|&id| !seen[id]).collect();
    for &id in &missing {
        cheapest_insertion(points, tour, id);
    }
    missing.len()
}

fn cheapest_insertion(points: &[Point], tour: &mut Vec<usize>, id: usize) {
    let m = tour.len();
    if m < 2 {
        tour.push(id);
        return;
    }
    let p = points[id];
    let mut best_pos = m;
    let mut best_cost = f64::INFINITY;
    for i in 0..m {
        let a = points[tour[i]];
        let b = points[tour[(i + 1) % m]];
        let cost = a.dist(p) + p.dist(b) - a.dist(b);
        if cost < best_cost {
            best_cost = cost;
            best_pos = i + 1;
        }
    }
    tour.insert(best_pos, id);
}
