use crate::{
    geometry::{BoundingBox, TourGeometry},
    options::FingerprintMode,
    oracle::DistanceOracle,
    router::RoutingThresholds,
};

const DENSITY_GRID: usize = 4;
const LABEL_PROPAGATION_ROUNDS: usize = 5;
const NEUTRAL_SPECTRAL_GAP: f64 = 0.5;
const SPECTRAL_GAP_VECTORS: usize = 4;
const FAST_MODULARITY_OFFSET: f64 = 0.3;
const RATIO_EPS: f64 = 1e-12;

/// Cheap topological statistics of one instance, computed once per solve.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InstanceFingerprint {
    pub n: usize,
    /// Coefficient of variation of 1-NN distances.
    pub cv_nn_dist: f64,
    /// Second over third smallest Laplacian eigenvalue.
    pub spectral_gap: f64,
    /// Newman modularity of the k-NN graph, exact or estimated.
    pub modularity: f64,
    pub aspect_ratio: f64,
    /// Coefficient of variation of point counts over a 4x4 grid.
    pub density_cv: f64,
    pub mean_nn_dist: f64,
    /// Share of rows whose best candidate has zero alpha.
    pub alpha_edge_ratio: f64,
}

impl InstanceFingerprint {
    pub fn compute(oracle: &DistanceOracle<'_>, mode: FingerprintMode, seed: u64) -> Self {
        let points = oracle.points();
        let n = points.len();
        let nn: Vec<f64> = (0..n)
            .filter_map(|i| oracle.knn().nearest_distance(i))
            .collect();
        let (mean_nn_dist, std_nn) = TourGeometry::mean_std(&nn);
        let cv_nn_dist = std_nn / (mean_nn_dist + RATIO_EPS);

        let bbox = BoundingBox::of_points(points);
        let (spectral_gap, modularity) = match mode {
            FingerprintMode::Fast => (NEUTRAL_SPECTRAL_GAP, fast_modularity(cv_nn_dist)),
            FingerprintMode::Exact => (spectral_gap(oracle, seed), label_modularity(oracle)),
        };

        Self {
            n,
            cv_nn_dist,
            spectral_gap,
            modularity,
            aspect_ratio: bbox.aspect_ratio(),
            density_cv: density_cv(points, &bbox),
            mean_nn_dist,
            alpha_edge_ratio: oracle.alpha_ratio(),
        }
    }

    pub fn is_clustered(&self, th: &RoutingThresholds) -> bool {
        self.cv_nn_dist > th.cv_clustered || self.modularity > th.modularity_clustered
    }

    pub fn is_uniform(&self, th: &RoutingThresholds) -> bool {
        self.cv_nn_dist < th.cv_uniform && self.modularity < th.modularity_uniform
    }

    pub fn is_structured(&self, th: &RoutingThresholds) -> bool {
        self.cv_nn_dist < th.cv_structured && self.aspect_ratio > th.aspect_structured
    }

    pub fn pattern(&self, th: &RoutingThresholds) -> &'static str {
        if self.is_uniform(th) {
            "uniform"
        } else if self.is_clustered(th) {
            "clustered"
        } else {
            "mixed"
        }
    }

    pub fn summary(&self, th: &RoutingThresholds) -> String {
        format!(
            "n={} pattern={} cv_nn={:.3} gap={:.3} q={:.3} aspect={:.2} density_cv={:.3}",
            self.n,
            self.pattern(th),
            self.cv_nn_dist,
            self.spectral_gap,
            self.modularity,
            self.aspect_ratio,
            self.density_cv
        )
    }
}

fn fast_modularity(cv: f64) -> f64 {
    (cv - FAST_MODULARITY_OFFSET).clamp(0.0, 1.0)
}

fn spectral_gap(oracle: &DistanceOracle<'_>, seed: u64) -> f64 {
    match oracle.spectrum(SPECTRAL_GAP_VECTORS, seed) {
        Ok(spectrum) if spectrum.values.get(2).is_some_and(|&v| v > 1e-10) => {
            spectrum.ratio(1, 2).unwrap_or(NEUTRAL_SPECTRAL_GAP)
        }
        Ok(_) => NEUTRAL_SPECTRAL_GAP,
        Err(err) => {
            log::debug!("fingerprint: spectral gap unavailable err={err}");
            NEUTRAL_SPECTRAL_GAP
        }
    }
}

fn density_cv(points: &[crate::node::Point], bbox: &BoundingBox) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let mut counts = [0.0f64; DENSITY_GRID * DENSITY_GRID];
    let w = bbox.width() + RATIO_EPS;
    let h = bbox.height() + RATIO_EPS;
    for p in points {
        let gx = (((p.x - bbox.min.x) / w * DENSITY_GRID as f64) as usize).min(DENSITY_GRID - 1);
        let gy = (((p.y - bbox.min.y) / h * DENSITY_GRID as f64) as usize).min(DENSITY_GRID - 1);
        counts[gx * DENSITY_GRID + gy] += 1.0;
    }
    let (mean, std) = TourGeometry::mean_std(&counts);
    if mean < RATIO_EPS { 0.0 } else { std / mean }
}

/// Label propagation over the k-NN graph, then Newman's Q of the resulting
/// partition with every candidate edge taken as an undirected edge.
fn label_modularity(oracle: &DistanceOracle<'_>) -> f64 {
    let knn = oracle.knn();
    let n = knn.len();
    let m = knn.edge_count() as f64;
    if n == 0 || m == 0.0 {
        return 0.0;
    }

    let mut labels: Vec<usize> = (0..n).collect();
    let mut votes: Vec<(usize, usize)> = Vec::with_capacity(knn.width());
    for round in 0..LABEL_PROPAGATION_ROUNDS {
        let mut changed = false;
        for i in 0..n {
            votes.clear();
            for &j in knn.neighbors(i) {
                let label = labels[j];
                match votes.iter_mut().find(|(l, _)| *l == label) {
                    Some((_, count)) => *count += 1,
                    None => votes.push((label, 1)),
                }
            }
            // Most votes wins, ties go to the smaller label.
            let winner = votes
                .iter()
                .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
                .map(|&(label, _)| label);
            if let Some(label) = winner.filter(|&l| l != labels[i]) {
                labels[i] = label;
                changed = true;
            }
        }
        if !changed {
            log::trace!("fingerprint: label propagation settled round={round}");
            break;
        }
    }

    let mut internal = vec![0.0; n];
    let mut degree_sum = vec![0.0; n];
    for i in 0..n {
        for &j in knn.neighbors(i) {
            degree_sum[labels[i]] += 1.0;
            degree_sum[labels[j]] += 1.0;
            if labels[i] == labels[j] {
                internal[labels[i]] += 1.0;
            }
        }
    }
    let two_m = 2.0 * m;
    let q: f64 = internal
        .iter()
        .zip(&degree_sum)
        .map(|(&l, &d)| l / m - (d / two_m).powi(2))
        .sum();
    q.clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use rand::{Rng, SeedableRng, rngs::StdRng};

    use super::*;
    use crate::{node::Point, options::SolverOptions};

    fn uniform(n: usize, seed: u64) -> Vec<Point> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| Point::new(rng.random::<f64>() * 1000.0, rng.random::<f64>() * 1000.0))
            .collect()
    }

    fn blobs(per_blob: usize, seed: u64) -> Vec<Point> {
        let mut rng = StdRng::seed_from_u64(seed);
        let centres = [(0.0, 0.0), (5000.0, 0.0), (0.0, 5000.0), (5000.0, 5000.0)];
        centres
            .iter()
            .flat_map(|&(cx, cy)| {
                (0..per_blob)
                    .map(|_| Point::new(cx + rng.random::<f64>() * 20.0, cy + rng.random::<f64>() * 20.0))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    #[test]
    fn uniform_instance_reads_as_uniform() {
        let points = uniform(800, 1);
        let oracle = DistanceOracle::new(&points, 10);
        let th = RoutingThresholds::from_options(&SolverOptions::default());
        let fp = InstanceFingerprint::compute(&oracle, FingerprintMode::Fast, 0);
        assert_eq!(fp.n, 800);
        assert!(fp.cv_nn_dist < 0.8, "cv={}", fp.cv_nn_dist);
        assert_eq!(fp.spectral_gap, NEUTRAL_SPECTRAL_GAP);
        assert!(fp.aspect_ratio < 1.5);
        assert!(fp.density_cv < 0.5);
        assert!(!fp.is_clustered(&th));
        assert!(fp.summary(&th).starts_with("n=800 pattern="));
    }

    #[test]
    fn blobs_have_high_modularity_in_exact_mode() {
        let points = blobs(12, 2);
        let oracle = DistanceOracle::new(&points, 8);
        let th = RoutingThresholds::from_options(&SolverOptions::default());
        let fp = InstanceFingerprint::compute(&oracle, FingerprintMode::Exact, 3);
        assert!(fp.modularity > 0.4, "q={}", fp.modularity);
        assert!(fp.is_clustered(&th));
        assert_eq!(fp.pattern(&th), "clustered");
        assert!(fp.density_cv > 1.0);
    }

    #[test]
    fn exact_spectral_gap_is_finite() {
        let points = uniform(150, 4);
        let oracle = DistanceOracle::new(&points, 8);
        let fp = InstanceFingerprint::compute(&oracle, FingerprintMode::Exact, 5);
        assert!(fp.spectral_gap.is_finite());
        assert!((-1e-9..=1.0 + 1e-9).contains(&fp.spectral_gap));
    }

    #[test]
    fn fast_modularity_is_clamped() {
        assert_eq!(fast_modularity(0.1), 0.0);
        assert!((fast_modularity(0.8) - 0.5).abs() < 1e-12);
        assert_eq!(fast_modularity(5.0), 1.0);
    }

    #[test]
    fn line_is_structured() {
        let points: Vec<Point> = (0..100).map(|i| Point::new(i as f64, (i % 2) as f64 * 0.5)).collect();
        let oracle = DistanceOracle::new(&points, 4);
        let th = RoutingThresholds::from_options(&SolverOptions::default());
        let fp = InstanceFingerprint::compute(&oracle, FingerprintMode::Fast, 0);
        assert!(fp.aspect_ratio > 1.5);
        assert!(fp.is_structured(&th));
    }
}
