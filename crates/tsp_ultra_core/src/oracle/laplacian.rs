use std::collections::HashMap;

use nalgebra::DMatrix;
use sprs::{CsMat, TriMat};

use crate::{geometry::TourGeometry, oracle::knn::KnnGraph};

/// Drop kernel weights below this value from the sparsity pattern.
const WEIGHT_THRESHOLD: f64 = 1e-12;

/// Unnormalised graph Laplacian `L = D - W` of a symmetrised Gaussian-kernel
/// k-NN graph.
pub(crate) struct SparseLaplacian {
    pub(crate) matrix: CsMat<f64>,
    pub(crate) degrees: Vec<f64>,
    pub(crate) sigma: f64,
}

impl SparseLaplacian {
    /// Kernel width is twice the median 1-NN distance.
    pub(crate) fn from_knn(knn: &KnnGraph) -> Self {
        let n = knn.len();
        let nn1: Vec<f64> = (0..n).filter_map(|i| knn.nearest_distance(i)).collect();
        let mut sigma = 2.0 * TourGeometry::median(&nn1);
        if !(sigma.is_finite() && sigma > 0.0) {
            sigma = 1.0;
        }
        let two_sigma_sq = 2.0 * sigma * sigma;

        // (W + W^T) / 2 over unordered pairs.
        let mut weights: HashMap<(usize, usize), f64> = HashMap::with_capacity(n * knn.width());
        for i in 0..n {
            for (&j, &d) in knn.neighbors(i).iter().zip(knn.distances(i)) {
                let w = (-(d * d) / two_sigma_sq).exp();
                if w < WEIGHT_THRESHOLD {
                    continue;
                }
                let key = if i < j { (i, j) } else { (j, i) };
                *weights.entry(key).or_insert(0.0) += 0.5 * w;
            }
        }

        let mut degrees = vec![0.0; n];
        let mut tri = TriMat::with_capacity((n, n), 2 * weights.len() + n);
        for (&(i, j), &w) in &weights {
            tri.add_triplet(i, j, -w);
            tri.add_triplet(j, i, -w);
            degrees[i] += w;
            degrees[j] += w;
        }
        for (i, &deg) in degrees.iter().enumerate() {
            tri.add_triplet(i, i, deg);
        }

        Self {
            matrix: tri.to_csr(),
            degrees,
            sigma,
        }
    }

    pub(crate) fn dim(&self) -> usize {
        self.degrees.len()
    }

    pub(crate) fn nnz(&self) -> usize {
        self.matrix.nnz()
    }

    /// `y = L x`.
    pub(crate) fn apply(&self, x: &[f64]) -> Vec<f64> {
        let mut y = vec![0.0; self.dim()];
        for (row, vec) in self.matrix.outer_iterator().enumerate() {
            let mut acc = 0.0;
            for (col, &v) in vec.iter() {
                acc += v * x[col];
            }
            y[row] = acc;
        }
        y
    }

    pub(crate) fn to_dense(&self) -> DMatrix<f64> {
        let n = self.dim();
        let mut dense = DMatrix::zeros(n, n);
        for (&v, (row, col)) in self.matrix.iter() {
            dense[(row, col)] += v;
        }
        dense
    }
}
