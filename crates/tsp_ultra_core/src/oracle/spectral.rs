//! Smallest eigenpairs of a sparse graph Laplacian.
//!
//! Small problems go straight to a dense symmetric eigensolver. Larger ones use
//! block LOBPCG with a Jacobi preconditioner, and fall back to Lanczos with full
//! reorthogonalisation when LOBPCG stalls.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use rand::{Rng, SeedableRng, rngs::StdRng};

use crate::{Error, Result, oracle::laplacian::SparseLaplacian};

pub(crate) const DENSE_SOLVE_MAX_N: usize = 200;
const LOBPCG_MAX_ITERS: usize = 300;
const LOBPCG_TOL: f64 = 1e-6;
const LANCZOS_MIN_BASIS: usize = 60;
const LANCZOS_RESTARTS: usize = 4;
const ORTHO_DROP_NORM: f64 = 1e-10;

/// Eigenvalues in ascending order with their unit eigenvectors.
#[derive(Clone, Debug)]
pub(crate) struct Spectrum {
    pub(crate) values: Vec<f64>,
    pub(crate) vectors: Vec<Vec<f64>>,
}

impl Spectrum {
    /// `values[a] / values[b]`, or `None` when either index is missing or the
    /// denominator vanishes.
    pub(crate) fn ratio(&self, a: usize, b: usize) -> Option<f64> {
        let num = *self.values.get(a)?;
        let den = *self.values.get(b)?;
        (den.abs() > 1e-15).then(|| num / den)
    }
}

pub(crate) fn smallest_eigenpairs(
    lap: &SparseLaplacian,
    count: usize,
    seed: u64,
) -> Result<Spectrum> {
    let n = lap.dim();
    if n == 0 || count == 0 {
        return Err(Error::spectral(format!(
            "degenerate problem n={n} count={count}"
        )));
    }
    let count = count.min(n);

    if n < DENSE_SOLVE_MAX_N {
        return Ok(dense_smallest(&lap.to_dense(), count));
    }

    match lobpcg(lap, count, seed) {
        Ok(spectrum) => Ok(spectrum),
        Err(err) => {
            log::debug!("oracle.spectral: lobpcg failed n={n} err={err}, trying lanczos");
            lanczos(lap, count, seed)
        }
    }
}

fn dense_smallest(dense: &DMatrix<f64>, count: usize) -> Spectrum {
    let eig = SymmetricEigen::new(dense.clone());
    let mut order: Vec<usize> = (0..eig.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]));
    order.truncate(count);

    Spectrum {
        values: order.iter().map(|&i| eig.eigenvalues[i]).collect(),
        vectors: order
            .iter()
            .map(|&i| eig.eigenvectors.column(i).iter().copied().collect())
            .collect(),
    }
}

fn random_block(n: usize, m: usize, rng: &mut StdRng) -> DMatrix<f64> {
    DMatrix::from_fn(n, m, |_, _| rng.random::<f64>() - 0.5)
}

fn apply_block(lap: &SparseLaplacian, x: &DMatrix<f64>) -> DMatrix<f64> {
    let mut out = DMatrix::zeros(x.nrows(), x.ncols());
    for j in 0..x.ncols() {
        let col: Vec<f64> = x.column(j).iter().copied().collect();
        let y = lap.apply(&col);
        out.column_mut(j).copy_from_slice(&y);
    }
    out
}

/// Modified Gram-Schmidt, applied twice, dropping columns that collapse.
fn orthonormalize(block: &DMatrix<f64>) -> DMatrix<f64> {
    let mut kept: Vec<DVector<f64>> = Vec::with_capacity(block.ncols());
    for j in 0..block.ncols() {
        let mut v: DVector<f64> = block.column(j).into_owned();
        for _ in 0..2 {
            for q in &kept {
                let c = q.dot(&v);
                v.axpy(-c, q, 1.0);
            }
        }
        let norm = v.norm();
        if norm > ORTHO_DROP_NORM {
            kept.push(v / norm);
        }
    }
    if kept.is_empty() {
        return DMatrix::zeros(block.nrows(), 0);
    }
    DMatrix::from_columns(&kept)
}

/// Rayleigh-Ritz on an orthonormal basis: the `m` smallest Ritz pairs.
fn rayleigh_ritz(
    basis: &DMatrix<f64>,
    a_basis: &DMatrix<f64>,
    m: usize,
) -> (Vec<f64>, DMatrix<f64>) {
    let g = basis.transpose() * a_basis;
    let g = (&g + g.transpose()) * 0.5;
    let eig = SymmetricEigen::new(g);
    let mut order: Vec<usize> = (0..eig.eigenvalues.len()).collect();
    order.sort_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]));
    order.truncate(m);

    let values = order.iter().map(|&i| eig.eigenvalues[i]).collect();
    let cols: Vec<DVector<f64>> = order
        .iter()
        .map(|&i| eig.eigenvectors.column(i).into_owned())
        .collect();
    (values, DMatrix::from_columns(&cols))
}

fn lobpcg(lap: &SparseLaplacian, m: usize, seed: u64) -> Result<Spectrum> {
    let n = lap.dim();
    if n < 3 * m + 1 {
        return Err(Error::spectral(format!("block too large for n={n} m={m}")));
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let inv_diag: Vec<f64> = lap.degrees.iter().map(|&d| 1.0 / d.max(1e-12)).collect();

    let mut x = orthonormalize(&random_block(n, m, &mut rng));
    if x.ncols() < m {
        return Err(Error::spectral("initial block is rank deficient"));
    }
    let mut p: Option<DMatrix<f64>> = None;

    for iter in 0..LOBPCG_MAX_ITERS {
        let ax = apply_block(lap, &x);
        let (values, c) = rayleigh_ritz(&x, &ax, m);
        x = &x * &c;
        let ax = ax * &c;

        let mut residual = ax.clone();
        for j in 0..m {
            let xj = x.column(j).into_owned();
            residual.column_mut(j).axpy(-values[j], &xj, 1.0);
        }
        let converged =
            (0..m).all(|j| residual.column(j).norm() <= LOBPCG_TOL * (1.0 + values[j].abs()));
        if converged {
            log::trace!("oracle.spectral: lobpcg converged n={n} m={m} iters={}", iter + 1);
            return Ok(Spectrum {
                values,
                vectors: (0..m).map(|j| x.column(j).iter().copied().collect()).collect(),
            });
        }

        let mut w = residual;
        for (row, &s) in inv_diag.iter().enumerate() {
            for j in 0..m {
                w[(row, j)] *= s;
            }
        }

        let mut cols: Vec<DVector<f64>> = Vec::with_capacity(3 * m);
        cols.extend((0..m).map(|j| x.column(j).into_owned()));
        cols.extend((0..m).map(|j| w.column(j).into_owned()));
        if let Some(prev) = &p {
            cols.extend((0..prev.ncols()).map(|j| prev.column(j).into_owned()));
        }
        let basis = orthonormalize(&DMatrix::from_columns(&cols));
        if basis.ncols() < m {
            return Err(Error::spectral("search subspace collapsed"));
        }
        let a_basis = apply_block(lap, &basis);
        let (_, c) = rayleigh_ritz(&basis, &a_basis, m);
        let x_new = &basis * c;
        let overlap = x.transpose() * &x_new;
        p = Some(&x_new - &x * overlap);
        x = x_new;
    }

    Err(Error::spectral(format!(
        "lobpcg did not converge in {LOBPCG_MAX_ITERS} iterations"
    )))
}

fn lanczos(lap: &SparseLaplacian, count: usize, seed: u64) -> Result<Spectrum> {
    let n = lap.dim();
    let mut basis_size = (4 * count).max(LANCZOS_MIN_BASIS).min(n);
    let mut rng = StdRng::seed_from_u64(seed ^ 0x5eed);

    for attempt in 0..LANCZOS_RESTARTS {
        match lanczos_once(lap, count, basis_size, &mut rng) {
            Some(spectrum) => return Ok(spectrum),
            None => {
                log::debug!(
                    "oracle.spectral: lanczos attempt={} basis={basis_size} did not converge",
                    attempt + 1
                );
                if basis_size == n {
                    break;
                }
                basis_size = (basis_size * 2).min(n);
            }
        }
    }

    Err(Error::spectral(format!(
        "lanczos did not converge n={n} count={count}"
    )))
}

fn lanczos_once(
    lap: &SparseLaplacian,
    count: usize,
    m: usize,
    rng: &mut StdRng,
) -> Option<Spectrum> {
    let n = lap.dim();
    let mut v: DVector<f64> = DVector::from_fn(n, |_, _| rng.random::<f64>() - 0.5);
    let norm = v.norm();
    if norm < 1e-14 {
        return None;
    }
    v /= norm;

    let mut q = DMatrix::zeros(n, m);
    q.column_mut(0).copy_from(&v);
    let mut alpha: Vec<f64> = Vec::with_capacity(m);
    let mut beta: Vec<f64> = Vec::with_capacity(m);

    let mut w = DVector::from_vec(lap.apply(v.as_slice()));
    let a = v.dot(&w);
    alpha.push(a);
    w.axpy(-a, &v, 1.0);

    for j in 1..m {
        for _ in 0..2 {
            for i in 0..j {
                let qi = q.column(i).into_owned();
                let c = qi.dot(&w);
                w.axpy(-c, &qi, 1.0);
            }
        }
        let b = w.norm();
        if b < 1e-12 {
            break;
        }
        beta.push(b);
        let v_new = &w / b;
        q.column_mut(j).copy_from(&v_new);

        let mut w_next = DVector::from_vec(lap.apply(v_new.as_slice()));
        let a = v_new.dot(&w_next);
        alpha.push(a);
        w_next.axpy(-a, &v_new, 1.0);
        let prev = q.column(j - 1).into_owned();
        w_next.axpy(-b, &prev, 1.0);
        w = w_next;
    }

    let k = alpha.len();
    if k < count {
        return None;
    }
    let mut t = DMatrix::zeros(k, k);
    for i in 0..k {
        t[(i, i)] = alpha[i];
        if i + 1 < k {
            t[(i, i + 1)] = beta[i];
            t[(i + 1, i)] = beta[i];
        }
    }
    let residual_beta = if k == n { 0.0 } else { w.norm() };

    let eig = SymmetricEigen::new(t);
    let mut order: Vec<usize> = (0..k).collect();
    order.sort_by(|&a, &b| eig.eigenvalues[a].total_cmp(&eig.eigenvalues[b]));
    order.truncate(count);

    let q_used = q.columns(0, k);
    let mut values = Vec::with_capacity(count);
    let mut vectors = Vec::with_capacity(count);
    for &i in &order {
        let y = eig.eigenvectors.column(i);
        let lambda = eig.eigenvalues[i];
        if residual_beta * y[k - 1].abs() > LOBPCG_TOL * (1.0 + lambda.abs()) {
            return None;
        }
        let ritz = &q_used * y;
        let norm = ritz.norm().max(1e-300);
        values.push(lambda);
        vectors.push(ritz.iter().map(|v| v / norm).collect());
    }
    Some(Spectrum { values, vectors })
}
