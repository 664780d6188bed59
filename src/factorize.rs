use anyhow::{bail, Context, Result};
use ndarray::{s, Array1, Array2};
use ndarray_linalg::{Diag, SolveTriangular, QR, SVD, UPLO};

/// Truncated SVD of the implicit genotype matrix.
#[derive(Debug)]
pub struct SvdResult {
    /// Left singular vectors (marker loadings): n_markers × k
    pub u: Array2<f64>,
    /// Singular values, descending: k
    pub s: Array1<f64>,
    /// Right singular vectors, row-wise (sample eigenvectors): k × n_samples
    pub vt: Array2<f64>,
}

/// Smallest tolerated ratio between the extreme diagonal magnitudes of R.
const RANK_TOL: f64 = 1e-12;

/// Recover the truncated factorization from the converged accumulators.
///
/// `g` (M × L) is the projection accumulator of the final pass, `h` (N × L)
/// the matching cross-product accumulator. The route follows the reference
/// algebra: reduced QR of G, a second QR to re-orthogonalize Q against
/// accumulated rounding drift (R = R1·R2), the triangular solve
/// `Rᵀ X = Hᵀ`, and a full SVD of the small L × N matrix X. Left vectors
/// come back through Q, and all three factors are truncated to `k`,
/// discarding the oversampling columns.
pub fn factorize(g: &Array2<f64>, h: &Array2<f64>, k: usize) -> Result<SvdResult> {
    let l = g.ncols();
    debug_assert!(k <= l);
    debug_assert_eq!(h.ncols(), l);

    let (q1, r1) = g.qr()?;
    let (q, r2) = q1.qr()?;
    let r = r1.dot(&r2);

    // A singular R means the subspace collapsed; surface it instead of
    // letting the solve emit NaNs.
    let mut d_max = 0.0f64;
    let mut d_min = f64::INFINITY;
    for i in 0..l {
        let d = r[(i, i)].abs();
        d_max = d_max.max(d);
        d_min = d_min.min(d);
    }
    if !d_min.is_finite() || d_min <= RANK_TOL * d_max.max(1.0) {
        bail!(
            "projection accumulator is rank-deficient (|R| diagonal spans {:.3e}..{:.3e}); \
             reduce the requested rank or increase oversampling",
            d_min,
            d_max
        );
    }

    let rt = r.t().to_owned();
    let b = rt.solve_triangular(UPLO::Lower, Diag::NonUnit, &h.t().to_owned())?;

    let (u_opt, sv, vt_opt) = b.svd(true, true)?;
    let u_hat = u_opt.context("SVD did not return U")?;
    let vt = vt_opt.context("SVD did not return Vt")?;

    // LAPACK returns singular values in descending order.
    debug_assert!(sv.windows(2).into_iter().all(|w| w[0] >= w[1]));

    let u = q.dot(&u_hat);
    Ok(SvdResult {
        u: u.slice(s![.., ..k]).to_owned(),
        s: sv.slice(s![..k]).to_owned(),
        vt: vt.slice(s![..k, ..]).to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use rand_distr::{Distribution, Normal};

    /// Build G = A·O and H = Aᵀ·G for a dense A and Gaussian O, i.e. one
    /// exact full-data pass, then factorize.
    fn one_pass_accumulators(a: &Array2<f64>, l: usize, seed: u64) -> (Array2<f64>, Array2<f64>) {
        let n = a.ncols();
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let omega = Array2::from_shape_fn((n, l), |_| normal.sample(&mut rng));
        let g = a.dot(&omega);
        let h = a.t().dot(&g);
        (g, h)
    }

    #[test]
    fn test_factorize_recovers_orthonormal_factors() {
        let m = 60;
        let n = 20;
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let a = Array2::from_shape_fn((m, n), |_| normal.sample(&mut rng));

        let k = 4;
        let (g, h) = one_pass_accumulators(&a, k + 6, 1);
        let res = factorize(&g, &h, k).unwrap();

        assert_eq!(res.u.shape(), &[m, k]);
        assert_eq!(res.s.len(), k);
        assert_eq!(res.vt.shape(), &[k, n]);

        // Descending, non-negative singular values
        for i in 0..k {
            assert!(res.s[i] >= 0.0);
            if i > 0 {
                assert!(res.s[i - 1] >= res.s[i]);
            }
        }

        // Orthonormal columns of U and rows of Vt
        let utu = res.u.t().dot(&res.u);
        let vvt = res.vt.dot(&res.vt.t());
        for i in 0..k {
            for j in 0..k {
                let expected = if i == j { 1.0 } else { 0.0 };
                assert_abs_diff_eq!(utu[(i, j)], expected, epsilon = 1e-8);
                assert_abs_diff_eq!(vvt[(i, j)], expected, epsilon = 1e-8);
            }
        }
    }

    #[test]
    fn test_rank_deficient_projection_is_an_error() {
        let g = Array2::<f64>::zeros((30, 8));
        let h = Array2::<f64>::zeros((10, 8));
        let err = factorize(&g, &h, 4).unwrap_err();
        assert!(err.to_string().contains("rank-deficient"), "got: {err}");
    }
}
