use std::sync::Mutex;

use anyhow::{ensure, Context, Result};
use ndarray::{s, Array2, ArrayViewMut2};
use ndarray_linalg::{Eigh, QR, UPLO};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::factorize::{factorize, SvdResult};
use crate::parallel::{parallel_stream, serial_stream, DisjointRowWriter};
use crate::progress::make_progress_bar;
use crate::source::BatchSource;
use crate::timer::PassTimer;
use crate::{HalkoConfig, Schedule};

/// Compute a truncated randomized SVD of the matrix behind `source`.
///
/// The matrix is consumed in marker batches through the `BatchSource`
/// interface and never materialized whole. Each full pass accumulates the
/// projection `G[rows] = A_batch · O` and the cross-product
/// `H += A_batchᵀ · G[rows]`; the probing matrix `O` is refreshed by reduced
/// QR between passes (or blocks, for the block-epoch schedule). The final
/// pass's accumulators are handed to the factorization finisher.
///
/// With a fixed seed and `n_workers == 0` the result is bit-identical across
/// reruns; with workers, batch accumulation order may differ within
/// floating-point associativity.
pub fn randomized_svd<S: BatchSource>(source: &S, config: &HalkoConfig) -> Result<SvdResult> {
    let m = source.n_markers();
    let n = source.n_samples();
    let l = config.k + config.oversampling;

    ensure!(config.k >= 1, "requested rank must be at least 1");
    ensure!(m >= 1 && n >= 1, "empty genotype matrix ({m} × {n})");
    ensure!(
        l <= m.min(n),
        "rank + oversampling = {} exceeds min(markers, samples) = {}",
        l,
        m.min(n)
    );
    ensure!(config.batch_size >= 1, "batch size must be at least 1");

    match config.schedule {
        Schedule::Fixed { power } => {
            ensure!(power >= 1, "power iteration count must be at least 1");
            run_fixed(source, config, power)
        }
        Schedule::DynamicShift { power } => {
            ensure!(power >= 1, "power iteration count must be at least 1");
            run_dynamic_shift(source, config, power).map(|(res, _)| res)
        }
        Schedule::BlockEpoch { epochs, blocks } => {
            ensure!(epochs >= 1, "epoch count must be at least 1");
            ensure!(blocks >= 1, "initial block count must be at least 1");
            run_block_epoch(source, config, epochs, blocks)
        }
    }
}

/// Seeded N × L Gaussian probing matrix.
fn gaussian_probe(n: usize, l: usize, rng: &mut ChaCha8Rng) -> Array2<f64> {
    let normal = Normal::new(0.0, 1.0).unwrap();
    Array2::from_shape_fn((n, l), |_| normal.sample(rng))
}

/// Replace the probe with an orthonormal basis of the accumulated
/// cross-product via reduced QR.
fn orthonormalize(h: &Array2<f64>) -> Result<Array2<f64>> {
    let (q, _r) = h.qr()?;
    Ok(q)
}

/// Smallest retained singular value of the iterate, read off a symmetric
/// eigendecomposition of HᵀH. Rounding can push the smallest eigenvalue
/// slightly negative; clamp to zero rather than fail.
fn smallest_singular_value(h: &Array2<f64>) -> Result<f64> {
    let gram = h.t().dot(h);
    let (eigvals, _) = gram.eigh(UPLO::Lower)?;
    // eigh returns eigenvalues in ascending order
    Ok(eigvals[0].max(0.0).sqrt())
}

/// One pass over `markers`: for every batch, `G[rows] = A_batch · O` and
/// `H += A_batchᵀ · G[rows]`. Rows of `g` correspond to positions in
/// `markers`, so a shuffled pass writes `g` in shuffled order.
fn subspace_pass<S: BatchSource>(
    source: &S,
    markers: &[usize],
    omega: &Array2<f64>,
    mut g: ArrayViewMut2<f64>,
    h: &mut Array2<f64>,
    config: &HalkoConfig,
    label: &str,
) -> Result<()> {
    debug_assert_eq!(g.nrows(), markers.len());
    let batch = config.batch_size;
    let n_batches = markers.len().div_ceil(batch) as u64;
    let pb = make_progress_bar(n_batches, label, config.progress);

    if config.n_workers > 0 {
        let writer = DisjointRowWriter::new(g);
        let acc = Mutex::new(Array2::<f64>::zeros(h.raw_dim()));
        parallel_stream(source, markers, batch, config.n_workers, |block| {
            let a = block.data.slice(s![..block.n_rows, ..]);
            let g_rows = a.dot(omega);
            unsafe {
                writer.write_rows(block.seq * batch, &g_rows);
            }
            let partial = a.t().dot(&g_rows);
            let mut guard = acc.lock().unwrap();
            *guard += &partial;
            pb.inc(1);
        })
        .with_context(|| format!("during {label}"))?;
        *h += &acc.into_inner().unwrap();
    } else {
        serial_stream(source, markers, batch, |block| {
            let a = block.data.slice(s![..block.n_rows, ..]);
            let g_rows = a.dot(omega);
            let offset = block.seq * batch;
            g.slice_mut(s![offset..offset + block.n_rows, ..])
                .assign(&g_rows);
            *h += &a.t().dot(&g_rows);
            pb.inc(1);
            Ok(())
        })
        .with_context(|| format!("during {label}"))?;
    }

    pb.finish_and_clear();
    Ok(())
}

/// Plain Halko: a fixed number of full power-iteration passes, QR refresh of
/// the probe between passes, no shift and no early stop.
fn run_fixed<S: BatchSource>(
    source: &S,
    config: &HalkoConfig,
    power: usize,
) -> Result<SvdResult> {
    let m = source.n_markers();
    let n = source.n_samples();
    let l = config.k + config.oversampling;
    let markers: Vec<usize> = (0..m).collect();

    let timer = PassTimer::new("halko (fixed)");
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut omega = gaussian_probe(n, l, &mut rng);
    let mut g = Array2::<f64>::zeros((m, l));
    let mut h = Array2::<f64>::zeros((n, l));

    for p in 0..power {
        if p > 0 {
            omega = orthonormalize(&h)?;
            h.fill(0.0);
        }
        let label = format!("Power iter {}/{}", p + 1, power);
        subspace_pass(source, &markers, &omega, g.view_mut(), &mut h, config, &label)?;
    }

    let result = factorize(&g, &h, config.k)?;
    timer.finish();
    Ok(result)
}

/// Dynamic-shift Halko: between passes, deflate the accumulated
/// cross-product by `a · Q_prev` before orthogonalizing. The shift tracks a
/// lower bound on the noise floor of the iterate's spectrum and never
/// decreases. Deflation starts once the probe is orthonormal (from the
/// second refresh); the first probe is raw Gaussian, not a Q.
///
/// Returns the shift history alongside the result so its monotonicity is
/// testable.
pub(crate) fn run_dynamic_shift<S: BatchSource>(
    source: &S,
    config: &HalkoConfig,
    power: usize,
) -> Result<(SvdResult, Vec<f64>)> {
    let m = source.n_markers();
    let n = source.n_samples();
    let l = config.k + config.oversampling;
    let markers: Vec<usize> = (0..m).collect();

    let timer = PassTimer::new("halko (dynamic shift)");
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut omega = gaussian_probe(n, l, &mut rng);
    let mut g = Array2::<f64>::zeros((m, l));
    let mut h = Array2::<f64>::zeros((n, l));

    let mut alpha = 0.0f64;
    let mut shifts = Vec::with_capacity(power.saturating_sub(1));

    for p in 0..power {
        if p > 0 {
            let s_min = smallest_singular_value(&h)?;
            alpha = alpha.max(0.5 * (s_min + alpha));
            shifts.push(alpha);
            if p > 1 {
                // omega still holds the previous pass's orthonormal Q
                h.scaled_add(-alpha, &omega);
            }
            omega = orthonormalize(&h)?;
            h.fill(0.0);
        }
        let label = format!("Shifted power iter {}/{}", p + 1, power);
        subspace_pass(source, &markers, &omega, g.view_mut(), &mut h, config, &label)?;
    }

    let result = factorize(&g, &h, config.k)?;
    timer.finish();
    Ok((result, shifts))
}

/// Block-epoch (PCAone) schedule: each epoch shuffles the markers and
/// refreshes the probe after every block, with the block count halving each
/// epoch so refreshes coarsen as the subspace converges. A final unshuffled
/// full pass produces the accumulators handed to the finisher.
fn run_block_epoch<S: BatchSource>(
    source: &S,
    config: &HalkoConfig,
    epochs: usize,
    blocks: usize,
) -> Result<SvdResult> {
    let m = source.n_markers();
    let n = source.n_samples();
    let l = config.k + config.oversampling;

    let timer = PassTimer::new("halko (block-epoch)");
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let mut omega = gaussian_probe(n, l, &mut rng);
    let mut g = Array2::<f64>::zeros((m, l));
    let mut h = Array2::<f64>::zeros((n, l));

    let mut markers: Vec<usize> = (0..m).collect();

    for epoch in 0..epochs {
        markers.shuffle(&mut rng);
        let n_blocks = blocks.checked_shr(epoch as u32).unwrap_or(0).max(1).min(m);
        let block_len = m.div_ceil(n_blocks);

        h.fill(0.0);
        let mut start = 0;
        let mut block_idx = 0;
        while start < m {
            let end = (start + block_len).min(m);
            let label = format!(
                "Epoch {}/{} block {}/{}",
                epoch + 1,
                epochs,
                block_idx + 1,
                m.div_ceil(block_len)
            );
            subspace_pass(
                source,
                &markers[start..end],
                &omega,
                g.slice_mut(s![start..end, ..]),
                &mut h,
                config,
                &label,
            )?;
            omega = orthonormalize(&h)?;
            start = end;
            block_idx += 1;
        }
    }

    // Final unshuffled full pass with the converged probe; its G/H feed the
    // finisher so the row order of U matches the input marker order.
    let natural: Vec<usize> = (0..m).collect();
    h.fill(0.0);
    subspace_pass(source, &natural, &omega, g.view_mut(), &mut h, config, "Final pass")?;

    let result = factorize(&g, &h, config.k)?;
    timer.finish();
    Ok(result)
}
