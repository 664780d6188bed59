use anyhow::Result;
use ndarray::{Array1, Array2};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Binomial, Normal, Uniform};
use std::path::Path;

use crate::bed::{write_bed_file, write_bim, write_fam, BimRecord, FamRecord};

pub struct SimConfig {
    pub n_samples: usize,
    pub n_markers: usize,
    /// Number of latent population axes planted in the data.
    pub k: usize,
    /// Strength of the latent shift on the allele-frequency logit scale.
    pub latent_scale: f64,
    pub seed: u64,
}

pub struct SimData {
    /// n_samples × n_markers dosages in {0, 1, 2}.
    pub genotypes: Array2<u8>,
    /// True latent coordinates (n_samples × k).
    pub u_true: Array2<f64>,
    pub allele_freqs: Array1<f64>,
}

/// Simulate genotypes with planted population structure.
///
/// Each sample gets latent coordinates U ~ N(0, 1); each marker draws a base
/// allele frequency and a loading vector, and genotypes are sampled from
/// Binomial(2, p_ij) with the frequency shifted on the logit scale by U·V.
/// The leading singular vectors of the standardized matrix then recover U up
/// to rotation, which is what the engine tests check.
///
/// Markers that come out monomorphic are resampled so every column passes
/// the fixed-marker precondition of the decoder.
pub fn simulate(config: &SimConfig) -> SimData {
    let mut rng = ChaCha8Rng::seed_from_u64(config.seed);
    let n = config.n_samples;
    let p = config.n_markers;
    let k = config.k;

    let normal = Normal::new(0.0, 1.0).unwrap();
    let af_dist = Uniform::new(0.05, 0.5);

    let u_true = Array2::from_shape_fn((n, k), |_| rng.sample(normal));
    let v_scale = config.latent_scale / (k as f64).sqrt();
    let v_true = Array2::from_shape_fn((p, k), |_| rng.sample(normal) * v_scale);

    let mut allele_freqs = Array1::<f64>::zeros(p);
    let mut genotypes = Array2::<u8>::zeros((n, p));

    for j in 0..p {
        loop {
            let base_af = rng.sample(af_dist);
            allele_freqs[j] = base_af;
            let base_logit = logit(base_af);

            let mut dosage_sum = 0u32;
            for i in 0..n {
                let mut uv = 0.0;
                for kk in 0..k {
                    uv += u_true[(i, kk)] * v_true[(j, kk)];
                }
                let p_ij = inv_logit(base_logit + uv).clamp(0.01, 0.99);
                let binom = Binomial::new(2, p_ij).unwrap();
                let g = rng.sample(binom) as u8;
                genotypes[(i, j)] = g;
                dosage_sum += g as u32;
            }

            // Resample if the marker came out fixed
            if dosage_sum > 0 && dosage_sum < 2 * n as u32 {
                break;
            }
        }
    }

    SimData {
        genotypes,
        u_true,
        allele_freqs,
    }
}

/// Write PLINK triplet (.bed, .bim, .fam) for simulated data.
pub fn write_plink(dir: &Path, prefix: &str, sim: &SimData) -> Result<()> {
    let bed_path = dir.join(format!("{}.bed", prefix));
    let bim_path = dir.join(format!("{}.bim", prefix));
    let fam_path = dir.join(format!("{}.fam", prefix));

    let n = sim.genotypes.nrows();
    let p = sim.genotypes.ncols();

    write_bed_file(&bed_path, &sim.genotypes)?;

    let bim_records: Vec<BimRecord> = (0..p)
        .map(|j| BimRecord {
            chrom: "1".to_string(),
            snp_id: format!("snp_{}", j),
            cm: 0.0,
            pos: (j + 1) as u64,
            allele1: "A".to_string(),
            allele2: "G".to_string(),
        })
        .collect();
    write_bim(&bim_path, &bim_records)?;

    let fam_records: Vec<FamRecord> = (0..n)
        .map(|i| FamRecord {
            fid: format!("FAM{}", i),
            iid: format!("IND{}", i),
            father: "0".to_string(),
            mother: "0".to_string(),
            sex: 0,
            pheno: "-9".to_string(),
        })
        .collect();
    write_fam(&fam_path, &fam_records)?;

    Ok(())
}

fn logit(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

fn inv_logit(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}
