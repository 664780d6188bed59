use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::io::{BufWriter, IsTerminal, Write};
use std::path::PathBuf;
use std::time::Instant;

use halko::bed::BedFile;
use halko::{randomized_svd, HalkoConfig, Schedule, SvdResult};

#[derive(Parser)]
#[command(
    name = "halko",
    about = "Out-of-core randomized SVD (PCA) for PLINK .bed genotype data"
)]
struct Cli {
    /// PLINK .bed file (with .bim/.fam)
    #[arg(short = 'b', long)]
    bed: PathBuf,

    /// Number of principal components
    #[arg(short = 'k', long = "pca", default_value = "10")]
    k: usize,

    /// Iteration schedule
    #[arg(long, value_enum, default_value = "fixed")]
    variant: Variant,

    /// Power iterations (fixed and dshift variants)
    #[arg(long, default_value = "11")]
    power: usize,

    /// Epochs over the data (pcaone variant)
    #[arg(long, default_value = "6")]
    epochs: usize,

    /// Initial blocks per epoch, halved each epoch (pcaone variant)
    #[arg(long, default_value = "64")]
    blocks: usize,

    /// Markers decoded per batch
    #[arg(long, default_value = "10000")]
    batch: usize,

    /// Probe columns beyond k
    #[arg(long, default_value = "16")]
    oversampling: usize,

    /// RNG seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Worker threads (0 = serial)
    #[arg(short = 't', long, default_value_t = default_threads())]
    threads: usize,

    /// Output prefix
    #[arg(short = 'o', long, default_value = "halko")]
    out: String,

    /// Also write per-marker loadings (can be large)
    #[arg(long)]
    loadings: bool,

    /// Prefix eigenvector rows with FID/IID from the .fam file
    #[arg(long)]
    ids: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Variant {
    /// Plain Halko with a fixed number of power iterations
    Fixed,
    /// Halko with dynamic spectral shifts
    Dshift,
    /// PCAone block-epoch schedule
    Pcaone,
}

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(1)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let start = Instant::now();

    eprintln!("Loading BED file: {}", cli.bed.display());
    let bed = BedFile::open(&cli.bed)?;
    eprintln!("  {} samples x {} markers", bed.n_samples, bed.n_markers);

    let schedule = match cli.variant {
        Variant::Fixed => Schedule::Fixed { power: cli.power },
        Variant::Dshift => Schedule::DynamicShift { power: cli.power },
        Variant::Pcaone => Schedule::BlockEpoch {
            epochs: cli.epochs,
            blocks: cli.blocks,
        },
    };

    let config = HalkoConfig {
        k: cli.k,
        oversampling: cli.oversampling,
        batch_size: cli.batch,
        seed: cli.seed,
        n_workers: cli.threads,
        progress: std::io::stderr().is_terminal(),
        schedule,
    };

    eprintln!(
        "Running randomized SVD: K={}, variant={:?}, batch={}, threads={}, oversampling={}, seed={}",
        config.k, cli.variant, config.batch_size, config.n_workers, config.oversampling, config.seed,
    );

    let result = randomized_svd(&bed, &config)?;

    let vecs_path = format!("{}.eigenvecs", cli.out);
    let vals_path = format!("{}.eigenvals", cli.out);
    eprintln!("Writing eigenvectors to {}...", vecs_path);
    write_eigenvecs(&vecs_path, &result, if cli.ids { Some(&bed) } else { None })?;
    write_eigenvals(&vals_path, &result, bed.n_markers)?;

    if cli.loadings {
        let load_path = format!("{}.loadings", cli.out);
        eprintln!("Writing loadings to {}...", load_path);
        write_loadings(&load_path, &result)?;
    }

    eprintln!(
        "Done in {:.1}s. Output: {}, {}",
        start.elapsed().as_secs_f64(),
        vecs_path,
        vals_path,
    );

    Ok(())
}

/// One row per sample, one column per component: the right singular vectors.
fn write_eigenvecs(path: &str, result: &SvdResult, ids: Option<&BedFile>) -> Result<()> {
    let f = std::fs::File::create(path).with_context(|| format!("Failed to create {}", path))?;
    let mut w = BufWriter::new(f);
    let k = result.vt.nrows();
    let n = result.vt.ncols();

    for sample in 0..n {
        let mut vals = Vec::with_capacity(k + 2);
        if let Some(bed) = ids {
            let rec = &bed.fam_records[sample];
            vals.push(rec.fid.clone());
            vals.push(rec.iid.clone());
        }
        for comp in 0..k {
            vals.push(format!("{:.7e}", result.vt[(comp, sample)]));
        }
        writeln!(w, "{}", vals.join("\t"))?;
    }
    Ok(())
}

/// Explained variances: squared singular values divided by the marker count.
fn write_eigenvals(path: &str, result: &SvdResult, n_markers: usize) -> Result<()> {
    let f = std::fs::File::create(path).with_context(|| format!("Failed to create {}", path))?;
    let mut w = BufWriter::new(f);
    for &s in result.s.iter() {
        writeln!(w, "{:.7e}", s * s / n_markers as f64)?;
    }
    Ok(())
}

/// One row per marker, one column per component: the left singular vectors.
fn write_loadings(path: &str, result: &SvdResult) -> Result<()> {
    let f = std::fs::File::create(path).with_context(|| format!("Failed to create {}", path))?;
    let mut w = BufWriter::new(f);
    let (m, k) = (result.u.nrows(), result.u.ncols());
    for marker in 0..m {
        let vals: Vec<String> = (0..k)
            .map(|comp| format!("{:.7e}", result.u[(marker, comp)]))
            .collect();
        writeln!(w, "{}", vals.join("\t"))?;
    }
    Ok(())
}
