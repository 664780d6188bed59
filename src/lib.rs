//! Out-of-core randomized SVD for large 2-bit-packed genotype matrices.
//!
//! The crate streams PLINK .bed data in marker batches, decodes and
//! standardizes each batch on the fly, and runs randomized subspace
//! iteration (Halko) without ever holding the full matrix in memory. Three
//! iteration schedules are available: plain fixed-power Halko, a
//! dynamically-shifted variant that deflates converged directions, and the
//! block-epoch schedule that refreshes the probe many times per data pass.

pub mod bed;
pub mod engine;
pub mod factorize;
pub mod parallel;
pub mod progress;
pub mod simulate;
pub mod source;
pub mod timer;

pub use bed::BedFile;
pub use engine::randomized_svd;
pub use factorize::SvdResult;
pub use source::{BatchSource, InMemorySource};

/// Iteration schedule for the subspace engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Schedule {
    /// Plain Halko: `power` full passes with a QR refresh between each.
    Fixed { power: usize },
    /// Shifted Halko: like `Fixed`, but deflates the cross-product by a
    /// monotonically growing spectral shift before each refresh.
    DynamicShift { power: usize },
    /// PCAone-style schedule: `epochs` shuffled passes, each split into
    /// blocks with a probe refresh after every block; the block count starts
    /// at `blocks` and halves each epoch. A final unshuffled pass feeds the
    /// factorization.
    BlockEpoch { epochs: usize, blocks: usize },
}

impl Default for Schedule {
    fn default() -> Self {
        Schedule::Fixed { power: 11 }
    }
}

/// Configuration for a randomized SVD run.
#[derive(Debug, Clone)]
pub struct HalkoConfig {
    /// Number of singular triplets to return.
    pub k: usize,
    /// Extra probe columns beyond `k`; the working dimension is
    /// `k + oversampling`.
    pub oversampling: usize,
    /// Marker rows decoded per batch.
    pub batch_size: usize,
    /// Seed for the Gaussian probe and epoch shuffles.
    pub seed: u64,
    /// Worker threads for batch processing; 0 runs everything on the
    /// calling thread.
    pub n_workers: usize,
    /// Show progress bars on stderr.
    pub progress: bool,
    /// Iteration schedule.
    pub schedule: Schedule,
}

impl Default for HalkoConfig {
    fn default() -> Self {
        HalkoConfig {
            k: 10,
            oversampling: 16,
            batch_size: 10_000,
            seed: 42,
            n_workers: 0,
            progress: false,
            schedule: Schedule::default(),
        }
    }
}
