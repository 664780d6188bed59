use anyhow::{bail, Context, Result};
use ndarray::{Array2, ArrayViewMut2};

use crate::bed::{decode_markers_into, BedFile};

/// A restartable, row-partitioned view of the genotype matrix.
///
/// The subspace iteration engine only ever talks to this interface: it asks
/// for a set of marker rows and receives them as a dense, standardized
/// `markers.len() × n_samples` block. Implementations must be safe to call
/// from multiple threads for disjoint marker sets and must serve the same
/// data on every pass.
pub trait BatchSource: Sync {
    fn n_markers(&self) -> usize;
    fn n_samples(&self) -> usize;

    /// Fill `out` (shape `markers.len() × n_samples`) with the requested
    /// marker rows, in order.
    fn load_batch(&self, markers: &[usize], out: ArrayViewMut2<f64>) -> Result<()>;
}

impl BatchSource for BedFile {
    fn n_markers(&self) -> usize {
        self.n_markers
    }

    fn n_samples(&self) -> usize {
        self.n_samples
    }

    fn load_batch(&self, markers: &[usize], out: ArrayViewMut2<f64>) -> Result<()> {
        check_batch_shape(markers, self.n_samples, &out)?;
        decode_markers_into(
            self.mmap_data(),
            self.bytes_per_marker(),
            self.n_samples,
            markers,
            out,
        )
        .with_context(|| {
            format!(
                "while decoding a batch of {} markers from {}",
                markers.len(),
                self.bed_path.display()
            )
        })?;
        Ok(())
    }
}

/// Fully resident numeric matrix (markers × samples), already standardized.
///
/// Used when the decoded data fits in memory, and by tests that feed the
/// engine arbitrary dense matrices.
pub struct InMemorySource {
    data: Array2<f64>,
}

impl InMemorySource {
    pub fn new(data: Array2<f64>) -> Self {
        InMemorySource { data }
    }

    /// Decode an entire .bed file up front into a resident matrix.
    pub fn from_bed(bed: &BedFile) -> Result<Self> {
        let markers: Vec<usize> = (0..bed.n_markers).collect();
        let mut data = Array2::<f64>::zeros((bed.n_markers, bed.n_samples));
        bed.load_batch(&markers, data.view_mut())?;
        Ok(InMemorySource { data })
    }
}

impl BatchSource for InMemorySource {
    fn n_markers(&self) -> usize {
        self.data.nrows()
    }

    fn n_samples(&self) -> usize {
        self.data.ncols()
    }

    fn load_batch(&self, markers: &[usize], mut out: ArrayViewMut2<f64>) -> Result<()> {
        check_batch_shape(markers, self.data.ncols(), &out)?;
        for (row, &marker) in markers.iter().enumerate() {
            if marker >= self.data.nrows() {
                bail!(
                    "marker index {} out of range (matrix has {} rows)",
                    marker,
                    self.data.nrows()
                );
            }
            out.row_mut(row).assign(&self.data.row(marker));
        }
        Ok(())
    }
}

fn check_batch_shape(markers: &[usize], n_samples: usize, out: &ArrayViewMut2<f64>) -> Result<()> {
    if out.nrows() != markers.len() || out.ncols() != n_samples {
        bail!(
            "batch buffer shape mismatch: got {}×{}, expected {}×{}",
            out.nrows(),
            out.ncols(),
            markers.len(),
            n_samples
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_in_memory_batches() {
        let data = array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let src = InMemorySource::new(data);
        assert_eq!(src.n_markers(), 3);
        assert_eq!(src.n_samples(), 2);

        let mut out = Array2::<f64>::zeros((2, 2));
        src.load_batch(&[2, 0], out.view_mut()).unwrap();
        assert_eq!(out, array![[5.0, 6.0], [1.0, 2.0]]);
    }

    #[test]
    fn test_shape_mismatch_is_an_error() {
        let src = InMemorySource::new(Array2::<f64>::zeros((3, 2)));
        let mut out = Array2::<f64>::zeros((1, 3));
        assert!(src.load_batch(&[0], out.view_mut()).is_err());
    }
}
