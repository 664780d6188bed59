use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Result};
use ndarray::{s, Array2, ArrayViewMut2};

use crate::source::BatchSource;

/// A pre-allocated buffer holding one decoded batch of marker rows.
pub struct MarkerBlock {
    /// Decoded, standardized genotype data: batch_capacity × n_samples.
    /// Only the first `n_rows` rows contain valid data.
    pub data: Array2<f64>,
    /// Actual number of rows used (last batch of a pass may be smaller).
    pub n_rows: usize,
    /// Sequential batch index (0, 1, 2, ...) assigned by the decoder thread.
    pub seq: usize,
}

/// Allows multiple threads to write to disjoint row ranges of a matrix
/// without locking.
///
/// Safety invariant: each `seq` value maps to a unique, non-overlapping row
/// range. This is guaranteed by construction — seq values are assigned
/// sequentially by a single decoder thread and each maps to
/// `[seq * batch_size .. seq * batch_size + n_rows]`.
pub struct DisjointRowWriter {
    ptr: *mut f64,
    n_rows: usize,
    n_cols: usize,
}

unsafe impl Send for DisjointRowWriter {}
unsafe impl Sync for DisjointRowWriter {}

impl DisjointRowWriter {
    /// Create a writer over a mutable view in standard (row-major) layout.
    ///
    /// The underlying array must remain valid and not be accessed mutably
    /// elsewhere for the lifetime of this writer.
    pub fn new(mut view: ArrayViewMut2<f64>) -> Self {
        assert!(
            view.is_standard_layout(),
            "destination must be row-major (standard layout)"
        );
        DisjointRowWriter {
            ptr: view.as_mut_ptr(),
            n_rows: view.nrows(),
            n_cols: view.ncols(),
        }
    }

    /// Write `src` into rows `[row_start .. row_start + src.nrows()]`.
    ///
    /// # Safety
    /// Caller must ensure no two threads write to overlapping row ranges.
    pub unsafe fn write_rows(&self, row_start: usize, src: &Array2<f64>) {
        let src_rows = src.nrows();
        let src_cols = src.ncols();
        assert!(
            row_start + src_rows <= self.n_rows,
            "write_rows: row_start={} + src_rows={} > n_rows={}",
            row_start,
            src_rows,
            self.n_rows
        );
        assert_eq!(
            src_cols, self.n_cols,
            "write_rows: src_cols={} != n_cols={}",
            src_cols, self.n_cols
        );

        if src.is_standard_layout() {
            // Fast path: bulk copy
            std::ptr::copy_nonoverlapping(
                src.as_ptr(),
                self.ptr.add(row_start * self.n_cols),
                src_rows * src_cols,
            );
        } else {
            // Slow path: row-by-row
            for r in 0..src_rows {
                for c in 0..src_cols {
                    let dst = self.ptr.add((row_start + r) * self.n_cols + c);
                    *dst = src[(r, c)];
                }
            }
        }
    }
}

/// Stream marker batches through a fixed pool of `n_workers + 1`
/// pre-allocated `MarkerBlock` buffers, with 1 decoder thread and
/// `n_workers` worker threads connected via crossbeam bounded channels.
///
/// Uses `std::thread::scope` so that `process_fn` can borrow from the
/// caller's stack without requiring `'static` bounds.
///
/// The decoder thread loads batches into free buffers through the
/// `BatchSource` and sends them to workers. Workers call `process_fn` on
/// each filled block, then return the block to the free pool. A decode
/// failure stops the pass and is returned to the caller; the pass also
/// fails if the processed rows do not cover `markers` exactly.
pub fn parallel_stream<S, F>(
    source: &S,
    markers: &[usize],
    batch_size: usize,
    n_workers: usize,
    process_fn: F,
) -> Result<()>
where
    S: BatchSource + ?Sized,
    F: Fn(&MarkerBlock) + Send + Sync,
{
    let n_workers = n_workers.max(1);
    let n_samples = source.n_samples();
    let pool_size = n_workers + 1;

    let (free_tx, free_rx) = crossbeam_channel::bounded::<MarkerBlock>(pool_size);
    let (filled_tx, filled_rx) = crossbeam_channel::bounded::<MarkerBlock>(pool_size);

    // Seed the free pool with pre-allocated blocks
    for _ in 0..pool_size {
        free_tx
            .send(MarkerBlock {
                data: Array2::<f64>::zeros((batch_size, n_samples)),
                n_rows: 0,
                seq: 0,
            })
            .unwrap();
    }

    let decode_error: Mutex<Option<anyhow::Error>> = Mutex::new(None);
    let rows_seen = AtomicUsize::new(0);

    std::thread::scope(|s| {
        // Decoder thread: fills blocks from the source, sends them to workers
        s.spawn(|| {
            for (seq, chunk) in markers.chunks(batch_size).enumerate() {
                let mut block = free_rx.recv().unwrap();
                let n_rows = chunk.len();

                let out = block.data.slice_mut(s![..n_rows, ..]);
                if let Err(e) = source.load_batch(chunk, out) {
                    *decode_error.lock().unwrap() = Some(e);
                    break;
                }

                block.n_rows = n_rows;
                block.seq = seq;
                filled_tx.send(block).unwrap();
            }
            // Drop sender to signal workers that no more blocks are coming
            drop(filled_tx);
        });

        // Worker threads: receive filled blocks, process, return to free pool
        for _ in 0..n_workers {
            let filled_rx = filled_rx.clone();
            let free_tx = free_tx.clone();
            let process_fn = &process_fn;
            let rows_seen = &rows_seen;
            s.spawn(move || {
                while let Ok(block) = filled_rx.recv() {
                    process_fn(&block);
                    rows_seen.fetch_add(block.n_rows, Ordering::Relaxed);
                    // Return block to free pool (ignore error if decoder is done)
                    let _ = free_tx.send(block);
                }
            });
        }
    });

    if let Some(e) = decode_error.into_inner().unwrap() {
        return Err(e);
    }
    let seen = rows_seen.into_inner();
    if seen != markers.len() {
        bail!(
            "pass covered {} of {} marker rows — batch accounting is broken",
            seen,
            markers.len()
        );
    }
    Ok(())
}

/// Serial counterpart of `parallel_stream`: one reusable decode buffer,
/// batches processed in order on the calling thread.
pub fn serial_stream<S, F>(
    source: &S,
    markers: &[usize],
    batch_size: usize,
    mut process_fn: F,
) -> Result<()>
where
    S: BatchSource + ?Sized,
    F: FnMut(&MarkerBlock) -> Result<()>,
{
    let n_samples = source.n_samples();
    let mut block = MarkerBlock {
        data: Array2::<f64>::zeros((batch_size, n_samples)),
        n_rows: 0,
        seq: 0,
    };
    let mut rows_seen = 0usize;
    for (seq, chunk) in markers.chunks(batch_size).enumerate() {
        let n_rows = chunk.len();
        source.load_batch(chunk, block.data.slice_mut(s![..n_rows, ..]))?;
        block.n_rows = n_rows;
        block.seq = seq;
        process_fn(&block)?;
        rows_seen += n_rows;
    }
    if rows_seen != markers.len() {
        bail!(
            "pass covered {} of {} marker rows — batch accounting is broken",
            rows_seen,
            markers.len()
        );
    }
    Ok(())
}
