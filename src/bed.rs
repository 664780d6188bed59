use anyhow::{bail, Context, Result};
use memmap2::Mmap;
use ndarray::{ArrayViewMut1, ArrayViewMut2};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// PLINK .bed magic bytes: 0x6C, 0x1B, 0x01 (SNP-major mode)
const BED_MAGIC: [u8; 3] = [0x6C, 0x1B, 0x01];

#[derive(Debug, Clone)]
pub struct BimRecord {
    pub chrom: String,
    pub snp_id: String,
    pub cm: f64,
    pub pos: u64,
    pub allele1: String,
    pub allele2: String,
}

#[derive(Debug, Clone)]
pub struct FamRecord {
    pub fid: String,
    pub iid: String,
    pub father: String,
    pub mother: String,
    pub sex: u8,
    pub pheno: String,
}

/// Per-marker statistics derived from the full sample row.
#[derive(Debug, Clone, Copy)]
pub struct MarkerStats {
    /// Allele frequency f = mean non-missing dosage / 2, strictly inside (0, 1).
    pub freq: f64,
    /// Standardization factor 1 / sqrt(f (1 - f)).
    pub scale: f64,
}

/// On-disk PLINK .bed/.bim/.fam triplet, marker-major.
#[derive(Debug)]
pub struct BedFile {
    pub bed_path: PathBuf,
    pub n_samples: usize,
    pub n_markers: usize,
    pub bim_records: Vec<BimRecord>,
    pub fam_records: Vec<FamRecord>,
    pub(crate) mmap: Mmap,
}

impl BedFile {
    /// Open a PLINK .bed file and parse companion .bim/.fam files.
    ///
    /// Marker and sample counts come from the companion files and are
    /// validated against the .bed byte length.
    pub fn open(bed_path: impl AsRef<Path>) -> Result<Self> {
        let bed_path = bed_path.as_ref().to_path_buf();

        let stem = bed_path.with_extension("");
        let bim_path = stem.with_extension("bim");
        let fam_path = stem.with_extension("fam");

        let fam_records = parse_fam(&fam_path)
            .with_context(|| format!("Failed to parse {}", fam_path.display()))?;
        let bim_records = parse_bim(&bim_path)
            .with_context(|| format!("Failed to parse {}", bim_path.display()))?;

        let n_samples = fam_records.len();
        let n_markers = bim_records.len();

        let file = File::open(&bed_path)
            .with_context(|| format!("Failed to open {}", bed_path.display()))?;
        let mmap = unsafe { Mmap::map(&file)? };

        // Hint to the OS that we'll read sequentially (improves readahead)
        #[cfg(unix)]
        mmap.advise(memmap2::Advice::Sequential)
            .with_context(|| format!("madvise(SEQUENTIAL) failed for {}", bed_path.display()))?;

        if mmap.len() < 3 || mmap[0..3] != BED_MAGIC {
            bail!(
                "Invalid .bed file (bad magic bytes): {}",
                bed_path.display()
            );
        }

        let bytes_per_marker = n_samples.div_ceil(4);
        let expected_size = 3 + bytes_per_marker * n_markers;
        if mmap.len() != expected_size {
            bail!(
                "BED file size mismatch: expected {} bytes ({} samples × {} markers), got {}",
                expected_size,
                n_samples,
                n_markers,
                mmap.len()
            );
        }

        Ok(BedFile {
            bed_path,
            n_samples,
            n_markers,
            bim_records,
            fam_records,
            mmap,
        })
    }

    /// Raw mmap bytes after the 3-byte magic header.
    pub fn mmap_data(&self) -> &[u8] {
        &self.mmap[3..]
    }

    /// Bytes per marker row in the .bed file (ceil(n_samples / 4)).
    pub fn bytes_per_marker(&self) -> usize {
        self.n_samples.div_ceil(4)
    }
}

/// Decode one packed marker row into standardized dosages.
///
/// The allele frequency is estimated from all `n_samples` genotypes of the
/// row (never from a sub-batch), then every 2-bit code is expanded through a
/// 4-entry lookup table of standardized values `(dosage - 2f) / sqrt(f(1-f))`.
/// Missing genotypes (code 0b01) are imputed to the mean dosage `2f`, which
/// standardizes to exactly 0.
///
/// Fails if the marker is fixed (`f <= 0` or `f >= 1`) or has no called
/// genotypes — proceeding would divide by zero. Callers are expected to have
/// MAF-filtered their data.
pub fn decode_marker_row(
    row_bytes: &[u8],
    n_samples: usize,
    marker_index: usize,
    mut out: ArrayViewMut1<f64>,
) -> Result<MarkerStats> {
    let mut dosage_sum = 0u64;
    let mut n_called = 0u64;
    for sample in 0..n_samples {
        let code = (row_bytes[sample / 4] >> (2 * (sample % 4))) & 0x03;
        match code {
            0b00 => n_called += 1,
            0b01 => {} // missing
            0b10 => {
                dosage_sum += 1;
                n_called += 1;
            }
            _ => {
                dosage_sum += 2;
                n_called += 1;
            }
        }
    }

    if n_called == 0 {
        bail!("marker {} has no called genotypes", marker_index);
    }
    let freq = dosage_sum as f64 / (2.0 * n_called as f64);
    if freq <= 0.0 || freq >= 1.0 {
        bail!(
            "marker {} is fixed (allele frequency {}); apply MAF filtering before running",
            marker_index,
            freq
        );
    }
    let scale = 1.0 / (freq * (1.0 - freq)).sqrt();

    // 2-bit code -> standardized value. Codes: 0b00 = 0 copies, 0b01 = missing,
    // 0b10 = 1 copy, 0b11 = 2 copies.
    let table = [
        (0.0 - 2.0 * freq) * scale,
        0.0,
        (1.0 - 2.0 * freq) * scale,
        (2.0 - 2.0 * freq) * scale,
    ];
    for sample in 0..n_samples {
        let code = (row_bytes[sample / 4] >> (2 * (sample % 4))) & 0x03;
        out[sample] = table[code as usize];
    }

    Ok(MarkerStats { freq, scale })
}

/// Decode a set of marker rows from packed .bed bytes into a pre-allocated
/// dense matrix (`markers.len()` × `n_samples`), one output row per entry of
/// `markers` in order.
///
/// `data` is the mmap region after the 3-byte header; `bytes_per_marker` is
/// `ceil(n_samples / 4)`. Holds no shared mutable state, so disjoint marker
/// sets may be decoded concurrently.
pub fn decode_markers_into(
    data: &[u8],
    bytes_per_marker: usize,
    n_samples: usize,
    markers: &[usize],
    mut out: ArrayViewMut2<f64>,
) -> Result<Vec<MarkerStats>> {
    let n_markers = data.len() / bytes_per_marker;
    let mut stats = Vec::with_capacity(markers.len());
    for (row, &marker) in markers.iter().enumerate() {
        if marker >= n_markers {
            bail!(
                "marker index {} out of range (data holds {} markers)",
                marker,
                n_markers
            );
        }
        let row_bytes = &data[marker * bytes_per_marker..(marker + 1) * bytes_per_marker];
        stats.push(decode_marker_row(
            row_bytes,
            n_samples,
            marker,
            out.row_mut(row),
        )?);
    }
    Ok(stats)
}

/// Write a PLINK .bed file from a genotype matrix (n_samples × n_markers,
/// values in {0,1,2}, anything else encoded as missing).
pub fn write_bed_file(path: &Path, genotypes: &ndarray::Array2<u8>) -> Result<()> {
    let n_samples = genotypes.nrows();
    let n_markers = genotypes.ncols();
    let bytes_per_marker = n_samples.div_ceil(4);

    let mut file = File::create(path)?;
    file.write_all(&BED_MAGIC)?;

    let encode = |g: u8| -> u8 {
        match g {
            0 => 0b00,
            1 => 0b10,
            2 => 0b11,
            _ => 0b01, // missing
        }
    };

    let mut buf = vec![0u8; bytes_per_marker];
    for marker in 0..n_markers {
        buf.fill(0);
        for sample in 0..n_samples {
            let code = encode(genotypes[(sample, marker)]);
            buf[sample / 4] |= code << (2 * (sample % 4));
        }
        file.write_all(&buf)?;
    }

    Ok(())
}

/// Write a .bim file
pub fn write_bim(path: &Path, records: &[BimRecord]) -> Result<()> {
    let mut file = File::create(path)?;
    for r in records {
        writeln!(
            file,
            "{}\t{}\t{}\t{}\t{}\t{}",
            r.chrom, r.snp_id, r.cm, r.pos, r.allele1, r.allele2
        )?;
    }
    Ok(())
}

/// Write a .fam file
pub fn write_fam(path: &Path, records: &[FamRecord]) -> Result<()> {
    let mut file = File::create(path)?;
    for r in records {
        writeln!(
            file,
            "{}\t{}\t{}\t{}\t{}\t{}",
            r.fid, r.iid, r.father, r.mother, r.sex, r.pheno
        )?;
    }
    Ok(())
}

fn parse_fam(path: &Path) -> Result<Vec<FamRecord>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();

    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            bail!("FAM line {} has {} fields, expected 6", i + 1, fields.len());
        }
        records.push(FamRecord {
            fid: fields[0].to_string(),
            iid: fields[1].to_string(),
            father: fields[2].to_string(),
            mother: fields[3].to_string(),
            sex: fields[4]
                .parse()
                .with_context(|| format!("FAM line {}: invalid sex '{}'", i + 1, fields[4]))?,
            pheno: fields[5].to_string(),
        });
    }
    Ok(records)
}

fn parse_bim(path: &Path) -> Result<Vec<BimRecord>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();

    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            bail!("BIM line {} has {} fields, expected 6", i + 1, fields.len());
        }
        records.push(BimRecord {
            chrom: fields[0].to_string(),
            snp_id: fields[1].to_string(),
            cm: fields[2]
                .parse()
                .with_context(|| format!("BIM line {}: invalid cM '{}'", i + 1, fields[2]))?,
            pos: fields[3]
                .parse()
                .with_context(|| format!("BIM line {}: invalid position '{}'", i + 1, fields[3]))?,
            allele1: fields[4].to_string(),
            allele2: fields[5].to_string(),
        });
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_roundtrip_encode_decode() {
        let n = 7; // odd number to test padding
        let m = 3;

        let genotypes = Array2::from_shape_vec(
            (n, m),
            vec![
                0, 1, 2, // sample 0
                2, 0, 1, // sample 1
                1, 1, 0, // sample 2
                0, 2, 2, // sample 3
                2, 1, 0, // sample 4
                1, 0, 1, // sample 5
                0, 0, 2, // sample 6
            ],
        )
        .unwrap();

        let dir = TempDir::new().unwrap();
        let bed_path = dir.path().join("test.bed");
        write_bed_file(&bed_path, &genotypes).unwrap();

        let data = fs::read(&bed_path).unwrap();
        assert_eq!(data[0..3], BED_MAGIC);

        let packed = &data[3..];
        let bpm = n.div_ceil(4);
        let markers: Vec<usize> = (0..m).collect();
        let mut decoded = Array2::<f64>::zeros((m, n));
        let stats = decode_markers_into(packed, bpm, n, &markers, decoded.view_mut()).unwrap();

        for marker in 0..m {
            let dosages: Vec<f64> = (0..n).map(|i| genotypes[(i, marker)] as f64).collect();
            let mean: f64 = dosages.iter().sum::<f64>() / n as f64;
            let f = mean / 2.0;
            let scale = 1.0 / (f * (1.0 - f)).sqrt();
            assert!((stats[marker].freq - f).abs() < 1e-12);
            for sample in 0..n {
                let expected = (dosages[sample] - 2.0 * f) * scale;
                assert!(
                    (decoded[(marker, sample)] - expected).abs() < 1e-10,
                    "Mismatch at ({}, {}): got {}, expected {}",
                    marker,
                    sample,
                    decoded[(marker, sample)],
                    expected
                );
            }
        }
    }

    #[test]
    fn test_missing_imputed_to_mean() {
        // sample0=0 (0b00), sample1=missing (0b01), sample2=1 (0b10), sample3=2 (0b11)
        let packed = vec![0b11_10_01_00u8];
        let n = 4;

        let mut decoded = Array2::<f64>::zeros((1, n));
        let stats = decode_markers_into(&packed, 1, n, &[0], decoded.view_mut()).unwrap();

        // Mean of non-missing = (0 + 1 + 2) / 3 = 1.0, f = 0.5, scale = 1/sqrt(0.25) = 2
        assert!((stats[0].freq - 0.5).abs() < 1e-12);
        assert!((decoded[(0, 0)] - (-2.0)).abs() < 1e-10);
        assert!((decoded[(0, 1)] - 0.0).abs() < 1e-10); // imputed to mean, centered = 0
        assert!((decoded[(0, 2)] - 0.0).abs() < 1e-10);
        assert!((decoded[(0, 3)] - 2.0).abs() < 1e-10);
    }

    #[test]
    fn test_fixed_marker_is_an_error() {
        let n = 4;
        let mut decoded = Array2::<f64>::zeros((1, n));

        // All hom-ref: f = 0
        let packed = vec![0b00_00_00_00u8];
        let err = decode_markers_into(&packed, 1, n, &[0], decoded.view_mut()).unwrap_err();
        assert!(err.to_string().contains("fixed"), "got: {err}");

        // All hom-alt: f = 1
        let packed = vec![0b11_11_11_11u8];
        let err = decode_markers_into(&packed, 1, n, &[0], decoded.view_mut()).unwrap_err();
        assert!(err.to_string().contains("fixed"), "got: {err}");

        // All missing
        let packed = vec![0b01_01_01_01u8];
        let err = decode_markers_into(&packed, 1, n, &[0], decoded.view_mut()).unwrap_err();
        assert!(err.to_string().contains("no called"), "got: {err}");
    }

    #[test]
    fn test_marker_index_out_of_range_is_an_error() {
        // 2 markers of 4 samples each; asking for marker 2 must fail, not panic
        let packed = vec![0b11_10_00_00u8, 0b00_10_10_11u8];
        let mut decoded = Array2::<f64>::zeros((1, 4));
        let err = decode_markers_into(&packed, 1, 4, &[2], decoded.view_mut()).unwrap_err();
        assert!(err.to_string().contains("out of range"), "got: {err}");
    }

    /// Write a well-formed PLINK triplet and return the .bed path.
    fn write_valid_triplet(dir: &Path) -> std::path::PathBuf {
        let genotypes = Array2::from_shape_vec((4, 2), vec![0, 1, 2, 0, 1, 2, 0, 1]).unwrap();
        let bed_path = dir.join("t.bed");
        write_bed_file(&bed_path, &genotypes).unwrap();
        let bim: Vec<BimRecord> = (0..2)
            .map(|j| BimRecord {
                chrom: "1".to_string(),
                snp_id: format!("snp_{}", j),
                cm: 0.0,
                pos: (j + 1) as u64,
                allele1: "A".to_string(),
                allele2: "G".to_string(),
            })
            .collect();
        write_bim(&dir.join("t.bim"), &bim).unwrap();
        let fam: Vec<FamRecord> = (0..4)
            .map(|i| FamRecord {
                fid: format!("F{}", i),
                iid: format!("I{}", i),
                father: "0".to_string(),
                mother: "0".to_string(),
                sex: 0,
                pheno: "-9".to_string(),
            })
            .collect();
        write_fam(&dir.join("t.fam"), &fam).unwrap();
        bed_path
    }

    #[test]
    fn test_open_rejects_bad_magic() {
        let dir = TempDir::new().unwrap();
        let bed_path = write_valid_triplet(dir.path());

        let mut data = fs::read(&bed_path).unwrap();
        data[1] = 0xFF;
        fs::write(&bed_path, &data).unwrap();

        let err = BedFile::open(&bed_path).unwrap_err();
        assert!(err.to_string().contains("magic"), "got: {err}");
    }

    #[test]
    fn test_open_rejects_size_mismatch() {
        let dir = TempDir::new().unwrap();
        let bed_path = write_valid_triplet(dir.path());

        // Truncated: drop the last marker row
        let data = fs::read(&bed_path).unwrap();
        fs::write(&bed_path, &data[..data.len() - 1]).unwrap();
        let err = BedFile::open(&bed_path).unwrap_err();
        assert!(err.to_string().contains("size mismatch"), "got: {err}");

        // Padded: trailing garbage after the last marker row
        let mut padded = data.clone();
        padded.push(0u8);
        fs::write(&bed_path, &padded).unwrap();
        let err = BedFile::open(&bed_path).unwrap_err();
        assert!(err.to_string().contains("size mismatch"), "got: {err}");
    }

    #[test]
    fn test_decode_is_finite() {
        // A polymorphic marker must never produce NaN/Inf
        let packed = vec![0b11_10_01_00u8, 0b00_00_10_10u8];
        let n = 8;
        let mut decoded = Array2::<f64>::zeros((1, n));
        decode_markers_into(&packed, 2, n, &[0], decoded.view_mut()).unwrap();
        assert!(decoded.iter().all(|v| v.is_finite()));
    }
}
