// ========================================================================================
//
//                    Packed genotypes with implicit standardization
//
// ========================================================================================
//
// Genotypes stay in the PLINK 2-bit variant-major encoding (four samples per byte)
// for the whole run. Every product against the matrix decodes on the fly through a
// per-variant lookup table that already folds in Hardy-Weinberg centering and scaling,
// so the engine sees the standardized matrix `(g - 2f) / sqrt(2f(1-f))` without it ever
// being materialized. Missing calls are imputed to the column mean and contribute zero.

use crate::matrix::{
    DesignMatrix, MatrixError, RowSubset, check_rows, inner_parallelism_allowed,
};
use crate::plink::{
    PLINK_HEADER_LEN, PLINK_MAGIC, bytes_per_variant, check_payload, validate_bed_header,
};
use memmap2::Mmap;
use ndarray::{Array1, ArrayView1, ArrayView2, ArrayViewMut1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;

pub const HWE_SCALE_FLOOR: f64 = 1.0e-6;

const CODE_MISSING: u8 = 0b01;

/// Decoded dosage for each 2-bit PLINK code (`None` for a missing call).
const CODE_DOSAGE: [Option<f64>; 4] = [Some(0.0), None, Some(1.0), Some(2.0)];

/// Allele frequencies and Hardy-Weinberg scales, one entry per variant.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlleleStatistics {
    frequencies: Vec<f64>,
    scales: Vec<f64>,
}

impl AlleleStatistics {
    pub fn allele_frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    pub fn variant_scales(&self) -> &[f64] {
        &self.scales
    }

    fn lookup_tables(&self) -> Vec<[f64; 4]> {
        self.frequencies
            .iter()
            .zip(&self.scales)
            .map(|(&freq, &scale)| {
                let mean = 2.0 * freq;
                let inv = if scale >= HWE_SCALE_FLOOR {
                    scale.recip()
                } else {
                    0.0
                };
                [
                    (0.0 - mean) * inv,
                    0.0,
                    (1.0 - mean) * inv,
                    (2.0 - mean) * inv,
                ]
            })
            .collect()
    }
}

#[derive(Debug)]
pub struct PackedGenotypes<S> {
    bytes: S,
    n_samples: usize,
    n_variants: usize,
    bytes_per_variant: usize,
    stats: Arc<AlleleStatistics>,
    lookup: Vec<[f64; 4]>,
}

impl PackedGenotypes<Vec<u8>> {
    /// Encodes a dense `samples x variants` dosage matrix (0, 1, 2 or NaN for missing).
    pub fn from_dosages(dosages: ArrayView2<'_, f64>) -> Result<Self, MatrixError> {
        let (n_samples, n_variants) = dosages.dim();
        if n_samples == 0 || n_variants == 0 {
            return Err(MatrixError::InvalidDimensions(format!(
                "genotype matrix must be non-empty, got {n_samples}x{n_variants}"
            )));
        }
        let stride = bytes_per_variant(n_samples);
        let mut bytes = PLINK_MAGIC.to_vec();
        bytes.resize(PLINK_HEADER_LEN + stride * n_variants, 0);

        for (j, column) in dosages.columns().into_iter().enumerate() {
            let start = PLINK_HEADER_LEN + j * stride;
            let packed = &mut bytes[start..start + stride];
            for (i, &dosage) in column.iter().enumerate() {
                let code = match dosage {
                    d if d.is_nan() => CODE_MISSING,
                    d if d == 0.0 => 0b00,
                    d if d == 1.0 => 0b10,
                    d if d == 2.0 => 0b11,
                    other => {
                        return Err(MatrixError::InvalidDimensions(format!(
                            "dosage {other} at sample {i}, variant {j} is not 0, 1, 2 or missing"
                        )));
                    }
                };
                packed[i / 4] |= code << (2 * (i % 4));
            }
        }

        Ok(Self::from_bed(bytes, n_samples, n_variants))
    }
}

impl<S: AsRef<[u8]> + Sync> PackedGenotypes<S> {
    /// Wraps a complete `.bed` image (magic bytes included) and computes allele statistics.
    pub fn from_bed(bytes: S, n_samples: usize, n_variants: usize) -> Self {
        let bytes_per_variant = bytes_per_variant(n_samples);
        let payload = &bytes.as_ref()[PLINK_HEADER_LEN..];
        let summarize = |j: usize| -> (f64, f64) {
            let packed = &payload[j * bytes_per_variant..(j + 1) * bytes_per_variant];
            let (mut sum, mut calls) = (0.0, 0usize);
            for i in 0..n_samples {
                if let Some(dosage) = CODE_DOSAGE[code_in(packed, i) as usize] {
                    sum += dosage;
                    calls += 1;
                }
            }
            if calls == 0 {
                return (0.0, 0.0);
            }
            let freq = sum / (2.0 * calls as f64);
            (freq, (2.0 * freq * (1.0 - freq)).sqrt())
        };

        let summaries: Vec<(f64, f64)> = if inner_parallelism_allowed(n_variants) {
            (0..n_variants).into_par_iter().map(summarize).collect()
        } else {
            (0..n_variants).map(summarize).collect()
        };
        let (frequencies, scales) = summaries.into_iter().unzip();
        let stats = Arc::new(AlleleStatistics {
            frequencies,
            scales,
        });
        Self::with_statistics(bytes, n_samples, n_variants, stats)
    }

    fn with_statistics(
        bytes: S,
        n_samples: usize,
        n_variants: usize,
        stats: Arc<AlleleStatistics>,
    ) -> Self {
        let lookup = stats.lookup_tables();
        Self {
            bytes,
            n_samples,
            n_variants,
            bytes_per_variant: bytes_per_variant(n_samples),
            stats,
            lookup,
        }
    }

    pub fn statistics(&self) -> &AlleleStatistics {
        &self.stats
    }

    /// Unstandardized dosage of one call, `None` when missing.
    pub fn raw_dosage(&self, sample: usize, variant: usize) -> Option<f64> {
        CODE_DOSAGE[code_in(self.variant_bytes(variant), sample) as usize]
    }

    /// Prior weights that favour rare variants: `1 / (2 sqrt(maf (1 - maf)))`, clamped to
    /// `[1, max_weight]`. Monomorphic variants get weight one since they never enter a fit.
    pub fn maf_weights(&self, max_weight: f64) -> Array1<f64> {
        self.stats
            .frequencies
            .iter()
            .map(|&freq| {
                let maf = freq.min(1.0 - freq);
                if maf <= 0.0 {
                    1.0
                } else {
                    (0.5 / (maf * (1.0 - maf)).sqrt()).clamp(1.0, max_weight.max(1.0))
                }
            })
            .collect()
    }

    #[inline]
    fn variant_bytes(&self, variant: usize) -> &[u8] {
        let start = PLINK_HEADER_LEN + variant * self.bytes_per_variant;
        &self.bytes.as_ref()[start..start + self.bytes_per_variant]
    }

    #[inline]
    fn for_each_standardized(&self, variant: usize, mut visit: impl FnMut(usize, f64)) {
        let table = &self.lookup[variant];
        for (byte_idx, &byte) in self.variant_bytes(variant).iter().enumerate() {
            let base = byte_idx * 4;
            let take = self.n_samples.saturating_sub(base).min(4);
            for offset in 0..take {
                let code = (byte >> (2 * offset)) & 0b11;
                visit(base + offset, table[code as usize]);
            }
        }
    }
}

#[inline]
fn code_in(packed: &[u8], sample: usize) -> u8 {
    (packed[sample / 4] >> (2 * (sample % 4))) & 0b11
}

impl<S: AsRef<[u8]> + Sync> DesignMatrix for PackedGenotypes<S> {
    fn n_rows(&self) -> usize {
        self.n_samples
    }

    fn n_cols(&self) -> usize {
        self.n_variants
    }

    fn column_into(&self, j: usize, mut out: ArrayViewMut1<'_, f64>) {
        self.for_each_standardized(j, |i, value| out[i] = value);
    }

    fn column_dot(&self, j: usize, v: ArrayView1<'_, f64>) -> f64 {
        let mut acc = 0.0;
        self.for_each_standardized(j, |i, value| acc += value * v[i]);
        acc
    }

    fn matvec(&self, v: ArrayView1<'_, f64>, mut out: ArrayViewMut1<'_, f64>) {
        out.fill(0.0);
        for (j, &coef) in v.iter().enumerate() {
            if coef != 0.0 {
                self.for_each_standardized(j, |i, value| out[i] += coef * value);
            }
        }
    }
}

impl<S: AsRef<[u8]> + Sync> RowSubset for PackedGenotypes<S> {
    type Persisted = PackedGenotypes<Mmap>;

    fn persist_rows(&self, rows: &[usize], path: &Path) -> Result<(), MatrixError> {
        check_rows(rows, self.n_samples)?;
        let file = File::create(path).map_err(|e| MatrixError::io(path, e))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(&PLINK_MAGIC)
            .map_err(|e| MatrixError::io(path, e))?;

        let mut packed = vec![0u8; bytes_per_variant(rows.len())];
        for variant in 0..self.n_variants {
            packed.fill(0);
            let source = self.variant_bytes(variant);
            for (t, &row) in rows.iter().enumerate() {
                packed[t / 4] |= code_in(source, row) << (2 * (t % 4));
            }
            writer
                .write_all(&packed)
                .map_err(|e| MatrixError::io(path, e))?;
        }
        writer.flush().map_err(|e| MatrixError::io(path, e))
    }

    fn open_persisted(
        &self,
        path: &Path,
        n_rows: usize,
    ) -> Result<PackedGenotypes<Mmap>, MatrixError> {
        let file = File::open(path).map_err(|e| MatrixError::io(path, e))?;
        // SAFETY: persisted fold views are private to the fold store that created them.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| MatrixError::io(path, e))?;
        validate_bed_header(&mmap)?;
        check_payload(mmap.len(), n_rows, self.n_variants)?;
        Ok(PackedGenotypes::with_statistics(
            mmap,
            n_rows,
            self.n_variants,
            Arc::clone(&self.stats),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    fn dosages() -> Array2<f64> {
        array![
            [0.0, 2.0, 1.0, 1.0],
            [1.0, 2.0, f64::NAN, 1.0],
            [2.0, 1.0, 0.0, 1.0],
            [1.0, 0.0, 2.0, 1.0],
            [0.0, 2.0, 1.0, 1.0],
        ]
    }

    fn standardized(raw: &Array2<f64>) -> Array2<f64> {
        let mut out = Array2::zeros(raw.dim());
        for (j, column) in raw.columns().into_iter().enumerate() {
            let observed: Vec<f64> = column.iter().copied().filter(|v| !v.is_nan()).collect();
            let freq = observed.iter().sum::<f64>() / (2.0 * observed.len() as f64);
            let scale = (2.0 * freq * (1.0 - freq)).sqrt();
            for (i, &g) in column.iter().enumerate() {
                out[[i, j]] = if g.is_nan() || scale < HWE_SCALE_FLOOR {
                    0.0
                } else {
                    (g - 2.0 * freq) / scale
                };
            }
        }
        out
    }

    #[test]
    fn products_match_the_explicitly_standardized_matrix() {
        let raw = dosages();
        let packed = PackedGenotypes::from_dosages(raw.view()).unwrap();
        let dense = standardized(&raw);

        let v = array![0.3, -1.0, 0.0, 2.0];
        let mut out = Array1::zeros(5);
        packed.matvec(v.view(), out.view_mut());
        assert_abs_diff_eq!(out, dense.dot(&v), epsilon = 1e-12);

        let r = array![1.0, -0.5, 0.25, 2.0, -1.0];
        let mut grad = Array1::zeros(4);
        packed.matvec_transpose(r.view(), grad.view_mut());
        assert_abs_diff_eq!(grad, dense.t().dot(&r), epsilon = 1e-12);

        // Every sample is heterozygous at the fourth variant, so it centers to zero.
        assert_abs_diff_eq!(grad[3], 0.0);
        assert_eq!(packed.raw_dosage(1, 2), None);
    }

    #[test]
    fn persisted_subsets_keep_parent_standardization() {
        let raw = dosages();
        let packed = PackedGenotypes::from_dosages(raw.view()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.bed");
        let rows = [4, 0, 2];
        packed.persist_rows(&rows, &path).unwrap();
        let subset = packed.open_persisted(&path, rows.len()).unwrap();

        let full = packed.columns(&[0, 1, 2, 3]);
        let restricted = subset.columns(&[0, 1, 2, 3]);
        for (t, &row) in rows.iter().enumerate() {
            assert_abs_diff_eq!(restricted.row(t), full.row(row), epsilon = 1e-12);
        }
        assert_eq!(
            subset.statistics().allele_frequencies(),
            packed.statistics().allele_frequencies()
        );
    }

    #[test]
    fn maf_weights_favour_rare_variants() {
        let raw = dosages();
        let packed = PackedGenotypes::from_dosages(raw.view()).unwrap();
        let weights = packed.maf_weights(f64::INFINITY);
        assert!(weights.iter().all(|&w| w >= 1.0 && w.is_finite()));
        let capped = packed.maf_weights(1.0);
        assert!(capped.iter().all(|&w| w == 1.0));
    }

    #[test]
    fn rejects_non_dosage_values() {
        let err = PackedGenotypes::from_dosages(array![[0.5]].view()).unwrap_err();
        assert!(matches!(err, MatrixError::InvalidDimensions(_)));
    }
}
