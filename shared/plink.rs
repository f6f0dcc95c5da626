use crate::genotype::PackedGenotypes;
use memmap2::Mmap;
use ndarray::Array1;
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const PLINK_HEADER_LEN: usize = 3;
pub const PLINK_MAGIC: [u8; PLINK_HEADER_LEN] = [0x6c, 0x1b, 0x01];

#[derive(Debug, Error)]
pub enum PlinkIoError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid PLINK .bed header: {0}")]
    InvalidHeader(String),
    #[error("unexpected .bed payload size (expected {expected} bytes, found {actual})")]
    TruncatedBed { expected: u64, actual: u64 },
    #[error("malformed record in {path} at line {line}: {message}")]
    MalformedRecord {
        path: String,
        line: usize,
        message: String,
    },
}

fn io_error(path: &Path, source: io::Error) -> PlinkIoError {
    PlinkIoError::Io {
        path: path.display().to_string(),
        source,
    }
}

#[derive(Clone, Debug)]
pub struct SampleRecord {
    pub family_id: String,
    pub individual_id: String,
    pub paternal_id: String,
    pub maternal_id: String,
    pub sex: String,
    pub phenotype: String,
}

/// A validated `.bed/.bim/.fam` triple whose genotype payload is memory mapped.
#[derive(Debug)]
pub struct PlinkFileset {
    bed: Mmap,
    bed_path: PathBuf,
    bim_path: PathBuf,
    fam_path: PathBuf,
    samples: Vec<SampleRecord>,
    n_variants: usize,
}

impl PlinkFileset {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PlinkIoError> {
        let bed_path = normalize_path(path.as_ref(), "bed");
        let bim_path = bed_path.with_extension("bim");
        let fam_path = bed_path.with_extension("fam");

        let file = File::open(&bed_path).map_err(|e| io_error(&bed_path, e))?;
        // SAFETY: genotype inputs are treated as read-only for the whole run.
        let bed = unsafe { Mmap::map(&file) }.map_err(|e| io_error(&bed_path, e))?;
        validate_bed_header(&bed)?;

        let samples = read_fam_records(&fam_path)?;
        if samples.is_empty() {
            return Err(PlinkIoError::MalformedRecord {
                path: fam_path.display().to_string(),
                line: 0,
                message: "no samples found in .fam".to_string(),
            });
        }

        let n_variants = count_bim_records(&bim_path)?;
        if n_variants == 0 {
            return Err(PlinkIoError::MalformedRecord {
                path: bim_path.display().to_string(),
                line: 0,
                message: "no variants found in .bim".to_string(),
            });
        }

        check_payload(bed.len(), samples.len(), n_variants)?;

        Ok(Self {
            bed,
            bed_path,
            bim_path,
            fam_path,
            samples,
            n_variants,
        })
    }

    pub fn samples(&self) -> &[SampleRecord] {
        &self.samples
    }

    pub fn n_samples(&self) -> usize {
        self.samples.len()
    }

    pub fn n_variants(&self) -> usize {
        self.n_variants
    }

    pub fn bed_path(&self) -> &Path {
        &self.bed_path
    }

    pub fn bim_path(&self) -> &Path {
        &self.bim_path
    }

    pub fn fam_path(&self) -> &Path {
        &self.fam_path
    }

    /// Parses the `.fam` phenotype column. Missing codes (`-9`, `NA`) are rejected.
    pub fn phenotypes(&self) -> Result<Array1<f64>, PlinkIoError> {
        let mut values = Vec::with_capacity(self.samples.len());
        for (line, record) in self.samples.iter().enumerate() {
            let parsed = match record.phenotype.as_str() {
                "-9" | "NA" | "na" => None,
                text => text.parse::<f64>().ok().filter(|v| v.is_finite()),
            };
            let Some(value) = parsed else {
                return Err(PlinkIoError::MalformedRecord {
                    path: self.fam_path.display().to_string(),
                    line: line + 1,
                    message: format!(
                        "sample '{}' has a missing or non-numeric phenotype '{}'",
                        record.individual_id, record.phenotype
                    ),
                });
            };
            values.push(value);
        }
        Ok(Array1::from(values))
    }

    /// Hands the mapped payload to a packed genotype matrix with computed allele statistics.
    pub fn into_genotypes(self) -> PackedGenotypes<Mmap> {
        let n_samples = self.samples.len();
        PackedGenotypes::from_bed(self.bed, n_samples, self.n_variants)
    }
}

pub fn bytes_per_variant(n_samples: usize) -> usize {
    n_samples.div_ceil(4).max(1)
}

pub(crate) fn check_payload(
    bed_len: usize,
    n_samples: usize,
    n_variants: usize,
) -> Result<(), PlinkIoError> {
    let expected = (bytes_per_variant(n_samples) as u64)
        .checked_mul(n_variants as u64)
        .ok_or(PlinkIoError::TruncatedBed {
            expected: u64::MAX,
            actual: bed_len as u64,
        })?;
    let actual = bed_len.saturating_sub(PLINK_HEADER_LEN) as u64;
    if actual != expected {
        return Err(PlinkIoError::TruncatedBed { expected, actual });
    }
    Ok(())
}

fn normalize_path(path: &Path, extension: &str) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == extension) {
        path.to_owned()
    } else {
        path.with_extension(extension)
    }
}

pub(crate) fn validate_bed_header(bytes: &[u8]) -> Result<(), PlinkIoError> {
    match bytes.get(..PLINK_HEADER_LEN) {
        Some([0x6c, 0x1b, 0x01]) => Ok(()),
        Some([0x6c, 0x1b, mode]) => Err(PlinkIoError::InvalidHeader(format!(
            "unsupported mode byte {mode:#04x} (only variant-major mode is supported)"
        ))),
        _ => Err(PlinkIoError::InvalidHeader(
            "missing PLINK magic bytes 0x6c 0x1b".to_string(),
        )),
    }
}

fn read_fam_records(path: &Path) -> Result<Vec<SampleRecord>, PlinkIoError> {
    let file = File::open(path).map_err(|e| io_error(path, e))?;
    let mut records = Vec::new();

    for (index, line) in BufReader::new(file).lines().enumerate() {
        let line = line.map_err(|e| io_error(path, e))?;
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(fid), Some(iid), Some(pid), Some(mid), Some(sex), Some(phenotype)) = (
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
            fields.next(),
        ) else {
            return Err(PlinkIoError::MalformedRecord {
                path: path.display().to_string(),
                line: index + 1,
                message: "expected 6 whitespace-delimited fields".to_string(),
            });
        };

        records.push(SampleRecord {
            family_id: fid.to_string(),
            individual_id: iid.to_string(),
            paternal_id: pid.to_string(),
            maternal_id: mid.to_string(),
            sex: sex.to_string(),
            phenotype: phenotype.to_string(),
        });
    }

    Ok(records)
}

fn count_bim_records(path: &Path) -> Result<usize, PlinkIoError> {
    let file = File::open(path).map_err(|e| io_error(path, e))?;
    let mut count = 0usize;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| io_error(path, e))?;
        if !line.trim().is_empty() {
            count += 1;
        }
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::DesignMatrix;
    use std::fs;

    fn write_fileset(dir: &Path, phenotypes: &[&str]) -> PathBuf {
        let prefix = dir.join("toy");
        let fam: String = phenotypes
            .iter()
            .enumerate()
            .map(|(i, p)| format!("F{i} I{i} 0 0 1 {p}\n"))
            .collect();
        fs::write(prefix.with_extension("fam"), fam).unwrap();
        fs::write(
            prefix.with_extension("bim"),
            "1 rs1 0 100 A G\n1 rs2 0 200 C T\n",
        )
        .unwrap();
        // Three samples per variant: codes (0, 2, 3) and (3, 1, 0).
        let mut bed = PLINK_MAGIC.to_vec();
        bed.push(0b0011_1000);
        bed.push(0b0000_0111);
        fs::write(prefix.with_extension("bed"), bed).unwrap();
        prefix
    }

    #[test]
    fn opens_a_small_fileset() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = write_fileset(dir.path(), &["1.5", "2", "-0.5"]);
        let fileset = PlinkFileset::open(&prefix).unwrap();

        assert_eq!(fileset.n_samples(), 3);
        assert_eq!(fileset.n_variants(), 2);
        assert_eq!(fileset.phenotypes().unwrap().to_vec(), vec![1.5, 2.0, -0.5]);

        let genotypes = fileset.into_genotypes();
        assert_eq!(genotypes.n_rows(), 3);
        assert_eq!(genotypes.n_cols(), 2);
        assert_eq!(genotypes.raw_dosage(1, 0), Some(1.0));
        assert_eq!(genotypes.raw_dosage(0, 1), Some(2.0));
        assert_eq!(genotypes.raw_dosage(1, 1), None);
    }

    #[test]
    fn missing_phenotypes_are_reported_with_line_numbers() {
        let dir = tempfile::tempdir().unwrap();
        let prefix = write_fileset(dir.path(), &["1", "-9", "0"]);
        let fileset = PlinkFileset::open(&prefix).unwrap();
        match fileset.phenotypes() {
            Err(PlinkIoError::MalformedRecord { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected a malformed record, got {other:?}"),
        }
    }

    #[test]
    fn rejects_sample_major_and_truncated_payloads() {
        assert!(matches!(
            validate_bed_header(&[0x6c, 0x1b, 0x00]),
            Err(PlinkIoError::InvalidHeader(_))
        ));
        assert!(matches!(
            check_payload(PLINK_HEADER_LEN + 3, 5, 2),
            Err(PlinkIoError::TruncatedBed {
                expected: 4,
                actual: 3
            })
        ));
    }
}
