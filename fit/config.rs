use crate::cv::CvConfig;
use crate::engine::IhtError;
use crate::family::{Family, Link};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{BufWriter, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read or write configuration file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML configuration: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize configuration to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
}

/// Whether, and how, coefficients are refitted on their support after each projection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebiasMode {
    #[default]
    Off,
    /// One refit over every active column.
    Joint,
    /// Covariates first, then each active group with the rest of the model as an offset.
    PerGroup,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IhtConfig {
    pub family: Family,
    /// Canonical link of `family` when absent.
    pub link: Option<Link>,
    pub tol: f64,
    pub max_iter: usize,
    pub max_backtrack: usize,
    pub min_iter: usize,
    pub debias: DebiasMode,
}

impl Default for IhtConfig {
    fn default() -> Self {
        Self {
            family: Family::Normal,
            link: None,
            tol: 1e-4,
            max_iter: 200,
            max_backtrack: 5,
            min_iter: 1,
            debias: DebiasMode::Off,
        }
    }
}

impl IhtConfig {
    pub fn validate(&self) -> Result<(), IhtError> {
        if !(self.tol.is_finite() && self.tol > 0.0) {
            return Err(IhtError::invalid("tol", format!("must be positive, got {}", self.tol)));
        }
        if self.max_iter == 0 {
            return Err(IhtError::invalid("max_iter", "must be at least 1".to_string()));
        }
        if self.min_iter > self.max_iter {
            return Err(IhtError::invalid(
                "min_iter",
                format!("{} exceeds max_iter {}", self.min_iter, self.max_iter),
            ));
        }
        if let Family::NegativeBinomial { r } = self.family {
            if !(r.is_finite() && r > 0.0) {
                return Err(IhtError::invalid(
                    "family",
                    format!("negative binomial dispersion must be positive, got {r}"),
                ));
            }
        }
        Ok(())
    }
}

/// Everything a run reads from `--config`; command line flags override individual fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub fit: IhtConfig,
    pub cv: CvConfig,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(text.as_bytes())?;
        Ok(())
    }
}
