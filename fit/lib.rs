#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]

pub mod config;
mod debias;
pub mod engine;
pub mod family;
pub mod linalg;
pub mod project;
pub mod state;

#[path = "../shared/matrix.rs"]
pub mod matrix;
#[path = "../shared/genotype.rs"]
pub mod genotype;
#[path = "../shared/plink.rs"]
pub mod plink;

#[path = "../cv/mod.rs"]
pub mod cv;

pub use config::{DebiasMode, IhtConfig, RunConfig};
pub use engine::{FitInputs, FitStatus, Iht, IhtError, IhtResult, fit};
pub use family::{Family, Glm, Link};
pub use matrix::{DenseDesign, DesignMatrix, MappedDense, RowSubset};
pub use project::GroupSpec;
