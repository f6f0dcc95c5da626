//! Distribution and link capability consumed by the IHT engine.
//!
//! The engine never branches on the distribution itself. It asks a [`Glm`] for the mean,
//! the score residuals, the Fisher weights and the deviance of a linear predictor, and the
//! pairing is fixed once when a fit starts.

use ndarray::{ArrayView1, ArrayViewMut1, Zip};
use serde::{Deserialize, Serialize};
use statrs::function::erf::{erfc, erfc_inv};
use std::f64::consts::{PI, SQRT_2};
use std::fmt;

/// Clamp applied to the linear predictor before exponentiating.
const ETA_CLAMP: f64 = 700.0;
/// Means are kept this far from the boundary of their support.
const MU_EPS: f64 = 1e-8;
/// Floor for `|dmu/deta|` so that Fisher weights never collapse to exactly zero.
const MIN_MU_ETA: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Normal,
    Bernoulli,
    Poisson,
    /// Negative binomial with a fixed dispersion `r` (variance `mu + mu^2 / r`).
    NegativeBinomial { r: f64 },
    Gamma,
    InverseGaussian,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Link {
    Identity,
    Logit,
    Probit,
    Log,
    Inverse,
    InverseSquare,
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::Normal => f.write_str("normal"),
            Family::Bernoulli => f.write_str("bernoulli"),
            Family::Poisson => f.write_str("poisson"),
            Family::NegativeBinomial { r } => write!(f, "negative_binomial(r={r})"),
            Family::Gamma => f.write_str("gamma"),
            Family::InverseGaussian => f.write_str("inverse_gaussian"),
        }
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Link::Identity => "identity",
            Link::Logit => "logit",
            Link::Probit => "probit",
            Link::Log => "log",
            Link::Inverse => "inverse",
            Link::InverseSquare => "inverse_square",
        };
        f.write_str(name)
    }
}

#[inline]
fn std_normal_cdf(x: f64) -> f64 {
    0.5 * erfc(-x / SQRT_2)
}

#[inline]
fn std_normal_pdf(x: f64) -> f64 {
    (-0.5 * x * x).exp() / (2.0 * PI).sqrt()
}

#[inline]
fn std_normal_quantile(p: f64) -> f64 {
    -SQRT_2 * erfc_inv(2.0 * p)
}

/// `y * ln(y / mu)` with the `0 * ln(0) = 0` convention.
#[inline]
fn ylogy(y: f64, mu: f64) -> f64 {
    if y == 0.0 { 0.0 } else { y * (y / mu).ln() }
}

impl Link {
    /// Inverse link: the mean implied by a linear predictor.
    pub fn mean(self, eta: f64) -> f64 {
        match self {
            Link::Identity => eta,
            Link::Logit => 1.0 / (1.0 + (-eta.clamp(-ETA_CLAMP, ETA_CLAMP)).exp()),
            Link::Probit => std_normal_cdf(eta),
            Link::Log => eta.min(ETA_CLAMP).exp(),
            Link::Inverse => eta.recip(),
            Link::InverseSquare => eta.sqrt().recip(),
        }
    }

    /// Derivative of the mean with respect to the linear predictor.
    pub fn mu_eta(self, eta: f64) -> f64 {
        match self {
            Link::Identity => 1.0,
            Link::Logit => {
                let mu = self.mean(eta);
                (mu * (1.0 - mu)).max(MIN_MU_ETA)
            }
            Link::Probit => std_normal_pdf(eta).max(MIN_MU_ETA),
            Link::Log => eta.min(ETA_CLAMP).exp().max(MIN_MU_ETA),
            Link::Inverse => -(eta * eta).recip(),
            Link::InverseSquare => -0.5 * eta.powf(-1.5),
        }
    }

    /// The link itself, mapping a mean onto the linear predictor scale.
    pub fn link(self, mu: f64) -> f64 {
        match self {
            Link::Identity => mu,
            Link::Logit => (mu / (1.0 - mu)).ln(),
            Link::Probit => std_normal_quantile(mu),
            Link::Log => mu.ln(),
            Link::Inverse => mu.recip(),
            Link::InverseSquare => (mu * mu).recip(),
        }
    }
}

impl Family {
    pub fn canonical_link(self) -> Link {
        match self {
            Family::Normal => Link::Identity,
            Family::Bernoulli => Link::Logit,
            Family::Poisson | Family::NegativeBinomial { .. } => Link::Log,
            Family::Gamma => Link::Inverse,
            Family::InverseGaussian => Link::InverseSquare,
        }
    }

    pub fn variance(self, mu: f64) -> f64 {
        match self {
            Family::Normal => 1.0,
            Family::Bernoulli => mu * (1.0 - mu),
            Family::Poisson => mu,
            Family::NegativeBinomial { r } => mu + mu * mu / r,
            Family::Gamma => mu * mu,
            Family::InverseGaussian => mu * mu * mu,
        }
    }

    /// Moves a mean back inside the support of the distribution.
    pub fn clamp_mean(self, mu: f64) -> f64 {
        match self {
            Family::Normal => mu,
            Family::Bernoulli => mu.clamp(MU_EPS, 1.0 - MU_EPS),
            Family::Poisson
            | Family::NegativeBinomial { .. }
            | Family::Gamma
            | Family::InverseGaussian => mu.max(MU_EPS),
        }
    }

    /// Contribution of one observation to the deviance.
    pub fn unit_deviance(self, y: f64, mu: f64) -> f64 {
        match self {
            Family::Normal => (y - mu) * (y - mu),
            Family::Bernoulli => 2.0 * (ylogy(y, mu) + ylogy(1.0 - y, 1.0 - mu)),
            Family::Poisson => 2.0 * (ylogy(y, mu) - (y - mu)),
            Family::NegativeBinomial { r } => {
                2.0 * (ylogy(y, mu) - (y + r) * ((y + r) / (mu + r)).ln())
            }
            Family::Gamma => 2.0 * (-(y / mu).ln() + (y - mu) / mu),
            Family::InverseGaussian => (y - mu) * (y - mu) / (y * mu * mu),
        }
    }

    /// Sum of weighted unit deviances. Zero-weight observations are skipped outright so
    /// that held-out samples never inject non-finite terms.
    pub fn deviance(
        self,
        y: ArrayView1<'_, f64>,
        mu: ArrayView1<'_, f64>,
        weights: ArrayView1<'_, f64>,
    ) -> f64 {
        Zip::from(&y)
            .and(&mu)
            .and(&weights)
            .fold(0.0, |acc, &yi, &mui, &wi| {
                if wi == 0.0 {
                    acc
                } else {
                    acc + wi * self.unit_deviance(yi, mui)
                }
            })
    }

    fn admits(self, y: f64) -> bool {
        match self {
            Family::Normal => y.is_finite(),
            Family::Bernoulli => (0.0..=1.0).contains(&y),
            Family::Poisson | Family::NegativeBinomial { .. } => y.is_finite() && y >= 0.0,
            Family::Gamma | Family::InverseGaussian => y.is_finite() && y > 0.0,
        }
    }

    fn support_description(self) -> &'static str {
        match self {
            Family::Normal => "finite values",
            Family::Bernoulli => "values in [0, 1]",
            Family::Poisson | Family::NegativeBinomial { .. } => "non-negative values",
            Family::Gamma | Family::InverseGaussian => "strictly positive values",
        }
    }

    /// Checks that every response lies in the support of the distribution.
    pub fn validate_response(self, y: ArrayView1<'_, f64>) -> Result<(), String> {
        match y.iter().position(|&v| !self.admits(v)) {
            Some(i) => Err(format!(
                "response {} at sample {i} is invalid for the {self} family (expected {})",
                y[i],
                self.support_description()
            )),
            None => Ok(()),
        }
    }
}

/// A distribution paired with a link, selected once per fit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Glm {
    pub family: Family,
    pub link: Link,
}

impl Glm {
    pub fn new(family: Family, link: Option<Link>) -> Self {
        Self {
            family,
            link: link.unwrap_or_else(|| family.canonical_link()),
        }
    }

    #[inline]
    pub fn mean(&self, eta: f64) -> f64 {
        self.family.clamp_mean(self.link.mean(eta))
    }

    pub fn fill_mean(&self, eta: ArrayView1<'_, f64>, mut mu: ArrayViewMut1<'_, f64>) {
        Zip::from(&mut mu)
            .and(&eta)
            .for_each(|m, &e| *m = self.mean(e));
    }

    /// `w (y - mu) mu' / V(mu)`; the gradient of the log-likelihood is `X^T` of this.
    /// Pairings where `mu' = V(mu)` skip the ratio.
    pub fn score_residuals(
        &self,
        y: ArrayView1<'_, f64>,
        eta: ArrayView1<'_, f64>,
        mu: ArrayView1<'_, f64>,
        weights: ArrayView1<'_, f64>,
        mut out: ArrayViewMut1<'_, f64>,
    ) {
        let family = self.family;
        let link = self.link;
        let canonical = matches!(
            (family, link),
            (Family::Normal, Link::Identity)
                | (Family::Bernoulli, Link::Logit)
                | (Family::Poisson, Link::Log)
        );
        Zip::from(&mut out)
            .and(&y)
            .and(&eta)
            .and(&mu)
            .and(&weights)
            .for_each(|r, &yi, &ei, &mi, &wi| {
                *r = if wi == 0.0 {
                    0.0
                } else if canonical {
                    wi * (yi - mi)
                } else {
                    wi * (yi - mi) * link.mu_eta(ei) / family.variance(mi)
                };
            });
    }

    /// Expected information weights `w mu'^2 / V(mu)`.
    pub fn fisher_weights(
        &self,
        eta: ArrayView1<'_, f64>,
        mu: ArrayView1<'_, f64>,
        weights: ArrayView1<'_, f64>,
        mut out: ArrayViewMut1<'_, f64>,
    ) {
        let family = self.family;
        let link = self.link;
        Zip::from(&mut out)
            .and(&eta)
            .and(&mu)
            .and(&weights)
            .for_each(|w, &ei, &mi, &wi| {
                *w = if wi == 0.0 {
                    0.0
                } else {
                    let d = link.mu_eta(ei);
                    wi * d * d / family.variance(mi)
                };
            });
    }

    /// Half the weighted deviance (half the residual sum of squares for the normal family).
    pub fn objective(
        &self,
        y: ArrayView1<'_, f64>,
        mu: ArrayView1<'_, f64>,
        weights: ArrayView1<'_, f64>,
    ) -> f64 {
        0.5 * self.family.deviance(y, mu, weights)
    }
}
