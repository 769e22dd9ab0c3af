//! Per-call configuration for the divergence computation.

use crate::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Which solver drives the computation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum Backend {
    /// Dense log-domain Sinkhorn on the full clouds.
    Direct,
    /// Coarse-to-fine solve over a cluster hierarchy with kernel truncation.
    #[default]
    Multiscale,
}

impl FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "direct" => Ok(Backend::Direct),
            "multiscale" => Ok(Backend::Multiscale),
            other => Err(Error::UnknownBackend(other.to_string())),
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Direct => f.write_str("direct"),
            Backend::Multiscale => f.write_str("multiscale"),
        }
    }
}

/// Configuration for [`crate::sinkhorn_divergence`].
///
/// The first five fields are the user-facing knobs; the rest tune the
/// iteration budget and the multiscale driver.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DivergenceConfig {
    /// Cost exponent: `c(x, y) = ‖x − y‖^p`.
    pub p: f64,
    /// Target blur. The final regularization is `ε = blur^p`.
    pub blur: f64,
    /// Per-step epsilon shrink factor, in `(0, 1)`.
    pub scaling: f64,
    /// Subtract the self-transport terms `½OT(A,A) + ½OT(B,B)`.
    pub debias: bool,
    pub backend: Backend,
    /// Sinkhorn passes at every intermediate epsilon.
    pub inner_iterations: usize,
    /// Pass cap at the final epsilon.
    pub max_iterations: usize,
    /// Convergence threshold on the largest potential change (cost units).
    pub tolerance: f64,
    /// Kernel truncation band, in log-plan units.
    pub truncate: f64,
    /// Clouds smaller than this are solved directly even in multiscale mode.
    pub min_multiscale_points: usize,
    /// Approximate number of points on the coarsest hierarchy level.
    pub coarse_points: usize,
}

impl Default for DivergenceConfig {
    fn default() -> Self {
        Self {
            p: 1.0,
            blur: 0.005,
            scaling: 0.5,
            debias: false,
            backend: Backend::Multiscale,
            inner_iterations: 2,
            max_iterations: 1_000,
            tolerance: 1e-3,
            truncate: 8.0,
            min_multiscale_points: 512,
            coarse_points: 256,
        }
    }
}

impl DivergenceConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the cost exponent.
    pub fn with_p(mut self, p: f64) -> Self {
        self.p = p;
        self
    }

    /// Set the target blur.
    pub fn with_blur(mut self, blur: f64) -> Self {
        self.blur = blur;
        self
    }

    /// Set the epsilon shrink factor.
    pub fn with_scaling(mut self, scaling: f64) -> Self {
        self.scaling = scaling;
        self
    }

    /// Enable or disable debiasing.
    pub fn with_debias(mut self, debias: bool) -> Self {
        self.debias = debias;
        self
    }

    pub fn with_backend(mut self, backend: Backend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_inner_iterations(mut self, n: usize) -> Self {
        self.inner_iterations = n;
        self
    }

    /// Set the pass cap at the final epsilon.
    pub fn with_max_iterations(mut self, max_iter: usize) -> Self {
        self.max_iterations = max_iter;
        self
    }

    /// Set the convergence tolerance.
    pub fn with_tolerance(mut self, tol: f64) -> Self {
        self.tolerance = tol;
        self
    }

    pub fn with_truncate(mut self, truncate: f64) -> Self {
        self.truncate = truncate;
        self
    }

    pub fn with_min_multiscale_points(mut self, n: usize) -> Self {
        self.min_multiscale_points = n;
        self
    }

    pub fn with_coarse_points(mut self, n: usize) -> Self {
        self.coarse_points = n;
        self
    }

    /// Final regularization strength `blur^p`.
    pub fn target_epsilon(&self) -> f64 {
        self.blur.powf(self.p)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        fn positive(name: &'static str, value: f64) -> Result<()> {
            if value > 0.0 && value.is_finite() {
                Ok(())
            } else {
                Err(Error::InvalidParameter { name, value })
            }
        }

        positive("p", self.p)?;
        positive("blur", self.blur)?;
        positive("tolerance", self.tolerance)?;
        positive("truncate", self.truncate)?;
        if !(self.scaling > 0.0 && self.scaling < 1.0) {
            return Err(Error::InvalidParameter { name: "scaling", value: self.scaling });
        }
        if self.max_iterations == 0 {
            return Err(Error::InvalidParameter { name: "max_iterations", value: 0.0 });
        }
        if self.coarse_points == 0 {
            return Err(Error::InvalidParameter { name: "coarse_points", value: 0.0 });
        }
        Ok(())
    }
}
