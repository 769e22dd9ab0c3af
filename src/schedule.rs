//! Epsilon-scaling (annealing) schedule.
//!
//! Solving at the target regularization directly converges slowly once
//! `ε` is small compared to the cost scale. Instead we solve a sequence of
//! smoother problems, starting at `ε₀ = diameter^p` and shrinking by
//! `scaling^p` per step, warm-starting each from the previous potentials:
//!
//! ```text
//! ε₀ = D^p,  ε_{k+1} = ε_k · s^p,  ...,  ε_last = blur^p
//! ```
//!
//! The last value is always exactly `blur^p`, so the final step may shrink by
//! less than `s^p` but never by more.

use crate::{Error, Result};

/// Longest schedule we are willing to build.
const MAX_STEPS: usize = 100_000;

/// Strictly decreasing sequence of regularization strengths.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnealingSchedule {
    epsilons: Vec<f64>,
}

impl AnnealingSchedule {
    /// Build the schedule from the joint point-cloud diameter.
    ///
    /// * `diameter` - largest distance scale of the problem (`>= 0`)
    /// * `blur` - target blur; the final epsilon is `blur^p`
    /// * `scaling` - shrink factor in `(0, 1)`
    /// * `p` - cost exponent
    pub fn new(diameter: f64, blur: f64, scaling: f64, p: f64) -> Result<Self> {
        if !(blur > 0.0) || !blur.is_finite() {
            return Err(Error::InvalidParameter { name: "blur", value: blur });
        }
        if !(scaling > 0.0 && scaling < 1.0) {
            return Err(Error::InvalidParameter { name: "scaling", value: scaling });
        }
        if !(p > 0.0) || !p.is_finite() {
            return Err(Error::InvalidParameter { name: "p", value: p });
        }
        if !(diameter >= 0.0) || !diameter.is_finite() {
            return Err(Error::InvalidParameter { name: "diameter", value: diameter });
        }

        let target = blur.powf(p);
        if !(target > 0.0) || !target.is_finite() {
            return Err(Error::NumericalInstability { epsilon: target, context: "target epsilon" });
        }
        let factor = scaling.powf(p);
        if !(factor > 0.0 && factor < 1.0) {
            return Err(Error::NumericalInstability { epsilon: factor, context: "epsilon scaling factor" });
        }
        let start = diameter.powf(p);
        if !start.is_finite() {
            return Err(Error::NumericalInstability { epsilon: start, context: "initial epsilon" });
        }

        let steps = if start > target {
            let steps = ((start.ln() - target.ln()) / -factor.ln()).ceil() + 1.0;
            if !(steps <= MAX_STEPS as f64) {
                return Err(Error::InvalidParameter { name: "scaling", value: scaling });
            }
            steps as usize
        } else {
            0
        };
        let mut epsilons = Vec::with_capacity(steps + 1);
        let mut eps = start;
        while eps > target && epsilons.len() < steps {
            epsilons.push(eps);
            eps *= factor;
        }
        epsilons.push(target);

        Ok(Self { epsilons })
    }

    /// Single-step schedule that solves directly at `epsilon`.
    pub fn constant(epsilon: f64) -> Result<Self> {
        if !(epsilon > 0.0) || !epsilon.is_finite() {
            return Err(Error::InvalidParameter { name: "epsilon", value: epsilon });
        }
        Ok(Self { epsilons: vec![epsilon] })
    }

    pub fn epsilons(&self) -> &[f64] {
        &self.epsilons
    }

    /// The final (target) epsilon.
    pub fn target(&self) -> f64 {
        // Never empty: construction always pushes the target.
        self.epsilons[self.epsilons.len() - 1]
    }

    pub fn len(&self) -> usize {
        self.epsilons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.epsilons.is_empty()
    }

    /// Iterate `(is_final, epsilon)` from coarse to fine.
    pub fn iter(&self) -> impl Iterator<Item = (bool, f64)> + '_ {
        let last = self.epsilons.len() - 1;
        self.epsilons.iter().enumerate().map(move |(k, &eps)| (k == last, eps))
    }
}
