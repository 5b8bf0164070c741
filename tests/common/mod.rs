#![allow(dead_code)]

use posterior_bridge::{LogDensityOracle, ModelSource};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScaleError {
    #[error("scale parameters must be positive")]
    NotPositive,
    #[error("log density is not finite")]
    NotFinite,
    #[error("dataset does not define D")]
    MissingDims,
}

/// Independent standard normals on the log scale of positive parameters.
///
/// The constrained parameters are `sigma > 0`, the unconstrained ones
/// `ln(sigma)`.
#[derive(Debug, Clone)]
pub struct LogScaleModel {
    pub dim: usize,
}

impl LogDensityOracle for LogScaleModel {
    type Err = ScaleError;

    fn param_unc_num(&self) -> usize {
        self.dim
    }

    fn log_density(&self, x: &[f64]) -> Result<f64, ScaleError> {
        let logp = -0.5 * x.iter().map(|x| x * x).sum::<f64>();
        if !logp.is_finite() {
            return Err(ScaleError::NotFinite);
        }
        Ok(logp)
    }

    fn log_density_gradient(&self, x: &[f64], grad: &mut [f64]) -> Result<f64, ScaleError> {
        let logp = self.log_density(x)?;
        grad.iter_mut().zip(x).for_each(|(g, x)| *g = -x);
        Ok(logp)
    }

    fn param_constrain(&self, x: &[f64], out: &mut [f64]) -> Result<(), ScaleError> {
        out.iter_mut().zip(x).for_each(|(out, x)| *out = x.exp());
        Ok(())
    }

    fn param_unconstrain(&self, x: &[f64], out: &mut [f64]) -> Result<(), ScaleError> {
        if x.iter().any(|&x| x <= 0.) {
            return Err(ScaleError::NotPositive);
        }
        out.iter_mut().zip(x).for_each(|(out, x)| *out = x.ln());
        Ok(())
    }
}

/// Builds a [`LogScaleModel`] whose dimension is the `D` entry of the dataset.
pub fn build_log_scale(source: &ModelSource) -> Result<LogScaleModel, ScaleError> {
    let dim = source
        .data
        .get("D")
        .and_then(serde_json::Value::as_u64)
        .ok_or(ScaleError::MissingDims)?;
    Ok(LogScaleModel { dim: dim as usize })
}
