//! Interface to the external model evaluator.
//!
//! An oracle is a black box that evaluates the log density of a model and its
//! gradient on the unconstrained parameter space, and maps parameter vectors
//! between the constrained and unconstrained parameterizations. Nothing in
//! this crate looks inside it.

use std::{error::Error, fmt::Debug};

/// Log density evaluator for a single model.
///
/// All methods take `&self`. Implementations are not required to be
/// thread-safe; only oracles that are `Sync` can be evaluated from several
/// threads at once (see [`crate::Vectorized::call_par`]).
pub trait LogDensityOracle {
    /// Errors raised by the evaluator, e.g. a parameter outside the support.
    type Err: Error + Debug + Send + Sync + 'static;

    /// Number of unconstrained parameters.
    fn param_unc_num(&self) -> usize;

    /// Number of constrained parameters.
    ///
    /// This differs from [`Self::param_unc_num`] for parameters like
    /// simplexes whose unconstrained representation is shorter.
    fn param_num(&self) -> usize {
        self.param_unc_num()
    }

    /// Log density at an unconstrained position.
    fn log_density(&self, theta_unc: &[f64]) -> Result<f64, Self::Err>;

    /// Log density at an unconstrained position, writing the gradient into
    /// `gradient`.
    fn log_density_gradient(&self, theta_unc: &[f64], gradient: &mut [f64])
        -> Result<f64, Self::Err>;

    /// Map an unconstrained vector to the constrained space.
    fn param_constrain(&self, theta_unc: &[f64], out: &mut [f64]) -> Result<(), Self::Err>;

    /// Map a constrained vector to the unconstrained space.
    fn param_unconstrain(&self, theta: &[f64], out: &mut [f64]) -> Result<(), Self::Err>;
}

impl<O: LogDensityOracle + ?Sized> LogDensityOracle for &O {
    type Err = O::Err;

    fn param_unc_num(&self) -> usize {
        (**self).param_unc_num()
    }

    fn param_num(&self) -> usize {
        (**self).param_num()
    }

    fn log_density(&self, theta_unc: &[f64]) -> Result<f64, Self::Err> {
        (**self).log_density(theta_unc)
    }

    fn log_density_gradient(
        &self,
        theta_unc: &[f64],
        gradient: &mut [f64],
    ) -> Result<f64, Self::Err> {
        (**self).log_density_gradient(theta_unc, gradient)
    }

    fn param_constrain(&self, theta_unc: &[f64], out: &mut [f64]) -> Result<(), Self::Err> {
        (**self).param_constrain(theta_unc, out)
    }

    fn param_unconstrain(&self, theta: &[f64], out: &mut [f64]) -> Result<(), Self::Err> {
        (**self).param_unconstrain(theta, out)
    }
}

/// Everything an oracle needs to be instantiated: the model definition and
/// the dataset it is conditioned on.
#[derive(Debug, Clone)]
pub struct ModelSource {
    pub id: u32,
    pub code: String,
    pub data: serde_json::Value,
}

/// Constructs oracles from model sources.
///
/// This is where a concrete backend (for example a compiled Stan model
/// library) is plugged in. Building is expected to be expensive and happens
/// once per [`crate::ModelHandle`].
pub trait OracleBuilder {
    type Oracle: LogDensityOracle;
    type Err: Error + Debug + Send + Sync + 'static;

    fn build(&self, source: &ModelSource) -> Result<Self::Oracle, Self::Err>;
}

impl<F, O, E> OracleBuilder for F
where
    F: Fn(&ModelSource) -> Result<O, E>,
    O: LogDensityOracle,
    E: Error + Debug + Send + Sync + 'static,
{
    type Oracle = O;
    type Err = E;

    fn build(&self, source: &ModelSource) -> Result<O, E> {
        self(source)
    }
}
