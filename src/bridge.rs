//! Differentiable wrapper around an external log density.
//!
//! The oracle behind a [`ModelHandle`] is opaque: it can be evaluated, and it
//! can report its own gradient, but nothing can differentiate through it.
//! This module turns it into a primitive with a registered forward-mode
//! derivative rule ([`CustomJvp`]), and lifts any such primitive to batches of
//! row vectors ([`vmap`]).
//!
//! Every call into the oracle goes through [`pure_callback`], which treats the
//! oracle as a deterministic host function with a declared result shape.
//! Calls are never retried and errors propagate unchanged; a failing primal
//! evaluation fails the derivative as well.
//!
//! All values are `f64`. There is no single precision entry point, so the
//! oracle always sees double precision inputs.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rayon::prelude::*;
use tracing::trace;

use crate::{
    dual::{self, Dual},
    math::{scale_into, vector_dot},
    model::{with_slice, EvaluationError, ModelHandle},
    oracle::LogDensityOracle,
};

/// Declared shape of the result of a host callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    Scalar,
    Vector(usize),
}

impl ResultShape {
    pub fn len(&self) -> usize {
        match self {
            ResultShape::Scalar => 1,
            ResultShape::Vector(n) => *n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Call an opaque host function that promises a result of shape `shape`.
///
/// The function must be free of observable side effects and deterministic
/// for fixed inputs. A result of any other length than the declared one is
/// rejected.
pub fn pure_callback<F>(
    name: &'static str,
    shape: ResultShape,
    f: F,
) -> Result<Array1<f64>, EvaluationError>
where
    F: FnOnce() -> Result<Array1<f64>, EvaluationError>,
{
    trace!(callback = name, ?shape, "calling host function");
    let out = f()?;
    if out.len() != shape.len() {
        return Err(EvaluationError::ResultShape {
            expected: shape.len(),
            found: out.len(),
        });
    }
    Ok(out)
}

/// Local linear approximation of a scalar primitive at one point.
///
/// This is the derivative rule of a primitive: [`Linearized::apply`] maps an
/// input tangent to the output tangent, [`Linearized::transpose`] maps an
/// output cotangent back to the input space.
#[derive(Debug, Clone, PartialEq)]
pub struct Linearized {
    primal: f64,
    gradient: Array1<f64>,
}

impl Linearized {
    pub fn new(primal: f64, gradient: Array1<f64>) -> Self {
        Self { primal, gradient }
    }

    pub fn primal(&self) -> f64 {
        self.primal
    }

    pub fn gradient(&self) -> ArrayView1<f64> {
        self.gradient.view()
    }

    /// Directional derivative along `tangent`.
    ///
    /// # Panics
    ///
    /// If `tangent` does not have the length of the gradient.
    pub fn apply(&self, tangent: ArrayView1<f64>) -> f64 {
        with_slice(self.gradient.view(), |gradient| {
            with_slice(tangent, |tangent| vector_dot(gradient, tangent))
        })
    }

    pub fn transpose(&self, cotangent: f64) -> Array1<f64> {
        let mut out = vec![0f64; self.gradient.len()];
        with_slice(self.gradient.view(), |gradient| {
            scale_into(gradient, cotangent, &mut out)
        });
        out.into()
    }
}

/// A scalar valued primitive with a custom derivative rule.
pub trait CustomJvp {
    /// Length of the input vector.
    fn dim(&self) -> usize;

    /// Evaluate the primitive.
    fn call(&self, x: ArrayView1<f64>) -> Result<f64, EvaluationError>;

    /// The derivative rule at `x`.
    fn linearize(&self, x: ArrayView1<f64>) -> Result<Linearized, EvaluationError>;

    /// Value and directional derivative along `tangent`.
    ///
    /// The value is computed by [`CustomJvp::call`], so it is identical to
    /// the value of a plain evaluation.
    fn jvp(
        &self,
        x: ArrayView1<f64>,
        tangent: ArrayView1<f64>,
    ) -> Result<(f64, f64), EvaluationError> {
        if tangent.len() != x.len() {
            return Err(EvaluationError::Dimension {
                expected: x.len(),
                found: tangent.len(),
            });
        }
        let primal = self.call(x)?;
        let tangent_out = self.linearize(x)?.apply(tangent);
        Ok((primal, tangent_out))
    }

    /// Gradient at `x`, obtained by transposing the derivative rule.
    fn grad(&self, x: ArrayView1<f64>) -> Result<Array1<f64>, EvaluationError> {
        Ok(self.linearize(x)?.transpose(1.))
    }

    /// Evaluate on dual numbers, so the primitive can sit inside a larger
    /// forward-mode computation.
    fn call_dual(&self, x: &[Dual]) -> Result<Dual, EvaluationError> {
        let (values, tangents) = dual::unzip(x);
        let (value, tangent) = self.jvp(
            ArrayView1::from(values.as_slice()),
            ArrayView1::from(tangents.as_slice()),
        )?;
        Ok(Dual::new(value, tangent))
    }
}

/// The log density of a model as a [`CustomJvp`] primitive.
///
/// The primal is one call to the oracle's log density, the derivative rule
/// one call to the oracle's gradient.
#[derive(Debug)]
pub struct LogDensityPrimitive<'model, O> {
    model: &'model ModelHandle<O>,
}

impl<O> Clone for LogDensityPrimitive<'_, O> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<O> Copy for LogDensityPrimitive<'_, O> {}

impl<'model, O: LogDensityOracle> LogDensityPrimitive<'model, O> {
    pub fn new(model: &'model ModelHandle<O>) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &'model ModelHandle<O> {
        self.model
    }
}

impl<O: LogDensityOracle> CustomJvp for LogDensityPrimitive<'_, O> {
    fn dim(&self) -> usize {
        self.model.dims()
    }

    fn call(&self, x: ArrayView1<f64>) -> Result<f64, EvaluationError> {
        let out = pure_callback("log_density", ResultShape::Scalar, || {
            self.model
                .log_density(x)
                .map(|logp| Array1::from_elem(1, logp))
        })?;
        Ok(out[0])
    }

    fn linearize(&self, x: ArrayView1<f64>) -> Result<Linearized, EvaluationError> {
        let mut primal = f64::NAN;
        let gradient = pure_callback(
            "log_density_gradient",
            ResultShape::Vector(self.dim()),
            || {
                let (logp, gradient) = self.model.log_density_gradient(x)?;
                primal = logp;
                Ok(gradient)
            },
        )?;
        Ok(Linearized { primal, gradient })
    }
}

/// A primitive applied independently to every row of a batch.
#[derive(Debug, Clone, Copy)]
pub struct Vectorized<P> {
    inner: P,
}

/// Lift a primitive to batches along the leading axis.
pub fn vmap<P: CustomJvp>(inner: P) -> Vectorized<P> {
    Vectorized { inner }
}

impl<P: CustomJvp> Vectorized<P> {
    pub fn inner(&self) -> &P {
        &self.inner
    }

    fn check_batch(&self, xs: &ArrayView2<f64>) -> Result<(), EvaluationError> {
        if xs.ncols() != self.inner.dim() {
            return Err(EvaluationError::Dimension {
                expected: self.inner.dim(),
                found: xs.ncols(),
            });
        }
        Ok(())
    }

    fn check_tangents(
        &self,
        xs: &ArrayView2<f64>,
        tangents: &ArrayView2<f64>,
    ) -> Result<(), EvaluationError> {
        self.check_batch(xs)?;
        if tangents.nrows() != xs.nrows() {
            return Err(EvaluationError::BatchSize {
                expected: xs.nrows(),
                found: tangents.nrows(),
            });
        }
        if tangents.ncols() != xs.ncols() {
            return Err(EvaluationError::Dimension {
                expected: xs.ncols(),
                found: tangents.ncols(),
            });
        }
        Ok(())
    }

    /// Value at every row, in row order.
    pub fn call(&self, xs: ArrayView2<f64>) -> Result<Array1<f64>, EvaluationError> {
        self.check_batch(&xs)?;
        xs.rows()
            .into_iter()
            .enumerate()
            .map(|(i, x)| self.inner.call(x).map_err(|e| e.at(i)))
            .collect::<Result<Vec<_>, _>>()
            .map(Array1::from)
    }

    /// Values and directional derivatives, row `i` of `tangents` being the
    /// direction for row `i` of `xs`.
    pub fn jvp(
        &self,
        xs: ArrayView2<f64>,
        tangents: ArrayView2<f64>,
    ) -> Result<(Array1<f64>, Array1<f64>), EvaluationError> {
        self.check_tangents(&xs, &tangents)?;
        let (primals, tangents_out): (Vec<f64>, Vec<f64>) = xs
            .rows()
            .into_iter()
            .zip(tangents.rows())
            .enumerate()
            .map(|(i, (x, t))| self.inner.jvp(x, t).map_err(|e| e.at(i)))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .unzip();
        Ok((primals.into(), tangents_out.into()))
    }

    /// Gradient at every row, stacked in row order.
    pub fn grad(&self, xs: ArrayView2<f64>) -> Result<Array2<f64>, EvaluationError> {
        self.check_batch(&xs)?;
        let mut out = Array2::zeros(xs.dim());
        for (i, (x, mut row)) in xs.rows().into_iter().zip(out.rows_mut()).enumerate() {
            let gradient = self.inner.grad(x).map_err(|e| e.at(i))?;
            row.assign(&gradient);
        }
        Ok(out)
    }

    /// Evaluate every row of a batch of dual vectors.
    pub fn call_dual(&self, xs: &[Vec<Dual>]) -> Result<Vec<Dual>, EvaluationError> {
        xs.iter()
            .enumerate()
            .map(|(i, x)| self.inner.call_dual(x).map_err(|e| e.at(i)))
            .collect()
    }
}

/// Keep the error of the lowest failing row, like the sequential path does.
fn first_error<T>(results: Vec<Result<T, EvaluationError>>) -> Result<Vec<T>, EvaluationError> {
    results
        .into_iter()
        .enumerate()
        .map(|(i, result)| result.map_err(|e| e.at(i)))
        .collect()
}

impl<P: CustomJvp + Sync> Vectorized<P> {
    /// Like [`Vectorized::call`], with rows evaluated on the rayon pool.
    ///
    /// Only available if the primitive, and so the oracle behind it, can be
    /// shared between threads.
    pub fn call_par(&self, xs: ArrayView2<f64>) -> Result<Array1<f64>, EvaluationError> {
        self.check_batch(&xs)?;
        let rows: Vec<_> = xs.rows().into_iter().collect();
        let results: Vec<_> = rows.into_par_iter().map(|x| self.inner.call(x)).collect();
        first_error(results).map(Array1::from)
    }

    /// Like [`Vectorized::jvp`], with rows evaluated on the rayon pool.
    pub fn jvp_par(
        &self,
        xs: ArrayView2<f64>,
        tangents: ArrayView2<f64>,
    ) -> Result<(Array1<f64>, Array1<f64>), EvaluationError> {
        self.check_tangents(&xs, &tangents)?;
        let rows: Vec<_> = xs.rows().into_iter().zip(tangents.rows()).collect();
        let results: Vec<_> = rows
            .into_par_iter()
            .map(|(x, t)| self.inner.jvp(x, t))
            .collect();
        let (primals, tangents_out): (Vec<f64>, Vec<f64>) =
            first_error(results)?.into_iter().unzip();
        Ok((primals.into(), tangents_out.into()))
    }
}

/// The batched log density `lp` and the scalar primitive `lp_item` of a
/// model.
pub fn bridge<O: LogDensityOracle>(
    model: &ModelHandle<O>,
) -> (
    Vectorized<LogDensityPrimitive<'_, O>>,
    LogDensityPrimitive<'_, O>,
) {
    let lp_item = LogDensityPrimitive::new(model);
    (vmap(lp_item), lp_item)
}
