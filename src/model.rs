//! Access to a single model of the posterior database.
//!
//! A [`ModelHandle`] owns the oracle instantiated for one model definition and
//! dataset, and exposes the oracle's scalar routines for single vectors and
//! for batches of row vectors.

use std::{
    error::Error,
    fs,
    path::{Path, PathBuf},
};

use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    layout::{DatabaseConfig, ModelFiles},
    oracle::{LogDensityOracle, ModelSource, OracleBuilder},
    reference::{load_reference_draws, ReferenceDataError, ReferenceDraws},
};

pub type BoxedError = Box<dyn Error + Send + Sync>;

fn at_row(row: &Option<usize>) -> String {
    match row {
        Some(row) => format!(" at row {}", row),
        None => String::new(),
    }
}

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("could not read {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed dataset {path:?}")]
    Dataset {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("could not instantiate model {id}")]
    Oracle {
        id: u32,
        #[source]
        source: BoxedError,
    },
}

#[derive(Error, Debug)]
pub enum TransformError {
    #[error("expected parameter vectors of length {expected}, got {found}")]
    Dimension { expected: usize, found: usize },
    #[error("parameter transform failed{}", at_row(.row))]
    Oracle {
        row: Option<usize>,
        #[source]
        source: BoxedError,
    },
}

impl TransformError {
    fn at(self, index: usize) -> Self {
        match self {
            TransformError::Oracle { source, .. } => TransformError::Oracle {
                row: Some(index),
                source,
            },
            other => other,
        }
    }

    /// Index of the batch row that failed, if the error came from a batch.
    pub fn row(&self) -> Option<usize> {
        match self {
            TransformError::Oracle { row, .. } => *row,
            TransformError::Dimension { .. } => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum EvaluationError {
    #[error("expected parameter vectors of length {expected}, got {found}")]
    Dimension { expected: usize, found: usize },
    #[error("log density evaluation failed{}", at_row(.row))]
    Oracle {
        row: Option<usize>,
        #[source]
        source: BoxedError,
    },
    #[error("expected a batch of {expected} rows, got {found}")]
    BatchSize { expected: usize, found: usize },
    #[error("host callback returned {found} values where {expected} were declared")]
    ResultShape { expected: usize, found: usize },
}

impl EvaluationError {
    pub(crate) fn at(self, index: usize) -> Self {
        match self {
            EvaluationError::Oracle { source, .. } => EvaluationError::Oracle {
                row: Some(index),
                source,
            },
            other => other,
        }
    }

    /// Index of the batch row that failed, if the error came from a batch.
    pub fn row(&self) -> Option<usize> {
        match self {
            EvaluationError::Oracle { row, .. } => *row,
            _ => None,
        }
    }
}

/// Run `f` on a contiguous view of `x`, copying only if `x` is strided.
pub(crate) fn with_slice<R>(x: ArrayView1<f64>, f: impl FnOnce(&[f64]) -> R) -> R {
    match x.as_slice() {
        Some(slice) => f(slice),
        None => f(&x.to_vec()),
    }
}

fn stack_rows(flat: Vec<f64>, rows: usize, cols: usize) -> Array2<f64> {
    Array2::from_shape_vec((rows, cols), flat).expect("Row buffer does not match its shape")
}

fn read_text(path: &Path) -> Result<String, ModelLoadError> {
    fs::read_to_string(path).map_err(|source| ModelLoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_model_name(files: &ModelFiles) -> String {
    let fallback = format!("Model_{:02}", files.id());
    let path = files.metadata();
    let Ok(contents) = fs::read_to_string(&path) else {
        return fallback;
    };
    match serde_json::from_str::<serde_json::Value>(&contents) {
        Ok(meta) => meta
            .get("name")
            .and_then(serde_json::Value::as_str)
            .map(str::to_owned)
            .unwrap_or(fallback),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring malformed model metadata");
            fallback
        }
    }
}

/// One model of the database together with its instantiated oracle.
#[derive(Debug)]
pub struct ModelHandle<O> {
    name: String,
    files: ModelFiles,
    source: ModelSource,
    oracle: O,
    dims: usize,
    reference: Option<ReferenceDraws>,
}

impl<O: LogDensityOracle> ModelHandle<O> {
    /// Read model `id` from the database and instantiate its oracle.
    pub fn load<B>(config: &DatabaseConfig, id: u32, builder: &B) -> Result<Self, ModelLoadError>
    where
        B: OracleBuilder<Oracle = O>,
    {
        let files = config.model_files(id);
        let code = read_text(&files.code())?;
        let data_path = files.data();
        let data = serde_json::from_str(&read_text(&data_path)?).map_err(|source| {
            ModelLoadError::Dataset {
                path: data_path.clone(),
                source,
            }
        })?;
        let source = ModelSource { id, code, data };
        let oracle = builder
            .build(&source)
            .map_err(|source| ModelLoadError::Oracle {
                id,
                source: Box::new(source),
            })?;

        let mut handle = Self::new(files, source, oracle);
        handle.name = read_model_name(&handle.files);
        info!(model = id, name = %handle.name, dims = handle.dims, "loaded model");
        Ok(handle)
    }

    /// Wrap an already instantiated oracle.
    pub fn new(files: ModelFiles, source: ModelSource, oracle: O) -> Self {
        let dims = oracle.param_unc_num();
        Self {
            name: format!("Model_{:02}", source.id),
            files,
            source,
            oracle,
            dims,
            reference: None,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn id(&self) -> u32 {
        self.source.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &str {
        &self.source.code
    }

    pub fn data(&self) -> &serde_json::Value {
        &self.source.data
    }

    pub fn files(&self) -> &ModelFiles {
        &self.files
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    /// Number of unconstrained parameters `D`.
    pub fn dims(&self) -> usize {
        self.dims
    }

    /// Number of constrained parameters.
    pub fn constrained_dims(&self) -> usize {
        self.oracle.param_num()
    }

    fn transform_into(
        &self,
        x: &[f64],
        out: &mut [f64],
        inverse: bool,
    ) -> Result<(), TransformError> {
        let result = if inverse {
            self.oracle.param_unconstrain(x, out)
        } else {
            self.oracle.param_constrain(x, out)
        };
        result.map_err(|source| TransformError::Oracle {
            row: None,
            source: Box::new(source),
        })
    }

    fn transform(&self, x: ArrayView1<f64>, inverse: bool) -> Result<Array1<f64>, TransformError> {
        let (input_dim, output_dim) = self.transform_dims(inverse);
        if x.len() != input_dim {
            return Err(TransformError::Dimension {
                expected: input_dim,
                found: x.len(),
            });
        }
        let mut out = vec![0f64; output_dim];
        with_slice(x, |x| self.transform_into(x, &mut out, inverse))?;
        Ok(out.into())
    }

    fn transform_batch(
        &self,
        xs: ArrayView2<f64>,
        inverse: bool,
    ) -> Result<Array2<f64>, TransformError> {
        let (input_dim, output_dim) = self.transform_dims(inverse);
        if xs.ncols() != input_dim {
            return Err(TransformError::Dimension {
                expected: input_dim,
                found: xs.ncols(),
            });
        }
        let mut flat = vec![0f64; xs.nrows() * output_dim];
        // Indexed so that the oracle still sees every row when `output_dim` is 0.
        for (i, x) in xs.rows().into_iter().enumerate() {
            let out = &mut flat[i * output_dim..(i + 1) * output_dim];
            with_slice(x, |x| self.transform_into(x, out, inverse)).map_err(|e| e.at(i))?;
        }
        Ok(stack_rows(flat, xs.nrows(), output_dim))
    }

    fn transform_dims(&self, inverse: bool) -> (usize, usize) {
        if inverse {
            (self.constrained_dims(), self.dims)
        } else {
            (self.dims, self.constrained_dims())
        }
    }

    /// Map one constrained vector to the unconstrained space.
    pub fn unconstrain(&self, x: ArrayView1<f64>) -> Result<Array1<f64>, TransformError> {
        self.transform(x, true)
    }

    /// Map each row of `xs` to the unconstrained space.
    pub fn unconstrain_batch(&self, xs: ArrayView2<f64>) -> Result<Array2<f64>, TransformError> {
        self.transform_batch(xs, true)
    }

    /// Map one unconstrained vector to the constrained space.
    pub fn constrain(&self, x: ArrayView1<f64>) -> Result<Array1<f64>, TransformError> {
        self.transform(x, false)
    }

    /// Map each row of `xs` to the constrained space.
    pub fn constrain_batch(&self, xs: ArrayView2<f64>) -> Result<Array2<f64>, TransformError> {
        self.transform_batch(xs, false)
    }

    fn check_dims(&self, found: usize) -> Result<(), EvaluationError> {
        if found != self.dims {
            return Err(EvaluationError::Dimension {
                expected: self.dims,
                found,
            });
        }
        Ok(())
    }

    pub(crate) fn log_density_slice(&self, x: &[f64]) -> Result<f64, EvaluationError> {
        self.oracle
            .log_density(x)
            .map_err(|source| EvaluationError::Oracle {
                row: None,
                source: Box::new(source),
            })
    }

    pub(crate) fn log_density_gradient_slice(
        &self,
        x: &[f64],
        gradient: &mut [f64],
    ) -> Result<f64, EvaluationError> {
        self.oracle
            .log_density_gradient(x, gradient)
            .map_err(|source| EvaluationError::Oracle {
                row: None,
                source: Box::new(source),
            })
    }

    /// Log density at one unconstrained position.
    pub fn log_density(&self, x: ArrayView1<f64>) -> Result<f64, EvaluationError> {
        self.check_dims(x.len())?;
        with_slice(x, |x| self.log_density_slice(x))
    }

    /// Log density at every row of `xs`, in row order.
    pub fn log_density_batch(&self, xs: ArrayView2<f64>) -> Result<Array1<f64>, EvaluationError> {
        self.check_dims(xs.ncols())?;
        xs.rows()
            .into_iter()
            .enumerate()
            .map(|(i, x)| with_slice(x, |x| self.log_density_slice(x)).map_err(|e| e.at(i)))
            .collect::<Result<Vec<_>, _>>()
            .map(Array1::from)
    }

    /// Log density and its gradient at one unconstrained position.
    pub fn log_density_gradient(
        &self,
        x: ArrayView1<f64>,
    ) -> Result<(f64, Array1<f64>), EvaluationError> {
        self.check_dims(x.len())?;
        let mut gradient = vec![0f64; self.dims];
        let logp = with_slice(x, |x| self.log_density_gradient_slice(x, &mut gradient))?;
        Ok((logp, gradient.into()))
    }

    /// Log densities and gradients at every row of `xs`.
    ///
    /// Row `i` of the returned gradient matrix belongs to row `i` of `xs`.
    pub fn log_density_gradient_batch(
        &self,
        xs: ArrayView2<f64>,
    ) -> Result<(Array1<f64>, Array2<f64>), EvaluationError> {
        self.check_dims(xs.ncols())?;
        let mut logps = Vec::with_capacity(xs.nrows());
        let mut gradients = vec![0f64; xs.nrows() * self.dims];
        for (i, x) in xs.rows().into_iter().enumerate() {
            let gradient = &mut gradients[i * self.dims..(i + 1) * self.dims];
            let logp = with_slice(x, |x| self.log_density_gradient_slice(x, gradient))
                .map_err(|e| e.at(i))?;
            logps.push(logp);
        }
        Ok((logps.into(), stack_rows(gradients, xs.nrows(), self.dims)))
    }

    /// Load the saved reference draws of this model and keep them.
    pub fn attach_reference_draws<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
    ) -> Result<&ReferenceDraws, ReferenceDataError> {
        let draws = load_reference_draws(&self.files, self.dims, rng)?;
        Ok(self.reference.insert(draws))
    }

    /// Like [`Self::attach_reference_draws`], shuffling with a ChaCha8 stream
    /// seeded by `seed`.
    pub fn attach_reference_draws_seeded(
        &mut self,
        seed: u64,
    ) -> Result<&ReferenceDraws, ReferenceDataError> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        self.attach_reference_draws(&mut rng)
    }

    pub fn reference_draws(&self) -> Option<&ReferenceDraws> {
        self.reference.as_ref()
    }

    /// The attached reference pool mapped to the unconstrained space.
    ///
    /// The pool holds constrained draws, so its width has to match the
    /// constrained size as well as `D`.
    pub fn reference_draws_unconstrained(
        &self,
    ) -> Result<Option<Array2<f64>>, ReferenceDataError> {
        let Some(draws) = &self.reference else {
            return Ok(None);
        };
        let stored = draws.pool().ncols();
        let constrained = self.constrained_dims();
        if stored != constrained {
            return Err(ReferenceDataError::ConstrainedWidth {
                stored,
                constrained,
            });
        }
        Ok(Some(self.unconstrain_batch(draws.pool().view())?))
    }
}

/// Load every model in `ids` and report its unconstrained dimension.
///
/// Models that fail to load are reported with their error and do not stop
/// the survey. Results are in the order of `ids`.
pub fn survey<B, I>(
    config: &DatabaseConfig,
    ids: I,
    builder: &B,
) -> Vec<(u32, Result<usize, ModelLoadError>)>
where
    B: OracleBuilder,
    I: IntoIterator<Item = u32>,
{
    let results: Vec<_> = ids
        .into_iter()
        .map(|id| {
            let dims = ModelHandle::load(config, id, builder).map(|model| model.dims());
            match &dims {
                Ok(dims) => info!(model = id, dims, "model available"),
                Err(err) => warn!(model = id, error = %err, "model failed to load"),
            }
            (id, dims)
        })
        .collect();

    let failed: Vec<u32> = results
        .iter()
        .filter(|(_, dims)| dims.is_err())
        .map(|(id, _)| *id)
        .collect();
    info!(
        surveyed = results.len(),
        failed = ?failed,
        "finished model survey"
    );
    results
}
