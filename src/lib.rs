//! Batched, differentiable access to externally defined log densities.
//!
//! A [`ModelHandle`] loads a model definition and dataset from a posterior
//! database and owns the [`LogDensityOracle`] built from them. [`bridge`]
//! wraps the oracle's log density as a primitive with a custom forward-mode
//! derivative rule and lifts it to batches. The [`ingest`] functions turn raw
//! multi-chain sampler output into the reference draws that
//! [`ModelHandle::attach_reference_draws`] reads back.

pub(crate) mod bridge;
pub mod dual;
pub mod ingest;
pub(crate) mod layout;
pub(crate) mod math;
pub(crate) mod model;
pub(crate) mod oracle;
pub(crate) mod reference;

pub use bridge::{
    bridge, pure_callback, vmap, CustomJvp, Linearized, LogDensityPrimitive, ResultShape,
    Vectorized,
};
pub use dual::Dual;
pub use ingest::{IngestError, IngestedDraws};
pub use layout::{ConfigError, DatabaseConfig, IngestSettings, ModelFiles, DATABASE_PATH_VAR};
pub use model::{
    survey, BoxedError, EvaluationError, ModelHandle, ModelLoadError, TransformError,
};
pub use oracle::{LogDensityOracle, ModelSource, OracleBuilder};
pub use reference::{
    flatten_chains, load_reference_draws, read_manifest, shuffle_rows, ReferenceDataError,
    ReferenceDraws,
};
