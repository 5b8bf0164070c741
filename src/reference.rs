//! Saved reference posterior draws.
//!
//! Draws are stored per chain as a `(chains, draws, D)` array together with a
//! manifest of parameter names. Saved draws are constrained draws, as written
//! by the sampler; their width is checked against the unconstrained size `D`,
//! so only models whose constrained and unconstrained sizes agree can map
//! them to the unconstrained space. For use as reference data the chains are
//! pooled and the pool is shuffled, so consumers can take any prefix of it as
//! an approximately independent sample.

use std::{fs, io, path::Path, path::PathBuf};

use ndarray::{s, Array2, Array3, ArrayView3, Zip};
use ndarray_npy::{read_npy, ReadNpyError};
use rand::Rng;
use thiserror::Error;
use tracing::info;

use crate::{layout::ModelFiles, model::TransformError};

#[derive(Error, Debug)]
pub enum ReferenceDataError {
    #[error("could not read {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("could not read reference draws from {path:?}")]
    Npy {
        path: PathBuf,
        #[source]
        source: ReadNpyError,
    },
    #[error("manifest lists {found} parameters but the model has {expected}")]
    ManifestLength { expected: usize, found: usize },
    #[error("reference draws have {found} columns but the model has {expected}")]
    ArrayWidth { expected: usize, found: usize },
    #[error(
        "saved draws have {stored} columns but constrained draws of the model have \
         {constrained}, so they cannot be unconstrained"
    )]
    ConstrainedWidth { stored: usize, constrained: usize },
    #[error("could not map reference draws to the unconstrained space")]
    Transform(#[from] TransformError),
}

/// Pooled reference draws of one model.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceDraws {
    parameters: Vec<String>,
    num_chains: usize,
    draws_per_chain: usize,
    pool: Array2<f64>,
}

impl ReferenceDraws {
    /// Pool `draws` of shape `(chains, draws, D)` and shuffle the pool.
    pub fn from_chains<R: Rng + ?Sized>(
        parameters: Vec<String>,
        draws: ArrayView3<f64>,
        rng: &mut R,
    ) -> Result<Self, ReferenceDataError> {
        let (num_chains, draws_per_chain, width) = draws.dim();
        if parameters.len() != width {
            return Err(ReferenceDataError::ManifestLength {
                expected: width,
                found: parameters.len(),
            });
        }
        let mut pool = flatten_chains(draws);
        shuffle_rows(&mut pool, rng);
        Ok(Self {
            parameters,
            num_chains,
            draws_per_chain,
            pool,
        })
    }

    /// Parameter names, one per column of the pool.
    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn num_chains(&self) -> usize {
        self.num_chains
    }

    pub fn draws_per_chain(&self) -> usize {
        self.draws_per_chain
    }

    /// The shuffled pool, shape `(chains * draws, D)`.
    pub fn pool(&self) -> &Array2<f64> {
        &self.pool
    }

    pub fn into_parts(self) -> (Vec<String>, Array2<f64>) {
        (self.parameters, self.pool)
    }
}

/// Read a newline separated list of names.
pub fn read_manifest(path: &Path) -> Result<Vec<String>, ReferenceDataError> {
    let contents = fs::read_to_string(path).map_err(|source| ReferenceDataError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Load the manifest and saved draws of a model with `dims` parameters.
pub fn load_reference_draws<R: Rng + ?Sized>(
    files: &ModelFiles,
    dims: usize,
    rng: &mut R,
) -> Result<ReferenceDraws, ReferenceDataError> {
    let parameters = read_manifest(&files.samples_meta())?;
    if parameters.len() != dims {
        return Err(ReferenceDataError::ManifestLength {
            expected: dims,
            found: parameters.len(),
        });
    }

    let path = files.samples();
    let draws: Array3<f64> = read_npy(&path).map_err(|source| ReferenceDataError::Npy {
        path: path.clone(),
        source,
    })?;
    let width = draws.dim().2;
    if width != dims {
        return Err(ReferenceDataError::ArrayWidth {
            expected: dims,
            found: width,
        });
    }

    let draws = ReferenceDraws::from_chains(parameters, draws.view(), rng)?;
    info!(
        model = files.id(),
        chains = draws.num_chains(),
        draws = draws.pool().nrows(),
        "loaded reference draws"
    );
    Ok(draws)
}

/// Concatenate the chains of a `(chains, draws, D)` array.
///
/// All draws of chain 0 come first, in their original order, then chain 1
/// and so on.
pub fn flatten_chains(draws: ArrayView3<f64>) -> Array2<f64> {
    let (chains, per_chain, width) = draws.dim();
    Array2::from_shape_fn((chains * per_chain, width), |(row, col)| {
        draws[[row / per_chain, row % per_chain, col]]
    })
}

/// Randomly permute the rows of `pool` in place.
///
/// Rows are moved as a whole; the columns of a row stay together.
pub fn shuffle_rows<R: Rng + ?Sized>(pool: &mut Array2<f64>, rng: &mut R) {
    for i in (1..pool.nrows()).rev() {
        let j = rng.random_range(0..=i);
        if i != j {
            let (mut a, mut b) = pool.multi_slice_mut((s![i, ..], s![j, ..]));
            Zip::from(&mut a).and(&mut b).for_each(std::mem::swap);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::DatabaseConfig;
    use ndarray::{arr3, Array3, Axis};
    use ndarray_npy::write_npy;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn sorted_rows(pool: &Array2<f64>) -> Vec<Vec<f64>> {
        let mut rows: Vec<Vec<f64>> = pool.rows().into_iter().map(|r| r.to_vec()).collect();
        rows.sort_by(|a, b| a.partial_cmp(b).expect("finite test data"));
        rows
    }

    #[test]
    fn flatten_keeps_chain_order() {
        let draws = arr3(&[[[1., 10.], [2., 20.]], [[3., 30.], [4., 40.]]]);
        let flat = flatten_chains(draws.view());
        assert_eq!(
            flat,
            ndarray::arr2(&[[1., 10.], [2., 20.], [3., 30.], [4., 40.]])
        );
    }

    #[test]
    fn flatten_empty() {
        let draws = Array3::<f64>::zeros((3, 0, 2));
        assert_eq!(flatten_chains(draws.view()).dim(), (0, 2));
    }

    #[test]
    fn shuffle_is_reproducible() {
        let draws = Array3::from_shape_fn((4, 25, 3), |(c, d, k)| {
            (c * 1000 + d * 10 + k) as f64
        });
        let mut a = flatten_chains(draws.view());
        let mut b = a.clone();
        shuffle_rows(&mut a, &mut ChaCha8Rng::seed_from_u64(7));
        shuffle_rows(&mut b, &mut ChaCha8Rng::seed_from_u64(7));
        assert_eq!(a, b);
        assert_ne!(a, flatten_chains(draws.view()));
    }

    proptest! {
        #[test]
        fn shuffle_preserves_rows(chains in 1usize..5, per_chain in 0usize..20, width in 1usize..4, seed in any::<u64>()) {
            // Every entry encodes its own chain, draw and column.
            let draws = Array3::from_shape_fn((chains, per_chain, width), |(c, d, k)| {
                (c * 10_000 + d * 10 + k) as f64
            });
            let flat = flatten_chains(draws.view());
            let mut pool = flat.clone();
            shuffle_rows(&mut pool, &mut ChaCha8Rng::seed_from_u64(seed));

            prop_assert_eq!(pool.dim(), (chains * per_chain, width));
            prop_assert_eq!(sorted_rows(&pool), sorted_rows(&flat));
            for row in pool.axis_iter(Axis(0)) {
                let base = row[0];
                for (k, value) in row.iter().enumerate() {
                    prop_assert_eq!(*value, base + k as f64);
                }
            }
        }
    }

    #[test]
    fn load_from_disk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let files = DatabaseConfig::new(dir.path()).model_files(5);
        fs::create_dir_all(files.dir())?;
        fs::write(files.samples_meta(), "mu\ntau\n")?;
        let draws = Array3::from_shape_fn((2, 3, 2), |(c, d, k)| (c * 100 + d * 10 + k) as f64);
        write_npy(files.samples(), &draws)?;

        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let loaded = load_reference_draws(&files, 2, &mut rng)?;
        assert_eq!(loaded.parameters(), &["mu".to_string(), "tau".to_string()]);
        assert_eq!(loaded.num_chains(), 2);
        assert_eq!(loaded.draws_per_chain(), 3);
        assert_eq!(
            sorted_rows(loaded.pool()),
            sorted_rows(&flatten_chains(draws.view()))
        );
        Ok(())
    }

    #[test]
    fn dimension_mismatch() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let files = DatabaseConfig::new(dir.path()).model_files(0);
        fs::create_dir_all(files.dir())?;
        fs::write(files.samples_meta(), "mu\ntau\n")?;
        write_npy(files.samples(), &Array3::<f64>::zeros((2, 3, 3)))?;
        let mut rng = ChaCha8Rng::seed_from_u64(1);

        let err = load_reference_draws(&files, 3, &mut rng).unwrap_err();
        assert!(matches!(
            err,
            ReferenceDataError::ManifestLength {
                expected: 3,
                found: 2
            }
        ));

        fs::write(files.samples_meta(), "a\nb\n")?;
        let err = load_reference_draws(&files, 2, &mut rng).unwrap_err();
        assert!(matches!(
            err,
            ReferenceDataError::ArrayWidth {
                expected: 2,
                found: 3
            }
        ));
        Ok(())
    }

    #[test]
    fn missing_files() {
        let files = DatabaseConfig::new("/nonexistent/pdb").model_files(1);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let err = load_reference_draws(&files, 1, &mut rng).unwrap_err();
        assert!(matches!(err, ReferenceDataError::Io { .. }));
    }
}
