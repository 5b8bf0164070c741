use std::path::{Path, PathBuf};

use thiserror::Error;

/// Environment variable holding the posterior database root.
pub const DATABASE_PATH_VAR: &str = "POSTERIORDB_PATH";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    MissingRoot(&'static str),
}

/// Location of the posterior database on disk.
///
/// Each model `N` lives in its own directory `PDB_NN` below the root, and all
/// files of that model share the prefix `PDB_NN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    root: PathBuf,
}

impl DatabaseConfig {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Read the database root from `POSTERIORDB_PATH`.
    pub fn from_env() -> Result<Self, ConfigError> {
        std::env::var_os(DATABASE_PATH_VAR)
            .map(Self::new)
            .ok_or(ConfigError::MissingRoot(DATABASE_PATH_VAR))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn model_files(&self, id: u32) -> ModelFiles {
        let tag = format!("PDB_{:02}", id);
        let dir = self.root.join(&tag);
        ModelFiles {
            id,
            prefix: dir.join(&tag),
            dir,
        }
    }
}

/// Paths of all files that belong to one model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFiles {
    id: u32,
    dir: PathBuf,
    prefix: PathBuf,
}

impl ModelFiles {
    fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut path = self.prefix.clone().into_os_string();
        path.push(suffix);
        path.into()
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Model definition.
    pub fn code(&self) -> PathBuf {
        self.with_suffix(".stan")
    }

    /// Dataset as JSON key-value pairs.
    pub fn data(&self) -> PathBuf {
        self.with_suffix(".data.json")
    }

    /// Optional metadata, used for the model name.
    pub fn metadata(&self) -> PathBuf {
        self.with_suffix(".metadata.json")
    }

    pub fn samples_meta(&self) -> PathBuf {
        self.with_suffix(".samples.meta")
    }

    pub fn diagnostics_meta(&self) -> PathBuf {
        self.with_suffix(".diagnostics.meta")
    }

    /// Reference draws, shape `(chains, draws, D)`.
    pub fn samples(&self) -> PathBuf {
        self.with_suffix(".samples.npy")
    }

    /// Sampler diagnostics, shape `(chains, draws, skip_cols)`.
    pub fn diagnostics(&self) -> PathBuf {
        self.with_suffix(".diagnostics.npy")
    }

    /// Raw sampler output of one chain.
    pub fn chain_output(&self, chain: usize) -> PathBuf {
        self.with_suffix(&format!(".output{}.csv", chain))
    }
}

/// Settings for converting raw chain output into binary arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestSettings {
    /// Number of chain files `output0.csv .. output{n-1}.csv` to read.
    pub num_chains: usize,
    /// Keep every `thin`-th draw, starting with the first.
    pub thin: usize,
    /// Number of leading sampler diagnostic columns.
    pub skip_cols: usize,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            num_chains: 10,
            thin: 10,
            skip_cols: 7,
        }
    }
}

impl IngestSettings {
    pub fn with_num_chains(mut self, num_chains: usize) -> Self {
        self.num_chains = num_chains;
        self
    }

    pub fn with_thin(mut self, thin: usize) -> Self {
        self.thin = thin.max(1);
        self
    }

    pub fn with_skip_cols(mut self, skip_cols: usize) -> Self {
        self.skip_cols = skip_cols;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn paths_are_zero_padded() {
        let config = DatabaseConfig::new("/data/pdb");
        let files = config.model_files(3);
        assert_eq!(files.dir(), Path::new("/data/pdb/PDB_03"));
        assert_eq!(files.code(), PathBuf::from("/data/pdb/PDB_03/PDB_03.stan"));
        assert_eq!(
            files.data(),
            PathBuf::from("/data/pdb/PDB_03/PDB_03.data.json")
        );
        assert_eq!(
            files.samples(),
            PathBuf::from("/data/pdb/PDB_03/PDB_03.samples.npy")
        );
        assert_eq!(
            files.chain_output(9),
            PathBuf::from("/data/pdb/PDB_03/PDB_03.output9.csv")
        );

        let files = config.model_files(42);
        assert_eq!(
            files.diagnostics_meta(),
            PathBuf::from("/data/pdb/PDB_42/PDB_42.diagnostics.meta")
        );
    }

    #[test]
    fn ingest_defaults() {
        let settings = IngestSettings::default();
        assert_eq!(settings.num_chains, 10);
        assert_eq!(settings.thin, 10);
        assert_eq!(settings.skip_cols, 7);

        let settings = settings.with_thin(0).with_num_chains(2);
        assert_eq!(settings.thin, 1);
        assert_eq!(settings.num_chains, 2);
    }
}
