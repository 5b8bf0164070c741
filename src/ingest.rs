//! Conversion of raw multi-chain sampler output into binary arrays.
//!
//! Each chain is a CmdStan style CSV file: comment lines start with `#`, the
//! first remaining line names the columns, every following line is one draw.
//! The leading `skip_cols` columns hold sampler diagnostics, the rest are
//! model parameters. Thinned draws of all chains are stacked into
//! `(chains, draws, columns)` arrays and written as `.npy` files next to two
//! manifests of column names.

use std::{
    fs::{self, File},
    io::{self, BufReader, Read},
    path::{Path, PathBuf},
};

use csv::StringRecord;
use ndarray::{s, stack, Array2, Array3, ArrayView2, Axis, ShapeError};
use ndarray_npy::{write_npy, WriteNpyError};
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info};

use crate::layout::{IngestSettings, ModelFiles};

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("could not access {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("malformed csv in {path:?}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{path:?} does not start with a column header")]
    MissingHeader { path: PathBuf },
    #[error("{path:?}, line {line}: could not parse {field:?} as a number")]
    Parse {
        path: PathBuf,
        line: u64,
        field: String,
    },
    #[error("{path:?}, line {line}: expected {expected} columns, found {found}")]
    RaggedRow {
        path: PathBuf,
        line: u64,
        expected: usize,
        found: usize,
    },
    #[error("columns of chain {chain} differ from the columns of chain 0")]
    HeaderMismatch { chain: usize },
    #[error("{found} columns leave no parameters after {skip_cols} diagnostic columns")]
    TooFewColumns { found: usize, skip_cols: usize },
    #[error("no chains to ingest")]
    NoChains,
    #[error("chains can not be stacked")]
    Shape(#[from] ShapeError),
    #[error("could not write {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: WriteNpyError,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKind {
    Header,
    Values,
}

/// A row holds values iff every field is a number.
pub fn classify_row(record: &StringRecord) -> RowKind {
    if record.iter().all(|field| field.parse::<f64>().is_ok()) {
        RowKind::Values
    } else {
        RowKind::Header
    }
}

/// The parsed output of one chain.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainTable {
    pub header: Vec<String>,
    /// One row per draw, one column per header entry.
    pub rows: Array2<f64>,
}

impl ChainTable {
    /// Every `thin`-th row, starting with the first.
    pub fn thinned(&self, thin: usize) -> ArrayView2<f64> {
        let step = isize::try_from(thin.max(1)).unwrap_or(isize::MAX);
        self.rows.slice(s![..;step, ..])
    }
}

/// Parse one chain. `path` is only used in error messages.
pub fn read_chain<R: Read>(reader: R, path: &Path) -> Result<ChainTable, IngestError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(reader);

    let mut header: Option<Vec<String>> = None;
    let mut values = Vec::new();
    let mut num_rows = 0;

    for record in reader.records() {
        let record = record.map_err(|source| IngestError::Csv {
            path: path.to_path_buf(),
            source,
        })?;
        let line = record.position().map_or(0, |pos| pos.line());

        let Some(expected) = header.as_ref().map(Vec::len) else {
            if classify_row(&record) == RowKind::Values {
                return Err(IngestError::MissingHeader {
                    path: path.to_path_buf(),
                });
            }
            header = Some(record.iter().map(str::to_owned).collect());
            continue;
        };

        if record.len() != expected {
            return Err(IngestError::RaggedRow {
                path: path.to_path_buf(),
                line,
                expected,
                found: record.len(),
            });
        }
        for field in record.iter() {
            let value = field.parse::<f64>().map_err(|_| IngestError::Parse {
                path: path.to_path_buf(),
                line,
                field: field.to_owned(),
            })?;
            values.push(value);
        }
        num_rows += 1;
    }

    let header = header.ok_or_else(|| IngestError::MissingHeader {
        path: path.to_path_buf(),
    })?;
    let rows = Array2::from_shape_vec((num_rows, header.len()), values)?;
    Ok(ChainTable { header, rows })
}

/// Read the output files of all chains of a model, in chain order.
pub fn read_chains(
    files: &ModelFiles,
    settings: &IngestSettings,
) -> Result<Vec<ChainTable>, IngestError> {
    (0..settings.num_chains)
        .into_par_iter()
        .map(|chain| {
            let path = files.chain_output(chain);
            let file = File::open(&path).map_err(|source| IngestError::Io {
                path: path.clone(),
                source,
            })?;
            let table = read_chain(BufReader::new(file), &path)?;
            debug!(chain, draws = table.rows.nrows(), "parsed chain output");
            Ok(table)
        })
        .collect()
}

/// Thinned draws of all chains, split into diagnostics and parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestedDraws {
    pub diagnostic_names: Vec<String>,
    pub parameter_names: Vec<String>,
    /// Shape `(chains, draws, skip_cols)`.
    pub diagnostics: Array3<f64>,
    /// Shape `(chains, draws, D)`.
    pub samples: Array3<f64>,
}

impl IngestedDraws {
    /// Write both arrays and both manifests of a model.
    pub fn save(&self, files: &ModelFiles) -> Result<(), IngestError> {
        fs::create_dir_all(files.dir()).map_err(|source| IngestError::Io {
            path: files.dir().to_path_buf(),
            source,
        })?;
        for (path, array) in [
            (files.samples(), &self.samples),
            (files.diagnostics(), &self.diagnostics),
        ] {
            write_npy(&path, array).map_err(|source| IngestError::Write { path, source })?;
        }
        for (path, names) in [
            (files.samples_meta(), &self.parameter_names),
            (files.diagnostics_meta(), &self.diagnostic_names),
        ] {
            fs::write(&path, names.join("\n")).map_err(|source| IngestError::Io { path, source })?;
        }
        Ok(())
    }
}

/// Thin the chains and split their columns at `settings.skip_cols`.
pub fn split_chains(
    chains: &[ChainTable],
    settings: &IngestSettings,
) -> Result<IngestedDraws, IngestError> {
    let first = chains.first().ok_or(IngestError::NoChains)?;
    let skip_cols = settings.skip_cols;
    if first.header.len() <= skip_cols {
        return Err(IngestError::TooFewColumns {
            found: first.header.len(),
            skip_cols,
        });
    }
    if let Some(chain) = chains.iter().position(|c| c.header != first.header) {
        return Err(IngestError::HeaderMismatch { chain });
    }

    let thinned: Vec<_> = chains.iter().map(|c| c.thinned(settings.thin)).collect();
    let diagnostics: Vec<_> = thinned.iter().map(|t| t.slice(s![.., ..skip_cols])).collect();
    let samples: Vec<_> = thinned.iter().map(|t| t.slice(s![.., skip_cols..])).collect();

    Ok(IngestedDraws {
        diagnostic_names: first.header[..skip_cols].to_vec(),
        parameter_names: first.header[skip_cols..].to_vec(),
        diagnostics: stack(Axis(0), &diagnostics)?,
        samples: stack(Axis(0), &samples)?,
    })
}

/// Convert the raw chain output of a model and save the result.
pub fn ingest_model(
    files: &ModelFiles,
    settings: &IngestSettings,
) -> Result<IngestedDraws, IngestError> {
    let chains = read_chains(files, settings)?;
    let draws = split_chains(&chains, settings)?;
    draws.save(files)?;
    info!(
        model = files.id(),
        samples = ?draws.samples.shape(),
        diagnostics = ?draws.diagnostics.shape(),
        "saved reference draws"
    );
    Ok(draws)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use pretty_assertions::assert_eq;

    fn chain(csv: &str) -> Result<ChainTable, IngestError> {
        read_chain(csv.as_bytes(), Path::new("chain.csv"))
    }

    #[test]
    fn classify() {
        assert_eq!(
            classify_row(&StringRecord::from(vec!["lp__", "mu"])),
            RowKind::Header
        );
        assert_eq!(
            classify_row(&StringRecord::from(vec!["-1.5", "2e3", "nan"])),
            RowKind::Values
        );
        assert_eq!(
            classify_row(&StringRecord::from(vec!["1.0", "x"])),
            RowKind::Header
        );
    }

    #[test]
    fn comments_and_header() -> anyhow::Result<()> {
        let table = chain(
            "# model = test\n\
             lp__,accept_stat__,mu\n\
             # Adaptation terminated\n\
             -1.0,0.9,0.5\n\
             -2.0,0.8,-0.5\n",
        )?;
        assert_eq!(table.header, vec!["lp__", "accept_stat__", "mu"]);
        assert_eq!(table.rows, arr2(&[[-1.0, 0.9, 0.5], [-2.0, 0.8, -0.5]]));
        Ok(())
    }

    #[test]
    fn header_only() -> anyhow::Result<()> {
        let table = chain("a,b\n")?;
        assert_eq!(table.rows.dim(), (0, 2));
        Ok(())
    }

    #[test]
    fn missing_header() {
        assert!(matches!(
            chain("1.0,2.0\n3.0,4.0\n"),
            Err(IngestError::MissingHeader { .. })
        ));
        assert!(matches!(
            chain("# only comments\n"),
            Err(IngestError::MissingHeader { .. })
        ));
    }

    #[test]
    fn malformed_rows_are_errors() {
        let err = chain("a,b\n1.0,2.0\n1.0,oops\n").unwrap_err();
        match err {
            IngestError::Parse { line, field, .. } => {
                assert_eq!(line, 3);
                assert_eq!(field, "oops");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(matches!(
            chain("a,b\n1.0,2.0\na,b\n"),
            Err(IngestError::Parse { .. })
        ));
        assert!(matches!(
            chain("a,b\n1.0,2.0,3.0\n"),
            Err(IngestError::RaggedRow {
                expected: 2,
                found: 3,
                ..
            })
        ));
    }

    fn table(header: &[&str], rows: usize, offset: f64) -> ChainTable {
        let cols = header.len();
        ChainTable {
            header: header.iter().map(|s| s.to_string()).collect(),
            rows: Array2::from_shape_fn((rows, cols), |(i, j)| offset + (i * cols + j) as f64),
        }
    }

    #[test]
    fn thinning_keeps_first_row() {
        let t = table(&["a", "b"], 7, 0.);
        let thinned = t.thinned(3);
        assert_eq!(thinned, arr2(&[[0., 1.], [6., 7.], [12., 13.]]));
        assert_eq!(t.thinned(0).nrows(), 7);
        assert_eq!(t.thinned(usize::MAX), arr2(&[[0., 1.]]));
        assert_eq!(t.thinned(isize::MAX as usize + 2), arr2(&[[0., 1.]]));
    }

    #[test]
    fn split() -> anyhow::Result<()> {
        let header = ["lp__", "stepsize__", "mu", "tau"];
        let chains = vec![table(&header, 4, 0.), table(&header, 4, 100.)];
        let settings = IngestSettings::default().with_thin(2).with_skip_cols(2);
        let draws = split_chains(&chains, &settings)?;
        assert_eq!(draws.diagnostic_names, vec!["lp__", "stepsize__"]);
        assert_eq!(draws.parameter_names, vec!["mu", "tau"]);
        assert_eq!(draws.samples.shape(), &[2, 2, 2]);
        assert_eq!(draws.diagnostics.shape(), &[2, 2, 2]);
        assert_eq!(draws.samples[[0, 1, 0]], 10.);
        assert_eq!(draws.samples[[1, 0, 1]], 103.);
        assert_eq!(draws.diagnostics[[1, 1, 0]], 108.);
        Ok(())
    }

    #[test]
    fn split_errors() {
        let settings = IngestSettings::default().with_skip_cols(2);
        assert!(matches!(
            split_chains(&[], &settings),
            Err(IngestError::NoChains)
        ));
        assert!(matches!(
            split_chains(&[table(&["a", "b"], 3, 0.)], &settings),
            Err(IngestError::TooFewColumns { .. })
        ));
        let chains = vec![table(&["a", "b", "c"], 3, 0.), table(&["a", "b", "d"], 3, 0.)];
        assert!(matches!(
            split_chains(&chains, &settings),
            Err(IngestError::HeaderMismatch { chain: 1 })
        ));
        let chains = vec![table(&["a", "b", "c"], 30, 0.), table(&["a", "b", "c"], 20, 0.)];
        assert!(matches!(
            split_chains(&chains, &settings),
            Err(IngestError::Shape(_))
        ));
    }
}
