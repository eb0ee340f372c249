//! Approximate nearest neighbour index over the candidate vectors.
//!
//! The index is persisted as the raw candidate vectors; the HNSW graph is rebuilt on load.

use hnsw_rs::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::instrument;

const MAGIC: [u8; 8] = *b"MTVECIDX";
const VERSION: u32 = 1;

const MAX_NB_CONNECTION: usize = 16;
const MAX_LAYER: usize = 16;
const EF_CONSTRUCTION: usize = 200;
const EF_SEARCH: usize = 64;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("Could not access index file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path:?} is not a valid index: {message}")]
    Corrupt { path: PathBuf, message: String },
    #[error("Vector {id} has dimension {actual}, expected {expected}")]
    InvalidVector {
        id: usize,
        expected: usize,
        actual: usize,
    },
    #[error("Query dimension {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

#[derive(Serialize, Deserialize)]
struct IndexFile {
    magic: [u8; 8],
    version: u32,
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchHit {
    /// Position of the candidate in the indexed vectors
    pub id: usize,
    /// L2 distance to the query
    pub distance: f32,
}

pub struct VectorIndex {
    hnsw: Hnsw<'static, f32, DistL2>,
    vectors: Vec<Vec<f32>>,
    dimension: usize,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("dimension", &self.dimension)
            .field("len", &self.vectors.len())
            .finish()
    }
}

impl VectorIndex {
    /// Build an index over `vectors`; the id of a vector is its position.
    pub fn build(dimension: usize, vectors: Vec<Vec<f32>>) -> Result<Self, IndexError> {
        if let Some((id, vector)) = vectors
            .iter()
            .enumerate()
            .find(|(_, vector)| vector.len() != dimension)
        {
            return Err(IndexError::InvalidVector {
                id,
                expected: dimension,
                actual: vector.len(),
            });
        }

        let hnsw = Hnsw::<f32, DistL2>::new(
            MAX_NB_CONNECTION,
            vectors.len().max(1),
            MAX_LAYER,
            EF_CONSTRUCTION,
            DistL2 {},
        );
        for (id, vector) in vectors.iter().enumerate() {
            hnsw.insert_slice((vector.as_slice(), id));
        }

        Ok(Self {
            hnsw,
            vectors,
            dimension,
        })
    }

    #[instrument(skip_all, fields(path = ?path))]
    pub fn load(path: &Path) -> Result<Self, IndexError> {
        let io_error = |source| IndexError::Io {
            path: path.to_path_buf(),
            source,
        };
        let corrupt = |message: String| IndexError::Corrupt {
            path: path.to_path_buf(),
            message,
        };

        let file = File::open(path).map_err(io_error)?;
        let index_file: IndexFile = bincode::deserialize_from(BufReader::new(file))
            .map_err(|err| corrupt(err.to_string()))?;

        if index_file.magic != MAGIC {
            return Err(corrupt("bad magic bytes".to_string()));
        }
        if index_file.version != VERSION {
            return Err(corrupt(format!(
                "unsupported version {}",
                index_file.version
            )));
        }

        let index = Self::build(index_file.dimension, index_file.vectors)
            .map_err(|err| corrupt(err.to_string()))?;
        tracing::info!(
            "Index dimensions: {}, {} vectors",
            index.dimension,
            index.len()
        );
        Ok(index)
    }

    pub fn persist(&self, path: &Path) -> Result<(), IndexError> {
        let io_error = |source: std::io::Error| IndexError::Io {
            path: path.to_path_buf(),
            source,
        };
        let file = File::create(path).map_err(io_error)?;

        let index_file = IndexFile {
            magic: MAGIC,
            version: VERSION,
            dimension: self.dimension,
            vectors: self.vectors.clone(),
        };
        let mut writer = BufWriter::new(file);
        bincode::serialize_into(&mut writer, &index_file).map_err(|err| match *err {
            bincode::ErrorKind::Io(source) => io_error(source),
            err => IndexError::Corrupt {
                path: path.to_path_buf(),
                message: err.to_string(),
            },
        })?;
        writer.flush().map_err(io_error)?;

        tracing::debug!("Persisted {} vectors to {path:?}", self.len());
        Ok(())
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn vector(&self, id: usize) -> Option<&[f32]> {
        self.vectors.get(id).map(Vec::as_slice)
    }

    /// The `k` nearest neighbours of `query`, closest first
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>, IndexError> {
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let mut hits: Vec<SearchHit> = self
            .hnsw
            .search(query, k, EF_SEARCH.max(k))
            .into_iter()
            .map(|neighbour| SearchHit {
                id: neighbour.d_id,
                distance: neighbour.distance,
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);

        Ok(hits)
    }
}
