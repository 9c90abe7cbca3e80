use std::collections::HashMap;
use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use parking_lot::RwLock;
use tessera_error::{TesseraResult, tessera_bail, tessera_err};

use crate::{ColumnSelection, Dataset, DatasetSource, RowLayout, check_read};

/// A dataset held entirely in memory.
///
/// Cloning is cheap and clones share the underlying bytes, which makes this the natural
/// back end for tests and for embedding small lookup tables.
#[derive(Clone)]
pub struct MemoryDataset {
    layout: RowLayout,
    data: Bytes,
    rows: u64,
    chunk_rows: Option<u64>,
}

impl MemoryDataset {
    /// Wraps row-major bytes. The length must be a whole number of rows.
    pub fn try_new(layout: RowLayout, data: impl Into<Bytes>) -> TesseraResult<Self> {
        let data = data.into();
        let row_nbytes = layout.row_nbytes();
        if row_nbytes == 0 {
            tessera_bail!("rows of a dataset must occupy at least one byte");
        }
        if data.len() % row_nbytes != 0 {
            tessera_bail!(
                "{} bytes are not a whole number of {row_nbytes} byte rows",
                data.len()
            );
        }
        Ok(Self {
            rows: (data.len() / row_nbytes) as u64,
            layout,
            data,
            chunk_rows: None,
        })
    }

    /// Declares the chunk geometry reported by [`Dataset::chunk_rows`].
    pub fn with_chunk_rows(mut self, chunk_rows: u64) -> Self {
        self.chunk_rows = Some(chunk_rows);
        self
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }
}

impl Debug for MemoryDataset {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDataset")
            .field("layout", &self.layout)
            .field("rows", &self.rows)
            .field("chunk_rows", &self.chunk_rows)
            .finish()
    }
}

impl Dataset for MemoryDataset {
    fn row_count(&self) -> u64 {
        self.rows
    }

    fn layout(&self) -> &RowLayout {
        &self.layout
    }

    fn chunk_rows(&self) -> Option<u64> {
        self.chunk_rows
    }

    fn read_rows(
        &mut self,
        row_start: u64,
        row_count: u64,
        columns: &ColumnSelection,
        out: &mut [u8],
    ) -> TesseraResult<usize> {
        check_read(
            &self.layout,
            self.rows,
            row_start,
            row_count,
            columns,
            out.len(),
        )?;
        let row_nbytes = self.layout.row_nbytes();
        // Both bounds were checked against the row count, which fits the in-memory length.
        let start = row_start as usize * row_nbytes;
        let end = start + row_count as usize * row_nbytes;
        self.layout
            .copy_selected(&self.data[start..end], columns, out)
    }
}

/// A [`DatasetSource`] over a set of named in-memory datasets.
#[derive(Default)]
pub struct MemorySource {
    datasets: RwLock<HashMap<String, MemoryDataset>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) the dataset at `path`.
    pub fn insert(&self, path: impl Into<String>, dataset: MemoryDataset) {
        self.datasets.write().insert(path.into(), dataset);
    }

    pub fn with_dataset(self, path: impl Into<String>, dataset: MemoryDataset) -> Self {
        self.insert(path, dataset);
        self
    }
}

impl Debug for MemorySource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemorySource")
            .field("paths", &self.datasets.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DatasetSource for MemorySource {
    fn open(&self, path: &str) -> TesseraResult<Box<dyn Dataset>> {
        let dataset = self
            .datasets
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| tessera_err!(DatasetRead: "no dataset at {path}"))?;
        Ok(Box::new(dataset))
    }
}
