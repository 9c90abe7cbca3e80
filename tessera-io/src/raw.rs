use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;
use parking_lot::RwLock;
use tessera_error::{TesseraResult, tessera_bail, tessera_err};

use crate::{ColumnSelection, Dataset, DatasetSource, RowLayout, check_read};

#[derive(Debug, Clone)]
struct RawEntry {
    file: PathBuf,
    layout: RowLayout,
    chunk_rows: Option<u64>,
}

/// A [`DatasetSource`] over headerless row-major files.
///
/// Each dataset path is registered against a file and a row layout. Every [`open`][Self::open]
/// maps the file afresh, so workers never share a file descriptor.
#[derive(Default)]
pub struct RawFileSource {
    entries: RwLock<HashMap<String, RawEntry>>,
}

impl RawFileSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `file` as the dataset at `path`.
    pub fn register(
        &self,
        path: impl Into<String>,
        file: impl AsRef<Path>,
        layout: RowLayout,
        chunk_rows: Option<u64>,
    ) {
        self.entries.write().insert(
            path.into(),
            RawEntry {
                file: file.as_ref().to_path_buf(),
                layout,
                chunk_rows,
            },
        );
    }
}

impl Debug for RawFileSource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawFileSource")
            .field("entries", &*self.entries.read())
            .finish()
    }
}

impl DatasetSource for RawFileSource {
    fn open(&self, path: &str) -> TesseraResult<Box<dyn Dataset>> {
        let entry = self
            .entries
            .read()
            .get(path)
            .cloned()
            .ok_or_else(|| tessera_err!(DatasetRead: "no dataset registered at {path}"))?;
        Ok(Box::new(RawFileDataset::open(entry)?))
    }
}

struct RawFileDataset {
    // Zero-length files are not mapped.
    map: Option<Mmap>,
    layout: RowLayout,
    rows: u64,
    chunk_rows: Option<u64>,
}

impl RawFileDataset {
    fn open(entry: RawEntry) -> TesseraResult<Self> {
        let RawEntry {
            file,
            layout,
            chunk_rows,
        } = entry;
        let row_nbytes = layout.row_nbytes() as u64;
        if row_nbytes == 0 {
            tessera_bail!("rows of a dataset must occupy at least one byte");
        }

        let handle = File::open(&file)
            .map_err(|e| tessera_err!(DatasetRead: "opening {}: {e}", file.display()))?;
        let len = handle.metadata()?.len();
        if len % row_nbytes != 0 {
            tessera_bail!(
                DatasetRead: "{} holds {len} bytes, not a whole number of {row_nbytes} byte rows",
                file.display()
            );
        }

        let map = if len == 0 {
            None
        } else {
            // SAFETY: the mapping is read-only and the file is treated as immutable while open.
            let map = unsafe { Mmap::map(&handle) }
                .map_err(|e| tessera_err!(DatasetRead: "mapping {}: {e}", file.display()))?;
            #[cfg(unix)]
            if let Err(e) = map.advise(memmap2::Advice::Sequential) {
                log::debug!("madvise on {} failed: {e}", file.display());
            }
            Some(map)
        };

        Ok(Self {
            map,
            layout,
            rows: len / row_nbytes,
            chunk_rows,
        })
    }
}

impl Dataset for RawFileDataset {
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
        let Some(map) = self.map.as_ref() else {
            return Ok(0);
        };
        let row_nbytes = self.layout.row_nbytes();
        let start = usize::try_from(row_start)
            .map_err(|_| tessera_err!(DatasetRead: "row {row_start} is not addressable"))?
            * row_nbytes;
        let end = start + row_count as usize * row_nbytes;
        self.layout.copy_selected(&map[start..end], columns, out)
    }
}
