use std::sync::Arc;

use tessera_error::TesseraResult;
use tessera_io::{ColumnSelection, DatasetInfo, DatasetSource, SharedArena};

use crate::plan::default_block_size;
use crate::stream::read_remainder;
use crate::{BlockPlan, OwnedRows, RowGenerator, RowGeneratorOptions, StreamOptions, StreamQueue};

/// Entry point for streaming the datasets of one source through one arena.
#[derive(Debug, Clone)]
pub struct Streamer {
    source: Arc<dyn DatasetSource>,
    arena: Arc<dyn SharedArena>,
}

impl Streamer {
    pub fn new(source: Arc<dyn DatasetSource>, arena: Arc<dyn SharedArena>) -> Self {
        Self { source, arena }
    }

    pub fn info(&self, path: &str) -> TesseraResult<DatasetInfo> {
        DatasetInfo::load(self.source.as_ref(), path)
    }

    /// Starts streaming the blocks of `path`.
    pub fn queue(&self, path: &str, options: StreamOptions) -> TesseraResult<StreamQueue> {
        StreamQueue::open(self.source.clone(), self.arena.as_ref(), path, options)
    }

    /// Starts streaming the rows of `path` one at a time.
    pub fn rows(&self, path: &str, options: RowGeneratorOptions) -> TesseraResult<RowGenerator> {
        RowGenerator::open(self.source.clone(), self.arena.as_ref(), path, options)
    }

    /// Reads the rows a non-cyclic stream of `path` with this block size would leave out,
    /// without starting one.
    pub fn remainder(
        &self,
        path: &str,
        block_size: Option<u64>,
        columns: &ColumnSelection,
    ) -> TesseraResult<Option<OwnedRows>> {
        let info = self.info(path)?;
        let row_nbytes = info.layout().selection_nbytes(columns)?;
        let block_size = block_size.unwrap_or_else(|| default_block_size(&info, row_nbytes));
        let plan = BlockPlan::new(info.row_count(), block_size, false)?;
        read_remainder(self.source.as_ref(), &info, &plan, columns)
    }
}
