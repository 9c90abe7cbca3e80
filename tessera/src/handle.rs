use std::ops::Range;
use std::sync::Arc;

use tessera_error::TesseraResult;
use tessera_io::{ColumnSelection, DatasetInfo};

use crate::{Reader, Request, RequestFuture, Selection, Stage, StagePool, StageTarget};

/// A dataset opened through a [`Reader`], for building requests and the stages they land in.
#[derive(Debug, Clone)]
pub struct DatasetHandle<'r> {
    reader: &'r Reader,
    info: DatasetInfo,
}

impl<'r> DatasetHandle<'r> {
    pub(crate) fn new(reader: &'r Reader, info: DatasetInfo) -> Self {
        Self { reader, info }
    }

    pub fn info(&self) -> &DatasetInfo {
        &self.info
    }

    pub fn path(&self) -> &str {
        self.info.path()
    }

    pub fn row_count(&self) -> u64 {
        self.info.row_count()
    }

    /// The natural shape of the dataset under `columns`.
    pub fn shape(&self, columns: &ColumnSelection) -> TesseraResult<Vec<u64>> {
        self.info.shape(columns)
    }

    pub fn itemsize(&self, columns: &ColumnSelection) -> TesseraResult<usize> {
        self.info.itemsize(columns)
    }

    /// Every `step`-th row in `start..stop`.
    pub fn read(&self, start: u64, stop: u64, step: u64) -> Request {
        self.request_for(Selection::Rows { start, stop, step })
    }

    pub fn row(&self, row: u64) -> Request {
        self.read(row, row.saturating_add(1), 1)
    }

    pub fn slice(&self, rows: Range<u64>) -> Request {
        self.read(rows.start, rows.end, 1)
    }

    /// The listed rows, in the listed order.
    pub fn coordinates(&self, rows: impl IntoIterator<Item = u64>) -> Request {
        self.request_for(Selection::Coordinates(rows.into_iter().collect::<Arc<[u64]>>()))
    }

    /// The rows of `first` followed by the rows of `second`.
    pub fn joined(&self, first: Range<u64>, second: Range<u64>) -> Request {
        self.request_for(Selection::Joined(first, second))
    }

    fn request_for(&self, selection: Selection) -> Request {
        Request::new(self.info.clone(), selection)
    }

    /// Allocates a stage from the reader's arena.
    ///
    /// Dimensions missing from `shape`, or given as `None`, are taken from the dataset's natural
    /// shape, so `&[Some(n)]` sizes a stage for `n` rows.
    pub fn create_stage(
        &self,
        shape: &[Option<u64>],
        columns: &ColumnSelection,
    ) -> TesseraResult<Stage> {
        let shape = self.info.fill_shape(shape, columns)?;
        Stage::new(self.reader.arena(), &shape, self.itemsize(columns)?)
    }

    /// A stage with room for `rows` rows of the selected columns.
    pub fn create_stage_rows(&self, rows: u64, columns: &ColumnSelection) -> TesseraResult<Stage> {
        self.create_stage(&[Some(rows)], columns)
    }

    /// A pool of `count` stages, each shaped as [`create_stage`][Self::create_stage] would.
    pub fn create_stage_pool(
        &self,
        shape: &[Option<u64>],
        columns: &ColumnSelection,
        count: usize,
    ) -> TesseraResult<StagePool> {
        let shape = self.info.fill_shape(shape, columns)?;
        StagePool::new(self.reader.arena(), &shape, self.itemsize(columns)?, count)
    }

    /// Schedules `request` on the reader this handle came from.
    pub fn request(
        &self,
        request: &Request,
        target: &dyn StageTarget,
    ) -> TesseraResult<RequestFuture> {
        self.reader.request(request, target)
    }
}
