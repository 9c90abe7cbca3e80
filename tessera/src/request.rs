use std::ops::Range;
use std::sync::Arc;

use tessera_error::{TesseraResult, tessera_bail, tessera_err};
use tessera_io::{ColumnSelection, DEFAULT_BLOCK_NBYTES, Dataset, DatasetInfo};

/// Which rows of a dataset a [`Request`] reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Every `step`-th row from `start` up to, but excluding, `stop`.
    Rows { start: u64, stop: u64, step: u64 },
    /// The listed rows, in the listed order.
    Coordinates(Arc<[u64]>),
    /// The rows of the first range followed by the rows of the second, as read across the end of
    /// a dataset.
    Joined(Range<u64>, Range<u64>),
}

/// An immutable description of a read: a dataset, a row selection and a column selection.
///
/// Requests are built through [`DatasetHandle`][crate::DatasetHandle] and are pure data until
/// handed to [`Reader::request`][crate::Reader::request].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    info: DatasetInfo,
    selection: Selection,
    columns: ColumnSelection,
}

impl Request {
    pub fn new(info: DatasetInfo, selection: Selection) -> Self {
        Self {
            info,
            selection,
            columns: ColumnSelection::All,
        }
    }

    /// Restricts the request to one field of a table.
    pub fn column(mut self, name: impl Into<Arc<str>>) -> Self {
        self.columns = ColumnSelection::field(name);
        self
    }

    pub fn with_columns(mut self, columns: ColumnSelection) -> Self {
        self.columns = columns;
        self
    }

    pub fn path(&self) -> &str {
        self.info.path()
    }

    pub fn info(&self) -> &DatasetInfo {
        &self.info
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn columns(&self) -> &ColumnSelection {
        &self.columns
    }

    /// The shape of the result: the number of selected rows followed by the per-row dimensions.
    pub fn shape(&self) -> TesseraResult<Vec<u64>> {
        Ok(self.resolve()?.shape)
    }

    /// The size of the result in bytes.
    pub fn nbytes(&self) -> TesseraResult<usize> {
        Ok(self.resolve()?.nbytes)
    }

    /// Translates the selection into contiguous dataset reads, checking it against the dataset.
    pub(crate) fn resolve(&self) -> TesseraResult<ResolvedRequest> {
        let total = self.info.row_count();
        let check = |range: &Range<u64>| -> TesseraResult<()> {
            if range.start > range.end || range.end > total {
                tessera_bail!(
                    OutOfBounds: "rows {}..{} are outside {} of {total} rows",
                    range.start,
                    range.end,
                    self.info.path()
                );
            }
            Ok(())
        };

        let reads = match &self.selection {
            Selection::Rows { start, stop, step } => {
                check(&(*start..*stop))?;
                match *step {
                    0 => tessera_bail!("row step must be at least one"),
                    1 if start < stop => vec![ReadOp::Contiguous(*start..*stop)],
                    1 => vec![],
                    step => vec![ReadOp::Strided {
                        start: *start,
                        count: (stop - start).div_ceil(step),
                        step,
                    }],
                }
            }
            Selection::Coordinates(rows) => {
                let mut reads: Vec<ReadOp> = Vec::new();
                for row in rows.iter() {
                    check(&(*row..row.saturating_add(1)))?;
                    match reads.last_mut() {
                        Some(ReadOp::Contiguous(run)) if run.end == *row => run.end += 1,
                        _ => reads.push(ReadOp::Contiguous(*row..row + 1)),
                    }
                }
                reads
            }
            Selection::Joined(first, second) => {
                check(first)?;
                check(second)?;
                [first, second]
                    .into_iter()
                    .filter(|range| !range.is_empty())
                    .map(|range| ReadOp::Contiguous(range.clone()))
                    .collect()
            }
        };

        let rows: u64 = reads.iter().map(ReadOp::rows).sum();
        let row_nbytes = self.info.layout().selection_nbytes(&self.columns)?;
        let nbytes = usize::try_from(rows)
            .ok()
            .and_then(|rows| rows.checked_mul(row_nbytes))
            .ok_or_else(|| tessera_err!(OutOfBounds: "{rows} rows do not fit in memory"))?;
        let mut shape = self.info.shape(&self.columns)?;
        if let Some(first) = shape.first_mut() {
            *first = rows;
        }

        Ok(ResolvedRequest {
            reads,
            row_nbytes,
            nbytes,
            shape,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ReadOp {
    Contiguous(Range<u64>),
    Strided { start: u64, count: u64, step: u64 },
}

impl ReadOp {
    fn rows(&self) -> u64 {
        match self {
            ReadOp::Contiguous(range) => range.end - range.start,
            ReadOp::Strided { count, .. } => *count,
        }
    }
}

/// A request checked against its dataset and broken into reads.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedRequest {
    pub reads: Vec<ReadOp>,
    pub row_nbytes: usize,
    pub nbytes: usize,
    pub shape: Vec<u64>,
}

impl ResolvedRequest {
    /// Performs the reads into `out`, returning the number of bytes written.
    pub fn execute(
        &self,
        dataset: &mut dyn Dataset,
        columns: &ColumnSelection,
        out: &mut [u8],
    ) -> TesseraResult<usize> {
        let mut offset = 0;
        for read in &self.reads {
            offset += match read {
                ReadOp::Contiguous(range) => dataset.read_rows(
                    range.start,
                    range.end - range.start,
                    columns,
                    &mut out[offset..],
                )?,
                ReadOp::Strided { start, count, step } => self.read_strided(
                    dataset,
                    columns,
                    (*start, *count, *step),
                    &mut out[offset..],
                )?,
            };
        }
        Ok(offset)
    }

    /// Reads windows of consecutive rows into scratch space and keeps every `step`-th row.
    fn read_strided(
        &self,
        dataset: &mut dyn Dataset,
        columns: &ColumnSelection,
        (start, count, step): (u64, u64, u64),
        out: &mut [u8],
    ) -> TesseraResult<usize> {
        let width = self.row_nbytes;
        let stride = step.saturating_mul(width.max(1) as u64);
        let per_window = (DEFAULT_BLOCK_NBYTES as u64 / stride).max(1);
        let mut scratch = Vec::new();
        let mut done = 0;
        while done < count {
            let picked = per_window.min(count - done);
            let first = start + done * step;
            let span = (picked - 1) * step + 1;
            scratch.resize(span as usize * width, 0);
            dataset.read_rows(first, span, columns, &mut scratch)?;

            let dst = &mut out[done as usize * width..(done + picked) as usize * width];
            for (row, target) in scratch
                .chunks_exact(width)
                .step_by(step as usize)
                .zip(dst.chunks_exact_mut(width))
            {
                target.copy_from_slice(row);
            }
            done += picked;
        }
        Ok(count as usize * width)
    }
}
