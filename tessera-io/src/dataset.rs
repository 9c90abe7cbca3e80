use std::fmt::Debug;
use std::sync::Arc;

use tessera_error::{TesseraResult, tessera_bail};

use crate::{ColumnSelection, RowLayout};

/// An open handle onto one row-oriented dataset.
///
/// Handles are not shared between workers: every worker opens its own through a
/// [`DatasetSource`], so implementations may keep per-handle state such as file cursors or
/// decompression scratch space.
pub trait Dataset: Send {
    /// The number of rows in the dataset.
    fn row_count(&self) -> u64;

    /// The byte layout of one row.
    fn layout(&self) -> &RowLayout;

    /// The number of rows per storage chunk, if the dataset is chunked.
    fn chunk_rows(&self) -> Option<u64>;

    /// Reads `row_count` consecutive rows starting at `row_start` into `out`, producing only the
    /// selected columns. Returns the number of bytes written.
    ///
    /// Fails with [`DatasetRead`][tessera_error::TesseraError::DatasetRead] on I/O failure or when
    /// the rows lie outside the dataset.
    fn read_rows(
        &mut self,
        row_start: u64,
        row_count: u64,
        columns: &ColumnSelection,
        out: &mut [u8],
    ) -> TesseraResult<usize>;
}

/// Opens [`Dataset`] handles by path.
pub trait DatasetSource: Debug + Send + Sync + 'static {
    fn open(&self, path: &str) -> TesseraResult<Box<dyn Dataset>>;
}

/// The static description of a dataset: its path, length and row layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetInfo {
    path: Arc<str>,
    row_count: u64,
    layout: RowLayout,
    chunk_rows: Option<u64>,
}

impl DatasetInfo {
    /// Opens the dataset once to capture its description.
    pub fn load(source: &dyn DatasetSource, path: &str) -> TesseraResult<Self> {
        let dataset = source.open(path)?;
        Ok(Self::of(path, dataset.as_ref()))
    }

    pub fn of(path: impl Into<Arc<str>>, dataset: &dyn Dataset) -> Self {
        Self {
            path: path.into(),
            row_count: dataset.row_count(),
            layout: dataset.layout().clone(),
            chunk_rows: dataset.chunk_rows(),
        }
    }

    pub fn path(&self) -> &Arc<str> {
        &self.path
    }

    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    pub fn layout(&self) -> &RowLayout {
        &self.layout
    }

    pub fn chunk_rows(&self) -> Option<u64> {
        self.chunk_rows
    }

    /// The natural shape of the dataset under a column selection: the row count followed by the
    /// per-row dimensions.
    pub fn shape(&self, columns: &ColumnSelection) -> TesseraResult<Vec<u64>> {
        let (dims, _) = self.layout.item_shape(columns)?;
        Ok(std::iter::once(self.row_count).chain(dims).collect())
    }

    /// The size of one item of [`DatasetInfo::shape`].
    pub fn itemsize(&self, columns: &ColumnSelection) -> TesseraResult<usize> {
        Ok(self.layout.item_shape(columns)?.1)
    }

    /// Completes a partial shape with the dimensions of this dataset.
    ///
    /// Missing trailing dimensions, and dimensions given as `None`, are taken from
    /// [`DatasetInfo::shape`].
    pub fn fill_shape(
        &self,
        partial: &[Option<u64>],
        columns: &ColumnSelection,
    ) -> TesseraResult<Vec<u64>> {
        let natural = self.shape(columns)?;
        if partial.len() > natural.len() {
            tessera_bail!(
                OutOfBounds: "shape has {} dimensions but dataset {} has {}",
                partial.len(),
                self.path,
                natural.len()
            );
        }
        Ok(natural
            .iter()
            .enumerate()
            .map(|(idx, dim)| partial.get(idx).copied().flatten().unwrap_or(*dim))
            .collect())
    }
}

/// Checks a read against the dataset extent and the output buffer, returning the number of
/// bytes the read will produce.
pub fn check_read(
    layout: &RowLayout,
    total_rows: u64,
    row_start: u64,
    row_count: u64,
    columns: &ColumnSelection,
    out_len: usize,
) -> TesseraResult<usize> {
    let end = row_start.checked_add(row_count);
    if end.is_none_or(|end| end > total_rows) {
        tessera_bail!(
            DatasetRead: "rows {row_start}..{} are outside the dataset of {total_rows} rows",
            row_start.saturating_add(row_count)
        );
    }
    let width = layout.selection_nbytes(columns)?;
    let nbytes = usize::try_from(row_count)
        .ok()
        .and_then(|rows| rows.checked_mul(width));
    match nbytes {
        Some(nbytes) if nbytes <= out_len => Ok(nbytes),
        _ => tessera_bail!(
            DatasetRead: "{row_count} rows of {width} bytes do not fit a {out_len} byte buffer"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ElementType, Field, MemoryDataset};

    fn info() -> DatasetInfo {
        let layout = RowLayout::array(ElementType::F32, &[3, 2]);
        let dataset = MemoryDataset::try_new(layout, vec![0u8; 24 * 10]).unwrap();
        DatasetInfo::of("/grid", &dataset)
    }

    #[test]
    fn natural_shape() {
        assert_eq!(info().shape(&ColumnSelection::All).unwrap(), vec![10, 3, 2]);
        assert_eq!(info().itemsize(&ColumnSelection::All).unwrap(), 4);
    }

    #[test]
    fn fill_partial_shapes() {
        let info = info();
        let all = ColumnSelection::All;
        assert_eq!(info.fill_shape(&[Some(4)], &all).unwrap(), vec![4, 3, 2]);
        assert_eq!(
            info.fill_shape(&[None, Some(1)], &all).unwrap(),
            vec![10, 1, 2]
        );
        assert!(info.fill_shape(&[Some(1); 4], &all).is_err());
    }

    #[test]
    fn table_column_shape() {
        let layout = RowLayout::table([
            Field::new("a", ElementType::U8, &[]),
            Field::new("b", ElementType::I64, &[4]),
        ])
        .unwrap();
        let dataset = MemoryDataset::try_new(layout, vec![0u8; 33 * 2]).unwrap();
        let info = DatasetInfo::of("/t", &dataset);
        assert_eq!(info.shape(&ColumnSelection::All).unwrap(), vec![2]);
        assert_eq!(info.itemsize(&ColumnSelection::All).unwrap(), 33);
        assert_eq!(
            info.shape(&ColumnSelection::field("b")).unwrap(),
            vec![2, 4]
        );
    }

    #[test]
    fn read_checks() {
        let layout = RowLayout::array(ElementType::U8, &[2]);
        assert_eq!(
            check_read(&layout, 10, 8, 2, &ColumnSelection::All, 4).unwrap(),
            4
        );
        assert!(check_read(&layout, 10, 9, 2, &ColumnSelection::All, 4).is_err());
        assert!(check_read(&layout, 10, 0, 3, &ColumnSelection::All, 4).is_err());
    }
}
