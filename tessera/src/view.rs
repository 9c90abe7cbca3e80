use std::sync::Arc;

use bytes::Bytes;

/// A borrowed run of fixed-width rows.
#[derive(Debug, Clone, Copy)]
pub struct RowsView<'a> {
    data: &'a [u8],
    row_nbytes: usize,
}

impl<'a> RowsView<'a> {
    pub fn new(data: &'a [u8], row_nbytes: usize) -> Self {
        Self { data, row_nbytes }
    }

    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    pub fn row_nbytes(&self) -> usize {
        self.row_nbytes
    }

    pub fn rows(&self) -> usize {
        self.data.len().checked_div(self.row_nbytes).unwrap_or(0)
    }

    pub fn row(&self, idx: usize) -> Option<&'a [u8]> {
        let start = idx.checked_mul(self.row_nbytes)?;
        self.data.get(start..start.checked_add(self.row_nbytes)?)
    }

    pub fn iter(&self) -> std::slice::ChunksExact<'a, u8> {
        self.data.chunks_exact(self.row_nbytes.max(1))
    }
}

/// Rows copied out of shared memory into owned, reference-counted bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnedRows {
    data: Bytes,
    row_nbytes: usize,
    shape: Arc<[u64]>,
}

impl OwnedRows {
    pub fn new(data: Bytes, row_nbytes: usize, shape: impl Into<Arc<[u64]>>) -> Self {
        Self {
            data,
            row_nbytes,
            shape: shape.into(),
        }
    }

    /// The result shape: the row count followed by the per-row dimensions.
    pub fn shape(&self) -> &[u64] {
        &self.shape
    }

    pub fn bytes(&self) -> &Bytes {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    pub fn view(&self) -> RowsView<'_> {
        RowsView::new(&self.data, self.row_nbytes)
    }

    pub fn rows(&self) -> usize {
        self.view().rows()
    }

    /// Returns row `idx` as a cheap slice of the underlying bytes.
    pub fn row(&self, idx: usize) -> Option<Bytes> {
        let range = idx * self.row_nbytes..(idx + 1) * self.row_nbytes;
        (range.end <= self.data.len()).then(|| self.data.slice(range))
    }
}
