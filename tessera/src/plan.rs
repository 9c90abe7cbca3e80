use tessera_error::{TesseraResult, tessera_bail};
use tessera_io::{DEFAULT_BLOCK_NBYTES, DatasetInfo};

/// A contiguous run of dataset rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u64,
    pub rows: u64,
}

/// How a dataset of `rows` rows is cut into blocks of `block_size` rows.
///
/// Block `b` below [`full_blocks`][Self::full_blocks] covers rows `b * block_size` up to
/// `(b + 1) * block_size`. When the row count leaves a remainder, a cyclic plan adds one more
/// block that wraps around the end of the dataset: the remainder rows followed by the first
/// `block_size - remainder` rows. A non-cyclic plan leaves the remainder out of the block
/// sequence, unless built [`with_remainder_block`][Self::with_remainder_block], in which case the
/// remainder is one last, shorter block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPlan {
    rows: u64,
    block_size: u64,
    cyclic: bool,
    remainder_block: bool,
}

impl BlockPlan {
    /// Block sizes larger than the dataset are clamped to its row count.
    pub fn new(rows: u64, block_size: u64, cyclic: bool) -> TesseraResult<Self> {
        if rows == 0 {
            tessera_bail!(OutOfBounds: "cannot stream a dataset with no rows");
        }
        if block_size == 0 {
            tessera_bail!("block size must be at least one row");
        }
        Ok(Self {
            rows,
            block_size: block_size.min(rows),
            cyclic,
            remainder_block: false,
        })
    }

    /// Streams the remainder of a non-cyclic plan as a final block. Cyclic plans ignore this.
    pub fn with_remainder_block(mut self, remainder_block: bool) -> Self {
        self.remainder_block = remainder_block && !self.cyclic;
        self
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn is_cyclic(&self) -> bool {
        self.cyclic
    }

    pub fn has_remainder_block(&self) -> bool {
        self.remainder_block && self.remainder_rows() > 0
    }

    pub fn full_blocks(&self) -> u64 {
        self.rows / self.block_size
    }

    pub fn remainder_rows(&self) -> u64 {
        self.rows % self.block_size
    }

    /// The number of distinct blocks: also the period of block indices in cyclic mode.
    pub fn total_blocks(&self) -> u64 {
        if self.cyclic || self.remainder_block {
            self.rows.div_ceil(self.block_size)
        } else {
            self.full_blocks()
        }
    }

    /// The block index delivered under sequence number `seq`.
    pub fn block_index(&self, seq: u64) -> u64 {
        if self.cyclic {
            seq % self.total_blocks()
        } else {
            seq
        }
    }

    /// The row spans that make up block `index`, in delivery order.
    pub fn spans(&self, index: u64) -> impl Iterator<Item = Span> + use<> {
        let full = self.full_blocks();
        let (head, tail) = if index < full {
            let start = index * self.block_size;
            let head = Span {
                start,
                rows: self.block_size,
            };
            (head, None)
        } else if !self.cyclic {
            let head = Span {
                start: full * self.block_size,
                rows: self.remainder_rows(),
            };
            (head, None)
        } else {
            let rem = self.remainder_rows();
            let head = Span {
                start: full * self.block_size,
                rows: rem,
            };
            let tail = Span {
                start: 0,
                rows: self.block_size - rem,
            };
            (head, Some(tail))
        };
        std::iter::once(head).chain(tail)
    }

    /// The trailing rows not covered by any block, which only non-cyclic plans without a
    /// remainder block have.
    pub fn remainder(&self) -> Option<Span> {
        let rows = self.remainder_rows();
        (!self.cyclic && !self.remainder_block && rows > 0).then(|| Span {
            start: self.full_blocks() * self.block_size,
            rows,
        })
    }
}

/// The chunk size of the dataset if it has one, otherwise as many rows as fit in
/// [`DEFAULT_BLOCK_NBYTES`].
pub(crate) fn default_block_size(info: &DatasetInfo, row_nbytes: usize) -> u64 {
    info.chunk_rows()
        .filter(|rows| *rows > 0)
        .unwrap_or_else(|| (DEFAULT_BLOCK_NBYTES / row_nbytes.max(1)).max(1) as u64)
        .min(info.row_count())
        .max(1)
}
