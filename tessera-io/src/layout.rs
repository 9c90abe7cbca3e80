use std::fmt::{Display, Formatter};
use std::sync::Arc;

use tessera_error::{TesseraResult, tessera_bail, tessera_err};

/// The primitive type of a single element within a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    Bool,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl ElementType {
    /// The number of bytes occupied by one element.
    pub const fn byte_width(&self) -> usize {
        match self {
            ElementType::Bool | ElementType::U8 | ElementType::I8 => 1,
            ElementType::U16 | ElementType::I16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
            ElementType::U64 | ElementType::I64 | ElementType::F64 => 8,
        }
    }
}

impl Display for ElementType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ElementType::Bool => "bool",
            ElementType::U8 => "u8",
            ElementType::U16 => "u16",
            ElementType::U32 => "u32",
            ElementType::U64 => "u64",
            ElementType::I8 => "i8",
            ElementType::I16 => "i16",
            ElementType::I32 => "i32",
            ElementType::I64 => "i64",
            ElementType::F32 => "f32",
            ElementType::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// A named, fixed-width column of a row: an element type repeated over a per-row shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    name: Arc<str>,
    element: ElementType,
    shape: Vec<usize>,
}

impl Field {
    pub fn new(name: impl Into<Arc<str>>, element: ElementType, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            element,
            shape: shape.to_vec(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn element(&self) -> ElementType {
        self.element
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Bytes occupied by this field within one row.
    pub fn nbytes(&self) -> usize {
        self.shape.iter().product::<usize>() * self.element.byte_width()
    }
}

/// Which columns of each row a read should produce.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum ColumnSelection {
    /// Every byte of every row.
    #[default]
    All,
    /// A single named field of a table.
    Field(Arc<str>),
}

impl ColumnSelection {
    pub fn field(name: impl Into<Arc<str>>) -> Self {
        Self::Field(name.into())
    }
}

/// The byte layout of one row of a dataset.
///
/// An array dataset has a single anonymous field holding an n-dimensional block of elements
/// per row. A table dataset is a record of named fields packed back to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowLayout {
    fields: Arc<[Field]>,
    offsets: Arc<[usize]>,
    row_nbytes: usize,
    table: bool,
}

impl RowLayout {
    /// A row of `shape` elements of type `element`.
    pub fn array(element: ElementType, shape: &[usize]) -> Self {
        let field = Field::new("", element, shape);
        let row_nbytes = field.nbytes();
        Self {
            fields: Arc::new([field]),
            offsets: Arc::new([0]),
            row_nbytes,
            table: false,
        }
    }

    /// A record of named fields. Field names must be unique and non-empty.
    pub fn table(fields: impl IntoIterator<Item = Field>) -> TesseraResult<Self> {
        let fields: Vec<Field> = fields.into_iter().collect();
        if fields.is_empty() {
            tessera_bail!("a table layout needs at least one field");
        }

        let mut offsets = Vec::with_capacity(fields.len());
        let mut row_nbytes = 0;
        for (idx, field) in fields.iter().enumerate() {
            if field.name().is_empty() {
                tessera_bail!("table field {idx} has an empty name");
            }
            if fields[..idx].iter().any(|f| f.name() == field.name()) {
                tessera_bail!("table field name {} is not unique", field.name());
            }
            offsets.push(row_nbytes);
            row_nbytes += field.nbytes();
        }

        Ok(Self {
            fields: fields.into(),
            offsets: offsets.into(),
            row_nbytes,
            table: true,
        })
    }

    pub fn is_table(&self) -> bool {
        self.table
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Bytes occupied by one full row.
    pub fn row_nbytes(&self) -> usize {
        self.row_nbytes
    }

    /// Looks up a table field by name, returning its byte offset within the row.
    pub fn field(&self, name: &str) -> TesseraResult<(usize, &Field)> {
        if !self.table {
            tessera_bail!("array datasets have no named columns, asked for {name}");
        }
        self.fields
            .iter()
            .zip(self.offsets.iter())
            .find(|(field, _)| field.name() == name)
            .map(|(field, offset)| (*offset, field))
            .ok_or_else(|| tessera_err!("column {name} is not in the dataset"))
    }

    /// Bytes produced per row by a read with the given column selection.
    pub fn selection_nbytes(&self, columns: &ColumnSelection) -> TesseraResult<usize> {
        match columns {
            ColumnSelection::All => Ok(self.row_nbytes),
            ColumnSelection::Field(name) => Ok(self.field(name)?.1.nbytes()),
        }
    }

    /// The trailing (per-row) dimensions and the size of one item for a column selection.
    ///
    /// Whole table rows are a single record item; everything else is measured in elements.
    pub fn item_shape(&self, columns: &ColumnSelection) -> TesseraResult<(Vec<u64>, usize)> {
        let field = match columns {
            ColumnSelection::All if self.table => return Ok((vec![], self.row_nbytes)),
            ColumnSelection::All => &self.fields[0],
            ColumnSelection::Field(name) => self.field(name)?.1,
        };
        Ok((
            field.shape().iter().map(|d| *d as u64).collect(),
            field.element().byte_width(),
        ))
    }

    /// Copies the selected columns of the full rows in `rows` into `out`, returning the number
    /// of bytes written.
    pub fn copy_selected(
        &self,
        rows: &[u8],
        columns: &ColumnSelection,
        out: &mut [u8],
    ) -> TesseraResult<usize> {
        if self.row_nbytes == 0 {
            return Ok(0);
        }
        let nrows = rows.len() / self.row_nbytes;
        let width = self.selection_nbytes(columns)?;
        let nbytes = nrows * width;
        if out.len() < nbytes {
            tessera_bail!(
                OutOfBounds: "output buffer holds {} bytes, {nrows} rows need {nbytes}",
                out.len()
            );
        }

        match columns {
            ColumnSelection::All => out[..nbytes].copy_from_slice(&rows[..nbytes]),
            ColumnSelection::Field(name) => {
                let (offset, _) = self.field(name)?;
                for (row, dst) in rows
                    .chunks_exact(self.row_nbytes)
                    .zip(out[..nbytes].chunks_exact_mut(width))
                {
                    dst.copy_from_slice(&row[offset..offset + width]);
                }
            }
        }
        Ok(nbytes)
    }
}
