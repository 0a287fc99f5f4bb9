//! Decoding of cell-encoded properties: `reg` address lists, fixed-stride cell arrays and
//! phandle reference lists.

use aero_fdt::{DeviceTree, NodeId};
use thiserror::Error;
use tracing::warn;

/// Bytes per cell.
pub const CELL_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CellError {
    #[error("property {prop:?} not found")]
    MissingProperty { prop: String },

    #[error("index {index} out of range for {prop:?} ({count} entries)")]
    IndexOutOfRange {
        prop: String,
        index: usize,
        count: usize,
    },

    #[error("{prop:?} is {len} bytes, not a multiple of its {stride}-byte entry size")]
    BadLength {
        prop: String,
        len: usize,
        stride: usize,
    },

    #[error("{cells}-cell values are not supported (maximum 2)")]
    UnsupportedWidth { cells: u32 },

    #[error("root node has no cell width context")]
    NoCellContext,

    #[error("parent node lacks {prop:?}")]
    MissingCellCount { prop: &'static str },

    #[error("{prop:?} decoded with a zero-cell stride")]
    ZeroStride { prop: String },
}

impl CellError {
    /// True for absent data (missing property, index past the end); false for malformed data.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            CellError::MissingProperty { .. } | CellError::IndexOutOfRange { .. }
        )
    }
}

/// Big-endian value of up to two cells.
pub fn read_cells(cells: &[u8], count: u32) -> Result<u64, CellError> {
    if count > 2 {
        return Err(CellError::UnsupportedWidth { cells: count });
    }
    let bytes = cells
        .get(..count as usize * CELL_SIZE)
        .ok_or_else(|| CellError::BadLength {
            prop: String::new(),
            len: cells.len(),
            stride: count as usize * CELL_SIZE,
        })?;
    Ok(bytes
        .chunks_exact(CELL_SIZE)
        .fold(0u64, |acc, cell| {
            (acc << 32) | u64::from(u32::from_be_bytes([cell[0], cell[1], cell[2], cell[3]]))
        }))
}

/// Decodes a whole property as one 1- or 2-cell number (e.g. `clock-frequency`).
pub fn read_number(tree: &DeviceTree, node: NodeId, prop: &str) -> Result<u64, CellError> {
    let bytes = tree
        .property(node, prop)
        .ok_or_else(|| CellError::MissingProperty { prop: prop.into() })?;
    if bytes.is_empty() || bytes.len() % CELL_SIZE != 0 {
        return Err(CellError::BadLength {
            prop: prop.into(),
            len: bytes.len(),
            stride: CELL_SIZE,
        });
    }
    read_cells(bytes, (bytes.len() / CELL_SIZE) as u32)
}

/// `#address-cells` / `#size-cells` in effect for a node's `reg`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CellWidths {
    pub address: u32,
    pub size: u32,
}

impl CellWidths {
    pub fn stride(self) -> usize {
        (self.address as usize + self.size as usize) * CELL_SIZE
    }
}

/// Widths declared by the node's parent. There are no defaults: a missing declaration is an
/// error.
pub fn cell_widths(tree: &DeviceTree, node: NodeId) -> Result<CellWidths, CellError> {
    let parent = tree.parent(node).ok_or(CellError::NoCellContext)?;
    let address = tree
        .prop_u32(parent, "#address-cells")
        .ok_or(CellError::MissingCellCount {
            prop: "#address-cells",
        })?;
    let size = tree
        .prop_u32(parent, "#size-cells")
        .ok_or(CellError::MissingCellCount {
            prop: "#size-cells",
        })?;
    Ok(CellWidths { address, size })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegEntry {
    pub address: u64,
    pub size: u64,
}

/// Validated view of a node's `reg` property.
struct RegList<'a> {
    bytes: &'a [u8],
    widths: CellWidths,
}

impl<'a> RegList<'a> {
    fn new(tree: &'a DeviceTree, node: NodeId) -> Result<Self, CellError> {
        let bytes = tree
            .property(node, "reg")
            .ok_or_else(|| CellError::MissingProperty { prop: "reg".into() })?;
        let widths = cell_widths(tree, node)?;
        for cells in [widths.address, widths.size] {
            if cells > 2 {
                return Err(CellError::UnsupportedWidth { cells });
            }
        }
        let stride = widths.stride();
        if stride == 0 {
            return Err(CellError::ZeroStride { prop: "reg".into() });
        }
        if bytes.len() % stride != 0 {
            return Err(CellError::BadLength {
                prop: "reg".into(),
                len: bytes.len(),
                stride,
            });
        }
        Ok(Self { bytes, widths })
    }

    fn len(&self) -> usize {
        self.bytes.len() / self.widths.stride()
    }

    fn get(&self, index: usize) -> Result<RegEntry, CellError> {
        let count = self.len();
        if index >= count {
            return Err(CellError::IndexOutOfRange {
                prop: "reg".into(),
                index,
                count,
            });
        }
        let entry = &self.bytes[index * self.widths.stride()..][..self.widths.stride()];
        let (address, size) = entry.split_at(self.widths.address as usize * CELL_SIZE);
        Ok(RegEntry {
            address: read_cells(address, self.widths.address)?,
            size: read_cells(size, self.widths.size)?,
        })
    }
}

/// Entry `index` of the node's `reg` property.
pub fn reg_entry(tree: &DeviceTree, node: NodeId, index: usize) -> Result<RegEntry, CellError> {
    RegList::new(tree, node)?.get(index)
}

/// Every `reg` entry in order; an absent `reg` yields an empty list.
pub fn reg_entries(tree: &DeviceTree, node: NodeId) -> Result<Vec<RegEntry>, CellError> {
    let list = match RegList::new(tree, node) {
        Ok(list) => list,
        Err(CellError::MissingProperty { .. }) => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };
    (0..list.len()).map(|index| list.get(index)).collect()
}

/// A property read as rows of `stride` cells.
#[derive(Debug, Clone, Copy)]
pub struct CellArray<'a> {
    prop: &'a str,
    bytes: &'a [u8],
    stride: usize,
}

impl<'a> CellArray<'a> {
    pub fn new(
        tree: &'a DeviceTree,
        node: NodeId,
        prop: &'a str,
        stride: u32,
    ) -> Result<Self, CellError> {
        let bytes = tree
            .property(node, prop)
            .ok_or_else(|| CellError::MissingProperty { prop: prop.into() })?;
        if stride == 0 {
            return Err(CellError::ZeroStride { prop: prop.into() });
        }
        let stride = stride as usize;
        if bytes.len() % (stride * CELL_SIZE) != 0 {
            return Err(CellError::BadLength {
                prop: prop.into(),
                len: bytes.len(),
                stride: stride * CELL_SIZE,
            });
        }
        Ok(Self {
            prop,
            bytes,
            stride,
        })
    }

    pub fn rows(&self) -> usize {
        self.bytes.len() / (self.stride * CELL_SIZE)
    }

    pub fn cell(&self, row: usize, column: usize) -> Result<u32, CellError> {
        if column >= self.stride {
            return Err(CellError::IndexOutOfRange {
                prop: self.prop.into(),
                index: column,
                count: self.stride,
            });
        }
        if row >= self.rows() {
            return Err(CellError::IndexOutOfRange {
                prop: self.prop.into(),
                index: row,
                count: self.rows(),
            });
        }
        let at = (row * self.stride + column) * CELL_SIZE;
        let cell = &self.bytes[at..at + CELL_SIZE];
        Ok(u32::from_be_bytes([cell[0], cell[1], cell[2], cell[3]]))
    }
}

/// Cell `column` of row `row` in `prop`, reading the property as rows of `stride` cells.
pub fn array_cell(
    tree: &DeviceTree,
    node: NodeId,
    prop: &str,
    row: usize,
    column: usize,
    stride: u32,
) -> Result<u32, CellError> {
    CellArray::new(tree, node, prop, stride)?.cell(row, column)
}

/// One entry of a phandle reference list such as `clocks` or `gpios`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhandleRef {
    /// Position of the entry within the list (empty entries count too).
    pub ordinal: usize,
    pub provider: NodeId,
    pub args: Vec<u32>,
}

/// Walks `prop` as `<phandle arg...>` entries, each provider declaring its argument count in
/// `cells_prop` (e.g. `#clock-cells`).
///
/// A zero phandle is an empty entry and is skipped. A phandle that does not resolve to a node
/// declaring `cells_prop` leaves the rest of the list undecodable, so the walk stops there.
pub fn phandle_refs(
    tree: &DeviceTree,
    node: NodeId,
    prop: &str,
    cells_prop: &str,
) -> Vec<PhandleRef> {
    let Some(bytes) = tree.property(node, prop) else {
        return Vec::new();
    };
    if bytes.len() % CELL_SIZE != 0 {
        warn!(
            node = %tree.path_of(node),
            prop,
            len = bytes.len(),
            "ignoring trailing bytes of reference list"
        );
    }
    let cells: Vec<u32> = bytes
        .chunks_exact(CELL_SIZE)
        .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
        .collect();

    let mut refs = Vec::new();
    let mut pos = 0;
    let mut ordinal = 0;
    while pos < cells.len() {
        let phandle = cells[pos];
        if phandle == 0 {
            pos += 1;
            ordinal += 1;
            continue;
        }
        let Some(provider) = tree.node_by_phandle(phandle) else {
            warn!(
                node = %tree.path_of(node),
                prop,
                phandle,
                "unresolvable phandle; ignoring rest of list"
            );
            break;
        };
        let Some(arg_count) = tree.prop_u32(provider, cells_prop) else {
            warn!(
                node = %tree.path_of(node),
                provider = %tree.path_of(provider),
                prop,
                "referenced node lacks {cells_prop}; ignoring rest of list"
            );
            break;
        };
        let start = pos + 1;
        let Some(args) = start
            .checked_add(arg_count as usize)
            .and_then(|end| cells.get(start..end))
        else {
            warn!(
                node = %tree.path_of(node),
                prop,
                ordinal,
                "truncated reference entry"
            );
            break;
        };
        refs.push(PhandleRef {
            ordinal,
            provider,
            args: args.to_vec(),
        });
        pos = start + args.len();
        ordinal += 1;
    }
    refs
}
