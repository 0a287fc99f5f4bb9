use thiserror::Error;

/// Errors produced while decoding or assembling a device tree.
///
/// Blob decoding treats its input as untrusted: header offsets and sizes are validated before the
/// structure block is walked, and a malformed blob surfaces as one of these variants rather than a
/// panic.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FdtError {
    #[error("blob of {len} bytes is too small for an FDT header")]
    TooSmall { len: usize },

    #[error("bad FDT magic {found:#010x} (expected 0xd00dfeed)")]
    BadMagic { found: u32 },

    #[error("FDT totalsize {total_size} exceeds buffer length {len}")]
    TotalSizeOutOfBounds { total_size: u32, len: usize },

    #[error("unsupported FDT version {version} (last compatible version {last_comp_version})")]
    UnsupportedVersion { version: u32, last_comp_version: u32 },

    #[error("FDT {block} block at offset {offset:#x} (size {size:#x}) lies outside the blob")]
    BlockOutOfBounds {
        block: &'static str,
        offset: u32,
        size: u32,
    },

    #[error("cannot decode structure block: {reason}")]
    Decode { reason: String },

    #[error("structure block is malformed")]
    Malformed,

    #[error("structure block contains no root node")]
    NoRoot,

    #[error("phandle {phandle:#x} is declared by both {first} and {second}")]
    DuplicatePhandle {
        phandle: u32,
        first: String,
        second: String,
    },

    #[error("tree builder finished with {open} unclosed node(s)")]
    UnclosedNode { open: usize },

    #[error("end_node called for a node that is not the innermost open node")]
    MismatchedEndNode,
}
