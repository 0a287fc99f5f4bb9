//! Flattened device tree (DTB) decoding.
//!
//! The structure block is walked with the `fdt` crate; this module validates the header first so
//! that every block the crate slices lies inside the blob, then copies the nodes into an owned
//! [`DeviceTree`].

use std::panic;

use fdt::node::FdtNode;
use fdt::Fdt;

use crate::tree::{DeviceTree, Node, NodeId};
use crate::FdtError;

pub const FDT_MAGIC: u32 = 0xd00d_feed;
/// Newest structure version this decoder understands.
pub const FDT_VERSION: u32 = 17;
/// Oldest version whose layout is still readable by a version-17 decoder.
pub const FDT_LAST_COMP_VERSION: u32 = 16;

const FDT_HEADER_LEN: usize = 40;

#[derive(Debug, Clone, Copy)]
struct FdtHeader {
    total_size: u32,
    off_dt_struct: u32,
    off_dt_strings: u32,
    version: u32,
    last_comp_version: u32,
    size_dt_strings: u32,
    size_dt_struct: u32,
}

fn be32(bytes: &[u8], offset: usize) -> Option<u32> {
    let word = bytes.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_be_bytes([word[0], word[1], word[2], word[3]]))
}

fn check_block(blob: &[u8], name: &'static str, offset: u32, size: u32) -> Result<(), FdtError> {
    let start = offset as usize;
    start
        .checked_add(size as usize)
        .filter(|&end| end <= blob.len())
        .map(|_| ())
        .ok_or(FdtError::BlockOutOfBounds {
            block: name,
            offset,
            size,
        })
}

fn parse_header(bytes: &[u8]) -> Result<FdtHeader, FdtError> {
    if bytes.len() < FDT_HEADER_LEN {
        return Err(FdtError::TooSmall { len: bytes.len() });
    }
    let word = |index: usize| be32(bytes, index * 4).unwrap_or(0);

    let magic = word(0);
    if magic != FDT_MAGIC {
        return Err(FdtError::BadMagic { found: magic });
    }

    let header = FdtHeader {
        total_size: word(1),
        off_dt_struct: word(2),
        off_dt_strings: word(3),
        version: word(5),
        last_comp_version: word(6),
        size_dt_strings: word(8),
        size_dt_struct: word(9),
    };

    if header.total_size as usize > bytes.len() || (header.total_size as usize) < FDT_HEADER_LEN {
        return Err(FdtError::TotalSizeOutOfBounds {
            total_size: header.total_size,
            len: bytes.len(),
        });
    }
    if header.version < FDT_VERSION || header.last_comp_version > FDT_VERSION {
        return Err(FdtError::UnsupportedVersion {
            version: header.version,
            last_comp_version: header.last_comp_version,
        });
    }

    let blob = &bytes[..header.total_size as usize];
    check_block(blob, "structure", header.off_dt_struct, header.size_dt_struct)?;
    check_block(blob, "strings", header.off_dt_strings, header.size_dt_strings)?;
    Ok(header)
}

/// Copies the tree below `root` into dense pre-order nodes.
///
/// Uses an explicit stack; hostile blobs cannot exhaust the call stack through deep nesting.
fn copy_nodes(root: FdtNode<'_, '_>) -> Vec<Node> {
    let mut nodes: Vec<Node> = Vec::new();
    let mut pending = vec![(root, None::<NodeId>)];

    while let Some((source, parent)) = pending.pop() {
        let id = NodeId::from_index(nodes.len());
        let name = match parent {
            None => "",
            Some(_) => source.name,
        };
        let mut node = Node::new(name, parent);
        for prop in source.properties() {
            node.set_property(prop.name, prop.value);
        }
        nodes.push(node);
        if let Some(parent) = parent {
            nodes[parent.index()].children.push(id);
        }

        let children: Vec<_> = source.children().collect();
        pending.extend(children.into_iter().rev().map(|child| (child, Some(id))));
    }
    nodes
}

fn decode(blob: &[u8]) -> Result<Vec<Node>, FdtError> {
    let fdt = Fdt::new(blob).map_err(|err| FdtError::Decode {
        reason: format!("{err:?}"),
    })?;
    let root = fdt.find_node("/").ok_or(FdtError::NoRoot)?;
    Ok(copy_nodes(root))
}

/// Decodes a DTB blob into a [`DeviceTree`].
///
/// Requires a version 17 layout (`last_comp_version` 16 or 17). `bytes` is untrusted input:
/// structural damage the `fdt` crate trips over is reported as [`FdtError::Malformed`].
pub fn parse(bytes: &[u8]) -> Result<DeviceTree, FdtError> {
    let header = parse_header(bytes)?;
    let blob = &bytes[..header.total_size as usize];

    // The crate asserts on unexpected tokens instead of returning an error.
    let nodes = panic::catch_unwind(|| decode(blob)).map_err(|_| FdtError::Malformed)??;
    DeviceTree::from_nodes(nodes)
}

impl DeviceTree {
    /// Decodes a flattened device tree blob (see [`parse`]).
    pub fn from_blob(bytes: &[u8]) -> Result<Self, FdtError> {
        parse(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(total: u32, version: u32, last_comp: u32) -> Vec<u8> {
        let words = [FDT_MAGIC, total, 40, 40, 40, version, last_comp, 0, 0, 0];
        words.iter().flat_map(|w| w.to_be_bytes()).collect()
    }

    #[test]
    fn rejects_bad_magic_and_short_blobs() {
        assert_eq!(
            parse(&[0u8; 8]).unwrap_err(),
            FdtError::TooSmall { len: 8 }
        );
        let mut blob = header(40, 17, 16);
        blob[0] = 0;
        assert!(matches!(parse(&blob), Err(FdtError::BadMagic { .. })));
    }

    #[test]
    fn rejects_total_size_beyond_buffer() {
        let blob = header(4096, 17, 16);
        assert_eq!(
            parse(&blob).unwrap_err(),
            FdtError::TotalSizeOutOfBounds {
                total_size: 4096,
                len: 40
            }
        );
    }

    #[test]
    fn rejects_incompatible_versions() {
        assert!(matches!(
            parse(&header(40, 15, 15)),
            Err(FdtError::UnsupportedVersion { version: 15, .. })
        ));
        assert!(matches!(
            parse(&header(40, 18, 18)),
            Err(FdtError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn rejects_blocks_outside_the_blob() {
        let mut blob = header(40, 17, 16);
        // size_dt_struct
        blob[36..40].copy_from_slice(&0x100u32.to_be_bytes());
        assert_eq!(
            parse(&blob).unwrap_err(),
            FdtError::BlockOutOfBounds {
                block: "structure",
                offset: 40,
                size: 0x100
            }
        );
    }

    #[test]
    fn empty_structure_block_has_no_root() {
        assert!(parse(&header(40, 17, 16)).is_err());
    }
}
