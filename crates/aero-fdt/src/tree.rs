use std::collections::HashMap;
use std::fmt;

use crate::FdtError;

/// Stable handle for a node inside one [`DeviceTree`].
///
/// Handles are dense indices assigned in document (pre-)order, so iterating ids in ascending order
/// visits the tree in the same order as the structure block. A handle is only meaningful for the
/// tree that produced it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub const ROOT: NodeId = NodeId(0);

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub(crate) fn from_index(index: usize) -> Self {
        Self(u32::try_from(index).unwrap_or(u32::MAX))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// A named property with its raw (big-endian, unparsed) value bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Property {
    name: String,
    value: Vec<u8>,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }
}

#[derive(Clone, Debug)]
pub struct Node {
    pub(crate) name: String,
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) properties: Vec<Property>,
}

impl Node {
    pub(crate) fn new(name: impl Into<String>, parent: Option<NodeId>) -> Self {
        Self {
            name: name.into(),
            parent,
            children: Vec::new(),
            properties: Vec::new(),
        }
    }

    pub(crate) fn set_property(&mut self, name: &str, value: &[u8]) {
        match self.properties.iter_mut().find(|p| p.name == name) {
            Some(existing) => existing.value = value.to_vec(),
            None => self.properties.push(Property::new(name, value)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn properties(&self) -> &[Property] {
        &self.properties
    }
}

/// An immutable device tree document.
///
/// All queries are by [`NodeId`]; phandle references are resolved through an index built once
/// when the tree is assembled.
#[derive(Clone, Debug)]
pub struct DeviceTree {
    nodes: Vec<Node>,
    phandles: HashMap<u32, NodeId>,
}

impl DeviceTree {
    pub(crate) fn from_nodes(nodes: Vec<Node>) -> Result<Self, FdtError> {
        if nodes.is_empty() {
            return Err(FdtError::NoRoot);
        }

        let mut tree = Self {
            nodes,
            phandles: HashMap::new(),
        };

        let mut phandles = HashMap::new();
        for id in tree.nodes() {
            let Some(phandle) = tree.phandle_of(id) else {
                continue;
            };
            if let Some(first) = phandles.insert(phandle, id) {
                return Err(FdtError::DuplicatePhandle {
                    phandle,
                    first: tree.path_of(first),
                    second: tree.path_of(id),
                });
            }
        }
        tree.phandles = phandles;
        Ok(tree)
    }

    #[inline]
    pub fn root(&self) -> NodeId {
        NodeId::ROOT
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Returns the node behind `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` was not produced by this tree.
    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// All nodes in document order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId::from_index)
    }

    pub fn name(&self, id: NodeId) -> &str {
        &self.node(id).name
    }

    /// Node name with any `@unit-address` suffix removed.
    pub fn base_name(&self, id: NodeId) -> &str {
        let name = self.name(id);
        name.split_once('@').map_or(name, |(base, _)| base)
    }

    pub fn unit_address(&self, id: NodeId) -> Option<&str> {
        self.name(id).split_once('@').map(|(_, unit)| unit)
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).parent
    }

    pub fn children(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.node(id).children.iter().copied()
    }

    pub fn has_children(&self, id: NodeId) -> bool {
        !self.node(id).children.is_empty()
    }

    pub fn properties(&self, id: NodeId) -> impl Iterator<Item = &Property> + '_ {
        self.node(id).properties.iter()
    }

    pub fn property(&self, id: NodeId, name: &str) -> Option<&[u8]> {
        self.node(id)
            .properties
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.value.as_slice())
    }

    pub fn has_property(&self, id: NodeId, name: &str) -> bool {
        self.property(id, name).is_some()
    }

    /// Reads a property holding exactly one 32-bit cell.
    pub fn prop_u32(&self, id: NodeId, name: &str) -> Option<u32> {
        let bytes: [u8; 4] = self.property(id, name)?.try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Reads the first string of a string property.
    pub fn prop_str(&self, id: NodeId, name: &str) -> Option<&str> {
        self.string_entries(id, name).next().flatten()
    }

    /// Splits a NUL-separated string-list property, one item per entry.
    ///
    /// A missing trailing NUL is tolerated. Entries that are not valid UTF-8 are `None` so later
    /// entries keep their index.
    pub fn string_entries(&self, id: NodeId, name: &str) -> impl Iterator<Item = Option<&str>> {
        let bytes = self.property(id, name).unwrap_or_default();
        let bytes = bytes.strip_suffix(&[0]).unwrap_or(bytes);
        bytes
            .split(|&b| b == 0)
            .take(if bytes.is_empty() { 0 } else { usize::MAX })
            .map(|s| std::str::from_utf8(s).ok())
    }

    /// The decodable entries of a string-list property.
    pub fn string_list(&self, id: NodeId, name: &str) -> Vec<&str> {
        self.string_entries(id, name).flatten().collect()
    }

    /// Entry `index` of a string-list property, counted over all entries.
    pub fn string_list_get(&self, id: NodeId, name: &str, index: usize) -> Option<&str> {
        self.string_entries(id, name).nth(index).flatten()
    }

    /// Finds a direct child by name.
    ///
    /// A query without `@` also matches children whose base name equals it, so `"memory"` finds
    /// `memory@80000000`.
    pub fn subnode(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let exact = self.children(parent).find(|&c| self.name(c) == name);
        if exact.is_some() || name.contains('@') {
            return exact;
        }
        self.children(parent).find(|&c| self.base_name(c) == name)
    }

    /// Resolves an absolute path such as `/soc/uart@9000000`.
    pub fn find_path(&self, path: &str) -> Option<NodeId> {
        path.split('/')
            .filter(|segment| !segment.is_empty())
            .try_fold(self.root(), |node, segment| self.subnode(node, segment))
    }

    pub fn path_of(&self, id: NodeId) -> String {
        let mut segments = Vec::new();
        let mut cursor = Some(id);
        while let Some(node) = cursor {
            if self.parent(node).is_some() {
                segments.push(self.name(node));
            }
            cursor = self.parent(node);
        }
        if segments.is_empty() {
            return "/".to_string();
        }
        segments
            .iter()
            .rev()
            .fold(String::new(), |mut path, segment| {
                path.push('/');
                path.push_str(segment);
                path
            })
    }

    /// The phandle a node declares via `phandle` (or legacy `linux,phandle`).
    pub fn phandle_of(&self, id: NodeId) -> Option<u32> {
        self.prop_u32(id, "phandle")
            .or_else(|| self.prop_u32(id, "linux,phandle"))
            .filter(|&p| p != 0 && p != u32::MAX)
    }

    pub fn node_by_phandle(&self, phandle: u32) -> Option<NodeId> {
        self.phandles.get(&phandle).copied()
    }

    /// Every node carrying `name`, in document order.
    pub fn nodes_with_property<'a>(&'a self, name: &'a str) -> impl Iterator<Item = NodeId> + 'a {
        self.nodes().filter(move |&id| self.has_property(id, name))
    }
}
