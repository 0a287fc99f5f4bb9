use crate::tree::{DeviceTree, Node, NodeId};
use crate::FdtError;

/// Token returned by [`DeviceTreeBuilder::begin_node`]; hand it back to `end_node`.
#[must_use = "every begin_node must be matched by end_node"]
#[derive(Debug)]
pub struct NodeToken(NodeId);

/// Assembles a [`DeviceTree`] in memory.
///
/// Mirrors the begin/end shape of a flattened-tree writer: properties apply to the innermost open
/// node, and the root node is open from construction until [`DeviceTreeBuilder::finish`].
#[derive(Debug)]
pub struct DeviceTreeBuilder {
    nodes: Vec<Node>,
    open: Vec<NodeId>,
}

impl Default for DeviceTreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceTreeBuilder {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new("", None)],
            open: vec![NodeId::ROOT],
        }
    }

    fn current(&mut self) -> &mut Node {
        let id = self.open.last().copied().unwrap_or(NodeId::ROOT);
        &mut self.nodes[id.index()]
    }

    pub fn begin_node(&mut self, name: &str) -> NodeToken {
        let parent = self.open.last().copied().unwrap_or(NodeId::ROOT);
        let id = NodeId::from_index(self.nodes.len());
        self.nodes.push(Node::new(name, Some(parent)));
        self.nodes[parent.index()].children.push(id);
        self.open.push(id);
        NodeToken(id)
    }

    pub fn end_node(&mut self, token: NodeToken) -> Result<(), FdtError> {
        // The root is closed by `finish`, never by a token.
        if self.open.len() < 2 || self.open.last() != Some(&token.0) {
            return Err(FdtError::MismatchedEndNode);
        }
        self.open.pop();
        Ok(())
    }

    /// Sets a raw property on the innermost open node, replacing any previous value.
    pub fn property(&mut self, name: &str, value: &[u8]) -> &mut Self {
        self.current().set_property(name, value);
        self
    }

    pub fn property_null(&mut self, name: &str) -> &mut Self {
        self.property(name, &[])
    }

    pub fn property_u32(&mut self, name: &str, value: u32) -> &mut Self {
        self.property(name, &value.to_be_bytes())
    }

    pub fn property_u64(&mut self, name: &str, value: u64) -> &mut Self {
        self.property(name, &value.to_be_bytes())
    }

    pub fn property_array_u32(&mut self, name: &str, cells: &[u32]) -> &mut Self {
        let bytes: Vec<u8> = cells.iter().flat_map(|c| c.to_be_bytes()).collect();
        self.property(name, &bytes)
    }

    pub fn property_array_u64(&mut self, name: &str, values: &[u64]) -> &mut Self {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_be_bytes()).collect();
        self.property(name, &bytes)
    }

    pub fn property_string(&mut self, name: &str, value: &str) -> &mut Self {
        self.property_string_list(name, &[value])
    }

    pub fn property_string_list(&mut self, name: &str, values: &[&str]) -> &mut Self {
        let mut bytes = Vec::new();
        for value in values {
            bytes.extend_from_slice(value.as_bytes());
            bytes.push(0);
        }
        self.property(name, &bytes)
    }

    pub fn property_phandle(&mut self, phandle: u32) -> &mut Self {
        self.property_u32("phandle", phandle)
    }

    pub fn finish(self) -> Result<DeviceTree, FdtError> {
        if self.open.len() > 1 {
            return Err(FdtError::UnclosedNode {
                open: self.open.len() - 1,
            });
        }
        DeviceTree::from_nodes(self.nodes)
    }
}
