//! Self-referential value graphs
//!
//! A graph owns its nodes in an arena. Links between nodes are indices, so
//! cycles through links never create reference-count loops. The arena is
//! filled exactly once, which lets the mapper and the deserializer hand out
//! references to a graph before its nodes have been rewritten.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, OnceLock};

use super::Value;
use crate::error::{ReplayCompError, Result};

/// One node of a [`ValueGraph`]
#[derive(Debug, Clone)]
pub struct GraphNode {
    label: Arc<str>,
    payload: Value,
    links: Vec<usize>,
}

impl GraphNode {
    pub fn new(label: impl Into<Arc<str>>, payload: Value, links: Vec<usize>) -> Self {
        Self {
            label: label.into(),
            payload,
            links,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Indices of the linked nodes within the same graph
    pub fn links(&self) -> &[usize] {
        &self.links
    }
}

/// Arena of nodes that may reference each other and themselves
pub struct ValueGraph {
    nodes: OnceLock<Vec<GraphNode>>,
}

impl ValueGraph {
    /// Start building a graph
    pub fn builder() -> ValueGraphBuilder {
        ValueGraphBuilder::default()
    }

    /// A graph whose nodes are supplied later with [`ValueGraph::complete`]
    pub(crate) fn pending() -> Arc<Self> {
        Arc::new(Self {
            nodes: OnceLock::new(),
        })
    }

    /// Fill a pending graph
    pub(crate) fn complete(&self, nodes: Vec<GraphNode>) -> Result<()> {
        validate_links(&nodes)?;
        self.nodes
            .set(nodes)
            .map_err(|_| ReplayCompError::Configuration("value graph completed twice".into()))
    }

    /// Nodes of the graph; empty while the graph is still pending
    pub fn nodes(&self) -> &[GraphNode] {
        self.nodes.get().map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.nodes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes().is_empty()
    }

    /// Stable identity of this graph
    pub fn addr(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

impl fmt::Debug for ValueGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValueGraph({} nodes)", self.len())
    }
}

fn validate_links(nodes: &[GraphNode]) -> Result<()> {
    for (index, node) in nodes.iter().enumerate() {
        if let Some(bad) = node.links.iter().find(|&&l| l >= nodes.len()) {
            return Err(ReplayCompError::Configuration(format!(
                "graph node {} links to missing node {}",
                index, bad
            )));
        }
    }
    Ok(())
}

/// Incremental constructor for [`ValueGraph`]
#[derive(Debug, Default)]
pub struct ValueGraphBuilder {
    nodes: Vec<GraphNode>,
}

impl ValueGraphBuilder {
    /// Add a node, returning its index
    pub fn node(&mut self, label: impl Into<Arc<str>>, payload: Value) -> usize {
        self.nodes.push(GraphNode::new(label, payload, Vec::new()));
        self.nodes.len() - 1
    }

    /// Link `from` to `to`; both may be the same node
    pub fn link(&mut self, from: usize, to: usize) -> &mut Self {
        if let Some(node) = self.nodes.get_mut(from) {
            node.links.push(to);
        }
        self
    }

    pub fn build(self) -> Result<Arc<ValueGraph>> {
        let graph = ValueGraph::pending();
        graph.complete(self.nodes)?;
        Ok(graph)
    }
}

/// A value pointing at one node of a graph
#[derive(Clone)]
pub struct GraphRef {
    graph: Arc<ValueGraph>,
    index: usize,
}

impl GraphRef {
    /// Reference node `index` of `graph`
    pub fn new(graph: Arc<ValueGraph>, index: usize) -> Self {
        Self { graph, index }
    }

    pub fn graph(&self) -> &Arc<ValueGraph> {
        &self.graph
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn node(&self) -> Option<&GraphNode> {
        self.graph.nodes().get(self.index)
    }

    /// References to the nodes this node links to
    pub fn linked(&self) -> Vec<GraphRef> {
        self.node()
            .map(|n| {
                n.links
                    .iter()
                    .map(|&l| GraphRef::new(Arc::clone(&self.graph), l))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl PartialEq for GraphRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.graph, &other.graph) && self.index == other.index
    }
}

impl Eq for GraphRef {}

impl Hash for GraphRef {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.graph.addr().hash(state);
        self.index.hash(state);
    }
}

impl fmt::Debug for GraphRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Payloads may point back into the graph, so never print them here
        let label = self.node().map(GraphNode::label).unwrap_or("<pending>");
        write!(f, "GraphRef({:x}#{} {})", self.graph.addr(), self.index, label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_loop() {
        let mut builder = ValueGraph::builder();
        let a = builder.node("a", Value::Int(1));
        builder.link(a, a);
        let graph = builder.build().unwrap();

        let root = GraphRef::new(graph, a);
        assert_eq!(root.linked(), vec![root.clone()]);
        assert!(format!("{:?}", root).contains("#0 a"));
    }

    #[test]
    fn test_dangling_link_rejected() {
        let mut builder = ValueGraph::builder();
        let a = builder.node("a", Value::Null);
        builder.link(a, 7);
        assert!(builder.build().is_err());
    }

    #[test]
    fn test_complete_once() {
        let graph = ValueGraph::pending();
        assert!(graph.is_empty());
        graph.complete(vec![GraphNode::new("n", Value::Null, vec![0])]).unwrap();
        assert_eq!(graph.len(), 1);
        assert!(graph.complete(Vec::new()).is_err());
    }
}
