//! Circular doubly-linked lists stored in an arena.
//!
//! Every list is a sentinel node whose links point back at itself while the
//! list is empty. Nodes and sentinels share one [`NodeArena`] and are
//! addressed by [`NodeId`] handles, so splicing a node in or out is O(1) and
//! never allocates. A node belongs to at most one list at a time: linking a
//! node that is already linked moves it.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone)]
struct Node<T> {
    parent: Option<NodeId>,
    child: Option<NodeId>,
    value: T,
}

#[derive(Debug, Clone, Default)]
pub struct NodeArena<T> {
    nodes: Vec<Node<T>>,
}

impl<T> NodeArena<T> {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity),
        }
    }

    /// Allocates an unlinked node.
    pub fn add_node(&mut self, value: T) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            parent: None,
            child: None,
            value,
        });
        id
    }

    /// Allocates a sentinel, which is an empty list.
    pub fn add_list(&mut self, value: T) -> NodeId {
        let id = self.add_node(value);
        let node = &mut self.nodes[id.index()];
        node.parent = Some(id);
        node.child = Some(id);
        id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> Option<NodeId> {
        (index < self.nodes.len()).then_some(NodeId(index as u32))
    }

    pub fn value(&self, id: NodeId) -> &T {
        &self.nodes[id.index()].value
    }

    pub fn value_mut(&mut self, id: NodeId) -> &mut T {
        &mut self.nodes[id.index()].value
    }

    pub fn is_linked(&self, id: NodeId) -> bool {
        self.nodes[id.index()].parent.is_some()
    }

    /// Splices `id` in directly after `after`.
    pub fn insert_after(&mut self, id: NodeId, after: NodeId) {
        self.remove(id);
        let next = self.nodes[after.index()].child.unwrap_or(after);
        self.nodes[id.index()].parent = Some(after);
        self.nodes[id.index()].child = Some(next);
        self.nodes[after.index()].child = Some(id);
        self.nodes[next.index()].parent = Some(id);
    }

    /// Appends `id` at the tail of `list`.
    pub fn push_back(&mut self, list: NodeId, id: NodeId) {
        let tail = self.nodes[list.index()].parent.unwrap_or(list);
        self.insert_after(id, tail);
    }

    /// Unlinks `id`. Removing an unlinked node does nothing.
    pub fn remove(&mut self, id: NodeId) {
        let node = &mut self.nodes[id.index()];
        let (Some(parent), Some(child)) = (node.parent.take(), node.child.take()) else {
            return;
        };
        self.nodes[parent.index()].child = Some(child);
        self.nodes[child.index()].parent = Some(parent);
    }

    pub fn is_list_empty(&self, list: NodeId) -> bool {
        self.nodes[list.index()].child == Some(list)
    }

    pub fn first(&self, list: NodeId) -> Option<NodeId> {
        self.next(list, list)
    }

    /// The node after `id` in `list`, or `None` once the sentinel is reached.
    pub fn next(&self, list: NodeId, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].child.filter(|&next| next != list)
    }

    pub fn prev(&self, list: NodeId, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].parent.filter(|&prev| prev != list)
    }

    pub fn pop_front(&mut self, list: NodeId) -> Option<NodeId> {
        let first = self.first(list)?;
        self.remove(first);
        Some(first)
    }

    pub fn iter(&self, list: NodeId) -> Iter<'_, T> {
        Iter {
            arena: self,
            list,
            cursor: self.first(list),
        }
    }

    pub fn count(&self, list: NodeId) -> usize {
        self.iter(list).count()
    }
}

pub struct Iter<'a, T> {
    arena: &'a NodeArena<T>,
    list: NodeId,
    cursor: Option<NodeId>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = NodeId;

    fn next(&mut self) -> Option<NodeId> {
        let current = self.cursor?;
        self.cursor = self.arena.next(self.list, current);
        Some(current)
    }
}
