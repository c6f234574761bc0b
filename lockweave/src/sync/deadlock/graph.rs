// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A directed "acquired-before" graph over mutexes, refusing edges that would close a cycle.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use core::fmt::Display;

use hashbrown::{HashMap, HashSet};

/// Identifies a node of a [`LockGraph`]. Ids of removed nodes are never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) struct GraphId(u64);

impl GraphId {
    /// An id that never names a live node.
    pub(crate) const INVALID: GraphId = GraphId(0);

    fn new(index: u32, version: u32) -> Self {
        debug_assert_ne!(version, 0);
        Self((u64::from(version) << 32) | u64::from(index))
    }

    fn index(self) -> usize {
        (self.0 & u64::from(u32::MAX)) as usize
    }

    fn version(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub(crate) fn to_raw(self) -> u64 {
        self.0
    }

    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub(crate) fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

type StackSnapshot = Box<dyn Display + Send + Sync>;

struct Node {
    version: u32,
    /// Address of the mutex, or zero for a free node.
    ptr: usize,
    out: HashSet<u32>,
    incoming: HashSet<u32>,
    /// Number of locks held (plus one) when `stack` was captured.
    stack_priority: usize,
    stack: Option<StackSnapshot>,
}

/// The process-wide lock ordering graph.
pub(crate) struct LockGraph {
    nodes: Vec<Node>,
    free: Vec<u32>,
}

impl LockGraph {
    pub(crate) const fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
        }
    }

    fn node(&self, id: GraphId) -> Option<&Node> {
        self.nodes
            .get(id.index())
            .filter(|n| n.ptr != 0 && n.version == id.version())
    }

    fn node_mut(&mut self, id: GraphId) -> Option<&mut Node> {
        self.nodes
            .get_mut(id.index())
            .filter(|n| n.ptr != 0 && n.version == id.version())
    }

    fn id_of(&self, index: u32) -> GraphId {
        GraphId::new(index, self.nodes[index as usize].version)
    }

    /// The node of the mutex at `ptr`: `cached` if that is still live, otherwise a fresh node.
    pub(crate) fn get_or_create_id(&mut self, cached: GraphId, ptr: usize) -> GraphId {
        debug_assert_ne!(ptr, 0);
        if self.node(cached).is_some() {
            return cached;
        }
        let index = if let Some(index) = self.free.pop() {
            let node = &mut self.nodes[index as usize];
            node.ptr = ptr;
            index
        } else {
            let index = u32::try_from(self.nodes.len()).unwrap_or(u32::MAX);
            self.nodes.push(Node {
                version: 1,
                ptr,
                out: HashSet::new(),
                incoming: HashSet::new(),
                stack_priority: 0,
                stack: None,
            });
            index
        };
        self.id_of(index)
    }

    /// Address of the mutex named by `id`, if the node is still live.
    pub(crate) fn ptr(&self, id: GraphId) -> Option<usize> {
        self.node(id).map(|n| n.ptr)
    }

    /// Remove the node `id` along with all its edges. Stale ids are ignored.
    pub(crate) fn remove_node(&mut self, id: GraphId) {
        let Some(node) = self.node_mut(id) else {
            return;
        };
        let out = core::mem::take(&mut node.out);
        let incoming = core::mem::take(&mut node.incoming);
        node.ptr = 0;
        node.stack = None;
        node.stack_priority = 0;
        node.version = node.version.wrapping_add(1).max(1);
        let x = id.index() as u32;
        for y in out {
            self.nodes[y as usize].incoming.remove(&x);
        }
        for w in incoming {
            self.nodes[w as usize].out.remove(&x);
        }
        self.free.push(x);
    }

    /// Record the edge `x -> y`. Returns false, without inserting anything, if the edge would
    /// close a cycle (including the self-edge `x -> x`). Edges touching stale ids are dropped.
    pub(crate) fn insert_edge(&mut self, x: GraphId, y: GraphId) -> bool {
        if x == y {
            return false;
        }
        if self.node(x).is_none() || self.node(y).is_none() {
            return true;
        }
        let (xi, yi) = (x.index() as u32, y.index() as u32);
        if self.nodes[xi as usize].out.contains(&yi) {
            return true;
        }
        if self.reachable(yi, xi) {
            return false;
        }
        self.nodes[xi as usize].out.insert(yi);
        self.nodes[yi as usize].incoming.insert(xi);
        true
    }

    fn reachable(&self, from: u32, to: u32) -> bool {
        let mut seen = HashSet::new();
        let mut stack = alloc::vec![from];
        while let Some(n) = stack.pop() {
            if n == to {
                return true;
            }
            if seen.insert(n) {
                stack.extend(self.nodes[n as usize].out.iter().copied());
            }
        }
        false
    }

    /// A shortest path `from -> ... -> to`, both ends included, or an empty path if `to` is not
    /// reachable.
    pub(crate) fn find_path(&self, from: GraphId, to: GraphId) -> Vec<GraphId> {
        if self.node(from).is_none() || self.node(to).is_none() {
            return Vec::new();
        }
        let (from, to) = (from.index() as u32, to.index() as u32);
        let mut parent: HashMap<u32, u32> = HashMap::new();
        let mut queue = VecDeque::from([from]);
        parent.insert(from, from);
        while let Some(n) = queue.pop_front() {
            if n == to {
                let mut path = alloc::vec![self.id_of(n)];
                let mut cur = n;
                while cur != from {
                    cur = parent[&cur];
                    path.push(self.id_of(cur));
                }
                path.reverse();
                return path;
            }
            for &m in &self.nodes[n as usize].out {
                if !parent.contains_key(&m) {
                    parent.insert(m, n);
                    queue.push_back(m);
                }
            }
        }
        Vec::new()
    }

    /// Keep a stack snapshot for `id`, preferring snapshots taken while more locks were held.
    pub(crate) fn update_stack_trace(
        &mut self,
        id: GraphId,
        priority: usize,
        capture: impl FnOnce() -> StackSnapshot,
    ) {
        let Some(node) = self.node_mut(id) else {
            return;
        };
        if priority > node.stack_priority {
            node.stack = Some(capture());
            node.stack_priority = priority;
        }
    }

    pub(crate) fn stack_trace(&self, id: GraphId) -> Option<&(dyn Display + Send + Sync)> {
        self.node(id).and_then(|n| n.stack.as_deref())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;

    #[test]
    fn cycles_are_refused() {
        let mut g = LockGraph::new();
        let a = g.get_or_create_id(GraphId::INVALID, 0x100);
        let b = g.get_or_create_id(GraphId::INVALID, 0x200);
        let c = g.get_or_create_id(GraphId::INVALID, 0x300);
        assert!(g.insert_edge(a, b));
        assert!(g.insert_edge(b, c));
        assert!(g.insert_edge(a, c));
        assert!(!g.insert_edge(c, a));
        assert!(!g.insert_edge(b, b));
        assert_eq!(g.find_path(a, c).len(), 2);
        assert_eq!(g.find_path(c, a), Vec::new());
    }

    #[test]
    fn removed_nodes_take_their_edges_along() {
        let mut g = LockGraph::new();
        let a = g.get_or_create_id(GraphId::INVALID, 0x100);
        let b = g.get_or_create_id(GraphId::INVALID, 0x200);
        assert!(g.insert_edge(a, b));
        g.remove_node(b);
        assert_eq!(g.ptr(b), None);
        let b2 = g.get_or_create_id(b, 0x200);
        assert_ne!(b, b2);
        assert!(g.insert_edge(b2, a));
        // The stale id is ignored rather than resurrected.
        assert!(g.insert_edge(a, b));
        assert_eq!(g.get_or_create_id(a, 0x100), a);
    }

    #[test]
    fn paths_follow_edges() {
        let mut g = LockGraph::new();
        let ids: Vec<GraphId> = (1..=4)
            .map(|i| g.get_or_create_id(GraphId::INVALID, i * 0x100))
            .collect();
        for w in ids.windows(2) {
            assert!(g.insert_edge(w[0], w[1]));
        }
        assert_eq!(g.find_path(ids[0], ids[3]), ids);
    }

    #[test]
    fn richer_stacks_win() {
        let mut g = LockGraph::new();
        let a = g.get_or_create_id(GraphId::INVALID, 0x100);
        g.update_stack_trace(a, 2, || Box::new("two"));
        g.update_stack_trace(a, 1, || Box::new("one"));
        assert_eq!(std::format!("{}", g.stack_trace(a).unwrap()), "two");
        g.update_stack_trace(a, 3, || Box::new("three"));
        assert_eq!(std::format!("{}", g.stack_trace(a).unwrap()), "three");
    }
}
