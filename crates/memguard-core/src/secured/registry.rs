//! Registry of live secured blocks.
//!
//! A doubly-linked list whose nodes are owned by a slot vector; neighbor links
//! are slot indices and never own anything. Appending records a breadcrumb in
//! the previous tail (`next_name`) so a diagnosis can still name a block whose
//! own header has been destroyed.

use std::collections::HashMap;

use super::block::{BlockLayout, BlockPtr};

/// One tracked block.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: &'static str,
    /// Name of the block that followed this one when it was linked.
    pub next_name: Option<&'static str>,
    /// Allocation base address.
    pub base: usize,
    pub payload: usize,
    pub geometry: BlockLayout,
    pub prev: Option<usize>,
    pub next: Option<usize>,
}

impl Node {
    #[must_use]
    pub fn new(name: &'static str, block: &BlockPtr, geometry: BlockLayout) -> Self {
        Self {
            name,
            next_name: None,
            base: block.base_addr(),
            payload: block.payload() as usize,
            geometry,
            prev: None,
            next: None,
        }
    }

    /// Guard view of the block.
    #[must_use]
    pub fn block(&self) -> BlockPtr {
        // SAFETY: nodes only exist for live allocations made with `geometry`.
        unsafe { BlockPtr::from_base(self.base, self.geometry) }
    }
}

/// Result of walking the list in one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Walk {
    /// First slot rejected by the predicate, if any.
    pub stop: Option<usize>,
    /// Last slot accepted before `stop` (or before the end).
    pub last_fine: Option<usize>,
    /// Number of slots accepted.
    pub visited: usize,
}

/// Live-block list plus address index.
#[derive(Debug, Default)]
pub struct Registry {
    nodes: Vec<Option<Node>>,
    vacant: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    by_payload: HashMap<usize, usize>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_payload.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_payload.is_empty()
    }

    /// Link `node` at the tail and return its slot.
    pub fn append(&mut self, mut node: Node) -> usize {
        let slot = self.vacant.pop().unwrap_or(self.nodes.len());
        node.prev = self.tail;
        node.next = None;

        if let Some(tail) = self.tail {
            let prev = self.node_mut(tail);
            prev.next = Some(slot);
            prev.next_name = Some(node.name);
        }
        if self.head.is_none() {
            self.head = Some(slot);
        }
        self.tail = Some(slot);

        self.by_payload.insert(node.payload, slot);
        if slot == self.nodes.len() {
            self.nodes.push(Some(node));
        } else {
            self.nodes[slot] = Some(node);
        }
        slot
    }

    /// Unlink `slot`, patching neighbors and list ends, and return its node.
    pub fn unlink(&mut self, slot: usize) -> Option<Node> {
        let node = self.nodes.get_mut(slot)?.take()?;

        match node.prev {
            Some(prev) => {
                let next_name = node.next.and_then(|n| self.get(n)).map(|n| n.name);
                let prev_node = self.node_mut(prev);
                prev_node.next = node.next;
                prev_node.next_name = next_name;
            }
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.node_mut(next).prev = node.prev,
            None => self.tail = node.prev,
        }

        self.by_payload.remove(&node.payload);
        self.vacant.push(slot);
        Some(node)
    }

    /// Slot tracking the payload address, if any.
    #[must_use]
    pub fn lookup(&self, payload: usize) -> Option<usize> {
        self.by_payload.get(&payload).copied()
    }

    #[must_use]
    pub fn get(&self, slot: usize) -> Option<&Node> {
        self.nodes.get(slot).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, slot: usize) -> &mut Node {
        match self.nodes.get_mut(slot).and_then(Option::as_mut) {
            Some(node) => node,
            None => unreachable!("registry link to vacant slot {slot}"),
        }
    }

    /// Walk from head following `next` while `accept` holds.
    pub fn walk_forward(&self, mut accept: impl FnMut(usize, &Node) -> bool) -> Walk {
        self.walk(self.head, |n| n.next, &mut accept)
    }

    /// Walk from tail following `prev` while `accept` holds.
    pub fn walk_backward(&self, mut accept: impl FnMut(usize, &Node) -> bool) -> Walk {
        self.walk(self.tail, |n| n.prev, &mut accept)
    }

    fn walk(
        &self,
        start: Option<usize>,
        step: impl Fn(&Node) -> Option<usize>,
        accept: &mut impl FnMut(usize, &Node) -> bool,
    ) -> Walk {
        let mut walk = Walk::default();
        let mut cursor = start;
        // Bounded by slot count so a link cycle cannot spin forever.
        let mut budget = self.nodes.len();
        while let Some(slot) = cursor {
            let Some(node) = self.get(slot) else {
                walk.stop = Some(slot);
                break;
            };
            if budget == 0 || !accept(slot, node) {
                walk.stop = Some(slot);
                break;
            }
            budget -= 1;
            walk.last_fine = Some(slot);
            walk.visited += 1;
            cursor = step(node);
        }
        walk
    }

    /// Nodes in list order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, &Node)> {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let slot = cursor?;
            let node = self.get(slot)?;
            cursor = node.next;
            Some((slot, node))
        })
    }
}
