//! Arena-backed intrusive LRU list
//!
//! Nodes live in one `Vec` and refer to each other by [`NodeId`] handles, so
//! splicing a node out of the list or pushing it to either end is O(1)
//! without pointer lifetimes.

/// Handle to a cache node in the arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// One reusable column buffer slot
#[derive(Debug, Clone)]
pub struct CacheNode {
    /// Start of this node's column inside the contiguous column region
    pub(crate) offset: usize,
    /// Column currently resident (or being written) in this buffer
    pub(crate) column_index: Option<usize>,
    /// Column claiming this node for a pending write
    pub(crate) staging_owner: Option<usize>,
    /// Node is being read this iteration
    pub(crate) in_use: bool,
    pub(crate) prev: Option<NodeId>,
    pub(crate) next: Option<NodeId>,
}

impl CacheNode {
    pub(crate) fn new(offset: usize) -> Self {
        Self {
            offset,
            column_index: None,
            staging_owner: None,
            in_use: false,
            prev: None,
            next: None,
        }
    }

    pub fn column_index(&self) -> Option<usize> {
        self.column_index
    }

    pub fn staging_owner(&self) -> Option<usize> {
        self.staging_owner
    }

    pub fn in_use(&self) -> bool {
        self.in_use
    }
}

/// Head is the most recently used node, tail the least recently used
#[derive(Debug, Clone, Default)]
pub struct LruList {
    head: Option<NodeId>,
    tail: Option<NodeId>,
    len: usize,
}

impl LruList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn head(&self) -> Option<NodeId> {
        self.head
    }

    pub fn tail(&self) -> Option<NodeId> {
        self.tail
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `id` is currently linked into this list
    pub fn contains(&self, nodes: &[CacheNode], id: NodeId) -> bool {
        let node = &nodes[id.0];
        node.prev.is_some() || node.next.is_some() || self.head == Some(id)
    }

    pub fn push_front(&mut self, nodes: &mut [CacheNode], id: NodeId) {
        match self.head {
            None => {
                self.head = Some(id);
                self.tail = Some(id);
            }
            Some(head) => {
                nodes[id.0].next = Some(head);
                nodes[head.0].prev = Some(id);
                self.head = Some(id);
            }
        }
        self.len += 1;
    }

    pub fn push_back(&mut self, nodes: &mut [CacheNode], id: NodeId) {
        match self.tail {
            None => {
                self.head = Some(id);
                self.tail = Some(id);
            }
            Some(tail) => {
                nodes[id.0].prev = Some(tail);
                nodes[tail.0].next = Some(id);
                self.tail = Some(id);
            }
        }
        self.len += 1;
    }

    /// Unlink `id`; the caller guarantees it is in the list
    pub fn remove(&mut self, nodes: &mut [CacheNode], id: NodeId) {
        let (prev, next) = (nodes[id.0].prev, nodes[id.0].next);

        match prev {
            Some(p) => nodes[p.0].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => nodes[n.0].prev = prev,
            None => self.tail = prev,
        }

        nodes[id.0].prev = None;
        nodes[id.0].next = None;
        self.len -= 1;
    }

    /// Walk from the tail towards the head
    pub fn iter_from_tail<'a>(&self, nodes: &'a [CacheNode]) -> impl Iterator<Item = NodeId> + 'a {
        let mut cursor = self.tail;
        let mut remaining = self.len;
        std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            let id = cursor?;
            cursor = nodes[id.0].prev;
            remaining -= 1;
            Some(id)
        })
    }

    /// Walk from the head towards the tail
    pub fn iter_from_head<'a>(&self, nodes: &'a [CacheNode]) -> impl Iterator<Item = NodeId> + 'a {
        let mut cursor = self.head;
        let mut remaining = self.len;
        std::iter::from_fn(move || {
            if remaining == 0 {
                return None;
            }
            let id = cursor?;
            cursor = nodes[id.0].next;
            remaining -= 1;
            Some(id)
        })
    }
}
