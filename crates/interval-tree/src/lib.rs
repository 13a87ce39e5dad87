//! An augmented red-black interval tree.
//!
//! Nodes are keyed by the inclusive start of their interval and carry the
//! maximum interval end found in their subtree, which lets overlap queries
//! prune entire subtrees. Equal start keys are permitted; later insertions
//! of an equal key order after earlier ones in the in-order walk.

use std::cmp::Ordering;

/// Index of a live node within an [`IntervalTree`].
///
/// A `NodeId` is invalidated by the removal of its node (and may be reused
/// by a later insertion); callers must not hold ids across removals.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NodeId(usize);

/// Violation found by [`IntervalTree::verify`].
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("red node at start key has a red child")]
    RedRed,
    #[error("left/right black heights differ")]
    BlackHeight,
    #[error("binary search order violated on start keys")]
    SearchOrder,
    #[error("subtree end-range maximum is stale")]
    StaleEndMax,
    #[error("tree depth {depth} exceeds bound {bound} for {len} nodes")]
    Depth { depth: usize, bound: usize, len: usize },
    #[error("structural link is inconsistent")]
    BadLink,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Color {
    Red,
    Black,
}

const NIL: usize = usize::MAX;

#[derive(Debug)]
struct Node<R, D> {
    start: R,
    end: R,
    /// Maximum `end` within this node's subtree.
    end_max: R,
    data: D,
    color: Color,
    parent: usize,
    left: usize,
    right: usize,
}

/// A red-black tree of `[start, end]` intervals carrying payloads of type `D`.
#[derive(Debug)]
pub struct IntervalTree<R, D> {
    nodes: Vec<Option<Node<R, D>>>,
    free: Vec<usize>,
    root: usize,
    len: usize,
}

impl<R, D> Default for IntervalTree<R, D>
where
    R: Copy + Ord,
    D: PartialEq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<R, D> IntervalTree<R, D>
where
    R: Copy + Ord,
    D: PartialEq,
{
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            root: NIL,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.root = NIL;
        self.len = 0;
    }

    /// Insert the interval `[start, end]` with `data`.
    /// `end` must not order before `start`.
    pub fn insert(&mut self, start: R, end: R, data: D) -> NodeId {
        assert!(end >= start, "interval end orders before start");

        let z = self.alloc(Node {
            start,
            end,
            end_max: end,
            data,
            color: Color::Red,
            parent: NIL,
            left: NIL,
            right: NIL,
        });

        // Ordinary BST insertion on start; equal keys descend right so that
        // later equal-key insertions follow earlier ones in the in-order walk.
        let mut y = NIL;
        let mut x = self.root;
        while x != NIL {
            y = x;
            x = if start < self.node(x).start {
                self.node(x).left
            } else {
                self.node(x).right
            };
        }
        self.node_mut(z).parent = y;
        if y == NIL {
            self.root = z;
        } else if start < self.node(y).start {
            self.node_mut(y).left = z;
        } else {
            self.node_mut(y).right = z;
        }

        self.update_max_upward(y);
        self.insert_fixup(z);
        self.len += 1;
        NodeId(z)
    }

    /// Find a node matching `start`, `end` and `data` exactly.
    pub fn search(&self, start: R, end: R, data: &D) -> Option<NodeId> {
        self.search_in(self.root, start, end, data)
    }

    fn search_in(&self, x: usize, start: R, end: R, data: &D) -> Option<NodeId> {
        if x == NIL {
            return None;
        }
        let n = self.node(x);
        match start.cmp(&n.start) {
            Ordering::Less => self.search_in(n.left, start, end, data),
            Ordering::Greater => self.search_in(n.right, start, end, data),
            Ordering::Equal => {
                if n.end == end && n.data == *data {
                    return Some(NodeId(x));
                }
                // Rotations can leave equal start keys on either side.
                self.search_in(n.left, start, end, data)
                    .or_else(|| self.search_in(n.right, start, end, data))
            }
        }
    }

    /// Remove the first node matching `start`, `end` and `data` exactly.
    /// Returns false if no such node exists.
    pub fn remove(&mut self, start: R, end: R, data: &D) -> bool {
        match self.search(start, end, data) {
            Some(id) => {
                self.delete(id);
                true
            }
            None => false,
        }
    }

    /// Start and end of the node `id`.
    pub fn interval(&self, id: NodeId) -> (R, R) {
        let n = self.node(id.0);
        (n.start, n.end)
    }

    /// Payload of the node `id`.
    pub fn data(&self, id: NodeId) -> &D {
        &self.node(id.0).data
    }

    /// The node with the least start key, if any.
    pub fn first(&self) -> Option<NodeId> {
        if self.root == NIL {
            return None;
        }
        Some(NodeId(self.minimum(self.root)))
    }

    /// The node with the greatest start key, if any.
    pub fn last(&self) -> Option<NodeId> {
        if self.root == NIL {
            return None;
        }
        let mut x = self.root;
        while self.node(x).right != NIL {
            x = self.node(x).right;
        }
        Some(NodeId(x))
    }

    /// Find one node whose interval overlaps `[start, end]` (closed bounds).
    pub fn search_overlap(&self, start: R, end: R) -> Option<NodeId> {
        let mut x = self.root;
        while x != NIL {
            let n = self.node(x);
            if n.start <= end && start <= n.end {
                return Some(NodeId(x));
            }
            let left = n.left;
            if left != NIL && self.node(left).end_max >= start {
                x = left;
            } else {
                x = n.right;
            }
        }
        None
    }

    /// All nodes whose intervals overlap `[start, end]`, in ascending start
    /// order (equal starts in insertion order).
    pub fn overlapping(&self, start: R, end: R) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_overlaps(self.root, start, end, &mut out);
        out
    }

    fn collect_overlaps(&self, x: usize, start: R, end: R, out: &mut Vec<NodeId>) {
        if x == NIL {
            return;
        }
        let n = self.node(x);
        if n.left != NIL && self.node(n.left).end_max >= start {
            self.collect_overlaps(n.left, start, end, out);
        }
        if n.start <= end && start <= n.end {
            out.push(NodeId(x));
        }
        // Right-subtree starts are >= n.start; nothing there can overlap
        // once n.start passes the query end.
        if n.start <= end {
            self.collect_overlaps(n.right, start, end, out);
        }
    }

    /// In-order iterator over `(start, end, &data)`, ascending by start.
    pub fn iter(&self) -> Iter<'_, R, D> {
        let mut stack = Vec::new();
        let mut x = self.root;
        while x != NIL {
            stack.push(x);
            x = self.node(x).left;
        }
        Iter { tree: self, stack }
    }

    /// Remove the node `id` from the tree.
    pub fn delete(&mut self, id: NodeId) {
        let z = id.0;
        assert!(
            z < self.nodes.len() && self.nodes[z].is_some(),
            "delete of a vacant interval tree node"
        );

        let mut y = z;
        let mut y_color = self.node(y).color;
        let x;
        let x_parent;

        if self.node(z).left == NIL {
            x = self.node(z).right;
            x_parent = self.node(z).parent;
            self.transplant(z, x);
        } else if self.node(z).right == NIL {
            x = self.node(z).left;
            x_parent = self.node(z).parent;
            self.transplant(z, x);
        } else {
            y = self.minimum(self.node(z).right);
            y_color = self.node(y).color;
            x = self.node(y).right;
            if self.node(y).parent == z {
                x_parent = y;
            } else {
                x_parent = self.node(y).parent;
                self.transplant(y, x);
                let zr = self.node(z).right;
                self.node_mut(y).right = zr;
                self.node_mut(zr).parent = y;
            }
            self.transplant(z, y);
            let zl = self.node(z).left;
            self.node_mut(y).left = zl;
            self.node_mut(zl).parent = y;
            self.node_mut(y).color = self.node(z).color;
        }

        let fix_from = if x != NIL { x } else { x_parent };
        self.update_max_upward(fix_from);

        if y_color == Color::Black {
            self.delete_fixup(x, x_parent);
        }

        self.nodes[z] = None;
        self.free.push(z);
        self.len -= 1;
    }

    /// Check red-black, search-order, end-max and depth properties.
    pub fn verify(&self) -> Result<(), VerifyError> {
        if self.root == NIL {
            return Ok(());
        }
        if self.node(self.root).parent != NIL {
            return Err(VerifyError::BadLink);
        }
        self.verify_node(self.root)?;

        let depth = self.depth(self.root);
        // Red-black trees are no deeper than 2*log2(n+1).
        let bound = 2 * (usize::BITS - self.len.leading_zeros()) as usize;
        if depth > bound {
            return Err(VerifyError::Depth {
                depth,
                bound,
                len: self.len,
            });
        }
        Ok(())
    }

    // Returns the black height of the subtree at x.
    fn verify_node(&self, x: usize) -> Result<usize, VerifyError> {
        if x == NIL {
            return Ok(1);
        }
        let n = self.node(x);

        let mut end_max = n.end;
        for child in [n.left, n.right] {
            if child == NIL {
                continue;
            }
            let c = self.node(child);
            if c.parent != x {
                return Err(VerifyError::BadLink);
            }
            if n.color == Color::Red && c.color == Color::Red {
                return Err(VerifyError::RedRed);
            }
            end_max = end_max.max(c.end_max);
        }
        if n.left != NIL && self.node(n.left).start > n.start {
            return Err(VerifyError::SearchOrder);
        }
        if n.right != NIL && self.node(n.right).start < n.start {
            return Err(VerifyError::SearchOrder);
        }
        if end_max != n.end_max {
            return Err(VerifyError::StaleEndMax);
        }

        let lh = self.verify_node(n.left)?;
        let rh = self.verify_node(n.right)?;
        if lh != rh {
            return Err(VerifyError::BlackHeight);
        }
        Ok(lh + if n.color == Color::Black { 1 } else { 0 })
    }

    fn depth(&self, x: usize) -> usize {
        if x == NIL {
            return 0;
        }
        let n = self.node(x);
        1 + self.depth(n.left).max(self.depth(n.right))
    }

    fn node(&self, i: usize) -> &Node<R, D> {
        self.nodes[i].as_ref().expect("vacant interval tree slot")
    }

    fn node_mut(&mut self, i: usize) -> &mut Node<R, D> {
        self.nodes[i].as_mut().expect("vacant interval tree slot")
    }

    fn alloc(&mut self, node: Node<R, D>) -> usize {
        match self.free.pop() {
            Some(i) => {
                self.nodes[i] = Some(node);
                i
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        }
    }

    fn minimum(&self, mut x: usize) -> usize {
        while self.node(x).left != NIL {
            x = self.node(x).left;
        }
        x
    }

    fn is_black(&self, x: usize) -> bool {
        x == NIL || self.node(x).color == Color::Black
    }

    fn recompute_max(&mut self, x: usize) {
        let n = self.node(x);
        let mut m = n.end;
        let (l, r) = (n.left, n.right);
        if l != NIL {
            m = m.max(self.node(l).end_max);
        }
        if r != NIL {
            m = m.max(self.node(r).end_max);
        }
        self.node_mut(x).end_max = m;
    }

    fn update_max_upward(&mut self, mut x: usize) {
        while x != NIL {
            self.recompute_max(x);
            x = self.node(x).parent;
        }
    }

    // Replace the subtree rooted at u with the subtree rooted at v.
    fn transplant(&mut self, u: usize, v: usize) {
        let p = self.node(u).parent;
        if p == NIL {
            self.root = v;
        } else if self.node(p).left == u {
            self.node_mut(p).left = v;
        } else {
            self.node_mut(p).right = v;
        }
        if v != NIL {
            self.node_mut(v).parent = p;
        }
    }

    fn left_rotate(&mut self, x: usize) {
        let y = self.node(x).right;
        let yl = self.node(y).left;

        self.node_mut(x).right = yl;
        if yl != NIL {
            self.node_mut(yl).parent = x;
        }
        let xp = self.node(x).parent;
        self.node_mut(y).parent = xp;
        if xp == NIL {
            self.root = y;
        } else if self.node(xp).left == x {
            self.node_mut(xp).left = y;
        } else {
            self.node_mut(xp).right = y;
        }
        self.node_mut(y).left = x;
        self.node_mut(x).parent = y;

        self.recompute_max(x);
        self.recompute_max(y);
    }

    fn right_rotate(&mut self, x: usize) {
        let y = self.node(x).left;
        let yr = self.node(y).right;

        self.node_mut(x).left = yr;
        if yr != NIL {
            self.node_mut(yr).parent = x;
        }
        let xp = self.node(x).parent;
        self.node_mut(y).parent = xp;
        if xp == NIL {
            self.root = y;
        } else if self.node(xp).right == x {
            self.node_mut(xp).right = y;
        } else {
            self.node_mut(xp).left = y;
        }
        self.node_mut(y).right = x;
        self.node_mut(x).parent = y;

        self.recompute_max(x);
        self.recompute_max(y);
    }

    fn insert_fixup(&mut self, mut z: usize) {
        loop {
            let p = self.node(z).parent;
            if p == NIL || self.node(p).color != Color::Red {
                break;
            }
            let g = self.node(p).parent;

            if self.node(g).left == p {
                let u = self.node(g).right;
                if !self.is_black(u) {
                    self.node_mut(p).color = Color::Black;
                    self.node_mut(u).color = Color::Black;
                    self.node_mut(g).color = Color::Red;
                    z = g;
                } else {
                    if self.node(p).right == z {
                        z = p;
                        self.left_rotate(z);
                    }
                    let p = self.node(z).parent;
                    let g = self.node(p).parent;
                    self.node_mut(p).color = Color::Black;
                    self.node_mut(g).color = Color::Red;
                    self.right_rotate(g);
                }
            } else {
                let u = self.node(g).left;
                if !self.is_black(u) {
                    self.node_mut(p).color = Color::Black;
                    self.node_mut(u).color = Color::Black;
                    self.node_mut(g).color = Color::Red;
                    z = g;
                } else {
                    if self.node(p).left == z {
                        z = p;
                        self.right_rotate(z);
                    }
                    let p = self.node(z).parent;
                    let g = self.node(p).parent;
                    self.node_mut(p).color = Color::Black;
                    self.node_mut(g).color = Color::Red;
                    self.left_rotate(g);
                }
            }
        }
        let root = self.root;
        self.node_mut(root).color = Color::Black;
    }

    // `x` may be NIL; `x_parent` is its (conceptual) parent.
    fn delete_fixup(&mut self, mut x: usize, mut x_parent: usize) {
        while x != self.root && self.is_black(x) {
            if x_parent == NIL {
                break;
            }
            if self.node(x_parent).left == x {
                let mut w = self.node(x_parent).right;
                if !self.is_black(w) {
                    self.node_mut(w).color = Color::Black;
                    self.node_mut(x_parent).color = Color::Red;
                    self.left_rotate(x_parent);
                    w = self.node(x_parent).right;
                }
                if self.is_black(self.node(w).left) && self.is_black(self.node(w).right) {
                    self.node_mut(w).color = Color::Red;
                    x = x_parent;
                    x_parent = self.node(x).parent;
                } else {
                    if self.is_black(self.node(w).right) {
                        let wl = self.node(w).left;
                        if wl != NIL {
                            self.node_mut(wl).color = Color::Black;
                        }
                        self.node_mut(w).color = Color::Red;
                        self.right_rotate(w);
                        w = self.node(x_parent).right;
                    }
                    self.node_mut(w).color = self.node(x_parent).color;
                    self.node_mut(x_parent).color = Color::Black;
                    let wr = self.node(w).right;
                    if wr != NIL {
                        self.node_mut(wr).color = Color::Black;
                    }
                    self.left_rotate(x_parent);
                    x = self.root;
                    x_parent = NIL;
                }
            } else {
                let mut w = self.node(x_parent).left;
                if !self.is_black(w) {
                    self.node_mut(w).color = Color::Black;
                    self.node_mut(x_parent).color = Color::Red;
                    self.right_rotate(x_parent);
                    w = self.node(x_parent).left;
                }
                if self.is_black(self.node(w).left) && self.is_black(self.node(w).right) {
                    self.node_mut(w).color = Color::Red;
                    x = x_parent;
                    x_parent = self.node(x).parent;
                } else {
                    if self.is_black(self.node(w).left) {
                        let wr = self.node(w).right;
                        if wr != NIL {
                            self.node_mut(wr).color = Color::Black;
                        }
                        self.node_mut(w).color = Color::Red;
                        self.left_rotate(w);
                        w = self.node(x_parent).left;
                    }
                    self.node_mut(w).color = self.node(x_parent).color;
                    self.node_mut(x_parent).color = Color::Black;
                    let wl = self.node(w).left;
                    if wl != NIL {
                        self.node_mut(wl).color = Color::Black;
                    }
                    self.right_rotate(x_parent);
                    x = self.root;
                    x_parent = NIL;
                }
            }
        }
        if x != NIL {
            self.node_mut(x).color = Color::Black;
        }
    }
}

/// In-order iterator returned by [`IntervalTree::iter`].
pub struct Iter<'t, R, D> {
    tree: &'t IntervalTree<R, D>,
    stack: Vec<usize>,
}

impl<'t, R, D> Iterator for Iter<'t, R, D>
where
    R: Copy + Ord,
    D: PartialEq,
{
    type Item = (R, R, &'t D);

    fn next(&mut self) -> Option<Self::Item> {
        let x = self.stack.pop()?;
        let n = self.tree.node(x);

        let mut r = n.right;
        while r != NIL {
            self.stack.push(r);
            r = self.tree.node(r).left;
        }
        Some((n.start, n.end, &n.data))
    }
}
