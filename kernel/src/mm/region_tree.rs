//! User memory region tree
//!
//! Height-balanced (AVL) tree of `[start, end)` intervals keyed by start,
//! one per process, used to validate user pointers and locate regions on
//! fault paths. Nodes are slab objects; the owning process's meminfo lock
//! serializes access.

use core::ptr;

use crate::mm::slab::SlabAllocator;
use crate::mm::USERSPACE_LIMIT;

/// One mapped user region. `end` is exclusive and capped at
/// `USERSPACE_LIMIT`.
#[repr(C)]
pub struct Region {
    pub start: usize,
    pub end: usize,
    pub flags: u64,
    left: *mut Region,
    right: *mut Region,
    height: u64,
    _reserved: [u64; 2],
}

const _: () = assert!(core::mem::size_of::<Region>() == 64);

/// Region flags: region is mapped on demand rather than up front.
pub const REGION_AUTOMAP: u64 = 0x01;

fn height(node: *mut Region) -> i64 {
    if node.is_null() {
        0
    } else {
        // SAFETY: non-null nodes are live tree members.
        unsafe { (*node).height as i64 }
    }
}

fn balance_of(node: *mut Region) -> i64 {
    if node.is_null() {
        0
    } else {
        // SAFETY: non-null nodes are live tree members.
        unsafe { height((*node).left) - height((*node).right) }
    }
}

unsafe fn fix_height(node: *mut Region) {
    // SAFETY: caller passes a live node.
    unsafe {
        (*node).height = (1 + height((*node).left).max(height((*node).right))) as u64;
    }
}

unsafe fn rotate_right(y: *mut Region) -> *mut Region {
    // SAFETY: rotation preconditions guarantee y and y.left are live.
    unsafe {
        let x = (*y).left;
        let t2 = (*x).right;

        (*x).right = y;
        (*y).left = t2;

        fix_height(y);
        fix_height(x);

        x
    }
}

unsafe fn rotate_left(x: *mut Region) -> *mut Region {
    // SAFETY: rotation preconditions guarantee x and x.right are live.
    unsafe {
        let y = (*x).right;
        let t2 = (*y).left;

        (*y).left = x;
        (*x).right = t2;

        fix_height(x);
        fix_height(y);

        y
    }
}

unsafe fn insert_node(node: *mut Region, new_region: *mut Region) -> *mut Region {
    if node.is_null() {
        return new_region;
    }

    // SAFETY: node and new_region are live; recursion preserves that.
    unsafe {
        if (*new_region).start < (*node).start {
            (*node).left = insert_node((*node).left, new_region);
        } else {
            (*node).right = insert_node((*node).right, new_region);
        }

        fix_height(node);

        let balance = balance_of(node);

        // Left Left
        if balance > 1 && (*new_region).start < (*(*node).left).start {
            return rotate_right(node);
        }

        // Right Right
        if balance < -1 && (*new_region).start >= (*(*node).right).start {
            return rotate_left(node);
        }

        // Left Right
        if balance > 1 && (*new_region).start >= (*(*node).left).start {
            (*node).left = rotate_left((*node).left);
            return rotate_right(node);
        }

        // Right Left
        if balance < -1 && (*new_region).start < (*(*node).right).start {
            (*node).right = rotate_right((*node).right);
            return rotate_left(node);
        }
    }

    node
}

unsafe fn min_value_node(node: *mut Region) -> *mut Region {
    let mut current = node;
    // SAFETY: left links of live nodes are live or null.
    unsafe {
        while !current.is_null() && !(*current).left.is_null() {
            current = (*current).left;
        }
    }
    current
}

unsafe fn remove_node(root: *mut Region, start: usize, slab: &SlabAllocator) -> *mut Region {
    if root.is_null() {
        return ptr::null_mut();
    }

    // SAFETY: all touched nodes are live tree members.
    unsafe {
        if start < (*root).start {
            (*root).left = remove_node((*root).left, start, slab);
        } else if start > (*root).start {
            (*root).right = remove_node((*root).right, start, slab);
        } else if (*root).left.is_null() || (*root).right.is_null() {
            let child = if (*root).left.is_null() {
                (*root).right
            } else {
                (*root).left
            };
            slab.free(ptr::NonNull::new_unchecked(root));
            return child;
        } else {
            // Two children: splice in the in-order successor's interval.
            let successor = min_value_node((*root).right);
            (*root).start = (*successor).start;
            (*root).end = (*successor).end;
            (*root).flags = (*successor).flags;
            (*root).right = remove_node((*root).right, (*successor).start, slab);
        }

        fix_height(root);
        let balance = balance_of(root);

        if balance > 1 && balance_of((*root).left) >= 0 {
            return rotate_right(root);
        }

        if balance > 1 && balance_of((*root).left) < 0 {
            (*root).left = rotate_left((*root).left);
            return rotate_right(root);
        }

        if balance < -1 && balance_of((*root).right) <= 0 {
            return rotate_left(root);
        }

        if balance < -1 && balance_of((*root).right) > 0 {
            (*root).right = rotate_right((*root).right);
            return rotate_left(root);
        }
    }

    root
}

unsafe fn visit_in_order(node: *mut Region, f: &mut dyn FnMut(&Region)) {
    if node.is_null() {
        return;
    }
    // SAFETY: live node; recursion preserves that.
    unsafe {
        visit_in_order((*node).left, f);
        f(&*node);
        visit_in_order((*node).right, f);
    }
}

unsafe fn free_subtree(node: *mut Region, slab: &SlabAllocator) {
    if node.is_null() {
        return;
    }
    // SAFETY: every node is a live slab object freed exactly once.
    unsafe {
        free_subtree((*node).left, slab);
        free_subtree((*node).right, slab);
        slab.free(ptr::NonNull::new_unchecked(node));
    }
}

/// Per-process interval tree of user memory regions.
pub struct RegionTree {
    slab: &'static SlabAllocator,
    root: *mut Region,
}

impl RegionTree {
    pub const fn new(slab: &'static SlabAllocator) -> Self {
        Self {
            slab,
            root: ptr::null_mut(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_null()
    }

    /// Insert `[start, end)`. Empty intervals and intervals reaching past
    /// `USERSPACE_LIMIT` are refused; so is allocation failure.
    pub fn insert(&mut self, start: usize, end: usize, flags: u64) -> bool {
        if end <= start || end > USERSPACE_LIMIT {
            return false;
        }

        let node = match self.slab.alloc_zeroed::<Region>() {
            Some(node) => node.as_ptr(),
            None => return false,
        };

        // SAFETY: fresh node.
        unsafe {
            (*node).start = start;
            (*node).end = end;
            (*node).flags = flags;
            (*node).height = 1;
            self.root = insert_node(self.root, node);
        }

        #[cfg(any(debug_assertions, feature = "conservative"))]
        assert!(self.check_invariants());

        true
    }

    /// The region containing `addr`, if any.
    pub fn lookup(&self, addr: usize) -> Option<&Region> {
        let mut node = self.root;
        // SAFETY: tree links are live or null.
        unsafe {
            while !node.is_null() {
                if addr < (*node).start {
                    node = (*node).left;
                } else if addr >= (*node).end {
                    node = (*node).right;
                } else {
                    return Some(&*node);
                }
            }
        }
        None
    }

    /// Remove the region starting exactly at `start`. No-op if absent.
    pub fn remove(&mut self, start: usize) {
        // SAFETY: root is this tree's root.
        unsafe {
            self.root = remove_node(self.root, start, self.slab);
        }

        #[cfg(any(debug_assertions, feature = "conservative"))]
        assert!(self.check_invariants());
    }

    /// Grow or shrink the region containing `addr` to end at `new_end`.
    pub fn resize(&mut self, addr: usize, new_end: usize) -> bool {
        let mut node = self.root;
        // SAFETY: tree links are live or null.
        unsafe {
            while !node.is_null() {
                if addr < (*node).start {
                    node = (*node).left;
                } else if addr >= (*node).end {
                    node = (*node).right;
                } else {
                    if new_end <= (*node).start || new_end > USERSPACE_LIMIT {
                        return false;
                    }
                    (*node).end = new_end;
                    return true;
                }
            }
        }
        false
    }

    /// In-order traversal.
    pub fn visit_all(&self, f: &mut dyn FnMut(&Region)) {
        // SAFETY: root is this tree's root.
        unsafe { visit_in_order(self.root, f) };
    }

    /// Free every node back to the slab.
    pub fn free_all(&mut self) {
        // SAFETY: root is this tree's root; nodes freed exactly once.
        unsafe { free_subtree(self.root, self.slab) };
        self.root = ptr::null_mut();
    }

    /// Verify AVL balance and strictly increasing in-order starts.
    pub fn check_invariants(&self) -> bool {
        fn check(node: *mut Region, last_start: &mut Option<usize>) -> bool {
            if node.is_null() {
                return true;
            }
            // SAFETY: live node.
            unsafe {
                if !check((*node).left, last_start) {
                    return false;
                }
                if let Some(last) = *last_start {
                    if (*node).start <= last {
                        return false;
                    }
                }
                *last_start = Some((*node).start);

                if balance_of(node).abs() > 1 {
                    return false;
                }

                check((*node).right, last_start)
            }
        }

        let mut last = None;
        check(self.root, &mut last)
    }
}

// SAFETY: tree mutation is serialized by the owning process's lock.
unsafe impl Send for RegionTree {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::slab::tests::test_slab;

    fn tree() -> RegionTree {
        RegionTree::new(test_slab())
    }

    #[test]
    fn lookup_finds_containing_region() {
        let mut tree = tree();
        assert!(tree.insert(0x1000, 0x2000, 0));
        assert!(tree.insert(0x2000, 0x3000, 0));
        assert!(tree.insert(0x3000, 0x4000, 0));

        let mid = tree.lookup(0x2fff).unwrap();
        assert_eq!(mid.start, 0x2000);
        assert!(tree.lookup(0x4000).is_none());
        assert!(tree.lookup(0xfff).is_none());
    }

    #[test]
    fn remove_middle_keeps_neighbours_and_balance() {
        let mut tree = tree();
        tree.insert(0x1000, 0x2000, 0);
        tree.insert(0x2000, 0x3000, 0);
        tree.insert(0x3000, 0x4000, 0);

        tree.remove(0x2000);

        assert!(tree.lookup(0x2fff).is_none());
        assert!(tree.lookup(0x1000).is_some());
        assert!(tree.lookup(0x3000).is_some());
        assert!(tree.check_invariants());
    }

    #[test]
    fn insert_rejects_invalid_intervals() {
        let mut tree = tree();
        assert!(!tree.insert(0x2000, 0x2000, 0));
        assert!(!tree.insert(0x3000, 0x2000, 0));
        // End exactly at the limit is fine; one byte past is not.
        assert!(tree.insert(USERSPACE_LIMIT - 0x1000, USERSPACE_LIMIT, 0));
        assert!(!tree.insert(0x5000, USERSPACE_LIMIT + 1, 0));
    }

    #[test]
    fn ascending_inserts_stay_balanced() {
        let mut tree = tree();
        for i in 0..64usize {
            assert!(tree.insert(0x1000 * (i + 1), 0x1000 * (i + 2), 0));
        }
        assert!(tree.check_invariants());

        // Everything findable after all those rotations.
        for i in 0..64usize {
            assert!(tree.lookup(0x1000 * (i + 1)).is_some());
        }
    }

    #[test]
    fn in_order_traversal_is_sorted() {
        let mut tree = tree();
        for start in [0x5000usize, 0x1000, 0x9000, 0x3000, 0x7000] {
            tree.insert(start, start + 0x1000, 0);
        }

        let mut starts = std::vec::Vec::new();
        tree.visit_all(&mut |r| starts.push(r.start));
        assert_eq!(starts, [0x1000, 0x3000, 0x5000, 0x7000, 0x9000]);
    }

    #[test]
    fn resize_checks_bounds() {
        let mut tree = tree();
        tree.insert(0x1000, 0x2000, 0);

        assert!(tree.resize(0x1000, 0x8000));
        assert_eq!(tree.lookup(0x7fff).unwrap().end, 0x8000);

        assert!(!tree.resize(0x1000, 0x1000));
        assert!(!tree.resize(0x1000, USERSPACE_LIMIT + 1));
        assert!(!tree.resize(0x9000, 0xa000));
    }

    #[test]
    fn free_all_returns_nodes_to_slab() {
        let slab = test_slab();
        let mut tree = RegionTree::new(slab);

        for i in 0..8usize {
            tree.insert(0x1000 * (i + 1), 0x1000 * (i + 2), 0);
        }
        let free_before = slab.free_count();

        tree.free_all();
        assert!(tree.is_empty());
        assert_eq!(slab.free_count(), free_before + 8);
    }
}
