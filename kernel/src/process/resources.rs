//! Managed resources
//!
//! Each process carries a singly-linked list of `(free_fn, resource,
//! data)` records. Destroying the process invokes every callback exactly
//! once, in list order. This is how IPC channels, message buffers,
//! memory regions, and thread kernel stacks get reclaimed
//! deterministically on exit, without the process layer knowing what any
//! of them are.

use core::ptr;

/// Cleanup callback: `(resource, data)` as registered.
pub type FreeFn = unsafe fn(*mut u8, *mut u8);

#[repr(C)]
pub struct ManagedResource {
    pub(crate) next: *mut ManagedResource,
    pub free_fn: Option<FreeFn>,
    pub resource: *mut u8,
    pub data: *mut u8,
    _reserved: [u64; 4],
}

const _: () = assert!(core::mem::size_of::<ManagedResource>() == 64);

impl ManagedResource {
    pub fn new(free_fn: FreeFn, resource: *mut u8, data: *mut u8) -> Self {
        Self {
            next: ptr::null_mut(),
            free_fn: Some(free_fn),
            resource,
            data,
            _reserved: [0; 4],
        }
    }
}

/// Invoke every record's callback, head to tail.
///
/// The callbacks own their records: a `free_fn` may free its node (they
/// are usually slab objects), so each `next` is read before the call.
///
/// # Safety
/// `head` must be a well-formed list of live records, and no record may
/// be reachable from anywhere else once this runs.
pub unsafe fn free_all(head: *mut ManagedResource) {
    let mut cursor = head;
    while !cursor.is_null() {
        // SAFETY: cursor is live until its own free_fn runs.
        unsafe {
            let next = (*cursor).next;
            if let Some(free_fn) = (*cursor).free_fn {
                free_fn((*cursor).resource, (*cursor).data);
            }
            cursor = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    unsafe fn record_call(resource: *mut u8, data: *mut u8) {
        // Encode call order into the resource slot for the assertions.
        // SAFETY: tests pass pointers to usize slots.
        unsafe {
            *(resource as *mut usize) = CALLS.fetch_add(1, Ordering::SeqCst) + 1;
            *(data as *mut usize) += 1;
        }
    }

    #[test]
    fn free_all_runs_each_callback_once_in_order() {
        CALLS.store(0, Ordering::SeqCst);

        let mut order_a = 0usize;
        let mut order_b = 0usize;
        let mut count = 0usize;

        let mut b = ManagedResource::new(
            record_call,
            &mut order_b as *mut usize as *mut u8,
            &mut count as *mut usize as *mut u8,
        );
        let mut a = ManagedResource::new(
            record_call,
            &mut order_a as *mut usize as *mut u8,
            &mut count as *mut usize as *mut u8,
        );
        a.next = &mut b;

        unsafe { free_all(&mut a) };

        assert_eq!(count, 2);
        assert!(order_a < order_b);
        assert_eq!(order_a + 1, order_b);
    }

    #[test]
    fn empty_list_is_a_no_op() {
        unsafe { free_all(core::ptr::null_mut()) };
    }
}
