//! Processes
//!
//! A process owns an address space root, its tasks, its user memory
//! regions, a list of tracked physical pages, and a managed-resource
//! list. All four records here are slab-sized; destruction frees every
//! managed resource and every owned page whose share count drops to
//! zero.

pub mod memory;
pub mod resources;

use core::cell::Cell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU64, Ordering};

use crate::mm::region_tree::RegionTree;
use crate::mm::KernelEnv;
use crate::sched::task::Task;
use crate::sync::RawSpinLock;
use memory::ProcessPages;
use resources::ManagedResource;

/// Task-list node: the process side of the task ↔ process cycle. The
/// process owns these nodes; tasks point back without owning.
#[repr(C)]
pub struct ProcessTask {
    next: *mut ProcessTask,
    pub task: *mut Task,
    _reserved: [u64; 6],
}

const _: () = assert!(core::mem::size_of::<ProcessTask>() == 64);

#[repr(C)]
pub struct ProcessMemoryInfo {
    pub(crate) pages_lock: NonNull<RawSpinLock>,
    pub(crate) res_lock: NonNull<RawSpinLock>,
    pub(crate) pages: *mut ProcessPages,
    pub(crate) res_head: *mut ManagedResource,
    pub(crate) res_tail: *mut ManagedResource,
    pub regions: RegionTree,
    _reserved: u64,
}

const _: () = assert!(core::mem::size_of::<ProcessMemoryInfo>() == 64);

#[repr(C)]
pub struct Process {
    /// Bad capability presentations; feeds the brute-force delay.
    pub cap_failures: Cell<u64>,
    pub pid: u64,
    pub pml4: u64,
    tasks: *mut ProcessTask,
    pub meminfo: *mut ProcessMemoryInfo,
    _reserved: [u64; 3],
}

const _: () = assert!(core::mem::size_of::<Process>() == 64);

// SAFETY: mutation goes through the meminfo locks; cap_failures races
// only advisorily (it feeds a delay heuristic).
unsafe impl Send for Process {}
unsafe impl Sync for Process {}

static NEXT_PID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process and its memory-info records. Returns None (leaving
/// nothing allocated) when the slab is exhausted.
pub fn process_create(env: KernelEnv, pml4: u64) -> Option<NonNull<Process>> {
    let pages_lock = env.slab.alloc_init(RawSpinLock::new())?;

    let Some(res_lock) = env.slab.alloc_init(RawSpinLock::new()) else {
        // SAFETY: unpublished allocation.
        unsafe { env.slab.free(pages_lock) };
        return None;
    };

    let meminfo = env.slab.alloc_init(ProcessMemoryInfo {
        pages_lock,
        res_lock,
        pages: ptr::null_mut(),
        res_head: ptr::null_mut(),
        res_tail: ptr::null_mut(),
        regions: RegionTree::new(env.slab),
        _reserved: 0,
    });

    let Some(meminfo) = meminfo else {
        // SAFETY: unpublished allocations.
        unsafe {
            env.slab.free(res_lock);
            env.slab.free(pages_lock);
        }
        return None;
    };

    let process = env.slab.alloc_init(Process {
        cap_failures: Cell::new(0),
        pid: NEXT_PID.fetch_add(1, Ordering::Relaxed),
        pml4,
        tasks: ptr::null_mut(),
        meminfo: meminfo.as_ptr(),
        _reserved: [0; 3],
    });

    if process.is_none() {
        // SAFETY: unpublished allocations.
        unsafe {
            env.slab.free(meminfo);
            env.slab.free(res_lock);
            env.slab.free(pages_lock);
        }
    }

    process
}

/// Tear the process down: run every managed-resource callback, release
/// the owned pages (frames whose share count reaches zero go back to the
/// region), free the region tree, then the records themselves.
///
/// # Safety
/// `process` must have no running tasks and no other live references.
pub unsafe fn process_destroy(env: KernelEnv, process: NonNull<Process>) {
    // SAFETY: process and meminfo are live until freed below.
    unsafe {
        let p = process.as_ptr();
        let meminfo = (*p).meminfo;

        resources::free_all((*meminfo).res_head);

        memory::release_owned_pages(env, process);

        (*meminfo).regions.free_all();

        let mut task_node = (*p).tasks;
        while !task_node.is_null() {
            let next = (*task_node).next;
            env.slab.free(NonNull::new_unchecked(task_node));
            task_node = next;
        }

        env.slab.free((*meminfo).res_lock);
        env.slab.free((*meminfo).pages_lock);
        env.slab.free(NonNull::new_unchecked(meminfo));
        env.slab.free(process);
    }
}

/// Link `task` into the process's task list.
pub fn process_attach_task(env: KernelEnv, process: NonNull<Process>, task: NonNull<Task>) -> bool {
    let Some(node) = env.slab.alloc_zeroed::<ProcessTask>() else {
        return false;
    };

    // SAFETY: fresh node; list mutation is single-threaded per process
    // creation path (tasks are attached before the process runs).
    unsafe {
        (*node.as_ptr()).task = task.as_ptr();
        (*node.as_ptr()).next = (*process.as_ptr()).tasks;
        (*process.as_ptr()).tasks = node.as_ptr();
    }

    true
}

/// Append a managed resource to the process's cleanup list.
pub fn process_add_managed_resource(
    process: NonNull<Process>,
    resource: NonNull<ManagedResource>,
) -> bool {
    // SAFETY: process and meminfo are live; list is under res_lock.
    unsafe {
        let meminfo = (*process.as_ptr()).meminfo;
        let lock = (*meminfo).res_lock.as_ref();
        let flags = lock.lock_irqsave();

        (*resource.as_ptr()).next = ptr::null_mut();

        if (*meminfo).res_tail.is_null() {
            (*meminfo).res_head = resource.as_ptr();
        } else {
            (*(*meminfo).res_tail).next = resource.as_ptr();
        }
        (*meminfo).res_tail = resource.as_ptr();

        lock.unlock_irqrestore(flags);
    }
    true
}

/// Unlink a managed resource (it will no longer run at destroy time).
pub fn process_remove_managed_resource(
    process: NonNull<Process>,
    resource: NonNull<ManagedResource>,
) -> bool {
    // SAFETY: process and meminfo are live; list is under res_lock.
    unsafe {
        let meminfo = (*process.as_ptr()).meminfo;
        let lock = (*meminfo).res_lock.as_ref();
        let flags = lock.lock_irqsave();

        let mut cursor = (*meminfo).res_head;
        let mut prev: *mut ManagedResource = ptr::null_mut();

        while !cursor.is_null() {
            if cursor == resource.as_ptr() {
                if prev.is_null() {
                    (*meminfo).res_head = (*cursor).next;
                } else {
                    (*prev).next = (*cursor).next;
                }
                if (*meminfo).res_tail == cursor {
                    (*meminfo).res_tail = prev;
                }
                lock.unlock_irqrestore(flags);
                return true;
            }
            prev = cursor;
            cursor = (*cursor).next;
        }

        lock.unlock_irqrestore(flags);
    }
    false
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mm::fba::tests::test_fba;
    use crate::mm::refcount::RefCountMap;
    use crate::mm::slab::SlabAllocator;
    use std::boxed::Box;

    pub fn test_env() -> KernelEnv {
        let fba = test_fba(128);
        let slab: &'static SlabAllocator = Box::leak(Box::new(SlabAllocator::new(fba)));
        KernelEnv {
            region: crate::mm::fba::tests::test_region(64),
            fba,
            slab,
            refcounts: Box::leak(Box::new(RefCountMap::new(fba, slab).unwrap())),
        }
    }

    #[test]
    fn pids_are_monotonic() {
        let env = test_env();
        let a = process_create(env, 0x1000).unwrap();
        let b = process_create(env, 0x2000).unwrap();

        unsafe {
            assert!(a.as_ref().pid < b.as_ref().pid);
            process_destroy(env, a);
            process_destroy(env, b);
        }
    }

    #[test]
    fn managed_resources_run_once_at_destroy() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static FREED: AtomicUsize = AtomicUsize::new(0);

        unsafe fn count_free(_resource: *mut u8, _data: *mut u8) {
            FREED.fetch_add(1, Ordering::SeqCst);
        }

        let env = test_env();
        let process = process_create(env, 0).unwrap();

        for _ in 0..3 {
            let node = env
                .slab
                .alloc_init(ManagedResource::new(
                    count_free,
                    ptr::null_mut(),
                    ptr::null_mut(),
                ))
                .unwrap();
            assert!(process_add_managed_resource(process, node));
        }

        FREED.store(0, Ordering::SeqCst);
        unsafe { process_destroy(env, process) };
        assert_eq!(FREED.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn removed_resources_do_not_run() {
        use core::sync::atomic::{AtomicUsize, Ordering};
        static FREED: AtomicUsize = AtomicUsize::new(0);

        unsafe fn count_free(_resource: *mut u8, _data: *mut u8) {
            FREED.fetch_add(1, Ordering::SeqCst);
        }

        let env = test_env();
        let process = process_create(env, 0).unwrap();

        let keep = env
            .slab
            .alloc_init(ManagedResource::new(count_free, ptr::null_mut(), ptr::null_mut()))
            .unwrap();
        let drop_me = env
            .slab
            .alloc_init(ManagedResource::new(count_free, ptr::null_mut(), ptr::null_mut()))
            .unwrap();

        process_add_managed_resource(process, keep);
        process_add_managed_resource(process, drop_me);
        assert!(process_remove_managed_resource(process, drop_me));
        unsafe { env.slab.free(drop_me) };

        FREED.store(0, Ordering::SeqCst);
        unsafe { process_destroy(env, process) };
        assert_eq!(FREED.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attach_task_links_into_list() {
        let env = test_env();
        let process = process_create(env, 0).unwrap();
        let task = crate::sched::task::create(
            env.fba,
            env.slab,
            process.as_ptr(),
            0,
            0,
            0,
            crate::sched::task::TaskClass::Normal,
        )
        .unwrap();

        assert!(process_attach_task(env, process, task));
        unsafe {
            assert_eq!((*process.as_ref().tasks).task, task.as_ptr());
            crate::sched::task::destroy(task, env.fba, env.slab);
            process_destroy(env, process);
        }
    }
}
