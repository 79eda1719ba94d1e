//! Syscall handlers
//!
//! Thin argument-validation wrappers over the kernel subsystems. User
//! pointers are checked against the userspace limit before any access;
//! no handler touches state before its arguments pass.

use core::ptr::NonNull;

use super::{
    ProcessCreateParams, ProcessMemoryRegion, SyscallArg, MAX_PROCESS_REGIONS, SYSCALL_BADARGS,
    SYSCALL_BAD_NAME, SYSCALL_FAILURE, SYSCALL_NOT_IMPL, SYSCALL_OK,
};
use crate::ipc::named::MAX_CHANNEL_NAME_LENGTH;
use crate::mm::address_space::{address_space_create, AddressSpaceRegion, MAX_STACK_VALUE_COUNT};
use crate::mm::region_tree::REGION_AUTOMAP;
use crate::mm::vmm::{self, PageFlags};
use crate::mm::{PAGE_SIZE, USERSPACE_LIMIT};
use crate::process::{self, Process};
use crate::sched::task::{self, TaskClass};
use crate::sched::{self, sched_lock_this_cpu, sched_unlock_this_cpu};

/// `[ptr, ptr + len)` must sit entirely in user space.
fn user_range_ok(ptr: u64, len: u64) -> bool {
    let end = match ptr.checked_add(len) {
        Some(end) => end,
        None => return false,
    };
    end <= USERSPACE_LIMIT as u64
}

fn current_process() -> Option<NonNull<Process>> {
    task::current().and_then(|task| {
        // SAFETY: the current task is live; its owner is live or null.
        unsafe { NonNull::new((*task.as_ptr()).owner) }
    })
}

/// Name bytes for the named-channel calls: scan to the NUL, bounded by
/// the maximum significant length.
fn name_arg<'a>(ptr: u64) -> Option<&'a [u8]> {
    if ptr == 0 || !user_range_ok(ptr, MAX_CHANNEL_NAME_LENGTH as u64) {
        return None;
    }

    let base = ptr as *const u8;
    let mut len = 0;
    while len < MAX_CHANNEL_NAME_LENGTH {
        // SAFETY: range-checked above, one byte at a time up to the cap.
        if unsafe { *base.add(len) } == 0 {
            break;
        }
        len += 1;
    }

    // SAFETY: just scanned as readable.
    Some(unsafe { core::slice::from_raw_parts(base, len) })
}

pub fn debug_print(args: [SyscallArg; 5]) -> i64 {
    let [ptr, len, ..] = args;

    if len == 0 {
        return SYSCALL_OK;
    }
    if !user_range_ok(ptr, len) || ptr == 0 {
        return SYSCALL_BADARGS;
    }

    // SAFETY: range-checked above.
    let bytes = unsafe { core::slice::from_raw_parts(ptr as *const u8, len as usize) };
    crate::klog::write_bytes(bytes);
    SYSCALL_OK
}

pub fn debug_char(args: [SyscallArg; 5]) -> i64 {
    crate::klog::write_bytes(&[args[0] as u8]);
    SYSCALL_OK
}

pub fn create_thread(args: [SyscallArg; 5]) -> i64 {
    let [entry, user_stack, ..] = args;

    if !user_range_ok(entry, 0) || !user_range_ok(user_stack, 0) {
        return SYSCALL_BADARGS;
    }

    let Ok(env) = crate::mm::kernel_env() else {
        return SYSCALL_FAILURE;
    };
    let Some(process) = current_process() else {
        return SYSCALL_FAILURE;
    };

    let Some(thread) = task::create(
        env.fba,
        env.slab,
        process.as_ptr(),
        user_stack as usize,
        0,
        entry as usize,
        TaskClass::Normal,
    ) else {
        return SYSCALL_FAILURE;
    };

    if !process::process_attach_task(env, process, thread) {
        // SAFETY: unpublished task.
        unsafe { task::destroy(thread, env.fba, env.slab) };
        return SYSCALL_FAILURE;
    }

    sched_lock_this_cpu();
    // SAFETY: fresh task, not yet queued; sched lock held.
    unsafe { sched::unblock(thread) };
    sched_unlock_this_cpu();

    // SAFETY: thread's sidecar is live.
    unsafe { (*(*thread.as_ptr()).sched).tid as i64 }
}

pub fn memstats(args: [SyscallArg; 5]) -> i64 {
    let [out_ptr, ..] = args;

    if out_ptr == 0 || !user_range_ok(out_ptr, 16) || out_ptr % 8 != 0 {
        return SYSCALL_BADARGS;
    }

    let Ok(region) = crate::mm::physical_region() else {
        return SYSCALL_FAILURE;
    };

    // SAFETY: range-checked, aligned; two u64 slots.
    unsafe {
        let out = out_ptr as *mut u64;
        *out = region.total_size();
        *out.add(1) = region.free_bytes();
    }

    SYSCALL_OK
}

pub fn sleep(args: [SyscallArg; 5]) -> i64 {
    let [nanos, ..] = args;

    let Some(current) = task::current() else {
        return SYSCALL_FAILURE;
    };

    sched_lock_this_cpu();
    // SAFETY: current task on this CPU; sched lock held.
    let slept = unsafe { sched::sleep::sleep_task(current, nanos) };
    sched_unlock_this_cpu();

    if slept {
        SYSCALL_OK
    } else {
        SYSCALL_FAILURE
    }
}

pub fn create_process(args: [SyscallArg; 5]) -> i64 {
    let [params_ptr, ..] = args;

    if params_ptr == 0
        || params_ptr % core::mem::align_of::<ProcessCreateParams>() as u64 != 0
        || !user_range_ok(params_ptr, core::mem::size_of::<ProcessCreateParams>() as u64)
    {
        return SYSCALL_BADARGS;
    }

    // SAFETY: range-checked and aligned.
    let params = unsafe { *(params_ptr as *const ProcessCreateParams) };

    if params.region_count as usize > MAX_PROCESS_REGIONS
        || params.stack_value_count as usize > MAX_STACK_VALUE_COUNT
    {
        return SYSCALL_BADARGS;
    }

    let Ok(env) = crate::mm::kernel_env() else {
        return SYSCALL_FAILURE;
    };

    let mut regions = [AddressSpaceRegion {
        start: 0,
        len_bytes: 0,
    }; MAX_PROCESS_REGIONS];

    if params.region_count > 0 {
        let bytes =
            params.region_count as u64 * core::mem::size_of::<ProcessMemoryRegion>() as u64;
        if params.regions == 0 || !user_range_ok(params.regions, bytes) {
            return SYSCALL_BADARGS;
        }

        // SAFETY: range-checked; packed entries are read unaligned.
        unsafe {
            let src = params.regions as *const ProcessMemoryRegion;
            for (i, slot) in regions
                .iter_mut()
                .enumerate()
                .take(params.region_count as usize)
            {
                let region = core::ptr::read_unaligned(src.add(i));
                *slot = AddressSpaceRegion {
                    start: region.start as usize,
                    len_bytes: region.len_bytes as usize,
                };
            }
        }
    }

    let mut stack_values = [0u64; MAX_STACK_VALUE_COUNT];
    if params.stack_value_count > 0 {
        let bytes = params.stack_value_count as u64 * 8;
        if params.stack_values == 0
            || params.stack_values % 8 != 0
            || !user_range_ok(params.stack_values, bytes)
        {
            return SYSCALL_BADARGS;
        }

        // SAFETY: range-checked and aligned.
        unsafe {
            core::ptr::copy_nonoverlapping(
                params.stack_values as *const u64,
                stack_values.as_mut_ptr(),
                params.stack_value_count as usize,
            );
        }
    }

    let Some(pml4) = address_space_create(
        env,
        params.stack_base as usize,
        params.stack_size as usize,
        &regions[..params.region_count as usize],
        &stack_values[..params.stack_value_count as usize],
    ) else {
        return SYSCALL_FAILURE;
    };

    let Some(new_process) = process::process_create(env, pml4) else {
        return SYSCALL_FAILURE;
    };

    let stack_top = (params.stack_base + params.stack_size) as usize
        - params.stack_value_count as usize * 8;

    let Some(initial_task) = task::create(
        env.fba,
        env.slab,
        new_process.as_ptr(),
        stack_top,
        0,
        params.entry_point as usize,
        TaskClass::Normal,
    ) else {
        // SAFETY: the process has no tasks yet.
        unsafe { process::process_destroy(env, new_process) };
        return SYSCALL_FAILURE;
    };

    if !process::process_attach_task(env, new_process, initial_task) {
        // SAFETY: unpublished task and process.
        unsafe {
            task::destroy(initial_task, env.fba, env.slab);
            process::process_destroy(env, new_process);
        }
        return SYSCALL_FAILURE;
    }

    sched_lock_this_cpu();
    // SAFETY: fresh task; sched lock held.
    unsafe { sched::unblock(initial_task) };
    sched_unlock_this_cpu();

    // SAFETY: live process record.
    unsafe { new_process.as_ref().pid as i64 }
}

pub fn map_virtual(args: [SyscallArg; 5]) -> i64 {
    let [addr, size, ..] = args;

    if addr == 0
        || size == 0
        || addr % PAGE_SIZE as u64 != 0
        || size % PAGE_SIZE as u64 != 0
        || !user_range_ok(addr, size)
    {
        return SYSCALL_BADARGS;
    }

    let Ok(env) = crate::mm::kernel_env() else {
        return SYSCALL_FAILURE;
    };
    let Some(process) = current_process() else {
        return SYSCALL_FAILURE;
    };

    // Record the region first, then back it page by page.
    // SAFETY: meminfo is live; the region tree is process-local.
    unsafe {
        if !(*process.as_ref().meminfo).regions.insert(
            addr as usize,
            (addr + size) as usize,
            0,
        ) {
            return SYSCALL_FAILURE;
        }
    }

    let pages = size as usize / PAGE_SIZE;
    for i in 0..pages {
        let virt = addr as usize + i * PAGE_SIZE;

        let Some(phys) = process::memory::process_page_alloc(env, process, env.region) else {
            // Roll back what this call built.
            for j in 0..i {
                let undo = addr as usize + j * PAGE_SIZE;
                if let Some(phys) = vmm::virt_to_phys_page(undo) {
                    // SAFETY: mapped just above.
                    unsafe { vmm::unmap_page(undo) };
                    process::memory::process_page_free(env, process, phys);
                }
            }
            // SAFETY: meminfo is live.
            unsafe {
                (*process.as_ref().meminfo).regions.remove(addr as usize);
            }
            return SYSCALL_FAILURE;
        };

        // SAFETY: user page in a range this process just claimed.
        unsafe {
            vmm::map_page(
                virt,
                phys,
                PageFlags::PRESENT | PageFlags::WRITE | PageFlags::USER,
            );
        }
    }

    addr as i64
}

pub fn unmap_virtual(args: [SyscallArg; 5]) -> i64 {
    let [addr, size, ..] = args;

    if addr % PAGE_SIZE as u64 != 0 || size == 0 || !user_range_ok(addr, size) {
        return SYSCALL_BADARGS;
    }

    let Ok(env) = crate::mm::kernel_env() else {
        return SYSCALL_FAILURE;
    };
    let Some(process) = current_process() else {
        return SYSCALL_FAILURE;
    };

    let pages = (size as usize).div_ceil(PAGE_SIZE);
    for i in 0..pages {
        let virt = addr as usize + i * PAGE_SIZE;
        if let Some(phys) = vmm::virt_to_phys_page(virt) {
            // SAFETY: the process is done with this mapping.
            unsafe { vmm::unmap_page(virt) };
            process::memory::process_page_free(env, process, phys);
        }
    }

    // SAFETY: meminfo is live.
    unsafe {
        (*process.as_ref().meminfo).regions.remove(addr as usize);
    }

    SYSCALL_OK
}

pub fn send_message(args: [SyscallArg; 5]) -> i64 {
    let [cookie, tag, size, buffer, _] = args;

    if size > 0 && (!user_range_ok(buffer, size) || buffer % PAGE_SIZE as u64 != 0) {
        return SYSCALL_BADARGS;
    }

    let Ok(registry) = crate::ipc::registry() else {
        return SYSCALL_FAILURE;
    };

    match registry.send(cookie, tag, size as usize, buffer as usize) {
        Ok(reply) => reply as i64,
        Err(_) => 0,
    }
}

pub fn recv_message(args: [SyscallArg; 5]) -> i64 {
    let [cookie, tag_out, size_out, buffer, _] = args;

    if (tag_out != 0 && (!user_range_ok(tag_out, 8) || tag_out % 8 != 0))
        || (size_out != 0 && (!user_range_ok(size_out, 8) || size_out % 8 != 0))
        || (buffer != 0 && buffer % PAGE_SIZE as u64 != 0)
    {
        return SYSCALL_BADARGS;
    }

    let Ok(registry) = crate::ipc::registry() else {
        return SYSCALL_FAILURE;
    };

    match registry.recv(cookie, buffer as usize) {
        Ok((message_cookie, tag, size)) => {
            // SAFETY: out-pointers were range-checked and aligned.
            unsafe {
                if tag_out != 0 {
                    *(tag_out as *mut u64) = tag;
                }
                if size_out != 0 {
                    *(size_out as *mut u64) = size as u64;
                }
            }
            message_cookie as i64
        }
        Err(_) => 0,
    }
}

pub fn reply_message(args: [SyscallArg; 5]) -> i64 {
    let [message_cookie, result, ..] = args;

    let Ok(registry) = crate::ipc::registry() else {
        return SYSCALL_FAILURE;
    };

    match registry.reply(message_cookie, result) {
        Ok(channel_cookie) => channel_cookie as i64,
        Err(_) => 0,
    }
}

/// Managed-resource callback: tear down a channel its owner never
/// destroyed. `resource` carries the cookie, `data` the record itself.
unsafe fn channel_cleanup(resource: *mut u8, data: *mut u8) {
    if let Ok(registry) = crate::ipc::registry() {
        let _ = registry.destroy(resource as u64);
    }
    if let (Ok(slab), Some(node)) = (crate::mm::kernel_slab(), NonNull::new(data)) {
        // SAFETY: data is the slab-allocated ManagedResource node, no
        // longer reachable once free_all has read past it.
        unsafe { slab.free(node.cast::<crate::process::resources::ManagedResource>()) };
    }
}

pub fn create_channel(_args: [SyscallArg; 5]) -> i64 {
    let Ok(registry) = crate::ipc::registry() else {
        return SYSCALL_FAILURE;
    };

    let cookie = match registry.create() {
        Ok(cookie) => cookie,
        Err(_) => return SYSCALL_FAILURE,
    };

    // The channel dies with its creating process unless destroyed first.
    if let (Ok(env), Some(process)) = (crate::mm::kernel_env(), current_process()) {
        if let Some(node) = env.slab.alloc_zeroed::<crate::process::resources::ManagedResource>()
        {
            // SAFETY: fresh node; data points back at the node so the
            // cleanup callback can free it.
            unsafe {
                node.as_ptr().write(crate::process::resources::ManagedResource::new(
                    channel_cleanup,
                    cookie as *mut u8,
                    node.as_ptr() as *mut u8,
                ));
            }
            process::process_add_managed_resource(process, node);
        }
    }

    cookie as i64
}

pub fn destroy_channel(args: [SyscallArg; 5]) -> i64 {
    let [cookie, ..] = args;

    let Ok(registry) = crate::ipc::registry() else {
        return SYSCALL_FAILURE;
    };

    match registry.destroy(cookie) {
        Ok(()) => SYSCALL_OK,
        Err(_) => SYSCALL_FAILURE,
    }
}

pub fn register_named_channel(args: [SyscallArg; 5]) -> i64 {
    let [cookie, name_ptr, ..] = args;

    let Some(name) = name_arg(name_ptr) else {
        return SYSCALL_BADARGS;
    };
    let Ok(named) = crate::ipc::named_channels() else {
        return SYSCALL_FAILURE;
    };

    match named.register(cookie, name) {
        Ok(()) => SYSCALL_OK,
        Err(_) => SYSCALL_BAD_NAME,
    }
}

pub fn deregister_named_channel(args: [SyscallArg; 5]) -> i64 {
    let [name_ptr, ..] = args;

    let Some(name) = name_arg(name_ptr) else {
        return SYSCALL_BADARGS;
    };
    let Ok(named) = crate::ipc::named_channels() else {
        return SYSCALL_FAILURE;
    };

    match named.deregister(name) {
        Ok(cookie) => cookie as i64,
        Err(_) => SYSCALL_BAD_NAME,
    }
}

pub fn find_named_channel(args: [SyscallArg; 5]) -> i64 {
    let [name_ptr, ..] = args;

    let Some(name) = name_arg(name_ptr) else {
        return SYSCALL_BADARGS;
    };
    let Ok(named) = crate::ipc::named_channels() else {
        return SYSCALL_FAILURE;
    };

    match named.find(name) {
        Some(cookie) => cookie as i64,
        None => 0,
    }
}

pub fn kill_current_task(_args: [SyscallArg; 5]) -> i64 {
    let Some(current) = task::current() else {
        return SYSCALL_FAILURE;
    };

    sched_lock_this_cpu();
    // SAFETY: current task on this CPU; sched lock held. The task's
    // record is reclaimed by its process's managed resources.
    unsafe {
        sched::block(current);
        sched::schedule();
    }
    sched_unlock_this_cpu();

    // Only reached on the hosted build, where nothing actually switches.
    SYSCALL_OK
}

pub fn create_region(args: [SyscallArg; 5]) -> i64 {
    let [start, len, flags, ..] = args;

    if start % PAGE_SIZE as u64 != 0 || len == 0 || !user_range_ok(start, len) {
        return SYSCALL_BADARGS;
    }

    let Some(process) = current_process() else {
        return SYSCALL_FAILURE;
    };

    // SAFETY: meminfo is live; the tree is process-local.
    let inserted = unsafe {
        (*process.as_ref().meminfo).regions.insert(
            start as usize,
            (start + len) as usize,
            flags & REGION_AUTOMAP,
        )
    };

    if inserted {
        SYSCALL_OK
    } else {
        SYSCALL_FAILURE
    }
}

pub fn destroy_region(args: [SyscallArg; 5]) -> i64 {
    let [start, ..] = args;

    let Some(process) = current_process() else {
        return SYSCALL_FAILURE;
    };

    // SAFETY: meminfo is live; the tree is process-local.
    unsafe {
        if (*process.as_ref().meminfo)
            .regions
            .lookup(start as usize)
            .is_none()
        {
            return SYSCALL_FAILURE;
        }
        (*process.as_ref().meminfo).regions.remove(start as usize);
    }

    SYSCALL_OK
}

pub fn map_firmware_tables(args: [SyscallArg; 5]) -> i64 {
    let [dst_virt, ..] = args;

    if dst_virt == 0 || dst_virt % PAGE_SIZE as u64 != 0 || !user_range_ok(dst_virt, PAGE_SIZE as u64) {
        return SYSCALL_BADARGS;
    }

    let Some(rsdt_phys) = crate::bootstrap::firmware_rsdt_phys() else {
        return SYSCALL_FAILURE;
    };

    // SAFETY: dst range-checked; the tables themselves are read-only to
    // the caller.
    unsafe {
        vmm::map_page_containing(
            dst_virt as usize,
            rsdt_phys,
            PageFlags::PRESENT | PageFlags::USER,
        );
    }

    dst_virt as i64
}

pub fn map_physical(args: [SyscallArg; 5]) -> i64 {
    let [phys, virt, page_count, ..] = args;

    if virt == 0
        || virt % PAGE_SIZE as u64 != 0
        || phys % PAGE_SIZE as u64 != 0
        || page_count == 0
        || !user_range_ok(virt, page_count * PAGE_SIZE as u64)
    {
        return SYSCALL_BADARGS;
    }

    for i in 0..page_count {
        // SAFETY: range-checked user target; phys is the caller's claim
        // to hardware, gated by holding this syscall's capability.
        unsafe {
            vmm::map_page(
                virt as usize + i as usize * PAGE_SIZE,
                phys + i * PAGE_SIZE as u64,
                PageFlags::PRESENT | PageFlags::WRITE | PageFlags::USER | PageFlags::NO_CACHE,
            );
        }
    }

    virt as i64
}

pub fn alloc_physical_pages(args: [SyscallArg; 5]) -> i64 {
    let [page_count, ..] = args;

    if page_count == 0 {
        return SYSCALL_BADARGS;
    }

    let Ok(region) = crate::mm::physical_region() else {
        return SYSCALL_FAILURE;
    };

    match region.alloc_contiguous(page_count) {
        Some(phys) => phys as i64,
        None => SYSCALL_FAILURE,
    }
}

pub fn alloc_interrupt_vector(_args: [SyscallArg; 5]) -> i64 {
    // Interrupt routing belongs to the platform layer.
    SYSCALL_NOT_IMPL
}

pub fn wait_interrupt(_args: [SyscallArg; 5]) -> i64 {
    SYSCALL_NOT_IMPL
}

pub fn read_kernel_log(args: [SyscallArg; 5]) -> i64 {
    let [buf, len, ..] = args;

    if buf == 0 || len == 0 || !user_range_ok(buf, len) {
        return SYSCALL_BADARGS;
    }

    // SAFETY: range-checked above.
    let dst = unsafe { core::slice::from_raw_parts_mut(buf as *mut u8, len as usize) };
    crate::klog::read(dst) as i64
}

pub fn get_framebuffer_phys(_args: [SyscallArg; 5]) -> i64 {
    match crate::bootstrap::framebuffer_phys() {
        Some(phys) => phys as i64,
        None => SYSCALL_FAILURE,
    }
}
