//! Syscalls
//!
//! Every syscall is a capability: userspace presents a cookie, the
//! kernel resolves it through the capability map to a `SyscallCapability`
//! carrying the handler. Anything else (unknown cookie, wrong object
//! type) is `INCAPABLE`, with an escalating randomized delay
//! charged to processes that keep guessing.

mod handlers;

use core::ptr::NonNull;

use crate::cap::map::CapabilityMap;
use crate::cap::{capability_cookie, Capability, CapabilityType};
use crate::mm::slab::SlabAllocator;
use crate::sched::task;

/// Result codes of the syscall ABI.
pub const SYSCALL_OK: i64 = 0;
pub const SYSCALL_FAILURE: i64 = -1;
pub const SYSCALL_BAD_NUMBER: i64 = -2;
pub const SYSCALL_NOT_IMPL: i64 = -3;
pub const SYSCALL_BADARGS: i64 = -4;
pub const SYSCALL_BAD_NAME: i64 = -5;
pub const SYSCALL_INCAPABLE: i64 = -254;

/// Maximum shared regions in one process-creation request.
pub const MAX_PROCESS_REGIONS: usize = 16;

pub type SyscallArg = u64;
pub type SyscallHandler = fn([SyscallArg; 5]) -> i64;

/// The numbered syscall table.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallId {
    Invalid = 0,
    DebugPrint,
    DebugChar,
    CreateThread,
    Memstats,
    Sleep,
    CreateProcess,
    MapVirtual,
    SendMessage,
    RecvMessage,
    ReplyMessage,
    CreateChannel,
    DestroyChannel,
    RegisterNamedChannel,
    DeregisterNamedChannel,
    FindNamedChannel,
    KillCurrentTask,
    UnmapVirtual,
    CreateRegion,
    DestroyRegion,
    MapFirmwareTables,
    MapPhysical,
    AllocPhysicalPages,
    AllocInterruptVector,
    WaitInterrupt,
    ReadKernelLog,
    GetFramebufferPhys,
}

/// One shared-region descriptor in a process-creation request.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct ProcessMemoryRegion {
    pub start: u64,
    pub len_bytes: u64,
}

/// Process-creation parameter block, read from the caller's memory.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ProcessCreateParams {
    pub entry_point: u64,
    pub stack_base: u64,
    pub stack_size: u64,
    pub region_count: u8,
    _reserved0: [u8; 7],
    pub regions: u64,
    pub stack_value_count: u16,
    _reserved1: [u16; 3],
    pub stack_values: u64,
    _reserved2: u64,
}

const _: () = assert!(core::mem::size_of::<ProcessCreateParams>() == 64);

/// A syscall-table entry: capability header, syscall id, handler.
#[repr(C)]
pub struct SyscallCapability {
    pub cap: Capability,
    pub syscall_id: SyscallId,
    _pad: u8,
    pub flags: u32,
    pub handler: SyscallHandler,
    _reserved: [u64; 6],
}

const _: () = assert!(core::mem::size_of::<SyscallCapability>() == 64);

const TABLE: [(SyscallId, SyscallHandler); 26] = [
    (SyscallId::DebugPrint, handlers::debug_print),
    (SyscallId::DebugChar, handlers::debug_char),
    (SyscallId::CreateThread, handlers::create_thread),
    (SyscallId::Memstats, handlers::memstats),
    (SyscallId::Sleep, handlers::sleep),
    (SyscallId::CreateProcess, handlers::create_process),
    (SyscallId::MapVirtual, handlers::map_virtual),
    (SyscallId::SendMessage, handlers::send_message),
    (SyscallId::RecvMessage, handlers::recv_message),
    (SyscallId::ReplyMessage, handlers::reply_message),
    (SyscallId::CreateChannel, handlers::create_channel),
    (SyscallId::DestroyChannel, handlers::destroy_channel),
    (
        SyscallId::RegisterNamedChannel,
        handlers::register_named_channel,
    ),
    (
        SyscallId::DeregisterNamedChannel,
        handlers::deregister_named_channel,
    ),
    (SyscallId::FindNamedChannel, handlers::find_named_channel),
    (SyscallId::KillCurrentTask, handlers::kill_current_task),
    (SyscallId::UnmapVirtual, handlers::unmap_virtual),
    (SyscallId::CreateRegion, handlers::create_region),
    (SyscallId::DestroyRegion, handlers::destroy_region),
    (SyscallId::MapFirmwareTables, handlers::map_firmware_tables),
    (SyscallId::MapPhysical, handlers::map_physical),
    (SyscallId::AllocPhysicalPages, handlers::alloc_physical_pages),
    (
        SyscallId::AllocInterruptVector,
        handlers::alloc_interrupt_vector,
    ),
    (SyscallId::WaitInterrupt, handlers::wait_interrupt),
    (SyscallId::ReadKernelLog, handlers::read_kernel_log),
    (
        SyscallId::GetFramebufferPhys,
        handlers::get_framebuffer_phys,
    ),
];

/// Mint one capability per syscall into `map`. Returns the `(id,
/// cookie)` pairs destined for the supervisor's initial stack.
pub fn install_syscall_capabilities(
    map: &CapabilityMap,
    slab: &'static SlabAllocator,
) -> Option<[(SyscallId, u64); 26]> {
    let mut pairs = [(SyscallId::Invalid, 0u64); 26];

    for (i, &(id, handler)) in TABLE.iter().enumerate() {
        let entry = slab.alloc_init(SyscallCapability {
            cap: Capability {
                cap_type: CapabilityType::Syscall,
                subtype: 0,
            },
            syscall_id: id,
            _pad: 0,
            flags: 0,
            handler,
            _reserved: [0; 6],
        })?;

        let cookie = capability_cookie();
        if !map.insert(cookie, entry.as_ptr() as *mut u8) {
            // SAFETY: unpublished allocation.
            unsafe { slab.free(entry) };
            return None;
        }

        pairs[i] = (id, cookie);
    }

    Some(pairs)
}

/// Charge a failed capability presentation to the calling process and
/// stall brute-forcers: the delay doubles with the failure count, with
/// hardware-random jitter so probes can't calibrate against it.
fn capability_failure_delay() {
    let failures = task::current()
        .and_then(|task| {
            // SAFETY: a current task's owner is live or null.
            unsafe { NonNull::new((*task.as_ptr()).owner) }
        })
        .map(|process| {
            // SAFETY: live process record.
            let process = unsafe { process.as_ref() };
            let failures = process.cap_failures.get() + 1;
            process.cap_failures.set(failures);
            failures
        })
        .unwrap_or(1);

    let shift = failures.min(16) as u32;
    let jitter = crate::arch::hardware_entropy().unwrap_or(0) & 0xffff;
    let nanos = (1000u64 << shift) + jitter;

    crate::timer::system().delay_nanos(nanos);
}

/// Resolve `cookie` and invoke the named syscall.
pub fn syscall_dispatch(cookie: u64, args: [SyscallArg; 5]) -> i64 {
    let map = match crate::cap::capability_map() {
        Ok(map) => map,
        Err(_) => return SYSCALL_FAILURE,
    };

    let Some(entry) = map.lookup(cookie) else {
        capability_failure_delay();
        return SYSCALL_INCAPABLE;
    };

    let entry = entry as *const SyscallCapability;

    // SAFETY: map values are live capability records; the header is
    // checked before the value is trusted as a SyscallCapability.
    unsafe {
        if (*entry).cap.cap_type != CapabilityType::Syscall {
            capability_failure_delay();
            return SYSCALL_INCAPABLE;
        }

        if (*entry).syscall_id == SyscallId::Invalid {
            return SYSCALL_BAD_NUMBER;
        }

        ((*entry).handler)(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap;

    #[test]
    fn dispatch_runs_handler_through_capability() {
        bootstrap::init_hosted_test_kernel();
        let map = crate::cap::capability_map().unwrap();
        let slab = crate::mm::kernel_slab().unwrap();

        let pairs = install_syscall_capabilities(map, slab).unwrap();

        let (id, cookie) = pairs[1];
        assert_eq!(id, SyscallId::DebugChar);
        assert_eq!(syscall_dispatch(cookie, [b'x' as u64, 0, 0, 0, 0]), SYSCALL_OK);
    }

    #[test]
    fn unknown_cookie_is_incapable_and_counted() {
        bootstrap::init_hosted_test_kernel();

        let env = crate::mm::kernel_env().unwrap();
        let process = crate::process::process_create(env, 0).unwrap();
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
        crate::sched::task::set_current(Some(task));

        let failures_before = unsafe { process.as_ref().cap_failures.get() };
        assert_eq!(syscall_dispatch(0xbad_c00c1e, [0; 5]), SYSCALL_INCAPABLE);
        assert_eq!(
            unsafe { process.as_ref().cap_failures.get() },
            failures_before + 1
        );

        crate::sched::task::set_current(None);
        unsafe {
            crate::sched::task::destroy(task, env.fba, env.slab);
            crate::process::process_destroy(env, process);
        }
    }

    #[test]
    fn non_syscall_capability_is_incapable() {
        bootstrap::init_hosted_test_kernel();
        let map = crate::cap::capability_map().unwrap();
        let slab = crate::mm::kernel_slab().unwrap();

        // A user-typed capability must not dispatch.
        let entry = slab
            .alloc_init(Capability {
                cap_type: crate::cap::CapabilityType::User,
                subtype: 7,
            })
            .unwrap();
        let cookie = crate::cap::capability_cookie();
        assert!(map.insert(cookie, entry.as_ptr() as *mut u8));

        assert_eq!(syscall_dispatch(cookie, [0; 5]), SYSCALL_INCAPABLE);
    }

    #[test]
    fn memstats_reports_region_totals() {
        bootstrap::init_hosted_test_kernel();
        let map = crate::cap::capability_map().unwrap();
        let slab = crate::mm::kernel_slab().unwrap();
        let pairs = install_syscall_capabilities(map, slab).unwrap();

        let (id, cookie) = pairs[3];
        assert_eq!(id, SyscallId::Memstats);

        let mut stats = [0u64; 2];
        let result = syscall_dispatch(cookie, [stats.as_mut_ptr() as u64, 0, 0, 0, 0]);
        assert_eq!(result, SYSCALL_OK);

        let region = crate::mm::physical_region().unwrap();
        assert_eq!(stats[0], region.total_size());
        assert!(stats[1] <= stats[0]);
    }

    #[test]
    fn channel_syscalls_round_trip() {
        bootstrap::init_hosted_test_kernel();
        let map = crate::cap::capability_map().unwrap();
        let slab = crate::mm::kernel_slab().unwrap();
        let pairs = install_syscall_capabilities(map, slab).unwrap();

        let create = pairs[10];
        assert_eq!(create.0, SyscallId::CreateChannel);
        let channel_cookie = syscall_dispatch(create.1, [0; 5]);
        assert!(channel_cookie > 0);

        let register = pairs[12];
        assert_eq!(register.0, SyscallId::RegisterNamedChannel);
        let name = b"svc:test\0";
        assert_eq!(
            syscall_dispatch(
                register.1,
                [channel_cookie as u64, name.as_ptr() as u64, 0, 0, 0]
            ),
            SYSCALL_OK
        );

        let find = pairs[14];
        assert_eq!(find.0, SyscallId::FindNamedChannel);
        assert_eq!(
            syscall_dispatch(find.1, [name.as_ptr() as u64, 0, 0, 0, 0]),
            channel_cookie
        );

        let deregister = pairs[13];
        assert_eq!(
            syscall_dispatch(deregister.1, [name.as_ptr() as u64, 0, 0, 0, 0]),
            channel_cookie
        );

        let destroy = pairs[11];
        assert_eq!(destroy.0, SyscallId::DestroyChannel);
        assert_eq!(
            syscall_dispatch(destroy.1, [channel_cookie as u64, 0, 0, 0, 0]),
            SYSCALL_OK
        );
    }
}
