//! IPC channels
//!
//! Synchronous rendezvous with reply. A message lives in exactly one of
//! three places: the channel queue (no receiver yet), the in-flight
//! table (a receiver took it, the sender is blocked awaiting the reply),
//! or nowhere (replied; the woken sender frees it). The sender's buffer
//! travels by physical address and is mapped into the receiver's space
//! at recv.

use core::ptr::{self, NonNull};

use crate::cap::capability_cookie;
use crate::error::{KernelError, KernelResult};
use crate::mm::slab::SlabAllocator;
use crate::mm::vmm::{self, PageFlags};
use crate::mm::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::sched::task::{self, Task};
use crate::sched::{self, sched_lock_this_cpu, sched_unlock_this_cpu};
use crate::sync::RawSpinLock;
use crate::utils::HashTable;

/// Largest buffer a single message may carry.
pub const MAX_IPC_BUFFER_SIZE: usize = 4 * PAGE_SIZE;

#[repr(C)]
pub struct IpcMessage {
    pub(crate) next: *mut IpcMessage,
    /// This message's own cookie (the reply handle).
    pub cookie: u64,
    /// Cookie of the channel it was sent on.
    pub channel: u64,
    pub tag: u64,
    pub arg_buf_phys: PhysAddr,
    pub waiter: *mut Task,
    pub reply: u64,
    pub arg_buf_size: u32,
    pub handled: bool,
    _pad: [u8; 3],
}

const _: () = assert!(core::mem::size_of::<IpcMessage>() == 64);

#[repr(C)]
pub struct IpcChannel {
    pub cookie: u64,
    /// Tasks parked in recv, FIFO (head pops first).
    receivers: *mut Task,
    receivers_lock: NonNull<RawSpinLock>,
    /// Pending messages, FIFO (tail appends).
    queue: *mut IpcMessage,
    queue_lock: NonNull<RawSpinLock>,
    _reserved: [u64; 3],
}

const _: () = assert!(core::mem::size_of::<IpcChannel>() == 64);

/// Channel and in-flight-message registries plus the slab the records
/// come from.
pub struct IpcRegistry {
    slab: &'static SlabAllocator,
    channels: HashTable,
    in_flight: HashTable,
}

impl IpcRegistry {
    pub fn new(
        fba: &'static crate::mm::fba::FixedBlockAllocator,
        slab: &'static SlabAllocator,
    ) -> KernelResult<Self> {
        Ok(Self {
            slab,
            channels: HashTable::create(fba, 2)?,
            in_flight: HashTable::create(fba, 2)?,
        })
    }

    /// Create a channel; returns its cookie.
    pub fn create(&self) -> KernelResult<u64> {
        let receivers_lock = self
            .slab
            .alloc_init(RawSpinLock::new())
            .ok_or(KernelError::OutOfMemory)?;

        let Some(queue_lock) = self.slab.alloc_init(RawSpinLock::new()) else {
            // SAFETY: unpublished allocation.
            unsafe { self.slab.free(receivers_lock) };
            return Err(KernelError::OutOfMemory);
        };

        let cookie = capability_cookie();

        let channel = self.slab.alloc_init(IpcChannel {
            cookie,
            receivers: ptr::null_mut(),
            receivers_lock,
            queue: ptr::null_mut(),
            queue_lock,
            _reserved: [0; 3],
        });

        let Some(channel) = channel else {
            // SAFETY: unpublished allocations.
            unsafe {
                self.slab.free(queue_lock);
                self.slab.free(receivers_lock);
            }
            return Err(KernelError::OutOfMemory);
        };

        if !self.channels.insert(cookie, channel.as_ptr() as *mut u8) {
            // SAFETY: unpublished allocations.
            unsafe {
                self.slab.free(channel);
                self.slab.free(queue_lock);
                self.slab.free(receivers_lock);
            }
            return Err(KernelError::OutOfMemory);
        }

        Ok(cookie)
    }

    pub(crate) fn channel(&self, cookie: u64) -> Option<NonNull<IpcChannel>> {
        self.channels
            .lookup(cookie)
            .and_then(|ptr| NonNull::new(ptr as *mut IpcChannel))
    }

    pub fn exists(&self, cookie: u64) -> bool {
        self.channel(cookie).is_some()
    }

    /// Tear a channel down. Queued and in-flight messages signal failure
    /// (reply 0) to their blocked senders, parked receivers are woken to
    /// notice the channel is gone; the records the senders own are freed
    /// by the senders themselves.
    pub fn destroy(&self, cookie: u64) -> KernelResult<()> {
        let channel = match self.channels.remove(cookie) {
            Some(ptr) => ptr as *mut IpcChannel,
            None => {
                return Err(crate::error::IpcError::ChannelNotFound { cookie }.into());
            }
        };

        // SAFETY: the channel just left the registry; we hold the only
        // reference. Senders and receivers hold cookies, not pointers.
        unsafe {
            // Fail every queued message.
            let mut message = (*channel).queue;
            while !message.is_null() {
                let next = (*message).next;
                (*message).reply = 0;
                (*message).handled = true;

                if let Some(waiter) = NonNull::new((*message).waiter) {
                    sched_lock_this_cpu();
                    sched::unblock(waiter);
                    sched_unlock_this_cpu();
                }
                message = next;
            }

            // Fail every in-flight message sent on this channel.
            loop {
                let mut stale: [u64; 16] = [0; 16];
                let mut count = 0;

                self.in_flight.for_each(|key, value| {
                    let message = value as *mut IpcMessage;
                    // SAFETY: in-flight values are live message records.
                    let on_channel = unsafe { (*message).channel == cookie };
                    if count < stale.len() && on_channel {
                        stale[count] = key;
                        count += 1;
                    }
                });

                if count == 0 {
                    break;
                }

                for &key in &stale[..count] {
                    if let Some(value) = self.in_flight.remove(key) {
                        let message = value as *mut IpcMessage;
                        (*message).reply = 0;
                        (*message).handled = true;
                        if let Some(waiter) = NonNull::new((*message).waiter) {
                            sched_lock_this_cpu();
                            sched::unblock(waiter);
                            sched_unlock_this_cpu();
                        }
                    }
                }
            }

            // Wake parked receivers; their recv loop re-looks the cookie
            // up and returns empty-handed.
            let mut receiver = (*channel).receivers;
            while !receiver.is_null() {
                let next = (*receiver).next;
                (*receiver).next = ptr::null_mut();
                sched_lock_this_cpu();
                sched::unblock(NonNull::new_unchecked(receiver));
                sched_unlock_this_cpu();
                receiver = next;
            }

            self.slab.free((*channel).queue_lock);
            self.slab.free((*channel).receivers_lock);
            self.slab.free(NonNull::new_unchecked(channel));
        }

        Ok(())
    }

    /// Send on `cookie`: allocate the message, hand it to a parked
    /// receiver (or queue it), block until replied. Returns the reply.
    pub fn send(
        &self,
        cookie: u64,
        tag: u64,
        size: usize,
        buffer: VirtAddr,
    ) -> KernelResult<u64> {
        let channel = self
            .channel(cookie)
            .ok_or(crate::error::IpcError::ChannelNotFound { cookie })?;

        if size > MAX_IPC_BUFFER_SIZE {
            return Err(crate::error::IpcError::BufferTooLarge {
                size,
                max: MAX_IPC_BUFFER_SIZE,
            }
            .into());
        }

        let arg_buf_phys = if size == 0 {
            0
        } else {
            if buffer & (PAGE_SIZE - 1) != 0 {
                return Err(crate::error::IpcError::BufferUnaligned { addr: buffer }.into());
            }
            vmm::virt_to_phys_page(buffer).unwrap_or(0)
        };

        let current = task::current().ok_or(crate::error::SchedError::NoCurrentTask)?;

        let message = self
            .slab
            .alloc_init(IpcMessage {
                next: ptr::null_mut(),
                cookie: capability_cookie(),
                channel: cookie,
                tag,
                arg_buf_phys,
                waiter: current.as_ptr(),
                reply: 0,
                arg_buf_size: size as u32,
                handled: false,
                _pad: [0; 3],
            })
            .ok_or(KernelError::OutOfMemory)?;

        // SAFETY: channel is live (registry entry); message is ours.
        unsafe {
            let chan = channel.as_ptr();

            let rflags = (*chan).receivers_lock.as_ref().lock_irqsave();
            let receiver = (*chan).receivers;

            if !receiver.is_null() {
                // Rendezvous: pop the receiver, publish the message as
                // in-flight, wake the receiver, sleep until the reply.
                (*chan).receivers = (*receiver).next;
                (*receiver).next = ptr::null_mut();
                (*chan).receivers_lock.as_ref().unlock_irqrestore(rflags);

                self.in_flight
                    .insert((*message.as_ptr()).cookie, message.as_ptr() as *mut u8);

                sched_lock_this_cpu();
                sched::unblock(NonNull::new_unchecked(receiver));
                sched::block(current);
                sched::schedule();
                sched_unlock_this_cpu();
            } else {
                (*chan).receivers_lock.as_ref().unlock_irqrestore(rflags);

                // No receiver: append to the channel queue and sleep.
                let qflags = (*chan).queue_lock.as_ref().lock_irqsave();
                let mut tail = (*chan).queue;
                if tail.is_null() {
                    (*chan).queue = message.as_ptr();
                } else {
                    while !(*tail).next.is_null() {
                        tail = (*tail).next;
                    }
                    (*tail).next = message.as_ptr();
                }
                (*chan).queue_lock.as_ref().unlock_irqrestore(qflags);

                sched_lock_this_cpu();
                sched::block(current);
                sched::schedule();
                sched_unlock_this_cpu();
            }

            // Woken: the reply is in, the message is ours to free.
            let reply = (*message.as_ptr()).reply;
            self.slab.free(message);
            Ok(reply)
        }
    }

    /// Receive on `cookie`: take the oldest queued message (or park
    /// until one arrives), map the sender's buffer at `buffer`, and
    /// return `(message cookie, tag, size)`.
    pub fn recv(
        &self,
        cookie: u64,
        buffer: VirtAddr,
    ) -> KernelResult<(u64, u64, usize)> {
        loop {
            let channel = self
                .channel(cookie)
                .ok_or(crate::error::IpcError::ChannelNotFound { cookie })?;

            // SAFETY: channel is live; queue is under its lock.
            unsafe {
                let chan = channel.as_ptr();

                let qflags = (*chan).queue_lock.as_ref().lock_irqsave();
                let message = (*chan).queue;

                if !message.is_null() {
                    (*chan).queue = (*message).next;
                    (*message).next = ptr::null_mut();
                    (*chan).queue_lock.as_ref().unlock_irqrestore(qflags);

                    self.in_flight
                        .insert((*message).cookie, message as *mut u8);

                    if (*message).arg_buf_phys != 0 && buffer != 0 {
                        let pages =
                            ((*message).arg_buf_size as usize).div_ceil(PAGE_SIZE).max(1);
                        for i in 0..pages {
                            vmm::map_page_containing(
                                buffer + i * PAGE_SIZE,
                                (*message).arg_buf_phys + (i * PAGE_SIZE) as u64,
                                PageFlags::PRESENT | PageFlags::WRITE | PageFlags::USER,
                            );
                        }
                    }

                    return Ok((
                        (*message).cookie,
                        (*message).tag,
                        (*message).arg_buf_size as usize,
                    ));
                }

                (*chan).queue_lock.as_ref().unlock_irqrestore(qflags);

                // Nothing queued: park on the receiver list.
                let current =
                    task::current().ok_or(crate::error::SchedError::NoCurrentTask)?;

                let rflags = (*chan).receivers_lock.as_ref().lock_irqsave();
                (*current.as_ptr()).next = ptr::null_mut();
                let mut tail = (*chan).receivers;
                if tail.is_null() {
                    (*chan).receivers = current.as_ptr();
                } else {
                    while !(*tail).next.is_null() {
                        tail = (*tail).next;
                    }
                    (*tail).next = current.as_ptr();
                }
                (*chan).receivers_lock.as_ref().unlock_irqrestore(rflags);

                sched_lock_this_cpu();
                sched::block(current);
                sched::schedule();
                sched_unlock_this_cpu();
                // Woken by a sender or a destroy; go around again.
            }
        }
    }

    /// Reply to an in-flight message: store the result, unblock the
    /// sender. Returns the channel cookie the message was sent on.
    pub fn reply(&self, message_cookie: u64, result: u64) -> KernelResult<u64> {
        let message = self
            .in_flight
            .remove(message_cookie)
            .ok_or(crate::error::IpcError::MessageNotFound {
                cookie: message_cookie,
            })? as *mut IpcMessage;

        // SAFETY: the message left the in-flight table; until its waiter
        // wakes and frees it, we hold the only reference.
        unsafe {
            (*message).reply = result;
            (*message).handled = true;
            let channel = (*message).channel;

            if let Some(waiter) = NonNull::new((*message).waiter) {
                sched_lock_this_cpu();
                sched::unblock(waiter);
                sched::schedule();
                sched_unlock_this_cpu();
            }

            Ok(channel)
        }
    }

    /// Number of messages currently in flight (test visibility).
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

// SAFETY: interior structure is guarded by the per-channel locks and the
// hash tables' own locks.
unsafe impl Send for IpcRegistry {}
unsafe impl Sync for IpcRegistry {}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mm::fba::tests::test_fba;
    use crate::sched::task::tests::spawn_test_task;
    use crate::sched::task::{TaskClass, TaskState};
    use std::boxed::Box;

    pub fn test_registry() -> &'static IpcRegistry {
        let fba = test_fba(96);
        let slab = Box::leak(Box::new(SlabAllocator::new(fba)));
        Box::leak(Box::new(IpcRegistry::new(fba, slab).unwrap()))
    }

    fn queue_message(
        registry: &IpcRegistry,
        channel_cookie: u64,
        message_cookie: u64,
        tag: u64,
        size: u32,
        phys: PhysAddr,
        waiter: *mut Task,
    ) -> *mut IpcMessage {
        let channel = registry.channel(channel_cookie).unwrap();
        let message = registry
            .slab
            .alloc_init(IpcMessage {
                next: ptr::null_mut(),
                cookie: message_cookie,
                channel: channel_cookie,
                tag,
                arg_buf_phys: phys,
                waiter,
                reply: 0,
                arg_buf_size: size,
                handled: false,
                _pad: [0; 3],
            })
            .unwrap();

        // SAFETY: channel live, message fresh; test is single-threaded.
        unsafe {
            let chan = channel.as_ptr();
            let mut tail = (*chan).queue;
            if tail.is_null() {
                (*chan).queue = message.as_ptr();
            } else {
                while !(*tail).next.is_null() {
                    tail = (*tail).next;
                }
                (*tail).next = message.as_ptr();
            }
        }

        message.as_ptr()
    }

    #[test]
    fn create_then_destroy_removes_channel() {
        let registry = test_registry();

        let cookie = registry.create().unwrap();
        assert_ne!(cookie, 0);
        assert!(registry.exists(cookie));

        registry.destroy(cookie).unwrap();
        assert!(!registry.exists(cookie));
    }

    #[test]
    fn destroy_of_unknown_cookie_fails() {
        let registry = test_registry();
        assert!(registry.destroy(0x1234_5678).is_err());
    }

    #[test]
    fn recv_with_queued_message_goes_in_flight() {
        crate::mm::vmm::test_reset_spaces();
        let registry = test_registry();
        let cookie = registry.create().unwrap();

        let receiver = spawn_test_task(TaskClass::Normal);
        task::set_current(Some(receiver));

        queue_message(registry, cookie, 12345, 42, 99, 0x7000, ptr::null_mut());

        let target: VirtAddr = 0x4400_0000;
        let (msg_cookie, tag, size) = registry.recv(cookie, target).unwrap();

        assert_eq!(msg_cookie, 12345);
        assert_eq!(tag, 42);
        assert_eq!(size, 99);

        // The sender's buffer page appears at the receiver's target.
        assert_eq!(vmm::virt_to_phys_page(target), Some(0x7000));

        // Message moved queue → in-flight.
        assert_eq!(registry.in_flight_count(), 1);
        let in_flight = registry.in_flight.remove(12345).unwrap() as *mut IpcMessage;
        unsafe { registry.slab.free(NonNull::new_unchecked(in_flight)) };

        registry.destroy(cookie).unwrap();
        task::set_current(None);
    }

    #[test]
    fn reply_unblocks_sender_and_returns_channel() {
        let registry = test_registry();
        let cookie = registry.create().unwrap();

        let sender = spawn_test_task(TaskClass::Normal);
        // SAFETY: fresh task.
        unsafe { (*sender.as_ref().sched).state = TaskState::Blocked };

        let message = registry
            .slab
            .alloc_init(IpcMessage {
                next: ptr::null_mut(),
                cookie: 54321,
                channel: cookie,
                tag: 0,
                arg_buf_phys: 0,
                waiter: sender.as_ptr(),
                reply: 0,
                arg_buf_size: 0,
                handled: false,
                _pad: [0; 3],
            })
            .unwrap();
        registry
            .in_flight
            .insert(54321, message.as_ptr() as *mut u8);

        let channel_cookie = registry.reply(54321, 999).unwrap();
        assert_eq!(channel_cookie, cookie);

        // SAFETY: message still live (test owns it now).
        unsafe {
            assert_eq!((*message.as_ptr()).reply, 999);
            assert!((*message.as_ptr()).handled);
            // The sender is runnable again (and, with nothing else
            // ready, already picked to run).
            assert_ne!((*sender.as_ref().sched).state, TaskState::Blocked);
            registry.slab.free(message);
        }

        // Gone from the in-flight table.
        assert!(registry.reply(54321, 1).is_err());

        // Drain scheduler queue state the unblock pushed.
        unsafe {
            let cpu = crate::smp::percpu::current();
            while cpu.sched_data().ready.pop().is_some() {}
            cpu.set_current_task(core::ptr::null_mut());
        }
        registry.destroy(cookie).unwrap();
    }

    #[test]
    fn send_to_unknown_channel_fails_without_blocking() {
        let registry = test_registry();
        let sender = spawn_test_task(TaskClass::Normal);
        task::set_current(Some(sender));

        assert!(registry.send(99999, 1, 0, 0).is_err());
        // SAFETY: task untouched by the failed send.
        unsafe {
            assert_eq!((*sender.as_ref().sched).state, TaskState::Ready);
        }
        task::set_current(None);
    }

    #[test]
    fn recv_on_unknown_channel_fails() {
        let registry = test_registry();
        assert!(registry.recv(99999, 0).is_err());
    }

    #[test]
    fn send_oversized_buffer_is_refused() {
        let registry = test_registry();
        let cookie = registry.create().unwrap();
        let sender = spawn_test_task(TaskClass::Normal);
        task::set_current(Some(sender));

        assert!(registry
            .send(cookie, 1, MAX_IPC_BUFFER_SIZE + 1, 0x1000)
            .is_err());
        assert!(registry.send(cookie, 1, 64, 0x1234).is_err());

        registry.destroy(cookie).unwrap();
        task::set_current(None);
    }

    #[test]
    fn destroy_fails_queued_messages_to_their_waiters() {
        let registry = test_registry();
        let cookie = registry.create().unwrap();

        let sender = spawn_test_task(TaskClass::Normal);
        // SAFETY: fresh task.
        unsafe { (*sender.as_ref().sched).state = TaskState::Blocked };

        let message = queue_message(registry, cookie, 777, 5, 0, 0, sender.as_ptr());

        registry.destroy(cookie).unwrap();

        // SAFETY: queued messages stay owned by their senders.
        unsafe {
            assert_eq!((*message).reply, 0);
            assert!((*message).handled);
            assert_eq!((*sender.as_ref().sched).state, TaskState::Ready);
            registry.slab.free(NonNull::new_unchecked(message));
        }

        unsafe {
            let cpu = crate::smp::percpu::current();
            while cpu.sched_data().ready.pop().is_some() {}
        }
    }

    #[test]
    fn send_with_parked_receiver_hands_off_directly() {
        crate::mm::vmm::test_reset_spaces();
        let registry = test_registry();
        let cookie = registry.create().unwrap();

        let receiver = spawn_test_task(TaskClass::Normal);
        let sender = spawn_test_task(TaskClass::Normal);

        // Park the receiver by hand (what recv does on an empty queue).
        let channel = registry.channel(cookie).unwrap();
        // SAFETY: channel live; receiver fresh.
        unsafe {
            (*receiver.as_ref().sched).state = TaskState::Blocked;
            (*channel.as_ptr()).receivers = receiver.as_ptr();
        }

        task::set_current(Some(sender));

        // With no real context switch the sender returns immediately
        // with the (unset) reply of 0; the receiver is runnable and the
        // message went in-flight.
        let reply = registry.send(cookie, 9, 0, 0).unwrap();
        assert_eq!(reply, 0);

        // SAFETY: receiver still live.
        unsafe {
            assert_ne!((*receiver.as_ref().sched).state, TaskState::Blocked);
        }
        assert_eq!(registry.in_flight_count(), 1);

        // The sender freed its record on wake; drop the stale entry.
        let mut stale = 0;
        registry.in_flight.for_each(|key, _| stale = key);
        registry.in_flight.remove(stale);

        unsafe {
            let cpu = crate::smp::percpu::current();
            while cpu.sched_data().ready.pop().is_some() {}
            cpu.set_current_task(core::ptr::null_mut());
        }
        registry.destroy(cookie).unwrap();
        task::set_current(None);
    }
}
