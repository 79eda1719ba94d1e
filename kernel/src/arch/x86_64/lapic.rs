//! Local-APIC interrupt command register access
//!
//! Only the slice of the LAPIC the core itself needs: issuing NMIs with the
//! all-except-self destination shorthand, for the panic broadcast and IPWI.
//! The full timer/EOI driver is platform code.

/// Kernel virtual address the platform maps the LAPIC registers at.
pub const LAPIC_VADDR: usize = 0xffff_ffff_8100_0000;

const REG_ICR_LOW: usize = 0x300 / 4;
const REG_ICR_HIGH: usize = 0x310 / 4;

const ICR_DELIVERY_STATUS: u32 = 1 << 12;
const ICR_LEVEL_ASSERT: u32 = 1 << 14;
const ICR_DELIVERY_MODE_NMI: u32 = 0b100 << 8;
const ICR_DEST_ALL_EXCLUDING_SELF: u32 = 0b11 << 18;

/// Send an NMI to every CPU except this one.
///
/// Spins until any in-flight IPI has been delivered first; the ICR is not
/// buffered.
///
/// # Safety
/// The LAPIC registers must be mapped at `LAPIC_VADDR` and the other CPUs
/// must have NMI handlers installed.
pub unsafe fn nmi_broadcast_all_except_self() {
    let lapic = LAPIC_VADDR as *mut u32;

    // SAFETY: caller guarantees the mapping; ICR accesses are 32-bit MMIO.
    unsafe {
        while core::ptr::read_volatile(lapic.add(REG_ICR_LOW)) & ICR_DELIVERY_STATUS != 0 {
            core::hint::spin_loop();
        }

        core::ptr::write_volatile(lapic.add(REG_ICR_HIGH), 0);
        core::ptr::write_volatile(
            lapic.add(REG_ICR_LOW),
            ICR_LEVEL_ASSERT | ICR_DELIVERY_MODE_NMI | ICR_DEST_ALL_EXCLUDING_SELF,
        );
    }
}
