//! SMP support
//!
//! Per-CPU state records and the inter-processor signalling (panic
//! broadcast, IPWI) built on the same NMI transport.

pub mod ipwi;
pub mod percpu;

pub use percpu::PerCpu;
