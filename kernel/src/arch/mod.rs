//! Architecture dispatch
//!
//! Bare-metal targets get the real CPU primitives; the hosted build (unit
//! tests on the developer machine) gets mocks that record state in
//! thread-locals so tests can run under the standard harness.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub use x86_64::*;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod riscv64;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub use riscv64::*;

#[cfg(not(target_os = "none"))]
pub mod hosted;

#[cfg(not(target_os = "none"))]
pub use hosted::*;
