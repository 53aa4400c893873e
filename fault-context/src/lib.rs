//! Accessors for the raw machine state that the kernel hands to a fault
//! handler.
//!
//! On the POSIX family this is the `ucontext_t` given to an `SA_SIGINFO`
//! signal handler, on MacOS it is the thread and exception state retrieved
//! with `thread_get_state` while servicing a Mach exception message. Each
//! (OS, architecture) pair gets exactly one set of layouts and one
//! implementation of the traits below, so nothing outside of this crate needs
//! to know where a particular register lives.
//!
//! None of the accessors allocate, block, or fail, they are plain loads and
//! stores into kernel supplied memory, which makes them usable from a signal
//! handler or from a thread running on a borrowed stack.

// crate-specific exceptions:
#![allow(unsafe_code, nonstandard_style)]

/// The integer argument registers of the platform's C calling convention that
/// a fault handler may need to read or write.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ArgReg {
    /// `rdi` on x86_64, `x0` on aarch64, `a0` on riscv64
    First,
    /// `rsi` on x86_64, `x1` on aarch64, `a1` on riscv64
    Second,
}

/// Program counter and stack pointer access, available for every supported
/// (OS, architecture) pair.
pub trait MachineContext {
    /// The address of the instruction that will be executed when the thread
    /// resumes, for a fault this is the faulting instruction
    fn pc(&self) -> usize;
    fn set_pc(&mut self, pc: usize);
    /// The stack pointer of the thread
    fn sp(&self) -> usize;
    fn set_sp(&mut self, sp: usize);
}

/// Register access needed to redirect a thread into a function call.
///
/// Only implemented where the first two integer arguments are passed in
/// registers.
pub trait CallContext: MachineContext {
    fn arg(&self, reg: ArgReg) -> usize;
    fn set_arg(&mut self, reg: ArgReg, value: usize);

    /// The link register, `None` on architectures where a call pushes the
    /// return address onto the stack instead
    #[inline]
    fn lr(&self) -> Option<usize> {
        None
    }

    /// Sets the link register, a no-op on architectures without one
    #[inline]
    fn set_lr(&mut self, _lr: usize) {}
}

/// Access to fault-specific exception state.
pub trait ExceptionContext {
    /// The memory address whose access caused the fault
    fn fault_address(&self) -> usize;
}

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        mod linux;
        pub use linux::*;
    } else if #[cfg(any(
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))] {
        mod bsd;
        pub use bsd::*;
    } else if #[cfg(target_os = "macos")] {
        mod mac;
        pub use mac::*;
    } else {
        compile_error!("fault-context does not support this target");
    }
}
