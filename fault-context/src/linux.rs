//! The `ucontext_t` the kernel passes as the third argument of an
//! `SA_SIGINFO` handler.
//!
//! Note that we define these ourselves instead of using [`libc::ucontext_t`]
//! as libc's differs between glibc and musl <https://github.com/rust-lang/libc/pull/1646>
//! even though the context received from a signal is only arch specific, not
//! libc specific. Only the prefix of each structure up to the general purpose
//! registers is described, the structures are only ever viewed through a
//! pointer supplied by the kernel and never constructed.

use crate::{ArgReg, CallContext, MachineContext};
use std::ffi::c_void;

#[repr(C)]
pub struct stack_t {
    pub ss_sp: *mut c_void,
    pub ss_flags: i32,
    pub ss_size: usize,
}

/// The context handed to a signal handler on this target
pub type SignalContext = ucontext_t;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        // Indices into `mcontext_t::gregs`, we define these ourselves as they
        // are missing from libc for some targets (eg. Android)
        pub const REG_RDI: usize = 8;
        pub const REG_RSI: usize = 9;
        pub const REG_RSP: usize = 15;
        pub const REG_RIP: usize = 16;

        #[repr(C)]
        pub struct ucontext_t {
            pub uc_flags: u64,
            pub uc_link: *mut ucontext_t,
            pub uc_stack: stack_t,
            pub uc_mcontext: mcontext_t,
        }

        #[repr(C)]
        pub struct mcontext_t {
            pub gregs: [i64; 23],
            pub fpregs: *mut c_void,
            __reserved: [u64; 8],
        }

        impl MachineContext for ucontext_t {
            #[inline]
            fn pc(&self) -> usize {
                self.uc_mcontext.gregs[REG_RIP] as usize
            }

            #[inline]
            fn set_pc(&mut self, pc: usize) {
                self.uc_mcontext.gregs[REG_RIP] = pc as i64;
            }

            #[inline]
            fn sp(&self) -> usize {
                self.uc_mcontext.gregs[REG_RSP] as usize
            }

            #[inline]
            fn set_sp(&mut self, sp: usize) {
                self.uc_mcontext.gregs[REG_RSP] = sp as i64;
            }
        }

        impl CallContext for ucontext_t {
            #[inline]
            fn arg(&self, reg: ArgReg) -> usize {
                match reg {
                    ArgReg::First => self.uc_mcontext.gregs[REG_RDI] as usize,
                    ArgReg::Second => self.uc_mcontext.gregs[REG_RSI] as usize,
                }
            }

            #[inline]
            fn set_arg(&mut self, reg: ArgReg, value: usize) {
                let idx = match reg {
                    ArgReg::First => REG_RDI,
                    ArgReg::Second => REG_RSI,
                };
                self.uc_mcontext.gregs[idx] = value as i64;
            }
        }
    } else if #[cfg(target_arch = "x86")] {
        pub const REG_ESP: usize = 7;
        pub const REG_EIP: usize = 14;

        #[repr(C)]
        pub struct ucontext_t {
            pub uc_flags: u32,
            pub uc_link: *mut ucontext_t,
            pub uc_stack: stack_t,
            pub uc_mcontext: mcontext_t,
        }

        #[repr(C)]
        pub struct mcontext_t {
            pub gregs: [i32; 19],
            pub fpregs: *mut c_void,
            pub oldmask: u32,
            pub cr2: u32,
        }

        // Arguments are passed on the stack, so there is no `CallContext`
        impl MachineContext for ucontext_t {
            #[inline]
            fn pc(&self) -> usize {
                self.uc_mcontext.gregs[REG_EIP] as u32 as usize
            }

            #[inline]
            fn set_pc(&mut self, pc: usize) {
                self.uc_mcontext.gregs[REG_EIP] = pc as i32;
            }

            #[inline]
            fn sp(&self) -> usize {
                self.uc_mcontext.gregs[REG_ESP] as u32 as usize
            }

            #[inline]
            fn set_sp(&mut self, sp: usize) {
                self.uc_mcontext.gregs[REG_ESP] = sp as i32;
            }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        #[repr(C)]
        pub struct ucontext_t {
            pub uc_flags: u64,
            pub uc_link: *mut ucontext_t,
            pub uc_stack: stack_t,
            /// The kernel's 8 byte `sigset_t` padded out to 1024 bits
            pub uc_sigmask: [u64; 16],
            pub uc_mcontext: mcontext_t,
        }

        #[repr(C, align(16))]
        pub struct mcontext_t {
            pub fault_address: u64,
            pub regs: [u64; 31],
            pub sp: u64,
            pub pc: u64,
            pub pstate: u64,
        }

        /// `x30`
        const LR: usize = 30;

        impl MachineContext for ucontext_t {
            #[inline]
            fn pc(&self) -> usize {
                self.uc_mcontext.pc as usize
            }

            #[inline]
            fn set_pc(&mut self, pc: usize) {
                self.uc_mcontext.pc = pc as u64;
            }

            #[inline]
            fn sp(&self) -> usize {
                self.uc_mcontext.sp as usize
            }

            #[inline]
            fn set_sp(&mut self, sp: usize) {
                self.uc_mcontext.sp = sp as u64;
            }
        }

        impl CallContext for ucontext_t {
            #[inline]
            fn arg(&self, reg: ArgReg) -> usize {
                self.uc_mcontext.regs[reg as usize] as usize
            }

            #[inline]
            fn set_arg(&mut self, reg: ArgReg, value: usize) {
                self.uc_mcontext.regs[reg as usize] = value as u64;
            }

            #[inline]
            fn lr(&self) -> Option<usize> {
                Some(self.uc_mcontext.regs[LR] as usize)
            }

            #[inline]
            fn set_lr(&mut self, lr: usize) {
                self.uc_mcontext.regs[LR] = lr as u64;
            }
        }
    } else if #[cfg(target_arch = "riscv64")] {
        pub const REG_PC: usize = 0;
        pub const REG_RA: usize = 1;
        pub const REG_SP: usize = 2;
        pub const REG_A0: usize = 10;
        pub const REG_A1: usize = 11;

        #[repr(C)]
        pub struct ucontext_t {
            pub uc_flags: u64,
            pub uc_link: *mut ucontext_t,
            pub uc_stack: stack_t,
            pub uc_sigmask: [u64; 16],
            pub uc_mcontext: mcontext_t,
        }

        /// `user_regs_struct`, the floating point state that follows it
        /// forces the 16 byte alignment
        #[repr(C, align(16))]
        pub struct mcontext_t {
            pub gregs: [u64; 32],
        }

        impl MachineContext for ucontext_t {
            #[inline]
            fn pc(&self) -> usize {
                self.uc_mcontext.gregs[REG_PC] as usize
            }

            #[inline]
            fn set_pc(&mut self, pc: usize) {
                self.uc_mcontext.gregs[REG_PC] = pc as u64;
            }

            #[inline]
            fn sp(&self) -> usize {
                self.uc_mcontext.gregs[REG_SP] as usize
            }

            #[inline]
            fn set_sp(&mut self, sp: usize) {
                self.uc_mcontext.gregs[REG_SP] = sp as u64;
            }
        }

        impl CallContext for ucontext_t {
            #[inline]
            fn arg(&self, reg: ArgReg) -> usize {
                self.uc_mcontext.gregs[REG_A0 + reg as usize] as usize
            }

            #[inline]
            fn set_arg(&mut self, reg: ArgReg, value: usize) {
                self.uc_mcontext.gregs[REG_A0 + reg as usize] = value as u64;
            }

            #[inline]
            fn lr(&self) -> Option<usize> {
                Some(self.uc_mcontext.gregs[REG_RA] as usize)
            }

            #[inline]
            fn set_lr(&mut self, lr: usize) {
                self.uc_mcontext.gregs[REG_RA] = lr as u64;
            }
        }
    } else {
        compile_error!("fault-context has no signal context layout for this architecture");
    }
}
