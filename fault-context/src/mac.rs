//! Thread and exception state as returned by `thread_get_state`.
//!
//! These mirror the 64-bit flavors from `<mach/i386/_structs.h>` and
//! `<mach/arm/_structs.h>`. `mach2` only covers some of them, and we need the
//! exact flavor/count pairs anyway, so they are all defined here.

use crate::{ArgReg, CallContext, ExceptionContext, MachineContext};

/// `thread_state_flavor_t`
pub type thread_state_flavor_t = i32;

/// Required alignment of the stack pointer at a call boundary
pub const STACK_ALIGN: usize = 16;
/// The area below the stack pointer that leaf functions may use without
/// adjusting the stack pointer, and which must be left untouched when pushing
/// data onto a thread's stack from the outside
pub const RED_ZONE: usize = 128;

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// `x86_THREAD_STATE64`
        pub const THREAD_STATE_FLAVOR: thread_state_flavor_t = 4;
        /// `x86_EXCEPTION_STATE64`
        pub const EXCEPTION_STATE_FLAVOR: thread_state_flavor_t = 6;
        /// `x86_FLOAT_STATE64`
        pub const FLOAT_STATE_FLAVOR: thread_state_flavor_t = 5;
        /// `THREAD_STATE_NONE`
        pub const THREAD_STATE_NONE: thread_state_flavor_t = 13;
        /// Calling a function pushes the return address onto the stack
        pub const CALL_PUSHES_RETURN_ADDRESS: bool = true;

        /// `x86_thread_state64_t`
        #[repr(C)]
        #[derive(Copy, Clone, Default)]
        pub struct ThreadState {
            pub __rax: u64,
            pub __rbx: u64,
            pub __rcx: u64,
            pub __rdx: u64,
            pub __rdi: u64,
            pub __rsi: u64,
            pub __rbp: u64,
            pub __rsp: u64,
            pub __r8: u64,
            pub __r9: u64,
            pub __r10: u64,
            pub __r11: u64,
            pub __r12: u64,
            pub __r13: u64,
            pub __r14: u64,
            pub __r15: u64,
            pub __rip: u64,
            pub __rflags: u64,
            pub __cs: u64,
            pub __fs: u64,
            pub __gs: u64,
        }

        /// `x86_exception_state64_t`
        #[repr(C)]
        #[derive(Copy, Clone, Default)]
        pub struct ExceptionState {
            pub __trapno: u16,
            pub __cpu: u16,
            pub __err: u32,
            pub __faultvaddr: u64,
        }

        impl MachineContext for ThreadState {
            #[inline]
            fn pc(&self) -> usize {
                self.__rip as usize
            }

            #[inline]
            fn set_pc(&mut self, pc: usize) {
                self.__rip = pc as u64;
            }

            #[inline]
            fn sp(&self) -> usize {
                self.__rsp as usize
            }

            #[inline]
            fn set_sp(&mut self, sp: usize) {
                self.__rsp = sp as u64;
            }
        }

        impl CallContext for ThreadState {
            #[inline]
            fn arg(&self, reg: ArgReg) -> usize {
                match reg {
                    ArgReg::First => self.__rdi as usize,
                    ArgReg::Second => self.__rsi as usize,
                }
            }

            #[inline]
            fn set_arg(&mut self, reg: ArgReg, value: usize) {
                match reg {
                    ArgReg::First => self.__rdi = value as u64,
                    ArgReg::Second => self.__rsi = value as u64,
                }
            }
        }

        impl ExceptionContext for ExceptionState {
            #[inline]
            fn fault_address(&self) -> usize {
                self.__faultvaddr as usize
            }
        }

        /// `x86_float_state64_t`, the x87, MMX and SSE registers. Nothing
        /// reads the individual registers, it is only saved and restored.
        #[repr(C)]
        #[derive(Copy, Clone)]
        pub struct FloatState {
            words: [u32; 131],
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// `ARM_THREAD_STATE64`
        pub const THREAD_STATE_FLAVOR: thread_state_flavor_t = 6;
        /// `ARM_EXCEPTION_STATE64`
        pub const EXCEPTION_STATE_FLAVOR: thread_state_flavor_t = 7;
        /// `ARM_NEON_STATE64`
        pub const FLOAT_STATE_FLAVOR: thread_state_flavor_t = 17;
        /// `THREAD_STATE_NONE`
        pub const THREAD_STATE_NONE: thread_state_flavor_t = 5;
        pub const CALL_PUSHES_RETURN_ADDRESS: bool = false;

        /// `arm_thread_state64_t`
        ///
        /// Note that this is the layout for processes without pointer
        /// authentication, which is the only kind Rust currently produces
        #[repr(C)]
        #[derive(Copy, Clone, Default)]
        pub struct ThreadState {
            pub __x: [u64; 29],
            pub __fp: u64,
            pub __lr: u64,
            pub __sp: u64,
            pub __pc: u64,
            pub __cpsr: u32,
            pub __pad: u32,
        }

        /// `arm_exception_state64_t`
        #[repr(C)]
        #[derive(Copy, Clone, Default)]
        pub struct ExceptionState {
            /// Fault address register
            pub __far: u64,
            /// Exception syndrome register
            pub __esr: u32,
            pub __exception: u32,
        }

        impl MachineContext for ThreadState {
            #[inline]
            fn pc(&self) -> usize {
                self.__pc as usize
            }

            #[inline]
            fn set_pc(&mut self, pc: usize) {
                self.__pc = pc as u64;
            }

            #[inline]
            fn sp(&self) -> usize {
                self.__sp as usize
            }

            #[inline]
            fn set_sp(&mut self, sp: usize) {
                self.__sp = sp as u64;
            }
        }

        impl CallContext for ThreadState {
            #[inline]
            fn arg(&self, reg: ArgReg) -> usize {
                self.__x[reg as usize] as usize
            }

            #[inline]
            fn set_arg(&mut self, reg: ArgReg, value: usize) {
                self.__x[reg as usize] = value as u64;
            }

            #[inline]
            fn lr(&self) -> Option<usize> {
                Some(self.__lr as usize)
            }

            #[inline]
            fn set_lr(&mut self, lr: usize) {
                self.__lr = lr as u64;
            }
        }

        impl ExceptionContext for ExceptionState {
            #[inline]
            fn fault_address(&self) -> usize {
                self.__far as usize
            }
        }

        /// `arm_neon_state64_t`, the 32 128-bit vector registers plus `fpsr`
        /// and `fpcr`. Nothing reads the individual registers, it is only
        /// saved and restored.
        #[repr(C, align(16))]
        #[derive(Copy, Clone)]
        pub struct FloatState {
            words: [u32; 132],
        }
    } else {
        compile_error!("fault-context has no thread state layout for this architecture");
    }
}

/// The size of [`ThreadState`] in `natural_t` units, as `thread_get_state` expects
pub const THREAD_STATE_COUNT: u32 = (std::mem::size_of::<ThreadState>() / 4) as u32;
/// The size of [`ExceptionState`] in `natural_t` units
pub const EXCEPTION_STATE_COUNT: u32 = (std::mem::size_of::<ExceptionState>() / 4) as u32;
/// The size of [`FloatState`] in `natural_t` units
pub const FLOAT_STATE_COUNT: u32 = (std::mem::size_of::<FloatState>() / 4) as u32;

impl Default for FloatState {
    fn default() -> Self {
        // SAFETY: POD
        unsafe { std::mem::zeroed() }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counts_match_headers() {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                // x86_THREAD_STATE64_COUNT, x86_EXCEPTION_STATE64_COUNT,
                // x86_FLOAT_STATE64_COUNT
                assert_eq!(THREAD_STATE_COUNT, 42);
                assert_eq!(EXCEPTION_STATE_COUNT, 4);
                assert_eq!(FLOAT_STATE_COUNT, 131);
            } else {
                // ARM_THREAD_STATE64_COUNT, ARM_EXCEPTION_STATE64_COUNT,
                // ARM_NEON_STATE64_COUNT
                assert_eq!(THREAD_STATE_COUNT, 68);
                assert_eq!(EXCEPTION_STATE_COUNT, 4);
                assert_eq!(FLOAT_STATE_COUNT, 132);
            }
        }
    }

    #[test]
    fn call_registers() {
        let mut ts = ThreadState::default();
        ts.set_arg(ArgReg::First, 1);
        ts.set_arg(ArgReg::Second, 2);
        ts.set_pc(0x1000);
        ts.set_sp(0x2000);

        assert_eq!(ts.arg(ArgReg::First), 1);
        assert_eq!(ts.arg(ArgReg::Second), 2);
        assert_eq!(ts.pc(), 0x1000);
        assert_eq!(ts.sp(), 0x2000);

        ts.set_lr(0x3000);
        if cfg!(target_arch = "x86_64") {
            assert_eq!(ts.lr(), None);
        } else {
            assert_eq!(ts.lr(), Some(0x3000));
        }
    }
}
