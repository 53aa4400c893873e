//! The BSDs all hand `SA_SIGINFO` handlers their `ucontext_t`. libc describes
//! most of them well enough that we use its definitions directly, the few it
//! lacks are described here, again only up to the general purpose registers.

use crate::MachineContext;
#[cfg(not(target_arch = "x86"))]
use crate::{ArgReg, CallContext};

cfg_if::cfg_if! {
    if #[cfg(not(any(target_os = "netbsd", all(target_os = "openbsd", target_arch = "x86"))))] {
        /// The context handed to a signal handler on this target
        pub type SignalContext = libc::ucontext_t;
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(any(target_os = "freebsd", target_os = "dragonfly"), target_arch = "x86_64"))] {
        impl MachineContext for libc::ucontext_t {
            #[inline]
            fn pc(&self) -> usize {
                self.uc_mcontext.mc_rip as usize
            }

            #[inline]
            fn set_pc(&mut self, pc: usize) {
                self.uc_mcontext.mc_rip = pc as _;
            }

            #[inline]
            fn sp(&self) -> usize {
                self.uc_mcontext.mc_rsp as usize
            }

            #[inline]
            fn set_sp(&mut self, sp: usize) {
                self.uc_mcontext.mc_rsp = sp as _;
            }
        }

        impl CallContext for libc::ucontext_t {
            #[inline]
            fn arg(&self, reg: ArgReg) -> usize {
                match reg {
                    ArgReg::First => self.uc_mcontext.mc_rdi as usize,
                    ArgReg::Second => self.uc_mcontext.mc_rsi as usize,
                }
            }

            #[inline]
            fn set_arg(&mut self, reg: ArgReg, value: usize) {
                match reg {
                    ArgReg::First => self.uc_mcontext.mc_rdi = value as _,
                    ArgReg::Second => self.uc_mcontext.mc_rsi = value as _,
                }
            }
        }
    } else if #[cfg(all(target_os = "freebsd", target_arch = "aarch64"))] {
        impl MachineContext for libc::ucontext_t {
            #[inline]
            fn pc(&self) -> usize {
                self.uc_mcontext.mc_gpregs.gp_elr as usize
            }

            #[inline]
            fn set_pc(&mut self, pc: usize) {
                self.uc_mcontext.mc_gpregs.gp_elr = pc as _;
            }

            #[inline]
            fn sp(&self) -> usize {
                self.uc_mcontext.mc_gpregs.gp_sp as usize
            }

            #[inline]
            fn set_sp(&mut self, sp: usize) {
                self.uc_mcontext.mc_gpregs.gp_sp = sp as _;
            }
        }

        impl CallContext for libc::ucontext_t {
            #[inline]
            fn arg(&self, reg: ArgReg) -> usize {
                self.uc_mcontext.mc_gpregs.gp_x[reg as usize] as usize
            }

            #[inline]
            fn set_arg(&mut self, reg: ArgReg, value: usize) {
                self.uc_mcontext.mc_gpregs.gp_x[reg as usize] = value as _;
            }

            #[inline]
            fn lr(&self) -> Option<usize> {
                Some(self.uc_mcontext.mc_gpregs.gp_lr as usize)
            }

            #[inline]
            fn set_lr(&mut self, lr: usize) {
                self.uc_mcontext.mc_gpregs.gp_lr = lr as _;
            }
        }
    } else if #[cfg(all(target_os = "freebsd", target_arch = "x86"))] {
        // Arguments are passed on the stack, so no `CallContext`
        impl MachineContext for libc::ucontext_t {
            #[inline]
            fn pc(&self) -> usize {
                self.uc_mcontext.mc_eip as usize
            }

            #[inline]
            fn set_pc(&mut self, pc: usize) {
                self.uc_mcontext.mc_eip = pc as _;
            }

            #[inline]
            fn sp(&self) -> usize {
                self.uc_mcontext.mc_esp as usize
            }

            #[inline]
            fn set_sp(&mut self, sp: usize) {
                self.uc_mcontext.mc_esp = sp as _;
            }
        }
    } else if #[cfg(all(target_os = "freebsd", target_arch = "riscv64"))] {
        impl MachineContext for libc::ucontext_t {
            #[inline]
            fn pc(&self) -> usize {
                self.uc_mcontext.mc_gpregs.gp_sepc as usize
            }

            #[inline]
            fn set_pc(&mut self, pc: usize) {
                self.uc_mcontext.mc_gpregs.gp_sepc = pc as _;
            }

            #[inline]
            fn sp(&self) -> usize {
                self.uc_mcontext.mc_gpregs.gp_sp as usize
            }

            #[inline]
            fn set_sp(&mut self, sp: usize) {
                self.uc_mcontext.mc_gpregs.gp_sp = sp as _;
            }
        }

        impl CallContext for libc::ucontext_t {
            #[inline]
            fn arg(&self, reg: ArgReg) -> usize {
                self.uc_mcontext.mc_gpregs.gp_a[reg as usize] as usize
            }

            #[inline]
            fn set_arg(&mut self, reg: ArgReg, value: usize) {
                self.uc_mcontext.mc_gpregs.gp_a[reg as usize] = value as _;
            }

            #[inline]
            fn lr(&self) -> Option<usize> {
                Some(self.uc_mcontext.mc_gpregs.gp_ra as usize)
            }

            #[inline]
            fn set_lr(&mut self, lr: usize) {
                self.uc_mcontext.mc_gpregs.gp_ra = lr as _;
            }
        }
    } else if #[cfg(all(target_os = "openbsd", target_arch = "x86_64"))] {
        // `ucontext_t` is just `sigcontext` on OpenBSD
        impl MachineContext for libc::ucontext_t {
            #[inline]
            fn pc(&self) -> usize {
                self.sc_rip as usize
            }

            #[inline]
            fn set_pc(&mut self, pc: usize) {
                self.sc_rip = pc as _;
            }

            #[inline]
            fn sp(&self) -> usize {
                self.sc_rsp as usize
            }

            #[inline]
            fn set_sp(&mut self, sp: usize) {
                self.sc_rsp = sp as _;
            }
        }

        impl CallContext for libc::ucontext_t {
            #[inline]
            fn arg(&self, reg: ArgReg) -> usize {
                match reg {
                    ArgReg::First => self.sc_rdi as usize,
                    ArgReg::Second => self.sc_rsi as usize,
                }
            }

            #[inline]
            fn set_arg(&mut self, reg: ArgReg, value: usize) {
                match reg {
                    ArgReg::First => self.sc_rdi = value as _,
                    ArgReg::Second => self.sc_rsi = value as _,
                }
            }
        }
    } else if #[cfg(all(target_os = "openbsd", target_arch = "x86"))] {
        /// `struct sigcontext` from <machine/signal.h>, which libc lacks for
        /// this target
        #[repr(C)]
        pub struct sigcontext {
            pub sc_gs: i32,
            pub sc_fs: i32,
            pub sc_es: i32,
            pub sc_ds: i32,
            pub sc_edi: i32,
            pub sc_esi: i32,
            pub sc_ebp: i32,
            pub sc_ebx: i32,
            pub sc_edx: i32,
            pub sc_ecx: i32,
            pub sc_eax: i32,
            pub sc_eip: i32,
            pub sc_cs: i32,
            pub sc_eflags: i32,
            pub sc_esp: i32,
            pub sc_ss: i32,
        }

        /// The context handed to a signal handler on this target
        pub type SignalContext = sigcontext;

        impl MachineContext for sigcontext {
            #[inline]
            fn pc(&self) -> usize {
                self.sc_eip as usize
            }

            #[inline]
            fn set_pc(&mut self, pc: usize) {
                self.sc_eip = pc as _;
            }

            #[inline]
            fn sp(&self) -> usize {
                self.sc_esp as usize
            }

            #[inline]
            fn set_sp(&mut self, sp: usize) {
                self.sc_esp = sp as _;
            }
        }
    } else if #[cfg(all(target_os = "openbsd", target_arch = "aarch64"))] {
        impl MachineContext for libc::ucontext_t {
            #[inline]
            fn pc(&self) -> usize {
                self.sc_elr as usize
            }

            #[inline]
            fn set_pc(&mut self, pc: usize) {
                self.sc_elr = pc as _;
            }

            #[inline]
            fn sp(&self) -> usize {
                self.sc_sp as usize
            }

            #[inline]
            fn set_sp(&mut self, sp: usize) {
                self.sc_sp = sp as _;
            }
        }

        impl CallContext for libc::ucontext_t {
            #[inline]
            fn arg(&self, reg: ArgReg) -> usize {
                self.sc_x[reg as usize] as usize
            }

            #[inline]
            fn set_arg(&mut self, reg: ArgReg, value: usize) {
                self.sc_x[reg as usize] = value as _;
            }

            #[inline]
            fn lr(&self) -> Option<usize> {
                Some(self.sc_lr as usize)
            }

            #[inline]
            fn set_lr(&mut self, lr: usize) {
                self.sc_lr = lr as _;
            }
        }
    } else if #[cfg(all(target_os = "openbsd", target_arch = "riscv64"))] {
        impl MachineContext for libc::ucontext_t {
            #[inline]
            fn pc(&self) -> usize {
                self.sc_sepc as usize
            }

            #[inline]
            fn set_pc(&mut self, pc: usize) {
                self.sc_sepc = pc as _;
            }

            #[inline]
            fn sp(&self) -> usize {
                self.sc_sp as usize
            }

            #[inline]
            fn set_sp(&mut self, sp: usize) {
                self.sc_sp = sp as _;
            }
        }

        impl CallContext for libc::ucontext_t {
            #[inline]
            fn arg(&self, reg: ArgReg) -> usize {
                self.sc_a[reg as usize] as usize
            }

            #[inline]
            fn set_arg(&mut self, reg: ArgReg, value: usize) {
                self.sc_a[reg as usize] = value as _;
            }

            #[inline]
            fn lr(&self) -> Option<usize> {
                Some(self.sc_ra as usize)
            }

            #[inline]
            fn set_lr(&mut self, lr: usize) {
                self.sc_ra = lr as _;
            }
        }
    } else if #[cfg(target_os = "netbsd")] {
        // Every NetBSD port describes its general purpose registers as the
        // `__gregs` array, `_UC_MACHINE_PC` and `_UC_MACHINE_SP` in
        // <machine/mcontext.h> index into it
        cfg_if::cfg_if! {
            if #[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))] {
                /// The context handed to a signal handler on this target
                pub type SignalContext = libc::ucontext_t;
            } else {
                /// `ucontext_t` from <sys/ucontext.h>, which libc lacks for
                /// this target
                #[repr(C)]
                pub struct ucontext_t {
                    pub uc_flags: libc::c_uint,
                    pub uc_link: *mut ucontext_t,
                    pub uc_sigmask: libc::sigset_t,
                    pub uc_stack: libc::stack_t,
                    pub uc_mcontext: mcontext_t,
                }

                /// The context handed to a signal handler on this target
                pub type SignalContext = ucontext_t;
            }
        }

        cfg_if::cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                const PC: usize = libc::_REG_RIP as usize;
                const SP: usize = libc::_REG_RSP as usize;
                const ARG0: usize = libc::_REG_RDI as usize;
                const LR: Option<usize> = None;
            } else if #[cfg(target_arch = "aarch64")] {
                const PC: usize = libc::_REG_PC as usize;
                const SP: usize = libc::_REG_SP as usize;
                const ARG0: usize = libc::_REG_X0 as usize;
                const LR: Option<usize> = Some(libc::_REG_LR as usize);
            } else if #[cfg(target_arch = "riscv64")] {
                pub use libc::mcontext_t;

                const PC: usize = libc::_REG_PC as usize;
                const SP: usize = libc::_REG_SP as usize;
                const ARG0: usize = libc::_REG_A0 as usize;
                const LR: Option<usize> = Some(libc::_REG_RA as usize);
            } else if #[cfg(target_arch = "arm")] {
                /// The floating point half of the structure holds `u64`s
                #[repr(C, align(8))]
                pub struct mcontext_t {
                    pub __gregs: [u32; 17],
                }

                const PC: usize = libc::_REG_PC as usize;
                const SP: usize = libc::_REG_SP as usize;
                const ARG0: usize = libc::_REG_R0 as usize;
                const LR: Option<usize> = Some(libc::_REG_LR as usize);
            } else if #[cfg(target_arch = "x86")] {
                #[repr(C)]
                pub struct mcontext_t {
                    pub __gregs: [i32; 19],
                }

                // _REG_EIP and _REG_UESP, arguments are passed on the stack
                // so there is no `CallContext`
                const PC: usize = 14;
                const SP: usize = 17;
            } else {
                compile_error!("fault-context has no register indices for this NetBSD architecture");
            }
        }

        impl MachineContext for SignalContext {
            #[inline]
            fn pc(&self) -> usize {
                self.uc_mcontext.__gregs[PC] as usize
            }

            #[inline]
            fn set_pc(&mut self, pc: usize) {
                self.uc_mcontext.__gregs[PC] = pc as _;
            }

            #[inline]
            fn sp(&self) -> usize {
                self.uc_mcontext.__gregs[SP] as usize
            }

            #[inline]
            fn set_sp(&mut self, sp: usize) {
                self.uc_mcontext.__gregs[SP] = sp as _;
            }
        }

        #[cfg(not(target_arch = "x86"))]
        impl CallContext for SignalContext {
            #[inline]
            fn arg(&self, reg: ArgReg) -> usize {
                self.uc_mcontext.__gregs[ARG0 + reg as usize] as usize
            }

            #[inline]
            fn set_arg(&mut self, reg: ArgReg, value: usize) {
                self.uc_mcontext.__gregs[ARG0 + reg as usize] = value as _;
            }

            #[inline]
            fn lr(&self) -> Option<usize> {
                LR.map(|lr| self.uc_mcontext.__gregs[lr] as usize)
            }

            #[inline]
            fn set_lr(&mut self, lr: usize) {
                if let Some(reg) = LR {
                    self.uc_mcontext.__gregs[reg] = lr as _;
                }
            }
        }
    } else {
        compile_error!("fault-context has no signal context layout for this BSD architecture");
    }
}
