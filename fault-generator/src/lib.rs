//! Routines that fault at instructions whose addresses are known ahead of
//! time, so that a fault handler's view of the machine state can be checked
//! against reality.
//!
//! Each routine records the stack pointer it is running with just before
//! executing its memory access, and the faulting instruction as well as the
//! one following it are exported as symbols, retrievable via
//! [`Access::fault_pc`] and [`Access::resume_pc`].

#![allow(unsafe_code)]

use std::ptr;

// Mach-O prefixes C symbols with an underscore, ELF doesn't
#[cfg(target_vendor = "apple")]
macro_rules! symbol {
    ($name:literal) => {
        concat!("_", $name)
    };
}

#[cfg(not(target_vendor = "apple"))]
macro_rules! symbol {
    ($name:literal) => {
        $name
    };
}

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        std::arch::global_asm! {
            ".text",
            concat!(".globl ", symbol!("fault_generator_load")),
            ".p2align 4",
            concat!(symbol!("fault_generator_load"), ":"),
            // rdi = addr, rsi = sp_out
            "mov qword ptr [rsi], rsp",
            concat!(".globl ", symbol!("fault_generator_load_fault")),
            concat!(symbol!("fault_generator_load_fault"), ":"),
            "mov rax, qword ptr [rdi]",
            concat!(".globl ", symbol!("fault_generator_load_resume")),
            concat!(symbol!("fault_generator_load_resume"), ":"),
            "ret",

            concat!(".globl ", symbol!("fault_generator_store")),
            ".p2align 4",
            concat!(symbol!("fault_generator_store"), ":"),
            // rdi = addr, rsi = value, rdx = sp_out
            "mov qword ptr [rdx], rsp",
            concat!(".globl ", symbol!("fault_generator_store_fault")),
            concat!(symbol!("fault_generator_store_fault"), ":"),
            "mov qword ptr [rdi], rsi",
            concat!(".globl ", symbol!("fault_generator_store_resume")),
            concat!(symbol!("fault_generator_store_resume"), ":"),
            "ret",
        }
    } else if #[cfg(target_arch = "aarch64")] {
        std::arch::global_asm! {
            ".text",
            concat!(".globl ", symbol!("fault_generator_load")),
            ".p2align 2",
            concat!(symbol!("fault_generator_load"), ":"),
            // x0 = addr, x1 = sp_out
            "mov x9, sp",
            "str x9, [x1]",
            concat!(".globl ", symbol!("fault_generator_load_fault")),
            concat!(symbol!("fault_generator_load_fault"), ":"),
            "ldr x0, [x0]",
            concat!(".globl ", symbol!("fault_generator_load_resume")),
            concat!(symbol!("fault_generator_load_resume"), ":"),
            "ret",

            concat!(".globl ", symbol!("fault_generator_store")),
            ".p2align 2",
            concat!(symbol!("fault_generator_store"), ":"),
            // x0 = addr, x1 = value, x2 = sp_out
            "mov x9, sp",
            "str x9, [x2]",
            concat!(".globl ", symbol!("fault_generator_store_fault")),
            concat!(symbol!("fault_generator_store_fault"), ":"),
            "str x1, [x0]",
            concat!(".globl ", symbol!("fault_generator_store_resume")),
            concat!(symbol!("fault_generator_store_resume"), ":"),
            "ret",
        }
    } else if #[cfg(target_arch = "riscv64")] {
        std::arch::global_asm! {
            ".text",
            concat!(".globl ", symbol!("fault_generator_load")),
            ".p2align 2",
            concat!(symbol!("fault_generator_load"), ":"),
            // a0 = addr, a1 = sp_out
            "sd sp, 0(a1)",
            concat!(".globl ", symbol!("fault_generator_load_fault")),
            concat!(symbol!("fault_generator_load_fault"), ":"),
            "ld a0, 0(a0)",
            concat!(".globl ", symbol!("fault_generator_load_resume")),
            concat!(symbol!("fault_generator_load_resume"), ":"),
            "ret",

            concat!(".globl ", symbol!("fault_generator_store")),
            ".p2align 2",
            concat!(symbol!("fault_generator_store"), ":"),
            // a0 = addr, a1 = value, a2 = sp_out
            "sd sp, 0(a2)",
            concat!(".globl ", symbol!("fault_generator_store_fault")),
            concat!(symbol!("fault_generator_store_fault"), ":"),
            "sd a1, 0(a0)",
            concat!(".globl ", symbol!("fault_generator_store_resume")),
            concat!(symbol!("fault_generator_store_resume"), ":"),
            "ret",
        }
    } else {
        compile_error!("fault-generator has no routines for this architecture");
    }
}

unsafe extern "C" {
    fn fault_generator_load(addr: usize, sp_out: *mut usize) -> usize;
    fn fault_generator_load_fault();
    fn fault_generator_load_resume();
    fn fault_generator_store(addr: usize, value: usize, sp_out: *mut usize);
    fn fault_generator_store_fault();
    fn fault_generator_store_resume();
}

/// The kinds of memory access we can generate
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Access {
    Load,
    Store,
}

impl Access {
    /// The address of the instruction that performs the access
    #[inline]
    pub fn fault_pc(self) -> usize {
        match self {
            Self::Load => fault_generator_load_fault as *const () as usize,
            Self::Store => fault_generator_store_fault as *const () as usize,
        }
    }

    /// The address of the instruction immediately following the access, a
    /// fault handler can resume execution here to skip the access entirely
    #[inline]
    pub fn resume_pc(self) -> usize {
        match self {
            Self::Load => fault_generator_load_resume as *const () as usize,
            Self::Store => fault_generator_store_resume as *const () as usize,
        }
    }
}

/// Loads a `usize` from `addr`, returning it along with the stack pointer
/// that was live when the load executed.
///
/// If the load is skipped by a fault handler the returned value is whatever
/// happened to be in the return register.
///
/// # Safety
///
/// `addr` is dereferenced, the caller is expecting this to fault
#[inline(never)]
pub unsafe fn load(addr: usize) -> (usize, usize) {
    let mut sp = 0;
    // SAFETY: caller's problem
    let value = unsafe { fault_generator_load(addr, &mut sp) };
    (value, sp)
}

/// Stores `value` at `addr`, returning the stack pointer that was live when
/// the store executed.
///
/// # Safety
///
/// `addr` is written to, the caller is expecting this to fault
#[inline(never)]
pub unsafe fn store(addr: usize, value: usize) -> usize {
    let mut sp = 0;
    // SAFETY: caller's problem
    unsafe { fault_generator_store(addr, value, &mut sp) };
    sp
}

/// The system page size
#[inline]
pub fn page_size() -> usize {
    // SAFETY: syscall
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Rounds `addr` down to the start of the page that contains it
#[inline]
pub fn page_start(addr: usize) -> usize {
    addr & !(page_size() - 1)
}

/// Changes the protection of the page containing `addr`.
///
/// This only issues a syscall so it can be used from within a fault handler.
#[inline]
pub fn protect(addr: usize, prot: i32) -> std::io::Result<()> {
    // SAFETY: syscall, the kernel validates the range
    if unsafe { libc::mprotect(page_start(addr) as *mut _, page_size(), prot) } == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// A single anonymous page of memory
pub struct Page {
    addr: usize,
    mapped: bool,
}

impl Page {
    /// Maps a zeroed page with the specified protection
    pub fn map(prot: i32) -> std::io::Result<Self> {
        // SAFETY: syscall
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                page_size(),
                prot,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }

        Ok(Self {
            addr: ptr as usize,
            mapped: true,
        })
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.addr
    }

    /// Unmaps the page, any further access to [`Self::addr`] will fault
    pub fn unmap(&mut self) -> std::io::Result<()> {
        if !self.mapped {
            return Ok(());
        }

        // SAFETY: syscall on a mapping we own
        if unsafe { libc::munmap(self.addr as *mut _, page_size()) } != 0 {
            return Err(std::io::Error::last_os_error());
        }

        self.mapped = false;
        Ok(())
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        let _res = self.unmap();
    }
}
