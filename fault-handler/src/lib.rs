//! `fault-handler` lets a program observe, and recover from, invalid memory
//! accesses made by its own threads.
//!
//! A single process wide [`FaultAction`] can be registered with [`fault`] (or
//! the [`set_action`] convenience). Whenever a thread then touches memory it
//! isn't allowed to, the action's handler is run **on that same thread**,
//! with a [`FaultInfo`] describing the faulting instruction, the stack pointer
//! at the time of the fault, and the address that was accessed. The handler's
//! return value decides what happens next.
//!
//! * `true` - the fault was dealt with, eg. by changing the protection of the
//!   page with `mprotect` or by redirecting the thread via
//!   [`FaultInfo::redirect`], and the thread resumes with its (possibly
//!   modified) register state. If nothing was changed the faulting instruction
//!   is simply executed again.
//! * `false` - the fault is passed on to the system's default handling, which
//!   terminates the process.
//!
//! This is the building block for things like generational garbage collector
//! write barriers, lazily populated memory regions, or guard page detection.
//!
//! # Linux/Android/BSD
//!
//! Faults are reported via the `SIGSEGV` and `SIGBUS` signals. A `SA_SIGINFO`
//! handler is installed for both of them when the first action with a handler
//! is registered, and the previous dispositions are restored when the handler
//! is cleared again. The handler runs with every signal blocked, and on the
//! alternate signal stack if the thread has one.
//!
//! # Macos
//!
//! Faults are reported as `EXC_BAD_ACCESS` Mach exception messages to the
//! task's exception port. A dedicated thread receives them, and rewrites the
//! faulting thread's register state so that it calls the handler itself. Once
//! the handler returns, the thread traps a second time at a known location,
//! and the exception thread restores the saved (and possibly modified) state.
//!
//! Note that this means that on Macos faults are consumed before they are
//! ever converted into signals, so `SIGSEGV`/`SIGBUS` handlers won't see any
//! fault that the registered handler claims.
//!
//! # Handler constraints
//!
//! The handler runs in an interrupted context. It must not acquire locks that
//! the interrupted code might hold, and on POSIX targets it may only make
//! async-signal-safe calls. It is fine for it to make syscalls such as
//! `mprotect` or `mmap`.

#![allow(unsafe_code)]

#[cfg(feature = "debug-print")]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {
        let cstr = concat!($s, "\n");
        $crate::write_stderr(cstr);
    };
}

#[cfg(not(feature = "debug-print"))]
#[macro_export]
macro_rules! debug_print {
    ($s:literal) => {};
}

/// Writes the specified string directly to stderr.
///
/// This is safe to be called from within a compromised context.
#[inline]
pub fn write_stderr(s: &'static str) {
    // SAFETY: syscall
    unsafe {
        libc::write(2, s.as_ptr().cast(), s.len());
    }
}

mod error;
mod retry;
mod state;

pub use error::Error;
pub use fault_context;
pub use retry::RetryLimit;
pub use state::{current_action, fault, set_action};

use std::{ffi::c_void, fmt, ptr};

cfg_if::cfg_if! {
    if #[cfg(target_os = "macos")] {
        mod mac;
        use mac as platform;

        /// The register state [`FaultInfo::ctx`] points to
        pub type NativeContext = fault_context::ThreadState;
    } else if #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "openbsd",
        target_os = "netbsd",
        target_os = "dragonfly"
    ))] {
        mod posix;
        use posix as platform;

        /// The register state [`FaultInfo::ctx`] points to
        pub type NativeContext = fault_context::SignalContext;
    } else {
        compile_error!("fault-handler does not support this target");
    }
}

/// The kinds of faults that can be handled
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum FaultKind {
    /// An access to memory that is unmapped, or mapped with a protection that
    /// doesn't permit the access
    BadAccess = 0,
}

/// The raw identifier of [`FaultKind::BadAccess`], as accepted by [`fault`]
pub const BAD_ACCESS: i32 = FaultKind::BadAccess as i32;

impl TryFrom<i32> for FaultKind {
    type Error = Error;

    fn try_from(kind: i32) -> Result<Self, Self::Error> {
        match kind {
            BAD_ACCESS => Ok(Self::BadAccess),
            _ => Err(Error::InvalidArgument),
        }
    }
}

/// Details of a single fault, valid only for the duration of the handler call
#[derive(Debug)]
pub struct FaultInfo {
    /// The address of the faulting instruction
    pub pc: usize,
    /// The stack pointer of the faulting thread at the time of the fault
    pub sp: usize,
    /// The memory address whose access faulted
    ///
    /// On x86_64 an access to a non-canonical address is reported by the CPU
    /// as a general protection fault, which carries no address, so 0 is
    /// reported instead.
    pub addr: usize,
    /// The platform register state of the faulting thread, a [`NativeContext`].
    ///
    /// Modifications made through this pointer are applied to the thread when
    /// the handler returns `true`.
    ///
    /// On Macos this only holds the general purpose registers. The floating
    /// point and vector registers are saved and restored around the handler
    /// separately, and can't be modified by it.
    pub ctx: *mut c_void,
}

impl FaultInfo {
    /// The register state of the faulting thread
    ///
    /// # Safety
    ///
    /// Must only be called from within the handler this was passed to
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn context(&self) -> &mut NativeContext {
        // SAFETY: the caller guarantees ctx is still live
        unsafe { &mut *self.ctx.cast::<NativeContext>() }
    }

    /// Changes the address the faulting thread will resume at if the handler
    /// returns `true`, for example to skip over the faulting instruction.
    ///
    /// # Safety
    ///
    /// Must only be called from within the handler this was passed to. `pc`
    /// must be the address of an instruction that is valid to execute with
    /// the faulting thread's current registers and stack.
    #[inline]
    pub unsafe fn redirect(&self, pc: usize) {
        use fault_context::MachineContext;

        // SAFETY: see above
        unsafe { self.context().set_pc(pc) };
    }
}

/// The signature of a fault handler.
///
/// The last argument is the opaque [`FaultAction::arg`] the handler was
/// registered with. Return `true` if the fault has been dealt with and the
/// thread can resume, `false` to fall through to the default handling, which
/// terminates the process.
pub type FaultFn = fn(FaultKind, &FaultInfo, *mut c_void) -> bool;

/// The process wide response to faults.
///
/// An action without a handler is "no handler", in which case faults are not
/// observed at all.
#[derive(Copy, Clone, Debug)]
pub struct FaultAction {
    pub handler: Option<FaultFn>,
    /// Opaque value passed to every invocation of the handler
    pub arg: *mut c_void,
}

impl FaultAction {
    /// The action with no handler
    pub const NONE: Self = Self {
        handler: None,
        arg: ptr::null_mut(),
    };

    #[inline]
    pub const fn new(handler: FaultFn, arg: *mut c_void) -> Self {
        Self {
            handler: Some(handler),
            arg,
        }
    }

    /// Creates an action that dispatches faults to the specified event
    pub fn from_event<E: FaultEvent>(event: &'static E) -> Self {
        fn dispatch<E: FaultEvent>(kind: FaultKind, info: &FaultInfo, arg: *mut c_void) -> bool {
            // SAFETY: arg was created from a &'static E in from_event
            let event = unsafe { &*arg.cast_const().cast::<E>() };
            event.on_fault(kind, info)
        }

        Self {
            handler: Some(dispatch::<E>),
            arg: ptr::from_ref(event).cast_mut().cast(),
        }
    }

    /// True if this action has a handler
    #[inline]
    pub fn is_active(&self) -> bool {
        self.handler.is_some()
    }
}

impl Default for FaultAction {
    fn default() -> Self {
        Self::NONE
    }
}

impl PartialEq for FaultAction {
    fn eq(&self, o: &Self) -> bool {
        let same_handler = match (self.handler, o.handler) {
            (Some(a), Some(b)) => ptr::fn_addr_eq(a, b),
            (None, None) => true,
            _ => false,
        };

        same_handler && self.arg == o.arg
    }
}

impl Eq for FaultAction {}

// SAFETY: the arg is opaque to us, it's up to the registrant to only pass
// values that can be used from whichever thread faults
unsafe impl Send for FaultAction {}
// SAFETY: see above
unsafe impl Sync for FaultAction {}

/// User implemented trait for handling faults with state instead of a raw
/// argument pointer, see [`FaultAction::from_event`]
///
/// # Safety
///
/// [`Self::on_fault`] is called in a compromised context, see the
/// [crate level](crate#handler-constraints) constraints.
pub unsafe trait FaultEvent: Sync {
    /// Called on the faulting thread, return `true` if the fault was handled
    fn on_fault(&self, kind: FaultKind, info: &FaultInfo) -> bool;
}

struct ClosureEvent<F> {
    inner: F,
}

// SAFETY: the creator of the closure promised it upholds the handler constraints
unsafe impl<F> FaultEvent for ClosureEvent<F>
where
    F: Fn(FaultKind, &FaultInfo) -> bool + Send + Sync,
{
    fn on_fault(&self, kind: FaultKind, info: &FaultInfo) -> bool {
        (self.inner)(kind, info)
    }
}

impl<F> fmt::Debug for ClosureEvent<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClosureEvent")
    }
}

/// Leaks a closure as a [`FaultEvent`] so it can be turned into a
/// [`FaultAction`] with [`FaultAction::from_event`]
///
/// # Safety
///
/// The closure is called in a compromised context, see the
/// [crate level](crate#handler-constraints) constraints.
pub unsafe fn make_fault_event<F>(closure: F) -> &'static impl FaultEvent
where
    F: Fn(FaultKind, &FaultInfo) -> bool + Send + Sync + 'static,
{
    Box::leak(Box::new(ClosureEvent { inner: closure }))
}
