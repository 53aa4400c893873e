#![allow(unsafe_code, dead_code)]

pub use fault_generator::Access;
pub use fault_handler::{FaultAction, FaultInfo, FaultKind};

use std::{
    ffi::c_void,
    process::{Command, Output},
    ptr,
    sync::atomic::{AtomicUsize, Ordering},
};

/// Set in the environment of child processes spawned by [`run_in_child`]
const CHILD_ENV: &str = "FAULT_HANDLER_TEST_CHILD";

/// The fields of the last [`FaultInfo`] seen by [`record_and_skip`]
pub struct Recorded {
    pub count: AtomicUsize,
    pub pc: AtomicUsize,
    pub sp: AtomicUsize,
    pub addr: AtomicUsize,
}

pub static RECORDED: Recorded = Recorded {
    count: AtomicUsize::new(0),
    pc: AtomicUsize::new(0),
    sp: AtomicUsize::new(0),
    addr: AtomicUsize::new(0),
};

impl Recorded {
    pub fn reset(&self) {
        self.count.store(0, Ordering::SeqCst);
        self.pc.store(0, Ordering::SeqCst);
        self.sp.store(0, Ordering::SeqCst);
        self.addr.store(0, Ordering::SeqCst);
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn pc(&self) -> usize {
        self.pc.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn sp(&self) -> usize {
        self.sp.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.addr.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn record(&self, info: &FaultInfo) {
        self.pc.store(info.pc, Ordering::SeqCst);
        self.sp.store(info.sp, Ordering::SeqCst);
        self.addr.store(info.addr, Ordering::SeqCst);
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

/// Maps the pc of one of the fault-generator accesses to the instruction
/// following it
pub fn resume_pc(fault_pc: usize) -> Option<usize> {
    [Access::Load, Access::Store]
        .into_iter()
        .find(|access| access.fault_pc() == fault_pc)
        .map(Access::resume_pc)
}

/// Records the fault, then skips over the faulting access
pub fn record_and_skip(_kind: FaultKind, info: &FaultInfo, _arg: *mut c_void) -> bool {
    RECORDED.record(info);

    let Some(resume) = resume_pc(info.pc) else {
        fault_handler::debug_print!("fault at an unexpected location");
        return false;
    };

    // SAFETY: we're in the handler, and resume is the ret following the access
    unsafe { info.redirect(resume) };
    true
}

/// Declines every fault
pub fn decline(_kind: FaultKind, _info: &FaultInfo, _arg: *mut c_void) -> bool {
    fault_handler::write_stderr("declined\n");
    false
}

#[inline]
pub fn skipping_action() -> FaultAction {
    FaultAction::new(record_and_skip, ptr::null_mut())
}

/// True if the address reported for an access to `expected` is that address.
///
/// aarch64 kernels may strip the top byte of the address, as it can be used as
/// a tag.
pub fn wild_address_matches(expected: usize, reported: usize) -> bool {
    reported == expected
        || (cfg!(target_arch = "aarch64") && reported == expected & (usize::MAX >> 8))
}

#[inline]
pub fn is_child() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

/// Runs the specified test in a child process of the current test binary.
///
/// Used for tests where the process is expected to die.
pub fn run_in_child(test: &str) -> Output {
    Command::new(std::env::current_exe().expect("unable to find test binary"))
        .args(["--exact", test, "--nocapture", "--test-threads", "1"])
        .env(CHILD_ENV, "1")
        .output()
        .expect("failed to run child")
}

/// Asserts the child was killed by a fault signal
pub fn assert_fault_terminated(output: &Output) {
    use std::os::unix::process::ExitStatusExt;

    let signal = output.status.signal();
    assert!(
        matches!(signal, Some(libc::SIGSEGV | libc::SIGBUS)),
        "child exited with {:?}\nstdout: {}\nstderr: {}",
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    );
}
