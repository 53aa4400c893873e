#![cfg(not(target_os = "macos"))]

mod shared;

use fault_handler::FaultAction;
use shared::RECORDED;
use std::{ffi::c_void, mem, ptr};

extern "C" fn prior(_sig: i32, _info: *mut libc::siginfo_t, _uc: *mut c_void) {}

fn disposition(sig: i32) -> libc::sigaction {
    // SAFETY: syscall
    unsafe {
        let mut cur: libc::sigaction = mem::zeroed();
        assert_eq!(libc::sigaction(sig, ptr::null(), &mut cur), 0);
        cur
    }
}

fn run_child(test: &str) {
    let output = shared::run_in_child(test);
    assert!(
        output.status.success(),
        "child exited with {:?}\nstdout: {}\nstderr: {}",
        output.status,
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr),
    );
}

/// Clearing the action puts back exactly the dispositions that were in place
/// before it was set
#[test]
fn restores_previous_dispositions() {
    if !shared::is_child() {
        run_child("restores_previous_dispositions");
        return;
    }

    // SAFETY: syscall
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        sa.sa_sigaction = prior as *const () as usize;
        sa.sa_flags = libc::SA_SIGINFO;
        assert_eq!(libc::sigaction(libc::SIGSEGV, &sa, ptr::null_mut()), 0);
    }
    let bus = disposition(libc::SIGBUS).sa_sigaction;

    fault_handler::set_action(shared::skipping_action()).unwrap();
    assert_ne!(
        disposition(libc::SIGSEGV).sa_sigaction,
        prior as *const () as usize
    );
    assert_ne!(disposition(libc::SIGBUS).sa_sigaction, bus);

    RECORDED.reset();
    // SAFETY: we expect this to fault
    unsafe { fault_generator::load(0x10) };
    assert_eq!(RECORDED.count(), 1);

    fault_handler::set_action(FaultAction::NONE).unwrap();

    let segv = disposition(libc::SIGSEGV);
    assert_eq!(segv.sa_sigaction, prior as *const () as usize);
    assert_ne!(segv.sa_flags & libc::SA_SIGINFO, 0);
    assert_eq!(disposition(libc::SIGBUS).sa_sigaction, bus);
}

/// Code that saves and restores our handler with `signal`, dropping
/// `SA_SIGINFO`, doesn't stop faults from being reported correctly
#[test]
fn recovers_lost_siginfo() {
    if !shared::is_child() {
        run_child("recovers_lost_siginfo");
        return;
    }

    fault_handler::set_action(shared::skipping_action()).unwrap();

    for sig in [libc::SIGSEGV, libc::SIGBUS] {
        let mut sa = disposition(sig);
        sa.sa_flags &= !libc::SA_SIGINFO;
        // SAFETY: syscall
        assert_eq!(unsafe { libc::sigaction(sig, &sa, ptr::null_mut()) }, 0);
    }

    RECORDED.reset();
    // SAFETY: we expect this to fault
    unsafe { fault_generator::load(0x10) };

    // The first delivery only reinstalls the handler, the second is reported
    assert_eq!(RECORDED.count(), 1);
    assert_eq!(RECORDED.addr(), 0x10);
    assert_ne!(disposition(libc::SIGSEGV).sa_flags & libc::SA_SIGINFO, 0);

    fault_handler::set_action(FaultAction::NONE).unwrap();
}
