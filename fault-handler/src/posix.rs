//! Fault delivery via `SIGSEGV`/`SIGBUS` signal handlers

use crate::{Error, FaultInfo, FaultKind};
use fault_context::{MachineContext, SignalContext};
use std::{ffi::c_void, mem, ptr};

/// The signals the kernel reports invalid memory accesses with. Which one is
/// raised for a given access differs between kernels, eg. the BSDs and MacOS
/// report protection violations as `SIGBUS`.
const FAULT_SIGNALS: [i32; 2] = [libc::SIGSEGV, libc::SIGBUS];

/// Use the alternate stack if the thread has one, we might be handling a
/// fault caused by a stack overflow
const SA_FLAGS: i32 = libc::SA_SIGINFO | libc::SA_ONSTACK;

/// The dispositions that were in place before we hooked, present only while
/// we are hooked
static OLD_HANDLERS: parking_lot::Mutex<Option<[libc::sigaction; 2]>> =
    parking_lot::const_mutex(None);

/// Installs our handler for every signal in [`FAULT_SIGNALS`], or none of them
///
/// # Safety
///
/// Must not be called concurrently with anything else that modifies the
/// dispositions of the fault signals
pub(crate) unsafe fn hook() -> Result<(), Error> {
    let mut ohl = OLD_HANDLERS.lock();

    if ohl.is_some() {
        return Ok(());
    }

    // SAFETY: syscalls
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        // Block every signal while the handler runs, there's no telling what
        // state the interrupted code left things in
        libc::sigfillset(&mut sa.sa_mask);
        sa.sa_sigaction = signal_handler as *const () as usize;
        sa.sa_flags = SA_FLAGS;

        *ohl = Some(install(&FAULT_SIGNALS, &sa)?);
    }

    Ok(())
}

/// Sets the disposition of every signal in `signals` to `sa`, returning the
/// ones that were replaced. If any of them fails the ones already replaced
/// are put back, so either all signals are changed or none are.
unsafe fn install<const N: usize>(
    signals: &[i32; N],
    sa: &libc::sigaction,
) -> Result<[libc::sigaction; N], Error> {
    unsafe {
        let mut old_handlers: [libc::sigaction; N] = mem::zeroed();

        for (i, sig) in signals.iter().copied().enumerate() {
            if libc::sigaction(sig, sa, &mut old_handlers[i]) == -1 {
                let err = std::io::Error::last_os_error();

                // Put back the ones we've already replaced
                for (sig, old) in signals.iter().copied().zip(&old_handlers[..i]) {
                    if libc::sigaction(sig, old, ptr::null_mut()) == -1 {
                        install_default_handler(sig);
                    }
                }

                return Err(err.into());
            }
        }

        Ok(old_handlers)
    }
}

/// Restores the dispositions that were replaced by [`hook`]. This never
/// fails, if a disposition can't be restored the signal gets the default one.
///
/// # Safety
///
/// See [`hook`]
pub(crate) unsafe fn unhook() -> Result<(), Error> {
    let Some(old_handlers) = OLD_HANDLERS.lock().take() else {
        return Ok(());
    };

    for (sig, old) in FAULT_SIGNALS.iter().copied().zip(old_handlers.iter()) {
        // SAFETY: syscall
        unsafe {
            if libc::sigaction(sig, old, ptr::null_mut()) == -1 {
                install_default_handler(sig);
            }
        }
    }

    Ok(())
}

/// Sets the disposition of the signal to `SIG_DFL`. `sigaction` is used
/// rather than `signal` as it is async signal safe everywhere.
#[inline]
unsafe fn install_default_handler(sig: i32) {
    unsafe {
        let mut sa: libc::sigaction = mem::zeroed();
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_sigaction = libc::SIG_DFL;
        libc::sigaction(sig, &sa, ptr::null_mut());
    }
}

/// True if the signal was sent by a process via `kill` et al rather than
/// raised by the kernel for a fault
#[inline]
fn is_user_signal(info: &libc::siginfo_t) -> bool {
    // SI_USER, SI_QUEUE, SI_TKILL etc are <= 0 everywhere except FreeBSD and
    // DragonFly, which number them from 0x10001
    info.si_code <= 0
        || (cfg!(any(target_os = "freebsd", target_os = "dragonfly")) && info.si_code > 0x10000)
}

unsafe extern "C" fn signal_handler(sig: i32, info: *mut libc::siginfo_t, uc: *mut c_void) {
    unsafe {
        // Some code saves and restores signal handlers with `signal` instead
        // of `sigaction`, losing `SA_SIGINFO`, in which case `info` and `uc`
        // are garbage. Reinstall ourselves correctly and return, the fault
        // will be raised again with valid arguments.
        {
            let mut cur_handler: libc::sigaction = mem::zeroed();
            if libc::sigaction(sig, ptr::null(), &mut cur_handler) == 0
                && cur_handler.sa_sigaction == signal_handler as *const () as usize
                && cur_handler.sa_flags & libc::SA_SIGINFO == 0
            {
                libc::sigfillset(&mut cur_handler.sa_mask);
                cur_handler.sa_flags = SA_FLAGS;

                if libc::sigaction(sig, &cur_handler, ptr::null_mut()) == -1 {
                    // Avoid looping forever
                    install_default_handler(sig);
                }

                return;
            }
        }

        let info = &*info;

        if is_user_signal(info) {
            // Not a fault, so not ours to handle. The signal is blocked
            // until we return, at which point it is delivered with the
            // default disposition.
            debug_print!("fault signal sent by a process, raising with default disposition");
            install_default_handler(sig);
            libc::raise(sig);
            return;
        }

        let action = crate::current_action();

        let handled = match action.handler {
            Some(handler) => {
                let ctx = &*uc.cast::<SignalContext>();
                let fi = FaultInfo {
                    pc: ctx.pc(),
                    sp: ctx.sp(),
                    addr: info.si_addr() as usize,
                    ctx: uc,
                };

                handler(FaultKind::BadAccess, &fi, action.arg)
            }
            None => false,
        };

        // If handled, returning resumes the thread with whatever state the
        // handler left in the context. Otherwise we fall back to the default
        // disposition so that when the faulting instruction is executed again
        // the process terminates as if we had never been here.
        if !handled {
            debug_print!("fault was not handled, installing default handler");
            install_default_handler(sig);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    unsafe fn disposition(sig: i32) -> libc::sigaction {
        unsafe {
            let mut cur: libc::sigaction = mem::zeroed();
            assert_eq!(libc::sigaction(sig, ptr::null(), &mut cur), 0);
            cur
        }
    }

    /// A failure part way through leaves the signals already changed as they
    /// were before
    #[test]
    fn install_rolls_back() {
        // SAFETY: SIGUSR2 is used by nothing else in this binary, and SIGKILL
        // can never be changed
        unsafe {
            let mut ignore: libc::sigaction = mem::zeroed();
            ignore.sa_sigaction = libc::SIG_IGN;
            assert_eq!(libc::sigaction(libc::SIGUSR2, &ignore, ptr::null_mut()), 0);

            let mut sa: libc::sigaction = mem::zeroed();
            libc::sigfillset(&mut sa.sa_mask);
            sa.sa_sigaction = signal_handler as *const () as usize;
            sa.sa_flags = SA_FLAGS;

            assert!(matches!(
                install(&[libc::SIGUSR2, libc::SIGKILL], &sa),
                Err(Error::Io(_))
            ));
            assert_eq!(disposition(libc::SIGUSR2).sa_sigaction, libc::SIG_IGN);

            // And the happy path hands back what was replaced
            let old = install(&[libc::SIGUSR2], &sa).unwrap();
            assert_eq!(old[0].sa_sigaction, libc::SIG_IGN);
            assert_eq!(
                disposition(libc::SIGUSR2).sa_sigaction,
                signal_handler as *const () as usize
            );

            install_default_handler(libc::SIGUSR2);
            assert_eq!(disposition(libc::SIGUSR2).sa_sigaction, libc::SIG_DFL);
        }
    }

    #[test]
    fn user_signals() {
        // SAFETY: POD
        let mut info: libc::siginfo_t = unsafe { mem::zeroed() };

        // SI_USER
        info.si_code = 0;
        assert!(is_user_signal(&info));

        // SEGV_MAPERR
        info.si_code = 1;
        assert!(!is_user_signal(&info));
    }
}
