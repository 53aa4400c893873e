use crate::{FaultEvent, FaultInfo, FaultKind};
use std::cell::Cell;

/// The last fault seen on a thread, and how many times in a row it was seen
struct LastFault {
    pc: Cell<usize>,
    addr: Cell<usize>,
    count: Cell<u32>,
}

impl LastFault {
    const fn new() -> Self {
        Self {
            pc: Cell::new(0),
            addr: Cell::new(0),
            count: Cell::new(0),
        }
    }

    /// Records a fault, returning the number of consecutive times this exact
    /// fault has now been seen
    #[inline]
    fn record(&self, pc: usize, addr: usize) -> u32 {
        if self.count.get() != 0 && self.pc.get() == pc && self.addr.get() == addr {
            let count = self.count.get().saturating_add(1);
            self.count.set(count);
            count
        } else {
            self.pc.set(pc);
            self.addr.set(addr);
            self.count.set(1);
            1
        }
    }

    #[inline]
    fn reset(&self) {
        self.count.set(0);
    }
}

thread_local! {
    // const initialized without a destructor, so accessing it from a signal
    // handler is just a load relative to the thread pointer
    static LAST_FAULT: LastFault = const { LastFault::new() };
}

/// A [`FaultEvent`] that gives up after the same fault has been reported
/// repeatedly.
///
/// Returning `true` from a handler without actually resolving the cause of a
/// fault makes the thread execute the faulting instruction again, forever.
/// This wrapper forwards to the inner event for at most `limit` consecutive
/// faults with the same faulting instruction and address on a thread, after
/// which it reports the fault as not handled so that the process terminates.
///
/// There is no way to tell a fault that was never resolved apart from one that
/// was resolved and then happened again at the same instruction and address,
/// eg. a store to a page that a collector protected again in the meantime.
/// Both count as retries, so an inner event that genuinely resolves faults
/// which can recur must call [`RetryLimit::reset`] once it has done so. The
/// history is kept per thread and is shared by every `RetryLimit`.
///
/// ```no_run
/// use fault_handler::{FaultAction, FaultEvent, FaultInfo, FaultKind, RetryLimit};
///
/// struct Unprotect;
///
/// unsafe impl FaultEvent for Unprotect {
///     fn on_fault(&self, _kind: FaultKind, info: &FaultInfo) -> bool {
///         let page = info.addr & !4095;
///         unsafe { libc::mprotect(page as *mut _, 4096, libc::PROT_READ | libc::PROT_WRITE) == 0 }
///     }
/// }
///
/// static EVENT: RetryLimit<Unprotect> = RetryLimit::new(Unprotect, 3);
/// fault_handler::set_action(FaultAction::from_event(&EVENT)).unwrap();
/// ```
pub struct RetryLimit<E> {
    inner: E,
    limit: u32,
}

impl<E> RetryLimit<E> {
    pub const fn new(inner: E, limit: u32) -> Self {
        Self { inner, limit }
    }

    /// Forgets the last fault seen on the calling thread, for handlers that
    /// expect to see the same fault again after having resolved it
    #[inline]
    pub fn reset() {
        LAST_FAULT.with(|lf| lf.reset());
    }
}

// SAFETY: we only touch a const thread local, the inner event upholds the rest
unsafe impl<E: FaultEvent> FaultEvent for RetryLimit<E> {
    fn on_fault(&self, kind: FaultKind, info: &FaultInfo) -> bool {
        let seen = LAST_FAULT.with(|lf| lf.record(info.pc, info.addr));

        if seen > self.limit {
            debug_print!("retry limit reached, fault will not be handled");
            return false;
        }

        self.inner.on_fault(kind, info)
    }
}
