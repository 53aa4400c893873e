//! Fault delivery via the task's `EXC_BAD_ACCESS` exception port.
//!
//! Unlike signals, Mach exceptions are delivered as messages to a port, and
//! are received on a different thread than the one that faulted. Since the
//! handler has to run on the faulting thread, the receive thread doesn't call
//! it directly, but instead redirects the faulting thread into
//! [`trampoline`], which calls the handler, then deliberately faults again at
//! a known address so that the receive thread can restore the original (or
//! handler modified) thread state.

mod ffi;
mod state;
mod trampoline;

pub(crate) use state::{hook, unhook};
