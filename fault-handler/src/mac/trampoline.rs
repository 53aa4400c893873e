use crate::{FaultInfo, FaultKind};
use fault_context::{ArgReg, ExceptionContext, ExceptionState, MachineContext, ThreadState};

/// The register the saved thread state is passed to [`trampoline`] in
pub(super) const STATE_ARG: ArgReg = ArgReg::First;
/// The register the saved exception state is passed to [`trampoline`] in
pub(super) const EXCEPTION_ARG: ArgReg = ArgReg::Second;
/// The register holding the handler's verdict when the thread faults at the
/// landing pad
pub(super) const OUTCOME_ARG: ArgReg = ArgReg::First;
/// The register holding the address of the saved thread state when the
/// thread faults at the landing pad
pub(super) const CONTINUATION_ARG: ArgReg = ArgReg::Second;

// `fault_handler_trampoline_return(outcome, continuation)` leaves both of its
// arguments in place and loads through a null pointer at the exported landing
// pad, the only fault that the receive thread treats as the way back from the
// trampoline rather than as a new fault. The trap after it can't be reached.
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        std::arch::global_asm! {
            ".text",
            ".globl _fault_handler_trampoline_return",
            ".p2align 4",
            "_fault_handler_trampoline_return:",
            "xor eax, eax",
            ".globl _fault_handler_landing_pad",
            "_fault_handler_landing_pad:",
            "mov r9, qword ptr [rax]",
            "ud2",
        }
    } else if #[cfg(target_arch = "aarch64")] {
        std::arch::global_asm! {
            ".text",
            ".globl _fault_handler_trampoline_return",
            ".p2align 2",
            "_fault_handler_trampoline_return:",
            "mov x9, xzr",
            ".globl _fault_handler_landing_pad",
            "_fault_handler_landing_pad:",
            "ldr x9, [x9]",
            "brk #0x1",
        }
    } else {
        compile_error!("fault-handler does not support this architecture on macos");
    }
}

unsafe extern "C" {
    fn fault_handler_trampoline_return(outcome: usize, continuation: *mut ThreadState) -> !;
    fn fault_handler_landing_pad();
}

/// The address of the instruction a thread returning from [`trampoline`]
/// faults at
#[inline]
pub(super) fn landing_pad() -> usize {
    fault_handler_landing_pad as *const () as usize
}

/// The address a faulting thread is redirected to
#[inline]
pub(super) fn entry() -> usize {
    trampoline as *const () as usize
}

/// Runs on the faulting thread, on its own stack, just below the copies of its
/// thread and exception state that the receive thread pushed there.
unsafe extern "C" fn trampoline(state: *mut ThreadState, exception: *const ExceptionState) -> ! {
    let action = crate::current_action();

    let handled = match action.handler {
        Some(handler) => {
            // SAFETY: both were written to our stack by the receive thread
            let (ts, es) = unsafe { (&*state, &*exception) };

            let info = FaultInfo {
                pc: ts.pc(),
                sp: ts.sp(),
                addr: es.fault_address(),
                ctx: state.cast(),
            };

            handler(FaultKind::BadAccess, &info, action.arg)
        }
        // The action was cleared between the fault and now
        None => false,
    };

    // SAFETY: the receive thread takes over from here, restoring the state we
    // were handed, including any changes the handler made to it
    unsafe { fault_handler_trampoline_return(usize::from(handled), state) }
}
