use super::{ffi::*, trampoline};
use crate::Error;
use fault_context::{
    CALL_PUSHES_RETURN_ADDRESS, CallContext, EXCEPTION_STATE_COUNT, EXCEPTION_STATE_FLAVOR,
    ExceptionState, FLOAT_STATE_COUNT, FLOAT_STATE_FLAVOR, FloatState, MachineContext, RED_ZONE,
    STACK_ALIGN, THREAD_STATE_COUNT, THREAD_STATE_FLAVOR, THREAD_STATE_NONE, ThreadState,
};
use std::{mem, ptr};

#[inline]
fn kern_ret(func: impl FnOnce() -> kern_return_t) -> Result<(), Error> {
    let res = func();

    if res == KERN_SUCCESS {
        Ok(())
    } else {
        Err(Error::from_kern(res))
    }
}

/// An exception port registration we replaced
#[derive(Copy, Clone, Default)]
struct PreviousPort {
    /// The exceptions the port is registered for
    mask: et::exception_mask_t,
    /// The port that is sent messages when the exception occurs
    port: mach_port_t,
    /// The way in which the exception is raised
    behavior: et::exception_behavior_t,
    /// The CPU context included with the exception
    flavor: ts::thread_state_flavor_t,
}

struct PreviousPorts {
    count: usize,
    ports: [PreviousPort; EXC_TYPES_COUNT],
}

/// A receive right that is destroyed unless it is [`Self::into_raw`]ed
struct AllocatedPort {
    port: mach_port_t,
}

impl AllocatedPort {
    #[inline]
    fn into_raw(self) -> mach_port_t {
        let port = self.port;
        mem::forget(self);
        port
    }
}

impl Drop for AllocatedPort {
    fn drop(&mut self) {
        // SAFETY: syscall
        unsafe {
            mp::mach_port_destroy(mach_task_self(), self.port);
        }
    }
}

/// The port serviced by the receive thread. Both are created on the first
/// hook and live for the rest of the process, unhooking only stops the
/// kernel from sending exceptions to the port.
static EXCEPTION_PORT: parking_lot::Mutex<Option<mach_port_t>> = parking_lot::const_mutex(None);

/// The registrations to restore on unhook, present only while we are hooked
static PREVIOUS: parking_lot::Mutex<Option<PreviousPorts>> = parking_lot::const_mutex(None);

/// Retrieves the exception port, creating it and the thread that receives
/// on it if this is the first call
fn exception_port() -> Result<mach_port_t, Error> {
    let mut lock = EXCEPTION_PORT.lock();

    if let Some(port) = *lock {
        return Ok(port);
    }

    // SAFETY: syscalls
    unsafe {
        let current_task = mach_task_self();

        let mut handler_port = MACH_PORT_NULL;

        // Create a receive right so that we can actually receive exception messages on the port
        kern_ret(|| {
            mp::mach_port_allocate(
                current_task,
                port::MACH_PORT_RIGHT_RECEIVE,
                &mut handler_port,
            )
        })?;

        let handler_port = AllocatedPort { port: handler_port };

        // Add send right, needed to register it as an exception port
        kern_ret(|| {
            mp::mach_port_insert_right(
                current_task,
                handler_port.port,
                handler_port.port,
                msg::MACH_MSG_TYPE_MAKE_SEND,
            )
        })?;

        let port = handler_port.port;

        std::thread::Builder::new()
            .name("fault-handler".to_owned())
            .spawn(move || {
                // SAFETY: we own the receive right
                unsafe { exception_handler(port) }
            })?;

        log::debug!("created exception port {port}");

        *lock = Some(handler_port.into_raw());
        Ok(port)
    }
}

/// Registers our port as the task's `EXC_BAD_ACCESS` exception port
///
/// # Safety
///
/// Must not be called concurrently with [`unhook`]
pub(crate) unsafe fn hook() -> Result<(), Error> {
    let handler_port = exception_port()?;

    let mut lock = PREVIOUS.lock();

    if lock.is_some() {
        return Ok(());
    }

    let mut count = EXC_TYPES_COUNT as u32;
    let mut masks = [0; EXC_TYPES_COUNT];
    let mut ports = [0; EXC_TYPES_COUNT];
    let mut behaviors = [0; EXC_TYPES_COUNT];
    let mut flavors = [0; EXC_TYPES_COUNT];

    // Send a `mach_exception_raise` message with 64-bit codes, we don't need
    // any state sent along as we query what we need ourselves
    let behavior = et::EXCEPTION_DEFAULT | et::MACH_EXCEPTION_CODES;

    // SAFETY: syscall
    kern_ret(|| unsafe {
        task_swap_exception_ports(
            mach_task_self(),
            et::EXC_MASK_BAD_ACCESS,
            handler_port,
            behavior as _,
            THREAD_STATE_NONE,
            masks.as_mut_ptr(),
            &mut count,
            ports.as_mut_ptr(),
            behaviors.as_mut_ptr(),
            flavors.as_mut_ptr(),
        )
    })?;

    let mut previous = PreviousPorts {
        count: (count as usize).min(EXC_TYPES_COUNT),
        ports: [PreviousPort::default(); EXC_TYPES_COUNT],
    };

    for (i, pp) in previous.ports[..previous.count].iter_mut().enumerate() {
        *pp = PreviousPort {
            mask: masks[i],
            port: ports[i],
            behavior: behaviors[i],
            flavor: flavors[i],
        };
    }

    *lock = Some(previous);
    Ok(())
}

/// Restores the exception ports that were replaced by [`hook`]. The receive
/// thread is left running.
///
/// # Safety
///
/// Must not be called concurrently with [`hook`]
pub(crate) unsafe fn unhook() -> Result<(), Error> {
    let mut lock = PREVIOUS.lock();

    let Some(previous) = &*lock else {
        return Ok(());
    };

    // SAFETY: syscalls
    unsafe {
        let current_task = mach_task_self();

        if previous.count == 0 {
            kern_ret(|| {
                task_set_exception_ports(
                    current_task,
                    et::EXC_MASK_BAD_ACCESS,
                    MACH_PORT_NULL,
                    et::EXCEPTION_DEFAULT as _,
                    THREAD_STATE_NONE,
                )
            })?;
        }

        for pp in &previous.ports[..previous.count] {
            kern_ret(|| {
                task_set_exception_ports(current_task, pp.mask, pp.port, pp.behavior, pp.flavor)
            })?;
        }
    }

    *lock = None;
    Ok(())
}

/// Message loop thread. Waits for exception messages to the port and replies
/// to each one once it has been dealt with.
unsafe fn exception_handler(port: mach_port_t) {
    unsafe {
        let mut request: ExceptionMessage = mem::zeroed();

        loop {
            request.header.msgh_local_port = port;
            request.header.msgh_size = mem::size_of_val(&request) as u32;

            let kret = msg::mach_msg(
                (&raw mut request).cast(),
                msg::MACH_RCV_MSG,
                0,
                mem::size_of_val(&request) as u32,
                port,
                msg::MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            );

            // Without MACH_RCV_LARGE an oversized message is dropped by the
            // kernel, so we can just wait for the next one
            if kret != KERN_SUCCESS {
                debug_print!("failed to receive exception message");
                continue;
            }

            let mut reply: ExceptionRaiseReply = mem::zeroed();
            demux(&request, &mut reply);

            msg::mach_msg(
                (&raw mut reply).cast(),
                msg::MACH_SEND_MSG,
                reply.header.msgh_size,
                0,
                MACH_PORT_NULL,
                msg::MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            );
        }
    }
}

/// Handles a request and fills out the reply for it, returning false if the
/// request is not one we understand.
///
/// The reply is what `mig -v /usr/include/mach/mach_exc.defs` would generate
/// in its `mach_exc_server`.
unsafe fn demux(request: &ExceptionMessage, reply: &mut ExceptionRaiseReply) -> bool {
    let header = request.header;

    reply.header.msgh_bits =
        msg::MACH_MSGH_BITS(header.msgh_bits & msg::MACH_MSGH_BITS_REMOTE_MASK, 0);
    reply.header.msgh_size = mem::size_of::<ExceptionRaiseReply>() as u32;
    reply.header.msgh_remote_port = header.msgh_remote_port;
    reply.header.msgh_local_port = MACH_PORT_NULL;
    reply.header.msgh_id = header.msgh_id + 100;
    // SAFETY: immutable static
    reply.ndr = unsafe { NDR_record };

    if header.msgh_id != MACH_EXCEPTION_RAISE {
        debug_print!("received unknown message");
        reply.ret_code = MIG_BAD_ID;
        return false;
    }

    let thread = request.thread.name;
    let task = request.task.name;

    // SAFETY: syscalls
    unsafe {
        let current_task = mach_task_self();

        // A forked child inherits our exception ports but not the receive
        // thread, so we get its exceptions, which we have nothing to do with
        reply.ret_code = if task == current_task {
            handle_access(thread)
        } else {
            debug_print!("received exception from another task");
            KERN_FAILURE
        };

        // The message carried send rights for both, which are now ours
        mp::mach_port_deallocate(current_task, thread);
        mp::mach_port_deallocate(current_task, task);
    }

    true
}

/// Services an `EXC_BAD_ACCESS` raised by `thread`, which is either a new
/// fault, or the thread coming back from the [`trampoline`] we sent it to.
///
/// The return is the reply code, success resumes the thread with whatever
/// state we set, failure makes the kernel continue down the exception chain,
/// ending with the default action of terminating the process.
unsafe fn handle_access(thread: mach_port_t) -> kern_return_t {
    let mut state = ThreadState::default();
    let mut count = THREAD_STATE_COUNT;

    // SAFETY: syscall
    let kr = unsafe {
        thread_get_state(
            thread,
            THREAD_STATE_FLAVOR,
            (&raw mut state).cast(),
            &mut count,
        )
    };
    if kr != KERN_SUCCESS {
        return kr;
    }

    let mut float = FloatState::default();

    let ret = if state.pc() == trampoline::landing_pad() {
        let ret = match return_from_trampoline(&mut state, &mut float) {
            Ok(true) => KERN_SUCCESS,
            Ok(false) => {
                debug_print!("fault was not handled");
                KERN_FAILURE
            }
            Err(kr) => return kr,
        };

        // The handler ran on this thread, so its vector registers are
        // whatever the handler left in them
        // SAFETY: syscall
        let kr = unsafe {
            thread_set_state(
                thread,
                FLOAT_STATE_FLAVOR,
                (&raw mut float).cast(),
                FLOAT_STATE_COUNT,
            )
        };
        if kr != KERN_SUCCESS {
            return kr;
        }

        ret
    } else {
        if !crate::current_action().is_active() {
            return KERN_FAILURE;
        }

        let mut exception = ExceptionState::default();
        let mut count = EXCEPTION_STATE_COUNT;

        // SAFETY: syscall
        let kr = unsafe {
            thread_get_state(
                thread,
                EXCEPTION_STATE_FLAVOR,
                (&raw mut exception).cast(),
                &mut count,
            )
        };
        if kr != KERN_SUCCESS {
            return kr;
        }

        let mut count = FLOAT_STATE_COUNT;

        // SAFETY: syscall
        let kr = unsafe {
            thread_get_state(
                thread,
                FLOAT_STATE_FLAVOR,
                (&raw mut float).cast(),
                &mut count,
            )
        };
        if kr != KERN_SUCCESS {
            return kr;
        }

        if let Err(kr) = enter_trampoline(&mut state, &float, &exception) {
            return kr;
        }

        KERN_SUCCESS
    };

    // SAFETY: syscall
    let kr = unsafe {
        thread_set_state(
            thread,
            THREAD_STATE_FLAVOR,
            (&raw mut state).cast(),
            THREAD_STATE_COUNT,
        )
    };
    if kr != KERN_SUCCESS {
        return kr;
    }

    ret
}

/// Writes `value` at `addr` in our task.
///
/// The write goes through the kernel so that memory that can't be written
/// to, eg. a thread's stack after it has overflowed, results in an error
/// instead of a fault on the receive thread.
fn write<T: Copy>(addr: usize, value: &T) -> Result<(), kern_return_t> {
    // SAFETY: syscall
    let kr = unsafe {
        mach_vm_write(
            mach_task_self(),
            addr as u64,
            ptr::from_ref(value) as usize,
            mem::size_of::<T>() as u32,
        )
    };

    if kr == KERN_SUCCESS { Ok(()) } else { Err(kr) }
}

/// Copies `value` onto a stack, returning the new, aligned, stack pointer
fn push<T: Copy>(sp: usize, value: &T) -> Result<usize, kern_return_t> {
    let sp = sp
        .checked_sub(mem::size_of::<T>())
        .ok_or(mach2::kern_return::KERN_INVALID_ADDRESS)?
        & !(STACK_ALIGN - 1);

    write(sp, value)?;
    Ok(sp)
}

/// Everything needed to resume a thread where it faulted, staged on its own
/// stack while it runs the [`trampoline`]
#[derive(Copy, Clone, Default)]
#[repr(C)]
struct Continuation {
    /// Must be first, the handler's context points here
    state: ThreadState,
    float: FloatState,
}

/// Rewrites `state` so that the thread calls [`trampoline`] with copies of
/// its thread and exception state when it resumes
fn enter_trampoline(
    state: &mut ThreadState,
    float: &FloatState,
    exception: &ExceptionState,
) -> Result<(), kern_return_t> {
    let continuation = Continuation {
        state: *state,
        float: *float,
    };

    // The thread may be using the area below its stack pointer
    let mut sp = state
        .sp()
        .checked_sub(RED_ZONE)
        .ok_or(mach2::kern_return::KERN_INVALID_ADDRESS)?;

    sp = push(sp, &continuation)?;
    let saved_state = sp;
    sp = push(sp, exception)?;
    let saved_exception = sp;

    if CALL_PUSHES_RETURN_ADDRESS {
        // The trampoline never returns, but it expects the stack to look like
        // it was called
        sp -= mem::size_of::<usize>();
        write(sp, &0usize)?;
    }

    state.set_arg(trampoline::STATE_ARG, saved_state);
    state.set_arg(trampoline::EXCEPTION_ARG, saved_exception);
    state.set_lr(0);
    state.set_sp(sp);
    state.set_pc(trampoline::entry());

    Ok(())
}

/// Restores the state saved by [`enter_trampoline`], returning whether the
/// handler dealt with the fault
fn return_from_trampoline(
    state: &mut ThreadState,
    float: &mut FloatState,
) -> Result<bool, kern_return_t> {
    let handled = state.arg(trampoline::OUTCOME_ARG) != 0;
    let saved = state.arg(trampoline::CONTINUATION_ARG);

    let mut restored = Continuation::default();
    let mut read = 0;

    // SAFETY: syscall, the kernel validates the source range
    let kr = unsafe {
        mach_vm_read_overwrite(
            mach_task_self(),
            saved as u64,
            mem::size_of::<Continuation>() as u64,
            (&raw mut restored) as u64,
            &mut read,
        )
    };

    if kr != KERN_SUCCESS {
        return Err(kr);
    }

    *state = restored.state;
    *float = restored.float;
    Ok(handled)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rejects_unknown_messages() {
        // SAFETY: POD
        let mut request: ExceptionMessage = unsafe { mem::zeroed() };
        request.header.msgh_id = 1234;
        request.header.msgh_remote_port = 77;

        // SAFETY: POD
        let mut reply: ExceptionRaiseReply = unsafe { mem::zeroed() };
        // SAFETY: no ports are touched for an unknown message
        assert!(!unsafe { demux(&request, &mut reply) });

        assert_eq!(reply.ret_code, MIG_BAD_ID);
        assert_eq!(reply.header.msgh_id, 1334);
        assert_eq!(reply.header.msgh_remote_port, 77);
        assert_eq!(
            reply.header.msgh_size as usize,
            mem::size_of::<ExceptionRaiseReply>()
        );
    }

    #[test]
    fn rejects_foreign_tasks() {
        // SAFETY: POD
        let mut request: ExceptionMessage = unsafe { mem::zeroed() };
        request.header.msgh_id = MACH_EXCEPTION_RAISE;

        // SAFETY: POD
        let mut reply: ExceptionRaiseReply = unsafe { mem::zeroed() };
        // SAFETY: the null task is never ours, and deallocating null is a no-op
        assert!(unsafe { demux(&request, &mut reply) });

        assert_eq!(reply.ret_code, KERN_FAILURE);
        assert_eq!(reply.header.msgh_id, MACH_EXCEPTION_RAISE + 100);
    }

    #[test]
    fn message_layout() {
        // header + body + 2 port descriptors + ndr + exception + code count,
        // with the codes immediately after
        assert_eq!(mem::offset_of!(ExceptionMessage, code), 68);
        assert_eq!(mem::size_of::<ExceptionRaiseReply>(), 36);
    }

    #[test]
    fn trampoline_entry() {
        let mut stack = vec![0u8; 4096];
        let top = (stack.as_mut_ptr() as usize + stack.len()) & !(STACK_ALIGN - 1);

        let mut state = ThreadState::default();
        state.set_pc(0x1000);
        state.set_sp(top);
        let exception = ExceptionState::default();
        let mut float = FloatState::default();
        // SAFETY: in bounds, any bit pattern is valid
        unsafe { (&raw mut float).cast::<u32>().write(0xf10a7) };

        enter_trampoline(&mut state, &float, &exception).unwrap();

        assert_eq!(state.pc(), trampoline::entry());
        let saved_state = state.arg(trampoline::STATE_ARG);
        let saved_exception = state.arg(trampoline::EXCEPTION_ARG);

        // Everything lives below the red zone
        assert!(saved_state + mem::size_of::<Continuation>() <= top - RED_ZONE);
        assert!(saved_exception + mem::size_of::<ExceptionState>() <= saved_state);
        assert!(state.sp() < saved_exception);
        assert_eq!(saved_state % STACK_ALIGN, 0);

        if CALL_PUSHES_RETURN_ADDRESS {
            assert_eq!(state.sp() % STACK_ALIGN, STACK_ALIGN - mem::size_of::<usize>());
        } else {
            assert_eq!(state.sp() % STACK_ALIGN, 0);
            assert_eq!(state.lr(), Some(0));
        }

        // SAFETY: enter_trampoline wrote it there
        let copy = unsafe { &*(saved_state as *const ThreadState) };
        assert_eq!(copy.pc(), 0x1000);
        assert_eq!(copy.sp(), top);

        // Now come back as the landing pad would
        let mut back = ThreadState::default();
        back.set_pc(trampoline::landing_pad());
        back.set_arg(trampoline::OUTCOME_ARG, 1);
        back.set_arg(trampoline::CONTINUATION_ARG, saved_state);

        let mut back_float = FloatState::default();
        assert!(return_from_trampoline(&mut back, &mut back_float).unwrap());
        assert_eq!(back.pc(), 0x1000);
        assert_eq!(back.sp(), top);
        // SAFETY: in bounds
        assert_eq!(unsafe { (&raw const back_float).cast::<u32>().read() }, 0xf10a7);
    }
}
