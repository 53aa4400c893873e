//! Bindings that [`mach2`] doesn't provide, lifted from the headers in
//! `usr/include/mach`, each one notes the specific header it can be located in

pub use mach2::{
    exception_types as et,
    kern_return::{KERN_FAILURE, KERN_SUCCESS, kern_return_t},
    mach_port as mp, mach_types as mt, message as msg,
    port::{self, MACH_PORT_NULL, mach_port_t},
    thread_act::{thread_get_state, thread_set_state},
    thread_status as ts,
    traps::mach_task_self,
    vm::{mach_vm_read_overwrite, mach_vm_write},
};

/// Number of top level exception types
///
/// This is platform independent, but located the `<arch>/exception.h`
pub const EXC_TYPES_COUNT: usize = 14;

/// The id of a `mach_exception_raise` request, the message sent for
/// `EXCEPTION_DEFAULT | MACH_EXCEPTION_CODES`
///
/// `mach_exc.defs`
pub const MACH_EXCEPTION_RAISE: i32 = 2405;

/// Returned by a MIG server for a message id it doesn't implement
///
/// `mig_errors.h`
pub const MIG_BAD_ID: kern_return_t = -303;

/// Network Data Representation Record
///
/// ndr.h
#[repr(C)]
#[derive(Copy, Clone)]
pub struct NDR_record_t {
    pub mig_vers: u8,
    pub if_vers: u8,
    pub reserved1: u8,
    pub mig_encoding: u8,
    pub int_rep: u8,
    pub char_rep: u8,
    pub float_rep: u8,
    pub reserved2: u8,
}

/// `__Request__mach_exception_raise_t` from the MIG generated `mach_exc`
/// server. MIG packs its messages to 4 bytes, so `code` is not 8 byte aligned.
///
/// The padding leaves room for the trailer the kernel appends.
#[repr(C, packed(4))]
pub struct ExceptionMessage {
    pub header: msg::mach_msg_header_t,
    pub body: msg::mach_msg_body_t,
    pub thread: msg::mach_msg_port_descriptor_t,
    pub task: msg::mach_msg_port_descriptor_t,
    pub ndr: NDR_record_t,
    pub exception: et::exception_type_t,
    pub code_count: msg::mach_msg_type_number_t,
    pub code: [i64; 2],
    pub padding: [u8; 512],
}

/// Whenever MIG detects an error, it sends back a generic `mig_reply_error_t`
/// format message, which is also the exact layout of the
/// `mach_exception_raise` reply.
///
/// `mig_errors.h`
#[repr(C)]
pub struct ExceptionRaiseReply {
    pub header: msg::mach_msg_header_t,
    pub ndr: NDR_record_t,
    pub ret_code: kern_return_t,
}

unsafe extern "C" {
    /// Replaces the task's exception port for every exception in
    /// `exception_mask`, writing out the registrations it replaced as 4
    /// parallel arrays of `masks_count` length so they can be restored
    ///
    /// task.h
    pub fn task_swap_exception_ports(
        task: mt::task_t,
        exception_mask: et::exception_mask_t,
        new_port: mach_port_t,
        behavior: et::exception_behavior_t,
        new_flavor: ts::thread_state_flavor_t,
        masks: *mut et::exception_mask_t,
        masks_count: *mut u32,
        old_handlers: *mut mach_port_t,
        old_behaviors: *mut et::exception_behavior_t,
        old_flavors: *mut ts::thread_state_flavor_t,
    ) -> kern_return_t;

    /// Registers `new_port` for every exception in `exception_mask`
    ///
    /// task.h
    pub fn task_set_exception_ports(
        task: mt::task_t,
        exception_mask: et::exception_mask_t,
        new_port: mach_port_t,
        behavior: et::exception_behavior_t,
        new_flavor: ts::thread_state_flavor_t,
    ) -> kern_return_t;

    /// The NDR record for the host, copied into every reply
    ///
    /// <arch>/ndr_def.h
    pub static NDR_record: NDR_record_t;
}
