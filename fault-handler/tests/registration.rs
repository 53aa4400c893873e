mod shared;

use fault_handler::{BAD_ACCESS, Error, FaultAction};
use std::ptr;

/// Exercises the registration API against the real platform backend, all in
/// one test as the registered action is process wide
#[test]
fn registration() {
    // Nothing registered to start with
    let mut old = shared::skipping_action();
    fault_handler::fault(BAD_ACCESS, None, Some(&mut old)).unwrap();
    assert_eq!(old, FaultAction::NONE);

    // Setting no handler when there is none is a no-op
    fault_handler::fault(BAD_ACCESS, Some(&FaultAction::NONE), Some(&mut old)).unwrap();
    assert_eq!(old, FaultAction::NONE);

    let action = FaultAction::new(shared::record_and_skip, 0x20 as *mut _);
    fault_handler::fault(BAD_ACCESS, Some(&action), None).unwrap();
    assert_eq!(fault_handler::current_action(), action);

    // Unknown kinds are rejected without touching anything
    for kind in [1, 2, -1] {
        let mut untouched = FaultAction::NONE;
        assert!(matches!(
            fault_handler::fault(kind, Some(&FaultAction::NONE), Some(&mut untouched)),
            Err(Error::InvalidArgument)
        ));
        assert_eq!(untouched, FaultAction::NONE);
        assert_eq!(fault_handler::current_action(), action);
    }

    // Replacing one handler with another
    let other = FaultAction::new(shared::decline, ptr::null_mut());
    fault_handler::fault(BAD_ACCESS, Some(&other), Some(&mut old)).unwrap();
    assert_eq!(old, action);

    // And finally going back to nothing
    fault_handler::fault(BAD_ACCESS, Some(&FaultAction::NONE), Some(&mut old)).unwrap();
    assert_eq!(old, other);
    assert_eq!(fault_handler::current_action(), FaultAction::NONE);

    // A second round trip hooks again
    fault_handler::set_action(shared::skipping_action()).unwrap();
    shared::RECORDED.reset();
    // SAFETY: we expect this to fault
    unsafe { fault_generator::load(0x30) };
    assert_eq!(shared::RECORDED.addr(), 0x30);
    assert_eq!(fault_handler::set_action(FaultAction::NONE).unwrap(), shared::skipping_action());
}
