//! The process wide [`FaultAction`], and the transitions between "no handler"
//! and "handler" that hook and unhook the platform backend.

use crate::{Error, FaultAction, FaultKind};
use parking_lot::RwLock;

/// The platform specific half of registration
pub(crate) trait Backend {
    /// Starts routing faults to us
    fn hook(&self) -> Result<(), Error>;
    /// Stops routing faults to us, restoring whatever was there before
    fn unhook(&self) -> Result<(), Error>;
}

struct Platform;

impl Backend for Platform {
    #[inline]
    fn hook(&self) -> Result<(), Error> {
        // SAFETY: only called with the action write lock held
        unsafe { crate::platform::hook() }
    }

    #[inline]
    fn unhook(&self) -> Result<(), Error> {
        // SAFETY: only called with the action write lock held
        unsafe { crate::platform::unhook() }
    }
}

/// The currently registered action. The write lock is held for the duration
/// of a transition so that the backend is hooked/unhooked exactly once per
/// change, the fault paths only ever take the read lock long enough to copy
/// the action out.
static ACTION: RwLock<FaultAction> = parking_lot::const_rwlock(FaultAction::NONE);

/// Queries and/or changes the action taken for the specified fault kind.
///
/// If `old` is specified it receives the action that was registered before
/// this call. If `new` is specified it replaces the current action, going
/// from no handler to a handler installs our platform hook, going from a
/// handler to no handler removes it again.
///
/// # Errors
///
/// [`Error::InvalidArgument`] if `kind` is not a known [`FaultKind`], or the
/// platform error if the hook couldn't be installed or removed. In both cases
/// the registered action is unchanged.
pub fn fault(
    kind: i32,
    new: Option<&FaultAction>,
    old: Option<&mut FaultAction>,
) -> Result<(), Error> {
    transition(&ACTION, &Platform, kind, new, old)
}

/// Registers `action` for [`FaultKind::BadAccess`], returning the previously
/// registered action
pub fn set_action(action: FaultAction) -> Result<FaultAction, Error> {
    let mut old = FaultAction::NONE;
    fault(crate::BAD_ACCESS, Some(&action), Some(&mut old))?;
    Ok(old)
}

/// The currently registered action
#[inline]
pub fn current_action() -> FaultAction {
    *ACTION.read()
}

fn transition<B: Backend>(
    cell: &RwLock<FaultAction>,
    backend: &B,
    kind: i32,
    new: Option<&FaultAction>,
    old: Option<&mut FaultAction>,
) -> Result<(), Error> {
    FaultKind::try_from(kind)?;

    let mut current = cell.write();

    if let Some(old) = old {
        *old = *current;
    }

    let Some(new) = new else {
        return Ok(());
    };

    match (current.is_active(), new.is_active()) {
        (false, true) => {
            log::debug!("installing fault hook");
            backend.hook().inspect_err(|err| {
                log::warn!("failed to install fault hook: {err}");
            })?;
        }
        (true, false) => {
            log::debug!("removing fault hook");
            backend.unhook().inspect_err(|err| {
                log::warn!("failed to remove fault hook: {err}");
            })?;
        }
        _ => {}
    }

    *current = *new;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{FaultInfo, FaultKind};
    use std::{cell::Cell, ffi::c_void, ptr};

    #[derive(Default)]
    struct Mock {
        hooks: Cell<u32>,
        unhooks: Cell<u32>,
        fail: Cell<bool>,
    }

    impl Backend for Mock {
        fn hook(&self) -> Result<(), Error> {
            if self.fail.replace(false) {
                return Err(Error::OutOfResources);
            }
            self.hooks.set(self.hooks.get() + 1);
            Ok(())
        }

        fn unhook(&self) -> Result<(), Error> {
            if self.fail.replace(false) {
                return Err(Error::Unsupported(5));
            }
            self.unhooks.set(self.unhooks.get() + 1);
            Ok(())
        }
    }

    fn declined(_kind: FaultKind, _info: &FaultInfo, _arg: *mut c_void) -> bool {
        false
    }

    fn handled(_kind: FaultKind, _info: &FaultInfo, _arg: *mut c_void) -> bool {
        true
    }

    fn cell() -> RwLock<FaultAction> {
        RwLock::new(FaultAction::NONE)
    }

    const BA: i32 = crate::BAD_ACCESS;

    #[test]
    fn no_change_is_a_noop() {
        let cell = cell();
        let mock = Mock::default();

        let mut old = FaultAction::new(handled, ptr::null_mut());
        transition(&cell, &mock, BA, Some(&FaultAction::NONE), Some(&mut old)).unwrap();
        assert_eq!(old, FaultAction::NONE);
        assert_eq!(*cell.read(), FaultAction::NONE);
        assert_eq!(mock.hooks.get(), 0);
        assert_eq!(mock.unhooks.get(), 0);

        // Query only
        transition(&cell, &mock, BA, None, None).unwrap();
        assert_eq!(mock.hooks.get(), 0);
    }

    #[test]
    fn round_trip() {
        let cell = cell();
        let mock = Mock::default();

        let action = FaultAction::new(declined, 0x10 as *mut c_void);
        transition(&cell, &mock, BA, Some(&action), None).unwrap();
        assert_eq!(mock.hooks.get(), 1);

        let mut old = FaultAction::NONE;
        transition(&cell, &mock, BA, None, Some(&mut old)).unwrap();
        assert_eq!(old, action);

        // Swapping one handler for another doesn't touch the backend
        let other = FaultAction::new(handled, ptr::null_mut());
        transition(&cell, &mock, BA, Some(&other), Some(&mut old)).unwrap();
        assert_eq!(old, action);
        assert_eq!(*cell.read(), other);
        assert_eq!(mock.hooks.get(), 1);
        assert_eq!(mock.unhooks.get(), 0);

        transition(&cell, &mock, BA, Some(&FaultAction::NONE), Some(&mut old)).unwrap();
        assert_eq!(old, other);
        assert_eq!(mock.unhooks.get(), 1);
        assert_eq!(*cell.read(), FaultAction::NONE);
    }

    #[test]
    fn rejects_invalid_kind() {
        let cell = cell();
        let mock = Mock::default();

        let action = FaultAction::new(handled, ptr::null_mut());
        transition(&cell, &mock, BA, Some(&action), None).unwrap();

        let mut old = FaultAction::NONE;
        for kind in [1, -1, i32::MAX] {
            assert!(matches!(
                transition(&cell, &mock, kind, Some(&FaultAction::NONE), Some(&mut old)),
                Err(Error::InvalidArgument)
            ));
        }

        // Nothing was written, even to old
        assert_eq!(old, FaultAction::NONE);
        assert_eq!(*cell.read(), action);
        assert_eq!(mock.unhooks.get(), 0);
    }

    #[test]
    fn failed_hook_leaves_state() {
        let cell = cell();
        let mock = Mock::default();
        mock.fail.set(true);

        let action = FaultAction::new(handled, ptr::null_mut());
        let mut old = FaultAction::new(declined, ptr::null_mut());
        assert!(matches!(
            transition(&cell, &mock, BA, Some(&action), Some(&mut old)),
            Err(Error::OutOfResources)
        ));
        // old still receives the previous action
        assert_eq!(old, FaultAction::NONE);
        assert_eq!(*cell.read(), FaultAction::NONE);
        assert_eq!(mock.hooks.get(), 0);

        // The next registration tries again
        transition(&cell, &mock, BA, Some(&action), None).unwrap();
        assert_eq!(mock.hooks.get(), 1);
        assert_eq!(*cell.read(), action);

        // Same for a failed unhook, the handler stays registered
        mock.fail.set(true);
        assert!(matches!(
            transition(&cell, &mock, BA, Some(&FaultAction::NONE), None),
            Err(Error::Unsupported(5))
        ));
        assert_eq!(*cell.read(), action);
        assert_eq!(mock.unhooks.get(), 0);
    }
}
