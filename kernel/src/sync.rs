use core::cell::UnsafeCell;
use core::mem::MaybeUninit;

use crate::spinlock::SpinLock;

/// A synchronization primitive which can be written to only once.
///
/// Used for state that is set up once during boot (kernel page table, init
/// process handle, per-device superblocks) and only read afterwards.
#[derive(Debug)]
pub struct OnceLock<T> {
    init: SpinLock<bool>,
    value: UnsafeCell<MaybeUninit<T>>,
}

impl<T> OnceLock<T> {
    pub const fn new() -> Self {
        Self {
            init: SpinLock::new(false, "oncelock"),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    fn is_init(&self) -> bool {
        *self.init.lock()
    }

    /// Runs `f` and stores its value, unless another thread got here first,
    /// in which case `f` is not run.
    pub fn initialize<F, E>(&self, f: F)
    where
        F: FnOnce() -> Result<T, E>,
    {
        let mut init = self.init.lock();

        if !*init {
            match f() {
                Ok(value) => {
                    unsafe { (*self.value.get()).write(value) };
                    *init = true;
                }
                Err(_) => panic!("oncelock init failed"),
            }
        }
    }

    pub fn get(&self) -> Option<&T> {
        if self.is_init() {
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        if self.is_init() {
            Some(unsafe { (*self.value.get()).assume_init_mut() })
        } else {
            None
        }
    }
}

impl<T> Drop for OnceLock<T> {
    fn drop(&mut self) {
        if self.is_init() {
            unsafe { self.value.get_mut().assume_init_drop() }
        }
    }
}

impl<T> Default for OnceLock<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// # Safety
/// `&T` can be handed to multiple threads, and initialization sends a T in,
/// so both bounds are needed.
unsafe impl<T: Sync + Send> Sync for OnceLock<T> {}

/// # Safety
/// Sending the lock transfers ownership of the inner data.
unsafe impl<T: Send> Send for OnceLock<T> {}
