use core::cell::UnsafeCell;

use crate::proc::{self, Channel, Pid};
use crate::spinlock::SpinLock;

/// Lock state, guarded by a spinlock.
#[derive(Debug)]
pub struct SleepLockInner {
    locked: bool,
    pid: Option<Pid>,
}

/// Long-term lock that sleeps while waiting instead of spinning.
///
/// Unlike a spinlock, interrupts remain enabled while a sleep lock is held,
/// so it may be held across disk I/O. Only process context may take one;
/// interrupt handlers must not.
#[derive(Debug)]
pub struct SleepLock<T> {
    _name: &'static str,
    /// protects only the lock state, never the data
    inner: SpinLock<SleepLockInner>,
    data: UnsafeCell<T>,
}

/// Releases the sleep lock on drop and wakes any waiters.
#[derive(Debug)]
pub struct SleepLockGuard<'a, T: 'a> {
    lock: &'a SleepLock<T>,
}

impl<T> SleepLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        SleepLock {
            _name: name,
            inner: SpinLock::new(
                SleepLockInner {
                    locked: false,
                    pid: None,
                },
                name,
            ),
            data: UnsafeCell::new(value),
        }
    }

    /// Returns true if the current process is holding the lock.
    pub fn holding(&self) -> bool {
        let inner = self.inner.lock();
        inner.locked && inner.pid == Some(proc::current_proc().inner.lock().pid)
    }

    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut inner = self.inner.lock();

        while inner.locked {
            inner = proc::sleep(Channel::Lock(self as *const _ as usize), inner);
        }

        inner.locked = true;
        inner.pid = Some(proc::current_proc().inner.lock().pid);

        SleepLockGuard { lock: self }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Returns a mutable reference to the inner data without locking.
    ///
    /// # Safety
    /// The caller must ensure no other thread can reach the data.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<'a, T: 'a> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        let mut inner = self.lock.inner.lock();
        inner.locked = false;
        inner.pid = None;

        // wake up waiters before the spinlock guard drops
        proc::wakeup(Channel::Lock(self.lock as *const _ as usize));
    }
}

impl<T> core::ops::Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> core::ops::DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.lock.data.get() }
    }
}

/// # Safety
/// The lock hands out `&mut T` to whichever process acquires it, so `T` must
/// be `Send` for the lock to be shared or sent between threads.
unsafe impl<T> Sync for SleepLock<T> where T: Send {}

/// # Safety
/// See above.
unsafe impl<T> Send for SleepLock<T> where T: Send {}
