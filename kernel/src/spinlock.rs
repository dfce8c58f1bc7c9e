use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

use crate::proc::{Cpu, InterruptLock, current_cpu, lock_current_cpu};

/// Mutual exclusion spin lock.
///
/// Acquiring disables device interrupts on this hart (with nesting tracked by
/// the CPU) until the outermost guard is dropped. The owner is recorded as a
/// CPU, not a process, so a kernel-thread switch while holding the lock shows
/// up as a `holding` assertion failure.
#[derive(Debug)]
pub struct SpinLock<T> {
    name: &'static str,
    /// Locked when the CPU pointer is not null.
    cpu: AtomicPtr<Cpu>,
    data: UnsafeCell<T>,
}

/// A guard that releases the lock (and the interrupt-disable nesting level it
/// holds) when dropped.
#[derive(Debug)]
pub struct SpinLockGuard<'a, T: 'a> {
    lock: &'a SpinLock<T>,
    _intr_lock: InterruptLock,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            name,
            cpu: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(value),
        }
    }

    /// Check whether this CPU is holding the lock.
    ///
    /// # Safety
    /// Interrupts must be disabled.
    unsafe fn holding(&self) -> bool {
        self.cpu.load(Ordering::Relaxed) == unsafe { current_cpu() as *mut Cpu }
    }

    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let _intr_lock = lock_current_cpu();

        unsafe {
            assert!(!self.holding(), "acquire {}", self.name);

            loop {
                if self
                    .cpu
                    .compare_exchange(
                        ptr::null_mut(),
                        current_cpu(),
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
                {
                    break SpinLockGuard {
                        lock: self,
                        _intr_lock,
                    };
                }

                hint::spin_loop()
            }
        }
    }

    /// Releases the lock by consuming the guard and returns the lock itself,
    /// so `sleep` can re-acquire it after waking up.
    pub fn unlock(guard: SpinLockGuard<'_, T>) -> &SpinLock<T> {
        let lock = guard.lock;
        drop(guard);
        lock
    }

    /// Releases a lock that was acquired by a different kernel thread.
    ///
    /// The scheduler acquires a process's lock before switching into it; the
    /// first thing a newly forked process runs is this, standing in for the
    /// guard drop that happens on the scheduler's stack for everyone else.
    ///
    /// # Safety
    /// The lock must be held by this CPU and no guard for it may be live on
    /// this call stack.
    pub unsafe fn force_unlock(&self) {
        unsafe {
            assert!(self.holding(), "force_unlock {}", self.name);
            self.cpu.store(ptr::null_mut(), Ordering::Release);
            current_cpu().unlock();
        }
    }

    /// Since this call consumes self, no one else can be holding a reference.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Since this call mutably borrows self, no one else can be holding a
    /// reference.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Use this over `get_mut` when you need unsafe mutable access.
    ///
    /// # Safety
    /// The caller must ensure exclusive access to the data.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<'a, T: 'a> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        // # Safety: the guard holds an interrupt lock, so holding is reliable
        unsafe {
            assert!(self.lock.holding(), "release {}", self.lock.name);
        }

        self.lock.cpu.store(ptr::null_mut(), Ordering::Release);
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

/// # Safety
/// UnsafeCell is not Sync but it can only be consumed with a guard or an
/// exclusive reference. So SpinLock is safe to sync, if the inner type T is.
unsafe impl<T> Sync for SpinLock<T> where T: Send {}

/// # Safety
/// Only one thread can hold the guard at a time.
unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

/// A lock which allows multiple readers or one writer.
///
/// Writer preference: while a writer holds the gate no new readers can enter,
/// so readers cannot starve a writer. Readers may starve under a constant
/// stream of writers. Good for guarding a list which is mostly read and
/// rarely changed. Interrupts stay disabled for the duration in both modes.
#[derive(Debug)]
pub struct RwSpinLock<T> {
    name: &'static str,
    /// The writer gate; also taken briefly by readers to adjust the count.
    locked: AtomicBool,
    /// Number of readers currently holding the lock.
    readers: AtomicUsize,
    data: UnsafeCell<T>,
}

#[derive(Debug)]
pub struct RwSpinLockReadGuard<'a, T: 'a> {
    lock: &'a RwSpinLock<T>,
    _intr_lock: InterruptLock,
}

#[derive(Debug)]
pub struct RwSpinLockWriteGuard<'a, T: 'a> {
    lock: &'a RwSpinLock<T>,
    _intr_lock: InterruptLock,
}

impl<T> RwSpinLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        Self {
            name,
            locked: AtomicBool::new(false),
            readers: AtomicUsize::new(0),
            data: UnsafeCell::new(value),
        }
    }

    fn take_gate(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
    }

    pub fn read(&self) -> RwSpinLockReadGuard<'_, T> {
        let _intr_lock = lock_current_cpu();

        // the gate is only held long enough to bump the reader count, which
        // keeps new readers out while a writer owns it
        self.take_gate();
        self.readers.fetch_add(1, Ordering::Acquire);
        self.locked.store(false, Ordering::Release);

        RwSpinLockReadGuard {
            lock: self,
            _intr_lock,
        }
    }

    pub fn write(&self) -> RwSpinLockWriteGuard<'_, T> {
        let _intr_lock = lock_current_cpu();

        self.take_gate();

        // wait until the current readers have drained; the held gate keeps
        // new ones from entering
        while self.readers.load(Ordering::Acquire) != 0 {
            hint::spin_loop();
        }

        RwSpinLockWriteGuard {
            lock: self,
            _intr_lock,
        }
    }
}

impl<'a, T: 'a> Drop for RwSpinLockReadGuard<'a, T> {
    fn drop(&mut self) {
        let readers = self.lock.readers.fetch_sub(1, Ordering::Release);
        assert!(readers >= 1, "rwspinlock release {}", self.lock.name);
    }
}

impl<'a, T: 'a> Drop for RwSpinLockWriteGuard<'a, T> {
    fn drop(&mut self) {
        assert!(
            self.lock.locked.load(Ordering::Relaxed),
            "rwspinlock release {}",
            self.lock.name
        );
        self.lock.locked.store(false, Ordering::Release);
    }
}

impl<T> Deref for RwSpinLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Deref for RwSpinLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwSpinLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

/// # Safety
/// Same reasoning as SpinLock: access only through guards.
unsafe impl<T> Sync for RwSpinLock<T> where T: Send {}
