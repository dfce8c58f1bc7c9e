use core::arch::asm;
use core::cell::UnsafeCell;
use core::mem::{MaybeUninit, transmute};
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::string::String;

use crate::device::ROOT_DEVICE;
use crate::error::KernelError;
use crate::exec::exec;
use crate::file::File;
use crate::fs::{self, Inode, Path};
use crate::kalloc::PAGES;
use crate::log::Operation;
use crate::memlayout::{TRAMPOLINE, TRAPFRAME, USER_STACK_HIGH, kstack};
use crate::param::{
    KERNEL_STACK_PAGES, MAX_CPUS, MAX_FILES_PER_PROCESS, MAX_PROCESSES, USER_MAX_STACK_SIZE,
};
use crate::riscv::{PGSIZE, PTE_R, PTE_W, PTE_X, interrupts, registers::tp};
use crate::spinlock::{SpinLock, SpinLockGuard};
use crate::swtch::swtch;
use crate::sync::OnceLock;
use crate::trampoline::trampoline;
use crate::trap::usertrapret;
use crate::vm::{Kvm, PA, Uvm, VA};

pub static CPUS: CpuPool = CpuPool::new();
pub static PROCS: ProcTable = ProcTable::new();
pub static INIT_PROC: OnceLock<&Proc> = OnceLock::new();

/// Per-CPU state
pub struct Cpu {
    pub proc: Option<&'static Proc>,
    pub context: Context,
    /// depth of interrupt-disable nesting
    pub num_off: isize,
    /// were interrupts enabled before the outermost disable?
    pub interrupts_enabled: bool,
}

impl Cpu {
    const fn new() -> Self {
        Self {
            proc: None,
            context: Context::new(),
            num_off: 0,
            interrupts_enabled: false,
        }
    }

    /// Locks this CPU by disabling interrupts.
    fn lock(&mut self, old_state: bool) -> InterruptLock {
        if self.num_off == 0 {
            self.interrupts_enabled = old_state;
        }
        self.num_off += 1;
        InterruptLock
    }

    /// Unlocks this CPU, re-enabling interrupts once the nesting unwinds to
    /// the state at the outermost lock.
    pub fn unlock(&mut self) {
        assert!(!interrupts::get(), "cpu unlock - interruptible");
        assert!(self.num_off >= 1, "cpu unlock");

        self.num_off -= 1;
        if self.num_off == 0 && self.interrupts_enabled {
            interrupts::enable();
        }
    }
}

/// All CPUs, indexed by hartid.
pub struct CpuPool([UnsafeCell<Cpu>; MAX_CPUS]);

impl CpuPool {
    const fn new() -> Self {
        let mut array: [MaybeUninit<UnsafeCell<Cpu>>; MAX_CPUS] =
            unsafe { MaybeUninit::uninit().assume_init() };
        let mut i = 0;
        while i < MAX_CPUS {
            array[i] = MaybeUninit::new(UnsafeCell::new(Cpu::new()));
            i += 1;
        }
        unsafe {
            transmute::<[MaybeUninit<UnsafeCell<Cpu>>; MAX_CPUS], [UnsafeCell<Cpu>; MAX_CPUS]>(
                array,
            )
        }
    }
}

unsafe impl Sync for CpuPool {}

/// Holds one level of this CPU's interrupt-disable nesting; released on drop.
#[derive(Debug)]
pub struct InterruptLock;

impl Drop for InterruptLock {
    fn drop(&mut self) {
        // # Safety: we are still holding the CPU lock
        unsafe { current_cpu().unlock() }
    }
}

/// Returns the hart id of the current CPU.
///
/// # Safety
/// Must be called with interrupts disabled, to prevent a race with the
/// process being moved to a different CPU.
#[inline]
pub unsafe fn current_id() -> usize {
    unsafe { tp::read() }
}

/// Returns a mutable reference to the current CPU's [`Cpu`] struct.
///
/// # Safety
/// Must be called with interrupts disabled, to prevent a race with the
/// process being moved to a different CPU.
pub unsafe fn current_cpu() -> &'static mut Cpu {
    unsafe {
        assert!(!interrupts::get(), "current_cpu interrupts enabled");
        let id = current_id();
        &mut *CPUS.0[id].get()
    }
}

/// Locks this CPU by disabling interrupts.
/// Returns an [`InterruptLock`] as the ownership and lifetime of the lock.
pub fn lock_current_cpu() -> InterruptLock {
    let old_state = interrupts::get();
    interrupts::disable();

    unsafe { current_cpu().lock(old_state) }
}

/// Returns the process running on this CPU, if any.
pub fn current_proc_opt() -> Option<&'static Proc> {
    let _lock = lock_current_cpu();

    let cpu = unsafe { current_cpu() };
    cpu.proc
}

/// Returns the process running on this CPU.
/// Panics if called from a context without one (the scheduler).
pub fn current_proc() -> &'static Proc {
    current_proc_opt().expect("no current process")
}

/// Returns this CPU's process and a shared reference to its private data.
pub fn current_proc_and_data() -> (&'static Proc, &'static ProcData) {
    let proc = current_proc();
    (proc, proc.data())
}

/// Returns this CPU's process and an exclusive reference to its private data.
pub fn current_proc_and_data_mut() -> (&'static Proc, &'static mut ProcData) {
    let proc = current_proc();
    // # Safety: we are the current proc
    let data = unsafe { proc.data_mut() };
    (proc, data)
}

/// Saved registers for kernel context switches.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Context {
    pub ra: usize,
    pub sp: usize,

    // callee-saved
    pub s0: usize,
    pub s1: usize,
    pub s2: usize,
    pub s3: usize,
    pub s4: usize,
    pub s5: usize,
    pub s6: usize,
    pub s7: usize,
    pub s8: usize,
    pub s9: usize,
    pub s10: usize,
    pub s11: usize,
}

impl Context {
    pub const fn new() -> Self {
        Self {
            ra: 0,
            sp: 0,
            s0: 0,
            s1: 0,
            s2: 0,
            s3: 0,
            s4: 0,
            s5: 0,
            s6: 0,
            s7: 0,
            s8: 0,
            s9: 0,
            s10: 0,
            s11: 0,
        }
    }

    pub fn zero(&mut self) {
        *self = Self::new();
    }
}

/// Per-process data for the trap handling code in `trampoline.rs`.
/// Sits in a page by itself just under the trampoline page in the user page
/// table; not specially mapped in the kernel page table. `uservec` saves the
/// user registers here, then loads kernel_sp, kernel_hartid and kernel_satp
/// and jumps to `kernel_trap`. `usertrapret()` and `userret` do the reverse.
/// Callee-saved user registers are included because the return-to-user path
/// does not pass back through the kernel call stack.
#[derive(Debug, Clone)]
#[repr(C, align(4096))]
pub struct TrapFrame {
    /*   0 */ pub kernel_satp: usize, // kernel page table
    /*   8 */ pub kernel_sp: usize, // top of process's kernel stack
    /*  16 */ pub kernel_trap: usize, // usertrap()
    /*  24 */ pub epc: usize, // saved user program counter
    /*  32 */ pub kernel_hartid: usize, // saved kernel tp
    /*  40 */ pub ra: usize,
    /*  48 */ pub sp: usize,
    /*  56 */ pub gp: usize,
    /*  64 */ pub tp: usize,
    /*  72 */ pub t0: usize,
    /*  80 */ pub t1: usize,
    /*  88 */ pub t2: usize,
    /*  96 */ pub s0: usize,
    /* 104 */ pub s1: usize,
    /* 112 */ pub a0: usize,
    /* 120 */ pub a1: usize,
    /* 128 */ pub a2: usize,
    /* 136 */ pub a3: usize,
    /* 144 */ pub a4: usize,
    /* 152 */ pub a5: usize,
    /* 160 */ pub a6: usize,
    /* 168 */ pub a7: usize,
    /* 176 */ pub s2: usize,
    /* 184 */ pub s3: usize,
    /* 192 */ pub s4: usize,
    /* 200 */ pub s5: usize,
    /* 208 */ pub s6: usize,
    /* 216 */ pub s7: usize,
    /* 224 */ pub s8: usize,
    /* 232 */ pub s9: usize,
    /* 240 */ pub s10: usize,
    /* 248 */ pub s11: usize,
    /* 256 */ pub t3: usize,
    /* 264 */ pub t4: usize,
    /* 272 */ pub t5: usize,
    /* 280 */ pub t6: usize,
}

/// Process ID. Created through `Pid::alloc()` to ensure uniqueness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Pid(usize);

impl Pid {
    pub fn alloc() -> Self {
        static PID_COUNT: AtomicUsize = AtomicUsize::new(1);
        Pid(PID_COUNT.fetch_add(1, Ordering::Relaxed))
    }

    /// Wraps a raw pid value (e.g. from a kill syscall argument).
    pub fn from_usize(value: usize) -> Self {
        Pid(value)
    }
}

impl core::ops::Deref for Pid {
    type Target = usize;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Opaque wakeup key for `sleep`/`wakeup`. A `wakeup(c)` makes every process
/// sleeping on an equal channel runnable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// proc table index, for wait()/exit()
    Proc(usize),
    /// system ticks
    Ticks,
    /// console input buffer
    Buffer(usize),
    /// a contended sleep lock
    Lock(usize),
    /// a log, by its address
    Log(usize),
    /// an in-flight disk request
    Disk(usize),
    /// read end of a pipe
    PipeRead(usize),
    /// write end of a pipe
    PipeWrite(usize),
}

/// Process control block.
#[derive(Debug)]
pub struct Proc {
    /// NOT the pid: index into `PROCS`, also used for parent links.
    pub id: usize,
    pub inner: SpinLock<ProcInner>,
    data: UnsafeCell<ProcData>,
}

#[derive(Debug, PartialEq, Eq, Default, Clone, Copy)]
pub enum ProcState {
    #[default]
    Unused,
    Used,
    Sleeping,
    Runnable,
    Running,
    Zombie,
}

/// Shared fields; the proc lock must be held to access these.
#[derive(Debug, Default)]
pub struct ProcInner {
    pub state: ProcState,
    /// if Some, sleeping on this channel
    pub channel: Option<Channel>,
    pub killed: bool,
    /// exit status to be returned to the parent's wait
    pub xstate: i32,
    pub pid: Pid,
}

impl ProcInner {
    const fn new() -> Self {
        Self {
            state: ProcState::Unused,
            channel: None,
            killed: false,
            xstate: 0,
            pid: Pid(0),
        }
    }
}

/// Fields private to the process; no lock needed.
#[derive(Debug)]
pub struct ProcData {
    /// virtual address of the kernel stack
    pub kstack: VA,
    /// size of process heap memory (bytes, from address 0)
    pub size: usize,
    /// lowest mapped stack address; the stack spans up to USER_STACK_HIGH
    pub stack_low: VA,
    pub pagetable: Option<Uvm>,
    pub trapframe: Option<Box<TrapFrame>>,
    /// swtch() here to run the process
    pub context: Context,
    pub open_files: [Option<File>; MAX_FILES_PER_PROCESS],
    pub cwd: Option<Inode>,
    /// process name (debugging)
    pub name: String,
}

impl ProcData {
    const fn new() -> Self {
        Self {
            kstack: VA::new(0),
            size: 0,
            stack_low: VA::new(0),
            pagetable: None,
            trapframe: None,
            context: Context::new(),
            open_files: [const { None }; MAX_FILES_PER_PROCESS],
            cwd: None,
            name: String::new(),
        }
    }

    pub fn trapframe(&self) -> &TrapFrame {
        self.trapframe.as_ref().unwrap()
    }

    pub fn trapframe_mut(&mut self) -> &mut TrapFrame {
        self.trapframe.as_mut().unwrap()
    }

    pub fn pagetable(&self) -> &Uvm {
        self.pagetable.as_ref().unwrap()
    }

    pub fn pagetable_mut(&mut self) -> &mut Uvm {
        self.pagetable.as_mut().unwrap()
    }

    /// Current size of the user stack in bytes.
    pub fn stack_size(&self) -> usize {
        USER_STACK_HIGH - self.stack_low.as_usize()
    }
}

unsafe impl Sync for ProcData {}
unsafe impl Send for ProcData {}

impl Proc {
    const fn new(id: usize) -> Self {
        Self {
            id,
            inner: SpinLock::new(ProcInner::new(), "proc"),
            data: UnsafeCell::new(ProcData::new()),
        }
    }

    pub fn data(&self) -> &ProcData {
        unsafe { &*self.data.get() }
    }

    /// Returns a mutable reference to the process's private data.
    ///
    /// # Safety
    /// The caller must have exclusive access: either this is the current
    /// proc, or the proc has not become runnable yet (fork, alloc).
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self) -> &mut ProcData {
        unsafe { &mut *self.data.get() }
    }

    pub fn is_init_proc(&self) -> bool {
        ptr::eq(self, *INIT_PROC.get().unwrap())
    }

    /// Returns true if this process has been killed.
    /// Acquires and releases the proc lock.
    pub fn is_killed(&self) -> bool {
        self.inner.lock().killed
    }

    pub fn set_killed(&self) {
        self.inner.lock().killed = true;
    }

    /// Creates an empty user page table for this process, with only the
    /// trampoline and trapframe pages mapped.
    pub fn create_pagetable(&self) -> Result<Uvm, KernelError> {
        let mut uvm = Uvm::try_new()?;

        // the trampoline, at the highest user virtual address. Only the
        // supervisor uses it on the way to/from user space, so not PTE_U.
        if let Err(err) = log!(uvm.map_pages(
            VA::new(TRAMPOLINE),
            PA::from(trampoline as *const () as usize),
            PGSIZE,
            PTE_R | PTE_X,
        )) {
            uvm.proc_free(0, VA::new(0));
            return Err(err);
        }

        // the trapframe page just below the trampoline page
        let data = self.data();
        if let Err(err) = log!(uvm.map_pages(
            VA::new(TRAPFRAME),
            PA::from(data.trapframe() as *const _ as usize),
            PGSIZE,
            PTE_R | PTE_W,
        )) {
            uvm.unmap(VA::new(TRAMPOLINE), 1, false);
            uvm.proc_free(0, VA::new(0));
            return Err(err);
        }

        Ok(uvm)
    }

    /// Frees the process and the data attached to it (including user pages).
    pub fn free(&self, mut inner: SpinLockGuard<'_, ProcInner>) {
        // # Safety: we are the only ones with access to this proc
        let data = unsafe { self.data_mut() };

        data.trapframe.take();

        if let Some(uvm) = data.pagetable.take() {
            uvm.proc_free(data.size, data.stack_low);
        }

        data.size = 0;
        data.stack_low = VA::new(0);
        data.name.clear();
        inner.pid = Pid(0);
        inner.channel = None;
        inner.killed = false;
        inner.xstate = 0;
        inner.state = ProcState::Unused;
    }
}

unsafe impl Sync for Proc {}

/// The process table.
pub struct ProcTable {
    table: [UnsafeCell<Proc>; MAX_PROCESSES],
    // one array of parent links guarded by one lock, instead of a parent
    // field per proc under a global wait lock. parents[child.id] ==
    // Some(parent.id)
    pub parents: SpinLock<[Option<usize>; MAX_PROCESSES]>,
}

impl ProcTable {
    const fn new() -> Self {
        let mut table: [MaybeUninit<UnsafeCell<Proc>>; MAX_PROCESSES] =
            unsafe { MaybeUninit::uninit().assume_init() };

        let mut i = 0;
        while i < MAX_PROCESSES {
            table[i] = MaybeUninit::new(UnsafeCell::new(Proc::new(i)));
            i += 1;
        }

        Self {
            table: unsafe {
                transmute::<
                    [MaybeUninit<UnsafeCell<Proc>>; MAX_PROCESSES],
                    [UnsafeCell<Proc>; MAX_PROCESSES],
                >(table)
            },
            parents: SpinLock::new([None; MAX_PROCESSES], "parents"),
        }
    }

    pub fn get(&self, index: usize) -> &Proc {
        unsafe { &*self.table[index].get() }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Proc> {
        (0..MAX_PROCESSES).map(|i| self.get(i))
    }

    /// Allocates the kernel stack pages for every process and maps them high
    /// in kernel memory, each followed by an unmapped guard page.
    ///
    /// # Safety
    /// Called once while building the kernel page table, before paging is on.
    pub unsafe fn map_stacks(&self, kvm: &mut Kvm) {
        for i in 0..MAX_PROCESSES {
            let base = kstack(i);
            for page in 0..KERNEL_STACK_PAGES {
                let pa = PAGES.alloc_zeroed().expect("kstack alloc");
                kvm.map(
                    VA::new(base + page * PGSIZE),
                    PA::from(pa as usize),
                    PGSIZE,
                    PTE_R | PTE_W,
                );
            }
        }
    }

    /// Searches the table for an unused proc. If found, initializes the
    /// state required to run in the kernel and returns the proc with its
    /// inner lock held.
    pub fn alloc(&self) -> Result<(&Proc, SpinLockGuard<'_, ProcInner>), KernelError> {
        for proc in self.iter() {
            let mut inner = proc.inner.lock();
            if inner.state != ProcState::Unused {
                continue;
            }

            inner.pid = Pid::alloc();
            inner.state = ProcState::Used;

            // # Safety: proc is not yet runnable, we are the only ones
            // with access to it
            let data = unsafe { proc.data_mut() };

            // a trapframe page
            match log!(Box::<TrapFrame>::try_new_zeroed()) {
                Ok(trapframe) => {
                    data.trapframe.replace(unsafe { trapframe.assume_init() });
                }
                Err(err) => {
                    proc.free(inner);
                    return Err(err.into());
                }
            }

            // an empty user page table
            match log!(proc.create_pagetable()) {
                Ok(uvm) => {
                    data.pagetable.replace(uvm);
                }
                Err(err) => {
                    proc.free(inner);
                    return Err(err);
                }
            }

            // start executing at fork_ret, which returns to user space
            data.context.zero();
            data.context.ra = fork_ret as *const () as usize;
            data.context.sp = (data.kstack + KERNEL_STACK_PAGES * PGSIZE).as_usize();

            return Ok((proc, inner));
        }

        Err(KernelError::Other)
    }

    /// Prints a process listing to the console (CTRL+P).
    /// For debugging only; does not lock to avoid creating more problems.
    pub fn dump(&self) {
        println!();

        for proc in self.iter() {
            let inner = unsafe { proc.inner.get_mut_unchecked() };
            if inner.state == ProcState::Unused {
                continue;
            }

            println!(
                "{:<5} {:<10} {}",
                inner.pid.0,
                state_name(inner.state),
                proc.data().name
            );
        }
    }
}

fn state_name(state: ProcState) -> &'static str {
    match state {
        ProcState::Unused => "unused",
        ProcState::Used => "used",
        ProcState::Sleeping => "sleeping",
        ProcState::Runnable => "runnable",
        ProcState::Running => "running",
        ProcState::Zombie => "zombie",
    }
}

unsafe impl Sync for ProcTable {}

/// Sets up the first user process.
pub fn user_init() {
    let (proc, mut inner) = PROCS.alloc().expect("user_init alloc");
    INIT_PROC.initialize(|| Ok::<_, ()>(proc));

    // # Safety: during initialization, we are the only ones with access
    let data = unsafe { proc.data_mut() };

    data.cwd = Some(Path::new("/").resolve().expect("root path to exist"));
    data.name.push_str("init");

    inner.state = ProcState::Runnable;
}

/// Grows or shrinks user heap memory by `n` bytes. Returns the old size.
///
/// # Safety
/// The caller must be the current process.
pub unsafe fn grow(n: isize) -> Result<usize, KernelError> {
    let (_proc, data) = current_proc_and_data_mut();

    let old_size = data.size;
    let mut size = data.size;

    if n > 0 {
        let Some(new_size) = size.checked_add(n as usize) else {
            err!(KernelError::InvalidArgument);
        };

        // the heap may never reach the lowest possible stack address
        if new_size >= USER_STACK_HIGH - USER_MAX_STACK_SIZE {
            err!(KernelError::OutOfMemory);
        }

        size = try_log!(data.pagetable_mut().alloc(size, new_size, PTE_W));
    } else if n < 0 {
        let shrink = (-n) as usize;
        if shrink > size {
            err!(KernelError::InvalidArgument);
        }

        size = data.pagetable_mut().dealloc(size, size - shrink);
    }

    data.size = size;
    Ok(old_size)
}

/// Maps one more stack page below `stack_low`, called on a page fault in the
/// stack growth window. Fails once the stack would exceed
/// USER_MAX_STACK_SIZE.
pub fn grow_stack(proc: &Proc) -> Result<(), KernelError> {
    // # Safety: only the faulting process grows its own stack
    let data = unsafe { proc.data_mut() };

    if data.stack_size() + PGSIZE > USER_MAX_STACK_SIZE {
        err!(KernelError::OutOfMemory);
    }

    let new_low = VA::new(data.stack_low.as_usize() - PGSIZE);
    try_log!(data.pagetable_mut().alloc_range(new_low, data.stack_low, PTE_W));
    data.stack_low = new_low;

    Ok(())
}

/// Creates a new process, copying the parent.
/// Sets up the child kernel stack to return as if from the fork() call.
pub fn fork() -> Result<Pid, KernelError> {
    let (proc, data) = current_proc_and_data_mut();

    let (new_proc, new_inner) = try_log!(PROCS.alloc());
    // # Safety: new_proc is not yet runnable
    let new_data = unsafe { new_proc.data_mut() };

    // copy user memory from parent to child: heap, then stack
    let size = data.size;
    let stack_low = data.stack_low;
    let pagetable = data.pagetable_mut();
    let new_pagetable = new_data.pagetable.as_mut().unwrap();

    if let Err(err) = log!(pagetable.copy_range(new_pagetable, VA::new(0), VA::new(size))) {
        new_proc.free(new_inner);
        return Err(err);
    }
    if stack_low.as_usize() != 0
        && let Err(err) = log!(pagetable.copy_range(
            new_pagetable,
            stack_low,
            VA::new(USER_STACK_HIGH)
        ))
    {
        new_pagetable.unmap(VA::new(0), crate::riscv::pg_round_up(size) / PGSIZE, true);
        new_proc.free(new_inner);
        return Err(err);
    }

    new_data.size = size;
    new_data.stack_low = stack_low;

    // copy saved user registers; a0 = 0 makes fork return 0 in the child
    new_data.trapframe_mut().clone_from(data.trapframe());
    new_data.trapframe_mut().a0 = 0;

    // increment reference counts on open file descriptors
    for (i, file) in data.open_files.iter_mut().enumerate() {
        if let Some(file) = file.as_mut() {
            new_data.open_files[i] = Some(file.dup());
        }
    }
    new_data.cwd = data.cwd.as_ref().map(Inode::dup);

    new_data.name = data.name.clone();

    let pid = new_inner.pid;

    // drop the child's lock before taking the parents lock
    drop(new_inner);

    {
        let mut parents = PROCS.parents.lock();
        parents[new_proc.id] = Some(proc.id);
    }

    let mut new_inner = new_proc.inner.lock();
    new_inner.state = ProcState::Runnable;

    Ok(pid)
}

/// Passes `original`'s abandoned children to init.
fn reparent(original: &Proc, parents: &mut SpinLockGuard<'_, [Option<usize>; MAX_PROCESSES]>) {
    let init = INIT_PROC.get().unwrap();
    for parent in parents.iter_mut() {
        if *parent == Some(original.id) {
            *parent = Some(init.id);
            wakeup(Channel::Proc(init.id));
        }
    }
}

/// Exits the current process; does not return. The process stays a zombie
/// until its parent calls wait().
pub fn exit(status: i32) -> ! {
    let (proc, data) = current_proc_and_data_mut();
    assert!(!proc.is_init_proc(), "init exiting");

    // close all open files
    for file in &mut data.open_files {
        if let Some(mut file) = file.take() {
            file.close();
        }
    }

    if let Some(cwd) = data.cwd.take() {
        let _op = Operation::begin();
        cwd.put();
    }

    let mut parents = PROCS.parents.lock();

    // give any children to init
    reparent(proc, &mut parents);

    // the parent might be sleeping in wait()
    let parent_id = parents[proc.id].expect("exit no parent");
    wakeup(Channel::Proc(parent_id));

    let mut inner = proc.inner.lock();
    inner.xstate = status;
    inner.state = ProcState::Zombie;

    drop(parents);

    sched(inner, &mut data.context);

    unreachable!("zombie exit");
}

/// Waits for a child process to exit and returns its pid, or None if there
/// are no children. A non-zero `addr` receives the child's exit status.
pub fn wait(addr: VA) -> Option<Pid> {
    let current = current_proc();
    let current_id = current.id;

    // the parents lock is what makes a concurrent exit() wait for us to
    // reach sleep below (the lost-wakeup protection)
    let mut parents = PROCS.parents.lock();

    loop {
        let mut have_kids = false;

        for proc in PROCS.iter() {
            if parents[proc.id] != Some(current_id) {
                continue;
            }

            // make sure the child isn't still in exit() or swtch()
            let inner = proc.inner.lock();

            have_kids = true;

            if inner.state == ProcState::Zombie {
                let pid = inner.pid;

                if addr.as_usize() != 0 {
                    let xstate = inner.xstate.to_le_bytes();
                    // # Safety: we are the current proc
                    if unsafe { current.data_mut() }
                        .pagetable_mut()
                        .copy_out(&xstate, addr)
                        .is_err()
                    {
                        return None;
                    }
                }

                parents[proc.id] = None;
                proc.free(inner);

                return Some(pid);
            }
        }

        if !have_kids || current.is_killed() {
            return None;
        }

        // wait for a child to exit
        parents = sleep(Channel::Proc(current_id), parents);
    }
}

/// Per-CPU process scheduler; never returns. Loops choosing a RUNNABLE
/// process, switching into it, and collecting control back.
///
/// # Safety
/// Must be called with interrupts disabled, once per hart, after init.
pub unsafe fn scheduler() -> ! {
    // the cpu reference is stable: the scheduler never migrates
    let cpu = unsafe { current_cpu() };

    cpu.proc.take();

    loop {
        // the most recent process may have had interrupts turned off;
        // enable them to avoid a deadlock if every process is waiting,
        // then turn them off again to avoid racing an interrupt with wfi.
        interrupts::enable();
        interrupts::disable();

        let mut found = false;

        for proc in PROCS.iter() {
            let mut inner = proc.inner.lock();

            if inner.state == ProcState::Runnable {
                // switch to the chosen process. it is the process's job to
                // release its lock and reacquire it before jumping back.
                inner.state = ProcState::Running;
                cpu.proc.replace(proc);
                unsafe { swtch(&mut cpu.context, &proc.data().context) };

                // the process is done running for now; it changed its state
                // before coming back
                cpu.proc.take();
                found = true;
            }
        }

        if !found {
            // nothing to run; idle until an interrupt
            unsafe { asm!("wfi") };
        }
    }
}

/// Switches to the scheduler. Must hold only the proc's inner lock and have
/// already changed the proc's state.
///
/// Saves and restores `interrupts_enabled` because it is a property of this
/// kernel thread, not of the CPU.
pub fn sched<'a>(
    proc_inner: SpinLockGuard<'a, ProcInner>,
    context: &mut Context,
) -> SpinLockGuard<'a, ProcInner> {
    let cpu = unsafe { current_cpu() };

    assert_eq!(cpu.num_off, 1, "sched locks");
    assert_ne!(proc_inner.state, ProcState::Running, "sched running");
    assert!(!interrupts::get(), "sched interruptible");

    let interrupts_enabled = cpu.interrupts_enabled;
    unsafe { swtch(context, &cpu.context) };

    // look the cpu up again: the process may have moved to another hart
    let cpu = unsafe { current_cpu() };
    cpu.interrupts_enabled = interrupts_enabled;

    proc_inner
}

/// Gives up the CPU for one scheduling round.
pub fn r#yield() {
    let (proc, data) = current_proc_and_data_mut();

    let mut inner = proc.inner.lock();
    inner.state = ProcState::Runnable;

    sched(inner, &mut data.context);
}

/// First return path of a forked child; also runs one-time setup that needs
/// a process context.
///
/// # Safety
/// Not called directly; it is the return address installed by ProcTable::alloc.
pub unsafe extern "C" fn fork_ret() {
    // multiple CPUs can schedule their first process simultaneously
    static FIRST: AtomicBool = AtomicBool::new(true);

    // still holding the proc lock from the scheduler
    unsafe { current_proc().inner.force_unlock() };

    if FIRST
        .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
        .is_ok()
    {
        // file system initialization must run in the context of a regular
        // process (it sleeps), so it cannot run from main()
        fs::init_root(ROOT_DEVICE);

        println!("\nexec /init\n");

        match log!(exec(&Path::new("/init"), &["init"])) {
            Ok(argc) => {
                // # Safety: we are the current proc
                unsafe { current_proc().data_mut() }.trapframe_mut().a0 = argc;
            }
            Err(_) => panic!("fork_ret exec /init"),
        }
    }

    // return to user space, mimicking usertrap()'s return
    unsafe { usertrapret() };
}

/// Atomically releases `guard`'s lock and sleeps on `channel`.
/// Reacquires the lock when awakened.
pub fn sleep<T>(channel: Channel, guard: SpinLockGuard<'_, T>) -> SpinLockGuard<'_, T> {
    // acquire the proc lock before releasing the condition lock: wakeup()
    // needs the proc lock too, so it cannot run until sched() has finished
    // putting us to sleep, and the wakeup cannot be lost.
    let condition_lock;
    {
        let proc = current_proc();
        let mut inner = proc.inner.lock();

        condition_lock = SpinLock::unlock(guard);

        inner.channel = Some(channel);
        inner.state = ProcState::Sleeping;

        // switch to the scheduler (and, eventually, back)
        // # Safety: we are the current proc
        let context = unsafe { &mut proc.data_mut().context };
        inner = sched(inner, context);

        inner.channel = None;
    }

    condition_lock.lock()
}

/// Wakes up all processes sleeping on `channel`.
/// Must be called without any proc lock held.
pub fn wakeup(channel: Channel) {
    // there may be no current proc when called from the scheduler context
    let current = current_proc_opt();

    for proc in PROCS.iter() {
        if current.is_some_and(|p| ptr::eq(p, proc)) {
            continue;
        }

        let mut inner = proc.inner.lock();
        if inner.state == ProcState::Sleeping && inner.channel == Some(channel) {
            inner.state = ProcState::Runnable;
        }
    }
}

/// Kills the process with the given pid. The victim exits once it next
/// crosses the user/kernel boundary (see usertrap).
pub fn kill(pid: Pid) -> Result<(), KernelError> {
    for proc in PROCS.iter() {
        let mut inner = proc.inner.lock();
        if inner.pid == pid && inner.state != ProcState::Unused {
            inner.killed = true;

            if inner.state == ProcState::Sleeping {
                // wake the process from sleep()
                inner.state = ProcState::Runnable;
            }

            return Ok(());
        }
    }

    Err(KernelError::NoProcess)
}

/// Destination or source of an inode/device transfer: either a user virtual
/// address in the current process or a kernel address.
#[derive(Debug, Clone, Copy)]
pub enum Addr {
    User(VA),
    Kernel(usize),
}

impl Addr {
    pub fn offset(self, n: usize) -> Self {
        match self {
            Addr::User(va) => Addr::User(va + n),
            Addr::Kernel(addr) => Addr::Kernel(addr + n),
        }
    }
}

/// Copies to either a user or a kernel address.
pub fn either_copy_out(dst: Addr, src: &[u8]) -> Result<(), KernelError> {
    match dst {
        Addr::User(va) => {
            // # Safety: we are the current proc
            unsafe { current_proc().data_mut() }
                .pagetable_mut()
                .copy_out(src, va)
        }
        Addr::Kernel(addr) => {
            unsafe { ptr::copy_nonoverlapping(src.as_ptr(), addr as *mut u8, src.len()) };
            Ok(())
        }
    }
}

/// Copies from either a user or a kernel address.
pub fn either_copy_in(dst: &mut [u8], src: Addr) -> Result<(), KernelError> {
    match src {
        Addr::User(va) => {
            // # Safety: we are the current proc
            unsafe { current_proc().data_mut() }
                .pagetable_mut()
                .copy_in(dst, va)
        }
        Addr::Kernel(addr) => {
            unsafe { ptr::copy_nonoverlapping(addr as *const u8, dst.as_mut_ptr(), dst.len()) };
            Ok(())
        }
    }
}

/// Copies from kernel memory to the current process's user space.
pub fn copy_to_user(src: &[u8], dst: VA) -> Result<(), KernelError> {
    either_copy_out(Addr::User(dst), src)
}

/// Copies from the current process's user space into kernel memory.
pub fn copy_from_user(src: VA, dst: &mut [u8]) -> Result<(), KernelError> {
    either_copy_in(dst, Addr::User(src))
}

/// Initializes the process table.
///
/// # Safety
/// Must be called only once during kernel initialization.
pub unsafe fn init() {
    for proc in PROCS.iter() {
        // # Safety: nothing else is running yet
        unsafe { proc.data_mut() }.kstack = VA::new(kstack(proc.id));
    }
}
