use core::slice;

use crate::error::KernelError;
use crate::fs::{Inode, InodeInner, Path};
use crate::log::Operation;
use crate::memlayout::USER_STACK_HIGH;
use crate::param::{MAX_EXEC_ARGS, USER_MAX_STACK_SIZE};
use crate::proc::{Addr, current_proc};
use crate::riscv::{PGSIZE, PTE_W, PTE_X};
use crate::sleeplock::SleepLockGuard;
use crate::vm::{Uvm, VA};

const ELF_MAGIC: u32 = 0x464C457F; // "\x7FELF" in little endian

/// ELF file header (64-bit)
#[repr(C)]
#[derive(Debug)]
struct ElfHeader {
    magic: u32,
    elf: [u8; 12],
    r#type: u16,
    machine: u16,
    version: u32,
    entry: u64,
    phoff: u64,
    shoff: u64,
    flags: u32,
    ehsize: u16,
    phentsize: u16,
    phnum: u16,
    shentsize: u16,
    shnum: u16,
    shstrndx: u16,
}

/// ELF program header
#[repr(C)]
#[derive(Debug)]
struct ProgramHeader {
    r#type: u32,
    flags: u32,
    offset: u64,
    vaddr: u64,
    paddr: u64,
    filesz: u64,
    memsz: u64,
    align: u64,
}

impl ElfHeader {
    const SIZE: usize = size_of::<Self>();

    fn from_bytes(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= Self::SIZE);
        unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Self) }
    }
}

impl ProgramHeader {
    const SIZE: usize = size_of::<Self>();

    const ELF_PROG_LOAD: u32 = 1;

    fn from_bytes(bytes: &[u8]) -> Self {
        assert!(bytes.len() >= Self::SIZE);
        unsafe { core::ptr::read_unaligned(bytes.as_ptr() as *const Self) }
    }

    fn perms(&self) -> usize {
        let mut perm = 0;
        if self.flags & 0x1 != 0 {
            perm = PTE_X;
        }
        if self.flags & 0x2 != 0 {
            perm |= PTE_W;
        }
        perm
    }
}

/// Loads a program segment at virtual address `va` of `pagetable`.
/// `va` must be page-aligned and the range must already be mapped.
fn load_segment(
    pagetable: &mut Uvm,
    va: VA,
    inode: &Inode,
    inner: &mut SleepLockGuard<'_, InodeInner>,
    offset: u32,
    size: usize,
) -> Result<(), KernelError> {
    for i in (0..size).step_by(PGSIZE) {
        let pa = pagetable
            .physical_addr(va + i)
            .expect("load_segment: address should exist");

        let n = (size - i).min(PGSIZE) as u32;

        let read = try_log!(inode.read(inner, Addr::Kernel(pa.as_usize()), offset + i as u32, n));
        if read != n {
            err!(KernelError::ExecFormat);
        }
    }

    Ok(())
}

/// Replaces the current process image with the program at `path`.
///
/// The new page table is built completely on the side and only swapped into
/// the process on success; any failure leaves the old image untouched.
/// Returns argc, which lands in a0, the first argument of main(argc, argv).
pub fn exec(path: &Path<'_>, argv: &[&str]) -> Result<usize, KernelError> {
    let proc = current_proc();
    let mut size = 0;

    let op = Operation::begin();

    let inode = try_log!(path.resolve());
    let mut inner = inode.lock();

    // the ELF header
    let mut elf_buf = [0u8; ElfHeader::SIZE];
    match log!(inode.read(
        &mut inner,
        Addr::Kernel(elf_buf.as_mut_ptr() as usize),
        0,
        ElfHeader::SIZE as u32,
    )) {
        Ok(read) if read as usize == ElfHeader::SIZE => {}
        _ => {
            inode.unlock_put(inner);
            err!(KernelError::ExecFormat);
        }
    }

    let elf = ElfHeader::from_bytes(&elf_buf);

    if elf.magic != ELF_MAGIC {
        inode.unlock_put(inner);
        err!(KernelError::ExecFormat);
    }

    let mut pagetable = match log!(proc.create_pagetable()) {
        Ok(pt) => pt,
        Err(err) => {
            inode.unlock_put(inner);
            return Err(err);
        }
    };

    // the cleanup path for everything below: free the half-built image
    macro_rules! bad {
        ($pagetable:expr, $size:expr, $err:expr) => {{
            $pagetable.proc_free($size, VA::new(0));
            err!($err);
        }};
    }

    // load each loadable program segment
    let mut ph_buf = [0u8; ProgramHeader::SIZE];
    let mut offset = elf.phoff;

    for _ in 0..elf.phnum {
        match log!(inode.read(
            &mut inner,
            Addr::Kernel(ph_buf.as_mut_ptr() as usize),
            offset as u32,
            ProgramHeader::SIZE as u32,
        )) {
            Ok(read) if read as usize == ProgramHeader::SIZE => {}
            _ => {
                inode.unlock_put(inner);
                bad!(pagetable, size, KernelError::ExecFormat);
            }
        }

        let ph = ProgramHeader::from_bytes(&ph_buf);
        offset += ProgramHeader::SIZE as u64;

        if ph.r#type != ProgramHeader::ELF_PROG_LOAD {
            continue;
        }

        if ph.memsz < ph.filesz
            || ph.vaddr.checked_add(ph.memsz).is_none()
            || (ph.vaddr + ph.memsz) as usize >= USER_STACK_HIGH - USER_MAX_STACK_SIZE
            || ph.vaddr as usize % PGSIZE != 0
        {
            inode.unlock_put(inner);
            bad!(pagetable, size, KernelError::ExecFormat);
        }

        size = match log!(pagetable.alloc(size, (ph.vaddr + ph.memsz) as usize, ph.perms())) {
            Ok(new_size) => new_size,
            Err(_) => {
                inode.unlock_put(inner);
                bad!(pagetable, size, KernelError::OutOfMemory);
            }
        };

        if log!(load_segment(
            &mut pagetable,
            VA::new(ph.vaddr as usize),
            &inode,
            &mut inner,
            ph.offset as u32,
            ph.filesz as usize,
        ))
        .is_err()
        {
            inode.unlock_put(inner);
            bad!(pagetable, size, KernelError::ExecFormat);
        }
    }

    inode.unlock_put(inner);
    drop(op);

    // the initial user stack: one page just below USER_STACK_HIGH, grown
    // on demand by the page fault handler
    let stack_low = VA::new(USER_STACK_HIGH - PGSIZE);
    if log!(pagetable.alloc_range(stack_low, VA::new(USER_STACK_HIGH), PTE_W)).is_err() {
        bad!(pagetable, size, KernelError::OutOfMemory);
    }

    let free_all = |pagetable: Uvm, size: usize| {
        pagetable.proc_free(size, stack_low);
    };

    let mut sp = USER_STACK_HIGH;
    let stack_base = stack_low.as_usize();

    // copy argument strings onto the stack, remembering their addresses
    let mut ustack = [0u64; MAX_EXEC_ARGS];
    let mut argc = 0;

    for &arg in argv {
        if argc >= MAX_EXEC_ARGS {
            free_all(pagetable, size);
            err!(KernelError::ArgumentListTooLong);
        }

        sp -= arg.len() + 1; // string plus NUL
        sp -= sp % 16; // riscv sp must be 16-byte aligned

        if sp < stack_base {
            free_all(pagetable, size);
            err!(KernelError::ArgumentListTooLong);
        }

        if log!(pagetable.copy_out(arg.as_bytes(), VA::new(sp))).is_err()
            || log!(pagetable.copy_out(&[0u8], VA::new(sp + arg.len()))).is_err()
        {
            free_all(pagetable, size);
            err!(KernelError::BadAddress);
        }

        ustack[argc] = sp as u64;
        argc += 1;
    }
    ustack[argc] = 0;

    // push the argv[] pointer array
    sp -= (argc + 1) * size_of::<u64>();
    sp -= sp % 16;

    let ustack_bytes = unsafe {
        slice::from_raw_parts(ustack.as_ptr() as *const u8, (argc + 1) * size_of::<u64>())
    };

    if sp < stack_base || log!(pagetable.copy_out(ustack_bytes, VA::new(sp))).is_err() {
        free_all(pagetable, size);
        err!(KernelError::BadAddress);
    }

    // # Safety: we are the current proc
    let data = unsafe { proc.data_mut() };

    // save the program name for debugging
    let name = path
        .as_str()
        .rsplit_once('/')
        .map_or(path.as_str(), |(_, name)| name);
    data.name.clear();
    data.name.push_str(name);

    // commit to the new image
    let old_pagetable = data.pagetable.replace(pagetable).unwrap();
    let old_size = data.size;
    let old_stack_low = data.stack_low;
    data.size = size;
    data.stack_low = stack_low;

    let trapframe = data.trapframe_mut();
    trapframe.epc = elf.entry as usize; // initial program counter = main
    trapframe.sp = sp; // initial stack pointer
    trapframe.a1 = sp; // argv for main(argc, argv)

    old_pagetable.proc_free(old_size, old_stack_low);

    Ok(argc)
}
