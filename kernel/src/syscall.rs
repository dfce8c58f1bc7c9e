use alloc::string::String;

use crate::error::KernelError;
use crate::file::File;
use crate::param::MAX_FILES_PER_PROCESS;
use crate::proc::{Proc, TrapFrame, current_proc, current_proc_and_data_mut};
use crate::vm::VA;

/// Wrapper for extracting typed syscall arguments from the trapframe.
/// Arguments arrive in a0-a5, the syscall number in a7.
pub struct SyscallArgs<'a> {
    trapframe: &'a TrapFrame,
    proc: &'static Proc,
}

impl<'a> SyscallArgs<'a> {
    fn new(trapframe: &'a TrapFrame, proc: &'static Proc) -> Self {
        Self { trapframe, proc }
    }

    pub fn proc(&self) -> &Proc {
        self.proc
    }

    /// The raw argument in slot `index` (0..=5).
    pub fn get_raw(&self, index: usize) -> usize {
        match index {
            0 => self.trapframe.a0,
            1 => self.trapframe.a1,
            2 => self.trapframe.a2,
            3 => self.trapframe.a3,
            4 => self.trapframe.a4,
            5 => self.trapframe.a5,
            _ => panic!("invalid syscall argument index {}", index),
        }
    }

    pub fn get_int(&self, index: usize) -> isize {
        self.get_raw(index) as isize
    }

    /// The argument as a user virtual address. Not checked here;
    /// copy_in/copy_out validate on use.
    pub fn get_addr(&self, index: usize) -> VA {
        VA::from(self.get_raw(index))
    }

    /// The argument as a file descriptor, resolved against the current
    /// process's open file table.
    pub fn get_file(&self, index: usize) -> Result<(usize, File), KernelError> {
        let fd: usize = self
            .get_int(index)
            .try_into()
            .or(Err(KernelError::BadDescriptor))?;

        if fd >= MAX_FILES_PER_PROCESS {
            err!(KernelError::BadDescriptor);
        }

        if let Some(file) = &current_proc().data().open_files[fd] {
            return Ok((fd, file.clone()));
        }

        err!(KernelError::BadDescriptor);
    }

    /// Fetches a NUL-terminated string at a user address.
    pub fn fetch_string(&self, addr: VA, max: usize) -> Result<String, KernelError> {
        let (_proc, data) = current_proc_and_data_mut();
        log!(data.pagetable_mut().copy_in_str(addr, max))
    }
}

/// System call numbers; part of the user ABI and stable.
#[repr(usize)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syscall {
    Fork = 1,
    Exit = 2,
    Wait = 3,
    Pipe = 4,
    Read = 5,
    Kill = 6,
    Execv = 7,
    Fstat = 8,
    Chdir = 9,
    Dup = 10,
    Getpid = 11,
    Sbrk = 12,
    Sleep = 13,
    Uptime = 14,
    Open = 15,
    Write = 16,
    Mknod = 17,
    Unlink = 18,
    Link = 19,
    Mkdir = 20,
    Close = 21,
    GetDirent = 22,
    Reboot = 23,
    GetTime = 24,
    Lseek = 25,
    Rmdir = 26,
    Mount = 27,
    Umount = 28,
    Ioctl = 29,
}

impl TryFrom<usize> for Syscall {
    type Error = KernelError;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Syscall::Fork),
            2 => Ok(Syscall::Exit),
            3 => Ok(Syscall::Wait),
            4 => Ok(Syscall::Pipe),
            5 => Ok(Syscall::Read),
            6 => Ok(Syscall::Kill),
            7 => Ok(Syscall::Execv),
            8 => Ok(Syscall::Fstat),
            9 => Ok(Syscall::Chdir),
            10 => Ok(Syscall::Dup),
            11 => Ok(Syscall::Getpid),
            12 => Ok(Syscall::Sbrk),
            13 => Ok(Syscall::Sleep),
            14 => Ok(Syscall::Uptime),
            15 => Ok(Syscall::Open),
            16 => Ok(Syscall::Write),
            17 => Ok(Syscall::Mknod),
            18 => Ok(Syscall::Unlink),
            19 => Ok(Syscall::Link),
            20 => Ok(Syscall::Mkdir),
            21 => Ok(Syscall::Close),
            22 => Ok(Syscall::GetDirent),
            23 => Ok(Syscall::Reboot),
            24 => Ok(Syscall::GetTime),
            25 => Ok(Syscall::Lseek),
            26 => Ok(Syscall::Rmdir),
            27 => Ok(Syscall::Mount),
            28 => Ok(Syscall::Umount),
            29 => Ok(Syscall::Ioctl),
            _ => Err(KernelError::InvalidArgument),
        }
    }
}

/// Dispatches a system call. The return value (or `-errno`) goes into the
/// trapframe's a0.
///
/// # Safety
/// Called from `usertrap` with the current process's trapframe.
pub unsafe fn syscall(trapframe: &mut TrapFrame) {
    use crate::sysfile::*;
    use crate::sysproc::*;

    let proc = current_proc();
    let args = SyscallArgs::new(trapframe, proc);

    let result = match Syscall::try_from(trapframe.a7) {
        Ok(syscall) => match syscall {
            Syscall::Fork => sys_fork(&args),
            Syscall::Exit => sys_exit(&args),
            Syscall::Wait => sys_wait(&args),
            Syscall::Pipe => sys_pipe(&args),
            Syscall::Read => sys_read(&args),
            Syscall::Kill => sys_kill(&args),
            Syscall::Execv => sys_execv(&args),
            Syscall::Fstat => sys_fstat(&args),
            Syscall::Chdir => sys_chdir(&args),
            Syscall::Dup => sys_dup(&args),
            Syscall::Getpid => sys_getpid(&args),
            Syscall::Sbrk => sys_sbrk(&args),
            Syscall::Sleep => sys_sleep(&args),
            Syscall::Uptime => sys_uptime(&args),
            Syscall::Open => sys_open(&args),
            Syscall::Write => sys_write(&args),
            Syscall::Mknod => sys_mknod(&args),
            Syscall::Unlink => sys_unlink(&args),
            Syscall::Link => sys_link(&args),
            Syscall::Mkdir => sys_mkdir(&args),
            Syscall::Close => sys_close(&args),
            Syscall::GetDirent => sys_get_dirent(&args),
            Syscall::Reboot => sys_reboot(&args),
            Syscall::GetTime => sys_get_time(&args),
            Syscall::Lseek => sys_lseek(&args),
            Syscall::Rmdir => sys_rmdir(&args),
            Syscall::Mount => sys_mount(&args),
            Syscall::Umount => sys_umount(&args),
            Syscall::Ioctl => sys_ioctl(&args),
        },
        Err(e) => Err(e),
    };

    trapframe.a0 = match result {
        Ok(v) => v,
        Err(error) => {
            #[cfg(debug_assertions)]
            crate::println!(
                "! syscall {} error ({}) from proc {} ({})",
                trapframe.a7,
                error,
                *proc.inner.lock().pid,
                proc.data().name,
            );
            (-(error.as_errno() as isize)) as usize
        }
    };
}
