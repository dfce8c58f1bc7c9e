use crate::error::KernelError;
use crate::proc::{self, Channel, Pid, current_proc};
use crate::rtc;
use crate::syscall::SyscallArgs;
use crate::syscon;
use crate::trap::TICKS;

/// reboot() commands
pub const REBOOT_CMD_POWER_OFF: isize = 1;
pub const REBOOT_CMD_RESTART: isize = 2;

pub fn sys_exit(args: &SyscallArgs) -> Result<usize, KernelError> {
    let status = args.get_int(0);
    proc::exit(status as i32);
}

pub fn sys_getpid(args: &SyscallArgs) -> Result<usize, KernelError> {
    Ok(*args.proc().inner.lock().pid)
}

pub fn sys_fork(_args: &SyscallArgs) -> Result<usize, KernelError> {
    log!(proc::fork()).map(|pid| *pid)
}

pub fn sys_wait(args: &SyscallArgs) -> Result<usize, KernelError> {
    let addr = args.get_addr(0);
    match proc::wait(addr) {
        Some(pid) => Ok(*pid),
        None => Err(KernelError::NoChildren),
    }
}

pub fn sys_sbrk(args: &SyscallArgs) -> Result<usize, KernelError> {
    let n = args.get_int(0);

    // returns the previous break on success
    unsafe { log!(proc::grow(n)) }
}

/// Sleeps for a number of clock ticks by waiting on the ticks channel.
pub fn sys_sleep(args: &SyscallArgs) -> Result<usize, KernelError> {
    let duration = args.get_int(0).max(0) as usize;

    let mut ticks = TICKS.lock();
    let ticks0 = *ticks;

    while *ticks - ticks0 < duration {
        if current_proc().is_killed() {
            return Err(KernelError::NotPermitted);
        }

        ticks = proc::sleep(Channel::Ticks, ticks);
    }

    Ok(0)
}

pub fn sys_kill(args: &SyscallArgs) -> Result<usize, KernelError> {
    let pid = args.get_int(0);

    if pid <= 0 {
        err!(KernelError::NoProcess);
    }

    proc::kill(Pid::from_usize(pid as usize)).map(|_| 0)
}

pub fn sys_uptime(_args: &SyscallArgs) -> Result<usize, KernelError> {
    Ok(*TICKS.lock())
}

pub fn sys_reboot(args: &SyscallArgs) -> Result<usize, KernelError> {
    match args.get_int(0) {
        REBOOT_CMD_POWER_OFF => {
            crate::println!("power off requested");
            syscon::power_off();
        }
        REBOOT_CMD_RESTART => {
            crate::println!("restart requested");
            syscon::restart();
        }
        _ => Err(KernelError::InvalidArgument),
    }
}

/// Wall clock time in seconds since the epoch, from the RTC.
pub fn sys_get_time(_args: &SyscallArgs) -> Result<usize, KernelError> {
    Ok(rtc::read_seconds() as usize)
}
