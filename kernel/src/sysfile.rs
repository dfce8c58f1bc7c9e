use core::mem;

use alloc::string::String;
use alloc::vec::Vec;

use crate::device::DeviceNumber;
use crate::error::KernelError;
use crate::exec::exec;
use crate::file::{
    FILE_TABLE, File, FileType, O_APPEND, O_CREAT, O_RDONLY, O_RDWR, O_TRUNC, O_WRONLY,
};
use crate::fs::{self, DirEntry, Inode, Path, mode};
use crate::log::Operation;
use crate::param::{MAX_DEVICES, MAX_EXEC_ARGS, MAX_PATH};
use crate::pipe::Pipe;
use crate::proc::current_proc_and_data_mut;
use crate::riscv::PGSIZE;
use crate::syscall::SyscallArgs;
use crate::vm::VA;

/// Allocates a file descriptor in the current process for `file`.
/// Takes over the file reference from the caller on success.
fn fd_alloc(file: File) -> Result<usize, KernelError> {
    let (_proc, data) = current_proc_and_data_mut();

    for (fd, open_file) in data.open_files.iter_mut().enumerate() {
        if open_file.is_none() {
            *open_file = Some(file);
            return Ok(fd);
        }
    }

    err!(KernelError::TooManyFiles)
}

pub fn sys_dup(args: &SyscallArgs) -> Result<usize, KernelError> {
    let (_, mut file) = try_log!(args.get_file(0));
    let fd = try_log!(fd_alloc(file.clone()));
    file.dup();
    Ok(fd)
}

pub fn sys_read(args: &SyscallArgs) -> Result<usize, KernelError> {
    let addr = args.get_addr(1);
    let n = args.get_int(2);
    if n < 0 {
        err!(KernelError::InvalidArgument);
    }
    let (_, file) = try_log!(args.get_file(0));
    log!(file.read(addr, n as usize))
}

pub fn sys_write(args: &SyscallArgs) -> Result<usize, KernelError> {
    let addr = args.get_addr(1);
    let n = args.get_int(2);
    if n < 0 {
        err!(KernelError::InvalidArgument);
    }
    let (_, mut file) = try_log!(args.get_file(0));
    log!(file.write(addr, n as usize))
}

pub fn sys_close(args: &SyscallArgs) -> Result<usize, KernelError> {
    let (fd, mut file) = try_log!(args.get_file(0));

    let (_proc, data) = current_proc_and_data_mut();

    data.open_files[fd] = None;
    file.close();

    Ok(0)
}

pub fn sys_fstat(args: &SyscallArgs) -> Result<usize, KernelError> {
    let addr = args.get_addr(1);
    let (_, file) = try_log!(args.get_file(0));
    try_log!(file.stat(addr));
    Ok(0)
}

pub fn sys_lseek(args: &SyscallArgs) -> Result<usize, KernelError> {
    let offset = args.get_int(1);
    let whence = args.get_raw(2);
    let (_, file) = try_log!(args.get_file(0));
    log!(file.seek(offset, whence))
}

pub fn sys_get_dirent(args: &SyscallArgs) -> Result<usize, KernelError> {
    let addr = args.get_addr(1);
    let seek_pos = args.get_int(2) as i64;
    let (_, file) = try_log!(args.get_file(0));
    log!(file.get_dirent(addr, seek_pos))
}

/// Creates a new hard link to an existing file.
pub fn sys_link(args: &SyscallArgs) -> Result<usize, KernelError> {
    let old = try_log!(args.fetch_string(args.get_addr(0), MAX_PATH));
    let new = try_log!(args.fetch_string(args.get_addr(1), MAX_PATH));

    let _op = Operation::begin();

    let old_inode = try_log!(Path::new(&old).resolve());

    let mut old_inner = old_inode.lock();

    // directories cannot be hard-linked
    if old_inner.is_dir() {
        old_inode.unlock_put(old_inner);
        err!(KernelError::IsADirectory);
    }

    old_inner.nlink += 1;
    old_inode.update(&old_inner);
    old_inode.unlock(old_inner);

    // from here on, failures must undo the nlink increment
    let result = (|| {
        let (parent, name) = try_log!(Path::new(&new).resolve_parent());

        // hard links do not cross devices
        if parent.dev != old_inode.dev {
            parent.put();
            err!(KernelError::InvalidArgument);
        }

        let mut parent_inner = parent.lock();

        if let Err(err) = log!(DirEntry::link(
            &parent,
            &mut parent_inner,
            name,
            old_inode.inum as u16
        )) {
            parent.unlock_put(parent_inner);
            return Err(err);
        }

        parent.unlock_put(parent_inner);
        Ok(0)
    })();

    if result.is_err() {
        let mut old_inner = old_inode.lock();
        old_inner.nlink -= 1;
        old_inode.update(&old_inner);
        old_inode.unlock(old_inner);
    }

    old_inode.put();

    result
}

/// Shared implementation of unlink (files) and rmdir (directories).
fn unlink_common(path: &str, want_dir: bool) -> Result<usize, KernelError> {
    let _op = Operation::begin();

    let (parent, name) = try_log!(Path::new(path).resolve_parent());

    let mut parent_inner = parent.lock();

    if name == "." || name == ".." {
        parent.unlock_put(parent_inner);
        err!(KernelError::InvalidArgument);
    }

    let Ok((offset, inode)) = log!(DirEntry::lookup(&parent, &mut parent_inner, name)) else {
        parent.unlock_put(parent_inner);
        err!(KernelError::NoEntry);
    };

    let mut inode_inner = inode.lock();

    assert!(inode_inner.nlink >= 1, "unlink: nlink < 1");

    if want_dir {
        if !inode_inner.is_dir() {
            inode.unlock_put(inode_inner);
            parent.unlock_put(parent_inner);
            err!(KernelError::NotADirectory);
        }

        if fs::is_mountpoint(&inode) {
            inode.unlock_put(inode_inner);
            parent.unlock_put(parent_inner);
            err!(KernelError::Other);
        }

        if !DirEntry::dir_is_empty(&inode, &mut inode_inner) {
            inode.unlock_put(inode_inner);
            parent.unlock_put(parent_inner);
            err!(KernelError::NotEmpty);
        }
    } else if inode_inner.is_dir() {
        inode.unlock_put(inode_inner);
        parent.unlock_put(parent_inner);
        err!(KernelError::IsADirectory);
    }

    // clear the directory entry
    let empty = DirEntry::new_empty();
    let written = try_log!(parent.write(
        &mut parent_inner,
        crate::proc::Addr::Kernel(empty.as_bytes().as_ptr() as usize),
        offset,
        DirEntry::SIZE as u32,
    ));
    assert_eq!(written as usize, DirEntry::SIZE, "unlink: entry write");

    if inode_inner.is_dir() {
        // the removed directory's ".." no longer references the parent
        parent_inner.nlink -= 1;
        parent.update(&parent_inner);
    }
    parent.unlock_put(parent_inner);

    inode_inner.nlink -= 1;
    inode.update(&inode_inner);
    inode.unlock_put(inode_inner);

    Ok(0)
}

pub fn sys_unlink(args: &SyscallArgs) -> Result<usize, KernelError> {
    let path = try_log!(args.fetch_string(args.get_addr(0), MAX_PATH));
    unlink_common(&path, false)
}

pub fn sys_rmdir(args: &SyscallArgs) -> Result<usize, KernelError> {
    let path = try_log!(args.fetch_string(args.get_addr(0), MAX_PATH));
    unlink_common(&path, true)
}

pub fn sys_open(args: &SyscallArgs) -> Result<usize, KernelError> {
    let flags = args.get_raw(1);
    let path = try_log!(args.fetch_string(args.get_addr(0), MAX_PATH));
    let path = Path::new(&path);

    let _op = Operation::begin();

    let (inode, mut inode_inner);

    if flags & O_CREAT != 0 {
        (inode, inode_inner) =
            try_log!(Inode::create(&path, mode::S_IFREG | 0o644, DeviceNumber::from_raw(0)));
    } else {
        inode = try_log!(path.resolve());

        inode_inner = inode.lock();

        // directories only open read-only
        if inode_inner.is_dir() && flags != O_RDONLY {
            inode.unlock_put(inode_inner);
            err!(KernelError::IsADirectory);
        }
    }

    // a device inode must name a sensible major number
    if inode_inner.is_device() && inode_inner.dev.major() >= MAX_DEVICES as u32 {
        inode.unlock_put(inode_inner);
        err!(KernelError::NoDevice);
    }

    let (fd, file) = match log!(File::alloc()) {
        Ok(mut file) => match log!(fd_alloc(file.clone())) {
            Ok(fd) => (fd, file),
            Err(err) => {
                file.close();
                inode.unlock_put(inode_inner);
                return Err(err);
            }
        },
        Err(err) => {
            inode.unlock_put(inode_inner);
            return Err(err);
        }
    };

    {
        let mut file_inner = FILE_TABLE.inner[file.id].lock();

        if inode_inner.is_device() {
            file_inner.r#type = FileType::Device {
                inode: inode.clone(),
                dev: inode_inner.dev,
            };
        } else {
            file_inner.r#type = FileType::Inode {
                inode: inode.clone(),
            };
        }
        file_inner.offset = 0;
        file_inner.readable = flags & O_WRONLY == 0;
        file_inner.writeable = flags & O_WRONLY != 0 || flags & O_RDWR != 0;
        file_inner.append = flags & O_APPEND != 0;
    }

    if flags & O_TRUNC != 0 && mode::is_reg(inode_inner.mode) {
        inode.trunc(&mut inode_inner);
    }

    inode.unlock(inode_inner);

    Ok(fd)
}

pub fn sys_mkdir(args: &SyscallArgs) -> Result<usize, KernelError> {
    let path = try_log!(args.fetch_string(args.get_addr(0), MAX_PATH));

    let _op = Operation::begin();

    let (inode, inode_inner) = try_log!(Inode::create(
        &Path::new(&path),
        mode::S_IFDIR | 0o755,
        DeviceNumber::from_raw(0),
    ));

    inode.unlock_put(inode_inner);

    Ok(0)
}

/// mknod(path, mode, dev): creates a device inode. `mode` carries the
/// S_IFCHR/S_IFBLK type bit, `dev` the packed major/minor number.
pub fn sys_mknod(args: &SyscallArgs) -> Result<usize, KernelError> {
    let node_mode = args.get_raw(1) as u32;
    let dev = DeviceNumber::from_raw(args.get_raw(2) as u32);
    let path = try_log!(args.fetch_string(args.get_addr(0), MAX_PATH));

    if !mode::is_device(node_mode) || dev.major() >= MAX_DEVICES as u32 {
        err!(KernelError::InvalidArgument);
    }

    let _op = Operation::begin();

    let (inode, inode_inner) = try_log!(Inode::create(&Path::new(&path), node_mode, dev));

    inode.unlock_put(inode_inner);

    Ok(0)
}

pub fn sys_chdir(args: &SyscallArgs) -> Result<usize, KernelError> {
    let (_proc, data) = current_proc_and_data_mut();

    let path = try_log!(args.fetch_string(args.get_addr(0), MAX_PATH));

    let _op = Operation::begin();

    let inode = try_log!(Path::new(&path).resolve());

    let inner = inode.lock();

    if !inner.is_dir() {
        inode.unlock_put(inner);
        err!(KernelError::NotADirectory);
    }

    inode.unlock(inner);

    let old_cwd = mem::replace(&mut data.cwd, Some(inode));
    if let Some(old_cwd) = old_cwd {
        old_cwd.put();
    }

    Ok(0)
}

pub fn sys_execv(args: &SyscallArgs) -> Result<usize, KernelError> {
    let uargv = args.get_addr(1);

    let path = try_log!(args.fetch_string(args.get_addr(0), MAX_PATH));
    let path = Path::new(&path);

    let (_proc, data) = current_proc_and_data_mut();

    let mut argv_bufs: Vec<String> = Vec::with_capacity(MAX_EXEC_ARGS);

    for i in 0..MAX_EXEC_ARGS {
        // fetch the pointer argv[i] from user space
        let mut uarg = 0usize.to_le_bytes();
        try_log!(
            data.pagetable_mut()
                .copy_in(&mut uarg, uargv + i * size_of::<usize>())
                .map_err(|_| KernelError::BadAddress)
        );
        let uarg = usize::from_le_bytes(uarg);

        if uarg == 0 {
            break; // NULL terminator
        }

        // then the string it points at
        let arg = try_log!(args.fetch_string(VA::from(uarg), PGSIZE));
        argv_bufs.push(arg);
    }

    let argv: Vec<&str> = argv_bufs.iter().map(String::as_str).collect();

    log!(exec(&path, &argv))
}

pub fn sys_pipe(args: &SyscallArgs) -> Result<usize, KernelError> {
    // user pointer to an array of two integers
    let fd_array = args.get_addr(0);

    let (_proc, data) = current_proc_and_data_mut();

    let (mut read, mut write) = try_log!(Pipe::alloc());

    let Ok(fd0) = log!(fd_alloc(read.clone())) else {
        read.close();
        write.close();
        err!(KernelError::TooManyFiles);
    };

    let Ok(fd1) = log!(fd_alloc(write.clone())) else {
        data.open_files[fd0] = None;
        read.close();
        write.close();
        err!(KernelError::TooManyFiles);
    };

    let pagetable = data.pagetable_mut();

    let fd0_bytes = (fd0 as i32).to_le_bytes();
    let fd1_bytes = (fd1 as i32).to_le_bytes();

    if log!(pagetable.copy_out(&fd0_bytes, fd_array)).is_err()
        || log!(pagetable.copy_out(&fd1_bytes, fd_array + size_of::<i32>())).is_err()
    {
        data.open_files[fd0] = None;
        data.open_files[fd1] = None;
        read.close();
        write.close();
        err!(KernelError::BadAddress);
    }

    Ok(0)
}

/// Mounts the file system on the block device `source` at the directory
/// `target`.
pub fn sys_mount(args: &SyscallArgs) -> Result<usize, KernelError> {
    let source = try_log!(args.fetch_string(args.get_addr(0), MAX_PATH));
    let target = try_log!(args.fetch_string(args.get_addr(1), MAX_PATH));

    let source_dev = {
        let _op = Operation::begin();

        let source_inode = try_log!(Path::new(&source).resolve());
        let source_inner = source_inode.lock();

        if !mode::is_blk(source_inner.mode) {
            source_inode.unlock_put(source_inner);
            err!(KernelError::NotABlockDevice);
        }

        let dev = source_inner.dev;
        source_inode.unlock_put(source_inner);
        dev
    };

    let target_inode = {
        let _op = Operation::begin();

        let target_inode = try_log!(Path::new(&target).resolve());
        let target_inner = target_inode.lock();

        if !target_inner.is_dir() {
            target_inode.unlock_put(target_inner);
            err!(KernelError::NotADirectory);
        }

        target_inode.unlock(target_inner);
        target_inode
    };

    let result = log!(fs::mount_fs(source_dev, &target_inode));

    let _op = Operation::begin();
    target_inode.put();

    result.map(|_| 0)
}

/// Unmounts the file system whose root is mounted at `target`.
pub fn sys_umount(args: &SyscallArgs) -> Result<usize, KernelError> {
    let target = try_log!(args.fetch_string(args.get_addr(0), MAX_PATH));

    // no transaction around the resolve: umount must observe its own
    // reference as the only one, and the target's log goes away below
    let target_inode = try_log!(Path::new(&target).resolve());

    let result = log!(fs::umount_fs(&target_inode));

    // this reference is the last one on an unmounted volume; dropping it
    // only touches the in-memory table
    target_inode.put();

    result.map(|_| 0)
}

pub fn sys_ioctl(args: &SyscallArgs) -> Result<usize, KernelError> {
    let request = args.get_raw(1);
    let arg = args.get_addr(2);
    let (_, file) = try_log!(args.get_file(0));

    let file_inner = FILE_TABLE.inner[file.id].lock();

    let FileType::Device { dev, .. } = &file_inner.r#type else {
        err!(KernelError::NoDevice);
    };

    let device = try_log!(crate::device::char_device(*dev));

    match device.ioctl {
        Some(ioctl) => ioctl(request, arg),
        None => Err(KernelError::NotATty),
    }
}
