use core::mem::{self, MaybeUninit};
use core::slice;

use alloc::sync::Arc;

use crate::device::{self, DeviceNumber};
use crate::error::KernelError;
use crate::fs::{self, BSIZE, DirEntry, Dirent, Inode, NAME_MAX, Stat};
use crate::log::Operation;
use crate::param::{MAX_FILES_SYSTEM, MAX_OP_BLOCKS};
use crate::pipe::Pipe;
use crate::proc::{self, Addr};
use crate::sleeplock::SleepLock;
use crate::spinlock::SpinLock;
use crate::vm::VA;

/// request file to be opened read-only
pub const O_RDONLY: usize = 0x000;
/// request file to be opened write-only
pub const O_WRONLY: usize = 0x001;
/// request file to be opened read-write
pub const O_RDWR: usize = 0x002;
/// create the file if it doesn't exist
pub const O_CREAT: usize = 0x200;
/// if the file exists and is writable, reset it to size 0
pub const O_TRUNC: usize = 0x400;
/// every write appends
pub const O_APPEND: usize = 0x800;

pub const SEEK_SET: usize = 0;
pub const SEEK_CUR: usize = 1;
pub const SEEK_END: usize = 2;

#[derive(Debug)]
pub enum FileType {
    None,
    Pipe { pipe: Arc<Pipe> },
    Inode { inode: Inode },
    Device { inode: Inode, dev: DeviceNumber },
}

/// Reference count, protected by the table-wide spinlock.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub ref_count: usize,
}

/// Per-file state, protected by the per-file sleep lock.
#[derive(Debug)]
pub struct FileInner {
    pub readable: bool,
    pub writeable: bool,
    pub append: bool,
    pub r#type: FileType,
    pub offset: u32,
}

pub static FILE_TABLE: FileTable = FileTable::new();

/// Global table of open files.
#[derive(Debug)]
pub struct FileTable {
    /// protects allocation and reference counts
    meta: SpinLock<[FileMeta; MAX_FILES_SYSTEM]>,
    /// per-file locks, so access to different files can overlap
    pub inner: [SleepLock<FileInner>; MAX_FILES_SYSTEM],
}

impl FileTable {
    const fn new() -> Self {
        let meta = {
            let mut array: [MaybeUninit<FileMeta>; MAX_FILES_SYSTEM] =
                unsafe { MaybeUninit::uninit().assume_init() };

            let mut i = 0;
            while i < MAX_FILES_SYSTEM {
                array[i] = MaybeUninit::new(FileMeta { ref_count: 0 });
                i += 1;
            }

            SpinLock::new(
                unsafe {
                    mem::transmute::<
                        [MaybeUninit<FileMeta>; MAX_FILES_SYSTEM],
                        [FileMeta; MAX_FILES_SYSTEM],
                    >(array)
                },
                "ftable",
            )
        };

        let inner = {
            let mut array: [MaybeUninit<SleepLock<FileInner>>; MAX_FILES_SYSTEM] =
                unsafe { MaybeUninit::uninit().assume_init() };

            let mut i = 0;
            while i < MAX_FILES_SYSTEM {
                array[i] = MaybeUninit::new(SleepLock::new(
                    FileInner {
                        readable: false,
                        writeable: false,
                        append: false,
                        r#type: FileType::None,
                        offset: 0,
                    },
                    "file",
                ));
                i += 1;
            }

            unsafe {
                mem::transmute::<
                    [MaybeUninit<SleepLock<FileInner>>; MAX_FILES_SYSTEM],
                    [SleepLock<FileInner>; MAX_FILES_SYSTEM],
                >(array)
            }
        };

        Self { meta, inner }
    }
}

/// Open file handle: an index into the file table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    pub id: usize,
}

impl File {
    /// Allocates a file structure with one reference.
    pub fn alloc() -> Result<Self, KernelError> {
        let mut meta = FILE_TABLE.meta.lock();

        for (i, meta) in meta.iter_mut().enumerate() {
            if meta.ref_count == 0 {
                meta.ref_count = 1;
                return Ok(Self { id: i });
            }
        }

        err!(KernelError::TooManyFiles);
    }

    /// Takes an additional reference on the open file.
    pub fn dup(&mut self) -> Self {
        let meta = &mut FILE_TABLE.meta.lock()[self.id];

        assert!(meta.ref_count >= 1, "file dup");
        meta.ref_count += 1;

        self.clone()
    }

    /// Drops a reference; the last one closes the file.
    pub fn close(&mut self) {
        let mut meta_guard = FILE_TABLE.meta.lock();
        let meta = &mut meta_guard[self.id];

        assert!(meta.ref_count >= 1, "file close");

        meta.ref_count -= 1;
        if meta.ref_count > 0 {
            return;
        }

        // the last reference: nobody else can be locking this file, so the
        // sleep lock cannot block
        let (old_type, writeable) = {
            let mut inner = FILE_TABLE.inner[self.id].lock();

            let old_type = mem::replace(&mut inner.r#type, FileType::None);
            let writeable = inner.writeable;
            inner.readable = false;
            inner.writeable = false;
            inner.append = false;
            inner.offset = 0;

            drop(meta_guard);
            (old_type, writeable)
        };

        match old_type {
            FileType::None => {}
            FileType::Pipe { pipe } => {
                pipe.close(writeable);
                // the Arc frees the pipe once both ends dropped it
            }
            FileType::Inode { inode } | FileType::Device { inode, .. } => {
                let _op = Operation::begin();
                inode.put();
            }
        }
    }

    /// Copies the file's metadata to user address `addr`.
    pub fn stat(&self, addr: VA) -> Result<(), KernelError> {
        let file_inner = FILE_TABLE.inner[self.id].lock();

        match &file_inner.r#type {
            FileType::Inode { inode } | FileType::Device { inode, .. } => {
                let inode_inner = inode.lock();
                let stat = inode.stat(&inode_inner);
                inode.unlock(inode_inner);

                let src = unsafe {
                    slice::from_raw_parts(&stat as *const Stat as *const u8, size_of::<Stat>())
                };
                try_log!(proc::copy_to_user(src, addr));

                Ok(())
            }
            _ => Err(KernelError::BadDescriptor),
        }
    }

    /// Reads from the file into user memory at `addr`.
    pub fn read(&self, addr: VA, n: usize) -> Result<usize, KernelError> {
        let mut file_inner = FILE_TABLE.inner[self.id].lock();

        if !file_inner.readable {
            err!(KernelError::BadDescriptor);
        }

        match &mut file_inner.r#type {
            FileType::None => panic!("file read"),

            FileType::Pipe { pipe } => {
                let pipe = Arc::clone(pipe);
                pipe.read(addr, n)
            }

            FileType::Inode { inode } => {
                let inode = inode.clone();
                let mut inode_inner = inode.lock();

                let read = log!(inode.read(
                    &mut inode_inner,
                    Addr::User(addr),
                    file_inner.offset,
                    n as u32,
                ));

                if let Ok(read) = read {
                    file_inner.offset += read;
                }

                inode.unlock(inode_inner);

                read.map(|r| r as usize)
            }

            FileType::Device { dev, .. } => {
                let dev = *dev;
                let device = try_log!(device::char_device(dev));
                (device.read)(Addr::User(addr), n)
            }
        }
    }

    /// Writes user memory at `addr` to the file.
    pub fn write(&mut self, addr: VA, n: usize) -> Result<usize, KernelError> {
        let mut file_inner = FILE_TABLE.inner[self.id].lock();

        if !file_inner.writeable {
            err!(KernelError::BadDescriptor);
        }

        match &mut file_inner.r#type {
            FileType::None => panic!("file write"),

            FileType::Pipe { pipe } => {
                let pipe = Arc::clone(pipe);
                pipe.write(addr, n)
            }

            FileType::Inode { inode } => {
                let inode = inode.clone();
                let append = file_inner.append;

                // write a few blocks at a time to avoid exceeding the
                // maximum log transaction size: inode, indirect blocks,
                // allocation blocks, and 2 blocks of slop for non-aligned
                // writes
                let max = ((MAX_OP_BLOCKS - 1 - 1 - 2) / 2) * BSIZE;
                let mut i = 0;

                while i < n {
                    let n1 = (n - i).min(max);

                    let _op = Operation::begin();
                    let mut inode_inner = inode.lock();

                    if append {
                        file_inner.offset = inode_inner.size;
                    }

                    let written = log!(inode.write(
                        &mut inode_inner,
                        Addr::User(addr + i),
                        file_inner.offset,
                        n1 as u32,
                    ));

                    if let Ok(written) = written {
                        file_inner.offset += written;
                    }

                    inode.unlock(inode_inner);
                    drop(_op);

                    match written {
                        Ok(written) if written as usize == n1 => i += n1,
                        // a short write: out of space or a bad address
                        _ => break,
                    }
                }

                if i == n {
                    Ok(n)
                } else {
                    err!(KernelError::Other);
                }
            }

            FileType::Device { dev, .. } => {
                let dev = *dev;
                let device = try_log!(device::char_device(dev));
                (device.write)(Addr::User(addr), n)
            }
        }
    }

    /// Moves the file offset; whence is SEEK_SET, SEEK_CUR or SEEK_END.
    /// Returns the new offset. Pipes cannot seek.
    pub fn seek(&self, offset: isize, whence: usize) -> Result<usize, KernelError> {
        let mut file_inner = FILE_TABLE.inner[self.id].lock();

        let base = match &file_inner.r#type {
            FileType::None => panic!("file seek"),
            FileType::Pipe { .. } => err!(KernelError::IllegalSeek),
            FileType::Device { .. } => 0,
            FileType::Inode { inode } => match whence {
                SEEK_SET => 0,
                SEEK_CUR => file_inner.offset as isize,
                SEEK_END => {
                    let inode = inode.clone();
                    let inode_inner = inode.lock();
                    let size = inode_inner.size;
                    inode.unlock(inode_inner);
                    size as isize
                }
                _ => err!(KernelError::InvalidArgument),
            },
        };

        let new_offset = base + offset;
        if new_offset < 0 {
            err!(KernelError::InvalidArgument);
        }

        file_inner.offset = new_offset as u32;
        Ok(new_offset as usize)
    }

    /// Reads the directory entry at `seek_pos` (a byte offset into the
    /// directory) into the user's `Dirent` at `addr`.
    /// Returns the seek position of the next entry, or 0 at the end.
    pub fn get_dirent(&self, addr: VA, seek_pos: i64) -> Result<usize, KernelError> {
        let file_inner = FILE_TABLE.inner[self.id].lock();

        let FileType::Inode { inode } = &file_inner.r#type else {
            err!(KernelError::NotADirectory);
        };

        let inode = inode.clone();
        let mut inode_inner = inode.lock();

        if !inode_inner.is_dir() {
            inode.unlock(inode_inner);
            err!(KernelError::NotADirectory);
        }

        if seek_pos < 0 || seek_pos as u32 % DirEntry::SIZE as u32 != 0 {
            inode.unlock(inode_inner);
            err!(KernelError::InvalidArgument);
        }

        // find the next allocated entry
        let mut offset = seek_pos as u32;
        let entry = loop {
            if offset >= inode_inner.size {
                inode.unlock(inode_inner);
                return Ok(0); // end of directory
            }

            let mut raw = [0u8; DirEntry::SIZE];
            let read = try_log!(inode.read(
                &mut inode_inner,
                Addr::Kernel(raw.as_mut_ptr() as usize),
                offset,
                DirEntry::SIZE as u32,
            ));
            assert_eq!(read as usize, DirEntry::SIZE, "get_dirent read");

            offset += DirEntry::SIZE as u32;

            let entry = unsafe { core::ptr::read_unaligned(raw.as_ptr() as *const DirEntry) };
            if entry.inum != 0 {
                break entry;
            }
        };

        // the entry's file type lives in the child inode. Read its mode
        // straight from the inode block: taking the child's sleep lock here
        // would deadlock on "." (the child is the directory we hold).
        let d_type = Dirent::mode_to_type(fs::disk_inode_mode(inode.dev, entry.inum as u32));

        inode.unlock(inode_inner);

        let mut dirent = Dirent {
            d_ino: entry.inum as u64,
            d_off: offset as i64,
            d_reclen: size_of::<Dirent>() as u16,
            d_type,
            d_name: [0; NAME_MAX + 1],
        };
        let name = entry.name_str().as_bytes();
        dirent.d_name[..name.len()].copy_from_slice(name);

        let src = unsafe {
            slice::from_raw_parts(&dirent as *const Dirent as *const u8, size_of::<Dirent>())
        };
        try_log!(proc::copy_to_user(src, addr));

        Ok(offset as usize)
    }
}
