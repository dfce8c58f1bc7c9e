use core::mem::{self, MaybeUninit};
use core::ptr;
use core::slice;

use crate::buf::{BCACHE, Buf};
use crate::device::{DeviceNumber, ROOT_DEVICE};
use crate::error::KernelError;
use crate::log::{self, Operation};
use crate::param::{MAX_ACTIVE_INODES, MAX_MOUNTED_FILE_SYSTEMS};
use crate::proc::{self, Addr};
use crate::rtc;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::println;
use crate::spinlock::{RwSpinLock, SpinLock};

/// vimixfs magic number
pub const VIMIXFS_MAGIC: u32 = 0x10203042;

/// root i-number, on every vimixfs volume
pub const ROOT_INODE: u32 = 1;
/// block size
pub const BSIZE: usize = 1024;
/// which block on the device contains the superblock
pub const SUPER_BLOCK_NUMBER: u32 = 1;

/// number of blocks an inode points to directly
pub const N_DIRECT: usize = 21;
/// number of block addresses in one indirect block
pub const N_INDIRECT: usize = BSIZE / size_of::<u32>();
/// blocks reachable through the double-indirect block
pub const N_DOUBLE_INDIRECT: usize = N_INDIRECT * N_INDIRECT;
/// max file size in blocks
pub const MAX_FILE_BLOCKS: usize = N_DIRECT + N_INDIRECT + N_DOUBLE_INDIRECT;

/// addrs[] slot of the indirect block
const INDIRECT_SLOT: usize = N_DIRECT;
/// addrs[] slot of the double-indirect block
const DOUBLE_INDIRECT_SLOT: usize = N_DIRECT + 1;
/// data block addresses per inode
pub const N_ADDRS: usize = N_DIRECT + 2;

/// inodes per block (the on-disk inode does not divide the block size
/// evenly; the remainder of each block is unused)
pub const IPB: u32 = (BSIZE / size_of::<DiskInode>()) as u32;
/// bitmap bits per block
pub const BPB: u32 = (BSIZE * 8) as u32;

/// max file name length (without a NUL terminator)
pub const NAME_MAX: usize = 14;

/// File type and permission bits for the inode `mode` field; values from
/// Minix/Linux. A free on-disk inode has mode zero.
pub mod mode {
    pub const S_IFMT: u32 = 0o170000;
    pub const S_IFREG: u32 = 0o100000;
    pub const S_IFBLK: u32 = 0o060000;
    pub const S_IFDIR: u32 = 0o040000;
    pub const S_IFCHR: u32 = 0o020000;
    pub const S_IFIFO: u32 = 0o010000;

    pub const fn is_reg(m: u32) -> bool {
        m & S_IFMT == S_IFREG
    }

    pub const fn is_dir(m: u32) -> bool {
        m & S_IFMT == S_IFDIR
    }

    pub const fn is_chr(m: u32) -> bool {
        m & S_IFMT == S_IFCHR
    }

    pub const fn is_blk(m: u32) -> bool {
        m & S_IFMT == S_IFBLK
    }

    pub const fn is_device(m: u32) -> bool {
        is_chr(m) || is_blk(m)
    }
}

/// On-disk superblock, written by mkfs and read at mount.
///
/// Disk layout:
/// [ boot block | super block | log | inode blocks | free bit map | data ]
#[repr(C)]
#[derive(Debug, Clone)]
pub struct SuperBlock {
    /// must be VIMIXFS_MAGIC
    pub magic: u32,
    /// size of file system image (blocks)
    pub size: u32,
    /// number of data blocks
    pub nblocks: u32,
    /// number of inodes
    pub ninodes: u32,
    /// number of log blocks
    pub nlog: u32,
    /// block number of the first log block
    pub logstart: u32,
    /// block number of the first inode block
    pub inodestart: u32,
    /// block number of the first free map block
    pub bmapstart: u32,
}

impl SuperBlock {
    /// Reads a device's superblock.
    fn read_from(dev: DeviceNumber) -> Result<Self, KernelError> {
        let buf = BCACHE.read(dev, SUPER_BLOCK_NUMBER);
        let sb = unsafe { ptr::read_unaligned(buf.data().as_ptr() as *const SuperBlock) };
        BCACHE.release(buf);

        if sb.magic != VIMIXFS_MAGIC {
            err!(KernelError::InvalidArgument);
        }

        Ok(sb)
    }

    /// Block containing inode `inum`.
    fn block_of_inode(&self, inum: u32) -> u32 {
        inum / IPB + self.inodestart
    }

    /// Block of the free map containing the bit for block `b`.
    fn block_of_bmap_bit(&self, b: u32) -> u32 {
        b / BPB + self.bmapstart
    }
}

/// One mounted file system.
pub struct MountedFs {
    pub dev: DeviceNumber,
    pub sb: SuperBlock,
    /// directory inode this file system is mounted on; None for the root fs.
    /// The table holds a reference on it until unmount.
    pub mounted_on: Option<Inode>,
}

/// All mounted file systems; slot 0 is the root. The gate is reader-mostly:
/// every path crossing reads it, only mount/umount write it. No sleeping
/// (disk I/O, sleeplocks) happens under the gate.
pub static MOUNTS: RwSpinLock<[Option<MountedFs>; MAX_MOUNTED_FILE_SYSTEMS]> =
    RwSpinLock::new([const { None }; MAX_MOUNTED_FILE_SYSTEMS], "mounts");

/// Serializes mount/umount against each other (they sleep while preparing,
/// which the gate cannot).
static MOUNT_LOCK: SleepLock<()> = SleepLock::new((), "mount");

/// Copy of the superblock for `dev`.
pub fn superblock(dev: DeviceNumber) -> Result<SuperBlock, KernelError> {
    let mounts = MOUNTS.read();
    mounts
        .iter()
        .flatten()
        .find(|m| m.dev == dev)
        .map(|m| m.sb.clone())
        .ok_or(KernelError::NoDevice)
}

/// If a file system is mounted on `inode`, returns a fresh reference to
/// that file system's root.
fn mounted_root_on(inode: &Inode) -> Result<Option<Inode>, KernelError> {
    let mounts = MOUNTS.read();

    for mount in mounts.iter().flatten() {
        if let Some(on) = &mount.mounted_on
            && on.dev == inode.dev
            && on.inum == inode.inum
        {
            return Inode::get(mount.dev, ROOT_INODE).map(Some);
        }
    }

    Ok(None)
}

/// True if a file system is mounted on `inode`.
pub fn is_mountpoint(inode: &Inode) -> bool {
    let mounts = MOUNTS.read();
    mounts.iter().flatten().any(|m| {
        m.mounted_on
            .as_ref()
            .is_some_and(|on| on.dev == inode.dev && on.inum == inode.inum)
    })
}

/// If `inode` is the root of a mounted (non-root) file system, returns a
/// fresh reference to the inode it is mounted on.
fn mount_point_of(inode: &Inode) -> Option<Inode> {
    if inode.inum != ROOT_INODE {
        return None;
    }

    let mounts = MOUNTS.read();
    mounts
        .iter()
        .flatten()
        .find(|m| m.dev == inode.dev)
        .and_then(|m| m.mounted_on.as_ref())
        .map(Inode::dup)
}

/// Mounts the root file system from `dev` and replays its log.
/// Runs in process context (the first fork_ret), because everything here
/// sleeps on disk I/O.
pub fn init_root(dev: DeviceNumber) {
    let sb = SuperBlock::read_from(dev).expect("root file system");

    log::install(0, dev, &sb);

    {
        let mut mounts = MOUNTS.write();
        mounts[0] = Some(MountedFs {
            dev,
            sb,
            mounted_on: None,
        });
    }

    Inode::reclaim(dev);

    println!("vimixfs: root mounted from {}:{}", dev.major(), dev.minor());
}

/// Mounts the file system on block device `source` onto the directory
/// `target`. The caller resolved both inodes and keeps its references.
pub fn mount_fs(source: DeviceNumber, target: &Inode) -> Result<(), KernelError> {
    let _serial = MOUNT_LOCK.lock();

    {
        let mounts = MOUNTS.read();

        if mounts.iter().flatten().any(|m| m.dev == source) {
            err!(KernelError::Other); // already mounted
        }

        if mounts.iter().flatten().any(|m| {
            m.mounted_on
                .as_ref()
                .is_some_and(|on| on.dev == target.dev && on.inum == target.inum)
        }) {
            err!(KernelError::Other); // target is already a mountpoint
        }

        if !mounts.iter().any(|m| m.is_none()) {
            err!(KernelError::Other); // no free slot
        }
    }

    // reads the disk, so outside the gate; MOUNT_LOCK keeps the free slot
    // from racing away
    let sb = try_log!(SuperBlock::read_from(source));

    let slot = {
        let mounts = MOUNTS.read();
        mounts.iter().position(|m| m.is_none()).unwrap()
    };

    // replay whatever a crash left in the new volume's log
    log::install(slot, source, &sb);

    {
        let mut mounts = MOUNTS.write();
        mounts[slot] = Some(MountedFs {
            dev: source,
            sb,
            mounted_on: Some(target.dup()),
        });
    }

    Inode::reclaim(source);

    Ok(())
}

/// Unmounts the file system whose root is `target` (the caller's reference).
/// Fails if anything on that file system is still in use.
pub fn umount_fs(target: &Inode) -> Result<(), KernelError> {
    let _serial = MOUNT_LOCK.lock();

    let slot = {
        let mounts = MOUNTS.read();

        let Some(slot) = mounts.iter().position(|m| {
            m.as_ref()
                .is_some_and(|m| m.dev == target.dev && m.mounted_on.is_some())
        }) else {
            err!(KernelError::InvalidArgument);
        };

        if target.inum != ROOT_INODE {
            err!(KernelError::InvalidArgument);
        }

        slot
    };

    // busy check: the only live reference to this device may be the
    // caller's one on the root inode
    if INODE_TABLE.refs_on_dev(target.dev) > 1 {
        err!(KernelError::Other);
    }

    let mountpoint = {
        let mut mounts = MOUNTS.write();
        let fs = mounts[slot].take().unwrap();
        fs.mounted_on.unwrap()
    };

    // the new volume's log is idle (no refs, no outstanding ops)
    log::deinit(slot);

    // release the table's reference on the mountpoint
    let _op = Operation::begin();
    mountpoint.put();

    Ok(())
}

/// A disk block address on a particular device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block(pub u32);

impl Block {
    /// Zeroes the block's contents.
    fn zero(&mut self, dev: DeviceNumber) {
        let mut buf = BCACHE.read(dev, self.0);
        buf.data_mut().fill(0);
        log::write(&buf);
        BCACHE.release(buf);
    }

    /// Allocates a zeroed disk block through the bitmap.
    pub fn alloc(dev: DeviceNumber) -> Result<Self, KernelError> {
        let sb = superblock(dev)?;

        for b in (0..sb.size).step_by(BPB as usize) {
            let mut buf = BCACHE.read(dev, sb.block_of_bmap_bit(b));

            for bi in 0..BPB {
                if b + bi >= sb.size {
                    break;
                }

                let m = 1u8 << (bi % 8);
                if buf.data()[bi as usize / 8] & m == 0 {
                    // the block is free; mark it in use
                    buf.data_mut()[bi as usize / 8] |= m;
                    log::write(&buf);
                    BCACHE.release(buf);

                    let mut block = Self(b + bi);
                    block.zero(dev);

                    return Ok(block);
                }
            }

            BCACHE.release(buf);
        }

        Err(KernelError::Other) // out of blocks
    }

    /// Frees a disk block in the bitmap.
    pub fn free(self, dev: DeviceNumber) {
        let sb = superblock(dev).expect("bfree on unmounted device");
        let mut buf = BCACHE.read(dev, sb.block_of_bmap_bit(self.0));
        let bi = self.0 % BPB;
        let m = 1u8 << (bi % 8);

        if buf.data()[bi as usize / 8] & m == 0 {
            panic!("bfree: block already free");
        }

        buf.data_mut()[bi as usize / 8] &= !m;
        log::write(&buf);
        BCACHE.release(buf);
    }
}

/// On-disk inode. `mode` carries the file type (S_IFMT) and permission
/// bits; mode zero marks the slot free. `dev` is only meaningful for
/// device inodes.
#[repr(C)]
#[derive(Debug)]
pub struct DiskInode {
    pub mode: u32,
    pub dev: i32,
    pub nlink: u32,
    pub size: u32,
    pub uid: i32,
    pub gid: i32,
    pub ctime: i64,
    pub mtime: i64,
    pub addrs: [u32; N_ADDRS],
    /// keeps the struct free of implicit padding, so the on-disk bytes are
    /// fully determined
    pub pad: u32,
}

impl DiskInode {
    /// Returns a mutable reference to inode `inum` within `buf`.
    ///
    /// # Safety
    /// `buf` must hold the inode block containing `inum`.
    unsafe fn from_buf(buf: &mut Buf<'_>, inum: u32) -> &'static mut Self {
        unsafe {
            &mut *(buf
                .data_mut()
                .as_mut_ptr()
                .add((inum % IPB) as usize * size_of::<DiskInode>())
                as *mut DiskInode)
        }
    }
}

/// File metadata returned by fstat.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    /// device of the file system holding the file
    pub dev: i32,
    pub ino: u64,
    pub mode: u32,
    pub nlink: i16,
    /// device number if the file is a char/block device
    pub rdev: i32,
    pub size: u64,
    pub blksize: u64,
    /// number of 512-byte blocks allocated
    pub blocks: u64,
}

/// Cached on-disk inode fields, protected by the inode's sleep lock.
#[derive(Debug)]
pub struct InodeInner {
    /// has been read from disk?
    pub valid: bool,
    pub mode: u32,
    /// device number for device inodes
    pub dev: DeviceNumber,
    pub nlink: u32,
    pub size: u32,
    pub uid: i32,
    pub gid: i32,
    pub ctime: i64,
    pub mtime: i64,
    pub addrs: [u32; N_ADDRS],
}

impl InodeInner {
    const fn new() -> Self {
        Self {
            valid: false,
            mode: 0,
            dev: DeviceNumber::from_raw(0),
            nlink: 0,
            size: 0,
            uid: 0,
            gid: 0,
            ctime: 0,
            mtime: 0,
            addrs: [0; N_ADDRS],
        }
    }

    pub fn is_dir(&self) -> bool {
        mode::is_dir(self.mode)
    }

    pub fn is_device(&self) -> bool {
        mode::is_device(self.mode)
    }
}

/// Inode identity and reference count, protected by the table spinlock.
struct InodeMeta {
    dev: DeviceNumber,
    inum: u32,
    r#ref: u32,
}

impl InodeMeta {
    const fn new() -> Self {
        Self {
            dev: DeviceNumber::from_raw(0),
            inum: 0,
            r#ref: 0,
        }
    }
}

pub static INODE_TABLE: InodeTable = InodeTable::new();

/// In-memory inode cache: identity/refcount under one spinlock, cached disk
/// fields under a per-slot sleep lock.
pub struct InodeTable {
    meta: SpinLock<[InodeMeta; MAX_ACTIVE_INODES]>,
    inner: [SleepLock<InodeInner>; MAX_ACTIVE_INODES],
}

impl InodeTable {
    const fn new() -> Self {
        let meta = {
            let mut array: [MaybeUninit<InodeMeta>; MAX_ACTIVE_INODES] =
                unsafe { MaybeUninit::uninit().assume_init() };

            let mut i = 0;
            while i < MAX_ACTIVE_INODES {
                array[i] = MaybeUninit::new(InodeMeta::new());
                i += 1;
            }

            SpinLock::new(
                unsafe {
                    mem::transmute::<
                        [MaybeUninit<InodeMeta>; MAX_ACTIVE_INODES],
                        [InodeMeta; MAX_ACTIVE_INODES],
                    >(array)
                },
                "itable",
            )
        };

        let inner = {
            let mut array: [MaybeUninit<SleepLock<InodeInner>>; MAX_ACTIVE_INODES] =
                unsafe { MaybeUninit::uninit().assume_init() };

            let mut i = 0;
            while i < MAX_ACTIVE_INODES {
                array[i] = MaybeUninit::new(SleepLock::new(InodeInner::new(), "inode"));
                i += 1;
            }

            unsafe {
                mem::transmute::<
                    [MaybeUninit<SleepLock<InodeInner>>; MAX_ACTIVE_INODES],
                    [SleepLock<InodeInner>; MAX_ACTIVE_INODES],
                >(array)
            }
        };

        Self { meta, inner }
    }

    /// Total reference count held on inodes of `dev`; the umount busy check.
    pub fn refs_on_dev(&self, dev: DeviceNumber) -> usize {
        let meta = self.meta.lock();
        meta.iter()
            .filter(|m| m.r#ref > 0 && m.dev == dev)
            .map(|m| m.r#ref as usize)
            .sum()
    }
}

/// Handle on an in-memory inode: the table slot plus the identity, so most
/// operations need no table lock. Cloning copies the handle without taking
/// a new reference; use `dup()` for that.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    /// inode table index
    pub id: usize,
    pub dev: DeviceNumber,
    pub inum: u32,
}

impl Inode {
    /// Allocates an on-disk inode on `dev` with the given mode (and device
    /// number, for device inodes).
    /// Returns an unlocked but allocated and referenced inode.
    pub fn alloc(
        dev: DeviceNumber,
        mode: u32,
        rdev: DeviceNumber,
    ) -> Result<Self, KernelError> {
        assert!(mode != 0, "inode alloc without mode");
        let sb = superblock(dev)?;
        let now = rtc::read_seconds();

        for inum in 1..sb.ninodes {
            let mut buf = BCACHE.read(dev, sb.block_of_inode(inum));
            let dinode = unsafe { DiskInode::from_buf(&mut buf, inum) };

            if dinode.mode == 0 {
                // a free inode; claim it
                *dinode = DiskInode {
                    mode,
                    dev: rdev.as_raw() as i32,
                    nlink: 0,
                    size: 0,
                    uid: 0,
                    gid: 0,
                    ctime: now,
                    mtime: now,
                    addrs: [0; N_ADDRS],
                    pad: 0,
                };
                log::write(&buf);
                BCACHE.release(buf);
                return Self::get(dev, inum);
            }

            BCACHE.release(buf);
        }

        Err(KernelError::Other) // out of inodes
    }

    /// Finds the in-memory inode for (`dev`, `inum`), allocating a table
    /// slot if needed. Does not lock it or read it from disk.
    pub fn get(dev: DeviceNumber, inum: u32) -> Result<Self, KernelError> {
        let mut meta = INODE_TABLE.meta.lock();

        let mut empty = None;

        for (id, slot) in meta.iter_mut().enumerate() {
            if slot.r#ref > 0 && slot.dev == dev && slot.inum == inum {
                slot.r#ref += 1;
                return Ok(Self { id, dev, inum });
            }

            if empty.is_none() && slot.r#ref == 0 {
                empty = Some(id);
            }
        }

        let Some(id) = empty else {
            return Err(KernelError::Other); // inode table exhausted
        };

        let slot = &mut meta[id];
        slot.dev = dev;
        slot.inum = inum;
        slot.r#ref = 1;

        // # Safety: exclusive access, the slot's ref count was 0
        let inner = unsafe { INODE_TABLE.inner[id].get_mut_unchecked() };
        inner.valid = false;

        Ok(Self { id, dev, inum })
    }

    /// Increments the reference count.
    /// Returns a handle to enable the `inode = other.dup()` idiom.
    pub fn dup(&self) -> Self {
        let mut meta = INODE_TABLE.meta.lock();
        meta[self.id].r#ref += 1;
        Self {
            id: self.id,
            dev: self.dev,
            inum: self.inum,
        }
    }

    /// Locks the inode, reading it from disk if necessary.
    /// The guard lifetime is static since the slot lives in the table.
    pub fn lock(&self) -> SleepLockGuard<'static, InodeInner> {
        let mut inner = INODE_TABLE.inner[self.id].lock();

        if !inner.valid {
            let sb = superblock(self.dev).expect("inode on unmounted device");

            let mut buf = BCACHE.read(self.dev, sb.block_of_inode(self.inum));
            let dinode = unsafe { DiskInode::from_buf(&mut buf, self.inum) };

            inner.mode = dinode.mode;
            inner.dev = DeviceNumber::from_raw(dinode.dev as u32);
            inner.nlink = dinode.nlink;
            inner.size = dinode.size;
            inner.uid = dinode.uid;
            inner.gid = dinode.gid;
            inner.ctime = dinode.ctime;
            inner.mtime = dinode.mtime;
            inner.addrs.copy_from_slice(&dinode.addrs);

            BCACHE.release(buf);

            inner.valid = true;
            assert_ne!(inner.mode, 0, "inode lock: free inode");
        }

        inner
    }

    pub fn unlock(&self, guard: SleepLockGuard<'static, InodeInner>) {
        drop(guard);
    }

    /// Copies a modified in-memory inode to disk. Must be called after
    /// every change to a field that lives on disk, inside a transaction.
    pub fn update(&self, inner: &SleepLockGuard<'_, InodeInner>) {
        let sb = superblock(self.dev).expect("inode on unmounted device");

        let mut buf = BCACHE.read(self.dev, sb.block_of_inode(self.inum));
        let dinode = unsafe { DiskInode::from_buf(&mut buf, self.inum) };

        dinode.mode = inner.mode;
        dinode.dev = inner.dev.as_raw() as i32;
        dinode.nlink = inner.nlink;
        dinode.size = inner.size;
        dinode.uid = inner.uid;
        dinode.gid = inner.gid;
        dinode.ctime = inner.ctime;
        dinode.mtime = inner.mtime;
        dinode.addrs.copy_from_slice(&inner.addrs);

        log::write(&buf);
        BCACHE.release(buf);
    }

    /// Drops a reference to an in-memory inode. If this was the last
    /// reference and the inode has no links, the inode (and its content) is
    /// freed on disk. Every call must be inside a transaction, for that
    /// case.
    pub fn put(self) {
        let mut meta = INODE_TABLE.meta.lock();

        if meta[self.id].r#ref == 1 {
            // ref == 1 means nobody else has the inode locked, so the
            // sleep lock below cannot block
            let mut inner = INODE_TABLE.inner[self.id].lock();

            if inner.valid && inner.nlink == 0 {
                // no links and no other references: truncate and free

                drop(meta);

                self.trunc(&mut inner);
                inner.mode = 0;
                self.update(&inner);
                inner.valid = false;

                drop(inner);

                meta = INODE_TABLE.meta.lock();
            }
        }

        meta[self.id].r#ref -= 1;
    }

    /// Common idiom: unlock, then put.
    pub fn unlock_put(self, guard: SleepLockGuard<'static, InodeInner>) {
        self.unlock(guard);
        self.put();
    }

    /// Frees orphaned inodes (no links, but allocated: a crash during
    /// unlink-while-open) on `dev`. Called while mounting.
    pub fn reclaim(dev: DeviceNumber) {
        let sb = superblock(dev).expect("reclaim on unmounted device");

        for inum in 1..sb.ninodes {
            let orphaned = {
                let mut buf = BCACHE.read(dev, sb.block_of_inode(inum));
                let dinode = unsafe { DiskInode::from_buf(&mut buf, inum) };
                let orphaned = dinode.mode != 0 && dinode.nlink == 0;
                BCACHE.release(buf);
                orphaned
            };

            if orphaned {
                println!("vimixfs: reclaiming orphaned inode {}", inum);

                let inode = Inode::get(dev, inum).expect("reclaim inode");

                let _op = Operation::begin();
                let guard = inode.lock();
                inode.unlock(guard);
                inode.put();
            }
        }
    }

    /// Truncates the inode: frees all content blocks, zeroes the size.
    pub fn trunc(&self, inner: &mut SleepLockGuard<'_, InodeInner>) {
        for i in 0..N_DIRECT {
            if inner.addrs[i] != 0 {
                Block(inner.addrs[i]).free(self.dev);
                inner.addrs[i] = 0;
            }
        }

        if inner.addrs[INDIRECT_SLOT] != 0 {
            self.free_indirect(inner.addrs[INDIRECT_SLOT], false);
            inner.addrs[INDIRECT_SLOT] = 0;
        }

        if inner.addrs[DOUBLE_INDIRECT_SLOT] != 0 {
            self.free_indirect(inner.addrs[DOUBLE_INDIRECT_SLOT], true);
            inner.addrs[DOUBLE_INDIRECT_SLOT] = 0;
        }

        inner.size = 0;
        self.update(inner);
    }

    /// Frees an indirect block and everything below it.
    fn free_indirect(&self, block: u32, double: bool) {
        let buf = BCACHE.read(self.dev, block);
        let entries =
            unsafe { slice::from_raw_parts(buf.data().as_ptr() as *const u32, N_INDIRECT) };

        for &entry in entries {
            if entry != 0 {
                if double {
                    self.free_indirect(entry, false);
                } else {
                    Block(entry).free(self.dev);
                }
            }
        }

        BCACHE.release(buf);
        Block(block).free(self.dev);
    }

    /// Returns the disk address of the `bn`th content block, allocating it
    /// (and any needed indirect blocks) through the bitmap.
    pub fn map(
        &self,
        inner: &mut SleepLockGuard<'_, InodeInner>,
        bn: u32,
    ) -> Result<u32, KernelError> {
        let mut bn = bn as usize;

        if bn < N_DIRECT {
            let addr = &mut inner.addrs[bn];
            if *addr == 0 {
                *addr = Block::alloc(self.dev)?.0;
            }
            return Ok(*addr);
        }

        bn -= N_DIRECT;

        if bn < N_INDIRECT {
            // load the indirect block, allocating if necessary
            let indirect = &mut inner.addrs[INDIRECT_SLOT];
            if *indirect == 0 {
                *indirect = Block::alloc(self.dev)?.0;
            }

            return self.map_through(*indirect, bn);
        }

        bn -= N_INDIRECT;

        if bn < N_DOUBLE_INDIRECT {
            let double = &mut inner.addrs[DOUBLE_INDIRECT_SLOT];
            if *double == 0 {
                *double = Block::alloc(self.dev)?.0;
            }

            // first level: which indirect block
            let indirect = self.map_through(*double, bn / N_INDIRECT)?;
            // second level: the data block
            return self.map_through(indirect, bn % N_INDIRECT);
        }

        Err(KernelError::InvalidArgument) // out of range
    }

    /// Looks up (allocating on demand) slot `index` of the address block
    /// `block`.
    fn map_through(&self, block: u32, index: usize) -> Result<u32, KernelError> {
        let mut buf = BCACHE.read(self.dev, block);
        let entries = unsafe {
            slice::from_raw_parts_mut(buf.data_mut().as_mut_ptr() as *mut u32, N_INDIRECT)
        };

        let mut addr = entries[index];
        if addr == 0 {
            match Block::alloc(self.dev) {
                Ok(b) => {
                    addr = b.0;
                    entries[index] = addr;
                    log::write(&buf);
                }
                Err(err) => {
                    BCACHE.release(buf);
                    return Err(err);
                }
            }
        }

        BCACHE.release(buf);
        Ok(addr)
    }

    pub fn stat(&self, inner: &SleepLockGuard<'_, InodeInner>) -> Stat {
        Stat {
            dev: self.dev.as_raw() as i32,
            ino: self.inum as u64,
            mode: inner.mode,
            nlink: inner.nlink as i16,
            rdev: inner.dev.as_raw() as i32,
            size: inner.size as u64,
            blksize: BSIZE as u64,
            blocks: (inner.size as u64).div_ceil(512),
        }
    }

    /// Reads up to `n` bytes starting at `off` into `dst` (user or kernel).
    /// Returns the number of bytes read.
    pub fn read(
        &self,
        inner: &mut SleepLockGuard<'_, InodeInner>,
        dst: Addr,
        off: u32,
        n: u32,
    ) -> Result<u32, KernelError> {
        let mut n = n;
        let mut off = off;
        let mut dst = dst;

        if off > inner.size || off.checked_add(n).is_none() {
            return Ok(0);
        }
        if off + n > inner.size {
            n = inner.size - off;
        }

        let mut total = 0;

        while total < n {
            let Ok(addr) = self.map(inner, off / BSIZE as u32) else {
                break;
            };

            let buf = BCACHE.read(self.dev, addr);

            let m = (n - total).min(BSIZE as u32 - off % BSIZE as u32);
            let src = &buf.data()[(off as usize % BSIZE)..][..m as usize];

            if proc::either_copy_out(dst, src).is_err() {
                BCACHE.release(buf);
                if total == 0 {
                    err!(KernelError::BadAddress);
                }
                break;
            }

            BCACHE.release(buf);

            total += m;
            off += m;
            dst = dst.offset(m as usize);
        }

        Ok(total)
    }

    /// Writes `n` bytes from `src` (user or kernel) at `off`, growing the
    /// file if needed. Returns the number of bytes written; fewer than
    /// requested means the disk filled up or the copy faulted.
    pub fn write(
        &self,
        inner: &mut SleepLockGuard<'_, InodeInner>,
        src: Addr,
        off: u32,
        n: u32,
    ) -> Result<u32, KernelError> {
        let mut off = off;
        let mut src = src;

        if off > inner.size || off.checked_add(n).is_none() {
            err!(KernelError::InvalidArgument);
        }
        if (off + n) as usize > MAX_FILE_BLOCKS * BSIZE {
            err!(KernelError::InvalidArgument);
        }

        let mut total = 0;

        while total < n {
            let Ok(addr) = self.map(inner, off / BSIZE as u32) else {
                break;
            };

            let mut buf = BCACHE.read(self.dev, addr);

            let m = (n - total).min(BSIZE as u32 - off % BSIZE as u32);
            let dst = &mut buf.data_mut()[(off as usize % BSIZE)..][..m as usize];

            if proc::either_copy_in(dst, src).is_err() {
                BCACHE.release(buf);
                break;
            }

            log::write(&buf);
            BCACHE.release(buf);

            total += m;
            off += m;
            src = src.offset(m as usize);
        }

        if off > inner.size {
            inner.size = off;
        }
        inner.mtime = rtc::read_seconds();

        // write the inode back even if the size is unchanged: map() may
        // have filled in addrs[], and mtime moved
        self.update(inner);

        Ok(total)
    }

    /// Creates a new inode at `path` with the given mode, linking it into
    /// its parent directory. Returns the locked inode.
    ///
    /// For an existing regular file (when creating a regular file) the
    /// existing inode is returned instead.
    pub fn create(
        path: &Path<'_>,
        mode: u32,
        rdev: DeviceNumber,
    ) -> Result<(Self, SleepLockGuard<'static, InodeInner>), KernelError> {
        let (parent, name) = path.resolve_parent()?;

        let mut parent_inner = parent.lock();

        // does the file already exist?
        if let Ok((_, inode)) = DirEntry::lookup(&parent, &mut parent_inner, name) {
            parent.unlock_put(parent_inner);

            let inode_inner = inode.lock();

            if mode::is_reg(mode)
                && (mode::is_reg(inode_inner.mode) || mode::is_device(inode_inner.mode))
            {
                return Ok((inode, inode_inner));
            }

            inode.unlock_put(inode_inner);
            err!(KernelError::Other); // exists with the wrong type
        }

        let inode = match Self::alloc(parent.dev, mode, rdev) {
            Ok(inode) => inode,
            Err(err) => {
                parent.unlock_put(parent_inner);
                return Err(err);
            }
        };

        let mut inode_inner = inode.lock();
        inode_inner.nlink = 1;
        inode.update(&inode_inner);

        let mut fail = false;

        // a directory starts with "." and ".." entries; no nlink++ for "."
        // to avoid a cyclic reference count
        if mode::is_dir(mode) {
            fail = DirEntry::link(&inode, &mut inode_inner, ".", inode.inum as u16).is_err()
                || DirEntry::link(&inode, &mut inode_inner, "..", parent.inum as u16).is_err();
        }

        if !fail {
            fail = DirEntry::link(&parent, &mut parent_inner, name, inode.inum as u16).is_err();
        }

        if fail {
            // undo the allocation; put() will free the inode on disk
            inode_inner.nlink = 0;
            inode.update(&inode_inner);
            inode.unlock_put(inode_inner);
            parent.unlock_put(parent_inner);
            err!(KernelError::Other);
        }

        if mode::is_dir(mode) {
            // success is now guaranteed; ".." references the parent
            parent_inner.nlink += 1;
            parent.update(&parent_inner);
        }

        parent.unlock_put(parent_inner);

        Ok((inode, inode_inner))
    }
}

/// Reads an inode's mode straight from its inode block, without going
/// through the inode cache. Used where taking the inode's sleep lock could
/// deadlock (a directory listing naming the locked directory itself).
pub fn disk_inode_mode(dev: DeviceNumber, inum: u32) -> u32 {
    let Ok(sb) = superblock(dev) else {
        return 0;
    };

    let mut buf = BCACHE.read(dev, sb.block_of_inode(inum));
    let mode = unsafe { DiskInode::from_buf(&mut buf, inum) }.mode;
    BCACHE.release(buf);
    mode
}

/// On-disk directory entry: a directory's content is a sequence of these.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub inum: u16,
    pub name: [u8; NAME_MAX],
}

impl DirEntry {
    pub const SIZE: usize = size_of::<Self>();

    pub const fn new_empty() -> Self {
        Self {
            inum: 0,
            name: [0; NAME_MAX],
        }
    }

    fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        unsafe { ptr::read_unaligned(bytes.as_ptr() as *const Self) }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self as *const Self as *const u8, Self::SIZE) }
    }

    fn read_at(
        dir: &Inode,
        inner: &mut SleepLockGuard<'_, InodeInner>,
        offset: u32,
    ) -> Result<Self, KernelError> {
        let mut buf = [0; Self::SIZE];
        let read = dir.read(
            inner,
            Addr::Kernel(buf.as_mut_ptr() as usize),
            offset,
            Self::SIZE as u32,
        )?;
        assert_eq!(read as usize, Self::SIZE, "dirent read");
        Ok(Self::from_bytes(&buf))
    }

    pub fn name_matches(&self, name: &str) -> bool {
        let end = self.name.iter().position(|&c| c == 0).unwrap_or(NAME_MAX);
        &self.name[..end] == name.as_bytes()
    }

    pub fn name_str(&self) -> &str {
        let end = self.name.iter().position(|&c| c == 0).unwrap_or(NAME_MAX);
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    fn set_name(&mut self, name: &str) {
        self.name.fill(0);
        let bytes = name.as_bytes();
        let len = bytes.len().min(NAME_MAX);
        self.name[..len].copy_from_slice(&bytes[..len]);
    }

    /// True if the directory only contains "." and "..".
    pub fn dir_is_empty(dir: &Inode, inner: &mut SleepLockGuard<'_, InodeInner>) -> bool {
        for offset in ((2 * Self::SIZE as u32)..inner.size).step_by(Self::SIZE) {
            let entry = Self::read_at(dir, inner, offset).expect("dir entry read");
            if entry.inum != 0 {
                return false;
            }
        }

        true
    }

    /// Looks `name` up in the directory.
    /// On a hit, returns the byte offset of the entry and the inode.
    pub fn lookup(
        dir: &Inode,
        inner: &mut SleepLockGuard<'_, InodeInner>,
        name: &str,
    ) -> Result<(u32, Inode), KernelError> {
        assert!(inner.is_dir(), "dir lookup: not a directory");

        for offset in (0..inner.size).step_by(Self::SIZE) {
            let entry = Self::read_at(dir, inner, offset)?;

            if entry.inum == 0 {
                continue;
            }

            if entry.name_matches(name) {
                let inode = Inode::get(dir.dev, entry.inum as u32)?;
                return Ok((offset, inode));
            }
        }

        Err(KernelError::NoEntry)
    }

    /// Writes a new directory entry (`name`, `inum`) into the directory,
    /// reusing the first free slot or appending.
    pub fn link(
        dir: &Inode,
        inner: &mut SleepLockGuard<'_, InodeInner>,
        name: &str,
        inum: u16,
    ) -> Result<(), KernelError> {
        // the name must not already be present
        if let Ok((_, existing)) = Self::lookup(dir, inner, name) {
            existing.put();
            err!(KernelError::Other);
        }

        let mut entry = Self::new_empty();
        let mut offset = 0;

        while offset < inner.size {
            entry = Self::read_at(dir, inner, offset)?;
            if entry.inum == 0 {
                break;
            }
            offset += Self::SIZE as u32;
        }

        entry.set_name(name);
        entry.inum = inum;

        let written = dir.write(
            inner,
            Addr::Kernel(entry.as_bytes().as_ptr() as usize),
            offset,
            Self::SIZE as u32,
        )?;
        if written as usize != Self::SIZE {
            err!(KernelError::Other);
        }

        Ok(())
    }
}

/// Directory entry as returned by the get_dirent syscall.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct Dirent {
    pub d_ino: u64,
    /// seek position of the next entry
    pub d_off: i64,
    pub d_reclen: u16,
    /// file type, bits 12..15 of the mode (4 = directory, 8 = regular
    /// file, 2 = char device, 6 = block device), saving an fstat per entry
    pub d_type: u8,
    pub d_name: [u8; NAME_MAX + 1],
}

impl Dirent {
    pub const fn mode_to_type(mode: u32) -> u8 {
        ((mode >> 12) & 0xF) as u8
    }
}

/// A path being resolved.
#[derive(Debug, Clone)]
pub struct Path<'a>(&'a str);

impl<'a> Path<'a> {
    pub const fn new(path: &'a str) -> Path<'a> {
        Self(path)
    }

    pub fn as_str(&self) -> &'a str {
        self.0
    }

    fn is_absolute(&self) -> bool {
        self.0.starts_with('/')
    }

    /// Splits off the next path component.
    /// The returned rest has no leading slashes, so a caller can check
    /// whether the component was the last one. None when nothing is left.
    fn next_component(&self) -> Option<(&'a str, Path<'a>)> {
        let s = self.0.trim_start_matches('/');

        if s.is_empty() {
            return None;
        }

        match s.find('/') {
            Some(i) => {
                let rest = s[i..].trim_start_matches('/');
                Some((&s[..i], Path(rest)))
            }
            None => Some((s, Path(""))),
        }
    }

    fn resolve_inner(&self, parent: bool) -> Result<(Inode, &'a str), KernelError> {
        let mut inode = if self.is_absolute() {
            Inode::get(ROOT_DEVICE, ROOT_INODE)?
        } else {
            proc::current_proc()
                .data()
                .cwd
                .as_ref()
                .expect("process without cwd")
                .dup()
        };

        let mut name = "";
        let mut path = self.clone();

        while let Some((component, rest)) = path.next_component() {
            // ".." at the root of a mounted file system continues in the
            // directory it is mounted on
            if component == ".."
                && let Some(mountpoint) = mount_point_of(&inode)
            {
                inode.put();
                inode = mountpoint;
            }

            let mut inner = inode.lock();

            if !inner.is_dir() {
                inode.unlock_put(inner);
                return Err(KernelError::NotADirectory);
            }

            // stop one level early
            if parent && rest.0.is_empty() {
                inode.unlock(inner);
                return Ok((inode, component));
            }

            let mut next = match DirEntry::lookup(&inode, &mut inner, component) {
                Ok((_, next)) => {
                    inode.unlock_put(inner);
                    next
                }
                Err(err) => {
                    inode.unlock_put(inner);
                    return Err(err);
                }
            };

            // descending into a mountpoint lands in the root of the file
            // system mounted there
            if let Some(root) = mounted_root_on(&next)? {
                next.put();
                next = root;
            }

            inode = next;
            name = component;
            path = rest;
        }

        if parent {
            // e.g. resolve_parent("/"): there is no parent to return
            inode.put();
            return Err(KernelError::InvalidArgument);
        }

        Ok((inode, name))
    }

    /// Resolves the full path to an inode (referenced, unlocked).
    pub fn resolve(&self) -> Result<Inode, KernelError> {
        self.resolve_inner(false).map(|(inode, _)| inode)
    }

    /// Resolves to the parent directory, returning (parent, final name).
    pub fn resolve_parent(&self) -> Result<(Inode, &'a str), KernelError> {
        self.resolve_inner(true)
    }
}
