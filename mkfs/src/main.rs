// Builds a vimixfs disk image from host files.
//
// Disk layout:
// [ boot block | sb block | log | inode blocks | free bit map | data blocks ]

use std::env::args;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use bytemuck::{Pod, Zeroable};

/// max # of blocks any FS op writes
const MAXOPBLOCKS: u32 = 10;
/// max data blocks in the on-disk log
const LOGBLOCKS: u32 = MAXOPBLOCKS * 3;
/// size of the file system in blocks
const FSSIZE: u32 = 4000;

/// vimixfs magic number
const FSMAGIC: u32 = 0x10203042;
/// root inode number
const ROOTINO: u32 = 1;
/// block size
const BSIZE: u32 = 1024;
/// number of direct block addresses in an inode
const NDIRECT: u32 = 21;
/// number of block addresses in an indirect block
const NINDIRECT: u32 = BSIZE / size_of::<u32>() as u32;
/// max file size in blocks (mkfs never needs the double-indirect block)
const MAXFILE: u32 = NDIRECT + NINDIRECT;
/// directory entry name size
const DIRSIZE: usize = 14;

/// inodes per block
const IPB: u32 = BSIZE / size_of::<DiskInode>() as u32;
/// bitmap bits per block
const BPB: u32 = BSIZE * 8;

const NINODES: u32 = 200;
const NBITMAP: u32 = FSSIZE / BPB + 1;
const NINODEBLOCKS: u32 = NINODES / IPB + 1;
/// header followed by LOGBLOCKS data blocks
const NLOG: u32 = LOGBLOCKS + 1;
/// number of meta blocks (boot, sb, log, inode, bitmap)
const NMETA: u32 = NLOG + NINODEBLOCKS + NBITMAP + 2;
/// number of data blocks
const NBLOCKS: u32 = FSSIZE - NMETA;

// file type bits of the inode mode field
const S_IFREG: u32 = 0o100000;
const S_IFDIR: u32 = 0o040000;

/// On-disk superblock
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct SuperBlock {
    /// must be FSMAGIC
    magic: u32,
    /// size of file system image (blocks)
    size: u32,
    /// number of data blocks
    nblocks: u32,
    /// number of inodes
    ninodes: u32,
    /// number of log blocks
    nlog: u32,
    /// block number of the first log block
    logstart: u32,
    /// block number of the first inode block
    inodestart: u32,
    /// block number of the first free map block
    bmapstart: u32,
}

/// On-disk inode. Mode zero marks a free slot.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct DiskInode {
    mode: u32,
    dev: i32,
    nlink: u32,
    size: u32,
    uid: i32,
    gid: i32,
    ctime: i64,
    mtime: i64,
    /// NDIRECT direct blocks, one indirect, one double indirect
    addrs: [u32; NDIRECT as usize + 2],
    pad: u32,
}

impl DiskInode {
    fn new(mode: u32, now: i64) -> Self {
        Self {
            mode,
            dev: 0,
            nlink: 1,
            size: 0,
            uid: 0,
            gid: 0,
            ctime: now,
            mtime: now,
            addrs: [0; NDIRECT as usize + 2],
            pad: 0,
        }
    }
}

/// On-disk directory entry
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
struct DirEntry {
    inum: u16,
    name: [u8; DIRSIZE],
}

impl DirEntry {
    fn new(inum: u16, name: &str) -> Self {
        let mut entry = Self {
            inum,
            name: [0; DIRSIZE],
        };
        let bytes = name.as_bytes();
        assert!(bytes.len() <= DIRSIZE, "file name too long: {name}");
        entry.name[..bytes.len()].copy_from_slice(bytes);
        entry
    }
}

fn main() {
    let args = args().collect::<Vec<String>>();

    if args.len() < 2 {
        eprintln!("Usage: mkfs <fs.img> [files]");
        std::process::exit(1);
    }

    let img = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args[1])
        .expect("failed to open image");

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock before epoch")
        .as_secs() as i64;

    // the first free data block and inode
    let mut free_block = NMETA;
    let mut free_inode = 1;

    let sb = SuperBlock {
        magic: FSMAGIC,
        size: FSSIZE,
        nblocks: NBLOCKS,
        ninodes: NINODES,
        nlog: NLOG,
        logstart: 2,
        inodestart: 2 + NLOG,
        bmapstart: 2 + NLOG + NINODEBLOCKS,
    };

    println!("{sb:?}");

    const ZEROS: [u8; BSIZE as usize] = [0u8; BSIZE as usize];
    for i in 0..FSSIZE {
        write_sector(&img, i, &ZEROS);
    }

    let mut buf = [0u8; BSIZE as usize];
    buf[..size_of::<SuperBlock>()].copy_from_slice(bytemuck::bytes_of(&sb));
    write_sector(&img, 1, &buf);

    let rootino = allocate_inode(&img, S_IFDIR | 0o755, &mut free_inode, now);
    assert_eq!(rootino, ROOTINO);

    let dot = DirEntry::new(ROOTINO as u16, ".");
    append_inode(&img, &mut free_block, rootino, bytemuck::bytes_of(&dot));

    let dotdot = DirEntry::new(ROOTINO as u16, "..");
    append_inode(&img, &mut free_block, rootino, bytemuck::bytes_of(&dotdot));

    for file in &args[2..] {
        install_file(&img, file, rootino, &mut free_block, &mut free_inode, now);
    }

    // round the root directory size up to a whole block
    let mut root = read_inode(&img, rootino);
    root.size = root.size.div_ceil(BSIZE) * BSIZE;
    write_inode(&img, rootino, &root);

    write_bitmap(&img, free_block, sb.bmapstart);

    println!("done: {} of {} data blocks used", free_block - NMETA, NBLOCKS);
}

/// Copies a host file into the image's root directory, named after its
/// basename (a leading '_' is stripped, so host build artifacts like
/// `_init` install as `init`).
fn install_file(
    img: &File,
    host_path: &str,
    rootino: u32,
    free_block: &mut u32,
    free_inode: &mut u32,
    now: i64,
) {
    let data = std::fs::read(host_path).unwrap_or_else(|e| panic!("read {host_path}: {e}"));

    let base = Path::new(host_path)
        .file_name()
        .and_then(|n| n.to_str())
        .expect("file name");
    let name = base.strip_prefix('_').unwrap_or(base);

    let inum = allocate_inode(img, S_IFREG | 0o644, free_inode, now);

    let entry = DirEntry::new(inum as u16, name);
    append_inode(img, free_block, rootino, bytemuck::bytes_of(&entry));
    append_inode(img, free_block, inum, &data);

    println!("{name}: inode {inum}, {} bytes", data.len());
}

fn write_sector(img: &File, sec: u32, buf: &[u8]) {
    img.write_at(buf, (sec * BSIZE) as u64)
        .expect("failed to write sector");
}

fn read_sector(img: &File, sec: u32, buf: &mut [u8]) {
    img.read_at(buf, (sec * BSIZE) as u64)
        .expect("failed to read sector");
}

fn inode_location(inum: u32) -> (u32, usize) {
    let block = 2 + NLOG + inum / IPB;
    let offset = (inum % IPB) as usize * size_of::<DiskInode>();
    (block, offset)
}

fn write_inode(img: &File, inum: u32, inode: &DiskInode) {
    let mut buf = [0u8; BSIZE as usize];
    let (block, offset) = inode_location(inum);

    read_sector(img, block, &mut buf);
    buf[offset..offset + size_of::<DiskInode>()].copy_from_slice(bytemuck::bytes_of(inode));
    write_sector(img, block, &buf);
}

fn read_inode(img: &File, inum: u32) -> DiskInode {
    let mut buf = [0u8; BSIZE as usize];
    let (block, offset) = inode_location(inum);

    read_sector(img, block, &mut buf);
    *bytemuck::from_bytes::<DiskInode>(&buf[offset..offset + size_of::<DiskInode>()])
}

fn allocate_inode(img: &File, mode: u32, free_inode: &mut u32, now: i64) -> u32 {
    let inum = *free_inode;
    *free_inode += 1;

    let din = DiskInode::new(mode, now);
    write_inode(img, inum, &din);
    inum
}

/// Appends `data` to the inode's content, allocating data (and indirect)
/// blocks sequentially.
fn append_inode(img: &File, free_block: &mut u32, inum: u32, mut data: &[u8]) {
    let mut buf = [0u8; BSIZE as usize];

    let mut din = read_inode(img, inum);
    let mut offset = din.size;

    while !data.is_empty() {
        let fbn = offset / BSIZE;
        assert!(fbn < MAXFILE, "file too large");

        let block = if fbn < NDIRECT {
            if din.addrs[fbn as usize] == 0 {
                din.addrs[fbn as usize] = *free_block;
                *free_block += 1;
            }
            din.addrs[fbn as usize]
        } else {
            if din.addrs[NDIRECT as usize] == 0 {
                din.addrs[NDIRECT as usize] = *free_block;
                *free_block += 1;
            }

            let mut indirect = [0u8; BSIZE as usize];
            read_sector(img, din.addrs[NDIRECT as usize], &mut indirect);

            let slot = (fbn - NDIRECT) as usize * size_of::<u32>();
            let bytes: [u8; 4] = indirect[slot..slot + 4].try_into().unwrap();
            let mut addr = u32::from_le_bytes(bytes);
            if addr == 0 {
                addr = *free_block;
                *free_block += 1;
                indirect[slot..slot + 4].copy_from_slice(&addr.to_le_bytes());
                write_sector(img, din.addrs[NDIRECT as usize], &indirect);
            }

            addr
        };

        let block_offset = (offset % BSIZE) as usize;
        let n = data.len().min((BSIZE as usize) - block_offset);

        read_sector(img, block, &mut buf);
        buf[block_offset..block_offset + n].copy_from_slice(&data[..n]);
        write_sector(img, block, &buf);

        offset += n as u32;
        data = &data[n..];
    }

    din.size = offset;
    write_inode(img, inum, &din);
}

/// Marks the first `used` blocks allocated in the free bitmap.
fn write_bitmap(img: &File, used: u32, bmapstart: u32) {
    assert!(used < BPB, "bitmap spans multiple blocks");

    let mut buf = [0u8; BSIZE as usize];

    for i in 0..used as usize {
        buf[i / 8] |= 1 << (i % 8);
    }

    println!("first {used} blocks allocated; bitmap block at sector {bmapstart}");
    write_sector(img, bmapstart, &buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_inode_layout() {
        // the kernel reads inodes at (inum % IPB) * size_of::<DiskInode>();
        // the struct must have no implicit padding for Pod and a stable size
        assert_eq!(size_of::<DiskInode>(), 136);
        assert_eq!(IPB, 7);
    }

    #[test]
    fn dirent_divides_block() {
        assert_eq!(size_of::<DirEntry>(), 16);
        assert_eq!(BSIZE as usize % size_of::<DirEntry>(), 0);
    }

    #[test]
    fn superblock_fits_one_block() {
        assert!(size_of::<SuperBlock>() <= BSIZE as usize);
    }

    #[test]
    fn log_header_bound() {
        // the log header stores a count plus one u32 per payload block
        assert!(LOGBLOCKS as usize <= BSIZE as usize / size_of::<u32>() - 1);
    }

    #[test]
    fn meta_and_data_cover_disk() {
        assert_eq!(NMETA + NBLOCKS, FSSIZE);
        assert!(NBLOCKS > 0);
    }

    #[test]
    fn inode_blocks_hold_all_inodes() {
        assert!(NINODEBLOCKS * IPB >= NINODES);

        // inode 1 (the root) lands inside the inode area
        let (block, offset) = inode_location(ROOTINO);
        assert_eq!(block, 2 + NLOG);
        assert_eq!(offset, size_of::<DiskInode>());
        assert!(offset + size_of::<DiskInode>() <= BSIZE as usize);
    }

    #[test]
    fn bitmap_covers_disk() {
        assert!(NBITMAP * BPB >= FSSIZE);
    }
}
