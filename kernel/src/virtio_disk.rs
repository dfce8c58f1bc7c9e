// virtio device definitions, for both the mmio interface and virtio
// descriptors. only tested with qemu.
//
// the virtio spec:
// https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.pdf

use core::ptr;
use core::sync::atomic::{Ordering, fence};

use crate::buf::{BCACHE, Buf};
use crate::fs::BSIZE;
use crate::memlayout::VIRTIO0;
use crate::proc::{self, Channel};
use crate::spinlock::SpinLock;

// virtio mmio control registers, mapped starting at 0x10001000.
// from qemu virtio_mmio.h
const VIRTIO_MMIO_MAGIC_VALUE: u32 = 0x000; // 0x74726976
const VIRTIO_MMIO_VERSION: u32 = 0x004; // version; should be 2
const VIRTIO_MMIO_DEVICE_ID: u32 = 0x008; // device type; 1 is net, 2 is disk
const VIRTIO_MMIO_VENDOR_ID: u32 = 0x00c; // 0x554d4551
const VIRTIO_MMIO_DEVICE_FEATURES: u32 = 0x010;
const VIRTIO_MMIO_DRIVER_FEATURES: u32 = 0x020;
const VIRTIO_MMIO_QUEUE_SEL: u32 = 0x030; // select queue, write-only
const VIRTIO_MMIO_QUEUE_NUM_MAX: u32 = 0x034; // max size of current queue, read-only
const VIRTIO_MMIO_QUEUE_NUM: u32 = 0x038; // size of current queue, write-only
const VIRTIO_MMIO_QUEUE_READY: u32 = 0x044; // ready bit
const VIRTIO_MMIO_QUEUE_NOTIFY: u32 = 0x050; // write-only
const VIRTIO_MMIO_INTERRUPT_STATUS: u32 = 0x060; // read-only
const VIRTIO_MMIO_INTERRUPT_ACK: u32 = 0x064; // write-only
const VIRTIO_MMIO_STATUS: u32 = 0x070; // read/write
const VIRTIO_MMIO_QUEUE_DESC_LOW: u32 = 0x080; // physical address for descriptor table, write-only
const VIRTIO_MMIO_QUEUE_DESC_HIGH: u32 = 0x084;
const VIRTIO_MMIO_DRIVER_DESC_LOW: u32 = 0x090; // physical address for available ring, write-only
const VIRTIO_MMIO_DRIVER_DESC_HIGH: u32 = 0x094;
const VIRTIO_MMIO_DEVICE_DESC_LOW: u32 = 0x0a0; // physical address for used ring, write-only
const VIRTIO_MMIO_DEVICE_DESC_HIGH: u32 = 0x0a4;

// status register bits, from qemu virtio_config.h
const VIRTIO_CONFIG_S_ACKNOWLEDGE: u32 = 1;
const VIRTIO_CONFIG_S_DRIVER: u32 = 2;
const VIRTIO_CONFIG_S_DRIVER_OK: u32 = 4;
const VIRTIO_CONFIG_S_FEATURES_OK: u32 = 8;

// device feature bits
const VIRTIO_BLK_F_RO: u32 = 5; // disk is read only
const VIRTIO_BLK_F_SCSI: u32 = 7; // supports scsi command passthru
const VIRTIO_BLK_F_CONFIG_WCE: u32 = 11; // writeback mode available in config
const VIRTIO_BLK_F_MQ: u32 = 12; // supports more than one vq
const VIRTIO_F_ANY_LAYOUT: u32 = 27;
const VIRTIO_RING_F_INDIRECT_DESC: u32 = 28;
const VIRTIO_RING_F_EVENT_IDX: u32 = 29;

const VRING_DESC_F_NEXT: u16 = 1; // chained with another descriptor
const VRING_DESC_F_WRITE: u16 = 2; // device writes (vs read)

// this many virtio descriptors; must be a power of two
const NUM: usize = 8;

/// a single descriptor, from the spec
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VirtqDesc {
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
}

/// the (entire) avail ring, from the spec
#[repr(C)]
#[derive(Debug, Clone)]
struct VirtqAvail {
    flags: u16,       // always zero
    idx: u16,         // driver will write ring[idx] next
    ring: [u16; NUM], // descriptor numbers of chain heads
    unused: u16,
}

/// one entry in the "used" ring, with which the device tells the driver
/// about completed requests
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct VirtqUsedElem {
    id: u32, // index of start of completed descriptor chain
    len: u32,
}

#[repr(C)]
#[derive(Debug, Clone)]
struct VirtqUsed {
    flags: u16, // always zero
    idx: u16,   // device increments when it adds a ring[] entry
    ring: [VirtqUsedElem; NUM],
}

// these are specific to virtio block devices, described in section 5.2

const VIRTIO_BLK_T_IN: u32 = 0; // read the disk
const VIRTIO_BLK_T_OUT: u32 = 1; // write the disk

/// the format of the first descriptor in a disk request. to be followed by
/// two more descriptors containing the block and a one-byte status.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct BlockReq {
    r#type: u32,
    reserved: u32,
    sector: u64,
}

/// per-request bookkeeping, indexed by the first descriptor of the chain
#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Info {
    buf_id: usize,
    in_flight: bool,
    status: u8,
}

pub static VIRTIO_DISK: SpinLock<Disk> = SpinLock::new(Disk::new(), "virtio_disk");

#[derive(Debug)]
pub struct Disk {
    /// a set (not a ring) of DMA descriptors, with which the driver tells
    /// the device where to read and write individual disk operations.
    /// most commands consist of a chain of a couple of these.
    desc: [VirtqDesc; NUM],

    /// a ring in which the driver writes descriptor numbers that the
    /// driver would like the device to process (only the head of each
    /// chain).
    avail: VirtqAvail,

    /// a ring in which the device writes descriptor numbers that it has
    /// finished processing (just the head of each chain).
    used: VirtqUsed,

    free: [bool; NUM],
    /// how far we have looked in used.ring
    used_idx: u16,

    /// in-flight operations, for use when the completion interrupt
    /// arrives. indexed by the first descriptor of the chain.
    info: [Info; NUM],

    /// request headers, one per descriptor chain
    ops: [BlockReq; NUM],
}

impl Disk {
    const fn new() -> Self {
        Disk {
            desc: [VirtqDesc {
                addr: 0,
                len: 0,
                flags: 0,
                next: 0,
            }; NUM],
            avail: VirtqAvail {
                flags: 0,
                idx: 0,
                ring: [0; NUM],
                unused: 0,
            },
            used: VirtqUsed {
                flags: 0,
                idx: 0,
                ring: [VirtqUsedElem { id: 0, len: 0 }; NUM],
            },
            free: [true; NUM],
            used_idx: 0,
            info: [Info {
                buf_id: usize::MAX,
                in_flight: false,
                status: 0,
            }; NUM],
            ops: [BlockReq {
                r#type: 0,
                reserved: 0,
                sector: 0,
            }; NUM],
        }
    }

    fn read(reg: u32) -> u32 {
        // Safety: reading a memory-mapped virtio register
        unsafe { ptr::read_volatile((VIRTIO0 + reg as usize) as *const u32) }
    }

    fn write(reg: u32, value: u32) {
        // Safety: writing a memory-mapped virtio register
        unsafe { ptr::write_volatile((VIRTIO0 + reg as usize) as *mut u32, value) }
    }

    /// Finds a free descriptor, marks it non-free, returns its index.
    fn alloc_desc(&mut self) -> Option<usize> {
        for (i, free) in self.free.iter_mut().enumerate() {
            if *free {
                *free = false;
                return Some(i);
            }
        }
        None
    }

    /// Marks a descriptor as free.
    fn free_desc(&mut self, i: usize) {
        assert!(i < NUM, "free_desc: out of bounds");
        assert!(!self.free[i], "free_desc: already free");

        self.desc[i] = VirtqDesc {
            addr: 0,
            len: 0,
            flags: 0,
            next: 0,
        };
        self.free[i] = true;

        proc::wakeup(Channel::Disk(&raw const VIRTIO_DISK as usize));
    }

    /// Frees a chain of descriptors.
    fn free_chain(&mut self, mut i: usize) {
        loop {
            let flags = self.desc[i].flags;
            let next = self.desc[i].next;

            self.free_desc(i);

            if flags & VRING_DESC_F_NEXT != 0 {
                i = next as usize;
            } else {
                break;
            }
        }
    }

    /// Allocates three descriptors (they need not be contiguous).
    /// Disk transfers always use three.
    fn alloc3_desc(&mut self) -> Option<[usize; 3]> {
        let mut idx = [0; 3];

        for i in 0..3 {
            match self.alloc_desc() {
                Some(d) => idx[i] = d,
                None => {
                    for d in &idx[..i] {
                        self.free_desc(*d);
                    }
                    return None;
                }
            }
        }

        Some(idx)
    }
}

/// Reads or writes one buffer synchronously: submits the request and sleeps
/// until the completion interrupt. The caller holds the buffer's sleep lock.
pub fn rw(buf: &mut Buf<'_>, write: bool) {
    let sector = buf.block_no as u64 * (BSIZE / 512) as u64;

    let mut disk = VIRTIO_DISK.lock();

    // allocate three descriptors: header, data, status
    let idx = loop {
        match disk.alloc3_desc() {
            Some(idx) => break idx,
            None => {
                disk = proc::sleep(Channel::Disk(&raw const VIRTIO_DISK as usize), disk);
            }
        }
    };

    // format the three descriptors; qemu's virtio-blk.c reads them
    disk.ops[idx[0]] = BlockReq {
        r#type: if write { VIRTIO_BLK_T_OUT } else { VIRTIO_BLK_T_IN },
        reserved: 0,
        sector,
    };
    disk.info[idx[0]].status = 0xff; // device writes 0 on success

    let req_addr = &disk.ops[idx[0]] as *const BlockReq as u64;
    let status_addr = &disk.info[idx[0]].status as *const u8 as u64;

    disk.desc[idx[0]] = VirtqDesc {
        addr: req_addr,
        len: size_of::<BlockReq>() as u32,
        flags: VRING_DESC_F_NEXT,
        next: idx[1] as u16,
    };

    disk.desc[idx[1]] = VirtqDesc {
        addr: buf.data_mut().as_mut_ptr() as u64,
        len: BSIZE as u32,
        // device reads the data for a write, writes it for a read
        flags: if write { 0 } else { VRING_DESC_F_WRITE } | VRING_DESC_F_NEXT,
        next: idx[2] as u16,
    };

    disk.desc[idx[2]] = VirtqDesc {
        addr: status_addr,
        len: 1,
        flags: VRING_DESC_F_WRITE,
        next: 0,
    };

    // record the in-flight request for handle_interrupt()
    disk.info[idx[0]].in_flight = true;
    disk.info[idx[0]].buf_id = buf.id;
    BCACHE.set_disk(buf.id, true);

    // tell the device the first index of our chain of descriptors
    let avail_idx = disk.avail.idx as usize % NUM;
    disk.avail.ring[avail_idx] = idx[0] as u16;

    fence(Ordering::SeqCst);

    // tell the device another avail ring entry is available
    disk.avail.idx = disk.avail.idx.wrapping_add(1);

    fence(Ordering::SeqCst);

    Disk::write(VIRTIO_MMIO_QUEUE_NOTIFY, 0); // value is queue number

    // wait for handle_interrupt() to say the request has finished
    while disk.info[idx[0]].in_flight {
        disk = proc::sleep(Channel::Disk(buf.id), disk);
    }

    assert_eq!(disk.info[idx[0]].status, 0, "virtio disk request failed");

    disk.info[idx[0]].buf_id = usize::MAX;
    disk.free_chain(idx[0]);
}

/// Completion interrupt handler.
pub fn handle_interrupt() {
    let mut disk = VIRTIO_DISK.lock();

    // tell the device we've seen this interrupt, so it doesn't repeat it
    // before the next one
    Disk::write(
        VIRTIO_MMIO_INTERRUPT_ACK,
        Disk::read(VIRTIO_MMIO_INTERRUPT_STATUS) & 0x3,
    );

    fence(Ordering::SeqCst);

    // the device increments used.idx when it adds an entry to the used
    // ring; process every new one
    while disk.used_idx != disk.used.idx {
        fence(Ordering::SeqCst);
        let id = disk.used.ring[disk.used_idx as usize % NUM].id as usize;

        let info = &mut disk.info[id];
        assert!(info.in_flight, "virtio interrupt: not in flight");
        info.in_flight = false;

        let buf_id = info.buf_id;
        BCACHE.set_disk(buf_id, false);

        // rw() may be waiting for this buffer
        proc::wakeup(Channel::Disk(buf_id));

        disk.used_idx = disk.used_idx.wrapping_add(1);
    }
}

/// Finds and brings up the disk behind VIRTIO0.
///
/// # Safety
/// Must be called once during kernel initialization.
pub unsafe fn init() {
    assert!(
        Disk::read(VIRTIO_MMIO_MAGIC_VALUE) == 0x74726976
            && Disk::read(VIRTIO_MMIO_VERSION) == 2
            && Disk::read(VIRTIO_MMIO_DEVICE_ID) == 2
            && Disk::read(VIRTIO_MMIO_VENDOR_ID) == 0x554d4551,
        "could not find virtio disk"
    );

    let mut disk = VIRTIO_DISK.lock();

    let mut status = 0;

    // reset the device
    Disk::write(VIRTIO_MMIO_STATUS, status);

    // set ACKNOWLEDGE and DRIVER status bits
    status |= VIRTIO_CONFIG_S_ACKNOWLEDGE;
    Disk::write(VIRTIO_MMIO_STATUS, status);
    status |= VIRTIO_CONFIG_S_DRIVER;
    Disk::write(VIRTIO_MMIO_STATUS, status);

    // negotiate features
    let mut features = Disk::read(VIRTIO_MMIO_DEVICE_FEATURES);
    features &= !(1 << VIRTIO_BLK_F_RO);
    features &= !(1 << VIRTIO_BLK_F_SCSI);
    features &= !(1 << VIRTIO_BLK_F_CONFIG_WCE);
    features &= !(1 << VIRTIO_BLK_F_MQ);
    features &= !(1 << VIRTIO_F_ANY_LAYOUT);
    features &= !(1 << VIRTIO_RING_F_EVENT_IDX);
    features &= !(1 << VIRTIO_RING_F_INDIRECT_DESC);
    Disk::write(VIRTIO_MMIO_DRIVER_FEATURES, features);

    // tell the device the features are complete
    status |= VIRTIO_CONFIG_S_FEATURES_OK;
    Disk::write(VIRTIO_MMIO_STATUS, status);

    // re-read status to ensure FEATURES_OK is set
    status = Disk::read(VIRTIO_MMIO_STATUS);
    assert!(
        status & VIRTIO_CONFIG_S_FEATURES_OK != 0,
        "virtio disk FEATURES_OK unset"
    );

    // initialize queue 0
    Disk::write(VIRTIO_MMIO_QUEUE_SEL, 0);
    assert!(
        Disk::read(VIRTIO_MMIO_QUEUE_READY) == 0,
        "virtio disk should not be ready"
    );

    let max = Disk::read(VIRTIO_MMIO_QUEUE_NUM_MAX);
    assert!(max != 0, "virtio disk has no queue 0");
    assert!(max as usize >= NUM, "virtio disk max queue too short");
    Disk::write(VIRTIO_MMIO_QUEUE_NUM, NUM as u32);

    // write physical addresses (the rings live in the static Disk)
    let desc = disk.desc.as_ptr() as u64;
    let avail = &disk.avail as *const _ as u64;
    let used = &disk.used as *const _ as u64;
    Disk::write(VIRTIO_MMIO_QUEUE_DESC_LOW, desc as u32);
    Disk::write(VIRTIO_MMIO_QUEUE_DESC_HIGH, (desc >> 32) as u32);
    Disk::write(VIRTIO_MMIO_DRIVER_DESC_LOW, avail as u32);
    Disk::write(VIRTIO_MMIO_DRIVER_DESC_HIGH, (avail >> 32) as u32);
    Disk::write(VIRTIO_MMIO_DEVICE_DESC_LOW, used as u32);
    Disk::write(VIRTIO_MMIO_DEVICE_DESC_HIGH, (used >> 32) as u32);

    // queue is ready
    Disk::write(VIRTIO_MMIO_QUEUE_READY, 1);

    disk.free = [true; NUM];

    // tell the device we're completely ready
    status |= VIRTIO_CONFIG_S_DRIVER_OK;
    Disk::write(VIRTIO_MMIO_STATUS, status);
}
