use core::mem::{self, MaybeUninit};

use crate::device::{self, DeviceNumber};
use crate::fs::BSIZE;
use crate::param::NBUF;
use crate::sleeplock::{SleepLock, SleepLockGuard};
use crate::spinlock::SpinLock;

/// Buffer metadata, protected by the cache spinlock.
#[derive(Debug, Clone)]
pub struct BufMeta {
    pub valid: bool,
    /// the disk driver currently owns the buffer contents
    pub disk: bool,
    pub dev: DeviceNumber,
    pub block_no: u32,
    pub ref_count: u32,
    // LRU doubly-linked list, by buffer index
    pub prev: usize,
    pub next: usize,
}

impl BufMeta {
    const fn new() -> Self {
        Self {
            valid: false,
            disk: false,
            dev: DeviceNumber::from_raw(0),
            block_no: 0,
            ref_count: 0,
            prev: 0,
            next: 0,
        }
    }
}

/// Buffer payload, protected by the buffer's sleep lock during I/O.
/// Aligned so on-disk structures (inodes, the log header, address blocks)
/// can be read in place.
#[derive(Debug, Clone)]
#[repr(C, align(8))]
pub struct BufData {
    pub data: [u8; BSIZE],
}

impl BufData {
    const fn new() -> Self {
        Self { data: [0; BSIZE] }
    }
}

/// A buffer handle returned by `get()`/`read()`; holds the sleep lock on the
/// buffer payload until released.
#[derive(Debug)]
pub struct Buf<'a> {
    pub id: usize,
    pub dev: DeviceNumber,
    pub block_no: u32,
    pub guard: SleepLockGuard<'a, BufData>,
}

impl Buf<'_> {
    pub fn data(&self) -> &[u8; BSIZE] {
        &self.guard.data
    }

    pub fn data_mut(&mut self) -> &mut [u8; BSIZE] {
        &mut self.guard.data
    }
}

/// Cache bookkeeping: per-buffer metadata and the MRU list head.
pub struct BCacheInner {
    pub meta: [BufMeta; NBUF],
    head: usize,
}

pub static BCACHE: BCache = BCache::new();

/// Buffer cache: a fixed pool of cached disk blocks.
///
/// Caching disk blocks in memory reduces disk reads and provides the
/// synchronization point for blocks used by multiple processes.
///
/// Interface:
/// * call `read()` to get a locked buffer for a block
/// * after changing its data, call `write()` to push it to disk
/// * call `release()` when done; do not use the buffer afterwards
/// * only one process at a time uses a buffer, so don't hold them long
pub struct BCache {
    /// protects metadata lookups and LRU manipulation
    pub inner: SpinLock<BCacheInner>,
    /// per-buffer payload locks, so I/O on different blocks can overlap
    bufs: [SleepLock<BufData>; NBUF],
}

impl BCache {
    const fn new() -> Self {
        let bufs = {
            let mut array: [MaybeUninit<SleepLock<BufData>>; NBUF] =
                unsafe { MaybeUninit::uninit().assume_init() };

            let mut i = 0;
            while i < NBUF {
                array[i] = MaybeUninit::new(SleepLock::new(BufData::new(), "buffer"));
                i += 1;
            }

            unsafe {
                mem::transmute::<[MaybeUninit<SleepLock<BufData>>; NBUF], [SleepLock<BufData>; NBUF]>(
                    array,
                )
            }
        };

        let meta = {
            let mut array: [MaybeUninit<BufMeta>; NBUF] =
                unsafe { MaybeUninit::uninit().assume_init() };

            let mut i = 0;
            while i < NBUF {
                array[i] = MaybeUninit::new(BufMeta::new());
                i += 1;
            }

            unsafe { mem::transmute::<[MaybeUninit<BufMeta>; NBUF], [BufMeta; NBUF]>(array) }
        };

        Self {
            inner: SpinLock::new(BCacheInner { meta, head: 0 }, "bcache"),
            bufs,
        }
    }

    /// Looks through the cache for block `block_no` on device `dev`,
    /// recycling the least recently used free buffer on a miss.
    /// Returns the buffer with its sleep lock held.
    fn get(&self, dev: DeviceNumber, block_no: u32) -> Buf<'_> {
        let mut inner = self.inner.lock();

        // is the block already cached?
        for i in 0..NBUF {
            let meta = &mut inner.meta[i];
            if meta.ref_count > 0 || meta.valid {
                if meta.dev == dev && meta.block_no == block_no {
                    meta.ref_count += 1;
                    drop(inner);

                    let guard = self.bufs[i].lock();
                    return Buf {
                        id: i,
                        dev,
                        block_no,
                        guard,
                    };
                }
            }
        }

        // not cached; recycle the least recently used buffer with no
        // references, scanning from the LRU end of the list
        let mut i = inner.meta[inner.head].prev;
        loop {
            let meta = &mut inner.meta[i];
            if meta.ref_count == 0 {
                meta.dev = dev;
                meta.block_no = block_no;
                meta.valid = false;
                meta.ref_count = 1;
                drop(inner);

                let guard = self.bufs[i].lock();
                return Buf {
                    id: i,
                    dev,
                    block_no,
                    guard,
                };
            }

            if i == inner.head {
                // every buffer is referenced: a capacity misconfiguration,
                // not a recoverable condition
                panic!("bio: no buffers");
            }

            i = inner.meta[i].prev;
        }
    }

    /// Returns a locked buffer with the contents of the indicated block.
    pub fn read(&self, dev: DeviceNumber, block_no: u32) -> Buf<'_> {
        let mut buf = self.get(dev, block_no);

        let valid = {
            let inner = self.inner.lock();
            inner.meta[buf.id].valid
        };

        if !valid {
            device::block_rw(dev, &mut buf, false);

            let mut inner = self.inner.lock();
            inner.meta[buf.id].valid = true;
        }

        buf
    }

    /// Writes the buffer's contents to disk. The caller holds the buffer.
    pub fn write(&self, buf: &mut Buf<'_>) {
        device::block_rw(buf.dev, buf, true);
    }

    /// Releases a buffer. On the last reference the buffer moves to the
    /// head of the MRU list so it is the last to be recycled.
    pub fn release(&self, buf: Buf<'_>) {
        let id = buf.id;
        drop(buf); // drops the sleep lock

        let mut inner = self.inner.lock();

        assert!(!inner.meta[id].disk, "bio: release while driver owns buf");

        inner.meta[id].ref_count -= 1;
        if inner.meta[id].ref_count == 0 && id != inner.head {
            // unlink: prev -> id -> next becomes prev -> next
            let next = inner.meta[id].next;
            let prev = inner.meta[id].prev;
            inner.meta[next].prev = prev;
            inner.meta[prev].next = next;

            // insert at the MRU position, in front of the old head
            let head = inner.head;
            let head_prev = inner.meta[head].prev;
            inner.meta[id].next = head;
            inner.meta[id].prev = head_prev;
            inner.meta[head_prev].next = id;
            inner.meta[head].prev = id;
            inner.head = id;
        }
    }

    /// Increments the reference count so the buffer survives eviction; the
    /// log uses this to keep modified blocks resident until commit.
    pub fn pin(&self, buf: &Buf<'_>) {
        let mut inner = self.inner.lock();
        inner.meta[buf.id].ref_count += 1;
    }

    /// Undoes a `pin`.
    pub fn unpin(&self, id: usize) {
        let mut inner = self.inner.lock();
        assert!(inner.meta[id].ref_count >= 1, "bio: unpin");
        inner.meta[id].ref_count -= 1;
    }

    /// Marks or clears driver ownership of the buffer contents.
    pub fn set_disk(&self, id: usize, owned: bool) {
        let mut inner = self.inner.lock();
        inner.meta[id].disk = owned;
    }
}

/// Initializes the buffer cache LRU list.
///
/// # Safety
/// Must be called only once during kernel initialization.
pub unsafe fn init() {
    let mut inner = BCACHE.inner.lock();

    // circular doubly-linked list over all buffers
    inner.head = 0;
    for i in 0..NBUF {
        inner.meta[i].prev = if i == 0 { NBUF - 1 } else { i - 1 };
        inner.meta[i].next = if i == NBUF - 1 { 0 } else { i + 1 };
    }
}
