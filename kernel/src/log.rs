// Write-ahead logging, allowing concurrent FS system calls.
//
// A log transaction contains the updates of multiple FS system calls. The
// logging system only commits when there are no FS system calls active, so
// there is never any reasoning required about whether a commit might write
// an uncommitted system call's updates to disk.
//
// A system call wraps its FS operations in an `Operation` guard, which marks
// the start and end of the transaction on every active log. Usually begin
// just increments the count of in-progress calls and returns; if the log is
// close to running out it sleeps until the last outstanding end commits.
//
// Each mounted file system carries its own log: a physical re-do log in a
// fixed region of its block device. The on-disk format:
//   header block, containing block #s for block A, B, C, ...
//   block A
//   block B
//   block C
//   ...
// Log appends are synchronous.

use crate::buf::{BCACHE, Buf};
use crate::device::DeviceNumber;
use crate::fs::{BSIZE, SuperBlock};
use crate::param::{LOGSIZE, MAX_MOUNTED_FILE_SYSTEMS, MAX_OP_BLOCKS};
use crate::proc::{self, Channel};
use crate::spinlock::SpinLock;

// the on-disk header block holds a count and one i32 slot per payload block
const _: () = assert!(LOGSIZE <= BSIZE / size_of::<u32>() - 1);

/// Contents of the header block, both the on-disk header and the in-memory
/// record of logged block numbers before commit.
#[repr(C)]
#[derive(Debug)]
struct LogHeader {
    n: u32,
    blocks: [u32; LOGSIZE],
}

#[derive(Debug)]
struct LogInner {
    /// in use; a mount slot owns this log
    active: bool,
    dev: DeviceNumber,
    /// block number of the first log block
    start: u32,
    /// number of log blocks
    size: u32,
    /// how many FS system calls are executing
    outstanding: u32,
    /// in commit(), please wait
    committing: bool,
    header: LogHeader,
}

/// One log, one per mounted file system.
#[derive(Debug)]
pub struct Log {
    inner: SpinLock<LogInner>,
}

pub static LOGS: [Log; MAX_MOUNTED_FILE_SYSTEMS] =
    [const { Log::new() }; MAX_MOUNTED_FILE_SYSTEMS];

impl Log {
    const fn new() -> Self {
        Self {
            inner: SpinLock::new(
                LogInner {
                    active: false,
                    dev: DeviceNumber::from_raw(0),
                    start: 0,
                    size: 0,
                    outstanding: 0,
                    committing: false,
                    header: LogHeader {
                        n: 0,
                        blocks: [0; LOGSIZE],
                    },
                },
                "log",
            ),
        }
    }

    fn channel(&self) -> Channel {
        Channel::Log(self as *const _ as usize)
    }

    /// Copies committed blocks from the log to their home locations.
    fn install_trans(&self, recovering: bool) {
        let (dev, start, n) = {
            let inner = self.inner.lock();
            (inner.dev, inner.start, inner.header.n)
        };

        for tail in 0..n {
            let block = {
                let inner = self.inner.lock();
                inner.header.blocks[tail as usize]
            };

            let lbuf = BCACHE.read(dev, start + tail + 1); // log block
            let mut dbuf = BCACHE.read(dev, block); // home block

            dbuf.data_mut().copy_from_slice(lbuf.data());
            BCACHE.write(&mut dbuf); // write home block to disk

            if !recovering {
                BCACHE.unpin(dbuf.id);
            }

            BCACHE.release(lbuf);
            BCACHE.release(dbuf);
        }
    }

    /// Reads the log header from disk into the in-memory header.
    fn read_head(&self) {
        let (dev, start) = {
            let inner = self.inner.lock();
            (inner.dev, inner.start)
        };

        let buf = BCACHE.read(dev, start);
        let header = unsafe { &*(buf.data().as_ptr() as *const LogHeader) };

        {
            let mut inner = self.inner.lock();
            inner.header.n = header.n;
            for i in 0..header.n as usize {
                inner.header.blocks[i] = header.blocks[i];
            }
        }

        BCACHE.release(buf);
    }

    /// Writes the in-memory log header to disk.
    /// This is the true point at which the current transaction commits.
    fn write_head(&self) {
        let (dev, start) = {
            let inner = self.inner.lock();
            (inner.dev, inner.start)
        };

        let mut buf = BCACHE.read(dev, start);
        let header = unsafe { &mut *(buf.data_mut().as_mut_ptr() as *mut LogHeader) };

        {
            let inner = self.inner.lock();
            header.n = inner.header.n;
            for i in 0..inner.header.n as usize {
                header.blocks[i] = inner.header.blocks[i];
            }
        }

        BCACHE.write(&mut buf);
        BCACHE.release(buf);
    }

    /// Copies modified blocks from the cache into the log region.
    fn write_log(&self) {
        let (dev, start, n) = {
            let inner = self.inner.lock();
            (inner.dev, inner.start, inner.header.n)
        };

        for tail in 0..n {
            let block = {
                let inner = self.inner.lock();
                inner.header.blocks[tail as usize]
            };

            let mut to = BCACHE.read(dev, start + tail + 1); // log slot
            let from = BCACHE.read(dev, block); // cached block

            to.data_mut().copy_from_slice(from.data());
            BCACHE.write(&mut to);

            BCACHE.release(to);
            BCACHE.release(from);
        }
    }

    /// Commits the current transaction, without the log lock held.
    fn commit(&self) {
        let n = {
            let inner = self.inner.lock();
            inner.header.n
        };

        if n > 0 {
            // modified blocks from cache to log
            self.write_log();
            // header to disk: the real commit
            self.write_head();
            // install writes to home locations
            self.install_trans(false);

            {
                let mut inner = self.inner.lock();
                inner.header.n = 0;
            }

            // erase the transaction from the log
            self.write_head();
        }
    }

    fn begin_op(&self) {
        let mut inner = self.inner.lock();

        loop {
            if inner.committing {
                inner = proc::sleep(self.channel(), inner);
            } else if inner.header.n as usize + (inner.outstanding as usize + 1) * MAX_OP_BLOCKS
                > LOGSIZE
            {
                // this op might exhaust the log space; wait for commit
                inner = proc::sleep(self.channel(), inner);
            } else {
                inner.outstanding += 1;
                break;
            }
        }
    }

    fn end_op(&self) {
        let mut do_commit = false;

        {
            let mut inner = self.inner.lock();

            inner.outstanding -= 1;

            if inner.committing {
                panic!("log committing");
            }

            if inner.outstanding == 0 {
                do_commit = true;
                inner.committing = true;
            } else {
                // begin_op may be waiting for log space, and decrementing
                // outstanding has decreased the amount of reserved space
                proc::wakeup(self.channel());
            }
        }

        if do_commit {
            // commit without holding locks, since it sleeps on disk I/O
            self.commit();
            let mut inner = self.inner.lock();
            inner.committing = false;
            proc::wakeup(self.channel());
        }
    }

    /// Recovers this log: installs any committed transaction found on disk
    /// and zeroes the header.
    fn recover(&self) {
        self.read_head();
        self.install_trans(true);

        {
            let mut inner = self.inner.lock();
            inner.header.n = 0;
        }
        self.write_head();
    }
}

/// A guard spanning one FS system call; all its filesystem modifications
/// form a single transaction. Reserves space on every active log (a path
/// walk or inode put may touch any mounted device).
#[derive(Debug)]
pub struct Operation {
    entered: [bool; MAX_MOUNTED_FILE_SYSTEMS],
}

impl Operation {
    pub fn begin() -> Self {
        let mut entered = [false; MAX_MOUNTED_FILE_SYSTEMS];

        for (i, log) in LOGS.iter().enumerate() {
            if log.inner.lock().active {
                log.begin_op();
                entered[i] = true;
            }
        }

        Self { entered }
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        for (i, log) in LOGS.iter().enumerate() {
            if self.entered[i] {
                log.end_op();
            }
        }
    }
}

/// The caller has modified `buf` and is done with it.
/// Records the block number and pins the buffer in the cache; commit will
/// do the disk write. Replaces `BCACHE.write()`; a typical use is:
///   let mut buf = BCACHE.read(...);
///   // modify buf.data_mut()
///   log::write(&buf);
///   BCACHE.release(buf);
pub fn write(buf: &Buf<'_>) {
    let log = LOGS
        .iter()
        .find(|log| {
            let inner = log.inner.lock();
            inner.active && inner.dev == buf.dev
        })
        .expect("log write: no log for device");

    let mut inner = log.inner.lock();

    if inner.header.n as usize >= LOGSIZE || inner.header.n >= inner.size - 1 {
        panic!("log write: transaction too big");
    }
    if inner.outstanding < 1 {
        panic!("log write: outside of transaction");
    }

    let n = inner.header.n as usize;
    let mut i = 0;
    while i < n {
        if inner.header.blocks[i] == buf.block_no {
            // log absorption: the block is already in this transaction
            break;
        }
        i += 1;
    }

    inner.header.blocks[i] = buf.block_no;

    if i == n {
        BCACHE.pin(buf);
        inner.header.n += 1;
    }
}

/// Brings up the log in `slot` for the file system on `dev`, replaying any
/// committed transaction left by a crash.
///
/// Called at mount, before the slot becomes visible to path resolution, so
/// no FS call can be using this log yet.
pub fn install(slot: usize, dev: DeviceNumber, sb: &SuperBlock) {
    const _: () = assert!(size_of::<LogHeader>() <= BSIZE);

    {
        let mut inner = LOGS[slot].inner.lock();
        assert!(!inner.active, "log install: slot in use");
        inner.dev = dev;
        inner.start = sb.logstart;
        inner.size = sb.nlog;
        inner.outstanding = 0;
        inner.committing = false;
    }

    LOGS[slot].recover();

    let mut inner = LOGS[slot].inner.lock();
    inner.active = true;
}

/// Shuts the log in `slot` down at unmount. The file system must be
/// quiescent: no outstanding operations.
pub fn deinit(slot: usize) {
    let mut inner = LOGS[slot].inner.lock();
    assert!(inner.active, "log deinit: not active");
    assert_eq!(inner.outstanding, 0, "log deinit: outstanding ops");
    assert!(!inner.committing, "log deinit: committing");
    inner.active = false;
}
