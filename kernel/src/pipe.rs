use alloc::sync::Arc;

use crate::error::KernelError;
use crate::file::{FILE_TABLE, File, FileType};
use crate::proc::{self, Channel, current_proc};
use crate::spinlock::SpinLock;
use crate::vm::VA;

const PIPE_SIZE: usize = 512;

/// Ring buffer state, under the pipe's spinlock.
#[derive(Debug)]
pub struct PipeInner {
    data: [u8; PIPE_SIZE],
    /// number of bytes read
    num_read: usize,
    /// number of bytes written
    num_write: usize,
    /// read fd is still open
    read_open: bool,
    /// write fd is still open
    write_open: bool,
}

/// One-directional inter-process byte channel.
#[derive(Debug)]
pub struct Pipe {
    inner: SpinLock<PipeInner>,
}

impl Pipe {
    /// Allocates a pipe and the two files for its ends.
    /// Returns (read end, write end).
    pub fn alloc() -> Result<(File, File), KernelError> {
        let mut f0 = try_log!(File::alloc());

        let mut f1 = match log!(File::alloc()) {
            Ok(file) => file,
            Err(err) => {
                f0.close();
                return Err(err);
            }
        };

        // the pipe itself lives on the heap and is freed when both ends
        // have dropped their Arc
        let Ok(pipe) = log!(Arc::try_new(Pipe {
            inner: SpinLock::new(
                PipeInner {
                    data: [0; PIPE_SIZE],
                    num_read: 0,
                    num_write: 0,
                    read_open: true,
                    write_open: true,
                },
                "pipe",
            ),
        })) else {
            f0.close();
            f1.close();
            err!(KernelError::OutOfMemory)
        };

        {
            let mut f0_inner = FILE_TABLE.inner[f0.id].lock();
            f0_inner.r#type = FileType::Pipe {
                pipe: Arc::clone(&pipe),
            };
            f0_inner.readable = true;
            f0_inner.writeable = false;
        }

        {
            let mut f1_inner = FILE_TABLE.inner[f1.id].lock();
            f1_inner.r#type = FileType::Pipe { pipe };
            f1_inner.readable = false;
            f1_inner.writeable = true;
        }

        Ok((f0, f1))
    }

    /// Stable identity for the sleep channels of this pipe.
    fn pipe_id(&self) -> usize {
        self as *const Pipe as usize
    }

    /// Closes one end. Waiters on the opposite end wake up and observe the
    /// closed flag.
    pub fn close(&self, writeable: bool) {
        let mut inner = self.inner.lock();

        if writeable {
            inner.write_open = false;
            proc::wakeup(Channel::PipeRead(self.pipe_id()));
        } else {
            inner.read_open = false;
            proc::wakeup(Channel::PipeWrite(self.pipe_id()));
        }
    }

    /// Writes `n` bytes from user memory, sleeping whenever the ring is
    /// full. Fails once the read end closes or the writer is killed.
    pub fn write(&self, addr: VA, n: usize) -> Result<usize, KernelError> {
        let proc = current_proc();

        let mut inner = self.inner.lock();

        let mut i = 0;
        while i < n {
            if !inner.read_open || proc.is_killed() {
                err!(KernelError::NotPermitted);
            }

            if inner.num_write == inner.num_read + PIPE_SIZE {
                // ring is full: let readers drain it
                proc::wakeup(Channel::PipeRead(self.pipe_id()));
                inner = proc::sleep(Channel::PipeWrite(self.pipe_id()), inner);
            } else {
                let mut ch = [0u8];
                if proc::copy_from_user(addr + i, &mut ch).is_err() {
                    break;
                }

                let index = inner.num_write % PIPE_SIZE;
                inner.data[index] = ch[0];
                inner.num_write += 1;
                i += 1;
            }
        }

        proc::wakeup(Channel::PipeRead(self.pipe_id()));

        Ok(i)
    }

    /// Reads up to `n` bytes into user memory, sleeping while the ring is
    /// empty and the write end is open. A closed write end reads as EOF.
    pub fn read(&self, addr: VA, n: usize) -> Result<usize, KernelError> {
        let proc = current_proc();

        let mut inner = self.inner.lock();

        while inner.num_read == inner.num_write && inner.write_open {
            if proc.is_killed() {
                err!(KernelError::NotPermitted);
            }

            inner = proc::sleep(Channel::PipeRead(self.pipe_id()), inner);
        }

        let mut i = 0;
        while i < n {
            if inner.num_read == inner.num_write {
                break;
            }

            let ch = inner.data[inner.num_read % PIPE_SIZE];
            if proc::copy_to_user(&[ch], addr + i).is_err() {
                break;
            }

            inner.num_read += 1;
            i += 1;
        }

        proc::wakeup(Channel::PipeWrite(self.pipe_id()));

        Ok(i)
    }
}
