use crate::buf::Buf;
use crate::console::Console;
use crate::error::KernelError;
use crate::param::MAX_DEVICES;
use crate::proc::Addr;
use crate::virtio_disk;
use crate::vm::VA;

/// Device number: major in the upper 12 bits, minor in the lower 20, the
/// Linux kdev_t split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct DeviceNumber(u32);

const MINOR_BITS: u32 = 20;
const MINOR_MASK: u32 = (1 << MINOR_BITS) - 1;

impl DeviceNumber {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self((major << MINOR_BITS) | (minor & MINOR_MASK))
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn as_raw(&self) -> u32 {
        self.0
    }

    pub const fn major(&self) -> u32 {
        self.0 >> MINOR_BITS
    }

    pub const fn minor(&self) -> u32 {
        self.0 & MINOR_MASK
    }
}

pub const CONSOLE_MAJOR: u32 = 1;
pub const VIRTIO_DISK_MAJOR: u32 = 2;

/// the block device the root file system lives on
pub const ROOT_DEVICE: DeviceNumber = DeviceNumber::new(VIRTIO_DISK_MAJOR, 0);

/// Character device interface; read/write move `n` bytes to/from `Addr`.
#[derive(Clone, Copy)]
pub struct CharDevice {
    pub read: fn(dst: Addr, n: usize) -> Result<usize, KernelError>,
    pub write: fn(src: Addr, n: usize) -> Result<usize, KernelError>,
    pub ioctl: Option<fn(request: usize, arg: VA) -> Result<usize, KernelError>>,
}

/// Character device table, indexed by major number.
pub static DEVICES: [Option<CharDevice>; MAX_DEVICES] = {
    let mut devices = [None; MAX_DEVICES];
    devices[CONSOLE_MAJOR as usize] = Some(CharDevice {
        read: Console::read,
        write: Console::write,
        ioctl: None,
    });
    devices
};

/// Looks up the character device behind a device number.
pub fn char_device(dev: DeviceNumber) -> Result<&'static CharDevice, KernelError> {
    DEVICES
        .get(dev.major() as usize)
        .and_then(|d| d.as_ref())
        .ok_or(KernelError::NoDevice)
}

/// Moves one buffer between the cache and the block device behind `dev`.
/// The caller holds the buffer's sleep lock.
pub fn block_rw(dev: DeviceNumber, buf: &mut Buf<'_>, write: bool) {
    match dev.major() {
        VIRTIO_DISK_MAJOR => virtio_disk::rw(buf, write),
        _ => panic!("block_rw: no block device with major {}", dev.major()),
    }
}
