/// maximum number of CPUs
pub const MAX_CPUS: usize = 8;
/// maximum number of processes
pub const MAX_PROCESSES: usize = 64;
/// open files per process
pub const MAX_FILES_PER_PROCESS: usize = 16;
/// open files per system
pub const MAX_FILES_SYSTEM: usize = 100;
/// maximum number of active in-memory inodes
pub const MAX_ACTIVE_INODES: usize = 50;
/// maximum major device number
pub const MAX_DEVICES: usize = 10;
/// maximum number of mounted file systems (incl. root)
pub const MAX_MOUNTED_FILE_SYSTEMS: usize = 4;
/// max exec arguments
pub const MAX_EXEC_ARGS: usize = 32;
/// max # of blocks any FS op writes
pub const MAX_OP_BLOCKS: usize = 10;
/// max data blocks in the on-disk log
pub const LOGSIZE: usize = MAX_OP_BLOCKS * 3;
/// size of disk block cache
pub const NBUF: usize = MAX_OP_BLOCKS * 3;
/// maximum file path name
pub const MAX_PATH: usize = 128;

/// kernel stack pages per process (debug builds dump call stacks and need more)
#[cfg(debug_assertions)]
pub const KERNEL_STACK_PAGES: usize = 4;
#[cfg(not(debug_assertions))]
pub const KERNEL_STACK_PAGES: usize = 1;

/// all user stacks start at one page and can grow to this
pub const USER_MAX_STACK_SIZE: usize = 16 * crate::riscv::PGSIZE;
