use nix::errno::Errno;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HeapError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("mmap refused placement at {addr:#x}: {errno}")]
    MapFailed { addr: usize, errno: Errno },

    #[error("heap mapped at {actual:#x} but its header records {expected:#x}")]
    WrongBase { expected: usize, actual: usize },

    #[error("heap header identity mismatch")]
    InvalidVersion,

    #[error("heap exhausted: {requested} bytes requested")]
    OutOfMemory { requested: usize },
}
