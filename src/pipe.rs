//! A close-on-exec pipe used to relay errors from a forked child to the
//! parent before exec.
//!
//! The launch path forks, and the child reports setup failures (pgid, ASLR,
//! traceme, exec) by writing the error text into the pipe and exiting. The
//! write end carries `O_CLOEXEC`, so a successful exec closes it and the
//! parent's read returns empty.

use std::os::fd::{AsRawFd, OwnedFd};

use nix::fcntl::OFlag;
use nix::unistd;

use crate::errors::{OsErrorExt, Result};

pub struct Pipe {
    read: Option<OwnedFd>,
    write: Option<OwnedFd>,
}

impl Pipe {
    pub fn new(close_on_exec: bool) -> Result<Self> {
        let flags = if close_on_exec {
            OFlag::O_CLOEXEC
        } else {
            OFlag::empty()
        };
        let (read, write) = unistd::pipe2(flags).op("pipe2")?;
        Ok(Pipe {
            read: Some(read),
            write: Some(write),
        })
    }

    pub fn close_read(&mut self) {
        self.read = None;
    }

    pub fn close_write(&mut self) {
        self.write = None;
    }

    pub fn release_read(&mut self) -> Option<OwnedFd> {
        self.read.take()
    }

    pub fn release_write(&mut self) -> Option<OwnedFd> {
        self.write.take()
    }

    /// Reads whatever is available, up to 1 KiB. An empty vector means the
    /// write end was closed without data.
    pub fn read(&self) -> Result<Vec<u8>> {
        let fd = self.read.as_ref().expect("read end already closed");
        let mut buf = [0u8; 1024];
        let n = unistd::read(fd.as_raw_fd(), &mut buf).op("read from pipe")?;
        Ok(buf[..n].to_vec())
    }

    pub fn write(&self, data: &[u8]) -> Result<()> {
        let fd = self.write.as_ref().expect("write end already closed");
        unistd::write(fd, data).op("write to pipe")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut pipe = Pipe::new(true).unwrap();
        pipe.write(b"hello").unwrap();
        pipe.close_write();
        assert_eq!(pipe.read().unwrap(), b"hello");
    }

    #[test]
    fn empty_read_after_close() {
        let mut pipe = Pipe::new(true).unwrap();
        pipe.close_write();
        assert!(pipe.read().unwrap().is_empty());
    }
}
