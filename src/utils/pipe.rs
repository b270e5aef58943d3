use std::fs::File;
use std::os::unix::prelude::{FromRawFd, RawFd};

use nix::{
  fcntl::OFlag,
  unistd::{close, dup2, pipe2},
};

use crate::error::IceBoxError;

/// A close-on-exec pipe created before fork, split into one end per process afterwards
pub struct IceBoxPipe(RawFd, RawFd);

pub struct IceBoxReadPipe(RawFd);

impl IceBoxPipe {
  pub fn new() -> Result<Self, IceBoxError> {
    let result = pipe2(OFlag::O_CLOEXEC)?;
    Ok(IceBoxPipe(result.0, result.1))
  }

  /// Write end, for handing to a child through its launch options
  pub fn write_fd(&self) -> RawFd {
    self.1
  }

  /// Keep the read end, used by the parent
  pub fn read(self) -> Result<IceBoxReadPipe, IceBoxError> {
    close(self.1)?;
    Ok(IceBoxReadPipe(self.0))
  }

  /// Duplicate the write end onto `target` in the child (the copy loses close-on-exec)
  pub fn redirect_write(&self, target: RawFd) -> Result<(), IceBoxError> {
    if self.1 != target {
      dup2(self.1, target)?;
    }
    Ok(())
  }
}

impl IceBoxReadPipe {
  /// Hand the read end over to a `File`
  pub fn into_file(self) -> File {
    let fd = self.0;
    std::mem::forget(self);
    unsafe { File::from_raw_fd(fd) }
  }
}

impl Drop for IceBoxReadPipe {
  fn drop(&mut self) {
    let _ = close(self.0);
  }
}
