use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::launch::{Stream, Streams};

/// Launch options of one supervised process.
///
/// A flag is set by giving its value; options are fixed once the process is launched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOptions {
  stdin: Option<RawFd>,
  stdout: Option<RawFd>,
  stderr: Option<RawFd>,
  idle_time_limit: Option<Duration>,
  cpu_time_limit: Option<Duration>,
  memory_limit: Option<u64>,
}

impl ProcessOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Read stdin from `fd`
  pub fn stdin(mut self, fd: RawFd) -> Self {
    self.stdin = Some(fd);
    self
  }

  /// Write stdout to `fd`
  pub fn stdout(mut self, fd: RawFd) -> Self {
    self.stdout = Some(fd);
    self
  }

  /// Write stderr to `fd`
  pub fn stderr(mut self, fd: RawFd) -> Self {
    self.stderr = Some(fd);
    self
  }

  /// Kill once the host has been idle this long while the process lives
  pub fn idle_time_limit(mut self, limit: Duration) -> Self {
    self.idle_time_limit = Some(limit);
    self
  }

  /// Kill once the process tree has used this much user and system time
  pub fn cpu_time_limit(mut self, limit: Duration) -> Self {
    self.cpu_time_limit = Some(limit);
    self
  }

  /// Recorded only, memory is not limited
  pub fn memory_limit(mut self, bytes: u64) -> Self {
    self.memory_limit = Some(bytes);
    self
  }

  pub fn get_idle_time_limit(&self) -> Option<Duration> {
    self.idle_time_limit
  }

  pub fn get_cpu_time_limit(&self) -> Option<Duration> {
    self.cpu_time_limit
  }

  pub fn get_memory_limit(&self) -> Option<u64> {
    self.memory_limit
  }

  /// Whether a timer has to watch this process
  pub fn is_monitored(&self) -> bool {
    self.idle_time_limit.is_some() || self.cpu_time_limit.is_some()
  }

  pub(crate) fn streams(&self) -> Streams {
    let wire = |fd: Option<RawFd>| fd.map(Stream::Fd).unwrap_or(Stream::Inherit);
    Streams::inherit()
      .stdin(wire(self.stdin))
      .stdout(wire(self.stdout))
      .stderr(wire(self.stderr))
  }
}
