use std::ffi::CString;
use std::fmt::Display;
use std::path::Path;

use flexi_logger::DeferredNow;
use log::{error, Record};

use crate::IceBoxError;

pub use fs::{copy_tree, create_temp_dir, create_temp_dir_with, PrivateDir};
pub use mount::MountSpec;
pub use pipe::{IceBoxPipe, IceBoxReadPipe};

pub mod fs;
pub mod mount;
pub mod pipe;

/// `PATH` handed to every sandboxed program
pub const SANDBOX_PATH: &str = "/usr/bin:/bin";

/// A logline-formatter that produces log lines like <br>
/// ```[datetime: INFO] Task successfully read from conf.json```
pub fn default_format(
  w: &mut dyn std::io::Write,
  now: &mut DeferredNow,
  record: &Record,
) -> Result<(), std::io::Error> {
  write!(
    w,
    "[{}: {:5}] {}",
    now.format("%Y-%m-%d %H:%M:%S"),
    record.level(),
    record.args()
  )
}

/// Log an integrity failure and abort the whole process.
///
/// Called whenever a half-finished privileged operation (namespace, mount, fork,
/// kernel accounting) cannot be continued from.
pub fn fatal<E: Display>(what: &str, err: E) -> ! {
  error!("{}: {}", what, err);
  log::logger().flush();
  std::process::abort()
}

pub(crate) fn into_c_string<S: AsRef<str>>(string: S) -> Result<CString, IceBoxError> {
  let string = string.as_ref();
  CString::new(string)
    .map_err(|_| IceBoxError::exec(format!("{:?} contains an interior NUL byte", string)))
}

pub(crate) fn path_c_string<P: AsRef<Path>>(path: P) -> Result<CString, IceBoxError> {
  into_c_string(path.as_ref().to_string_lossy())
}

/// Marshal an argument vector for `execve`
pub(crate) fn c_strings<S: AsRef<str>>(args: &[S]) -> Result<Vec<CString>, IceBoxError> {
  args.iter().map(into_c_string).collect()
}

/// Marshal `KEY=VALUE` pairs for `execve`
pub(crate) fn env_block(env: &[(String, String)]) -> Result<Vec<CString>, IceBoxError> {
  env
    .iter()
    .map(|(key, value)| {
      if key.is_empty() || key.contains('=') {
        Err(IceBoxError::exec(format!("Invalid environment variable name {:?}", key)))
      } else {
        into_c_string(format!("{}={}", key, value))
      }
    })
    .collect()
}
