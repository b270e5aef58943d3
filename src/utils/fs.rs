use std::fs::{self, DirBuilder};
use std::io::ErrorKind;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use log::{debug, error, warn};

use crate::IceBoxError;

/// Attempts made by [`create_temp_dir`] before giving up
pub const TEMP_PATH_ATTEMPTS: usize = 4;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// A directory exclusively owned by this handle, removed with everything inside it on drop
#[derive(Debug)]
pub struct PrivateDir {
  path: PathBuf,
}

impl PrivateDir {
  /// Allocate a fresh directory from a `%` model, see [`create_temp_dir`]
  pub fn create<P: AsRef<Path>>(model: P) -> Result<Self, IceBoxError> {
    let path = create_temp_dir(model, TEMP_PATH_ATTEMPTS)?;
    Ok(PrivateDir { path })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }
}

impl Drop for PrivateDir {
  fn drop(&mut self) {
    debug!("Remove private directory {}", self.path.to_string_lossy());
    if let Err(err) = remove_dir_all::remove_dir_all(&self.path) {
      error!(
        "Fails removing private directory {}: {}",
        self.path.to_string_lossy(),
        err
      );
    }
  }
}

/// Create a new directory whose name follows `model`, every `%` replaced by a random hex digit.
///
/// Relative models are placed under the system temp directory. Collisions are retried
/// up to `attempts` times; the returned path always names a directory this call created.
pub fn create_temp_dir<P: AsRef<Path>>(model: P, attempts: usize) -> Result<PathBuf, IceBoxError> {
  create_temp_dir_with(model, attempts, || HEX_DIGITS[fastrand::usize(..16)] as char)
}

/// [`create_temp_dir`] with a caller supplied source of placeholder characters
pub fn create_temp_dir_with<P, G>(
  model: P,
  attempts: usize,
  mut next_char: G,
) -> Result<PathBuf, IceBoxError>
where
  P: AsRef<Path>,
  G: FnMut() -> char,
{
  let model = model.as_ref();
  let model = if model.is_absolute() {
    model.to_path_buf()
  } else {
    std::env::temp_dir().join(model)
  };
  let model_text = model.to_string_lossy().to_string();

  for attempt in 1..=attempts {
    let candidate = model_text
      .chars()
      .map(|c| if c == '%' { next_char() } else { c })
      .collect::<String>();
    let candidate = PathBuf::from(candidate);

    match DirBuilder::new().mode(0o700).create(&candidate) {
      Ok(_) => {
        debug!("Create temp directory {}", candidate.to_string_lossy());
        return Ok(candidate);
      }
      Err(err) if err.kind() == ErrorKind::AlreadyExists => {
        warn!(
          "Temp directory {} already exists (attempt {} / {})",
          candidate.to_string_lossy(),
          attempt,
          attempts
        );
      }
      Err(err) => {
        return Err(IceBoxError::temp_path(format!(
          "can not create {}: {}",
          candidate.to_string_lossy(),
          err
        )));
      }
    }
  }

  Err(IceBoxError::temp_path(format!(
    "no free path for {} after {} attempts",
    model_text, attempts
  )))
}

/// Recursively copy the regular files and directories under `from` into `to`.
///
/// Symbolic links and special files are skipped, never followed.
pub fn copy_tree<P: AsRef<Path>, Q: AsRef<Path>>(from: P, to: Q) -> Result<(), IceBoxError> {
  let from = from.as_ref();
  let to = to.as_ref();
  fs::create_dir_all(to)?;

  for entry in fs::read_dir(from)? {
    let entry = entry?;
    let file_type = entry.file_type()?;
    let source = entry.path();
    let target = to.join(entry.file_name());

    if file_type.is_dir() {
      copy_tree(&source, &target)?;
    } else if file_type.is_file() {
      fs::copy(&source, &target)?;
    } else {
      warn!(
        "Skip copying {} (neither a regular file nor a directory)",
        source.to_string_lossy()
      );
    }
  }

  Ok(())
}
