use std::fs::{self, canonicalize, create_dir_all};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path, PathBuf};

use log::{debug, error};
use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::statvfs::{statvfs, FsFlags};
use nix::unistd;

use crate::IceBoxError;

/// One bind mount performed while building a jail
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
  read_only: bool,
  src: PathBuf,
  dst: PathBuf,
}

impl MountSpec {
  /// Host toolchain directories, bound read-only at the same short names.
  ///
  /// JDK configuration under `/etc/java-*` is included when present, the JDK's own
  /// `conf` tree links into it.
  pub fn toolchain() -> Vec<Self> {
    let mut names: Vec<String> = ["bin", "lib", "lib64", "usr", "etc/alternatives"]
      .into_iter()
      .map(|name| name.to_string())
      .collect();
    names.extend(java_config_dirs());
    names
      .into_iter()
      .filter_map(|name| {
        let src = Path::new("/").join(&name);
        if src.is_dir() {
          Self::read(src, &name).ok()
        } else {
          debug!("Skip missing toolchain directory {}", src.to_string_lossy());
          None
        }
      })
      .collect()
  }

  fn new<SP: Into<PathBuf>, DP: Into<PathBuf>>(
    read_only: bool,
    src: SP,
    dst: DP,
  ) -> Result<Self, IceBoxError> {
    let src: PathBuf = src.into();
    let dst: PathBuf = dst.into();
    let src = if src.is_absolute() {
      src
    } else {
      canonicalize(&src)?
    };
    let is_relative = dst
      .components()
      .all(|component| matches!(component, Component::Normal(_)));
    if !is_relative || dst.as_os_str().is_empty() {
      error!(
        "The dst path {} in mounts should be relative to the jail root",
        dst.to_string_lossy()
      );
      return Err(IceBoxError::jail(format!(
        "mount destination {} is not a plain relative path",
        dst.to_string_lossy()
      )));
    }
    Ok(MountSpec { read_only, src, dst })
  }

  /// Bind `src` read-only at `dst`
  pub fn read<SP: Into<PathBuf>, DP: Into<PathBuf>>(src: SP, dst: DP) -> Result<Self, IceBoxError> {
    Self::new(true, src, dst)
  }

  /// Bind `src` writable at `dst`
  pub fn write<SP: Into<PathBuf>, DP: Into<PathBuf>>(
    src: SP,
    dst: DP,
  ) -> Result<Self, IceBoxError> {
    Self::new(false, src, dst)
  }

  pub fn read_only(&self) -> bool {
    self.read_only
  }

  pub fn src(&self) -> &PathBuf {
    &self.src
  }

  pub fn dst(&self) -> &PathBuf {
    &self.dst
  }
}

/// `etc/java-*` directories of the host, sorted
fn java_config_dirs() -> Vec<String> {
  let entries = match fs::read_dir("/etc") {
    Ok(entries) => entries,
    Err(_) => return vec![],
  };
  let mut names: Vec<String> = entries
    .flatten()
    .filter(|entry| entry.path().is_dir())
    .filter_map(|entry| entry.file_name().to_str().map(|name| name.to_string()))
    .filter(|name| name.starts_with("java-"))
    .map(|name| format!("etc/{}", name))
    .collect();
  names.sort();
  names
}

/// Mount a fresh, empty tmpfs at `target`
pub fn mount_tmpfs(target: &Path) -> Result<(), IceBoxError> {
  debug!("Mount tmpfs at {}", target.to_string_lossy());
  mount(
    Some("tmpfs"),
    target,
    Some("tmpfs"),
    MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
    Some("mode=0755"),
  )?;
  Ok(())
}

/// Flags the kernel locks on a mount inherited from a more privileged namespace
fn locked_flags(src: &Path) -> Result<MsFlags, IceBoxError> {
  let stat = statvfs(src)?;
  let flags = stat.flags();
  let mut locked = MsFlags::MS_NOSUID;
  let pairs = [
    (FsFlags::ST_NODEV, MsFlags::MS_NODEV),
    (FsFlags::ST_NOEXEC, MsFlags::MS_NOEXEC),
    (FsFlags::ST_NOATIME, MsFlags::MS_NOATIME),
    (FsFlags::ST_NODIRATIME, MsFlags::MS_NODIRATIME),
    (FsFlags::ST_RELATIME, MsFlags::MS_RELATIME),
  ];
  for (fs_flag, ms_flag) in pairs {
    if flags.contains(fs_flag) {
      locked |= ms_flag;
    }
  }
  Ok(locked)
}

/// Undo the octal escapes (`\040` and friends) of a `/proc/self/mountinfo` field
fn unescape_mount_path(field: &str) -> PathBuf {
  let bytes = field.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut i = 0;
  while i < bytes.len() {
    let digits = bytes.get(i + 1..i + 4).unwrap_or(&[]);
    let escaped = digits.len() == 3 && digits.iter().all(|d| (b'0'..=b'7').contains(d));
    if bytes[i] == b'\\' && escaped {
      let code = digits.iter().fold(0u32, |acc, d| acc * 8 + (d - b'0') as u32);
      out.push(code as u8);
      i += 4;
      continue;
    }
    out.push(bytes[i]);
    i += 1;
  }
  PathBuf::from(std::ffi::OsStr::from_bytes(&out))
}

/// Mount points strictly below `target`, parents before children
fn submounts(mountinfo: &str, target: &Path) -> Vec<PathBuf> {
  let mut points: Vec<PathBuf> = mountinfo
    .lines()
    .filter_map(|line| line.split(' ').nth(4))
    .map(unescape_mount_path)
    .filter(|point| point != target && point.starts_with(target))
    .collect();
  points.sort();
  points.dedup();
  points.sort_by_key(|point| point.components().count());
  points
}

/// Remount the bind at `target` read-only, keeping the flags the kernel locked
fn remount_read_only(target: &Path) -> Result<(), IceBoxError> {
  let flags = locked_flags(target)?;
  mount::<str, Path, str, str>(
    None,
    target,
    None,
    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY | flags,
    None,
  )?;
  Ok(())
}

/// Bind `spec.src()` with everything mounted below it onto `root/spec.dst()`, then
/// remount it read-only when requested.
///
/// A bind mount can not be created read-only in one call, hence the remount. It only
/// touches one mount, so every submount carried over by the recursive bind gets its own.
pub fn bind_mount(spec: &MountSpec, root: &Path) -> Result<(), IceBoxError> {
  let target = root.join(spec.dst());
  create_dir_all(&target)?;
  let target = canonicalize(&target)?;
  debug!("Mount directory {:?} -> {:?}", spec.src(), &target);

  mount::<PathBuf, PathBuf, str, str>(
    Some(spec.src()),
    &target,
    None,
    MsFlags::MS_BIND | MsFlags::MS_REC,
    None,
  )?;

  if spec.read_only() {
    remount_read_only(&target)?;
    let mountinfo = fs::read_to_string("/proc/self/mountinfo")?;
    for point in submounts(&mountinfo, &target) {
      debug!("Remount nested mount {:?} read-only", &point);
      remount_read_only(&point)?;
    }
  }

  Ok(())
}

/// Make every mount below `/` private so nothing propagates back to the host
pub fn make_private() -> Result<(), IceBoxError> {
  mount::<str, str, str, str>(
    None,
    "/",
    None,
    MsFlags::MS_REC | MsFlags::MS_PRIVATE,
    None,
  )?;
  Ok(())
}

/// Mount a new procfs instance at `target`
pub fn mount_proc(target: &Path) -> Result<(), IceBoxError> {
  debug!("Mount proc at {}", target.to_string_lossy());
  mount(
    Some("proc"),
    target,
    Some("proc"),
    MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
    None::<&str>,
  )?;
  Ok(())
}

/// Exchange the root of the calling process with `new_root`, the old one lands on `put_old`
pub fn pivot_root(new_root: &Path, put_old: &Path) -> Result<(), IceBoxError> {
  debug!(
    "Pivot root to {}, old root at {}",
    new_root.to_string_lossy(),
    put_old.to_string_lossy()
  );
  unistd::pivot_root(new_root, put_old)?;
  Ok(())
}

/// Lazily unmount `target`, the teardown finishes when the last reference drops
pub fn detach(target: &Path) -> Result<(), IceBoxError> {
  debug!("Detach mount {}", target.to_string_lossy());
  umount2(target, MntFlags::MNT_DETACH)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn destination_must_be_relative() {
    assert!(MountSpec::read("/usr", "/usr").is_err());
    assert!(MountSpec::read("/usr", "../usr").is_err());
    assert!(MountSpec::read("/usr", "").is_err());
    let spec = MountSpec::write("/tmp", "out").unwrap();
    assert!(!spec.read_only());
    assert_eq!(spec.dst(), &PathBuf::from("out"));
  }

  #[test]
  fn toolchain_is_read_only_and_exists() {
    let specs = MountSpec::toolchain();
    assert!(specs.iter().any(|spec| spec.dst() == Path::new("usr")));
    for spec in specs.iter() {
      assert!(spec.read_only());
      assert!(spec.src().is_dir());
    }
    for name in java_config_dirs() {
      assert!(specs.iter().any(|spec| spec.dst() == Path::new(&name)));
    }
  }

  #[test]
  fn java_config_dirs_live_under_etc() {
    for name in java_config_dirs() {
      assert!(name.starts_with("etc/java-"));
      assert!(Path::new("/").join(&name).is_dir());
    }
  }

  #[test]
  fn mountinfo_paths_are_unescaped() {
    assert_eq!(unescape_mount_path("/tmp/a\\040b"), PathBuf::from("/tmp/a b"));
    assert_eq!(unescape_mount_path("/tmp/tab\\011"), PathBuf::from("/tmp/tab\t"));
    assert_eq!(unescape_mount_path("/tmp/x\\9"), PathBuf::from("/tmp/x\\9"));
    assert_eq!(unescape_mount_path("/plain"), PathBuf::from("/plain"));
  }

  #[test]
  fn submounts_are_listed_parents_first() {
    let mountinfo = "\
22 1 8:1 / / rw,relatime shared:1 - ext4 /dev/sda1 rw
40 22 0:40 / /tmp/root rw,nosuid - tmpfs tmpfs rw
41 40 8:1 /srv/in /tmp/root/in ro,nosuid - ext4 /dev/sda1 rw
43 41 0:44 / /tmp/root/in/sub/deep rw - tmpfs tmpfs rw
42 41 0:43 / /tmp/root/in/sub rw - tmpfs tmpfs rw
44 40 0:45 / /tmp/root/in\\040two rw - tmpfs tmpfs rw
45 40 0:46 / /tmp/root/input rw - tmpfs tmpfs rw
";
    let points = submounts(mountinfo, Path::new("/tmp/root/in"));
    assert_eq!(
      points,
      vec![
        PathBuf::from("/tmp/root/in/sub"),
        PathBuf::from("/tmp/root/in/sub/deep"),
      ]
    );
  }
}
