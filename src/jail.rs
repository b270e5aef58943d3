//! Filesystem jail: a private root built from a tmpfs and a list of bind mounts.
//!
//! Everything in here that touches namespaces or mounts must run inside a freshly
//! forked child which is about to occupy the new namespaces alone; membership can
//! only be given up by exiting.

use std::fs::{self, DirBuilder, Permissions};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use log::debug;
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, getegid, geteuid, sethostname, setresgid, setresuid, Gid, Uid};

use crate::fork::{exit_child, spawn};
use crate::utils::mount::{bind_mount, detach, make_private, mount_proc, mount_tmpfs, pivot_root};
use crate::utils::{MountSpec, PrivateDir};
use crate::IceBoxError;

/// Uid and gid the jailed processes run as, mapped to the invoking user on the host
pub const SANDBOX_ID: u32 = 1000;

pub const SANDBOX_HOSTNAME: &str = "icebox";

const OLD_ROOT: &str = "old_root";

/// Namespaces unshared together when a jail is built
pub fn namespace_flags() -> CloneFlags {
  CloneFlags::CLONE_NEWNS
    | CloneFlags::CLONE_NEWUTS
    | CloneFlags::CLONE_NEWIPC
    | CloneFlags::CLONE_NEWUSER
    | CloneFlags::CLONE_NEWPID
    | CloneFlags::CLONE_NEWNET
}

/// Host-side plan for one jail: the directory that will carry the tmpfs root and the binds
#[derive(Debug)]
pub struct Jail {
  root: PrivateDir,
  mounts: Vec<MountSpec>,
}

/// A jail whose root has been pivoted while the old root is still attached
#[derive(Debug)]
pub struct PivotedRoot {
  old_root: PathBuf,
}

impl Jail {
  /// Allocate the host directory for the jail root, before any fork
  pub fn new(mounts: Vec<MountSpec>) -> Result<Self, IceBoxError> {
    let root = PrivateDir::create("icebox.root.%%%%%%%%%%%%")?;
    Ok(Jail { root, mounts })
  }

  pub fn root(&self) -> &Path {
    self.root.path()
  }

  pub fn mounts(&self) -> &Vec<MountSpec> {
    &self.mounts
  }

  /// Build the whole jail in the calling process and drop the old root
  pub fn create(&self) -> Result<(), IceBoxError> {
    self.enter()?.detach()
  }

  /// Unshare, populate the tmpfs root and pivot into it; the old root stays attached
  pub fn enter(&self) -> Result<PivotedRoot, IceBoxError> {
    let host_uid = geteuid();
    let host_gid = getegid();

    unshare(namespace_flags())
      .map_err(|err| IceBoxError::jail(format!("unshare namespaces: {}", err)))?;
    map_identity(host_uid, host_gid)?;
    sethostname(SANDBOX_HOSTNAME)?;
    make_private()?;

    let root = self.root();
    mount_tmpfs(root)?;
    for spec in self.mounts.iter() {
      bind_mount(spec, root)?;
    }
    DirBuilder::new().mode(0o755).create(root.join("proc"))?;
    let tmp = root.join("tmp");
    DirBuilder::new().mode(0o755).create(&tmp)?;
    fs::set_permissions(&tmp, Permissions::from_mode(0o1777))?;

    chdir(root)?;
    DirBuilder::new().mode(0o700).create(OLD_ROOT)?;
    pivot_root(Path::new("."), Path::new(OLD_ROOT))?;
    chdir("/")?;

    Ok(PivotedRoot {
      old_root: Path::new("/").join(OLD_ROOT),
    })
  }
}

impl PivotedRoot {
  /// Mount a fresh `/proc`; only the first process of the new pid namespace sees its own tree
  pub fn mount_proc(&self) -> Result<(), IceBoxError> {
    mount_proc(Path::new("/proc"))
  }

  /// Detach the old root and remove its now empty mount point
  pub fn detach(&self) -> Result<(), IceBoxError> {
    detach(&self.old_root)?;
    fs::remove_dir(&self.old_root)?;
    debug!("Old root detached");
    Ok(())
  }
}

/// Map [`SANDBOX_ID`] onto the host ids and switch to it, keeping the namespace capabilities
fn map_identity(host_uid: Uid, host_gid: Gid) -> Result<(), IceBoxError> {
  fs::write(
    "/proc/self/uid_map",
    format!("{} {} 1\n", SANDBOX_ID, host_uid),
  )
  .map_err(|err| IceBoxError::jail(format!("write uid_map: {}", err)))?;
  match fs::write("/proc/self/setgroups", "deny") {
    Ok(_) => {}
    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
    Err(err) => return Err(IceBoxError::jail(format!("write setgroups: {}", err))),
  }
  fs::write(
    "/proc/self/gid_map",
    format!("{} {} 1\n", SANDBOX_ID, host_gid),
  )
  .map_err(|err| IceBoxError::jail(format!("write gid_map: {}", err)))?;

  let gid = Gid::from_raw(SANDBOX_ID);
  let uid = Uid::from_raw(SANDBOX_ID);
  setresgid(gid, gid, gid)?;
  setresuid(uid, uid, uid)?;
  Ok(())
}

/// Whether this host lets us build a jail, tried out in a throwaway child
pub fn probe() -> bool {
  let jail = match Jail::new(vec![]) {
    Ok(jail) => jail,
    Err(_) => return false,
  };
  let pid = spawn(|| match jail.create() {
    Ok(_) => exit_child(0),
    Err(_) => exit_child(1),
  });
  matches!(waitpid(pid, None), Ok(WaitStatus::Exited(_, 0)))
}
