use std::collections::BTreeSet;
use std::fs;
use std::path::{Component, Path};

use log::info;
use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{getegid, geteuid};
use tempfile::tempdir;

use icebox::fork::{exit_child, spawn};
use icebox::{Command, ExitStatus, Jail, MountSpec, SandboxedCommand, Streams};

mod common;

fn shell(jail: Jail, script: &str) -> (ExitStatus, String) {
  let command = Command::new("/bin/sh").arg("-c").arg(script);
  let output = SandboxedCommand::new(jail, command)
    .spawn(Streams::capture_merged())
    .unwrap()
    .wait_with_output()
    .unwrap();
  let text = String::from_utf8_lossy(&output.stdout).to_string();
  info!("Jailed `{}` {}: {}", script, output.status, text.trim_end());
  (output.status, text)
}

fn first_component(path: &Path) -> String {
  match path.components().next() {
    Some(Component::Normal(name)) => name.to_string_lossy().to_string(),
    _ => panic!("mount destination {:?} is not relative", path),
  }
}

#[test]
fn it_should_expose_only_mounted_paths() {
  common::setup();
  if !common::sandbox_available() {
    return;
  }

  let input = tempdir().unwrap();
  let output = tempdir().unwrap();
  let mut mounts = MountSpec::toolchain();
  mounts.push(MountSpec::read(input.path(), "in").unwrap());
  mounts.push(MountSpec::write(output.path(), "out").unwrap());

  let mut expected: BTreeSet<String> = mounts.iter().map(|m| first_component(m.dst())).collect();
  expected.insert("proc".to_string());
  expected.insert("tmp".to_string());

  let (status, text) = shell(Jail::new(mounts).unwrap(), "ls -A /");
  assert!(status.success());
  let found: BTreeSet<String> = text.split_whitespace().map(|s| s.to_string()).collect();
  assert_eq!(found, expected);
}

#[test]
fn it_should_enforce_read_only_mounts() {
  common::setup();
  if !common::sandbox_available() {
    return;
  }

  let input = tempdir().unwrap();
  let output = tempdir().unwrap();
  fs::write(input.path().join("data.txt"), "hello").unwrap();
  let mut mounts = MountSpec::toolchain();
  mounts.push(MountSpec::read(input.path(), "in").unwrap());
  mounts.push(MountSpec::write(output.path(), "out").unwrap());

  let (status, text) = shell(
    Jail::new(mounts).unwrap(),
    "cat /in/data.txt; echo; echo written > /in/new.txt; echo $?; echo written > /out/new.txt",
  );
  assert!(status.success());
  let lines: Vec<&str> = text.lines().collect();
  assert_eq!(lines.first(), Some(&"hello"));
  assert!(lines.iter().any(|line| *line != "0" && line.parse::<i32>().is_ok()));
  assert!(!input.path().join("new.txt").exists());
  assert_eq!(
    fs::read_to_string(output.path().join("new.txt")).unwrap(),
    "written\n"
  );
}

#[test]
fn it_should_isolate_identity() {
  common::setup();
  if !common::sandbox_available() {
    return;
  }

  let (status, text) = shell(
    Jail::new(MountSpec::toolchain()).unwrap(),
    "id -u; id -g; cat /proc/sys/kernel/hostname; echo $$; echo scratch > /tmp/a && cat /tmp/a",
  );
  assert!(status.success());
  let lines: Vec<&str> = text.lines().collect();
  assert_eq!(lines, vec!["1000", "1000", "icebox", "1", "scratch"]);
}

#[test]
fn it_should_mirror_exit_code() {
  common::setup();
  if !common::sandbox_available() {
    return;
  }

  let (status, _) = shell(Jail::new(MountSpec::toolchain()).unwrap(), "exit 3");
  assert_eq!(status, ExitStatus::Exited(3));

  let command = Command::new("/nonexistent/program");
  let status = SandboxedCommand::new(Jail::new(MountSpec::toolchain()).unwrap(), command)
    .spawn(Streams::inherit())
    .unwrap()
    .wait()
    .unwrap();
  assert_eq!(status, ExitStatus::Exited(127));
}

#[test]
fn it_should_remove_jail_root() {
  common::setup();
  if !common::sandbox_available() {
    return;
  }

  let jail = Jail::new(MountSpec::toolchain()).unwrap();
  let root = jail.root().to_path_buf();
  assert!(root.is_dir());
  let (status, _) = shell(jail, "true");
  assert!(status.success());
  assert!(!root.exists());
}

#[test]
fn it_should_keep_captured_output_clean() {
  common::setup();
  if !common::sandbox_available() {
    return;
  }

  let (status, text) = shell(Jail::new(MountSpec::toolchain()).unwrap(), "true");
  assert!(status.success());
  assert_eq!(text, "");

  let (status, text) = shell(Jail::new(MountSpec::toolchain()).unwrap(), "echo only");
  assert!(status.success());
  assert_eq!(text, "only\n");
}

/// Become root of a private user and mount namespace, so a test can stack mounts
fn own_mount_namespace() -> Result<(), String> {
  let uid = geteuid();
  let gid = getegid();
  unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS).map_err(|e| e.to_string())?;
  fs::write("/proc/self/uid_map", format!("0 {} 1\n", uid)).map_err(|e| e.to_string())?;
  fs::write("/proc/self/setgroups", "deny").map_err(|e| e.to_string())?;
  fs::write("/proc/self/gid_map", format!("0 {} 1\n", gid)).map_err(|e| e.to_string())?;
  mount::<str, str, str, str>(None, "/", None, MsFlags::MS_REC | MsFlags::MS_PRIVATE, None)
    .map_err(|e| e.to_string())
}

#[test]
fn it_should_make_nested_mounts_read_only() {
  common::setup();
  if !common::sandbox_available() {
    return;
  }

  let input = tempdir().unwrap();
  let sub = input.path().join("sub");
  fs::create_dir(&sub).unwrap();
  let input_path = input.path().to_path_buf();

  let pid = spawn(|| {
    if let Err(err) = own_mount_namespace() {
      info!("Can not stack a mount for the nested bind: {}", err);
      exit_child(2);
    }
    if mount(Some("tmpfs"), &sub, Some("tmpfs"), MsFlags::empty(), None::<&str>).is_err() {
      exit_child(2);
    }
    if fs::write(sub.join("marker"), "nested").is_err() {
      exit_child(2);
    }

    let mut mounts = MountSpec::toolchain();
    mounts.push(MountSpec::read(&input_path, "in").unwrap());
    let command = Command::new("/bin/sh")
      .arg("-c")
      .arg("cat /in/sub/marker && ! (echo x > /in/sub/escaped.txt)");
    let status = SandboxedCommand::new(Jail::new(mounts).unwrap(), command)
      .spawn(Streams::inherit())
      .unwrap()
      .wait()
      .unwrap();

    let escaped = sub.join("escaped.txt").exists();
    info!("Nested bind: {}, written through: {}", status, escaped);
    exit_child(if status.success() && !escaped { 0 } else { 1 })
  });

  match waitpid(pid, None).unwrap() {
    WaitStatus::Exited(_, 2) => info!("Skip: nested namespaces are not available"),
    status => assert_eq!(status, WaitStatus::Exited(pid, 0)),
  }
}
