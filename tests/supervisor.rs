use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::os::unix::io::FromRawFd;
use std::time::Duration;

use log::info;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, Signal};
use nix::unistd::{close, pipe2};

use icebox::supervisor::{ClockTicks, WAIT_JITTER};
use icebox::{
  Command, ExitStatus, Jail, LimitExceeded, MountSpec, ProcessOptions, SandboxedCommand,
  Supervisor,
};

mod common;

fn shell(script: &str) -> Command {
  Command::new("/bin/sh").arg("-c").arg(script)
}

#[tokio::test]
async fn it_should_report_exit_status() {
  common::setup();

  let mut supervisor = Supervisor::new().unwrap();
  let pid = supervisor.run(&shell("exit 7"), ProcessOptions::new()).unwrap();
  assert_eq!(supervisor.tracked(), 1);

  let report = supervisor.next_report().await.unwrap().unwrap();
  assert_eq!(report.pid, pid);
  assert_eq!(report.status, ExitStatus::Exited(7));
  assert_eq!(report.limit, None);
  assert_eq!(supervisor.tracked(), 0);
  assert!(supervisor.next_report().await.unwrap().is_none());
}

#[tokio::test]
async fn it_should_reap_every_child() {
  common::setup();

  let mut supervisor = Supervisor::new().unwrap();
  let mut pids = BTreeSet::new();
  for i in 0..5 {
    let script = format!("sleep 0.{}; exit {}", i, i);
    pids.insert(supervisor.run(&shell(&script), ProcessOptions::new()).unwrap());
  }
  assert_eq!(supervisor.tracked(), 5);

  let reports = supervisor.wait_all().await.unwrap();
  assert_eq!(reports.len(), 5);
  assert_eq!(supervisor.tracked(), 0);
  let reaped: BTreeSet<_> = reports.iter().map(|r| r.pid).collect();
  assert_eq!(reaped, pids);
  let codes: BTreeSet<_> = reports.iter().filter_map(|r| r.status.code()).collect();
  assert_eq!(codes, (0..5).collect());
}

#[tokio::test]
async fn it_should_kill_on_cpu_time_limit() {
  common::setup();

  let limit = Duration::from_millis(300);
  let mut supervisor = Supervisor::new().unwrap();
  supervisor
    .run(
      &shell("while :; do :; done"),
      ProcessOptions::new().cpu_time_limit(limit),
    )
    .unwrap();

  let report = supervisor.next_report().await.unwrap().unwrap();
  info!("Busy loop report: {:?}", report);
  assert_eq!(report.status, ExitStatus::Signaled(Signal::SIGKILL));
  assert_eq!(report.limit, Some(LimitExceeded::CpuTime));
  assert!(report.cpu_time >= limit);

  // CPU time is sampled in clock ticks: a check can read up to one tick short of the
  // limit and reschedule once more, and the final sample at reap rounds down again.
  let tick = ClockTicks::from_host().unwrap().to_duration(1);
  let bound = limit + WAIT_JITTER * 2 + tick * 3;
  assert!(
    report.cpu_time <= bound,
    "killed at {:?}, later than {:?} (tick {:?})",
    report.cpu_time,
    bound,
    tick
  );
}

#[tokio::test]
async fn it_should_kill_on_idle_time_limit() {
  common::setup();

  let limit = Duration::from_millis(300);
  let mut supervisor = Supervisor::new().unwrap();
  supervisor
    .run(
      &Command::new("/bin/sleep").arg("30"),
      ProcessOptions::new().idle_time_limit(limit),
    )
    .unwrap();

  let report = supervisor.next_report().await.unwrap().unwrap();
  info!("Sleep report: {:?}", report);
  assert_eq!(report.status, ExitStatus::Signaled(Signal::SIGKILL));
  assert_eq!(report.limit, Some(LimitExceeded::IdleTime));
  assert!(report.idle_time >= limit);
  assert!(report.wall_time < Duration::from_secs(30));
}

#[tokio::test]
async fn it_should_redirect_output() {
  common::setup();

  let (read, write) = pipe2(OFlag::O_CLOEXEC).unwrap();
  let mut supervisor = Supervisor::new().unwrap();
  supervisor
    .run(
      &shell("echo redirected; echo lost >&2"),
      ProcessOptions::new().stdout(write).memory_limit(1 << 20),
    )
    .unwrap();
  close(write).unwrap();

  let report = supervisor.next_report().await.unwrap().unwrap();
  assert!(report.status.success());

  let mut text = String::new();
  let mut file = unsafe { File::from_raw_fd(read) };
  file.read_to_string(&mut text).unwrap();
  assert_eq!(text, "redirected\n");
}

#[tokio::test]
async fn it_should_limit_sandboxed_process_tree() {
  common::setup();
  if !common::sandbox_available() {
    return;
  }

  let limit = Duration::from_millis(300);
  let jail = Jail::new(MountSpec::toolchain()).unwrap();
  let command = SandboxedCommand::new(jail, shell("while :; do :; done"));
  let mut supervisor = Supervisor::new().unwrap();
  supervisor
    .run_sandboxed(command, ProcessOptions::new().cpu_time_limit(limit))
    .unwrap();

  let report = supervisor.next_report().await.unwrap().unwrap();
  info!("Sandboxed busy loop report: {:?}", report);
  assert_eq!(report.status, ExitStatus::Signaled(Signal::SIGKILL));
  assert_eq!(report.limit, Some(LimitExceeded::CpuTime));
  assert!(report.cpu_time >= limit);
}

#[tokio::test]
async fn it_should_run_sandboxed_without_limits() {
  common::setup();
  if !common::sandbox_available() {
    return;
  }

  let jail = Jail::new(MountSpec::toolchain()).unwrap();
  let command = SandboxedCommand::new(jail, shell("exit 5"));
  let mut supervisor = Supervisor::new().unwrap();
  let pid = supervisor
    .run_sandboxed(command, ProcessOptions::new())
    .unwrap();

  let report = supervisor.next_report().await.unwrap().unwrap();
  assert_eq!(report.pid, pid);
  assert_eq!(report.status, ExitStatus::Exited(5));
}

#[tokio::test]
async fn it_should_kill_children_on_drop() {
  common::setup();

  let mut supervisor = Supervisor::new().unwrap();
  let pid = supervisor
    .run(&Command::new("/bin/sleep").arg("30"), ProcessOptions::new())
    .unwrap();
  drop(supervisor);
  assert_eq!(kill(pid, None), Err(Errno::ESRCH));
}
