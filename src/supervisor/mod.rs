//! Asynchronous process supervisor.
//!
//! Children are launched from the reactor thread, watched by one deadline timer each
//! while a time limit applies, and reaped when `SIGCHLD` wakes the reactor. All state
//! lives in the [`Supervisor`] and is only touched from its own futures.

use std::collections::{HashMap, VecDeque};
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal as NixSignal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::time::sleep_until;

pub use accounting::{process_tree_ticks, ClockTicks, IdleSnapshot};
pub use options::ProcessOptions;

use crate::fork::{spawn_with, ReactorHooks};
use crate::jail::Jail;
use crate::launch::{Command, ExitStatus};
use crate::sandbox::SandboxedCommand;
use crate::utils::fatal;
use crate::IceBoxError;

pub mod accounting;
pub mod options;

/// Added to every timer so that checks land just past a budget boundary
pub const WAIT_JITTER: Duration = Duration::from_millis(5);

/// Which budget made the supervisor kill a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitExceeded {
  CpuTime,
  IdleTime,
}

impl Display for LimitExceeded {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      LimitExceeded::CpuTime => f.write_str("CPU time limit exceeded"),
      LimitExceeded::IdleTime => f.write_str("idle time limit exceeded"),
    }
  }
}

/// Outcome of one supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessReport {
  pub pid: Pid,
  pub status: ExitStatus,
  /// Set when the supervisor killed the process
  pub limit: Option<LimitExceeded>,
  /// Last CPU time observed; only measured for processes with a time limit or at reap
  pub cpu_time: Duration,
  /// Largest host idle time observed while an idle limit was watched
  pub idle_time: Duration,
  pub wall_time: Duration,
}

#[derive(Debug)]
struct ProcessContext {
  options: ProcessOptions,
  started: Instant,
  /// Next check; `None` when unmonitored or once killed
  deadline: Option<Instant>,
  idle_baseline: Option<IdleSnapshot>,
  cpu_time: Duration,
  idle_time: Duration,
  limit: Option<LimitExceeded>,
  /// Removes the jail root once the process is reaped
  _jail: Option<Jail>,
}

enum Event {
  Child,
  Timer,
}

pub struct Supervisor {
  contexts: HashMap<Pid, ProcessContext>,
  finished: VecDeque<ProcessReport>,
  sigchld: Signal,
  clock: ClockTicks,
  hooks: ReactorHooks,
}

fn first_check(options: &ProcessOptions, now: Instant) -> Option<Instant> {
  [options.get_cpu_time_limit(), options.get_idle_time_limit()]
    .into_iter()
    .flatten()
    .min()
    .map(|budget| now + budget + WAIT_JITTER)
}

/// Taken before fork, so that nothing can fail between launching and tracking
fn idle_baseline(options: &ProcessOptions) -> Result<Option<IdleSnapshot>, IceBoxError> {
  match options.get_idle_time_limit() {
    Some(_) => Ok(Some(IdleSnapshot::read()?)),
    None => Ok(None),
  }
}

impl ProcessContext {
  /// Run the idle and CPU checks once; returns the limit to kill for, if any
  fn check(
    &mut self,
    pid: Pid,
    clock: ClockTicks,
    now: Instant,
  ) -> Result<Option<LimitExceeded>, IceBoxError> {
    let mut remaining = vec![];

    if let Some(limit) = self.options.get_idle_time_limit() {
      let snapshot = IdleSnapshot::read()?;
      let baseline = self.idle_baseline.get_or_insert_with(|| snapshot.clone());
      let idle = clock.to_duration(snapshot.max_delta_since(baseline));
      self.idle_time = self.idle_time.max(idle);
      if self.idle_time >= limit {
        return Ok(Some(LimitExceeded::IdleTime));
      }
      remaining.push(limit - self.idle_time);
    }

    if let Some(limit) = self.options.get_cpu_time_limit() {
      self.cpu_time = clock.to_duration(process_tree_ticks(pid)?);
      if self.cpu_time >= limit {
        return Ok(Some(LimitExceeded::CpuTime));
      }
      remaining.push(limit - self.cpu_time);
    }

    self.deadline = remaining
      .into_iter()
      .min()
      .map(|budget| now + budget + WAIT_JITTER);
    Ok(None)
  }
}

impl Supervisor {
  /// Must be called from inside a tokio runtime, before any child is launched
  pub fn new() -> Result<Self, IceBoxError> {
    Ok(Supervisor {
      contexts: HashMap::new(),
      finished: VecDeque::new(),
      sigchld: signal(SignalKind::child())?,
      clock: ClockTicks::from_host()?,
      hooks: ReactorHooks,
    })
  }

  /// Number of launched processes not reaped yet
  pub fn tracked(&self) -> usize {
    self.contexts.len()
  }

  /// Launch `command` on the host under `options`
  pub fn run(&mut self, command: &Command, options: ProcessOptions) -> Result<Pid, IceBoxError> {
    let prepared = command.prepare()?;
    let streams = options.streams().prepare()?;
    let idle_baseline = idle_baseline(&options)?;

    let pid = spawn_with(&self.hooks, || {
      if let Err(err) = streams.apply_in_child() {
        fatal("Redirect child process IO", err);
      }
      prepared.exec()
    });
    streams.into_parent()?;

    info!(
      "Run {} as process #{}",
      command.program().to_string_lossy(),
      pid
    );
    Ok(self.track(pid, options, idle_baseline, None))
  }

  /// Launch a jailed command under `options`.
  ///
  /// Limits apply to the whole jailed process tree; killing the tracked process
  /// takes the jail down with it.
  pub fn run_sandboxed(
    &mut self,
    command: SandboxedCommand,
    options: ProcessOptions,
  ) -> Result<Pid, IceBoxError> {
    let program = command.command().program().to_path_buf();
    let sandbox = command.prepare()?;
    let streams = options.streams().prepare()?;
    let idle_baseline = idle_baseline(&options)?;

    let pid = spawn_with(&self.hooks, || sandbox.enter(&streams));
    streams.into_parent()?;

    info!(
      "Run sandboxed {} as process #{}",
      program.to_string_lossy(),
      pid
    );
    Ok(self.track(pid, options, idle_baseline, Some(sandbox.into_jail())))
  }

  fn track(
    &mut self,
    pid: Pid,
    options: ProcessOptions,
    idle_baseline: Option<IdleSnapshot>,
    jail: Option<Jail>,
  ) -> Pid {
    if let Some(bytes) = options.get_memory_limit() {
      warn!(
        "Memory limit {} bytes of process #{} is not enforced",
        bytes, pid
      );
    }
    let now = Instant::now();
    let context = ProcessContext {
      deadline: first_check(&options, now),
      options,
      started: now,
      idle_baseline,
      cpu_time: Duration::ZERO,
      idle_time: Duration::ZERO,
      limit: None,
      _jail: jail,
    };
    self.contexts.insert(pid, context);
    pid
  }

  /// Wait for the next supervised process to be reaped; `None` once nothing is tracked
  pub async fn next_report(&mut self) -> Result<Option<ProcessReport>, IceBoxError> {
    loop {
      if let Some(report) = self.finished.pop_front() {
        return Ok(Some(report));
      }
      if self.contexts.is_empty() {
        return Ok(None);
      }

      // Children may have terminated before the signal stream saw them.
      self.reap()?;
      if !self.finished.is_empty() {
        continue;
      }

      let deadline = self.contexts.values().filter_map(|c| c.deadline).min();
      let event = match deadline {
        Some(deadline) => {
          tokio::select! {
            _ = self.sigchld.recv() => Event::Child,
            _ = sleep_until(deadline.into()) => Event::Timer,
          }
        }
        None => {
          self.sigchld.recv().await;
          Event::Child
        }
      };

      match event {
        Event::Child => self.reap()?,
        Event::Timer => self.check_expired()?,
      }
    }
  }

  /// Drive every tracked process to completion
  pub async fn wait_all(&mut self) -> Result<Vec<ProcessReport>, IceBoxError> {
    let mut reports = vec![];
    while let Some(report) = self.next_report().await? {
      reports.push(report);
    }
    Ok(reports)
  }

  fn check_expired(&mut self) -> Result<(), IceBoxError> {
    let now = Instant::now();
    let clock = self.clock;
    let due: Vec<Pid> = self
      .contexts
      .iter()
      .filter(|(_, context)| context.deadline.map_or(false, |d| d <= now))
      .map(|(pid, _)| *pid)
      .collect();

    for pid in due {
      let context = match self.contexts.get_mut(&pid) {
        Some(context) => context,
        None => continue,
      };
      if let Some(limit) = context.check(pid, clock, now)? {
        info!("Kill process #{}: {}", pid, limit);
        kill(pid, NixSignal::SIGKILL)?;
        context.limit = Some(limit);
        context.deadline = None;
      }
    }
    Ok(())
  }

  /// Collect every tracked process that has terminated, without blocking
  fn reap(&mut self) -> Result<(), IceBoxError> {
    let pids: Vec<Pid> = self.contexts.keys().copied().collect();
    for pid in pids {
      // Last look at the accounting while the zombie is still around.
      let ticks = process_tree_ticks(pid).ok();
      let status = loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
          Ok(WaitStatus::StillAlive) => break None,
          Ok(status) => break ExitStatus::from_wait(status).map(|(_, status)| status),
          Err(Errno::EINTR) => continue,
          Err(Errno::ECHILD) => {
            error!("Tracked process #{} is no longer our child", pid);
            return Err(IceBoxError::launch(format!(
              "tracked process #{} vanished",
              pid
            )));
          }
          Err(err) => return Err(err.into()),
        }
      };
      if let Some(status) = status {
        self.finish(pid, status, ticks);
      }
    }
    Ok(())
  }

  fn finish(&mut self, pid: Pid, status: ExitStatus, ticks: Option<u64>) {
    let context = match self.contexts.remove(&pid) {
      Some(context) => context,
      None => return,
    };
    let cpu_time = match ticks {
      Some(ticks) => context.cpu_time.max(self.clock.to_duration(ticks)),
      None => context.cpu_time,
    };
    let report = ProcessReport {
      pid,
      status,
      limit: context.limit,
      cpu_time,
      idle_time: context.idle_time,
      wall_time: context.started.elapsed(),
    };
    info!(
      "Process #{} {} after {:?} (cpu {:?})",
      pid, report.status, report.wall_time, report.cpu_time
    );
    self.finished.push_back(report);
  }
}

impl Drop for Supervisor {
  fn drop(&mut self) {
    for (pid, _) in self.contexts.drain() {
      debug!("Kill unfinished process #{}", pid);
      let _ = kill(pid, NixSignal::SIGKILL);
      loop {
        match waitpid(pid, None) {
          Err(Errno::EINTR) => continue,
          Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(_) => break,
          Ok(_) => continue,
        }
      }
    }
  }
}
