//! Kernel accounting readers: per-core idle ticks from `/proc/stat` and per-process
//! CPU ticks from `/proc/<pid>/stat`.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::time::Duration;

use nix::unistd::{sysconf, Pid, SysconfVar};

use crate::IceBoxError;

const NANOS_PER_SECOND: u64 = 1_000_000_000;

/// Converts kernel clock ticks into durations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockTicks {
  ns_per_tick: u64,
}

impl ClockTicks {
  pub fn new(ticks_per_second: u64) -> Result<Self, IceBoxError> {
    if ticks_per_second == 0 || ticks_per_second > NANOS_PER_SECOND {
      return Err(IceBoxError::accounting(format!(
        "unusable clock tick frequency {}",
        ticks_per_second
      )));
    }
    Ok(ClockTicks {
      ns_per_tick: NANOS_PER_SECOND / ticks_per_second,
    })
  }

  /// Frequency of this host's kernel clock (`CLK_TCK`)
  pub fn from_host() -> Result<Self, IceBoxError> {
    match sysconf(SysconfVar::CLK_TCK)? {
      Some(ticks) if ticks > 0 => Self::new(ticks as u64),
      _ => Err(IceBoxError::accounting("CLK_TCK is not available")),
    }
  }

  pub fn to_duration(&self, ticks: u64) -> Duration {
    Duration::from_nanos(ticks.saturating_mul(self.ns_per_tick))
  }
}

/// Idle tick counter of every core at one instant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdleSnapshot {
  cores: BTreeMap<usize, u64>,
}

impl IdleSnapshot {
  /// Parse the `cpuN` lines of `/proc/stat`; the aggregate `cpu` line is ignored
  pub fn parse(text: &str) -> Result<Self, IceBoxError> {
    let mut cores = BTreeMap::new();
    for line in text.lines() {
      let mut fields = line.split_whitespace();
      let index = match fields.next().and_then(|name| name.strip_prefix("cpu")) {
        Some(index) if !index.is_empty() => index,
        _ => continue,
      };
      let index: usize = index
        .parse()
        .map_err(|_| IceBoxError::accounting(format!("bad cpu line {:?}", line)))?;
      let idle = fields
        .nth(3)
        .and_then(|idle| idle.parse::<u64>().ok())
        .ok_or_else(|| IceBoxError::accounting(format!("bad cpu line {:?}", line)))?;
      cores.insert(index, idle);
    }
    if cores.is_empty() {
      return Err(IceBoxError::accounting("no per-core lines in /proc/stat"));
    }
    Ok(IdleSnapshot { cores })
  }

  pub fn read() -> Result<Self, IceBoxError> {
    let text = fs::read_to_string("/proc/stat")
      .map_err(|err| IceBoxError::accounting(format!("read /proc/stat: {}", err)))?;
    Self::parse(&text)
  }

  /// Largest idle tick increase of any core since `baseline`
  pub fn max_delta_since(&self, baseline: &IdleSnapshot) -> u64 {
    self
      .cores
      .iter()
      .filter_map(|(core, idle)| {
        baseline
          .cores
          .get(core)
          .map(|base| idle.saturating_sub(*base))
      })
      .max()
      .unwrap_or(0)
  }
}

/// User plus system ticks of one process and of its children already waited for
pub fn parse_cpu_ticks(stat: &str) -> Result<u64, IceBoxError> {
  // The command name may contain spaces and parentheses.
  let rest = stat
    .rfind(')')
    .map(|pos| &stat[pos + 1..])
    .ok_or_else(|| IceBoxError::accounting(format!("bad process stat {:?}", stat)))?;
  let fields: Vec<&str> = rest.split_whitespace().collect();
  let mut ticks = 0u64;
  // utime, stime, cutime, cstime
  for index in 11..=14 {
    let value = fields
      .get(index)
      .and_then(|value| value.parse::<i64>().ok())
      .ok_or_else(|| IceBoxError::accounting(format!("bad process stat {:?}", stat)))?;
    ticks = ticks.saturating_add(value.max(0) as u64);
  }
  Ok(ticks)
}

fn read_stat(pid: Pid) -> Result<Option<u64>, IceBoxError> {
  match fs::read_to_string(format!("/proc/{}/stat", pid)) {
    Ok(text) => parse_cpu_ticks(&text).map(Some),
    Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
    Err(err) => Err(IceBoxError::accounting(format!(
      "read /proc/{}/stat: {}",
      pid, err
    ))),
  }
}

fn children(pid: Pid) -> Vec<Pid> {
  let tasks = match fs::read_dir(format!("/proc/{}/task", pid)) {
    Ok(tasks) => tasks,
    Err(_) => return vec![],
  };
  tasks
    .flatten()
    .filter_map(|task| fs::read_to_string(task.path().join("children")).ok())
    .flat_map(|text| {
      text
        .split_whitespace()
        .filter_map(|pid| pid.parse().ok())
        .map(Pid::from_raw)
        .collect::<Vec<_>>()
    })
    .collect()
}

/// CPU ticks charged to `pid` and every live descendant.
///
/// `pid` itself must still exist (alive or a zombie); descendants that vanish while
/// the tree is walked count as zero.
pub fn process_tree_ticks(pid: Pid) -> Result<u64, IceBoxError> {
  let mut total = read_stat(pid)?
    .ok_or_else(|| IceBoxError::accounting(format!("process #{} has no stat record", pid)))?;
  let mut pending = children(pid);
  while let Some(child) = pending.pop() {
    if let Some(ticks) = read_stat(child)? {
      total = total.saturating_add(ticks);
      pending.extend(children(child));
    }
  }
  Ok(total)
}
