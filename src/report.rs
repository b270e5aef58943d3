use std::cmp::max;
use std::time::Duration;

use nix::libc::STDOUT_FILENO;
use nix::unistd::isatty;

use crate::judge::Verdict;
use crate::launch::ExitStatus;
use crate::supervisor::{LimitExceeded, ProcessReport};

/// Collects the reports of repeated runs, or judged testcases, of one package and prints them
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
  max_cpu_time: Duration,
  max_wall_time: Duration,
  sum_cpu_time: Duration,
  results: Vec<ProcessReport>,
  /// Testcase name and verdict of each judged run
  verdicts: Vec<Option<(String, Verdict)>>,
}

fn millis(duration: Duration) -> u128 {
  duration.as_millis()
}

impl RunSummary {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_result(&mut self, result: ProcessReport) {
    self.max_cpu_time = max(self.max_cpu_time, result.cpu_time);
    self.max_wall_time = max(self.max_wall_time, result.wall_time);
    self.sum_cpu_time += result.cpu_time;
    self.results.push(result);
    self.verdicts.push(None);
  }

  /// Record the run of one testcase and the verdict it got
  pub fn add_verdict<S: Into<String>>(
    &mut self,
    case: S,
    result: ProcessReport,
    verdict: Verdict,
  ) {
    self.add_result(result);
    if let Some(last) = self.verdicts.last_mut() {
      *last = Some((case.into(), verdict));
    }
  }

  pub fn results(&self) -> &Vec<ProcessReport> {
    &self.results
  }

  /// Whether every run exited with 0, stayed in its limits and was accepted when judged
  pub fn ok(&self) -> bool {
    let finished = self
      .results
      .iter()
      .all(|r| r.limit.is_none() && r.status.success());
    let accepted = self
      .verdicts
      .iter()
      .flatten()
      .all(|(_, verdict)| *verdict == Verdict::Accepted);
    finished && accepted
  }

  /// Human readable on a terminal, JSON otherwise
  pub fn report(&self) {
    let is_tty = isatty(STDOUT_FILENO).unwrap_or(false);
    if is_tty {
      self.report_human();
    } else {
      self.report_json();
    }
  }

  pub fn report_human(&self) {
    for (index, result) in self.results.iter().enumerate() {
      let status = match result.status {
        ExitStatus::Exited(code) => {
          format!("\x1b[9{}m{}\x1b[39m", if code == 0 { 2 } else { 1 }, code)
        }
        ExitStatus::Signaled(_) => "\x1b[91m×\x1b[39m".to_string(),
      };
      let signal = result.status.signal().map_or_else(
        || "\x1b[92m✓\x1b[39m".to_string(),
        |v| format!("\x1b[91m{}\x1b[39m", v),
      );
      let limit = result.limit.map_or_else(
        || "\x1b[92m✓\x1b[39m".to_string(),
        |v| format!("\x1b[91m{}\x1b[39m", v),
      );

      println!();
      match self.verdicts.get(index).and_then(|judged| judged.as_ref()) {
        Some((case, verdict)) => {
          let color = if *verdict == Verdict::Accepted { 2 } else { 1 };
          println!("\x1b[1mCase\x1b[22m       {}", case);
          println!("\x1b[1mVerdict\x1b[22m    \x1b[9{}m{}\x1b[39m", color, verdict);
        }
        None if self.results.len() > 1 => {
          println!("\x1b[1mRun\x1b[22m        #{}", index + 1);
        }
        None => {}
      }
      println!("\x1b[1mStatus\x1b[22m     {}", status);
      println!("\x1b[1mSignal\x1b[22m     {}", signal);
      println!("\x1b[1mLimit\x1b[22m      {}", limit);
      println!("\x1b[1mTime\x1b[22m       {} ms", millis(result.cpu_time));
      println!("\x1b[1mTime idle\x1b[22m  {} ms", millis(result.idle_time));
      println!("\x1b[1mTime wall\x1b[22m  {} ms", millis(result.wall_time));
    }
    if self.results.len() > 1 {
      println!();
      println!("\x1b[1mMax time\x1b[22m   {} ms", millis(self.max_cpu_time));
      println!("\x1b[1mMax wall\x1b[22m   {} ms", millis(self.max_wall_time));
      println!("\x1b[1mSum time\x1b[22m   {} ms", millis(self.sum_cpu_time));
    }
    println!();
  }

  pub fn report_json(&self) {
    println!("{}", self.to_json());
  }

  pub fn to_json(&self) -> String {
    let results: Vec<String> = self
      .results
      .iter()
      .zip(self.verdicts.iter())
      .map(|(result, judged)| {
        let status = result
          .status
          .code()
          .map_or_else(|| "null".to_string(), |v| v.to_string());
        let signal = result
          .status
          .signal()
          .map_or_else(|| "null".to_string(), |v| format!("\"{}\"", v));
        let limit = result.limit.map_or_else(
          || "null".to_string(),
          |v| match v {
            LimitExceeded::CpuTime => "\"cpu_time\"".to_string(),
            LimitExceeded::IdleTime => "\"idle_time\"".to_string(),
          },
        );
        let (case, verdict) = judged.as_ref().map_or_else(
          || ("null".to_string(), "null".to_string()),
          |(case, verdict)| (format!("{:?}", case), format!("\"{}\"", verdict.name())),
        );
        format!(
          "    {{\n      \"case\": {},\n      \"verdict\": {},\n      \"status\": {},\n      \"signal\": {},\n      \"limit\": {},\n      \"time\": {},\n      \"time_idle\": {},\n      \"time_wall\": {}\n    }}",
          case,
          verdict,
          status,
          signal,
          limit,
          millis(result.cpu_time),
          millis(result.idle_time),
          millis(result.wall_time)
        )
      })
      .collect();

    format!(
      "{{\n  \"ok\": {},\n  \"max_time\": {},\n  \"max_wall\": {},\n  \"sum_time\": {},\n  \"results\": [\n{}\n  ]\n}}",
      self.ok(),
      millis(self.max_cpu_time),
      millis(self.max_wall_time),
      millis(self.sum_cpu_time),
      results.join(",\n")
    )
  }
}
