//! Testcase judging: feed an input file, compare the output against the answer and
//! turn the supervisor's report into a verdict.

use std::fmt::{Display, Formatter};
use std::fs::{self, File};
use std::io::{self, Read};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;

use log::{debug, info};

use crate::sandbox::SandboxedCommand;
use crate::supervisor::{ProcessOptions, ProcessReport, Supervisor};
use crate::utils::IceBoxPipe;
use crate::IceBoxError;

/// Program output kept for comparison, the rest is drained and dropped
pub const MAX_OUTPUT_SIZE: u64 = 64 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
  Accepted,
  WrongAnswer,
  TimeLimitExceeded,
  RuntimeError,
}

impl Verdict {
  /// Checked in order: a killed run, then its exit status, then its output
  pub fn judge(report: &ProcessReport, correct: bool) -> Self {
    if report.limit.is_some() {
      Verdict::TimeLimitExceeded
    } else if !report.status.success() {
      Verdict::RuntimeError
    } else if !correct {
      Verdict::WrongAnswer
    } else {
      Verdict::Accepted
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      Verdict::Accepted => "accepted",
      Verdict::WrongAnswer => "wrong_answer",
      Verdict::TimeLimitExceeded => "time_limit_exceeded",
      Verdict::RuntimeError => "runtime_error",
    }
  }
}

impl Display for Verdict {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      Verdict::Accepted => f.write_str("Accepted"),
      Verdict::WrongAnswer => f.write_str("Wrong Answer"),
      Verdict::TimeLimitExceeded => f.write_str("Time Limit Exceeded"),
      Verdict::RuntimeError => f.write_str("Runtime Error"),
    }
  }
}

/// Lines with `\r` removed and trailing blanks trimmed, without trailing empty lines
fn normalized_lines(text: &[u8]) -> Vec<Vec<u8>> {
  let mut lines: Vec<Vec<u8>> = text
    .split(|byte| *byte == b'\n')
    .map(|line| {
      let mut line: Vec<u8> = line.iter().copied().filter(|byte| *byte != b'\r').collect();
      while line.last().map_or(false, |byte| byte.is_ascii_whitespace()) {
        line.pop();
      }
      line
    })
    .collect();
  while lines.last().map_or(false, |line| line.is_empty()) {
    lines.pop();
  }
  lines
}

/// Whether `output` matches `answer`, ignoring line endings and trailing whitespace
pub fn compare_output(answer: &[u8], output: &[u8]) -> bool {
  normalized_lines(answer) == normalized_lines(output)
}

/// One `<name>.in` file together with its `<name>.ans`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Testcase {
  pub name: String,
  pub input: PathBuf,
  pub answer: PathBuf,
}

/// Every paired testcase in `dir`, numeric names first and in numeric order
pub fn load_testcases<P: AsRef<Path>>(dir: P) -> Result<Vec<Testcase>, IceBoxError> {
  let dir = dir.as_ref();
  let mut cases = vec![];
  for entry in fs::read_dir(dir)? {
    let path = entry?.path();
    if path.extension().map_or(true, |ext| ext != "in") {
      continue;
    }
    let name = match path.file_stem() {
      Some(stem) => stem.to_string_lossy().to_string(),
      None => continue,
    };
    let answer = path.with_extension("ans");
    if !answer.is_file() {
      debug!("Skip testcase {} without an answer file", path.to_string_lossy());
      continue;
    }
    cases.push(Testcase {
      name,
      input: path,
      answer,
    });
  }
  cases.sort_by(|a, b| {
    let key = |case: &Testcase| case.name.parse::<u64>().ok();
    match (key(a), key(b)) {
      (Some(x), Some(y)) => x.cmp(&y),
      (Some(_), None) => std::cmp::Ordering::Less,
      (None, Some(_)) => std::cmp::Ordering::Greater,
      (None, None) => a.name.cmp(&b.name),
    }
  });
  if cases.is_empty() {
    return Err(IceBoxError::cli(format!(
      "No testcases found in {}",
      dir.to_string_lossy()
    )));
  }
  Ok(cases)
}

fn read_output(mut file: File) -> io::Result<Vec<u8>> {
  let mut buf = vec![];
  (&mut file).take(MAX_OUTPUT_SIZE).read_to_end(&mut buf)?;
  io::copy(&mut file, &mut io::sink())?;
  Ok(buf)
}

/// Run `command` on the input of `case` under `options` and judge its stdout.
///
/// The stdin and stdout set in `options` are replaced.
pub async fn judge_testcase(
  supervisor: &mut Supervisor,
  command: SandboxedCommand,
  case: &Testcase,
  options: ProcessOptions,
) -> Result<(ProcessReport, Verdict), IceBoxError> {
  let input = File::open(&case.input)?;
  let pipe = IceBoxPipe::new()?;
  let options = options
    .stdin(input.as_raw_fd())
    .stdout(pipe.write_fd());

  supervisor.run_sandboxed(command, options)?;
  drop(input);
  let stdout = pipe.read()?.into_file();
  let reader = thread::spawn(move || read_output(stdout));

  let report = supervisor
    .next_report()
    .await?
    .ok_or(IceBoxError::launch("Supervised program was lost"))?;
  let output = reader
    .join()
    .map_err(|_| IceBoxError::launch("stdout reader panicked"))??;

  let answer = fs::read(&case.answer)?;
  let verdict = Verdict::judge(&report, compare_output(&answer, &output));
  info!("Testcase {}: {}", case.name, verdict);
  Ok((report, verdict))
}
