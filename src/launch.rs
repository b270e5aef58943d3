use std::convert::Infallible;
use std::ffi::CString;
use std::fmt::{Display, Formatter};
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::prelude::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use log::{debug, error};
use nix::errno::Errno;
use nix::libc::{STDERR_FILENO, STDIN_FILENO, STDOUT_FILENO};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{chdir, close, dup2, execve, Pid};

use crate::fork::{exit_child, spawn_with, ReactorHooks};
use crate::jail::Jail;
use crate::utils::{c_strings, env_block, fatal, path_c_string, IceBoxPipe, SANDBOX_PATH};
use crate::IceBoxError;

/// Exit status reported when the program image could not be replaced
pub const EXEC_FAILURE_CODE: i32 = 127;

/// How a child terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
  Exited(i32),
  Signaled(Signal),
}

impl ExitStatus {
  pub fn success(&self) -> bool {
    matches!(self, ExitStatus::Exited(0))
  }

  pub fn code(&self) -> Option<i32> {
    match self {
      ExitStatus::Exited(code) => Some(*code),
      ExitStatus::Signaled(_) => None,
    }
  }

  pub fn signal(&self) -> Option<Signal> {
    match self {
      ExitStatus::Exited(_) => None,
      ExitStatus::Signaled(signal) => Some(*signal),
    }
  }

  pub(crate) fn from_wait(status: WaitStatus) -> Option<(Pid, Self)> {
    match status {
      WaitStatus::Exited(pid, code) => Some((pid, ExitStatus::Exited(code))),
      WaitStatus::Signaled(pid, signal, _) => Some((pid, ExitStatus::Signaled(signal))),
      _ => None,
    }
  }
}

impl Display for ExitStatus {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      ExitStatus::Exited(code) => write!(f, "exited with status {}", code),
      ExitStatus::Signaled(signal) => write!(f, "killed by signal {}", signal),
    }
  }
}

/// What a child sees on one of its standard streams
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
  /// Share the parent's stream
  Inherit,
  /// Collect the output through a pipe, see [`ProcessHandle::wait_with_output`]
  Capture,
  /// Leave the descriptor closed
  Close,
  /// Point stdout at stderr or stderr at stdout
  Sibling,
  /// Connect to `/dev/null`
  Silence,
  /// Duplicate a descriptor owned by the caller
  Fd(RawFd),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Streams {
  pub stdin: Stream,
  pub stdout: Stream,
  pub stderr: Stream,
}

impl Default for Streams {
  fn default() -> Self {
    Streams::inherit()
  }
}

impl Streams {
  pub fn inherit() -> Self {
    Streams {
      stdin: Stream::Inherit,
      stdout: Stream::Inherit,
      stderr: Stream::Inherit,
    }
  }

  /// Silence stdin, capture stdout and stderr separately
  pub fn capture() -> Self {
    Streams {
      stdin: Stream::Silence,
      stdout: Stream::Capture,
      stderr: Stream::Capture,
    }
  }

  /// Silence stdin, capture stdout with stderr folded into it
  pub fn capture_merged() -> Self {
    Streams {
      stdin: Stream::Silence,
      stdout: Stream::Capture,
      stderr: Stream::Sibling,
    }
  }

  pub fn stdin(mut self, stream: Stream) -> Self {
    self.stdin = stream;
    self
  }

  pub fn stdout(mut self, stream: Stream) -> Self {
    self.stdout = stream;
    self
  }

  pub fn stderr(mut self, stream: Stream) -> Self {
    self.stderr = stream;
    self
  }

  fn validate(&self) -> Result<(), IceBoxError> {
    if matches!(self.stdin, Stream::Capture | Stream::Sibling) {
      return Err(IceBoxError::launch("stdin can not be captured or redirected to a sibling"));
    }
    if self.stdout == Stream::Sibling && self.stderr == Stream::Sibling {
      return Err(IceBoxError::launch("stdout and stderr can not both follow each other"));
    }
    Ok(())
  }

  /// Create the pipes needed for capturing and open `/dev/null`, before fork.
  ///
  /// Nothing is looked up by path in the child, which may already sit in a jail.
  pub(crate) fn prepare(self) -> Result<PreparedStreams, IceBoxError> {
    self.validate()?;
    let silenced = [self.stdin, self.stdout, self.stderr]
      .iter()
      .any(|stream| *stream == Stream::Silence);
    let null = if silenced {
      Some(OpenOptions::new().read(true).write(true).open("/dev/null")?)
    } else {
      None
    };
    let stdout = match self.stdout {
      Stream::Capture => Some(IceBoxPipe::new()?),
      _ => None,
    };
    let stderr = match self.stderr {
      Stream::Capture => Some(IceBoxPipe::new()?),
      _ => None,
    };
    Ok(PreparedStreams {
      streams: self,
      stdout,
      stderr,
      null,
    })
  }
}

pub(crate) struct PreparedStreams {
  streams: Streams,
  stdout: Option<IceBoxPipe>,
  stderr: Option<IceBoxPipe>,
  /// Close-on-exec `/dev/null`, dropped in the parent
  null: Option<File>,
}

fn redirect(
  stream: Stream,
  target: RawFd,
  pipe: Option<&IceBoxPipe>,
  null: Option<&File>,
) -> Result<(), IceBoxError> {
  match stream {
    Stream::Inherit | Stream::Sibling => {}
    Stream::Capture => {
      if let Some(pipe) = pipe {
        pipe.redirect_write(target)?;
      }
    }
    Stream::Close => match close(target) {
      Ok(_) | Err(Errno::EBADF) => {}
      Err(err) => return Err(err.into()),
    },
    Stream::Silence => {
      if let Some(null) = null {
        dup2(null.as_raw_fd(), target)?;
      }
    }
    Stream::Fd(fd) => {
      if fd != target {
        dup2(fd, target)?;
      }
    }
  }
  Ok(())
}

impl PreparedStreams {
  /// Rewire the standard streams of a child right before it replaces its image
  pub(crate) fn apply_in_child(&self) -> Result<(), IceBoxError> {
    let null = self.null.as_ref();
    redirect(self.streams.stdin, STDIN_FILENO, None, null)?;
    redirect(self.streams.stdout, STDOUT_FILENO, self.stdout.as_ref(), null)?;
    redirect(self.streams.stderr, STDERR_FILENO, self.stderr.as_ref(), null)?;
    if self.streams.stdout == Stream::Sibling {
      dup2(STDERR_FILENO, STDOUT_FILENO)?;
    }
    if self.streams.stderr == Stream::Sibling {
      dup2(STDOUT_FILENO, STDERR_FILENO)?;
    }
    Ok(())
  }

  /// Keep the read ends of the capture pipes in the parent
  pub(crate) fn into_parent(self) -> Result<(Option<File>, Option<File>), IceBoxError> {
    let stdout = match self.stdout {
      Some(pipe) => Some(pipe.read()?.into_file()),
      None => None,
    };
    let stderr = match self.stderr {
      Some(pipe) => Some(pipe.read()?.into_file()),
      None => None,
    };
    Ok((stdout, stderr))
  }
}

/// A program, its full argument vector (including `argv[0]`), environment and working directory
#[derive(Debug, Clone)]
pub struct Command {
  program: PathBuf,
  args: Vec<String>,
  env: Vec<(String, String)>,
  cwd: Option<PathBuf>,
}

impl Command {
  /// `argv[0]` defaults to the file name of `program`, the environment to a minimal `PATH`
  pub fn new<P: Into<PathBuf>>(program: P) -> Self {
    let program: PathBuf = program.into();
    let argv0 = program
      .file_name()
      .map(|name| name.to_string_lossy().to_string())
      .unwrap_or_else(|| program.to_string_lossy().to_string());
    Command {
      program,
      args: vec![argv0],
      env: vec![("PATH".to_string(), SANDBOX_PATH.to_string())],
      cwd: None,
    }
  }

  /// Replace the whole argument vector, `argv[0]` included
  pub fn argv<AS: Into<String>>(mut self, args: Vec<AS>) -> Self {
    self.args = args.into_iter().map(|a| a.into()).collect();
    self
  }

  pub fn arg<AS: Into<String>>(mut self, arg: AS) -> Self {
    self.args.push(arg.into());
    self
  }

  pub fn env<KS: Into<String>, VS: Into<String>>(mut self, key: KS, value: VS) -> Self {
    let key = key.into();
    self.env.retain(|(k, _)| k != &key);
    self.env.push((key, value.into()));
    self
  }

  pub fn clear_env(mut self) -> Self {
    self.env.clear();
    self
  }

  pub fn cwd<P: Into<PathBuf>>(mut self, path: P) -> Self {
    self.cwd = Some(path.into());
    self
  }

  pub fn program(&self) -> &Path {
    &self.program
  }

  pub fn args(&self) -> &Vec<String> {
    &self.args
  }

  pub fn envs(&self) -> &Vec<(String, String)> {
    &self.env
  }

  /// Marshal everything `execve` needs, so the child does no fallible conversions
  pub(crate) fn prepare(&self) -> Result<PreparedCommand, IceBoxError> {
    if self.args.is_empty() {
      return Err(IceBoxError::exec("argument vector must contain argv[0]"));
    }
    Ok(PreparedCommand {
      program: path_c_string(&self.program)?,
      args: c_strings(&self.args)?,
      env: env_block(&self.env)?,
      cwd: match &self.cwd {
        Some(cwd) => Some(path_c_string(cwd)?),
        None => None,
      },
    })
  }
}

pub(crate) struct PreparedCommand {
  program: CString,
  args: Vec<CString>,
  env: Vec<CString>,
  cwd: Option<CString>,
}

impl PreparedCommand {
  fn try_exec(&self) -> Result<Infallible, IceBoxError> {
    if let Some(cwd) = &self.cwd {
      chdir(cwd.as_c_str())?;
    }
    Ok(execve(&self.program, &self.args, &self.env)?)
  }

  /// Replace the image of the calling child; on failure the child exits with [`EXEC_FAILURE_CODE`]
  pub(crate) fn exec(&self) -> Infallible {
    match self.try_exec() {
      Ok(never) => never,
      Err(err) => {
        error!("Execve {} fails: {}", self.program.to_string_lossy(), err);
        let args = self
          .args
          .iter()
          .map(|cstr| cstr.to_string_lossy().into())
          .collect::<Vec<Box<str>>>();
        debug!("Program args: {}", args.join(" "));
        log::logger().flush();
        exit_child(EXEC_FAILURE_CODE)
      }
    }
  }
}

/// Captured output of a finished child
#[derive(Debug, Clone)]
pub struct Output {
  pub status: ExitStatus,
  pub stdout: Vec<u8>,
  pub stderr: Vec<u8>,
}

/// A launched child that has to be waited for
#[derive(Debug)]
pub struct ProcessHandle {
  pid: Pid,
  stdout: Option<File>,
  stderr: Option<File>,
  jail: Option<Jail>,
}

impl ProcessHandle {
  pub(crate) fn new(
    pid: Pid,
    (stdout, stderr): (Option<File>, Option<File>),
    jail: Option<Jail>,
  ) -> Self {
    ProcessHandle {
      pid,
      stdout,
      stderr,
      jail,
    }
  }

  pub fn pid(&self) -> Pid {
    self.pid
  }

  /// Read end of a captured stdout
  pub fn stdout(&mut self) -> Option<&mut File> {
    self.stdout.as_mut()
  }

  /// Read end of a captured stderr
  pub fn stderr(&mut self) -> Option<&mut File> {
    self.stderr.as_mut()
  }

  /// Block until the child terminates
  pub fn wait(mut self) -> Result<ExitStatus, IceBoxError> {
    self.stdout.take();
    self.stderr.take();
    wait_for(self.pid)
  }

  /// Drain the captured streams, then block until the child terminates
  pub fn wait_with_output(mut self) -> Result<Output, IceBoxError> {
    let stderr_reader = self.stderr.take().map(|mut file| {
      std::thread::spawn(move || {
        let mut buf = vec![];
        file.read_to_end(&mut buf).map(|_| buf)
      })
    });

    let mut stdout = vec![];
    if let Some(mut file) = self.stdout.take() {
      file.read_to_end(&mut stdout)?;
    }
    let stderr = match stderr_reader {
      Some(handle) => handle
        .join()
        .map_err(|_| IceBoxError::launch("stderr reader panicked"))??,
      None => vec![],
    };

    let status = wait_for(self.pid)?;
    drop(self.jail.take());
    Ok(Output {
      status,
      stdout,
      stderr,
    })
  }
}

/// Blocking wait for one specific child
pub fn wait_for(pid: Pid) -> Result<ExitStatus, IceBoxError> {
  loop {
    match waitpid(pid, None) {
      Ok(status) => {
        if let Some((_, status)) = ExitStatus::from_wait(status) {
          debug!("Child process #{} {}", pid, status);
          return Ok(status);
        }
      }
      Err(Errno::EINTR) => continue,
      Err(err) => return Err(err.into()),
    }
  }
}

/// Fork and exec `command` on the host, with `streams` wired up before the image is replaced
pub fn launch(command: &Command, streams: Streams) -> Result<ProcessHandle, IceBoxError> {
  let prepared = command.prepare()?;
  let streams = streams.prepare()?;

  let pid = spawn_with(&ReactorHooks, || {
    if let Err(err) = streams.apply_in_child() {
      fatal("Redirect child process IO", err);
    }
    prepared.exec()
  });

  Ok(ProcessHandle::new(pid, streams.into_parent()?, None))
}
