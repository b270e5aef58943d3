use std::convert::Infallible;

use log::info;
use nix::errno::Errno;
use nix::libc;
use nix::sys::signal::{kill, signal, sigprocmask, SigHandler, SigSet, SigmaskHow};
use nix::sys::wait::waitpid;
use nix::unistd::getpid;

use crate::fork::{exit_child, spawn, spawn_with, ReactorHooks};
use crate::jail::{Jail, PivotedRoot};
use crate::launch::{
  Command, ExitStatus, PreparedCommand, PreparedStreams, ProcessHandle, Streams,
};
use crate::utils::fatal;
use crate::IceBoxError;

/// A command that runs inside its own freshly built jail.
///
/// Nothing but parameters crosses into the jail; only the exit status and whatever
/// the streams carry come back out.
#[derive(Debug)]
pub struct SandboxedCommand {
  jail: Jail,
  command: Command,
  mount_proc: bool,
}

pub(crate) struct PreparedSandbox {
  jail: Jail,
  command: PreparedCommand,
  mount_proc: bool,
}

impl SandboxedCommand {
  /// `command` names paths as seen from inside the jail
  pub fn new(jail: Jail, command: Command) -> Self {
    SandboxedCommand {
      jail,
      command,
      mount_proc: true,
    }
  }

  /// Mount a fresh `/proc` for the jailed program (on by default)
  pub fn mount_proc(mut self, flag: bool) -> Self {
    self.mount_proc = flag;
    self
  }

  pub fn jail(&self) -> &Jail {
    &self.jail
  }

  pub fn command(&self) -> &Command {
    &self.command
  }

  pub(crate) fn prepare(self) -> Result<PreparedSandbox, IceBoxError> {
    Ok(PreparedSandbox {
      command: self.command.prepare()?,
      jail: self.jail,
      mount_proc: self.mount_proc,
    })
  }

  /// Launch the jailed command and hand back a blocking process handle
  pub fn spawn(self, streams: Streams) -> Result<ProcessHandle, IceBoxError> {
    info!(
      "Start sandboxed program {} at {}",
      self.command.program().to_string_lossy(),
      self.jail.root().to_string_lossy()
    );
    let sandbox = self.prepare()?;
    let streams = streams.prepare()?;

    let pid = spawn_with(&ReactorHooks, || sandbox.enter(&streams));

    Ok(ProcessHandle::new(
      pid,
      streams.into_parent()?,
      Some(sandbox.into_jail()),
    ))
  }
}

impl PreparedSandbox {
  pub(crate) fn into_jail(self) -> Jail {
    self.jail
  }

  /// Body of the outer sandbox process: build the jail, launch the inner process and
  /// terminate the same way it does.
  ///
  /// `streams` are only applied by the inner process right before exec, so the jail
  /// setup keeps logging to the supervisor's own descriptors.
  pub(crate) fn enter(&self, streams: &PreparedStreams) -> Infallible {
    let root = self
      .jail
      .enter()
      .unwrap_or_else(|err| fatal("Build jail", err));

    let inner = spawn(|| self.enter_inner(&root, streams));

    loop {
      match waitpid(None, None) {
        Ok(status) => {
          if let Some((pid, status)) = ExitStatus::from_wait(status) {
            if pid == inner {
              mirror(status);
            }
          }
        }
        Err(Errno::EINTR) => continue,
        Err(err) => fatal("Wait for jailed process", err),
      }
    }
  }

  /// Body of the inner process, the first one of the new pid namespace
  fn enter_inner(&self, root: &PivotedRoot, streams: &PreparedStreams) -> Infallible {
    if unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL) } != 0 {
      fatal("Set parent death signal", Errno::last());
    }
    if self.mount_proc {
      if let Err(err) = root.mount_proc() {
        fatal("Mount /proc", err);
      }
    }
    if let Err(err) = root.detach() {
      fatal("Detach old root", err);
    }
    if let Err(err) = streams.apply_in_child() {
      fatal("Redirect jailed process IO", err);
    }
    self.command.exec()
  }
}

/// Terminate the calling process the same way a child did
fn mirror(status: ExitStatus) -> ! {
  match status {
    ExitStatus::Exited(code) => exit_child(code),
    ExitStatus::Signaled(sig) => {
      if let Err(err) = unsafe { signal(sig, SigHandler::SigDfl) } {
        fatal("Restore default signal disposition", err);
      }
      let mut mask = SigSet::empty();
      mask.add(sig);
      if let Err(err) = sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&mask), None) {
        fatal("Unblock mirrored signal", err);
      }
      if let Err(err) = kill(getpid(), sig) {
        fatal("Raise mirrored signal", err);
      }
      exit_child(128 + sig as i32)
    }
  }
}
