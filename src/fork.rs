use std::convert::Infallible;
use std::panic::{catch_unwind, AssertUnwindSafe};

use log::debug;
use nix::libc;
use nix::sys::signal::{sigprocmask, signal, SigHandler, SigSet, SigmaskHow, Signal};
use nix::unistd::{fork, ForkResult, Pid};

use crate::utils::fatal;

/// Exit status of a child whose callback panicked
pub const PANIC_EXIT_CODE: i32 = 101;

/// Lifecycle notifications around a process duplication.
///
/// Whatever owns state that must not be duplicated across `fork` (a reactor, a
/// buffered log sink) hooks in here.
pub trait ForkObserver {
  /// Called in the parent right before duplication
  fn before_fork(&self) {}

  /// Called in the child right after duplication
  fn after_fork_child(&self) {}

  /// Called in the parent right after duplication
  fn after_fork_parent(&self, _child: Pid) {}
}

/// Fork observer for a process driven by the tokio reactor
#[derive(Debug, Default, Clone, Copy)]
pub struct ReactorHooks;

impl ForkObserver for ReactorHooks {
  fn before_fork(&self) {
    log::logger().flush();
  }

  fn after_fork_child(&self) {
    // The inherited SIGCHLD handler would write into the parent's signal pipe.
    if let Err(err) = unsafe { signal(Signal::SIGCHLD, SigHandler::SigDfl) } {
      fatal("Reset SIGCHLD disposition", err);
    }
    if let Err(err) = sigprocmask(SigmaskHow::SIG_SETMASK, Some(&SigSet::empty()), None) {
      fatal("Clear signal mask", err);
    }
  }

  fn after_fork_parent(&self, child: Pid) {
    debug!("Fork child process #{}", child);
  }
}

struct NoObserver;

impl ForkObserver for NoObserver {}

/// Leave the child immediately, without running destructors or atexit handlers
pub fn exit_child(code: i32) -> ! {
  unsafe { libc::_exit(code) }
}

/// Duplicate the calling process and run `callback` in the child.
///
/// The callback can only finish by replacing the process image or exiting. Returns
/// the child pid in the parent; a failed duplication aborts.
pub fn spawn<F>(callback: F) -> Pid
where
  F: FnOnce() -> Infallible,
{
  spawn_with(&NoObserver, callback)
}

/// [`spawn`] with `observer` notified before, and after in both branches
pub fn spawn_with<O, F>(observer: &O, callback: F) -> Pid
where
  O: ForkObserver + ?Sized,
  F: FnOnce() -> Infallible,
{
  observer.before_fork();
  match unsafe { fork() } {
    Ok(ForkResult::Parent { child, .. }) => {
      observer.after_fork_parent(child);
      child
    }
    Ok(ForkResult::Child) => {
      observer.after_fork_child();
      match catch_unwind(AssertUnwindSafe(callback)) {
        Ok(never) => match never {},
        Err(_) => exit_child(PANIC_EXIT_CODE),
      }
    }
    Err(errno) => fatal("Fork failed", errno),
  }
}
