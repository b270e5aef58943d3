use std::{
  error::Error,
  fmt::{Debug, Display},
  process::{ExitCode, Termination},
};

use flexi_logger::FlexiLoggerError;
use nix::{errno::Errno, libc::STDOUT_FILENO, unistd::isatty};

pub enum IceBoxError {
  Fork(String),
  Exec(String),
  Jail(String),
  Launch(String),
  Accounting(String),
  TempPath(String),
  Nix(Errno),
  Fs(String),
  Cli(String),
  Logger(FlexiLoggerError),
}

pub enum IceBoxExit {
  Ok,
  Err(IceBoxError),
}

impl IceBoxError {
  pub fn fork<MS: Into<String>>(msg: MS) -> IceBoxError {
    IceBoxError::Fork(msg.into())
  }

  pub fn exec<MS: Into<String>>(msg: MS) -> IceBoxError {
    IceBoxError::Exec(msg.into())
  }

  pub fn jail<MS: Into<String>>(msg: MS) -> IceBoxError {
    IceBoxError::Jail(msg.into())
  }

  pub fn launch<MS: Into<String>>(msg: MS) -> IceBoxError {
    IceBoxError::Launch(msg.into())
  }

  pub fn accounting<MS: Into<String>>(msg: MS) -> IceBoxError {
    IceBoxError::Accounting(msg.into())
  }

  pub fn temp_path<MS: Into<String>>(msg: MS) -> IceBoxError {
    IceBoxError::TempPath(msg.into())
  }

  pub fn cli<MS: Into<String>>(msg: MS) -> IceBoxError {
    IceBoxError::Cli(msg.into())
  }
}

impl Debug for IceBoxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    std::fmt::Display::fmt(&self, f)
  }
}

impl Display for IceBoxError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match &self {
      IceBoxError::Fork(msg) => f.write_fmt(format_args!("IceBox Fork Error: {}", msg)),
      IceBoxError::Exec(msg) => f.write_fmt(format_args!("IceBox Exec Error: {}", msg)),
      IceBoxError::Jail(msg) => f.write_fmt(format_args!("IceBox Jail Error: {}", msg)),
      IceBoxError::Launch(msg) => f.write_fmt(format_args!("IceBox Launch Error: {}", msg)),
      IceBoxError::Accounting(msg) => {
        f.write_fmt(format_args!("IceBox Accounting Error: {}", msg))
      }
      IceBoxError::TempPath(msg) => f.write_fmt(format_args!("IceBox Temp Path Error: {}", msg)),
      IceBoxError::Nix(errno) => f.write_fmt(format_args!("IceBox Nix Error: {}", errno)),
      IceBoxError::Fs(msg) => f.write_fmt(format_args!("IceBox File System Error: {}", msg)),
      IceBoxError::Cli(msg) => f.write_fmt(format_args!("IceBox CLI Error: {}", msg)),
      IceBoxError::Logger(err) => f.write_fmt(format_args!("IceBox Logger Error: {}", err)),
    }
  }
}

impl From<Errno> for IceBoxError {
  fn from(errno: Errno) -> Self {
    IceBoxError::Nix(errno)
  }
}

impl From<std::io::Error> for IceBoxError {
  fn from(err: std::io::Error) -> Self {
    IceBoxError::Fs(err.to_string())
  }
}

impl From<FlexiLoggerError> for IceBoxError {
  fn from(err: FlexiLoggerError) -> Self {
    IceBoxError::Logger(err)
  }
}

impl Error for IceBoxError {}

impl<T> From<Result<T, IceBoxError>> for IceBoxExit {
  fn from(result: Result<T, IceBoxError>) -> Self {
    match result {
      Ok(_) => IceBoxExit::Ok,
      Err(err) => IceBoxExit::Err(err),
    }
  }
}

impl Termination for IceBoxExit {
  fn report(self) -> ExitCode {
    match self {
      IceBoxExit::Ok => ExitCode::SUCCESS.report(),
      IceBoxExit::Err(err) => {
        let text = format!("{}", err);
        let text = match text.split_once(": ") {
          Some((prefix, message)) => {
            let is_tty = isatty(STDOUT_FILENO).unwrap_or(false);
            if is_tty {
              format!("\x1b[1m\x1b[91m{}\x1b[39m\x1b[22m  {}", prefix, message)
            } else {
              format!(
                "{{\n  \"ok\": false,\n  \"type\": \"{}\",\n  \"message\": \"{}\"\n}}",
                prefix,
                message.replace('\\', "\\\\").replace('"', "\\\"")
              )
            }
          }
          None => {
            format!("{}", err)
          }
        };
        eprintln!("{}", text);
        ExitCode::FAILURE.report()
      }
    }
  }
}
