use std::fs::{self, canonicalize};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use path_absolutize::Absolutize;

use crate::jail::Jail;
use crate::launch::{Command, ProcessHandle, Streams};
use crate::sandbox::SandboxedCommand;
use crate::utils::{copy_tree, MountSpec, PrivateDir};
use crate::IceBoxError;

/// Where an installed package appears inside the execution jail
pub const JAIL_INSTALL_DIR: &str = "/in";

/// Where the compiler finds the submitted source inside the build jail
pub const JAIL_SOURCE_DIR: &str = "/in";

/// Where the compiler must leave its artifact inside the build jail
pub const JAIL_OUTPUT_DIR: &str = "/out";

/// Compiler output kept in the log when a build fails
const MAX_COMPILER_OUTPUT: usize = 8192;

/// A built program: a private artifact tree, an entry file and its argument vector.
///
/// The artifact tree is removed together with the package.
#[derive(Debug)]
pub struct Package {
  dir: PrivateDir,
  execute_file: PathBuf,
  execute_args: Vec<String>,
}

impl Package {
  fn new(dir: PrivateDir, execute_file: PathBuf, execute_args: Vec<String>) -> Self {
    Package {
      dir,
      execute_file,
      execute_args,
    }
  }

  pub fn dir(&self) -> &Path {
    self.dir.path()
  }

  pub fn execute_file(&self) -> &Path {
    &self.execute_file
  }

  pub fn execute_args(&self) -> &Vec<String> {
    &self.execute_args
  }

  /// A package whose artifact tree is empty, i.e. the build produced nothing
  pub fn is_empty(&self) -> Result<bool, IceBoxError> {
    Ok(fs::read_dir(self.dir.path())?.next().is_none())
  }

  /// Copy the artifact tree into `install_dir`
  pub fn install<P: AsRef<Path>>(&self, install_dir: P) -> Result<(), IceBoxError> {
    let install_dir = install_dir.as_ref();
    debug!(
      "Install package {} into {}",
      self.dir.path().to_string_lossy(),
      install_dir.to_string_lossy()
    );
    copy_tree(self.dir.path(), install_dir)
  }

  /// The jailed command running this package from `install_dir`.
  ///
  /// The install directory is bound read-only at [`JAIL_INSTALL_DIR`], which is also the
  /// working directory; a relative entry file is resolved against it.
  pub fn command<P: AsRef<Path>>(&self, install_dir: P) -> Result<SandboxedCommand, IceBoxError> {
    let install_dir = canonicalize(install_dir.as_ref())?;
    let program = self
      .execute_file
      .absolutize_from(Path::new(JAIL_INSTALL_DIR))?
      .to_path_buf();

    let mut mounts = MountSpec::toolchain();
    mounts.push(MountSpec::read(install_dir, "in")?);
    let jail = Jail::new(mounts)?;

    let command = Command::new(program)
      .argv(self.execute_args.clone())
      .cwd(JAIL_INSTALL_DIR);
    Ok(SandboxedCommand::new(jail, command))
  }

  /// Launch the installed package in a fresh jail with inherited streams
  pub fn execute<P: AsRef<Path>>(&self, install_dir: P) -> Result<ProcessHandle, IceBoxError> {
    self.execute_with(install_dir, Streams::inherit())
  }

  /// Launch the installed package in a fresh jail with the given streams
  pub fn execute_with<P: AsRef<Path>>(
    &self,
    install_dir: P,
    streams: Streams,
  ) -> Result<ProcessHandle, IceBoxError> {
    self.command(install_dir)?.spawn(streams)
  }
}

/// Turns submitted source text into a [`Package`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compiler {
  /// Runs a real compiler inside a build jail; the package is whatever it leaves in `/out`
  Compiled {
    compiler_file: PathBuf,
    compiler_args: Vec<String>,
    code_file: PathBuf,
    execute_file: PathBuf,
    execute_args: Vec<String>,
  },
  /// Packages the source itself, to be run by an interpreter
  Interpreted {
    code_file: PathBuf,
    execute_file: PathBuf,
    execute_args: Vec<String>,
  },
}

fn strings<AS: Into<String>>(args: Vec<AS>) -> Vec<String> {
  args.into_iter().map(|a| a.into()).collect()
}

fn write_source(dir: &Path, code_file: &Path, source: &str) -> Result<(), IceBoxError> {
  let path = dir.join(code_file);
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent)?;
  }
  fs::write(&path, source)?;
  Ok(())
}

impl Compiler {
  pub fn compiled<CP, CF, EP, AS, ES>(
    compiler_file: CP,
    compiler_args: Vec<AS>,
    code_file: CF,
    execute_file: EP,
    execute_args: Vec<ES>,
  ) -> Self
  where
    CP: Into<PathBuf>,
    CF: Into<PathBuf>,
    EP: Into<PathBuf>,
    AS: Into<String>,
    ES: Into<String>,
  {
    Compiler::Compiled {
      compiler_file: compiler_file.into(),
      compiler_args: strings(compiler_args),
      code_file: code_file.into(),
      execute_file: execute_file.into(),
      execute_args: strings(execute_args),
    }
  }

  pub fn interpreted<CF, EP, ES>(code_file: CF, execute_file: EP, execute_args: Vec<ES>) -> Self
  where
    CF: Into<PathBuf>,
    EP: Into<PathBuf>,
    ES: Into<String>,
  {
    Compiler::Interpreted {
      code_file: code_file.into(),
      execute_file: execute_file.into(),
      execute_args: strings(execute_args),
    }
  }

  /// Build `source` into a package.
  ///
  /// Only host-side failures are errors. A compiler that rejects the source is logged
  /// and yields a package that is empty or lacks its entry file.
  pub fn compile(&self, source: &str) -> Result<Package, IceBoxError> {
    match self {
      Compiler::Compiled {
        compiler_file,
        compiler_args,
        code_file,
        execute_file,
        execute_args,
      } => {
        let compiler = canonicalize(compiler_file)?;
        let input = PrivateDir::create("icebox.source.%%%%%%%%%%%%%%%%")?;
        let output = PrivateDir::create("icebox.package.%%%%%%%%%%%%%%%%")?;
        write_source(input.path(), code_file, source)?;

        let mut mounts = MountSpec::toolchain();
        mounts.push(MountSpec::read(input.path(), "in")?);
        mounts.push(MountSpec::write(output.path(), "out")?);
        let jail = Jail::new(mounts)?;
        let command = Command::new(&compiler)
          .argv(compiler_args.clone())
          .cwd(JAIL_SOURCE_DIR);

        info!("Compile {} with {}", code_file.to_string_lossy(), compiler.to_string_lossy());
        let result = SandboxedCommand::new(jail, command)
          .spawn(Streams::capture_merged())?
          .wait_with_output()?;

        let text = String::from_utf8_lossy(&result.stdout);
        let text = match text.char_indices().nth(MAX_COMPILER_OUTPUT) {
          Some((end, _)) => &text[..end],
          None => &text[..],
        };
        if result.status.success() {
          debug!("Compiler output: {}", text);
        } else {
          warn!(
            "Compiler {} {}, output: {}",
            compiler.to_string_lossy(),
            result.status,
            text
          );
        }

        Ok(Package::new(output, execute_file.clone(), execute_args.clone()))
      }
      Compiler::Interpreted {
        code_file,
        execute_file,
        execute_args,
      } => {
        let output = PrivateDir::create("icebox.package.%%%%%%%%%%%%%%%%")?;
        write_source(output.path(), code_file, source)?;
        Ok(Package::new(output, execute_file.clone(), execute_args.clone()))
      }
    }
  }
}
