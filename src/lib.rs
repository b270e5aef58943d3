pub use error::{IceBoxError, IceBoxExit};
pub use jail::Jail;
pub use judge::{Testcase, Verdict};
pub use launch::{launch, Command, ExitStatus, Output, ProcessHandle, Stream, Streams};
pub use package::{Compiler, Package};
pub use sandbox::SandboxedCommand;
pub use supervisor::{LimitExceeded, ProcessOptions, ProcessReport, Supervisor};
pub use utils::MountSpec;

pub mod error;
pub mod fork;
pub mod jail;
pub mod judge;
pub mod launch;
pub mod package;
pub mod preset;
pub mod report;
pub mod sandbox;
pub mod supervisor;
pub mod utils;
