use std::env;
use std::fs::{self, File};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use flexi_logger::{Duplicate, FileSpec, Logger};
use log::{error, info};

use icebox::judge::{judge_testcase, load_testcases};
use icebox::preset::{detect_language, languages};
use icebox::report::RunSummary;
use icebox::utils::{default_format, PrivateDir};
use icebox::{jail, Compiler, IceBoxError, IceBoxExit, ProcessOptions, Supervisor};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
  #[command(about = "Check whether this host can build sandboxes")]
  Check,

  #[command(about = "Compile a submission and run it in a sandbox")]
  Run {
    #[arg(help = "Submission source file")]
    submission: PathBuf,

    #[arg(short, long, help = "Submission language (detected from the extension by default)")]
    language: Option<String>,

    #[arg(long, help = "File fed to the program's stdin")]
    stdin: Option<PathBuf>,

    #[arg(
      short,
      long,
      conflicts_with = "stdin",
      help = "Judge against every N.in / N.ans pair in this directory"
    )]
    testcases: Option<PathBuf>,

    #[arg(short, long, help = "CPU time limit (unit: ms)")]
    cpu_time: Option<u64>,

    #[arg(short, long, help = "Idle time limit (unit: ms)")]
    idle_time: Option<u64>,

    #[arg(short, long, help = "Memory limit (unit: KB, not enforced)")]
    memory: Option<u64>,

    #[arg(short, long, default_value_t = 1, help = "How many times to run the program")]
    repeat: usize,

    #[arg(long, default_value_t = false, help = "Always report JSON")]
    json: bool,
  },

  #[command(about = "List the built-in languages")]
  Languages,
}

struct RunArgs {
  submission: PathBuf,
  language: Option<String>,
  stdin: Option<PathBuf>,
  testcases: Option<PathBuf>,
  options: ProcessOptions,
  repeat: usize,
  json: bool,
}

fn check() -> Result<(), IceBoxError> {
  if jail::probe() {
    println!("Sandbox is available");
    Ok(())
  } else {
    Err(IceBoxError::jail(
      "Can not build a sandbox, user namespaces may be disabled on this host",
    ))
  }
}

fn run(args: RunArgs) -> Result<(), IceBoxError> {
  let source = fs::read_to_string(&args.submission)?;
  let language = detect_language(&args.language, &args.submission.to_string_lossy())
    .ok_or(IceBoxError::cli("Can not detect submission language"))?;
  let compiler = Compiler::preset(&language)?;

  info!("Compile submission {} as {}", args.submission.to_string_lossy(), language);
  let package = compiler.compile(&source)?;
  if package.is_empty()? {
    error!("Compilation of {} produced nothing", args.submission.to_string_lossy());
    return Err(IceBoxError::exec("Compilation failed"));
  }
  let install = PrivateDir::create("icebox.install.%%%%%%%%%%%%%%%%")?;
  package.install(install.path())?;

  let runtime = tokio::runtime::Builder::new_current_thread()
    .enable_all()
    .build()?;
  let summary = runtime.block_on(async {
    let mut supervisor = Supervisor::new()?;
    let mut summary = RunSummary::new();
    if let Some(dir) = &args.testcases {
      for case in load_testcases(dir)? {
        let command = package.command(install.path())?;
        let (report, verdict) =
          judge_testcase(&mut supervisor, command, &case, args.options.clone()).await?;
        summary.add_verdict(case.name, report, verdict);
      }
      return Ok(summary);
    }
    for _ in 0..args.repeat {
      let stdin = match &args.stdin {
        Some(path) => Some(File::open(path)?),
        None => None,
      };
      let options = match &stdin {
        Some(file) => args.options.clone().stdin(file.as_raw_fd()),
        None => args.options.clone(),
      };
      supervisor.run_sandboxed(package.command(install.path())?, options)?;
      drop(stdin);
      let report = supervisor
        .next_report()
        .await?
        .ok_or(IceBoxError::launch("Supervised program was lost"))?;
      summary.add_result(report);
    }
    Ok::<RunSummary, IceBoxError>(summary)
  })?;

  if args.json {
    summary.report_json();
  } else {
    summary.report();
  }
  Ok(())
}

fn start(cli: Cli) -> Result<(), IceBoxError> {
  let _logger = Logger::try_with_str(env::var("ICEBOX_LOG").unwrap_or("icebox=info".into()))?
    .log_to_file(
      FileSpec::default()
        .directory(env::var("LOG_DIR").unwrap_or("./logs/".into()))
        .basename("icebox")
        .discriminant(format!("{}", chrono::offset::Local::now().format("%Y-%m-%d")))
        .suppress_timestamp(),
    )
    .append()
    .duplicate_to_stderr(Duplicate::Warn)
    .format_for_files(default_format)
    .start()?;

  info!("Start running icebox");

  match cli.command {
    Commands::Check => check()?,
    Commands::Run {
      submission,
      language,
      stdin,
      testcases,
      cpu_time,
      idle_time,
      memory,
      repeat,
      json,
    } => {
      let mut options = ProcessOptions::new();
      if let Some(ms) = cpu_time {
        options = options.cpu_time_limit(Duration::from_millis(ms));
      }
      if let Some(ms) = idle_time {
        options = options.idle_time_limit(Duration::from_millis(ms));
      }
      if let Some(kb) = memory {
        options = options.memory_limit(kb * 1024);
      }
      run(RunArgs {
        submission,
        language,
        stdin,
        testcases,
        options,
        repeat,
        json,
      })?
    }
    Commands::Languages => {
      for language in languages() {
        println!("{}", language);
      }
    }
  }

  info!("Running icebox finished");

  Ok(())
}

fn main() -> IceBoxExit {
  let cli = Cli::parse();
  start(cli).into()
}
