use std::fs::{self, File};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::time::Duration;

use log::info;
use tempfile::tempdir;

use icebox::judge::{judge_testcase, load_testcases};
use icebox::preset::detect_language;
use icebox::report::RunSummary;
use icebox::{
  Compiler, ExitStatus, LimitExceeded, Package, ProcessOptions, Stream, Streams, Supervisor,
  Verdict,
};
use nix::sys::signal::Signal;

mod common;

const SOURCE_DIR: &str = "./fixtures/aplusb/source/";

fn compile(file: &str) -> Package {
  let source = fs::read_to_string(format!("{}{}", SOURCE_DIR, file)).unwrap();
  let language = detect_language(&None, file).unwrap();
  let compiler = Compiler::preset(&language).unwrap();
  info!("Compile {} as {}", file, language);
  compiler.compile(&source).unwrap()
}

fn run_aplusb(package: &Package) {
  let install = tempdir().unwrap();
  package.install(install.path()).unwrap();

  for i in 1..4 {
    let sub_in = File::open(format!("./fixtures/aplusb/testcases/{}.in", i)).unwrap();
    let streams = Streams::capture().stdin(Stream::Fd(sub_in.as_raw_fd()));
    let output = package
      .execute_with(install.path(), streams)
      .unwrap()
      .wait_with_output()
      .unwrap();

    let out = String::from_utf8_lossy(&output.stdout).to_string();
    let ans = fs::read_to_string(PathBuf::from(format!(
      "./fixtures/aplusb/testcases/{}.ans",
      i
    )))
    .unwrap();

    info!("Testcase #{}. out: {}", i, out.trim_end());
    info!("Testcase #{}. ans: {}", i, ans.trim_end());
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert_eq!(out, ans);
  }
}

#[test]
fn it_should_run_c_ac() {
  common::setup();
  if !common::sandbox_available() || !common::has_tool("/usr/bin/gcc") {
    return;
  }
  let package = compile("ac.c");
  assert!(package.dir().join("foo").is_file());
  run_aplusb(&package);
}

#[test]
fn it_should_run_cpp_ac() {
  common::setup();
  if !common::sandbox_available() || !common::has_tool("/usr/bin/g++") {
    return;
  }
  run_aplusb(&compile("ac.cpp"));
}

#[test]
fn it_should_run_python_ac() {
  common::setup();
  if !common::sandbox_available() || !common::has_tool("/usr/bin/python3") {
    return;
  }
  run_aplusb(&compile("ac.py"));
}

#[test]
fn it_should_run_java_ac() {
  common::setup();
  if !common::sandbox_available()
    || !common::has_tool("/usr/bin/javac")
    || !common::has_tool("/usr/bin/java")
  {
    return;
  }
  run_aplusb(&compile("Main.java"));
}

#[test]
fn it_should_print_the_same_in_every_language() {
  common::setup();
  if !common::sandbox_available() {
    return;
  }

  let programs = [
    (
      "/usr/bin/gcc",
      "c",
      "#include <stdio.h>\nint main() { printf(\"Hello\\nWorld!\\n\"); return 0; }\n",
    ),
    ("/usr/bin/python3", "python3", "print('Hello')\nprint('World!')\n"),
    (
      "/usr/bin/g++",
      "cpp",
      "#include <iostream>\nint main() { std::cout << \"Hello\\nWorld!\" << std::endl; }\n",
    ),
  ];

  for (tool, language, source) in programs {
    if !common::has_tool(tool) {
      continue;
    }
    let package = Compiler::preset(language).unwrap().compile(source).unwrap();
    let install = tempdir().unwrap();
    package.install(install.path()).unwrap();
    let output = package
      .execute_with(install.path(), Streams::capture())
      .unwrap()
      .wait_with_output()
      .unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "Hello\nWorld!\n");
  }
}

#[test]
fn it_should_leave_package_empty_on_compile_error() {
  common::setup();
  if !common::sandbox_available() || !common::has_tool("/usr/bin/gcc") {
    return;
  }
  let package = compile("ce.c");
  assert!(package.is_empty().unwrap());

  let install = tempdir().unwrap();
  package.install(install.path()).unwrap();
  let output = package
    .execute_with(install.path(), Streams::capture())
    .unwrap()
    .wait_with_output()
    .unwrap();
  assert_eq!(output.status.code(), Some(127));
}

#[tokio::test]
async fn it_should_stop_c_tle() {
  common::setup();
  if !common::sandbox_available() || !common::has_tool("/usr/bin/gcc") {
    return;
  }
  let package = compile("tle.c");
  let install = tempdir().unwrap();
  package.install(install.path()).unwrap();

  let mut supervisor = Supervisor::new().unwrap();
  for _ in 0..2 {
    let options = ProcessOptions::new().cpu_time_limit(Duration::from_millis(500));
    supervisor
      .run_sandboxed(package.command(install.path()).unwrap(), options)
      .unwrap();
    let report = supervisor.next_report().await.unwrap().unwrap();
    info!("Time limit exceeded run: {:?}", report);
    assert_eq!(report.status, ExitStatus::Signaled(Signal::SIGKILL));
    assert_eq!(report.limit, Some(LimitExceeded::CpuTime));
  }
  assert_eq!(supervisor.tracked(), 0);
}

#[tokio::test]
async fn it_should_judge_aplusb_testcases() {
  common::setup();
  if !common::sandbox_available() || !common::has_tool("/usr/bin/gcc") {
    return;
  }

  let cases = load_testcases("./fixtures/aplusb/testcases").unwrap();
  assert_eq!(cases.len(), 3);

  let expected = [
    ("ac.c", Verdict::Accepted),
    ("wa.c", Verdict::WrongAnswer),
    ("re.c", Verdict::RuntimeError),
    ("tle.c", Verdict::TimeLimitExceeded),
  ];
  let mut supervisor = Supervisor::new().unwrap();
  for (file, verdict) in expected {
    let package = compile(file);
    let install = tempdir().unwrap();
    package.install(install.path()).unwrap();

    let mut summary = RunSummary::new();
    for case in cases.iter() {
      let options = ProcessOptions::new().cpu_time_limit(Duration::from_millis(500));
      let command = package.command(install.path()).unwrap();
      let (report, got) = judge_testcase(&mut supervisor, command, case, options)
        .await
        .unwrap();
      info!("{} on testcase #{}: {}", file, case.name, got);
      assert_eq!(got, verdict, "{} on testcase #{}", file, case.name);
      summary.add_verdict(case.name.clone(), report, got);
    }
    assert_eq!(summary.ok(), verdict == Verdict::Accepted);
  }
  assert_eq!(supervisor.tracked(), 0);
}
