use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::package::Compiler;
use crate::IceBoxError;

lazy_static! {
  static ref DETECT_LANGUAGE_MAP: HashMap<&'static str, &'static str> = {
    let mut map = HashMap::new();
    map.insert("c", "c");
    map.insert("cc", "cpp");
    map.insert("c++", "cpp");
    map.insert("cpp", "cpp");
    map.insert("java", "java");
    map.insert("py", "python3");
    map.insert("python", "python3");
    map.insert("python3", "python3");
    map
  };

  static ref PRESETS: HashMap<&'static str, Compiler> = {
    let mut map = HashMap::new();
    map.insert(
      "c",
      Compiler::compiled(
        "/usr/bin/gcc",
        vec!["gcc", "-std=c99", "-O2", "-o", "/out/foo", "foo.c", "-lm"],
        "foo.c",
        "foo",
        vec!["foo"],
      ),
    );
    map.insert(
      "cpp",
      Compiler::compiled(
        "/usr/bin/g++",
        vec!["g++", "-std=c++17", "-O2", "-o", "/out/foo", "foo.cc"],
        "foo.cc",
        "foo",
        vec!["foo"],
      ),
    );
    map.insert(
      "java",
      Compiler::compiled(
        "/usr/bin/javac",
        vec!["javac", "-encoding", "UTF-8", "-d", "/out", "Main.java"],
        "Main.java",
        "/usr/bin/java",
        vec!["java", "-cp", "/in", "Main"],
      ),
    );
    map.insert(
      "python3",
      Compiler::interpreted("foo.py", "/usr/bin/python3", vec!["python3", "foo.py"]),
    );
    map
  };
}

/// Normalize a language name, or guess it from the submission's extension
pub fn detect_language(language: &Option<String>, submission: &str) -> Option<String> {
  if let Some(language) = language {
    let language = language.to_lowercase();
    return match DETECT_LANGUAGE_MAP.get(language.as_str()) {
      Some(language) => Some(language.to_string()),
      None => Some(language),
    };
  }

  if let Some((_, ext)) = submission.rsplit_once('.') {
    let ext = ext.to_lowercase();
    DETECT_LANGUAGE_MAP.get(ext.as_str()).map(|v| v.to_string())
  } else {
    None
  }
}

/// Built-in compiler for a normalized language name
pub fn preset(language: &str) -> Result<&'static Compiler, IceBoxError> {
  PRESETS
    .get(language)
    .ok_or_else(|| IceBoxError::cli(format!("Unknown language {}", language)))
}

impl Compiler {
  /// Same as [`preset`], for callers that already hold the type
  pub fn preset(language: &str) -> Result<&'static Compiler, IceBoxError> {
    preset(language)
  }
}

/// Names of every built-in language, sorted
pub fn languages() -> Vec<&'static str> {
  let mut names: Vec<&'static str> = PRESETS.keys().copied().collect();
  names.sort();
  names
}
