#![allow(dead_code)]

use std::path::Path;
use std::sync::Once;

use flexi_logger::Logger;
use log::warn;

use icebox::jail;

static INIT: Once = Once::new();

pub fn setup() {
  INIT.call_once(|| {
    Logger::try_with_str("icebox=debug,info")
      .unwrap()
      .start()
      .unwrap();
  });
}

/// Namespaces are usable here; logs why the calling test is skipped otherwise
pub fn sandbox_available() -> bool {
  let available = jail::probe();
  if !available {
    warn!("Skip: user namespaces are not available on this host");
  }
  available
}

/// A host tool exists; logs why the calling test is skipped otherwise
pub fn has_tool<P: AsRef<Path>>(tool: P) -> bool {
  let tool = tool.as_ref();
  let found = tool.exists();
  if !found {
    warn!("Skip: {} is not installed", tool.to_string_lossy());
  }
  found
}
