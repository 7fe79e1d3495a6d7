/// Test utilities for conditional test execution
use std::process::Command;

#[cfg(any(test, feature = "test-utils"))]
mod mock;

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{MockBehavior, MockCall, MockOp, MockTool};

pub fn has_restic() -> bool {
    let binary = std::env::var("RESTICD_RESTIC_BINARY").unwrap_or_else(|_| "restic".to_string());
    Command::new(binary)
        .arg("version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Macro to skip tests when the restic binary isn't installed
#[macro_export]
macro_rules! require_restic {
    () => {
        if !$crate::test_utils::has_restic() {
            eprintln!("Test ignored: restic not available");
            return;
        }
    };
}
