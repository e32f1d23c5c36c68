//! Common test utilities for integration tests.

use std::path::PathBuf;

/// Load a raw log fixture from the fixtures directory.
pub fn load_log_fixture(name: &str) -> String {
    let fixture_path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
        .join("logs")
        .join(format!("{}.txt", name));

    let content = std::fs::read_to_string(&fixture_path)
        .unwrap_or_else(|e| panic!("Failed to read fixture {}: {}", fixture_path.display(), e));

    // Fixtures end with a newline; the log endpoint does not.
    content.trim_end_matches('\n').to_string()
}

/// Render a stage marker line the way the executor does.
pub fn marker_line(stage: &str, verb: &str, time: &str) -> String {
    format!("========== {} {} at {} ==========", stage.to_uppercase(), verb, time)
}
