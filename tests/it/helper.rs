//! Helper macros/functions for testing.
//!
//! Note: Rust macros are expanded in place as if the generated code was written in that file;
//! as such each macro in this file must be independent of location.
//! Mostly this just means "if the macro calls something else, it needs to reference it by fully qualified path".

use std::collections::HashMap;

use runner_proxy::task::Task;

/// Tests are run independently by cargo nextest, so this macro configures settings used in snapshot tests.
///
/// If using `assert_error_stack_snapshot`, there's no need to run this, as it is run automatically.
/// This macro is still exported for tests using `insta` directly.
macro_rules! set_snapshot_vars {
    () => {
        // During error stack snapshot testing, colors really mess with readability.
        // While colors are an important part of the overall error message story,
        // they're less important than structure; the thought is that by making structure easier to test
        // we can avoid most failures. Colors, by comparison, are harder to accidentally change.
        error_stack::Report::set_color_mode(error_stack::fmt::ColorMode::None);
        colored::control::set_override(false);
    };
}

pub(crate) use set_snapshot_vars;

/// Build a single-job, single-step task running `run`, with the given `if:` condition.
pub(crate) fn task_with_job(id: u64, condition: Option<&str>, run: &str) -> Task {
    let condition_line = condition.map(|c| format!("    if: \"{c}\"\n")).unwrap_or_default();
    let workflow = format!(
        "jobs:\n  build:\n{condition_line}    steps:\n      - name: step\n        run: {run}\n"
    );
    Task::new(id, workflow.into_bytes(), HashMap::new(), HashMap::new(), HashMap::new(), HashMap::new(), None)
}
