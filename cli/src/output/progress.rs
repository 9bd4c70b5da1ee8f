//! indicatif spinners and batch counters for long-running steps.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};

const SPINNER: &str = "  {spinner:.cyan} {msg}";
const BATCHES: &str = "  {msg}\n    {bar:40.cyan/dim} {pos}/{len} batches";
const FINISHED: &str = "  {prefix} {msg}";

fn bar_style(template: &str) -> ProgressStyle {
    #[allow(clippy::expect_used)]
    ProgressStyle::default_bar()
        .template(template)
        .expect("progress templates are constants")
}

/// Spinner shown while a step has no batch count yet.
#[must_use]
pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        bar_style(SPINNER).tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "✓"]),
    );
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

/// Switch `pb` to a counter of `total` copy or compression batches.
pub fn batches(pb: &ProgressBar, total: u64) {
    pb.set_length(total);
    pb.set_style(bar_style(BATCHES).progress_chars("━━─"));
}

/// Replace the spinner or bar with a checkmark line.
pub fn finish_ok(pb: &ProgressBar, msg: &str) {
    pb.set_style(bar_style(FINISHED));
    pb.set_prefix("✓");
    pb.finish_with_message(msg.to_string());
}
