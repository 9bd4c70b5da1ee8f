//! Human-readable terminal renderer.

use afpack_common::{ManagedPath, OperationPhase, OperationRecord, StatusOutput};
use owo_colors::OwoColorize as _;

use crate::application::services::orchestrator::{PackOutcome, PackPlan};
use crate::domain::size::format_size;
use crate::output::OutputContext;

/// Renders domain types as human-readable terminal output using `OutputContext`.
pub struct HumanRenderer<'a> {
    ctx: &'a OutputContext,
}

impl<'a> HumanRenderer<'a> {
    /// Create a new `HumanRenderer` wrapping the given output context.
    #[must_use]
    pub fn new(ctx: &'a OutputContext) -> Self {
        Self { ctx }
    }

    /// Render one managed path.
    pub fn render_status(&self, status: &StatusOutput) {
        if self.ctx.quiet {
            return;
        }
        self.ctx.kv("Path:      ", &status.path.display().to_string());
        self.ctx.kv(
            "State:     ",
            &status.state.style(self.ctx.state_style(&status.state)).to_string(),
        );
        self.ctx.kv("Size:      ", &format_size(status.size_bytes));
        self.ctx.kv("Compressed:", yes_no(status.compressed));
        self.ctx.kv("Mounted:   ", yes_no(status.mounted));
        if let Some(image) = &status.backing_image {
            self.ctx.kv("Image:     ", &image.display().to_string());
        }
        if let Some(fp) = &status.fingerprint {
            self.ctx.kv("Content:   ", fp);
        }
        if let Some(pending) = &status.pending {
            println!();
            self.ctx.warn(&format!(
                "{} interrupted at {} (started {})",
                pending.kind,
                pending.step,
                pending.started_at.format("%Y-%m-%d %H:%M:%S UTC")
            ));
            self.ctx.info(&format!(
                "Run: afpack {} {}  (resume)  or  afpack recover {}  (roll back)",
                pending.kind,
                status.path.display(),
                status.path.display()
            ));
        }
    }

    /// Render every managed path as one line each.
    pub fn render_list(&self, entries: &[ManagedPath]) {
        if entries.is_empty() {
            self.ctx.info("No managed paths.");
            return;
        }
        if self.ctx.quiet {
            return;
        }
        for entry in entries {
            let flag = if entry.compressed {
                entry.algorithm.map_or_else(|| "compressed".to_string(), |a| a.to_string())
            } else {
                String::new()
            };
            println!(
                "  {:<14} {:>10}  {:<6} {}",
                entry.state.label().style(self.ctx.state_style(&entry.state)),
                format_size(entry.size_bytes),
                flag.style(self.ctx.styles.dim),
                entry.logical_path.display()
            );
        }
    }

    /// Render an operation log.
    pub fn render_log(&self, records: &[OperationRecord]) {
        if records.is_empty() {
            self.ctx.info("No operations recorded.");
            return;
        }
        if self.ctx.quiet {
            return;
        }
        for record in records {
            let phase = match record.phase {
                OperationPhase::Intent => "intent".style(self.ctx.styles.dim).to_string(),
                OperationPhase::Done => "done".style(self.ctx.styles.success).to_string(),
                OperationPhase::Failed => "failed".style(self.ctx.styles.error).to_string(),
                OperationPhase::RolledBack => {
                    "rolled back".style(self.ctx.styles.warning).to_string()
                }
            };
            let detail = record.detail.as_deref().unwrap_or("");
            println!(
                "  {:>4}  {}  {:<10} {:<15} {phase}  {detail}",
                record.seq,
                record.at.format("%Y-%m-%d %H:%M:%S"),
                record.kind.verb(),
                record.step,
            );
        }
    }

    /// Render the result of packing one path.
    pub fn render_pack(&self, outcome: &PackOutcome) {
        match outcome {
            PackOutcome::Packed {
                path,
                size_bytes,
                compressed,
                resumed,
                ..
            } => {
                let verb = if *resumed { "Resumed and packed" } else { "Packed" };
                let extra = if *compressed { ", compressed" } else { "" };
                self.ctx.success(&format!(
                    "{verb} {} ({}{extra})",
                    path.display(),
                    format_size(*size_bytes)
                ));
            }
            PackOutcome::AlreadyPacked { path, .. } => {
                self.ctx.info(&format!("{} is already packed", path.display()));
            }
            PackOutcome::Planned(plan) => self.render_plan(plan),
            PackOutcome::WouldResume { path, step } => {
                self.ctx.info(&format!(
                    "Would resume the interrupted pack of {} at {step}",
                    path.display()
                ));
            }
        }
    }

    /// Render a dry-run pack plan.
    pub fn render_plan(&self, plan: &PackPlan) {
        self.ctx
            .header(&format!("Would pack {}", plan.path.display()));
        self.ctx.kv("Image:          ", &plan.image.display().to_string());
        self.ctx.kv("Entries:        ", &plan.entries.to_string());
        self.ctx.kv("Content size:   ", &format_size(plan.source_bytes));
        self.ctx.kv("Image capacity: ", &format_size(plan.capacity));
        self.ctx.kv("Space needed:   ", &format_size(plan.required_space));
        self.ctx.kv("Space available:", &format_size(plan.available_space));
        if !plan.fits() {
            self.ctx.warn("Not enough free space on the host volume.");
        }
    }

    /// Render the effective configuration.
    pub fn render_config(&self, path: &std::path::Path, entries: &[(&'static str, String)]) {
        self.ctx.header(&format!("Configuration ({})", path.display()));
        let width = entries.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (key, value) in entries {
            self.ctx.kv(&format!("{key:<width$}"), value);
        }
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag { "yes" } else { "no" }
}
