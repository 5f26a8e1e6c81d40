//! Table output for plans, outcomes and resolved configuration using comfy-table.

use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};
use std::env;

use crate::domain::models::converge::ConvergeOutcome;
use crate::domain::models::patch::PatchRecord;
use crate::domain::models::program::Program;
use crate::domain::models::trait_spec::Scheduling;

use super::truncate;

/// Table formatter for CLI output
pub struct TableFormatter {
    use_colors: bool,
    max_width: Option<u16>,
}

impl TableFormatter {
    pub fn new() -> Self {
        Self {
            use_colors: supports_color(),
            max_width: None,
        }
    }

    pub const fn with_config(use_colors: bool, max_width: Option<u16>) -> Self {
        Self {
            use_colors,
            max_width,
        }
    }

    /// Steps in plan order.
    pub fn format_plan(&self, program: &Program) -> String {
        let mut table = self.create_base_table();
        table.set_header(header(&["Step", "Field", "Kind", "Lane", "Deps"]));

        for step in &program.plan.steps {
            let entry = program.entry(step);
            let deps = entry
                .deps
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ");
            let lane = Cell::new(step.scheduling.as_str());
            let lane = if self.use_colors && step.scheduling == Scheduling::Deferred {
                lane.fg(Color::Yellow)
            } else {
                lane
            };

            table.add_row(vec![
                Cell::new(step.step_id.0),
                Cell::new(entry.field_path.to_string()),
                Cell::new(step.kind.as_str()),
                lane,
                Cell::new(truncate(&deps, 48)),
            ]);
        }

        table.to_string()
    }

    /// Patches in write order.
    pub fn format_patches(&self, patches: &[PatchRecord]) -> String {
        let mut table = self.create_base_table();
        table.set_header(header(&["Path", "Reason", "From", "To"]));

        for patch in patches {
            table.add_row(vec![
                Cell::new(&patch.path),
                Cell::new(patch.reason.as_str()),
                Cell::new(truncate(&patch.from.to_string(), 32)),
                Cell::new(truncate(&patch.to.to_string(), 32)),
            ]);
        }

        table.to_string()
    }

    /// Headline figures of a pass.
    pub fn format_outcome(&self, outcome: &ConvergeOutcome) -> String {
        let summary = outcome.summary();
        let mut table = self.create_base_table();
        table.set_header(header(&["Field", "Value"]));

        let label = Cell::new(outcome.label());
        let label = match (self.use_colors, outcome) {
            (true, ConvergeOutcome::Degraded { .. }) => label.fg(Color::Red),
            (true, ConvergeOutcome::Converged { .. }) => label.fg(Color::Green),
            _ => label,
        };
        table.add_row(vec![Cell::new("outcome"), label]);

        let reasons = summary
            .reasons
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let rows = [
            ("requested_mode", summary.requested_mode.as_str().to_string()),
            ("executed_mode", summary.executed_mode.as_str().to_string()),
            ("config_scope", summary.config_scope.as_str().to_string()),
            ("reasons", reasons),
            (
                "steps",
                format!(
                    "{}/{} executed, {} changed",
                    summary.step_stats.executed, summary.step_stats.total, summary.step_stats.changed
                ),
            ),
            ("duration_ms", format!("{:.3}", summary.execution_duration_ms)),
        ];
        for (field, value) in rows {
            table.add_row(vec![Cell::new(field), Cell::new(value)]);
        }
        if let ConvergeOutcome::Degraded { error: Some(error), .. } = outcome {
            table.add_row(vec![Cell::new("error"), Cell::new(truncate(error, 60))]);
        }

        table.to_string()
    }

    /// Two-column key/value listing.
    pub fn format_pairs(&self, pairs: &[(String, String)]) -> String {
        let mut table = self.create_base_table();
        table.set_header(header(&["Key", "Value"]));
        for (key, value) in pairs {
            table.add_row(vec![Cell::new(key), Cell::new(value)]);
        }
        table.to_string()
    }

    fn create_base_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic);

        if let Some(width) = self.max_width {
            table.set_width(width);
        }

        table
    }
}

impl Default for TableFormatter {
    fn default() -> Self {
        Self::new()
    }
}

fn header(names: &[&str]) -> Vec<Cell> {
    names
        .iter()
        .map(|name| Cell::new(name).add_attribute(Attribute::Bold))
        .collect()
}

fn supports_color() -> bool {
    // Respect NO_COLOR environment variable
    if env::var("NO_COLOR").is_ok() {
        return false;
    }

    !matches!(env::var("TERM").as_deref(), Ok("dumb"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::field_path::StateSchema;
    use crate::domain::models::trait_spec::{TraitEntry, TraitSpec};
    use crate::services::program_builder::build;
    use serde_json::json;

    #[test]
    fn test_format_plan_lists_every_step() {
        let spec = TraitSpec::new()
            .with(TraitEntry::computed("total", ["a", "b"], |_| Ok(json!(0))))
            .with(TraitEntry::link("mirror", "total").deferred());
        let program = build(&StateSchema::new(), &spec).unwrap();

        let rendered = TableFormatter::with_config(false, Some(120)).format_plan(&program);
        assert!(rendered.contains("total"));
        assert!(rendered.contains("mirror"));
        assert!(rendered.contains("deferred"));
        assert!(rendered.contains("a, b"));
    }

    #[test]
    fn test_supports_color_respects_no_color() {
        temp_env::with_var("NO_COLOR", Some("1"), || {
            assert!(!supports_color());
        });
    }
}
