//! The owo-colors stylesheet. Every style is plain until `colorize` runs.

use owo_colors::Style;

#[derive(Default, Clone)]
pub struct Styles {
    pub success: Style,
    pub warning: Style,
    /// Errors and `failed` states.
    pub error: Style,
    pub info: Style,
    /// Keys, sizes and other secondary text.
    pub dim: Style,
    pub header: Style,
    /// `packed` and `unpacked`.
    pub settled: Style,
    /// A pack, unpack or compression pass is running or was interrupted.
    pub in_flight: Style,
}

impl Styles {
    pub fn colorize(&mut self) {
        *self = Self {
            success: Style::new().green(),
            warning: Style::new().yellow(),
            error: Style::new().red().bold(),
            info: Style::new().blue(),
            dim: Style::new().dimmed(),
            header: Style::new().bold().cyan(),
            settled: Style::new().green(),
            in_flight: Style::new().yellow().bold(),
        };
    }
}
