//! Feedback layer between the engine and the terminal.
//!
//! The engine never formats for a terminal directly: everything the user sees
//! goes through the [`View`] trait, so the rich, CI and test flavours stay
//! interchangeable.

mod ci;
mod default;
mod mock;

pub use ci::CiView;
pub use default::DefaultView;
pub use mock::MockView;

use anyhow::Result;

/// What the user decided at an interactive prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptChoice {
    Yes,
    No,
    All,
    Cancel,
}

/// Visual feedback about the file being executed.
///
/// Commands are addressed by an opaque id so parallel stages can declare all
/// their log slots before any command starts writing.
pub trait View {
    fn start_file(&mut self, file: &str);
    fn end_file(&mut self, file: &str, err: Option<&anyhow::Error>);
    fn start_stage(&mut self, stage_name: &str, chunk_count: usize, verbose: bool);
    /// Entering a section with multiple concurrent writers.
    fn declare_parallel_mode(&mut self);
    fn start_parallel_mode(&mut self) -> Result<()>;
    fn quit_parallel_mode(&mut self) -> Result<()>;
    fn start_command(&mut self, id: &str, text: &str) -> Result<()>;
    /// Asks what to do with a command; may flip `interactive` off for the
    /// rest of the run when the user answers `all`.
    fn prompt_for_command(&mut self, text: &str, interactive: &mut bool) -> Result<PromptChoice>;
    fn dry_run_command(&mut self, id: &str, text: &str) -> Result<()>;
    fn skip_command(&mut self, id: &str, text: &str) -> Result<()>;
    fn stop_command(&mut self, id: &str, success: bool, message: &str) -> Result<()>;
    fn kill_command(&mut self, id: &str, text: &str) -> Result<()>;
    fn info(&mut self, message: &str);
    fn warning(&mut self, message: &str);
    fn error(&mut self, message: &str);
    /// Whether a command was correctly declared and owns a log slot.
    fn has_logger(&self, id: &str) -> bool;
}

/// Returns the view flavour chosen by the user: "mock", "ci" or "default".
pub fn new_view(kind: &str, quiet: bool, no_styling: bool) -> Box<dyn View> {
    match kind {
        "mock" => Box::new(MockView::new()),
        "ci" => Box::new(CiView::new(quiet)),
        _ => Box::new(DefaultView::new(quiet, no_styling)),
    }
}

#[cfg(test)]
mod tests {
    use super::{new_view, PromptChoice};

    #[test]
    fn factory_honours_the_kind() {
        let mut mock = new_view("mock", false, false);
        mock.info("probe");
        assert!(!mock.has_logger("nope"));

        let mut ci = new_view("ci", true, true);
        let mut interactive = true;
        let choice = ci
            .prompt_for_command("cmd", &mut interactive)
            .expect("ci prompt");
        assert_eq!(choice, PromptChoice::Yes);
        assert!(!interactive, "ci view should turn interactive mode off");
    }
}
