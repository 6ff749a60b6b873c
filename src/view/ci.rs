use anyhow::Result;

use super::{PromptChoice, View};

/// View for CI environments: no styling, one ✅/❌ line per file, and only
/// the output of a crashing command. Interactive mode is ignored entirely.
pub struct CiView {
    quiet: bool,
    has_printed_result: bool,
}

impl CiView {
    pub fn new(quiet: bool) -> CiView {
        CiView {
            quiet,
            has_printed_result: false,
        }
    }

    fn say(&self, line: String) {
        if !self.quiet {
            println!("{line}");
        }
    }
}

impl View for CiView {
    fn start_file(&mut self, file: &str) {
        self.has_printed_result = false;
        self.say(format!("{file}:"));
    }

    fn end_file(&mut self, _file: &str, err: Option<&anyhow::Error>) {
        if self.has_printed_result {
            return;
        }
        if err.is_some() {
            self.say("❌".to_string());
        } else {
            self.say("✅".to_string());
        }
    }

    fn start_stage(&mut self, stage_name: &str, chunk_count: usize, verbose: bool) {
        if verbose {
            self.say(format!("Stage {stage_name} with {chunk_count} chunks"));
        }
    }

    fn declare_parallel_mode(&mut self) {}

    fn start_parallel_mode(&mut self) -> Result<()> {
        Ok(())
    }

    fn quit_parallel_mode(&mut self) -> Result<()> {
        Ok(())
    }

    fn start_command(&mut self, _id: &str, _text: &str) -> Result<()> {
        Ok(())
    }

    fn prompt_for_command(&mut self, _text: &str, interactive: &mut bool) -> Result<PromptChoice> {
        *interactive = false;
        Ok(PromptChoice::Yes)
    }

    fn dry_run_command(&mut self, _id: &str, _text: &str) -> Result<()> {
        Ok(())
    }

    fn skip_command(&mut self, _id: &str, _text: &str) -> Result<()> {
        Ok(())
    }

    fn stop_command(&mut self, id: &str, success: bool, message: &str) -> Result<()> {
        if !success {
            if !self.has_printed_result {
                self.say("❌".to_string());
                self.has_printed_result = true;
            }
            self.say(format!("{id} {message}"));
        }
        Ok(())
    }

    fn kill_command(&mut self, _id: &str, _text: &str) -> Result<()> {
        Ok(())
    }

    fn info(&mut self, _message: &str) {}

    fn warning(&mut self, _message: &str) {}

    fn error(&mut self, message: &str) {
        if !self.has_printed_result {
            self.say("❌".to_string());
            self.has_printed_result = true;
        }
        if !self.quiet {
            eprintln!("{message}");
        }
    }

    fn has_logger(&self, _id: &str) -> bool {
        true
    }
}
