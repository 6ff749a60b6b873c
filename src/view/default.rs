use std::collections::HashMap;
use std::io::{self, BufRead, Write};

use anyhow::{bail, Result};
use crossterm::style::Stylize;

use super::{PromptChoice, View};

/// Interactive terminal view: one styled status line per command, a prompt
/// line when interactive mode is on.
pub struct DefaultView {
    quiet: bool,
    styled: bool,
    is_parallel: bool,
    loggers: HashMap<String, String>,
}

impl DefaultView {
    pub fn new(quiet: bool, no_styling: bool) -> DefaultView {
        DefaultView {
            quiet,
            styled: !no_styling,
            is_parallel: false,
            loggers: HashMap::new(),
        }
    }

    fn say(&self, line: String) {
        if !self.quiet {
            println!("{line}");
        }
    }

    fn ok_mark(&self) -> String {
        if self.styled {
            format!("{}", "✔".green())
        } else {
            "ok:".to_string()
        }
    }

    fn fail_mark(&self) -> String {
        if self.styled {
            format!("{}", "✖".red())
        } else {
            "failed:".to_string()
        }
    }

    fn tag(&self, text: &str) -> String {
        if self.styled {
            format!("{}", text.black().on_blue())
        } else {
            text.to_string()
        }
    }

    fn logger_text(&mut self, id: &str) -> Result<String> {
        match self.loggers.remove(id) {
            Some(text) => Ok(text),
            None => bail!("no logger declared for command {id}"),
        }
    }
}

impl View for DefaultView {
    fn start_file(&mut self, file: &str) {
        if self.styled {
            self.say(format!("{}", format!("Running {file}").bold().underlined()));
        } else {
            self.say(format!("Running {file}"));
        }
    }

    fn end_file(&mut self, _file: &str, _err: Option<&anyhow::Error>) {}

    fn start_stage(&mut self, stage_name: &str, chunk_count: usize, verbose: bool) {
        if verbose {
            self.say(format!("stage {stage_name} with {chunk_count} chunks"));
        }
    }

    fn declare_parallel_mode(&mut self) {
        self.is_parallel = true;
    }

    fn start_parallel_mode(&mut self) -> Result<()> {
        Ok(())
    }

    fn quit_parallel_mode(&mut self) -> Result<()> {
        self.is_parallel = false;
        Ok(())
    }

    fn start_command(&mut self, id: &str, text: &str) -> Result<()> {
        self.loggers.insert(id.to_string(), text.to_string());
        let marker = if self.is_parallel { "∥" } else { "…" };
        if self.styled {
            self.say(format!("{} {text}", marker.dim()));
        } else {
            self.say(format!("running: {text}"));
        }
        Ok(())
    }

    fn prompt_for_command(&mut self, text: &str, interactive: &mut bool) -> Result<PromptChoice> {
        let stdin = io::stdin();
        loop {
            print!("{text} [y]es [n]o [a]ll [c]ancel: ");
            io::stdout().flush().ok();
            let mut answer = String::new();
            if stdin.lock().read_line(&mut answer)? == 0 {
                return Ok(PromptChoice::Cancel);
            }
            match answer.trim().to_lowercase().as_str() {
                "" | "y" | "yes" => return Ok(PromptChoice::Yes),
                "n" | "no" => return Ok(PromptChoice::No),
                "a" | "all" => {
                    *interactive = false;
                    return Ok(PromptChoice::All);
                }
                "c" | "cancel" => return Ok(PromptChoice::Cancel),
                _ => continue,
            }
        }
    }

    fn dry_run_command(&mut self, id: &str, text: &str) -> Result<()> {
        self.logger_text(id)?;
        let tag = self.tag(" DRY-RUN ");
        self.say(format!("{tag} {text}"));
        Ok(())
    }

    fn skip_command(&mut self, id: &str, text: &str) -> Result<()> {
        self.logger_text(id)?;
        let tag = self.tag(" SKIPPED ");
        self.say(format!("{tag} {text}"));
        Ok(())
    }

    fn stop_command(&mut self, id: &str, success: bool, message: &str) -> Result<()> {
        let text = self.logger_text(id)?;
        let line = if message.is_empty() { text } else { message.to_string() };
        if success {
            let mark = self.ok_mark();
            self.say(format!("{mark} {line}"));
        } else {
            let mark = self.fail_mark();
            self.say(format!("{mark} {line}"));
        }
        Ok(())
    }

    fn kill_command(&mut self, id: &str, text: &str) -> Result<()> {
        self.logger_text(id)?;
        let mark = self.fail_mark();
        self.say(format!("{mark} Killed {text}"));
        Ok(())
    }

    fn info(&mut self, message: &str) {
        self.say(message.to_string());
    }

    fn warning(&mut self, message: &str) {
        if self.styled {
            self.say(format!("{} {message}", "warning:".yellow()));
        } else {
            self.say(format!("warning: {message}"));
        }
    }

    fn error(&mut self, message: &str) {
        if self.quiet {
            return;
        }
        if self.styled {
            eprintln!("{} {message}", "error:".red());
        } else {
            eprintln!("error: {message}");
        }
    }

    fn has_logger(&self, id: &str) -> bool {
        self.loggers.contains_key(id)
    }
}
