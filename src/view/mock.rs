use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use anyhow::Result;

use super::{PromptChoice, View};

/// Recording view for tests. Clones share the same call log, so a test can
/// keep a handle while the engine owns the boxed view.
#[derive(Clone, Default)]
pub struct MockView {
    calls: Rc<RefCell<Vec<(String, Vec<String>)>>>,
    loggers: Rc<RefCell<HashMap<String, String>>>,
    prompt_plan: Rc<RefCell<VecDeque<PromptChoice>>>,
}

impl MockView {
    pub fn new() -> MockView {
        MockView::default()
    }

    fn log_call(&self, name: &str, args: &[&str]) {
        self.calls.borrow_mut().push((
            name.to_string(),
            args.iter().map(|arg| arg.to_string()).collect(),
        ));
    }

    /// Every recorded call, in order.
    pub fn recorded_calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.borrow().clone()
    }

    /// Names of the recorded calls, in order.
    pub fn call_names(&self) -> Vec<String> {
        self.calls.borrow().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn count_calls(&self, name: &str) -> usize {
        self.calls
            .borrow()
            .iter()
            .filter(|(call, _)| call == name)
            .count()
    }

    /// Queues an answer for the next interactive prompt; defaults to yes.
    pub fn push_prompt_plan(&self, choice: PromptChoice) {
        self.prompt_plan.borrow_mut().push_back(choice);
    }
}

impl View for MockView {
    fn start_file(&mut self, file: &str) {
        self.log_call("StartFile", &[file]);
    }

    fn end_file(&mut self, file: &str, err: Option<&anyhow::Error>) {
        let failed = if err.is_some() { "err" } else { "ok" };
        self.log_call("EndFile", &[file, failed]);
    }

    fn start_stage(&mut self, stage_name: &str, chunk_count: usize, _verbose: bool) {
        self.log_call("StartStage", &[stage_name, &chunk_count.to_string()]);
    }

    fn declare_parallel_mode(&mut self) {
        self.log_call("DeclareParallel", &[]);
    }

    fn start_parallel_mode(&mut self) -> Result<()> {
        self.log_call("StartParallel", &[]);
        Ok(())
    }

    fn quit_parallel_mode(&mut self) -> Result<()> {
        self.log_call("QuitParallel", &[]);
        Ok(())
    }

    fn start_command(&mut self, id: &str, text: &str) -> Result<()> {
        self.log_call("StartCommand", &[id, text]);
        self.loggers
            .borrow_mut()
            .insert(id.to_string(), text.to_string());
        Ok(())
    }

    fn prompt_for_command(&mut self, text: &str, interactive: &mut bool) -> Result<PromptChoice> {
        self.log_call("InteractivePrompt", &[text]);
        let choice = self
            .prompt_plan
            .borrow_mut()
            .pop_front()
            .unwrap_or(PromptChoice::Yes);
        if choice == PromptChoice::All {
            *interactive = false;
        }
        Ok(choice)
    }

    fn dry_run_command(&mut self, id: &str, text: &str) -> Result<()> {
        self.log_call("DryRun", &[id, text]);
        self.loggers.borrow_mut().remove(id);
        Ok(())
    }

    fn skip_command(&mut self, id: &str, text: &str) -> Result<()> {
        self.log_call("Skipped", &[id, text]);
        self.loggers.borrow_mut().remove(id);
        Ok(())
    }

    fn stop_command(&mut self, id: &str, success: bool, message: &str) -> Result<()> {
        let success_text = success.to_string();
        self.log_call("StopCommand", &[id, &success_text, message]);
        self.loggers.borrow_mut().remove(id);
        Ok(())
    }

    fn kill_command(&mut self, id: &str, text: &str) -> Result<()> {
        self.log_call("Killed", &[id, text]);
        self.loggers.borrow_mut().remove(id);
        Ok(())
    }

    fn info(&mut self, message: &str) {
        self.log_call("Info", &[message]);
    }

    fn warning(&mut self, message: &str) {
        self.log_call("Warning", &[message]);
    }

    fn error(&mut self, message: &str) {
        self.log_call("Error", &[message]);
    }

    fn has_logger(&self, id: &str) -> bool {
        self.loggers.borrow().contains_key(id)
    }
}
