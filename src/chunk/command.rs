//! One OS command: spawn, capture, timeout, kill, and for bash scripts the
//! environment harvest that feeds later chunks.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use uuid::Uuid;

use crate::config::Config;
use crate::context::RunContext;
use crate::view::PromptChoice;

/// Separator a bash script prints between user output and its `printenv`
/// dump. Everything after it is treated as environment lines.
pub const ENV_SEPARATOR: &str = "### ENV ###";

const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A command parsed from a chunk, ready to be executed. Owns its capture
/// buffers and the child process handle while it runs.
#[derive(Debug)]
pub struct RunningCommand {
    pub id: String,
    pub argv: Vec<String>,
    pub dir: PathBuf,
    pub pretty_name: String,
    /// Bash commands get their stdout split on the env separator after exit.
    pub is_bash: bool,
    /// Set when the user answered "no" at the interactive prompt: the
    /// command is never spawned and does not count as a failure.
    pub skipped: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    timeout: Duration,
    deadline: Option<Instant>,
    child: Option<Child>,
    stdout_buf: Arc<Mutex<Vec<u8>>>,
    stderr_buf: Arc<Mutex<Vec<u8>>>,
    io_threads: Vec<JoinHandle<()>>,
}

impl RunningCommand {
    pub fn new(argv: Vec<String>, dir: PathBuf, timeout: Duration, is_bash: bool) -> RunningCommand {
        let pretty_name = argv.join(" ");
        RunningCommand {
            id: Uuid::new_v4().to_string(),
            argv,
            dir,
            pretty_name,
            is_bash,
            skipped: false,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: None,
            timeout,
            deadline: None,
            child: None,
            stdout_buf: Arc::new(Mutex::new(Vec::new())),
            stderr_buf: Arc::new(Mutex::new(Vec::new())),
            io_threads: Vec::new(),
        }
    }

    /// Sets the name used in logs: the chunk label when present, otherwise
    /// the command line, with the working directory and an env summary
    /// appended in verbose mode.
    pub fn init_label(
        &mut self,
        base: &str,
        chunk_label: &str,
        verbose: bool,
        env: &HashMap<String, String>,
    ) {
        self.pretty_name = if chunk_label.is_empty() {
            base.to_string()
        } else {
            chunk_label.to_string()
        };
        if verbose {
            self.pretty_name = format!("{} in {}", self.pretty_name, self.dir.display());
            if !env.is_empty() {
                self.pretty_name = format!("{} with env {env:?}", self.pretty_name);
            }
        }
    }

    /// Runs the interactive prompt when enabled, then reserves the log slot.
    pub fn declare(&mut self, ctx: &mut RunContext) -> Result<()> {
        let RunContext { cfg, view } = ctx;
        if cfg.interactive {
            match view.prompt_for_command(&self.pretty_name, &mut cfg.interactive)? {
                PromptChoice::No => self.skipped = true,
                PromptChoice::Cancel => bail!("user aborted"),
                PromptChoice::Yes | PromptChoice::All => {}
            }
        }
        view.start_command(&self.id, &self.pretty_name)?;
        Ok(())
    }

    /// Spawns the child without waiting for it. A no-op in dry-run mode or
    /// when the command was skipped at the prompt.
    pub fn start(&mut self, ctx: &mut RunContext) -> Result<()> {
        if ctx.cfg.dry_run || self.skipped {
            return Ok(());
        }
        let mut command = Command::new(&self.argv[0]);
        command
            .args(&self.argv[1..])
            .current_dir(&self.dir)
            .env_clear()
            .envs(&ctx.cfg.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                ctx.view
                    .stop_command(&self.id, false, &format!("{}: {err}", self.pretty_name))?;
                return Err(err)
                    .with_context(|| format!("start command '{}'", self.pretty_name));
            }
        };
        if let Some(stdout) = child.stdout.take() {
            self.io_threads
                .push(drain_into(stdout, Arc::clone(&self.stdout_buf)));
        }
        if let Some(stderr) = child.stderr.take() {
            self.io_threads
                .push(drain_into(stderr, Arc::clone(&self.stderr_buf)));
        }
        self.deadline = Some(Instant::now() + self.timeout);
        self.child = Some(child);
        Ok(())
    }

    /// Blocks until the child exits or its deadline expires. Captures the
    /// output, records the exit code, and fails on non-zero exit with the
    /// full stdout/stderr in the message.
    pub fn wait(&mut self, ctx: &mut RunContext) -> Result<()> {
        if ctx.cfg.dry_run {
            ctx.view.dry_run_command(&self.id, &self.pretty_name)?;
            return Ok(());
        }
        if self.skipped {
            ctx.view.skip_command(&self.id, &self.pretty_name)?;
            return Ok(());
        }
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };
        let status = loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("wait for command '{}'", self.pretty_name))?
            {
                break status;
            }
            if self
                .deadline
                .map_or(false, |deadline| Instant::now() >= deadline)
            {
                let _ = child.kill();
                let _ = child.wait();
                self.collect_output();
                let message = format!(
                    "{} timed out after {}s",
                    self.pretty_name,
                    self.timeout.as_secs()
                );
                ctx.view.stop_command(&self.id, false, &message)?;
                bail!(
                    "command '{}' timed out after {}s",
                    self.pretty_name,
                    self.timeout.as_secs()
                );
            }
            thread::sleep(WAIT_POLL_INTERVAL);
        };
        self.collect_output();
        let code = status.code().unwrap_or(-1);
        self.exit_code = Some(code);
        if !status.success() {
            let message = format!(
                "stdout:\n{}\nstderr:\n{}\nexit code: {code}",
                self.stdout, self.stderr
            );
            ctx.view.stop_command(&self.id, false, &message)?;
            bail!("command '{}' failed with exit code {code}", self.pretty_name);
        }
        ctx.view.stop_command(&self.id, true, "")?;
        if self.is_bash {
            self.harvest_env(&mut ctx.cfg);
        }
        if ctx.cfg.verbose {
            if !self.stdout.is_empty() {
                ctx.view.info(&self.stdout);
            }
            if !self.stderr.is_empty() {
                ctx.view.warning(&self.stderr);
            }
        }
        Ok(())
    }

    /// Forcibly terminates the child. Used by the scheduler to tear down
    /// lagging parallel commands once the stage has failed.
    pub fn kill(&mut self, ctx: &mut RunContext) -> Result<()> {
        ctx.view.kill_command(&self.id, &self.pretty_name)?;
        if let Some(mut child) = self.child.take() {
            child
                .kill()
                .with_context(|| format!("kill command '{}'", self.pretty_name))?;
            let _ = child.wait();
            self.collect_output();
        }
        Ok(())
    }

    fn collect_output(&mut self) {
        for handle in self.io_threads.drain(..) {
            let _ = handle.join();
        }
        if let Ok(buf) = self.stdout_buf.lock() {
            self.stdout = String::from_utf8_lossy(&buf).to_string();
        }
        if let Ok(buf) = self.stderr_buf.lock() {
            self.stderr = String::from_utf8_lossy(&buf).to_string();
        }
    }

    /// A bash chunk may export new variables. Rebuilds the run environment
    /// from the host environment plus every KEY=VALUE line of the script's
    /// `printenv` dump; the lines before the separator stay user stdout.
    fn harvest_env(&mut self, cfg: &mut Config) {
        let mut env: HashMap<String, String> = std::env::vars().collect();
        let mut kept: Vec<&str> = Vec::new();
        let mut extracting = false;
        for line in self.stdout.split('\n') {
            if line == ENV_SEPARATOR {
                extracting = true;
            }
            if extracting {
                if let Some((key, value)) = line.split_once('=') {
                    env.insert(key.to_string(), value.to_string());
                }
            } else {
                kept.push(line);
            }
        }
        let user_stdout = if kept.is_empty() {
            String::new()
        } else {
            format!("{}\n", kept.join("\n"))
        };
        cfg.env = env;
        self.stdout = user_stdout;
    }
}

fn drain_into(mut source: impl Read + Send + 'static, buf: Arc<Mutex<Vec<u8>>>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut collected = Vec::new();
        let _ = source.read_to_end(&mut collected);
        if let Ok(mut guard) = buf.lock() {
            guard.extend_from_slice(&collected);
        }
    })
}
