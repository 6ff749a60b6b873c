//! The in-memory form of one runnable code block and its preparation for
//! execution.

pub mod command;

pub use command::RunningCommand;

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs;
use std::io::{BufWriter, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tempfile::TempDir;
use uuid::Uuid;

use crate::config::Config;
use crate::context::RunContext;

/// Shared cache of temporary directories, keyed by their `$tmpdir` selector.
/// Dropping an entry removes the directory from disk.
pub type TmpDirs = HashMap<String, TempDir>;

/// Execution strategy of a chunk. Absent in the metadata means classical:
/// every content line is one command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Bash,
    Writer,
}

/// A runnable code block parsed from a markdown fence, together with its
/// execution state. The serde shape is the metadata schema: unknown keys are
/// rejected and only `stage` is required.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Chunk {
    /// Stage this chunk belongs to; stages run in document order.
    pub stage: String,
    /// Identifier other chunks can reference through `requires`.
    #[serde(default)]
    pub id: String,
    /// Dependency as `stage/id`: this chunk runs only when the referenced
    /// chunk finished with exit code zero.
    #[serde(default)]
    pub requires: String,
    /// Working-directory selector: `$initial_dir`, `$tmpdir.<name>`, a
    /// verbatim path, or empty for an isolated fresh directory.
    #[serde(default)]
    pub rootdir: String,
    #[serde(default)]
    pub runtime: Option<Runtime>,
    #[serde(default, rename = "parallel")]
    pub is_parallel: bool,
    /// Human label used by the UI instead of the command line.
    #[serde(default)]
    pub label: String,
    /// Switches the rest of the run to interactive mode.
    #[serde(default, rename = "breakpoint")]
    pub has_breakpoint: bool,
    /// Target file for the writer runtime.
    #[serde(default)]
    pub destination: String,
    #[serde(skip)]
    pub content: Vec<String>,
    #[serde(skip)]
    pub commands: Vec<RunningCommand>,
    /// Backtick count of the opening fence, reused for the output block.
    #[serde(skip)]
    pub back_quotes: usize,
    #[serde(skip)]
    pub is_skipped: bool,
}

impl Chunk {
    pub fn init(&mut self, ctx: &mut RunContext) {
        if self.has_breakpoint {
            ctx.view.warning("breakpoint in the document");
        }
        self.is_skipped = false;
    }

    pub fn is_bash(&self) -> bool {
        matches!(self.runtime, Some(Runtime::Bash))
    }

    pub fn is_writer(&self) -> bool {
        matches!(self.runtime, Some(Runtime::Writer))
    }

    /// Whether any command captured something worth writing back into the
    /// document. Always true in dry-run mode.
    pub fn has_output(&self, cfg: &Config) -> bool {
        if cfg.dry_run {
            return true;
        }
        self.commands
            .iter()
            .any(|command| !command.stdout.is_empty() || !command.stderr.is_empty())
    }

    /// Appends the captured output of all commands as a fresh output block,
    /// fenced with `back_quotes` backticks.
    pub fn write_output_to(&self, back_quotes: usize, out: &mut String) {
        for _ in 0..back_quotes {
            out.push('`');
        }
        out.push_str("shell markdown_runner\n");
        for command in &self.commands {
            if !command.stdout.is_empty() {
                out.push_str(&command.stdout);
                if !command.stdout.ends_with('\n') {
                    out.push('\n');
                }
            }
            if !command.stderr.is_empty() {
                out.push_str(&command.stderr);
                if !command.stderr.ends_with('\n') {
                    out.push('\n');
                }
            }
        }
        for _ in 0..back_quotes {
            out.push('`');
        }
        out.push('\n');
    }

    /// Resolves the directory this chunk executes in, creating and caching
    /// temporary directories as needed. An empty `rootdir` gets a fresh
    /// selector first so every command of the chunk shares one directory.
    pub fn get_or_create_runtime_directory(
        &mut self,
        cfg: &Config,
        tmp_dirs: &mut TmpDirs,
    ) -> Result<PathBuf> {
        if self.rootdir.is_empty() {
            self.rootdir = format!("$tmpdir.{}", Uuid::new_v4());
        }
        if self.rootdir == "$initial_dir" {
            return Ok(cfg.initial_dir.clone());
        }
        if self.rootdir.starts_with("$tmpdir") {
            let selector = self
                .rootdir
                .split('/')
                .next()
                .unwrap_or(self.rootdir.as_str())
                .to_string();
            let dir = match tmp_dirs.entry(selector.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(
                    tempfile::tempdir().context("create temporary directory")?,
                ),
            };
            let base = dir.path().display().to_string();
            return Ok(PathBuf::from(self.rootdir.replacen(&selector, &base, 1)));
        }
        if !self.rootdir.starts_with('$') {
            return Ok(PathBuf::from(&self.rootdir));
        }
        bail!("cannot figure out the directory to run in: {}", self.rootdir)
    }

    /// Writes the chunk content to its writer destination. The destination's
    /// parent directories must already exist.
    pub fn write_file(&self, basedir: &Path) -> Result<()> {
        let destination = basedir.join(&self.destination);
        let file = fs::File::create(&destination)
            .with_context(|| format!("create {}", destination.display()))?;
        let mut writer = BufWriter::new(file);
        for line in &self.content {
            writeln!(writer, "{line}")?;
        }
        writer
            .flush()
            .with_context(|| format!("write {}", destination.display()))?;
        Ok(())
    }

    /// Writes the chunk content as an executable shell script with the
    /// standard boilerplate and the trailing `printenv` used to bubble the
    /// environment up to the next chunks.
    pub fn write_bash_script(&self, basedir: &Path, script_name: &str) -> Result<()> {
        let script_path = basedir.join(script_name);
        let file = fs::File::create(&script_path)
            .with_context(|| format!("create {}", script_path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "#!/bin/bash")?;
        // fail fast
        writeln!(writer, "set -euo pipefail")?;
        for line in &self.content {
            writeln!(writer, "{line}")?;
        }
        writeln!(writer, "echo \"{}\"", command::ENV_SEPARATOR)?;
        writeln!(writer, "printenv")?;
        writer
            .flush()
            .with_context(|| format!("write {}", script_path.display()))?;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o770))
            .with_context(|| format!("chmod {}", script_path.display()))?;
        Ok(())
    }

    /// Splits a command string POSIX-style and registers it for execution.
    pub fn add_command(
        &mut self,
        cfg: &Config,
        trimmed_command: &str,
        tmp_dirs: &mut TmpDirs,
    ) -> Result<()> {
        if trimmed_command.is_empty() {
            bail!("empty command string provided");
        }
        let argv = shell_words::split(trimmed_command)
            .with_context(|| format!("parse command: {trimmed_command}"))?;
        if argv.is_empty() {
            bail!("empty command string provided");
        }
        let dir = self.get_or_create_runtime_directory(cfg, tmp_dirs)?;
        let mut command = RunningCommand::new(argv, dir, cfg.timeout, self.is_bash());
        command.init_label(trimmed_command, &self.label, cfg.verbose, &cfg.env);
        self.commands.push(command);
        Ok(())
    }

    /// Sets the chunk up for execution according to its runtime. Writer
    /// chunks do their work here; the other runtimes register commands.
    pub fn prepare_for_execution(
        &mut self,
        ctx: &mut RunContext,
        tmp_dirs: &mut TmpDirs,
    ) -> Result<()> {
        match self.runtime {
            Some(Runtime::Writer) => self.apply_writer(ctx, tmp_dirs),
            Some(Runtime::Bash) => self.prepare_bash(ctx, tmp_dirs),
            None => self.prepare_classical(ctx, tmp_dirs),
        }
    }

    fn prepare_classical(&mut self, ctx: &mut RunContext, tmp_dirs: &mut TmpDirs) -> Result<()> {
        // A parallel chunk maps to a single log slot, so several commands in
        // one classical parallel chunk would be ambiguous to schedule.
        if self.is_parallel && self.content.len() > 1 {
            bail!("multiple commands are not supported in a parallel chunk, use the bash runtime instead");
        }
        for line in self.content.clone() {
            self.add_command(&ctx.cfg, &line, tmp_dirs)?;
        }
        Ok(())
    }

    fn prepare_bash(&mut self, ctx: &mut RunContext, tmp_dirs: &mut TmpDirs) -> Result<()> {
        let script_name = format!("{}.sh", Uuid::new_v4());
        self.add_command(&ctx.cfg, &format!("./{script_name}"), tmp_dirs)?;
        let dir = match self.commands.last() {
            Some(command) => command.dir.clone(),
            None => bail!("bash chunk registered no command"),
        };
        self.write_bash_script(&dir, &script_name)
    }

    fn apply_writer(&mut self, ctx: &mut RunContext, tmp_dirs: &mut TmpDirs) -> Result<()> {
        let mut text = format!("writing {} on disk", self.destination);
        if !self.label.is_empty() {
            text = format!("{text} for {}", self.label);
        }
        let id = Uuid::new_v4().to_string();
        ctx.view.start_command(&id, &text)?;
        let directory = match self.get_or_create_runtime_directory(&ctx.cfg, tmp_dirs) {
            Ok(directory) => directory,
            Err(err) => {
                ctx.view.stop_command(&id, false, &err.to_string())?;
                return Err(err);
            }
        };
        if let Err(err) = self.write_file(&directory) {
            ctx.view.stop_command(&id, false, &err.to_string())?;
            return Err(err);
        }
        ctx.view.stop_command(&id, true, "")?;
        Ok(())
    }

    /// Runs every command of a sequential chunk in order, stopping at the
    /// first failure.
    pub fn execute_sequential(&mut self, ctx: &mut RunContext) -> Result<()> {
        if self.is_parallel {
            bail!("cannot execute a parallel chunk sequentially, start it instead");
        }
        for index in 0..self.commands.len() {
            self.commands[index].declare(ctx)?;
            self.commands[index].start(ctx)?;
            self.commands[index].wait(ctx)?;
        }
        Ok(())
    }

    /// Reserves the log slot (and runs the prompt) for a parallel chunk
    /// before anything starts writing output.
    pub fn declare_parallel_loggers(&mut self, ctx: &mut RunContext) -> Result<()> {
        if !self.is_parallel {
            bail!("cannot declare parallel loggers on a sequential chunk");
        }
        match self.commands.first_mut() {
            Some(command) => command.declare(ctx),
            None => Ok(()),
        }
    }

    /// Fire-and-forget start of a parallel chunk's command.
    pub fn start_parallel(&mut self, ctx: &mut RunContext) -> Result<()> {
        if !self.is_parallel {
            bail!("cannot start a sequential chunk, execute it instead");
        }
        match self.commands.first_mut() {
            Some(command) => command.start(ctx),
            None => Ok(()),
        }
    }

    /// Joins a parallel chunk: waits for its command, or kills it when the
    /// stage already failed.
    pub fn wait_parallel(&mut self, ctx: &mut RunContext, should_kill: bool) -> Result<()> {
        if !self.is_parallel {
            bail!("cannot wait for a sequential chunk, execute it instead");
        }
        match self.commands.first_mut() {
            Some(command) if should_kill => command.kill(ctx),
            Some(command) => command.wait(ctx),
            None => Ok(()),
        }
    }

    /// Whether every command ran to completion with exit code zero.
    pub fn has_executed_correctly(&self) -> bool {
        !self.commands.is_empty()
            && self
                .commands
                .iter()
                .all(|command| command.exit_code == Some(0))
    }

    /// Marks the chunk skipped and tells the user why.
    pub fn skip(&mut self, ctx: &mut RunContext) {
        self.is_skipped = true;
        match self.runtime {
            Some(Runtime::Writer) => ctx.view.info(&format!(
                "Skip writer chunk '{}' due to previous errors",
                self.label
            )),
            Some(Runtime::Bash) => ctx.view.info(&format!(
                "Skip bash chunk '{}' due to previous errors",
                self.label
            )),
            None => {
                for line in &self.content {
                    ctx.view
                        .info(&format!("Skip command '{line}' due to previous errors"));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Chunk, Runtime, TmpDirs};
    use crate::config::Config;
    use crate::context::RunContext;
    use crate::view::MockView;
    use std::time::Duration;

    fn test_context() -> (RunContext, MockView) {
        let mock = MockView::new();
        let mut cfg = Config::default();
        cfg.timeout = Duration::from_secs(60);
        let ctx = RunContext {
            cfg,
            view: Box::new(mock.clone()),
        };
        (ctx, mock)
    }

    fn chunk(stage: &str) -> Chunk {
        Chunk {
            stage: stage.to_string(),
            ..Chunk::default()
        }
    }

    #[test]
    fn initial_dir_resolves_to_the_config_rootdir() {
        let (ctx, _mock) = test_context();
        let mut tmp_dirs = TmpDirs::new();
        let mut c = chunk("test");
        c.rootdir = "$initial_dir".to_string();
        let dir = c
            .get_or_create_runtime_directory(&ctx.cfg, &mut tmp_dirs)
            .expect("resolve");
        assert_eq!(dir, ctx.cfg.initial_dir);
    }

    #[test]
    fn tmpdir_selectors_share_and_isolate_directories() {
        let (ctx, _mock) = test_context();
        let mut tmp_dirs = TmpDirs::new();

        let mut first = chunk("test");
        first.rootdir = "$tmpdir.shared".to_string();
        let mut second = chunk("test");
        second.rootdir = "$tmpdir.shared".to_string();
        let mut third = chunk("test");
        third.rootdir = "$tmpdir.other".to_string();

        let a = first
            .get_or_create_runtime_directory(&ctx.cfg, &mut tmp_dirs)
            .expect("resolve");
        let b = second
            .get_or_create_runtime_directory(&ctx.cfg, &mut tmp_dirs)
            .expect("resolve");
        let c = third
            .get_or_create_runtime_directory(&ctx.cfg, &mut tmp_dirs)
            .expect("resolve");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(tmp_dirs.contains_key("$tmpdir.shared"));
        assert!(tmp_dirs.contains_key("$tmpdir.other"));
    }

    #[test]
    fn tmpdir_selector_keeps_trailing_path_segments() {
        let (ctx, _mock) = test_context();
        let mut tmp_dirs = TmpDirs::new();
        let mut c = chunk("test");
        c.rootdir = "$tmpdir.build/nested".to_string();
        let dir = c
            .get_or_create_runtime_directory(&ctx.cfg, &mut tmp_dirs)
            .expect("resolve");
        let base = tmp_dirs["$tmpdir.build"].path().to_path_buf();
        assert_eq!(dir, base.join("nested"));
    }

    #[test]
    fn custom_directories_are_used_verbatim() {
        let (ctx, _mock) = test_context();
        let mut tmp_dirs = TmpDirs::new();
        let mut c = chunk("test");
        c.rootdir = "/custom/dir".to_string();
        let dir = c
            .get_or_create_runtime_directory(&ctx.cfg, &mut tmp_dirs)
            .expect("resolve");
        assert_eq!(dir.display().to_string(), "/custom/dir");
    }

    #[test]
    fn empty_rootdir_gets_a_fresh_stable_selector() {
        let (ctx, _mock) = test_context();
        let mut tmp_dirs = TmpDirs::new();
        let mut c = chunk("test");
        let first = c
            .get_or_create_runtime_directory(&ctx.cfg, &mut tmp_dirs)
            .expect("resolve");
        let second = c
            .get_or_create_runtime_directory(&ctx.cfg, &mut tmp_dirs)
            .expect("resolve");
        assert_eq!(first, second, "a chunk resolves to one directory");
        assert!(c.rootdir.starts_with("$tmpdir."));
    }

    #[test]
    fn unknown_dollar_selectors_are_rejected() {
        let (ctx, _mock) = test_context();
        let mut tmp_dirs = TmpDirs::new();
        let mut c = chunk("test");
        c.rootdir = "$nonsense".to_string();
        assert!(c
            .get_or_create_runtime_directory(&ctx.cfg, &mut tmp_dirs)
            .is_err());
    }

    #[test]
    fn add_command_splits_quoted_arguments() {
        let (ctx, _mock) = test_context();
        let mut tmp_dirs = TmpDirs::new();
        let mut c = chunk("test");
        c.add_command(&ctx.cfg, "echo 'hello world'", &mut tmp_dirs)
            .expect("add");
        assert_eq!(c.commands[0].argv, vec!["echo", "hello world"]);
    }

    #[test]
    fn parallel_classical_chunks_reject_multiple_commands() {
        let (mut ctx, _mock) = test_context();
        let mut tmp_dirs = TmpDirs::new();
        let mut c = chunk("test");
        c.is_parallel = true;
        c.content = vec!["echo 1".to_string(), "echo 2".to_string()];
        assert!(c.prepare_for_execution(&mut ctx, &mut tmp_dirs).is_err());
    }

    #[test]
    fn parallel_bash_chunks_accept_multiple_lines() {
        let (mut ctx, _mock) = test_context();
        let mut tmp_dirs = TmpDirs::new();
        let mut c = chunk("test");
        c.is_parallel = true;
        c.runtime = Some(Runtime::Bash);
        c.content = vec!["echo 1".to_string(), "echo 2".to_string()];
        c.prepare_for_execution(&mut ctx, &mut tmp_dirs)
            .expect("prepare");
        assert_eq!(c.commands.len(), 1);
    }

    #[test]
    fn bash_execution_exports_variables_to_the_run_env() {
        let (mut ctx, _mock) = test_context();
        let mut tmp_dirs = TmpDirs::new();
        let mut c = chunk("test");
        c.runtime = Some(Runtime::Bash);
        c.content = vec![
            "export GREETING='hello from bash'".to_string(),
            "echo $GREETING".to_string(),
        ];
        c.prepare_for_execution(&mut ctx, &mut tmp_dirs)
            .expect("prepare");
        c.execute_sequential(&mut ctx).expect("execute");
        assert!(c.commands[0].stdout.contains("hello from bash"));
        assert_eq!(
            ctx.cfg.env.get("GREETING").map(String::as_str),
            Some("hello from bash")
        );
        assert!(c.has_executed_correctly());
    }

    #[test]
    fn writer_chunks_create_the_destination_file() {
        let (mut ctx, _mock) = test_context();
        let mut tmp_dirs = TmpDirs::new();
        let mut c = chunk("test");
        c.runtime = Some(Runtime::Writer);
        c.destination = "test.txt".to_string();
        c.content = vec!["hello".to_string(), "world".to_string()];
        c.prepare_for_execution(&mut ctx, &mut tmp_dirs)
            .expect("prepare");
        let dir = c
            .get_or_create_runtime_directory(&ctx.cfg, &mut tmp_dirs)
            .expect("resolve");
        let written = std::fs::read_to_string(dir.join("test.txt")).expect("read");
        assert_eq!(written, "hello\nworld\n");
    }

    #[test]
    fn writer_chunks_do_not_create_missing_parents() {
        let (mut ctx, _mock) = test_context();
        let mut tmp_dirs = TmpDirs::new();
        let mut c = chunk("test");
        c.runtime = Some(Runtime::Writer);
        c.destination = "missing/parent/test.txt".to_string();
        assert!(c.prepare_for_execution(&mut ctx, &mut tmp_dirs).is_err());
    }

    #[test]
    fn bash_scripts_carry_the_boilerplate() {
        let (_ctx, _mock) = test_context();
        let dir = tempfile::tempdir().expect("tempdir");
        let mut c = chunk("test");
        c.content = vec!["echo hi".to_string()];
        c.write_bash_script(dir.path(), "probe.sh").expect("write");
        let script = std::fs::read_to_string(dir.path().join("probe.sh")).expect("read");
        assert!(script.starts_with("#!/bin/bash\nset -euo pipefail\n"));
        assert!(script.contains("echo hi\n"));
        assert!(script.ends_with("echo \"### ENV ###\"\nprintenv\n"));
        let mode = std::fs::metadata(dir.path().join("probe.sh"))
            .expect("metadata")
            .permissions();
        use std::os::unix::fs::PermissionsExt;
        assert_eq!(mode.mode() & 0o777, 0o770);
    }

    #[test]
    fn output_presence_follows_captures_and_dry_run() {
        let (mut ctx, _mock) = test_context();
        let mut c = chunk("test");
        assert!(!c.has_output(&ctx.cfg));
        ctx.cfg.dry_run = true;
        assert!(c.has_output(&ctx.cfg));
        ctx.cfg.dry_run = false;
        let mut tmp_dirs = TmpDirs::new();
        c.add_command(&ctx.cfg, "true", &mut tmp_dirs).expect("add");
        assert!(!c.has_output(&ctx.cfg));
        c.commands[0].stdout = "some output".to_string();
        assert!(c.has_output(&ctx.cfg));
    }

    #[test]
    fn metadata_schema_rejects_unknown_keys() {
        let parsed: Result<Chunk, _> =
            serde_json::from_str(r#"{"stage":"test","invalid_prop":"test"}"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn metadata_schema_rejects_unknown_runtimes() {
        let parsed: Result<Chunk, _> =
            serde_json::from_str(r#"{"stage":"test","runtime":"python"}"#);
        assert!(parsed.is_err());
    }
}
