//! Typed configuration for a run, resolved once from the CLI surface.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::RootArgs;

/// All tunables for a run, plus the run-wide environment. The engine never
/// looks at the CLI again after this record is built.
///
/// The environment map starts as a snapshot of the host process environment
/// (plus `WORKING_DIR`) and is overwritten by every bash chunk that finishes
/// successfully, so later chunks observe exported variables.
#[derive(Debug)]
pub struct Config {
    pub markdown_dir: String,
    pub recursive: bool,
    pub filter: Option<String>,
    pub just_list: bool,
    pub dry_run: bool,
    pub interactive: bool,
    pub ignore_breakpoints: bool,
    pub update_files: bool,
    pub timeout: Duration,
    pub start_from_stage: Option<String>,
    pub start_from_file: Option<String>,
    pub break_at_stage: Option<String>,
    pub break_at_chunk: Option<String>,
    pub break_at_file: Option<String>,
    pub view: String,
    pub verbose: bool,
    pub quiet: bool,
    pub no_styling: bool,
    /// The working directory the process was started in, used for
    /// `$initial_dir` chunks.
    pub initial_dir: PathBuf,
    pub env: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        let initial_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        let mut env: HashMap<String, String> = std::env::vars().collect();
        env.insert("WORKING_DIR".to_string(), initial_dir.display().to_string());
        Config {
            markdown_dir: "./".to_string(),
            recursive: false,
            filter: None,
            just_list: false,
            dry_run: false,
            interactive: false,
            ignore_breakpoints: false,
            update_files: false,
            timeout: Duration::from_secs(10 * 60),
            start_from_stage: None,
            start_from_file: None,
            break_at_stage: None,
            break_at_chunk: None,
            break_at_file: None,
            view: "default".to_string(),
            verbose: false,
            quiet: false,
            no_styling: false,
            initial_dir,
            env,
        }
    }
}

impl Config {
    pub fn from_args(args: RootArgs) -> Config {
        let mut cfg = Config::default();
        cfg.markdown_dir = args.markdown_dir;
        cfg.recursive = args.recursive;
        cfg.filter = args.filter;
        cfg.just_list = args.just_list;
        cfg.dry_run = args.dry_run;
        cfg.interactive = args.interactive;
        cfg.ignore_breakpoints = args.ignore_breakpoints;
        cfg.update_files = args.update_files;
        cfg.timeout = Duration::from_secs(args.timeout * 60);
        cfg.view = args.view;
        cfg.verbose = args.verbose;
        cfg.quiet = args.quiet;
        cfg.no_styling = args.no_styling;
        if let Some(start_from) = args.start_from {
            let (file, stage) = split_file_selector(&start_from);
            cfg.start_from_file = file;
            cfg.start_from_stage = Some(stage);
        }
        if let Some(break_at) = args.break_at {
            let (file, rest) = split_file_selector(&break_at);
            cfg.break_at_file = file;
            match rest.split_once('/') {
                Some((stage, chunk)) => {
                    cfg.break_at_stage = Some(stage.to_string());
                    cfg.break_at_chunk = Some(chunk.to_string());
                }
                None => cfg.break_at_stage = Some(rest),
            }
        }
        cfg
    }
}

/// Splits an optional `file@` prefix off a stage selector.
fn split_file_selector(selector: &str) -> (Option<String>, String) {
    match selector.split_once('@') {
        Some((file, rest)) => (Some(file.to_string()), rest.to_string()),
        None => (None, selector.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::Config;
    use crate::cli::RootArgs;
    use clap::Parser;

    #[test]
    fn start_from_parses_plain_stage() {
        let args = RootArgs::parse_from(["mdrun", "--start-from", "deploy"]);
        let cfg = Config::from_args(args);
        assert_eq!(cfg.start_from_stage.as_deref(), Some("deploy"));
        assert_eq!(cfg.start_from_file, None);
    }

    #[test]
    fn start_from_parses_file_and_stage() {
        let args = RootArgs::parse_from(["mdrun", "--start-from", "setup.md@deploy"]);
        let cfg = Config::from_args(args);
        assert_eq!(cfg.start_from_stage.as_deref(), Some("deploy"));
        assert_eq!(cfg.start_from_file.as_deref(), Some("setup.md"));
    }

    #[test]
    fn break_at_parses_all_forms() {
        let cfg = Config::from_args(RootArgs::parse_from(["mdrun", "--break-at", "deploy"]));
        assert_eq!(cfg.break_at_stage.as_deref(), Some("deploy"));
        assert_eq!(cfg.break_at_chunk, None);
        assert_eq!(cfg.break_at_file, None);

        let cfg = Config::from_args(RootArgs::parse_from(["mdrun", "--break-at", "deploy/push"]));
        assert_eq!(cfg.break_at_stage.as_deref(), Some("deploy"));
        assert_eq!(cfg.break_at_chunk.as_deref(), Some("push"));

        let cfg = Config::from_args(RootArgs::parse_from([
            "mdrun",
            "--break-at",
            "setup.md@deploy/push",
        ]));
        assert_eq!(cfg.break_at_file.as_deref(), Some("setup.md"));
        assert_eq!(cfg.break_at_stage.as_deref(), Some("deploy"));
        assert_eq!(cfg.break_at_chunk.as_deref(), Some("push"));
    }

    #[test]
    fn environment_snapshot_carries_working_dir() {
        let cfg = Config::default();
        assert!(cfg.env.contains_key("WORKING_DIR"));
        assert_eq!(cfg.timeout.as_secs(), 600);
    }
}
