//! Entry point: discovers markdown files and feeds them to the runner.

mod chunk;
mod cli;
mod config;
mod context;
mod parser;
mod rewriter;
mod runner;
mod stage;
mod view;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Parser;
use regex::Regex;

use crate::config::Config;
use crate::context::RunContext;

const VALID_EXTENSIONS: [&str; 4] = ["md", "MD", "Markdown", "markdown"];

/// Collects the files of a directory in name order, descending into
/// subdirectories when asked to.
fn find_markdown_files(dir: &Path, recursive: bool) -> Result<Vec<String>> {
    let mut entries: Vec<_> = fs::read_dir(dir)
        .with_context(|| format!("read directory {}", dir.display()))?
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("read directory {}", dir.display()))?;
    entries.sort_by_key(|entry| entry.file_name());

    let mut files = Vec::new();
    for entry in entries {
        let path = entry.path();
        if path.is_dir() {
            if recursive {
                files.extend(find_markdown_files(&path, recursive)?);
            }
        } else {
            files.push(path.display().to_string());
        }
    }
    Ok(files)
}

fn has_markdown_extension(file: &str) -> bool {
    Path::new(file)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| VALID_EXTENSIONS.contains(&ext))
}

fn main() -> Result<()> {
    let args = cli::RootArgs::parse();
    let cfg = Config::from_args(args);

    let filter = cfg
        .filter
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("invalid regex for --filter")?;

    let markdown_files = find_markdown_files(Path::new(&cfg.markdown_dir), cfg.recursive)?;
    let mut ctx = RunContext::new(cfg);

    for file in markdown_files {
        if !has_markdown_extension(&file) {
            continue;
        }
        if let Some(filter) = &filter {
            if !filter.is_match(&file) {
                ctx.view
                    .info(&format!("Ignoring {file}: it does not match the filter"));
                continue;
            }
        }
        if ctx.cfg.just_list {
            ctx.view.info(&file);
            continue;
        }
        if let Err(err) = runner::run_markdown(&mut ctx, &file) {
            ctx.view.error(&format!("{err:#}"));
            std::process::exit(1);
        }
    }
    Ok(())
}
