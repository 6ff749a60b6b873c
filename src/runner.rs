//! Per-file orchestration: parse, iterate stages, rewrite, clean up.

use std::fs;
use std::path::Path;

use anyhow::{Context, Error, Result};

use crate::chunk::TmpDirs;
use crate::context::RunContext;
use crate::parser;
use crate::rewriter;
use crate::stage::{find_chunk_index, ExitLedger};

/// Runs every stage of one markdown file. Returns the terminating error of
/// the run; stages after a failure are skipped except teardown, and the
/// document rewrite only happens on a clean run.
pub fn run_markdown(ctx: &mut RunContext, file: &str) -> Result<()> {
    let path = Path::new(file);
    let markdown_dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.display().to_string(),
        _ => ".".to_string(),
    };
    let file_name = match path.file_name().and_then(|name| name.to_str()) {
        Some(name) => name.to_string(),
        None => file.to_string(),
    };

    ctx.view.start_file(file);

    let mut stages = match parser::extract_stages(ctx, &file_name, &markdown_dir) {
        Ok(stages) => stages,
        Err(err) => {
            ctx.view.end_file(file, Some(&err));
            return Err(err);
        }
    };
    if stages.is_empty() {
        return Ok(());
    }

    let mut tmp_dirs = TmpDirs::new();
    let mut ledger = ExitLedger::new();
    let mut terminating_error: Option<Error> = None;

    for stage in stages.iter_mut() {
        if let Some(start_stage) = ctx.cfg.start_from_stage.clone() {
            let should_start = match &ctx.cfg.start_from_file {
                Some(selector) => file_matches(file, selector),
                None => true,
            };
            if should_start && stage.name == start_stage {
                ctx.cfg.start_from_stage = None;
                ctx.cfg.start_from_file = None;
            } else {
                continue;
            }
        }

        let mut break_at = None;
        if let Some(break_stage) = ctx.cfg.break_at_stage.clone() {
            let should_break = match &ctx.cfg.break_at_file {
                Some(selector) => file_matches(file, selector),
                None => true,
            };
            if should_break && stage.name == break_stage {
                match ctx.cfg.break_at_chunk.clone() {
                    Some(selector) => match find_chunk_index(stage, &selector) {
                        Ok(index) => break_at = Some(index),
                        Err(err) => {
                            ctx.view.end_file(file, Some(&err));
                            return Err(err);
                        }
                    },
                    None => ctx.cfg.interactive = true,
                }
                ctx.cfg.break_at_stage = None;
                ctx.cfg.break_at_chunk = None;
                ctx.cfg.break_at_file = None;
            }
        }

        ctx.view
            .start_stage(&stage.name, stage.chunks.len(), ctx.cfg.verbose);

        let result = stage.execute(
            ctx,
            &mut tmp_dirs,
            &mut ledger,
            terminating_error.is_some(),
            break_at,
        );
        if let Err(err) = result {
            terminating_error = Some(err);
        }
    }

    if ctx.cfg.update_files && terminating_error.is_none() {
        let rewrite =
            rewriter::update_chunk_output(&file_name, &markdown_dir, &stages, &ctx.cfg).and_then(
                |out_path| {
                    fs::rename(&out_path, Path::new(&markdown_dir).join(&file_name))
                        .with_context(|| format!("replace {file} with {}", out_path.display()))
                },
            );
        if let Err(err) = rewrite {
            terminating_error = Some(err);
        }
    }

    // Dropping the map removes every cached temporary directory.
    tmp_dirs.clear();

    ctx.view.end_file(file, terminating_error.as_ref());
    match terminating_error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// A file selector from `start_from` / `break_at` matches the full path,
/// the basename, the basename without extension, or a path suffix.
fn file_matches(file: &str, selector: &str) -> bool {
    let path = Path::new(file);
    let basename = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(file);
    let without_ext = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(basename);
    file == selector
        || basename == selector
        || without_ext == selector
        || file.ends_with(selector)
}
