//! Rewrites a markdown document with the latest captured outputs.
//!
//! The scan mirrors the parser's state machine: every line is copied
//! verbatim except the previously injected output blocks, which are dropped
//! and replaced by fresh ones right after their runnable fence closes.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::Config;
use crate::stage::Stage;

/// Produces `<file>.out` next to the original with the refreshed output
/// blocks. The caller is expected to atomically rename it over the original.
pub fn update_chunk_output(
    file: &str,
    markdown_dir: &str,
    stages: &[Stage],
    cfg: &Config,
) -> Result<PathBuf> {
    let in_path = Path::new(markdown_dir).join(file);
    let contents = fs::read_to_string(&in_path)
        .with_context(|| format!("open {}", in_path.display()))?;
    let out_path = Path::new(markdown_dir).join(format!("{file}.out"));

    let chunk_fence =
        Regex::new(crate::parser::CHUNK_FENCE).context("compile chunk fence pattern")?;
    let output_fence =
        Regex::new(crate::parser::OUTPUT_FENCE).context("compile output fence pattern")?;

    let mut out = String::with_capacity(contents.len());

    let mut in_chunk = false;
    let mut chunk_stop: Option<Regex> = None;
    let mut chunk_back_quotes = 0usize;
    let mut in_output = false;
    let mut output_stop: Option<Regex> = None;

    let mut stage_index = 0usize;
    let mut chunk_index = 0usize;

    for line in contents.lines() {
        if !in_chunk && !in_output && output_fence.is_match(line) {
            in_output = true;
            output_stop = Some(crate::parser::closing_fence(
                crate::parser::count_opening_back_quotes(line),
            )?);
            continue;
        }
        if !in_output {
            out.push_str(line);
            out.push('\n');
        }
        if !in_chunk && in_output && output_stop.as_ref().is_some_and(|stop| stop.is_match(line)) {
            in_output = false;
        }
        if !in_chunk && !in_output && chunk_fence.is_match(line) {
            chunk_back_quotes = crate::parser::count_opening_back_quotes(line);
            chunk_stop = Some(crate::parser::closing_fence(chunk_back_quotes)?);
            in_chunk = true;
            continue;
        }
        let mut write_new_output = false;
        if in_chunk && chunk_stop.as_ref().is_some_and(|stop| stop.is_match(line)) {
            in_chunk = false;
            write_new_output = true;
        }
        if write_new_output {
            if let Some(stage) = stages.get(stage_index) {
                if let Some(chunk) = stage.chunks.get(chunk_index) {
                    if chunk.has_output(cfg) {
                        chunk.write_output_to(chunk_back_quotes, &mut out);
                    }
                }
                chunk_index += 1;
                if chunk_index == stage.chunks.len() {
                    chunk_index = 0;
                    stage_index += 1;
                }
            }
        }
    }

    fs::write(&out_path, &out).with_context(|| format!("write {}", out_path.display()))?;
    Ok(out_path)
}
