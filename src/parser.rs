//! Scans a markdown file for runnable fences and groups the extracted
//! chunks into stages.

use std::fs;
use std::path::Path;

use anyhow::{anyhow, bail, Context, Result};
use regex::Regex;

use crate::chunk::Chunk;
use crate::context::RunContext;
use crate::stage::Stage;

/// Opening fence of a runnable chunk: backticks, an optional language tag,
/// and a JSON metadata object.
pub(crate) const CHUNK_FENCE: &str = r"^`{3,}[a-zA-Z0-9_\-. ]*\{.*\}.*$";
/// Opening fence of a previously injected output block.
pub(crate) const OUTPUT_FENCE: &str = r"^`{3,}shell markdown_runner$";

/// The closing fence must carry exactly the opening backtick count, which
/// lets chunks contain nested fenced blocks.
pub(crate) fn closing_fence(back_quotes: usize) -> Result<Regex> {
    Regex::new(&format!("^`{{{back_quotes}}}$")).context("compile closing fence pattern")
}

pub(crate) fn count_opening_back_quotes(line: &str) -> usize {
    line.chars().take_while(|c| *c == '`').count()
}

/// Compiled patterns for the metadata fields that carry format constraints.
struct MetaPatterns {
    name: Regex,
    requires: Regex,
    rootdir: Regex,
    path: Regex,
    label: Regex,
}

impl MetaPatterns {
    fn new() -> Result<MetaPatterns> {
        Ok(MetaPatterns {
            name: Regex::new(r"^[a-zA-Z0-9_-]*$").context("compile name pattern")?,
            requires: Regex::new(r"^[a-zA-Z0-9_-]*/[a-zA-Z0-9_-]*$")
                .context("compile requires pattern")?,
            rootdir: Regex::new(r"^(\$initial_dir|\$tmpdir\.?\w*)?[\w/\-.]*$")
                .context("compile rootdir pattern")?,
            path: Regex::new(r"^[\w/\-.]*$").context("compile path pattern")?,
            label: Regex::new(r"^[a-zA-Z0-9_\-: ]*$").context("compile label pattern")?,
        })
    }

    fn validate(&self, chunk: &Chunk) -> Result<()> {
        if chunk.stage.is_empty() {
            bail!("the stage property is required");
        }
        if !self.name.is_match(&chunk.stage) {
            bail!("invalid stage name '{}'", chunk.stage);
        }
        if !self.name.is_match(&chunk.id) {
            bail!("invalid id '{}'", chunk.id);
        }
        if !chunk.requires.is_empty() && !self.requires.is_match(&chunk.requires) {
            bail!("invalid requires reference '{}'", chunk.requires);
        }
        if !self.rootdir.is_match(&chunk.rootdir) {
            bail!("invalid rootdir '{}'", chunk.rootdir);
        }
        if !self.path.is_match(&chunk.destination) {
            bail!("invalid destination '{}'", chunk.destination);
        }
        if !self.label.is_match(&chunk.label) {
            bail!("invalid label '{}'", chunk.label);
        }
        if chunk.is_writer() && chunk.destination.is_empty() {
            bail!("a writer runtime requires a destination property");
        }
        Ok(())
    }
}

/// Parses the JSON substring of a fence line into a chunk, reporting JSON
/// syntax and schema violations separately, both with the line number.
fn init_chunk(
    ctx: &mut RunContext,
    patterns: &MetaPatterns,
    file: &str,
    line_no: usize,
    params: &str,
) -> Result<Chunk> {
    let value: serde_json::Value = serde_json::from_str(params)
        .map_err(|err| anyhow!("JSON parse error in {file} at line {line_no}: {err} in {params}"))?;
    let mut chunk: Chunk = serde_json::from_value(value).map_err(|err| {
        anyhow!("metadata validation error in {file} at line {line_no}: {err} in {params}")
    })?;
    patterns.validate(&chunk).map_err(|err| {
        anyhow!("metadata validation error in {file} at line {line_no}: {err} in {params}")
    })?;
    chunk.init(ctx);
    Ok(chunk)
}

/// Reads a markdown file and extracts its runnable chunks, grouped into
/// stages by consecutive runs of equal stage names. Previously injected
/// output blocks are ignored.
pub fn extract_stages(ctx: &mut RunContext, file: &str, markdown_dir: &str) -> Result<Vec<Stage>> {
    let filepath = Path::new(markdown_dir).join(file);
    let contents = fs::read_to_string(&filepath)
        .with_context(|| format!("open {}", filepath.display()))?;

    let chunk_fence = Regex::new(CHUNK_FENCE).context("compile chunk fence pattern")?;
    let output_fence = Regex::new(OUTPUT_FENCE).context("compile output fence pattern")?;
    let patterns = MetaPatterns::new()?;

    let mut grouped: Vec<Vec<Chunk>> = Vec::new();
    let mut current_stage_name = String::new();

    let mut in_chunk = false;
    let mut chunk_stop: Option<Regex> = None;
    let mut in_output = false;
    let mut output_stop: Option<Regex> = None;

    for (index, line) in contents.lines().enumerate() {
        let line_no = index + 1;
        // Everything between an output fence and its closing fence belongs
        // to a previous run and is dropped from the plan.
        if !in_chunk && !in_output && output_fence.is_match(line) {
            in_output = true;
            output_stop = Some(closing_fence(count_opening_back_quotes(line))?);
            continue;
        }
        if !in_chunk && in_output {
            if output_stop.as_ref().is_some_and(|stop| stop.is_match(line)) {
                in_output = false;
            }
            continue;
        }
        if !in_chunk && !in_output && chunk_fence.is_match(line) {
            let back_quotes = count_opening_back_quotes(line);
            chunk_stop = Some(closing_fence(back_quotes)?);
            in_chunk = true;
            let params = match line.find('{') {
                Some(start) => &line[start..],
                None => line,
            };
            let mut chunk = init_chunk(ctx, &patterns, file, line_no, params)?;
            chunk.back_quotes = back_quotes;
            if chunk.stage != current_stage_name {
                current_stage_name = chunk.stage.clone();
                grouped.push(Vec::new());
            }
            if let Some(group) = grouped.last_mut() {
                group.push(chunk);
            }
            continue;
        }
        if in_chunk {
            if chunk_stop.as_ref().is_some_and(|stop| stop.is_match(line)) {
                in_chunk = false;
            } else if let Some(chunk) = grouped.last_mut().and_then(|group| group.last_mut()) {
                chunk.content.push(line.to_string());
            }
        }
    }

    let mut stages = Vec::new();
    for chunks in grouped {
        if let Some(stage) = Stage::new(chunks) {
            if !stage.is_parallelism_consistent() {
                bail!("inconsistent parallelism found in stage {}", stage.name);
            }
            stages.push(stage);
        }
    }
    Ok(stages)
}
