//! A stage of the execution pipeline and the scheduler that drives it.

use std::collections::HashMap;

use anyhow::{bail, Error, Result};

use crate::chunk::{Chunk, TmpDirs};
use crate::context::RunContext;

/// Chunks in the stage named exactly this still run after a previous stage
/// failed, so cleanup work always gets its chance.
pub const TEARDOWN_STAGE: &str = "teardown";

/// Exit results of the chunks that carry an id, keyed `stage/id`. Dependency
/// gates look predecessors up here instead of walking the plan.
#[derive(Debug, Default)]
pub struct ExitLedger {
    results: HashMap<String, bool>,
}

impl ExitLedger {
    pub fn new() -> ExitLedger {
        ExitLedger::default()
    }

    /// Whether the referenced chunk ran to completion with exit code zero.
    pub fn satisfied(&self, requires: &str) -> bool {
        self.results.get(requires).copied().unwrap_or(false)
    }

    pub fn record(&mut self, stage_name: &str, chunk: &Chunk) {
        if chunk.id.is_empty() {
            return;
        }
        self.results.insert(
            format!("{stage_name}/{}", chunk.id),
            chunk.has_executed_correctly(),
        );
    }
}

/// A maximal run of consecutive chunks sharing the same stage name.
#[derive(Debug)]
pub struct Stage {
    pub name: String,
    pub chunks: Vec<Chunk>,
}

impl Stage {
    /// Builds a stage from consecutive chunks; the name comes from the first
    /// chunk. Returns None for an empty slice.
    pub fn new(chunks: Vec<Chunk>) -> Option<Stage> {
        let name = chunks.first()?.stage.clone();
        Some(Stage { name, chunks })
    }

    /// All chunks of a stage must agree on their parallel flag; a mixed
    /// stage has no well-defined execution order.
    pub fn is_parallelism_consistent(&self) -> bool {
        let mut at_least_one_parallel = false;
        let mut at_least_one_sequential = false;
        for chunk in &self.chunks {
            at_least_one_parallel = at_least_one_parallel || chunk.is_parallel;
            at_least_one_sequential = at_least_one_sequential || !chunk.is_parallel;
        }
        at_least_one_parallel != at_least_one_sequential
    }

    /// Drives the stage to completion and returns its terminating error, if
    /// any. `prior_error` tells the stage that an earlier stage already
    /// failed; everything but teardown is then skipped. `break_at` is the
    /// chunk index at which the runner wants interactive mode turned on.
    pub fn execute(
        &mut self,
        ctx: &mut RunContext,
        tmp_dirs: &mut TmpDirs,
        ledger: &mut ExitLedger,
        prior_error: bool,
        break_at: Option<usize>,
    ) -> Result<()> {
        if !self.is_parallelism_consistent() {
            ctx.view
                .error(&format!("Inconsistent parallelism in stage {}", self.name));
            bail!("inconsistent parallelism found in stage {}", self.name);
        }
        let parallel = self.chunks.first().is_some_and(|chunk| chunk.is_parallel);
        if parallel {
            self.execute_parallel(ctx, tmp_dirs, ledger, prior_error, break_at)
        } else {
            self.execute_sequential(ctx, tmp_dirs, ledger, prior_error, break_at)
        }
    }

    /// Gate applied to each chunk before it is prepared: error skip policy,
    /// breakpoints, and the dependency ledger. Returns false when the chunk
    /// must not run.
    fn admit_chunk(
        &mut self,
        index: usize,
        ctx: &mut RunContext,
        ledger: &ExitLedger,
        failed: bool,
        break_at: Option<usize>,
    ) -> bool {
        if failed && self.name != TEARDOWN_STAGE {
            self.chunks[index].skip(ctx);
            return false;
        }
        if break_at == Some(index) {
            ctx.cfg.interactive = true;
        }
        if self.chunks[index].has_breakpoint && !ctx.cfg.ignore_breakpoints {
            ctx.cfg.interactive = true;
        }
        let requires = &self.chunks[index].requires;
        if !requires.is_empty() && !ledger.satisfied(requires) {
            return false;
        }
        true
    }

    fn execute_sequential(
        &mut self,
        ctx: &mut RunContext,
        tmp_dirs: &mut TmpDirs,
        ledger: &mut ExitLedger,
        prior_error: bool,
        break_at: Option<usize>,
    ) -> Result<()> {
        let mut stage_error: Option<Error> = None;
        for index in 0..self.chunks.len() {
            let failed = prior_error || stage_error.is_some();
            if !self.admit_chunk(index, ctx, ledger, failed, break_at) {
                continue;
            }
            if let Err(err) = self.chunks[index].prepare_for_execution(ctx, tmp_dirs) {
                stage_error = Some(err);
                continue;
            }
            let result = self.chunks[index].execute_sequential(ctx);
            ledger.record(&self.name, &self.chunks[index]);
            if let Err(err) = result {
                stage_error = Some(err);
            }
        }
        match stage_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Parallel stages run in three phases so every log slot exists before
    /// any output is written: declare all, start all, then join all. Joins
    /// turn into kills as soon as the stage has failed.
    fn execute_parallel(
        &mut self,
        ctx: &mut RunContext,
        tmp_dirs: &mut TmpDirs,
        ledger: &mut ExitLedger,
        prior_error: bool,
        break_at: Option<usize>,
    ) -> Result<()> {
        let mut stage_error: Option<Error> = None;

        let mut runnable: Vec<usize> = Vec::new();
        for index in 0..self.chunks.len() {
            let failed = prior_error || stage_error.is_some();
            if !self.admit_chunk(index, ctx, ledger, failed, break_at) {
                continue;
            }
            if let Err(err) = self.chunks[index].prepare_for_execution(ctx, tmp_dirs) {
                stage_error = Some(err);
                continue;
            }
            runnable.push(index);
        }

        ctx.view.declare_parallel_mode();
        let mut declared: Vec<usize> = Vec::new();
        for &index in &runnable {
            match self.chunks[index].declare_parallel_loggers(ctx) {
                Ok(()) => declared.push(index),
                Err(err) => {
                    stage_error = Some(err);
                    break;
                }
            }
        }
        ctx.view.start_parallel_mode()?;

        let mut started: Vec<usize> = Vec::new();
        for &index in &declared {
            // A cancel during the declare phase means nothing may start,
            // including siblings that were declared before it.
            if stage_error.is_some() {
                break;
            }
            match self.chunks[index].start_parallel(ctx) {
                Ok(()) => started.push(index),
                Err(err) => stage_error = Some(err),
            }
        }

        for &index in &started {
            let should_kill = stage_error.is_some();
            if let Err(err) = self.chunks[index].wait_parallel(ctx, should_kill) {
                stage_error = Some(err);
            }
            ledger.record(&self.name, &self.chunks[index]);
        }
        ctx.view.quit_parallel_mode()?;

        match stage_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Resolves a `break_at` chunk selector within a stage: an id match wins
/// over a numeric index.
pub fn find_chunk_index(stage: &Stage, identifier: &str) -> Result<usize> {
    if let Some(index) = stage
        .chunks
        .iter()
        .position(|chunk| !chunk.id.is_empty() && chunk.id == identifier)
    {
        return Ok(index);
    }
    if let Ok(index) = identifier.parse::<usize>() {
        if index >= stage.chunks.len() {
            bail!(
                "chunk index {index} is out of range (0-{}) in stage '{}'",
                stage.chunks.len().saturating_sub(1),
                stage.name
            );
        }
        return Ok(index);
    }
    bail!(
        "chunk with ID '{identifier}' not found in stage '{}'",
        stage.name
    )
}

#[cfg(test)]
mod tests {
    use super::{find_chunk_index, ExitLedger, Stage};
    use crate::chunk::{Chunk, TmpDirs};
    use crate::config::Config;
    use crate::context::RunContext;
    use crate::view::MockView;
    use std::time::{Duration, Instant};

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

    fn chunk(stage: &str, content: &[&str]) -> Chunk {
        Chunk {
            stage: stage.to_string(),
            content: content.iter().map(|line| line.to_string()).collect(),
            ..Chunk::default()
        }
    }

    #[test]
    fn new_stage_takes_its_name_from_the_first_chunk() {
        let stage = Stage::new(vec![chunk("test-stage", &[]), chunk("test-stage", &[])])
            .expect("stage");
        assert_eq!(stage.name, "test-stage");
        assert_eq!(stage.chunks.len(), 2);
        assert!(Stage::new(Vec::new()).is_none());
    }

    #[test]
    fn parallelism_consistency() {
        let consistent = |flags: &[bool]| {
            let chunks = flags
                .iter()
                .map(|&is_parallel| Chunk {
                    stage: "s".to_string(),
                    is_parallel,
                    ..Chunk::default()
                })
                .collect();
            Stage {
                name: "s".to_string(),
                chunks,
            }
            .is_parallelism_consistent()
        };
        assert!(consistent(&[true, true]));
        assert!(consistent(&[false, false]));
        assert!(!consistent(&[true, false]));
        assert!(!consistent(&[]));
    }

    #[test]
    fn sequential_stage_runs_chunks_in_order() {
        let (mut ctx, _mock) = test_context();
        let mut stage = Stage::new(vec![
            chunk("test-stage", &["echo 1"]),
            chunk("test-stage", &["echo 2"]),
        ])
        .expect("stage");
        let mut tmp_dirs = TmpDirs::new();
        let mut ledger = ExitLedger::new();
        stage
            .execute(&mut ctx, &mut tmp_dirs, &mut ledger, false, None)
            .expect("execute");
        assert_eq!(stage.chunks[0].commands[0].stdout, "1\n");
        assert_eq!(stage.chunks[1].commands[0].stdout, "2\n");
    }

    #[test]
    fn sequential_failure_skips_the_rest_of_the_stage() {
        let (mut ctx, _mock) = test_context();
        let mut stage = Stage::new(vec![
            chunk("test-stage", &["false"]),
            chunk("test-stage", &["echo should-not-run"]),
        ])
        .expect("stage");
        let mut tmp_dirs = TmpDirs::new();
        let mut ledger = ExitLedger::new();
        let err = stage
            .execute(&mut ctx, &mut tmp_dirs, &mut ledger, false, None)
            .expect_err("expected failure");
        assert!(err.to_string().contains("exit code"));
        assert!(stage.chunks[1].is_skipped);
        assert!(stage.chunks[1].commands.is_empty());
    }

    #[test]
    fn parallel_stage_joins_every_chunk() {
        let (mut ctx, mock) = test_context();
        let mut chunks = vec![
            chunk("test-stage", &["sleep 0.1"]),
            chunk("test-stage", &["sleep 0.1"]),
        ];
        for c in &mut chunks {
            c.is_parallel = true;
        }
        let mut stage = Stage::new(chunks).expect("stage");
        let mut tmp_dirs = TmpDirs::new();
        let mut ledger = ExitLedger::new();
        stage
            .execute(&mut ctx, &mut tmp_dirs, &mut ledger, false, None)
            .expect("execute");
        assert_eq!(mock.count_calls("DeclareParallel"), 1);
        assert_eq!(mock.count_calls("StartParallel"), 1);
        assert_eq!(mock.count_calls("QuitParallel"), 1);
        assert!(stage.chunks.iter().all(|c| c.has_executed_correctly()));
    }

    #[test]
    fn parallel_failure_kills_lagging_siblings() {
        let (mut ctx, mock) = test_context();
        let mut failing = chunk("test-stage", &["false"]);
        failing.is_parallel = true;
        let mut lagging = chunk("test-stage", &["sleep 60"]);
        lagging.is_parallel = true;
        let mut stage = Stage::new(vec![failing, lagging]).expect("stage");
        let mut tmp_dirs = TmpDirs::new();
        let mut ledger = ExitLedger::new();
        let started = Instant::now();
        let result = stage.execute(&mut ctx, &mut tmp_dirs, &mut ledger, false, None);
        assert!(result.is_err());
        assert!(
            started.elapsed() < Duration::from_secs(30),
            "lagging sibling should be killed promptly"
        );
        assert_eq!(mock.count_calls("Killed"), 1);
    }

    #[test]
    fn met_dependencies_admit_the_chunk() {
        let (mut ctx, _mock) = test_context();
        let mut tmp_dirs = TmpDirs::new();
        let mut ledger = ExitLedger::new();

        let mut setup_chunk = chunk("setup", &["true"]);
        setup_chunk.id = "chunk1".to_string();
        let mut setup = Stage::new(vec![setup_chunk]).expect("stage");
        setup
            .execute(&mut ctx, &mut tmp_dirs, &mut ledger, false, None)
            .expect("setup");

        let mut dependent = chunk("test-stage", &["echo dependency-met"]);
        dependent.requires = "setup/chunk1".to_string();
        let mut stage = Stage::new(vec![dependent]).expect("stage");
        stage
            .execute(&mut ctx, &mut tmp_dirs, &mut ledger, false, None)
            .expect("execute");
        assert_eq!(stage.chunks[0].commands[0].stdout, "dependency-met\n");
    }

    #[test]
    fn unmet_dependencies_skip_the_chunk_without_failing() {
        let (mut ctx, _mock) = test_context();
        let mut tmp_dirs = TmpDirs::new();
        let mut ledger = ExitLedger::new();

        let mut setup_chunk = chunk("setup", &["false"]);
        setup_chunk.id = "chunk1".to_string();
        let mut setup = Stage::new(vec![setup_chunk]).expect("stage");
        assert!(setup
            .execute(&mut ctx, &mut tmp_dirs, &mut ledger, false, None)
            .is_err());

        let mut dependent = chunk("test-stage", &["echo should-not-run"]);
        dependent.requires = "setup/chunk1".to_string();
        let mut stage = Stage::new(vec![dependent]).expect("stage");
        stage
            .execute(&mut ctx, &mut tmp_dirs, &mut ledger, false, None)
            .expect("skipped chunks are not failures");
        assert!(stage.chunks[0].commands.is_empty());
    }

    #[test]
    fn breakpoints_flip_interactive_mode() {
        let (mut ctx, _mock) = test_context();
        let mut with_breakpoint = chunk("test-stage", &[]);
        with_breakpoint.has_breakpoint = true;
        let mut stage = Stage::new(vec![with_breakpoint]).expect("stage");
        let mut tmp_dirs = TmpDirs::new();
        let mut ledger = ExitLedger::new();
        stage
            .execute(&mut ctx, &mut tmp_dirs, &mut ledger, false, None)
            .expect("execute");
        assert!(ctx.cfg.interactive);
    }

    #[test]
    fn ignored_breakpoints_leave_interactive_mode_off() {
        let (mut ctx, _mock) = test_context();
        ctx.cfg.ignore_breakpoints = true;
        let mut with_breakpoint = chunk("test-stage", &[]);
        with_breakpoint.has_breakpoint = true;
        let mut stage = Stage::new(vec![with_breakpoint]).expect("stage");
        let mut tmp_dirs = TmpDirs::new();
        let mut ledger = ExitLedger::new();
        stage
            .execute(&mut ctx, &mut tmp_dirs, &mut ledger, false, None)
            .expect("execute");
        assert!(!ctx.cfg.interactive);
    }

    #[test]
    fn teardown_stages_run_after_a_prior_error() {
        let (mut ctx, _mock) = test_context();
        let mut tmp_dirs = TmpDirs::new();
        let mut ledger = ExitLedger::new();

        let mut ok_chunk = chunk("stage1", &["true"]);
        ok_chunk.id = "chunk1_success".to_string();
        let mut failing_chunk = chunk("stage1", &["false"]);
        failing_chunk.id = "chunk1_fail".to_string();
        let mut stage1 = Stage::new(vec![ok_chunk, failing_chunk]).expect("stage");
        assert!(stage1
            .execute(&mut ctx, &mut tmp_dirs, &mut ledger, false, None)
            .is_err());

        let mut stage2 = Stage::new(vec![chunk("stage2", &["echo should-not-run"])])
            .expect("stage");
        stage2
            .execute(&mut ctx, &mut tmp_dirs, &mut ledger, true, None)
            .expect("skips are not failures");
        assert!(stage2.chunks[0].is_skipped);

        let mut teardown_for_success = chunk("teardown", &["echo should-run"]);
        teardown_for_success.requires = "stage1/chunk1_success".to_string();
        let mut teardown_for_fail = chunk("teardown", &["echo should-not-run"]);
        teardown_for_fail.requires = "stage1/chunk1_fail".to_string();
        let mut teardown = Stage::new(vec![teardown_for_success, teardown_for_fail])
            .expect("stage");
        teardown
            .execute(&mut ctx, &mut tmp_dirs, &mut ledger, true, None)
            .expect("teardown runs");
        assert!(teardown.chunks[0].has_executed_correctly());
        assert!(teardown.chunks[1].commands.is_empty());
    }

    #[test]
    fn cancel_during_declare_starts_no_declared_sibling() {
        let (mut ctx, mock) = test_context();
        ctx.cfg.interactive = true;
        mock.push_prompt_plan(crate::view::PromptChoice::Yes);
        mock.push_prompt_plan(crate::view::PromptChoice::Cancel);

        let dir = tempfile::tempdir().expect("tempdir");
        let witness = dir.path().join("first_ran");
        let mut first = chunk("test-stage", &[&format!("touch {}", witness.display())]);
        first.is_parallel = true;
        let mut second = chunk("test-stage", &["echo never"]);
        second.is_parallel = true;
        let mut stage = Stage::new(vec![first, second]).expect("stage");
        let mut tmp_dirs = TmpDirs::new();
        let mut ledger = ExitLedger::new();

        let err = stage
            .execute(&mut ctx, &mut tmp_dirs, &mut ledger, false, None)
            .expect_err("expected user abort");
        assert!(err.to_string().contains("user aborted"));
        assert!(
            !witness.exists(),
            "a chunk declared before the cancel must not start"
        );
    }

    #[test]
    fn break_at_index_enables_interactive_from_that_chunk() {
        let (mut ctx, mock) = test_context();
        // The mock answers yes, so execution continues but the prompt fires.
        let mut stage = Stage::new(vec![
            chunk("test-stage", &["echo 1"]),
            chunk("test-stage", &["echo 2"]),
        ])
        .expect("stage");
        let mut tmp_dirs = TmpDirs::new();
        let mut ledger = ExitLedger::new();
        stage
            .execute(&mut ctx, &mut tmp_dirs, &mut ledger, false, Some(1))
            .expect("execute");
        assert!(ctx.cfg.interactive);
        assert_eq!(mock.count_calls("InteractivePrompt"), 1);
    }

    #[test]
    fn chunk_selector_prefers_ids_over_indexes() {
        let plain = Chunk {
            stage: "s".to_string(),
            ..Chunk::default()
        };
        let mut numeric_id = Chunk {
            stage: "s".to_string(),
            ..Chunk::default()
        };
        numeric_id.id = "0".to_string();
        let stage = Stage::new(vec![plain, numeric_id]).expect("stage");
        // "0" names the second chunk by id even though it parses as index 0.
        assert_eq!(find_chunk_index(&stage, "0").expect("by id"), 1);
        assert_eq!(find_chunk_index(&stage, "1").expect("by index"), 1);
        assert!(find_chunk_index(&stage, "missing").is_err());
        assert!(find_chunk_index(&stage, "7").is_err());
    }
}
