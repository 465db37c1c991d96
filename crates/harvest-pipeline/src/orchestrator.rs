//! Stage orchestrator.
//!
//! Plans registered stages in dependency order, runs them one at a time,
//! records every transition, and aborts the run on the first failed stage.
//! Work already committed by earlier stages is kept.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use harvest_core::cancel::CancelSignal;
use harvest_core::error::HarvestError;
use harvest_core::types::{
    PipelineRun, PipelineStatus, StageName, StageReport, StageRun, StageStatus,
};
use harvest_storage::RunRepository;

use crate::error::PipelineError;
use crate::stage::{Stage, StageContext};
use crate::state_machine::{validate_pipeline_transition, validate_transition};

/// How long an interrupted stage may take to stop its in-flight work.
const STAGE_WIND_DOWN: Duration = Duration::from_secs(10);

/// Outcome of one orchestrator run.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub run: PipelineRun,
    /// Stage runs in execution order. Stages after an abort are absent.
    pub stages: Vec<StageRun>,
}

impl PipelineReport {
    pub fn is_aborted(&self) -> bool {
        self.run.status == PipelineStatus::Aborted
    }

    pub fn stage(&self, name: StageName) -> Option<&StageRun> {
        self.stages.iter().find(|s| s.stage == name)
    }
}

/// Orchestrator that owns the stage graph and run bookkeeping.
pub struct Orchestrator {
    stages: Vec<Box<dyn Stage>>,
    runs: RunRepository,
    stage_timeout: Option<Duration>,
}

impl Orchestrator {
    pub fn new(runs: RunRepository) -> Self {
        Self {
            stages: Vec::new(),
            runs,
            stage_timeout: None,
        }
    }

    /// Fail any stage that runs longer than `timeout`.
    pub fn with_stage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stage_timeout = timeout;
        self
    }

    /// Add a stage. Duplicates are reported when the plan is built.
    pub fn register(&mut self, stage: Box<dyn Stage>) {
        self.stages.push(stage);
    }

    pub fn registered(&self) -> Vec<StageName> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Topological order of the registered stages.
    ///
    /// Dependencies on stages that are not registered are ignored, so a
    /// disabled stage does not block its dependents. Ties are broken by
    /// registration order.
    pub fn plan(&self) -> Result<Vec<StageName>, PipelineError> {
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.name()) {
                return Err(PipelineError::DuplicateStage(stage.name()));
            }
        }

        let mut indegree: HashMap<StageName, usize> = HashMap::new();
        let mut dependents: HashMap<StageName, Vec<StageName>> = HashMap::new();
        for stage in &self.stages {
            let deps: Vec<StageName> = stage
                .depends_on()
                .into_iter()
                .filter(|d| seen.contains(d))
                .collect();
            indegree.insert(stage.name(), deps.len());
            for dep in deps {
                dependents.entry(dep).or_default().push(stage.name());
            }
        }

        let mut ready: VecDeque<StageName> = self
            .stages
            .iter()
            .map(|s| s.name())
            .filter(|name| indegree.get(name) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.stages.len());

        while let Some(name) = ready.pop_front() {
            order.push(name);
            for dependent in dependents.get(&name).into_iter().flatten() {
                if let Some(count) = indegree.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(*dependent);
                    }
                }
            }
        }

        if order.len() < self.stages.len() {
            let stuck = self
                .stages
                .iter()
                .map(|s| s.name())
                .filter(|name| !order.contains(name))
                .collect();
            return Err(PipelineError::DependencyCycle(stuck));
        }
        Ok(order)
    }

    /// Run every planned stage. The first failed stage aborts the run and
    /// no stage after it is started.
    pub async fn run(&self, cancel: &CancelSignal) -> Result<PipelineReport, PipelineError> {
        let plan = self.plan()?;
        let mut run = self.start_pipeline()?;
        info!(run_id = %run.id, plan = ?plan, "Pipeline run started");

        let ctx = StageContext {
            pipeline_run_id: run.id,
            cancel: cancel.clone(),
        };
        let mut stage_runs: Vec<StageRun> = Vec::new();
        let mut succeeded: HashSet<StageName> = HashSet::new();

        for name in plan {
            let stage = self.find(name)?;
            let unmet: Vec<StageName> = stage
                .depends_on()
                .into_iter()
                .filter(|d| self.is_registered(*d) && !succeeded.contains(d))
                .collect();
            if !unmet.is_empty() {
                warn!(stage = %name, unmet = ?unmet, "Dependencies not satisfied, stopping");
                run.failed_stage = Some(name);
                break;
            }

            let stage_run = match self.run_stage(stage, &ctx).await {
                Ok(stage_run) => stage_run,
                Err(e) => {
                    self.abandon_pipeline(&mut run, Some(name), &e);
                    return Err(e);
                }
            };
            let failed = stage_run.status == StageStatus::Failed;
            stage_runs.push(stage_run);
            if failed {
                run.failed_stage = Some(name);
                break;
            }
            succeeded.insert(name);
        }

        let status = if run.failed_stage.is_some() {
            PipelineStatus::Aborted
        } else {
            PipelineStatus::Completed
        };
        if let Err(e) = self.finish_pipeline(&mut run, status) {
            self.abandon_pipeline(&mut run, None, &e);
            return Err(e);
        }

        Ok(PipelineReport {
            run,
            stages: stage_runs,
        })
    }

    /// Run one registered stage on its own, ignoring dependency state.
    pub async fn run_single(
        &self,
        name: StageName,
        cancel: &CancelSignal,
    ) -> Result<PipelineReport, PipelineError> {
        let stage = self.find(name)?;
        let mut run = self.start_pipeline()?;
        info!(run_id = %run.id, stage = %name, "Single-stage run started");

        let ctx = StageContext {
            pipeline_run_id: run.id,
            cancel: cancel.clone(),
        };
        let stage_run = match self.run_stage(stage, &ctx).await {
            Ok(stage_run) => stage_run,
            Err(e) => {
                self.abandon_pipeline(&mut run, Some(name), &e);
                return Err(e);
            }
        };

        let status = if stage_run.status == StageStatus::Failed {
            run.failed_stage = Some(name);
            PipelineStatus::Aborted
        } else {
            PipelineStatus::Completed
        };
        if let Err(e) = self.finish_pipeline(&mut run, status) {
            self.abandon_pipeline(&mut run, None, &e);
            return Err(e);
        }

        Ok(PipelineReport {
            run,
            stages: vec![stage_run],
        })
    }

    /// Execute one stage and record its lifecycle.
    ///
    /// A stage error, timeout or cancellation marks the StageRun failed; it
    /// is not returned as an `Err`. Only bookkeeping failures are, and the
    /// StageRun row is then closed as failed on a best-effort basis.
    pub async fn run_stage(
        &self,
        stage: &dyn Stage,
        ctx: &StageContext,
    ) -> Result<StageRun, PipelineError> {
        let mut stage_run = StageRun::pending(ctx.pipeline_run_id, stage.name());
        match self.drive_stage(stage, ctx, &mut stage_run).await {
            Ok(()) => Ok(stage_run),
            Err(e) => {
                self.abandon_stage(&mut stage_run, &e);
                Err(e)
            }
        }
    }

    async fn drive_stage(
        &self,
        stage: &dyn Stage,
        ctx: &StageContext,
        stage_run: &mut StageRun,
    ) -> Result<(), PipelineError> {
        let name = stage.name();
        self.runs.insert_stage_run(stage_run)?;

        transition(stage_run, StageStatus::Running)?;
        stage_run.started_at = Some(Utc::now());
        self.runs.update_stage_run(stage_run)?;
        info!(stage = %name, "Stage started");

        match self.execute(stage, ctx).await {
            Ok(report) => {
                transition(stage_run, StageStatus::Succeeded)?;
                if report.has_failures() {
                    warn!(
                        stage = %name,
                        failed = report.failed,
                        "Stage finished with contained failures"
                    );
                }
                stage_run.report = report;
            }
            Err(e) => {
                transition(stage_run, StageStatus::Failed)?;
                error!(stage = %name, error = %e, "Stage failed");
                stage_run.error_detail = Some(e.to_string());
            }
        }

        stage_run.ended_at = Some(Utc::now());
        self.runs.update_stage_run(stage_run)?;
        info!(
            stage = %name,
            status = %stage_run.status,
            succeeded = stage_run.report.succeeded,
            skipped = stage_run.report.skipped,
            failed = stage_run.report.failed,
            "Stage finished"
        );
        Ok(())
    }

    /// Run the stage until it returns, the operator cancels, or the deadline
    /// passes. On cancel or deadline the stage's own signal is raised and
    /// the stage gets `STAGE_WIND_DOWN` to stop its in-flight work, so no
    /// writes land after the StageRun is closed.
    async fn execute(&self, stage: &dyn Stage, ctx: &StageContext) -> Result<StageReport, HarvestError> {
        if ctx.cancel.is_cancelled() {
            return Err(HarvestError::Cancelled);
        }

        let stage_cancel = CancelSignal::new();
        let stage_ctx = StageContext {
            pipeline_run_id: ctx.pipeline_run_id,
            cancel: stage_cancel.clone(),
        };
        let mut work = stage.run(&stage_ctx);

        let interrupted = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => HarvestError::Cancelled,
            _ = deadline(self.stage_timeout) => {
                HarvestError::Timeout(self.stage_timeout.map(|d| d.as_secs()).unwrap_or_default())
            }
            result = &mut work => return result,
        };

        stage_cancel.cancel();
        if tokio::time::timeout(STAGE_WIND_DOWN, &mut work).await.is_err() {
            warn!(
                stage = %stage.name(),
                wind_down_secs = STAGE_WIND_DOWN.as_secs(),
                "Stage did not stop after cancellation, dropping it"
            );
        }
        Err(interrupted)
    }

    /// Close a StageRun whose bookkeeping failed part way. The persisted row
    /// may lag the in-memory status, so it is overwritten as failed.
    fn abandon_stage(&self, stage_run: &mut StageRun, cause: &PipelineError) {
        stage_run.status = StageStatus::Failed;
        stage_run.started_at.get_or_insert_with(Utc::now);
        stage_run.ended_at = Some(Utc::now());
        stage_run.error_detail = Some(format!("Run bookkeeping failed: {}", cause));
        if let Err(e) = self.runs.update_stage_run(stage_run) {
            warn!(stage = %stage_run.stage, error = %e, "Could not close stage run");
        }
    }

    /// Mark the pipeline run aborted after a bookkeeping failure.
    fn abandon_pipeline(&self, run: &mut PipelineRun, stage: Option<StageName>, cause: &PipelineError) {
        error!(run_id = %run.id, error = %cause, "Pipeline bookkeeping failed, aborting run");
        run.status = PipelineStatus::Aborted;
        run.ended_at = Some(Utc::now());
        if stage.is_some() {
            run.failed_stage = stage;
        }
        if let Err(e) = self.runs.finish_pipeline(run) {
            warn!(run_id = %run.id, error = %e, "Could not close pipeline run");
        }
    }

    fn start_pipeline(&self) -> Result<PipelineRun, PipelineError> {
        let run = PipelineRun {
            id: Uuid::new_v4(),
            status: PipelineStatus::Running,
            started_at: Utc::now(),
            ended_at: None,
            failed_stage: None,
        };
        self.runs.start_pipeline(&run)?;
        Ok(run)
    }

    fn finish_pipeline(&self, run: &mut PipelineRun, status: PipelineStatus) -> Result<(), PipelineError> {
        validate_pipeline_transition(run.status, status)?;
        run.status = status;
        run.ended_at = Some(Utc::now());
        self.runs.finish_pipeline(run)?;

        match status {
            PipelineStatus::Aborted => error!(
                run_id = %run.id,
                failed_stage = ?run.failed_stage,
                "Pipeline run aborted"
            ),
            _ => info!(run_id = %run.id, "Pipeline run completed"),
        }
        Ok(())
    }

    fn find(&self, name: StageName) -> Result<&dyn Stage, PipelineError> {
        self.stages
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.as_ref())
            .ok_or(PipelineError::UnknownStage(name))
    }

    fn is_registered(&self, name: StageName) -> bool {
        self.stages.iter().any(|s| s.name() == name)
    }
}

/// Resolves after `limit`, or never when no limit is set.
async fn deadline(limit: Option<Duration>) {
    match limit {
        Some(limit) => tokio::time::sleep(limit).await,
        None => std::future::pending().await,
    }
}

fn transition(run: &mut StageRun, to: StageStatus) -> Result<(), PipelineError> {
    validate_transition(run.status, to)?;
    run.status = to;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use harvest_storage::Database;

    /// Stage with a scripted result.
    struct ScriptedStage {
        name: StageName,
        deps: Option<Vec<StageName>>,
        fail_with: Option<String>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedStage {
        fn ok(name: StageName) -> Self {
            Self {
                name,
                deps: None,
                fail_with: None,
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }

        fn failing(name: StageName, reason: &str) -> Self {
            Self {
                fail_with: Some(reason.to_string()),
                ..Self::ok(name)
            }
        }

        fn with_deps(mut self, deps: Vec<StageName>) -> Self {
            self.deps = Some(deps);
            self
        }
    }

    #[async_trait]
    impl Stage for ScriptedStage {
        fn name(&self) -> StageName {
            self.name
        }

        fn depends_on(&self) -> Vec<StageName> {
            self.deps
                .clone()
                .unwrap_or_else(|| self.name.depends_on().to_vec())
        }

        async fn run(&self, _ctx: &StageContext) -> Result<StageReport, HarvestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail_with {
                Some(reason) => Err(HarvestError::Stage(reason.clone())),
                None => Ok(StageReport {
                    succeeded: 1,
                    ..StageReport::default()
                }),
            }
        }
    }

    fn orchestrator() -> (Orchestrator, RunRepository) {
        let runs = RunRepository::new(Arc::new(Database::in_memory().unwrap()));
        (Orchestrator::new(runs.clone()), runs)
    }

    // =====================================================================
    // Planning
    // =====================================================================

    #[test]
    fn test_plan_orders_by_dependencies() {
        let (mut orch, _) = orchestrator();
        orch.register(Box::new(ScriptedStage::ok(StageName::Enrich)));
        orch.register(Box::new(ScriptedStage::ok(StageName::Load)));
        orch.register(Box::new(ScriptedStage::ok(StageName::Transform)));
        orch.register(Box::new(ScriptedStage::ok(StageName::Scrape)));

        assert_eq!(orch.plan().unwrap(), StageName::ALL.to_vec());
    }

    #[test]
    fn test_plan_skips_unregistered_dependencies() {
        let (mut orch, _) = orchestrator();
        orch.register(Box::new(ScriptedStage::ok(StageName::Enrich)));
        orch.register(Box::new(ScriptedStage::ok(StageName::Load)));

        assert_eq!(orch.plan().unwrap(), vec![StageName::Load, StageName::Enrich]);
    }

    #[test]
    fn test_plan_rejects_duplicates() {
        let (mut orch, _) = orchestrator();
        orch.register(Box::new(ScriptedStage::ok(StageName::Load)));
        orch.register(Box::new(ScriptedStage::ok(StageName::Load)));

        assert!(matches!(
            orch.plan(),
            Err(PipelineError::DuplicateStage(StageName::Load))
        ));
    }

    #[test]
    fn test_plan_rejects_cycles() {
        let (mut orch, _) = orchestrator();
        orch.register(Box::new(ScriptedStage::ok(StageName::Scrape)));
        orch.register(Box::new(
            ScriptedStage::ok(StageName::Load).with_deps(vec![StageName::Transform]),
        ));
        orch.register(Box::new(ScriptedStage::ok(StageName::Transform)));

        match orch.plan() {
            Err(PipelineError::DependencyCycle(stuck)) => {
                assert_eq!(stuck, vec![StageName::Load, StageName::Transform]);
            }
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    // =====================================================================
    // Running
    // =====================================================================

    #[tokio::test]
    async fn test_all_stages_succeed() {
        let (mut orch, runs) = orchestrator();
        for name in StageName::ALL {
            orch.register(Box::new(ScriptedStage::ok(name)));
        }

        let report = orch.run(&CancelSignal::new()).await.unwrap();
        assert_eq!(report.run.status, PipelineStatus::Completed);
        assert_eq!(report.stages.len(), 4);
        assert!(report
            .stages
            .iter()
            .all(|s| s.status == StageStatus::Succeeded && s.ended_at >= s.started_at));

        let persisted = runs.stage_runs_for(report.run.id).unwrap();
        assert_eq!(persisted.len(), 4);
        assert_eq!(runs.recent_pipeline_runs(1).unwrap()[0].status, PipelineStatus::Completed);
    }

    #[tokio::test]
    async fn test_failed_stage_aborts_downstream() {
        let (mut orch, runs) = orchestrator();
        let transform = ScriptedStage::ok(StageName::Transform);
        let transform_calls = transform.calls.clone();
        orch.register(Box::new(ScriptedStage::ok(StageName::Scrape)));
        orch.register(Box::new(ScriptedStage::failing(StageName::Load, "raw store unreadable")));
        orch.register(Box::new(transform));

        let report = orch.run(&CancelSignal::new()).await.unwrap();
        assert!(report.is_aborted());
        assert_eq!(report.run.failed_stage, Some(StageName::Load));
        assert_eq!(report.stages.len(), 2);
        let load = report.stage(StageName::Load).unwrap();
        assert_eq!(load.status, StageStatus::Failed);
        assert!(load.error_detail.as_deref().unwrap().contains("raw store unreadable"));
        assert_eq!(transform_calls.load(Ordering::SeqCst), 0);

        let stored = runs.recent_pipeline_runs(1).unwrap();
        assert_eq!(stored[0].status, PipelineStatus::Aborted);
        assert_eq!(stored[0].failed_stage, Some(StageName::Load));
    }

    #[tokio::test]
    async fn test_run_single_ignores_dependencies() {
        let (mut orch, _) = orchestrator();
        orch.register(Box::new(ScriptedStage::failing(StageName::Scrape, "offline")));
        orch.register(Box::new(ScriptedStage::ok(StageName::Load)));

        let report = orch.run_single(StageName::Load, &CancelSignal::new()).await.unwrap();
        assert_eq!(report.run.status, PipelineStatus::Completed);
        assert_eq!(report.stages.len(), 1);
        assert_eq!(report.stages[0].stage, StageName::Load);
    }

    #[tokio::test]
    async fn test_run_single_unknown_stage() {
        let (orch, _) = orchestrator();
        assert!(matches!(
            orch.run_single(StageName::Enrich, &CancelSignal::new()).await,
            Err(PipelineError::UnknownStage(StageName::Enrich))
        ));
    }

    #[tokio::test]
    async fn test_cancel_before_start_fails_first_stage() {
        let (mut orch, _) = orchestrator();
        let scrape = ScriptedStage::ok(StageName::Scrape);
        let calls = scrape.calls.clone();
        orch.register(Box::new(scrape));
        orch.register(Box::new(ScriptedStage::ok(StageName::Load)));

        let cancel = CancelSignal::new();
        cancel.cancel();
        let report = orch.run(&cancel).await.unwrap();

        assert!(report.is_aborted());
        assert_eq!(report.stages.len(), 1);
        assert_eq!(
            report.stages[0].error_detail.as_deref(),
            Some("Cancelled by operator")
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    /// Stage that loops until cancelled, then records that it wound down.
    struct CooperativeStage {
        started: Arc<AtomicUsize>,
        stopped: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Stage for CooperativeStage {
        fn name(&self) -> StageName {
            StageName::Load
        }

        async fn run(&self, ctx: &StageContext) -> Result<StageReport, HarvestError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            while !ctx.cancel.is_cancelled() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.stopped.fetch_add(1, Ordering::SeqCst);
            Err(HarvestError::Cancelled)
        }
    }

    #[tokio::test]
    async fn test_cancel_waits_for_stage_to_wind_down() {
        let (mut orch, _) = orchestrator();
        let started = Arc::new(AtomicUsize::new(0));
        let stopped = Arc::new(AtomicUsize::new(0));
        orch.register(Box::new(CooperativeStage {
            started: started.clone(),
            stopped: stopped.clone(),
        }));

        let cancel = CancelSignal::new();
        let (report, _) = tokio::join!(orch.run(&cancel), async {
            while started.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            cancel.cancel();
        });

        let report = report.unwrap();
        assert!(report.is_aborted());
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert_eq!(
            report.stages[0].error_detail.as_deref(),
            Some("Cancelled by operator")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_raises_stage_signal() {
        let runs = RunRepository::new(Arc::new(Database::in_memory().unwrap()));
        let mut orch = Orchestrator::new(runs).with_stage_timeout(Some(Duration::from_secs(2)));
        let stopped = Arc::new(AtomicUsize::new(0));
        orch.register(Box::new(CooperativeStage {
            started: Arc::new(AtomicUsize::new(0)),
            stopped: stopped.clone(),
        }));

        let report = orch.run(&CancelSignal::new()).await.unwrap();
        assert_eq!(
            report.stages[0].error_detail.as_deref(),
            Some("Timed out after 2 seconds")
        );
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bookkeeping_failure_closes_run_rows() {
        let db = Arc::new(Database::in_memory().unwrap());
        db.with_conn(|conn| {
            conn.execute_batch(
                "CREATE TRIGGER reject_success BEFORE UPDATE ON stage_runs
                 WHEN NEW.status = 'succeeded'
                 BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
            )
            .map_err(|e| HarvestError::Storage(e.to_string()))
        })
        .unwrap();
        let runs = RunRepository::new(db);
        let mut orch = Orchestrator::new(runs.clone());
        orch.register(Box::new(ScriptedStage::ok(StageName::Scrape)));
        orch.register(Box::new(ScriptedStage::ok(StageName::Load)));

        let err = orch.run(&CancelSignal::new()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Storage(_)));

        let stored = runs.recent_pipeline_runs(1).unwrap();
        assert_eq!(stored[0].status, PipelineStatus::Aborted);
        assert_eq!(stored[0].failed_stage, Some(StageName::Scrape));
        assert!(stored[0].ended_at.is_some());

        let stages = runs.stage_runs_for(stored[0].id).unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].status, StageStatus::Failed);
        assert!(stages[0].error_detail.as_deref().unwrap().contains("disk full"));
    }
}
