//! Test doubles shared by the orchestrator and server tests.
//!
//! [`RecordingStore`] wraps an in-memory [`SqliteRunStore`], journals the
//! calls the orchestrator makes and can inject faults. [`RecordingEvents`]
//! journals events into the same log so tests can assert the relative order
//! of persistence calls and emitted events.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use runway_common::{
    ApprovalRequest, Run, RunKind, RunStep, RunStream, RunStreamEvent, StepStatus, TerminalStatus,
};
use serde_json::{Value, json};

use crate::approvals::ApprovalWaiter;
use crate::config::MergeMethod;
use crate::errors::RunCanceled;
use crate::events::EventWriter;
use crate::integrations::{
    ArtifactStore, ChecksPolicy, ChecksSummary, CodeHost, CommandOutput, InfraClient,
    InfraOutcome, InfraRequest, MergeResult, PlanDraft, PlanRequest, Planner, PullRequest,
    PullRequestSpec, RepoContext, RepoResolver, SandboxFile, SandboxProvider, SandboxSession,
};
use crate::orchestrator::{OrchestratorSettings, RunLauncher, RunOrchestrator};
use crate::steps::{PipelineSettings, StepServices};
use crate::store::{
    ApprovalResolution, ApprovalStore, NewApproval, NewRun, RunStore, SqliteRunStore, StepFinish,
    StepMeta,
};

#[derive(Debug, Clone, PartialEq)]
pub enum StoreCall {
    GetRunInfo(String),
    MarkRunRunning(String),
    MarkRunWaiting(String),
    MarkRunTerminal(String, TerminalStatus),
    BeginRunStep(String, String),
    FinishRunStep(String, String, StepFinish),
    MarkRunStepStatus(String, String, StepStatus),
    CancelRunAndSteps(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Entry {
    Store(StoreCall),
    Event(RunStreamEvent),
    Close(RunStream),
}

#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<Entry>>>);

impl Journal {
    pub fn push(&self, entry: Entry) {
        self.0.lock().unwrap().push(entry);
    }

    pub fn entries(&self) -> Vec<Entry> {
        self.0.lock().unwrap().clone()
    }

    pub fn store_calls(&self) -> Vec<StoreCall> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                Entry::Store(call) => Some(call),
                _ => None,
            })
            .collect()
    }

    pub fn events(&self) -> Vec<RunStreamEvent> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                Entry::Event(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    pub fn closes(&self) -> usize {
        self.entries()
            .iter()
            .filter(|e| matches!(e, Entry::Close(_)))
            .count()
    }

    pub fn clear(&self) {
        self.0.lock().unwrap().clear();
    }
}

/// Compact `type:step:status` rendering of events for sequence assertions.
pub fn describe(event: &RunStreamEvent) -> String {
    match event {
        RunStreamEvent::RunStarted { .. } => "run-started".to_string(),
        RunStreamEvent::StepStarted { step_id, .. } => format!("step-started:{}", step_id),
        RunStreamEvent::StepFinished {
            step_id, status, ..
        } => format!("step-finished:{}:{}", step_id, status),
        RunStreamEvent::RunFinished { status, .. } => format!("run-finished:{}", status),
    }
}

pub struct RecordingStore {
    inner: SqliteRunStore,
    journal: Journal,
    cancel_on_get_run_info: AtomicBool,
    fail_finish: Mutex<Option<(String, StepStatus)>>,
}

impl RecordingStore {
    pub fn new(inner: SqliteRunStore, journal: Journal) -> Self {
        Self {
            inner,
            journal,
            cancel_on_get_run_info: AtomicBool::new(false),
            fail_finish: Mutex::new(None),
        }
    }

    pub fn inner(&self) -> &SqliteRunStore {
        &self.inner
    }

    /// Make `get_run_info` raise a cancellation.
    pub fn cancel_on_get_run_info(&self) {
        self.cancel_on_get_run_info.store(true, Ordering::SeqCst);
    }

    /// Make `finish_run_step` fail when it records `status` for `step_id`.
    pub fn fail_finish(&self, step_id: &str, status: StepStatus) {
        *self.fail_finish.lock().unwrap() = Some((step_id.to_string(), status));
    }

    fn record(&self, call: StoreCall) {
        self.journal.push(Entry::Store(call));
    }
}

#[async_trait]
impl RunStore for RecordingStore {
    async fn create_run(&self, new_run: NewRun) -> Result<Run> {
        self.inner.create_run(new_run).await
    }

    async fn get_run_info(&self, run_id: &str) -> Result<Run> {
        self.record(StoreCall::GetRunInfo(run_id.to_string()));
        if self.cancel_on_get_run_info.load(Ordering::SeqCst) {
            return Err(RunCanceled::requested(run_id).into());
        }
        self.inner.get_run_info(run_id).await
    }

    async fn list_runs(&self, limit: usize) -> Result<Vec<Run>> {
        self.inner.list_runs(limit).await
    }

    async fn list_unfinished_runs(&self) -> Result<Vec<Run>> {
        self.inner.list_unfinished_runs().await
    }

    async fn list_run_steps(&self, run_id: &str) -> Result<Vec<RunStep>> {
        self.inner.list_run_steps(run_id).await
    }

    async fn mark_run_running(&self, run_id: &str) -> Result<()> {
        self.record(StoreCall::MarkRunRunning(run_id.to_string()));
        self.inner.mark_run_running(run_id).await
    }

    async fn mark_run_waiting(&self, run_id: &str) -> Result<()> {
        self.record(StoreCall::MarkRunWaiting(run_id.to_string()));
        self.inner.mark_run_waiting(run_id).await
    }

    async fn mark_run_terminal(&self, run_id: &str, status: TerminalStatus) -> Result<()> {
        self.record(StoreCall::MarkRunTerminal(run_id.to_string(), status));
        self.inner.mark_run_terminal(run_id, status).await
    }

    async fn ensure_run_step_row(&self, run_id: &str, meta: &StepMeta) -> Result<RunStep> {
        self.inner.ensure_run_step_row(run_id, meta).await
    }

    async fn begin_run_step(&self, run_id: &str, step_id: &str) -> Result<()> {
        self.record(StoreCall::BeginRunStep(run_id.to_string(), step_id.to_string()));
        self.inner.begin_run_step(run_id, step_id).await
    }

    async fn finish_run_step(&self, run_id: &str, step_id: &str, finish: StepFinish) -> Result<()> {
        self.record(StoreCall::FinishRunStep(
            run_id.to_string(),
            step_id.to_string(),
            finish.clone(),
        ));
        let injected = self
            .fail_finish
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|(id, status)| id == step_id && *status == finish.status);
        if injected {
            return Err(anyhow!("database is locked"));
        }
        self.inner.finish_run_step(run_id, step_id, finish).await
    }

    async fn mark_run_step_status(
        &self,
        run_id: &str,
        step_id: &str,
        status: StepStatus,
        outputs: Option<Value>,
    ) -> Result<()> {
        self.record(StoreCall::MarkRunStepStatus(
            run_id.to_string(),
            step_id.to_string(),
            status,
        ));
        self.inner
            .mark_run_step_status(run_id, step_id, status, outputs)
            .await
    }

    async fn cancel_run_and_steps(&self, run_id: &str) -> Result<()> {
        self.record(StoreCall::CancelRunAndSteps(run_id.to_string()));
        self.inner.cancel_run_and_steps(run_id).await
    }

    async fn request_cancel(&self, run_id: &str) -> Result<bool> {
        self.inner.request_cancel(run_id).await
    }

    async fn is_cancel_requested(&self, run_id: &str) -> Result<bool> {
        self.inner.is_cancel_requested(run_id).await
    }
}

#[async_trait]
impl ApprovalStore for RecordingStore {
    async fn ensure_approval_request(&self, request: NewApproval) -> Result<ApprovalRequest> {
        self.inner.ensure_approval_request(request).await
    }

    async fn get_approval(&self, approval_id: &str) -> Result<Option<ApprovalRequest>> {
        self.inner.get_approval(approval_id).await
    }

    async fn list_approvals(
        &self,
        run_id: Option<&str>,
        pending_only: bool,
    ) -> Result<Vec<ApprovalRequest>> {
        self.inner.list_approvals(run_id, pending_only).await
    }

    async fn resolve_approval(
        &self,
        approval_id: &str,
        resolution: ApprovalResolution,
    ) -> Result<ApprovalRequest> {
        self.inner.resolve_approval(approval_id, resolution).await
    }
}

pub struct RecordingEvents {
    journal: Journal,
}

impl RecordingEvents {
    pub fn new(journal: Journal) -> Self {
        Self { journal }
    }
}

#[async_trait]
impl EventWriter for RecordingEvents {
    async fn write_run_event(&self, _stream: &RunStream, event: &RunStreamEvent) -> Result<()> {
        self.journal.push(Entry::Event(event.clone()));
        Ok(())
    }

    async fn close_run_stream(&self, stream: &RunStream) -> Result<()> {
        self.journal.push(Entry::Close(stream.clone()));
        Ok(())
    }
}

pub fn repo_context() -> RepoContext {
    RepoContext {
        owner: "acme".into(),
        name: "web".into(),
        clone_url: "https://github.com/acme/web.git".into(),
        default_branch: "main".into(),
    }
}

pub struct FakeRepos;

#[async_trait]
impl RepoResolver for FakeRepos {
    fn repository_slug(&self, project_id: &str) -> Option<String> {
        (project_id == "web").then(|| "acme/web".to_string())
    }

    async fn resolve(&self, project_id: &str) -> Result<RepoContext> {
        self.repository_slug(project_id)
            .map(|_| repo_context())
            .ok_or_else(|| anyhow!("unknown project {}", project_id))
    }
}

/// Behavior knobs and counters shared by every fake sandbox session.
#[derive(Default)]
pub struct SandboxState {
    pub commands: Mutex<Vec<String>>,
    pub created: AtomicUsize,
    pub attached: AtomicUsize,
    pub stopped: AtomicUsize,
    pub fail_command: Mutex<Option<String>>,
    pub empty_patch: AtomicBool,
    pub fail_stop: AtomicBool,
}

impl SandboxState {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[derive(Default)]
pub struct FakeSandboxes {
    pub state: Arc<SandboxState>,
}

#[async_trait]
impl SandboxProvider for FakeSandboxes {
    async fn create(&self, _run_id: &str) -> Result<Arc<dyn SandboxSession>> {
        let n = self.state.created.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSandbox {
            id: format!("sbx_{}", n + 1),
            state: self.state.clone(),
        }))
    }

    async fn attach(&self, sandbox_id: &str) -> Result<Arc<dyn SandboxSession>> {
        self.state.attached.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSandbox {
            id: sandbox_id.to_string(),
            state: self.state.clone(),
        }))
    }
}

struct FakeSandbox {
    id: String,
    state: Arc<SandboxState>,
}

#[async_trait]
impl SandboxSession for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    fn workdir(&self) -> &str {
        "/workspace"
    }

    async fn run_command(&self, command: &str) -> Result<CommandOutput> {
        self.state.commands.lock().unwrap().push(command.to_string());
        let failing = self
            .state
            .fail_command
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|needle| command.contains(needle.as_str()));
        if failing {
            return Ok(CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "3 tests failed".into(),
            });
        }
        let stdout = if command.contains("status --porcelain")
            && !self.state.empty_patch.load(Ordering::SeqCst)
        {
            "M  src/lib.rs\n".to_string()
        } else {
            String::new()
        };
        Ok(CommandOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }

    async fn write_files(&self, files: &[SandboxFile]) -> Result<()> {
        for file in files {
            self.state
                .commands
                .lock()
                .unwrap()
                .push(format!("write {}", file.path));
        }
        Ok(())
    }

    async fn finalize(&self) -> Result<String> {
        Ok("abc123".into())
    }

    async fn stop(&self) -> Result<()> {
        self.state.stopped.fetch_add(1, Ordering::SeqCst);
        if self.state.fail_stop.load(Ordering::SeqCst) {
            return Err(anyhow!("docker daemon unreachable"));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakePlanner {
    pub calls: AtomicUsize,
    /// Park every call until the caller is dropped.
    pub hold: AtomicBool,
}

#[async_trait]
impl Planner for FakePlanner {
    async fn plan(&self, request: &PlanRequest) -> Result<PlanDraft> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hold.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        Ok(PlanDraft {
            plan_markdown: format!("# Plan\n\n{}", request.intent),
            pr_title: "Add health check".into(),
            pr_body: "Adds /health".into(),
            commit_message: "Add health check".into(),
        })
    }
}

#[derive(Default)]
pub struct FakeCodeHost {
    pub opened: Mutex<Vec<PullRequestSpec>>,
    pub merges: AtomicUsize,
    pub fail_checks: Mutex<Option<Vec<String>>>,
}

#[async_trait]
impl CodeHost for FakeCodeHost {
    async fn open_pull_request(
        &self,
        repo: &RepoContext,
        spec: &PullRequestSpec,
    ) -> Result<PullRequest> {
        self.opened.lock().unwrap().push(spec.clone());
        Ok(PullRequest {
            number: 7,
            url: format!("https://github.com/{}/pull/7", repo.full_name()),
            head_sha: "abc123".into(),
            head_branch: spec.head.clone(),
        })
    }

    async fn poll_checks_until_terminal(
        &self,
        _repo: &RepoContext,
        _sha: &str,
        _policy: &ChecksPolicy,
    ) -> Result<ChecksSummary> {
        if let Some(failed) = self.fail_checks.lock().unwrap().clone() {
            return Err(crate::errors::StepFailure::ChecksFailed { failed }.into());
        }
        Ok(ChecksSummary {
            total: 0,
            checks: vec![],
        })
    }

    async fn merge_pull_request(
        &self,
        _repo: &RepoContext,
        _number: u64,
        _method: MergeMethod,
    ) -> Result<MergeResult> {
        self.merges.fetch_add(1, Ordering::SeqCst);
        Ok(MergeResult {
            merged: true,
            sha: Some("def456".into()),
            message: "Pull Request successfully merged".into(),
        })
    }
}

#[derive(Default)]
pub struct FakeInfra {
    pub requests: Mutex<Vec<(String, InfraRequest)>>,
}

#[async_trait]
impl InfraClient for FakeInfra {
    async fn provision(&self, request: &InfraRequest) -> Result<InfraOutcome> {
        self.requests
            .lock()
            .unwrap()
            .push(("provision".into(), request.clone()));
        Ok(InfraOutcome {
            operation: "provision".into(),
            environment: request.environment.clone(),
            response: json!({ "ok": true }),
        })
    }

    async fn deploy(&self, request: &InfraRequest) -> Result<InfraOutcome> {
        self.requests
            .lock()
            .unwrap()
            .push(("deploy".into(), request.clone()));
        Ok(InfraOutcome {
            operation: "deploy".into(),
            environment: request.environment.clone(),
            response: json!({ "ok": true }),
        })
    }
}

#[derive(Default)]
pub struct FakeArtifacts {
    pub fail_with: Mutex<Option<String>>,
    pub saved: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl ArtifactStore for FakeArtifacts {
    async fn save_run_summary(&self, run_id: &str, markdown: &str) -> Result<String> {
        if let Some(message) = self.fail_with.lock().unwrap().clone() {
            return Err(anyhow!(message));
        }
        self.saved
            .lock()
            .unwrap()
            .push((run_id.to_string(), markdown.to_string()));
        Ok(format!("/artifacts/{}/summary.md", run_id))
    }
}

pub fn pipeline_settings() -> PipelineSettings {
    PipelineSettings {
        github_token_configured: true,
        branch_prefix: "runway/".into(),
        patch_command: "apply-plan".into(),
        verify_commands: vec!["cargo test".into()],
        environment: "production".into(),
        merge_method: MergeMethod::Squash,
        checks: ChecksPolicy {
            timeout: Duration::from_secs(5),
            interval: Duration::from_millis(10),
        },
    }
}

/// An orchestrator over an in-memory database and fake collaborators.
pub struct Harness {
    pub db: SqliteRunStore,
    pub store: Arc<RecordingStore>,
    pub journal: Journal,
    pub approvals: ApprovalWaiter,
    pub sandboxes: Arc<FakeSandboxes>,
    pub planner: Arc<FakePlanner>,
    pub code_host: Arc<FakeCodeHost>,
    pub infra: Arc<FakeInfra>,
    pub artifacts: Arc<FakeArtifacts>,
    pub orchestrator: Arc<RunOrchestrator>,
    pub launcher: RunLauncher,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(pipeline_settings())
    }

    pub fn with_settings(settings: PipelineSettings) -> Self {
        Self::over(SqliteRunStore::in_memory().unwrap(), settings)
    }

    /// A fresh process over an existing database.
    pub fn over(db: SqliteRunStore, settings: PipelineSettings) -> Self {
        let journal = Journal::default();
        let store = Arc::new(RecordingStore::new(db.clone(), journal.clone()));
        let events = Arc::new(RecordingEvents::new(journal.clone()));
        let approvals = ApprovalWaiter::new(store.clone(), Duration::from_millis(20));
        let sandboxes = Arc::new(FakeSandboxes::default());
        let planner = Arc::new(FakePlanner::default());
        let code_host = Arc::new(FakeCodeHost::default());
        let infra = Arc::new(FakeInfra::default());
        let artifacts = Arc::new(FakeArtifacts::default());

        let services = StepServices {
            repos: Arc::new(FakeRepos),
            code_host: code_host.clone(),
            sandboxes: sandboxes.clone(),
            planner: planner.clone(),
            infra: infra.clone(),
            artifacts: artifacts.clone(),
            settings,
        };
        let orchestrator = Arc::new(RunOrchestrator::new(
            store.clone(),
            events,
            approvals.clone(),
            Arc::new(services),
            OrchestratorSettings {
                cancel_poll: Duration::from_millis(20),
            },
        ));
        let launcher = RunLauncher::new(orchestrator.clone());

        Self {
            db,
            store,
            journal,
            approvals,
            sandboxes,
            planner,
            code_host,
            infra,
            artifacts,
            orchestrator,
            launcher,
        }
    }

    pub async fn create_run(&self, kind: RunKind) -> Run {
        self.db
            .create_run(NewRun {
                kind,
                project_id: "web".into(),
                intent: "Add a /health endpoint".into(),
            })
            .await
            .unwrap()
    }

    pub async fn run(&self, run_id: &str) -> Run {
        self.db.get_run_info(run_id).await.unwrap()
    }

    pub async fn step(&self, run_id: &str, step_id: &str) -> Option<RunStep> {
        self.db
            .list_run_steps(run_id)
            .await
            .unwrap()
            .into_iter()
            .find(|s| s.step_id == step_id)
    }

    pub fn event_log(&self) -> Vec<String> {
        self.journal.events().iter().map(describe).collect()
    }

    /// Poll until the run has a pending approval for `scope`.
    pub async fn pending_approval(&self, run_id: &str, scope: &str) -> ApprovalRequest {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let pending = self.db.list_approvals(Some(run_id), true).await.unwrap();
            if let Some(request) = pending.into_iter().find(|a| a.scope == scope) {
                return request;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "no pending {} approval for {}",
                scope,
                run_id
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Wait until the planner has been called `count` times.
    pub async fn planner_called(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.planner.calls.load(Ordering::SeqCst) < count {
            assert!(
                tokio::time::Instant::now() < deadline,
                "planner was not called {} time(s)",
                count
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn approve(&self, run_id: &str, scope: &str) -> ApprovalRequest {
        let request = self.pending_approval(run_id, scope).await;
        self.approvals
            .resolve(
                &request.approval_id,
                ApprovalResolution::Approve { by: "alice".into() },
            )
            .await
            .unwrap()
    }
}
