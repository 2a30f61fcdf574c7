//! Generation orchestration: per-target inline retry, the batch worker pool,
//! structured outcome events, offline retry, display bundles and progress.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, info_span, warn, Instrument};
use urico_core::{
    Axis, BundleEntry, BundleRecord, BuyerEntry, DataKind, MasterGeography, Target, TargetFilter,
    FORBIDDEN_KEYS, HIDDEN_DETAIL_SCHEMA, SCHEMA_VERSION_KEY,
};
use urico_generator::{
    parse_and_validate, CommandGenerator, GenerationError, Generator, GeneratorProfile,
    PromptBuilder, TemplateSet,
};
use urico_storage::{
    write_atomic, CommitOutcome, LockManager, LockPolicy, OutputLocator, TargetStore,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "urico-sync";

pub const ANNOUNCE_GLYPH: &str = "🎯";
pub const SUCCESS_MARKER: &str = "✅ 生成成功";
pub const SKIP_MARKER: &str = "⏭️  スキップ";
pub const FAILURE_GLYPH: &str = "❌";
pub const FAILURE_MARKER: &str = "❌ 生成失敗";
pub const EXHAUSTED_MARKER: &str = "最大リトライ回数を超えました";
pub const CREDIT_WARNING: &str = "⚠️  クレジット残高が不足しています";
pub const SUMMARY_MARKER: &str = "📊 生成結果サマリー";
pub const COMPLETE_SENTINEL: &str = "🎉 一括生成完了！";

pub const LEGACY_LOOKBACK_LINES: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    pub fn delay_for_attempt(&self, attempt_index: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt_index).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub master_path: PathBuf,
    pub templates_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub generator_profile_path: PathBuf,
    pub retry: RetryPolicy,
    /// Pause after each target that invoked the generation tool.
    pub delay: Duration,
    pub concurrency: usize,
    pub timeout: Option<Duration>,
    pub lock_policy: LockPolicy,
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

impl SyncConfig {
    /// Defaults laid out under `root`: `data/`, `data/.locks`, `templates/`.
    pub fn for_workspace(root: impl Into<PathBuf>) -> Self {
        let workspace_root = root.into();
        let data_dir = workspace_root.join("data");
        Self {
            master_path: data_dir.join("kinki_master.json"),
            lock_dir: data_dir.join(".locks"),
            templates_dir: workspace_root.join("templates"),
            generator_profile_path: workspace_root.join("generator.yaml"),
            data_dir,
            workspace_root,
            retry: RetryPolicy::default(),
            delay: Duration::from_secs(10),
            concurrency: 1,
            timeout: None,
            lock_policy: LockPolicy::default(),
        }
    }

    pub fn from_env() -> Self {
        Self::from_env_with_root(None)
    }

    /// Like [`SyncConfig::from_env`], but an explicit `root` wins over
    /// `URICO_WORKSPACE_ROOT`.
    pub fn from_env_with_root(root: Option<PathBuf>) -> Self {
        let root = root
            .or_else(|| std::env::var("URICO_WORKSPACE_ROOT").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("."));
        let mut config = Self::for_workspace(root);

        if let Ok(dir) = std::env::var("URICO_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
            config.master_path = config.data_dir.join("kinki_master.json");
            config.lock_dir = config.data_dir.join(".locks");
        }
        if let Ok(path) = std::env::var("URICO_MASTER_PATH") {
            config.master_path = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("URICO_TEMPLATES_DIR") {
            config.templates_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("URICO_LOCK_DIR") {
            config.lock_dir = PathBuf::from(dir);
        }
        if let Some(max_retries) = env_parse("URICO_MAX_RETRIES") {
            config.retry.max_retries = max_retries;
        }
        if let Some(secs) = env_parse("URICO_DELAY_SECS") {
            config.delay = Duration::from_secs(secs);
        }
        if let Some(concurrency) = env_parse::<usize>("URICO_CONCURRENCY") {
            config.concurrency = concurrency.max(1);
        }
        config.timeout = env_parse("URICO_TIMEOUT_SECS").map(Duration::from_secs);
        if let Some(ms) = env_parse("URICO_LOCK_POLL_MS") {
            config.lock_policy.poll_interval = Duration::from_millis(ms);
        }
        if let Some(polls) = env_parse("URICO_LOCK_MAX_POLLS") {
            config.lock_policy.max_polls = polls;
        }
        config
    }

    pub fn outcomes_path(&self) -> PathBuf {
        self.data_dir.join("outcomes.jsonl")
    }

    pub fn locator(&self) -> OutputLocator {
        OutputLocator::new(&self.data_dir)
    }

    pub fn target_store(&self) -> TargetStore {
        TargetStore::new(
            self.locator(),
            LockManager::new(&self.lock_dir, self.lock_policy),
        )
    }

    pub fn load_geography(&self) -> Result<MasterGeography> {
        MasterGeography::load(&self.master_path).with_context(|| {
            format!("loading master geography {}", self.master_path.display())
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    AlreadyGenerated,
    /// Another worker committed the output while this one was generating.
    CompletedElsewhere,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetOutcome {
    Generated {
        path: PathBuf,
        records: usize,
        attempts: u32,
    },
    Skipped {
        path: PathBuf,
        reason: SkipReason,
    },
}

/// Prompt -> generator -> validate -> commit for one target at a time.
pub struct TargetPipeline {
    geography: Arc<MasterGeography>,
    prompts: PromptBuilder,
    generator: Arc<dyn Generator>,
    store: TargetStore,
    retry: RetryPolicy,
}

impl TargetPipeline {
    pub fn new(
        geography: Arc<MasterGeography>,
        prompts: PromptBuilder,
        generator: Arc<dyn Generator>,
        store: TargetStore,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            geography,
            prompts,
            generator,
            store,
            retry,
        }
    }

    /// Wires the subprocess generator described by `generator.yaml`. An
    /// explicit config timeout wins over the profile's.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let geography = config.load_geography()?;
        let profile = GeneratorProfile::load_or_default(&config.generator_profile_path)?;
        let timeout = config.timeout.or(profile.timeout());
        let generator = CommandGenerator::new(profile).with_timeout(timeout);
        Ok(Self::new(
            Arc::new(geography),
            PromptBuilder::new(TemplateSet::new(&config.templates_dir)),
            Arc::new(generator),
            config.target_store(),
            config.retry,
        ))
    }

    pub fn geography(&self) -> &MasterGeography {
        &self.geography
    }

    pub fn store(&self) -> &TargetStore {
        &self.store
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub async fn run_target(
        &self,
        target: &Target,
        force: bool,
    ) -> Result<TargetOutcome, GenerationError> {
        let span = info_span!(
            "target",
            kind = %target.kind,
            axis = %target.axis(),
            label = %target.label()
        );
        self.drive(target, force).instrument(span).await
    }

    async fn drive(&self, target: &Target, force: bool) -> Result<TargetOutcome, GenerationError> {
        self.geography.validate(target)?;
        if force && self.store.remove(target).await? {
            info!("removed existing output before forced regeneration");
        }

        let path = self.store.path_for(target);
        if self.store.is_generated(target).await? {
            info!(path = %path.display(), "already generated; skipping");
            return Ok(TargetOutcome::Skipped {
                path,
                reason: SkipReason::AlreadyGenerated,
            });
        }

        let prompt = self.prompts.build(&self.geography, target)?;
        let (mut records, attempts) = self.generate_validated(target, &prompt).await?;
        urico_core::stamp_schema_version(&mut records);

        match self.store.commit(target, &records).await? {
            CommitOutcome::Written { path, records } => {
                info!(path = %path.display(), records, attempts, "output committed");
                Ok(TargetOutcome::Generated {
                    path,
                    records,
                    attempts,
                })
            }
            CommitOutcome::AlreadyDone { path } => {
                info!(path = %path.display(), "output appeared while generating; discarding");
                Ok(TargetOutcome::Skipped {
                    path,
                    reason: SkipReason::CompletedElsewhere,
                })
            }
        }
    }

    async fn generate_validated(
        &self,
        target: &Target,
        prompt: &str,
    ) -> Result<(Vec<JsonValue>, u32), GenerationError> {
        let max_attempts = self.retry.max_attempts();
        for attempt in 1..=max_attempts {
            debug!(attempt, max_attempts, generator = self.generator.name(), "invoking generator");
            let result = match self.generator.generate(prompt).await {
                Ok(output) => parse_and_validate(target, &output),
                Err(err) => Err(err),
            };
            let err = match result {
                Ok(records) => return Ok((records, attempt)),
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };
            if err.is_credit_exhausted() {
                warn!("generation tool reports an exhausted credit balance");
            }
            if attempt == max_attempts {
                error!(attempt, error = %err, "giving up on target");
                return Err(GenerationError::ExhaustedRetries {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }
            warn!(attempt, max_attempts, error = %err, "attempt failed; retrying");
            let delay = self.retry.delay_for_attempt(attempt - 1);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }
        unreachable!("retry loop returns on its final attempt")
    }
}

/// Whether a target's run reached the generation tool at least once.
fn invoked_generator(result: &Result<TargetOutcome, GenerationError>) -> bool {
    matches!(
        result,
        Ok(TargetOutcome::Generated { .. })
            | Ok(TargetOutcome::Skipped {
                reason: SkipReason::CompletedElsewhere,
                ..
            })
            | Err(GenerationError::ExhaustedRetries { .. })
            | Err(GenerationError::LockTimeout { .. })
            | Err(GenerationError::Storage(_))
    )
}

fn attempts_of(result: &Result<TargetOutcome, GenerationError>) -> u32 {
    match result {
        Ok(TargetOutcome::Generated { attempts, .. }) => *attempts,
        Err(GenerationError::ExhaustedRetries { attempts, .. }) => *attempts,
        other if invoked_generator(other) => 1,
        _ => 0,
    }
}

/// Human-readable run log carrying the stable markers operators grep for.
pub struct RunLog {
    sink: Mutex<Box<dyn Write + Send>>,
}

impl RunLog {
    pub fn new(sink: impl Write + Send + 'static) -> Self {
        Self {
            sink: Mutex::new(Box::new(sink)),
        }
    }

    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }

    /// Writes `lines` contiguously so concurrent workers never interleave.
    pub fn block(&self, lines: &[String]) {
        let Ok(mut sink) = self.sink.lock() else {
            return;
        };
        for line in lines {
            if let Err(err) = writeln!(sink, "{line}") {
                warn!(error = %err, "run log write failed");
                return;
            }
        }
        let _ = sink.flush();
    }
}

pub fn announce_line(index: usize, total: usize, target: &Target) -> String {
    format!("{ANNOUNCE_GLYPH} [{index}/{total}] {}", target.label())
}

fn single_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" | ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Generated,
    Skipped,
    Failed,
}

/// One line of `outcomes.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeEvent {
    pub run_id: Uuid,
    pub at: DateTime<Utc>,
    pub target: Target,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub attempts: u32,
}

impl OutcomeEvent {
    fn from_result(
        run_id: Uuid,
        target: &Target,
        result: &Result<TargetOutcome, GenerationError>,
    ) -> Self {
        let (status, error_code, reason) = match result {
            Ok(TargetOutcome::Generated { .. }) => (OutcomeStatus::Generated, None, None),
            Ok(TargetOutcome::Skipped { reason, .. }) => (
                OutcomeStatus::Skipped,
                None,
                Some(format!("{reason:?}")),
            ),
            Err(err) => (
                OutcomeStatus::Failed,
                Some(err.code().to_string()),
                Some(err.to_string()),
            ),
        };
        Self {
            run_id,
            at: Utc::now(),
            target: target.clone(),
            status,
            error_code,
            reason,
            attempts: attempts_of(result),
        }
    }
}

/// Append-only JSON-lines event log, the primary input to offline retry.
pub struct OutcomeLog {
    path: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl OutcomeLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, event: &OutcomeEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("appending to {}", self.path.display()))?;
        file.flush().await?;
        Ok(())
    }

    /// A missing log reads as empty. Unparseable lines are skipped with a warning.
    pub async fn read_all(&self) -> Result<Vec<OutcomeEvent>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        };
        let mut events = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(event) => events.push(event),
                Err(err) => warn!(line = idx + 1, error = %err, "skipping unreadable outcome event"),
            }
        }
        Ok(events)
    }
}

/// Targets whose latest recorded status is a failure, in first-seen order.
pub fn failed_targets(events: &[OutcomeEvent]) -> Vec<Target> {
    let mut order = Vec::new();
    let mut latest: HashMap<String, (&Target, OutcomeStatus)> = HashMap::new();
    for event in events {
        let key = event.target.key();
        if !latest.contains_key(&key) {
            order.push(key.clone());
        }
        latest.insert(key, (&event.target, event.status));
    }
    order
        .into_iter()
        .filter_map(|key| latest.get(&key))
        .filter(|(_, status)| *status == OutcomeStatus::Failed)
        .map(|(target, _)| (*target).clone())
        .collect()
}

/// Drops repeated targets, keeping the first occurrence.
pub fn dedup_targets(targets: impl IntoIterator<Item = Target>) -> Vec<Target> {
    let mut seen = HashSet::new();
    targets
        .into_iter()
        .filter(|t| seen.insert(t.key()))
        .collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureDetail {
    pub target: Target,
    pub label: String,
    pub code: String,
    pub reason: String,
    pub credit_exhausted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total: usize,
    pub generated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub failures: Vec<FailureDetail>,
}

impl BatchSummary {
    /// Every attempted target failed. An empty batch is not a failure.
    pub fn all_failed(&self) -> bool {
        self.failed > 0 && self.generated + self.skipped == 0
    }

    pub fn credit_exhausted(&self) -> bool {
        self.failures.iter().any(|f| f.credit_exhausted)
    }

    pub fn render_lines(&self) -> Vec<String> {
        let mut lines = vec![
            String::new(),
            SUMMARY_MARKER.to_string(),
            format!("  run: {}", self.run_id),
            format!("  総数: {}", self.total),
            format!("  成功: {}", self.generated),
            format!("  スキップ: {}", self.skipped),
            format!("  失敗: {}", self.failed),
            format!(
                "  所要時間: {}秒",
                (self.finished_at - self.started_at).num_seconds()
            ),
        ];
        if !self.failures.is_empty() {
            lines.push("  失敗したターゲット:".to_string());
            for failure in &self.failures {
                lines.push(format!("    - {} [{}]", failure.label, failure.code));
            }
        }
        if self.credit_exhausted() {
            lines.push(CREDIT_WARNING.to_string());
        }
        lines.push(String::new());
        lines.push(COMPLETE_SENTINEL.to_string());
        lines
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub concurrency: usize,
    pub delay: Duration,
    pub force: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            delay: Duration::from_secs(10),
            force: false,
        }
    }
}

impl BatchOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            delay: config.delay,
            force: false,
        }
    }

    /// Offline retry: sequential and always regenerating.
    pub fn for_retry(delay: Duration) -> Self {
        Self {
            concurrency: 1,
            delay,
            force: true,
        }
    }
}

struct Recorder {
    run_id: Uuid,
    total: usize,
    run_log: Arc<RunLog>,
    outcomes: Option<Arc<OutcomeLog>>,
}

impl Recorder {
    async fn record(
        &self,
        index: usize,
        target: &Target,
        result: &Result<TargetOutcome, GenerationError>,
    ) {
        let mut lines = vec![announce_line(index + 1, self.total, target)];
        match result {
            Ok(TargetOutcome::Generated { path, records, .. }) => {
                lines.push(format!("{SUCCESS_MARKER}: {} ({records}件)", path.display()));
            }
            Ok(TargetOutcome::Skipped { path, .. }) => {
                lines.push(format!("{SKIP_MARKER}: {}", path.display()));
            }
            Err(err) => {
                error!(label = %target.label(), code = err.code(), error = %err, "target failed");
                let cause = match err {
                    GenerationError::ExhaustedRetries { last, .. } => last.as_ref(),
                    other => other,
                };
                let exit = match cause {
                    GenerationError::GenerationFailed {
                        exit_code: Some(code),
                        ..
                    } => format!(" (終了コード: {code})"),
                    _ => String::new(),
                };
                lines.push(format!(
                    "{FAILURE_MARKER}{exit} [{}] {}",
                    err.code(),
                    single_line(&err.to_string())
                ));
                if matches!(err, GenerationError::ExhaustedRetries { .. }) {
                    lines.push(format!("   {EXHAUSTED_MARKER}"));
                }
                if err.is_credit_exhausted() {
                    lines.push(CREDIT_WARNING.to_string());
                }
            }
        }
        self.run_log.block(&lines);

        if let Some(outcomes) = &self.outcomes {
            let event = OutcomeEvent::from_result(self.run_id, target, result);
            if let Err(err) = outcomes.append(&event).await {
                warn!(error = %err, path = %outcomes.path().display(), "failed to record outcome event");
            }
        }
    }
}

/// Bounded worker pool over a target list. Each worker owns its target end to
/// end; the run log and outcome log are the only shared sinks.
pub struct BatchRunner {
    pipeline: Arc<TargetPipeline>,
    options: BatchOptions,
    run_log: Arc<RunLog>,
    outcomes: Option<Arc<OutcomeLog>>,
}

impl BatchRunner {
    pub fn new(pipeline: Arc<TargetPipeline>, options: BatchOptions) -> Self {
        Self {
            pipeline,
            options,
            run_log: Arc::new(RunLog::stdout()),
            outcomes: None,
        }
    }

    pub fn with_run_log(mut self, run_log: Arc<RunLog>) -> Self {
        self.run_log = run_log;
        self
    }

    pub fn with_outcome_log(mut self, outcomes: Arc<OutcomeLog>) -> Self {
        self.outcomes = Some(outcomes);
        self
    }

    pub async fn run(&self, targets: Vec<Target>) -> BatchSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "batch",
            %run_id,
            total = targets.len(),
            concurrency = self.options.concurrency
        );
        self.run_inner(run_id, targets).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid, targets: Vec<Target>) -> BatchSummary {
        let started_at = Utc::now();
        let total = targets.len();
        info!(force = self.options.force, "batch started");

        let recorder = Arc::new(Recorder {
            run_id,
            total,
            run_log: Arc::clone(&self.run_log),
            outcomes: self.outcomes.clone(),
        });
        let semaphore = Arc::new(Semaphore::new(self.options.concurrency.max(1)));
        let mut handles = Vec::with_capacity(total);

        for (index, target) in targets.into_iter().enumerate() {
            let permit = Arc::clone(&semaphore)
                .acquire_owned()
                .await
                .expect("semaphore not closed");
            let pipeline = Arc::clone(&self.pipeline);
            let recorder = Arc::clone(&recorder);
            let BatchOptions { delay, force, .. } = self.options;
            let is_last = index + 1 == total;
            let task_target = target.clone();
            let handle = tokio::spawn(
                async move {
                    let result = pipeline.run_target(&task_target, force).await;
                    recorder.record(index, &task_target, &result).await;
                    if invoked_generator(&result) && !is_last && !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    drop(permit);
                    result
                }
                .in_current_span(),
            );
            handles.push((target, handle));
        }

        let mut summary = BatchSummary {
            run_id,
            started_at,
            finished_at: started_at,
            total,
            generated: 0,
            skipped: 0,
            failed: 0,
            failures: Vec::new(),
        };
        for (target, handle) in handles {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) => {
                    error!(label = %target.label(), error = %join_err, "worker task aborted");
                    summary.failed += 1;
                    summary.failures.push(FailureDetail {
                        label: target.label(),
                        target,
                        code: "WorkerAborted".to_string(),
                        reason: join_err.to_string(),
                        credit_exhausted: false,
                    });
                    continue;
                }
            };
            match result {
                Ok(TargetOutcome::Generated { .. }) => summary.generated += 1,
                Ok(TargetOutcome::Skipped { .. }) => summary.skipped += 1,
                Err(err) => {
                    summary.failed += 1;
                    summary.failures.push(FailureDetail {
                        label: target.label(),
                        target,
                        code: err.code().to_string(),
                        reason: err.to_string(),
                        credit_exhausted: err.is_credit_exhausted(),
                    });
                }
            }
        }
        summary.finished_at = Utc::now();
        info!(
            generated = summary.generated,
            skipped = summary.skipped,
            failed = summary.failed,
            "batch finished"
        );
        self.run_log.block(&summary.render_lines());
        summary
    }
}

/// A failed target recovered from a legacy human-readable run log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyFailure {
    pub target: Target,
    /// 1-based line numbers.
    pub announce_line: usize,
    pub failure_line: usize,
}

fn announce_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"🎯\s*\[(\d+)/(\d+)\]\s*(.+)$").expect("announce pattern is valid")
    })
}

fn exit_code_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(?:終了コード|exit code)\s*[:：]?\s*[1-9]").expect("exit code pattern is valid")
    })
}

/// Any cross-mark line counts, including spawn errors such as `❌ エラー: ...`.
pub fn is_failure_line(line: &str) -> bool {
    line.contains(FAILURE_GLYPH)
        || line.contains(EXHAUSTED_MARKER)
        || line.to_ascii_lowercase().contains("max retries exceeded")
        || exit_code_pattern().is_match(line)
}

/// `rail > line > station` is tried before `prefecture > city`.
pub fn parse_label(kind: DataKind, label: &str) -> Option<Target> {
    let parts = label.trim().split(" > ").map(str::trim).collect::<Vec<_>>();
    if parts.iter().any(|p| p.is_empty()) {
        return None;
    }
    match parts.as_slice() {
        [rail_company, line, station] => Some(Target::station(kind, *rail_company, *line, *station)),
        [prefecture, city] => Some(Target::area(kind, *prefecture, *city)),
        _ => None,
    }
}

/// Compatibility shim over the old free-text logs. Structured outcome events
/// are preferred whenever they exist.
#[derive(Debug, Clone, Copy)]
pub struct LegacyLogScanner {
    lookback: usize,
}

impl Default for LegacyLogScanner {
    fn default() -> Self {
        Self {
            lookback: LEGACY_LOOKBACK_LINES,
        }
    }
}

impl LegacyLogScanner {
    pub fn with_lookback(lookback: usize) -> Self {
        Self { lookback }
    }

    pub fn scan(&self, kind: DataKind, text: &str) -> Vec<LegacyFailure> {
        let mut current: Option<(usize, Target)> = None;
        let mut seen = HashSet::new();
        let mut failures = Vec::new();

        for (idx, line) in text.lines().enumerate() {
            if let Some(caps) = announce_pattern().captures(line) {
                current = parse_label(kind, &caps[3]).map(|t| (idx, t));
                continue;
            }
            if line.contains(SUMMARY_MARKER) {
                current = None;
                continue;
            }
            if !is_failure_line(line) {
                continue;
            }
            if let Some((announced_at, target)) = &current {
                if idx - announced_at <= self.lookback && seen.insert(target.key()) {
                    failures.push(LegacyFailure {
                        target: target.clone(),
                        announce_line: announced_at + 1,
                        failure_line: idx + 1,
                    });
                }
            }
        }
        failures
    }
}

pub const PRICE_FALLBACK: &str = "価格応相談";
pub const METHOD_FALLBACK: &str = "未定";
pub const NG_FALLBACK: &str = "特になし";
pub const PROPERTY_FALLBACK: &str = "物件";

fn text_field(record: &JsonValue, key: &str) -> Option<String> {
    match record.get(key)? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(true) => Some("true".to_string()),
        _ => None,
    }
}

fn buyer_from(record: &JsonValue) -> BuyerEntry {
    let or_empty = |key: &str| text_field(record, key).unwrap_or_default();
    BuyerEntry {
        price: text_field(record, "price").unwrap_or_else(|| PRICE_FALLBACK.to_string()),
        method: text_field(record, "method").unwrap_or_else(|| METHOD_FALLBACK.to_string()),
        occupation: or_empty("occupation"),
        reason: or_empty("reason"),
        timing: or_empty("timing"),
        ng: text_field(record, "ng").unwrap_or_else(|| NG_FALLBACK.to_string()),
        family: or_empty("family"),
        age: or_empty("age"),
    }
}

/// Tagged records follow their tag; untagged ones are hidden-detail when they
/// carry none of the forbidden detail keys.
fn details_hidden(record: &JsonValue) -> bool {
    match record.get(SCHEMA_VERSION_KEY).and_then(JsonValue::as_str) {
        Some(tag) => tag == HIDDEN_DETAIL_SCHEMA,
        None => record
            .as_object()
            .is_some_and(|obj| FORBIDDEN_KEYS.iter().all(|k| !obj.contains_key(*k))),
    }
}

/// Reshapes one generated file's content. The first record decides the shape:
/// station fields win, then a city; anything else passes through untouched.
pub fn reshape_file(content: JsonValue) -> Vec<BundleEntry> {
    let records = match content {
        JsonValue::Array(records) => records,
        other @ JsonValue::Object(_) => return vec![BundleEntry::Passthrough(other)],
        _ => return Vec::new(),
    };
    let Some(first) = records.first() else {
        return Vec::new();
    };

    let type_label = text_field(first, "type").unwrap_or_else(|| PROPERTY_FALLBACK.to_string());
    let buyers = || records.iter().map(buyer_from).collect::<Vec<_>>();
    let station_fields = (
        text_field(first, "rail_company"),
        text_field(first, "line"),
        text_field(first, "station"),
    );

    if let (Some(rail), Some(line), Some(station)) = station_fields {
        return vec![BundleEntry::Reshaped(BundleRecord {
            name: format!("{rail} {line} {station}周辺の{type_label}"),
            address: station.clone(),
            station: Some(station),
            details_hidden: details_hidden(first),
            buyers: buyers(),
        })];
    }
    if let Some(city) = text_field(first, "city") {
        let address = match text_field(first, "area") {
            Some(prefecture) => format!("{prefecture} {city}"),
            None => city.clone(),
        };
        return vec![BundleEntry::Reshaped(BundleRecord {
            name: format!("{city}の{type_label}"),
            address,
            station: None,
            details_hidden: details_hidden(first),
            buyers: buyers(),
        })];
    }
    records.into_iter().map(BundleEntry::Passthrough).collect()
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KindTotals {
    pub records: usize,
    pub buyers: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleArtifact {
    pub generated_at: DateTime<Utc>,
    pub totals: BTreeMap<DataKind, KindTotals>,
    pub house: Vec<BundleEntry>,
    pub land: Vec<BundleEntry>,
}

impl BundleArtifact {
    pub fn entries(&self, kind: DataKind) -> &[BundleEntry] {
        match kind {
            DataKind::House => &self.house,
            DataKind::Land => &self.land,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleFiles {
    pub bundle_json: PathBuf,
    pub modules: Vec<PathBuf>,
}

fn collect_json_files(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", dir.display())),
    };
    let mut paths = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .collect::<Vec<_>>();
    paths.sort();
    for path in paths {
        if path.is_dir() {
            collect_json_files(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "json") {
            out.push(path);
        }
    }
    Ok(())
}

/// Merges the per-target files under the data directory into display bundles.
pub struct BundleMerger {
    locator: OutputLocator,
}

impl BundleMerger {
    pub fn new(locator: OutputLocator) -> Self {
        Self { locator }
    }

    /// Area files first, then station files, each in path order. Unreadable
    /// files are logged and skipped.
    pub fn collect(&self, kind: DataKind) -> Result<Vec<BundleEntry>> {
        let mut files = Vec::new();
        for axis in [Axis::Area, Axis::Station] {
            collect_json_files(&self.locator.axis_dir(kind, axis), &mut files)?;
        }

        let mut entries = Vec::new();
        for path in files {
            let parsed = std::fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|text| serde_json::from_str::<JsonValue>(&text).map_err(Into::into));
            match parsed {
                Ok(content) => entries.extend(reshape_file(content)),
                Err(err) => warn!(path = %path.display(), error = %err, "skipping unreadable output"),
            }
        }
        Ok(entries)
    }

    pub fn build(&self) -> Result<BundleArtifact> {
        let house = self.collect(DataKind::House)?;
        let land = self.collect(DataKind::Land)?;
        let totals = [(DataKind::House, &house), (DataKind::Land, &land)]
            .into_iter()
            .map(|(kind, entries)| {
                let totals = KindTotals {
                    records: entries.len(),
                    buyers: entries.iter().map(BundleEntry::buyer_count).sum(),
                };
                (kind, totals)
            })
            .collect();
        Ok(BundleArtifact {
            generated_at: Utc::now(),
            totals,
            house,
            land,
        })
    }

    /// Writes `bundle.json` plus one `<kind>_db.js` module per kind into `out_dir`.
    pub async fn write(&self, artifact: &BundleArtifact, out_dir: &Path) -> Result<BundleFiles> {
        let bundle_json = out_dir.join("bundle.json");
        write_atomic(&bundle_json, &serde_json::to_vec_pretty(artifact)?)
            .await
            .with_context(|| format!("writing {}", bundle_json.display()))?;

        let mut modules = Vec::new();
        for kind in DataKind::ALL {
            let path = out_dir.join(format!("{}.js", kind.db_marker()));
            let module = render_db_module(kind, artifact.entries(kind))?;
            write_atomic(&path, module.as_bytes())
                .await
                .with_context(|| format!("writing {}", path.display()))?;
            modules.push(path);
        }
        Ok(BundleFiles {
            bundle_json,
            modules,
        })
    }
}

pub fn render_db_module(kind: DataKind, entries: &[BundleEntry]) -> Result<String> {
    let constant = kind.db_marker().to_ascii_uppercase();
    let body = serde_json::to_string_pretty(entries)?;
    Ok(format!(
        "// {}データベース (generated by urico bundle)\nexport const {constant} = {body};\n\nexport default {constant};\n",
        kind.type_label()
    ))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AxisProgress {
    pub generated: usize,
    pub total: usize,
}

impl AxisProgress {
    pub fn percent(&self) -> usize {
        if self.total == 0 {
            return 0;
        }
        self.generated * 100 / self.total
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PrefectureProgress {
    pub prefecture: String,
    pub area: AxisProgress,
    pub station: AxisProgress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressReport {
    pub kind: DataKind,
    pub prefectures: Vec<PrefectureProgress>,
    /// Whole-geography counts; a station shared by several prefectures counts once.
    pub area_total: AxisProgress,
    pub station_total: AxisProgress,
}

impl ProgressReport {
    pub fn collect(geography: &MasterGeography, locator: &OutputLocator, kind: DataKind) -> Self {
        let count = |prefecture: Option<&str>, axis: Axis| {
            let filter = TargetFilter {
                prefecture: prefecture.map(str::to_string),
                axis: Some(axis),
            };
            let targets = geography.enumerate(kind, &filter);
            AxisProgress {
                generated: targets
                    .iter()
                    .filter(|t| locator.path_for(t).is_file())
                    .count(),
                total: targets.len(),
            }
        };
        let prefectures = geography
            .prefectures()
            .map(|(name, _)| PrefectureProgress {
                prefecture: name.to_string(),
                area: count(Some(name), Axis::Area),
                station: count(Some(name), Axis::Station),
            })
            .collect();
        Self {
            kind,
            prefectures,
            area_total: count(None, Axis::Area),
            station_total: count(None, Axis::Station),
        }
    }

    pub fn totals(&self) -> (AxisProgress, AxisProgress) {
        (self.area_total, self.station_total)
    }
}

pub fn progress_bar(progress: AxisProgress, width: usize) -> String {
    let filled = if progress.total == 0 {
        0
    } else {
        (progress.generated * width / progress.total).min(width)
    };
    format!("{}{}", "█".repeat(filled), "░".repeat(width - filled))
}

fn progress_row(label: &str, progress: AxisProgress) -> String {
    format!(
        "- {label}: {} {}/{} ({}%)",
        progress_bar(progress, 20),
        progress.generated,
        progress.total,
        progress.percent()
    )
}

pub fn render_progress_markdown(reports: &[ProgressReport]) -> String {
    let mut lines = vec!["# Urico Generation Progress".to_string(), String::new()];
    for report in reports {
        lines.push(format!("## {} ({})", report.kind.type_label(), report.kind));
        for p in &report.prefectures {
            lines.push(format!("### {}", p.prefecture));
            lines.push(progress_row("エリア", p.area));
            lines.push(progress_row("駅", p.station));
        }
        let (area, station) = report.totals();
        lines.push("### 合計".to_string());
        lines.push(progress_row("エリア", area));
        lines.push(progress_row("駅", station));
        lines.push(String::new());
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn retry_delay_is_exponential_and_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.max_attempts(), 6);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(RetryPolicy::default().delay_for_attempt(4), Duration::ZERO);
    }

    #[test]
    fn config_defaults_hang_off_workspace_root() {
        let config = SyncConfig::for_workspace("/srv/urico");
        assert_eq!(config.master_path, PathBuf::from("/srv/urico/data/kinki_master.json"));
        assert_eq!(config.lock_dir, PathBuf::from("/srv/urico/data/.locks"));
        assert_eq!(config.outcomes_path(), PathBuf::from("/srv/urico/data/outcomes.jsonl"));
        assert_eq!(config.retry.max_attempts(), 3);
        assert_eq!(config.delay, Duration::from_secs(10));
        assert_eq!(config.timeout, None);
    }

    #[test]
    fn labels_parse_station_before_area() {
        assert_eq!(
            parse_label(DataKind::Land, "JR西日本 > 大阪環状線 > 天満"),
            Some(Target::station(DataKind::Land, "JR西日本", "大阪環状線", "天満"))
        );
        assert_eq!(
            parse_label(DataKind::House, " 大阪府 > 堺市 "),
            Some(Target::area(DataKind::House, "大阪府", "堺市"))
        );
        assert_eq!(parse_label(DataKind::House, "大阪府"), None);
        assert_eq!(parse_label(DataKind::House, "大阪府 >  > 堺市"), None);
    }

    #[test]
    fn failure_lines_are_recognized() {
        assert!(is_failure_line("❌ 生成失敗 (終了コード: 1)"));
        assert!(is_failure_line("[エラー] 最大リトライ回数を超えました"));
        assert!(is_failure_line("Error: max retries exceeded"));
        assert!(is_failure_line("process exited, exit code: 2"));
        assert!(is_failure_line("❌ エラー: spawn node ENOENT"));
        assert!(!is_failure_line("終了コード: 0"));
        assert!(!is_failure_line("✅ 生成成功"));
    }

    #[test]
    fn legacy_scan_attributes_failures_and_dedupes() {
        let log = "\
🎯 [1/3] 大阪府 > 堺市
✅ 生成成功
🎯 [2/3] JR西日本 > 大阪環状線 > 天満
Claude CLI終了コード: 1
❌ 生成失敗 (終了コード: 1)
[エラー] 最大リトライ回数を超えました
🎯 [3/3] 大阪府 > 大阪市北区
⏭️  スキップ

📊 生成結果サマリー
❌ 生成失敗: 1
";
        let failures = LegacyLogScanner::default().scan(DataKind::Land, log);
        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures[0].target,
            Target::station(DataKind::Land, "JR西日本", "大阪環状線", "天満")
        );
        assert_eq!(failures[0].announce_line, 3);
        assert_eq!(failures[0].failure_line, 4);
    }

    #[test]
    fn legacy_scan_catches_spawn_errors() {
        let log = "\
🎯 [1/2] 大阪府 > 堺市
❌ エラー: spawn node ENOENT
🎯 [2/2] 大阪府 > 大阪市北区
✅ 生成成功

📊 生成結果サマリー
❌ エラー: 1件
";
        let failures = LegacyLogScanner::default().scan(DataKind::Land, log);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].target, Target::area(DataKind::Land, "大阪府", "堺市"));
        assert_eq!(failures[0].failure_line, 2);
    }

    #[test]
    fn progress_totals_count_shared_stations_once() {
        let geography = MasterGeography::from_json_str(
            r#"{
                "京都府": {
                    "cities": ["京都市下京区"],
                    "rail": { "JR西日本": { "東海道本線": ["京都", "山崎"] } }
                },
                "大阪府": {
                    "cities": ["高槻市"],
                    "rail": { "JR西日本": { "東海道本線": ["山崎", "高槻"] } }
                }
            }"#,
        )
        .unwrap();
        let locator = OutputLocator::new("/nonexistent/urico-data");
        let report = ProgressReport::collect(&geography, &locator, DataKind::House);
        let per_prefecture: usize = report.prefectures.iter().map(|p| p.station.total).sum();
        assert_eq!(per_prefecture, 4);

        let (area, station) = report.totals();
        assert_eq!(area.total, 2);
        assert_eq!(
            station.total,
            geography
                .enumerate(
                    DataKind::House,
                    &TargetFilter {
                        prefecture: None,
                        axis: Some(Axis::Station),
                    }
                )
                .len()
        );
        assert_eq!(station.total, 3);
        assert_eq!(station.generated, 0);
    }

    #[test]
    fn legacy_scan_ignores_failures_beyond_lookback() {
        let mut log = String::from("🎯 [1/1] 大阪府 > 堺市\n");
        for _ in 0..5 {
            log.push_str("working...\n");
        }
        log.push_str("❌ 生成失敗\n");
        assert!(LegacyLogScanner::with_lookback(3)
            .scan(DataKind::House, &log)
            .is_empty());
        assert_eq!(LegacyLogScanner::default().scan(DataKind::House, &log).len(), 1);
    }

    fn event(target: &Target, status: OutcomeStatus) -> OutcomeEvent {
        OutcomeEvent {
            run_id: Uuid::nil(),
            at: Utc::now(),
            target: target.clone(),
            status,
            error_code: None,
            reason: None,
            attempts: 1,
        }
    }

    #[test]
    fn latest_status_decides_failed_targets() {
        let a = Target::area(DataKind::Land, "大阪府", "堺市");
        let b = Target::area(DataKind::Land, "大阪府", "大阪市北区");
        let c = Target::station(DataKind::Land, "JR西日本", "大阪環状線", "天満");
        let events = vec![
            event(&a, OutcomeStatus::Failed),
            event(&b, OutcomeStatus::Failed),
            event(&c, OutcomeStatus::Generated),
            event(&a, OutcomeStatus::Generated),
            event(&c, OutcomeStatus::Failed),
        ];
        assert_eq!(failed_targets(&events), vec![b, c]);
    }

    #[test]
    fn outcome_event_serializes_flat_target() {
        let target = Target::area(DataKind::House, "大阪府", "堺市");
        let value = serde_json::to_value(event(&target, OutcomeStatus::Failed)).expect("json");
        assert_eq!(value["status"], "failed");
        assert_eq!(value["target"]["kind"], "house");
        assert_eq!(value["target"]["axis"], "area");
        assert!(value.get("error_code").is_none());
    }

    #[test]
    fn summary_all_failed_only_when_nothing_succeeded() {
        let mut summary = BatchSummary {
            run_id: Uuid::nil(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            total: 2,
            generated: 0,
            skipped: 0,
            failed: 2,
            failures: Vec::new(),
        };
        assert!(summary.all_failed());
        summary.skipped = 1;
        summary.failed = 1;
        assert!(!summary.all_failed());
        summary.failed = 0;
        summary.skipped = 0;
        assert!(!summary.all_failed());
        assert_eq!(summary.render_lines().last().map(String::as_str), Some(COMPLETE_SENTINEL));
    }

    #[test]
    fn station_file_reshapes_into_one_entry() {
        let content = json!([
            {"type": "土地", "rail_company": "JR西日本", "line": "大阪環状線", "station": "天満",
             "timing": "半年以内", "schema_version": "hidden-detail/1"},
            {"type": "土地", "rail_company": "JR西日本", "line": "大阪環状線", "station": "天満",
             "timing": "", "price": "3000万円"}
        ]);
        let entries = reshape_file(content);
        assert_eq!(entries.len(), 1);
        let BundleEntry::Reshaped(record) = &entries[0] else {
            panic!("expected reshaped entry");
        };
        assert_eq!(record.name, "JR西日本 大阪環状線 天満周辺の土地");
        assert_eq!(record.address, "天満");
        assert_eq!(record.station.as_deref(), Some("天満"));
        assert!(record.details_hidden);
        assert_eq!(record.buyers.len(), 2);
        assert_eq!(record.buyers[0].price, PRICE_FALLBACK);
        assert_eq!(record.buyers[0].method, METHOD_FALLBACK);
        assert_eq!(record.buyers[0].ng, NG_FALLBACK);
        assert_eq!(record.buyers[0].timing, "半年以内");
        assert_eq!(record.buyers[1].price, "3000万円");
        assert_eq!(record.buyers[1].timing, "");
    }

    #[test]
    fn area_file_uses_prefecture_and_infers_visibility() {
        let detailed = json!([{"type": "戸建", "area": "大阪府", "city": "堺市", "price": "4000万円"}]);
        let BundleEntry::Reshaped(record) = &reshape_file(detailed)[0] else {
            panic!("expected reshaped entry");
        };
        assert_eq!(record.name, "堺市の戸建");
        assert_eq!(record.address, "大阪府 堺市");
        assert_eq!(record.station, None);
        assert!(!record.details_hidden);

        let hidden = json!([{"city": "堺市", "timing": "即時"}]);
        let BundleEntry::Reshaped(record) = &reshape_file(hidden)[0] else {
            panic!("expected reshaped entry");
        };
        assert_eq!(record.name, "堺市の物件");
        assert_eq!(record.address, "堺市");
        assert!(record.details_hidden);
    }

    #[test]
    fn display_shaped_records_pass_through() {
        let content = json!([{"name": "既存物件", "buyers": [{}, {}]}]);
        let entries = reshape_file(content.clone());
        assert_eq!(entries, vec![BundleEntry::Passthrough(content[0].clone())]);
        assert_eq!(entries[0].buyer_count(), 2);
        assert!(reshape_file(json!([])).is_empty());
    }

    #[test]
    fn db_module_exports_upper_case_constant() {
        let module = render_db_module(DataKind::House, &[]).expect("module");
        assert!(module.contains("export const HOUSE_DB = [];"));
        assert!(module.contains("export default HOUSE_DB;"));
    }

    #[test]
    fn progress_bar_scales_to_width() {
        let half = AxisProgress {
            generated: 5,
            total: 10,
        };
        assert_eq!(progress_bar(half, 10), "█████░░░░░");
        assert_eq!(half.percent(), 50);
        assert_eq!(progress_bar(AxisProgress::default(), 4), "░░░░");
    }
}
