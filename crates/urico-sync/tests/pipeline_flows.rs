use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use tempfile::{tempdir, TempDir};
use urico_core::{DataKind, Location, MasterGeography, Target, HIDDEN_DETAIL_SCHEMA};
use urico_generator::{GenerationError, Generator, PromptBuilder, TemplateSet};
use urico_storage::{LockPolicy, OutputLocator};
use urico_sync::{
    failed_targets, BatchOptions, BatchRunner, BundleMerger, LegacyLogScanner, OutcomeLog,
    OutcomeStatus, ProgressReport, RetryPolicy, RunLog, SkipReason, SyncConfig, TargetOutcome,
    TargetPipeline, COMPLETE_SENTINEL,
};

const MASTER: &str = r#"{
    "大阪府": {
        "cities": ["大阪市北区", "堺市"],
        "rail": { "JR西日本": { "大阪環状線": ["大阪", "天満"] } }
    }
}"#;

/// Replays canned responses and counts how often it was asked.
struct ScriptedGenerator {
    responses: Mutex<VecDeque<Result<String, GenerationError>>>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedGenerator {
    fn new(responses: Vec<Result<String, GenerationError>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(GenerationError::MalformedOutput("script exhausted".into())))
    }
}

/// Generator output holding `count` valid records for `target`.
fn output_for(target: &Target, count: usize) -> String {
    let records = (0..count)
        .map(|i| {
            let mut record = json!({
                "id": format!("{}-{i}", target.kind),
                "type": target.kind.type_label(),
                "scope": target.axis().as_str(),
                "area": null, "city": null,
                "rail_company": null, "line": null, "station": null,
                "timing": "半年以内",
            });
            match &target.location {
                Location::Area { prefecture, city } => {
                    record["area"] = json!(prefecture);
                    record["city"] = json!(city);
                }
                Location::Station {
                    rail_company,
                    line,
                    station,
                } => {
                    record["rail_company"] = json!(rail_company);
                    record["line"] = json!(line);
                    record["station"] = json!(station);
                }
            }
            record
        })
        .collect::<Vec<_>>();
    format!(
        "Here you go:\nconst {} = {};\n",
        target.kind.db_marker(),
        serde_json::to_string(&records).unwrap()
    )
}

fn workspace() -> (TempDir, SyncConfig) {
    let dir = tempdir().expect("tempdir");
    let mut config = SyncConfig::for_workspace(dir.path());
    config.lock_policy = LockPolicy {
        poll_interval: Duration::from_millis(10),
        max_polls: 5,
    };
    config.delay = Duration::ZERO;

    std::fs::create_dir_all(&config.templates_dir).unwrap();
    for kind in ["house", "land"] {
        std::fs::write(
            config.templates_dir.join(format!("area_prompt_{kind}.txt")),
            "{{PREF}} {{CITY}}\n{{ALLOWED_CITY_LIST_FOR_PREF_ONLY}}\n",
        )
        .unwrap();
        std::fs::write(
            config.templates_dir.join(format!("station_prompt_{kind}.txt")),
            "{{RAIL}} {{LINE}} {{STATION}}\n{{ALLOWED_STATION_LIST_FOR_THIS_LINE_ONLY}}\n",
        )
        .unwrap();
    }
    (dir, config)
}

fn pipeline(config: &SyncConfig, generator: Arc<ScriptedGenerator>) -> Arc<TargetPipeline> {
    Arc::new(TargetPipeline::new(
        Arc::new(MasterGeography::from_json_str(MASTER).unwrap()),
        PromptBuilder::new(TemplateSet::new(&config.templates_dir)),
        generator,
        config.target_store(),
        RetryPolicy::default(),
    ))
}

fn read_records(path: &Path) -> Vec<JsonValue> {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn text(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

#[tokio::test]
async fn valid_output_is_committed_then_skipped_without_tool_call() {
    let (_dir, config) = workspace();
    let target = Target::area(DataKind::Land, "大阪府", "堺市");
    let generator = ScriptedGenerator::new(vec![Ok(output_for(&target, 20))]);
    let pipeline = pipeline(&config, generator.clone());

    let first = pipeline.run_target(&target, false).await.expect("first run");
    let TargetOutcome::Generated {
        path,
        records,
        attempts,
    } = first
    else {
        panic!("expected a generated outcome");
    };
    assert_eq!(records, 20);
    assert_eq!(attempts, 1);
    assert_eq!(path, config.data_dir.join("land/area/大阪府/堺市.json"));
    let stored = read_records(&path);
    assert_eq!(stored.len(), 20);
    assert!(stored
        .iter()
        .all(|r| r["schema_version"] == HIDDEN_DETAIL_SCHEMA));

    let prompt = generator.prompts.lock().unwrap()[0].clone();
    assert!(prompt.starts_with("大阪府 堺市"));
    assert!(prompt.contains("- 大阪市北区"));

    let second = pipeline.run_target(&target, false).await.expect("second run");
    assert!(matches!(
        second,
        TargetOutcome::Skipped {
            reason: SkipReason::AlreadyGenerated,
            ..
        }
    ));
    assert_eq!(generator.calls(), 1);
}

#[tokio::test]
async fn persistent_invalid_output_exhausts_retries_and_writes_nothing() {
    let (_dir, config) = workspace();
    let target = Target::station(DataKind::Land, "JR西日本", "大阪環状線", "天満");
    let generator = ScriptedGenerator::new(vec![
        Ok(output_for(&target, 10)),
        Ok(output_for(&target, 10)),
        Ok(output_for(&target, 10)),
    ]);
    let pipeline = pipeline(&config, generator.clone());

    let err = pipeline.run_target(&target, false).await.unwrap_err();
    match &err {
        GenerationError::ExhaustedRetries { attempts, last } => {
            assert_eq!(*attempts, 3);
            assert!(matches!(**last, GenerationError::ValidationFailed(_)));
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(generator.calls(), 3);
    assert!(!pipeline.store().path_for(&target).exists());
}

#[tokio::test]
async fn transient_failure_recovers_on_retry() {
    let (_dir, config) = workspace();
    let target = Target::area(DataKind::House, "大阪府", "大阪市北区");
    let generator = ScriptedGenerator::new(vec![
        Err(GenerationError::GenerationFailed {
            exit_code: Some(1),
            stderr_excerpt: "boom".into(),
            credit_exhausted: false,
        }),
        Ok("no marker here".into()),
        Ok(output_for(&target, 16)),
    ]);
    let pipeline = pipeline(&config, generator.clone());

    let outcome = pipeline.run_target(&target, false).await.expect("recovered");
    assert!(matches!(outcome, TargetOutcome::Generated { attempts: 3, .. }));
    assert_eq!(generator.calls(), 3);
}

#[tokio::test]
async fn unknown_target_fails_without_invoking_generator() {
    let (_dir, config) = workspace();
    let generator = ScriptedGenerator::new(Vec::new());
    let pipeline = pipeline(&config, generator.clone());

    let target = Target::area(DataKind::Land, "京都府", "京都市");
    let err = pipeline.run_target(&target, false).await.unwrap_err();
    assert!(matches!(err, GenerationError::InvalidTarget(_)));
    assert!(!err.is_retryable());
    assert_eq!(generator.calls(), 0);
}

#[tokio::test]
async fn force_regenerates_existing_output() {
    let (_dir, config) = workspace();
    let target = Target::area(DataKind::Land, "大阪府", "堺市");
    let generator = ScriptedGenerator::new(vec![
        Ok(output_for(&target, 16)),
        Ok(output_for(&target, 30)),
    ]);
    let pipeline = pipeline(&config, generator.clone());

    pipeline.run_target(&target, false).await.expect("first");
    let outcome = pipeline.run_target(&target, true).await.expect("forced");
    assert!(matches!(outcome, TargetOutcome::Generated { records: 30, .. }));
    assert_eq!(read_records(&pipeline.store().path_for(&target)).len(), 30);
    assert_eq!(generator.calls(), 2);
}

#[tokio::test]
async fn batch_records_outcomes_and_offline_retry_redrives_failures() {
    let (_dir, config) = workspace();
    let geography = MasterGeography::from_json_str(MASTER).unwrap();
    let targets = geography.enumerate(DataKind::Land, &Default::default());
    assert_eq!(targets.len(), 4);
    let failing = targets[1].clone();

    let generator = ScriptedGenerator::new(vec![
        Ok(output_for(&targets[0], 16)),
        Ok("garbage".into()),
        Ok("garbage".into()),
        Ok("garbage".into()),
        Ok(output_for(&targets[2], 16)),
        Ok(output_for(&targets[3], 16)),
    ]);
    let outcomes = Arc::new(OutcomeLog::new(config.outcomes_path()));
    let log = SharedBuf::default();
    let runner = BatchRunner::new(pipeline(&config, generator.clone()), BatchOptions::from_config(&config))
        .with_run_log(Arc::new(RunLog::new(log.clone())))
        .with_outcome_log(Arc::clone(&outcomes));

    let summary = runner.run(targets.clone()).await;
    assert_eq!((summary.generated, summary.skipped, summary.failed), (3, 0, 1));
    assert!(!summary.all_failed());
    assert_eq!(summary.failures[0].target, failing);
    assert_eq!(summary.failures[0].code, "ExhaustedRetries");

    let text = log.text();
    assert!(text.contains("🎯 [2/4] 大阪府 > 堺市"));
    assert!(text.trim_end().ends_with(COMPLETE_SENTINEL));
    let legacy = LegacyLogScanner::default().scan(DataKind::Land, &text);
    assert_eq!(legacy.len(), 1);
    assert_eq!(legacy[0].target, failing);

    let events = outcomes.read_all().await.expect("events");
    assert_eq!(events.len(), 4);
    let failed_event = events.iter().find(|e| e.status == OutcomeStatus::Failed).unwrap();
    assert_eq!(failed_event.attempts, 3);
    assert_eq!(failed_targets(&events), vec![failing.clone()]);

    let retry_generator = ScriptedGenerator::new(vec![Ok(output_for(&failing, 16))]);
    let retry_runner = BatchRunner::new(
        pipeline(&config, retry_generator.clone()),
        BatchOptions::for_retry(Duration::ZERO),
    )
    .with_run_log(Arc::new(RunLog::new(SharedBuf::default())))
    .with_outcome_log(Arc::clone(&outcomes));
    let retried = retry_runner.run(failed_targets(&events)).await;
    assert_eq!((retried.generated, retried.failed), (1, 0));
    assert_eq!(retry_generator.calls(), 1);

    let events = outcomes.read_all().await.expect("events");
    assert!(failed_targets(&events).is_empty());
}

/// Answers each prompt with the records of the target named on its first line.
struct ByPrompt(Vec<(String, String)>);

#[async_trait]
impl Generator for ByPrompt {
    fn name(&self) -> &str {
        "by-prompt"
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let heading = prompt.lines().next().unwrap_or_default();
        self.0
            .iter()
            .find(|(key, _)| key == heading)
            .map(|(_, output)| output.clone())
            .ok_or_else(|| GenerationError::MalformedOutput(format!("unknown prompt {heading}")))
    }
}

#[tokio::test]
async fn concurrent_batch_keeps_every_target_separate() {
    let (_dir, config) = workspace();
    let geography = MasterGeography::from_json_str(MASTER).unwrap();
    let targets = geography.enumerate(DataKind::House, &Default::default());
    let generator = Arc::new(ByPrompt(
        targets
            .iter()
            .map(|t| (t.label().replace(" > ", " "), output_for(t, 16)))
            .collect(),
    ));
    let pipeline = Arc::new(TargetPipeline::new(
        Arc::new(geography),
        PromptBuilder::new(TemplateSet::new(&config.templates_dir)),
        generator,
        config.target_store(),
        RetryPolicy::default(),
    ));
    let options = BatchOptions {
        concurrency: 3,
        delay: Duration::ZERO,
        force: false,
    };
    let runner = BatchRunner::new(pipeline, options)
        .with_run_log(Arc::new(RunLog::new(SharedBuf::default())));

    let summary = runner.run(targets.clone()).await;
    assert_eq!(summary.generated, targets.len());
    for target in &targets {
        let records = read_records(&config.locator().path_for(target));
        let matches_target = records.iter().all(|r| match &target.location {
            Location::Area { city, .. } => r["city"] == json!(city),
            Location::Station { station, .. } => r["station"] == json!(station),
        });
        assert!(matches_target, "mismatched records for {target}");
    }
}

#[tokio::test]
async fn all_failed_batch_is_reported() {
    let (_dir, config) = workspace();
    let generator = ScriptedGenerator::new(Vec::new());
    let runner = BatchRunner::new(pipeline(&config, generator), BatchOptions::from_config(&config))
        .with_run_log(Arc::new(RunLog::new(SharedBuf::default())));

    let summary = runner
        .run(vec![Target::area(DataKind::House, "大阪府", "堺市")])
        .await;
    assert!(summary.all_failed());
    assert_eq!(summary.failures[0].code, "ExhaustedRetries");
}

#[tokio::test]
async fn bundle_merges_generated_files_and_progress_counts_them() {
    let (dir, config) = workspace();
    let area = Target::area(DataKind::Land, "大阪府", "堺市");
    let station = Target::station(DataKind::Land, "JR西日本", "大阪環状線", "天満");
    let generator = ScriptedGenerator::new(vec![
        Ok(output_for(&station, 18)),
        Ok(output_for(&area, 16)),
    ]);
    let pipeline = pipeline(&config, generator);
    pipeline.run_target(&station, false).await.expect("station");
    pipeline.run_target(&area, false).await.expect("area");

    let merger = BundleMerger::new(config.locator());
    let artifact = merger.build().expect("bundle");
    assert!(artifact.house.is_empty());
    assert_eq!(artifact.land.len(), 2);
    let land_totals = artifact.totals[&DataKind::Land];
    assert_eq!((land_totals.records, land_totals.buyers), (2, 34));

    let files = merger.write(&artifact, dir.path()).await.expect("write");
    let bundle: JsonValue =
        serde_json::from_str(&std::fs::read_to_string(&files.bundle_json).unwrap()).unwrap();
    assert_eq!(bundle["land"][0]["name"], "堺市の土地");
    assert_eq!(bundle["land"][0]["address"], "大阪府 堺市");
    assert_eq!(bundle["land"][0]["details_hidden"], true);
    assert_eq!(bundle["land"][1]["name"], "JR西日本 大阪環状線 天満周辺の土地");
    assert_eq!(bundle["totals"]["land"]["buyers"], 34);
    let land_js = std::fs::read_to_string(dir.path().join("land_db.js")).unwrap();
    assert!(land_js.contains("export const LAND_DB = ["));

    let geography = MasterGeography::from_json_str(MASTER).unwrap();
    let report = ProgressReport::collect(&geography, &OutputLocator::new(&config.data_dir), DataKind::Land);
    let osaka = &report.prefectures[0];
    assert_eq!((osaka.area.generated, osaka.area.total), (1, 2));
    assert_eq!((osaka.station.generated, osaka.station.total), (1, 2));
    let rendered = urico_sync::render_progress_markdown(&[report]);
    assert!(rendered.contains("### 大阪府"));
    assert!(rendered.contains("1/2 (50%)"));
}
