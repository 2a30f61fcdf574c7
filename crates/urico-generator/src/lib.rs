//! Prompt rendering, external generation tool invocation, and result validation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info_span, Instrument};
use urico_core::{
    Axis, DataKind, GeographyError, Location, MasterGeography, Target, FORBIDDEN_KEYS,
    MAX_RECORDS, MIN_RECORDS, REQUIRED_KEYS,
};
use urico_storage::StorageError;

pub const CRATE_NAME: &str = "urico-generator";

/// Upper bound on how much tool stderr is carried in a failure.
pub const STDERR_EXCERPT_CHARS: usize = 1000;

/// Offending record and field of a rejected generation result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationFailure {
    /// Zero-based record index; `None` for whole-array violations.
    pub index: Option<usize>,
    pub field: Option<String>,
    pub reason: String,
}

impl ValidationFailure {
    fn whole(reason: impl Into<String>) -> Self {
        Self {
            index: None,
            field: None,
            reason: reason.into(),
        }
    }

    fn at(index: usize, field: Option<&str>, reason: impl Into<String>) -> Self {
        Self {
            index: Some(index),
            field: field.map(str::to_string),
            reason: reason.into(),
        }
    }
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "record[{index}]: {}", self.reason),
            None => f.write_str(&self.reason),
        }
    }
}

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("invalid target: {0}")]
    InvalidTarget(#[from] GeographyError),
    #[error("prompt template: {0}")]
    Template(String),
    #[error("generation tool `{command}` could not be launched: {reason}")]
    GenerationUnavailable { command: String, reason: String },
    #[error("generation tool failed ({}): {stderr_excerpt}", exit_label(.exit_code))]
    GenerationFailed {
        exit_code: Option<i32>,
        stderr_excerpt: String,
        credit_exhausted: bool,
    },
    #[error("malformed generator output: {0}")]
    MalformedOutput(String),
    #[error("validation failed: {0}")]
    ValidationFailed(ValidationFailure),
    #[error("timed out waiting for lock on {}", .path.display())]
    LockTimeout { path: PathBuf },
    #[error("persisting output: {0}")]
    Storage(StorageError),
    #[error("gave up after {attempts} attempts: {last}")]
    ExhaustedRetries {
        attempts: u32,
        last: Box<GenerationError>,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code".to_string(),
    }
}

impl From<StorageError> for GenerationError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::LockTimeout { path, .. } => GenerationError::LockTimeout { path },
            other => GenerationError::Storage(other),
        }
    }
}

impl GenerationError {
    /// Whether an inline retry of the same target may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationError::GenerationUnavailable { .. }
                | GenerationError::GenerationFailed { .. }
                | GenerationError::MalformedOutput(_)
                | GenerationError::ValidationFailed(_)
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            GenerationError::InvalidTarget(_) => "InvalidTarget",
            GenerationError::Template(_) => "Template",
            GenerationError::GenerationUnavailable { .. } => "GenerationUnavailable",
            GenerationError::GenerationFailed { .. } => "GenerationFailed",
            GenerationError::MalformedOutput(_) => "MalformedOutput",
            GenerationError::ValidationFailed(_) => "ValidationFailed",
            GenerationError::LockTimeout { .. } => "LockTimeout",
            GenerationError::Storage(_) => "Storage",
            GenerationError::ExhaustedRetries { .. } => "ExhaustedRetries",
        }
    }

    /// True when the tool reported an exhausted credit balance, directly or
    /// as the last failure before retries ran out.
    pub fn is_credit_exhausted(&self) -> bool {
        match self {
            GenerationError::GenerationFailed {
                credit_exhausted, ..
            } => *credit_exhausted,
            GenerationError::ExhaustedRetries { last, .. } => last.is_credit_exhausted(),
            _ => false,
        }
    }
}

/// Trimmed prefix of `text`, at most `max_chars` characters.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}…", &trimmed[..cut]),
        None => trimmed.to_string(),
    }
}

pub fn mentions_credit_exhaustion(stderr: &str) -> bool {
    stderr.contains("Credit balance") || stderr.contains("too low")
}

/// Prompt templates on disk, one per `(axis, kind)`.
#[derive(Debug, Clone)]
pub struct TemplateSet {
    dir: PathBuf,
}

impl TemplateSet {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, kind: DataKind, axis: Axis) -> PathBuf {
        self.dir.join(format!("{axis}_prompt_{kind}.txt"))
    }

    pub fn load(&self, kind: DataKind, axis: Axis) -> Result<String, GenerationError> {
        let path = self.path_for(kind, axis);
        std::fs::read_to_string(&path)
            .map_err(|err| GenerationError::Template(format!("reading {}: {err}", path.display())))
    }
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\{\{[A-Z0-9_]+\}\}").expect("placeholder pattern is valid"))
}

fn bullet_list(items: &[String]) -> String {
    items
        .iter()
        .map(|item| format!("- {item}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Substitute the target and its allow-list into `template`. Any placeholder
/// left over afterwards is an error.
pub fn render_prompt(
    template: &str,
    target: &Target,
    allow_list: &[String],
) -> Result<String, GenerationError> {
    let allowed = bullet_list(allow_list);
    let rendered = match &target.location {
        Location::Area { prefecture, city } => template
            .replace("{{PREF}}", prefecture)
            .replace("{{CITY}}", city)
            .replace("{{ALLOWED_CITY_LIST_FOR_PREF_ONLY}}", &allowed),
        Location::Station {
            rail_company,
            line,
            station,
        } => template
            .replace("{{RAIL}}", rail_company)
            .replace("{{LINE}}", line)
            .replace("{{STATION}}", station)
            .replace("{{ALLOWED_STATION_LIST_FOR_THIS_LINE_ONLY}}", &allowed),
    };

    let leftover: Vec<&str> = placeholder_pattern()
        .find_iter(&rendered)
        .map(|m| m.as_str())
        .collect();
    if !leftover.is_empty() {
        return Err(GenerationError::Template(format!(
            "unreplaced placeholders for {} target: {}",
            target.axis(),
            leftover.join(", ")
        )));
    }
    Ok(rendered)
}

#[derive(Debug, Clone)]
pub struct PromptBuilder {
    templates: TemplateSet,
}

impl PromptBuilder {
    pub fn new(templates: TemplateSet) -> Self {
        Self { templates }
    }

    pub fn templates(&self) -> &TemplateSet {
        &self.templates
    }

    /// Validates the target against the master geography, then renders the
    /// `(kind, axis)` template with the target's sibling allow-list.
    pub fn build(
        &self,
        geography: &MasterGeography,
        target: &Target,
    ) -> Result<String, GenerationError> {
        let allow_list = geography.allow_list(target)?;
        let template = self.templates.load(target.kind, target.axis())?;
        render_prompt(&template, target, allow_list)
    }
}

/// External generation tool: prompt in, text containing a record array out.
#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError>;
}

fn default_command() -> String {
    "claude".to_string()
}

/// How to launch the generation tool, from `generator.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorProfile {
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for GeneratorProfile {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: Vec::new(),
            env: BTreeMap::new(),
            timeout_secs: None,
        }
    }
}

impl GeneratorProfile {
    pub fn from_yaml_str(text: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(text).context("parsing generator profile")
    }

    /// Missing file means the default profile.
    pub fn load_or_default(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("loading {}", path.display()))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Runs the generation tool as a child process per prompt.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    profile: GeneratorProfile,
    timeout: Option<Duration>,
}

impl CommandGenerator {
    pub fn new(profile: GeneratorProfile) -> Self {
        let timeout = profile.timeout();
        Self { profile, timeout }
    }

    /// `None` waits for the child indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn run_child(&self, prompt: &str) -> Result<String, GenerationError> {
        let mut child = Command::new(&self.profile.command)
            .args(&self.profile.args)
            .envs(&self.profile.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| GenerationError::GenerationUnavailable {
                command: self.profile.command.clone(),
                reason: err.to_string(),
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| GenerationError::GenerationUnavailable {
                command: self.profile.command.clone(),
                reason: "child stdin was not captured".to_string(),
            })?;
        let payload = prompt.as_bytes().to_vec();
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&payload).await;
            drop(stdin);
            result
        });

        let waited = child.wait_with_output();
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, waited).await {
                Ok(result) => result,
                Err(_) => {
                    writer.abort();
                    return Err(GenerationError::GenerationFailed {
                        exit_code: None,
                        stderr_excerpt: format!("timed out after {limit:?}"),
                        credit_exhausted: false,
                    });
                }
            },
            None => waited.await,
        }
        .map_err(|err| GenerationError::GenerationUnavailable {
            command: self.profile.command.clone(),
            reason: format!("waiting for child: {err}"),
        })?;

        // A tool that exits without draining stdin breaks the pipe; its exit
        // status is what counts.
        if let Ok(Err(err)) = writer.await {
            debug!(%err, "prompt write did not complete");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GenerationError::GenerationFailed {
                exit_code: output.status.code(),
                stderr_excerpt: excerpt(&stderr, STDERR_EXCERPT_CHARS),
                credit_exhausted: mentions_credit_exhaustion(&stderr),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    fn name(&self) -> &str {
        &self.profile.command
    }

    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        let span = info_span!(
            "generator",
            command = %self.profile.command,
            prompt_chars = prompt.chars().count()
        );
        self.run_child(prompt).instrument(span).await
    }
}

fn marker_pattern(kind: DataKind) -> &'static Regex {
    static HOUSE: OnceLock<Regex> = OnceLock::new();
    static LAND: OnceLock<Regex> = OnceLock::new();
    let cell = match kind {
        DataKind::House => &HOUSE,
        DataKind::Land => &LAND,
    };
    cell.get_or_init(|| {
        Regex::new(&format!(
            r"const\s+{}\s*=\s*(\[[\s\S]*?\]);",
            regex::escape(kind.db_marker())
        ))
        .expect("marker pattern is valid")
    })
}

/// Pull the `const <kind>_db = [...];` array out of raw tool output.
pub fn extract_records(kind: DataKind, output: &str) -> Result<Vec<JsonValue>, GenerationError> {
    let captures = marker_pattern(kind).captures(output).ok_or_else(|| {
        GenerationError::MalformedOutput(format!(
            "no `const {} = [...];` assignment found",
            kind.db_marker()
        ))
    })?;
    let array = captures.get(1).map_or("", |m| m.as_str());
    serde_json::from_str(array)
        .map_err(|err| GenerationError::MalformedOutput(format!("array is not valid JSON: {err}")))
}

fn string_eq(record: &JsonValue, key: &str, expected: &str) -> bool {
    record.get(key).and_then(JsonValue::as_str) == Some(expected)
}

fn is_null(record: &JsonValue, key: &str) -> bool {
    record.get(key).is_some_and(JsonValue::is_null)
}

/// Check a parsed record array against the hidden-detail rules for `target`,
/// stopping at the first violation.
pub fn validate_records(target: &Target, records: &[JsonValue]) -> Result<(), ValidationFailure> {
    if !(MIN_RECORDS..=MAX_RECORDS).contains(&records.len()) {
        return Err(ValidationFailure::whole(format!(
            "record count {} outside {MIN_RECORDS}..={MAX_RECORDS}",
            records.len()
        )));
    }

    for (index, record) in records.iter().enumerate() {
        let Some(object) = record.as_object() else {
            return Err(ValidationFailure::at(index, None, "record is not an object"));
        };
        if let Some(missing) = REQUIRED_KEYS.iter().find(|k| !object.contains_key(**k)) {
            return Err(ValidationFailure::at(
                index,
                Some(*missing),
                format!("required key `{missing}` is missing"),
            ));
        }
        if let Some(forbidden) = FORBIDDEN_KEYS.iter().find(|k| object.contains_key(**k)) {
            return Err(ValidationFailure::at(
                index,
                Some(*forbidden),
                format!("detail key `{forbidden}` must be withheld"),
            ));
        }
    }

    let type_label = target.kind.type_label();
    let scope = target.axis().as_str();
    for (index, record) in records.iter().enumerate() {
        if !string_eq(record, "type", type_label) {
            return Err(ValidationFailure::at(
                index,
                Some("type"),
                format!("type is {} (expected \"{type_label}\")", record["type"]),
            ));
        }
        if !string_eq(record, "scope", scope) {
            return Err(ValidationFailure::at(
                index,
                Some("scope"),
                format!("scope is {} (expected \"{scope}\")", record["scope"]),
            ));
        }
    }

    let (expected, nulls): (Vec<(&str, &str)>, &[&str]) = match &target.location {
        Location::Area { prefecture, city } => (
            vec![("area", prefecture.as_str()), ("city", city.as_str())],
            &["rail_company", "line", "station"][..],
        ),
        Location::Station {
            rail_company,
            line,
            station,
        } => (
            vec![
                ("rail_company", rail_company.as_str()),
                ("line", line.as_str()),
                ("station", station.as_str()),
            ],
            &["area", "city"][..],
        ),
    };
    for (index, record) in records.iter().enumerate() {
        for (key, value) in &expected {
            if !string_eq(record, key, value) {
                return Err(ValidationFailure::at(
                    index,
                    Some(*key),
                    format!("{key} is {} (expected \"{value}\")", record[*key]),
                ));
            }
        }
        for key in nulls {
            if !is_null(record, key) {
                return Err(ValidationFailure::at(
                    index,
                    Some(*key),
                    format!("{key} must be null for a {scope} target"),
                ));
            }
        }
    }

    Ok(())
}

/// Parse raw tool output and validate it for `target`.
pub fn parse_and_validate(target: &Target, output: &str) -> Result<Vec<JsonValue>, GenerationError> {
    let records = extract_records(target.kind, output)?;
    validate_records(target, &records).map_err(GenerationError::ValidationFailed)?;
    Ok(records)
}
