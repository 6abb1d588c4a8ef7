use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

pub const DEFAULT_TOLERANCE_MINUTES: u32 = 10;
pub const DEFAULT_PRIMARY_RUN_FIELD: &str = "RunNumber";
pub const DEFAULT_SUMMARY_RUN_FIELD: &str = "RunNumber";
pub const DEFAULT_RUN_CATALOG_FIELD: &str = "runNumber";
pub const FILE_NAME_FIELD: &str = "fileName";
pub const CREATE_TIME_FIELD: &str = "createTime";
pub const PATH_FIELD: &str = "path";

const MILLIS_PER_MINUTE: u64 = 60_000;
const RUN_CATALOG_LABEL: &str = "run";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CurationError {
    #[error(
        "schema error in {catalog} catalog: {} record(s) failed normalization; first: {}",
        .failures.len(),
        first_failure(.failures)
    )]
    Schema { catalog: String, failures: Vec<SchemaFailure> },
    #[error(
        "incomplete group for run {}: {} primary and {} quality-summary record(s) by path",
        .0.run_number,
        .0.primary_count,
        .0.summary_count
    )]
    IncompleteGroup(IncompleteGroup),
    #[error("config error: {0}")]
    Config(String),
}

fn first_failure(failures: &[SchemaFailure]) -> String {
    failures.first().map_or_else(|| "<none>".to_string(), ToString::to_string)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Primary,
    QualitySummary,
}

impl Category {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::QualitySummary => "quality_summary",
        }
    }
}

impl Display for Category {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One archived-object metadata entry after normalization.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ObjectRecord {
    pub run_number: u64,
    pub category: Category,
    pub file_name: String,
    /// Milliseconds since the Unix epoch.
    pub create_time: i64,
    pub path: String,
}

impl ObjectRecord {
    #[must_use]
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            run_number: self.run_number,
            file_name: self.file_name.clone(),
            create_time: self.create_time,
        }
    }
}

/// Composite identity of an object. Includes the run so groups never collide.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ObjectKey {
    pub run_number: u64,
    pub file_name: String,
    pub create_time: i64,
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.run_number, self.file_name, self.create_time)
    }
}

/// Render a millisecond timestamp as RFC 3339, falling back to the raw value.
#[must_use]
pub fn format_create_time(create_time: i64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(create_time) * 1_000_000)
        .ok()
        .and_then(|at| at.format(&time::format_description::well_known::Rfc3339).ok())
        .unwrap_or_else(|| format!("{create_time}ms"))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SchemaFailure {
    pub index: usize,
    pub field: String,
    pub reason: String,
}

impl SchemaFailure {
    fn new(index: usize, field: &str, reason: impl Into<String>) -> Self {
        Self { index, field: field.to_string(), reason: reason.into() }
    }
}

impl Display for SchemaFailure {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "record {}: field `{}` {}", self.index, self.field, self.reason)
    }
}

/// Look up a field by exact key first, then as a dotted path into nested objects.
fn lookup_field<'a>(object: &'a Map<String, Value>, field: &str) -> Option<&'a Value> {
    if let Some(value) = object.get(field) {
        return Some(value);
    }

    let mut parts = field.split('.');
    let mut current = object.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[allow(clippy::float_cmp, clippy::cast_possible_truncation)]
fn integral_float(value: f64) -> Option<i64> {
    if !value.is_finite() || value.fract() != 0.0 || value.abs() >= 9.0e18 {
        return None;
    }
    Some(value as i64)
}

fn coerce_integer(value: &Value) -> Result<i64, String> {
    match value {
        Value::Number(number) => {
            if let Some(parsed) = number.as_i64() {
                return Ok(parsed);
            }
            if number.as_u64().is_some() {
                return Err(format!("is out of range: {number}"));
            }
            number
                .as_f64()
                .and_then(integral_float)
                .ok_or_else(|| format!("is not an integer: {number}"))
        }
        Value::String(raw) => {
            let trimmed = raw.trim();
            trimmed.parse::<i64>().map_err(|_| format!("is not an integer: {raw:?}"))
        }
        other => Err(format!("has unsupported type {}", json_type_name(other))),
    }
}

/// Coerce a catalog run identifier (number, integral float, or numeric string).
///
/// # Errors
/// Returns a human-readable reason when the value is not a non-negative integer.
pub fn coerce_run_number(value: &Value) -> Result<u64, String> {
    if let Some(parsed) = value.as_u64() {
        return Ok(parsed);
    }
    let parsed = coerce_integer(value)?;
    u64::try_from(parsed).map_err(|_| format!("must be non-negative, got {parsed}"))
}

fn required_string(
    index: usize,
    object: &Map<String, Value>,
    field: &str,
) -> Result<String, SchemaFailure> {
    match lookup_field(object, field) {
        None => Err(SchemaFailure::new(index, field, "is missing")),
        Some(Value::String(value)) if !value.trim().is_empty() => Ok(value.clone()),
        Some(Value::String(_)) => Err(SchemaFailure::new(index, field, "is empty")),
        Some(other) => Err(SchemaFailure::new(
            index,
            field,
            format!("has unsupported type {}", json_type_name(other)),
        )),
    }
}

fn normalize_entry(
    index: usize,
    entry: &Value,
    category: Category,
    run_field: &str,
) -> Result<ObjectRecord, SchemaFailure> {
    let Some(object) = entry.as_object() else {
        return Err(SchemaFailure::new(index, "<record>", "is not a JSON object"));
    };

    let run_number = lookup_field(object, run_field)
        .ok_or_else(|| SchemaFailure::new(index, run_field, "is missing"))
        .and_then(|value| {
            coerce_run_number(value).map_err(|reason| SchemaFailure::new(index, run_field, reason))
        })?;
    let file_name = required_string(index, object, FILE_NAME_FIELD)?;
    let create_time = lookup_field(object, CREATE_TIME_FIELD)
        .ok_or_else(|| SchemaFailure::new(index, CREATE_TIME_FIELD, "is missing"))
        .and_then(|value| {
            coerce_integer(value)
                .map_err(|reason| SchemaFailure::new(index, CREATE_TIME_FIELD, reason))
        })?;
    let path = required_string(index, object, PATH_FIELD)?;

    Ok(ObjectRecord { run_number, category, file_name, create_time, path })
}

/// Normalize raw catalog entries into [`ObjectRecord`]s of one category.
///
/// Every entry is checked; malformed entries are collected rather than dropped.
///
/// # Errors
/// Returns [`CurationError::Schema`] listing every failed entry when any entry
/// lacks a coercible run identifier or a required field, and
/// [`CurationError::Config`] when `run_field` is blank.
pub fn normalize_catalog(
    raw: &[Value],
    category: Category,
    run_field: &str,
) -> Result<Vec<ObjectRecord>, CurationError> {
    if run_field.trim().is_empty() {
        return Err(CurationError::Config(format!(
            "run identifier field MUST be named for the {category} catalog"
        )));
    }

    let mut records = Vec::with_capacity(raw.len());
    let mut failures = Vec::new();
    for (index, entry) in raw.iter().enumerate() {
        match normalize_entry(index, entry, category, run_field) {
            Ok(record) => records.push(record),
            Err(failure) => failures.push(failure),
        }
    }

    if failures.is_empty() {
        Ok(records)
    } else {
        Err(CurationError::Schema { catalog: category.as_str().to_string(), failures })
    }
}

/// Normalize an accepted-run listing: bare integers or run objects carrying `run_field`.
///
/// # Errors
/// Returns [`CurationError::Schema`] when any entry cannot be coerced to a run number.
pub fn normalize_run_catalog(raw: &[Value], run_field: &str) -> Result<BTreeSet<u64>, CurationError> {
    let mut runs = BTreeSet::new();
    let mut failures = Vec::new();

    for (index, entry) in raw.iter().enumerate() {
        let value = match entry {
            Value::Object(object) => match lookup_field(object, run_field) {
                Some(value) => value,
                None => {
                    failures.push(SchemaFailure::new(index, run_field, "is missing"));
                    continue;
                }
            },
            other => other,
        };
        match coerce_run_number(value) {
            Ok(run_number) => {
                runs.insert(run_number);
            }
            Err(reason) => failures.push(SchemaFailure::new(index, run_field, reason)),
        }
    }

    if failures.is_empty() {
        Ok(runs)
    } else {
        Err(CurationError::Schema { catalog: RUN_CATALOG_LABEL.to_string(), failures })
    }
}

/// Keep records whose run is accepted, preserving catalog order.
#[must_use]
pub fn filter_accepted_runs(records: &[ObjectRecord], accepted: &BTreeSet<u64>) -> Vec<ObjectRecord> {
    records.iter().filter(|record| accepted.contains(&record.run_number)).cloned().collect()
}

/// Drop repeated identities, keeping first occurrences in order.
///
/// Returns the unique records and the number of dropped duplicates.
#[must_use]
pub fn dedup_by_identity(records: &[ObjectRecord]) -> (Vec<ObjectRecord>, usize) {
    let mut seen = ClaimedSet::new();
    let mut unique = Vec::with_capacity(records.len());
    let mut duplicates = 0_usize;
    for record in records {
        if seen.claim(record.key()) {
            unique.push(record.clone());
        } else {
            duplicates += 1;
        }
    }
    (unique, duplicates)
}

pub type QualityAnnotations = BTreeMap<String, String>;
pub type QualityMapping = BTreeMap<String, QualityAnnotations>;

/// Parse one annotation text line of the form `...{key: value}...`.
///
/// Only the first braced segment is considered, and it is split at its first `:`.
#[must_use]
pub fn parse_annotation_line(line: &str) -> Option<(String, String)> {
    let open = line.find('{')?;
    let rest = &line[open + 1..];
    let close = rest.find('}')?;
    let (key, value) = rest[..close].split_once(':')?;
    Some((key.trim().to_string(), value.trim().to_string()))
}

/// Build the annotations of one object from its text lines. Later keys overwrite earlier ones.
#[must_use]
pub fn annotations_from_lines<'a, I>(lines: I) -> QualityAnnotations
where
    I: IntoIterator<Item = &'a str>,
{
    lines.into_iter().filter_map(parse_annotation_line).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct QualityConstraint {
    pub key: String,
    pub value: String,
}

impl QualityConstraint {
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }

    /// Parse a `key=value` constraint. The key may contain spaces.
    ///
    /// # Errors
    /// Returns [`CurationError::Config`] when `=` is missing or the key is blank.
    pub fn parse(raw: &str) -> Result<Self, CurationError> {
        let Some((key, value)) = raw.split_once('=') else {
            return Err(CurationError::Config(format!(
                "quality constraint MUST be formatted as key=value: {raw:?}"
            )));
        };
        let key = key.trim();
        if key.is_empty() {
            return Err(CurationError::Config(format!(
                "quality constraint key MUST be non-empty: {raw:?}"
            )));
        }
        Ok(Self::new(key, value.trim()))
    }

    #[must_use]
    pub fn is_satisfied_by(&self, annotations: &QualityAnnotations) -> bool {
        annotations.get(&self.key).is_some_and(|actual| *actual == self.value)
    }
}

/// Conjunction of exact-match constraints. Empty accepts every annotated object.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct QualityPredicate {
    pub constraints: Vec<QualityConstraint>,
}

impl QualityPredicate {
    #[must_use]
    pub fn new(constraints: Vec<QualityConstraint>) -> Self {
        Self { constraints }
    }

    #[must_use]
    pub fn accept_all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    #[must_use]
    pub fn matches(&self, annotations: &QualityAnnotations) -> bool {
        self.constraints.iter().all(|constraint| constraint.is_satisfied_by(annotations))
    }
}

impl Display for QualityPredicate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.constraints.is_empty() {
            return f.write_str("<accept all>");
        }
        let rendered = self
            .constraints
            .iter()
            .map(|constraint| format!("{:?} == {:?}", constraint.key, constraint.value))
            .collect::<Vec<_>>();
        f.write_str(&rendered.join(" AND "))
    }
}

/// A quality-summary record with no extracted annotations. Non-fatal.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ExtractionGap {
    pub run_number: u64,
    pub file_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct QualityFilterOutcome {
    pub accepted: Vec<ObjectRecord>,
    pub gaps: Vec<ExtractionGap>,
    pub rejected: usize,
}

/// Keep quality-summary records whose annotations satisfy `predicate`.
///
/// Records without a mapping entry are reported as [`ExtractionGap`]s.
#[must_use]
pub fn filter_by_quality(
    records: &[ObjectRecord],
    mapping: &QualityMapping,
    predicate: &QualityPredicate,
) -> QualityFilterOutcome {
    let mut outcome = QualityFilterOutcome::default();
    for record in records {
        let Some(annotations) = mapping.get(&record.file_name) else {
            outcome.gaps.push(ExtractionGap {
                run_number: record.run_number,
                file_name: record.file_name.clone(),
            });
            continue;
        };

        if predicate.matches(annotations) {
            outcome.accepted.push(record.clone());
        } else {
            outcome.rejected += 1;
        }
    }
    outcome
}

/// Schema paths that identify each category inside a run group.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CategoryPaths {
    pub primary: String,
    pub summary: String,
}

impl CategoryPaths {
    /// # Errors
    /// Returns [`CurationError::Config`] when a path is blank or both paths are equal.
    pub fn new(primary: impl Into<String>, summary: impl Into<String>) -> Result<Self, CurationError> {
        let paths = Self { primary: primary.into(), summary: summary.into() };
        if paths.primary.trim().is_empty() || paths.summary.trim().is_empty() {
            return Err(CurationError::Config("category schema paths MUST be non-empty".to_string()));
        }
        if paths.primary == paths.summary {
            return Err(CurationError::Config(format!(
                "category schema paths MUST differ, both are {:?}",
                paths.primary
            )));
        }
        Ok(paths)
    }

    #[must_use]
    pub fn classify(&self, path: &str) -> Option<Category> {
        if path == self.primary {
            Some(Category::Primary)
        } else if path == self.summary {
            Some(Category::QualitySummary)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum IncompleteGroupPolicy {
    #[default]
    Fatal,
    Skip,
}

impl IncompleteGroupPolicy {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fatal => "fatal",
            Self::Skip => "skip",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "fatal" => Some(Self::Fatal),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GroupRecordDump {
    pub category: Category,
    pub path: String,
    pub file_name: String,
    pub create_time: i64,
    pub created_at: String,
}

impl From<&ObjectRecord> for GroupRecordDump {
    fn from(record: &ObjectRecord) -> Self {
        Self {
            category: record.category,
            path: record.path.clone(),
            file_name: record.file_name.clone(),
            create_time: record.create_time,
            created_at: format_create_time(record.create_time),
        }
    }
}

/// Diagnostic snapshot of a run group missing one category.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct IncompleteGroup {
    pub run_number: u64,
    pub primary_count: usize,
    pub summary_count: usize,
    pub records: Vec<GroupRecordDump>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RunGroup {
    pub run_number: u64,
    pub summaries: Vec<ObjectRecord>,
    pub primaries: Vec<ObjectRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct JoinOutcome {
    pub groups: Vec<RunGroup>,
    pub skipped: Vec<IncompleteGroup>,
    pub common_runs: usize,
    pub primary_only_runs: Vec<u64>,
    pub summary_only_runs: Vec<u64>,
    pub unclassified_records: usize,
}

impl JoinOutcome {
    #[must_use]
    pub fn eligible_group_primaries(&self) -> usize {
        self.groups.iter().map(|group| group.primaries.len()).sum()
    }
}

/// Group both filtered sets by run and keep groups holding both categories.
///
/// Only runs present in both sets are grouped. Inside a group, category
/// membership is decided by `path`; records matching neither path are counted
/// as unclassified. Groups are ordered by run number ascending, and each
/// category keeps the order of its input slice.
///
/// # Errors
/// Returns [`CurationError::IncompleteGroup`] for the first group lacking a
/// category when `policy` is [`IncompleteGroupPolicy::Fatal`].
pub fn join_by_run(
    primaries: &[ObjectRecord],
    summaries: &[ObjectRecord],
    paths: &CategoryPaths,
    policy: IncompleteGroupPolicy,
) -> Result<JoinOutcome, CurationError> {
    let primary_runs = primaries.iter().map(|record| record.run_number).collect::<BTreeSet<_>>();
    let summary_runs = summaries.iter().map(|record| record.run_number).collect::<BTreeSet<_>>();
    let common = primary_runs.intersection(&summary_runs).copied().collect::<BTreeSet<_>>();

    let mut outcome = JoinOutcome {
        common_runs: common.len(),
        primary_only_runs: primary_runs.difference(&summary_runs).copied().collect(),
        summary_only_runs: summary_runs.difference(&primary_runs).copied().collect(),
        ..JoinOutcome::default()
    };

    let mut partitions: BTreeMap<u64, Vec<&ObjectRecord>> = BTreeMap::new();
    for record in primaries.iter().chain(summaries) {
        if common.contains(&record.run_number) {
            partitions.entry(record.run_number).or_default().push(record);
        }
    }

    for (run_number, records) in partitions {
        let mut group = RunGroup { run_number, summaries: Vec::new(), primaries: Vec::new() };
        for record in &records {
            match paths.classify(&record.path) {
                Some(Category::Primary) => group.primaries.push((*record).clone()),
                Some(Category::QualitySummary) => group.summaries.push((*record).clone()),
                None => outcome.unclassified_records += 1,
            }
        }

        if group.primaries.is_empty() || group.summaries.is_empty() {
            let incomplete = IncompleteGroup {
                run_number,
                primary_count: group.primaries.len(),
                summary_count: group.summaries.len(),
                records: records.iter().map(|record| GroupRecordDump::from(*record)).collect(),
            };
            match policy {
                IncompleteGroupPolicy::Fatal => {
                    return Err(CurationError::IncompleteGroup(incomplete));
                }
                IncompleteGroupPolicy::Skip => {
                    outcome.skipped.push(incomplete);
                    continue;
                }
            }
        }

        outcome.groups.push(group);
    }

    Ok(outcome)
}

/// Maximum absolute distance, exclusive, between a summary and a primary.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ToleranceWindow {
    minutes: u32,
}

impl ToleranceWindow {
    /// # Errors
    /// Returns [`CurationError::Config`] for a zero-minute window, which can never match.
    pub fn from_minutes(minutes: u32) -> Result<Self, CurationError> {
        if minutes == 0 {
            return Err(CurationError::Config("tolerance_minutes MUST be >= 1".to_string()));
        }
        Ok(Self { minutes })
    }

    #[must_use]
    pub fn minutes(self) -> u32 {
        self.minutes
    }

    #[must_use]
    pub fn as_millis(self) -> u64 {
        u64::from(self.minutes) * MILLIS_PER_MINUTE
    }

    #[must_use]
    pub fn contains(self, diff_ms: u64) -> bool {
        diff_ms < self.as_millis()
    }
}

impl Default for ToleranceWindow {
    fn default() -> Self {
        Self { minutes: DEFAULT_TOLERANCE_MINUTES }
    }
}

/// Identities already claimed during one correlation pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(transparent)]
pub struct ClaimedSet {
    keys: BTreeSet<ObjectKey>,
}

impl ClaimedSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when `key` was not claimed before.
    pub fn claim(&mut self, key: ObjectKey) -> bool {
        self.keys.insert(key)
    }

    #[must_use]
    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.keys.contains(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Match {
    pub run_number: u64,
    pub summary: ObjectRecord,
    pub primary: ObjectRecord,
    pub diff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct GroupCorrelation {
    pub run_number: u64,
    pub summaries: usize,
    pub primaries: usize,
    pub claimed: usize,
    pub skipped_already_claimed: usize,
    pub unclaimed_primaries: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Correlation {
    pub matches: Vec<Match>,
    pub claimed: ClaimedSet,
    pub groups: Vec<GroupCorrelation>,
}

impl Correlation {
    #[must_use]
    pub fn claimed_primaries(&self) -> usize {
        self.claimed.len()
    }

    #[must_use]
    pub fn skipped_already_claimed(&self) -> usize {
        self.groups.iter().map(|group| group.skipped_already_claimed).sum()
    }}

/// Claim the primaries of one group for its summaries, in summary order.
///
/// A summary claims every in-window primary not yet in `claimed`; an earlier
/// summary therefore wins a shared primary even when a later one is closer.
pub fn correlate_group(
    group: &RunGroup,
    tolerance: ToleranceWindow,
    claimed: &mut ClaimedSet,
) -> (Vec<Match>, GroupCorrelation) {
    let mut matches = Vec::new();
    let mut skipped_already_claimed = 0_usize;

    for summary in &group.summaries {
        for primary in &group.primaries {
            let diff_ms = primary.create_time.abs_diff(summary.create_time);
            if !tolerance.contains(diff_ms) {
                continue;
            }
            if !claimed.claim(primary.key()) {
                skipped_already_claimed += 1;
                continue;
            }
            matches.push(Match {
                run_number: group.run_number,
                summary: summary.clone(),
                primary: primary.clone(),
                diff_ms,
            });
        }
    }

    let unclaimed_primaries =
        group.primaries.iter().filter(|primary| !claimed.contains(&primary.key())).count();
    let stats = GroupCorrelation {
        run_number: group.run_number,
        summaries: group.summaries.len(),
        primaries: group.primaries.len(),
        claimed: matches.len(),
        skipped_already_claimed,
        unclaimed_primaries,
    };
    (matches, stats)
}

/// Correlate every eligible group with one fresh [`ClaimedSet`].
#[must_use]
pub fn correlate(groups: &[RunGroup], tolerance: ToleranceWindow) -> Correlation {
    let mut correlation = Correlation::default();
    for group in groups {
        let (matches, stats) = correlate_group(group, tolerance, &mut correlation.claimed);
        correlation.matches.extend(matches);
        correlation.groups.push(stats);
    }
    correlation
}
