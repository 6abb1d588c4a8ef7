use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Context, Result};
use qc_curator_core::{
    annotations_from_lines, correlate, dedup_by_identity, filter_accepted_runs, filter_by_quality,
    format_create_time, join_by_run, normalize_catalog, normalize_run_catalog, Category,
    CategoryPaths, CurationError, ExtractionGap, IncompleteGroup, IncompleteGroupPolicy, Match,
    ObjectRecord, QualityMapping, QualityPredicate, ToleranceWindow, DEFAULT_PRIMARY_RUN_FIELD,
    DEFAULT_RUN_CATALOG_FIELD, DEFAULT_SUMMARY_RUN_FIELD, DEFAULT_TOLERANCE_MINUTES,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

const ANNOTATION_DUMP_EXTENSION: &str = "txt";

/// Where one metadata catalog and its object files live under the source root.
///
/// A catalog at `qc/TPC/MO/Clusters/c_Sides_N_Clusters.json` describes objects
/// stored in `qc/TPC/MO/Clusters/c_Sides_N_Clusters/`, and its records carry
/// `qc/TPC/MO/Clusters/c_Sides_N_Clusters` in their `path` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogLayout {
    source_root: PathBuf,
    catalog: PathBuf,
}

impl CatalogLayout {
    /// # Errors
    /// Returns an error when `catalog` is absolute, escapes the source root, or has no file stem.
    pub fn new(source_root: &Path, catalog: &Path) -> Result<Self> {
        if catalog.as_os_str().is_empty() {
            return Err(CurationError::Config("catalog path MUST be non-empty".to_string()).into());
        }
        for component in catalog.components() {
            if !matches!(component, Component::Normal(_) | Component::CurDir) {
                return Err(CurationError::Config(format!(
                    "catalog path MUST be relative to the source root without `..`: {}",
                    catalog.display()
                ))
                .into());
            }
        }
        if catalog.file_stem().is_none() {
            return Err(CurationError::Config(format!(
                "catalog path has no file name: {}",
                catalog.display()
            ))
            .into());
        }

        Ok(Self { source_root: source_root.to_path_buf(), catalog: catalog.to_path_buf() })
    }

    #[must_use]
    pub fn catalog_file(&self) -> PathBuf {
        self.source_root.join(&self.catalog)
    }

    #[must_use]
    pub fn object_dir(&self) -> PathBuf {
        self.source_root.join(self.catalog.with_extension(""))
    }

    /// Schema path expected in the `path` field of this catalog's records.
    #[must_use]
    pub fn schema_path(&self) -> String {
        self.catalog
            .with_extension("")
            .components()
            .filter_map(|component| match component {
                Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// Read a JSON file holding an array of entries.
///
/// # Errors
/// Returns an error when the file cannot be read, is not JSON, or is not an array.
pub fn read_json_array(path: &Path) -> Result<Vec<Value>> {
    let bytes =
        fs::read(path).with_context(|| format!("failed to read JSON file {}", path.display()))?;
    let value: Value = serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse JSON file {}", path.display()))?;
    match value {
        Value::Array(entries) => Ok(entries),
        other => Err(anyhow!(
            "expected a JSON array in {}, found {}",
            path.display(),
            match other {
                Value::Object(_) => "an object",
                _ => "a scalar",
            }
        )),
    }
}

/// Load and normalize one metadata catalog.
///
/// # Errors
/// Returns an error when the catalog cannot be read or any entry fails normalization.
pub fn load_catalog(
    layout: &CatalogLayout,
    category: Category,
    run_field: &str,
) -> Result<Vec<ObjectRecord>> {
    let catalog_file = layout.catalog_file();
    let raw = read_json_array(&catalog_file)?;
    let records = normalize_catalog(&raw, category, run_field)
        .with_context(|| format!("failed to normalize {category} catalog {}", catalog_file.display()))?;
    debug!(catalog = %catalog_file.display(), %category, records = records.len(), "catalog loaded");
    Ok(records)
}

/// Load accepted run identifiers from a run-bookkeeping export.
///
/// # Errors
/// Returns an error when the file cannot be read or an entry has no usable run identifier.
pub fn load_accepted_runs(path: &Path, run_field: &str) -> Result<BTreeSet<u64>> {
    let raw = read_json_array(path)?;
    normalize_run_catalog(&raw, run_field)
        .with_context(|| format!("failed to normalize accepted runs {}", path.display()))
}

/// Load a ready `fileName -> {key: value}` quality mapping.
///
/// # Errors
/// Returns an error when the file cannot be read or does not hold string annotations.
pub fn load_quality_mapping(path: &Path) -> Result<QualityMapping> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read quality mapping {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse quality mapping {}", path.display()))
}

/// Build a quality mapping from `<fileName>.txt` annotation dumps.
///
/// Dumps that cannot be read or yield no `{key: value}` line get no entry.
///
/// # Errors
/// Returns an error when the directory itself cannot be listed.
pub fn load_quality_annotations(dir: &Path) -> Result<QualityMapping> {
    let entries = fs::read_dir(dir)
        .with_context(|| format!("failed to list annotation directory {}", dir.display()))?;

    let mut dumps = Vec::new();
    for entry in entries {
        let entry =
            entry.with_context(|| format!("failed to list annotation directory {}", dir.display()))?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(ANNOTATION_DUMP_EXTENSION) {
            continue;
        }
        let Some(file_name) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        dumps.push((file_name.to_string(), path));
    }
    dumps.sort();

    let mut mapping = QualityMapping::new();
    for (file_name, path) in dumps {
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) => {
                warn!(dump = %path.display(), error = %err, "annotation dump unreadable");
                continue;
            }
        };
        let annotations = annotations_from_lines(text.lines());
        if annotations.is_empty() {
            debug!(dump = %path.display(), "annotation dump holds no key/value line");
            continue;
        }
        mapping.insert(file_name, annotations);
    }

    info!(
        dumps_dir = %dir.display(),
        extracted = mapping.len(),
        "quality annotations extracted"
    );
    Ok(mapping)
}

/// Settings for one curation or run-selection pass.
///
/// Catalog paths are relative to `source_root`; every other path is used as given.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct CurationConfig {
    pub source_root: PathBuf,
    pub primary_catalog: Option<PathBuf>,
    pub summary_catalog: Option<PathBuf>,
    pub accepted_runs: Option<PathBuf>,
    pub quality_mapping: Option<PathBuf>,
    pub quality_annotations: Option<PathBuf>,
    pub destination: Option<PathBuf>,
    pub tolerance_minutes: u32,
    pub incomplete_groups: IncompleteGroupPolicy,
    pub predicate: QualityPredicate,
    pub primary_run_field: String,
    pub summary_run_field: String,
    pub run_catalog_field: String,
    pub primary_path: Option<String>,
    pub summary_path: Option<String>,
    pub manifest: Option<PathBuf>,
    pub dry_run: bool,
}

impl Default for CurationConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("."),
            primary_catalog: None,
            summary_catalog: None,
            accepted_runs: None,
            quality_mapping: None,
            quality_annotations: None,
            destination: None,
            tolerance_minutes: DEFAULT_TOLERANCE_MINUTES,
            incomplete_groups: IncompleteGroupPolicy::Fatal,
            predicate: QualityPredicate::accept_all(),
            primary_run_field: DEFAULT_PRIMARY_RUN_FIELD.to_string(),
            summary_run_field: DEFAULT_SUMMARY_RUN_FIELD.to_string(),
            run_catalog_field: DEFAULT_RUN_CATALOG_FIELD.to_string(),
            primary_path: None,
            summary_path: None,
            manifest: None,
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QualitySource {
    Mapping(PathBuf),
    Annotations(PathBuf),
}

#[derive(Debug, Clone)]
struct RunSelectionPlan {
    primary: CatalogLayout,
    accepted_runs: PathBuf,
    destination: PathBuf,
}

#[derive(Debug, Clone)]
struct CurationPlan {
    selection: RunSelectionPlan,
    summary: CatalogLayout,
    quality: QualitySource,
    paths: CategoryPaths,
    tolerance: ToleranceWindow,
}

fn required<'a, T>(value: Option<&'a T>, name: &str) -> Result<&'a T> {
    value.ok_or_else(|| CurationError::Config(format!("{name} MUST be configured")).into())
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}

fn resolve(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir().map_or_else(|_| path.to_path_buf(), |cwd| cwd.join(path))
        };
        lexical_normalize(&absolute)
    })
}

impl CurationConfig {
    /// Load a YAML configuration file. Absent fields take their defaults.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or is not a valid configuration.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_yaml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// # Errors
    /// Returns an error when `primary_catalog` is unset or not a valid relative catalog path.
    pub fn primary_layout(&self) -> Result<CatalogLayout> {
        let catalog = required(self.primary_catalog.as_ref(), "primary_catalog")?;
        CatalogLayout::new(&self.source_root, catalog)
    }

    /// # Errors
    /// Returns an error when `summary_catalog` is unset or not a valid relative catalog path.
    pub fn summary_layout(&self) -> Result<CatalogLayout> {
        let catalog = required(self.summary_catalog.as_ref(), "summary_catalog")?;
        CatalogLayout::new(&self.source_root, catalog)
    }

    /// # Errors
    /// Returns an error when neither or both quality sources are configured.
    pub fn quality_source(&self) -> Result<QualitySource> {
        match (&self.quality_mapping, &self.quality_annotations) {
            (Some(mapping), None) => Ok(QualitySource::Mapping(mapping.clone())),
            (None, Some(dir)) => Ok(QualitySource::Annotations(dir.clone())),
            (Some(_), Some(_)) => Err(CurationError::Config(
                "quality_mapping and quality_annotations are mutually exclusive".to_string(),
            )
            .into()),
            (None, None) => Err(CurationError::Config(
                "a quality source (quality_mapping or quality_annotations) MUST be configured"
                    .to_string(),
            )
            .into()),
        }
    }

    fn run_selection_plan(&self) -> Result<RunSelectionPlan> {
        let primary = self.primary_layout()?;
        let accepted_runs = required(self.accepted_runs.as_ref(), "accepted_runs")?.clone();
        let destination = required(self.destination.as_ref(), "destination")?.clone();

        let destination_resolved = resolve(&destination);
        if destination_resolved == resolve(&primary.object_dir()) {
            return Err(CurationError::Config(format!(
                "destination {} MUST differ from the primary object directory",
                destination.display()
            ))
            .into());
        }
        if let Some(manifest) = &self.manifest {
            if resolve(manifest).starts_with(&destination_resolved) {
                return Err(CurationError::Config(format!(
                    "manifest {} MUST be written outside the destination directory",
                    manifest.display()
                ))
                .into());
            }
        }

        Ok(RunSelectionPlan { primary, accepted_runs, destination })
    }

    fn curation_plan(&self) -> Result<CurationPlan> {
        let selection = self.run_selection_plan()?;
        let summary = self.summary_layout()?;
        let quality = self.quality_source()?;
        let tolerance = ToleranceWindow::from_minutes(self.tolerance_minutes)?;
        let paths = CategoryPaths::new(
            self.primary_path.clone().unwrap_or_else(|| selection.primary.schema_path()),
            self.summary_path.clone().unwrap_or_else(|| summary.schema_path()),
        )?;

        Ok(CurationPlan { selection, summary, quality, paths, tolerance })
    }

    /// Check that every setting a curation pass needs is present and consistent.
    ///
    /// # Errors
    /// Returns a [`CurationError::Config`] describing the first invalid setting.
    pub fn validate_curation(&self) -> Result<()> {
        self.curation_plan().map(|_| ())
    }

    /// Check the settings needed by a run-only selection pass.
    ///
    /// # Errors
    /// Returns a [`CurationError::Config`] describing the first invalid setting.
    pub fn validate_run_selection(&self) -> Result<()> {
        self.run_selection_plan().map(|_| ())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CopyFailure {
    pub run_number: u64,
    pub file_name: String,
    pub source_path: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaterializedObject {
    pub run_number: u64,
    pub file_name: String,
    pub summary_file_name: Option<String>,
    pub bytes: u64,
    pub destination_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MaterializeReport {
    pub copied: Vec<MaterializedObject>,
    pub failures: Vec<CopyFailure>,
    pub file_name_collisions: usize,
}

fn is_plain_file_name(file_name: &str) -> bool {
    !file_name.is_empty()
        && file_name != "."
        && file_name != ".."
        && !file_name.contains('/')
        && !file_name.contains('\\')
}

/// Copies claimed primary objects into a flat destination directory.
///
/// Each destination file name is written at most once per materializer; a
/// repeated name from a distinct record is counted as a collision.
#[derive(Debug)]
pub struct Materializer {
    source_dir: PathBuf,
    destination: PathBuf,
    dry_run: bool,
    written: BTreeSet<String>,
}

impl Materializer {
    #[must_use]
    pub fn new(source_dir: &Path, destination: &Path, dry_run: bool) -> Self {
        Self {
            source_dir: source_dir.to_path_buf(),
            destination: destination.to_path_buf(),
            dry_run,
            written: BTreeSet::new(),
        }
    }

    /// Create the destination directory unless this is a dry run.
    ///
    /// # Errors
    /// Returns an error when the destination directory cannot be created.
    pub fn prepare(&self) -> Result<()> {
        if self.dry_run {
            return Ok(());
        }
        fs::create_dir_all(&self.destination).with_context(|| {
            format!("failed to create destination directory {}", self.destination.display())
        })
    }

    /// Copy one primary object. Failures are recorded in `report`, never raised.
    pub fn materialize(
        &mut self,
        primary: &ObjectRecord,
        summary_file_name: Option<&str>,
        report: &mut MaterializeReport,
    ) {
        let source_path = self.source_dir.join(&primary.file_name);
        let failure = |reason: String| CopyFailure {
            run_number: primary.run_number,
            file_name: primary.file_name.clone(),
            source_path: source_path.display().to_string(),
            reason,
        };

        if !is_plain_file_name(&primary.file_name) {
            warn!(run = primary.run_number, file = %primary.file_name, "refusing unsafe object file name");
            report.failures.push(failure("file name is not a plain file name".to_string()));
            return;
        }
        if self.written.contains(&primary.file_name) {
            warn!(
                run = primary.run_number,
                file = %primary.file_name,
                "destination file name already materialized by another record"
            );
            report.file_name_collisions += 1;
            return;
        }

        let destination_path = self.destination.join(&primary.file_name);
        let copied = if self.dry_run {
            fs::metadata(&source_path).and_then(|metadata| {
                if metadata.is_file() {
                    Ok(metadata.len())
                } else {
                    Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a regular file"))
                }
            })
        } else {
            fs::copy(&source_path, &destination_path)
        };

        match copied {
            Ok(bytes) => {
                self.written.insert(primary.file_name.clone());
                report.copied.push(MaterializedObject {
                    run_number: primary.run_number,
                    file_name: primary.file_name.clone(),
                    summary_file_name: summary_file_name.map(ToString::to_string),
                    bytes,
                    destination_path: destination_path.display().to_string(),
                });
            }
            Err(err) => {
                warn!(
                    run = primary.run_number,
                    file = %primary.file_name,
                    source = %source_path.display(),
                    error = %err,
                    "object copy failed"
                );
                report.failures.push(failure(err.to_string()));
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestEntry {
    pub file_name: String,
    pub run_number: u64,
    pub summary_file_name: Option<String>,
    pub bytes: u64,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CurationManifest {
    pub pass_id: String,
    pub generated_at: String,
    pub destination: String,
    pub files: Vec<ManifestEntry>,
}

fn file_sha256(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .with_context(|| format!("failed to open materialized file {}", path.display()))?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)
        .with_context(|| format!("failed to read materialized file {}", path.display()))?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Digest every materialized file and write the manifest JSON.
///
/// # Errors
/// Returns an error when a materialized file cannot be read or the manifest cannot be written.
pub fn write_manifest(
    path: &Path,
    pass_id: &str,
    destination: &Path,
    copied: &[MaterializedObject],
) -> Result<CurationManifest> {
    let mut files = Vec::with_capacity(copied.len());
    for object in copied {
        files.push(ManifestEntry {
            file_name: object.file_name.clone(),
            run_number: object.run_number,
            summary_file_name: object.summary_file_name.clone(),
            bytes: object.bytes,
            sha256: file_sha256(&destination.join(&object.file_name))?,
        });
    }

    let manifest = CurationManifest {
        pass_id: pass_id.to_string(),
        generated_at: now_rfc3339()?,
        destination: destination.display().to_string(),
        files,
    };

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create manifest directory {}", parent.display())
        })?;
    }
    let manifest_json =
        serde_json::to_vec_pretty(&manifest).context("failed to serialize curation manifest")?;
    fs::write(path, manifest_json)
        .with_context(|| format!("failed to write curation manifest {}", path.display()))?;

    Ok(manifest)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MatchSummary {
    pub run_number: u64,
    pub summary_file_name: String,
    pub summary_created_at: String,
    pub primary_file_name: String,
    pub primary_created_at: String,
    pub diff_ms: u64,
}

impl From<&Match> for MatchSummary {
    fn from(entry: &Match) -> Self {
        Self {
            run_number: entry.run_number,
            summary_file_name: entry.summary.file_name.clone(),
            summary_created_at: format_create_time(entry.summary.create_time),
            primary_file_name: entry.primary.file_name.clone(),
            primary_created_at: format_create_time(entry.primary.create_time),
            diff_ms: entry.diff_ms,
        }
    }
}

/// Operator-facing account of one curation pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CurationReport {
    pub pass_id: String,
    pub generated_at: String,
    pub tolerance_minutes: u32,
    pub incomplete_groups: IncompleteGroupPolicy,
    pub predicate: QualityPredicate,
    pub primaries_total: usize,
    pub primaries_run_accepted: usize,
    pub summaries_total: usize,
    pub summaries_run_accepted: usize,
    pub quality_entries: usize,
    pub summaries_quality_accepted: usize,
    pub predicate_rejections: usize,
    pub extraction_gaps: Vec<ExtractionGap>,
    pub common_runs: usize,
    pub primary_only_runs: Vec<u64>,
    pub summary_only_runs: Vec<u64>,
    pub unclassified_records: usize,
    pub eligible_groups: usize,
    pub skipped_groups: Vec<IncompleteGroup>,
    pub eligible_group_primaries: usize,
    pub claimed_primaries: usize,
    pub duplicate_candidates: usize,
    pub matches: Vec<MatchSummary>,
    pub materialized: usize,
    pub copy_failures: Vec<CopyFailure>,
    pub file_name_collisions: usize,
    pub aborted: bool,
    pub dry_run: bool,
    pub destination: String,
    pub manifest: Option<String>,
}

/// Account of a run-only selection pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunSelectionReport {
    pub pass_id: String,
    pub generated_at: String,
    pub accepted_runs: usize,
    pub primaries_total: usize,
    pub primaries_run_accepted: usize,
    pub duplicate_candidates: usize,
    pub materialized: usize,
    pub copy_failures: Vec<CopyFailure>,
    pub file_name_collisions: usize,
    pub aborted: bool,
    pub dry_run: bool,
    pub destination: String,
    pub manifest: Option<String>,
}

fn percent(part: usize, whole: usize) -> usize {
    if whole == 0 {
        0
    } else {
        part.saturating_mul(100) / whole
    }
}

/// JSON dump of an incomplete group for the error log, falling back to its `Debug` form.
fn incomplete_group_dump(group: &IncompleteGroup) -> String {
    serde_json::to_string(group)
        .unwrap_or_else(|err| format!("{group:?} (json dump failed: {err})"))
}

fn abort_requested(abort: Option<&AtomicBool>) -> bool {
    abort.is_some_and(|flag| flag.load(Ordering::SeqCst))
}

/// Materialize run groups in order, asking `should_abort` before each group.
///
/// Returns `true` when the pass stopped early. Files copied for earlier
/// groups stay in the destination and in `report`.
fn materialize_run_groups<'a, G, F>(
    materializer: &mut Materializer,
    groups: G,
    report: &mut MaterializeReport,
    mut should_abort: F,
) -> bool
where
    G: IntoIterator<Item = (u64, Vec<(&'a ObjectRecord, Option<&'a str>)>)>,
    F: FnMut() -> bool,
{
    for (run_number, entries) in groups {
        if should_abort() {
            warn!(next_run = run_number, "abort requested, stopping before run group");
            return true;
        }
        for (primary, summary_file_name) in entries {
            materializer.materialize(primary, summary_file_name, report);
        }
    }
    false
}

fn load_quality_source(source: &QualitySource) -> Result<QualityMapping> {
    match source {
        QualitySource::Mapping(path) => load_quality_mapping(path),
        QualitySource::Annotations(dir) => load_quality_annotations(dir),
    }
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn finish_manifest(
    config: &CurationConfig,
    pass_id: &str,
    destination: &Path,
    copied: &[MaterializedObject],
) -> Result<Option<String>> {
    let Some(path) = &config.manifest else {
        return Ok(None);
    };
    if config.dry_run {
        info!(manifest = %path.display(), "dry run, manifest not written");
        return Ok(None);
    }
    let manifest = write_manifest(path, pass_id, destination, copied)?;
    info!(manifest = %path.display(), files = manifest.files.len(), "curation manifest written");
    Ok(Some(path.display().to_string()))
}

/// Run a full curation pass: filter, join, correlate, then materialize.
///
/// `abort` is checked before each run group is materialized; once set, the
/// pass stops there, keeps files already copied and reports `aborted`.
///
/// # Errors
/// Returns an error on invalid configuration, unreadable inputs, a
/// [`CurationError::Schema`] failure, a fatal [`CurationError::IncompleteGroup`],
/// or when the destination or manifest cannot be written. Per-object copy
/// failures are reported, not raised.
pub fn run_curation(config: &CurationConfig, abort: Option<&AtomicBool>) -> Result<CurationReport> {
    let plan = config.curation_plan()?;
    let pass_id = Ulid::new().to_string();
    info!(
        pass_id = %pass_id,
        primary_path = %plan.paths.primary,
        summary_path = %plan.paths.summary,
        tolerance_minutes = plan.tolerance.minutes(),
        incomplete_groups = config.incomplete_groups.as_str(),
        "starting curation pass"
    );

    let primaries_all =
        load_catalog(&plan.selection.primary, Category::Primary, &config.primary_run_field)?;
    let summaries_all =
        load_catalog(&plan.summary, Category::QualitySummary, &config.summary_run_field)?;
    let accepted = load_accepted_runs(&plan.selection.accepted_runs, &config.run_catalog_field)?;
    info!(accepted_runs = accepted.len(), "accepted run identifiers loaded");

    let primaries = filter_accepted_runs(&primaries_all, &accepted);
    info!(
        "{}/{} or {}% of primary objects are from accepted runs",
        primaries.len(),
        primaries_all.len(),
        percent(primaries.len(), primaries_all.len())
    );
    let summaries = filter_accepted_runs(&summaries_all, &accepted);

    let mapping = load_quality_source(&plan.quality)?;
    let quality = filter_by_quality(&summaries, &mapping, &config.predicate);
    if !quality.gaps.is_empty() {
        warn!(gaps = quality.gaps.len(), "quality summaries without extracted annotations");
        for gap in &quality.gaps {
            debug!(run = gap.run_number, file = %gap.file_name, "extraction gap");
        }
    }
    info!(
        "{}/{} or {}% of quality summaries satisfy {}",
        quality.accepted.len(),
        summaries_all.len(),
        percent(quality.accepted.len(), summaries_all.len()),
        config.predicate
    );

    let joined = match join_by_run(&primaries, &quality.accepted, &plan.paths, config.incomplete_groups)
    {
        Ok(joined) => joined,
        Err(err) => {
            if let CurationError::IncompleteGroup(group) = &err {
                let dump = incomplete_group_dump(group);
                error!(run = group.run_number, dump = %dump, "run group lacks one category");
            }
            return Err(err.into());
        }
    };
    for skipped in &joined.skipped {
        warn!(
            run = skipped.run_number,
            primaries = skipped.primary_count,
            summaries = skipped.summary_count,
            "skipping incomplete run group"
        );
    }
    if joined.unclassified_records > 0 {
        warn!(records = joined.unclassified_records, "records matched neither schema path");
    }
    info!(
        common_runs = joined.common_runs,
        primary_only_runs = joined.primary_only_runs.len(),
        summary_only_runs = joined.summary_only_runs.len(),
        eligible_groups = joined.groups.len(),
        "run groups formed"
    );

    let correlation = correlate(&joined.groups, plan.tolerance);

    let destination = &plan.selection.destination;
    let mut materializer =
        Materializer::new(&plan.selection.primary.object_dir(), destination, config.dry_run);
    materializer.prepare()?;

    let mut materialized = MaterializeReport::default();
    let groups = correlation
        .matches
        .chunk_by(|left, right| left.run_number == right.run_number)
        .map(|run_matches| {
            let entries = run_matches
                .iter()
                .map(|entry| (&entry.primary, Some(entry.summary.file_name.as_str())))
                .collect::<Vec<_>>();
            (run_matches[0].run_number, entries)
        });
    let aborted =
        materialize_run_groups(&mut materializer, groups, &mut materialized, || abort_requested(abort));

    info!(
        "{}/{} total files were kept in the destination {}",
        materialized.copied.len(),
        primaries.len(),
        destination.display()
    );
    if !materialized.failures.is_empty() {
        warn!(failures = materialized.failures.len(), "some objects could not be copied");
    }

    let manifest = finish_manifest(config, &pass_id, destination, &materialized.copied)?;

    Ok(CurationReport {
        pass_id,
        generated_at: now_rfc3339()?,
        tolerance_minutes: plan.tolerance.minutes(),
        incomplete_groups: config.incomplete_groups,
        predicate: config.predicate.clone(),
        primaries_total: primaries_all.len(),
        primaries_run_accepted: primaries.len(),
        summaries_total: summaries_all.len(),
        summaries_run_accepted: summaries.len(),
        quality_entries: mapping.len(),
        summaries_quality_accepted: quality.accepted.len(),
        predicate_rejections: quality.rejected,
        extraction_gaps: quality.gaps,
        common_runs: joined.common_runs,
        primary_only_runs: joined.primary_only_runs.clone(),
        summary_only_runs: joined.summary_only_runs.clone(),
        unclassified_records: joined.unclassified_records,
        eligible_groups: joined.groups.len(),
        eligible_group_primaries: joined.eligible_group_primaries(),
        skipped_groups: joined.skipped,
        claimed_primaries: correlation.claimed_primaries(),
        duplicate_candidates: correlation.skipped_already_claimed(),
        matches: correlation.matches.iter().map(MatchSummary::from).collect(),
        materialized: materialized.copied.len(),
        copy_failures: materialized.failures,
        file_name_collisions: materialized.file_name_collisions,
        aborted,
        dry_run: config.dry_run,
        destination: destination.display().to_string(),
        manifest,
    })
}

/// Materialize every primary object of an accepted run, without quality correlation.
///
/// # Errors
/// Returns an error on invalid configuration, unreadable inputs, a
/// [`CurationError::Schema`] failure, or when the destination or manifest cannot be written.
pub fn run_filter_runs(
    config: &CurationConfig,
    abort: Option<&AtomicBool>,
) -> Result<RunSelectionReport> {
    let plan = config.run_selection_plan()?;
    let pass_id = Ulid::new().to_string();
    info!(pass_id = %pass_id, "starting run selection pass");

    let primaries_all = load_catalog(&plan.primary, Category::Primary, &config.primary_run_field)?;
    let accepted = load_accepted_runs(&plan.accepted_runs, &config.run_catalog_field)?;
    let primaries = filter_accepted_runs(&primaries_all, &accepted);
    info!(
        "{}/{} or {}% of primary objects are from accepted runs",
        primaries.len(),
        primaries_all.len(),
        percent(primaries.len(), primaries_all.len())
    );
    let (unique, duplicate_candidates) = dedup_by_identity(&primaries);

    let mut by_run: BTreeMap<u64, Vec<&ObjectRecord>> = BTreeMap::new();
    for record in &unique {
        by_run.entry(record.run_number).or_default().push(record);
    }

    let mut materializer =
        Materializer::new(&plan.primary.object_dir(), &plan.destination, config.dry_run);
    materializer.prepare()?;

    let mut materialized = MaterializeReport::default();
    let groups = by_run.iter().map(|(run_number, records)| {
        (*run_number, records.iter().map(|record| (*record, None::<&str>)).collect::<Vec<_>>())
    });
    let aborted =
        materialize_run_groups(&mut materializer, groups, &mut materialized, || abort_requested(abort));

    info!(
        "{}/{} total files were kept in the destination {}",
        materialized.copied.len(),
        primaries_all.len(),
        plan.destination.display()
    );

    let manifest = finish_manifest(config, &pass_id, &plan.destination, &materialized.copied)?;

    Ok(RunSelectionReport {
        pass_id,
        generated_at: now_rfc3339()?,
        accepted_runs: accepted.len(),
        primaries_total: primaries_all.len(),
        primaries_run_accepted: primaries.len(),
        duplicate_candidates,
        materialized: materialized.copied.len(),
        copy_failures: materialized.failures,
        file_name_collisions: materialized.file_name_collisions,
        aborted,
        dry_run: config.dry_run,
        destination: plan.destination.display().to_string(),
        manifest,
    })
}
