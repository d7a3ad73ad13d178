use bbsweep_analysis::{parse_solver_line, TrialRecord};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("config: {0}")]
    Config(String),
    #[error("solver build failed for bound variant {variant}: {detail}")]
    Build { variant: String, detail: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A failed solver invocation. Distinct from a solver-reported timeout,
/// which is a legitimate result carried in the record's status field.
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("failed to spawn solver {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("solver exited with {code:?} on {instance}")]
    Exit { instance: String, code: Option<i32> },
    #[error("solver produced no output on {instance}")]
    Empty { instance: String },
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepConfig {
    pub solver: SolverConfig,
    pub variants: Vec<BoundVariant>,
    pub instances: InstanceLayout,
    pub results_log: PathBuf,
    pub profiles: BTreeMap<String, SweepProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SolverConfig {
    /// Solver executable invoked once per trial.
    pub path: PathBuf,
    pub build: BuildConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuildConfig {
    pub program: String,
    #[serde(default)]
    pub clean_args: Vec<String>,
    #[serde(default)]
    pub build_args: Vec<String>,
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BoundVariant {
    pub name: String,
    /// Extra build arguments selecting this variant's lower-bound heuristic.
    #[serde(default)]
    pub build_args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceLayout {
    /// Path template with `{size}` and `{index}` placeholders.
    pub template: String,
}

impl InstanceLayout {
    pub fn instance_path(&self, size: u32, index: u32) -> PathBuf {
        PathBuf::from(
            self.template
                .replace("{size}", &size.to_string())
                .replace("{index}", &index.to_string()),
        )
    }

    pub fn instance_dir(&self, size: u32) -> PathBuf {
        self.instance_path(size, 0)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SweepProfile {
    pub sizes: Vec<u32>,
    pub machines: Vec<u32>,
    pub instances_per_point: u32,
    pub timeout_secs: u32,
    /// Consecutive timeouts at one point before the rest of it is
    /// abandoned. Absent means exhaustive.
    #[serde(default)]
    pub skip_threshold: Option<u32>,
    #[serde(default)]
    pub size_caps: Vec<SizeCap>,
}

/// Excludes node counts above `max_size` at the given machine count.
#[derive(Debug, Clone, Deserialize)]
pub struct SizeCap {
    pub machines: u32,
    pub max_size: u32,
}

impl SweepProfile {
    fn point_excluded(&self, size: u32, machines: u32) -> bool {
        self.size_caps
            .iter()
            .any(|cap| cap.machines == machines && size > cap.max_size)
    }

    /// `(size, machines)` points in enumeration order, caps applied.
    pub fn points(&self) -> Vec<(u32, u32)> {
        let mut out = Vec::new();
        for &size in &self.sizes {
            for &machines in &self.machines {
                if !self.point_excluded(size, machines) {
                    out.push((size, machines));
                }
            }
        }
        out
    }
}

pub fn load_config(path: &Path) -> Result<SweepConfig, SweepError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| SweepError::Config(format!("cannot read {}: {}", path.display(), e)))?;
    let config: SweepConfig = serde_yaml::from_str(&raw)
        .map_err(|e| SweepError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
    validate_config(&config)?;
    Ok(config)
}

fn validate_config(config: &SweepConfig) -> Result<(), SweepError> {
    let mut problems = Vec::new();
    if config.variants.is_empty() {
        problems.push("variants: at least one bound variant required".to_string());
    }
    if config.profiles.is_empty() {
        problems.push("profiles: at least one sweep profile required".to_string());
    }
    for placeholder in ["{size}", "{index}"] {
        if !config.instances.template.contains(placeholder) {
            problems.push(format!("instances.template: missing {} placeholder", placeholder));
        }
    }
    for (name, profile) in &config.profiles {
        if profile.sizes.is_empty() {
            problems.push(format!("profiles.{}: sizes is empty", name));
        }
        if profile.machines.is_empty() {
            problems.push(format!("profiles.{}: machines is empty", name));
        }
        if profile.instances_per_point == 0 {
            problems.push(format!("profiles.{}: instances_per_point must be > 0", name));
        }
        if profile.timeout_secs == 0 {
            problems.push(format!("profiles.{}: timeout_secs must be > 0", name));
        }
        if profile.skip_threshold == Some(0) {
            problems.push(format!("profiles.{}: skip_threshold must be > 0", name));
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(SweepError::Config(problems.join("; ")))
    }
}

impl SweepConfig {
    pub fn profile(&self, name: &str) -> Result<&SweepProfile, SweepError> {
        self.profiles.get(name).ok_or_else(|| {
            let known: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
            SweepError::Config(format!(
                "unknown profile {:?} (known: {})",
                name,
                known.join(", ")
            ))
        })
    }
}

/// Seam between the controller and the solver process, so the sweep logic
/// can be driven by scripted executables in tests.
pub trait TrialExec {
    fn run(&self, instance: &Path, machines: u32, timeout_secs: u32) -> Result<String, InvokeError>;
}

pub struct SolverProcess {
    program: PathBuf,
}

impl SolverProcess {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl TrialExec for SolverProcess {
    fn run(&self, instance: &Path, machines: u32, timeout_secs: u32) -> Result<String, InvokeError> {
        let output = Command::new(&self.program)
            .arg(instance)
            .arg(machines.to_string())
            .arg(timeout_secs.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .output()
            .map_err(|source| InvokeError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;
        if !output.status.success() {
            return Err(InvokeError::Exit {
                instance: instance.display().to_string(),
                code: output.status.code(),
            });
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().find(|l| !l.trim().is_empty());
        match line {
            Some(line) => Ok(line.to_string()),
            None => Err(InvokeError::Empty {
                instance: instance.display().to_string(),
            }),
        }
    }
}

/// Where completed trial records go, one line per trial, flushed
/// immediately so an interrupted sweep leaves a usable prefix.
pub trait RecordSink {
    fn record(&mut self, record: &TrialRecord) -> std::io::Result<()>;
}

pub struct ResultLog {
    file: fs::File,
}

impl ResultLog {
    pub fn append(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl RecordSink for ResultLog {
    fn record(&mut self, record: &TrialRecord) -> std::io::Result<()> {
        writeln!(self.file, "{}", record.to_log_line())?;
        self.file.flush()
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepTotals {
    pub trials: usize,
    pub finished: usize,
    pub timeouts: usize,
    pub skipped_instances: usize,
    pub invocation_failures: usize,
}

/// Rebuilds the solver for every variant in turn and sweeps the profile
/// under it. A failed build is fatal: no trial of that variant (or any
/// later one) runs.
pub fn run_sweep<E: TrialExec, S: RecordSink>(
    config: &SweepConfig,
    profile: &SweepProfile,
    exec: &E,
    sink: &mut S,
) -> Result<SweepTotals, SweepError> {
    let mut totals = SweepTotals::default();
    for variant in &config.variants {
        rebuild_solver(&config.solver.build, variant)?;
        run_variant_sweep(config, profile, variant, exec, sink, &mut totals)?;
    }
    Ok(totals)
}

pub fn rebuild_solver(build: &BuildConfig, variant: &BoundVariant) -> Result<(), SweepError> {
    if !build.clean_args.is_empty() {
        run_build_step(build, &build.clean_args, variant)?;
    }
    let mut args = build.build_args.clone();
    args.extend(variant.build_args.iter().cloned());
    run_build_step(build, &args, variant)
}

fn run_build_step(
    build: &BuildConfig,
    args: &[String],
    variant: &BoundVariant,
) -> Result<(), SweepError> {
    info!(variant = %variant.name, program = %build.program, ?args, "building solver");
    let mut cmd = Command::new(&build.program);
    cmd.args(args);
    if let Some(workdir) = &build.workdir {
        cmd.current_dir(workdir);
    }
    let status = cmd.status().map_err(|e| SweepError::Build {
        variant: variant.name.clone(),
        detail: format!("cannot run {}: {}", build.program, e),
    })?;
    if !status.success() {
        return Err(SweepError::Build {
            variant: variant.name.clone(),
            detail: format!("{} {} exited with {}", build.program, args.join(" "), status),
        });
    }
    Ok(())
}

/// Sweeps one already-built variant over the profile's points. Within a
/// point, instances run strictly in index order and a consecutive-timeout
/// counter decides when the rest of the point is abandoned: each timeout
/// increments it, any finished trial resets it to zero, and a failed
/// invocation leaves it untouched since it says nothing about whether the
/// solver can handle the point.
pub fn run_variant_sweep<E: TrialExec, S: RecordSink>(
    config: &SweepConfig,
    profile: &SweepProfile,
    variant: &BoundVariant,
    exec: &E,
    sink: &mut S,
    totals: &mut SweepTotals,
) -> Result<(), SweepError> {
    for (size, machines) in profile.points() {
        let mut consecutive_timeouts: u32 = 0;
        for index in 0..profile.instances_per_point {
            let instance = config.instances.instance_path(size, index);
            let line = match exec.run(&instance, machines, profile.timeout_secs) {
                Ok(line) => line,
                Err(err) => {
                    warn!(
                        instance = %instance.display(),
                        size, machines, variant = %variant.name, %err,
                        "solver invocation failed; trial dropped, needs operator attention"
                    );
                    totals.invocation_failures += 1;
                    continue;
                }
            };
            let record = match parse_solver_line(&line, &variant.name) {
                Ok(record) => record,
                Err(err) => {
                    // Unparseable output is an invocation failure, not a timeout.
                    warn!(
                        instance = %instance.display(),
                        size, machines, variant = %variant.name, %err,
                        "solver output unparseable; trial dropped, needs operator attention"
                    );
                    totals.invocation_failures += 1;
                    continue;
                }
            };
            sink.record(&record)?;
            totals.trials += 1;
            debug!(
                instance = %record.instance_path,
                status = record.status,
                elapsed = record.elapsed_seconds,
                "trial complete"
            );
            if record.is_timeout() {
                totals.timeouts += 1;
                consecutive_timeouts += 1;
                if let Some(threshold) = profile.skip_threshold {
                    if consecutive_timeouts >= threshold {
                        let remaining = (profile.instances_per_point - index - 1) as usize;
                        totals.skipped_instances += remaining;
                        info!(
                            size, machines, variant = %variant.name, threshold, remaining,
                            "consecutive-timeout threshold reached, abandoning point"
                        );
                        break;
                    }
                }
            } else {
                totals.finished += 1;
                consecutive_timeouts = 0;
            }
        }
    }
    Ok(())
}

/// Writes the run manifest next to the results log and returns its path.
pub fn write_run_manifest(
    config: &SweepConfig,
    profile_name: &str,
    profile: &SweepProfile,
    run_id: &str,
) -> Result<PathBuf, SweepError> {
    let manifest = json!({
        "schema_version": "sweep_manifest_v1",
        "run_id": run_id,
        "created_at": Utc::now().to_rfc3339(),
        "profile": profile_name,
        "solver": config.solver.path.display().to_string(),
        "variants": config.variants.iter().map(|v| v.name.clone()).collect::<Vec<_>>(),
        "sizes": &profile.sizes,
        "machines": &profile.machines,
        "instances_per_point": profile.instances_per_point,
        "timeout_secs": profile.timeout_secs,
        "skip_threshold": profile.skip_threshold,
        "results_log": config.results_log.display().to_string(),
    });
    let path = manifest_path(&config.results_log, run_id);
    let bytes = serde_json::to_vec_pretty(&manifest)
        .map_err(|e| SweepError::Config(format!("manifest serialization: {}", e)))?;
    atomic_write_bytes(&path, &bytes)?;
    Ok(path)
}

fn manifest_path(results_log: &Path, run_id: &str) -> PathBuf {
    results_log.with_file_name(format!("{}.manifest.json", run_id))
}

pub fn new_run_id() -> String {
    format!("run_{}", Utc::now().format("%Y%m%d_%H%M%S"))
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("manifest");
    let tmp = path.with_file_name(format!(".{}.tmp.{}", name, std::process::id()));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}

#[derive(Debug, Serialize)]
pub struct InstanceAvailability {
    pub size: u32,
    pub dir: PathBuf,
    pub found: usize,
}

#[derive(Debug, Serialize)]
pub struct SweepSummary {
    pub profile: String,
    pub variants: Vec<String>,
    pub sizes: Vec<u32>,
    pub machines: Vec<u32>,
    pub instances_per_point: u32,
    pub timeout_secs: u32,
    pub skip_threshold: Option<u32>,
    pub enumerated_points: usize,
    /// Upper bound on emitted trials, caps applied, across all variants.
    pub max_trials: usize,
    pub instance_files: Vec<InstanceAvailability>,
}

pub fn describe_profile(config: &SweepConfig, name: &str) -> Result<SweepSummary, SweepError> {
    let profile = config.profile(name)?;
    let points = profile.points();
    let instance_files = profile
        .sizes
        .iter()
        .map(|&size| {
            let dir = config.instances.instance_dir(size);
            InstanceAvailability {
                size,
                found: count_instance_files(&dir),
                dir,
            }
        })
        .collect();
    Ok(SweepSummary {
        profile: name.to_string(),
        variants: config.variants.iter().map(|v| v.name.clone()).collect(),
        sizes: profile.sizes.clone(),
        machines: profile.machines.clone(),
        instances_per_point: profile.instances_per_point,
        timeout_secs: profile.timeout_secs,
        skip_threshold: profile.skip_threshold,
        enumerated_points: points.len(),
        max_trials: points.len() * profile.instances_per_point as usize * config.variants.len(),
        instance_files,
    })
}

fn count_instance_files(dir: &Path) -> usize {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| {
            entry.file_type().is_file()
                && entry.path().extension().and_then(|e| e.to_str()) == Some("rcp")
        })
        .count()
}
