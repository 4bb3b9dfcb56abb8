use std::collections::BTreeSet;
use std::env;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use dockyard::health::{HealthCheckPolicy, HealthState, ProbeOutcome, monitor, probe};
use dockyard::image::{ImageDefinition, validate_image, write_dockerfile};
use dockyard::lockfile::{PipelineLock, generate_lock};
use dockyard::manifest::PipelineManifest;
use dockyard::notify::banner;
use dockyard::observability::log_snapshot;
#[cfg(feature = "metrics-server")]
use dockyard::observability::server::MetricsServer;
use dockyard::pipeline::{RunOptions, StageRegistry, build_pipeline};
use dockyard::presets::{PRESETS, generate_image_preset, generate_preset};
use dockyard::runner::{CommandRunner, RecordingRunner, SystemRunner};
use dockyard::security::{compute_sha256, write_sha256};
use dockyard::stages;
use dockyard::validation::{ValidationReport, validate_manifest};
use serde_json::to_writer_pretty;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, prelude::*};

#[cfg(feature = "otel")]
use opentelemetry::KeyValue;
#[cfg(feature = "otel")]
use opentelemetry_otlp::WithExportConfig;
#[cfg(feature = "otel")]
use opentelemetry_sdk::{resource::Resource, trace as sdktrace};
#[cfg(feature = "metrics-server")]
use std::net::SocketAddr;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let otlp_endpoint_for_tracing = match &cli.command {
        Commands::Run { metrics, .. } => metrics.otlp_endpoint.clone(),
        _ => None,
    };

    configure_tracing(otlp_endpoint_for_tracing.as_deref())?;

    let command_result = match cli.command {
        Commands::Run {
            manifest,
            dry_run,
            build_number,
            workspace,
            report,
            metrics,
        } => run_manifest(
            manifest,
            RunArgs {
                dry_run,
                build_number,
                workspace,
                report,
            },
            metrics,
        ),
        Commands::ListStages => {
            list_stages();
            Ok(())
        }
        Commands::Validate { manifest } => validate_manifest_cmd(manifest),
        Commands::Lock {
            manifest,
            output,
            check,
        } => lock_manifest(manifest, output, check),
        Commands::Pipeline { action } => pipeline_command(action),
        Commands::Image { action } => image_command(action),
        Commands::Health { action } => health_command(action),
        Commands::Security { action } => security_command(action),
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "dockyard", &mut io::stdout());
            Ok(())
        }
    };

    #[cfg(feature = "otel")]
    if otlp_endpoint_for_tracing.is_some() {
        opentelemetry::global::shutdown_tracer_provider();
    }

    command_result
}

fn configure_tracing(otlp_endpoint: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    #[cfg(feature = "otel")]
    {
        if let Some(endpoint) = otlp_endpoint {
            let tracer =
                opentelemetry_otlp::new_pipeline()
                    .tracing()
                    .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(
                        vec![KeyValue::new("service.name", "dockyard")],
                    )))
                    .with_exporter(
                        opentelemetry_otlp::new_exporter()
                            .tonic()
                            .with_endpoint(endpoint),
                    )
                    .install_simple()?;

            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .try_init()
                .map_err(|err| anyhow!(err.to_string()))?;
            return Ok(());
        }
    }

    #[cfg(not(feature = "otel"))]
    if let Some(endpoint) = otlp_endpoint {
        eprintln!(
            "warning: --otlp-endpoint '{endpoint}' requested but OpenTelemetry support is not enabled. Rebuild with --features otel."
        );
    }

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .try_init()
        .map_err(|err| anyhow!(err.to_string()))?;

    Ok(())
}

struct RunArgs {
    dry_run: bool,
    build_number: Option<String>,
    workspace: Option<PathBuf>,
    report: Option<PathBuf>,
}

fn run_manifest(manifest_path: PathBuf, args: RunArgs, metrics: MetricsArgs) -> Result<()> {
    let manifest = PipelineManifest::load(&manifest_path)?;
    let registry = build_registry();

    let report = validate_manifest(&manifest, &registry);
    log_report(&manifest_path, &report);
    if !report.is_ok() {
        bail!(
            "Pipeline '{}' has {} validation error(s)",
            manifest_path.display(),
            report.errors.len()
        );
    }

    let build_number = resolve_build_number(args.build_number);
    let workspace = match args.workspace {
        Some(dir) => dir,
        None => env::current_dir().context("Failed to determine current directory")?,
    };
    let recorder = Arc::new(RecordingRunner::new());
    let runner: Arc<dyn CommandRunner> = if args.dry_run {
        recorder.clone()
    } else {
        Arc::new(SystemRunner)
    };

    let mut options = RunOptions::new(runner, workspace).build_number(build_number);
    options.dry_run = args.dry_run;
    let executor = build_pipeline(&registry, &manifest, options)?;
    let metrics_handle = executor.metrics();

    #[cfg(feature = "metrics-server")]
    let metrics_server = if let Some(addr_str) = &metrics.metrics_listen {
        let addr: SocketAddr = addr_str
            .parse()
            .with_context(|| format!("Invalid metrics listen address: {addr_str}"))?;
        Some(MetricsServer::start(addr, metrics_handle.clone())?)
    } else {
        None
    };

    #[cfg(not(feature = "metrics-server"))]
    if let Some(addr_str) = &metrics.metrics_listen {
        warn!(
            "Metrics server feature not enabled; ignoring --metrics-listen={}.",
            addr_str
        );
    }

    let run = executor.execute();

    if args.dry_run {
        println!("Dry run of '{}' would execute:", run.pipeline);
        for line in recorder.command_lines() {
            println!("  + {line}");
        }
    }
    for record in &run.stages {
        println!(
            "{:<20} {:<22} {:>9.1} ms",
            record.label,
            format!("{:?}", record.status),
            record.duration_ms
        );
    }
    println!("{}", banner(&run));

    if let Some(path) = &args.report {
        ensure_parent(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create report file: {}", path.display()))?;
        to_writer_pretty(file, &run)
            .with_context(|| format!("Failed to write run report: {}", path.display()))?;
        info!(report = %path.display(), "Run report written");
    }

    write_metrics(&metrics, &metrics_handle.snapshot())?;

    #[cfg(feature = "metrics-server")]
    if let Some(mut server) = metrics_server {
        server.stop();
    }

    if run.is_success() {
        Ok(())
    } else {
        bail!(
            "Pipeline failed at stage '{}'",
            run.failed_stage.as_deref().unwrap_or("unknown")
        )
    }
}

/// Explicit flag first, then the CI-provided `BUILD_NUMBER`, then `local`.
fn resolve_build_number(flag: Option<String>) -> String {
    flag.filter(|value| !value.trim().is_empty())
        .or_else(|| env::var("BUILD_NUMBER").ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| "local".to_string())
}

fn write_metrics(
    args: &MetricsArgs,
    snapshot: &dockyard::observability::MetricsSnapshot,
) -> Result<()> {
    if args.print_metrics {
        log_snapshot(snapshot);
    }
    if let Some(path) = &args.metrics_json {
        ensure_parent(path)?;
        let file = File::create(path)
            .with_context(|| format!("Failed to create metrics file: {}", path.display()))?;
        to_writer_pretty(file, snapshot)
            .with_context(|| format!("Failed to write metrics JSON: {}", path.display()))?;
        info!(metrics = %path.display(), "Metrics JSON written");
    }
    if let Some(path) = &args.metrics_prometheus {
        ensure_parent(path)?;
        fs::write(path, snapshot.to_prometheus())
            .with_context(|| format!("Failed to write Prometheus metrics: {}", path.display()))?;
        info!(metrics = %path.display(), "Prometheus metrics written");
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }
    Ok(())
}

fn log_report(file: &Path, report: &ValidationReport) {
    for warning in &report.warnings {
        warn!(file = %file.display(), "{warning}");
    }
    for error_msg in &report.errors {
        error!(file = %file.display(), "{error_msg}");
    }
}

fn list_stages() {
    let registry = build_registry();
    println!("Available stages:");
    for name in registry.known_stages() {
        println!("- {name}");
    }
}

fn validate_manifest_cmd(manifest_path: PathBuf) -> Result<()> {
    let manifest = PipelineManifest::load(&manifest_path)?;
    let registry = build_registry();
    let report = validate_manifest(&manifest, &registry);
    log_report(&manifest_path, &report);
    if report.is_ok() {
        info!(file = %manifest_path.display(), "Pipeline validation passed");
        println!("{}: ok", manifest_path.display());
        Ok(())
    } else {
        Err(anyhow!(
            "Pipeline validation failed with {} error(s)",
            report.errors.len()
        ))
    }
}

fn lock_manifest(manifest_path: PathBuf, output_path: PathBuf, check: bool) -> Result<()> {
    let manifest = PipelineManifest::load(&manifest_path)?;

    if check {
        let lock = PipelineLock::load(&output_path)?;
        let drifted = lock.drift(&manifest);
        if drifted.is_empty() {
            info!(lockfile = %output_path.display(), "Lockfile matches pipeline");
            return Ok(());
        }
        for stage in &drifted {
            println!("- {stage}");
        }
        bail!(
            "Pipeline drifted from lockfile in {} stage(s)",
            drifted.len()
        );
    }

    let registry = build_registry();
    let report = validate_manifest(&manifest, &registry);
    log_report(&manifest_path, &report);
    if !report.is_ok() {
        return Err(anyhow!(
            "Cannot generate lockfile due to {} validation error(s)",
            report.errors.len()
        ));
    }

    ensure_parent(&output_path)?;
    generate_lock(&manifest, &output_path)?;
    info!(
        lockfile = %output_path.display(),
        "Lockfile generated successfully"
    );

    Ok(())
}

fn pipeline_command(command: PipelineCommands) -> Result<()> {
    match command {
        PipelineCommands::New { preset, output } => {
            let destination =
                output.unwrap_or_else(|| PathBuf::from(format!("pipelines/{preset}.yaml")));
            let generated = generate_preset(&preset, &destination)?;
            info!(
                preset = %preset,
                path = %generated.display(),
                "Preset pipeline generated"
            );
            Ok(())
        }
        PipelineCommands::Presets => {
            for preset in PRESETS {
                println!("- {preset}");
            }
            Ok(())
        }
        PipelineCommands::Lint { manifests } => lint_manifests(&manifests),
        PipelineCommands::Diff { lhs, rhs } => diff_manifests(&lhs, &rhs),
    }
}

fn lint_manifests(manifests: &[PathBuf]) -> Result<()> {
    if manifests.is_empty() {
        bail!("No pipeline files supplied for linting");
    }

    let registry = build_registry();
    let mut failures = 0usize;

    for path in manifests {
        match PipelineManifest::load(path) {
            Ok(manifest) => {
                let report = validate_manifest(&manifest, &registry);
                log_report(path, &report);
                if report.is_ok() {
                    info!(file = %path.display(), "Lint passed");
                } else {
                    failures += 1;
                }
            }
            Err(err) => {
                failures += 1;
                error!(file = %path.display(), "Failed to load pipeline: {err:#}");
            }
        }
    }

    if failures > 0 {
        bail!("Lint failed for {failures} pipeline(s)");
    }

    info!("All pipeline lint checks passed");
    Ok(())
}

fn diff_manifests(lhs: &Path, rhs: &Path) -> Result<()> {
    let left = PipelineManifest::load(lhs)?;
    let right = PipelineManifest::load(rhs)?;
    let differences = manifest_differences(&left, &right)?;

    if differences.is_empty() {
        info!(
            left = %lhs.display(),
            right = %rhs.display(),
            "Pipelines are equivalent"
        );
        println!("Pipelines match: {} == {}", lhs.display(), rhs.display());
        Ok(())
    } else {
        println!(
            "Pipeline differences between '{}' and '{}':",
            lhs.display(),
            rhs.display()
        );
        for diff in &differences {
            println!("- {diff}");
        }
        bail!("Pipelines differ ({} difference(s) found)", differences.len());
    }
}

fn manifest_differences(left: &PipelineManifest, right: &PipelineManifest) -> Result<Vec<String>> {
    let mut differences = Vec::new();

    if left.version != right.version {
        differences.push(format!(
            "Version mismatch: {} vs {}",
            left.version, right.version
        ));
    }
    if left.name != right.name {
        differences.push(format!("Name differs: '{}' vs '{}'", left.name, right.name));
    }

    let keys: BTreeSet<&String> = left
        .environment
        .keys()
        .chain(right.environment.keys())
        .collect();
    for key in keys {
        let (l, r) = (left.environment.get(key), right.environment.get(key));
        if l != r {
            differences.push(format!(
                "Environment '{key}' differs: {} vs {}",
                l.map(String::as_str).unwrap_or("<unset>"),
                r.map(String::as_str).unwrap_or("<unset>")
            ));
        }
    }

    let min_len = left.stages.len().min(right.stages.len());
    if left.stages.len() != right.stages.len() {
        differences.push(format!(
            "Stage count differs: {} vs {}",
            left.stages.len(),
            right.stages.len()
        ));
    }

    for (idx, (l_stage, r_stage)) in left.stages.iter().zip(right.stages.iter()).enumerate() {
        if l_stage.stage != r_stage.stage || l_stage.label() != r_stage.label() {
            differences.push(format!(
                "Stage {} differs: '{}' ({}) vs '{}' ({})",
                idx + 1,
                l_stage.label(),
                l_stage.stage,
                r_stage.label(),
                r_stage.stage
            ));
        }
        if l_stage.enabled != r_stage.enabled {
            differences.push(format!(
                "Stage {} ('{}') enabled differs: {} vs {}",
                idx + 1,
                l_stage.label(),
                l_stage.enabled,
                r_stage.enabled
            ));
        }
        let l_params = l_stage.params.clone().unwrap_or_default();
        let r_params = r_stage.params.clone().unwrap_or_default();
        if l_params != r_params {
            differences.push(format!(
                "Stage {} ('{}') parameters differ: {} vs {}",
                idx + 1,
                l_stage.label(),
                serde_json::to_string(&l_params).unwrap_or_else(|_| "<invalid>".into()),
                serde_json::to_string(&r_params).unwrap_or_else(|_| "<invalid>".into())
            ));
        }
    }

    for (side, stages) in [("left", &left.stages), ("right", &right.stages)] {
        for (extra_idx, stage) in stages.iter().skip(min_len).enumerate() {
            differences.push(format!(
                "Extra stage in {side} pipeline at position {}: '{}'",
                min_len + extra_idx + 1,
                stage.label()
            ));
        }
    }

    let left_post = serde_json::to_value(&left.post)?;
    let right_post = serde_json::to_value(&right.post)?;
    if left_post != right_post {
        differences.push(format!(
            "Post actions differ: {} vs {}",
            serde_json::to_string(&left_post).unwrap_or_else(|_| "<invalid>".into()),
            serde_json::to_string(&right_post).unwrap_or_else(|_| "<invalid>".into())
        ));
    }

    Ok(differences)
}

fn image_command(command: ImageCommands) -> Result<()> {
    match command {
        ImageCommands::New { output, dockerfile } => {
            let generated = generate_image_preset(&output, dockerfile.as_deref())?;
            info!(path = %generated.display(), "Image definition generated");
            Ok(())
        }
        ImageCommands::Render { definition, output } => {
            let image = load_checked_image(&definition)?;
            match output {
                Some(path) => {
                    write_dockerfile(&image, &path)?;
                    info!(dockerfile = %path.display(), "Dockerfile rendered");
                }
                None => print!("{}", image.render_dockerfile()),
            }
            Ok(())
        }
        ImageCommands::Check { definition } => {
            load_checked_image(&definition)?;
            info!(file = %definition.display(), "Image definition check passed");
            println!("{}: ok", definition.display());
            Ok(())
        }
    }
}

fn load_checked_image(path: &Path) -> Result<ImageDefinition> {
    let definition = ImageDefinition::load(path)?;
    let report = validate_image(&definition);
    log_report(path, &report);
    if !report.is_ok() {
        bail!(
            "Image definition check failed with {} error(s)",
            report.errors.len()
        );
    }
    Ok(definition)
}

fn health_command(command: HealthCommands) -> Result<()> {
    match command {
        HealthCommands::Probe { url, timeout_secs } => {
            let (outcome, took) = probe(&url, Duration::from_secs(timeout_secs))?;
            match outcome {
                ProbeOutcome::Healthy => {
                    println!("healthy ({} ms)", took.as_millis());
                    Ok(())
                }
                ProbeOutcome::Unhealthy(reason) => bail!("Unhealthy: {reason}"),
            }
        }
        HealthCommands::Watch { url, policy } => {
            let policy = HealthCheckPolicy {
                interval_secs: policy.interval_secs,
                timeout_secs: policy.timeout_secs,
                start_period_secs: policy.start_period_secs,
                retries: policy.retries,
                ..HealthCheckPolicy::default()
            };
            match monitor(&url, &policy)? {
                HealthState::Healthy => {
                    println!("healthy");
                    Ok(())
                }
                state => bail!("Service settled as {state:?}"),
            }
        }
    }
}

fn security_command(command: SecurityCommands) -> Result<()> {
    match command {
        SecurityCommands::Digest { path, output } => {
            if let Some(out_path) = output {
                let digest = write_sha256(&path, &out_path)?;
                println!("{}  {}", digest, path.display());
                info!(
                    file = %path.display(),
                    digest_output = %out_path.display(),
                    "SHA256 digest written"
                );
            } else {
                let digest = compute_sha256(&path)?;
                println!("{}  {}", digest, path.display());
                info!(file = %path.display(), "SHA256 computed");
            }
            Ok(())
        }
    }
}

fn build_registry() -> StageRegistry {
    let mut registry = StageRegistry::new();
    stages::register_defaults(&mut registry);
    registry
}

#[derive(Parser)]
#[command(
    name = "dockyard",
    version,
    about = "Sequential CI pipeline runner and service image toolkit"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct MetricsArgs {
    #[arg(long)]
    print_metrics: bool,
    #[arg(long = "metrics-json")]
    metrics_json: Option<PathBuf>,
    #[arg(long = "metrics-prometheus")]
    metrics_prometheus: Option<PathBuf>,
    #[arg(long = "metrics-listen")]
    metrics_listen: Option<String>,
    #[arg(long = "otlp-endpoint")]
    otlp_endpoint: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a pipeline manifest stage by stage.
    Run {
        manifest: PathBuf,
        /// Record the commands instead of executing them.
        #[arg(long)]
        dry_run: bool,
        /// Defaults to $BUILD_NUMBER, then "local".
        #[arg(long)]
        build_number: Option<String>,
        #[arg(long)]
        workspace: Option<PathBuf>,
        /// Write the run report as JSON.
        #[arg(long)]
        report: Option<PathBuf>,
        #[command(flatten)]
        metrics: MetricsArgs,
    },
    ListStages,
    Validate {
        manifest: PathBuf,
    },
    Lock {
        manifest: PathBuf,
        output: PathBuf,
        /// Compare the manifest against an existing lockfile instead of writing one.
        #[arg(long)]
        check: bool,
    },
    Pipeline {
        #[command(subcommand)]
        action: PipelineCommands,
    },
    Image {
        #[command(subcommand)]
        action: ImageCommands,
    },
    Health {
        #[command(subcommand)]
        action: HealthCommands,
    },
    Security {
        #[command(subcommand)]
        action: SecurityCommands,
    },
    /// Print shell completions.
    Completions {
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum PipelineCommands {
    New {
        #[arg(long)]
        preset: String,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Presets,
    Lint {
        #[arg(required = true)]
        manifests: Vec<PathBuf>,
    },
    Diff {
        lhs: PathBuf,
        rhs: PathBuf,
    },
}

#[derive(Subcommand)]
enum ImageCommands {
    New {
        #[arg(long, default_value = "image.yaml")]
        output: PathBuf,
        /// Also render the Dockerfile to this path.
        #[arg(long)]
        dockerfile: Option<PathBuf>,
    },
    Render {
        definition: PathBuf,
        /// Defaults to stdout.
        #[arg(long)]
        output: Option<PathBuf>,
    },
    Check {
        definition: PathBuf,
    },
}

#[derive(clap::Args)]
struct PolicyArgs {
    #[arg(long, default_value_t = 30)]
    interval_secs: u64,
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
    #[arg(long, default_value_t = 120)]
    start_period_secs: u64,
    #[arg(long, default_value_t = 15)]
    retries: u32,
}

#[derive(Subcommand)]
enum HealthCommands {
    /// Probe once; exits non-zero when unhealthy.
    Probe {
        #[arg(long, default_value = "http://localhost:9000/")]
        url: String,
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Probe on the health-check schedule until the service settles.
    Watch {
        #[arg(long, default_value = "http://localhost:9000/")]
        url: String,
        #[command(flatten)]
        policy: PolicyArgs,
    },
}

#[derive(Subcommand)]
enum SecurityCommands {
    Digest {
        #[arg(long)]
        path: PathBuf,
        #[arg(long)]
        output: Option<PathBuf>,
    },
}
