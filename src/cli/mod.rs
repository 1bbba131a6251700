use crate::conf::SecurityScanOverride;
use crate::session::{BuildSession, SessionOptions};
use clap::Parser;
use std::path::PathBuf;
use tracing::debug;

#[derive(Debug, Parser)]
#[clap(name = "buildrunner")]
#[clap(about = "Buildrunner runs container based builds defined in buildrunner.yaml.")]
#[clap(
    long_about = "Buildrunner is a declarative container based build orchestrator. A manifest \
    committed to the source tree describes a set of steps; each step may build an image, run a \
    container (optionally alongside linked service containers), commit/tag/push images, or \
    delegate a command to a remote build server. Artifacts and images flow between steps within \
    a single integrated build."
)]
#[clap(version)]
struct Cli {
    /// Build configuration file (defaults to "buildrunner.yaml")
    #[clap(short = 'f', long = "file", value_name = "PATH")]
    manifest_file: Option<PathBuf>,

    /// Global configuration file (defaults to "~/.buildrunner.yaml")
    #[clap(short = 'c', long = "global-config", value_name = "PATH")]
    global_config_file: Option<String>,

    /// Build directory (defaults to the current working directory)
    #[clap(short = 'd', long = "directory", value_name = "PATH")]
    directory: Option<PathBuf>,

    /// Build results directory (defaults to <build-directory>/buildrunner.results)
    #[clap(short = 'b', long = "build-results-dir", value_name = "PATH")]
    build_results_dir: Option<PathBuf>,

    /// Build number (defaults to unix/epoch time)
    #[clap(short = 'n', long = "build-number")]
    build_number: Option<u64>,

    /// Only run the listed steps (repeat the flag or comma-delimit)
    #[clap(short = 's', long = "steps", value_name = "STEPS")]
    steps: Vec<String>,

    /// Verbosity of output
    #[clap(short = 'l', long = "loglevel", default_value = "info")]
    loglevel: String,

    /// Docker timeout in seconds
    #[clap(short = 't', long = "docker-timeout", default_value_t = crate::docker::DEFAULT_DOCKER_TIMEOUT)]
    docker_timeout: u64,

    /// Push images to remote registries (without this flag buildrunner
    /// simply tags images)
    #[clap(long)]
    push: bool,

    /// Remove generated images at the end of the build to prevent clutter
    /// on build machines
    #[clap(long = "cleanup-images")]
    cleanup_images: bool,

    /// Prefer local images rather than fetching remote images; equivalent
    /// to setting pull to false for every image and build
    #[clap(long = "local-images")]
    local_images: bool,

    /// Publish ports defined on a run step; never use this on a shared
    /// build server
    #[clap(long = "publish-ports")]
    publish_ports: bool,

    /// Clean local caches under the configured caches-root before running
    #[clap(long = "clean-cache")]
    clean_cache: bool,

    /// Keep each step's results directory even when it produced no artifacts
    #[clap(long = "keep-step-artifacts")]
    keep_step_artifacts: bool,

    /// Platform to pass to the docker daemon when pulling, building, and
    /// running images (e.g. "linux/amd64")
    #[clap(long)]
    platform: Option<String>,

    /// Labels to add to every started container, as key1=value1,key2=value2
    #[clap(long = "container-labels", value_name = "LABELS")]
    container_labels: Option<String>,

    /// Override whether image security scanning runs on pushed images
    #[clap(long = "security-scan-enabled", value_name = "BOOL")]
    security_scan_enabled: Option<bool>,

    /// Override the vulnerability score that fails the build
    #[clap(long = "security-scan-max-score-threshold", value_name = "SCORE")]
    security_scan_max_score_threshold: Option<f64>,
}

fn init_logging(loglevel: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(format!("buildrunner={loglevel}"))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("buildrunner=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Parse the command line, run the build, and return the process exit code.
pub async fn init() -> i32 {
    let args = Cli::parse();
    init_logging(&args.loglevel);
    debug!("startup");

    // Steps may be given comma-delimited or by repeating the flag.
    let steps: Vec<String> = args
        .steps
        .iter()
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .collect();

    let options = SessionOptions {
        build_dir: args
            .directory
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))),
        results_dir: args.build_results_dir,
        global_config_file: args.global_config_file,
        manifest_file: args.manifest_file,
        build_number: args.build_number,
        push: args.push,
        cleanup_images: args.cleanup_images,
        local_images: args.local_images,
        publish_ports: args.publish_ports,
        clean_cache: args.clean_cache,
        keep_step_artifacts: args.keep_step_artifacts,
        steps,
        platform: args.platform,
        docker_timeout: args.docker_timeout,
        container_labels: args.container_labels,
        scan_override: SecurityScanOverride {
            enabled: args.security_scan_enabled,
            max_score_threshold: args.security_scan_max_score_threshold,
            ..Default::default()
        },
    };

    let mut session = match BuildSession::new(options).await {
        Ok(session) => session,
        Err(err) => {
            eprintln!("{err}");
            return err.exit_code();
        }
    };

    session.install_signal_handlers();
    session.run().await
}
