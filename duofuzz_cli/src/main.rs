use duofuzz_core::adapter::TargetAdapter;
use duofuzz_core::config::{ConfigError, DuofuzzConfig};
use duofuzz_core::controller::{CancelToken, KindSchedule, RunController, RunSettings};
use duofuzz_core::corpus::SeedCorpus;
use duofuzz_core::mutator::MutationKind;
use duofuzz_core::report::{render_combined, render_record, render_text, to_json};
use duofuzz_core::{BleAdapter, BridgeLink, HttpAdapter, RunSummary};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use std::fs;
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_FILE: &str = "duofuzz.toml";

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum TargetSelector {
    #[value(alias = "django")]
    Http,
    Ble,
    Both,
}

impl TargetSelector {
    fn includes_http(self) -> bool {
        matches!(self, TargetSelector::Http | TargetSelector::Both)
    }

    fn includes_ble(self) -> bool {
        matches!(self, TargetSelector::Ble | TargetSelector::Both)
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    /// Which target(s) to fuzz.
    #[clap(short, long, value_enum, default_value_t = TargetSelector::Both)]
    target: TargetSelector,
    /// Rounds per seed and mutation kind.
    #[clap(short, long)]
    iterations: Option<u64>,
    /// Restrict the run to a single mutation kind.
    #[clap(short = 'm', long)]
    force_mutation: Option<MutationKind>,
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    #[clap(long)]
    rng_seed: Option<u64>,
    /// Prefix of the timestamped results directory.
    #[clap(short, long)]
    output: Option<PathBuf>,
    #[clap(long, alias = "django-url")]
    http_url: Option<String>,
    /// JSON array of HTTP seed payloads.
    #[clap(long, alias = "django-input")]
    http_seeds: Option<PathBuf>,
    /// Address of the BLE bridge process, e.g. 127.0.0.1:7878.
    #[clap(long)]
    ble_bridge: Option<String>,
    /// Name or address of the lock the bridge attaches to.
    #[clap(long)]
    ble_device: Option<String>,
    /// JSON array of BLE seed payloads.
    #[clap(long, alias = "ble-input")]
    ble_seeds: Option<PathBuf>,
    /// Per-send timeout for both targets, in milliseconds.
    #[clap(long)]
    timeout_ms: Option<u64>,
    #[clap(long, default_value = "info")]
    log_level: String,
}

/// Everything one target needs to run, validated before any send happens.
struct PreparedTarget {
    adapter: Box<dyn TargetAdapter>,
    corpus: SeedCorpus,
    schedule: KindSchedule,
}

fn load_config(cli: &Cli) -> Result<DuofuzzConfig, anyhow::Error> {
    let mut config = match &cli.config_file {
        Some(config_path) => {
            log::info!("Loading configuration from specified path: {config_path:?}");
            DuofuzzConfig::load_from_file(config_path)?
        }
        None => {
            let default_config_path = Path::new(DEFAULT_CONFIG_FILE);
            if default_config_path.exists() {
                log::info!(
                    "No config file specified via CLI, loading default: {default_config_path:?}"
                );
                DuofuzzConfig::load_from_file(default_config_path)?
            } else {
                log::info!(
                    "No config file specified and default '{DEFAULT_CONFIG_FILE}' not found, using built-in defaults."
                );
                DuofuzzConfig::default()
            }
        }
    };

    if let Some(iterations) = cli.iterations {
        config.fuzzer.iterations = iterations;
    }
    if let Some(kind) = cli.force_mutation {
        config.fuzzer.force_mutation = Some(kind);
    }
    if let Some(seed) = cli.rng_seed {
        config.fuzzer.rng_seed = seed;
    }
    if let Some(output) = &cli.output {
        config.report.output_dir = output.clone();
    }
    if let Some(url) = &cli.http_url {
        config.http.url = url.clone();
    }
    if let Some(seeds) = &cli.http_seeds {
        config.http.seeds = seeds.clone();
    }
    if let Some(addr) = &cli.ble_bridge {
        config.ble.bridge_addr = addr.clone();
    }
    if let Some(device) = &cli.ble_device {
        config.ble.device = device.clone();
    }
    if let Some(seeds) = &cli.ble_seeds {
        config.ble.seeds = seeds.clone();
    }
    if let Some(timeout_ms) = cli.timeout_ms {
        config.http.timeout_ms = timeout_ms;
        config.ble.timeout_ms = timeout_ms;
    }

    log::debug!("Effective configuration: {config:#?}");
    Ok(config)
}

fn prepare_http(config: &DuofuzzConfig) -> Result<PreparedTarget, ConfigError> {
    let target = config.http.target_config()?;
    log::info!("HTTP target: {} {}", target.method, target.endpoint);
    Ok(PreparedTarget {
        corpus: config.http.load_seeds()?,
        schedule: config.fuzzer.schedule(&MutationKind::http_defaults())?,
        adapter: Box::new(HttpAdapter::new(target)?),
    })
}

fn prepare_ble(config: &DuofuzzConfig) -> Result<PreparedTarget, ConfigError> {
    let target = config.ble.target_config()?;
    let corpus = config.ble.load_seeds()?;
    let schedule = config.fuzzer.schedule(&MutationKind::ble_defaults())?;

    log::info!(
        "Connecting to {} via BLE bridge at {}...",
        config.ble.device,
        config.ble.bridge_addr
    );
    let link = BridgeLink::connect(
        config.ble.bridge_addr.as_str(),
        config.ble.device.clone(),
        config.ble.timeout(),
        config.ble.reconnect_delay(),
    )
    .map_err(|e| ConfigError::BridgeUnavailable(e.to_string()))?;

    Ok(PreparedTarget {
        adapter: Box::new(BleAdapter::new(link, target)),
        corpus,
        schedule,
    })
}

fn write_reports(dir: &Path, summaries: &[RunSummary]) -> Result<(), anyhow::Error> {
    for summary in summaries {
        let target_dir = dir.join(summary.target());
        fs::create_dir_all(&target_dir)
            .with_context(|| format!("Failed to create results directory {target_dir:?}"))?;

        fs::write(target_dir.join("summary.txt"), render_text(summary))
            .with_context(|| format!("Failed to write text summary to {target_dir:?}"))?;
        let json = to_json(&render_record(summary))?;
        fs::write(target_dir.join("summary.json"), json)
            .with_context(|| format!("Failed to write JSON summary to {target_dir:?}"))?;
    }

    let combined = to_json(&render_combined(summaries))?;
    fs::write(dir.join("combined_results.json"), combined)
        .with_context(|| format!("Failed to write combined results to {dir:?}"))?;
    Ok(())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let config = load_config(&cli)?;
    let run_settings: RunSettings = config.fuzzer.run_settings()?;
    let iterations = config.fuzzer.iterations;

    let mut targets = Vec::new();
    if cli.target.includes_http() {
        targets.push(prepare_http(&config).context("HTTP target configuration is invalid")?);
    }
    if cli.target.includes_ble() {
        targets.push(prepare_ble(&config).context("BLE target configuration is invalid")?);
    }

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    ctrlc::set_handler(move || {
        log::warn!("Received Ctrl+C, stopping after the current send...");
        handler_token.cancel();
    })
    .context("Failed to install Ctrl+C handler")?;

    let results: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = targets
            .into_iter()
            .map(|mut target| {
                let settings = run_settings.clone();
                let cancel = cancel.clone();
                scope.spawn(move || {
                    let mut controller = RunController::new(settings).with_cancel_token(cancel);
                    controller.start(
                        &target.corpus,
                        &target.schedule,
                        iterations,
                        &mut target.adapter,
                    )
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .map_err(|_| anyhow::anyhow!("Fuzzing thread panicked"))
            })
            .collect()
    });

    let mut summaries = Vec::with_capacity(results.len());
    for result in results {
        summaries.push(result??);
    }

    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let results_dir = PathBuf::from(format!(
        "{}_{timestamp}",
        config.report.output_dir.display()
    ));
    write_reports(&results_dir, &summaries)?;

    for summary in &summaries {
        println!("{}", render_text(summary));
    }
    let combined = render_combined(&summaries);
    println!("Combined results: {}", serde_json::to_string(&combined)?);
    println!("Results saved to {results_dir:?}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn config_file(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn flags_override_the_config_file() {
        let file = config_file(
            r#"
            [http]
            timeout-ms = 1000
            seeds = "file-http.json"

            [ble]
            device = "Lock From File"
            timeout-ms = 2000
            "#,
        );
        let path = file.path().to_str().unwrap();
        let cli = Cli::parse_from([
            "duofuzz",
            "--config-file",
            path,
            "--ble-device",
            "Smart Lock [Group 7]",
            "--ble-input",
            "flag-ble.json",
            "--timeout-ms",
            "750",
        ]);

        let config = load_config(&cli).unwrap();

        assert_eq!(config.ble.device, "Smart Lock [Group 7]");
        assert_eq!(config.ble.seeds, PathBuf::from("flag-ble.json"));
        assert_eq!(config.http.seeds, PathBuf::from("file-http.json"));
        assert_eq!(config.http.timeout_ms, 750);
        assert_eq!(config.ble.timeout_ms, 750);
    }

    #[test]
    fn config_file_values_survive_without_flags() {
        let file = config_file(
            r#"
            [http]
            timeout-ms = 1000

            [ble]
            device = "Lock From File"
            "#,
        );
        let cli = Cli::parse_from([
            "duofuzz",
            "--config-file",
            file.path().to_str().unwrap(),
            "--django-input",
            "products.json",
        ]);

        let config = load_config(&cli).unwrap();

        assert_eq!(config.ble.device, "Lock From File");
        assert_eq!(config.http.timeout_ms, 1000);
        assert_eq!(config.http.seeds, PathBuf::from("products.json"));
    }
}
