use clap::{CommandFactory, Parser, Subcommand};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File};
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};

use aqicast::api::{self, AppState};
use aqicast::category::CategoryMapper;
use aqicast::config::{AppConfig, DEFAULT_CONFIG_PATH};
use aqicast::constants::DATE_FORMAT;
use aqicast::forecast::{IterativeForecaster, write_forecast_csv};
use aqicast::registry::ModelRegistry;
use aqicast::series::{EntityId, ObservationStore};
use aqicast::projector::ModelFamily;
use aqicast::train::{TrainConfig, train_model};
use chrono::{NaiveDate, Utc};
use clap_complete::{Shell, generate};
use tracing_subscriber::EnvFilter;

const APP_ABOUT: &str = "aqicast - daily AQI forecasts from lagged county observations";
const BIN_NAME: &str = "aqicast";
const MODEL_DIR: &str = "models";
const CSV_ARCHIVE_EXTENSION: &str = "gz";
const DEFAULT_LOG_FILTER: &str = "aqicast=info,tower_http=info";

#[derive(Parser, Debug)]
#[command(name = BIN_NAME, about = APP_ABOUT)]
struct Args {
    /// TOML configuration file.
    #[arg(
        long = "config",
        value_name = "PATH",
        default_value = DEFAULT_CONFIG_PATH,
        global = true
    )]
    config: PathBuf,
    /// Gzip written CSV files to .csv.gz and remove the plain CSV.
    #[arg(long = "archive-csv", global = true)]
    archive_csv: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the JSON API.
    Serve {
        /// Bind host (overrides config and HOST).
        #[arg(long = "host", value_name = "HOST")]
        host: Option<String>,
        /// Bind port (overrides config and PORT).
        #[arg(long = "port", value_name = "PORT")]
        port: Option<u16>,
    },
    /// Forecast one county from the configured CSV and models.
    Forecast {
        #[arg(long = "county", value_name = "NAME")]
        county: String,
        #[arg(long = "state", value_name = "NAME")]
        state: String,
        /// Horizon in days: 1, 3, 7 or 14.
        #[arg(long = "days", value_name = "DAYS", default_value_t = 1)]
        days: i64,
        /// Model key (defaults to forecast.default_model).
        #[arg(long = "model", value_name = "KEY")]
        model: Option<String>,
        /// Forecast dates start the day after this date (defaults to today, UTC).
        #[arg(long = "anchor-date", value_name = "YYYY-MM-DD")]
        anchor_date: Option<String>,
        /// Write the forecast as CSV instead of printing JSON.
        #[arg(long = "output-csv", value_name = "PATH")]
        output_csv: Option<PathBuf>,
    },
    /// Fit a linear model for one family and write its artifact.
    Train {
        #[arg(long = "family", value_enum, default_value_t = ModelFamily::Balanced)]
        family: ModelFamily,
        /// Artifact path (defaults to the configured path for the family's key).
        #[arg(short = 'o', long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
        /// Ridge penalty.
        #[arg(long = "alpha", value_name = "ALPHA")]
        alpha: Option<f64>,
        #[arg(long = "max-iters", value_name = "N")]
        max_iters: Option<u64>,
    },
    /// Generate shell completion files.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
        /// Output file (stdout when omitted).
        #[arg(short = 'o', long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

/// Writes the completion script for `shell` to `output`, or stdout.
fn generate_completions(shell: Shell, output: Option<PathBuf>) -> Result<(), String> {
    let mut cmd = Args::command();
    let mut sink: Box<dyn Write> = match output {
        Some(path) => {
            create_parent_dir(&path)?;
            Box::new(
                File::create(&path)
                    .map_err(|err| format!("Failed to create {}: {err}", path.display()))?,
            )
        }
        None => Box::new(std::io::stdout()),
    };
    generate(shell, &mut cmd, BIN_NAME, &mut sink);
    Ok(())
}

fn create_parent_dir(path: &Path) -> Result<(), String> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent)
            .map_err(|err| format!("Failed to create {}: {err}", parent.display())),
        _ => Ok(()),
    }
}

/// `RUST_LOG` wins over the built-in filter. Event targets are shown only for `serve`.
fn init_logging(show_target: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(show_target)
        .with_ansi(std::io::stderr().is_terminal())
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Outcome tag carried by CLI progress lines.
#[derive(Clone, Copy, Debug)]
enum Status {
    Start,
    Progress,
    Done,
    Failed,
}

impl Status {
    const fn tag(self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Progress => "info",
            Self::Done => "ok",
            Self::Failed => "err",
        }
    }
}

fn report(status: Status, message: &str) {
    match status {
        Status::Failed => tracing::error!(status = status.tag(), "{message}"),
        _ => tracing::info!(status = status.tag(), "{message}"),
    }
}

fn load_config(path: &Path) -> Result<AppConfig, String> {
    let mut config = AppConfig::load(path).map_err(|err| err.to_string())?;
    config.apply_env_overrides().map_err(|err| err.to_string())?;
    Ok(config)
}

fn load_store(config: &AppConfig) -> Result<ObservationStore, String> {
    ObservationStore::load_csv(&config.data.path).map_err(|err| {
        format!(
            "Failed to read observations {}: {err}",
            config.data.path.display()
        )
    })
}

fn parse_anchor_date(raw: Option<&str>) -> Result<NaiveDate, String> {
    match raw {
        None => Ok(Utc::now().date_naive()),
        Some(raw) => NaiveDate::parse_from_str(raw.trim(), DATE_FORMAT)
            .map_err(|err| format!("Invalid anchor date '{raw}' (expected YYYY-MM-DD): {err}")),
    }
}

/// Gzips a written forecast CSV to `<name>.gz` beside it and removes the plain file.
fn archive_forecast_csv(csv_path: &Path) -> Result<PathBuf, String> {
    let mut archive_name = csv_path.as_os_str().to_owned();
    archive_name.push(".");
    archive_name.push(CSV_ARCHIVE_EXTENSION);
    let archive_path = PathBuf::from(archive_name);

    let mut input = File::open(csv_path)
        .map_err(|err| format!("Failed to open forecast {}: {err}", csv_path.display()))?;
    let mut encoder = GzEncoder::new(
        File::create(&archive_path)
            .map_err(|err| format!("Failed to create {}: {err}", archive_path.display()))?,
        Compression::default(),
    );
    let compress_err =
        |err: std::io::Error| format!("Failed to compress {}: {err}", archive_path.display());
    std::io::copy(&mut input, &mut encoder).map_err(compress_err)?;
    encoder.finish().map_err(compress_err)?;
    fs::remove_file(csv_path)
        .map_err(|err| format!("Failed to remove {}: {err}", csv_path.display()))?;
    Ok(archive_path)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "Failed to listen for shutdown signal");
    }
}

async fn serve(mut config: AppConfig, host: Option<String>, port: Option<u16>) -> Result<(), String> {
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    config.validate().map_err(|err| err.to_string())?;
    let addr = config.bind_address();

    let state = AppState::bootstrap(config).map_err(|err| err.to_string())?;
    report(Status::Progress, &format!(
        "Loaded {} observations for {} counties",
        state.services().store.len(),
        state.services().store.iter_series().count()
    ));
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|err| format!("Failed to bind {addr}: {err}"))?;
    report(Status::Done, &format!("Listening on http://{addr}"));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| format!("Server error: {err}"))
}

fn run_forecast(
    config: &AppConfig,
    entity: &EntityId,
    days: i64,
    model: Option<String>,
    anchor_date: Option<&str>,
    output_csv: Option<&Path>,
    archive_csv: bool,
) -> Result<(), String> {
    let anchor_date = parse_anchor_date(anchor_date)?;
    let model_key = model.unwrap_or_else(|| config.forecast.default_model.clone());
    let store = load_store(config)?;
    let registry = ModelRegistry::from_entries(&config.models).map_err(|err| err.to_string())?;
    let mapper =
        CategoryMapper::new(config.forecast.uncertainty_sigma).map_err(|err| err.to_string())?;
    tracing::info!(
        mode = "forecast",
        entity = %entity,
        model = %model_key,
        days,
        anchor = %anchor_date,
        "Forecasting"
    );

    let outcome = IterativeForecaster::new(&registry, mapper)
        .forecast_entity(
            &store,
            entity,
            config.data.window_days,
            days,
            &model_key,
            anchor_date,
        )
        .map_err(|err| format!("Failed to forecast {entity}: {err}"))?;

    match output_csv {
        Some(path) => {
            write_forecast_csv(outcome.steps(), path)
                .map_err(|err| format!("Failed to write forecast CSV: {err}"))?;
            if archive_csv {
                let archive = archive_forecast_csv(path)?;
                report(Status::Done, &format!("Saved forecast to {}", archive.display()));
            } else {
                report(Status::Done, &format!("Saved forecast to {}", path.display()));
            }
        }
        None => {
            let json = serde_json::to_string_pretty(outcome.steps())
                .map_err(|err| format!("Failed to serialize forecast: {err}"))?;
            println!("{json}");
        }
    }
    Ok(())
}

/// Configured artifact path for the family's model key, else `models/<family>.json`.
fn default_model_output(config: &AppConfig, family: ModelFamily) -> PathBuf {
    config.model_entry(family.name()).map_or_else(
        || Path::new(MODEL_DIR).join(format!("{family}.json")),
        |entry| entry.path.clone(),
    )
}

fn run_train(
    config: &AppConfig,
    family: ModelFamily,
    output: &Path,
    alpha: Option<f64>,
    max_iters: Option<u64>,
) -> Result<(), String> {
    let mut train_config = TrainConfig::default();
    if let Some(alpha) = alpha {
        if !alpha.is_finite() || alpha < 0.0 {
            return Err("alpha must be >= 0".to_string());
        }
        train_config.alpha = alpha;
    }
    if let Some(max_iters) = max_iters {
        train_config.max_iters = max_iters;
    }

    let store = load_store(config)?;
    report(
        Status::Progress,
        &format!(
            "Training {family} model on {} observations from {}",
            store.len(),
            config.data.path.display()
        ),
    );
    let artifact = train_model(&store, family, train_config)
        .map_err(|err| format!("Failed to train {family} model: {err}"))?;
    artifact
        .save(output)
        .map_err(|err| format!("Failed to write model {}: {err}", output.display()))?;
    report(
        Status::Done,
        &format!(
            "Saved {family} model {} to {} (rmse {:.3})",
            artifact.version,
            output.display(),
            artifact.metrics.get("rmse").copied().unwrap_or(f64::NAN)
        ),
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    let archive_csv = args.archive_csv;
    if let Command::Completions { shell, output } = args.command {
        if let Err(err) = generate_completions(shell, output) {
            eprintln!("{err}");
        }
        return;
    }

    init_logging(matches!(args.command, Command::Serve { .. }));
    report(Status::Start, APP_ABOUT);
    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(err) => {
            report(Status::Failed, &err);
            return;
        }
    };

    let result = match args.command {
        Command::Serve { host, port } => {
            tracing::info!(mode = "serve", config = %args.config.display(), "Starting API server");
            serve(config, host, port).await
        }
        Command::Forecast {
            county,
            state,
            days,
            model,
            anchor_date,
            output_csv,
        } => run_forecast(
            &config,
            &EntityId::new(county, state),
            days,
            model,
            anchor_date.as_deref(),
            output_csv.as_deref(),
            archive_csv,
        ),
        Command::Train {
            family,
            output,
            alpha,
            max_iters,
        } => {
            let output = output.unwrap_or_else(|| default_model_output(&config, family));
            tracing::info!(mode = "train", %family, output = %output.display(), "Training model");
            run_train(&config, family, &output, alpha, max_iters)
        }
        Command::Completions { .. } => Ok(()),
    };
    if let Err(err) = result {
        report(Status::Failed, &err);
    }
}
