//! eodms-dl - command-line interface
//!
//! Thin glue over the `eodms_dl` library: arguments and the config file become a
//! [`Config`] plus a [`RunRequest`], the pipeline does the rest.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use eodms_dl::logging::init_logging;
use eodms_dl::utils::{parse_date_range, parse_maximum, parse_record_ids};
use eodms_dl::{
    Config, Error, Pipeline, Priority, RapiClient, Result, RunRequest, RunSummary, SearchRequest,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Process {
    /// Search, order, poll and download
    Full,
    /// Search and order only
    OrderOnly,
    /// Order and download the records given with --record-ids
    RecordId,
    /// Order and download the records of an EODMS export given with --input
    OrderCsv,
    /// Resume from a results table given with --input
    DownloadResults,
    /// Download the available items of existing orders
    DownloadAvailable,
}

#[derive(Parser)]
#[command(name = "eodms-dl", version)]
#[command(about = "Search, order and download imagery from EODMS", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// EODMS username
    #[arg(long, short, env = "EODMS_USER")]
    username: Option<String>,

    /// EODMS password
    #[arg(long, short, env = "EODMS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// What the run does
    #[arg(long, value_enum, default_value = "full")]
    process: Process,

    /// Collections to search, comma separated (e.g. RCMImageProducts,Radarsat2)
    #[arg(long, value_delimiter = ',')]
    collections: Vec<String>,

    /// AOI file with a WKT geometry, an EODMS export or the results table to resume from
    #[arg(long, short)]
    input: Option<PathBuf>,

    /// Records to order, as `Collection:id,id|Collection:id`
    #[arg(long)]
    record_ids: Option<String>,

    /// Acquisition date range, `YYYYMMDD[THHMMSS]-YYYYMMDD[THHMMSS]`
    #[arg(long, short)]
    dates: Option<String>,

    /// Attribute filter in RAPI query syntax; repeatable
    #[arg(long = "filter", short)]
    filters: Vec<String>,

    /// Image limits as `total[:per_order]`
    #[arg(long, short)]
    maximum: Option<String>,

    /// Order priority (low, medium, high, urgent)
    #[arg(long)]
    priority: Option<String>,

    /// Download again even when the file is already on disk
    #[arg(long)]
    force: bool,

    /// Where images are written
    #[arg(long)]
    download_dir: Option<PathBuf>,

    /// Where results tables are written
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Where the log file is written
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let _guard = match init_logging(config.paths.log.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match run(&args, config).await {
        Ok(summary) if summary.interrupted => ExitCode::from(130),
        Ok(_) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Run aborted");
            ExitCode::FAILURE
        }
    }
}

fn build_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Some(username) = &args.username {
        config.rapi.username = Some(username.clone());
    }
    if let Some(password) = &args.password {
        config.rapi.password = Some(password.clone());
    }
    if let Some(maximum) = &args.maximum {
        let (total, per_order) = parse_maximum(maximum)?;
        config.order.max_images = total;
        if let Some(per_order) = per_order {
            config.order.max_items_per_order = per_order;
        }
    }
    if let Some(priority) = &args.priority {
        config.order.priority = priority.parse::<Priority>()?;
    }
    if args.force {
        config.download.force = true;
    }
    if let Some(dir) = &args.download_dir {
        config.paths.downloads = dir.clone();
    }
    if let Some(dir) = &args.results_dir {
        config.paths.results = dir.clone();
    }
    if let Some(dir) = &args.log_dir {
        config.paths.log = Some(dir.clone());
    }

    config.validate()?;
    Ok(config)
}

fn build_request(args: &Args, config: &Config) -> Result<RunRequest> {
    let request = match args.process {
        Process::Full => RunRequest::Full(search_request(args)?),
        Process::OrderOnly => RunRequest::OrderOnly(search_request(args)?),
        Process::RecordId => {
            let ids = args.record_ids.as_deref().ok_or_else(|| {
                Error::InvalidInput("--record-ids is required for this process".to_string())
            })?;
            RunRequest::RecordIds(parse_record_ids(ids)?)
        }
        Process::OrderCsv => {
            let input = args.input.clone().ok_or_else(|| {
                Error::InvalidInput("--input must name an EODMS export (CSV)".to_string())
            })?;
            RunRequest::OrderCsv(input)
        }
        Process::DownloadResults => {
            let input = args.input.clone().ok_or_else(|| {
                Error::InvalidInput("--input must name a results table".to_string())
            })?;
            RunRequest::DownloadResults(input)
        }
        Process::DownloadAvailable => RunRequest::DownloadAvailable {
            max_orders: config.order.max_recent_orders,
        },
    };
    Ok(request)
}

fn search_request(args: &Args) -> Result<SearchRequest> {
    if args.collections.is_empty() {
        return Err(Error::InvalidInput(
            "--collections is required for a search".to_string(),
        ));
    }
    let geometry = args.input.as_deref().map(read_aoi).transpose()?;
    let date_range = args.dates.as_deref().map(parse_date_range).transpose()?;

    Ok(SearchRequest {
        collections: args.collections.clone(),
        filters: args.filters.clone(),
        geometry,
        date_range,
        source: args.input.as_ref().map(|p| p.display().to_string()),
    })
}

fn read_aoi(path: &Path) -> Result<String> {
    let wkt = std::fs::read_to_string(path)?;
    let wkt = wkt.trim();
    if wkt.is_empty() {
        return Err(Error::InvalidInput(format!(
            "AOI file {} is empty",
            path.display()
        )));
    }
    Ok(wkt.to_string())
}

async fn run(args: &Args, config: Config) -> Result<RunSummary> {
    let request = build_request(args, &config)?;
    let client = Arc::new(RapiClient::new(&config.rapi)?);
    let pipeline = Pipeline::new(config, client);

    let signals = tokio::spawn(eodms_dl::cancel_on_signal(pipeline.cancellation_token()));
    let result = pipeline.run(request).await;
    signals.abort();
    result
}
