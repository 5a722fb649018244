//! klinefetch CLI: download Binance klines to CSV, list markets and timeframes.
//!
//! Commands:
//! - `download`: fetch klines for one or more symbols into per-symbol CSV files
//! - `markets`: list the symbols the exchange currently trades
//! - `timeframes`: print the supported timeframe codes

use anyhow::{bail, Context, Result};
use clap::builder::PossibleValuesParser;
use clap::{Parser, Subcommand};
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use klinefetch_core::exchange::{BinanceClient, Credentials, Exchange};
use klinefetch_core::{InstantInput, Timeframe, TimestampStyle};
use klinefetch_runner::{
    DownloadConfig, DownloadOptions, DownloadRequest, KlineDownloader, StdoutProgress,
};

#[derive(Parser)]
#[command(
    name = "klinefetch",
    version,
    about = "klinefetch: paginated Binance kline downloader"
)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides).
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Download klines for the given symbols into CSV files.
    Download {
        /// Symbols to download (e.g., BTC/USDT ETH/USDT).
        #[arg(required = true)]
        symbols: Vec<String>,

        /// Start date ("YYYY-MM-DD HH:MM:SS", UTC unless an RFC 3339 offset is given).
        #[arg(long)]
        start_date: String,

        /// End date, same format. Defaults to now.
        #[arg(long)]
        end_date: Option<String>,

        /// Kline timeframe.
        #[arg(long, default_value = "1h", value_parser = PossibleValuesParser::new(Timeframe::ALL.map(Timeframe::as_str)))]
        timeframe: String,

        /// Directory for the CSV files [default: current directory].
        #[arg(long)]
        output_dir: Option<PathBuf>,

        /// Rows per request (overrides the config file).
        #[arg(long)]
        limit: Option<u32>,

        /// Maximum symbols downloaded at once (overrides the config file).
        #[arg(long)]
        max_concurrency: Option<usize>,

        /// TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Render CSV timestamps in UTC instead of local time.
        #[arg(long, default_value_t = false)]
        utc_timestamps: bool,

        /// Do not ask before appending to an existing output directory.
        #[arg(short, long, default_value_t = false)]
        yes: bool,
    },
    /// List symbols available on the exchange.
    Markets {
        /// Only show symbols quoted in this asset (e.g., USDT).
        #[arg(long)]
        quote: Option<String>,

        /// TOML config file.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the supported timeframes.
    Timeframes,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    // A missing .env is fine; credentials are optional.
    let _ = dotenvy::dotenv();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Download {
            symbols,
            start_date,
            end_date,
            timeframe,
            output_dir,
            limit,
            max_concurrency,
            config,
            utc_timestamps,
            yes,
        } => {
            let mut cfg = load_config(config.as_deref())?;
            if let Some(limit) = limit {
                cfg.limit = limit;
            }
            if max_concurrency.is_some() {
                cfg.max_concurrency = max_concurrency;
            }
            if utc_timestamps {
                cfg.timestamp_style = TimestampStyle::Utc;
            }
            cfg.validate()?;

            let confirm = needs_confirmation(output_dir.as_deref(), yes);
            let output_dir = output_dir.unwrap_or_else(|| PathBuf::from("."));

            let start = parse_instant(&start_date, "--start-date")?;
            let mut request = DownloadRequest::new(symbols, start, output_dir).with_timeframe(timeframe);
            if let Some(end) = end_date.as_deref() {
                request = request.with_end(parse_instant(end, "--end-date")?);
            }
            if request.end <= request.start {
                bail!(
                    "end date {} is not after start date {}",
                    request.end,
                    request.start
                );
            }

            if confirm && !confirm_existing_dir(&request.output_dir)? {
                bail!("aborted: output directory {} already exists", request.output_dir.display());
            }

            run_download(&cfg, &request)
        }
        Commands::Markets { quote, config } => {
            let cfg = load_config(config.as_deref())?;
            run_markets(&cfg, quote.as_deref())
        }
        Commands::Timeframes => {
            println!("{}", Timeframe::available());
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(path: Option<&Path>) -> Result<DownloadConfig> {
    match path {
        Some(path) => DownloadConfig::from_file(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => Ok(DownloadConfig::default()),
    }
}

/// Parse a command-line date. Dates without an offset are UTC.
fn parse_instant(value: &str, flag: &str) -> Result<InstantInput> {
    let input = value
        .parse::<InstantInput>()
        .with_context(|| format!("invalid {flag}"))?;
    Ok(match input {
        InstantInput::Naive(naive) => naive.and_utc().into(),
        zoned => zoned,
    })
}

/// Only a directory the user named is worth a prompt; the default is the
/// working directory, which always exists.
fn needs_confirmation(output_dir: Option<&Path>, yes: bool) -> bool {
    !yes && output_dir.is_some_and(Path::exists)
}

fn connect(cfg: &DownloadConfig) -> Result<Arc<BinanceClient>> {
    let credentials = Credentials::from_env();
    if credentials.is_empty() {
        tracing::debug!("no API credentials found, using public endpoints");
    }
    let client = BinanceClient::new(cfg.exchange.to_binance_config(credentials))
        .context("failed to create Binance client")?;
    Ok(Arc::new(client))
}

fn confirm_existing_dir(dir: &Path) -> Result<bool> {
    print!(
        "Output directory {} already exists. Existing files will be appended to. Continue? [y/N] ",
        dir.display()
    );
    std::io::stdout().flush()?;

    let mut answer = String::new();
    std::io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn run_download(cfg: &DownloadConfig, request: &DownloadRequest) -> Result<()> {
    let client = connect(cfg)?;
    let options = DownloadOptions {
        retain_batches: false,
        ..DownloadOptions::from(cfg)
    };

    let summary = KlineDownloader::new(client)
        .with_options(options)
        .run(request, &StdoutProgress)?;

    if !summary.all_succeeded() {
        for failure in summary.failures() {
            eprintln!("Error for {failure}");
        }
        std::process::exit(1);
    }

    Ok(())
}

fn run_markets(cfg: &DownloadConfig, quote: Option<&str>) -> Result<()> {
    let client = connect(cfg)?;
    let markets = client.list_markets();
    client.close()?;

    let suffix = quote.map(|q| format!("/{}", q.to_ascii_uppercase()));
    let mut count = 0;
    for symbol in markets? {
        if suffix.as_deref().map_or(true, |s| symbol.ends_with(s)) {
            println!("{symbol}");
            count += 1;
        }
    }
    eprintln!("{count} markets");
    Ok(())
}
