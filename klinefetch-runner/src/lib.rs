//! klinefetch runner: multi-symbol download orchestration, configuration, progress.
//!
//! This crate builds on `klinefetch-core` to provide:
//! - TOML download configuration with defaults for every field
//! - The `KlineDownloader` that fans symbols out over a thread pool
//! - Per-symbol outcomes and run summaries
//! - Progress reporting hooks (stdout, tracing, none)

pub mod config;
pub mod download;
pub mod progress;

pub use config::{ConfigError, DownloadConfig, ExchangeSettings};
pub use download::{
    DownloadOptions, DownloadRequest, DownloadSummary, KlineDownloader, RunError,
    SymbolDownload, SymbolFailure, SymbolOutcome, SymbolState,
};
pub use progress::{DownloadProgress, LogProgress, NoProgress, StdoutProgress};
