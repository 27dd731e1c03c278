use anyhow::{Context, Result};
use clap::Parser;
use logvault::context::{ActiveContext, ContextProvider, DeviceProfile};
use logvault::trail::{TrailRow, TrailTable};
use logvault::{ContainerParser, LogVaultConfig, RebuildOutcome, RebuildStep, VaultPicker};
use logvault_logging::{init_logging, LogConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "logvault-scan", about = "Discover, select and cache device log files")]
struct Cli {
    /// Config file (defaults to ~/.logvault/config.toml)
    #[arg(long, env = "LOGVAULT_CONFIG")]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Active device name
    #[arg(long, default_value = "HoTTViewer")]
    device: String,

    /// Active channel number
    #[arg(long, default_value = "1")]
    channel: u32,

    /// Active object key
    #[arg(long)]
    object: Option<String>,

    /// Retrospect window in months
    #[arg(long, default_value = "12")]
    months: u32,

    /// Extensions the device imports from raw logs
    #[arg(long = "import-ext")]
    import_extensions: Vec<String>,

    /// Rebuild step, letter (A..F) or name
    #[arg(long, default_value = "A")]
    step: RebuildStep,

    /// Keep watching for changes for this many seconds
    #[arg(long, value_name = "SECS")]
    watch: Option<u64>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,
}

#[derive(Serialize)]
struct Report<'a> {
    outcome: &'a RebuildOutcome,
    rows: &'a [TrailRow],
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(LogConfig {
        app_name: "logvault-scan",
        verbose: cli.verbose,
        quiet_console: cli.json,
    })?;

    let config = load_config(&cli)?;
    let table = Arc::new(Mutex::new(TrailTable::default()));
    let mut picker = VaultPicker::new(config, Arc::new(ContainerParser))
        .with_trail(Box::new(Arc::clone(&table)));

    let outcome = picker
        .rebuild_from(cli.step, &cli)
        .context("Rebuild failed")?;
    print_outcome(&outcome, &table, cli.json)?;

    if let Some(secs) = cli.watch {
        let deadline = Instant::now() + Duration::from_secs(secs);
        let poll = picker.config().debounce().max(Duration::from_millis(500));
        info!(secs, watching = picker.is_watching(), "Watching for changes");
        while Instant::now() < deadline {
            std::thread::sleep(poll);
            let outcome = picker
                .rebuild_from(RebuildStep::FileCheck, &cli)
                .context("Rebuild failed")?;
            if outcome.vaults_rebuilt() {
                print_outcome(&outcome, &table, cli.json)?;
            }
        }
    }

    picker.close();
    Ok(())
}

fn load_config(cli: &Cli) -> Result<LogVaultConfig> {
    let path = cli.config.clone().unwrap_or_else(LogVaultConfig::default_path);
    let mut config = if path.exists() {
        LogVaultConfig::load(&path).with_context(|| format!("Failed to load config {}", path.display()))?
    } else {
        LogVaultConfig::default()
    };
    if let Some(data_dir) = &cli.data_dir {
        config.data_dir = data_dir.clone();
    }
    config.watch_directories = cli.watch.is_some();
    Ok(config)
}

impl ContextProvider for Cli {
    fn active_context(&self) -> ActiveContext {
        let device = DeviceProfile::new(&self.device).with_import_extensions(&self.import_extensions);
        let mut ctx = ActiveContext::new(device, self.channel).with_retrospect_months(self.months);
        if let Some(object) = &self.object {
            ctx = ctx.with_object_key(object);
        }
        ctx
    }
}

fn print_outcome(outcome: &RebuildOutcome, table: &Mutex<TrailTable>, json: bool) -> Result<()> {
    let table = table
        .lock()
        .map_err(|_| anyhow::anyhow!("Trail table lock poisoned"))?;

    if json {
        let report = Report {
            outcome,
            rows: &table.rows,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let stats = &outcome.statistics;
    println!("Step:        {} (requested {})", outcome.effective_step, outcome.requested_step);
    println!("Directories: {}", stats.directories);
    println!(
        "Files:       {} matched, {} non-workable, {} excluded",
        stats.files_matched, stats.files_non_workable, stats.files_excluded
    );
    println!(
        "Trusses:     {} extracted, {} rejected, {} duplicates",
        stats.trusses_extracted, stats.trusses_rejected, stats.duplicates_suppressed
    );
    println!(
        "Vaults:      {} from cache, {} parsed, {} failed",
        stats.cache_hits, stats.vaults_parsed, stats.parse_failures
    );
    println!("Elapsed:     {} ms", stats.elapsed_ms);

    if !table.rows.is_empty() {
        println!();
        for row in &table.rows {
            println!(
                "{:>15}  ch{}  {:<20} {}",
                row.start_timestamp_ms, row.channel_number, row.recordset_base_name, row.file
            );
        }
    }
    Ok(())
}
