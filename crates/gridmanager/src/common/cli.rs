use std::path::PathBuf;

use clap::Parser;

use crate::common::config::GridManagerConfig;
use crate::common::env::{GM_CONFIG, GM_DEBUG, GM_REPORT_TO, GM_SCRATCH_DIR};
use crate::transferd::DEFAULT_MAX_TRANSFERS;

// Common CLI options
#[derive(Parser)]
pub struct CommonOpts {
    /// Path to the configuration file
    #[arg(
        long,
        value_hint = clap::ValueHint::FilePath,
        global = true,
        env = GM_CONFIG,
        help_heading("GLOBAL OPTIONS")
    )]
    pub config: Option<PathBuf>,

    /// Directory for helper job files and stored sandboxes
    #[arg(
        long,
        value_hint = clap::ValueHint::DirPath,
        global = true,
        env = GM_SCRATCH_DIR,
        help_heading("GLOBAL OPTIONS")
    )]
    pub scratch_dir: Option<PathBuf>,

    /// Alternate endpoint that job updates are reported to
    #[arg(long, global = true, env = GM_REPORT_TO, help_heading("GLOBAL OPTIONS"))]
    pub report_to: Option<String>,

    /// Only jobs matching `attribute == value` are handled
    #[arg(long, global = true, help_heading("GLOBAL OPTIONS"))]
    pub constraint: Option<String>,

    /// Enables more detailed log output
    #[arg(
        long,
        env = GM_DEBUG,
        global = true,
        help_heading("GLOBAL OPTIONS"),
        hide_short_help(true)
    )]
    pub debug: bool,
}

impl CommonOpts {
    /// Loads the configuration and applies the command line overrides.
    pub fn load_config(&self) -> crate::Result<GridManagerConfig> {
        let mut config = GridManagerConfig::load(self.config.as_deref())?;
        self.apply(&mut config);
        Ok(config)
    }

    pub fn apply(&self, config: &mut GridManagerConfig) {
        if let Some(dir) = &self.scratch_dir {
            config.scratch_dir = dir.clone();
        }
        if let Some(report_to) = &self.report_to {
            config.report_to = Some(report_to.clone());
        }
        if let Some(constraint) = &self.constraint {
            config.constraint = Some(constraint.clone());
        }
    }
}

// Root CLI options
#[derive(Parser)]
#[command(
    author,
    about,
    version(crate::GM_VERSION),
    disable_help_subcommand(true),
    help_expected(true)
)]
pub struct RootOptions {
    #[clap(flatten)]
    pub common: CommonOpts,

    #[clap(subcommand)]
    pub subcmd: SubCommand,
}

#[derive(Parser)]
pub enum SubCommand {
    /// Manages the grid jobs of a job queue
    Run(RunOpts),
    /// Stores job sandboxes and streams them to remote clients
    Transferd(TransferdOpts),
}

#[derive(Parser)]
pub struct RunOpts {
    /// JSON file holding the job queue
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub queue_file: PathBuf,
}

#[derive(Parser)]
pub struct TransferdOpts {
    /// Port to listen on, a free port is picked by default
    #[arg(long, default_value_t = 0)]
    pub port: u16,

    /// File with the hex encoded access key, created when missing
    #[arg(long, value_hint = clap::ValueHint::FilePath)]
    pub key_file: Option<PathBuf>,

    /// How many sandboxes are streamed at the same time
    #[arg(long, default_value_t = DEFAULT_MAX_TRANSFERS)]
    pub max_transfers: usize,
}
