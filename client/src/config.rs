use std::{path::PathBuf, time::Duration};

use clap::{Parser, Subcommand};
use url::Url;

use crate::{api::RetryPolicy, scheduler::ScanSettings};

#[derive(Parser, Debug, Clone)]
#[command(name = "morphoview", version, about = "Upload slides and watch them through the scan queue", long_about = None)]
pub struct Args {
    /// Where the slide backend listens
    #[arg(short, long, env = "MORPHOVIEW_BASE_URL", default_value = "http://localhost:8000")]
    pub base_url: Url,

    /// Milliseconds between two looks at the queue
    #[arg(long, env = "MORPHOVIEW_POLL_MS", default_value_t = 1500)]
    pub poll_ms: u64,

    /// Milliseconds between two steps of the scan progress animation
    #[arg(long, env = "MORPHOVIEW_TICK_MS", default_value_t = 80)]
    pub tick_ms: u64,

    /// Percent added per animation step
    #[arg(long, env = "MORPHOVIEW_STEP", default_value_t = 5, value_parser = clap::value_parser!(u8).range(1..=100))]
    pub step: u8,

    /// Attempts for the slide listing and metadata reads at startup
    #[arg(long, env = "MORPHOVIEW_MAX_TRIES", default_value_t = 3)]
    pub max_tries: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Upload slides; each one joins the queue
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Show the scan queue
    List {
        /// Dump the records as JSON instead
        #[arg(long)]
        json: bool,
    },
    /// List scanned slides for review
    Review,
    /// Open one scanned slide
    Show { file_id: String },
    /// Aggregate metrics and the queue
    Dashboard,
    /// Move a queued slide to high priority
    #[command(alias = "prioritize")]
    Prioritise { file_id: String },
    /// Delete a finished slide from the backend
    Delete { file_id: String },
    /// Drive the queue, optionally uploading some slides first
    Run {
        files: Vec<PathBuf>,
        /// Keep polling after the queue runs dry
        #[arg(long)]
        keep_going: bool,
    },
}

impl Args {
    pub fn scan_settings(&self) -> ScanSettings {
        ScanSettings {
            poll_interval: Duration::from_millis(self.poll_ms),
            progress_tick: Duration::from_millis(self.tick_ms),
            progress_step: self.step,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_tries: self.max_tries,
            ..RetryPolicy::default()
        }
    }
}
