//! Daemon argument parsing (spec.md §6 external interface list; the
//! argument-parsing *surface* is out of scope as a Non-goal, but the
//! ambient CLI stack that implements it is not).

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "aoloopd", version, about = "Adaptive-optics control loop daemon")]
pub struct Cli {
    /// Configuration file (`key = value` text format).
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Raise log verbosity; repeatable.
    #[arg(short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Lower log verbosity; repeatable.
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// Disable the network listener; run the loop engine only.
    #[arg(long = "nodaemon")]
    pub nodaemon: bool,

    /// Install the SIGINT handler (1) or leave termination to the
    /// process supervisor (0).
    #[arg(short = 's', default_value_t = 1)]
    pub signals: u8,

    /// Enable per-iteration performance logging (1) or disable it (0).
    #[arg(short = 'p', default_value_t = 0)]
    pub perflog: u8,
}

impl Cli {
    pub fn level_filter(&self) -> log::LevelFilter {
        const LEVELS: [log::LevelFilter; 5] = [
            log::LevelFilter::Error,
            log::LevelFilter::Warn,
            log::LevelFilter::Info,
            log::LevelFilter::Debug,
            log::LevelFilter::Trace,
        ];
        let base = 2i32;
        let idx = (base + self.verbose as i32 - self.quiet as i32).clamp(0, 4) as usize;
        LEVELS[idx]
    }
}
