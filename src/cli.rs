//! Command-line interface for the classroom tutor
//!
//! Handles argument parsing and logging configuration.

use std::path::PathBuf;

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use crate::lesson::TeachingMode;

/// Classroom Tutor - a Grade 1 English teacher you can talk to
#[derive(Parser, Debug)]
#[command(name = "classroom-tutor")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all log output except errors
    #[arg(short, long)]
    pub quiet: bool,

    /// Gemini API key (defaults to $GEMINI_API_KEY, then $API_KEY)
    #[arg(long)]
    pub api_key: Option<String>,

    /// Unit to select at startup
    #[arg(short, long)]
    pub unit: Option<u32>,

    /// Teaching mode: arabic or english
    #[arg(short, long)]
    pub mode: Option<TeachingMode>,

    /// Write every spoken step to this WAV file (overwritten each time)
    #[arg(long)]
    pub save_speech: Option<PathBuf>,

    /// Do not write settings changes to disk
    #[arg(long)]
    pub no_save: bool,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::ERROR
        } else {
            match self.verbose {
                0 => LevelFilter::WARN,
                1 => LevelFilter::INFO,
                2 => LevelFilter::DEBUG,
                _ => LevelFilter::TRACE,
            }
        }
    }

    pub fn resolve_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .or_else(|| std::env::var("GEMINI_API_KEY").ok())
            .or_else(|| std::env::var("API_KEY").ok())
            .filter(|key| !key.trim().is_empty())
    }
}

/// Initialize logging based on CLI arguments. Logs go to stderr so they do
/// not interleave with the lesson transcript.
pub fn init_logging(args: &Args) {
    let level = args.log_level();
    // Dependencies stay at warn unless tracing everything.
    let base = if args.quiet {
        LevelFilter::ERROR
    } else if args.verbose >= 3 {
        level
    } else {
        LevelFilter::WARN
    };
    let filter = EnvFilter::new(format!(
        "{},classroom_tutor={},classroom_tutor_lib={}",
        base, level, level
    ));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        let args = Args::parse_from(["classroom-tutor", "-vv"]);
        assert_eq!(args.log_level(), LevelFilter::DEBUG);

        let args = Args::parse_from(["classroom-tutor", "-q", "-vvv"]);
        assert_eq!(args.log_level(), LevelFilter::ERROR);
    }

    #[test]
    fn lesson_overrides_parse() {
        let args = Args::parse_from(["classroom-tutor", "--unit", "3", "--mode", "english", "--api-key", "k"]);
        assert_eq!(args.unit, Some(3));
        assert_eq!(args.mode, Some(TeachingMode::English));
        assert_eq!(args.resolve_api_key().as_deref(), Some("k"));
    }
}
