use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn, LevelFilter};
use scopecore::{tui::Status, Conf, FilterRegistry, Session};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode, WriteLogger};
use std::{fs::File, path::PathBuf, str::FromStr};
use time::OffsetDateTime;

#[derive(Parser, Debug)]
#[command(version, about = "Multi-instrument scope acquisition and filter graph")]
struct Args {
    /// Session config file (TOML)
    #[arg(short, long, default_value = "scopecore.toml")]
    config: PathBuf,

    /// Run this many processing cycles without the terminal UI, then exit
    #[arg(long, value_name = "CYCLES")]
    headless: Option<u64>,

    /// Log at debug level regardless of the config
    #[arg(short, long)]
    verbose: bool,
}

fn log_file_name(now: OffsetDateTime) -> String {
    format!(
        "scopecore_{}{:02}{:02}_{:02}{:02}{:02}.log",
        now.year(),
        u8::from(now.month()),
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

fn init_logging(conf: &Conf, verbose: bool, headless: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::from_str(&conf.logging.level)
            .with_context(|| format!("invalid log level '{}'", conf.logging.level))?
    };
    let log_config = ConfigBuilder::new().set_thread_level(LevelFilter::Error).build();

    if headless {
        TermLogger::init(level, log_config, TerminalMode::Mixed, ColorChoice::Auto)?;
    } else {
        // The terminal belongs to the UI; log to a file instead.
        let dir = PathBuf::from(&conf.logging.dir);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create log dir {}", dir.display()))?;
        let path = dir.join(log_file_name(OffsetDateTime::now_utc()));
        let file = File::create(&path)
            .with_context(|| format!("cannot create log file {}", path.display()))?;
        WriteLogger::init(level, log_config, file)?;
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let conf = Conf::from_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    init_logging(&conf, args.verbose, args.headless.is_some())?;
    info!("Loaded config from {}", args.config.display());
    if conf.instruments.is_empty() {
        warn!("No instruments configured; nothing will be acquired");
    }

    let registry = FilterRegistry::with_builtin();
    let mut session = Session::from_config(&conf, &registry)?;

    match args.headless {
        Some(cycles) => scopecore::tui::run_headless(&mut session, cycles).map(|_| ()),
        None => {
            let mut terminal = ratatui::init();
            let mut status = Status::new(session);
            let result = status.run(&mut terminal);
            ratatui::restore();
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_file_name_is_sortable() {
        let name = log_file_name(OffsetDateTime::UNIX_EPOCH);
        assert_eq!(name, "scopecore_19700101_000000.log");
    }
}
