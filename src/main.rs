use std::fs::File;

use anyhow::{Result, anyhow};
use clap::Parser;
use daemonize::Daemonize;
use log::{LevelFilter, error, info};
use syslog::{BasicLogger, Facility, Formatter3164};

use neopixeld::{application::Application, cli::Cli};

const DAEMON_LOG: &str = "/var/tmp/neopixeld.log";

fn init_syslog(level: LevelFilter) -> Result<()> {
    syslog::unix(Formatter3164 {
        facility: Facility::LOG_USER,
        hostname: None,
        process: "neopixeld".into(),
        pid: std::process::id(),
    })
    .map_err(|e| anyhow!("{e}"))
    .and_then(|logger| {
        log::set_boxed_logger(Box::new(BasicLogger::new(logger)))
            .map(|()| log::set_max_level(level))
            .map_err(|e| anyhow!("{e}"))
    })
}

fn init_stderr_log(level: LevelFilter) {
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn into_daemon() -> Result<()> {
    File::create(DAEMON_LOG)
        .and_then(|out| Ok((out.try_clone()?, out)))
        .map_err(|e| anyhow!("{e}"))
        .and_then(|(stderr, stdout)| {
            Daemonize::new()
                .stdout(stdout)
                .stderr(stderr)
                .start()
                .map_err(|e| anyhow!("{e}"))
        })
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // fork before the runtime exists; its threads would not survive
    if cli.daemonize {
        init_syslog(cli.log_level()).and(into_daemon())?;
    } else {
        init_stderr_log(cli.log_level());
    }

    #[cfg(feature = "tokio-console")]
    console_subscriber::init();

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(async {
            info!("neopixeld {} starting", env!("CARGO_PKG_VERSION"));
            let mut app = Application::builder().with_settings(cli.settings()).build()?;
            if let Err(e) = app.run().await {
                error!("neopixeld stopped with error: {e:#}");
                return Err(e);
            }
            info!("neopixeld stopped");
            Ok(())
        })
}
