use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

use crate::application::Settings;

/// Networked NeoPixel LED strip controller daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// YAML config file path
    #[arg(short = 'c', long = "config", default_value = "/etc/neopixeld/config.yml")]
    pub config: PathBuf,

    /// HTTP listen port
    #[arg(long, default_value_t = 8080)]
    pub http_port: u16,

    /// Captive-portal DNS listen port
    #[arg(long, default_value_t = 5335)]
    pub dns_port: u16,

    /// Address every DNS query resolves to
    #[arg(long, default_value_t = Ipv4Addr::new(192, 168, 168, 1))]
    pub ap_address: Ipv4Addr,

    /// Number of pixels on the strip
    #[arg(long, default_value_t = 60)]
    pub pixels: usize,

    /// Directory holding the gzipped dashboard and setup pages
    #[arg(long, default_value = "./www")]
    pub static_dir: PathBuf,

    /// Device id suffix (default: last 3 bytes of the MAC address)
    #[arg(long)]
    pub device_id: Option<String>,

    /// Detach and log to syslog
    #[arg(short = 'd', long = "daemonize", default_value = "false")]
    pub daemonize: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn settings(&self) -> Settings {
        Settings {
            config_path: Some(self.config.clone()),
            http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.http_port)),
            dns_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.dns_port)),
            ap_address: self.ap_address,
            pixels: self.pixels,
            static_dir: self.static_dir.clone(),
            device_id: self.device_id.clone(),
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}
