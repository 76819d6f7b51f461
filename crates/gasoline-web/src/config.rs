//! Command line and environment, resolved once at startup.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

pub const DEFAULT_PORT: u16 = 7890;
pub const DEFAULT_MAX_ENTRIES: usize = 1000;
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const PORT_ENV: &str = "GASOLINE_PORT";
const API_KEY_ENV: &str = "GASOLINE_API_KEY";
const NO_AUTO_UPGRADE_ENV: &str = "GASOLINE_NO_AUTO_UPGRADE";
const EVIDENCE_RETRY_ENV: &str = "GASOLINE_EVIDENCE_RETRY_COUNT";
const EVIDENCE_MAX_CAPTURES_ENV: &str = "GASOLINE_EVIDENCE_MAX_CAPTURES_PER_COMMAND";

#[derive(Parser, Debug)]
#[command(name = "gasoline", version, about = "Browser observability bridge for AI coding assistants", long_about = None)]
pub struct Cli {
    /// HTTP port for the extension and HTTP MCP clients
    #[arg(long)]
    pub port: Option<u16>,

    /// Console log file (JSON lines)
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Console ring capacity
    #[arg(long, default_value_t = DEFAULT_MAX_ENTRIES)]
    pub max_entries: usize,

    /// Run the HTTP server only, without the stdio MCP transport
    #[arg(long)]
    pub server: bool,

    /// Require this value in the X-Gasoline-Key header
    #[arg(long)]
    pub api_key: Option<String>,

    /// Directory for PID files, the upgrade marker and crash logs
    #[arg(long, value_name = "DIR")]
    pub state_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvidenceSettings {
    pub retry_count: u32,
    pub max_captures: u32,
}

impl Default for EvidenceSettings {
    fn default() -> Self {
        Self {
            retry_count: 1,
            max_captures: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub log_file: PathBuf,
    pub max_entries: usize,
    pub server_only: bool,
    pub api_key: Option<String>,
    pub state_dir: PathBuf,
    pub auto_upgrade: bool,
    pub evidence: EvidenceSettings,
    /// First wait for a synchronous interact command.
    pub command_wait: Duration,
    /// Extra wait granted once when the extension is still connected.
    pub command_retry_wait: Duration,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let port = cli
            .port
            .or_else(|| std::env::var(PORT_ENV).ok().and_then(|v| v.trim().parse().ok()))
            .unwrap_or(DEFAULT_PORT);
        let api_key = cli
            .api_key
            .or_else(|| std::env::var(API_KEY_ENV).ok())
            .filter(|k| !k.is_empty());
        Self {
            port,
            log_file: cli
                .log_file
                .unwrap_or_else(|| home.join("gasoline-logs.jsonl")),
            max_entries: cli.max_entries.max(1),
            server_only: cli.server,
            api_key,
            state_dir: cli.state_dir.unwrap_or_else(|| home.join(".gasoline")),
            auto_upgrade: !env_truthy(NO_AUTO_UPGRADE_ENV),
            evidence: EvidenceSettings {
                retry_count: env_bounded(EVIDENCE_RETRY_ENV, 1, 0, 3),
                max_captures: env_bounded(EVIDENCE_MAX_CAPTURES_ENV, 2, 0, 2),
            },
            command_wait: Duration::from_secs(15),
            command_retry_wait: Duration::from_secs(5),
        }
    }

    /// Screenshots are saved next to the console log.
    pub fn screenshot_dir(&self) -> PathBuf {
        match self.log_file.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    pub fn pid_file(&self) -> PathBuf {
        self.state_dir.join(format!("gasoline-{}.pid", self.port))
    }

    pub fn upgrade_marker(&self) -> PathBuf {
        self.state_dir.join("last-upgrade.json")
    }

    pub fn crash_log(&self) -> PathBuf {
        self.state_dir.join("crash.log")
    }

    /// Settings for in-process tests: everything under `dir`, short waits.
    pub fn for_tests(dir: &std::path::Path) -> Self {
        Self {
            port: DEFAULT_PORT,
            log_file: dir.join("gasoline-logs.jsonl"),
            max_entries: DEFAULT_MAX_ENTRIES,
            server_only: true,
            api_key: None,
            state_dir: dir.join("state"),
            auto_upgrade: false,
            evidence: EvidenceSettings::default(),
            command_wait: Duration::from_millis(200),
            command_retry_wait: Duration::from_millis(50),
        }
    }
}

pub fn truthy(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "on" | "yes")
}

fn env_truthy(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| truthy(&v))
}

/// Parses `raw` as an integer clamped to `[min, max]`; unparsable values
/// fall back to `default`.
pub fn bounded(raw: Option<&str>, default: u32, min: u32, max: u32) -> u32 {
    raw.and_then(|v| v.trim().parse::<i64>().ok())
        .map(|v| v.clamp(i64::from(min), i64::from(max)) as u32)
        .unwrap_or(default)
}

fn env_bounded(name: &str, default: u32, min: u32, max: u32) -> u32 {
    bounded(std::env::var(name).ok().as_deref(), default, min, max)
}
