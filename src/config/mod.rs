use std::sync::OnceLock;

use figment::Figment;
use figment::providers::{Env, Format, Toml};
use serde::Deserialize;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Which binary is initializing the config. The flat legacy environment
/// variables (`PORT`, `DB_PATH`, `HUB_ADDRESS`, ...) are shared across the
/// deployment's processes, so their meaning depends on who is asking.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Process {
    Hub,
    Gateway,
    Worker,
}

pub fn init(process: Process) {
    let raw_config = Figment::new()
        .merge(Toml::file(
            Env::var("APP_CONFIG").as_deref().unwrap_or("config.toml"),
        ))
        .merge(Env::prefixed("APP_").split("__").global());

    let mut config = match raw_config.extract::<AppConfig>() {
        Ok(s) => s,
        Err(e) => {
            eprintln!(
                "It looks like your config is invalid. The following error occurred: {e}"
            );
            std::process::exit(1);
        }
    };
    config.apply_flat_env(process);
    CONFIG.set(config).expect("config should be set");
}

pub fn get() -> &'static AppConfig {
    CONFIG.get().expect("config should be set")
}

#[derive(Deserialize, Clone, Debug, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub hub: HubConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// Overlay the flat environment names other-language workers and the
    /// container setup already use (`PORT`, `LOG_LEVEL`, `DB_PATH`,
    /// `HUB_ADDRESS`, `WORKER_ID`).
    fn apply_flat_env(&mut self, process: Process) {
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.log.level = level;
        }
        if let Ok(port) = std::env::var("PORT")
            && let Ok(port) = port.parse::<u16>()
        {
            match process {
                Process::Hub => self.hub.port = port,
                Process::Gateway => self.gateway.port = port,
                Process::Worker => {}
            }
        }
        if let Ok(path) = std::env::var("DB_PATH") {
            self.hub.db_path = Some(path);
        }
        if let Ok(addr) = std::env::var("HUB_ADDRESS") {
            self.gateway.hub_address = addr.clone();
            self.worker.hub_address = addr;
        }
        if let Ok(id) = std::env::var("WORKER_ID") {
            self.worker.worker_id = Some(id);
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct HubConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_hub_port")]
    pub port: u16,
    /// File-transfer listener port; defaults to the hub port + 1.
    pub file_port: Option<u16>,
    /// SQLite path for the durable registry. Unset means the registry is
    /// rebuilt purely from incoming REGISTERs after a restart.
    pub db_path: Option<String>,
    #[serde(default = "default_files_dir")]
    pub files_dir: String,
}

impl HubConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.port)
    }

    pub fn file_bind_addr(&self) -> String {
        let port = self.file_port.unwrap_or(self.port + 1);
        format!("{}:{}", self.listen_addr, port)
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            port: default_hub_port(),
            file_port: None,
            db_path: None,
            files_dir: default_files_dir(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct GatewayConfig {
    #[serde(default = "default_hub_address")]
    pub hub_address: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            hub_address: default_hub_address(),
            port: default_gateway_port(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
pub struct WorkerConfig {
    pub worker_id: Option<String>,
    #[serde(default = "default_hub_address")]
    pub hub_address: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            hub_address: default_hub_address(),
        }
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0".into()
}

fn default_hub_port() -> u16 {
    50051
}

fn default_gateway_port() -> u16 {
    8081
}

fn default_hub_address() -> String {
    "127.0.0.1:50051".into()
}

fn default_files_dir() -> String {
    "./files".into()
}

fn default_request_timeout_secs() -> u64 {
    30
}

/// Logging knobs shared by all three binaries.
///
/// `level` takes a tracing filter directive string, so per-target levels
/// work the same way they would through `RUST_LOG`
/// (`"info,caphub::hub=debug"`); a plain level name is also fine. `json`
/// switches to line-oriented JSON output for log shippers.
#[derive(Deserialize, Clone, Debug)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    #[serde(default = "default_log_ansi")]
    pub ansi: bool,
}

impl LogConfig {
    /// Install the global tracing subscriber.
    ///
    /// `RUST_LOG` wins over the configured directives when set. Writes go
    /// through a non-blocking stdout writer; the returned guard flushes
    /// buffered lines on drop, so the binary keeps it alive until exit.
    pub fn install(&self) -> WorkerGuard {
        let filter = std::env::var("RUST_LOG")
            .ok()
            .and_then(|raw| EnvFilter::try_new(raw).ok())
            .or_else(|| EnvFilter::try_new(&self.level).ok())
            .unwrap_or_else(|| {
                eprintln!(
                    "invalid log directives {:?}, falling back to \"info\"",
                    self.level
                );
                EnvFilter::new("info")
            });

        let (writer, guard) =
            tracing_appender::non_blocking(std::io::stdout());
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(self.ansi);

        if self.json {
            builder.json().init();
        } else {
            builder.init();
        }
        guard
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            ansi: true,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_ansi() -> bool {
    true
}
