// Configuration module entry point
// Layered configuration: optional file, then GRACE__* environment, then defaults

mod types;

pub use types::{Config, GraceConfig, HttpConfig, LogFormat, LoggingConfig, ServerConfig};

/// Config file used when none is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "grace.toml";

impl Config {
    /// Load configuration from the specified file path.
    ///
    /// The file is optional; environment variables such as
    /// `GRACE__SERVER__ADDRESS` override it.
    pub fn load_from(config_path: &str) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(
                config::Environment::with_prefix("GRACE")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .set_default("server.network", "tcp")?
            .set_default("server.address", ":6086")?
            .set_default("server.reuse_port", false)?
            .set_default("grace.close_timeout_secs", 10)?
            .set_default("grace.notify_parent", true)?
            .set_default("http.server_name", "grace-server")?
            .set_default("http.keep_alive", true)?
            .set_default("http.connection_timeout_secs", 0)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "full")?
            .set_default("logging.access_log", true)?
            .build()?;

        settings.try_deserialize()
    }
}
