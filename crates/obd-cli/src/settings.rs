//! Layered configuration: built-in defaults, then an optional TOML file,
//! then `OBD_` environment variables (`__` between nested keys).

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use obd_client::ClientConfig;
use std::path::Path;
use tracing::{debug, info};

/// File read when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "obd-diag.toml";

/// Load the session configuration. An explicitly named file must exist;
/// the default file is optional.
pub fn load(path: Option<&Path>) -> Result<ClientConfig> {
    let (file, required) = match path {
        Some(path) => (path, true),
        None => (Path::new(DEFAULT_CONFIG_FILE), false),
    };
    if file.exists() {
        info!("Loading config from: {}", file.display());
    } else {
        debug!("No config file at {}", file.display());
    }

    let settings = Config::builder()
        .add_source(Config::try_from(&ClientConfig::default())?)
        .add_source(File::from(file).format(FileFormat::Toml).required(required))
        .add_source(
            Environment::with_prefix("OBD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("Failed to read configuration ({})", file.display()))?;

    let config: ClientConfig = settings
        .try_deserialize()
        .context("Invalid configuration")?;
    config
        .safety_limits
        .validate()
        .context("Invalid safety limits")?;
    Ok(config)
}
