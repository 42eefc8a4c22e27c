use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use snafu::ResultExt;

use super::models::Settings;
use super::store::{ConfigError, LoadSnafu};

/// Settings together with the files they were read from. The caller logs the
/// sources, as logging is only set up once the log filter is known.
#[derive(Debug)]
pub struct LoadedSettings {
    pub settings: Settings,
    pub sources: Vec<PathBuf>,
}

/// Reads the settings from the defaults, the optional config file and `PKA_*` env vars.
pub fn load_settings(file: Option<&Path>) -> Result<LoadedSettings, ConfigError> {
    let mut sources = Vec::new();

    // As Rust has no native support for .env files,
    // we use the dotenv_flow crate to import to actual ENV vars.
    if let Ok(paths) = dotenv_flow::dotenv_flow() {
        sources.extend(paths);
    }

    let file = file.map(Path::to_path_buf).or_else(|| std::env::var_os("PKA_CONFIG_FILE").map(PathBuf::from));

    let mut builder = Config::builder()
        .set_default("scheduler.tick", "15m").context(LoadSnafu)?
        .set_default("discovery.enabled", "true").context(LoadSnafu)?
        .set_default("discovery.period", "3h").context(LoadSnafu)?
        .set_default("discovery.timeout", "6s").context(LoadSnafu)?
        .set_default("ipp.ignoretlserrors", "true").context(LoadSnafu)?
        .set_default("mqtt.enabled", "false").context(LoadSnafu)?
        .set_default("mqtt.host", "localhost").context(LoadSnafu)?
        .set_default("mqtt.port", "1883").context(LoadSnafu)?
        .set_default("mqtt.secure", "false").context(LoadSnafu)?
        .set_default("mqtt.username", "").context(LoadSnafu)?
        .set_default("mqtt.password", "").context(LoadSnafu)?
        .set_default("mqtt.retain", "true").context(LoadSnafu)?
        .set_default("mqtt.ha.enablediscovery", "true").context(LoadSnafu)?;

    if let Some(path) = file {
        builder = builder.add_source(File::from(path.as_path()).required(true));
        sources.push(path);
    }

    let config = builder
        .add_source(Environment::default()
            .prefix("PKA")
            .separator("_")
            .prefix_separator("_")
            .try_parsing(true)
            .with_list_parse_key("discovery.candidates")
            .list_separator(","))
        .build()
        .context(LoadSnafu)?;

    let settings = config.try_deserialize().context(LoadSnafu)?;
    Ok(LoadedSettings { settings, sources })
}
