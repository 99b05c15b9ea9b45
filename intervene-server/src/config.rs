use clap::Parser;
use std::path::{Path, PathBuf};

use intervene_core::config::{Config, ConfigError};

const DEFAULT_CONFIG_PATH: &str = "intervene.toml";

#[derive(Parser)]
#[command(name = "intervene-server")]
struct Cli {
    /// Path to the configuration file
    #[arg(long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
}

/// Parse CLI arguments and load the config they point at.
///
/// A missing file is not an error: the server starts from defaults and
/// `PUT /api/config` creates the file.
pub fn load() -> Result<(Config, PathBuf), ConfigError> {
    let cli = Cli::parse();
    let config = load_from_path(&cli.config)?;
    Ok((config, cli.config))
}

pub fn load_from_path(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        log::warn!(
            "config file '{}' not found, starting from defaults",
            path.display()
        );
        return Config::parse("");
    }
    Config::from_file(path)
}
