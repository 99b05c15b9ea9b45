use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand};
use intervene_core::config::Config;
use intervene_core::events::RunEvent;
use intervene_core::run::RunSupervisor;

const VALID_SECTIONS: &[&str] = &["openai", "llm", "vector_store", "storage", "server"];

#[derive(Parser)]
#[command(name = "intervene-cli")]
struct Cli {
    /// Path to the config file
    #[arg(long, default_value = "intervene.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the configured objective and print each event as a JSON line
    Run {
        /// Use this objective instead of the one in the config file
        #[arg(long)]
        objective: Option<String>,
    },
    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Pretty-print the config as TOML, with API keys redacted
    Show {
        /// Optional section name to display
        section: Option<String>,
    },
    /// Get a config value by dot notation
    Get {
        /// Dot-notation key (e.g., vector_store.backend)
        key: String,
    },
    /// Validate the config file
    Validate,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run { objective } => {
            let mut stdout = std::io::stdout();
            match run(&cli.config, objective, &mut stdout).await {
                Ok(true) => Ok(String::new()),
                Ok(false) => process::exit(1),
                Err(e) => Err(e),
            }
        }
        Command::Config { action } => match action {
            ConfigAction::Show { section } => show_config(&cli.config, section.as_deref()),
            ConfigAction::Get { key } => get_value(&cli.config, &key),
            ConfigAction::Validate => validate_config(&cli.config),
        },
    };

    match result {
        Ok(output) => print!("{output}"),
        Err(msg) => {
            eprintln!("{msg}");
            process::exit(1);
        }
    }
}

fn load_config(config_path: &Path) -> Result<Config, String> {
    if !config_path.exists() {
        return Err(format!(
            "Config file not found: {}. Use --config to specify the path.",
            config_path.display()
        ));
    }
    Config::from_file(config_path).map_err(|e| format!("Config error: {e}"))
}

/// Start one run and write its events to `out` until `done`. Ctrl-C cancels
/// the run. Returns whether the run succeeded.
async fn run(
    config_path: &Path,
    objective: Option<String>,
    out: &mut impl Write,
) -> Result<bool, String> {
    let config = load_config(config_path)?;
    let supervisor = RunSupervisor::new();
    let mut handle = supervisor.start(config, objective);
    log::debug!("started run {}", handle.run_id);

    let mut succeeded = false;
    loop {
        let event = tokio::select! {
            event = handle.events.recv() => event,
            Ok(()) = tokio::signal::ctrl_c() => {
                supervisor.cancel();
                continue;
            }
        };
        let Some(event) = event else { break };

        let line = serde_json::to_string(&event).map_err(|e| format!("Output error: {e}"))?;
        writeln!(out, "{line}").map_err(|e| format!("Output error: {e}"))?;

        if let RunEvent::Done { error, .. } = &event {
            succeeded = error.is_none();
            break;
        }
    }
    Ok(succeeded)
}

fn show_config(config_path: &Path, section: Option<&str>) -> Result<String, String> {
    let config = load_config(config_path)?.redacted();
    let text = config.to_toml_string().map_err(|e| format!("Config error: {e}"))?;

    let Some(name) = section else {
        return Ok(text);
    };
    if !VALID_SECTIONS.contains(&name) {
        return Err(format!(
            "Unknown section '{name}'. Valid sections: {}",
            VALID_SECTIONS.join(", ")
        ));
    }
    let full: toml::Value = toml::from_str(&text).map_err(|e| format!("Config error: {e}"))?;
    let mut wrapper = toml::map::Map::new();
    wrapper.insert(
        name.to_string(),
        full.get(name)
            .cloned()
            .unwrap_or_else(|| toml::Value::Table(toml::map::Map::new())),
    );
    toml::to_string_pretty(&wrapper).map_err(|e| format!("Config error: {e}"))
}

fn get_value(config_path: &Path, key: &str) -> Result<String, String> {
    let config = load_config(config_path)?.redacted();
    let text = config.to_toml_string().map_err(|e| format!("Config error: {e}"))?;
    let root: toml::Value = toml::from_str(&text).map_err(|e| format!("Config error: {e}"))?;

    let value = key
        .split('.')
        .try_fold(&root, |node, part| node.get(part))
        .ok_or_else(|| format!("Key not found: {key}"))?;
    Ok(match value {
        toml::Value::String(s) => format!("{s}\n"),
        toml::Value::Table(_) => toml::to_string_pretty(value).map_err(|e| format!("Config error: {e}"))?,
        other => format!("{other}\n"),
    })
}

/// Parse and run every pre-flight check a run would.
fn validate_config(config_path: &Path) -> Result<String, String> {
    let config = load_config(config_path)?;
    config.validate().map_err(|e| format!("Config error: {e}"))?;
    intervene_core::openapi::load_documents(&config.openapis)
        .map_err(|e| format!("Config error: {e}"))?;
    Ok("Configuration is valid.\n".to_string())
}
