// CLI module - command-line argument parsing and config handlers
//
// The main invocation wraps the configured tool; anything after `--` is
// forwarded to it verbatim. A `config` subcommand manages the JSON config
// file.

use crate::config::{Config, Mode, VERSION};
use clap::{Parser, Subcommand};

/// codetap - transparent observability wrapper for AI-assistant CLIs
#[derive(Debug, Parser)]
#[command(name = "codetap")]
#[command(version = VERSION)]
#[command(about = "Transparent observability wrapper for AI-assistant CLIs", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Run mode
    #[arg(long, value_enum)]
    pub mode: Option<Mode>,

    /// Path to the wrapped tool's executable
    #[arg(long)]
    pub binary_path: Option<String>,

    /// Path to the observation database
    #[arg(long)]
    pub db_path: Option<std::path::PathBuf>,

    /// Directory scanned for plugin manifests
    #[arg(long)]
    pub plugins_dir: Option<std::path::PathBuf>,

    /// Only load these plugins (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub enable_plugins: Option<Vec<String>>,

    /// Never load these plugins (comma separated)
    #[arg(long, value_delimiter = ',')]
    pub disable_plugins: Option<Vec<String>>,

    /// Log level: debug, info, warn, error
    #[arg(long)]
    pub log_level: Option<String>,

    /// Arguments forwarded verbatim to the wrapped tool
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub forwarded: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Manage configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Show config file path
        #[arg(long)]
        path: bool,

        /// Write a fresh config file with defaults
        #[arg(long)]
        reset: bool,
    },
}

impl Cli {
    /// Apply CLI overrides on top of env/file/defaults.
    pub fn apply_to(&self, config: &mut Config) {
        if let Some(mode) = self.mode {
            config.mode = Some(mode);
            if mode == Mode::Test {
                config.database.kind = "memory".to_string();
                config.monitoring.log_level = "debug".to_string();
            }
        }
        if let Some(binary) = &self.binary_path {
            config.binary_path = Some(binary.clone());
        }
        if let Some(path) = &self.db_path {
            config.database.path = path.clone();
        }
        if let Some(dir) = &self.plugins_dir {
            config.plugins.directory = dir.clone();
        }
        if let Some(enabled) = &self.enable_plugins {
            config.plugins.enabled_plugins = Some(enabled.clone());
        }
        if let Some(disabled) = &self.disable_plugins {
            config.plugins.disabled_plugins = disabled.clone();
        }
        if let Some(level) = &self.log_level {
            config.monitoring.log_level = level.clone();
        }
    }
}

/// Handle the `config` subcommand. Returns true when a command was handled
/// and the process should exit.
pub fn handle_config_command(cli: &Cli) -> bool {
    let Some(Commands::Config { show, path, reset }) = &cli.command else {
        return false;
    };

    if *path {
        println!("{}", Config::config_path().display());
    } else if *reset {
        handle_config_reset();
    } else if *show {
        handle_config_show(cli);
    } else {
        println!("Usage: codetap config [--show|--path|--reset]");
    }
    true
}

fn handle_config_show(cli: &Cli) {
    let mut config = Config::load();
    cli.apply_to(&mut config);

    println!("# Effective configuration (cli > env > file > defaults)");
    println!();
    println!("mode = {:?}", config.mode());
    println!("binary = {:?}", config.binary());
    println!();
    println!("[wrapper]");
    println!("timeoutMs = {}", config.wrapper.timeout_ms);
    println!("bufferSize = {}", config.wrapper.buffer_size);
    println!("gracefulShutdownMs = {}", config.wrapper.graceful_shutdown_ms);
    println!();
    println!("[plugins]");
    println!("directory = {:?}", config.plugins.directory.display().to_string());
    println!("retryAttempts = {}", config.plugins.retry_attempts);
    println!("enabledPlugins = {:?}", config.plugins.enabled_plugins);
    println!("disabledPlugins = {:?}", config.plugins.disabled_plugins);
    println!();
    println!("[database]");
    println!("kind = {:?}", config.database.kind);
    println!("path = {:?}", config.database.path.display().to_string());
    println!("batchSize = {}", config.database.batch_size);
    println!("flushIntervalMs = {}", config.database.flush_interval_ms);
    println!();
    println!("[monitoring]");
    println!("enabled = {}", config.monitoring.enabled);
    println!("logLevel = {:?}", config.monitoring.log_level);

    println!();
    let path = Config::config_path();
    if path.exists() {
        println!("# Source: {}", path.display());
    } else {
        println!("# Source: defaults (no config file)");
    }
}

fn handle_config_reset() {
    let path = Config::config_path();
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("Error creating directory: {e}");
            std::process::exit(1);
        }
    }
    let template = serde_json::to_string_pretty(&Config::default_template())
        .expect("template serializes");
    if let Err(e) = std::fs::write(&path, template) {
        eprintln!("Error writing config: {e}");
        std::process::exit(1);
    }
    println!("Config reset to defaults: {}", path.display());
}
