//! CLI entry point for relay chat.
//!
//! This binary runs either the bootstrap name server or a chat peer, and
//! provides key and configuration management commands.

use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};
use relay_chat::{
    app::run_name_server,
    crypto::{KeyStore, UserProfile},
    utils::{split_host_port, ChatConfig, DEFAULT_CONFIG_FILE},
    App,
};
use std::path::PathBuf;

/// Relay Chat - peer-to-peer chat with an elected relay server
#[derive(Parser)]
#[command(name = "relay-chat")]
#[command(about = "Peer-to-peer chat with name-server bootstrap and chat-server election")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory for the profile and address books
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bootstrap name server
    NameServer {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run a chat peer; type `@name message` to send
    Peer {
        /// Name published in address books
        #[arg(short, long)]
        name: Option<String>,
        /// Client listener port
        #[arg(short, long)]
        port: Option<u16>,
        /// Port to serve on if elected chat server
        #[arg(long)]
        chat_server_port: Option<u16>,
        /// Name server address (HOST:PORT)
        #[arg(long, value_name = "HOST:PORT")]
        name_server: Option<String>,
    },
    /// Generate and show encryption keys
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate a new profile with a fresh key pair
    Generate {
        /// Profile name
        #[arg(short, long)]
        name: String,
        /// Force overwrite existing keys
        #[arg(short, long)]
        force: bool,
    },
    /// Display the current public key
    Show,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show {
        /// Show only specific section
        #[arg(short, long)]
        section: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = ChatConfig::load(cli.config.as_deref())?;

    // Initialize logging
    setup_logging(cli.verbose, cli.quiet, &config.logging.level);

    // Override data directory if provided
    if let Some(data_dir) = cli.data_dir {
        config.set_data_dir(data_dir);
    }

    // Ensure directories exist
    config.ensure_directories()?;

    match cli.command {
        Commands::NameServer { port } => {
            if let Some(port) = port {
                config.name_server.port = port;
            }
            config.validate()?;
            info!("Starting name server on {}", config.name_server.address());
            run_name_server(config).await?;
        }
        Commands::Peer {
            name,
            port,
            chat_server_port,
            name_server,
        } => {
            if let Some(name) = name {
                config.peer.name = name;
            }
            if let Some(port) = port {
                config.peer.client_port = port;
            }
            if let Some(port) = chat_server_port {
                config.peer.chat_server_port = port;
            }
            if let Some(address) = name_server {
                let (host, port) = split_host_port(&address)
                    .ok_or_else(|| anyhow::anyhow!("Invalid name server address: {}", address))?;
                config.name_server.host = host;
                config.name_server.port = port;
            }
            config.validate()?;
            if config.peer.host == config.name_server.host
                && config.peer.chat_server_port == config.name_server.port
            {
                warn!(
                    "Chat server port {} collides with the name server; election will fail on this host",
                    config.peer.chat_server_port
                );
            }

            let app = App::new(config)?;
            app.run().await?;
        }
        Commands::Keys { action } => handle_key_commands(action, &config)?,
        Commands::Config { action } => handle_config_commands(action, &config)?,
    }

    Ok(())
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();
}

fn handle_key_commands(action: KeyCommands, config: &ChatConfig) -> Result<()> {
    let profile_path = &config.storage.profile_file;
    match action {
        KeyCommands::Generate { name, force } => {
            if profile_path.exists() && !force {
                return Err(anyhow::anyhow!(
                    "Profile already exists. Use --force to overwrite."
                ));
            }

            info!("Generating new key pair for '{}'", name);
            let profile = UserProfile::new(name);
            profile.save(profile_path)?;

            let public = profile.public_key()?;
            println!("✓ Profile created: {}", profile.username);
            println!("  Public key: n={} e={}", public.n, public.e);
            println!("  Saved to: {}", profile_path.display());
        }
        KeyCommands::Show => {
            let profile = UserProfile::load(profile_path)?;
            let public = profile.public_key()?;
            println!("User: {}", profile.username);
            if public.is_plaintext() {
                println!("Public key: none (plaintext)");
            } else {
                println!("Public key: n={} e={}", public.n, public.e);
            }
            println!("Created: {}", profile.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
        }
    }
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &ChatConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let default_config = ChatConfig::default();
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

            default_config.save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = if let Some(path) = file {
                ChatConfig::from_file(path)?
            } else {
                config.clone()
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show { section } => {
            let config_str = config.to_toml_string()?;

            match section {
                Some(section_name) => {
                    let table: toml::Table = toml::from_str(&config_str)?;
                    let section = table
                        .get(&section_name)
                        .ok_or_else(|| anyhow::anyhow!("Unknown section: {}", section_name))?;
                    println!("[{}]", section_name);
                    println!("{}", toml::to_string_pretty(section)?);
                }
                None => println!("{}", config_str),
            }
        }
    }
    Ok(())
}
