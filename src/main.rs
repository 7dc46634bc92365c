use anyhow::Result;
use clap::{CommandFactory, Parser};
use coravoice::app::{list_voices, run_chat};
use coravoice::cli::{ChatArgs, Cli, Commands, ConfigAction};
use coravoice::config::Config;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.quiet, cli.verbose);
    tracing::debug!(version = %coravoice::version_string(), "coravoice starting");

    match cli
        .command
        .unwrap_or_else(|| Commands::Chat(ChatArgs::default()))
    {
        Commands::Chat(args) => {
            let config = load_config(cli.config.as_deref())?;
            run_chat(config, args).await?;
        }
        Commands::Voices { gender, quality } => {
            let config = load_config(cli.config.as_deref())?;
            list_voices(
                &config.voice.locale,
                gender,
                quality.unwrap_or(config.voice.quality),
            );
        }
        Commands::Config { action } => {
            handle_config_command(action, cli.config.as_deref())?;
        }
        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "coravoice", &mut std::io::stdout());
        }
    }

    Ok(())
}

/// Log to stderr so the chat transcript on stdout stays readable.
///
/// `RUST_LOG` wins over the `-q`/`-v` flags.
fn init_logging(quiet: bool, verbose: u8) {
    let level = match (quiet, verbose) {
        (true, _) => "warn",
        (false, 0) => "info",
        (false, 1) => "debug",
        (false, _) => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("coravoice={}", level)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/coravoice/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&std::path::Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        Config::load(path)?
    } else {
        Config::load_or_default(&Config::default_path())?
    };

    Ok(config.with_env_overrides())
}

/// Handle configuration commands.
fn handle_config_command(
    action: ConfigAction,
    custom_path: Option<&std::path::Path>,
) -> Result<()> {
    let config_path = custom_path
        .map(std::path::PathBuf::from)
        .unwrap_or_else(Config::default_path);

    match action {
        ConfigAction::Get { key } => {
            let config = Config::load_or_default(&config_path)?.with_env_overrides();
            println!("{}", config.get_value_by_path(&key)?);
        }
        ConfigAction::Set { key, value } => {
            Config::set_value_by_path(&config_path, &key, &value)?;
            println!("Set {} = {}", key, value);
        }
        ConfigAction::List => {
            let config = Config::load_or_default(&config_path)?.with_env_overrides();
            print!("{}", config.to_display_toml()?);
        }
        ConfigAction::Dump => {
            print!("{}", Config::default().to_display_toml()?);
        }
        ConfigAction::Path => {
            println!("{}", config_path.display());
        }
    }
    Ok(())
}
