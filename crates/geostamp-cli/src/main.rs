//! Geostamp CLI entry point.

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use geostamp::{JsonLinesSink, ProofDraft, ProofSink};
use geostamp_cli::{
    load_config, load_scenario, repl, resolve_cache_path, resolve_config_path, App, AppOptions,
    CliError,
};

#[derive(Parser)]
#[command(
    name = "geostamp",
    about = "Courier location capture: cache-first geostamps and proof of delivery",
    version
)]
struct Cli {
    /// Path to the geostamp cache store.
    #[arg(long, global = true)]
    cache: Option<String>,

    /// Path to an acquisition config JSON file.
    #[arg(long, global = true)]
    config: Option<String>,

    /// Device scenario JSON driving the simulated location provider.
    #[arg(long, global = true)]
    scenario: Option<String>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture a geostamp and print it as JSON.
    Capture {
        /// Skip the cache.
        #[arg(long)]
        force: bool,
    },

    /// Run one capture against a scenario and report provider counters.
    Simulate {
        /// Skip the cache.
        #[arg(long)]
        force: bool,
    },

    /// Build a proof of delivery for an order.
    Proof {
        /// Order identifier.
        #[arg(long)]
        order: String,

        /// Photo or document to attach.
        #[arg(long)]
        attach: Option<String>,

        /// Name of the person who received the parcel.
        #[arg(long)]
        recipient: Option<String>,

        /// Free-form courier notes.
        #[arg(long)]
        notes: Option<String>,

        /// Refresh the location instead of using the cache.
        #[arg(long)]
        force: bool,

        /// Append the proof to this JSON-lines file instead of printing it.
        #[arg(long)]
        out: Option<String>,
    },

    /// Inspect or purge the cached geostamp.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Print the effective acquisition config as JSON.
    Config,

    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   geostamp completions bash > ~/.local/share/bash-completion/completions/geostamp
    ///   geostamp completions zsh > ~/.zfunc/_geostamp
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: Shell,
    },

    /// Launch interactive REPL mode.
    Repl,
}

#[derive(Subcommand)]
enum CacheAction {
    /// Print the cached entry, fresh or not.
    Show,
    /// Delete the cached entry.
    Purge,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e}");
        let code = e
            .downcast_ref::<CliError>()
            .map(CliError::exit_code)
            .unwrap_or(1);
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let Cli {
        cache,
        config,
        scenario,
        command,
        ..
    } = cli;
    let has_scenario = scenario.is_some();
    let open = || -> anyhow::Result<App> {
        let config = load_config(&resolve_config_path(config.as_deref()))?;
        let scenario = scenario.as_deref().map(load_scenario).transpose()?;
        Ok(App::open(AppOptions {
            cache_path: resolve_cache_path(cache.as_deref()),
            config,
            scenario,
        })?)
    };

    match command {
        Commands::Capture { force } => {
            let app = open()?;
            let report = app.capture(force).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.ok {
                std::process::exit(4);
            }
        }

        Commands::Simulate { force } => {
            if !has_scenario {
                return Err(CliError::Usage("simulate requires --scenario FILE".to_string()).into());
            }
            let report = open()?.capture(force).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Proof {
            order,
            attach,
            recipient,
            notes,
            force,
            out,
        } => {
            let proof = open()?
                .proof(ProofDraft {
                    order_id: order,
                    recipient_name: recipient,
                    notes,
                    attachment: attach.map(Into::into),
                    force_location: force,
                })
                .await?;
            match out {
                Some(path) => {
                    JsonLinesSink::new(&path).submit(&proof)?;
                    println!("{}", proof.id);
                }
                None => println!("{}", serde_json::to_string_pretty(&proof)?),
            }
        }

        Commands::Cache { action } => {
            let app = open()?;
            match action {
                CacheAction::Show => {
                    let cache = app.cache();
                    let entry = app.cached();
                    let fresh = entry
                        .map(|e| e.is_fresh(chrono::Utc::now(), cache.ttl()))
                        .unwrap_or(false);
                    let info = serde_json::json!({
                        "path": app.cache_path().display().to_string(),
                        "key": cache.key(),
                        "ttl_secs": cache.ttl().as_secs(),
                        "entry": entry,
                        "fresh": fresh,
                    });
                    println!("{}", serde_json::to_string_pretty(&info)?);
                }
                CacheAction::Purge => {
                    app.purge_cache()?;
                    println!("Purged {}", app.cache_path().display());
                }
            }
        }

        Commands::Config => {
            let app = open()?;
            println!("{}", serde_json::to_string_pretty(app.controller().config())?);
        }

        Commands::Repl => {
            repl::run(&open()?)?;
        }

        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "geostamp", &mut std::io::stdout());
        }
    }

    Ok(())
}
