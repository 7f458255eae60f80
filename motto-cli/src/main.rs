//! `motto` command-line front end
//!
//! Validates configurations, dry-runs sequences against a scripted
//! transport, migrates legacy flat documents, and prints canonical
//! form. Wiring a real serial transport is the host application's job;
//! the CLI always drives the in-process scripted transport.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use motto_config::MottoSettings;
use motto_engine::{
    legacy, Orchestrator, Scalar, ScriptedTransport, SequenceStatus, SysClock, Transport,
};

#[derive(Parser)]
#[command(name = "motto", version, about = "MOTTO orchestration core CLI")]
struct Cli {
    /// Settings file (defaults to ./motto.toml, then MOTTO_* env)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a configuration, reporting every defect
    Validate {
        /// Configuration file
        config: PathBuf,
        /// Escalate unknown-key warnings to errors
        #[arg(long)]
        strict: bool,
    },
    /// Dry-run a sequence against the scripted transport
    Run {
        /// Configuration file
        config: PathBuf,
        /// Sequence id to execute
        sequence: String,
        /// Call-site variables as key=value (repeatable)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,
        /// Profile to activate
        #[arg(long)]
        profile: Option<String>,
    },
    /// Transform a legacy flat button/sequence document into v1.1 TOML
    Migrate {
        /// Legacy configuration file
        legacy: PathBuf,
        /// Output path; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Print the canonical serialized form of a configuration
    Canonical {
        /// Configuration file
        config: PathBuf,
    },
}

fn load_settings(path: Option<&PathBuf>) -> anyhow::Result<MottoSettings> {
    match path {
        Some(path) => {
            let mut settings = motto_config::load_from_path(path)
                .with_context(|| format!("loading settings from {}", path.display()))?;
            motto_config::apply_env_overrides(&mut settings)?;
            motto_config::validate_settings(&settings)?;
            Ok(settings)
        }
        None => Ok(motto_config::load_settings()?),
    }
}

fn parse_vars(pairs: &[String]) -> anyhow::Result<BTreeMap<String, Scalar>> {
    let mut vars = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("--var expects KEY=VALUE, got '{}'", pair);
        };
        let scalar = match value {
            "true" => Scalar::Bool(true),
            "false" => Scalar::Bool(false),
            other => other
                .parse::<f64>()
                .map(Scalar::Num)
                .unwrap_or_else(|_| Scalar::Str(other.to_string())),
        };
        vars.insert(key.to_string(), scalar);
    }
    Ok(vars)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let settings = load_settings(cli.settings.as_ref())?;

    // The sequence pool: worker count from settings, one per core when 0.
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if settings.engine.sequence_pool_size > 0 {
        builder.worker_threads(settings.engine.sequence_pool_size);
    }
    let runtime = builder.enable_all().build()?;
    runtime.block_on(run(cli, settings))
}

async fn run(cli: Cli, settings: MottoSettings) -> anyhow::Result<()> {
    match cli.command {
        Commands::Validate { config, strict } => {
            let bytes = std::fs::read(&config)
                .with_context(|| format!("reading {}", config.display()))?;
            let strict = strict || settings.loader.strict;
            match motto_engine::parser::load(&bytes, strict) {
                Err(errors) => {
                    for error in &errors {
                        eprintln!("error: {}", error);
                    }
                    bail!("{} defect(s) found", errors.len());
                }
                Ok(loaded) => {
                    for warning in &loaded.warnings {
                        eprintln!("warning: {}", warning);
                    }
                    match motto_engine::Program::compile(loaded.config) {
                        Err(errors) => {
                            for error in &errors {
                                eprintln!("error: {}", error);
                            }
                            bail!("{} defect(s) found", errors.len());
                        }
                        Ok(program) => {
                            println!(
                                "ok: {} command(s), {} sequence(s), {} handler(s)",
                                program.config.commands.len(),
                                program.config.sequences.len(),
                                program.config.handlers.len(),
                            );
                        }
                    }
                }
            }
        }
        Commands::Run {
            config,
            sequence,
            vars,
            profile,
        } => {
            let bytes = std::fs::read(&config)
                .with_context(|| format!("reading {}", config.display()))?;
            let vars = parse_vars(&vars)?;

            let transport = Arc::new(ScriptedTransport::new());
            let orchestrator = Orchestrator::new(
                settings,
                Arc::clone(&transport) as Arc<dyn Transport>,
                Arc::new(SysClock),
            );
            if let Err(errors) = orchestrator.load(&bytes) {
                for error in &errors {
                    eprintln!("error: {}", error);
                }
                bail!("configuration rejected");
            }

            let result = orchestrator
                .execute(&sequence, vars, profile.as_deref())
                .await
                .map_err(|e| anyhow::anyhow!("{}", e))?;

            println!("{}", serde_json::to_string_pretty(&result)?);
            for line in transport.sent_lines() {
                tracing::info!(line = %line, "sent");
            }
            orchestrator.shutdown();

            if result.status != SequenceStatus::Ok {
                bail!("sequence finished with status {:?}", result.status);
            }
        }
        Commands::Migrate { legacy, output } => {
            let bytes = std::fs::read(&legacy)
                .with_context(|| format!("reading {}", legacy.display()))?;
            match legacy::migrate(&bytes) {
                Err(errors) => {
                    for error in &errors {
                        eprintln!("error: {}", error);
                    }
                    bail!("legacy document rejected");
                }
                Ok(canonical) => match output {
                    Some(path) => {
                        std::fs::write(&path, canonical)
                            .with_context(|| format!("writing {}", path.display()))?;
                        println!("wrote {}", path.display());
                    }
                    None => print!("{}", canonical),
                },
            }
        }
        Commands::Canonical { config } => {
            let bytes = std::fs::read(&config)
                .with_context(|| format!("reading {}", config.display()))?;
            let loaded = match motto_engine::parser::load(&bytes, settings.loader.strict) {
                Err(errors) => {
                    for error in &errors {
                        eprintln!("error: {}", error);
                    }
                    bail!("configuration rejected");
                }
                Ok(loaded) => loaded,
            };
            print!("{}", motto_engine::parser::canonical(&loaded.config)?);
        }
    }

    Ok(())
}
