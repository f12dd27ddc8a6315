use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use entity_audit::cli::{handle_demo_command, handle_show_command};
use entity_audit::config::AuditSettings;
use entity_audit::logging::{init_logging, LogLevel};

#[derive(Parser)]
#[command(
    name = "entity-audit",
    version,
    about = "Transactional audit capture for entity changes",
    long_about = "entity-audit records create, update and delete operations made \
                  through a unit of work and delivers them to an audit sink, either \
                  immediately or just before the enclosing transaction commits."
)]
struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(long, global = true, env = "ENTITY_AUDIT_LOG_LEVEL", default_value = "warn")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print records from a JSON-lines audit log
    Show {
        /// Path to the audit log
        log: PathBuf,

        /// Only show the most recent N records
        #[arg(short = 'n', long)]
        count: Option<usize>,

        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Run the invoice scenarios against an in-memory store
    Demo {
        /// Audit log to append delivered records to
        #[arg(long)]
        log: PathBuf,

        /// Open a transaction during save when none is active
        #[arg(long, env = "ENTITY_AUDIT_AUTO_OPEN")]
        auto_open: bool,

        /// Settings file (JSON)
        #[arg(long)]
        settings: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level)?;

    match cli.command {
        Commands::Show { log, count, json } => {
            handle_show_command(&log, count, json)?;
        }
        Commands::Demo {
            log,
            auto_open,
            settings,
        } => {
            let mut audit_settings = match settings {
                Some(path) => AuditSettings::load_or_default(&path)
                    .with_context(|| format!("Failed to load settings from {}", path.display()))?,
                None => AuditSettings::default(),
            };
            if auto_open {
                audit_settings.auto_open_transaction = true;
            }

            let summary = handle_demo_command(&log, &audit_settings).await?;

            for (scenario, written) in &summary.scenarios {
                println!("{:<32} {} record(s)", scenario, written);
            }
            println!();
            println!(
                "Wrote {} audit record(s) to {} (auto-open: {})",
                summary.total(),
                log.display(),
                audit_settings.auto_open_transaction
            );
        }
    }

    Ok(())
}
