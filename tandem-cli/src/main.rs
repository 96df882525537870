//! Tandem CLI: watch entity presence and workflow rooms from a terminal.
//!
//! Binds one session against the collaboration server, prints every change
//! it observes, and unbinds cleanly on Ctrl-C. Server settings come from
//! `TANDEM_*` environment variables, overridable per flag.

use clap::{Parser, Subcommand};
use tandem_collab::ClientConfig;

mod commands;

#[derive(Parser)]
#[command(name = "tandem")]
#[command(version)]
#[command(about = "Presence, field locks and workflow co-editing client", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Server base URL (overrides TANDEM_SERVER_URL)
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch who is viewing an entity
    Presence {
        /// Entity type, e.g. Order
        #[arg(long)]
        entity: String,

        /// Entity id
        #[arg(long)]
        id: String,

        #[arg(long)]
        tenant: String,

        #[arg(long)]
        user: String,

        /// Take this field lock once subscribed, release it on exit
        #[arg(long)]
        lock: Option<String>,
    },

    /// Join a workflow room and print graph edits
    Workflow {
        /// Workflow entity name
        #[arg(long)]
        entity: String,

        #[arg(long)]
        user: String,

        /// Display name (defaults to the user id)
        #[arg(long)]
        name: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let mut config = ClientConfig::from_env();
    if let Some(server) = cli.server {
        config.server_url = server;
    }

    let result = match cli.command {
        Commands::Presence {
            entity,
            id,
            tenant,
            user,
            lock,
        } => commands::presence(&config, &entity, &id, &tenant, &user, lock.as_deref()).await,
        Commands::Workflow { entity, user, name } => {
            let name = name.unwrap_or_else(|| user.clone());
            commands::workflow(&config, &entity, &user, &name).await
        }
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}
