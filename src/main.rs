use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "taskify")]
#[command(version, about = "Project and task management server with realtime chat")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to a taskify.toml. Defaults to ./taskify.toml when present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP and WebSocket server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (permissive CORS, built-in JWT secrets)
        #[arg(long)]
        dev: bool,
    },
    /// Create or migrate the database, then exit
    InitDb {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Print the effective configuration with secrets redacted
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; the process environment still applies.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { port, db_path, dev } => {
            cmd::cmd_serve(cli.config.as_deref(), cli.verbose, port, db_path, dev).await?;
        }
        Commands::InitDb { db_path } => cmd::cmd_init_db(cli.config.as_deref(), db_path)?,
        Commands::Config => cmd::cmd_config(cli.config.as_deref())?,
    }

    Ok(())
}
