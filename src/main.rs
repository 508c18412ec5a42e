//! Command-line entry point: cloud-facing operations only. Joining and
//! driving a live mesh needs a concrete BLE stack (scan, connect, GATT
//! read/write/notify) that this crate takes as a caller-supplied
//! `PlejdGatt`; packaging one is outside this crate's scope, so the only
//! subcommands wired up here are the ones `HttpRosterFetcher` can already
//! serve on its own.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use plejd_mesh::{CloudError, HttpRosterFetcher, PlejdError, RosterFetcher};

#[derive(Parser)]
#[command(name = "plejd", about = "Plejd BLE mesh cloud utilities", version)]
struct Cli {
    /// Plejd account email.
    #[arg(long, env = "PLEJD_USERNAME")]
    username: String,

    /// Plejd account password.
    #[arg(long, env = "PLEJD_PASSWORD")]
    password: String,

    /// Enable debug logging.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List every site the account has access to.
    ListSites,
    /// Check that the given credentials are accepted by the cloud.
    VerifyCredentials,
    /// Fetch and print one site's roster as JSON.
    Site {
        /// Plejd site id, as returned by `list-sites`.
        site_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), PlejdError> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let fetcher = HttpRosterFetcher::new()?;

    match cli.command {
        Command::ListSites => {
            let sites = fetcher.list_sites(&cli.username, &cli.password).await?;
            for site in sites {
                println!("{}\t{}", site.site_id, site.title);
            }
        }
        Command::VerifyCredentials => {
            fetcher.verify_credentials(&cli.username, &cli.password).await?;
            println!("credentials accepted");
        }
        Command::Site { site_id } => {
            let raw = fetcher
                .raw_site(&cli.username, &cli.password, &site_id)
                .await?;
            println!("{}", serde_json::to_string_pretty(&raw).map_err(|e| {
                PlejdError::Cloud(CloudError::InvalidResponse(e.to_string()))
            })?);
        }
    }

    Ok(())
}
