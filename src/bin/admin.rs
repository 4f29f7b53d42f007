//! courier-flow-admin: operator commands against the PostgreSQL store

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use uuid::Uuid;

use courier_flow::auth::JwtValidator;
use courier_flow::domain::{
    ActorRole, B2bShipmentId, DriverId, SessionContext, ShipmentId, ShipmentStatus, VolumeId,
    VolumeStatus,
};
use courier_flow::infra::{LocalObjectStorage, NoopNotifier, PgStore};
use courier_flow::metrics::MetricsRegistry;
use courier_flow::server::AppState;

/// courier-flow administration
#[derive(Parser, Debug)]
#[command(name = "courier-flow-admin")]
#[command(about = "Operator commands for the courier-flow shipment store")]
struct Args {
    /// PostgreSQL connection URL
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run database migrations
    Migrate,

    /// Print a shipment with its history and occurrences
    Shipment { id: Uuid },

    /// Print a B2B shipment with its volumes, history and occurrences
    B2b { id: Uuid },

    /// Move a shipment along the transition table as an admin
    Advance {
        id: Uuid,
        /// Target status, e.g. IN_TRANSIT
        status: String,
    },

    /// Move one B2B volume along the volume table as an admin
    AdvanceVolume {
        id: Uuid,
        /// Target status, e.g. EXPEDIDO
        status: String,
    },

    /// Assign a driver to a shipment awaiting pickup
    Dispatch {
        id: Uuid,
        #[arg(long)]
        driver: Uuid,
    },

    /// Issue a bearer token for a session
    IssueToken {
        #[arg(long, env = "JWT_SECRET", hide_env_values = true)]
        secret: String,
        #[arg(long)]
        actor_id: Uuid,
        /// driver, admin, customer, b2b_client or anonymous
        #[arg(long)]
        role: String,
        #[arg(long, default_value_t = 12)]
        hours: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let args = Args::parse();
    let admin = SessionContext::admin(Uuid::nil());

    match args.command {
        Command::IssueToken {
            secret,
            actor_id,
            role,
            hours,
        } => {
            let role =
                ActorRole::parse(&role).with_context(|| format!("unknown role {role:?}"))?;
            let validator = JwtValidator::new(
                secret.as_bytes(),
                JwtValidator::DEFAULT_ISSUER,
                JwtValidator::DEFAULT_AUDIENCE,
            );
            let token = validator.issue(
                &SessionContext::new(actor_id, role),
                chrono::Duration::hours(hours),
            )?;
            println!("{token}");
        }
        Command::Migrate => {
            let store = connect(args.database_url.as_deref()).await?;
            courier_flow::migrations::run_postgres(store.pool()).await?;
            println!("migrations applied");
        }
        command => {
            let store = connect(args.database_url.as_deref()).await?;
            let state = workflows(store);
            match command {
                Command::Shipment { id } => {
                    let id = ShipmentId(id);
                    print_json(&serde_json::json!({
                        "shipment": state.shipments.get_shipment(id).await?,
                        "history": state.shipments.history(id).await?,
                        "occurrences": state.shipments.occurrences(id).await?,
                    }))?;
                }
                Command::B2b { id } => {
                    let id = B2bShipmentId(id);
                    print_json(&serde_json::json!({
                        "shipment": state.b2b.view(id).await?,
                        "history": state.b2b.history(id).await?,
                        "occurrences": state.b2b.occurrences(id).await?,
                    }))?;
                }
                Command::Advance { id, status } => {
                    let target = ShipmentStatus::parse(&status.to_ascii_uppercase())
                        .with_context(|| format!("unknown shipment status {status:?}"))?;
                    let shipment = state
                        .shipments
                        .advance_status(&admin, ShipmentId(id), target)
                        .await?;
                    print_json(&shipment)?;
                }
                Command::AdvanceVolume { id, status } => {
                    let target = VolumeStatus::parse(&status.to_ascii_uppercase())
                        .with_context(|| format!("unknown volume status {status:?}"))?;
                    let volume = state
                        .b2b
                        .advance_volume(&admin, VolumeId(id), target)
                        .await?;
                    print_json(&volume)?;
                }
                Command::Dispatch { id, driver } => {
                    let shipment = state
                        .shipments
                        .accept_pickup(&admin, ShipmentId(id), Some(DriverId(driver)))
                        .await?;
                    print_json(&shipment)?;
                }
                Command::Migrate | Command::IssueToken { .. } => {}
            }
        }
    }

    Ok(())
}

async fn connect(database_url: Option<&str>) -> anyhow::Result<PgStore> {
    let url = database_url.context("DATABASE_URL is required (or pass --database-url)")?;
    Ok(PgStore::connect(url, 2).await?)
}

/// Workflows over the store. Notifications are not sent from the CLI.
fn workflows(store: PgStore) -> AppState {
    let evidence_dir = std::env::var("EVIDENCE_DIR").unwrap_or_else(|_| "./evidence".to_string());
    let public_url = std::env::var("EVIDENCE_PUBLIC_URL")
        .unwrap_or_else(|_| "http://localhost:8080/evidence".to_string());
    AppState::new(
        Arc::new(store),
        Arc::new(LocalObjectStorage::new(evidence_dir, public_url)),
        Arc::new(NoopNotifier),
        Arc::new(MetricsRegistry::new()),
    )
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
