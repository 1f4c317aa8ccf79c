use clap::{
    Parser,
    Subcommand,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use raffle_sync::{
    SyncConfig,
    config::{
        FACTORY_ADDRESS_VAR,
        INDEXER_URL_VAR,
        LEDGER_RPC_URL_VAR,
    },
    dashboard::ClaimablesView,
    entity::{
        Address,
        AssetKind,
        RaffleEntity,
    },
    fallback::IndexerThenLedger,
    indexer_client::IndexerClient,
    ledger::{
        EntityReadGateway,
        enumeration::LedgerRaffleSource,
        json_rpc::JsonRpcLedger,
    },
    polling_store::{
        PollingStore,
        StoreSnapshot,
        Visibility,
    },
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::sync::mpsc;
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling,
};
use tracing_subscriber::{
    EnvFilter,
    fmt,
};

#[derive(Parser, Debug)]
#[command(version, about = "Watch raffles and claimable balances from the terminal")]
struct Args {
    #[arg(long, env = INDEXER_URL_VAR)]
    subgraph_url: Option<String>,

    #[arg(long, env = LEDGER_RPC_URL_VAR)]
    ledger_rpc_url: Option<String>,

    /// Factory contract used to enumerate raffles when the indexer is down
    #[arg(long, env = FACTORY_ADDRESS_VAR)]
    factory: Option<String>,

    #[arg(long)]
    row_limit: Option<usize>,

    /// Log to stderr instead of ./logs/raffle-watch.log
    #[arg(long, default_value = "false")]
    log_stderr: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Poll the raffle list and print a line whenever it changes
    Watch {
        #[arg(long, default_value_t = 30_000)]
        interval_ms: u64,
        /// Poll at the hidden-tab pace
        #[arg(long)]
        background: bool,
    },
    /// Show what a user can still claim, refund or hatch
    Claimables { user: String },
    /// One-shot raffle listing, falling back to the ledger
    List {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
}

impl Args {
    fn sync_config(&self) -> SyncConfig {
        let mut config = SyncConfig::new();
        if let Some(url) = &self.subgraph_url {
            config = config.with_indexer_url(url);
        }
        if let Some(url) = &self.ledger_rpc_url {
            config = config.with_ledger_rpc_url(url);
        }
        if let Some(factory) = &self.factory {
            config = config.with_factory_address(factory);
        }
        if let Some(limit) = self.row_limit {
            config = config.with_row_limit(limit);
        }
        config
    }
}

fn init_logging(to_stderr: bool) -> Option<WorkerGuard> {
    if to_stderr {
        raffle_sync::init_tracing();
        return None;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let appender = rolling::daily("logs", "raffle-watch.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let _ = fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    Some(guard)
}

async fn handle_interrupt() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received interrupt, exiting"),
        Err(_) => tracing::warn!("Received interrupt error, exiting anyway"),
    }
}

fn ledger_reader(config: &SyncConfig) -> Result<Arc<JsonRpcLedger>> {
    let ledger = JsonRpcLedger::from_config(config).wrap_err("configuring ledger RPC")?;
    tracing::info!(url = %ledger.url(), "using ledger RPC");
    Ok(Arc::new(ledger))
}

fn describe(snapshot: &StoreSnapshot) -> String {
    let count = snapshot
        .items
        .as_ref()
        .map(|items| items.len().to_string())
        .unwrap_or_else(|| "-".to_string());
    let updated = snapshot
        .last_updated
        .map(|at| at.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    let mut line = format!("raffles={count} updated={updated}");
    if snapshot.is_loading {
        line.push_str(" loading");
    }
    if let Some(note) = &snapshot.note {
        line.push_str(&format!(" ({note})"));
    }
    line
}

async fn watch(config: SyncConfig, interval: Duration, background: bool) -> Result<()> {
    let client = IndexerClient::from_config(&config).wrap_err("configuring indexer")?;
    let row_limit = config.row_limit()?;
    tracing::info!(%client, row_limit, "watching raffles");
    let store = PollingStore::new(client, row_limit);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _listener = store.on_change(move |snapshot| {
        let _ = tx.send(describe(snapshot));
    });
    if background {
        store.set_visibility(Visibility::Hidden);
    }
    let _subscription = store.subscribe("raffle-watch", interval);
    println!("polling every {:?}", store.effective_interval());

    let interrupt = handle_interrupt();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            line = rx.recv() => match line {
                Some(line) => println!("{line}"),
                None => break,
            },
            _ = &mut interrupt => break,
        }
    }
    Ok(())
}

async fn claimables(config: SyncConfig, user: &str) -> Result<()> {
    let user = Address::new(user);
    if !user.is_valid() {
        return Err(eyre!("`{user}` is not a ledger address"));
    }
    let client = IndexerClient::from_config(&config).wrap_err("configuring indexer")?;
    let gateway = EntityReadGateway::new(ledger_reader(&config)?);
    let mut view = ClaimablesView::new(client, gateway, config.row_limit()?);
    if let Some(factory) = config.factory_address()? {
        view = view.with_ledger_enumeration(factory);
    }

    let state = view.refetch(&user).await?;
    if let Some(note) = &state.note {
        println!("note: {note}");
    }
    println!("source: {} ({} raffles)", state.mode, state.items.len());
    let now = chrono::Utc::now().timestamp();
    for entry in &state.items {
        println!(
            "{} {:<24} {} USDC={} native={} actions={:?}",
            entry.entity.id,
            entry.entity.name,
            entry.entity.status,
            entry.amount(AssetKind::Usdc),
            entry.amount(AssetKind::Native),
            entry.available_actions(now),
        );
        for error in &entry.read_errors {
            println!("    read error: {error}");
        }
    }
    Ok(())
}

async fn list(config: SyncConfig, limit: usize) -> Result<()> {
    let client = IndexerClient::from_config(&config).wrap_err("configuring indexer")?;
    let factory = config
        .factory_address()?
        .ok_or_else(|| eyre!("{FACTORY_ADDRESS_VAR} is required for the ledger fallback"))?;
    let ledger = LedgerRaffleSource::new(
        EntityReadGateway::new(ledger_reader(&config)?),
        factory,
    );
    tracing::info!(factory = %ledger.factory(), limit, "listing raffles");

    let loaded = IndexerThenLedger::new(client, ledger).load(limit).await?;
    println!("source: {} ({} raffles)", loaded.source, loaded.items.len());
    let now = chrono::Utc::now().timestamp();
    for raffle in &loaded.items {
        println!(
            "{} {:<24} {} sold={} left={} pool={}{}",
            raffle.id,
            raffle.name,
            raffle.status,
            raffle.tickets_sold,
            raffle
                .tickets_remaining()
                .map_or_else(|| "unlimited".to_string(), |left| left.to_string()),
            raffle.prize_pool,
            progress_flags(raffle, now),
        );
    }
    Ok(())
}

/// Trailing markers for a listing line: whether the minimum is met and
/// whether an unsettled raffle has run past its deadline.
fn progress_flags(raffle: &RaffleEntity, now: i64) -> String {
    let mut flags = String::new();
    if !raffle.minimum_reached() {
        flags.push_str(" below-minimum");
    }
    if !raffle.status.is_terminal() && raffle.is_expired(now) {
        flags.push_str(" past-deadline");
    }
    flags
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let _log_guard = init_logging(args.log_stderr);
    tracing::info!("starting raffle-watch");
    let config = args.sync_config();

    match args.command {
        Command::Watch {
            interval_ms,
            background,
        } => watch(config, Duration::from_millis(interval_ms), background).await,
        Command::Claimables { user } => claimables(config, &user).await,
        Command::List { limit } => list(config, limit).await,
    }
}
