use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use resync::config::Config;
use resync::connectivity::{ConnectivityProbe, HttpProbe};
use resync::remote::HttpRemote;
use resync::sync::{OperationStatus, SyncOperation, SyncQueue};
use resync::{ConnectivityMonitor, OperationState, Outcome, ReplayEngine, SqliteStorage};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "resync")]
#[command(about = "Inspect and replay the offline change queue of a local store")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/resync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show connectivity and queue state
  Status,
  /// Replay queued changes now
  Drain,
  /// List changes that need manual resolution
  Failed,
  /// Give a failed change a fresh retry budget
  Retry { id: String },
  /// Drop a queued change without replaying it
  Discard { id: String },
  /// Replay whenever connectivity returns, until interrupted
  Watch,
}

type Engine = ReplayEngine<SqliteStorage, HttpRemote>;

struct Context {
  config: Config,
  queue: Arc<SyncQueue<SqliteStorage>>,
  engine: Engine,
}

impl Context {
  async fn open(config: Config) -> Result<Self> {
    let store = match &config.store.path {
      Some(path) => SqliteStorage::open_at(path)?,
      None => SqliteStorage::open()?,
    };
    let store = Arc::new(store);
    let queue = Arc::new(SyncQueue::open(Arc::clone(&store)).await?);
    let remote = Arc::new(HttpRemote::new(&config.remote.url, Config::get_api_token())?);
    let engine = ReplayEngine::new(
      Arc::clone(&queue),
      store,
      remote,
      config.replay_config(),
    );
    Ok(Self {
      config,
      queue,
      engine,
    })
  }

  fn probe(&self) -> Result<HttpProbe> {
    Ok(HttpProbe::new(
      self.config.probe_url(),
      self.config.remote.probe_timeout,
    )?)
  }
}

fn print_operation(op: &SyncOperation) {
  println!(
    "{}  {:<8} {:<7} {:<12} retries={} status={}",
    op.id,
    op.entity_type,
    op.kind.as_str(),
    op.target_id,
    op.retry_count,
    op.status.as_str()
  );
  if let Some(err) = &op.last_error {
    println!("    last error: {}", err);
  }
}

async fn status(ctx: &Context) -> Result<()> {
  let online = ctx.probe()?.probe().await;
  println!("remote:  {} ({})", ctx.config.remote.url, if online { "online" } else { "offline" });

  let ops = ctx.queue.operations().await;
  let failed = ops.iter().filter(|op| op.status == OperationStatus::Failed).count();
  println!("queued:  {} ({} failed)", ops.len(), failed);
  for entity_type in ctx.queue.entity_types().await {
    println!("  {}: {}", entity_type, ctx.queue.lane(&entity_type).await.len());
  }
  if let Some(due) = ctx.queue.next_due().await {
    println!("next retry: {}", due.to_rfc3339());
  }
  Ok(())
}

async fn drain(ctx: &Context) -> Result<()> {
  if !ctx.probe()?.probe().await {
    return Err(eyre!("Remote {} is unreachable", ctx.config.probe_url()));
  }

  match ctx.engine.sync().await {
    Outcome::Success(result) => {
      println!(
        "applied {}, rescheduled {}, deferred {}",
        result.applied, result.rescheduled, result.deferred
      );
      for (temp, server) in &result.remapped {
        println!("  {} -> {}", temp, server);
      }
      Ok(())
    }
    Outcome::Failed(err) => {
      for op in ctx.engine.failed().await {
        print_operation(&op);
      }
      Err(eyre!("{}", err))
    }
    Outcome::Cancelled => Err(eyre!("Drain cancelled")),
  }
}

async fn watch(ctx: &Context) -> Result<()> {
  let probe = Arc::new(ctx.probe()?);
  let monitor =
    ConnectivityMonitor::start(probe.as_ref(), ctx.config.connectivity.debounce).await;
  let cancel = CancellationToken::new();

  let polling = monitor.spawn_polling(
    Arc::clone(&probe),
    ctx.config.connectivity.poll_interval,
    cancel.clone(),
  );
  let replay = ctx.engine.spawn_replay_on_reconnect(&monitor);

  let mut states = ctx.engine.status().subscribe();
  let printer = tokio::spawn(async move {
    while let Ok(state) = states.recv().await {
      match state {
        OperationState::Success(result) if result.applied > 0 => {
          println!("synced {} change(s)", result.applied);
        }
        OperationState::Error(err) => println!("sync failed: {}", err),
        _ => {}
      }
    }
  });

  println!(
    "watching {} ({}), press Ctrl-C to stop",
    ctx.config.remote.url,
    if monitor.is_online() { "online" } else { "offline" }
  );
  tokio::signal::ctrl_c().await?;

  cancel.cancel();
  ctx.engine.dispose();
  printer.abort();
  let _ = tokio::join!(polling, replay);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = resync::logging::init(&config.log, args.verbose)?;

  let ctx = Context::open(config).await?;

  match args.command {
    Command::Status => status(&ctx).await?,
    Command::Drain => drain(&ctx).await?,
    Command::Failed => {
      let failed = ctx.engine.failed().await;
      if failed.is_empty() {
        println!("no failed changes");
      }
      for op in &failed {
        print_operation(op);
      }
    }
    Command::Retry { id } => {
      ctx.engine.retry_failed(&id).await?;
      println!("{} will be retried on the next drain", id);
    }
    Command::Discard { id } => {
      let op = ctx.engine.discard(&id).await?;
      println!("discarded {} {} {}", op.kind.as_str(), op.entity_type, op.target_id);
    }
    Command::Watch => watch(&ctx).await?,
  }

  Ok(())
}
