use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use sekisho::health::HealthChecker;
use sekisho::kv::{MemoryKv, RedisKv, SharedKv};
use sekisho::settings::Settings;
use sekisho::store::SqliteStore;
use sekisho::{router, GatewayState};

const ENDPOINT_RELOAD_INTERVAL_SECS: u64 = 30;
const PARTITION_WINDOW_MONTHS: u32 = 12;

fn usage() -> &'static str {
    "usage: sekisho-gateway [options]\n\
     \n\
     options:\n\
       --listen <addr:port>     listen address (default 127.0.0.1:8080)\n\
       --database <path>        sqlite database path (default sekisho.db)\n\
       --redis-url <url>        shared store URL; omit for in-process mode\n\
       --spool-dir <path>       usage record spool directory (default spool)\n\
       --log-level <level>      tracing filter (default info)\n\
     \n\
     environment: DATABASE_URL, REDIS_URL, GATEWAY_SHARED_SECRET,\n\
     RATE_LIMIT_REQUESTS_PER_MINUTE, DEFAULT_MODEL, LOG_LEVEL, ..."
}

fn parse_args(mut settings: Settings) -> Result<Settings, String> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                settings.listen = args.next().ok_or("missing value for --listen")?;
            }
            "--database" | "--sqlite" => {
                settings.database_path = args.next().ok_or("missing value for --database")?.into();
            }
            "--redis-url" => {
                settings.redis_url = Some(args.next().ok_or("missing value for --redis-url")?);
            }
            "--spool-dir" => {
                settings.spool_dir = args.next().ok_or("missing value for --spool-dir")?.into();
            }
            "--log-level" => {
                settings.log_level = args.next().ok_or("missing value for --log-level")?;
            }
            "--help" | "-h" => {
                println!("{}", usage());
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument: {other}\n\n{}", usage())),
        }
    }
    Ok(settings)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let settings = parse_args(Settings::from_env()).map_err(std::io::Error::other)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&settings.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store = SqliteStore::new(&settings.database_path);
    store.init().await?;
    store.ensure_partitions(PARTITION_WINDOW_MONTHS).await?;

    let kv: Arc<dyn SharedKv> = match settings.redis_url.as_deref() {
        Some(url) => {
            let kv = RedisKv::new(url)?;
            kv.ping().await?;
            tracing::info!("shared store: redis");
            Arc::new(kv)
        }
        None => {
            tracing::warn!("REDIS_URL not set; using in-process shared store (single replica only)");
            Arc::new(MemoryKv::new())
        }
    };

    let state = GatewayState::build(settings.clone(), store.clone(), kv);
    state.reload_endpoints().await?;

    let _health_task = HealthChecker::new(
        state.registry(),
        settings.health_check_poll_interval_secs,
        settings.health_check_batch_size,
    )
    .spawn();
    let _drain_task = state.recorder().spawn_drainer();

    // The admin tier mutates models and endpoints out of band; pick the
    // changes up on a short cadence.
    let reload_state = state.clone();
    let _reload_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(ENDPOINT_RELOAD_INTERVAL_SECS)).await;
            if let Err(err) = reload_state.reload_endpoints().await {
                tracing::warn!(error = %err, "endpoint reload failed");
            }
        }
    });

    let listener = tokio::net::TcpListener::bind(&settings.listen).await?;
    tracing::info!(listen = %settings.listen, "sekisho gateway up");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;

    Ok(())
}
