//! Irori real-time chat server.
//!
//! Run with:
//! ```not_rust
//! IRORI_JWT_SECRET=... cargo run --bin irori-server -- --seed seed.json
//! cargo run --bin irori-server -- --dev
//! ```

use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use irori_server::{
    app::{App, AppConfig, Collaborators},
    infrastructure::{
        credential::{JwtCredentialVerifier, sign_token},
        fanout::LocalFanoutBus,
        repository::{InMemoryMessageStore, InMemoryUserDirectory, Seed},
    },
    ui::{Server, ServerConfig},
    usecase::{
        AuthGateConfig, BucketConfig, RateLimitConfig, RegistryLimits, SessionConfig,
    },
};
use irori_shared::{
    logger::setup_logger,
    time::{Clock, SystemClock},
};
use tokio_util::sync::CancellationToken;

/// Secret used with `--dev` when none is configured.
const DEV_SECRET: &str = "irori-dev-secret";
/// Lifetime of the tokens printed in `--dev` mode.
const DEV_TOKEN_TTL_SECS: i64 = 24 * 60 * 60;

#[derive(Parser, Debug)]
#[command(name = "irori-server")]
#[command(about = "Real-time chat server with rooms, presence and admission limits", long_about = None)]
struct Args {
    /// Host address to bind the server to
    #[arg(short = 'H', long, env = "IRORI_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port number to bind the server to
    #[arg(short = 'p', long, env = "IRORI_PORT", default_value = "8080")]
    port: u16,

    /// HS256 secret used to verify bearer tokens
    #[arg(long, env = "IRORI_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,

    /// Development mode: demo data, a default secret and printed tokens
    #[arg(long, env = "IRORI_DEV")]
    dev: bool,

    /// JSON file with users and rooms to load
    #[arg(long, env = "IRORI_SEED")]
    seed: Option<PathBuf>,

    /// Default log level when RUST_LOG is not set
    #[arg(long, env = "IRORI_LOG_LEVEL", default_value = "info")]
    log_level: String,

    #[arg(long, env = "IRORI_MAX_CONNECTIONS_PER_USER", default_value_t = 5)]
    max_connections_per_user: usize,

    #[arg(long, env = "IRORI_MAX_CONNECTIONS_PER_ROOM", default_value_t = 100)]
    max_connections_per_room: usize,

    #[arg(long, env = "IRORI_MAX_TOTAL_CONNECTIONS", default_value_t = 1000)]
    max_total_connections: usize,

    /// Messages per second refilled into each user's bucket
    #[arg(long, env = "IRORI_MESSAGE_RATE", default_value_t = 10.0)]
    message_rate: f64,

    #[arg(long, env = "IRORI_MESSAGE_BURST", default_value_t = 20)]
    message_burst: u32,

    /// Connection attempts per second refilled into each user's bucket
    #[arg(long, env = "IRORI_CONNECT_RATE", default_value_t = 2.0)]
    connect_rate: f64,

    #[arg(long, env = "IRORI_CONNECT_BURST", default_value_t = 5)]
    connect_burst: u32,

    #[arg(long, env = "IRORI_PING_INTERVAL_SECS", default_value_t = 30)]
    ping_interval_secs: u64,

    #[arg(long, env = "IRORI_INACTIVITY_TIMEOUT_SECS", default_value_t = 300)]
    inactivity_timeout_secs: u64,

    #[arg(long, env = "IRORI_HEALTH_INTERVAL_SECS", default_value_t = 60)]
    health_interval_secs: u64,

    #[arg(long, env = "IRORI_HEALTH_FAILURE_THRESHOLD", default_value_t = 3)]
    health_failure_threshold: u32,

    #[arg(long, env = "IRORI_HEALTH_WINDOW_SECS", default_value_t = 60)]
    health_window_secs: u64,

    #[arg(long, env = "IRORI_PROBE_TIMEOUT_SECS", default_value_t = 3)]
    probe_timeout_secs: u64,

    /// Ceiling on a single frame send to a client
    #[arg(long, env = "IRORI_SEND_TIMEOUT_SECS", default_value_t = 10)]
    send_timeout_secs: u64,

    #[arg(long, env = "IRORI_QUEUE_CAPACITY", default_value_t = 100)]
    queue_capacity: usize,

    /// Number of messages replayed on join
    #[arg(long, env = "IRORI_HISTORY_LIMIT", default_value_t = 50)]
    history_limit: usize,

    #[arg(long, env = "IRORI_EVICTION_WAIT_MS", default_value_t = 2000)]
    eviction_wait_ms: u64,

    #[arg(long, env = "IRORI_SWEEP_INTERVAL_SECS", default_value_t = 300)]
    sweep_interval_secs: u64,

    #[arg(long, env = "IRORI_STALE_AFTER_SECS", default_value_t = 300)]
    stale_after_secs: u64,

    #[arg(long, env = "IRORI_AUTH_CACHE_TTL_SECS", default_value_t = 300)]
    auth_cache_ttl_secs: u64,

    #[arg(long, env = "IRORI_AUTH_CACHE_MAX_ENTRIES", default_value_t = 10_000)]
    auth_cache_max_entries: usize,
}

impl Args {
    fn app_config(&self) -> AppConfig {
        let defaults = SessionConfig::default();
        AppConfig {
            limits: RegistryLimits {
                per_user: self.max_connections_per_user,
                per_room: self.max_connections_per_room,
                global: self.max_total_connections,
            },
            rate_limit: RateLimitConfig {
                message: BucketConfig {
                    rate: self.message_rate,
                    burst: self.message_burst,
                },
                connection_attempt: BucketConfig {
                    rate: self.connect_rate,
                    burst: self.connect_burst,
                },
            },
            auth: AuthGateConfig {
                ttl: Duration::from_secs(self.auth_cache_ttl_secs),
                max_entries: self.auth_cache_max_entries,
                sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            },
            session: SessionConfig {
                ping_interval: Duration::from_secs(self.ping_interval_secs),
                inactivity_timeout: Duration::from_secs(self.inactivity_timeout_secs),
                health_interval: Duration::from_secs(self.health_interval_secs),
                health_failure_threshold: self.health_failure_threshold,
                health_window: Duration::from_secs(self.health_window_secs),
                probe_timeout: Duration::from_secs(self.probe_timeout_secs),
                send_timeout: Duration::from_secs(self.send_timeout_secs),
                queue_capacity: self.queue_capacity,
                event_buffer: defaults.event_buffer,
                history_limit: self.history_limit,
                task_join_timeout: defaults.task_join_timeout,
            },
            eviction_wait: Duration::from_millis(self.eviction_wait_ms),
            sweep_interval: Duration::from_secs(self.sweep_interval_secs),
            stale_after: Duration::from_secs(self.stale_after_secs),
        }
    }

    fn load_seed(&self) -> Result<Seed, Box<dyn std::error::Error>> {
        match &self.seed {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .map_err(|e| format!("failed to read seed file {}: {}", path.display(), e))?;
                Ok(Seed::from_json(&text)?)
            }
            None if self.dev => Ok(Seed::demo()),
            None => Ok(Seed::default()),
        }
    }

    fn secret(&self) -> Result<String, String> {
        match (&self.jwt_secret, self.dev) {
            (Some(secret), _) => Ok(secret.clone()),
            (None, true) => {
                tracing::warn!("no JWT secret configured, using the development secret");
                Ok(DEV_SECRET.to_string())
            }
            (None, false) => Err("IRORI_JWT_SECRET (or --jwt-secret) is required unless --dev is set".to_string()),
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Initialize tracing
    setup_logger(env!("CARGO_BIN_NAME"), &args.log_level);

    if let Err(e) = run(args).await {
        tracing::error!("Server error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize dependencies in order:
    // 1. Collaborators (clock, user directory, message store, fan-out, verifier)
    // 2. Registry, rate limiter, auth gate and use cases
    // 3. Maintenance tasks
    // 4. Server
    let secret = args.secret()?;
    let seed = args.load_seed()?;
    let config = args.app_config();

    // 1. Create collaborators
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let directory = Arc::new(InMemoryUserDirectory::new());
    let store = Arc::new(InMemoryMessageStore::new(directory.clone(), clock.clone()));
    seed.apply(&directory, &store).await?;
    let verifier = Arc::new(JwtCredentialVerifier::new(secret.as_bytes(), clock.clone()));

    if args.dev {
        let issued_at = clock.now_millis() / 1000;
        for user in &seed.users {
            let token = sign_token(secret.as_bytes(), &user.id, issued_at, DEV_TOKEN_TTL_SECS)?;
            tracing::info!(user_id = %user.id, "dev token: {}", token);
        }
    }

    // 2. Wire the application
    let app = App::build(
        config,
        Collaborators {
            verifier,
            directory,
            store,
            fanout: Arc::new(LocalFanoutBus::new()),
            clock,
        },
    );

    // 3. Start maintenance
    let shutdown = CancellationToken::new();
    let maintenance = app.start_maintenance(shutdown.clone());

    // 4. Create and run the server
    let server = Server::new(app.context.clone(), ServerConfig::default());
    let result = server.run(args.host, args.port).await;

    shutdown.cancel();
    for handle in maintenance {
        let _ = handle.await;
    }
    result
}
