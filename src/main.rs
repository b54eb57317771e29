mod api;
mod config;
mod greeting;
mod memory;
mod openai;
pub mod registry;
mod relay;
mod store;
mod twilio;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use config::Config;
use registry::CallRegistry;
use store::KvStore;
use twilio::client::CallControlClient;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared application state accessible from all handlers.
///
/// Webhook handlers are stateless; everything that must survive across
/// invocations lives in the KV store behind `store` and `registry`.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub store: KvStore,
    pub registry: CallRegistry,
    pub twilio: Arc<CallControlClient>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("--version") => println!("relay-concierge {VERSION}"),
        Some("--help") | Some("-h") => print_usage(),
        Some(other) => {
            eprintln!("Unknown option: {other}");
            print_usage();
            std::process::exit(1);
        }
        None => {
            let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
            rt.block_on(server());
        }
    }
}

fn print_usage() {
    println!("relay-concierge {VERSION}");
    println!("Phone-call concierge: realtime voice relay and conference bridging");
    println!();
    println!("Usage: relay-concierge [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --version   Print version");
    println!("  --help, -h  Print this help message");
    println!();
    println!("Without options, starts the webhook server.");
}

async fn server() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_concierge=info,tower_http=info".into()),
        )
        .init();

    // Load config
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "Starting relay-concierge"
    );

    // Build shared state
    let store = KvStore::open(&config.store.dir);
    let state = AppState {
        registry: CallRegistry::new(store.clone()),
        twilio: Arc::new(CallControlClient::new(&config.twilio)),
        store,
        config,
    };

    let addr: SocketAddr = format!(
        "{}:{}",
        state.config.server.host, state.config.server.port
    )
    .parse()
    .expect("Invalid server address");

    // Build router
    let app = Router::new()
        // Carrier webhooks
        .route("/twilio/voice", post(twilio::webhook::handle_voice))
        .route(
            "/twilio/conference/join",
            post(twilio::webhook::handle_conference_join),
        )
        .route("/twilio/resume", post(twilio::webhook::handle_resume))
        // Media stream (WebSocket) — the audio relay bridge
        .route("/twilio/media", get(twilio::media::handle_media_upgrade))
        // Relay IVR (third-party leg)
        .route("/twilio/relay/answer", post(relay::ivr::handle_answer))
        .route("/twilio/relay/confirm", post(relay::ivr::handle_confirm))
        .route("/twilio/relay/reply", post(relay::ivr::handle_reply))
        // Terminal status events for any leg
        .route("/twilio/status", post(relay::status::handle_status))
        // Agent tool: bridge a third party into the live call
        .route("/api/bridge", post(api::bridge::handle_bridge))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start server
    tracing::info!(%addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app).await.expect("Server error");
}

async fn health() -> &'static str {
    "ok"
}

#[cfg(test)]
pub fn test_state() -> AppState {
    let config = config::test_config();
    let store = KvStore::in_memory();
    AppState {
        registry: CallRegistry::new(store.clone()),
        twilio: Arc::new(CallControlClient::new(&config.twilio)),
        store,
        config,
    }
}
