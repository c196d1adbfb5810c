//! lingo-relay: chat relay that pushes every message to each member in their
//! preferred language over server-sent events.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod events;
pub mod fanout;
pub mod metrics;
pub mod protocol;
pub mod retry;
pub mod server;
pub mod store;
pub mod translate;

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpServer};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use broadcast::ConnectionRegistry;
use config::AppConfig;
use fanout::FanoutOrchestrator;
use metrics::MetricsRegistry;
use server::AppState;
use store::InMemoryStore;
use translate::cache::TranslationCache;
use translate::client::{ChatCompletionClient, DisabledBackend, TranslationBackend};
use translate::sqlite_cache::DurableCache;
use translate::{Translator, TranslatorOptions};

/// Install the global subscriber. `RUST_LOG` overrides the default filter and
/// `LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lingo_relay=debug,actix_web=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Two users and one conversation so the relay is usable without a database.
pub fn seed_demo(store: &InMemoryStore) {
    store.add_user("alice", "Alice", "en");
    store.add_user("bruno", "Bruno", "es");
    store.add_user("chloe", "Chloé", "fr");
    store.add_conversation("demo", &["alice", "bruno", "chloe"]);
}

/// Wire every service, start the background loops and serve HTTP until
/// shutdown.
pub async fn run(config: AppConfig) -> std::io::Result<()> {
    info!("lingo-relay starting");

    let metrics = Arc::new(MetricsRegistry::new());

    let mut cache = TranslationCache::new(config.cache.capacity, config.cache.max_age())
        .with_evict_fraction(config.cache.evict_fraction);
    if let Some(path) = &config.cache.durable_path {
        match DurableCache::open(path) {
            Ok(durable) => cache = cache.with_durable(durable),
            Err(e) => warn!(error = %e, "durable cache unavailable, memory tier only"),
        }
    }
    let cache = Arc::new(cache);

    let backend: Arc<dyn TranslationBackend> = match ChatCompletionClient::new(&config.translator) {
        Ok(client) => {
            info!(model = %config.translator.model, "translation backend initialized");
            Arc::new(client)
        }
        Err(e) => {
            warn!(error = %e, "translation backend disabled, messages are relayed untranslated");
            Arc::new(DisabledBackend)
        }
    };

    let translator = Arc::new(Translator::new(
        backend,
        Arc::clone(&cache),
        TranslatorOptions {
            timeout: config.translator.timeout(),
            retry: config.translator.retry_policy(),
            min_cache_confidence: config.translator.min_confidence,
            max_text_chars: config.translator.max_text_chars,
        },
        Arc::clone(&metrics),
    ));

    let store = Arc::new(InMemoryStore::new());
    if config.server.seed_demo {
        seed_demo(&store);
        info!("demo conversation seeded");
    }

    let registry = Arc::new(ConnectionRegistry::new(config.server.channel_capacity));
    let orchestrator = Arc::new(
        FanoutOrchestrator::new(
            store.clone(),
            store.clone(),
            translator,
            Arc::clone(&registry),
            Arc::clone(&metrics),
        )
        .with_min_confidence(config.translator.min_confidence),
    );

    let cancel = CancellationToken::new();
    let sweep = TranslationCache::start_sweep_loop(
        Arc::clone(&cache),
        Duration::from_secs(config.cache.sweep_interval_secs.max(1)),
        cancel.clone(),
    );
    let heartbeat = Arc::clone(&registry).start_heartbeat_loop(
        Duration::from_secs(config.server.heartbeat_secs.max(1)),
        cancel.clone(),
    );

    let state = web::Data::new(AppState {
        orchestrator,
        registry,
        store,
        cache,
        metrics,
    });

    let addr = (config.server.host.clone(), config.server.port);
    info!(host = %addr.0, port = addr.1, "listening");
    let result = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .configure(server::configure)
    })
    .bind(addr)?
    .run()
    .await;

    cancel.cancel();
    let _ = tokio::join!(sweep, heartbeat);
    info!("lingo-relay stopped");
    result
}
