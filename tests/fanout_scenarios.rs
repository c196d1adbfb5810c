//! End-to-end sends through the real chat-completion client against a local
//! stand-in translator.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpResponse, HttpServer};
use serde_json::{json, Value};

use lingo_relay::broadcast::{ConnectionRegistry, EventReceiver};
use lingo_relay::config::TranslatorConfig;
use lingo_relay::fanout::{FanoutOrchestrator, SendMessageRequest, SendStage};
use lingo_relay::metrics::MetricsRegistry;
use lingo_relay::protocol::EventType;
use lingo_relay::store::InMemoryStore;
use lingo_relay::translate::cache::TranslationCache;
use lingo_relay::translate::client::ChatCompletionClient;
use lingo_relay::translate::{Translator, TranslatorOptions};

/// Fake completion endpoint. Spanish succeeds, French always fails, and
/// `fail_all` turns every request into a 500.
#[derive(Default)]
struct StandIn {
    calls: AtomicU32,
    fail_all: AtomicBool,
}

async fn completions(stand_in: web::Data<StandIn>, body: web::Json<Value>) -> HttpResponse {
    stand_in.calls.fetch_add(1, Ordering::SeqCst);
    let prompt = body["messages"][1]["content"].as_str().unwrap_or_default();
    if stand_in.fail_all.load(Ordering::SeqCst) || prompt.contains("to French") {
        return HttpResponse::InternalServerError().body("upstream exploded");
    }
    let text = if prompt.contains("to Spanish") {
        "Hola a todos"
    } else {
        "???"
    };
    HttpResponse::Ok().json(json!({
        "choices": [{ "message": { "role": "assistant", "content": format!(" {text}\n") } }]
    }))
}

async fn start_stand_in() -> (Arc<StandIn>, SocketAddr) {
    let stand_in = web::Data::new(StandIn::default());
    let data = stand_in.clone();
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route("/v1/chat/completions", web::post().to(completions))
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .unwrap();
    let addr = server.addrs()[0];
    actix_web::rt::spawn(server.run());
    (stand_in.into_inner(), addr)
}

struct Relay {
    orchestrator: FanoutOrchestrator,
    registry: Arc<ConnectionRegistry>,
    stand_in: Arc<StandIn>,
}

async fn relay(members: &[(&str, &str)]) -> Relay {
    let (stand_in, addr) = start_stand_in().await;
    let config = TranslatorConfig {
        base_url: format!("http://{addr}"),
        api_key: Some("test-key".into()),
        base_delay_ms: 10,
        max_delay_ms: 40,
        min_interval_ms: 0,
        ..TranslatorConfig::default()
    };
    let client = ChatCompletionClient::new(&config).unwrap();

    let store = Arc::new(InMemoryStore::new());
    for (id, lang) in members {
        store.add_user(id, id, lang);
    }
    let ids: Vec<&str> = members.iter().map(|(id, _)| *id).collect();
    store.add_conversation("room", &ids);

    let metrics = Arc::new(MetricsRegistry::new());
    let translator = Arc::new(Translator::new(
        Arc::new(client),
        Arc::new(TranslationCache::new(100, Duration::from_secs(3600))),
        TranslatorOptions {
            timeout: config.timeout(),
            retry: config.retry_policy(),
            ..TranslatorOptions::default()
        },
        Arc::clone(&metrics),
    ));
    let registry = Arc::new(ConnectionRegistry::new(16));
    let orchestrator = FanoutOrchestrator::new(
        store.clone(),
        store,
        translator,
        Arc::clone(&registry),
        metrics,
    );
    Relay {
        orchestrator,
        registry,
        stand_in,
    }
}

fn hello() -> SendMessageRequest {
    SendMessageRequest {
        conversation_id: "room".into(),
        sender_id: "alice".into(),
        content: "Hello".into(),
        source_language: Some("en".into()),
    }
}

fn new_messages(rx: &mut EventReceiver) -> Vec<Value> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.event_type == EventType::NewMessage {
            out.push(event.data.clone());
        }
    }
    out
}

#[actix_web::test]
async fn same_language_pair_is_delivered_untranslated() {
    let relay = relay(&[("alice", "en"), ("bruno", "en")]).await;
    let (_, mut bruno) = relay.registry.open("bruno");

    relay.orchestrator.send_message(hello()).await.unwrap();

    let received = new_messages(&mut bruno);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["content"], "Hello");
    assert_eq!(received[0]["isTranslated"], false);
    assert_eq!(relay.stand_in.calls.load(Ordering::SeqCst), 0);
}

#[actix_web::test]
async fn cross_language_is_translated_then_served_from_cache() {
    let relay = relay(&[("alice", "en"), ("bruno", "es")]).await;
    let (_, mut bruno) = relay.registry.open("bruno");

    relay.orchestrator.send_message(hello()).await.unwrap();
    let first = new_messages(&mut bruno);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0]["isTranslated"], true);
    assert_eq!(first[0]["translatedContent"], "Hola a todos");
    assert_eq!(first[0]["originalContent"], "Hello");
    assert!(first[0]["confidence"].as_f64().unwrap() > 0.5);

    relay.orchestrator.send_message(hello()).await.unwrap();
    let second = new_messages(&mut bruno);
    assert_eq!(second[0]["translatedContent"], "Hola a todos");
    assert_eq!(relay.stand_in.calls.load(Ordering::SeqCst), 1);
}

#[actix_web::test]
async fn translator_outage_still_delivers_original() {
    let relay = relay(&[("alice", "en"), ("bruno", "es")]).await;
    relay.stand_in.fail_all.store(true, Ordering::SeqCst);
    let (_, mut bruno) = relay.registry.open("bruno");

    let (_, report) = relay.orchestrator.send_message(hello()).await.unwrap();
    assert_eq!(report.final_stage, SendStage::Delivered);

    let received = new_messages(&mut bruno);
    assert_eq!(received.len(), 1);
    assert_eq!(received[0]["content"], "Hello");
    assert_eq!(received[0]["isTranslated"], false);
    assert_eq!(received[0]["confidence"], 0.0);
    assert_eq!(received[0]["translationUnavailable"], true);
    assert_eq!(relay.stand_in.calls.load(Ordering::SeqCst), 3);
}

#[actix_web::test]
async fn every_member_gets_exactly_one_message() {
    let members = [
        ("alice", "en"),
        ("bruno", "es"),
        ("chloe", "fr"),
        ("dan", "en"),
        ("elena", "es"),
    ];
    let relay = relay(&members).await;
    let mut receivers: Vec<_> = members
        .iter()
        .map(|(id, _)| (*id, relay.registry.open(id).1))
        .collect();

    let (_, report) = relay.orchestrator.send_message(hello()).await.unwrap();
    assert_eq!(report.delivery_attempts, members.len());
    assert_eq!(report.recipients.len(), members.len() - 1);

    for (id, rx) in receivers.iter_mut() {
        let received = new_messages(rx);
        assert_eq!(received.len(), 1, "{id} should get one message");
        let expected = match *id {
            "bruno" | "elena" => "Hola a todos",
            _ => "Hello",
        };
        assert_eq!(received[0]["content"], expected, "content for {id}");
    }
}
