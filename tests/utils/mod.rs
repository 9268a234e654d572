#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use payment_dispatch::domain::Params;
use payment_dispatch::infrastructure::InMemoryQueueStore;
use payment_dispatch::security::SignatureEngine;
use payment_dispatch::{config::Config, server::Server};

pub const TEST_SECRET: &str = "integration-secret";

pub struct TestApp {
    pub addr: String,
    pub store: InMemoryQueueStore,
}

fn test_config(overrides: &[(&str, &str)]) -> Config {
    let mut vars = HashMap::new();
    vars.insert("signature.secret".to_string(), TEST_SECRET.to_string());
    vars.insert("dispatch.poll_interval_ms".to_string(), "20".to_string());
    for (key, value) in overrides {
        vars.insert(key.to_string(), value.to_string());
    }

    let mut config = Config::load_with_sources(Some(vars)).unwrap();
    config.server.host = "127.0.0.1".to_string();
    config.server.port = 0;
    config
}

pub async fn spawn_server() -> String {
    spawn_app(&[]).await.addr
}

/// Spawn the server on a fresh in-memory store that the test can seed and
/// inspect.
pub async fn spawn_app(overrides: &[(&str, &str)]) -> TestApp {
    let config = test_config(overrides);
    let store = InMemoryQueueStore::new();

    let server = Server::with_store(&config, Arc::new(store.clone()))
        .await
        .unwrap();

    let port = server.port().unwrap();
    tokio::spawn(server.run());

    TestApp {
        addr: format!("http://{}:{}", config.server.host, port),
        store,
    }
}

/// Producer-only server: requests are queued but never delivered, so the
/// queues can be inspected.
pub async fn spawn_producer() -> TestApp {
    spawn_app(&[("dispatch.consume", "false")]).await
}

/// Form pairs carrying a fresh `timestamp` and a valid `sign`.
pub fn signed_form(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    signed_form_at(pairs, time::OffsetDateTime::now_utc().unix_timestamp(), TEST_SECRET)
}

pub fn signed_form_at(pairs: &[(&str, &str)], timestamp: i64, secret: &str) -> Vec<(String, String)> {
    let mut params = Params::new();
    for (key, value) in pairs {
        params
            .entry(key.to_string())
            .or_default()
            .push(value.to_string());
    }
    params.insert("timestamp".to_string(), vec![timestamp.to_string()]);

    SignatureEngine::new(secret, 5).sign_params(&mut params);

    params
        .into_iter()
        .flat_map(|(key, values)| values.into_iter().map(move |v| (key.clone(), v)))
        .collect()
}
