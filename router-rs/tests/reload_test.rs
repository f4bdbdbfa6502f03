mod support;

use serde_json::{json, Value};
use std::time::Duration;
use support::{spawn_backend, write_routes, TestProxy};

async fn backend_name(proxy: &TestProxy, host: &str) -> Option<String> {
    let response = proxy.get(host, "/").await;
    if response.status() != 200 {
        return None;
    }
    let body: Value = response.json().await.unwrap();
    body["backend"].as_str().map(str::to_string)
}

#[tokio::test]
async fn test_reload_switches_backend() {
    let blue = spawn_backend("blue").await;
    let green = spawn_backend("green").await;
    let proxy = TestProxy::start(json!({
        "app.example.com": { "target": format!("http://127.0.0.1:{}", blue) }
    }))
    .await;
    assert_eq!(backend_name(&proxy, "app.example.com").await.as_deref(), Some("blue"));

    write_routes(
        &proxy.routes_file,
        &json!({ "app.example.com": { "target": format!("http://127.0.0.1:{}", green) } }),
    );
    proxy.tables.reload().unwrap();

    assert_eq!(backend_name(&proxy, "app.example.com").await.as_deref(), Some("green"));
}

#[tokio::test]
async fn test_broken_reload_keeps_serving() {
    let blue = spawn_backend("blue").await;
    let proxy = TestProxy::start(json!({
        "app.example.com": { "target": format!("http://127.0.0.1:{}", blue) }
    }))
    .await;
    let version = proxy.tables.snapshot().version();

    // Truncated JSON
    std::fs::write(&proxy.routes_file, "{ \"routes\": { \"app.example.com\": ").unwrap();
    assert!(proxy.tables.reload().is_err());

    // One bad entry rejects the whole document
    write_routes(
        &proxy.routes_file,
        &json!({
            "app.example.com": { "target": "http://127.0.0.1:1" },
            "bad.example.com": { "target": "ftp://127.0.0.1" }
        }),
    );
    assert!(proxy.tables.reload().is_err());

    assert_eq!(proxy.tables.snapshot().version(), version);
    assert_eq!(backend_name(&proxy, "app.example.com").await.as_deref(), Some("blue"));
    assert_eq!(proxy.get("bad.example.com", "/").await.status(), 404);
}

#[tokio::test]
async fn test_file_watch_reloads() {
    let blue = spawn_backend("blue").await;
    let proxy = TestProxy::start(json!({})).await;
    let _watcher = proxy.tables.watch().unwrap().expect("file sources are watchable");
    let mut updates = proxy.tables.subscribe();

    write_routes(
        &proxy.routes_file,
        &json!({ "new.example.com": { "target": format!("http://127.0.0.1:{}", blue) } }),
    );

    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            updates.changed().await.unwrap();
            if updates.borrow().get("new.example.com").is_some() {
                break;
            }
        }
    })
    .await
    .expect("route file change was not picked up");

    assert_eq!(backend_name(&proxy, "new.example.com").await.as_deref(), Some("blue"));
}
