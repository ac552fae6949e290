//! End-to-End Tests
//!
//! Drives the full stack through the `vesper` umbrella crate: scripts are
//! written to temporary files, pushed over the admin endpoint, and exercised
//! with concurrent HTTP clients.
//!
//! Test Scenarios:
//! 1. Concurrent requests spread over every shard
//! 2. KV state shared across shards
//! 3. Hot reload from a script file while traffic keeps flowing
//! 4. Graceful shutdown of the fleet

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use vesper::metrics::MetricsSnapshot;
use vesper::server::{
    HttpServer, KvRegistry, Runtime, RuntimeBuilder, RuntimeConfig, ServerConfig, StopMode,
};

// ============================================================================
// Test Helpers
// ============================================================================

/// Creates a temporary script file with the given content.
fn create_test_script(content: &str) -> tempfile::NamedTempFile {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), content).unwrap();
    file
}

struct Stack {
    addr: SocketAddr,
    runtime: Arc<Runtime>,
    shutdown: CancellationToken,
    client: reqwest::Client,
}

impl Stack {
    async fn start(shards: usize) -> Self {
        let mut kv = KvRegistry::new();
        kv.configure("counters", "memory://").unwrap();

        let runtime = RuntimeBuilder::new(RuntimeConfig::new().with_shards(shards))
            .with_kv(kv)
            .build()
            .unwrap();
        let runtime = Arc::new(runtime);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = HttpServer::new(Arc::clone(&runtime), ServerConfig::default());
        let shutdown = server.shutdown_token();
        tokio::spawn(server.serve(listener));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap();

        Self {
            addr,
            runtime,
            shutdown,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Pushes the contents of `script` through the admin endpoint.
    async fn push(&self, name: &str, script: &tempfile::NamedTempFile, interrupt: bool) -> u16 {
        let source = std::fs::read_to_string(script.path()).unwrap();
        self.client
            .post(self.url(&format!("/_vesper/reload?name={name}&interrupt={interrupt}")))
            .body(source)
            .send()
            .await
            .unwrap()
            .status()
            .as_u16()
    }

    async fn get(&self, path: &str) -> (u16, Option<String>, String) {
        let response = self.client.get(self.url(path)).send().await.unwrap();
        let status = response.status().as_u16();
        let shard = response
            .headers()
            .get("x-vesper-shard")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        (status, shard, response.text().await.unwrap())
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_cover_every_shard() {
    let stack = Arc::new(Stack::start(3).await);
    let script = create_test_script(
        r#"
        registerEventHandler((evt) => {
            evt.respondWith(new Promise((resolve) => {
                setTimeout(() => resolve(evt.request.url.replace(/^http:\/\/[^/]+/, "")), 5);
            }));
        });
        "#,
    );
    assert_eq!(stack.push("paths.js", &script, false).await, 202);

    let mut handles = Vec::new();
    for i in 0..30 {
        let stack = Arc::clone(&stack);
        handles.push(tokio::spawn(async move {
            stack.get(&format!("/item/{i}")).await
        }));
    }

    let mut shards = BTreeSet::new();
    for (i, handle) in handles.into_iter().enumerate() {
        let (status, shard, body) = handle.await.unwrap();
        assert_eq!(status, 200);
        assert_eq!(body, format!("/item/{i}"));
        shards.insert(shard.unwrap());
    }
    assert_eq!(shards.len(), 3);

    let snapshot: MetricsSnapshot = stack
        .client
        .get(stack.url("/_vesper/metrics"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(snapshot.outcomes["responded"], 30);
    assert_eq!(snapshot.active_requests, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_kv_state_is_shared_across_shards() {
    let stack = Stack::start(2).await;
    let script = create_test_script(
        r#"
        registerMiddlewareHandler(async (ctx) => {
            const store = ctx.kv.counters;
            const current = Number((await store.get("hits")) || "0") + 1;
            await store.put("hits", String(current));
            return { hits: current };
        });
        "#,
    );
    assert_eq!(stack.push("counter.js", &script, false).await, 202);

    let mut seen = BTreeSet::new();
    for expected in 1..=4 {
        let (status, shard, body) = stack.get("/hit").await;
        assert_eq!(status, 200);
        assert_eq!(body, format!(r#"{{"hits":{expected}}}"#));
        seen.insert(shard.unwrap());
    }
    assert_eq!(seen.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hot_reload_from_file_under_traffic() {
    let stack = Arc::new(Stack::start(2).await);
    let v1 = create_test_script(r#"registerMiddlewareHandler(() => "v1");"#);
    let v2 = create_test_script(r#"registerEventHandler((evt) => evt.respondWith("v2"));"#);
    let broken = create_test_script("registerEventHandler((evt) => {");

    assert_eq!(stack.push("app.js", &v1, false).await, 202);
    assert_eq!(stack.get("/").await.2, "v1");

    let traffic = {
        let stack = Arc::clone(&stack);
        tokio::spawn(async move {
            let mut bodies = Vec::new();
            for _ in 0..40 {
                let (status, _, body) = stack.get("/").await;
                assert_eq!(status, 200);
                bodies.push(body);
            }
            bodies
        })
    };

    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(stack.push("app.js", &v2, false).await, 202);
    assert_eq!(stack.push("broken.js", &broken, true).await, 400);

    let bodies = traffic.await.unwrap();
    assert!(bodies.iter().all(|b| b == "v1" || b == "v2"));
    assert_eq!(stack.get("/").await.2, "v2");

    let info = stack.runtime.info();
    assert_eq!(info.script.as_deref(), Some("app.js"));
    assert_eq!(info.generation, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_graceful_shutdown_stops_dispatch() {
    let stack = Stack::start(2).await;
    let script = create_test_script(r#"registerMiddlewareHandler(() => "up");"#);
    assert_eq!(stack.push("up.js", &script, false).await, 202);
    assert_eq!(stack.get("/").await.0, 200);

    stack.runtime.shutdown(StopMode::Graceful).await;
    assert!(!stack.runtime.is_ready());

    let (status, _, body) = stack.get("/").await;
    assert_eq!(status, 503);
    assert_eq!(body, "runtime not ready");

    assert_eq!(stack.push("up.js", &script, false).await, 503);
}
