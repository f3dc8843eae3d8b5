//! Smoke integration tests for kimakid.
//!
//! These tests spawn the actual kimakid binary on a random port with a
//! minimal config (log-only platform, temp SQLite file), then drive it over
//! HTTP the way a worker process and the gateway would.

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;

use serde_json::{Value, json};

/// Find a free port by binding to :0 and reading the assigned port.
fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind to :0");
    listener.local_addr().unwrap().port()
}

/// Write a minimal config TOML with a fast poll interval and no Discord.
fn write_test_config(dir: &tempfile::TempDir, port: u16) -> PathBuf {
    let config_path = dir.path().join("test.toml");
    let db_path = dir.path().join("kimaki.db");
    let toml = format!(
        r#"
[server]
bind = "127.0.0.1:{port}"

[storage]
db_path = "{db}"

[ipc]
poll_interval_ms = 20

[discord]
enabled = false
upload_timeout_ms = 60000

[opencode]
base_url = "http://127.0.0.1:9"
"#,
        db = db_path.display()
    );
    std::fs::write(&config_path, toml).expect("write test config");
    config_path
}

/// Build the kimakid binary (debug mode) and return its path.
fn kimakid_binary() -> PathBuf {
    let workspace_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("..");
    let output = Command::new("cargo")
        .args(["build", "--bin", "kimakid", "--workspace"])
        .current_dir(&workspace_root)
        .output()
        .expect("cargo build");
    assert!(
        output.status.success(),
        "cargo build failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    workspace_root.join("target/debug/kimakid")
}

/// Spawn kimakid and wait for it to be ready.
struct TestServer {
    child: Child,
    base_url: String,
    client: reqwest::blocking::Client,
}

impl TestServer {
    fn start(config_path: &Path, port: u16) -> Self {
        let binary = kimakid_binary();
        let child = Command::new(&binary)
            .args(["serve", "--config", config_path.to_str().unwrap()])
            .env("RUST_LOG", "warn")
            .env_remove("DISCORD_BOT_TOKEN")
            .env_remove("KIMAKI_BIND")
            .env_remove("KIMAKI_DB_PATH")
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .expect("spawn kimakid");

        let server = TestServer {
            child,
            base_url: format!("http://127.0.0.1:{port}"),
            client: reqwest::blocking::Client::new(),
        };
        server.wait_ready();
        server
    }

    fn wait_ready(&self) {
        for _ in 0..50 {
            if self
                .client
                .get(format!("{}/healthz", self.base_url))
                .timeout(Duration::from_millis(200))
                .send()
                .is_ok()
            {
                return;
            }
            std::thread::sleep(Duration::from_millis(100));
        }
        panic!("kimakid did not become ready within 5 seconds");
    }

    fn create_request(&self, body: Value) -> String {
        let resp = self
            .client
            .post(format!("{}/v1/ipc/requests", self.base_url))
            .json(&body)
            .send()
            .expect("POST /v1/ipc/requests");
        assert_eq!(resp.status(), 201);
        let body: Value = resp.json().unwrap();
        body["id"].as_str().unwrap().to_string()
    }

    fn get_request(&self, id: &str) -> Value {
        self.client
            .get(format!("{}/v1/ipc/requests/{id}", self.base_url))
            .send()
            .expect("GET /v1/ipc/requests/{id}")
            .json()
            .unwrap()
    }

    /// Poll until the row leaves `pending`/`processing`; returns the row.
    fn wait_terminal(&self, id: &str) -> Value {
        for _ in 0..100 {
            let row = self.get_request(id);
            if row["status"] == "completed" || row["status"] == "cancelled" {
                return row;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        panic!("request {id} never reached a terminal status");
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        // Send SIGTERM for graceful shutdown
        #[cfg(unix)]
        {
            unsafe {
                libc::kill(self.child.id() as i32, libc::SIGTERM);
            }
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

fn response_of(row: &Value) -> Value {
    serde_json::from_str(row["response"].as_str().expect("response set")).unwrap()
}

#[test]
fn healthz_returns_ok() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_test_config(&dir, port);
    let server = TestServer::start(&config, port);

    let resp = server
        .client
        .get(format!("{}/healthz", server.base_url))
        .send()
        .expect("GET /healthz");

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "kimakid");
    assert!(body["uptime_seconds"].is_number());
}

#[test]
fn readyz_reports_running_dispatcher() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_test_config(&dir, port);
    let server = TestServer::start(&config, port);

    let resp = server
        .client
        .get(format!("{}/readyz", server.base_url))
        .send()
        .expect("GET /readyz");

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().unwrap();
    assert_eq!(body["status"], "ready");
    assert_eq!(body["dispatcher_running"], true);
    assert_eq!(body["discord_enabled"], false);
    assert_eq!(body["active_threads"], 0);
}

#[test]
fn unknown_request_type_is_answered_with_error() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_test_config(&dir, port);
    let server = TestServer::start(&config, port);

    let id = server.create_request(json!({
        "type": "bogus",
        "session_id": "ses_1",
        "thread_id": "123"
    }));
    let row = server.wait_terminal(&id);
    assert_eq!(row["status"], "completed");
    assert_eq!(response_of(&row), json!({"error": "Unknown IPC type: bogus"}));
}

#[test]
fn action_buttons_are_acknowledged() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_test_config(&dir, port);
    let server = TestServer::start(&config, port);

    let id = server.create_request(json!({
        "type": "action_buttons",
        "session_id": "ses_1",
        "thread_id": "123",
        "payload": {"buttons": [{"label": "Ship it", "color": "green"}]}
    }));
    let row = server.wait_terminal(&id);
    assert_eq!(row["status"], "completed");
    assert_eq!(response_of(&row), json!({"ok": true}));
}

#[test]
fn file_upload_completes_when_gateway_resolves_it() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_test_config(&dir, port);
    let server = TestServer::start(&config, port);

    let id = server.create_request(json!({
        "type": "file_upload",
        "session_id": "ses_1",
        "thread_id": "123",
        "payload": {"prompt": "Send the screenshot", "maxFiles": 1}
    }));

    // The prompt is registered once the dispatcher has claimed the row.
    let mut resolved = false;
    for _ in 0..100 {
        let resp = server
            .client
            .post(format!("{}/v1/uploads/{id}", server.base_url))
            .json(&json!({"filePaths": ["/tmp/screenshot.png"]}))
            .send()
            .expect("POST /v1/uploads/{id}");
        if resp.status() == 200 {
            resolved = true;
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    assert!(resolved, "upload prompt was never registered");

    let row = server.wait_terminal(&id);
    assert_eq!(row["status"], "completed");
    assert_eq!(response_of(&row), json!({"filePaths": ["/tmp/screenshot.png"]}));
}

#[test]
fn restart_cancels_requests_left_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    let port = free_port();
    let config = write_test_config(&dir, port);

    let id = {
        let server = TestServer::start(&config, port);
        let id = server.create_request(json!({
            "type": "file_upload",
            "session_id": "ses_1",
            "thread_id": "123",
            "payload": {}
        }));
        for _ in 0..100 {
            if server.get_request(&id)["status"] == "processing" {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        assert_eq!(server.get_request(&id)["status"], "processing");
        id
    };

    let server = TestServer::start(&config, port);
    let row = server.get_request(&id);
    assert_eq!(row["status"], "cancelled");
    assert_eq!(
        response_of(&row),
        json!({"error": "Bot restarted, request cancelled"})
    );
}
