//! Marketplace scraper bridge.
//!
//! Spawns the browser-driver subprocess once per job and talks to it over a
//! JSON-lines stdin/stdout protocol. Requests carry numeric ids so every
//! worker can share the one process; a reader task routes each response back
//! to the caller waiting on that id.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, instrument, warn};

use tenderscout_shared::{Result, ScraperConfig, TenderScoutError};

use crate::marketplace::{ListingDetails, ListingSummary, MarketplaceContext, MarketplaceSession};
use crate::preview;

// ---------------------------------------------------------------------------
// Protocol types (mirroring the bridge script)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestMessage<'a> {
    OpenContext {
        id: u64,
    },
    Search {
        id: u64,
        context: &'a str,
        query: &'a str,
        limit: usize,
    },
    Details {
        id: u64,
        context: &'a str,
        url: &'a str,
        #[serde(skip_serializing_if = "Option::is_none")]
        destination: Option<&'a str>,
    },
    CloseContext {
        id: u64,
        context: &'a str,
    },
    Shutdown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseMessage {
    Ready,
    Result {
        id: u64,
        #[serde(default)]
        result: Value,
    },
    Error {
        id: u64,
        error: String,
    },
    Blocked {
        id: u64,
        #[serde(default)]
        reason: String,
    },
}

#[derive(Debug, Deserialize)]
struct OpenedContext {
    context: String,
}

enum Reply {
    Result(Value),
    Error(String),
    Blocked(String),
}

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<Reply>>>>;

// ---------------------------------------------------------------------------
// Bridge handle
// ---------------------------------------------------------------------------

struct BridgeInner {
    stdin: Mutex<ChildStdin>,
    child: Mutex<Child>,
    pending: Pending,
    next_id: AtomicU64,
    timeout: Duration,
}

impl BridgeInner {
    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    async fn request(&self, id: u64, message: &RequestMessage<'_>) -> Result<Value> {
        let json = serde_json::to_string(message)
            .map_err(|e| TenderScoutError::parse(format!("failed to serialize request: {e}")))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        if let Err(e) = self.write_line(&json).await {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        let Ok(reply) = tokio::time::timeout(self.timeout, rx).await else {
            lock(&self.pending).remove(&id);
            warn!(id, timeout_secs = self.timeout.as_secs(), "bridge request timed out");
            return Err(TenderScoutError::Network(format!(
                "scraper bridge did not answer request {id} within {}s",
                self.timeout.as_secs()
            )));
        };

        match reply {
            Ok(Reply::Result(value)) => Ok(value),
            Ok(Reply::Error(error)) => Err(TenderScoutError::provider("scraper", error)),
            Ok(Reply::Blocked(reason)) => Err(TenderScoutError::Blocked(reason)),
            Err(_) => Err(TenderScoutError::Network(
                "scraper bridge closed stdout unexpectedly".into(),
            )),
        }
    }

    async fn write_line(&self, json: &str) -> Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(json.as_bytes())
            .await
            .map_err(|e| TenderScoutError::Network(format!("failed to write to bridge stdin: {e}")))?;
        stdin
            .write_all(b"\n")
            .await
            .map_err(|e| TenderScoutError::Network(format!("failed to write to bridge stdin: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| TenderScoutError::Network(format!("failed to flush bridge stdin: {e}")))
    }
}

fn lock<T>(m: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to the spawned scraper subprocess. Cheap to clone.
#[derive(Clone)]
pub struct ScraperBridge {
    inner: Arc<BridgeInner>,
}

impl ScraperBridge {
    /// Spawn the bridge and wait for its `ready` line.
    pub async fn spawn(config: &ScraperConfig) -> Result<Self> {
        info!(cmd = %config.bridge_cmd, script = %config.bridge_script, "spawning scraper bridge");

        let mut child = Command::new(&config.bridge_cmd)
            .arg(&config.bridge_script)
            .current_dir(&config.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Bridge logs go to parent stderr
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TenderScoutError::config(format!(
                    "failed to spawn scraper bridge: {e}. Is `{}` installed?",
                    config.bridge_cmd
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TenderScoutError::Network("failed to capture bridge stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TenderScoutError::Network("failed to capture bridge stdout".into()))?;

        let mut lines = BufReader::new(stdout).lines();
        wait_for_ready(&mut lines).await?;

        let pending: Pending = Arc::default();
        tokio::spawn(read_loop(lines, pending.clone()));

        Ok(Self {
            inner: Arc::new(BridgeInner {
                stdin: Mutex::new(stdin),
                child: Mutex::new(child),
                pending,
                next_id: AtomicU64::new(0),
                timeout: Duration::from_secs(config.request_timeout_secs.max(1)),
            }),
        })
    }
}

async fn wait_for_ready(lines: &mut Lines<BufReader<ChildStdout>>) -> Result<()> {
    let line = lines
        .next_line()
        .await
        .map_err(|e| TenderScoutError::Network(format!("bridge read error: {e}")))?
        .ok_or_else(|| TenderScoutError::Network("bridge exited before becoming ready".into()))?;

    match serde_json::from_str::<ResponseMessage>(line.trim()) {
        Ok(ResponseMessage::Ready) => {
            info!("scraper bridge is ready");
            Ok(())
        }
        _ => Err(TenderScoutError::parse(format!(
            "expected ready message, got: {}",
            preview(&line, 200)
        ))),
    }
}

/// Route responses to waiting requests until stdout closes.
async fn read_loop(mut lines: Lines<BufReader<ChildStdout>>, pending: Pending) {
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("bridge read error: {e}");
                break;
            }
        };

        let (id, reply) = match serde_json::from_str::<ResponseMessage>(line.trim()) {
            Ok(ResponseMessage::Result { id, result }) => (id, Reply::Result(result)),
            Ok(ResponseMessage::Error { id, error }) => (id, Reply::Error(error)),
            Ok(ResponseMessage::Blocked { id, reason }) => (id, Reply::Blocked(reason)),
            Ok(ResponseMessage::Ready) => continue,
            Err(e) => {
                warn!(error = %e, line = preview(&line, 200), "invalid bridge response");
                continue;
            }
        };

        match lock(&pending).remove(&id) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(id, "response for unknown request"),
        }
    }

    // Dropping the senders fails every request still waiting.
    lock(&pending).clear();
    debug!("bridge stdout closed");
}

#[async_trait]
impl MarketplaceSession for ScraperBridge {
    async fn open_context(&self) -> Result<Box<dyn MarketplaceContext>> {
        let id = self.inner.next_id();
        let value = self
            .inner
            .request(id, &RequestMessage::OpenContext { id })
            .await?;
        let opened: OpenedContext = serde_json::from_value(value)
            .map_err(|e| TenderScoutError::parse(format!("invalid open_context result: {e}")))?;

        debug!(context = %opened.context, "marketplace context opened");
        Ok(Box::new(BridgeContext {
            inner: self.inner.clone(),
            context: opened.context,
        }))
    }

    /// Send shutdown and wait briefly for the bridge to exit.
    async fn shutdown(&self) -> Result<()> {
        let json = serde_json::to_string(&RequestMessage::Shutdown)
            .map_err(|e| TenderScoutError::parse(e.to_string()))?;
        let _ = self.inner.write_line(&json).await;

        let mut child = self.inner.child.lock().await;
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => info!(?status, "scraper bridge exited"),
            Ok(Err(e)) => warn!("bridge wait error: {e}"),
            Err(_) => {
                warn!("bridge did not exit, killing");
                let _ = child.kill().await;
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Per-item context
// ---------------------------------------------------------------------------

struct BridgeContext {
    inner: Arc<BridgeInner>,
    context: String,
}

#[async_trait]
impl MarketplaceContext for BridgeContext {
    #[instrument(skip_all, fields(context = %self.context, query = %query))]
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<ListingSummary>> {
        let id = self.inner.next_id();
        let value = self
            .inner
            .request(
                id,
                &RequestMessage::Search {
                    id,
                    context: &self.context,
                    query,
                    limit,
                },
            )
            .await?;

        if value.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(value)
            .map_err(|e| TenderScoutError::parse(format!("invalid search result: {e}")))
    }

    async fn fetch_details(&self, link: &str, destination: Option<&str>) -> Result<ListingDetails> {
        let id = self.inner.next_id();
        let value = self
            .inner
            .request(
                id,
                &RequestMessage::Details {
                    id,
                    context: &self.context,
                    url: link,
                    destination,
                },
            )
            .await?;

        serde_json::from_value(value)
            .map_err(|e| TenderScoutError::parse(format!("invalid details result: {e}")))
    }

    async fn close(&self) -> Result<()> {
        let id = self.inner.next_id();
        self.inner
            .request(
                id,
                &RequestMessage::CloseContext {
                    id,
                    context: &self.context,
                },
            )
            .await?;
        debug!(context = %self.context, "marketplace context closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn request_wire_format() {
        let json = serde_json::to_string(&RequestMessage::Search {
            id: 7,
            context: "ctx-1",
            query: "sirene escolar",
            limit: 20,
        })
        .unwrap();
        assert_eq!(
            json,
            r#"{"type":"search","id":7,"context":"ctx-1","query":"sirene escolar","limit":20}"#
        );

        let json = serde_json::to_string(&RequestMessage::Details {
            id: 8,
            context: "ctx-1",
            url: "https://m.example/1",
            destination: None,
        })
        .unwrap();
        assert!(!json.contains("destination"));
    }

    #[test]
    fn response_wire_format() {
        let msg: ResponseMessage =
            serde_json::from_str(r#"{"type":"blocked","id":3,"reason":"captcha"}"#).unwrap();
        assert!(matches!(msg, ResponseMessage::Blocked { id: 3, ref reason } if reason == "captcha"));

        let msg: ResponseMessage = serde_json::from_str(r#"{"type":"ready"}"#).unwrap();
        assert!(matches!(msg, ResponseMessage::Ready));
    }

    /// A POSIX shell stand-in for the browser driver.
    const FAKE_BRIDGE: &str = r#"
echo '{"type":"ready"}'
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"type":"shutdown"'*) exit 0 ;;
    *'"type":"open_context"'*) echo "{\"type\":\"result\",\"id\":$id,\"result\":{\"context\":\"ctx-$id\"}}" ;;
    *'"type":"search"'*)
      case "$line" in
        *captcha*) echo "{\"type\":\"blocked\",\"id\":$id,\"reason\":\"captcha\"}" ;;
        *) echo "{\"type\":\"result\",\"id\":$id,\"result\":[{\"title\":\"Sirene SE-72\",\"price\":150.0,\"link\":\"https://m.example/1\"}]}" ;;
      esac ;;
    *'"type":"details"'*) echo "{\"type\":\"result\",\"id\":$id,\"result\":{\"shipping_cost\":12.5,\"attributes\":{\"Marca\":\"Acme\"},\"description\":\"72 musicas\"}}" ;;
    *'"type":"close_context"'*) echo "{\"type\":\"result\",\"id\":$id,\"result\":null}" ;;
    *) echo "{\"type\":\"error\",\"id\":$id,\"error\":\"unknown request\"}" ;;
  esac
done
"#;

    /// Announces readiness, then reads requests without ever answering.
    const SILENT_BRIDGE: &str = r#"
echo '{"type":"ready"}'
while IFS= read -r line; do
  case "$line" in
    *'"type":"shutdown"'*) exit 0 ;;
  esac
done
"#;

    async fn spawn_script(body: &str, request_timeout_secs: u64) -> ScraperBridge {
        let dir = std::env::temp_dir().join(format!("ts-bridge-{}", Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let script = dir.join("bridge.sh");
        std::fs::write(&script, body).unwrap();

        ScraperBridge::spawn(&ScraperConfig {
            bridge_cmd: "sh".into(),
            bridge_script: script.to_string_lossy().into_owned(),
            working_dir: dir.to_string_lossy().into_owned(),
            request_timeout_secs,
        })
        .await
        .expect("spawn fake bridge")
    }

    async fn fake_bridge() -> ScraperBridge {
        spawn_script(FAKE_BRIDGE, 30).await
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn search_details_and_close() {
        let bridge = fake_bridge().await;
        let ctx = bridge.open_context().await.unwrap();

        let listings = ctx.search("sirene escolar", 10).await.unwrap();
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].price, 150.0);

        let details = ctx
            .fetch_details(&listings[0].link, Some("01001-000"))
            .await
            .unwrap();
        assert_eq!(details.shipping_cost, Some(12.5));
        assert_eq!(details.attributes.get("Marca").map(String::as_str), Some("Acme"));

        ctx.close().await.unwrap();
        bridge.shutdown().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn blocked_is_fatal() {
        let bridge = fake_bridge().await;
        let ctx = bridge.open_context().await.unwrap();

        let err = ctx.search("captcha trigger", 10).await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("captcha"));

        bridge.shutdown().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_contexts_share_one_process() {
        let bridge = fake_bridge().await;
        let (a, b) = tokio::join!(bridge.open_context(), bridge.open_context());
        let (a, b) = (a.unwrap(), b.unwrap());

        let (ra, rb) = tokio::join!(a.search("sirene", 5), b.search("caneta", 5));
        assert_eq!(ra.unwrap().len(), 1);
        assert_eq!(rb.unwrap().len(), 1);

        a.close().await.unwrap();
        b.close().await.unwrap();
        bridge.shutdown().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unanswered_request_times_out() {
        let bridge = spawn_script(SILENT_BRIDGE, 1).await;

        let started = std::time::Instant::now();
        let err = bridge.open_context().await.err().expect("request must time out");
        assert!(matches!(err, TenderScoutError::Network(_)));
        assert!(err.to_string().contains("did not answer"));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(lock(&bridge.inner.pending).is_empty());

        bridge.shutdown().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn missing_command_is_a_config_error() {
        let err = ScraperBridge::spawn(&ScraperConfig {
            bridge_cmd: "ts-definitely-not-a-command".into(),
            bridge_script: "bridge.js".into(),
            working_dir: ".".into(),
            request_timeout_secs: 5,
        })
        .await
        .err()
        .expect("spawn must fail");
        assert!(err.to_string().contains("failed to spawn"));
    }
}
