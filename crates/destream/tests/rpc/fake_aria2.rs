//! In-process stand-in for an aria2 JSON-RPC WebSocket server.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// URLs failing on their first download only.
    pub fail_once: HashSet<String>,
    /// URLs that never succeed.
    pub fail_always: HashSet<String>,
    /// Report completions in reverse submission order.
    pub reverse_completion: bool,
    /// Send notifications before the reply carrying their gids.
    pub notify_before_ack: bool,
    /// Accept jobs but never finish them.
    pub stall: bool,
    /// Body written for a URL. Defaults to the URL itself.
    pub contents: HashMap<String, Vec<u8>>,
}

pub struct FakeAria2 {
    pub endpoint: String,
    requests: Arc<Mutex<Vec<Value>>>,
    terminal_events: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
}

impl FakeAria2 {
    pub async fn start(behavior: Behavior) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let endpoint = format!("ws://{}/jsonrpc", listener.local_addr()?);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let terminal_events = Arc::new(AtomicUsize::new(0));
        let disconnects = Arc::new(AtomicUsize::new(0));

        tokio::spawn(serve(
            listener,
            behavior,
            requests.clone(),
            terminal_events.clone(),
            disconnects.clone(),
        ));

        Ok(Self {
            endpoint,
            requests,
            terminal_events,
            disconnects,
        })
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<String> {
        self.requests()
            .iter()
            .map(|request| request["method"].as_str().unwrap_or_default().to_string())
            .collect()
    }

    /// Number of complete and error notifications sent so far.
    pub fn terminal_events(&self) -> usize {
        self.terminal_events.load(Ordering::SeqCst)
    }

    /// Number of client connections that have ended.
    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }

    /// Waits until `n` client connections have ended.
    pub async fn wait_for_disconnects(&self, n: usize) -> bool {
        for _ in 0..100 {
            if self.disconnects() >= n {
                return true;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        false
    }
}

struct Job {
    uri: String,
    path: PathBuf,
    dir: String,
}

struct Session {
    behavior: Behavior,
    next_gid: usize,
    jobs: HashMap<String, Job>,
    failed_once: HashSet<String>,
    terminal_events: Arc<AtomicUsize>,
}

fn reply(request: &Value, result: Value) -> String {
    json!({"jsonrpc": "2.0", "id": request["id"], "result": result}).to_string()
}

fn notification(method: &str, gid: &str) -> String {
    json!({"jsonrpc": "2.0", "method": method, "params": [{"gid": gid}]}).to_string()
}

impl Session {
    fn add_uri(&mut self, params: &Value) -> String {
        self.next_gid += 1;
        let gid = format!("{:016x}", self.next_gid);
        let uri = params[0][0].as_str().unwrap_or_default().to_string();
        let dir = params[1]["dir"].as_str().unwrap_or_default().to_string();
        let out = params[1]["out"].as_str().unwrap_or_default();
        let path = PathBuf::from(&dir).join(out);
        self.jobs.insert(gid.clone(), Job { uri, path, dir });
        gid
    }

    fn finish(&mut self, gid: &str) -> Option<String> {
        if self.behavior.stall {
            return None;
        }
        let job = self.jobs.get(gid)?;
        let fails = self.behavior.fail_always.contains(&job.uri)
            || (self.behavior.fail_once.contains(&job.uri)
                && self.failed_once.insert(job.uri.clone()));

        self.terminal_events.fetch_add(1, Ordering::SeqCst);
        if fails {
            return Some(notification("aria2.onDownloadError", gid));
        }

        let body = self
            .behavior
            .contents
            .get(&job.uri)
            .cloned()
            .unwrap_or_else(|| job.uri.as_bytes().to_vec());
        std::fs::write(&job.path, body).unwrap();
        Some(notification("aria2.onDownloadComplete", gid))
    }

    fn respond(&mut self, request: &Value) -> Vec<String> {
        let method = request["method"].as_str().unwrap_or_default();
        match method {
            "system.multicall" => {
                let calls = request["params"][0].as_array().cloned().unwrap_or_default();
                let gids: Vec<String> = calls
                    .iter()
                    .map(|call| self.add_uri(&call["params"]))
                    .collect();

                let ack = reply(request, json!(gids.iter().map(|gid| [gid]).collect::<Vec<_>>()));
                let mut order = gids.clone();
                if self.behavior.reverse_completion {
                    order.reverse();
                }
                let mut notifications: Vec<String> =
                    order.iter().filter_map(|gid| self.finish(gid)).collect();

                if self.behavior.notify_before_ack {
                    notifications.push(ack);
                    notifications
                } else {
                    let mut frames = vec![ack];
                    frames.append(&mut notifications);
                    frames
                }
            }
            "aria2.addUri" => {
                let gid = self.add_uri(&request["params"]);
                let mut frames = vec![reply(request, json!(gid))];
                frames.extend(self.finish(&gid));
                frames
            }
            "aria2.tellStatus" => {
                let gid = request["params"][0].as_str().unwrap_or_default();
                let Some(job) = self.jobs.get(gid) else {
                    return vec![json!({
                        "jsonrpc": "2.0",
                        "id": request["id"],
                        "error": {"code": 1, "message": format!("GID {gid} is not found")}
                    })
                    .to_string()];
                };
                vec![reply(
                    request,
                    json!({
                        "gid": gid,
                        "dir": job.dir,
                        "files": [{
                            "path": job.path.to_string_lossy(),
                            "uris": [{"uri": job.uri, "status": "used"}]
                        }]
                    }),
                )]
            }
            "aria2.getGlobalStat" => vec![reply(
                request,
                json!({"downloadSpeed": "2097152", "numActive": "0"}),
            )],
            "aria2.changeGlobalOption" | "aria2.shutdown" => vec![reply(request, json!("OK"))],
            "aria2.getGlobalOption" => {
                vec![reply(request, json!({"max-concurrent-downloads": "5"}))]
            }
            _ => Vec::new(),
        }
    }
}

async fn serve(
    listener: TcpListener,
    behavior: Behavior,
    requests: Arc<Mutex<Vec<Value>>>,
    terminal_events: Arc<AtomicUsize>,
    disconnects: Arc<AtomicUsize>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        let Ok(mut socket) = accept_async(stream).await else {
            continue;
        };
        let mut session = Session {
            behavior: behavior.clone(),
            next_gid: 0,
            jobs: HashMap::new(),
            failed_once: HashSet::new(),
            terminal_events: terminal_events.clone(),
        };

        while let Some(Ok(message)) = socket.next().await {
            let Message::Text(text) = message else {
                continue;
            };
            let Ok(request) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            requests.lock().unwrap().push(request.clone());

            for frame in session.respond(&request) {
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            if request["method"] == "aria2.shutdown" {
                let _ = socket.close(None).await;
                break;
            }
        }
        disconnects.fetch_add(1, Ordering::SeqCst);
    }
}
