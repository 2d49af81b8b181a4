//! Shared fixtures for gateway integration tests.
//!
//! [`FakeLauncher`] plugs an in-memory worker into the gateway through the
//! launcher seam. The fake speaks the line protocol over duplex pipes and
//! is steered by markers in prompt text:
//!
//! - `[wait]`: answer only after [`FakeScript::release`].
//! - `[hang]`: start work but never answer.
//!
//! Prompts run one at a time per process; a prompt sent while another is
//! still running starts only after it ends.
//! - `[notify]`: emit a `notify` UI request and nothing else.
//! - `[dialog]`: emit a `confirm` UI request and nothing else.
//! - `[spawn:<agent>:<mode>]`: request a subagent and echo its reply.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use agent_gateway::channel::ChannelAdapter;
use agent_gateway::models::task::{Task, TaskOrigin, TaskReply};
use agent_gateway::worker::{LaunchedProcess, Launcher, SpawnSpec, Worker};
use agent_gateway::{Gateway, GlobalConfig, Result};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio_util::sync::CancellationToken;

// ── Fake worker ──────────────────────────────────────────────────────────────

/// Shared control surface over every fake process.
pub struct FakeScript {
    native_root: PathBuf,
    gate: Semaphore,
    commands: Mutex<Vec<(String, Value)>>,
    kills: Mutex<HashMap<String, CancellationToken>>,
    launches: Mutex<HashMap<String, usize>>,
    refused: Mutex<HashSet<String>>,
}

impl FakeScript {
    fn new(native_root: PathBuf) -> Self {
        Self {
            native_root,
            gate: Semaphore::new(0),
            commands: Mutex::new(Vec::new()),
            kills: Mutex::new(HashMap::new()),
            launches: Mutex::new(HashMap::new()),
            refused: Mutex::new(HashSet::new()),
        }
    }

    /// Let `n` `[wait]` prompts finish.
    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    /// Simulate a crash of the worker's current process.
    pub fn kill(&self, worker_id: &str) {
        if let Some(token) = self.kills.lock().unwrap().get(worker_id) {
            token.cancel();
        }
    }

    /// Make future launches of `worker_id` fail.
    pub fn refuse_launch(&self, worker_id: &str) {
        self.refused.lock().unwrap().insert(worker_id.to_owned());
    }

    /// Number of launches of `worker_id`.
    pub fn launches(&self, worker_id: &str) -> usize {
        self.launches.lock().unwrap().get(worker_id).copied().unwrap_or(0)
    }

    /// Every line `worker_id` received, in order.
    pub fn commands(&self, worker_id: &str) -> Vec<Value> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .filter(|(w, _)| w == worker_id)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Lines of one `type` received by `worker_id`.
    pub fn commands_of(&self, worker_id: &str, kind: &str) -> Vec<Value> {
        self.commands(worker_id)
            .into_iter()
            .filter(|v| v["type"] == kind)
            .collect()
    }

    /// Prompt texts received by `worker_id`, in order.
    pub fn prompts(&self, worker_id: &str) -> Vec<String> {
        self.commands_of(worker_id, "prompt")
            .iter()
            .filter_map(|v| v["message"].as_str().map(str::to_owned))
            .collect()
    }

    /// Native (unmanaged) session directory of `worker_id`.
    pub fn native_dir(&self, worker_id: &str) -> PathBuf {
        self.native_root.join(worker_id)
    }
}

/// Launcher producing in-memory fake workers.
pub struct FakeLauncher(pub Arc<FakeScript>);

impl Launcher for FakeLauncher {
    fn launch<'a>(
        &'a self,
        worker_id: &'a str,
        _spec: &'a SpawnSpec,
    ) -> Pin<Box<dyn Future<Output = Result<LaunchedProcess>> + Send + 'a>> {
        Box::pin(async move {
            let script = Arc::clone(&self.0);
            *script
                .launches
                .lock()
                .unwrap()
                .entry(worker_id.to_owned())
                .or_default() += 1;
            if script.refused.lock().unwrap().contains(worker_id) {
                return Err(agent_gateway::AppError::Io("launch refused".into()));
            }

            let native_dir = script.native_dir(worker_id);
            std::fs::create_dir_all(&native_dir).unwrap();
            let initial = native_dir.join("initial.jsonl");
            std::fs::write(&initial, "{\"type\":\"session\"}\n").unwrap();

            let kill = CancellationToken::new();
            script
                .kills
                .lock()
                .unwrap()
                .insert(worker_id.to_owned(), kill.clone());

            let (gw_stdin, fake_stdin) = tokio::io::duplex(64 * 1024);
            let (fake_stdout, gw_stdout) = tokio::io::duplex(64 * 1024);

            let fake = Arc::new(FakeWorker {
                worker_id: worker_id.to_owned(),
                native_dir,
                script,
                kill: kill.clone(),
                state: Mutex::new(FakeState {
                    session_file: initial,
                    messages: Vec::new(),
                    subagent_waiters: HashMap::new(),
                }),
                seq: AtomicUsize::new(0),
                run_lock: tokio::sync::Mutex::new(()),
            });
            tokio::spawn(run_fake(fake, fake_stdin, fake_stdout));

            let exit = Box::pin(async move {
                kill.cancelled().await;
                "process exited with code 1".to_owned()
            });

            Ok(LaunchedProcess {
                pid: None,
                stdin: Box::new(gw_stdin),
                stdout: Box::new(gw_stdout),
                exit,
            })
        })
    }
}

struct FakeState {
    session_file: PathBuf,
    messages: Vec<Value>,
    subagent_waiters: HashMap<String, oneshot::Sender<Value>>,
}

struct FakeWorker {
    worker_id: String,
    native_dir: PathBuf,
    script: Arc<FakeScript>,
    kill: CancellationToken,
    state: Mutex<FakeState>,
    seq: AtomicUsize,
    /// Prompts run one after another, like a real agent.
    run_lock: tokio::sync::Mutex<()>,
}

type Out = mpsc::UnboundedSender<Value>;

async fn run_fake(fake: Arc<FakeWorker>, stdin: DuplexStream, mut stdout: DuplexStream) {
    let (tx, mut rx) = mpsc::unbounded_channel::<Value>();

    let writer_kill = fake.kill.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = writer_kill.cancelled() => break,
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    let mut line = msg.to_string();
                    line.push('\n');
                    if stdout.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut lines = BufReader::new(stdin).lines();
    loop {
        tokio::select! {
            () = fake.kill.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => handle_line(&fake, &tx, &line),
                _ => break,
            },
        }
    }
}

fn respond(tx: &Out, msg: &Value, data: Value) {
    let _ = tx.send(json!({
        "type": "response",
        "id": msg["id"],
        "command": msg["type"],
        "success": true,
        "data": data,
    }));
}

fn respond_err(tx: &Out, msg: &Value, error: &str) {
    let _ = tx.send(json!({
        "type": "response",
        "id": msg["id"],
        "command": msg["type"],
        "success": false,
        "error": error,
    }));
}

fn handle_line(fake: &Arc<FakeWorker>, tx: &Out, line: &str) {
    let msg: Value = serde_json::from_str(line).unwrap();
    fake.script
        .commands
        .lock()
        .unwrap()
        .push((fake.worker_id.clone(), msg.clone()));

    match msg["type"].as_str().unwrap_or_default() {
        "get_state" => {
            let state = fake.state.lock().unwrap();
            respond(
                tx,
                &msg,
                json!({
                    "sessionFile": state.session_file,
                    "messageCount": state.messages.len(),
                }),
            );
        }
        "get_messages" => {
            let messages = fake.state.lock().unwrap().messages.clone();
            respond(tx, &msg, json!({ "messages": messages }));
        }
        "new_session" => {
            let n = fake.seq.fetch_add(1, Ordering::SeqCst) + 1;
            let path = fake.native_dir.join(format!("native-{n}.jsonl"));
            std::fs::write(&path, "{\"type\":\"session\"}\n").unwrap();
            let mut state = fake.state.lock().unwrap();
            state.session_file = path;
            state.messages.clear();
            respond(tx, &msg, json!({ "cancelled": false }));
        }
        "switch_session" => {
            let path = PathBuf::from(msg["sessionPath"].as_str().unwrap_or_default());
            if path.is_file() {
                fake.state.lock().unwrap().session_file = path;
                respond(tx, &msg, json!({ "cancelled": false }));
            } else {
                respond_err(tx, &msg, "session file not found");
            }
        }
        "prompt" => {
            let text = msg["message"].as_str().unwrap_or_default().to_owned();
            fake.state
                .lock()
                .unwrap()
                .messages
                .push(json!({ "role": "user", "content": text }));
            tokio::spawn(run_prompt(Arc::clone(fake), tx.clone(), text));
        }
        "subagent_result" => {
            let id = msg["id"].as_str().unwrap_or_default().to_owned();
            if let Some(waiter) = fake.state.lock().unwrap().subagent_waiters.remove(&id) {
                let _ = waiter.send(msg.clone());
            }
        }
        _ => {}
    }
}

fn spawn_marker(text: &str) -> Option<(String, String)> {
    let start = text.find("[spawn:")? + "[spawn:".len();
    let end = start + text[start..].find(']')?;
    let (agent, mode) = text[start..end].split_once(':')?;
    Some((agent.to_owned(), mode.to_owned()))
}

async fn run_prompt(fake: Arc<FakeWorker>, tx: Out, text: String) {
    if text.contains("[notify]") {
        let _ = tx.send(json!({
            "type": "extension_ui_request",
            "id": "ui-notify",
            "method": "notify",
            "message": "status: all good",
        }));
        return;
    }
    if text.contains("[dialog]") {
        let _ = tx.send(json!({
            "type": "extension_ui_request",
            "id": "ui-confirm",
            "method": "confirm",
            "title": "Proceed?",
        }));
        return;
    }

    let _run = fake.run_lock.lock().await;
    let _ = tx.send(json!({ "type": "agent_start" }));
    if text.contains("[hang]") {
        fake.kill.cancelled().await;
        return;
    }
    if text.contains("[wait]") {
        fake.script.gate.acquire().await.unwrap().forget();
    }

    let reply = if let Some((agent, mode)) = spawn_marker(&text) {
        let (waiter_tx, waiter_rx) = oneshot::channel();
        let id = format!("sub-{}", fake.seq.fetch_add(1, Ordering::SeqCst));
        fake.state
            .lock()
            .unwrap()
            .subagent_waiters
            .insert(id.clone(), waiter_tx);
        let _ = tx.send(json!({
            "type": "subagent_request",
            "id": id,
            "agentId": agent,
            "task": "child work",
            "replyMode": mode,
        }));
        match waiter_rx.await {
            Ok(result) if result["success"] == true => {
                format!("parent saw: {}", result["data"]["reply"].as_str().unwrap_or_default())
            }
            Ok(result) => format!("spawn failed: {}", result["error"].as_str().unwrap_or_default()),
            Err(_) => "spawn lost".to_owned(),
        }
    } else {
        format!("echo: {text}")
    };

    let assistant = json!({
        "role": "assistant",
        "content": [{ "type": "text", "text": reply }],
    });
    fake.state.lock().unwrap().messages.push(assistant.clone());
    let _ = tx.send(json!({ "type": "message_update" }));
    let _ = tx.send(json!({ "type": "message_end", "message": assistant }));
    let _ = tx.send(json!({ "type": "agent_end", "messages": [assistant] }));
}

// ── Channel ──────────────────────────────────────────────────────────────────

/// Channel adapter recording every delivery.
#[derive(Default)]
pub struct RecordingChannel {
    delivered: Mutex<Vec<(TaskOrigin, String)>>,
}

impl RecordingChannel {
    /// Deliveries so far.
    pub fn delivered(&self) -> Vec<(TaskOrigin, String)> {
        self.delivered.lock().unwrap().clone()
    }
}

impl ChannelAdapter for RecordingChannel {
    fn deliver(
        &self,
        target: &TaskOrigin,
        text: &str,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        self.delivered
            .lock()
            .unwrap()
            .push((target.clone(), text.to_owned()));
        Box::pin(async { Ok(()) })
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

/// A started gateway over fake workers.
pub struct Harness {
    pub gw: Gateway,
    pub script: Arc<FakeScript>,
    pub chat: Arc<RecordingChannel>,
    pub temp: TempDir,
}

/// `[[workers]]` block for a fake worker; `extra` lines override defaults.
pub fn worker_block(id: &str, extra: &str) -> String {
    let mut block = format!(
        "[[workers]]\nid = \"{id}\"\ncwd = \".\"\ncommand = \"fake-agent\"\nargs = [\"--session-dir\", \"{{session_dir}}\", \"--id\", \"{{worker_id}}\"]\n"
    );
    for (key, default) in [
        ("request_timeout_ms", "2000"),
        ("restart_delay_ms", "200"),
        ("allowed_subagents", "[\"*\"]"),
    ] {
        if !extra.contains(key) {
            block.push_str(&format!("{key} = {default}\n"));
        }
    }
    block.push_str(extra);
    block.push('\n');
    block
}

impl Harness {
    /// Start a gateway with the given worker blocks. One must be `alpha`.
    pub async fn start(blocks: &[String]) -> Self {
        let temp = tempfile::tempdir().unwrap();
        let data_dir = temp.path().join("data");
        let toml = format!(
            "data_dir = '{}'\nhttp_port = 0\ndefault_worker = \"alpha\"\n\n{}",
            data_dir.display(),
            blocks.join("\n")
        );
        let config = GlobalConfig::from_toml_str(&toml).expect("valid test config");

        let script = Arc::new(FakeScript::new(temp.path().join("native")));
        let gw = Gateway::new(config, Arc::new(FakeLauncher(Arc::clone(&script)))).unwrap();
        let chat = Arc::new(RecordingChannel::default());
        gw.register_channel("chat", chat.clone());
        gw.start().await;

        Self {
            gw,
            script,
            chat,
            temp,
        }
    }

    /// Single-worker gateway with default settings.
    pub async fn single() -> Self {
        Self::start(&[worker_block("alpha", "")]).await
    }

    pub fn worker(&self, id: &str) -> Arc<Worker> {
        self.gw.worker(id).expect("worker exists")
    }

    /// Submit `text` from `origin` and return the reply receiver.
    pub fn submit(&self, worker_id: &str, task: Task) -> oneshot::Receiver<TaskReply> {
        let (tx, rx) = oneshot::channel();
        let task = task.with_reply(move |reply| {
            let _ = tx.send(reply);
        });
        self.gw.enqueue(worker_id, task).expect("task accepted");
        rx
    }

    /// Submit plain `text` on the `chat` channel without a conversation.
    pub fn say(&self, worker_id: &str, text: &str) -> oneshot::Receiver<TaskReply> {
        self.submit(worker_id, Task::new(TaskOrigin::channel("chat"), text))
    }
}

/// Origin on the `chat` channel bound to conversation `key`.
pub fn chat(key: &str) -> TaskOrigin {
    TaskOrigin {
        channel: "chat".into(),
        conversation_key: Some(key.into()),
        ui_handle: None,
    }
}

/// Await a reply with a generous deadline.
pub async fn reply(rx: oneshot::Receiver<TaskReply>) -> TaskReply {
    tokio::time::timeout(Duration::from_secs(5), rx)
        .await
        .expect("reply in time")
        .expect("reply sent")
}

/// Reply text of a completed task.
pub async fn reply_text(rx: oneshot::Receiver<TaskReply>) -> String {
    match reply(rx).await {
        TaskReply::Completed { text, .. } => text,
        TaskReply::Failed { message } => panic!("task failed: {message}"),
    }
}

/// Poll `cond` until it holds, failing after five seconds.
pub async fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

