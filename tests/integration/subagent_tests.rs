use std::time::Duration;

use agent_gateway::models::subagent::{ReplyMode, RunStatus};
use agent_gateway::models::task::{Task, TaskOrigin};
use agent_gateway::subagent::{spawn_subagent, SpawnRequest, SUBAGENT_CHANNEL};
use agent_gateway::AppError;

use super::test_helpers::{chat, reply_text, wait_until, worker_block, Harness};

fn spawn_request(parent: &str, child: &str, task: &str) -> SpawnRequest {
    SpawnRequest {
        parent_worker_id: parent.into(),
        child_worker_id: child.into(),
        task: task.into(),
        label: None,
        timeout: None,
        reply_mode: None,
        direct_reply: None,
    }
}

async fn pair() -> Harness {
    Harness::start(&[worker_block("alpha", ""), worker_block("beta", "")]).await
}

#[tokio::test]
async fn worker_spawn_request_returns_child_reply_to_parent() {
    let h = pair().await;
    let beta = h.worker("beta");

    let text = reply_text(h.say("alpha", "[spawn:beta:parent] delegate")).await;

    assert_eq!(text, "parent saw: echo: child work");
    assert_eq!(h.script.prompts("beta"), vec!["child work".to_owned()]);
    let runs = h.gw.run_log().list();
    assert_eq!(runs.len(), 1);
    let run = &runs[0];
    assert_eq!(run.status, RunStatus::Done);
    assert_eq!(run.parent_worker_id, "alpha");
    assert_eq!(run.child_worker_id, "beta");
    assert_eq!(run.depth, 1);
    assert_eq!(run.reply_mode, ReplyMode::Parent);
    assert!(h.chat.delivered().is_empty());

    // The child always starts on a fresh managed session.
    let session = beta.current_session().expect("child bound");
    assert!(session.starts_with(beta.sessions().root()));
    assert_eq!(h.script.commands_of("beta", "new_session").len(), 1);
}

#[tokio::test]
async fn direct_reply_goes_to_parent_origin() {
    let h = pair().await;

    let rx = h.submit("alpha", Task::new(chat("room-1"), "[spawn:beta:direct] delegate"));
    let text = reply_text(rx).await;

    assert_eq!(text, "parent saw: echo: child work");
    assert_eq!(
        h.chat.delivered(),
        vec![(chat("room-1"), "echo: child work".to_owned())]
    );
    let run = &h.gw.run_log().list()[0];
    assert_eq!(run.requested_reply_mode, ReplyMode::Direct);
    assert_eq!(run.reply_mode, ReplyMode::Direct);
    assert_eq!(run.direct_target, Some(chat("room-1")));
    assert_eq!(h.gw.pending_direct_replies(), 0);

    let result = &h.script.commands_of("alpha", "subagent_result")[0];
    assert_eq!(result["success"], true);
    assert_eq!(result["data"]["deliveredDirectly"], true);
    assert_eq!(result["data"]["replyMode"], "direct");
}

#[tokio::test]
async fn direct_reply_without_target_is_downgraded() {
    let h = pair().await;

    let rx = h.submit(
        "alpha",
        Task::new(TaskOrigin::channel("chat"), "[spawn:beta:direct] delegate"),
    );
    reply_text(rx).await;

    let run = &h.gw.run_log().list()[0];
    assert_eq!(run.requested_reply_mode, ReplyMode::Direct);
    assert_eq!(run.reply_mode, ReplyMode::Parent);
    assert!(run.direct_target.is_none());
    assert!(h.chat.delivered().is_empty());
}

#[tokio::test]
async fn direct_reply_on_unregistered_channel_is_downgraded() {
    let h = pair().await;
    let origin = TaskOrigin {
        channel: "email".into(),
        conversation_key: Some("thread-4".into()),
        ui_handle: None,
    };

    reply_text(h.submit("alpha", Task::new(origin, "[spawn:beta:direct] delegate"))).await;

    assert_eq!(h.gw.run_log().list()[0].reply_mode, ReplyMode::Parent);
}

#[tokio::test]
async fn spawn_depth_is_bounded() {
    let h = Harness::start(&[
        worker_block("alpha", "max_spawn_depth = 1"),
        worker_block("beta", "max_spawn_depth = 1"),
        worker_block("gamma", "max_spawn_depth = 1"),
    ])
    .await;
    let beta = h.worker("beta");

    let parent = h.say("alpha", "[wait] parent");
    wait_until("parent prompted", || !h.script.prompts("alpha").is_empty()).await;

    let gw = h.gw.clone();
    let first = tokio::spawn(async move {
        spawn_subagent(&gw, spawn_request("alpha", "beta", "[wait] child")).await
    });
    wait_until("child prompted", || !h.script.prompts("beta").is_empty()).await;

    let child = beta.current_task().expect("child executing");
    assert_eq!(child.depth, 1);
    assert_eq!(child.origin.channel, SUBAGENT_CHANNEL);

    let err = spawn_subagent(&h.gw, spawn_request("beta", "gamma", "too deep"))
        .await
        .expect_err("depth limit");
    assert!(matches!(err, AppError::DepthExceeded(_)));
    assert!(h.script.prompts("gamma").is_empty());

    h.script.release(2);
    let outcome = first.await.expect("join").expect("first spawn succeeds");
    assert_eq!(outcome.reply, "echo: [wait] child");
    assert_eq!(h.gw.run_log().get(&outcome.run_id).expect("run").depth, 1);
    reply_text(parent).await;
}

#[tokio::test]
async fn spawn_preconditions() {
    let h = Harness::start(&[
        worker_block("alpha", ""),
        worker_block("beta", "allowed_subagents = []"),
    ])
    .await;

    let err = spawn_subagent(&h.gw, spawn_request("ghost", "beta", "x"))
        .await
        .expect_err("unknown parent");
    assert!(matches!(err, AppError::NotFound(_)));

    let err = spawn_subagent(&h.gw, spawn_request("alpha", "ghost", "x"))
        .await
        .expect_err("unknown child");
    assert!(matches!(err, AppError::NotFound(_)));

    let err = spawn_subagent(&h.gw, spawn_request("alpha", "beta", "x"))
        .await
        .expect_err("idle parent");
    assert!(matches!(err, AppError::Conflict(_)));

    let mut bad_mode = spawn_request("alpha", "beta", "x");
    bad_mode.reply_mode = Some("broadcast".into());
    let err = spawn_subagent(&h.gw, bad_mode).await.expect_err("bad mode");
    assert!(matches!(err, AppError::InvalidRequest(_)));

    let alpha_task = h.say("alpha", "[wait] alpha busy");
    let beta_task = h.say("beta", "[wait] beta busy");
    wait_until("both prompted", || {
        !h.script.prompts("alpha").is_empty() && !h.script.prompts("beta").is_empty()
    })
    .await;

    let err = spawn_subagent(&h.gw, spawn_request("beta", "alpha", "x"))
        .await
        .expect_err("not allowed");
    assert!(matches!(err, AppError::Unauthorized(_)));

    let err = spawn_subagent(&h.gw, spawn_request("alpha", "alpha", "x"))
        .await
        .expect_err("self spawn");
    assert!(matches!(err, AppError::InvalidRequest(_)));

    assert!(h.gw.run_log().list().is_empty());
    h.script.release(2);
    reply_text(alpha_task).await;
    reply_text(beta_task).await;
}

#[tokio::test]
async fn slow_child_times_out_and_run_is_failed() {
    let h = pair().await;
    let parent = h.say("alpha", "[wait] parent");
    wait_until("parent prompted", || !h.script.prompts("alpha").is_empty()).await;

    let mut request = spawn_request("alpha", "beta", "[hang] forever");
    request.timeout = Some(Duration::from_millis(200));
    let err = spawn_subagent(&h.gw, request).await.expect_err("timeout");

    assert!(matches!(err, AppError::Timeout(_)));
    let run = &h.gw.run_log().list()[0];
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.error.is_some());
    h.script.release(1);
    reply_text(parent).await;
}

#[tokio::test]
async fn offline_child_fails_the_run() {
    let h = Harness::start(&[
        worker_block("alpha", ""),
        worker_block("beta", "restart_delay_ms = -1"),
    ])
    .await;
    h.script.kill("beta");
    let beta = h.worker("beta");
    wait_until("beta offline", || beta.is_offline()).await;

    let parent = h.say("alpha", "[spawn:beta:parent] delegate");

    assert!(reply_text(parent).await.starts_with("spawn failed: worker offline"));
    assert_eq!(h.gw.run_log().list()[0].status, RunStatus::Failed);
}
