use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use pentra_core::{
    BackendSet, DecisionEngine, EngineError, EngineEvent, EngineHandle, EngineSettings, EngineState,
    NewRecord, Session, TurnOutcome,
};
use pentra_llm::BackendErrorKind;
use pentra_llm::mock::{MockBackend, MockReply};
use pentra_tools::{
    CommandRunner, CommandStatus, FindingKind, RuleMatchKind, RunnerConfig, SafetyConfig, SafetyPolicy,
    SafetyRuleConfig, Severity, Verdict,
};
use tokio::sync::broadcast;

const NONE_REPLY: &str = "**Analysis:** nothing else to do\n**Command:** none";

fn runner() -> CommandRunner {
    CommandRunner::new(&RunnerConfig {
        shell: "/bin/sh".into(),
        timeout: 30,
        ..RunnerConfig::default()
    })
}

fn engine(backend: MockBackend) -> DecisionEngine {
    engine_with(BackendSet::new().with("mock", backend), "mock")
}

fn engine_with(backends: BackendSet, active: &str) -> DecisionEngine {
    DecisionEngine::new(Session::new(Some("127.0.0.1".into()), active), backends)
        .unwrap()
        .with_runner(runner())
        .with_settings(EngineSettings {
            ai_timeout: Duration::from_secs(10),
            ..EngineSettings::default()
        })
}

const NMAP: &str = "run nmap -sV 127.0.0.1";

fn write_script(path: &Path, body: &str) {
    std::fs::write(path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// A runner whose shell finds stand-in `run` and `nmap` executables in `dir`.
/// The fake `nmap` prints one open http port.
fn stub_runner(dir: &Path) -> CommandRunner {
    write_script(&dir.join("run"), "exec \"$@\"\n");
    write_script(
        &dir.join("nmap"),
        "cat <<'EOF'\nPORT   STATE SERVICE\n80/tcp open  http\nEOF\n",
    );
    let shell = dir.join("shell");
    write_script(
        &shell,
        &format!("PATH=\"{}:$PATH\"\nexport PATH\nexec /bin/sh \"$@\"\n", dir.display()),
    );
    CommandRunner::new(&RunnerConfig {
        shell: shell.display().to_string(),
        timeout: 30,
        ..RunnerConfig::default()
    })
}

fn drain(rx: &mut broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn states(events: &[EngineEvent]) -> Vec<EngineState> {
    events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn nmap_output_becomes_finding_and_next_step_awaits_approval() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockBackend::with_responses(vec![
        "**Analysis:** a web server is listening on port 80\n**Command:** nikto -h 127.0.0.1".into(),
    ]);
    let mut engine = engine(mock.clone()).with_runner(stub_runner(dir.path()));
    let mut events = engine.subscribe();

    let outcome = engine.submit(NMAP).await.unwrap();

    let TurnOutcome::AwaitingApproval(pending) = outcome else {
        panic!("expected approval checkpoint, got {outcome:?}");
    };
    assert_eq!(pending.command, "nikto -h 127.0.0.1");
    assert_eq!(pending.verdict.verdict, Verdict::Confirm);
    assert_eq!(engine.state(), EngineState::AwaitingApproval);

    let session = engine.session();
    assert_eq!(session.records().len(), 1);
    let record = &session.records()[0];
    assert_eq!(record.status, CommandStatus::Exited { code: 0 });
    assert_eq!(record.tool.as_ref().map(|t| t.name.as_str()), Some("nmap"));
    assert!(record.output.contains("80/tcp open  http"));

    assert_eq!(session.findings().len(), 1);
    let finding = &session.findings()[0];
    assert_eq!(finding.record_id, record.id);
    assert_eq!(finding.finding.kind, FindingKind::Service);
    assert_eq!(finding.finding.severity, Severity::Info);
    assert_eq!(finding.finding.description, "80/tcp http");

    let prompt = &mock.calls()[0][1].content;
    assert!(prompt.contains("80/tcp http"));
    assert!(prompt.contains("127.0.0.1"));

    let events = drain(&mut events);
    assert_eq!(
        states(&events),
        vec![
            EngineState::Executing,
            EngineState::Parsing,
            EngineState::AwaitingAiResponse,
            EngineState::AwaitingApproval,
        ]
    );
    assert!(events.iter().any(|e| matches!(e, EngineEvent::FindingAdded(_))));
    assert!(
        events
            .iter()
            .any(|e| matches!(e, EngineEvent::ApprovalRequired { command, .. } if command == "nikto -h 127.0.0.1"))
    );
}

#[tokio::test]
async fn destructive_recommendation_is_blocked_without_executing() {
    for proposed in ["rm -rf /", "rm -rf '/'", "rm -rf \"/\""] {
        let mock = MockBackend::with_responses(vec![format!(
            "**Analysis:** free up disk space\n**Command:** {proposed}"
        )]);
        let mut engine = engine(mock);
        engine.set_auto_execute(true);
        let mut events = engine.subscribe();

        let outcome = engine.submit("echo scanning").await.unwrap();

        let TurnOutcome::Blocked { command, verdict } = outcome else {
            panic!("expected block for {proposed}, got {outcome:?}");
        };
        assert_eq!(command, proposed);
        assert_eq!(verdict.verdict, Verdict::Block);
        assert_eq!(verdict.rule, "root-deletion");
        assert_eq!(engine.state(), EngineState::Idle);
        assert!(engine.pending().is_none());
        assert_eq!(engine.session().records().len(), 1);

        let events = drain(&mut events);
        let started: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                EngineEvent::CommandStarted { command, .. } => Some(command.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec!["echo scanning"]);
        assert!(events.iter().any(|e| matches!(e, EngineEvent::Blocked { .. })));
    }
}

#[tokio::test]
async fn blocked_commands_never_reach_executing() {
    for auto_execute in [false, true] {
        for command in [
            "rm -rf /",
            "rm -rf '/'",
            "rm -rf /*/",
            "dd if=/dev/zero of=/dev/sda",
            ":(){ :|:& };:",
            "mkfs.ext4 /dev/sdb1",
        ] {
            let mut engine = engine(MockBackend::default());
            engine.set_auto_execute(auto_execute);
            let mut events = engine.subscribe();

            let outcome = engine.submit(command).await.unwrap();

            assert!(
                matches!(outcome, TurnOutcome::Blocked { .. }),
                "{command} (auto_execute={auto_execute}) was not blocked: {outcome:?}"
            );
            assert!(engine.session().records().is_empty());
            assert!(!states(&drain(&mut events)).contains(&EngineState::Executing));
        }
    }
}

#[tokio::test]
async fn backend_timeouts_leave_findings_untouched() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockBackend::with_replies(vec![
        MockReply::Text(NONE_REPLY.into()),
        MockReply::Hang,
        MockReply::Hang,
        MockReply::Hang,
    ]);
    let mut engine = engine(mock.clone())
        .with_runner(stub_runner(dir.path()))
        .with_settings(EngineSettings {
            ai_timeout: Duration::from_millis(100),
            ai_attempts: 3,
            ..EngineSettings::default()
        });

    let first = engine.submit(NMAP).await.unwrap();
    assert!(matches!(first, TurnOutcome::Completed { .. }));
    let findings_before = engine.session().findings().to_vec();
    assert_eq!(findings_before.len(), 1);

    let mut events = engine.subscribe();
    let outcome = engine.submit("echo still-here").await.unwrap();

    let TurnOutcome::BackendFailed { kind, record, .. } = outcome else {
        panic!("expected backend failure, got {outcome:?}");
    };
    assert_eq!(kind, BackendErrorKind::BackendUnavailable);
    assert_eq!(record, 2);
    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(engine.session().findings(), findings_before.as_slice());
    assert_eq!(engine.session().records().len(), 2);
    assert_eq!(mock.call_count(), 4);

    let events = drain(&mut events);
    let statuses: Vec<&str> = events
        .iter()
        .filter_map(|e| match e {
            EngineEvent::Status(s) => Some(s.as_str()),
            _ => None,
        })
        .collect();
    assert!(statuses.contains(&"mock timed out (3/3)"));
    assert!(events.iter().any(|e| matches!(
        e,
        EngineEvent::BackendFailed {
            kind: BackendErrorKind::BackendUnavailable,
            ..
        }
    )));

    // the engine is usable again once the backend answers
    let after = engine.submit("echo recovered").await.unwrap();
    assert!(matches!(after, TurnOutcome::Completed { .. }));
}

fn preload(session: &mut Session, count: usize) {
    let now = Utc::now();
    for i in 0..count {
        session.append_record(NewRecord {
            command: format!("echo record-{i}"),
            output: format!("record-{i} {}", "x".repeat(400)),
            tool: None,
            status: CommandStatus::Exited { code: 0 },
            issued_at: now,
            finished_at: now,
        });
    }
}

#[tokio::test]
async fn switching_to_smaller_backend_trims_oldest_history() {
    let big = MockBackend::with_responses(vec![]).with_name("big").with_context_window(200_000);
    let small = MockBackend::with_responses(vec![]).with_name("small").with_context_window(1_000);
    let backends = BackendSet::new().with("big", big.clone()).with("small", small.clone());

    let mut session = Session::new(Some("127.0.0.1".into()), "big");
    preload(&mut session, 10);
    let mut engine = DecisionEngine::new(session, backends)
        .unwrap()
        .with_runner(runner());

    let full = engine.preview_context().render();
    assert!(full.contains("echo record-0"));
    assert!(full.contains("echo record-9"));

    engine.set_backend("small").unwrap();
    assert_eq!(engine.session().active_backend(), "small");
    assert_eq!(engine.session().records().len(), 10);

    let outcome = engine.submit("echo next").await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Completed { .. }));
    assert_eq!(big.call_count(), 0);
    assert_eq!(small.call_count(), 1);

    let prompt = &small.calls()[0][1].content;
    assert!(prompt.contains("echo next"));
    assert!(prompt.contains("echo record-9"));
    assert!(!prompt.contains("echo record-0"));
    let next = prompt.find("echo next").unwrap();
    let newest_preloaded = prompt.find("echo record-9").unwrap();
    assert!(newest_preloaded < next, "history must stay chronological");

    // trimming only affects what is sent
    assert_eq!(engine.session().records().len(), 11);
    assert_eq!(engine.session().records()[0].command, "echo record-0");
}

#[tokio::test]
async fn unknown_backend_is_rejected_and_active_kept() {
    let mut engine = engine(MockBackend::default());
    let err = engine.set_backend("gpt-9").unwrap_err();
    assert!(matches!(err, EngineError::UnknownBackend(ref id) if id == "gpt-9"));
    assert_eq!(engine.session().active_backend(), "mock");
}

#[tokio::test]
async fn missing_executable_is_a_spawn_failure() {
    let mock = MockBackend::default();
    let mut engine = engine(mock.clone());

    let outcome = engine.submit("pentra-no-such-tool --version").await.unwrap();

    let TurnOutcome::SpawnFailed { record, reason } = outcome else {
        panic!("expected spawn failure, got {outcome:?}");
    };
    assert!(!reason.is_empty());
    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(mock.call_count(), 0);
    let record = engine.session().record(record).unwrap();
    assert!(matches!(record.status, CommandStatus::SpawnFailure { .. }));
    assert!(engine.session().findings().is_empty());
}

#[tokio::test]
async fn chain_ending_in_missing_tool_is_still_parsed() {
    let mock = MockBackend::default();
    let mut engine = engine(mock.clone());

    let outcome = engine
        .submit("printf '80/tcp open http\\n'; pentra-no-such-tool")
        .await
        .unwrap();

    let TurnOutcome::Completed { record, .. } = outcome else {
        panic!("expected completed turn, got {outcome:?}");
    };
    let session = engine.session();
    assert_eq!(session.record(record).unwrap().status, CommandStatus::Exited { code: 127 });
    assert_eq!(session.findings().len(), 1);
    assert_eq!(session.findings()[0].finding.description, "80/tcp http");
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test]
async fn empty_backend_answer_completes_without_recommendation() {
    let mut engine = engine(MockBackend::with_responses(vec![String::new()]));
    let outcome = engine.submit("echo hi").await.unwrap();
    assert!(matches!(
        outcome,
        TurnOutcome::Completed {
            recommendation: None,
            ..
        }
    ));
    assert_eq!(engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn rate_limited_backend_surfaces_kind() {
    let mut engine = engine(MockBackend::with_replies(vec![MockReply::RateLimited]));
    let outcome = engine.submit("echo hi").await.unwrap();
    assert!(matches!(
        outcome,
        TurnOutcome::BackendFailed {
            kind: BackendErrorKind::BackendRateLimited,
            ..
        }
    ));
}

#[tokio::test]
async fn streaming_backend_emits_chunks() {
    let mock = MockBackend::with_responses(vec![NONE_REPLY.into()]).with_streaming();
    let mut engine = engine(mock);
    let mut events = engine.subscribe();

    let outcome = engine.submit("echo hi").await.unwrap();

    let TurnOutcome::Completed {
        recommendation: Some(rec),
        ..
    } = outcome
    else {
        panic!("expected completed turn, got {outcome:?}");
    };
    assert!(rec.command.is_none());
    let streamed: String = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            EngineEvent::RecommendationChunk(c) => Some(c),
            _ => None,
        })
        .collect();
    assert!(streamed.contains("nothing else to do"));
}

#[tokio::test]
async fn approval_checkpoint_accepts_and_rejects() {
    let mock = MockBackend::with_responses(vec![
        "**Command:** echo step-one".into(),
        "**Command:** echo step-two".into(),
    ]);
    let mut engine = engine(mock);

    let outcome = engine.submit("echo start").await.unwrap();
    assert!(matches!(outcome, TurnOutcome::AwaitingApproval(_)));
    assert!(matches!(engine.submit("echo other").await, Err(EngineError::Busy(EngineState::AwaitingApproval))));

    let outcome = engine.approve().await.unwrap();
    let TurnOutcome::AwaitingApproval(pending) = outcome else {
        panic!("expected second proposal, got {outcome:?}");
    };
    assert_eq!(pending.command, "echo step-two");
    assert_eq!(engine.session().records()[1].command, "echo step-one");

    let outcome = engine.reject().unwrap();
    assert_eq!(
        outcome,
        TurnOutcome::Rejected {
            command: "echo step-two".into()
        }
    );
    assert_eq!(engine.state(), EngineState::Idle);
    assert_eq!(engine.session().records().len(), 2);
    assert!(matches!(engine.approve().await, Err(EngineError::NothingPending)));
    assert!(matches!(engine.reject(), Err(EngineError::NothingPending)));
}

#[tokio::test]
async fn blank_submission_is_rejected() {
    let mut engine = engine(MockBackend::default());
    assert!(matches!(engine.submit("   ").await, Err(EngineError::EmptyCommand)));
    assert!(matches!(engine.set_target(" "), Err(EngineError::EmptyCommand)));
}

#[tokio::test]
async fn explicit_confirm_rule_holds_operator_command() {
    let safety = SafetyPolicy::from_config(&SafetyConfig {
        auto_execute: true,
        rules: vec![SafetyRuleConfig {
            id: "ask-hydra".into(),
            pattern: "hydra".into(),
            match_kind: RuleMatchKind::Substring,
            verdict: Verdict::Confirm,
        }],
    })
    .unwrap();
    let mut engine = engine(MockBackend::default()).with_safety(safety);

    let outcome = engine.submit("hydra -l admin -P pw.txt ssh://127.0.0.1").await.unwrap();

    let TurnOutcome::AwaitingApproval(pending) = outcome else {
        panic!("expected approval checkpoint, got {outcome:?}");
    };
    assert_eq!(pending.verdict.rule, "ask-hydra");
    assert!(pending.recommendation.is_none());
    assert!(engine.session().records().is_empty());
    assert!(engine.cancel_pending());
    assert_eq!(engine.state(), EngineState::Idle);
}

#[tokio::test]
async fn autosave_writes_loadable_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.json");
    let mut engine = engine(MockBackend::default())
        .with_runner(stub_runner(dir.path()))
        .with_settings(EngineSettings {
            autosave: Some(path.clone()),
            ..EngineSettings::default()
        });

    engine.submit(NMAP).await.unwrap();

    let restored = Session::load(&path).await.unwrap();
    assert_eq!(&restored, engine.session());
    assert_eq!(restored.findings().len(), 1);
}

#[tokio::test]
async fn cancel_kills_running_command() {
    let mock = MockBackend::default();
    let (handle, _task) = EngineHandle::spawn(engine(mock.clone()), 3);
    let mut state = handle.watch_state();

    let submitter = handle.clone();
    let turn = tokio::spawn(async move { submitter.submit_command("sleep 30").await });
    state.wait_for(|s| *s == EngineState::Executing).await.unwrap();

    assert!(!handle.cancel_current().await.unwrap());
    let outcome = tokio::time::timeout(Duration::from_secs(10), turn)
        .await
        .expect("cancel did not stop the command")
        .unwrap()
        .unwrap();

    let TurnOutcome::Cancelled { record: Some(id) } = outcome else {
        panic!("expected cancelled turn, got {outcome:?}");
    };
    assert_eq!(handle.state(), EngineState::Idle);
    let session = handle.snapshot();
    assert_eq!(session.record(id).unwrap().status, CommandStatus::Cancelled);
    assert!(session.findings().is_empty());
    assert_eq!(mock.call_count(), 0);
}

#[tokio::test]
async fn cancel_aborts_backend_call() {
    let mock = MockBackend::hanging();
    let (handle, _task) = EngineHandle::spawn(engine(mock.clone()), 3);
    let mut state = handle.watch_state();

    let submitter = handle.clone();
    let turn = tokio::spawn(async move { submitter.submit_command("echo hi").await });
    state
        .wait_for(|s| *s == EngineState::AwaitingAiResponse)
        .await
        .unwrap();

    handle.cancel_current().await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), turn)
        .await
        .expect("cancel did not abort the backend call")
        .unwrap()
        .unwrap();

    assert!(matches!(outcome, TurnOutcome::Cancelled { record: Some(1) }));
    assert_eq!(handle.state(), EngineState::Idle);
    assert_eq!(mock.call_count(), 1);
}

#[tokio::test]
async fn cancel_discards_pending_command() {
    let mock = MockBackend::with_responses(vec!["**Command:** echo later".into()]);
    let (handle, _task) = EngineHandle::spawn(engine(mock), 3);

    let outcome = handle.submit_command("echo now").await.unwrap();
    assert!(matches!(outcome, TurnOutcome::AwaitingApproval(_)));

    assert!(handle.cancel_current().await.unwrap());
    assert_eq!(handle.state(), EngineState::Idle);
    assert!(handle.pending().is_none());
    assert!(matches!(handle.approve_pending().await, Err(EngineError::NothingPending)));
}

#[tokio::test]
async fn auto_execute_stops_at_step_cap() {
    let mock = MockBackend::with_responses(vec![
        "**Command:** echo step-1".into(),
        "**Command:** echo step-2".into(),
        "**Command:** echo step-3".into(),
    ]);
    let mut engine = engine(mock.clone());
    engine.set_auto_execute(true);
    let (handle, _task) = EngineHandle::spawn(engine, 2);

    let outcome = handle.submit_command("echo start").await.unwrap();

    let TurnOutcome::AwaitingApproval(pending) = outcome else {
        panic!("expected pause at cap, got {outcome:?}");
    };
    assert_eq!(pending.command, "echo step-3");
    assert_eq!(pending.verdict.verdict, Verdict::Allow);
    let commands: Vec<String> = handle
        .snapshot()
        .records()
        .iter()
        .map(|r| r.command.clone())
        .collect();
    assert_eq!(commands, vec!["echo start", "echo step-1", "echo step-2"]);
    assert_eq!(mock.call_count(), 3);

    let outcome = handle.reject_pending().await.unwrap();
    assert!(matches!(outcome, TurnOutcome::Rejected { .. }));
}

#[tokio::test]
async fn auto_execute_never_skips_confirm_rules() {
    let mock = MockBackend::with_responses(vec!["**Command:** reboot".into()]);
    let mut engine = engine(mock);
    engine.set_auto_execute(true);
    let (handle, _task) = EngineHandle::spawn(engine, 5);

    let outcome = handle.submit_command("echo start").await.unwrap();

    let TurnOutcome::AwaitingApproval(pending) = outcome else {
        panic!("expected approval checkpoint, got {outcome:?}");
    };
    assert_eq!(pending.verdict.verdict, Verdict::Confirm);
    assert_eq!(pending.verdict.rule, "power-state");
    assert_eq!(handle.snapshot().records().len(), 1);
}

#[tokio::test]
async fn handle_saves_and_switches_backends() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("snapshot.json");
    let backends = BackendSet::new()
        .with("mock", MockBackend::default())
        .with("other", MockBackend::default().with_name("other"));
    let (handle, task) = EngineHandle::spawn(engine_with(backends, "mock"), 3);

    assert_eq!(handle.backends(), vec!["mock", "other"]);
    handle.set_target("10.10.10.10").await.unwrap();
    handle.set_backend("other").await.unwrap();
    handle.submit_command("echo hi").await.unwrap();
    handle.save(&path).await.unwrap();

    let restored = Session::load(&path).await.unwrap();
    assert_eq!(restored.target(), Some("10.10.10.10"));
    assert_eq!(restored.active_backend(), "other");
    assert_eq!(restored.records().len(), 1);
    assert_eq!(restored.records()[0].target.as_deref(), Some("10.10.10.10"));

    drop(handle);
    let engine = task.await.unwrap();
    assert_eq!(engine.session(), &restored);
}
