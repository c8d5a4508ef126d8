mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{
    leftover_workspaces, program, stdout_of, stream_of, test_config, until_terminal, wait_for_state,
};
use javarena::annotate::Review;
use javarena::error::PipelineError;
use javarena::event::{ExitReason, ExitReport, SessionEvent, StreamKind};
use javarena::pipeline::{Engine, RunRequest, Stage};
use javarena::registry::Registry;
use javarena::session::{Session, SessionState};
use javarena::toolchain::Toolchain;
use tokio::sync::mpsc;

struct Harness {
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
    engine: Arc<Engine>,
    registry: Registry,
}

fn harness_with(tune: impl FnOnce(&mut javarena::config::ServiceConfig)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("workspaces");
    let mut config = test_config(&root);
    tune(&mut config);
    Harness {
        _dir: dir,
        root,
        engine: Arc::new(Engine::new(config)),
        registry: Registry::new(16, 64 * 1024),
    }
}

fn harness() -> Harness {
    harness_with(|_| {})
}

fn request(source: String) -> RunRequest {
    RunRequest {
        source,
        stdin: None,
        close_stdin: false,
    }
}

fn exit_of(events: &[SessionEvent]) -> ExitReport {
    match events.last() {
        Some(SessionEvent::Exit(exit)) => exit.clone(),
        other => panic!("run did not end with an exit event: {other:?}"),
    }
}

fn seqs(events: &[SessionEvent]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Output(chunk) => Some(chunk.seq),
            SessionEvent::Diagnostics { seq, .. } | SessionEvent::Review { seq, .. } => Some(*seq),
            SessionEvent::Exit(exit) => Some(exit.seq),
            SessionEvent::Error { .. } => None,
        })
        .collect()
}

#[tokio::test]
async fn echo_program_round_trips_stdin() {
    let h = harness();
    let session = h.registry.open("echo").await;
    let (tx, mut rx) = mpsc::channel(64);

    h.engine
        .start_run(&session, request(program("Echo", "read line\necho \"got $line\"")), tx)
        .unwrap();
    // Arrives while compiling; delivered once the program starts.
    session.write_stdin(Bytes::from_static(b"hello\n")).unwrap();

    let events = until_terminal(&mut rx).await;
    assert_eq!(stdout_of(&events), "got hello\n");
    let exit = exit_of(&events);
    assert_eq!((exit.code, exit.reason), (0, ExitReason::Normal));

    let seqs = seqs(&events);
    assert!(seqs.windows(2).all(|w| w[0] < w[1]), "seq not increasing: {seqs:?}");
    assert_eq!(session.state(), SessionState::Exited);
    assert!(leftover_workspaces(&h.root).is_empty());
}

#[tokio::test]
async fn compile_failure_never_reaches_running() {
    let h = harness();
    let session = h.registry.open("bad").await;
    let (tx, mut rx) = mpsc::channel(64);

    h.engine
        .start_run(&session, request(program("Bad", "# COMPILE_ERROR")), tx)
        .unwrap();
    let events = until_terminal(&mut rx).await;

    let exit = exit_of(&events);
    assert_eq!((exit.code, exit.reason), (1, ExitReason::CompilationError));
    assert!(stdout_of(&events).is_empty());
    assert!(!stream_of(&events, StreamKind::System).contains("Compiled successfully"));

    let report = events
        .iter()
        .find_map(|event| match event {
            SessionEvent::Diagnostics { report, .. } => Some(report.clone()),
            _ => None,
        })
        .expect("diagnostics event");
    assert!(!report.success);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].line, 2);
    assert!(report.diagnostics.starts_with("Bad.java:2: error: ';' expected"));

    let review = events.iter().find_map(|event| match event {
        SessionEvent::Review { review: Review::Rules(r), .. } => Some(r.clone()),
        _ => None,
    });
    assert_eq!(review.map(|r| r.error_type), Some("Missing semicolon".to_string()));
    assert!(leftover_workspaces(&h.root).is_empty());
}

#[tokio::test]
async fn silent_infinite_loop_is_stopped_by_timeout() {
    let h = harness_with(|c| c.run_timeout = Duration::from_millis(700));
    let session = h.registry.open("loop").await;
    let (tx, mut rx) = mpsc::channel(64);

    h.engine
        .start_run(&session, request(program("Spin", "while :; do :; done")), tx)
        .unwrap();
    let events = until_terminal(&mut rx).await;

    let exit = exit_of(&events);
    assert_eq!((exit.code, exit.reason), (124, ExitReason::Timeout));
    assert!(!exit.needs_input);
    assert!(leftover_workspaces(&h.root).is_empty());
}

#[tokio::test]
async fn kill_is_idempotent_and_reports_one_exit() {
    let h = harness();
    let session = h.registry.open("sleepy").await;
    let (tx, mut rx) = mpsc::channel(64);

    h.engine
        .start_run(&session, request(program("Sleepy", "sleep 30 &\necho started\nwait")), tx)
        .unwrap();
    wait_for_state(&session, SessionState::Running).await;

    assert_eq!(session.kill(), Ok(true));
    assert_eq!(session.kill(), Ok(false));
    let events = until_terminal(&mut rx).await;
    let exit = exit_of(&events);
    assert_eq!(exit.reason, ExitReason::Killed);
    assert_eq!(events.iter().filter(|e| matches!(e, SessionEvent::Exit(_))).count(), 1);

    assert_eq!(session.kill(), Ok(false));
    // No second exit shows up later.
    assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv()).await.is_err());
}

#[tokio::test]
async fn kill_during_compilation_stops_the_compiler() {
    let h = harness();
    let session = h.registry.open("hang").await;
    let (tx, mut rx) = mpsc::channel(64);

    h.engine
        .start_run(&session, request(program("Hang", "# COMPILE_HANG")), tx)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(session.state(), SessionState::Compiling);
    assert_eq!(session.kill(), Ok(true));

    let events = until_terminal(&mut rx).await;
    assert_eq!(exit_of(&events).reason, ExitReason::Killed);
    assert!(leftover_workspaces(&h.root).is_empty());
}

#[tokio::test]
async fn compile_timeout_is_reported_as_timeout() {
    let h = harness_with(|c| c.compile_timeout = Duration::from_millis(500));
    let session = h.registry.open("slow-javac").await;
    let (tx, mut rx) = mpsc::channel(64);

    h.engine
        .start_run(&session, request(program("Slow", "# COMPILE_HANG")), tx)
        .unwrap();
    let events = until_terminal(&mut rx).await;
    let exit = exit_of(&events);
    assert_eq!((exit.code, exit.reason), (124, ExitReason::Timeout));
    assert!(stream_of(&events, StreamKind::System).contains("Compilation timed out (500ms limit)"));
}

#[tokio::test]
async fn batch_compile_timeout_names_the_compiler() {
    let h = harness_with(|c| {
        c.compile_timeout = Duration::from_millis(500);
        c.run_timeout = Duration::from_secs(60);
    });
    let outcome = h.engine.run_batch(&program("Slow", "# COMPILE_HANG"), None).await.unwrap();
    assert!(!outcome.success);
    assert_eq!((outcome.exit_code, outcome.reason), (124, ExitReason::Timeout));
    assert_eq!(outcome.stage, Stage::Compile);
    assert_eq!(outcome.error_text(), "Compilation timed out (500ms limit)");
    assert!(leftover_workspaces(&h.root).is_empty());
}

#[tokio::test]
async fn partial_output_survives_a_timeout() {
    let h = harness_with(|c| c.run_timeout = Duration::from_millis(600));
    let session = h.registry.open("partial").await;
    let (tx, mut rx) = mpsc::channel(64);

    h.engine
        .start_run(&session, request(program("Partial", "echo partial\nsleep 30")), tx)
        .unwrap();
    let events = until_terminal(&mut rx).await;
    assert_eq!(stdout_of(&events), "partial\n");
    assert_eq!(exit_of(&events).reason, ExitReason::Timeout);

    let outcome = h
        .engine
        .run_batch(&program("Partial", "echo partial\nsleep 30"), None)
        .await
        .unwrap();
    assert_eq!(outcome.reason, ExitReason::Timeout);
    assert_eq!(outcome.stage, Stage::Run);
    assert_eq!(outcome.stdout, "partial\n");
    assert!(outcome.error_text().ends_with("Execution timeout (600ms limit)"));
}

#[tokio::test]
async fn partial_output_survives_a_crash() {
    let h = harness();
    let session = h.registry.open("crash").await;
    let (tx, mut rx) = mpsc::channel(64);
    let body = "echo before\necho boom >&2\nexit 3";

    h.engine
        .start_run(&session, request(program("Crash", body)), tx)
        .unwrap();
    let events = until_terminal(&mut rx).await;
    assert_eq!(stdout_of(&events), "before\n");
    assert!(stream_of(&events, StreamKind::Stderr).starts_with("boom\n"));
    let exit = exit_of(&events);
    assert_eq!((exit.code, exit.reason), (3, ExitReason::RuntimeError));

    let outcome = h.engine.run_batch(&program("Crash", body), None).await.unwrap();
    assert!(outcome.success);
    assert_eq!((outcome.exit_code, outcome.reason), (3, ExitReason::RuntimeError));
    assert_eq!(outcome.stdout, "before\n");
    assert!(outcome.stderr.starts_with("boom\n"));
}

#[tokio::test]
async fn empty_source_fails_before_anything_is_spawned() {
    let h = harness();
    let err = h.engine.run_batch("  \n", None).await.unwrap_err();
    assert!(matches!(err, PipelineError::EmptySource));

    let session = h.registry.open("empty").await;
    let (tx, mut rx) = mpsc::channel(64);
    h.engine.start_run(&session, request(String::new()), tx).unwrap();
    let events = until_terminal(&mut rx).await;
    match events.last() {
        Some(SessionEvent::Error { message, .. }) => assert_eq!(message, "No code provided"),
        other => panic!("expected error event, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Error);
    assert!(leftover_workspaces(&h.root).is_empty());
}

#[tokio::test]
async fn runtime_error_carries_code_and_review() {
    let h = harness();
    let body = "echo 'Exception in thread \"main\" java.lang.ArithmeticException: / by zero' >&2\n\
                echo '\tat Crash.main(Crash.java:5)' >&2\nexit 1";
    let outcome = h.engine.run_batch(&program("Crash", body), None).await.unwrap();

    // The program ran, so the call succeeded; the exit code says how it ended.
    assert!(outcome.success);
    assert_eq!((outcome.exit_code, outcome.reason), (1, ExitReason::RuntimeError));
    assert!(outcome.stderr.contains("ArithmeticException"));
    match outcome.review {
        Some(Review::Rules(review)) => {
            assert_eq!(review.error_type, "ArithmeticException");
            assert_eq!(review.line, Some(5));
        }
        other => panic!("expected rule review, got {other:?}"),
    }
}

#[tokio::test]
async fn batch_run_feeds_stdin_then_closes_it() {
    let h = harness();
    let body = "while read n; do echo \"n=$n\"; done\necho done";
    let outcome = h
        .engine
        .run_batch(&program("Sum", body), Some("1\n2\n"))
        .await
        .unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.stdout, "n=1\nn=2\ndone\n");
    assert_eq!(outcome.exit_code, 0);
    assert!(outcome.stderr.is_empty());
}

#[tokio::test]
async fn batch_timeout_without_input_hints_that_input_is_needed() {
    let h = harness_with(|c| c.run_timeout = Duration::from_millis(500));
    let body = "# new Scanner(System.in)\nsleep 30";
    let outcome = h.engine.run_batch(&program("Ask", body), None).await.unwrap();
    assert_eq!(outcome.reason, ExitReason::Timeout);
    assert!(outcome.needs_input);
    assert!(outcome.error_text().contains("waiting for input"));

    let outcome = h.engine.run_batch(&program("Idle", "sleep 30"), None).await.unwrap();
    assert!(!outcome.needs_input);
    assert!(outcome.error_text().ends_with("Execution timeout (500ms limit)"));
}

#[tokio::test]
async fn batch_output_is_capped_with_a_marker() {
    let h = harness_with(|c| c.max_output_bytes = 64);
    let body = "i=0\nwhile [ $i -lt 100 ]; do echo \"line $i\"; i=$((i+1)); done";
    let outcome = h.engine.run_batch(&program("Chatty", body), None).await.unwrap();
    assert!(outcome.success);
    assert!(outcome.truncated);
    assert!(outcome.stdout.starts_with("line 0\nline 1\n"));
    assert!(outcome.stdout.ends_with("... output truncated ...\n"));
}

#[tokio::test]
async fn per_stream_order_is_preserved() {
    let h = harness();
    let session = h.registry.open("order").await;
    let (tx, mut rx) = mpsc::channel(8);
    let body = "i=0\nwhile [ $i -lt 500 ]; do echo \"out $i\"; echo \"err $i\" >&2; i=$((i+1)); done";
    h.engine
        .start_run(&session, request(program("Order", body)), tx)
        .unwrap();
    let events = until_terminal(&mut rx).await;

    let expected_out: String = (0..500).map(|i| format!("out {i}\n")).collect();
    let expected_err: String = (0..500).map(|i| format!("err {i}\n")).collect();
    assert_eq!(stdout_of(&events), expected_out);
    assert_eq!(stream_of(&events, StreamKind::Stderr), expected_err);
    assert_eq!(exit_of(&events).reason, ExitReason::Normal);
}

#[tokio::test]
async fn a_new_run_waits_for_the_previous_one() {
    let h = harness();
    let session = h.registry.open("replace").await;
    let (tx, mut rx) = mpsc::channel(64);

    let first = h
        .engine
        .start_run(&session, request(program("First", "sleep 30")), tx.clone())
        .unwrap();
    wait_for_state(&session, SessionState::Running).await;
    assert!(matches!(
        h.engine.start_run(&session, request(program("Nope", "true")), tx.clone()),
        Err(javarena::error::SessionError::InvalidState { .. })
    ));

    session.kill().unwrap();
    session.settled().await;
    let second = h
        .engine
        .start_run(&session, request(program("Second", "echo second")), tx)
        .unwrap();
    assert!(second > first);

    let first_events = until_terminal(&mut rx).await;
    assert!(first_events.iter().all(|e| e.run_id() == Some(first)));
    assert_eq!(exit_of(&first_events).reason, ExitReason::Killed);

    let second_events = until_terminal(&mut rx).await;
    assert!(second_events.iter().all(|e| e.run_id() == Some(second)));
    assert_eq!(stdout_of(&second_events), "second\n");
}

#[tokio::test]
async fn concurrent_sessions_are_isolated() {
    let h = harness();
    let mut runs = Vec::new();
    for name in ["alpha", "beta", "gamma"] {
        let session = h.registry.open(name).await;
        let (tx, rx) = mpsc::channel(64);
        let class = format!("P{name}");
        h.engine
            .start_run(&session, request(program(&class, &format!("read x\necho \"{name}:$x\""))), tx)
            .unwrap();
        session.write_stdin(Bytes::from(format!("{name}-in\n"))).unwrap();
        runs.push((name, rx));
    }
    for (name, mut rx) in runs {
        let events = until_terminal(&mut rx).await;
        assert_eq!(stdout_of(&events), format!("{name}:{name}-in\n"));
    }
    assert!(leftover_workspaces(&h.root).is_empty());
}

#[tokio::test]
async fn over_capacity_runs_fail_fast_as_busy() {
    let h = harness_with(|c| c.max_concurrent_runs = 1);
    let session = h.registry.open("hog").await;
    let (tx, mut rx) = mpsc::channel(64);
    h.engine
        .start_run(&session, request(program("Hog", "sleep 30")), tx)
        .unwrap();
    wait_for_state(&session, SessionState::Running).await;
    assert_eq!(h.engine.active_runs(), 1);

    let err = h.engine.run_batch(&program("Late", "true"), None).await.unwrap_err();
    assert!(matches!(err, PipelineError::Busy(1)));

    h.registry.close("hog").await;
    let events = until_terminal(&mut rx).await;
    assert_eq!(exit_of(&events).reason, ExitReason::Killed);
}

#[tokio::test]
async fn closing_the_session_kills_the_program() {
    let h = harness();
    let session: Arc<Session> = h.registry.open("gone").await;
    let (tx, mut rx) = mpsc::channel(64);
    h.engine
        .start_run(&session, request(program("Gone", "sleep 30")), tx)
        .unwrap();
    wait_for_state(&session, SessionState::Running).await;

    h.registry.close("gone").await;
    let events = until_terminal(&mut rx).await;
    assert_eq!(exit_of(&events).reason, ExitReason::Killed);
    session.join().await;
    assert!(leftover_workspaces(&h.root).is_empty());
}

#[tokio::test]
async fn real_jdk_runs_hello_world() {
    let toolchain = Toolchain::discover(None, None);
    if !toolchain.is_available() {
        eprintln!("skipping: no JDK found");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let mut config = javarena::config::ServiceConfig::new(dir.path().join("ws"), toolchain);
    config.run_timeout = Duration::from_secs(20);
    let engine = Engine::new(config);
    let source = r#"
import java.util.Scanner;

public class Hello {
    public static void main(String[] args) {
        Scanner in = new Scanner(System.in);
        String name = in.nextLine();
        System.out.println("Hello, " + name + " ✓");
    }
}
"#;
    let outcome = engine.run_batch(source, Some("Ada\n")).await.unwrap();
    assert!(outcome.success, "stderr: {}", outcome.stderr);
    assert_eq!(outcome.stdout, "Hello, Ada ✓\n");
}
