//! Shared fixtures: a shell-script stand-in for the JDK.
//!
//! The fake `javac` copies `X.java` to `X.class`; the fake `java` executes
//! that file with `/bin/sh`. Test programs are shell scripts whose first
//! line, `: public class X`, names the class and is a no-op for the shell.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use javarena::config::ServiceConfig;
use javarena::event::SessionEvent;
use javarena::session::{Session, SessionState};
use javarena::toolchain::Toolchain;
use tokio::sync::mpsc;

const FAKE_JAVAC: &str = r#"#!/bin/sh
for last; do :; done
src="$last"
if grep -q COMPILE_ERROR "$src"; then
  echo "$src:2: error: ';' expected" >&2
  echo "1 error" >&2
  exit 1
fi
if grep -q COMPILE_HANG "$src"; then
  sleep 30
fi
cp "$src" "${src%.java}.class"
"#;

const FAKE_JAVA: &str = r#"#!/bin/sh
while [ $# -gt 1 ]; do
  if [ "$1" = "-cp" ]; then
    shift
    cp="$1"
  fi
  shift
done
exec /bin/sh "$cp/$1.class"
"#;

/// Directory holding the fake toolchain, written once per test binary so no
/// script is still open for writing while another test forks.
fn bin_dir() -> &'static Path {
    static BIN: OnceLock<PathBuf> = OnceLock::new();
    BIN.get_or_init(|| {
        let dir = tempfile::Builder::new()
            .prefix("javarena-fake-jdk")
            .tempdir()
            .unwrap()
            .into_path();
        for (name, body) in [("javac", FAKE_JAVAC), ("java", FAKE_JAVA)] {
            let path = dir.join(name);
            std::fs::write(&path, body).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        dir
    })
}

pub fn fake_toolchain() -> Toolchain {
    let bin = bin_dir();
    Toolchain::new(bin.join("javac"), bin.join("java"))
}

/// Config with a fake toolchain, a private workspace root and short limits.
pub fn test_config(workspace_root: &Path) -> ServiceConfig {
    let mut config = ServiceConfig::new(workspace_root.to_path_buf(), fake_toolchain());
    config.compile_timeout = Duration::from_secs(5);
    config.run_timeout = Duration::from_secs(5);
    config.kill_grace = Duration::from_millis(200);
    config.drain_timeout = Duration::from_secs(1);
    config
}

/// A test program named `class` running `body` as shell code.
pub fn program(class: &str, body: &str) -> String {
    format!(": public class {class}\n{body}\n")
}

/// Receive events until the end of a run.
pub async fn until_terminal(rx: &mut mpsc::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    tokio::time::timeout(Duration::from_secs(20), async {
        while let Some(event) = rx.recv().await {
            let done = event.is_terminal();
            events.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("run did not finish in time");
    events
}

pub async fn wait_for_state(session: &Session, state: SessionState) {
    tokio::time::timeout(Duration::from_secs(10), async {
        while session.state() != state {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("session never reached {state}, stuck in {}", session.state()));
}

/// Concatenated stdout of `events`.
pub fn stdout_of(events: &[SessionEvent]) -> String {
    stream_of(events, javarena::event::StreamKind::Stdout)
}

pub fn stream_of(events: &[SessionEvent], stream: javarena::event::StreamKind) -> String {
    let mut out = Vec::new();
    for event in events {
        if let SessionEvent::Output(chunk) = event {
            if chunk.stream == stream {
                out.extend_from_slice(&chunk.data);
            }
        }
    }
    String::from_utf8(out).unwrap()
}

/// Names of `ws-*` directories left under `root`.
pub fn leftover_workspaces(root: &Path) -> Vec<String> {
    match std::fs::read_dir(root) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("ws-"))
            .collect(),
        Err(_) => Vec::new(),
    }
}
