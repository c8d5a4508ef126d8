//! Locating `javac`/`java` and building their command lines.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::workspace::Workspace;

const FALLBACK_BIN_DIRS: &[&str] = &["/usr/bin", "/usr/local/bin", "/opt/java/bin"];
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Toolchain {
    pub javac: PathBuf,
    pub java: PathBuf,
    /// Value passed to `-Xmx` for user programs.
    pub jvm_heap: String,
    /// Extra JVM flags placed before `-cp`.
    pub jvm_flags: Vec<String>,
}

impl Toolchain {
    pub fn new(javac: impl Into<PathBuf>, java: impl Into<PathBuf>) -> Self {
        Self {
            javac: javac.into(),
            java: java.into(),
            jvm_heap: "256m".to_string(),
            jvm_flags: vec!["-XX:+UseSerialGC".to_string()],
        }
    }

    /// Resolve the JDK binaries: explicit overrides, then `$JAVA_HOME/bin`,
    /// then `PATH`, then a few well-known install directories. Falls back to
    /// bare names so a missing JDK surfaces as a spawn failure per run.
    pub fn discover(javac: Option<PathBuf>, java: Option<PathBuf>) -> Self {
        let javac = javac.or_else(|| locate("javac"));
        let java = java.or_else(|| locate("java"));
        match (&javac, &java) {
            (Some(c), Some(r)) => info!(javac = %c.display(), java = %r.display(), "Found Java toolchain"),
            _ => warn!("Java toolchain not found; runs will fail until javac/java are installed"),
        }
        Self::new(
            javac.unwrap_or_else(|| PathBuf::from("javac")),
            java.unwrap_or_else(|| PathBuf::from("java")),
        )
    }

    pub fn is_available(&self) -> bool {
        self.javac.is_file() && self.java.is_file()
    }

    pub fn compile_command(&self, workspace: &Workspace) -> Vec<String> {
        vec![
            self.javac.to_string_lossy().to_string(),
            "-encoding".to_string(),
            "UTF-8".to_string(),
            "-d".to_string(),
            workspace.root.to_string_lossy().to_string(),
            workspace.source_path().to_string_lossy().to_string(),
        ]
    }

    pub fn run_command(&self, workspace: &Workspace) -> Vec<String> {
        let mut cmd = vec![
            self.java.to_string_lossy().to_string(),
            "-Dfile.encoding=UTF-8".to_string(),
            "-Dsun.stdout.encoding=UTF-8".to_string(),
            "-Dsun.stderr.encoding=UTF-8".to_string(),
            format!("-Xmx{}", self.jvm_heap),
        ];
        cmd.extend(self.jvm_flags.iter().cloned());
        cmd.push("-cp".to_string());
        cmd.push(workspace.root.to_string_lossy().to_string());
        cmd.push(workspace.class_name.clone());
        cmd
    }

    /// First line of `java -version`, if the runtime answers in time.
    pub async fn detect_version(&self) -> Option<String> {
        let output = tokio::time::timeout(
            VERSION_CHECK_TIMEOUT,
            tokio::process::Command::new(&self.java)
                .arg("-version")
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .ok()?
        .ok()?;
        // The JVM prints its version banner on stderr.
        let text = if output.stderr.is_empty() {
            output.stdout
        } else {
            output.stderr
        };
        let line = String::from_utf8_lossy(&text).lines().next()?.trim().to_string();
        debug!(version = %line, "Detected Java version");
        (!line.is_empty()).then_some(line)
    }
}

fn locate(binary: &str) -> Option<PathBuf> {
    if let Some(home) = std::env::var_os("JAVA_HOME") {
        let candidate = Path::new(&home).join("bin").join(binary);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    if let Some(path) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path) {
            let candidate = dir.join(binary);
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    FALLBACK_BIN_DIRS
        .iter()
        .map(|dir| Path::new(dir).join(binary))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspace() -> Workspace {
        Workspace::at("/tmp/ws-abc-1", "Hello")
    }

    #[test]
    fn compile_command_targets_only_the_materialized_file() {
        let tc = Toolchain::new("/jdk/bin/javac", "/jdk/bin/java");
        let cmd = tc.compile_command(&workspace());
        assert_eq!(cmd[0], "/jdk/bin/javac");
        assert_eq!(cmd.last().map(String::as_str), Some("/tmp/ws-abc-1/Hello.java"));
        assert!(cmd.windows(2).any(|w| w[0] == "-d" && w[1] == "/tmp/ws-abc-1"));
    }

    #[test]
    fn run_command_ends_with_classpath_and_class() {
        let mut tc = Toolchain::new("javac", "java");
        tc.jvm_heap = "64m".to_string();
        let cmd = tc.run_command(&workspace());
        assert!(cmd.contains(&"-Xmx64m".to_string()));
        let n = cmd.len();
        assert_eq!(&cmd[n - 3..], &["-cp", "/tmp/ws-abc-1", "Hello"]);
    }
}
