//! Source materialization: one fresh directory per run holding one `.java` file.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use tracing::{debug, info, warn};

use crate::error::PipelineError;

/// File name used when no public top-level type can be found.
pub const DEFAULT_CLASS_NAME: &str = "Main";

const WORKSPACE_PREFIX: &str = "ws-";

/// An isolated directory holding exactly one compilation unit.
///
/// The directory is removed by [`Workspace::remove`], or on drop as a
/// fallback if the owning run was aborted.
#[derive(Debug)]
pub struct Workspace {
    pub root: PathBuf,
    pub class_name: String,
    pub created_at: SystemTime,
    owned: bool,
}

impl Workspace {
    /// A view of an existing directory that is never deleted by this handle.
    pub fn at(root: impl Into<PathBuf>, class_name: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            class_name: class_name.into(),
            created_at: SystemTime::now(),
            owned: false,
        }
    }

    pub fn source_path(&self) -> PathBuf {
        self.root.join(format!("{}.java", self.class_name))
    }

    pub fn class_path(&self) -> PathBuf {
        self.root.join(format!("{}.class", self.class_name))
    }

    pub async fn remove(mut self) {
        if self.owned {
            self.owned = false;
            match tokio::fs::remove_dir_all(&self.root).await {
                Ok(()) => debug!(path = %self.root.display(), "Removed workspace"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %self.root.display(), error = %e, "Failed to remove workspace"),
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if self.owned {
            let _ = std::fs::remove_dir_all(&self.root);
        }
    }
}

/// Creates workspaces under a dedicated root directory.
#[derive(Debug, Clone)]
pub struct Materializer {
    root: PathBuf,
}

impl Materializer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root and purge workspaces left behind by a previous process.
    pub async fn prepare(&self) -> io::Result<usize> {
        tokio::fs::create_dir_all(&self.root).await?;
        let purged = self.sweep(Duration::ZERO).await;
        if purged > 0 {
            info!(purged, root = %self.root.display(), "Purged stale workspaces");
        }
        Ok(purged)
    }

    pub async fn materialize(
        &self,
        session_id: &str,
        run_id: u64,
        source: &str,
    ) -> Result<Workspace, PipelineError> {
        if source.trim().is_empty() {
            return Err(PipelineError::EmptySource);
        }
        let class_name =
            public_type_name(source).unwrap_or_else(|| DEFAULT_CLASS_NAME.to_string());

        let dir = self
            .root
            .join(format!("{WORKSPACE_PREFIX}{}-{run_id}", sanitize(session_id)));
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| PipelineError::workspace_io(&self.root, e))?;
        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            let _ = tokio::fs::remove_dir_all(&dir).await;
        }
        tokio::fs::create_dir(&dir)
            .await
            .map_err(|e| PipelineError::workspace_io(&dir, e))?;

        // Owned from here on so any failure below removes the directory.
        let workspace = Workspace {
            root: dir,
            class_name,
            created_at: SystemTime::now(),
            owned: true,
        };
        let path = workspace.source_path();
        tokio::fs::write(&path, source)
            .await
            .map_err(|e| PipelineError::workspace_io(&path, e))?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))
            .await
            .map_err(|e| PipelineError::workspace_io(&path, e))?;

        debug!(path = %path.display(), class = %workspace.class_name, "Materialized source");
        Ok(workspace)
    }

    /// Remove `ws-*` directories whose last modification is older than `max_age`.
    pub async fn sweep(&self, max_age: Duration) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let now = SystemTime::now();
        let mut removed = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            if !entry.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else { continue };
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or(Duration::ZERO);
            if meta.is_dir() && age >= max_age && tokio::fs::remove_dir_all(entry.path()).await.is_ok() {
                removed += 1;
            }
        }
        removed
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

#[derive(Debug, PartialEq)]
enum Token {
    Ident(String),
    At,
    Open,
    Close,
    Dash,
    Other,
}

const TYPE_KEYWORDS: &[&str] = &["class", "interface", "enum", "record"];
const MODIFIERS: &[&str] = &["abstract", "final", "static", "sealed", "non", "strictfp"];

/// Name of the first `public` top-level type declared in `source`.
///
/// This is a lexical scan, not a parse: comments and literals are skipped and
/// braces are counted so nested types are ignored.
pub fn public_type_name(source: &str) -> Option<String> {
    let tokens = tokenize(source);
    let mut depth = 0usize;
    let mut i = 0;
    while i < tokens.len() {
        match &tokens[i] {
            Token::Open => depth += 1,
            Token::Close => depth = depth.saturating_sub(1),
            Token::Ident(word) if depth == 0 && word == "public" => {
                if let Some(name) = declared_name(&tokens[i + 1..]) {
                    return Some(name);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

fn declared_name(tokens: &[Token]) -> Option<String> {
    let mut iter = tokens.iter().peekable();
    while let Some(token) = iter.next() {
        match token {
            Token::Ident(w) if MODIFIERS.contains(&w.as_str()) => continue,
            Token::Dash => continue,
            Token::At => {
                if matches!(iter.peek(), Some(Token::Ident(w)) if w == "interface") {
                    iter.next();
                    return next_identifier(iter.next());
                }
                return None;
            }
            Token::Ident(w) if TYPE_KEYWORDS.contains(&w.as_str()) => {
                return next_identifier(iter.next());
            }
            _ => return None,
        }
    }
    None
}

fn next_identifier(token: Option<&Token>) -> Option<String> {
    match token {
        Some(Token::Ident(name))
            if !TYPE_KEYWORDS.contains(&name.as_str()) && !MODIFIERS.contains(&name.as_str()) =>
        {
            Some(name.clone())
        }
        _ => None,
    }
}

fn tokenize(source: &str) -> Vec<Token> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '/' if next == Some('/') => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '/' if next == Some('*') => {
                i += 2;
                while i < chars.len() && !(chars[i] == '*' && chars.get(i + 1) == Some(&'/')) {
                    i += 1;
                }
                i += 2;
            }
            '"' if next == Some('"') && chars.get(i + 2) == Some(&'"') => {
                i += 3;
                while i < chars.len() && !chars[i..].starts_with(&['"', '"', '"']) {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 3;
            }
            '"' | '\'' => {
                i += 1;
                while i < chars.len() && chars[i] != c && chars[i] != '\n' {
                    if chars[i] == '\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            '@' => {
                tokens.push(Token::At);
                i += 1;
            }
            '{' => {
                tokens.push(Token::Open);
                i += 1;
            }
            '}' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Dash);
                i += 1;
            }
            c if c.is_whitespace() => i += 1,
            _ => {
                tokens.push(Token::Other);
                i += 1;
            }
        }
    }
    tokens
}
