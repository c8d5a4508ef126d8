//! javarena - compile and run untrusted Java over HTTP and WebSocket.
//!
//! Usage:
//!   javarena serve [--port 8080]              # Start HTTP/WebSocket server
//!   javarena run Main.java [--stdin in.txt]   # Run one file locally

#[cfg(not(target_os = "linux"))]
compile_error!("This program only works on Linux.");

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use javarena::config::{default_workspace_root, ServiceConfig};
use javarena::http_server;
use javarena::pipeline::Engine;
use javarena::state::AppState;
use javarena::toolchain::Toolchain;

#[derive(Parser, Debug)]
#[command(name = "javarena")]
#[command(about = "Interactive Java compile-and-run service", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP and WebSocket server
    Serve {
        /// Address to bind
        #[arg(long, env = "JAVARENA_HOST", default_value = "0.0.0.0")]
        host: std::net::IpAddr,

        /// Port to listen on
        #[arg(long, env = "JAVARENA_PORT", default_value = "8080")]
        port: u16,

        #[command(flatten)]
        engine: EngineArgs,
    },
    /// Compile and run one source file, then exit with the program's code
    Run {
        /// Java source file
        file: PathBuf,

        /// File whose contents are fed to the program's stdin
        #[arg(long)]
        stdin: Option<PathBuf>,

        #[command(flatten)]
        engine: EngineArgs,
    },
}

#[derive(Args, Debug)]
struct EngineArgs {
    /// Directory for per-run workspaces
    #[arg(long, env = "JAVARENA_WORKSPACE_ROOT")]
    workspace_root: Option<PathBuf>,

    /// Path to javac
    #[arg(long, env = "JAVARENA_JAVAC")]
    javac: Option<PathBuf>,

    /// Path to java
    #[arg(long, env = "JAVARENA_JAVA")]
    java: Option<PathBuf>,

    /// Maximum JVM heap for user programs
    #[arg(long, env = "JAVARENA_JVM_HEAP", default_value = "256m")]
    jvm_heap: String,

    /// Compile wall-clock limit in seconds
    #[arg(long, env = "JAVARENA_COMPILE_TIMEOUT", default_value = "30")]
    compile_timeout: u64,

    /// Program wall-clock limit in seconds
    #[arg(long, env = "JAVARENA_RUN_TIMEOUT", default_value = "60")]
    run_timeout: u64,

    /// Milliseconds between SIGTERM and SIGKILL
    #[arg(long, env = "JAVARENA_KILL_GRACE_MS", default_value = "500")]
    kill_grace_ms: u64,

    /// Milliseconds to wait for output after the program exits
    #[arg(long, env = "JAVARENA_DRAIN_TIMEOUT_MS", default_value = "2000")]
    drain_timeout_ms: u64,

    /// CPU time limit for programs in seconds
    #[arg(long, env = "JAVARENA_CPU_LIMIT", default_value = "120")]
    cpu_limit: u64,

    /// Maximum file size a program may write, in KB
    #[arg(long, env = "JAVARENA_FSIZE_KB", default_value = "10240")]
    fsize_kb: u64,

    /// Maximum number of open files per program
    #[arg(long, env = "JAVARENA_NOFILE", default_value = "512")]
    nofile: u64,

    /// Process and thread ceiling (RLIMIT_NPROC) for programs; 0 disables it
    #[arg(long, env = "JAVARENA_NPROC", default_value_t = javarena::config::DEFAULT_PROCESS_LIMIT)]
    nproc: u64,

    /// Stdin chunks buffered per run
    #[arg(long, env = "JAVARENA_STDIN_QUEUE", default_value = "256")]
    stdin_queue: usize,

    /// Stdin bytes buffered per run
    #[arg(long, env = "JAVARENA_STDIN_BYTES", default_value = "1048576")]
    stdin_bytes: usize,

    /// Largest websocket message accepted from a client, in bytes
    #[arg(long, env = "JAVARENA_MAX_MESSAGE", default_value = "2097152")]
    max_message: usize,

    /// Events buffered per connection before output pumps block
    #[arg(long, env = "JAVARENA_EVENT_QUEUE", default_value = "256")]
    event_queue: usize,

    /// Per-stream output cap for /api/compile, in bytes
    #[arg(long, env = "JAVARENA_MAX_OUTPUT", default_value = "1048576")]
    max_output: usize,

    /// Programs allowed to compile or run at the same time
    #[arg(long, env = "JAVARENA_MAX_RUNS", default_value = "32")]
    max_runs: usize,

    /// Reject terminal:run while a run is active instead of replacing it
    #[arg(long, env = "JAVARENA_NO_REPLACE")]
    no_replace: bool,

    /// Send bare \n instead of \r\n on the terminal
    #[arg(long, env = "JAVARENA_RAW_NEWLINES")]
    raw_newlines: bool,

    /// Remote error reviewer endpoint
    #[arg(long, env = "JAVARENA_ANNOTATOR_URL")]
    annotator_url: Option<String>,
}

impl EngineArgs {
    fn into_config(self) -> ServiceConfig {
        let mut toolchain = Toolchain::discover(self.javac, self.java);
        toolchain.jvm_heap = self.jvm_heap;

        let root = self.workspace_root.unwrap_or_else(default_workspace_root);
        let mut config = ServiceConfig::new(root, toolchain);
        config.compile_timeout = Duration::from_secs(self.compile_timeout);
        config.run_timeout = Duration::from_secs(self.run_timeout);
        config.kill_grace = Duration::from_millis(self.kill_grace_ms);
        config.drain_timeout = Duration::from_millis(self.drain_timeout_ms);
        config.run_limits.cpu_secs = Some(self.cpu_limit);
        config.run_limits.file_size_kb = Some(self.fsize_kb);
        config.run_limits.open_files = Some(self.nofile);
        config.run_limits.processes = (self.nproc > 0).then_some(self.nproc);
        config.stdin_queue_capacity = self.stdin_queue;
        config.stdin_queue_bytes = self.stdin_bytes;
        config.max_message_bytes = self.max_message;
        config.event_queue_capacity = self.event_queue;
        config.max_output_bytes = self.max_output;
        config.max_concurrent_runs = self.max_runs;
        config.replace_active_run = !self.no_replace;
        config.terminal_newlines = !self.raw_newlines;
        config.annotator_url = self.annotator_url;
        config
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port, engine } => {
            let engine = Engine::new(engine.into_config());
            if let Err(e) = engine.prepare().await {
                eprintln!("Error: cannot prepare workspace root: {}", e);
                exit(1);
            }
            let java_version = engine.config().toolchain.detect_version().await;
            info!(java_version = java_version.as_deref().unwrap_or("not found"), "Java runtime");

            let state = AppState::new(engine, java_version);
            let addr = SocketAddr::new(host, port);
            if let Err(e) = http_server::run_server(addr, state).await {
                eprintln!("Error: {}", e);
                exit(1);
            }
        }
        Commands::Run { file, stdin, engine } => {
            let source = match tokio::fs::read_to_string(&file).await {
                Ok(source) => source,
                Err(e) => {
                    eprintln!("Error: cannot read {}: {}", file.display(), e);
                    exit(1);
                }
            };
            let input = match stdin {
                Some(path) => match tokio::fs::read_to_string(&path).await {
                    Ok(input) => Some(input),
                    Err(e) => {
                        eprintln!("Error: cannot read {}: {}", path.display(), e);
                        exit(1);
                    }
                },
                None => None,
            };

            let engine = Engine::new(engine.into_config());
            match engine.run_batch(&source, input.as_deref()).await {
                Ok(outcome) => {
                    print!("{}", outcome.stdout);
                    let _ = std::io::stdout().flush();
                    let error = outcome.error_text();
                    if !error.is_empty() {
                        eprintln!("{}", error.trim_end());
                    }
                    if let Some(review) = &outcome.review {
                        eprintln!("\n{}", review.render());
                    }
                    exit(outcome.exit_code);
                }
                Err(e) => {
                    eprintln!("Error: {}", e);
                    exit(1);
                }
            }
        }
    }
}
