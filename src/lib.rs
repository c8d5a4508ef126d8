//! Compile and run untrusted Java programs, streaming their I/O to many
//! concurrent terminal sessions.

pub mod annotate;
pub mod compiler;
pub mod config;
pub mod error;
pub mod event;
pub mod http_server;
pub mod pipeline;
pub mod process;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod session;
pub mod state;
pub mod terminal;
pub mod terminate;
pub mod toolchain;
pub mod workspace;
