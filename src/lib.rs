//! webpad - a browser code pad with a live streaming terminal.
//!
//! One binary serves a single-page editor/terminal UI, persists saved files
//! and command transcripts in SQLite, and executes shell commands or saved
//! files as child processes, streaming their output back over a WebSocket.

pub mod cleanup;
pub mod files;
pub mod http_server;
pub mod live;
pub mod pkgspec;
pub mod runner;
pub mod session;
pub mod state;
pub mod store;
