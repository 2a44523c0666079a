//! etransfer-server
//!
//! Resumable large-file transfer over tus 1.0, with storage quotas, per-file
//! retention and load-aware endpoint selection.
//!
//! # Modules
//!
//! - `upload`: resumable-upload state machine and its wire types
//! - `backend`: pluggable session-state store (memory, file, sqlite)
//! - `storage`: blob bytes behind each session
//! - `quota`: aggregate storage admission control
//! - `retention`: retention policies, read/delete guards and the expiry sweep
//! - `range`: range reads of possibly-incomplete files
//! - `reload`: runtime settings reload and the config file watch
//! - `traffic`: interface load sampling and endpoint publication
//! - `client`: transfer client and endpoint selector
//! - `routes`: the HTTP surface

pub mod backend;
pub mod client;
pub mod config;
pub mod quota;
pub mod range;
pub mod reload;
pub mod retention;
pub mod routes;
pub mod state;
pub mod storage;
pub mod traffic;
pub mod upload;

pub use config::Config;
pub use routes::router;
pub use state::AppState;
