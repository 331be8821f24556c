// =============================================================================
// Lint Configuration
// =============================================================================

// Safety: no unsafe anywhere in this crate
#![deny(unsafe_code)]
// Correctness: Must handle all fallible operations
#![deny(unused_must_use)]
// Quality: Pedantic but pragmatic
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(rust_2018_idioms)]
#![warn(unreachable_pub)]
#![allow(missing_debug_implementations)] // Types hold trait objects and rustls configs which lack Debug
#![allow(clippy::missing_errors_doc)] // Error returns self-documenting via type
#![allow(clippy::module_name_repetitions)] // e.g., server::ServerBuilder is clearer
#![allow(clippy::must_use_candidate)] // Not all returned values need annotation
#![allow(clippy::doc_markdown)] // Too many false positives in code docs

//! Library crate for gatehouse - a single-process HTTP/HTTPS front-end that
//! assembles a static graph of named services from declarative configuration
//! and dispatches every inbound request through that graph.
//!
//! A **service** is one of:
//!
//! - an *external* reverse-proxy to a fixed remote origin,
//! - a *network* gateway that dials the request URL's own authority,
//! - a *disk directory* serving (and optionally accepting) files,
//! - a *worker* running a sandboxed script with named bindings.
//!
//! Services reference each other by name; a worker's bindings expose other
//! services as numbered sub-request channels. The [`server::Server`]
//! orchestrator turns a [`config::Config`] into the live graph, binds the
//! configured sockets, and runs until a fatal error.
//!
//! The script execution engine itself is *not* part of this crate: workers
//! talk to it through the [`script::ScriptHost`] /
//! [`script::ScriptHostFactory`] seam, and embedders supply an engine when
//! they construct the server.
//!
//! # Example
//!
//! ```no_run
//! use gatehouse::config::Config;
//! use gatehouse::server::Server;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::load_from("gatehouse.toml".as_ref())?;
//! Server::new().run(config).await?;
//! # Ok(())
//! # }
//! ```

/// Declarative configuration: services, sockets, HTTP options, TLS options.
///
/// All configuration types support serde for TOML parsing and provide
/// defaults matching the wire-level defaults (port 80/443, host-style
/// rewriting, public-only network access).
pub mod config;

/// The script-host seam: traits an embedded script engine implements, plus
/// the compiled global-binding values handed to it.
pub mod script;

/// The request pipeline: orchestrator, service registry, listeners,
/// rewriters, TLS contexts, and the four service implementations.
pub mod server;

/// Small shared pieces: task tracking, JSON string escaping, HTTP dates.
pub mod util;

pub use config::Config;
pub use server::{Server, SocketOverride};
