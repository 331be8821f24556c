//! The gatehouse configuration file.
//!
//! A TOML document declaring named services and the sockets that dispatch
//! into them. Structural decoding happens here; semantic problems (unknown
//! service references, bad addresses, malformed key material) are *not*
//! load errors - the server reports them during assembly and replaces the
//! offending service with one that fails every request, so that unrelated
//! services keep working.

mod types;

use anyhow::{Context, Result};
use std::fmt::Write as _;
use std::path::Path;

pub use types::*;

impl Config {
    /// Load a configuration from a TOML file.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Structural validation: names must be present. Everything else is
    /// diagnosed during service assembly.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        for (i, service) in self.services.iter().enumerate() {
            if service.name.is_empty() {
                problems.push(format!("services[{i}] has an empty name"));
            }
        }
        for (i, socket) in self.sockets.iter().enumerate() {
            if socket.name.is_empty() {
                problems.push(format!("sockets[{i}] has an empty name"));
            }
            if socket.service.name.is_empty() {
                problems.push(format!("sockets[{i}] references a service with an empty name"));
            }
        }

        if problems.is_empty() {
            return Ok(());
        }
        let mut message = String::from("Validation failed:\n");
        for (i, problem) in problems.iter().enumerate() {
            let _ = writeln!(message, "  {}. {problem}", i + 1);
        }
        anyhow::bail!(message)
    }
}
