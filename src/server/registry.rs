//! Service registry: name → shared future of a built service.
//!
//! Entries are inserted synchronously while the configuration is being
//! enumerated; construction itself is asynchronous, so services may
//! forward-reference each other freely. Every lookup yields one scheduler
//! tick before reading, which guarantees that every name registered in the
//! same configuration pass is visible - that yield is the registry's whole
//! synchronization contract.

use crate::config::ServiceRef;
use crate::server::error::ErrorReporter;
use crate::server::service::{invalid_config_service, EntrypointLookup, Service};
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// A shareable, multi-subscriber future yielding a built service.
///
/// Construction never fails outright: every error path yields the
/// invalid-config singleton, so awaiting an entry is infallible.
pub type ServiceFuture = Shared<BoxFuture<'static, Arc<dyn Service>>>;

/// The keyed map of service futures.
pub struct ServiceRegistry {
    entries: Mutex<HashMap<String, ServiceFuture>>,
    reporter: ErrorReporter,
}

impl ServiceRegistry {
    pub fn new(reporter: ErrorReporter) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            reporter,
        }
    }

    /// Register a service under `name`. On a duplicate name the first
    /// registration wins and one configuration error is reported.
    pub fn register(
        &self,
        name: &str,
        future: BoxFuture<'static, Arc<dyn Service>>,
    ) -> Option<ServiceFuture> {
        let mut entries = self.entries.lock();
        if entries.contains_key(name) {
            self.reporter
                .report(format!("Config defines multiple services named \"{name}\"."));
            return None;
        }
        let shared = future.shared();
        entries.insert(name.to_string(), shared.clone());
        Some(shared)
    }

    /// Register `name` only if no explicit definition exists. Used for the
    /// implicit `internet` service.
    pub fn register_default(
        &self,
        name: &str,
        future: BoxFuture<'static, Arc<dyn Service>>,
    ) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(name) {
            return false;
        }
        entries.insert(name.to_string(), future.shared());
        true
    }

    /// Late-bound lookup by name (optionally pinning a worker entrypoint).
    ///
    /// Missing names, entrypoints on non-workers, and unknown entrypoints
    /// each report one configuration error and resolve to the
    /// invalid-config service, so the caller always gets *something* to
    /// route requests into.
    pub async fn lookup(&self, reference: &ServiceRef, error_context: String) -> Arc<dyn Service> {
        // One tick, so sibling registrations from this pass are visible.
        tokio::task::yield_now().await;

        let entry = self.entries.lock().get(&reference.name).cloned();
        let Some(entry) = entry else {
            self.reporter.report(format!(
                "{error_context} refers to a service \"{}\", but no such service is defined.",
                reference.name
            ));
            return invalid_config_service();
        };
        let service = entry.await;

        let Some(entrypoint) = &reference.entrypoint else {
            return service;
        };
        match service.lookup_entrypoint(entrypoint) {
            EntrypointLookup::Found(pinned) => pinned,
            EntrypointLookup::NotFound => {
                self.reporter.report(format!(
                    "{error_context} refers to service \"{}\" with a named entrypoint \
                     \"{entrypoint}\", but \"{}\" has no such named entrypoint.",
                    reference.name, reference.name
                ));
                invalid_config_service()
            },
            EntrypointLookup::NotSupported => {
                self.reporter.report(format!(
                    "{error_context} refers to service \"{}\" with a named entrypoint \
                     \"{entrypoint}\", but \"{}\" is not a Worker, so does not have any named \
                     entrypoints.",
                    reference.name, reference.name
                ));
                invalid_config_service()
            },
        }
    }
}
