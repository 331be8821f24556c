//! Small shared utilities: background task tracking, JSON string escaping,
//! and HTTP date formatting.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{oneshot, Notify};
use tracing::error;

/// What a [`TaskSet`] does when one of its tasks returns an error.
enum FailurePolicy {
    /// Log the error and keep going (connection handlers, waitUntil work).
    Log,
    /// Deliver the first error to a fatal channel; the owner treats it as a
    /// process-level failure.
    Fatal(parking_lot::Mutex<Option<oneshot::Sender<anyhow::Error>>>),
}

struct TaskSetInner {
    active: AtomicUsize,
    notify: Notify,
    policy: FailurePolicy,
}

/// Tracks a set of spawned background tasks.
///
/// `on_empty()` resolves once every task spawned so far has finished, which
/// is how the orchestrator decides the process has drained. Task errors are
/// either logged (the default) or routed to a fatal channel, matching the
/// two uses in the pipeline: per-connection work may fail freely, while an
/// accept loop dying must take the server down.
#[derive(Clone)]
pub struct TaskSet {
    inner: Arc<TaskSetInner>,
}

impl Default for TaskSet {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskSet {
    /// A task set whose failures are logged and swallowed.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TaskSetInner {
                active: AtomicUsize::new(0),
                notify: Notify::new(),
                policy: FailurePolicy::Log,
            }),
        }
    }

    /// A task set whose first failure is delivered to `fatal`.
    pub fn with_fatal(fatal: oneshot::Sender<anyhow::Error>) -> Self {
        Self {
            inner: Arc::new(TaskSetInner {
                active: AtomicUsize::new(0),
                notify: Notify::new(),
                policy: FailurePolicy::Fatal(parking_lot::Mutex::new(Some(fatal))),
            }),
        }
    }

    /// Spawn `fut` onto the runtime and track it until completion.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let inner = self.inner.clone();
        inner.active.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let result = fut.await;
            if let Err(e) = result {
                match &inner.policy {
                    FailurePolicy::Log => error!("task failed: {e:#}"),
                    FailurePolicy::Fatal(slot) => {
                        if let Some(tx) = slot.lock().take() {
                            let _ = tx.send(e);
                        } else {
                            error!("task failed after fatal error: {e:#}");
                        }
                    },
                }
            }
            inner.active.fetch_sub(1, Ordering::SeqCst);
            inner.notify.notify_waiters();
        });
    }

    /// Number of tasks currently running.
    pub fn len(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Whether no tasks are currently running.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves when the task count reaches zero.
    pub async fn on_empty(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Escape `text` for embedding inside a JSON string literal.
///
/// Uses the two-character escapes for `"`, `\`, backspace, form feed,
/// newline, carriage return and tab, and `\u00XX` for all other control
/// characters. Everything else (including non-ASCII) passes through as
/// UTF-8.
pub fn escape_json_string(text: &str) -> String {
    const HEXDIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut escaped = String::with_capacity(text.len() + 2);

    for c in text.chars() {
        match c {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\u{0008}' => escaped.push_str("\\b"),
            '\u{000C}' => escaped.push_str("\\f"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let code = c as u32;
                escaped.push_str("\\u00");
                escaped.push(HEXDIGITS[(code / 16) as usize] as char);
                escaped.push(HEXDIGITS[(code % 16) as usize] as char);
            },
            c => escaped.push(c),
        }
    }

    escaped
}

/// Render a timestamp in the format HTTP likes to use (RFC 1123, GMT).
pub fn http_time(time: SystemTime) -> String {
    let time: DateTime<Utc> = time.into();
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}
