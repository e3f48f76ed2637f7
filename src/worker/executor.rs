use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::queue::job::{EmailPayload, Job, JobKind};

/// Type-specific job execution capability. An executor performs the
/// external side effect implied by a job's kind and payload and returns
/// either a result value or a diagnostic message. Executors must not
/// touch queue state; the pool converts their outcome into job
/// transitions.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job: &Job) -> std::result::Result<Value, String>;
}

/// Maps job kinds to executors. Adding a job type is register-only.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<JobKind, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: JobKind, executor: Arc<dyn Executor>) -> &mut Self {
        self.executors.insert(kind, executor);
        self
    }

    pub fn get(&self, kind: JobKind) -> Option<Arc<dyn Executor>> {
        self.executors.get(&kind).cloned()
    }
}

/// Delivery seam for [`EmailExecutor`]. A production deployment wraps
/// an SMTP client here; [`LogMailer`] stands in when none is wired up.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: &EmailPayload) -> std::result::Result<(), String>;
}

/// Records each delivery through the log instead of sending it.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: &EmailPayload) -> std::result::Result<(), String> {
        tracing::info!(to = %mail.to, subject = %mail.subject, "Delivering email");
        Ok(())
    }
}

/// Executor for `SEND_EMAIL` jobs.
pub struct EmailExecutor {
    mailer: Arc<dyn Mailer>,
}

impl EmailExecutor {
    pub fn new(mailer: Arc<dyn Mailer>) -> Self {
        Self { mailer }
    }
}

#[async_trait]
impl Executor for EmailExecutor {
    async fn execute(&self, job: &Job) -> std::result::Result<Value, String> {
        let mail: EmailPayload = serde_json::from_value(job.payload.clone())
            .map_err(|err| format!("invalid email payload: {err}"))?;
        self.mailer.send(&mail).await?;
        Ok(serde_json::json!({ "delivered_to": mail.to }))
    }
}
