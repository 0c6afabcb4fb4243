//! Applies parsed invocations to the execution queue.

use std::sync::Arc;

use async_trait::async_trait;
use hangman::{CommandJob, EntryId, Envelope, ExecutionQueue, ExitHandle, InvocationHandler};

use crate::cli::{Cli, try_parse_invocation, usage};
use crate::table;

pub struct QueueController {
    queue: Arc<ExecutionQueue<CommandJob>>,
    exit: ExitHandle,
}

impl QueueController {
    pub fn new(queue: Arc<ExecutionQueue<CommandJob>>, exit: ExitHandle) -> Self {
        Self { queue, exit }
    }

    /// Apply `clear`, `kill`, `max` and `list` in that order, then queue the
    /// command. Returns the reply text.
    pub fn apply(&self, cli: Cli, envelope: &Envelope) -> String {
        if !cli.has_work() {
            return usage();
        }

        let mut lines = Vec::new();

        if cli.clear {
            let removed = self.queue.clear_backlog();
            lines.push(format!("Backlog cleared ({removed} removed)."));
        }

        if let Some(id) = cli.kill {
            lines.push(self.kill(EntryId::new(id)));
        }

        if let Some(max) = cli.max {
            self.queue.set_max_parallel(max);
            lines.push(format!("Maximum jobs set to {max}."));
        }

        if cli.list {
            lines.push(self.list(cli.json));
        }

        if !cli.command.is_empty() {
            lines.push(self.enqueue(cli.command, envelope));
        }

        if cli.shutdown {
            lines.push("Shutting down.".to_string());
            self.exit.request_exit();
        }

        lines.join("\n")
    }

    /// Remove the entry first so its slot frees, then kill the process.
    fn kill(&self, id: EntryId) -> String {
        let entry = match self.queue.mark_complete(id) {
            Ok(entry) => entry,
            Err(e) => return format!("Cannot kill {id}: {e}."),
        };
        match entry.kill() {
            Ok(()) => format!("Killed {id}."),
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "Kill failed");
                format!("Cannot kill {id}: {e}.")
            }
        }
    }

    fn list(&self, json: bool) -> String {
        let snapshot = self.queue.snapshot();
        if !json {
            return table::render(&snapshot);
        }
        serde_json::to_string_pretty(&snapshot)
            .unwrap_or_else(|e| format!("Failed to serialize listing: {e}"))
    }

    fn enqueue(&self, command: Vec<String>, envelope: &Envelope) -> String {
        let job = match CommandJob::new(
            command,
            envelope.working_directory.clone(),
            envelope.environment.clone(),
        ) {
            Ok(job) => job,
            Err(e) => return format!("Cannot queue job: {e}."),
        };

        let label = job.to_string();
        match self.queue.enqueue(job) {
            Ok(id) => format!("Queued job {id}: {label}"),
            Err(e) => format!("Cannot queue job: {e}."),
        }
    }
}

#[async_trait]
impl InvocationHandler for QueueController {
    async fn handle(&self, envelope: Envelope) -> String {
        match try_parse_invocation(&envelope.args) {
            Ok(cli) => self.apply(cli, &envelope),
            // Help, version and parse errors all go back as text.
            Err(e) => e.render().to_string().trim_end().to_string(),
        }
    }
}
