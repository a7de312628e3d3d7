use std::io::{self, Write};

use anyhow::Result;
use crossterm::{
    execute,
    style::{Color, Print, ResetColor, SetForegroundColor},
};

use tipoff_core::{JobRecord, JobStatus, LineageNode, NodeId, ProcessingStatus, SourceRecord};

/// Color scheme for terminal output.
struct Colors;

impl Colors {
    const SUCCESS: Color = Color::Green;
    const PARTIAL: Color = Color::Yellow;
    const ERROR: Color = Color::Red;
    const DIM: Color = Color::DarkGrey;
    const HEADER: Color = Color::Magenta;
}

fn status_color(status: Option<JobStatus>) -> Color {
    match status {
        Some(JobStatus::Success) => Colors::SUCCESS,
        Some(JobStatus::PartialFailure) => Colors::PARTIAL,
        Some(JobStatus::Failed) | None => Colors::ERROR,
    }
}

fn status_label(status: Option<JobStatus>) -> &'static str {
    match status {
        Some(JobStatus::Success) => "success",
        Some(JobStatus::PartialFailure) => "partial failure",
        Some(JobStatus::Failed) => "failed",
        None => "running",
    }
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}

/// Writes job reports and lineage listings to stdout.
pub struct Terminal {
    json: bool,
}

impl Terminal {
    pub fn new(json: bool) -> Self {
        Self { json }
    }

    /// Print a finished job: header line, changes, failures.
    pub fn print_job(&self, job: &JobRecord) -> Result<()> {
        let mut stdout = io::stdout();
        if self.json {
            writeln!(stdout, "{}", serde_json::to_string_pretty(job)?)?;
            stdout.flush()?;
            return Ok(());
        }

        execute!(
            stdout,
            SetForegroundColor(status_color(job.status)),
            Print(format!("{} {}", job.job_type, status_label(job.status))),
            ResetColor,
            SetForegroundColor(Colors::DIM),
            Print(format!(
                "  job={} duration={}ms executed={} changes={}\n",
                job.job_id,
                job.duration_ms().unwrap_or_default(),
                job.executed_nodes.len(),
                job.changes.len(),
            )),
            ResetColor,
        )?;

        for change in &job.changes {
            let old = change.old_hash.as_deref().map(short_hash).unwrap_or("new");
            execute!(
                stdout,
                Print(format!(
                    "  changed {:<28} {} -> {}  affects [{}]\n",
                    change.source_id,
                    old,
                    short_hash(&change.new_hash),
                    change.affected_node_ids.join(", "),
                )),
            )?;
        }

        for failure in &job.failures {
            execute!(
                stdout,
                SetForegroundColor(Colors::ERROR),
                Print(format!(
                    "  failed  {:<28} [{}] {}\n",
                    failure.id, failure.kind, failure.message
                )),
                ResetColor,
            )?;
        }

        stdout.flush()?;
        Ok(())
    }

    /// Print tracked sources, stale nodes and the most recent jobs.
    pub fn print_status(
        &self,
        sources: &[SourceRecord],
        stale: &[NodeId],
        jobs: &[JobRecord],
    ) -> Result<()> {
        let mut stdout = io::stdout();
        if self.json {
            let doc = serde_json::json!({
                "sources": sources,
                "stale_nodes": stale,
                "jobs": jobs,
            });
            writeln!(stdout, "{}", serde_json::to_string_pretty(&doc)?)?;
            stdout.flush()?;
            return Ok(());
        }

        execute!(
            stdout,
            SetForegroundColor(Colors::HEADER),
            Print("Sources:\n"),
            SetForegroundColor(Colors::DIM),
            Print(format!(
                "{:<28} {:<14} {:<10} {:<6} {:<12}\n",
                "ID", "TYPE", "STATUS", "DIRTY", "HASH"
            )),
            Print(format!("{}\n", "-".repeat(74))),
            ResetColor,
        )?;
        if sources.is_empty() {
            execute!(stdout, Print("(none tracked)\n"))?;
        }
        for s in sources {
            let color = match s.processing_status {
                ProcessingStatus::Processed => Colors::SUCCESS,
                ProcessingStatus::Pending => Colors::PARTIAL,
                ProcessingStatus::Failed => Colors::ERROR,
            };
            execute!(
                stdout,
                Print(format!("{:<28} {:<14} ", s.source_id, s.source_type)),
                SetForegroundColor(color),
                Print(format!("{:<10} ", format!("{:?}", s.processing_status))),
                ResetColor,
                Print(format!(
                    "{:<6} {:<12}\n",
                    if s.is_dirty() { "yes" } else { "no" },
                    short_hash(&s.content_hash),
                )),
            )?;
        }

        execute!(
            stdout,
            SetForegroundColor(Colors::HEADER),
            Print("\nStale nodes:\n"),
            ResetColor,
            Print(if stale.is_empty() {
                "(none)\n".to_string()
            } else {
                format!("{}\n", stale.join(", "))
            }),
            SetForegroundColor(Colors::HEADER),
            Print("\nRecent jobs:\n"),
            ResetColor,
        )?;
        for job in jobs {
            execute!(
                stdout,
                SetForegroundColor(status_color(job.status)),
                Print(format!("{:<16}", status_label(job.status))),
                ResetColor,
                Print(format!(
                    " {:<10} {}  {}\n",
                    job.job_type.to_string(),
                    job.started_at.format("%Y-%m-%d %H:%M:%S"),
                    job.error_summary.as_deref().unwrap_or(""),
                )),
            )?;
        }

        stdout.flush()?;
        Ok(())
    }

    /// Print nodes in dependency order with their inputs.
    pub fn print_graph(&self, nodes: &[LineageNode]) -> Result<()> {
        let mut stdout = io::stdout();
        if self.json {
            writeln!(stdout, "{}", serde_json::to_string_pretty(nodes)?)?;
            stdout.flush()?;
            return Ok(());
        }

        for node in nodes {
            let computed = node
                .last_computed_at
                .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string());
            execute!(
                stdout,
                Print(format!("{:<24} {:<8} v{:<3}", node.node_id, node.node_kind.to_string(), node.generator_version)),
                SetForegroundColor(Colors::DIM),
                Print(format!(" <- [{}]  computed {}\n", node.depends_on.join(", "), computed)),
                ResetColor,
            )?;
        }
        stdout.flush()?;
        Ok(())
    }

    /// Print an error message.
    pub fn print_error(&self, msg: &str) -> Result<()> {
        let mut stderr = io::stderr();
        execute!(
            stderr,
            SetForegroundColor(Colors::ERROR),
            Print(format!("Error: {}\n", msg)),
            ResetColor,
        )?;
        stderr.flush()?;
        Ok(())
    }

    /// Print an info message.
    pub fn print_info(&self, msg: &str) -> Result<()> {
        let mut stdout = io::stdout();
        execute!(
            stdout,
            SetForegroundColor(Colors::DIM),
            Print(format!("{}\n", msg)),
            ResetColor,
        )?;
        stdout.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_are_shortened() {
        assert_eq!(short_hash("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_hash("abc"), "abc");
    }

    #[test]
    fn unsealed_jobs_read_as_running() {
        assert_eq!(status_label(None), "running");
        assert_eq!(status_color(Some(JobStatus::PartialFailure)), Colors::PARTIAL);
    }
}
