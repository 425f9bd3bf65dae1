//! Mermaid `sequenceDiagram` writer

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{DiagramRecorder, Payload, PayloadFormatter};
use crate::common::config::DiagramConfig;
use crate::common::{Error, Result};

/// Participant that issues every request
const RUNNER: &str = "Scenario";

/// One recorded event, with its payload already formatted
#[derive(Debug, Clone, PartialEq)]
pub enum DiagramEntry {
    Request {
        target: String,
        summary: String,
        note: Option<String>,
    },
    Response {
        source: String,
        status: u16,
        note: Option<String>,
        error: Option<String>,
    },
    AsyncMessage {
        source: String,
        note: Option<String>,
    },
    Missing {
        topic: String,
        expected: usize,
        received: usize,
        reason: String,
    },
}

#[derive(Debug, Default)]
struct ScenarioDiagram {
    title: String,
    entries: Vec<DiagramEntry>,
}

/// Records entries in memory and writes `<output_dir>/<id>.mmd` on finalize
pub struct MermaidRecorder {
    output_dir: PathBuf,
    formatter: PayloadFormatter,
    diagrams: Mutex<HashMap<String, ScenarioDiagram>>,
}

impl MermaidRecorder {
    pub fn new(config: &DiagramConfig) -> Self {
        Self {
            output_dir: config.output_dir.clone(),
            formatter: PayloadFormatter::new(config),
            diagrams: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ScenarioDiagram>> {
        self.diagrams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push(&self, id: &str, entry: DiagramEntry) {
        self.lock().entry(id.to_string()).or_default().entries.push(entry);
    }

    /// Entries recorded so far for a scenario
    pub fn entries(&self, id: &str) -> Vec<DiagramEntry> {
        self.lock()
            .get(id)
            .map(|d| d.entries.clone())
            .unwrap_or_default()
    }

    /// Path the diagram for `id` is written to
    pub fn path_for(&self, id: &str) -> PathBuf {
        self.output_dir.join(format!("{}.mmd", id))
    }

    /// Render a diagram as Mermaid source
    fn render(diagram: &ScenarioDiagram) -> String {
        let mut aliases: Vec<String> = Vec::new();
        let mut alias = |name: &str| -> String {
            let index = match aliases.iter().position(|n| n == name) {
                Some(i) => i,
                None => {
                    aliases.push(name.to_string());
                    aliases.len() - 1
                }
            };
            format!("p{}", index)
        };

        let runner = alias(RUNNER);
        let mut body = Vec::new();
        for entry in &diagram.entries {
            match entry {
                DiagramEntry::Request {
                    target,
                    summary,
                    note,
                } => {
                    let to = alias(target);
                    body.push(format!("    {}->>+{}: {}", runner, to, escape(summary)));
                    if let Some(note) = note {
                        body.push(format!("    Note over {},{}: {}", runner, to, escape(note)));
                    }
                }
                DiagramEntry::Response {
                    source,
                    status,
                    note,
                    error,
                } => {
                    let from = alias(source);
                    body.push(format!("    {}-->>-{}: {}", from, runner, status));
                    if let Some(note) = note {
                        body.push(format!("    Note over {},{}: {}", from, runner, escape(note)));
                    }
                    if let Some(error) = error {
                        body.push(format!("    Note right of {}: ❌ {}", runner, escape(error)));
                    }
                }
                DiagramEntry::AsyncMessage { source, note } => {
                    let from = alias(source);
                    body.push(format!(
                        "    {}-){}: {}",
                        from,
                        runner,
                        escape(note.as_deref().unwrap_or("message"))
                    ));
                }
                DiagramEntry::Missing {
                    topic,
                    expected,
                    received,
                    reason,
                } => {
                    body.push(format!(
                        "    Note right of {}: ❌ {} received {}/{} ({})",
                        runner,
                        escape(topic),
                        received,
                        expected,
                        escape(reason)
                    ));
                }
            }
        }

        let mut out = String::from("sequenceDiagram\n");
        if !diagram.title.is_empty() {
            out.push_str(&format!("    title {}\n", escape(&diagram.title)));
        }
        for (i, name) in aliases.iter().enumerate() {
            out.push_str(&format!("    participant p{} as {}\n", i, escape(name)));
        }
        for line in body {
            out.push_str(&line);
            out.push('\n');
        }
        out
    }
}

/// Mermaid treats `;` and `#` specially and notes are single-line
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '#' => out.push_str("#35;"),
            ';' => out.push_str("#59;"),
            '\n' => out.push_str("<br/>"),
            '\r' => {}
            c => out.push(c),
        }
    }
    out
}

#[async_trait]
impl DiagramRecorder for MermaidRecorder {
    fn start_scenario(&self, id: &str, title: &str) {
        self.lock().insert(
            id.to_string(),
            ScenarioDiagram {
                title: title.to_string(),
                entries: Vec::new(),
            },
        );
    }

    fn record_request(&self, id: &str, target: &str, summary: &str, payload: &Payload) {
        self.push(
            id,
            DiagramEntry::Request {
                target: target.to_string(),
                summary: summary.to_string(),
                note: self.formatter.format(payload),
            },
        );
    }

    fn record_response(
        &self,
        id: &str,
        source: &str,
        status: u16,
        payload: &Payload,
        error: Option<&str>,
    ) {
        self.push(
            id,
            DiagramEntry::Response {
                source: source.to_string(),
                status,
                note: self.formatter.format(payload),
                error: error.map(str::to_string),
            },
        );
    }

    fn record_async_message(&self, id: &str, source: &str, payload: &Payload) {
        self.push(
            id,
            DiagramEntry::AsyncMessage {
                source: source.to_string(),
                note: self.formatter.format(payload),
            },
        );
    }

    fn record_missing(&self, id: &str, topic: &str, expected: usize, received: usize, reason: &str) {
        self.push(
            id,
            DiagramEntry::Missing {
                topic: topic.to_string(),
                expected,
                received,
                reason: reason.to_string(),
            },
        );
    }

    async fn finalize(&self, id: &str) -> Result<()> {
        let rendered = {
            let diagrams = self.lock();
            match diagrams.get(id) {
                Some(diagram) => Self::render(diagram),
                None => return Ok(()),
            }
        };

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| Error::file_read(&self.output_dir, e))?;
        let path = self.path_for(id);
        tokio::fs::write(&path, rendered).await?;
        tracing::debug!(path = %path.display(), "diagram written");
        Ok(())
    }
}
