//! Execution Timeline
//!
//! Records when each node starts and settles so a finished run can be
//! rendered as a Gantt chart. The timeline is a [`StatusObserver`], so it is
//! fed straight from the engine's event stream.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::execution::run::NodeStatus;
use crate::status::{StatusEvent, StatusObserver};

/// Width of the chart area in characters.
const CHART_WIDTH: f64 = 50.0;

/// Kind of timeline mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    Started,
    Completed,
    Failed,
    Skipped,
}

impl Mark {
    fn from_status(status: NodeStatus) -> Option<Self> {
        match status {
            NodeStatus::Running => Some(Self::Started),
            NodeStatus::Completed => Some(Self::Completed),
            NodeStatus::Failed => Some(Self::Failed),
            NodeStatus::Skipped => Some(Self::Skipped),
            NodeStatus::Pending => None,
        }
    }
}

/// A single node mark, as an offset from the start of the timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
    pub node_id: String,
    pub mark: Mark,
    pub offset: Duration,
}

#[derive(Debug)]
struct Recording {
    entries: Vec<TimelineEntry>,
    finished: Option<Duration>,
}

/// Per-node timing for one run.
#[derive(Debug)]
pub struct ExecutionTimeline {
    started: Instant,
    recording: Mutex<Recording>,
}

/// Start and end offsets of one node, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    start: u128,
    end: Option<u128>,
    mark: Mark,
}

impl ExecutionTimeline {
    /// Creates an empty timeline starting now.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            recording: Mutex::new(Recording {
                entries: Vec::new(),
                finished: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Recording> {
        self.recording.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records a mark for a node at the current instant.
    pub fn record(&self, node_id: impl Into<String>, mark: Mark) {
        let offset = self.started.elapsed();
        self.lock().entries.push(TimelineEntry {
            node_id: node_id.into(),
            mark,
            offset,
        });
    }

    /// Copy of every recorded mark, in arrival order.
    pub fn entries(&self) -> Vec<TimelineEntry> {
        self.lock().entries.clone()
    }

    /// Time since the timeline started, or until the run finished.
    pub fn elapsed(&self) -> Duration {
        self.lock()
            .finished
            .unwrap_or_else(|| self.started.elapsed())
    }

    /// Wall-clock duration of every node that ran to completion or failure.
    pub fn durations(&self) -> BTreeMap<String, u128> {
        self.spans()
            .into_iter()
            .filter_map(|(id, span)| span.end.map(|end| (id, end - span.start)))
            .collect()
    }

    fn spans(&self) -> BTreeMap<String, Span> {
        let mut spans: BTreeMap<String, Span> = BTreeMap::new();

        for entry in self.lock().entries.iter() {
            let at = entry.offset.as_millis();
            match entry.mark {
                Mark::Started => {
                    spans.insert(
                        entry.node_id.clone(),
                        Span {
                            start: at,
                            end: None,
                            mark: Mark::Started,
                        },
                    );
                }
                Mark::Completed | Mark::Failed => {
                    if let Some(span) = spans.get_mut(&entry.node_id) {
                        span.end = Some(at);
                        span.mark = entry.mark;
                    }
                }
                Mark::Skipped => {
                    spans.entry(entry.node_id.clone()).or_insert(Span {
                        start: at,
                        end: None,
                        mark: Mark::Skipped,
                    });
                }
            }
        }

        spans
    }

    /// Renders an ASCII Gantt chart.
    ///
    /// Completed nodes are drawn with `#`, failed ones with `x`. Skipped
    /// nodes get a row without a bar.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nExecution Timeline:\n\n");

        let total = self.elapsed().as_millis();
        let mut rows: Vec<(String, Span)> = self.spans().into_iter().collect();
        if rows.is_empty() {
            return output;
        }
        rows.sort_by(|(a_id, a), (b_id, b)| a.start.cmp(&b.start).then_with(|| a_id.cmp(b_id)));

        let scale = if total == 0 {
            0.0
        } else {
            CHART_WIDTH / total as f64
        };

        for (node_id, span) in rows {
            let label = truncate(&node_id, 12);
            match (span.mark, span.end) {
                (Mark::Skipped, _) => {
                    output.push_str(&format!("{} |{:50}| (skipped)\n", label, ""));
                }
                (mark, Some(end)) => {
                    let start_pos = (span.start as f64 * scale) as usize;
                    let width = (((end - span.start) as f64 * scale) as usize).max(1);
                    let fill = if mark == Mark::Failed { "x" } else { "#" };

                    let mut bar = " ".repeat(start_pos);
                    bar.push_str(&fill.repeat(width));
                    output.push_str(&format!(
                        "{} |{:50}| ({} ms{})\n",
                        label,
                        bar,
                        end - span.start,
                        if mark == Mark::Failed { ", failed" } else { "" }
                    ));
                }
                (_, None) => {
                    output.push_str(&format!("{} |{:50}| (running)\n", label, ""));
                }
            }
        }

        output.push_str(&format!("\nTotal: {} ms\n", total));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusObserver for ExecutionTimeline {
    fn notify(&self, event: &StatusEvent) {
        match event {
            StatusEvent::NodeStatusChanged { node_id, state, .. } => {
                if let Some(mark) = Mark::from_status(state.status) {
                    self.record(node_id.clone(), mark);
                }
            }
            StatusEvent::RunStatusChanged { status, .. } if status.is_terminal() => {
                let at = self.started.elapsed();
                self.lock().finished.get_or_insert(at);
            }
            _ => {}
        }
    }
}

/// Pads or truncates a label to exactly `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    let count = s.chars().count();
    if count <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::run::{ExecutionRun, RunStatus};
    use std::thread;

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::new();
        assert!(timeline.entries().is_empty());
        assert!(timeline.durations().is_empty());
    }

    #[test]
    fn test_durations() {
        let timeline = ExecutionTimeline::new();
        timeline.record("fetch", Mark::Started);
        thread::sleep(Duration::from_millis(30));
        timeline.record("fetch", Mark::Completed);
        timeline.record("parse", Mark::Started);

        let durations = timeline.durations();
        assert!(durations["fetch"] >= 30);
        // Still running
        assert!(!durations.contains_key("parse"));
    }

    #[test]
    fn test_gantt_chart_marks_outcomes() {
        let timeline = ExecutionTimeline::new();
        timeline.record("ok", Mark::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.record("ok", Mark::Completed);
        timeline.record("broken", Mark::Started);
        thread::sleep(Duration::from_millis(20));
        timeline.record("broken", Mark::Failed);
        timeline.record("later", Mark::Skipped);

        let chart = timeline.gantt_chart();
        assert!(chart.contains("Execution Timeline:"));
        assert!(chart.contains('#'));
        assert!(chart.contains("failed"));
        assert!(chart.contains("(skipped)"));
        assert!(chart.contains("Total:"));

        let ok_row = chart.lines().position(|l| l.starts_with("ok")).unwrap();
        let broken_row = chart.lines().position(|l| l.starts_with("broken")).unwrap();
        assert!(ok_row < broken_row);
    }

    #[test]
    fn test_gantt_chart_empty() {
        let chart = ExecutionTimeline::new().gantt_chart();
        assert!(chart.contains("Timeline"));
        assert!(!chart.contains("Total:"));
    }

    #[test]
    fn test_observer_records_node_events() {
        let timeline = ExecutionTimeline::new();
        let mut run = ExecutionRun::new("r1", "wf", ["a", "b"]);

        run.mark_running("a");
        timeline.notify(&StatusEvent::node_changed(&run, "a").unwrap());
        run.mark_completed("a", serde_json::Value::Null, Duration::ZERO);
        timeline.notify(&StatusEvent::node_changed(&run, "a").unwrap());
        run.mark_skipped("b", None);
        timeline.notify(&StatusEvent::node_changed(&run, "b").unwrap());
        timeline.notify(&StatusEvent::CancelRequested {
            run_id: "r1".to_string(),
        });

        let marks: Vec<Mark> = timeline.entries().iter().map(|e| e.mark).collect();
        assert_eq!(marks, vec![Mark::Started, Mark::Completed, Mark::Skipped]);
        assert!(timeline.durations().contains_key("a"));
    }

    #[test]
    fn test_elapsed_freezes_when_run_finishes() {
        let timeline = ExecutionTimeline::new();
        let mut run = ExecutionRun::new("r1", "wf", Vec::<String>::new());
        run.transition(RunStatus::Running);
        run.transition(RunStatus::Completed);
        timeline.notify(&StatusEvent::run_changed(&run));

        let frozen = timeline.elapsed();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(timeline.elapsed(), frozen);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 8), "short   ");
        assert_eq!(truncate("a-very-long-node-id", 12), "a-very-lo...");
    }
}
