//! Execution Timeline
//!
//! Records the ticks of every operation a scheduler run drives, for run
//! summaries and a per-operation Gantt chart.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::execution::engine::TickOutcome;

/// What happened at one point of the timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickKind {
    /// The operation entered the run
    Queued,
    Advanced,
    Polled,
    Retried,
    Finished,
    Aborted,
    Failed,
    /// The engine could not complete the tick
    Crashed,
}

impl TickKind {
    pub fn from_outcome(outcome: &TickOutcome) -> Self {
        match outcome {
            TickOutcome::Advanced { .. } => TickKind::Advanced,
            TickOutcome::Poll { .. } => TickKind::Polled,
            TickOutcome::Retry { .. } => TickKind::Retried,
            TickOutcome::Finished => TickKind::Finished,
            TickOutcome::Aborted => TickKind::Aborted,
            TickOutcome::Failed { .. } => TickKind::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TickKind::Finished | TickKind::Aborted | TickKind::Failed | TickKind::Crashed
        )
    }
}

#[derive(Debug, Clone)]
pub struct TimelineEvent {
    pub process_id: String,
    /// Step the tick ran, if any
    pub step: Option<String>,
    pub kind: TickKind,
    pub timestamp: Instant,
}

/// Tick history of a scheduler run.
#[derive(Debug, Clone)]
pub struct ExecutionTimeline {
    events: Vec<TimelineEvent>,
    start_time: Instant,
}

impl ExecutionTimeline {
    pub fn new() -> Self {
        Self {
            events: Vec::new(),
            start_time: Instant::now(),
        }
    }

    pub fn add_event(&mut self, process_id: &str, step: Option<String>, kind: TickKind) {
        self.events.push(TimelineEvent {
            process_id: process_id.to_string(),
            step,
            kind,
            timestamp: Instant::now(),
        });
    }

    /// Records the outcome of a completed tick.
    pub fn record_outcome(&mut self, process_id: &str, outcome: &TickOutcome) {
        let step = match outcome {
            TickOutcome::Advanced { step }
            | TickOutcome::Poll { step }
            | TickOutcome::Retry { step, .. }
            | TickOutcome::Failed { step, .. } => Some(step.clone()),
            _ => None,
        };
        self.add_event(process_id, step, TickKind::from_outcome(outcome));
    }

    pub fn get_events(&self) -> &[TimelineEvent] {
        &self.events
    }

    pub fn events_for<'a>(&'a self, process_id: &'a str) -> impl Iterator<Item = &'a TimelineEvent> + 'a {
        self.events
            .iter()
            .filter(move |event| event.process_id == process_id)
    }

    /// Ticks recorded for an operation, not counting its entry into the run.
    pub fn tick_count(&self, process_id: &str) -> usize {
        self.events_for(process_id)
            .filter(|event| event.kind != TickKind::Queued)
            .count()
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Time from entering the run to the terminal tick, per operation.
    pub fn get_durations(&self) -> HashMap<String, u128> {
        let mut starts: HashMap<&str, Instant> = HashMap::new();
        let mut durations = HashMap::new();

        for event in &self.events {
            if event.kind == TickKind::Queued {
                starts.entry(event.process_id.as_str()).or_insert(event.timestamp);
            } else if event.kind.is_terminal() {
                if let Some(start) = starts.get(event.process_id.as_str()) {
                    durations.insert(
                        event.process_id.clone(),
                        event.timestamp.duration_since(*start).as_millis(),
                    );
                }
            }
        }

        durations
    }

    /// ASCII Gantt chart, one bar per operation, 50 characters wide.
    pub fn gantt_chart(&self) -> String {
        let mut output = String::from("\nOperation Timeline:\n\n");

        let total_time = Instant::now().duration_since(self.start_time).as_millis();
        if total_time == 0 {
            return output;
        }
        let scale = 50.0 / total_time as f64;

        let mut spans: HashMap<&str, (u128, Option<u128>, usize)> = HashMap::new();
        for event in &self.events {
            let elapsed = event.timestamp.duration_since(self.start_time).as_millis();
            let span = spans
                .entry(event.process_id.as_str())
                .or_insert((elapsed, None, 0));
            if event.kind.is_terminal() {
                span.1 = Some(elapsed);
            }
            if event.kind != TickKind::Queued {
                span.2 += 1;
            }
        }

        let mut sorted: Vec<_> = spans.into_iter().collect();
        sorted.sort_by_key(|(id, (start, _, _))| (*start, *id));

        for (process_id, (start, end, ticks)) in sorted {
            let end = end.unwrap_or(total_time);
            let start_pos = (start as f64 * scale) as usize;
            let width = (end.saturating_sub(start) as f64 * scale).max(1.0) as usize;

            let mut bar = " ".repeat(start_pos);
            bar.push_str(&"#".repeat(width));

            output.push_str(&format!(
                "{} |{}| ({} ms, {} ticks)\n",
                truncate(process_id, 12),
                bar,
                end.saturating_sub(start),
                ticks
            ));
        }

        output.push_str(&format!("\nTotal: {} ms\n", total_time));
        output
    }
}

impl Default for ExecutionTimeline {
    fn default() -> Self {
        Self::new()
    }
}

/// Pads or shortens an id to `max_len` characters.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        format!("{:width$}", s, width = max_len)
    } else {
        let head: String = s.chars().take(max_len - 3).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_timeline_creation() {
        let timeline = ExecutionTimeline::default();
        assert!(timeline.get_events().is_empty());
        assert!(timeline.get_durations().is_empty());
    }

    #[test]
    fn test_record_outcome_keeps_step() {
        let mut timeline = ExecutionTimeline::new();
        timeline.record_outcome(
            "p1",
            &TickOutcome::Poll {
                step: "upload-app".to_string(),
            },
        );
        timeline.record_outcome("p1", &TickOutcome::Finished);

        let events = timeline.get_events();
        assert_eq!(events[0].kind, TickKind::Polled);
        assert_eq!(events[0].step.as_deref(), Some("upload-app"));
        assert_eq!(events[1].step, None);
    }

    #[test]
    fn test_durations_span_queue_to_terminal() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("p1", None, TickKind::Queued);
        timeline.add_event("p2", None, TickKind::Queued);
        thread::sleep(Duration::from_millis(20));
        timeline.record_outcome("p1", &TickOutcome::Finished);

        let durations = timeline.get_durations();
        assert!(durations["p1"] >= 20);
        assert!(!durations.contains_key("p2"));
    }

    #[test]
    fn test_tick_count_ignores_queue_event() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("p1", None, TickKind::Queued);
        timeline.record_outcome(
            "p1",
            &TickOutcome::Advanced {
                step: "a".to_string(),
            },
        );
        timeline.record_outcome("p1", &TickOutcome::Aborted);
        timeline.record_outcome("p2", &TickOutcome::Finished);

        assert_eq!(timeline.tick_count("p1"), 2);
        assert_eq!(timeline.events_for("p2").count(), 1);
    }

    #[test]
    fn test_gantt_chart_lists_operations() {
        let mut timeline = ExecutionTimeline::new();
        timeline.add_event("operation-one", None, TickKind::Queued);
        thread::sleep(Duration::from_millis(10));
        timeline.record_outcome("operation-one", &TickOutcome::Finished);
        timeline.add_event("op-2", None, TickKind::Queued);
        thread::sleep(Duration::from_millis(10));

        let chart = timeline.gantt_chart();
        assert!(chart.contains("operation..."));
        assert!(chart.contains("op-2"));
        assert!(chart.contains("Total:"));
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(TickKind::Crashed.is_terminal());
        assert!(TickKind::Failed.is_terminal());
        assert!(!TickKind::Retried.is_terminal());
        assert_eq!(
            TickKind::from_outcome(&TickOutcome::Aborted),
            TickKind::Aborted
        );
    }
}
