//! Per-call timing and model usage roll-ups.
//!
//! Named timers bracket spans of work (`start_tracking`/`end_tracking`);
//! model usage is derived from the LM handles' call histories by index
//! difference, so shared handles are observed without subscriptions.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::core::lm::LmHandle;

/// Timing for one named span.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    pub calls: u64,
    pub total_time: Duration,
    started: Option<Instant>,
}

impl Timer {
    pub fn avg_time(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            self.total_time / self.calls as u32
        }
    }
}

/// Accumulated usage for one model role.
#[derive(Debug, Clone, Default)]
pub struct ModelUsage {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    /// History index up to which this role has been observed.
    observed: usize,
}

impl ModelUsage {
    pub fn avg_input_tokens(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.input_tokens as f64 / self.calls as f64
        }
    }

    pub fn avg_output_tokens(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.output_tokens as f64 / self.calls as f64
        }
    }

    pub fn avg_cost(&self) -> f64 {
        if self.calls == 0 {
            0.0
        } else {
            self.cost / self.calls as f64
        }
    }

    fn observe(&mut self, lm: &LmHandle) {
        let records = lm.history_since(self.observed);
        self.observed += records.len();
        for record in records {
            self.calls += 1;
            self.input_tokens += record.prompt_tokens;
            self.output_tokens += record.completion_tokens;
            self.cost += record.cost;
        }
    }
}

/// Per-tree call counters, timings and token/cost roll-ups.
#[derive(Debug, Clone, Default)]
pub struct Tracker {
    timers: BTreeMap<String, Timer>,
    base: ModelUsage,
    complex: ModelUsage,
}

impl Tracker {
    pub fn new(names: &[&str]) -> Self {
        let mut tracker = Tracker::default();
        for name in names {
            tracker.add_tracker(name);
        }
        tracker
    }

    pub fn add_tracker(&mut self, name: &str) {
        self.timers.entry(name.to_string()).or_default();
    }

    pub fn remove_tracker(&mut self, name: &str) {
        self.timers.remove(name);
    }

    pub fn start_tracking(&mut self, name: &str) {
        self.timers
            .entry(name.to_string())
            .or_default()
            .started = Some(Instant::now());
    }

    /// Close a span and fold in model usage deltas since the last
    /// observation.
    pub fn end_tracking(
        &mut self,
        name: &str,
        label: Option<&str>,
        base_lm: Option<&LmHandle>,
        complex_lm: Option<&LmHandle>,
    ) {
        let Some(timer) = self.timers.get_mut(name) else {
            warn!(tracker = name, "Unknown tracker");
            return;
        };
        let Some(started) = timer.started.take() else {
            warn!(tracker = name, "Tracker has not been started yet");
            return;
        };
        let elapsed = started.elapsed();
        timer.calls += 1;
        timer.total_time += elapsed;
        debug!(
            "Time taken for {}: {:.2}s",
            label.unwrap_or(name),
            elapsed.as_secs_f64()
        );

        if let Some(lm) = base_lm {
            self.base.observe(lm);
        }
        if let Some(lm) = complex_lm {
            self.complex.observe(lm);
        }
    }

    pub fn avg_time(&self, name: &str) -> Duration {
        self.timers.get(name).map(Timer::avg_time).unwrap_or_default()
    }

    pub fn timer(&self, name: &str) -> Option<&Timer> {
        self.timers.get(name)
    }

    pub fn base_usage(&self) -> &ModelUsage {
        &self.base
    }

    pub fn complex_usage(&self) -> &ModelUsage {
        &self.complex
    }

    /// Emit per-model usage at debug level, after a completed run.
    pub fn log_usage(&self) {
        for (role, usage) in [("base", &self.base), ("complex", &self.complex)] {
            if usage.calls == 0 {
                debug!("{} model usage: 0 calls", role);
                continue;
            }
            debug!(
                "{} model usage: {} calls, {} input tokens (avg {:.0}), \
                 {} output tokens (avg {:.0}), ${:.4} total (avg ${:.4})",
                role,
                usage.calls,
                usage.input_tokens,
                usage.avg_input_tokens(),
                usage.output_tokens,
                usage.avg_output_tokens(),
                usage.cost,
                usage.avg_cost(),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{scripted_lm, ScriptedOutput};
    use crate::core::lm::{CompletionRequest, FieldKind};
    use serde_json::json;

    #[test]
    fn test_timer_accumulates_calls() {
        let mut tracker = Tracker::new(&["decision"]);
        tracker.start_tracking("decision");
        tracker.end_tracking("decision", None, None, None);
        tracker.start_tracking("decision");
        tracker.end_tracking("decision", None, None, None);
        assert_eq!(tracker.timer("decision").unwrap().calls, 2);
    }

    #[test]
    fn test_end_without_start_is_harmless() {
        let mut tracker = Tracker::new(&["decision"]);
        tracker.end_tracking("decision", None, None, None);
        assert_eq!(tracker.timer("decision").unwrap().calls, 0);
    }

    #[tokio::test]
    async fn test_model_usage_snapshots_by_index() {
        let lm = scripted_lm(vec![
            ScriptedOutput::new(&[("answer", json!("a"))]),
            ScriptedOutput::new(&[("answer", json!("b"))]),
        ]);
        let request = CompletionRequest::new("m").output("answer", "", FieldKind::Text);

        let mut tracker = Tracker::new(&["decision"]);
        tracker.start_tracking("decision");
        lm.complete(&request).await.unwrap();
        tracker.end_tracking("decision", None, Some(&lm), None);
        assert_eq!(tracker.base_usage().calls, 1);

        tracker.start_tracking("decision");
        lm.complete(&request).await.unwrap();
        tracker.end_tracking("decision", None, Some(&lm), None);
        assert_eq!(tracker.base_usage().calls, 2);
        assert_eq!(tracker.base_usage().input_tokens, 20);
        assert_eq!(tracker.base_usage().output_tokens, 10);
    }

    #[test]
    fn test_remove_tracker() {
        let mut tracker = Tracker::new(&["query"]);
        tracker.remove_tracker("query");
        assert!(tracker.timer("query").is_none());
    }
}
