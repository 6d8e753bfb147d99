//! Aggregate figures over stored incidents.

use crate::action::{ActionName, ProposalSource};
use crate::incident::{Incident, Outcome};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Most recent incidents the metrics are computed over.
pub const METRICS_WINDOW: usize = 10_000;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutcomeCounts {
    pub pending: u64,
    pub executed: u64,
    pub skipped: u64,
    pub escalated: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub total: u64,
    pub outcomes: OutcomeCounts,
    /// Incidents whose summary came from the fallback rules.
    pub fallback_count: u64,
    /// Model proposals that named an unknown action.
    pub normalized_actions: u64,
    pub mean_summary_latency_ms: Option<f64>,
    /// Mean time from receiving a line to detecting it.
    pub mttd_secs: Option<f64>,
    /// Mean time from detection to a successful remediation.
    pub mttr_secs: Option<f64>,
    pub actions: BTreeMap<ActionName, u64>,
    /// Number of incidents the figures cover.
    pub window: u64,
    /// Older incidents exist beyond the window and are not counted.
    pub truncated: bool,
}

impl MetricsSummary {
    /// Summarize newest-first `incidents` fetched with a limit of
    /// `window + 1`, so an extra row marks older history as cut off.
    pub fn over_window(mut incidents: Vec<Incident>, window: usize) -> Self {
        let truncated = incidents.len() > window;
        incidents.truncate(window);
        Self {
            truncated,
            ..Self::from_incidents(&incidents)
        }
    }

    pub fn from_incidents(incidents: &[Incident]) -> Self {
        let mut m = MetricsSummary {
            total: incidents.len() as u64,
            window: incidents.len() as u64,
            ..Default::default()
        };
        let mut latencies = Vec::new();
        let mut detect_times = Vec::new();
        let mut resolve_times = Vec::new();

        for i in incidents {
            match i.outcome {
                Outcome::Pending => m.outcomes.pending += 1,
                Outcome::Executed => m.outcomes.executed += 1,
                Outcome::Skipped => m.outcomes.skipped += 1,
                Outcome::Escalated => m.outcomes.escalated += 1,
                Outcome::Failed => m.outcomes.failed += 1,
            }

            if let Some(action) = &i.action {
                *m.actions.entry(action.name).or_insert(0) += 1;
                if action.source == ProposalSource::Fallback {
                    m.fallback_count += 1;
                }
                if action.was_normalized() {
                    m.normalized_actions += 1;
                }
            }

            if let Some(ms) = i.summary_latency_ms {
                latencies.push(ms as f64);
            }
            detect_times.push(i.time_to_detect_secs());
            if i.outcome == Outcome::Executed {
                if let Some(secs) = i.time_to_resolve_secs() {
                    resolve_times.push(secs);
                }
            }
        }

        m.mean_summary_latency_ms = mean(&latencies);
        m.mttd_secs = mean(&detect_times);
        m.mttr_secs = mean(&resolve_times);
        m
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

impl fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.truncated {
            writeln!(
                f,
                "Window:           newest {} incidents (older history not counted)",
                self.window
            )?;
        }
        writeln!(f, "Incidents:        {}", self.total)?;
        writeln!(f, "  executed:       {}", self.outcomes.executed)?;
        writeln!(f, "  skipped:        {}", self.outcomes.skipped)?;
        writeln!(f, "  escalated:      {}", self.outcomes.escalated)?;
        writeln!(f, "  failed:         {}", self.outcomes.failed)?;
        writeln!(f, "  pending:        {}", self.outcomes.pending)?;
        writeln!(f, "Fallback used:    {}", self.fallback_count)?;
        writeln!(f, "Unknown actions:  {}", self.normalized_actions)?;
        match self.mean_summary_latency_ms {
            Some(ms) => writeln!(f, "Mean latency:     {ms:.0} ms")?,
            None => writeln!(f, "Mean latency:     n/a")?,
        }
        match self.mttd_secs {
            Some(s) => writeln!(f, "MTTD:             {s:.3} s")?,
            None => writeln!(f, "MTTD:             n/a")?,
        }
        match self.mttr_secs {
            Some(s) => writeln!(f, "MTTR:             {s:.2} s")?,
            None => writeln!(f, "MTTR:             n/a")?,
        }
        if !self.actions.is_empty() {
            writeln!(f, "Actions:")?;
            for (action, count) in &self.actions {
                writeln!(f, "  {:<18} {}", action.as_str(), count)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionProposal;
    use crate::detect::LogLine;
    use crate::incident::PipelineState;
    use chrono::Duration;

    fn finished(action: ActionProposal, terminal: PipelineState, latency: u64) -> Incident {
        let mut i = Incident::detected(&LogLine::new("ERROR"));
        i.advance(PipelineState::Summarizing).unwrap();
        let mid = if action.source == ProposalSource::Fallback {
            PipelineState::Fallback
        } else {
            PipelineState::Summarized
        };
        i.advance(mid).unwrap();
        i.action = Some(action);
        i.summary_latency_ms = Some(latency);
        i.advance(PipelineState::Gated).unwrap();
        i.advance(terminal).unwrap();
        i
    }

    #[test]
    fn test_empty_history() {
        let m = MetricsSummary::from_incidents(&[]);
        assert_eq!(m.total, 0);
        assert!(m.mean_summary_latency_ms.is_none());
        assert!(m.mttd_secs.is_none());
        assert!(m.mttr_secs.is_none());
        assert!(!m.truncated);
    }

    #[test]
    fn test_counts_and_means() {
        let mut executed = finished(
            ActionProposal::from_model("RESTART_APACHE"),
            PipelineState::Executed,
            100,
        );
        executed.finished_at = Some(executed.detected_at + Duration::seconds(4));

        let incidents = vec![
            executed,
            finished(
                ActionProposal::fallback(ActionName::Escalate),
                PipelineState::Escalated,
                300,
            ),
            finished(
                ActionProposal::from_model("DELETE_ALL"),
                PipelineState::Skipped,
                200,
            ),
            Incident::detected(&LogLine::new("CRITICAL")),
        ];
        let m = MetricsSummary::from_incidents(&incidents);

        assert_eq!(m.total, 4);
        assert_eq!(m.outcomes.executed, 1);
        assert_eq!(m.outcomes.escalated, 1);
        assert_eq!(m.outcomes.skipped, 1);
        assert_eq!(m.outcomes.pending, 1);
        assert_eq!(m.fallback_count, 1);
        assert_eq!(m.normalized_actions, 1);
        assert_eq!(m.actions[&ActionName::Escalate], 2);
        assert_eq!(m.mean_summary_latency_ms, Some(200.0));
        assert_eq!(m.mttr_secs, Some(4.0));

        let text = m.to_string();
        assert!(text.contains("MTTR:             4.00 s"));
        assert!(!text.contains("Window:"));
    }

    #[test]
    fn test_mttd_averages_receive_to_detect() {
        let mut slow = Incident::detected(&LogLine::new("ERROR slow"));
        slow.line_received_at = slow.detected_at - Duration::milliseconds(300);
        let mut fast = Incident::detected(&LogLine::new("ERROR fast"));
        fast.line_received_at = fast.detected_at - Duration::milliseconds(100);

        let m = MetricsSummary::from_incidents(&[slow, fast]);
        assert!((m.mttd_secs.unwrap() - 0.2).abs() < 1e-9);
        assert!(m.to_string().contains("MTTD:             0.200 s"));
    }

    #[test]
    fn test_window_reports_cut_off_history() {
        let incidents: Vec<Incident> = (0..5)
            .map(|n| Incident::detected(&LogLine::new(format!("ERROR {n}"))))
            .collect();

        let m = MetricsSummary::over_window(incidents.clone(), 4);
        assert_eq!(m.total, 4);
        assert_eq!(m.window, 4);
        assert!(m.truncated);
        assert!(m
            .to_string()
            .contains("Window:           newest 4 incidents (older history not counted)"));

        let m = MetricsSummary::over_window(incidents, 5);
        assert_eq!(m.total, 5);
        assert!(!m.truncated);
    }
}
