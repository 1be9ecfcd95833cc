//! Pure recommendation functions from pool state to a target node count.
//!
//! Every variant here is a plain function of its input; none read the
//! clock or touch a store. The pool manager's evaluation loop is the only
//! caller, and it is responsible for assembling `PoolState` from live
//! data before calling `recommend`.

#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc, Weekday};

#[derive(Debug, Clone)]
pub struct PoolState {
    pub name: String,
    pub current_nodes: u32,
    pub healthy_nodes: u32,
    pub min: u32,
    pub max: u32,
    /// 0.0 - 100.0
    pub utilization: f64,
    pub pending_jobs: u32,
    pub queue_depth: u32,
    pub last_scale_time: DateTime<Utc>,
    pub cooldown: ChronoDuration,
    pub utilization_history: Vec<f64>,
    pub time_of_day: DateTime<Utc>,
    pub day_of_week: Weekday,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Recommendation {
    pub target_nodes: u32,
    pub reason: String,
}

pub trait Autoscaler: Send + Sync {
    fn recommend(&self, state: &PoolState) -> Recommendation;
}

fn clamp(target: u32, state: &PoolState) -> u32 {
    target.clamp(state.min, state.max)
}

fn in_cooldown(state: &PoolState) -> bool {
    state.time_of_day - state.last_scale_time < state.cooldown
}

fn unchanged(state: &PoolState, reason: impl Into<String>) -> Recommendation {
    Recommendation {
        target_nodes: clamp(state.current_nodes, state),
        reason: reason.into(),
    }
}

// ─── Reactive ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Reactive {
    pub up_threshold: f64,
    pub down_threshold: f64,
    pub up_step: u32,
    pub down_step: u32,
}

impl Reactive {
    pub fn new(up_threshold: f64, down_threshold: f64) -> Self {
        Self {
            up_threshold,
            down_threshold,
            up_step: 1,
            down_step: 1,
        }
    }
}

impl Autoscaler for Reactive {
    fn recommend(&self, state: &PoolState) -> Recommendation {
        if in_cooldown(state) {
            return unchanged(state, "in cooldown");
        }
        if state.utilization > self.up_threshold && state.current_nodes < state.max {
            let target = clamp(state.current_nodes + self.up_step, state);
            return Recommendation {
                target_nodes: target,
                reason: format!("utilization {:.1} above {:.1}", state.utilization, self.up_threshold),
            };
        }
        if state.utilization < self.down_threshold && state.current_nodes > state.min {
            let target = clamp(state.current_nodes.saturating_sub(self.down_step), state);
            return Recommendation {
                target_nodes: target,
                reason: format!("utilization {:.1} below {:.1}", state.utilization, self.down_threshold),
            };
        }
        unchanged(state, "within thresholds")
    }
}

// ─── QueueBased ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct QueueBased {
    pub jobs_per_node: u32,
}

impl Autoscaler for QueueBased {
    fn recommend(&self, state: &PoolState) -> Recommendation {
        if in_cooldown(state) {
            return unchanged(state, "in cooldown");
        }
        if self.jobs_per_node == 0 {
            return unchanged(state, "jobs_per_node is zero");
        }
        let target = state.queue_depth.div_ceil(self.jobs_per_node);
        Recommendation {
            target_nodes: clamp(target, state),
            reason: format!("queue depth {} / {} jobs per node", state.queue_depth, self.jobs_per_node),
        }
    }
}

// ─── Scheduled ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    /// Empty matches every day.
    pub days: Vec<Weekday>,
    pub start_hour: u32,
    pub end_hour: u32,
    pub min: u32,
    pub max: u32,
}

pub struct Scheduled {
    pub entries: Vec<ScheduleEntry>,
    pub fallback: Option<Arc<dyn Autoscaler>>,
}

impl Autoscaler for Scheduled {
    fn recommend(&self, state: &PoolState) -> Recommendation {
        if in_cooldown(state) {
            return unchanged(state, "in cooldown");
        }
        let hour = state.time_of_day.hour();
        let matching = self.entries.iter().find(|entry| {
            (entry.days.is_empty() || entry.days.contains(&state.day_of_week))
                && entry.start_hour <= hour
                && hour < entry.end_hour
        });

        let Some(entry) = matching else {
            return self
                .fallback
                .as_ref()
                .map(|f| f.recommend(state))
                .unwrap_or_else(|| unchanged(state, "no schedule entry matched"));
        };

        let mut overridden = state.clone();
        overridden.min = entry.min;
        overridden.max = entry.max;

        match &self.fallback {
            Some(fallback) => fallback.recommend(&overridden),
            None => Recommendation {
                target_nodes: overridden.current_nodes.clamp(overridden.min, overridden.max),
                reason: format!("schedule entry {:02}-{:02}h, no fallback", entry.start_hour, entry.end_hour),
            },
        }
    }
}

// ─── Predictive ──────────────────────────────────────────────────────────────

pub struct Predictive {
    pub lookback: usize,
    pub growth_factor: f64,
    pub fallback: Option<Arc<dyn Autoscaler>>,
}

impl Autoscaler for Predictive {
    fn recommend(&self, state: &PoolState) -> Recommendation {
        if in_cooldown(state) {
            return unchanged(state, "in cooldown");
        }
        if state.utilization_history.len() < self.lookback || self.lookback == 0 {
            return self
                .fallback
                .as_ref()
                .map(|f| f.recommend(state))
                .unwrap_or_else(|| unchanged(state, "insufficient history"));
        }

        let window = &state.utilization_history[state.utilization_history.len() - self.lookback..];
        let trend = window.last().unwrap() - window.first().unwrap();
        let predicted = state.utilization + trend * self.growth_factor;

        if predicted > 80.0 && state.current_nodes < state.max {
            let target = ((state.current_nodes as f64) * (predicted / 70.0)).floor() as u32;
            Recommendation {
                target_nodes: clamp(target, state),
                reason: format!("predicted utilization {predicted:.1} trending up"),
            }
        } else {
            self.fallback
                .as_ref()
                .map(|f| f.recommend(state))
                .unwrap_or_else(|| unchanged(state, "predicted utilization within bounds"))
        }
    }
}

// ─── Composite ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositeMode {
    Max,
    Min,
    Avg,
}

pub struct Composite {
    pub mode: CompositeMode,
    pub children: Vec<Arc<dyn Autoscaler>>,
}

impl Autoscaler for Composite {
    fn recommend(&self, state: &PoolState) -> Recommendation {
        if in_cooldown(state) {
            return unchanged(state, "in cooldown");
        }
        let recommendations: Vec<Recommendation> =
            self.children.iter().map(|child| child.recommend(state)).collect();
        if recommendations.is_empty() {
            return unchanged(state, "no children configured");
        }

        let target = match self.mode {
            CompositeMode::Max => recommendations.iter().map(|r| r.target_nodes).max().unwrap(),
            CompositeMode::Min => recommendations.iter().map(|r| r.target_nodes).min().unwrap(),
            CompositeMode::Avg => {
                let sum: u32 = recommendations.iter().map(|r| r.target_nodes).sum();
                sum / recommendations.len() as u32
            }
        };
        Recommendation {
            target_nodes: clamp(target, state),
            reason: format!("composite({:?}) over {} children", self.mode, recommendations.len()),
        }
    }
}
