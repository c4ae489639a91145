//! Usage summary computation
//!
//! Pure, replay-style derivation of time-spent summaries from a timeline of
//! focus and selection events. An interval is closed whenever a
//! timeline-start, focus-change or plugin-selected event is seen (except the
//! very first timeline-start, which only opens the first interval); the
//! final interval is closed against the caller-supplied "now" timestamp.
//! Interval lengths are attributed to the total and to the per-plugin bucket
//! in effect during the interval.

use serde::Serialize;
use std::collections::HashMap;

/// Sentinel plugin bucket used while no plugin is selected.
pub const NO_PLUGIN: &str = "none";

/// One discrete event on the usage timeline. Times are milliseconds on a
/// monotonic clock supplied by the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackingEvent {
    /// Opens the timeline (or restarts it after a summary flush).
    TimelineStart { time: u64, is_focused: bool },
    /// The application window gained or lost focus.
    FocusChange { time: u64, is_focused: bool },
    /// The user selected a plugin (or deselected, with `None`).
    PluginSelected { time: u64, plugin: Option<String> },
}

impl TrackingEvent {
    fn time(&self) -> u64 {
        match self {
            TrackingEvent::TimelineStart { time, .. }
            | TrackingEvent::FocusChange { time, .. }
            | TrackingEvent::PluginSelected { time, .. } => *time,
        }
    }
}

/// Focused/unfocused time attributed to one bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSpent {
    pub focused_time: u64,
    pub unfocused_time: u64,
}

/// Result of [`compute_usage_summary`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageSummary {
    /// Time across all plugins.
    pub total: TimeSpent,
    /// Per-plugin buckets, created on first use. The [`NO_PLUGIN`] key
    /// collects time with nothing selected.
    pub plugins: HashMap<String, TimeSpent>,
}

/// A closed time span with the selection and focus state that held during it.
#[derive(Debug, Clone, PartialEq)]
struct UsageInterval {
    length: u64,
    plugin: Option<String>,
    focused: bool,
}

/// Scan the timeline in order and accumulate focused/unfocused durations per
/// plugin plus a grand total.
pub fn compute_usage_summary(timeline: &[TrackingEvent], now: u64) -> UsageSummary {
    let mut intervals = Vec::new();
    let mut interval_start = 0u64;
    let mut is_focused = false;
    let mut selected_plugin: Option<String> = None;
    let mut opened = false;

    fn end_interval(
        start: u64,
        time: u64,
        plugin: &Option<String>,
        focused: bool,
        intervals: &mut Vec<UsageInterval>,
    ) {
        intervals.push(UsageInterval {
            length: time.saturating_sub(start),
            plugin: plugin.clone(),
            focused,
        });
    }

    for event in timeline {
        let is_opening_start = !opened && matches!(event, TrackingEvent::TimelineStart { .. });
        if !is_opening_start {
            end_interval(
                interval_start,
                event.time(),
                &selected_plugin,
                is_focused,
                &mut intervals,
            );
        }
        interval_start = event.time();
        match event {
            TrackingEvent::TimelineStart { is_focused: f, .. }
            | TrackingEvent::FocusChange { is_focused: f, .. } => is_focused = *f,
            TrackingEvent::PluginSelected { plugin, .. } => selected_plugin = plugin.clone(),
        }
        opened = true;
    }
    end_interval(
        interval_start,
        now,
        &selected_plugin,
        is_focused,
        &mut intervals,
    );

    let mut summary = UsageSummary::default();
    for interval in intervals {
        if interval.focused {
            summary.total.focused_time += interval.length;
        } else {
            summary.total.unfocused_time += interval.length;
        }
        let bucket = summary
            .plugins
            .entry(interval.plugin.unwrap_or_else(|| NO_PLUGIN.to_string()))
            .or_default();
        if interval.focused {
            bucket.focused_time += interval.length;
        } else {
            bucket.unfocused_time += interval.length;
        }
    }
    summary
}
