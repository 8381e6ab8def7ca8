//! Offline timeline fusion and heuristic analysis.
//!
//! The analyser consumes both journals after the fact: each parsed line
//! becomes a [`TimelineEvent`] tagged with its origin and chain hash, the
//! combined list is stably sorted by record timestamp (ties keep per-file
//! order), and two products are derived:
//!
//! - a per-origin [`HealthSnapshot`] with severity buckets and the
//!   observation window, and
//! - a list of [`Insight`]s from heuristic rules, each carrying only the
//!   supporting events that fall inside the rule's recency window relative
//!   to the last event in the timeline (10 minutes by default, 30 minutes
//!   for the security and kernel rules).
//!
//! All textual matching is case-insensitive. Confidence maps from
//! accumulated rule weight: >= 5 High, >= 3 Medium, else Low. Insights
//! with no in-window supporting events are suppressed, and the final list
//! is stably sorted by rule id.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::event::{Category, EventRecord, Severity};
use crate::journal::JournalLine;

/// Which side of the fabric a record was journalled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// The Windows host journal.
    Host,
    /// The Linux guest journal.
    Guest,
}

impl Origin {
    /// Lowercase tag used in insight ids and report JSON.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Guest => "guest",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One merged timeline entry.
#[derive(Debug, Clone, Serialize)]
pub struct TimelineEvent {
    /// Journal of origin.
    pub origin: Origin,
    /// Chain hash recorded with the line.
    #[serde(rename = "chainHash")]
    pub chain_hash: String,
    /// The event itself.
    #[serde(rename = "event")]
    pub record: EventRecord,
}

/// Builds the merged timeline from both journals.
///
/// Host lines come first so that timestamp ties resolve host-before-guest,
/// matching per-file order under the stable sort.
#[must_use]
pub fn build_timeline(host: Vec<JournalLine>, guest: Vec<JournalLine>) -> Vec<TimelineEvent> {
    let mut events: Vec<TimelineEvent> = host
        .into_iter()
        .map(|line| TimelineEvent {
            origin: Origin::Host,
            chain_hash: line.chain_hash,
            record: line.event,
        })
        .chain(guest.into_iter().map(|line| TimelineEvent {
            origin: Origin::Guest,
            chain_hash: line.chain_hash,
            record: line.event,
        }))
        .collect();
    events.sort_by_key(|event| event.record.timestamp);
    events
}

/// Severity buckets and observation window for one origin.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelHealth {
    /// Informational records (includes `Verbose` and unknown severities).
    pub info: u64,
    /// Warning records.
    pub warning: u64,
    /// Error records.
    pub error: u64,
    /// Critical records.
    pub critical: u64,
    /// All records for the origin.
    pub total: u64,
    /// Earliest non-zero timestamp, canonical form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_timestamp: Option<String>,
    /// Latest non-zero timestamp, canonical form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<String>,
}

impl ChannelHealth {
    fn accumulate(&mut self, record: &EventRecord, window: &mut OriginWindow) {
        self.total += 1;
        match record.severity {
            Severity::Critical => self.critical += 1,
            Severity::Error => self.error += 1,
            Severity::Warning => self.warning += 1,
            Severity::Info | Severity::Verbose => self.info += 1,
        }
        if !record.timestamp_unset() {
            window.observe(record.timestamp);
        }
    }
}

#[derive(Default)]
struct OriginWindow {
    first: Option<DateTime<Utc>>,
    last: Option<DateTime<Utc>>,
}

impl OriginWindow {
    fn observe(&mut self, timestamp: DateTime<Utc>) {
        self.first = Some(self.first.map_or(timestamp, |first| first.min(timestamp)));
        self.last = Some(self.last.map_or(timestamp, |last| last.max(timestamp)));
    }

    fn apply(self, health: &mut ChannelHealth) {
        health.first_timestamp = self.first.map(crate::event::format_timestamp);
        health.last_timestamp = self.last.map(crate::event::format_timestamp);
    }
}

/// Cross-channel health snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HealthSnapshot {
    /// Host-side aggregates.
    pub host: ChannelHealth,
    /// Guest-side aggregates.
    pub guest: ChannelHealth,
}

/// Computes per-origin severity buckets and observation windows.
#[must_use]
pub fn compute_snapshot(events: &[TimelineEvent]) -> HealthSnapshot {
    let mut snapshot = HealthSnapshot::default();
    let mut host_window = OriginWindow::default();
    let mut guest_window = OriginWindow::default();
    for event in events {
        match event.origin {
            Origin::Host => snapshot.host.accumulate(&event.record, &mut host_window),
            Origin::Guest => snapshot.guest.accumulate(&event.record, &mut guest_window),
        }
    }
    host_window.apply(&mut snapshot.host);
    guest_window.apply(&mut snapshot.guest);
    snapshot
}

/// Confidence tier of an insight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Confidence {
    /// Weight below 3.
    Low,
    /// Weight 3 or 4.
    Medium,
    /// Weight 5 and above.
    High,
}

impl Confidence {
    const fn from_weight(weight: usize) -> Self {
        if weight >= 5 {
            Self::High
        } else if weight >= 3 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => f.write_str("Low"),
            Self::Medium => f.write_str("Medium"),
            Self::High => f.write_str("High"),
        }
    }
}

/// A raw event attached to an insight as evidence.
#[derive(Debug, Clone, Serialize)]
pub struct SupportingEvent {
    /// Journal of origin.
    pub origin: Origin,
    /// The supporting record.
    pub event: EventRecord,
}

/// A rule-derived finding.
#[derive(Debug, Clone, Serialize)]
pub struct Insight {
    /// Stable rule id, e.g. `host_service_restart_burst`.
    pub id: String,
    /// One-line finding.
    pub summary: String,
    /// Why the rule fired.
    pub rationale: String,
    /// Confidence tier derived from the accumulated weight.
    pub confidence: Confidence,
    /// In-window evidence, in timeline order.
    #[serde(rename = "supportingEvents")]
    pub supporting_events: Vec<SupportingEvent>,
}

const DEFAULT_WINDOW_MINUTES: i64 = 10;
const EXTENDED_WINDOW_MINUTES: i64 = 30;

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    if needle.is_empty() {
        return true;
    }
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// Returns `true` when `candidate` lies within `window` before `reference`.
///
/// Records without a timestamp never support an insight; a reference
/// without a timestamp accepts everything.
fn is_recent(reference: &EventRecord, candidate: &EventRecord, window: Duration) -> bool {
    if candidate.timestamp_unset() {
        return false;
    }
    if reference.timestamp_unset() {
        return true;
    }
    let delta = reference.timestamp - candidate.timestamp;
    delta >= Duration::zero() && delta <= window
}

fn support(events: &mut Vec<SupportingEvent>, timeline_event: &TimelineEvent) {
    events.push(SupportingEvent {
        origin: timeline_event.origin,
        event: timeline_event.record.clone(),
    });
}

/// Applies every heuristic rule to the merged timeline.
///
/// Output is stably sorted by rule id; rules with no in-window supporting
/// events are suppressed.
#[must_use]
pub fn analyze(events: &[TimelineEvent]) -> Vec<Insight> {
    let mut insights = Vec::new();
    let Some(last_event) = events.last().map(|event| &event.record) else {
        return insights;
    };

    let default_window = Duration::minutes(DEFAULT_WINDOW_MINUTES);
    let extended_window = Duration::minutes(EXTENDED_WINDOW_MINUTES);

    let mut restart_bursts: BTreeMap<Origin, usize> = BTreeMap::new();
    let mut security_weight = 0usize;
    let mut security_events: Vec<&TimelineEvent> = Vec::new();
    let mut memory_pressure_events: Vec<&TimelineEvent> = Vec::new();
    let mut kernel_fault_events: Vec<&TimelineEvent> = Vec::new();

    for event in events {
        let record = &event.record;

        if record.category == Category::ServiceHealth {
            if let Some(state) = record.attribute("state") {
                if contains_ignore_case(state, "restart") {
                    *restart_bursts.entry(event.origin).or_default() += 2;
                }
            }
            if let Some(restarts) = record.attribute("restartCount") {
                if let Ok(count) = restarts.parse::<usize>() {
                    if count >= 3 {
                        *restart_bursts.entry(event.origin).or_default() += count;
                    }
                }
            }
        }

        if record.category == Category::Security {
            let state_text = record.attribute("stateText");
            let vendor = record.attribute("name");
            let suite = record.attribute("suite");
            let disabled =
                state_text.is_some_and(|text| contains_ignore_case(text, "Disabled"));
            if disabled {
                security_weight += 2;
            }
            if vendor.is_some_and(|name| contains_ignore_case(name, "Microsoft")) {
                // Defender being present is expected; it carries no weight.
            } else if state_text.is_some_and(|text| contains_ignore_case(text, "Outdated")) {
                security_weight += 1;
            }
            if disabled || suite.is_some_and(|suite| contains_ignore_case(suite, "ThirdParty")) {
                security_events.push(event);
            }
        }

        if matches!(record.category, Category::Process | Category::Resource)
            && (contains_ignore_case(&record.message, "memory pressure")
                || contains_ignore_case(&record.message, "pressure stall"))
        {
            memory_pressure_events.push(event);
        }

        if matches!(record.category, Category::Kernel | Category::Kmsg)
            || contains_ignore_case(&record.message, "panic")
            || contains_ignore_case(&record.message, "bugcheck")
        {
            kernel_fault_events.push(event);
        }
    }

    for (origin, weight) in &restart_bursts {
        if *weight == 0 {
            continue;
        }
        let mut insight = Insight {
            id: format!("{origin}_service_restart_burst"),
            summary: format!("Rapid restart burst detected on {origin} service stack"),
            rationale: "Multiple ServiceHealth events indicated restart storms shortly before \
                        collection halted."
                .to_string(),
            confidence: Confidence::from_weight(*weight),
            supporting_events: Vec::new(),
        };
        for event in events {
            if event.origin == *origin
                && event.record.category == Category::ServiceHealth
                && is_recent(last_event, &event.record, default_window)
            {
                support(&mut insight.supporting_events, event);
            }
        }
        if !insight.supporting_events.is_empty() {
            insights.push(insight);
        }
    }

    if !security_events.is_empty() {
        let mut insight = Insight {
            id: "cross_environment_security_intervention".to_string(),
            summary: "Third-party security suite intervention suspected".to_string(),
            rationale: "SecurityCenter telemetry reported disabled or outdated states for \
                        non-Microsoft products around the shutdown."
                .to_string(),
            confidence: Confidence::from_weight(security_weight + security_events.len()),
            supporting_events: Vec::new(),
        };
        for event in &security_events {
            if is_recent(last_event, &event.record, extended_window) {
                support(&mut insight.supporting_events, event);
            }
        }
        if !insight.supporting_events.is_empty() {
            insights.push(insight);
        }
    }

    if !memory_pressure_events.is_empty() {
        let mut insight = Insight {
            id: "memory_pressure_correlation".to_string(),
            summary: "Sustained memory pressure observed prior to restart".to_string(),
            rationale: "Process and resource collectors recorded elevated working sets or \
                        pressure stall metrics leading up to the outage."
                .to_string(),
            confidence: Confidence::from_weight(memory_pressure_events.len()),
            supporting_events: Vec::new(),
        };
        for event in &memory_pressure_events {
            if is_recent(last_event, &event.record, default_window) {
                support(&mut insight.supporting_events, event);
            }
        }
        if !insight.supporting_events.is_empty() {
            insights.push(insight);
        }
    }

    if !kernel_fault_events.is_empty() {
        let mut insight = Insight {
            id: "kernel_fault_chain".to_string(),
            summary: "Kernel faults surfaced within the observation window".to_string(),
            rationale: "Guest kernel messages or Windows bugcheck indicators were emitted close \
                        to the shutdown timeline."
                .to_string(),
            confidence: Confidence::from_weight(kernel_fault_events.len()),
            supporting_events: Vec::new(),
        };
        for event in &kernel_fault_events {
            if is_recent(last_event, &event.record, extended_window) {
                support(&mut insight.supporting_events, event);
            }
        }
        if !insight.supporting_events.is_empty() {
            insights.push(insight);
        }
    }

    insights.sort_by(|a, b| a.id.cmp(&b.id));
    insights
}
