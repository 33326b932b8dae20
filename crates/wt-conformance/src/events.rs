//! Event log checks
//!
//! The event log is append-only. Every fade that completes enqueues one
//! `overheated` event, so the validator counts triggering actions as the run
//! performs them and expects exactly that many entries.

use chrono::{DateTime, FixedOffset};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::client::ThingClient;
use crate::error::{ConformanceError, ConformanceResult};
use crate::expect::{at, single_key, values_match};
use crate::profile::DeviceProfile;
use crate::timestamp;

/// One entry of an event log
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub name: String,
    pub data: Value,
    pub timestamp: DateTime<FixedOffset>,
    /// The envelope as served, used for prefix comparison
    pub raw: Value,
}

impl EventRecord {
    /// Parse a `{name: {data, timestamp}}` envelope
    pub fn from_envelope(envelope: &Value, what: &str) -> ConformanceResult<Self> {
        let (name, _) = single_key(envelope, what)?;
        let base = format!("/{}", name);
        let data = at(envelope, &format!("{}/data", base))?.clone();
        let timestamp = timestamp::expect_timestamp(envelope, &format!("{}/timestamp", base))?;

        Ok(Self {
            name: name.to_string(),
            data,
            timestamp,
            raw: envelope.clone(),
        })
    }

    /// Require this event to be the given type carrying the given data
    pub fn expect(&self, name: &str, data: &Value) -> ConformanceResult<()> {
        if self.name != name {
            return Err(ConformanceError::shape("event type", name, &self.name));
        }
        if !values_match(data, &self.data) {
            return Err(ConformanceError::shape(
                format!("/{}/data", self.name),
                data,
                &self.data,
            ));
        }
        Ok(())
    }
}

/// Validates `/events` against the number of events the run has triggered
pub struct EventLog<'a> {
    client: &'a ThingClient,
    event_name: String,
    sentinel: Value,
    expected_count: usize,
    last_seen: Vec<Value>,
}

impl<'a> EventLog<'a> {
    pub fn new(client: &'a ThingClient, profile: &DeviceProfile) -> Self {
        let event_name = profile
            .events
            .first()
            .map(|event| event.name.to_string())
            .unwrap_or_default();

        Self {
            client,
            event_name,
            sentinel: json!(profile.overheated_value),
            expected_count: 0,
            last_seen: Vec::new(),
        }
    }

    /// `GET /events` or `GET /events/{name}`
    pub async fn list_events(&self, name: Option<&str>) -> ConformanceResult<Vec<EventRecord>> {
        let path = match name {
            Some(name) => format!("/events/{}", name),
            None => "/events".to_string(),
        };
        let body = self
            .client
            .get(&path)
            .await?
            .expect_status(StatusCode::OK)?
            .into_json()?;
        let entries = body
            .as_array()
            .ok_or_else(|| ConformanceError::shape(format!("GET {}", path), "an array", &body))?;

        entries
            .iter()
            .enumerate()
            .map(|(i, entry)| EventRecord::from_envelope(entry, &format!("GET {}[{}]", path, i)))
            .collect()
    }

    /// Note that an action which emits one event has completed
    pub fn record_trigger(&mut self) {
        self.expected_count += 1;
        debug!(expected = self.expected_count, "event trigger recorded");
    }

    pub fn expected_count(&self) -> usize {
        self.expected_count
    }

    /// Check the global and per-type logs against everything seen so far
    pub async fn verify(&mut self) -> ConformanceResult<Vec<EventRecord>> {
        let events = self.list_events(None).await?;
        self.check_snapshot(&events)?;

        let typed = self.list_events(Some(self.event_name.as_str())).await?;
        let filtered: Vec<&EventRecord> = events
            .iter()
            .filter(|event| event.name == self.event_name)
            .collect();
        let consistent = typed.len() == filtered.len()
            && typed
                .iter()
                .zip(&filtered)
                .all(|(a, b)| values_match(&a.raw, &b.raw));
        if !consistent {
            return Err(ConformanceError::state(
                format!("GET /events/{}", self.event_name),
                format!("{} entries matching GET /events", filtered.len()),
                format!("{} entries", typed.len()),
            ));
        }

        self.last_seen = events.iter().map(|event| event.raw.clone()).collect();
        info!(count = events.len(), "event log conforms");
        Ok(events)
    }

    /// Count, prefix and content checks for one global snapshot
    fn check_snapshot(&self, events: &[EventRecord]) -> ConformanceResult<()> {
        if events.len() != self.expected_count {
            return Err(ConformanceError::state(
                "GET /events length",
                self.expected_count,
                events.len(),
            ));
        }

        for (i, previous) in self.last_seen.iter().enumerate() {
            match events.get(i) {
                Some(event) if values_match(previous, &event.raw) => {}
                actual => {
                    return Err(ConformanceError::state(
                        format!("GET /events[{}] (earlier log must be a prefix)", i),
                        previous,
                        actual.map_or_else(|| "nothing".to_string(), |e| e.raw.to_string()),
                    ))
                }
            }
        }

        for event in events {
            event.expect(&self.event_name, &self.sentinel)?;
        }
        Ok(())
    }
}
