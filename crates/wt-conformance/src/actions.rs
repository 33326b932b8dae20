//! Action lifecycle checks
//!
//! Actions move `created` → `pending` → `completed` on the server's own
//! schedule. The driver requests them over REST, waits for completion with the
//! configured [`CompletionWait`], and validates every record it sees along the
//! way. The [`ActionTracker`] rejects any record whose status goes backwards.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use chrono::{DateTime, FixedOffset};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::client::ThingClient;
use crate::config::{ActionEndpoint, CompletionWait, TargetConfig};
use crate::error::{ConformanceError, ConformanceResult};
use crate::expect::{expect_str, single_key, values_match};
use crate::timestamp;

/// Status of an action, ordered by lifecycle progress
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActionStatus {
    Created,
    Pending,
    Completed,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::Created => "created",
            ActionStatus::Pending => "pending",
            ActionStatus::Completed => "completed",
        }
    }

    fn parse(s: &str, pointer: &str) -> ConformanceResult<Self> {
        match s {
            "created" => Ok(ActionStatus::Created),
            "pending" => Ok(ActionStatus::Pending),
            "completed" => Ok(ActionStatus::Completed),
            other => Err(ConformanceError::shape(
                pointer,
                "created, pending or completed",
                other,
            )),
        }
    }
}

impl fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One action as reported by the server
#[derive(Debug, Clone)]
pub struct ActionRecord {
    pub name: String,
    pub id: String,
    pub href: String,
    pub input: Value,
    pub status: ActionStatus,
    pub time_requested: Option<DateTime<FixedOffset>>,
    pub time_completed: Option<DateTime<FixedOffset>>,
}

impl ActionRecord {
    /// Parse and validate a `{name: {input, href, status, ...}}` envelope
    ///
    /// `what` names the envelope's origin in error messages.
    pub fn from_envelope(
        envelope: &Value,
        config: &TargetConfig,
        what: &str,
    ) -> ConformanceResult<Self> {
        let (name, _) = single_key(envelope, what)?;
        let base = format!("/{}", name);

        let href = expect_str(envelope, &format!("{}/href", base))?;
        let collection = config.href(&format!("/actions/{}/", name));
        let id = href
            .strip_prefix(&collection)
            .filter(|id| !id.is_empty() && !id.contains('/'))
            .ok_or_else(|| {
                ConformanceError::shape(
                    format!("{} {}/href", what, base),
                    format!("{}<id>", collection),
                    href,
                )
            })?;

        let status_pointer = format!("{}/status", base);
        let status = ActionStatus::parse(expect_str(envelope, &status_pointer)?, &status_pointer)?;

        let optional_time = |key: &str| -> ConformanceResult<Option<DateTime<FixedOffset>>> {
            let pointer = format!("{}/{}", base, key);
            match envelope.pointer(&pointer) {
                None | Some(Value::Null) => Ok(None),
                Some(_) => timestamp::expect_timestamp(envelope, &pointer).map(Some),
            }
        };
        let time_requested = optional_time("timeRequested")?;
        let time_completed = optional_time("timeCompleted")?;

        let record = Self {
            name: name.to_string(),
            id: id.to_string(),
            href: href.to_string(),
            input: envelope
                .pointer(&format!("{}/input", base))
                .cloned()
                .unwrap_or(Value::Null),
            status,
            time_requested,
            time_completed,
        };
        record.check_timestamps(what)?;
        Ok(record)
    }

    fn check_timestamps(&self, what: &str) -> ConformanceResult<()> {
        let path = |key: &str| format!("{} /{}/{}", what, self.name, key);
        match (self.status, self.time_requested, self.time_completed) {
            (ActionStatus::Completed, Some(requested), Some(completed)) => {
                if completed < requested {
                    return Err(ConformanceError::state(
                        format!("{} timeCompleted", what),
                        format!(">= {}", requested),
                        completed,
                    ));
                }
                Ok(())
            }
            (ActionStatus::Completed, None, _) => Err(ConformanceError::shape(
                path("timeRequested"),
                "a timestamp",
                "nothing",
            )),
            (ActionStatus::Completed, _, None) => Err(ConformanceError::shape(
                path("timeCompleted"),
                "a timestamp",
                "nothing",
            )),
            (_, _, Some(completed)) => Err(ConformanceError::shape(
                path("timeCompleted"),
                format!("nothing while {}", self.status),
                completed,
            )),
            _ => Ok(()),
        }
    }

    /// Require every field of `expected` to appear unchanged in the input
    pub fn expect_input(&self, expected: &Value) -> ConformanceResult<()> {
        if let Some(fields) = expected.as_object() {
            for (key, value) in fields {
                match self.input.get(key) {
                    Some(actual) if values_match(value, actual) => {}
                    actual => {
                        return Err(ConformanceError::shape(
                            format!("/{}/input/{}", self.name, key),
                            value,
                            actual.map_or_else(|| "nothing".to_string(), Value::to_string),
                        ))
                    }
                }
            }
        }
        Ok(())
    }

    pub fn expect_status(&self, expected: ActionStatus) -> ConformanceResult<()> {
        if self.status != expected {
            return Err(ConformanceError::state(
                format!("action {}/{}", self.name, self.id),
                expected,
                self.status,
            ));
        }
        Ok(())
    }

    /// Require a timestamp for the request time, whatever the status
    pub fn expect_time_requested(&self) -> ConformanceResult<()> {
        if self.time_requested.is_none() {
            return Err(ConformanceError::shape(
                format!("/{}/timeRequested", self.name),
                "a timestamp",
                "nothing",
            ));
        }
        Ok(())
    }
}

/// Highest status observed per action id
#[derive(Debug, Default)]
pub struct ActionTracker {
    observed: HashMap<String, ActionStatus>,
}

impl ActionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting; a status below one already seen is an error
    pub fn observe(&mut self, record: &ActionRecord) -> ConformanceResult<()> {
        let seen = self
            .observed
            .entry(record.id.clone())
            .or_insert(record.status);
        if record.status < *seen {
            return Err(ConformanceError::state(
                format!("lifecycle of action {}/{}", record.name, record.id),
                format!("{} or later", seen),
                record.status,
            ));
        }
        *seen = record.status;
        Ok(())
    }

    pub fn status_of(&self, id: &str) -> Option<ActionStatus> {
        self.observed.get(id).copied()
    }
}

/// Drives actions through the REST API
pub struct ActionDriver<'a> {
    client: &'a ThingClient,
    tracker: ActionTracker,
}

impl<'a> ActionDriver<'a> {
    pub fn new(client: &'a ThingClient) -> Self {
        Self {
            client,
            tracker: ActionTracker::new(),
        }
    }

    fn config(&self) -> &TargetConfig {
        self.client.config()
    }

    pub fn tracker_mut(&mut self) -> &mut ActionTracker {
        &mut self.tracker
    }

    fn record(&mut self, envelope: &Value, what: &str) -> ConformanceResult<ActionRecord> {
        let record = ActionRecord::from_envelope(envelope, self.client.config(), what)?;
        self.tracker.observe(&record)?;
        Ok(record)
    }

    /// `POST /actions` or `POST /actions/{name}`; the new action must be `created`
    pub async fn request_action(
        &mut self,
        name: &str,
        input: Value,
    ) -> ConformanceResult<ActionRecord> {
        let path = match self.config().action_endpoint {
            ActionEndpoint::Collection => "/actions".to_string(),
            ActionEndpoint::Typed => format!("/actions/{}", name),
        };
        let mut body = serde_json::Map::new();
        body.insert(name.to_string(), json!({ "input": input }));

        let response = self
            .client
            .post(&path, Value::Object(body))
            .await?
            .expect_status(StatusCode::CREATED)?;
        let record = self.record(response.json()?, &format!("POST {}", path))?;

        if record.name != name {
            return Err(ConformanceError::shape(
                format!("POST {} body", path),
                name,
                &record.name,
            ));
        }
        record.expect_input(&input)?;
        record.expect_status(ActionStatus::Created)?;
        debug!(id = %record.id, "action created");
        Ok(record)
    }

    /// `GET /actions` or `GET /actions/{name}`
    pub async fn list_actions(&mut self, name: Option<&str>) -> ConformanceResult<Vec<ActionRecord>> {
        let path = match name {
            Some(name) => format!("/actions/{}", name),
            None => "/actions".to_string(),
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

        let mut records = Vec::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let record = self.record(entry, &format!("GET {}[{}]", path, i))?;
            if let Some(name) = name {
                if record.name != name {
                    return Err(ConformanceError::shape(
                        format!("GET {}[{}]", path, i),
                        name,
                        &record.name,
                    ));
                }
            }
            records.push(record);
        }
        Ok(records)
    }

    /// `GET /actions/{name}/{id}`
    pub async fn get_action(&mut self, name: &str, id: &str) -> ConformanceResult<ActionRecord> {
        let path = format!("/actions/{}/{}", name, id);
        let body = self
            .client
            .get(&path)
            .await?
            .expect_status(StatusCode::OK)?
            .into_json()?;
        let record = self.record(&body, &format!("GET {}", path))?;
        if record.id != id {
            return Err(ConformanceError::shape(
                format!("GET {} href", path),
                self.config().href(&path),
                &record.href,
            ));
        }
        Ok(record)
    }

    /// `DELETE /actions/{name}/{id}`; the server answers 204 with no body
    pub async fn delete_action(&mut self, name: &str, id: &str) -> ConformanceResult<()> {
        let path = format!("/actions/{}/{}", name, id);
        self.client
            .delete(&path)
            .await?
            .expect_status(StatusCode::NO_CONTENT)?
            .expect_empty()
    }

    /// Wait until the action reports `completed`
    pub async fn poll_until_completed(
        &mut self,
        name: &str,
        id: &str,
        wait: CompletionWait,
    ) -> ConformanceResult<ActionRecord> {
        match wait {
            CompletionWait::Fixed { grace } => {
                tokio::time::sleep(grace).await;
                let record = self.get_action(name, id).await?;
                record.expect_status(ActionStatus::Completed)?;
                Ok(record)
            }
            CompletionWait::Backoff {
                timeout,
                initial,
                max,
            } => {
                let start = Instant::now();
                let mut delay = initial;
                loop {
                    let record = self.get_action(name, id).await?;
                    if record.status == ActionStatus::Completed {
                        return Ok(record);
                    }
                    if start.elapsed() >= timeout {
                        return Err(ConformanceError::Timeout {
                            what: format!("action {}/{} to complete (last {})", name, id, record.status),
                            after: timeout,
                        });
                    }
                    debug!(status = %record.status, ?delay, "action not complete yet");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(max);
                }
            }
        }
    }

    /// Require exactly one listed action, completed, with the given id and input
    pub async fn expect_single_completed(
        &mut self,
        name: &str,
        id: &str,
        input: &Value,
    ) -> ConformanceResult<ActionRecord> {
        let mut records = self.list_actions(None).await?;
        if records.len() != 1 {
            return Err(ConformanceError::state("GET /actions length", 1, records.len()));
        }
        let record = records.remove(0);
        if record.name != name || record.id != id {
            return Err(ConformanceError::state(
                "GET /actions[0]",
                self.config().href(&format!("/actions/{}/{}", name, id)),
                &record.href,
            ));
        }
        record.expect_input(input)?;
        record.expect_status(ActionStatus::Completed)?;
        Ok(record)
    }

    /// Run the REST action stage of the conformance sequence
    ///
    /// Requests one fade, waits for it, checks the listings, and deletes it.
    /// The completed fade triggers one event.
    pub async fn run(&mut self) -> ConformanceResult<()> {
        let existing = self.list_actions(None).await?;
        if !existing.is_empty() {
            return Err(ConformanceError::state(
                "GET /actions length",
                0,
                existing.len(),
            ));
        }

        let input = json!({"brightness": 50, "duration": 2000});
        let created = self.request_action("fade", input.clone()).await?;

        let wait = self.config().completion;
        self.poll_until_completed("fade", &created.id, wait).await?;

        self.expect_single_completed("fade", &created.id, &input)
            .await?;

        let typed = self.list_actions(Some("fade")).await?;
        if typed.len() != 1 || typed[0].id != created.id {
            return Err(ConformanceError::state(
                "GET /actions/fade",
                format!("only {}", created.href),
                typed.len(),
            ));
        }

        self.delete_action("fade", &created.id).await?;

        let remaining = self.list_actions(None).await?;
        if remaining.iter().any(|record| record.id == created.id) {
            return Err(ConformanceError::state(
                "GET /actions after delete",
                "no deleted action",
                &created.href,
            ));
        }

        info!(id = %created.id, "action lifecycle conforms");
        Ok(())
    }
}
