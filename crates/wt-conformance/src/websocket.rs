//! WebSocket session checks
//!
//! A single command can produce several notifications. Some pairs arrive in
//! a fixed order (`created` before `pending`), while the completion of an
//! action races its own side effects. The fixed prefix is read strictly and
//! the racing suffix goes through an [`Accumulator`].

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::actions::{ActionDriver, ActionRecord, ActionStatus, ActionTracker};
use crate::config::TargetConfig;
use crate::error::{ConformanceError, ConformanceResult};
use crate::events::{EventLog, EventRecord};
use crate::expect::values_match;
use crate::messages::{Command, Notification, NotificationKind};
use crate::profile::DeviceProfile;
use crate::properties::PropertyChecker;
use crate::ws_client::ThingSocket;

/// Stray echoes of the last `setProperty` tolerated before an action reply
const MAX_STRAY_ECHOES: usize = 4;

/// Which events a connection has asked for
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subscription {
    /// Property and action notifications only
    Default,
    /// Default plus the named event types
    Custom(BTreeSet<String>),
}

/// Lifecycle of one WebSocket connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    /// Open, nothing received yet
    Connected,
    /// The server has pushed at least one notification
    Subscribed(Subscription),
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connected => "connected",
            SessionState::Subscribed(Subscription::Default) => "subscribed (default)",
            SessionState::Subscribed(Subscription::Custom(_)) => "subscribed (custom)",
        }
    }
}

/// Set-completion accumulator for notifications that may arrive in any order
///
/// Fed one notification at a time. Each expected kind may arrive once; any
/// other kind, or a repeat, is an error.
#[derive(Debug)]
pub struct Accumulator {
    received: BTreeMap<NotificationKind, bool>,
}

impl Accumulator {
    pub fn new(kinds: impl IntoIterator<Item = NotificationKind>) -> Self {
        Self {
            received: kinds.into_iter().map(|kind| (kind, false)).collect(),
        }
    }

    /// Number of receives the caller should perform
    pub fn expected(&self) -> usize {
        self.received.len()
    }

    pub fn accept(&mut self, notification: &Notification) -> ConformanceResult<()> {
        match self.received.get_mut(&notification.kind) {
            Some(seen) if !*seen => {
                *seen = true;
                Ok(())
            }
            Some(_) => Err(notification.unexpected("duplicate while collecting")),
            None => Err(notification.unexpected("not expected while collecting")),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.received.values().all(|seen| *seen)
    }

    pub fn missing(&self) -> Vec<NotificationKind> {
        self.received
            .iter()
            .filter(|(_, seen)| !**seen)
            .map(|(kind, _)| *kind)
            .collect()
    }
}

/// A validated WebSocket connection to the thing
pub struct WebSocketSession {
    socket: Option<ThingSocket>,
    state: SessionState,
    config: TargetConfig,
    last_set: Option<Map<String, Value>>,
}

impl WebSocketSession {
    /// Open the advertised channel
    pub async fn connect(href: &str, config: &TargetConfig) -> ConformanceResult<Self> {
        let socket = ThingSocket::connect(href, config).await?;
        info!(%href, "websocket connected");
        Ok(Self {
            socket: Some(socket),
            state: SessionState::Connected,
            config: config.clone(),
            last_set: None,
        })
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    fn socket(&mut self, operation: &'static str) -> ConformanceResult<&mut ThingSocket> {
        let state = self.state.name();
        self.socket
            .as_mut()
            .ok_or(ConformanceError::InvalidSession { state, operation })
    }

    async fn send(&mut self, command: Command) -> ConformanceResult<()> {
        self.socket(command.message_type())?.send(&command).await
    }

    async fn recv(&mut self, expecting: &str) -> ConformanceResult<Notification> {
        let notification = self.socket("receive")?.recv(expecting).await?;
        if self.state == SessionState::Connected {
            self.state = SessionState::Subscribed(Subscription::Default);
        }
        Ok(notification)
    }

    /// Send `setProperty` and require exactly one matching `propertyStatus`
    pub async fn set_property(&mut self, name: &str, value: Value) -> ConformanceResult<()> {
        self.send(Command::set_property(name, value.clone())).await?;

        let reply = self.recv("propertyStatus").await?;
        if reply.kind != NotificationKind::PropertyStatus {
            return Err(reply.unexpected("expected propertyStatus after setProperty"));
        }
        expect_property_status(&reply, name, &value)?;

        let mut echo = Map::new();
        echo.insert(name.to_string(), value);
        self.last_set = Some(echo);
        Ok(())
    }

    /// Send `requestAction` and read the fixed `created`, `pending` prefix
    ///
    /// Returns the `created` record. With `require_time_requested` both
    /// replies must carry `timeRequested`.
    pub async fn request_action(
        &mut self,
        name: &str,
        input: Value,
        require_time_requested: bool,
        tracker: &mut ActionTracker,
    ) -> ConformanceResult<ActionRecord> {
        self.send(Command::request_action(name, input.clone()))
            .await?;

        let first = self.first_action_reply().await?;
        let created = action_record(&first, &self.config, tracker)?;
        check_action_reply(&created, name, &input, ActionStatus::Created)?;

        let second = self.recv("pending actionStatus").await?;
        if second.kind != NotificationKind::ActionStatus {
            return Err(second.unexpected("expected pending actionStatus"));
        }
        let pending = action_record(&second, &self.config, tracker)?;
        check_action_reply(&pending, name, &input, ActionStatus::Pending)?;
        if pending.id != created.id {
            return Err(ConformanceError::state(
                "pending actionStatus href",
                &created.href,
                &pending.href,
            ));
        }

        if require_time_requested {
            created.expect_time_requested()?;
            pending.expect_time_requested()?;
        }
        Ok(created)
    }

    /// The first action reply, skipping echoes of the last property set
    async fn first_action_reply(&mut self) -> ConformanceResult<Notification> {
        for _ in 0..=MAX_STRAY_ECHOES {
            let message = self.recv("created actionStatus").await?;
            match message.kind {
                NotificationKind::ActionStatus => return Ok(message),
                NotificationKind::PropertyStatus if self.is_echo(&message) => {
                    warn!(data = %message.data, "skipping repeated propertyStatus");
                }
                _ => return Err(message.unexpected("expected created actionStatus")),
            }
        }
        Err(ConformanceError::UnexpectedMessage {
            message_type: NotificationKind::PropertyStatus.to_string(),
            detail: format!("more than {} repeated echoes", MAX_STRAY_ECHOES),
        })
    }

    fn is_echo(&self, message: &Notification) -> bool {
        match &self.last_set {
            Some(last) => values_match(&Value::Object(last.clone()), &message.data),
            None => false,
        }
    }

    /// Send `addEventSubscription`; subscriptions only ever grow
    pub async fn add_event_subscription(&mut self, names: &[&str]) -> ConformanceResult<()> {
        self.send(Command::add_event_subscription(names.iter().copied()))
            .await?;

        let mut subscribed = match &self.state {
            SessionState::Subscribed(Subscription::Custom(existing)) => existing.clone(),
            _ => BTreeSet::new(),
        };
        subscribed.extend(names.iter().map(|name| name.to_string()));
        self.state = SessionState::Subscribed(Subscription::Custom(subscribed));
        Ok(())
    }

    /// Whether event notifications of this type are expected on the connection
    pub fn is_subscribed_to(&self, event: &str) -> bool {
        matches!(&self.state, SessionState::Subscribed(Subscription::Custom(names)) if names.contains(event))
    }

    /// Receive exactly `kinds.len()` notifications in any order
    ///
    /// `check` validates the content of each one as it arrives.
    pub async fn collect_unordered<F>(
        &mut self,
        kinds: &[NotificationKind],
        mut check: F,
    ) -> ConformanceResult<Vec<Notification>>
    where
        F: FnMut(&Notification) -> ConformanceResult<()>,
    {
        let mut accumulator = Accumulator::new(kinds.iter().copied());
        let mut received = Vec::with_capacity(accumulator.expected());

        for _ in 0..accumulator.expected() {
            let expecting = format!("{:?}", accumulator.missing());
            let message = self.recv(&expecting).await?;
            accumulator.accept(&message)?;
            check(&message)?;
            debug!(kind = %message.kind, "collected notification");
            received.push(message);
        }

        if !accumulator.is_complete() {
            return Err(ConformanceError::state(
                "unordered notifications",
                format!("{:?}", kinds),
                format!("missing {:?}", accumulator.missing()),
            ));
        }
        Ok(received)
    }

    /// Close the connection
    pub async fn close(&mut self) -> ConformanceResult<()> {
        if let Some(socket) = self.socket.take() {
            socket.close().await?;
        }
        self.state = SessionState::Disconnected;
        Ok(())
    }
}

fn action_record(
    message: &Notification,
    config: &TargetConfig,
    tracker: &mut ActionTracker,
) -> ConformanceResult<ActionRecord> {
    let record = ActionRecord::from_envelope(&message.data, config, "actionStatus data")?;
    tracker.observe(&record)?;
    Ok(record)
}

fn expect_property_status(
    message: &Notification,
    name: &str,
    expected: &Value,
) -> ConformanceResult<()> {
    match message.data.get(name) {
        Some(actual) if values_match(expected, actual) => Ok(()),
        actual => Err(ConformanceError::shape(
            format!("propertyStatus /{}", name),
            expected,
            actual.map_or_else(|| "nothing".to_string(), Value::to_string),
        )),
    }
}

fn check_action_reply(
    record: &ActionRecord,
    name: &str,
    input: &Value,
    status: ActionStatus,
) -> ConformanceResult<()> {
    if record.name != name {
        return Err(ConformanceError::shape("actionStatus data", name, &record.name));
    }
    record.expect_input(input)?;
    record.expect_status(status)
}

/// Checks a completed action's racing notifications as they arrive
fn check_completion(
    message: &Notification,
    config: &TargetConfig,
    tracker: &mut ActionTracker,
    action: &ActionRecord,
    input: &Value,
    profile: &DeviceProfile,
) -> ConformanceResult<()> {
    match message.kind {
        NotificationKind::PropertyStatus => {
            let brightness = input.get("brightness").cloned().unwrap_or(Value::Null);
            expect_property_status(message, "brightness", &brightness)
        }
        NotificationKind::ActionStatus => {
            let record = action_record(message, config, tracker)?;
            check_action_reply(&record, &action.name, input, ActionStatus::Completed)?;
            if record.id != action.id {
                return Err(ConformanceError::state(
                    "completed actionStatus href",
                    &action.href,
                    &record.href,
                ));
            }
            Ok(())
        }
        NotificationKind::Event => {
            let event = EventRecord::from_envelope(&message.data, "event data")?;
            event.expect(
                profile.events.first().map_or("", |event| event.name),
                &json!(profile.overheated_value),
            )
        }
    }
}

/// Run the WebSocket stage of the conformance sequence
///
/// Expects the REST stages to have left the action log empty and one event
/// logged.
pub async fn run_session(
    href: &str,
    profile: &DeviceProfile,
    properties: &PropertyChecker<'_>,
    actions: &mut ActionDriver<'_>,
    events: &mut EventLog<'_>,
    config: &TargetConfig,
) -> ConformanceResult<()> {
    let mut session = WebSocketSession::connect(href, config).await?;
    let result = drive_session(&mut session, profile, properties, actions, events).await;

    // Close even after a failure, but report the original error.
    let closed = session.close().await;
    result?;
    closed?;
    info!("websocket session conforms");
    Ok(())
}

async fn drive_session(
    session: &mut WebSocketSession,
    profile: &DeviceProfile,
    properties: &PropertyChecker<'_>,
    actions: &mut ActionDriver<'_>,
    events: &mut EventLog<'_>,
) -> ConformanceResult<()> {
    let event_name = profile.events.first().map_or("overheated", |event| event.name);

    // setProperty is visible to REST immediately.
    session.set_property("brightness", json!(10)).await?;
    properties.expect_property("brightness", &json!(10)).await?;

    // requestAction with the default subscription: no event notification.
    let input = json!({"brightness": 90, "duration": 1000});
    let action = session
        .request_action("fade", input.clone(), false, actions.tracker_mut())
        .await?;
    let mut kinds = vec![NotificationKind::PropertyStatus, NotificationKind::ActionStatus];
    if session.is_subscribed_to(event_name) {
        kinds.push(NotificationKind::Event);
    }
    collect_completion(session, &kinds, actions, &action, &input, profile).await?;
    events.record_trigger();

    actions
        .expect_single_completed("fade", &action.id, &input)
        .await?;
    let fetched = actions.get_action("fade", &action.id).await?;
    fetched.expect_status(ActionStatus::Completed)?;
    events.verify().await?;

    // After subscribing, the next fade also pushes its event.
    session.add_event_subscription(&[event_name]).await?;
    let input = json!({"brightness": 100, "duration": 500});
    let action = session
        .request_action("fade", input.clone(), true, actions.tracker_mut())
        .await?;
    let kinds = [
        NotificationKind::PropertyStatus,
        NotificationKind::Event,
        NotificationKind::ActionStatus,
    ];
    collect_completion(session, &kinds, actions, &action, &input, profile).await?;
    events.record_trigger();
    events.verify().await?;

    properties
        .expect_property("brightness", &json!(100))
        .await?;
    Ok(())
}

async fn collect_completion(
    session: &mut WebSocketSession,
    kinds: &[NotificationKind],
    actions: &mut ActionDriver<'_>,
    action: &ActionRecord,
    input: &Value,
    profile: &DeviceProfile,
) -> ConformanceResult<()> {
    let config = session.config.clone();
    let tracker = actions.tracker_mut();
    session
        .collect_unordered(kinds, |message| {
            check_completion(message, &config, tracker, action, input, profile)
        })
        .await?;
    Ok(())
}
