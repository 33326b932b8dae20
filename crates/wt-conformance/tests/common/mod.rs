//! In-process mock lamp for conformance tests
//!
//! Serves the lamp profile over REST and WebSocket the way a reference Web
//! Thing server does. Fades complete after a twentieth of their requested
//! duration so the suite stays fast. Flags on [`LampOptions`] make the lamp
//! misbehave in specific ways.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::{broadcast, mpsc};
use wt_conformance::SchemaVersion;

/// How the mock lamp should behave
#[derive(Debug, Clone)]
pub struct LampOptions {
    pub schema: SchemaVersion,
    pub prefix: String,
    /// Required bearer token, if any
    pub token: Option<String>,
    /// Accept property writes without applying them
    pub ignore_writes: bool,
    /// Report `completed` without ever passing through `pending`
    pub skip_pending: bool,
    /// Push events even to connections that never subscribed
    pub push_unsubscribed_events: bool,
    /// Leave fades `pending` forever
    pub never_complete: bool,
    /// Report `completed` before the brightness change and the event
    pub complete_before_side_effects: bool,
    /// Close each WebSocket right after forwarding a `pending` status
    pub close_after_pending: bool,
    /// Rewrite the timestamps of logged events whenever a new one is logged
    pub rewrite_event_history: bool,
}

impl Default for LampOptions {
    fn default() -> Self {
        Self {
            schema: SchemaVersion::Current,
            prefix: String::new(),
            token: None,
            ignore_writes: false,
            skip_pending: false,
            push_unsubscribed_events: false,
            never_complete: false,
            complete_before_side_effects: false,
            close_after_pending: false,
            rewrite_event_history: false,
        }
    }
}

#[derive(Debug, Clone)]
struct ActionEntry {
    id: String,
    input: Value,
    status: &'static str,
    time_requested: String,
    time_completed: Option<String>,
}

#[derive(Debug)]
struct LampState {
    on: bool,
    brightness: i64,
    actions: Vec<ActionEntry>,
    events: Vec<Value>,
    next_id: u64,
}

#[derive(Debug, Clone)]
enum Push {
    Property(Value),
    Action(Value),
    Event(String, Value),
}

struct Lamp {
    options: LampOptions,
    addr: SocketAddr,
    state: Mutex<LampState>,
    pushes: broadcast::Sender<Push>,
}

type AppState = Arc<Lamp>;

/// A running mock lamp
pub struct MockLamp {
    pub addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl MockLamp {
    pub async fn start(options: LampOptions) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock lamp");
        let addr = listener.local_addr().expect("mock lamp address");
        let (pushes, _) = broadcast::channel(256);

        let lamp = Arc::new(Lamp {
            options: options.clone(),
            addr,
            state: Mutex::new(LampState {
                on: true,
                brightness: 50,
                actions: Vec::new(),
                events: Vec::new(),
                next_id: 1,
            }),
            pushes,
        });

        let routes = Router::new()
            .route("/", get(root))
            .route("/properties", get(get_properties))
            .route("/properties/:name", get(get_property).put(put_property))
            .route("/actions", get(list_actions).post(post_action))
            .route(
                "/actions/:name",
                get(list_typed_actions).post(post_typed_action),
            )
            .route("/actions/:name/:id", get(get_action).delete(delete_action))
            .route("/events", get(list_events))
            .route("/events/:name", get(list_typed_events))
            .fallback(not_found)
            .layer(middleware::from_fn_with_state(lamp.clone(), require_token))
            .with_state(lamp);

        let app = if options.prefix.is_empty() {
            routes
        } else {
            Router::new().nest(&options.prefix, routes)
        };

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("mock lamp server");
        });

        Self { addr, handle }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for MockLamp {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn now() -> String {
    chrono::Utc::now()
        .format("%Y-%m-%dT%H:%M:%S+00:00")
        .to_string()
}

fn envelope(key: &str, value: Value) -> Value {
    let mut map = Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

impl Lamp {
    fn action_json(&self, action: &ActionEntry) -> Value {
        let mut fade = json!({
            "input": action.input,
            "href": format!("{}/actions/fade/{}", self.options.prefix, action.id),
            "status": action.status,
            "timeRequested": action.time_requested,
        });
        if let Some(ref completed) = action.time_completed {
            fade["timeCompleted"] = json!(completed);
        }
        envelope("fade", fade)
    }

    fn push(&self, push: Push) {
        // No receivers is fine: nobody is connected yet.
        let _ = self.pushes.send(push);
    }

    fn set_brightness(&self, value: i64) {
        self.state.lock().unwrap().brightness = value;
        self.push(Push::Property(json!({ "brightness": value })));
    }

    fn update_action(&self, id: &str, status: &'static str) {
        let snapshot = {
            let mut state = self.state.lock().unwrap();
            let Some(action) = state.actions.iter_mut().find(|a| a.id == id) else {
                return;
            };
            action.status = status;
            if status == "completed" {
                action.time_completed = Some(now());
            }
            action.clone()
        };
        self.push(Push::Action(self.action_json(&snapshot)));
    }

    /// Create a fade and start it in the background
    fn request_fade(self: &Arc<Self>, input: Value) -> Value {
        let created = {
            let mut state = self.state.lock().unwrap();
            let id = format!("{:08x}", state.next_id);
            state.next_id += 1;
            let action = ActionEntry {
                id,
                input: input.clone(),
                status: "created",
                time_requested: now(),
                time_completed: None,
            };
            state.actions.push(action.clone());
            action
        };
        let body = self.action_json(&created);
        self.push(Push::Action(body.clone()));

        let lamp = self.clone();
        tokio::spawn(async move {
            if !lamp.options.skip_pending {
                lamp.update_action(&created.id, "pending");
            }
            if lamp.options.never_complete {
                return;
            }
            let duration = input["duration"].as_u64().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(duration / 20)).await;

            let early = lamp.options.complete_before_side_effects;
            if early {
                lamp.update_action(&created.id, "completed");
            }
            lamp.set_brightness(input["brightness"].as_i64().unwrap_or(0));
            lamp.log_event(json!({"data": 102, "timestamp": now()}));
            if !early {
                lamp.update_action(&created.id, "completed");
            }
        });

        body
    }

    fn log_event(&self, event: Value) {
        {
            let mut state = self.state.lock().unwrap();
            if self.options.rewrite_event_history {
                for logged in &mut state.events {
                    logged["overheated"]["timestamp"] = json!("2000-01-01T00:00:00+00:00");
                }
            }
            state.events.push(envelope("overheated", event.clone()));
        }
        self.push(Push::Event("overheated".to_string(), event));
    }

    fn description(&self) -> Value {
        let prefix = &self.options.prefix;
        let legacy = self.options.schema == SchemaVersion::Legacy;
        let (title, label, int) = if legacy {
            ("name", "label", "number")
        } else {
            ("title", "title", "integer")
        };
        let with_link = |mut entry: Value, rel: &str, path: &str| {
            let href = format!("{}{}", prefix, path);
            if legacy {
                entry["href"] = json!(href);
            } else {
                entry["links"] = json!([{"rel": rel, "href": href}]);
            }
            entry
        };

        let mut on = Map::new();
        on.insert("@type".into(), json!("OnOffProperty"));
        on.insert(label.into(), json!("On/Off"));
        on.insert("type".into(), json!("boolean"));
        on.insert("description".into(), json!("Whether the lamp is turned on"));

        let mut brightness = Map::new();
        brightness.insert("@type".into(), json!("BrightnessProperty"));
        brightness.insert(label.into(), json!("Brightness"));
        brightness.insert("type".into(), json!(int));
        brightness.insert("description".into(), json!("The level of light from 0-100"));
        brightness.insert("minimum".into(), json!(0));
        brightness.insert("maximum".into(), json!(100));
        brightness.insert("unit".into(), json!("percent"));

        let mut fade = Map::new();
        fade.insert(label.into(), json!("Fade"));
        fade.insert("description".into(), json!("Fade the lamp to a given level"));
        fade.insert(
            "input".into(),
            json!({
                "type": "object",
                "required": ["brightness", "duration"],
                "properties": {
                    "brightness": {"type": int, "minimum": 0, "maximum": 100, "unit": "percent"},
                    "duration": {"type": int, "minimum": 1, "unit": "milliseconds"},
                },
            }),
        );

        let overheated = json!({
            "description": "The lamp has exceeded its safe operating temperature",
            "type": "number",
            "unit": "celsius",
        });

        let html_href = if prefix.is_empty() { "/".to_string() } else { prefix.clone() };

        let mut doc = Map::new();
        doc.insert(title.into(), json!("My Lamp"));
        doc.insert("@context".into(), json!("https://iot.mozilla.org/schemas"));
        doc.insert("@type".into(), json!(["OnOffSwitch", "Light"]));
        doc.insert("description".into(), json!("A web connected lamp"));
        doc.insert(
            "properties".into(),
            json!({
                "on": with_link(Value::Object(on), "property", "/properties/on"),
                "brightness": with_link(Value::Object(brightness), "property", "/properties/brightness"),
            }),
        );
        doc.insert(
            "actions".into(),
            json!({"fade": with_link(Value::Object(fade), "action", "/actions/fade")}),
        );
        doc.insert(
            "events".into(),
            json!({"overheated": with_link(overheated, "event", "/events/overheated")}),
        );
        doc.insert(
            "links".into(),
            json!([
                {"rel": "properties", "href": format!("{}/properties", prefix)},
                {"rel": "actions", "href": format!("{}/actions", prefix)},
                {"rel": "events", "href": format!("{}/events", prefix)},
                {"rel": "alternate", "href": format!("ws://{}{}", self.addr, prefix)},
                {"rel": "alternate", "mediaType": "text/html", "href": html_href},
            ]),
        );
        Value::Object(doc)
    }
}

// =============================================================================
// REST handlers
// =============================================================================

async fn require_token(
    State(lamp): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    request: Request,
    next: Next,
) -> Response {
    if let Some(ref token) = lamp.options.token {
        let header_ok = request
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            == Some(format!("Bearer {}", token).as_str());
        let query_ok = query.get("jwt") == Some(token);
        if !header_ok && !query_ok {
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }
    next.run(request).await
}

async fn root(State(lamp): State<AppState>, ws: Option<WebSocketUpgrade>) -> Response {
    match ws {
        Some(ws) => ws.on_upgrade(move |socket| handle_socket(socket, lamp)),
        None => Json(lamp.description()).into_response(),
    }
}

async fn get_properties(State(lamp): State<AppState>) -> Json<Value> {
    let state = lamp.state.lock().unwrap();
    Json(json!({"on": state.on, "brightness": state.brightness}))
}

async fn get_property(
    State(lamp): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let state = lamp.state.lock().unwrap();
    let value = match name.as_str() {
        "on" => json!(state.on),
        "brightness" => json!(state.brightness),
        _ => return Err(StatusCode::NOT_FOUND),
    };
    Ok(Json(envelope(&name, value)))
}

async fn put_property(
    State(lamp): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, StatusCode> {
    let value = body.get(&name).cloned().ok_or(StatusCode::BAD_REQUEST)?;
    if !lamp.options.ignore_writes {
        match name.as_str() {
            "on" => lamp.state.lock().unwrap().on = value.as_bool().ok_or(StatusCode::BAD_REQUEST)?,
            "brightness" => lamp.set_brightness(value.as_i64().ok_or(StatusCode::BAD_REQUEST)?),
            _ => return Err(StatusCode::NOT_FOUND),
        }
    }
    Ok(Json(envelope(&name, value)))
}

fn fade_input(body: &Value) -> Result<Value, StatusCode> {
    body.pointer("/fade/input")
        .cloned()
        .ok_or(StatusCode::BAD_REQUEST)
}

async fn post_action(
    State(lamp): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let input = fade_input(&body)?;
    Ok((StatusCode::CREATED, Json(lamp.request_fade(input))))
}

async fn post_typed_action(
    State(lamp): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    if name != "fade" {
        return Err(StatusCode::NOT_FOUND);
    }
    let input = fade_input(&body)?;
    Ok((StatusCode::CREATED, Json(lamp.request_fade(input))))
}

async fn list_actions(State(lamp): State<AppState>) -> Json<Value> {
    let actions = lamp.state.lock().unwrap().actions.clone();
    Json(Value::Array(
        actions.iter().map(|a| lamp.action_json(a)).collect(),
    ))
}

async fn list_typed_actions(
    State(lamp): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    if name != "fade" {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(list_actions(State(lamp)).await)
}

/// Tornado-style HTML error page
async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Html("<html><title>404: Not Found</title><body>404: Not Found</body></html>"),
    )
        .into_response()
}

async fn get_action(
    State(lamp): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> Result<Json<Value>, Response> {
    let action = lamp
        .state
        .lock()
        .unwrap()
        .actions
        .iter()
        .find(|a| name == "fade" && a.id == id)
        .cloned();
    match action {
        Some(action) => Ok(Json(lamp.action_json(&action))),
        None => Err(not_found().await),
    }
}

async fn delete_action(
    State(lamp): State<AppState>,
    Path((name, id)): Path<(String, String)>,
) -> StatusCode {
    let mut state = lamp.state.lock().unwrap();
    let before = state.actions.len();
    state.actions.retain(|a| !(name == "fade" && a.id == id));
    if state.actions.len() == before {
        StatusCode::NOT_FOUND
    } else {
        StatusCode::NO_CONTENT
    }
}

async fn list_events(State(lamp): State<AppState>) -> Json<Value> {
    Json(Value::Array(lamp.state.lock().unwrap().events.clone()))
}

async fn list_typed_events(
    State(lamp): State<AppState>,
    Path(name): Path<String>,
) -> Json<Value> {
    let events = lamp.state.lock().unwrap().events.clone();
    Json(Value::Array(
        events
            .into_iter()
            .filter(|e| e.get(&name).is_some())
            .collect(),
    ))
}

// =============================================================================
// WebSocket handler
// =============================================================================

async fn handle_socket(socket: WebSocket, lamp: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let subscriptions: Arc<Mutex<HashSet<String>>> = Arc::default();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sender.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    let mut pushes = lamp.pushes.subscribe();
    let forward_tx = tx.clone();
    let forward_subs = subscriptions.clone();
    let push_all_events = lamp.options.push_unsubscribed_events;
    let close_after_pending = lamp.options.close_after_pending;
    let forwarder = tokio::spawn(async move {
        loop {
            let push = match pushes.recv().await {
                Ok(push) => push,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let mut closing = false;
            let message = match push {
                Push::Property(data) => json!({"messageType": "propertyStatus", "data": data}),
                Push::Action(data) => {
                    closing = close_after_pending && data["fade"]["status"] == "pending";
                    json!({"messageType": "actionStatus", "data": data})
                }
                Push::Event(name, data) => {
                    let subscribed = forward_subs.lock().unwrap().contains(&name);
                    if !subscribed && !push_all_events {
                        continue;
                    }
                    json!({"messageType": "event", "data": envelope(&name, data)})
                }
            };
            if forward_tx.send(Message::Text(message.to_string())).is_err() {
                break;
            }
            if closing {
                let _ = forward_tx.send(Message::Close(None));
                break;
            }
        }
    });

    while let Some(Ok(message)) = receiver.next().await {
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            _ => continue,
        };
        let Ok(command) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let data = command.get("data").cloned().unwrap_or(Value::Null);

        match command.get("messageType").and_then(Value::as_str) {
            Some("setProperty") => {
                if let Some(value) = data.get("brightness").and_then(Value::as_i64) {
                    lamp.set_brightness(value);
                }
            }
            Some("requestAction") => {
                if let Some(input) = data.pointer("/fade/input") {
                    lamp.request_fade(input.clone());
                }
            }
            Some("addEventSubscription") => {
                if let Some(names) = data.as_object() {
                    subscriptions
                        .lock()
                        .unwrap()
                        .extend(names.keys().cloned());
                }
            }
            _ => {
                let error = json!({
                    "messageType": "error",
                    "data": {"status": "400 Bad Request", "message": "Unknown messageType"},
                });
                let _ = tx.send(Message::Text(error.to_string()));
            }
        }
    }

    forwarder.abort();
    writer.abort();
}
