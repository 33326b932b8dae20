//! Configuration for a conformance run
//!
//! A [`TargetConfig`] is built once and threaded by reference through every
//! component, so one process can check several targets side by side.

use std::env;
use std::fmt;
use std::net::UdpSocket;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

/// Grace period the device is given to finish a fade before it is checked
pub const DEFAULT_GRACE: Duration = Duration::from_millis(2500);

/// Overall limit for the polling completion wait
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default port for Web Thing servers
pub const DEFAULT_PORT: u16 = 8888;

/// A configuration value could not be parsed
#[derive(Debug, Error)]
#[error("invalid value '{value}' for {key}")]
pub struct InvalidValue {
    pub key: &'static str,
    pub value: String,
}

/// HTTP scheme used to reach the target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    /// The WebSocket scheme that mirrors this HTTP scheme
    pub fn ws_scheme(&self) -> &'static str {
        match self {
            Scheme::Http => "ws",
            Scheme::Https => "wss",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

impl FromStr for Scheme {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(InvalidValue {
                key: "protocol",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which Thing Description format the target is expected to serve
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SchemaVersion {
    /// Flat capability objects with a bare `href`, `number` typing throughout
    Legacy,
    /// Capability objects carrying `links`, `integer` typing for whole numbers
    #[default]
    Current,
}

impl FromStr for SchemaVersion {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy" => Ok(SchemaVersion::Legacy),
            "current" => Ok(SchemaVersion::Current),
            other => Err(InvalidValue {
                key: "schema",
                value: other.to_string(),
            }),
        }
    }
}

/// Which collection REST action requests are posted to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ActionEndpoint {
    /// `POST /actions`
    #[default]
    Collection,
    /// `POST /actions/{name}`
    Typed,
}

impl FromStr for ActionEndpoint {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collection" => Ok(ActionEndpoint::Collection),
            "typed" => Ok(ActionEndpoint::Typed),
            other => Err(InvalidValue {
                key: "action endpoint",
                value: other.to_string(),
            }),
        }
    }
}

/// Which completion wait strategy to use, as named on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WaitMode {
    #[default]
    Fixed,
    Poll,
}

impl FromStr for WaitMode {
    type Err = InvalidValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fixed" => Ok(WaitMode::Fixed),
            "poll" => Ok(WaitMode::Poll),
            other => Err(InvalidValue {
                key: "completion wait",
                value: other.to_string(),
            }),
        }
    }
}

/// How the harness waits for a REST-requested action to complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionWait {
    /// Sleep for a fixed grace period, then require `completed`
    Fixed { grace: Duration },
    /// Poll the action with exponential backoff until `completed` or timeout
    Backoff {
        timeout: Duration,
        initial: Duration,
        max: Duration,
    },
}

impl CompletionWait {
    /// Backoff polling with the given overall timeout and default intervals
    pub fn backoff(timeout: Duration) -> Self {
        CompletionWait::Backoff {
            timeout,
            initial: Duration::from_millis(50),
            max: Duration::from_millis(500),
        }
    }

    /// Build the wait for a mode; each mode only reads its own duration
    pub fn from_mode(mode: WaitMode, grace: Option<Duration>, poll_timeout: Option<Duration>) -> Self {
        match mode {
            WaitMode::Fixed => CompletionWait::Fixed {
                grace: grace.unwrap_or(DEFAULT_GRACE),
            },
            WaitMode::Poll => CompletionWait::backoff(poll_timeout.unwrap_or(DEFAULT_POLL_TIMEOUT)),
        }
    }
}

impl Default for CompletionWait {
    fn default() -> Self {
        CompletionWait::Fixed {
            grace: DEFAULT_GRACE,
        }
    }
}

/// Everything needed to reach and check one Web Thing server
#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    /// Prefix prepended to every path, without a trailing slash
    pub path_prefix: String,
    /// Full `Authorization` header value, e.g. `Bearer abc`
    pub authorization: Option<String>,
    pub schema: SchemaVersion,
    pub action_endpoint: ActionEndpoint,
    pub completion: CompletionWait,
    /// Timeout for each HTTP request
    pub request_timeout: Duration,
    /// Timeout for each WebSocket connect or receive
    pub receive_timeout: Duration,
}

impl TargetConfig {
    /// Create a configuration with default settings for the given target
    pub fn new(scheme: Scheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
            path_prefix: String::new(),
            authorization: None,
            schema: SchemaVersion::default(),
            action_endpoint: ActionEndpoint::default(),
            completion: CompletionWait::default(),
            request_timeout: Duration::from_secs(30),
            receive_timeout: Duration::from_secs(10),
        }
    }

    /// Load configuration from `WEBTHING_*` environment variables
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Load configuration from `WEBTHING_*` variables supplied by `lookup`
    ///
    /// Unset or unparsable values fall back to their defaults.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| lookup(key).and_then(|v| v.parse::<u64>().ok());
        let scheme = parse_var(&lookup, "WEBTHING_PROTOCOL").unwrap_or_default();
        let host = lookup("WEBTHING_HOST").unwrap_or_else(local_ip);
        let port = parse_var(&lookup, "WEBTHING_PORT").unwrap_or(DEFAULT_PORT);

        let mut config = Self::new(scheme, host, port)
            .with_path_prefix(lookup("WEBTHING_PATH_PREFIX").unwrap_or_default());
        config.authorization = lookup("WEBTHING_AUTH_HEADER");
        config.schema = parse_var(&lookup, "WEBTHING_SCHEMA").unwrap_or_default();
        config.action_endpoint = parse_var(&lookup, "WEBTHING_ACTION_ENDPOINT").unwrap_or_default();
        config.completion = CompletionWait::from_mode(
            parse_var(&lookup, "WEBTHING_COMPLETION_WAIT").unwrap_or_default(),
            parse("WEBTHING_GRACE_MS").map(Duration::from_millis),
            parse("WEBTHING_POLL_TIMEOUT_MS").map(Duration::from_millis),
        );
        config
    }

    pub fn with_path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = prefix.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_authorization(mut self, header: impl Into<String>) -> Self {
        self.authorization = Some(header.into());
        self
    }

    pub fn with_schema(mut self, schema: SchemaVersion) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_action_endpoint(mut self, endpoint: ActionEndpoint) -> Self {
        self.action_endpoint = endpoint;
        self
    }

    pub fn with_completion(mut self, completion: CompletionWait) -> Self {
        self.completion = completion;
        self
    }

    /// `scheme://host[:port]`, omitting the port when it is the scheme default
    pub fn base_url(&self) -> String {
        if self.port == self.scheme.default_port() {
            format!("{}://{}", self.scheme, self.host)
        } else {
            format!("{}://{}:{}", self.scheme, self.host, self.port)
        }
    }

    /// Absolute URL for a path below the path prefix
    pub fn url(&self, path: &str) -> String {
        let url = format!("{}{}{}", self.base_url(), self.path_prefix, path);
        url.trim_end_matches('/').to_string()
    }

    /// The href a server is expected to advertise for a path
    pub fn href(&self, path: &str) -> String {
        format!("{}{}", self.path_prefix, path)
    }

    /// The bare token carried by a bearer authorization header
    pub fn credential(&self) -> Option<&str> {
        let header = self.authorization.as_deref()?;
        Some(match header.split_once(' ') {
            Some((_, token)) => token.trim(),
            None => header.trim(),
        })
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    lookup(key).and_then(|v| v.parse().ok())
}

/// The address this machine uses for its default route, or loopback
pub fn local_ip() -> String {
    // Connecting a UDP socket sends nothing; it only selects a route.
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("10.255.255.255:1")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|_| "127.0.0.1".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_omits_default_port() {
        let config = TargetConfig::new(Scheme::Http, "10.0.0.2", 80);
        assert_eq!(config.base_url(), "http://10.0.0.2");

        let config = TargetConfig::new(Scheme::Https, "lamp.local", 443);
        assert_eq!(config.base_url(), "https://lamp.local");

        let config = TargetConfig::new(Scheme::Https, "lamp.local", 8443);
        assert_eq!(config.base_url(), "https://lamp.local:8443");
    }

    #[test]
    fn test_url_joins_prefix_and_trims() {
        let config = TargetConfig::new(Scheme::Http, "127.0.0.1", 8888).with_path_prefix("/0/");
        assert_eq!(config.path_prefix, "/0");
        assert_eq!(config.url("/"), "http://127.0.0.1:8888/0");
        assert_eq!(
            config.url("/properties/brightness"),
            "http://127.0.0.1:8888/0/properties/brightness"
        );
        assert_eq!(config.href("/actions"), "/0/actions");
    }

    #[test]
    fn test_credential_strips_scheme() {
        let config =
            TargetConfig::new(Scheme::Http, "localhost", 8888).with_authorization("Bearer abc.def");
        assert_eq!(config.credential(), Some("abc.def"));

        let config = TargetConfig::new(Scheme::Http, "localhost", 8888);
        assert_eq!(config.credential(), None);
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("https".parse::<Scheme>().unwrap(), Scheme::Https);
        assert_eq!(
            "legacy".parse::<SchemaVersion>().unwrap(),
            SchemaVersion::Legacy
        );
        assert_eq!(
            "typed".parse::<ActionEndpoint>().unwrap(),
            ActionEndpoint::Typed
        );
        assert_eq!("poll".parse::<WaitMode>().unwrap(), WaitMode::Poll);
        assert!("gopher".parse::<Scheme>().is_err());
    }

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: std::collections::HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_from_vars_selects_wait_mode() {
        let config = TargetConfig::from_vars(vars(&[
            ("WEBTHING_HOST", "lamp.local"),
            ("WEBTHING_POLL_TIMEOUT_MS", "4000"),
        ]));
        assert_eq!(config.host, "lamp.local");
        assert_eq!(
            config.completion,
            CompletionWait::Fixed {
                grace: DEFAULT_GRACE
            }
        );

        let config = TargetConfig::from_vars(vars(&[
            ("WEBTHING_HOST", "lamp.local"),
            ("WEBTHING_COMPLETION_WAIT", "poll"),
            ("WEBTHING_POLL_TIMEOUT_MS", "4000"),
        ]));
        assert_eq!(
            config.completion,
            CompletionWait::backoff(Duration::from_millis(4000))
        );

        let config = TargetConfig::from_vars(vars(&[
            ("WEBTHING_HOST", "lamp.local"),
            ("WEBTHING_GRACE_MS", "800"),
        ]));
        assert_eq!(
            config.completion,
            CompletionWait::Fixed {
                grace: Duration::from_millis(800)
            }
        );
    }

    #[test]
    fn test_from_vars_reads_target() {
        let config = TargetConfig::from_vars(vars(&[
            ("WEBTHING_PROTOCOL", "https"),
            ("WEBTHING_HOST", "lamp.local"),
            ("WEBTHING_PORT", "443"),
            ("WEBTHING_PATH_PREFIX", "/0/"),
            ("WEBTHING_SCHEMA", "legacy"),
            ("WEBTHING_ACTION_ENDPOINT", "typed"),
        ]));
        assert_eq!(config.url("/"), "https://lamp.local/0");
        assert_eq!(config.schema, SchemaVersion::Legacy);
        assert_eq!(config.action_endpoint, ActionEndpoint::Typed);
        assert_eq!(config.authorization, None);
    }

    #[test]
    fn test_default_completion_is_fixed_grace() {
        let config = TargetConfig::new(Scheme::Http, "localhost", 8888);
        assert_eq!(
            config.completion,
            CompletionWait::Fixed {
                grace: DEFAULT_GRACE
            }
        );
    }
}
