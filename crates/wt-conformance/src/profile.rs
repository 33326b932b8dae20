//! Device profiles the harness checks a target against
//!
//! A profile is plain data: what the Thing Description must say and which
//! values the conformance sequence expects to observe. The only profile the
//! protocol test servers implement is the lamp.

/// JSON type of a numeric field, before a schema variant decides how it is spelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericKind {
    /// Whole numbers (`integer` in the current format, `number` in the legacy one)
    Integer,
    /// Real numbers (`number` in both formats)
    Real,
}

/// Value type of a property, event, or input field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Boolean,
    Numeric(NumericKind),
}

/// Bounds and unit of a field
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Bounds {
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub unit: Option<&'static str>,
}

#[derive(Debug, Clone)]
pub struct PropertyProfile {
    pub name: &'static str,
    pub semantic_type: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub kind: ValueKind,
    pub bounds: Bounds,
}

#[derive(Debug, Clone)]
pub struct InputField {
    pub name: &'static str,
    pub kind: ValueKind,
    pub bounds: Bounds,
}

#[derive(Debug, Clone)]
pub struct ActionProfile {
    pub name: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub input: Vec<InputField>,
}

#[derive(Debug, Clone)]
pub struct EventProfile {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: ValueKind,
    pub unit: &'static str,
}

/// Everything the harness knows in advance about the device under test
#[derive(Debug, Clone)]
pub struct DeviceProfile {
    pub title: &'static str,
    pub context: &'static str,
    pub semantic_types: Vec<&'static str>,
    pub description: &'static str,
    pub properties: Vec<PropertyProfile>,
    pub actions: Vec<ActionProfile>,
    pub events: Vec<EventProfile>,
    /// Brightness the lamp reports before the harness touches it
    pub initial_brightness: i64,
    /// Value carried by every `overheated` event a fade triggers
    pub overheated_value: i64,
}

impl DeviceProfile {
    /// The reference lamp: on/off and brightness, a fade action, an overheated event
    pub fn lamp() -> Self {
        Self {
            title: "My Lamp",
            context: "https://iot.mozilla.org/schemas",
            semantic_types: vec!["OnOffSwitch", "Light"],
            description: "A web connected lamp",
            properties: vec![
                PropertyProfile {
                    name: "on",
                    semantic_type: "OnOffProperty",
                    title: "On/Off",
                    description: "Whether the lamp is turned on",
                    kind: ValueKind::Boolean,
                    bounds: Bounds::default(),
                },
                PropertyProfile {
                    name: "brightness",
                    semantic_type: "BrightnessProperty",
                    title: "Brightness",
                    description: "The level of light from 0-100",
                    kind: ValueKind::Numeric(NumericKind::Integer),
                    bounds: Bounds {
                        minimum: Some(0.0),
                        maximum: Some(100.0),
                        unit: Some("percent"),
                    },
                },
            ],
            actions: vec![ActionProfile {
                name: "fade",
                title: "Fade",
                description: "Fade the lamp to a given level",
                input: vec![
                    InputField {
                        name: "brightness",
                        kind: ValueKind::Numeric(NumericKind::Integer),
                        bounds: Bounds {
                            minimum: Some(0.0),
                            maximum: Some(100.0),
                            unit: Some("percent"),
                        },
                    },
                    InputField {
                        name: "duration",
                        kind: ValueKind::Numeric(NumericKind::Integer),
                        bounds: Bounds {
                            minimum: Some(1.0),
                            maximum: None,
                            unit: Some("milliseconds"),
                        },
                    },
                ],
            }],
            events: vec![EventProfile {
                name: "overheated",
                description: "The lamp has exceeded its safe operating temperature",
                kind: ValueKind::Numeric(NumericKind::Real),
                unit: "celsius",
            }],
            initial_brightness: 50,
            overheated_value: 102,
        }
    }

    pub fn supports_actions(&self) -> bool {
        !self.actions.is_empty()
    }

    pub fn supports_events(&self) -> bool {
        !self.events.is_empty()
    }
}
