//! Thing Description validation
//!
//! The protocol has two description formats that differ along one axis: how a
//! capability names itself and links to its resource, and whether whole
//! numbers are typed `integer`. [`DescriptionSchema`] captures that axis so
//! the field-by-field checks are written once.

use std::collections::HashSet;

use regex::Regex;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{SchemaVersion, TargetConfig};
use crate::error::{ConformanceError, ConformanceResult};
use crate::expect::{expect_array, expect_str, expect_value};
use crate::profile::{Bounds, DeviceProfile, NumericKind, ValueKind};

/// The parts of the description format that vary between versions
pub trait DescriptionSchema: Send + Sync {
    fn version(&self) -> SchemaVersion;

    /// Key holding the thing's display name
    fn title_key(&self) -> &'static str;

    /// Key holding a capability's display name
    fn capability_title_key(&self) -> &'static str;

    /// Spelling of a numeric JSON type
    fn numeric_type(&self, kind: NumericKind) -> &'static str;

    /// The href a capability entry advertises for its resource
    ///
    /// `pointer` locates the entry in `doc`; `rel` is the link relation the
    /// current format uses (`property`, `action`, `event`).
    fn capability_href<'a>(
        &self,
        doc: &'a Value,
        pointer: &str,
        rel: &str,
    ) -> ConformanceResult<&'a str>;

    fn type_name(&self, kind: ValueKind) -> &'static str {
        match kind {
            ValueKind::Boolean => "boolean",
            ValueKind::Numeric(numeric) => self.numeric_type(numeric),
        }
    }
}

/// Flat capability objects with a bare `href`
pub struct LegacySchema;

impl DescriptionSchema for LegacySchema {
    fn version(&self) -> SchemaVersion {
        SchemaVersion::Legacy
    }

    fn title_key(&self) -> &'static str {
        "name"
    }

    fn capability_title_key(&self) -> &'static str {
        "label"
    }

    fn numeric_type(&self, _kind: NumericKind) -> &'static str {
        "number"
    }

    fn capability_href<'a>(
        &self,
        doc: &'a Value,
        pointer: &str,
        _rel: &str,
    ) -> ConformanceResult<&'a str> {
        expect_str(doc, &format!("{}/href", pointer))
    }
}

/// Capability objects with a `links` array
pub struct CurrentSchema;

impl DescriptionSchema for CurrentSchema {
    fn version(&self) -> SchemaVersion {
        SchemaVersion::Current
    }

    fn title_key(&self) -> &'static str {
        "title"
    }

    fn capability_title_key(&self) -> &'static str {
        "title"
    }

    fn numeric_type(&self, kind: NumericKind) -> &'static str {
        match kind {
            NumericKind::Integer => "integer",
            NumericKind::Real => "number",
        }
    }

    fn capability_href<'a>(
        &self,
        doc: &'a Value,
        pointer: &str,
        rel: &str,
    ) -> ConformanceResult<&'a str> {
        let links_pointer = format!("{}/links", pointer);
        let links = expect_array(doc, &links_pointer)?;
        links
            .iter()
            .find(|link| link.get("rel").and_then(Value::as_str) == Some(rel))
            .and_then(|link| link.get("href"))
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ConformanceError::shape(
                    links_pointer,
                    format!("a link with rel \"{}\"", rel),
                    "none",
                )
            })
    }
}

/// The strategy for a configured schema version
pub fn schema_for(version: SchemaVersion) -> &'static dyn DescriptionSchema {
    match version {
        SchemaVersion::Legacy => &LegacySchema,
        SchemaVersion::Current => &CurrentSchema,
    }
}

/// Validate a fetched description against a profile
///
/// Returns the advertised WebSocket URL, which every later WebSocket check
/// depends on.
pub fn validate_description(
    doc: &Value,
    profile: &DeviceProfile,
    config: &TargetConfig,
) -> ConformanceResult<String> {
    let schema = schema_for(config.schema);
    debug!(schema = ?schema.version(), "validating thing description");

    validate_identity(doc, profile, schema)?;
    validate_properties(doc, profile, schema, config)?;
    validate_actions(doc, profile, schema, config)?;
    validate_events(doc, profile, schema, config)?;
    validate_links(doc, profile, config)
}

fn validate_identity(
    doc: &Value,
    profile: &DeviceProfile,
    schema: &dyn DescriptionSchema,
) -> ConformanceResult<()> {
    expect_value(doc, &format!("/{}", schema.title_key()), &json!(profile.title))?;
    expect_value(doc, "/@context", &json!(profile.context))?;
    expect_value(doc, "/description", &json!(profile.description))?;

    // Tag order is not part of the contract.
    let tags = expect_array(doc, "/@type")?;
    let actual: HashSet<&str> = tags.iter().filter_map(Value::as_str).collect();
    let expected: HashSet<&str> = profile.semantic_types.iter().copied().collect();
    if tags.len() != expected.len() || actual != expected {
        return Err(ConformanceError::shape(
            "/@type",
            format!("{:?} in any order", profile.semantic_types),
            Value::Array(tags.clone()),
        ));
    }
    Ok(())
}

fn validate_bounds(doc: &Value, pointer: &str, bounds: &Bounds) -> ConformanceResult<()> {
    if let Some(minimum) = bounds.minimum {
        expect_value(doc, &format!("{}/minimum", pointer), &json!(minimum))?;
    }
    if let Some(maximum) = bounds.maximum {
        expect_value(doc, &format!("{}/maximum", pointer), &json!(maximum))?;
    }
    if let Some(unit) = bounds.unit {
        expect_value(doc, &format!("{}/unit", pointer), &json!(unit))?;
    }
    Ok(())
}

fn expect_href(
    doc: &Value,
    pointer: &str,
    rel: &str,
    expected: &str,
    schema: &dyn DescriptionSchema,
) -> ConformanceResult<()> {
    let href = schema.capability_href(doc, pointer, rel)?;
    if href != expected {
        return Err(ConformanceError::shape(
            format!("{} href", pointer),
            expected,
            href,
        ));
    }
    Ok(())
}

fn validate_properties(
    doc: &Value,
    profile: &DeviceProfile,
    schema: &dyn DescriptionSchema,
    config: &TargetConfig,
) -> ConformanceResult<()> {
    for property in &profile.properties {
        let pointer = format!("/properties/{}", property.name);
        expect_value(
            doc,
            &format!("{}/@type", pointer),
            &json!(property.semantic_type),
        )?;
        expect_value(
            doc,
            &format!("{}/{}", pointer, schema.capability_title_key()),
            &json!(property.title),
        )?;
        expect_value(
            doc,
            &format!("{}/type", pointer),
            &json!(schema.type_name(property.kind)),
        )?;
        expect_value(
            doc,
            &format!("{}/description", pointer),
            &json!(property.description),
        )?;
        validate_bounds(doc, &pointer, &property.bounds)?;
        expect_href(
            doc,
            &pointer,
            "property",
            &config.href(&format!("/properties/{}", property.name)),
            schema,
        )?;
    }
    Ok(())
}

fn validate_actions(
    doc: &Value,
    profile: &DeviceProfile,
    schema: &dyn DescriptionSchema,
    config: &TargetConfig,
) -> ConformanceResult<()> {
    for action in &profile.actions {
        let pointer = format!("/actions/{}", action.name);
        expect_value(
            doc,
            &format!("{}/{}", pointer, schema.capability_title_key()),
            &json!(action.title),
        )?;
        expect_value(
            doc,
            &format!("{}/description", pointer),
            &json!(action.description),
        )?;
        expect_value(doc, &format!("{}/input/type", pointer), &json!("object"))?;

        for field in &action.input {
            let field_pointer = format!("{}/input/properties/{}", pointer, field.name);
            expect_value(
                doc,
                &format!("{}/type", field_pointer),
                &json!(schema.type_name(field.kind)),
            )?;
            validate_bounds(doc, &field_pointer, &field.bounds)?;
        }

        expect_href(
            doc,
            &pointer,
            "action",
            &config.href(&format!("/actions/{}", action.name)),
            schema,
        )?;
    }
    Ok(())
}

fn validate_events(
    doc: &Value,
    profile: &DeviceProfile,
    schema: &dyn DescriptionSchema,
    config: &TargetConfig,
) -> ConformanceResult<()> {
    for event in &profile.events {
        let pointer = format!("/events/{}", event.name);
        expect_value(
            doc,
            &format!("{}/type", pointer),
            &json!(schema.type_name(event.kind)),
        )?;
        expect_value(doc, &format!("{}/unit", pointer), &json!(event.unit))?;
        expect_value(
            doc,
            &format!("{}/description", pointer),
            &json!(event.description),
        )?;
        expect_href(
            doc,
            &pointer,
            "event",
            &config.href(&format!("/events/{}", event.name)),
            schema,
        )?;
    }
    Ok(())
}

/// Check the top-level `links` and return the WebSocket URL
fn validate_links(
    doc: &Value,
    profile: &DeviceProfile,
    config: &TargetConfig,
) -> ConformanceResult<String> {
    let links = expect_array(doc, "/links")?;

    let mut required = vec!["properties"];
    if profile.supports_actions() {
        required.push("actions");
    }
    if profile.supports_events() {
        required.push("events");
    }

    if links.len() <= required.len() {
        return Err(ConformanceError::shape(
            "/links",
            format!("at least {} links", required.len() + 1),
            links.len(),
        ));
    }

    for (i, rel) in required.iter().enumerate() {
        expect_value(doc, &format!("/links/{}/rel", i), &json!(rel))?;
        expect_value(
            doc,
            &format!("/links/{}/href", i),
            &json!(config.href(&format!("/{}", rel))),
        )?;
    }
    expect_value(
        doc,
        &format!("/links/{}/rel", required.len()),
        &json!("alternate"),
    )?;

    let channel = channel_regex(config)?;
    let mut html_links = 0;
    let mut ws_href = None;

    for (i, link) in links.iter().enumerate().skip(required.len()) {
        expect_value(doc, &format!("/links/{}/rel", i), &json!("alternate"))?;

        let href = expect_str(doc, &format!("/links/{}/href", i))?;
        if link.get("mediaType").is_some() {
            expect_value(doc, &format!("/links/{}/mediaType", i), &json!("text/html"))?;
            let bare = if config.path_prefix.is_empty() {
                "/"
            } else {
                config.path_prefix.as_str()
            };
            if href != config.path_prefix && href != bare {
                return Err(ConformanceError::shape(
                    format!("/links/{}/href", i),
                    bare,
                    href,
                ));
            }
            html_links += 1;
        } else {
            if !channel.is_match(href) {
                return Err(ConformanceError::shape(
                    format!("/links/{}/href", i),
                    format!("a URL matching {}", channel.as_str()),
                    href,
                ));
            }
            ws_href.get_or_insert_with(|| href.to_string());
        }
    }

    if html_links != 1 {
        return Err(ConformanceError::shape(
            "/links",
            "exactly one text/html alternate",
            html_links,
        ));
    }

    ws_href.ok_or(ConformanceError::MissingChannel)
}

fn channel_regex(config: &TargetConfig) -> ConformanceResult<Regex> {
    let pattern = format!(
        r"^{}://[^/\s]+{}/?$",
        config.scheme.ws_scheme(),
        regex::escape(&config.path_prefix)
    );
    Regex::new(&pattern).map_err(|e| ConformanceError::shape("path prefix", "a literal path", e))
}
