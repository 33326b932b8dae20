//! REST property checks

use reqwest::StatusCode;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::client::ThingClient;
use crate::error::{ConformanceError, ConformanceResult};
use crate::expect::{single_key, values_match};
use crate::profile::DeviceProfile;

/// Reads and writes properties through `/properties`
pub struct PropertyChecker<'a> {
    client: &'a ThingClient,
}

impl<'a> PropertyChecker<'a> {
    pub fn new(client: &'a ThingClient) -> Self {
        Self { client }
    }

    /// `GET /properties/{name}`, unwrapping the `{name: value}` envelope
    pub async fn read_property(&self, name: &str) -> ConformanceResult<Value> {
        let body = self
            .client
            .get(&format!("/properties/{}", name))
            .await?
            .expect_status(StatusCode::OK)?
            .into_json()?;
        unwrap_property(&body, name)
    }

    /// `PUT /properties/{name}`, returning the value the server echoes
    pub async fn write_property(&self, name: &str, value: Value) -> ConformanceResult<Value> {
        let mut envelope = Map::new();
        envelope.insert(name.to_string(), value);

        let body = self
            .client
            .put(&format!("/properties/{}", name), Value::Object(envelope))
            .await?
            .expect_status(StatusCode::OK)?
            .into_json()?;
        unwrap_property(&body, name)
    }

    /// `GET /properties`
    pub async fn read_all(&self) -> ConformanceResult<Map<String, Value>> {
        let body = self
            .client
            .get("/properties")
            .await?
            .expect_status(StatusCode::OK)?
            .into_json()?;
        match body {
            Value::Object(map) => Ok(map),
            other => Err(ConformanceError::shape("GET /properties", "an object", other)),
        }
    }

    /// Require `name` to currently read as `expected`
    pub async fn expect_property(&self, name: &str, expected: &Value) -> ConformanceResult<()> {
        let actual = self.read_property(name).await?;
        if !values_match(expected, &actual) {
            return Err(ConformanceError::state(
                format!("property {}", name),
                expected,
                actual,
            ));
        }
        Ok(())
    }

    /// Run the property stage of the conformance sequence
    ///
    /// Leaves `brightness` at 25.
    pub async fn run(&self, profile: &DeviceProfile) -> ConformanceResult<()> {
        self.expect_property("brightness", &json!(profile.initial_brightness))
            .await?;

        let written = self.write_property("brightness", json!(25)).await?;
        if !values_match(&json!(25), &written) {
            return Err(ConformanceError::shape(
                "PUT /properties/brightness body",
                25,
                written,
            ));
        }

        // Read-your-writes, then idempotence of plain reads.
        let first = self.read_property("brightness").await?;
        let second = self.read_property("brightness").await?;
        if !values_match(&json!(25), &first) {
            return Err(ConformanceError::state("property brightness", 25, first));
        }
        if !values_match(&first, &second) {
            return Err(ConformanceError::state(
                "repeated read of brightness",
                first,
                second,
            ));
        }

        let on = self.read_property("on").await?;
        if !on.is_boolean() {
            return Err(ConformanceError::shape(
                "GET /properties/on body",
                "a boolean",
                on,
            ));
        }

        let all = self.read_all().await?;
        for (name, expected) in [("brightness", &second), ("on", &on)] {
            match all.get(name) {
                Some(actual) if values_match(expected, actual) => {}
                Some(actual) => {
                    return Err(ConformanceError::state(
                        format!("GET /properties {}", name),
                        expected,
                        actual,
                    ))
                }
                None => {
                    return Err(ConformanceError::shape(
                        format!("GET /properties {}", name),
                        "a value",
                        "nothing",
                    ))
                }
            }
        }

        info!("properties conform");
        Ok(())
    }
}

fn unwrap_property(body: &Value, name: &str) -> ConformanceResult<Value> {
    let what = format!("property {} body", name);
    let (key, value) = single_key(body, &what)?;
    if key != name {
        return Err(ConformanceError::shape(what, name, key));
    }
    Ok(value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unwrap_property() {
        assert_eq!(
            unwrap_property(&json!({"brightness": 25}), "brightness").unwrap(),
            json!(25)
        );
        assert!(unwrap_property(&json!({"on": true}), "brightness").is_err());
        assert!(unwrap_property(&json!({"on": true, "brightness": 25}), "brightness").is_err());
    }
}
