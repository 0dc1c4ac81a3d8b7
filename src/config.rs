// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Topology Configuration
//!
//! Resolves the user-supplied configuration document into a
//! [`TopologyConfig`]. The document is validated, deep-merged over the
//! defaults and deserialised before anything is connected, so an invalid
//! configuration never yields a usable helper.
//!
//! ```json
//! {
//!   "connection": { "host": "127.0.0.1", "options": { "reconnect": true, "heartbeat": 5 } },
//!   "exchange": { "name": "testing-exchange", "options": { "type": "direct", "durable": false, "autoDelete": false } },
//!   "queue": { "name": "testing-queue", "options": { "routingKey": "event-routing", "durable": true, "autoDelete": false, "prefetchCount": 1 } }
//! }
//! ```

use crate::{exchange::ExchangeOptions, queue::QueueOptions};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_HEARTBEAT: u16 = 5;
pub const DEFAULT_EXCHANGE_NAME: &str = "testing-exchange";
pub const DEFAULT_QUEUE_NAME: &str = "testing-queue";

/// Configuration errors. Always fatal: the helper must not be built.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// How strictly the user document is checked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ValidationMode {
    /// Every field is optional and falls back to its default.
    #[default]
    Lenient,
    /// Every section and every field must be supplied by the user.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologyConfig {
    pub connection: ConnectionConfig,
    pub exchange: ExchangeConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub host: String,
    pub options: ConnectionOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionOptions {
    pub reconnect: bool,
    /// Heartbeat interval in seconds.
    pub heartbeat: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub name: String,
    pub options: ExchangeOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub name: String,
    pub options: QueueOptions,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        TopologyConfig {
            connection: ConnectionConfig {
                host: DEFAULT_HOST.to_owned(),
                options: ConnectionOptions::default(),
            },
            exchange: ExchangeConfig {
                name: DEFAULT_EXCHANGE_NAME.to_owned(),
                options: ExchangeOptions::default(),
            },
            queue: QueueConfig {
                name: DEFAULT_QUEUE_NAME.to_owned(),
                options: QueueOptions::default(),
            },
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        ConnectionOptions {
            reconnect: true,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }
}

impl TopologyConfig {
    /// Parses and resolves a JSON document.
    pub fn from_json_str(raw: &str, mode: ValidationMode) -> Result<TopologyConfig, ConfigError> {
        let value: Value = serde_json::from_str(raw)?;
        resolve(&value, mode)
    }

    /// The URI handed to the transport.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}?heartbeat={}",
            self.connection.host, self.connection.options.heartbeat
        )
    }
}

#[derive(Debug, Clone, Copy)]
enum FieldKind {
    Text,
    Flag,
    Number,
}

impl FieldKind {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldKind::Text => value.as_str().is_some_and(|s| !s.is_empty()),
            FieldKind::Flag => value.is_boolean(),
            FieldKind::Number => value.is_number(),
        }
    }

    fn describe(self) -> &'static str {
        match self {
            FieldKind::Text => "a non-empty string",
            FieldKind::Flag => "a boolean",
            FieldKind::Number => "a number",
        }
    }
}

const SECTIONS: &[&str] = &[
    "connection",
    "connection.options",
    "exchange",
    "exchange.options",
    "queue",
    "queue.options",
];

const FIELDS: &[(&str, FieldKind)] = &[
    ("connection.host", FieldKind::Text),
    ("connection.options.reconnect", FieldKind::Flag),
    ("connection.options.heartbeat", FieldKind::Number),
    ("exchange.name", FieldKind::Text),
    ("exchange.options.type", FieldKind::Text),
    ("exchange.options.durable", FieldKind::Flag),
    ("exchange.options.autoDelete", FieldKind::Flag),
    ("queue.name", FieldKind::Text),
    ("queue.options.routingKey", FieldKind::Text),
    ("queue.options.durable", FieldKind::Flag),
    ("queue.options.autoDelete", FieldKind::Flag),
    ("queue.options.prefetchCount", FieldKind::Number),
];

/// Optional declare argument tables, checked only when present.
const TABLES: &[&str] = &["exchange.options.arguments", "queue.options.arguments"];

/// Resolves the user document into a [`TopologyConfig`].
///
/// A `null` document counts as empty. Unknown keys are ignored in both
/// modes. All violations are collected before failing.
pub fn resolve(user: &Value, mode: ValidationMode) -> Result<TopologyConfig, ConfigError> {
    let user = match user {
        Value::Null => Value::Object(Map::new()),
        other => other.clone(),
    };

    let issues = validate(&user, mode);
    if !issues.is_empty() {
        error!(issues = issues.join("; "), "invalid topology configuration");
        return Err(ConfigError::Validation(issues));
    }

    let mut merged = serde_json::to_value(TopologyConfig::default())?;
    merge(&mut merged, &user);

    let config: TopologyConfig = serde_json::from_value(merged)?;
    debug!(
        host = config.connection.host.as_str(),
        exchange = config.exchange.name.as_str(),
        queue = config.queue.name.as_str(),
        "topology configuration resolved"
    );

    Ok(config)
}

fn validate(user: &Value, mode: ValidationMode) -> Vec<String> {
    let mut issues = vec![];

    if !user.is_object() {
        issues.push("configuration must be an object".to_owned());
        return issues;
    }

    for section in SECTIONS {
        match lookup(user, section) {
            Some(value) if !value.is_object() => issues.push(format!("`{section}` must be an object")),
            None if mode == ValidationMode::Strict => issues.push(format!("`{section}` is required")),
            _ => {}
        }
    }

    for (path, kind) in FIELDS {
        match lookup(user, path) {
            Some(value) if !kind.accepts(value) => {
                issues.push(format!("`{path}` must be {}", kind.describe()))
            }
            None if mode == ValidationMode::Strict => issues.push(format!("`{path}` is required")),
            _ => {}
        }
    }

    for path in TABLES {
        if lookup(user, path).is_some_and(|value| !value.is_object()) {
            issues.push(format!("`{path}` must be an object"));
        }
    }

    issues
}

fn lookup<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.')
        .try_fold(value, |current, key| current.as_object()?.get(key))
}

/// Deep-merges `overlay` onto `base`; overlay values win.
fn merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(key) {
                    Some(existing) => merge(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeKind;
    use serde_json::json;

    fn full_config() -> Value {
        json!({
            "connection": { "host": "rabbit.local", "options": { "reconnect": false, "heartbeat": 10 } },
            "exchange": { "name": "orders", "options": { "type": "topic", "durable": true, "autoDelete": false } },
            "queue": { "name": "orders-queue", "options": { "routingKey": "orders.*", "durable": true, "autoDelete": true, "prefetchCount": 20 } }
        })
    }

    #[test]
    fn empty_document_resolves_to_defaults() {
        let config = resolve(&json!({}), ValidationMode::Lenient).unwrap();
        assert_eq!(config, TopologyConfig::default());
        assert_eq!(config.connection.host, "127.0.0.1");
        assert_eq!(config.exchange.options.kind, ExchangeKind::Direct);
        assert!(!config.exchange.options.durable);
        assert!(config.queue.options.durable);
        assert_eq!(config.queue.options.prefetch_count, 1);

        assert_eq!(resolve(&Value::Null, ValidationMode::Lenient).unwrap(), config);
    }

    #[test]
    fn user_values_win_and_siblings_keep_defaults() {
        let config = resolve(
            &json!({ "queue": { "options": { "prefetchCount": 5 } }, "unknown": { "x": 1 } }),
            ValidationMode::Lenient,
        )
        .unwrap();

        assert_eq!(config.queue.options.prefetch_count, 5);
        assert_eq!(config.queue.options.routing_key, "event-routing");
        assert_eq!(config.queue.name, DEFAULT_QUEUE_NAME);
    }

    #[test]
    fn strict_mode_accepts_a_complete_document() {
        let config = resolve(&full_config(), ValidationMode::Strict).unwrap();
        assert_eq!(config.connection.host, "rabbit.local");
        assert!(!config.connection.options.reconnect);
        assert_eq!(config.exchange.options.kind, ExchangeKind::Topic);
        assert_eq!(config.queue.options.routing_key, "orders.*");
        assert_eq!(config.uri(), "amqp://rabbit.local?heartbeat=10");
    }

    #[test]
    fn strict_mode_rejects_every_missing_field() {
        for (path, _) in FIELDS {
            let mut doc = full_config();
            let (parent, key) = path.rsplit_once('.').unwrap();
            let mut cursor = &mut doc;
            for segment in parent.split('.') {
                cursor = cursor.get_mut(segment).unwrap();
            }
            cursor.as_object_mut().unwrap().remove(key);

            match resolve(&doc, ValidationMode::Strict) {
                Err(ConfigError::Validation(issues)) => {
                    assert_eq!(issues, vec![format!("`{path}` is required")])
                }
                other => panic!("expected validation error for {path}, got {other:?}"),
            }
        }
    }

    #[test]
    fn wrong_types_are_collected_together() {
        let err = resolve(
            &json!({
                "connection": { "host": "" },
                "queue": { "options": { "durable": "yes", "prefetchCount": "one" } }
            }),
            ValidationMode::Lenient,
        )
        .unwrap_err();

        match err {
            ConfigError::Validation(issues) => assert_eq!(
                issues,
                vec![
                    "`connection.host` must be a non-empty string".to_owned(),
                    "`queue.options.durable` must be a boolean".to_owned(),
                    "`queue.options.prefetchCount` must be a number".to_owned(),
                ]
            ),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn sections_must_be_objects() {
        let err = resolve(&json!({ "exchange": "orders" }), ValidationMode::Lenient).unwrap_err();
        assert!(err.to_string().contains("`exchange` must be an object"));

        assert!(resolve(&json!([]), ValidationMode::Lenient).is_err());
    }

    #[test]
    fn declare_arguments_are_optional_tables() {
        let mut doc = full_config();
        doc["exchange"]["options"]["type"] = json!("x-delayed-message");
        doc["exchange"]["options"]["arguments"] = json!({ "x-delayed-type": "direct" });
        let config = resolve(&doc, ValidationMode::Strict).unwrap();
        assert_eq!(
            config.exchange.options.arguments.get("x-delayed-type"),
            Some(&json!("direct"))
        );
        assert!(config.queue.options.arguments.is_empty());

        let err = resolve(
            &json!({ "queue": { "options": { "arguments": "x-max-priority=10" } } }),
            ValidationMode::Lenient,
        )
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("`queue.options.arguments` must be an object"));
    }

    #[test]
    fn out_of_range_numbers_fail_to_parse() {
        let err = resolve(
            &json!({ "queue": { "options": { "prefetchCount": -1 } } }),
            ValidationMode::Lenient,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn parses_from_json_text() {
        let config = TopologyConfig::from_json_str(
            r#"{ "exchange": { "name": "audit", "options": { "type": "x-delayed-message" } } }"#,
            ValidationMode::Lenient,
        )
        .unwrap();
        assert_eq!(config.exchange.name, "audit");
        assert_eq!(
            config.exchange.options.kind,
            ExchangeKind::Custom("x-delayed-message".to_owned())
        );

        assert!(matches!(
            TopologyConfig::from_json_str("{", ValidationMode::Lenient),
            Err(ConfigError::Parse(_))
        ));
    }
}
