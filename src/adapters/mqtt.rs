//! Broker settings shared by the MQTT South and North adapters.

use crate::error::ConfigError;
use rumqttc::{MqttOptions, QoS};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct MqttSettings {
    url: String,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default = "default_qos")]
    qos: u8,
    #[serde(default)]
    client_id: Option<String>,
    /// Seconds.
    #[serde(default = "default_keep_alive")]
    keep_alive: u64,
}

fn default_qos() -> u8 {
    1
}

fn default_keep_alive() -> u64 {
    30
}

#[derive(Debug, Clone)]
pub(super) struct MqttBroker {
    host: String,
    port: u16,
    client_id: String,
    username: Option<String>,
    password: Option<String>,
    keep_alive: Duration,
    pub qos: QoS,
}

impl MqttSettings {
    pub fn broker(&self, owner: &str, default_client_id: &str) -> Result<MqttBroker, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidSettings {
            owner: owner.to_string(),
            reason,
        };
        let url = Url::parse(self.url.trim()).map_err(|err| invalid(format!("invalid url {:?}: {err}", self.url)))?;
        let port = match url.scheme() {
            "mqtt" | "tcp" => url.port().unwrap_or(1883),
            other => return Err(invalid(format!("unsupported mqtt scheme {other:?}"))),
        };
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid(format!("url {:?} has no host", self.url)))?
            .to_string();
        let qos = match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => return Err(invalid(format!("invalid qos {other}"))),
        };
        Ok(MqttBroker {
            host,
            port,
            client_id: self
                .client_id
                .clone()
                .filter(|id| !id.trim().is_empty())
                .unwrap_or_else(|| default_client_id.to_string()),
            username: self.username.clone().filter(|name| !name.is_empty()),
            password: self.password.clone(),
            keep_alive: Duration::from_secs(self.keep_alive.max(5)),
            qos,
        })
    }
}

impl MqttBroker {
    pub fn options(&self) -> MqttOptions {
        let mut mqttoptions = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        mqttoptions.set_keep_alive(self.keep_alive);
        if let Some(username) = &self.username {
            mqttoptions.set_credentials(username.clone(), self.password.clone().unwrap_or_default());
        }
        mqttoptions
    }
}

/// MQTT topic filter matching with `+` and `#` wildcards.
pub(super) fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');
    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(url: &str) -> MqttSettings {
        serde_json::from_value(serde_json::json!({ "url": url })).unwrap()
    }

    #[test]
    fn broker_defaults_port_and_client_id() {
        let broker = settings("mqtt://broker.local").broker("north n1", "oibus-n1").unwrap();
        assert_eq!(broker.host, "broker.local");
        assert_eq!(broker.port, 1883);
        assert_eq!(broker.client_id, "oibus-n1");
        assert_eq!(broker.qos, QoS::AtLeastOnce);

        let broker = settings("tcp://10.0.0.5:1884").broker("north n1", "oibus-n1").unwrap();
        assert_eq!(broker.port, 1884);
    }

    #[test]
    fn broker_rejects_unsupported_urls() {
        assert!(settings("http://broker.local").broker("north n1", "x").is_err());
        assert!(settings("not a url").broker("north n1", "x").is_err());
    }

    #[test]
    fn wildcards_follow_mqtt_rules() {
        assert!(topic_matches("plant/+/temp", "plant/line-1/temp"));
        assert!(topic_matches("plant/#", "plant/line-1/temp"));
        assert!(topic_matches("plant/line-1", "plant/line-1"));
        assert!(!topic_matches("plant/+/temp", "plant/line-1/pressure"));
        assert!(!topic_matches("plant/+", "plant/line-1/temp"));
    }
}
