//! Pure connection configuration for the MQTT transport
//!
//! Turns a [`Session`] and one broker URI into rumqttc `MqttOptions`.

use crate::session::model::{QoS, Session, Subscription};
use crate::transport::TransportError;
use rumqttc::v5::mqttbytes::v5::Filter;
use rumqttc::v5::mqttbytes::QoS as MqttQoS;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use url::Url;

/// rumqttc refuses keep-alive intervals shorter than this
pub const MIN_KEEP_ALIVE: Duration = Duration::from_secs(5);

/// Largest packet accepted from the broker
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Host, port and TLS flag parsed from a broker URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

/// Parse `mqtt://`, `tcp://`, `mqtts://` or `ssl://` URIs
pub fn parse_broker_uri(uri: &str) -> Result<BrokerAddress, TransportError> {
    let url = Url::parse(uri).map_err(|_| TransportError::InvalidUri(uri.to_string()))?;

    let tls = match url.scheme() {
        "mqtt" | "tcp" => false,
        "mqtts" | "ssl" => true,
        _ => return Err(TransportError::InvalidUri(uri.to_string())),
    };
    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| TransportError::InvalidUri(uri.to_string()))?;
    let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

    Ok(BrokerAddress {
        host: host.to_string(),
        port,
        tls,
    })
}

/// Build client options for connecting `session` to `uri`
pub fn configure_mqtt_options(session: &Session, uri: &str) -> Result<MqttOptions, TransportError> {
    let address = parse_broker_uri(uri)?;
    let mut options = MqttOptions::new(session.client_id.clone(), address.host, address.port);

    if address.tls {
        options.set_transport(RumqttcTransport::tls_with_default_config());
    }

    if let Some(credentials) = &session.credentials {
        options.set_credentials(&credentials.username, &credentials.password);
    }

    options.set_keep_alive(session.keep_alive.max(MIN_KEEP_ALIVE));
    options.set_clean_start(session.clean_session);
    options.set_max_packet_size(Some(MAX_PACKET_SIZE));

    Ok(options)
}

pub fn to_mqtt_qos(qos: QoS) -> MqttQoS {
    match qos {
        QoS::AtMostOnce => MqttQoS::AtMostOnce,
        QoS::AtLeastOnce => MqttQoS::AtLeastOnce,
        QoS::ExactlyOnce => MqttQoS::ExactlyOnce,
    }
}

/// One SUBSCRIBE packet's worth of topic filters
pub fn to_mqtt_filters(subscriptions: &[Subscription]) -> Vec<Filter> {
    subscriptions
        .iter()
        .map(|s| Filter::new(s.topic.clone(), to_mqtt_qos(s.qos)))
        .collect()
}

pub fn from_mqtt_qos(qos: MqttQoS) -> QoS {
    match qos {
        MqttQoS::AtMostOnce => QoS::AtMostOnce,
        MqttQoS::AtLeastOnce => QoS::AtLeastOnce,
        MqttQoS::ExactlyOnce => QoS::ExactlyOnce,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_uri_defaults_port() {
        let address = parse_broker_uri("mqtt://broker.local").unwrap();
        assert_eq!(
            address,
            BrokerAddress {
                host: "broker.local".to_string(),
                port: 1883,
                tls: false
            }
        );
        assert_eq!(parse_broker_uri("tcp://10.0.0.1:1884").unwrap().port, 1884);
    }

    #[test]
    fn test_parse_tls_uri() {
        let address = parse_broker_uri("mqtts://secure.example.com").unwrap();
        assert!(address.tls);
        assert_eq!(address.port, 8883);
        assert!(parse_broker_uri("ssl://secure.example.com:9999").unwrap().tls);
    }

    #[test]
    fn test_parse_rejects_bad_uris() {
        for uri in ["", "not a uri", "http://broker:1883", "mqtt://"] {
            assert!(
                matches!(parse_broker_uri(uri), Err(TransportError::InvalidUri(_))),
                "{uri} should be rejected"
            );
        }
    }

    #[test]
    fn test_options_carry_session_settings() {
        let session = Session::new("opts-client", "mqtt://localhost:1883")
            .with_keep_alive(Duration::from_secs(1))
            .with_clean_session(true)
            .with_credentials("user", "secret");
        let options = configure_mqtt_options(&session, &session.server_uri).unwrap();

        assert_eq!(options.client_id(), "opts-client");
        assert_eq!(options.broker_address(), ("localhost".to_string(), 1883));
        assert_eq!(options.keep_alive(), MIN_KEEP_ALIVE);
        assert!(options.clean_start());
    }

    #[test]
    fn test_qos_mapping() {
        for qos in [QoS::AtMostOnce, QoS::AtLeastOnce, QoS::ExactlyOnce] {
            assert_eq!(from_mqtt_qos(to_mqtt_qos(qos)), qos);
        }
    }

    #[test]
    fn test_filters_keep_order_and_qos() {
        let filters = to_mqtt_filters(&[
            Subscription::new("a/b", QoS::AtLeastOnce),
            Subscription::new("sensors/#", QoS::ExactlyOnce),
        ]);

        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0].path, "a/b");
        assert_eq!(filters[0].qos, MqttQoS::AtLeastOnce);
        assert_eq!(filters[1].path, "sensors/#");
        assert_eq!(filters[1].qos, MqttQoS::ExactlyOnce);
    }
}
