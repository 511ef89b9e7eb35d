use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, TlsConfiguration, Transport,
};
use tracing::{debug, info, warn};

use super::config::{ConnectionProfile, Qos};
use super::error::TransportError;
use super::link::{Connector, Link, LinkFrame};
use super::tls;

/// Requests buffered between the worker and the rumqttc event loop.
const REQUEST_CAPACITY: usize = 100;

/// Builds rumqttc clients from connection profiles.
#[derive(Debug, Default, Clone)]
pub struct RumqttConnector;

#[async_trait]
impl Connector for RumqttConnector {
    async fn open(&self, profile: &ConnectionProfile) -> Result<Box<dyn Link>, TransportError> {
        let client_id = profile.effective_client_id();
        let mut options = MqttOptions::new(client_id.clone(), profile.host.clone(), profile.port);
        options
            .set_keep_alive(profile.keep_alive())
            .set_clean_session(profile.clean_session);
        if !profile.username.is_empty() {
            options.set_credentials(profile.username.clone(), profile.password.clone());
        }

        if let Some(settings) = &profile.tls {
            let material = tls::load_material(settings).await?;
            debug!(
                custom_ca = material.custom_ca,
                client_auth = material.key_encoding.is_some(),
                "TLS material loaded"
            );
            options.set_transport(Transport::tls_with_config(TlsConfiguration::Rustls(material.config)));
        }

        info!(
            profile = %profile,
            client_id = %client_id,
            tls = profile.uses_tls(),
            "Opening MQTT link"
        );
        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        Ok(Box::new(RumqttLink { client, eventloop }))
    }
}

pub struct RumqttLink {
    client: AsyncClient,
    eventloop: EventLoop,
}

#[async_trait]
impl Link for RumqttLink {
    fn publish(&mut self, topic: &str, payload: Vec<u8>, qos: Qos, retain: bool) -> Result<(), TransportError> {
        self.client
            .try_publish(topic, qos.into(), retain, payload)
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    fn subscribe(&mut self, filter: &str, qos: Qos) -> Result<(), TransportError> {
        self.client
            .try_subscribe(filter, qos.into())
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    fn unsubscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        self.client
            .try_unsubscribe(filter)
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    fn disconnect(&mut self) -> Result<(), TransportError> {
        self.client
            .try_disconnect()
            .map_err(|e| TransportError::Protocol(e.to_string()))
    }

    async fn next_frame(&mut self) -> LinkFrame {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    debug!(session_present = ack.session_present, "ConnAck received");
                    return LinkFrame::ConnAck;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    return LinkFrame::Publish {
                        topic: publish.topic,
                        payload: publish.payload.to_vec(),
                        retain: publish.retain,
                    };
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("Broker sent DISCONNECT");
                    return LinkFrame::Closed(Some(TransportError::Protocol(
                        "Broker closed the connection".to_string(),
                    )));
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    debug!("DISCONNECT flushed");
                    return LinkFrame::Closed(None);
                }
                Ok(other) => {
                    debug!(event = ?other, "Ignoring MQTT event");
                }
                // Polling again would make rumqttc reconnect on its own
                Err(e) => return LinkFrame::Closed(Some(describe(e))),
            }
        }
    }
}

fn describe(error: ConnectionError) -> TransportError {
    let text = match error {
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::RefusedProtocolVersion => "Invalid protocol version".to_string(),
            ConnectReturnCode::BadClientId => "Client ID rejected".to_string(),
            ConnectReturnCode::ServiceUnavailable => "Server unavailable".to_string(),
            ConnectReturnCode::BadUserNamePassword => "Bad username or password".to_string(),
            ConnectReturnCode::NotAuthorized => "Not authorized".to_string(),
            other => format!("Connection refused: {:?}", other),
        },
        other => other.to_string(),
    };
    TransportError::Protocol(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mqtt::config::TlsSettings;
    use crate::mqtt::tls::fixtures::{pem_file, CERT, KEY};
    use std::path::PathBuf;

    #[test]
    fn refusals_are_readable() {
        let error = describe(ConnectionError::ConnectionRefused(ConnectReturnCode::BadUserNamePassword));
        assert_eq!(error, TransportError::Protocol("Bad username or password".to_string()));
        let error = describe(ConnectionError::ConnectionRefused(ConnectReturnCode::NotAuthorized));
        assert_eq!(error, TransportError::Protocol("Not authorized".to_string()));
    }

    #[tokio::test]
    async fn plain_profile_opens_without_network() {
        let profile = ConnectionProfile {
            username: "operator".to_string(),
            password: "secret".to_string(),
            ..ConnectionProfile::default()
        };
        assert!(RumqttConnector.open(&profile).await.is_ok());
    }

    #[tokio::test]
    async fn missing_ca_file_is_tls_material_error() {
        let profile = ConnectionProfile {
            port: 8883,
            tls: Some(TlsSettings {
                ca_cert_path: Some(PathBuf::from("/nonexistent/ca.pem")),
                ..TlsSettings::default()
            }),
            ..ConnectionProfile::default()
        };
        match RumqttConnector.open(&profile).await {
            Err(TransportError::TlsMaterial { path, .. }) => assert_eq!(path, PathBuf::from("/nonexistent/ca.pem")),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("open succeeded without CA material"),
        }
    }

    #[tokio::test]
    async fn client_certificate_without_ca_opens() {
        let cert = pem_file(CERT);
        let key = pem_file(KEY);
        let profile = ConnectionProfile {
            port: 8883,
            tls: Some(TlsSettings {
                ca_cert_path: None,
                client_cert_path: Some(cert.path().to_path_buf()),
                client_key_path: Some(key.path().to_path_buf()),
            }),
            ..ConnectionProfile::default()
        };
        assert!(RumqttConnector.open(&profile).await.is_ok());
    }
}
