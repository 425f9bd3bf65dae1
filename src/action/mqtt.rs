//! Broker connection plumbing shared by the MQTT actions
//!
//! The rumqttc event loop is driven by a pump task that forwards the events
//! the actions care about over a channel, so the actions themselves are
//! plain `select`-free loops over [`BrokerEvent`]s.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    SubscribeReasonCode, TlsConfiguration, Transport,
};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, SignatureScheme};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::common::{short_target, Error, Result};
use crate::expr::resolve_string;
use crate::scenario::VariableCache;

const CHANNEL_CAPACITY: usize = 64;
const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Broker connection fields of a definition
#[derive(Debug, Clone, Default)]
pub(crate) struct BrokerDefinition {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub allow_insecure: Option<bool>,
}

/// Where and how to connect
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrokerOptions {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub allow_insecure: bool,
}

impl BrokerOptions {
    pub(crate) fn from_definition(action: &str, def: BrokerDefinition) -> Result<Self> {
        let url = def
            .url
            .ok_or_else(|| Error::Config(format!("MQTT action '{}' has no url", action)))?;
        Ok(Self {
            url,
            username: def.username,
            password: def.password,
            allow_insecure: def.allow_insecure.unwrap_or(false),
        })
    }

    pub(crate) fn from_template(def: BrokerDefinition, template: &Self) -> Self {
        Self {
            url: def.url.unwrap_or_else(|| template.url.clone()),
            username: def.username.or_else(|| template.username.clone()),
            password: def.password.or_else(|| template.password.clone()),
            allow_insecure: def.allow_insecure.unwrap_or(template.allow_insecure),
        }
    }

    /// Copy with url and credentials resolved against the cache
    pub(crate) fn resolve(&self, cache: &VariableCache) -> Result<Self> {
        let resolve = |value: &Option<String>| -> Result<Option<String>> {
            match value {
                Some(v) => Ok(Some(resolve_string(v, cache)?)),
                None => Ok(None),
            }
        };
        Ok(Self {
            url: resolve_string(&self.url, cache)?,
            username: resolve(&self.username)?,
            password: resolve(&self.password)?,
            allow_insecure: self.allow_insecure,
        })
    }

    /// Diagram participant for this broker
    pub fn target(&self) -> String {
        short_target(&self.url)
    }

    pub(crate) fn mqtt_options(&self, keep_alive: Duration) -> Result<MqttOptions> {
        let url = url::Url::parse(&self.url)
            .map_err(|e| Error::Config(format!("Invalid broker url '{}': {}", self.url, e)))?;
        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            other => {
                return Err(Error::Config(format!(
                    "Unsupported broker scheme '{}' in '{}'",
                    other, self.url
                )))
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::Config(format!("Broker url '{}' has no host", self.url)))?;
        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });

        let mut options = MqttOptions::new(client_id(), host, port);
        options.set_keep_alive(keep_alive);
        options.set_clean_session(true);

        let username = self
            .username
            .clone()
            .or_else(|| (!url.username().is_empty()).then(|| url.username().to_string()));
        if let Some(username) = username {
            let password = self
                .password
                .clone()
                .or_else(|| url.password().map(str::to_string))
                .unwrap_or_default();
            options.set_credentials(username, password);
        }

        if tls {
            let transport = if self.allow_insecure {
                Transport::tls_with_config(insecure_tls())
            } else {
                Transport::tls_with_default_config()
            };
            options.set_transport(transport);
        }
        Ok(options)
    }
}

/// TLS that accepts any server certificate and host name
fn insecure_tls() -> TlsConfiguration {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    TlsConfiguration::Rustls(Arc::new(config))
}

#[derive(Debug)]
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
        ]
    }
}

/// Random per-invocation client id so parallel scenarios never collide
fn client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("scenario-{}", &id[..12])
}

/// Broker events the actions react to
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum BrokerEvent {
    Connected,
    Subscribed,
    SubscribeFailed(String),
    Published,
    Message(Vec<u8>),
    Failed(String),
}

/// A connected client plus the task driving its event loop
pub(crate) struct BrokerSession {
    pub client: AsyncClient,
    pub events: mpsc::Receiver<BrokerEvent>,
    pump: JoinHandle<()>,
}

impl BrokerSession {
    pub fn connect(options: MqttOptions) -> Self {
        let (client, eventloop) = AsyncClient::new(options, CHANNEL_CAPACITY);
        let (tx, events) = mpsc::channel(CHANNEL_CAPACITY);
        let pump = tokio::spawn(pump(eventloop, tx));
        Self {
            client,
            events,
            pump,
        }
    }

    /// Disconnect, give the pump a moment to flush, then stop it
    pub async fn close(mut self) {
        if let Err(e) = self.client.disconnect().await {
            tracing::debug!(error = %e, "mqtt disconnect request failed");
        }
        if tokio::time::timeout(SHUTDOWN_GRACE, &mut self.pump)
            .await
            .is_err()
        {
            self.pump.abort();
        }
    }
}

async fn pump(mut eventloop: EventLoop, tx: mpsc::Sender<BrokerEvent>) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    BrokerEvent::Connected
                } else {
                    BrokerEvent::Failed(format!("connection refused: {:?}", ack.code))
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                match ack
                    .return_codes
                    .iter()
                    .find(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    Some(code) => BrokerEvent::SubscribeFailed(format!("{:?}", code)),
                    None => BrokerEvent::Subscribed,
                }
            }
            Ok(Event::Incoming(Packet::PubAck(_))) => BrokerEvent::Published,
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                BrokerEvent::Message(publish.payload.to_vec())
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => continue,
            Err(e) => {
                let _ = tx.send(BrokerEvent::Failed(e.to_string())).await;
                break;
            }
        };

        let terminal = matches!(event, BrokerEvent::Failed(_));
        if tx.send(event).await.is_err() || terminal {
            break;
        }
    }
}
