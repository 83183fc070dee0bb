//! # AMQP Adapter
//!
//! Implements the client traits on top of `lapin`.
//!
//! Channels are opened in publisher-confirm mode: the confirmation of a
//! mandatory publish carries the returned message when the broker could not
//! route it, which is forwarded as [`ChannelEvent::Returned`].

use crate::client::{BusChannel, BusConnection, BusConnector, Connected, OpenedChannel};
use crate::error::BusError;
use crate::message::{ChannelEvent, ConnectionParams, InboundMessage, MessageProperties};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{FieldTable, ShortString};
use lapin::uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Reply code sent with a graceful connection close.
const REPLY_SUCCESS: u16 = 200;

impl From<lapin::Error> for BusError {
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::ProtocolError(amqp) => match amqp.kind() {
                AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => BusError::NotFound(amqp.to_string()),
                AMQPErrorKind::Soft(AMQPSoftError::ACCESSREFUSED) => {
                    BusError::AccessRefused(amqp.to_string())
                }
                _ => BusError::Protocol(amqp.to_string()),
            },
            lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidChannel(_) => {
                BusError::ChannelClosed
            }
            lapin::Error::InvalidConnectionState(_) => BusError::ConnectionClosed,
            lapin::Error::IOError(io) => BusError::Io(io.to_string()),
            _ => BusError::Protocol(err.to_string()),
        }
    }
}

/// Build the connection URI without string formatting, so credentials and
/// vhost never need escaping.
fn amqp_uri(params: &ConnectionParams) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: params.login.clone(),
                password: params.password.clone(),
            },
            host: params.hostname.clone(),
            port: params.port,
        },
        vhost: params.vhost.clone(),
        query: AMQPQueryString {
            heartbeat: Some(params.heartbeat),
            ..AMQPQueryString::default()
        },
    }
}

fn short(value: &Option<ShortString>) -> Option<String> {
    value.as_ref().map(|s| s.as_str().to_string())
}

fn to_amqp_properties(properties: MessageProperties) -> BasicProperties {
    let mut amqp = BasicProperties::default();
    if let Some(reply_to) = properties.reply_to {
        amqp = amqp.with_reply_to(reply_to.into());
    }
    if let Some(correlation_id) = properties.correlation_id {
        amqp = amqp.with_correlation_id(correlation_id.into());
    }
    if let Some(content_type) = properties.content_type {
        amqp = amqp.with_content_type(content_type.into());
    }
    if let Some(timestamp) = properties.timestamp {
        amqp = amqp.with_timestamp(timestamp);
    }
    if let Some(kind) = properties.kind {
        amqp = amqp.with_kind(kind.into());
    }
    if let Some(user_id) = properties.user_id {
        amqp = amqp.with_user_id(user_id.into());
    }
    amqp
}

fn from_delivery(delivery: Delivery) -> InboundMessage {
    let props = &delivery.properties;
    let properties = MessageProperties {
        reply_to: short(props.reply_to()),
        correlation_id: short(props.correlation_id()),
        content_type: short(props.content_type()),
        timestamp: *props.timestamp(),
        kind: short(props.kind()),
        user_id: short(props.user_id()),
    };

    InboundMessage {
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        body: Bytes::from(delivery.data),
        properties,
    }
}

/// Connects to RabbitMQ.
#[derive(Debug, Clone, Copy, Default)]
pub struct AmqpConnector;

#[async_trait]
impl BusConnector for AmqpConnector {
    async fn connect(&self, params: &ConnectionParams) -> Result<Connected, BusError> {
        debug!(params = %params, "Connecting to AMQP broker");

        let connection =
            Connection::connect_uri(amqp_uri(params), ConnectionProperties::default()).await?;

        let (faults_tx, faults) = mpsc::unbounded_channel();
        connection.on_error(move |err| {
            let _ = faults_tx.send(BusError::from(err));
        });

        Ok(Connected {
            connection: Arc::new(AmqpConnection { connection }),
            faults,
        })
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BusConnection for AmqpConnection {
    async fn open_channel(&self) -> Result<OpenedChannel, BusError> {
        let channel = self.connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;

        let (events_tx, events) = mpsc::unbounded_channel();
        let faults = events_tx.clone();
        channel.on_error(move |err| {
            let _ = faults.send(ChannelEvent::Fault(BusError::from(err)));
        });

        debug!(channel_id = channel.id(), "AMQP channel opened");

        Ok(OpenedChannel {
            channel: Arc::new(AmqpChannel {
                channel,
                events: events_tx,
            }),
            events,
        })
    }

    async fn close(&self) -> Result<(), BusError> {
        self.connection
            .close(REPLY_SUCCESS, "gateway shutting down")
            .await
            .map_err(BusError::from)
    }
}

struct AmqpChannel {
    channel: Channel,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

#[async_trait]
impl BusChannel for AmqpChannel {
    fn id(&self) -> u16 {
        self.channel.id()
    }

    async fn check_exchange(&self, exchange: &str) -> Result<(), BusError> {
        // Passive: the kind is ignored by the broker.
        self.channel
            .exchange_declare(
                exchange,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    passive: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(BusError::from)
    }

    async fn declare_reply_queue(&self) -> Result<String, BusError> {
        let queue = self
            .channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    exclusive: true,
                    auto_delete: true,
                    durable: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BusError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(BusError::from)
    }

    async fn consume(&self, queue: &str) -> Result<(), BusError> {
        let mut consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        let events = self.events.clone();
        let channel_id = self.channel.id();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.next().await {
                match delivery {
                    Ok(delivery) => {
                        if events
                            .send(ChannelEvent::Delivery(from_delivery(delivery)))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Err(err) => {
                        // The channel error handler reports the fault.
                        debug!(channel_id = channel_id, error = %err, "Consumer stopped");
                        break;
                    }
                }
            }
        });

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: MessageProperties,
    ) -> Result<(), BusError> {
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                &body,
                to_amqp_properties(properties),
            )
            .await?;

        let events = self.events.clone();
        tokio::spawn(async move {
            match confirm.await {
                Ok(Confirmation::Ack(Some(returned))) | Ok(Confirmation::Nack(Some(returned))) => {
                    let _ = events.send(ChannelEvent::Returned(from_delivery(returned.delivery)));
                }
                Ok(Confirmation::Nack(None)) => {
                    warn!("Publish negatively acknowledged by broker");
                }
                Ok(_) => {}
                Err(err) => {
                    debug!(error = %err, "Publish confirmation lost");
                }
            }
        });

        Ok(())
    }
}
