//! Pure routing of rumqttc events and delivery bookkeeping

use super::options::from_mqtt_qos;
use crate::session::model::{DeliveryToken, InboundMessage};
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::Event;
use rumqttc::Outgoing;
use std::collections::{HashMap, VecDeque};

/// What the client driver should do with one event-loop event
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Broker accepted the connection
    ConnectionAcknowledged,
    MessageReceived(InboundMessage),
    /// A publish left the client under this packet id (0 for QoS 0)
    PublishSent(u16),
    /// PUBACK or PUBCOMP closed the flow for this packet id
    PublishAcknowledged(u16),
    PingResponse,
    /// Broker sent DISCONNECT
    BrokerDisconnect(String),
    /// Our DISCONNECT went out
    DisconnectSent,
    /// Anything else that still counts as traffic from the broker
    InfrastructureEvent,
    OutgoingEvent,
}

impl EventRoute {
    /// Incoming packets prove the link is alive
    pub fn is_incoming(&self) -> bool {
        !matches!(
            self,
            EventRoute::PublishSent(_) | EventRoute::DisconnectSent | EventRoute::OutgoingEvent
        )
    }
}

/// Route an event-loop event
pub fn route_mqtt_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(incoming) => match incoming {
            Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
            Packet::Publish(publish) => EventRoute::MessageReceived(InboundMessage {
                topic: String::from_utf8_lossy(&publish.topic).to_string(),
                payload: publish.payload.to_vec(),
                qos: from_mqtt_qos(publish.qos),
                retained: publish.retain,
            }),
            Packet::PubAck(ack) => EventRoute::PublishAcknowledged(ack.pkid),
            Packet::PubComp(comp) => EventRoute::PublishAcknowledged(comp.pkid),
            Packet::PingResp(_) => EventRoute::PingResponse,
            Packet::Disconnect(disconnect) => {
                EventRoute::BrokerDisconnect(format!("broker disconnected: {disconnect:?}"))
            }
            _ => EventRoute::InfrastructureEvent,
        },
        Event::Outgoing(outgoing) => match outgoing {
            Outgoing::Publish(pkid) => EventRoute::PublishSent(*pkid),
            Outgoing::Disconnect => EventRoute::DisconnectSent,
            _ => EventRoute::OutgoingEvent,
        },
    }
}

/// Maps publish calls to broker acknowledgements
///
/// rumqttc assigns packet ids inside the event loop, so tokens are queued
/// in publish order and bound to a packet id when the publish goes out.
#[derive(Debug, Default)]
pub struct DeliveryTracker {
    queued: VecDeque<DeliveryToken>,
    inflight: HashMap<u16, DeliveryToken>,
}

impl DeliveryTracker {
    pub fn queue(&mut self, token: DeliveryToken) {
        self.queued.push_back(token);
    }

    /// Forget a token whose publish never reached the event loop
    pub fn withdraw(&mut self, token: DeliveryToken) {
        self.queued.retain(|queued| *queued != token);
    }

    /// Bind the oldest queued token; QoS 0 publishes complete immediately
    pub fn on_publish_sent(&mut self, pkid: u16) -> Option<DeliveryToken> {
        let token = self.queued.pop_front()?;
        if pkid == 0 {
            return Some(token);
        }
        self.inflight.insert(pkid, token);
        None
    }

    pub fn on_acknowledged(&mut self, pkid: u16) -> Option<DeliveryToken> {
        self.inflight.remove(&pkid)
    }

    /// Everything still pending, in token order
    pub fn drain(&mut self) -> Vec<DeliveryToken> {
        let mut pending: Vec<DeliveryToken> = self
            .queued
            .drain(..)
            .chain(self.inflight.drain().map(|(_, token)| token))
            .collect();
        pending.sort();
        pending
    }

    pub fn pending(&self) -> usize {
        self.queued.len() + self.inflight.len()
    }
}
