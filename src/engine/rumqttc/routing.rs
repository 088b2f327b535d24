//! Pure routing of rumqttc event-loop events

use bytes::Bytes;
use rumqttc::{ConnectReturnCode, Event, Outgoing, Packet, SubscribeReasonCode};

/// What the supervisor should do with one event-loop event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventRoute {
    /// CONNACK received
    ConnectionAcknowledged {
        accepted: bool,
        code: String,
        session_present: bool,
    },
    /// PUBLISH received on a subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// SUBACK with at least one rejected filter
    SubscriptionRejected { pkid: u16 },
    /// Broker sent DISCONNECT
    BrokerDisconnect,
    /// Our own DISCONNECT went out
    DisconnectSent,
    /// Keep-alive traffic, acks and other bookkeeping
    Infrastructure,
}

pub fn route_event(event: &Event) -> EventRoute {
    match event {
        Event::Incoming(Packet::ConnAck(connack)) => EventRoute::ConnectionAcknowledged {
            accepted: connack.code == ConnectReturnCode::Success,
            code: format!("{:?}", connack.code),
            session_present: connack.session_present,
        },
        Event::Incoming(Packet::Publish(publish)) => EventRoute::MessageReceived {
            topic: publish.topic.clone(),
            payload: publish.payload.clone(),
        },
        Event::Incoming(Packet::SubAck(suback))
            if suback
                .return_codes
                .iter()
                .any(|code| matches!(code, SubscribeReasonCode::Failure)) =>
        {
            EventRoute::SubscriptionRejected { pkid: suback.pkid }
        }
        Event::Incoming(Packet::Disconnect) => EventRoute::BrokerDisconnect,
        Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
        _ => EventRoute::Infrastructure,
    }
}
