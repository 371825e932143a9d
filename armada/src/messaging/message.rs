//! Channel message model and wire encoding.

use crate::network::wire;
use crate::network::NetworkError;
use crate::service::types::ServiceEnvironment;
use bytes::{Bytes, BytesMut};
use uuid::Uuid;

/// Addressee of a channel message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelMessageTarget {
    All,
    AllNodes,
    AllServices,
    Node(String),
    Service(String),
    Task(String),
    Group(String),
    Environment(ServiceEnvironment),
}

impl ChannelMessageTarget {
    fn discriminant(&self) -> u8 {
        match self {
            Self::All => 0,
            Self::AllNodes => 1,
            Self::AllServices => 2,
            Self::Node(_) => 3,
            Self::Service(_) => 4,
            Self::Task(_) => 5,
            Self::Group(_) => 6,
            Self::Environment(_) => 7,
        }
    }
}

/// Originator of a channel message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelMessageSender {
    Node(String),
    Service(String),
}

impl ChannelMessageSender {
    pub fn name(&self) -> &str {
        match self {
            Self::Node(name) | Self::Service(name) => name,
        }
    }
}

/// A message routed across the cluster on the channel-message bus.
#[derive(Clone, Debug)]
pub struct ChannelMessage {
    pub sender: ChannelMessageSender,
    pub targets: Vec<ChannelMessageTarget>,
    /// Coarse routing key subscribers filter on.
    pub channel: String,
    /// Fine-grained message key within the channel.
    pub message: String,
    pub content: Bytes,
    /// Wait for the frame to be flushed before the send resolves.
    pub send_sync: bool,
    /// Set for query messages; replies carry the same id.
    pub query_id: Option<Uuid>,
}

impl ChannelMessage {
    pub fn builder() -> ChannelMessageBuilder {
        ChannelMessageBuilder::default()
    }

    /// Builds the reply to a query message, preserving the correlation id.
    pub fn reply_to(&self, sender: ChannelMessageSender, content: Bytes) -> ChannelMessage {
        ChannelMessage {
            sender,
            targets: vec![match &self.sender {
                ChannelMessageSender::Node(name) => ChannelMessageTarget::Node(name.clone()),
                ChannelMessageSender::Service(name) => ChannelMessageTarget::Service(name.clone()),
            }],
            channel: self.channel.clone(),
            message: self.message.clone(),
            content,
            send_sync: false,
            query_id: self.query_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.content.len() + 128);
        match &self.sender {
            ChannelMessageSender::Node(name) => {
                buf.extend_from_slice(&[0]);
                wire::put_string(&mut buf, name);
            }
            ChannelMessageSender::Service(name) => {
                buf.extend_from_slice(&[1]);
                wire::put_string(&mut buf, name);
            }
        }

        wire::put_var_u64(&mut buf, self.targets.len() as u64);
        for target in &self.targets {
            buf.extend_from_slice(&[target.discriminant()]);
            match target {
                ChannelMessageTarget::All
                | ChannelMessageTarget::AllNodes
                | ChannelMessageTarget::AllServices => {}
                ChannelMessageTarget::Node(name)
                | ChannelMessageTarget::Service(name)
                | ChannelMessageTarget::Task(name)
                | ChannelMessageTarget::Group(name) => wire::put_string(&mut buf, name),
                ChannelMessageTarget::Environment(env) => {
                    wire::put_string(&mut buf, &env.to_string())
                }
            }
        }

        wire::put_string(&mut buf, &self.channel);
        wire::put_string(&mut buf, &self.message);
        wire::put_bytes(&mut buf, &self.content);
        wire::put_bool(&mut buf, self.send_sync);
        wire::put_opt_uuid(&mut buf, self.query_id.as_ref());
        buf.freeze()
    }

    pub fn decode(payload: &Bytes) -> Result<Self, NetworkError> {
        let mut buf = payload.clone();

        let sender_kind = wire::get_var_u64(&mut buf)? as u8;
        let sender_name = wire::get_string(&mut buf)?;
        let sender = match sender_kind {
            0 => ChannelMessageSender::Node(sender_name),
            1 => ChannelMessageSender::Service(sender_name),
            other => {
                return Err(NetworkError::Decode(format!(
                    "unknown sender kind {other}"
                )))
            }
        };

        let target_count = wire::get_var_u64(&mut buf)? as usize;
        let mut targets = Vec::with_capacity(target_count);
        for _ in 0..target_count {
            let kind = wire::get_var_u64(&mut buf)? as u8;
            let target = match kind {
                0 => ChannelMessageTarget::All,
                1 => ChannelMessageTarget::AllNodes,
                2 => ChannelMessageTarget::AllServices,
                3 => ChannelMessageTarget::Node(wire::get_string(&mut buf)?),
                4 => ChannelMessageTarget::Service(wire::get_string(&mut buf)?),
                5 => ChannelMessageTarget::Task(wire::get_string(&mut buf)?),
                6 => ChannelMessageTarget::Group(wire::get_string(&mut buf)?),
                7 => {
                    let env = wire::get_string(&mut buf)?;
                    ChannelMessageTarget::Environment(parse_environment(&env)?)
                }
                other => {
                    return Err(NetworkError::Decode(format!(
                        "unknown target kind {other}"
                    )))
                }
            };
            targets.push(target);
        }

        let channel = wire::get_string(&mut buf)?;
        let message = wire::get_string(&mut buf)?;
        let content = wire::get_bytes(&mut buf)?;
        let send_sync = wire::get_bool(&mut buf)?;
        let query_id = wire::get_opt_uuid(&mut buf)?;

        Ok(Self {
            sender,
            targets,
            channel,
            message,
            content,
            send_sync,
            query_id,
        })
    }
}

fn parse_environment(value: &str) -> Result<ServiceEnvironment, NetworkError> {
    match value {
        "game-server" => Ok(ServiceEnvironment::GameServer),
        "proxy" => Ok(ServiceEnvironment::Proxy),
        "generic" => Ok(ServiceEnvironment::Generic),
        other => Err(NetworkError::Decode(format!(
            "unknown service environment {other}"
        ))),
    }
}

/// Builder for [`ChannelMessage`].
#[derive(Default)]
pub struct ChannelMessageBuilder {
    sender: Option<ChannelMessageSender>,
    targets: Vec<ChannelMessageTarget>,
    channel: String,
    message: String,
    content: Bytes,
    send_sync: bool,
    query_id: Option<Uuid>,
}

impl ChannelMessageBuilder {
    pub fn sender(mut self, sender: ChannelMessageSender) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn target(mut self, target: ChannelMessageTarget) -> Self {
        self.targets.push(target);
        self
    }

    pub fn targets(mut self, targets: impl IntoIterator<Item = ChannelMessageTarget>) -> Self {
        self.targets.extend(targets);
        self
    }

    pub fn channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn content(mut self, content: Bytes) -> Self {
        self.content = content;
        self
    }

    pub fn send_sync(mut self, send_sync: bool) -> Self {
        self.send_sync = send_sync;
        self
    }

    /// Turns the message into a query with a fresh correlation id.
    pub fn as_query(mut self) -> Self {
        self.query_id = Some(Uuid::new_v4());
        self
    }

    /// Finalizes the message. The sender defaults to an unnamed node and is
    /// filled in by the bus when unset.
    pub fn build(self) -> ChannelMessage {
        ChannelMessage {
            sender: self
                .sender
                .unwrap_or(ChannelMessageSender::Node(String::new())),
            targets: self.targets,
            channel: self.channel,
            message: self.message,
            content: self.content,
            send_sync: self.send_sync,
            query_id: self.query_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_encode_decode_roundtrip() {
        let message = ChannelMessage::builder()
            .sender(ChannelMessageSender::Node("node-1".to_string()))
            .target(ChannelMessageTarget::All)
            .target(ChannelMessageTarget::Service("lobby-1".to_string()))
            .target(ChannelMessageTarget::Environment(ServiceEnvironment::Proxy))
            .channel("armada:internal")
            .message("update_service_lifecycle")
            .content(Bytes::from_static(b"\x01\x02\x03"))
            .send_sync(true)
            .as_query()
            .build();

        let decoded = ChannelMessage::decode(&message.encode()).unwrap();
        assert_eq!(decoded.sender, message.sender);
        assert_eq!(decoded.targets, message.targets);
        assert_eq!(decoded.channel, message.channel);
        assert_eq!(decoded.message, message.message);
        assert_eq!(decoded.content, message.content);
        assert_eq!(decoded.send_sync, message.send_sync);
        assert_eq!(decoded.query_id, message.query_id);
    }

    #[test]
    fn test_reply_targets_original_sender() {
        let query = ChannelMessage::builder()
            .sender(ChannelMessageSender::Service("lobby-1".to_string()))
            .target(ChannelMessageTarget::Node("node-2".to_string()))
            .channel("c")
            .message("m")
            .as_query()
            .build();

        let reply = query.reply_to(
            ChannelMessageSender::Node("node-2".to_string()),
            Bytes::from_static(b"ok"),
        );
        assert_eq!(
            reply.targets,
            vec![ChannelMessageTarget::Service("lobby-1".to_string())]
        );
        assert_eq!(reply.query_id, query.query_id);
    }
}
