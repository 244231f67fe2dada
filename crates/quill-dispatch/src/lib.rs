//! Process-wide behavior registry: the seam between the connection reactor
//! and the message-routing engine.
//!
//! Three pluggable behaviors (user, channel, push) plus a wire-protocol
//! codec are registered at startup; registration is last-writer-wins and
//! must happen before the engine starts, after which the slots are only
//! read. The reactor's data callback frames packets with the codec and
//! dispatches them to the registered behaviors without knowing anything
//! about routing.

use std::sync::Arc;

use parking_lot::RwLock;

use quill_net::{Conn, NetResult};

/// Routing behavior for authenticated user traffic.
pub trait UserBehavior: Send + Sync {
    /// Deliver one framed packet from a user connection.
    fn deliver(&self, conn: &Arc<dyn Conn>, frame: &[u8]) -> NetResult<()>;

    /// The connection carrying this user closed.
    fn conn_closed(&self, conn: &Arc<dyn Conn>);
}

/// Routing behavior for channel-bound message events.
pub trait ChannelBehavior: Send + Sync {
    /// Deliver one message event addressed to a channel.
    fn deliver(&self, channel_id: &str, channel_type: u8, payload: &[u8]) -> NetResult<()>;
}

/// Hook for offering push-notification opportunities for offline users.
pub trait PushBehavior: Send + Sync {
    fn offer(&self, uid: &str, payload: &[u8]);
}

/// Wire-protocol framing contract.
///
/// The reactor only needs frame boundaries: given the current inbound
/// bytes, report how long the next complete packet is (`None` while the
/// frame is still partial). Packet contents stay opaque here.
pub trait Protocol: Send + Sync {
    fn frame_len(&self, data: &[u8]) -> NetResult<Option<usize>>;
}

static USER: RwLock<Option<Arc<dyn UserBehavior>>> = RwLock::new(None);
static CHANNEL: RwLock<Option<Arc<dyn ChannelBehavior>>> = RwLock::new(None);
static PUSH: RwLock<Option<Arc<dyn PushBehavior>>> = RwLock::new(None);
static PROTO: RwLock<Option<Arc<dyn Protocol>>> = RwLock::new(None);

/// Install the user behavior, replacing any current one.
pub fn register_user(behavior: Arc<dyn UserBehavior>) {
    *USER.write() = Some(behavior);
}

/// Install the channel behavior, replacing any current one.
pub fn register_channel(behavior: Arc<dyn ChannelBehavior>) {
    *CHANNEL.write() = Some(behavior);
}

/// Install the push behavior, replacing any current one.
pub fn register_push(behavior: Arc<dyn PushBehavior>) {
    *PUSH.write() = Some(behavior);
}

/// Install the wire-protocol codec, replacing any current one.
pub fn register_proto(proto: Arc<dyn Protocol>) {
    *PROTO.write() = Some(proto);
}

pub fn user() -> Option<Arc<dyn UserBehavior>> {
    USER.read().clone()
}

pub fn channel() -> Option<Arc<dyn ChannelBehavior>> {
    CHANNEL.read().clone()
}

pub fn push() -> Option<Arc<dyn PushBehavior>> {
    PUSH.read().clone()
}

pub fn proto() -> Option<Arc<dyn Protocol>> {
    PROTO.read().clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct LengthPrefixed;

    impl Protocol for LengthPrefixed {
        fn frame_len(&self, data: &[u8]) -> NetResult<Option<usize>> {
            if data.len() < 4 {
                return Ok(None);
            }
            let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if data.len() < 4 + len {
                return Ok(None);
            }
            Ok(Some(4 + len))
        }
    }

    struct CountingChannel;

    impl ChannelBehavior for CountingChannel {
        fn deliver(&self, _channel_id: &str, _channel_type: u8, _payload: &[u8]) -> NetResult<()> {
            Ok(())
        }
    }

    #[test]
    fn registration_is_last_writer_wins() {
        register_channel(Arc::new(CountingChannel));
        let first = channel().expect("registered");
        register_channel(Arc::new(CountingChannel));
        let second = channel().expect("registered");
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn codec_reports_frame_boundaries() {
        register_proto(Arc::new(LengthPrefixed));
        let proto = proto().expect("registered");
        assert_eq!(proto.frame_len(&[0, 0]).expect("partial header"), None);
        let mut frame = vec![0, 0, 0, 3];
        frame.extend_from_slice(b"abc");
        frame.extend_from_slice(b"rest");
        assert_eq!(proto.frame_len(&frame).expect("complete"), Some(7));
        assert_eq!(proto.frame_len(&frame[..5]).expect("partial body"), None);
    }
}
