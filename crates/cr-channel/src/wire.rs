//! Wire encoding.
//!
//! Messages travel as JSON text, structured-clone style, while transferable
//! resources ride alongside in a transfer list and are referenced from the
//! JSON by index:
//!
//! ```text
//! {"command":"init","offscreen":{"$transfer":0}}   host -> sandbox
//! {"command":"init"}                               sandbox -> host
//! {"command":"render","time":0.5,"seq":7}          host -> sandbox
//! {"command":"render","seq":7}                     sandbox -> host
//! ```
//!
//! Only `command` is required. Unknown commands decode to `None`.

use crate::message::{Message, Seq};
use crate::port::ChannelError;
use cr_surface::OffscreenSurface;
use serde::{Deserialize, Serialize};

/// A resource whose ownership moves with the message.
#[derive(Debug)]
pub enum Transferable {
    Offscreen(OffscreenSurface),
}

/// One posted message: cloned data plus moved resources.
#[derive(Debug)]
pub struct Envelope {
    pub data: String,
    pub transfer: Vec<Transferable>,
}

/// Which side is decoding. The same wire name means a request when
/// travelling to the sandbox and an ack when travelling to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ToSandbox,
    ToHost,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireData {
    command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    offscreen: Option<TransferRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    seq: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TransferRef {
    #[serde(rename = "$transfer")]
    index: usize,
}

impl WireData {
    fn bare(command: &str) -> Self {
        Self {
            command: command.to_string(),
            offscreen: None,
            time: None,
            seq: None,
        }
    }
}

/// Serialize a message, moving any transferable into the transfer list.
pub fn encode(message: Message) -> Result<Envelope, ChannelError> {
    let name = message.command().wire_name();
    let mut transfer = Vec::new();
    let data = match message {
        Message::Init { offscreen } => {
            transfer.push(Transferable::Offscreen(offscreen));
            WireData {
                offscreen: Some(TransferRef { index: 0 }),
                ..WireData::bare(name)
            }
        }
        Message::InitAck => WireData::bare(name),
        Message::Render { time, seq } => {
            if !time.is_finite() {
                return Err(ChannelError::Malformed(format!("non-finite time {time}")));
            }
            WireData {
                time: Some(time),
                seq: Some(seq.0),
                ..WireData::bare(name)
            }
        }
        Message::RenderAck { seq } => WireData {
            seq: Some(seq.0),
            ..WireData::bare(name)
        },
    };
    let data = serde_json::to_string(&data).map_err(|e| ChannelError::Malformed(e.to_string()))?;
    Ok(Envelope { data, transfer })
}

/// Deserialize a message as seen by `direction`'s receiver.
///
/// Transfer-list entries the message does not reference are dropped.
pub fn decode(envelope: Envelope, direction: Direction) -> Result<Option<Message>, ChannelError> {
    let Envelope { data, transfer } = envelope;
    let wire: WireData =
        serde_json::from_str(&data).map_err(|e| ChannelError::Malformed(e.to_string()))?;
    let seq = Seq(wire.seq.unwrap_or(0));

    let message = match (direction, wire.command.as_str()) {
        (Direction::ToSandbox, "init") => {
            let index = wire
                .offscreen
                .ok_or_else(|| ChannelError::Malformed("init without offscreen".to_string()))?
                .index;
            let offscreen = transfer
                .into_iter()
                .nth(index)
                .map(|Transferable::Offscreen(surface)| surface)
                .ok_or(ChannelError::MissingTransfer(index))?;
            Message::Init { offscreen }
        }
        (Direction::ToSandbox, "render") => {
            let time = wire
                .time
                .ok_or_else(|| ChannelError::Malformed("render without time".to_string()))?;
            Message::Render { time, seq }
        }
        (Direction::ToHost, "init") => Message::InitAck,
        (Direction::ToHost, "render") => Message::RenderAck { seq },
        _ => return Ok(None),
    };
    Ok(Some(message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cr_surface::{Display, HiddenSurface};
    use std::time::Duration;

    fn envelope(data: &str) -> Envelope {
        Envelope {
            data: data.to_string(),
            transfer: Vec::new(),
        }
    }

    #[test]
    fn test_encode_matches_wire_format() {
        let env = encode(Message::Render { time: 0.5, seq: Seq(7) }).unwrap();
        assert_eq!(env.data, r#"{"command":"render","time":0.5,"seq":7}"#);
        assert!(env.transfer.is_empty());

        assert_eq!(encode(Message::InitAck).unwrap().data, r#"{"command":"init"}"#);
        assert_eq!(
            encode(Message::RenderAck { seq: Seq(7) }).unwrap().data,
            r#"{"command":"render","seq":7}"#
        );
    }

    #[test]
    fn test_init_moves_surface_through_transfer_list() {
        let display = Display::start(Duration::from_secs(60)).unwrap();
        let mut hidden = HiddenSurface::new(16, 16, &display).unwrap();
        let offscreen = hidden.transfer_control_to_offscreen().unwrap();
        let id = offscreen.id();

        let env = encode(Message::Init { offscreen }).unwrap();
        assert_eq!(env.data, r#"{"command":"init","offscreen":{"$transfer":0}}"#);
        assert_eq!(env.transfer.len(), 1);

        match decode(env, Direction::ToSandbox).unwrap() {
            Some(Message::Init { offscreen }) => assert_eq!(offscreen.id(), id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_direction_selects_ack() {
        let ack = decode(envelope(r#"{"command":"render","seq":2}"#), Direction::ToHost).unwrap();
        assert!(matches!(ack, Some(Message::RenderAck { seq: Seq(2) })));

        let init = decode(envelope(r#"{"command":"init"}"#), Direction::ToHost).unwrap();
        assert!(matches!(init, Some(Message::InitAck)));
    }

    #[test]
    fn test_untagged_render_defaults_to_seq_zero() {
        let msg = decode(envelope(r#"{"command":"render","time":1}"#), Direction::ToSandbox).unwrap();
        assert!(matches!(msg, Some(Message::Render { seq: Seq(0), .. })));
    }

    #[test]
    fn test_unknown_commands_are_ignored() {
        let msg = decode(envelope(r#"{"command":"resize","width":3}"#), Direction::ToSandbox).unwrap();
        assert!(msg.is_none());
        let msg = decode(envelope(r#"{"command":"resize"}"#), Direction::ToHost).unwrap();
        assert!(msg.is_none());
    }

    #[test]
    fn test_malformed_messages() {
        assert!(matches!(
            decode(envelope(r#"{"time":1}"#), Direction::ToSandbox),
            Err(ChannelError::Malformed(_))
        ));
        assert!(matches!(
            decode(envelope(r#"{"command":"render"}"#), Direction::ToSandbox),
            Err(ChannelError::Malformed(_))
        ));
        assert!(matches!(
            decode(envelope(r#"{"command":"init","offscreen":{"$transfer":0}}"#), Direction::ToSandbox),
            Err(ChannelError::MissingTransfer(0))
        ));
        assert!(matches!(
            encode(Message::Render { time: f64::NAN, seq: Seq(1) }),
            Err(ChannelError::Malformed(_))
        ));
    }
}
