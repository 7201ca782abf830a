//! Message types exchanged between the host and the sandbox.

use cr_surface::OffscreenSurface;
use std::fmt;

/// Time value driving the sandbox's draw routine.
pub type FrameTime = f64;

/// Render cycle sequence number.
///
/// Assigned by the host, echoed back by the sandbox. `Seq(0)` marks an
/// untagged message from a peer that predates sequencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Seq(pub u64);

impl Seq {
    /// The sequence number after this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Command tag of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    Init,
    InitAck,
    Render,
    RenderAck,
}

impl Command {
    /// Name used on the wire. Acks reuse their request's name.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Init | Self::InitAck => "init",
            Self::Render | Self::RenderAck => "render",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::InitAck => write!(f, "init-ack"),
            Self::Render => write!(f, "render"),
            Self::RenderAck => write!(f, "render-ack"),
        }
    }
}

/// Messages carried by the channel.
#[derive(Debug)]
pub enum Message {
    /// Host -> sandbox: take ownership of the drawing surface
    Init { offscreen: OffscreenSurface },
    /// Sandbox -> host: a drawing context is bound
    InitAck,
    /// Host -> sandbox: draw the frame for `time`
    Render { time: FrameTime, seq: Seq },
    /// Sandbox -> host: the frame for `seq` has been submitted
    RenderAck { seq: Seq },
}

impl Message {
    pub fn command(&self) -> Command {
        match self {
            Self::Init { .. } => Command::Init,
            Self::InitAck => Command::InitAck,
            Self::Render { .. } => Command::Render,
            Self::RenderAck { .. } => Command::RenderAck,
        }
    }

    pub fn seq(&self) -> Option<Seq> {
        match self {
            Self::Render { seq, .. } | Self::RenderAck { seq } => Some(*seq),
            Self::Init { .. } | Self::InitAck => None,
        }
    }

    /// Copy a message that carries no transferable.
    ///
    /// `Init` owns the surface handle and cannot be duplicated.
    pub fn duplicate(&self) -> Option<Self> {
        match self {
            Self::Init { .. } => None,
            Self::InitAck => Some(Self::InitAck),
            Self::Render { time, seq } => Some(Self::Render { time: *time, seq: *seq }),
            Self::RenderAck { seq } => Some(Self::RenderAck { seq: *seq }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_share_request_tag() {
        assert_eq!(Command::Init.wire_name(), Command::InitAck.wire_name());
        assert_eq!(Command::Render.wire_name(), Command::RenderAck.wire_name());
        assert_eq!(Command::RenderAck.to_string(), "render-ack");
    }

    #[test]
    fn test_seq_and_duplicate() {
        let msg = Message::Render { time: 0.5, seq: Seq(3) };
        assert_eq!(msg.command(), Command::Render);
        assert_eq!(msg.seq(), Some(Seq(3)));
        assert_eq!(Seq(3).next(), Seq(4));

        let copy = msg.duplicate().unwrap();
        assert!(matches!(copy, Message::Render { time, seq: Seq(3) } if time == 0.5));
        assert_eq!(Message::InitAck.seq(), None);
    }
}
