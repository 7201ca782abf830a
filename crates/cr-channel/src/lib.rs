//! Canvas Relay Message Channel
//!
//! The only coordination path between the host and the sandbox:
//! - Tagged messages with sequence-numbered render cycles
//! - JSON wire encoding with an out-of-band transfer list
//! - A broadcast-style host inbox with one-shot listeners

mod message;
mod port;
mod wire;

pub use message::{Command, FrameTime, Message, Seq};
pub use port::{channel, ChannelError, HostPort, Listener, SandboxPort};
pub use wire::{decode, encode, Direction, Envelope, Transferable};
