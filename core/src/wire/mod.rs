//! Inter-task wire format: the message schema and its binary codec.

mod codec;
mod message;

pub use codec::{Decoder, Encoder, VERSION, decode_message, encode_message};
pub use message::{GcPhase, Message, ScheduledFrame, WireArray, WireValue};

#[cfg(test)]
mod wire_test;
