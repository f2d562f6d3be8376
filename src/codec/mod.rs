//! Typed messages over TCP.
//!
//! Every frame is big-endian and self-describing:
//!
//! ```text
//! ┌───────────────┬──────────────────┬────────────────────────┬─────────────┐
//! │ total_len i32 │ name_len i32     │ type name + NUL        │ payload     │
//! └───────────────┴──────────────────┴────────────────────────┴─────────────┘
//!                  └──────────────────── total_len bytes ──────────────────┘
//! ```
//!
//! [`MessageCodec`] is a [`NetworkHandler`](crate::net::tcp::NetworkHandler)
//! that cuts frames out of a connection's input buffer, builds the registered
//! [`Message`] type and hands it to a [`MessageHandler`], usually a
//! [`Dispatcher`]. [`send_message`] goes the other way.

pub mod dispatcher;
pub mod framing;
pub mod message;

pub use dispatcher::Dispatcher;
pub use framing::{
    decode_frame, encode_frame, send_message, CodecError, MessageCodec, MessageHandler,
    HEADER_LEN, MAX_MESSAGE_LEN, MIN_MESSAGE_LEN,
};
pub use message::{AsAny, Message, MessagePtr, MessageRegistry, NamedMessage};
