//! Message types shared by the echo demos.

use std::io::{self, Read, Write};

use mill_tcp::{
    codec::{Message, MessageRegistry, NamedMessage},
    InputView, OutputView,
};

pub const DEFAULT_ADDR: &str = "127.0.0.1:8765";

#[derive(Debug, Default, Clone)]
pub struct EchoRequest {
    pub seq: u32,
    pub text: String,
}

#[derive(Debug, Default, Clone)]
pub struct EchoResponse {
    pub seq: u32,
    pub text: String,
}

macro_rules! seq_text_message {
    ($ty:ident, $name:literal) => {
        impl Message for $ty {
            fn type_name(&self) -> &'static str {
                Self::TYPE_NAME
            }

            fn encode(&self, output: &mut OutputView<'_>) -> io::Result<()> {
                output.write_all(&self.seq.to_be_bytes())?;
                output.write_all(self.text.as_bytes())
            }

            fn decode(&mut self, input: &mut InputView<'_>) -> io::Result<()> {
                let mut seq = [0u8; 4];
                input.read_exact(&mut seq)?;
                self.seq = u32::from_be_bytes(seq);
                input.read_to_string(&mut self.text).map(|_| ())
            }
        }

        impl NamedMessage for $ty {
            const TYPE_NAME: &'static str = $name;
        }
    };
}

seq_text_message!(EchoRequest, "echo.EchoRequest");
seq_text_message!(EchoResponse, "echo.EchoResponse");

pub fn registry() -> MessageRegistry {
    let mut registry = MessageRegistry::new();
    registry
        .register::<EchoRequest>()
        .register::<EchoResponse>();
    registry
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}
