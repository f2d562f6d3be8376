use std::{collections::HashMap, fmt, sync::Arc};

use tracing::warn;

use crate::{
    codec::{
        framing::MessageHandler,
        message::{MessagePtr, NamedMessage},
    },
    net::tcp::TcpConnectionRef,
};

type MessageCallback = Box<dyn Fn(&TcpConnectionRef, MessagePtr) + Send + Sync + 'static>;
type ConnectionCallback = Box<dyn Fn(&TcpConnectionRef) + Send + Sync + 'static>;

/// Routes decoded messages to a callback registered for their type.
///
/// Messages of a type without a callback go to the default callback, which
/// logs and closes the connection unless replaced.
pub struct Dispatcher {
    callbacks: HashMap<&'static str, MessageCallback>,
    default: MessageCallback,
    connection: Option<ConnectionCallback>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_default(|conn, message| {
            warn!(conn = %conn.id(), message = message.type_name(), "no callback for message, closing");
            conn.close();
        })
    }

    pub fn with_default<F>(default: F) -> Self
    where
        F: Fn(&TcpConnectionRef, MessagePtr) + Send + Sync + 'static,
    {
        Self {
            callbacks: HashMap::new(),
            default: Box::new(default),
            connection: None,
        }
    }

    /// Registers `callback` for messages of type `M`, replacing any earlier one.
    pub fn register<M, F>(&mut self, callback: F) -> &mut Self
    where
        M: NamedMessage,
        F: Fn(&TcpConnectionRef, Arc<M>) + Send + Sync + 'static,
    {
        self.callbacks.insert(
            M::TYPE_NAME,
            Box::new(move |conn, message| match message.into_any().downcast::<M>() {
                Ok(message) => callback(conn, message),
                Err(_) => {
                    warn!(conn = %conn.id(), expected = M::TYPE_NAME, "message type does not match its wire name");
                }
            }),
        );
        self
    }

    /// Called on connection up and down, forwarded from the codec.
    pub fn on_connection<F>(&mut self, callback: F) -> &mut Self
    where
        F: Fn(&TcpConnectionRef) + Send + Sync + 'static,
    {
        self.connection = Some(Box::new(callback));
        self
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.callbacks.contains_key(type_name)
    }

    pub fn dispatch(&self, conn: &TcpConnectionRef, message: MessagePtr) {
        match self.callbacks.get(message.type_name()) {
            Some(callback) => callback(conn, message),
            None => (self.default)(conn, message),
        }
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageHandler for Dispatcher {
    fn on_connection(&self, conn: &TcpConnectionRef) {
        if let Some(callback) = &self.connection {
            callback(conn);
        }
    }

    fn on_message(&self, conn: &TcpConnectionRef, message: MessagePtr) {
        self.dispatch(conn, message);
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.callbacks.keys().collect();
        types.sort();
        f.debug_struct("Dispatcher").field("types", &types).finish()
    }
}
