use std::{any::Any, collections::HashMap, fmt, io, sync::Arc};

use crate::buffer::{InputView, OutputView};

/// Shared handle to a decoded message.
pub type MessagePtr = Arc<dyn Message>;

/// Recovers the concrete type behind a `dyn Message`.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A typed payload the codec can frame.
///
/// `encode` streams the payload into the frame through the output view;
/// `decode` reads it back from a view limited to exactly the payload bytes of
/// one frame. Bytes `decode` leaves unread are skipped.
pub trait Message: AsAny + fmt::Debug {
    /// Identifier written on the wire and used for dispatch.
    fn type_name(&self) -> &'static str;

    fn encode(&self, output: &mut OutputView<'_>) -> io::Result<()>;

    fn decode(&mut self, input: &mut InputView<'_>) -> io::Result<()>;
}

/// A message type that can be constructed empty from its wire name.
pub trait NamedMessage: Message + Default {
    const TYPE_NAME: &'static str;
}

type Factory = fn() -> Box<dyn Message>;

fn make<M: NamedMessage>() -> Box<dyn Message> {
    Box::new(M::default())
}

/// Wire name to constructor table the decoder consults.
#[derive(Clone, Default)]
pub struct MessageRegistry {
    factories: HashMap<&'static str, Factory>,
}

impl MessageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M: NamedMessage>(&mut self) -> &mut Self {
        self.factories.insert(M::TYPE_NAME, make::<M>);
        self
    }

    /// A default instance of the type registered under `type_name`.
    pub fn create(&self, type_name: &str) -> Option<Box<dyn Message>> {
        self.factories.get(type_name).map(|factory| factory())
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl fmt::Debug for MessageRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("MessageRegistry")
            .field("types", &names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[derive(Debug, Default, PartialEq)]
    struct Ping {
        seq: Vec<u8>,
    }

    impl Message for Ping {
        fn type_name(&self) -> &'static str {
            Self::TYPE_NAME
        }

        fn encode(&self, output: &mut OutputView<'_>) -> io::Result<()> {
            output.write_all(&self.seq)
        }

        fn decode(&mut self, input: &mut InputView<'_>) -> io::Result<()> {
            input.read_to_end(&mut self.seq).map(|_| ())
        }
    }

    impl NamedMessage for Ping {
        const TYPE_NAME: &'static str = "test.Ping";
    }

    #[test]
    fn test_registry_creates_default_instances() {
        let mut registry = MessageRegistry::new();
        registry.register::<Ping>();
        assert!(registry.contains("test.Ping"));
        assert_eq!(registry.len(), 1);

        let message = registry.create("test.Ping").unwrap();
        assert_eq!(message.type_name(), "test.Ping");
        assert!(registry.create("test.Pong").is_none());
    }

    #[test]
    fn test_downcast_through_message_ptr() {
        let message: MessagePtr = Arc::new(Ping { seq: vec![1, 2] });
        // deref first, `Arc<dyn Message>` is itself `Any`
        assert!((*message).as_any().is::<Ping>());

        let ping = message.into_any().downcast::<Ping>().unwrap();
        assert_eq!(ping.seq, vec![1, 2]);
    }
}
