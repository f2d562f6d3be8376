mod common;

use std::{
    io::{self, Read, Write},
    net::TcpStream,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use common::{wait_until, LoopHandle};
use mill_tcp::{
    codec::{
        decode_frame, encode_frame, send_message, CodecError, Dispatcher, Message, MessageCodec,
        MessageHandler, MessagePtr, MessageRegistry, NamedMessage, MAX_MESSAGE_LEN,
    },
    net::tcp::{TcpConnectionRef, TcpServer, TcpServerConfig},
    Buffer, InputView, OutputView, PiecePool,
};
use parking_lot::Mutex;

#[derive(Debug, Default, Clone, PartialEq)]
struct EchoRequest {
    text: String,
}

impl Message for EchoRequest {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn encode(&self, output: &mut OutputView<'_>) -> io::Result<()> {
        output.write_all(self.text.as_bytes())
    }

    fn decode(&mut self, input: &mut InputView<'_>) -> io::Result<()> {
        input.read_to_string(&mut self.text).map(|_| ())
    }
}

impl NamedMessage for EchoRequest {
    const TYPE_NAME: &'static str = "demo.EchoRequest";
}

#[derive(Debug, Default, Clone, PartialEq)]
struct EchoResponse {
    text: String,
}

impl Message for EchoResponse {
    fn type_name(&self) -> &'static str {
        Self::TYPE_NAME
    }

    fn encode(&self, output: &mut OutputView<'_>) -> io::Result<()> {
        output.write_all(self.text.as_bytes())
    }

    fn decode(&mut self, input: &mut InputView<'_>) -> io::Result<()> {
        input.read_to_string(&mut self.text).map(|_| ())
    }
}

impl NamedMessage for EchoResponse {
    const TYPE_NAME: &'static str = "demo.EchoResponse";
}

fn registry() -> MessageRegistry {
    let mut registry = MessageRegistry::new();
    registry
        .register::<EchoRequest>()
        .register::<EchoResponse>();
    registry
}

fn start_server<H: mill_tcp::net::tcp::NetworkHandler>(base: &LoopHandle, handler: H) -> TcpServer {
    let config = TcpServerConfig::builder().worker_threads(2).build();
    let server = TcpServer::new(&base.event_loop, config, handler).unwrap();
    server.start().unwrap();
    server
}

fn stop_server(server: &TcpServer) {
    let done = Arc::new(AtomicUsize::new(0));
    let counter = done.clone();
    server
        .stop(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    assert!(wait_until(Duration::from_secs(5), || done.load(Ordering::SeqCst) == 1));
}

fn read_frame(stream: &mut TcpStream) -> MessagePtr {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).unwrap();
    let mut body = vec![0u8; i32::from_be_bytes(header) as usize];
    stream.read_exact(&mut body).unwrap();

    let pool = PiecePool::new();
    let mut buffer = Buffer::new(&pool);
    buffer.write(&header);
    buffer.write(&body);
    decode_frame(&registry(), &mut buffer)
        .expect("complete frame")
        .expect("valid frame")
}

fn assert_closed_by_server(stream: &mut TcpStream) {
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut rest = Vec::new();
    // reset is as good as an orderly close here
    let _ = stream.read_to_end(&mut rest);
}

fn echo_dispatcher(requests: Arc<AtomicUsize>) -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register::<EchoRequest, _>(move |conn, request| {
        requests.fetch_add(1, Ordering::SeqCst);
        send_message(
            conn,
            &EchoResponse {
                text: request.text.to_uppercase(),
            },
        );
    });
    dispatcher
}

#[test]
fn echo_request_split_across_reads() {
    let base = LoopHandle::spawn("codec-base");
    let requests = Arc::new(AtomicUsize::new(0));
    let server = start_server(
        &base,
        MessageCodec::new(registry(), echo_dispatcher(requests.clone())),
    );

    let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
    stream.set_nodelay(true).unwrap();
    let pool = PiecePool::new();
    let mut bytes = Vec::new();
    for text in ["first", "second message", ""] {
        let request = EchoRequest {
            text: text.to_string(),
        };
        bytes.extend(encode_frame(&request, &pool).unwrap().to_vec());
    }
    for chunk in bytes.chunks(7) {
        stream.write_all(chunk).unwrap();
        thread::sleep(Duration::from_millis(1));
    }

    for expected in ["FIRST", "SECOND MESSAGE", ""] {
        let reply = read_frame(&mut stream);
        assert_eq!(reply.type_name(), EchoResponse::TYPE_NAME);
        let reply = reply.into_any().downcast::<EchoResponse>().unwrap();
        assert_eq!(reply.text, expected);
    }
    assert_eq!(requests.load(Ordering::SeqCst), 3);

    stop_server(&server);
}

#[test]
fn unregistered_callback_falls_back_to_default() {
    let base = LoopHandle::spawn("codec-base");
    let requests = Arc::new(AtomicUsize::new(0));
    let unrouted = Arc::new(Mutex::new(Vec::new()));
    let seen = unrouted.clone();
    let mut dispatcher =
        Dispatcher::with_default(move |conn: &TcpConnectionRef, message: MessagePtr| {
            seen.lock().push(message.type_name());
            conn.close();
        });
    let counter = requests.clone();
    dispatcher.register::<EchoRequest, _>(move |_conn, _request| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let server = start_server(&base, MessageCodec::new(registry(), dispatcher));

    let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
    let pool = PiecePool::new();
    let response = EchoResponse {
        text: "not expected here".to_string(),
    };
    stream
        .write_all(&encode_frame(&response, &pool).unwrap().to_vec())
        .unwrap();

    assert_closed_by_server(&mut stream);
    assert!(wait_until(Duration::from_secs(5), || unrouted.lock().len() == 1));
    assert_eq!(*unrouted.lock(), vec![EchoResponse::TYPE_NAME]);
    assert_eq!(requests.load(Ordering::SeqCst), 0);
    assert!(wait_until(Duration::from_secs(5), || server.connection_count() == 0));

    stop_server(&server);
}

#[derive(Default)]
struct ErrorCounter {
    messages: AtomicUsize,
    errors: Mutex<Vec<&'static str>>,
}

impl MessageHandler for ErrorCounter {
    fn on_message(&self, _conn: &TcpConnectionRef, _message: MessagePtr) {
        self.messages.fetch_add(1, Ordering::SeqCst);
    }

    fn on_codec_error(&self, conn: &TcpConnectionRef, error: CodecError) {
        self.errors.lock().push(error.as_str());
        conn.close();
    }
}

#[test]
fn length_below_minimum_is_rejected_once() {
    let base = LoopHandle::spawn("codec-base");
    let handler = Arc::new(ErrorCounter::default());
    let server = start_server(&base, MessageCodec::new(registry(), handler.clone()));

    let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
    let mut bytes = 1i32.to_be_bytes().to_vec();
    bytes.extend_from_slice(&[0u8; 16]);
    stream.write_all(&bytes).unwrap();

    assert_closed_by_server(&mut stream);
    assert!(wait_until(Duration::from_secs(5), || server.connection_count() == 0));
    assert_eq!(*handler.errors.lock(), vec!["InvalidLength"]);
    assert_eq!(handler.messages.load(Ordering::SeqCst), 0);

    stop_server(&server);
}

#[test]
fn oversized_length_is_rejected_without_waiting_for_the_body() {
    let base = LoopHandle::spawn("codec-base");
    let handler = Arc::new(ErrorCounter::default());
    let server = start_server(&base, MessageCodec::new(registry(), handler.clone()));

    let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
    let mut bytes = (MAX_MESSAGE_LEN as i32 + 1).to_be_bytes().to_vec();
    bytes.extend_from_slice(&[0xAB; 64]);
    stream.write_all(&bytes).unwrap();

    assert_closed_by_server(&mut stream);
    assert!(wait_until(Duration::from_secs(5), || server.connection_count() == 0));
    assert_eq!(*handler.errors.lock(), vec!["InvalidLength"]);
    assert_eq!(handler.messages.load(Ordering::SeqCst), 0);

    stop_server(&server);
}

#[test]
fn unknown_type_is_reported_and_closes() {
    let base = LoopHandle::spawn("codec-base");
    let handler = Arc::new(ErrorCounter::default());
    let mut only_requests = MessageRegistry::new();
    only_requests.register::<EchoRequest>();
    let server = start_server(&base, MessageCodec::new(only_requests, handler.clone()));

    let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
    let pool = PiecePool::new();
    let mut bytes = encode_frame(&EchoResponse { text: "x".into() }, &pool)
        .unwrap()
        .to_vec();
    bytes.extend(encode_frame(&EchoRequest { text: "y".into() }, &pool).unwrap().to_vec());
    stream.write_all(&bytes).unwrap();

    assert_closed_by_server(&mut stream);
    assert!(wait_until(Duration::from_secs(5), || server.connection_count() == 0));
    // processing stops at the first bad frame
    assert_eq!(*handler.errors.lock(), vec!["UnknownMessageType"]);
    assert_eq!(handler.messages.load(Ordering::SeqCst), 0);

    stop_server(&server);
}
