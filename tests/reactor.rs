//! End-to-end event loop tests against a scripted TCP peer.

use quiver::{
    Close, ConnectionOptions, Container, Context, Decoded, Endpoint, Frame, FrameCodec, Handler,
    Open, Performative, ReconnectOptions, Result, TcpTransport,
};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc::{channel, Sender};
use std::thread;
use std::time::Duration;

const EMPTY: u8 = 0;
const OPEN: u8 = 1;
const CLOSE: u8 = 2;

/// One byte per frame. The scripted peer only ever exchanges Open, Close,
/// and heartbeat frames, so nothing more is needed.
struct ByteCodec;

impl FrameCodec for ByteCodec {
    fn decode(&self, buf: &[u8]) -> Result<Decoded> {
        let byte = match buf.first() {
            Some(byte) => *byte,
            None => return Ok(Decoded::NeedMoreData { needed: Some(1) }),
        };
        let frame = match byte {
            EMPTY => Frame::Empty,
            OPEN => Frame::amqp(
                0,
                Performative::Open(Open {
                    container_id: "peer".to_string(),
                    hostname: None,
                    max_frame_size: u32::max_value(),
                    channel_max: u16::max_value(),
                    idle_timeout_ms: 0,
                    properties: Vec::new(),
                }),
            ),
            CLOSE => Frame::amqp(0, Performative::Close(Close::default())),
            other => panic!("unknown test frame {}", other),
        };
        Ok(Decoded::Frame { frame, consumed: 1 })
    }

    fn encode(&self, frame: &Frame, buf: &mut Vec<u8>) -> Result<()> {
        let byte = match frame {
            Frame::Empty => EMPTY,
            Frame::Amqp {
                performative: Performative::Open(_),
                ..
            } => OPEN,
            Frame::Amqp {
                performative: Performative::Close(_),
                ..
            } => CLOSE,
            other => panic!("unexpected frame {:?}", other),
        };
        buf.push(byte);
        Ok(())
    }
}

struct Notify {
    opened: Sender<()>,
}

impl Handler for Notify {
    fn on_connection_open(&mut self, _ctx: &mut Context) {
        self.opened.send(()).unwrap();
    }
}

/// Accept one connection and play a full open/close exchange.
fn serve_once(listener: &TcpListener) {
    let (mut socket, _) = listener.accept().unwrap();
    let mut byte = [0u8; 1];
    socket.read_exact(&mut byte).unwrap();
    assert_eq!(byte[0], OPEN);
    socket.write_all(&[OPEN]).unwrap();
    socket.read_exact(&mut byte).unwrap();
    assert_eq!(byte[0], CLOSE);
    socket.write_all(&[CLOSE]).unwrap();
}

/// Accept one connection, open it, then drop the socket mid-life.
fn serve_open_then_drop(listener: &TcpListener) {
    let (mut socket, _) = listener.accept().unwrap();
    let mut byte = [0u8; 1];
    socket.read_exact(&mut byte).unwrap();
    assert_eq!(byte[0], OPEN);
    socket.write_all(&[OPEN]).unwrap();
}

#[test]
fn orderly_close_over_tcp() {
    let _ = env_logger::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = thread::spawn(move || serve_once(&listener));

    let (opened_tx, opened_rx) = channel();
    let options =
        ConnectionOptions::new("test").endpoint(Endpoint::new("127.0.0.1", addr.port()));
    let container = Container::new(
        Notify { opened: opened_tx },
        TcpTransport::default(),
        ByteCodec,
        options,
    )
    .unwrap();
    let thread = container.spawn().unwrap();

    opened_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    thread.close().unwrap();
    peer.join().unwrap();
}

#[test]
fn panicking_task_does_not_kill_the_loop() {
    let _ = env_logger::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = thread::spawn(move || serve_once(&listener));

    let (opened_tx, opened_rx) = channel();
    let options =
        ConnectionOptions::new("test").endpoint(Endpoint::new("127.0.0.1", addr.port()));
    let container = Container::new(
        Notify { opened: opened_tx },
        TcpTransport::default(),
        ByteCodec,
        options,
    )
    .unwrap();
    let thread = container.spawn().unwrap();

    opened_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let handle = thread.handle();
    handle.submit(|_| panic!("task bug")).unwrap();
    // the loop survives the panic and still serves the close
    thread.close().unwrap();
    peer.join().unwrap();
}

#[test]
fn reconnects_after_socket_drop() {
    let _ = env_logger::try_init();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let peer = thread::spawn(move || {
        serve_open_then_drop(&listener);
        serve_once(&listener);
    });

    let (opened_tx, opened_rx) = channel();
    let options = ConnectionOptions::new("test")
        .endpoint(Endpoint::new("127.0.0.1", addr.port()))
        .reconnect(Some(
            ReconnectOptions::default().initial_delay(Duration::from_millis(10)),
        ));
    let container = Container::new(
        Notify { opened: opened_tx },
        TcpTransport::default(),
        ByteCodec,
        options,
    )
    .unwrap();
    let thread = container.spawn().unwrap();

    // once per generation
    opened_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    opened_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    thread.close().unwrap();
    peer.join().unwrap();
}
