// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! End-to-end: FramedClient driven by the reactor against a scripted peer.

use std::cell::{Cell, RefCell};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use brokerloop::codec::FrameCodec;
use brokerloop::framed::{decode_request, encode_response};
use brokerloop::types::{method, CONNECTION_FORCED};
use brokerloop::{
    wait_for, BrokerConfig, BrokerError, ConsumeOptions, Dispatcher, FramedClient, Operation,
    QueueOptions, Reactor, Request, Response, Scope, Session,
};
use serde_json::{json, Value};

const STEP: Duration = Duration::from_millis(20);
const DEADLINE: Duration = Duration::from_secs(5);

/// Blocking peer speaking the same envelope.
struct Peer {
    stream: TcpStream,
    codec: FrameCodec,
}

impl Peer {
    fn accept(listener: &TcpListener) -> Self {
        let (stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(DEADLINE)).unwrap();
        Self {
            stream,
            codec: FrameCodec::new(1024 * 1024),
        }
    }

    fn recv(&mut self) -> Request {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.codec.next_frame().unwrap() {
                return decode_request(&frame).unwrap();
            }
            let n = self.stream.read(&mut buf).unwrap();
            assert!(n > 0, "client closed early");
            self.codec.feed(&buf[..n]);
        }
    }

    fn send(&mut self, response: Response) {
        let payload = encode_response(&response).unwrap();
        let mut frame = Vec::new();
        FrameCodec::encode_into(&payload, &mut frame).unwrap();
        self.stream.write_all(&frame).unwrap();
    }
}

fn listen() -> (TcpListener, BrokerConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = BrokerConfig::with_url(format!("amqp://127.0.0.1:{}/", port));
    (listener, config)
}

#[test]
fn test_subscription_lifecycle_over_tcp() {
    let (listener, config) = listen();

    let peer = thread::spawn(move || {
        let mut peer = Peer::accept(&listener);

        let declare = peer.recv();
        assert!(matches!(declare.operation, Operation::DeclareQueue(_)));
        peer.send(Response::ok(declare.ticket, method::QUEUE_DECLARE_OK, json!({"queue": "q1"})));

        let consume = peer.recv();
        assert_eq!(consume.operation.method_name(), method::BASIC_CONSUME);
        peer.send(Response::ok(consume.ticket, method::BASIC_CONSUME_OK, Value::Null));
        peer.send(Response::delivery(consume.ticket, json!({"body": "m1"})));
        peer.send(Response::delivery(consume.ticket, json!({"body": "m2"})));

        let cancel = peer.recv();
        assert_eq!(
            cancel.operation,
            Operation::Cancel {
                consumer: consume.ticket
            }
        );
        peer.send(Response::ok(cancel.ticket, method::BASIC_CANCEL_OK, Value::Null));
        // Dropping the stream closes the connection
    });

    let reactor = Reactor::new().unwrap();
    let client = FramedClient::connect(&config).unwrap();
    let dispatcher = Dispatcher::attach(&reactor, Box::new(client)).unwrap();

    let closed = Rc::new(Cell::new(false));
    let closed_in = Rc::clone(&closed);
    dispatcher
        .borrow_mut()
        .set_close_hook(move |_| closed_in.set(true));

    let queue = Rc::new(RefCell::new(String::new()));
    let queue_in = Rc::clone(&queue);
    let declared = dispatcher
        .borrow_mut()
        .declare_queue(QueueOptions::auto_delete(), Scope::Detached, move |_, payload| {
            *queue_in.borrow_mut() = payload["queue"].as_str().unwrap_or_default().to_string();
            Ok(())
        })
        .unwrap();
    wait_for(&reactor, &dispatcher, declared, DEADLINE).unwrap();
    assert_eq!(*queue.borrow(), "q1");

    let session = Session::new();
    let bodies = Rc::new(RefCell::new(Vec::new()));
    let bodies_in = Rc::clone(&bodies);
    let subscription = session
        .subscribe(
            &mut dispatcher.borrow_mut(),
            "q1",
            ConsumeOptions::default(),
            move |_, payload| {
                bodies_in.borrow_mut().push(payload["body"].clone());
                Ok(())
            },
        )
        .unwrap();

    let deadline = Instant::now() + DEADLINE;
    assert!(reactor
        .run_until(STEP, deadline, || bodies.borrow().len() == 2)
        .unwrap());
    assert_eq!(*bodies.borrow(), vec![json!("m1"), json!("m2")]);

    // Request over: the session cancels its subscription
    session.finish(&mut dispatcher.borrow_mut()).unwrap();
    assert!(reactor
        .run_until(STEP, deadline, || !dispatcher.borrow().is_pending(subscription))
        .unwrap());

    assert!(reactor.run_until(STEP, deadline, || closed.get()).unwrap());
    let d = dispatcher.borrow();
    assert!(d.is_closed());
    assert_eq!(d.stats().delivered, 3);
    assert_eq!(d.stats().protocol_violations, 0);

    peer.join().unwrap();
}

#[test]
fn test_oversized_frame_fails_pending_operations() {
    let (listener, mut config) = listen();
    config.max_frame_size = 64;

    let peer = thread::spawn(move || {
        let mut peer = Peer::accept(&listener);
        let declare = peer.recv();
        let big = "x".repeat(256);
        peer.send(Response::ok(declare.ticket, method::EXCHANGE_DECLARE_OK, json!({ "pad": big })));
        // Hold the socket until the client gives up on it
        let mut buf = [0u8; 16];
        let _ = peer.stream.read(&mut buf);
    });

    let reactor = Reactor::new().unwrap();
    let client = FramedClient::connect(&config).unwrap();
    let dispatcher = Dispatcher::attach(&reactor, Box::new(client)).unwrap();

    let declared = dispatcher
        .borrow_mut()
        .declare_exchange("test", brokerloop::ExchangeKind::Fanout, Scope::Detached, |_, _| Ok(()))
        .unwrap();

    let err = wait_for(&reactor, &dispatcher, declared, DEADLINE).unwrap_err();
    match err {
        BrokerError::Remote { ticket, exception, .. } => {
            assert_eq!(ticket, declared);
            assert_eq!(exception.code, CONNECTION_FORCED);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(dispatcher.borrow().is_closed());

    peer.join().unwrap();
}
