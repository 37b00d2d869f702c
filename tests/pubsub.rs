mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{wait_for, MockServer};
use weft::{Error, HeaderMap, Options, SubscribeOptions};

const WAIT: Duration = Duration::from_secs(2);

#[test]
fn basic_pub_sub() {
    let server = MockServer::start();
    let nc = weft::connect(&server.url()).unwrap();

    let sub = nc.subscribe("foo").unwrap();
    nc.publish("foo", "hi").unwrap();

    let msg = sub.next_msg(WAIT).unwrap();
    assert_eq!(msg.subject, "foo");
    assert_eq!(msg.payload, b"hi");
    assert!(msg.reply.is_none());

    nc.close();
}

#[test]
fn binary_payload_round_trip() {
    let server = MockServer::start();
    let nc = weft::connect(&server.url()).unwrap();

    let sub = nc.subscribe("bin").unwrap();
    // Payload bytes that look like protocol frames must pass through.
    let payload = b"PING\r\nMSG x 1 3\r\n\x00\x01\x02".to_vec();
    nc.publish("bin", &payload).unwrap();

    let msg = sub.next_msg(WAIT).unwrap();
    assert_eq!(msg.payload, payload);
    nc.close();
}

#[test]
fn headers_round_trip() {
    let server = MockServer::start();
    let nc = weft::connect(&server.url()).unwrap();

    let sub = nc.subscribe("hdr").unwrap();
    let mut headers = HeaderMap::new();
    headers.append("My-Key1", "value1");
    headers.append("My-Key2", "value2");
    headers.append("My-Key1", "value3");
    nc.publish_with_headers("hdr", &headers, "body").unwrap();

    let msg = sub.next_msg(WAIT).unwrap();
    let got = msg.headers.as_ref().unwrap();
    assert_eq!(got.get("My-Key1"), Some("value1"));
    assert_eq!(got.values("My-Key1"), &["value1", "value3"]);
    assert_eq!(got.get("My-Key2"), Some("value2"));
    assert_eq!(got.get("missing"), None);
    assert_eq!(msg.payload, b"body");
    nc.close();
}

#[test]
fn wildcard_subscription() {
    let server = MockServer::start();
    let nc = weft::connect(&server.url()).unwrap();

    let sub = nc.subscribe("events.>").unwrap();
    nc.publish("events.user.created", "e1").unwrap();
    nc.publish("events.user.deleted", "e2").unwrap();
    nc.publish("other.subject", "nope").unwrap();

    assert_eq!(sub.next_msg(WAIT).unwrap().payload, b"e1");
    assert_eq!(sub.next_msg(WAIT).unwrap().payload, b"e2");
    assert!(matches!(
        sub.next_msg(Duration::from_millis(100)),
        Err(Error::Timeout)
    ));
    nc.close();
}

#[test]
fn request_reply() {
    let server = MockServer::start();
    let nc = weft::connect(&server.url()).unwrap();

    let _svc = nc
        .subscribe_handler("svc.echo", |msg| {
            msg.respond(msg.payload.clone()).unwrap();
        })
        .unwrap();

    let reply = nc.request("svc.echo", "ping!", WAIT).unwrap();
    assert_eq!(reply.payload, b"ping!");
    nc.close();
}

#[test]
fn request_no_responders() {
    let server = MockServer::start();
    let nc = weft::connect(&server.url()).unwrap();

    let err = nc.request("nobody.home", "hello", WAIT).unwrap_err();
    assert!(matches!(err, Error::NoResponders), "got {err:?}");
    nc.close();
}

#[test]
fn queue_group_fan_out() {
    let server = MockServer::start();
    let nc = weft::connect(&server.url()).unwrap();

    let subs: Vec<_> = (0..3)
        .map(|_| nc.queue_subscribe("work", "w").unwrap())
        .collect();
    // Make sure every SUB reached the broker before publishing.
    nc.flush().unwrap();

    for i in 0..300 {
        nc.publish("work", format!("job-{i}")).unwrap();
    }

    let mut seen = HashSet::new();
    let mut counts = vec![0usize; 3];
    for (i, sub) in subs.iter().enumerate() {
        loop {
            match sub.next_msg(Duration::from_millis(300)) {
                Ok(msg) => {
                    assert!(
                        seen.insert(msg.payload.clone()),
                        "message delivered twice"
                    );
                    counts[i] += 1;
                }
                Err(Error::Timeout) => break,
                Err(err) => panic!("unexpected error: {err:?}"),
            }
        }
    }
    assert_eq!(seen.len(), 300, "every message delivered exactly once");
    for (i, count) in counts.iter().enumerate() {
        assert!(*count > 0, "subscriber {i} starved");
    }
    nc.close();
}

#[test]
fn slow_consumer_drops_and_reports_once() {
    let server = MockServer::start();
    let errors = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&errors);
    let nc = Options::new()
        .server(&server.url())
        .error_callback(move |_conn, sub, err| {
            if matches!(err, Error::SlowConsumer) {
                assert!(sub.is_some());
                counter.fetch_add(1, Ordering::SeqCst);
            }
        })
        .connect()
        .unwrap();

    let sub = nc
        .subscribe_with(
            "firehose",
            SubscribeOptions::new().pending_limits(10, 1 << 20).unwrap(),
        )
        .unwrap();
    nc.flush().unwrap();

    for i in 0..20 {
        nc.publish("firehose", format!("m{i}")).unwrap();
    }

    assert!(wait_for(WAIT, || sub.dropped() >= 10), "drops never counted");
    assert_eq!(sub.dropped(), 10);
    assert_eq!(sub.pending().0, 10);
    assert!(wait_for(WAIT, || errors.load(Ordering::SeqCst) == 1));

    // The subscription stays usable: drain the queue, then receive new
    // traffic again.
    for _ in 0..10 {
        sub.next_msg(WAIT).unwrap();
    }
    nc.publish("firehose", "after").unwrap();
    assert_eq!(sub.next_msg(WAIT).unwrap().payload, b"after");
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    nc.close();
}

#[test]
fn auto_unsubscribe_limits_deliveries() {
    let server = MockServer::start();
    let nc = weft::connect(&server.url()).unwrap();

    let sub = nc.subscribe("capped").unwrap();
    sub.auto_unsubscribe(2).unwrap();
    nc.flush().unwrap();

    for i in 0..5 {
        nc.publish("capped", format!("{i}")).unwrap();
    }

    assert_eq!(sub.next_msg(WAIT).unwrap().payload, b"0");
    assert_eq!(sub.next_msg(WAIT).unwrap().payload, b"1");
    // The third receive fails: interest was removed at the limit.
    assert!(sub.next_msg(Duration::from_millis(200)).is_err());
    assert!(!sub.is_valid());
    nc.close();
}

#[test]
fn drain_delivers_queued_then_closes() {
    let server = MockServer::start();
    let nc = weft::connect(&server.url()).unwrap();

    let received = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));
    let r = Arc::clone(&received);
    let d = Arc::clone(&done);
    let sub = nc
        .subscribe_handler_with(
            "drainme",
            SubscribeOptions::new().on_complete(move || {
                d.fetch_add(1, Ordering::SeqCst);
            }),
            move |_msg| {
                r.fetch_add(1, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
            },
        )
        .unwrap();
    nc.flush().unwrap();

    for _ in 0..10 {
        nc.publish("drainme", "x").unwrap();
    }
    // Let the messages reach the subscription queue before draining.
    assert!(wait_for(WAIT, || received.load(Ordering::SeqCst) >= 1));

    sub.drain().unwrap();
    sub.wait_for_drain_completion(WAIT).unwrap();
    assert!(!sub.is_valid());
    assert!(wait_for(WAIT, || done.load(Ordering::SeqCst) == 1));

    // Everything queued ahead of the drain marker was delivered.
    let delivered = received.load(Ordering::SeqCst);
    assert!(delivered >= 1, "drain discarded queued messages");
    nc.close();
}

#[test]
fn callback_subscription_delivers_in_order() {
    let server = MockServer::start();
    let nc = weft::connect(&server.url()).unwrap();

    let seen: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = nc
        .subscribe_handler("ordered", move |msg| {
            let n: u32 = std::str::from_utf8(&msg.payload).unwrap().parse().unwrap();
            sink.lock().unwrap().push(n);
        })
        .unwrap();
    nc.flush().unwrap();

    for i in 0..200u32 {
        nc.publish("ordered", i.to_string()).unwrap();
    }

    assert!(wait_for(WAIT, || seen.lock().unwrap().len() == 200));
    let seen = seen.lock().unwrap();
    assert_eq!(*seen, (0..200).collect::<Vec<_>>(), "delivery out of order");
    nc.close();
}

#[test]
fn unsubscribe_stops_delivery() {
    let server = MockServer::start();
    let nc = weft::connect(&server.url()).unwrap();

    let sub = nc.subscribe("once").unwrap();
    nc.flush().unwrap();
    nc.publish("once", "1").unwrap();
    assert_eq!(sub.next_msg(WAIT).unwrap().payload, b"1");

    sub.unsubscribe().unwrap();
    assert!(!sub.is_valid());
    assert!(sub.next_msg(Duration::from_millis(100)).is_err());
    nc.close();
}

#[test]
fn close_invalidates_subscriptions() {
    let server = MockServer::start();
    let nc = weft::connect(&server.url()).unwrap();
    let sub = nc.subscribe("x").unwrap();
    nc.close();
    assert!(nc.is_closed());
    assert!(matches!(
        sub.next_msg(Duration::from_millis(200)),
        Err(Error::ConnectionClosed)
    ));
    assert!(matches!(
        nc.publish("x", "y"),
        Err(Error::ConnectionClosed)
    ));
}
