//! End-to-end runtime behavior: boot, addressing, timers, replies,
//! broadcasts and shutdown.

mod common;

use common::{assert_quiet, result_text, wait_for, Event, TestHost};
use murmur_core::{
    buffer::Buffer,
    message::mtype,
    server::State,
    worker_id, BOOTSTRAP_ADDR,
};

#[test]
fn boot_and_exit() {
    let (host, rx) = TestHost::start(2, "boot-and-exit");
    let started = wait_for(&rx, |e| matches!(e, Event::Started { .. }));
    let Event::Started { id } = started else {
        unreachable!()
    };
    assert_eq!(id, BOOTSTRAP_ADDR);
    assert_eq!(worker_id(id), 1);

    host.command(BOOTSTRAP_ADDR, "exit 0");
    let code = host.join();
    assert_eq!(code, 0);
}

#[test]
fn unique_service_collision() {
    let (host, rx) = TestHost::start(2, "unique-collision");
    wait_for(&rx, |e| matches!(e, Event::Started { .. }));

    host.command(
        BOOTSTRAP_ADDR,
        r#"newservice {"type":"echo","name":"db","unique":true}"#,
    );
    let first = wait_for(&rx, |e| matches!(e, Event::Msg { mtype: t, .. } if *t == mtype::INTEGER));
    let Event::Msg { integer: db_id, session, .. } = first else {
        unreachable!()
    };
    assert!(db_id > 0, "first unique registration must succeed");
    assert!(session < 0, "creation replies arrive sign-flipped");

    host.command(
        BOOTSTRAP_ADDR,
        r#"newservice {"type":"echo","name":"db","unique":true}"#,
    );
    let second =
        wait_for(&rx, |e| matches!(e, Event::Msg { mtype: t, .. } if *t == mtype::INTEGER));
    let Event::Msg { integer, .. } = second else {
        unreachable!()
    };
    assert_eq!(integer, 0, "conflicting unique registration must yield 0");

    host.command(BOOTSTRAP_ADDR, "query db");
    let looked_up = wait_for(&rx, |e| matches!(e, Event::Result(_)));
    assert_eq!(result_text(&looked_up), &format!("id {db_id}"));

    assert_eq!(host.finish(), 0);
}

#[test]
fn dead_receiver_resolves_with_error() {
    let (host, rx) = TestHost::start(2, "dead-receiver");
    wait_for(&rx, |e| matches!(e, Event::Started { .. }));

    let dead = 0x0100_0099u32;
    host.command(BOOTSTRAP_ADDR, &format!("send {dead} 7 ping"));
    let reply = wait_for(&rx, |e| matches!(e, Event::Msg { mtype: t, .. } if *t == mtype::ERROR));
    let Event::Msg {
        sender,
        session,
        data,
        ..
    } = reply
    else {
        unreachable!()
    };
    assert_eq!(sender, dead);
    assert_eq!(session, -7);
    assert_eq!(
        String::from_utf8_lossy(&data),
        "Attempt call dead service [01000099]: ping."
    );

    assert_eq!(host.finish(), 0);
}

#[test]
fn out_of_range_worker_byte_is_refused() {
    let (host, rx) = TestHost::start(2, "out-of-range");
    wait_for(&rx, |e| matches!(e, Event::Started { .. }));

    // worker byte 9 does not exist: refused at the API edge, no delivery
    let bogus = 0x0900_0001u32;
    assert!(!host.server.send(
        BOOTSTRAP_ADDR,
        bogus,
        Buffer::from_slice(b"x"),
        1,
        mtype::LUA
    ));
    assert_eq!(host.finish(), 0);
}

#[test]
fn timer_fires_exactly_once() {
    let (host, rx) = TestHost::start(2, "timer-once");
    wait_for(&rx, |e| matches!(e, Event::Started { .. }));

    host.command(BOOTSTRAP_ADDR, "timeout 25");
    let armed = wait_for(&rx, |e| matches!(e, Event::Result(_)));
    let timerid: i64 = result_text(&armed)
        .strip_prefix("timer ")
        .unwrap()
        .parse()
        .unwrap();
    assert!(timerid > 0);

    let fired = wait_for(&rx, |e| matches!(e, Event::Msg { mtype: t, .. } if *t == mtype::TIMER));
    let Event::Msg {
        sender,
        session,
        integer,
        ..
    } = fired
    else {
        unreachable!()
    };
    assert_eq!(sender as i64, timerid);
    assert_eq!(session, -timerid);
    assert_eq!(integer, timerid);

    assert_quiet(&rx, 200, |e| {
        matches!(e, Event::Msg { mtype: t, .. } if *t == mtype::TIMER)
    });
    assert_eq!(host.finish(), 0);
}

#[test]
fn zero_interval_timer_fires_immediately() {
    let (host, rx) = TestHost::start(1, "timer-zero");
    wait_for(&rx, |e| matches!(e, Event::Started { .. }));

    host.command(BOOTSTRAP_ADDR, "timeout 0");
    wait_for(&rx, |e| matches!(e, Event::Msg { mtype: t, .. } if *t == mtype::TIMER));
    assert_eq!(host.finish(), 0);
}

#[test]
fn call_resolves_with_positive_session() {
    let (host, rx) = TestHost::start(2, "call-roundtrip");
    wait_for(&rx, |e| matches!(e, Event::Started { .. }));

    host.command(BOOTSTRAP_ADDR, r#"newservice {"type":"echo","name":"peer"}"#);
    let created =
        wait_for(&rx, |e| matches!(e, Event::Msg { mtype: t, .. } if *t == mtype::INTEGER));
    let Event::Msg { integer: peer, .. } = created else {
        unreachable!()
    };
    assert!(peer > 0);

    host.command(BOOTSTRAP_ADDR, &format!("call {peer} hello"));
    let called = wait_for(&rx, |e| matches!(e, Event::Result(_)));
    let session: i64 = result_text(&called)
        .strip_prefix("session ")
        .unwrap()
        .parse()
        .unwrap();
    assert!(session > 0);

    let reply = wait_for(&rx, |e| matches!(e, Event::Msg { mtype: t, .. } if *t == mtype::LUA));
    let Event::Msg {
        sender,
        session: reply_session,
        data,
        ..
    } = reply
    else {
        unreachable!()
    };
    assert_eq!(sender, peer as u32);
    assert_eq!(reply_session, session, "reply resolves on the caller's positive session");
    assert_eq!(data, b"hello");

    assert_eq!(host.finish(), 0);
}

#[test]
fn system_broadcast_reaches_only_unique_services() {
    let (host, boot_rx) = TestHost::start(2, "broadcast-boot");
    wait_for(&boot_rx, |e| matches!(e, Event::Started { .. }));

    let a_rx = common::listen_for("broadcast-a");
    let b_rx = common::listen_for("broadcast-b");
    let u_rx = common::listen_for("broadcast-u");
    host.command(
        BOOTSTRAP_ADDR,
        r#"newservice {"type":"driver","name":"broadcast-a"}"#,
    );
    host.command(
        BOOTSTRAP_ADDR,
        r#"newservice {"type":"driver","name":"broadcast-b"}"#,
    );
    host.command(
        BOOTSTRAP_ADDR,
        r#"newservice {"type":"driver","name":"broadcast-u","unique":true}"#,
    );
    let a = wait_for(&a_rx, |e| matches!(e, Event::Started { .. }));
    let Event::Started { id: a_id } = a else {
        unreachable!()
    };
    wait_for(&b_rx, |e| matches!(e, Event::Started { .. }));
    wait_for(&u_rx, |e| matches!(e, Event::Started { .. }));

    let payload = Buffer::from_slice(b"_service_exit,name:a serviceid:00000000");
    host.server.broadcast(a_id, &payload, mtype::SYSTEM);

    let seen = wait_for(&u_rx, |e| {
        matches!(e, Event::Msg { mtype: t, .. } if *t == mtype::SYSTEM)
    });
    let Event::Msg { sender, .. } = seen else {
        unreachable!()
    };
    assert_eq!(sender, a_id);

    assert_quiet(&a_rx, 200, |e| {
        matches!(e, Event::Msg { mtype: t, .. } if *t == mtype::SYSTEM)
    });
    assert_quiet(&b_rx, 200, |e| {
        matches!(e, Event::Msg { mtype: t, .. } if *t == mtype::SYSTEM)
    });

    assert_eq!(host.finish(), 0);
}

#[test]
fn kill_announces_service_exit() {
    let (host, rx) = TestHost::start(1, "kill-exit");
    wait_for(&rx, |e| matches!(e, Event::Started { .. }));

    // the bootstrap driver is unique by address registration only; make a
    // unique listener to observe the SYSTEM obituary
    let w_rx = common::listen_for("kill-watcher");
    host.command(
        BOOTSTRAP_ADDR,
        r#"newservice {"type":"driver","name":"kill-watcher","unique":true}"#,
    );
    wait_for(&w_rx, |e| matches!(e, Event::Started { .. }));

    host.command(BOOTSTRAP_ADDR, r#"newservice {"type":"echo","name":"victim"}"#);
    let created =
        wait_for(&rx, |e| matches!(e, Event::Msg { mtype: t, .. } if *t == mtype::INTEGER));
    let Event::Msg { integer: victim, .. } = created else {
        unreachable!()
    };

    host.command(BOOTSTRAP_ADDR, &format!("kill {victim}"));
    let obituary = wait_for(&w_rx, |e| {
        matches!(e, Event::Msg { mtype: t, .. } if *t == mtype::SYSTEM)
    });
    let Event::Msg { sender, data, .. } = obituary else {
        unreachable!()
    };
    assert_eq!(sender, victim as u32);
    let text = String::from_utf8_lossy(&data).to_string();
    assert!(
        text.starts_with("_service_exit,name:victim serviceid:"),
        "unexpected obituary {text:?}"
    );

    assert_eq!(host.finish(), 0);
}

#[test]
fn queues_drain_at_steady_state() {
    let (host, rx) = TestHost::start(2, "steady-state");
    wait_for(&rx, |e| matches!(e, Event::Started { .. }));

    host.command(BOOTSTRAP_ADDR, r#"newservice {"type":"echo","name":"drainpeer"}"#);
    let created =
        wait_for(&rx, |e| matches!(e, Event::Msg { mtype: t, .. } if *t == mtype::INTEGER));
    let Event::Msg { integer: peer, .. } = created else {
        unreachable!()
    };

    for _ in 0..64 {
        host.command(BOOTSTRAP_ADDR, &format!("call {peer} burst"));
    }
    let mut replies = 0;
    while replies < 64 {
        let e = wait_for(&rx, |e| {
            matches!(e, Event::Msg { mtype: t, .. } if *t == mtype::LUA)
                || matches!(e, Event::Result(_))
        });
        if matches!(e, Event::Msg { .. }) {
            replies += 1;
        }
    }

    // with no traffic in flight the swap queues must empty promptly
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
    loop {
        let info = host.server.info();
        let parsed: serde_json::Value = serde_json::from_str(&info).unwrap();
        let total: u64 = parsed
            .as_array()
            .unwrap()
            .iter()
            .skip(1)
            .map(|w| w["mqsize"].as_u64().unwrap())
            .sum();
        if total == 0 {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "queues did not drain: {info}"
        );
        std::thread::sleep(std::time::Duration::from_millis(10));
    }

    assert_eq!(host.finish(), 0);
}

#[test]
fn scan_services_reports_json() {
    let (host, rx) = TestHost::start(1, "scan-services");
    wait_for(&rx, |e| matches!(e, Event::Started { .. }));

    host.command(BOOTSTRAP_ADDR, r#"newservice {"type":"echo","name":"scanned"}"#);
    wait_for(&rx, |e| matches!(e, Event::Msg { mtype: t, .. } if *t == mtype::INTEGER));

    // drive the scan from outside, like an operator console would
    let ok = host.server.scan_services(BOOTSTRAP_ADDR, 1, 99);
    assert!(ok);
    let report = wait_for(&rx, |e| matches!(e, Event::Msg { mtype: t, .. } if *t == mtype::TEXT));
    let Event::Msg { session, data, .. } = report else {
        unreachable!()
    };
    assert_eq!(session, -99);
    let parsed: serde_json::Value = serde_json::from_str(&String::from_utf8_lossy(&data)).unwrap();
    let names: Vec<&str> = parsed
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v["name"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"scanned"));

    assert_eq!(host.finish(), 0);
}

#[test]
fn server_state_follows_lifecycle() {
    let (host, rx) = TestHost::start(1, "state-lifecycle");
    wait_for(&rx, |e| matches!(e, Event::Started { .. }));
    assert_eq!(host.server.get_state(), State::Ready);

    host.command(BOOTSTRAP_ADDR, "exit 0");
    let code = host.join();
    assert_eq!(code, 0);
}
