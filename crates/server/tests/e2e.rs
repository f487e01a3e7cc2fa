use chrono::{Datelike, FixedOffset, TimeZone, Utc};
use proto::{
    peek_request_id, Notification, Op, Reader, Request, MAX_DATAGRAM, STATUS_ERROR,
    STATUS_SUCCESS,
};
use server::{Config, Semantic, Server};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use transport::Endpoint;

fn zone() -> FixedOffset {
    FixedOffset::east_opt(8 * 3600).unwrap()
}

fn config(semantic: Semantic) -> Config {
    let mut cfg = Config::new(0, semantic);
    cfg.workers = 4;
    cfg.zone = zone();
    cfg.data_dir = None;
    cfg
}

fn start(semantic: Semantic) -> (Server, SocketAddr) {
    let server = Server::start(config(semantic)).unwrap();
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), server.local_addr().port());
    (server, addr)
}

fn sock() -> Endpoint {
    let s = Endpoint::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    s.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    s
}

fn recv(sock: &Endpoint) -> Vec<u8> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let (n, _) = sock.recv(&mut buf).unwrap();
    buf.truncate(n);
    buf
}

fn rpc(sock: &Endpoint, server: SocketAddr, request: &Request, request_id: u32) -> Vec<u8> {
    sock.send(&request.encode(request_id), server).unwrap();
    let response = recv(sock);
    assert_eq!(peek_request_id(&response), Some(request_id));
    response
}

fn status(response: &[u8]) -> u8 {
    let mut r = Reader::new(response);
    r.get_u32().unwrap();
    r.get_u8().unwrap()
}

/// Today at `hour`:`min` local time, as protocol seconds.
fn today_at(hour: u32, min: u32) -> u32 {
    let today = Utc::now().with_timezone(&zone()).date_naive();
    let dt = zone()
        .with_ymd_and_hms(today.year(), today.month(), today.day(), hour, min, 0)
        .unwrap();
    u32::try_from(dt.timestamp()).unwrap()
}

#[test]
fn book_then_query_then_conflict() {
    let (server, addr) = start(Semantic::AtLeastOnce);
    let client = sock();

    let response = rpc(
        &client,
        addr,
        &Request::Book {
            facility: "Lab_101".into(),
            start: today_at(10, 0),
            end: today_at(11, 0),
        },
        1,
    );
    let mut r = Reader::new(&response);
    r.get_u32().unwrap();
    assert_eq!(r.get_u8().unwrap(), STATUS_SUCCESS);
    let booking_id = r.get_u32().unwrap();
    assert_eq!(booking_id, 1);

    // the booked hour is gone from today's availability
    let response = rpc(
        &client,
        addr,
        &Request::QueryAvailability {
            facility: "Lab_101".into(),
            days: vec![0],
        },
        2,
    );
    let mut r = Reader::new(&response);
    r.get_u32().unwrap();
    assert_eq!(r.get_u8().unwrap(), STATUS_SUCCESS);
    let count = r.get_u16().unwrap();
    assert_eq!(count, 8);
    let mut slots = Vec::new();
    for _ in 0..count {
        slots.push((r.get_u32().unwrap(), r.get_u32().unwrap()));
    }
    assert!(!slots.contains(&(today_at(10, 0), today_at(11, 0))));
    assert!(slots.contains(&(today_at(9, 0), today_at(10, 0))));
    assert!(slots.contains(&(today_at(17, 0), today_at(18, 0))));

    // an overlapping interval is refused
    let response = rpc(
        &client,
        addr,
        &Request::Book {
            facility: "Lab_101".into(),
            start: today_at(10, 30),
            end: today_at(11, 30),
        },
        3,
    );
    assert_eq!(status(&response), STATUS_ERROR);

    server.shutdown();
}

#[test]
fn at_most_once_replays_identical_bytes_without_rebooking() {
    let (server, addr) = start(Semantic::AtMostOnce);
    let client = sock();

    let datagram = Request::Book {
        facility: "Lab_102".into(),
        start: today_at(10, 0),
        end: today_at(11, 0),
    }
    .encode(42);

    client.send(&datagram, addr).unwrap();
    let first = recv(&client);
    client.send(&datagram, addr).unwrap();
    let second = recv(&client);

    assert_eq!(status(&first), STATUS_SUCCESS);
    assert_eq!(first, second);

    // exactly one booking was applied
    let response = rpc(
        &client,
        addr,
        &Request::QueryAvailability {
            facility: "Lab_102".into(),
            days: vec![0],
        },
        43,
    );
    let mut r = Reader::new(&response);
    r.get_u32().unwrap();
    r.get_u8().unwrap();
    assert_eq!(r.get_u16().unwrap(), 8);

    server.shutdown();
}

#[test]
fn at_least_once_reexecutes_duplicates() {
    let (server, addr) = start(Semantic::AtLeastOnce);
    let client = sock();

    let datagram = Request::Book {
        facility: "Lab_102".into(),
        start: today_at(14, 0),
        end: today_at(15, 0),
    }
    .encode(42);

    client.send(&datagram, addr).unwrap();
    let first = recv(&client);
    client.send(&datagram, addr).unwrap();
    let second = recv(&client);

    // the duplicate really ran again and hit the conflict check
    assert_eq!(status(&first), STATUS_SUCCESS);
    assert_eq!(status(&second), STATUS_ERROR);

    server.shutdown();
}

#[test]
fn monitors_receive_book_and_change_notifications() {
    let (server, addr) = start(Semantic::AtLeastOnce);
    let watcher = sock();
    let booker = sock();

    let response = rpc(
        &watcher,
        addr,
        &Request::Monitor {
            facility: "Auditorium".into(),
            duration_secs: 60,
        },
        1,
    );
    assert_eq!(status(&response), STATUS_SUCCESS);

    let response = rpc(
        &booker,
        addr,
        &Request::Book {
            facility: "Auditorium".into(),
            start: today_at(10, 0),
            end: today_at(11, 0),
        },
        2,
    );
    let mut r = Reader::new(&response);
    r.get_u32().unwrap();
    r.get_u8().unwrap();
    let booking_id = r.get_u32().unwrap();

    let note = Notification::decode(&recv(&watcher)).unwrap();
    assert_eq!(note.op, Op::Book);
    assert_eq!(note.booking_id, booking_id);
    assert_eq!(note.new_start, today_at(10, 0));
    assert_eq!(note.new_end, today_at(11, 0));
    // availability over seven days, with today's booked hour taken
    assert_eq!(note.slots.len(), 7 * 9 - 1);

    let response = rpc(
        &booker,
        addr,
        &Request::Change {
            booking_id,
            offset_minutes: 30,
        },
        3,
    );
    assert_eq!(status(&response), STATUS_SUCCESS);

    let note = Notification::decode(&recv(&watcher)).unwrap();
    assert_eq!(note.op, Op::Change);
    assert_eq!(note.old_start, today_at(10, 0));
    assert_eq!(note.old_end, today_at(11, 0));
    assert_eq!(note.new_start, today_at(10, 30));
    assert_eq!(note.new_end, today_at(11, 30));

    server.shutdown();
}

#[test]
fn expired_monitors_are_silent_and_pruned() {
    let (server, addr) = start(Semantic::AtLeastOnce);
    let watcher = sock();
    let booker = sock();

    let response = rpc(
        &watcher,
        addr,
        &Request::Monitor {
            facility: "Lab_101".into(),
            duration_secs: 1,
        },
        1,
    );
    assert_eq!(status(&response), STATUS_SUCCESS);

    std::thread::sleep(Duration::from_secs(2));

    let response = rpc(
        &booker,
        addr,
        &Request::Book {
            facility: "Lab_101".into(),
            start: today_at(9, 0),
            end: today_at(10, 0),
        },
        2,
    );
    assert_eq!(status(&response), STATUS_SUCCESS);

    watcher
        .set_read_timeout(Some(Duration::from_millis(300)))
        .unwrap();
    let mut buf = vec![0u8; MAX_DATAGRAM];
    assert!(watcher.recv(&mut buf).is_err());

    server.shutdown();
}

#[test]
fn monitoring_an_unknown_facility_fails() {
    let (server, addr) = start(Semantic::AtLeastOnce);
    let client = sock();

    let response = rpc(
        &client,
        addr,
        &Request::Monitor {
            facility: "Basement".into(),
            duration_secs: 60,
        },
        1,
    );
    assert_eq!(status(&response), STATUS_ERROR);

    server.shutdown();
}

static DIR_SEQ: AtomicU32 = AtomicU32::new(0);

fn scratch_dir() -> PathBuf {
    std::env::temp_dir().join(format!(
        "booking-e2e-{}-{}",
        std::process::id(),
        DIR_SEQ.fetch_add(1, Ordering::Relaxed)
    ))
}

#[test]
fn bookings_survive_a_restart() {
    let dir = scratch_dir();

    let mut cfg = config(Semantic::AtLeastOnce);
    cfg.data_dir = Some(dir.clone());
    let server = Server::start(cfg).unwrap();
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), server.local_addr().port());
    let client = sock();

    let response = rpc(
        &client,
        addr,
        &Request::Book {
            facility: "Lab_101".into(),
            start: today_at(10, 0),
            end: today_at(11, 0),
        },
        1,
    );
    assert_eq!(status(&response), STATUS_SUCCESS);
    server.shutdown();

    let mut cfg = config(Semantic::AtLeastOnce);
    cfg.data_dir = Some(dir.clone());
    let server = Server::start(cfg).unwrap();
    let addr = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), server.local_addr().port());

    let response = rpc(
        &client,
        addr,
        &Request::LastBookingEnd {
            facility: "Lab_101".into(),
        },
        2,
    );
    let mut r = Reader::new(&response);
    r.get_u32().unwrap();
    assert_eq!(r.get_u8().unwrap(), STATUS_SUCCESS);
    assert_eq!(r.get_u32().unwrap(), today_at(11, 0));

    // new ids continue after the persisted ones
    let response = rpc(
        &client,
        addr,
        &Request::Book {
            facility: "Lab_101".into(),
            start: today_at(14, 0),
            end: today_at(15, 0),
        },
        3,
    );
    let mut r = Reader::new(&response);
    r.get_u32().unwrap();
    assert_eq!(r.get_u8().unwrap(), STATUS_SUCCESS);
    assert_eq!(r.get_u32().unwrap(), 2);

    server.shutdown();
    std::fs::remove_dir_all(&dir).unwrap();
}
