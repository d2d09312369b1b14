//! Integration tests for the socket API against a scripted modem.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use sim7020_udp::mock::{MockHandle, MockModem, MockReply};
use sim7020_udp::{Driver, DriverConfig, DriverError, Endpoint, SocketFlags};

const NO_WAIT: Option<Duration> = Some(Duration::ZERO);

fn test_driver(config: DriverConfig) -> (Driver, MockHandle) {
    let (modem, handle) = MockModem::new();
    let driver = Driver::new(config, Box::new(modem)).expect("driver should build");
    (driver, handle)
}

fn remote() -> Endpoint {
    Endpoint::from_ipv4(Ipv4Addr::new(192, 0, 2, 10), 1883)
}

// ============================================================================
// Delivery
// ============================================================================

#[test]
fn test_datagram_reaches_only_its_socket() {
    let (driver, modem) = test_driver(DriverConfig::default());
    let a = driver.create_socket(None, Some(remote()), SocketFlags::NONE).unwrap();
    let b = driver.create_socket(None, Some(remote()), SocketFlags::NONE).unwrap();
    assert_eq!(a.id().modem_id(), 0);
    assert_eq!(b.id().modem_id(), 1);

    modem.inject_urc("+CSONMI: 0,10,48656c6c6f");
    assert_eq!(driver.dispatch_pending(Duration::from_millis(100)).unwrap(), 1);

    let mut buf = [0u8; 64];
    let (n, source) = a.recv(&mut buf, NO_WAIT).unwrap();
    assert_eq!(&buf[..n], b"Hello");
    assert_eq!(source, remote());

    assert!(matches!(b.recv(&mut buf, NO_WAIT), Err(DriverError::WouldBlock)));
}

#[test]
fn test_datagrams_arrive_in_order() {
    let (driver, modem) = test_driver(DriverConfig {
        mailbox_capacity: 4,
        ..DriverConfig::default()
    });
    let socket = driver.create_socket(None, Some(remote()), SocketFlags::NONE).unwrap();

    modem.inject_urc("+CSONMI: 0,2,31");
    modem.inject_urc("+CSONMI: 0,2,32");
    modem.inject_urc("+CSONMI: 0,2,33");
    driver.dispatch_pending(Duration::from_millis(100)).unwrap();

    let mut buf = [0u8; 4];
    for expected in [b"1", b"2", b"3"] {
        let (n, _) = socket.recv(&mut buf, NO_WAIT).unwrap();
        assert_eq!(&buf[..n], expected);
    }
}

#[test]
fn test_notification_during_command_is_delivered() {
    let (driver, modem) = test_driver(DriverConfig::default());
    let socket = driver.create_socket(None, Some(remote()), SocketFlags::NONE).unwrap();

    // Arrives while AT+CSOSEND is in progress, before any dispatch cycle.
    modem.inject_urc("+CSONMI: 0,4,6f6b");
    socket.send(b"ping", None).unwrap();

    let mut buf = [0u8; 8];
    let (n, _) = socket.recv(&mut buf, NO_WAIT).unwrap();
    assert_eq!(&buf[..n], b"ok");
}

#[test]
fn test_out_of_range_notification_is_ignored() {
    let (driver, modem) = test_driver(DriverConfig::default());
    let socket = driver.create_socket(None, Some(remote()), SocketFlags::NONE).unwrap();

    modem.inject_urc("+CSONMI: 9,2,41");
    modem.inject_urc("+CSONMI: 0,3,414");
    driver.dispatch_pending(Duration::from_millis(50)).unwrap();

    let mut buf = [0u8; 8];
    assert!(matches!(socket.recv(&mut buf, NO_WAIT), Err(DriverError::WouldBlock)));
}

#[test]
fn test_full_mailbox_drops_newest() {
    let (driver, modem) = test_driver(DriverConfig::default());
    let socket = driver.create_socket(None, Some(remote()), SocketFlags::NONE).unwrap();

    modem.inject_urc("+CSONMI: 0,2,41");
    modem.inject_urc("+CSONMI: 0,2,42");
    modem.inject_urc("+CSONMI: 0,2,43");
    driver.dispatch_pending(Duration::from_millis(50)).unwrap();

    let mut buf = [0u8; 4];
    assert_eq!(socket.recv(&mut buf, NO_WAIT).unwrap().0, 1);
    assert_eq!(buf[0], b'A');
    socket.recv(&mut buf, NO_WAIT).unwrap();
    assert_eq!(buf[0], b'B');
    assert!(matches!(socket.recv(&mut buf, NO_WAIT), Err(DriverError::WouldBlock)));
}

// ============================================================================
// Receive Timeouts
// ============================================================================

#[test]
fn test_zero_timeout_does_not_block() {
    let (driver, _modem) = test_driver(DriverConfig::default());
    let socket = driver.create_socket(None, None, SocketFlags::NONE).unwrap();

    let started = Instant::now();
    let mut buf = [0u8; 8];
    assert!(matches!(socket.recv(&mut buf, NO_WAIT), Err(DriverError::WouldBlock)));
    assert!(started.elapsed() < Duration::from_millis(100));
}

#[test]
fn test_nonblock_flag_applies_without_timeout() {
    let (driver, _modem) = test_driver(DriverConfig::default());
    let socket = driver.create_socket(None, None, SocketFlags::NONBLOCK).unwrap();

    let mut buf = [0u8; 8];
    assert!(matches!(socket.recv(&mut buf, None), Err(DriverError::WouldBlock)));
}

#[test]
fn test_finite_timeout_elapses() {
    let (driver, _modem) = test_driver(DriverConfig::default());
    let socket = driver.create_socket(None, None, SocketFlags::NONE).unwrap();

    let started = Instant::now();
    let mut buf = [0u8; 8];
    let result = socket.recv(&mut buf, Some(Duration::from_millis(150)));

    assert!(matches!(result, Err(DriverError::TimedOut)));
    assert!(started.elapsed() >= Duration::from_millis(150));
}

#[test]
fn test_data_before_timeout_wins() {
    let (driver, modem) = test_driver(DriverConfig::default());
    let driver = Arc::new(driver);
    let socket = driver.create_socket(None, Some(remote()), SocketFlags::NONE).unwrap();

    let dispatcher = {
        let driver = Arc::clone(&driver);
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            modem.inject_urc("+CSONMI: 0,2,5a");
            driver.dispatch_pending(Duration::from_millis(200)).unwrap()
        })
    };

    let mut buf = [0u8; 8];
    let (n, _) = socket.recv(&mut buf, Some(Duration::from_secs(5))).unwrap();
    assert_eq!(&buf[..n], b"Z");
    assert_eq!(dispatcher.join().unwrap(), 1);
}

#[test]
fn test_small_buffer_consumes_datagram() {
    let (driver, modem) = test_driver(DriverConfig::default());
    let socket = driver.create_socket(None, Some(remote()), SocketFlags::NONE).unwrap();

    modem.inject_urc("+CSONMI: 0,10,48656c6c6f");
    driver.dispatch_pending(Duration::from_millis(50)).unwrap();

    let mut small = [0u8; 2];
    assert!(matches!(
        socket.recv(&mut small, NO_WAIT),
        Err(DriverError::BufferTooSmall { needed: 5, capacity: 2 })
    ));
    let mut buf = [0u8; 8];
    assert!(matches!(socket.recv(&mut buf, NO_WAIT), Err(DriverError::WouldBlock)));
}

// ============================================================================
// Close
// ============================================================================

#[test]
fn test_close_twice_is_noop() {
    let (driver, modem) = test_driver(DriverConfig::default());
    let socket = driver.create_socket(None, None, SocketFlags::NONE).unwrap();

    socket.close().unwrap();
    socket.close().unwrap();
    drop(socket);

    assert_eq!(modem.count("AT+CSOCL="), 1);
    assert_eq!(driver.open_sockets(), 0);
}

#[test]
fn test_close_wakes_blocked_receiver() {
    let (driver, _modem) = test_driver(DriverConfig::default());
    let socket = Arc::new(driver.create_socket(None, None, SocketFlags::NONE).unwrap());

    let receiver = {
        let socket = Arc::clone(&socket);
        thread::spawn(move || {
            let mut buf = [0u8; 8];
            socket.recv(&mut buf, None)
        })
    };

    let deadline = Instant::now() + Duration::from_secs(5);
    while socket.pending_receivers() == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    socket.close().unwrap();

    let result = receiver.join().unwrap();
    assert!(matches!(result, Err(DriverError::Closed)));
}

#[test]
fn test_close_wakes_every_receiver() {
    let (driver, _modem) = test_driver(DriverConfig::default());
    let socket = Arc::new(driver.create_socket(None, None, SocketFlags::NONE).unwrap());

    let receivers: Vec<_> = (0..3)
        .map(|_| {
            let socket = Arc::clone(&socket);
            thread::spawn(move || {
                let mut buf = [0u8; 8];
                socket.recv(&mut buf, Some(Duration::from_secs(10)))
            })
        })
        .collect();

    let deadline = Instant::now() + Duration::from_secs(5);
    while socket.pending_receivers() < 3 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    socket.close().unwrap();

    for receiver in receivers {
        assert!(matches!(receiver.join().unwrap(), Err(DriverError::Closed)));
    }
}

#[test]
fn test_operations_after_close() {
    let (driver, _modem) = test_driver(DriverConfig::default());
    let socket = driver.create_socket(None, Some(remote()), SocketFlags::NONE).unwrap();
    socket.close().unwrap();

    let mut buf = [0u8; 8];
    assert!(matches!(socket.recv(&mut buf, NO_WAIT), Err(DriverError::Closed)));
    assert!(matches!(socket.send(b"x", None), Err(DriverError::Closed)));
}

#[test]
fn test_shutdown_closes_open_sockets() {
    let (driver, modem) = test_driver(DriverConfig::default());
    let socket = driver.create_socket(None, None, SocketFlags::NONE).unwrap();

    driver.shutdown().unwrap();

    assert!(socket.is_closed());
    assert_eq!(driver.open_sockets(), 0);
    drop(socket);
    // Invalidated sockets are not closed again on the modem.
    assert_eq!(modem.count("AT+CSOCL="), 0);
}

// ============================================================================
// Create / Connect / Send
// ============================================================================

#[test]
fn test_create_failure_releases_socket() {
    let (driver, modem) = test_driver(DriverConfig::default());
    let bad = Endpoint::from_ipv4(Ipv4Addr::new(192, 0, 2, 10), 0);

    let result = driver.create_socket(None, Some(bad), SocketFlags::NONE);
    assert!(matches!(result, Err(DriverError::InvalidArgument(_))));
    assert_eq!(modem.count("AT+CSOCL=0"), 1);
    assert_eq!(driver.open_sockets(), 0);
}

#[test]
fn test_out_of_sockets() {
    let (driver, modem) = test_driver(DriverConfig::default());
    let sockets: Vec<_> = (0..5)
        .map(|_| driver.create_socket(None, None, SocketFlags::NONE).unwrap())
        .collect();

    // The mock modem is out of ids too and answers ERROR.
    assert!(matches!(
        driver.create_socket(None, None, SocketFlags::NONE),
        Err(DriverError::Unavailable(_))
    ));

    modem.push("AT+CSOC=", MockReply::Info("+CSOC: 5".to_string()));
    assert!(matches!(
        driver.create_socket(None, None, SocketFlags::NONE),
        Err(DriverError::OutOfSockets)
    ));
    assert_eq!(sockets.len(), driver.open_sockets());
}

#[test]
fn test_local_and_remote_endpoints() {
    let (driver, _modem) = test_driver(DriverConfig::default());
    let local = Endpoint::from_ipv4(Ipv4Addr::UNSPECIFIED, 4000);
    let socket = driver.create_socket(Some(local), None, SocketFlags::NONE).unwrap();

    assert_eq!(socket.get_local().unwrap(), local);
    assert!(matches!(socket.get_remote(), Err(DriverError::NotConnected)));

    socket.connect(&remote()).unwrap();
    assert_eq!(socket.get_remote().unwrap(), remote());
}

#[test]
fn test_send_requires_remote() {
    let (driver, modem) = test_driver(DriverConfig::default());
    let socket = driver.create_socket(None, None, SocketFlags::NONE).unwrap();

    assert!(matches!(socket.send(b"x", None), Err(DriverError::NotConnected)));

    let other = Endpoint::from_ipv4(Ipv4Addr::new(198, 51, 100, 7), 5683);
    assert_eq!(socket.send(b"hi", Some(&other)).unwrap(), 2);
    assert_eq!(modem.count("AT+CSOCON=0,5683,198.51.100.7"), 1);
    assert_eq!(modem.count("AT+CSOSEND=0,4,6869"), 1);
    assert_eq!(socket.get_remote().unwrap(), other);
}

#[test]
fn test_oversized_send_is_truncated() {
    let (driver, modem) = test_driver(DriverConfig {
        max_send_len: 128,
        ..DriverConfig::default()
    });
    let socket = driver.create_socket(None, Some(remote()), SocketFlags::NONE).unwrap();

    assert_eq!(socket.send(&[0x55; 300], None).unwrap(), 128);
    assert_eq!(modem.count("AT+CSOSEND=0,256,"), 1);
}

#[test]
fn test_send_timeout_surfaces_and_drains() {
    let (driver, modem) = test_driver(DriverConfig::default());
    let socket = driver.create_socket(None, Some(remote()), SocketFlags::NONE).unwrap();
    modem.push("AT+CSOSEND=", MockReply::Timeout);

    assert!(matches!(socket.send(b"x", None), Err(DriverError::TransportTimeout(_))));
    assert_eq!(modem.drains(), 1);

    // The next command goes through normally.
    assert_eq!(socket.send(b"x", None).unwrap(), 1);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_sends_and_dispatch_never_overlap() {
    let (driver, modem) = test_driver(DriverConfig::default());
    modem.set_latency(Duration::from_millis(1));
    let driver = Arc::new(driver);

    let senders: Vec<_> = (0..4)
        .map(|_| {
            let socket = driver.create_socket(None, Some(remote()), SocketFlags::NONE).unwrap();
            thread::spawn(move || {
                for i in 0..10u8 {
                    socket.send(&[i; 16], None).unwrap();
                }
            })
        })
        .collect();

    let dispatcher = {
        let driver = Arc::clone(&driver);
        let modem = modem.clone();
        thread::spawn(move || {
            for _ in 0..20 {
                modem.inject_urc("+CSONMI: 4,2,41");
                driver.dispatch_pending(Duration::from_millis(2)).unwrap();
            }
        })
    };

    for sender in senders {
        sender.join().unwrap();
    }
    dispatcher.join().unwrap();

    assert_eq!(modem.count("AT+CSOSEND="), 40);
    assert_eq!(modem.overlaps(), 0);
}
