//! Tests for [`LineTransport`] against a scripted modem on a Unix socket pair.

#![cfg(unix)]

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use sim7020_udp::{CommandTransport, LineTransport, TransportError};

const T: Duration = Duration::from_secs(2);

/// Spawn a modem that echoes each command and answers with `script(command)`.
/// `None` leaves the command unanswered.
fn scripted_modem<F>(script: F) -> (LineTransport<UnixStream>, JoinHandle<()>)
where
    F: Fn(&str) -> Option<String> + Send + 'static,
{
    let (ours, theirs) = UnixStream::pair().expect("socket pair");
    let reader = ours.try_clone().expect("clone");
    let transport = LineTransport::new(reader, ours).expect("transport");

    let handle = thread::spawn(move || {
        let mut writer = theirs.try_clone().expect("clone");
        let mut lines = BufReader::new(theirs);
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match lines.read_until(b'\r', &mut raw) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
            let command = String::from_utf8_lossy(&raw).trim().to_string();
            if command.is_empty() {
                continue;
            }
            let mut out = format!("{}\r\r\n", command);
            if let Some(reply) = script(&command) {
                out.push_str(&reply);
            }
            if writer.write_all(out.as_bytes()).is_err() {
                break;
            }
        }
    });

    (transport, handle)
}

fn collector() -> (Arc<Mutex<Vec<String>>>, Box<dyn FnMut(&str) + Send>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, Box::new(move |line: &str| sink.lock().unwrap().push(line.to_string())))
}

// ============================================================================
// Command Exchange
// ============================================================================

#[test]
fn test_command_and_response() {
    let (mut transport, _modem) = scripted_modem(|command| match command {
        "AT+CIMI" => Some("\r\n240011234567890\r\n\r\nOK\r\n".to_string()),
        _ => Some("\r\nOK\r\n".to_string()),
    });

    transport.send("AT", T).unwrap();
    assert_eq!(transport.send_await_response("AT+CIMI", T).unwrap(), "240011234567890");
}

#[test]
fn test_error_reply() {
    let (mut transport, _modem) = scripted_modem(|command| match command {
        "AT+CIICR" => Some("\r\nERROR\r\n".to_string()),
        "AT+CSOC=1,2,1" => Some("\r\n+CME ERROR: 3\r\n".to_string()),
        _ => Some("\r\nOK\r\n".to_string()),
    });

    assert!(matches!(transport.send("AT+CIICR", T), Err(TransportError::Modem(line)) if line == "ERROR"));
    assert!(matches!(
        transport.send_await_response("AT+CSOC=1,2,1", T),
        Err(TransportError::Modem(line)) if line == "+CME ERROR: 3"
    ));
    transport.send("AT", T).unwrap();
}

#[test]
fn test_ok_without_information_line() {
    let (mut transport, _modem) = scripted_modem(|_| Some("\r\nOK\r\n".to_string()));
    assert!(matches!(
        transport.send_await_response("AT+CENG?", T),
        Err(TransportError::MissingResponse(_))
    ));
}

#[test]
fn test_unanswered_command_times_out() {
    let (mut transport, _modem) = scripted_modem(|command| match command {
        "AT+CGACT?" => None,
        _ => Some("\r\nOK\r\n".to_string()),
    });

    let started = Instant::now();
    let result = transport.send_await_response("AT+CGACT?", Duration::from_millis(100));
    assert!(matches!(result, Err(TransportError::Timeout { .. })));
    assert!(started.elapsed() >= Duration::from_millis(100));

    transport.drain();
    transport.send("AT", T).unwrap();
}

// ============================================================================
// Notifications
// ============================================================================

#[test]
fn test_notification_during_command_is_routed() {
    let (mut transport, _modem) = scripted_modem(|command| {
        if command.starts_with("AT+CSOSEND") {
            Some("\r\n+CSONMI: 0,4,6869\r\n\r\nOK\r\n".to_string())
        } else {
            Some("\r\nOK\r\n".to_string())
        }
    });
    let (seen, handler) = collector();
    transport.register_notification("+CSONMI:", handler);

    transport.send("AT+CSOSEND=0,4,6869", T).unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["+CSONMI: 0,4,6869".to_string()]);
}

#[test]
fn test_notification_does_not_become_response() {
    let (mut transport, _modem) = scripted_modem(|command| match command {
        "AT+CREG?" => Some("\r\n+CSONMI: 1,2,41\r\n+CREG: 0,1\r\n\r\nOK\r\n".to_string()),
        _ => Some("\r\nOK\r\n".to_string()),
    });
    let (seen, handler) = collector();
    transport.register_notification("+CSONMI:", handler);

    assert_eq!(transport.send_await_response("AT+CREG?", T).unwrap(), "+CREG: 0,1");
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[test]
fn test_dispatch_pending() {
    let (ours, mut theirs) = UnixStream::pair().unwrap();
    let mut transport = LineTransport::new(ours.try_clone().unwrap(), ours).unwrap();
    let (seen, handler) = collector();
    transport.register_notification("+CSONMI:", handler);

    theirs
        .write_all(b"\r\n+CSONMI: 0,2,41\r\n\r\n+CPIN: READY\r\n\r\n+CSONMI: 1,2,42\r\n")
        .unwrap();

    // Lines may arrive in more than one read.
    let deadline = Instant::now() + T;
    let mut dispatched = 0;
    while dispatched < 2 && Instant::now() < deadline {
        dispatched += transport.dispatch_pending(Duration::from_millis(50)).unwrap();
    }

    assert_eq!(dispatched, 2);
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["+CSONMI: 0,2,41".to_string(), "+CSONMI: 1,2,42".to_string()]
    );
}

#[test]
fn test_dispatch_pending_idle_timeout() {
    let (ours, _theirs) = UnixStream::pair().unwrap();
    let mut transport = LineTransport::new(ours.try_clone().unwrap(), ours).unwrap();

    let started = Instant::now();
    assert_eq!(transport.dispatch_pending(Duration::from_millis(50)).unwrap(), 0);
    assert!(started.elapsed() >= Duration::from_millis(50));
}

// ============================================================================
// Overlong Lines
// ============================================================================

/// A `+CSONMI` line whose payload is far beyond the codec's line limit.
fn overlong_notification() -> String {
    let hex = "41".repeat(1500);
    format!("+CSONMI: 0,{},{}", hex.len(), hex)
}

#[test]
fn test_overlong_notification_mid_command_is_dropped() {
    let urc = overlong_notification();
    let (mut transport, _modem) = scripted_modem(move |command| match command {
        "AT+CGACT?" => Some(format!("\r\n{}\r\n+CGACT: 1,1\r\n\r\nOK\r\n", urc)),
        "AT+CIMI" => Some("\r\n240011234567890\r\n\r\nOK\r\n".to_string()),
        _ => Some("\r\nOK\r\n".to_string()),
    });
    let (seen, handler) = collector();
    transport.register_notification("+CSONMI:", handler);

    assert_eq!(transport.send_await_response("AT+CGACT?", T).unwrap(), "+CGACT: 1,1");
    assert!(seen.lock().unwrap().is_empty());
    assert_eq!(transport.discarded_notifications(), 1);

    // The following exchange stays in step.
    assert_eq!(transport.send_await_response("AT+CIMI", T).unwrap(), "240011234567890");
}

#[test]
fn test_overlong_plain_line_is_not_a_notification() {
    let (mut transport, _modem) = scripted_modem(|command| match command {
        "AT+CENG?" => Some(format!("\r\n{}\r\n+CENG: 0\r\n\r\nOK\r\n", "x".repeat(3000))),
        _ => Some("\r\nOK\r\n".to_string()),
    });
    let (_seen, handler) = collector();
    transport.register_notification("+CSONMI:", handler);

    assert_eq!(transport.send_await_response("AT+CENG?", T).unwrap(), "+CENG: 0");
    assert_eq!(transport.discarded_notifications(), 0);
}

#[test]
fn test_overlong_notification_during_dispatch() {
    let (ours, mut theirs) = UnixStream::pair().unwrap();
    let mut transport = LineTransport::new(ours.try_clone().unwrap(), ours)
        .unwrap()
        .with_name("nbiot1");
    let (seen, handler) = collector();
    transport.register_notification("+CSONMI:", handler);

    let stream = format!("\r\n{}\r\n\r\n+CSONMI: 1,2,42\r\n", overlong_notification());
    theirs.write_all(stream.as_bytes()).unwrap();

    let deadline = Instant::now() + T;
    let mut dispatched = 0;
    while dispatched < 1 && Instant::now() < deadline {
        dispatched += transport.dispatch_pending(Duration::from_millis(50)).unwrap();
    }

    assert_eq!(dispatched, 1);
    assert_eq!(*seen.lock().unwrap(), vec!["+CSONMI: 1,2,42".to_string()]);
    assert_eq!(transport.discarded_notifications(), 1);
}

// ============================================================================
// Link Loss
// ============================================================================

#[test]
fn test_peer_close_disconnects() {
    let (ours, theirs) = UnixStream::pair().unwrap();
    let mut transport = LineTransport::new(ours.try_clone().unwrap(), ours).unwrap();
    drop(theirs);

    assert!(matches!(transport.dispatch_pending(T), Err(TransportError::Disconnected)));
    assert!(transport.is_disconnected());
    assert!(matches!(transport.send("AT", T), Err(TransportError::Disconnected)));
}
