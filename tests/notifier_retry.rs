//! Push notifier behavior against a local HTTP server scripted with canned
//! status codes.

use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use catwatch::config::NotifyCredentials;
use catwatch::error::StageError;
use catwatch::notify::{NotificationRequest, Notifier, PushNotifier};
use catwatch::retry::RetryPolicy;

/// Serves the scripted status codes in order, repeating the last one, and
/// counts requests. Returns the base URL.
fn spawn_server(statuses: Vec<u16>, hits: Arc<AtomicUsize>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            let index = hits.fetch_add(1, Ordering::SeqCst);
            let status = *statuses.get(index).or(statuses.last()).unwrap_or(&200);

            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            // Read headers, then drain the JSON body per Content-Length.
            let body_len = loop {
                let n = stream.read(&mut chunk).unwrap_or(0);
                if n == 0 {
                    break 0;
                }
                buf.extend_from_slice(&chunk[..n]);
                if let Some(split) = find_header_end(&buf) {
                    let headers = String::from_utf8_lossy(&buf[..split]);
                    let len = headers
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    let mut have = buf.len() - split - 4;
                    while have < len {
                        let n = stream.read(&mut chunk).unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        have += n;
                    }
                    break len;
                }
            };
            let _ = body_len;

            let reason = match status {
                200 => "OK",
                400 => "Bad Request",
                429 => "Too Many Requests",
                500 => "Internal Server Error",
                _ => "Status",
            };
            let response = format!(
                "HTTP/1.1 {status} {reason}\r\nContent-Length: 2\r\nConnection: close\r\n\r\n{{}}"
            );
            let _ = stream.write_all(response.as_bytes());
        }
    });
    format!("http://{addr}/push")
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|window| window == b"\r\n\r\n")
}

fn credentials() -> NotifyCredentials {
    NotifyCredentials {
        access_token: "test-token".to_string(),
        recipient: "U0000".to_string(),
    }
}

fn notifier(url: &str, max_retries: u32) -> PushNotifier {
    PushNotifier::with_retry_policy(
        url,
        &credentials(),
        Duration::from_secs(5),
        RetryPolicy::new(max_retries, Duration::ZERO),
    )
}

#[test]
fn success_takes_one_attempt() {
    let hits = Arc::new(AtomicUsize::new(0));
    let url = spawn_server(vec![200], hits.clone());

    let result = notifier(&url, 3).send(&NotificationRequest::text_only("hello"));
    assert!(result.is_ok());
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn server_errors_are_retried_until_exhausted() {
    let hits = Arc::new(AtomicUsize::new(0));
    let url = spawn_server(vec![500], hits.clone());

    let err = notifier(&url, 2)
        .send(&NotificationRequest::text_only("hello"))
        .unwrap_err();
    assert!(matches!(err, StageError::NotifyExhausted(_)));
    // max_retries + 1 total attempts
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn transient_error_then_success_recovers() {
    let hits = Arc::new(AtomicUsize::new(0));
    let url = spawn_server(vec![500, 429, 200], hits.clone());

    let result = notifier(&url, 3).send(&NotificationRequest::text_only("hello"));
    assert!(result.is_ok());
    assert_eq!(hits.load(Ordering::SeqCst), 3);
}

#[test]
fn client_error_fails_immediately_without_retry() {
    let hits = Arc::new(AtomicUsize::new(0));
    let url = spawn_server(vec![400], hits.clone());

    let err = notifier(&url, 3)
        .send(&NotificationRequest::text_only("hello"))
        .unwrap_err();
    assert!(matches!(err, StageError::NotifyTerminal(_)));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
