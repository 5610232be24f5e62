//! End-to-end coverage of static-repeat mode: a real listener accepting
//! real TCP connections, routed through a chain of named downstream
//! handlers (`auto_block_by_rate` wrapping `tcp_repeat`) exactly as a
//! deployed config would wire them.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use net_repeater::config::{DownstreamHandlerSpec, ServerSpec};
use net_repeater::static_repeat::StaticRepeat;

fn echo_upstream() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming().flatten() {
            thread::spawn(move || {
                let mut stream = stream;
                let mut buf = [0u8; 64];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

// Composes C9's rate limiter in front of C9's plain TCP repeater, exactly
// as `downstream::build_handler_dict` would from a two-entry config: later
// entries may reference earlier ones by name.
#[test]
fn rate_limited_downstream_blocks_after_the_configured_threshold() {
    let upstream = echo_upstream();

    let downstream_specs = vec![
        DownstreamHandlerSpec {
            name: "upstream".to_string(),
            module: "tcp_repeat".to_string(),
            config: serde_json::json!({
                "ip": upstream.ip().to_string(),
                "port": upstream.port(),
            }),
        },
        DownstreamHandlerSpec {
            name: "limited".to_string(),
            module: "auto_block_by_rate".to_string(),
            config: serde_json::json!({
                "max_num_requests": 2,
                "time_window_sec": 30,
                "downstream_handler": "upstream",
            }),
        },
    ];
    let server_specs = vec![ServerSpec {
        module: "TCP".to_string(),
        config: serde_json::json!({
            "ip": "127.0.0.1",
            "port": 0,
            "downstream": "limited",
        }),
    }];

    let cancel = Arc::new(AtomicBool::new(false));
    let mut repeat = StaticRepeat::start(&downstream_specs, &server_specs, cancel).unwrap();
    let port = repeat.ports()[0];

    // Every connection from this test process shares one client IP
    // (127.0.0.1), so the third connection within the window must be
    // rejected -- the handler closes the socket instead of forwarding.
    for _ in 0..2 {
        let mut client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        client.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
    }

    let mut blocked = TcpStream::connect(("127.0.0.1", port)).unwrap();
    blocked.write_all(b"ping").unwrap();
    let mut buf = [0u8; 4];
    blocked
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    let result = blocked.read(&mut buf);
    match result {
        Ok(0) => {} // connection closed without echoing
        Ok(n) => panic!("expected the blocked connection to get no data, got {n} bytes"),
        Err(e) => assert_eq!(e.kind(), std::io::ErrorKind::WouldBlock),
    }

    repeat.terminate();
}
