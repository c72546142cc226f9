//! Escalation against a stub leader.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bellwether::{ClusterMessenger, ClusterState, Command, Message, Peer, PeerRole};

fn cluster_with_leader(address: &str) -> Arc<ClusterState> {
    Arc::new(ClusterState::new(vec![
        Arc::new(Peer::new("db1", PeerRole::Following, "10.0.0.1:9500")),
        Arc::new(Peer::new("db2", PeerRole::Leading, address)),
    ]))
}

fn read_request(stream: &mut TcpStream) -> Message {
    let mut request = Message::default();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "client closed before a full request arrived");
        buf.extend_from_slice(&chunk[..n]);
        if request.parse(&buf) != 0 {
            return request;
        }
    }
}

fn escalation_command(id: &str) -> Command {
    let mut request = Message::new("idcollision");
    request.set("priority", "750");
    let mut command = Command::new(request);
    command.id = id.to_string();
    command
}

#[test]
fn happy_path_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let stub = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let request = read_request(&mut stream);
        stream.write_all(b"200 OK\n\n").unwrap();
        request
    });

    let messenger = ClusterMessenger::new(cluster_with_leader(&address));
    let mut command = escalation_command("abc123");

    assert!(messenger.run_on_leader(&mut command));
    assert!(command.complete);
    assert!(command.escalated);
    assert!(command.escalation_time_us > 0);
    assert_eq!(command.response.method_line, "200 OK");

    let seen = stub.join().unwrap();
    assert_eq!(seen.method_line, "idcollision");
    assert_eq!(seen.get("ID"), Some("abc123"));
    assert_eq!(seen.get("priority"), Some("750"));
    assert!(seen.is_set("requestID"));
    assert!(seen.is_set("commandExecuteTime"));
}

#[test]
fn mid_response_disconnect_synthesizes_the_500() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let stub = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = read_request(&mut stream);
        // Half a framed response, then hang up.
        stream
            .write_all(b"200 OK\r\nContent-Length: 100\r\n\r\nhalf")
            .unwrap();
    });

    let messenger = ClusterMessenger::new(cluster_with_leader(&address));
    let mut command = escalation_command("abc124");

    assert!(!messenger.run_on_leader(&mut command));
    assert_eq!(command.response.method_line, "500 Internal Server Error");
    assert!(command.response.headers.is_empty());
    assert!(command.response.content.is_empty());
    assert!(command.complete);
    assert!(!command.escalated);
    stub.join().unwrap();
}

#[test]
fn per_command_timeout_aborts_the_receive() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let stub = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = read_request(&mut stream);
        // Hold the connection open without ever answering.
        thread::sleep(Duration::from_millis(800));
    });

    let messenger = ClusterMessenger::new(cluster_with_leader(&address));
    let mut request = Message::new("Status");
    request.set("timeout", "200");
    let mut command = Command::new(request);

    let started = Instant::now();
    assert!(!messenger.run_on_leader(&mut command));
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(150), "gave up too early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(700), "missed the deadline: {elapsed:?}");
    assert_eq!(command.response.method_line, "500 Internal Server Error");
    assert!(command.complete);
    stub.join().unwrap();
}

#[test]
fn shutdown_deadline_abandons_the_wait() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let stub = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let _ = read_request(&mut stream);
        thread::sleep(Duration::from_millis(800));
    });

    let messenger = ClusterMessenger::new(cluster_with_leader(&address));
    messenger.shutdown_by(bellwether::clock::now_us());
    let mut command = escalation_command("abc125");

    let started = Instant::now();
    assert!(!messenger.run_on_leader(&mut command));
    assert!(started.elapsed() < Duration::from_millis(700));
    // The request had already gone out, so the state is ambiguous.
    assert_eq!(command.response.method_line, "500 Internal Server Error");
    stub.join().unwrap();

    messenger.reset();
}

#[test]
fn malformed_leader_address_is_rejected_without_a_socket() {
    let messenger = ClusterMessenger::new(cluster_with_leader("not-an-endpoint"));
    let mut command = escalation_command("abc126");
    assert!(!messenger.run_on_leader(&mut command));
    assert!(!command.complete);
    assert_eq!(command.response, Message::default());
}

#[test]
fn consecutive_commands_reuse_the_pooled_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap().to_string();
    let stub = thread::spawn(move || {
        // One accepted connection serves both commands; a second dial
        // would leave the client blocked and fail the test.
        let (mut stream, _) = listener.accept().unwrap();
        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(read_request(&mut stream));
            stream.write_all(b"200 OK\n\n").unwrap();
        }
        seen
    });

    let messenger = ClusterMessenger::new(cluster_with_leader(&address));
    let mut first = escalation_command("aaa111");
    assert!(messenger.run_on_leader(&mut first));
    let mut second = escalation_command("bbb222");
    assert!(messenger.run_on_leader(&mut second));

    let seen = stub.join().unwrap();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].get("ID"), Some("aaa111"));
    assert_eq!(seen[1].get("ID"), Some("bbb222"));
}
