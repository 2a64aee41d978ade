use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

use redkv::commands::Dispatcher;
use redkv::token::Token;
use redkv::{Config, Error, Server, ServerError, Shutdown, State};

const LARGE_VALUE_SIZE: usize = 32 * 1024 * 1024;

fn config() -> Config {
    Config {
        addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..Config::default()
    }
}

async fn start(config: Config) -> Server {
    let server = Server::bind(config).await.unwrap();
    server.run().unwrap();
    server
}

async fn send(stream: &mut TcpStream, request: &[u8], expected: &[u8]) {
    stream.write_all(request).await.unwrap();

    let mut response = vec![0; expected.len()];
    timeout(Duration::from_secs(5), stream.read_exact(&mut response))
        .await
        .expect("timed out waiting for a response")
        .unwrap();

    assert_eq!(
        String::from_utf8_lossy(&response),
        String::from_utf8_lossy(expected)
    );
}

async fn ping(stream: &mut TcpStream) {
    send(stream, b"*1\r\n$4\r\nPING\r\n", b"+PONG\r\n").await;
}

/// Returns once the server closed `stream`, a reset counts as closed too.
async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0; 64];
    let read = timeout(Duration::from_secs(5), stream.read(&mut buf))
        .await
        .expect("connection was not closed");
    assert!(matches!(read, Ok(0) | Err(_)), "unexpected read: {:?}", read);
}

async fn wait_for_connections(server: &Server, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while server.connections() != expected {
        assert!(
            Instant::now() < deadline,
            "expected {} connections, found {}",
            expected,
            server.connections()
        );
        sleep(Duration::from_millis(10)).await;
    }
}

fn set_large_value() -> Vec<u8> {
    let mut request = format!("*3\r\n$3\r\nSET\r\n$5\r\nlarge\r\n${}\r\n", LARGE_VALUE_SIZE).into_bytes();
    request.resize(request.len() + LARGE_VALUE_SIZE, b'x');
    request.extend_from_slice(b"\r\n");
    request
}

/// Stores a value too large to fit in the socket buffers, then requests it without reading the
/// response, leaving the session blocked on the write.
async fn stall_session_on_write(stream: &mut TcpStream) {
    send(stream, &set_large_value(), b"+OK\r\n").await;
    stream
        .write_all(b"*2\r\n$3\r\nGET\r\n$5\r\nlarge\r\n")
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_ping() {
    let server = start(config()).await;
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

    ping(&mut client).await;
    send(
        &mut client,
        b"*2\r\n$4\r\nPING\r\n$5\r\nhello\r\n",
        b"$5\r\nhello\r\n",
    )
    .await;

    assert_eq!(server.kill().await, Shutdown::Graceful);
}

#[tokio::test]
async fn test_echo() {
    let server = start(config()).await;
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

    send(
        &mut client,
        b"*2\r\n$4\r\nECHO\r\n$11\r\nhello world\r\n",
        b"$11\r\nhello world\r\n",
    )
    .await;
}

#[tokio::test]
async fn test_set_get_del() {
    let server = start(config()).await;
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

    send(
        &mut client,
        b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n",
        b"+OK\r\n",
    )
    .await;
    send(
        &mut client,
        b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n",
        b"$5\r\nvalue\r\n",
    )
    .await;
    send(&mut client, b"*2\r\n$3\r\nDEL\r\n$3\r\nkey\r\n", b":1\r\n").await;
    send(&mut client, b"*2\r\n$3\r\nDEL\r\n$3\r\nkey\r\n", b":0\r\n").await;
    send(&mut client, b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n", b"$-1\r\n").await;
}

#[tokio::test]
async fn test_values_are_shared_between_connections() {
    let server = start(config()).await;
    let mut writer = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut reader = TcpStream::connect(server.local_addr()).await.unwrap();

    send(
        &mut writer,
        b"*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n",
        b"+OK\r\n",
    )
    .await;
    send(
        &mut reader,
        b"*2\r\n$3\r\nGET\r\n$3\r\nkey\r\n",
        b"$5\r\nvalue\r\n",
    )
    .await;
}

#[tokio::test]
async fn test_pipelined_requests() {
    let server = start(config()).await;
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

    send(
        &mut client,
        b"*1\r\n$4\r\nPING\r\n*3\r\n$3\r\nSET\r\n$1\r\na\r\n$1\r\nb\r\n*2\r\n$3\r\nGET\r\n$1\r\na\r\n",
        b"+PONG\r\n+OK\r\n$1\r\nb\r\n",
    )
    .await;
}

#[tokio::test]
async fn test_command_errors_keep_the_session_open() {
    let server = start(config()).await;
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

    send(
        &mut client,
        b"*1\r\n$3\r\nFOO\r\n",
        b"-ERR unknown command 'foo'\r\n",
    )
    .await;
    send(
        &mut client,
        b"*1\r\n$3\r\nGET\r\n",
        b"-ERR wrong number of arguments for 'get' command\r\n",
    )
    .await;
    send(
        &mut client,
        b"+PING\r\n",
        b"-ERR protocol error; expected array, got SimpleString\r\n",
    )
    .await;
    send(&mut client, b"*0\r\n", b"-ERR empty command\r\n").await;

    ping(&mut client).await;
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn test_protocol_error_closes_only_that_connection() {
    let server = start(config()).await;
    let mut bad = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut good = TcpStream::connect(server.local_addr()).await.unwrap();

    ping(&mut bad).await;
    ping(&mut good).await;

    bad.write_all(b"?oops\r\n").await.unwrap();
    assert_closed(&mut bad).await;

    wait_for_connections(&server, 1).await;
    ping(&mut good).await;
    assert_eq!(server.state(), State::Running);
}

#[tokio::test]
async fn test_truncated_request_closes_the_connection() {
    let server = start(config()).await;
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

    client.write_all(b"$5\r\nhell\r\n").await.unwrap();
    client.shutdown().await.unwrap();

    assert_closed(&mut client).await;
    wait_for_connections(&server, 0).await;
}

#[tokio::test]
async fn test_oversized_request_closes_the_connection() {
    let server = start(Config {
        max_frame_size: 64,
        ..config()
    })
    .await;
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

    client
        .write_all(format!("*1\r\n$100\r\n{}", "x".repeat(80)).as_bytes())
        .await
        .unwrap();

    assert_closed(&mut client).await;
    wait_for_connections(&server, 0).await;
}

#[tokio::test]
async fn test_admission_control() {
    let server = start(Config {
        max_connections: 2,
        ..config()
    })
    .await;

    let mut first = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut second = TcpStream::connect(server.local_addr()).await.unwrap();
    ping(&mut first).await;
    ping(&mut second).await;

    let mut rejected = TcpStream::connect(server.local_addr()).await.unwrap();
    assert_closed(&mut rejected).await;
    assert_eq!(server.connections(), 2);

    drop(first);
    wait_for_connections(&server, 1).await;

    let mut third = TcpStream::connect(server.local_addr()).await.unwrap();
    ping(&mut third).await;
    ping(&mut second).await;
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn test_graceful_kill() {
    let server = start(config()).await;
    let addr = server.local_addr();

    let mut client = TcpStream::connect(addr).await.unwrap();
    ping(&mut client).await;

    assert_eq!(server.kill().await, Shutdown::Graceful);
    assert_eq!(server.state(), State::Stopped);
    assert_eq!(server.connections(), 0);

    assert_closed(&mut client).await;
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_kill_is_idempotent() {
    let server = start(config()).await;

    assert_eq!(server.kill().await, Shutdown::Graceful);
    assert_eq!(server.kill().await, Shutdown::AlreadyStopped);
    assert_eq!(server.state(), State::Stopped);
}

#[tokio::test]
async fn test_concurrent_kills() {
    let server = start(config()).await;

    let (first, second) = tokio::join!(server.kill(), server.kill());

    let mut outcomes = [first, second];
    outcomes.sort_by_key(|outcome| *outcome == Shutdown::AlreadyStopped);
    assert_eq!(outcomes, [Shutdown::Graceful, Shutdown::AlreadyStopped]);
}

#[tokio::test]
async fn test_kill_before_run() {
    let server = Server::bind(config()).await.unwrap();
    let addr = server.local_addr();

    assert_eq!(server.state(), State::Running);
    assert_eq!(server.kill().await, Shutdown::Graceful);
    assert_eq!(server.state(), State::Stopped);

    assert!(TcpStream::connect(addr).await.is_err());
    assert!(matches!(server.run(), Err(ServerError::NotRunning)));
}

#[tokio::test]
async fn test_run_twice() {
    let server = start(config()).await;

    assert!(matches!(server.run(), Err(ServerError::AlreadyStarted)));

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    ping(&mut client).await;
}

#[tokio::test]
async fn test_bind_address_in_use() {
    let server = start(config()).await;

    let err = Server::bind(Config {
        addr: server.local_addr(),
        ..config()
    })
    .await
    .err()
    .unwrap();

    assert!(matches!(err, ServerError::Bind { addr, .. } if addr == server.local_addr()));
}

#[tokio::test]
async fn test_kill_forces_stalled_connections_closed() {
    let server = start(Config {
        shutdown_timeout: Duration::from_millis(300),
        write_timeout: Duration::from_secs(60),
        ..config()
    })
    .await;
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    stall_session_on_write(&mut client).await;

    let started = Instant::now();
    let outcome = server.kill().await;

    assert_eq!(outcome, Shutdown::Forced { connections: 1 });
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(server.state(), State::Stopped);
    assert_eq!(server.connections(), 0);
}

#[tokio::test]
async fn test_write_timeout_closes_the_connection() {
    let server = start(Config {
        write_timeout: Duration::from_millis(200),
        ..config()
    })
    .await;
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    let mut other = TcpStream::connect(server.local_addr()).await.unwrap();
    ping(&mut other).await;

    stall_session_on_write(&mut client).await;

    wait_for_connections(&server, 1).await;
    ping(&mut other).await;
}

/// Answers every request with its own argument count, and fails on `*0`.
struct Counter;

impl Dispatcher for Counter {
    fn handle(&self, command: Token) -> Result<Token, Error> {
        match command {
            Token::Array(items) if !items.is_empty() => Ok(Token::Integer(items.len() as i64)),
            _ => Err("nothing to count".into()),
        }
    }
}

#[tokio::test]
async fn test_custom_dispatcher() {
    let server = Server::with_dispatcher(config(), Arc::new(Counter))
        .await
        .unwrap();
    server.run().unwrap();

    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    send(&mut client, b"*2\r\n$3\r\nGET\r\n$1\r\na\r\n", b":2\r\n").await;

    // A failing dispatcher ends the session instead of answering.
    client.write_all(b"*0\r\n").await.unwrap();
    assert_closed(&mut client).await;
    wait_for_connections(&server, 0).await;
}
