use core::{num::NonZero, time::Duration};
use std::{
    collections::HashSet,
    io::{Read, Write},
    net::{TcpListener, TcpStream},
    sync::{mpsc, Arc, Mutex},
    thread,
    time::Instant,
};

use perfer::{
    cfg::{Config, Limit, RequestSource},
    request::RequestTemplate,
    Error, Outcome, Runtime,
};

const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok";

/// Behavior of the test server for each received request.
#[derive(Debug, Clone, Copy)]
enum Reply {
    Now,
    After(Duration),
    Never,
    /// Answers this many requests per connection, then drops the connection
    /// on the next one.
    Drop(usize),
}

/// Starts a server answering every request head it receives, in order.
///
/// Request lines are recorded into `log`.
fn serve(reply: Reply, log: Arc<Mutex<Vec<String>>>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else {
                continue;
            };
            let log = log.clone();
            thread::spawn(move || handle(stream, reply, log));
        }
    });

    port
}

fn handle(mut stream: TcpStream, reply: Reply, log: Arc<Mutex<Vec<String>>>) {
    let mut buf = Vec::new();
    let mut chunk = [0; 4096];
    let mut received = 0;

    loop {
        let n = match stream.read(&mut chunk) {
            Ok(0) | Err(..) => return,
            Ok(n) => n,
        };
        buf.extend_from_slice(&chunk[..n]);

        while let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head: Vec<u8> = buf.drain(..end + 4).collect();
            let head = String::from_utf8_lossy(&head).into_owned();
            log.lock().unwrap().push(head.lines().next().unwrap_or_default().to_owned());
            received += 1;

            match reply {
                Reply::Now => {}
                Reply::After(delay) => thread::sleep(delay),
                Reply::Never => continue,
                Reply::Drop(n) if received > n => return,
                Reply::Drop(..) => {}
            }
            if stream.write_all(RESPONSE).is_err() {
                return;
            }
            if head.contains("Connection: Close") {
                return;
            }
        }
    }
}

fn config(port: u16, source: RequestSource, limit: Limit, threads: usize, conns: usize, backlog: usize, keep_alive: bool) -> Config {
    Config::new(
        format!("127.0.0.1:{port}").parse().unwrap(),
        source,
        limit,
        NonZero::new(threads).unwrap(),
        NonZero::new(conns).unwrap(),
        backlog,
        keep_alive,
        false,
    )
    .unwrap()
}

fn index() -> RequestSource {
    RequestSource::Path { path: "index.html".into(), headers: Vec::new() }
}

fn requests(n: u64) -> Limit {
    Limit::Requests(NonZero::new(n).unwrap())
}

#[tokio::test]
async fn duration_without_keep_alive() {
    let port = serve(Reply::Now, Default::default());
    let cfg = config(port, index(), Limit::Duration(Duration::from_secs(1)), 2, 1, 1, false);

    let outcome = Runtime::new(cfg).run().await.unwrap();
    let s = outcome.summary;

    assert!(outcome.error.is_none());
    assert_eq!(0, s.err);
    assert!(s.ok > 0);
    assert!(s.throughput > 0.0);
    assert!(s.sent >= s.ok + s.err);
    // One connection per request.
    assert!(s.sock_created >= s.ok);
    assert_eq!(2, s.threads);
    assert_eq!(1, s.connections);
    assert_eq!(0, s.stragglers);
}

#[tokio::test]
async fn pipelined_request_count() {
    let log: Arc<Mutex<Vec<String>>> = Default::default();
    let port = serve(Reply::Now, log.clone());
    let cfg = config(port, index(), requests(200), 2, 4, 8, true);

    let outcome = Runtime::new(cfg).run().await.unwrap();
    let s = outcome.summary;

    assert!(outcome.error.is_none());
    assert_eq!(200, s.sent);
    assert_eq!(200, s.ok);
    assert_eq!(200, s.num_2xx);
    assert_eq!(0, s.err);
    assert_eq!(0, s.unanswered);
    assert_eq!(200, log.lock().unwrap().len());
    // Connections are reused.
    assert!(s.sock_created <= 8);
}

#[tokio::test]
async fn request_count_rounds_down_per_thread() {
    let port = serve(Reply::Now, Default::default());
    let cfg = config(port, index(), requests(10), 3, 1, 4, true);

    let outcome = Runtime::new(cfg).run().await.unwrap();

    assert_eq!(9, outcome.summary.sent);
    assert_eq!(9, outcome.summary.ok);
}

#[tokio::test]
async fn sequence_numbers_are_unique() {
    let log: Arc<Mutex<Vec<String>>> = Default::default();
    let port = serve(Reply::Now, log.clone());
    let template = RequestTemplate::literal(&b"GET /item/${sequence} HTTP/1.1\r\nHost: test\r\n\r\n"[..]);
    let cfg = config(port, RequestSource::Literal(template), requests(100), 2, 2, 4, true);

    let outcome = Runtime::new(cfg).run().await.unwrap();
    assert_eq!(100, outcome.summary.ok);

    let lines = log.lock().unwrap();
    let seqs: HashSet<u64> = lines
        .iter()
        .map(|line| {
            let path = line.split(' ').nth(1).unwrap();
            path.strip_prefix("/item/").unwrap().parse().unwrap()
        })
        .collect();

    assert_eq!(100, lines.len());
    assert_eq!(100, seqs.len());
    assert!(!seqs.contains(&0));
}

#[tokio::test]
async fn latency_reflects_server_delay() {
    let port = serve(Reply::After(Duration::from_millis(50)), Default::default());
    let cfg = config(port, index(), requests(4), 1, 1, 1, false);

    let outcome = Runtime::new(cfg).run().await.unwrap();
    let s = outcome.summary;

    assert_eq!(4, s.ok);
    assert!(s.latency >= 50.0, "latency {}", s.latency);
    assert!(s.latency < 1000.0, "latency {}", s.latency);
    assert!(s.dispersion >= s.latency);
}

#[tokio::test]
async fn external_stop() {
    let port = serve(Reply::Never, Default::default());
    let cfg = config(port, index(), Limit::Duration(Duration::from_secs(30)), 2, 2, 1, false);

    let runtime = Runtime::new(cfg);
    let ctx = runtime.context();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        ctx.stop();
    });

    let now = Instant::now();
    let outcome = runtime.run().await.unwrap();
    let s = outcome.summary;

    assert!(now.elapsed() < Duration::from_secs(5));
    assert!(outcome.error.is_none());
    assert_eq!(0, s.ok);
    assert!(s.sent >= s.ok + s.err);
    assert_eq!(s.sent, s.unanswered);
}

#[tokio::test]
async fn unresolvable_host() {
    let cfg = Config::new(
        "perfer-test.invalid:80".parse().unwrap(),
        index(),
        requests(1),
        NonZero::new(1).unwrap(),
        NonZero::new(1).unwrap(),
        1,
        false,
        false,
    )
    .unwrap();

    let outcome = Runtime::new(cfg).run().await.unwrap();

    assert!(matches!(outcome.error, Some(Error::Resolve { .. })));
    assert_eq!(0, outcome.summary.sent);
}

#[tokio::test]
async fn refused_connection() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let cfg = config(port, index(), Limit::Duration(Duration::from_secs(5)), 2, 1, 1, false);

    let now = Instant::now();
    let outcome = Runtime::new(cfg).run().await.unwrap();

    assert!(matches!(outcome.error, Some(Error::Connect { .. })));
    assert!(outcome.error.unwrap().is_fatal());
    assert_eq!(0, outcome.summary.ok);
    assert!(now.elapsed() < Duration::from_secs(5));
}

/// Runs to completion, failing the test if the run does not end in time.
async fn run_within(cfg: Config, limit: Duration) -> Outcome {
    tokio::time::timeout(limit, Runtime::new(cfg).run())
        .await
        .expect("run did not end in time")
        .unwrap()
}

/// Literal request large enough to never fit into socket buffers at once.
fn huge_request() -> RequestSource {
    RequestSource::Literal(RequestTemplate::literal(vec![b'x'; 16 << 20]))
}

#[tokio::test]
async fn reconnects_after_reset_with_requests_in_flight() {
    let port = serve(Reply::Drop(5), Default::default());
    let cfg = config(port, index(), Limit::Duration(Duration::from_secs(1)), 1, 1, 4, true);

    let outcome = run_within(cfg, Duration::from_secs(10)).await;
    let s = outcome.summary;

    assert!(outcome.error.is_none());
    assert!(s.err > 0);
    assert!(s.ok >= 5);
    assert!(s.sock_created > 1);
    assert!(s.sent >= s.ok + s.err);
}

#[tokio::test]
async fn request_lost_mid_write_counts_as_failed() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        let mut held = Vec::new();
        for (idx, stream) in listener.incoming().enumerate() {
            let Ok(mut stream) = stream else {
                continue;
            };
            if idx == 0 {
                // Closing with unread data resets the connection.
                let _ = stream.read(&mut [0; 1024]);
            } else {
                held.push(stream);
            }
        }
    });
    let cfg = config(port, huge_request(), requests(1), 1, 1, 1, true);

    let outcome = run_within(cfg, Duration::from_secs(10)).await;
    let s = outcome.summary;

    assert!(outcome.error.is_none());
    assert_eq!(1, s.sent);
    assert_eq!(1, s.err);
    assert_eq!(0, s.ok);
    assert_eq!(1, s.sock_created);
}

#[tokio::test]
async fn stalled_request_count_is_bounded() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    thread::spawn(move || {
        // Accept, never read.
        let mut held = Vec::new();
        for stream in listener.incoming() {
            held.push(stream);
        }
    });
    let cfg = config(port, huge_request(), requests(1), 1, 1, 1, true).with_grace(Duration::from_millis(500));

    let outcome = run_within(cfg, Duration::from_secs(10)).await;
    let s = outcome.summary;

    assert!(outcome.error.is_none());
    assert_eq!(0, s.sent);
    assert_eq!(0, s.ok);
    assert_eq!(0, s.stragglers);
}

/// Starts a server answering each request exactly `delay` after it arrived,
/// in order, however many are pipelined.
fn serve_delayed(delay: Duration) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else {
                continue;
            };
            let _ = stream.set_nodelay(true);
            let Ok(mut writer) = stream.try_clone() else {
                continue;
            };
            let (tx, rx) = mpsc::channel::<Instant>();

            thread::spawn(move || {
                for arrived in rx {
                    thread::sleep((arrived + delay).saturating_duration_since(Instant::now()));
                    if writer.write_all(RESPONSE).is_err() {
                        return;
                    }
                }
            });
            thread::spawn(move || {
                let mut buf = Vec::new();
                let mut chunk = [0; 4096];
                while let Ok(n @ 1..) = stream.read(&mut chunk) {
                    let now = Instant::now();
                    buf.extend_from_slice(&chunk[..n]);
                    while let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        buf.drain(..end + 4);
                        if tx.send(now).is_err() {
                            return;
                        }
                    }
                }
            });
        }
    });

    port
}

#[tokio::test]
async fn pipelined_latency_matches_oldest_request() {
    let port = serve_delayed(Duration::from_millis(50));
    let cfg = config(port, index(), requests(40), 1, 1, 4, true);

    let outcome = run_within(cfg, Duration::from_secs(10)).await;
    let s = outcome.summary;

    assert_eq!(40, s.ok);
    assert_eq!(0, s.err);
    // Each response answers its own request, not one queued behind others.
    assert!(s.latency >= 50.0, "latency {}", s.latency);
    assert!(s.latency < 75.0, "latency {}", s.latency);
    assert!(s.p50 < 75.0, "p50 {}", s.p50);
    assert!(s.p99 < 100.0, "p99 {}", s.p99);
    // Serially this would take at least two seconds.
    assert!(s.duration < 1.5, "duration {}", s.duration);
}
