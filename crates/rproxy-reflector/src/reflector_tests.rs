use super::*;

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tokio_stream::StreamExt;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// A connected loopback pair: `(remote, local)` where `local` is the end the
/// reflector would have accepted.
async fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (remote, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (remote.unwrap(), accepted.unwrap().0)
}

fn new_reflector(config: ReflectorConfig) -> Arc<Reflector> {
    Arc::new(Reflector::new(config))
}

/// Register a client, returning the client's own socket and the request.
async fn connect_client(reflector: &Reflector) -> (TcpStream, CreateRequest) {
    let (client, accepted) = tcp_pair().await;
    let request = reflector.register_client(accepted).await.unwrap();
    (client, request)
}

/// Open a worker data connection, returning the worker's socket and the
/// port it would report.
async fn connect_worker_leg(reflector: &Reflector) -> (TcpStream, u32) {
    let (worker, accepted) = tcp_pair().await;
    let addr = worker.local_addr().unwrap();
    reflector.register_data_connection(accepted, addr).await;
    (worker, u32::from(addr.port()))
}

fn report(id: u32, port: u32, epoch: u64) -> Report {
    Report {
        id,
        port,
        epoch,
        failed: false,
    }
}

async fn assert_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 8];
    let read = timeout(Duration::from_secs(2), stream.read(&mut buf))
        .await
        .unwrap();
    assert!(matches!(read, Ok(0) | Err(_)), "expected EOF, got {read:?}");
}

async fn assert_relays(from: &mut TcpStream, to: &mut TcpStream, payload: &[u8]) {
    from.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    timeout(Duration::from_secs(2), to.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(buf, payload);
}

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn register_without_session_fails() {
    let reflector = new_reflector(ReflectorConfig::default());
    let (_client, accepted) = tcp_pair().await;
    let err = reflector.register_client(accepted).await.unwrap_err();
    assert!(matches!(err, ReflectorError::NoSession));
}

#[tokio::test]
async fn ids_restart_after_session_reset() {
    let reflector = new_reflector(ReflectorConfig::default());
    let first = reflector.open_session(None).await;
    assert_eq!(first.epoch, 1);

    let (_a, req_a) = connect_client(&reflector).await;
    let (_b, req_b) = connect_client(&reflector).await;
    assert_eq!((req_a.id, req_a.epoch), (0, 1));
    assert_eq!((req_b.id, req_b.epoch), (1, 1));

    let second = reflector.open_session(None).await;
    assert_eq!(second.epoch, 2);
    let (_c, req_c) = connect_client(&reflector).await;
    assert_eq!((req_c.id, req_c.epoch), (0, 2));

    let stats = reflector.stats().await;
    assert_eq!(stats.epoch, 2);
    assert_eq!(stats.pending_tunnels, 1);
    assert_eq!(stats.queued_requests, 3);
}

#[tokio::test]
async fn reset_closes_previous_epoch_sockets() {
    let reflector = new_reflector(ReflectorConfig::default());
    reflector.open_session(None).await;
    let (mut client, _) = connect_client(&reflector).await;
    let (mut worker, _) = connect_worker_leg(&reflector).await;

    reflector.open_session(None).await;
    assert_closed(&mut client).await;
    assert_closed(&mut worker).await;

    let stats = reflector.stats().await;
    assert_eq!(stats.pending_tunnels, 0);
    assert_eq!(stats.pending_connections, 0);
}

#[tokio::test]
async fn stream_loss_only_ends_matching_session() {
    let reflector = new_reflector(ReflectorConfig::default());
    reflector.open_session(None).await;
    reflector.open_session(None).await;

    reflector.on_control_stream_lost(1);
    assert_eq!(reflector.current_session().map(|s| s.epoch), Some(2));

    reflector.on_control_stream_lost(2);
    assert!(reflector.current_session().is_none());
}

#[tokio::test]
async fn create_request_stream_requires_session() {
    let reflector = new_reflector(ReflectorConfig::default());
    assert!(matches!(
        reflector.create_request_stream(),
        Err(ReflectorError::NoSession)
    ));

    reflector.open_session(None).await;
    let (_client, request) = connect_client(&reflector).await;
    let (epoch, stream) = reflector.create_request_stream().unwrap();
    assert_eq!(epoch, 1);
    tokio::pin!(stream);
    assert_eq!(stream.next().await.unwrap(), request);
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[tokio::test]
async fn report_pairs_by_port_and_splices() {
    let reflector = new_reflector(ReflectorConfig::default());
    let session = reflector.open_session(None).await;
    let (mut client, request) = connect_client(&reflector).await;
    let (mut worker, port) = connect_worker_leg(&reflector).await;

    let outcome = reflector
        .on_report(report(request.id, port, session.epoch))
        .await;
    assert_eq!(outcome, ReportOutcome::Spliced);

    assert_relays(&mut client, &mut worker, b"GET / HTTP/1.0\r\n\r\n").await;
    assert_relays(&mut worker, &mut client, b"HTTP/1.0 200 OK\r\n\r\n").await;

    let stats = reflector.stats().await;
    assert_eq!(stats.pending_tunnels, 0);
    assert_eq!(stats.pending_connections, 0);
    assert_eq!(stats.active_splices, 1);
}

#[tokio::test]
async fn second_report_for_same_id_closes_its_connection() {
    let reflector = new_reflector(ReflectorConfig::default());
    let session = reflector.open_session(None).await;
    let (_client, request) = connect_client(&reflector).await;
    let (_worker, port) = connect_worker_leg(&reflector).await;
    let (mut extra, extra_port) = connect_worker_leg(&reflector).await;

    assert_eq!(
        reflector.on_report(report(request.id, port, session.epoch)).await,
        ReportOutcome::Spliced
    );
    assert_eq!(
        reflector
            .on_report(report(request.id, extra_port, session.epoch))
            .await,
        ReportOutcome::UnknownTunnel
    );
    assert_closed(&mut extra).await;
}

#[tokio::test]
async fn pre_reset_report_is_a_no_op() {
    let reflector = new_reflector(ReflectorConfig::default());
    reflector.open_session(None).await;
    let (_old_client, old_request) = connect_client(&reflector).await;

    reflector.open_session(None).await;
    let (_client, _) = connect_client(&reflector).await;
    let (_worker, port) = connect_worker_leg(&reflector).await;

    let outcome = reflector.on_report(report(old_request.id, port, 1)).await;
    assert_eq!(outcome, ReportOutcome::StaleEpoch);

    let stats = reflector.stats().await;
    assert_eq!(stats.pending_tunnels, 1);
    assert_eq!(stats.pending_connections, 1);
    assert_eq!(stats.active_splices, 0);
}

#[tokio::test]
async fn failure_report_closes_client() {
    let reflector = new_reflector(ReflectorConfig::default());
    let session = reflector.open_session(None).await;
    let (mut client, request) = connect_client(&reflector).await;

    let outcome = reflector
        .on_report(Report {
            id: request.id,
            port: 0,
            epoch: session.epoch,
            failed: true,
        })
        .await;
    assert_eq!(outcome, ReportOutcome::Failed);
    assert_closed(&mut client).await;
    assert_eq!(reflector.stats().await.pending_tunnels, 0);
}

#[tokio::test]
async fn report_for_unknown_tunnel_closes_data_connection() {
    let reflector = new_reflector(ReflectorConfig::default());
    let session = reflector.open_session(None).await;
    let (mut worker, port) = connect_worker_leg(&reflector).await;

    let outcome = reflector.on_report(report(41, port, session.epoch)).await;
    assert_eq!(outcome, ReportOutcome::UnknownTunnel);
    assert_closed(&mut worker).await;
    assert_eq!(reflector.stats().await.pending_connections, 0);
}

#[tokio::test]
async fn report_waits_for_late_data_connection() {
    let reflector = new_reflector(ReflectorConfig::default());
    let session = reflector.open_session(None).await;
    let (mut client, request) = connect_client(&reflector).await;

    let (worker, accepted) = tcp_pair().await;
    let addr = worker.local_addr().unwrap();
    let outcome = reflector
        .on_report(report(request.id, u32::from(addr.port()), session.epoch))
        .await;
    assert_eq!(outcome, ReportOutcome::Deferred);

    reflector.register_data_connection(accepted, addr).await;
    let mut worker = worker;
    assert_relays(&mut client, &mut worker, b"late but paired").await;
}

#[tokio::test]
async fn zero_grace_drops_unmatched_report() {
    let reflector = new_reflector(ReflectorConfig {
        report_grace: Duration::ZERO,
        ..ReflectorConfig::default()
    });
    let session = reflector.open_session(None).await;
    let (_client, request) = connect_client(&reflector).await;

    let outcome = reflector
        .on_report(report(request.id, 50000, session.epoch))
        .await;
    assert_eq!(outcome, ReportOutcome::UnknownPort);
    assert_eq!(reflector.stats().await.pending_tunnels, 1);
}

#[tokio::test]
async fn out_of_range_port_is_rejected() {
    let reflector = new_reflector(ReflectorConfig::default());
    let session = reflector.open_session(None).await;
    let outcome = reflector
        .on_report(report(0, 70_000, session.epoch))
        .await;
    assert_eq!(outcome, ReportOutcome::UnknownPort);
}

#[tokio::test]
async fn close_session_leaves_running_tunnels() {
    let reflector = new_reflector(ReflectorConfig::default());
    let session = reflector.open_session(None).await;
    let (mut client, request) = connect_client(&reflector).await;
    let (mut worker, port) = connect_worker_leg(&reflector).await;
    reflector
        .on_report(report(request.id, port, session.epoch))
        .await;

    assert!(reflector.close_session().await.is_some());
    assert!(reflector.close_session().await.is_none());
    assert_relays(&mut client, &mut worker, b"still flowing").await;
}

// ---------------------------------------------------------------------------
// Data connections and housekeeping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn data_connection_without_session_is_closed() {
    let reflector = new_reflector(ReflectorConfig::default());
    let (mut worker, _) = connect_worker_leg(&reflector).await;
    assert_closed(&mut worker).await;
    assert_eq!(reflector.stats().await.pending_connections, 0);
}

#[tokio::test]
async fn sweep_evicts_and_closes_expired_entries() {
    let reflector = new_reflector(ReflectorConfig {
        pending_ttl: Duration::ZERO,
        ..ReflectorConfig::default()
    });
    reflector.open_session(None).await;
    let (mut client, _) = connect_client(&reflector).await;
    let (mut worker, _) = connect_worker_leg(&reflector).await;

    assert_eq!(reflector.sweep_expired().await, (1, 1));
    assert_closed(&mut client).await;
    assert_closed(&mut worker).await;
}

#[tokio::test]
async fn full_queue_blocks_registration() {
    let reflector = new_reflector(ReflectorConfig {
        queue_depth: 2,
        ..ReflectorConfig::default()
    });
    reflector.open_session(None).await;
    let (_a, _) = connect_client(&reflector).await;
    let (_b, _) = connect_client(&reflector).await;

    let (_c, accepted) = tcp_pair().await;
    let blocked = {
        let reflector = Arc::clone(&reflector);
        tokio::spawn(async move { reflector.register_client(accepted).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!blocked.is_finished());

    let (_, stream) = reflector.create_request_stream().unwrap();
    tokio::pin!(stream);
    assert_eq!(stream.next().await.unwrap().id, 0);

    let request = timeout(Duration::from_secs(2), blocked)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(request.id, 2);
}

#[tokio::test]
async fn each_drained_request_admits_one_waiting_client() {
    let reflector = new_reflector(ReflectorConfig::default());
    let depth = reflector.config().queue_depth;
    assert_eq!(depth, 128);
    reflector.open_session(None).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut clients = Vec::with_capacity(depth + 2);
    for _ in 0..depth {
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        clients.push(client.unwrap());
        reflector.register_client(accepted.unwrap().0).await.unwrap();
    }
    assert_eq!(reflector.stats().await.queued_requests, depth);

    let mut waiting = Vec::new();
    for _ in 0..2 {
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        clients.push(client.unwrap());
        let accepted = accepted.unwrap().0;
        let reflector = Arc::clone(&reflector);
        waiting.push(tokio::spawn(async move { reflector.register_client(accepted).await }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(waiting.iter().all(|task| !task.is_finished()));

    let (_, stream) = reflector.create_request_stream().unwrap();
    tokio::pin!(stream);
    assert_eq!(stream.next().await.unwrap().id, 0);

    let one_done = async {
        while !waiting.iter().any(tokio::task::JoinHandle::is_finished) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_secs(2), one_done).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(waiting.iter().filter(|task| task.is_finished()).count(), 1);
    let stats = reflector.stats().await;
    assert_eq!(stats.queued_requests, depth);
    assert_eq!(stats.pending_tunnels, depth + 2);

    assert_eq!(stream.next().await.unwrap().id, 1);
    let mut ids = Vec::new();
    for task in waiting {
        let request = timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        ids.push(request.id);
    }
    ids.sort_unstable();
    assert_eq!(ids, [128, 129]);
}

#[tokio::test]
async fn accept_loop_waits_for_session() {
    let reflector = new_reflector(ReflectorConfig::default());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serve = {
        let reflector = Arc::clone(&reflector);
        tokio::spawn(async move { reflector.serve_clients(listener).await })
    };

    let _client = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(reflector.stats().await.pending_tunnels, 0);

    reflector.open_session(None).await;
    let registered = async {
        while reflector.stats().await.pending_tunnels == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    timeout(Duration::from_secs(2), registered).await.unwrap();
    serve.abort();
}
