//! End-to-end tests over real loopback TCP: a ConnectionManager on one
//! side, either the library client or a hand-driven frame client on the
//! other.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use fileshelf::client::{Client, ClientConfig, ClientSession};
use fileshelf::config::RetryPolicy;
use fileshelf::protocol::{Frame, Framer, TransferStatus};
use fileshelf::server::{AcceptStrategy, ConnectionManager, ServerConfig};
use fileshelf::tls::{generate_self_signed, ClientTls, ServerTls};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Find a base port such that `len` consecutive ports starting there are
/// currently bindable on loopback.
async fn reserve_range(len: u16) -> u16 {
    for _ in 0..50 {
        let probe = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let base = probe.local_addr().unwrap().port();
        drop(probe);

        if base.checked_add(len).is_none() {
            continue;
        }

        let mut all_free = true;
        for offset in 0..len {
            match TcpListener::bind(("127.0.0.1", base + offset)).await {
                Ok(listener) => drop(listener),
                Err(_) => {
                    all_free = false;
                    break;
                }
            }
        }
        if all_free {
            return base;
        }
    }
    panic!("could not reserve a free port range");
}

fn server_config(root: &Path, base: u16, max: u16, accept: AcceptStrategy) -> ServerConfig {
    ServerConfig {
        root_dir: root.to_path_buf(),
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        base_port: base,
        max_port: max,
        accept,
        tls: None,
        resend: RetryPolicy::unbounded(),
    }
}

fn client_config(port: u16, dest: &Path, retry: RetryPolicy) -> ClientConfig {
    ClientConfig {
        server_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        tls: None,
        dest_dir: dest.to_path_buf(),
        retry,
    }
}

/// Connect through the library client, retrying until the listener is up.
async fn connect_client(config: &ClientConfig) -> ClientSession {
    let client = Client::new(config.clone());
    for _ in 0..100 {
        match client.connect().await {
            Ok(session) => return session,
            Err(_) => tokio::time::sleep(Duration::from_millis(20)).await,
        }
    }
    panic!("server did not accept a session in time");
}

/// Raw TCP connect with the same listener-startup tolerance.
async fn raw_connect(addr: SocketAddr) -> TcpStream {
    for _ in 0..100 {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("could not connect to {addr}");
}

#[tokio::test]
async fn full_round_trip_over_escalating_ports() {
    init_tracing();

    let root = tempfile::tempdir().unwrap();
    let blob: Vec<u8> = (0..4096u32).map(|i| (i * 31 % 256) as u8).collect();
    std::fs::write(root.path().join("a.txt"), b"hello").unwrap();
    std::fs::write(root.path().join("blob.bin"), &blob).unwrap();
    std::fs::create_dir(root.path().join("sub")).unwrap();
    std::fs::write(root.path().join("sub").join("nested.txt"), b"deep").unwrap();

    let base = reserve_range(2).await;
    let manager = ConnectionManager::new(server_config(
        root.path(),
        base,
        base + 1,
        AcceptStrategy::Escalating,
    ));
    let handle = tokio::spawn(manager.run());

    let dest = tempfile::tempdir().unwrap();
    let mut session =
        connect_client(&client_config(base, dest.path(), RetryPolicy::unbounded())).await;

    // Catalog covers exactly the top-level regular files
    let mut names: Vec<_> = session
        .catalog()
        .entries
        .iter()
        .map(|e| (e.name.clone(), e.size))
        .collect();
    names.sort();
    assert_eq!(
        names,
        vec![("a.txt".to_string(), 5), ("blob.bin".to_string(), 4096)]
    );

    let path = session.fetch("a.txt").await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"hello");

    let path = session.fetch("blob.bin").await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), blob);

    session.close().await;
    handle.abort();
}

#[tokio::test]
async fn empty_root_yields_empty_catalog() {
    init_tracing();

    let root = tempfile::tempdir().unwrap();
    let base = reserve_range(1).await;
    let manager =
        ConnectionManager::new(server_config(root.path(), base, base, AcceptStrategy::Shared));
    let handle = tokio::spawn(manager.run());

    let dest = tempfile::tempdir().unwrap();
    let session =
        connect_client(&client_config(base, dest.path(), RetryPolicy::unbounded())).await;

    assert!(session.catalog().is_empty());

    session.close().await;
    handle.abort();
}

#[tokio::test]
async fn one_session_serves_many_cycles_then_range_exhausts() {
    init_tracing();

    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("one.txt"), b"first").unwrap();
    std::fs::write(root.path().join("two.txt"), b"second").unwrap();

    // A single-port range: one session, then the manager completes
    let base = reserve_range(1).await;
    let manager = ConnectionManager::new(server_config(
        root.path(),
        base,
        base,
        AcceptStrategy::Escalating,
    ));
    let handle = tokio::spawn(manager.run());

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), base);
    let mut stream = raw_connect(addr).await;

    let catalog = Framer::read_frame(&mut stream)
        .await
        .unwrap()
        .into_catalog()
        .unwrap();
    assert_eq!(catalog.len(), 2);

    for (name, contents) in [
        ("one.txt", b"first".as_slice()),
        ("two.txt", b"second".as_slice()),
    ] {
        Framer::write_frame(
            &mut stream,
            &Frame::Request {
                name: name.to_string(),
            },
        )
        .await
        .unwrap();

        let unit = Framer::read_frame(&mut stream)
            .await
            .unwrap()
            .into_unit()
            .unwrap();
        assert_eq!(unit.status, TransferStatus::Ok);
        assert_eq!(unit.payload, contents);

        Framer::write_frame(&mut stream, &Frame::Ack { ok: true })
            .await
            .unwrap();
    }
    drop(stream);

    // Exhausting the range is a normal completion, not an error
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn error_units_flow_until_client_closes_transport() {
    init_tracing();

    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("temp.txt"), b"soon gone").unwrap();

    let base = reserve_range(1).await;
    let manager = ConnectionManager::new(server_config(
        root.path(),
        base,
        base,
        AcceptStrategy::Escalating,
    ));
    let handle = tokio::spawn(manager.run());

    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), base);
    let mut stream = raw_connect(addr).await;

    let catalog = Framer::read_frame(&mut stream)
        .await
        .unwrap()
        .into_catalog()
        .unwrap();
    assert_eq!(catalog.entries[0].name, "temp.txt");

    // The file vanishes between catalog and request
    std::fs::remove_file(root.path().join("temp.txt")).unwrap();

    Framer::write_frame(
        &mut stream,
        &Frame::Request {
            name: "temp.txt".to_string(),
        },
    )
    .await
    .unwrap();

    // Every rejection draws a fresh error unit; the loop has no bound
    for _ in 0..3 {
        let unit = Framer::read_frame(&mut stream)
            .await
            .unwrap()
            .into_unit()
            .unwrap();
        assert_eq!(unit.status, TransferStatus::Error);
        assert!(unit.payload.is_empty());

        Framer::write_frame(&mut stream, &Frame::Ack { ok: false })
            .await
            .unwrap();
    }

    // Closing the transport is the only way to end the cycle
    drop(stream);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn fetch_converges_once_the_file_is_back() {
    init_tracing();

    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("a.txt"), b"original").unwrap();

    let base = reserve_range(1).await;
    let manager =
        ConnectionManager::new(server_config(root.path(), base, base, AcceptStrategy::Shared));
    let handle = tokio::spawn(manager.run());

    let dest = tempfile::tempdir().unwrap();
    let mut session =
        connect_client(&client_config(base, dest.path(), RetryPolicy::unbounded())).await;

    std::fs::remove_file(root.path().join("a.txt")).unwrap();

    // Restore the file shortly; until then the cycle loops on error units
    let root_path = root.path().to_path_buf();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(root_path.join("a.txt"), b"restored").unwrap();
    });

    let path = session.fetch("a.txt").await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"restored");

    session.close().await;
    handle.abort();
}

#[tokio::test]
async fn ports_escalate_in_order_and_sessions_stay_isolated() {
    init_tracing();

    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("data.txt"), b"payload").unwrap();

    let base = reserve_range(3).await;
    let manager = ConnectionManager::new(server_config(
        root.path(),
        base,
        base + 2,
        AcceptStrategy::Escalating,
    ));
    let handle = tokio::spawn(manager.run());

    // Session i lands on base + i, in connection order
    let mut first = raw_connect(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), base)).await;
    Framer::read_frame(&mut first).await.unwrap();

    let mut second =
        raw_connect(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), base + 1)).await;
    Framer::read_frame(&mut second).await.unwrap();

    let mut third = raw_connect(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), base + 2)).await;
    Framer::read_frame(&mut third).await.unwrap();

    // The range is spent: the accept loop has completed
    handle.await.unwrap().unwrap();

    // Kill the first session mid-stream; its neighbors must not notice
    drop(first);

    Framer::write_frame(
        &mut second,
        &Frame::Request {
            name: "data.txt".to_string(),
        },
    )
    .await
    .unwrap();
    let unit = Framer::read_frame(&mut second)
        .await
        .unwrap()
        .into_unit()
        .unwrap();
    assert_eq!(unit.payload, b"payload");
    Framer::write_frame(&mut second, &Frame::Ack { ok: true })
        .await
        .unwrap();

    drop(second);
    drop(third);

    // Every listener is gone: nothing accepts on the spent range
    let refused = TcpStream::connect(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), base)).await;
    assert!(refused.is_err());
}

#[tokio::test]
async fn failed_fetch_reconnects_and_adopts_the_new_catalog() {
    init_tracing();

    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("good.txt"), b"fine").unwrap();

    let base = reserve_range(1).await;
    let manager =
        ConnectionManager::new(server_config(root.path(), base, base, AcceptStrategy::Shared));
    let handle = tokio::spawn(manager.run());

    let dest = tempfile::tempdir().unwrap();
    let retry = RetryPolicy::limited(1, Duration::ZERO);
    let mut session = connect_client(&client_config(base, dest.path(), retry)).await;

    assert!(session.is_connected());
    assert!(!session
        .catalog()
        .entries
        .iter()
        .any(|e| e.name == "late.txt"));

    // A failed cycle costs the transport
    assert!(session.fetch("missing.txt").await.is_err());
    assert!(!session.is_connected());

    // The next fetch redials; the replacement session scans fresh state
    std::fs::write(root.path().join("late.txt"), b"appeared").unwrap();

    let path = session.fetch("good.txt").await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"fine");
    assert!(session.is_connected());
    assert!(session
        .catalog()
        .entries
        .iter()
        .any(|e| e.name == "late.txt"));

    session.close().await;
    handle.abort();
}

#[tokio::test]
async fn scan_failure_drops_the_connection_and_the_manager_advances() {
    init_tracing();

    let outer = tempfile::tempdir().unwrap();
    let root = outer.path().join("files");
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("a.txt"), b"here").unwrap();

    let base = reserve_range(2).await;
    let manager = ConnectionManager::new(server_config(
        &root,
        base,
        base + 1,
        AcceptStrategy::Escalating,
    ));
    let handle = tokio::spawn(manager.run());

    // With the root gone, the accepted connection is dropped before any
    // catalog is sent
    std::fs::remove_dir_all(&root).unwrap();

    let mut stream = raw_connect(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), base)).await;
    assert!(Framer::read_frame(&mut stream).await.is_err());
    drop(stream);

    // The accept loop advanced anyway; a restored root serves normally
    std::fs::create_dir(&root).unwrap();
    std::fs::write(root.join("a.txt"), b"back again").unwrap();

    let mut stream =
        raw_connect(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), base + 1)).await;
    let catalog = Framer::read_frame(&mut stream)
        .await
        .unwrap()
        .into_catalog()
        .unwrap();
    assert_eq!(catalog.entries[0].name, "a.txt");

    drop(stream);
    handle.await.unwrap().unwrap();
}

#[tokio::test]
async fn tls_session_round_trip() {
    init_tracing();

    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("secret.txt"), b"classified").unwrap();

    let identity = generate_self_signed(
        "localhost",
        &["localhost"],
        &["127.0.0.1".parse().unwrap()],
    )
    .unwrap();

    let base = reserve_range(1).await;
    let mut config = server_config(root.path(), base, base, AcceptStrategy::Shared);
    config.tls = Some(ServerTls::from_pem(&identity.cert_pem, &identity.key_pem).unwrap());
    let handle = tokio::spawn(ConnectionManager::new(config).run());

    let dest = tempfile::tempdir().unwrap();
    let mut client_cfg = client_config(base, dest.path(), RetryPolicy::unbounded());
    client_cfg.tls = Some(ClientTls::from_ca_pem(&identity.cert_pem, "localhost").unwrap());

    let mut session = connect_client(&client_cfg).await;
    assert_eq!(session.catalog().len(), 1);

    let path = session.fetch("secret.txt").await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), b"classified");

    session.close().await;
    handle.abort();
}
