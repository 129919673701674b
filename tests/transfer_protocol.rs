//! File-transfer client tests against an in-process mock server.
//!
//! The mock speaks the server half of the protocol: welcome on connect,
//! `GET`/`PUT`/`DEL`/`BYE` command handling, ephemeral data ports, and
//! the numeric error codes. It stores files in memory so round trips
//! can be asserted byte-for-byte.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use cinderbox::error::Error;
use cinderbox::transfer::{block_size, TransferClient, ACKNOW, RES_OK};

const WELCOME: &str = "HI\n0.1\n/root\nroot\n0";

type Store = Arc<Mutex<HashMap<String, Vec<u8>>>>;

/// Serve the control protocol until the client says BYE.
async fn run_mock_server(listener: TcpListener, store: Store) {
    loop {
        let (mut control, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(_) => return,
        };

        control.write_all(WELCOME.as_bytes()).await.unwrap();

        let mut buf = vec![0u8; 1024];
        let n = control.read(&mut buf).await.unwrap();
        if n == 0 {
            continue;
        }
        let command = String::from_utf8(buf[..n].to_vec()).unwrap();
        let fields: Vec<&str> = command.split('\n').collect();

        match fields[0] {
            "GET" => handle_get(&mut control, fields[1], &store).await,
            "PUT" => {
                let size: u64 = fields[2].parse().unwrap();
                handle_put(&mut control, fields[1], size, &store).await;
            }
            "DEL" => {
                let removed = store.lock().await.remove(fields[1]).is_some();
                let reply = if removed { RES_OK } else { "302 NOPE" };
                control.write_all(reply.as_bytes()).await.unwrap();
            }
            "BYE" => {
                control.write_all(RES_OK.as_bytes()).await.unwrap();
                return;
            }
            _ => {
                control.write_all(b"305 NO").await.unwrap();
            }
        }
    }
}

async fn handle_get(control: &mut TcpStream, name: &str, store: &Store) {
    let content = match store.lock().await.get(name).cloned() {
        Some(content) => content,
        None => {
            control.write_all(b"302 NOPE").await.unwrap();
            let mut ack = vec![0u8; 16];
            let _ = control.read(&mut ack).await;
            return;
        }
    };

    let data_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = data_listener.local_addr().unwrap().port();

    control
        .write_all(format!("{RES_OK}\n{port}\n{}", content.len()).as_bytes())
        .await
        .unwrap();

    let mut ack = vec![0u8; 16];
    let n = control.read(&mut ack).await.unwrap();
    assert_eq!(&ack[..n], ACKNOW);

    let (mut data, _) = data_listener.accept().await.unwrap();
    let bs = block_size(content.len() as u64);
    for chunk in content.chunks(bs) {
        data.write_all(chunk).await.unwrap();
    }
    data.shutdown().await.unwrap();
    drop(data);

    let n = control.read(&mut ack).await.unwrap();
    assert_eq!(&ack[..n], ACKNOW);
    control.write_all(RES_OK.as_bytes()).await.unwrap();
}

async fn handle_put(control: &mut TcpStream, name: &str, size: u64, store: &Store) {
    if store.lock().await.contains_key(name) {
        control.write_all(b"307 NO").await.unwrap();
        let mut ack = vec![0u8; 16];
        let _ = control.read(&mut ack).await;
        return;
    }

    let data_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = data_listener.local_addr().unwrap().port();

    control
        .write_all(format!("{RES_OK}\n{port}").as_bytes())
        .await
        .unwrap();

    let mut ack = vec![0u8; 16];
    let n = control.read(&mut ack).await.unwrap();
    assert_eq!(&ack[..n], ACKNOW);

    let (mut data, _) = data_listener.accept().await.unwrap();
    let mut content = Vec::new();
    let mut buf = vec![0u8; block_size(size)];
    while (content.len() as u64) < size {
        let n = data.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        content.extend_from_slice(&buf[..n]);
    }
    drop(data);

    assert_eq!(content.len() as u64, size, "declared size must match the wire");
    store.lock().await.insert(name.to_string(), content);
    control.write_all(RES_OK.as_bytes()).await.unwrap();
}

async fn start_mock() -> (TransferClient, Store, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let store: Store = Arc::new(Mutex::new(HashMap::new()));
    let server = tokio::spawn(run_mock_server(listener, Arc::clone(&store)));
    let client = TransferClient::new("127.0.0.1", port, "utf-8").unwrap();
    (client, store, server)
}

#[tokio::test]
async fn put_then_get_round_trips_bytes() {
    let (client, store, server) = start_mock().await;
    let dir = tempfile::tempdir().unwrap();

    let path = dir.path().join("sample.bin");
    let content: Vec<u8> = (0..13000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&path, &content).unwrap();
    let name = path.to_str().unwrap();

    client.put(name).await.unwrap();
    assert_eq!(store.lock().await.get(name).unwrap(), &content);

    std::fs::remove_file(&path).unwrap();
    client.get(name).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), content);

    client.bye().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn transfers_cover_every_block_size_boundary() {
    let (client, store, server) = start_mock().await;
    let dir = tempfile::tempdir().unwrap();

    for (i, size) in [0u64, 1, 1023, 1024, 4095, 4096, 8191, 8192, 16383, 16384, 100_000]
        .into_iter()
        .enumerate()
    {
        let path = dir.path().join(format!("f{i}"));
        let content: Vec<u8> = (0..size).map(|b| (b % 256) as u8).collect();
        std::fs::write(&path, &content).unwrap();
        let name = path.to_str().unwrap();

        client.put(name).await.unwrap();
        std::fs::remove_file(&path).unwrap();
        client.get(name).await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), content, "size {size}");
        assert_eq!(
            store.lock().await.get(name).unwrap().len() as u64,
            size,
            "declared size equals bytes on the wire"
        );
    }

    client.bye().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn put_of_existing_server_file_yields_307() {
    let (client, store, server) = start_mock().await;
    let dir = tempfile::tempdir().unwrap();

    let path = dir.path().join("dup.bin");
    std::fs::write(&path, b"contents").unwrap();
    let name = path.to_str().unwrap().to_string();

    store.lock().await.insert(name.clone(), b"older".to_vec());

    let err = client.put(&name).await.unwrap_err();
    match err {
        Error::TransferServer { code, message } => {
            assert_eq!(code, 307);
            assert_eq!(message, "File already exists on server");
        }
        other => panic!("expected a 307 server error, got {other:?}"),
    }
    // The server copy is untouched; no data channel was ever opened.
    assert_eq!(store.lock().await.get(&name).unwrap(), b"older");

    client.bye().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn get_of_missing_server_file_yields_302() {
    let (client, _store, server) = start_mock().await;
    let dir = tempfile::tempdir().unwrap();
    let name = dir.path().join("ghost.bin");

    let err = client.get(name.to_str().unwrap()).await.unwrap_err();
    assert!(matches!(err, Error::TransferServer { code: 302, .. }));
    assert!(!name.exists());

    client.bye().await.unwrap();
    server.await.unwrap();
}

#[tokio::test]
async fn get_refuses_to_overwrite_local_file() {
    // No server needed: the precondition fails before any connection.
    let client = TransferClient::new("127.0.0.1", 1, "utf-8").unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("present.bin");
    std::fs::write(&path, b"do not clobber").unwrap();

    let err = client.get(path.to_str().unwrap()).await.unwrap_err();
    assert!(matches!(err, Error::Io(ref e) if e.kind() == std::io::ErrorKind::AlreadyExists));
    assert_eq!(std::fs::read(&path).unwrap(), b"do not clobber");
}

#[tokio::test]
async fn put_requires_the_local_file() {
    let client = TransferClient::new("127.0.0.1", 1, "utf-8").unwrap();
    let err = client.put("/nonexistent/sample.bin").await.unwrap_err();
    assert!(matches!(err, Error::Io(ref e) if e.kind() == std::io::ErrorKind::NotFound));
}

#[tokio::test]
async fn delete_removes_the_server_copy() {
    let (client, store, server) = start_mock().await;

    store
        .lock()
        .await
        .insert("victim".to_string(), b"x".to_vec());
    client.delete("victim").await.unwrap();
    assert!(!store.lock().await.contains_key("victim"));

    let err = client.delete("victim").await.unwrap_err();
    assert!(matches!(err, Error::TransferServer { code: 302, .. }));

    client.bye().await.unwrap();
    server.await.unwrap();
}
