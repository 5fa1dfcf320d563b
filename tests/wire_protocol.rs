//! End-to-end test of the binary wire protocol over a real TCP socket:
//! connect, issue a CREATE, read it back, and confirm an unauthorized
//! request comes back as an `Unauthorized` error rather than silently
//! succeeding.

use std::sync::Arc;

use nexadb::auth::store::CredentialStore;
use nexadb::auth::user::Role;
use nexadb::config::{IndexConfig, NetworkConfig, SecurityConfig, StorageConfig};
use nexadb::document::database::Catalog;
use nexadb::document::value::{Document, Value};
use nexadb::protocol::codec::{decode_payload, encode_payload, read_frame, write_frame};
use nexadb::protocol::frame::MessageType;
use nexadb::protocol::message::*;
use nexadb::protocol::Server;
use nexadb::storage::StorageEngine;
use tempfile::tempdir;
use tokio::net::TcpStream;
use tokio::time::Duration;

async fn spawn_server(dir: &std::path::Path, port: u16) -> Arc<StorageEngine> {
    let engine = StorageEngine::open(StorageConfig {
        data_dir: dir.to_path_buf(),
        ..StorageConfig::default()
    })
    .unwrap();
    let catalog = Arc::new(Catalog::open(engine.clone(), IndexConfig::default(), dir.join("hnsw")).unwrap());
    let credentials = Arc::new(
        CredentialStore::open(
            engine.clone(),
            &SecurityConfig {
                root_password_initial: Some("root-pw".to_string()),
                pbkdf2_iterations: 1000,
            },
        )
        .unwrap(),
    );
    let network = NetworkConfig {
        bind_host: "127.0.0.1".to_string(),
        bind_port: port,
        ..NetworkConfig::default()
    };
    let server = Server::new(network, catalog, credentials);
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    engine
}

async fn roundtrip<Req: serde::Serialize, Resp: serde::de::DeserializeOwned>(
    stream: &mut TcpStream,
    message_type: MessageType,
    request: &Req,
) -> (MessageType, Result<Resp, ()>) {
    let payload = encode_payload(request).unwrap();
    write_frame(stream, message_type, &payload).await.unwrap();
    let (response_type, body) = read_frame(stream).await.unwrap();
    let decoded = decode_payload::<Resp>(&body).map_err(|_| ());
    (response_type, decoded)
}

#[tokio::test]
async fn connect_create_read_over_tcp() {
    let dir = tempdir().unwrap();
    let _engine = spawn_server(dir.path(), 16970).await;
    let mut stream = TcpStream::connect("127.0.0.1:16970").await.unwrap();

    let connect = ConnectRequest {
        username: Some("root".to_string()),
        password: Some("root-pw".to_string()),
        api_key: None,
    };
    let (mt, _): (MessageType, Result<UserSummaryWire, ()>) =
        roundtrip(&mut stream, MessageType::Connect, &connect).await;
    assert_eq!(mt, MessageType::Success);

    let mut doc = Document::new();
    doc.set("name", Value::String("Alice".to_string()));
    let create = CreateRequest {
        database: "default".to_string(),
        collection: "users".to_string(),
        document: doc,
    };
    let (mt, body): (MessageType, Result<Document, ()>) = roundtrip(&mut stream, MessageType::Create, &create).await;
    assert_eq!(mt, MessageType::Success);
    let created = body.unwrap();
    let id = created.get("_id").unwrap().as_str().unwrap().to_string();

    let read = ReadRequest {
        database: "default".to_string(),
        collection: "users".to_string(),
        doc_id: id,
    };
    let (mt, body): (MessageType, Result<Document, ()>) = roundtrip(&mut stream, MessageType::Read, &read).await;
    assert_eq!(mt, MessageType::Success);
    assert_eq!(body.unwrap().get("name"), Some(&Value::String("Alice".to_string())));
}

#[tokio::test]
async fn unauthorized_write_is_rejected_over_tcp() {
    let dir = tempdir().unwrap();
    let _engine = spawn_server(dir.path(), 16971).await;
    let mut stream = TcpStream::connect("127.0.0.1:16971").await.unwrap();

    let connect = ConnectRequest {
        username: Some("root".to_string()),
        password: Some("root-pw".to_string()),
        api_key: None,
    };
    roundtrip::<_, UserSummaryWire>(&mut stream, MessageType::Connect, &connect).await;

    let create_user = CreateUserRequest {
        username: "guest_user".to_string(),
        password: "pw".to_string(),
        role: Role::Guest,
        database_permissions: Default::default(),
    };
    let (mt, _): (MessageType, Result<UserSummaryWire, ()>) =
        roundtrip(&mut stream, MessageType::CreateUser, &create_user).await;
    assert_eq!(mt, MessageType::Success);

    let mut guest_stream = TcpStream::connect("127.0.0.1:16971").await.unwrap();
    let connect_guest = ConnectRequest {
        username: Some("guest_user".to_string()),
        password: Some("pw".to_string()),
        api_key: None,
    };
    let (mt, _): (MessageType, Result<UserSummaryWire, ()>) =
        roundtrip(&mut guest_stream, MessageType::Connect, &connect_guest).await;
    assert_eq!(mt, MessageType::Success);

    let mut doc = Document::new();
    doc.set("x", Value::Int(1));
    let create = CreateRequest {
        database: "default".to_string(),
        collection: "things".to_string(),
        document: doc,
    };
    let (mt, body): (MessageType, Result<ErrorBody, ()>) =
        roundtrip(&mut guest_stream, MessageType::Create, &create).await;
    assert_eq!(mt, MessageType::Error);
    assert_eq!(body.unwrap().code, "Unauthorized");
}

#[tokio::test]
async fn ping_pong_and_malformed_magic_closes_connection() {
    let dir = tempdir().unwrap();
    let _engine = spawn_server(dir.path(), 16972).await;
    let mut stream = TcpStream::connect("127.0.0.1:16972").await.unwrap();

    let connect = ConnectRequest {
        username: Some("root".to_string()),
        password: Some("root-pw".to_string()),
        api_key: None,
    };
    roundtrip::<_, UserSummaryWire>(&mut stream, MessageType::Connect, &connect).await;

    let (mt, _): (MessageType, Result<Document, ()>) =
        roundtrip(&mut stream, MessageType::Ping, &PingRequest::default()).await;
    assert_eq!(mt, MessageType::Pong);

    use tokio::io::AsyncWriteExt;
    let mut bad_header = [0u8; 12];
    bad_header[0..4].copy_from_slice(&0xDEAD_BEEFu32.to_be_bytes());
    stream.write_all(&bad_header).await.unwrap();

    // The server writes a best-effort ERROR frame for the bad-magic
    // frame, then closes the connection.
    let (mt, body) = read_frame(&mut stream).await.unwrap();
    assert_eq!(mt, MessageType::Error);
    let err: ErrorBody = decode_payload(&body).unwrap();
    assert_eq!(err.code, "BadMagic");

    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 1];
    let n = stream.read(&mut buf).await.unwrap_or(0);
    assert_eq!(n, 0);
}

/// A local placeholder type for responses this test doesn't inspect but
/// still needs to decode to confirm `Success`.
#[derive(serde::Deserialize)]
struct UserSummaryWire {
    #[allow(dead_code)]
    username: String,
    #[allow(dead_code)]
    role: Role,
}
