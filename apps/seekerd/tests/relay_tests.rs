//! Relay plane integration tests: agent channels, file push, share-index
//! upload, and the credential binding between them.

mod common;

use bytes::BytesMut;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use uuid::Uuid;

use common::{
    multipart_body, multipart_content_type, BodyPart, TestApp, AGENT_NAME, AGENT_SECRET,
};
use seekerd::config::{Options, OptionsStore};
use seekerd::error::AppError;
use seekerd::services::relay::{credential, wire};
use seekerd::services::shares::{FileLocation, ShareService};
use seekerd::services::transfers::{CompletionReason, TransferDirection, TransferState};
use seekerd::state::{DaemonState, StateStore};

/// Perform the agent half of the channel handshake.
async fn connect_agent(addr: std::net::SocketAddr) -> (TcpStream, BytesMut) {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    let mut buffer = BytesMut::new();

    let challenge = wire::read_frame(&mut socket, &mut buffer).await.unwrap();
    let Some(wire::RelayMessage::Challenge { token }) = challenge else {
        panic!("expected challenge");
    };
    let proof = credential::sign(AGENT_SECRET, &[&token, AGENT_NAME]);
    wire::write_frame(
        &mut socket,
        &wire::RelayMessage::Hello {
            agent: AGENT_NAME.to_string(),
            proof: proof.clone(),
        },
    )
    .await
    .unwrap();
    let welcome = wire::read_frame(&mut socket, &mut buffer).await.unwrap();
    let Some(wire::RelayMessage::Welcome { proof: controller_proof }) = welcome else {
        panic!("expected welcome");
    };
    assert!(credential::verify(AGENT_SECRET, &[&proof], &controller_proof));

    (socket, buffer)
}

async fn await_agent_connected(app: &TestApp) {
    let hub = app.hub.as_ref().unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        while !hub.is_connected(AGENT_NAME) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("agent never registered");
}

/// Build an agent-side share slice database holding `album/01.mp3`.
async fn agent_slice_database(dir: &tempfile::TempDir) -> (std::path::PathBuf, Vec<u8>) {
    let root = dir.path().join("music");
    std::fs::create_dir_all(root.join("album")).unwrap();
    let body = vec![42u8; 4096];
    std::fs::write(root.join("album/01.mp3"), &body).unwrap();

    let mut options = Options::default();
    options.shares.directories = vec![root];
    let options = OptionsStore::new_shared(options);
    let state = StateStore::new_shared(DaemonState::default());
    let shares = ShareService::new(options, state);
    shares.fill().await.unwrap();

    let db_path = dir.path().join("slice.db");
    shares.serialize_local(&db_path).await.unwrap();
    (db_path, body)
}

#[tokio::test]
async fn test_file_push_happy_path() {
    let app = TestApp::controller(|_| {}).await;
    let (mut socket, mut buffer) = connect_agent(app.relay_addr.unwrap()).await;
    await_agent_connected(&app).await;

    let hub = Arc::clone(app.hub.as_ref().unwrap());
    let consumer = tokio::spawn(async move {
        let mut relay_file = hub.request_file(AGENT_NAME, "music\\album\\01.mp3").await?;
        let mut body = Vec::new();
        relay_file
            .stream
            .read_to_end(&mut body)
            .await
            .map_err(|e| AppError::TransportFailure(e.to_string()))?;
        Ok::<Vec<u8>, AppError>(body)
    });

    let frame = wire::read_frame(&mut socket, &mut buffer).await.unwrap();
    let Some(wire::RelayMessage::RequestFile { id, filename }) = frame else {
        panic!("expected request_file frame");
    };
    assert_eq!(filename, "music\\album\\01.mp3");

    let content = vec![7u8; 64 * 1024];
    let presented = credential::file_credential(AGENT_SECRET, id, AGENT_NAME, &filename);
    let body = multipart_body(&[
        BodyPart::text("credential", presented),
        BodyPart::file("file", "01.mp3", content.clone()),
    ]);

    let response = app
        .server
        .post(&format!("/api/v0/network/files/{}/{}", AGENT_NAME, id))
        .content_type(&multipart_content_type())
        .bytes(body.into())
        .await;
    response.assert_status_ok();

    let reply: serde_json::Value = response.json();
    assert_eq!(reply["bytes"], serde_json::json!(content.len()));

    let received = consumer.await.unwrap().unwrap();
    assert_eq!(received, content);
}

#[tokio::test]
async fn test_credential_from_wrong_id_is_unauthorized() {
    let app = TestApp::controller(|_| {}).await;
    let (mut socket, mut buffer) = connect_agent(app.relay_addr.unwrap()).await;
    await_agent_connected(&app).await;

    let hub = Arc::clone(app.hub.as_ref().unwrap());
    let consumer =
        tokio::spawn(async move { hub.request_file(AGENT_NAME, "music\\album\\01.mp3").await });

    let frame = wire::read_frame(&mut socket, &mut buffer).await.unwrap();
    let Some(wire::RelayMessage::RequestFile { id, filename }) = frame else {
        panic!("expected request_file frame");
    };

    // Credential derived from a different id.
    let presented =
        credential::file_credential(AGENT_SECRET, Uuid::new_v4(), AGENT_NAME, &filename);
    let body = multipart_body(&[
        BodyPart::text("credential", presented),
        BodyPart::file("file", "01.mp3", vec![1u8; 128]),
    ]);

    let response = app
        .server
        .post(&format!("/api/v0/network/files/{}/{}", AGENT_NAME, id))
        .content_type(&multipart_content_type())
        .bytes(body.into())
        .await;
    response.assert_status_unauthorized();

    // The pending upload fails too; no bytes were observed.
    let upload_side = consumer.await.unwrap();
    assert!(matches!(upload_side, Err(AppError::Unauthorized)));
}

#[tokio::test]
async fn test_unknown_request_id_is_not_found() {
    let app = TestApp::controller(|_| {}).await;
    let (_socket, _buffer) = connect_agent(app.relay_addr.unwrap()).await;
    await_agent_connected(&app).await;

    let id = Uuid::new_v4();
    let presented = credential::file_credential(AGENT_SECRET, id, AGENT_NAME, "whatever");
    let body = multipart_body(&[
        BodyPart::text("credential", presented),
        BodyPart::file("file", "x", vec![0u8; 16]),
    ]);

    let response = app
        .server
        .post(&format!("/api/v0/network/files/{}/{}", AGENT_NAME, id))
        .content_type(&multipart_content_type())
        .bytes(body.into())
        .await;
    response.assert_status_not_found();
}

#[tokio::test]
async fn test_share_index_upload_replaces_slice() {
    let app = TestApp::controller(|_| {}).await;
    let staging = tempfile::TempDir::new().unwrap();
    let (db_path, _) = agent_slice_database(&staging).await;

    let id = Uuid::new_v4();
    let presented = credential::share_credential(AGENT_SECRET, id, AGENT_NAME);
    let database = std::fs::read(&db_path).unwrap();
    let body = multipart_body(&[
        BodyPart::text("credential", presented),
        BodyPart::text(
            "shares",
            format!(r#"{{"host":"{}","masks":["music"]}}"#, AGENT_NAME),
        ),
        BodyPart::file("database", "shares.db", database),
    ]);

    let response = app
        .server
        .post(&format!("/api/v0/network/shares/{}/{}", AGENT_NAME, id))
        .content_type(&multipart_content_type())
        .bytes(body.into())
        .await;
    response.assert_status_ok();

    let reply: serde_json::Value = response.json();
    assert_eq!(reply["files"], serde_json::json!(1));

    // The agent's files are now searchable and locate to the agent.
    let results = app.shares.search("album").await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].host, AGENT_NAME);
    assert_eq!(
        app.shares.locate(&results[0].masked_path).await.unwrap(),
        FileLocation::Remote {
            host: AGENT_NAME.to_string()
        }
    );
}

#[tokio::test]
async fn test_share_index_upload_with_bad_credential_is_unauthorized() {
    let app = TestApp::controller(|_| {}).await;
    let staging = tempfile::TempDir::new().unwrap();
    let (db_path, _) = agent_slice_database(&staging).await;

    let id = Uuid::new_v4();
    let body = multipart_body(&[
        BodyPart::text(
            "credential",
            credential::share_credential("wrong-secret", id, AGENT_NAME),
        ),
        BodyPart::file("database", "shares.db", std::fs::read(&db_path).unwrap()),
    ]);

    let response = app
        .server
        .post(&format!("/api/v0/network/shares/{}/{}", AGENT_NAME, id))
        .content_type(&multipart_content_type())
        .bytes(body.into())
        .await;
    response.assert_status_unauthorized();
    assert!(app.shares.search("album").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_relay_timeout_fails_upload_as_timed_out() {
    let app = TestApp::controller(|options| {
        options.relay.file_timeout_ms = 150;
    })
    .await;
    let staging = tempfile::TempDir::new().unwrap();
    let (db_path, _) = agent_slice_database(&staging).await;

    // Install the agent slice, then connect an agent that never answers.
    let id = Uuid::new_v4();
    let presented = credential::share_credential(AGENT_SECRET, id, AGENT_NAME);
    let body = multipart_body(&[
        BodyPart::text("credential", presented),
        BodyPart::file("database", "shares.db", std::fs::read(&db_path).unwrap()),
    ]);
    app.server
        .post(&format!("/api/v0/network/shares/{}/{}", AGENT_NAME, id))
        .content_type(&multipart_content_type())
        .bytes(body.into())
        .await
        .assert_status_ok();

    let (_socket, _buffer) = connect_agent(app.relay_addr.unwrap()).await;
    await_agent_connected(&app).await;

    let masked = app.shares.search("album").await.unwrap()[0]
        .masked_path
        .clone();
    app.orchestrator
        .enqueue_upload("peer", &masked)
        .await
        .unwrap();

    let record_id = app
        .orchestrator
        .list(TransferDirection::Upload, false)
        .await
        .unwrap()[0]
        .id;

    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let record = app.orchestrator.get(record_id).await.unwrap().unwrap();
            if record.state == TransferState::Completed(CompletionReason::TimedOut) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("upload never timed out");
}
