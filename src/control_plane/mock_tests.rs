use crate::control_plane::client::{V1_IDENTIFY, V1_TOKEN};
use crate::control_plane::ClientBuilder;
use crate::identity::Position;
use mockito::Matcher;
use tokio::runtime as rt;

#[test]
fn test_identify_success() {
    let response = r#"
{
  "agent_id": "agent-77",
  "token": "bearer-abc",
  "position": {"room": "lab-2", "x": 4, "y": 1, "room_id": "r-9"}
}
"#;
    let m_identify = mockito::mock("POST", Matcher::Exact(format!("/{}", V1_IDENTIFY)))
        .match_header("content-type", "application/json")
        .match_body(Matcher::PartialJsonString(
            r#"{"fingerprint": "fp-123"}"#.to_string(),
        ))
        .with_status(200)
        .with_body(response)
        .create();

    let runtime = rt::Runtime::new().unwrap();
    let client = ClientBuilder::new(mockito::server_url()).build().unwrap();
    let res = runtime.block_on(client.identify("fp-123", None)).unwrap();
    m_identify.assert();

    assert_eq!(res.agent_id, "agent-77");
    assert_eq!(res.token, "bearer-abc");
    assert_eq!(res.position.room, "lab-2");
}

#[test]
fn test_identify_sends_position() {
    let m_identify = mockito::mock("POST", Matcher::Exact(format!("/{}", V1_IDENTIFY)))
        .match_body(Matcher::PartialJsonString(
            r#"{"position": {"room": "lab-3"}}"#.to_string(),
        ))
        .with_status(200)
        .with_body(r#"{"agent_id": "agent-78", "token": "bearer-def"}"#)
        .create();

    let position = Position {
        room: "lab-3".to_string(),
        x: 0,
        y: 0,
        room_id: "r-3".to_string(),
    };
    let runtime = rt::Runtime::new().unwrap();
    let client = ClientBuilder::new(mockito::server_url()).build().unwrap();
    let res = runtime
        .block_on(client.identify("fp-456", Some(&position)))
        .unwrap();
    m_identify.assert();

    assert_eq!(res.agent_id, "agent-78");
    // The server did not echo a position back; it defaults.
    assert_eq!(res.position, Position::default());
}

#[test]
fn test_identify_rejection() {
    let m_identify = mockito::mock("POST", Matcher::Exact(format!("/{}", V1_IDENTIFY)))
        .with_status(403)
        .create();

    let runtime = rt::Runtime::new().unwrap();
    let client = ClientBuilder::new(mockito::server_url()).build().unwrap();
    runtime
        .block_on(client.identify("fp-123", None))
        .unwrap_err();
    m_identify.assert();
}

#[test]
fn test_token_refresh() {
    let m_token = mockito::mock("POST", Matcher::Exact(format!("/{}", V1_TOKEN)))
        .match_header("authorization", "Bearer stale-token")
        .match_body(Matcher::PartialJsonString(
            r#"{"agent_id": "agent-77"}"#.to_string(),
        ))
        .with_status(200)
        .with_body(r#"{"token": "fresh-token"}"#)
        .create();

    let runtime = rt::Runtime::new().unwrap();
    let client = ClientBuilder::new(mockito::server_url()).build().unwrap();
    let token = runtime
        .block_on(client.refresh_token("agent-77", "stale-token"))
        .unwrap();
    m_token.assert();

    assert_eq!(token, "fresh-token");
}

#[test]
fn test_download_streams_to_disk() {
    let payload = vec![0xabu8; 256 * 1024];
    let m_pkg = mockito::mock("GET", "/packages/outpost-2.0.0.pkg")
        .with_status(200)
        .with_body(&payload)
        .create();

    let tmpdir = tempfile::tempdir().unwrap();
    let dest = tmpdir.path().join("download").join("2.0.0.pkg");

    let runtime = rt::Runtime::new().unwrap();
    let client = ClientBuilder::new(mockito::server_url()).build().unwrap();
    let url = format!("{}/packages/outpost-2.0.0.pkg", mockito::server_url());
    let written = runtime.block_on(client.download(&url, &dest)).unwrap();
    m_pkg.assert();

    assert_eq!(written, payload.len() as u64);
    assert_eq!(std::fs::read(&dest).unwrap(), payload);
}

#[test]
fn test_download_http_error() {
    let m_pkg = mockito::mock("GET", "/packages/gone.pkg")
        .with_status(410)
        .create();

    let tmpdir = tempfile::tempdir().unwrap();
    let dest = tmpdir.path().join("gone.pkg");

    let runtime = rt::Runtime::new().unwrap();
    let client = ClientBuilder::new(mockito::server_url()).build().unwrap();
    let url = format!("{}/packages/gone.pkg", mockito::server_url());
    runtime.block_on(client.download(&url, &dest)).unwrap_err();
    m_pkg.assert();

    assert!(!dest.exists());
}
