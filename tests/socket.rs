#![cfg(all(feature = "server", unix))]

use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pgpgate::api::{Action, ApiRequest, ApiResult, Collaborators, Gateway, ResultCode};
use pgpgate::config::GatewayConfig;
use pgpgate::error::ErrorCode;
use pgpgate::interaction::{InteractionKind, RequiredInput};
use pgpgate::server::client::GatewayClient;
use pgpgate::server::protocol::{InteractionRequest, InteractionResponse, WireUserInput};
use pgpgate::server::GatewayServer;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const MAIL: &str = "org.example.mail";

/// Start a gateway in `home` with this process installed as `MAIL`.
async fn start(home: &TempDir) -> PathBuf {
    let uid = std::fs::metadata(home.path()).unwrap().uid();
    std::fs::write(
        home.path().join("packages.toml"),
        format!(
            "[[package]]\nuid = {}\nname = \"{}\"\ncertificates = [\"abcd\"]\n",
            uid, MAIL
        ),
    )
    .unwrap();

    let config: GatewayConfig = toml::from_str(
        "[continuation]\nresume_wait_ms = 50\n\n[server]\nmax_frame_bytes = 4096\n",
    )
    .unwrap();
    let gateway = Arc::new(Gateway::new(Collaborators::local(home.path()), &config));
    let socket = home.path().join("pgpgate.sock");
    let server = GatewayServer::bind(&socket, gateway)
        .unwrap()
        .with_max_frame(config.server.max_frame_bytes);
    tokio::spawn(server.run());
    socket
}

#[tokio::test]
async fn registration_round_trip_over_socket() {
    let home = TempDir::new().unwrap();
    let socket = start(&home).await;
    let mut client = GatewayClient::connect(&socket).await.unwrap();

    let response = client
        .call(ApiRequest::new(Action::CheckPermission))
        .await
        .unwrap();
    assert_eq!(response.result_code, ResultCode::UserInteractionRequired);
    let continuation = response.continuation.unwrap();
    assert_eq!(continuation.kind, InteractionKind::CallerApproval);

    let described = client
        .interact(InteractionRequest::Describe {
            token: continuation.token,
        })
        .await
        .unwrap();
    let InteractionResponse::Pending(pending) = described else {
        panic!("expected a pending interaction, got {:?}", described);
    };
    assert_eq!(pending.package, MAIL);
    assert!(matches!(
        pending.required,
        Some(RequiredInput::Registration { ref package, .. }) if package == MAIL
    ));

    let completed = client
        .interact(InteractionRequest::Complete {
            token: continuation.token,
            input: WireUserInput::Approve,
        })
        .await
        .unwrap();
    assert_eq!(
        completed,
        InteractionResponse::Completed {
            token: continuation.token
        }
    );

    let response = client
        .call(ApiRequest::resume(continuation.token, Action::CheckPermission))
        .await
        .unwrap();
    assert_eq!(response.result_code, ResultCode::Success);
    assert_eq!(response.result, Some(ApiResult::Permitted));

    let apps = std::fs::read_to_string(home.path().join("apps.toml")).unwrap();
    assert!(apps.contains(MAIL));
}

#[tokio::test]
async fn denied_registration_is_an_error() {
    let home = TempDir::new().unwrap();
    let socket = start(&home).await;
    let mut client = GatewayClient::connect(&socket).await.unwrap();

    let response = client
        .call(ApiRequest::new(Action::CheckPermission))
        .await
        .unwrap();
    let token = response.continuation.unwrap().token;

    let denied = client
        .interact(InteractionRequest::Complete {
            token,
            input: WireUserInput::Deny,
        })
        .await
        .unwrap();
    assert!(matches!(denied, InteractionResponse::Failed(ref body) if body.code == ErrorCode::Cancelled));

    let response = client
        .call(ApiRequest::resume(token, Action::CheckPermission))
        .await
        .unwrap();
    assert_eq!(response.result_code, ResultCode::Error);
    assert_eq!(
        response.error.unwrap().code,
        ErrorCode::ContinuationNotFound
    );
}

#[tokio::test]
async fn cancel_reports_whether_call_existed() {
    let home = TempDir::new().unwrap();
    let socket = start(&home).await;
    let mut client = GatewayClient::connect(&socket).await.unwrap();

    let response = client
        .call(ApiRequest::new(Action::CheckPermission))
        .await
        .unwrap();
    let token = response.continuation.unwrap().token;

    let first = client
        .interact(InteractionRequest::Cancel { token })
        .await
        .unwrap();
    assert_eq!(first, InteractionResponse::Cancelled { existed: true });
    let second = client
        .interact(InteractionRequest::Cancel { token })
        .await
        .unwrap();
    assert_eq!(second, InteractionResponse::Cancelled { existed: false });
}

#[tokio::test]
async fn malformed_frame_gets_error_envelope() {
    let home = TempDir::new().unwrap();
    let socket = start(&home).await;
    let stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer.write_all(b"{\"api\":{\"action\":\"launch_missiles\"}}\n").await.unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    let envelope: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(envelope["result_code"], "ERROR");
    assert_eq!(envelope["error"]["code"], "unsupported_action");

    // The connection stays usable.
    writer
        .write_all(b"{\"api\":{\"action\":\"check_permission\"}}\n")
        .await
        .unwrap();
    let reply = lines.next_line().await.unwrap().unwrap();
    let envelope: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(envelope["result_code"], "USER_INTERACTION_REQUIRED");
}

#[tokio::test]
async fn oversized_frame_drops_the_connection() {
    let home = TempDir::new().unwrap();
    let socket = start(&home).await;
    let stream = tokio::net::UnixStream::connect(&socket).await.unwrap();
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    // No newline: the server must give up without waiting for one.
    writer.write_all(&[b'a'; 8192]).await.unwrap();

    let reply = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("reply before the line ends")
        .unwrap()
        .unwrap();
    let envelope: serde_json::Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(envelope["error"]["code"], "unsupported_action");

    let after = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
        .await
        .expect("connection closed");
    assert!(!matches!(after, Ok(Some(_))));
}

#[tokio::test]
async fn unknown_caller_is_refused() {
    let home = TempDir::new().unwrap();
    let socket = start(&home).await;
    std::fs::write(home.path().join("packages.toml"), "").unwrap();
    let mut client = GatewayClient::connect(&socket).await.unwrap();

    let response = client
        .call(ApiRequest::new(Action::CheckPermission))
        .await
        .unwrap();
    assert_eq!(response.result_code, ResultCode::Error);
    assert_eq!(response.error.unwrap().code, ErrorCode::NoPermission);
}
