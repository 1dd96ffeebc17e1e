use crate::*;

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

#[tokio::test]
async fn peer_bootstraps_from_host() {
    let host = start_host(Vec::new()).await;
    host.project.write("README.md", b"# project\n");
    host.project.write("src/main.rs", &pseudo_random(20_000, 1));
    host.project.engine.index_tree().await.unwrap();

    let peer = join(&host).await;
    eventually("bootstrap files", || {
        peer.project.read("README.md").as_deref() == Some(b"# project\n".as_slice())
            && peer.project.read("src/main.rs") == host.project.read("src/main.rs")
    })
    .await;
    assert_eq!(peer.project.engine.tracked_files().await, 2);
}

#[tokio::test]
async fn bad_token_is_closed_without_data() {
    let host = start_host(Vec::new()).await;
    host.project.write("secret.txt", b"not for strangers");
    host.project.engine.index_tree().await.unwrap();

    let (mut ws, _) = tokio_tungstenite::connect_async(host.url.as_str()).await.unwrap();
    ws.send(Message::Text("made-up-token".into())).await.unwrap();

    let next = tokio::time::timeout(Duration::from_secs(3), ws.next())
        .await
        .expect("hub did not close the connection");
    match next {
        None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {}
        Some(Ok(other)) => panic!("unexpected message {other:?}"),
    }
    assert_eq!(host.hub.peer_count().await, 0);
}

#[tokio::test]
async fn disallowed_origin_is_refused() {
    let host = start_host(vec!["https://ide.example".into()]).await;

    let mut request = host.url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", "https://elsewhere.example".parse().unwrap());
    assert!(tokio_tungstenite::connect_async(request).await.is_err());

    let mut request = host.url.as_str().into_client_request().unwrap();
    request
        .headers_mut()
        .insert("origin", "https://ide.example".parse().unwrap());
    assert!(tokio_tungstenite::connect_async(request).await.is_ok());
}

#[tokio::test]
async fn otp_admits_exactly_one_peer() {
    let host = start_host(Vec::new()).await;
    let otp = host.tokens.issue_otp();

    let (mut first, _) = tokio_tungstenite::connect_async(host.url.as_str()).await.unwrap();
    first.send(Message::Text(otp.clone().into())).await.unwrap();
    wait_for_peers(&host.hub, 1).await;

    let (mut second, _) = tokio_tungstenite::connect_async(host.url.as_str()).await.unwrap();
    second.send(Message::Text(otp.into())).await.unwrap();
    let next = tokio::time::timeout(Duration::from_secs(3), second.next())
        .await
        .expect("hub did not close the reused-token connection");
    assert!(!matches!(next, Some(Ok(Message::Binary(_)))));
    assert_eq!(host.hub.peer_count().await, 1);
}

#[tokio::test]
async fn peer_leaving_is_unregistered() {
    let host = start_host(Vec::new()).await;
    let peer = join(&host).await;
    drop(peer);
    wait_for_peers(&host.hub, 0).await;
}
