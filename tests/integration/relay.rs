use crate::*;

/// Past the 16 MiB frame limit WebSocket libraries default to.
const LARGE_FILE: usize = 20 * 1024 * 1024;
const LARGE_SYNC_WAIT: Duration = Duration::from_secs(60);

#[tokio::test]
async fn new_file_on_one_peer_reaches_host_and_other_peer() {
    let host = start_host(Vec::new()).await;
    let a = join(&host).await;
    let b = join(&host).await;

    a.edit("notes/today.md", b"- ship the relay\n").await;

    eventually("host copy", || {
        host.project.read("notes/today.md").as_deref() == Some(b"- ship the relay\n".as_slice())
    })
    .await;
    eventually("peer b copy", || {
        b.project.read("notes/today.md").as_deref() == Some(b"- ship the relay\n".as_slice())
    })
    .await;
}

#[tokio::test]
async fn host_edit_reaches_every_peer() {
    let host = start_host(Vec::new()).await;
    let peers = [join(&host).await, join(&host).await, join(&host).await];

    host.edit("config.toml", b"answer = 42\n").await;

    for (i, peer) in peers.iter().enumerate() {
        eventually(&format!("peer {i} copy"), || {
            peer.project.read("config.toml").as_deref() == Some(b"answer = 42\n".as_slice())
        })
        .await;
    }
}

#[tokio::test]
async fn small_edit_in_large_file_ships_small_delta() {
    let host = start_host(Vec::new()).await;
    let original = pseudo_random(200_000, 7);
    host.project.write("big.bin", &original);
    host.project.engine.index_tree().await.unwrap();

    let a = join(&host).await;
    let b = join(&host).await;
    eventually("bootstrap", || {
        a.project.read("big.bin").as_deref() == Some(original.as_slice())
            && b.project.read("big.bin").as_deref() == Some(original.as_slice())
    })
    .await;

    let mut edited = original[..100_000].to_vec();
    edited.extend_from_slice(b"inserted in the middle");
    edited.extend_from_slice(&original[100_000..]);
    a.project.write("big.bin", &edited);
    let delta = a.project.engine.submit_path("big.bin").await.unwrap().unwrap();
    assert!(
        delta.payload_bytes() < (edited.len() / 10) as u64,
        "delta carried {} bytes",
        delta.payload_bytes()
    );
    assert!(!delta.moved.is_empty());
    a.deltas.send(delta).await.unwrap();

    eventually("edited copy on b", || {
        b.project.read("big.bin").as_deref() == Some(edited.as_slice())
    })
    .await;
    assert_eq!(host.project.read("big.bin").as_deref(), Some(edited.as_slice()));
}

#[tokio::test]
async fn consecutive_edits_apply_in_order() {
    let host = start_host(Vec::new()).await;
    let a = join(&host).await;
    let b = join(&host).await;

    let mut content = pseudo_random(30_000, 3);
    a.edit("log.txt", &content).await;
    for round in 0..5u8 {
        content.extend_from_slice(format!("round {round}\n").as_bytes());
        a.edit("log.txt", &content).await;
    }

    eventually("final revision on b", || {
        b.project.read("log.txt").as_deref() == Some(content.as_slice())
    })
    .await;
    let host_manifest = host.project.engine.manifest("log.txt").await.unwrap();
    let b_manifest = b.project.engine.manifest("log.txt").await.unwrap();
    assert_eq!(host_manifest.whole_checksum, b_manifest.whole_checksum);
}

#[tokio::test]
async fn file_past_default_frame_limit_syncs_both_ways() {
    let host = start_host(Vec::new()).await;
    let big = pseudo_random(LARGE_FILE, 17);
    host.project.write("assets/big.bin", &big);
    host.project.engine.index_tree().await.unwrap();

    let a = join(&host).await;
    eventually_within("large file bootstrap", LARGE_SYNC_WAIT, || {
        a.project.read("assets/big.bin").as_deref() == Some(big.as_slice())
    })
    .await;

    let other = pseudo_random(LARGE_FILE, 29);
    a.edit("assets/other.bin", &other).await;
    eventually_within("large peer file on host", LARGE_SYNC_WAIT, || {
        host.project.read("assets/other.bin").as_deref() == Some(other.as_slice())
    })
    .await;
    assert_eq!(host.hub.peer_count().await, 1);
    assert!(!a.task.is_finished());
}
