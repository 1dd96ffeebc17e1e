use crate::*;

#[tokio::test]
async fn diverged_peer_is_repaired_from_host() {
    let host = start_host(Vec::new()).await;
    host.project.write("shared.rs", &pseudo_random(10_000, 11));
    host.project.engine.index_tree().await.unwrap();

    let a = join(&host).await;
    eventually("bootstrap", || a.project.read("shared.rs") == host.project.read("shared.rs")).await;

    // A local edit on `a` that never reaches the hub.
    a.project.write("shared.rs", b"offline rewrite");
    a.project.engine.submit_path("shared.rs").await.unwrap();

    let mut next = host.project.read("shared.rs").unwrap();
    next.extend_from_slice(b"\nfn appended() {}\n");
    host.edit("shared.rs", &next).await;

    eventually("host copy restored on a", || {
        a.project.read("shared.rs").as_deref() == Some(next.as_slice())
    })
    .await;
}

#[tokio::test]
async fn stale_peer_delta_is_not_relayed() {
    let host = start_host(Vec::new()).await;
    host.project.write("doc.md", b"version one\n");
    host.project.engine.index_tree().await.unwrap();

    let a = join(&host).await;
    let b = join(&host).await;
    eventually("bootstrap", || {
        a.project.read("doc.md").is_some() && b.project.read("doc.md").is_some()
    })
    .await;

    // The host moves on; `a` edits the old version before hearing about it.
    host.project.write("doc.md", b"version two from the host\n");
    host.project.engine.submit_path("doc.md").await.unwrap();

    a.edit("doc.md", b"version one, edited on a\n").await;

    eventually("a repaired to host copy", || {
        a.project.read("doc.md").as_deref() == Some(b"version two from the host\n".as_slice())
    })
    .await;
    assert_eq!(host.project.read("doc.md").as_deref(), Some(b"version two from the host\n".as_slice()));
    assert_eq!(b.project.read("doc.md").as_deref(), Some(b"version one\n".as_slice()));
}

#[tokio::test]
async fn restarted_host_keeps_manifests() {
    let host = start_host(Vec::new()).await;
    host.project.write("kept.txt", b"persisted across restarts");
    host.project.engine.index_tree().await.unwrap();
    let root = host.project.root.clone();
    let before = host.project.engine.manifest("kept.txt").await.unwrap();

    let fs = LocalFs::new(&root, vec![SNAPSHOT.into()]).unwrap();
    let reopened = SyncEngine::open(Arc::new(fs), params(), root.join(SNAPSHOT))
        .await
        .unwrap();
    let after = reopened.manifest("kept.txt").await.unwrap();
    assert_eq!(before, after);
    assert_eq!(reopened.index_tree().await.unwrap().changed, 0);
}
