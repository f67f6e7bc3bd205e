use super::temp_db;
use crate::types::{SessionCounters, SessionId};

#[tokio::test]
async fn test_session_lifecycle() {
    let (db, _file) = temp_db().await;

    let id = db.open_session("reports").await.unwrap();
    let open = db.get_session(id).await.unwrap().unwrap();
    assert_eq!(open.site_name, "reports");
    assert!(open.ended_at.is_none());
    assert!(open.success.is_none());
    assert_eq!(db.open_sessions().await.unwrap().len(), 1);

    db.update_session_counters(
        id,
        &SessionCounters {
            links_found: 10,
            links_filtered_in: 4,
            ..Default::default()
        },
    )
    .await
    .unwrap();
    db.update_session_counters(
        id,
        &SessionCounters {
            downloads_succeeded: 3,
            downloads_failed: 1,
            bytes_downloaded: 4096,
            ..Default::default()
        },
    )
    .await
    .unwrap();

    db.close_session(id, true, None).await.unwrap();

    let closed = db.get_session(id).await.unwrap().unwrap();
    assert_eq!(closed.links_found, 10);
    assert_eq!(closed.links_filtered_in, 4);
    assert_eq!(closed.downloads_succeeded, 3);
    assert_eq!(closed.downloads_failed, 1);
    assert_eq!(closed.bytes_downloaded, 4096);
    assert!(closed.ended_at.is_some());
    assert_eq!(closed.success, Some(true));
    assert!(db.open_sessions().await.unwrap().is_empty());

    db.close().await;
}

#[tokio::test]
async fn test_close_session_twice_keeps_first_end_time() {
    let (db, _file) = temp_db().await;

    let id = db.open_session("reports").await.unwrap();
    db.close_session(id, false, Some("collector failed"))
        .await
        .unwrap();
    let first = db.get_session(id).await.unwrap().unwrap();

    db.close_session(id, false, Some("collector failed"))
        .await
        .unwrap();
    let second = db.get_session(id).await.unwrap().unwrap();

    assert_eq!(first.ended_at, second.ended_at);
    assert_eq!(second.error_message.as_deref(), Some("collector failed"));
    assert_eq!(second.success, Some(false));

    db.close().await;
}

#[tokio::test]
async fn test_unknown_session_is_not_found() {
    let (db, _file) = temp_db().await;

    let missing = SessionId(999);
    assert!(db.close_session(missing, true, None).await.is_err());
    assert!(
        db.update_session_counters(
            missing,
            &SessionCounters {
                links_found: 1,
                ..Default::default()
            }
        )
        .await
        .is_err()
    );
    assert!(db.get_session(missing).await.unwrap().is_none());

    db.close().await;
}

#[tokio::test]
async fn test_recent_sessions_filters_by_site() {
    let (db, _file) = temp_db().await;

    let a1 = db.open_session("a").await.unwrap();
    let _b = db.open_session("b").await.unwrap();
    let a2 = db.open_session("a").await.unwrap();

    let recent = db.recent_sessions(Some("a"), 10).await.unwrap();
    let ids: Vec<_> = recent.iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![a2, a1], "newest first, site b excluded");

    assert_eq!(db.recent_sessions(None, 10).await.unwrap().len(), 3);

    db.close().await;
}
