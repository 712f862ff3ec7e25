mod common;

use common::{image, manager, ScriptedBackend};
use samstudio_core::{AnnotationId, Error, Geometry, Point};
use samstudio_session::{Comment, Operation, Session, SessionManager, ThreadStatus};
use std::sync::Arc;

fn square(at: f32) -> Geometry {
    Geometry::polygon(vec![
        Point::new(at, at),
        Point::new(at + 8.0, at),
        Point::new(at + 8.0, at + 8.0),
        Point::new(at, at + 8.0),
    ])
}

async fn open() -> (SessionManager, Session) {
    let manager = manager(Arc::new(ScriptedBackend::new("sam-b")), 4);
    let session = manager.open(image("review")).await.unwrap();
    (manager, session)
}

#[tokio::test]
async fn test_one_open_thread_per_annotation() {
    let (_manager, session) = open().await;
    let a = session.apply(Operation::manual("cell", square(4.0))).await.unwrap();

    let first = session
        .open_thread(a.id, Comment::new("reviewer", "boundary too loose"))
        .await
        .unwrap();
    assert_eq!(first.status, ThreadStatus::Open);

    let err = session
        .open_thread(a.id, Comment::new("reviewer", "again"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ThreadAlreadyOpen(id) if id == a.id));
    assert!(err.is_policy_rejection());

    let resolved = session.resolve_thread(first.id).await.unwrap();
    assert_eq!(resolved.status, ThreadStatus::Resolved);
    assert!(resolved.resolved_at.is_some());

    let second = session
        .open_thread(a.id, Comment::new("reviewer", "regressed"))
        .await
        .unwrap();
    assert_ne!(second.id, first.id);

    let threads = session.threads_for(a.id).await.unwrap();
    let ids: Vec<_> = threads.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
}

#[tokio::test]
async fn test_resolved_thread_rejects_comments() {
    let (_manager, session) = open().await;
    let a = session.apply(Operation::manual("cell", square(4.0))).await.unwrap();
    let thread = session
        .open_thread(a.id, Comment::new("reviewer", "label?"))
        .await
        .unwrap();

    let thread = session
        .add_comment(thread.id, Comment::new("annotator", "it is a cell"))
        .await
        .unwrap();
    assert_eq!(thread.comments.len(), 2);
    assert_eq!(thread.comments[1].author, "annotator");

    session.resolve_thread(thread.id).await.unwrap();
    // Resolving twice is a no-op
    session.resolve_thread(thread.id).await.unwrap();

    let err = session
        .add_comment(thread.id, Comment::new("annotator", "late"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ThreadResolved(id) if id == thread.id));
    assert_eq!(session.thread(thread.id).await.unwrap().comments.len(), 2);
}

#[tokio::test]
async fn test_threads_survive_annotation_deletion() {
    let (_manager, session) = open().await;
    let a = session.apply(Operation::manual("cell", square(4.0))).await.unwrap();
    let thread = session
        .open_thread(a.id, Comment::new("reviewer", "duplicate?"))
        .await
        .unwrap();

    session.delete(a.id).await.unwrap();
    assert!(session.annotations().await.unwrap().is_empty());

    // Still addressable by thread id and by annotation id
    let kept = session.thread(thread.id).await.unwrap();
    assert_eq!(kept.annotation_id, a.id);
    assert_eq!(session.threads_for(a.id).await.unwrap().len(), 1);

    // Discussion can continue on a deleted annotation
    let kept = session
        .add_comment(thread.id, Comment::new("annotator", "removed it"))
        .await
        .unwrap();
    assert_eq!(kept.comments.len(), 2);

    // New threads need a live annotation
    let err = session
        .open_thread(a.id, Comment::new("reviewer", "another"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownAnnotation(_)));

    session.restore(a.id).await.unwrap();
    assert!(session.thread(thread.id).await.unwrap().is_open());
}

#[tokio::test]
async fn test_undoing_create_keeps_thread() {
    let (_manager, session) = open().await;
    let a = session.apply(Operation::manual("cell", square(10.0))).await.unwrap();
    let thread = session
        .open_thread(a.id, Comment::new("reviewer", "wrong class"))
        .await
        .unwrap();

    session.undo().await.unwrap();
    assert!(matches!(
        session.annotation(a.id).await,
        Err(Error::UnknownAnnotation(_))
    ));
    assert_eq!(session.thread(thread.id).await.unwrap().annotation_id, a.id);

    session.redo().await.unwrap();
    assert_eq!(session.annotation(a.id).await.unwrap().label, "cell");
    assert_eq!(session.threads_for(a.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_thread_and_annotation() {
    let (_manager, session) = open().await;
    let err = session
        .open_thread(AnnotationId(42), Comment::new("reviewer", "?"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownAnnotation(AnnotationId(42))));

    let missing = samstudio_core::ThreadId::new();
    assert!(matches!(
        session.thread(missing).await,
        Err(Error::UnknownThread(_))
    ));
    assert!(matches!(
        session.add_comment(missing, Comment::new("a", "b")).await,
        Err(Error::UnknownThread(_))
    ));
}

#[tokio::test]
async fn test_closed_session_rejects_review() {
    let (manager, session) = open().await;
    let a = session.apply(Operation::manual("cell", square(4.0))).await.unwrap();
    manager.close(session.id()).await.unwrap();

    let err = session
        .open_thread(a.id, Comment::new("reviewer", "late"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionClosed(_)));
}
