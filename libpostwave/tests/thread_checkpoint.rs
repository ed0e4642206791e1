//! Thread publishing: checkpoint writes, resume, duplicate recovery

mod common;

use anyhow::Result;
use chrono::{Duration, Utc};
use common::*;
use libpostwave::checkpoint::ThreadProgress;
use libpostwave::clients::mock::MockFailure;
use libpostwave::clients::MockClient;
use libpostwave::{Orchestrator, Platform, PostStatus, PublishOutcome, PublishStore, SubStatus};
use std::sync::Arc;

async fn setup(client: &MockClient) -> (Arc<RecordingStore>, Orchestrator, tempfile::TempDir) {
    let (db, dir) = setup_db().await;
    let store = Arc::new(RecordingStore::new(db));
    store_token(store.as_ref(), Platform::Twitter, Some("rt-0")).await;
    let orchestrator = Orchestrator::new(store.clone(), mock_registry(&[client]), test_key());
    (store, orchestrator, dir)
}

#[tokio::test]
async fn test_clean_thread_writes_one_checkpoint_per_segment() -> Result<()> {
    let client = MockClient::new(Platform::Twitter);
    let (store, orchestrator, _dir) = setup(&client).await;
    let post = thread_post(&["twitter"], &["one", "two", "three"]);
    store.db().create_post(&post).await?;

    let outcome = orchestrator.publish_post(&post.id).await?;

    assert!(matches!(outcome, PublishOutcome::Published { partial: false, .. }));
    assert_eq!(store.checkpoint_writes(), 3);
    assert_eq!(client.create_calls(), 3);

    let progress = store.load_thread_progress(&post.id, "twitter").await?.unwrap();
    let posted: Vec<String> = client.posted().into_iter().map(|p| p.id).collect();
    assert_eq!(progress.tweet_ids, posted);
    assert_eq!(progress.posted, 3);
    assert!(progress.is_complete());

    // Each segment replies to the one before it
    let items = client.posted();
    assert_eq!(items[0].reply_to, None);
    assert_eq!(items[1].reply_to.as_deref(), Some(items[0].id.as_str()));
    assert_eq!(items[2].reply_to.as_deref(), Some(items[1].id.as_str()));

    let stored = store.get_post(&post.id).await?.unwrap();
    assert_eq!(stored.status, PostStatus::Published);
    assert_eq!(stored.external_post_id.as_deref(), Some(items[0].id.as_str()));
    Ok(())
}

#[tokio::test]
async fn test_resume_posts_only_remaining_segments() -> Result<()> {
    let client = MockClient::new(Platform::Twitter);
    let (store, orchestrator, _dir) = setup(&client).await;
    let post = thread_post(&["twitter"], &["one", "two", "three", "four"]);
    store.db().create_post(&post).await?;

    let mut progress = ThreadProgress::new(4);
    progress.advance("earlier-1")?;
    progress.advance("earlier-2")?;
    store.db().save_thread_progress(&post.id, "twitter", &progress).await?;

    orchestrator.publish_post(&post.id).await?;

    assert_eq!(client.create_calls(), 2);
    let items = client.posted();
    assert_eq!(items[0].text, "three");
    assert_eq!(items[0].reply_to.as_deref(), Some("earlier-2"));

    let progress = store.load_thread_progress(&post.id, "twitter").await?.unwrap();
    assert_eq!(progress.posted, 4);
    assert_eq!(&progress.tweet_ids[..2], &["earlier-1".to_string(), "earlier-2".to_string()]);
    assert_eq!(progress.tweet_ids[2], items[0].id);
    assert_eq!(progress.tweet_ids[3], items[1].id);
    Ok(())
}

#[tokio::test]
async fn test_duplicate_rejection_recovers_id_and_continues() -> Result<()> {
    let client = MockClient::new(Platform::Twitter).fail_create_at(2, MockFailure::Duplicate);
    let (store, orchestrator, _dir) = setup(&client).await;
    let post = thread_post(&["twitter"], &["one", "two", "three"]);
    store.db().create_post(&post).await?;

    let outcome = orchestrator.publish_post(&post.id).await?;

    assert!(matches!(outcome, PublishOutcome::Published { .. }));
    let items = client.posted();
    assert_eq!(items.len(), 3);
    // The third segment replies to the id recovered for the second
    assert_eq!(items[2].reply_to.as_deref(), Some(items[1].id.as_str()));

    let progress = store.load_thread_progress(&post.id, "twitter").await?.unwrap();
    assert_eq!(progress.posted, 3);
    assert_eq!(progress.tweet_ids[1], items[1].id);
    Ok(())
}

#[tokio::test]
async fn test_error_mid_thread_leaves_checkpoint_then_resumes() -> Result<()> {
    let client = MockClient::new(Platform::Twitter)
        .fail_create_at(3, MockFailure::api(503, "service unavailable"));
    let (store, orchestrator, _dir) = setup(&client).await;
    let post = thread_post(&["twitter"], &["one", "two", "three", "four"]);
    store.db().create_post(&post).await?;

    let outcome = orchestrator.publish_post(&post.id).await?;
    assert!(matches!(outcome, PublishOutcome::Suspended { .. }));

    let progress = store.load_thread_progress(&post.id, "twitter").await?.unwrap();
    assert_eq!(progress.posted, 2);
    assert_eq!(progress.tweet_ids.len(), 2);

    let stored = store.get_post(&post.id).await?.unwrap();
    assert_eq!(stored.status, PostStatus::Retry);
    assert_eq!(stored.sub_status, SubStatus::ThreadPartial);

    // The retry resumes at segment three
    let later = Utc::now() + Duration::hours(1);
    let outcome = orchestrator.publish_post_at(&post.id, later).await?;
    assert!(matches!(outcome, PublishOutcome::Published { .. }));
    assert_eq!(client.create_calls(), 5);

    let texts: Vec<String> = client.posted().into_iter().map(|p| p.text).collect();
    assert_eq!(texts, vec!["one", "two", "three", "four"]);
    let progress = store.load_thread_progress(&post.id, "twitter").await?.unwrap();
    assert_eq!(progress.posted, 4);
    Ok(())
}

#[tokio::test]
async fn test_completed_thread_is_not_reposted() -> Result<()> {
    let client = MockClient::new(Platform::Twitter);
    let (store, orchestrator, _dir) = setup(&client).await;
    let post = thread_post(&["twitter"], &["one", "two"]);
    store.db().create_post(&post).await?;

    orchestrator.publish_post(&post.id).await?;
    let outcome = orchestrator.publish_post(&post.id).await?;

    assert!(matches!(outcome, PublishOutcome::Skipped { .. }));
    assert_eq!(client.create_calls(), 2);
    assert_eq!(store.outcome_writes(), 1);
    Ok(())
}
