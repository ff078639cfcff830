mod support;

use forumshard::pool::WorkerPool;
use forumshard::storage::{PostStore, RocksBackend, UserStore};
use forumshard::{EntityId, ForumConfig, ForumError, NaturalKeyKind, PageCursor, PostOrder};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use support::{ids_of, memory_backend, post, user, FlakyBackend};
use tokio_util::sync::CancellationToken;

fn total_rows(backend: &forumshard::MemoryBackend, tables: Vec<String>) -> usize {
    tables.iter().map(|table| backend.len(table).unwrap_or(0)).sum()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_fetch_handles_duplicates_and_invalid_ids() -> anyhow::Result<()> {
    let config = ForumConfig::default();
    let backend = memory_backend(&config);
    let users = UserStore::new(backend.clone(), &config.sharding, WorkerPool::new(4));
    for id in 1..=40 {
        users.create(&user(id, &format!("u{id}@example.com"), &format!("u{id}")))?;
    }

    let ids: Vec<EntityId> = [7, 0, 33, 7, -1, 1000, 12, 33]
        .into_iter()
        .map(EntityId)
        .collect();
    let found = users.batch_fetch(&ids, &CancellationToken::new()).await?;

    assert_eq!(found.len(), ids.len());
    for (id, row) in ids.iter().zip(&found) {
        match row {
            Some(user) => assert_eq!(user.user_id, *id),
            None => assert!(!(1..=40).contains(&id.0), "{id} should resolve"),
        }
    }
    assert_eq!(found[0], found[3]);
    assert_eq!(found[2], found[7]);
    assert!(found[1].is_none() && found[4].is_none() && found[5].is_none());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batch_fetch_of_nothing_is_empty() -> anyhow::Result<()> {
    let config = ForumConfig::default();
    let users = UserStore::new(memory_backend(&config), &config.sharding, WorkerPool::new(2));
    assert!(users.batch_fetch(&[], &CancellationToken::new()).await?.is_empty());
    Ok(())
}

#[test]
fn duplicate_email_keeps_tables_consistent() -> anyhow::Result<()> {
    let config = ForumConfig::default();
    let backend = memory_backend(&config);
    let users = UserStore::new(backend.clone(), &config.sharding, WorkerPool::new(2));

    users.create(&user(1, "a@b.com", "alice"))?;
    let err = users.create(&user(2, "a@b.com", "bob")).unwrap_err();
    assert!(matches!(err, ForumError::Duplicate(NaturalKeyKind::Email)));

    assert_eq!(users.email_to_id("a@b.com")?, Some(EntityId(1)));
    assert_eq!(users.nickname_to_id("bob")?, None);
    assert_eq!(total_rows(&backend, config.sharding.users().tables()), 1);
    assert_eq!(total_rows(&backend, config.sharding.user_emails().tables()), 1);
    assert_eq!(total_rows(&backend, config.sharding.user_nicknames().tables()), 1);
    Ok(())
}

#[test]
fn primary_write_failure_releases_claimed_keys() -> anyhow::Result<()> {
    let config = ForumConfig::default();
    let memory = memory_backend(&config);
    let flaky = Arc::new(FlakyBackend::new(memory.clone()));
    let users = UserStore::new(flaky.clone(), &config.sharding, WorkerPool::new(2));

    let primary = config.sharding.users().table_for_id(EntityId(5));
    flaky.fail_tables(&primary);
    let err = users.create(&user(5, "c@d.com", "carol")).unwrap_err();
    assert!(matches!(err, ForumError::Store(_)), "{err}");

    flaky.heal();
    assert_eq!(users.email_to_id("c@d.com")?, None);
    assert_eq!(users.nickname_to_id("carol")?, None);
    assert_eq!(total_rows(&memory, config.sharding.physical_tables()), 0);

    users.create(&user(5, "c@d.com", "carol"))?;
    assert_eq!(users.email_to_id("c@d.com")?, Some(EntityId(5)));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shard_failure_fails_the_whole_batch() -> anyhow::Result<()> {
    let config = ForumConfig::default();
    let memory = memory_backend(&config);
    let flaky = Arc::new(FlakyBackend::new(memory));
    let posts = PostStore::new(flaky.clone(), &config.sharding, WorkerPool::new(2));
    for id in 1..=20 {
        posts.create(&post(id, 1, 1_000 + id))?;
    }

    let ids: Vec<EntityId> = (1..=20).map(EntityId).collect();
    let broken = config.sharding.posts().table_for_id(EntityId(3));
    flaky.fail_tables(&broken);
    let err = posts
        .batch_fetch(&ids, &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ForumError::Store(_)));
    assert!(format!("{err:#}").contains("injected failure"), "{err:#}");
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_batch_reports_cancellation() -> anyhow::Result<()> {
    let config = ForumConfig::default();
    let memory = memory_backend(&config);
    let flaky = Arc::new(FlakyBackend::new(memory));
    let posts = PostStore::new(flaky.clone(), &config.sharding, WorkerPool::new(2));
    posts.create(&post(1, 1, 1_000))?;
    let before = flaky.calls.load(Ordering::SeqCst);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = posts.batch_fetch(&[EntityId(1)], &cancel).await.unwrap_err();
    assert!(matches!(err, ForumError::Cancelled));
    assert_eq!(flaky.calls.load(Ordering::SeqCst), before);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rocks_backend_survives_reopen() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let config = ForumConfig::default();
    let tables = config.sharding.physical_tables();
    {
        let backend = Arc::new(RocksBackend::open(dir.path(), &tables)?);
        let users = UserStore::new(backend.clone(), &config.sharding, WorkerPool::new(2));
        let posts = PostStore::new(backend, &config.sharding, WorkerPool::new(2));
        users.create(&user(1, "r@db.io", "rocky"))?;
        for id in 10..15 {
            posts.create(&post(id, 1, 2_000 + id))?;
        }
        posts.record_reply(EntityId(10), forumshard::Millis(9_000))?;
    }

    let backend = Arc::new(RocksBackend::open(dir.path(), &tables)?);
    let users = UserStore::new(backend.clone(), &config.sharding, WorkerPool::new(2));
    let posts = PostStore::new(backend, &config.sharding, WorkerPool::new(2));
    assert_eq!(users.username_to_id("r@db.io")?, Some(EntityId(1)));

    let cancel = CancellationToken::new();
    let top = PageCursor::new(EntityId::MAX, forumshard::Millis(100_000));
    let by_reply = posts.list(PostOrder::ReplyTime, &top, 3, &cancel).await?;
    assert_eq!(ids_of(&by_reply, |p| p.post_id), vec![10, 14, 13]);
    assert_eq!(by_reply[0].reply_num, 1);
    Ok(())
}
