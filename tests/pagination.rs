mod support;

use forumshard::cache::keys;
use forumshard::config::PaginationConfig;
use forumshard::paginate::{AuthorDirectory, PostSource};
use forumshard::pool::WorkerPool;
use forumshard::storage::{PostStore, SharedBackend, UserStore};
use forumshard::tos::TosItem;
use forumshard::{
    Accelerator, EntityId, ForumConfig, ForumError, MemoryTos, Page, PageSource, Post, PostDetail,
    PostOrder, PostPaginator,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use support::{ids_of, memory_backend, post, user, DownAccelerator, FlakyBackend, SlowAccelerator};
use tokio_util::sync::CancellationToken;

const BASE: i64 = 1_600_000_000_000;

struct Fixture {
    paginator: PostPaginator,
    posts: Arc<PostStore>,
    users: Arc<UserStore>,
}

fn fixture(backend: SharedBackend, accelerator: Arc<dyn Accelerator>) -> Fixture {
    let config = ForumConfig::default();
    let posts = Arc::new(PostStore::new(
        Arc::clone(&backend),
        &config.sharding,
        WorkerPool::new(3),
    ));
    let users = Arc::new(UserStore::new(backend, &config.sharding, WorkerPool::new(3)));
    let paginator = PostPaginator::new(
        accelerator,
        Arc::clone(&posts) as Arc<dyn PostSource>,
        Arc::clone(&users) as Arc<dyn AuthorDirectory>,
        PaginationConfig {
            default_page_size: 2,
            max_page_size: 10,
        },
        Duration::from_millis(50),
    );
    Fixture {
        paginator,
        posts,
        users,
    }
}

fn memory_fixture(accelerator: Arc<dyn Accelerator>) -> Fixture {
    let config = ForumConfig::default();
    fixture(memory_backend(&config), accelerator)
}

async fn index(tos: &MemoryTos, order: PostOrder, post: &Post, max: usize) {
    tos.add(
        &keys::post_list(order),
        TosItem::new(post.order_time(order), post.post_id.to_fixed_width()),
        max,
    )
    .await
    .unwrap();
}

fn five_posts(fixture: &Fixture) -> anyhow::Result<Vec<Post>> {
    let posts: Vec<Post> = (1..=5).map(|n| post(n, 100, BASE + n * 1_000)).collect();
    for post in &posts {
        fixture.posts.create(post)?;
    }
    Ok(posts)
}

fn page_ids(page: &Page<PostDetail>) -> Vec<i64> {
    ids_of(&page.items, |item| item.post_id)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn five_posts_paged_by_two_from_the_store() -> anyhow::Result<()> {
    let fixture = memory_fixture(Arc::new(MemoryTos::default()));
    five_posts(&fixture)?;
    let cancel = CancellationToken::new();
    let order = PostOrder::CreatedAt;

    let first = fixture.paginator.list(order, "", 2, &cancel).await?;
    assert_eq!(page_ids(&first), vec![5, 4]);
    assert_eq!(first.source, PageSource::BackingStore);
    assert!(!first.is_last());

    let second = fixture.paginator.list(order, &first.cursor, 2, &cancel).await?;
    assert_eq!(page_ids(&second), vec![3, 2]);

    let third = fixture.paginator.list(order, &second.cursor, 2, &cancel).await?;
    assert_eq!(page_ids(&third), vec![1]);
    assert!(third.is_last());

    let past_end = fixture.paginator.list(order, &third.cursor, 2, &cancel).await?;
    assert!(past_end.items.is_empty());
    assert_eq!(past_end.cursor, third.cursor);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn accelerator_serves_full_pages_and_store_fills_the_tail() -> anyhow::Result<()> {
    let tos = Arc::new(MemoryTos::default());
    let fixture = memory_fixture(tos.clone());
    for post in five_posts(&fixture)? {
        index(&tos, PostOrder::CreatedAt, &post, 100).await;
    }
    let cancel = CancellationToken::new();
    let order = PostOrder::CreatedAt;

    let first = fixture.paginator.list(order, "", 2, &cancel).await?;
    assert_eq!(page_ids(&first), vec![5, 4]);
    assert_eq!(first.source, PageSource::Accelerator);

    let second = fixture.paginator.list(order, &first.cursor, 2, &cancel).await?;
    assert_eq!(page_ids(&second), vec![3, 2]);
    assert_eq!(second.source, PageSource::Accelerator);

    // Only P1 is left in the set: a shortfall goes to the store.
    let third = fixture.paginator.list(order, &second.cursor, 2, &cancel).await?;
    assert_eq!(page_ids(&third), vec![1]);
    assert_eq!(third.source, PageSource::BackingStore);
    assert!(third.is_last());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn vanished_posts_become_tombstones() -> anyhow::Result<()> {
    let tos = Arc::new(MemoryTos::default());
    let fixture = memory_fixture(tos.clone());
    for post in five_posts(&fixture)? {
        index(&tos, PostOrder::CreatedAt, &post, 100).await;
    }
    fixture.posts.delete(EntityId(4))?;

    let page = fixture
        .paginator
        .list(PostOrder::CreatedAt, "", 3, &CancellationToken::new())
        .await?;
    assert_eq!(page.source, PageSource::Accelerator);
    assert_eq!(page_ids(&page), vec![5, 4, 3]);
    assert!(page.items[1].deleted);
    assert_eq!(page.items[1].created_at.0, BASE + 4_000);
    assert!(!page.items[0].deleted && !page.items[2].deleted);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unavailable_accelerator_falls_back() -> anyhow::Result<()> {
    let fixture = memory_fixture(Arc::new(DownAccelerator));
    five_posts(&fixture)?;
    let page = fixture
        .paginator
        .list(PostOrder::ReplyTime, "", 4, &CancellationToken::new())
        .await?;
    assert_eq!(page_ids(&page), vec![5, 4, 3, 2]);
    assert_eq!(page.source, PageSource::BackingStore);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn slow_accelerator_is_abandoned() -> anyhow::Result<()> {
    let tos = Arc::new(MemoryTos::default());
    let slow = Arc::new(SlowAccelerator {
        inner: tos.clone(),
        delay: Duration::from_secs(2),
    });
    let fixture = memory_fixture(slow);
    for post in five_posts(&fixture)? {
        index(&tos, PostOrder::CreatedAt, &post, 100).await;
    }

    let started = Instant::now();
    let page = fixture
        .paginator
        .list(PostOrder::CreatedAt, "", 2, &CancellationToken::new())
        .await?;
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(page.source, PageSource::BackingStore);
    assert_eq!(page_ids(&page), vec![5, 4]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_requests_are_rejected() -> anyhow::Result<()> {
    let fixture = memory_fixture(Arc::new(MemoryTos::default()));
    five_posts(&fixture)?;
    let cancel = CancellationToken::new();

    let err = fixture
        .paginator
        .list(PostOrder::CreatedAt, "", 0, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ForumError::InvalidPageSize(0)));

    let err = fixture
        .paginator
        .list(PostOrder::CreatedAt, "not-a-cursor", 2, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ForumError::InvalidCursor { .. }));

    let clipped = fixture
        .paginator
        .list(PostOrder::CreatedAt, "", 1_000, &cancel)
        .await?;
    assert_eq!(clipped.page_size(), 10);
    assert_eq!(clipped.items.len(), 5);

    cancel.cancel();
    let err = fixture
        .paginator
        .list(PostOrder::CreatedAt, "", 2, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ForumError::Cancelled));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn walking_every_page_is_ordered_and_disjoint() -> anyhow::Result<()> {
    let tos = Arc::new(MemoryTos::default());
    let fixture = memory_fixture(tos.clone());
    // Pairs of posts share a timestamp so the id tie-breaker matters.
    let posts: Vec<Post> = (1..=57).map(|n| post(n, 100, BASE + (n / 2) * 10)).collect();
    for post in &posts {
        fixture.posts.create(post)?;
        // The set only holds the newest 20, so later pages come from the store.
        index(&tos, PostOrder::CreatedAt, post, 20).await;
    }

    let cancel = CancellationToken::new();
    let mut cursor = String::new();
    let mut seen = Vec::new();
    let mut sources = Vec::new();
    loop {
        let page = fixture
            .paginator
            .list(PostOrder::CreatedAt, &cursor, 5, &cancel)
            .await?;
        seen.extend(page.items.iter().map(|item| (item.created_at, item.post_id)));
        sources.push(page.source);
        if page.is_last() {
            break;
        }
        cursor = page.cursor;
    }

    let mut expected: Vec<_> = posts.iter().map(|p| (p.created_at, p.post_id)).collect();
    expected.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(seen, expected);
    assert!(sources.contains(&PageSource::Accelerator));
    assert!(sources.contains(&PageSource::BackingStore));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn author_names_are_best_effort() -> anyhow::Result<()> {
    let config = ForumConfig::default();
    let memory = memory_backend(&config);
    let flaky = Arc::new(FlakyBackend::new(memory));
    let fixture = fixture(flaky.clone(), Arc::new(MemoryTos::default()));
    fixture.users.create(&user(100, "author@example.com", "author"))?;
    five_posts(&fixture)?;
    let cancel = CancellationToken::new();

    let named = fixture.paginator.list(PostOrder::CreatedAt, "", 2, &cancel).await?;
    assert!(named.items.iter().all(|item| item.author_nickname == "author"));

    flaky.fail_tables("user");
    let unnamed = fixture.paginator.list(PostOrder::CreatedAt, "", 2, &cancel).await?;
    assert_eq!(page_ids(&unnamed), vec![5, 4]);
    assert!(unnamed.items.iter().all(|item| item.author_nickname.is_empty()));
    Ok(())
}
