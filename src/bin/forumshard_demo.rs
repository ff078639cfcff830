//! Walks a small forum through registration, posting, replying and paging.
//!
//! ```text
//! forumshard_demo [--config forumshard.toml] [--data-dir DIR] [--node N]
//!                 [--users N] [--posts N] [--page-size N]
//! ```

use forumshard::config::{IdGenOverrides, StorageOverrides};
use forumshard::{ConfigOverrides, Forum, ForumConfig, NodeRegistry, PostOrder, Registration};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

fn parse_arg(flag: &str) -> Option<String> {
    let mut args = std::env::args();
    while let Some(arg) = args.next() {
        if arg == flag {
            return args.next();
        }
    }
    None
}

fn parse_count(flag: &str, default: usize) -> anyhow::Result<usize> {
    match parse_arg(flag) {
        Some(raw) => Ok(raw.parse()?),
        None => Ok(default),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let overrides = ConfigOverrides {
        idgen: parse_arg("--node")
            .map(|raw| raw.parse::<u16>())
            .transpose()?
            .map(|node| IdGenOverrides { node: Some(node) }),
        storage: parse_arg("--data-dir").map(|dir| StorageOverrides {
            data_dir: Some(dir.into()),
        }),
    };
    let config = ForumConfig::load(parse_arg("--config").as_deref(), overrides)?;
    let user_count = parse_count("--users", 3)?;
    let post_count = parse_count("--posts", 7)?;
    let page_size = parse_count("--page-size", 3)? as i64;

    let registry = NodeRegistry::new();
    let forum = Forum::open(config, &registry)?;
    let cancel = CancellationToken::new();

    let mut authors = Vec::with_capacity(user_count);
    for n in 0..user_count {
        let user = forum
            .register(
                Registration {
                    username: format!("demo{n}-{}@forumshard.dev", std::process::id()),
                    nickname: format!("demo{n}-{}", std::process::id()),
                    password_hash: format!("digest-{n}"),
                },
                &cancel,
            )
            .await?;
        authors.push(user.user_id);
    }
    let Some(&first_author) = authors.first() else {
        anyhow::bail!("--users must be at least 1");
    };

    let mut posts = Vec::with_capacity(post_count);
    for n in 0..post_count {
        let author = authors[n % authors.len()];
        let post = forum
            .create_post(author, &format!("Topic #{n}"), "Hello from the demo")
            .await?;
        posts.push(post.post_id);
    }
    if let Some(&oldest) = posts.first() {
        forum.reply(first_author, oldest, "Bumping the oldest topic").await?;
    }

    for order in [PostOrder::CreatedAt, PostOrder::ReplyTime] {
        println!("== posts by {order} ==");
        let mut cursor = String::new();
        loop {
            let page = forum
                .list_posts(order, &cursor, Some(page_size), &cancel)
                .await?;
            println!("{}", serde_json::to_string_pretty(&page)?);
            if page.is_last() {
                break;
            }
            cursor = page.cursor;
        }
    }

    if let Some(&oldest) = posts.first() {
        let replies = forum.list_replies(oldest, "", None, &cancel).await?;
        println!("== replies to {oldest} ==");
        println!("{}", serde_json::to_string_pretty(&replies)?);
    }
    Ok(())
}
