use std::env;
use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::{EnvFilter, fmt};

use rulebook::prelude::{
    LibError, MemoryStore, NewRule, NewUser, Page, PageArgs, PasswordDigest, Rule, RuleId,
    RulebookOperations,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).try_init();

    let authors = env_count("RULEBOOK_DEMO_AUTHORS", 3)?;
    let rules_each = env_count("RULEBOOK_DEMO_RULES_EACH", 4)?;
    let page_size = env_count("RULEBOOK_DEMO_PAGE_SIZE", 3)?;

    let ops = RulebookOperations::new(Arc::new(MemoryStore::new()));

    println!("seeding {authors} authors with {rules_each} rules each");
    let mut rule_ids = Vec::new();
    for a in 0..authors {
        let name = format!("author-{a}");
        let user = ops
            .user_create(NewUser {
                name: name.clone(),
                email: format!("{name}@example.local"),
                digest: demo_digest(&name),
            })
            .await
            .context("failed to seed user")?;
        for r in 0..rules_each {
            let rule = ops
                .rule_create(
                    user.id,
                    NewRule {
                        summary: format!("rule {r} from {name}"),
                        detail: (r % 2 == 0).then(|| format!("details for rule {r}")),
                    },
                )
                .await
                .context("failed to seed rule")?;
            rule_ids.push(rule.id);
        }
    }

    let reader = ops
        .user_create(NewUser {
            name: "reader".to_string(),
            email: "reader@example.local".to_string(),
            digest: demo_digest("reader"),
        })
        .await
        .context("failed to create reader")?;

    let update = ops
        .likes_update(reader.id, rule_ids.clone(), Vec::new())
        .await
        .context("failed to like seeded rules")?;
    println!("reader liked {} rules", update.added.len());

    let unliked: Vec<RuleId> = rule_ids.iter().copied().step_by(2).collect();
    let update = ops
        .likes_update(reader.id, Vec::new(), unliked)
        .await
        .context("failed to unlike rules")?;
    println!("reader unliked {} rules\n", update.removed.len());

    println!("walking liked rules {page_size} at a time:");
    let mut after = 0;
    loop {
        let page = ops
            .user_likes(
                reader.id,
                PageArgs {
                    limit: page_size,
                    after,
                },
            )
            .await
            .context("failed to page liked rules")?;
        print_window(&page, after);
        match (page.info.has_next_page, page.info.end_cursor) {
            (true, Some(cursor)) => after = cursor,
            _ => break,
        }
    }

    let page = ops
        .user_likes(
            reader.id,
            PageArgs {
                limit: page_size,
                after: i64::MAX,
            },
        )
        .await
        .context("failed to page past the end")?;
    println!("\npast-the-end window (after = i64::MAX):");
    print_window(&page, i64::MAX);

    if let Some(clash) = rule_ids.get(1).copied() {
        match ops.likes_update(reader.id, vec![clash], vec![clash]).await {
            Ok(_) => println!("\nunexpected: overlapping delta was accepted"),
            Err(err) => print_overlap(&err),
        }

        let likers = ops
            .rule_likers(clash, PageArgs::default())
            .await
            .context("failed to list likers")?;
        let names: Vec<&str> = likers.rows.iter().map(|user| user.name.as_str()).collect();
        println!("\nlikers of rule {clash}: {names:?}");
    }

    Ok(())
}

fn env_count(name: &str, default: u32) -> anyhow::Result<u32> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u32>()
            .with_context(|| format!("invalid {name} '{value}'")),
        Err(_) => Ok(default),
    }
}

fn demo_digest(tag: &str) -> PasswordDigest {
    PasswordDigest {
        key: format!("{tag}-key").into_bytes(),
        salt: format!("{tag}-salt").into_bytes(),
    }
}

fn print_window(page: &Page<Rule>, after: i64) {
    let summaries: Vec<&str> = page
        .rows
        .iter()
        .map(|rule| rule.summary.as_str())
        .collect();
    println!(
        "  after={after}: {summaries:?} previous={} next={} cursors={:?}..{:?}",
        page.info.has_previous_page,
        page.info.has_next_page,
        page.info.start_cursor,
        page.info.end_cursor,
    );
}

fn print_overlap(err: &LibError) {
    println!("\noverlapping delta rejected: {} ({})", err.public, err.code);
    if let Some(details) = &err.details {
        println!(
            "  details: {}",
            serde_json::to_string(details).unwrap_or_default()
        );
    }
}
