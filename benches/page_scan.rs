use std::hint::black_box;

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tokio::runtime::Runtime;

use rulebook::memory::MemoryStore;
use rulebook::models::{Like, NewUser, PageArgs, PasswordDigest, Rule, RuleId, UserId};
use rulebook::operations::RulebookOperations;
use rulebook::store::{Store, StoreTx};

const WINDOW: u32 = 50;

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("benchmark runtime")
}

fn digest(tag: &str) -> PasswordDigest {
    PasswordDigest {
        key: format!("{tag}-key").into_bytes(),
        salt: format!("{tag}-salt").into_bytes(),
    }
}

fn seeded(rt: &Runtime, rules: usize) -> (RulebookOperations<MemoryStore>, UserId, UserId) {
    rt.block_on(async {
        let store = MemoryStore::new();
        let ops = RulebookOperations::from_store(&store);

        let author = ops
            .user_create(NewUser {
                name: "author".to_string(),
                email: "author@bench.local".to_string(),
                digest: digest("author"),
            })
            .await
            .expect("author should be created");
        let reader = ops
            .user_create(NewUser {
                name: "reader".to_string(),
                email: "reader@bench.local".to_string(),
                digest: digest("reader"),
            })
            .await
            .expect("reader should be created");

        let mut tx = store.begin().await.expect("seed transaction should begin");
        let created = Utc::now().naive_utc();
        let mut likes = Vec::with_capacity(rules);
        for idx in 0..rules {
            let rule = tx
                .insert_one(&Rule {
                    id: RuleId::default(),
                    user_id: author.id,
                    created,
                    summary: format!("rule {idx}"),
                    detail: None,
                })
                .await
                .expect("rule should insert");
            likes.push(Like {
                user_id: reader.id,
                rule_id: rule.id,
            });
        }
        tx.insert_batch(&likes).await.expect("likes should insert");
        tx.commit().await.expect("seed transaction should commit");

        (ops, author.id, reader.id)
    })
}

fn bench_page_windows(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("page_windows");
    for rules in [1_000usize, 5_000usize] {
        let (ops, author, reader) = seeded(&rt, rules);
        let after = (rules / 2) as i64;

        group.throughput(Throughput::Elements(WINDOW as u64));
        group.bench_with_input(
            BenchmarkId::new("author_rules", rules),
            &(ops.clone(), author),
            |b, (ops, author)| {
                b.to_async(&rt).iter(|| async {
                    let page = ops
                        .user_rules(
                            *author,
                            PageArgs {
                                limit: WINDOW,
                                after,
                            },
                        )
                        .await
                        .expect("window should read");
                    black_box(page.rows.len())
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("liked_rules", rules),
            &(ops, reader),
            |b, (ops, reader)| {
                b.to_async(&rt).iter(|| async {
                    let page = ops
                        .user_likes(
                            *reader,
                            PageArgs {
                                limit: WINDOW,
                                after,
                            },
                        )
                        .await
                        .expect("window should read");
                    black_box(page.rows.len())
                });
            },
        );
    }
    group.finish();
}

criterion_group!(page_scan, bench_page_windows);
criterion_main!(page_scan);
