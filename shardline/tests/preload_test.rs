mod common;

use common::{M, add_shard, board, comments, ids, posts, row};
use shardline::{
    Category, ShardError,
    assoc::{Reflection, load_target, preload},
    context,
    memory::{MemoryAdapter, MemoryTableScope},
    record::{Record, Value},
};

fn seed_comment(adapter: &MemoryAdapter, ns: &str, id: i64, post_id: i64) {
    adapter.insert(
        ns,
        "comments",
        [("id", Value::Int(id)), ("post_id", Value::Int(post_id))],
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_has_many_queries_each_shard_once() {
    let adapter = MemoryAdapter::new();
    let board = board(&adapter);
    let s1 = add_shard(&board, &adapter, 1, "main");
    let s2 = add_shard(&board, &adapter, 2, "main");
    // both posts have local id 1
    seed_comment(&adapter, "s1", 10, 1);
    seed_comment(&adapter, "s1", 11, 1);
    seed_comment(&adapter, "s2", 20, 1);
    seed_comment(&adapter, "s2", 21, 2);

    let posts = posts();
    let owners = vec![
        row(&s1, &posts, &[("id", Value::Int(1))]),
        row(&s2, &posts, &[("id", Value::Int(1))]),
    ];
    let reflection = Reflection::has_many("comments", "post_id", Category::PRIMARY);
    let scope = MemoryTableScope::new("comments", comments());

    adapter.reset_counters();
    let loaded = preload(&board, &owners, &reflection, &scope).await.unwrap();
    assert_eq!(adapter.selects(), 2);
    assert_eq!(ids(&loaded[0]), vec![10, 11]);
    assert_eq!(ids(&loaded[1]), vec![20]);
    assert!(loaded[0].iter().all(|c| c.shard().id == 1));
    assert!(loaded[1].iter().all(|c| c.shard().id == 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_belongs_to_follows_embedded_shard() {
    let adapter = MemoryAdapter::new();
    let board = board(&adapter);
    let s1 = add_shard(&board, &adapter, 1, "main");
    let s2 = add_shard(&board, &adapter, 2, "main");
    adapter.insert("s1", "posts", [("id", Value::Int(1))]);
    adapter.insert("s2", "posts", [("id", Value::Int(5))]);

    let comments = comments();
    let owners = vec![
        row(
            &s2,
            &comments,
            &[("id", Value::Int(1)), ("post_id", Value::Int(M + 1))],
        ),
        row(
            &s2,
            &comments,
            &[("id", Value::Int(2)), ("post_id", Value::Int(5))],
        ),
        row(
            &s2,
            &comments,
            &[("id", Value::Int(3)), ("post_id", Value::Null)],
        ),
    ];
    let reflection = Reflection::belongs_to("post", "post_id", Category::PRIMARY);
    let scope = MemoryTableScope::new("posts", posts());

    adapter.reset_counters();
    let loaded = preload(&board, &owners, &reflection, &scope).await.unwrap();
    assert_eq!(adapter.selects(), 2);
    assert_eq!(ids(&loaded[0]), vec![1]);
    assert_eq!(loaded[0][0].shard().id, s1.id);
    assert_eq!(ids(&loaded[1]), vec![5]);
    assert_eq!(loaded[1][0].shard().id, 2);
    assert!(loaded[2].is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_belongs_to_unknown_shard() {
    let adapter = MemoryAdapter::new();
    let board = board(&adapter);
    let s1 = add_shard(&board, &adapter, 1, "main");
    let owners = vec![row(
        &s1,
        &comments(),
        &[("id", Value::Int(1)), ("post_id", Value::Int(77 * M + 1))],
    )];
    let reflection = Reflection::belongs_to("post", "post_id", Category::PRIMARY);
    let scope = MemoryTableScope::new("posts", posts());

    let err = preload(&board, &owners, &reflection, &scope)
        .await
        .unwrap_err();
    assert!(matches!(err, ShardError::NonExistentShard(77)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_null_keys_issue_no_query() {
    let adapter = MemoryAdapter::new();
    let board = board(&adapter);
    let s1 = add_shard(&board, &adapter, 1, "main");
    let owners = vec![
        row(&s1, &comments(), &[("id", Value::Int(1)), ("post_id", Value::Null)]),
        row(&s1, &comments(), &[("id", Value::Int(2))]),
    ];
    let reflection = Reflection::belongs_to("post", "post_id", Category::PRIMARY);
    let scope = MemoryTableScope::new("posts", posts());

    adapter.reset_counters();
    let loaded = preload(&board, &owners, &reflection, &scope).await.unwrap();
    assert_eq!(loaded.len(), 2);
    assert!(loaded.iter().all(Vec::is_empty));
    assert_eq!(adapter.selects(), 0);
    assert_eq!(adapter.connects(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_keys_are_sliced_by_in_clause_length() {
    let adapter = MemoryAdapter::new().with_in_clause_length(2);
    let board = board(&adapter);
    let s1 = add_shard(&board, &adapter, 1, "main");
    let posts = posts();
    let owners: Vec<_> = (1..=5)
        .map(|id| row(&s1, &posts, &[("id", Value::Int(id))]))
        .collect();
    for id in 1..=5 {
        seed_comment(&adapter, "s1", 100 + id, id);
    }
    let reflection = Reflection::has_many("comments", "post_id", Category::PRIMARY);
    let scope = MemoryTableScope::new("comments", comments());

    adapter.reset_counters();
    let loaded = preload(&board, &owners, &reflection, &scope).await.unwrap();
    assert_eq!(adapter.selects(), 3);
    for (i, records) in loaded.iter().enumerate() {
        assert_eq!(ids(records), vec![101 + i as i64]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_repeated_keys_are_queried_once() {
    let adapter = MemoryAdapter::new().with_in_clause_length(2);
    let board = board(&adapter);
    let s1 = add_shard(&board, &adapter, 1, "main");
    adapter.insert("s1", "posts", [("id", Value::Int(1))]);
    adapter.insert("s1", "posts", [("id", Value::Int(2))]);
    let comments = comments();
    // six owners, two distinct keys: one IN clause of length two
    let owners: Vec<_> = (1..=6)
        .map(|id| {
            row(
                &s1,
                &comments,
                &[("id", Value::Int(id)), ("post_id", Value::Int(id % 2 + 1))],
            )
        })
        .collect();
    let reflection = Reflection::belongs_to("post", "post_id", Category::PRIMARY);
    let scope = MemoryTableScope::new("posts", posts());

    adapter.reset_counters();
    let loaded = preload(&board, &owners, &reflection, &scope).await.unwrap();
    assert_eq!(adapter.selects(), 1);
    for (i, records) in loaded.iter().enumerate() {
        let id = i as i64 + 1;
        assert_eq!(ids(records), vec![id % 2 + 1]);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_multishard_searches_associated_shards() {
    let adapter = MemoryAdapter::new();
    let board = board(&adapter);
    let s1 = add_shard(&board, &adapter, 1, "main");
    let s2 = add_shard(&board, &adapter, 2, "main");
    seed_comment(&adapter, "s1", 10, 1);
    // a comment on s2 points back at the post on s1
    seed_comment(&adapter, "s2", 20, M + 1);
    seed_comment(&adapter, "s2", 21, 1);

    let owner = row(&s1, &posts(), &[("id", Value::Int(1))])
        .with_associated_shards(vec![s1.clone(), s2.clone()]);
    let reflection =
        Reflection::has_many("comments", "post_id", Category::PRIMARY).multishard();
    let scope = MemoryTableScope::new("comments", comments());

    adapter.reset_counters();
    let loaded = preload(&board, &[owner.clone()], &reflection, &scope)
        .await
        .unwrap();
    assert_eq!(adapter.selects(), 2);
    assert_eq!(ids(&loaded[0]), vec![10, 20]);

    let single = load_target(&board, &owner, &reflection, &scope).await.unwrap();
    assert_eq!(ids(&single), vec![10, 20]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_matching_owners_share_records() {
    let adapter = MemoryAdapter::new();
    let board = board(&adapter);
    let s1 = add_shard(&board, &adapter, 1, "main");
    let posts = posts();
    let owners = vec![
        row(&s1, &posts, &[("id", Value::Int(3))]),
        row(&s1, &posts, &[("id", Value::Int(3))]),
    ];
    seed_comment(&adapter, "s1", 30, 3);
    let reflection = Reflection::has_many("comments", "post_id", Category::PRIMARY);
    let scope = MemoryTableScope::new("comments", comments());

    let loaded = preload(&board, &owners, &reflection, &scope).await.unwrap();
    assert_eq!(ids(&loaded[0]), vec![30]);
    assert_eq!(ids(&loaded[1]), vec![30]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_context_restored_after_preload() {
    let adapter = MemoryAdapter::new();
    let board = board(&adapter);
    let s1 = add_shard(&board, &adapter, 1, "main");
    let s2 = add_shard(&board, &adapter, 2, "main");
    let posts = posts();
    let owners = vec![row(&s2, &posts, &[("id", Value::Int(1))])];
    let reflection = Reflection::has_many("comments", "post_id", Category::PRIMARY);
    let scope = MemoryTableScope::new("comments", comments());

    context::activate(&s1, &[], async {
        preload(&board, &owners, &reflection, &scope).await.unwrap();
        assert_eq!(board.current(&Category::PRIMARY).id, 1);
    })
    .await;
    assert!(board.current(&Category::PRIMARY).is_default());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 1)]
async fn test_load_target_belongs_to() {
    let adapter = MemoryAdapter::new();
    let board = board(&adapter);
    let s1 = add_shard(&board, &adapter, 1, "main");
    let s2 = add_shard(&board, &adapter, 2, "main");
    adapter.insert("s1", "posts", [("id", Value::Int(4))]);
    let owner = row(
        &s2,
        &comments(),
        &[("id", Value::Int(1)), ("post_id", Value::Int(M + 4))],
    );
    let reflection = Reflection::belongs_to("post", "post_id", Category::PRIMARY);
    let scope = MemoryTableScope::new("posts", posts());

    let found = load_target(&board, &owner, &reflection, &scope).await.unwrap();
    assert_eq!(ids(&found), vec![4]);
    assert_eq!(found[0].shard(), &s1);
}
