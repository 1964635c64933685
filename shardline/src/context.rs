//! The shard (and environment) each category is currently scoped to, held
//! per task.
//!
//! Every activation runs its future inside a fresh task-local scope layered
//! over the caller's, so leaving the scope restores the caller's shards on
//! every exit path: normal return, `?`, panic or cancellation. Spawned tasks
//! start with an empty context.

use std::{collections::HashMap, future::Future, sync::Arc};

use tokio::task::futures::TaskLocalFuture;

use crate::{
    server::Environment,
    shard::{Category, Shard, ShardId},
};

tokio::task_local! {
    static SHARD_CONTEXT: ShardContext;
}

#[derive(Debug, Clone, Default)]
pub struct ShardContext {
    active: HashMap<Category, Arc<Shard>>,
    environment: Option<Environment>,
    depth: usize,
}

impl ShardContext {
    /// The context of the running task, empty outside of any activation.
    pub fn snapshot() -> ShardContext {
        SHARD_CONTEXT.try_with(|c| c.clone()).unwrap_or_default()
    }

    fn push_shard(mut self, shard: &Arc<Shard>, categories: &[Category]) -> Self {
        if categories.is_empty() {
            self.active.insert(Category::PRIMARY, shard.clone());
        } else {
            for category in categories {
                self.active.insert(category.clone(), shard.clone());
            }
        }
        self.depth += 1;
        self
    }

    fn push_environment(mut self, environment: Environment) -> Self {
        self.environment = Some(environment);
        self.depth += 1;
        self
    }

    pub fn get(&self, category: &Category) -> Option<&Arc<Shard>> {
        self.active.get(category)
    }

    pub fn environment(&self) -> Option<&Environment> {
        self.environment.as_ref()
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// The shard activated for `category` in this task, if any.
pub fn current(category: &Category) -> Option<Arc<Shard>> {
    SHARD_CONTEXT
        .try_with(|c| c.active.get(category).cloned())
        .ok()
        .flatten()
}

/// The read/write environment of this task; `primary` unless activated.
pub fn current_environment() -> Environment {
    SHARD_CONTEXT
        .try_with(|c| c.environment.clone())
        .ok()
        .flatten()
        .unwrap_or_default()
}

/// Number of activations enclosing the caller.
pub fn depth() -> usize {
    SHARD_CONTEXT.try_with(|c| c.depth).unwrap_or(0)
}

/// Run `fut` with `shard` current for each of `categories` (`primary` when
/// empty).
pub fn activate<F: Future>(
    shard: &Arc<Shard>,
    categories: &[Category],
    fut: F,
) -> TaskLocalFuture<ShardContext, F> {
    let context = ShardContext::snapshot().push_shard(shard, categories);
    SHARD_CONTEXT.scope(context, fut)
}

/// Blocking counterpart of [`activate`].
pub fn activate_sync<R>(
    shard: &Arc<Shard>,
    categories: &[Category],
    f: impl FnOnce() -> R,
) -> R {
    let context = ShardContext::snapshot().push_shard(shard, categories);
    SHARD_CONTEXT.sync_scope(context, f)
}

/// Run `fut` with connections made in `environment`.
pub fn activate_environment<F: Future>(
    environment: Environment,
    fut: F,
) -> TaskLocalFuture<ShardContext, F> {
    let context = ShardContext::snapshot().push_environment(environment);
    SHARD_CONTEXT.scope(context, fut)
}

/// Activate each shard in turn and collect the results in shard order. The
/// future returned by `f` is polled inside the activation.
pub async fn with_each_shard<T, E, F, Fut>(
    shards: &[Arc<Shard>],
    categories: &[Category],
    mut f: F,
) -> Result<Vec<T>, E>
where
    F: FnMut(Arc<Shard>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut out = Vec::with_capacity(shards.len());
    for shard in shards {
        let value = activate(shard, categories, f(shard.clone())).await?;
        out.push(value);
    }
    Ok(out)
}

/// Anything that knows the shard it was loaded from.
pub trait ShardOwned {
    fn owning_shard(&self) -> &Arc<Shard>;
}

/// Group `items` by shard, keeping shards in order of first appearance and
/// items in input order within a shard.
pub fn group_by_shard<I, E, S>(
    items: Vec<I>,
    mut shard_of: S,
) -> Result<Vec<(Arc<Shard>, Vec<I>)>, E>
where
    S: FnMut(&I) -> Result<Arc<Shard>, E>,
{
    let mut groups: Vec<(Arc<Shard>, Vec<I>)> = Vec::new();
    let mut index: HashMap<ShardId, usize> = HashMap::new();
    for item in items {
        let shard = shard_of(&item)?;
        match index.get(&shard.id) {
            Some(&i) => groups[i].1.push(item),
            None => {
                index.insert(shard.id, groups.len());
                groups.push((shard, vec![item]));
            }
        }
    }
    Ok(groups)
}

/// Fan `items` out by the shard computed with `shard_of`: each shard is
/// activated once and `f` gets that shard's subset. Results come back in the
/// order the subsets were produced, not in input order.
pub async fn partition_by_shard_with<I, T, E, S, F, Fut>(
    items: Vec<I>,
    categories: &[Category],
    shard_of: S,
    mut f: F,
) -> Result<Vec<T>, E>
where
    S: FnMut(&I) -> Result<Arc<Shard>, E>,
    F: FnMut(Arc<Shard>, Vec<I>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let groups = group_by_shard(items, shard_of)?;
    let mut out = Vec::with_capacity(groups.len());
    for (shard, subset) in groups {
        let fut = f(shard.clone(), subset);
        out.push(activate(&shard, categories, fut).await?);
    }
    Ok(out)
}

/// [`partition_by_shard_with`] grouping each item by its own shard.
pub async fn partition_by_shard<I, T, E, F, Fut>(
    items: Vec<I>,
    categories: &[Category],
    f: F,
) -> Result<Vec<T>, E>
where
    I: ShardOwned,
    F: FnMut(Arc<Shard>, Vec<I>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    partition_by_shard_with(
        items,
        categories,
        |item: &I| Ok(item.owning_shard().clone()),
        f,
    )
    .await
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;

    fn shard(id: ShardId) -> Arc<Shard> {
        Arc::new(Shard::new(id, Some(format!("s{id}")), None))
    }

    fn current_id(category: &Category) -> Option<ShardId> {
        current(category).map(|s| s.id)
    }

    #[derive(Debug, Clone)]
    struct Item {
        key: u32,
        shard: Arc<Shard>,
    }

    impl ShardOwned for Item {
        fn owning_shard(&self) -> &Arc<Shard> {
            &self.shard
        }
    }

    #[tokio::test]
    async fn test_nested_activation_restores() {
        let s1 = shard(1);
        let s2 = shard(2);
        assert_eq!(current_id(&Category::PRIMARY), None);
        activate(&s1, &[], async {
            assert_eq!(current_id(&Category::PRIMARY), Some(1));
            assert_eq!(depth(), 1);
            activate(&s2, &[], async {
                assert_eq!(current_id(&Category::PRIMARY), Some(2));
                assert_eq!(depth(), 2);
            })
            .await;
            assert_eq!(current_id(&Category::PRIMARY), Some(1));
        })
        .await;
        assert_eq!(current_id(&Category::PRIMARY), None);
        assert_eq!(depth(), 0);
    }

    #[tokio::test]
    async fn test_categories_are_independent() {
        let s1 = shard(1);
        let s2 = shard(2);
        let a = Category::new("a");
        let b = Category::new("b");
        activate(&s1, &[a.clone()], async {
            activate(&s2, &[b.clone()], async {
                assert_eq!(current_id(&a), Some(1));
                assert_eq!(current_id(&b), Some(2));
            })
            .await;
            assert_eq!(current_id(&a), Some(1));
            assert_eq!(current_id(&b), None);
        })
        .await;
        assert_eq!(current_id(&a), None);
    }

    #[tokio::test]
    async fn test_restores_after_error() {
        let s1 = shard(1);
        let s2 = shard(2);
        let res: Result<(), &str> = activate(&s1, &[], async {
            let inner: Result<(), &str> =
                activate(&s2, &[], async { Err("boom") }).await;
            assert_eq!(current_id(&Category::PRIMARY), Some(1));
            inner
        })
        .await;
        assert_eq!(res, Err("boom"));
        assert_eq!(current_id(&Category::PRIMARY), None);
    }

    #[test]
    fn test_restores_after_panic() {
        let s1 = shard(1);
        let s2 = shard(2);
        activate_sync(&s1, &[], || {
            let caught = std::panic::catch_unwind(|| {
                activate_sync(&s2, &[], || panic!("boom"));
            });
            assert!(caught.is_err());
            assert_eq!(current_id(&Category::PRIMARY), Some(1));
        });
        assert_eq!(current_id(&Category::PRIMARY), None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_tasks_are_isolated() {
        let s1 = shard(1);
        let s2 = shard(2);
        activate(&s1, &[], async {
            let seen = tokio::spawn(async { current_id(&Category::PRIMARY) })
                .await
                .unwrap();
            assert_eq!(seen, None);
            let other = tokio::spawn(activate(&s2, &[], async {
                tokio::task::yield_now().await;
                current_id(&Category::PRIMARY)
            }));
            assert_eq!(other.await.unwrap(), Some(2));
            assert_eq!(current_id(&Category::PRIMARY), Some(1));
        })
        .await;
    }

    #[tokio::test]
    async fn test_environment_scope() {
        assert_eq!(current_environment(), Environment::PRIMARY);
        activate_environment(Environment::SECONDARY, async {
            assert_eq!(current_environment(), Environment::SECONDARY);
            activate(&shard(1), &[], async {
                assert_eq!(current_environment(), Environment::SECONDARY);
            })
            .await;
        })
        .await;
        assert_eq!(current_environment(), Environment::PRIMARY);
    }

    #[tokio::test]
    async fn test_with_each_shard() {
        let shards = vec![shard(3), shard(1), shard(2)];
        let out: Vec<ShardId> =
            with_each_shard(&shards, &[], |s| async move {
                assert_eq!(current_id(&Category::PRIMARY), Some(s.id));
                Ok::<_, ()>(s.id)
            })
            .await
            .unwrap();
        assert_eq!(out, vec![3, 1, 2]);
        assert_eq!(current_id(&Category::PRIMARY), None);
    }

    #[tokio::test]
    async fn test_partition_visits_each_item_once() {
        let s1 = shard(1);
        let s2 = shard(2);
        let items: Vec<Item> = (0..10)
            .map(|key| Item {
                key,
                shard: if key % 3 == 0 { s1.clone() } else { s2.clone() },
            })
            .collect();
        let groups = partition_by_shard(items, &[], |s, subset| async move {
            assert_eq!(current_id(&Category::PRIMARY), Some(s.id));
            assert!(subset.iter().all(|i| i.shard == s));
            Ok::<_, ()>(subset.into_iter().map(|i| i.key).collect::<Vec<_>>())
        })
        .await
        .unwrap();
        // s1 holds key 0, which comes first
        assert_eq!(groups[0], vec![0, 3, 6, 9]);
        let all: Vec<u32> = groups.into_iter().flatten().collect();
        assert_eq!(all.len(), 10);
        assert_eq!(all.iter().collect::<HashSet<_>>().len(), 10);
    }

    #[tokio::test]
    async fn test_partition_error_restores_context() {
        let s1 = shard(1);
        let outer = shard(9);
        let items = vec![Item {
            key: 1,
            shard: s1.clone(),
        }];
        activate(&outer, &[], async {
            let res: Result<Vec<()>, String> =
                partition_by_shard(items, &[], |s, _| async move {
                    Err(format!("failed on {}", s.id))
                })
                .await;
            assert_eq!(res, Err("failed on 1".to_string()));
            assert_eq!(current_id(&Category::PRIMARY), Some(9));
        })
        .await;
    }

    #[tokio::test]
    async fn test_partition_with_shard_of() {
        let s1 = shard(1);
        let s2 = shard(2);
        let values = vec![10, 21, 30, 41];
        let groups = partition_by_shard_with(
            values,
            &[],
            |v: &i32| {
                Ok::<_, ()>(if v % 2 == 0 { s1.clone() } else { s2.clone() })
            },
            |_, subset| async move { Ok(subset) },
        )
        .await
        .unwrap();
        assert_eq!(groups, vec![vec![10, 30], vec![21, 41]]);
    }
}
