#![allow(dead_code)]

use std::{collections::BTreeMap, sync::Arc};

use shardline::{
    Category, DatabaseServer, ServerConfig, Shard, ShardRegistry, Switchboard,
    SwitchboardConfig,
    memory::MemoryAdapter,
    record::{ModelMeta, Row, Value},
    server::{AdapterKind, DbConfig},
};

pub const M: i64 = shardline::IDS_PER_SHARD;

/// One connection per pool so checkouts are deterministic.
pub fn config() -> SwitchboardConfig {
    SwitchboardConfig {
        max_open: 1,
        max_idle: 1,
        get_timeout_ms: 2000,
        ..Default::default()
    }
}

pub fn main_server() -> DatabaseServer {
    DatabaseServer::new(
        "main",
        ServerConfig::new(
            DbConfig::new(AdapterKind::Memory)
                .with_host("db-main")
                .with_database("main"),
        ),
    )
}

pub fn board(adapter: &MemoryAdapter) -> Switchboard<MemoryAdapter> {
    adapter.create_namespace("main");
    Switchboard::new(
        adapter.clone(),
        ShardRegistry::new(main_server()),
        config(),
    )
}

/// Register shard `id` named `s<id>` on `server` and create its namespace.
pub fn add_shard(
    board: &Switchboard<MemoryAdapter>,
    adapter: &MemoryAdapter,
    id: i64,
    server: &str,
) -> Arc<Shard> {
    let name = format!("s{id}");
    adapter.create_namespace(&name);
    board
        .registry()
        .register(Shard::new(id, Some(name), Some(server.to_string())))
}

pub fn posts() -> Arc<ModelMeta> {
    Arc::new(ModelMeta::new("posts", Category::PRIMARY))
}

pub fn comments() -> Arc<ModelMeta> {
    Arc::new(
        ModelMeta::new("comments", Category::PRIMARY)
            .with_foreign_key("post_id", Category::PRIMARY),
    )
}

pub fn row(
    shard: &Arc<Shard>,
    model: &Arc<ModelMeta>,
    values: &[(&str, Value)],
) -> Row {
    let values: BTreeMap<String, Value> = values
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect();
    Row::new(shard.clone(), model.clone(), values)
}

pub fn ids(rows: &[Row]) -> Vec<i64> {
    let mut out: Vec<i64> = rows
        .iter()
        .filter_map(|r| r.values().get("id").and_then(Value::as_i64))
        .collect();
    out.sort();
    out
}
