mod types;

use std::path::{Path, PathBuf};

use anyhow::Context;
use envconfig::Envconfig;
use serde_json::{Value, json};
use shardline::{
    Environment, ServersFile, Shard, SwitchboardConfig,
    id::{embedded_shard_id, global_id, local_id, relative_id},
};
use tracing::debug;

pub use types::{
    IdOperation, OutputArgs, OutputFormat, ServersOperation, ShardlineCli,
    ShardlineCommands,
};

pub fn run(cli: &ShardlineCli) -> anyhow::Result<()> {
    let value = match &cli.command {
        ShardlineCommands::Id { opt } => handle_id(opt)?,
        ShardlineCommands::Servers { opt, file } => {
            let path = servers_path(file.as_deref())?;
            debug!("read servers from {}", path.display());
            let servers = ServersFile::load(&path)?;
            handle_servers(opt, &servers)?
        }
    };
    println!("{}", format_output(&value, cli.output.format)?);
    Ok(())
}

fn shard(id: i64) -> Shard {
    Shard::new(id, None, None)
}

pub fn handle_id(opt: &IdOperation) -> anyhow::Result<Value> {
    let value = match opt {
        IdOperation::Global { local, shard: id } => {
            json!({ "global": global_id(*local, &shard(*id))? })
        }
        IdOperation::Local { value } => json!({ "local": local_id(*value) }),
        IdOperation::Shard { value } => {
            json!({ "shard": embedded_shard_id(*value) })
        }
        IdOperation::Relative {
            value,
            source,
            target,
        } => {
            let relative =
                relative_id(*value, &shard(*source), &shard(*target))?;
            json!({ "relative": relative })
        }
    };
    Ok(value)
}

fn servers_path(file: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(file) = file {
        return Ok(file.to_path_buf());
    }
    let config = SwitchboardConfig::init_from_env()?;
    config
        .servers_file
        .map(PathBuf::from)
        .context("no servers file given and SHARDLINE_SERVERS_FILE is unset")
}

pub fn handle_servers(
    opt: &ServersOperation,
    servers: &ServersFile,
) -> anyhow::Result<Value> {
    let value = match opt {
        ServersOperation::List => {
            let rows: Vec<Value> = servers
                .servers
                .iter()
                .map(|(id, config)| {
                    let environments: Vec<_> =
                        config.environments.keys().collect();
                    json!({
                        "id": id,
                        "adapter": config.base.adapter,
                        "host": config.base.host,
                        "database": config.base.database,
                        "open": config.base.open,
                        "environments": environments,
                    })
                })
                .collect();
            Value::Array(rows)
        }
        ServersOperation::Config {
            server,
            environment,
        } => {
            let config = find_server(servers, server)?;
            let resolved =
                config.resolve(&Environment::new(environment.clone()));
            match resolved.candidates() {
                Some(list) => serde_json::to_value(list)?,
                None => serde_json::to_value(resolved.first())?,
            }
        }
        ServersOperation::Statements { server, name } => {
            let config = find_server(servers, server)?;
            let password = config
                .resolve(&Environment::DEPLOY)
                .first()
                .password
                .clone();
            json!(servers.sharding.create_statements(
                config.base.adapter,
                name,
                password.as_deref(),
            ))
        }
    };
    Ok(value)
}

fn find_server<'a>(
    servers: &'a ServersFile,
    id: &str,
) -> anyhow::Result<&'a shardline::ServerConfig> {
    servers
        .servers
        .get(id)
        .with_context(|| format!("no server `{id}` in the servers file"))
}

pub fn format_output(
    value: &Value,
    format: OutputFormat,
) -> anyhow::Result<String> {
    Ok(match format {
        OutputFormat::Json => serde_json::to_string_pretty(value)?,
        OutputFormat::Yaml => serde_yaml::to_string(value)?,
    })
}

#[cfg(test)]
mod test {
    use clap::Parser;

    use super::*;

    const M: i64 = shardline::IDS_PER_SHARD;

    const SERVERS: &str = r#"
sharding:
  create_statement:
    - "CREATE SCHEMA %{name}"
    - "GRANT ALL ON %{name} TO app IDENTIFIED BY '%{password}'"
servers:
  main:
    adapter: postgresql
    host: db1
    database: app
  east:
    adapter: postgresql
    host: db2
    database: app
    open: true
    environments:
      deploy:
        password: secret
      secondary:
        - host: db2-ro-a
        - host: db2-ro-b
"#;

    fn id(args: &[&str]) -> Value {
        let cli = ShardlineCli::try_parse_from(args).unwrap();
        match cli.command {
            ShardlineCommands::Id { opt } => handle_id(&opt).unwrap(),
            _ => panic!("not an id command"),
        }
    }

    #[test]
    fn test_id_commands() {
        assert_eq!(
            id(&["shardline", "id", "global", "42", "--shard", "2"]),
            json!({ "global": 2 * M + 42 })
        );
        let global = (M + 42).to_string();
        assert_eq!(
            id(&["shardline", "id", "local", global.as_str()]),
            json!({ "local": 42 })
        );
        assert_eq!(
            id(&["shardline", "id", "shard", global.as_str()]),
            json!({ "shard": 1 })
        );
        assert_eq!(
            id(&["shardline", "id", "shard", "42"]),
            json!({ "shard": null })
        );
        assert_eq!(
            id(&[
                "shardline", "id", "relative", "42", "--source", "1",
                "--target", "2"
            ]),
            json!({ "relative": M + 42 })
        );
    }

    #[test]
    fn test_servers_commands() {
        let servers = ServersFile::parse(SERVERS).unwrap();
        let list = handle_servers(&ServersOperation::List, &servers).unwrap();
        let ids: Vec<_> = list
            .as_array()
            .unwrap()
            .iter()
            .map(|s| s["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["east", "main"]);

        let config = handle_servers(
            &ServersOperation::Config {
                server: "east".into(),
                environment: "secondary".into(),
            },
            &servers,
        )
        .unwrap();
        let hosts: Vec<_> = config
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["host"].as_str().unwrap())
            .collect();
        assert_eq!(hosts, vec!["db2-ro-a", "db2-ro-b"]);

        let statements = handle_servers(
            &ServersOperation::Statements {
                server: "east".into(),
                name: "app_shard_3".into(),
            },
            &servers,
        )
        .unwrap();
        assert_eq!(
            statements,
            json!([
                "CREATE SCHEMA app_shard_3",
                "GRANT ALL ON app_shard_3 TO app IDENTIFIED BY 'secret'"
            ])
        );

        assert!(
            handle_servers(
                &ServersOperation::Config {
                    server: "west".into(),
                    environment: "primary".into(),
                },
                &servers,
            )
            .is_err()
        );
    }

    #[test]
    fn test_format_output() {
        let value = json!({ "local": 42 });
        assert_eq!(
            format_output(&value, OutputFormat::Yaml).unwrap(),
            "local: 42\n"
        );
        assert!(
            format_output(&value, OutputFormat::Json)
                .unwrap()
                .contains("\"local\": 42")
        );
    }
}
