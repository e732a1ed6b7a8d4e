//! Purpose: Execute parsed CLI commands against a store.
//! Role: Keeps `main.rs` focused on argument parsing and output plumbing.
//! Invariants: The store is closed before the command's result is returned.
use std::io;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use clap::CommandFactory;
use serde_json::{Value, json};
use stowage::api::{Error, ErrorKind, Map, Queue, Store, StoreOptions, TableKind};

use super::{Cli, Command, MapCommand, QueueCommand, RunOutcome, emit_json};

pub(super) fn dispatch_command(
    command: Command,
    db: PathBuf,
    sweep_interval: Option<Duration>,
) -> Result<RunOutcome, Error> {
    if let Command::Completion { shell } = command {
        let mut cmd = Cli::command();
        clap_complete::aot::generate(shell, &mut cmd, "stowage", &mut io::stdout());
        return Ok(RunOutcome::ok());
    }

    let mut options = StoreOptions::new();
    if let Some(interval) = sweep_interval {
        options = options.with_sweep_interval(interval);
    }
    let store = Store::open_with(&db, options)?;
    tracing::debug!(path = %db.display(), "opened store");

    let result = run_with_store(&store, command);
    let closed = store.close();
    let output = result?;
    closed?;
    emit_json(output);
    Ok(RunOutcome::ok())
}

fn run_with_store(store: &Store, command: Command) -> Result<Value, Error> {
    match command {
        Command::Tables => {
            let tables = store
                .existing_tables()?
                .into_iter()
                .map(|name| {
                    let kind = TableKind::from_table_name(&name).map(TableKind::prefix);
                    json!({ "name": name, "kind": kind })
                })
                .collect::<Vec<_>>();
            Ok(json!({
                "path": store.path().display().to_string(),
                "tables": tables,
            }))
        }
        Command::Sweep => {
            for name in store.existing_tables()? {
                if let Some(kind) = TableKind::from_table_name(&name) {
                    store.register_table(kind, &name);
                }
            }
            let swept = store
                .sweep_now()?
                .into_iter()
                .map(|report| json!({ "table": report.table, "removed": report.removed }))
                .collect::<Vec<_>>();
            Ok(json!({ "swept": swept }))
        }
        Command::Map { command } => run_map(store, command),
        Command::Queue { command } => run_queue(store, command),
        Command::Completion { .. } => Err(Error::new(ErrorKind::Internal)
            .with_message("completion is handled before opening the store")),
    }
}

fn run_map(store: &Store, command: MapCommand) -> Result<Value, Error> {
    match command {
        MapCommand::Set {
            name,
            key,
            value,
            ttl_ms,
        } => {
            let map: Map<Value, Value> = Map::new(store, &name)?;
            let key = parse_json("key", &key)?;
            let value = parse_json("value", &value)?;
            let ttl = ttl_from_ms(ttl_ms);
            map.set_ex(&key, &value, ttl)?;
            Ok(json!({
                "table": map.table_name(),
                "key": key,
                "expires": expiry_rfc3339(ttl),
            }))
        }
        MapCommand::Get { name, key } => {
            let map: Map<Value, Value> = Map::new(store, &name)?;
            let key = parse_json("key", &key)?;
            let value = map.get(&key)?;
            Ok(json!({
                "key": key,
                "found": value.is_some(),
                "value": value,
            }))
        }
        MapCommand::Del { name, key } => {
            let map: Map<Value, Value> = Map::new(store, &name)?;
            let key = parse_json("key", &key)?;
            map.delete(&key)?;
            Ok(json!({ "deleted": key }))
        }
        MapCommand::List { name } => {
            let map: Map<Value, Value> = Map::new(store, &name)?;
            let entries = map
                .entries()
                .map(|(key, value)| json!({ "key": key, "value": value }))
                .collect::<Vec<_>>();
            if let Some(err) = map.iter_error() {
                return Err(err);
            }
            Ok(json!({ "table": map.table_name(), "entries": entries }))
        }
        MapCommand::Size { name } => {
            let map: Map<Value, Value> = Map::new(store, &name)?;
            Ok(json!({ "table": map.table_name(), "size": map.size()? }))
        }
    }
}

fn run_queue(store: &Store, command: QueueCommand) -> Result<Value, Error> {
    match command {
        QueueCommand::Push {
            name,
            value,
            ttl_ms,
        } => {
            let queue: Queue<Value> = Queue::new(store, &name)?;
            let value = parse_json("value", &value)?;
            let ttl = ttl_from_ms(ttl_ms);
            queue.enqueue_ex(&value, ttl)?;
            Ok(json!({
                "table": queue.table_name(),
                "expires": expiry_rfc3339(ttl),
            }))
        }
        QueueCommand::Pop { name } => {
            let queue: Queue<Value> = Queue::new(store, &name)?;
            let value = queue.dequeue()?;
            Ok(json!({ "found": value.is_some(), "value": value }))
        }
        QueueCommand::Peek { name } => {
            let queue: Queue<Value> = Queue::new(store, &name)?;
            let value = queue.peek()?;
            Ok(json!({ "found": value.is_some(), "value": value }))
        }
        QueueCommand::List { name } => {
            let queue: Queue<Value> = Queue::new(store, &name)?;
            let values = queue.entries().collect::<Vec<_>>();
            if let Some(err) = queue.iter_error() {
                return Err(err);
            }
            Ok(json!({ "table": queue.table_name(), "values": values }))
        }
        QueueCommand::Size { name } => {
            let queue: Queue<Value> = Queue::new(store, &name)?;
            Ok(json!({ "table": queue.table_name(), "size": queue.size()? }))
        }
    }
}

fn parse_json(what: &str, input: &str) -> Result<Value, Error> {
    serde_json::from_str(input).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("{what} is not valid JSON"))
            .with_source(err)
    })
}

fn ttl_from_ms(ttl_ms: Option<u64>) -> Duration {
    ttl_ms.map(Duration::from_millis).unwrap_or(Duration::ZERO)
}

/// Wall-clock expiry for a write made now, or `None` when it never expires.
fn expiry_rfc3339(ttl: Duration) -> Option<String> {
    use time::format_description::well_known::Rfc3339;
    if ttl.is_zero() {
        return None;
    }
    let at = SystemTime::now().duration_since(UNIX_EPOCH).ok()? + ttl;
    let ts = time::OffsetDateTime::from_unix_timestamp_nanos(at.as_nanos() as i128).ok()?;
    ts.format(&Rfc3339).ok()
}

#[cfg(test)]
mod tests {
    use super::{expiry_rfc3339, parse_json, ttl_from_ms};
    use std::time::Duration;
    use stowage::api::ErrorKind;

    #[test]
    fn invalid_json_is_a_usage_error() {
        let err = parse_json("value", "{not json").expect_err("invalid");
        assert_eq!(err.kind(), ErrorKind::Usage);
        assert_eq!(err.message(), Some("value is not valid JSON"));
    }

    #[test]
    fn missing_ttl_never_expires() {
        assert_eq!(ttl_from_ms(None), Duration::ZERO);
        assert_eq!(expiry_rfc3339(Duration::ZERO), None);
        let rendered = expiry_rfc3339(Duration::from_secs(60)).expect("rfc3339");
        assert!(rendered.contains('T'));
    }
}
