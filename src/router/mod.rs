//! Statement classification into routing decisions.
//!
//! [`decide`] only looks at the command, its analysis and the session's
//! default database. Resolving a decision against a shard map is the
//! session's job.

mod service;

pub use service::RouterService;

use crate::parser::{query_type, SqlAnalysis, StatementKind, TableRef};
use crate::protocol::ClientCommand;
use crate::shard::{TableKey, BUILTIN_IGNORED_SCHEMAS};

/// Where a statement has to go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteDecision {
    /// Answer `SHOW DATABASES` from the shard map
    ShowSchemas,
    /// Answer `SHOW SHARDS` from the shard map
    ShowShards,
    /// Every backend of the session; `record` adds it to the session
    /// command history
    Broadcast { record: bool },
    PreparedStmtOp(PreparedOp),
    /// Backends hosting all of the tables; empty when the statement names
    /// none the router can place
    TableQuery(Vec<TableKey>),
    /// COM_INIT_DB or `USE`
    DatabaseSwitch(String),
    /// Touches no table; any backend will do
    AnyTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreparedOp {
    /// `PREPARE name FROM ...` (named) or COM_STMT_PREPARE (`name` is None)
    Prepare {
        name: Option<String>,
        tables: Vec<TableKey>,
    },
    Execute(String),
    Deallocate(String),
    /// COM_STMT_EXECUTE, SEND_LONG_DATA, RESET, FETCH and CLOSE by the id
    /// the client knows
    Binary(u32),
}

/// Map a command to its routing decision
pub fn decide(
    command: &ClientCommand,
    analysis: Option<&SqlAnalysis>,
    current_db: Option<&str>,
) -> RouteDecision {
    match command {
        ClientCommand::InitDb(db) => RouteDecision::DatabaseSwitch(db.clone()),
        ClientCommand::Ping | ClientCommand::Quit => RouteDecision::Broadcast { record: false },
        ClientCommand::FieldList { table, .. } => {
            let tables = current_db
                .map(|db| vec![TableKey::new(db, table)])
                .unwrap_or_default();
            RouteDecision::TableQuery(tables)
        }
        ClientCommand::StmtPrepare(_) => RouteDecision::PreparedStmtOp(PreparedOp::Prepare {
            name: None,
            tables: analysis
                .map(|a| qualify(&a.tables, current_db))
                .unwrap_or_default(),
        }),
        ClientCommand::StmtExecute(id)
        | ClientCommand::StmtSendLongData(id)
        | ClientCommand::StmtClose(id)
        | ClientCommand::StmtReset(id)
        | ClientCommand::StmtFetch(id) => RouteDecision::PreparedStmtOp(PreparedOp::Binary(*id)),
        ClientCommand::Query(_) => match analysis {
            Some(analysis) => decide_query(analysis, current_db),
            None => RouteDecision::TableQuery(Vec::new()),
        },
        ClientCommand::Other(..) => RouteDecision::AnyTarget,
    }
}

fn decide_query(analysis: &SqlAnalysis, current_db: Option<&str>) -> RouteDecision {
    let name = || analysis.statement_name.clone().unwrap_or_default();

    match analysis.kind {
        StatementKind::Use => {
            return RouteDecision::DatabaseSwitch(analysis.database.clone().unwrap_or_default())
        }
        StatementKind::ShowDatabases => return RouteDecision::ShowSchemas,
        StatementKind::ShowShards => return RouteDecision::ShowShards,
        StatementKind::ShowTables => {
            let db = analysis.database.as_deref().or(current_db);
            return RouteDecision::TableQuery(db.map(|db| vec![TableKey::schema(db)]).unwrap_or_default());
        }
        StatementKind::Prepare => {
            return RouteDecision::PreparedStmtOp(PreparedOp::Prepare {
                name: Some(name()),
                tables: qualify(&analysis.tables, current_db),
            })
        }
        StatementKind::Execute => return RouteDecision::PreparedStmtOp(PreparedOp::Execute(name())),
        StatementKind::Deallocate => {
            return RouteDecision::PreparedStmtOp(PreparedOp::Deallocate(name()))
        }
        _ => {}
    }

    if analysis.has(query_type::SESSION_STATE) {
        return RouteDecision::Broadcast { record: true };
    }

    let tables = qualify(&analysis.tables, current_db);
    if tables.is_empty() && analysis.has(query_type::SYSVAR_READ) {
        return RouteDecision::AnyTarget;
    }
    RouteDecision::TableQuery(tables)
}

/// Qualify with the default database; unqualified names without one and
/// system schemas are dropped
fn qualify(tables: &[TableRef], current_db: Option<&str>) -> Vec<TableKey> {
    let mut keys: Vec<TableKey> = Vec::with_capacity(tables.len());
    for table in tables {
        let Some(schema) = table.schema.as_deref().or(current_db) else {
            continue;
        };
        let key = TableKey::new(schema, &table.table);
        if BUILTIN_IGNORED_SCHEMAS.contains(&key.schema_name()) {
            continue;
        }
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::SqlAnalyzer;

    fn decide_sql(sql: &str, db: Option<&str>) -> RouteDecision {
        let analysis = SqlAnalyzer::new().analyze(sql).unwrap();
        decide(&ClientCommand::Query(sql.to_string()), Some(&analysis), db)
    }

    #[test]
    fn test_session_state_is_broadcast() {
        for sql in ["BEGIN", "COMMIT", "SET autocommit=0", "SET NAMES utf8mb4", "SET @a = 1"] {
            assert_eq!(decide_sql(sql, None), RouteDecision::Broadcast { record: true }, "{sql}");
        }
        assert_eq!(
            decide(&ClientCommand::Ping, None, None),
            RouteDecision::Broadcast { record: false }
        );
    }

    #[test]
    fn test_tables_qualified_with_default_db() {
        assert_eq!(
            decide_sql("SELECT * FROM orders JOIN hr.people", Some("Sales")),
            RouteDecision::TableQuery(vec![
                TableKey::new("sales", "orders"),
                TableKey::new("hr", "people")
            ])
        );
        // Without a default database an unqualified table cannot be placed
        assert_eq!(
            decide_sql("SELECT * FROM orders", None),
            RouteDecision::TableQuery(vec![])
        );
    }

    #[test]
    fn test_system_schemas_dropped() {
        assert_eq!(
            decide_sql(
                "SELECT * FROM information_schema.tables t JOIN sales.orders o ON t.table_name = o.name",
                None
            ),
            RouteDecision::TableQuery(vec![TableKey::new("sales", "orders")])
        );
    }

    #[test]
    fn test_database_switch() {
        assert_eq!(
            decide_sql("USE sales", None),
            RouteDecision::DatabaseSwitch("sales".into())
        );
        assert_eq!(
            decide(&ClientCommand::InitDb("hr".into()), None, Some("sales")),
            RouteDecision::DatabaseSwitch("hr".into())
        );
    }

    #[test]
    fn test_synthetic_and_show_tables() {
        assert_eq!(decide_sql("SHOW DATABASES", None), RouteDecision::ShowSchemas);
        assert_eq!(decide_sql("SHOW SHARDS", None), RouteDecision::ShowShards);
        assert_eq!(
            decide_sql("SHOW TABLES FROM hr", Some("sales")),
            RouteDecision::TableQuery(vec![TableKey::schema("hr")])
        );
        assert_eq!(
            decide_sql("SHOW TABLES", Some("sales")),
            RouteDecision::TableQuery(vec![TableKey::schema("sales")])
        );
    }

    #[test]
    fn test_prepared_statements() {
        assert_eq!(
            decide_sql("PREPARE s1 FROM 'SELECT * FROM people'", Some("hr")),
            RouteDecision::PreparedStmtOp(PreparedOp::Prepare {
                name: Some("s1".into()),
                tables: vec![TableKey::new("hr", "people")]
            })
        );
        assert_eq!(
            decide_sql("EXECUTE s1", None),
            RouteDecision::PreparedStmtOp(PreparedOp::Execute("s1".into()))
        );
        assert_eq!(
            decide_sql("DEALLOCATE PREPARE s1", None),
            RouteDecision::PreparedStmtOp(PreparedOp::Deallocate("s1".into()))
        );
        assert_eq!(
            decide(&ClientCommand::StmtClose(3), None, None),
            RouteDecision::PreparedStmtOp(PreparedOp::Binary(3))
        );

        let sql = "SELECT * FROM orders WHERE id = ?";
        let analysis = SqlAnalyzer::new().analyze(sql).unwrap();
        assert_eq!(
            decide(&ClientCommand::StmtPrepare(sql.into()), Some(&analysis), Some("sales")),
            RouteDecision::PreparedStmtOp(PreparedOp::Prepare {
                name: None,
                tables: vec![TableKey::new("sales", "orders")]
            })
        );
    }

    #[test]
    fn test_field_list_and_any_target() {
        assert_eq!(
            decide(
                &ClientCommand::FieldList {
                    table: "orders".into(),
                    wildcard: String::new()
                },
                None,
                Some("sales")
            ),
            RouteDecision::TableQuery(vec![TableKey::new("sales", "orders")])
        );
        assert_eq!(decide_sql("SELECT @@version", None), RouteDecision::AnyTarget);
        assert_eq!(decide_sql("SELECT 1", None), RouteDecision::TableQuery(vec![]));
    }
}
