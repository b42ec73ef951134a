use std::ops::ControlFlow;

use sqlparser::ast::{visit_relations, ObjectName};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::{Token, Tokenizer};
use tracing::debug;

/// Bits of [`SqlAnalysis::type_mask`]
pub mod query_type {
    /// BEGIN, COMMIT, ROLLBACK, SAVEPOINT
    pub const TRANSACTION: u32 = 1 << 0;
    pub const AUTOCOMMIT_ON: u32 = 1 << 1;
    pub const AUTOCOMMIT_OFF: u32 = 1 << 2;
    /// Session variable or character set change
    pub const SESSION_WRITE: u32 = 1 << 3;
    pub const USERVAR_WRITE: u32 = 1 << 4;
    pub const GSYSVAR_WRITE: u32 = 1 << 5;
    /// Reads `@@` system variables
    pub const SYSVAR_READ: u32 = 1 << 6;
    pub const PREPARE_NAMED: u32 = 1 << 7;
    pub const EXEC_NAMED: u32 = 1 << 8;
    pub const DEALLOC_NAMED: u32 = 1 << 9;
    pub const READ: u32 = 1 << 10;
    pub const WRITE: u32 = 1 << 11;

    /// Anything that changes state every backend of a session must share
    pub const SESSION_STATE: u32 =
        TRANSACTION | AUTOCOMMIT_ON | AUTOCOMMIT_OFF | SESSION_WRITE | USERVAR_WRITE | GSYSVAR_WRITE;
}

use query_type::*;

/// Operation of a statement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
    Set,
    Use,
    ShowDatabases,
    ShowShards,
    ShowTables,
    Prepare,
    Execute,
    Deallocate,
    Begin,
    Commit,
    Rollback,
    LoadData,
    #[default]
    Other,
}

/// A table as written in the statement; the schema is absent when unqualified
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub schema: Option<String>,
    pub table: String,
}

impl TableRef {
    pub fn new(schema: Option<&str>, table: &str) -> Self {
        Self {
            schema: schema.map(str::to_string),
            table: table.to_string(),
        }
    }
}

/// SQL analysis result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlAnalysis {
    pub kind: StatementKind,
    /// Tables referenced by the statement, or by the prepared text for PREPARE
    pub tables: Vec<TableRef>,
    pub type_mask: u32,
    /// `USE <db>` target or `SHOW TABLES FROM <db>` source
    pub database: Option<String>,
    /// Name used by PREPARE, EXECUTE and DEALLOCATE
    pub statement_name: Option<String>,
    /// Statement text of `PREPARE name FROM '<sql>'`
    pub prepared_sql: Option<String>,
}

impl SqlAnalysis {
    pub fn has(&self, mask: u32) -> bool {
        self.type_mask & mask != 0
    }
}

/// Lexical token with whitespace and comments already dropped
#[derive(Debug, Clone, PartialEq, Eq)]
enum Tok {
    Word { value: String, quoted: bool },
    Str(String),
    Sym(String),
}

impl Tok {
    /// Upper-cased keyword; quoted identifiers are never keywords
    fn keyword(&self) -> Option<String> {
        match self {
            Tok::Word { value, quoted: false } => Some(value.to_ascii_uppercase()),
            _ => None,
        }
    }

    fn word(&self) -> Option<&str> {
        match self {
            Tok::Word { value, .. } => Some(value),
            _ => None,
        }
    }

    fn is_sym(&self, sym: &str) -> bool {
        matches!(self, Tok::Sym(s) if s == sym)
    }
}

/// Keywords that introduce a table name in statements the parser rejects
const TABLE_INTRODUCERS: [&str; 7] = ["FROM", "JOIN", "INTO", "UPDATE", "TABLE", "DESCRIBE", "DESC"];

/// SQL classifier
pub struct SqlAnalyzer {
    dialect: MySqlDialect,
}

impl SqlAnalyzer {
    pub fn new() -> Self {
        Self {
            dialect: MySqlDialect {},
        }
    }

    /// Classify one statement
    pub fn analyze(&self, sql: &str) -> Result<SqlAnalysis, AnalyzerError> {
        let toks = self.lex(sql)?;
        if toks.is_empty() {
            return Err(AnalyzerError::EmptyStatement);
        }

        let kw = |i: usize| toks.get(i).and_then(Tok::keyword);
        let word = |i: usize| toks.get(i).and_then(Tok::word).map(str::to_string);

        let mut analysis = SqlAnalysis::default();
        match kw(0).as_deref() {
            Some("SELECT") | Some("WITH") | Some("VALUES") | Some("TABLE") => {
                analysis.kind = StatementKind::Select;
                analysis.type_mask = READ;
            }
            Some("INSERT") | Some("REPLACE") => {
                analysis.kind = StatementKind::Insert;
                analysis.type_mask = WRITE;
            }
            Some("UPDATE") => {
                analysis.kind = StatementKind::Update;
                analysis.type_mask = WRITE;
            }
            Some("DELETE") => {
                analysis.kind = StatementKind::Delete;
                analysis.type_mask = WRITE;
            }
            Some("DROP") if kw(1).as_deref() == Some("PREPARE") => {
                analysis.kind = StatementKind::Deallocate;
                analysis.type_mask = DEALLOC_NAMED;
                analysis.statement_name = word(2);
            }
            Some("CREATE") | Some("ALTER") | Some("DROP") | Some("TRUNCATE") | Some("RENAME") => {
                analysis.kind = StatementKind::Ddl;
                analysis.type_mask = WRITE;
            }
            Some("SET") => {
                analysis.kind = StatementKind::Set;
                analysis.type_mask = classify_set(&toks[1..]);
            }
            Some("USE") => {
                analysis.kind = StatementKind::Use;
                analysis.database = word(1);
            }
            Some("SHOW") => classify_show(&toks[1..], &mut analysis),
            Some("BEGIN") => {
                analysis.kind = StatementKind::Begin;
                analysis.type_mask = TRANSACTION;
            }
            Some("START") if kw(1).as_deref() == Some("TRANSACTION") => {
                analysis.kind = StatementKind::Begin;
                analysis.type_mask = TRANSACTION;
            }
            Some("COMMIT") => {
                analysis.kind = StatementKind::Commit;
                analysis.type_mask = TRANSACTION;
            }
            Some("ROLLBACK") => {
                analysis.kind = StatementKind::Rollback;
                analysis.type_mask = TRANSACTION;
            }
            Some("SAVEPOINT") | Some("RELEASE") => analysis.type_mask = TRANSACTION,
            Some("PREPARE") => {
                analysis.kind = StatementKind::Prepare;
                analysis.type_mask = PREPARE_NAMED;
                analysis.statement_name = word(1);
                if kw(2).as_deref() == Some("FROM") {
                    if let Some(Tok::Str(inner)) = toks.get(3) {
                        if let Ok(inner_analysis) = self.analyze(inner) {
                            analysis.tables = inner_analysis.tables;
                        }
                        analysis.prepared_sql = Some(inner.clone());
                    }
                }
                return Ok(analysis);
            }
            Some("EXECUTE") => {
                analysis.kind = StatementKind::Execute;
                analysis.type_mask = EXEC_NAMED;
                analysis.statement_name = word(1);
                return Ok(analysis);
            }
            Some("DEALLOCATE") => {
                analysis.kind = StatementKind::Deallocate;
                analysis.type_mask = DEALLOC_NAMED;
                analysis.statement_name = word(2);
                return Ok(analysis);
            }
            Some("LOAD") if kw(1).as_deref() == Some("DATA") => {
                analysis.kind = StatementKind::LoadData;
                analysis.type_mask = WRITE;
                analysis.tables = scan_tables(&toks);
                return Ok(analysis);
            }
            Some("CALL") => analysis.type_mask = WRITE,
            Some("DESCRIBE") | Some("DESC") | Some("EXPLAIN") => analysis.type_mask = READ,
            _ => {}
        }

        match analysis.kind {
            StatementKind::Select
            | StatementKind::Insert
            | StatementKind::Update
            | StatementKind::Delete
            | StatementKind::Ddl
            | StatementKind::Other => {
                analysis.tables = self.extract_tables(sql, &toks);
            }
            _ => {}
        }

        if analysis.kind == StatementKind::Select
            && analysis.tables.is_empty()
            && toks.iter().filter_map(Tok::word).any(|w| w.starts_with("@@"))
        {
            analysis.type_mask |= SYSVAR_READ;
        }

        Ok(analysis)
    }

    fn lex(&self, sql: &str) -> Result<Vec<Tok>, AnalyzerError> {
        let tokens = Tokenizer::new(&self.dialect, sql)
            .tokenize()
            .map_err(|e| AnalyzerError::ParseError(e.to_string()))?;

        let mut out: Vec<Tok> = Vec::with_capacity(tokens.len());
        for token in tokens {
            match token {
                Token::Whitespace(_) | Token::EOF => {}
                Token::Word(w) => {
                    // `@name` and `@@name` may come out as separate tokens
                    let prefix = match out.last() {
                        Some(Tok::Sym(s)) if s == "@" || s == "@@" => Some(s.clone()),
                        _ => None,
                    };
                    let value = match prefix {
                        Some(prefix) => {
                            out.pop();
                            format!("{prefix}{}", w.value)
                        }
                        None => w.value,
                    };
                    out.push(Tok::Word {
                        value,
                        quoted: w.quote_style.is_some(),
                    });
                }
                Token::SingleQuotedString(s) | Token::DoubleQuotedString(s) => out.push(Tok::Str(s)),
                Token::SemiColon => break,
                other => {
                    let sym = other.to_string();
                    if sym == "@" && matches!(out.last(), Some(t) if t.is_sym("@")) {
                        out.pop();
                        out.push(Tok::Sym("@@".to_string()));
                    } else {
                        out.push(Tok::Sym(sym));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Relations from the parsed statement, or a keyword scan when the
    /// parser does not understand it
    fn extract_tables(&self, sql: &str, toks: &[Tok]) -> Vec<TableRef> {
        match Parser::parse_sql(&self.dialect, sql) {
            Ok(statements) => {
                let mut tables = Vec::new();
                for statement in &statements {
                    let _ = visit_relations(statement, |name: &ObjectName| {
                        if let Some(table) = table_ref(name) {
                            if !tables.contains(&table) {
                                tables.push(table);
                            }
                        }
                        ControlFlow::<()>::Continue(())
                    });
                }
                tables
            }
            Err(e) => {
                debug!(error = %e, "Falling back to keyword scan for table names");
                scan_tables(toks)
            }
        }
    }
}

impl Default for SqlAnalyzer {
    fn default() -> Self {
        Self::new()
    }
}

fn table_ref(name: &ObjectName) -> Option<TableRef> {
    let parts = &name.0;
    let table = parts.last()?;
    let schema = parts.len().checked_sub(2).and_then(|i| parts.get(i));
    Some(TableRef {
        schema: schema.map(|s| s.value.clone()),
        table: table.value.clone(),
    })
}

/// `[schema.]table` after FROM, JOIN, INTO, UPDATE and TABLE
fn scan_tables(toks: &[Tok]) -> Vec<TableRef> {
    let mut tables = Vec::new();
    let mut i = 0;
    while i < toks.len() {
        let introduces = toks[i]
            .keyword()
            .map_or(false, |k| TABLE_INTRODUCERS.contains(&k.as_str()));
        i += 1;
        if !introduces {
            continue;
        }
        // INTO TABLE t, LOW_PRIORITY and IGNORE modifiers
        while let Some(k) = toks.get(i).and_then(Tok::keyword) {
            if matches!(k.as_str(), "TABLE" | "IGNORE" | "LOW_PRIORITY") {
                i += 1;
            } else {
                break;
            }
        }
        let Some(first) = toks.get(i).and_then(qualifiable_name) else {
            continue;
        };
        let table = if toks.get(i + 1).map_or(false, |t| t.is_sym(".")) {
            match toks.get(i + 2).and_then(Tok::word) {
                Some(second) => {
                    i += 2;
                    TableRef::new(Some(first), second)
                }
                None => TableRef::new(None, first),
            }
        } else {
            TableRef::new(None, first)
        };
        i += 1;
        if !tables.contains(&table) {
            tables.push(table);
        }
    }
    tables
}

fn qualifiable_name(tok: &Tok) -> Option<&str> {
    match tok {
        Tok::Word { value, quoted: true } => Some(value),
        Tok::Word { value, quoted: false } => {
            let upper = value.to_ascii_uppercase();
            if matches!(upper.as_str(), "SELECT" | "DUAL" | "LATERAL") || value.starts_with('@') {
                None
            } else {
                Some(value)
            }
        }
        _ => None,
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scope {
    Session,
    Global,
}

/// Type bits of a `SET` statement; `toks` starts after SET
fn classify_set(toks: &[Tok]) -> u32 {
    match toks.first().and_then(Tok::keyword).as_deref() {
        Some("NAMES") | Some("CHARSET") | Some("CHARACTER") | Some("TRANSACTION") => {
            return SESSION_WRITE
        }
        _ => {}
    }

    let mut mask = 0;
    let mut scope = Scope::Session;
    let mut expect_var = true;
    let mut depth = 0usize;
    let mut i = 0;

    while i < toks.len() {
        let tok = &toks[i];
        if !expect_var {
            if tok.is_sym("(") {
                depth += 1;
            } else if tok.is_sym(")") {
                depth = depth.saturating_sub(1);
            } else if tok.is_sym(",") && depth == 0 {
                expect_var = true;
                scope = Scope::Session;
            }
            i += 1;
            continue;
        }

        match tok.keyword().as_deref() {
            Some("GLOBAL") | Some("PERSIST") | Some("PERSIST_ONLY") => {
                scope = Scope::Global;
                i += 1;
                continue;
            }
            Some("SESSION") | Some("LOCAL") => {
                scope = Scope::Session;
                i += 1;
                continue;
            }
            _ => {}
        }

        // Dotted variable name, e.g. @@session.autocommit
        let mut name = tok.word().unwrap_or_default().to_string();
        i += 1;
        while toks.get(i).map_or(false, |t| t.is_sym(".")) {
            if let Some(part) = toks.get(i + 1).and_then(Tok::word) {
                name.push('.');
                name.push_str(part);
            }
            i += 2;
        }

        let mut var_scope = scope;
        let lower = name.to_ascii_lowercase();
        let variable = if let Some(sys) = lower.strip_prefix("@@") {
            if let Some(rest) = sys.strip_prefix("global.") {
                var_scope = Scope::Global;
                rest
            } else {
                sys.strip_prefix("session.")
                    .or_else(|| sys.strip_prefix("local."))
                    .unwrap_or(sys)
            }
        } else if lower.starts_with('@') {
            mask |= USERVAR_WRITE;
            expect_var = false;
            continue;
        } else {
            lower.as_str()
        };

        mask |= match var_scope {
            Scope::Global => GSYSVAR_WRITE,
            Scope::Session => SESSION_WRITE,
        };

        if variable == "autocommit" {
            // Skip `=` or `:=`
            let mut j = i;
            while toks.get(j).map_or(false, |t| t.is_sym("=") || t.is_sym(":=") || t.is_sym(":")) {
                j += 1;
            }
            let value = match toks.get(j) {
                Some(Tok::Word { value, .. }) | Some(Tok::Sym(value)) | Some(Tok::Str(value)) => {
                    value.to_ascii_uppercase()
                }
                None => String::new(),
            };
            match value.as_str() {
                "1" | "ON" | "TRUE" => mask |= AUTOCOMMIT_ON,
                "0" | "OFF" | "FALSE" => mask |= AUTOCOMMIT_OFF,
                _ => {}
            }
        }
        expect_var = false;
    }
    mask
}

/// `toks` starts after SHOW
fn classify_show(toks: &[Tok], analysis: &mut SqlAnalysis) {
    analysis.type_mask = READ;
    let kw = |i: usize| toks.get(i).and_then(Tok::keyword);

    let mut i = 0;
    if kw(0).as_deref() == Some("FULL") {
        i = 1;
    }
    match kw(i).as_deref() {
        Some("DATABASES") | Some("SCHEMAS") => analysis.kind = StatementKind::ShowDatabases,
        Some("SHARDS") => analysis.kind = StatementKind::ShowShards,
        Some("TABLES") | Some("TABLE") => {
            analysis.kind = StatementKind::ShowTables;
            let mut j = i + 1;
            if kw(j).as_deref() == Some("STATUS") {
                j += 1;
            }
            if matches!(kw(j).as_deref(), Some("FROM") | Some("IN")) {
                analysis.database = toks.get(j + 1).and_then(Tok::word).map(str::to_string);
            }
        }
        // SHOW CREATE TABLE t, SHOW COLUMNS FROM t, SHOW INDEX FROM t ...
        _ => analysis.tables = scan_tables(toks),
    }
}

/// Analyzer errors
#[derive(Debug, thiserror::Error)]
pub enum AnalyzerError {
    #[error("Failed to parse SQL: {0}")]
    ParseError(String),

    #[error("Empty statement")]
    EmptyStatement,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(sql: &str) -> SqlAnalysis {
        SqlAnalyzer::new().analyze(sql).unwrap()
    }

    #[test]
    fn test_select_with_join() {
        let result =
            analyze("SELECT * FROM sales.orders o JOIN sales.items i ON o.id = i.order_id WHERE o.id = 5");
        assert_eq!(result.kind, StatementKind::Select);
        assert!(result.has(READ));
        assert_eq!(
            result.tables,
            vec![
                TableRef::new(Some("sales"), "orders"),
                TableRef::new(Some("sales"), "items")
            ]
        );
    }

    #[test]
    fn test_insert_analysis() {
        let result = analyze("INSERT INTO users (user_id, name) VALUES (123, 'test')");
        assert_eq!(result.kind, StatementKind::Insert);
        assert_eq!(result.tables, vec![TableRef::new(None, "users")]);
        assert!(result.has(WRITE));
    }

    #[test]
    fn test_transaction_control() {
        for (sql, kind) in [
            ("BEGIN", StatementKind::Begin),
            ("START TRANSACTION", StatementKind::Begin),
            ("COMMIT", StatementKind::Commit),
            ("rollback", StatementKind::Rollback),
        ] {
            let result = analyze(sql);
            assert_eq!(result.kind, kind, "{sql}");
            assert!(result.has(TRANSACTION), "{sql}");
        }
    }

    #[test]
    fn test_set_statements() {
        let result = analyze("SET autocommit=0");
        assert_eq!(result.kind, StatementKind::Set);
        assert!(result.has(AUTOCOMMIT_OFF));
        assert!(result.has(SESSION_WRITE));

        assert!(analyze("SET autocommit = ON").has(AUTOCOMMIT_ON));
        assert!(analyze("SET @@session.autocommit = 1").has(AUTOCOMMIT_ON));
        assert!(analyze("SET NAMES utf8mb4").has(SESSION_WRITE));
        assert!(analyze("SET @total = 10").has(USERVAR_WRITE));

        let global = analyze("SET GLOBAL max_connections = 100");
        assert!(global.has(GSYSVAR_WRITE));
        assert!(!global.has(SESSION_WRITE));

        let mixed = analyze("SET GLOBAL wait_timeout = 10, sql_mode = ''");
        assert!(mixed.has(GSYSVAR_WRITE));
        assert!(mixed.has(SESSION_WRITE));
    }

    #[test]
    fn test_use_and_show() {
        let result = analyze("USE `Sales`");
        assert_eq!(result.kind, StatementKind::Use);
        assert_eq!(result.database.as_deref(), Some("Sales"));

        assert_eq!(analyze("SHOW DATABASES").kind, StatementKind::ShowDatabases);
        assert_eq!(analyze("show schemas").kind, StatementKind::ShowDatabases);
        assert_eq!(analyze("SHOW SHARDS").kind, StatementKind::ShowShards);

        let tables = analyze("SHOW FULL TABLES FROM hr");
        assert_eq!(tables.kind, StatementKind::ShowTables);
        assert_eq!(tables.database.as_deref(), Some("hr"));

        let columns = analyze("SHOW COLUMNS FROM hr.people");
        assert_eq!(columns.kind, StatementKind::Other);
        assert_eq!(columns.tables, vec![TableRef::new(Some("hr"), "people")]);
    }

    #[test]
    fn test_named_prepared_statements() {
        let prepare = analyze("PREPARE stmt1 FROM 'SELECT * FROM hr.people WHERE id = ?'");
        assert_eq!(prepare.kind, StatementKind::Prepare);
        assert!(prepare.has(PREPARE_NAMED));
        assert_eq!(prepare.statement_name.as_deref(), Some("stmt1"));
        assert_eq!(
            prepare.prepared_sql.as_deref(),
            Some("SELECT * FROM hr.people WHERE id = ?")
        );
        assert_eq!(prepare.tables, vec![TableRef::new(Some("hr"), "people")]);

        let execute = analyze("EXECUTE stmt1 USING @id");
        assert_eq!(execute.kind, StatementKind::Execute);
        assert_eq!(execute.statement_name.as_deref(), Some("stmt1"));

        let dealloc = analyze("DEALLOCATE PREPARE stmt1");
        assert_eq!(dealloc.kind, StatementKind::Deallocate);
        assert_eq!(dealloc.statement_name.as_deref(), Some("stmt1"));

        let drop = analyze("DROP PREPARE stmt1");
        assert_eq!(drop.kind, StatementKind::Deallocate);
        assert!(drop.has(DEALLOC_NAMED));
    }

    #[test]
    fn test_load_data() {
        let result = analyze("LOAD DATA LOCAL INFILE '/tmp/orders.csv' INTO TABLE sales.orders");
        assert_eq!(result.kind, StatementKind::LoadData);
        assert_eq!(result.tables, vec![TableRef::new(Some("sales"), "orders")]);
    }

    #[test]
    fn test_system_variable_read() {
        let result = analyze("SELECT @@version_comment LIMIT 1");
        assert!(result.tables.is_empty());
        assert!(result.has(SYSVAR_READ));
        assert!(!analyze("SELECT 1").has(SYSVAR_READ));
    }

    #[test]
    fn test_fallback_scan_on_parse_error() {
        let result = analyze("SELECT * FROM hr.people WHERE");
        assert_eq!(result.kind, StatementKind::Select);
        assert_eq!(result.tables, vec![TableRef::new(Some("hr"), "people")]);
    }

    #[test]
    fn test_empty_statement() {
        let analyzer = SqlAnalyzer::new();
        assert!(matches!(analyzer.analyze("   "), Err(AnalyzerError::EmptyStatement)));
        assert!(matches!(analyzer.analyze("-- nothing"), Err(AnalyzerError::EmptyStatement)));
    }
}
