//! Parses the creation statements the schema table stores.
//!
//! The engine has no query language, but the on-disk schema records each
//! table and index as the `CREATE ...` text that made it, so recovering
//! column names, ordinals, primary keys and index definitions requires
//! parsing exactly that much SQL and nothing more.

use pest::Parser;

#[derive(Parser)]
#[grammar = "sql.pest"]
pub struct SQLParser;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Unparsable creation statement: {0}")]
    Syntax(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateColumn {
    pub name: String,
    pub decl_type: Option<String>,
    pub primary_key: bool,
    pub collation: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateTable {
    pub name: String,
    pub columns: Vec<CreateColumn>,
    /// Primary-key column names, column-level or table-level.
    pub primary_key: Vec<String>,
    pub without_rowid: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexedColumnDef {
    pub name: String,
    pub collation: Option<String>,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndex {
    pub name: String,
    pub table: String,
    pub unique: bool,
    pub columns: Vec<IndexedColumnDef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CreateView {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CreateStatement {
    Table(CreateTable),
    Index(CreateIndex),
    View(CreateView),
}

// Strips "double", [bracket] or `backtick` quoting.
fn unquote(s: &str) -> String {
    let b = s.as_bytes();
    if b.len() >= 2 {
        let (first, last) = (b[0], b[b.len() - 1]);
        if (first == b'"' && last == b'"')
            || (first == b'[' && last == b']')
            || (first == b'`' && last == b'`')
        {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

type Pair<'a> = pest::iterators::Pair<'a, Rule>;

fn extract_indexed_column(pair: Pair) -> IndexedColumnDef {
    let mut def = IndexedColumnDef {
        name: String::new(),
        collation: None,
        descending: false,
    };
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::column_name => def.name = unquote(p.as_str()),
            Rule::collate_clause => {
                def.collation = p
                    .into_inner()
                    .find(|q| q.as_rule() == Rule::collation_name)
                    .map(|q| unquote(q.as_str()));
            }
            Rule::sort_order => def.descending = p.as_str().eq_ignore_ascii_case("desc"),
            _ => {}
        }
    }
    def
}

fn extract_column_def(pair: Pair) -> CreateColumn {
    let mut col = CreateColumn {
        name: String::new(),
        decl_type: None,
        primary_key: false,
        collation: None,
    };
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::column_name => col.name = unquote(p.as_str()),
            Rule::type_name => {
                // Join the words, dropping any "(n, m)" size arguments.
                let words: Vec<&str> = p
                    .into_inner()
                    .filter(|q| q.as_rule() == Rule::type_word)
                    .map(|q| q.as_str())
                    .collect();
                col.decl_type = Some(words.join(" "));
            }
            Rule::column_constraint => {
                for c in p.into_inner() {
                    match c.as_rule() {
                        Rule::primary_key => col.primary_key = true,
                        Rule::collate_clause => {
                            col.collation = c
                                .into_inner()
                                .find(|q| q.as_rule() == Rule::collation_name)
                                .map(|q| unquote(q.as_str()));
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    col
}

fn extract_create_table(pair: Pair) -> CreateTable {
    let mut table = CreateTable {
        name: String::new(),
        columns: Vec::new(),
        primary_key: Vec::new(),
        without_rowid: false,
    };
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::table_identifier => table.name = unquote(p.as_str()),
            Rule::without_rowid => table.without_rowid = true,
            Rule::column_defs => {
                for d in p.into_inner() {
                    match d.as_rule() {
                        Rule::column_def => table.columns.push(extract_column_def(d)),
                        Rule::table_constraint => {
                            for c in d.into_inner() {
                                if c.as_rule() == Rule::table_primary_key {
                                    for ic in c.into_inner() {
                                        if ic.as_rule() == Rule::indexed_column {
                                            table.primary_key.push(extract_indexed_column(ic).name);
                                        }
                                    }
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }
    // Fold column-level primary keys in, declaration order.
    for col in &table.columns {
        if col.primary_key && !table.primary_key.contains(&col.name) {
            table.primary_key.push(col.name.clone());
        }
    }
    table
}

fn extract_create_index(pair: Pair) -> CreateIndex {
    let mut index = CreateIndex {
        name: String::new(),
        table: String::new(),
        unique: false,
        columns: Vec::new(),
    };
    for p in pair.into_inner() {
        match p.as_rule() {
            Rule::unique_kw => index.unique = true,
            Rule::index_identifier => index.name = unquote(p.as_str()),
            Rule::table_identifier => index.table = unquote(p.as_str()),
            Rule::indexed_column => index.columns.push(extract_indexed_column(p)),
            _ => {}
        }
    }
    index
}

/// Parses one creation statement as stored in the schema table.
pub fn parse_create_statement(sql: &str) -> Result<CreateStatement, Error> {
    let mut pairs = SQLParser::parse(Rule::create_stmt, sql)
        .map_err(|e| Error::Syntax(e.to_string()))?;
    let stmt = pairs.next().ok_or_else(|| Error::Syntax(sql.to_string()))?;
    for p in stmt.into_inner() {
        match p.as_rule() {
            Rule::create_table_stmt => return Ok(CreateStatement::Table(extract_create_table(p))),
            Rule::create_index_stmt => return Ok(CreateStatement::Index(extract_create_index(p))),
            Rule::create_view_stmt => {
                let name = p
                    .into_inner()
                    .find(|q| q.as_rule() == Rule::table_identifier)
                    .map(|q| unquote(q.as_str()))
                    .unwrap_or_default();
                return Ok(CreateStatement::View(CreateView { name }));
            }
            Rule::EOI => {}
            _ => {}
        }
    }
    Err(Error::Syntax(sql.to_string()))
}

#[test]
fn test_parse_minimal_create_table() {
    let stmt = parse_create_statement("CREATE TABLE t (x INTEGER, y TEXT)").unwrap();
    match stmt {
        CreateStatement::Table(t) => {
            assert_eq!(t.name, "t");
            assert_eq!(t.columns.len(), 2);
            assert_eq!(t.columns[0].name, "x");
            assert_eq!(t.columns[0].decl_type.as_deref(), Some("INTEGER"));
            assert_eq!(t.columns[1].name, "y");
            assert_eq!(t.columns[1].decl_type.as_deref(), Some("TEXT"));
            assert!(t.primary_key.is_empty());
            assert!(!t.without_rowid);
        }
        other => panic!("wrong statement: {:?}", other),
    }
}

#[test]
fn test_parse_create_table_with_constraints() {
    let sql = "create table inventory (\n  id integer primary key autoincrement,\n  sku text not null unique collate nocase,\n  qty int default 0,\n  price real default (1.0 + 2),\n  note varchar(40) default 'n/a'\n)";
    let stmt = parse_create_statement(sql).unwrap();
    match stmt {
        CreateStatement::Table(t) => {
            assert_eq!(t.name, "inventory");
            let names: Vec<&str> = t.columns.iter().map(|c| c.name.as_str()).collect();
            assert_eq!(names, vec!["id", "sku", "qty", "price", "note"]);
            assert!(t.columns[0].primary_key);
            assert_eq!(t.primary_key, vec!["id"]);
            assert_eq!(t.columns[1].collation.as_deref(), Some("nocase"));
            assert_eq!(t.columns[4].decl_type.as_deref(), Some("varchar"));
        }
        other => panic!("wrong statement: {:?}", other),
    }
}

#[test]
fn test_parse_table_level_primary_key_and_without_rowid() {
    let sql = "CREATE TABLE m (a TEXT, b INT, c BLOB, PRIMARY KEY (a, b)) WITHOUT ROWID";
    match parse_create_statement(sql).unwrap() {
        CreateStatement::Table(t) => {
            assert_eq!(t.primary_key, vec!["a", "b"]);
            assert!(t.without_rowid);
        }
        other => panic!("wrong statement: {:?}", other),
    }
}

#[test]
fn test_parse_quoted_identifiers() {
    let sql = "CREATE TABLE \"order\" ([group] TEXT, `select` INT)";
    match parse_create_statement(sql).unwrap() {
        CreateStatement::Table(t) => {
            assert_eq!(t.name, "order");
            assert_eq!(t.columns[0].name, "group");
            assert_eq!(t.columns[1].name, "select");
        }
        other => panic!("wrong statement: {:?}", other),
    }
}

#[test]
fn test_parse_create_index() {
    let sql = "CREATE UNIQUE INDEX idx_k ON t (k COLLATE NOCASE DESC, j)";
    match parse_create_statement(sql).unwrap() {
        CreateStatement::Index(i) => {
            assert_eq!(i.name, "idx_k");
            assert_eq!(i.table, "t");
            assert!(i.unique);
            assert_eq!(i.columns.len(), 2);
            assert_eq!(i.columns[0].name, "k");
            assert_eq!(i.columns[0].collation.as_deref(), Some("NOCASE"));
            assert!(i.columns[0].descending);
            assert_eq!(i.columns[1].name, "j");
            assert!(!i.columns[1].descending);
        }
        other => panic!("wrong statement: {:?}", other),
    }
}

#[test]
fn test_parse_create_view() {
    let sql = "CREATE VIEW v AS SELECT a, b FROM t WHERE a > 1";
    match parse_create_statement(sql).unwrap() {
        CreateStatement::View(v) => assert_eq!(v.name, "v"),
        other => panic!("wrong statement: {:?}", other),
    }
}

#[test]
fn test_parse_rejects_non_creation_sql() {
    assert!(parse_create_statement("SELECT * FROM t").is_err());
    assert!(parse_create_statement("CREATE TABLE").is_err());
}
