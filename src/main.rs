// A small inspection tool over the library: show a database's header and
// schema, or dump a table's rows.
//
//   sharc <file> info
//   sharc <file> schema
//   sharc <file> dump <table>

use anyhow::{bail, Context, Result};
use itertools::Itertools;

use sharc::{Database, OpenOptions};

fn main() -> Result<()> {
    env_logger::init();
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        bail!("usage: sharc <file> info | schema | dump <table>");
    }
    let path = &args[1];
    let db = Database::open(path, OpenOptions::new().allow_format_downgrade(true))
        .with_context(|| format!("opening {}", path))?;

    match args[2].as_str() {
        "info" => print_info(&db),
        "schema" => print_schema(&db),
        "dump" => {
            let table = args.get(3).context("usage: sharc <file> dump <table>")?;
            dump_table(&db, table)?;
        }
        cmd => bail!("unknown command {}", cmd),
    }
    Ok(())
}

fn print_info(db: &Database) {
    let h = db.header();
    println!("page size:      {}", h.page_size);
    println!("page count:     {}", h.page_count);
    println!("reserved bytes: {}", h.reserved_bytes_per_page);
    println!("change counter: {}", h.file_change_counter);
    println!("schema format:  {}", h.schema_format);
    println!("text encoding:  {}", h.text_encoding);
    println!("freelist pages: {}", h.freelist_count);
}

fn print_schema(db: &Database) {
    for table in &db.schema().tables {
        let columns = table
            .columns
            .iter()
            .map(|c| match &c.decl_type {
                Some(t) => format!("{} {}", c.name, t),
                None => c.name.clone(),
            })
            .join(", ");
        println!("table {} (root {}): {}", table.name, table.root_page, columns);
    }
    for index in &db.schema().indexes {
        let columns = index.columns.iter().map(|c| c.name.as_str()).join(", ");
        println!(
            "index {} on {} (root {}): {}",
            index.name, index.table, index.root_page, columns
        );
    }
    for view in &db.schema().views {
        println!("view {}", view.name);
    }
}

fn dump_table(db: &Database, table: &str) -> Result<()> {
    let mut reader = db.reader(table)?;
    let mut rows = 0_u64;
    while reader.read()? {
        let cells: Vec<String> = (0..reader.column_count())
            .map(|i| reader.get_value(i).map(|v| v.to_string()))
            .collect::<sharc::Result<_>>()?;
        println!("{}", cells.iter().join("|"));
        rows += 1;
    }
    eprintln!("{} rows", rows);
    Ok(())
}
