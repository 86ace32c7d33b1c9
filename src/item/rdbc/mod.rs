/// Query files and `{name}` templating.
pub mod query;

/// Streaming extraction from a source database.
pub mod source_reader;

/// Full-refresh loading into a PostgreSQL table.
pub mod postgres_writer;

/// Returns `true` for identifiers PostgreSQL accepts without quotes (case folded).
fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Column reference for SQL text; plain names are left unquoted so they fold like the source aliases.
pub fn quote_column(name: &str) -> String {
    if is_plain_identifier(name) {
        name.to_string()
    } else {
        quote_identifier(name)
    }
}

/// Schema-qualified table reference, the table name always quoted.
///
/// Destination table names start with digits (`05_beneficios_alumnos`).
pub fn qualified_table(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_column(schema), quote_identifier(table))
}
