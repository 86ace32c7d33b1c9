//! Source query files and the `{name}` placeholder templating they may use.
//!
//! Placeholders are `{` + identifier + `}` where the identifier matches
//! `[A-Za-z_][A-Za-z0-9_]*`. Any other brace is kept as is, so literals such as
//! `'{}'` survive rendering. Values are substituted verbatim: a date parameter
//! meant as a SQL literal must carry its own quotes (`'2026-03-15'`).

use std::{collections::BTreeMap, fs, path::Path};

use crate::BatchError;

/// Reads a whole query file, trims it and strips one trailing `;`.
pub fn load_query_file<P: AsRef<Path>>(path: P) -> Result<String, BatchError> {
    let path = path.as_ref();

    if !path.exists() {
        return Err(BatchError::Configuration(format!(
            "Query file not found: {}",
            path.display()
        )));
    }

    let text = fs::read_to_string(path)?;
    Ok(trim_statement(&text).to_string())
}

/// Trims whitespace and a single trailing semicolon.
pub fn trim_statement(text: &str) -> &str {
    let trimmed = text.trim();
    trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end()
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Placeholder(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryTemplate {
    segments: Vec<Segment>,
}

impl QueryTemplate {
    pub fn parse(text: &str) -> Self {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = text;

        while let Some(open) = rest.find('{') {
            literal.push_str(&rest[..open]);
            let after = &rest[open + 1..];

            match after.find('}') {
                Some(close) if is_identifier(&after[..close]) => {
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Placeholder(after[..close].to_string()));
                    rest = &after[close + 1..];
                }
                _ => {
                    literal.push('{');
                    rest = after;
                }
            }
        }

        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        Self { segments }
    }

    /// Names of the placeholders, in order of appearance.
    pub fn placeholders(&self) -> Vec<&str> {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Placeholder(name) => Some(name.as_str()),
                Segment::Literal(_) => None,
            })
            .collect()
    }

    /// Drops the line starting with `marker` (ignoring indentation) and every line after it.
    pub fn truncate_at(self, marker: &str) -> Self {
        let rendered_lines = self.raw_text();
        let kept: Vec<&str> = rendered_lines
            .lines()
            .take_while(|line| !line.trim_start().starts_with(marker))
            .collect();

        Self::parse(&kept.join("\n"))
    }

    /// Substitutes every placeholder; an unknown placeholder is an error.
    pub fn render(&self, params: &BTreeMap<String, String>) -> Result<String, BatchError> {
        let mut query = String::new();

        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => query.push_str(text),
                Segment::Placeholder(name) => {
                    let value = params.get(name).ok_or_else(|| {
                        BatchError::Configuration(format!(
                            "No value supplied for query placeholder {{{}}}",
                            name
                        ))
                    })?;
                    query.push_str(value);
                }
            }
        }

        Ok(trim_statement(&query).to_string())
    }

    fn raw_text(&self) -> String {
        self.segments
            .iter()
            .map(|segment| match segment {
                Segment::Literal(text) => text.clone(),
                Segment::Placeholder(name) => format!("{{{}}}", name),
            })
            .collect()
    }
}

fn is_identifier(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn placeholders_are_substituted() {
        let template = QueryTemplate::parse(
            "SELECT {fecha_corte} AS fecha_corte, a FROM t WHERE ano >= {desde};",
        );

        assert_eq!(template.placeholders(), vec!["fecha_corte", "desde"]);

        let query = template
            .render(&params(&[("fecha_corte", "'2026-03-15'"), ("desde", "2022")]))
            .unwrap();

        assert_eq!(
            query,
            "SELECT '2026-03-15' AS fecha_corte, a FROM t WHERE ano >= 2022"
        );
    }

    #[test]
    fn non_identifier_braces_are_literal() {
        let template = QueryTemplate::parse("SELECT '{}' , '{1x}', '{a b}' FROM t");

        assert!(template.placeholders().is_empty());
        assert_eq!(
            template.render(&BTreeMap::new()).unwrap(),
            "SELECT '{}' , '{1x}', '{a b}' FROM t"
        );
    }

    #[test]
    fn missing_parameter_is_an_error() {
        let template = QueryTemplate::parse("SELECT {x}");

        assert!(matches!(
            template.render(&BTreeMap::new()),
            Err(BatchError::Configuration(_))
        ));
    }

    #[test]
    fn trailing_block_is_cut_at_marker() {
        let template = QueryTemplate::parse(
            "SELECT {d} AS d\nFROM t;\n  -- Para exportar\nSELECT * FROM other;",
        )
        .truncate_at("-- Para exportar");

        assert_eq!(
            template.render(&params(&[("d", "'2026-01-01'")])).unwrap(),
            "SELECT '2026-01-01' AS d\nFROM t"
        );
    }

    #[test]
    fn query_file_loses_trailing_semicolon() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "  SELECT a, b FROM t;  ").unwrap();

        assert_eq!(load_query_file(file.path()).unwrap(), "SELECT a, b FROM t");
    }

    #[test]
    fn missing_query_file_is_a_configuration_error() {
        let result = load_query_file("/definitely/not/here.sql");
        assert!(matches!(result, Err(BatchError::Configuration(_))));
    }
}
