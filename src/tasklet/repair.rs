//! Post-processing of generated export files.

use std::{fs, path::Path};

use log::info;

use crate::BatchError;

/// A rewrite applied to an export file once it has been written.
pub trait ExportRepair {
    /// Repairs the file in place and returns the number of characters removed.
    fn repair(&self, path: &Path) -> Result<usize, BatchError>;
}

/// Leaves the file untouched.
#[derive(Default)]
pub struct NoRepair {}

impl ExportRepair for NoRepair {
    fn repair(&self, _path: &Path) -> Result<usize, BatchError> {
        Ok(0)
    }
}

/// Removes stray backslashes around delimiters and line boundaries.
///
/// Applied line by line, in order:
/// 1. `\` directly before the delimiter
/// 2. `\` directly after the delimiter, unless followed by another delimiter
/// 3. one `\` at the end of the line
/// 4. one `\` at the start of the line
pub struct BackslashRepair {
    delimiter: char,
}

impl Default for BackslashRepair {
    fn default() -> Self {
        Self::new(';')
    }
}

impl BackslashRepair {
    pub fn new(delimiter: char) -> Self {
        Self { delimiter }
    }

    pub fn repair_text(&self, text: &str) -> String {
        let escaped_delimiter = format!("\\{}", self.delimiter);
        let delimiter = self.delimiter.to_string();

        text.split('\n')
            .map(|line| {
                let line = line.replace(&escaped_delimiter, &delimiter);
                let line = self.strip_after_delimiter(&line);
                let line = line.strip_suffix('\\').unwrap_or(&line);
                line.strip_prefix('\\').unwrap_or(line).to_string()
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn strip_after_delimiter(&self, line: &str) -> String {
        let mut repaired = String::with_capacity(line.len());
        let mut chars = line.chars();

        while let Some(c) = chars.next() {
            repaired.push(c);

            if c == self.delimiter {
                let mut lookahead = chars.clone();
                if lookahead.next() == Some('\\')
                    && lookahead.next().is_some_and(|next| next != self.delimiter)
                {
                    chars.next();
                }
            }
        }

        repaired
    }
}

impl ExportRepair for BackslashRepair {
    fn repair(&self, path: &Path) -> Result<usize, BatchError> {
        let content = fs::read_to_string(path)?;

        let before = content.matches('\\').count();
        if before == 0 {
            info!("Export has no backslashes, nothing to repair");
            return Ok(0);
        }

        let repaired = self.repair_text(&content);
        let removed = before - repaired.matches('\\').count();

        if removed > 0 {
            fs::write(path, repaired)?;
            info!("Export repair: {} stray backslashes removed", removed);
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn backslash_before_delimiter_is_removed() {
        let repair = BackslashRepair::default();
        assert_eq!(repair.repair_text("\"a\\\";\"b\"\\;x"), "\"a\\\";\"b\";x");
    }

    #[test]
    fn backslash_after_delimiter_is_removed_unless_a_delimiter_follows() {
        let repair = BackslashRepair::default();

        assert_eq!(repair.repair_text("a;\\b"), "a;b");
        assert_eq!(repair.repair_text("a;\\\\;b"), "a;\\;b");
    }

    #[test]
    fn line_boundaries_lose_one_backslash() {
        let repair = BackslashRepair::default();

        assert_eq!(
            repair.repair_text("\\first\\\n\\\\second\\\\\n"),
            "first\n\\second\\\n"
        );
    }

    #[test]
    fn clean_text_is_unchanged() {
        let repair = BackslashRepair::default();
        let text = "\"id\";\"name\"\n\"1\";\"C:\\temp\"\n";

        assert_eq!(repair.repair_text(text), text);
    }

    #[test]
    fn file_is_rewritten_only_when_something_was_removed() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "\"a\"\\;\"b\"\n\\\"c\";\"d\"\n").unwrap();

        let removed = BackslashRepair::default().repair(file.path()).unwrap();

        assert_eq!(removed, 2);
        assert_eq!(
            fs::read_to_string(file.path()).unwrap(),
            "\"a\";\"b\"\n\"c\";\"d\"\n"
        );
    }

    #[test]
    fn no_repair_leaves_the_file_alone() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "a\\;b").unwrap();

        assert_eq!(NoRepair::default().repair(file.path()).unwrap(), 0);
        assert_eq!(fs::read_to_string(file.path()).unwrap(), "a\\;b");
    }
}
