use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::path::Path;

/// Parse dblist contents: one wiki per line, `#` starts a comment.
pub fn parse_dblist(path: &Path, contents: &str) -> Result<Vec<String>> {
    let mut wikis = Vec::new();
    for line in contents.lines() {
        let wiki = line.split('#').next().unwrap_or_default().trim();
        if wiki.starts_with("%%") {
            exn::bail!(ErrorKind::DblistExpression(path.to_path_buf(), wiki.to_string()));
        }
        if !wiki.is_empty() {
            wikis.push(wiki.to_string());
        }
    }
    Ok(wikis)
}

/// Read the wikis listed in a dblist file.
pub fn read_dblist(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path).or_raise(|| ErrorKind::Dblist(path.to_path_buf()))?;
    parse_dblist(path, &contents)
}
