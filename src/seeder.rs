//! Seed-file loading: newline-delimited absolute URLs, blank lines skipped.

use std::io::{BufRead, BufReader};
use std::path::Path;

use url::Url;

use crate::url_utils;

pub fn read_seed<P: AsRef<Path>>(path: P) -> std::io::Result<Vec<Url>> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut urls = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match url_utils::parse_absolute(trimmed) {
            Some(url) => urls.push(url),
            None => tracing::warn!(line = trimmed, "skipping unparseable seed url"),
        }
    }
    Ok(urls)
}
