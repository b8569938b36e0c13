//! Merging inline and fetched nodes into one filtered, de-duplicated list

use std::collections::HashSet;

use crate::fetch::{FetchOutcome, SourceResult};
use crate::filter::FilterEngine;

/// Fetch results split by what the pipeline does with them next
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchReport {
    /// Filtered plaintext node blocks, one per successful source, in input order
    pub plain_nodes: Vec<String>,
    /// URLs of sources that returned a full client configuration
    pub convertible_urls: Vec<String>,
    /// Number of sources that failed or were skipped
    pub failed: usize,
}

impl FetchReport {
    /// Sort fetch results, filtering each plaintext block with `filter`
    pub fn from_results(results: Vec<SourceResult>, filter: &FilterEngine) -> Self {
        let mut report = FetchReport::default();
        for result in results {
            match result.outcome {
                FetchOutcome::Convertible(url) => report.convertible_urls.push(url),
                FetchOutcome::PlainNodes(text) => report.plain_nodes.push(filter.apply(&text)),
                FetchOutcome::Error(_) => report.failed += 1,
            }
        }
        report
    }
}

/// Combines node sources for a group
#[derive(Debug, Clone, Copy, Default)]
pub struct Aggregator;

impl Aggregator {
    /// Inline nodes first, then fetched blocks; the joined text is filtered
    /// once more and de-duplicated by exact line, keeping first occurrences.
    ///
    /// Because blank lines are de-duplicated like any other line, at most one
    /// empty line survives.
    pub fn combine(inline: &[String], fetched: &[String], filter: &FilterEngine) -> String {
        let joined = inline
            .iter()
            .chain(fetched.iter())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n");
        dedup_lines(&filter.apply(&joined))
    }
}

/// Remove repeated lines, preserving the order of first occurrence
pub fn dedup_lines(text: &str) -> String {
    let mut seen = HashSet::new();
    text.split('\n')
        .filter(|line| seen.insert(*line))
        .collect::<Vec<_>>()
        .join("\n")
}
