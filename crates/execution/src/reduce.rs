//! Final per-query reductions run by the aggregator once all partials arrived.
//!
//! Groups keep first-seen order and every sort is stable, so ties resolve to the
//! group encountered first.

use std::collections::HashMap;

use cq_common::rows::cell;
use cq_common::{CqError, QueryId, Result, RowBatch};

use crate::filters::parse_number;

/// Rows kept by the query 2 reduction.
pub const TOP_COUNTRIES: usize = 5;
/// Rows kept by the query 4 reduction.
pub const TOP_ACTORS: usize = 10;

/// Reduce every partial row for `query` into its final result.
pub fn reduce(query: QueryId, partials: &RowBatch) -> Result<RowBatch> {
    match query {
        QueryId::TOP_INVESTING => top_investing_countries(partials),
        QueryId::TOP_RATED => best_and_worst_rated(partials),
        QueryId::TOP_ACTORS => most_credited_actors(partials),
        QueryId::SENTIMENT => revenue_rate_by_sentiment(partials),
        other => Err(CqError::UnknownQuery {
            node: "aggregator".to_string(),
            query: other.0,
        }),
    }
}

/// Render a number without a trailing `.0` when it is integral.
pub fn format_number(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

/// First-seen-ordered grouping helper.
struct Groups<K, V> {
    index: HashMap<K, usize>,
    entries: Vec<(K, V)>,
}

impl<K, V> Groups<K, V>
where
    K: std::hash::Hash + Eq + Clone,
{
    fn new() -> Self {
        Self {
            index: HashMap::new(),
            entries: Vec::new(),
        }
    }

    fn entry(&mut self, key: K, init: impl FnOnce() -> V) -> &mut V {
        let idx = match self.index.get(&key).copied() {
            Some(idx) => idx,
            None => {
                self.entries.push((key.clone(), init()));
                self.index.insert(key, self.entries.len() - 1);
                self.entries.len() - 1
            }
        };
        &mut self.entries[idx].1
    }
}

fn top_investing_countries(partials: &RowBatch) -> Result<RowBatch> {
    let mut out = RowBatch::new(vec!["country".to_string(), "budget".to_string()]);
    if partials.is_empty() {
        return Ok(out);
    }
    let country = partials.require_column("country")?;
    let budget = partials.require_column("budget")?;

    let mut sums = Groups::<String, f64>::new();
    for row in &partials.rows {
        let Some(amount) = parse_number(cell(row, budget)) else {
            continue;
        };
        *sums.entry(cell(row, country).to_string(), || 0.0) += amount;
    }
    let mut ranked = sums.entries;
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
    for (name, total) in ranked.into_iter().take(TOP_COUNTRIES) {
        out.push_row(vec![name, format_number(total)]);
    }
    Ok(out)
}

fn best_and_worst_rated(partials: &RowBatch) -> Result<RowBatch> {
    let mut out = RowBatch::new(
        ["id", "title", "rating", "kind"]
            .iter()
            .map(|c| c.to_string())
            .collect(),
    );
    if partials.is_empty() {
        return Ok(out);
    }
    let id = partials.require_column("id")?;
    let title = partials.require_column("title")?;
    let rating = partials.require_column("rating")?;

    let mut means = Groups::<(String, String), (f64, u64)>::new();
    for row in &partials.rows {
        let Some(value) = parse_number(cell(row, rating)) else {
            continue;
        };
        let key = (cell(row, id).to_string(), cell(row, title).to_string());
        let (sum, n) = means.entry(key, || (0.0, 0));
        *sum += value;
        *n += 1;
    }
    let averaged = means
        .entries
        .into_iter()
        .map(|(key, (sum, n))| (key, sum / n as f64))
        .collect::<Vec<_>>();

    let mut best: Option<&((String, String), f64)> = None;
    let mut worst: Option<&((String, String), f64)> = None;
    for candidate in &averaged {
        if best.map_or(true, |b| candidate.1 > b.1) {
            best = Some(candidate);
        }
        if worst.map_or(true, |w| candidate.1 < w.1) {
            worst = Some(candidate);
        }
    }
    for (entry, kind) in [(best, "max"), (worst, "min")] {
        if let Some(((movie_id, movie_title), mean)) = entry {
            out.push_row(vec![
                movie_id.clone(),
                movie_title.clone(),
                format_number(*mean),
                kind.to_string(),
            ]);
        }
    }
    Ok(out)
}

fn most_credited_actors(partials: &RowBatch) -> Result<RowBatch> {
    let mut out = RowBatch::new(vec!["name".to_string(), "count".to_string()]);
    if partials.is_empty() {
        return Ok(out);
    }
    let name = partials.require_column("name")?;

    let mut counts = Groups::<String, u64>::new();
    for row in &partials.rows {
        let actor = cell(row, name).trim();
        if actor.is_empty() {
            continue;
        }
        *counts.entry(actor.to_string(), || 0) += 1;
    }
    let mut ranked = counts.entries;
    ranked.sort_by(|a, b| b.1.cmp(&a.1));
    for (actor, count) in ranked.into_iter().take(TOP_ACTORS) {
        out.push_row(vec![actor, count.to_string()]);
    }
    Ok(out)
}

fn revenue_rate_by_sentiment(partials: &RowBatch) -> Result<RowBatch> {
    let mut out = RowBatch::new(vec![
        "sentiment".to_string(),
        "rate_revenue_budget".to_string(),
    ]);
    if partials.is_empty() {
        return Ok(out);
    }
    let sentiment = partials.require_column("sentiment")?;
    let budget = partials.require_column("budget")?;
    let revenue = partials.require_column("revenue")?;

    let mut rates = Groups::<String, (f64, u64)>::new();
    for row in &partials.rows {
        let (Some(b), Some(r)) = (parse_number(cell(row, budget)), parse_number(cell(row, revenue)))
        else {
            continue;
        };
        if b == 0.0 {
            continue;
        }
        let (sum, n) = rates.entry(cell(row, sentiment).to_string(), || (0.0, 0));
        *sum += r / b;
        *n += 1;
    }
    for (label, (sum, n)) in rates.entries {
        out.push_row(vec![label, format_number(sum / n as f64)]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(rows: &[&[&str]]) -> Vec<Vec<String>> {
        rows.iter()
            .map(|r| r.iter().map(|v| v.to_string()).collect())
            .collect()
    }

    #[test]
    fn q2_sums_by_country_and_orders_descending() {
        let partials = RowBatch::from_rows(["country", "budget"], [["A", "10"], ["B", "30"], ["A", "5"]]);
        let out = reduce(QueryId::TOP_INVESTING, &partials).expect("reduce");
        assert_eq!(out.rows, strings(&[&["B", "30"], &["A", "15"]]));
    }

    #[test]
    fn q2_keeps_top_five_with_first_seen_ties() {
        let partials = RowBatch::from_rows(
            ["country", "budget"],
            ["F", "E", "D", "C", "B", "A"].map(|c| [c, "7"]),
        );
        let out = reduce(QueryId::TOP_INVESTING, &partials).expect("reduce");
        let names = out.rows.iter().map(|r| r[0].as_str()).collect::<Vec<_>>();
        assert_eq!(names, vec!["F", "E", "D", "C", "B"]);
    }

    #[test]
    fn q3_reports_max_then_min_mean_rating() {
        let partials = RowBatch::from_rows(
            ["id", "title", "rating"],
            [
                ["1", "Uno", "4.0"],
                ["2", "Dos", "1.0"],
                ["1", "Uno", "5.0"],
                ["3", "Tres", "4.5"],
                ["2", "Dos", "2.0"],
            ],
        );
        let out = reduce(QueryId::TOP_RATED, &partials).expect("reduce");
        assert_eq!(out.columns, vec!["id", "title", "rating", "kind"]);
        assert_eq!(
            out.rows,
            strings(&[&["1", "Uno", "4.5", "max"], &["2", "Dos", "1.5", "min"]])
        );
    }

    #[test]
    fn q4_counts_top_ten_actors() {
        let mut rows = Vec::new();
        for i in 0..12 {
            for _ in 0..=i {
                rows.push(["1".to_string(), format!("actor{i}")]);
            }
        }
        let partials = RowBatch::from_rows(["id", "name"], rows);
        let out = reduce(QueryId::TOP_ACTORS, &partials).expect("reduce");
        assert_eq!(out.len(), TOP_ACTORS);
        assert_eq!(out.rows[0], vec!["actor11".to_string(), "12".to_string()]);
        assert_eq!(out.rows[9], vec!["actor2".to_string(), "3".to_string()]);
    }

    #[test]
    fn q5_averages_revenue_budget_ratio_per_sentiment() {
        let partials = RowBatch::from_rows(
            ["id", "budget", "revenue", "sentiment"],
            [
                ["1", "10", "30", "POSITIVE"],
                ["2", "10", "10", "NEGATIVE"],
                ["3", "4", "6", "POSITIVE"],
                ["4", "0", "6", "POSITIVE"],
            ],
        );
        let out = reduce(QueryId::SENTIMENT, &partials).expect("reduce");
        assert_eq!(
            out.rows,
            strings(&[&["POSITIVE", "2.25"], &["NEGATIVE", "1"]])
        );
    }

    #[test]
    fn empty_partials_reduce_to_empty_results() {
        for q in [QueryId::TOP_INVESTING, QueryId::TOP_RATED, QueryId::TOP_ACTORS, QueryId::SENTIMENT] {
            assert!(reduce(q, &RowBatch::default()).expect("reduce").is_empty());
        }
        assert!(reduce(QueryId::ARGENTINA_SPAIN, &RowBatch::default()).is_err());
    }

    #[test]
    fn numbers_drop_trailing_zero_fraction() {
        assert_eq!(format_number(15.0), "15");
        assert_eq!(format_number(2.25), "2.25");
        assert_eq!(format_number(-3.0), "-3");
    }
}
