//! Row-level predicates and projections applied by filter nodes.

use cq_common::rows::cell;
use cq_common::{CqError, QueryId, Result, RowBatch};

use crate::literal::name_list;

/// Column names read from the movies metadata stream.
pub mod movie_columns {
    /// Movie id, join key for ratings and credits.
    pub const ID: &str = "id";
    /// Movie title.
    pub const TITLE: &str = "title";
    /// Python-literal list of genres.
    pub const GENRES: &str = "genres";
    /// `YYYY-MM-DD` release date.
    pub const RELEASE_DATE: &str = "release_date";
    /// Plot overview, input of the sentiment classifier.
    pub const OVERVIEW: &str = "overview";
    /// Python-literal list of production countries.
    pub const PRODUCTION_COUNTRIES: &str = "production_countries";
    /// Budget in whole currency units.
    pub const BUDGET: &str = "budget";
    /// Revenue in whole currency units.
    pub const REVENUE: &str = "revenue";
    /// Single production country emitted for query 2.
    pub const COUNTRY: &str = "country";
}

use movie_columns as col;

const ARGENTINA: &str = "Argentina";
const SPAIN: &str = "Spain";

/// Apply query `query`'s predicate and projection to a movies batch.
///
/// Rows whose relevant fields do not parse are skipped. A batch missing a column
/// the query needs is a decode error.
pub fn apply_filter(query: QueryId, movies: &RowBatch) -> Result<RowBatch> {
    match query {
        QueryId::ARGENTINA_SPAIN => argentina_spain_2000s(movies),
        QueryId::TOP_INVESTING => single_country_budgets(movies),
        QueryId::TOP_RATED | QueryId::TOP_ACTORS => argentinian_since_2000(movies),
        QueryId::SENTIMENT => with_budget_and_revenue(movies),
        other => Err(CqError::UnknownQuery {
            node: "filter".to_string(),
            query: other.0,
        }),
    }
}

/// Output columns of the filter stage for `query`.
pub fn output_columns(query: QueryId) -> &'static [&'static str] {
    match query {
        QueryId::ARGENTINA_SPAIN => &[col::TITLE, col::GENRES],
        QueryId::TOP_INVESTING => &[col::COUNTRY, col::BUDGET],
        QueryId::TOP_RATED | QueryId::TOP_ACTORS => &[col::ID, col::TITLE],
        QueryId::SENTIMENT => &[col::ID, col::TITLE, col::OVERVIEW, col::BUDGET, col::REVENUE],
        _ => &[],
    }
}

fn argentina_spain_2000s(movies: &RowBatch) -> Result<RowBatch> {
    let countries = movies.require_column(col::PRODUCTION_COUNTRIES)?;
    let date = movies.require_column(col::RELEASE_DATE)?;
    let title = movies.require_column(col::TITLE)?;
    let genres = movies.require_column(col::GENRES)?;

    let mut out = RowBatch::new(owned(output_columns(QueryId::ARGENTINA_SPAIN)));
    for row in &movies.rows {
        let Some(year) = release_year(cell(row, date)) else {
            continue;
        };
        let Some(names) = name_list(cell(row, countries)) else {
            continue;
        };
        if !(2000..=2009).contains(&year) || !has(&names, ARGENTINA) || !has(&names, SPAIN) {
            continue;
        }
        let genre_names = name_list(cell(row, genres)).unwrap_or_default().join(", ");
        out.push_row(vec![cell(row, title).to_string(), genre_names]);
    }
    Ok(out)
}

fn single_country_budgets(movies: &RowBatch) -> Result<RowBatch> {
    let countries = movies.require_column(col::PRODUCTION_COUNTRIES)?;
    let budget = movies.require_column(col::BUDGET)?;

    let mut out = RowBatch::new(owned(output_columns(QueryId::TOP_INVESTING)));
    for row in &movies.rows {
        let Some(names) = name_list(cell(row, countries)) else {
            continue;
        };
        let [country] = names.as_slice() else {
            continue;
        };
        if parse_number(cell(row, budget)).is_none() {
            continue;
        }
        out.push_row(vec![country.clone(), cell(row, budget).trim().to_string()]);
    }
    Ok(out)
}

fn argentinian_since_2000(movies: &RowBatch) -> Result<RowBatch> {
    let countries = movies.require_column(col::PRODUCTION_COUNTRIES)?;
    let date = movies.require_column(col::RELEASE_DATE)?;
    let id = movies.require_column(col::ID)?;
    let title = movies.require_column(col::TITLE)?;

    let mut out = RowBatch::new(owned(output_columns(QueryId::TOP_RATED)));
    for row in &movies.rows {
        let Some(year) = release_year(cell(row, date)) else {
            continue;
        };
        let Some(names) = name_list(cell(row, countries)) else {
            continue;
        };
        if year >= 2000 && has(&names, ARGENTINA) {
            out.push_row(vec![cell(row, id).trim().to_string(), cell(row, title).to_string()]);
        }
    }
    Ok(out)
}

fn with_budget_and_revenue(movies: &RowBatch) -> Result<RowBatch> {
    let budget = movies.require_column(col::BUDGET)?;
    let revenue = movies.require_column(col::REVENUE)?;
    movies.require_column(col::ID)?;
    movies.require_column(col::TITLE)?;
    movies.require_column(col::OVERVIEW)?;

    let mut kept = RowBatch::new(movies.columns.clone());
    for row in &movies.rows {
        match (parse_int(cell(row, budget)), parse_int(cell(row, revenue))) {
            (Some(b), Some(r)) if b != 0 && r != 0 => kept.push_row(row.clone()),
            _ => {}
        }
    }
    Ok(kept.project(output_columns(QueryId::SENTIMENT)))
}

/// Year of a `YYYY-MM-DD` date; `None` for anything else.
pub fn release_year(raw: &str) -> Option<i32> {
    let mut parts = raw.trim().splitn(3, '-');
    let year = parts.next()?;
    let month = parts.next()?.parse::<u32>().ok()?;
    let day = parts.next()?.parse::<u32>().ok()?;
    if year.len() != 4 || !(1..=12).contains(&month) || !(1..=31).contains(&day) {
        return None;
    }
    year.parse().ok()
}

/// Strict integer parse (surrounding whitespace allowed).
pub fn parse_int(raw: &str) -> Option<i64> {
    raw.trim().parse().ok()
}

/// Finite float parse (surrounding whitespace allowed).
pub fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

fn has(names: &[String], wanted: &str) -> bool {
    names.iter().any(|n| n == wanted)
}

fn owned(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: [&str; 8] = [
        "id",
        "title",
        "genres",
        "release_date",
        "overview",
        "production_countries",
        "budget",
        "revenue",
    ];

    fn movie(id: &str, title: &str, date: &str, countries: &str, budget: &str, revenue: &str) -> [String; 8] {
        [
            id.to_string(),
            title.to_string(),
            "[{'id': 18, 'name': 'Drama'}]".to_string(),
            date.to_string(),
            format!("overview of {title}"),
            countries.to_string(),
            budget.to_string(),
            revenue.to_string(),
        ]
    }

    const AR_ES: &str = "[{'iso_3166_1': 'AR', 'name': 'Argentina'}, {'iso_3166_1': 'ES', 'name': 'Spain'}]";
    const AR: &str = "[{'iso_3166_1': 'AR', 'name': 'Argentina'}]";
    const BR: &str = "[{'iso_3166_1': 'BR', 'name': 'Brazil'}]";

    #[test]
    fn q1_keeps_argentina_spain_coproductions_of_the_2000s() {
        let movies = RowBatch::from_rows(
            HEADER,
            [
                movie("1", "Kept", "2005-03-01", AR_ES, "10", "20"),
                movie("2", "Brazilian", "2005-03-01", BR, "10", "20"),
                movie("3", "Too late", "2011-01-01", AR_ES, "10", "20"),
                movie("4", "Bad date", "sometime", AR_ES, "10", "20"),
            ],
        );
        let out = apply_filter(QueryId::ARGENTINA_SPAIN, &movies).expect("filter");
        assert_eq!(out.columns, vec!["title", "genres"]);
        assert_eq!(out.rows, vec![vec!["Kept".to_string(), "Drama".to_string()]]);
    }

    #[test]
    fn q2_keeps_single_country_rows() {
        let movies = RowBatch::from_rows(
            HEADER,
            [
                movie("1", "A", "2001-01-01", AR, "100", "0"),
                movie("2", "B", "2001-01-01", AR_ES, "100", "0"),
                movie("3", "C", "2001-01-01", BR, "n/a", "0"),
            ],
        );
        let out = apply_filter(QueryId::TOP_INVESTING, &movies).expect("filter");
        assert_eq!(out.rows, vec![vec!["Argentina".to_string(), "100".to_string()]]);
    }

    #[test]
    fn q3_q4_keep_argentinian_movies_since_2000() {
        let movies = RowBatch::from_rows(
            HEADER,
            [
                movie("1", "New", "2000-01-01", AR, "0", "0"),
                movie("2", "Old", "1999-12-31", AR, "0", "0"),
                movie("3", "Coprod", "2015-05-05", AR_ES, "0", "0"),
            ],
        );
        for q in [QueryId::TOP_RATED, QueryId::TOP_ACTORS] {
            let out = apply_filter(q, &movies).expect("filter");
            assert_eq!(out.columns, vec!["id", "title"]);
            let ids = out.rows.iter().map(|r| r[0].as_str()).collect::<Vec<_>>();
            assert_eq!(ids, vec!["1", "3"]);
        }
    }

    #[test]
    fn q5_requires_nonzero_integer_budget_and_revenue() {
        let movies = RowBatch::from_rows(
            HEADER,
            [
                movie("1", "Hit", "2000-01-01", BR, "10", "50"),
                movie("2", "Free", "2000-01-01", BR, "0", "50"),
                movie("3", "Flop", "2000-01-01", BR, "10", "0"),
                movie("4", "Odd", "2000-01-01", BR, "1.5", "7"),
            ],
        );
        let out = apply_filter(QueryId::SENTIMENT, &movies).expect("filter");
        assert_eq!(out.columns, vec!["id", "title", "overview", "budget", "revenue"]);
        assert_eq!(out.len(), 1);
        assert_eq!(out.rows[0][0], "1");
    }

    #[test]
    fn unknown_query_and_missing_columns_are_errors() {
        let movies = RowBatch::from_rows(["id"], [["1"]]);
        assert!(matches!(
            apply_filter(QueryId(9), &movies),
            Err(CqError::UnknownQuery { query: 9, .. })
        ));
        assert!(matches!(
            apply_filter(QueryId::ARGENTINA_SPAIN, &movies),
            Err(CqError::Decode(_))
        ));
    }

    #[test]
    fn release_year_is_strict() {
        assert_eq!(release_year("2004-07-09"), Some(2004));
        assert_eq!(release_year("2004"), None);
        assert_eq!(release_year("2004-13-01"), None);
        assert_eq!(release_year(""), None);
    }
}
