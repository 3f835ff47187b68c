//! Inner joins of filtered movies against the ratings and credits side streams.

use std::collections::HashMap;

use cq_common::rows::cell;
use cq_common::{CqError, QueryId, Result, RowBatch, SideStream};

use crate::literal::name_list;

/// Columns emitted by the query 3 join.
pub const RATED_COLUMNS: [&str; 3] = ["id", "title", "rating"];
/// Columns emitted by the query 4 join.
pub const CAST_COLUMNS: [&str; 2] = ["id", "name"];

/// Key column of a side batch: `id`, or `movieId` for ratings exports that use it.
pub fn side_key_column(side: &RowBatch) -> Result<usize> {
    side.column_index("id")
        .or_else(|| side.column_index("movieId"))
        .ok_or_else(|| CqError::Decode("side batch has neither 'id' nor 'movieId'".to_string()))
}

/// Check a side batch carries the columns its join will read.
pub fn validate_side(stream: SideStream, side: &RowBatch) -> Result<()> {
    side_key_column(side)?;
    match stream {
        SideStream::Ratings => side.require_column("rating").map(|_| ()),
        SideStream::Credits => side.require_column("cast").map(|_| ()),
    }
}

/// Join `side` against `movies` for a join query (3 or 4).
pub fn join(query: QueryId, movies: &RowBatch, side: &RowBatch) -> Result<RowBatch> {
    match query {
        QueryId::TOP_RATED => join_ratings(movies, side),
        QueryId::TOP_ACTORS => join_credits(movies, side),
        other => Err(CqError::UnknownQuery {
            node: "joiner".to_string(),
            query: other.0,
        }),
    }
}

/// Movie id → title, first occurrence wins.
fn titles_by_id(movies: &RowBatch) -> Result<HashMap<&str, &str>> {
    let id = movies.require_column("id")?;
    let title = movies.require_column("title")?;
    let mut out = HashMap::with_capacity(movies.len());
    for row in &movies.rows {
        out.entry(cell(row, id).trim()).or_insert(cell(row, title));
    }
    Ok(out)
}

/// Query 3: one `(id, title, rating)` row per rating of a kept movie.
pub fn join_ratings(movies: &RowBatch, ratings: &RowBatch) -> Result<RowBatch> {
    let titles = titles_by_id(movies)?;
    let mut out = RowBatch::new(RATED_COLUMNS.iter().map(|c| c.to_string()).collect());
    if ratings.is_empty() {
        return Ok(out);
    }
    let key = side_key_column(ratings)?;
    let rating = ratings.require_column("rating")?;
    for row in &ratings.rows {
        let id = cell(row, key).trim();
        if let Some(title) = titles.get(id) {
            out.push_row(vec![
                id.to_string(),
                title.to_string(),
                cell(row, rating).trim().to_string(),
            ]);
        }
    }
    Ok(out)
}

/// Query 4: one `(id, name)` row per actor of a kept movie.
///
/// Credit rows whose cast is empty or does not parse contribute nothing.
pub fn join_credits(movies: &RowBatch, credits: &RowBatch) -> Result<RowBatch> {
    let titles = titles_by_id(movies)?;
    let mut out = RowBatch::new(CAST_COLUMNS.iter().map(|c| c.to_string()).collect());
    if credits.is_empty() {
        return Ok(out);
    }
    let key = side_key_column(credits)?;
    let cast = credits.require_column("cast")?;
    for row in &credits.rows {
        let id = cell(row, key).trim();
        if !titles.contains_key(id) {
            continue;
        }
        let Some(names) = name_list(cell(row, cast)) else {
            continue;
        };
        for name in names.into_iter().filter(|n| !n.is_empty()) {
            out.push_row(vec![id.to_string(), name]);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn movies() -> RowBatch {
        RowBatch::from_rows(["id", "title"], [["10", "Nueve reinas"], ["20", "El aura"]])
    }

    #[test]
    fn ratings_join_on_id_or_movie_id() {
        let by_id = RowBatch::from_rows(
            ["id", "rating"],
            [["10", "4.5"], ["99", "1.0"], ["20", "3.0"]],
        );
        let out = join_ratings(&movies(), &by_id).expect("join");
        assert_eq!(
            out.rows,
            vec![
                vec!["10".to_string(), "Nueve reinas".to_string(), "4.5".to_string()],
                vec!["20".to_string(), "El aura".to_string(), "3.0".to_string()],
            ]
        );

        let by_movie_id = RowBatch::from_rows(
            ["userId", "movieId", "rating", "timestamp"],
            [["1", "20", "2.5", "1"]],
        );
        let out = join_ratings(&movies(), &by_movie_id).expect("join");
        assert_eq!(out.len(), 1);
        assert_eq!(out.rows[0][1], "El aura");
    }

    #[test]
    fn credits_explode_cast_and_drop_bad_rows() {
        let credits = RowBatch::from_rows(
            ["cast", "crew", "id"],
            [
                ["[{'name': 'Ricardo Darín'}, {'name': 'Gastón Pauls'}]", "[]", "10"],
                ["[]", "[]", "20"],
                ["[{'name': 'broken'", "[]", "20"],
                ["[{'name': 'Elsewhere'}]", "[]", "30"],
            ],
        );
        let out = join_credits(&movies(), &credits).expect("join");
        assert_eq!(out.columns, vec!["id", "name"]);
        assert_eq!(
            out.rows,
            vec![
                vec!["10".to_string(), "Ricardo Darín".to_string()],
                vec!["10".to_string(), "Gastón Pauls".to_string()],
            ]
        );
    }

    #[test]
    fn side_validation_requires_key_and_value_columns() {
        let ok = RowBatch::from_rows(["movieId", "rating"], [["1", "2"]]);
        assert!(validate_side(SideStream::Ratings, &ok).is_ok());
        assert!(validate_side(SideStream::Credits, &ok).is_err());
        let keyless = RowBatch::from_rows(["rating"], [["2"]]);
        assert!(validate_side(SideStream::Ratings, &keyless).is_err());
        assert!(join(QueryId::SENTIMENT, &movies(), &ok).is_err());
    }
}
