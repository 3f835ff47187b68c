//! Sentiment labelling of movie overviews for query 5.

use std::collections::HashSet;
use std::fmt;

use cq_common::rows::cell;
use cq_common::{Result, RowBatch};
use serde::{Deserialize, Serialize};

/// Column read by [`label_batch`].
pub const OVERVIEW_COLUMN: &str = "overview";
/// Column appended by [`label_batch`].
pub const SENTIMENT_COLUMN: &str = "sentiment";

/// Binary sentiment label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sentiment {
    /// Overall positive tone.
    Positive,
    /// Overall negative tone.
    Negative,
}

impl Sentiment {
    /// Label text written into the `sentiment` column.
    pub fn as_str(self) -> &'static str {
        match self {
            Sentiment::Positive => "POSITIVE",
            Sentiment::Negative => "NEGATIVE",
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text classifier used by pnl nodes.
///
/// Failures surface as [`cq_common::CqError::Classifier`], which the worker treats as
/// transient.
pub trait Classifier: Send + Sync {
    /// Label one piece of text.
    fn classify(&self, text: &str) -> Result<Sentiment>;
}

const POSITIVE_WORDS: &[&str] = &[
    "love", "loves", "loving", "happy", "happiness", "joy", "hope", "hopeful", "friend",
    "friendship", "triumph", "success", "win", "wins", "beautiful", "brilliant", "wonderful",
    "inspiring", "heart", "heartwarming", "funny", "comedy", "celebrate", "dream", "dreams",
    "adventure", "magic", "romance", "peace", "free", "freedom", "rescue", "hero", "heroes",
    "together", "reunite", "reunited", "best", "great", "good", "kind", "laugh", "smile",
];

const NEGATIVE_WORDS: &[&str] = &[
    "death", "dead", "die", "dies", "dying", "kill", "killer", "killed", "murder", "war",
    "violence", "violent", "crime", "criminal", "fear", "horror", "terror", "evil", "hate",
    "revenge", "tragedy", "tragic", "loss", "lost", "dark", "darkness", "prison", "escape",
    "betrayal", "betrayed", "corrupt", "corruption", "brutal", "danger", "dangerous", "pain",
    "lonely", "grief", "disaster", "threat", "destroy", "destroyed", "bad", "sad",
];

/// Word-list classifier: counts positive and negative terms, ties are positive.
#[derive(Debug, Clone)]
pub struct LexiconClassifier {
    positive: HashSet<String>,
    negative: HashSet<String>,
}

impl Default for LexiconClassifier {
    fn default() -> Self {
        Self::new(POSITIVE_WORDS.iter().copied(), NEGATIVE_WORDS.iter().copied())
    }
}

impl LexiconClassifier {
    /// Build from custom word lists (matched case-insensitively).
    pub fn new<'a>(
        positive: impl IntoIterator<Item = &'a str>,
        negative: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            positive: positive.into_iter().map(str::to_lowercase).collect(),
            negative: negative.into_iter().map(str::to_lowercase).collect(),
        }
    }

    /// Positive hits minus negative hits.
    pub fn score(&self, text: &str) -> i64 {
        text.split(|c: char| !c.is_alphanumeric() && c != '\'')
            .filter(|w| !w.is_empty())
            .map(|w| w.trim_matches('\'').to_lowercase())
            .map(|w| {
                if self.positive.contains(&w) {
                    1
                } else if self.negative.contains(&w) {
                    -1
                } else {
                    0
                }
            })
            .sum()
    }
}

impl Classifier for LexiconClassifier {
    fn classify(&self, text: &str) -> Result<Sentiment> {
        Ok(if self.score(text) >= 0 {
            Sentiment::Positive
        } else {
            Sentiment::Negative
        })
    }
}

/// Append a `sentiment` column computed from each row's `overview`.
///
/// All other columns pass through untouched. The first classifier error aborts the
/// batch.
pub fn label_batch(classifier: &dyn Classifier, batch: &RowBatch) -> Result<RowBatch> {
    let overview = batch.require_column(OVERVIEW_COLUMN)?;
    let mut columns = batch.columns.clone();
    columns.push(SENTIMENT_COLUMN.to_string());
    let mut out = RowBatch::new(columns);
    for row in &batch.rows {
        let label = classifier.classify(cell(row, overview))?;
        let mut labelled = row.clone();
        labelled.resize(batch.columns.len(), String::new());
        labelled.push(label.as_str().to_string());
        out.push_row(labelled);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use cq_common::CqError;

    use super::*;

    struct Failing;

    impl Classifier for Failing {
        fn classify(&self, _text: &str) -> Result<Sentiment> {
            Err(CqError::Classifier("model unavailable".to_string()))
        }
    }

    #[test]
    fn lexicon_scores_overviews() {
        let c = LexiconClassifier::default();
        assert_eq!(
            c.classify("Two friends find love and hope in Buenos Aires.").expect("classify"),
            Sentiment::Positive
        );
        assert_eq!(
            c.classify("A brutal murder leads to revenge and death.").expect("classify"),
            Sentiment::Negative
        );
        assert_eq!(c.classify("").expect("classify"), Sentiment::Positive);
    }

    #[test]
    fn label_batch_appends_column_and_keeps_others() {
        let batch = RowBatch::from_rows(
            ["id", "overview", "budget"],
            [["1", "a happy dream", "10"], ["2", "war and death", "20"]],
        );
        let out = label_batch(&LexiconClassifier::default(), &batch).expect("label");
        assert_eq!(out.columns, vec!["id", "overview", "budget", "sentiment"]);
        assert_eq!(out.rows[0][3], "POSITIVE");
        assert_eq!(out.rows[1][3], "NEGATIVE");
        assert_eq!(out.rows[1][2], "20");
    }

    #[test]
    fn classifier_failure_is_transient() {
        let batch = RowBatch::from_rows(["overview"], [["x"]]);
        let err = label_batch(&Failing, &batch).expect_err("must fail");
        assert!(err.is_transient());
    }
}
