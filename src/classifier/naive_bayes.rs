use regex::Regex;
use std::collections::HashMap;
use std::sync::OnceLock;

use super::{ClassifierError, TextClassifier};

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\w\w+").expect("分词正则无效"))
}

fn tokenize(text: &str) -> Vec<String> {
    let lower = text.to_lowercase();
    token_re().find_iter(&lower).map(|m| m.as_str().to_string()).collect()
}

#[derive(Debug, Default, Clone)]
struct ClassStats {
    documents: usize,
    tokens: usize,
    counts: HashMap<String, usize>,
}

impl ClassStats {
    fn log_likelihood(&self, tokens: &[String], vocabulary: &HashMap<String, ()>, total_documents: usize) -> f64 {
        let prior = (self.documents as f64 / total_documents as f64).ln();
        let denominator = (self.tokens + vocabulary.len()) as f64;

        tokens
            .iter()
            .filter(|token| vocabulary.contains_key(*token))
            .map(|token| {
                let n = self.counts.get(token).copied().unwrap_or(0);
                ((n + 1) as f64 / denominator).ln()
            })
            .sum::<f64>()
            + prior
    }
}

/// 词袋多项式朴素贝叶斯，拉普拉斯平滑；训练语料外的词被忽略
#[derive(Debug, Default, Clone)]
pub struct NaiveBayes {
    sustainable: ClassStats,
    other: ClassStats,
    vocabulary: HashMap<String, ()>,
}

impl NaiveBayes {
    fn total_documents(&self) -> usize {
        self.sustainable.documents + self.other.documents
    }

    fn classify(&self, text: &str) -> bool {
        let tokens = tokenize(text);
        let total = self.total_documents();
        let yes = self.sustainable.log_likelihood(&tokens, &self.vocabulary, total);
        let no = self.other.log_likelihood(&tokens, &self.vocabulary, total);
        yes > no
    }
}

impl TextClassifier for NaiveBayes {
    fn fit(&mut self, corpus: &[(String, bool)]) -> Result<(), ClassifierError> {
        if corpus.is_empty() {
            return Err(ClassifierError::EmptyCorpus);
        }

        *self = Self::default();
        for (text, label) in corpus {
            let stats = if *label { &mut self.sustainable } else { &mut self.other };
            stats.documents += 1;
            for token in tokenize(text) {
                stats.tokens += 1;
                *stats.counts.entry(token.clone()).or_insert(0) += 1;
                self.vocabulary.insert(token, ());
            }
        }
        Ok(())
    }

    fn predict(&self, documents: &[String]) -> Vec<bool> {
        documents.iter().map(|doc| self.classify(doc)).collect()
    }

    fn is_fitted(&self) -> bool {
        self.total_documents() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_drops_single_characters_and_lowercases() {
        assert_eq!(tokenize("A Study of CO2 | x"), vec!["study", "of", "co2"]);
    }

    #[test]
    fn single_class_corpus_always_predicts_that_class() {
        let mut model = NaiveBayes::default();
        model
            .fit(&[("climate adaptation".to_string(), true), ("green bonds".to_string(), true)])
            .unwrap();

        assert_eq!(model.predict(&["anything at all".to_string()]), vec![true]);
    }

    #[test]
    fn refit_discards_previous_counts() {
        let mut model = NaiveBayes::default();
        model.fit(&[("solar".to_string(), true), ("poetry".to_string(), false)]).unwrap();
        model.fit(&[("solar".to_string(), false), ("poetry".to_string(), true)]).unwrap();

        assert_eq!(model.predict(&["solar".to_string()]), vec![false]);
        assert_eq!(model.total_documents(), 2);
    }

    #[test]
    fn empty_corpus_is_rejected() {
        let mut model = NaiveBayes::default();
        assert!(model.fit(&[]).is_err());
        assert!(!model.is_fitted());
    }
}
