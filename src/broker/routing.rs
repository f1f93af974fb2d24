use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Word {
    Literal(String),
    // `*` exactly one word
    One,
    // `#` zero or more words
    Any,
}

/// Topic pattern matched against dot separated routing keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    source: String,
    words: Vec<Word>,
}

impl Pattern {
    pub fn new(source: impl Into<String>) -> Self {
        let source = source.into();
        let words = source
            .split('.')
            .map(|word| match word {
                "*" => Word::One,
                "#" => Word::Any,
                literal => Word::Literal(literal.to_string()),
            })
            .collect();
        Self { source, words }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, routing_key: &str) -> bool {
        let key: Vec<&str> = routing_key.split('.').collect();
        match_words(&self.words, &key)
    }
}

impl Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

fn match_words(pattern: &[Word], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((Word::Any, rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((Word::One, rest)) => !key.is_empty() && match_words(rest, &key[1..]),
        Some((Word::Literal(word), rest)) => {
            key.first().is_some_and(|first| first == word) && match_words(rest, &key[1..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal() {
        let pattern = Pattern::new("execute.start");
        assert!(pattern.matches("execute.start"));
        assert!(!pattern.matches("execute.start.1"));
        assert!(!pattern.matches("execute"));
    }

    #[test]
    fn star_matches_one_word() {
        let pattern = Pattern::new("activity.*.task_1");
        assert!(pattern.matches("activity.stop.task_1"));
        assert!(!pattern.matches("activity.stop.now.task_1"));
        assert!(!pattern.matches("activity.task_1"));
    }

    #[test]
    fn hash_matches_zero_or_more_words() {
        let pattern = Pattern::new("activity.#.task_1");
        assert!(pattern.matches("activity.task_1"));
        assert!(pattern.matches("activity.discard.task_1"));
        assert!(pattern.matches("activity.link.discard.task_1"));
        assert!(!pattern.matches("activity.discard.task_2"));

        assert!(Pattern::new("#").matches("execute.iteration.next"));
        assert!(Pattern::new("*.link.#").matches("definition.link"));
        assert!(Pattern::new("*.link.#").matches("process.link.LINKA"));
        assert!(!Pattern::new("*.link.#").matches("link.LINKA"));
    }
}
