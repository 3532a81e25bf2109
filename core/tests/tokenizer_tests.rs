use wordindex_core::tokenizer::{distinct_words, tokenize};

#[test]
fn it_normalizes_without_stemming() {
    let words = tokenize("Running Runners RUN! The café's menu.");
    assert!(words.contains(&"running".to_string()));
    assert!(words.contains(&"runners".to_string()));
    assert!(words.contains(&"run".to_string()));
    // NFKC keeps the composed é
    assert!(words.contains(&"café's".to_string()));
}

#[test]
fn it_filters_stopwords() {
    let words = tokenize("The quick brown fox and the lazy dog");
    assert!(!words.contains(&"the".to_string()));
    assert!(!words.contains(&"and".to_string()));
    assert_eq!(words, vec!["quick", "brown", "fox", "lazy", "dog"]);
}

#[test]
fn it_dedups_for_postings() {
    let words = distinct_words("dog DOG Dog cat");
    assert_eq!(words.into_iter().collect::<Vec<_>>(), vec!["cat", "dog"]);
}
