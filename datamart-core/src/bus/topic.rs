/// AMQP topic matching: `*` matches exactly one dot-separated word, `#`
/// matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches_words(&pattern, &key)
}

fn matches_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => {
            (0..=key.len()).any(|skip| matches_words(rest, &key[skip..]))
        }
        Some((&word, rest)) => match key.split_first() {
            Some((&first, key_rest)) if word == "*" || word == first => {
                matches_words(rest, key_rest)
            }
            _ => false,
        },
    }
}
