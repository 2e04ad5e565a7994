//! AMQP topic-exchange routing

/// Check if a routing key matches a topic binding key
///
/// Words are separated by `.`:
/// - `*` matches exactly one word
/// - `#` matches zero or more words
///
/// # Examples
/// - `grades.new.*` matches `grades.new.math`
/// - `grades.new.*` does NOT match `grades.new.math.advanced` (too many words)
/// - `grades.#` matches `grades`, `grades.new` and `grades.new.math`
pub fn topic_matches(binding_key: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = binding_key.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();

    matches_from(&pattern, &words)
}

fn matches_from(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => {
            // `#` may swallow any number of words, including none
            (0..=words.len()).any(|skip| matches_from(rest, &words[skip..]))
        }
        Some((&token, rest)) => match words.split_first() {
            Some((&word, remaining)) if token == "*" || token == word => {
                matches_from(rest, remaining)
            }
            _ => false,
        },
    }
}
