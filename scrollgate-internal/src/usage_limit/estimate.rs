/// Pre-call token estimate: 1.3 tokens per whitespace-separated word, rounded up, plus
/// `overhead` for the system prompt and injected context.
pub fn estimate_tokens(text: &str, overhead: u64) -> u64 {
    let words = text.split_whitespace().count() as u64;
    (words * 13).div_ceil(10).saturating_add(overhead)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_rounds_up() {
        assert_eq!(estimate_tokens("", 0), 0);
        assert_eq!(estimate_tokens("one", 0), 2);
        assert_eq!(estimate_tokens("one two three four five six seven eight nine ten", 0), 13);
        assert_eq!(estimate_tokens("  spaced\tout\nwords  ", 150), 154);
    }
}
