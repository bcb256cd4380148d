//! Attention-weight syntax: `(text)`, `[text]`, `(text:1.3)`, `BREAK`

use log::debug;
use once_cell::sync::Lazy;
use regex::Regex;

/// Weight carried by control tokens such as `BREAK`
pub const CONTROL_WEIGHT: f32 = -1.0;
pub const BREAK: &str = "BREAK";

const ROUND_MULTIPLIER: f32 = 1.1;
const SQUARE_MULTIPLIER: f32 = 1.0 / 1.1;

static RE_ATTENTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\\\(|\\\)|\\\[|\\]|\\\\|\\|\(|\[|:\s*([+-]?[.\d]+)\s*\)|\)|]|[^\\()\[\]:]+|:")
        .expect("attention regex")
});

static RE_BREAK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s*\bBREAK\b\s*").expect("break regex"));

/// A run of prompt text sharing one attention weight
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedSegment {
    pub text: String,
    pub weight: f32,
}

impl WeightedSegment {
    pub fn new(text: impl Into<String>, weight: f32) -> Self {
        Self {
            text: text.into(),
            weight,
        }
    }

    pub fn is_control(&self) -> bool {
        self.weight == CONTROL_WEIGHT
    }
}

fn multiply_range(res: &mut [WeightedSegment], start: usize, multiplier: f32) {
    for segment in res.iter_mut().skip(start) {
        segment.weight *= multiplier;
    }
}

/// Parse attention syntax into ordered weighted segments
///
/// Unbalanced brackets apply their multiplier to everything after them, and
/// adjacent segments with equal weights are merged. Empty input gives a single
/// empty segment of weight 1.
pub fn parse_prompt_attention(text: &str) -> Vec<WeightedSegment> {
    let mut res: Vec<WeightedSegment> = Vec::new();
    let mut round_brackets: Vec<usize> = Vec::new();
    let mut square_brackets: Vec<usize> = Vec::new();

    for caps in RE_ATTENTION.captures_iter(text) {
        let token = caps.get(0).map(|m| m.as_str()).unwrap_or_default();
        let weight = caps.get(1).map(|m| m.as_str());

        if let Some(escaped) = token.strip_prefix('\\') {
            res.push(WeightedSegment::new(escaped, 1.0));
        } else if token == "(" {
            round_brackets.push(res.len());
        } else if token == "[" {
            square_brackets.push(res.len());
        } else if let (Some(weight), Some(start)) = (weight, round_brackets.last().copied()) {
            round_brackets.pop();
            multiply_range(&mut res, start, weight.parse::<f32>().unwrap_or(1.0));
        } else if token == ")" && !round_brackets.is_empty() {
            let start = round_brackets.pop().unwrap_or_default();
            multiply_range(&mut res, start, ROUND_MULTIPLIER);
        } else if token == "]" && !square_brackets.is_empty() {
            let start = square_brackets.pop().unwrap_or_default();
            multiply_range(&mut res, start, SQUARE_MULTIPLIER);
        } else {
            for (i, part) in RE_BREAK.split(token).enumerate() {
                if i > 0 {
                    res.push(WeightedSegment::new(BREAK, CONTROL_WEIGHT));
                }
                res.push(WeightedSegment::new(part, 1.0));
            }
        }
    }

    for start in round_brackets {
        multiply_range(&mut res, start, ROUND_MULTIPLIER);
    }
    for start in square_brackets {
        multiply_range(&mut res, start, SQUARE_MULTIPLIER);
    }

    if res.is_empty() {
        return vec![WeightedSegment::new("", 1.0)];
    }

    let mut i = 0;
    while i + 1 < res.len() {
        if res[i].weight == res[i + 1].weight {
            let next = res.remove(i + 1);
            res[i].text.push_str(&next.text);
        } else {
            i += 1;
        }
    }
    res
}

/// Rescale weights so their word-weighted mean is 1; control tokens stay -1
pub fn normalize_weights(segments: &mut [WeightedSegment]) {
    let mut words = 0usize;
    let mut total = 0f64;
    for segment in segments.iter().filter(|s| !s.is_control()) {
        let count = segment.text.split_whitespace().count();
        words += count;
        total += segment.weight as f64 * count as f64;
    }
    let avg = if words > 0 { total / words as f64 } else { 1.0 };
    debug!("Prompt stats: words={} weight={:.4}", words, avg);
    if avg == 0.0 {
        return;
    }
    for segment in segments.iter_mut().filter(|s| !s.is_control()) {
        segment.weight = (segment.weight as f64 / avg) as f32;
    }
}

/// Split segments into chunks at `BREAK`, dropping empty text and empty chunks
pub fn split_on_break(segments: &[WeightedSegment]) -> Vec<Vec<WeightedSegment>> {
    let mut chunks = Vec::new();
    let mut current = Vec::new();
    for segment in segments {
        if segment.is_control() && segment.text == BREAK {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
        } else if !segment.text.is_empty() {
            current.push(segment.clone());
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Expand multi-vector textual-inversion tokens into `token token_1 .. token_n`
pub fn expand_textual_inversion(prompt: &str, added_tokens: &[String]) -> String {
    let mut expanded = prompt.to_string();
    let mut words: Vec<&str> = prompt.split(|c: char| c.is_whitespace() || ",()[]:".contains(c)).collect();
    words.sort_unstable();
    words.dedup();
    for word in words.into_iter().filter(|w| !w.is_empty()) {
        if !added_tokens.iter().any(|t| t == word) {
            continue;
        }
        let mut replacement = word.to_string();
        let mut i = 1;
        while added_tokens.iter().any(|t| *t == format!("{}_{}", word, i)) {
            replacement.push_str(&format!(" {}_{}", word, i));
            i += 1;
        }
        if i > 1 {
            expanded = expanded.replace(word, &replacement);
        }
    }
    expanded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pairs(segments: &[WeightedSegment]) -> Vec<(&str, f32)> {
        segments.iter().map(|s| (s.text.as_str(), s.weight)).collect()
    }

    fn close(a: f32, b: f32) -> bool {
        (a - b).abs() < 1e-4
    }

    #[test]
    fn test_plain_and_empty() {
        assert_eq!(pairs(&parse_prompt_attention("a cat")), vec![("a cat", 1.0)]);
        assert_eq!(pairs(&parse_prompt_attention("")), vec![("", 1.0)]);
    }

    #[test]
    fn test_brackets_and_explicit_weights() {
        let res = parse_prompt_attention("a (cat) [dog] (bird:1.5)");
        assert_eq!(res[0].text, "a ");
        assert!(close(res[1].weight, 1.1));
        assert_eq!(res[1].text, "cat");
        assert!(close(res[3].weight, 1.0 / 1.1));
        assert_eq!(res[4].text, " ");
        assert_eq!(res[5].text, "bird");
        assert!(close(res[5].weight, 1.5));
    }

    #[test]
    fn test_nested_and_unbalanced() {
        let res = parse_prompt_attention("((cat))");
        assert!(close(res[0].weight, 1.21));
        let res = parse_prompt_attention("(unclosed cat");
        assert_eq!(res.len(), 1);
        assert!(close(res[0].weight, 1.1));
    }

    #[test]
    fn test_escapes_are_literal() {
        let res = parse_prompt_attention(r"\(literal\) text");
        assert_eq!(pairs(&res), vec![("(literal) text", 1.0)]);
    }

    #[test]
    fn test_merges_equal_weights() {
        let res = parse_prompt_attention("(a)(b) c");
        assert_eq!(res[0].text, "ab");
        assert_eq!(res[1].text, " c");
    }

    #[test]
    fn test_break_chunks() {
        let res = parse_prompt_attention("(a cat:1.5) BREAK a dog");
        assert!(res.iter().any(|s| s.text == BREAK && s.weight == CONTROL_WEIGHT));
        let chunks = split_on_break(&res);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].iter().map(|s| s.weight).collect::<Vec<_>>(), vec![1.5]);
        assert_eq!(chunks[1].iter().map(|s| s.weight).collect::<Vec<_>>(), vec![1.0]);
        assert_eq!(chunks[1][0].text, "a dog");
    }

    #[test]
    fn test_normalize_mean_is_one() {
        let mut res = parse_prompt_attention("a photo of (a red cat:1.7) [sitting] BREAK on a (mat:0.6)");
        normalize_weights(&mut res);
        let (mut words, mut total) = (0usize, 0f32);
        for s in res.iter().filter(|s| !s.is_control()) {
            let n = s.text.split_whitespace().count();
            words += n;
            total += s.weight * n as f32;
        }
        assert!(close(total / words as f32, 1.0));
        assert!(res.iter().filter(|s| s.text == BREAK).all(|s| s.weight == CONTROL_WEIGHT));
    }

    #[test]
    fn test_textual_inversion_expansion() {
        let added = vec!["<style>".to_string(), "<style>_1".to_string(), "<style>_2".to_string(), "<one>".to_string()];
        assert_eq!(
            expand_textual_inversion("a <style> cat, <one>", &added),
            "a <style> <style>_1 <style>_2 cat, <one>"
        );
    }
}
