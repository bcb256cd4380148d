//! Prompt editing syntax: `[from:to:when]`, `[to:when]`, `[from::when]` and `[a|b]`
//!
//! Schedules are not interpolated per step. A prompt resolves to the text in
//! effect at the final step and the request is flagged when that differs from
//! the first step.

#[derive(Debug, Clone, PartialEq)]
pub struct PromptSchedule {
    pub prompt: String,
    pub scheduled: bool,
}

/// Resolve `prompt` to its final-step text over `steps` steps
pub fn resolve_schedule(prompt: &str, steps: usize) -> PromptSchedule {
    let steps = steps.max(1);
    let first = resolve_at(prompt, 1, steps);
    let last = resolve_at(prompt, steps, steps);
    PromptSchedule {
        scheduled: first != last,
        prompt: last,
    }
}

/// Text of `prompt` at 1-based `step`
pub fn resolve_at(prompt: &str, step: usize, steps: usize) -> String {
    let chars: Vec<char> = prompt.chars().collect();
    let mut out = String::with_capacity(prompt.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c == '\\' && i + 1 < chars.len() {
            out.push(c);
            out.push(chars[i + 1]);
            i += 2;
            continue;
        }
        if c == '[' {
            if let Some(end) = matching_bracket(&chars, i) {
                let inner: String = chars[i + 1..end].iter().collect();
                out.push_str(&resolve_bracket(&inner, step, steps));
                i = end + 1;
                continue;
            }
        }
        out.push(c);
        i += 1;
    }
    out
}

fn matching_bracket(chars: &[char], start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut i = start;
    while i < chars.len() {
        match chars[i] {
            '\\' => i += 1,
            '[' => depth += 1,
            ']' => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Split on `sep` outside nested brackets and parentheses
fn split_top_level(text: &str, sep: char) -> Vec<String> {
    let mut parts = vec![String::new()];
    let mut depth = 0i32;
    let mut escaped = false;
    for c in text.chars() {
        if escaped {
            escaped = false;
        } else if c == '\\' {
            escaped = true;
        } else if c == '[' || c == '(' {
            depth += 1;
        } else if c == ']' || c == ')' {
            depth -= 1;
        } else if c == sep && depth == 0 {
            parts.push(String::new());
            continue;
        }
        if let Some(last) = parts.last_mut() {
            last.push(c);
        }
    }
    parts
}

fn resolve_bracket(inner: &str, step: usize, steps: usize) -> String {
    let alternatives = split_top_level(inner, '|');
    if alternatives.len() > 1 {
        let pick = &alternatives[(step.max(1) - 1) % alternatives.len()];
        return resolve_at(pick, step, steps);
    }

    let parts = split_top_level(inner, ':');
    if parts.len() == 2 || parts.len() == 3 {
        if let Ok(when) = parts[parts.len() - 1].trim().parse::<f32>() {
            let switch_at = if when < 1.0 {
                (when * steps as f32) as usize
            } else {
                when as usize
            };
            let (from, to) = if parts.len() == 3 {
                (parts[0].as_str(), parts[1].as_str())
            } else {
                ("", parts[0].as_str())
            };
            let chosen = if step > switch_at { to } else { from };
            return resolve_at(chosen, step, steps);
        }
    }

    // plain emphasis brackets are left for the attention parser
    format!("[{}]", resolve_at(inner, step, steps))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unscheduled_prompt_is_untouched() {
        let s = resolve_schedule("a (cat:1.2) [dog] on a mat", 20);
        assert_eq!(s.prompt, "a (cat:1.2) [dog] on a mat");
        assert!(!s.scheduled);
    }

    #[test]
    fn test_from_to_resolves_to_final() {
        let s = resolve_schedule("a [dog:cat:10] running", 20);
        assert_eq!(s.prompt, "a cat running");
        assert!(s.scheduled);
        assert_eq!(resolve_at("a [dog:cat:10] running", 10, 20), "a dog running");
    }

    #[test]
    fn test_fractional_and_short_forms() {
        assert_eq!(resolve_schedule("[hat:0.5] man", 10).prompt, "hat man");
        assert_eq!(resolve_at("[hat:0.5] man", 5, 10), " man");
        assert_eq!(resolve_schedule("[sunny::0.5] sky", 10).prompt, " sky");
        assert_eq!(resolve_at("[sunny::0.5] sky", 1, 10), "sunny sky");
    }

    #[test]
    fn test_nested_and_alternation() {
        let s = resolve_schedule("[[red|blue] (car:1.1):bike:5]", 20);
        assert_eq!(s.prompt, "bike");
        assert_eq!(resolve_at("[[red|blue] (car:1.1):bike:5]", 2, 20), "blue (car:1.1)");
        assert_eq!(resolve_at("[cow|horse]", 3, 4), "cow");
    }

    #[test]
    fn test_unmatched_bracket_is_literal() {
        assert_eq!(resolve_schedule("a [cat", 20).prompt, "a [cat");
    }
}
