//! Per-encoder prompt routing with the `TE2:` and `TE3:` markers

use super::attention::parse_prompt_attention;

pub const TE2_MARKER: &str = "TE2:";
pub const TE3_MARKER: &str = "TE3:";

/// Placeholder for an encoder prompt that was not given
pub const EMPTY_SUBPROMPT: &str = " ";

#[derive(Debug, Clone, PartialEq)]
pub struct SplitPrompt {
    pub primary: String,
    pub secondary: String,
    pub tertiary: String,
}

/// Split a prompt into the sub-prompts fed to each text encoder
///
/// `TE3:` may appear before or after `TE2:`. A missing sub-prompt falls back to
/// the primary text; an empty one becomes a single space. For SD3 an explicit
/// tertiary prompt is flattened to plain text since T5 ignores attention syntax.
pub fn split_prompts(prompt: &str, sd3: bool) -> SplitPrompt {
    let (head, secondary) = match prompt.split_once(TE2_MARKER) {
        Some((head, rest)) => (head, Some(rest)),
        None => (prompt, None),
    };

    let (primary, secondary, tertiary) = if let Some((p1, p3)) = head.split_once(TE3_MARKER) {
        (p1, secondary, Some(p3))
    } else if let Some((p2, p3)) = secondary.and_then(|s| s.split_once(TE3_MARKER)) {
        (head, Some(p2), Some(p3))
    } else {
        (head, secondary, None)
    };

    let primary = primary.trim().to_string();
    let placeholder = |text: Option<&str>| {
        let text = text.unwrap_or(primary.as_str()).trim();
        if text.is_empty() {
            EMPTY_SUBPROMPT.to_string()
        } else {
            text.to_string()
        }
    };
    let secondary = placeholder(secondary);
    let mut tertiary = placeholder(tertiary);

    if sd3 && tertiary != EMPTY_SUBPROMPT {
        tertiary = parse_prompt_attention(&tertiary)
            .into_iter()
            .map(|s| s.text)
            .collect::<Vec<_>>()
            .join(" ");
    }

    SplitPrompt {
        primary,
        secondary,
        tertiary,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_markers_fall_back_to_primary() {
        let s = split_prompts("a cat", false);
        assert_eq!(s.primary, "a cat");
        assert_eq!(s.secondary, "a cat");
        assert_eq!(s.tertiary, "a cat");
    }

    #[test]
    fn test_both_markers_either_order() {
        let s = split_prompts("a cat TE2: oil painting TE3: detailed fur", false);
        assert_eq!((s.primary.as_str(), s.secondary.as_str(), s.tertiary.as_str()), ("a cat", "oil painting", "detailed fur"));
        let s = split_prompts("a cat TE3: detailed fur TE2: oil painting", false);
        assert_eq!((s.primary.as_str(), s.secondary.as_str(), s.tertiary.as_str()), ("a cat", "oil painting", "detailed fur"));
    }

    #[test]
    fn test_empty_subprompt_is_space() {
        let s = split_prompts("a cat TE2:", false);
        assert_eq!(s.secondary, EMPTY_SUBPROMPT);
        assert_eq!(s.tertiary, "a cat");
    }

    #[test]
    fn test_sd3_flattens_tertiary() {
        let s = split_prompts("a cat TE3: (fluffy:1.3) fur", true);
        assert_eq!(s.tertiary, "fluffy  fur");
        assert_eq!(s.secondary, "a cat");
    }
}
