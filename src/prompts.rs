pub const IMAGE_PROMPT_SUFFIX: &str = ". NO TEXT, NO WORDS, NO TYPOGRAPHY, NO LABELS, NO WATERMARKS, NO SIGNATURES. High contrast, sharp focus, 8k.";

pub const JSON_ONLY_DIRECTIVE: &str = "\n\nRespond with valid JSON only. Do not wrap the JSON in markdown code fences and do not add any commentary before or after it.";

/// Appended to every image prompt, regardless of model family.
pub fn clean_image_prompt(base_prompt: &str) -> String {
    format!("{base_prompt}{IMAGE_PROMPT_SUFFIX}")
}

/// The queue backend has no structured-output mode, so JSON is requested in prose.
pub fn queue_system_prompt(system_prompt: &str, json_mode: bool) -> String {
    if json_mode {
        format!("{system_prompt}{JSON_ONLY_DIRECTIVE}")
    } else {
        system_prompt.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_keeps_prompt_as_prefix() {
        for prompt in ["", "a lighthouse at dusk", "emoji 🌊 and\nnewlines", "trailing. "] {
            let cleaned = clean_image_prompt(prompt);
            assert!(cleaned.starts_with(prompt));
            assert!(cleaned.ends_with(IMAGE_PROMPT_SUFFIX));
            assert_eq!(cleaned.len(), prompt.len() + IMAGE_PROMPT_SUFFIX.len());
        }
    }

    #[test]
    fn json_directive_only_in_json_mode() {
        assert_eq!(queue_system_prompt("be brief", false), "be brief");
        let prompt = queue_system_prompt("be brief", true);
        assert!(prompt.starts_with("be brief"));
        assert!(prompt.contains("JSON only"));
    }
}
