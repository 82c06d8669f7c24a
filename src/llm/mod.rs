mod tensorzero;

pub use tensorzero::{LlmClient, LlmConfig, LlmContent, LlmMessage};

/// Models often wrap JSON answers in a ```json fence; return the fenced body.
pub fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_stripped() {
        let raw = "```json\n{\"title\": \"Lamp\"}\n```";
        assert_eq!(strip_markdown_fence(raw), "{\"title\": \"Lamp\"}");
    }

    #[test]
    fn plain_text_trimmed() {
        assert_eq!(strip_markdown_fence("  {\"a\":1}\n"), "{\"a\":1}");
    }
}
