use super::{DescriptionGenerator, ListingDescription, StructuredListing, TransformError};
use crate::{
    codec,
    codec::ImageHandle,
    llm::{LlmClient, LlmContent, LlmMessage, strip_markdown_fence},
};
use async_trait::async_trait;
use std::sync::Arc;

/// Writes listing copy for a product photo through the LLM gateway.
pub struct LlmDescriptionGenerator {
    llm: Arc<LlmClient>,
}

impl LlmDescriptionGenerator {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

fn listing_prompt(tone: &str, lang: &str) -> String {
    format!(
        "Generate an SEO-optimised e-commerce product listing in {lang}. \
         Tone: {tone}. Respond ONLY with strict JSON containing keys \
         {{'title','description','features','tags'}}. \
         'features' and 'tags' must be arrays."
    )
}

/// Well-formed JSON with a non-empty title becomes a structured listing;
/// anything else is kept verbatim.
pub fn interpret(text: &str, lang: &str) -> ListingDescription {
    let cleaned = strip_markdown_fence(text);
    match serde_json::from_str::<StructuredListing>(&cleaned) {
        Ok(mut listing) if !listing.title.trim().is_empty() => {
            listing.language.get_or_insert_with(|| lang.to_string());
            ListingDescription::Structured(listing)
        }
        _ => ListingDescription::RawText {
            text: text.trim().to_string(),
        },
    }
}

#[async_trait]
impl DescriptionGenerator for LlmDescriptionGenerator {
    fn name(&self) -> &'static str {
        "llm_description"
    }

    async fn describe(
        &self,
        image: &ImageHandle,
        tone: &str,
        lang: &str,
    ) -> Result<ListingDescription, TransformError> {
        let encoded =
            codec::jpeg_base64(image).map_err(|err| TransformError::Processing(err.to_string()))?;
        let messages = [LlmMessage::user(vec![
            LlmContent::jpeg(encoded),
            LlmContent::text(listing_prompt(tone, lang)),
        ])];
        let response = self
            .llm
            .chat("product_listing", &messages)
            .await
            .map_err(|err| TransformError::Remote(err.to_string()))?;
        Ok(interpret(&response.text, lang))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_json_is_structured() {
        let text = "```json\n{\"title\":\"Canvas Tote\",\"description\":\"Roomy.\",\
                    \"features\":[\"zip\"],\"tags\":[\"bag\",\"tote\"]}\n```";
        match interpret(text, "en") {
            ListingDescription::Structured(listing) => {
                assert_eq!(listing.title, "Canvas Tote");
                assert_eq!(listing.tags, vec!["bag", "tote"]);
                assert_eq!(listing.language.as_deref(), Some("en"));
            }
            other => panic!("expected structured, got {other:?}"),
        }
    }

    #[test]
    fn missing_arrays_default_empty() {
        let text = r#"{"title":"Lamp","description":"Warm light."}"#;
        let ListingDescription::Structured(listing) = interpret(text, "de") else {
            panic!("expected structured");
        };
        assert!(listing.features.is_empty());
        assert_eq!(listing.language.as_deref(), Some("de"));
    }

    #[test]
    fn prose_kept_as_raw_text() {
        let out = interpret("  A lovely red shoe.  ", "en");
        assert_eq!(
            out,
            ListingDescription::RawText {
                text: "A lovely red shoe.".into()
            }
        );
    }

    #[test]
    fn blank_title_is_not_structured() {
        let out = interpret(r#"{"title":" ","description":"x"}"#, "en");
        assert!(matches!(out, ListingDescription::RawText { .. }));
    }

    #[test]
    fn prompt_carries_tone_and_language() {
        let prompt = listing_prompt("playful", "fr");
        assert!(prompt.contains("in fr"));
        assert!(prompt.contains("Tone: playful"));
    }
}
