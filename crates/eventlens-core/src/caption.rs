//! Photo captions and storage advice from an external text provider, with
//! fixed fallbacks.
//!
//! Provider text is decoration; an outage or missing credentials must never
//! fail an upload or a usage query, so [`CaptionGenerator::generate`] and
//! [`CaptionGenerator::analyze_storage`] always return text.

use thiserror::Error;

/// Returned when no provider is configured.
pub const CAPTION_UNCONFIGURED: &str =
    "A beautiful candid shot from the event (AI Caption unavailable).";

/// Returned when the provider fails or produces no text.
pub const CAPTION_FAILED: &str = "Event memory captured.";

pub const STORAGE_ANALYSIS_UNCONFIGURED: &str = "AI Analysis unavailable without API Key.";
pub const STORAGE_ANALYSIS_FAILED: &str = "Could not analyze storage trends.";
/// Returned when the provider answers with no text.
pub const STORAGE_ANALYSIS_EMPTY: &str = "Analysis failed.";

#[derive(Error, Debug)]
pub enum CaptionError {
    #[error("caption provider unreachable: {0}")]
    Unreachable(String),
}

/// A text service that describes an encoded image in a short sentence and
/// comments on storage usage.
pub trait CaptionProvider: Send + Sync {
    fn caption(&self, image: &[u8]) -> Result<String, CaptionError>;

    /// Two sentences on whether the usage summary calls for more storage.
    fn analyze_storage(&self, usage: &str) -> Result<String, CaptionError>;

    fn name(&self) -> &str;
}

pub struct CaptionGenerator {
    provider: Option<Box<dyn CaptionProvider>>,
}

impl CaptionGenerator {
    /// No provider credentials: every caption is [`CAPTION_UNCONFIGURED`].
    pub fn unconfigured() -> Self {
        Self { provider: None }
    }

    pub fn with_provider(provider: Box<dyn CaptionProvider>) -> Self {
        Self { provider: Some(provider) }
    }

    pub fn is_configured(&self) -> bool {
        self.provider.is_some()
    }

    pub fn generate(&self, image: &[u8]) -> String {
        let Some(provider) = &self.provider else {
            tracing::debug!("caption provider not configured; using fallback caption");
            return CAPTION_UNCONFIGURED.to_string();
        };

        match provider.caption(image) {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                tracing::warn!(provider = provider.name(), "caption provider returned no text");
                CAPTION_FAILED.to_string()
            }
            Err(e) => {
                tracing::warn!(provider = provider.name(), error = %e, "caption generation failed");
                CAPTION_FAILED.to_string()
            }
        }
    }

    pub fn analyze_storage(&self, usage: &str) -> String {
        let Some(provider) = &self.provider else {
            return STORAGE_ANALYSIS_UNCONFIGURED.to_string();
        };

        match provider.analyze_storage(usage) {
            Ok(text) if !text.trim().is_empty() => text.trim().to_string(),
            Ok(_) => {
                tracing::warn!(provider = provider.name(), "storage analysis returned no text");
                STORAGE_ANALYSIS_EMPTY.to_string()
            }
            Err(e) => {
                tracing::warn!(provider = provider.name(), error = %e, "storage analysis failed");
                STORAGE_ANALYSIS_FAILED.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(Result<&'static str, &'static str>);

    impl CaptionProvider for Fixed {
        fn caption(&self, _: &[u8]) -> Result<String, CaptionError> {
            self.0
                .map(str::to_string)
                .map_err(|e| CaptionError::Unreachable(e.to_string()))
        }

        fn analyze_storage(&self, usage: &str) -> Result<String, CaptionError> {
            self.0
                .map(|text| text.replace("{usage}", usage))
                .map_err(|e| CaptionError::Unreachable(e.to_string()))
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    #[test]
    fn test_unconfigured_returns_literal_fallback() {
        let generator = CaptionGenerator::unconfigured();
        assert!(!generator.is_configured());
        assert_eq!(
            generator.generate(b"jpeg bytes"),
            "A beautiful candid shot from the event (AI Caption unavailable)."
        );
    }

    #[test]
    fn test_provider_error_recovered() {
        let generator = CaptionGenerator::with_provider(Box::new(Fixed(Err("timeout"))));
        assert_eq!(generator.generate(b""), CAPTION_FAILED);
    }

    #[test]
    fn test_blank_caption_recovered() {
        let generator = CaptionGenerator::with_provider(Box::new(Fixed(Ok("   \n"))));
        assert_eq!(generator.generate(b""), CAPTION_FAILED);
    }

    #[test]
    fn test_caption_trimmed() {
        let generator = CaptionGenerator::with_provider(Box::new(Fixed(Ok("  Guests dancing under lanterns. \n"))));
        assert_eq!(generator.generate(b""), "Guests dancing under lanterns.");
    }

    #[test]
    fn test_storage_analysis_without_provider() {
        let generator = CaptionGenerator::unconfigured();
        assert_eq!(
            generator.analyze_storage("Wedding: 4.0 GB of 5.0 GB used"),
            "AI Analysis unavailable without API Key."
        );
    }

    #[test]
    fn test_storage_analysis_provider_error() {
        let generator = CaptionGenerator::with_provider(Box::new(Fixed(Err("quota exceeded"))));
        assert_eq!(generator.analyze_storage("Wedding: 4.0 GB of 5.0 GB used"), "Could not analyze storage trends.");
    }

    #[test]
    fn test_storage_analysis_blank_reply() {
        let generator = CaptionGenerator::with_provider(Box::new(Fixed(Ok(" "))));
        assert_eq!(generator.analyze_storage("Wedding: 4.0 GB of 5.0 GB used"), STORAGE_ANALYSIS_EMPTY);
    }

    #[test]
    fn test_storage_analysis_sees_usage() {
        let generator = CaptionGenerator::with_provider(Box::new(Fixed(Ok(" Upgrade soon: {usage}. \n"))));
        assert_eq!(generator.analyze_storage("80% used"), "Upgrade soon: 80% used.");
    }
}
