use common::error::AppError;
use common::storage::types::ingestion_task::IngestionPayload;
use common::utils::config::AppConfig;

/// Rejects oversized submissions before they occupy a queue slot.
pub fn validate_ingest_payload(
    config: &AppConfig,
    payload: &IngestionPayload,
) -> Result<(), AppError> {
    if payload.text.trim().is_empty() {
        return Err(AppError::Validation(
            "ingestion payload has no text".to_string(),
        ));
    }

    if payload.text.len() > config.ingest_max_content_bytes {
        return Err(AppError::Validation(format!(
            "Content is too large. Maximum allowed is {} bytes",
            config.ingest_max_content_bytes
        )));
    }

    if let Some(context) = &payload.context {
        if context.len() > config.ingest_max_context_bytes {
            return Err(AppError::Validation(format!(
                "Context is too large. Maximum allowed is {} bytes",
                config.ingest_max_context_bytes
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::passage::Visibility;
    use std::collections::BTreeSet;

    fn payload(text: &str, context: Option<&str>) -> IngestionPayload {
        IngestionPayload {
            entry_id: None,
            source: "notes.md".to_string(),
            text: text.to_string(),
            context: context.map(ToString::to_string),
            visibility: Visibility::Private,
            group_ids: BTreeSet::new(),
        }
    }

    #[test]
    fn rejects_empty_text() {
        let config = AppConfig::default();
        let result = validate_ingest_payload(&config, &payload("   ", None));
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn rejects_oversized_content() {
        let config = AppConfig {
            ingest_max_content_bytes: 10,
            ..AppConfig::default()
        };
        let result = validate_ingest_payload(&config, &payload("a very long document", None));
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn rejects_oversized_context() {
        let config = AppConfig {
            ingest_max_context_bytes: 4,
            ..AppConfig::default()
        };
        let result = validate_ingest_payload(&config, &payload("fine text", Some("too much")));
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn accepts_reasonable_payload() {
        let config = AppConfig::default();
        assert!(validate_ingest_payload(&config, &payload("fine text", Some("ctx"))).is_ok());
    }
}
