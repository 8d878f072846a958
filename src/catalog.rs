use serde::Serialize;

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ModelCard {
    pub id: &'static str,
    pub object: &'static str,
    pub created: i64,
    pub owned_by: &'static str,
}

#[derive(Debug, Serialize)]
pub struct ModelsResponse {
    pub object: &'static str,
    pub data: Vec<ModelCard>,
}

const fn card(id: &'static str, created: i64, owned_by: &'static str) -> ModelCard {
    ModelCard {
        id,
        object: "model",
        created,
        owned_by,
    }
}

pub const SUPPORTED_MODELS: &[ModelCard] = &[
    card("chat-bison", 1_694_793_600, "google"),
    card("codechat-bison", 1_694_793_600, "google"),
    card("gemini-pro", 1_704_643_200, "google"),
    card("gemini-1.5-pro", 1_716_825_600, "google"),
    card("gemini-1.5-flash", 1_716_825_600, "google"),
    card("claude-3-sonnet@20240229", 1_709_136_000, "anthropic"),
    card("claude-3-opus@20240229", 1_709_136_000, "anthropic"),
    card("claude-3-haiku@20240307", 1_711_468_800, "anthropic"),
    card("claude-3-5-sonnet@20240620", 1_718_812_800, "anthropic"),
    card("gpt-3.5-turbo", 1_694_793_600, "openai"),
    card("gpt-4", 1_694_793_600, "openai"),
    card("gpt-4-turbo", 1_707_408_000, "openai"),
    card("gpt-4o", 1_715_702_400, "openai"),
    card("gpt-4o-mini", 1_721_232_000, "openai"),
];

pub fn models_response() -> ModelsResponse {
    ModelsResponse {
        object: "list",
        data: SUPPORTED_MODELS.to_vec(),
    }
}

/// Rewrites `claude-<name>-YYYYMMDD` into the backend form `claude-<name>@YYYYMMDD`.
/// Any other name is returned unchanged, so the function is idempotent.
pub fn normalize_model_name(model: &str) -> String {
    if !model.starts_with("claude-") || model.contains('@') {
        return model.to_owned();
    }
    match model.rsplit_once('-') {
        Some((head, date)) if date.len() == 8 && date.bytes().all(|b| b.is_ascii_digit()) => {
            format!("{head}@{date}")
        }
        _ => model.to_owned(),
    }
}

pub fn is_supported(model: &str) -> bool {
    let normalized = normalize_model_name(model);
    SUPPORTED_MODELS.iter().any(|card| card.id == normalized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claude_dated_names_are_rewritten() {
        assert_eq!(
            normalize_model_name("claude-3-5-sonnet-20240620"),
            "claude-3-5-sonnet@20240620"
        );
        assert_eq!(
            normalize_model_name("claude-3-5-sonnet@20240620"),
            "claude-3-5-sonnet@20240620"
        );
        assert_eq!(normalize_model_name("claude-3-5-sonnet"), "claude-3-5-sonnet");
        assert_eq!(normalize_model_name("claude-x-2024062"), "claude-x-2024062");
        assert_eq!(normalize_model_name("gpt-4o-20240620"), "gpt-4o-20240620");
    }

    #[test]
    fn normalization_is_idempotent() {
        for model in [
            "claude-3-haiku-20240307",
            "claude-20240307",
            "claude-",
            "claude-3-opus@20240229",
            "gpt-4o",
            "",
            "-20240307",
        ] {
            let once = normalize_model_name(model);
            assert_eq!(normalize_model_name(&once), once, "model {model:?}");
        }
    }

    #[test]
    fn support_check_accepts_both_claude_spellings() {
        assert!(is_supported("claude-3-haiku-20240307"));
        assert!(is_supported("claude-3-haiku@20240307"));
        assert!(is_supported("gpt-4o-mini"));
        assert!(!is_supported("gpt-5"));
    }
}
