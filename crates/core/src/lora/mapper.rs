//! Checkpoint-to-engine weight name translation.

/// Ordered weight-name rewrites for model families whose HuggingFace
/// checkpoint layout differs from the engine's module tree (e.g. Qwen2-VL
/// nests the language model under `language_model.`).
///
/// Rules run substring, then prefix, then suffix, each group in declaration
/// order against the already-rewritten name. A rule mapping to `None` drops
/// the weight.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeightsMapper {
    substr: Vec<(String, Option<String>)>,
    prefix: Vec<(String, Option<String>)>,
    suffix: Vec<(String, Option<String>)>,
}

impl WeightsMapper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the first occurrence of `from` anywhere in the name.
    pub fn with_substr(mut self, from: impl Into<String>, to: Option<&str>) -> Self {
        self.substr.push((from.into(), to.map(str::to_string)));
        self
    }

    /// Replace a leading `from`.
    pub fn with_prefix(mut self, from: impl Into<String>, to: Option<&str>) -> Self {
        self.prefix.push((from.into(), to.map(str::to_string)));
        self
    }

    /// Replace a trailing `from`.
    pub fn with_suffix(mut self, from: impl Into<String>, to: Option<&str>) -> Self {
        self.suffix.push((from.into(), to.map(str::to_string)));
        self
    }

    /// Map a checkpoint weight name. `None` means the weight is dropped.
    pub fn map_name(&self, name: &str) -> Option<String> {
        let mut key = name.to_string();

        for (from, to) in &self.substr {
            if key.contains(from.as_str()) {
                key = key.replacen(from.as_str(), to.as_deref()?, 1);
            }
        }
        for (from, to) in &self.prefix {
            if let Some(rest) = key.strip_prefix(from.as_str()) {
                key = format!("{}{}", to.as_deref()?, rest);
            }
        }
        for (from, to) in &self.suffix {
            if let Some(head) = key.strip_suffix(from.as_str()) {
                key = format!("{}{}", head, to.as_deref()?);
            }
        }

        Some(key)
    }

    /// Whether any rules are configured.
    pub fn is_empty(&self) -> bool {
        self.substr.is_empty() && self.prefix.is_empty() && self.suffix.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_rules_apply_in_order() {
        let mapper = WeightsMapper::new()
            .with_prefix("model.language_model.", Some("language_model.model."))
            .with_prefix("model.", Some("language_model.model."));

        assert_eq!(
            mapper.map_name("model.language_model.layers.0.mlp.down_proj"),
            Some("language_model.model.layers.0.mlp.down_proj".to_string())
        );
        assert_eq!(
            mapper.map_name("model.layers.0.mlp.down_proj"),
            Some("language_model.model.layers.0.mlp.down_proj".to_string())
        );
    }

    #[test]
    fn test_substr_and_suffix() {
        let mapper = WeightsMapper::new()
            .with_substr(".attn.", Some(".self_attn."))
            .with_suffix(".qkv", Some(".qkv_proj"));

        assert_eq!(
            mapper.map_name("layers.3.attn.qkv"),
            Some("layers.3.self_attn.qkv_proj".to_string())
        );
    }

    #[test]
    fn test_none_drops_weight() {
        let mapper = WeightsMapper::new().with_prefix("visual.", None);
        assert_eq!(mapper.map_name("visual.blocks.0.attn.qkv"), None);
        assert_eq!(
            mapper.map_name("lm_head"),
            Some("lm_head".to_string())
        );
    }

    #[test]
    fn test_empty_mapper_is_identity() {
        let mapper = WeightsMapper::new();
        assert!(mapper.is_empty());
        assert_eq!(mapper.map_name("a.b.c"), Some("a.b.c".to_string()));
    }
}
