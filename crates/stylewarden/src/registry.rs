//! Site registry: the table of descriptors, loaded from JSON.

use std::collections::HashSet;
use std::path::Path;

use crate::types::{EngineError, EngineResult, ResourceDescriptor};

#[derive(Debug, Clone, Default)]
pub struct SiteRegistry {
    sites: Vec<ResourceDescriptor>,
}

impl SiteRegistry {
    /// Build from descriptors, validating each.
    pub fn new(sites: Vec<ResourceDescriptor>) -> EngineResult<Self> {
        let mut seen = HashSet::new();
        for site in &sites {
            validate(site)?;
            if !seen.insert(site.id.as_str()) {
                return Err(EngineError::Registry(format!("duplicate id `{}`", site.id)));
            }
        }
        Ok(Self { sites })
    }

    /// Load a JSON array of descriptors from `path`.
    pub fn load(path: &Path) -> EngineResult<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Registry(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_json(&data)
    }

    pub fn from_json(data: &str) -> EngineResult<Self> {
        let sites: Vec<ResourceDescriptor> = serde_json::from_str(data)
            .map_err(|e| EngineError::Registry(e.to_string()))?;
        let registry = Self::new(sites)?;
        tracing::debug!("Loaded {} site descriptors", registry.len());
        Ok(registry)
    }

    pub fn get(&self, id: &str) -> Option<&ResourceDescriptor> {
        self.sites.iter().find(|s| s.id == id)
    }

    /// First descriptor whose `hosts` cover `host`.
    pub fn find_for_host(&self, host: &str) -> Option<&ResourceDescriptor> {
        self.sites.iter().find(|s| s.matches_host(host))
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.sites.iter()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }
}

fn validate(site: &ResourceDescriptor) -> EngineResult<()> {
    if site.id.trim().is_empty() {
        return Err(EngineError::Registry("descriptor with empty id".into()));
    }
    if site.sources.is_empty() {
        return Err(EngineError::Registry(format!("`{}` has no sources", site.id)));
    }
    let target = site.target_selector.strip_prefix('#').unwrap_or_default();
    let plain_id = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if target.is_empty() || !target.chars().all(plain_id) {
        return Err(EngineError::Registry(format!(
            "`{}` target_selector must be an id selector like `#name`, got `{}`",
            site.id, site.target_selector
        )));
    }
    if let Some(order) = &site.technique_order {
        let unique: HashSet<_> = order.iter().collect();
        if unique.len() != order.len() {
            return Err(EngineError::Registry(format!(
                "`{}` technique_order lists a technique twice",
                site.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SITES: &str = r##"[
        {
            "id": "deepseek",
            "name": "DeepSeek",
            "sources": ["https://raw.example.com/deepseek.css"],
            "target_selector": "#deepseek-enhanced-styles",
            "hosts": ["deepseek.com"]
        },
        {
            "id": "grok",
            "sources": ["https://raw.example.com/grok.css"],
            "target_selector": "#grok-enhanced-styles",
            "hosts": ["grok.com", "x.com"],
            "aggressive_reconciliation": true,
            "technique_order": ["external_link", "inline_style"]
        }
    ]"##;

    #[test]
    fn test_load_and_lookup() {
        let registry = SiteRegistry::from_json(SITES).unwrap();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("grok").unwrap().display_name(), "grok");
        assert_eq!(
            registry.find_for_host("chat.deepseek.com").unwrap().id,
            "deepseek"
        );
        assert_eq!(registry.find_for_host("x.com").unwrap().id, "grok");
        assert!(registry.find_for_host("example.org").is_none());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sites.json");
        std::fs::write(&path, SITES).unwrap();
        let registry = SiteRegistry::load(&path).unwrap();
        assert!(!registry.get("deepseek").unwrap().aggressive_reconciliation);
    }

    #[test]
    fn test_bundled_example_is_valid() {
        let registry =
            SiteRegistry::from_json(include_str!("../../../sites.example.json")).unwrap();
        assert_eq!(registry.find_for_host("chatgpt.com").unwrap().id, "chatgpt");
        let universal = registry.get("universal").unwrap();
        assert!(!universal.enabled_by_default);
        assert_eq!(universal.technique_order.as_ref().unwrap().len(), 3);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let json = r##"[
            {"id": "a", "sources": ["https://a.test/1.css"], "target_selector": "#a"},
            {"id": "a", "sources": ["https://a.test/2.css"], "target_selector": "#b"}
        ]"##;
        assert!(matches!(
            SiteRegistry::from_json(json),
            Err(EngineError::Registry(_))
        ));
    }

    #[test]
    fn test_invalid_descriptors_rejected() {
        let no_sources = r##"[{"id": "a", "sources": [], "target_selector": "#a"}]"##;
        assert!(SiteRegistry::from_json(no_sources).is_err());

        let class_selector =
            r##"[{"id": "a", "sources": ["https://a.test/1.css"], "target_selector": ".a"}]"##;
        assert!(SiteRegistry::from_json(class_selector).is_err());

        for selector in ["#a.b", "#a>b", "#a b", "#a[x]", "#"] {
            let json = format!(
                r#"[{{"id": "a", "sources": ["https://a.test/1.css"], "target_selector": "{selector}"}}]"#
            );
            assert!(SiteRegistry::from_json(&json).is_err(), "{selector} accepted");
        }
        let plain = r##"[{"id": "a", "sources": ["https://a.test/1.css"], "target_selector": "#chat-enhanced_styles2"}]"##;
        assert!(SiteRegistry::from_json(plain).is_ok());

        let missing_file = SiteRegistry::load(Path::new("/nonexistent/sites.json"));
        assert!(missing_file.is_err());
    }
}
