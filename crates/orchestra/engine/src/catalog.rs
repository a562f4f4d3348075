//! Template catalog: the static registry plans are compiled against
//!
//! Templates are registered up front and looked up by id, or by the
//! blackboard key they produce. The catalog never changes while a plan
//! compiled from it is running; engines hold it behind an `Arc`.

use orchestra_types::{CatalogError, CatalogResult, StepTemplate, TemplateId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Registry of step templates
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(from = "Vec<StepTemplate>", into = "Vec<StepTemplate>")]
pub struct TemplateCatalog {
    /// All registered templates, keyed by ID
    templates: HashMap<TemplateId, StepTemplate>,
    /// Registration order, used to break ties between producers
    order: Vec<TemplateId>,
    /// Index: produced key → producing templates, in registration order
    by_output: HashMap<String, Vec<TemplateId>>,
}

impl TemplateCatalog {
    /// Create a new empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a template after validating it
    pub fn register(&mut self, template: StepTemplate) -> CatalogResult<TemplateId> {
        template
            .validate()
            .map_err(|reason| CatalogError::InvalidTemplate {
                template: template.id.clone(),
                reason,
            })?;
        if self.templates.contains_key(&template.id) {
            return Err(CatalogError::Duplicate(template.id.clone()));
        }

        let id = template.id.clone();
        for key in &template.produces {
            self.by_output
                .entry(key.clone())
                .or_default()
                .push(id.clone());
        }
        self.order.push(id.clone());
        self.templates.insert(id.clone(), template);

        tracing::debug!(template_id = %id, "Step template registered");
        Ok(id)
    }

    /// Builder-style registration for fixtures and demos
    pub fn with(mut self, template: StepTemplate) -> CatalogResult<Self> {
        self.register(template)?;
        Ok(self)
    }

    pub fn get(&self, id: &TemplateId) -> Option<&StepTemplate> {
        self.templates.get(id)
    }

    pub fn contains(&self, id: &TemplateId) -> bool {
        self.templates.contains_key(id)
    }

    /// Templates that produce `key`, in registration order
    pub fn producers_of(&self, key: &str) -> Vec<&StepTemplate> {
        self.by_output
            .get(key)
            .map(|ids| ids.iter().filter_map(|id| self.templates.get(id)).collect())
            .unwrap_or_default()
    }

    /// The template a plan should use for `key`.
    ///
    /// Templates that are listed as someone's alternative only step in when
    /// no primary producer exists.
    pub fn primary_producer(&self, key: &str) -> Option<&StepTemplate> {
        let producers = self.producers_of(key);
        let alternates = self.alternate_ids();
        producers
            .iter()
            .find(|t| !alternates.contains(&t.id))
            .or_else(|| producers.first())
            .copied()
    }

    /// Declared alternatives of a template that are registered here
    pub fn alternatives_for(&self, id: &TemplateId) -> Vec<&StepTemplate> {
        self.templates
            .get(id)
            .map(|t| {
                t.alternatives
                    .iter()
                    .filter_map(|alt| self.templates.get(alt))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn alternate_ids(&self) -> HashSet<&TemplateId> {
        self.templates
            .values()
            .flat_map(|t| t.alternatives.iter())
            .collect()
    }

    /// All templates in registration order
    pub fn list(&self) -> Vec<&StepTemplate> {
        self.order
            .iter()
            .filter_map(|id| self.templates.get(id))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }
}

impl From<Vec<StepTemplate>> for TemplateCatalog {
    /// Lenient conversion used by deserialization; invalid entries are skipped
    fn from(templates: Vec<StepTemplate>) -> Self {
        let mut catalog = TemplateCatalog::new();
        for template in templates {
            if let Err(e) = catalog.register(template) {
                tracing::warn!(error = %e, "Skipping catalog entry");
            }
        }
        catalog
    }
}

impl From<TemplateCatalog> for Vec<StepTemplate> {
    fn from(catalog: TemplateCatalog) -> Self {
        let TemplateCatalog {
            mut templates,
            order,
            ..
        } = catalog;
        order
            .iter()
            .filter_map(|id| templates.remove(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summarize() -> StepTemplate {
        StepTemplate::capability("summarize", "llm.summarize")
            .consumes("document")
            .produces("summary")
            .with_alternative("summarize-lite")
    }

    fn summarize_lite() -> StepTemplate {
        StepTemplate::capability("summarize-lite", "llm.summarize.small")
            .consumes("document")
            .produces("summary")
    }

    #[test]
    fn test_register_and_get() {
        let mut catalog = TemplateCatalog::new();
        let id = catalog.register(summarize()).unwrap();
        assert_eq!(catalog.get(&id).unwrap().produces, vec!["summary".to_string()]);
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_register_duplicate() {
        let mut catalog = TemplateCatalog::new();
        catalog.register(summarize()).unwrap();
        let result = catalog.register(summarize());
        assert!(matches!(result, Err(CatalogError::Duplicate(_))));
    }

    #[test]
    fn test_register_invalid() {
        let mut catalog = TemplateCatalog::new();
        let result = catalog.register(StepTemplate::capability("empty", "noop"));
        assert!(matches!(result, Err(CatalogError::InvalidTemplate { .. })));
        assert!(catalog.is_empty());
    }

    #[test]
    fn test_primary_producer_skips_alternatives() {
        let mut catalog = TemplateCatalog::new();
        // Registered first, but it is an alternative of `summarize`.
        catalog.register(summarize_lite()).unwrap();
        catalog.register(summarize()).unwrap();

        assert_eq!(catalog.producers_of("summary").len(), 2);
        assert_eq!(
            catalog.primary_producer("summary").unwrap().id,
            TemplateId::new("summarize")
        );
        assert!(catalog.primary_producer("nothing").is_none());
    }

    #[test]
    fn test_alternative_used_when_alone() {
        let catalog = TemplateCatalog::new()
            .with(
                StepTemplate::capability("a", "x")
                    .produces("out")
                    .with_alternative("b"),
            )
            .unwrap()
            .with(StepTemplate::capability("b", "y").produces("other"))
            .unwrap();
        assert_eq!(catalog.alternatives_for(&TemplateId::new("a")).len(), 1);
        assert!(catalog.alternatives_for(&TemplateId::new("b")).is_empty());
    }

    #[test]
    fn test_serde_preserves_order() {
        let catalog = TemplateCatalog::new()
            .with(summarize())
            .unwrap()
            .with(summarize_lite())
            .unwrap();
        let json = serde_json::to_value(&catalog).unwrap();
        let back: TemplateCatalog = serde_json::from_value(json).unwrap();
        let ids: Vec<&str> = back.list().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["summarize", "summarize-lite"]);
    }
}
