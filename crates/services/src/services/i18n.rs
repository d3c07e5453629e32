//! Message catalogs with i18next-style `{{param}}` interpolation.

use std::collections::HashMap;

const EN: &str = include_str!("../../locales/en.json");

pub trait Translator: Send + Sync {
    /// Look up `key` and interpolate `params`. Unknown keys render as the key itself.
    fn translate(&self, key: &str, params: &[(&str, String)]) -> String;

    fn t(&self, key: &str) -> String {
        self.translate(key, &[])
    }
}

#[derive(Debug, Clone, Default)]
pub struct Catalog {
    messages: HashMap<String, String>,
}

impl Catalog {
    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            messages: serde_json::from_str(raw)?,
        })
    }

    /// Built-in English catalog.
    pub fn english() -> Self {
        match Self::from_json(EN) {
            Ok(catalog) => catalog,
            Err(e) => {
                tracing::error!(error = %e, "Bundled English catalog is invalid");
                Self::default()
            }
        }
    }

    /// Layer `other` on top of this catalog; its entries win.
    pub fn merge(mut self, other: Catalog) -> Self {
        self.messages.extend(other.messages);
        self
    }
}

impl Translator for Catalog {
    fn translate(&self, key: &str, params: &[(&str, String)]) -> String {
        let Some(template) = self.messages.get(key) else {
            return key.to_string();
        };
        params
            .iter()
            .fold(template.clone(), |text, (name, value)| {
                text.replace(&format!("{{{{{name}}}}}"), value)
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interpolates_params() {
        let catalog = Catalog::english();
        let text = catalog.translate(
            "system.reload.retryDescription",
            &[
                ("seconds", "2".to_string()),
                ("attempt", "2".to_string()),
                ("maxRetries", "3".to_string()),
            ],
        );
        assert_eq!(text, "Retrying in 2s (attempt 2 of 3)");
    }

    #[test]
    fn unknown_key_falls_back_to_key() {
        assert_eq!(Catalog::english().t("no.such.key"), "no.such.key");
    }

    #[test]
    fn merged_catalog_overrides_entries() {
        let pt = Catalog::from_json(r#"{"error.boundary.retry": "Tentar novamente"}"#).unwrap();
        let catalog = Catalog::english().merge(pt);
        assert_eq!(catalog.t("error.boundary.retry"), "Tentar novamente");
        assert_eq!(catalog.t("error.boundary.home"), "Go home");
    }
}
