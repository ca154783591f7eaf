use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::error::{Error, Result};

/// Stable short identifier of a hub; for Habr this is the URL slug.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HubId(String);

impl HubId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for HubId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for HubId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hub {
    pub id: HubId,
    pub display_name: String,
}

impl Hub {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: HubId::new(id),
            display_name: display_name.into(),
        }
    }
}

/// Hubs known to the site, in display order.
const HABR_HUBS: &[(&str, &str)] = &[
    ("devops", "DevOps"),
    ("it-infrastructure", "IT-инфраструктура"),
    ("linux", "Linux"),
    ("python", "Python"),
    ("analysis_design", "Анализ и проектирование систем"),
    ("infosecurity", "Информационная безопасность"),
    ("artificial_intelligence", "Искусственный интеллект"),
    ("machine_learning", "Машинное обучение"),
    ("popular_science", "Научно-популярное"),
    ("programming", "Программирование"),
    ("network_technologies", "Сетевые технологии"),
    ("sys_admin", "Системное администрирование"),
];

/// Fixed set of valid hubs, built once at startup.
#[derive(Debug, Clone)]
pub struct HubCatalog {
    hubs: Vec<Hub>,
}

impl HubCatalog {
    /// Builds a catalog, rejecting an empty list and duplicate ids.
    pub fn new(hubs: Vec<Hub>) -> Result<Self> {
        if hubs.is_empty() {
            return Err(Error::InvalidCatalog("catalog has no hubs".into()));
        }
        let mut seen = BTreeSet::new();
        for hub in &hubs {
            if hub.id.as_str().trim().is_empty() {
                return Err(Error::InvalidCatalog("hub id must not be empty".into()));
            }
            if !seen.insert(&hub.id) {
                return Err(Error::InvalidCatalog(format!("duplicate hub id '{}'", hub.id)));
            }
        }
        Ok(Self { hubs })
    }

    /// The twelve Habr hubs the bot was built around.
    pub fn habr() -> Self {
        Self {
            hubs: HABR_HUBS.iter().map(|(id, name)| Hub::new(*id, *name)).collect(),
        }
    }

    /// Catalog from the `[[hubs]]` config section; the Habr default when the section is absent.
    pub fn from_config(entries: &[common::HubConfig]) -> Result<Self> {
        if entries.is_empty() {
            return Ok(Self::habr());
        }
        Self::new(
            entries
                .iter()
                .map(|e| Hub::new(e.id.clone(), e.display_name.clone()))
                .collect(),
        )
    }

    pub fn get(&self, id: &HubId) -> Option<&Hub> {
        self.hubs.iter().find(|h| &h.id == id)
    }

    pub fn contains(&self, id: &HubId) -> bool {
        self.get(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Hub> {
        self.hubs.iter()
    }

    pub fn len(&self) -> usize {
        self.hubs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hubs.is_empty()
    }

    pub fn ids(&self) -> BTreeSet<HubId> {
        self.hubs.iter().map(|h| h.id.clone()).collect()
    }

    /// `selection \ catalog`
    pub fn unknown(&self, selection: &BTreeSet<HubId>) -> BTreeSet<HubId> {
        selection.difference(&self.ids()).cloned().collect()
    }

    pub fn validate(&self, selection: &BTreeSet<HubId>) -> Result<()> {
        let unknown = self.unknown(selection);
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(Error::InvalidHub(unknown.into_iter().collect()))
        }
    }

    /// Display name for `id`, falling back to the id itself.
    pub fn display_name<'a>(&'a self, id: &'a HubId) -> &'a str {
        self.get(id).map(|h| h.display_name.as_str()).unwrap_or(id.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> BTreeSet<HubId> {
        ids.iter().map(|id| HubId::from(*id)).collect()
    }

    #[test]
    fn habr_catalog_has_twelve_unique_hubs() {
        let catalog = HubCatalog::habr();
        assert_eq!(catalog.len(), 12);
        assert_eq!(catalog.ids().len(), 12);
        assert_eq!(catalog.display_name(&"linux".into()), "Linux");
    }

    #[test]
    fn unknown_is_set_difference() {
        let catalog = HubCatalog::habr();
        let unknown = catalog.unknown(&set(&["linux", "rust", "golang"]));
        assert_eq!(unknown, set(&["golang", "rust"]));
    }

    #[test]
    fn validate_reports_every_unknown_hub() {
        let catalog = HubCatalog::habr();
        assert!(catalog.validate(&set(&["linux", "python"])).is_ok());
        assert!(catalog.validate(&BTreeSet::new()).is_ok());
        match catalog.validate(&set(&["linux", "rust"])) {
            Err(Error::InvalidHub(ids)) => assert_eq!(ids, vec![HubId::from("rust")]),
            other => panic!("expected InvalidHub, got {:?}", other),
        }
    }

    #[test]
    fn rejects_duplicate_and_empty_catalogs() {
        assert!(matches!(HubCatalog::new(vec![]), Err(Error::InvalidCatalog(_))));
        let dup = vec![Hub::new("linux", "Linux"), Hub::new("linux", "Linux again")];
        assert!(matches!(HubCatalog::new(dup), Err(Error::InvalidCatalog(_))));
    }

    #[test]
    fn config_entries_replace_default_catalog() {
        let entries = vec![common::HubConfig {
            id: "rust".into(),
            display_name: "Rust".into(),
        }];
        let catalog = HubCatalog::from_config(&entries).unwrap();
        assert_eq!(catalog.ids(), set(&["rust"]));
        assert_eq!(HubCatalog::from_config(&[]).unwrap().len(), 12);
    }
}
