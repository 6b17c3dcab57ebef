//! Just enough of the STAC catalog envelope to satisfy result chaining:
//! item references and `prev`/`next` paging links. Full STAC/GeoJSON
//! serialization is a worker concern, not the orchestrator's.

use serde::{Deserialize, Serialize};

pub const STAC_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StacLink {
    pub rel: String,
    pub href: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StacCatalog {
    pub stac_version: String,
    pub id: String,
    #[serde(default)]
    pub links: Vec<StacLink>,
    /// Item hrefs this catalog aggregates, in encounter order.
    #[serde(default)]
    pub item_hrefs: Vec<String>,
}

impl StacCatalog {
    pub fn new(id: impl Into<String>, item_hrefs: Vec<String>) -> Self {
        Self {
            stac_version: STAC_VERSION.to_string(),
            id: id.into(),
            links: Vec::new(),
            item_hrefs,
        }
    }

    pub fn with_prev(mut self, href: impl Into<String>) -> Self {
        self.links.push(StacLink {
            rel: "prev".to_string(),
            href: href.into(),
        });
        self
    }

    pub fn with_next(mut self, href: impl Into<String>) -> Self {
        self.links.push(StacLink {
            rel: "next".to_string(),
            href: href.into(),
        });
        self
    }
}

/// Splits `item_hrefs` into a linked sequence of catalogs of at most
/// `page_size` items each, writing catalog N's object-store key as
/// `{base_key}/page-N.json`. Returns the keys in page order; page 0 is the
/// head catalog a new WorkItem should reference.
pub fn paginate(job_id_prefix: &str, item_hrefs: &[String], page_size: usize) -> Vec<(String, StacCatalog)> {
    if item_hrefs.len() <= page_size {
        let key = format!("{job_id_prefix}/aggregate.json");
        return vec![(key.clone(), StacCatalog::new(key, item_hrefs.to_vec()))];
    }

    let chunks: Vec<&[String]> = item_hrefs.chunks(page_size).collect();
    let keys: Vec<String> = (0..chunks.len())
        .map(|i| format!("{job_id_prefix}/aggregate-page-{i}.json"))
        .collect();

    chunks
        .iter()
        .enumerate()
        .map(|(i, chunk)| {
            let mut catalog = StacCatalog::new(keys[i].clone(), chunk.to_vec());
            if i > 0 {
                catalog = catalog.with_prev(keys[i - 1].clone());
            }
            if i + 1 < keys.len() {
                catalog = catalog.with_next(keys[i + 1].clone());
            }
            (keys[i].clone(), catalog)
        })
        .collect()
}
