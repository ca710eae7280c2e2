//! Read-only station catalog.
//!
//! The session controller only ever sees a catalog through [`CatalogAccessor`];
//! editing and persisting categories is somebody else's job.  [`Catalog`] is the
//! in-memory implementation, built from a TOML file, an m3u list, or the
//! embedded default catalog.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{info, warn};

use crate::config::CatalogConfig;
use crate::protocol::{Category, Station};

const DEFAULT_CATALOG: &str = include_str!("../assets/default_catalog.toml");

/// Short name given to the single category built from an m3u list.
pub const M3U_CATEGORY: &str = "RADIO";

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid catalog TOML: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },
    #[error("catalog has no categories")]
    Empty,
}

/// Pull-only view over categories and their ordered station lists.
pub trait CatalogAccessor: Send + Sync {
    fn categories(&self) -> &[Category];

    fn category(&self, id: &str) -> Option<&Category> {
        self.categories().iter().find(|c| c.id == id)
    }

    /// Stations of a category in navigation order; empty for unknown ids.
    fn stations(&self, category_id: &str) -> &[Station] {
        self.category(category_id)
            .map(|c| c.stations.as_slice())
            .unwrap_or(&[])
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Catalog {
    categories: Vec<Category>,
}

impl CatalogAccessor for Catalog {
    fn categories(&self) -> &[Category] {
        &self.categories
    }
}

impl Catalog {
    /// Build a catalog, filling in missing ids and normalising short names.
    pub fn new(mut categories: Vec<Category>) -> Self {
        let mut category_ids = HashSet::new();
        for category in &mut categories {
            category.short_name = category.short_name.trim().to_uppercase();
            if category.short_name.is_empty() {
                category.short_name = category.name.to_uppercase();
            }
            let base = non_empty(&category.id).unwrap_or_else(|| slugify(&category.name));
            category.id = unique_id(base, &mut category_ids);

            let mut station_ids = HashSet::new();
            for station in &mut category.stations {
                let base = non_empty(&station.id).unwrap_or_else(|| slugify(&station.name));
                station.id = unique_id(base, &mut station_ids);
            }
        }
        Self { categories }
    }

    pub const fn empty() -> Self {
        Self {
            categories: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    /// The catalog shipped with the daemon.
    pub fn builtin() -> Self {
        match parse_catalog_toml(DEFAULT_CATALOG) {
            Ok(catalog) => catalog,
            Err(e) => {
                warn!("embedded catalog is invalid: {}", e);
                Self::default()
            }
        }
    }

    /// Find a station by id, anywhere in the catalog.
    pub fn find_station(&self, station_id: &str) -> Option<(&Category, &Station)> {
        self.categories.iter().find_map(|c| {
            c.stations
                .iter()
                .find(|s| s.id == station_id)
                .map(|s| (c, s))
        })
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// Lowercase ASCII slug: "BBC Radio 4" -> "bbc-radio-4".
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
        } else if !slug.ends_with('-') && !slug.is_empty() {
            slug.push('-');
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    if slug.is_empty() {
        "item".to_string()
    } else {
        slug
    }
}

fn unique_id(base: String, taken: &mut HashSet<String>) -> String {
    if taken.insert(base.clone()) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}-{}", base, n);
        if taken.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

// ── TOML catalog ──────────────────────────────────────────────────────────────

/// File schema: `[[category]]` tables with nested `[[category.station]]`.
/// Kept apart from the wire structs so the file format can drift.
#[derive(Debug, Deserialize)]
struct TomlCatalogFile {
    #[serde(default)]
    category: Vec<TomlCategory>,
}

#[derive(Debug, Deserialize)]
struct TomlCategory {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    short_name: String,
    #[serde(default)]
    icon: String,
    #[serde(default)]
    station: Vec<TomlStation>,
}

#[derive(Debug, Deserialize)]
struct TomlStation {
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    stream_url: String,
    website_url: Option<String>,
    logo_url: Option<String>,
    location: Option<String>,
}

pub fn parse_catalog_toml(content: &str) -> Result<Catalog, CatalogError> {
    let file: TomlCatalogFile = toml::from_str(content)?;
    let categories = file
        .category
        .into_iter()
        .map(|c| Category {
            id: c.id,
            name: c.name,
            short_name: c.short_name,
            icon: c.icon,
            stations: c
                .station
                .into_iter()
                .map(|s| Station {
                    id: s.id,
                    name: s.name,
                    description: s.description,
                    stream_url: s.stream_url,
                    website_url: s.website_url,
                    logo_url: s.logo_url,
                    location: s.location,
                })
                .collect(),
        })
        .collect();
    Ok(Catalog::new(categories))
}

pub fn load_catalog_toml(path: &Path) -> Result<Catalog, CatalogError> {
    let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_catalog_toml(&content)
}

// ── m3u ───────────────────────────────────────────────────────────────────────

/// Parse an extended m3u list into stations, using `#EXTINF` titles as names.
pub fn parse_m3u_stations(content: &str) -> Vec<Station> {
    let mut stations = Vec::new();
    let mut pending_name: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            if let Some(comma_idx) = rest.find(',') {
                pending_name = Some(rest[comma_idx + 1..].trim().to_string());
            }
            continue;
        }

        if line.starts_with('#') {
            continue;
        }

        let url = line.to_string();
        let name = pending_name.take().unwrap_or_else(|| url.clone());
        stations.push(Station {
            name,
            stream_url: url,
            ..Station::default()
        });
    }

    stations
}

/// Wrap an m3u list into a one-category catalog.
pub fn catalog_from_m3u(content: &str) -> Catalog {
    let stations = parse_m3u_stations(content);
    if stations.is_empty() {
        return Catalog::default();
    }
    Catalog::new(vec![Category {
        id: String::new(),
        name: "Radio".to_string(),
        short_name: M3U_CATEGORY.to_string(),
        icon: "radio".to_string(),
        stations,
    }])
}

async fn fetch_m3u(url: &str) -> Result<Catalog, CatalogError> {
    let fetch_err = |reason: String| CatalogError::Fetch {
        url: url.to_string(),
        reason,
    };
    let response = reqwest::get(url).await.map_err(|e| fetch_err(e.to_string()))?;
    if !response.status().is_success() {
        return Err(fetch_err(format!("HTTP {}", response.status())));
    }
    let text = response.text().await.map_err(|e| fetch_err(e.to_string()))?;
    Ok(catalog_from_m3u(&text))
}

async fn load_m3u_source(source: &str) -> Result<Catalog, CatalogError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        fetch_m3u(source).await
    } else {
        let content = std::fs::read_to_string(source).map_err(|e| CatalogError::Io {
            path: PathBuf::from(source),
            source: e,
        })?;
        Ok(catalog_from_m3u(&content))
    }
}

// ── loader cascade ────────────────────────────────────────────────────────────

/// Resolve the catalog from the first source that yields categories:
/// configured TOML, `catalog.toml` beside the executable, `catalog.toml` in the
/// working directory, the m3u source, then the embedded default.
pub async fn load_catalog(config: &CatalogConfig) -> Catalog {
    let mut toml_candidates = vec![config.catalog_toml.clone()];
    if let Some(p) = crate::platform::beside_exe("catalog.toml") {
        toml_candidates.push(p);
    }
    toml_candidates.push(PathBuf::from("catalog.toml"));

    for path in toml_candidates.iter().filter(|p| p.exists()) {
        match load_catalog_toml(path) {
            Ok(c) if !c.is_empty() => {
                info!(
                    "Loaded {} categories from TOML: {}",
                    c.categories().len(),
                    path.display()
                );
                return c;
            }
            Ok(_) => warn!("Catalog {} has no categories, skipping", path.display()),
            Err(e) => warn!("Failed to load catalog {}: {}", path.display(), e),
        }
    }

    let source = config.m3u_url.trim();
    if !source.is_empty() {
        info!("Loading stations from m3u: {}", source);
        match load_m3u_source(source).await {
            Ok(c) if !c.is_empty() => {
                info!("Loaded {} stations from m3u", c.stations(&c.categories()[0].id).len());
                return c;
            }
            Ok(_) => warn!("m3u source {} has no stations", source),
            Err(e) => warn!("Failed to load m3u source: {}", e),
        }
    }

    info!("Using built-in catalog");
    Catalog::builtin()
}
