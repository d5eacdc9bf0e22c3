//! URL universe: every page of the site a run considers for submission.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use siteindex_core::{property_slug, slugify, PropertyListing};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "siteindex-catalog";

pub const SITE_LAYOUT_FILE: &str = "site.yaml";

const DEFAULT_PROPERTY_ROUTES: &[&str] = &[
    "houses-for-sale",
    "houses-for-rent",
    "apartments-for-sale",
    "apartments-for-rent",
    "2-bedroom-houses-for-rent",
    "2-bedroom-houses-for-sale",
    "3-bedroom-houses-for-rent",
    "3-bedroom-houses-for-sale",
    "4-bedroom-houses-for-rent",
    "4-bedroom-houses-for-sale",
    "5-bedroom-houses-for-rent",
    "5-bedroom-houses-for-sale",
    "bedsitters-for-rent",
    "bungalows-for-rent",
    "bungalows-for-sale",
    "commercial-properties-for-rent",
    "commercial-properties-for-sale",
    "container-houses-for-sale",
    "land-for-sale",
    "maisonettes-for-rent",
    "maisonettes-for-sale",
    "office-space-for-rent",
    "serviced-apartments-for-rent",
    "shops-for-rent",
    "shops-for-sale",
    "studio-apartments-for-rent",
    "studio-apartments-for-sale",
    "townhouses-for-rent",
    "townhouses-for-sale",
    "villas-for-rent",
    "villas-for-sale",
    "warehouses-for-rent",
    "warehouses-for-sale",
];

/// Where the site keeps its routes and content, plus the fixed route lists.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SiteLayout {
    pub app_dir: PathBuf,
    pub blog_dir: PathBuf,
    pub jobs_file: PathBuf,
    pub jobs_index_path: String,
    pub jobs_path_prefix: String,
    pub property_path_prefix: String,
    pub business_path_prefix: String,
    pub blog_path_prefix: String,
    pub property_routes: Vec<String>,
    pub sitemaps: Vec<String>,
}

impl Default for SiteLayout {
    fn default() -> Self {
        Self {
            app_dir: PathBuf::from("src/app"),
            blog_dir: PathBuf::from("src/content/blog"),
            jobs_file: PathBuf::from("local-jobs.json"),
            jobs_index_path: "/jobs-in-kenya".to_string(),
            jobs_path_prefix: "/jobs-in-kenya".to_string(),
            property_path_prefix: "/properties".to_string(),
            business_path_prefix: "/business".to_string(),
            blog_path_prefix: "/blog".to_string(),
            property_routes: DEFAULT_PROPERTY_ROUTES.iter().map(|r| r.to_string()).collect(),
            sitemaps: vec!["/sitemap.xml".to_string(), "/jobs-sitemap.xml".to_string()],
        }
    }
}

impl SiteLayout {
    /// `site.yaml` under `workspace_root`, or the defaults when there is none.
    pub fn load_or_default(workspace_root: &Path) -> Result<Self> {
        let path = workspace_root.join(SITE_LAYOUT_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text =
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

const PAGE_FILES: &[&str] = &["page.tsx", "page.ts", "page.jsx", "page.js"];

fn has_page(dir: &Path) -> bool {
    PAGE_FILES.iter().any(|name| dir.join(name).is_file())
}

fn is_route_group(name: &str) -> bool {
    name.starts_with('(') && name.ends_with(')')
}

fn is_skipped_segment(name: &str) -> bool {
    name.starts_with('_')
        || name.starts_with('.')
        || name == "api"
        || name == "components"
        || name.contains('[')
        || name.contains(']')
}

/// Static page routes under an app-router directory, sorted. Dynamic (`[param]`), private
/// (`_x`), hidden, `api` and `components` directories are skipped; `(group)` directories do
/// not contribute a path segment.
pub fn discover_static_routes(app_dir: &Path) -> Vec<String> {
    let mut routes = Vec::new();
    if has_page(app_dir) {
        routes.push("/".to_string());
    }
    scan_route_dir(app_dir, &mut Vec::new(), &mut routes);
    routes.sort();
    routes.dedup();
    routes
}

fn scan_route_dir(dir: &Path, segments: &mut Vec<String>, routes: &mut Vec<String>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            warn!(dir = %dir.display(), error = %err, "could not scan route directory");
            return;
        }
    };

    for entry in entries.filter_map(|entry| entry.ok()) {
        if !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if is_skipped_segment(&name) {
            continue;
        }

        let pushed = !is_route_group(&name);
        if pushed {
            segments.push(name);
        }
        let path = entry.path();
        if has_page(&path) {
            routes.push(if segments.is_empty() {
                "/".to_string()
            } else {
                format!("/{}", segments.join("/"))
            });
        }
        scan_route_dir(&path, segments, routes);
        if pushed {
            segments.pop();
        }
    }
}

/// Markdown post slugs in `blog_dir`, sorted. A missing directory yields none.
pub fn discover_blog_slugs(blog_dir: &Path) -> Result<Vec<String>> {
    if !blog_dir.exists() {
        return Ok(Vec::new());
    }
    let mut slugs = fs::read_dir(blog_dir)
        .with_context(|| format!("reading {}", blog_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            name.strip_suffix(".md").map(str::to_string)
        })
        .collect::<Vec<_>>();
    slugs.sort();
    Ok(slugs)
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobEntry {
    pub job_title: String,
}

#[derive(Debug, Clone, Deserialize)]
struct JobsFile {
    #[serde(default)]
    jobs: Vec<JobEntry>,
}

pub fn load_jobs(path: &Path) -> Result<Vec<JobEntry>> {
    let file: JobsFile = read_json_file(path)?;
    Ok(file.jobs)
}

fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Read-only view of the live listings catalog.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    fn name(&self) -> &str;
    async fn approved_properties(&self) -> Result<Vec<PropertyListing>>;
    /// Identifiers of approved businesses.
    async fn approved_businesses(&self) -> Result<Vec<String>>;
    /// Slugs of active locations.
    async fn active_locations(&self) -> Result<Vec<String>>;
}

/// Catalog backed by the site's Postgres database.
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn connect_lazy(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(15))
            .connect_lazy(database_url)
            .context("parsing DATABASE_URL")?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl CatalogSource for PgCatalog {
    fn name(&self) -> &str {
        "postgres"
    }

    async fn approved_properties(&self) -> Result<Vec<PropertyListing>> {
        let rows = sqlx::query(
            "SELECT property_title, property_type, city, bedrooms::bigint AS bedrooms, price_type \
             FROM property_listings WHERE is_approved = true",
        )
        .fetch_all(&self.pool)
        .await
        .context("querying approved property listings")?;

        rows.iter()
            .map(|row| -> Result<PropertyListing, sqlx::Error> {
                Ok(PropertyListing {
                    property_title: row
                        .try_get::<Option<String>, _>("property_title")?
                        .unwrap_or_default(),
                    property_type: row
                        .try_get::<Option<String>, _>("property_type")?
                        .unwrap_or_default(),
                    city: row.try_get::<Option<String>, _>("city")?.unwrap_or_default(),
                    bedrooms: row.try_get("bedrooms")?,
                    price_type: row.try_get("price_type")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .context("decoding property listing rows")
    }

    async fn approved_businesses(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT id::text AS id FROM business_listings WHERE is_approved = true",
        )
        .fetch_all(&self.pool)
        .await
        .context("querying approved business listings")?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("id"))
            .collect::<Result<Vec<_>, _>>()
            .context("decoding business rows")
    }

    async fn active_locations(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT slug FROM locations WHERE is_active = true AND slug IS NOT NULL",
        )
        .fetch_all(&self.pool)
        .await
        .context("querying active locations")?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("slug"))
            .collect::<Result<Vec<_>, _>>()
            .context("decoding location rows")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
struct CatalogSnapshotFile {
    #[serde(default)]
    properties: Vec<PropertyListing>,
    #[serde(default)]
    businesses: Vec<String>,
    #[serde(default)]
    locations: Vec<String>,
}

/// Catalog exported to a JSON file, for offline runs.
#[derive(Debug, Clone)]
pub struct SnapshotCatalog {
    path: PathBuf,
}

impl SnapshotCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn read(&self) -> Result<CatalogSnapshotFile> {
        read_json_file(&self.path)
    }
}

#[async_trait]
impl CatalogSource for SnapshotCatalog {
    fn name(&self) -> &str {
        "snapshot"
    }

    async fn approved_properties(&self) -> Result<Vec<PropertyListing>> {
        Ok(self.read()?.properties)
    }

    async fn approved_businesses(&self) -> Result<Vec<String>> {
        Ok(self.read()?.businesses)
    }

    async fn active_locations(&self) -> Result<Vec<String>> {
        Ok(self.read()?.locations)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Universe {
    pub urls: Vec<String>,
    pub section_counts: BTreeMap<&'static str, usize>,
    pub skipped_sections: Vec<&'static str>,
    pub duplicates_removed: usize,
}

pub struct UniverseGenerator {
    base_url: String,
    workspace_root: PathBuf,
    layout: SiteLayout,
    catalog: Option<Box<dyn CatalogSource>>,
}

impl UniverseGenerator {
    pub fn new(
        base_url: impl Into<String>,
        workspace_root: impl Into<PathBuf>,
        layout: SiteLayout,
        catalog: Option<Box<dyn CatalogSource>>,
    ) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            workspace_root: workspace_root.into(),
            layout,
            catalog,
        }
    }

    pub fn layout(&self) -> &SiteLayout {
        &self.layout
    }

    pub fn url_for(&self, path: &str) -> String {
        let path = path.trim_matches('/');
        if path.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.workspace_root.join(path)
    }

    /// Collect every section. A section whose source fails is logged and left out.
    pub async fn generate(&self) -> Universe {
        let mut sections: Vec<(&'static str, Result<Vec<String>>)> = Vec::new();

        sections.push(("static", Ok(self.static_urls())));
        sections.push(("jobs", self.job_urls()));

        match &self.catalog {
            Some(catalog) => {
                sections.push(("properties", self.property_urls(catalog.as_ref()).await));
                sections.push(("businesses", self.business_urls(catalog.as_ref()).await));
                sections.push(("locations", self.location_urls(catalog.as_ref()).await));
            }
            None => {
                warn!("no catalog configured; property, business and location pages skipped");
            }
        }

        sections.push(("blog", self.blog_urls()));
        sections.push((
            "sitemaps",
            Ok(self.layout.sitemaps.iter().map(|p| self.url_for(p)).collect()),
        ));

        let mut universe = Universe::default();
        let mut seen = HashSet::new();
        for (section, result) in sections {
            match result {
                Ok(urls) => {
                    info!(section, count = urls.len(), "collected urls");
                    universe.section_counts.insert(section, urls.len());
                    for url in urls {
                        if seen.insert(url.clone()) {
                            universe.urls.push(url);
                        } else {
                            universe.duplicates_removed += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(section, error = %format!("{err:#}"), "url source failed; section omitted");
                    universe.skipped_sections.push(section);
                }
            }
        }
        universe
    }

    fn static_urls(&self) -> Vec<String> {
        discover_static_routes(&self.resolve(&self.layout.app_dir))
            .iter()
            .map(|route| self.url_for(route))
            .collect()
    }

    fn job_urls(&self) -> Result<Vec<String>> {
        let jobs = load_jobs(&self.resolve(&self.layout.jobs_file))?;
        let mut urls = vec![self.url_for(&self.layout.jobs_index_path)];
        urls.extend(jobs.iter().map(|job| {
            self.url_for(&format!(
                "{}/{}",
                self.layout.jobs_path_prefix.trim_end_matches('/'),
                slugify(&job.job_title)
            ))
        }));
        Ok(urls)
    }

    async fn property_urls(&self, catalog: &dyn CatalogSource) -> Result<Vec<String>> {
        let listings = catalog.approved_properties().await?;
        Ok(listings
            .iter()
            .map(|listing| {
                self.url_for(&format!(
                    "{}/{}",
                    self.layout.property_path_prefix.trim_end_matches('/'),
                    property_slug(listing)
                ))
            })
            .collect())
    }

    async fn business_urls(&self, catalog: &dyn CatalogSource) -> Result<Vec<String>> {
        let ids = catalog.approved_businesses().await?;
        Ok(ids
            .iter()
            .map(|id| {
                self.url_for(&format!(
                    "{}/{}",
                    self.layout.business_path_prefix.trim_end_matches('/'),
                    id
                ))
            })
            .collect())
    }

    async fn location_urls(&self, catalog: &dyn CatalogSource) -> Result<Vec<String>> {
        let locations = catalog.active_locations().await?;
        let mut urls = Vec::with_capacity(locations.len() * self.layout.property_routes.len());
        for location in &locations {
            for route in &self.layout.property_routes {
                urls.push(self.url_for(&format!("{}/{}", route.trim_matches('/'), location)));
            }
        }
        Ok(urls)
    }

    fn blog_urls(&self) -> Result<Vec<String>> {
        let slugs = discover_blog_slugs(&self.resolve(&self.layout.blog_dir))?;
        Ok(slugs
            .iter()
            .map(|slug| {
                self.url_for(&format!(
                    "{}/{}",
                    self.layout.blog_path_prefix.trim_end_matches('/'),
                    slug
                ))
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    struct FakeCatalog {
        fail_properties: bool,
    }

    #[async_trait]
    impl CatalogSource for FakeCatalog {
        fn name(&self) -> &str {
            "fake"
        }

        async fn approved_properties(&self) -> Result<Vec<PropertyListing>> {
            if self.fail_properties {
                anyhow::bail!("connection refused");
            }
            Ok(vec![PropertyListing {
                property_title: "Modern Villa with Pool".into(),
                property_type: "Villa".into(),
                city: "Mombasa".into(),
                bedrooms: Some(4),
                price_type: Some("sale".into()),
            }])
        }

        async fn approved_businesses(&self) -> Result<Vec<String>> {
            Ok(vec!["42".into()])
        }

        async fn active_locations(&self) -> Result<Vec<String>> {
            Ok(vec!["westlands".into(), "kilimani".into()])
        }
    }

    fn seed_site(root: &Path) {
        touch(root, "src/app/page.tsx");
        touch(root, "src/app/about/page.tsx");
        touch(root, "src/app/api/indexnow/page.ts");
        touch(root, "src/app/[city]/page.tsx");
        touch(root, "src/app/_drafts/page.tsx");
        touch(root, "src/app/components/page.tsx");
        touch(root, "src/app/(marketing)/pricing/page.tsx");
        touch(root, "src/app/blog/archive/page.tsx");
        touch(root, "src/app/blog/layout.tsx");
        touch(root, "src/content/blog/first-home.md");
        touch(root, "src/content/blog/notes.txt");
        fs::write(
            root.join("local-jobs.json"),
            r#"{"jobs":[{"job_title":"Data Analyst"},{"job_title":"Nurse (ICU)"}]}"#,
        )
        .unwrap();
    }

    #[test]
    fn static_routes_skip_dynamic_private_and_api_directories() {
        let dir = tempdir().unwrap();
        seed_site(dir.path());
        let routes = discover_static_routes(&dir.path().join("src/app"));
        assert_eq!(routes, vec!["/", "/about", "/blog/archive", "/pricing"]);
    }

    #[test]
    fn default_layout_has_all_location_routes() {
        let layout = SiteLayout::default();
        assert_eq!(layout.property_routes.len(), 33);
        assert_eq!(layout.sitemaps.len(), 2);
    }

    #[test]
    fn site_yaml_overrides_defaults() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join(SITE_LAYOUT_FILE),
            "property_routes:\n  - land-for-sale\nsitemaps: []\n",
        )
        .unwrap();
        let layout = SiteLayout::load_or_default(dir.path()).unwrap();
        assert_eq!(layout.property_routes, vec!["land-for-sale"]);
        assert!(layout.sitemaps.is_empty());
        assert_eq!(layout.jobs_index_path, "/jobs-in-kenya");

        fs::write(dir.path().join(SITE_LAYOUT_FILE), "property_routes: 7\n").unwrap();
        assert!(SiteLayout::load_or_default(dir.path()).is_err());
    }

    #[tokio::test]
    async fn universe_combines_every_section() {
        let dir = tempdir().unwrap();
        seed_site(dir.path());
        let generator = UniverseGenerator::new(
            "https://newkenyan.com/",
            dir.path(),
            SiteLayout::default(),
            Some(Box::new(FakeCatalog {
                fail_properties: false,
            })),
        );

        let universe = generator.generate().await;
        let urls = &universe.urls;
        assert!(urls.contains(&"https://newkenyan.com".to_string()));
        assert!(urls.contains(&"https://newkenyan.com/jobs-in-kenya".to_string()));
        assert!(urls.contains(&"https://newkenyan.com/jobs-in-kenya/nurse-icu".to_string()));
        assert!(urls.contains(
            &"https://newkenyan.com/properties/4-bedroom-villa-mombasa-villa-with-pool".to_string()
        ));
        assert!(urls.contains(&"https://newkenyan.com/business/42".to_string()));
        assert!(urls.contains(&"https://newkenyan.com/villas-for-rent/kilimani".to_string()));
        assert!(urls.contains(&"https://newkenyan.com/blog/first-home".to_string()));
        assert!(urls.contains(&"https://newkenyan.com/jobs-sitemap.xml".to_string()));

        assert_eq!(universe.section_counts["locations"], 66);
        assert_eq!(universe.section_counts["jobs"], 3);
        assert_eq!(universe.section_counts["blog"], 1);
        assert!(universe.skipped_sections.is_empty());
        assert_eq!(urls.len(), 4 + 3 + 1 + 1 + 66 + 1 + 2);
    }

    #[tokio::test]
    async fn failing_source_is_omitted_without_aborting() {
        let dir = tempdir().unwrap();
        seed_site(dir.path());
        fs::remove_file(dir.path().join("local-jobs.json")).unwrap();
        let generator = UniverseGenerator::new(
            "https://newkenyan.com",
            dir.path(),
            SiteLayout::default(),
            Some(Box::new(FakeCatalog {
                fail_properties: true,
            })),
        );

        let universe = generator.generate().await;
        assert_eq!(universe.skipped_sections, vec!["jobs", "properties"]);
        assert_eq!(universe.section_counts["businesses"], 1);
        assert!(!universe.urls.iter().any(|u| u.contains("/properties/")));
        assert!(!universe.urls.iter().any(|u| u.contains("/jobs-in-kenya")));
    }

    #[tokio::test]
    async fn duplicate_urls_are_dropped_in_first_seen_order() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "src/app/jobs-in-kenya/page.tsx");
        fs::write(dir.path().join("local-jobs.json"), r#"{"jobs":[]}"#).unwrap();
        let generator =
            UniverseGenerator::new("https://newkenyan.com", dir.path(), SiteLayout::default(), None);

        let universe = generator.generate().await;
        assert_eq!(universe.duplicates_removed, 1);
        assert_eq!(universe.urls[0], "https://newkenyan.com/jobs-in-kenya");
        assert_eq!(
            universe
                .urls
                .iter()
                .filter(|u| u.as_str() == "https://newkenyan.com/jobs-in-kenya")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn snapshot_catalog_reads_json_export() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        fs::write(
            &path,
            r#"{"properties":[{"property_title":"Cozy Bedsitter","property_type":"Bedsitter","city":"Kasarani"}],"locations":["kasarani"]}"#,
        )
        .unwrap();
        let catalog = SnapshotCatalog::new(&path);
        let properties = catalog.approved_properties().await.unwrap();
        assert_eq!(properties[0].bedrooms, None);
        assert!(catalog.approved_businesses().await.unwrap().is_empty());
        assert_eq!(catalog.active_locations().await.unwrap(), vec!["kasarani"]);
    }
}
