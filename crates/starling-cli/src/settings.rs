//! Runtime configuration and catalog loading.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Deserialize;
use starling_core::{SchemaCatalog, catalog::CatalogFile, healthcare};

/// Runtime configuration, deserialised from `starling.toml` and `STARLING_*`
/// environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
  #[serde(default = "default_store_path")]
  pub store_path:   PathBuf,
  /// TOML catalog to load instead of the built-in healthcare catalog.
  #[serde(default)]
  pub catalog_path: Option<PathBuf>,
}

fn default_store_path() -> PathBuf { PathBuf::from("starling.db") }

impl Settings {
  pub fn load(path: &Path) -> anyhow::Result<Self> {
    let settings = config::Config::builder()
      .add_source(config::File::from(path).required(false))
      .add_source(config::Environment::with_prefix("STARLING"))
      .build()
      .context("failed to read config file")?;

    let mut settings: Self = settings
      .try_deserialize()
      .context("failed to deserialise Settings")?;
    settings.store_path = expand_tilde(&settings.store_path);
    settings.catalog_path = settings.catalog_path.as_deref().map(expand_tilde);
    Ok(settings)
  }

  /// The configured catalog, registered and frozen.
  pub fn catalog(&self) -> anyhow::Result<SchemaCatalog> {
    let Some(path) = &self.catalog_path else {
      return healthcare::catalog().context("built-in catalog is invalid");
    };
    let raw = std::fs::read_to_string(path)
      .with_context(|| format!("reading catalog file {}", path.display()))?;
    let file: CatalogFile = toml::from_str(&raw).context("parsing catalog file")?;
    let mut catalog = SchemaCatalog::from_file(file)
      .with_context(|| format!("registering catalog from {}", path.display()))?;
    catalog.freeze();
    Ok(catalog)
  }
}

/// Expand a leading `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
  let s = path.to_string_lossy();
  if let Some(rest) = s.strip_prefix("~/")
    && let Ok(home) = std::env::var("HOME")
  {
    return PathBuf::from(home).join(rest);
  }
  path.to_path_buf()
}
