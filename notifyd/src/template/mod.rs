//! Template lookup, rendering and seeding.

mod seed;
mod store;

use std::path::PathBuf;

pub use seed::{SeedReport, TemplateSeeder};
pub use store::{RenderedContent, TemplateStore};

/// Topic used for verification-code messages.
pub const VERIFY_TOPIC: &str = "VERIFY";

#[derive(Debug, Clone)]
pub struct TemplateConfig {
    /// Root of the `<kind>@<lang>/<topic>[.<channel>]` tree.
    pub template_dir: PathBuf,
    pub default_lang: String,
    /// Injected as `brand` into message payloads that lack one.
    pub brand: String,
    /// Upper-case topics whose rows are replaced from disk on every seed.
    pub force_init_topics: Vec<String>,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        Self {
            template_dir: PathBuf::from("templates"),
            default_lang: "en".to_string(),
            brand: "Cloud".to_string(),
            force_init_topics: vec![VERIFY_TOPIC.to_string()],
        }
    }
}
