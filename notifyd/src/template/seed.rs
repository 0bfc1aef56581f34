//! Seeds template rows from the on-disk tree.
//!
//! Layout: `<template_dir>/<kind>@<lang>/<topic>[.<channel>]`, `kind` being
//! `title` or `content`. A file without a channel suffix applies to every
//! channel.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::TemplateConfig;
use crate::Result;
use crate::database::models::{ALL_CHANNELS, TemplateDbModel, TemplateKind};
use crate::database::repositories::TemplateRepository;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeedReport {
    pub created: usize,
    pub replaced_topics: usize,
    pub duplicates_removed: u64,
    pub langs_filled: u64,
}

/// One template file as parsed from the tree.
#[derive(Debug, Clone, PartialEq)]
struct TemplateFile {
    kind: TemplateKind,
    lang: String,
    topic: String,
    channel: String,
}

fn parse_dir_name(name: &str) -> Option<(TemplateKind, String)> {
    let (kind, lang) = name.split_once('@')?;
    let kind = match kind {
        "title" => TemplateKind::Title,
        "content" => TemplateKind::Content,
        _ => return None,
    };
    Some((kind, lang.to_string()))
}

fn parse_file_name(name: &str) -> (String, String) {
    match name.split_once('.') {
        Some((topic, channel)) if !channel.is_empty() => (topic.to_uppercase(), channel.to_string()),
        _ => (name.trim_end_matches('.').to_uppercase(), ALL_CHANNELS.to_string()),
    }
}

pub struct TemplateSeeder {
    repo: Arc<dyn TemplateRepository>,
    config: TemplateConfig,
}

impl TemplateSeeder {
    pub fn new(repo: Arc<dyn TemplateRepository>, config: TemplateConfig) -> Self {
        Self { repo, config }
    }

    async fn scan(dir: &Path) -> Result<Vec<(TemplateFile, String)>> {
        let mut found = Vec::new();
        let mut kinds = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(dir = %dir.display(), "Template directory does not exist");
                return Ok(found);
            }
            Err(e) => return Err(e.into()),
        };

        while let Some(kind_dir) = kinds.next_entry().await? {
            if !kind_dir.file_type().await?.is_dir() {
                continue;
            }
            let dir_name = kind_dir.file_name().to_string_lossy().into_owned();
            let Some((kind, lang)) = parse_dir_name(&dir_name) else {
                debug!(dir = %dir_name, "Skipping unrecognised template directory");
                continue;
            };

            let mut files = tokio::fs::read_dir(kind_dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                if !file.file_type().await?.is_file() {
                    continue;
                }
                let file_name = file.file_name().to_string_lossy().into_owned();
                if file_name.starts_with('.') {
                    continue;
                }
                let (topic, channel) = parse_file_name(&file_name);
                let content = tokio::fs::read_to_string(file.path()).await?;
                found.push((
                    TemplateFile {
                        kind,
                        lang: lang.clone(),
                        topic,
                        channel,
                    },
                    content,
                ));
            }
        }
        Ok(found)
    }

    /// Idempotent: rows of topics outside the force-init set are kept.
    pub async fn seed(&self) -> Result<SeedReport> {
        let mut report = SeedReport::default();

        for topic in &self.config.force_init_topics {
            if self.repo.delete_by_topic(topic).await? > 0 {
                report.replaced_topics += 1;
            }
        }

        for (file, content) in Self::scan(&self.config.template_dir).await? {
            if self
                .repo
                .exists(&file.channel, &file.topic, file.kind.as_str(), &file.lang)
                .await?
            {
                continue;
            }
            let row = TemplateDbModel::new(file.channel, &file.topic, file.kind, file.lang, content);
            self.repo.create_template(&row).await?;
            report.created += 1;
        }

        // Filling first lets the collapse see rows that only differed by a
        // missing lang.
        report.langs_filled = self.repo.fill_empty_lang(&self.config.default_lang).await?;
        report.duplicates_removed = self.repo.collapse_duplicates().await?;

        info!(
            created = report.created,
            replaced_topics = report.replaced_topics,
            duplicates_removed = report.duplicates_removed,
            langs_filled = report.langs_filled,
            "Template seeding complete"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::repositories::SqlxTemplateRepository;
    use crate::database::test_pool;

    #[test]
    fn test_parse_names() {
        assert_eq!(
            parse_dir_name("title@en"),
            Some((TemplateKind::Title, "en".to_string()))
        );
        assert_eq!(parse_dir_name("remote@en"), None);
        assert_eq!(parse_dir_name("title"), None);
        assert_eq!(
            parse_file_name("verify.email"),
            ("VERIFY".to_string(), "email".to_string())
        );
        assert_eq!(
            parse_file_name("disk full"),
            ("DISK FULL".to_string(), ALL_CHANNELS.to_string())
        );
    }

    async fn write(root: &Path, dir: &str, file: &str, content: &str) {
        tokio::fs::create_dir_all(root.join(dir)).await.unwrap();
        tokio::fs::write(root.join(dir).join(file), content).await.unwrap();
    }

    #[tokio::test]
    async fn test_seed_is_idempotent_and_respects_force_init() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "title@en", "VERIFY", "Verification code").await;
        write(dir.path(), "content@en", "VERIFY.email", "Code: {{code}}").await;
        write(dir.path(), "title@en", "DISK FULL", "Disk full").await;

        let repo = Arc::new(SqlxTemplateRepository::new(test_pool().await));
        let seeder = TemplateSeeder::new(
            repo.clone(),
            TemplateConfig {
                template_dir: dir.path().to_path_buf(),
                force_init_topics: vec!["VERIFY".to_string()],
                ..Default::default()
            },
        );

        let first = seeder.seed().await.unwrap();
        assert_eq!(first.created, 3);

        // Operator edit to a non-forced topic survives reseeding.
        let mut disk = repo.list_by_topic("DISK FULL").await.unwrap().remove(0);
        disk.content = "Edited".to_string();
        repo.update_template(&disk).await.unwrap();

        let second = seeder.seed().await.unwrap();
        assert_eq!(second.replaced_topics, 1);
        assert_eq!(second.created, 2);
        assert_eq!(repo.list_by_topic("DISK FULL").await.unwrap()[0].content, "Edited");
        assert_eq!(repo.list_by_topic("VERIFY").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_seed_collapses_duplicates_and_fills_lang() {
        let repo = Arc::new(SqlxTemplateRepository::new(test_pool().await));
        for content in ["first", "second"] {
            repo.create_template(&TemplateDbModel::new(
                ALL_CHANNELS,
                "T",
                TemplateKind::Title,
                "en",
                content,
            ))
            .await
            .unwrap();
        }
        repo.create_template(&TemplateDbModel::new(ALL_CHANNELS, "U", TemplateKind::Title, "", "u"))
            .await
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let seeder = TemplateSeeder::new(
            repo.clone(),
            TemplateConfig {
                template_dir: dir.path().to_path_buf(),
                force_init_topics: vec![],
                ..Default::default()
            },
        );
        let report = seeder.seed().await.unwrap();
        assert_eq!(report.duplicates_removed, 1);
        assert_eq!(report.langs_filled, 1);

        let rows = repo.list_by_topic("T").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "first");
        assert_eq!(repo.list_by_topic("U").await.unwrap()[0].lang, "en");
    }

    #[tokio::test]
    async fn test_filled_lang_row_collapses_in_same_pass() {
        let repo = Arc::new(SqlxTemplateRepository::new(test_pool().await));
        repo.create_template(&TemplateDbModel::new(
            ALL_CHANNELS,
            "V",
            TemplateKind::Title,
            "en",
            "kept",
        ))
        .await
        .unwrap();
        repo.create_template(&TemplateDbModel::new(
            ALL_CHANNELS,
            "V",
            TemplateKind::Title,
            "",
            "legacy",
        ))
        .await
        .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let seeder = TemplateSeeder::new(
            repo.clone(),
            TemplateConfig {
                template_dir: dir.path().to_path_buf(),
                force_init_topics: vec![],
                ..Default::default()
            },
        );
        let report = seeder.seed().await.unwrap();
        assert_eq!(report.langs_filled, 1);
        assert_eq!(report.duplicates_removed, 1);

        let rows = repo.list_by_topic("V").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].content, "kept");
        assert_eq!(rows[0].lang, "en");
    }
}
