//! Direct-database KB adapter.
//!
//! Case-insensitive LIKE-style scan over title, snippet and tags of the
//! tenant's article table. The table itself is loaded at bootstrap (or
//! seeded by tests); article authoring is outside the core.

use async_trait::async_trait;
use dashmap::DashMap;

use super::{KbAdapter, KbError, SearchScope};
use crate::types::KbArticle;

/// Article table keyed by tenant.
#[derive(Default)]
pub struct DatabaseKbAdapter {
    articles: DashMap<String, Vec<KbArticle>>,
}

impl DatabaseKbAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces a tenant's article table.
    pub fn seed(&self, tenant_id: &str, mut articles: Vec<KbArticle>) {
        for article in &mut articles {
            article.source = "database".to_string();
        }
        self.articles.insert(tenant_id.to_string(), articles);
    }

    /// Scores one article against the query terms: one point per term that
    /// appears in the title, snippet or any tag.
    fn score(article: &KbArticle, terms: &[String]) -> usize {
        let title = article.title.to_lowercase();
        let snippet = article.snippet.to_lowercase();
        terms
            .iter()
            .filter(|term| {
                title.contains(term.as_str())
                    || snippet.contains(term.as_str())
                    || article
                        .tags
                        .iter()
                        .any(|tag| tag.to_lowercase().contains(term.as_str()))
            })
            .count()
    }
}

#[async_trait]
impl KbAdapter for DatabaseKbAdapter {
    fn name(&self) -> &'static str {
        "database"
    }

    async fn search(
        &self,
        query: &str,
        scope: &SearchScope,
    ) -> Result<Vec<KbArticle>, KbError> {
        let terms: Vec<String> = query
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.len() > 1)
            .map(str::to_lowercase)
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let Some(table) = self.articles.get(&scope.tenant_id) else {
            return Ok(Vec::new());
        };

        let mut scored: Vec<(usize, KbArticle)> = table
            .iter()
            .filter_map(|article| {
                let score = Self::score(article, &terms);
                (score > 0).then(|| (score, article.clone()))
            })
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.truncate(scope.max);

        Ok(scored
            .into_iter()
            .map(|(score, mut article)| {
                // Term coverage stands in for relevance confidence.
                article.confidence =
                    (score as f32 / terms.len() as f32).clamp(0.0, 1.0);
                article
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn article(id: &str, title: &str, tags: &[&str]) -> KbArticle {
        KbArticle {
            id: id.to_string(),
            title: title.to_string(),
            snippet: format!("How to {title}"),
            url: None,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            source: String::new(),
            confidence: 0.0,
        }
    }

    fn scope(max: usize) -> SearchScope {
        SearchScope {
            tenant_id: "acme".to_string(),
            max,
            context: None,
        }
    }

    #[tokio::test]
    async fn finds_articles_by_title_terms() {
        let adapter = DatabaseKbAdapter::new();
        adapter.seed(
            "acme",
            vec![
                article("a1", "Block a credit card", &["cards"]),
                article("a2", "Reset online banking password", &["password"]),
            ],
        );

        let hits = adapter.search("credit card block", &scope(3)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "a1");
        assert_eq!(hits[0].source, "database");
        assert!(hits[0].confidence > 0.9);
    }

    #[tokio::test]
    async fn matches_on_tags() {
        let adapter = DatabaseKbAdapter::new();
        adapter.seed("acme", vec![article("a1", "Account recovery", &["password"])]);

        let hits = adapter.search("password reset", &scope(3)).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn respects_max_and_tenant_isolation() {
        let adapter = DatabaseKbAdapter::new();
        adapter.seed(
            "acme",
            (0..5)
                .map(|i| article(&format!("a{i}"), "billing question", &[]))
                .collect(),
        );

        let hits = adapter.search("billing", &scope(2)).await.unwrap();
        assert_eq!(hits.len(), 2);

        let other = SearchScope {
            tenant_id: "globex".to_string(),
            max: 3,
            context: None,
        };
        assert!(adapter.search("billing", &other).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_query_returns_nothing() {
        let adapter = DatabaseKbAdapter::new();
        adapter.seed("acme", vec![article("a1", "anything", &[])]);
        assert!(adapter.search("  ", &scope(3)).await.unwrap().is_empty());
    }
}
