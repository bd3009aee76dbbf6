//! Always-empty KB adapter for tenants without a knowledge base.

use async_trait::async_trait;

use super::{KbAdapter, KbError, SearchScope};
use crate::types::KbArticle;

pub struct NoopKbAdapter;

#[async_trait]
impl KbAdapter for NoopKbAdapter {
    fn name(&self) -> &'static str {
        "noop"
    }

    async fn search(
        &self,
        _query: &str,
        _scope: &SearchScope,
    ) -> Result<Vec<KbArticle>, KbError> {
        Ok(Vec::new())
    }
}
