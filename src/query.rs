//! Similarity queries over a folder's persisted index.

use std::path::Path;

use findme_core::embedding::Embedder;
use findme_core::search::{rank, SearchHit};

use crate::config::SearchConfig;
use crate::error::SyncError;
use crate::index_store::FolderIndex;
use crate::layout::{path_key, INDEX_FILE};

/// Search the index in `index_dir` for `query`.
///
/// Asks the store for `candidate_k` neighbors and falls back to
/// `fallback_k` when that fails. If both attempts fail the result is empty
/// rather than an error. Hits are deduplicated per source, highlighted and
/// capped at `max_results`.
pub async fn search(
    index_dir: &Path,
    folder: &Path,
    embedder: &dyn Embedder,
    query: &str,
    config: &SearchConfig,
) -> Result<Vec<SearchHit>, SyncError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(SyncError::Validation("query is required".to_string()));
    }
    if !index_dir.join(INDEX_FILE).is_file() {
        return Err(SyncError::IndexNotFound(path_key(folder)));
    }
    let index = FolderIndex::load_local(index_dir, Some(embedder.model_name()))?;

    let hits = match index
        .similarity_search_with_score(embedder, query, config.candidate_k)
        .await
    {
        Ok(hits) => hits,
        Err(e) => {
            tracing::warn!(error = %e, k = config.candidate_k, "search failed, retrying with fewer candidates");
            match index
                .similarity_search_with_score(embedder, query, config.fallback_k)
                .await
            {
                Ok(hits) => hits,
                Err(e) => {
                    tracing::warn!(error = %e, k = config.fallback_k, "search failed, returning no results");
                    Vec::new()
                }
            }
        }
    };

    tracing::debug!(candidates = hits.len(), "search candidates");
    Ok(rank(hits, query, config.max_results))
}
