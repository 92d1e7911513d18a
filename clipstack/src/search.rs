//! Substring search over the clip list
//!
//! Only one search is outstanding at a time: starting a new one cancels the
//! previous token. The caller dropping the future cancels it as well (the
//! `DropGuard` fires), so the blocking scan stops at its next checkpoint.

use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::interface::ClipStackError;
use crate::models::Clip;

/// Quiet period before a query runs
pub const SEARCH_DEBOUNCE: Duration = Duration::from_millis(300);

/// Entries scanned between cancellation checks
const CHECK_INTERVAL: usize = 256;

/// RAII guard that cancels a token when dropped.
struct DropGuard {
    token: CancellationToken,
}

impl DropGuard {
    fn new(token: CancellationToken) -> Self {
        Self { token }
    }
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Searchable snapshot of one clip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchEntry {
    pub id: i64,
    pub text: String,
}

impl SearchEntry {
    /// Entries for every clip with Text or Files data, in list order
    pub fn from_clips(clips: &[Clip]) -> Vec<SearchEntry> {
        clips
            .iter()
            .filter_map(|clip| {
                clip.searchable_text().map(|text| SearchEntry {
                    id: clip.id,
                    text: text.to_string(),
                })
            })
            .collect()
    }
}

#[derive(Default)]
pub struct Searcher {
    current: Mutex<Option<CancellationToken>>,
}

impl Searcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel whatever search is running
    pub fn cancel(&self) {
        if let Some(token) = self.current.lock().take() {
            token.cancel();
        }
    }

    /// Ids of entries containing `query` case-insensitively, in entry order.
    /// Returns `Cancelled` when superseded or dropped.
    pub async fn search(
        &self,
        entries: Vec<SearchEntry>,
        query: String,
    ) -> Result<Vec<i64>, ClipStackError> {
        let token = CancellationToken::new();
        if let Some(previous) = self.current.lock().replace(token.clone()) {
            previous.cancel();
        }
        let _guard = DropGuard::new(token.clone());

        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return Ok(entries.iter().map(|e| e.id).collect());
        }

        // Debounce and scan on our runtime; the caller may not be on tokio.
        let runtime = crate::runtime_handle();
        let runtime_for_task = runtime.clone();
        let task_token = token.clone();
        let handle = runtime.spawn(async move {
            tokio::select! {
                _ = task_token.cancelled() => return Err(ClipStackError::Cancelled),
                _ = tokio::time::sleep(SEARCH_DEBOUNCE) => {}
            }
            let scan_token = task_token.clone();
            runtime_for_task
                .spawn_blocking(move || scan(&entries, &query, &scan_token))
                .await
                .unwrap_or(Err(ClipStackError::Cancelled))
        });

        match handle.await {
            Ok(result) => result,
            Err(_join_error) => Err(ClipStackError::Cancelled),
        }
    }
}

/// Blocking scan; `query` is already lowercased
fn scan(
    entries: &[SearchEntry],
    query: &str,
    token: &CancellationToken,
) -> Result<Vec<i64>, ClipStackError> {
    let mut ids = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        if i % CHECK_INTERVAL == 0 && token.is_cancelled() {
            return Err(ClipStackError::Cancelled);
        }
        if entry.text.to_lowercase().contains(query) {
            ids.push(entry.id);
        }
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn entries(texts: &[&str]) -> Vec<SearchEntry> {
        texts
            .iter()
            .enumerate()
            .map(|(i, t)| SearchEntry {
                id: i as i64 + 1,
                text: t.to_string(),
            })
            .collect()
    }

    #[test]
    fn test_scan_is_case_insensitive_and_ordered() {
        let token = CancellationToken::new();
        let result = scan(&entries(&["Hello World", "nothing", "say HELLO"]), "hello", &token);
        assert_eq!(result.unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_scan_stops_when_cancelled() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(matches!(
            scan(&entries(&["a"]), "a", &token),
            Err(ClipStackError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_search_returns_matches_after_debounce() {
        let searcher = Searcher::new();
        let ids = searcher
            .search(entries(&["alpha", "beta", "Alphabet"]), "ALPHA".into())
            .await
            .unwrap();
        assert_eq!(ids, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_empty_query_returns_everything() {
        let searcher = Searcher::new();
        let ids = searcher.search(entries(&["a", "b"]), "  ".into()).await.unwrap();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_new_search_cancels_previous() {
        let searcher = Arc::new(Searcher::new());
        let first = {
            let searcher = Arc::clone(&searcher);
            tokio::spawn(async move { searcher.search(entries(&["x"]), "x".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = searcher.search(entries(&["x"]), "x".into()).await;

        assert!(matches!(first.await.unwrap(), Err(ClipStackError::Cancelled)));
        assert_eq!(second.unwrap(), vec![1]);
    }
}
