//! Local share lookup and the filter applied before answering anyone's search.

use std::collections::{BTreeMap, HashMap};

use crate::protocol::{FileEntry, Folder};

/// A parsed search query: words that must appear, and `-words` that must not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

impl SearchQuery {
    pub fn parse(query: &str) -> Self {
        let mut q = SearchQuery::default();
        for word in query.split_whitespace() {
            let word = word.to_lowercase();
            if !word.starts_with('-') {
                q.include.push(word);
            } else if word.len() > 1 {
                q.exclude.push(word[1..].to_owned());
            }
        }
        q
    }

    pub fn is_empty(&self) -> bool {
        self.include.is_empty()
    }

    /// Case-insensitive match against a full virtual path.
    pub fn matches(&self, path: &str) -> bool {
        if self.include.is_empty() {
            return false;
        }
        let path = path.to_lowercase();
        self.include.iter().all(|t| path.contains(t.as_str()))
            && !self.exclude.iter().any(|t| path.contains(t.as_str()))
    }
}

/// What this node shares. Implemented by the host; an in-memory version ships for tests and demos.
pub trait ShareIndex: Send + Sync {
    fn search(&self, query: &SearchQuery) -> Vec<FileEntry>;

    /// Full listing for GetShareFileList.
    fn listing(&self) -> Vec<Folder>;

    /// `name` and every folder below it, or `None` if not shared.
    fn folder(&self, name: &str) -> Option<Vec<Folder>>;

    /// Whether a full virtual path is shared.
    fn contains(&self, filename: &str) -> bool;

    fn artwork(&self, _filename: &str) -> Option<Vec<u8>> {
        None
    }

    /// (folders, files) reported to the server after login.
    fn counts(&self) -> (u32, u32);
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryShareIndex {
    folders: BTreeMap<String, Vec<FileEntry>>,
    artwork: HashMap<String, Vec<u8>>,
}

impl InMemoryShareIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file by full virtual path (`Music\Album\01.mp3`).
    pub fn add_file(&mut self, path: &str, size: u64) -> &mut Self {
        self.add_entry(FileEntry::new(path, size))
    }

    pub fn add_entry(&mut self, entry: FileEntry) -> &mut Self {
        let dir = entry
            .filename
            .rsplit_once('\\')
            .map(|(dir, _)| dir.to_owned())
            .unwrap_or_default();
        self.folders.entry(dir).or_default().push(entry);
        self
    }

    pub fn set_artwork(&mut self, path: &str, data: Vec<u8>) -> &mut Self {
        self.artwork.insert(path.to_owned(), data);
        self
    }

    fn files(&self) -> impl Iterator<Item = &FileEntry> {
        self.folders.values().flatten()
    }
}

impl ShareIndex for InMemoryShareIndex {
    fn search(&self, query: &SearchQuery) -> Vec<FileEntry> {
        self.files()
            .filter(|f| query.matches(&f.filename))
            .cloned()
            .collect()
    }

    fn listing(&self) -> Vec<Folder> {
        self.folders
            .iter()
            .map(|(name, files)| Folder::new(name.clone(), files.clone()))
            .collect()
    }

    fn folder(&self, name: &str) -> Option<Vec<Folder>> {
        let prefix = format!("{name}\\");
        let found: Vec<Folder> = self
            .folders
            .iter()
            .filter(|(dir, _)| dir.as_str() == name || dir.starts_with(&prefix))
            .map(|(dir, files)| Folder::new(dir.clone(), files.clone()))
            .collect();
        (!found.is_empty()).then_some(found)
    }

    fn contains(&self, filename: &str) -> bool {
        self.files().any(|f| f.filename == filename)
    }

    fn artwork(&self, filename: &str) -> Option<Vec<u8>> {
        self.artwork.get(filename).cloned()
    }

    fn counts(&self) -> (u32, u32) {
        let files = self.folders.values().map(Vec::len).sum::<usize>();
        (
            u32::try_from(self.folders.len()).unwrap_or(u32::MAX),
            u32::try_from(files).unwrap_or(u32::MAX),
        )
    }
}

pub const DEFAULT_MIN_QUERY_LENGTH: usize = 3;
pub const DEFAULT_MAX_RESULTS: usize = 500;

/// Gate between an incoming query and the reply we send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultFilter {
    pub min_query_length: usize,
    pub max_results: usize,
    /// Lowercased phrases the server told us never to return.
    pub excluded_phrases: Vec<String>,
}

impl Default for ResultFilter {
    fn default() -> Self {
        Self {
            min_query_length: DEFAULT_MIN_QUERY_LENGTH,
            max_results: DEFAULT_MAX_RESULTS,
            excluded_phrases: Vec::new(),
        }
    }
}

impl ResultFilter {
    pub fn set_excluded_phrases(&mut self, phrases: impl IntoIterator<Item = String>) {
        self.excluded_phrases = phrases.into_iter().map(|p| p.to_lowercase()).collect();
    }

    /// Parse `query`, or `None` if it is too short or has nothing to match.
    pub fn accept_query(&self, query: &str) -> Option<SearchQuery> {
        if query.trim().chars().count() < self.min_query_length {
            return None;
        }
        let lowered = query.to_lowercase();
        if self.excluded_phrases.iter().any(|p| lowered.contains(p.as_str())) {
            return None;
        }
        let parsed = SearchQuery::parse(query);
        (!parsed.is_empty()).then_some(parsed)
    }

    /// Drop excluded results and cap the count.
    pub fn apply(&self, results: Vec<FileEntry>) -> Vec<FileEntry> {
        results
            .into_iter()
            .filter(|f| {
                let path = f.filename.to_lowercase();
                !self.excluded_phrases.iter().any(|p| path.contains(p.as_str()))
            })
            .take(self.max_results)
            .collect()
    }

    /// Full local search: query gate, index lookup, then `apply`.
    pub fn search(&self, index: &dyn ShareIndex, query: &str) -> Vec<FileEntry> {
        match self.accept_query(query) {
            Some(parsed) => self.apply(index.search(&parsed)),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> InMemoryShareIndex {
        let mut idx = InMemoryShareIndex::new();
        idx.add_file("Music\\Aphex Twin\\Selected Ambient Works\\01 Xtal.flac", 10)
            .add_file("Music\\Aphex Twin\\Selected Ambient Works\\02 Tha.flac", 11)
            .add_file("Music\\Aphex Twin\\Remixes\\01 Remix.mp3", 12)
            .add_file("Music\\Boards of Canada\\Roygbiv.mp3", 13);
        idx
    }

    #[test]
    fn query_parse_include_exclude() {
        let q = SearchQuery::parse("Aphex  -REMIX -");
        assert_eq!(q.include, vec!["aphex"]);
        assert_eq!(q.exclude, vec!["remix"]);
    }

    #[test]
    fn search_terms_and_exclusion() {
        let idx = index();
        let hits = idx.search(&SearchQuery::parse("aphex twin"));
        assert_eq!(hits.len(), 3);
        let hits = idx.search(&SearchQuery::parse("aphex -remixes"));
        assert_eq!(hits.len(), 2);
        assert!(idx.search(&SearchQuery::parse("-aphex")).is_empty());
    }

    #[test]
    fn filter_rejects_short_queries() {
        let filter = ResultFilter::default();
        assert!(filter.search(&index(), "ap").is_empty());
        assert!(filter.search(&index(), "  -x  ").is_empty());
        assert_eq!(filter.search(&index(), "xtal").len(), 1);
    }

    #[test]
    fn filter_caps_results() {
        let filter = ResultFilter {
            max_results: 2,
            ..ResultFilter::default()
        };
        assert_eq!(filter.search(&index(), "music").len(), 2);
    }

    #[test]
    fn filter_drops_excluded_phrases() {
        let mut filter = ResultFilter::default();
        filter.set_excluded_phrases(["Boards Of".to_owned()]);
        let hits = filter.search(&index(), "mp3");
        assert_eq!(hits.len(), 1);
        assert!(hits[0].filename.contains("Remix"));
        assert!(filter.search(&index(), "boards of canada").is_empty());
    }

    #[test]
    fn folder_lookup_includes_subfolders() {
        let idx = index();
        let folders = idx.folder("Music\\Aphex Twin").unwrap();
        let names: Vec<_> = folders.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            [
                "Music\\Aphex Twin\\Remixes",
                "Music\\Aphex Twin\\Selected Ambient Works"
            ]
        );
        assert!(idx.folder("Music\\Aphex").is_none());
    }

    #[test]
    fn counts_and_contains() {
        let mut idx = index();
        assert_eq!(idx.counts(), (3, 4));
        assert!(idx.contains("Music\\Boards of Canada\\Roygbiv.mp3"));
        assert!(!idx.contains("Music\\Boards of Canada"));
        assert!(idx.artwork("Music\\Boards of Canada\\Roygbiv.mp3").is_none());
        idx.set_artwork("Music\\Boards of Canada\\Roygbiv.mp3", vec![1]);
        assert_eq!(idx.artwork("Music\\Boards of Canada\\Roygbiv.mp3"), Some(vec![1]));
    }
}
