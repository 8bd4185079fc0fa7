use std::collections::{BinaryHeap, HashSet};
use url::Url;

/// A URL entry in the frontier queue, ordered by score (highest first);
/// ties break FIFO via the insertion sequence number.
#[derive(Debug, Clone, Eq, PartialEq)]
struct FrontierEntry {
    score: i32,
    seq: u64,
    url: String,
    depth: u32,
}

impl Ord for FrontierEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap: higher score first, then lower seq.
        self.score
            .cmp(&other.score)
            .then(other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority URL frontier scoped to one site, with deduplication and
/// max-depth support. Product pages sort ahead of everything else.
pub struct Frontier {
    queue: BinaryHeap<FrontierEntry>,
    seen: HashSet<String>,
    site: String,
    product_lines: Vec<String>,
    max_depth: u32,
    seq: u64,
    visited: usize,
}

impl Frontier {
    /// Create a frontier seeded with one URL at depth 0. The seed's
    /// registrable domain defines the crawl scope.
    pub fn new(seed_url: &str, product_lines: &[String], max_depth: u32) -> Option<Self> {
        let normalized = normalize_url(seed_url)?;
        let parsed = Url::parse(&normalized).ok()?;
        let site = registrable_domain(parsed.host_str()?);

        let mut seen = HashSet::new();
        seen.insert(normalized.clone());
        let mut queue = BinaryHeap::new();
        queue.push(FrontierEntry {
            score: 0,
            seq: 0,
            url: normalized,
            depth: 0,
        });

        Some(Frontier {
            queue,
            seen,
            site,
            product_lines: product_lines.iter().map(|p| p.to_lowercase()).collect(),
            max_depth,
            seq: 1,
            visited: 0,
        })
    }

    /// Pop the next URL to crawl (best score first, FIFO on ties).
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<(String, u32)> {
        if let Some(entry) = self.queue.pop() {
            self.visited += 1;
            Some((entry.url, entry.depth))
        } else {
            None
        }
    }

    /// Add newly discovered URLs at the given depth. Out-of-scope hosts,
    /// already-seen URLs and URLs past max_depth are skipped.
    pub fn add_discovered(&mut self, urls: &[String], depth: u32) {
        if depth > self.max_depth {
            return;
        }
        for raw_url in urls {
            let Some(normalized) = normalize_url(raw_url) else {
                continue;
            };
            if !self.in_scope(&normalized) {
                continue;
            }
            if self.seen.insert(normalized.clone()) {
                let score = Url::parse(&normalized)
                    .map(|u| score_path(u.path(), &self.product_lines))
                    .unwrap_or(0);
                self.queue.push(FrontierEntry {
                    score,
                    seq: self.seq,
                    url: normalized,
                    depth,
                });
                self.seq += 1;
            }
        }
    }

    /// Whether a URL's host falls inside the seed's registrable domain.
    pub fn in_scope(&self, url: &str) -> bool {
        Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| registrable_domain(h) == self.site))
            .unwrap_or(false)
    }

    /// Number of URLs still in the queue.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Number of URLs already popped.
    pub fn visited_count(&self) -> usize {
        self.visited
    }
}

/// Score a URL path for crawl priority. Product pages first, boilerplate
/// last.
fn score_path(path: &str, product_lines: &[String]) -> i32 {
    let path = path.to_lowercase();

    if path.contains("/blog") || path.contains("/news") || path.contains("/careers")
        || path.contains("/login")
    {
        return -5;
    }
    if path.contains("/product/")
        || path.contains("/product_category/")
        || product_lines.iter().any(|p| !p.is_empty() && path.contains(p))
    {
        return 10;
    }
    if path.contains("/catalog") || path.contains("/spec") || path.contains("/datasheet")
        || path.contains("/submittal")
    {
        return 5;
    }
    0
}

/// Normalize a URL: lowercase scheme/host (the url crate already does),
/// strip the fragment, sort query pairs so parameter order doesn't defeat
/// the visited set.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut parsed = Url::parse(raw).ok()?;
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return None;
    }
    parsed.set_fragment(None);

    let mut pairs: Vec<(String, String)> = parsed
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    if pairs.is_empty() {
        parsed.set_query(None);
    } else {
        pairs.sort();
        parsed.query_pairs_mut().clear().extend_pairs(pairs);
    }

    Some(parsed.to_string())
}

/// Multi-part public suffixes that need three labels for the registrable
/// domain. Enough for host-scoping a single site; not a full suffix list.
const MULTI_PART_SUFFIXES: &[&str] = &[
    "co.uk", "org.uk", "ac.uk", "gov.uk", "com.au", "net.au", "org.au", "co.nz", "co.jp",
    "co.kr", "com.br", "com.mx", "co.in", "com.cn", "com.sg", "com.tw", "co.za",
];

/// Reduce a host to its registrable domain (eTLD+1): `www.example.com` and
/// `docs.example.com` both map to `example.com`.
pub fn registrable_domain(host: &str) -> String {
    let host = host.to_lowercase();
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() <= 2 {
        return host;
    }
    let last_two = labels[labels.len() - 2..].join(".");
    let take = if MULTI_PART_SUFFIXES.contains(&last_two.as_str()) {
        3
    } else {
        2
    };
    if labels.len() <= take {
        host
    } else {
        labels[labels.len() - take..].join(".")
    }
}
