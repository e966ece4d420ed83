//! Page parsing: turn a fetched listing page into proxy candidates and links

use crate::proxy::models::ProxyCandidate;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Regex pattern to match IP:PORT patterns in text
static IP_PORT_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}):(\d{1,5})\b")
        .expect("Invalid IP:PORT regex")
});

/// Proxy URL form, e.g. `http://1.2.3.4:8080`
static URL_FORM_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:https?|socks[45])://(?:[^:@/]+:[^@/]+@)?([^:/]+):(\d+)/?$")
        .expect("Invalid proxy URL regex")
});

/// `href` attribute values, single or double quoted
static HREF_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?i)href\s*=\s*["']([^"'#][^"']*)["']"#).expect("Invalid href regex")
});

/// What a parser found on one page
#[derive(Debug, Clone, Default)]
pub struct ParsedPage {
    pub candidates: Vec<ProxyCandidate>,
    /// Raw link targets, possibly relative
    pub links: Vec<String>,
}

/// Site-specific extraction of candidates and links from a page body
pub trait PageParser: Send + Sync {
    fn extract(&self, body: &[u8], same_origin: &str) -> ParsedPage;
}

/// Generic parser for plain-text lists and simple HTML tables
///
/// Tries line-by-line parsing first and falls back to scanning the whole body
/// for `IP:PORT` pairs. Links are every `href` on the page; the crawler
/// decides which of them to follow.
#[derive(Debug, Clone, Default)]
pub struct RegexPageParser {
    follow_links: bool,
}

impl RegexPageParser {
    pub fn new() -> Self {
        Self { follow_links: true }
    }

    /// A parser that reports candidates only
    pub fn without_links() -> Self {
        Self {
            follow_links: false,
        }
    }

    /// Parse a single proxy line
    ///
    /// Supports formats:
    /// - IP:PORT
    /// - IP:PORT:USER:PASS (credentials are dropped)
    /// - scheme://IP:PORT
    /// - scheme://USER:PASS@IP:PORT
    pub fn parse_line(line: &str) -> Option<ProxyCandidate> {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            return None;
        }

        if let Some(caps) = URL_FORM_REGEX.captures(line) {
            let port: u16 = caps[2].parse().ok()?;
            return ProxyCandidate::checked(&caps[1], port);
        }

        let parts: Vec<&str> = line.split(':').collect();
        match parts.len() {
            2 | 4 => {
                let port: u16 = parts[1].parse().ok()?;
                if parts[0].contains(char::is_whitespace) {
                    return None;
                }
                ProxyCandidate::checked(parts[0], port)
            }
            _ => None,
        }
    }

    /// Parse candidates from raw text content
    pub fn parse_candidates(content: &str) -> Vec<ProxyCandidate> {
        let mut candidates: Vec<ProxyCandidate> =
            content.lines().filter_map(Self::parse_line).collect();

        if candidates.is_empty() {
            candidates = Self::extract_with_regex(content);
        }

        let mut seen = HashSet::new();
        candidates.retain(|c| seen.insert(c.sha.clone()));
        candidates
    }

    /// Extract candidates using regex pattern matching
    fn extract_with_regex(content: &str) -> Vec<ProxyCandidate> {
        IP_PORT_REGEX
            .captures_iter(content)
            .filter_map(|cap| {
                let host = cap.get(1)?.as_str();
                let port: u16 = cap.get(2)?.as_str().parse().ok()?;

                for part in host.split('.') {
                    let num: u32 = part.parse().ok()?;
                    if num > 255 {
                        return None;
                    }
                }

                ProxyCandidate::checked(host, port)
            })
            .collect()
    }

    /// Every `href` target on the page
    pub fn parse_links(content: &str) -> Vec<String> {
        HREF_REGEX
            .captures_iter(content)
            .filter_map(|cap| cap.get(1))
            .map(|m| m.as_str().trim().to_string())
            .filter(|href| !href.is_empty())
            .collect()
    }
}

impl PageParser for RegexPageParser {
    fn extract(&self, body: &[u8], _same_origin: &str) -> ParsedPage {
        let content = String::from_utf8_lossy(body);
        ParsedPage {
            candidates: Self::parse_candidates(&content),
            links: if self.follow_links {
                Self::parse_links(&content)
            } else {
                Vec::new()
            },
        }
    }
}
