//! On-page SEO signals of a single competitor page.

use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::Config;
use crate::extract::element_text;
use crate::proxy::{HeaderProfile, ProxyRotator};

static TITLE: Lazy<Selector> = Lazy::new(|| Selector::parse("title").unwrap());
static META_DESCRIPTION: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[name="description" i]"#).unwrap());
static META_KEYWORDS: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[name="keywords" i]"#).unwrap());
static META_ROBOTS: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"meta[name="robots" i]"#).unwrap());
static CANONICAL: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"link[rel~="canonical"]"#).unwrap());
static LD_JSON: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"script[type="application/ld+json"]"#).unwrap());
static H1: Lazy<Selector> = Lazy::new(|| Selector::parse("h1").unwrap());
static H2: Lazy<Selector> = Lazy::new(|| Selector::parse("h2").unwrap());
static H3: Lazy<Selector> = Lazy::new(|| Selector::parse("h3").unwrap());
static IMG: Lazy<Selector> = Lazy::new(|| Selector::parse("img").unwrap());
static LINK: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());

static PUNCTUATION: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s]").unwrap());

const HIDDEN_TAGS: &[&str] = &["script", "style", "noscript", "template"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageData {
    pub src: String,
    pub alt: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkData {
    pub href: String,
    pub text: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub url: String,
    pub title: String,
    pub description: String,
    pub keywords: String,
    pub h1: Vec<String>,
    pub h2: Vec<String>,
    pub h3: Vec<String>,
    pub images: Vec<ImageData>,
    pub links: Vec<LinkData>,
    pub word_count: usize,
}

/// Presence checks. Each flag looks at its own element only.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TechnicalSeo {
    pub has_title: bool,
    pub has_description: bool,
    pub has_keywords: bool,
    pub has_h1: bool,
    pub has_images_with_alt: bool,
    pub has_canonical: bool,
    pub has_robots: bool,
    pub has_schema: bool,
    pub is_https: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordHit {
    pub keyword: String,
    pub count: usize,
    /// Share of all tokens, 0.0..=1.0.
    pub density: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordDensity {
    pub total_words: usize,
    /// One entry per word of the keyword.
    pub terms: Vec<KeywordHit>,
    /// Whole-phrase count, only for multi-word keywords.
    pub phrase: Option<KeywordHit>,
}

impl KeywordDensity {
    /// The figure stored with a page: the phrase, or the single word.
    pub fn primary(&self) -> Option<&KeywordHit> {
        self.phrase.as_ref().or_else(|| self.terms.first())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageAnalysis {
    pub metadata: PageMetadata,
    pub technical: TechnicalSeo,
    pub density: Option<KeywordDensity>,
}

/// Text of the document outside script, style and similar containers.
pub fn visible_text(document: &Html) -> String {
    let mut text = String::new();
    for node in document.root_element().descendants() {
        let Some(chunk) = node.value().as_text() else {
            continue;
        };
        let hidden = node.ancestors().any(|ancestor| {
            ancestor
                .value()
                .as_element()
                .map_or(false, |el| HIDDEN_TAGS.contains(&el.name()))
        });
        if !hidden {
            text.push_str(chunk);
            text.push(' ');
        }
    }
    text
}

fn attr_string(element: scraper::ElementRef<'_>, name: &str) -> Option<String> {
    element
        .value()
        .attr(name)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn meta_content(document: &Html, selector: &Selector) -> String {
    document
        .select(selector)
        .next()
        .and_then(|meta| attr_string(meta, "content"))
        .unwrap_or_default()
}

fn headings(document: &Html, selector: &Selector) -> Vec<String> {
    document
        .select(selector)
        .map(element_text)
        .filter(|text| !text.is_empty())
        .collect()
}

fn resolve(base: Option<&Url>, href: &str) -> String {
    base.and_then(|base| base.join(href).ok())
        .map(|url| url.to_string())
        .unwrap_or_else(|| href.to_string())
}

pub fn extract_metadata(document: &Html, url: &str) -> PageMetadata {
    let base = Url::parse(url).ok();

    let images = document
        .select(&IMG)
        .filter_map(|img| {
            let src = attr_string(img, "src")?;
            Some(ImageData {
                src: resolve(base.as_ref(), &src),
                alt: attr_string(img, "alt"),
                title: attr_string(img, "title"),
            })
        })
        .collect();

    let links = document
        .select(&LINK)
        .filter_map(|a| {
            let href = a.value().attr("href")?.trim();
            Some(LinkData {
                href: resolve(base.as_ref(), href),
                text: element_text(a),
                title: attr_string(a, "title"),
            })
        })
        .collect();

    PageMetadata {
        url: url.to_string(),
        title: document
            .select(&TITLE)
            .next()
            .map(element_text)
            .unwrap_or_default(),
        description: meta_content(document, &META_DESCRIPTION),
        keywords: meta_content(document, &META_KEYWORDS),
        h1: headings(document, &H1),
        h2: headings(document, &H2),
        h3: headings(document, &H3),
        images,
        links,
        word_count: visible_text(document).split_whitespace().count(),
    }
}

pub fn check_technical_seo(document: &Html, url: &str) -> TechnicalSeo {
    let present = |selector: &Selector| document.select(selector).next().is_some();
    TechnicalSeo {
        has_title: present(&TITLE),
        has_description: present(&META_DESCRIPTION),
        has_keywords: present(&META_KEYWORDS),
        has_h1: present(&H1),
        has_images_with_alt: document
            .select(&IMG)
            .any(|img| attr_string(img, "alt").is_some()),
        has_canonical: present(&CANONICAL),
        has_robots: present(&META_ROBOTS),
        has_schema: present(&LD_JSON),
        is_https: Url::parse(url).map_or(false, |u| u.scheme() == "https"),
    }
}

/// Lower-cased visible text with punctuation replaced by spaces, split on
/// whitespace.
pub fn tokenize(text: &str) -> Vec<String> {
    PUNCTUATION
        .replace_all(&text.to_lowercase(), " ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

pub fn keyword_density(document: &Html, keyword: &str) -> KeywordDensity {
    let tokens = tokenize(&visible_text(document));
    let parts = tokenize(keyword);
    let total = tokens.len();
    let density = |count: usize| if total == 0 { 0.0 } else { count as f64 / total as f64 };

    let terms = parts
        .iter()
        .map(|part| {
            let count = tokens.iter().filter(|t| *t == part).count();
            KeywordHit {
                keyword: part.clone(),
                count,
                density: density(count),
            }
        })
        .collect();

    let phrase = (parts.len() > 1).then(|| {
        let count = tokens
            .windows(parts.len())
            .filter(|window| *window == parts.as_slice())
            .count();
        KeywordHit {
            keyword: parts.join(" "),
            count,
            density: density(count),
        }
    });

    KeywordDensity {
        total_words: total,
        terms,
        phrase,
    }
}

pub fn analyze_page(url: &str, html: &str, keyword: Option<&str>) -> PageAnalysis {
    let document = Html::parse_document(html);
    PageAnalysis {
        metadata: extract_metadata(&document, url),
        technical: check_technical_seo(&document, url),
        density: keyword
            .filter(|k| !k.trim().is_empty())
            .map(|k| keyword_density(&document, k)),
    }
}

/// Fetches competitor pages with the rotated headers.
pub struct PageFetcher {
    config: Arc<Config>,
    rotator: Arc<ProxyRotator>,
}

impl PageFetcher {
    pub fn new(config: Arc<Config>, rotator: Arc<ProxyRotator>) -> Self {
        Self { config, rotator }
    }

    /// Final URL and body, or `None` on any transport error or non-2xx.
    pub async fn fetch(&self, url: &str) -> Option<(String, String)> {
        let client = match self
            .rotator
            .client(HeaderProfile::Standard, self.config.request_timeout)
        {
            Ok(client) => client,
            Err(e) => {
                warn!(url, "failed to build client: {}", e);
                return None;
            }
        };

        let response = match client.get(url).send().await {
            Ok(response) => response,
            Err(e) => {
                warn!(url, "page fetch failed: {}", e);
                return None;
            }
        };
        if !response.status().is_success() {
            warn!(url, status = response.status().as_u16(), "page fetch returned non-success status");
            return None;
        }

        let final_url = response.url().to_string();
        match response.text().await {
            Ok(html) => {
                debug!(url, bytes = html.len(), "page fetched");
                Some((final_url, html))
            }
            Err(e) => {
                warn!(url, "failed to read page body: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FULL_PAGE: &str = r#"<!DOCTYPE html><html><head>
        <title> Coffee Shop </title>
        <meta name="description" content="Best coffee in Bishkek">
        <meta name="keywords" content="coffee, bishkek">
        <meta name="robots" content="index,follow">
        <link rel="canonical" href="https://shop.kg/">
        <script type="application/ld+json">{"@type":"Store"}</script>
        <style>body { color: red }</style>
    </head><body>
        <h1>Coffee machines</h1>
        <h2>Espresso</h2><h2>Drip</h2>
        <h3>Prices</h3>
        <img src="/img/a.png" alt="espresso machine">
        <img src="b.png">
        <img alt="no source">
        <a href="/catalog" title="Catalog">Catalog</a>
        <a href="https://other.kg/">Other</a>
        <script>var hidden = "coffee coffee coffee";</script>
    </body></html>"#;

    fn parse(html: &str) -> Html {
        Html::parse_document(html)
    }

    #[test]
    fn density_counts_terms_and_phrase() {
        let document = parse(
            "<html><body><h1>Coffee maker guide</h1><p>Fresh coffee, every day.</p></body></html>",
        );
        let density = keyword_density(&document, "Coffee maker");

        assert_eq!(density.total_words, 7);
        assert_eq!(density.terms[0].keyword, "coffee");
        assert_eq!(density.terms[0].count, 2);
        assert_eq!(density.terms[1].count, 1);

        let phrase = density.phrase.as_ref().unwrap();
        assert_eq!(phrase.keyword, "coffee maker");
        assert_eq!(phrase.count, 1);
        assert!((phrase.density - 1.0 / 7.0).abs() < 1e-9);
        assert_eq!(density.primary().unwrap().keyword, "coffee maker");
    }

    #[test]
    fn single_word_keyword_has_no_phrase() {
        let document = parse("<p>кофе и ещё кофе</p>");
        let density = keyword_density(&document, "Кофе");
        assert_eq!(density.total_words, 4);
        assert!(density.phrase.is_none());
        assert_eq!(density.primary().unwrap().count, 2);
        assert!((density.primary().unwrap().density - 0.5).abs() < 1e-9);
    }

    #[test]
    fn empty_page_has_zero_density() {
        let density = keyword_density(&parse("<html></html>"), "coffee maker");
        assert_eq!(density.total_words, 0);
        assert_eq!(density.terms[0].density, 0.0);
        assert_eq!(density.phrase.unwrap().density, 0.0);
    }

    #[test]
    fn metadata_is_extracted_and_resolved() {
        let document = parse(FULL_PAGE);
        let meta = extract_metadata(&document, "https://shop.kg/ru/index.html");

        assert_eq!(meta.title, "Coffee Shop");
        assert_eq!(meta.description, "Best coffee in Bishkek");
        assert_eq!(meta.keywords, "coffee, bishkek");
        assert_eq!(meta.h1, vec!["Coffee machines"]);
        assert_eq!(meta.h2, vec!["Espresso", "Drip"]);
        assert_eq!(meta.h3, vec!["Prices"]);

        assert_eq!(meta.images.len(), 2);
        assert_eq!(meta.images[0].src, "https://shop.kg/img/a.png");
        assert_eq!(meta.images[0].alt.as_deref(), Some("espresso machine"));
        assert_eq!(meta.images[1].src, "https://shop.kg/ru/b.png");
        assert_eq!(meta.images[1].alt, None);

        assert_eq!(meta.links.len(), 2);
        assert_eq!(meta.links[0].href, "https://shop.kg/catalog");
        assert_eq!(meta.links[0].title.as_deref(), Some("Catalog"));
        assert_eq!(meta.links[1].text, "Other");
    }

    #[test]
    fn word_count_skips_scripts_and_styles() {
        let document = parse(
            "<html><head><style>p { x: y }</style></head><body><p>one two</p><script>three four</script></body></html>",
        );
        assert_eq!(extract_metadata(&document, "https://a.kg/").word_count, 2);
    }

    #[test]
    fn full_page_passes_every_check() {
        let flags = check_technical_seo(&parse(FULL_PAGE), "https://shop.kg/");
        assert_eq!(
            flags,
            TechnicalSeo {
                has_title: true,
                has_description: true,
                has_keywords: true,
                has_h1: true,
                has_images_with_alt: true,
                has_canonical: true,
                has_robots: true,
                has_schema: true,
                is_https: true,
            }
        );
    }

    #[test]
    fn missing_elements_only_clear_their_own_flags() {
        let html = r#"<html><head>
            <meta name="robots" content="noindex">
            <link rel="canonical" href="http://bare.kg/">
        </head><body><p>text</p><img src="x.png" alt="x"></body></html>"#;
        let flags = check_technical_seo(&parse(html), "http://bare.kg/");

        assert!(!flags.has_title);
        assert!(!flags.has_description);
        assert!(!flags.has_h1);
        assert!(!flags.has_keywords);
        assert!(!flags.has_schema);
        assert!(!flags.is_https);
        assert!(flags.has_robots);
        assert!(flags.has_canonical);
        assert!(flags.has_images_with_alt);
    }

    #[test]
    fn blank_alt_does_not_count() {
        let flags = check_technical_seo(&parse(r#"<img src="a.png" alt="  ">"#), "https://a.kg/");
        assert!(!flags.has_images_with_alt);
    }

    #[test]
    fn analysis_without_keyword_skips_density() {
        let analysis = analyze_page("https://shop.kg/", FULL_PAGE, None);
        assert!(analysis.density.is_none());
        assert!(analysis.technical.has_h1);
        assert_eq!(analysis.metadata.title, "Coffee Shop");
    }

    #[tokio::test]
    async fn fetcher_returns_none_on_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/ok"))
            .respond_with(ResponseTemplate::new(200).set_body_string(FULL_PAGE))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let config = Arc::new(Config {
            delay_min: 0.0,
            delay_max: 0.0,
            ..Config::default()
        });
        let fetcher = PageFetcher::new(config.clone(), Arc::new(ProxyRotator::from_config(&config)));

        let (final_url, html) = fetcher.fetch(&format!("{}/ok", server.uri())).await.unwrap();
        let analysis = analyze_page(&final_url, &html, Some("coffee"));
        assert_eq!(analysis.metadata.h1, vec!["Coffee machines"]);
        assert!(!analysis.technical.is_https);
        assert_eq!(analysis.density.unwrap().terms[0].keyword, "coffee");

        assert!(fetcher.fetch(&format!("{}/gone", server.uri())).await.is_none());
    }
}
