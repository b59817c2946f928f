//! Organic result extraction from search-results pages.
//!
//! Each engine has an ordered list of block strategies. The first strategy
//! that finds any candidate blocks wins; inside every block the title and
//! description selectors are tried in order as well. Candidates that cannot
//! be turned into a result are skipped and counted in [`SkipCounts`].

use once_cell::sync::Lazy;
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use utoipa::ToSchema;

use crate::engine::SearchEngine;

/// One organic result in page order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct OrganicResult {
    pub position: u32,
    pub title: String,
    pub url: String,
    pub domain: String,
    pub description: String,
}

/// Why candidate blocks were dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SkipCounts {
    pub missing_title: usize,
    pub missing_link: usize,
    pub non_organic: usize,
    pub advertisement: usize,
    pub duplicate: usize,
}

impl SkipCounts {
    pub fn total(&self) -> usize {
        self.missing_title + self.missing_link + self.non_organic + self.advertisement + self.duplicate
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractionOutcome {
    pub results: Vec<OrganicResult>,
    /// Name of the block strategy that produced candidates.
    pub strategy: Option<&'static str>,
    pub candidates: usize,
    pub skipped: SkipCounts,
    /// The page was a CAPTCHA/consent/block page; nothing was parsed.
    pub blocked: bool,
}

/// A named way of locating candidate result blocks.
pub struct BlockStrategy {
    pub name: &'static str,
    pub find: for<'a> fn(&'a Html) -> Vec<ElementRef<'a>>,
}

fn css(selector: &str) -> Selector {
    Selector::parse(selector).expect("static selector must parse")
}

fn css_list(selectors: &[&str]) -> Vec<Selector> {
    selectors.iter().map(|s| css(s)).collect()
}

static DIV_G: Lazy<Selector> = Lazy::new(|| css("div.g"));
static DIV_HVEID: Lazy<Selector> = Lazy::new(|| css("div[data-hveid]"));
static DIV_RC: Lazy<Selector> = Lazy::new(|| css("div.rc"));
static DIV_JSCONTROLLER: Lazy<Selector> = Lazy::new(|| css("div[jscontroller]"));
static DIV_JSNAME: Lazy<Selector> = Lazy::new(|| css("div[jsname]"));
static SERP_ITEM: Lazy<Selector> = Lazy::new(|| css("li.serp-item, div.serp-item"));
static ORGANIC: Lazy<Selector> = Lazy::new(|| css("div.organic, li.organic"));
static ANY_DIV: Lazy<Selector> = Lazy::new(|| css("div"));
static LINK: Lazy<Selector> = Lazy::new(|| css("a[href]"));
static AD_LABEL: Lazy<Selector> = Lazy::new(|| css(".label, [data-fast-name=\"ad\"]"));

static GOOGLE_TITLES: Lazy<Vec<Selector>> =
    Lazy::new(|| css_list(&["h3", "a h3", ".LC20lb", ".DKV0Md", ".r", ".title"]));
static GOOGLE_DESCRIPTIONS: Lazy<Vec<Selector>> =
    Lazy::new(|| css_list(&[".VwiC3b", ".s3v9rd", ".st", ".aCOpRe", ".snippet-content"]));
static YANDEX_TITLES: Lazy<Vec<Selector>> =
    Lazy::new(|| css_list(&["a.link", "h2 a", "a.OrganicTitle-Link", "h2"]));
static YANDEX_DESCRIPTIONS: Lazy<Vec<Selector>> = Lazy::new(|| {
    css_list(&["div.text-container", ".OrganicText", ".organic__content-wrapper"])
});

static GOOGLE_BASE: Lazy<Url> =
    Lazy::new(|| Url::parse("https://www.google.com/").expect("static url must parse"));

fn select<'a>(document: &'a Html, selector: &Selector) -> Vec<ElementRef<'a>> {
    document.select(selector).collect()
}

fn google_class_g(document: &Html) -> Vec<ElementRef<'_>> {
    select(document, &DIV_G)
}

fn google_data_hveid(document: &Html) -> Vec<ElementRef<'_>> {
    select(document, &DIV_HVEID)
}

fn google_class_rc(document: &Html) -> Vec<ElementRef<'_>> {
    select(document, &DIV_RC)
}

fn google_jscontroller(document: &Html) -> Vec<ElementRef<'_>> {
    select(document, &DIV_JSCONTROLLER)
}

fn google_jsname(document: &Html) -> Vec<ElementRef<'_>> {
    select(document, &DIV_JSNAME)
}

fn yandex_serp_item(document: &Html) -> Vec<ElementRef<'_>> {
    select(document, &SERP_ITEM)
}

fn yandex_organic(document: &Html) -> Vec<ElementRef<'_>> {
    select(document, &ORGANIC)
}

/// Last resort: every `div` that contains a link.
fn any_div_with_link(document: &Html) -> Vec<ElementRef<'_>> {
    document
        .select(&ANY_DIV)
        .filter(|div| div.select(&LINK).next().is_some())
        .collect()
}

const GOOGLE_STRATEGIES: &[BlockStrategy] = &[
    BlockStrategy { name: "div.g", find: google_class_g },
    BlockStrategy { name: "div[data-hveid]", find: google_data_hveid },
    BlockStrategy { name: "div.rc", find: google_class_rc },
    BlockStrategy { name: "div[jscontroller]", find: google_jscontroller },
    BlockStrategy { name: "div[jsname]", find: google_jsname },
    BlockStrategy { name: "div:has(a)", find: any_div_with_link },
];

const YANDEX_STRATEGIES: &[BlockStrategy] = &[
    BlockStrategy { name: ".serp-item", find: yandex_serp_item },
    BlockStrategy { name: ".organic", find: yandex_organic },
    BlockStrategy { name: "div:has(a)", find: any_div_with_link },
];

pub fn block_strategies(engine: SearchEngine) -> &'static [BlockStrategy] {
    match engine {
        SearchEngine::Google => GOOGLE_STRATEGIES,
        SearchEngine::Yandex => YANDEX_STRATEGIES,
    }
}

fn title_selectors(engine: SearchEngine) -> &'static [Selector] {
    match engine {
        SearchEngine::Google => &GOOGLE_TITLES,
        SearchEngine::Yandex => &YANDEX_TITLES,
    }
}

fn description_selectors(engine: SearchEngine) -> &'static [Selector] {
    match engine {
        SearchEngine::Google => &GOOGLE_DESCRIPTIONS,
        SearchEngine::Yandex => &YANDEX_DESCRIPTIONS,
    }
}

/// Runs the strategies in order and returns the first non-empty candidate set.
pub fn find_blocks(engine: SearchEngine, document: &Html) -> Option<(&'static str, Vec<ElementRef<'_>>)> {
    block_strategies(engine).iter().find_map(|strategy| {
        let blocks = (strategy.find)(document);
        (!blocks.is_empty()).then_some((strategy.name, blocks))
    })
}

/// Element text with whitespace runs collapsed.
pub fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// First selector match inside `block` that has non-empty text.
fn first_with_text<'a>(block: ElementRef<'a>, selectors: &[Selector]) -> Option<(ElementRef<'a>, String)> {
    selectors.iter().find_map(|selector| {
        block.select(selector).find_map(|element| {
            let text = element_text(element);
            (!text.is_empty()).then_some((element, text))
        })
    })
}

/// Unwraps `/url?q=<dest>&...` style redirect links to their destination.
/// Anything else is returned unchanged.
pub fn unwrap_redirect(href: &str) -> String {
    let href = href.trim();
    let looks_like_redirect = href.starts_with("/url?")
        || ((href.starts_with("http://") || href.starts_with("https://"))
            && href.contains(".google.")
            && href.contains("/url?"));
    if !looks_like_redirect {
        return href.to_string();
    }

    let parsed = if href.starts_with('/') {
        GOOGLE_BASE.join(href)
    } else {
        Url::parse(href)
    };

    parsed
        .ok()
        .and_then(|url| {
            url.query_pairs()
                .find(|(key, value)| (key == "q" || key == "url") && !value.is_empty())
                .map(|(_, value)| value.into_owned())
        })
        .unwrap_or_else(|| href.to_string())
}

/// Host of `url`, or `None` for relative/unparsable links.
pub fn domain_of(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .filter(|h| !h.is_empty())
}

/// Parses `html` and extracts organic results.
pub fn extract_results(engine: SearchEngine, html: &str) -> ExtractionOutcome {
    if engine.is_block_page(html) {
        return ExtractionOutcome {
            blocked: true,
            ..Default::default()
        };
    }
    let document = Html::parse_document(html);
    extract_from_document(engine, &document)
}

/// Extracts organic results from an already parsed document. Block-page
/// detection is the caller's job (see [`extract_results`]).
pub fn extract_from_document(engine: SearchEngine, document: &Html) -> ExtractionOutcome {
    let mut outcome = ExtractionOutcome::default();

    let Some((strategy, blocks)) = find_blocks(engine, document) else {
        return outcome;
    };
    outcome.strategy = Some(strategy);
    outcome.candidates = blocks.len();

    let mut seen_urls = HashSet::new();

    for block in blocks {
        if engine == SearchEngine::Yandex && block.select(&AD_LABEL).next().is_some() {
            outcome.skipped.advertisement += 1;
            continue;
        }

        let Some((title_element, title)) = first_with_text(block, title_selectors(engine)) else {
            outcome.skipped.missing_title += 1;
            continue;
        };

        // The title itself is the link on Yandex; Google wraps it in one.
        let href = title_element
            .value()
            .attr("href")
            .filter(|_| title_element.value().name() == "a")
            .or_else(|| block.select(&LINK).next().and_then(|a| a.value().attr("href")));
        let Some(href) = href else {
            outcome.skipped.missing_link += 1;
            continue;
        };

        let url = unwrap_redirect(href);
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            outcome.skipped.non_organic += 1;
            continue;
        }
        let Some(domain) = domain_of(&url) else {
            outcome.skipped.non_organic += 1;
            continue;
        };
        if engine.is_own_host(&domain) {
            outcome.skipped.non_organic += 1;
            continue;
        }
        if !seen_urls.insert(url.clone()) {
            outcome.skipped.duplicate += 1;
            continue;
        }

        let description = first_with_text(block, description_selectors(engine))
            .map(|(_, text)| text)
            .unwrap_or_default();

        outcome.results.push(OrganicResult {
            position: outcome.results.len() as u32 + 1,
            title,
            url,
            domain,
            description,
        });
    }

    outcome
}
