use crate::store::{CollectionMember, MemberKind};
use anyhow::{bail, Context, Result};
use quick_xml::{events::Event, Reader};
use serde::Deserialize;
use std::time::Duration;

const COLLECTION_DETAILS_URL: &str =
    "https://api.steampowered.com/ISteamRemoteStorage/GetCollectionDetails/v1/";
const FILE_DETAILS_URL: &str =
    "https://api.steampowered.com/ISteamRemoteStorage/GetPublishedFileDetails/v1/";
const FILE_DETAILS_PAGE_URL: &str = "https://steamcommunity.com/sharedfiles/filedetails/";
const USER_AGENT: &str = "stoker";

/// Remote source of catalog facts. The synchronizer only talks to this trait
/// so its closure protocol can be driven by a fake in tests.
pub trait CatalogSource {
    /// Batch collection lookup. Returns one result per input id, in input
    /// order, members sorted by the remote's declared sort order.
    fn collection_details(&self, ids: &[u64]) -> Result<Vec<CollectionDetails>>;

    /// Batch item metadata lookup. Returns one result per input id, in input
    /// order.
    fn file_details(&self, ids: &[u64]) -> Result<Vec<FileDetails>>;

    /// Scrapes the item's rendered workshop page for its required items.
    /// Best effort: a garbled page yields whatever was parsed before the
    /// tokenizer gave up.
    fn file_details_web(&self, id: u64) -> Result<WebFileDetails>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionDetails {
    pub id: u64,
    pub members: Vec<CollectionMember>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDetails {
    pub id: u64,
    pub creator_app_id: u64,
    pub time_created: i64,
    pub time_updated: i64,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WebFileDetails {
    pub title: String,
    pub required_items: Vec<RequiredItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredItem {
    pub id: u64,
    pub title: String,
}

pub struct WorkshopClient {
    agent: ureq::Agent,
}

impl WorkshopClient {
    pub fn new() -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(Duration::from_secs(10))
            .timeout_read(Duration::from_secs(60))
            .timeout_write(Duration::from_secs(60))
            .build();
        Self { agent }
    }

    fn post_form(&self, url: &str, form: &[(String, String)]) -> Result<String> {
        let pairs: Vec<(&str, &str)> = form
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
            .collect();
        let response = self
            .agent
            .post(url)
            .set("User-Agent", USER_AGENT)
            .set("Accept", "application/json")
            .send_form(&pairs)
            .with_context(|| format!("post {url}"))?;
        response.into_string().context("read response body")
    }
}

impl Default for WorkshopClient {
    fn default() -> Self {
        Self::new()
    }
}

impl CatalogSource for WorkshopClient {
    fn collection_details(&self, ids: &[u64]) -> Result<Vec<CollectionDetails>> {
        let mut form = vec![("collectioncount".to_string(), ids.len().to_string())];
        for (index, id) in ids.iter().enumerate() {
            form.push((format!("publishedfileids[{index}]"), id.to_string()));
        }
        let body = self
            .post_form(COLLECTION_DETAILS_URL, &form)
            .context("fetch collection details")?;
        parse_collection_details(ids, &body)
    }

    fn file_details(&self, ids: &[u64]) -> Result<Vec<FileDetails>> {
        let mut form = vec![("itemcount".to_string(), ids.len().to_string())];
        for (index, id) in ids.iter().enumerate() {
            form.push((format!("publishedfileids[{index}]"), id.to_string()));
        }
        let body = self
            .post_form(FILE_DETAILS_URL, &form)
            .context("fetch file details")?;
        parse_file_details(ids, &body)
    }

    fn file_details_web(&self, id: u64) -> Result<WebFileDetails> {
        let response = self
            .agent
            .get(FILE_DETAILS_PAGE_URL)
            .query("id", &id.to_string())
            .set("User-Agent", USER_AGENT)
            .call()
            .with_context(|| format!("fetch workshop page of {id}"))?;
        let body = response.into_string().context("read workshop page")?;
        Ok(parse_file_details_page(body.as_bytes()))
    }
}

#[derive(Debug, Deserialize)]
struct CollectionDetailsResponse {
    response: CollectionDetailsInner,
}

#[derive(Debug, Deserialize)]
struct CollectionDetailsInner {
    #[serde(default)]
    collectiondetails: Vec<RawCollectionDetail>,
}

#[derive(Debug, Deserialize)]
struct RawCollectionDetail {
    publishedfileid: String,
    #[serde(default)]
    children: Vec<RawCollectionChild>,
}

#[derive(Debug, Deserialize)]
struct RawCollectionChild {
    publishedfileid: String,
    #[serde(default)]
    sortorder: i64,
    #[serde(default)]
    filetype: i64,
}

fn parse_collection_details(ids: &[u64], body: &str) -> Result<Vec<CollectionDetails>> {
    let response: CollectionDetailsResponse =
        serde_json::from_str(body).context("decode collection details response")?;
    let details = response.response.collectiondetails;
    if details.len() != ids.len() {
        bail!("expected {} collection results, got {}", ids.len(), details.len());
    }

    let mut results: Vec<Option<CollectionDetails>> = vec![None; ids.len()];
    for detail in details {
        let id: u64 = detail
            .publishedfileid
            .parse()
            .with_context(|| format!("collection id {}", detail.publishedfileid))?;
        let index = match ids.iter().position(|requested| *requested == id) {
            Some(index) => index,
            None => bail!("unexpected collection {id} returned"),
        };

        let mut children = detail.children;
        children.sort_by_key(|child| child.sortorder);
        let mut members = Vec::with_capacity(children.len());
        for child in children {
            members.push(CollectionMember {
                id: child
                    .publishedfileid
                    .parse()
                    .with_context(|| format!("member id {}", child.publishedfileid))?,
                kind: member_kind(child.filetype),
            });
        }
        results[index] = Some(CollectionDetails { id, members });
    }

    results
        .into_iter()
        .zip(ids)
        .map(|(result, id)| result.with_context(|| format!("no result for collection {id}")))
        .collect()
}

fn member_kind(filetype: i64) -> MemberKind {
    match filetype {
        0 => MemberKind::Item,
        2 => MemberKind::Collection,
        _ => MemberKind::Unrecognized,
    }
}

#[derive(Debug, Deserialize)]
struct FileDetailsResponse {
    response: FileDetailsInner,
}

#[derive(Debug, Deserialize)]
struct FileDetailsInner {
    #[serde(default)]
    publishedfiledetails: Vec<RawFileDetail>,
}

#[derive(Debug, Deserialize)]
struct RawFileDetail {
    publishedfileid: String,
    #[serde(default)]
    creator_app_id: u64,
    #[serde(default)]
    time_created: i64,
    #[serde(default)]
    time_updated: i64,
    #[serde(default)]
    title: String,
}

fn parse_file_details(ids: &[u64], body: &str) -> Result<Vec<FileDetails>> {
    let response: FileDetailsResponse =
        serde_json::from_str(body).context("decode file details response")?;
    let details = response.response.publishedfiledetails;
    if details.len() != ids.len() {
        bail!("expected {} file results, got {}", ids.len(), details.len());
    }

    let mut results: Vec<Option<FileDetails>> = vec![None; ids.len()];
    for detail in details {
        let id: u64 = detail
            .publishedfileid
            .parse()
            .with_context(|| format!("file id {}", detail.publishedfileid))?;
        let index = match ids.iter().position(|requested| *requested == id) {
            Some(index) => index,
            None => bail!("unexpected file detail {id} returned"),
        };
        results[index] = Some(FileDetails {
            id,
            creator_app_id: detail.creator_app_id,
            time_created: detail.time_created,
            time_updated: detail.time_updated,
            title: detail.title,
        });
    }

    results
        .into_iter()
        .zip(ids)
        .map(|(result, id)| result.with_context(|| format!("no result for file {id}")))
        .collect()
}

/// Tracks the open/close depth of one element so nested tags with the same
/// name do not end the tracked region early.
#[derive(Default)]
struct DepthTracker {
    tag: Vec<u8>,
    depth: usize,
}

impl DepthTracker {
    fn active(&self) -> bool {
        !self.tag.is_empty()
    }

    fn reset(&mut self, tag: &[u8]) {
        self.tag = tag.to_vec();
        self.depth = 1;
    }

    fn enter(&mut self, tag: &[u8]) {
        if self.active() && tag == self.tag.as_slice() {
            self.depth += 1;
        }
    }

    fn leave(&mut self, tag: &[u8]) -> bool {
        if !self.active() || tag != self.tag.as_slice() {
            return false;
        }
        self.depth -= 1;
        if self.depth > 0 {
            return false;
        }
        self.tag.clear();
        true
    }
}

/// Extracts the item title and its required items from the rendered workshop
/// page:
///   title: text of the element with class `workshopItemTitle`
///   required items: anchors under `#RequiredItems`; the id comes from the
///   href's `id` query parameter, the title from the anchor's text.
pub fn parse_file_details_page(html: &[u8]) -> WebFileDetails {
    let mut reader = Reader::from_reader(html);
    reader.trim_text(true);
    reader.check_end_names(false);
    let mut buf = Vec::new();
    let mut details = WebFileDetails::default();
    let mut next_is_title = false;
    let mut container = DepthTracker::default();
    let mut anchor = DepthTracker::default();
    let mut pending: Option<RequiredItem> = None;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                let name = e.name().as_ref().to_vec();
                container.enter(&name);
                anchor.enter(&name);
                if attr_value(&e, b"class").as_deref() == Some("workshopItemTitle") {
                    next_is_title = true;
                } else if attr_value(&e, b"id").as_deref() == Some("RequiredItems") {
                    container.reset(&name);
                } else if container.active() && !anchor.active() && name == b"a" {
                    let id = attr_value(&e, b"href")
                        .as_deref()
                        .and_then(item_id_from_href);
                    if let Some(id) = id {
                        pending = Some(RequiredItem {
                            id,
                            title: String::new(),
                        });
                        anchor.reset(&name);
                    }
                }
            }
            Ok(Event::End(e)) => {
                let name = e.name().as_ref().to_vec();
                if anchor.leave(&name) {
                    if let Some(item) = pending.take() {
                        details.required_items.push(item);
                    }
                }
                if container.leave(&name) {
                    break;
                }
            }
            Ok(Event::Text(text)) => {
                let text = match text.unescape() {
                    Ok(unescaped) => unescaped.into_owned(),
                    Err(_) => String::from_utf8_lossy(text.as_ref()).into_owned(),
                };
                if next_is_title {
                    details.title = text.trim().to_string();
                    next_is_title = false;
                } else if let Some(item) = pending.as_mut() {
                    item.title.push_str(text.trim());
                }
            }
            Ok(Event::Eof) => break,
            // Workshop pages are not well-formed markup. Keep what was
            // parsed so far.
            Err(_) => break,
            _ => {}
        }
        buf.clear();
    }

    details
}

fn item_id_from_href(href: &str) -> Option<u64> {
    let query = href.split_once('?')?.1;
    query
        .split('&')
        .find_map(|pair| pair.strip_prefix("id="))
        .and_then(|id| id.parse().ok())
}

fn attr_value(e: &quick_xml::events::BytesStart<'_>, key: &[u8]) -> Option<String> {
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == key {
            if let Ok(value) = attr.unescape_value() {
                return Some(value.to_string());
            }
        }
    }
    None
}
