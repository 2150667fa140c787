use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;

pub const HASH_FIELD: &str = "hash";
pub const TIMESTAMP_FIELD: &str = "ts";
pub const ID_FIELD: &str = "id";
pub const PAGE_FIELD: &str = "page";

const CURSOR_FIELDS: [&str; 3] = [HASH_FIELD, TIMESTAMP_FIELD, ID_FIELD];

/// Field name to value; `None` marks a required field missing from the URL,
/// or, when writing, a field to remove.
pub type CursorFields = BTreeMap<String, Option<String>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CursorError {
    #[error("cursor `{0}` present without a page direction")]
    MissingDirection(String),
    #[error("page direction present without a cursor")]
    MissingCursor,
    #[error("unknown page direction `{0}`")]
    UnknownDirection(String),
    #[error("invalid timestamp cursor `{0}`")]
    InvalidTimestamp(String),
    #[error("field `{0}` is not declared by this pagination")]
    Undeclared(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Cursor {
    Hash(String),
    Timestamp(u64),
    Id(String),
}

impl Cursor {
    pub fn field(&self) -> &'static str {
        match self {
            Cursor::Hash(_) => HASH_FIELD,
            Cursor::Timestamp(_) => TIMESTAMP_FIELD,
            Cursor::Id(_) => ID_FIELD,
        }
    }

    pub fn value(&self) -> String {
        match self {
            Cursor::Hash(value) | Cursor::Id(value) => value.clone(),
            Cursor::Timestamp(ts) => ts.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Next,
    Previous,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Next => "next",
            Direction::Previous => "previous",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = CursorError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim() {
            "next" => Ok(Direction::Next),
            "previous" => Ok(Direction::Previous),
            other => Err(CursorError::UnknownDirection(other.to_string())),
        }
    }
}

/// Where a list screen sits in its feed. A cursor and its direction always
/// travel together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum PageRequest {
    #[default]
    First,
    Next(Cursor),
    Previous(Cursor),
}

impl PageRequest {
    pub fn new(cursor: Cursor, direction: Direction) -> Self {
        match direction {
            Direction::Next => PageRequest::Next(cursor),
            Direction::Previous => PageRequest::Previous(cursor),
        }
    }

    pub fn is_first(&self) -> bool {
        matches!(self, PageRequest::First)
    }

    pub fn cursor(&self) -> Option<&Cursor> {
        match self {
            PageRequest::First => None,
            PageRequest::Next(cursor) | PageRequest::Previous(cursor) => Some(cursor),
        }
    }

    pub fn direction(&self) -> Option<Direction> {
        match self {
            PageRequest::First => None,
            PageRequest::Next(_) => Some(Direction::Next),
            PageRequest::Previous(_) => Some(Direction::Previous),
        }
    }

    /// REST query parameters selecting this page.
    pub fn query_pairs(&self) -> Vec<(&'static str, String)> {
        match (self.cursor(), self.direction()) {
            (Some(cursor), Some(direction)) => vec![
                (cursor.field(), cursor.value()),
                (PAGE_FIELD, direction.as_str().to_string()),
            ],
            _ => Vec::new(),
        }
    }
}

/// Pagination state kept entirely in a URL query string. The field set is
/// fixed at construction.
#[derive(Debug, Clone)]
pub struct UrlPagination {
    required: BTreeSet<String>,
    optional: BTreeSet<String>,
}

impl UrlPagination {
    pub fn new(required: &[&str], optional: &[&str]) -> Self {
        Self {
            required: required.iter().map(|f| f.to_string()).collect(),
            optional: optional
                .iter()
                .filter(|f| !required.contains(*f))
                .map(|f| f.to_string())
                .collect(),
        }
    }

    /// The usual list-screen declaration: cursor fields, direction and sort.
    pub fn with_cursor_fields(required: &[&str]) -> Self {
        Self::new(
            required,
            &[HASH_FIELD, TIMESTAMP_FIELD, ID_FIELD, PAGE_FIELD, "sort", "order"],
        )
    }

    pub fn required(&self) -> impl Iterator<Item = &str> {
        self.required.iter().map(String::as_str)
    }

    pub fn optional(&self) -> impl Iterator<Item = &str> {
        self.optional.iter().map(String::as_str)
    }

    pub fn is_declared(&self, field: &str) -> bool {
        self.required.contains(field) || self.optional.contains(field)
    }

    pub fn is_optional(&self, field: &str) -> bool {
        self.optional.contains(field)
    }

    pub fn read_cursor(&self, url: &Url) -> CursorFields {
        let mut fields = CursorFields::new();
        for field in &self.required {
            fields.insert(field.clone(), query_value(url, field));
        }
        for field in &self.optional {
            if let Some(value) = query_value(url, field) {
                fields.insert(field.clone(), Some(value));
            }
        }
        fields
    }

    /// Writes the given declared fields into the query and returns the
    /// relative URL to navigate to. Keys outside the declared set, given or
    /// already in the URL, are left alone.
    pub fn write_cursor(&self, url: &Url, fields: &CursorFields) -> String {
        let provided: BTreeMap<&str, Option<&str>> = fields
            .iter()
            .filter(|(name, _)| self.is_declared(name))
            .map(|(name, value)| (name.as_str(), value.as_deref()))
            .collect();

        let mut written: BTreeSet<&str> = BTreeSet::new();
        let mut pairs: Vec<(String, String)> = Vec::new();
        for (name, value) in url.query_pairs() {
            match provided.get_key_value(&*name) {
                Some((&key, replacement)) => {
                    if !written.insert(key) {
                        continue;
                    }
                    if let Some(replacement) = replacement {
                        pairs.push((key.to_string(), replacement.to_string()));
                    }
                }
                None => pairs.push((name.into_owned(), value.into_owned())),
            }
        }
        for (name, value) in &provided {
            if written.contains(name) {
                continue;
            }
            if let Some(value) = value {
                pairs.push((name.to_string(), value.to_string()));
            }
        }

        let mut next = url.clone();
        set_query(&mut next, &pairs);
        relative_url(&next)
    }

    pub fn clear_optional_fields(&self, url: &mut Url) {
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .filter(|(name, _)| !self.is_optional(name))
            .map(|(name, value)| (name.into_owned(), value.into_owned()))
            .collect();
        set_query(url, &pairs);
    }

    pub fn page_request(&self, url: &Url) -> Result<PageRequest, CursorError> {
        let cursor = match CURSOR_FIELDS
            .iter()
            .find_map(|field| query_value(url, field).map(|value| (*field, value)))
        {
            Some((TIMESTAMP_FIELD, value)) => Some(Cursor::Timestamp(
                value
                    .parse::<u64>()
                    .map_err(|_| CursorError::InvalidTimestamp(value.clone()))?,
            )),
            Some((ID_FIELD, value)) => Some(Cursor::Id(value)),
            Some((_, value)) => Some(Cursor::Hash(value)),
            None => None,
        };
        let direction = query_value(url, PAGE_FIELD);
        match (cursor, direction) {
            (None, None) => Ok(PageRequest::First),
            (Some(cursor), Some(direction)) => {
                Ok(PageRequest::new(cursor, direction.parse::<Direction>()?))
            }
            (Some(cursor), None) => Err(CursorError::MissingDirection(cursor.value())),
            (None, Some(_)) => Err(CursorError::MissingCursor),
        }
    }

    /// Relative URL for `request`. Going back to the first page clears every
    /// optional field, sort order included.
    pub fn write_page(&self, url: &Url, request: &PageRequest) -> Result<String, CursorError> {
        let (Some(cursor), Some(direction)) = (request.cursor(), request.direction()) else {
            let mut first = url.clone();
            self.clear_optional_fields(&mut first);
            return Ok(relative_url(&first));
        };
        for field in [cursor.field(), PAGE_FIELD] {
            if !self.is_declared(field) {
                return Err(CursorError::Undeclared(field.to_string()));
            }
        }
        let mut fields = CursorFields::new();
        for field in CURSOR_FIELDS.iter().filter(|f| self.is_declared(f)) {
            fields.insert(field.to_string(), None);
        }
        fields.insert(cursor.field().to_string(), Some(cursor.value()));
        fields.insert(PAGE_FIELD.to_string(), Some(direction.as_str().to_string()));
        Ok(self.write_cursor(url, &fields))
    }
}

/// Path, query and fragment of `url`, for client-side navigation.
pub fn relative_url(url: &Url) -> String {
    let mut out = url.path().to_string();
    if let Some(query) = url.query() {
        out.push('?');
        out.push_str(query);
    }
    if let Some(fragment) = url.fragment() {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

fn query_value(url: &Url, field: &str) -> Option<String> {
    url.query_pairs()
        .find(|(name, _)| name == field)
        .map(|(_, value)| value.into_owned())
}

fn set_query(url: &mut Url, pairs: &[(String, String)]) {
    if pairs.is_empty() {
        url.set_query(None);
        return;
    }
    url.query_pairs_mut().clear().extend_pairs(pairs);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_pagination() -> UrlPagination {
        UrlPagination::new(&["token"], &["hash", "page", "sort", "order"])
    }

    fn location(query: &str) -> Url {
        Url::parse(&format!("https://explorer.test/token_detail/{query}")).expect("url")
    }

    #[test]
    fn read_cursor_reports_missing_required_as_none() {
        let url = location("?hash=00ab&page=next&tab=holders");
        let fields = token_pagination().read_cursor(&url);
        assert_eq!(fields.get("token"), Some(&None));
        assert_eq!(fields.get("hash"), Some(&Some("00ab".to_string())));
        assert_eq!(fields.get("page"), Some(&Some("next".to_string())));
        assert!(!fields.contains_key("sort"));
        assert!(!fields.contains_key("tab"));
    }

    #[test]
    fn write_cursor_round_trip_is_idempotent() {
        let pagination = token_pagination();
        let url = location("?token=cafe&tab=holders&hash=00ab&page=previous&sort=desc#top");
        let fields = pagination.read_cursor(&url);
        let written = pagination.write_cursor(&url, &fields);
        let reparsed = url.join(&written).expect("join");
        assert_eq!(pagination.read_cursor(&reparsed), fields);
        assert_eq!(
            written,
            "/token_detail/?token=cafe&tab=holders&hash=00ab&page=previous&sort=desc#top"
        );
    }

    #[test]
    fn write_cursor_leaves_undeclared_fields_untouched() {
        let pagination = token_pagination();
        let url = location("?tab=holders&token=cafe");
        let mut fields = CursorFields::new();
        fields.insert("hash".into(), Some("0f".into()));
        fields.insert("page".into(), Some("next".into()));
        fields.insert("tab".into(), Some("overwritten".into()));
        let written = pagination.write_cursor(&url, &fields);
        assert_eq!(written, "/token_detail/?tab=holders&token=cafe&hash=0f&page=next");
    }

    #[test]
    fn write_cursor_removes_fields_set_to_none() {
        let pagination = token_pagination();
        let url = location("?token=cafe&hash=0f&page=next");
        let mut fields = CursorFields::new();
        fields.insert("hash".into(), None);
        fields.insert("page".into(), None);
        assert_eq!(pagination.write_cursor(&url, &fields), "/token_detail/?token=cafe");
    }

    #[test]
    fn clear_optional_fields_keeps_required_only() {
        let pagination = token_pagination();
        let mut url = location("?token=cafe&hash=0f&page=next&sort=asc&order=ts&tab=holders");
        pagination.clear_optional_fields(&mut url);
        let fields = pagination.read_cursor(&url);
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.get("token"), Some(&Some("cafe".to_string())));
        assert_eq!(url.query(), Some("token=cafe&tab=holders"));
    }

    #[test]
    fn clear_optional_fields_drops_empty_query() {
        let pagination = token_pagination();
        let mut url = location("?hash=0f&page=next");
        pagination.clear_optional_fields(&mut url);
        assert_eq!(url.query(), None);
        assert_eq!(relative_url(&url), "/token_detail/");
    }

    #[test]
    fn page_request_reads_tagged_variant() {
        let pagination = UrlPagination::with_cursor_fields(&[]);
        assert_eq!(
            pagination.page_request(&location("")),
            Ok(PageRequest::First)
        );
        assert_eq!(
            pagination.page_request(&location("?hash=ab&page=next")),
            Ok(PageRequest::Next(Cursor::Hash("ab".into())))
        );
        assert_eq!(
            pagination.page_request(&location("?ts=1700&page=previous")),
            Ok(PageRequest::Previous(Cursor::Timestamp(1700)))
        );
        assert_eq!(
            pagination.page_request(&location("?id=7&page=next")),
            Ok(PageRequest::Next(Cursor::Id("7".into())))
        );
    }

    #[test]
    fn page_request_rejects_unpaired_fields() {
        let pagination = UrlPagination::with_cursor_fields(&[]);
        assert_eq!(
            pagination.page_request(&location("?hash=ab")),
            Err(CursorError::MissingDirection("ab".into()))
        );
        assert_eq!(
            pagination.page_request(&location("?page=next")),
            Err(CursorError::MissingCursor)
        );
        assert_eq!(
            pagination.page_request(&location("?hash=ab&page=sideways")),
            Err(CursorError::UnknownDirection("sideways".into()))
        );
        assert_eq!(
            pagination.page_request(&location("?ts=soon&page=next")),
            Err(CursorError::InvalidTimestamp("soon".into()))
        );
    }

    #[test]
    fn write_page_swaps_cursor_kind_and_clears_on_first() {
        let pagination = UrlPagination::with_cursor_fields(&["type"]);
        let url = location("?type=block&hash=ab&page=next&sort=asc");
        let older = pagination
            .write_page(&url, &PageRequest::Next(Cursor::Timestamp(99)))
            .expect("next");
        assert_eq!(older, "/token_detail/?type=block&page=next&sort=asc&ts=99");

        let first = pagination
            .write_page(&url, &PageRequest::First)
            .expect("first");
        assert_eq!(first, "/token_detail/?type=block");
    }

    #[test]
    fn write_page_requires_declared_cursor_field() {
        let pagination = UrlPagination::new(&[], &["hash", "page"]);
        let url = location("");
        assert_eq!(
            pagination.write_page(&url, &PageRequest::Next(Cursor::Id("1".into()))),
            Err(CursorError::Undeclared("id".into()))
        );
    }

    #[test]
    fn query_pairs_carry_cursor_and_direction() {
        assert!(PageRequest::First.query_pairs().is_empty());
        assert_eq!(
            PageRequest::Previous(Cursor::Hash("ab".into())).query_pairs(),
            vec![("hash", "ab".to_string()), ("page", "previous".to_string())]
        );
    }
}
