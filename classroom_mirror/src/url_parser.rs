//! Pulls Drive item IDs out of share links, editor links and free text.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::{MirrorError, Result};

const ID_CHARS: &str = "[a-zA-Z0-9_-]";

/// Link shapes that carry an item ID in their first capture group.
static LINK_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"^https?://drive\.google\.com/drive/(?:u/\d+/)?folders/(ID+)",
        r"^https?://drive\.google\.com/file/(?:u/\d+/)?d/(ID+)",
        r"^https?://docs\.google\.com/(?:document|spreadsheets|presentation|drawings|forms)/(?:u/\d+/)?d/(ID+)",
        r"^https?://drive\.google\.com/open\?(?:.*&)?id=(ID+)",
    ]
    .iter()
    .map(|p| Regex::new(&p.replace("ID", ID_CHARS)).expect("link pattern"))
    .collect()
});

static BARE_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!("^{}+$", ID_CHARS)).expect("bare id pattern"));

/// IDs pasted into descriptions are at least ten characters long.
static EMBEDDED_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?:/d/|[?&]id=)({}{{10,}})", ID_CHARS)).expect("embedded id pattern")
});

/// Resolve a user-supplied reference to a Drive ID.
///
/// Accepts folder and file share links (with or without a `/u/N/` account
/// segment), Docs editor links, `open?id=` links and bare IDs.
///
/// ```
/// use classroom_mirror::url_parser::extract_id;
///
/// assert_eq!(extract_id("https://drive.google.com/drive/folders/0Bx9Kq").unwrap(), "0Bx9Kq");
/// assert_eq!(extract_id(" 0Bx9Kq ").unwrap(), "0Bx9Kq");
/// assert!(extract_id("not a link!").is_err());
/// ```
pub fn extract_id(reference: &str) -> Result<String> {
    let candidate = reference.trim();

    let linked = LINK_PATTERNS
        .iter()
        .find_map(|re| re.captures(candidate).and_then(|c| c.get(1)));
    if let Some(id) = linked {
        return Ok(id.as_str().to_owned());
    }

    if BARE_ID.is_match(candidate) {
        Ok(candidate.to_owned())
    } else {
        Err(MirrorError::InvalidUrlOrId(reference.to_string()))
    }
}

/// Every distinct Drive ID linked from `text`, first occurrence first.
pub fn extract_linked_ids(text: &str) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    for caps in EMBEDDED_ID.captures_iter(text) {
        let id = &caps[1];
        if !ids.iter().any(|seen| seen == id) {
            ids.push(id.to_string());
        }
    }
    ids
}

pub fn open_url(id: &str) -> String {
    format!("https://drive.google.com/open?id={}", id)
}
