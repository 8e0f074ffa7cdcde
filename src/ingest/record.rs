//! One JSON line of a shard → [`PostRecord`].
//!
//! Accepts both the compact contract (`favcount`, `width`, `type`,
//! `captions{}`) and the field names used by the published caption dumps
//! (`fav_count`, `image_width`, `file_ext`, `tag_string`, flat summary
//! fields).

use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;

use crate::database::repo::{CaptionKind, PostRecord};
use crate::error::RecordError;
use crate::query::ast::{normalize_tag, FileType, Rating};

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TagList {
    List(Vec<String>),
    Joined(String),
    Categorized(BTreeMap<String, Vec<String>>),
}

impl TagList {
    fn into_names(self) -> Vec<String> {
        match self {
            TagList::List(list) => list,
            TagList::Joined(joined) => joined.split_whitespace().map(str::to_string).collect(),
            TagList::Categorized(groups) => groups.into_values().flatten().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Score {
    Plain(i64),
    Detailed { total: i64 },
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    id: Option<i64>,
    #[serde(default)]
    tags: Option<TagList>,
    #[serde(default)]
    tag_string: Option<String>,
    rating: Option<String>,
    #[serde(default)]
    score: Option<Score>,
    #[serde(default, alias = "fav_count")]
    favcount: Option<i64>,
    #[serde(default, alias = "image_width")]
    width: Option<i64>,
    #[serde(default, alias = "image_height")]
    height: Option<i64>,
    #[serde(default, alias = "file_size")]
    filesize: Option<i64>,
    #[serde(default, rename = "type", alias = "file_ext")]
    file_type: Option<String>,
    #[serde(default)]
    md5: Option<String>,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    captions: Option<HashMap<String, Option<String>>>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    regular_summary: Option<String>,
    #[serde(default)]
    individual_parts: Option<String>,
    #[serde(default)]
    midjourney_style_summary: Option<String>,
    #[serde(default)]
    deviantart_commission_request: Option<String>,
}

/// Decode one raw shard line. Bytes that are not UTF-8 make a bad record,
/// not a bad shard.
pub fn parse_bytes(line: &[u8], shard: &str, line_no: u64) -> Result<PostRecord, RecordError> {
    let text = std::str::from_utf8(line).map_err(|e| RecordError {
        shard: shard.to_string(),
        line: line_no,
        reason: format!("invalid utf-8: {}", e),
    })?;
    parse_line(text, shard, line_no)
}

pub fn parse_line(line: &str, shard: &str, line_no: u64) -> Result<PostRecord, RecordError> {
    let fail = |reason: String| RecordError {
        shard: shard.to_string(),
        line: line_no,
        reason,
    };

    let wire: WireRecord = serde_json::from_str(line).map_err(|e| fail(format!("invalid json: {}", e)))?;
    normalize(wire).map_err(fail)
}

fn normalize(wire: WireRecord) -> Result<PostRecord, String> {
    let id = wire.id.ok_or("missing id")?;
    let rating_raw = wire.rating.as_deref().ok_or("missing rating")?;
    let rating = Rating::parse(rating_raw).ok_or_else(|| format!("unknown rating '{}'", rating_raw))?;
    let type_raw = wire.file_type.as_deref().ok_or("missing file type")?;
    let file_type =
        FileType::parse(type_raw).ok_or_else(|| format!("unknown file type '{}'", type_raw))?;

    let mut tags: Vec<String> = wire
        .tags
        .map(TagList::into_names)
        .unwrap_or_default()
        .into_iter()
        .chain(
            wire.tag_string
                .iter()
                .flat_map(|s| s.split_whitespace().map(str::to_string)),
        )
        .map(|t| normalize_tag(&t))
        .filter(|t| !t.is_empty())
        .collect();
    tags.sort();
    tags.dedup();

    let mut captions: BTreeMap<CaptionKind, String> = BTreeMap::new();
    for (kind, body) in wire.captions.unwrap_or_default() {
        if let (Some(kind), Some(body)) = (CaptionKind::parse(&kind), body) {
            captions.insert(kind, body);
        }
    }
    let flat = [
        (CaptionKind::Tags, wire.description),
        (CaptionKind::Summary, wire.regular_summary),
        (CaptionKind::Parts, wire.individual_parts),
        (CaptionKind::Midjourney, wire.midjourney_style_summary),
        (CaptionKind::Commission, wire.deviantart_commission_request),
    ];
    for (kind, body) in flat {
        if let Some(body) = body {
            captions.entry(kind).or_insert(body);
        }
    }
    captions.retain(|_, body| !body.trim().is_empty());

    Ok(PostRecord {
        id,
        rating,
        score: match wire.score {
            Some(Score::Plain(v)) | Some(Score::Detailed { total: v }) => v,
            None => 0,
        },
        fav_count: wire.favcount.unwrap_or(0),
        width: wire.width.unwrap_or(0),
        height: wire.height.unwrap_or(0),
        file_size: wire.filesize.unwrap_or(0),
        file_type,
        md5: wire.md5,
        source: wire.source,
        created_at: wire.created_at,
        tags,
        captions: captions.into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_shape() {
        let line = r#"{"id": 42, "tags": ["Wolf", " long   hair ", "wolf"], "rating": "s", "score": 12,
            "favcount": 3, "width": 800, "height": 600, "filesize": 2048, "type": "PNG",
            "captions": {"summary": "A wolf.", "midjourney": "wolf --ar 4:3", "bogus": "x"}}"#;
        let post = parse_line(line, "a.jsonl", 1).unwrap();
        assert_eq!(post.id, 42);
        assert_eq!(post.tags, vec!["long hair".to_string(), "wolf".to_string()]);
        assert_eq!(post.rating, Rating::Safe);
        assert_eq!(post.file_type, FileType::Png);
        assert_eq!((post.score, post.fav_count, post.width, post.height, post.file_size), (12, 3, 800, 600, 2048));
        assert_eq!(
            post.captions,
            vec![
                (CaptionKind::Summary, "A wolf.".to_string()),
                (CaptionKind::Midjourney, "wolf --ar 4:3".to_string()),
            ]
        );
    }

    #[test]
    fn test_dump_shape() {
        let line = r#"{"id": 7, "tag_string": "canine fox solo", "rating": "e", "file_ext": "jpg",
            "score": {"up": 10, "down": -2, "total": 8}, "fav_count": 30, "image_width": 10,
            "image_height": 20, "file_size": 99, "md5": "abc",
            "regular_summary": "A fox.", "individual_parts": "", "deviantart_commission_request": "Please"}"#;
        let post = parse_line(line, "a.jsonl", 2).unwrap();
        assert_eq!(post.tags, vec!["canine", "fox", "solo"]);
        assert_eq!(post.score, 8);
        assert_eq!(post.fav_count, 30);
        assert_eq!(post.md5.as_deref(), Some("abc"));
        assert_eq!(
            post.captions,
            vec![
                (CaptionKind::Summary, "A fox.".to_string()),
                (CaptionKind::Commission, "Please".to_string()),
            ]
        );
    }

    #[test]
    fn test_categorized_tags() {
        let line = r#"{"id": 1, "rating": "q", "type": "gif",
            "tags": {"general": ["solo"], "species": ["fox"]}}"#;
        let post = parse_line(line, "a.jsonl", 3).unwrap();
        assert_eq!(post.tags, vec!["fox", "solo"]);
    }

    #[test]
    fn test_invalid_utf8_is_a_record_error() {
        let mut line = br#"{"id": 2, "rating": "s", "type": "png", "tags": ["fo"#.to_vec();
        line.extend_from_slice(b"\xff\xfe\"]}\n");
        let err = parse_bytes(&line, "a.jsonl", 2).unwrap_err();
        assert_eq!((err.shard.as_str(), err.line), ("a.jsonl", 2));
        assert!(err.reason.starts_with("invalid utf-8"));

        let ok = parse_bytes(b"{\"id\": 3, \"rating\": \"s\", \"type\": \"png\"}\r\n", "a.jsonl", 3).unwrap();
        assert_eq!(ok.id, 3);
    }

    #[test]
    fn test_malformed_records_report_location() {
        let err = parse_line("{not json", "b.jsonl", 17).unwrap_err();
        assert_eq!((err.shard.as_str(), err.line), ("b.jsonl", 17));

        let err = parse_line(r#"{"rating": "s", "type": "png"}"#, "b.jsonl", 18).unwrap_err();
        assert_eq!(err.reason, "missing id");

        let err = parse_line(r#"{"id": 1, "rating": "z", "type": "png"}"#, "b.jsonl", 19).unwrap_err();
        assert!(err.reason.contains("rating"));

        let err = parse_line(r#"{"id": 1, "rating": "s", "type": "bmp"}"#, "b.jsonl", 20).unwrap_err();
        assert!(err.reason.contains("file type"));
    }
}
