//! vCard text codec.
//!
//! Only the properties the reconciler reasons about are interpreted. Every other
//! content line is carried through [`RemoteRecord::preserved`] unchanged, so a
//! decode followed by an encode never loses data the server holds.

use contact_sync_core::{Photo, RemoteRecord, SyncError};

const FOLD_WIDTH: usize = 75;

struct ContentLine<'a> {
    raw: &'a str,
    name: String,
    params: &'a str,
    value: &'a str,
}

/// Decode every `BEGIN:VCARD`..`END:VCARD` block in `text`.
///
/// # Errors
/// Returns [`SyncError::Decode`] for a content line without a value separator,
/// an unterminated card, or text that contains no card at all.
pub fn decode_all(text: &str) -> Result<Vec<RemoteRecord>, SyncError> {
    let mut cards = Vec::new();
    let mut current: Option<RemoteRecord> = None;

    for (number, line) in unfold(text).iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let content = parse_line(line).ok_or_else(|| {
            SyncError::Decode(format!("line {}: missing ':' in {line:?}", number + 1))
        })?;

        match (content.name.as_str(), current.as_mut()) {
            ("BEGIN", None) if content.value.eq_ignore_ascii_case("VCARD") => {
                current = Some(RemoteRecord::default());
            }
            ("BEGIN", Some(_)) => {
                return Err(SyncError::Decode("nested BEGIN:VCARD".to_string()));
            }
            ("END", Some(_)) if content.value.eq_ignore_ascii_case("VCARD") => {
                if let Some(card) = current.take() {
                    cards.push(card);
                }
            }
            (_, Some(card)) => apply_property(card, &content),
            (_, None) => {
                return Err(SyncError::Decode(format!(
                    "line {}: content outside of a card",
                    number + 1
                )));
            }
        }
    }

    if current.is_some() {
        return Err(SyncError::Decode("unterminated vCard".to_string()));
    }
    if cards.is_empty() {
        return Err(SyncError::Decode("no vCard found".to_string()));
    }
    Ok(cards)
}

/// Decode the first card of `text`.
///
/// # Errors
/// Same as [`decode_all`].
pub fn decode(text: &str) -> Result<RemoteRecord, SyncError> {
    decode_all(text)?
        .into_iter()
        .next()
        .ok_or_else(|| SyncError::Decode("no vCard found".to_string()))
}

/// Single-value properties keep their first occurrence; later repeats are
/// dropped so an edited value is never shadowed by a stale copy on encode.
fn apply_property(card: &mut RemoteRecord, line: &ContentLine<'_>) {
    match line.name.as_str() {
        "VERSION" => {}
        "FN" => {
            if card.display_name.is_empty() {
                card.display_name = unescape(line.value);
            }
        }
        "N" => {
            if card.sort_name.is_empty() {
                card.sort_name = line.value.to_string();
            }
        }
        "UID" => {
            if card.uid.is_empty() {
                card.uid = unescape(line.value);
            }
        }
        "EMAIL" => card.emails.push(unescape(line.value)),
        "TEL" => card.phones.push(unescape(line.value)),
        "NOTE" => {
            card.note.get_or_insert_with(|| unescape(line.value));
        }
        "PHOTO" => {
            card.photo.get_or_insert_with(|| Photo {
                params: line.params.to_string(),
                value: line.value.to_string(),
            });
        }
        "REV" => {
            card.revision.get_or_insert_with(|| line.value.to_string());
        }
        _ => card.preserved.push(line.raw.to_string()),
    }
}

/// Serialize one record as vCard 4.0 with CRLF line endings and folded lines.
#[must_use]
pub fn encode(record: &RemoteRecord) -> String {
    let mut lines: Vec<String> = vec!["BEGIN:VCARD".to_string(), "VERSION:4.0".to_string()];
    lines.push(format!("FN:{}", escape(&record.display_name)));
    lines.push(format!("N:{}", record.sort_name.replace('\n', "\\n")));
    if !record.uid.is_empty() {
        lines.push(format!("UID:{}", escape(&record.uid)));
    }
    lines.extend(record.emails.iter().map(|email| format!("EMAIL:{}", escape(email))));
    lines.extend(record.phones.iter().map(|phone| format!("TEL;TYPE=cell:{}", escape(phone))));
    if let Some(note) = record.note.as_deref() {
        lines.push(format!("NOTE:{}", escape(note)));
    }
    if let Some(photo) = record.photo.as_ref() {
        if photo.params.is_empty() {
            lines.push(format!("PHOTO:{}", photo.value));
        } else {
            lines.push(format!("PHOTO;{}:{}", photo.params, photo.value));
        }
    }
    if let Some(revision) = record.revision.as_deref() {
        lines.push(format!("REV:{revision}"));
    }
    lines.extend(record.preserved.iter().cloned());
    lines.push("END:VCARD".to_string());

    let mut out = String::new();
    for line in &lines {
        fold_into(&mut out, line);
    }
    out
}

/// Encode several records into one multi-card document.
#[must_use]
pub fn encode_all(records: &[RemoteRecord]) -> String {
    records.iter().map(encode).collect()
}

fn unfold(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for physical in text.split('\n') {
        let physical = physical.strip_suffix('\r').unwrap_or(physical);
        match (physical.strip_prefix([' ', '\t']), lines.last_mut()) {
            (Some(continuation), Some(previous)) => previous.push_str(continuation),
            _ => lines.push(physical.to_string()),
        }
    }
    lines
}

fn parse_line(line: &str) -> Option<ContentLine<'_>> {
    let mut quoted = false;
    let mut split = None;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => quoted = !quoted,
            ':' if !quoted => {
                split = Some(index);
                break;
            }
            _ => {}
        }
    }
    let split = split?;
    let (head, value) = (&line[..split], &line[split + 1..]);
    let (name, params) = head.split_once(';').unwrap_or((head, ""));
    // Drop an `item1.` style group prefix.
    let name = name.rsplit_once('.').map_or(name, |(_, name)| name);
    Some(ContentLine { raw: line, name: name.trim().to_ascii_uppercase(), params, value })
}

fn fold_into(out: &mut String, line: &str) {
    let mut width = 0;
    for ch in line.chars() {
        let len = ch.len_utf8();
        if width + len > FOLD_WIDTH {
            out.push_str("\r\n ");
            width = 1;
        }
        out.push(ch);
        width += len;
    }
    out.push_str("\r\n");
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => {}
            ',' => out.push_str("\\,"),
            ';' => out.push_str("\\;"),
            _ => out.push(ch),
        }
    }
    out
}

fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('n' | 'N') => out.push('\n'),
            Some(escaped @ (',' | ';' | '\\')) => out.push(escaped),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const APPLE_CARD: &str = "BEGIN:VCARD\r\nVERSION:3.0\r\n\
        PRODID:-//Apple Inc.//iPhone OS 17.0//EN\r\nN:Doe;Jane;;;\r\nFN:Jane Doe\r\n\
        item1.EMAIL;type=INTERNET;type=pref:jane@example.com\r\n\
        item1.X-ABLabel:_$!<Other>!$_\r\nTEL;type=CELL;type=VOICE:+1 (480) 395-7551\r\n\
        NOTE:met at conf\\, 2019\\nsecond line\r\nUID:ABC-123\r\n\
        REV:2024-01-02T03:04:05Z\r\nEND:VCARD\r\n";

    fn decoded(text: &str) -> RemoteRecord {
        match decode(text) {
            Ok(card) => card,
            Err(err) => panic!("decode failed: {err}"),
        }
    }

    #[test]
    fn decodes_interpreted_properties() {
        let card = decoded(APPLE_CARD);
        assert_eq!(card.display_name, "Jane Doe");
        assert_eq!(card.sort_name, "Doe;Jane;;;");
        assert_eq!(card.emails, vec!["jane@example.com".to_string()]);
        assert_eq!(card.phones, vec!["+1 (480) 395-7551".to_string()]);
        assert_eq!(card.note.as_deref(), Some("met at conf, 2019\nsecond line"));
        assert_eq!(card.uid, "ABC-123");
        assert_eq!(card.revision.as_deref(), Some("2024-01-02T03:04:05Z"));
        assert_eq!(
            card.preserved,
            vec![
                "PRODID:-//Apple Inc.//iPhone OS 17.0//EN".to_string(),
                "item1.X-ABLabel:_$!<Other>!$_".to_string(),
            ]
        );
    }

    #[test]
    fn unfolds_continuation_lines() {
        let text = "BEGIN:VCARD\nFN:Jane\n  Doe\nNOTE:a\n\tb\nEND:VCARD\n";
        let card = decoded(text);
        assert_eq!(card.display_name, "Jane Doe");
        assert_eq!(card.note.as_deref(), Some("ab"));
    }

    #[test]
    fn quoted_parameter_may_contain_colon() {
        let text = "BEGIN:VCARD\nFN:Jane\nX-SOCIAL;LABEL=\"a:b\":value:with:colons\nEND:VCARD\n";
        let card = decoded(text);
        assert_eq!(card.preserved, vec!["X-SOCIAL;LABEL=\"a:b\":value:with:colons".to_string()]);
    }

    #[test]
    fn photo_keeps_parameters_and_payload() {
        let text = "BEGIN:VCARD\nFN:Jane\nPHOTO;ENCODING=b;TYPE=JPEG:aW1n\nEND:VCARD\n";
        let card = decoded(text);
        assert_eq!(card.photo, Some(Photo::jpeg_base64("aW1n".to_string())));
        assert!(encode(&card).contains("PHOTO;ENCODING=b;TYPE=JPEG:aW1n\r\n"));
    }

    #[test]
    fn repeated_single_value_properties_do_not_outlive_an_edit() {
        let text = "BEGIN:VCARD\nFN:Old Name\nFN:Old Alias\nPHOTO:AAAA\nPHOTO:BBBB\nEND:VCARD\n";
        let mut card = decoded(text);
        assert!(card.preserved.is_empty());

        card.display_name = "New Name".to_string();
        card.photo = Some(Photo::jpeg_base64("CCCC".to_string()));
        let encoded = encode(&card);

        assert!(encoded.contains("FN:New Name\r\n"));
        assert!(!encoded.contains("Old Alias"));
        assert_eq!(encoded.matches("PHOTO").count(), 1);
        assert!(!encoded.contains("BBBB"));
    }

    #[test]
    fn decodes_multiple_cards() {
        let text = "BEGIN:VCARD\nFN:A\nEND:VCARD\nBEGIN:VCARD\nFN:B\nEND:VCARD\n";
        let cards = match decode_all(text) {
            Ok(cards) => cards,
            Err(err) => panic!("decode failed: {err}"),
        };
        let names: Vec<&str> = cards.iter().map(|card| card.display_name.as_str()).collect();
        assert_eq!(names, vec!["A", "B"]);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(matches!(decode(""), Err(SyncError::Decode(_))));
        assert!(matches!(decode("BEGIN:VCARD\nFN:A\n"), Err(SyncError::Decode(_))));
        let no_separator = decode("BEGIN:VCARD\nnot a property\nEND:VCARD");
        assert!(matches!(no_separator, Err(SyncError::Decode(_))));
        assert!(matches!(decode("FN:A\n"), Err(SyncError::Decode(_))));
    }

    #[test]
    fn encode_emits_canonical_layout() {
        let record = RemoteRecord {
            display_name: "Doe, Jane".to_string(),
            sort_name: "Doe, Jane".to_string(),
            emails: vec!["jane@example.com".to_string()],
            phones: vec!["+1 480 395 7551".to_string()],
            note: Some("line1\nline2".to_string()),
            uid: "uid-1".to_string(),
            revision: Some("20231114T221320Z".to_string()),
            preserved: vec!["X-CUSTOM:kept".to_string()],
            ..RemoteRecord::default()
        };
        assert_eq!(
            encode(&record),
            "BEGIN:VCARD\r\nVERSION:4.0\r\nFN:Doe\\, Jane\r\nN:Doe, Jane\r\nUID:uid-1\r\n\
             EMAIL:jane@example.com\r\nTEL;TYPE=cell:+1 480 395 7551\r\nNOTE:line1\\nline2\r\n\
             REV:20231114T221320Z\r\nX-CUSTOM:kept\r\nEND:VCARD\r\n"
        );
    }

    #[test]
    fn long_lines_are_folded_on_character_boundaries() {
        let record = RemoteRecord {
            display_name: "é".repeat(60),
            uid: "uid-1".to_string(),
            ..RemoteRecord::default()
        };
        let text = encode(&record);
        for line in text.split("\r\n") {
            assert!(line.len() <= FOLD_WIDTH, "line too long: {}", line.len());
        }
        assert_eq!(decoded(&text).display_name, record.display_name);
    }

    #[test]
    fn preserved_lines_survive_a_round_trip() {
        let card = decoded(APPLE_CARD);
        let again = decoded(&encode(&card));
        assert_eq!(again, card);
    }

    proptest! {
        #[test]
        fn property_escaped_text_round_trips(text in "[a-z ,;:\\\\\n]{0,40}") {
            prop_assert_eq!(unescape(&escape(&text)), text);
        }
    }
}
