//! Mirroring between device bookmarks and web-reader progress.
//!
//! Progress only crosses sides when the user has two-way sync enabled, and
//! only when the side it comes from is at least as recent as the side it
//! overwrites.

use chrono::{DateTime, Utc};

use crate::kobo::merge::priority_timestamp;
use crate::kobo::timestamp::{format, is_strictly_after, parse_opt};
use crate::model::{Bookmark, FileProgress, Location, ReadingState, StatusInfo, SyncSettings, UnifiedProgress};

/// Location type reported for positions synthesized from a web cursor.
pub const WEB_LOCATION_TYPE: &str = "KoboSpan";

/// Entitlement ids are book ids. Anything else has no progress.
pub fn parse_book_id(entitlement_id: &str) -> Option<i64> {
    entitlement_id.trim().parse::<i64>().ok().filter(|id| *id > 0)
}

/// Copy an accepted device bookmark into the web-reader fields.
pub fn mirror_device_progress(
    bookmark: &Bookmark,
    mut progress: UnifiedProgress,
    mut file: Option<FileProgress>,
    settings: &SyncSettings,
    now: DateTime<Utc>,
) -> (UnifiedProgress, Option<FileProgress>) {
    if !settings.two_way_progress_sync {
        return (progress, file);
    }
    let Some(percent) = bookmark.progress_percent else {
        return (progress, file);
    };

    let bookmark_time = parse_opt(bookmark.last_modified.as_deref());
    let web_time = file
        .as_ref()
        .and_then(|f| f.last_read_time)
        .or(progress.last_read_time);
    if is_strictly_after(web_time, bookmark_time) {
        tracing::debug!(
            book_id = progress.book_id,
            user_id = progress.user_id,
            "web reader is ahead of device bookmark, not mirroring"
        );
        return (progress, file);
    }

    let href = bookmark.location.as_ref().and_then(|l| l.source.clone());

    progress.epub_progress_percent = Some(percent);
    if href.is_some() {
        progress.epub_progress_href = href.clone();
    }
    progress.epub_progress = None;
    progress.last_read_time = Some(now);

    if let Some(file) = file.as_mut() {
        file.progress_percent = Some(percent);
        if href.is_some() {
            file.position_href = href;
        }
        file.position_data = None;
        file.last_read_time = Some(now);
    }

    (progress, file)
}

#[derive(Debug, Clone, PartialEq)]
struct WebCursor {
    percent: f64,
    read_at: DateTime<Utc>,
    href: Option<String>,
}

// Freshest of the book- and file-level cursors.
fn web_cursor(progress: Option<&UnifiedProgress>, file: Option<&FileProgress>) -> Option<WebCursor> {
    let book = progress.and_then(|p| {
        Some(WebCursor {
            percent: p.epub_progress_percent?,
            read_at: p.last_read_time?,
            href: p.epub_progress_href.clone(),
        })
    });
    let file = file.and_then(|f| {
        Some(WebCursor {
            percent: f.progress_percent?,
            read_at: f.last_read_time?,
            href: f.position_href.clone(),
        })
    });

    match (book, file) {
        (Some(book), Some(file)) if book.read_at > file.read_at => Some(book),
        (_, Some(file)) => Some(file),
        (book, None) => book,
    }
}

fn web_location(href: Option<String>) -> Option<Location> {
    href.map(|href| Location {
        value: Some(href.clone()),
        kind: Some(WEB_LOCATION_TYPE.to_string()),
        source: Some(href),
    })
}

/// Overlay the web reader's progress onto the bookmark the device will see.
/// Stored location fields are kept; a missing location comes from the web
/// cursor.
pub fn overlay(
    mut state: ReadingState,
    progress: Option<&UnifiedProgress>,
    file: Option<&FileProgress>,
    settings: &SyncSettings,
) -> ReadingState {
    if !settings.two_way_progress_sync {
        return state;
    }
    let Some(cursor) = web_cursor(progress, file) else {
        return state;
    };

    let bookmark_time = state
        .current_bookmark
        .as_ref()
        .and_then(|b| parse_opt(b.last_modified.as_deref()));
    if is_strictly_after(bookmark_time, Some(cursor.read_at)) {
        return state;
    }
    if state
        .current_bookmark
        .as_ref()
        .is_some_and(|b| b.progress_percent == Some(cursor.percent))
    {
        return state;
    }

    let mut bookmark = state.current_bookmark.take().unwrap_or_default();
    bookmark.progress_percent = Some(cursor.percent);
    bookmark.last_modified = Some(format(cursor.read_at));
    if bookmark.location.is_none() {
        bookmark.location = web_location(cursor.href);
    }
    state.current_bookmark = Some(bookmark);
    state.priority_timestamp = priority_timestamp(&state, None);
    state
}

/// Carry a server-side status change that the device has not seen yet.
pub fn overlay_status(mut state: ReadingState, progress: Option<&UnifiedProgress>) -> ReadingState {
    let Some(progress) = progress.filter(|p| p.has_pending_status()) else {
        return state;
    };
    let (Some(status), Some(modified)) = (progress.read_status.kobo_status(), progress.read_status_modified_time) else {
        return state;
    };

    let mut info = state.status_info.take().unwrap_or_else(StatusInfo::default);
    info.extra.insert("Status".to_string(), status.into());
    info.last_modified = Some(format(modified));
    state.status_info = Some(info);
    state.priority_timestamp = priority_timestamp(&state, None);
    state
}

/// Reading state built from stored progress when no device row exists.
pub fn synthesize(entitlement_id: &str, progress: &UnifiedProgress, settings: &SyncSettings) -> Option<ReadingState> {
    let (percent, location, at) = match progress.kobo_progress_percent {
        Some(percent) => (
            percent,
            progress.kobo_location.clone(),
            progress.kobo_progress_received_time.or(progress.last_read_time),
        ),
        None if settings.two_way_progress_sync => (
            progress.epub_progress_percent?,
            web_location(progress.epub_progress_href.clone()),
            progress.last_read_time,
        ),
        None => return None,
    };

    let ts = at.map(format);
    Some(ReadingState {
        entitlement_id: entitlement_id.to_string(),
        created: ts.clone(),
        last_modified: ts.clone(),
        priority_timestamp: ts.clone(),
        status_info: None,
        statistics: None,
        current_bookmark: Some(Bookmark {
            last_modified: ts,
            progress_percent: Some(percent),
            location,
            ..Default::default()
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReadStatus;
    use chrono::{TimeDelta, TimeZone};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap() + TimeDelta::seconds(secs)
    }

    fn two_way() -> SyncSettings {
        SyncSettings {
            two_way_progress_sync: true,
            ..Default::default()
        }
    }

    fn device_bookmark(percent: f64, secs: i64) -> Bookmark {
        Bookmark {
            last_modified: Some(format(at(secs))),
            progress_percent: Some(percent),
            location: Some(Location {
                value: Some("kobo.4.1".to_string()),
                kind: Some("KoboSpan".to_string()),
                source: Some("OEBPS/ch04.xhtml".to_string()),
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_book_id() {
        assert_eq!(parse_book_id("42"), Some(42));
        assert_eq!(parse_book_id(" 42 "), Some(42));
        assert_eq!(parse_book_id("abc"), None);
        assert_eq!(parse_book_id("0"), None);
        assert_eq!(parse_book_id("-3"), None);
        assert_eq!(parse_book_id("6b1e2a0c-uuid"), None);
    }

    #[test]
    fn test_mirror_copies_device_progress() {
        let mut progress = UnifiedProgress::new(1, 5);
        progress.epub_progress = Some("epubcfi(/6/8)".to_string());
        let mut file = FileProgress::new(1, 5, 50);
        file.position_data = Some("{\"cfi\":1}".to_string());
        file.last_read_time = Some(at(0));

        let (progress, file) = mirror_device_progress(&device_bookmark(61.0, 10), progress, Some(file), &two_way(), at(20));
        let file = file.unwrap();

        assert_eq!(progress.epub_progress_percent, Some(61.0));
        assert_eq!(progress.epub_progress_href.as_deref(), Some("OEBPS/ch04.xhtml"));
        assert_eq!(progress.epub_progress, None);
        assert_eq!(progress.last_read_time, Some(at(20)));
        assert_eq!(file.progress_percent, Some(61.0));
        assert_eq!(file.position_href.as_deref(), Some("OEBPS/ch04.xhtml"));
        assert_eq!(file.position_data, None);
        assert_eq!(file.last_read_time, Some(at(20)));
    }

    #[test]
    fn test_mirror_respects_newer_web_reader() {
        let mut file = FileProgress::new(1, 5, 50);
        file.progress_percent = Some(70.0);
        file.last_read_time = Some(at(11));

        let (progress, file) = mirror_device_progress(
            &device_bookmark(61.0, 10),
            UnifiedProgress::new(1, 5),
            Some(file),
            &two_way(),
            at(20),
        );
        assert_eq!(progress.epub_progress_percent, None);
        assert_eq!(file.unwrap().progress_percent, Some(70.0));
    }

    #[test]
    fn test_mirror_same_second_goes_through() {
        let mut file = FileProgress::new(1, 5, 50);
        file.last_read_time = Some(at(10));

        let (progress, _) = mirror_device_progress(&device_bookmark(61.0, 10), UnifiedProgress::new(1, 5), Some(file), &two_way(), at(20));
        assert_eq!(progress.epub_progress_percent, Some(61.0));
    }

    #[test]
    fn test_mirror_disabled_without_two_way_sync() {
        let (progress, _) = mirror_device_progress(
            &device_bookmark(61.0, 10),
            UnifiedProgress::new(1, 5),
            None,
            &SyncSettings::default(),
            at(20),
        );
        assert_eq!(progress.epub_progress_percent, None);
        assert_eq!(progress.last_read_time, None);
    }

    #[test]
    fn test_overlay_replaces_older_bookmark_keeping_location() {
        let mut state = ReadingState::new("5");
        state.current_bookmark = Some(device_bookmark(20.0, 0));
        let mut progress = UnifiedProgress::new(1, 5);
        progress.epub_progress_percent = Some(60.0);
        progress.epub_progress_href = Some("OEBPS/ch09.xhtml".to_string());
        progress.last_read_time = Some(at(30));

        let state = overlay(state, Some(&progress), None, &two_way());
        let bookmark = state.current_bookmark.as_ref().unwrap();
        assert_eq!(bookmark.progress_percent, Some(60.0));
        assert_eq!(bookmark.last_modified, Some(format(at(30))));
        assert_eq!(bookmark.location.as_ref().unwrap().source.as_deref(), Some("OEBPS/ch04.xhtml"));
        assert_eq!(state.priority_timestamp, Some(format(at(30))));
    }

    #[test]
    fn test_overlay_synthesizes_location_from_cursor() {
        let state = ReadingState::new("5");
        let mut file = FileProgress::new(1, 5, 50);
        file.progress_percent = Some(12.5);
        file.position_href = Some("OEBPS/ch01.xhtml".to_string());
        file.last_read_time = Some(at(5));

        let state = overlay(state, None, Some(&file), &two_way());
        let bookmark = state.current_bookmark.unwrap();
        let location = bookmark.location.unwrap();
        assert_eq!(bookmark.progress_percent, Some(12.5));
        assert_eq!(location.kind.as_deref(), Some(WEB_LOCATION_TYPE));
        assert_eq!(location.source.as_deref(), Some("OEBPS/ch01.xhtml"));
    }

    #[test]
    fn test_overlay_prefers_fresher_cursor() {
        let mut progress = UnifiedProgress::new(1, 5);
        progress.epub_progress_percent = Some(40.0);
        progress.last_read_time = Some(at(50));
        let mut file = FileProgress::new(1, 5, 50);
        file.progress_percent = Some(30.0);
        file.last_read_time = Some(at(40));

        let state = overlay(ReadingState::new("5"), Some(&progress), Some(&file), &two_way());
        assert_eq!(state.current_bookmark.unwrap().progress_percent, Some(40.0));
    }

    #[test]
    fn test_overlay_leaves_newer_device_bookmark() {
        let mut state = ReadingState::new("5");
        state.current_bookmark = Some(device_bookmark(20.0, 100));
        let mut progress = UnifiedProgress::new(1, 5);
        progress.epub_progress_percent = Some(60.0);
        progress.last_read_time = Some(at(30));

        let overlaid = overlay(state.clone(), Some(&progress), None, &two_way());
        assert_eq!(overlaid, state);
        let untouched = overlay(state.clone(), Some(&progress), None, &SyncSettings::default());
        assert_eq!(untouched, state);
    }

    #[test]
    fn test_overlay_status_only_when_pending() {
        let mut progress = UnifiedProgress::new(1, 5);
        progress.read_status = ReadStatus::Read;
        progress.read_status_modified_time = Some(at(10));

        let state = overlay_status(ReadingState::new("5"), Some(&progress));
        let info = state.status_info.unwrap();
        assert_eq!(info.extra.get("Status").and_then(|v| v.as_str()), Some("Finished"));
        assert_eq!(info.last_modified, Some(format(at(10))));

        progress.kobo_status_sent_time = Some(at(11));
        let state = overlay_status(ReadingState::new("5"), Some(&progress));
        assert_eq!(state.status_info, None);
    }

    #[test]
    fn test_synthesize_from_device_fields() {
        let mut progress = UnifiedProgress::new(1, 5);
        assert_eq!(synthesize("5", &progress, &SyncSettings::default()), None);

        progress.kobo_progress_percent = Some(33.0);
        progress.kobo_progress_received_time = Some(at(3));
        let state = synthesize("5", &progress, &SyncSettings::default()).unwrap();
        assert_eq!(state.entitlement_id, "5");
        assert_eq!(state.priority_timestamp, Some(format(at(3))));
        assert_eq!(state.current_bookmark.unwrap().progress_percent, Some(33.0));
    }

    #[test]
    fn test_synthesize_from_web_fields_needs_two_way() {
        let mut progress = UnifiedProgress::new(1, 5);
        progress.epub_progress_percent = Some(8.0);
        progress.last_read_time = Some(at(1));

        assert_eq!(synthesize("5", &progress, &SyncSettings::default()), None);
        let state = synthesize("5", &progress, &two_way()).unwrap();
        assert_eq!(state.current_bookmark.unwrap().progress_percent, Some(8.0));
    }
}
