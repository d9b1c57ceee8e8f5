use std::time::Duration;

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};

/// Midnight UTC of the day `now` falls in; daily caps reset here.
pub fn day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Longest wait a flow may schedule. Delay nodes beyond it are rejected
/// when the flow is built.
pub const MAX_DELAY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `std` duration as a chrono delta, saturating at [`MAX_DELAY`].
pub fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d.min(MAX_DELAY)).unwrap_or_else(|_| TimeDelta::days(365))
}

/// Best-effort mime type for a media url, from its file extension.
pub fn mime_from_url(url: &str) -> Option<&'static str> {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path.rsplit_once('.')?.1.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp3" => "audio/mpeg",
        "ogg" | "opus" => "audio/ogg",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "pdf" => "application/pdf",
        "doc" => "application/msword",
        "docx" => "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
        "xls" => "application/vnd.ms-excel",
        "xlsx" => "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
        "txt" => "text/plain",
        "vcf" => "text/vcard",
        _ => return None,
    };
    Some(mime)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_day_start_is_utc_midnight() {
        let now = Utc.with_ymd_and_hms(2025, 3, 14, 17, 45, 3).unwrap();
        assert_eq!(day_start(now), Utc.with_ymd_and_hms(2025, 3, 14, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_to_delta_saturates() {
        assert_eq!(to_delta(Duration::from_secs(300)), TimeDelta::seconds(300));
        assert_eq!(to_delta(Duration::from_secs(u64::MAX)), TimeDelta::days(365));
    }

    #[test]
    fn test_mime_from_url() {
        assert_eq!(mime_from_url("https://cdn.example.com/a/b/Photo.JPG?sig=1"), Some("image/jpeg"));
        assert_eq!(mime_from_url("https://cdn.example.com/file"), None);
        assert_eq!(mime_from_url("https://cdn.example.com/file.bin"), None);
    }
}
