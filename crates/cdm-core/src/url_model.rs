//! Local file names for downloads.
//!
//! A name comes from the `Content-Disposition` header when the server sends one,
//! otherwise from the last URL path segment, and is then made safe for the local
//! filesystem. A renaming mask such as `*y*-*m*/*name*.*ext*` can turn that name
//! into a relative destination path (see [`apply_mask`]).

use chrono::{Datelike, NaiveDateTime, Timelike};
use std::path::PathBuf;

/// Used when neither the header nor the URL yields a usable name.
pub const FALLBACK_FILE_NAME: &str = "download.bin";

/// Longest file name (in bytes) most Linux filesystems accept.
pub const MAX_FILE_NAME_BYTES: usize = 255;

/// Pick and sanitize the file name for `url`.
pub fn derive_file_name(url: &str, content_disposition: Option<&str>) -> String {
    content_disposition
        .and_then(disposition_file_name)
        .or_else(|| url_file_name(url))
        .map(|raw| sanitize(&raw))
        .filter(|s| !s.is_empty() && s != "." && s != "..")
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string())
}

/// `filename*=UTF-8''...` wins over `filename=...`.
pub fn disposition_file_name(header: &str) -> Option<String> {
    let mut plain = None;
    for param in header.split(';') {
        let Some((key, value)) = param.trim().split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim().to_ascii_lowercase().as_str() {
            "filename*" => {
                let encoded = value.split_once("''").map(|(_, v)| v).unwrap_or(value);
                if let Some(name) = percent_decode(encoded.trim_matches('"')) {
                    if !name.is_empty() {
                        return Some(name);
                    }
                }
            }
            "filename" => {
                let v = value
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .map(|v| v.replace("\\\"", "\"").replace("\\\\", "\\"))
                    .unwrap_or_else(|| value.to_string());
                if !v.is_empty() {
                    plain = Some(v);
                }
            }
            _ => {}
        }
    }
    plain
}

/// Last non-empty path segment, percent-decoded.
pub fn url_file_name(url: &str) -> Option<String> {
    let parsed = url::Url::parse(url).ok()?;
    let segment = parsed.path_segments()?.filter(|s| !s.is_empty()).last()?;
    percent_decode(segment).filter(|s| s != "." && s != "..")
}

fn percent_decode(input: &str) -> Option<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(b) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(b);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8(out).ok()
}

/// Strip path separators, NUL and control characters and surrounding dots/spaces.
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    cleaned.trim_matches(|c| c == '.' || c == ' ').to_string()
}

/// Shorten `name` to at most `max_bytes`, keeping the extension when it is short.
pub fn shorten(name: &str, max_bytes: usize) -> String {
    if name.len() <= max_bytes {
        return name.to_string();
    }
    let (stem, ext) = match name.rfind('.') {
        Some(i) if i > 0 && name.len() - i <= 16 && name.len() - i < max_bytes => {
            (&name[..i], &name[i..])
        }
        _ => (name, ""),
    };
    let mut cut = max_bytes - ext.len();
    while !stem.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}{}", &stem[..cut], ext)
}

/// What the `*tag*` placeholders of a renaming mask expand to.
#[derive(Debug, Clone)]
pub struct MaskContext<'a> {
    pub url: &'a str,
    /// The derived (or user given) file name.
    pub file_name: &'a str,
    /// Series number, `*num*`.
    pub num: i64,
    /// Local time the download started, for the date tags.
    pub started: NaiveDateTime,
}

impl MaskContext<'_> {
    fn tag(&self, tag: &str) -> Option<String> {
        let parsed = url::Url::parse(self.url).ok();
        let host = || parsed.as_ref().and_then(|u| u.host_str()).unwrap_or("").to_string();
        let value = match tag {
            "name" => split_extension(self.file_name).0.to_string(),
            "ext" => split_extension(self.file_name).1.to_string(),
            "filename" => url_file_name(self.url).unwrap_or_else(|| "index.htm".to_string()),
            "url" => match parsed.as_ref().and_then(|u| u.port()) {
                Some(port) => format!("{}:{port}", host()),
                None => host(),
            },
            "site" => host(),
            "sitenowww" => strip_www(&host()).to_string(),
            "subdirs" => url_dirs(parsed.as_ref()).join("/"),
            "flatsubdirs" => url_dirs(parsed.as_ref()).join("-"),
            "qstring" => parsed
                .as_ref()
                .and_then(|u| u.query())
                .unwrap_or("")
                .to_string(),
            "num" => format!("{:03}", self.num),
            "y" => self.started.year().to_string(),
            "m" => format!("{:02}", self.started.month()),
            "d" => format!("{:02}", self.started.day()),
            "hh" => format!("{:02}", self.started.hour()),
            "mm" => format!("{:02}", self.started.minute()),
            "ss" => format!("{:02}", self.started.second()),
            _ => return None,
        };
        Some(value)
    }
}

/// Expand `mask` into a relative path below the download directory.
///
/// Unknown tags are kept as written. Every path segment is sanitized and
/// shortened; `None` when nothing usable is left.
pub fn apply_mask(mask: &str, ctx: &MaskContext<'_>) -> Option<PathBuf> {
    let expanded = expand_mask(mask, ctx).replace('\\', "/");
    let path: PathBuf = expanded
        .trim_end_matches(['.', '/'])
        .split('/')
        .map(|seg| shorten(&sanitize(seg), MAX_FILE_NAME_BYTES))
        .filter(|seg| !seg.is_empty())
        .collect();
    if path.as_os_str().is_empty() {
        None
    } else {
        Some(path)
    }
}

fn expand_mask(mask: &str, ctx: &MaskContext<'_>) -> String {
    let mut out = String::with_capacity(mask.len());
    let mut rest = mask;
    while let Some(i) = rest.find('*') {
        out.push_str(&rest[..i]);
        let after = &rest[i + 1..];
        let len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        if len > 0 && after[len..].starts_with('*') {
            let tag = &after[..len];
            match ctx.tag(tag) {
                Some(v) => out.push_str(&v),
                None => {
                    out.push('*');
                    out.push_str(tag);
                    out.push('*');
                }
            }
            rest = &after[len + 1..];
        } else {
            out.push('*');
            rest = after;
        }
    }
    out.push_str(rest);
    out
}

/// `("archive.tar", "gz")` for `archive.tar.gz`; no extension for dot files.
fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(i) if i > 0 => (&name[..i], &name[i + 1..]),
        _ => (name, ""),
    }
}

fn strip_www(host: &str) -> &str {
    let Some(rest) = host.strip_prefix("www") else {
        return host;
    };
    let rest = rest.trim_start_matches(|c: char| c.is_ascii_digit());
    rest.strip_prefix('.').unwrap_or(host)
}

/// Decoded directory segments of the URL path, without the file name.
fn url_dirs(url: Option<&url::Url>) -> Vec<String> {
    let Some(segments) = url.and_then(|u| u.path_segments()) else {
        return Vec::new();
    };
    let mut dirs: Vec<&str> = segments.collect();
    dirs.pop();
    dirs.into_iter()
        .filter(|s| !s.is_empty())
        .filter_map(percent_decode)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_from_url_path() {
        assert_eq!(
            derive_file_name("https://cdn.example.com/pool/debian-12.iso", None),
            "debian-12.iso"
        );
        assert_eq!(
            derive_file_name("https://example.com/a/my%20file.txt?x=1", None),
            "my file.txt"
        );
        assert_eq!(derive_file_name("https://example.com/", None), FALLBACK_FILE_NAME);
    }

    #[test]
    fn disposition_wins_over_path() {
        assert_eq!(
            derive_file_name(
                "https://example.com/get?id=3",
                Some("attachment; filename=\"report.pdf\"")
            ),
            "report.pdf"
        );
        assert_eq!(
            disposition_file_name("attachment; filename=a.bin; filename*=UTF-8''na%C3%AFve.bin")
                .as_deref(),
            Some("naïve.bin")
        );
    }

    #[test]
    fn sanitize_strips_separators_and_dots() {
        assert_eq!(sanitize("../etc/passwd"), "_etc_passwd");
        assert_eq!(sanitize(" .hidden. "), "hidden");
        assert_eq!(derive_file_name("https://x/", Some("attachment; filename=\"..\"")), FALLBACK_FILE_NAME);
    }

    #[test]
    fn shorten_keeps_extension() {
        let long = format!("{}.tar.gz", "a".repeat(300));
        let short = shorten(&long, MAX_FILE_NAME_BYTES);
        assert_eq!(short.len(), MAX_FILE_NAME_BYTES);
        assert!(short.ends_with(".gz"));
        assert_eq!(shorten("ok.txt", 255), "ok.txt");
    }

    fn mask_ctx(url: &str) -> MaskContext<'_> {
        MaskContext {
            url,
            file_name: "debian-12.iso",
            num: 7,
            started: chrono::NaiveDate::from_ymd_opt(2024, 3, 9)
                .unwrap()
                .and_hms_opt(8, 5, 1)
                .unwrap(),
        }
    }

    #[test]
    fn mask_expands_name_and_extension() {
        let ctx = mask_ctx("https://www.example.com/pool/main/debian-12.iso?mirror=1");
        assert_eq!(
            apply_mask("*name*.*ext*", &ctx),
            Some(PathBuf::from("debian-12.iso"))
        );
        assert_eq!(
            apply_mask("*num*_*name*-*sitenowww*.*ext*", &ctx),
            Some(PathBuf::from("007_debian-12-example.com.iso"))
        );
        assert_eq!(apply_mask("*qstring*", &ctx), Some(PathBuf::from("mirror=1")));
    }

    #[test]
    fn mask_builds_subdirectories() {
        let ctx = mask_ctx("http://mirror.example:8080/pool/main/debian-12.iso");
        assert_eq!(
            apply_mask("*url*/*subdirs*/*name*.*ext*", &ctx),
            Some(PathBuf::from("mirror.example:8080/pool/main/debian-12.iso"))
        );
        assert_eq!(
            apply_mask("*y*-*m*-*d*/*hh**mm**ss* *flatsubdirs*.*ext*", &ctx),
            Some(PathBuf::from("2024-03-09/080501 pool-main.iso"))
        );
    }

    #[test]
    fn mask_keeps_unknown_tags_and_drops_unsafe_segments() {
        let ctx = mask_ctx("https://example.com/debian-12.iso");
        assert_eq!(
            apply_mask("*bogus* *name*", &ctx),
            Some(PathBuf::from("*bogus* debian-12"))
        );
        assert_eq!(
            apply_mask("../*subdirs*/*name*.", &ctx),
            Some(PathBuf::from("debian-12"))
        );
        assert_eq!(apply_mask("*subdirs*", &ctx), None);
    }
}
