use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use url::Url;

use crate::constants;

/// RFC 3986 query-component encoding: everything but unreserved characters
/// is percent-encoded, so the remote URL survives as a single `url=` value.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub fn encode_query_value(raw: &str) -> String {
    utf8_percent_encode(raw, QUERY_VALUE).to_string()
}

/// The proxied form of a remote URL for a given listener port.
pub fn proxied_url(remote: &str, port: u16) -> String {
    format!(
        "http://127.0.0.1:{}{}?{}={}",
        port,
        constants::PROXY_PATH,
        constants::URL_PARAM,
        encode_query_value(remote),
    )
}

/// Playlist requests are detected from the URL alone; `.m3u8` anywhere in
/// the URL counts, covering query-suffixed playlist endpoints.
pub fn is_playlist_url(url: &str) -> bool {
    url.contains(".m3u8")
}

fn is_already_proxied(uri: &str) -> bool {
    uri.starts_with("http://127.0.0.1:") && uri.contains("/proxy?")
}

/// Rewrites a playlist so every child URI routes back through the proxy.
///
/// Line endings are preserved byte-for-byte. Comment/tag lines pass through
/// except for embedded `URI="..."` attributes; every other non-blank line is
/// treated as a URI, resolved against the playlist's own URL when relative.
/// The rewrite is redone on every serve because the listener port may differ
/// between launches.
pub fn rewrite_playlist(text: &str, base: &Url, port: u16) -> String {
    let mut out = String::with_capacity(text.len() * 2);
    for piece in text.split_inclusive('\n') {
        let (line, ending) = split_ending(piece);
        rewrite_line(line, base, port, &mut out);
        out.push_str(ending);
    }
    out
}

fn split_ending(piece: &str) -> (&str, &str) {
    if let Some(stripped) = piece.strip_suffix("\r\n") {
        (stripped, "\r\n")
    } else if let Some(stripped) = piece.strip_suffix('\n') {
        (stripped, "\n")
    } else {
        (piece, "")
    }
}

fn rewrite_line(line: &str, base: &Url, port: u16, out: &mut String) {
    if line.trim().is_empty() {
        out.push_str(line);
    } else if line.starts_with('#') {
        rewrite_tag_line(line, base, port, out);
    } else {
        out.push_str(&rewrite_uri(line, base, port));
    }
}

/// Rewrites every `URI="..."` attribute inside a tag line, leaving the rest
/// of the line untouched (key tags, media tags, i-frame playlists).
fn rewrite_tag_line(line: &str, base: &Url, port: u16, out: &mut String) {
    let mut rest = line;
    while let Some(idx) = rest.find("URI=\"") {
        let value_start = idx + "URI=\"".len();
        let Some(quote) = rest[value_start..].find('"') else {
            break;
        };
        out.push_str(&rest[..value_start]);
        out.push_str(&rewrite_uri(&rest[value_start..value_start + quote], base, port));
        out.push('"');
        rest = &rest[value_start + quote + 1..];
    }
    out.push_str(rest);
}

fn rewrite_uri(uri: &str, base: &Url, port: u16) -> String {
    if is_already_proxied(uri) {
        return uri.to_string();
    }
    let absolute = if has_http_scheme(uri) {
        uri.to_string()
    } else {
        match base.join(uri) {
            Ok(resolved) => resolved.to_string(),
            Err(err) => {
                log::warn!("unresolvable playlist uri {uri:?} against {base}: {err}");
                return uri.to_string();
            }
        }
    };
    proxied_url(&absolute, port)
}

fn has_http_scheme(uri: &str) -> bool {
    let lower = uri.get(..8).unwrap_or(uri).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}
