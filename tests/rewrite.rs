use bodega::rewrite::{encode_query_value, is_playlist_url, proxied_url, rewrite_playlist};
use url::Url;

fn base(url: &str) -> Url {
    Url::parse(url).expect("base url")
}

#[test]
fn rewrites_segments_keys_and_absolute_uris() {
    let manifest = "#EXTM3U\n\
                    #EXT-X-KEY:METHOD=AES-128,URI=\"k.bin\"\n\
                    seg1.ts\n\
                    http://cdn/seg2.ts\n";
    let out = rewrite_playlist(manifest, &base("http://o/p/m.m3u8"), 9099);
    assert_eq!(
        out,
        "#EXTM3U\n\
         #EXT-X-KEY:METHOD=AES-128,URI=\"http://127.0.0.1:9099/proxy?url=http%3A%2F%2Fo%2Fp%2Fk.bin\"\n\
         http://127.0.0.1:9099/proxy?url=http%3A%2F%2Fo%2Fp%2Fseg1.ts\n\
         http://127.0.0.1:9099/proxy?url=http%3A%2F%2Fcdn%2Fseg2.ts\n"
    );
}

#[test]
fn rewrite_is_idempotent_for_a_stable_port() {
    let manifest = "#EXTM3U\n#EXT-X-KEY:METHOD=AES-128,URI=\"k.bin\"\nseg1.ts\n";
    let origin = base("http://o/p/m.m3u8");
    let once = rewrite_playlist(manifest, &origin, 9099);
    let twice = rewrite_playlist(&once, &origin, 9099);
    assert_eq!(once, twice);
}

#[test]
fn relative_uris_resolve_per_rfc3986() {
    let origin = base("http://host/a/b/c/media.m3u8");
    let out = rewrite_playlist("../../x/seg.ts\n", &origin, 9000);
    assert_eq!(
        out,
        format!(
            "http://127.0.0.1:9000/proxy?url={}\n",
            encode_query_value("http://host/a/x/seg.ts")
        )
    );

    // query-carrying children survive as part of the encoded value
    let out = rewrite_playlist("seg.ts?token=a&b=c\n", &origin, 9000);
    assert_eq!(
        out,
        format!(
            "http://127.0.0.1:9000/proxy?url={}\n",
            encode_query_value("http://host/a/b/c/seg.ts?token=a&b=c")
        )
    );
}

#[test]
fn preserves_blank_lines_crlf_and_plain_tags() {
    let manifest = "#EXTM3U\r\n\r\n#EXT-X-TARGETDURATION:6\r\nseg1.ts\r\nlast-no-newline.ts";
    let out = rewrite_playlist(manifest, &base("http://o/m.m3u8"), 9001);
    let lines: Vec<&str> = out.split("\r\n").collect();
    assert_eq!(lines[0], "#EXTM3U");
    assert_eq!(lines[1], "");
    assert_eq!(lines[2], "#EXT-X-TARGETDURATION:6");
    assert!(lines[3].starts_with("http://127.0.0.1:9001/proxy?url="));
    assert!(!out.ends_with('\n'));
    assert!(lines[4].contains(&encode_query_value("http://o/last-no-newline.ts")));
}

#[test]
fn already_proxied_uris_pass_through() {
    let line = "http://127.0.0.1:9099/proxy?url=http%3A%2F%2Fo%2Fseg1.ts\n";
    let out = rewrite_playlist(line, &base("http://o/m.m3u8"), 9099);
    assert_eq!(out, line);
}

#[test]
fn scheme_detection_is_case_insensitive() {
    let out = rewrite_playlist("HTTPS://cdn/SEG.TS\n", &base("http://o/m.m3u8"), 9000);
    assert_eq!(
        out,
        format!(
            "http://127.0.0.1:9000/proxy?url={}\n",
            encode_query_value("HTTPS://cdn/SEG.TS")
        )
    );
}

#[test]
fn query_value_encoding_covers_reserved_characters() {
    assert_eq!(
        encode_query_value("http://o/p?a=1&b=2"),
        "http%3A%2F%2Fo%2Fp%3Fa%3D1%26b%3D2"
    );
    assert_eq!(encode_query_value("a-b._~c"), "a-b._~c");
}

#[test]
fn proxied_url_shape() {
    assert_eq!(
        proxied_url("http://o/seg.ts", 9000),
        "http://127.0.0.1:9000/proxy?url=http%3A%2F%2Fo%2Fseg.ts"
    );
}

#[test]
fn playlist_detection_uses_the_whole_url() {
    assert!(is_playlist_url("http://o/master.m3u8"));
    assert!(is_playlist_url("http://o/master.m3u8?session=1"));
    assert!(is_playlist_url("http://o/playlist.m3u8/variant/3"));
    assert!(!is_playlist_url("http://o/seg1.ts"));
}
