use url::Url;

const FEED_BASE: &str = "https://www.youtube.com/feeds/videos.xml";

/// Parses an absolute or protocol-relative URL.
fn parse(url_str: &str) -> Option<Url> {
    let trimmed = url_str.trim();
    if trimmed.starts_with("//") {
        Url::parse(&format!("https:{trimmed}")).ok()
    } else {
        Url::parse(trimmed).ok()
    }
}

fn is_video_host(host: &str) -> bool {
    host == "youtube.com" || host.ends_with(".youtube.com") || host == "youtu.be"
}

/// Parses `url_str` and keeps it only if it points somewhere on the video site
/// (the bare domain does not count).
fn parse_video_site(url_str: &str) -> Option<Url> {
    let url = parse(url_str)?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str()?.to_ascii_lowercase();
    if !is_video_host(&host) {
        return None;
    }
    let has_target = url.path() != "/" || url.query().is_some_and(|q| !q.is_empty());
    has_target.then_some(url)
}

/// True for any video-site URL with something after the domain.
pub fn is_youtube(url_str: &str) -> bool {
    parse_video_site(url_str).is_some()
}

/// True for single-video links: `/watch`, `/shorts/…`, `/embed/…` and `youtu.be/…`.
pub fn is_video(url_str: &str) -> bool {
    let Some(url) = parse_video_site(url_str) else {
        return false;
    };
    if url.host_str() == Some("youtu.be") {
        return true;
    }
    let path = url.path();
    path == "/watch" || path.starts_with("/shorts/") || path.starts_with("/embed/")
}

/// True when the URL carries a `list` query parameter.
pub fn is_playlist(url_str: &str) -> bool {
    playlist_id(url_str).is_some()
}

/// True for channel pages: `/c/…`, `/user/…`, `/channel/…` and `/@handle`.
pub fn is_channel(url_str: &str) -> bool {
    parse_video_site(url_str).is_some_and(|url| {
        let path = url.path();
        ["/c/", "/user/", "/channel/", "/@"]
            .iter()
            .any(|prefix| path.starts_with(prefix))
    })
}

pub fn playlist_id(url_str: &str) -> Option<String> {
    let url = parse_video_site(url_str)?;
    url.query_pairs()
        .find(|(key, value)| key == "list" && !value.is_empty())
        .map(|(_, value)| value.into_owned())
}

/// Feed address for the playlist referenced by `url_str`.
pub fn playlist_feed_url(url_str: &str) -> Option<String> {
    playlist_id(url_str).map(|id| format!("{FEED_BASE}?playlist_id={id}"))
}

/// Extracts the video id from any single-video link.
pub fn video_id(url_str: &str) -> Option<String> {
    if !is_video(url_str) {
        return None;
    }
    let url = parse_video_site(url_str)?;
    if url.host_str() == Some("youtu.be") {
        return url
            .path_segments()?
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_owned);
    }
    if url.path() == "/watch" {
        return url
            .query_pairs()
            .find(|(key, _)| key == "v")
            .map(|(_, value)| value.into_owned());
    }
    url.path_segments()?
        .filter(|s| !s.is_empty())
        .last()
        .map(str::to_owned)
}
