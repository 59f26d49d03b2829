//! Utility functions for common operations.
//!
//! - **URL classification**: recognise channel, playlist and video links
//! - **HTML scanning**: pull attribute values out of fetched pages

mod html;
mod url_kind;

pub use html::find_tag_attr;
pub use url_kind::{
    is_channel, is_playlist, is_video, is_youtube, playlist_feed_url, playlist_id, video_id,
};
