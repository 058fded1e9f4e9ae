use crate::state::{SharedState, StreamId};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Response, StatusCode},
};
use std::path::{Component, Path as FsPath};
use tokio::fs::File;
use tokio_util::io::ReaderStream;

pub async fn serve_hls_file(
    State(state): State<SharedState>,
    Path((stream_id, file_name)): Path<(String, String)>,
) -> Result<Response<Body>, (StatusCode, String)> {
    let id = StreamId::parse(&stream_id).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    if !is_plain_file_name(&file_name) {
        return Err((StatusCode::BAD_REQUEST, "Invalid file name".to_string()));
    }

    // 1. Any playlist or segment request keeps the stream alive
    let record = state
        .engine
        .record(&id)
        .ok_or_else(|| (StatusCode::NOT_FOUND, "Stream not running".to_string()))?;
    record.touch();

    // 2. Resolve the file inside the directory owned by the current stream instance
    let file_path = record.output_dir.join(&file_name);
    let file = File::open(&file_path)
        .await
        .map_err(|_| (StatusCode::NOT_FOUND, "File not found".to_string()))?;

    // 3. Determine the Content-Type based on the file extension
    let content_type = mime_guess::from_path(&file_path)
        .first_or_octet_stream()
        .to_string();

    let body = Body::from_stream(ReaderStream::new(file));

    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(body)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// 只允许单个普通文件名，拒绝路径穿越
fn is_plain_file_name(name: &str) -> bool {
    let mut components = FsPath::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains(['/', '\\'])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_playlist_and_segment_names() {
        assert!(is_plain_file_name("index.m3u8"));
        assert!(is_plain_file_name("seg_00012.ts"));
    }

    #[test]
    fn rejects_traversal_and_nested_paths() {
        assert!(!is_plain_file_name(""));
        assert!(!is_plain_file_name(".."));
        assert!(!is_plain_file_name("."));
        assert!(!is_plain_file_name("../secret"));
        assert!(!is_plain_file_name("a/b.ts"));
        assert!(!is_plain_file_name("/etc/passwd"));
        assert!(!is_plain_file_name("..\\win.ini"));
    }
}
