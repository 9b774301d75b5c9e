// tests/unit_media_test.rs

use prismd::core::PrismError;
use prismd::core::media::{Container, MediaTool};
use std::path::Path;

#[test]
fn test_container_codecs_and_muxers() {
    assert_eq!(Container::Mp4.video_codec(), "libx264");
    assert_eq!(Container::Mkv.video_codec(), "libx264");
    assert_eq!(Container::Mov.video_codec(), "libx264");
    assert_eq!(Container::Webm.video_codec(), "libvpx-vp9");

    assert_eq!(Container::Mp4.audio_codec(), "aac");
    assert_eq!(Container::Webm.audio_codec(), "libvorbis");

    assert_eq!(Container::Mp4.muxer(), "mp4");
    assert_eq!(Container::Mkv.muxer(), "matroska");
    assert_eq!(Container::Webm.muxer(), "webm");
    assert_eq!(Container::Mov.muxer(), "mov");
}

#[test]
fn test_container_parsing_defaults_to_mp4() {
    assert_eq!(Container::from_ext("mkv"), Container::Mkv);
    assert_eq!(Container::from_ext("webm"), Container::Webm);
    assert_eq!(Container::from_ext("avi"), Container::Mp4);
    assert_eq!(Container::from_ext(""), Container::Mp4);
    assert_eq!(Container::Mov.to_string(), "mov");
}

#[tokio::test]
async fn test_missing_binary_surfaces_as_media_tool_error() {
    let tool = MediaTool::new("prismd-test-no-such-binary".to_string());
    let err = tool
        .transcode(
            Path::new("in.mp4"),
            Path::new("out.mp4"),
            640,
            480,
            Container::Mp4,
        )
        .await
        .unwrap_err();
    match err {
        PrismError::MediaTool(message) => assert!(message.contains("failed to launch")),
        other => panic!("expected MediaTool error, got {other:?}"),
    }
}
