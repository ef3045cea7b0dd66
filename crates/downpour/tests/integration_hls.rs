//! End-to-end tests for the HLS downloader: master playlist variant
//! selection, segment download, resume and concatenation.

mod common;

use std::time::Duration;

use common::test_server::{Resource, ServerOptions, TestServer, Throttle};
use common::recording_reporter;
use downpour_engine::error::DownloadError;
use downpour_engine::hls::HlsDownloader;
use downpour_engine::options::DownloadOptions;
use downpour_engine::task::TaskControl;

fn segment_body(index: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i + index * 31) % 251) as u8).collect()
}

const MASTER: &str = "#EXTM3U\n\
#EXT-X-STREAM-INF:BANDWIDTH=500000,RESOLUTION=640x360\n\
low.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=1500000,RESOLUTION=1280x720\n\
mid.m3u8\n\
#EXT-X-STREAM-INF:BANDWIDTH=3000000,RESOLUTION=1920x1080\n\
high.m3u8\n";

const HIGH: &str = "#EXTM3U\n\
#EXT-X-VERSION:3\n\
#EXT-X-TARGETDURATION:4\n\
#EXTINF:4.0,\n\
seg0.ts\n\
#EXTINF:4.0,\n\
seg1.ts\n\
#EXTINF:4.0,\n\
seg2.ts\n\
#EXTINF:4.0,\n\
seg3.ts\n\
#EXTINF:3.2,\n\
seg4.ts\n\
#EXT-X-ENDLIST\n";

fn hls_server(options: ServerOptions) -> (TestServer, Vec<Vec<u8>>) {
    let bodies: Vec<Vec<u8>> = (0..5).map(|i| segment_body(i, 40_000 + i * 1000)).collect();
    let mut resources = vec![
        ("/master.m3u8".to_string(), Resource::playlist(MASTER)),
        ("/high.m3u8".to_string(), Resource::playlist(HIGH)),
        (
            "/low.m3u8".to_string(),
            Resource::playlist("#EXTM3U\n#EXTINF:4.0,\nwrong.ts\n#EXT-X-ENDLIST\n"),
        ),
    ];
    for (i, body) in bodies.iter().enumerate() {
        resources.push((format!("/seg{i}.ts"), Resource::new(body.clone())));
    }
    (TestServer::serve_with_options(resources, options), bodies)
}

fn options_for(dir: &std::path::Path) -> DownloadOptions {
    DownloadOptions {
        output_path: dir.to_path_buf(),
        retry_delay_secs: 0.05,
        ..Default::default()
    }
}

#[tokio::test]
async fn master_playlist_selects_highest_bandwidth_and_concatenates() {
    let (server, bodies) = hls_server(ServerOptions::default());
    let dir = tempfile::tempdir().unwrap();
    let downloader = HlsDownloader::new(options_for(dir.path())).unwrap();
    let control = TaskControl::new();
    let (reporter, _) = recording_reporter("t1");

    let outcome = downloader
        .run(&server.url("/master.m3u8"), &control, &reporter)
        .await
        .unwrap();

    let expected: Vec<u8> = bodies.concat();
    assert_eq!(outcome.file_size, expected.len() as u64);
    let merged = std::fs::read(dir.path().join("master.ts")).unwrap();
    assert_eq!(merged, expected);

    // The highest-bandwidth variant was fetched; the low one was not.
    assert_eq!(server.gets_for("/high.m3u8").len(), 1);
    assert!(server.gets_for("/low.m3u8").is_empty());

    // Scratch segments are deleted after the merge.
    let names: Vec<String> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["master.ts".to_string()]);
}

#[tokio::test]
async fn resume_skips_existing_scratch_segments() {
    let (server, bodies) = hls_server(ServerOptions::default());
    let dir = tempfile::tempdir().unwrap();

    // Segments 0 and 1 already on disk from an interrupted run.
    std::fs::write(dir.path().join("master_segment_000000.ts"), &bodies[0]).unwrap();
    std::fs::write(dir.path().join("master_segment_000001.ts"), &bodies[1]).unwrap();

    let downloader = HlsDownloader::new(options_for(dir.path())).unwrap();
    let control = TaskControl::new();
    let (reporter, _) = recording_reporter("t1");

    downloader
        .run(&server.url("/master.m3u8"), &control, &reporter)
        .await
        .unwrap();

    assert!(server.gets_for("/seg0.ts").is_empty());
    assert!(server.gets_for("/seg1.ts").is_empty());
    assert_eq!(server.gets_for("/seg2.ts").len(), 1);

    let merged = std::fs::read(dir.path().join("master.ts")).unwrap();
    assert_eq!(merged, bodies.concat());
}

#[tokio::test]
async fn merge_can_be_disabled() {
    let (server, bodies) = hls_server(ServerOptions::default());
    let dir = tempfile::tempdir().unwrap();
    let mut options = options_for(dir.path());
    options.m3u8_merge_segments = false;
    let downloader = HlsDownloader::new(options).unwrap();
    let control = TaskControl::new();
    let (reporter, _) = recording_reporter("t1");

    downloader
        .run(&server.url("/master.m3u8"), &control, &reporter)
        .await
        .unwrap();

    assert!(!dir.path().join("master.ts").exists());
    for i in 0..5 {
        let scratch = dir.path().join(format!("master_segment_{i:06}.ts"));
        assert_eq!(std::fs::read(&scratch).unwrap(), bodies[i]);
    }
}

#[tokio::test]
async fn parallel_segment_threads_preserve_playlist_order() {
    let (server, bodies) = hls_server(ServerOptions {
        throttle: Some(Throttle {
            chunk_size: 16 * 1024,
            delay: Duration::from_millis(5),
        }),
        ..Default::default()
    });
    let dir = tempfile::tempdir().unwrap();
    let mut options = options_for(dir.path());
    options.m3u8_segment_threads = 4;
    let downloader = HlsDownloader::new(options).unwrap();
    let control = TaskControl::new();
    let (reporter, _) = recording_reporter("t1");

    downloader
        .run(&server.url("/master.m3u8"), &control, &reporter)
        .await
        .unwrap();

    // Regardless of completion order, the merge follows playlist order.
    let merged = std::fs::read(dir.path().join("master.ts")).unwrap();
    assert_eq!(merged, bodies.concat());
}

#[tokio::test]
async fn empty_media_playlist_is_rejected() {
    let server = TestServer::serve(vec![(
        "/empty.m3u8".to_string(),
        Resource::playlist("#EXTM3U\n#EXT-X-TARGETDURATION:4\n#EXT-X-ENDLIST\n"),
    )]);
    let dir = tempfile::tempdir().unwrap();
    let downloader = HlsDownloader::new(options_for(dir.path())).unwrap();
    let control = TaskControl::new();
    let (reporter, _) = recording_reporter("t1");

    let result = downloader
        .run(&server.url("/empty.m3u8"), &control, &reporter)
        .await;
    assert!(matches!(result, Err(DownloadError::PlaylistEmpty { .. })));
}

#[tokio::test]
async fn failing_segment_preserves_scratch_and_reports_error() {
    // seg2 is missing from the server: the download must fail, but earlier
    // segments stay on disk for a later resume.
    let bodies: Vec<Vec<u8>> = (0..3).map(|i| segment_body(i, 30_000)).collect();
    let playlist = "#EXTM3U\n#EXT-X-TARGETDURATION:4\n\
#EXTINF:4.0,\nseg0.ts\n#EXTINF:4.0,\nseg1.ts\n#EXTINF:4.0,\nseg2.ts\n#EXT-X-ENDLIST\n";
    let server = TestServer::serve(vec![
        ("/index.m3u8".to_string(), Resource::playlist(playlist)),
        ("/seg0.ts".to_string(), Resource::new(bodies[0].clone())),
        ("/seg1.ts".to_string(), Resource::new(bodies[1].clone())),
    ]);

    let dir = tempfile::tempdir().unwrap();
    let downloader = HlsDownloader::new(options_for(dir.path())).unwrap();
    let control = TaskControl::new();
    let (reporter, _) = recording_reporter("t1");

    let result = downloader
        .run(&server.url("/index.m3u8"), &control, &reporter)
        .await;
    assert!(result.is_err());
    assert!(!dir.path().join("index.ts").exists());
    assert!(dir.path().join("index_segment_000000.ts").exists());
}
