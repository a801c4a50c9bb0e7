//! Integration tests: the collector service with transcoding, driven by
//! raw producers over localhost.

use std::time::Duration;

use camstream_core::{CamError, SyntheticDevice};
use camstream_server::config::ServerConfig;
use camstream_server::service::CollectorService;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

// ── Helpers ──────────────────────────────────────────────────────

fn local_config(dir: &std::path::Path) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.network.bind_address = "127.0.0.1".into();
    config.network.port = 0;
    config.storage.output_dir = dir.to_path_buf();
    config
}

/// Send a descriptor followed by `frames`, then close cleanly.
async fn send(port: u16, descriptor: &str, frames: &[Vec<u8>]) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(descriptor.as_bytes()).await.unwrap();
    for frame in frames {
        stream.write_all(frame).await.unwrap();
    }
    stream.shutdown().await.unwrap();
}

fn frames(n: u32) -> Vec<Vec<u8>> {
    (0..n).map(|i| SyntheticDevice::frame_bytes(i, 64)).collect()
}

// ── Tests ────────────────────────────────────────────────────────

#[tokio::test]
async fn stores_session_without_transcoding() {
    let dir = tempfile::tempdir().unwrap();
    let service = CollectorService::new(local_config(dir.path()));
    let collector = service.bind().await.unwrap();
    let port = collector.local_addr().unwrap().port();

    let sent = frames(4);
    let producer = tokio::spawn({
        let sent = sent.clone();
        async move { send(port, "plain_64_64_4.mjpeg", &sent).await }
    });
    let report = collector.accept_one().await.unwrap();
    producer.await.unwrap();

    assert_eq!(report.frames, 4);
    assert!(report.transcoded.is_none());
    assert_eq!(std::fs::read(&report.path).unwrap(), sent.concat());
}

#[cfg(unix)]
#[tokio::test]
async fn transcoder_runs_after_session_closes() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = local_config(dir.path());
    config.transcode.enabled = true;
    config.transcode.program = "cp".into();
    config.transcode.args = vec!["{input}".into(), "{output}".into()];
    config.transcode.extension = "copy".into();

    let collector = CollectorService::new(config).bind().await.unwrap();
    let port = collector.local_addr().unwrap().port();

    let sent = frames(2);
    let producer = tokio::spawn({
        let sent = sent.clone();
        async move { send(port, "conv_64_64_2.mjpeg", &sent).await }
    });
    let report = collector.accept_one().await.unwrap();
    producer.await.unwrap();

    let artifact = report.transcoded.expect("transcoded artifact");
    assert_eq!(artifact, dir.path().join("conv_64_64_2.copy"));
    assert_eq!(std::fs::read(artifact).unwrap(), sent.concat());
}

#[tokio::test]
async fn failed_transcode_is_reported_and_file_kept() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = local_config(dir.path());
    config.transcode.enabled = true;
    config.transcode.program = "camstream-missing-transcoder".into();

    let collector = CollectorService::new(config).bind().await.unwrap();
    let port = collector.local_addr().unwrap().port();

    let producer = tokio::spawn(async move { send(port, "kept.mjpeg", &frames(1)).await });
    let err = collector.accept_one().await.unwrap_err();
    producer.await.unwrap();

    assert!(matches!(err, CamError::TranscodeInvocation(_)));
    assert!(dir.path().join("kept.mjpeg").exists());
}

#[tokio::test]
async fn service_stops_on_cancel() {
    let dir = tempfile::tempdir().unwrap();
    let service = CollectorService::new(local_config(dir.path()));
    let stop = service.stop_handle();

    let running = tokio::spawn(async move { service.run().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    stop.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("service did not stop");
    result.unwrap().unwrap();
}

#[tokio::test]
async fn bad_bind_address_fails() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = local_config(dir.path());
    config.network.bind_address = "nowhere".into();
    assert!(CollectorService::new(config).run().await.is_err());
}
