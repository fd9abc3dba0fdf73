use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut, KeyIvInit};
use destream::{
    fetch::ApiClient,
    hls::IndexChooser,
    merge::{MuxRequest, Muxer},
    pipeline::{Pipeline, PipelineOptions, VideoOutcome, VideoRequest},
    rpc::{segment_file_name, DownloadReport, Orchestrator, SegmentDownloader},
    session::Session,
    DestreamError, DestreamResult,
};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::rpc::fake_aria2::{Behavior, FakeAria2};

const KEY: [u8; 16] = *b"0123456789abcdef";
const IV: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15];

const MASTER: &str = r#"#EXTM3U
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID="audio",NAME="English",LANGUAGE="en",URI="audio.m3u8"
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360,AUDIO="audio"
low.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2000000,RESOLUTION=1280x720,AUDIO="audio"
high.m3u8
"#;

fn media_playlist(key_line: Option<&str>, segments: &[&str]) -> String {
    let mut playlist = String::from("#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:10\n");
    if let Some(key_line) = key_line {
        playlist.push_str(key_line);
        playlist.push('\n');
    }
    for segment in segments {
        playlist.push_str(&format!("#EXTINF:10.0,\n{segment}\n"));
    }
    playlist.push_str("#EXT-X-ENDLIST\n");
    playlist
}

fn encrypt(plain: &[u8]) -> Vec<u8> {
    cbc::Encryptor::<aes::Aes128>::new(&KEY.into(), &IV.into()).encrypt_padded_vec_mut::<Pkcs7>(plain)
}

struct Fixture {
    server: MockServer,
    contents: HashMap<String, Vec<u8>>,
    video: Vec<u8>,
    audio: Vec<u8>,
}

impl Fixture {
    async fn start(video_key_line: &str) -> Self {
        let server = MockServer::start().await;
        let video: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
        let audio = b"plain audio track".repeat(20);

        let mut contents = HashMap::new();
        let cipher = encrypt(&video);
        let (v1, rest) = cipher.split_at(10);
        let (v2, v3) = rest.split_at(1000);
        for (name, chunk) in [("v1.ts", v1), ("v2.ts", v2), ("v3.ts", v3)] {
            contents.insert(format!("{}/{name}", server.uri()), chunk.to_vec());
        }
        let (a1, a2) = audio.split_at(7);
        contents.insert(format!("{}/a1.ts", server.uri()), a1.to_vec());
        contents.insert(format!("{}/a2.ts", server.uri()), a2.to_vec());

        let responses = [
            ("/master.m3u8", MASTER.to_string()),
            (
                "/high.m3u8",
                media_playlist(Some(video_key_line), &["v1.ts", "v2.ts", "v3.ts"]),
            ),
            ("/audio.m3u8", media_playlist(None, &["a1.ts", "a2.ts"])),
        ];
        for (route, body) in responses {
            Mock::given(method("GET"))
                .and(path(route))
                .respond_with(ResponseTemplate::new(200).set_body_string(body))
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/low.m3u8"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/key"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(KEY.to_vec()))
            .mount(&server)
            .await;

        Self {
            server,
            contents,
            video,
            audio,
        }
    }

    async fn encrypted() -> Self {
        Self::start(r#"#EXT-X-KEY:METHOD=AES-128,URI="key",IV=0x000102030405060708090a0b0c0d0e0f"#)
            .await
    }

    fn api(&self) -> anyhow::Result<ApiClient> {
        let session = Session::new("token", format!("{}/", self.server.uri()));
        Ok(ApiClient::new(session)?.with_retry_delay(Duration::from_millis(1)))
    }

    fn request(&self, output: &Path) -> VideoRequest {
        VideoRequest {
            title: "Lecture".to_string(),
            playback_url: format!("{}/master.m3u8", self.server.uri()),
            output_path: output.to_path_buf(),
            captions_url: None,
        }
    }
}

#[derive(Clone, Default)]
struct FakeMuxer {
    calls: Arc<Mutex<Vec<(PathBuf, Option<PathBuf>)>>>,
    fail: bool,
}

impl Muxer for FakeMuxer {
    async fn mux(&self, request: MuxRequest<'_>) -> DestreamResult<()> {
        self.calls.lock().unwrap().push((
            request.video.to_path_buf(),
            request.audio.map(Path::to_path_buf),
        ));
        if self.fail {
            std::fs::write(request.output, b"partial")?;
            return Err(DestreamError::MuxerFailed { code: Some(1) });
        }

        let mut output = std::fs::read(request.video)?;
        if let Some(audio) = request.audio {
            output.extend(std::fs::read(audio)?);
        }
        std::fs::write(request.output, output)?;
        Ok(())
    }
}

#[derive(Default)]
struct FakeDownloader {
    contents: HashMap<String, Vec<u8>>,
    fail_first_batch: bool,
    stall: bool,
    batches: usize,
    aborted: Arc<AtomicBool>,
}

impl SegmentDownloader for FakeDownloader {
    async fn download_all(
        &mut self,
        urls: Vec<String>,
        output_dir: &Path,
    ) -> DestreamResult<DownloadReport> {
        if self.stall {
            std::future::pending::<()>().await;
        }
        self.batches += 1;
        tokio::fs::create_dir_all(output_dir).await?;

        let mut report = DownloadReport {
            total: urls.len(),
            ..Default::default()
        };
        for (index, url) in urls.into_iter().enumerate() {
            if self.fail_first_batch && self.batches == 1 && index == 0 {
                report.abandoned.push(url);
                continue;
            }
            let path = output_dir.join(segment_file_name(index + 1));
            let body = self.contents.get(&url).cloned().unwrap_or_default();
            tokio::fs::write(&path, body).await?;
            report.files.push(path);
        }
        Ok(report)
    }

    async fn abort(&mut self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

fn options(root: &Path) -> PipelineOptions {
    crate::init_test_tracing();
    PipelineOptions {
        tmp_root: root.join("work"),
        ..Default::default()
    }
}

const CHOOSER: IndexChooser = IndexChooser { video: 1, audio: 0 };

#[tokio::test]
async fn test_pipeline_through_aria2() -> anyhow::Result<()> {
    let fixture = Fixture::encrypted().await;
    let aria2 = FakeAria2::start(Behavior {
        contents: fixture.contents.clone(),
        ..Default::default()
    })
    .await?;
    let orchestrator = Orchestrator::builder(aria2.endpoint.clone()).connect().await?;

    let dir = tempfile::tempdir()?;
    let output = dir.path().join("out").join("Lecture.mkv");
    let muxer = FakeMuxer::default();
    let mut pipeline = Pipeline::new(
        fixture.api()?,
        CHOOSER,
        orchestrator,
        muxer.clone(),
        options(dir.path()),
    );

    let summary = pipeline
        .run_until(vec![fixture.request(&output)], std::future::pending())
        .await?;
    assert_eq!(summary.failed(), 0);
    assert!(matches!(summary.outcomes[0].1, VideoOutcome::Done(_)));

    let expected = [fixture.video.clone(), fixture.audio.clone()].concat();
    assert_eq!(std::fs::read(&output)?, expected);
    assert!(!dir.path().join("work").join("Lecture").exists());

    let multicalls: Vec<_> = aria2
        .requests()
        .into_iter()
        .filter(|request| request["method"] == "system.multicall")
        .collect();
    assert_eq!(multicalls.len(), 2);
    assert_eq!(multicalls[0]["params"][0].as_array().unwrap().len(), 3);
    assert_eq!(multicalls[1]["params"][0].as_array().unwrap().len(), 2);

    pipeline.into_downloader().shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn test_partial_download_skips_muxer() -> anyhow::Result<()> {
    let fixture = Fixture::encrypted().await;
    let downloader = FakeDownloader {
        contents: fixture.contents.clone(),
        fail_first_batch: true,
        ..Default::default()
    };
    let dir = tempfile::tempdir()?;
    let first = dir.path().join("first.mkv");
    let second = dir.path().join("second.mkv");
    let muxer = FakeMuxer::default();
    let mut pipeline = Pipeline::new(
        fixture.api()?,
        CHOOSER,
        downloader,
        muxer.clone(),
        options(dir.path()),
    );

    let summary = pipeline
        .run_until(
            vec![fixture.request(&first), fixture.request(&second)],
            std::future::pending(),
        )
        .await?;
    assert_eq!(summary.failed(), 1);
    assert!(matches!(
        summary.outcomes[0].1,
        VideoOutcome::Failed(DestreamError::PartialDownload { failed: 1, total: 3 })
    ));
    assert!(!first.exists());
    assert!(second.exists());
    assert_eq!(muxer.calls.lock().unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_malformed_key_line_skips_video() -> anyhow::Result<()> {
    let fixture = Fixture::start(r#"#EXT-X-KEY:METHOD=AES-128,URI="key""#).await;
    let downloader = FakeDownloader {
        contents: fixture.contents.clone(),
        ..Default::default()
    };
    let dir = tempfile::tempdir()?;
    let mut pipeline = Pipeline::new(
        fixture.api()?,
        CHOOSER,
        downloader,
        FakeMuxer::default(),
        options(dir.path()),
    );

    let summary = pipeline
        .run_until(
            vec![fixture.request(&dir.path().join("a.mkv"))],
            std::future::pending(),
        )
        .await?;
    assert!(matches!(
        summary.outcomes[0].1,
        VideoOutcome::Failed(DestreamError::NoEncryptionInfo)
    ));
    Ok(())
}

#[tokio::test]
async fn test_no_renditions_aborts_run() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/master.m3u8"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=64000,CODECS=\"mp4a.40.2\"\naudio.m3u8\n",
        ))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir()?;
    let api = ApiClient::new(Session::new("token", format!("{}/", server.uri())))?;
    let muxer = FakeMuxer::default();
    let mut pipeline = Pipeline::new(
        api,
        CHOOSER,
        FakeDownloader::default(),
        muxer.clone(),
        options(dir.path()),
    );

    let video = |name: &str| VideoRequest {
        title: name.to_string(),
        playback_url: format!("{}/master.m3u8", server.uri()),
        output_path: dir.path().join(format!("{name}.mkv")),
        captions_url: None,
    };
    let result = pipeline
        .run_until(vec![video("a"), video("b")], std::future::pending())
        .await;
    assert!(matches!(result, Err(DestreamError::NoRenditions)));
    assert!(muxer.calls.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_muxer_failure_removes_output() -> anyhow::Result<()> {
    let fixture = Fixture::encrypted().await;
    let downloader = FakeDownloader {
        contents: fixture.contents.clone(),
        ..Default::default()
    };
    let dir = tempfile::tempdir()?;
    let output = dir.path().join("a.mkv");
    let mut pipeline = Pipeline::new(
        fixture.api()?,
        CHOOSER,
        downloader,
        FakeMuxer {
            fail: true,
            ..Default::default()
        },
        options(dir.path()),
    );

    let summary = pipeline
        .run_until(vec![fixture.request(&output)], std::future::pending())
        .await?;
    assert!(matches!(
        summary.outcomes[0].1,
        VideoOutcome::Failed(DestreamError::MuxerFailed { .. })
    ));
    assert!(!output.exists());
    Ok(())
}

#[tokio::test]
async fn test_skip_existing_output() -> anyhow::Result<()> {
    let fixture = Fixture::encrypted().await;
    let dir = tempfile::tempdir()?;
    let output = dir.path().join("a.mkv");
    std::fs::write(&output, b"old")?;

    let muxer = FakeMuxer::default();
    let mut pipeline = Pipeline::new(
        fixture.api()?,
        CHOOSER,
        FakeDownloader::default(),
        muxer.clone(),
        PipelineOptions {
            skip_existing: true,
            ..options(dir.path())
        },
    );

    let summary = pipeline
        .run_until(vec![fixture.request(&output)], std::future::pending())
        .await?;
    assert!(matches!(summary.outcomes[0].1, VideoOutcome::Skipped));
    assert_eq!(std::fs::read(&output)?, b"old");
    assert!(muxer.calls.lock().unwrap().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_interrupt_aborts_downloader() -> anyhow::Result<()> {
    let fixture = Fixture::encrypted().await;
    let aborted = Arc::new(AtomicBool::new(false));
    let downloader = FakeDownloader {
        stall: true,
        aborted: aborted.clone(),
        ..Default::default()
    };
    let dir = tempfile::tempdir()?;
    let mut pipeline = Pipeline::new(
        fixture.api()?,
        CHOOSER,
        downloader,
        FakeMuxer::default(),
        options(dir.path()),
    );

    let result = pipeline
        .run_until(
            vec![fixture.request(&dir.path().join("a.mkv"))],
            tokio::time::sleep(Duration::from_millis(200)),
        )
        .await;
    assert!(matches!(result, Err(DestreamError::Interrupted)));
    assert!(aborted.load(Ordering::SeqCst));
    assert!(!dir.path().join("work").join("a").exists());
    Ok(())
}
