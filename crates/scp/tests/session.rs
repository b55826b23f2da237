mod common;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use common::{FakeRemote, Node, ScriptedSource, FAKE_MTIME};
use omnistore_scp::{BoxError, Flow, RemoteEntry, ScpConfig, ScpError, Session, Visitor};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Seen {
    parent: String,
    name: String,
    content: Option<Vec<u8>>,
}

#[derive(Default)]
struct Collect {
    seen: Vec<Seen>,
    modified: Vec<SystemTime>,
    stop_after: Option<usize>,
    fail_on: Option<&'static str>,
}

#[async_trait]
impl Visitor for Collect {
    async fn visit(
        &mut self,
        parent: &str,
        entry: &RemoteEntry,
        content: &[u8],
    ) -> Result<Flow, BoxError> {
        if self.fail_on == Some(entry.name.as_str()) {
            return Err(format!("refusing {}", entry.name).into());
        }
        self.seen.push(Seen {
            parent: parent.to_string(),
            name: entry.name.clone(),
            content: (!entry.is_dir()).then(|| content.to_vec()),
        });
        self.modified.push(entry.modified);
        if self.stop_after == Some(self.seen.len()) {
            Ok(Flow::Stop)
        } else {
            Ok(Flow::Continue)
        }
    }
}

fn seen(parent: &str, name: &str, content: Option<&[u8]>) -> Seen {
    Seen {
        parent: parent.to_string(),
        name: name.to_string(),
        content: content.map(<[u8]>::to_vec),
    }
}

fn quick() -> ScpConfig {
    ScpConfig::default().with_timeout(Duration::from_secs(5))
}

#[tokio::test]
async fn test_upload_then_download_round_trip() {
    let remote = FakeRemote::new();
    remote.insert_dir("srv");
    let config = quick();

    let mut uploader = Session::upload(&remote, &config, "/srv", true).await.unwrap();
    let mut hi: &[u8] = b"hi";
    let mut yo: &[u8] = b"yo";
    uploader.push("", &RemoteEntry::dir("a"), None).await.unwrap();
    uploader
        .push("a", &RemoteEntry::file("x.txt", 2), Some(&mut hi))
        .await
        .unwrap();
    uploader.push("a", &RemoteEntry::dir("b"), None).await.unwrap();
    uploader
        .push("a/b", &RemoteEntry::file("y.txt", 2), Some(&mut yo))
        .await
        .unwrap();
    uploader.finish().await.unwrap();

    let tree = remote.tree();
    assert_eq!(tree.get("srv/a"), Some(&Node::Dir));
    assert_eq!(tree.get("srv/a/x.txt"), Some(&Node::File(b"hi".to_vec())));
    assert_eq!(tree.get("srv/a/b/y.txt"), Some(&Node::File(b"yo".to_vec())));

    let mut visitor = Collect::default();
    Session::download(&remote, &config, "/srv", true, &mut visitor)
        .await
        .unwrap();

    let mut got = visitor.seen.clone();
    got.sort();
    let mut want = vec![
        seen("", "a", None),
        seen("a", "x.txt", Some(b"hi")),
        seen("a", "b", None),
        seen("a/b", "y.txt", Some(b"yo")),
    ];
    want.sort();
    assert_eq!(got, want);

    let expected = UNIX_EPOCH + Duration::from_secs(FAKE_MTIME);
    assert!(visitor.modified.iter().all(|m| *m == expected));

    assert_eq!(
        remote.commands(),
        vec!["scp -t -p -r /srv".to_string(), "scp -f -p -r /srv".to_string()]
    );
}

#[tokio::test]
async fn test_directories_are_visited_before_their_children() {
    let remote = FakeRemote::new();
    remote.insert_file("srv/docs/readme.md", b"# hi");

    let mut visitor = Collect::default();
    Session::download(&remote, &quick(), "/srv", true, &mut visitor)
        .await
        .unwrap();

    assert_eq!(
        visitor.seen,
        vec![
            seen("", "docs", None),
            seen("docs", "readme.md", Some(b"# hi")),
        ]
    );
}

#[tokio::test]
async fn test_root_entry_reported_when_not_skipped() {
    let remote = FakeRemote::new();
    remote.insert_file("srv/a.txt", b"a");

    let config = quick().with_skip_root(false);
    let mut visitor = Collect::default();
    Session::download(&remote, &config, "/srv", true, &mut visitor)
        .await
        .unwrap();

    assert_eq!(
        visitor.seen,
        vec![seen("", "srv", None), seen("srv", "a.txt", Some(b"a"))]
    );
}

#[tokio::test]
async fn test_single_file_download() {
    let remote = FakeRemote::new();
    remote.insert_file("etc/motd", b"welcome\n");

    let mut visitor = Collect::default();
    Session::download(&remote, &quick(), "/etc/motd", false, &mut visitor)
        .await
        .unwrap();

    assert_eq!(visitor.seen, vec![seen("", "motd", Some(b"welcome\n"))]);
}

#[tokio::test]
async fn test_visitor_stop_ends_download_cleanly() {
    let remote = FakeRemote::new();
    remote.insert_file("srv/a.txt", b"a");
    remote.insert_file("srv/b.txt", b"b");

    let mut visitor = Collect {
        stop_after: Some(1),
        ..Collect::default()
    };
    Session::download(&remote, &quick(), "/srv", true, &mut visitor)
        .await
        .unwrap();

    assert_eq!(visitor.seen, vec![seen("", "a.txt", Some(b"a"))]);
}

#[tokio::test]
async fn test_visitor_error_aborts_download() {
    let remote = FakeRemote::new();
    remote.insert_file("srv/a.txt", b"a");
    remote.insert_file("srv/b.txt", b"b");

    let mut visitor = Collect {
        fail_on: Some("a.txt"),
        ..Collect::default()
    };
    let err = Session::download(&remote, &quick(), "/srv", true, &mut visitor)
        .await
        .unwrap_err();

    assert!(matches!(err, ScpError::Visit(_)), "{err}");
    assert_eq!(err.to_string(), "refusing a.txt");
    assert!(visitor.seen.is_empty());
}

#[tokio::test]
async fn test_truncated_content_is_framing_error() {
    let runner = ScriptedSource::new([&b"C0644 10 a.txt\n"[..], &b"abc"[..]]);

    let mut visitor = Collect::default();
    let err = Session::download(&runner, &quick(), "a.txt", false, &mut visitor)
        .await
        .unwrap_err();

    assert!(matches!(err, ScpError::Framing(_)), "{err}");
    assert!(visitor.seen.is_empty());
}

#[tokio::test]
async fn test_bad_trailing_status_is_framing_error() {
    let runner = ScriptedSource::new([&b"C0644 3 a.txt\n"[..], &b"abc\x07"[..]]);

    let mut visitor = Collect::default();
    let err = Session::download(&runner, &quick(), "a.txt", false, &mut visitor)
        .await
        .unwrap_err();

    assert!(matches!(err, ScpError::Framing(_)), "{err}");
    assert!(visitor.seen.is_empty());
}

#[tokio::test]
async fn test_remote_error_text_is_preserved() {
    let runner = ScriptedSource::new([
        &b"\x02no such file\n"[..],
        &b"C0644 1 never.txt\n"[..],
    ]);

    let mut visitor = Collect::default();
    let err = Session::download(&runner, &quick(), "missing", false, &mut visitor)
        .await
        .unwrap_err();

    assert!(matches!(err, ScpError::Remote(_)), "{err}");
    assert_eq!(err.to_string(), "no such file");
    assert!(visitor.seen.is_empty());
}

#[tokio::test]
async fn test_missing_remote_path() {
    let remote = FakeRemote::new();

    let mut visitor = Collect::default();
    let err = Session::download(&remote, &quick(), "/nope", true, &mut visitor)
        .await
        .unwrap_err();

    assert!(err.is_remote());
    assert!(err.to_string().contains("No such file or directory"), "{err}");
}

#[tokio::test]
async fn test_warning_is_fatal() {
    let remote = FakeRemote::new();
    remote.insert_dir("srv");

    let mut visitor = Collect::default();
    let err = Session::download(&remote, &quick(), "/srv", false, &mut visitor)
        .await
        .unwrap_err();

    assert!(matches!(err, ScpError::RemoteWarning(_)), "{err}");
    assert_eq!(err.to_string(), "scp: /srv: not a regular file");
}

#[tokio::test]
async fn test_unsupported_token() {
    let runner = ScriptedSource::new([&b"Xwhat\n"[..]]);

    let mut visitor = Collect::default();
    let err = Session::download(&runner, &quick(), "x", false, &mut visitor)
        .await
        .unwrap_err();

    assert!(matches!(err, ScpError::UnsupportedToken(b'X')), "{err}");
}

#[tokio::test]
async fn test_unrepresentable_timestamp_is_malformed() {
    let runner = ScriptedSource::new([
        &b"T18446744073709551615 0 18446744073709551615 0\n"[..],
        &b"C0644 1 a.txt\n"[..],
    ]);

    let mut visitor = Collect::default();
    let err = Session::download(&runner, &quick(), "a.txt", false, &mut visitor)
        .await
        .unwrap_err();

    assert!(matches!(err, ScpError::Malformed(_)), "{err}");
    assert!(visitor.seen.is_empty());
}

#[tokio::test]
async fn test_malformed_create_line() {
    let runner = ScriptedSource::new([&b"C0644 lots a.txt\n"[..]]);

    let mut visitor = Collect::default();
    let err = Session::download(&runner, &quick(), "a.txt", false, &mut visitor)
        .await
        .unwrap_err();

    assert!(matches!(err, ScpError::Malformed(_)), "{err}");
}

#[tokio::test]
async fn test_silent_remote_times_out() {
    let runner = ScriptedSource::new(Vec::<Vec<u8>>::new()).linger(Duration::from_secs(30));
    let config = ScpConfig::default().with_timeout(Duration::from_millis(100));

    let mut visitor = Collect::default();
    let started = std::time::Instant::now();
    let err = Session::download(&runner, &config, "x", false, &mut visitor)
        .await
        .unwrap_err();

    assert!(matches!(err, ScpError::Timeout(_)), "{err}");
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_push_reconciles_parent_paths() {
    let remote = FakeRemote::new();
    remote.insert_dir("dst");

    let mut uploader = Session::upload(&remote, &quick(), "/dst", true).await.unwrap();

    // parents that were never pushed are entered implicitly
    let mut z: &[u8] = b"z";
    uploader
        .push("x/y", &RemoteEntry::file("z.txt", 1), Some(&mut z))
        .await
        .unwrap();
    assert_eq!(uploader.cursor(), "x/y");

    let mut q: &[u8] = b"q";
    uploader
        .push("x/q", &RemoteEntry::file("q.txt", 1), Some(&mut q))
        .await
        .unwrap();
    assert_eq!(uploader.cursor(), "x/q");

    let mut top: &[u8] = b"top";
    uploader
        .push("", &RemoteEntry::file("top.txt", 3), Some(&mut top))
        .await
        .unwrap();
    assert_eq!(uploader.cursor(), "");
    uploader.finish().await.unwrap();

    let tree = remote.tree();
    assert_eq!(tree.get("dst/x/y/z.txt"), Some(&Node::File(b"z".to_vec())));
    assert_eq!(tree.get("dst/x/q/q.txt"), Some(&Node::File(b"q".to_vec())));
    assert_eq!(tree.get("dst/top.txt"), Some(&Node::File(b"top".to_vec())));
}

#[tokio::test]
async fn test_finish_unwinds_open_directories() {
    let remote = FakeRemote::new();
    remote.insert_dir("dst");

    let mut uploader = Session::upload(&remote, &quick(), "/dst", true).await.unwrap();
    uploader.push("", &RemoteEntry::dir("a"), None).await.unwrap();
    uploader.push("a", &RemoteEntry::dir("b"), None).await.unwrap();
    assert_eq!(uploader.cursor(), "a/b");
    uploader.finish().await.unwrap();

    let tree = remote.tree();
    assert_eq!(tree.get("dst/a/b"), Some(&Node::Dir));
}

#[tokio::test]
async fn test_upload_rejected_during_handshake() {
    let remote = FakeRemote::read_only();

    let err = match Session::upload(&remote, &quick(), "/dst", true).await {
        Ok(_) => panic!("read-only remote accepted an upload"),
        Err(e) => e,
    };
    assert!(matches!(err, ScpError::Remote(_)), "{err}");
    assert_eq!(err.to_string(), "scp: /dst: Read-only file system");
}

#[tokio::test]
async fn test_short_upload_content_is_framing_error() {
    let remote = FakeRemote::new();
    remote.insert_dir("dst");

    let mut uploader = Session::upload(&remote, &quick(), "/dst", true).await.unwrap();
    let mut short: &[u8] = b"abc";
    let err = uploader
        .push("", &RemoteEntry::file("a.txt", 5), Some(&mut short))
        .await
        .unwrap_err();

    assert!(matches!(err, ScpError::Framing(_)), "{err}");
    let _ = uploader.close().await;
    assert!(remote.tree().get("dst/a.txt").is_none());
}

#[tokio::test]
async fn test_upload_only_reads_announced_size() {
    let remote = FakeRemote::new();
    remote.insert_dir("dst");

    let mut uploader = Session::upload(&remote, &quick(), "/dst", true).await.unwrap();
    let mut long: &[u8] = b"abcdef";
    uploader
        .push("", &RemoteEntry::file("a.txt", 3), Some(&mut long))
        .await
        .unwrap();
    assert_eq!(long, b"def");
    uploader.finish().await.unwrap();

    assert_eq!(
        remote.tree().get("dst/a.txt"),
        Some(&Node::File(b"abc".to_vec()))
    );
}

#[tokio::test]
async fn test_invalid_entry_name_is_rejected() {
    let remote = FakeRemote::new();
    remote.insert_dir("dst");

    let mut uploader = Session::upload(&remote, &quick(), "/dst", true).await.unwrap();
    let err = uploader
        .push("", &RemoteEntry::dir("a/b"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ScpError::Malformed(_)), "{err}");

    let err = uploader
        .push("", &RemoteEntry::dir("fine"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, ScpError::Closed), "{err}");
    uploader.finish().await.unwrap();
    assert!(remote.tree().get("dst/fine").is_none());
}

#[tokio::test]
async fn test_push_after_failure_writes_nothing() {
    let remote = FakeRemote::new();
    remote.insert_dir("dst");

    let mut uploader = Session::upload(&remote, &quick(), "/dst", true).await.unwrap();
    uploader.push("", &RemoteEntry::dir("sub"), None).await.unwrap();

    let mut short: &[u8] = b"abc";
    let err = uploader
        .push("sub", &RemoteEntry::file("a.txt", 5), Some(&mut short))
        .await
        .unwrap_err();
    assert!(matches!(err, ScpError::Framing(_)), "{err}");

    let mut next: &[u8] = b"next";
    let err = uploader
        .push("", &RemoteEntry::file("b.txt", 4), Some(&mut next))
        .await
        .unwrap_err();
    assert!(matches!(err, ScpError::Closed), "{err}");
    assert_eq!(next, b"next");

    // the fake sink is still waiting on a.txt's content; it fails on hang-up
    let _ = uploader.finish().await;

    let tree = remote.tree();
    assert!(tree.get("dst/sub/a.txt").is_none());
    assert!(tree.get("dst/b.txt").is_none());
}

#[tokio::test]
async fn test_closer_from_another_task() {
    let remote = FakeRemote::new();
    remote.insert_dir("dst");

    let uploader = Session::upload(&remote, &quick(), "/dst", true).await.unwrap();
    let closer = uploader.closer();
    let handle = tokio::spawn(async move { closer.close() });

    assert!(handle.await.unwrap());
    assert!(uploader.closer().is_closed());
    let _ = uploader.close().await;
}
