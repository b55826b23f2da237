//! In-process stand-ins for the remote side of a transfer
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use omnistore_scp::{ChannelCloser, CommandChannel, CommandRunner, NoopCloser};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::task::JoinHandle;

const PIPE_SIZE: usize = 64 * 1024;

/// Modification time the fake source reports for everything
pub const FAKE_MTIME: u64 = 1_700_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Dir,
    File(Vec<u8>),
}

pub type Tree = BTreeMap<String, Node>;

/// Remote host with an in-memory filesystem speaking both ends of the protocol
#[derive(Clone, Default)]
pub struct FakeRemote {
    tree: Arc<Mutex<Tree>>,
    commands: Arc<Mutex<Vec<String>>>,
    read_only: bool,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every sink command is refused during the handshake
    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    pub fn insert_dir(&self, path: &str) {
        let mut tree = self.tree.lock().unwrap();
        let mut current = String::new();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            current = join(&current, segment);
            tree.insert(current.clone(), Node::Dir);
        }
    }

    pub fn insert_file(&self, path: &str, content: &[u8]) {
        if let Some((parent, _)) = path.rsplit_once('/') {
            self.insert_dir(parent);
        }
        self.tree
            .lock()
            .unwrap()
            .insert(path.to_string(), Node::File(content.to_vec()));
    }

    pub fn tree(&self) -> Tree {
        self.tree.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandRunner for FakeRemote {
    async fn start(&self, command: &str) -> io::Result<CommandChannel> {
        self.commands.lock().unwrap().push(command.to_string());

        let args: Vec<&str> = command.split_whitespace().collect();
        let target = normalize(args.last().copied().unwrap_or("."));
        let recursive = args.contains(&"-r");

        let (client_in, remote_out) = tokio::io::duplex(PIPE_SIZE);
        let (client_out, remote_in) = tokio::io::duplex(PIPE_SIZE);
        let tree = Arc::clone(&self.tree);

        let task = if args.contains(&"-t") {
            tokio::spawn(run_sink(tree, target, self.read_only, remote_in, remote_out))
        } else if args.contains(&"-f") {
            tokio::spawn(run_source(tree, target, recursive, remote_in, remote_out))
        } else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("unexpected command {command:?}"),
            ));
        };

        Ok(CommandChannel::new(
            client_in,
            client_out,
            TaskCloser(Some(task)),
        ))
    }
}

/// Waits for the fake remote to wind down
struct TaskCloser(Option<JoinHandle<io::Result<()>>>);

#[async_trait]
impl ChannelCloser for TaskCloser {
    async fn close(&mut self) -> io::Result<()> {
        let Some(task) = self.0.take() else {
            return Ok(());
        };
        match tokio::time::timeout(Duration::from_secs(5), task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(io::Error::other(join)),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "fake remote did not finish",
            )),
        }
    }
}

async fn run_sink(
    tree: Arc<Mutex<Tree>>,
    target: String,
    read_only: bool,
    input: DuplexStream,
    mut output: DuplexStream,
) -> io::Result<()> {
    let mut input = BufReader::new(input);
    if read_only {
        output
            .write_all(format!("\x02scp: /{target}: Read-only file system\n").as_bytes())
            .await?;
        return Ok(());
    }
    output.write_all(&[0]).await?;

    let mut cursor: Vec<String> = Vec::new();
    loop {
        let mut line = String::new();
        if input.read_line(&mut line).await? == 0 {
            return Ok(());
        }
        let body = line.trim_end_matches('\n');

        match body.as_bytes().first() {
            Some(b'T') => {}
            Some(b'D') => {
                let (_, name) = parse_create(body)?;
                cursor.push(name);
                let path = join(&target, &cursor.join("/"));
                tree.lock().unwrap().insert(path, Node::Dir);
            }
            Some(b'E') => {
                cursor.pop();
            }
            Some(b'C') => {
                let (size, name) = parse_create(body)?;
                output.write_all(&[0]).await?;

                let mut content = vec![0; size + 1];
                input.read_exact(&mut content).await?;
                if content.pop() != Some(0) {
                    return Err(invalid("missing status byte after content"));
                }
                let path = join(&join(&target, &cursor.join("/")), &name);
                tree.lock().unwrap().insert(path, Node::File(content));
            }
            _ => {
                output.write_all(b"\x02scp: protocol error\n").await?;
                return Ok(());
            }
        }
        output.write_all(&[0]).await?;
    }
}

async fn run_source(
    tree: Arc<Mutex<Tree>>,
    target: String,
    recursive: bool,
    input: DuplexStream,
    mut output: DuplexStream,
) -> io::Result<()> {
    let mut input = BufReader::new(input);
    let snapshot = tree.lock().unwrap().clone();

    let mut frames = Vec::new();
    match lookup(&snapshot, &target) {
        None => frames.push(
            format!("\x02scp: /{target}: No such file or directory\n").into_bytes(),
        ),
        Some(Node::File(content)) => push_file(&mut frames, last_segment(&target), &content),
        Some(Node::Dir) if !recursive => {
            frames.push(format!("\x01scp: /{target}: not a regular file\n").into_bytes());
        }
        Some(Node::Dir) => push_dir(&mut frames, &snapshot, &target),
    }

    for frame in frames {
        if !wait_ack(&mut input).await? {
            return Ok(());
        }
        output.write_all(&frame).await?;
    }
    // final acknowledgment of the last frame
    wait_ack(&mut input).await?;
    Ok(())
}

fn push_file(frames: &mut Vec<Vec<u8>>, name: &str, content: &[u8]) {
    frames.push(format!("T{FAKE_MTIME} 0 {FAKE_MTIME} 0\n").into_bytes());
    frames.push(format!("C0644 {} {name}\n", content.len()).into_bytes());
    let mut body = content.to_vec();
    body.push(0);
    frames.push(body);
}

fn push_dir(frames: &mut Vec<Vec<u8>>, tree: &Tree, path: &str) {
    let name = if path.is_empty() { "." } else { last_segment(path) };
    frames.push(format!("T{FAKE_MTIME} 0 {FAKE_MTIME} 0\n").into_bytes());
    frames.push(format!("D0755 0 {name}\n").into_bytes());
    for (child, node) in tree.iter().filter(|(key, _)| parent_of(key) == path) {
        match node {
            Node::Dir => push_dir(frames, tree, child),
            Node::File(content) => push_file(frames, last_segment(child), content),
        }
    }
    frames.push(b"E\n".to_vec());
}

/// Replays fixed frames, one per acknowledgment, then optionally stalls
pub struct ScriptedSource {
    frames: Vec<Vec<u8>>,
    linger: Duration,
}

impl ScriptedSource {
    pub fn new<I, F>(frames: I) -> Self
    where
        I: IntoIterator<Item = F>,
        F: Into<Vec<u8>>,
    {
        Self {
            frames: frames.into_iter().map(Into::into).collect(),
            linger: Duration::ZERO,
        }
    }

    /// Keep the stream open this long after the last frame
    pub fn linger(mut self, linger: Duration) -> Self {
        self.linger = linger;
        self
    }
}

#[async_trait]
impl CommandRunner for ScriptedSource {
    async fn start(&self, _command: &str) -> io::Result<CommandChannel> {
        let (client_in, mut remote_out) = tokio::io::duplex(PIPE_SIZE);
        let (client_out, remote_in) = tokio::io::duplex(PIPE_SIZE);
        let frames = self.frames.clone();
        let linger = self.linger;

        tokio::spawn(async move {
            let mut input = BufReader::new(remote_in);
            for frame in frames {
                if !wait_ack(&mut input).await.unwrap_or(false) {
                    return;
                }
                if remote_out.write_all(&frame).await.is_err() {
                    return;
                }
            }
            tokio::time::sleep(linger).await;
        });

        Ok(CommandChannel::new(client_in, client_out, NoopCloser))
    }
}

/// True when the peer sent OK; false on EOF or a non-OK byte
async fn wait_ack(input: &mut BufReader<DuplexStream>) -> io::Result<bool> {
    let mut byte = [0u8; 1];
    match input.read_exact(&mut byte).await {
        Ok(_) => Ok(byte[0] == 0),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn parse_create(line: &str) -> io::Result<(usize, String)> {
    let mut fields = line[1..].splitn(3, ' ');
    let _mode = fields.next().ok_or_else(|| invalid(line))?;
    let size = fields
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid(line))?;
    let name = fields.next().ok_or_else(|| invalid(line))?;
    Ok((size, name.to_string()))
}

fn lookup(tree: &Tree, path: &str) -> Option<Node> {
    if path.is_empty() {
        return Some(Node::Dir);
    }
    tree.get(path).cloned()
}

fn normalize(path: &str) -> String {
    path.trim_matches('\'')
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

fn parent_of(path: &str) -> &str {
    path.rsplit_once('/').map_or("", |(parent, _)| parent)
}

fn last_segment(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn join(parent: &str, name: &str) -> String {
    match (parent.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (_, true) => parent.to_string(),
        _ => format!("{parent}/{name}"),
    }
}

fn invalid(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, what.to_string())
}
